pub mod process;
pub mod supervisor;

pub use process::{prepare, resolve_program, spawn, terminate, PreparedLaunch};
pub use supervisor::Supervisor;

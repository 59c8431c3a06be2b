//! Process launch descriptors and the types shared by the loader, the
//! supervisor, the daemon and the CLI.

pub mod error;
pub mod models;
pub mod profile;
pub mod status;

pub use error::{LaunchsetError, Result};
pub use models::*;
pub use profile::{avito_descriptor_set, InterpreterProfile};
pub use status::{ProcessInfo, ProcessStatus};

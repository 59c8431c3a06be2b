mod args;
mod grammar;
mod parser;

pub use args::parse_args;
pub use parser::{load_descriptor_set, parse_ecosystem, EcosystemFormat};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum LaunchsetError {
    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Duplicate process name: {0}")]
    DuplicateName(String),

    #[error("Executable not found: {0}")]
    ExecutableNotFound(String),

    #[error("Process not found: {0}")]
    ProcessNotFound(String),

    #[error("Execution error: {0}")]
    ExecutionError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, LaunchsetError>;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackgroundError {
    #[error("Invalid launch request: {0}")]
    InvalidLaunch(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("No tokio runtime is available to drive background tasks")]
    NoRuntime,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BackgroundError>;

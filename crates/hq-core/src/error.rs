use thiserror::Error;

#[derive(Debug, Error)]
pub enum HqError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HqError {
    /// Short error code string for operator-facing output.
    pub fn code(&self) -> &'static str {
        match self {
            HqError::Config(_) => "CONFIG_ERROR",
            HqError::Io(_) => "IO_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, HqError>;

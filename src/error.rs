use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AbTestError {
    #[error("Test not registered: {0}")]
    NotFound(String),

    #[error("Invalid status transition: {0}")]
    InvalidStatus(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Data source error: {0}")]
    DataSource(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Callback error: {0}")]
    Callback(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("JSON error: {0}")]
    Json(String),
}

pub type Result<T> = std::result::Result<T, AbTestError>;

impl AbTestError {
    /// Transient errors leave persisted state untouched and are retried on
    /// the next scheduled cycle.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AbTestError::DataSource(_) | AbTestError::Persistence(_) | AbTestError::Io(_)
        )
    }
}

impl From<std::io::Error> for AbTestError {
    fn from(e: std::io::Error) -> Self {
        AbTestError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for AbTestError {
    fn from(e: serde_json::Error) -> Self {
        AbTestError::Json(e.to_string())
    }
}

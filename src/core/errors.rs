use thiserror::Error;

#[derive(Debug, Error)]
pub enum RagError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("remote service failure: {0}")]
    Remote(String),
    #[error("backend failure: {0}")]
    Backend(String),
    #[error("operation cancelled")]
    Cancelled,
}

impl RagError {
    pub fn backend<E: std::fmt::Display>(err: E) -> Self {
        RagError::Backend(err.to_string())
    }

    pub fn remote<E: std::fmt::Display>(err: E) -> Self {
        RagError::Remote(err.to_string())
    }

    pub fn invalid<S: Into<String>>(msg: S) -> Self {
        RagError::InvalidInput(msg.into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RagError::Cancelled)
    }
}

impl From<std::io::Error> for RagError {
    fn from(err: std::io::Error) -> Self {
        RagError::backend(err)
    }
}

impl From<serde_json::Error> for RagError {
    fn from(err: serde_json::Error) -> Self {
        RagError::backend(err)
    }
}

impl From<sqlx::Error> for RagError {
    fn from(err: sqlx::Error) -> Self {
        RagError::backend(err)
    }
}

impl From<reqwest::Error> for RagError {
    fn from(err: reqwest::Error) -> Self {
        RagError::remote(err)
    }
}

use thiserror::Error as ThisError;

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("Invalid parameter: {0}")]
    Parameter(String),
    #[error("Sketches are not comparable: expected {expected}, found {found}")]
    MismatchedSketch { expected: String, found: String },
    #[error("Index build interrupted: {0}")]
    BuildInterrupted(#[source] Box<Error>),
    #[error("Result stream failed: {0}")]
    StreamFailure(#[source] Box<Error>),
    #[error("Not found")]
    NotFound,
    #[error("Table does not exist: {0}")]
    TableNotExist(String),
    #[error(transparent)]
    SerializationFailed(#[from] std::boxed::Box<bincode::ErrorKind>),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[cfg(feature = "sqlite")]
    #[error(transparent)]
    SqlFailure(#[from] rusqlite::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn param<S: Into<String>>(msg: S) -> Self {
        Error::Parameter(msg.into())
    }

    /// Whether this error is a construction time validation failure. These are never retried.
    pub fn is_parameter_error(&self) -> bool {
        matches!(self, Error::Parameter(_))
    }
}

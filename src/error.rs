use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("{0}")]
    Validation(String),

    #[error("job with id '{0}' already exists")]
    DuplicateId(String),

    #[error("{0}")]
    NotFound(String),

    #[error("storage error: {0}")]
    Store(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl QueueError {
    /// Process exit code reported by the CLI for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            QueueError::Validation(_) | QueueError::DuplicateId(_) | QueueError::NotFound(_) => 2,
            QueueError::Store(_) | QueueError::Io(_) => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, QueueError>;

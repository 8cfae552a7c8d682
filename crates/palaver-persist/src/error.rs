use thiserror::Error;

/// Store failures; lookups of missing rows are ordinary variants, not `Option`s
#[derive(Error, Debug)]
pub enum PersistError {
    #[error("Thread not found: {0}")]
    ThreadNotFound(String),

    #[error("Project not found: {0}")]
    ProjectNotFound(String),

    #[error("Could not reach the store: {0}")]
    Connection(String),

    #[cfg(feature = "mongodb")]
    #[error("MongoDB error: {0}")]
    Database(#[from] mongodb::error::Error),

    #[cfg(feature = "mongodb")]
    #[error("Could not encode document: {0}")]
    Encode(#[from] bson::ser::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, PersistError>;

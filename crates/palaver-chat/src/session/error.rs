use chrono::{DateTime, Utc};
use palaver_persist::PersistError;
use thiserror::Error;

/// Why a submit (or resend/edit) was refused or could not start
#[derive(Error, Debug)]
pub enum SubmitError {
    #[error("Message is empty")]
    EmptyInput,

    #[error("Please wait for the model to finish its response")]
    AlreadyStreaming,

    #[error("Daily message limit of {limit} reached; resets at {reset_at}")]
    QuotaExceeded { limit: u32, reset_at: DateTime<Utc> },

    #[error("Message not found: {0}")]
    MessageNotFound(String),

    #[error("Only user messages can be resent or edited: {0}")]
    NotEditable(String),

    #[error("Store error: {0}")]
    Store(#[from] PersistError),

    #[error("Provider error: {0}")]
    Provider(String),
}

impl SubmitError {
    /// Rejected locally, before any store or provider call
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            Self::EmptyInput
                | Self::AlreadyStreaming
                | Self::QuotaExceeded { .. }
                | Self::MessageNotFound(_)
                | Self::NotEditable(_)
        )
    }
}

//! Guest quota tracking and the streaming chat session core.
//!
//! [`QuotaTracker`] enforces the guest daily message cap. [`ChatSession`]
//! drives one thread's live exchange with a [`palaver_llm::ChatClient`],
//! persisting turns through a [`palaver_persist::ThreadStore`].

pub mod quota;
pub mod message;
pub mod reconcile;
pub mod session;

pub use quota::{GuestUsage, IncrementOutcome, QuotaTracker, DEFAULT_SWEEP_PROBABILITY};
pub use message::{InvocationState, Message, MessageStatus, Role, ToolInvocation};
pub use session::{
    ChatSession, ChatSessionBuilder, Identity, SessionConfig, SessionEvent, SessionSnapshot,
    SessionStatus, SubmitError,
};

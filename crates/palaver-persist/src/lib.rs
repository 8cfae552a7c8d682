pub mod models;
pub mod error;
pub mod store;
pub mod memory;
#[cfg(feature = "mongodb")]
pub mod mongo;

pub use models::{
    Project, StoredMessage, StoredMessageStatus, StoredRole, StoredToolCall, Thread, ThreadQuery,
    Visibility,
};
pub use error::{PersistError, Result};
pub use store::ThreadStore;
pub use memory::InMemoryStore;
#[cfg(feature = "mongodb")]
pub use mongo::MongoStore;

pub mod error;
pub mod memory;
pub mod queue;
pub mod tracker;

pub use error::StoreError;
pub use memory::{MemoryMessageQueue, MemoryRecipientTracker};
pub use queue::{MessageQueue, SentCounts};
pub use tracker::{RecipientTracker, envelope_slots, workspace_scope};

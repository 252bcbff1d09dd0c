pub mod error;
pub mod gateway;
pub mod receipt;

pub use error::{FailureClass, SendError, classify_failure_text};
pub use gateway::{DynGateway, Gateway, effective_headers};
pub use receipt::{SendFeatures, SendReceipt};

pub mod gateway;
pub mod types;

pub use gateway::MailgunGateway;
pub use types::{MailgunErrorResponse, MailgunSendResponse};

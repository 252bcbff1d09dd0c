pub mod auth;
pub mod gateway;

pub use auth::{ServiceAccountKey, TokenProvider};
pub use gateway::GmailGateway;

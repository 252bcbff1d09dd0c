pub mod gateway;
pub mod types;

pub use gateway::MandrillGateway;
pub use types::{
    MandrillApiError, MandrillMessage, MandrillRecipient, MandrillSendRequest, MandrillSendResult,
    MandrillWebhookEvent, MandrillWebhookMsg,
};

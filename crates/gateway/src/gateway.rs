use async_trait::async_trait;

use courier_core::{GatewayConfig, GatewayKind, Message};

use crate::error::SendError;
use crate::receipt::{SendFeatures, SendReceipt};

/// Strongly-typed delivery gateway trait with native `async fn`.
///
/// This trait is **not** object-safe because it uses native `async fn`
/// methods. For dynamic dispatch use [`DynGateway`] instead -- every
/// `Gateway` automatically implements `DynGateway` via a blanket
/// implementation.
pub trait Gateway: Send + Sync {
    /// Stable identifier, matching the configured `GatewayConfig::id`.
    fn id(&self) -> &str;

    /// Which provider family this gateway speaks.
    fn kind(&self) -> GatewayKind;

    /// The full configuration this gateway was built from (domain,
    /// priority, weight, rate limits, routing rules).
    fn config(&self) -> &GatewayConfig;

    /// Submit a message to the provider.
    fn send(
        &self,
        message: &Message,
    ) -> impl std::future::Future<Output = Result<SendReceipt, SendError>> + Send;

    /// Verify the provider is reachable and the credentials work.
    fn health_check(&self) -> impl std::future::Future<Output = Result<(), SendError>> + Send;

    /// Capabilities this provider supports on its wire format.
    fn features(&self) -> SendFeatures {
        SendFeatures::default()
    }
}

/// Object-safe gateway trait for use behind `Arc<dyn DynGateway>`.
///
/// Implement [`Gateway`] and rely on the blanket implementation instead of
/// implementing this directly.
#[async_trait]
pub trait DynGateway: Send + Sync {
    /// Stable identifier, matching the configured `GatewayConfig::id`.
    fn id(&self) -> &str;

    /// Which provider family this gateway speaks.
    fn kind(&self) -> GatewayKind;

    /// The full configuration this gateway was built from.
    fn config(&self) -> &GatewayConfig;

    /// Submit a message to the provider.
    async fn send(&self, message: &Message) -> Result<SendReceipt, SendError>;

    /// Verify the provider is reachable and the credentials work.
    async fn health_check(&self) -> Result<(), SendError>;

    /// Capabilities this provider supports on its wire format.
    fn features(&self) -> SendFeatures {
        SendFeatures::default()
    }
}

/// Blanket implementation bridging the static and dynamic dispatch worlds.
#[async_trait]
impl<T: Gateway + Sync> DynGateway for T {
    fn id(&self) -> &str {
        Gateway::id(self)
    }

    fn kind(&self) -> GatewayKind {
        Gateway::kind(self)
    }

    fn config(&self) -> &GatewayConfig {
        Gateway::config(self)
    }

    async fn send(&self, message: &Message) -> Result<SendReceipt, SendError> {
        Gateway::send(self, message).await
    }

    async fn health_check(&self) -> Result<(), SendError> {
        Gateway::health_check(self).await
    }

    fn features(&self) -> SendFeatures {
        Gateway::features(self)
    }
}

/// Apply a gateway's configured header rewrites on top of the message's
/// own headers. Rewrites win on collision.
#[must_use]
pub fn effective_headers(
    config: &GatewayConfig,
    message: &Message,
) -> std::collections::HashMap<String, String> {
    let mut headers = message.headers.clone();
    for (name, value) in &config.header_rewrites {
        headers.insert(name.clone(), value.clone());
    }
    headers
}

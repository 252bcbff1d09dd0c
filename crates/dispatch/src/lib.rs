pub mod circuit_breaker;
pub mod error;
pub mod events;
pub mod health;
pub mod manager;
pub mod metrics;
pub mod processor;
pub mod ratelimit;
pub mod router;
pub mod tracking;
pub mod variables;

pub use circuit_breaker::{
    BreakerConfig, BreakerSnapshot, CircuitBreaker, CircuitBreakerRegistry, CircuitState,
};
pub use error::DispatchError;
pub use events::{DeliveryEvent, DeliveryEvents, LogDeliveryEvents};
pub use health::{HealthMonitor, HealthSink, NoopHealthSink};
pub use manager::GatewayManager;
pub use metrics::{DispatchMetrics, MetricsSnapshot};
pub use processor::{MessageTransformer, ProcessorConfig, QueueProcessor, TransformError};
pub use ratelimit::RateLimiter;
pub use router::{RouteCandidate, Router};
pub use tracking::TrackingInjector;
pub use variables::{
    ResolveError, VariableEngine, VariableResolver, has_variables, validate_resolved,
    variable_names,
};

pub mod config;
pub mod migrations;
pub mod queue;
pub mod tracker;
pub mod workspaces;

pub use config::PostgresConfig;
pub use queue::PgMessageQueue;
pub use tracker::PgRecipientTracker;
pub use workspaces::ConfigRepository;

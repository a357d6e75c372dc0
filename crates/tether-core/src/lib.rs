pub mod agent;
pub mod bus;
pub mod commands;
pub mod cron;
pub mod gateway;
pub mod memory;
pub mod provider;
pub mod reply;
pub mod runner;
pub mod session;

// Re-export key types
pub use bus::{InboundMessage, MessageBus, OutboundMessage};
pub use gateway::Gateway;
pub use provider::{Provider, ProviderEvent, ProviderManager};
pub use reply::{ReplyBroker, ReplyOutcome};
pub use runner::{RunCoordinator, RunEvent, RunOutcome};
pub use session::{SessionKey, SessionRegistry};

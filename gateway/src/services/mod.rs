pub mod agent_api;
pub mod agent_ledger;
pub mod challenge;
pub mod checkpoint;
pub mod client_registry;
pub mod command;
pub mod container_runtime;
pub mod fleet_reconciler;
pub mod ipam;
pub mod ports;
pub mod proxy_config;
pub mod service_registry;
pub mod templates;
pub mod wireguard;

pub use agent_ledger::AgentLedger;
pub use challenge::{challenge_sweeper, ChallengeStore};
pub use client_registry::ClientRegistry;
pub use fleet_reconciler::fleet_reconciler;
pub use service_registry::ServiceRegistry;

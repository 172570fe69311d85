pub mod agent_config;
pub mod agent_state;
pub mod commands;
pub mod config_list;
pub mod config_mutation;
pub mod context;
pub mod error;
pub mod exec_approvals;
pub mod guided_setup;
pub mod heartbeat;
pub mod history;
pub mod pending_store;
pub mod permissions;
pub mod reconcile;
pub mod recovery;
pub mod session_keys;
pub mod sessions;
pub mod slug;

#[cfg(test)]
mod testing;

pub use agent_state::{AgentPatch, AgentState, AgentStatus, AgentStore};
pub use commands::{CommandSink, DispatchOutcome, NoopReason, StudioCommand, execute_commands};
pub use context::{StudioContext, StudioOptions};
pub use error::{StudioError, StudioResult};

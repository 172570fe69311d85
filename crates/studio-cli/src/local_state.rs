use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use crate::state_dir::StateDir;
use std::path::PathBuf;
use studio_core::AgentState;

/// What the CLI remembers between runs: each agent's transcript view and
/// the studio session id chosen by the last reconcile.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LocalState {
    pub studio_session_id: Option<String>,
    pub agents: Vec<AgentState>,
    #[serde(skip)]
    path: PathBuf,
}

impl LocalState {
    /// Load from disk, or start empty.
    pub fn load(state: &StateDir) -> Result<Self> {
        let path = state.local_state_path();
        let mut state: Self = if path.exists() {
            let data = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            serde_json::from_str(&data).with_context(|| format!("invalid {}", path.display()))?
        } else {
            Self::default()
        };
        state.path = path;
        Ok(state)
    }

    pub fn save(&self) -> Result<()> {
        let data = serde_json::to_string_pretty(self)?;
        std::fs::write(&self.path, data)
            .with_context(|| format!("failed to write {}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn state_dir(tmp: &TempDir) -> StateDir {
        StateDir::create(tmp.path()).unwrap()
    }

    #[test]
    fn missing_file_is_empty() {
        let tmp = TempDir::new().unwrap();
        let state = LocalState::load(&state_dir(&tmp)).unwrap();
        assert!(state.agents.is_empty());
        assert!(state.studio_session_id.is_none());
    }

    #[test]
    fn save_and_reload() {
        let tmp = TempDir::new().unwrap();
        let mut state = LocalState::load(&state_dir(&tmp)).unwrap();
        state.studio_session_id = Some("s-1".into());
        let mut agent = AgentState::new("a1", "agent:a1:main");
        agent.output_lines = vec!["> hi".into(), "hello".into()];
        agent.transcript_revision = 2;
        state.agents.push(agent.clone());
        state.save().unwrap();

        let reloaded = LocalState::load(&state_dir(&tmp)).unwrap();
        assert_eq!(reloaded.studio_session_id.as_deref(), Some("s-1"));
        assert_eq!(reloaded.agents, vec![agent]);
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(state_dir(&tmp).local_state_path(), "not json").unwrap();
        assert!(LocalState::load(&state_dir(&tmp)).is_err());
    }
}

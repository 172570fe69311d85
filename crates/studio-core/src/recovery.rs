//! Guided setups waiting to be applied to agents that already exist.

use crate::context::StudioContext;
use crate::error::StudioResult;
use crate::guided_setup::{AgentGuidedSetup, apply_guided_agent_setup};
use std::collections::BTreeMap;
use studio_gateway::GatewayRpc;

/// Pending setups keyed by agent id.
pub type PendingSetups = BTreeMap<String, AgentGuidedSetup>;

/// Add or replace the pending setup for `agent_id`. Blank ids are ignored.
pub fn upsert_pending_setup(pending: &mut PendingSetups, agent_id: &str, setup: AgentGuidedSetup) -> bool {
    let id = agent_id.trim();
    if id.is_empty() {
        return false;
    }
    pending.insert(id.to_string(), setup);
    true
}

pub fn remove_pending_setup(pending: &mut PendingSetups, agent_id: &str) -> Option<AgentGuidedSetup> {
    pending.remove(agent_id.trim())
}

/// Apply the pending setup for `agent_id`, if any, against the existing
/// agent. The entry is removed only once the apply succeeded; on failure
/// `pending` is left exactly as it was.
pub async fn apply_pending_setup<C: GatewayRpc>(
    ctx: &StudioContext<C>,
    agent_id: &str,
    pending: &mut PendingSetups,
) -> StudioResult<bool> {
    let id = agent_id.trim();
    let Some(setup) = pending.get(id) else {
        return Ok(false);
    };
    apply_guided_agent_setup(ctx, id, setup, true).await?;
    pending.remove(id);
    tracing::info!(agent_id = id, remaining = pending.len(), "pending setup applied");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guided_setup::tests::{sample_setup, setup_gateway};
    use crate::testing::ScriptedGateway;
    use serde_json::json;
    use studio_gateway::protocol::methods;

    #[test]
    fn upsert_and_remove() {
        let mut pending = PendingSetups::new();
        assert!(upsert_pending_setup(&mut pending, " agent-created ", sample_setup()));
        assert!(!upsert_pending_setup(&mut pending, "  ", sample_setup()));
        assert_eq!(pending, PendingSetups::from([("agent-created".to_string(), sample_setup())]));

        assert!(remove_pending_setup(&mut pending, "missing").is_none());
        assert!(remove_pending_setup(&mut pending, "agent-created").is_some());
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn applies_without_recreating_agent() {
        let ctx = StudioContext::new(setup_gateway(json!([{"id": "agent-1"}])));
        let mut pending = PendingSetups::from([("agent-1".to_string(), sample_setup())]);
        assert!(apply_pending_setup(&ctx, "agent-1", &mut pending).await.unwrap());
        assert!(pending.is_empty());
        assert_eq!(ctx.client.count(methods::AGENTS_CREATE), 0);
        assert_eq!(ctx.client.count(methods::CONFIG_SET), 1);
    }

    #[tokio::test]
    async fn removes_only_the_applied_entry() {
        let ctx = StudioContext::new(setup_gateway(json!([{"id": "agent-1"}, {"id": "agent-2"}])));
        let mut other = sample_setup();
        other.files.clear();
        let mut pending = PendingSetups::from([
            ("agent-1".to_string(), sample_setup()),
            ("agent-2".to_string(), other.clone()),
        ]);
        assert!(apply_pending_setup(&ctx, "agent-1", &mut pending).await.unwrap());
        assert_eq!(pending, PendingSetups::from([("agent-2".to_string(), other)]));
    }

    #[tokio::test]
    async fn unknown_agent_is_untouched() {
        let ctx = StudioContext::new(ScriptedGateway::new());
        let mut pending = PendingSetups::from([("agent-1".to_string(), sample_setup())]);
        let before = pending.clone();
        assert!(!apply_pending_setup(&ctx, "agent-9", &mut pending).await.unwrap());
        assert!(!apply_pending_setup(&ctx, " ", &mut pending).await.unwrap());
        assert_eq!(pending, before);
        assert!(ctx.client.calls().is_empty());
    }

    #[tokio::test]
    async fn failure_keeps_entry() {
        let ctx = StudioContext::new(
            ScriptedGateway::new().on_err(methods::AGENTS_FILES_SET, crate::testing::disconnected()),
        );
        let mut pending = PendingSetups::from([("agent-1".to_string(), sample_setup())]);
        let before = pending.clone();
        let err = apply_pending_setup(&ctx, "agent-1", &mut pending).await.unwrap_err();
        assert!(err.is_disconnect_like());
        assert_eq!(pending, before);
    }
}

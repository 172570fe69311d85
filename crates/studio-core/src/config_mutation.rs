//! Compare-and-swap writes to the gateway config document.
//!
//! Every write fetches a fresh snapshot, lets the caller compute a patch
//! against it, and submits the patch with the snapshot's hash. A conflict
//! rejection triggers exactly one re-fetch and recompute.

use crate::config_list::{AgentDirectoryEntry, read_agent_list};
use crate::context::StudioContext;
use crate::error::{StudioError, StudioResult};
use studio_gateway::GatewayRpc;
use studio_gateway::protocol::{ConfigSnapshot, ConfigWriteParams, JsonObject, methods};

/// What a mutation sees: the snapshot, its document, and the parsed agent list.
pub struct MutationInput<'a> {
    pub snapshot: &'a ConfigSnapshot,
    pub document: &'a JsonObject,
    pub agents: &'a [AgentDirectoryEntry],
}

/// Outcome of a mutation function.
#[derive(Debug)]
pub enum Mutation<T> {
    /// Nothing to write.
    Skip(T),
    /// Merge patch submitted through `config.patch`.
    Patch { patch: JsonObject, result: T },
    /// Whole document submitted through `config.set`.
    Replace { document: JsonObject, result: T },
}

pub async fn mutate_config<C, T, F>(ctx: &StudioContext<C>, mut mutate: F) -> StudioResult<T>
where
    C: GatewayRpc,
    F: FnMut(&MutationInput<'_>) -> StudioResult<Mutation<T>>,
{
    match attempt(ctx, &mut mutate).await {
        Err(err) if err.is_config_conflict() => {
            tracing::info!(error = %err, "config conflict, re-fetching and retrying once");
            attempt(ctx, &mut mutate).await
        }
        other => other,
    }
}

async fn attempt<C, T, F>(ctx: &StudioContext<C>, mutate: &mut F) -> StudioResult<T>
where
    C: GatewayRpc,
    F: FnMut(&MutationInput<'_>) -> StudioResult<Mutation<T>>,
{
    let snapshot: ConfigSnapshot = ctx.call(methods::CONFIG_GET, &JsonObject::new()).await?;
    let agents = read_agent_list(&snapshot.document);
    let mutation = mutate(&MutationInput {
        snapshot: &snapshot,
        document: &snapshot.document,
        agents: &agents,
    })?;

    let (method, body, result) = match mutation {
        Mutation::Skip(result) => return Ok(result),
        Mutation::Patch { patch, result } => (methods::CONFIG_PATCH, patch, result),
        Mutation::Replace { document, result } => (methods::CONFIG_SET, document, result),
    };

    let base_hash = if snapshot.exists {
        Some(
            snapshot
                .base_hash()
                .ok_or(StudioError::MissingBaseHash)?
                .to_string(),
        )
    } else {
        None
    };
    let raw = serde_json::to_string_pretty(&body)
        .map_err(|err| StudioError::payload(format!("failed to encode config: {err}")))?;
    let params = ConfigWriteParams {
        raw,
        base_hash,
        session_key: ctx.session_key.clone(),
    };
    ctx.call_unit(method, &params).await?;
    tracing::debug!(%method, "config write accepted");
    Ok(result)
}

//! Session key grammar: `agent:<agentId>:<scope>[:<sessionId>]`.
//!
//! Nothing outside this module builds or splits keys by hand.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use studio_gateway::protocol::SessionListEntry;

const AGENT_PREFIX: &str = "agent:";
const STUDIO_SCOPE: &str = "studio";
const DEFAULT_MAIN_KEY: &str = "main";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedSessionKey<'a> {
    pub agent_id: &'a str,
    pub scope: &'a str,
    pub session_id: Option<&'a str>,
}

pub fn build_agent_main_session_key(agent_id: &str, main_key: &str) -> String {
    let main_key = match main_key.trim() {
        "" => DEFAULT_MAIN_KEY,
        key => key,
    };
    format!("{AGENT_PREFIX}{}:{main_key}", agent_id.trim())
}

pub fn build_agent_studio_session_key(agent_id: &str, session_id: &str) -> String {
    format!("{}{}", studio_key_prefix(agent_id), session_id.trim())
}

fn studio_key_prefix(agent_id: &str) -> String {
    format!("{AGENT_PREFIX}{}:{STUDIO_SCOPE}:", agent_id.trim())
}

pub fn parse_session_key(key: &str) -> Option<ParsedSessionKey<'_>> {
    let rest = key.strip_prefix(AGENT_PREFIX)?;
    let (agent_id, rest) = rest.split_once(':')?;
    if agent_id.is_empty() || rest.is_empty() {
        return None;
    }
    let (scope, session_id) = match rest.split_once(':') {
        Some((scope, session_id)) => (scope, Some(session_id)),
        None => (rest, None),
    };
    Some(ParsedSessionKey {
        agent_id,
        scope,
        session_id,
    })
}

pub fn parse_agent_id_from_session_key(key: &str) -> Option<&str> {
    let rest = key.strip_prefix(AGENT_PREFIX)?;
    let (agent_id, _) = rest.split_once(':')?;
    (!agent_id.is_empty()).then_some(agent_id)
}

/// Both keys non-blank and equal after trimming.
pub fn is_same_session_key(a: &str, b: &str) -> bool {
    let a = a.trim();
    !a.is_empty() && a == b.trim()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudioSessionEntry {
    pub key: String,
    pub session_id: String,
    pub updated_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudioSessionGroup {
    pub agent_id: String,
    pub entries: Vec<StudioSessionEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudioSessionSelection {
    pub session_id: String,
    pub has_persisted_session: bool,
    pub should_persist_session: bool,
    pub existing_session_keys: Vec<String>,
    pub stale_studio_keys: Vec<String>,
}

/// Studio-scoped sessions of one agent, newest first.
pub fn extract_studio_session_entries(
    agent_id: &str,
    sessions: &[SessionListEntry],
) -> Vec<StudioSessionEntry> {
    let prefix = studio_key_prefix(agent_id);
    let mut entries: Vec<StudioSessionEntry> = sessions
        .iter()
        .filter_map(|session| {
            let key = session.key.as_deref()?.trim();
            let session_id = key.strip_prefix(&prefix)?.trim();
            if session_id.is_empty() {
                return None;
            }
            Some(StudioSessionEntry {
                key: key.to_string(),
                session_id: session_id.to_string(),
                updated_at: session.updated_at.unwrap_or(0),
            })
        })
        .collect();
    entries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    entries
}

/// One group per agent id, built from a `sessions.list` response.
pub fn group_studio_sessions(
    agent_ids: &[String],
    sessions: &[SessionListEntry],
) -> Vec<StudioSessionGroup> {
    agent_ids
        .iter()
        .map(|agent_id| StudioSessionGroup {
            agent_id: agent_id.clone(),
            entries: extract_studio_session_entries(agent_id, sessions),
        })
        .collect()
}

/// Choose the studio session id every agent should use and classify the
/// keys that already exist for it.
pub fn reconcile_studio_session_selection(
    groups: &[StudioSessionGroup],
    persisted_session_id: Option<&str>,
    generated_session_id: &str,
) -> StudioSessionSelection {
    let mut all: Vec<&StudioSessionEntry> = groups.iter().flat_map(|g| &g.entries).collect();
    all.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));

    let persisted = persisted_session_id.map(str::trim).unwrap_or_default();
    let has_persisted_session =
        !persisted.is_empty() && all.iter().any(|entry| entry.session_id == persisted);

    let session_id = if has_persisted_session {
        persisted.to_string()
    } else {
        all.first()
            .map(|entry| entry.session_id.clone())
            .unwrap_or_else(|| generated_session_id.trim().to_string())
    };

    let mut existing_session_keys = Vec::new();
    let mut stale_studio_keys = Vec::new();
    let mut seen_stale = HashSet::new();
    for group in groups {
        let Some(active) = group.entries.iter().find(|e| e.session_id == session_id) else {
            continue;
        };
        existing_session_keys.push(active.key.clone());
        for entry in &group.entries {
            if entry.key != active.key && seen_stale.insert(entry.key.clone()) {
                stale_studio_keys.push(entry.key.clone());
            }
        }
    }

    StudioSessionSelection {
        session_id,
        has_persisted_session,
        should_persist_session: !has_persisted_session,
        existing_session_keys,
        stale_studio_keys,
    }
}

//! Durable storage for pending guided setups.
//!
//! The whole map is written as one versioned blob. Every entry carries the
//! time it was first saved and expires on its own once older than the TTL.

use crate::error::{StudioError, StudioResult};
use crate::guided_setup::AgentGuidedSetup;
use crate::recovery::PendingSetups;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

pub const STORAGE_KEY: &str = "openclaw-studio.pending-guided-setups";
const BLOB_VERSION: u32 = 2;

/// Minimal string key-value store.
pub trait KeyValueStore {
    fn get(&self, key: &str) -> StudioResult<Option<String>>;
    fn set(&self, key: &str, value: &str) -> StudioResult<()>;
    fn remove(&self, key: &str) -> StudioResult<()>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    map: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self) -> StudioResult<std::sync::MutexGuard<'_, HashMap<String, String>>> {
        self.map.lock().map_err(|_| StudioError::Store {
            message: "memory store lock poisoned".to_string(),
        })
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> StudioResult<Option<String>> {
        Ok(self.map()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> StudioResult<()> {
        self.map()?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> StudioResult<()> {
        self.map()?.remove(key);
        Ok(())
    }
}

/// One JSON file per key inside a directory (normally the state dir).
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, key: &str) -> PathBuf {
        let name: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '_' })
            .collect();
        self.dir.join(format!("{name}.json"))
    }
}

fn io_error(action: &str, path: &Path, err: std::io::Error) -> StudioError {
    StudioError::Store {
        message: format!("failed to {action} {}: {err}", path.display()),
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> StudioResult<Option<String>> {
        let path = self.path(key);
        match std::fs::read_to_string(&path) {
            Ok(data) => Ok(Some(data)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(io_error("read", &path, err)),
        }
    }

    fn set(&self, key: &str, value: &str) -> StudioResult<()> {
        let path = self.path(key);
        std::fs::create_dir_all(&self.dir).map_err(|err| io_error("create", &self.dir, err))?;
        std::fs::write(&path, value).map_err(|err| io_error("write", &path, err))
    }

    fn remove(&self, key: &str) -> StudioResult<()> {
        let path = self.path(key);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(io_error("remove", &path, err)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredSetup {
    saved_at_ms: u64,
    setup: AgentGuidedSetup,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PendingSetupsBlob {
    version: u32,
    #[serde(default)]
    setups_by_agent_id: BTreeMap<String, StoredSetup>,
}

/// Version 1 layout: one timestamp for the whole map.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyPendingSetupsBlob {
    saved_at_ms: u64,
    #[serde(default)]
    setups_by_agent_id: PendingSetups,
}

fn decode_blob(raw: &str) -> Result<BTreeMap<String, StoredSetup>, String> {
    let value: serde_json::Value = serde_json::from_str(raw).map_err(|err| err.to_string())?;
    let version = value.get("version").and_then(serde_json::Value::as_u64);
    match version {
        Some(v) if v == u64::from(BLOB_VERSION) => serde_json::from_value::<PendingSetupsBlob>(value)
            .map(|blob| blob.setups_by_agent_id)
            .map_err(|err| err.to_string()),
        Some(1) => {
            let legacy: LegacyPendingSetupsBlob =
                serde_json::from_value(value).map_err(|err| err.to_string())?;
            Ok(legacy
                .setups_by_agent_id
                .into_iter()
                .map(|(id, setup)| {
                    let entry = StoredSetup { saved_at_ms: legacy.saved_at_ms, setup };
                    (id, entry)
                })
                .collect())
        }
        other => Err(format!("unknown version {other:?}")),
    }
}

fn write_entries<S: KeyValueStore + ?Sized>(
    store: &S,
    entries: BTreeMap<String, StoredSetup>,
) -> StudioResult<()> {
    if entries.is_empty() {
        return store.remove(STORAGE_KEY);
    }
    let blob = PendingSetupsBlob {
        version: BLOB_VERSION,
        setups_by_agent_id: entries,
    };
    let data = serde_json::to_string(&blob)
        .map_err(|err| StudioError::payload(format!("failed to encode pending setups: {err}")))?;
    store.set(STORAGE_KEY, &data)
}

/// Restore pending setups saved by [`persist_pending_setups`].
///
/// Each entry expires on its own once it is older than `ttl`; expired entries
/// are pruned from the store. Missing or malformed blobs yield an empty map,
/// and malformed ones are removed.
pub fn load_pending_setups<S: KeyValueStore + ?Sized>(
    store: &S,
    now_ms: u64,
    ttl: Duration,
) -> StudioResult<PendingSetups> {
    let Some(raw) = store.get(STORAGE_KEY)? else {
        return Ok(PendingSetups::new());
    };
    let entries = match decode_blob(&raw) {
        Ok(entries) => entries,
        Err(error) => {
            tracing::warn!(%error, "discarding malformed pending setups");
            store.remove(STORAGE_KEY)?;
            return Ok(PendingSetups::new());
        }
    };
    let total = entries.len();
    let live: BTreeMap<String, StoredSetup> = entries
        .into_iter()
        .filter(|(_, entry)| u128::from(now_ms.saturating_sub(entry.saved_at_ms)) <= ttl.as_millis())
        .collect();
    if live.len() != total {
        tracing::info!(dropped = total - live.len(), kept = live.len(), "pending setups expired");
        write_entries(store, live.clone())?;
    }
    Ok(live.into_iter().map(|(id, entry)| (id, entry.setup)).collect())
}

/// Save `pending`, or clear the key when there is nothing left.
///
/// An entry already stored with the same setup keeps its original save time;
/// new or changed entries are stamped with `now_ms`.
pub fn persist_pending_setups<S: KeyValueStore + ?Sized>(
    store: &S,
    pending: &PendingSetups,
    now_ms: u64,
) -> StudioResult<()> {
    if pending.is_empty() {
        return store.remove(STORAGE_KEY);
    }
    let previous = match store.get(STORAGE_KEY)? {
        Some(raw) => decode_blob(&raw).unwrap_or_default(),
        None => BTreeMap::new(),
    };
    let entries = pending
        .iter()
        .map(|(id, setup)| {
            let saved_at_ms = previous
                .get(id)
                .filter(|entry| entry.setup == *setup)
                .map_or(now_ms, |entry| entry.saved_at_ms);
            let entry = StoredSetup { saved_at_ms, setup: setup.clone() };
            (id.clone(), entry)
        })
        .collect();
    write_entries(store, entries)
}

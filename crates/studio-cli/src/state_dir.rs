use anyhow::{Context, Result, bail};
use std::path::{Path, PathBuf};
use studio_core::pending_store::FileStore;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

const APP_DIR: &str = "openclaw-studio";
const LOCAL_STATE_FILE: &str = "agents.json";

/// Private directory holding the agents snapshot and the pending setup store.
#[derive(Debug, Clone)]
pub struct StateDir {
    root: PathBuf,
}

impl StateDir {
    /// Resolve the directory from the `--state-dir` flag or the environment,
    /// then create it.
    pub fn open(explicit: Option<PathBuf>) -> Result<Self> {
        let root = resolve_root(explicit, |key| std::env::var(key).ok())?;
        Self::create(root)
    }

    /// Create `root` (and parents) with owner-only permissions.
    pub fn create(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("failed to create state dir {}", root.display()))?;
        #[cfg(unix)]
        std::fs::set_permissions(&root, std::fs::Permissions::from_mode(0o700))
            .with_context(|| format!("failed to restrict state dir {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn local_state_path(&self) -> PathBuf {
        self.root.join(LOCAL_STATE_FILE)
    }

    /// Key-value store backing pending guided setups.
    pub fn pending_store(&self) -> FileStore {
        FileStore::new(&self.root)
    }
}

/// `explicit`, then `$STUDIO_STATE_DIR`, then `$XDG_STATE_HOME/openclaw-studio`,
/// then `~/.local/state/openclaw-studio`. Empty variables are ignored.
fn resolve_root(explicit: Option<PathBuf>, env: impl Fn(&str) -> Option<String>) -> Result<PathBuf> {
    if let Some(dir) = explicit {
        return Ok(dir);
    }
    let var = |key: &str| env(key).filter(|value| !value.trim().is_empty());
    if let Some(dir) = var("STUDIO_STATE_DIR") {
        return Ok(PathBuf::from(dir));
    }
    if let Some(state_home) = var("XDG_STATE_HOME") {
        return Ok(PathBuf::from(state_home).join(APP_DIR));
    }
    match var("HOME") {
        Some(home) => Ok(PathBuf::from(home).join(".local/state").join(APP_DIR)),
        None => bail!("cannot locate a state directory: set --state-dir, STUDIO_STATE_DIR or HOME"),
    }
}

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use studio_core::StudioOptions;
use studio_core::context::{DEFAULT_HISTORY_LIMIT, DEFAULT_WAIT_TIMEOUT_MS, MAX_HISTORY_LIMIT};
use studio_gateway::DEFAULT_GATEWAY_URL;

const APP_DIR: &str = "openclaw-studio";

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct StudioConfig {
    pub gateway: GatewaySection,
    pub history: HistorySection,
    pub reconcile: ReconcileSection,
    pub setup: SetupSection,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct GatewaySection {
    pub url: String,
    pub token: Option<String>,
    pub call_timeout_ms: u64,
    /// Whether the gateway runs on this machine. Remote gateways need a
    /// restart before a new agent can take its guided setup.
    pub local: bool,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            url: DEFAULT_GATEWAY_URL.to_string(),
            token: None,
            call_timeout_ms: 30_000,
            local: true,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct HistorySection {
    pub default_limit: usize,
    pub max_limit: usize,
    pub transcript_v2: bool,
}

impl Default for HistorySection {
    fn default() -> Self {
        Self {
            default_limit: DEFAULT_HISTORY_LIMIT,
            max_limit: MAX_HISTORY_LIMIT,
            transcript_v2: true,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ReconcileSection {
    pub wait_timeout_ms: u64,
}

impl Default for ReconcileSection {
    fn default() -> Self {
        Self {
            wait_timeout_ms: DEFAULT_WAIT_TIMEOUT_MS,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct SetupSection {
    pub pending_ttl_secs: u64,
}

impl Default for SetupSection {
    fn default() -> Self {
        Self {
            pending_ttl_secs: 24 * 60 * 60,
        }
    }
}

impl StudioConfig {
    /// Load `path`, or the default config file, falling back to defaults
    /// when it does not exist. Environment overrides are applied last.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = path.map(Path::to_path_buf).unwrap_or_else(Self::config_path);
        let mut config = if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path)
                .with_context(|| format!("failed to read {}", config_path.display()))?;
            Self::parse(&contents)
                .with_context(|| format!("invalid config {}", config_path.display()))?
        } else {
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn parse(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    pub fn config_path() -> PathBuf {
        dirs_path().join("config.toml")
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(url) = var("STUDIO_GATEWAY_URL").filter(|v| !v.trim().is_empty()) {
            self.gateway.url = url;
        }
        if let Some(token) = var("STUDIO_GATEWAY_TOKEN").filter(|v| !v.trim().is_empty()) {
            self.gateway.token = Some(token);
        }
    }

    pub fn options(&self) -> StudioOptions {
        StudioOptions {
            history_default_limit: self.history.default_limit,
            history_max_limit: self.history.max_limit,
            transcript_v2: self.history.transcript_v2,
            wait_timeout_ms: self.reconcile.wait_timeout_ms,
            pending_setup_ttl: self.pending_ttl(),
        }
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.gateway.call_timeout_ms.max(1))
    }

    pub fn pending_ttl(&self) -> Duration {
        Duration::from_secs(self.setup.pending_ttl_secs)
    }
}

fn dirs_path() -> PathBuf {
    if let Ok(config_dir) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(config_dir).join(APP_DIR)
    } else if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".config").join(APP_DIR)
    } else {
        PathBuf::from("/tmp").join(APP_DIR)
    }
}

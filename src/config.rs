//! Runtime configuration: built-in defaults, an optional TOML file, and
//! CLI/environment overrides applied on top.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

/// Default preferred port for the gateway API.
pub const DEFAULT_PORT: u16 = 24282;
/// How many ports past the preferred one are tried before giving up.
pub const DEFAULT_PORT_SEARCH_WINDOW: u16 = 20;

/// Tunables for the registry, monitor, reaper, proxy, and gateway.
///
/// All durations are stored as plain seconds (or milliseconds where noted)
/// so the TOML file stays flat:
///
/// ```toml
/// port = 24282
/// probe_interval_secs = 5
/// zombie_timeout_secs = 300
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Directory holding `instances.json` and `instances.lock`.
    /// Defaults to `~/.muster` when unset.
    pub base_dir: Option<PathBuf>,
    /// Preferred gateway port; the bind falls back to the next free port
    /// within the search window.
    pub port: u16,
    /// Width of the fallback port search window.
    pub port_search_window: u16,
    /// Seconds between health-probe sweeps.
    pub probe_interval_secs: u64,
    /// Per-probe request timeout, seconds.
    pub probe_timeout_secs: u64,
    /// How many instances are probed concurrently per sweep.
    pub probe_concurrency: usize,
    /// Seconds between zombie-prune sweeps.
    pub reap_interval_secs: u64,
    /// Zombie age after which the record is pruned, seconds.
    pub zombie_timeout_secs: u64,
    /// Timeout for pass-through proxy calls, seconds.
    pub proxy_timeout_secs: u64,
    /// Grace period between SIGTERM and SIGKILL, milliseconds.
    pub kill_grace_ms: u64,
    /// Bounded wait for the registry file lock, seconds.
    pub lock_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_dir: None,
            port: DEFAULT_PORT,
            port_search_window: DEFAULT_PORT_SEARCH_WINDOW,
            probe_interval_secs: 5,
            probe_timeout_secs: 2,
            probe_concurrency: 8,
            reap_interval_secs: 60,
            zombie_timeout_secs: 300,
            proxy_timeout_secs: 5,
            kill_grace_ms: 500,
            lock_timeout_secs: 10,
        }
    }
}

impl Config {
    /// Load configuration: defaults, overlaid with the TOML file at `path`
    /// if one was given. A missing explicit path is an error; no path means
    /// defaults only.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .map_err(|e| anyhow::anyhow!("reading config {}: {e}", path.display()))?;
                let config: Config = toml::from_str(&raw)
                    .map_err(|e| anyhow::anyhow!("parsing config {}: {e}", path.display()))?;
                Ok(config)
            }
            None => Ok(Self::default()),
        }
    }

    /// Resolve the registry base directory, defaulting to `~/.muster`.
    pub fn base_dir(&self) -> PathBuf {
        match &self.base_dir {
            Some(dir) => dir.clone(),
            None => dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".muster"),
        }
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }

    pub fn zombie_timeout(&self) -> Duration {
        Duration::from_secs(self.zombie_timeout_secs)
    }

    pub fn proxy_timeout(&self) -> Duration {
        Duration::from_secs(self.proxy_timeout_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }
}

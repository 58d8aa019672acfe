//! Load stream configuration from file and environment.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Streaming configuration. File: ~/.config/dtn-stream/config.toml or /etc/dtn-stream/config.toml.
/// Env overrides: DTN_STREAM_LIFETIME, DTN_STREAM_FLUSH_DELAY_FACTOR, DTN_STREAM_PARSE_WORKERS,
/// DTN_STREAM_GC_INTERVAL.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StreamConfig {
    /// Lifetime of sent bundles in seconds (default 3600).
    #[serde(default = "default_lifetime")]
    pub lifetime: u64,
    /// First flush after this fraction of the RTT (default 0.2).
    #[serde(default = "default_flush_delay_factor")]
    pub flush_delay_factor: f64,
    /// Parser worker threads in the receiver (default 2).
    #[serde(default = "default_parse_workers")]
    pub parse_workers: usize,
    /// Seconds between sweeps for finished and expired streams (default 60).
    #[serde(default = "default_gc_interval")]
    pub gc_interval: u64,
}

fn default_lifetime() -> u64 {
    3600
}
fn default_flush_delay_factor() -> f64 {
    0.2
}
fn default_parse_workers() -> usize {
    2
}
fn default_gc_interval() -> u64 {
    60
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            lifetime: default_lifetime(),
            flush_delay_factor: default_flush_delay_factor(),
            parse_workers: default_parse_workers(),
            gc_interval: default_gc_interval(),
        }
    }
}

impl StreamConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_secs(self.gc_interval.max(1))
    }

    /// Overlay values from `lookup` (normally the process environment). Unparsable values are ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("DTN_STREAM_LIFETIME").and_then(|s| s.parse().ok()) {
            self.lifetime = v;
        }
        if let Some(v) = lookup("DTN_STREAM_FLUSH_DELAY_FACTOR").and_then(|s| s.parse().ok()) {
            self.flush_delay_factor = v;
        }
        if let Some(v) = lookup("DTN_STREAM_PARSE_WORKERS").and_then(|s| s.parse().ok()) {
            self.parse_workers = v;
        }
        if let Some(v) = lookup("DTN_STREAM_GC_INTERVAL").and_then(|s| s.parse().ok()) {
            self.gc_interval = v;
        }
    }
}

/// Error loading a configuration file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> StreamConfig {
    let mut c = load_file().unwrap_or_default();
    c.apply_env(|key| std::env::var(key).ok());
    c
}

/// Parse the config file at `path`.
pub fn load_from(path: &Path) -> Result<StreamConfig, ConfigError> {
    let s = std::fs::read_to_string(path)?;
    StreamConfig::from_toml_str(&s)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/dtn-stream/config.toml"));
    }
    out.push(PathBuf::from("/etc/dtn-stream/config.toml"));
    out
}

fn load_file() -> Option<StreamConfig> {
    let path = config_paths().into_iter().find(|p| p.exists())?;
    match load_from(&path) {
        Ok(c) => Some(c),
        Err(e) => {
            tracing::warn!(target: "dtn-stream::config", path = %path.display(), error = %e, "ignoring config file");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults() {
        let c = StreamConfig::default();
        assert_eq!(c.lifetime, 3600);
        assert_eq!(c.flush_delay_factor, 0.2);
        assert_eq!(c.parse_workers, 2);
        assert_eq!(c.gc_interval(), Duration::from_secs(60));
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let c = StreamConfig::from_toml_str("lifetime = 300\n").unwrap();
        assert_eq!(c.lifetime, 300);
        assert_eq!(c.parse_workers, 2);
    }

    #[test]
    fn unknown_field_rejected() {
        assert!(matches!(
            StreamConfig::from_toml_str("lifetme = 300\n"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn env_overrides_file() {
        let mut c = StreamConfig::from_toml_str("lifetime = 300\nparse_workers = 4\n").unwrap();
        let env: HashMap<&str, &str> = [
            ("DTN_STREAM_LIFETIME", "120"),
            ("DTN_STREAM_FLUSH_DELAY_FACTOR", "0.5"),
            ("DTN_STREAM_GC_INTERVAL", "not a number"),
        ]
        .into_iter()
        .collect();
        c.apply_env(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(c.lifetime, 120);
        assert_eq!(c.flush_delay_factor, 0.5);
        assert_eq!(c.parse_workers, 4);
        assert_eq!(c.gc_interval, 60);
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = load_from(Path::new("/nonexistent/dtn-stream/config.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn zero_gc_interval_clamped() {
        let c = StreamConfig {
            gc_interval: 0,
            ..StreamConfig::default()
        };
        assert_eq!(c.gc_interval(), Duration::from_secs(1));
    }
}

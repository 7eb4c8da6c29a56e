use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fleet_core::StartParams;
use fleet_engine_client::EngineClientConfig;
use fleet_monitor::MonitorConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConsoleConfig {
    pub wallets_path: PathBuf,
    pub monitor: MonitorConfig,
    pub engine: EngineClientConfig,
    pub start: StartParams,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            wallets_path: default_wallets_path(),
            monitor: MonitorConfig::default(),
            engine: EngineClientConfig::default(),
            start: StartParams::default(),
        }
    }
}

/// `--config` wins, then `FLEET_CONFIG`, then the XDG location.
pub fn config_path(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }
    if let Some(path) = non_empty_var("FLEET_CONFIG") {
        return PathBuf::from(path);
    }
    config_dir().join("fleet").join("config.toml")
}

/// A missing file yields defaults; an unreadable or malformed one is an error.
pub fn load_config(path: &Path) -> Result<ConsoleConfig> {
    if !path.exists() {
        return Ok(ConsoleConfig::default());
    }
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    toml::from_str(&contents).with_context(|| format!("failed to parse config {}", path.display()))
}

pub fn apply_env_overrides(config: &mut ConsoleConfig) {
    apply_overrides(config, non_empty_var);
}

fn apply_overrides(config: &mut ConsoleConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(socket) = lookup("FLEET_ENGINE_SOCK") {
        config.engine.socket_path = PathBuf::from(socket);
    }
    if let Some(wallets) = lookup("FLEET_WALLETS") {
        config.wallets_path = PathBuf::from(wallets);
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn config_dir() -> PathBuf {
    if let Some(path) = non_empty_var("XDG_CONFIG_HOME") {
        return PathBuf::from(path);
    }
    home_dir().join(".config")
}

fn default_wallets_path() -> PathBuf {
    let data_dir = match non_empty_var("XDG_DATA_HOME") {
        Some(path) => PathBuf::from(path),
        None => home_dir().join(".local").join("share"),
    };
    data_dir.join("fleet").join("wallets.json")
}

fn home_dir() -> PathBuf {
    env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = load_config(&dir.path().join("absent.toml")).expect("defaults");
        assert_eq!(config.monitor, MonitorConfig::default());
        assert!(config.wallets_path.ends_with("fleet/wallets.json"));
    }

    #[test]
    fn partial_file_merges_with_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
wallets_path = "/srv/fleet/wallets.json"

[monitor]
poll_interval_ms = 1500

[engine]
socket_path = "/run/fleet/engine.sock"
request_timeout_ms = 3000

[start]
concurrency = 4
retry_count = 2
proxy_pool = "residential"
"#,
        )
        .expect("write config");

        let config = load_config(&path).expect("config");
        assert_eq!(config.wallets_path, PathBuf::from("/srv/fleet/wallets.json"));
        assert_eq!(config.monitor.poll_interval_ms, 1500);
        assert_eq!(config.monitor.stop_timeout_ms, 10_000);
        assert_eq!(config.engine.socket_path, PathBuf::from("/run/fleet/engine.sock"));
        assert_eq!(config.engine.request_timeout_ms, 3000);
        assert_eq!(config.start.concurrency, Some(4));
        assert_eq!(config.start.retry_count, Some(2));
        assert_eq!(
            config.start.extra.get("proxy_pool").and_then(|v| v.as_str()),
            Some("residential")
        );
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        fs::write(&path, "[monitor\npoll_interval_ms = ").expect("write config");
        let err = load_config(&path).expect_err("parse error");
        assert!(err.to_string().contains("failed to parse config"));
    }

    #[test]
    fn env_overrides_replace_paths() {
        let mut config = ConsoleConfig::default();
        apply_overrides(&mut config, |key| match key {
            "FLEET_ENGINE_SOCK" => Some("/tmp/override.sock".to_string()),
            "FLEET_WALLETS" => Some("/tmp/wallets.json".to_string()),
            _ => None,
        });
        assert_eq!(config.engine.socket_path, PathBuf::from("/tmp/override.sock"));
        assert_eq!(config.wallets_path, PathBuf::from("/tmp/wallets.json"));
    }

    #[test]
    fn cli_path_wins() {
        let path = config_path(Some(Path::new("/etc/fleet.toml")));
        assert_eq!(path, PathBuf::from("/etc/fleet.toml"));
    }
}

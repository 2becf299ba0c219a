//! Daemon configuration: a TOML file plus environment overrides.
//!
//! Nothing here is fatal except an unreadable file the operator explicitly
//! pointed at; everything else degrades to defaults with a collected
//! warning, logged once tracing is up.

use serde::Deserialize;
use std::path::{Path, PathBuf};

use verdex_core::config::{ErrConvertConf, ErrRetryConf, ExptExecConf};

/// Default file consulted when `--config` is not given.
const DEFAULT_CONFIG_PATH: &str = "verdex.toml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    Memory,
    Postgres,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConf {
    #[serde(default)]
    pub kind: BackendKind,
    #[serde(default)]
    pub database_url: Option<String>,
    #[serde(default)]
    pub redis_url: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    10
}

impl Default for BackendConf {
    fn default() -> Self {
        Self {
            kind: BackendKind::Memory,
            database_url: None,
            redis_url: None,
            max_connections: default_max_connections(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct WorkersConf {
    pub schedule: usize,
    pub item: usize,
}

impl Default for WorkersConf {
    fn default() -> Self {
        Self {
            schedule: 2,
            item: 4,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub backend: BackendConf,
    #[serde(default)]
    pub workers: WorkersConf,
    #[serde(default)]
    pub exec: ExptExecConf,
    #[serde(default)]
    pub retry: ErrRetryConf,
    #[serde(default)]
    pub err_convert: ErrConvertConf,
}

/// Loaded configuration plus everything worth telling the operator about.
#[derive(Debug)]
pub struct ConfigLoad {
    pub config: ServerConfig,
    pub warnings: Vec<String>,
    pub env_file_loaded: bool,
    pub path: Option<PathBuf>,
}

/// Load the config file (explicit path, or `verdex.toml` when present),
/// then apply `VERDEX_*` environment overrides. An explicit path that
/// cannot be read or parsed is fatal; the implicit one degrades to
/// defaults.
pub fn load(path: Option<&Path>) -> anyhow::Result<ConfigLoad> {
    let env_file_loaded = dotenvy::dotenv().is_ok();
    let mut warnings = Vec::new();

    let (mut config, used_path) = match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path).map_err(|err| {
                anyhow::anyhow!("reading config {}: {err}", path.display())
            })?;
            let config: ServerConfig = toml::from_str(&raw).map_err(|err| {
                anyhow::anyhow!("parsing config {}: {err}", path.display())
            })?;
            (config, Some(path.to_path_buf()))
        }
        None => {
            let default = Path::new(DEFAULT_CONFIG_PATH);
            match std::fs::read_to_string(default) {
                Ok(raw) => match toml::from_str::<ServerConfig>(&raw) {
                    Ok(config) => (config, Some(default.to_path_buf())),
                    Err(err) => {
                        warnings.push(format!(
                            "ignoring unparseable {DEFAULT_CONFIG_PATH}: {err}"
                        ));
                        (ServerConfig::default(), None)
                    }
                },
                Err(_) => (ServerConfig::default(), None),
            }
        }
    };

    apply_env_overrides(&mut config, &mut warnings);

    if config.backend.kind == BackendKind::Postgres {
        if config.backend.database_url.is_none() {
            warnings.push(
                "backend.kind = postgres but no database_url; falling back to memory"
                    .to_string(),
            );
            config.backend.kind = BackendKind::Memory;
        } else if config.backend.redis_url.is_none() {
            warnings.push(
                "backend.kind = postgres but no redis_url; falling back to memory"
                    .to_string(),
            );
            config.backend.kind = BackendKind::Memory;
        }
    }

    Ok(ConfigLoad {
        config,
        warnings,
        env_file_loaded,
        path: used_path,
    })
}

fn apply_env_overrides(config: &mut ServerConfig, warnings: &mut Vec<String>) {
    if let Ok(url) = std::env::var("VERDEX_DATABASE_URL") {
        config.backend.database_url = Some(url);
    }
    if let Ok(url) = std::env::var("VERDEX_REDIS_URL") {
        config.backend.redis_url = Some(url);
    }
    if let Ok(kind) = std::env::var("VERDEX_BACKEND") {
        match kind.as_str() {
            "memory" => config.backend.kind = BackendKind::Memory,
            "postgres" => config.backend.kind = BackendKind::Postgres,
            other => warnings.push(format!(
                "unknown VERDEX_BACKEND value {other:?}, keeping {:?}",
                config.backend.kind
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_is_all_defaults() {
        let config: ServerConfig = toml::from_str("").unwrap();
        assert_eq!(config.backend.kind, BackendKind::Memory);
        assert_eq!(config.workers.schedule, 2);
        assert_eq!(config.workers.item, 4);
        assert_eq!(config.exec.locks.ttl_secs, 20);
    }

    #[test]
    fn sections_override_individually() {
        let config: ServerConfig = toml::from_str(
            r#"
            [backend]
            kind = "postgres"
            database_url = "postgres://localhost/verdex"
            redis_url = "redis://localhost"

            [workers]
            schedule = 1
            item = 8

            [exec.pacing]
            tick_pause_ms = 500
            start_settle_ms = 0
            page_delay_ms = 0
            aggregation_spacing_ms = 0
            append_empty_backoff_ms = 1000
            turn_settle_ms = 0
            "#,
        )
        .unwrap();
        assert_eq!(config.backend.kind, BackendKind::Postgres);
        assert_eq!(config.workers.item, 8);
        assert_eq!(config.exec.pacing.tick_pause_ms, 500);
        // Untouched sections keep their defaults.
        assert_eq!(config.exec.locks.run_max_hold_secs, 180);
        assert_eq!(config.retry.retry_times, 3);
    }

    #[test]
    fn explicit_path_loads_and_bad_toml_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("verdex.toml");
        std::fs::write(&path, "[workers]\nschedule = 3\nitem = 9\n").unwrap();

        let loaded = load(Some(&path)).unwrap();
        assert_eq!(loaded.config.workers.schedule, 3);
        assert_eq!(loaded.config.workers.item, 9);
        assert_eq!(loaded.path.as_deref(), Some(path.as_path()));

        std::fs::write(&path, "workers = {").unwrap();
        assert!(load(Some(&path)).is_err());
        assert!(load(Some(&dir.path().join("missing.toml"))).is_err());
    }
}

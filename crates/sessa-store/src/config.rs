//! Layered configuration: built-in defaults, then `<data_dir>/config.json`,
//! then `SESSA_*` environment variables.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::paths::{default_data_dir, default_log_dir, write_atomic, SessaPaths};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid value {value:?} for {var}")]
    InvalidEnv { var: &'static str, value: String },
    #[error(transparent)]
    Write(#[from] crate::StoreError),
}

/// Fully resolved settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessaConfig {
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub log_dir: PathBuf,
    #[serde(default)]
    pub remote_url: Option<String>,
    pub auth_disabled: bool,
    pub max_age_secs: u64,
    pub ingest_batch_size: usize,
    pub push_batch_size: usize,
    pub push_timeout_secs: u64,
    pub push_max_attempts: u32,
    pub bind: String,
    pub port: u16,
    pub pattern_window_days: u32,
}

impl SessaConfig {
    pub fn defaults_for(data_dir: &Path) -> Self {
        let paths = SessaPaths::new(data_dir);
        Self {
            data_dir: paths.data_dir,
            db_path: paths.db_path,
            log_dir: default_log_dir(),
            remote_url: None,
            auth_disabled: false,
            max_age_secs: 300,
            ingest_batch_size: 500,
            push_batch_size: 200,
            push_timeout_secs: 30,
            push_max_attempts: 3,
            bind: "127.0.0.1".to_string(),
            port: 8081,
            pattern_window_days: crate::patterns::DEFAULT_WINDOW_DAYS,
        }
    }

    /// Resolve from the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::resolve(|var| std::env::var(var).ok())
    }

    /// Resolve with an explicit variable lookup.
    pub fn resolve(env: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let data_dir = env("SESSA_DATA_DIR")
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(default_data_dir);
        let mut cfg = Self::defaults_for(&data_dir);

        let file = read_config_file(&SessaPaths::new(&data_dir).config_json)?;
        if !file.is_empty() {
            cfg = cfg.overlay(file, &data_dir)?;
        }
        cfg.apply_env(&env)?;
        Ok(cfg)
    }

    fn overlay(self, file: Map<String, Value>, data_dir: &Path) -> Result<Self, ConfigError> {
        let path = SessaPaths::new(data_dir).config_json;
        let mut base = match serde_json::to_value(&self) {
            Ok(Value::Object(map)) => map,
            Ok(_) => Map::new(),
            Err(source) => return Err(ConfigError::Parse { path, source }),
        };
        for (k, v) in file {
            // The data dir is where the file lives; it cannot move itself.
            if k != "data_dir" && base.contains_key(&k) {
                base.insert(k, v);
            }
        }
        serde_json::from_value(Value::Object(base)).map_err(|source| ConfigError::Parse { path, source })
    }

    fn apply_env(&mut self, env: &impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        let get = |var: &str| env(var).filter(|s| !s.is_empty());

        if let Some(v) = get("SESSA_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Some(v) = get("SESSA_LOG_DIR") {
            self.log_dir = PathBuf::from(v);
        }
        if let Some(v) = get("SESSA_REMOTE_URL") {
            self.remote_url = Some(v);
        }
        if let Some(v) = get("SESSA_AUTH_DISABLED") {
            self.auth_disabled = parse_bool("SESSA_AUTH_DISABLED", &v)?;
        }
        if let Some(v) = get("SESSA_MAX_AGE_SECS") {
            self.max_age_secs = parse_num("SESSA_MAX_AGE_SECS", &v)?;
        }
        if let Some(v) = get("SESSA_INGEST_BATCH_SIZE") {
            self.ingest_batch_size = parse_num("SESSA_INGEST_BATCH_SIZE", &v)?;
        }
        if let Some(v) = get("SESSA_PUSH_BATCH_SIZE") {
            self.push_batch_size = parse_num("SESSA_PUSH_BATCH_SIZE", &v)?;
        }
        if let Some(v) = get("SESSA_PUSH_TIMEOUT_SECS") {
            self.push_timeout_secs = parse_num("SESSA_PUSH_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = get("SESSA_PUSH_MAX_ATTEMPTS") {
            self.push_max_attempts = parse_num("SESSA_PUSH_MAX_ATTEMPTS", &v)?;
        }
        if let Some(v) = get("SESSA_BIND") {
            self.bind = v;
        }
        if let Some(v) = get("SESSA_PORT") {
            self.port = parse_num("SESSA_PORT", &v)?;
        }
        Ok(())
    }

    pub fn paths(&self) -> SessaPaths {
        SessaPaths::new(&self.data_dir)
    }
}

fn parse_bool(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidEnv {
            var,
            value: value.to_string(),
        }),
    }
}

fn parse_num<T: std::str::FromStr>(var: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        var,
        value: value.to_string(),
    })
}

/// Read `config.json` as a raw map. A missing file is an empty map.
pub fn read_config_file(path: &Path) -> Result<Map<String, Value>, ConfigError> {
    if !path.exists() {
        return Ok(Map::new());
    }
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let val: Value = serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    match val {
        Value::Object(map) => Ok(map),
        _ => Ok(Map::new()),
    }
}

pub fn write_config_file(path: &Path, config: &Map<String, Value>) -> Result<(), ConfigError> {
    let json = serde_json::to_string_pretty(config).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    write_atomic(path, json.as_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults_without_file_or_env() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().to_string_lossy().to_string();
        let cfg = SessaConfig::resolve(env_of(&[("SESSA_DATA_DIR", &dir)])).unwrap();
        assert_eq!(cfg.db_path, tmp.path().join("sessa.db"));
        assert_eq!(cfg.max_age_secs, 300);
        assert_eq!(cfg.push_batch_size, 200);
        assert_eq!(cfg.port, 8081);
        assert!(!cfg.auth_disabled);
    }

    #[test]
    fn env_beats_file_beats_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().to_string_lossy().to_string();
        let mut file = Map::new();
        file.insert("max_age_secs".into(), Value::from(60));
        file.insert("port".into(), Value::from(9000));
        file.insert("data_dir".into(), Value::from("/elsewhere"));
        file.insert("unknown_key".into(), Value::from(true));
        write_config_file(&tmp.path().join("config.json"), &file).unwrap();

        let cfg = SessaConfig::resolve(env_of(&[
            ("SESSA_DATA_DIR", &dir),
            ("SESSA_PORT", "9100"),
            ("SESSA_AUTH_DISABLED", "1"),
        ]))
        .unwrap();
        assert_eq!(cfg.max_age_secs, 60);
        assert_eq!(cfg.port, 9100);
        assert!(cfg.auth_disabled);
        assert_eq!(cfg.data_dir, tmp.path());
    }

    #[test]
    fn bad_env_value_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().to_string_lossy().to_string();
        let err = SessaConfig::resolve(env_of(&[
            ("SESSA_DATA_DIR", &dir),
            ("SESSA_PUSH_BATCH_SIZE", "lots"),
        ]))
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidEnv {
                var: "SESSA_PUSH_BATCH_SIZE",
                ..
            }
        ));
    }
}

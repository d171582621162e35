use clap::Subcommand;
use std::path::Path;

use sessa_store::config::{read_config_file, write_config_file};
use sessa_store::{SessaConfig, SessaPaths};

// ── CLI Schema ──

#[derive(Subcommand)]
pub enum ConfigCmd {
    /// Set a value in config.json
    Set {
        /// Config key (e.g. remote_url)
        key: String,
        /// Config value (true/false/number/string)
        value: String,
    },
    /// Get a value from config.json
    Get {
        /// Config key
        key: String,
    },
    /// List the values set in config.json
    List,
}

// ── Dispatch ──

pub fn run(cmd: ConfigCmd, data_dir: &Path) -> anyhow::Result<()> {
    match cmd {
        ConfigCmd::Set { key, value } => set(data_dir, &key, &value),
        ConfigCmd::Get { key } => get(data_dir, &key),
        ConfigCmd::List => list(data_dir),
    }
}

/// `sessa config`: defaults, config.json and environment, merged.
pub fn show(config: &SessaConfig) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}

// ── Command Implementations ──

/// Parse a string value into an appropriate JSON value (bool/number/string).
fn parse_value(s: &str) -> serde_json::Value {
    match s {
        "true" => serde_json::Value::Bool(true),
        "false" => serde_json::Value::Bool(false),
        _ => match s.parse::<i64>() {
            Ok(n) => serde_json::Value::Number(n.into()),
            Err(_) => serde_json::Value::String(s.to_string()),
        },
    }
}

fn known_keys(data_dir: &Path) -> anyhow::Result<Vec<String>> {
    let value = serde_json::to_value(SessaConfig::defaults_for(data_dir))?;
    Ok(value
        .as_object()
        .map(|m| m.keys().filter(|k| *k != "data_dir").cloned().collect())
        .unwrap_or_default())
}

/// `sessa config set <key> <value>`
pub fn set(data_dir: &Path, key: &str, value: &str) -> anyhow::Result<()> {
    let known = known_keys(data_dir)?;
    if !known.iter().any(|k| k == key) {
        anyhow::bail!("unknown config key: {key} (known: {})", known.join(", "));
    }
    let path = SessaPaths::new(data_dir).config_json;
    let mut config = read_config_file(&path)?;
    config.insert(key.to_string(), parse_value(value));

    // Reject values the resolver would fail on before they reach disk.
    let mut candidate = serde_json::to_value(SessaConfig::defaults_for(data_dir))?;
    if let Some(obj) = candidate.as_object_mut() {
        obj.insert(key.to_string(), parse_value(value));
    }
    if let Err(e) = serde_json::from_value::<SessaConfig>(candidate) {
        anyhow::bail!("invalid value for {key}: {e}");
    }

    write_config_file(&path, &config)?;
    println!("{key} = {value}");
    Ok(())
}

/// `sessa config get <key>`
pub fn get(data_dir: &Path, key: &str) -> anyhow::Result<()> {
    let config = read_config_file(&SessaPaths::new(data_dir).config_json)?;
    match config.get(key) {
        Some(val) => println!("{val}"),
        None => println!("(not set)"),
    }
    Ok(())
}

/// `sessa config list`
pub fn list(data_dir: &Path) -> anyhow::Result<()> {
    let config = read_config_file(&SessaPaths::new(data_dir).config_json)?;
    if config.is_empty() {
        println!("(no config set)");
    } else {
        for (k, v) in &config {
            println!("{k} = {v}");
        }
    }
    Ok(())
}

use sessa_core::Pattern;
use sessa_ingest::{FreshnessGate, Served};
use sessa_store::{SessaConfig, Store};

pub fn execute(
    config: &SessaConfig,
    refresh: bool,
    days: Option<u32>,
    pattern_type: Option<&str>,
    json: bool,
) -> anyhow::Result<()> {
    let served = load(config, refresh, days, pattern_type)?;
    if let Some(stale) = &served.stale {
        eprintln!("warning: {stale}");
    }

    if json {
        let out = serde_json::json!({
            "patterns": served.value,
            "stale": served.stale.as_ref().map(|e| e.to_string()),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }
    if served.value.is_empty() {
        println!("No patterns in the last window.");
        return Ok(());
    }
    print_grouped(&served.value);
    Ok(())
}

/// Freshen the store, rebuild the cache when asked or when it has never
/// been built, then read it.
fn load(
    config: &SessaConfig,
    refresh: bool,
    days: Option<u32>,
    pattern_type: Option<&str>,
) -> anyhow::Result<Served<Vec<Pattern>>> {
    let mut store = Store::open(&config.db_path)?;
    let gate = FreshnessGate::new(
        &config.log_dir,
        config.max_age_secs,
        config.ingest_batch_size,
    );
    let window = days.unwrap_or(config.pattern_window_days);
    let served = gate.read(&mut store, |s| {
        if refresh || s.patterns(None)?.is_empty() {
            let n = s.rebuild_patterns(window)?;
            tracing::info!(patterns = n, window_days = window, "pattern cache rebuilt");
        }
        s.patterns(pattern_type)
    })?;
    Ok(served)
}

fn print_grouped(patterns: &[Pattern]) {
    let mut current: Option<&str> = None;
    for p in patterns {
        if current != Some(p.pattern_type.as_str()) {
            println!("{}:", p.pattern_type);
            current = Some(p.pattern_type.as_str());
        }
        println!("  {:>6}  {}", p.count, p.pattern_key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sessa_core::ts::now_ts;

    fn tool_call(uuid: &str, tool: &str) -> String {
        serde_json::json!({
            "uuid": uuid,
            "sessionId": "s1",
            "timestamp": now_ts(),
            "type": "assistant",
            "message": {"content": [{"type": "tool_use", "id": uuid, "name": tool,
                                     "input": {"command": "cargo test"}}]}
        })
        .to_string()
    }

    fn config_with_logs(tmp: &std::path::Path) -> SessaConfig {
        let mut config = SessaConfig::defaults_for(&tmp.join("data"));
        config.log_dir = tmp.join("logs");
        let dir = config.log_dir.join("-work-proj");
        std::fs::create_dir_all(&dir).unwrap();
        let body = format!("{}\n{}\n", tool_call("a", "Bash"), tool_call("b", "Read"));
        std::fs::write(dir.join("s1.jsonl"), body).unwrap();
        config
    }

    #[test]
    fn first_read_ingests_and_builds_the_cache() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config_with_logs(tmp.path());

        let served = load(&config, false, None, None).unwrap();
        assert!(served.stale.is_none());
        let keys: Vec<&str> = served.value.iter().map(|p| p.pattern_key.as_str()).collect();
        assert!(keys.contains(&"Bash"), "{keys:?}");
        assert!(keys.contains(&"Read"), "{keys:?}");

        let only = load(&config, false, None, Some("tool_frequency")).unwrap();
        assert_eq!(only.value.len(), 2);
    }

    #[test]
    fn unreadable_log_dir_serves_cache_with_warning() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = config_with_logs(tmp.path());
        load(&config, false, None, None).unwrap();

        // force the next read past max age with logs that cannot be walked
        config.max_age_secs = 0;
        config.log_dir = tmp.path().join("logs").join("-work-proj").join("s1.jsonl");
        std::thread::sleep(std::time::Duration::from_millis(1100));
        let served = load(&config, false, None, None).unwrap();
        assert!(served.stale.is_some());
        assert!(!served.value.is_empty());
    }
}

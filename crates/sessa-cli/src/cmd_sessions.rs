use sessa_ingest::FreshnessGate;
use sessa_store::{SessaConfig, Store};

pub fn execute(config: &SessaConfig, limit: usize, json: bool) -> anyhow::Result<()> {
    let mut store = Store::open(&config.db_path)?;
    let gate = FreshnessGate::new(
        &config.log_dir,
        config.max_age_secs,
        config.ingest_batch_size,
    );
    let served = gate.read(&mut store, |s| s.sessions(limit))?;
    if let Some(stale) = &served.stale {
        eprintln!("warning: {stale}");
    }

    if json {
        let out = serde_json::json!({
            "sessions": served.value,
            "stale": served.stale.as_ref().map(|e| e.to_string()),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if served.value.is_empty() {
        println!("No sessions.");
        return Ok(());
    }
    for s in &served.value {
        println!(
            "{}  {}  {} entries, {} tool calls, {} in / {} out tokens{}",
            s.last_seen,
            s.session_id,
            s.entry_count,
            s.tool_call_count,
            s.input_tokens,
            s.output_tokens,
            if s.parse_failures > 0 {
                format!(", {} unparsed", s.parse_failures)
            } else {
                String::new()
            }
        );
        println!("    {}", s.project_path);
    }
    Ok(())
}

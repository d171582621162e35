use sessa_store::{migrate, SessaConfig, Store};
use sessa_sync::PushState;

pub fn execute(config: &SessaConfig, json: bool) -> anyhow::Result<()> {
    let store = Store::open(&config.db_path)?;
    let stats = store.stats()?;
    let dirty = store.dirty_sessions()?.len();
    let push = PushState::load(&config.paths().push_state_json)?;

    if json {
        let out = serde_json::json!({
            "db_path": config.db_path,
            "latest_schema_version": migrate::latest_version(),
            "stats": stats,
            "dirty_sessions": dirty,
            "push": {
                "remote": push.remote,
                "last_push_at": push.last_push_at,
                "sessions": push.sessions.len(),
            },
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("Store: {}", config.db_path.display());
    println!(
        "Schema: v{} (latest v{})",
        stats.schema_version,
        migrate::latest_version()
    );
    println!(
        "Entries: {} raw, {} events, {} sessions",
        stats.raw_entries, stats.events, stats.sessions
    );
    println!("Open parse failures: {}", stats.open_parse_failures);
    println!("Cached patterns: {}", stats.patterns);
    println!(
        "Last ingest: {}",
        stats.last_ingest_at.as_deref().unwrap_or("(never)")
    );
    if dirty > 0 {
        println!("Sessions awaiting finalize: {dirty}");
    }
    match (&push.remote, &push.last_push_at) {
        (Some(remote), Some(at)) => println!("Last push: {at} to {remote}"),
        _ => println!("Last push: (never)"),
    }
    Ok(())
}

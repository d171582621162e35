use sessa_store::{migrate, SessaConfig, Store};

pub fn execute(config: &SessaConfig, json: bool) -> anyhow::Result<()> {
    // Open without migrating so the run below reports what it applied.
    let mut store = Store::open_with_target(&config.db_path, 0)?;
    let applied = store.migrate()?;
    let ledger = store.migrations()?;

    if json {
        let out = serde_json::json!({
            "latest_version": migrate::latest_version(),
            "applied": applied,
            "ledger": ledger,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if applied.is_empty() {
        println!("Schema is up to date (v{}).", store.schema_version()?);
    } else {
        println!("Applied {} migrations.", applied.len());
    }
    for m in &ledger {
        println!("  v{:<3} {:<20} {}", m.version, m.name, m.applied_at);
    }
    Ok(())
}

use sessa_core::ts::{days_ago, normalize_ts};
use sessa_ingest::{ingest, IngestOptions, IngestScope};
use sessa_store::{SessaConfig, Store};

/// Turn the mutually exclusive scope flags into one scope.
pub fn scope(
    days: Option<u32>,
    since: Option<&str>,
    sessions: Vec<String>,
) -> anyhow::Result<IngestScope> {
    if !sessions.is_empty() {
        return Ok(IngestScope::Sessions(sessions));
    }
    if let Some(ts) = since {
        let Some(ts) = normalize_ts(ts) else {
            anyhow::bail!("invalid --since timestamp: {ts} (expected RFC 3339)");
        };
        return Ok(IngestScope::Since(ts));
    }
    Ok(match days {
        Some(n) => IngestScope::Since(days_ago(n)),
        None => IngestScope::All,
    })
}

pub fn execute(
    config: &SessaConfig,
    scope: IngestScope,
    force: bool,
    json: bool,
) -> anyhow::Result<()> {
    let mut store = Store::open(&config.db_path)?;
    let opts = IngestOptions {
        scope,
        force,
        batch_size: config.ingest_batch_size,
    };
    let report = ingest(&mut store, &config.log_dir, &opts)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    println!(
        "Scanned {} lines in {} files ({} skipped)",
        report.scanned, report.files_scanned, report.files_skipped
    );
    println!(
        "New: {} entries, {} events, {} parse failures ({} duplicates)",
        report.new_raw_entries, report.new_events, report.parse_failures, report.duplicates
    );
    if force {
        println!(
            "Re-derived: {} events, {} failures resolved",
            report.rederived, report.resolved_failures
        );
    }
    println!("Sessions touched: {}", report.sessions_touched);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_flag_wins() {
        let s = scope(None, None, vec!["s1".into()]).unwrap();
        assert_eq!(s, IngestScope::Sessions(vec!["s1".into()]));
    }

    #[test]
    fn since_is_normalized() {
        let s = scope(None, Some("2025-03-01T10:00:00+02:00"), vec![]).unwrap();
        assert_eq!(s, IngestScope::Since("2025-03-01T08:00:00.000Z".into()));
        assert!(scope(None, Some("yesterday"), vec![]).is_err());
    }

    #[test]
    fn no_flags_is_everything() {
        assert_eq!(scope(None, None, vec![]).unwrap(), IngestScope::All);
        assert!(matches!(
            scope(Some(3), None, vec![]).unwrap(),
            IngestScope::Since(_)
        ));
    }
}

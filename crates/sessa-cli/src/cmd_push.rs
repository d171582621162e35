use std::path::Path;
use std::time::Duration;

use sessa_store::SessaConfig;
use sessa_sync::{
    acquire_push_lock, push, HttpRemote, LocalRemote, PushOptions, PushReport, PushState,
    SyncError,
};

pub struct PushParams<'a> {
    pub config: &'a SessaConfig,
    pub remote: Option<&'a str>,
    pub target_db: Option<&'a Path>,
    pub batch_size: Option<usize>,
    pub json: bool,
}

pub fn execute(p: &PushParams<'_>) -> anyhow::Result<()> {
    let paths = p.config.paths();
    paths.ensure_layout()?;
    let _lock = acquire_push_lock(&paths.push_lock)?;
    let mut state = PushState::load(&paths.push_state_json)?;
    let opts = PushOptions {
        batch_size: p.batch_size.unwrap_or(p.config.push_batch_size),
        max_attempts: p.config.push_max_attempts,
        ..Default::default()
    };
    let log_dir = &p.config.log_dir;

    let rt = tokio::runtime::Runtime::new()?;
    let report = match (p.target_db, p.remote.or(p.config.remote_url.as_deref())) {
        (Some(db), _) => {
            let remote = LocalRemote::new(db);
            rt.block_on(push(&remote, log_dir, &mut state, &opts))?
        }
        (None, Some(url)) => {
            let timeout = Duration::from_secs(p.config.push_timeout_secs);
            let remote = HttpRemote::new(url, timeout)?;
            rt.block_on(push(&remote, log_dir, &mut state, &opts))?
        }
        (None, None) => return Err(SyncError::NoRemote.into()),
    };

    if p.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

fn print_report(r: &PushReport) {
    println!("Remote: {}", r.remote);
    println!(
        "Sessions: {} local, {} behind the remote",
        r.sessions_local, r.sessions_behind
    );
    if r.batches == 0 {
        println!("Nothing to push.");
        return;
    }
    println!(
        "Pushed {} entries in {} batches: {} accepted, {} duplicates, {} parse failures",
        r.selected, r.batches, r.accepted, r.duplicates, r.parse_failures
    );
    if let Some(f) = &r.finalize {
        println!(
            "Finalized: {} sessions refreshed, {} patterns",
            f.sessions_refreshed, f.patterns
        );
    }
}

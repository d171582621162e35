use std::path::{Path, PathBuf};

use rusqlite::{params, Connection};
use sessa_ingest::{ingest, IngestOptions, IngestScope};
use sessa_store::{EventFilter, Store};

fn entry(uuid: &str, session: &str, ts: &str) -> String {
    serde_json::json!({
        "uuid": uuid,
        "sessionId": session,
        "timestamp": ts,
        "type": "assistant",
        "gitBranch": "main",
        "cwd": "/work/proj",
        "message": {
            "model": "claude-sonnet-4",
            "usage": {"input_tokens": 3, "output_tokens": 2},
            "content": [{"type": "tool_use", "id": format!("t-{uuid}"), "name": "Bash",
                         "input": {"command": "ls -la"}}]
        }
    })
    .to_string()
}

fn write_log(root: &Path, project: &str, session: &str, lines: &[String]) -> PathBuf {
    let dir = root.join(project);
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(format!("{session}.jsonl"));
    let body: String = lines.iter().map(|l| format!("{l}\n")).collect();
    std::fs::write(&path, body).unwrap();
    path
}

fn count(db: &Path, table: &str) -> i64 {
    let conn = Connection::open(db).unwrap();
    conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))
        .unwrap()
}

#[test]
fn second_ingest_of_unchanged_source_adds_nothing() {
    let tmp = tempfile::tempdir().unwrap();
    let logs = tmp.path().join("logs");
    let lines: Vec<String> = (0..5)
        .map(|i| entry(&format!("u{i}"), "s1", &format!("2025-03-01T10:0{i}:00Z")))
        .collect();
    write_log(&logs, "-work-proj", "s1", &lines);
    let mut store = Store::open(&tmp.path().join("sessa.db")).unwrap();

    let first = ingest(&mut store, &logs, &IngestOptions::default()).unwrap();
    assert_eq!(first.new_raw_entries, 5);
    assert_eq!(first.new_events, 5);

    let second = ingest(&mut store, &logs, &IngestOptions::default()).unwrap();
    assert_eq!(second.new_raw_entries, 0);
    assert_eq!(second.new_events, 0);

    // Even a full forced rescan only re-derives; it never duplicates.
    let forced = ingest(
        &mut store,
        &logs,
        &IngestOptions {
            force: true,
            ..Default::default()
        },
    )
    .unwrap();
    assert_eq!(forced.new_raw_entries, 0);
    assert_eq!(forced.duplicates, 5);
    assert_eq!(forced.rederived, 5);
    assert_eq!(store.stats().unwrap().raw_entries, 5);
}

#[test]
fn repeated_uuids_across_files_store_one_row_each() {
    let tmp = tempfile::tempdir().unwrap();
    let logs = tmp.path().join("logs");
    let a = entry("shared-1", "s1", "2025-03-01T10:00:00Z");
    let b = entry("shared-2", "s1", "2025-03-01T10:01:00Z");
    let c = entry("only-3", "s1", "2025-03-01T10:02:00Z");
    write_log(&logs, "-p1", "s1", &[a.clone(), b.clone(), a.clone()]);
    // An overlapping copy, as left behind by a resumed session.
    write_log(&logs, "-p1", "s1-copy", &[b, a, c]);
    let db = tmp.path().join("sessa.db");
    let mut store = Store::open(&db).unwrap();

    let report = ingest(&mut store, &logs, &IngestOptions::default()).unwrap();
    assert_eq!(report.scanned, 6);
    assert_eq!(report.new_raw_entries, 3);
    assert_eq!(report.duplicates, 3);
    drop(store);
    assert_eq!(count(&db, "raw_entries"), 3);
    assert_eq!(count(&db, "events"), 3);
}

#[test]
fn one_malformed_line_in_ten_is_isolated() {
    let tmp = tempfile::tempdir().unwrap();
    let logs = tmp.path().join("logs");
    let mut lines: Vec<String> = (0..9)
        .map(|i| entry(&format!("g{i}"), "s1", "2025-03-01T10:00:00Z"))
        .collect();
    lines.insert(4, r#"{"uuid":"broken","sessionId":"s1","type":"assis"#.to_string());
    write_log(&logs, "-p", "s1", &lines);
    let mut store = Store::open(&tmp.path().join("sessa.db")).unwrap();

    let report = ingest(&mut store, &logs, &IngestOptions::default()).unwrap();
    assert_eq!(report.new_raw_entries, 10);
    assert_eq!(report.new_events, 9);
    assert_eq!(report.parse_failures, 1);

    let session = store.session("s1").unwrap().unwrap();
    assert_eq!(session.entry_count, 10);
    assert_eq!(session.event_count, 9);
    assert_eq!(session.parse_failures, 1);
    let failures = store.parse_failures(10).unwrap();
    assert_eq!(failures.len(), 1);
    assert!(failures[0].line.contains("assis"));
}

#[test]
fn forced_ingest_backfills_fields_added_by_migration() {
    let tmp = tempfile::tempdir().unwrap();
    let logs = tmp.path().join("logs");
    std::fs::create_dir_all(&logs).unwrap();
    let db = tmp.path().join("sessa.db");

    // A store created before the git_branch/cwd columns existed.
    drop(Store::open_with_target(&db, 5).unwrap());
    {
        let conn = Connection::open(&db).unwrap();
        for i in 0..3 {
            let uuid = format!("old{i}");
            let raw = entry(&uuid, "s-old", "2025-02-01T00:00:00Z");
            conn.execute(
                "INSERT INTO raw_entries VALUES (?1, 's-old', '-p', ?2, '2025-02-01T00:00:00.000Z', '2025-02-01T00:00:00.000Z')",
                params![uuid, raw],
            )
            .unwrap();
            conn.execute(
                "INSERT INTO events (uuid, session_id, project_path, kind, timestamp, tool_name, command)
                 VALUES (?1, 's-old', '-p', 'tool_call', '2025-02-01T00:00:00.000Z', 'Bash', 'ls')",
                params![uuid],
            )
            .unwrap();
        }
    }

    let mut store = Store::open(&db).unwrap();
    let before = store.events(&EventFilter::new()).unwrap();
    assert_eq!(before.len(), 3);
    assert!(before.iter().all(|e| e.git_branch.is_none()));

    let report = ingest(
        &mut store,
        &logs,
        &IngestOptions {
            force: true,
            ..Default::default()
        },
    )
    .unwrap();
    assert_eq!(report.rederived, 3);
    assert_eq!(report.new_raw_entries, 0);

    let after = store.events(&EventFilter::new()).unwrap();
    assert!(after
        .iter()
        .all(|e| e.git_branch.as_deref() == Some("main") && e.cwd.as_deref() == Some("/work/proj")));
    assert!(after.iter().all(|e| e.model.as_deref() == Some("claude-sonnet-4")));
    assert_eq!(store.stats().unwrap().raw_entries, 3);
    assert_eq!(store.session("s-old").unwrap().unwrap().event_count, 3);
}

#[test]
fn forced_session_scope_touches_only_that_session() {
    let tmp = tempfile::tempdir().unwrap();
    let logs = tmp.path().join("logs");
    write_log(&logs, "-p", "s1", &[entry("a", "s1", "2025-03-01T10:00:00Z")]);
    write_log(&logs, "-p", "s2", &[entry("b", "s2", "2025-03-01T10:00:00Z")]);
    let mut store = Store::open(&tmp.path().join("sessa.db")).unwrap();
    ingest(&mut store, &logs, &IngestOptions::default()).unwrap();

    let report = ingest(
        &mut store,
        &logs,
        &IngestOptions {
            scope: IngestScope::Sessions(vec!["s2".into()]),
            force: true,
            ..Default::default()
        },
    )
    .unwrap();
    assert_eq!(report.rederived, 1);
    assert_eq!(report.sessions_touched, 1);
}

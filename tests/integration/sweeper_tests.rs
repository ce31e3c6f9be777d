use activebrain::codec;
use activebrain::config::Config;
use activebrain::error::SessionError;
use activebrain::results::{ResultBatch, ResultRow};
use activebrain::service::SessionService;
use activebrain::session::{Session, SessionId};
use activebrain::signal::ShutdownHandler;
use activebrain::store::{Collection, SessionDb};
use activebrain::sweeper::ExpirySweeper;
use chrono::{TimeZone, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::tempdir;

fn config(dir: &Path) -> Config {
    Config {
        database_path: dir.join("sessions.db"),
        output_dir: dir.join("out"),
        ..Config::default()
    }
}

fn csv_files(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = entries
        .map(|e| e.unwrap().path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "csv"))
        .collect();
    files.sort();
    files
}

#[test]
fn test_flush_writes_aligned_csv() {
    let dir = tempdir().unwrap();
    let config = config(dir.path());
    let service = SessionService::open(&config).unwrap();
    let session = service.create_session("alice").unwrap();
    service
        .append_results(
            &session.id,
            vec![
                ResultRow::new().with("x", 1).with("y", 2).with("task", "demo"),
                ResultRow::new().with("x", 3),
            ],
        )
        .unwrap();
    let expired = service.expire_session(&session).unwrap();

    let report = service.sweep_now().unwrap();
    assert_eq!(report.scanned, 1);
    assert_eq!(report.flushed, 1);

    let files = csv_files(&config.output_dir);
    assert_eq!(files.len(), 1);
    let name = files[0].file_name().unwrap().to_string_lossy().to_string();
    assert_eq!(
        name,
        format!(
            "{}-alice-01-demo.csv",
            expired.expiration.format("%Y%m%dT%H%M%S")
        )
    );
    assert_eq!(fs::read_to_string(&files[0]).unwrap(), "x,y\n1,2\n3,\n");

    assert!(matches!(
        service.get_results(&session.id).unwrap_err(),
        SessionError::NotFound(_)
    ));
}

/// Stores an already expired session with one result row.
fn store_expired(db: &SessionDb, key: &str, user: &str, sequence: u32) {
    let session = Session {
        id: SessionId::from(key),
        user: user.to_string(),
        expiration: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
        sequence_num: sequence,
        task_count: 1,
    };
    let mut batch = ResultBatch::new();
    batch.append_rows(vec![ResultRow::new().with("i", 1).with("who", key)]);
    let session_bytes = codec::encode_session(&session).unwrap();
    let batch_bytes = codec::encode_results(&batch).unwrap();
    db.update(|txn| {
        txn.put(Collection::Sessions, key, &session_bytes)?;
        txn.put(Collection::Results, key, &batch_bytes)
    })
    .unwrap();
}

#[test]
fn test_colliding_names_each_get_their_own_file() {
    let dir = tempdir().unwrap();
    let out = dir.path().join("out");
    let db = Arc::new(SessionDb::open_in_memory().unwrap());
    // Same sanitized user, same sequence, same expiration.
    store_expired(&db, "20260101-张三-00001", "张三", 1);
    store_expired(&db, "20260101-李四-00001", "李四", 1);
    // Daily numbering restarted for the same user.
    store_expired(&db, "20251231-alice-00001", "alice", 1);
    store_expired(&db, "20260101-alice-00001", "alice", 1);

    let report = ExpirySweeper::new(db, &out).sweep_once().unwrap();
    assert_eq!(report.flushed, 4);

    let files = csv_files(&out);
    assert_eq!(files.len(), 4);
    let mut owners: Vec<String> = files
        .iter()
        .map(|f| {
            let content = fs::read_to_string(f).unwrap();
            content.lines().nth(1).unwrap().trim_start_matches("1,").to_string()
        })
        .collect();
    owners.sort();
    assert_eq!(
        owners,
        vec![
            "20251231-alice-00001",
            "20260101-alice-00001",
            "20260101-张三-00001",
            "20260101-李四-00001",
        ]
    );
}

#[test]
fn test_sweep_handles_corrupt_and_expired_together() {
    let dir = tempdir().unwrap();
    let config = Config {
        token_expiry_secs: 3600,
        ..config(dir.path())
    };
    let db = Arc::new(SessionDb::open(&config.database_path).unwrap());
    let service = SessionService::with_db(Arc::clone(&db), &config);

    let live = service.create_session("live").unwrap();
    let gone = service.create_session("gone").unwrap();
    service
        .append_results(&gone.id, vec![ResultRow::new().with("score", 7)])
        .unwrap();
    service.expire_session(&gone).unwrap();
    let empty = service.create_session("empty").unwrap();
    service.expire_session(&empty).unwrap();

    db.update(|txn| {
        txn.put(Collection::Sessions, "20261017-broken-00001", b"\xff\xfe")?;
        txn.put(Collection::Results, "20261017-broken-00001", b"[]")
    })
    .unwrap();

    let report = service.sweep_now().unwrap();
    assert_eq!(report.scanned, 4);
    assert_eq!(report.live, 1);
    assert_eq!(report.flushed, 1);
    assert_eq!(report.removed_empty, 1);
    assert_eq!(report.corrupt, 1);
    assert_eq!(report.failed, 0);

    let remaining = db.view(|txn| txn.keys(Collection::Sessions)).unwrap();
    assert_eq!(remaining, vec![live.id.to_string()]);
    assert_eq!(db.view(|txn| txn.count(Collection::Results)).unwrap(), 0);
    assert_eq!(csv_files(&config.output_dir).len(), 1);
}

#[test]
fn test_corrupt_results_of_expired_session_are_dropped() {
    let dir = tempdir().unwrap();
    let config = config(dir.path());
    let db = Arc::new(SessionDb::open(&config.database_path).unwrap());
    let service = SessionService::with_db(Arc::clone(&db), &config);
    let session = service.create_session("hank").unwrap();
    service.expire_session(&session).unwrap();
    db.update(|txn| txn.put(Collection::Results, session.id.as_str(), b"garbage"))
        .unwrap();

    let report = service.sweep_now().unwrap();
    assert_eq!(report.corrupt, 1);
    assert_eq!(db.view(|txn| txn.count(Collection::Sessions)).unwrap(), 0);
    assert!(csv_files(&config.output_dir).is_empty());
}

#[test]
fn test_failed_write_keeps_records_for_retry() {
    let dir = tempdir().unwrap();
    let config = config(dir.path());
    fs::write(&config.output_dir, "not a directory").unwrap();

    let service = SessionService::open(&config).unwrap();
    let session = service.create_session("ivy").unwrap();
    service
        .append_results(&session.id, vec![ResultRow::new().with("x", 1)])
        .unwrap();
    service.expire_session(&session).unwrap();

    let report = service.sweep_now().unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.flushed, 0);
    assert!(matches!(
        service.get_session(&session.id).unwrap_err(),
        SessionError::Expired(_)
    ));
    assert_eq!(service.get_results(&session.id).unwrap().rows.len(), 1);

    fs::remove_file(&config.output_dir).unwrap();
    let report = service.sweep_now().unwrap();
    assert_eq!(report.flushed, 1);
    assert_eq!(csv_files(&config.output_dir).len(), 1);
}

#[test]
fn test_logout_triggers_exactly_one_background_flush() {
    let dir = tempdir().unwrap();
    let config = Config {
        sweep_interval_secs: Some(3600),
        ..config(dir.path())
    };
    let mut service = SessionService::open(&config).unwrap();
    let session = service.create_session("jack").unwrap();
    service
        .append_results(&session.id, vec![ResultRow::new().with("x", 1)])
        .unwrap();

    assert!(service.start_sweeper(ShutdownHandler::new()).unwrap());
    assert!(service.is_sweeper_running());
    service.expire_session(&session).unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    while csv_files(&config.output_dir).is_empty() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(20));
    }
    // Give a duplicate flush, if any, time to show up.
    thread::sleep(Duration::from_millis(200));

    assert_eq!(csv_files(&config.output_dir).len(), 1);
    assert!(matches!(
        service.get_session(&session.id).unwrap_err(),
        SessionError::NotFound(_)
    ));
    service.close().unwrap();
}

#[test]
fn test_sweeper_stops_on_shutdown_flag() {
    let dir = tempdir().unwrap();
    let db = Arc::new(SessionDb::open_in_memory().unwrap());
    let (signal, receiver) = activebrain::sweeper::flush_channel();
    let shutdown = ShutdownHandler::new();
    let handle = ExpirySweeper::new(db, dir.path())
        .spawn(Duration::from_millis(10), receiver, shutdown.clone())
        .unwrap();

    shutdown.request_shutdown();
    signal.request();
    let deadline = Instant::now() + Duration::from_secs(10);
    while handle.is_running() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert!(!handle.is_running());
}

use activebrain::codec;
use activebrain::config::Config;
use activebrain::error::SessionError;
use activebrain::results::ResultRow;
use activebrain::service::SessionService;
use activebrain::session::{SessionEntry, SessionId};
use activebrain::store::{Collection, SessionDb};
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;
use tempfile::tempdir;

fn open(dir: &Path) -> (Arc<SessionDb>, SessionService) {
    let config = Config {
        database_path: dir.join("sessions.db"),
        output_dir: dir.join("out"),
        ..Config::default()
    };
    let db = Arc::new(SessionDb::open(&config.database_path).unwrap());
    let service = SessionService::with_db(Arc::clone(&db), &config);
    (db, service)
}

fn envelope(kind: &str, version: u32, payload: &str) -> Vec<u8> {
    let checksum = format!("{:x}", Sha256::digest(payload.as_bytes()));
    serde_json::to_vec(&serde_json::json!({
        "kind": kind,
        "version": version,
        "checksum": checksum,
        "payload": payload,
    }))
    .unwrap()
}

#[test]
fn test_tampered_session_is_corrupt_not_missing() {
    let dir = tempdir().unwrap();
    let (db, service) = open(dir.path());
    let session = service.create_session("alice").unwrap();

    let stored = db
        .view(|txn| txn.get(Collection::Sessions, session.id.as_str()))
        .unwrap()
        .unwrap();
    let tampered = String::from_utf8(stored)
        .unwrap()
        .replace("\\\"task_count\\\":0", "\\\"task_count\\\":9");
    db.update(|txn| txn.put(Collection::Sessions, session.id.as_str(), tampered.as_bytes()))
        .unwrap();

    let err = service.get_session(&session.id).unwrap_err();
    assert!(matches!(err, SessionError::Corrupt { .. }));
    assert!(err.to_string().contains("integrity check failed"));
}

#[test]
fn test_empty_and_unknown_version_records_are_corrupt() {
    let dir = tempdir().unwrap();
    let (db, service) = open(dir.path());
    db.update(|txn| {
        txn.put(Collection::Sessions, "20261017-empty-00001", b"")?;
        txn.put(
            Collection::Sessions,
            "20261017-future-00001",
            &envelope("session", 999, "{}"),
        )
    })
    .unwrap();

    let err = service
        .get_session(&SessionId::from("20261017-empty-00001"))
        .unwrap_err();
    assert!(matches!(err, SessionError::Corrupt { .. }));

    let err = service
        .get_session(&SessionId::from("20261017-future-00001"))
        .unwrap_err();
    assert!(err.to_string().contains("999"));

    let corrupt = service
        .list_sessions()
        .unwrap()
        .into_iter()
        .filter(|e| matches!(e, SessionEntry::Corrupt { .. }))
        .count();
    assert_eq!(corrupt, 2);

    assert_eq!(service.sweep_now().unwrap().corrupt, 2);
    assert!(service.list_sessions().unwrap().is_empty());
}

#[test]
fn test_sparse_record_without_id_is_readable() {
    let dir = tempdir().unwrap();
    let (db, service) = open(dir.path());
    let id = SessionId::compose(Utc::now().date_naive(), "legacy", 3);
    let key = id.as_str();
    let payload = r#"{"user":"legacy","expiration":"2999-01-01T00:00:00Z","sequence_num":3,"browser":"lynx"}"#;
    db.update(|txn| txn.put(Collection::Sessions, key, &envelope("session", 1, payload)))
        .unwrap();

    let session = service.get_session(&id).unwrap();
    assert_eq!(session.id.as_str(), key);
    assert_eq!(session.user, "legacy");
    assert_eq!(session.sequence_num, 3);
    assert_eq!(session.task_count, 0);

    // Numbering continues above the hand-written record.
    assert_eq!(service.create_session("legacy").unwrap().sequence_num, 4);
}

#[test]
fn test_result_batch_in_session_slot_is_wrong_kind() {
    let dir = tempdir().unwrap();
    let (db, service) = open(dir.path());
    let session = service.create_session("bob").unwrap();
    service
        .append_results(&session.id, vec![ResultRow::new().with("x", 1)])
        .unwrap();

    let batch = service.get_results(&session.id).unwrap();
    let bytes = codec::encode_results(&batch).unwrap();
    db.update(|txn| txn.put(Collection::Sessions, session.id.as_str(), &bytes))
        .unwrap();

    let err = service.get_session(&session.id).unwrap_err();
    assert!(err.to_string().contains("expected a session record"));
}

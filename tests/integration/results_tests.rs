use activebrain::config::Config;
use activebrain::error::SessionError;
use activebrain::results::{ResultRow, ResultSubmission};
use activebrain::service::SessionService;
use activebrain::session::SessionId;
use activebrain::store::Collection;
use serde_json::json;
use std::path::Path;
use tempfile::tempdir;

fn config(dir: &Path) -> Config {
    Config {
        database_path: dir.join("sessions.db"),
        output_dir: dir.join("out"),
        ..Config::default()
    }
}

#[test]
fn test_schema_grows_across_appends() {
    let dir = tempdir().unwrap();
    let service = SessionService::open(&config(dir.path())).unwrap();
    let session = service.create_session("alice").unwrap();

    service
        .append_results(
            &session.id,
            vec![ResultRow::new().with("trial", 1).with("rt", 512)],
        )
        .unwrap();
    service
        .append_results(
            &session.id,
            vec![
                ResultRow::new().with("trial", 2).with("correct", true),
                ResultRow::new().with("trial", 3).with("note", json!(null)),
            ],
        )
        .unwrap();

    let batch = service.get_results(&session.id).unwrap();
    assert_eq!(batch.header(), vec!["correct", "note", "rt", "trial"]);
    let trials: Vec<String> = batch.rows.iter().map(|r| r.cell("trial")).collect();
    assert_eq!(trials, vec!["1", "2", "3"]);
    assert_eq!(batch.rows[1].cell("correct"), "true");
    assert_eq!(batch.rows[2].cell("note"), "");
    assert_eq!(batch.rows[0].cell("correct"), "");
}

#[test]
fn test_task_field_any_case_is_lifted_out() {
    let dir = tempdir().unwrap();
    let service = SessionService::open(&config(dir.path())).unwrap();
    let session = service.create_session("bob").unwrap();

    service
        .append_results(
            &session.id,
            vec![ResultRow::new().with("Task", "stroop").with("rt", 400)],
        )
        .unwrap();
    service
        .append_results(
            &session.id,
            vec![ResultRow::new().with("task", "other").with("rt", 380)],
        )
        .unwrap();

    let batch = service.get_results(&session.id).unwrap();
    assert_eq!(batch.task.as_deref(), Some("stroop"));
    assert_eq!(batch.header(), vec!["rt"]);
}

#[test]
fn test_portal_submission_body() {
    let dir = tempdir().unwrap();
    let service = SessionService::open(&config(dir.path())).unwrap();
    let session = service.create_session("carol").unwrap();

    let body = r#"{
        "Header": {"task": "nback", "browser": "firefox"},
        "Data": [{"level": 2, "hit": 1}, {"level": 2, "hit": 0, "extra": [1, 2]}]
    }"#;
    let submission: ResultSubmission = serde_json::from_str(body).unwrap();
    let outcome = service.append_submission(&session.id, submission).unwrap();
    assert_eq!(outcome.appended, 2);

    let batch = service.get_results(&session.id).unwrap();
    assert_eq!(batch.task.as_deref(), Some("nback"));
    assert_eq!(batch.header(), vec!["extra", "hit", "level"]);
    assert_eq!(batch.rows[1].cell("extra"), "[1,2]");
}

#[test]
fn test_append_rejects_missing_and_expired_sessions() {
    let dir = tempdir().unwrap();
    let service = SessionService::open(&config(dir.path())).unwrap();

    let err = service
        .append_results(&SessionId::from("20261017-ghost-00001"), vec![ResultRow::new()])
        .unwrap_err();
    assert!(matches!(err, SessionError::NotFound(_)));

    let session = service.create_session("dave").unwrap();
    service.expire_session(&session).unwrap();
    let err = service
        .append_results(&session.id, vec![ResultRow::new().with("x", 1)])
        .unwrap_err();
    assert!(matches!(err, SessionError::Expired(_)));
}

#[test]
fn test_append_to_corrupt_session_fails() {
    let dir = tempdir().unwrap();
    let config = config(dir.path());
    let db = std::sync::Arc::new(activebrain::store::SessionDb::open(&config.database_path).unwrap());
    let service = SessionService::with_db(std::sync::Arc::clone(&db), &config);
    let session = service.create_session("erin").unwrap();
    db.update(|txn| txn.put(Collection::Sessions, session.id.as_str(), b"{not json"))
        .unwrap();

    let err = service
        .append_results(&session.id, vec![ResultRow::new()])
        .unwrap_err();
    assert!(matches!(
        err,
        SessionError::Corrupt {
            collection: Collection::Sessions,
            ..
        }
    ));
}

#[test]
fn test_task_quota_expires_session() {
    let dir = tempdir().unwrap();
    let config = Config {
        max_tasks_per_session: Some(2),
        ..config(dir.path())
    };
    let service = SessionService::open(&config).unwrap();
    let session = service.create_session("frank").unwrap();

    let first = service
        .append_results(&session.id, vec![ResultRow::new().with("x", 1)])
        .unwrap();
    assert_eq!(first.task_count, 1);
    assert!(!first.quota_reached);

    let second = service
        .append_results(&session.id, vec![ResultRow::new().with("x", 2)])
        .unwrap();
    assert!(second.quota_reached);
    assert!(matches!(
        service.get_session(&session.id).unwrap_err(),
        SessionError::Expired(_)
    ));

    let report = service.sweep_now().unwrap();
    assert_eq!(report.flushed, 1);
}

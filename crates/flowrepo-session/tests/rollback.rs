//! Rollback, explicit and automatic.

mod common;

use std::time::Duration;

use common::{config, conn, consume, ingest, open};
use flowrepo_content::{ClaimStore, ContentError};
use flowrepo_core::ConnectionConfig;
use flowrepo_queue::{FlowFileQueue, QueueError};
use flowrepo_session::{FlowRepository, ProcessSession, SessionError, SessionState};
use tempfile::TempDir;

#[test]
fn test_rollback_restores_order_and_state() {
    let dir = TempDir::new().unwrap();
    let repo = open(&dir, &["q", "out"]);
    let created = ingest(&repo, "q", &[b"1", b"2", b"3", b"4", b"5"]);

    let mut session = repo.session();
    let polled = session.get(&conn("q"), 3).unwrap();
    assert_eq!(polled.len(), 3);
    for ff in &polled {
        let ff = session.put_attribute(ff, "touched", "yes").unwrap();
        session.transfer(&ff, &conn("out")).unwrap();
    }
    let size = repo.connection(&conn("q")).unwrap().size();
    assert_eq!(size.in_flight_count, 3);
    session.rollback().unwrap();
    assert_eq!(session.state(), SessionState::RolledBack);

    let size = repo.connection(&conn("q")).unwrap().size();
    assert_eq!(size.in_flight_count, 0);
    assert_eq!(size.active_count, 5);
    assert_eq!(repo.connection(&conn("out")).unwrap().size().object_count(), 0);

    let mut session = repo.session();
    let again = session.get(&conn("q"), 5).unwrap();
    let ids: Vec<_> = again.iter().map(|ff| ff.id).collect();
    let expected: Vec<_> = created.iter().map(|ff| ff.id).collect();
    assert_eq!(ids, expected);
    assert!(again.iter().all(|ff| ff.attribute("touched").is_none()));
    session.rollback().unwrap();
}

#[test]
fn test_rollback_releases_staged_content() {
    let dir = TempDir::new().unwrap();
    let repo = open(&dir, &["q"]);
    let original = ingest(&repo, "q", &[b"original"]).remove(0);
    let original_claim = original.claim.unwrap();

    let mut session = repo.session();
    let ff = session.get_one(&conn("q")).unwrap().unwrap();
    let rewritten = session.write(&ff, b"replacement").unwrap();
    let copy = session.clone_flowfile(&rewritten).unwrap();
    let new_claim = rewritten.claim.unwrap();
    assert_eq!(copy.claim, Some(new_claim));
    assert_eq!(repo.content().claimant_count(&new_claim), 2);
    session.rollback().unwrap();

    assert_eq!(repo.content().claimant_count(&new_claim), 0);
    assert_eq!(repo.content().claimant_count(&original_claim), 1);
    assert_eq!(consume(&repo, "q"), vec![b"original".to_vec()]);
}

#[test]
fn test_rollback_with_penalty() {
    let dir = TempDir::new().unwrap();
    let repo = open(&dir, &["q"]);
    ingest(&repo, "q", &[b"retry me"]);

    let mut session = repo.session();
    session.get_one(&conn("q")).unwrap().unwrap();
    session.rollback_with_penalty(Duration::from_secs(60)).unwrap();

    let size = repo.connection(&conn("q")).unwrap().size();
    assert_eq!(size.penalized_count, 1);
    let mut session = repo.session();
    assert!(session.get_one(&conn("q")).unwrap().is_none());
    session.rollback().unwrap();
}

#[test]
fn test_queue_full_at_commit_rolls_back() {
    let dir = TempDir::new().unwrap();
    let mut config = config(&dir, &["in"]);
    let mut narrow = ConnectionConfig::new("narrow");
    narrow.hard_object_limit = Some(1);
    config.connections.push(narrow);
    let repo = FlowRepository::open(config).unwrap();
    ingest(&repo, "in", &[b"a", b"b"]);

    let mut session = repo.session();
    for ff in session.get(&conn("in"), 2).unwrap() {
        session.transfer(&ff, &conn("narrow")).unwrap();
    }
    let err = session.commit().unwrap_err();
    assert!(matches!(err, SessionError::Queue(QueueError::QueueFull { .. })));
    assert!(err.is_retryable());
    assert_eq!(session.state(), SessionState::RolledBack);

    let input = repo.connection(&conn("in")).unwrap().size();
    assert_eq!(input.active_count, 2);
    assert_eq!(input.in_flight_count, 0);
    let narrow = repo.connection(&conn("narrow")).unwrap().size();
    assert!(narrow.is_empty());
    assert_eq!(repo.ledger().stats().live_flowfiles, 2);
}

#[test]
fn test_missing_content_rolls_back() {
    let dir = TempDir::new().unwrap();
    let repo = open(&dir, &["q"]);
    let ff = ingest(&repo, "q", &[b"doomed"]).remove(0);
    repo.content().close().unwrap();
    std::fs::remove_file(repo.content().path_of(&ff.claim.unwrap())).unwrap();

    let mut session = repo.session();
    let polled = session.get_one(&conn("q")).unwrap().unwrap();
    let err = session.read_all(&polled).unwrap_err();
    assert!(matches!(
        err,
        SessionError::Content(ContentError::ContentMissing { .. })
    ));
    assert!(!err.is_retryable());
    assert_eq!(session.state(), SessionState::RolledBack);
    assert!(matches!(
        session.remove(&polled),
        Err(SessionError::SessionProtocolViolation(_))
    ));
    assert_eq!(repo.connection(&conn("q")).unwrap().size().active_count, 1);
}

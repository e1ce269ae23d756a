//! Back-pressure thresholds and hard ceilings.

mod common;

use common::{config, conn, ingest};
use flowrepo_content::ClaimStore;
use flowrepo_core::ConnectionConfig;
use flowrepo_queue::FlowFileQueue;
use flowrepo_session::{FlowRepository, ProcessSession};
use tempfile::TempDir;

#[test]
fn test_object_threshold() {
    let dir = TempDir::new().unwrap();
    let mut config = config(&dir, &[]);
    let mut q = ConnectionConfig::new("q");
    q.backpressure_object_threshold = Some(3);
    config.connections.push(q);
    let repo = FlowRepository::open(config).unwrap();
    let queue = repo.connection(&conn("q")).unwrap();

    ingest(&repo, "q", &[b"1", b"2"]);
    assert!(!queue.is_full());
    ingest(&repo, "q", &[b"3"]);
    assert!(queue.is_full());

    // Thresholds are advisory: committing past them still works.
    ingest(&repo, "q", &[b"4"]);
    assert_eq!(queue.size().object_count(), 4);

    // In-flight FlowFiles do not count.
    let mut session = repo.session();
    session.get(&conn("q"), 2).unwrap();
    assert!(!queue.is_full());
    session.rollback().unwrap();
    assert!(queue.is_full());
}

#[test]
fn test_data_size_threshold() {
    let dir = TempDir::new().unwrap();
    let mut config = config(&dir, &[]);
    let mut q = ConnectionConfig::new("q");
    q.backpressure_data_size_threshold = Some(100);
    config.connections.push(q);
    let repo = FlowRepository::open(config).unwrap();
    let queue = repo.connection(&conn("q")).unwrap();

    ingest(&repo, "q", &[&[0u8; 60]]);
    assert!(!queue.is_full());
    ingest(&repo, "q", &[&[0u8; 40]]);
    assert!(queue.is_full());
    assert_eq!(queue.size().byte_count(), 100);
}

#[test]
fn test_hard_ceiling_rejects_whole_session() {
    let dir = TempDir::new().unwrap();
    let mut config = config(&dir, &["other"]);
    let mut q = ConnectionConfig::new("q");
    q.hard_data_size_limit = Some(10);
    config.connections.push(q);
    let repo = FlowRepository::open(config).unwrap();

    let mut session = repo.session();
    let small = session.create().unwrap();
    let small = session.write(&small, b"1234").unwrap();
    session.transfer(&small, &conn("other")).unwrap();
    let big = session.create().unwrap();
    let big = session.write(&big, b"0123456789AB").unwrap();
    session.transfer(&big, &conn("q")).unwrap();
    assert!(session.commit().is_err());

    // Nothing from the session landed anywhere.
    assert!(repo.connection(&conn("other")).unwrap().size().is_empty());
    assert!(repo.connection(&conn("q")).unwrap().size().is_empty());
    assert_eq!(repo.ledger().stats().live_flowfiles, 0);
    assert_eq!(repo.content().claimant_count(&small.claim.unwrap()), 0);
}

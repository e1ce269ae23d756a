//! Restart behaviour. A "crash" drops the repository without `shutdown`, so
//! nothing is checkpointed and only synced ledger batches survive.

mod common;

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use common::{config, conn, consume, ingest, open};
use flowrepo_content::ClaimStore;
use flowrepo_queue::{FlowFileQueue, QueueError};
use flowrepo_session::{FlowRepository, ProcessSession, SessionError};
use tempfile::TempDir;

fn ledger_logs(dir: &TempDir) -> Vec<PathBuf> {
    let mut logs = Vec::new();
    for partition in fs::read_dir(dir.path().join("ledger")).unwrap() {
        let partition = partition.unwrap().path();
        if !partition.is_dir() {
            continue;
        }
        for log in fs::read_dir(&partition).unwrap() {
            logs.push(log.unwrap().path());
        }
    }
    logs.sort();
    logs
}

#[test]
fn test_committed_work_survives_crash() {
    let dir = TempDir::new().unwrap();
    let created = {
        let repo = open(&dir, &["q"]);
        ingest(&repo, "q", &[b"one", b"two", b"three"])
    };

    let repo = open(&dir, &["q"]);
    assert_eq!(repo.connection(&conn("q")).unwrap().size().object_count(), 3);
    for ff in &created {
        assert_eq!(repo.content().claimant_count(&ff.claim.unwrap()), 1);
    }
    assert_eq!(
        consume(&repo, "q"),
        vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]
    );
}

#[test]
fn test_uncommitted_session_is_invisible_after_crash() {
    let dir = TempDir::new().unwrap();
    let mut config = config(&dir, &["in", "out"]);
    config.content.max_container_size = 1;
    let (original, orphan_path) = {
        let repo = FlowRepository::open(config.clone()).unwrap();
        let original = ingest(&repo, "in", &[b"committed"]).remove(0);

        let mut session = repo.session();
        let ff = session.get_one(&conn("in")).unwrap().unwrap();
        let ff = session.write(&ff, b"never committed").unwrap();
        session.transfer(&ff, &conn("out")).unwrap();
        let orphan_path = repo.content().path_of(&ff.claim.unwrap());
        assert!(orphan_path.exists());
        // Crash before the ledger append: the session never ends.
        std::mem::forget(session);
        (original, orphan_path)
    };

    let repo = FlowRepository::open(config).unwrap();
    assert!(!orphan_path.exists(), "orphaned container should be removed");
    assert_eq!(repo.connection(&conn("out")).unwrap().size().object_count(), 0);
    let mut session = repo.session();
    let ff = session.get_one(&conn("in")).unwrap().unwrap();
    assert_eq!(ff.id, original.id);
    assert_eq!(ff.claim, original.claim);
    assert_eq!(session.read_all(&ff).unwrap(), b"committed");
    session.rollback().unwrap();
}

#[test]
fn test_torn_ledger_tail_is_truncated() {
    let dir = TempDir::new().unwrap();
    {
        let repo = open(&dir, &["q"]);
        ingest(&repo, "q", &[b"kept"]);
    }
    let logs = ledger_logs(&dir);
    let newest = logs
        .iter()
        .max_by_key(|p| fs::metadata(p).unwrap().len())
        .unwrap()
        .clone();
    let before = fs::metadata(&newest).unwrap().len();
    let mut file = OpenOptions::new().append(true).open(&newest).unwrap();
    file.write_all(&[0xAB; 5]).unwrap();
    drop(file);

    let repo = open(&dir, &["q"]);
    assert_eq!(fs::metadata(&newest).unwrap().len(), before);
    assert_eq!(consume(&repo, "q"), vec![b"kept".to_vec()]);
}

#[test]
fn test_recovery_after_checkpoint_and_more_commits() {
    let dir = TempDir::new().unwrap();
    {
        let repo = open(&dir, &["a", "b"]);
        ingest(&repo, "a", &[b"first"]);
        repo.checkpoint().unwrap();
        ingest(&repo, "b", &[b"second"]);
        let mut session = repo.session();
        let ff = session.get_one(&conn("a")).unwrap().unwrap();
        session.transfer(&ff, &conn("b")).unwrap();
        session.commit().unwrap();
    }

    let repo = open(&dir, &["a", "b"]);
    assert_eq!(repo.connection(&conn("a")).unwrap().size().object_count(), 0);
    assert_eq!(
        consume(&repo, "b"),
        vec![b"second".to_vec(), b"first".to_vec()]
    );
}

#[test]
fn test_clean_shutdown_leaves_only_snapshot_state() {
    let dir = TempDir::new().unwrap();
    {
        let repo = open(&dir, &["q"]);
        ingest(&repo, "q", &[b"x", b"y"]);
        let stats = repo.shutdown().unwrap();
        assert_eq!(stats.live_flowfiles, 2);
    }
    let repo = open(&dir, &["q"]);
    assert_eq!(consume(&repo, "q"), vec![b"x".to_vec(), b"y".to_vec()]);
}

#[test]
fn test_swapped_flowfiles_survive_crash() {
    let dir = TempDir::new().unwrap();
    let mut config = config(&dir, &["q"]);
    config.queue_defaults.swap_threshold = 10;
    config.queue_defaults.swap_batch_size = 5;
    let payloads: Vec<Vec<u8>> = (0..30u32).map(|i| i.to_be_bytes().to_vec()).collect();
    {
        let repo = FlowRepository::open(config.clone()).unwrap();
        let refs: Vec<&[u8]> = payloads.iter().map(|p| p.as_slice()).collect();
        ingest(&repo, "q", &refs);
        let size = repo.connection(&conn("q")).unwrap().size();
        assert_eq!(size.swap_files, 4);
        assert_eq!(size.swapped_count, 20);
    }

    let repo = FlowRepository::open(config).unwrap();
    let size = repo.connection(&conn("q")).unwrap().size();
    assert_eq!(size.object_count(), 30);
    assert_eq!(size.swap_files, 4);
    assert_eq!(consume(&repo, "q"), payloads);
}

#[test]
fn test_missing_swap_file_fails_startup() {
    let dir = TempDir::new().unwrap();
    let mut config = config(&dir, &["q"]);
    config.queue_defaults.swap_threshold = 2;
    config.queue_defaults.swap_batch_size = 2;
    {
        let repo = FlowRepository::open(config.clone()).unwrap();
        ingest(&repo, "q", &[b"1", b"2", b"3", b"4"]);
        assert_eq!(repo.connection(&conn("q")).unwrap().size().swap_files, 1);
    }
    for entry in fs::read_dir(dir.path().join("swap")).unwrap() {
        fs::remove_file(entry.unwrap().path()).unwrap();
    }
    assert!(matches!(
        FlowRepository::open(config),
        Err(SessionError::Queue(QueueError::SwapFileMissing { .. }))
    ));
}

#[test]
fn test_unreferenced_swap_file_is_removed() {
    let dir = TempDir::new().unwrap();
    {
        let repo = open(&dir, &["q"]);
        ingest(&repo, "q", &[b"only"]);
    }
    let stray = dir.path().join("swap").join("q-99.swap");
    fs::write(&stray, b"not recorded").unwrap();
    let repo = open(&dir, &["q"]);
    assert!(!stray.exists());
    assert_eq!(consume(&repo, "q"), vec![b"only".to_vec()]);
}

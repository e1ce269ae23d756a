#![allow(dead_code)]

use flowrepo_core::{ConnectionConfig, ConnectionId, FlowFileRecord, RepositoryConfig};
use flowrepo_session::{FlowRepository, ProcessSession};
use tempfile::TempDir;

pub fn conn(id: &str) -> ConnectionId {
    ConnectionId::new(id)
}

/// Configuration with the given connections and immediate reclamation.
pub fn config(dir: &TempDir, connections: &[&str]) -> RepositoryConfig {
    let mut config = RepositoryConfig::with_data_dir(dir.path());
    config.content.reclaim_grace_period_ms = 0;
    for id in connections {
        config.connections.push(ConnectionConfig::new(*id));
    }
    config
}

pub fn open(dir: &TempDir, connections: &[&str]) -> FlowRepository {
    FlowRepository::open(config(dir, connections)).unwrap()
}

/// Commits one new FlowFile per payload to `connection`.
pub fn ingest(repo: &FlowRepository, connection: &str, payloads: &[&[u8]]) -> Vec<FlowFileRecord> {
    let mut session = repo.session();
    let mut created = Vec::new();
    for payload in payloads {
        let ff = session.create().unwrap();
        let ff = session.write(&ff, payload).unwrap();
        session.transfer(&ff, &conn(connection)).unwrap();
        created.push(ff);
    }
    session.commit().unwrap();
    created
}

/// Polls everything from `connection`, returns the contents and removes them.
pub fn consume(repo: &FlowRepository, connection: &str) -> Vec<Vec<u8>> {
    let mut session = repo.session();
    let mut contents = Vec::new();
    for ff in session.get(&conn(connection), usize::MAX).unwrap() {
        contents.push(session.read_all(&ff).unwrap());
        session.remove(&ff).unwrap();
    }
    session.commit().unwrap();
    contents
}

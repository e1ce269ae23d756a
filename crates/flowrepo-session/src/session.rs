//! Process sessions.
//!
//! A session is the unit of atomic work: it withdraws FlowFiles from queues,
//! creates and modifies FlowFiles, and on commit moves them all at once. The
//! ledger append in [`ProcessSession::commit`] is the durability point;
//! before it nothing the session did is visible after a restart, after it
//! everything is.
//!
//! Claim accounting: every FlowFile polled into the session already holds
//! one reference on its claim. Writes and clones add references eagerly.
//! On commit, each transferred FlowFile keeps one reference on its final
//! claim and everything else the session held is released. On rollback only
//! the references the session added are released.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::{self, Read};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, warn};

use flowrepo_content::ClaimStore;
use flowrepo_core::{
    millis_after, now_millis, ConnectionId, ContentClaim, FlowFileId, FlowFileRecord,
    UUID_ATTRIBUTE,
};
use flowrepo_ledger::{Ledger, LedgerRecord};
use flowrepo_queue::{ConnectionQueue, FlowFileQueue, Reservation};

use crate::error::{SessionError, SessionResult};
use crate::repository::RepositoryInner;

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Accepting operations.
    Open,
    /// Commit in progress.
    Committing,
    /// Committed; no further use allowed.
    Committed,
    /// Rollback in progress.
    RollingBack,
    /// Rolled back; no further use allowed.
    RolledBack,
}

/// What a commit did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitSummary {
    /// Ledger transaction id, `None` if there was nothing to record.
    pub transaction_id: Option<u64>,
    /// FlowFiles created by the session and transferred.
    pub created: usize,
    /// FlowFiles transferred to a queue, created ones included.
    pub transferred: usize,
    /// FlowFiles removed from the flow.
    pub removed: usize,
    /// Content bytes moved to queues.
    pub bytes_transferred: u64,
    /// Claim references released.
    pub claims_released: usize,
}

/// Atomic unit of work over FlowFiles.
///
/// Every operation taking a FlowFile expects the latest version the session
/// handed out; older versions fail with [`SessionError::StaleFlowFile`].
pub trait ProcessSession: Send {
    /// Current lifecycle state.
    fn state(&self) -> SessionState;

    /// Withdraws up to `max` FlowFiles from `connection`.
    fn get(&mut self, connection: &ConnectionId, max: usize) -> SessionResult<Vec<FlowFileRecord>>;

    /// Withdraws the next FlowFile from `connection`, if any.
    fn get_one(&mut self, connection: &ConnectionId) -> SessionResult<Option<FlowFileRecord>> {
        Ok(self.get(connection, 1)?.into_iter().next())
    }

    /// Creates an empty FlowFile.
    fn create(&mut self) -> SessionResult<FlowFileRecord>;

    /// Creates a FlowFile inheriting `parent`'s attributes and lineage, without content.
    fn create_child(&mut self, parent: &FlowFileRecord) -> SessionResult<FlowFileRecord>;

    /// Creates a copy of `existing` sharing its content.
    fn clone_flowfile(&mut self, existing: &FlowFileRecord) -> SessionResult<FlowFileRecord>;

    /// Replaces the content of `flowfile` with `data`.
    fn write(&mut self, flowfile: &FlowFileRecord, data: &[u8]) -> SessionResult<FlowFileRecord>;

    /// Streams the content of `flowfile`. Empty for FlowFiles without content.
    fn read(&mut self, flowfile: &FlowFileRecord) -> SessionResult<Box<dyn Read + Send>>;

    /// Reads the whole content of `flowfile`.
    fn read_all(&mut self, flowfile: &FlowFileRecord) -> SessionResult<Vec<u8>>;

    /// Sets one attribute. The `uuid` attribute cannot be changed.
    fn put_attribute(&mut self, flowfile: &FlowFileRecord, key: &str, value: &str) -> SessionResult<FlowFileRecord>;

    /// Sets several attributes at once.
    fn put_all_attributes(&mut self, flowfile: &FlowFileRecord, attributes: &[(&str, &str)]) -> SessionResult<FlowFileRecord>;

    /// Removes one attribute. The `uuid` attribute cannot be removed.
    fn remove_attribute(&mut self, flowfile: &FlowFileRecord, key: &str) -> SessionResult<FlowFileRecord>;

    /// Keeps `flowfile` from being polled for `duration` once transferred.
    fn penalize(&mut self, flowfile: &FlowFileRecord, duration: Duration) -> SessionResult<FlowFileRecord>;

    /// Routes `flowfile` to `connection` on commit.
    fn transfer(&mut self, flowfile: &FlowFileRecord, connection: &ConnectionId) -> SessionResult<()>;

    /// Removes `flowfile` from the flow on commit.
    fn remove(&mut self, flowfile: &FlowFileRecord) -> SessionResult<()>;

    /// Makes every change of the session durable and visible.
    fn commit(&mut self) -> SessionResult<CommitSummary>;

    /// Discards every change and returns polled FlowFiles to their queues.
    fn rollback(&mut self) -> SessionResult<()>;

    /// Like [`ProcessSession::rollback`], but returned FlowFiles are penalized.
    fn rollback_with_penalty(&mut self, penalty: Duration) -> SessionResult<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Disposition {
    Pending,
    Transfer(ConnectionId),
    Remove,
}

#[derive(Debug)]
struct SessionRecord {
    /// As polled; `None` for FlowFiles created in this session.
    original: Option<FlowFileRecord>,
    origin: Option<ConnectionId>,
    current: FlowFileRecord,
    disposition: Disposition,
}

impl SessionRecord {
    fn polled(record: FlowFileRecord, origin: ConnectionId) -> Self {
        Self {
            original: Some(record.clone()),
            origin: Some(origin),
            current: record,
            disposition: Disposition::Pending,
        }
    }

    fn created(record: FlowFileRecord) -> Self {
        Self {
            original: None,
            origin: None,
            current: record,
            disposition: Disposition::Pending,
        }
    }
}

/// [`ProcessSession`] backed by the repository's content store, ledger and queues.
///
/// Confined to one thread at a time. Dropping an open session rolls it back.
#[derive(Debug)]
pub struct StandardProcessSession {
    repo: Arc<RepositoryInner>,
    state: SessionState,
    records: BTreeMap<FlowFileId, SessionRecord>,
    /// References added by this session, one entry per reference.
    staged: Vec<ContentClaim>,
    /// Claims written by this session; synced on commit.
    written: HashSet<ContentClaim>,
}

impl StandardProcessSession {
    pub(crate) fn new(repo: Arc<RepositoryInner>) -> Self {
        Self {
            repo,
            state: SessionState::Open,
            records: BTreeMap::new(),
            staged: Vec::new(),
            written: HashSet::new(),
        }
    }

    /// Number of FlowFiles the session currently holds.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True when the session holds no FlowFiles.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Withdraws every record of `connection`, swapped and penalized ones included.
    pub(crate) fn take_all(&mut self, connection: &ConnectionId) -> SessionResult<Vec<FlowFileRecord>> {
        self.ensure_open()?;
        let queue = self.repo.queue(connection)?;
        let drained = queue.drain()?;
        for record in &drained {
            self.records
                .insert(record.id, SessionRecord::polled(record.clone(), connection.clone()));
        }
        Ok(drained)
    }

    fn ensure_open(&self) -> SessionResult<()> {
        if self.state == SessionState::Open {
            Ok(())
        } else {
            Err(SessionError::SessionProtocolViolation(format!(
                "session is {:?}",
                self.state
            )))
        }
    }

    /// Looks up the session's entry for `flowfile`, rejecting unknown,
    /// removed and stale versions.
    fn entry_mut(&mut self, flowfile: &FlowFileRecord) -> SessionResult<&mut SessionRecord> {
        self.ensure_open()?;
        let entry = match self.records.get_mut(&flowfile.id) {
            Some(entry) if entry.disposition != Disposition::Remove => entry,
            _ => return Err(SessionError::UnknownFlowFile(flowfile.id)),
        };
        if entry.current.version != flowfile.version {
            return Err(SessionError::StaleFlowFile {
                id: flowfile.id,
                given: flowfile.version,
                current: entry.current.version,
            });
        }
        Ok(entry)
    }

    fn current(&mut self, flowfile: &FlowFileRecord) -> SessionResult<FlowFileRecord> {
        Ok(self.entry_mut(flowfile)?.current.clone())
    }

    fn replace(&mut self, flowfile: &FlowFileRecord, update: impl FnOnce(&FlowFileRecord) -> FlowFileRecord) -> SessionResult<FlowFileRecord> {
        let entry = self.entry_mut(flowfile)?;
        entry.current = update(&entry.current);
        Ok(entry.current.clone())
    }

    fn child_of(&self, parent: &FlowFileRecord) -> FlowFileRecord {
        let mut child = FlowFileRecord::new(self.repo.next_flowfile_id());
        for (key, value) in parent.attributes.iter() {
            if key != UUID_ATTRIBUTE {
                child.attributes.insert(key, value);
            }
        }
        child.lineage_start_ms = parent.lineage_start_ms;
        child
    }

    /// Rolls back after a structural failure and hands the error back.
    fn fail<T>(&mut self, err: SessionError) -> SessionResult<T> {
        warn!(error = %err, flowfiles = self.records.len(), "session failed, rolling back");
        self.state = SessionState::RollingBack;
        self.undo(None);
        self.state = SessionState::RolledBack;
        Err(err)
    }

    /// Releases staged references and returns polled records to their queues.
    fn undo(&mut self, penalty_until: Option<u64>) {
        for claim in self.staged.drain(..) {
            self.repo.content.release(&claim);
        }
        self.written.clear();

        let mut returned: BTreeMap<ConnectionId, Vec<FlowFileRecord>> = BTreeMap::new();
        for entry in std::mem::take(&mut self.records).into_values() {
            if let (Some(original), Some(origin)) = (entry.original, entry.origin) {
                let original = match penalty_until {
                    Some(until) => original.with_penalty(until),
                    None => original,
                };
                returned.entry(origin).or_default().push(original);
            }
        }
        for (origin, records) in returned {
            match self.repo.queue(&origin) {
                Ok(queue) => queue.reinsert(records),
                Err(e) => error!(connection = %origin, error = %e, count = records.len(), "cannot return FlowFiles to queue"),
            }
        }
        self.repo.note_rolled_back();
    }

    fn end_rollback(&mut self, penalty_until: Option<u64>) -> SessionResult<()> {
        self.ensure_open()?;
        self.state = SessionState::RollingBack;
        let count = self.records.len();
        self.undo(penalty_until);
        self.state = SessionState::RolledBack;
        debug!(flowfiles = count, penalized = penalty_until.is_some(), "session rolled back");
        Ok(())
    }
}

fn cancel_all(reservations: Vec<(Arc<ConnectionQueue>, Reservation, Vec<FlowFileRecord>)>) {
    for (queue, reservation, _) in reservations {
        queue.cancel(reservation);
    }
}

impl ProcessSession for StandardProcessSession {
    fn state(&self) -> SessionState {
        self.state
    }

    fn get(&mut self, connection: &ConnectionId, max: usize) -> SessionResult<Vec<FlowFileRecord>> {
        self.ensure_open()?;
        let queue = self.repo.queue(connection)?;
        let polled = queue.poll(max)?;
        for record in &polled {
            self.records
                .insert(record.id, SessionRecord::polled(record.clone(), connection.clone()));
        }
        Ok(polled)
    }

    fn create(&mut self) -> SessionResult<FlowFileRecord> {
        self.ensure_open()?;
        let record = FlowFileRecord::new(self.repo.next_flowfile_id());
        self.records.insert(record.id, SessionRecord::created(record.clone()));
        Ok(record)
    }

    fn create_child(&mut self, parent: &FlowFileRecord) -> SessionResult<FlowFileRecord> {
        let parent = self.current(parent)?;
        let child = self.child_of(&parent);
        self.records.insert(child.id, SessionRecord::created(child.clone()));
        Ok(child)
    }

    fn clone_flowfile(&mut self, existing: &FlowFileRecord) -> SessionResult<FlowFileRecord> {
        let existing = self.current(existing)?;
        let mut copy = self.child_of(&existing);
        if let Some(claim) = existing.claim {
            let claim = match self.repo.content.clone_claim(&claim) {
                Ok(claim) => claim,
                Err(e) => return self.fail(e.into()),
            };
            self.staged.push(claim);
            copy = copy.with_content(Some(claim));
        }
        self.records.insert(copy.id, SessionRecord::created(copy.clone()));
        Ok(copy)
    }

    fn write(&mut self, flowfile: &FlowFileRecord, data: &[u8]) -> SessionResult<FlowFileRecord> {
        self.entry_mut(flowfile)?;
        let claim = match self.repo.content.write(data) {
            Ok(claim) => claim,
            Err(e) => return self.fail(e.into()),
        };
        self.staged.push(claim);
        self.written.insert(claim);
        self.replace(flowfile, |current| current.with_content(Some(claim)))
    }

    fn read(&mut self, flowfile: &FlowFileRecord) -> SessionResult<Box<dyn Read + Send>> {
        let current = self.current(flowfile)?;
        let Some(claim) = current.claim else {
            return Ok(Box::new(io::empty()));
        };
        match self.repo.content.read(&claim) {
            Ok(reader) => Ok(Box::new(reader)),
            Err(e) => self.fail(e.into()),
        }
    }

    fn read_all(&mut self, flowfile: &FlowFileRecord) -> SessionResult<Vec<u8>> {
        let current = self.current(flowfile)?;
        let Some(claim) = current.claim else {
            return Ok(Vec::new());
        };
        match self.repo.content.read_all(&claim) {
            Ok(bytes) => Ok(bytes),
            Err(e) => self.fail(e.into()),
        }
    }

    fn put_attribute(&mut self, flowfile: &FlowFileRecord, key: &str, value: &str) -> SessionResult<FlowFileRecord> {
        self.put_all_attributes(flowfile, &[(key, value)])
    }

    fn put_all_attributes(&mut self, flowfile: &FlowFileRecord, attributes: &[(&str, &str)]) -> SessionResult<FlowFileRecord> {
        if attributes.iter().any(|(key, _)| *key == UUID_ATTRIBUTE) {
            debug!(flowfile = %flowfile.id, "ignoring attempt to change uuid");
        }
        self.replace(flowfile, |current| {
            current.with_attributes(
                attributes
                    .iter()
                    .filter(|(key, _)| *key != UUID_ATTRIBUTE)
                    .map(|(key, value)| (*key, *value)),
            )
        })
    }

    fn remove_attribute(&mut self, flowfile: &FlowFileRecord, key: &str) -> SessionResult<FlowFileRecord> {
        if key == UUID_ATTRIBUTE {
            debug!(flowfile = %flowfile.id, "ignoring attempt to remove uuid");
            return self.current(flowfile);
        }
        self.replace(flowfile, |current| current.without_attribute(key))
    }

    fn penalize(&mut self, flowfile: &FlowFileRecord, duration: Duration) -> SessionResult<FlowFileRecord> {
        let until = millis_after(now_millis(), duration);
        self.replace(flowfile, |current| current.with_penalty(until))
    }

    fn transfer(&mut self, flowfile: &FlowFileRecord, connection: &ConnectionId) -> SessionResult<()> {
        self.entry_mut(flowfile)?;
        self.repo.queue(connection)?;
        if let Some(entry) = self.records.get_mut(&flowfile.id) {
            entry.disposition = Disposition::Transfer(connection.clone());
        }
        Ok(())
    }

    fn remove(&mut self, flowfile: &FlowFileRecord) -> SessionResult<()> {
        let entry = self.entry_mut(flowfile)?;
        entry.disposition = Disposition::Remove;
        Ok(())
    }

    fn commit(&mut self) -> SessionResult<CommitSummary> {
        self.ensure_open()?;
        self.state = SessionState::Committing;

        let unaccounted = self
            .records
            .iter()
            .find(|(_, e)| e.disposition == Disposition::Pending)
            .map(|(id, _)| *id);
        if let Some(id) = unaccounted {
            return self.fail(SessionError::UnaccountedFlowFile(id));
        }

        let now = now_millis();
        let mut summary = CommitSummary::default();
        let mut outbound: BTreeMap<ConnectionId, Vec<FlowFileRecord>> = BTreeMap::new();
        let mut acknowledged: BTreeMap<ConnectionId, Vec<FlowFileRecord>> = BTreeMap::new();
        let mut ledger_records = Vec::new();
        let mut held: HashMap<ContentClaim, i64> = HashMap::new();

        for claim in &self.staged {
            *held.entry(*claim).or_insert(0) += 1;
        }
        for entry in self.records.values_mut() {
            if let (Some(original), Some(origin)) = (&entry.original, &entry.origin) {
                if let Some(claim) = original.claim {
                    *held.entry(claim).or_insert(0) += 1;
                }
                acknowledged
                    .entry(origin.clone())
                    .or_default()
                    .push(original.clone());
            }
            match &entry.disposition {
                Disposition::Transfer(dest) => {
                    let queued = entry
                        .current
                        .with_queue_entry(now, self.repo.next_queue_index());
                    if let Some(claim) = queued.claim {
                        *held.entry(claim).or_insert(0) -= 1;
                    }
                    summary.transferred += 1;
                    summary.bytes_transferred += queued.size;
                    if entry.original.is_some() {
                        ledger_records.push(LedgerRecord::update(queued.clone(), dest.clone()));
                    } else {
                        summary.created += 1;
                        ledger_records.push(LedgerRecord::create(queued.clone(), dest.clone()));
                    }
                    entry.current = queued.clone();
                    outbound.entry(dest.clone()).or_default().push(queued);
                }
                Disposition::Remove => {
                    summary.removed += 1;
                    if entry.original.is_some() {
                        ledger_records.push(LedgerRecord::delete(entry.current.clone()));
                    }
                }
                Disposition::Pending => {}
            }
        }

        // (1) capacity
        let mut reserved = Vec::with_capacity(outbound.len());
        for (dest, records) in outbound {
            let queue = match self.repo.queue(&dest) {
                Ok(queue) => queue,
                Err(e) => {
                    cancel_all(reserved);
                    return self.fail(e);
                }
            };
            let bytes = records.iter().map(|r| r.size).sum();
            match queue.reserve(records.len() as u64, bytes) {
                Ok(reservation) => reserved.push((queue, reservation, records)),
                Err(e) => {
                    cancel_all(reserved);
                    return self.fail(e.into());
                }
            }
        }

        // (2) content written here must be durable before the ledger points at it
        let new_content: Vec<ContentClaim> = reserved
            .iter()
            .flat_map(|(_, _, records)| records.iter().filter_map(|r| r.claim))
            .filter(|c| self.written.contains(c))
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        if let Err(e) = self.repo.content.sync(&new_content) {
            cancel_all(reserved);
            return self.fail(e.into());
        }

        // (3) durability point
        if !ledger_records.is_empty() {
            match self.repo.ledger.append_batch(ledger_records) {
                Ok(tx) => summary.transaction_id = Some(tx),
                Err(e) => {
                    cancel_all(reserved);
                    return self.fail(e.into());
                }
            }
        }

        // (4) and (5) cannot fail
        for (origin, records) in acknowledged {
            match self.repo.queue(&origin) {
                Ok(queue) => queue.acknowledge(&records),
                Err(e) => error!(connection = %origin, error = %e, "cannot acknowledge FlowFiles"),
            }
        }
        for (queue, reservation, records) in reserved {
            queue.enqueue_reserved(reservation, records);
        }

        // (6)
        for (claim, count) in held {
            if count < 0 {
                error!(claim = %claim, count, "session released more references than it held");
                continue;
            }
            for _ in 0..count {
                self.repo.content.release(&claim);
                summary.claims_released += 1;
            }
        }

        self.records.clear();
        self.staged.clear();
        self.written.clear();
        self.state = SessionState::Committed;
        self.repo.note_committed();
        debug!(
            transaction_id = ?summary.transaction_id,
            transferred = summary.transferred,
            removed = summary.removed,
            released = summary.claims_released,
            "session committed"
        );
        Ok(summary)
    }

    fn rollback(&mut self) -> SessionResult<()> {
        self.end_rollback(None)
    }

    fn rollback_with_penalty(&mut self, penalty: Duration) -> SessionResult<()> {
        self.end_rollback(Some(millis_after(now_millis(), penalty)))
    }
}

impl Drop for StandardProcessSession {
    fn drop(&mut self) {
        if self.state == SessionState::Open {
            warn!(flowfiles = self.records.len(), "session dropped while open, rolling back");
            self.state = SessionState::RollingBack;
            self.undo(None);
            self.state = SessionState::RolledBack;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::FlowRepository;
    use flowrepo_core::{ConnectionConfig, RepositoryConfig};
    use tempfile::TempDir;

    fn repo(dir: &TempDir) -> FlowRepository {
        let mut config = RepositoryConfig::with_data_dir(dir.path());
        config.connections.push(ConnectionConfig::new("in"));
        config.connections.push(ConnectionConfig::new("out"));
        FlowRepository::open(config).unwrap()
    }

    fn conn(id: &str) -> ConnectionId {
        ConnectionId::new(id)
    }

    #[test]
    fn test_use_after_commit_is_violation() {
        let dir = TempDir::new().unwrap();
        let repo = repo(&dir);
        let mut session = repo.session();
        session.commit().unwrap();
        assert_eq!(session.state(), SessionState::Committed);
        assert!(matches!(
            session.create(),
            Err(SessionError::SessionProtocolViolation(_))
        ));
        assert!(matches!(
            session.rollback(),
            Err(SessionError::SessionProtocolViolation(_))
        ));
    }

    #[test]
    fn test_stale_and_unknown_rejected() {
        let dir = TempDir::new().unwrap();
        let repo = repo(&dir);
        let mut session = repo.session();
        let v0 = session.create().unwrap();
        let v1 = session.put_attribute(&v0, "k", "v").unwrap();
        assert!(matches!(
            session.put_attribute(&v0, "k", "w"),
            Err(SessionError::StaleFlowFile { given: 0, current: 1, .. })
        ));
        let stranger = FlowFileRecord::new(FlowFileId::new(9_999));
        assert!(matches!(
            session.remove(&stranger),
            Err(SessionError::UnknownFlowFile(_))
        ));
        // Non-structural errors leave the session usable.
        assert_eq!(session.state(), SessionState::Open);
        session.remove(&v1).unwrap();
        session.commit().unwrap();
    }

    #[test]
    fn test_unaccounted_flowfile_rolls_back() {
        let dir = TempDir::new().unwrap();
        let repo = repo(&dir);
        let mut session = repo.session();
        let ff = session.create().unwrap();
        let ff = session.write(&ff, b"abc").unwrap();
        let claim = ff.claim.unwrap();
        assert_eq!(repo.content().claimant_count(&claim), 1);

        assert!(matches!(
            session.commit(),
            Err(SessionError::UnaccountedFlowFile(id)) if id == ff.id
        ));
        assert_eq!(session.state(), SessionState::RolledBack);
        assert_eq!(repo.content().claimant_count(&claim), 0);
    }

    #[test]
    fn test_attributes_and_uuid() {
        let dir = TempDir::new().unwrap();
        let repo = repo(&dir);
        let mut session = repo.session();
        let ff = session.create().unwrap();
        let uuid = ff.uuid().unwrap().to_string();
        let ff = session
            .put_all_attributes(&ff, &[("a", "1"), ("b", "2"), (UUID_ATTRIBUTE, "forged")])
            .unwrap();
        let ff = session.remove_attribute(&ff, "a").unwrap();
        let ff = session.remove_attribute(&ff, UUID_ATTRIBUTE).unwrap();
        assert_eq!(ff.uuid(), Some(uuid.as_str()));
        assert_eq!(ff.attribute("a"), None);
        assert_eq!(ff.attribute("b"), Some("2"));
        session.transfer(&ff, &conn("out")).unwrap();
        session.commit().unwrap();

        let mut session = repo.session();
        let polled = session.get_one(&conn("out")).unwrap().unwrap();
        assert_eq!(polled.attribute("b"), Some("2"));
        assert_eq!(polled.uuid(), Some(uuid.as_str()));
        session.remove(&polled).unwrap();
        session.commit().unwrap();
    }

    #[test]
    fn test_child_inherits_attributes_not_content() {
        let dir = TempDir::new().unwrap();
        let repo = repo(&dir);
        let mut session = repo.session();
        let parent = session.create().unwrap();
        let parent = session.put_attribute(&parent, "origin", "sensor-7").unwrap();
        let parent = session.write(&parent, b"raw").unwrap();
        let child = session.create_child(&parent).unwrap();
        assert_ne!(child.id, parent.id);
        assert_ne!(child.uuid(), parent.uuid());
        assert_eq!(child.attribute("origin"), Some("sensor-7"));
        assert_eq!(child.lineage_start_ms, parent.lineage_start_ms);
        assert!(child.claim.is_none());
        assert!(session.read_all(&child).unwrap().is_empty());
        session.remove(&parent).unwrap();
        session.remove(&child).unwrap();
        let summary = session.commit().unwrap();
        assert_eq!(summary.removed, 2);
        assert_eq!(summary.transaction_id, None);
    }

    #[test]
    fn test_rewrite_releases_replaced_claim() {
        let dir = TempDir::new().unwrap();
        let repo = repo(&dir);
        let mut session = repo.session();
        let ff = session.create().unwrap();
        let first = session.write(&ff, b"first").unwrap();
        let second = session.write(&first, b"second").unwrap();
        let old = first.claim.unwrap();
        let new = second.claim.unwrap();
        session.transfer(&second, &conn("out")).unwrap();
        let summary = session.commit().unwrap();
        assert_eq!(summary.claims_released, 1);
        assert_eq!(repo.content().claimant_count(&old), 0);
        assert_eq!(repo.content().claimant_count(&new), 1);

        let mut session = repo.session();
        let polled = session.get_one(&conn("out")).unwrap().unwrap();
        assert_eq!(session.read_all(&polled).unwrap(), b"second");
        let mut text = String::new();
        session.read(&polled).unwrap().read_to_string(&mut text).unwrap();
        assert_eq!(text, "second");
        session.rollback().unwrap();
    }

    #[test]
    fn test_transfer_to_unknown_connection() {
        let dir = TempDir::new().unwrap();
        let repo = repo(&dir);
        let mut session = repo.session();
        let ff = session.create().unwrap();
        assert!(matches!(
            session.transfer(&ff, &conn("nowhere")),
            Err(SessionError::UnknownConnection(_))
        ));
        assert!(matches!(
            session.get(&conn("nowhere"), 1),
            Err(SessionError::UnknownConnection(_))
        ));
        session.remove(&ff).unwrap();
        session.commit().unwrap();
    }

    #[test]
    fn test_removed_flowfile_is_gone_from_session() {
        let dir = TempDir::new().unwrap();
        let repo = repo(&dir);
        let mut session = repo.session();
        let ff = session.create().unwrap();
        session.remove(&ff).unwrap();
        assert!(matches!(
            session.transfer(&ff, &conn("out")),
            Err(SessionError::UnknownFlowFile(_))
        ));
        session.commit().unwrap();
    }

    #[test]
    fn test_drop_rolls_back() {
        let dir = TempDir::new().unwrap();
        let repo = repo(&dir);
        let mut session = repo.session();
        let ff = session.create().unwrap();
        session.transfer(&ff, &conn("in")).unwrap();
        session.commit().unwrap();

        {
            let mut session = repo.session();
            let polled = session.get_one(&conn("in")).unwrap().unwrap();
            session.transfer(&polled, &conn("out")).unwrap();
        }
        let status = repo.status();
        assert_eq!(status.connections[&conn("in")].active_count, 1);
        assert_eq!(status.connections[&conn("in")].in_flight_count, 0);
        assert_eq!(status.connections[&conn("out")].object_count(), 0);
        assert_eq!(status.sessions_rolled_back, 1);
    }
}

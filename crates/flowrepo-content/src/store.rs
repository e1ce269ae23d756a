//! The content store: append-only claims with reference counts.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, info, warn};

use flowrepo_core::{ContentClaim, ContentConfig, ResourceClaim};

use crate::claims::ClaimRegistry;
use crate::container::{container_path, scan_containers, ContainerPool, WritableContainer};
use crate::error::{ContentError, ContentResult};
use crate::reclaim::{ContainerReclaimer, ReclaimStats};

/// Storage of FlowFile content, addressed by claims.
pub trait ClaimStore: Send + Sync {
    /// Appends `data` and returns a claim over it with a reference count of 1.
    fn write(&self, data: &[u8]) -> ContentResult<ContentClaim>;

    /// Opens a sequential reader over exactly the claimed bytes.
    fn read(&self, claim: &ContentClaim) -> ContentResult<ClaimReader>;

    /// Adds a reference to an existing claim.
    fn clone_claim(&self, claim: &ContentClaim) -> ContentResult<ContentClaim>;

    /// Drops a reference, returning the remaining count.
    fn release(&self, claim: &ContentClaim) -> u64;

    /// Current reference count of `claim`.
    fn claimant_count(&self, claim: &ContentClaim) -> u64;

    /// Forces the containers holding `claims` to stable storage.
    fn sync(&self, claims: &[ContentClaim]) -> ContentResult<()>;

    /// Reads the whole claim into memory.
    fn read_all(&self, claim: &ContentClaim) -> ContentResult<Vec<u8>> {
        let mut reader = self.read(claim)?;
        let mut buf = Vec::with_capacity(claim.length as usize);
        reader.read_to_end(&mut buf).map_err(|e| reader.map_error(e))?;
        if (buf.len() as u64) < claim.length {
            return Err(ContentError::ContentMissing {
                claim: *claim,
                reason: format!("read {} of {} bytes", buf.len(), claim.length),
            });
        }
        Ok(buf)
    }
}

/// Reader over the bytes of one claim.
#[derive(Debug)]
pub struct ClaimReader {
    claim: ContentClaim,
    inner: io::Take<BufReader<File>>,
}

impl ClaimReader {
    /// The claim being read.
    pub fn claim(&self) -> &ContentClaim {
        &self.claim
    }

    /// Bytes not yet read.
    pub fn remaining(&self) -> u64 {
        self.inner.limit()
    }

    fn map_error(&self, e: io::Error) -> ContentError {
        match e.kind() {
            io::ErrorKind::UnexpectedEof | io::ErrorKind::NotFound => ContentError::ContentMissing {
                claim: self.claim,
                reason: e.to_string(),
            },
            _ => ContentError::Io(e),
        }
    }
}

impl Read for ClaimReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

/// Counters exposed by [`ContentStore::stats`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContentStats {
    /// Claims handed out by `write`.
    pub claims_written: u64,
    /// Bytes appended to containers.
    pub bytes_written: u64,
    /// Containers created.
    pub containers_created: u64,
    /// Containers sealed.
    pub containers_sealed: u64,
    /// Containers currently tracked by the registry.
    pub tracked_containers: usize,
    /// Writable containers currently idle in the pool.
    pub idle_containers: usize,
}

/// File-backed [`ClaimStore`].
#[derive(Debug)]
pub struct ContentStore {
    config: ContentConfig,
    pool: ContainerPool,
    registry: ClaimRegistry,
    reclaimer: ContainerReclaimer,
    claims_written: AtomicU64,
    bytes_written: AtomicU64,
    containers_created: AtomicU64,
    containers_sealed: AtomicU64,
}

impl ContentStore {
    /// Opens the store rooted at `dir`.
    ///
    /// Existing containers are left untouched and never appended to again;
    /// new containers get ids above the largest one found.
    pub fn open(config: &ContentConfig, dir: &Path) -> ContentResult<Self> {
        std::fs::create_dir_all(dir)?;
        let existing = scan_containers(dir)?;
        let first_id = existing
            .iter()
            .map(|c| c.resource.container + 1)
            .max()
            .unwrap_or(0);
        info!(
            dir = %dir.display(),
            containers = existing.len(),
            next_container = first_id,
            "opened content store"
        );
        Ok(Self {
            config: config.clone(),
            pool: ContainerPool::new(dir, config.section_count, first_id),
            registry: ClaimRegistry::new(),
            reclaimer: ContainerReclaimer::new(config.reclaim_grace_period()),
            claims_written: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            containers_created: AtomicU64::new(0),
            containers_sealed: AtomicU64::new(0),
        })
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        self.pool.root()
    }

    /// Path of the container file holding `claim`.
    pub fn path_of(&self, claim: &ContentClaim) -> PathBuf {
        container_path(self.pool.root(), &claim.resource)
    }

    /// Installs reference counts rebuilt from the ledger and swap files.
    pub fn restore_counts<I>(&self, counts: I)
    where
        I: IntoIterator<Item = (ContentClaim, u64)>,
    {
        self.registry.restore(counts);
        info!(containers = self.registry.len(), "restored claim counts");
    }

    /// Deletes container files that no tracked claim points into.
    ///
    /// Only meaningful at startup, after [`ContentStore::restore_counts`].
    /// Returns the number of files removed.
    pub fn remove_orphans(&self) -> ContentResult<usize> {
        let writable: BTreeSet<ResourceClaim> = self.pool.idle_resources().into_iter().collect();
        let mut removed = 0;
        for file in scan_containers(self.pool.root())? {
            if self.registry.is_tracked(&file.resource) || writable.contains(&file.resource) {
                continue;
            }
            match std::fs::remove_file(&file.path) {
                Ok(()) => {
                    removed += 1;
                    warn!(resource = %file.resource, bytes = file.len, "removed orphaned container");
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(removed)
    }

    /// Runs one reclamation pass.
    pub fn reclaim(&self) -> ReclaimStats {
        self.reclaimer.run(&self.registry, self.pool.root())
    }

    /// Seals every idle writable container.
    pub fn close(&self) -> ContentResult<()> {
        let mut first_err = None;
        for container in self.pool.drain() {
            if let Err(e) = self.seal(container) {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// Snapshot of the store counters.
    pub fn stats(&self) -> ContentStats {
        ContentStats {
            claims_written: self.claims_written.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            containers_created: self.containers_created.load(Ordering::Relaxed),
            containers_sealed: self.containers_sealed.load(Ordering::Relaxed),
            tracked_containers: self.registry.len(),
            idle_containers: self.pool.idle_count(),
        }
    }

    /// Claim registry, for callers that need the raw counts.
    pub fn registry(&self) -> &ClaimRegistry {
        &self.registry
    }

    fn seal(&self, container: WritableContainer) -> io::Result<()> {
        let result = container.sync();
        self.registry.seal(&container.resource);
        self.containers_sealed.fetch_add(1, Ordering::Relaxed);
        debug!(resource = %container.resource, size = container.size(), "sealed container");
        result
    }

    fn missing(claim: &ContentClaim, reason: impl Into<String>) -> ContentError {
        ContentError::ContentMissing {
            claim: *claim,
            reason: reason.into(),
        }
    }
}

impl ClaimStore for ContentStore {
    fn write(&self, data: &[u8]) -> ContentResult<ContentClaim> {
        let (mut container, fresh) = self.pool.checkout()?;
        if fresh {
            self.registry.register_writable(container.resource);
            self.containers_created.fetch_add(1, Ordering::Relaxed);
        }

        let appended = container.append(data).and_then(|offset| {
            if self.config.always_sync {
                container.sync()?;
            }
            Ok(offset)
        });
        let offset = match appended {
            Ok(offset) => offset,
            Err(e) => {
                warn!(resource = %container.resource, error = %e, "container write failed, sealing");
                let _ = self.seal(container);
                return Err(e.into());
            }
        };

        let claim = ContentClaim::new(container.resource, offset, data.len() as u64);
        self.registry.increment(&claim);
        self.claims_written.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(data.len() as u64, Ordering::Relaxed);

        if container.size() >= self.config.max_container_size {
            if let Err(e) = self.seal(container) {
                // The bytes were written; the sync at commit will surface a
                // persistent failure.
                warn!(claim = %claim, error = %e, "failed to sync container on seal");
            }
        } else {
            self.pool.checkin(container);
        }
        debug!(claim = %claim, "content written");
        Ok(claim)
    }

    fn read(&self, claim: &ContentClaim) -> ContentResult<ClaimReader> {
        let path = self.path_of(claim);
        let mut file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Self::missing(claim, "container not found"));
            }
            Err(e) => return Err(e.into()),
        };
        let len = file.metadata()?.len();
        if len < claim.end() {
            return Err(Self::missing(
                claim,
                format!("container is {} bytes, claim ends at {}", len, claim.end()),
            ));
        }
        file.seek(SeekFrom::Start(claim.offset))?;
        Ok(ClaimReader {
            claim: *claim,
            inner: BufReader::new(file).take(claim.length),
        })
    }

    fn clone_claim(&self, claim: &ContentClaim) -> ContentResult<ContentClaim> {
        match self.registry.increment_existing(claim) {
            Some(count) => {
                debug!(claim = %claim, count = count, "claim cloned");
                Ok(*claim)
            }
            None => Err(Self::missing(claim, "claim is not referenced")),
        }
    }

    fn release(&self, claim: &ContentClaim) -> u64 {
        match self.registry.decrement(claim) {
            Some(count) => {
                debug!(claim = %claim, count = count, "claim released");
                count
            }
            None => {
                warn!(claim = %claim, "release of untracked claim");
                0
            }
        }
    }

    fn claimant_count(&self, claim: &ContentClaim) -> u64 {
        self.registry.count(claim)
    }

    fn sync(&self, claims: &[ContentClaim]) -> ContentResult<()> {
        if self.config.always_sync {
            return Ok(());
        }
        let resources: BTreeSet<ResourceClaim> = claims.iter().map(|c| c.resource).collect();
        for resource in resources {
            let path = container_path(self.pool.root(), &resource);
            let file = match File::open(&path) {
                Ok(f) => f,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    let claim = claims
                        .iter()
                        .find(|c| c.resource == resource)
                        .copied()
                        .unwrap_or_else(|| ContentClaim::new(resource, 0, 0));
                    return Err(Self::missing(&claim, "container not found during sync"));
                }
                Err(e) => return Err(e.into()),
            };
            file.sync_data()?;
        }
        Ok(())
    }
}

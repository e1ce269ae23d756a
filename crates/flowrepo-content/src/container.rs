//! Append-only container files and the pool of writable containers.
//!
//! A container is checked out of the pool for the duration of one append, so
//! the pool mutex is only held to pop or push a handle. Containers that reach
//! the configured maximum size are sealed and never go back into the pool.

use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::debug;

use flowrepo_core::ResourceClaim;

/// Open handle on a container that still accepts appends.
#[derive(Debug)]
pub struct WritableContainer {
    /// The container this handle appends to.
    pub resource: ResourceClaim,
    file: File,
    size: u64,
}

impl WritableContainer {
    /// Current length of the container in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Appends `data`, returning the offset it was written at.
    pub fn append(&mut self, data: &[u8]) -> io::Result<u64> {
        let offset = self.size;
        self.file.write_all(data)?;
        self.size += data.len() as u64;
        Ok(offset)
    }

    /// Flushes the container's data to stable storage.
    pub fn sync(&self) -> io::Result<()> {
        self.file.sync_data()
    }
}

/// A container file found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerFile {
    /// The container the file belongs to.
    pub resource: ResourceClaim,
    /// Absolute path of the file.
    pub path: PathBuf,
    /// File length in bytes.
    pub len: u64,
}

/// Path of `resource` under the content root.
pub fn container_path(root: &Path, resource: &ResourceClaim) -> PathBuf {
    root.join(resource.relative_path())
}

/// Lists every container file under `root`.
///
/// Entries that do not follow the `<section>/<container>` naming are skipped.
pub fn scan_containers(root: &Path) -> io::Result<Vec<ContainerFile>> {
    let mut found = Vec::new();
    let sections = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(found),
        Err(e) => return Err(e),
    };
    for section in sections {
        let section = section?;
        let section_id = match section.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) {
            Some(id) if section.file_type()?.is_dir() => id,
            _ => continue,
        };
        for entry in fs::read_dir(section.path())? {
            let entry = entry?;
            let container = match entry.file_name().to_str().and_then(|s| s.parse::<u64>().ok()) {
                Some(id) => id,
                None => continue,
            };
            let meta = entry.metadata()?;
            if !meta.is_file() {
                continue;
            }
            found.push(ContainerFile {
                resource: ResourceClaim::new(container, section_id),
                path: entry.path(),
                len: meta.len(),
            });
        }
    }
    Ok(found)
}

/// Pool of writable containers shared by all writers.
#[derive(Debug)]
pub struct ContainerPool {
    root: PathBuf,
    section_count: u32,
    next_id: AtomicU64,
    idle: Mutex<VecDeque<WritableContainer>>,
}

impl ContainerPool {
    /// Creates an empty pool; new containers get ids starting at `first_id`.
    pub fn new(root: impl Into<PathBuf>, section_count: u32, first_id: u64) -> Self {
        Self {
            root: root.into(),
            section_count: section_count.max(1),
            next_id: AtomicU64::new(first_id),
            idle: Mutex::new(VecDeque::new()),
        }
    }

    /// Root directory of the content store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Takes an idle container, or creates a new one when none is idle.
    ///
    /// The second value is true for a freshly created container.
    pub fn checkout(&self) -> io::Result<(WritableContainer, bool)> {
        if let Some(container) = self.idle.lock().pop_front() {
            return Ok((container, false));
        }
        self.create().map(|c| (c, true))
    }

    /// Returns a container to the pool for the next writer.
    pub fn checkin(&self, container: WritableContainer) {
        self.idle.lock().push_back(container);
    }

    /// Removes every idle container from the pool.
    pub fn drain(&self) -> Vec<WritableContainer> {
        self.idle.lock().drain(..).collect()
    }

    /// Number of idle containers.
    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    /// Resources of the idle containers.
    pub fn idle_resources(&self) -> Vec<ResourceClaim> {
        self.idle.lock().iter().map(|c| c.resource).collect()
    }

    fn create(&self) -> io::Result<WritableContainer> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let section = (id % u64::from(self.section_count)) as u32;
        let resource = ResourceClaim::new(id, section);
        let path = container_path(&self.root, &resource);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .append(true)
            .create_new(true)
            .open(&path)?;
        debug!(resource = %resource, path = %path.display(), "created container");
        Ok(WritableContainer {
            resource,
            file,
            size: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_checkout_creates_then_reuses() {
        let dir = TempDir::new().unwrap();
        let pool = ContainerPool::new(dir.path(), 4, 10);

        let (mut c, fresh) = pool.checkout().unwrap();
        assert!(fresh);
        assert_eq!(c.resource, ResourceClaim::new(10, 2));
        assert_eq!(c.append(b"abc").unwrap(), 0);
        assert_eq!(c.append(b"de").unwrap(), 3);
        pool.checkin(c);

        let (c, fresh) = pool.checkout().unwrap();
        assert!(!fresh);
        assert_eq!(c.size(), 5);
        assert_eq!(pool.idle_count(), 0);
    }

    #[test]
    fn test_scan_finds_containers() {
        let dir = TempDir::new().unwrap();
        let pool = ContainerPool::new(dir.path(), 2, 0);
        let (mut a, _) = pool.checkout().unwrap();
        let (b, _) = pool.checkout().unwrap();
        a.append(b"hello").unwrap();
        fs::write(dir.path().join("README"), b"not a container").unwrap();

        let mut found = scan_containers(dir.path()).unwrap();
        found.sort_by_key(|f| f.resource);
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].resource, a.resource);
        assert_eq!(found[0].len, 5);
        assert_eq!(found[1].resource, b.resource);
    }

    #[test]
    fn test_scan_missing_root() {
        let dir = TempDir::new().unwrap();
        let found = scan_containers(&dir.path().join("absent")).unwrap();
        assert!(found.is_empty());
    }
}

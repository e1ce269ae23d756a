//! Reclamation of containers nobody references any more.

use std::fs;
use std::io;
use std::path::Path;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::claims::ClaimRegistry;
use crate::container::container_path;

/// Statistics from one reclamation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReclaimStats {
    /// Containers tracked when the pass started.
    pub resources_scanned: usize,
    /// Containers deleted in this pass.
    pub containers_reclaimed: usize,
    /// Bytes freed by the deleted containers.
    pub bytes_reclaimed: u64,
}

/// Deletes sealed containers whose claimant count has stayed at zero for the
/// grace period.
#[derive(Debug, Clone)]
pub struct ContainerReclaimer {
    grace: Duration,
}

impl ContainerReclaimer {
    /// Creates a reclaimer with the given grace period.
    pub fn new(grace: Duration) -> Self {
        Self { grace }
    }

    /// Runs one pass over `registry`, deleting files under `root`.
    pub fn run(&self, registry: &ClaimRegistry, root: &Path) -> ReclaimStats {
        let mut stats = ReclaimStats {
            resources_scanned: registry.len(),
            ..ReclaimStats::default()
        };

        for resource in registry.reclaimable(self.grace, Instant::now()) {
            // Re-checked under the shard lock; a clone may have raced us.
            if !registry.remove_if_reclaimable(&resource, self.grace) {
                continue;
            }
            let path = container_path(root, &resource);
            let len = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            match fs::remove_file(&path) {
                Ok(()) => {
                    stats.containers_reclaimed += 1;
                    stats.bytes_reclaimed += len;
                    debug!(resource = %resource, bytes = len, "reclaimed container");
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    stats.containers_reclaimed += 1;
                }
                Err(e) => {
                    warn!(resource = %resource, error = %e, "failed to delete reclaimed container");
                }
            }
        }

        if stats.containers_reclaimed > 0 {
            info!(
                scanned = stats.resources_scanned,
                reclaimed = stats.containers_reclaimed,
                bytes = stats.bytes_reclaimed,
                "reclamation pass complete"
            );
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowrepo_core::{ContentClaim, ResourceClaim};
    use tempfile::TempDir;

    fn setup(dir: &Path, resource: ResourceClaim, bytes: &[u8]) {
        let path = container_path(dir, &resource);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, bytes).unwrap();
    }

    #[test]
    fn test_reclaims_sealed_unreferenced() {
        let dir = TempDir::new().unwrap();
        let registry = ClaimRegistry::new();
        let rc = ResourceClaim::new(1, 1);
        setup(dir.path(), rc, b"0123456789");
        registry.register_writable(rc);
        let claim = ContentClaim::new(rc, 0, 10);
        registry.increment(&claim);
        registry.seal(&rc);

        let reclaimer = ContainerReclaimer::new(Duration::ZERO);
        let stats = reclaimer.run(&registry, dir.path());
        assert_eq!(stats.containers_reclaimed, 0);
        assert!(container_path(dir.path(), &rc).exists());

        registry.decrement(&claim);
        let stats = reclaimer.run(&registry, dir.path());
        assert_eq!(stats.resources_scanned, 1);
        assert_eq!(stats.containers_reclaimed, 1);
        assert_eq!(stats.bytes_reclaimed, 10);
        assert!(!container_path(dir.path(), &rc).exists());
        assert!(!registry.is_tracked(&rc));
    }

    #[test]
    fn test_grace_period_keeps_container() {
        let dir = TempDir::new().unwrap();
        let registry = ClaimRegistry::new();
        let rc = ResourceClaim::new(2, 0);
        setup(dir.path(), rc, b"x");
        registry.register_writable(rc);
        registry.seal(&rc);

        let stats = ContainerReclaimer::new(Duration::from_secs(3600)).run(&registry, dir.path());
        assert_eq!(stats.containers_reclaimed, 0);
        assert!(container_path(dir.path(), &rc).exists());
    }
}

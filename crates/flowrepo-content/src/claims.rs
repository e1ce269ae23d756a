//! Claim reference counting.
//!
//! Counts are grouped per container so that a clone or release touches one
//! `DashMap` shard lock: the claim's own count and the container's claimant
//! total change together, and reclamation re-checks both under the same lock
//! before a container is dropped.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, warn};

use flowrepo_core::{ContentClaim, ResourceClaim};

#[derive(Debug)]
struct ResourceEntry {
    claims: HashMap<ContentClaim, u64>,
    claimants: u64,
    writable: bool,
    idle_since: Option<Instant>,
}

impl ResourceEntry {
    fn new(writable: bool) -> Self {
        Self {
            claims: HashMap::new(),
            claimants: 0,
            writable,
            idle_since: if writable { None } else { Some(Instant::now()) },
        }
    }

    fn is_reclaimable(&self, grace: Duration, now: Instant) -> bool {
        if self.writable || self.claimants > 0 {
            return false;
        }
        match self.idle_since {
            Some(since) => now.saturating_duration_since(since) >= grace,
            None => false,
        }
    }
}

/// Reference counts for every tracked claim, grouped by container.
#[derive(Debug, Default)]
pub struct ClaimRegistry {
    resources: DashMap<ResourceClaim, ResourceEntry>,
}

impl ClaimRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts tracking a freshly created, writable container.
    pub fn register_writable(&self, resource: ResourceClaim) {
        self.resources
            .entry(resource)
            .or_insert_with(|| ResourceEntry::new(true));
    }

    /// Marks a container as no longer appendable.
    pub fn seal(&self, resource: &ResourceClaim) {
        if let Some(mut entry) = self.resources.get_mut(resource) {
            entry.writable = false;
            if entry.claimants == 0 {
                entry.idle_since = Some(Instant::now());
            }
        }
    }

    /// Adds one reference to a claim inside a container this registry tracks.
    ///
    /// Returns the new count, or `None` when the container is unknown
    /// (never written by this store, or already reclaimed).
    pub fn increment(&self, claim: &ContentClaim) -> Option<u64> {
        let mut entry = self.resources.get_mut(&claim.resource)?;
        entry.claimants += 1;
        entry.idle_since = None;
        let count = entry.claims.entry(*claim).or_insert(0);
        *count += 1;
        Some(*count)
    }

    /// Adds one reference to a claim that already has at least one.
    ///
    /// Returns `None` when the claim is not currently referenced.
    pub fn increment_existing(&self, claim: &ContentClaim) -> Option<u64> {
        let mut entry = self.resources.get_mut(&claim.resource)?;
        let count = entry.claims.get_mut(claim)?;
        *count += 1;
        let count = *count;
        entry.claimants += 1;
        Some(count)
    }

    /// Removes one reference from a claim.
    ///
    /// Returns the new count, or `None` when the claim had no references.
    pub fn decrement(&self, claim: &ContentClaim) -> Option<u64> {
        let mut entry = self.resources.get_mut(&claim.resource)?;
        let remaining = match entry.claims.get_mut(claim) {
            Some(count) if *count > 1 => {
                *count -= 1;
                *count
            }
            Some(_) => {
                entry.claims.remove(claim);
                0
            }
            None => return None,
        };
        entry.claimants -= 1;
        if entry.claimants == 0 {
            entry.idle_since = Some(Instant::now());
            debug!(resource = %claim.resource, "container has no claimants");
        }
        Some(remaining)
    }

    /// Current count of a claim (0 if untracked).
    pub fn count(&self, claim: &ContentClaim) -> u64 {
        self.resources
            .get(&claim.resource)
            .and_then(|entry| entry.claims.get(claim).copied())
            .unwrap_or(0)
    }

    /// Sum of the counts of every claim inside `resource`.
    pub fn claimants(&self, resource: &ResourceClaim) -> u64 {
        self.resources
            .get(resource)
            .map(|entry| entry.claimants)
            .unwrap_or(0)
    }

    /// True if the container is tracked (written by this store or restored).
    pub fn is_tracked(&self, resource: &ResourceClaim) -> bool {
        self.resources.contains_key(resource)
    }

    /// Number of tracked containers.
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    /// True when no container is tracked.
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// All tracked containers.
    pub fn tracked(&self) -> HashSet<ResourceClaim> {
        self.resources.iter().map(|e| *e.key()).collect()
    }

    /// Containers that could be reclaimed at `now`.
    pub fn reclaimable(&self, grace: Duration, now: Instant) -> Vec<ResourceClaim> {
        self.resources
            .iter()
            .filter(|e| e.value().is_reclaimable(grace, now))
            .map(|e| *e.key())
            .collect()
    }

    /// Stops tracking `resource` if it is still reclaimable.
    ///
    /// The check and the removal happen under the same shard lock, so a
    /// concurrent clone either lands before (and the container survives) or
    /// finds the container gone.
    pub fn remove_if_reclaimable(&self, resource: &ResourceClaim, grace: Duration) -> bool {
        let now = Instant::now();
        self.resources
            .remove_if(resource, |_, entry| entry.is_reclaimable(grace, now))
            .is_some()
    }

    /// Installs counts rebuilt from the ledger. Restored containers are sealed.
    pub fn restore<I>(&self, counts: I)
    where
        I: IntoIterator<Item = (ContentClaim, u64)>,
    {
        for (claim, count) in counts {
            if count == 0 {
                continue;
            }
            match self.resources.entry(claim.resource) {
                Entry::Occupied(mut occupied) => {
                    let entry = occupied.get_mut();
                    *entry.claims.entry(claim).or_insert(0) += count;
                    entry.claimants += count;
                    entry.idle_since = None;
                }
                Entry::Vacant(vacant) => {
                    let mut entry = ResourceEntry::new(false);
                    entry.claims.insert(claim, count);
                    entry.claimants = count;
                    entry.idle_since = None;
                    vacant.insert(entry);
                }
            }
        }
        if self.resources.iter().any(|e| e.value().writable) {
            warn!("restoring claim counts while writable containers exist");
        }
    }
}

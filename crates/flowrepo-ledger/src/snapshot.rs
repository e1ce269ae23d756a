//! Ledger snapshots.
//!
//! A snapshot is a single checksummed frame holding the live index and the
//! first log generation it does not cover. It is written to a temp file,
//! synced, and renamed over `ledger/snapshot`.

use std::fs::{self, File};
use std::io::{self, BufReader, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use flowrepo_core::codec::decode;
use flowrepo_core::{encode_frame, read_raw_frame, RawFrame};

use crate::error::{LedgerError, LedgerResult};
use crate::index::LiveIndex;

const SNAPSHOT_FILENAME: &str = "snapshot";
const SNAPSHOT_TMP_FILENAME: &str = "snapshot.partial";

/// Persisted checkpoint state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Log generations strictly below this one are covered by the snapshot.
    pub generation: u64,
    /// The live index at the checkpoint.
    pub index: LiveIndex,
}

/// Path of the snapshot under the ledger root.
pub fn snapshot_path(root: &Path) -> PathBuf {
    root.join(SNAPSHOT_FILENAME)
}

/// Writes `snapshot` atomically, returning its size in bytes.
pub fn write_snapshot(root: &Path, snapshot: &Snapshot) -> LedgerResult<u64> {
    let frame = encode_frame(snapshot)?;
    let tmp_path = root.join(SNAPSHOT_TMP_FILENAME);
    {
        let mut tmp = File::create(&tmp_path)?;
        tmp.write_all(&frame)?;
        tmp.sync_all()?;
    }
    fs::rename(&tmp_path, snapshot_path(root))?;
    if let Ok(dir) = File::open(root) {
        let _ = dir.sync_all();
    }
    debug!(generation = snapshot.generation, bytes = frame.len(), "snapshot written");
    Ok(frame.len() as u64)
}

/// Loads the snapshot, or `None` when none has been written yet.
///
/// A snapshot that is present but unreadable is corruption.
pub fn load_snapshot(root: &Path) -> LedgerResult<Option<Snapshot>> {
    let path = snapshot_path(root);
    let file = match File::open(&path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut reader = BufReader::new(file);
    match read_raw_frame(&mut reader)? {
        RawFrame::Payload(payload) => {
            let snapshot = decode::<Snapshot>(&payload)
                .map_err(|e| LedgerError::corruption(&path, 0, e.to_string()))?;
            Ok(Some(snapshot))
        }
        RawFrame::End => Err(LedgerError::corruption(&path, 0, "empty snapshot")),
        RawFrame::Torn { reason, .. } => Err(LedgerError::corruption(&path, 0, reason)),
    }
}

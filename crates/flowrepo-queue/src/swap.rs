//! Swap files.
//!
//! A swap file holds part of a queue's FlowFiles on disk:
//! `<connection>-<sequence>.swap`, a run of framed records followed by a
//! framed trailer carrying the record count and byte total. Files are written
//! as `*.swap.partial` and renamed once synced, so a visible `.swap` file is
//! always complete.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use flowrepo_core::{write_frame, CodecError, ConnectionId, FlowFileRecord, Frame, FrameReader};

use crate::error::{QueueError, QueueResult};
use crate::prioritizer::QueueOrder;

const SWAP_SUFFIX: &str = ".swap";
const PARTIAL_SUFFIX: &str = ".swap.partial";

#[derive(Debug, Serialize, Deserialize)]
enum SwapEntry {
    Record(FlowFileRecord),
    Trailer { count: u64, bytes: u64 },
}

/// In-memory stand-in for one swap file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapSummary {
    /// Swap file name, relative to the swap directory.
    pub location: String,
    /// Records in the file.
    pub count: u64,
    /// Content bytes of those records.
    pub bytes: u64,
    /// The record that sorts first in the file.
    pub head: FlowFileRecord,
}

impl SwapSummary {
    /// Summarizes `records` read from `location`. `None` for an empty file.
    pub fn from_records(location: &str, records: &[FlowFileRecord], order: &QueueOrder) -> Option<Self> {
        let head = records.iter().min_by(|a, b| order.compare(a, b))?.clone();
        Some(Self {
            location: location.to_string(),
            count: records.len() as u64,
            bytes: records.iter().map(|r| r.size).sum(),
            head,
        })
    }
}

/// Receives swap events so they can be made durable in the ledger.
///
/// `swapped_out` runs after the swap file is renamed into place;
/// `swapped_in` runs before the file is deleted.
pub trait SwapRecorder: Send + Sync {
    /// `records` of `connection` now live in `location`.
    fn swapped_out(&self, connection: &ConnectionId, location: &str, records: &[FlowFileRecord]) -> QueueResult<()>;

    /// `records` were read back from `location` into `connection`.
    fn swapped_in(&self, connection: &ConnectionId, location: &str, records: &[FlowFileRecord]) -> QueueResult<()>;
}

/// Recorder that records nothing, for queues without a ledger.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSwapRecorder;

impl SwapRecorder for NoopSwapRecorder {
    fn swapped_out(&self, _: &ConnectionId, _: &str, _: &[FlowFileRecord]) -> QueueResult<()> {
        Ok(())
    }

    fn swapped_in(&self, _: &ConnectionId, _: &str, _: &[FlowFileRecord]) -> QueueResult<()> {
        Ok(())
    }
}

/// Reads, writes and cleans up swap files in one directory.
#[derive(Debug)]
pub struct SwapManager {
    dir: PathBuf,
    next_sequence: AtomicU64,
}

impl SwapManager {
    /// Opens the swap directory, creating it if needed.
    pub fn open(dir: &Path) -> QueueResult<Self> {
        fs::create_dir_all(dir)?;
        let mut next = 0;
        for name in list_names(dir)? {
            if let Some(seq) = parse_sequence(&name) {
                next = next.max(seq + 1);
            }
        }
        Ok(Self {
            dir: dir.to_path_buf(),
            next_sequence: AtomicU64::new(next),
        })
    }

    /// The swap directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Writes `records` (already in policy order) to a new swap file.
    pub fn write(&self, connection: &ConnectionId, records: &[FlowFileRecord], order: &QueueOrder) -> QueueResult<SwapSummary> {
        if records.is_empty() {
            return Err(QueueError::SwapCorruption {
                location: connection.file_stem(),
                reason: "refusing to write an empty swap file".to_string(),
            });
        }
        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        let location = format!("{}-{}{}", connection.file_stem(), sequence, SWAP_SUFFIX);
        let final_path = self.dir.join(&location);
        let partial_path = self.dir.join(format!("{}-{}{}", connection.file_stem(), sequence, PARTIAL_SUFFIX));

        let bytes: u64 = records.iter().map(|r| r.size).sum();
        let result = (|| -> QueueResult<()> {
            let file = File::create(&partial_path)?;
            let mut writer = BufWriter::new(file);
            for record in records {
                write_frame(&mut writer, &SwapEntry::Record(record.clone()))?;
            }
            write_frame(
                &mut writer,
                &SwapEntry::Trailer {
                    count: records.len() as u64,
                    bytes,
                },
            )?;
            let file = writer.into_inner().map_err(|e| e.into_error())?;
            file.sync_all()?;
            fs::rename(&partial_path, &final_path)?;
            Ok(())
        })();
        if let Err(e) = result {
            let _ = fs::remove_file(&partial_path);
            return Err(e);
        }

        let summary = SwapSummary::from_records(&location, records, order).ok_or_else(|| QueueError::SwapCorruption {
            location: location.clone(),
            reason: "no records".to_string(),
        })?;
        debug!(connection = %connection, location = %location, count = records.len(), bytes, "swap file written");
        Ok(summary)
    }

    /// Reads every record of `location` back.
    pub fn read(&self, location: &str) -> QueueResult<Vec<FlowFileRecord>> {
        let path = self.dir.join(location);
        let file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(QueueError::SwapFileMissing {
                    location: location.to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        };
        let corrupt = |reason: String| QueueError::SwapCorruption {
            location: location.to_string(),
            reason,
        };

        let mut reader = FrameReader::new(BufReader::new(file));
        let mut records = Vec::new();
        loop {
            match reader.next_frame::<SwapEntry>() {
                Ok(Frame::Value {
                    value: SwapEntry::Record(record),
                    ..
                }) => records.push(record),
                Ok(Frame::Value {
                    value: SwapEntry::Trailer { count, bytes },
                    ..
                }) => {
                    let actual: u64 = records.iter().map(|r| r.size).sum();
                    if count != records.len() as u64 || bytes != actual {
                        return Err(corrupt(format!(
                            "trailer says {} records / {} bytes, found {} / {}",
                            count,
                            bytes,
                            records.len(),
                            actual
                        )));
                    }
                    return Ok(records);
                }
                Ok(Frame::End) => return Err(corrupt("missing trailer".to_string())),
                Ok(Frame::Torn { offset, reason, .. }) => {
                    return Err(corrupt(format!("{} at offset {}", reason, offset)));
                }
                Err(CodecError::Io(e)) => return Err(e.into()),
                Err(e) => return Err(corrupt(e.to_string())),
            }
        }
    }

    /// Deletes a swap file.
    pub fn delete(&self, location: &str) -> QueueResult<()> {
        match fs::remove_file(self.dir.join(location)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Every complete swap file in the directory.
    pub fn locations(&self) -> QueueResult<Vec<String>> {
        let mut names: Vec<String> = list_names(&self.dir)?
            .into_iter()
            .filter(|n| n.ends_with(SWAP_SUFFIX))
            .collect();
        names.sort();
        Ok(names)
    }

    /// Deletes swap files the ledger does not know about, and partial files.
    pub fn remove_orphans(&self, known: &HashSet<String>) -> QueueResult<usize> {
        let mut removed = 0;
        for name in list_names(&self.dir)? {
            let orphan = name.ends_with(PARTIAL_SUFFIX) || (name.ends_with(SWAP_SUFFIX) && !known.contains(&name));
            if !orphan {
                continue;
            }
            fs::remove_file(self.dir.join(&name))?;
            warn!(location = %name, "removed orphaned swap file");
            removed += 1;
        }
        if removed > 0 {
            info!(removed, "swap orphan cleanup complete");
        }
        Ok(removed)
    }
}

fn list_names(dir: &Path) -> io::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }
    Ok(names)
}

fn parse_sequence(name: &str) -> Option<u64> {
    let stem = name
        .strip_suffix(PARTIAL_SUFFIX)
        .or_else(|| name.strip_suffix(SWAP_SUFFIX))?;
    stem.rsplit('-').next()?.parse().ok()
}

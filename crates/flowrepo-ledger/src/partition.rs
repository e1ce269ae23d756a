//! Partition logs.
//!
//! Each partition is a directory of generation files,
//! `partition-<n>/<generation>.log`. A partition appends to exactly one
//! generation at a time; a checkpoint rotates every partition to the next
//! generation so that older files become deletable once the snapshot is on
//! disk.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use flowrepo_core::SyncMode;

/// Directory of partition `index` under the ledger root.
pub fn partition_dir(root: &Path, index: usize) -> PathBuf {
    root.join(format!("partition-{}", index))
}

/// Path of one generation file of a partition.
pub fn generation_path(root: &Path, index: usize, generation: u64) -> PathBuf {
    partition_dir(root, index).join(format!("{}.log", generation))
}

/// Generation files of partition `index`, sorted oldest first.
pub fn list_generations(root: &Path, index: usize) -> io::Result<Vec<u64>> {
    let dir = partition_dir(root, index);
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let mut generations = Vec::new();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".log")) else {
            continue;
        };
        if let Ok(generation) = stem.parse::<u64>() {
            generations.push(generation);
        }
    }
    generations.sort_unstable();
    Ok(generations)
}

/// Indices of every `partition-<n>` directory under `root`.
pub fn list_partitions(root: &Path) -> io::Result<Vec<usize>> {
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let mut partitions = Vec::new();
    for entry in entries {
        let entry = entry?;
        if let Some(index) = entry
            .file_name()
            .to_str()
            .and_then(|n| n.strip_prefix("partition-"))
            .and_then(|n| n.parse::<usize>().ok())
        {
            partitions.push(index);
        }
    }
    partitions.sort_unstable();
    Ok(partitions)
}

/// Writer for one partition.
#[derive(Debug)]
pub struct Partition {
    index: usize,
    root: PathBuf,
    generation: u64,
    writer: Option<File>,
    len: u64,
    batches: u64,
}

impl Partition {
    /// A partition that will append to `generation` once written to.
    pub fn new(root: impl Into<PathBuf>, index: usize, generation: u64) -> Self {
        Self {
            index,
            root: root.into(),
            generation,
            writer: None,
            len: 0,
            batches: 0,
        }
    }

    /// Partition number.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Generation currently appended to.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Batches appended since the last rotation.
    pub fn batches(&self) -> u64 {
        self.batches
    }

    /// Appends one framed batch and syncs it per `sync_mode`.
    ///
    /// A failed append truncates the file back to where it started so the
    /// next batch does not land behind a torn frame.
    pub fn append(&mut self, frame: &[u8], sync_mode: SyncMode) -> io::Result<()> {
        let start = self.len;
        let file = self.writer()?;
        let result = file.write_all(frame).and_then(|_| match sync_mode {
            SyncMode::Sync => file.sync_data(),
            SyncMode::AsyncSync => Ok(()),
        });
        match result {
            Ok(()) => {
                self.len = start + frame.len() as u64;
                self.batches += 1;
                Ok(())
            }
            Err(e) => {
                if let Err(trunc) = file.set_len(start) {
                    warn!(
                        partition = self.index,
                        generation = self.generation,
                        error = %trunc,
                        "failed to truncate partition after a failed append"
                    );
                }
                self.writer = None;
                Err(e)
            }
        }
    }

    /// Switches to `generation`. The previous file is synced and closed.
    pub fn rotate(&mut self, generation: u64) -> io::Result<()> {
        if let Some(file) = self.writer.take() {
            file.sync_all()?;
        }
        debug!(partition = self.index, from = self.generation, to = generation, "rotated partition");
        self.generation = generation;
        self.len = 0;
        self.batches = 0;
        Ok(())
    }

    /// Flushes the current generation to stable storage.
    pub fn sync(&mut self) -> io::Result<()> {
        match &self.writer {
            Some(file) => file.sync_all(),
            None => Ok(()),
        }
    }

    fn writer(&mut self) -> io::Result<&mut File> {
        if self.writer.is_none() {
            let dir = partition_dir(&self.root, self.index);
            fs::create_dir_all(&dir)?;
            let path = generation_path(&self.root, self.index, self.generation);
            let file = OpenOptions::new().create(true).append(true).open(&path)?;
            self.len = file.metadata()?.len();
            self.writer = Some(file);
        }
        match self.writer.as_mut() {
            Some(file) => Ok(file),
            None => Err(io::Error::other("partition writer unavailable")),
        }
    }
}

// THEORY:
// The `ValueStore` is the memory of a heatmap run. It maps cell indices to their
// finalized `ValueRecord`s and mirrors every finalization into an append-only journal
// of JSON lines, so an interrupted extraction can resume where it stopped.
//
// Key architectural principles:
// 1.  **Append Only**: During a run the journal is only ever appended to, one line per
//     finalized cell. A fresh run truncates it; a resumed run reads it back in full
//     before any fetching starts.
// 2.  **Exclusive Writes**: `append` takes `&mut self`. Concurrent writers must go
//     through a single lock around the whole store, which makes the in-memory update
//     and the journal line one indivisible step.
// 3.  **Torn Tail Recovery**: A process killed mid-write can leave a partial last line.
//     That line is dropped with a warning; a bad line anywhere else means the journal
//     is corrupt and is reported as such.
// 4.  **Raw Journal**: Normalization rewrites records in memory only. The journal keeps
//     raw values, so a resumed run re-normalizes from the same inputs.

use crate::core_modules::cell_value::ValueRecord;
use crate::core_modules::grid_builder::Grid;
use crate::error::{HeatmapError, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// The durable side of the store.
#[derive(Debug)]
struct Journal {
    path: PathBuf,
    file: File,
}

impl Journal {
    fn write(&mut self, record: &ValueRecord) -> Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        self.file.write_all(&line)?;
        self.file.flush()?;
        Ok(())
    }
}

/// Finalized records keyed by cell index, optionally backed by a journal file.
#[derive(Debug, Default)]
pub struct ValueStore {
    records: BTreeMap<usize, ValueRecord>,
    journal: Option<Journal>,
}

impl ValueStore {
    /// A store that keeps records in memory only.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Opens the journal at `path`. With `resume` set and an existing file, its records
    /// are loaded and new records are appended after them; otherwise the file is
    /// created or truncated and the store starts empty.
    pub fn load(path: impl AsRef<Path>, resume: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let records = if resume && path.is_file() {
            let (records, intact_len, unterminated) = read_journal(&path)?;
            let mut file = OpenOptions::new().append(true).open(&path)?;
            if file.metadata()?.len() > intact_len {
                file.set_len(intact_len)?;
            }
            if unterminated {
                file.write_all(b"\n")?;
            }
            info!(path = %path.display(), records = records.len(), "resuming from journal");
            records
        } else {
            File::create(&path)?;
            debug!(path = %path.display(), "started fresh journal");
            BTreeMap::new()
        };

        let file = OpenOptions::new().append(true).create(true).open(&path)?;
        Ok(Self {
            records,
            journal: Some(Journal { path, file }),
        })
    }

    /// Loads the journal at `path`, if any, into a store that never writes back.
    pub fn read_only(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let records = if path.is_file() {
            read_journal(path)?.0
        } else {
            BTreeMap::new()
        };
        info!(path = %path.display(), records = records.len(), "loaded journal read-only");
        Ok(Self { records, journal: None })
    }

    /// Finalizes one record: updates the mapping and appends it to the journal.
    pub fn append(&mut self, record: ValueRecord) -> Result<()> {
        if let Some(journal) = self.journal.as_mut() {
            journal.write(&record)?;
        }
        self.records.insert(record.idx, record);
        Ok(())
    }

    /// Every cell index of `grid` without a finalized record.
    pub fn missing(&self, grid: &Grid) -> BTreeSet<usize> {
        grid.indices()
            .filter(|idx| !self.records.contains_key(idx))
            .collect()
    }

    /// Drops records whose index is not part of `grid`, returning how many were dropped.
    /// Only the in-memory view changes; the journal is left as written.
    pub fn retain_grid(&mut self, grid: &Grid) -> usize {
        let before = self.records.len();
        self.records.retain(|idx, _| grid.get(*idx).is_some());
        before - self.records.len()
    }

    pub fn get(&self, idx: usize) -> Option<&ValueRecord> {
        self.records.get(&idx)
    }

    pub fn contains(&self, idx: usize) -> bool {
        self.records.contains_key(&idx)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> impl Iterator<Item = &ValueRecord> {
        self.records.values()
    }

    pub fn records_mut(&mut self) -> impl Iterator<Item = &mut ValueRecord> {
        self.records.values_mut()
    }

    pub fn journal_path(&self) -> Option<&Path> {
        self.journal.as_ref().map(|j| j.path.as_path())
    }
}

/// Reads every record from the journal. Returns the records and the byte length of the
/// intact prefix, which is shorter than the file only when a torn last line was dropped,
/// and whether that prefix lacks its final newline.
///
/// Lines are parsed as raw bytes: a tail cut inside a multibyte character is just
/// another torn line.
fn read_journal(path: &Path) -> Result<(BTreeMap<usize, ValueRecord>, u64, bool)> {
    let contents = std::fs::read(path)?;
    let lines: Vec<&[u8]> = contents.split_inclusive(|b| *b == b'\n').collect();
    let last_line = lines.iter().rposition(|l| !l.trim_ascii().is_empty());

    let mut records = BTreeMap::new();
    let mut intact_len = 0usize;
    for (i, line) in lines.iter().enumerate() {
        let trimmed = line.trim_ascii();
        if !trimmed.is_empty() {
            match serde_json::from_slice::<ValueRecord>(trimmed) {
                Ok(record) => {
                    records.insert(record.idx, record);
                }
                Err(e) if Some(i) == last_line => {
                    let path = path.display();
                    warn!(%path, line = i + 1, error = %e, "dropping torn journal line");
                    break;
                }
                Err(source) => return Err(HeatmapError::CorruptJournal { line: i + 1, source }),
            }
        }
        intact_len += line.len();
    }
    let unterminated = contents[..intact_len].last().is_some_and(|b| *b != b'\n');
    Ok((records, intact_len as u64, unterminated))
}

//! File-tier record store
//!
//! Layout under the store root:
//!
//! ```text
//! records/
//!   bill-118/
//!     118-hr-82.json        first version of a record
//!     118-hr-82.v2.json     written by a re-fetch, never overwrites v1
//!     _index.json           compacted index snapshot
//!     _index.journal        one JSON line per id added since the snapshot
//! ```
//!
//! Record files are written to a temporary file in the same directory,
//! fsync'd, then renamed into place, so a reader sees either nothing or the
//! complete record. The temporary file is removed on every failure path.
//! The index is append-only: ids are added, never removed.

use crate::error::{IngestError, IngestResult};
use crate::models::{CollectionIndex, Record};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

const INDEX_SNAPSHOT: &str = "_index.json";
const INDEX_JOURNAL: &str = "_index.journal";

/// One journal line
#[derive(Debug, Serialize, Deserialize)]
struct JournalEntry {
    id: String,
    at: DateTime<Utc>,
}

/// Directory-backed store of records and collection indexes
#[derive(Debug, Clone)]
pub struct RecordStore {
    root: PathBuf,
}

impl RecordStore {
    /// Open (creating if needed) a store rooted at `root`
    pub fn open(root: impl Into<PathBuf>) -> IngestResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| storage_error(&root, e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn collection_dir(&self, collection_key: &str) -> PathBuf {
        self.root.join(collection_key)
    }

    /// Persist a record atomically
    ///
    /// Returns the record as stored, with its version number assigned.
    pub async fn write(&self, record: &Record) -> IngestResult<Record> {
        let dir = self.collection_dir(&record.collection_key);
        let record = record.clone();
        run_blocking(move || write_record(&dir, record)).await
    }

    /// Durably add an id to a collection's index
    ///
    /// Must only be called after the record write returned.
    pub async fn append_index(
        &self,
        collection_key: &str,
        id: &str,
        at: DateTime<Utc>,
    ) -> IngestResult<()> {
        let dir = self.collection_dir(collection_key);
        let entry = JournalEntry {
            id: id.to_string(),
            at,
        };
        run_blocking(move || append_journal(&dir, &entry)).await
    }

    /// Read a collection's index (snapshot merged with journal)
    pub async fn read_index(&self, collection_key: &str) -> IngestResult<CollectionIndex> {
        let dir = self.collection_dir(collection_key);
        let key = collection_key.to_string();
        run_blocking(move || read_index(&dir, &key)).await
    }

    /// Fold the journal into a fresh snapshot and truncate the journal
    pub async fn compact_index(&self, collection_key: &str) -> IngestResult<CollectionIndex> {
        let dir = self.collection_dir(collection_key);
        let key = collection_key.to_string();
        run_blocking(move || compact_index(&dir, &key)).await
    }

    /// Newest version of a record, if any version exists
    pub async fn read_latest(&self, collection_key: &str, id: &str) -> IngestResult<Option<Record>> {
        let dir = self.collection_dir(collection_key);
        let id = id.to_string();
        run_blocking(move || read_latest(&dir, &id)).await
    }

    /// Lazy, restartable iteration over the indexed records of a collection
    ///
    /// Ids are visited in sorted order, so two iterations over an unchanged
    /// collection yield the same sequence.
    pub async fn iterate(&self, collection_key: &str) -> IngestResult<RecordIter> {
        let index = self.read_index(collection_key).await?;
        Ok(RecordIter {
            dir: self.collection_dir(collection_key),
            ids: index.known_ids.into_iter().collect(),
            position: 0,
        })
    }
}

/// Iterator over the records of one collection
///
/// Each `next()` reads one record file; nothing is cached.
#[derive(Debug, Clone)]
pub struct RecordIter {
    dir: PathBuf,
    ids: Vec<String>,
    position: usize,
}

impl RecordIter {
    /// Total records in the iteration (independent of position)
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Skip `n` records without reading them
    pub fn skip_records(&mut self, n: usize) {
        self.position = (self.position + n).min(self.ids.len());
    }

    /// Rewind to the first record
    pub fn restart(&mut self) {
        self.position = 0;
    }

    /// Read up to `n` records
    pub fn next_chunk(&mut self, n: usize) -> IngestResult<Vec<Record>> {
        let mut chunk = Vec::with_capacity(n);
        for _ in 0..n {
            match self.next() {
                Some(record) => chunk.push(record?),
                None => break,
            }
        }
        Ok(chunk)
    }
}

impl Iterator for RecordIter {
    type Item = IngestResult<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.ids.get(self.position)?.clone();
        self.position += 1;

        Some(match read_latest(&self.dir, &id) {
            Ok(Some(record)) => Ok(record),
            Ok(None) => Err(IngestError::Common(legis_common::Error::NotFound(format!(
                "indexed record {} missing from {}",
                id,
                self.dir.display()
            )))),
            Err(e) => Err(e),
        })
    }
}

async fn run_blocking<T, F>(f: F) -> IngestResult<T>
where
    F: FnOnce() -> IngestResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| IngestError::Other(anyhow::anyhow!("storage task failed: {}", e)))?
}

fn storage_error(path: &Path, err: impl std::fmt::Display) -> IngestError {
    IngestError::StorageWriteFailure {
        path: path.display().to_string(),
        message: err.to_string(),
    }
}

fn version_path(dir: &Path, id: &str, version: u32) -> PathBuf {
    if version <= 1 {
        dir.join(format!("{}.json", id))
    } else {
        dir.join(format!("{}.v{}.json", id, version))
    }
}

fn latest_version(dir: &Path, id: &str) -> Option<u32> {
    if !version_path(dir, id, 1).exists() {
        return None;
    }
    let mut version = 1;
    while version_path(dir, id, version + 1).exists() {
        version += 1;
    }
    Some(version)
}

fn write_record(dir: &Path, mut record: Record) -> IngestResult<Record> {
    fs::create_dir_all(dir).map_err(|e| storage_error(dir, e))?;

    let mut version = latest_version(dir, &record.id).map_or(1, |v| v + 1);
    loop {
        record.version = version;
        let target = version_path(dir, &record.id, version);

        // Dropping the temp file on any early return deletes it
        let mut tmp = NamedTempFile::new_in(dir).map_err(|e| storage_error(dir, e))?;
        serde_json::to_writer(&mut tmp, &record).map_err(|e| storage_error(&target, e))?;
        tmp.flush().map_err(|e| storage_error(&target, e))?;
        tmp.as_file().sync_all().map_err(|e| storage_error(&target, e))?;

        match tmp.persist_noclobber(&target) {
            Ok(_) => break,
            Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => {
                // Another writer took this version; take the next one
                version += 1;
            }
            Err(e) => return Err(storage_error(&target, e.error)),
        }
    }

    sync_dir(dir).map_err(|e| storage_error(dir, e))?;
    Ok(record)
}

fn append_journal(dir: &Path, entry: &JournalEntry) -> IngestResult<()> {
    fs::create_dir_all(dir).map_err(|e| storage_error(dir, e))?;
    let path = dir.join(INDEX_JOURNAL);

    let mut line = serde_json::to_vec(entry).map_err(|e| storage_error(&path, e))?;
    line.push(b'\n');

    let mut file = OpenOptions::new()
        .create(true)
        .read(true)
        .append(true)
        .open(&path)
        .map_err(|e| storage_error(&path, e))?;

    // Terminate a torn final line so the new entry starts on its own line
    if ends_mid_line(&mut file).map_err(|e| storage_error(&path, e))? {
        line.insert(0, b'\n');
    }
    file.write_all(&line).map_err(|e| storage_error(&path, e))?;
    file.sync_data().map_err(|e| storage_error(&path, e))?;
    Ok(())
}

fn ends_mid_line(file: &mut File) -> std::io::Result<bool> {
    if file.metadata()?.len() == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}

fn read_index(dir: &Path, collection_key: &str) -> IngestResult<CollectionIndex> {
    let snapshot_path = dir.join(INDEX_SNAPSHOT);
    let mut index = if snapshot_path.exists() {
        let content = fs::read(&snapshot_path)?;
        serde_json::from_slice::<CollectionIndex>(&content)?
    } else {
        CollectionIndex::new(collection_key)
    };

    let journal_path = dir.join(INDEX_JOURNAL);
    if journal_path.exists() {
        let reader = BufReader::new(File::open(&journal_path)?);
        for (line_no, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<JournalEntry>(&line) {
                Ok(entry) => {
                    index.insert(entry.id, entry.at);
                }
                Err(e) => {
                    // A crash mid-append leaves a torn final line
                    tracing::warn!(
                        journal = %journal_path.display(),
                        line = line_no + 1,
                        error = %e,
                        "Ignoring unreadable index journal line"
                    );
                }
            }
        }
    }

    Ok(index)
}

fn compact_index(dir: &Path, collection_key: &str) -> IngestResult<CollectionIndex> {
    let index = read_index(dir, collection_key)?;
    fs::create_dir_all(dir).map_err(|e| storage_error(dir, e))?;

    let snapshot_path = dir.join(INDEX_SNAPSHOT);
    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| storage_error(dir, e))?;
    serde_json::to_writer(&mut tmp, &index).map_err(|e| storage_error(&snapshot_path, e))?;
    tmp.flush().map_err(|e| storage_error(&snapshot_path, e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| storage_error(&snapshot_path, e))?;
    tmp.persist(&snapshot_path)
        .map_err(|e| storage_error(&snapshot_path, e.error))?;

    // Snapshot is durable; journal entries are now redundant
    let journal_path = dir.join(INDEX_JOURNAL);
    if journal_path.exists() {
        File::create(&journal_path)
            .and_then(|f| f.sync_all())
            .map_err(|e| storage_error(&journal_path, e))?;
    }
    sync_dir(dir).map_err(|e| storage_error(dir, e))?;

    tracing::debug!(collection = collection_key, ids = index.len(), "Index compacted");
    Ok(index)
}

fn read_latest(dir: &Path, id: &str) -> IngestResult<Option<Record>> {
    let Some(version) = latest_version(dir, id) else {
        return Ok(None);
    };
    let content = fs::read(version_path(dir, id, version))?;
    Ok(Some(serde_json::from_slice(&content)?))
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> std::io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

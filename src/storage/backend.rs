//! Durable boundary: where committed batches go before they become visible.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::types::checksum::frame_crc32;
use crate::types::{AssocError, Result};

use super::patch::CommitRecord;

const FRAME_HEADER_LEN: usize = 8;

/// Persistence backend for commit records.
///
/// `append` must either persist the whole record or leave the store as if it
/// had never been called; replay returns every fully persisted record in order.
pub trait ObjectStore: Send + Sync {
    /// Returns all committed records, oldest first.
    fn replay(&self) -> Result<Vec<CommitRecord>>;
    /// Persists one commit record.
    fn append(&self, record: &CommitRecord) -> Result<()>;
    /// Flushes appended records to stable storage.
    fn sync(&self) -> Result<()>;
}

/// Volatile store; records live as long as the value does.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<Vec<CommitRecord>>,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl ObjectStore for MemoryStore {
    fn replay(&self) -> Result<Vec<CommitRecord>> {
        Ok(self.records.lock().clone())
    }

    fn append(&self, record: &CommitRecord) -> Result<()> {
        self.records.lock().push(record.clone());
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

/// Append-only commit log on disk.
///
/// Each frame is `[len u32 LE][crc32 u32 LE][json payload]`. A frame cut short
/// by a crash is dropped when the log is opened.
pub struct LogFileStore {
    path: PathBuf,
    file: Mutex<File>,
    sync_on_append: bool,
}

impl LogFileStore {
    /// Opens or creates the log at `path`, truncating a torn trailing frame.
    pub fn open(path: impl AsRef<Path>, sync_on_append: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        let scan = scan_frames(&bytes)?;
        if scan.valid_len < bytes.len() {
            warn!(
                path = %path.display(),
                kept = scan.valid_len,
                dropped = bytes.len() - scan.valid_len,
                "commit_log.open.torn_tail"
            );
            file.set_len(scan.valid_len as u64)?;
            file.sync_all()?;
        }
        file.seek(SeekFrom::End(0))?;
        info!(path = %path.display(), records = scan.records.len(), "commit_log.open");
        Ok(Self {
            path,
            file: Mutex::new(file),
            sync_on_append,
        })
    }

    /// Location of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ObjectStore for LogFileStore {
    fn replay(&self) -> Result<Vec<CommitRecord>> {
        let mut file = self.file.lock();
        let mut bytes = Vec::new();
        file.seek(SeekFrom::Start(0))?;
        file.read_to_end(&mut bytes)?;
        file.seek(SeekFrom::End(0))?;
        Ok(scan_frames(&bytes)?.records)
    }

    fn append(&self, record: &CommitRecord) -> Result<()> {
        let payload = serde_json::to_vec(record)?;
        let len = u32::try_from(payload.len())
            .map_err(|_| AssocError::Invalid("commit record exceeds frame size limit"))?;
        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(&frame_crc32(len, &payload).to_le_bytes());
        frame.extend_from_slice(&payload);

        let mut file = self.file.lock();
        let start = file.seek(SeekFrom::End(0))?;
        if let Err(err) = file.write_all(&frame) {
            // Leave no partial frame behind for the next append to follow.
            let _ = file.set_len(start);
            return Err(err.into());
        }
        if self.sync_on_append {
            file.sync_data()?;
        }
        debug!(txn = %record.txn, bytes = frame.len(), "commit_log.append");
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.lock().sync_all()?;
        Ok(())
    }
}

struct FrameScan {
    records: Vec<CommitRecord>,
    valid_len: usize,
}

/// Decodes frames until the end of the buffer or the first incomplete frame.
/// A damaged frame followed by further data is corruption, not a torn tail.
fn scan_frames(bytes: &[u8]) -> Result<FrameScan> {
    let mut records = Vec::new();
    let mut offset = 0usize;
    while offset < bytes.len() {
        let rest = &bytes[offset..];
        if rest.len() < FRAME_HEADER_LEN {
            break;
        }
        let len = u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]);
        let crc = u32::from_le_bytes([rest[4], rest[5], rest[6], rest[7]]);
        let end = FRAME_HEADER_LEN + len as usize;
        if rest.len() < end {
            break;
        }
        let payload = &rest[FRAME_HEADER_LEN..end];
        if frame_crc32(len, payload) != crc {
            if rest.len() == end {
                break;
            }
            return Err(AssocError::Corruption(format!(
                "commit log frame at offset {offset} failed its checksum"
            )));
        }
        records.push(serde_json::from_slice(payload)?);
        offset += end;
    }
    Ok(FrameScan {
        records,
        valid_len: offset,
    })
}

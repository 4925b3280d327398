//! The Write-Ahead Log.
//!
//! An append-only file of framed records. Every record carries the full
//! before- and after-image of the page it describes, so a dirty page may
//! be written to its table file only after the matching [`WalRecord`] has
//! been appended and the log forced to durable storage.

use crate::failpoint;
use crate::lock_mutex_recover;
use crate::transaction::TransactionId;
use crate::PageId;
use crc32fast::Hasher;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// A Log Sequence Number: the byte offset of a record in the log file.
pub type Lsn = u64;

/// Bytes of framing before each record payload: total_len (u32 LE)
/// followed by the CRC of the payload (u32 LE).
const RECORD_HEADER_SIZE: usize = 8;

/// A single record in the WAL.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum WalRecord {
    /// A page modified by `tx_id`: its bytes as of the last clean state
    /// and its current contents.
    Update {
        tx_id: TransactionId,
        page_id: PageId,
        before: Vec<u8>,
        after: Vec<u8>,
    },
    /// The commit of a transaction.
    Commit { tx_id: TransactionId },
    /// The abort of a transaction.
    Abort { tx_id: TransactionId },
}

/// The WAL manager. The log file is a long-lived process-wide resource,
/// unlike table files which are opened per call.
pub struct WalManager {
    file: Mutex<File>,
    path: PathBuf,
    next_lsn: AtomicU64,
}

impl WalManager {
    /// Opens (or creates) the log file and positions the append cursor at
    /// its end.
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path_buf = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path_buf)?;
        let next_lsn = AtomicU64::new(file.metadata()?.len());
        Ok(Self {
            file: Mutex::new(file),
            path: path_buf,
            next_lsn,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends an update record for `page_id`. The caller must follow up
    /// with [`WalManager::force`] before writing the page to its file.
    pub fn log_update(
        &self,
        tx_id: TransactionId,
        page_id: PageId,
        before: &[u8],
        after: &[u8],
    ) -> io::Result<Lsn> {
        self.append(&WalRecord::Update {
            tx_id,
            page_id,
            before: before.to_vec(),
            after: after.to_vec(),
        })
    }

    pub fn log_commit(&self, tx_id: TransactionId) -> io::Result<Lsn> {
        self.append(&WalRecord::Commit { tx_id })
    }

    pub fn log_abort(&self, tx_id: TransactionId) -> io::Result<Lsn> {
        self.append(&WalRecord::Abort { tx_id })
    }

    /// Forces everything appended so far to durable storage.
    pub fn force(&self) -> io::Result<()> {
        failpoint::maybe_fail("wal.force")?;
        lock_mutex_recover(&self.file).sync_all()
    }

    fn append(&self, record: &WalRecord) -> io::Result<Lsn> {
        let payload = bincode::serialize(record)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let total_len = (RECORD_HEADER_SIZE + payload.len()) as u32;

        let mut hasher = Hasher::new();
        hasher.update(&payload);
        let crc = hasher.finalize();

        let lsn = self.next_lsn.fetch_add(total_len as u64, Ordering::SeqCst);
        let mut file = lock_mutex_recover(&self.file);
        file.seek(SeekFrom::Start(lsn))?;
        file.write_all(&total_len.to_le_bytes())?;
        file.write_all(&crc.to_le_bytes())?;
        file.write_all(&payload)?;
        Ok(lsn)
    }

    /// Reads the record at `lsn`, verifying its checksum. Returns the
    /// record and the LSN of its successor, or `None` past the log's end.
    pub fn read_record(&self, lsn: Lsn) -> io::Result<Option<(WalRecord, Lsn)>> {
        let mut file = lock_mutex_recover(&self.file);
        if lsn >= file.metadata()?.len() {
            return Ok(None);
        }

        file.seek(SeekFrom::Start(lsn))?;
        let mut header = [0u8; RECORD_HEADER_SIZE];
        file.read_exact(&mut header)?;
        let total_len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

        let payload_len = (total_len as usize).saturating_sub(RECORD_HEADER_SIZE);
        let mut payload = vec![0u8; payload_len];
        file.read_exact(&mut payload)?;

        let mut hasher = Hasher::new();
        hasher.update(&payload);
        if hasher.finalize() != crc {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "WAL record CRC mismatch",
            ));
        }

        let record = bincode::deserialize(&payload)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(Some((record, lsn + total_len as u64)))
    }

    /// Scans the whole log in append order.
    pub fn records(&self) -> io::Result<Vec<WalRecord>> {
        let mut out = Vec::new();
        let mut lsn = 0;
        while let Some((record, next)) = self.read_record(lsn)? {
            out.push(record);
            lsn = next;
        }
        Ok(out)
    }
}

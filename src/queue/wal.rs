//! Queue write-ahead log
//!
//! Append-only file of queue operations, written before the corresponding
//! in-memory change is exposed. Record framing:
//!
//! ```text
//! [LEN u32 BE][TAG u8][PAYLOAD bytes]
//! ```
//!
//! LEN counts the tag byte plus the payload. Tags: `E` enqueue, `D` dequeue,
//! `A` ack, `R` redeliver. An enqueue payload is the bincode message; the
//! others carry the raw msg_id bytes. The default policy flushes to stable
//! storage per record; replay stops at the first torn or corrupt record.

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

const TAG_ENQUEUE: u8 = b'E';
const TAG_DEQUEUE: u8 = b'D';
const TAG_ACK: u8 = b'A';
const TAG_REDELIVER: u8 = b'R';

/// A queued message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMessage {
    /// Globally unique: `<node_id>-<monotonic_seq>`
    pub msg_id: String,
    pub queue_name: String,
    pub payload: Vec<u8>,
    pub enqueued_at_ms: u64,
    pub attempt_count: u32,
}

/// One durable queue operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalRecord {
    Enqueue(QueueMessage),
    Dequeue { msg_id: String },
    Ack { msg_id: String },
    Redeliver { msg_id: String },
}

/// Append-only queue log with per-record flush
pub struct Wal {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl Wal {
    /// Open or create the WAL file
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record and flush it to stable storage before returning
    pub fn append(&mut self, record: &WalRecord) -> Result<()> {
        let (tag, payload) = match record {
            WalRecord::Enqueue(msg) => {
                let bytes = bincode::serialize(msg)
                    .map_err(|e| Error::Wal(format!("serialize message: {}", e)))?;
                (TAG_ENQUEUE, bytes)
            }
            WalRecord::Dequeue { msg_id } => (TAG_DEQUEUE, msg_id.as_bytes().to_vec()),
            WalRecord::Ack { msg_id } => (TAG_ACK, msg_id.as_bytes().to_vec()),
            WalRecord::Redeliver { msg_id } => (TAG_REDELIVER, msg_id.as_bytes().to_vec()),
        };

        let len = (payload.len() + 1) as u32;
        self.writer.write_all(&len.to_be_bytes())?;
        self.writer.write_all(&[tag])?;
        self.writer.write_all(&payload)?;
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;

        Ok(())
    }

    /// Replay all records in order, stopping at the first corrupt record
    pub fn replay<F>(path: impl AsRef<Path>, mut callback: F) -> Result<()>
    where
        F: FnMut(WalRecord) -> Result<()>,
    {
        let file = match File::open(path.as_ref()) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let mut reader = BufReader::new(file);

        loop {
            match Self::read_record(&mut reader) {
                Ok(Some(record)) => callback(record)?,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("WAL replay stopped at corrupt record: {}", e);
                    break;
                }
            }
        }

        Ok(())
    }

    fn read_record<R: Read>(reader: &mut R) -> Result<Option<WalRecord>> {
        let mut len_bytes = [0u8; 4];
        match reader.read_exact(&mut len_bytes) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_be_bytes(len_bytes) as usize;
        if len == 0 {
            return Err(Error::Wal("zero-length record".into()));
        }

        let mut tag = [0u8; 1];
        reader.read_exact(&mut tag)?;

        let mut payload = vec![0u8; len - 1];
        reader.read_exact(&mut payload)?;

        let record = match tag[0] {
            TAG_ENQUEUE => {
                let msg: QueueMessage = bincode::deserialize(&payload)
                    .map_err(|e| Error::Wal(format!("decode message: {}", e)))?;
                WalRecord::Enqueue(msg)
            }
            TAG_DEQUEUE => WalRecord::Dequeue {
                msg_id: decode_msg_id(payload)?,
            },
            TAG_ACK => WalRecord::Ack {
                msg_id: decode_msg_id(payload)?,
            },
            TAG_REDELIVER => WalRecord::Redeliver {
                msg_id: decode_msg_id(payload)?,
            },
            other => return Err(Error::Wal(format!("unknown record tag: {:#x}", other))),
        };

        Ok(Some(record))
    }

    /// Force buffered records to stable storage
    pub fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }
}

fn decode_msg_id(payload: Vec<u8>) -> Result<String> {
    String::from_utf8(payload).map_err(|_| Error::Wal("invalid UTF-8 in msg_id".into()))
}

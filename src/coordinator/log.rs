//! Operation log: ordered, causally-chained positions for replicated requests
//!
//! Every request replicated by a coordinator is appended here first and gets
//! a [`LogId`] assigned. Identifiers are strictly increasing with no gaps
//! under single-writer access; each entry records the term of its
//! predecessor, which lets a rejoining node verify it is resuming from a
//! compatible history.
//!
//! The log is in-memory by default. [`OperationLog::open`] adds an
//! append-only file backend with crc-framed entries: on open the file is
//! replayed to rebuild the tail, stopping at the first corrupted frame.

use crate::common::{Error, Result};
use crate::coordinator::requests::NodeRequest;
use crate::coordinator::wire;
use bytes::{Bytes, BytesMut};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

const LOG_MAGIC: [u8; 4] = [0x4F, 0x50, 0x4C, 0x31]; // "OPL1"

/// Position marker in the replicated operation log.
///
/// Ordering is by `id` only; equality requires all three fields to match.
/// The wire encoding reserves (-1, -1, -1) for "absent", so valid identifiers
/// never carry a negative `id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LogId {
    pub id: i64,
    pub term: i64,
    pub previous_term: i64,
}

impl PartialOrd for LogId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for LogId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.id.cmp(&other.id)
    }
}

impl std::fmt::Display for LogId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.term, self.id)
    }
}

/// Append-only log of (LogId, request) entries for one database.
///
/// Owned exclusively by that database's coordinator; never shared.
pub struct OperationLog {
    entries: Vec<(LogId, NodeRequest)>,
    term: i64,
    writer: Option<BufWriter<File>>,
    path: Option<PathBuf>,
}

impl OperationLog {
    /// In-memory log starting at the given leader term.
    pub fn new(term: i64) -> Self {
        Self {
            entries: Vec::new(),
            term,
            writer: None,
            path: None,
        }
    }

    /// Open a file-backed log, replaying any existing entries.
    pub fn open(path: impl AsRef<Path>, term: i64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let entries = Self::replay(&path)?;

        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            entries,
            term,
            writer: Some(BufWriter::new(file)),
            path: Some(path),
        })
    }

    fn replay(path: &Path) -> Result<Vec<(LogId, NodeRequest)>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut reader = BufReader::new(file);
        let mut entries = Vec::new();

        loop {
            match Self::read_frame(&mut reader) {
                Ok(Some(entry)) => entries.push(entry),
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("operation log replay stopped at corrupted frame: {}", e);
                    break;
                }
            }
        }

        Ok(entries)
    }

    fn read_frame<R: Read>(reader: &mut R) -> Result<Option<(LogId, NodeRequest)>> {
        let mut magic = [0u8; 4];
        match reader.read_exact(&mut magic) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        if magic != LOG_MAGIC {
            return Err(Error::Corrupted("invalid log magic".into()));
        }

        let mut len_bytes = [0u8; 4];
        reader.read_exact(&mut len_bytes)?;
        let len = u32::from_le_bytes(len_bytes) as usize;

        let mut body = vec![0u8; len];
        reader.read_exact(&mut body)?;

        let mut crc_bytes = [0u8; 4];
        reader.read_exact(&mut crc_bytes)?;
        let stored = u32::from_le_bytes(crc_bytes);
        if crc32fast::hash(&body) != stored {
            return Err(Error::Corrupted("checksum mismatch".into()));
        }

        let mut buf = Bytes::from(body);
        let id = wire::get_opt_log_id(&mut buf)?
            .ok_or_else(|| Error::Corrupted("absent log id in frame".into()))?;
        let request = NodeRequest::decode(&mut buf)?;
        Ok(Some((id, request)))
    }

    fn write_frame(&mut self, id: LogId, request: &NodeRequest) -> Result<()> {
        let Some(writer) = self.writer.as_mut() else {
            return Ok(());
        };

        let mut body = BytesMut::new();
        wire::put_opt_log_id(&mut body, Some(id));
        request.encode_into(&mut body)?;

        writer.write_all(&LOG_MAGIC)?;
        writer.write_all(&(body.len() as u32).to_le_bytes())?;
        writer.write_all(&body)?;
        writer.write_all(&crc32fast::hash(&body).to_le_bytes())?;
        writer.flush()?;
        Ok(())
    }

    /// Append a request, assigning the next identifier.
    ///
    /// `id` is the previous id plus one (0 for the first entry), `term` is
    /// the current leader term, and `previous_term` chains to the term of the
    /// previous entry (-1 when there is none).
    pub fn append(&mut self, request: NodeRequest) -> Result<LogId> {
        let id = match self.entries.last() {
            Some((last, _)) => LogId {
                id: last.id + 1,
                term: self.term,
                previous_term: last.term,
            },
            None => LogId {
                id: 0,
                term: self.term,
                previous_term: -1,
            },
        };

        self.write_frame(id, &request)?;
        self.entries.push((id, request));
        Ok(id)
    }

    /// Most recent identifier, or `None` when the log is empty. O(1).
    pub fn last_persistent_log(&self) -> Option<LogId> {
        self.entries.last().map(|(id, _)| *id)
    }

    /// Entries strictly after the given position, oldest first. Used to
    /// resend missed operations to a catching-up member.
    pub fn entries_after(&self, from: LogId) -> Vec<(LogId, NodeRequest)> {
        self.entries
            .iter()
            .filter(|(id, _)| id.id > from.id)
            .cloned()
            .collect()
    }

    /// All entries, oldest first. Basis of a full resync.
    pub fn entries(&self) -> &[(LogId, NodeRequest)] {
        &self.entries
    }

    /// Current leader term used for newly appended entries.
    pub fn set_term(&mut self, term: i64) {
        self.term = term;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Path of the backing file, if durable.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

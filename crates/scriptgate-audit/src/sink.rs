//! Storage backends for audit events
//!
//! A sink only ever appends. Reads hand out committed events lazily; an
//! event is visible only once its full record has been written.

use crate::error::AuditError;
use crate::event::AuditEvent;
use parking_lot::{Mutex, RwLock};
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Lazy sequence of committed events
pub type EventIter<'a> = Box<dyn Iterator<Item = Result<AuditEvent, AuditError>> + Send + 'a>;

/// Append-only event storage
pub trait AuditSink: Send + Sync + std::fmt::Debug {
    /// Durably record `event`
    ///
    /// # Errors
    /// Returns [`AuditError::SinkFailure`] if the event may not have been recorded
    fn write(&self, event: &AuditEvent) -> Result<(), AuditError>;

    /// Committed events, oldest first
    ///
    /// # Errors
    /// Returns error if the backing store cannot be opened
    fn read(&self) -> Result<EventIter<'_>, AuditError>;

    /// Most recent committed event
    ///
    /// # Errors
    /// Returns error if the backing store cannot be read
    fn last(&self) -> Result<Option<AuditEvent>, AuditError> {
        let mut last = None;
        for event in self.read()? {
            last = Some(event?);
        }
        Ok(last)
    }
}

/// In-memory sink for tests and ephemeral runs
#[derive(Debug, Default)]
pub struct MemorySink {
    events: RwLock<Vec<AuditEvent>>,
}

impl MemorySink {
    /// Empty sink
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored events
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Whether nothing has been stored
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }
}

impl AuditSink for MemorySink {
    fn write(&self, event: &AuditEvent) -> Result<(), AuditError> {
        self.events.write().push(event.clone());
        Ok(())
    }

    fn read(&self) -> Result<EventIter<'_>, AuditError> {
        let mut next = 0usize;
        Ok(Box::new(std::iter::from_fn(move || {
            let event = self.events.read().get(next).cloned()?;
            next += 1;
            Some(Ok(event))
        })))
    }

    fn last(&self) -> Result<Option<AuditEvent>, AuditError> {
        Ok(self.events.read().last().cloned())
    }
}

/// One JSON object per line, synced after every append
#[derive(Debug)]
pub struct JsonlFileSink {
    path: PathBuf,
    file: Mutex<LogFile<File>>,
}

impl JsonlFileSink {
    /// Open (creating if needed) the log at `path`
    ///
    /// # Errors
    /// Returns [`AuditError::SinkFailure`] if the file cannot be opened
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, AuditError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| AuditError::sink(format!("{}: {e}", parent.display())))?;
        }
        repair_torn_tail(&path).map_err(|e| AuditError::sink(format!("{}: {e}", path.display())))?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| AuditError::sink(format!("{}: {e}", path.display())))?;
        Ok(Self {
            path,
            file: Mutex::new(LogFile::new(file)),
        })
    }

    /// Location of the log
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuditSink for JsonlFileSink {
    fn write(&self, event: &AuditEvent) -> Result<(), AuditError> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');
        self.file.lock().append(&line)
    }

    fn read(&self) -> Result<EventIter<'_>, AuditError> {
        let file = File::open(&self.path)
            .map_err(|e| AuditError::sink(format!("{}: {e}", self.path.display())))?;
        Ok(Box::new(JsonlLines {
            reader: BufReader::new(file),
            line: 0,
            done: false,
        }))
    }
}

/// File operations an append relies on
trait AppendTarget: Write {
    /// Current length in bytes
    fn end(&self) -> io::Result<u64>;
    fn truncate(&mut self, len: u64) -> io::Result<()>;
    fn sync(&mut self) -> io::Result<()>;
}

impl AppendTarget for File {
    fn end(&self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }

    fn sync(&mut self) -> io::Result<()> {
        self.sync_data()
    }
}

/// Appends whole records or none
///
/// A failed write or sync cuts the file back to where the record started.
/// If that cut fails too, the length is remembered and retried before the
/// next append, so a later record never lands after a partial one.
#[derive(Debug)]
struct LogFile<T> {
    target: T,
    torn_at: Option<u64>,
}

impl<T: AppendTarget> LogFile<T> {
    fn new(target: T) -> Self {
        Self { target, torn_at: None }
    }

    fn append(&mut self, record: &[u8]) -> Result<(), AuditError> {
        let start = match self.torn_at {
            Some(len) => {
                self.cut(len)?;
                len
            }
            None => self.target.end().map_err(AuditError::sink)?,
        };
        let written = self.target.write_all(record).and_then(|()| self.target.sync());
        if let Err(e) = written {
            self.cut(start)?;
            return Err(AuditError::sink(e));
        }
        Ok(())
    }

    fn cut(&mut self, len: u64) -> Result<(), AuditError> {
        match self.target.truncate(len).and_then(|()| self.target.sync()) {
            Ok(()) => {
                self.torn_at = None;
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, len, "could not remove partial audit record");
                self.torn_at = Some(len);
                Err(AuditError::sink(format!("partial record left in place: {e}")))
            }
        }
    }
}

/// Truncate a trailing record that lacks its newline so new appends start clean
fn repair_torn_tail(path: &Path) -> io::Result<()> {
    const CHUNK: u64 = 4096;

    let mut file = match OpenOptions::new().read(true).write(true).open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    let len = file.metadata()?.len();
    let mut end = len;
    let mut buf = vec![0u8; CHUNK as usize];
    while end > 0 {
        let start = end.saturating_sub(CHUNK);
        let chunk = &mut buf[..(end - start) as usize];
        file.seek(SeekFrom::Start(start))?;
        file.read_exact(chunk)?;
        if let Some(pos) = chunk.iter().rposition(|b| *b == b'\n') {
            end = start + pos as u64 + 1;
            break;
        }
        end = start;
    }
    if end < len {
        tracing::warn!(path = %path.display(), dropped = len - end, "truncating partial audit record");
        file.set_len(end)?;
        file.sync_data()?;
    }
    Ok(())
}

struct JsonlLines {
    reader: BufReader<File>,
    line: usize,
    done: bool,
}

impl Iterator for JsonlLines {
    type Item = Result<AuditEvent, AuditError>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            let mut buf = Vec::new();
            match self.reader.read_until(b'\n', &mut buf) {
                Ok(0) => self.done = true,
                Ok(_) if buf.last() != Some(&b'\n') => {
                    // torn write from a crash mid-append; never committed
                    tracing::warn!(line = self.line + 1, "ignoring partial audit record");
                    self.done = true;
                }
                Ok(_) => {
                    self.line += 1;
                    if buf.iter().all(u8::is_ascii_whitespace) {
                        continue;
                    }
                    return Some(serde_json::from_slice(&buf).map_err(|e| AuditError::Corrupt {
                        line: self.line,
                        message: e.to_string(),
                    }));
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(AuditError::sink(e)));
                }
            }
        }
        None
    }
}

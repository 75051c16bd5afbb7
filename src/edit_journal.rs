//! Edit Journal Module
//!
//! The append-only journal collaborator consumed by the checkpoint engine.
//! The engine and the journal refer to each other only through this trait, so
//! either side can be replaced in tests. `FileEditJournal` is a minimal
//! file-backed implementation: each edit file starts with the layout version
//! as a big-endian i32, followed by framed records.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::image_format::LAYOUT_VERSION;
use crate::storage_set::rename_overwrite;

/// Terminator opcode padding the tail of a pre-allocated edit file.
pub const OP_INVALID: u8 = 0xFF;

/// Errors raised by journal operations.
#[derive(Error, Debug)]
pub enum JournalError {
    #[error("I/O error on edit log {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("edit log {path:?} has layout version {found}, expected {expected}")]
    VersionMismatch {
        path: PathBuf,
        found: i32,
        expected: i32,
    },

    #[error("edit log {path:?} is corrupt: {detail}")]
    Corrupt { path: PathBuf, detail: String },

    #[error("edit journal has no storage attached")]
    NoStorage,
}

pub type JournalResult<T> = Result<T, JournalError>;

fn ioe(path: &Path, source: io::Error) -> JournalError {
    JournalError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// The journal contract the engine drives. One implementation writes real
/// files; tests may substitute their own.
pub trait EditJournal: Send {
    /// Point the journal at the `current/edits` files of the active
    /// edits-role directories. Called whenever set membership changes.
    fn attach(&mut self, edits_files: Vec<PathBuf>);

    /// Open write streams to the active edit files.
    fn open(&mut self) -> JournalResult<()>;

    /// Close all write streams.
    fn close(&mut self) -> JournalResult<()>;

    fn is_open(&self) -> bool;

    /// Create an empty edit file (header only) at an explicit path.
    fn create_edit_log_file(&self, path: &Path) -> JournalResult<()>;

    /// Replay an edit file, returning the number of records it held.
    fn load_edits(&mut self, path: &Path) -> JournalResult<u64>;

    /// Seal the current edit files and direct subsequent writes to
    /// `edits.new`. A journal that is already rolled stays rolled.
    fn roll_edit_log(&mut self) -> JournalResult<()>;

    /// Rename `edits.new` over `edits`, retiring the sealed files.
    fn purge_edit_log(&mut self) -> JournalResult<()>;

    /// Whether every attached directory has an `edits.new`.
    fn exists_new(&self) -> bool;

    fn last_written_tx_id(&self) -> i64;

    fn set_start_transaction_id(&mut self, tx_id: i64);

    /// Clamp a replication factor read from an image into the configured
    /// bounds.
    fn adjust_replication(&self, replication: i16) -> i16;

    /// Drop the edit file that lives under a failed storage directory.
    fn process_io_error(&mut self, dir: &Path);

    /// Modification time (millis) of the newest sealed edit file.
    fn edits_mtime(&self) -> JournalResult<i64>;
}

/// File-backed journal writing one edit stream per edits directory.
pub struct FileEditJournal {
    edits_files: Vec<PathBuf>,
    streams: Vec<(PathBuf, File)>,
    rolled: bool,
    start_tx_id: i64,
    last_written_tx_id: i64,
    min_replication: i16,
    max_replication: i16,
}

impl FileEditJournal {
    pub fn new() -> Self {
        Self {
            edits_files: Vec::new(),
            streams: Vec::new(),
            rolled: false,
            start_tx_id: 0,
            last_written_tx_id: 0,
            min_replication: 1,
            max_replication: 512,
        }
    }

    pub fn with_replication_bounds(mut self, min: i16, max: i16) -> Self {
        self.min_replication = min;
        self.max_replication = max;
        self
    }

    fn new_file(path: &Path) -> PathBuf {
        // `edits` -> `edits.new`, next to it.
        let mut name = path.file_name().unwrap_or_default().to_os_string();
        name.push(".new");
        path.with_file_name(name)
    }

    fn write_target(&self, edits: &Path) -> PathBuf {
        if self.rolled {
            Self::new_file(edits)
        } else {
            edits.to_path_buf()
        }
    }

    /// Append one record to every open stream. Returns the transaction id
    /// assigned to the record.
    pub fn log_edit(&mut self, opcode: u8, payload: &[u8]) -> JournalResult<i64> {
        if self.streams.is_empty() {
            return Err(JournalError::NoStorage);
        }
        for (path, stream) in &mut self.streams {
            (|| -> io::Result<()> {
                stream.write_all(&[opcode])?;
                stream.write_all(&(payload.len() as u32).to_be_bytes())?;
                stream.write_all(payload)?;
                stream.sync_data()
            })()
            .map_err(|e| ioe(path, e))?;
        }
        self.last_written_tx_id += 1;
        Ok(self.last_written_tx_id)
    }
}

impl Default for FileEditJournal {
    fn default() -> Self {
        Self::new()
    }
}

impl EditJournal for FileEditJournal {
    fn attach(&mut self, edits_files: Vec<PathBuf>) {
        self.edits_files = edits_files;
        self.rolled = !self.edits_files.is_empty()
            && self.edits_files.iter().all(|e| Self::new_file(e).exists());
    }

    fn open(&mut self) -> JournalResult<()> {
        if self.is_open() {
            return Ok(());
        }
        if self.edits_files.is_empty() {
            return Err(JournalError::NoStorage);
        }
        let mut streams = Vec::with_capacity(self.edits_files.len());
        for edits in &self.edits_files {
            let target = self.write_target(edits);
            if !target.exists() {
                self.create_edit_log_file(&target)?;
            }
            let stream = OpenOptions::new()
                .append(true)
                .open(&target)
                .map_err(|e| ioe(&target, e))?;
            streams.push((target, stream));
        }
        self.streams = streams;
        Ok(())
    }

    fn close(&mut self) -> JournalResult<()> {
        for (path, stream) in &mut self.streams {
            stream.sync_all().map_err(|e| ioe(path, e))?;
        }
        self.streams.clear();
        Ok(())
    }

    fn is_open(&self) -> bool {
        !self.streams.is_empty()
    }

    fn create_edit_log_file(&self, path: &Path) -> JournalResult<()> {
        let mut file = File::create(path).map_err(|e| ioe(path, e))?;
        file.write_all(&LAYOUT_VERSION.to_be_bytes())
            .and_then(|_| file.sync_all())
            .map_err(|e| ioe(path, e))?;
        debug!("created edit log file {:?}", path);
        Ok(())
    }

    fn load_edits(&mut self, path: &Path) -> JournalResult<u64> {
        let file = File::open(path).map_err(|e| ioe(path, e))?;
        let mut reader = BufReader::new(file);

        let mut header = [0u8; 4];
        reader.read_exact(&mut header).map_err(|e| ioe(path, e))?;
        let version = i32::from_be_bytes(header);
        if version < LAYOUT_VERSION || version >= 0 {
            return Err(JournalError::VersionMismatch {
                path: path.to_path_buf(),
                found: version,
                expected: LAYOUT_VERSION,
            });
        }

        let mut count = 0u64;
        loop {
            let mut opcode = [0u8; 1];
            match reader.read_exact(&mut opcode) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(ioe(path, e)),
            }
            if opcode[0] == OP_INVALID {
                break;
            }
            let mut len = [0u8; 4];
            reader.read_exact(&mut len).map_err(|e| {
                JournalError::Corrupt {
                    path: path.to_path_buf(),
                    detail: format!("truncated record length: {}", e),
                }
            })?;
            let len = u32::from_be_bytes(len) as u64;
            let copied = io::copy(&mut reader.by_ref().take(len), &mut io::sink())
                .map_err(|e| ioe(path, e))?;
            if copied != len {
                return Err(JournalError::Corrupt {
                    path: path.to_path_buf(),
                    detail: format!("record payload truncated at {} of {} bytes", copied, len),
                });
            }
            count += 1;
        }

        self.last_written_tx_id += count as i64;
        info!("loaded {} edits from {:?}", count, path);
        Ok(count)
    }

    fn roll_edit_log(&mut self) -> JournalResult<()> {
        if self.edits_files.is_empty() {
            return Err(JournalError::NoStorage);
        }
        if self.exists_new() {
            // A previous roll never got purged; keep writing to edits.new.
            self.close()?;
            self.rolled = true;
            return self.open();
        }
        self.close()?;
        for edits in &self.edits_files {
            let new_file = Self::new_file(edits);
            self.create_edit_log_file(&new_file)?;
        }
        self.rolled = true;
        self.open()
    }

    fn purge_edit_log(&mut self) -> JournalResult<()> {
        self.close()?;
        for edits in &self.edits_files {
            let new_file = Self::new_file(edits);
            if new_file.exists() {
                rename_overwrite(&new_file, edits).map_err(|e| ioe(edits, e))?;
            }
        }
        self.rolled = false;
        Ok(())
    }

    fn exists_new(&self) -> bool {
        !self.edits_files.is_empty()
            && self.edits_files.iter().all(|e| Self::new_file(e).exists())
    }

    fn last_written_tx_id(&self) -> i64 {
        self.last_written_tx_id
    }

    fn set_start_transaction_id(&mut self, tx_id: i64) {
        self.start_tx_id = tx_id;
        self.last_written_tx_id = self.last_written_tx_id.max(tx_id);
    }

    fn adjust_replication(&self, replication: i16) -> i16 {
        replication.clamp(self.min_replication, self.max_replication)
    }

    fn process_io_error(&mut self, dir: &Path) {
        let before = self.edits_files.len();
        self.streams.retain(|(path, _)| !path.starts_with(dir));
        self.edits_files.retain(|path| !path.starts_with(dir));
        if self.edits_files.len() != before {
            warn!("detached edit log under failed directory {:?}", dir);
        }
    }

    fn edits_mtime(&self) -> JournalResult<i64> {
        let mut newest = 0i64;
        for edits in &self.edits_files {
            let meta = fs::metadata(edits).map_err(|e| ioe(edits, e))?;
            let mtime = meta
                .modified()
                .map_err(|e| ioe(edits, e))?
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as i64)
                .unwrap_or(0);
            newest = newest.max(mtime);
        }
        Ok(newest)
    }
}

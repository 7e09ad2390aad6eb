//! Write-ahead log.
//!
//! Every record update and every transaction outcome is appended as a
//! [`WalEntry`] before the change reaches the block file. Entries are
//! bincode-encoded back to back. The log is only ever appended to, listed and
//! truncated at checkpoints; it is not replayed on startup.
use std::{
    fs::{File, OpenOptions},
    io::{BufReader, BufWriter, ErrorKind, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use bincode::{
    Decode, Encode,
    config::{BigEndian, Configuration, Fixint},
    decode_from_reader, encode_into_std_write,
    error::DecodeError,
};
use log::{debug, info, trace};

use super::{BlockId, DbId, TableId, TxnId, error::StorageError, error::WalError};

#[derive(Debug, Clone, Copy, Encode, Decode, PartialEq, Eq)]
pub enum WalState {
    Start,
    Committed,
    Aborted,
}

/// Block an entry applies to.
#[derive(Debug, Clone, Copy, Default, Encode, Decode, PartialEq, Eq)]
pub struct EntryTag {
    pub db: DbId,
    pub table: TableId,
    pub block: BlockId,
}

#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct WalEntry {
    pub state: WalState,
    pub txn_id: TxnId,
    pub tag: EntryTag,
    pub old: Vec<u8>,
    pub new: Vec<u8>,
}

impl WalEntry {
    /// Before/after images of one record changed by `txn_id`.
    pub fn update(txn_id: TxnId, tag: EntryTag, old: Vec<u8>, new: Vec<u8>) -> Self {
        Self {
            state: WalState::Start,
            txn_id,
            tag,
            old,
            new,
        }
    }

    /// Outcome marker of `txn_id`.
    pub fn outcome(txn_id: TxnId, committed: bool) -> Self {
        Self {
            state: if committed {
                WalState::Committed
            } else {
                WalState::Aborted
            },
            txn_id,
            tag: EntryTag::default(),
            old: Vec::new(),
            new: Vec::new(),
        }
    }
}

pub struct WriteAheadLog {
    config: Configuration<BigEndian, Fixint>,
    writer: BufWriter<File>,
    path: PathBuf,
    entries: usize,
}

impl WriteAheadLog {
    pub fn open(path: &Path, buffer_size: usize) -> Result<Self, StorageError> {
        let log = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .map_err(WalError::Io)?;
        let config = bincode::config::standard()
            .with_big_endian()
            .with_fixed_int_encoding();

        let mut wal = Self {
            config,
            writer: BufWriter::with_capacity(buffer_size, log),
            path: path.to_path_buf(),
            entries: 0,
        };
        wal.entries = wal.entries()?.len();
        wal.writer.seek(SeekFrom::End(0)).map_err(WalError::Io)?;
        info!("opened wal at {path:?} with {} entries", wal.entries);
        Ok(wal)
    }

    /// Appends `entry` and flushes it to the file.
    pub fn append(&mut self, entry: &WalEntry) -> Result<(), StorageError> {
        trace!("wal append: {entry:?}");
        encode_into_std_write(entry, &mut self.writer, self.config)
            .map_err(WalError::Serialize)?;
        self.writer.flush().map_err(WalError::Io)?;
        self.entries += 1;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    /// Every entry currently in the log, oldest first. Decoding stops at the
    /// end of the file or at a torn trailing entry; any other failure is an
    /// error.
    pub fn entries(&self) -> Result<Vec<WalEntry>, StorageError> {
        let log = File::open(&self.path).map_err(WalError::Io)?;
        let mut reader = BufReader::new(log);
        let mut out = Vec::new();
        loop {
            match decode_from_reader::<WalEntry, _, _>(&mut reader, self.config) {
                Ok(entry) => out.push(entry),
                Err(DecodeError::UnexpectedEnd { .. }) => break,
                Err(DecodeError::Io { inner, .. }) if inner.kind() == ErrorKind::UnexpectedEof => {
                    break;
                }
                Err(e) => return Err(WalError::Deserialize(e).into()),
            }
        }
        Ok(out)
    }

    /// Drops every entry. Called once the changes they describe are durable
    /// in the block files.
    pub fn truncate(&mut self) -> Result<(), StorageError> {
        self.writer.flush().map_err(WalError::Io)?;
        let f = self.writer.get_mut();
        f.set_len(0).map_err(WalError::Io)?;
        f.seek(SeekFrom::Start(0)).map_err(WalError::Io)?;
        f.sync_all().map_err(WalError::Io)?;
        debug!("wal truncated after {} entries", self.entries);
        self.entries = 0;
        Ok(())
    }
}

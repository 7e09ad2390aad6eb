//! Positional file access for block files.
use std::{
    fs::{File, OpenOptions},
    io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use log::trace;

use super::error::StorageError;

#[derive(Debug)]
pub struct DiskFile {
    path: PathBuf,
    reader: BufReader<File>,
    writer: BufWriter<File>,
}

impl DiskFile {
    /// Opens `path` for reading and writing, creating it if missing.
    /// `capacity` sizes the read and write buffers.
    pub fn open(path: &Path, capacity: usize) -> Result<Self, StorageError> {
        let f = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)
            .map_err(StorageError::io("open file"))?;

        let reader = BufReader::with_capacity(
            capacity,
            f.try_clone().map_err(StorageError::io("open file"))?,
        );
        let writer = BufWriter::with_capacity(capacity, f);

        Ok(Self {
            path: path.to_path_buf(),
            reader,
            writer,
        })
    }

    pub fn size(&self) -> Result<u64, StorageError> {
        Ok(self
            .writer
            .get_ref()
            .metadata()
            .map_err(StorageError::io("stat file"))?
            .len())
    }

    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), StorageError> {
        trace!("read {} bytes at {offset} from {:?}", buf.len(), self.path);
        self.reader
            .seek(SeekFrom::Start(offset))
            .map_err(StorageError::io("seek"))?;
        self.reader
            .read_exact(buf)
            .map_err(StorageError::io("read"))?;
        Ok(())
    }

    /// Contents of the whole file.
    pub fn read_all(&mut self) -> Result<Vec<u8>, StorageError> {
        let mut out = Vec::with_capacity(self.size()? as usize);
        self.reader
            .seek(SeekFrom::Start(0))
            .map_err(StorageError::io("seek"))?;
        self.reader
            .read_to_end(&mut out)
            .map_err(StorageError::io("read"))?;
        Ok(out)
    }

    pub fn write_at(&mut self, offset: u64, bytes: &[u8]) -> Result<(), StorageError> {
        trace!("write {} bytes at {offset} to {:?}", bytes.len(), self.path);
        self.writer
            .seek(SeekFrom::Start(offset))
            .map_err(StorageError::io("seek"))?;
        self.writer
            .write_all(bytes)
            .map_err(StorageError::io("write"))?;
        self.writer.flush().map_err(StorageError::io("write"))?;
        Ok(())
    }

    /// Flushes buffered writes and waits for the OS to persist them.
    pub fn sync(&mut self) -> Result<(), StorageError> {
        self.writer.flush().map_err(StorageError::io("sync"))?;
        self.writer
            .get_ref()
            .sync_all()
            .map_err(StorageError::io("sync"))
    }
}

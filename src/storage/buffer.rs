//! Buffer pool of resident blocks.
//!
//! Blocks are cached by `(table, block id)` and stay resident until they are
//! explicitly evicted. Block `n` of a table file lives at byte offset
//! `(n - 1) * BLOCK_SIZE`. Writing a block back is an explicit step
//! ([`BufferPool::write_block`]) followed by a durability barrier
//! ([`BufferPool::flush`]).
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};

use super::{
    BlockId, TableId,
    block::{Block, BlockHandle, align, is_aligned},
    disk::DiskFile,
    error::StorageError,
    header::block::{BLOCK_SIZE, FIRST_BLOCK_ID},
};

/// Byte offset of block `id` in its table file.
pub fn block_offset(id: BlockId) -> Result<u64, StorageError> {
    id.checked_sub(FIRST_BLOCK_ID)
        .map(|n| n * BLOCK_SIZE as u64)
        .ok_or_else(|| StorageError::InvalidValue {
            column: "block id".into(),
            reason: format!("block ids start at {FIRST_BLOCK_ID}"),
        })
}

#[derive(Debug)]
pub struct BufferPool {
    io_buffer: usize,
    blocks: RwLock<HashMap<(TableId, BlockId), BlockHandle>>,
    files: Mutex<HashMap<PathBuf, Arc<Mutex<DiskFile>>>>,
}

impl BufferPool {
    /// Creates an empty pool; `io_buffer` sizes the buffers of every file it
    /// opens.
    pub fn new(io_buffer: usize) -> Self {
        Self {
            io_buffer,
            blocks: RwLock::new(HashMap::new()),
            files: Mutex::new(HashMap::new()),
        }
    }

    fn file(&self, path: &Path) -> Result<Arc<Mutex<DiskFile>>, StorageError> {
        let mut files = self.files.lock();
        if let Some(file) = files.get(path) {
            return Ok(Arc::clone(file));
        }
        let file = Arc::new(Mutex::new(DiskFile::open(path, self.io_buffer)?));
        files.insert(path.to_path_buf(), Arc::clone(&file));
        Ok(file)
    }

    /// Reads every block of `path` into the pool as blocks `1..=n` of
    /// `table`. Blocks already resident are kept as they are. Returns the
    /// number of blocks in the file.
    pub fn load(&self, table: TableId, path: &Path) -> Result<usize, StorageError> {
        let bytes = self.file(path)?.lock().read_all()?;
        if !is_aligned(bytes.len() as u64) {
            return Err(StorageError::Corrupted {
                context: path.display().to_string(),
                reason: format!(
                    "file length {} is not a multiple of {BLOCK_SIZE}",
                    bytes.len()
                ),
            });
        }

        let mut decoded = Vec::with_capacity(bytes.len() / BLOCK_SIZE);
        for (i, page) in bytes.chunks_exact(BLOCK_SIZE).enumerate() {
            decoded.push(Block::from_bytes(table, FIRST_BLOCK_ID + i as BlockId, page)?);
        }

        let count = decoded.len();
        let mut blocks = self.blocks.write();
        for block in decoded {
            blocks
                .entry((table, block.id()))
                .or_insert_with(|| BlockHandle::new(block));
        }
        info!("loaded {count} blocks of table {table} from {path:?}");
        Ok(count)
    }

    /// Resident block, read from disk on a miss.
    pub fn get_block(
        &self,
        path: &Path,
        table: TableId,
        id: BlockId,
    ) -> Result<BlockHandle, StorageError> {
        if let Some(handle) = self.blocks.read().get(&(table, id)) {
            return Ok(handle.clone());
        }

        let offset = block_offset(id)?;
        let mut page = vec![0; BLOCK_SIZE];
        self.file(path)?.lock().read_at(offset, &mut page)?;
        let block = Block::from_bytes(table, id, &page)?;
        debug!("read block {id} of table {table}");

        Ok(self
            .blocks
            .write()
            .entry((table, id))
            .or_insert_with(|| BlockHandle::new(block))
            .clone())
    }

    /// First resident block of `table`, in id order, with room for a record
    /// of `needed` bytes; a freshly allocated block otherwise.
    pub fn get_free(
        &self,
        path: &Path,
        table: TableId,
        needed: usize,
    ) -> Result<BlockHandle, StorageError> {
        for id in self.block_ids(table) {
            let Some(handle) = self.resident(table, id) else {
                continue;
            };
            if handle.read().can_fit(needed) {
                return Ok(handle);
            }
        }

        let handle = self.allocate(path, table)?;
        if !handle.read().can_fit(needed) {
            let block = handle.read();
            return Err(StorageError::BlockFull {
                block: block.id(),
                requested: needed,
                available: block.available(),
            });
        }
        Ok(handle)
    }

    /// Adds an empty block to `table` with an id past both the file's
    /// blocks and every resident block of the table.
    pub fn allocate(&self, path: &Path, table: TableId) -> Result<BlockHandle, StorageError> {
        let mut blocks = self.blocks.write();
        let on_disk = align(self.file(path)?.lock().size()?) / BLOCK_SIZE as u64;
        let resident = blocks
            .keys()
            .filter(|(t, _)| *t == table)
            .map(|(_, id)| *id)
            .max()
            .unwrap_or(0);

        let id = on_disk.max(resident) + 1;
        let handle = BlockHandle::new(Block::new(table, id));
        blocks.insert((table, id), handle.clone());
        debug!("allocated block {id} of table {table}");
        Ok(handle)
    }

    /// Writes the resident block to its slot in the file and marks it clean.
    /// Returns `false` if the block is not resident. On failure the block
    /// stays dirty.
    pub fn write_block(
        &self,
        path: &Path,
        table: TableId,
        id: BlockId,
    ) -> Result<bool, StorageError> {
        let Some(handle) = self.resident(table, id) else {
            return Ok(false);
        };

        let offset = block_offset(id)?;
        let file = self.file(path)?;
        let mut block = handle.write();
        file.lock().write_at(offset, &block.to_bytes()).inspect_err(|e| {
            warn!("failed to write block {id} of table {table}: {e}");
        })?;
        block.clear_dirty();
        debug!("wrote block {id} of table {table}");
        Ok(true)
    }

    /// Durability barrier on `path`.
    pub fn flush(&self, path: &Path) -> Result<(), StorageError> {
        self.file(path)?.lock().sync()
    }

    /// Writes every dirty block of `table`, then syncs the file. Returns the
    /// number of blocks written.
    pub fn flush_table(&self, path: &Path, table: TableId) -> Result<usize, StorageError> {
        let mut written = 0;
        for id in self.block_ids(table) {
            let dirty = self
                .resident(table, id)
                .is_some_and(|handle| handle.read().is_dirty());
            if dirty && self.write_block(path, table, id)? {
                written += 1;
            }
        }
        self.flush(path)?;
        if written > 0 {
            info!("flushed {written} blocks of table {table}");
        }
        Ok(written)
    }

    /// Writes the block back if dirty and drops it from the pool.
    pub fn evict(&self, path: &Path, table: TableId, id: BlockId) -> Result<bool, StorageError> {
        let dirty = match self.resident(table, id) {
            Some(handle) => handle.read().is_dirty(),
            None => return Ok(false),
        };
        if dirty {
            self.write_block(path, table, id)?;
            self.flush(path)?;
        }
        Ok(self.blocks.write().remove(&(table, id)).is_some())
    }

    /// Resident block ids of `table`, ascending.
    pub fn block_ids(&self, table: TableId) -> Vec<BlockId> {
        let mut ids: Vec<BlockId> = self
            .blocks
            .read()
            .keys()
            .filter(|(t, _)| *t == table)
            .map(|(_, id)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn resident(&self, table: TableId, id: BlockId) -> Option<BlockHandle> {
        self.blocks.read().get(&(table, id)).cloned()
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempdir::TempDir;

    use crate::storage::{Record, Schema, lock::LockManager, txn::Transaction};

    use super::*;

    const TABLE: TableId = 4;

    fn row(schema: &Schema, id: &str, name: &str) -> Vec<u8> {
        Record::encode(schema, &[id, name]).unwrap().serialize()
    }

    #[test]
    fn offsets() {
        assert_eq!(block_offset(1).unwrap(), 0);
        assert_eq!(block_offset(3).unwrap(), 8192);
        assert!(block_offset(0).is_err());
    }

    #[test]
    fn write_then_load() {
        let temp = TempDir::new("buffer").unwrap();
        let path = temp.path().join("t.data");
        let schema = Schema::parse("id:int32,name:string").unwrap();

        let pool = BufferPool::new(4096);
        let handle = pool.allocate(&path, TABLE).unwrap();
        assert_eq!(handle.id(), 1);
        handle.write().add_record(&row(&schema, "1", "one")).unwrap();
        assert!(pool.write_block(&path, TABLE, 1).unwrap());
        assert!(!handle.read().is_dirty());
        pool.flush(&path).unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), BLOCK_SIZE as u64);

        let pool = BufferPool::new(4096);
        assert_eq!(pool.load(TABLE, &path).unwrap(), 1);
        let block = pool.resident(TABLE, 1).unwrap();
        let record = block.read().decode_slot(0).unwrap().unwrap();
        assert_eq!(record.get_field(&schema, "name"), Some(&b"one"[..]));
    }

    #[test]
    fn failed_write_keeps_block_dirty() {
        let temp = TempDir::new("buffer").unwrap();
        let path = temp.path().join("t.data");
        let schema = Schema::parse("id:int32,name:string").unwrap();

        let pool = BufferPool::new(4096);
        let handle = pool.allocate(&path, TABLE).unwrap();
        handle.write().add_record(&row(&schema, "1", "one")).unwrap();

        // A directory cannot be opened for writing.
        let err = pool.write_block(temp.path(), TABLE, handle.id()).unwrap_err();
        assert!(matches!(err, StorageError::Io { .. }));
        assert!(pool.resident(TABLE, handle.id()).unwrap().read().is_dirty());

        assert!(pool.write_block(&path, TABLE, handle.id()).unwrap());
        assert!(!handle.read().is_dirty());
    }

    #[test]
    fn get_block_reads_on_miss() {
        let temp = TempDir::new("buffer").unwrap();
        let path = temp.path().join("t.data");
        let schema = Schema::parse("id:int32,name:string").unwrap();

        let pool = BufferPool::new(4096);
        for name in ["a", "b"] {
            let handle = pool.allocate(&path, TABLE).unwrap();
            handle.write().add_record(&row(&schema, "1", name)).unwrap();
            pool.write_block(&path, TABLE, handle.id()).unwrap();
        }
        pool.flush(&path).unwrap();

        let pool = BufferPool::new(4096);
        assert!(pool.resident(TABLE, 2).is_none());
        let handle = pool.get_block(&path, TABLE, 2).unwrap();
        let record = handle.read().decode_slot(0).unwrap().unwrap();
        assert_eq!(record.get_field(&schema, "name"), Some(&b"b"[..]));
        assert_eq!(pool.block_ids(TABLE), vec![2]);
    }

    #[test]
    #[should_panic(expected = "read")]
    fn get_block_past_end() {
        let temp = TempDir::new("buffer").unwrap();
        let pool = BufferPool::new(4096);
        pool.get_block(&temp.path().join("t.data"), TABLE, 3).unwrap();
    }

    #[test]
    #[should_panic(expected = "not a multiple")]
    fn load_misaligned_file() {
        let temp = TempDir::new("buffer").unwrap();
        let path = temp.path().join("t.data");
        fs::write(&path, vec![0; BLOCK_SIZE + 10]).unwrap();
        BufferPool::new(4096).load(TABLE, &path).unwrap();
    }

    #[test]
    fn get_free_reuses_then_allocates() {
        let temp = TempDir::new("buffer").unwrap();
        let path = temp.path().join("t.data");
        let pool = BufferPool::new(4096);

        let first = pool.get_free(&path, TABLE, 100).unwrap();
        assert_eq!(first.id(), 1);
        assert_eq!(pool.get_free(&path, TABLE, 100).unwrap().id(), 1);

        first.write().add_record(&[b'x'; 4000]).unwrap();
        let second = pool.get_free(&path, TABLE, 100).unwrap();
        assert_eq!(second.id(), 2);

        // The first block still fits a tiny record.
        assert_eq!(pool.get_free(&path, TABLE, 10).unwrap().id(), 1);
        assert_eq!(pool.block_ids(TABLE), vec![1, 2]);
    }

    #[test]
    #[should_panic(expected = "BlockFull")]
    fn get_free_oversized_record() {
        let temp = TempDir::new("buffer").unwrap();
        BufferPool::new(4096)
            .get_free(&temp.path().join("t.data"), TABLE, BLOCK_SIZE)
            .unwrap();
    }

    #[test]
    fn allocate_skips_blocks_on_disk() {
        let temp = TempDir::new("buffer").unwrap();
        let path = temp.path().join("t.data");
        fs::write(&path, vec![0; 2 * BLOCK_SIZE]).unwrap();

        let pool = BufferPool::new(4096);
        assert_eq!(pool.allocate(&path, TABLE).unwrap().id(), 3);
        assert_eq!(pool.allocate(&path, TABLE).unwrap().id(), 4);
        assert_eq!(pool.allocate(&path, TABLE + 1).unwrap().id(), 3);
    }

    #[test]
    fn write_block_not_resident() {
        let temp = TempDir::new("buffer").unwrap();
        let pool = BufferPool::new(4096);
        assert!(!pool.write_block(&temp.path().join("t.data"), TABLE, 1).unwrap());
    }

    #[test]
    fn flush_table_and_evict() {
        let temp = TempDir::new("buffer").unwrap();
        let path = temp.path().join("t.data");
        let schema = Schema::parse("id:int32,name:string").unwrap();
        let pool = BufferPool::new(4096);
        let locks = LockManager::new();
        let mut txn = Transaction::system();

        for i in 0..3 {
            let handle = pool.allocate(&path, TABLE).unwrap();
            handle
                .insert(&locks, &mut txn, &row(&schema, &i.to_string(), "n"))
                .unwrap();
        }
        assert_eq!(pool.flush_table(&path, TABLE).unwrap(), 3);
        assert_eq!(pool.flush_table(&path, TABLE).unwrap(), 0);

        let handle = pool.resident(TABLE, 2).unwrap();
        handle
            .update_records(&locks, &mut txn, &schema, "name", b"changed")
            .unwrap();
        assert!(pool.evict(&path, TABLE, 2).unwrap());
        assert!(pool.resident(TABLE, 2).is_none());
        assert!(!pool.evict(&path, TABLE, 2).unwrap());

        let reread = pool.get_block(&path, TABLE, 2).unwrap();
        let record = reread.read().decode_slot(0).unwrap().unwrap();
        assert_eq!(record.get_field(&schema, "name"), Some(&b"changed"[..]));
        txn.release_all(&locks);
    }
}

//! Monotonic identifier allocation.
//!
//! The catalog owns four counters (databases, tables, transactions and commit
//! sequence numbers). Each counter holds the largest id handed out so far and
//! is advanced with a compare-and-swap loop. When opened on disk the counters
//! live as rows of a bootstrap table, `id:int64, maxID:uint64, name:string`,
//! stored in the regular block format under table id [`CATALOG_TABLE_ID`].
//!
//! A stored `maxID` is a reservation: before an id past it is handed out, the
//! row is raised by [`RESERVE_BATCH`] and synced. A restart resumes from the
//! stored value, so no id handed out before a crash is reused.
use std::{
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};

use log::{debug, info};
use parking_lot::Mutex;

use super::{
    TableId,
    block::FieldValue,
    buffer::BufferPool,
    column::{Column, ColumnType, Schema},
    error::StorageError,
    lock::LockManager,
    record::{Record, parse_int},
    txn::Transaction,
};

/// Table id of the bootstrap table. User tables start above it.
pub const CATALOG_TABLE_ID: TableId = 0;

/// Ids reserved on disk per write of a counter row.
pub const RESERVE_BATCH: u64 = 32;

const INITIAL_MAX: u64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CounterKind {
    Database,
    Table,
    Transaction,
    Commit,
}

impl CounterKind {
    pub const ALL: [CounterKind; 4] = [
        CounterKind::Database,
        CounterKind::Table,
        CounterKind::Transaction,
        CounterKind::Commit,
    ];

    /// Row name in the bootstrap table.
    pub fn name(&self) -> &'static str {
        match self {
            CounterKind::Database => "dbID",
            CounterKind::Table => "tblID",
            CounterKind::Transaction => "txnID",
            CounterKind::Commit => "commitID",
        }
    }

    fn index(&self) -> usize {
        match self {
            CounterKind::Database => 0,
            CounterKind::Table => 1,
            CounterKind::Transaction => 2,
            CounterKind::Commit => 3,
        }
    }

    fn from_name(name: &[u8]) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.name().as_bytes() == name)
    }
}

pub fn catalog_schema() -> Result<Schema, StorageError> {
    Schema::new(vec![
        Column::new("id", ColumnType::Int64),
        Column::new("maxID", ColumnType::UInt64),
        Column::new("name", ColumnType::String),
    ])
}

/// The bootstrap table's file with its own pool and lock table.
#[derive(Debug)]
struct Store {
    path: PathBuf,
    schema: Schema,
    pool: BufferPool,
    locks: LockManager,
}

impl Store {
    /// Runs `f` in a system transaction, releasing its locks afterwards.
    fn run<T>(
        &self,
        f: impl FnOnce(&mut Transaction) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let mut txn = Transaction::system();
        let result = f(&mut txn);
        txn.release_all(&self.locks);
        result
    }

    /// Stored counters, seeding the rows on first use.
    fn bootstrap(&self, txn: &mut Transaction) -> Result<[u64; 4], StorageError> {
        let path = self.path.as_path();
        self.pool.load(CATALOG_TABLE_ID, path)?;

        let mut found: [Option<u64>; 4] = [None; 4];
        for id in self.pool.block_ids(CATALOG_TABLE_ID) {
            let block = self.pool.get_block(path, CATALOG_TABLE_ID, id)?;
            for record in block.records(&self.locks, txn)? {
                let Some(kind) = record
                    .get_field(&self.schema, "name")
                    .and_then(CounterKind::from_name)
                else {
                    continue;
                };
                let max = record.get_field(&self.schema, "maxID").unwrap_or(&b"0"[..]);
                found[kind.index()] = Some(parse_int(max, "catalog maxID")?);
            }
        }

        if found.iter().all(Option::is_none) {
            debug!("seeding catalog at {path:?}");
            for (i, kind) in CounterKind::ALL.iter().enumerate() {
                let row_id = (i + 1).to_string();
                let max = INITIAL_MAX.to_string();
                let values = [row_id.as_str(), max.as_str(), kind.name()];
                let bytes = Record::encode(&self.schema, &values)?.serialize();
                self.pool
                    .get_free(path, CATALOG_TABLE_ID, bytes.len())?
                    .insert(&self.locks, txn, &bytes)?;
            }
            self.pool.flush_table(path, CATALOG_TABLE_ID)?;
            return Ok([INITIAL_MAX; 4]);
        }

        let mut values = [0; 4];
        for kind in CounterKind::ALL {
            values[kind.index()] = found[kind.index()].ok_or_else(|| StorageError::Corrupted {
                context: path.display().to_string(),
                reason: format!("missing counter row '{}'", kind.name()),
            })?;
        }
        Ok(values)
    }

    /// Sets the `maxID` of `kind`'s row without syncing.
    fn write(
        &self,
        kind: CounterKind,
        max: u64,
        txn: &mut Transaction,
    ) -> Result<(), StorageError> {
        let max = max.to_string();
        for id in self.pool.block_ids(CATALOG_TABLE_ID) {
            self.pool.get_block(&self.path, CATALOG_TABLE_ID, id)?.update_where(
                &self.locks,
                txn,
                &self.schema,
                Some(FieldValue::new("name", kind.name().as_bytes())),
                FieldValue::new("maxID", max.as_bytes()),
            )?;
        }
        Ok(())
    }

    fn sync(&self) -> Result<usize, StorageError> {
        self.pool.flush_table(&self.path, CATALOG_TABLE_ID)
    }
}

#[derive(Debug)]
pub struct Catalog {
    counters: [AtomicU64; 4],
    reserved: [AtomicU64; 4],
    store: Option<Store>,
    writer: Mutex<()>,
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new()
    }
}

impl Catalog {
    /// In-memory catalog with every counter at its initial value.
    pub fn new() -> Self {
        Self::with_counters([INITIAL_MAX; 4], None)
    }

    fn with_counters(values: [u64; 4], store: Option<Store>) -> Self {
        Self {
            counters: values.map(AtomicU64::new),
            reserved: values.map(AtomicU64::new),
            store,
            writer: Mutex::new(()),
        }
    }

    /// Loads the bootstrap table at `path`, seeding it on first use.
    /// `io_buffer` sizes the buffers of the catalog file.
    pub fn open(path: &Path, io_buffer: usize) -> Result<Self, StorageError> {
        let store = Store {
            path: path.to_path_buf(),
            schema: catalog_schema()?,
            pool: BufferPool::new(io_buffer),
            locks: LockManager::new(),
        };
        let values = store.run(|txn| store.bootstrap(txn))?;
        info!("catalog opened at {path:?}: {values:?}");
        Ok(Self::with_counters(values, Some(store)))
    }

    /// Largest id handed out so far.
    pub fn current(&self, kind: CounterKind) -> u64 {
        self.counters[kind.index()].load(Ordering::Acquire)
    }

    /// Largest id the bootstrap table covers. Equal to [`Catalog::current`]
    /// for in-memory catalogs until ids are handed out.
    pub fn reserved(&self, kind: CounterKind) -> u64 {
        self.reserved[kind.index()].load(Ordering::Acquire)
    }

    /// Allocates the next id of `kind`. Fails only if extending the on-disk
    /// reservation fails; the id is then burnt.
    pub fn next(&self, kind: CounterKind) -> Result<u64, StorageError> {
        let counter = &self.counters[kind.index()];
        let mut current = counter.load(Ordering::Acquire);
        let id = loop {
            match counter.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break current + 1,
                Err(actual) => current = actual,
            }
        };
        self.reserve(kind, id)?;
        Ok(id)
    }

    /// Raises the counter to `value`. Lowering a counter is an error.
    pub fn set_max(&self, kind: CounterKind, value: u64) -> Result<(), StorageError> {
        let counter = &self.counters[kind.index()];
        let mut current = counter.load(Ordering::Acquire);
        loop {
            if value < current {
                return Err(StorageError::InvalidValue {
                    column: kind.name().into(),
                    reason: format!("cannot lower counter from {current} to {value}"),
                });
            }
            match counter.compare_exchange_weak(current, value, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        self.reserve(kind, value)
    }

    /// Makes sure the stored row of `kind` covers `id`.
    fn reserve(&self, kind: CounterKind, id: u64) -> Result<(), StorageError> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let reserved = &self.reserved[kind.index()];
        if id <= reserved.load(Ordering::Acquire) {
            return Ok(());
        }

        let _guard = self.writer.lock();
        if id <= reserved.load(Ordering::Acquire) {
            return Ok(());
        }
        let max = id + RESERVE_BATCH;
        store.run(|txn| store.write(kind, max, txn))?;
        store.sync()?;
        reserved.store(max, Ordering::Release);
        debug!("reserved {} ids up to {max}", kind.name());
        Ok(())
    }

    /// Rewrites every counter row with its reservation and syncs the
    /// bootstrap table. A no-op for in-memory catalogs.
    pub fn checkpoint(&self) -> Result<(), StorageError> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let _guard = self.writer.lock();

        store.run(|txn| {
            for kind in CounterKind::ALL {
                store.write(kind, self.reserved(kind), txn)?;
            }
            Ok(())
        })?;
        let written = store.sync()?;
        debug!("catalog checkpoint wrote {written} blocks");
        Ok(())
    }
}

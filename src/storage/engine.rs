//! Engine wiring and client contexts.
//!
//! An [`Engine`] owns every process-wide component: buffer pool, lock
//! manager, transaction manager, catalog and write-ahead log. It is opened
//! once and shared behind an [`Arc`]. Clients work through a
//! [`ClientContext`], which always carries one live transaction.
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
};

use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::config::Config;

use super::{
    DbId, TableId,
    buffer::BufferPool,
    catalog::{Catalog, CounterKind},
    error::StorageError,
    lock::LockManager,
    log::{WalEntry, WriteAheadLog},
    table::Database,
    txn::{Transaction, TransactionManager},
};

pub struct Engine {
    config: Config,
    pool: BufferPool,
    locks: LockManager,
    transactions: TransactionManager,
    catalog: Catalog,
    wal: Option<Mutex<WriteAheadLog>>,
    contexts: AtomicU32,
    databases: Mutex<HashMap<String, DbId>>,
    tables: Mutex<HashMap<PathBuf, TableId>>,
}

impl Engine {
    /// Opens the engine rooted at `config.data_path`, bootstrapping the
    /// catalog on first use.
    pub fn open(config: Config) -> Result<Arc<Self>, StorageError> {
        fs::create_dir_all(config.meta_path()).map_err(StorageError::io("create data directory"))?;

        let catalog = Catalog::open(&config.catalog_path(), config.buffer_size)?;
        let wal = if config.wal {
            Some(Mutex::new(WriteAheadLog::open(
                &config.wal_path(),
                config.wal_buffer_size,
            )?))
        } else {
            None
        };

        info!("engine opened at {:?}", config.data_path);
        Ok(Arc::new(Self {
            pool: BufferPool::new(config.buffer_size),
            locks: LockManager::new(),
            config,
            transactions: TransactionManager::new(),
            catalog,
            wal,
            contexts: AtomicU32::new(0),
            databases: Mutex::new(HashMap::new()),
            tables: Mutex::new(HashMap::new()),
        }))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn transactions(&self) -> &TransactionManager {
        &self.transactions
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// New client context with a started transaction.
    pub fn context(self: &Arc<Self>, autocommit: bool) -> Result<ClientContext, StorageError> {
        let id = self.contexts.fetch_add(1, Ordering::AcqRel) + 1;
        let txn = self.transactions.start_transaction(&self.catalog, autocommit)?;
        debug!("context {id} opened with txn {}", txn.id());
        Ok(ClientContext {
            engine: Arc::clone(self),
            id,
            txn,
        })
    }

    /// Opens database `name`, creating its directory and allocating its id on
    /// first use in this process.
    pub fn create_database(self: &Arc<Self>, name: &str) -> Result<Database, StorageError> {
        validate_name("database", name)?;
        fs::create_dir_all(self.config.database_path(name))
            .map_err(StorageError::io("create database directory"))?;

        let mut databases = self.databases.lock();
        let id = match databases.get(name) {
            Some(id) => *id,
            None => {
                let id = self.catalog.next(CounterKind::Database)?;
                databases.insert(name.to_string(), id);
                id
            }
        };
        drop(databases);
        info!("database '{name}' ready with id {id}");
        Ok(Database::new(Arc::clone(self), id, name.to_string()))
    }

    /// Table id of the file at `path`, registering and loading it on first
    /// use.
    pub(crate) fn register_table(&self, path: &Path) -> Result<TableId, StorageError> {
        let mut tables = self.tables.lock();
        if let Some(id) = tables.get(path) {
            return Ok(*id);
        }

        let id = self.catalog.next(CounterKind::Table)?;
        self.pool.load(id, path)?;
        tables.insert(path.to_path_buf(), id);
        Ok(id)
    }

    /// Appends to the write-ahead log when it is enabled.
    pub fn log(&self, entry: WalEntry) -> Result<(), StorageError> {
        match &self.wal {
            Some(wal) => wal.lock().append(&entry),
            None => Ok(()),
        }
    }

    pub fn wal_entries(&self) -> Result<Vec<WalEntry>, StorageError> {
        match &self.wal {
            Some(wal) => wal.lock().entries(),
            None => Ok(Vec::new()),
        }
    }

    /// Writes every dirty block of every open table, persists the catalog
    /// counters and truncates the write-ahead log.
    pub fn checkpoint(&self) -> Result<(), StorageError> {
        let tables: Vec<(PathBuf, TableId)> = self
            .tables
            .lock()
            .iter()
            .map(|(path, id)| (path.clone(), *id))
            .collect();
        for (path, id) in tables {
            self.pool.flush_table(&path, id)?;
        }
        self.catalog.checkpoint()?;
        if let Some(wal) = &self.wal {
            wal.lock().truncate()?;
        }
        info!("checkpoint complete");
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Err(e) = self.checkpoint() {
            warn!("checkpoint on close failed: {e}");
        }
    }
}

pub(crate) fn validate_name(kind: &str, name: &str) -> Result<(), StorageError> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidValue {
            column: kind.to_string(),
            reason: format!("'{name}' is not a valid {kind} name"),
        })
    }
}

/// A client's session with the engine. Committing or rolling back finishes
/// the current transaction and starts the next one.
pub struct ClientContext {
    engine: Arc<Engine>,
    id: u32,
    txn: Transaction,
}

impl ClientContext {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn transaction(&self) -> &Transaction {
        &self.txn
    }

    pub(crate) fn parts(&mut self) -> (&Engine, &mut Transaction) {
        (&*self.engine, &mut self.txn)
    }

    pub fn commit(&mut self) -> Result<(), StorageError> {
        self.finish(true)
    }

    pub fn rollback(&mut self) -> Result<(), StorageError> {
        self.finish(false)
    }

    fn finish(&mut self, commit: bool) -> Result<(), StorageError> {
        let logged = self.engine.log(WalEntry::outcome(self.txn.id(), commit));
        let finished = if commit && logged.is_ok() {
            self.txn.commit(&self.engine.locks)
        } else {
            self.txn.rollback(&self.engine.locks)
        };
        self.engine.transactions.end_transaction(&self.txn);

        let next = self
            .engine
            .transactions
            .start_transaction(&self.engine.catalog, self.txn.autocommit())?;
        self.txn = next;
        logged?;
        finished
    }

    /// Rolls back the open transaction and ends the session.
    pub fn close(mut self) -> Result<(), StorageError> {
        self.abandon()
    }

    fn abandon(&mut self) -> Result<(), StorageError> {
        if !self.txn.is_active() {
            return Ok(());
        }
        let logged = self.engine.log(WalEntry::outcome(self.txn.id(), false));
        let finished = self.txn.rollback(&self.engine.locks);
        self.engine.transactions.end_transaction(&self.txn);
        debug!("context {} closed", self.id);
        logged.and(finished)
    }
}

impl Drop for ClientContext {
    fn drop(&mut self) {
        if let Err(e) = self.abandon() {
            warn!("failed to close context {}: {e}", self.id);
        }
    }
}

//! Databases and tables on top of the buffer pool.
//!
//! A table is one block file plus the schema its records are encoded with.
//! Every operation runs inside the calling context's transaction; contexts
//! in autocommit mode commit after each successful operation, and a failed
//! write rolls the transaction back. Rollback releases locks only; blocks
//! already rewritten by the failed statement keep their new contents.
use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use log::{debug, info, warn};

use super::{
    BlockId, DbId, TableId,
    block::{BlockHandle, FieldValue, SlotUpdate},
    column::Schema,
    engine::{ClientContext, Engine, validate_name},
    error::StorageError,
    log::{EntryTag, WalEntry},
    record::Record,
};

pub struct Database {
    engine: Arc<Engine>,
    id: DbId,
    name: String,
}

impl Database {
    pub(crate) fn new(engine: Arc<Engine>, id: DbId, name: String) -> Self {
        Self { engine, id, name }
    }

    pub fn id(&self) -> DbId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Opens table `name`, creating its file if needed and loading every
    /// block it holds into the buffer pool.
    pub fn open_table(&self, name: &str, schema: Schema) -> Result<Table, StorageError> {
        validate_name("table", name)?;
        let config = self.engine.config();
        fs::create_dir_all(config.table_dir(&self.name, name))
            .map_err(StorageError::io("create table directory"))?;

        let path = config.table_path(&self.name, name);
        let id = self.engine.register_table(&path)?;
        info!("table '{}.{name}' open with id {id}", self.name);

        Ok(Table {
            engine: Arc::clone(&self.engine),
            db: self.id,
            id,
            name: name.to_string(),
            schema,
            path,
        })
    }
}

pub struct Table {
    engine: Arc<Engine>,
    db: DbId,
    id: TableId,
    name: String,
    schema: Schema,
    path: PathBuf,
}

impl Table {
    pub fn id(&self) -> TableId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tag(&self, block: BlockId) -> EntryTag {
        EntryTag {
            db: self.db,
            table: self.id,
            block,
        }
    }

    fn blocks(&self) -> Result<Vec<BlockHandle>, StorageError> {
        let pool = self.engine.pool();
        pool.block_ids(self.id)
            .into_iter()
            .map(|id| pool.get_block(&self.path, self.id, id))
            .collect()
    }

    /// Commits after a successful operation in autocommit mode. Rolls back
    /// after a failed write, or any failure in autocommit mode.
    fn complete<T>(
        &self,
        ctx: &mut ClientContext,
        write: bool,
        result: Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        match result {
            Ok(value) => {
                if ctx.transaction().autocommit() {
                    ctx.commit()?;
                }
                Ok(value)
            }
            Err(e) => {
                let txn = ctx.transaction();
                if (write || txn.autocommit()) && txn.is_active() {
                    let id = txn.id();
                    debug!("rolling back txn {id} after: {e}");
                    if let Err(rollback) = ctx.rollback() {
                        warn!("rollback of txn {id} failed: {rollback}");
                    }
                }
                Err(e)
            }
        }
    }

    /// Encodes `values` in schema order and stores the record in the first
    /// block with room for it. Returns the block and slot it landed in.
    pub fn add_record<V: AsRef<[u8]>>(
        &self,
        ctx: &mut ClientContext,
        values: &[V],
    ) -> Result<(BlockId, usize), StorageError> {
        let result = self.insert(ctx, values);
        self.complete(ctx, true, result)
    }

    fn insert<V: AsRef<[u8]>>(
        &self,
        ctx: &mut ClientContext,
        values: &[V],
    ) -> Result<(BlockId, usize), StorageError> {
        let (engine, txn) = ctx.parts();
        txn.ensure_active()?;
        let bytes = Record::encode(&self.schema, values)?.serialize();
        let pool = engine.pool();

        let handle = pool.get_free(&self.path, self.id, bytes.len())?;
        let (handle, slot) = match handle.insert(engine.locks(), txn, &bytes) {
            Ok(slot) => (handle, slot),
            // Filled up by a concurrent insert since it was picked.
            Err(StorageError::BlockFull { .. }) => {
                let handle = pool.allocate(&self.path, self.id)?;
                let slot = handle.insert(engine.locks(), txn, &bytes)?;
                (handle, slot)
            }
            Err(e) => return Err(e),
        };

        let block = handle.id();
        engine.log(WalEntry::update(txn.id(), self.tag(block), Vec::new(), bytes))?;
        Ok((block, slot))
    }

    /// Every record of the table, block by block in slot order.
    pub fn records(&self, ctx: &mut ClientContext) -> Result<Vec<Record>, StorageError> {
        let result = self.scan(ctx, None);
        self.complete(ctx, false, result)
    }

    /// Records whose `field` equals `value`.
    pub fn get_records(
        &self,
        ctx: &mut ClientContext,
        field: &str,
        value: &[u8],
    ) -> Result<Vec<Record>, StorageError> {
        let result = self.scan(ctx, Some(FieldValue::new(field, value)));
        self.complete(ctx, false, result)
    }

    fn scan(
        &self,
        ctx: &mut ClientContext,
        filter: Option<FieldValue>,
    ) -> Result<Vec<Record>, StorageError> {
        let blocks = self.blocks()?;
        let (engine, txn) = ctx.parts();
        txn.ensure_active()?;
        let mut out = Vec::new();
        for block in blocks {
            let found = match filter {
                Some(FieldValue { field, value }) => {
                    block.filter_records(engine.locks(), txn, &self.schema, field, value)?
                }
                None => block.records(engine.locks(), txn)?,
            };
            out.extend(found);
        }
        Ok(out)
    }

    /// Sets `field` to `value` on every record. Returns the number of records
    /// changed.
    pub fn update_records(
        &self,
        ctx: &mut ClientContext,
        field: &str,
        value: &[u8],
    ) -> Result<usize, StorageError> {
        let result = self.update(ctx, None, FieldValue::new(field, value));
        self.complete(ctx, true, result)
    }

    /// Sets `set_field` to `value` on every record whose `filter_field`
    /// equals `search`.
    pub fn update_where(
        &self,
        ctx: &mut ClientContext,
        filter_field: &str,
        search: &[u8],
        set_field: &str,
        value: &[u8],
    ) -> Result<usize, StorageError> {
        let result = self.update(
            ctx,
            Some(FieldValue::new(filter_field, search)),
            FieldValue::new(set_field, value),
        );
        self.complete(ctx, true, result)
    }

    fn update(
        &self,
        ctx: &mut ClientContext,
        filter: Option<FieldValue>,
        set: FieldValue,
    ) -> Result<usize, StorageError> {
        for field in filter.iter().map(|f| f.field).chain([set.field]) {
            if self.schema.position(field).is_none() {
                return Err(StorageError::ColumnNotFound(field.to_string()));
            }
        }

        let blocks = self.blocks()?;
        let (engine, txn) = ctx.parts();
        txn.ensure_active()?;
        let mut changed = 0;
        for block in blocks {
            let updates = block.update_where(engine.locks(), txn, &self.schema, filter, set)?;
            let tag = self.tag(block.id());
            for SlotUpdate { before, after, .. } in updates {
                engine.log(WalEntry::update(txn.id(), tag, before, after))?;
                changed += 1;
            }
        }
        Ok(changed)
    }

    /// Writes the table's dirty blocks and syncs its file.
    pub fn flush(&self) -> Result<usize, StorageError> {
        self.engine.pool().flush_table(&self.path, self.id)
    }
}

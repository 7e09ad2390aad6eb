//! Fixed-size blocks of encoded records.
//!
//! A block serializes to
//!
//! ```text
//! <block id>\n<offset,size:offset,size:...>\n<record bytes>\n<block size>\n
//! ```
//!
//! zero-padded to [`BLOCK_SIZE`]. The record bytes are the concatenated
//! serialized records; their length is implied by the slot index, so records
//! may freely contain the terminator byte. `block size` counts every byte of
//! the unpadded form, itself included, and never exceeds [`BLOCK_SIZE`].
//!
//! Concurrent access goes through a [`BlockHandle`], which couples the block
//! with the per-slot locks of the [`LockManager`].
use std::sync::Arc;

use log::{debug, trace};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::{
    BlockId, TableId,
    column::Schema,
    error::StorageError,
    header::block::{ALIGN_MASK, BLOCK_SIZE, TERM},
    lock::{LockManager, LockMode, SlotId},
    record::{
        LocationPair, Record, digits, encode_locations, encoded_locations_len, parse_int,
        parse_locations, recompute_offsets, split_term,
    },
    txn::Transaction,
};

pub fn is_aligned(offset: u64) -> bool {
    offset & ALIGN_MASK == 0
}

/// Rounds `offset` up to the next block boundary.
pub fn align(offset: u64) -> u64 {
    (offset + ALIGN_MASK) & !ALIGN_MASK
}

/// Total size of a serialized block whose other components take `base`
/// bytes, accounting for the digits of the size field itself.
fn with_size_field(base: usize) -> usize {
    let mut total = base + 1;
    while base + digits(total as u64) != total {
        total = base + digits(total as u64);
    }
    total
}

/// A column compared against or assigned a value.
#[derive(Debug, Clone, Copy)]
pub struct FieldValue<'a> {
    pub field: &'a str,
    pub value: &'a [u8],
}

impl<'a> FieldValue<'a> {
    pub fn new(field: &'a str, value: &'a [u8]) -> Self {
        Self { field, value }
    }

    fn matches(&self, schema: &Schema, record: &Record) -> bool {
        record.get_field(schema, self.field).unwrap_or_default() == self.value
    }
}

/// Before and after image of one updated record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotUpdate {
    pub slot: usize,
    pub before: Vec<u8>,
    pub after: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    id: BlockId,
    table: TableId,
    size: usize,
    dirty: bool,
    slots: Vec<LocationPair>,
    records: Vec<u8>,
}

impl Block {
    pub fn new(table: TableId, id: BlockId) -> Self {
        let mut block = Self {
            id,
            table,
            size: 0,
            dirty: false,
            slots: Vec::new(),
            records: Vec::new(),
        };
        block.size = block.measure(encoded_locations_len(&block.slots), 0);
        block
    }

    pub fn id(&self) -> BlockId {
        self.id
    }

    pub fn table(&self) -> TableId {
        self.table
    }

    /// Serialized size in bytes, excluding padding.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn available(&self) -> usize {
        BLOCK_SIZE.saturating_sub(self.size)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    pub fn slots(&self) -> &[LocationPair] {
        &self.slots
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn measure(&self, locations_len: usize, records_len: usize) -> usize {
        let base = digits(self.id) + 1 + locations_len + 1 + records_len + 1 + 1;
        with_size_field(base)
    }

    /// Size the block would have after appending a record of `len` bytes.
    pub fn size_with(&self, len: usize) -> usize {
        let mut locations_len = encoded_locations_len(&self.slots);
        if !self.slots.is_empty() {
            locations_len += 1;
        }
        locations_len += digits(self.records.len() as u64) + 1 + digits(len as u64);
        self.measure(locations_len, self.records.len() + len)
    }

    pub fn can_fit(&self, len: usize) -> bool {
        self.size_with(len) <= BLOCK_SIZE
    }

    /// Appends a serialized record, returning its slot index. Fails without
    /// touching the block if the result would not fit a page.
    pub fn add_record(&mut self, bytes: &[u8]) -> Result<usize, StorageError> {
        let size = self.size_with(bytes.len());
        if size > BLOCK_SIZE {
            return Err(StorageError::BlockFull {
                block: self.id,
                requested: bytes.len(),
                available: self.available(),
            });
        }

        let offset = self.records.len();
        self.slots
            .push(LocationPair::new(offset as u32, bytes.len() as u32));
        self.records.extend_from_slice(bytes);
        self.size = size;
        self.dirty = true;
        trace!("block {} slot {} <- {} bytes", self.id, self.slots.len() - 1, bytes.len());
        Ok(self.slots.len() - 1)
    }

    /// Raw bytes of `slot`, `None` if out of range.
    pub fn record_bytes(&self, slot: usize) -> Option<&[u8]> {
        self.slots
            .get(slot)
            .and_then(|location| self.records.get(location.range()))
    }

    /// Decoded record of `slot`, `None` for empty or missing slots.
    pub fn decode_slot(&self, slot: usize) -> Result<Option<Record>, StorageError> {
        match self.record_bytes(slot) {
            Some(bytes) if !bytes.is_empty() => Record::decode(bytes).map(Some),
            _ => Ok(None),
        }
    }

    /// Swaps the bytes of the given slots and re-packs the record buffer. The
    /// block is left untouched if the result would not fit a page.
    fn replace_records(&mut self, replacements: &[(usize, Vec<u8>)]) -> Result<(), StorageError> {
        let mut slots = self.slots.clone();
        let mut records = Vec::with_capacity(self.records.len());
        for (i, slot) in slots.iter_mut().enumerate() {
            let bytes = match replacements.iter().find(|(s, _)| *s == i) {
                Some((_, bytes)) => bytes.as_slice(),
                None => &self.records[slot.range()],
            };
            records.extend_from_slice(bytes);
            slot.set_size(bytes.len() as u32);
        }
        recompute_offsets(&mut slots);

        let size = self.measure(encoded_locations_len(&slots), records.len());
        if size > BLOCK_SIZE {
            return Err(StorageError::BlockFull {
                block: self.id,
                requested: size - self.size,
                available: self.available(),
            });
        }

        self.slots = slots;
        self.records = records;
        self.size = size;
        self.dirty = true;
        Ok(())
    }

    /// Page image of the block, padded to [`BLOCK_SIZE`].
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(BLOCK_SIZE);
        out.extend_from_slice(self.id.to_string().as_bytes());
        out.push(TERM);
        encode_locations(&self.slots, &mut out);
        out.push(TERM);
        out.extend_from_slice(&self.records);
        out.push(TERM);
        out.extend_from_slice(self.size.to_string().as_bytes());
        out.push(TERM);
        out.resize(BLOCK_SIZE, 0);
        out
    }

    /// Decodes a page read from disk as block `id` of `table`. An all-zero
    /// page is a block that was never written.
    pub fn from_bytes(table: TableId, id: BlockId, page: &[u8]) -> Result<Self, StorageError> {
        if page.iter().all(|b| *b == 0) {
            return Ok(Self::new(table, id));
        }
        let corrupted = |reason: String| StorageError::Corrupted {
            context: format!("table {table} block {id}"),
            reason,
        };

        let (stored_id, rest) = split_term(page, TERM, "block id")?;
        let stored_id = parse_int::<BlockId>(stored_id, "block id")?;
        if stored_id != id {
            return Err(corrupted(format!("expected block {id}, found {stored_id}")));
        }

        let (slots, rest) = split_term(rest, TERM, "block locations")?;
        let slots = parse_locations(slots, "block locations")?;

        let mut expected = 0;
        for slot in slots.iter() {
            if slot.offset() as usize != expected {
                return Err(corrupted(format!(
                    "slot offset {} does not follow {expected}",
                    slot.offset()
                )));
            }
            expected = slot.end();
        }
        if rest.len() <= expected || rest[expected] != TERM {
            return Err(corrupted(format!("record bytes shorter than {expected}")));
        }
        let records = rest[..expected].to_vec();

        let (stored_size, _) = split_term(&rest[expected + 1..], TERM, "block size")?;
        let stored_size = parse_int::<usize>(stored_size, "block size")?;

        let mut block = Self {
            id,
            table,
            size: 0,
            dirty: false,
            slots,
            records,
        };
        block.size = block.measure(encoded_locations_len(&block.slots), block.records.len());
        if block.size != stored_size {
            return Err(corrupted(format!(
                "stored size {stored_size} but decoded {}",
                block.size
            )));
        }
        Ok(block)
    }
}

/// Shared, lock-aware access to a resident block.
///
/// Operations run in three steps: find candidate slots under the block's
/// read guard, acquire the slot locks with no guard held, then re-check the
/// candidates under the guard before reading or mutating them.
#[derive(Debug, Clone)]
pub struct BlockHandle(Arc<RwLock<Block>>);

impl BlockHandle {
    pub fn new(block: Block) -> Self {
        Self(Arc::new(RwLock::new(block)))
    }

    pub fn id(&self) -> BlockId {
        self.0.read().id
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Block> {
        self.0.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Block> {
        self.0.write()
    }

    fn lock_slots(
        &self,
        locks: &LockManager,
        txn: &mut Transaction,
        candidates: &[(usize, LocationPair)],
        mode: LockMode,
    ) {
        let (table, block) = {
            let guard = self.0.read();
            (guard.table, guard.id)
        };
        for (slot, location) in candidates {
            let slot = SlotId::new(table, block, *slot);
            locks.acquire(txn.id(), slot, mode);
            txn.touch(slot, *location, mode);
        }
    }

    fn candidates(
        &self,
        schema: Option<&Schema>,
        filter: Option<FieldValue>,
    ) -> Result<Vec<(usize, LocationPair)>, StorageError> {
        let block = self.0.read();
        let mut out = Vec::new();
        for (slot, location) in block.slots.iter().enumerate() {
            let Some(record) = block.decode_slot(slot)? else {
                continue;
            };
            let matched = match (schema, filter) {
                (Some(schema), Some(filter)) => filter.matches(schema, &record),
                _ => true,
            };
            if matched {
                out.push((slot, *location));
            }
        }
        Ok(out)
    }

    /// Appends a record and locks its new slot exclusively for `txn`.
    pub fn insert(
        &self,
        locks: &LockManager,
        txn: &mut Transaction,
        bytes: &[u8],
    ) -> Result<usize, StorageError> {
        txn.ensure_active()?;
        let mut block = self.0.write();
        let slot = block.add_record(bytes)?;
        let location = block.slots[slot];
        let id = SlotId::new(block.table, block.id, slot);

        if !locks.try_acquire(txn.id(), id, LockMode::Exclusive) {
            drop(block);
            locks.acquire(txn.id(), id, LockMode::Exclusive);
        }
        txn.touch(id, location, LockMode::Exclusive);
        Ok(slot)
    }

    /// Every record of the block in slot order, each read under a shared
    /// slot lock.
    pub fn records(
        &self,
        locks: &LockManager,
        txn: &mut Transaction,
    ) -> Result<Vec<Record>, StorageError> {
        txn.ensure_active()?;
        let candidates = self.candidates(None, None)?;
        self.lock_slots(locks, txn, &candidates, LockMode::Shared);

        let block = self.0.read();
        let mut out = Vec::with_capacity(candidates.len());
        for (slot, _) in candidates {
            out.extend(block.decode_slot(slot)?);
        }
        Ok(out)
    }

    /// Records whose `field` equals `value` byte for byte. Only matching
    /// slots are locked. An unknown column matches nothing.
    pub fn filter_records(
        &self,
        locks: &LockManager,
        txn: &mut Transaction,
        schema: &Schema,
        field: &str,
        value: &[u8],
    ) -> Result<Vec<Record>, StorageError> {
        txn.ensure_active()?;
        if schema.position(field).is_none() {
            return Ok(Vec::new());
        }

        let filter = FieldValue::new(field, value);
        let candidates = self.candidates(Some(schema), Some(filter))?;
        self.lock_slots(locks, txn, &candidates, LockMode::Shared);

        let block = self.0.read();
        let mut out = Vec::with_capacity(candidates.len());
        for (slot, _) in candidates {
            if let Some(record) = block.decode_slot(slot)? {
                if filter.matches(schema, &record) {
                    out.push(record);
                }
            }
        }
        Ok(out)
    }

    /// Sets `field` to `new` on every record where it currently equals
    /// `search`.
    pub fn update_filtered_records(
        &self,
        locks: &LockManager,
        txn: &mut Transaction,
        schema: &Schema,
        field: &str,
        search: &[u8],
        new: &[u8],
    ) -> Result<Vec<SlotUpdate>, StorageError> {
        self.update_where(
            locks,
            txn,
            schema,
            Some(FieldValue::new(field, search)),
            FieldValue::new(field, new),
        )
    }

    /// Sets `field` to `new` on every record of the block.
    pub fn update_records(
        &self,
        locks: &LockManager,
        txn: &mut Transaction,
        schema: &Schema,
        field: &str,
        new: &[u8],
    ) -> Result<Vec<SlotUpdate>, StorageError> {
        self.update_where(locks, txn, schema, None, FieldValue::new(field, new))
    }

    /// Applies `set` to every record matching `filter` (all records when
    /// `None`), holding an exclusive lock on each matched slot. Either every
    /// matched record is rewritten or, on error, none is.
    pub fn update_where(
        &self,
        locks: &LockManager,
        txn: &mut Transaction,
        schema: &Schema,
        filter: Option<FieldValue>,
        set: FieldValue,
    ) -> Result<Vec<SlotUpdate>, StorageError> {
        txn.ensure_active()?;
        for field in filter.iter().map(|f| f.field).chain([set.field]) {
            if schema.position(field).is_none() {
                return Err(StorageError::ColumnNotFound(field.to_string()));
            }
        }

        let candidates = self.candidates(Some(schema), filter)?;
        self.lock_slots(locks, txn, &candidates, LockMode::Exclusive);

        let mut block = self.0.write();
        let mut updates = Vec::with_capacity(candidates.len());
        for (slot, _) in candidates {
            let Some(mut record) = block.decode_slot(slot)? else {
                continue;
            };
            if filter.is_some_and(|f| !f.matches(schema, &record)) {
                continue;
            }
            let before = record.serialize();
            record.update_field(schema, set.field, set.value)?;
            updates.push(SlotUpdate {
                slot,
                before,
                after: record.serialize(),
            });
        }

        if !updates.is_empty() {
            let replacements: Vec<(usize, Vec<u8>)> = updates
                .iter()
                .map(|u| (u.slot, u.after.clone()))
                .collect();
            block.replace_records(&replacements)?;
            debug!(
                "block {} updated {} records, size {}",
                block.id,
                updates.len(),
                block.size
            );
        }
        Ok(updates)
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::mpsc, thread, time::Duration};

    use crate::storage::column::{Column, ColumnType};

    use super::*;

    fn ints() -> Schema {
        Schema::new(vec![
            Column::new("id1", ColumnType::Int32),
            Column::new("id2", ColumnType::Int32),
        ])
        .unwrap()
    }

    fn encoded(schema: &Schema, values: &[&str]) -> Vec<u8> {
        Record::encode(schema, values).unwrap().serialize()
    }

    fn started(id: u64) -> Transaction {
        let mut txn = Transaction::new(id, id, false);
        txn.begin().unwrap();
        txn
    }

    fn sample() -> (Schema, BlockHandle) {
        let schema = ints();
        let mut block = Block::new(1, 1);
        block.add_record(&encoded(&schema, &["2", "10"])).unwrap();
        block.add_record(&encoded(&schema, &["6", "15"])).unwrap();
        (schema, BlockHandle::new(block))
    }

    #[test]
    fn alignment() {
        assert!(is_aligned(0));
        assert!(is_aligned(8192));
        assert!(!is_aligned(4095));
        assert_eq!(align(0), 0);
        assert_eq!(align(1), 4096);
        assert_eq!(align(4096), 4096);
        assert_eq!(align(4097), 8192);
    }

    #[test]
    fn empty_block_layout() {
        let block = Block::new(1, 1);
        assert_eq!(block.size(), 6);

        let bytes = block.to_bytes();
        assert_eq!(bytes.len(), BLOCK_SIZE);
        assert_eq!(&bytes[..6], b"1\n\n\n6\n");
        assert!(bytes[6..].iter().all(|b| *b == 0));
    }

    #[test]
    fn size_counts_every_serialized_byte() {
        let schema = ints();
        let mut block = Block::new(3, 42);
        for i in 0..20 {
            let bytes = encoded(&schema, &[&i.to_string(), "7"]);
            let expected = block.size_with(bytes.len());
            block.add_record(&bytes).unwrap();
            assert_eq!(block.size(), expected);

            let unpadded = block.to_bytes().iter().rposition(|b| *b != 0).unwrap() + 1;
            assert_eq!(unpadded, block.size());
        }
    }

    #[test]
    fn page_round_trip() {
        let schema = Schema::parse("id:int64,bio:string").unwrap();
        let mut block = Block::new(7, 3);
        block
            .add_record(&encoded(&schema, &["1", "line one\nline two"]))
            .unwrap();
        block.add_record(&encoded(&schema, &["2", ""])).unwrap();

        let mut decoded = Block::from_bytes(7, 3, &block.to_bytes()).unwrap();
        assert!(!decoded.is_dirty());
        block.clear_dirty();
        assert_eq!(decoded, block);

        let record = decoded.decode_slot(0).unwrap().unwrap();
        assert_eq!(
            record.get_field(&schema, "bio"),
            Some(&b"line one\nline two"[..])
        );
        decoded.add_record(&encoded(&schema, &["3", "x"])).unwrap();
        assert!(decoded.is_dirty());
    }

    #[test]
    fn zeroed_page_is_empty_block() {
        let block = Block::from_bytes(1, 5, &[0; BLOCK_SIZE]).unwrap();
        assert_eq!(block, Block::new(1, 5));
    }

    #[test]
    #[should_panic(expected = "expected block 2, found 1")]
    fn page_with_wrong_id() {
        let bytes = Block::new(1, 1).to_bytes();
        Block::from_bytes(1, 2, &bytes).unwrap();
    }

    #[test]
    #[should_panic(expected = "stored size 7")]
    fn page_with_wrong_size() {
        let mut bytes = vec![0; BLOCK_SIZE];
        bytes[..6].copy_from_slice(b"1\n\n\n7\n");
        Block::from_bytes(1, 1, &bytes).unwrap();
    }

    #[test]
    #[should_panic(expected = "record bytes shorter")]
    fn page_with_truncated_records() {
        let mut bytes = vec![0; BLOCK_SIZE];
        bytes[..9].copy_from_slice(b"1\n0,90\nab");
        Block::from_bytes(1, 1, &bytes).unwrap();
    }

    #[test]
    fn capacity_boundary() {
        let mut block = Block::new(1, 1);
        block.add_record(&[b'a'; 20]).unwrap();

        let len = (1..BLOCK_SIZE)
            .find(|len| block.size_with(*len) == BLOCK_SIZE)
            .unwrap();
        assert!(block.can_fit(len));
        assert!(!block.can_fit(len + 1));

        let mut overflow = block.clone();
        let before = overflow.size();
        let err = overflow.add_record(&vec![b'b'; len + 1]).unwrap_err();
        assert!(matches!(err, StorageError::BlockFull { block: 1, .. }));
        assert_eq!(overflow.size(), before);
        assert_eq!(overflow.len(), 1);

        block.add_record(&vec![b'b'; len]).unwrap();
        assert_eq!(block.size(), BLOCK_SIZE);
        assert_eq!(block.available(), 0);

        let err = block.add_record(b"c").unwrap_err();
        assert!(matches!(err, StorageError::BlockFull { .. }));
        assert_eq!(block.size(), BLOCK_SIZE);
        assert_eq!(block.len(), 2);
        assert_eq!(Block::from_bytes(1, 1, &block.to_bytes()).unwrap().size(), BLOCK_SIZE);
    }

    #[test]
    fn filter_scenario() {
        let (schema, handle) = sample();
        let locks = LockManager::new();
        let mut txn = started(5);

        let found = handle
            .filter_records(&locks, &mut txn, &schema, "id1", b"2")
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].get_field(&schema, "id2"), Some(&b"10"[..]));

        assert_eq!(txn.touched().len(), 1);
        assert_eq!(txn.touched()[0].slot, SlotId::new(1, 1, 0));
        assert!(locks.is_locked(SlotId::new(1, 1, 0)));
        assert!(!locks.is_locked(SlotId::new(1, 1, 1)));
    }

    #[test]
    fn records_lock_every_slot() {
        let (schema, handle) = sample();
        let locks = LockManager::new();
        let mut txn = started(5);

        let records = handle.records(&locks, &mut txn).unwrap();
        let ids: Vec<_> = records
            .iter()
            .map(|r| r.get_field(&schema, "id1").unwrap().to_vec())
            .collect();
        assert_eq!(ids, vec![b"2".to_vec(), b"6".to_vec()]);
        assert_eq!(txn.touched().len(), 2);
        assert!(txn.touched().iter().all(|t| t.mode == LockMode::Shared));

        txn.commit(&locks).unwrap();
        assert!(!locks.is_locked(SlotId::new(1, 1, 0)));
        assert!(!locks.is_locked(SlotId::new(1, 1, 1)));
    }

    #[test]
    fn unknown_filter_column_reads_nothing() {
        let (schema, handle) = sample();
        let locks = LockManager::new();
        let mut txn = started(5);

        let found = handle
            .filter_records(&locks, &mut txn, &schema, "id9", b"2")
            .unwrap();
        assert!(found.is_empty());
        assert!(txn.touched().is_empty());
    }

    #[test]
    #[should_panic(expected = "ColumnNotFound")]
    fn unknown_update_column() {
        let (schema, handle) = sample();
        let locks = LockManager::new();
        let mut txn = started(5);
        handle
            .update_records(&locks, &mut txn, &schema, "id9", b"1")
            .unwrap();
    }

    #[test]
    #[should_panic(expected = "not started")]
    fn pending_transaction_cannot_read() {
        let (_, handle) = sample();
        let mut txn = Transaction::new(5, 5, false);
        handle.records(&LockManager::new(), &mut txn).unwrap();
    }

    #[test]
    fn update_filtered_repacks_slots() {
        let (schema, handle) = sample();
        let locks = LockManager::new();
        let mut txn = started(5);
        let before = handle.read().size();

        let updates = handle
            .update_filtered_records(&locks, &mut txn, &schema, "id2", b"10", b"1000")
            .unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].slot, 0);
        assert_eq!(txn.touched()[0].mode, LockMode::Exclusive);

        let block = handle.read();
        assert!(block.is_dirty());
        // two record bytes plus one digit each in the size and the shifted offset
        assert_eq!(block.size(), before + 4);
        assert_eq!(block.slots()[1].offset(), block.slots()[0].size());

        let first = block.decode_slot(0).unwrap().unwrap();
        let second = block.decode_slot(1).unwrap().unwrap();
        assert_eq!(first.get_field(&schema, "id2"), Some(&b"1000"[..]));
        assert_eq!(second.get_field(&schema, "id2"), Some(&b"15"[..]));
        assert_eq!(second.get_field(&schema, "id1"), Some(&b"6"[..]));
    }

    #[test]
    fn update_where_sets_another_column() {
        let (schema, handle) = sample();
        let locks = LockManager::new();
        let mut txn = started(5);

        let updates = handle
            .update_where(
                &locks,
                &mut txn,
                &schema,
                Some(FieldValue::new("id1", b"6")),
                FieldValue::new("id2", b"-1"),
            )
            .unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].slot, 1);

        let found = handle
            .filter_records(&locks, &mut txn, &schema, "id2", b"-1")
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].get_field(&schema, "id1"), Some(&b"6"[..]));
    }

    #[test]
    fn update_records_touches_all() {
        let schema = Schema::parse("id:int32,name:string").unwrap();
        let mut block = Block::new(1, 1);
        for (id, name) in [("1", "a"), ("2", "bb"), ("3", "ccc")] {
            block.add_record(&encoded(&schema, &[id, name])).unwrap();
        }
        let handle = BlockHandle::new(block);
        let locks = LockManager::new();
        let mut txn = started(5);

        let updates = handle
            .update_records(&locks, &mut txn, &schema, "name", b"a longer name")
            .unwrap();
        assert_eq!(updates.len(), 3);

        let block = handle.read();
        let mut offset = 0;
        for slot in block.slots() {
            assert_eq!(slot.offset(), offset);
            offset += slot.size();
        }
        for (i, id) in ["1", "2", "3"].iter().enumerate() {
            let record = block.decode_slot(i).unwrap().unwrap();
            assert_eq!(record.get_field(&schema, "id"), Some(id.as_bytes()));
            assert_eq!(record.get_field(&schema, "name"), Some(&b"a longer name"[..]));
        }
    }

    #[test]
    fn overflowing_update_leaves_block_unchanged() {
        let schema = Schema::parse("id:int32,name:string").unwrap();
        let mut block = Block::new(1, 1);
        block.add_record(&encoded(&schema, &["1", "a"])).unwrap();
        block.add_record(&encoded(&schema, &["2", "b"])).unwrap();
        block.clear_dirty();
        let pristine = block.clone();
        let handle = BlockHandle::new(block);
        let locks = LockManager::new();
        let mut txn = started(5);

        let huge = vec![b'x'; 3000];
        let err = handle
            .update_records(&locks, &mut txn, &schema, "name", &huge)
            .unwrap_err();
        assert!(matches!(err, StorageError::BlockFull { .. }));
        assert_eq!(*handle.read(), pristine);
    }

    #[test]
    fn insert_locks_new_slot() {
        let (schema, handle) = sample();
        let locks = LockManager::new();
        let mut txn = started(5);

        let slot = handle
            .insert(&locks, &mut txn, &encoded(&schema, &["9", "9"]))
            .unwrap();
        assert_eq!(slot, 2);
        assert!(!locks.try_acquire(6, SlotId::new(1, 1, 2), LockMode::Shared));

        txn.rollback(&locks).unwrap();
        assert!(locks.try_acquire(6, SlotId::new(1, 1, 2), LockMode::Exclusive));
    }

    #[test]
    fn reader_waits_for_writer() {
        let (schema, handle) = sample();
        let locks = Arc::new(LockManager::new());
        let mut writer = started(5);
        handle
            .update_filtered_records(&locks, &mut writer, &schema, "id1", b"2", b"3")
            .unwrap();

        let (tx, rx) = mpsc::channel();
        let reader = {
            let locks = Arc::clone(&locks);
            let handle = handle.clone();
            let schema = schema.clone();
            thread::spawn(move || {
                let mut reader = started(6);
                let found = handle
                    .filter_records(&locks, &mut reader, &schema, "id2", b"10")
                    .unwrap();
                tx.send(found.len()).unwrap();
                reader.commit(&locks).unwrap();
            })
        };

        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        writer.commit(&locks).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 1);
        reader.join().unwrap();
    }
}

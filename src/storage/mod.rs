//! Block-based storage engine.
//!
//! Rows are encoded by the [`record`] codec, packed into fixed-size
//! [`block`]s, cached by the [`buffer`] pool and guarded slot-by-slot by the
//! [`lock`] manager on behalf of a [`txn`]. The [`catalog`] hands out the
//! identifiers everything else is keyed by.
pub mod block;
pub mod buffer;
pub mod catalog;
pub mod column;
pub mod disk;
pub mod engine;
pub mod lock;
pub mod log;
pub mod record;
pub mod table;
pub mod txn;

pub use block::{Block, BlockHandle};
pub use buffer::BufferPool;
pub use catalog::{Catalog, CounterKind};
pub use column::{Column, ColumnType, Schema};
pub use engine::{ClientContext, Engine};
pub use error::StorageError;
pub use lock::{LockManager, LockMode, SlotId};
pub use record::{LocationPair, Record};
pub use table::{Database, Table};
pub use txn::{Transaction, TransactionManager, TxnState};

pub type DbId = u64;
pub type TableId = u64;
pub type BlockId = u64;
pub type TxnId = u64;
pub type CommitId = u64;

pub mod header {
    pub mod record {
        pub(crate) const TERM: u8 = b'\n';
        pub(crate) const FIELD_SEP: u8 = b':';
        pub(crate) const LOCATION_SEP: u8 = b',';

        /// One null-bitmap bit per column.
        pub const MAX_COLUMNS: usize = u64::BITS as usize;
    }

    pub mod block {
        use crate::storage::BlockId;

        pub const BLOCK_SIZE: usize = 4096;
        pub(crate) const ALIGN_MASK: u64 = BLOCK_SIZE as u64 - 1;
        pub(crate) const TERM: u8 = b'\n';

        pub(crate) const FIRST_BLOCK_ID: BlockId = 1;
    }
}

pub mod error {
    use std::io;

    use thiserror::Error;

    use super::{BlockId, TxnId};

    #[derive(Debug, Error)]
    pub enum WalError {
        #[error("wal io error: {0}")]
        Io(#[from] io::Error),

        #[error("failed to encode entry: {0}")]
        Serialize(#[from] bincode::error::EncodeError),

        #[error("failed to decode entry: {0}")]
        Deserialize(#[from] bincode::error::DecodeError),
    }

    #[derive(Debug, Error)]
    pub enum StorageError {
        #[error("[parse error][{context}]: {reason}")]
        Parse {
            context: &'static str,
            reason: String,
        },

        #[error("column '{0}' does not exist")]
        ColumnNotFound(String),

        #[error("[invalid value][{column}]: {reason}")]
        InvalidValue { column: String, reason: String },

        #[error("[block {block}] full: requested {requested} bytes, {available} available")]
        BlockFull {
            block: BlockId,
            requested: usize,
            available: usize,
        },

        #[error("[io error][{action}]: {cause}")]
        Io {
            action: &'static str,
            #[source]
            cause: io::Error,
        },

        #[error("[corrupted][{context}]: {reason}")]
        Corrupted { context: String, reason: String },

        #[error("[transaction {id}]: {reason}")]
        Transaction { id: TxnId, reason: String },

        #[error("[wal]: {cause}")]
        Wal {
            #[source]
            cause: WalError,
        },
    }

    impl StorageError {
        pub(crate) fn parse(context: &'static str, reason: impl Into<String>) -> Self {
            StorageError::Parse {
                context,
                reason: reason.into(),
            }
        }

        pub(crate) fn io(action: &'static str) -> impl FnOnce(io::Error) -> Self {
            move |cause| StorageError::Io { action, cause }
        }
    }

    impl From<WalError> for StorageError {
        fn from(cause: WalError) -> Self {
            StorageError::Wal { cause }
        }
    }
}

//! Engine configuration and on-disk layout.
//!
//! ```text
//! <data>/.meta/catalog                  bootstrap table
//! <data>/.meta/wal.log                  write-ahead log
//! <data>/<database>/<table>/<table>.data
//! ```
use std::path::{Path, PathBuf};

const META_DIR: &str = ".meta";
const CATALOG_FILE: &str = "catalog";
const WAL_FILE: &str = "wal.log";
const TABLE_EXTENSION: &str = "data";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Root directory of every database.
    pub data_path: PathBuf,
    /// Read/write buffer size of block files, in bytes.
    pub buffer_size: usize,
    /// Write buffer size of the write-ahead log, in bytes.
    pub wal_buffer_size: usize,
    /// Whether record updates are appended to the write-ahead log.
    pub wal: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_path: PathBuf::from("./data"),
            buffer_size: 64 * 1024,
            wal_buffer_size: 16 * 1024,
            wal: true,
        }
    }
}

impl Config {
    pub fn new(data_path: impl Into<PathBuf>) -> Self {
        Self {
            data_path: data_path.into(),
            ..Self::default()
        }
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    pub fn with_wal_buffer_size(mut self, wal_buffer_size: usize) -> Self {
        self.wal_buffer_size = wal_buffer_size;
        self
    }

    pub fn with_wal(mut self, wal: bool) -> Self {
        self.wal = wal;
        self
    }

    pub fn meta_path(&self) -> PathBuf {
        self.data_path.join(META_DIR)
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.meta_path().join(CATALOG_FILE)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.meta_path().join(WAL_FILE)
    }

    pub fn database_path(&self, database: &str) -> PathBuf {
        self.data_path.join(database)
    }

    pub fn table_dir(&self, database: &str, table: &str) -> PathBuf {
        self.database_path(database).join(table)
    }

    pub fn table_path(&self, database: &str, table: &str) -> PathBuf {
        self.table_dir(database, table)
            .join(Path::new(table).with_extension(TABLE_EXTENSION))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout() {
        let config = Config::new("/var/slate");
        assert_eq!(config.catalog_path(), PathBuf::from("/var/slate/.meta/catalog"));
        assert_eq!(config.wal_path(), PathBuf::from("/var/slate/.meta/wal.log"));
        assert_eq!(
            config.table_path("shop", "orders"),
            PathBuf::from("/var/slate/shop/orders/orders.data")
        );
    }

    #[test]
    fn builders() {
        let config = Config::new("d")
            .with_buffer_size(10)
            .with_wal_buffer_size(20)
            .with_wal(false);
        assert_eq!(config.buffer_size, 10);
        assert_eq!(config.wal_buffer_size, 20);
        assert!(!config.wal);
    }
}

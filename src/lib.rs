pub mod cli;
pub mod config;
pub mod statement;
pub mod storage;

pub use cli::{Command, prompt};
pub use config::Config;
pub use statement::Statement;
pub use storage::{ClientContext, Database, Engine, Schema, StorageError, Table};

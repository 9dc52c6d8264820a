//! Chunked binary object storage on top of a document database.
//!
//! A stored file is one metadata document in `<bucket>.files` plus one
//! document per fixed size slice of its payload in `<bucket>.chunks`. The
//! database itself is reached through the [db::Database] and
//! [db::Collection] traits; [db::MemoryDatabase] and [db::PgDatabase] are
//! the bundled backends.

pub mod chunker;
pub mod config;
pub mod db;
pub mod document;
pub mod errors;
pub mod grid;
pub mod models;

pub use config::GridConfig;
pub use document::{Document, Value};
pub use errors::{Error, InvalidRecord, Result};
pub use grid::{FileHandle, GridStore, StoreOptions};
pub use models::{ChunkRecord, FileFilter, FileRecord};

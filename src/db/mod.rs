use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use log::warn;

use crate::document::{Document, JsonDecodeError, Value};
use crate::errors::{Error, Result as GridResult};

pub mod file_chunks;
pub mod files;
pub mod memory;
pub mod postgres;

pub use self::memory::MemoryDatabase;
pub use self::postgres::PgDatabase;

/// Failures reported by a [Collection] backend.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    #[error("duplicate key {key} for unique index {index}")]
    DuplicateKey { index: String, key: String },

    #[error("index {0} already exists with different options")]
    IndexConflict(String),

    #[error("invalid collection name {0:?}")]
    InvalidName(String),

    #[error(transparent)]
    Decode(#[from] JsonDecodeError),
}

/// A lazy, forward-only sequence of documents. Dropping it releases the
/// underlying cursor.
pub type DocumentStream = BoxStream<'static, Result<Document, DbError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    pub sort: Vec<(String, SortOrder)>,
    pub skip: u64,
    /// 0 means no limit.
    pub limit: u64,
    /// Fields to keep besides `_id`. `None` returns whole documents.
    pub projection: Option<Vec<String>>,
}

impl FindOptions {
    pub fn sorted_by(field: &str, order: SortOrder) -> Self {
        FindOptions {
            sort: vec![(field.to_string(), order)],
            ..Default::default()
        }
    }

    pub fn skip(mut self, skip: u64) -> Self {
        self.skip = skip;
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = limit;
        self
    }

    pub fn project(mut self, fields: &[&str]) -> Self {
        self.projection = Some(fields.iter().map(|f| f.to_string()).collect());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexModel {
    pub name: String,
    pub keys: Vec<(String, SortOrder)>,
    pub unique: bool,
    pub background: bool,
}

impl IndexModel {
    pub fn new(name: &str, keys: &[(&str, SortOrder)]) -> Self {
        IndexModel {
            name: name.to_string(),
            keys: keys.iter().map(|(k, o)| (k.to_string(), *o)).collect(),
            unique: false,
            background: true,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Same keys and uniqueness; `background` is only a build hint.
    pub fn same_definition(&self, other: &IndexModel) -> bool {
        self.keys == other.keys && self.unique == other.unique
    }
}

/// A named set of documents in the backing document database.
#[async_trait]
pub trait Collection: Send + Sync {
    fn name(&self) -> &str;

    /// Insert a document, assigning a fresh `_id` if it has none.
    /// Returns the document's `_id`.
    async fn insert(&self, doc: Document) -> Result<Value, DbError>;

    /// All documents matching every field of `filter`.
    async fn find(&self, filter: Document, options: FindOptions) -> Result<DocumentStream, DbError>;

    async fn find_one(&self, filter: Document) -> Result<Option<Document>, DbError>;

    /// Idempotent for an identical index definition.
    async fn create_index(&self, index: IndexModel) -> Result<(), DbError>;

    async fn list_indexes(&self) -> Result<Vec<IndexModel>, DbError>;

    /// Returns the number of deleted documents.
    async fn delete_many(&self, filter: Document) -> Result<u64, DbError>;
}

#[async_trait]
pub trait Database: Send + Sync {
    /// Bind to a named collection, creating it if the backend needs that.
    async fn collection(&self, name: &str) -> Result<Arc<dyn Collection>, DbError>;
}

/// Make sure `doc` has an `_id`, returning it.
pub(crate) fn ensure_id(doc: &mut Document) -> Value {
    match doc.get("_id") {
        Some(id) => id.clone(),
        None => {
            let id = Value::Id(uuid::Uuid::new_v4());
            doc.insert("_id", id.clone());
            id
        }
    }
}

/// Create `index` on `collection`. With `best_effort` a failure is logged
/// and swallowed; otherwise it is returned as [Error::IndexSetup].
pub(crate) async fn ensure_index(
    collection: &dyn Collection,
    index: IndexModel,
    best_effort: bool,
) -> GridResult<()> {
    let name = index.name.clone();
    match collection.create_index(index).await {
        Ok(()) => Ok(()),
        Err(e) if best_effort => {
            warn!(
                "could not create index {} on {}, continuing without it: {}",
                name,
                collection.name(),
                e
            );
            Ok(())
        }
        Err(e) => Err(Error::IndexSetup {
            collection: collection.name().to_string(),
            source: e,
        }),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use futures::StreamExt;

    use super::*;

    fn garbage() -> DbError {
        match Document::try_from(serde_json::json!("not an object")) {
            Err(e) => DbError::Decode(e),
            Ok(_) => DbError::InvalidName("garbage".to_string()),
        }
    }

    /// Behaves like the wrapped collection, except that every query also
    /// runs into one stored row that cannot be decoded.
    pub(crate) struct Garbled(pub Arc<dyn Collection>);

    #[async_trait]
    impl Collection for Garbled {
        fn name(&self) -> &str {
            self.0.name()
        }

        async fn insert(&self, doc: Document) -> Result<Value, DbError> {
            self.0.insert(doc).await
        }

        async fn find(&self, filter: Document, options: FindOptions) -> Result<DocumentStream, DbError> {
            let docs = self.0.find(filter, options).await?;
            Ok(docs.chain(futures::stream::once(async { Err(garbage()) })).boxed())
        }

        async fn find_one(&self, _filter: Document) -> Result<Option<Document>, DbError> {
            Err(garbage())
        }

        async fn create_index(&self, index: IndexModel) -> Result<(), DbError> {
            self.0.create_index(index).await
        }

        async fn list_indexes(&self) -> Result<Vec<IndexModel>, DbError> {
            self.0.list_indexes().await
        }

        async fn delete_many(&self, filter: Document) -> Result<u64, DbError> {
            self.0.delete_many(filter).await
        }
    }
}

use uuid::Uuid;

use crate::db::DbError;

/// Errors surfaced by the grid store.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid chunk size {chunk_size}: must be between 1 and {max}")]
    InvalidChunkSize { chunk_size: usize, max: usize },

    /// Only surfaced when index creation is configured as strict.
    #[error("index setup failed on {collection}: {source}")]
    IndexSetup {
        collection: String,
        #[source]
        source: DbError,
    },

    #[error("write to {collection} failed: {source}")]
    Write {
        collection: String,
        #[source]
        source: DbError,
    },

    #[error("query on {collection} failed: {source}")]
    Query {
        collection: String,
        #[source]
        source: DbError,
    },

    /// The stored chunks do not reconcile with the file record.
    #[error("file {id} is inconsistent: {reason}")]
    Corrupt { id: Uuid, reason: String },
}

impl Error {
    pub(crate) fn write(collection: &str, source: DbError) -> Self {
        Error::Write {
            collection: collection.to_string(),
            source,
        }
    }

    pub(crate) fn query(collection: &str, source: DbError) -> Self {
        Error::Query {
            collection: collection.to_string(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Outcome of decoding a record from a stored document that lacks one of
/// its required fields (or holds it with the wrong type).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidRecord {
    #[error("missing or mistyped field `{0}`")]
    MissingField(&'static str),

    /// The backend could not turn the stored row into a document at all.
    #[error("undecodable document: {0}")]
    Undecodable(String),
}

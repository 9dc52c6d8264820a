use std::sync::Arc;

use bytes::Bytes;
use futures::future;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use log::debug;
use uuid::Uuid;

use super::{ensure_index, Collection, DbError, FindOptions, IndexModel, SortOrder};
use crate::document::{Document, Value};
use crate::errors::{Error, Result};
use crate::models::file_chunk::{self, ChunkRecord};

pub const CHUNKS_INDEX: &str = "chunksindex";

/// Access to the `<bucket>.chunks` collection.
#[derive(Clone)]
pub struct ChunkStore {
    collection: Arc<dyn Collection>,
}

fn by_file(files_id: Uuid) -> Document {
    Document::new().with(file_chunk::FILES_ID, files_id)
}

/// Rows the backend cannot decode are skipped like malformed chunks.
fn readable(collection: &str, doc: std::result::Result<Document, DbError>) -> Option<Result<Document>> {
    match doc {
        Ok(doc) => Some(Ok(doc)),
        Err(DbError::Decode(e)) => {
            debug!("skipping undecodable chunk in {}: {}", collection, e);
            None
        }
        Err(e) => Some(Err(Error::query(collection, e))),
    }
}

impl ChunkStore {
    pub fn new(collection: Arc<dyn Collection>) -> Self {
        ChunkStore { collection }
    }

    pub fn name(&self) -> &str {
        self.collection.name()
    }

    /// Unique over (files_id, n), so a file can never hold two chunks with
    /// the same sequence number.
    pub fn index() -> IndexModel {
        IndexModel::new(
            CHUNKS_INDEX,
            &[
                (file_chunk::FILES_ID, SortOrder::Ascending),
                (file_chunk::N, SortOrder::Ascending),
            ],
        )
        .unique()
    }

    pub async fn ensure_indexes(&self, best_effort: bool) -> Result<()> {
        ensure_index(self.collection.as_ref(), Self::index(), best_effort).await
    }

    /// Insert chunks one at a time, in the given order. Stops at the first
    /// failed write; chunks written before it stay in place.
    pub async fn insert_many(&self, records: &[ChunkRecord]) -> Result<Vec<Value>> {
        let mut ids = Vec::with_capacity(records.len());
        for record in records {
            let id = self
                .collection
                .insert(record.to_document())
                .await
                .map_err(|e| Error::write(self.name(), e))?;
            ids.push(id);
        }
        Ok(ids)
    }

    /// Chunks of one file by ascending `n`. `limit == 0` means no limit.
    /// Malformed chunk documents are left out.
    pub async fn find_chunks_for(
        &self,
        files_id: Uuid,
        skip: u64,
        limit: u64,
    ) -> Result<BoxStream<'static, Result<ChunkRecord>>> {
        let name = self.name().to_string();
        let options = FindOptions::sorted_by(file_chunk::N, SortOrder::Ascending)
            .skip(skip)
            .limit(limit);
        let docs = self
            .collection
            .find(by_file(files_id), options)
            .await
            .map_err(|e| Error::query(&name, e))?;

        Ok(docs
            .filter_map(move |doc| future::ready(readable(&name, doc)))
            .try_filter_map(|doc| async move {
                match ChunkRecord::from_document(&doc) {
                    Ok(chunk) => Ok(Some(chunk)),
                    Err(invalid) => {
                        debug!("skipping malformed chunk: {}", invalid);
                        Ok(None)
                    }
                }
            })
            .boxed())
    }

    /// Only the payloads of one file's chunks, by ascending `n`.
    pub async fn raw_chunk_cursor(&self, files_id: Uuid) -> Result<BoxStream<'static, Result<Bytes>>> {
        let name = self.name().to_string();
        let options =
            FindOptions::sorted_by(file_chunk::N, SortOrder::Ascending).project(&[file_chunk::DATA]);
        let docs = self
            .collection
            .find(by_file(files_id), options)
            .await
            .map_err(|e| Error::query(&name, e))?;

        Ok(docs
            .filter_map(move |doc| future::ready(readable(&name, doc)))
            .try_filter_map(|doc| async move { Ok(doc.get_binary(file_chunk::DATA).cloned()) })
            .boxed())
    }

    /// Remove every chunk of a file, returning how many were removed.
    pub async fn delete_for(&self, files_id: Uuid) -> Result<u64> {
        self.collection
            .delete_many(by_file(files_id))
            .await
            .map_err(|e| Error::write(self.name(), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::Garbled;
    use crate::db::{Database, MemoryDatabase};

    async fn store() -> ChunkStore {
        let coll = MemoryDatabase::new().collection("fs.chunks").await.unwrap();
        let store = ChunkStore::new(coll);
        store.ensure_indexes(false).await.unwrap();
        store
    }

    fn chunks(files_id: Uuid, parts: &[&'static [u8]]) -> Vec<ChunkRecord> {
        parts
            .iter()
            .enumerate()
            .map(|(n, p)| ChunkRecord::new(files_id, n as i32, Bytes::from_static(p)))
            .collect()
    }

    #[tokio::test]
    async fn chunks_come_back_in_order() {
        let store = store().await;
        let files_id = Uuid::new_v4();
        let mut records = chunks(files_id, &[b"aa", b"bb", b"c"]);
        records.reverse();
        store.insert_many(&records).await.unwrap();

        let got: Vec<ChunkRecord> = store
            .find_chunks_for(files_id, 0, 0)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        let ns: Vec<i32> = got.iter().map(|c| c.n).collect();
        assert_eq!(ns, vec![0, 1, 2]);
        assert!(got.iter().all(|c| c.id.is_some()));

        let raw: Vec<Bytes> = store
            .raw_chunk_cursor(files_id)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(raw.concat(), b"aabbc".to_vec());
    }

    #[tokio::test]
    async fn duplicate_sequence_number_fails_midway() {
        let store = store().await;
        let files_id = Uuid::new_v4();
        let mut records = chunks(files_id, &[b"a", b"b"]);
        records.push(ChunkRecord::new(files_id, 1, Bytes::from_static(b"dup")));
        records.push(ChunkRecord::new(files_id, 2, Bytes::from_static(b"c")));

        let err = store.insert_many(&records).await.unwrap_err();
        assert!(matches!(err, Error::Write { .. }));

        // the first two stay, nothing after the failure was written
        let raw: Vec<Bytes> = store
            .raw_chunk_cursor(files_id)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(raw.concat(), b"ab".to_vec());
    }

    #[tokio::test]
    async fn malformed_chunks_are_skipped() {
        let store = store().await;
        let files_id = Uuid::new_v4();
        store.insert_many(&chunks(files_id, &[b"a"])).await.unwrap();
        store
            .collection
            .insert(by_file(files_id).with(file_chunk::N, 1).with(file_chunk::DATA, "text"))
            .await
            .unwrap();

        let got: Vec<ChunkRecord> = store
            .find_chunks_for(files_id, 0, 0)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(got.len(), 1);
    }

    #[tokio::test]
    async fn undecodable_chunks_are_skipped() {
        let store = ChunkStore::new(Arc::new(Garbled(store().await.collection)));
        let files_id = Uuid::new_v4();
        store.insert_many(&chunks(files_id, &[b"a", b"b"])).await.unwrap();

        let got: Vec<ChunkRecord> = store
            .find_chunks_for(files_id, 0, 0)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(got.len(), 2);

        let raw: Vec<Bytes> = store
            .raw_chunk_cursor(files_id)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(raw.concat(), b"ab".to_vec());
    }
}

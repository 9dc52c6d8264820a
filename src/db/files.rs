use std::sync::Arc;

use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use log::debug;
use metrics::counter;
use uuid::Uuid;

use super::{ensure_index, Collection, DbError, FindOptions, IndexModel, SortOrder};
use crate::errors::{Error, InvalidRecord, Result};
use crate::models::file::{self, FileRecord};
use crate::models::FileFilter;

pub const FILES_INDEX: &str = "filesindex";

/// Access to the `<bucket>.files` collection.
#[derive(Clone)]
pub struct FileCatalog {
    collection: Arc<dyn Collection>,
}

impl FileCatalog {
    pub fn new(collection: Arc<dyn Collection>) -> Self {
        FileCatalog { collection }
    }

    pub fn name(&self) -> &str {
        self.collection.name()
    }

    pub fn index() -> IndexModel {
        IndexModel::new(
            FILES_INDEX,
            &[
                (file::FILENAME, SortOrder::Ascending),
                (file::UPLOAD_DATE, SortOrder::Ascending),
            ],
        )
    }

    pub async fn ensure_indexes(&self, best_effort: bool) -> Result<()> {
        ensure_index(self.collection.as_ref(), Self::index(), best_effort).await
    }

    pub async fn insert(&self, record: &FileRecord) -> Result<Uuid> {
        self.collection
            .insert(record.to_document())
            .await
            .map_err(|e| Error::write(self.name(), e))?;
        Ok(record.id)
    }

    /// Every matching document, decoded. Malformed documents show up as
    /// `Ok(Err(InvalidRecord))` so the caller decides what to do with them.
    pub async fn find_decoded(
        &self,
        filter: &FileFilter,
    ) -> Result<BoxStream<'static, Result<std::result::Result<FileRecord, InvalidRecord>>>> {
        let name = self.name().to_string();
        let docs = self
            .collection
            .find(filter.to_document(), FindOptions::default())
            .await
            .map_err(|e| Error::query(&name, e))?;

        Ok(docs
            .map(move |doc| match doc {
                Ok(d) => Ok(FileRecord::from_document(&d)),
                Err(DbError::Decode(e)) => Ok(Err(InvalidRecord::Undecodable(e.to_string()))),
                Err(e) => Err(Error::query(&name, e)),
            })
            .boxed())
    }

    /// Like [FileCatalog::find_decoded], with malformed records left out.
    pub async fn find(&self, filter: &FileFilter) -> Result<BoxStream<'static, Result<FileRecord>>> {
        let records = self.find_decoded(filter).await?;
        Ok(records
            .try_filter_map(|decoded| async move {
                match decoded {
                    Ok(record) => Ok(Some(record)),
                    Err(invalid) => {
                        debug!("skipping malformed file record: {}", invalid);
                        counter!("gridstore_records_skipped_total").increment(1);
                        Ok(None)
                    }
                }
            })
            .boxed())
    }

    /// The first matching record. A malformed first match reads as absent.
    pub async fn find_one(&self, filter: &FileFilter) -> Result<Option<FileRecord>> {
        let decoded = match self.collection.find_one(filter.to_document()).await {
            Ok(doc) => doc.map(|d| FileRecord::from_document(&d)),
            Err(DbError::Decode(e)) => Some(Err(InvalidRecord::Undecodable(e.to_string()))),
            Err(e) => return Err(Error::query(self.name(), e)),
        };

        Ok(decoded.and_then(|decoded| match decoded {
            Ok(record) => Some(record),
            Err(invalid) => {
                debug!("first match is a malformed file record: {}", invalid);
                counter!("gridstore_records_skipped_total").increment(1);
                None
            }
        }))
    }

    /// Returns whether a record was removed.
    pub async fn delete(&self, id: Uuid) -> Result<bool> {
        let deleted = self
            .collection
            .delete_many(FileFilter::all().id(id).to_document())
            .await
            .map_err(|e| Error::write(self.name(), e))?;
        Ok(deleted > 0)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::db::testing::Garbled;
    use crate::db::{Database, MemoryDatabase};
    use crate::document::Document;

    fn record(filename: &str) -> FileRecord {
        FileRecord {
            id: Uuid::new_v4(),
            length: 3,
            chunk_size: 255_000,
            upload_date: Utc::now(),
            checksum: crate::chunker::checksum(b"abc"),
            filename: Some(filename.to_string()),
            content_type: None,
            aliases: vec![],
            metadata: None,
        }
    }

    async fn catalog() -> (FileCatalog, Arc<dyn Collection>) {
        let coll = MemoryDatabase::new().collection("fs.files").await.unwrap();
        (FileCatalog::new(coll.clone()), coll)
    }

    #[tokio::test]
    async fn find_skips_malformed_but_find_decoded_reports_them() {
        let (catalog, coll) = catalog().await;
        catalog.insert(&record("a.txt")).await.unwrap();
        coll.insert(Document::new().with("filename", "a.txt"))
            .await
            .unwrap();

        let filter = FileFilter::all().filename("a.txt");
        let found: Vec<FileRecord> = catalog
            .find(&filter)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(found.len(), 1);

        let decoded: Vec<_> = catalog
            .find_decoded(&filter)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded.iter().filter(|d| d.is_err()).count(), 1);
    }

    #[tokio::test]
    async fn undecodable_rows_count_as_malformed() {
        let (catalog, coll) = catalog().await;
        let catalog = FileCatalog::new(Arc::new(Garbled(coll)));
        let rec = record("a.txt");
        catalog.insert(&rec).await.unwrap();

        let found: Vec<FileRecord> = catalog
            .find(&FileFilter::all())
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(found, vec![rec]);

        let decoded: Vec<_> = catalog
            .find_decoded(&FileFilter::all())
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert!(matches!(decoded.last(), Some(Err(InvalidRecord::Undecodable(_)))));

        assert!(catalog.find_one(&FileFilter::all()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn find_one_not_found_is_none() {
        let (catalog, _) = catalog().await;
        assert!(catalog
            .find_one(&FileFilter::all().filename("nope"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn delete_reports_existence() {
        let (catalog, _) = catalog().await;
        let rec = record("a.txt");
        catalog.insert(&rec).await.unwrap();
        assert!(catalog.delete(rec.id).await.unwrap());
        assert!(!catalog.delete(rec.id).await.unwrap());
    }
}

use std::time::Instant;

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use log::{error, info, warn};
use metrics::{counter, histogram};
use uuid::Uuid;

use crate::chunker;
use crate::config::GridConfig;
use crate::db::file_chunks::ChunkStore;
use crate::db::files::FileCatalog;
use crate::db::Database;
use crate::document::{Document, Value};
use crate::errors::{Error, InvalidRecord, Result};
use crate::models::{ChunkRecord, FileFilter, FileRecord};

/// Optional fields for [GridStore::store_file_with].
#[derive(Debug, Clone, Default)]
pub struct StoreOptions {
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub aliases: Vec<String>,
    pub metadata: Option<Value>,
    /// Falls back to the bucket's configured chunk size.
    pub chunk_size: Option<usize>,
}

impl StoreOptions {
    pub fn named(filename: &str) -> Self {
        StoreOptions {
            filename: Some(filename.to_string()),
            ..Default::default()
        }
    }
}

/// Chunked file storage on top of two collections of a document database,
/// `<bucket>.files` for file records and `<bucket>.chunks` for payload
/// chunks.
///
/// Writes are not atomic across the two collections: the file record is
/// written first, then the chunks one by one. A failure in between leaves a
/// record whose chunks are missing or incomplete, and nothing repairs it.
/// Readers may likewise see a record before all of its chunks exist;
/// [FileHandle::read_to_end] detects both cases.
#[derive(Clone)]
pub struct GridStore {
    config: GridConfig,
    files: FileCatalog,
    chunks: ChunkStore,
}

impl GridStore {
    /// Bind to the bucket's collections and set up their indexes. Safe to
    /// call any number of times for the same bucket.
    pub async fn initialize(db: &dyn Database, config: GridConfig) -> Result<Self> {
        let files_name = config.files_collection();
        let chunks_name = config.chunks_collection();

        let files = db
            .collection(&files_name)
            .await
            .map_err(|e| Error::query(&files_name, e))?;
        let chunks = db
            .collection(&chunks_name)
            .await
            .map_err(|e| Error::query(&chunks_name, e))?;

        let store = GridStore {
            config,
            files: FileCatalog::new(files),
            chunks: ChunkStore::new(chunks),
        };
        store.ensure_indexes().await?;

        info!("grid store bound to bucket {}", store.config.bucket_name);
        Ok(store)
    }

    pub async fn ensure_indexes(&self) -> Result<()> {
        let best_effort = self.config.index_creation_is_best_effort;
        self.chunks.ensure_indexes(best_effort).await?;
        self.files.ensure_indexes(best_effort).await
    }

    pub fn config(&self) -> &GridConfig {
        &self.config
    }

    pub fn files(&self) -> &FileCatalog {
        &self.files
    }

    pub fn chunks(&self) -> &ChunkStore {
        &self.chunks
    }

    pub async fn store_file(
        &self,
        payload: impl Into<Bytes>,
        filename: Option<&str>,
        chunk_size: usize,
    ) -> Result<Uuid> {
        let options = StoreOptions {
            filename: filename.map(str::to_string),
            chunk_size: Some(chunk_size),
            ..Default::default()
        };
        self.store_file_with(payload, options).await
    }

    /// Store `payload` as a new file and return its id.
    ///
    /// The chunk size is checked before anything is written. After that, the
    /// file record and then each chunk (by ascending `n`) are written as
    /// separate steps; see [GridStore] for what a failure leaves behind.
    pub async fn store_file_with(&self, payload: impl Into<Bytes>, options: StoreOptions) -> Result<Uuid> {
        let start = Instant::now();
        let payload: Bytes = payload.into();
        let chunk_size = options.chunk_size.unwrap_or(self.config.chunk_size);

        let slices = chunker::split(&payload, chunk_size)?;
        // n is a 32 bit sequence number
        if i32::try_from(slices.len()).is_err() {
            return Err(Error::InvalidChunkSize {
                chunk_size,
                max: chunker::MAX_CHUNK_SIZE,
            });
        }

        let record = FileRecord {
            id: Uuid::new_v4(),
            length: payload.len() as i64,
            chunk_size: chunk_size as i32,
            upload_date: Utc::now(),
            checksum: chunker::checksum(&payload),
            filename: options.filename,
            content_type: options.content_type,
            aliases: options.aliases,
            metadata: options.metadata,
        };
        let id = self.files.insert(&record).await?;

        let chunks: Vec<ChunkRecord> = slices
            .into_iter()
            .enumerate()
            .map(|(n, data)| ChunkRecord::new(id, n as i32, data))
            .collect();
        if let Err(e) = self.chunks.insert_many(&chunks).await {
            error!(
                "file {} is recorded but its chunks were not fully written: {}",
                id, e
            );
            return Err(e);
        }

        counter!("gridstore_files_stored_total").increment(1);
        counter!("gridstore_chunks_written_total").increment(chunks.len() as u64);
        counter!("gridstore_bytes_stored_total").increment(payload.len() as u64);
        histogram!("gridstore_store_seconds").record(start.elapsed().as_secs_f64());

        info!(
            "stored file {} ({} bytes in {} chunks)",
            id,
            record.length,
            chunks.len()
        );
        Ok(id)
    }

    /// All files matching `filter`. Malformed file records are left out.
    pub async fn find_files(&self, filter: &FileFilter) -> Result<BoxStream<'static, Result<FileHandle>>> {
        let files = self.files.clone();
        let chunks = self.chunks.clone();
        let records = self.files.find(filter).await?;
        Ok(records
            .map_ok(move |record| FileHandle::new(record, files.clone(), chunks.clone()))
            .boxed())
    }

    pub async fn find_one_file(&self, filter: &FileFilter) -> Result<Option<FileHandle>> {
        let record = self.files.find_one(filter).await?;
        Ok(record.map(|r| FileHandle::new(r, self.files.clone(), self.chunks.clone())))
    }

    /// The payloads of a file's chunks, by ascending `n`, without decoding the
    /// file record.
    pub async fn raw_chunk_sequence(&self, file_id: Uuid) -> Result<BoxStream<'static, Result<Bytes>>> {
        self.chunks.raw_chunk_cursor(file_id).await
    }

    /// Delete a file: first its record, then its chunks. Returns whether a
    /// record existed. Chunks are removed even without a record, which
    /// cleans up after an earlier interrupted delete.
    pub async fn delete_file(&self, file_id: Uuid) -> Result<bool> {
        delete(&self.files, &self.chunks, file_id).await
    }
}

async fn delete(files: &FileCatalog, chunks: &ChunkStore, file_id: Uuid) -> Result<bool> {
    let existed = files.delete(file_id).await?;
    match chunks.delete_for(file_id).await {
        Ok(removed) => {
            counter!("gridstore_files_deleted_total").increment(u64::from(existed));
            info!("deleted file {} and {} chunks", file_id, removed);
            Ok(existed)
        }
        Err(e) => {
            warn!(
                "record of file {} is gone but its chunks could not be removed: {}",
                file_id, e
            );
            Err(e)
        }
    }
}

/// A stored file's record, bound to the collections it was read from.
#[derive(Clone)]
pub struct FileHandle {
    record: FileRecord,
    files: FileCatalog,
    chunks: ChunkStore,
}

impl FileHandle {
    pub fn new(record: FileRecord, files: FileCatalog, chunks: ChunkStore) -> Self {
        FileHandle {
            record,
            files,
            chunks,
        }
    }

    /// Fails when the document lacks a required file field.
    pub fn from_document(
        doc: &Document,
        files: FileCatalog,
        chunks: ChunkStore,
    ) -> std::result::Result<Self, InvalidRecord> {
        Ok(Self::new(FileRecord::from_document(doc)?, files, chunks))
    }

    pub fn record(&self) -> &FileRecord {
        &self.record
    }

    pub fn id(&self) -> Uuid {
        self.record.id
    }

    pub fn length(&self) -> i64 {
        self.record.length
    }

    pub fn chunk_size(&self) -> i32 {
        self.record.chunk_size
    }

    pub fn upload_date(&self) -> DateTime<Utc> {
        self.record.upload_date
    }

    pub fn checksum(&self) -> &str {
        &self.record.checksum
    }

    pub fn filename(&self) -> Option<&str> {
        self.record.filename.as_deref()
    }

    pub fn content_type(&self) -> Option<&str> {
        self.record.content_type.as_deref()
    }

    pub fn aliases(&self) -> &[String] {
        &self.record.aliases
    }

    pub fn metadata(&self) -> Option<&Value> {
        self.record.metadata.as_ref()
    }

    pub fn chunk_count(&self) -> u64 {
        self.record.chunk_count()
    }

    /// This file's chunks by ascending `n`; `limit == 0` means no limit.
    pub async fn find_chunks(&self, skip: u64, limit: u64) -> Result<BoxStream<'static, Result<ChunkRecord>>> {
        self.chunks.find_chunks_for(self.record.id, skip, limit).await
    }

    /// Reassemble the whole payload, checking it against the record:
    /// sequence numbers must run from 0 without gaps, every chunk but the
    /// last must be exactly `chunkSize` long, and length and checksum must
    /// match.
    pub async fn read_to_end(&self) -> Result<Bytes> {
        let id = self.record.id;
        let corrupt = |reason: String| Error::Corrupt { id, reason };

        let expected_chunks = self.chunk_count();
        let chunk_size = usize::try_from(self.record.chunk_size).unwrap_or(0);
        // grows with the chunks actually read, never with the recorded length
        let mut buf = BytesMut::new();
        let mut next_n: i32 = 0;

        let mut chunks = self.find_chunks(0, 0).await?;
        while let Some(chunk) = chunks.try_next().await? {
            if chunk.n != next_n {
                return Err(corrupt(format!(
                    "expected chunk {} but found chunk {}",
                    next_n, chunk.n
                )));
            }
            let is_last = next_n as u64 + 1 == expected_chunks;
            if chunk.len() > chunk_size || (!is_last && chunk.len() != chunk_size) {
                return Err(corrupt(format!(
                    "chunk {} holds {} bytes, chunk size is {}",
                    chunk.n,
                    chunk.len(),
                    chunk_size
                )));
            }
            if buf.len() + chunk.len() > usize::try_from(self.record.length).unwrap_or(0) {
                return Err(corrupt(format!(
                    "chunks hold more than the recorded {} bytes",
                    self.record.length
                )));
            }
            buf.extend_from_slice(&chunk.data);
            next_n += 1;
        }

        if next_n as u64 != expected_chunks {
            return Err(corrupt(format!(
                "found {} chunks, expected {}",
                next_n, expected_chunks
            )));
        }
        if buf.len() as i64 != self.record.length {
            return Err(corrupt(format!(
                "chunks hold {} bytes, record says {}",
                buf.len(),
                self.record.length
            )));
        }
        let checksum = chunker::checksum(&buf);
        if checksum != self.record.checksum {
            return Err(corrupt(format!(
                "checksum {} does not match recorded {}",
                checksum, self.record.checksum
            )));
        }
        Ok(buf.freeze())
    }

    /// Delete this file; see [GridStore::delete_file].
    pub async fn delete(self) -> Result<bool> {
        delete(&self.files, &self.chunks, self.record.id).await
    }
}

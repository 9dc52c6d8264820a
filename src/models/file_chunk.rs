use bytes::Bytes;
use uuid::Uuid;

use crate::document::{Document, Value};
use crate::errors::InvalidRecord;

pub const ID: &str = "_id";
pub const FILES_ID: &str = "files_id";
pub const N: &str = "n";
pub const DATA: &str = "data";

/// One slice of a stored file's payload.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkRecord {
    /// Assigned by the store on insert; `None` until then.
    pub id: Option<Value>,
    pub files_id: Uuid,
    /// Zero based position of this chunk within the file.
    pub n: i32,
    pub data: Bytes,
}

impl ChunkRecord {
    pub fn new(files_id: Uuid, n: i32, data: Bytes) -> Self {
        ChunkRecord {
            id: None,
            files_id,
            n,
            data,
        }
    }

    pub fn from_document(doc: &Document) -> Result<Self, InvalidRecord> {
        let id = doc.get(ID).cloned().ok_or(InvalidRecord::MissingField(ID))?;
        let files_id = doc
            .get_id(FILES_ID)
            .ok_or(InvalidRecord::MissingField(FILES_ID))?;
        let n = doc.get_i32(N).ok_or(InvalidRecord::MissingField(N))?;
        let data = doc
            .get_binary(DATA)
            .cloned()
            .ok_or(InvalidRecord::MissingField(DATA))?;

        Ok(ChunkRecord {
            id: Some(id),
            files_id,
            n,
            data,
        })
    }

    pub fn to_document(&self) -> Document {
        let mut doc = Document::new()
            .with(FILES_ID, self.files_id)
            .with(N, self.n)
            .with(DATA, self.data.clone());
        if let Some(id) = &self.id {
            doc.insert(ID, id.clone());
        }
        doc
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::document::{Document, Value};
use crate::errors::InvalidRecord;

pub const ID: &str = "_id";
pub const LENGTH: &str = "length";
pub const CHUNK_SIZE: &str = "chunkSize";
pub const UPLOAD_DATE: &str = "uploadDate";
pub const CHECKSUM: &str = "md5";
pub const FILENAME: &str = "filename";
pub const CONTENT_TYPE: &str = "contentType";
pub const ALIASES: &str = "aliases";
pub const METADATA: &str = "metadata";

/// Metadata describing one stored file. Never updated once written.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub id: Uuid,
    pub length: i64,
    pub chunk_size: i32,
    pub upload_date: DateTime<Utc>,
    /// Hex encoded MD5 of the whole payload.
    pub checksum: String,
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub aliases: Vec<String>,
    pub metadata: Option<Value>,
}

impl FileRecord {
    /// Decode a files document. Fails if any of `_id`, `length`, `chunkSize`,
    /// `uploadDate` or `md5` is missing or has the wrong type; the optional
    /// fields are taken when well-typed and ignored otherwise.
    pub fn from_document(doc: &Document) -> Result<Self, InvalidRecord> {
        let id = doc.get_id(ID).ok_or(InvalidRecord::MissingField(ID))?;
        let length = doc
            .get_i64(LENGTH)
            .ok_or(InvalidRecord::MissingField(LENGTH))?;
        let chunk_size = doc
            .get_i32(CHUNK_SIZE)
            .ok_or(InvalidRecord::MissingField(CHUNK_SIZE))?;
        let upload_date = doc
            .get_datetime(UPLOAD_DATE)
            .ok_or(InvalidRecord::MissingField(UPLOAD_DATE))?;
        let checksum = doc
            .get_str(CHECKSUM)
            .ok_or(InvalidRecord::MissingField(CHECKSUM))?
            .to_string();

        let aliases = doc
            .get_array(ALIASES)
            .unwrap_or_default()
            .iter()
            .filter_map(|alias| match alias {
                Value::String(s) => Some(s.clone()),
                _ => None,
            })
            .collect();

        Ok(FileRecord {
            id,
            length,
            chunk_size,
            upload_date,
            checksum,
            filename: doc.get_str(FILENAME).map(str::to_string),
            content_type: doc.get_str(CONTENT_TYPE).map(str::to_string),
            aliases,
            metadata: doc.get(METADATA).cloned(),
        })
    }

    pub fn to_document(&self) -> Document {
        let mut doc = Document::new()
            .with(ID, self.id)
            .with(LENGTH, self.length)
            .with(CHUNK_SIZE, self.chunk_size)
            .with(UPLOAD_DATE, self.upload_date)
            .with(CHECKSUM, self.checksum.as_str());

        if let Some(filename) = &self.filename {
            doc.insert(FILENAME, filename.as_str());
        }
        if let Some(content_type) = &self.content_type {
            doc.insert(CONTENT_TYPE, content_type.as_str());
        }
        if !self.aliases.is_empty() {
            doc.insert(ALIASES, self.aliases.clone());
        }
        if let Some(metadata) = &self.metadata {
            doc.insert(METADATA, metadata.clone());
        }
        doc
    }

    /// Number of chunks a complete copy of this file consists of.
    pub fn chunk_count(&self) -> u64 {
        if self.length <= 0 || self.chunk_size <= 0 {
            return 0;
        }
        (self.length as u64).div_ceil(self.chunk_size as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> FileRecord {
        FileRecord {
            id: Uuid::new_v4(),
            length: 600_000,
            chunk_size: 255_000,
            upload_date: Utc::now(),
            checksum: "d41d8cd98f00b204e9800998ecf8427e".to_string(),
            filename: Some("a.txt".to_string()),
            content_type: None,
            aliases: vec!["b.txt".to_string()],
            metadata: Some(Value::Document(Document::new().with("owner", "alice"))),
        }
    }

    #[test]
    fn decodes_what_it_encodes() {
        let rec = record();
        assert_eq!(FileRecord::from_document(&rec.to_document()), Ok(rec));
    }

    #[test]
    fn required_fields_are_enforced() {
        for field in [ID, LENGTH, CHUNK_SIZE, UPLOAD_DATE, CHECKSUM] {
            let mut doc = record().to_document();
            doc.remove(field);
            assert_eq!(
                FileRecord::from_document(&doc),
                Err(InvalidRecord::MissingField(field)),
                "{} must be required",
                field
            );
        }
    }

    #[test]
    fn mistyped_required_field_is_missing() {
        let doc = record().to_document().with(CHUNK_SIZE, "big");
        assert_eq!(
            FileRecord::from_document(&doc),
            Err(InvalidRecord::MissingField(CHUNK_SIZE))
        );
    }

    #[test]
    fn int32_length_is_accepted() {
        let doc = record().to_document().with(LENGTH, 12i32);
        assert_eq!(FileRecord::from_document(&doc).map(|r| r.length), Ok(12));
    }

    #[test]
    fn non_string_aliases_are_dropped() {
        let doc = record()
            .to_document()
            .with(ALIASES, Value::Array(vec![Value::from("x"), Value::Int32(3)]));
        let rec = FileRecord::from_document(&doc).unwrap();
        assert_eq!(rec.aliases, vec!["x".to_string()]);
    }

    #[test]
    fn chunk_count_rounds_up() {
        assert_eq!(record().chunk_count(), 3);
        let empty = FileRecord {
            length: 0,
            ..record()
        };
        assert_eq!(empty.chunk_count(), 0);
    }
}

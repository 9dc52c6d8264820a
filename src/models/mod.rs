use uuid::Uuid;

use crate::document::Document;

pub mod file;
pub mod file_chunk;

pub use self::file::FileRecord;
pub use self::file_chunk::ChunkRecord;

/// Lookup criteria for file records. Every field that is set must match;
/// an empty filter matches all files.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileFilter {
    pub id: Option<Uuid>,
    pub checksum: Option<String>,
    pub filename: Option<String>,
}

impl FileFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn id(mut self, id: Uuid) -> Self {
        self.id = Some(id);
        self
    }

    pub fn checksum(mut self, checksum: impl Into<String>) -> Self {
        self.checksum = Some(checksum.into());
        self
    }

    pub fn filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    pub fn to_document(&self) -> Document {
        let mut filter = Document::new();
        if let Some(id) = self.id {
            filter.insert(file::ID, id);
        }
        if let Some(checksum) = &self.checksum {
            filter.insert(file::CHECKSUM, checksum.as_str());
        }
        if let Some(filename) = &self.filename {
            filter.insert(file::FILENAME, filename.as_str());
        }
        filter
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_filter_matches_everything() {
        assert!(FileFilter::all().to_document().is_empty());
    }

    #[test]
    fn filter_fields_are_combined() {
        let id = Uuid::new_v4();
        let doc = FileFilter::all()
            .id(id)
            .checksum("d41d8cd98f00b204e9800998ecf8427e")
            .filename("a.txt")
            .to_document();
        assert_eq!(doc.len(), 3);
        assert_eq!(doc.get_id("_id"), Some(id));
        assert_eq!(doc.get_str("md5"), Some("d41d8cd98f00b204e9800998ecf8427e"));
        assert_eq!(doc.get_str("filename"), Some("a.txt"));
    }
}

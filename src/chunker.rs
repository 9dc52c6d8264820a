//! Splitting payloads into fixed size chunks.

use bytes::Bytes;

use crate::errors::{Error, Result};

/// Chunk size used when none is given.
pub const DEFAULT_CHUNK_SIZE: usize = 255_000;

/// Upper bound on a chunk's payload, chosen to keep a whole chunk document
/// below the 16 MiB document size limit of common document stores.
pub const MAX_CHUNK_SIZE: usize = 15 * 1024 * 1024;

pub fn validate_chunk_size(chunk_size: usize) -> Result<()> {
    if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
        return Err(Error::InvalidChunkSize {
            chunk_size,
            max: MAX_CHUNK_SIZE,
        });
    }
    Ok(())
}

/// Split `payload` into consecutive slices of `chunk_size` bytes; only the
/// last one may be shorter. An empty payload yields no chunks.
///
/// The slices share `payload`'s buffer.
pub fn split(payload: &Bytes, chunk_size: usize) -> Result<Vec<Bytes>> {
    validate_chunk_size(chunk_size)?;

    let mut chunks = Vec::with_capacity(payload.len().div_ceil(chunk_size));
    let mut offset = 0;
    while offset < payload.len() {
        let end = (offset + chunk_size).min(payload.len());
        chunks.push(payload.slice(offset..end));
        offset = end;
    }
    Ok(chunks)
}

/// Hex encoded MD5 of the whole payload.
pub fn checksum(payload: &[u8]) -> String {
    format!("{:x}", md5::compute(payload))
}

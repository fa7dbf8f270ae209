//! Byte format of stored snapshots.

use super::{StoreError, StoredSnapshot};

/// Leading byte of every encoded snapshot. Version 2 added right origins
/// to blocks and previous-operation links to buffered operations.
pub const FORMAT_VERSION: u8 = 2;

pub fn encode_snapshot(stored: &StoredSnapshot) -> Result<Vec<u8>, StoreError> {
    let raw = bincode::serde::encode_to_vec(stored, bincode::config::standard())
        .map_err(|e| StoreError::Codec(e.to_string()))?;
    let compressed = lz4_flex::compress_prepend_size(&raw);

    let mut bytes = Vec::with_capacity(compressed.len() + 1);
    bytes.push(FORMAT_VERSION);
    bytes.extend_from_slice(&compressed);
    Ok(bytes)
}

pub fn decode_snapshot(bytes: &[u8]) -> Result<StoredSnapshot, StoreError> {
    let (&version, body) = bytes
        .split_first()
        .ok_or_else(|| StoreError::Codec("empty snapshot".into()))?;
    if version != FORMAT_VERSION {
        return Err(StoreError::UnsupportedVersion(version));
    }
    let raw = lz4_flex::decompress_size_prepended(body)
        .map_err(|e| StoreError::Codec(e.to_string()))?;
    let (stored, _) = bincode::serde::decode_from_slice(&raw, bincode::config::standard())
        .map_err(|e| StoreError::Codec(e.to_string()))?;
    Ok(stored)
}

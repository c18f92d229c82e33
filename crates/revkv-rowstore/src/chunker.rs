//! Value chunking for size-limited rows
//!
//! Splits values larger than a row into ordered chunks and reassembles them,
//! verifying the result against a manifest recorded at encode time.

use crate::{Result, RowStoreError, DEFAULT_MAX_ROW_SIZE, MAX_ROW_SIZE_LIMIT};
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Length of the hex encoded value checksum in a manifest
pub const CHECKSUM_HEX_LEN: usize = blake3::OUT_LEN * 2;

/// Configuration for the chunker
#[derive(Clone, Debug)]
pub struct ChunkerConfig {
    /// Largest payload of a single chunk in bytes
    pub max_row_size: usize,
    /// Whether to verify the BLAKE3 digest on reassembly
    pub verify_checksum: bool,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            max_row_size: DEFAULT_MAX_ROW_SIZE,
            verify_checksum: true,
        }
    }
}

impl ChunkerConfig {
    /// Create with a custom row size
    pub fn with_max_row_size(max_row_size: usize) -> Result<Self> {
        if max_row_size == 0 || max_row_size > MAX_ROW_SIZE_LIMIT {
            return Err(RowStoreError::Configuration(format!(
                "max row size must be between 1 and {} bytes",
                MAX_ROW_SIZE_LIMIT
            )));
        }
        Ok(Self {
            max_row_size,
            ..Default::default()
        })
    }
}

/// Description of an encoded value, persisted alongside the record header
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkManifest {
    /// Number of chunk rows
    pub chunk_count: usize,
    /// Total size of the original value
    pub total_size: u64,
    /// BLAKE3 digest of the original value (hex)
    pub checksum: String,
}

/// Result of encoding a value
#[derive(Clone, Debug)]
pub struct EncodedValue {
    /// The chunk payloads, in order
    pub chunks: Vec<Bytes>,
    /// Manifest describing the chunks
    pub manifest: ChunkManifest,
}

/// Chunker for splitting values into row-sized chunks
#[derive(Clone, Debug, Default)]
pub struct Chunker {
    config: ChunkerConfig,
}

impl Chunker {
    /// Create a new chunker with default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Create with custom configuration
    pub fn with_config(config: ChunkerConfig) -> Self {
        Self { config }
    }

    /// Split a value into chunks
    ///
    /// The empty value still produces exactly one (empty) chunk, and a value
    /// whose length is a multiple of the row size has no trailing empty chunk.
    pub fn encode(&self, value: &Bytes) -> EncodedValue {
        let size = self.config.max_row_size;
        let count = calculate_chunk_count(value.len() as u64, size);

        let mut chunks = Vec::with_capacity(count);
        let mut hasher = blake3::Hasher::new();
        if value.is_empty() {
            chunks.push(Bytes::new());
        } else {
            let mut offset = 0;
            while offset < value.len() {
                let end = usize::min(offset + size, value.len());
                let chunk = value.slice(offset..end);
                hasher.update(&chunk);
                chunks.push(chunk);
                offset = end;
            }
        }

        EncodedValue {
            manifest: ChunkManifest {
                chunk_count: chunks.len(),
                total_size: value.len() as u64,
                checksum: hasher.finalize().to_hex().to_string(),
            },
            chunks,
        }
    }

    /// Concatenate chunks in order
    pub fn reassemble(&self, chunks: &[Bytes]) -> Bytes {
        if chunks.len() == 1 {
            return chunks[0].clone();
        }
        let total_size: usize = chunks.iter().map(|c| c.len()).sum();
        let mut result = BytesMut::with_capacity(total_size);
        for chunk in chunks {
            result.extend_from_slice(chunk);
        }
        result.freeze()
    }

    /// Reassemble chunks and check them against the manifest
    pub fn decode(&self, chunks: &[Bytes], manifest: &ChunkManifest) -> Result<Bytes> {
        if chunks.len() != manifest.chunk_count {
            return Err(RowStoreError::ChunkMismatch(format!(
                "expected {} chunks, found {}",
                manifest.chunk_count,
                chunks.len()
            )));
        }
        if let Some((index, chunk)) = chunks
            .iter()
            .enumerate()
            .find(|(_, c)| c.len() > self.config.max_row_size)
        {
            return Err(RowStoreError::ChunkMismatch(format!(
                "chunk {} holds {} bytes, above the {} byte row size",
                index,
                chunk.len(),
                self.config.max_row_size
            )));
        }

        let value = self.reassemble(chunks);
        if value.len() as u64 != manifest.total_size {
            return Err(RowStoreError::ChunkMismatch(format!(
                "expected {} bytes, reassembled {}",
                manifest.total_size,
                value.len()
            )));
        }

        if self.config.verify_checksum {
            let actual = blake3::hash(&value).to_hex().to_string();
            if actual != manifest.checksum {
                return Err(RowStoreError::HashMismatch {
                    expected: manifest.checksum.clone(),
                    actual,
                });
            }
        }
        Ok(value)
    }

    /// Get the configured row size
    pub fn max_row_size(&self) -> usize {
        self.config.max_row_size
    }
}

/// Calculate how many chunks a value of `size` bytes needs
pub fn calculate_chunk_count(size: u64, max_row_size: usize) -> usize {
    if size == 0 {
        return 1;
    }
    (size as usize).div_ceil(max_row_size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    fn chunker(size: usize) -> Chunker {
        Chunker::with_config(ChunkerConfig::with_max_row_size(size).unwrap())
    }

    fn pattern(len: usize) -> Bytes {
        Bytes::from((0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>())
    }

    #[rstest]
    #[case(0, 1)]
    #[case(1, 1)]
    #[case(4, 1)]
    #[case(5, 2)]
    #[case(8, 2)]
    #[case(12, 3)]
    #[case(13, 4)]
    fn test_chunk_boundaries(#[case] len: usize, #[case] expected_chunks: usize) {
        let chunker = chunker(4);
        let encoded = chunker.encode(&pattern(len));

        assert_eq!(encoded.chunks.len(), expected_chunks);
        assert_eq!(encoded.manifest.chunk_count, expected_chunks);
        assert_eq!(encoded.manifest.total_size, len as u64);

        // Every chunk but the last is full
        for chunk in &encoded.chunks[..expected_chunks - 1] {
            assert_eq!(chunk.len(), 4);
        }
        assert_eq!(
            encoded.chunks.last().unwrap().len(),
            len - 4 * (expected_chunks - 1)
        );
    }

    #[test]
    fn test_exact_multiple_has_no_trailing_chunk() {
        let chunker = chunker(1024);
        let value = pattern(3 * 1024);
        let encoded = chunker.encode(&value);

        assert_eq!(encoded.chunks.len(), 3);
        assert!(encoded.chunks.iter().all(|c| c.len() == 1024));
        assert_eq!(chunker.decode(&encoded.chunks, &encoded.manifest).unwrap(), value);
    }

    #[test]
    fn test_empty_value_roundtrip() {
        let chunker = Chunker::new();
        let encoded = chunker.encode(&Bytes::new());

        assert_eq!(encoded.chunks.len(), 1);
        assert!(encoded.chunks[0].is_empty());
        let decoded = chunker.decode(&encoded.chunks, &encoded.manifest).unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn test_missing_chunk_detected() {
        let chunker = chunker(4);
        let encoded = chunker.encode(&pattern(10));

        let err = chunker
            .decode(&encoded.chunks[..2], &encoded.manifest)
            .unwrap_err();
        assert!(matches!(err, RowStoreError::ChunkMismatch(_)));
    }

    #[test]
    fn test_reordered_chunks_detected() {
        let chunker = chunker(4);
        let encoded = chunker.encode(&pattern(12));

        let mut swapped = encoded.chunks.clone();
        swapped.swap(0, 1);
        let err = chunker.decode(&swapped, &encoded.manifest).unwrap_err();
        assert!(matches!(err, RowStoreError::HashMismatch { .. }));
    }

    #[test]
    fn test_invalid_row_size() {
        assert!(ChunkerConfig::with_max_row_size(0).is_err());
        assert!(ChunkerConfig::with_max_row_size(MAX_ROW_SIZE_LIMIT + 1).is_err());
        assert!(ChunkerConfig::with_max_row_size(MAX_ROW_SIZE_LIMIT).is_ok());
    }

    #[test]
    fn test_calculate_chunk_count() {
        assert_eq!(calculate_chunk_count(0, 256), 1);
        assert_eq!(calculate_chunk_count(100, 256), 1);
        assert_eq!(calculate_chunk_count(256, 256), 1);
        assert_eq!(calculate_chunk_count(257, 256), 2);
        assert_eq!(calculate_chunk_count(1024, 256), 4);
    }

    proptest! {
        #[test]
        fn prop_decode_inverts_encode(
            value in proptest::collection::vec(any::<u8>(), 0..2048),
            size in 1usize..300,
        ) {
            let chunker = chunker(size);
            let value = Bytes::from(value);
            let encoded = chunker.encode(&value);

            prop_assert_eq!(
                encoded.chunks.len(),
                calculate_chunk_count(value.len() as u64, size)
            );
            let decoded = chunker.decode(&encoded.chunks, &encoded.manifest).unwrap();
            prop_assert_eq!(decoded, value);
        }
    }
}

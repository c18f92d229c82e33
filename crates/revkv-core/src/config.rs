//! Backend configuration

use crate::error::{KvError, Result};
use crate::store::max_header_len;
use revkv_rowstore::{ChunkerConfig, DEFAULT_MAX_ROW_SIZE, MAX_ROW_SIZE_LIMIT};
use serde::{Deserialize, Serialize};

/// Backend configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Largest value slice stored in a single chunk row
    pub max_row_size: usize,
    /// Verify the BLAKE3 digest of every value read
    pub verify_checksums: bool,
    /// Conditional-write attempts before the revision counter gives up
    pub allocator_max_attempts: usize,
    /// Events buffered per subscriber of the broadcast sink
    pub event_channel_capacity: usize,
    /// Number of per-key write lock stripes
    pub lock_stripes: usize,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            max_row_size: DEFAULT_MAX_ROW_SIZE,
            verify_checksums: true,
            allocator_max_attempts: 64,
            event_channel_capacity: 1024,
            lock_stripes: 256,
        }
    }
}

impl BackendConfig {
    /// Set the chunk row size
    pub fn with_max_row_size(mut self, max_row_size: usize) -> Self {
        self.max_row_size = max_row_size;
        self
    }

    /// Set the allocator attempt limit
    pub fn with_allocator_max_attempts(mut self, attempts: usize) -> Self {
        self.allocator_max_attempts = attempts;
        self
    }

    /// Set the broadcast buffer size
    pub fn with_event_channel_capacity(mut self, capacity: usize) -> Self {
        self.event_channel_capacity = capacity;
        self
    }

    /// Check the configuration against the medium's row ceiling
    pub fn validate(&self, medium_max_row_size: usize) -> Result<()> {
        if self.max_row_size == 0 || self.max_row_size > MAX_ROW_SIZE_LIMIT {
            return Err(KvError::Configuration(format!(
                "max_row_size must be between 1 and {} bytes",
                MAX_ROW_SIZE_LIMIT
            )));
        }
        if self.max_row_size > medium_max_row_size {
            return Err(KvError::Configuration(format!(
                "max_row_size {} exceeds the storage medium limit of {} bytes",
                self.max_row_size, medium_max_row_size
            )));
        }
        let header_len = max_header_len()?;
        if header_len > medium_max_row_size {
            return Err(KvError::Configuration(format!(
                "storage medium rows of {} bytes cannot hold a record header of up to {} bytes",
                medium_max_row_size, header_len
            )));
        }
        if self.allocator_max_attempts == 0 {
            return Err(KvError::Configuration(
                "allocator_max_attempts must be at least 1".to_string(),
            ));
        }
        if self.lock_stripes == 0 {
            return Err(KvError::Configuration(
                "lock_stripes must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Chunker settings derived from this configuration
    pub fn chunker_config(&self) -> Result<ChunkerConfig> {
        let mut config = ChunkerConfig::with_max_row_size(self.max_row_size)
            .map_err(|e| KvError::Configuration(e.to_string()))?;
        config.verify_checksum = self.verify_checksums;
        Ok(config)
    }
}

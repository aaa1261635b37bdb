//! Tunables of the proxy layer.
//!
//! [`ProxyConfig`] gathers the values that control chunking, connection
//! reuse and reply policy. Every field has a default matching the engine's
//! own defaults; setters follow the builder style and validation happens in
//! [`ProxyConfig::validate`].

use std::num::NonZeroUsize;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Messages whose encoded size is below this many bytes are never chunked.
pub const DEFAULT_CHUNKING_THRESHOLD: usize = 1_024_000;
/// Reset clones a parent keeps for reuse.
pub const DEFAULT_MAX_CACHED_CLONES: usize = 2;
/// Byte budget the peer may read ahead for a consumer.
pub const DEFAULT_READ_AHEAD_HIGH_QUEUE_BYTES: i32 = 574;
/// Largest slice produced by the default message codec.
pub const DEFAULT_MAX_SLICE_SIZE: usize = 64 * 1024;

/// Rejected configuration values.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A zero chunking threshold would chunk every message.
    #[error("chunking threshold must be positive")]
    ZeroChunkingThreshold,
    /// A zero slice size cannot make progress.
    #[error("maximum slice size must be positive")]
    ZeroSliceSize,
    /// The read-ahead budget must be positive.
    #[error("read-ahead high queue bytes must be positive, got {0}")]
    InvalidHighQueueBytes(i32),
}

/// Configuration shared by a connection and everything it creates.
///
/// # Examples
///
/// ```
/// use wireproxy::config::ProxyConfig;
///
/// let config = ProxyConfig::default()
///     .max_cached_clones(4)
///     .exchange_express_sends(true);
/// assert_eq!(config.max_cached_clones_value(), 4);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    chunking_threshold: usize,
    max_cached_clones: usize,
    exchange_transacted_sends: bool,
    exchange_express_sends: bool,
    read_ahead_high_queue_bytes: i32,
    strict_redelivery_ordering: bool,
    max_slice_size: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            chunking_threshold: DEFAULT_CHUNKING_THRESHOLD,
            max_cached_clones: DEFAULT_MAX_CACHED_CLONES,
            exchange_transacted_sends: false,
            exchange_express_sends: false,
            read_ahead_high_queue_bytes: DEFAULT_READ_AHEAD_HIGH_QUEUE_BYTES,
            strict_redelivery_ordering: false,
            max_slice_size: DEFAULT_MAX_SLICE_SIZE,
        }
    }
}

impl ProxyConfig {
    /// Set the encoded size from which messages are chunked.
    #[must_use]
    pub fn chunking_threshold(mut self, bytes: usize) -> Self {
        self.chunking_threshold = bytes;
        self
    }

    /// Set how many reset clones a parent connection keeps.
    ///
    /// Zero disables clone reuse.
    #[must_use]
    pub fn max_cached_clones(mut self, count: usize) -> Self {
        self.max_cached_clones = count;
        self
    }

    /// Force a reply for every transacted send.
    #[must_use]
    pub fn exchange_transacted_sends(mut self, enabled: bool) -> Self {
        self.exchange_transacted_sends = enabled;
        self
    }

    /// Force a reply for every non-transacted send.
    #[must_use]
    pub fn exchange_express_sends(mut self, enabled: bool) -> Self {
        self.exchange_express_sends = enabled;
        self
    }

    /// Set the read-ahead byte budget sent on consumer creation.
    #[must_use]
    pub fn read_ahead_high_queue_bytes(mut self, bytes: i32) -> Self {
        self.read_ahead_high_queue_bytes = bytes;
        self
    }

    /// Purge read-ahead messages on every local rollback.
    #[must_use]
    pub fn strict_redelivery_ordering(mut self, enabled: bool) -> Self {
        self.strict_redelivery_ordering = enabled;
        self
    }

    /// Set the largest slice the default message codec produces.
    #[must_use]
    pub fn max_slice_size(mut self, bytes: usize) -> Self {
        self.max_slice_size = bytes;
        self
    }

    #[must_use]
    pub const fn chunking_threshold_value(&self) -> usize { self.chunking_threshold }

    #[must_use]
    pub const fn max_cached_clones_value(&self) -> usize { self.max_cached_clones }

    #[must_use]
    pub const fn exchange_transacted_sends_value(&self) -> bool { self.exchange_transacted_sends }

    #[must_use]
    pub const fn exchange_express_sends_value(&self) -> bool { self.exchange_express_sends }

    #[must_use]
    pub const fn read_ahead_high_queue_bytes_value(&self) -> i32 {
        self.read_ahead_high_queue_bytes
    }

    #[must_use]
    pub const fn strict_redelivery_ordering_value(&self) -> bool { self.strict_redelivery_ordering }

    /// Slice size as a non-zero value, if valid.
    #[must_use]
    pub fn max_slice_size_value(&self) -> Option<NonZeroUsize> {
        NonZeroUsize::new(self.max_slice_size)
    }

    /// Check the configuration for unusable values.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunking_threshold == 0 {
            return Err(ConfigError::ZeroChunkingThreshold);
        }
        if self.max_slice_size == 0 {
            return Err(ConfigError::ZeroSliceSize);
        }
        if self.read_ahead_high_queue_bytes <= 0 {
            return Err(ConfigError::InvalidHighQueueBytes(self.read_ahead_high_queue_bytes));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn defaults_match_engine_defaults() {
        let config = ProxyConfig::default();
        assert_eq!(config.chunking_threshold_value(), 1_024_000);
        assert_eq!(config.max_cached_clones_value(), 2);
        assert_eq!(config.read_ahead_high_queue_bytes_value(), 574);
        assert!(!config.exchange_transacted_sends_value());
        assert!(!config.exchange_express_sends_value());
        assert!(!config.strict_redelivery_ordering_value());
    }

    #[rstest]
    #[case(ProxyConfig::default().chunking_threshold(0), ConfigError::ZeroChunkingThreshold)]
    #[case(ProxyConfig::default().max_slice_size(0), ConfigError::ZeroSliceSize)]
    #[case(
        ProxyConfig::default().read_ahead_high_queue_bytes(-3),
        ConfigError::InvalidHighQueueBytes(-3)
    )]
    fn invalid_values_are_rejected(#[case] config: ProxyConfig, #[case] expected: ConfigError) {
        assert_eq!(config.validate(), Err(expected));
    }
}

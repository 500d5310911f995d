//! Idempotency filter.
//!
//! Deduplicates redelivered messages by an extracted key within a TTL
//! window. State is a bounded in-process map: exactness is bounded by the
//! TTL and the capacity, which is the documented trade-off for requiring no
//! external store. Callers needing cross-restart idempotency plug an
//! external store behind the same decision point upstream.

use crate::config::DedupConfig;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, warn};
use weir_core::Message;

/// Header consulted by the default key extractor.
pub const IDEMPOTENCY_HEADER: &str = "idempotency-key";

/// Extracts the deduplication key from a message.
///
/// Returning `None` exempts the message from filtering.
pub type KeyExtractor = Arc<dyn Fn(&Message) -> Option<String> + Send + Sync>;

/// Default extractor: the `idempotency-key` header, falling back to the
/// message key.
#[must_use]
pub fn default_key_extractor() -> KeyExtractor {
    Arc::new(|message| {
        message
            .header(IDEMPOTENCY_HEADER)
            .map(str::to_owned)
            .or_else(|| message.key.clone())
    })
}

/// TTL-bounded duplicate filter over extracted idempotency keys.
pub struct IdempotencyFilter {
    entries: DashMap<String, Instant>,
    extractor: KeyExtractor,
    ttl: std::time::Duration,
    capacity: usize,
    enabled: bool,
}

impl std::fmt::Debug for IdempotencyFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdempotencyFilter")
            .field("entries", &self.entries.len())
            .field("ttl", &self.ttl)
            .field("capacity", &self.capacity)
            .field("enabled", &self.enabled)
            .finish()
    }
}

impl IdempotencyFilter {
    /// Create a filter from configuration with the given key extractor.
    #[must_use]
    pub fn new(config: &DedupConfig, extractor: KeyExtractor) -> Self {
        Self {
            entries: DashMap::with_capacity(config.capacity.min(4096)),
            extractor,
            ttl: config.ttl,
            capacity: config.capacity,
            enabled: config.enabled,
        }
    }

    /// Decide whether a message should be processed.
    ///
    /// Returns `false` for a duplicate: the key was seen within the TTL
    /// window and the message must be acknowledged without invoking user
    /// logic. Returns `true` otherwise, recording the key.
    pub fn should_process(&self, message: &Message) -> bool {
        if !self.enabled {
            return true;
        }
        let Some(key) = (self.extractor)(message) else {
            return true;
        };
        let now = Instant::now();

        if let Some(expires_at) = self.entries.get(&key) {
            if *expires_at > now {
                debug!(%key, partition = %message.partition, offset = %message.offset, "duplicate absorbed");
                return false;
            }
        }

        // New or expired key. The capacity bound only matters for new keys;
        // sweep first, and if the map is still full let the message through
        // untracked rather than block the pipeline.
        if !self.entries.contains_key(&key) && self.entries.len() >= self.capacity {
            self.sweep();
            if self.entries.len() >= self.capacity {
                warn!(
                    capacity = self.capacity,
                    "idempotency map full after sweep; message passes unfiltered"
                );
                return true;
            }
        }

        self.entries.insert(key, now + self.ttl);
        true
    }

    /// Remove entries past their TTL. Returns the number removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, expires_at| *expires_at > now);
        let removed = before - self.entries.len();
        if removed > 0 {
            debug!(removed, remaining = self.entries.len(), "idempotency sweep");
        }
        removed
    }

    /// Number of currently tracked keys.
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DedupConfig;
    use bytes::Bytes;
    use std::time::Duration;
    use weir_core::{Offset, PartitionId};

    fn message(key: &str, offset: u64) -> Message {
        Message::builder()
            .partition(PartitionId::new(0))
            .offset(Offset::new(offset))
            .key(key)
            .payload(Bytes::from("payload"))
            .build()
            .unwrap()
    }

    fn filter(ttl: Duration, capacity: usize) -> IdempotencyFilter {
        let config = DedupConfig {
            enabled: true,
            ttl,
            capacity,
            sweep_interval: Duration::from_secs(30),
        };
        IdempotencyFilter::new(&config, default_key_extractor())
    }

    #[tokio::test]
    async fn test_first_sight_processes_duplicate_filtered() {
        let filter = filter(Duration::from_secs(60), 100);

        assert!(filter.should_process(&message("a", 0)));
        assert!(!filter.should_process(&message("a", 1)));
        assert!(!filter.should_process(&message("a", 2)));
        assert!(filter.should_process(&message("b", 3)));
    }

    #[tokio::test]
    async fn test_header_takes_precedence_over_key() {
        let filter = filter(Duration::from_secs(60), 100);

        let with_header = |key: &str, header: &str, offset: u64| {
            Message::builder()
                .partition(PartitionId::new(0))
                .offset(Offset::new(offset))
                .key(key)
                .header(IDEMPOTENCY_HEADER, header)
                .payload(Bytes::from("payload"))
                .build()
                .unwrap()
        };

        assert!(filter.should_process(&with_header("k1", "h1", 0)));
        // Same header, different key: still a duplicate.
        assert!(!filter.should_process(&with_header("k2", "h1", 1)));
        // Different header, same key: not a duplicate.
        assert!(filter.should_process(&with_header("k1", "h2", 2)));
    }

    #[tokio::test]
    async fn test_keyless_messages_always_process() {
        let filter = filter(Duration::from_secs(60), 100);
        let keyless = Message::new(PartitionId::new(0), Offset::new(0), Bytes::from("x"));

        assert!(filter.should_process(&keyless));
        assert!(filter.should_process(&keyless));
        assert_eq!(filter.tracked(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_processes_again() {
        let filter = filter(Duration::from_secs(10), 100);

        assert!(filter.should_process(&message("a", 0)));
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(filter.should_process(&message("a", 1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_removes_expired() {
        let filter = filter(Duration::from_secs(10), 100);
        filter.should_process(&message("a", 0));
        filter.should_process(&message("b", 1));
        assert_eq!(filter.tracked(), 2);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(filter.sweep(), 2);
        assert_eq!(filter.tracked(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_map_passes_through_after_failed_sweep() {
        let filter = filter(Duration::from_secs(60), 2);
        filter.should_process(&message("a", 0));
        filter.should_process(&message("b", 1));

        // Map is full of live entries: new key passes through untracked.
        assert!(filter.should_process(&message("c", 2)));
        assert_eq!(filter.tracked(), 2);
        // Known duplicates are still caught.
        assert!(!filter.should_process(&message("a", 3)));

        // Once entries expire, the sweep frees room and tracking resumes.
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(filter.should_process(&message("c", 4)));
        assert!(!filter.should_process(&message("c", 5)));
    }

    #[tokio::test]
    async fn test_disabled_filter_passes_everything() {
        let config = DedupConfig { enabled: false, ..DedupConfig::default() };
        let filter = IdempotencyFilter::new(&config, default_key_extractor());

        assert!(filter.should_process(&message("a", 0)));
        assert!(filter.should_process(&message("a", 1)));
    }
}

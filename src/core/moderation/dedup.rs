// Message de-duplication for re-entrant deliveries.
//
// An id is "in flight" while a pipeline run holds its guard, and "processed"
// for `ttl` after the run finished. Either state rejects a second run.

use chrono::{DateTime, Duration, Utc};
use dashmap::{DashMap, DashSet};

pub const DEFAULT_DEDUP_TTL_SECS: i64 = 60;

pub struct MessageDeduplicator {
    in_flight: DashSet<u64>,
    processed: DashMap<u64, DateTime<Utc>>,
    ttl: Duration,
}

/// Marks a message as processed when dropped, whatever way the run ended.
pub struct DedupGuard<'a> {
    owner: &'a MessageDeduplicator,
    message_id: u64,
}

impl Drop for DedupGuard<'_> {
    fn drop(&mut self) {
        // Processed first, so the id is never in neither set.
        self.owner.processed.insert(self.message_id, Utc::now());
        self.owner.in_flight.remove(&self.message_id);
    }
}

impl MessageDeduplicator {
    pub fn new(ttl: Duration) -> Self {
        Self {
            in_flight: DashSet::new(),
            processed: DashMap::new(),
            ttl,
        }
    }

    /// Claim `message_id` for one pipeline run. `None` if it is already
    /// running or finished within the TTL.
    pub fn try_begin(&self, message_id: u64, now: DateTime<Utc>) -> Option<DedupGuard<'_>> {
        if !self.in_flight.insert(message_id) {
            return None;
        }

        let recently_processed = self
            .processed
            .get(&message_id)
            .is_some_and(|done_at| now - *done_at < self.ttl);
        if recently_processed {
            self.in_flight.remove(&message_id);
            return None;
        }

        Some(DedupGuard {
            owner: self,
            message_id,
        })
    }

    pub fn is_in_flight(&self, message_id: u64) -> bool {
        self.in_flight.contains(&message_id)
    }

    /// Forget processed ids older than the TTL.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let before = self.processed.len();
        let ttl = self.ttl;
        self.processed.retain(|_, done_at| now - *done_at < ttl);
        before - self.processed.len()
    }

    pub fn processed_len(&self) -> usize {
        self.processed.len()
    }
}

impl Default for MessageDeduplicator {
    fn default() -> Self {
        Self::new(Duration::seconds(DEFAULT_DEDUP_TTL_SECS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_delivery_is_rejected() {
        let dedup = MessageDeduplicator::default();
        let now = Utc::now();

        let guard = dedup.try_begin(1, now).expect("first delivery runs");
        assert!(dedup.is_in_flight(1));
        assert!(dedup.try_begin(1, now).is_none(), "in flight");
        drop(guard);

        assert!(!dedup.is_in_flight(1));
        assert!(dedup.try_begin(1, Utc::now()).is_none(), "recently processed");
        assert!(dedup.try_begin(2, now).is_some());
    }

    #[test]
    fn test_processed_ids_expire() {
        let dedup = MessageDeduplicator::new(Duration::seconds(60));
        drop(dedup.try_begin(1, Utc::now()));

        let later = Utc::now() + Duration::seconds(61);
        assert!(dedup.try_begin(1, later).is_some());
    }

    #[test]
    fn test_sweep() {
        let dedup = MessageDeduplicator::new(Duration::seconds(60));
        drop(dedup.try_begin(1, Utc::now()));
        drop(dedup.try_begin(2, Utc::now()));
        assert_eq!(dedup.processed_len(), 2);

        assert_eq!(dedup.sweep(Utc::now()), 0);
        assert_eq!(dedup.sweep(Utc::now() + Duration::seconds(120)), 2);
        assert_eq!(dedup.processed_len(), 0);
    }
}

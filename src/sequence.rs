//! Highest message id observed on the subscription.

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic cell that only ever moves forward.
///
/// Written from subscription callbacks, read by the recovery procedure.
#[derive(Debug, Default)]
pub struct LatestMessageId(AtomicU64);

impl LatestMessageId {
    pub fn new(initial: u64) -> Self {
        Self(AtomicU64::new(initial))
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    /// Record a delivered id. Returns the value held afterwards.
    pub fn observe(&self, id: u64) -> u64 {
        self.0.fetch_max(id, Ordering::AcqRel).max(id)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_observe_never_regresses() {
        let latest = LatestMessageId::default();
        let mut previous = latest.get();
        for id in [3, 9, 4, 9, 12, 1, 0, 15] {
            let now = latest.observe(id);
            assert!(now >= previous, "{now} < {previous} after id {id}");
            previous = now;
        }
        assert_eq!(latest.get(), 15);
    }

    #[test]
    fn test_observe_returns_current_max() {
        let latest = LatestMessageId::new(10);
        assert_eq!(latest.observe(5), 10);
        assert_eq!(latest.observe(11), 11);
    }

    #[test]
    fn test_concurrent_observers_keep_maximum() {
        let latest = Arc::new(LatestMessageId::default());
        let threads: Vec<_> = (0..8u64)
            .map(|t| {
                let latest = latest.clone();
                std::thread::spawn(move || {
                    for i in 0..1_000u64 {
                        latest.observe(t * 1_000 + i);
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
        assert_eq!(latest.get(), 7_999);
    }
}

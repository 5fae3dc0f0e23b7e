//! Process-scoped sequence generators
//!
//! Stream ids, authentication nonces, and client order ids must never repeat
//! for the lifetime of the process, even across reconnects and across several
//! clients. [`Sequences`] bundles the three generators so they can be shared
//! explicitly; [`Sequences::process`] returns the process-wide instance.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

/// Client-local identifier returned by subscribe calls
///
/// Always negative, so it can never be confused with a server channel id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(i64);

impl StreamId {
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stream id, nonce, and client order id generators
#[derive(Debug)]
pub struct Sequences {
    stream_id: AtomicI64,
    nonce: AtomicU64,
    client_order_id: AtomicU64,
}

impl Default for Sequences {
    fn default() -> Self {
        Self::new()
    }
}

impl Sequences {
    pub fn new() -> Self {
        Self {
            stream_id: AtomicI64::new(0),
            nonce: AtomicU64::new(0),
            client_order_id: AtomicU64::new(0),
        }
    }

    /// The instance shared by every client in this process
    pub fn process() -> Arc<Sequences> {
        static PROCESS: OnceLock<Arc<Sequences>> = OnceLock::new();
        PROCESS.get_or_init(|| Arc::new(Sequences::new())).clone()
    }

    /// Next stream id: -1, -2, -3, ...
    pub fn next_stream_id(&self) -> StreamId {
        StreamId(self.stream_id.fetch_sub(1, Ordering::SeqCst) - 1)
    }

    /// Next authentication nonce in wall-clock microseconds, strictly increasing
    pub fn next_nonce(&self) -> u64 {
        next_after_clock(&self.nonce, now_micros())
    }

    /// Next client order id in wall-clock milliseconds, strictly increasing
    pub fn next_client_order_id(&self) -> u64 {
        next_after_clock(&self.client_order_id, now_micros() / 1_000)
    }
}

fn next_after_clock(counter: &AtomicU64, now: u64) -> u64 {
    let previous = counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
            Some(now.max(last + 1))
        })
        .unwrap_or_else(|last| last);
    now.max(previous + 1)
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_stream_ids_are_negative_and_decreasing() {
        let seq = Sequences::new();
        assert_eq!(seq.next_stream_id(), StreamId::new(-1));
        assert_eq!(seq.next_stream_id(), StreamId::new(-2));
        assert_eq!(seq.next_stream_id(), StreamId::new(-3));
    }

    #[test]
    fn test_nonce_strictly_increasing() {
        let seq = Sequences::new();
        let mut last = 0;
        for _ in 0..1000 {
            let nonce = seq.next_nonce();
            assert!(nonce > last);
            last = nonce;
        }
    }

    #[test]
    fn test_nonce_tracks_wall_clock() {
        let seq = Sequences::new();
        let before = now_micros();
        let nonce = seq.next_nonce();
        assert!(nonce >= before);
    }

    #[test]
    fn test_client_order_ids_unique() {
        let seq = Sequences::new();
        let ids: HashSet<u64> = (0..500).map(|_| seq.next_client_order_id()).collect();
        assert_eq!(ids.len(), 500);
    }

    #[test]
    fn test_next_after_clock_never_goes_backwards() {
        let counter = AtomicU64::new(100);
        assert_eq!(next_after_clock(&counter, 50), 101);
        assert_eq!(next_after_clock(&counter, 500), 500);
        assert_eq!(next_after_clock(&counter, 10), 501);
    }

    #[test]
    fn test_stream_ids_unique_across_threads() {
        let seq = Arc::new(Sequences::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let seq = seq.clone();
                std::thread::spawn(move || {
                    (0..250).map(|_| seq.next_stream_id()).collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(id.value() < 0);
                assert!(all.insert(id));
            }
        }
        assert_eq!(all.len(), 1000);
    }

    #[test]
    fn test_process_instance_is_shared() {
        let a = Sequences::process();
        let b = Sequences::process();
        assert!(Arc::ptr_eq(&a, &b));
    }
}

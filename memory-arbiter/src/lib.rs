// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! Reservation-counted admission control for pipeline workers.
//!
//! Deliberately decoupled from actual RSS: the arbiter tracks promised
//! bytes, not observed ones, so allocator and page-cache lag cannot cause
//! over-admission.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Safety margin kept free below the configured ceiling.
pub const MIN_FREE_BYTES: i64 = 1024 * 1024 * 1024;

const BASE_MONTH_BYTES: i64 = 500 * 1024 * 1024;

/// Point-in-time reservation snapshot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArbiterStats {
    pub reserved: i64,
    pub max_bytes: i64,
    pub available: i64,
}

/// Token-counted memory arbiter, safe under concurrent reserve/release.
pub struct MemoryArbiter {
    max_bytes: i64,
    min_free_bytes: i64,
    reserved: AtomicI64,
    waiters: Mutex<VecDeque<oneshot::Sender<()>>>,
}

impl MemoryArbiter {
    pub fn new(max_bytes: i64) -> Self {
        Self::with_min_free(max_bytes, MIN_FREE_BYTES)
    }

    pub fn with_min_free(max_bytes: i64, min_free_bytes: i64) -> Self {
        Self {
            max_bytes,
            min_free_bytes,
            reserved: AtomicI64::new(0),
            waiters: Mutex::new(VecDeque::new()),
        }
    }

    /// Attempts an atomic reservation; never blocks.
    pub fn try_reserve(&self, bytes: i64) -> bool {
        loop {
            let current = self.reserved.load(Ordering::SeqCst);
            if self.max_bytes - current - self.min_free_bytes < bytes {
                return false;
            }
            if self
                .reserved
                .compare_exchange(current, current + bytes, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Blocks until the reservation succeeds or `cancel` fires. Waiters are
    /// queued FIFO, woken one per release, and re-queued if they lose the
    /// re-attempt race. Returns `false` only on cancellation.
    pub async fn reserve(&self, bytes: i64, cancel: &CancellationToken) -> bool {
        if self.try_reserve(bytes) {
            return true;
        }
        loop {
            let (tx, mut rx) = oneshot::channel();
            self.waiters.lock().push_back(tx);
            // Re-check after enqueuing; a release landing between the failed
            // attempt and the enqueue would otherwise never wake us. The
            // abandoned sender is skipped over by release().
            if self.try_reserve(bytes) {
                return true;
            }
            tokio::select! {
                _ = &mut rx => {
                    if self.try_reserve(bytes) {
                        return true;
                    }
                }
                _ = cancel.cancelled() => return false,
            }
        }
    }

    /// Returns a reservation and wakes the next live waiter.
    pub fn release(&self, bytes: i64) {
        self.reserved.fetch_sub(bytes, Ordering::SeqCst);
        let mut waiters = self.waiters.lock();
        while let Some(tx) = waiters.pop_front() {
            if tx.send(()).is_ok() {
                break;
            }
        }
    }

    pub fn stats(&self) -> ArbiterStats {
        let reserved = self.reserved.load(Ordering::SeqCst);
        ArbiterStats {
            reserved,
            max_bytes: self.max_bytes,
            available: self.max_bytes - reserved - self.min_free_bytes,
        }
    }
}

/// Memory promised to one month's processing: streaming parse plus
/// aggregator state, with a 1% slice of the CSV size on top.
pub fn estimate_month_memory(csv_size: i64) -> i64 {
    BASE_MONTH_BYTES + csv_size / 100
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;

    fn arbiter(max: i64) -> Arc<MemoryArbiter> {
        Arc::new(MemoryArbiter::with_min_free(max, 0))
    }

    #[test]
    fn try_reserve_respects_ceiling() {
        let arb = arbiter(100);
        assert!(arb.try_reserve(60));
        assert!(!arb.try_reserve(50));
        assert!(arb.try_reserve(40));
        assert!(!arb.try_reserve(1));
        arb.release(40);
        assert!(arb.try_reserve(30));
    }

    #[test]
    fn min_free_margin_is_reserved() {
        let arb = MemoryArbiter::with_min_free(100, 30);
        assert!(!arb.try_reserve(80));
        assert!(arb.try_reserve(70));
        assert_eq!(arb.stats().available, 0);
    }

    #[tokio::test]
    async fn reserve_blocks_until_release() {
        let arb = arbiter(100);
        assert!(arb.try_reserve(100));

        let waiter = {
            let arb = arb.clone();
            tokio::spawn(async move {
                let cancel = CancellationToken::new();
                arb.reserve(60, &cancel).await
            })
        };
        // The waiter cannot complete until capacity is returned.
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        arb.release(100);
        assert!(timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap());
        assert_eq!(arb.stats().reserved, 60);
    }

    #[tokio::test]
    async fn cancellation_unblocks_with_failure() {
        let arb = arbiter(10);
        assert!(arb.try_reserve(10));
        let cancel = CancellationToken::new();

        let waiter = {
            let arb = arb.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { arb.reserve(5, &cancel).await })
        };
        tokio::task::yield_now().await;
        cancel.cancel();
        assert!(!timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap());
        assert_eq!(arb.stats().reserved, 10);
    }

    #[tokio::test]
    async fn each_release_admits_the_next_waiter() {
        let arb = arbiter(100);
        assert!(arb.try_reserve(100));

        // Full-capacity waiters: each admission requires the previous
        // holder's release, so completion proves the wake chain works.
        let mut waiters = Vec::new();
        for _ in 0..4 {
            let arb = arb.clone();
            waiters.push(tokio::spawn(async move {
                let cancel = CancellationToken::new();
                let ok = arb.reserve(100, &cancel).await;
                arb.release(100);
                ok
            }));
            tokio::task::yield_now().await;
        }

        arb.release(100);
        for waiter in waiters {
            assert!(timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap());
        }
        assert_eq!(arb.stats().reserved, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_reserve_release_balances_to_zero() {
        let arb = arbiter(1_000);
        let mut tasks = Vec::new();
        for i in 0..32 {
            let arb = arb.clone();
            tasks.push(tokio::spawn(async move {
                let cancel = CancellationToken::new();
                let bytes = 50 + (i % 7) * 10;
                for _ in 0..50 {
                    assert!(arb.reserve(bytes, &cancel).await);
                    tokio::task::yield_now().await;
                    arb.release(bytes);
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(arb.stats().reserved, 0);
    }

    #[test]
    fn month_estimate_scales_with_csv_size() {
        assert_eq!(estimate_month_memory(0), 500 * 1024 * 1024);
        assert_eq!(
            estimate_month_memory(10_000_000_000),
            500 * 1024 * 1024 + 100_000_000
        );
    }
}

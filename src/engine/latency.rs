//! Database latency simulator for the in-memory warehouse.
//!
//! Models the commit path of a real storage tier: a bounded connection gate
//! plus a write latency that grows with gate occupancy. Its purpose is to
//! reorder concurrent commits the way a database under load would, so the
//! timestamp-ordering races the sealing pipeline corrects for actually show
//! up in tests.

use rand::Rng;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Typical write latency of the simulated backend is 10-15 ms, plus a
/// load-dependent tail of up to ~10 ms when the gate saturates.
#[derive(Debug)]
pub struct DbLatencySimulator {
    capacity: usize,
    gate: Semaphore,
}

impl DbLatencySimulator {
    /// `threshold` plays the role of the backend's rated throughput; the
    /// connection gate holds `threshold / 44` slots.
    pub fn new(threshold: usize) -> Self {
        let capacity = (threshold / 44).max(1);
        DbLatencySimulator {
            capacity,
            gate: Semaphore::new(capacity),
        }
    }

    /// Hold a gate slot for the duration of one simulated write.
    pub async fn run(&self) {
        let Ok(_permit) = self.gate.acquire().await else {
            return;
        };

        let base_ms = 10 + rand::thread_rng().gen_range(0..5);
        tokio::time::sleep(Duration::from_millis(base_ms)).await;

        let in_use = self.capacity - self.gate.available_permits();
        let load = 1.0 / ((self.capacity as f64 / (in_use as f64 + 1.0)).ln() + 1.0);
        tokio::time::sleep(Duration::from_micros((10_000.0 * load) as u64)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(flavor = "multi_thread")]
    async fn gate_bounds_concurrency() {
        let sim = Arc::new(DbLatencySimulator::new(88)); // 2 slots
        let peak = Arc::new(AtomicUsize::new(0));
        let live = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let sim = Arc::clone(&sim);
            let peak = Arc::clone(&peak);
            let live = Arc::clone(&live);
            handles.push(tokio::spawn(async move {
                let Ok(_permit) = sim.gate.acquire().await else {
                    return;
                };
                let now = live.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                live.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn run_completes() {
        let sim = DbLatencySimulator::new(44_000);
        sim.run().await;
    }
}

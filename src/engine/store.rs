//! Dual-indexed in-memory bid store.
//!
//! Every admitted bid is owned once, in an arena keyed by insertion order;
//! the bidder chain and the price chain both hold arena indices, so the two
//! views always reference the same bid and flipping `active` is a single
//! point update. The price chain keeps its key index sorted descending,
//! which makes the lowest tenderable bid a prefix-sum walk over the
//! per-price active counts.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::hash_map::Entry;
use std::collections::HashMap;

use crate::engine::config::truncate_micros;

/// One bid. `serial`, `time` and `sequence` are engine-assigned; `active`
/// starts true on admission and flips to false when a later bid by the same
/// bidder supersedes it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Bid {
    pub serial: u64,
    pub client: u32,
    pub price: u32,
    /// Server-assigned commit time, truncated to microseconds. `None` until
    /// the warehouse has accepted the bid.
    pub time: Option<DateTime<Utc>>,
    pub sequence: u8,
    pub active: bool,
}

/// Ordered list of bids sharing one key, with lifetime and live counters.
#[derive(Debug)]
struct Block {
    total: u64,
    valid: u64,
    bids: Vec<usize>,
}

impl Block {
    fn new() -> Self {
        Block {
            total: 0,
            valid: 0,
            bids: Vec::new(),
        }
    }
}

/// Keyed index of blocks. The price chain keeps `index` sorted descending;
/// the bidder chain leaves it in insertion order.
#[derive(Debug, Default)]
struct Chain {
    index: Vec<u32>,
    blocks: HashMap<u32, Block>,
}

impl Chain {
    /// Append an arena index under `key`, creating the block on first use.
    /// With `keep_sorted`, a new key is inserted preserving descending order.
    fn insert(&mut self, key: u32, bid: usize, keep_sorted: bool) {
        let block = match self.blocks.entry(key) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => {
                if keep_sorted {
                    let at = self.index.partition_point(|&k| k > key);
                    self.index.insert(at, key);
                } else {
                    self.index.push(key);
                }
                e.insert(Block::new())
            }
        };
        block.bids.push(bid);
        block.total += 1;
        block.valid += 1;
    }
}

#[derive(Debug, Default)]
struct StoreInner {
    arena: Vec<Bid>,
    bidders: Chain,
    prices: Chain,
    /// Arena index of the lowest tenderable bid, when defined.
    tail: Option<usize>,
    /// Arena indices of the winning slate, filled by `judge`.
    finals: Vec<usize>,
}

impl StoreInner {
    /// Recompute the lowest tenderable bid: walk the price index top-down
    /// accumulating per-block active counts; the block where the running sum
    /// first reaches `capacity` contains the tail, at the offset remaining
    /// after the blocks above it.
    ///
    /// Undefined (left untouched) while fewer distinct bidders than capacity
    /// exist, or when capacity is 0.
    fn recompute_tail(&mut self, capacity: u32) {
        if capacity == 0 || (self.bidders.blocks.len() as u64) < capacity as u64 {
            return;
        }

        let mut seen = 0u64;
        for &price in &self.prices.index {
            let block = &self.prices.blocks[&price];
            let before = seen;
            seen += block.valid;
            if seen >= capacity as u64 {
                let offset = capacity as u64 - before;
                let mut nth = 0u64;
                for &idx in &block.bids {
                    if !self.arena[idx].active {
                        continue;
                    }
                    nth += 1;
                    if nth == offset {
                        self.tail = Some(idx);
                        return;
                    }
                }
            }
        }
    }
}

/// Snapshot of one price block, highest price first in [`Store::price_rows`].
#[derive(Debug, Clone)]
pub struct PriceRow {
    pub price: u32,
    pub total: u64,
    pub valid: u64,
    pub bids: Vec<Bid>,
}

/// Owns the bid arena and both chains. `add` is exclusive; readers go
/// through the shared lock.
#[derive(Debug)]
pub struct Store {
    capacity: u32,
    inner: RwLock<StoreInner>,
}

impl Store {
    /// Capacity 0 disables lowest-tenderable-bid tracking (used by the
    /// warehouse mirror and the restore shadow).
    pub fn new(capacity: u32) -> Self {
        Store {
            capacity,
            inner: RwLock::new(StoreInner::default()),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Index `bid` into both chains, deactivate the bidder's previous bid if
    /// any, and recompute the lowest tenderable bid.
    pub fn add(&self, bid: Bid) {
        let mut guard = self.inner.write();
        let inner = &mut *guard;

        let idx = inner.arena.len();
        let client = bid.client;
        let price = bid.price;
        inner.arena.push(bid);

        inner.bidders.insert(client, idx, false);
        inner.prices.insert(price, idx, true);

        // Supersede: the previous bid for this bidder is the penultimate
        // element of the bidder block, which no sort ever reorders.
        let block = inner
            .bidders
            .blocks
            .get_mut(&client)
            .expect("bidder block exists after insert");
        if block.total > 1 {
            let prev = block.bids[block.bids.len() - 2];
            block.valid = 1;
            let prev_price = inner.arena[prev].price;
            inner.arena[prev].active = false;
            if let Some(prev_block) = inner.prices.blocks.get_mut(&prev_price) {
                prev_block.valid -= 1;
            }
        }

        inner.recompute_tail(self.capacity);
    }

    /// Number of distinct bidders.
    pub fn count_bidders(&self) -> usize {
        self.inner.read().bidders.blocks.len()
    }

    /// Lifetime number of admitted bids.
    pub fn count_bids(&self) -> usize {
        self.inner
            .read()
            .prices
            .blocks
            .values()
            .map(|b| b.total)
            .sum::<u64>() as usize
    }

    /// The lowest tenderable bid, when defined.
    pub fn tail_bid(&self) -> Option<Bid> {
        let guard = self.inner.read();
        guard.tail.map(|i| guard.arena[i].clone())
    }

    /// The last bid recorded for `client`, active or not.
    pub fn last_bid(&self, client: u32) -> Option<Bid> {
        let guard = self.inner.read();
        let block = guard.bidders.blocks.get(&client)?;
        block.bids.last().map(|&i| guard.arena[i].clone())
    }

    /// All bids recorded for `client`, in arrival order.
    pub fn bidder_bids(&self, client: u32) -> Option<Vec<Bid>> {
        let guard = self.inner.read();
        let block = guard.bidders.blocks.get(&client)?;
        Some(block.bids.iter().map(|&i| guard.arena[i].clone()).collect())
    }

    /// Per-bidder bid lists in bidder insertion order.
    pub fn bidder_rows(&self) -> Vec<Vec<Bid>> {
        let guard = self.inner.read();
        guard
            .bidders
            .index
            .iter()
            .map(|key| {
                guard.bidders.blocks[key]
                    .bids
                    .iter()
                    .map(|&i| guard.arena[i].clone())
                    .collect()
            })
            .collect()
    }

    /// Per-price block snapshots, highest price first.
    pub fn price_rows(&self) -> Vec<PriceRow> {
        let guard = self.inner.read();
        guard
            .prices
            .index
            .iter()
            .map(|&price| {
                let block = &guard.prices.blocks[&price];
                PriceRow {
                    price,
                    total: block.total,
                    valid: block.valid,
                    bids: block.bids.iter().map(|&i| guard.arena[i].clone()).collect(),
                }
            })
            .collect()
    }

    /// Stable-sort every price block by ascending commit time, correcting
    /// for arrival reordering introduced by concurrent admission, then
    /// recompute the lowest tenderable bid.
    pub fn sort_all_blocks(&self) {
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        let arena = &inner.arena;
        for block in inner.prices.blocks.values_mut() {
            block.bids.sort_by_key(|&i| arena[i].time);
        }
        inner.recompute_tail(self.capacity);
    }

    /// Deep-compare with another store: for every bidder block, equal length
    /// and per-bid equality on (client, price, sequence, active, time
    /// truncated to microseconds). Serial numbers are not compared; a
    /// restored store never has them.
    pub fn equal(&self, other: &Store) -> bool {
        let a = self.inner.read();
        let b = other.inner.read();

        for &client in &a.bidders.index {
            let block = &a.bidders.blocks[&client];
            let Some(other_block) = b.bidders.blocks.get(&client) else {
                return false;
            };
            if block.total != other_block.total {
                return false;
            }
            for (&ia, &ib) in block.bids.iter().zip(&other_block.bids) {
                let (x, y) = (&a.arena[ia], &b.arena[ib]);
                if x.client != y.client
                    || x.price != y.price
                    || x.sequence != y.sequence
                    || x.active != y.active
                    || x.time.map(truncate_micros) != y.time.map(truncate_micros)
                {
                    return false;
                }
            }
        }
        true
    }

    /// Enumerate the winning slate and the clearing statistics. Returns the
    /// within-second ordinal of the clearing bid among bids at the clearing
    /// price, and the average winning price. Meaningful only after
    /// [`Store::sort_all_blocks`].
    pub fn judge(&self) -> (u32, f64) {
        if self.capacity == 0 {
            return (0, 0.0);
        }

        let mut guard = self.inner.write();
        let inner = &mut *guard;
        let Some(tail) = inner.tail else {
            return (0, 0.0);
        };

        let mut success = 0u32;
        let mut total_price = 0u64;
        inner.finals.clear();
        for &price in &inner.prices.index {
            let block = &inner.prices.blocks[&price];
            for &idx in &block.bids {
                let bid = &inner.arena[idx];
                if success < self.capacity && bid.active {
                    inner.finals.push(idx);
                    success += 1;
                    total_price += bid.price as u64;
                }
            }
        }
        if success == 0 {
            return (0, 0.0);
        }

        let tail_time = inner.arena[tail].time;
        let tail_price = inner.arena[tail].price;
        let mut last_second_ordinal = 0u32;
        if let Some(block) = inner.prices.blocks.get(&tail_price) {
            for &idx in &block.bids {
                let time = inner.arena[idx].time;
                if unix_second(time) == unix_second(tail_time)
                    && (time < tail_time || idx == tail)
                {
                    last_second_ordinal += 1;
                }
            }
        }

        (last_second_ordinal, total_price as f64 / success as f64)
    }

    /// The winning slate, highest price first. Empty before `judge`.
    pub fn successful_bids(&self) -> Vec<Bid> {
        let guard = self.inner.read();
        guard
            .finals
            .iter()
            .map(|&i| guard.arena[i].clone())
            .collect()
    }
}

fn unix_second(t: Option<DateTime<Utc>>) -> i64 {
    t.map(|t| t.timestamp()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use std::sync::Arc;

    fn bid(client: u32, price: u32, sequence: u8) -> Bid {
        Bid {
            serial: 0,
            client,
            price,
            time: Some(Utc::now()),
            sequence,
            active: true,
        }
    }

    fn bid_at(client: u32, price: u32, sequence: u8, time: DateTime<Utc>) -> Bid {
        Bid {
            time: Some(time),
            ..bid(client, price, sequence)
        }
    }

    #[test]
    fn empty_store_counts() {
        let store = Store::new(3);
        assert_eq!(store.count_bidders(), 0);
        assert_eq!(store.count_bids(), 0);
        assert!(store.tail_bid().is_none());
    }

    #[test]
    fn tail_bid_tracks_capacity_rank() {
        let store = Store::new(3);

        store.add(bid(1, 1, 1));
        assert!(store.tail_bid().is_none());
        store.add(bid(2, 1, 1));
        assert!(store.tail_bid().is_none());

        // Third bidder reaches capacity; the tail is the last-added bid at
        // the capacity-th rank.
        store.add(bid(3, 1, 1));
        assert_eq!(store.tail_bid().unwrap().client, 3);

        store.add(bid(4, 5, 1));
        assert_eq!(store.tail_bid().unwrap().price, 1);
        store.add(bid(5, 2, 1));
        assert_eq!(store.tail_bid().unwrap().price, 1);
        store.add(bid(6, 3, 1));
        assert_eq!(store.tail_bid().unwrap().price, 2);
        store.add(bid(7, 1, 1));
        assert_eq!(store.tail_bid().unwrap().price, 2);
        store.add(bid(8, 5, 1));
        assert_eq!(store.tail_bid().unwrap().price, 3);
        store.add(bid(9, 4, 1));
        assert_eq!(store.tail_bid().unwrap().price, 4);
        store.add(bid(10, 5, 1));
        assert_eq!(store.tail_bid().unwrap().price, 5);

        // Second-round revisions supersede the bidder's earlier bid.
        store.add(bid(10, 6, 2));
        assert_eq!(store.tail_bid().unwrap().price, 5);
        store.add(bid(7, 7, 2));
        assert_eq!(store.tail_bid().unwrap().client, 4);
        store.add(bid(6, 6, 2));
        assert_eq!(store.tail_bid().unwrap().price, 6);
        store.add(bid(4, 8, 2));
        assert_eq!(store.tail_bid().unwrap().client, 10);
        store.add(bid(2, 9, 2));
        assert_eq!(store.tail_bid().unwrap().price, 7);
        store.add(bid(3, 7, 2));
        assert_eq!(store.tail_bid().unwrap().client, 7);
        store.add(bid(3, 8, 3));
        assert_eq!(store.tail_bid().unwrap().client, 3);
        store.add(bid(10, 9, 3));
        assert_eq!(store.tail_bid().unwrap().price, 8);
        store.add(bid(4, 6, 3));
        assert_eq!(store.tail_bid().unwrap().client, 3);
    }

    #[test]
    fn supersede_keeps_one_active_bid_per_bidder() {
        let store = Store::new(0);
        store.add(bid(7, 2, 1));
        store.add(bid(7, 5, 2));
        store.add(bid(7, 9, 3));

        let bids = store.bidder_bids(7).unwrap();
        assert_eq!(bids.len(), 3);
        let active: Vec<_> = bids.iter().filter(|b| b.active).collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].price, 9, "only the latest bid stays active");

        // The superseded prices keep their totals but lose their live count.
        for row in store.price_rows() {
            assert_eq!(row.total, 1);
            let expected_valid = if row.price == 9 { 1 } else { 0 };
            assert_eq!(row.valid, expected_valid, "price {}", row.price);
        }
    }

    #[test]
    fn price_index_is_descending() {
        let store = Store::new(0);
        for (client, price) in [(1, 4), (2, 9), (3, 1), (4, 7), (5, 9), (6, 2)] {
            store.add(bid(client, price, 1));
        }
        let prices: Vec<u32> = store.price_rows().iter().map(|r| r.price).collect();
        assert_eq!(prices, vec![9, 7, 4, 2, 1]);
    }

    #[test]
    fn block_counters_match_contents() {
        let store = Store::new(0);
        store.add(bid(1, 5, 1));
        store.add(bid(2, 5, 1));
        store.add(bid(1, 6, 2));

        for row in store.price_rows() {
            assert_eq!(row.total, row.bids.len() as u64);
            let live = row.bids.iter().filter(|b| b.active).count() as u64;
            assert_eq!(row.valid, live, "price {}", row.price);
        }
        assert_eq!(store.count_bids(), 3);
        assert_eq!(store.count_bidders(), 2);
    }

    #[test]
    fn sort_orders_blocks_by_time_and_recomputes_tail() {
        let base = Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap();
        let store = Store::new(2);

        // Arrival order disagrees with commit time inside the price-5 block.
        store.add(bid_at(1, 5, 1, base + Duration::microseconds(300)));
        store.add(bid_at(2, 5, 1, base + Duration::microseconds(100)));
        store.add(bid_at(3, 5, 1, base + Duration::microseconds(200)));

        assert_eq!(store.tail_bid().unwrap().client, 2, "stored order");

        store.sort_all_blocks();
        let row = &store.price_rows()[0];
        let clients: Vec<u32> = row.bids.iter().map(|b| b.client).collect();
        assert_eq!(clients, vec![2, 3, 1]);
        assert_eq!(store.tail_bid().unwrap().client, 3, "time order");
    }

    #[test]
    fn equal_compares_bidder_chains_deeply() {
        let t = Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap();
        let a = Store::new(3);
        let b = Store::new(0);
        for store in [&a, &b] {
            store.add(bid_at(1, 4, 1, t));
            store.add(bid_at(2, 6, 1, t + Duration::seconds(1)));
            store.add(bid_at(1, 7, 2, t + Duration::seconds(2)));
        }
        assert!(a.equal(&b));
        assert!(b.equal(&a));

        b.add(bid_at(2, 9, 2, t + Duration::seconds(3)));
        assert!(!a.equal(&b), "diverging totals must not compare equal");
    }

    #[test]
    fn judge_computes_ordinal_and_average() {
        let base = Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 1).unwrap();
        let store = Store::new(2);
        store.add(bid_at(1, 5, 1, base - Duration::seconds(1)));
        store.add(bid_at(2, 3, 1, base));
        // Same wall-clock second as the clearing bid, but later.
        store.add(bid_at(3, 3, 1, base + Duration::milliseconds(500)));

        store.sort_all_blocks();
        let (ordinal, average) = store.judge();

        let tail = store.tail_bid().unwrap();
        assert_eq!(tail.client, 2);
        assert_eq!(ordinal, 1, "clearing bid is first within its second");
        assert!((average - 4.0).abs() < f64::EPSILON);

        let winners = store.successful_bids();
        assert_eq!(winners.len(), 2);
        assert_eq!(winners[0].client, 1);
        assert_eq!(winners[1].client, 2);
    }

    #[test]
    fn sequential_add_counts() {
        for n in [10usize, 100, 1000] {
            let store = Store::new((n / 10) as u32);
            for client in 1..=n {
                store.add(bid(client as u32, 1, 1));
            }
            assert_eq!(store.count_bidders(), n);
            assert_eq!(store.count_bids(), n);
        }
    }

    #[test]
    fn concurrent_add_counts() {
        for n in [10usize, 100, 1000] {
            let store = Arc::new(Store::new((n / 10) as u32));
            std::thread::scope(|scope| {
                for client in 1..=n {
                    let store = Arc::clone(&store);
                    scope.spawn(move || {
                        store.add(bid(client as u32, 1, 1));
                    });
                }
            });
            assert_eq!(store.count_bidders(), n);
            assert_eq!(store.count_bids(), n);
        }
    }
}

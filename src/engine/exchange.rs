//! Session controller: timers, admission policy, sealing.
//!
//! One `Exchange` runs one tender session. Admission is gated by a bounded
//! semaphore so the warehouse and the store lock see a bounded load; serials
//! are assigned before the gate, so serial order is arrival order while
//! commit timestamps may interleave (the sealing pipeline re-sorts for
//! that). The lowest tenderable bid is cached exchange-local and read by
//! second-round admission without taking the store lock; a just-stale value
//! near a boundary is tolerated.

use anyhow::Context;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::io::BufWriter;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, Semaphore};
use tracing::{error, info, warn};

use crate::engine::config::{AuctionConfig, Final, StateSnapshot};
use crate::engine::dump::dump_all;
use crate::engine::error::AuctionError;
use crate::engine::store::{Bid, Store};
use crate::engine::warehouse::{warehouse_from_env, Warehouse};
use crate::engine::{BIDS_PER_BIDDER, BID_PROCESS_THRESHOLD, PRICING_DELTA};

/// Session phases, in order. Transitions are one-way and timer-driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Session {
    Unprepared = 0,
    FirstRound = 1,
    SecondRound = 2,
    Finished = 3,
}

impl Session {
    fn from_u8(value: u8) -> Session {
        match value {
            1 => Session::FirstRound,
            2 => Session::SecondRound,
            3 => Session::Finished,
            _ => Session::Unprepared,
        }
    }
}

/// Exchange-local cache of the lowest tenderable bid.
#[derive(Debug, Clone, Copy, Default)]
struct LowestBid {
    price: u32,
    time: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct SealSlot {
    sealed: bool,
    result: Option<Final>,
}

pub struct Exchange {
    sid: String,
    config: AuctionConfig,

    session: AtomicU8,
    serial: AtomicU64,
    /// Bidder count snapshot: live during the first round, frozen at the
    /// half transition.
    bidders: AtomicU32,
    lowest: RwLock<LowestBid>,
    state: RwLock<StateSnapshot>,

    store: Store,
    warehouse: Arc<dyn Warehouse>,

    gate: Semaphore,
    quit: watch::Sender<bool>,
    seal_slot: Mutex<SealSlot>,

    counter_hit: AtomicU64,
    counter_process: AtomicU64,
}

impl Exchange {
    pub async fn new(
        config: AuctionConfig,
        warehouse: Arc<dyn Warehouse>,
    ) -> anyhow::Result<Arc<Exchange>> {
        warehouse
            .initialize()
            .await
            .context("warehouse initialization failed")?;

        let (quit, _) = watch::channel(false);
        Ok(Arc::new(Exchange {
            sid: config.session_id(),
            store: Store::new(config.capacity),
            config,
            session: AtomicU8::new(Session::Unprepared as u8),
            serial: AtomicU64::new(0),
            bidders: AtomicU32::new(0),
            lowest: RwLock::new(LowestBid::default()),
            state: RwLock::new(StateSnapshot::default()),
            warehouse,
            gate: Semaphore::new(BID_PROCESS_THRESHOLD),
            quit,
            seal_slot: Mutex::new(SealSlot::default()),
            counter_hit: AtomicU64::new(0),
            counter_process: AtomicU64::new(0),
        }))
    }

    /// Build with the warehouse selected from the environment.
    pub async fn from_env(config: AuctionConfig) -> anyhow::Result<Arc<Exchange>> {
        let warehouse = warehouse_from_env(&config.session_id())?;
        Exchange::new(config, warehouse).await
    }

    pub fn config(&self) -> &AuctionConfig {
        &self.config
    }

    pub fn session_id(&self) -> &str {
        &self.sid
    }

    pub fn session(&self) -> Session {
        Session::from_u8(self.session.load(Ordering::Acquire))
    }

    pub fn state(&self) -> StateSnapshot {
        self.state.read().clone()
    }

    pub fn count_bidders(&self) -> usize {
        self.store.count_bidders()
    }

    pub fn count_bids(&self) -> usize {
        self.store.count_bids()
    }

    /// The bidder's latest recorded bid, active or not.
    pub fn enquiry(&self, client: u32) -> Result<Bid, AuctionError> {
        self.store.last_bid(client).ok_or(AuctionError::NotAttend)
    }

    /// The winning slate. Valid only after sealing.
    pub fn successful_bids(&self) -> Vec<Bid> {
        self.store.successful_bids()
    }

    /// The sealed result, if sealing already ran.
    pub fn finalized(&self) -> Option<Final> {
        self.seal_slot
            .try_lock()
            .ok()
            .and_then(|slot| slot.result.clone())
    }

    /// Drive the session phases against the wall clock. Returns when the
    /// session finishes, by timer or by [`Exchange::halt`].
    pub async fn serve(self: Arc<Exchange>) {
        let mut quit = self.quit.subscribe();

        tokio::select! {
            _ = sleep_until(self.config.start_time) => {
                self.set_session(Session::FirstRound);
                self.spawn_collector();
            }
            _ = quit.changed() => {
                self.finish();
                return;
            }
        }

        tokio::select! {
            _ = sleep_until(self.config.half_time) => {
                self.set_session(Session::SecondRound);
                self.publish_lowest();
                self.bidders
                    .store(self.store.count_bidders() as u32, Ordering::Release);
            }
            _ = quit.changed() => {
                self.finish();
                return;
            }
        }

        tokio::select! {
            _ = sleep_until(self.config.end_time) => self.finish(),
            _ = quit.changed() => self.finish(),
        }
    }

    fn set_session(&self, session: Session) {
        self.session.store(session as u8, Ordering::Release);
        info!(sid = %self.sid, session = session as u8, "session transition");
    }

    fn finish(&self) {
        self.set_session(Session::Finished);
        // Wakes the stat collector for its closing snapshot.
        self.quit.send_replace(true);
    }

    /// Accept a bid request carrying only `client` and `price`. On success
    /// the bid comes back filled with its serial, sequence and the
    /// warehouse-assigned time.
    pub async fn bid(&self, bid: &mut Bid) -> Result<(), AuctionError> {
        self.counter_hit.fetch_add(1, Ordering::Relaxed);
        bid.serial = self.serial.fetch_add(1, Ordering::Relaxed) + 1;

        let began = std::time::Instant::now();
        let result = self.admit(bid).await;
        match &result {
            Ok(()) => info!(
                target: "bid",
                client = bid.client,
                price = bid.price,
                serial = bid.serial,
                sequence = bid.sequence,
                elapsed_ms = began.elapsed().as_millis() as u64,
                "bid accepted"
            ),
            Err(e) => info!(
                target: "bid",
                client = bid.client,
                price = bid.price,
                serial = bid.serial,
                code = e.code(),
                elapsed_ms = began.elapsed().as_millis() as u64,
                reason = %e,
                "bid rejected"
            ),
        }
        result
    }

    async fn admit(&self, bid: &mut Bid) -> Result<(), AuctionError> {
        if bid.time.is_some() || bid.sequence != 0 || bid.active {
            return Err(AuctionError::InvalidRequest);
        }

        match self.session() {
            Session::Unprepared => return Err(AuctionError::NotReady),
            Session::Finished => return Err(AuctionError::Ended),
            _ => {}
        }

        let Ok(_permit) = self.gate.acquire().await else {
            return Err(AuctionError::Ended);
        };
        self.process(bid).await
    }

    async fn process(&self, bid: &mut Bid) -> Result<(), AuctionError> {
        if bid.price < 1 {
            return Err(AuctionError::InvalidPrice);
        }

        bid.active = true;
        let session = self.session();
        let outcome = match session {
            Session::FirstRound => self.admit_first_round(bid).await,
            Session::SecondRound => self.admit_second_round(bid).await,
            _ => Err(AuctionError::InvalidTime),
        };
        if let Err(e) = outcome {
            bid.active = false;
            return Err(e);
        }

        // Publish the new tail once it is meaningful: always in the second
        // round, in the first only once bidders have reached capacity.
        if session == Session::SecondRound
            || self.store.count_bidders() as u64 >= self.config.capacity as u64
        {
            self.publish_lowest();
        }
        Ok(())
    }

    async fn admit_first_round(&self, bid: &mut Bid) -> Result<(), AuctionError> {
        if self.store.last_bid(bid.client).is_some() {
            return Err(AuctionError::AlreadyInFirstRound);
        }
        if self.config.warning_price > 0 && bid.price > self.config.warning_price {
            return Err(AuctionError::AboveWarningPrice);
        }

        bid.sequence = 1;
        self.warehouse.add(bid).await?;

        // The commit time is authoritative: a bid the storage tier accepted
        // past the boundary stays in the log but never enters the store.
        if bid.time.is_some_and(|t| t >= self.config.half_time) {
            return Err(AuctionError::FirstRoundClosed);
        }

        self.store.add(bid.clone());
        self.counter_process.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn admit_second_round(&self, bid: &mut Bid) -> Result<(), AuctionError> {
        let Some(prior) = self.store.bidder_bids(bid.client) else {
            return Err(AuctionError::NotInFirstRound);
        };
        if prior.len() as u8 >= BIDS_PER_BIDDER {
            return Err(AuctionError::AllIn);
        }
        if prior.iter().any(|p| p.price == bid.price) {
            return Err(AuctionError::SamePrice);
        }

        let lowest = self.lowest.read().price;
        if bid.price.abs_diff(lowest) > PRICING_DELTA {
            return Err(AuctionError::OutOfRange);
        }

        bid.sequence = prior.len() as u8 + 1;
        self.warehouse.add(bid).await?;

        if bid.time.is_some_and(|t| t >= self.config.end_time) {
            return Err(AuctionError::SecondRoundClosed);
        }

        self.store.add(bid.clone());
        self.counter_process.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn publish_lowest(&self) {
        if let Some(tail) = self.store.tail_bid() {
            *self.lowest.write() = LowestBid {
                price: tail.price,
                time: tail.time,
            };
        }
    }

    /// Verify, sort, judge, commit and dump. Idempotent: the second call
    /// returns the stored result without touching the warehouse again.
    pub async fn seal(&self) -> Option<Final> {
        let mut slot = self.seal_slot.lock().await;
        if slot.sealed {
            return slot.result.clone();
        }
        slot.sealed = true;

        info!(sid = %self.sid, "sealing started");

        // Replay the durable log into a shadow store and verify the live
        // view against it. A mismatch is logged; the live store wins.
        let shadow = Store::new(0);
        if let Err(e) = self.warehouse.restore(&shadow, &self.config).await {
            error!(sid = %self.sid, error = %e, "warehouse restore failed during sealing");
        }
        if self.store.equal(&shadow) {
            info!(sid = %self.sid, "warehouse raw data check done");
        } else {
            warn!(sid = %self.sid, "live store differs from the warehouse restore");
        }

        // Commit order may differ from arrival order; re-sort by the
        // authoritative timestamps before judging.
        self.store.sort_all_blocks();
        let (ordinal, average) = self.store.judge();

        for winner in self.store.successful_bids() {
            if let Err(e) = self.warehouse.commit(&winner).await {
                warn!(
                    sid = %self.sid,
                    client = winner.client,
                    serial = winner.serial,
                    error = %e,
                    "final commit failed"
                );
            }
        }

        self.dump();

        slot.result = self.store.tail_bid().map(|tail| Final {
            capacity: self.config.capacity,
            bidders: self.bidders.load(Ordering::Acquire),
            lowest_price: tail.price,
            lowest_time: tail.time,
            lowest_sequence: ordinal,
            average_price: (average * 100.0) as u64,
        });

        info!(sid = %self.sid, "sealing finished");
        slot.result.clone()
    }

    fn dump(&self) {
        let path = format!("./logs/{}_server_res.txt", self.sid);
        if let Some(parent) = Path::new(&path).parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match std::fs::File::create(&path) {
            Ok(file) => {
                let mut writer = BufWriter::new(file);
                if let Err(e) = dump_all(&mut writer, &self.store) {
                    warn!(sid = %self.sid, error = %e, "writing result dump failed");
                }
            }
            Err(e) => warn!(sid = %self.sid, path = %path, error = %e, "creating result dump failed"),
        }
    }

    /// Graceful shutdown: finish the session, seal if unsealed, release the
    /// warehouse.
    pub async fn close(&self) {
        self.quit.send_replace(true);
        self.seal().await;
        self.warehouse.terminate().await;
    }

    /// Ungraceful shutdown: finish the session and release the warehouse
    /// without sealing.
    pub async fn halt(&self) {
        self.quit.send_replace(true);
        self.warehouse.terminate().await;
    }

    fn spawn_collector(self: &Arc<Exchange>) {
        let exchange = Arc::clone(self);
        let mut quit = self.quit.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = ticker.tick() => exchange.collect_stat(),
                    _ = quit.changed() => {
                        exchange.collect_stat();
                        return;
                    }
                }
            }
        });
    }

    /// 1 Hz status snapshot. The bidder count is only recomputed while the
    /// first round runs; afterwards the half-transition snapshot stands.
    fn collect_stat(&self) {
        if self.session() == Session::FirstRound {
            self.bidders
                .store(self.store.count_bidders() as u32, Ordering::Release);
        }

        let lowest = *self.lowest.read();
        let session = self.session();
        let bidders = self.bidders.load(Ordering::Acquire);
        {
            let mut state = self.state.write();
            state.time = Some(Utc::now());
            state.session = session as u8;
            state.bidders = bidders;
            state.lowest_price = lowest.price;
            state.lowest_time = lowest.time;
        }

        info!(
            target: "stat",
            sid = %self.sid,
            remaining_s = (self.config.end_time - Utc::now()).num_seconds(),
            session = session as u8,
            bidders,
            bids = self.store.count_bids(),
            lowest_price = lowest.price,
            hits = self.counter_hit.swap(0, Ordering::Relaxed),
            processed = self.counter_process.swap(0, Ordering::Relaxed),
            "collector tick"
        );
    }

    #[cfg(test)]
    pub(crate) fn force_session(&self, session: Session) {
        self.session.store(session as u8, Ordering::Release);
    }
}

async fn sleep_until(target: DateTime<Utc>) {
    let now = Utc::now();
    if target > now {
        if let Ok(wait) = (target - now).to_std() {
            tokio::time::sleep(wait).await;
        }
    }
}

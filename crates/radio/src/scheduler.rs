//! Just-in-time transmit scheduling against the concentrator counter

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::{interval, Duration};

use crate::airtime::time_on_air_us;
use crate::hal::Concentrator;
use crate::lbt::LbtGate;
use crate::packet::{TransmitPacket, TxMode};

/// Time the radio needs between command and RF out
pub const TX_START_DELAY_US: u32 = 1_500;
pub const TX_MARGIN_DELAY_US: u32 = 1_000;
/// How early a packet is handed to the concentrator
pub const TX_JIT_DELAY_US: u32 = 40_000;
pub const BEACON_GUARD_US: u32 = 3_000_000;
pub const BEACON_RESERVED_US: u32 = 2_120_000;
/// Three beacon periods of 128 s plus one of slack
pub const TX_MAX_ADVANCE_DELAY_US: u32 = (3 + 1) * 128 * 1_000_000;

pub const JIT_QUEUE_MAX: usize = 32;
pub const JIT_NUM_BEACON_IN_QUEUE: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketClass {
    Beacon,
    ClassA,
    ClassB,
    ClassC,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum JitError {
    #[error("TOO_LATE")]
    TooLate,
    #[error("TOO_EARLY")]
    TooEarly,
    #[error("FULL")]
    Full,
    #[error("EMPTY")]
    Empty,
    #[error("COLLISION_PACKET")]
    CollisionPacket,
    #[error("COLLISION_BEACON")]
    CollisionBeacon,
    #[error("TX_FREQ")]
    TxFreq,
    #[error("TX_POWER")]
    TxPower,
    #[error("GPS_UNLOCKED")]
    GpsUnlocked,
    #[error("INVALID")]
    Invalid,
}

impl JitError {
    /// Numeric code, 0 is reserved for success
    pub fn code(&self) -> u8 {
        match self {
            JitError::TooLate => 1,
            JitError::TooEarly => 2,
            JitError::Full => 3,
            JitError::Empty => 4,
            JitError::CollisionPacket => 5,
            JitError::CollisionBeacon => 6,
            JitError::TxFreq => 7,
            JitError::TxPower => 8,
            JitError::GpsUnlocked => 9,
            JitError::Invalid => 10,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JitError::TooLate => "TOO_LATE",
            JitError::TooEarly => "TOO_EARLY",
            JitError::Full => "FULL",
            JitError::Empty => "EMPTY",
            JitError::CollisionPacket => "COLLISION_PACKET",
            JitError::CollisionBeacon => "COLLISION_BEACON",
            JitError::TxFreq => "TX_FREQ",
            JitError::TxPower => "TX_POWER",
            JitError::GpsUnlocked => "GPS_UNLOCKED",
            JitError::Invalid => "INVALID",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledEntry {
    pub class: PacketClass,
    pub packet: TransmitPacket,
    pub pre_delay_us: u32,
    pub post_delay_us: u32,
}

impl ScheduledEntry {
    pub fn send_time(&self) -> u32 {
        self.packet.count_us
    }
}

fn collides(p1: u32, p1_pre: u32, p1_post: u32, p2: u32, p2_pre: u32, p2_post: u32) -> bool {
    p1.wrapping_sub(p2) <= p1_pre + p2_post + TX_MARGIN_DELAY_US
        || p2.wrapping_sub(p1) <= p2_pre + p1_post + TX_MARGIN_DELAY_US
}

/// Time-ordered queue for one RF chain.
#[derive(Debug)]
pub struct JitQueue {
    entries: Vec<ScheduledEntry>,
    capacity: usize,
    beacon_target: usize,
    num_beacon: usize,
}

impl Default for JitQueue {
    fn default() -> Self {
        Self::new(JIT_QUEUE_MAX, JIT_NUM_BEACON_IN_QUEUE)
    }
}

impl JitQueue {
    pub fn new(capacity: usize, beacon_target: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
            beacon_target: beacon_target.min(capacity),
            num_beacon: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn num_beacon(&self) -> usize {
        self.num_beacon
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    fn sort(&mut self, now: u32) {
        self.entries
            .sort_by_key(|e| e.packet.count_us.wrapping_sub(now));
    }

    /// First slot at or after `now + 2 * JIT` that fits between queued entries.
    fn asap_slot(&self, now: u32, pre: u32, post: u32) -> u32 {
        let asap = now.wrapping_add(2 * TX_JIT_DELAY_US);
        let clear = self.entries.iter().all(|e| {
            !collides(asap, pre, post, e.send_time(), e.pre_delay_us, e.post_delay_us)
        });
        if clear {
            return asap;
        }

        let mut slot = asap;
        for (i, e) in self.entries.iter().enumerate() {
            slot = e
                .send_time()
                .wrapping_add(e.post_delay_us + pre + TX_JIT_DELAY_US + TX_MARGIN_DELAY_US);
            match self.entries.get(i + 1) {
                None => break,
                Some(next) => {
                    if !collides(slot, pre, post, next.send_time(), next.pre_delay_us, next.post_delay_us) {
                        break;
                    }
                }
            }
        }
        slot
    }

    /// Validate a packet against the queue and assign its final send time.
    /// Nothing is inserted.
    pub fn admit(
        &mut self,
        now: u32,
        mut packet: TransmitPacket,
        class: PacketClass,
    ) -> Result<ScheduledEntry, JitError> {
        if self.is_full() {
            return Err(JitError::Full);
        }
        if class == PacketClass::Beacon {
            if self.num_beacon >= self.beacon_target {
                return Err(JitError::Full);
            }
        } else {
            let reserved = self.beacon_target.saturating_sub(self.num_beacon);
            if self.entries.len() + reserved >= self.capacity {
                return Err(JitError::Full);
            }
        }

        let (pre, post) = match class {
            PacketClass::Beacon => (
                TX_START_DELAY_US + BEACON_GUARD_US + TX_JIT_DELAY_US,
                BEACON_RESERVED_US,
            ),
            _ => (TX_START_DELAY_US + TX_JIT_DELAY_US, time_on_air_us(&packet)),
        };

        self.sort(now);

        if class == PacketClass::ClassC {
            packet.count_us = self.asap_slot(now, pre, post);
            packet.tx_mode = TxMode::Timestamped;
        }

        let lead = packet.count_us.wrapping_sub(now);
        if lead <= TX_START_DELAY_US + TX_MARGIN_DELAY_US + TX_JIT_DELAY_US {
            return Err(JitError::TooLate);
        }
        if matches!(class, PacketClass::ClassA | PacketClass::ClassB) && lead > TX_MAX_ADVANCE_DELAY_US
        {
            return Err(JitError::TooEarly);
        }

        for e in &self.entries {
            let target_pre = match (class, e.class) {
                (PacketClass::ClassA | PacketClass::ClassC, PacketClass::Beacon) => TX_START_DELAY_US,
                _ => pre,
            };
            if collides(
                packet.count_us,
                target_pre,
                post,
                e.send_time(),
                e.pre_delay_us,
                e.post_delay_us,
            ) {
                return Err(match e.class {
                    PacketClass::Beacon => JitError::CollisionBeacon,
                    _ => JitError::CollisionPacket,
                });
            }
        }

        Ok(ScheduledEntry {
            class,
            packet,
            pre_delay_us: pre,
            post_delay_us: post,
        })
    }

    pub fn insert(&mut self, now: u32, entry: ScheduledEntry) {
        if entry.class == PacketClass::Beacon {
            self.num_beacon += 1;
        }
        self.entries.push(entry);
        self.sort(now);
    }

    /// Admit and insert, returning the assigned send time.
    pub fn enqueue(
        &mut self,
        now: u32,
        packet: TransmitPacket,
        class: PacketClass,
    ) -> Result<u32, JitError> {
        let entry = self.admit(now, packet, class)?;
        let t = entry.send_time();
        self.insert(now, entry);
        Ok(t)
    }

    /// Entries whose offset from `now` is beyond the maximum advance have
    /// already gone by.
    fn purge_outdated(&mut self, now: u32) {
        let before = self.entries.len();
        let mut beacons_dropped = 0;
        self.entries.retain(|e| {
            let keep = e.packet.count_us.wrapping_sub(now) < TX_MAX_ADVANCE_DELAY_US;
            if !keep {
                warn!("[JIT] dropping outdated {:?} packet scheduled at {} us", e.class, e.send_time());
                if e.class == PacketClass::Beacon {
                    beacons_dropped += 1;
                }
            }
            keep
        });
        self.num_beacon -= beacons_dropped.min(self.num_beacon);
        if self.entries.len() != before {
            self.sort(now);
        }
    }

    fn due_index(&self, now: u32) -> Option<usize> {
        let (idx, lead) = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, e)| (i, e.send_time().wrapping_sub(now)))
            .min_by_key(|(_, lead)| *lead)?;
        (lead < TX_JIT_DELAY_US).then_some(idx)
    }

    /// Next entry that must be handed to the radio now, if any.
    pub fn peek(&mut self, now: u32) -> Option<&ScheduledEntry> {
        self.purge_outdated(now);
        let idx = self.due_index(now)?;
        self.entries.get(idx)
    }

    pub fn pop(&mut self, now: u32) -> Option<ScheduledEntry> {
        self.purge_outdated(now);
        let idx = self.due_index(now)?;
        let entry = self.entries.remove(idx);
        if entry.class == PacketClass::Beacon {
            self.num_beacon = self.num_beacon.saturating_sub(1);
        }
        Some(entry)
    }
}

/// TX envelope of one RF chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxChainConfig {
    pub enabled: bool,
    pub freq_min_hz: u32,
    pub freq_max_hz: u32,
    /// Supported output powers in dBm
    pub power_lut: Vec<i8>,
}

impl Default for TxChainConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            freq_min_hz: 863_000_000,
            freq_max_hz: 870_000_000,
            power_lut: vec![0, 6, 10, 12, 14, 16, 20, 27],
        }
    }
}

/// Highest supported power not above `requested`, or the lowest one.
pub fn select_power(lut: &[i8], requested: i8) -> Option<i8> {
    let lowest = lut.iter().copied().min()?;
    Some(
        lut.iter()
            .copied()
            .filter(|p| *p <= requested)
            .max()
            .unwrap_or(lowest),
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnqueueOutcome {
    pub count_us: u32,
    /// Set when the requested power was replaced by a supported one
    pub power_adjusted: Option<i8>,
}

#[derive(Debug, Default)]
struct SchedulerStats {
    enqueued: u64,
    rejected: u64,
    transmitted: u64,
}

/// Per-chain JIT queues plus the checks that depend on the TX envelope.
pub struct JitScheduler {
    chains: Vec<TxChainConfig>,
    queues: Vec<Mutex<JitQueue>>,
    lbt: Option<Mutex<LbtGate>>,
    stats: Arc<Mutex<SchedulerStats>>,
}

impl JitScheduler {
    pub fn new(chains: Vec<TxChainConfig>, lbt: Option<LbtGate>) -> Self {
        let queues = chains.iter().map(|_| Mutex::new(JitQueue::default())).collect();
        Self {
            chains,
            queues,
            lbt: lbt.map(Mutex::new),
            stats: Arc::new(Mutex::new(SchedulerStats::default())),
        }
    }

    pub fn chain_count(&self) -> usize {
        self.chains.len()
    }

    pub async fn enqueue(
        &self,
        now: u32,
        packet: TransmitPacket,
        class: PacketClass,
    ) -> Result<EnqueueOutcome, JitError> {
        let result = self.try_enqueue(now, packet, class).await;
        let mut stats = self.stats.lock().await;
        match result {
            Ok(_) => stats.enqueued += 1,
            Err(_) => stats.rejected += 1,
        }
        result
    }

    async fn try_enqueue(
        &self,
        now: u32,
        mut packet: TransmitPacket,
        class: PacketClass,
    ) -> Result<EnqueueOutcome, JitError> {
        let chain_idx = packet.rf_chain as usize;
        let chain = self
            .chains
            .get(chain_idx)
            .filter(|c| c.enabled)
            .ok_or(JitError::Invalid)?;

        if packet.freq_hz < chain.freq_min_hz || packet.freq_hz > chain.freq_max_hz {
            warn!(
                "[JIT] unsupported frequency {} Hz (min {}, max {})",
                packet.freq_hz, chain.freq_min_hz, chain.freq_max_hz
            );
            return Err(JitError::TxFreq);
        }

        let power = select_power(&chain.power_lut, packet.rf_power).ok_or(JitError::TxPower)?;
        let power_adjusted = (power != packet.rf_power).then_some(power);
        if power_adjusted.is_some() {
            warn!(
                "[JIT] requested TX power {} dBm not supported, using {} dBm",
                packet.rf_power, power
            );
        }
        packet.rf_power = power;

        let mut queue = self.queues[chain_idx].lock().await;
        let entry = queue.admit(now, packet, class)?;
        if class != PacketClass::Beacon {
            if let Some(lbt) = &self.lbt {
                let mut gate = lbt.lock().await;
                if let Err(e) = gate.reserve(&entry.packet, now) {
                    warn!(
                        "[JIT] LBT: no free channel record, busy {:?}",
                        gate.busy_channels(now)
                    );
                    return Err(e);
                }
            }
        }

        let count_us = entry.send_time();
        queue.insert(now, entry);
        debug!(
            "[JIT] {:?} packet queued on chain {} at {} us (now {} us)",
            class, chain_idx, count_us, now
        );

        Ok(EnqueueOutcome {
            count_us,
            power_adjusted,
        })
    }

    pub async fn peek(&self, chain: usize, now: u32) -> Option<ScheduledEntry> {
        let mut queue = self.queues.get(chain)?.lock().await;
        queue.peek(now).cloned()
    }

    pub async fn pop(&self, chain: usize, now: u32) -> Option<ScheduledEntry> {
        self.queues.get(chain)?.lock().await.pop(now)
    }

    pub async fn beacon_count(&self, chain: usize) -> usize {
        match self.queues.get(chain) {
            Some(q) => q.lock().await.num_beacon(),
            None => 0,
        }
    }

    pub async fn queue_len(&self, chain: usize) -> usize {
        match self.queues.get(chain) {
            Some(q) => q.lock().await.len(),
            None => 0,
        }
    }

    /// Hand due packets to the concentrator until `stop` is raised.
    pub async fn run(&self, hal: Arc<dyn Concentrator>, stop: Arc<AtomicBool>) {
        let mut tick = interval(Duration::from_millis(10));
        info!("[JIT] transmit loop started");

        while !stop.load(Ordering::Relaxed) {
            tick.tick().await;

            let now = match hal.now_us().await {
                Ok(now) => now,
                Err(e) => {
                    warn!("[JIT] cannot read concentrator counter: {}", e);
                    continue;
                }
            };

            for chain in 0..self.chain_count() {
                while let Some(entry) = self.pop(chain, now).await {
                    match hal.send(&entry.packet).await {
                        Ok(()) => {
                            self.stats.lock().await.transmitted += 1;
                            debug!(
                                "[JIT] {:?} packet sent on chain {} for {} us",
                                entry.class,
                                chain,
                                entry.send_time()
                            );
                        }
                        Err(e) => warn!("[JIT] transmit failed on chain {}: {}", chain, e),
                    }
                }
            }
        }

        info!("[JIT] transmit loop stopped");
    }

    pub async fn get_stats(&self) -> (u64, u64, u64) {
        let stats = self.stats.lock().await;
        (stats.enqueued, stats.rejected, stats.transmitted)
    }
}

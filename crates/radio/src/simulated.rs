//! Simulated concentrator for testing and the demo binary

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, trace};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::hal::Concentrator;
use crate::packet::{ReceivedPacket, TransmitPacket, MAX_PAYLOAD_LEN};
use crate::RadioError;

pub struct SimulatedConcentrator {
    offset_us: AtomicU32,
    started: Option<Instant>,
    rx_queue: Arc<Mutex<VecDeque<ReceivedPacket>>>,
    transmitted: Arc<Mutex<Vec<TransmitPacket>>>,
    stats: Arc<Mutex<ConcentratorStats>>,
}

#[derive(Debug, Default)]
struct ConcentratorStats {
    packets_received: u64,
    packets_sent: u64,
    bytes_sent: u64,
}

impl SimulatedConcentrator {
    /// Counter only moves through `set_time`/`advance`
    pub fn new() -> Self {
        Self::with_clock(None)
    }

    /// Counter follows the tokio clock
    pub fn free_running() -> Self {
        Self::with_clock(Some(Instant::now()))
    }

    fn with_clock(started: Option<Instant>) -> Self {
        Self {
            offset_us: AtomicU32::new(0),
            started,
            rx_queue: Arc::new(Mutex::new(VecDeque::new())),
            transmitted: Arc::new(Mutex::new(Vec::new())),
            stats: Arc::new(Mutex::new(ConcentratorStats::default())),
        }
    }

    fn counter(&self) -> u32 {
        let elapsed = self
            .started
            .map(|s| s.elapsed().as_micros() as u32)
            .unwrap_or(0);
        self.offset_us.load(Ordering::Relaxed).wrapping_add(elapsed)
    }

    pub fn set_time(&self, count_us: u32) {
        let elapsed = self.counter().wrapping_sub(self.offset_us.load(Ordering::Relaxed));
        self.offset_us
            .store(count_us.wrapping_sub(elapsed), Ordering::Relaxed);
    }

    pub fn advance(&self, us: u32) {
        let _ = self
            .offset_us
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |o| {
                Some(o.wrapping_add(us))
            });
    }

    /// Queue a packet as if the radio had just demodulated it.
    pub async fn inject(&self, pkt: ReceivedPacket) {
        self.rx_queue.lock().await.push_back(pkt);
    }

    pub async fn transmitted(&self) -> Vec<TransmitPacket> {
        self.transmitted.lock().await.clone()
    }

    pub async fn get_stats(&self) -> (u64, u64, u64) {
        let stats = self.stats.lock().await;
        (stats.packets_received, stats.packets_sent, stats.bytes_sent)
    }
}

impl Default for SimulatedConcentrator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Concentrator for SimulatedConcentrator {
    async fn now_us(&self) -> Result<u32, RadioError> {
        Ok(self.counter())
    }

    async fn receive(&self, max: usize) -> Result<Vec<ReceivedPacket>, RadioError> {
        let batch: Vec<_> = {
            let mut queue = self.rx_queue.lock().await;
            let n = max.min(queue.len());
            queue.drain(..n).collect()
        };

        if !batch.is_empty() {
            let mut stats = self.stats.lock().await;
            stats.packets_received += batch.len() as u64;
            trace!("Simulated receive of {} packets", batch.len());
        }
        Ok(batch)
    }

    async fn send(&self, pkt: &TransmitPacket) -> Result<(), RadioError> {
        if pkt.size() > MAX_PAYLOAD_LEN {
            return Err(RadioError::InvalidParameter("payload size"));
        }

        debug!(
            "Simulated transmission at {} us on {} Hz, {} bytes",
            pkt.count_us,
            pkt.freq_hz,
            pkt.size()
        );
        self.transmitted.lock().await.push(pkt.clone());

        let mut stats = self.stats.lock().await;
        stats.packets_sent += 1;
        stats.bytes_sent += pkt.size() as u64;
        Ok(())
    }
}

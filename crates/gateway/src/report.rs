//! Per-service traffic counters and the periodic status report

use chrono::{DateTime, Utc};
use log::info;

use lora_fwd_radio::Coordinates;

use crate::protocol::Stat;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpstreamCounters {
    pub rx_received: u32,
    pub rx_ok: u32,
    pub rx_bad: u32,
    pub rx_nocrc: u32,
    pub filtered: u32,
    pub forwarded: u32,
    pub payload_bytes: u64,
    pub datagrams_sent: u32,
    pub network_bytes: u64,
    pub acks_received: u32,
    /// Sum and maximum of PUSH_ACK round trips, milliseconds
    pub ack_rtt_ms_total: u64,
    pub ack_rtt_ms_max: u32,
}

impl UpstreamCounters {
    pub fn record_ack(&mut self, rtt_ms: u32) {
        self.acks_received += 1;
        self.ack_rtt_ms_total += rtt_ms as u64;
        self.ack_rtt_ms_max = self.ack_rtt_ms_max.max(rtt_ms);
    }

    pub fn mean_ack_rtt_ms(&self) -> Option<u64> {
        (self.acks_received > 0).then(|| self.ack_rtt_ms_total / self.acks_received as u64)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DownstreamCounters {
    pub pull_sent: u32,
    pub acks_received: u32,
    pub datagrams_received: u32,
    pub network_bytes: u64,
    pub payload_bytes: u64,
    pub tx_requested: u32,
    pub tx_accepted: u32,
    pub tx_rejected: u32,
    pub beacons_queued: u32,
    pub beacons_rejected: u32,
}

/// Counters since the last report plus the stat object waiting for the
/// next uplink datagram.
#[derive(Debug, Default)]
pub struct ServiceReport {
    pub up: UpstreamCounters,
    pub down: DownstreamCounters,
    pub last_ack: Option<DateTime<Utc>>,
    pending_stat: Option<Stat>,
}

impl ServiceReport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Turn the counters into a stat object and reset them.
    pub fn build_stat(&mut self, now: DateTime<Utc>, position: Option<Coordinates>) -> Stat {
        let up = std::mem::take(&mut self.up);
        let down = std::mem::take(&mut self.down);

        let ackr = if up.datagrams_sent > 0 {
            100.0 * up.acks_received as f64 / up.datagrams_sent as f64
        } else {
            0.0
        };

        Stat {
            time: now.format("%Y-%m-%d %H:%M:%S GMT").to_string(),
            lati: position.map(|p| p.lat),
            long: position.map(|p| p.lon),
            alti: position.map(|p| p.alt),
            rxnb: up.rx_received,
            rxok: up.rx_ok,
            rxfw: up.forwarded,
            ackr,
            dwnb: down.datagrams_received,
            txnb: down.tx_accepted,
        }
    }

    /// Log and stage a report for the uplink path.
    pub fn publish(&mut self, service: &str, now: DateTime<Utc>, position: Option<Coordinates>) {
        let up = self.up;
        let down = self.down;
        info!(
            "[{}] upstream: {} received ({} ok, {} bad, {} no CRC), {} filtered, {} forwarded, {} datagrams, {} acks (RTT mean {} ms, max {} ms)",
            service,
            up.rx_received,
            up.rx_ok,
            up.rx_bad,
            up.rx_nocrc,
            up.filtered,
            up.forwarded,
            up.datagrams_sent,
            up.acks_received,
            up.mean_ack_rtt_ms().unwrap_or(0),
            up.ack_rtt_ms_max
        );
        info!(
            "[{}] downstream: {} PULL_DATA, {} acks, {} datagrams, {} TX requested ({} ok, {} rejected), beacons {} queued {} rejected",
            service,
            down.pull_sent,
            down.acks_received,
            down.datagrams_received,
            down.tx_requested,
            down.tx_accepted,
            down.tx_rejected,
            down.beacons_queued,
            down.beacons_rejected
        );

        let stat = self.build_stat(now, position);
        self.pending_stat = Some(stat);
    }

    pub fn take_stat(&mut self) -> Option<Stat> {
        self.pending_stat.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_stat_from_counters() {
        let mut report = ServiceReport::new();
        report.up.rx_received = 10;
        report.up.rx_ok = 8;
        report.up.forwarded = 7;
        report.up.datagrams_sent = 4;
        report.up.acks_received = 3;
        report.down.datagrams_received = 2;
        report.down.tx_accepted = 1;

        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 5).unwrap();
        let pos = Coordinates {
            lat: 46.1,
            lon: 6.2,
            alt: 400,
        };
        report.publish("ttn", now, Some(pos));

        let stat = report.take_stat().unwrap();
        assert_eq!(stat.time, "2024-03-01 12:30:05 GMT");
        assert_eq!((stat.rxnb, stat.rxok, stat.rxfw), (10, 8, 7));
        assert_eq!(stat.ackr, 75.0);
        assert_eq!((stat.dwnb, stat.txnb), (2, 1));
        assert_eq!(stat.alti, Some(400));

        // counters restart after a report
        assert_eq!(report.up, UpstreamCounters::default());
        assert!(report.take_stat().is_none());
    }

    #[test]
    fn test_ack_round_trips() {
        let mut up = UpstreamCounters::default();
        assert_eq!(up.mean_ack_rtt_ms(), None);
        up.record_ack(10);
        up.record_ack(30);
        assert_eq!(up.acks_received, 2);
        assert_eq!(up.mean_ack_rtt_ms(), Some(20));
        assert_eq!(up.ack_rtt_ms_max, 30);
    }

    #[test]
    fn test_ack_ratio_without_traffic() {
        let mut report = ServiceReport::new();
        let stat = report.build_stat(Utc::now(), None);
        assert_eq!(stat.ackr, 0.0);
        assert!(stat.lati.is_none());
    }
}

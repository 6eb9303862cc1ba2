//! Class B beacon construction and JIT pre-allocation

use std::time::Duration;

use crc::{Crc, CRC_16_XMODEM};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::gps::{Coordinates, GpsClock, GpsTimeReference};
use crate::hal::Concentrator;
use crate::packet::{Bandwidth, CodingRate, DataRate, SpreadingFactor, TransmitPacket, TxMode};
use crate::scheduler::{JitError, JitScheduler, PacketClass, JIT_NUM_BEACON_IN_QUEUE};
use crate::RadioError;

const CCITT: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// Bound on enqueue attempts per fill call; retries carry over to the next call.
const MAX_ATTEMPTS_PER_FILL: usize = 8;

/// CRC-16/CCITT, polynomial 0x1021, initial value 0, MSB first
pub fn crc16(data: &[u8]) -> u16 {
    CCITT.checksum(data)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BeaconConfig {
    /// Seconds between beacons, 0 disables beaconing
    pub period_s: u32,
    pub freq_hz: u32,
    pub freq_nb: u8,
    pub freq_step_hz: u32,
    pub datarate: u8,
    pub bw_hz: u32,
    pub power: i8,
    pub infodesc: u8,
}

impl Default for BeaconConfig {
    fn default() -> Self {
        Self {
            period_s: 0,
            freq_hz: 869_525_000,
            freq_nb: 1,
            freq_step_hz: 0,
            datarate: 9,
            bw_hz: 125_000,
            power: 14,
            infodesc: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BeaconFill {
    pub queued: u32,
    pub rejected: u32,
}

fn fixed_point(degrees: f64, span: f64) -> i32 {
    let v = (degrees / span * (1u32 << 23) as f64) as i32;
    v.clamp(-0x80_0000, 0x7F_FFFF)
}

pub struct BeaconGenerator {
    config: BeaconConfig,
    rfu1: usize,
    rfu2: usize,
    sf: SpreadingFactor,
    bw: Bandwidth,
    lat: i32,
    lon: i32,
    last_gps_s: Option<u64>,
    retry: u64,
}

impl BeaconGenerator {
    pub fn new(config: BeaconConfig, coords: Coordinates) -> Result<Self, RadioError> {
        let (rfu1, rfu2) = match config.datarate {
            8 => (1, 3),
            9 => (2, 0),
            10 => (3, 1),
            12 => (5, 3),
            _ => return Err(RadioError::InvalidParameter("beacon datarate")),
        };
        let bw = match config.bw_hz {
            125_000 => Bandwidth::Bw125,
            500_000 => Bandwidth::Bw500,
            _ => return Err(RadioError::InvalidParameter("beacon bandwidth")),
        };

        Ok(Self {
            sf: SpreadingFactor::from_value(config.datarate)?,
            bw,
            rfu1,
            rfu2,
            lat: fixed_point(coords.lat, 90.0),
            lon: fixed_point(coords.lon, 180.0),
            config,
            last_gps_s: None,
            retry: 0,
        })
    }

    pub fn enabled(&self) -> bool {
        self.config.period_s > 0
    }

    pub fn payload_len(&self) -> usize {
        self.rfu1 + 4 + 2 + 7 + self.rfu2 + 2
    }

    pub fn build_payload(&self, gps_s: u64) -> Vec<u8> {
        let mut p = Vec::with_capacity(self.payload_len());
        p.resize(self.rfu1, 0);
        p.extend_from_slice(&(gps_s as u32).to_le_bytes());
        let crc1 = crc16(&p);
        p.extend_from_slice(&crc1.to_le_bytes());

        let gw_start = p.len();
        p.push(self.config.infodesc);
        p.extend_from_slice(&self.lat.to_le_bytes()[..3]);
        p.extend_from_slice(&self.lon.to_le_bytes()[..3]);
        p.resize(p.len() + self.rfu2, 0);
        let crc2 = crc16(&p[gw_start..]);
        p.extend_from_slice(&crc2.to_le_bytes());
        p
    }

    /// GPS second of the next beacon to queue.
    pub fn next_beacon_time(&self, gps_now_s: u64) -> u64 {
        let period = self.config.period_s.max(1) as u64;
        let base = match self.last_gps_s {
            Some(last) if last + period > gps_now_s => last + period,
            _ => gps_now_s + (period - gps_now_s % period),
        };
        base + self.retry * period
    }

    pub fn frequency(&self, gps_s: u64) -> u32 {
        let chan = if self.config.freq_nb > 1 {
            (gps_s / self.config.period_s.max(1) as u64) % self.config.freq_nb as u64
        } else {
            0
        };
        self.config.freq_hz + chan as u32 * self.config.freq_step_hz
    }

    pub fn packet_for(&self, gps_s: u64, reference: &GpsTimeReference) -> TransmitPacket {
        TransmitPacket {
            freq_hz: self.frequency(gps_s),
            tx_mode: TxMode::OnGps,
            count_us: reference.gps_to_count(Duration::from_secs(gps_s)),
            rf_chain: 0,
            rf_power: self.config.power,
            datarate: DataRate::Lora(self.sf, self.bw),
            coderate: CodingRate::Cr4_5,
            invert_pol: false,
            f_dev: 0,
            preamble: 10,
            no_crc: true,
            no_header: true,
            payload: self.build_payload(gps_s),
        }
    }

    /// Queue beacons on chain 0 until the reserved beacon slots are used.
    /// Stops early when GPS time is not valid.
    pub async fn fill(
        &mut self,
        scheduler: &JitScheduler,
        hal: &dyn Concentrator,
        gps: &GpsClock,
    ) -> BeaconFill {
        let mut result = BeaconFill::default();
        if !self.enabled() {
            return result;
        }

        for _ in 0..MAX_ATTEMPTS_PER_FILL {
            if scheduler.beacon_count(0).await >= JIT_NUM_BEACON_IN_QUEUE {
                break;
            }
            let Some(reference) = gps.reference().await else {
                break;
            };

            let next = self.next_beacon_time(reference.gps.as_secs());
            let pkt = self.packet_for(next, &reference);
            let now = match hal.now_us().await {
                Ok(now) => now,
                Err(e) => {
                    warn!("[BEACON] cannot read concentrator counter: {}", e);
                    break;
                }
            };

            let (count_us, freq_hz) = (pkt.count_us, pkt.freq_hz);
            let payload = pkt.payload.clone();
            match scheduler.enqueue(now, pkt, PacketClass::Beacon).await {
                Ok(_) => {
                    result.queued += 1;
                    self.retry = 0;
                    self.last_gps_s = Some(next);
                    info!(
                        "[BEACON] queued for GPS {} s (count_us={}, freq_hz={}, size={}): {}",
                        next,
                        count_us,
                        freq_hz,
                        payload.len(),
                        payload.iter().map(|b| format!("{:02X}", b)).collect::<Vec<_>>().join(" ")
                    );
                }
                Err(e) => {
                    if e != JitError::CollisionBeacon {
                        result.rejected += 1;
                    }
                    self.retry += 1;
                    debug!("[BEACON] queuing failed with {}, retry {}", e, self.retry);
                }
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::TxChainConfig;
    use crate::simulated::SimulatedConcentrator;

    fn generator(datarate: u8) -> BeaconGenerator {
        let config = BeaconConfig {
            period_s: 128,
            datarate,
            ..Default::default()
        };
        BeaconGenerator::new(config, Coordinates { lat: 45.0, lon: -90.0, alt: 0 }).unwrap()
    }

    #[test]
    fn test_crc16_vectors() {
        assert_eq!(crc16(&[]), 0x0000);
        assert_eq!(crc16(b"123456789"), 0x31C3);
    }

    #[test]
    fn test_payload_layout_sf9() {
        let g = generator(9);
        let p = g.build_payload(0x1234_5678);
        assert_eq!(p.len(), 17);
        assert_eq!(&p[..2], &[0, 0]);
        assert_eq!(&p[2..6], &[0x78, 0x56, 0x34, 0x12]);
        assert_eq!(u16::from_le_bytes([p[6], p[7]]), crc16(&p[..6]));
        assert_eq!(p[8], 0);
        // 45 deg N is 2^22, 90 deg W is -2^22
        assert_eq!(&p[9..12], &[0x00, 0x00, 0x40]);
        assert_eq!(&p[12..15], &[0x00, 0x00, 0xC0]);
        assert_eq!(u16::from_le_bytes([p[15], p[16]]), crc16(&p[8..15]));
    }

    #[test]
    fn test_payload_sizes_per_datarate() {
        assert_eq!(generator(8).payload_len(), 19);
        assert_eq!(generator(10).payload_len(), 19);
        assert_eq!(generator(12).payload_len(), 23);
        assert!(BeaconGenerator::new(
            BeaconConfig {
                datarate: 7,
                ..Default::default()
            },
            Coordinates::default()
        )
        .is_err());
    }

    #[test]
    fn test_coordinates_clamp() {
        assert_eq!(fixed_point(90.0, 90.0), 0x7F_FFFF);
        assert_eq!(fixed_point(-180.0, 180.0), -0x80_0000);
    }

    #[test]
    fn test_next_time_and_hopping() {
        let mut g = generator(9);
        assert_eq!(g.next_beacon_time(1_000), 1_024);
        assert_eq!(g.next_beacon_time(1_024), 1_152);

        g.last_gps_s = Some(1_152);
        assert_eq!(g.next_beacon_time(1_100), 1_280);
        g.retry = 2;
        assert_eq!(g.next_beacon_time(1_100), 1_536);

        // a stale reference falls back to the current time
        g.retry = 0;
        assert_eq!(g.next_beacon_time(5_000), 5_120);

        g.config.freq_nb = 8;
        g.config.freq_step_hz = 200_000;
        assert_eq!(g.frequency(128 * 3), 869_525_000 + 3 * 200_000);
        assert_eq!(g.frequency(128 * 9), 869_525_000 + 200_000);
    }

    #[tokio::test]
    async fn test_fill_reserves_beacon_slots() {
        let scheduler = JitScheduler::new(vec![TxChainConfig::default()], None);
        let radio = SimulatedConcentrator::new();
        let gps = GpsClock::new();
        let mut g = generator(9);

        assert_eq!(g.fill(&scheduler, &radio, &gps).await, BeaconFill::default());

        gps.update(GpsTimeReference::new(0, Duration::from_secs(1_000_000_100), 1.0))
            .await;
        let fill = g.fill(&scheduler, &radio, &gps).await;
        assert_eq!(fill, BeaconFill { queued: 3, rejected: 0 });
        assert_eq!(scheduler.beacon_count(0).await, 3);

        let first = scheduler.peek(0, 28_000_000 - 30_000).await.unwrap();
        assert_eq!(first.class, PacketClass::Beacon);
        assert_eq!(first.packet.payload.len(), 17);

        assert_eq!(g.fill(&scheduler, &radio, &gps).await, BeaconFill::default());
    }

    #[tokio::test]
    async fn test_fill_retries_one_period_later() {
        let scheduler = JitScheduler::new(vec![TxChainConfig::default()], None);
        let radio = SimulatedConcentrator::new();
        let gps = GpsClock::new();
        gps.update(GpsTimeReference::new(0, Duration::from_secs(1_000_000_100), 1.0))
            .await;

        let blocker = TransmitPacket {
            count_us: 28_000_000,
            payload: vec![0; 10],
            ..Default::default()
        };
        scheduler.enqueue(0, blocker, PacketClass::ClassA).await.unwrap();

        let mut g = generator(9);
        let fill = g.fill(&scheduler, &radio, &gps).await;
        assert_eq!(fill, BeaconFill { queued: 3, rejected: 1 });
        assert_eq!(g.last_gps_s, Some(1_000_000_100 + 28 + 3 * 128));
    }
}

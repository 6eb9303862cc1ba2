//! Listen-before-talk channel reservations

use log::debug;

use crate::packet::TransmitPacket;
use crate::scheduler::JitError;

pub const DEFAULT_LBT_SLOTS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LbtRecord {
    pub freq_hz: u32,
    pub count_us: u32,
    pub busy: bool,
}

/// Fixed ring of "channel busy until" records. A record is reusable once
/// its transmit time has passed.
#[derive(Debug, Clone)]
pub struct LbtGate {
    records: Vec<LbtRecord>,
}

impl LbtGate {
    pub fn new(slots: usize) -> Self {
        Self {
            records: vec![LbtRecord::default(); slots],
        }
    }

    fn is_free(record: &LbtRecord, now: u32) -> bool {
        !record.busy || (now.wrapping_sub(record.count_us) as i32) > 0
    }

    /// Claim a record for `pkt`. Never blocks; `Full` when every record is
    /// still ahead of `now`.
    pub fn reserve(&mut self, pkt: &TransmitPacket, now: u32) -> Result<usize, JitError> {
        let slot = self
            .records
            .iter()
            .position(|r| Self::is_free(r, now))
            .ok_or(JitError::Full)?;

        self.records[slot] = LbtRecord {
            freq_hz: pkt.freq_hz,
            count_us: pkt.count_us,
            busy: true,
        };
        debug!(
            "[LBT] slot {} reserved for {} Hz at {} us",
            slot, pkt.freq_hz, pkt.count_us
        );
        Ok(slot)
    }

    /// Frequencies still reserved at `now`
    pub fn busy_channels(&self, now: u32) -> Vec<u32> {
        self.records
            .iter()
            .filter(|r| !Self::is_free(r, now))
            .map(|r| r.freq_hz)
            .collect()
    }
}

impl Default for LbtGate {
    fn default() -> Self {
        Self::new(DEFAULT_LBT_SLOTS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(count_us: u32) -> TransmitPacket {
        TransmitPacket {
            count_us,
            ..Default::default()
        }
    }

    #[test]
    fn test_full_when_all_slots_ahead() {
        let mut gate = LbtGate::new(2);
        assert_eq!(gate.reserve(&at(1_000), 0), Ok(0));
        assert_eq!(gate.reserve(&at(2_000), 0), Ok(1));
        assert_eq!(gate.reserve(&at(3_000), 0), Err(JitError::Full));
        assert_eq!(gate.busy_channels(0).len(), 2);
    }

    #[test]
    fn test_slots_recycle_after_transmit_time() {
        let mut gate = LbtGate::new(1);
        gate.reserve(&at(1_000), 0).unwrap();
        assert_eq!(gate.reserve(&at(5_000), 1_001), Ok(0));
        assert!(gate.busy_channels(1_001).contains(&868_100_000));
        assert!(gate.busy_channels(5_001).is_empty());
    }
}

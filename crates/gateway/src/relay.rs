//! Relay framing on the dedicated relay IF chain

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use lora_fwd_radio::ReceivedPacket;

pub const RELAY_IF_CHAIN: u8 = 8;
/// Flag in the first relay header byte marking relay downlink traffic
pub const RELAY_DN: u8 = 0x80;
/// Flag byte plus the little-endian counter of the original reception
pub const RELAY_HEADER_LEN: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// This gateway repeats traffic for another one
    pub as_relay: bool,
    /// A relay feeds this gateway
    pub has_relay: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct RelayTransform {
    config: RelayConfig,
}

impl RelayTransform {
    pub fn new(config: RelayConfig) -> Self {
        Self { config }
    }

    pub fn active(&self) -> bool {
        self.config.as_relay || self.config.has_relay
    }

    /// Drop or rewrite relay-chain packets. Packets from other IF chains
    /// pass unchanged.
    pub fn apply(&self, batch: Vec<ReceivedPacket>) -> Vec<ReceivedPacket> {
        if !self.active() {
            return batch;
        }
        batch.into_iter().filter_map(|p| self.apply_one(p)).collect()
    }

    fn apply_one(&self, mut pkt: ReceivedPacket) -> Option<ReceivedPacket> {
        if pkt.if_chain != RELAY_IF_CHAIN {
            return Some(pkt);
        }
        if self.config.as_relay {
            debug!("[RELAY] dropping relay chain packet while acting as relay");
            return None;
        }
        if pkt.payload.first().is_some_and(|b| b & RELAY_DN != 0) {
            debug!("[RELAY] dropping relayed downlink");
            return None;
        }
        if self.config.has_relay {
            if pkt.payload.len() < RELAY_HEADER_LEN {
                warn!(
                    "[RELAY] relayed packet shorter than its header ({} bytes)",
                    pkt.payload.len()
                );
                return None;
            }
            let counter = [pkt.payload[1], pkt.payload[2], pkt.payload[3], pkt.payload[4]];
            pkt.count_us = u32::from_le_bytes(counter);
            pkt.payload.drain(..RELAY_HEADER_LEN);
        }
        Some(pkt)
    }
}

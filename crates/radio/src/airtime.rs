//! Time-on-air estimation

use std::time::Duration;

use crate::packet::{Bandwidth, DataRate, SpreadingFactor, TransmitPacket};

/// Air time of a packet in microseconds, rounded up.
pub fn time_on_air_us(pkt: &TransmitPacket) -> u32 {
    match pkt.datarate {
        DataRate::Lora(sf, bw) => lora_time_on_air_us(pkt, sf, bw),
        DataRate::Fsk(bps) => {
            if bps == 0 {
                return 0;
            }
            // preamble + 3 byte sync word + length byte + payload + CRC
            let crc = if pkt.no_crc { 0 } else { 2 };
            let bytes = pkt.preamble as u64 + 3 + 1 + pkt.size() as u64 + crc;
            ((bytes * 8 * 1_000_000).div_ceil(bps as u64)) as u32
        }
    }
}

pub fn time_on_air(pkt: &TransmitPacket) -> Duration {
    Duration::from_micros(time_on_air_us(pkt) as u64)
}

fn lora_time_on_air_us(pkt: &TransmitPacket, sf: SpreadingFactor, bw: Bandwidth) -> u32 {
    let sf_v = sf.value() as f64;
    let low_dr_opt = sf.value() >= 11 && bw == Bandwidth::Bw125;
    let de = if low_dr_opt { 1.0 } else { 0.0 };
    let h = if pkt.no_header { 1.0 } else { 0.0 };
    let crc = if pkt.no_crc { 0.0 } else { 1.0 };
    let cr = pkt.coderate.redundancy().max(1) as f64;

    let t_sym_us = (1u32 << sf.value()) as f64 * 1e6 / bw.hz() as f64;
    let t_preamble_us = (pkt.preamble as f64 + 4.25) * t_sym_us;

    let num = 8.0 * pkt.size() as f64 - 4.0 * sf_v + 28.0 + 16.0 * crc - 20.0 * h;
    let den = 4.0 * (sf_v - 2.0 * de);
    let payload_symbols = 8.0 + ((num / den).ceil() * (cr + 4.0)).max(0.0);

    (t_preamble_us + payload_symbols * t_sym_us).ceil() as u32
}

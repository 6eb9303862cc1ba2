//! Radio packet model shared by capture, scheduling and the wire protocol

use std::fmt;
use std::str::FromStr;

use crate::RadioError;

pub const MAX_PAYLOAD_LEN: usize = 256;

pub const STD_LORA_PREAMBLE: u16 = 8;
pub const MIN_LORA_PREAMBLE: u16 = 6;
pub const STD_FSK_PREAMBLE: u16 = 5;
pub const MIN_FSK_PREAMBLE: u16 = 3;

/// Declares an enum together with its one-to-one wire spelling.
macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $($variant:ident => $wire:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $wire),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = RadioError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($wire => Ok($name::$variant),)+
                    _ => Err(RadioError::UnknownWireName {
                        kind: stringify!($name),
                        value: s.to_string(),
                    }),
                }
            }
        }
    };
}

wire_enum! {
    pub enum SpreadingFactor {
        Sf5 => "SF5",
        Sf6 => "SF6",
        Sf7 => "SF7",
        Sf8 => "SF8",
        Sf9 => "SF9",
        Sf10 => "SF10",
        Sf11 => "SF11",
        Sf12 => "SF12",
    }
}

wire_enum! {
    pub enum Bandwidth {
        Bw125 => "BW125",
        Bw250 => "BW250",
        Bw500 => "BW500",
    }
}

wire_enum! {
    pub enum CodingRate {
        Cr4_5 => "4/5",
        Cr4_6 => "4/6",
        Cr4_7 => "4/7",
        Cr4_8 => "4/8",
        Off => "OFF",
    }
}

wire_enum! {
    pub enum Modulation {
        Lora => "LORA",
        Fsk => "FSK",
    }
}

wire_enum! {
    /// `stat` field of an rxpk object
    pub enum CrcStatus {
        Ok => "1",
        Bad => "-1",
        NoCrc => "0",
    }
}

wire_enum! {
    /// Timing selector of a txpk object
    pub enum TxMode {
        Immediate => "imme",
        Timestamped => "tmst",
        OnGps => "tmms",
    }
}

impl SpreadingFactor {
    pub fn value(&self) -> u8 {
        match self {
            SpreadingFactor::Sf5 => 5,
            SpreadingFactor::Sf6 => 6,
            SpreadingFactor::Sf7 => 7,
            SpreadingFactor::Sf8 => 8,
            SpreadingFactor::Sf9 => 9,
            SpreadingFactor::Sf10 => 10,
            SpreadingFactor::Sf11 => 11,
            SpreadingFactor::Sf12 => 12,
        }
    }

    pub fn from_value(sf: u8) -> Result<Self, RadioError> {
        Self::ALL
            .iter()
            .copied()
            .find(|s| s.value() == sf)
            .ok_or(RadioError::InvalidParameter("spreading factor"))
    }
}

impl Bandwidth {
    pub fn hz(&self) -> u32 {
        match self {
            Bandwidth::Bw125 => 125_000,
            Bandwidth::Bw250 => 250_000,
            Bandwidth::Bw500 => 500_000,
        }
    }

    pub fn from_hz(hz: u32) -> Result<Self, RadioError> {
        Self::ALL
            .iter()
            .copied()
            .find(|b| b.hz() == hz)
            .ok_or(RadioError::InvalidParameter("bandwidth"))
    }
}

impl CodingRate {
    /// The `n` in 4/(4+n); zero when the code is disabled
    pub fn redundancy(&self) -> u8 {
        match self {
            CodingRate::Cr4_5 => 1,
            CodingRate::Cr4_6 => 2,
            CodingRate::Cr4_7 => 3,
            CodingRate::Cr4_8 => 4,
            CodingRate::Off => 0,
        }
    }

    /// Accepts the canonical spelling plus the legacy `2/3` and `1/2` forms.
    pub fn parse_lenient(s: &str) -> Result<Self, RadioError> {
        match s {
            "2/3" => Ok(CodingRate::Cr4_6),
            "1/2" => Ok(CodingRate::Cr4_8),
            other => other.parse(),
        }
    }
}

impl CrcStatus {
    pub fn stat(&self) -> i8 {
        match self {
            CrcStatus::Ok => 1,
            CrcStatus::Bad => -1,
            CrcStatus::NoCrc => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataRate {
    Lora(SpreadingFactor, Bandwidth),
    /// Bits per second
    Fsk(u32),
}

impl DataRate {
    pub fn modulation(&self) -> Modulation {
        match self {
            DataRate::Lora(..) => Modulation::Lora,
            DataRate::Fsk(_) => Modulation::Fsk,
        }
    }

    /// Parse `SF<n>BW<k>`
    pub fn parse_lora(s: &str) -> Result<Self, RadioError> {
        let invalid = || RadioError::UnknownWireName {
            kind: "DataRate",
            value: s.to_string(),
        };
        let split = s.find("BW").ok_or_else(invalid)?;
        let sf: SpreadingFactor = s[..split].parse().map_err(|_| invalid())?;
        let bw: Bandwidth = s[split..].parse().map_err(|_| invalid())?;
        Ok(DataRate::Lora(sf, bw))
    }
}

impl fmt::Display for DataRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataRate::Lora(sf, bw) => write!(f, "{}{}", sf, bw),
            DataRate::Fsk(bps) => write!(f, "{}", bps),
        }
    }
}

/// A packet as captured by the concentrator
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedPacket {
    pub freq_hz: u32,
    pub if_chain: u8,
    pub rf_chain: u8,
    pub modem_id: u8,
    pub count_us: u32,
    pub status: CrcStatus,
    pub datarate: DataRate,
    pub coderate: CodingRate,
    pub rssi_channel: f32,
    pub rssi_signal: f32,
    pub snr: f32,
    pub freq_offset: i32,
    pub payload: Vec<u8>,
}

impl ReceivedPacket {
    pub fn size(&self) -> usize {
        self.payload.len()
    }

    pub fn modulation(&self) -> Modulation {
        self.datarate.modulation()
    }
}

impl Default for ReceivedPacket {
    fn default() -> Self {
        Self {
            freq_hz: 868_100_000,
            if_chain: 0,
            rf_chain: 0,
            modem_id: 0,
            count_us: 0,
            status: CrcStatus::Ok,
            datarate: DataRate::Lora(SpreadingFactor::Sf7, Bandwidth::Bw125),
            coderate: CodingRate::Cr4_5,
            rssi_channel: -60.0,
            rssi_signal: -61.0,
            snr: 9.5,
            freq_offset: 0,
            payload: Vec::new(),
        }
    }
}

/// A packet to be keyed by the concentrator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransmitPacket {
    pub freq_hz: u32,
    pub tx_mode: TxMode,
    pub count_us: u32,
    pub rf_chain: u8,
    pub rf_power: i8,
    pub datarate: DataRate,
    pub coderate: CodingRate,
    pub invert_pol: bool,
    /// FSK frequency deviation in kHz
    pub f_dev: u8,
    pub preamble: u16,
    pub no_crc: bool,
    pub no_header: bool,
    pub payload: Vec<u8>,
}

impl TransmitPacket {
    pub fn size(&self) -> usize {
        self.payload.len()
    }

    pub fn modulation(&self) -> Modulation {
        self.datarate.modulation()
    }
}

impl Default for TransmitPacket {
    fn default() -> Self {
        Self {
            freq_hz: 868_100_000,
            tx_mode: TxMode::Timestamped,
            count_us: 0,
            rf_chain: 0,
            rf_power: 14,
            datarate: DataRate::Lora(SpreadingFactor::Sf7, Bandwidth::Bw125),
            coderate: CodingRate::Cr4_5,
            invert_pol: true,
            f_dev: 0,
            preamble: STD_LORA_PREAMBLE,
            no_crc: false,
            no_header: false,
            payload: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn assert_total<T>(all: &[T])
    where
        T: Copy + PartialEq + fmt::Debug + fmt::Display + FromStr,
        <T as FromStr>::Err: fmt::Debug,
    {
        let names: HashSet<String> = all.iter().map(|v| v.to_string()).collect();
        assert_eq!(names.len(), all.len(), "wire names must be distinct");
        for v in all {
            let back: T = v.to_string().parse().unwrap();
            assert_eq!(back, *v);
        }
    }

    #[test]
    fn test_wire_tables_are_total() {
        assert_total(SpreadingFactor::ALL);
        assert_total(Bandwidth::ALL);
        assert_total(CodingRate::ALL);
        assert_total(Modulation::ALL);
        assert_total(CrcStatus::ALL);
        assert_total(TxMode::ALL);
        assert_eq!(SpreadingFactor::ALL.len(), 8);
    }

    #[test]
    fn test_unknown_names_rejected() {
        assert!("SF13".parse::<SpreadingFactor>().is_err());
        assert!("BW62".parse::<Bandwidth>().is_err());
        assert!("lora".parse::<Modulation>().is_err());
    }

    #[test]
    fn test_coding_rate_aliases() {
        assert_eq!(CodingRate::parse_lenient("2/3").unwrap(), CodingRate::Cr4_6);
        assert_eq!(CodingRate::parse_lenient("1/2").unwrap(), CodingRate::Cr4_8);
        assert_eq!(CodingRate::parse_lenient("4/7").unwrap(), CodingRate::Cr4_7);
        assert!(CodingRate::parse_lenient("3/4").is_err());
        assert!("2/3".parse::<CodingRate>().is_err());
    }

    #[test]
    fn test_lora_datarate_string() {
        let dr = DataRate::parse_lora("SF7BW125").unwrap();
        assert_eq!(dr, DataRate::Lora(SpreadingFactor::Sf7, Bandwidth::Bw125));
        assert_eq!(dr.to_string(), "SF7BW125");
        assert_eq!(
            DataRate::parse_lora("SF12BW500").unwrap(),
            DataRate::Lora(SpreadingFactor::Sf12, Bandwidth::Bw500)
        );
        assert!(DataRate::parse_lora("SF7").is_err());
        assert!(DataRate::parse_lora("SF4BW125").is_err());
        assert_eq!(DataRate::Fsk(50_000).to_string(), "50000");
    }

    #[test]
    fn test_numeric_conversions() {
        assert_eq!(SpreadingFactor::from_value(9).unwrap(), SpreadingFactor::Sf9);
        assert!(SpreadingFactor::from_value(4).is_err());
        assert_eq!(Bandwidth::from_hz(500_000).unwrap(), Bandwidth::Bw500);
        assert_eq!(CrcStatus::Bad.stat(), -1);
    }
}

//! radio-facing layer of the LoRa forwarder: packet model, timing and TX scheduling

use thiserror::Error;

pub mod airtime;
pub mod beacon;
pub mod gps;
pub mod hal;
pub mod lbt;
pub mod packet;
pub mod scheduler;
pub mod simulated;

pub use beacon::{BeaconConfig, BeaconGenerator};
pub use gps::{Coordinates, GpsClock, GpsTimeReference};
pub use hal::Concentrator;
pub use lbt::LbtGate;
pub use packet::{
    Bandwidth, CodingRate, CrcStatus, DataRate, Modulation, ReceivedPacket, SpreadingFactor,
    TransmitPacket, TxMode,
};
pub use scheduler::{EnqueueOutcome, JitError, JitScheduler, PacketClass, TxChainConfig};
pub use simulated::SimulatedConcentrator;

#[derive(Debug, Error)]
pub enum RadioError {
    #[error("Unknown {kind} value '{value}'")]
    UnknownWireName { kind: &'static str, value: String },

    #[error("Invalid {0}")]
    InvalidParameter(&'static str),

    #[error("Radio transmission failed")]
    TransmissionFailed,

    #[error("Concentrator unavailable: {0}")]
    Hardware(String),
}

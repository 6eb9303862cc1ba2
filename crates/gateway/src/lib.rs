//! Semtech UDP packet forwarder services for a LoRa concentrator

pub mod config;
pub mod decoder;
pub mod downlink;
pub mod link;
pub mod protocol;
pub mod relay;
pub mod report;
pub mod service;
pub mod store;
pub mod uplink;

pub use config::{ConfigError, GatewayConfig, ServiceConfig};
pub use protocol::{Downstream, PacketType, ProtocolError, Token};
pub use service::{GatewayContext, ServiceHandle};
pub use store::{KvStore, MemoryStore};

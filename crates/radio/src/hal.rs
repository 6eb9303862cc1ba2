//! Boundary to the concentrator hardware abstraction layer

use async_trait::async_trait;

use crate::packet::{ReceivedPacket, TransmitPacket};
use crate::RadioError;

#[async_trait]
pub trait Concentrator: Send + Sync {
    /// Free-running 32-bit microsecond counter
    async fn now_us(&self) -> Result<u32, RadioError>;

    /// Drain up to `max` captured packets, never blocks for new ones
    async fn receive(&self, max: usize) -> Result<Vec<ReceivedPacket>, RadioError>;

    async fn send(&self, pkt: &TransmitPacket) -> Result<(), RadioError>;
}

//! LoRaWAN MAC primitives: frame parsing, cryptography and admission filtering

use thiserror::Error;

pub mod crypto;
pub mod filter;
pub mod frame;
pub mod types;

pub use crypto::{Direction, SessionKeys};
pub use filter::{Dimension, FilterMode, FilterPolicy, FrameIdentity, PacketFilter, RuleStore};
pub use frame::{DataFrame, FrameType, JoinRequest, LoraFrame, RejoinRequest};
pub use types::{DevAddr, Eui64};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MacError {
    #[error("Invalid key length: expected 16 bytes, got {0}")]
    InvalidKeyLength(usize),

    #[error("Buffer of {len} bytes exceeds the {max} byte limit")]
    BufferTooLong { len: usize, max: usize },

    #[error("Join buffer length {0} is not a multiple of the block size")]
    UnalignedJoinBuffer(usize),

    #[error("Malformed frame: {0}")]
    MalformedFrame(&'static str),

    #[error("Invalid hex key: {0}")]
    InvalidHexKey(String),
}

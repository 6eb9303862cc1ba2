//! LoRaWAN PHYPayload decoding
//!
//! Decoded frames borrow from the captured buffer so MIC checks can run over
//! the exact bytes that were received.

use crate::crypto::{self, Direction};
use crate::filter::FrameIdentity;
use crate::types::{DevAddr, Eui64};
use crate::MacError;

pub const MIC_LEN: usize = 4;

/// MHDR + DevAddr + FCtrl + FCnt + MIC
pub const MIN_DATA_FRAME_LEN: usize = 12;
pub const JOIN_REQUEST_LEN: usize = 23;
/// Rejoin types 0 and 2: NetID + DevEUI + RJcount0
pub const REJOIN_NETID_LEN: usize = 19;
/// Rejoin type 1: JoinEUI + DevEUI + RJcount1
pub const REJOIN_JOINEUI_LEN: usize = 24;
pub const JOIN_ACCEPT_LEN: usize = 17;
pub const JOIN_ACCEPT_CFLIST_LEN: usize = 33;

const MTYPE_MASK: u8 = 0xE0;
const RFU_MASK: u8 = 0x1C;
const MAJOR_MASK: u8 = 0x03;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    JoinRequest,
    JoinAccept,
    UnconfirmedDataUp,
    UnconfirmedDataDown,
    ConfirmedDataUp,
    ConfirmedDataDown,
    Rejoin,
    Proprietary,
}

impl FrameType {
    pub fn from_mhdr(mhdr: u8) -> Self {
        match mhdr & MTYPE_MASK {
            0x00 => FrameType::JoinRequest,
            0x20 => FrameType::JoinAccept,
            0x40 => FrameType::UnconfirmedDataUp,
            0x60 => FrameType::UnconfirmedDataDown,
            0x80 => FrameType::ConfirmedDataUp,
            0xA0 => FrameType::ConfirmedDataDown,
            0xC0 => FrameType::Rejoin,
            _ => FrameType::Proprietary,
        }
    }

    pub fn is_data(&self) -> bool {
        matches!(
            self,
            FrameType::UnconfirmedDataUp
                | FrameType::UnconfirmedDataDown
                | FrameType::ConfirmedDataUp
                | FrameType::ConfirmedDataDown
        )
    }

    pub fn direction(&self) -> Direction {
        match self {
            FrameType::JoinAccept | FrameType::UnconfirmedDataDown | FrameType::ConfirmedDataDown => {
                Direction::Downlink
            }
            _ => Direction::Uplink,
        }
    }
}

/// FCtrl bits, uplink and downlink share the layout except bit 4.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameControl(pub u8);

impl FrameControl {
    pub fn adr(&self) -> bool {
        self.0 & 0x80 != 0
    }

    pub fn adr_ack_req(&self) -> bool {
        self.0 & 0x40 != 0
    }

    pub fn ack(&self) -> bool {
        self.0 & 0x20 != 0
    }

    /// FPending on downlink, ClassB on uplink
    pub fn pending_or_class_b(&self) -> bool {
        self.0 & 0x10 != 0
    }

    pub fn fopts_len(&self) -> usize {
        (self.0 & 0x0F) as usize
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrame<'a> {
    pub mhdr: u8,
    pub frame_type: FrameType,
    pub dev_addr: DevAddr,
    pub fctrl: FrameControl,
    pub fcnt: u16,
    pub fopts: &'a [u8],
    pub fport: Option<u8>,
    pub payload: &'a [u8],
    pub mic: u32,
    raw: &'a [u8],
}

impl<'a> DataFrame<'a> {
    /// Bytes covered by the MIC (everything but the trailer)
    pub fn signed_bytes(&self) -> &'a [u8] {
        &self.raw[..self.raw.len() - MIC_LEN]
    }

    /// Check the MIC against a session key. `fcnt_msb` supplies the upper
    /// half of the 32-bit counter the device is assumed to be on.
    pub fn verify_mic(&self, nwk_s_key: &[u8], fcnt_msb: u16) -> Result<bool, MacError> {
        let counter = ((fcnt_msb as u32) << 16) | self.fcnt as u32;
        let mic = crypto::compute_mic(
            self.signed_bytes(),
            nwk_s_key,
            self.dev_addr.0,
            self.frame_type.direction(),
            counter,
        )?;
        Ok(mic == self.mic)
    }

    /// Decrypt FRMPayload. Port 0 carries MAC commands under the network key.
    pub fn decrypt_payload(
        &self,
        nwk_s_key: &[u8],
        app_s_key: &[u8],
        fcnt_msb: u16,
    ) -> Result<Vec<u8>, MacError> {
        let counter = ((fcnt_msb as u32) << 16) | self.fcnt as u32;
        let key = match self.fport {
            Some(0) => nwk_s_key,
            _ => app_s_key,
        };
        crypto::decrypt(
            self.payload,
            key,
            self.dev_addr.0,
            self.frame_type.direction(),
            counter,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRequest<'a> {
    pub join_eui: Eui64,
    pub dev_eui: Eui64,
    pub dev_nonce: u16,
    pub mic: u32,
    raw: &'a [u8],
}

impl<'a> JoinRequest<'a> {
    pub fn verify_mic(&self, app_key: &[u8]) -> Result<bool, MacError> {
        let mic = crypto::join_compute_mic(&self.raw[..self.raw.len() - MIC_LEN], app_key)?;
        Ok(mic == self.mic)
    }
}

/// Rejoin-request. Types 0 and 2 carry the NetID, type 1 the JoinEUI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejoinRequest<'a> {
    pub rejoin_type: u8,
    pub net_id: Option<u32>,
    pub join_eui: Option<Eui64>,
    pub dev_eui: Eui64,
    pub rj_count: u16,
    pub mic: u32,
    raw: &'a [u8],
}

impl<'a> RejoinRequest<'a> {
    /// Bytes covered by the MIC
    pub fn signed_bytes(&self) -> &'a [u8] {
        &self.raw[..self.raw.len() - MIC_LEN]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoraFrame<'a> {
    JoinRequest(JoinRequest<'a>),
    Rejoin(RejoinRequest<'a>),
    /// Still encrypted body (MHDR stripped, MIC included)
    JoinAccept(&'a [u8]),
    Data(DataFrame<'a>),
    Proprietary(&'a [u8]),
}

fn read_u16(b: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([b[at], b[at + 1]])
}

fn read_u32(b: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}

fn read_u64(b: &[u8], at: usize) -> u64 {
    let mut le = [0u8; 8];
    le.copy_from_slice(&b[at..at + 8]);
    u64::from_le_bytes(le)
}

fn parse_join_request(raw: &[u8]) -> Result<JoinRequest<'_>, MacError> {
    if raw.len() != JOIN_REQUEST_LEN {
        return Err(MacError::MalformedFrame("join request must be 23 bytes"));
    }
    Ok(JoinRequest {
        join_eui: Eui64(read_u64(raw, 1)),
        dev_eui: Eui64(read_u64(raw, 9)),
        dev_nonce: read_u16(raw, 17),
        mic: read_u32(raw, 19),
        raw,
    })
}

fn parse_rejoin(raw: &[u8]) -> Result<RejoinRequest<'_>, MacError> {
    let rejoin_type = *raw
        .get(1)
        .ok_or(MacError::MalformedFrame("rejoin request without type"))?;
    match rejoin_type {
        0 | 2 => {
            if raw.len() != REJOIN_NETID_LEN {
                return Err(MacError::MalformedFrame("rejoin type 0/2 must be 19 bytes"));
            }
            Ok(RejoinRequest {
                rejoin_type,
                net_id: Some(u32::from_le_bytes([raw[2], raw[3], raw[4], 0])),
                join_eui: None,
                dev_eui: Eui64(read_u64(raw, 5)),
                rj_count: read_u16(raw, 13),
                mic: read_u32(raw, 15),
                raw,
            })
        }
        1 => {
            if raw.len() != REJOIN_JOINEUI_LEN {
                return Err(MacError::MalformedFrame("rejoin type 1 must be 24 bytes"));
            }
            Ok(RejoinRequest {
                rejoin_type,
                net_id: None,
                join_eui: Some(Eui64(read_u64(raw, 2))),
                dev_eui: Eui64(read_u64(raw, 10)),
                rj_count: read_u16(raw, 18),
                mic: read_u32(raw, 20),
                raw,
            })
        }
        _ => Err(MacError::MalformedFrame("unknown rejoin type")),
    }
}

fn parse_data(raw: &[u8], frame_type: FrameType) -> Result<DataFrame<'_>, MacError> {
    let len = raw.len();
    if len < MIN_DATA_FRAME_LEN {
        return Err(MacError::MalformedFrame("data frame shorter than 12 bytes"));
    }

    let fctrl = FrameControl(raw[5]);
    let port_offset = 8 + fctrl.fopts_len();
    let mic_offset = len - MIC_LEN;
    if port_offset > mic_offset {
        return Err(MacError::MalformedFrame("frame options overrun the MIC"));
    }

    let (fport, payload) = if port_offset == mic_offset {
        (None, &raw[mic_offset..mic_offset])
    } else {
        (Some(raw[port_offset]), &raw[port_offset + 1..mic_offset])
    };

    Ok(DataFrame {
        mhdr: raw[0],
        frame_type,
        dev_addr: DevAddr(read_u32(raw, 1)),
        fctrl,
        fcnt: read_u16(raw, 6),
        fopts: &raw[8..port_offset],
        fport,
        payload,
        mic: read_u32(raw, mic_offset),
        raw,
    })
}

impl<'a> LoraFrame<'a> {
    pub fn parse(raw: &'a [u8]) -> Result<Self, MacError> {
        let mhdr = *raw.first().ok_or(MacError::MalformedFrame("empty frame"))?;
        let frame_type = FrameType::from_mhdr(mhdr);

        if frame_type != FrameType::Proprietary {
            if mhdr & MAJOR_MASK != 0 {
                return Err(MacError::MalformedFrame("unsupported major version"));
            }
            if mhdr & RFU_MASK != 0 {
                return Err(MacError::MalformedFrame("reserved header bits set"));
            }
        }

        match frame_type {
            FrameType::JoinRequest => Ok(LoraFrame::JoinRequest(parse_join_request(raw)?)),
            FrameType::Rejoin => Ok(LoraFrame::Rejoin(parse_rejoin(raw)?)),
            FrameType::JoinAccept => {
                if raw.len() != JOIN_ACCEPT_LEN && raw.len() != JOIN_ACCEPT_CFLIST_LEN {
                    return Err(MacError::MalformedFrame("join accept must be 17 or 33 bytes"));
                }
                Ok(LoraFrame::JoinAccept(&raw[1..]))
            }
            FrameType::Proprietary => Ok(LoraFrame::Proprietary(&raw[1..])),
            _ => Ok(LoraFrame::Data(parse_data(raw, frame_type)?)),
        }
    }

    pub fn frame_type(&self) -> FrameType {
        match self {
            LoraFrame::JoinRequest(_) => FrameType::JoinRequest,
            LoraFrame::Rejoin(_) => FrameType::Rejoin,
            LoraFrame::JoinAccept(_) => FrameType::JoinAccept,
            LoraFrame::Data(d) => d.frame_type,
            LoraFrame::Proprietary(_) => FrameType::Proprietary,
        }
    }

    /// The identity the admission filter looks at. Absent fields are zero.
    pub fn identity(&self) -> FrameIdentity {
        match self {
            LoraFrame::Data(d) => FrameIdentity {
                fport: d.fport.unwrap_or(0),
                dev_addr: d.dev_addr,
                nwk_id: d.dev_addr.nwk_id(),
                dev_eui: Eui64::default(),
            },
            LoraFrame::JoinRequest(j) => FrameIdentity {
                dev_eui: j.dev_eui,
                ..FrameIdentity::default()
            },
            LoraFrame::Rejoin(r) => FrameIdentity {
                dev_eui: r.dev_eui,
                ..FrameIdentity::default()
            },
            _ => FrameIdentity::default(),
        }
    }
}

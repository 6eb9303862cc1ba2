//! Semtech gateway message protocol (GWMP v2) over UDP
//!
//! Upstream datagrams carry a 12 byte header (version, token, id, gateway
//! EUI) followed by JSON. Downstream datagrams carry only the first 4 bytes.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::{BufMut, Bytes, BytesMut};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use lora_fwd_radio::JitError;

pub const PROTOCOL_VERSION: u8 = 2;
pub const PROTOCOL_JSON_RXPK_FRAME_FORMAT: u8 = 1;
pub const DOWN_HEADER_LEN: usize = 4;
pub const UP_HEADER_LEN: usize = 12;

/// Packets fetched from the concentrator per capture
pub const NB_PKT_MAX: usize = 8;
/// Room for a full capture of rxpk objects plus a stat object
pub const TX_BUFF_SIZE: usize = 540 * NB_PKT_MAX + 30 + 200;
pub const RX_BUFF_SIZE: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    PushData = 0,
    PushAck = 1,
    PullData = 2,
    PullResp = 3,
    PullAck = 4,
    TxAck = 5,
}

impl TryFrom<u8> for PacketType {
    type Error = ProtocolError;

    fn try_from(id: u8) -> Result<Self, Self::Error> {
        Ok(match id {
            0 => PacketType::PushData,
            1 => PacketType::PushAck,
            2 => PacketType::PullData,
            3 => PacketType::PullResp,
            4 => PacketType::PullAck,
            5 => PacketType::TxAck,
            other => return Err(ProtocolError::UnknownType(other)),
        })
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Datagram too short ({0} bytes)")]
    TooShort(usize),

    #[error("Unsupported protocol version {0}")]
    BadVersion(u8),

    #[error("Unknown packet id {0}")]
    UnknownType(u8),

    #[error("Unexpected {0:?} datagram")]
    Unexpected(PacketType),

    #[error("Datagram would exceed {capacity} bytes")]
    Overflow { capacity: usize },

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("No \"txpk\" object in PULL_RESP")]
    MissingTxpk,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(pub u16);

impl Token {
    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        Token(rng.random())
    }

    pub fn to_be_bytes(self) -> [u8; 2] {
        self.0.to_be_bytes()
    }
}

/// Bounded datagram buffer. Writes that would exceed the capacity fail
/// and leave the buffer untouched.
#[derive(Debug)]
pub struct DatagramWriter {
    buf: BytesMut,
    capacity: usize,
}

impl DatagramWriter {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            capacity,
        }
    }

    /// Start a datagram with a full (`gateway_id` set) or short header.
    pub fn with_header(
        capacity: usize,
        token: Token,
        kind: PacketType,
        gateway_id: Option<u64>,
    ) -> Result<Self, ProtocolError> {
        let mut w = Self::new(capacity);
        let len = if gateway_id.is_some() {
            UP_HEADER_LEN
        } else {
            DOWN_HEADER_LEN
        };
        w.ensure(len)?;
        w.buf.put_u8(PROTOCOL_VERSION);
        w.buf.put_u16(token.0);
        w.buf.put_u8(kind as u8);
        if let Some(id) = gateway_id {
            w.buf.put_u64(id);
        }
        Ok(w)
    }

    fn ensure(&self, extra: usize) -> Result<(), ProtocolError> {
        if self.buf.len() + extra > self.capacity {
            return Err(ProtocolError::Overflow {
                capacity: self.capacity,
            });
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn put_slice(&mut self, data: &[u8]) -> Result<(), ProtocolError> {
        self.ensure(data.len())?;
        self.buf.put_slice(data);
        Ok(())
    }

    pub fn put_json<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), ProtocolError> {
        let encoded = serde_json::to_vec(value)?;
        self.put_slice(&encoded)
    }

    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Datarate as it appears in rxpk/txpk: "SF7BW125" for LoRa, bits per
/// second for FSK.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Datr {
    Lora(String),
    Fsk(u32),
}

/// One received packet in a PUSH_DATA
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rxpk {
    pub jver: u8,
    pub tmst: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tmms: Option<u64>,
    pub chan: u8,
    pub rfch: u8,
    /// MHz
    pub freq: f64,
    pub mid: u8,
    pub stat: i8,
    pub modu: String,
    pub datr: Datr,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub codr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rssis: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lsnr: Option<f32>,
    pub foff: i32,
    pub rssi: f32,
    pub size: u16,
    pub data: String,
}

impl Rxpk {
    pub fn payload(&self) -> Result<Vec<u8>, base64::DecodeError> {
        BASE64.decode(&self.data)
    }
}

/// Gateway status carried next to rxpk objects
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stat {
    /// "YYYY-MM-DD HH:MM:SS GMT"
    pub time: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lati: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub long: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alti: Option<i32>,
    pub rxnb: u32,
    pub rxok: u32,
    pub rxfw: u32,
    /// Percentage of acknowledged upstream datagrams
    pub ackr: f64,
    pub dwnb: u32,
    pub txnb: u32,
}

/// Incremental PUSH_DATA body: `{"rxpk":[...],"stat":{...}}`, either part
/// optional. Every append is checked against the final datagram size.
#[derive(Debug)]
pub struct PushDataWriter {
    token: Token,
    gateway_id: u64,
    capacity: usize,
    rxpk: Vec<Vec<u8>>,
    stat: Option<Vec<u8>>,
}

impl PushDataWriter {
    pub fn new(capacity: usize, token: Token, gateway_id: u64) -> Self {
        Self {
            token,
            gateway_id,
            capacity,
            rxpk: Vec::new(),
            stat: None,
        }
    }

    fn projected_len(&self, rxpk: &[usize], stat: Option<usize>) -> usize {
        let mut len = UP_HEADER_LEN + 2;
        if !rxpk.is_empty() {
            // "rxpk":[ ... ] with separators
            len += 9 + rxpk.iter().sum::<usize>() + rxpk.len() - 1;
        }
        if let Some(s) = stat {
            if !rxpk.is_empty() {
                len += 1;
            }
            len += 7 + s;
        }
        len
    }

    fn check(&self, rxpk: &[usize], stat: Option<usize>) -> Result<(), ProtocolError> {
        if self.projected_len(rxpk, stat) > self.capacity {
            return Err(ProtocolError::Overflow {
                capacity: self.capacity,
            });
        }
        Ok(())
    }

    pub fn push_rxpk(&mut self, rxpk: &Rxpk) -> Result<(), ProtocolError> {
        let encoded = serde_json::to_vec(rxpk)?;
        let mut sizes: Vec<usize> = self.rxpk.iter().map(Vec::len).collect();
        sizes.push(encoded.len());
        self.check(&sizes, self.stat.as_ref().map(Vec::len))?;
        self.rxpk.push(encoded);
        Ok(())
    }

    pub fn set_stat(&mut self, stat: &Stat) -> Result<(), ProtocolError> {
        let encoded = serde_json::to_vec(stat)?;
        let sizes: Vec<usize> = self.rxpk.iter().map(Vec::len).collect();
        self.check(&sizes, Some(encoded.len()))?;
        self.stat = Some(encoded);
        Ok(())
    }

    pub fn rxpk_count(&self) -> usize {
        self.rxpk.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rxpk.is_empty() && self.stat.is_none()
    }

    pub fn finish(self) -> Result<Bytes, ProtocolError> {
        let mut w = DatagramWriter::with_header(
            self.capacity,
            self.token,
            PacketType::PushData,
            Some(self.gateway_id),
        )?;
        w.put_slice(b"{")?;
        if !self.rxpk.is_empty() {
            w.put_slice(b"\"rxpk\":[")?;
            for (i, item) in self.rxpk.iter().enumerate() {
                if i > 0 {
                    w.put_slice(b",")?;
                }
                w.put_slice(item)?;
            }
            w.put_slice(b"]")?;
        }
        if let Some(stat) = &self.stat {
            if !self.rxpk.is_empty() {
                w.put_slice(b",")?;
            }
            w.put_slice(b"\"stat\":")?;
            w.put_slice(stat)?;
        }
        w.put_slice(b"}")?;
        Ok(w.finish())
    }
}

/// A downlink request as sent by the network server. Every field is
/// optional on the wire; validation happens when it is turned into a
/// transmit packet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Txpk {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imme: Option<bool>,
    #[serde(
        default,
        deserialize_with = "lenient_number::deserialize",
        skip_serializing_if = "Option::is_none"
    )]
    pub tmst: Option<u32>,
    #[serde(
        default,
        deserialize_with = "lenient_number::deserialize",
        skip_serializing_if = "Option::is_none"
    )]
    pub tmms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ncrc: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub freq: Option<f64>,
    #[serde(
        default,
        deserialize_with = "lenient_number::deserialize",
        skip_serializing_if = "Option::is_none"
    )]
    pub rfch: Option<u8>,
    #[serde(
        default,
        deserialize_with = "lenient_number::deserialize",
        skip_serializing_if = "Option::is_none"
    )]
    pub powe: Option<i8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modu: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datr: Option<Datr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub codr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipol: Option<bool>,
    #[serde(
        default,
        deserialize_with = "lenient_number::deserialize",
        skip_serializing_if = "Option::is_none"
    )]
    pub prea: Option<u16>,
    /// Hz
    #[serde(
        default,
        deserialize_with = "lenient_number::deserialize",
        skip_serializing_if = "Option::is_none"
    )]
    pub fdev: Option<u32>,
    #[serde(
        default,
        deserialize_with = "lenient_number::deserialize",
        skip_serializing_if = "Option::is_none"
    )]
    pub size: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl Txpk {
    /// Typed view of a txpk object. A field of the wrong type is an error
    /// here, not a framing error of the whole datagram.
    pub fn from_json(value: serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }
}

/// Integer txpk fields accept any JSON number; fractions are truncated.
mod lenient_number {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer};
    use serde_json::Number;

    pub fn deserialize<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
    where
        D: Deserializer<'de>,
        T: TryFrom<i64>,
    {
        let Some(number) = Option::<Number>::deserialize(deserializer)? else {
            return Ok(None);
        };
        let whole = match (number.as_i64(), number.as_f64()) {
            (Some(i), _) => Some(i),
            (None, Some(f)) if f.is_finite() && f.abs() < i64::MAX as f64 => Some(f.trunc() as i64),
            _ => None,
        };
        whole
            .and_then(|i| T::try_from(i).ok())
            .map(Some)
            .ok_or_else(|| D::Error::custom(format!("number {} out of range", number)))
    }
}

#[derive(Debug, Deserialize)]
struct PullRespBody {
    txpk: Option<serde_json::Value>,
}

/// Datagrams accepted on the downstream socket. The txpk of a PULL_RESP
/// is kept as raw JSON so field errors can still be acknowledged.
#[derive(Debug, Clone, PartialEq)]
pub enum Downstream {
    PushAck(Token),
    PullAck(Token),
    PullResp {
        token: Token,
        txpk: serde_json::Value,
    },
}

impl Downstream {
    pub fn parse(datagram: &[u8]) -> Result<Self, ProtocolError> {
        if datagram.len() < DOWN_HEADER_LEN {
            return Err(ProtocolError::TooShort(datagram.len()));
        }
        if datagram[0] != PROTOCOL_VERSION {
            return Err(ProtocolError::BadVersion(datagram[0]));
        }
        let token = Token(u16::from_be_bytes([datagram[1], datagram[2]]));
        match PacketType::try_from(datagram[3])? {
            PacketType::PushAck => Ok(Downstream::PushAck(token)),
            PacketType::PullAck => Ok(Downstream::PullAck(token)),
            PacketType::PullResp => {
                let body: PullRespBody = serde_json::from_slice(&datagram[DOWN_HEADER_LEN..])?;
                let txpk = body.txpk.ok_or(ProtocolError::MissingTxpk)?;
                Ok(Downstream::PullResp { token, txpk })
            }
            other => Err(ProtocolError::Unexpected(other)),
        }
    }

    pub fn token(&self) -> Token {
        match self {
            Downstream::PushAck(t) | Downstream::PullAck(t) => *t,
            Downstream::PullResp { token, .. } => *token,
        }
    }
}

pub fn pull_data(token: Token, gateway_id: u64) -> Result<Bytes, ProtocolError> {
    let w = DatagramWriter::with_header(
        UP_HEADER_LEN,
        token,
        PacketType::PullData,
        Some(gateway_id),
    )?;
    Ok(w.finish())
}

/// Outcome reported to the server for one PULL_RESP
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxAckStatus {
    Accepted,
    Rejected(JitError),
    /// Accepted with the power replaced by a supported value
    PowerAdjusted(i8),
}

impl TxAckStatus {
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            TxAckStatus::Accepted => json!({ "txpk_ack": { "error": "NONE" } }),
            TxAckStatus::Rejected(e) => json!({ "txpk_ack": { "error": e.as_str() } }),
            TxAckStatus::PowerAdjusted(p) => {
                json!({ "txpk_ack": { "warn": "TX_POWER", "value": p } })
            }
        }
    }
}

pub fn tx_ack(token: Token, gateway_id: u64, status: TxAckStatus) -> Result<Bytes, ProtocolError> {
    let mut w =
        DatagramWriter::with_header(RX_BUFF_SIZE, token, PacketType::TxAck, Some(gateway_id))?;
    w.put_json(&status.to_json())?;
    Ok(w.finish())
}

pub fn encode_payload(payload: &[u8]) -> String {
    BASE64.encode(payload)
}

pub fn decode_payload(data: &str) -> Result<Vec<u8>, base64::DecodeError> {
    BASE64.decode(data.trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    const GW: u64 = 0xAA55_5A00_0000_0001;

    fn rxpk(data: &[u8]) -> Rxpk {
        Rxpk {
            jver: PROTOCOL_JSON_RXPK_FRAME_FORMAT,
            tmst: 3_512_348_611,
            time: None,
            tmms: None,
            chan: 2,
            rfch: 0,
            freq: 868.1,
            mid: 0,
            stat: 1,
            modu: "LORA".into(),
            datr: Datr::Lora("SF7BW125".into()),
            codr: Some("4/5".into()),
            rssis: Some(-36.0),
            lsnr: Some(5.1),
            foff: 0,
            rssi: -35.0,
            size: data.len() as u16,
            data: encode_payload(data),
        }
    }

    #[test]
    fn test_header_layout() {
        let d = pull_data(Token(0xBEEF), GW).unwrap();
        assert_eq!(d.len(), UP_HEADER_LEN);
        assert_eq!(&d[..4], &[2, 0xBE, 0xEF, 2]);
        assert_eq!(&d[4..], &GW.to_be_bytes());
    }

    #[test]
    fn test_push_data_body() {
        let mut w = PushDataWriter::new(TX_BUFF_SIZE, Token(1), GW);
        assert!(w.is_empty());
        w.push_rxpk(&rxpk(b"abc")).unwrap();
        w.push_rxpk(&rxpk(b"de")).unwrap();
        w.set_stat(&Stat {
            time: "2024-01-01 00:00:00 GMT".into(),
            lati: None,
            long: None,
            alti: None,
            rxnb: 2,
            rxok: 2,
            rxfw: 2,
            ackr: 100.0,
            dwnb: 0,
            txnb: 0,
        })
        .unwrap();
        let d = w.finish().unwrap();
        assert_eq!(d[3], PacketType::PushData as u8);

        let body: serde_json::Value = serde_json::from_slice(&d[UP_HEADER_LEN..]).unwrap();
        let list = body["rxpk"].as_array().unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0]["data"], "YWJj");
        assert_eq!(list[0]["datr"], "SF7BW125");
        assert_eq!(list[0]["stat"], 1);
        assert!(list[0].get("time").is_none());
        assert_eq!(body["stat"]["rxnb"], 2);
    }

    #[test]
    fn test_projected_length_matches_output() {
        let mut w = PushDataWriter::new(TX_BUFF_SIZE, Token(1), GW);
        w.push_rxpk(&rxpk(&[1; 40])).unwrap();
        w.push_rxpk(&rxpk(&[2; 41])).unwrap();
        let sizes: Vec<usize> = w.rxpk.iter().map(Vec::len).collect();
        let expected = w.projected_len(&sizes, None);
        assert_eq!(w.finish().unwrap().len(), expected);
    }

    #[test]
    fn test_overflow_rejects_packet_and_keeps_the_rest() {
        let mut w = PushDataWriter::new(400, Token(1), GW);
        w.push_rxpk(&rxpk(&[0; 32])).unwrap();
        assert!(matches!(
            w.push_rxpk(&rxpk(&[0; 255])),
            Err(ProtocolError::Overflow { capacity: 400 })
        ));
        assert_eq!(w.rxpk_count(), 1);
        assert!(w.finish().unwrap().len() <= 400);
    }

    #[test]
    fn test_parse_downstream() {
        assert!(matches!(
            Downstream::parse(&[2, 0, 1]),
            Err(ProtocolError::TooShort(3))
        ));
        assert!(matches!(
            Downstream::parse(&[1, 0, 1, 4]),
            Err(ProtocolError::BadVersion(1))
        ));
        assert!(matches!(
            Downstream::parse(&[2, 0, 1, 5]),
            Err(ProtocolError::Unexpected(PacketType::TxAck))
        ));
        assert!(matches!(
            Downstream::parse(&[2, 0, 1, 9]),
            Err(ProtocolError::UnknownType(9))
        ));
        assert_eq!(
            Downstream::parse(&[2, 0x12, 0x34, 4]).unwrap(),
            Downstream::PullAck(Token(0x1234))
        );

        let mut resp = vec![2, 0, 7, 3];
        resp.extend_from_slice(
            br#"{"txpk":{"imme":true,"freq":869.525,"rfch":0,"powe":14,"modu":"LORA","datr":"SF9BW125","codr":"4/5","size":5,"data":"aGVsbG8="}}"#,
        );
        let Downstream::PullResp { token, txpk } = Downstream::parse(&resp).unwrap() else {
            panic!("expected PULL_RESP");
        };
        assert_eq!(token, Token(7));
        let txpk = Txpk::from_json(txpk).unwrap();
        assert_eq!(txpk.imme, Some(true));
        assert_eq!(txpk.datr, Some(Datr::Lora("SF9BW125".into())));
        assert_eq!(decode_payload(txpk.data.as_deref().unwrap()).unwrap(), b"hello");
    }

    #[test]
    fn test_pull_resp_without_txpk() {
        let mut resp = vec![2, 0, 7, 3];
        resp.extend_from_slice(br#"{"other":1}"#);
        assert!(matches!(
            Downstream::parse(&resp),
            Err(ProtocolError::MissingTxpk)
        ));

        let mut garbage = vec![2, 0, 7, 3];
        garbage.extend_from_slice(b"{not json");
        assert!(matches!(
            Downstream::parse(&garbage),
            Err(ProtocolError::Json(_))
        ));
    }

    #[test]
    fn test_txpk_numbers_are_lenient() {
        let mut resp = vec![2, 0, 8, 3];
        resp.extend_from_slice(br#"{"txpk":{"tmst":1000.7,"powe":14.0,"rfch":0,"size":5.0}}"#);
        let Downstream::PullResp { txpk, .. } = Downstream::parse(&resp).unwrap() else {
            panic!("expected PULL_RESP");
        };
        let txpk = Txpk::from_json(txpk).unwrap();
        assert_eq!(txpk.tmst, Some(1000));
        assert_eq!(txpk.powe, Some(14));
        assert_eq!(txpk.size, Some(5));

        // the datagram is well formed, only the typed view fails
        let mut resp = vec![2, 0, 9, 3];
        resp.extend_from_slice(br#"{"txpk":{"powe":"high","rfch":300}}"#);
        let Downstream::PullResp { txpk, .. } = Downstream::parse(&resp).unwrap() else {
            panic!("expected PULL_RESP");
        };
        assert!(Txpk::from_json(txpk).is_err());
        assert!(Txpk::from_json(json!({ "rfch": 300 })).is_err());
        assert_eq!(Txpk::from_json(json!({ "powe": -7.9 })).unwrap().powe, Some(-7));
    }

    #[test]
    fn test_tx_ack_bodies() {
        let body = |s| {
            let d = tx_ack(Token(9), GW, s).unwrap();
            assert_eq!(d[3], PacketType::TxAck as u8);
            serde_json::from_slice::<serde_json::Value>(&d[UP_HEADER_LEN..]).unwrap()
        };
        assert_eq!(
            body(TxAckStatus::Accepted),
            json!({ "txpk_ack": { "error": "NONE" } })
        );
        assert_eq!(
            body(TxAckStatus::Rejected(JitError::CollisionPacket)),
            json!({ "txpk_ack": { "error": "COLLISION_PACKET" } })
        );
        assert_eq!(
            body(TxAckStatus::PowerAdjusted(12)),
            json!({ "txpk_ack": { "warn": "TX_POWER", "value": 12 } })
        );
    }

    #[test]
    fn test_fsk_datr_is_numeric() {
        let json = serde_json::to_value(Datr::Fsk(50_000)).unwrap();
        assert_eq!(json, json!(50000));
        let txpk: Txpk = serde_json::from_str(r#"{"datr":50000,"fdev":25000}"#).unwrap();
        assert_eq!(txpk.datr, Some(Datr::Fsk(50_000)));
    }
}

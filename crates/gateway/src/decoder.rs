//! Optional local inspection of uplink data frames using session keys
//! provisioned in the store. Purely diagnostic, never affects forwarding.

use std::sync::Arc;

use log::{debug, info};

use lora_fwd_core::crypto::key_from_hex;
use lora_fwd_core::{DevAddr, LoraFrame, MacError};

use crate::store::KvStore;

pub fn session_key_path(dev_addr: DevAddr, name: &str) -> String {
    format!("devices/{}/{}", dev_addr, name)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    pub dev_addr: DevAddr,
    pub fcnt: u16,
    pub fport: Option<u8>,
    pub mic_valid: bool,
    pub payload: Vec<u8>,
}

pub struct MacDecoder {
    store: Arc<dyn KvStore>,
}

impl MacDecoder {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// `None` for non-data frames and devices without provisioned keys.
    pub fn decode(&self, frame: &LoraFrame<'_>) -> Result<Option<DecodedFrame>, MacError> {
        let LoraFrame::Data(data) = frame else {
            return Ok(None);
        };
        let (Some(nwk), Some(app)) = (
            self.store.get(&session_key_path(data.dev_addr, "nwkskey")),
            self.store.get(&session_key_path(data.dev_addr, "appskey")),
        ) else {
            debug!("[DECODE] no session keys for {}", data.dev_addr);
            return Ok(None);
        };

        let nwk_s_key = key_from_hex(&nwk)?;
        let app_s_key = key_from_hex(&app)?;
        let mic_valid = data.verify_mic(&nwk_s_key, 0)?;
        let payload = data.decrypt_payload(&nwk_s_key, &app_s_key, 0)?;

        Ok(Some(DecodedFrame {
            dev_addr: data.dev_addr,
            fcnt: data.fcnt,
            fport: data.fport,
            mic_valid,
            payload,
        }))
    }

    /// Decode and log, swallowing errors.
    pub fn inspect(&self, service: &str, frame: &LoraFrame<'_>) {
        match self.decode(frame) {
            Ok(Some(d)) => info!(
                "[{}-DECODE] {} fcnt {} port {:?} MIC {}: {}",
                service,
                d.dev_addr,
                d.fcnt,
                d.fport,
                if d.mic_valid { "ok" } else { "mismatch" },
                hex::encode_upper(&d.payload)
            ),
            Ok(None) => {}
            Err(e) => debug!("[{}-DECODE] {}", service, e),
        }
    }
}

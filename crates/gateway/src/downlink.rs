//! Downstream path of one service: PULL_DATA keepalives, PULL_RESP
//! handling and TX_ACK replies.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use log::{debug, error, info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::time::Instant;

use lora_fwd_core::LoraFrame;
use lora_fwd_radio::airtime::time_on_air;
use lora_fwd_radio::packet::{
    MAX_PAYLOAD_LEN, MIN_FSK_PREAMBLE, MIN_LORA_PREAMBLE, STD_FSK_PREAMBLE, STD_LORA_PREAMBLE,
};
use lora_fwd_radio::{
    BeaconGenerator, CodingRate, Concentrator, DataRate, GpsClock, JitError, JitScheduler,
    PacketClass, TransmitPacket, TxMode,
};

use crate::config::ServiceConfig;
use crate::decoder::MacDecoder;
use crate::link::{self, Backoff};
use crate::protocol::{
    decode_payload, pull_data, tx_ack, Datr, Downstream, Token, TxAckStatus, Txpk, RX_BUFF_SIZE,
};
use crate::report::ServiceReport;
use crate::service::{GatewayContext, SERVICE_FAMILY};
use crate::store::KvStore;

/// Status entries rotate over this many keys
const STATUS_SLOTS: u32 = 15;

pub fn status_key(service: &str, slot: u32) -> String {
    format!("{}/{}/network{}", SERVICE_FAMILY, service, slot)
}

/// Why a txpk could not be turned into a transmit request
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TxRequestError {
    #[error("missing mandatory field \"{0}\"")]
    Missing(&'static str),

    #[error("unsupported {field} \"{value}\"")]
    Unsupported { field: &'static str, value: String },

    #[error("payload is not valid base64")]
    BadPayload,

    #[error("malformed txpk: {0}")]
    Malformed(String),

    #[error("no valid GPS time reference")]
    GpsUnlocked,
}

impl TxRequestError {
    pub fn ack_error(&self) -> JitError {
        match self {
            TxRequestError::GpsUnlocked => JitError::GpsUnlocked,
            _ => JitError::Invalid,
        }
    }
}

fn unsupported(field: &'static str, value: impl ToString) -> TxRequestError {
    TxRequestError::Unsupported {
        field,
        value: value.to_string(),
    }
}

/// Keepalive bookkeeping of the downstream link
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LinkState {
    pub pull_send: u32,
    pub pull_ack: u32,
    pub autoquit_cnt: u32,
    pub connecting: bool,
    reported: Option<bool>,
    status_slot: u32,
}

impl LinkState {
    /// Every PULL_DATA sent so far was acknowledged
    pub fn in_sync(&self) -> bool {
        self.pull_ack == self.pull_send
    }

    pub fn reset(&mut self) {
        self.pull_send = 0;
        self.pull_ack = 0;
        self.connecting = false;
    }

    /// Next status slot when a status entry is due: on a change of link
    /// state and every 15 keepalives.
    fn status_due(&mut self) -> Option<u32> {
        if self.reported == Some(self.connecting) && self.pull_send % STATUS_SLOTS != 0 {
            return None;
        }
        self.reported = Some(self.connecting);
        self.status_slot = self.status_slot % STATUS_SLOTS + 1;
        Some(self.status_slot)
    }
}

pub struct DownlinkPoller {
    config: ServiceConfig,
    gateway_id: u64,
    gps_enabled: bool,
    antenna_gain: i8,
    default_power: i8,
    autoquit_threshold: u32,
    scheduler: Arc<JitScheduler>,
    hal: Arc<dyn Concentrator>,
    gps: GpsClock,
    store: Arc<dyn KvStore>,
    report: Arc<Mutex<ServiceReport>>,
    beacon: Option<BeaconGenerator>,
    decoder: Option<MacDecoder>,
    stop: Arc<AtomicBool>,
    /// Raised by auto-quit, ends this service only
    halt: Arc<AtomicBool>,
    rng: StdRng,
    state: LinkState,
}

impl DownlinkPoller {
    pub fn new(
        ctx: &GatewayContext,
        config: ServiceConfig,
        report: Arc<Mutex<ServiceReport>>,
        beacon: Option<BeaconGenerator>,
    ) -> Self {
        let decoder = config
            .mac_decode
            .then(|| MacDecoder::new(Arc::clone(&ctx.store)));
        Self {
            config,
            gateway_id: ctx.gateway_id,
            gps_enabled: ctx.config.gps.enabled,
            antenna_gain: ctx.config.antenna_gain,
            default_power: ctx.config.default_tx_power,
            autoquit_threshold: ctx.config.autoquit_threshold,
            scheduler: Arc::clone(&ctx.scheduler),
            hal: Arc::clone(&ctx.hal),
            gps: ctx.gps.clone(),
            store: Arc::clone(&ctx.store),
            report,
            beacon,
            decoder,
            stop: Arc::clone(&ctx.stop),
            halt: Arc::new(AtomicBool::new(false)),
            rng: StdRng::from_os_rng(),
            state: LinkState::default(),
        }
    }

    /// Share the service-level stop flag.
    pub fn with_halt(mut self, halt: Arc<AtomicBool>) -> Self {
        self.halt = halt;
        self
    }

    fn stopping(&self) -> bool {
        self.stop.load(Ordering::Relaxed) || self.halt.load(Ordering::Relaxed)
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn state(&self) -> &LinkState {
        &self.state
    }

    /// Validate a txpk and build the matching transmit request.
    pub async fn to_transmit(
        &self,
        txpk: &Txpk,
    ) -> Result<(TransmitPacket, PacketClass), TxRequestError> {
        let (class, count_us, tx_mode) = if txpk.imme == Some(true) {
            (PacketClass::ClassC, 0, TxMode::Immediate)
        } else if let Some(tmst) = txpk.tmst {
            (PacketClass::ClassA, tmst, TxMode::Timestamped)
        } else if let Some(tmms) = txpk.tmms {
            let reference = if self.gps_enabled {
                self.gps.reference().await
            } else {
                None
            };
            let reference = reference.ok_or(TxRequestError::GpsUnlocked)?;
            let count = reference.gps_to_count(std::time::Duration::from_millis(tmms));
            (PacketClass::ClassB, count, TxMode::Timestamped)
        } else {
            return Err(TxRequestError::Missing("tmst"));
        };

        let freq = txpk.freq.ok_or(TxRequestError::Missing("freq"))?;
        let rf_chain = txpk.rfch.ok_or(TxRequestError::Missing("rfch"))?;
        let rf_power = match txpk.powe {
            Some(p) => p.saturating_sub(self.antenna_gain),
            None => self.default_power,
        };

        let modu = txpk.modu.as_deref().ok_or(TxRequestError::Missing("modu"))?;
        let datr = txpk.datr.as_ref().ok_or(TxRequestError::Missing("datr"))?;
        let (datarate, coderate, f_dev, preamble) = match modu {
            "LORA" => {
                let Datr::Lora(name) = datr else {
                    return Err(unsupported("datr", format!("{:?}", datr)));
                };
                let datarate =
                    DataRate::parse_lora(name).map_err(|_| unsupported("datr", name))?;
                let codr = txpk.codr.as_deref().ok_or(TxRequestError::Missing("codr"))?;
                let coderate = CodingRate::parse_lenient(codr)
                    .ok()
                    .filter(|c| *c != CodingRate::Off)
                    .ok_or_else(|| unsupported("codr", codr))?;
                let preamble = txpk
                    .prea
                    .map_or(STD_LORA_PREAMBLE, |p| p.max(MIN_LORA_PREAMBLE));
                (datarate, coderate, 0, preamble)
            }
            "FSK" => {
                let Datr::Fsk(bps) = datr else {
                    return Err(unsupported("datr", format!("{:?}", datr)));
                };
                let fdev = txpk.fdev.ok_or(TxRequestError::Missing("fdev"))?;
                let f_dev = u8::try_from(fdev / 1_000).map_err(|_| unsupported("fdev", fdev))?;
                let preamble = txpk
                    .prea
                    .map_or(STD_FSK_PREAMBLE, |p| p.max(MIN_FSK_PREAMBLE));
                (DataRate::Fsk(*bps), CodingRate::Off, f_dev, preamble)
            }
            other => return Err(unsupported("modu", other)),
        };

        let size = txpk.size.ok_or(TxRequestError::Missing("size"))?;
        if size as usize > MAX_PAYLOAD_LEN {
            return Err(unsupported("size", size));
        }
        let data = txpk.data.as_deref().ok_or(TxRequestError::Missing("data"))?;
        let payload = decode_payload(data).map_err(|_| TxRequestError::BadPayload)?;
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(unsupported("size", payload.len()));
        }
        if payload.len() != size as usize {
            warn!(
                "[{}-DOWN] txpk size {} does not match the {} decoded bytes",
                self.name(),
                size,
                payload.len()
            );
        }

        let packet = TransmitPacket {
            freq_hz: (freq * 1e6).round() as u32,
            tx_mode,
            count_us,
            rf_chain,
            rf_power,
            datarate,
            coderate,
            invert_pol: txpk.ipol.unwrap_or(false),
            f_dev,
            preamble,
            no_crc: txpk.ncrc.unwrap_or(false),
            no_header: false,
            payload,
        };
        Ok((packet, class))
    }

    /// Turn one PULL_RESP into a queued transmission and the status to
    /// report back.
    pub async fn handle_pull_resp(&self, txpk: &Txpk) -> TxAckStatus {
        self.report.lock().await.down.tx_requested += 1;

        let status = match self.to_transmit(txpk).await {
            Err(e) => {
                warn!("[{}-DOWN] rejected txpk: {}", self.name(), e);
                TxAckStatus::Rejected(e.ack_error())
            }
            Ok((packet, class)) => {
                let size = packet.size();
                let airtime = time_on_air(&packet);
                self.inspect(&packet.payload);
                match self.hal.now_us().await {
                    Err(e) => {
                        warn!("[{}-DOWN] cannot read concentrator counter: {}", self.name(), e);
                        TxAckStatus::Rejected(JitError::Invalid)
                    }
                    Ok(now) => match self.scheduler.enqueue(now, packet, class).await {
                        Ok(outcome) => {
                            info!(
                                "[{}-DOWN] {:?} downlink of {} bytes ({:?} on air) scheduled at {} us",
                                self.name(),
                                class,
                                size,
                                airtime,
                                outcome.count_us
                            );
                            self.report.lock().await.down.payload_bytes += size as u64;
                            match outcome.power_adjusted {
                                Some(p) => TxAckStatus::PowerAdjusted(p),
                                None => TxAckStatus::Accepted,
                            }
                        }
                        Err(e) => {
                            warn!(
                                "[{}-DOWN] {:?} downlink rejected: {} (code {})",
                                self.name(),
                                class,
                                e,
                                e.code()
                            );
                            TxAckStatus::Rejected(e)
                        }
                    },
                }
            }
        };

        let mut report = self.report.lock().await;
        match status {
            TxAckStatus::Rejected(_) => report.down.tx_rejected += 1,
            _ => report.down.tx_accepted += 1,
        }
        status
    }

    /// Validate a txpk object as received and queue it.
    pub async fn handle_txpk_json(&self, txpk: serde_json::Value) -> TxAckStatus {
        match Txpk::from_json(txpk) {
            Ok(txpk) => self.handle_pull_resp(&txpk).await,
            Err(e) => {
                let e = TxRequestError::Malformed(e.to_string());
                warn!("[{}-DOWN] rejected txpk: {}", self.name(), e);
                let mut report = self.report.lock().await;
                report.down.tx_requested += 1;
                report.down.tx_rejected += 1;
                TxAckStatus::Rejected(e.ack_error())
            }
        }
    }

    fn inspect(&self, payload: &[u8]) {
        let Some(decoder) = &self.decoder else {
            return;
        };
        match LoraFrame::parse(payload) {
            Ok(frame) => decoder.inspect(&format!("{}-DOWN", self.name()), &frame),
            Err(e) => debug!("[{}-DOWN] downlink is not a LoRaWAN frame: {}", self.name(), e),
        }
    }

    async fn fill_beacons(&mut self) {
        let Some(generator) = self.beacon.as_mut() else {
            return;
        };
        let fill = generator
            .fill(&self.scheduler, self.hal.as_ref(), &self.gps)
            .await;
        if fill.queued > 0 || fill.rejected > 0 {
            let mut report = self.report.lock().await;
            report.down.beacons_queued += fill.queued;
            report.down.beacons_rejected += fill.rejected;
        }
    }

    fn persist_status(&mut self) {
        if let Some(slot) = self.state.status_due() {
            let value = format!(
                "{}:{}",
                Utc::now().timestamp(),
                if self.state.connecting { "online" } else { "offline" }
            );
            self.store.put(&status_key(self.name(), slot), &value);
        }
    }

    async fn handle_datagram(
        &mut self,
        socket: &UdpSocket,
        datagram: &[u8],
        token: Token,
        acked: &mut bool,
    ) {
        {
            let mut report = self.report.lock().await;
            report.down.datagrams_received += 1;
            report.down.network_bytes += datagram.len() as u64;
        }

        match Downstream::parse(datagram) {
            Err(e) => warn!("[{}-DOWN] ignoring datagram: {}", self.name(), e),
            Ok(Downstream::PullAck(t)) if t == token => {
                if *acked {
                    info!("[{}-DOWN] duplicate ACK received", self.name());
                } else {
                    *acked = true;
                    self.state.pull_ack += 1;
                    self.state.autoquit_cnt = 0;
                    self.state.connecting = true;
                    self.report.lock().await.down.acks_received += 1;
                    debug!("[{}-DOWN] PULL_ACK for token {:04X}", self.name(), t.0);
                }
            }
            Ok(Downstream::PullAck(t)) => {
                info!(
                    "[{}-DOWN] out-of-sync ACK (token {:04X}, expected {:04X})",
                    self.name(),
                    t.0,
                    token.0
                );
            }
            Ok(Downstream::PushAck(_)) => {
                debug!("[{}-DOWN] PUSH_ACK on the downstream socket ignored", self.name());
            }
            Ok(Downstream::PullResp { token: t, txpk }) => {
                let status = self.handle_txpk_json(txpk).await;
                match tx_ack(t, self.gateway_id, status) {
                    Ok(ack) => {
                        if let Err(e) = socket.send(&ack).await {
                            warn!("[{}-DOWN] cannot send TX_ACK: {}", self.name(), e);
                        }
                    }
                    Err(e) => warn!("[{}-DOWN] cannot build TX_ACK: {}", self.name(), e),
                }
            }
        }
    }

    /// Keepalive loop. Runs until a stop flag is raised, or raises the
    /// service flag when the autoquit threshold of unanswered PULL_DATA is
    /// reached.
    pub async fn run(mut self) {
        let mut backoff = Backoff::new();
        let mut socket: Option<UdpSocket> = None;
        let mut buf = vec![0u8; RX_BUFF_SIZE];
        info!(
            "[{}-DOWN] polling {}:{} every {:?}",
            self.name(),
            self.config.server_address,
            self.config.port_down,
            self.config.keepalive()
        );

        while !self.stopping() {
            if self.autoquit_threshold > 0 && self.state.autoquit_cnt >= self.autoquit_threshold {
                error!(
                    "[{}-DOWN] {} PULL_DATA without answer, exiting",
                    self.name(),
                    self.state.autoquit_cnt
                );
                self.halt.store(true, Ordering::Relaxed);
                break;
            }

            if !self.state.in_sync() || socket.is_none() {
                let resync = self.state.pull_send > 0;
                self.state.reset();
                if resync {
                    let delay = backoff.next_delay();
                    warn!(
                        "[{}-DOWN] server not answering, reconnecting in {:?}",
                        self.name(),
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                socket = match link::connect(&self.config.server_address, self.config.port_down).await {
                    Ok(s) => Some(s),
                    Err(e) => {
                        let delay = backoff.next_delay();
                        warn!("[{}-DOWN] cannot connect: {}, retrying in {:?}", self.name(), e, delay);
                        self.persist_status();
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                };
            }
            self.persist_status();
            let Some(sock) = socket.take() else {
                continue;
            };

            let token = Token::random(&mut self.rng);
            self.state.pull_send += 1;
            self.state.autoquit_cnt += 1;
            match pull_data(token, self.gateway_id) {
                Ok(datagram) => {
                    if let Err(e) = sock.send(&datagram).await {
                        debug!("[{}-DOWN] PULL_DATA send failed: {}", self.name(), e);
                    }
                }
                Err(e) => warn!("[{}-DOWN] cannot build PULL_DATA: {}", self.name(), e),
            }
            self.report.lock().await.down.pull_sent += 1;

            let mut acked = false;
            let deadline = Instant::now() + self.config.keepalive();
            while !self.stopping() {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                let wait = (deadline - now).min(self.config.pull_timeout());
                let received = link::recv_timeout(&sock, &mut buf, wait).await;
                self.fill_beacons().await;

                match received {
                    Ok(Some(n)) => {
                        self.handle_datagram(&sock, &buf[..n], token, &mut acked).await;
                    }
                    Ok(None) => {}
                    Err(e) => debug!("[{}-DOWN] receive error: {}", self.name(), e),
                }
            }
            if acked {
                backoff.reset();
            }
            socket = Some(sock);
        }

        info!("[{}-DOWN] end of downstream", self.name());
    }
}

//! Upstream path of one service: admission, PUSH_DATA assembly and
//! acknowledgement tracking.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex, Notify, Semaphore};
use tokio::time::Instant;

use lora_fwd_core::{LoraFrame, PacketFilter};
use lora_fwd_radio::{CrcStatus, DataRate, GpsClock, GpsTimeReference, ReceivedPacket};

use crate::config::{ConfigError, ServiceConfig};
use crate::decoder::MacDecoder;
use crate::link;
use crate::protocol::{
    encode_payload, Datr, Downstream, ProtocolError, PushDataWriter, Rxpk, Token,
    PROTOCOL_JSON_RXPK_FRAME_FORMAT, RX_BUFF_SIZE, TX_BUFF_SIZE,
};
use crate::report::ServiceReport;
use crate::service::GatewayContext;
use crate::store::KvStore;

/// Receive attempts while waiting for a PUSH_ACK
const PUSH_ACK_ATTEMPTS: usize = 2;

/// rxpk object for a received packet. Time fields come from the GPS
/// reference when one is given, otherwise from the host clock.
pub fn rxpk_from(pkt: &ReceivedPacket, reference: Option<&GpsTimeReference>) -> Rxpk {
    let (utc, tmms) = match reference {
        Some(r) => (
            r.count_to_utc(pkt.count_us),
            Some(r.count_to_gps(pkt.count_us).as_millis() as u64),
        ),
        None => (Utc::now(), None),
    };

    let (datr, codr, rssis, lsnr) = match pkt.datarate {
        DataRate::Lora(..) => (
            Datr::Lora(pkt.datarate.to_string()),
            Some(pkt.coderate.as_str().to_string()),
            Some(pkt.rssi_signal.round()),
            Some((pkt.snr * 10.0).round() / 10.0),
        ),
        DataRate::Fsk(bps) => (Datr::Fsk(bps), None, None, None),
    };

    Rxpk {
        jver: PROTOCOL_JSON_RXPK_FRAME_FORMAT,
        tmst: pkt.count_us,
        time: Some(utc.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()),
        tmms,
        chan: pkt.if_chain,
        rfch: pkt.rf_chain,
        freq: pkt.freq_hz as f64 / 1_000_000.0,
        mid: pkt.modem_id,
        stat: pkt.status.stat(),
        modu: pkt.modulation().as_str().to_string(),
        datr,
        codr,
        rssis,
        lsnr,
        foff: pkt.freq_offset,
        rssi: pkt.rssi_channel.round(),
        size: pkt.payload.len() as u16,
        data: encode_payload(&pkt.payload),
    }
}

pub struct UplinkForwarder {
    config: ServiceConfig,
    gateway_id: u64,
    gps_enabled: bool,
    max_tasks: usize,
    filter: PacketFilter,
    store: Arc<dyn KvStore>,
    decoder: Option<MacDecoder>,
    gps: GpsClock,
    report: Arc<Mutex<ServiceReport>>,
    /// Connected sockets not in use. Each in-flight datagram owns one, so
    /// a PUSH_ACK always reaches the task that sent the matching token.
    idle: Mutex<Vec<UdpSocket>>,
    rng: Mutex<StdRng>,
    stop: Arc<AtomicBool>,
    halt: Arc<AtomicBool>,
}

impl UplinkForwarder {
    pub fn new(
        ctx: &GatewayContext,
        config: ServiceConfig,
        report: Arc<Mutex<ServiceReport>>,
    ) -> Result<Self, ConfigError> {
        let filter = PacketFilter::new(config.name.clone(), config.filter.policy()?);
        let decoder = config
            .mac_decode
            .then(|| MacDecoder::new(Arc::clone(&ctx.store)));
        Ok(Self {
            gateway_id: ctx.gateway_id,
            gps_enabled: ctx.config.gps.enabled,
            max_tasks: ctx.config.max_concurrent_uplinks,
            filter,
            store: Arc::clone(&ctx.store),
            decoder,
            gps: ctx.gps.clone(),
            report,
            idle: Mutex::new(Vec::new()),
            rng: Mutex::new(StdRng::from_os_rng()),
            stop: Arc::clone(&ctx.stop),
            halt: Arc::new(AtomicBool::new(false)),
            config,
        })
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

    /// CRC policy, frame parsing and filtering. Counts every packet seen.
    pub async fn admit(&self, pkt: &ReceivedPacket) -> bool {
        {
            let mut report = self.report.lock().await;
            report.up.rx_received += 1;
            let forward = match pkt.status {
                CrcStatus::Ok => {
                    report.up.rx_ok += 1;
                    self.config.forward_crc_valid
                }
                CrcStatus::Bad => {
                    report.up.rx_bad += 1;
                    self.config.forward_crc_error
                }
                CrcStatus::NoCrc => {
                    report.up.rx_nocrc += 1;
                    self.config.forward_crc_disabled
                }
            };
            if !forward {
                debug!("[{}-UP] skipping packet with CRC status {}", self.name(), pkt.status);
                return false;
            }
        }

        match LoraFrame::parse(&pkt.payload) {
            Ok(frame) => {
                let id = frame.identity();
                if self.filter.should_drop(&*self.store, &id) {
                    self.report.lock().await.up.filtered += 1;
                    info!(
                        "[{}-UP] filtered {:?} (port {}, devaddr {}, deveui {})",
                        self.name(),
                        frame.frame_type(),
                        id.fport,
                        id.dev_addr,
                        id.dev_eui
                    );
                    return false;
                }
                if let Some(decoder) = &self.decoder {
                    decoder.inspect(self.name(), &frame);
                }
                debug!(
                    "[{}-UP] {:?} from {} on {} Hz, {} bytes",
                    self.name(),
                    frame.frame_type(),
                    id.dev_addr,
                    pkt.freq_hz,
                    pkt.size()
                );
            }
            Err(e) => {
                debug!(
                    "[{}-UP] payload is not a LoRaWAN frame ({}), forwarding as is",
                    self.name(),
                    e
                );
            }
        }
        true
    }

    /// PUSH_DATA for the admitted part of `batch` plus any pending stat.
    /// `None` when there is nothing to send.
    pub async fn prepare_datagram(
        &self,
        batch: &[ReceivedPacket],
        token: Token,
    ) -> Result<Option<Bytes>, ProtocolError> {
        let reference = if self.gps_enabled {
            self.gps.reference().await
        } else {
            None
        };

        let mut writer = PushDataWriter::new(TX_BUFF_SIZE, token, self.gateway_id);
        for pkt in batch {
            if !self.admit(pkt).await {
                continue;
            }
            match writer.push_rxpk(&rxpk_from(pkt, reference.as_ref())) {
                Ok(()) => {
                    let mut report = self.report.lock().await;
                    report.up.forwarded += 1;
                    report.up.payload_bytes += pkt.size() as u64;
                }
                Err(ProtocolError::Overflow { capacity }) => {
                    warn!(
                        "[{}-UP] packet does not fit in a {} byte datagram, dropped",
                        self.name(),
                        capacity
                    );
                }
                Err(e) => return Err(e),
            }
        }

        if let Some(stat) = self.report.lock().await.take_stat() {
            if let Err(e) = writer.set_stat(&stat) {
                warn!("[{}-UP] status report dropped: {}", self.name(), e);
            }
        }

        if writer.is_empty() {
            return Ok(None);
        }
        debug!("[{}-UP] PUSH_DATA with {} rxpk", self.name(), writer.rxpk_count());
        writer.finish().map(Some)
    }

    async fn checkout(&self) -> std::io::Result<UdpSocket> {
        let pooled = self.idle.lock().await.pop();
        let socket = match pooled {
            Some(socket) => socket,
            None => link::connect(&self.config.server_address, self.config.port_up).await?,
        };
        // late acks of an earlier datagram
        let mut scratch = [0u8; RX_BUFF_SIZE];
        while socket.try_recv(&mut scratch).is_ok() {}
        Ok(socket)
    }

    async fn checkin(&self, socket: UdpSocket) {
        let mut idle = self.idle.lock().await;
        if idle.len() < self.max_tasks {
            idle.push(socket);
        }
    }

    /// Send one batch. Returns whether a datagram went out.
    pub async fn forward(&self, batch: Vec<ReceivedPacket>) -> anyhow::Result<bool> {
        let token = Token::random(&mut *self.rng.lock().await);
        let Some(datagram) = self.prepare_datagram(&batch, token).await? else {
            return Ok(false);
        };

        let socket = self.checkout().await?;
        socket.send(&datagram).await?;
        let sent_at = Instant::now();
        {
            let mut report = self.report.lock().await;
            report.up.datagrams_sent += 1;
            report.up.network_bytes += datagram.len() as u64;
        }

        let mut buf = [0u8; RX_BUFF_SIZE];
        for _ in 0..PUSH_ACK_ATTEMPTS {
            let n = match link::recv_timeout(&socket, &mut buf, self.config.push_timeout()).await {
                Ok(Some(n)) => n,
                Ok(None) => continue,
                Err(e) => {
                    // the socket is dropped instead of going back to the pool
                    debug!("[{}-UP] receive error: {}", self.name(), e);
                    return Ok(true);
                }
            };
            match Downstream::parse(&buf[..n]) {
                Ok(Downstream::PushAck(t)) if t == token => {
                    let rtt_ms = u32::try_from(sent_at.elapsed().as_millis()).unwrap_or(u32::MAX);
                    {
                        let mut report = self.report.lock().await;
                        report.up.record_ack(rtt_ms);
                        report.last_ack = Some(Utc::now());
                    }
                    debug!(
                        "[{}-UP] PUSH_ACK for token {:04X} after {} ms",
                        self.name(),
                        token.0,
                        rtt_ms
                    );
                    self.checkin(socket).await;
                    return Ok(true);
                }
                Ok(other) => debug!(
                    "[{}-UP] ignored datagram with token {:04X}",
                    self.name(),
                    other.token().0
                ),
                Err(e) => debug!("[{}-UP] ignored invalid datagram: {}", self.name(), e),
            }
        }
        debug!("[{}-UP] no PUSH_ACK for token {:04X}", self.name(), token.0);
        self.checkin(socket).await;
        Ok(true)
    }

    /// Consume captured batches, one forwarding task per batch. A wake-up
    /// without a batch sends the pending stat on its own.
    pub async fn run(self: Arc<Self>, mut batches: mpsc::Receiver<Vec<ReceivedPacket>>, wake: Arc<Notify>) {
        let permits = Arc::new(Semaphore::new(self.max_tasks));
        info!("[{}-UP] forwarding to {}:{}", self.name(), self.config.server_address, self.config.port_up);

        loop {
            let batch = tokio::select! {
                batch = batches.recv() => match batch {
                    Some(batch) => batch,
                    None => break,
                },
                _ = wake.notified() => Vec::new(),
            };
            if self.stopping() {
                break;
            }

            let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                break;
            };
            let this = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = this.forward(batch).await {
                    warn!("[{}-UP] forwarding failed: {}", this.name(), e);
                }
                drop(permit);
            });
        }
        info!("[{}-UP] end of upstream", self.name());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FilterConfig, GatewayConfig};
    use crate::protocol::{PacketType, UP_HEADER_LEN};
    use crate::store::MemoryStore;
    use lora_fwd_radio::SimulatedConcentrator;
    use std::time::Duration;

    fn data_frame(fport: u8) -> Vec<u8> {
        let mut f = vec![0x40, 0xDA, 0x1B, 0x01, 0x26, 0x00, 0x01, 0x00, fport];
        f.extend_from_slice(b"payload");
        f.extend_from_slice(&[0, 0, 0, 0]);
        f
    }

    fn packet(payload: Vec<u8>) -> ReceivedPacket {
        ReceivedPacket {
            count_us: 1_000,
            payload,
            ..Default::default()
        }
    }

    fn forwarder(service: ServiceConfig, store: Arc<MemoryStore>) -> UplinkForwarder {
        let ctx = GatewayContext::new(
            GatewayConfig::default(),
            store,
            Arc::new(SimulatedConcentrator::new()),
        )
        .unwrap();
        let report = Arc::new(Mutex::new(ServiceReport::new()));
        UplinkForwarder::new(&ctx, service, report).unwrap()
    }

    #[test]
    fn test_rxpk_fields() {
        let pkt = ReceivedPacket {
            freq_hz: 868_300_000,
            if_chain: 2,
            count_us: 42,
            snr: 7.25,
            rssi_channel: -57.4,
            payload: vec![1, 2, 3],
            ..Default::default()
        };
        let r = rxpk_from(&pkt, None);
        assert_eq!(r.tmst, 42);
        assert_eq!(r.chan, 2);
        assert_eq!(r.freq, 868.3);
        assert_eq!(r.datr, Datr::Lora("SF7BW125".into()));
        assert_eq!(r.codr.as_deref(), Some("4/5"));
        assert_eq!(r.rssi, -57.0);
        assert_eq!(r.lsnr, Some(7.3));
        assert_eq!(r.data, "AQID");
        assert!(r.tmms.is_none());
        assert!(r.time.unwrap().ends_with('Z'));

        let fsk = ReceivedPacket {
            datarate: DataRate::Fsk(50_000),
            ..Default::default()
        };
        let r = rxpk_from(&fsk, None);
        assert_eq!(r.modu, "FSK");
        assert_eq!(r.datr, Datr::Fsk(50_000));
        assert!(r.codr.is_none() && r.lsnr.is_none());
    }

    #[test]
    fn test_rxpk_gps_time() {
        let reference = GpsTimeReference::new(0, Duration::from_secs(1_000_000_000), 1.0);
        let r = rxpk_from(&packet(vec![0]), Some(&reference));
        assert_eq!(r.tmms, Some(1_000_000_000_000 + 1));
        assert_eq!(r.time.as_deref(), Some("2011-09-14T01:46:40.001000Z"));
    }

    #[tokio::test]
    async fn test_crc_policy() {
        let fwd = forwarder(ServiceConfig::default(), Arc::new(MemoryStore::new()));
        let bad = ReceivedPacket {
            status: CrcStatus::Bad,
            ..packet(data_frame(1))
        };
        let none = ReceivedPacket {
            status: CrcStatus::NoCrc,
            ..packet(data_frame(1))
        };
        assert!(!fwd.admit(&bad).await);
        assert!(!fwd.admit(&none).await);
        assert!(fwd.admit(&packet(data_frame(1))).await);

        let report = fwd.report.lock().await;
        assert_eq!(report.up.rx_received, 3);
        assert_eq!((report.up.rx_ok, report.up.rx_bad, report.up.rx_nocrc), (1, 1, 1));
    }

    #[tokio::test]
    async fn test_unparseable_payload_is_forwarded() {
        let store = Arc::new(MemoryStore::new());
        let service = ServiceConfig {
            filter: FilterConfig {
                fport: "include".into(),
                ..Default::default()
            },
            ..Default::default()
        };
        let fwd = forwarder(service, store);
        assert!(fwd.admit(&packet(vec![0x40, 0x01])).await);
    }

    #[tokio::test]
    async fn test_nothing_to_send() {
        let fwd = forwarder(ServiceConfig::default(), Arc::new(MemoryStore::new()));
        assert!(fwd.prepare_datagram(&[], Token(1)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fport_include_drops_unlisted_port() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let store = Arc::new(MemoryStore::new());
        store.put("ttn/fport/5", "");

        let service = ServiceConfig {
            name: "ttn".into(),
            server_address: "127.0.0.1".into(),
            port_up: server.local_addr().unwrap().port(),
            push_timeout_ms: 500,
            filter: FilterConfig {
                fport: "include".into(),
                ..Default::default()
            },
            ..Default::default()
        };
        let fwd = Arc::new(forwarder(service, store));

        let sender = Arc::clone(&fwd);
        let task = tokio::spawn(async move {
            sender
                .forward(vec![packet(data_frame(10)), packet(data_frame(5))])
                .await
        });

        let mut buf = [0u8; TX_BUFF_SIZE];
        let (n, from) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(buf[3], PacketType::PushData as u8);
        let body: serde_json::Value = serde_json::from_slice(&buf[UP_HEADER_LEN..n]).unwrap();
        let rxpk = body["rxpk"].as_array().unwrap();
        assert_eq!(rxpk.len(), 1);
        let payload = crate::protocol::decode_payload(rxpk[0]["data"].as_str().unwrap()).unwrap();
        assert_eq!(payload[8], 5);

        server.send_to(&[2, buf[1], buf[2], 1], from).await.unwrap();
        assert!(task.await.unwrap().unwrap());

        let report = fwd.report.lock().await;
        assert_eq!(report.up.filtered, 1);
        assert_eq!(report.up.forwarded, 1);
        assert_eq!(report.up.acks_received, 1);
        assert!(report.up.mean_ack_rtt_ms().is_some());
        assert!(report.last_ack.is_some());
    }

    #[tokio::test]
    async fn test_concurrent_batches_get_their_own_acks() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let service = ServiceConfig {
            server_address: "127.0.0.1".into(),
            port_up: server.local_addr().unwrap().port(),
            push_timeout_ms: 1_000,
            ..Default::default()
        };
        let fwd = Arc::new(forwarder(service, Arc::new(MemoryStore::new())));

        let tasks: Vec<_> = (0..2)
            .map(|_| {
                let sender = Arc::clone(&fwd);
                tokio::spawn(async move { sender.forward(vec![packet(data_frame(1))]).await })
            })
            .collect();

        let mut buf = [0u8; TX_BUFF_SIZE];
        let (_, first) = server.recv_from(&mut buf).await.unwrap();
        let first_token = [buf[1], buf[2]];
        let (_, second) = server.recv_from(&mut buf).await.unwrap();
        let second_token = [buf[1], buf[2]];
        assert_ne!(first, second);

        // answered in reverse order
        server
            .send_to(&[2, second_token[0], second_token[1], 1], second)
            .await
            .unwrap();
        server
            .send_to(&[2, first_token[0], first_token[1], 1], first)
            .await
            .unwrap();
        for task in tasks {
            assert!(task.await.unwrap().unwrap());
        }

        let report = fwd.report.lock().await;
        assert_eq!(report.up.datagrams_sent, 2);
        assert_eq!(report.up.acks_received, 2);
        drop(report);
        assert_eq!(fwd.idle.lock().await.len(), 2);
    }

    #[tokio::test]
    async fn test_pending_stat_rides_along() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let service = ServiceConfig {
            server_address: "127.0.0.1".into(),
            port_up: server.local_addr().unwrap().port(),
            push_timeout_ms: 20,
            ..Default::default()
        };
        let fwd = forwarder(service, Arc::new(MemoryStore::new()));
        fwd.report.lock().await.publish("semtech", Utc::now(), None);

        assert!(fwd.forward(Vec::new()).await.unwrap());
        let mut buf = [0u8; TX_BUFF_SIZE];
        let (n, _) = server.recv_from(&mut buf).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&buf[UP_HEADER_LEN..n]).unwrap();
        assert!(body.get("rxpk").is_none());
        assert_eq!(body["stat"]["rxnb"], 0);
        assert_eq!(fwd.report.lock().await.up.acks_received, 0);
    }
}

//! Service lifecycle: one upstream task, one downstream task and a stats
//! task per configured network server.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{info, warn};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::interval;

use lora_fwd_radio::{
    BeaconGenerator, Concentrator, GpsClock, JitScheduler, LbtGate, ReceivedPacket,
};

use crate::config::{ConfigError, GatewayConfig, ServiceConfig};
use crate::downlink::{status_key, DownlinkPoller};
use crate::report::ServiceReport;
use crate::store::{family_key, KvStore};
use crate::uplink::UplinkForwarder;

pub const SERVICE_FAMILY: &str = "service/lorawan";
/// Captured batches buffered per service before new ones are dropped
const BATCH_QUEUE_LEN: usize = 64;

/// Everything services share: identity, configuration, store, radio.
#[derive(Clone)]
pub struct GatewayContext {
    pub gateway_id: u64,
    pub config: Arc<GatewayConfig>,
    pub store: Arc<dyn KvStore>,
    pub hal: Arc<dyn Concentrator>,
    pub scheduler: Arc<JitScheduler>,
    pub gps: GpsClock,
    pub stop: Arc<AtomicBool>,
}

impl GatewayContext {
    pub fn new(
        config: GatewayConfig,
        store: Arc<dyn KvStore>,
        hal: Arc<dyn Concentrator>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let lbt = config.lbt.enabled.then(|| LbtGate::new(config.lbt.slots));
        let scheduler = JitScheduler::new(config.tx_chains.clone(), lbt);
        Ok(Self {
            gateway_id: config.gateway_eui()?,
            config: Arc::new(config),
            store,
            hal,
            scheduler: Arc::new(scheduler),
            gps: GpsClock::new(),
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn stopping(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    pub fn beacon_generator(&self) -> Result<Option<BeaconGenerator>, ConfigError> {
        if self.config.beacon.period_s == 0 {
            return Ok(None);
        }
        BeaconGenerator::new(self.config.beacon.clone(), self.config.gps.reference)
            .map(Some)
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }
}

pub struct ServiceHandle {
    name: String,
    store: Arc<dyn KvStore>,
    /// Stops this service only (auto-quit or `stop`)
    halt: Arc<AtomicBool>,
    batches: mpsc::Sender<Vec<ReceivedPacket>>,
    report: Arc<Mutex<ServiceReport>>,
    tasks: Vec<JoinHandle<()>>,
    stats: JoinHandle<()>,
}

impl ServiceHandle {
    /// Start the tasks of one service. `beacon` is given to at most one
    /// service since all of them feed the same TX queue.
    pub fn start(
        ctx: &GatewayContext,
        config: ServiceConfig,
        beacon: Option<BeaconGenerator>,
    ) -> anyhow::Result<Self> {
        let name = config.name.clone();
        ctx.store.put(&family_key(SERVICE_FAMILY, &name), "running");
        ctx.store.put(
            &status_key(&name, 1),
            &format!("{}:offline", Utc::now().timestamp()),
        );

        let report = Arc::new(Mutex::new(ServiceReport::new()));
        let wake = Arc::new(Notify::new());
        let (tx, rx) = mpsc::channel(BATCH_QUEUE_LEN);

        let halt = Arc::new(AtomicBool::new(false));
        let uplink = Arc::new(
            UplinkForwarder::new(ctx, config.clone(), Arc::clone(&report))?
                .with_halt(Arc::clone(&halt)),
        );
        let downlink = DownlinkPoller::new(ctx, config, Arc::clone(&report), beacon)
            .with_halt(Arc::clone(&halt));

        let tasks = vec![
            tokio::spawn(uplink.run(rx, Arc::clone(&wake))),
            tokio::spawn(downlink.run()),
        ];
        let stats = tokio::spawn(stats_loop(
            ctx.clone(),
            name.clone(),
            Arc::clone(&report),
            wake,
            Arc::clone(&halt),
        ));

        info!("[{}] service started", name);
        Ok(Self {
            name,
            store: Arc::clone(&ctx.store),
            halt,
            batches: tx,
            report,
            tasks,
            stats,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn report(&self) -> Arc<Mutex<ServiceReport>> {
        Arc::clone(&self.report)
    }

    /// The service gave up on its own, the rest of the gateway keeps going.
    pub fn halted(&self) -> bool {
        self.halt.load(Ordering::Relaxed)
    }

    /// Hand a captured batch to the upstream task without blocking capture.
    pub fn dispatch(&self, batch: Vec<ReceivedPacket>) {
        if self.halted() {
            return;
        }
        match self.batches.try_send(batch) {
            Ok(()) => {}
            Err(TrySendError::Full(batch)) => {
                warn!("[{}] upstream busy, {} packets dropped", self.name, batch.len());
            }
            Err(TrySendError::Closed(_)) => {
                warn!("[{}] upstream stopped", self.name);
            }
        }
    }

    /// Stop the tasks of this service and clear its status entries.
    pub async fn stop(self, grace: Duration) {
        let Self {
            name,
            store,
            halt,
            batches,
            tasks,
            stats,
            ..
        } = self;
        halt.store(true, Ordering::Relaxed);
        drop(batches);
        stats.abort();

        for task in tasks {
            let abort = task.abort_handle();
            if tokio::time::timeout(grace, task).await.is_err() {
                abort.abort();
            }
        }

        store.delete(&family_key(SERVICE_FAMILY, &name));
        store.put(
            &status_key(&name, 1),
            &format!("{}:offline", Utc::now().timestamp()),
        );
        info!("[{}] service stopped", name);
    }
}

async fn stats_loop(
    ctx: GatewayContext,
    name: String,
    report: Arc<Mutex<ServiceReport>>,
    wake: Arc<Notify>,
    halt: Arc<AtomicBool>,
) {
    let mut tick = interval(ctx.config.stat_interval());
    tick.tick().await;
    let position = ctx.config.gps.enabled.then_some(ctx.config.gps.reference);
    let stopping = || ctx.stopping() || halt.load(Ordering::Relaxed);

    while !stopping() {
        tick.tick().await;
        if stopping() {
            break;
        }
        report.lock().await.publish(&name, Utc::now(), position);
        wake.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use lora_fwd_radio::SimulatedConcentrator;
    use tokio::net::UdpSocket;

    #[tokio::test]
    async fn test_start_and_stop_update_status() {
        let store = Arc::new(MemoryStore::new());
        let ctx = GatewayContext::new(
            GatewayConfig::default(),
            store.clone(),
            Arc::new(SimulatedConcentrator::new()),
        )
        .unwrap();

        let service = ServiceConfig {
            name: "ttn".into(),
            server_address: "127.0.0.1".into(),
            port_up: 9,
            port_down: 9,
            keepalive_s: 1,
            ..Default::default()
        };
        let handle = ServiceHandle::start(&ctx, service, None).unwrap();
        assert_eq!(store.get("service/lorawan/ttn").as_deref(), Some("running"));
        assert!(store
            .get("service/lorawan/ttn/network1")
            .unwrap()
            .ends_with(":offline"));

        ctx.stop.store(true, Ordering::Relaxed);
        handle.stop(Duration::from_secs(3)).await;
        assert!(!store.exists("service/lorawan/ttn"));
        assert!(store
            .get("service/lorawan/ttn/network1")
            .unwrap()
            .ends_with(":offline"));
    }

    #[tokio::test]
    async fn test_autoquit_stops_only_the_silent_service() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let answering_port = server.local_addr().unwrap().port();
        let responder = tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let mut pulls = 0;
            while let Ok((_, from)) = server.recv_from(&mut buf).await {
                if buf[3] == 2 {
                    pulls += 1;
                    let _ = server.send_to(&[2, buf[1], buf[2], 4], from).await;
                }
                if pulls == 3 {
                    break;
                }
            }
            pulls
        });
        // bound but never answers
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let config = GatewayConfig {
            autoquit_threshold: 1,
            ..Default::default()
        };
        let ctx = GatewayContext::new(
            config,
            Arc::new(MemoryStore::new()),
            Arc::new(SimulatedConcentrator::new()),
        )
        .unwrap();
        let service = |name: &str, port: u16| ServiceConfig {
            name: name.into(),
            server_address: "127.0.0.1".into(),
            port_up: port,
            port_down: port,
            keepalive_s: 1,
            pull_timeout_ms: 50,
            ..Default::default()
        };
        let quiet_port = silent.local_addr().unwrap().port();
        let quiet = ServiceHandle::start(&ctx, service("quiet", quiet_port), None).unwrap();
        let live = ServiceHandle::start(&ctx, service("live", answering_port), None).unwrap();

        let pulls = tokio::time::timeout(Duration::from_secs(10), responder)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pulls, 3);
        assert!(quiet.halted());
        assert!(!live.halted());
        assert!(!ctx.stopping());

        ctx.stop.store(true, Ordering::Relaxed);
        quiet.stop(Duration::from_secs(3)).await;
        live.stop(Duration::from_secs(3)).await;
    }

    #[test]
    fn test_beacon_generator_only_when_enabled() {
        let mut config = GatewayConfig::default();
        let ctx = GatewayContext::new(
            config.clone(),
            Arc::new(MemoryStore::new()),
            Arc::new(SimulatedConcentrator::new()),
        )
        .unwrap();
        assert!(ctx.beacon_generator().unwrap().is_none());

        config.beacon.period_s = 128;
        config.beacon.datarate = 7;
        let ctx = GatewayContext::new(
            config,
            Arc::new(MemoryStore::new()),
            Arc::new(SimulatedConcentrator::new()),
        )
        .unwrap();
        assert!(ctx.beacon_generator().is_err());
    }
}

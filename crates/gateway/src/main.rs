use std::env;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use log::{error, info, warn};
use tokio::time::interval;

use lora_fwd_gateway::protocol::NB_PKT_MAX;
use lora_fwd_gateway::relay::RelayTransform;
use lora_fwd_gateway::{GatewayConfig, GatewayContext, KvStore, MemoryStore, ServiceHandle};
use lora_fwd_radio::{Concentrator, SimulatedConcentrator};

const CAPTURE_PERIOD: Duration = Duration::from_millis(10);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let config = match env::args().nth(1) {
        Some(path) => {
            info!("Loading configuration from {}", path);
            GatewayConfig::from_file(&path)?
        }
        None => {
            warn!("No configuration file given, using defaults");
            GatewayConfig::default()
        }
    };

    let store = match &config.store_file {
        Some(path) => MemoryStore::from_json_file(path)?,
        None => MemoryStore::new(),
    };
    for service in &config.services {
        let rules = store.scan(&format!("{}/", service.name)).len();
        info!("[{}] {} filter rules in store", service.name, rules);
    }
    let store: Arc<dyn KvStore> = Arc::new(store);

    info!("Using the simulated concentrator");
    let hal: Arc<dyn Concentrator> = Arc::new(SimulatedConcentrator::free_running());
    let ctx = GatewayContext::new(config, store, hal)?;
    info!("Gateway {:016X} starting", ctx.gateway_id);

    let jit = {
        let scheduler = Arc::clone(&ctx.scheduler);
        let hal = Arc::clone(&ctx.hal);
        let stop = Arc::clone(&ctx.stop);
        tokio::spawn(async move { scheduler.run(hal, stop).await })
    };

    let mut beacon = ctx.beacon_generator()?;
    let mut services = Vec::new();
    for service in ctx.config.services.iter().cloned() {
        services.push(ServiceHandle::start(&ctx, service, beacon.take())?);
    }
    if services.is_empty() {
        warn!("No service configured, received packets are discarded");
    }

    let relay = RelayTransform::new(ctx.config.relay);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut tick = interval(CAPTURE_PERIOD);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown requested");
                break;
            }
            _ = tick.tick() => {
                if ctx.stopping() {
                    break;
                }
                match ctx.hal.receive(NB_PKT_MAX).await {
                    Ok(batch) if batch.is_empty() => {}
                    Ok(batch) => {
                        let batch = relay.apply(batch);
                        if !batch.is_empty() {
                            for service in &services {
                                service.dispatch(batch.clone());
                            }
                        }
                    }
                    Err(e) => {
                        error!("Concentrator receive failed: {}", e);
                        break;
                    }
                }
            }
        }
    }

    ctx.stop.store(true, Ordering::Relaxed);
    for service in services {
        service.stop(SHUTDOWN_GRACE).await;
    }
    if let Err(e) = jit.await {
        error!("TX loop ended abnormally: {}", e);
    }

    let (enqueued, rejected, transmitted) = ctx.scheduler.get_stats().await;
    info!(
        "Stopped: {} downlinks queued, {} rejected, {} transmitted",
        enqueued, rejected, transmitted
    );
    Ok(())
}

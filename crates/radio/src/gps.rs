//! Pairing of the concentrator counter with GPS/UTC time

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Unix time of the GPS epoch, 1980-01-06T00:00:00Z
pub const GPS_EPOCH_UNIX: i64 = 315_964_800;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lon: f64,
    pub alt: i32,
}

/// One sync point: counter value `count_us` was observed at `utc`/`gps`.
/// `xtal_err` is the measured ratio of counter ticks to true microseconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GpsTimeReference {
    pub count_us: u32,
    pub utc: DateTime<Utc>,
    pub gps: Duration,
    pub xtal_err: f64,
}

impl GpsTimeReference {
    pub fn new(count_us: u32, gps: Duration, xtal_err: f64) -> Self {
        let utc = gps_to_utc(gps);
        Self {
            count_us,
            utc,
            gps,
            xtal_err,
        }
    }

    fn elapsed_secs(&self, count_us: u32) -> f64 {
        count_us.wrapping_sub(self.count_us) as f64 / (1e6 * self.xtal_err)
    }

    pub fn count_to_gps(&self, count_us: u32) -> Duration {
        self.gps + Duration::from_secs_f64(self.elapsed_secs(count_us))
    }

    pub fn count_to_utc(&self, count_us: u32) -> DateTime<Utc> {
        let micros = (self.elapsed_secs(count_us) * 1e6) as i64;
        self.utc + chrono::Duration::microseconds(micros)
    }

    /// Counter value at which `gps` occurs, wrapping like the hardware does.
    pub fn gps_to_count(&self, gps: Duration) -> u32 {
        let delta = gps.as_secs_f64() - self.gps.as_secs_f64();
        let ticks = (delta * 1e6 * self.xtal_err).round() as i64;
        self.count_us.wrapping_add(ticks as u32)
    }
}

pub fn gps_to_utc(gps: Duration) -> DateTime<Utc> {
    let unix = GPS_EPOCH_UNIX + gps.as_secs() as i64;
    Utc.timestamp_opt(unix, gps.subsec_nanos())
        .single()
        .unwrap_or_default()
}

#[derive(Debug, Default)]
struct GpsState {
    reference: Option<GpsTimeReference>,
    valid: bool,
}

/// Shared holder for the latest time reference. Written by whatever owns
/// the GPS receiver, read by the forwarder services.
#[derive(Debug, Clone, Default)]
pub struct GpsClock {
    state: Arc<RwLock<GpsState>>,
}

impl GpsClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn update(&self, reference: GpsTimeReference) {
        let mut state = self.state.write().await;
        state.reference = Some(reference);
        state.valid = true;
    }

    pub async fn invalidate(&self) {
        self.state.write().await.valid = false;
    }

    /// The current reference, only while it is valid
    pub async fn reference(&self) -> Option<GpsTimeReference> {
        let state = self.state.read().await;
        if state.valid {
            state.reference
        } else {
            None
        }
    }
}

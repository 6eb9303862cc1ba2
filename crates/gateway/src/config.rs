//! Forwarder configuration, loaded from a JSON file

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use lora_fwd_core::{FilterMode, FilterPolicy};
use lora_fwd_radio::beacon::BeaconConfig;
use lora_fwd_radio::lbt::DEFAULT_LBT_SLOTS;
use lora_fwd_radio::{Coordinates, TxChainConfig};

use crate::relay::RelayConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GpsConfig {
    pub enabled: bool,
    /// Reported position, also encoded in beacons
    pub reference: Coordinates,
}

impl Default for GpsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            reference: Coordinates::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LbtConfig {
    pub enabled: bool,
    pub slots: usize,
}

impl Default for LbtConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            slots: DEFAULT_LBT_SLOTS,
        }
    }
}

/// Filter modes per dimension: "none", "include" or "exclude"
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub fport: String,
    pub devaddr: String,
    pub nwkid: String,
    pub deveui: String,
}

impl FilterConfig {
    pub fn policy(&self) -> Result<FilterPolicy, ConfigError> {
        let mode = |s: &str| s.parse::<FilterMode>().map_err(ConfigError::Invalid);
        Ok(FilterPolicy {
            fport: mode(&self.fport)?,
            devaddr: mode(&self.devaddr)?,
            nwkid: mode(&self.nwkid)?,
            deveui: mode(&self.deveui)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: String,
    pub server_address: String,
    pub port_up: u16,
    pub port_down: u16,
    pub keepalive_s: u64,
    pub push_timeout_ms: u64,
    pub pull_timeout_ms: u64,
    pub forward_crc_valid: bool,
    pub forward_crc_error: bool,
    pub forward_crc_disabled: bool,
    pub filter: FilterConfig,
    pub mac_decode: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "semtech".to_string(),
            server_address: "localhost".to_string(),
            port_up: 1700,
            port_down: 1700,
            keepalive_s: 10,
            push_timeout_ms: 100,
            pull_timeout_ms: 200,
            forward_crc_valid: true,
            forward_crc_error: false,
            forward_crc_disabled: false,
            filter: FilterConfig::default(),
            mac_decode: false,
        }
    }
}

impl ServiceConfig {
    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_s)
    }

    pub fn push_timeout(&self) -> Duration {
        Duration::from_millis(self.push_timeout_ms)
    }

    pub fn pull_timeout(&self) -> Duration {
        Duration::from_millis(self.pull_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// 16 hex digits
    pub gateway_id: String,
    pub gps: GpsConfig,
    pub tx_chains: Vec<TxChainConfig>,
    pub antenna_gain: i8,
    pub default_tx_power: i8,
    pub lbt: LbtConfig,
    pub beacon: BeaconConfig,
    pub relay: RelayConfig,
    pub autoquit_threshold: u32,
    pub max_concurrent_uplinks: usize,
    pub stat_interval_s: u64,
    /// Optional JSON object of store keys to preload (filter rules, device keys)
    pub store_file: Option<String>,
    pub services: Vec<ServiceConfig>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            gateway_id: "AA555A0000000000".to_string(),
            gps: GpsConfig::default(),
            tx_chains: vec![TxChainConfig::default(), TxChainConfig::default()],
            antenna_gain: 0,
            default_tx_power: 14,
            lbt: LbtConfig::default(),
            beacon: BeaconConfig::default(),
            relay: RelayConfig::default(),
            autoquit_threshold: 0,
            max_concurrent_uplinks: 8,
            stat_interval_s: 30,
            store_file: None,
            services: vec![ServiceConfig::default()],
        }
    }
}

impl GatewayConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: GatewayConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn gateway_eui(&self) -> Result<u64, ConfigError> {
        u64::from_str_radix(self.gateway_id.trim(), 16)
            .map_err(|e| ConfigError::Invalid(format!("gateway_id '{}': {}", self.gateway_id, e)))
    }

    pub fn stat_interval(&self) -> Duration {
        Duration::from_secs(self.stat_interval_s.max(1))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.gateway_eui()?;
        if self.tx_chains.is_empty() {
            return Err(ConfigError::Invalid("at least one TX chain is required".into()));
        }
        if self.max_concurrent_uplinks == 0 {
            return Err(ConfigError::Invalid("max_concurrent_uplinks must be positive".into()));
        }
        for s in &self.services {
            if s.name.is_empty() {
                return Err(ConfigError::Invalid("service without a name".into()));
            }
            s.filter.policy()?;
        }
        Ok(())
    }
}

//! Per-service packet admission filter

use std::fmt;
use std::str::FromStr;

use log::debug;

use crate::types::{DevAddr, Eui64};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilterMode {
    #[default]
    None,
    Include,
    Exclude,
}

impl FromStr for FilterMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "" => Ok(FilterMode::None),
            "include" => Ok(FilterMode::Include),
            "exclude" => Ok(FilterMode::Exclude),
            other => Err(format!("unknown filter mode '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dimension {
    FPort,
    DevAddr,
    NwkId,
    DevEui,
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Dimension::FPort => "fport",
            Dimension::DevAddr => "devaddr",
            Dimension::NwkId => "nwkid",
            Dimension::DevEui => "deveui",
        })
    }
}

/// Read-only view of the rule store during a filtering decision.
pub trait RuleStore {
    fn contains(&self, key: &str) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FilterPolicy {
    pub fport: FilterMode,
    pub devaddr: FilterMode,
    pub nwkid: FilterMode,
    pub deveui: FilterMode,
}

impl FilterPolicy {
    pub fn is_active(&self) -> bool {
        *self != FilterPolicy::default()
    }
}

/// Decoded identity of a frame; zero means "not present".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameIdentity {
    pub fport: u8,
    pub dev_addr: DevAddr,
    pub nwk_id: u8,
    pub dev_eui: Eui64,
}

pub struct PacketFilter {
    service: String,
    policy: FilterPolicy,
}

impl PacketFilter {
    pub fn new(service: impl Into<String>, policy: FilterPolicy) -> Self {
        Self {
            service: service.into(),
            policy,
        }
    }

    pub fn policy(&self) -> &FilterPolicy {
        &self.policy
    }

    /// Store key for one dimension of an identity.
    pub fn rule_key(&self, dimension: Dimension, id: &FrameIdentity) -> String {
        match dimension {
            Dimension::FPort => format!("{}/fport/{}", self.service, id.fport),
            Dimension::DevAddr => format!("{}/devaddr/{}", self.service, id.dev_addr),
            Dimension::NwkId => format!("{}/nwkid/{:02X}", self.service, id.nwk_id),
            Dimension::DevEui => format!("{}/deveui/{}", self.service, id.dev_eui),
        }
    }

    /// Dimensions are checked fport, devaddr, nwkid, deveui and the first
    /// one that rejects decides.
    pub fn should_drop<S: RuleStore + ?Sized>(&self, store: &S, id: &FrameIdentity) -> bool {
        let checks = [
            (Dimension::FPort, self.policy.fport, id.fport == 0),
            (Dimension::DevAddr, self.policy.devaddr, id.dev_addr.is_zero()),
            // NwkID 0 is a valid network, only a missing address exempts it
            (Dimension::NwkId, self.policy.nwkid, id.dev_addr.is_zero()),
            (Dimension::DevEui, self.policy.deveui, id.dev_eui.is_zero()),
        ];

        for (dimension, mode, value_is_zero) in checks {
            if mode == FilterMode::None {
                continue;
            }
            if dimension == Dimension::DevEui && value_is_zero {
                continue;
            }

            let key = self.rule_key(dimension, id);
            let listed = store.contains(&key);
            let drop = match mode {
                FilterMode::Include => !listed,
                FilterMode::Exclude => !listed && !value_is_zero,
                FilterMode::None => false,
            };
            if drop {
                debug!("[{}] filter drop on {} ({})", self.service, dimension, key);
                return true;
            }
        }
        false
    }
}

//! Configuration envelope passed from the host at session start.
//!
//! The envelope travels as a JSON bag; unknown keys are ignored so hosts can
//! ship forward-compatible blobs. Validation collects every issue instead of
//! failing on the first one.

use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

pub const DEFAULT_MTU: u32 = 1500;
pub const MIN_MTU: u32 = 576;
pub const MAX_MTU: u32 = 9000;

pub const DEFAULT_PACKET_POOL_BYTES: u32 = 2 * 1_048_576;
pub const DEFAULT_PER_FLOW_BUFFER_BYTES: u32 = 16 * 1024;
pub const MAX_PER_FLOW_BUFFER_BYTES: u32 = 64 * 1024;
pub const MIN_PACKET_POOL_BYTES: u32 = 1_048_576;
pub const DEFAULT_MAX_FLOWS: u32 = 512;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Configuration {
    pub mtu: u32,
    pub ipv4: Ipv4Settings,
    pub ipv6: Option<Ipv6Settings>,
    pub dns: DnsSettings,
    pub metrics: MetricsSettings,
    pub policies: PolicySettings,
    pub memory: MemoryBudget,
    pub logging: LoggingSettings,
    pub engine: EngineSettings,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            mtu: DEFAULT_MTU,
            ipv4: Ipv4Settings::default(),
            ipv6: None,
            dns: DnsSettings::default(),
            metrics: MetricsSettings::default(),
            policies: PolicySettings::default(),
            memory: MemoryBudget::default(),
            logging: LoggingSettings::default(),
            engine: EngineSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Ipv4Settings {
    pub address: String,
    pub subnet_mask: String,
    pub remote_address: String,
    pub included_routes: Vec<RouteEntry>,
    pub excluded_routes: Vec<RouteEntry>,
}

impl Default for Ipv4Settings {
    fn default() -> Self {
        Self {
            address: "10.0.0.2".to_string(),
            subnet_mask: "255.255.255.0".to_string(),
            remote_address: "10.0.0.1".to_string(),
            included_routes: vec![RouteEntry {
                address: "0.0.0.0".to_string(),
                mask: "0.0.0.0".to_string(),
            }],
            excluded_routes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Ipv6Settings {
    pub address: String,
    pub prefix_length: u8,
    pub included_routes: Vec<RouteEntry>,
    pub excluded_routes: Vec<RouteEntry>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RouteEntry {
    pub address: String,
    pub mask: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DnsSettings {
    pub servers: Vec<String>,
    pub search_domains: Vec<String>,
    pub match_domains: Vec<String>,
    /// Internal resolver backend: platform address-info when true, the
    /// recursive stub otherwise.
    pub use_system_resolver: bool,
}

impl Default for DnsSettings {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            search_domains: Vec::new(),
            match_domains: vec![String::new()],
            use_system_resolver: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MetricsSettings {
    pub is_enabled: bool,
    /// Seconds between coalesced snapshots. Zero emits on every mutation.
    pub reporting_interval: f64,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            is_enabled: true,
            reporting_interval: 5.0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PolicySettings {
    pub blocked_hosts: Vec<String>,
    pub latency_rules: Vec<LatencyRule>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LatencyRule {
    /// Absent host applies the rule globally.
    pub host: Option<String>,
    pub latency_ms: u32,
    pub jitter_ms: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MemoryBudget {
    pub packet_pool_bytes: u32,
    pub per_flow_buffer_bytes: u32,
    pub max_flows: u32,
}

impl Default for MemoryBudget {
    fn default() -> Self {
        Self {
            packet_pool_bytes: DEFAULT_PACKET_POOL_BYTES,
            per_flow_buffer_bytes: DEFAULT_PER_FLOW_BUFFER_BYTES,
            max_flows: DEFAULT_MAX_FLOWS,
        }
    }
}

impl MemoryBudget {
    /// Clamped view used by the engine. Overruns at runtime drop packets with
    /// counter bumps; they never fail.
    pub fn effective(&self) -> MemoryBudget {
        MemoryBudget {
            packet_pool_bytes: self.packet_pool_bytes.max(MIN_PACKET_POOL_BYTES),
            per_flow_buffer_bytes: self
                .per_flow_buffer_bytes
                .clamp(4 * 1024, MAX_PER_FLOW_BUFFER_BYTES),
            max_flows: self.max_flows.max(1),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LoggingSettings {
    pub enable_debug: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineSettings {
    pub log_level: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            log_level: "warn".to_string(),
        }
    }
}

impl Configuration {
    pub fn from_json(bytes: &[u8]) -> Result<Self, EngineError> {
        serde_json::from_slice(bytes).map_err(|error| EngineError::InvalidConfiguration {
            issues: vec![format!("malformed configuration JSON: {error}")],
        })
    }

    /// Validates the envelope, collecting every issue. Warnings (such as an
    /// unusual MTU) are returned separately and never fail the start.
    pub fn validate(&self) -> Result<Vec<String>, EngineError> {
        let mut issues = Vec::new();
        let mut warnings = Vec::new();

        if !(MIN_MTU..=MAX_MTU).contains(&self.mtu) {
            warnings.push(format!(
                "mtu {} outside [{MIN_MTU}, {MAX_MTU}], will be clamped",
                self.mtu
            ));
        }

        for (label, value) in [
            ("ipv4.address", &self.ipv4.address),
            ("ipv4.subnetMask", &self.ipv4.subnet_mask),
            ("ipv4.remoteAddress", &self.ipv4.remote_address),
        ] {
            if value.parse::<Ipv4Addr>().is_err() {
                issues.push(format!("{label} is not a dotted IPv4 address: {value:?}"));
            }
        }
        for route in self
            .ipv4
            .included_routes
            .iter()
            .chain(self.ipv4.excluded_routes.iter())
        {
            if route.address.parse::<Ipv4Addr>().is_err()
                || route.mask.parse::<Ipv4Addr>().is_err()
            {
                issues.push(format!(
                    "ipv4 route {}/{} is not a valid address/mask pair",
                    route.address, route.mask
                ));
            }
        }
        if let Some(ipv6) = &self.ipv6 {
            if ipv6.address.parse::<std::net::Ipv6Addr>().is_err() {
                issues.push(format!("ipv6.address is invalid: {:?}", ipv6.address));
            }
            if ipv6.prefix_length > 128 {
                issues.push(format!(
                    "ipv6.prefixLength {} exceeds 128",
                    ipv6.prefix_length
                ));
            }
        }
        for server in &self.dns.servers {
            if server.parse::<std::net::IpAddr>().is_err() {
                issues.push(format!("dns server is not an IP address: {server:?}"));
            }
        }
        if self.metrics.reporting_interval < 0.0 || !self.metrics.reporting_interval.is_finite() {
            issues.push(format!(
                "metrics.reportingInterval must be a non-negative number, got {}",
                self.metrics.reporting_interval
            ));
        }
        for rule in &self.policies.latency_rules {
            if rule.latency_ms == 0 && rule.jitter_ms == 0 {
                warnings.push(format!(
                    "latency rule for {:?} has zero latency and jitter",
                    rule.host.as_deref().unwrap_or("<global>")
                ));
            }
        }

        if issues.is_empty() {
            Ok(warnings)
        } else {
            Err(EngineError::InvalidConfiguration { issues })
        }
    }

    pub fn effective_mtu(&self) -> usize {
        self.mtu.clamp(MIN_MTU, MAX_MTU) as usize
    }

    pub fn log_level(&self) -> &str {
        if self.logging.enable_debug {
            "debug"
        } else {
            &self.engine.log_level
        }
    }
}

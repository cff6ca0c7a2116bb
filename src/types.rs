use std::fmt;
use std::net::Ipv4Addr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// One `(ip, port)` pair to be probed.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProbeTarget {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl ProbeTarget {
    pub fn new(ip: Ipv4Addr, port: u16) -> Self {
        Self { ip, port }
    }
}

impl fmt::Display for ProbeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// A service discovered by a successful probe.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub ip: Ipv4Addr,
    pub port: u16,
    #[serde(with = "banner_text")]
    pub banner: Vec<u8>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl Device {
    pub fn new(target: ProbeTarget, banner: Vec<u8>) -> Self {
        Self {
            ip: target.ip,
            port: target.port,
            banner,
            timestamp: OffsetDateTime::now_utc(),
        }
    }

    pub fn target(&self) -> ProbeTarget {
        ProbeTarget::new(self.ip, self.port)
    }

    /// Banner decoded as lossy UTF-8.
    pub fn banner_text(&self) -> String {
        String::from_utf8_lossy(&self.banner).into_owned()
    }
}

/// Banners are raw bytes internally and lossy text on the wire.
mod banner_text {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&String::from_utf8_lossy(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(d)?;
        Ok(text.into_bytes())
    }
}

/// Periodic snapshot of the inventory size taken while a scan runs.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct HistorySample {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub devices_found: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ScanType {
    #[default]
    Range,
    Country,
}

/// Coarse scan speed mapped to a concurrency bound and connect timeout.
/// Unrecognized names in request bodies fall back to `Normal`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum Speed {
    Slow,
    #[default]
    Normal,
    Fast,
}

impl Speed {
    /// Concurrent probes before clamping; strictly increasing with speed.
    pub fn concurrency(self) -> usize {
        match self {
            Speed::Slow => 500,
            Speed::Normal => 1000,
            Speed::Fast => 2500,
        }
    }

    pub fn connect_timeout(self) -> Duration {
        match self {
            Speed::Slow => Duration::from_millis(5000),
            Speed::Normal => Duration::from_millis(4000),
            Speed::Fast => Duration::from_millis(2500),
        }
    }
}

impl std::str::FromStr for Speed {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "slow" => Ok(Speed::Slow),
            "normal" => Ok(Speed::Normal),
            "fast" => Ok(Speed::Fast),
            other => Err(format!("unknown speed: {other}")),
        }
    }
}

impl From<String> for Speed {
    fn from(s: String) -> Self {
        s.parse().unwrap_or_default()
    }
}

fn default_port_range() -> String {
    "1-1000".to_string()
}

/// A scan request as submitted by clients.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ScanConfig {
    #[serde(default)]
    pub scan_type: ScanType,
    #[serde(default)]
    pub ip_range: Option<String>,
    #[serde(default)]
    pub country_codes: Option<Vec<String>>,
    #[serde(default)]
    pub exclude_ranges: Option<String>,
    #[serde(default = "default_port_range")]
    pub port_range: String,
    #[serde(default)]
    pub speed: Speed,
}

impl ScanConfig {
    pub fn range(ip_range: impl Into<String>, port_range: impl Into<String>) -> Self {
        Self {
            scan_type: ScanType::Range,
            ip_range: Some(ip_range.into()),
            country_codes: None,
            exclude_ranges: None,
            port_range: port_range.into(),
            speed: Speed::Normal,
        }
    }

    pub fn country(codes: Vec<String>, port_range: impl Into<String>) -> Self {
        Self {
            scan_type: ScanType::Country,
            ip_range: None,
            country_codes: Some(codes),
            exclude_ranges: None,
            port_range: port_range.into(),
            speed: Speed::Normal,
        }
    }

    pub fn with_exclude(mut self, exclude: impl Into<String>) -> Self {
        self.exclude_ranges = Some(exclude.into());
        self
    }

    pub fn with_speed(mut self, speed: Speed) -> Self {
        self.speed = speed;
        self
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ScanState {
    #[default]
    Idle,
    Running,
    Paused,
}

/// Snapshot of the process-wide scan state returned to polling clients.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct ScanStatus {
    pub status: String,
    pub state: ScanState,
    pub is_scanning: bool,
    pub is_paused: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub start_time: Option<OffsetDateTime>,
    pub discovered_devices: u64,
    pub total_devices: u64,
    pub total_targets: u64,
    pub scanned_targets: u64,
    pub progress: u8,
    pub current_target: Option<String>,
}

/// Size and duration estimate for a candidate target set.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PreviewResult {
    pub range_count: usize,
    pub total_ips: u64,
    pub capped: bool,
    pub estimated_seconds: f64,
    pub estimated_time: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    pub page: usize,
    pub per_page: usize,
    pub total_items: usize,
    pub total_pages: usize,
}

/// One page of a paginated listing.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub pagination: Pagination,
}

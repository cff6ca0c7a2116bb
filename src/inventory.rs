//! Store of discovered services plus the scan history samples.
//!
//! Rows are keyed by `(ip, port)`; every listing is sorted with a total order
//! (ties broken by ip, then port) so offset pagination stays stable while the
//! set is unchanged.
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::Ipv4Addr;
use std::path::Path;

use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{ScanError, ScanResult};
use crate::types::{Device, HistorySample, Page, Pagination, ProbeTarget};

pub const MAX_PAGE_SIZE: usize = 100;
const DAILY_SUMMARY_DAYS: usize = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    TimestampDesc,
    TimestampAsc,
    Ip,
    Port,
}

impl std::str::FromStr for SortOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "timestamp" | "timestamp_desc" | "newest" => Ok(SortOrder::TimestampDesc),
            "timestamp_asc" | "oldest" => Ok(SortOrder::TimestampAsc),
            "ip" => Ok(SortOrder::Ip),
            "port" => Ok(SortOrder::Port),
            other => Err(format!("unknown sort order: {other}")),
        }
    }
}

impl SortOrder {
    fn compare(self, a: &Device, b: &Device) -> Ordering {
        let by_addr = || a.ip.cmp(&b.ip).then(a.port.cmp(&b.port));
        match self {
            SortOrder::TimestampDesc => b.timestamp.cmp(&a.timestamp).then_with(by_addr),
            SortOrder::TimestampAsc => a.timestamp.cmp(&b.timestamp).then_with(by_addr),
            SortOrder::Ip => by_addr(),
            SortOrder::Port => a.port.cmp(&b.port).then(a.ip.cmp(&b.ip)),
        }
    }
}

/// Filters for the device listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceFilter {
    /// Substring of the dotted address
    pub ip: Option<String>,
    /// Exact port
    pub port: Option<u16>,
}

impl DeviceFilter {
    fn matches(&self, d: &Device) -> bool {
        if let Some(port) = self.port {
            if d.port != port {
                return false;
            }
        }
        match self.ip.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            Some(needle) => d.ip.to_string().contains(needle),
            None => true,
        }
    }
}

/// Search terms; all present terms must match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchQuery {
    /// Free text matched against the address or the banner
    pub query: Option<String>,
    pub port: Option<u16>,
    /// Banner substring, case-insensitive
    pub banner: Option<String>,
}

impl SearchQuery {
    fn matches(&self, d: &Device) -> bool {
        if let Some(port) = self.port {
            if d.port != port {
                return false;
            }
        }
        let banner = d.banner_text().to_lowercase();
        if let Some(term) = non_empty(&self.banner) {
            if !banner.contains(&term.to_lowercase()) {
                return false;
            }
        }
        if let Some(term) = non_empty(&self.query) {
            let term = term.to_lowercase();
            if !d.ip.to_string().contains(&term) && !banner.contains(&term) {
                return false;
            }
        }
        true
    }
}

fn non_empty(s: &Option<String>) -> Option<&str> {
    s.as_deref().map(str::trim).filter(|t| !t.is_empty())
}

/// 1-based page request; `per_page` is clamped to `1..=MAX_PAGE_SIZE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: usize,
    pub per_page: usize,
}

impl PageRequest {
    pub fn new(page: usize, per_page: usize) -> Self {
        Self {
            page: page.max(1),
            per_page: per_page.clamp(1, MAX_PAGE_SIZE),
        }
    }

    fn offset(&self) -> usize {
        (self.page - 1).saturating_mul(self.per_page)
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new(1, MAX_PAGE_SIZE)
    }
}

pub fn paginate<T>(items: Vec<T>, req: PageRequest) -> Page<T> {
    let total_items = items.len();
    let total_pages = total_items.div_ceil(req.per_page);
    let items = items
        .into_iter()
        .skip(req.offset())
        .take(req.per_page)
        .collect();
    Page {
        items,
        pagination: Pagination {
            page: req.page,
            per_page: req.per_page,
            total_items,
            total_pages,
        },
    }
}

/// Per-day aggregate of the inventory.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DailySummary {
    pub date: String,
    pub devices_found: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

#[derive(Serialize, Deserialize, Default)]
struct Snapshot {
    devices: Vec<Device>,
    history: Vec<HistorySample>,
}

#[derive(Debug, Default)]
pub struct Inventory {
    devices: RwLock<HashMap<ProbeTarget, Device>>,
    history: RwLock<Vec<HistorySample>>,
}

impl Inventory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a device or replace banner and timestamp of the existing row.
    /// Returns true when the row is new.
    pub async fn upsert(&self, device: Device) -> bool {
        let mut devices = self.devices.write().await;
        match devices.get_mut(&device.target()) {
            Some(existing) => {
                existing.banner = device.banner;
                existing.timestamp = device.timestamp;
                false
            }
            None => {
                devices.insert(device.target(), device);
                true
            }
        }
    }

    pub async fn get(&self, target: ProbeTarget) -> Option<Device> {
        self.devices.read().await.get(&target).cloned()
    }

    /// Number of rows.
    pub async fn len(&self) -> u64 {
        self.devices.read().await.len() as u64
    }

    pub async fn is_empty(&self) -> bool {
        self.devices.read().await.is_empty()
    }

    /// Number of distinct addresses with at least one row.
    pub async fn host_count(&self) -> u64 {
        let devices = self.devices.read().await;
        devices.keys().map(|t| t.ip).collect::<HashSet<Ipv4Addr>>().len() as u64
    }

    /// Filtered and sorted rows without pagination.
    pub async fn list(&self, filter: &DeviceFilter, sort: SortOrder) -> Vec<Device> {
        let mut out: Vec<Device> = {
            let devices = self.devices.read().await;
            devices.values().filter(|d| filter.matches(d)).cloned().collect()
        };
        out.sort_by(|a, b| sort.compare(a, b));
        out
    }

    pub async fn query(&self, filter: &DeviceFilter, sort: SortOrder, page: PageRequest) -> Page<Device> {
        paginate(self.list(filter, sort).await, page)
    }

    /// Newest-first search over address, port and banner.
    pub async fn search(&self, query: &SearchQuery, page: PageRequest) -> Page<Device> {
        let mut out: Vec<Device> = {
            let devices = self.devices.read().await;
            devices.values().filter(|d| query.matches(d)).cloned().collect()
        };
        out.sort_by(|a, b| SortOrder::TimestampDesc.compare(a, b));
        paginate(out, page)
    }

    /// Every row, newest first.
    pub async fn export_all(&self) -> Vec<Device> {
        self.list(&DeviceFilter::default(), SortOrder::TimestampDesc).await
    }

    /// All rows as CSV, newest first, under an `IP,Port,Banner,Timestamp` header.
    pub async fn export_csv(&self) -> ScanResult<String> {
        let mut wtr = csv::WriterBuilder::new()
            .terminator(csv::Terminator::CRLF)
            .from_writer(Vec::new());
        wtr.write_record(["IP", "Port", "Banner", "Timestamp"])
            .map_err(csv_error)?;
        for d in self.export_all().await {
            let ts = d
                .timestamp
                .format(&time::format_description::well_known::Rfc3339)
                .unwrap_or_default();
            wtr.write_record([d.ip.to_string(), d.port.to_string(), d.banner_text(), ts])
                .map_err(csv_error)?;
        }
        let bytes = wtr
            .into_inner()
            .map_err(|e| ScanError::Persistence(format!("csv export: {e}")))?;
        String::from_utf8(bytes).map_err(|e| ScanError::Persistence(format!("csv export: {e}")))
    }

    pub async fn record_sample(&self, devices_found: u64) -> HistorySample {
        let sample = HistorySample {
            timestamp: OffsetDateTime::now_utc(),
            devices_found,
        };
        self.history.write().await.push(sample.clone());
        sample
    }

    /// History samples, newest first.
    pub async fn history(&self, page: PageRequest) -> Page<HistorySample> {
        let samples: Vec<HistorySample> = self.history.read().await.iter().rev().cloned().collect();
        paginate(samples, page)
    }

    /// Distinct addresses seen per UTC day for the latest 30 days, newest first.
    pub async fn daily_summary(&self) -> Vec<DailySummary> {
        let devices = self.devices.read().await;
        let mut days: BTreeMap<Date, (HashSet<Ipv4Addr>, OffsetDateTime)> = BTreeMap::new();
        for d in devices.values() {
            let ts = d.timestamp.to_offset(time::UtcOffset::UTC);
            let entry = days.entry(ts.date()).or_insert_with(|| (HashSet::new(), ts));
            entry.0.insert(d.ip);
            entry.1 = entry.1.min(ts);
        }
        days.into_iter()
            .rev()
            .take(DAILY_SUMMARY_DAYS)
            .map(|(date, (ips, first))| DailySummary {
                date: date.to_string(),
                devices_found: ips.len() as u64,
                timestamp: first,
            })
            .collect()
    }

    /// Write devices and history as JSON, replacing `path` atomically.
    pub async fn save_to(&self, path: &Path) -> ScanResult<()> {
        let snapshot = Snapshot {
            devices: self.devices.read().await.values().cloned().collect(),
            history: self.history.read().await.clone(),
        };
        let json = serde_json::to_vec_pretty(&snapshot)
            .map_err(|e| ScanError::Persistence(e.to_string()))?;
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| ScanError::Persistence(format!("{}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| ScanError::Persistence(format!("{}: {e}", path.display())))?;
        debug!(path = %path.display(), devices = snapshot.devices.len(), "saved inventory snapshot");
        Ok(())
    }

    /// Load a snapshot written by [`Inventory::save_to`]; a missing file yields an empty inventory.
    pub async fn load_from(path: &Path) -> ScanResult<Self> {
        let bytes = match tokio::fs::read(path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::new()),
            Err(e) => return Err(ScanError::Persistence(format!("{}: {e}", path.display()))),
        };
        let snapshot: Snapshot = serde_json::from_slice(&bytes)
            .map_err(|e| ScanError::Persistence(format!("{}: {e}", path.display())))?;
        let devices = snapshot
            .devices
            .into_iter()
            .map(|d| (d.target(), d))
            .collect();
        Ok(Self {
            devices: RwLock::new(devices),
            history: RwLock::new(snapshot.history),
        })
    }
}

fn csv_error(e: csv::Error) -> ScanError {
    ScanError::Persistence(format!("csv export: {e}"))
}

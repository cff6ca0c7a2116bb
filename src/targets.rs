//! Expansion of scan requests into ordered `(ip, port)` probe targets.
//!
//! Address sets are kept as sorted, disjoint, inclusive IPv4 intervals so that
//! country-sized scans never materialize individual addresses. Targets are
//! produced lazily by [`TargetIter`], IP-major: every port of one address before
//! moving to the next address.
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use tracing::{debug, warn};

use crate::config::ScannerConfig;
use crate::country::CountryResolver;
use crate::error::{ScanError, ScanResult};
use crate::ports::parse_port_spec;
use crate::types::{PreviewResult, ProbeTarget, ScanConfig, ScanType};

/// Inclusive range of IPv4 addresses stored as integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Ipv4Interval {
    pub start: u32,
    pub end: u32,
}

impl Ipv4Interval {
    pub fn new(start: Ipv4Addr, end: Ipv4Addr) -> Self {
        Self {
            start: u32::from(start),
            end: u32::from(end),
        }
    }

    /// Number of addresses covered; never zero.
    pub fn count(&self) -> u64 {
        u64::from(self.end - self.start) + 1
    }
}

/// Sorted, merged set of IPv4 intervals.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IpSet {
    intervals: Vec<Ipv4Interval>,
}

impl IpSet {
    /// Build a set from arbitrary, possibly overlapping intervals.
    pub fn from_intervals(mut raw: Vec<Ipv4Interval>) -> Self {
        raw.sort();
        let mut merged: Vec<Ipv4Interval> = Vec::with_capacity(raw.len());
        for iv in raw {
            match merged.last_mut() {
                Some(last) if iv.start <= last.end.saturating_add(1) => {
                    last.end = last.end.max(iv.end);
                }
                _ => merged.push(iv),
            }
        }
        Self { intervals: merged }
    }

    pub fn intervals(&self) -> &[Ipv4Interval] {
        &self.intervals
    }

    /// Number of addresses in the set.
    pub fn len(&self) -> u64 {
        self.intervals.iter().map(Ipv4Interval::count).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let n = u32::from(ip);
        self.intervals
            .binary_search_by(|iv| {
                if iv.end < n {
                    std::cmp::Ordering::Less
                } else if iv.start > n {
                    std::cmp::Ordering::Greater
                } else {
                    std::cmp::Ordering::Equal
                }
            })
            .is_ok()
    }

    pub fn union(&self, other: &IpSet) -> IpSet {
        let mut all = self.intervals.clone();
        all.extend_from_slice(&other.intervals);
        IpSet::from_intervals(all)
    }

    /// Addresses in `self` that are not in `other`.
    pub fn subtract(&self, other: &IpSet) -> IpSet {
        let mut out = Vec::new();
        let mut cut = other.intervals.iter().peekable();
        for iv in &self.intervals {
            let mut start = iv.start;
            let end = iv.end;
            let mut exhausted = false;
            while let Some(ex) = cut.peek() {
                if ex.end < start {
                    cut.next();
                    continue;
                }
                if ex.start > end {
                    break;
                }
                if ex.start > start {
                    out.push(Ipv4Interval { start, end: ex.start - 1 });
                }
                if ex.end >= end {
                    exhausted = true;
                    break;
                }
                start = ex.end + 1;
                cut.next();
            }
            if !exhausted {
                out.push(Ipv4Interval { start, end });
            }
        }
        IpSet { intervals: out }
    }
}

/// Parse one range entry: `a.b.c.d`, `a.b.c.d-e`, `a.b.c.d-w.x.y.z` or `a.b.c.d/n`.
pub fn parse_range_entry(entry: &str) -> Option<Ipv4Interval> {
    let entry = entry.trim();
    if entry.contains('/') {
        let net: Ipv4Net = entry.parse().ok()?;
        return Some(Ipv4Interval::new(net.network(), net.broadcast()));
    }
    if let Some((a, b)) = entry.split_once('-') {
        let start: Ipv4Addr = a.trim().parse().ok()?;
        let b = b.trim();
        let end: Ipv4Addr = if let Ok(last) = b.parse::<u8>() {
            let o = start.octets();
            Ipv4Addr::new(o[0], o[1], o[2], last)
        } else {
            b.parse().ok()?
        };
        if u32::from(start) > u32::from(end) {
            return None;
        }
        return Some(Ipv4Interval::new(start, end));
    }
    let ip: Ipv4Addr = entry.parse().ok()?;
    Some(Ipv4Interval::new(ip, ip))
}

/// Parse newline-delimited range text into intervals, one entry per line.
///
/// Commas may also separate entries on a line; `#` starts a comment. The first
/// malformed entry fails the whole text with its 1-based line number.
pub fn parse_range_text(text: &str) -> ScanResult<Vec<Ipv4Interval>> {
    let mut out = Vec::new();
    for (idx, raw_line) in text.lines().enumerate() {
        let line = raw_line.split('#').next().unwrap_or("");
        for entry in line.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let iv = parse_range_entry(entry).ok_or_else(|| ScanError::InvalidRangeSyntax {
                line: idx + 1,
                text: entry.to_string(),
            })?;
            out.push(iv);
        }
    }
    Ok(out)
}

/// Cartesian product of an address set and a port list, enumerated lazily.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetSet {
    ips: IpSet,
    ports: Vec<u16>,
}

impl TargetSet {
    pub fn new(ips: IpSet, ports: Vec<u16>) -> Self {
        Self { ips, ports }
    }

    pub fn ips(&self) -> &IpSet {
        &self.ips
    }

    pub fn ports(&self) -> &[u16] {
        &self.ports
    }

    /// Total number of targets; at most 2^32 * 65535, which fits in a u64.
    pub fn total(&self) -> u64 {
        self.ips.len() * self.ports.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    pub fn contains(&self, target: &ProbeTarget) -> bool {
        self.ips.contains(target.ip) && self.ports.contains(&target.port)
    }

    pub fn iter(&self) -> TargetIter {
        self.iter_from(0)
    }

    /// Iterator positioned at the `pos`-th target (0-based).
    pub fn iter_from(&self, pos: u64) -> TargetIter {
        let mut it = TargetIter {
            intervals: self.ips.intervals.clone(),
            ports: self.ports.clone(),
            interval_idx: 0,
            next_ip: 0,
            port_idx: 0,
            position: pos.min(self.total()),
        };
        if self.ports.is_empty() {
            it.interval_idx = it.intervals.len();
            return it;
        }

        let nports = self.ports.len() as u64;
        let mut ip_offset = pos / nports;
        it.port_idx = (pos % nports) as usize;
        while let Some(iv) = it.intervals.get(it.interval_idx) {
            if ip_offset < iv.count() {
                it.next_ip = iv.start + ip_offset as u32;
                return it;
            }
            ip_offset -= iv.count();
            it.interval_idx += 1;
        }
        it.port_idx = 0;
        it
    }
}

/// Lazy, resumable enumeration of a [`TargetSet`].
#[derive(Debug, Clone)]
pub struct TargetIter {
    intervals: Vec<Ipv4Interval>,
    ports: Vec<u16>,
    interval_idx: usize,
    next_ip: u32,
    port_idx: usize,
    position: u64,
}

impl TargetIter {
    /// Index of the next target this iterator will yield.
    pub fn position(&self) -> u64 {
        self.position
    }
}

impl Iterator for TargetIter {
    type Item = ProbeTarget;

    fn next(&mut self) -> Option<ProbeTarget> {
        let iv = *self.intervals.get(self.interval_idx)?;
        let target = ProbeTarget::new(Ipv4Addr::from(self.next_ip), self.ports[self.port_idx]);
        self.position += 1;
        self.port_idx += 1;
        if self.port_idx == self.ports.len() {
            self.port_idx = 0;
            if self.next_ip == iv.end {
                self.interval_idx += 1;
                if let Some(next) = self.intervals.get(self.interval_idx) {
                    self.next_ip = next.start;
                }
            } else {
                self.next_ip += 1;
            }
        }
        Some(target)
    }
}

/// Expand explicit range text, exclusions and a port spec into a target set.
pub fn expand_ranges(ranges: &str, exclude: Option<&str>, port_spec: &str) -> ScanResult<TargetSet> {
    let include = IpSet::from_intervals(parse_range_text(ranges)?);
    let exclude = match exclude {
        Some(text) => IpSet::from_intervals(parse_range_text(text)?),
        None => IpSet::default(),
    };
    let ports = parse_port_spec(port_spec)?;
    Ok(TargetSet::new(include.subtract(&exclude), ports))
}

/// Validate a scan request and expand it into its target set.
///
/// Country codes are resolved through `resolver`; codes that fail to resolve
/// are skipped. Exclusions are applied before the set is returned, so counts
/// taken from the result already reflect them.
pub async fn expand(config: &ScanConfig, resolver: &dyn CountryResolver) -> ScanResult<TargetSet> {
    let ports = parse_port_spec(&config.port_range)?;
    if ports.is_empty() {
        return Err(ScanError::InvalidConfig("no ports to scan".into()));
    }

    let include = match config.scan_type {
        ScanType::Range => {
            let text = config.ip_range.as_deref().unwrap_or("");
            if text.trim().is_empty() {
                return Err(ScanError::InvalidConfig("IP range is required for range scans".into()));
            }
            IpSet::from_intervals(parse_range_text(text)?)
        }
        ScanType::Country => {
            let codes = config.country_codes.as_deref().unwrap_or(&[]);
            if codes.iter().all(|c| c.trim().is_empty()) {
                return Err(ScanError::InvalidConfig(
                    "at least one country code is required for country scans".into(),
                ));
            }
            resolve_countries(codes, resolver).await?
        }
    };

    let exclude = match config.exclude_ranges.as_deref() {
        Some(text) => IpSet::from_intervals(parse_range_text(text)?),
        None => IpSet::default(),
    };

    Ok(TargetSet::new(include.subtract(&exclude), ports))
}

async fn resolve_countries(codes: &[String], resolver: &dyn CountryResolver) -> ScanResult<IpSet> {
    let mut intervals = Vec::new();
    for code in codes.iter().map(|c| c.trim().to_ascii_uppercase()).filter(|c| !c.is_empty()) {
        match resolver.ranges(&code).await {
            Ok(ranges) => {
                debug!(country = %code, ranges = ranges.len(), "resolved country ranges");
                for r in ranges {
                    match parse_range_entry(&r) {
                        Some(iv) => intervals.push(iv),
                        None => warn!(country = %code, range = %r, "skipping unparsable country range"),
                    }
                }
            }
            Err(e) => warn!(country = %code, error = %e, "country lookup failed, skipping"),
        }
    }
    if intervals.is_empty() {
        return Err(ScanError::InvalidConfig(
            "no valid IP ranges found for the selected countries".into(),
        ));
    }
    Ok(IpSet::from_intervals(intervals))
}

/// Size and duration estimate for candidate ranges minus exclusions.
pub fn preview(ranges: &[String], exclude: &[String], cfg: &ScannerConfig) -> ScanResult<PreviewResult> {
    let include = parse_range_text(&ranges.join("\n"))?;
    let range_count = include.len();
    let exclude = IpSet::from_intervals(parse_range_text(&exclude.join("\n"))?);
    let set = IpSet::from_intervals(include).subtract(&exclude);

    let actual = set.len();
    let capped = actual > cfg.preview_cap;
    let total_ips = actual.min(cfg.preview_cap);
    let estimated_seconds = total_ips as f64 / cfg.probe_rate.max(1) as f64;

    Ok(PreviewResult {
        range_count,
        total_ips,
        capped,
        estimated_seconds,
        estimated_time: format_estimate(estimated_seconds),
    })
}

/// Human readable duration: seconds under a minute, minutes under an hour, else hours.
pub fn format_estimate(seconds: f64) -> String {
    if seconds < 60.0 {
        format!("{} seconds", seconds as u64)
    } else if seconds < 3600.0 {
        format!("{} minutes", (seconds / 60.0) as u64)
    } else {
        format!("{:.1} hours", seconds / 3600.0)
    }
}

use std::time::Duration;

use crate::probe::{HTTP_PORTS, TLS_PORTS};

/// Tunables for the scan engine and the inventory views.
#[derive(Debug, Clone)]
pub struct ScannerConfig {
    /// Upper bound on concurrent probes regardless of speed
    pub max_concurrency: usize,

    /// Concurrent manual rescans, kept apart from the bulk scan budget
    pub rescan_concurrency: usize,

    /// Connect timeout for manual rescans
    pub rescan_timeout: Duration,

    /// How long to wait for a service to speak after connecting
    pub banner_timeout: Duration,

    /// Maximum banner bytes kept per device
    pub banner_max_bytes: usize,

    /// Ports where a silent service is sent `GET /`
    pub http_ports: Vec<u16>,

    /// Ports where a TLS handshake precedes the `GET /`
    pub tls_ports: Vec<u16>,

    /// Addresses per second used for preview estimates
    pub probe_rate: u64,

    /// Preview address counts are capped at this value
    pub preview_cap: u64,

    /// Interval between history samples during a scan
    pub history_interval: Duration,

    /// Page size used when a client does not ask for one
    pub default_page_size: usize,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 5_000,
            rescan_concurrency: 8,
            rescan_timeout: Duration::from_secs(2),
            banner_timeout: Duration::from_millis(500),
            banner_max_bytes: 1024,
            http_ports: HTTP_PORTS.to_vec(),
            tls_ports: TLS_PORTS.to_vec(),
            probe_rate: 1_000,
            preview_cap: u32::MAX as u64,
            history_interval: Duration::from_secs(10),
            default_page_size: 100,
        }
    }
}

impl ScannerConfig {
    /// Effective concurrency for a requested bound, clamped to `1..=max_concurrency`.
    pub fn clamp_concurrency(&self, requested: usize) -> usize {
        requested.clamp(1, self.max_concurrency.max(1))
    }
}

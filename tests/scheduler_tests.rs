use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use eternal_scan::config::ScannerConfig;
use eternal_scan::country::StaticResolver;
use eternal_scan::error::ScanError;
use eternal_scan::inventory::{Inventory, PageRequest};
use eternal_scan::probe::{ProbeOutcome, Prober};
use eternal_scan::scanner::Scanner;
use eternal_scan::types::{ProbeTarget, ScanConfig, ScanState, Speed};

/// Answers from a fixed set of open targets and records every probe it receives.
struct MockProber {
    open: HashSet<ProbeTarget>,
    delay: Duration,
    hold: Option<Arc<Semaphore>>,
    log: Mutex<Vec<ProbeTarget>>,
}

impl MockProber {
    fn new(open: &[ProbeTarget]) -> Self {
        Self {
            open: open.iter().copied().collect(),
            delay: Duration::ZERO,
            hold: None,
            log: Mutex::new(Vec::new()),
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Probes block until the returned semaphore receives permits.
    fn held(mut self) -> (Self, Arc<Semaphore>) {
        let sem = Arc::new(Semaphore::new(0));
        self.hold = Some(sem.clone());
        (self, sem)
    }

    fn probed(&self) -> Vec<ProbeTarget> {
        self.log.lock().unwrap().clone()
    }
}

#[async_trait]
impl Prober for MockProber {
    async fn probe(&self, target: ProbeTarget, _timeout: Duration) -> ProbeOutcome {
        self.log.lock().unwrap().push(target);
        if let Some(hold) = &self.hold {
            let _ = hold.acquire().await;
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.open.contains(&target) {
            ProbeOutcome::open(Some(format!("banner {target}").into_bytes()))
        } else {
            ProbeOutcome::closed()
        }
    }
}

fn target(ip: [u8; 4], port: u16) -> ProbeTarget {
    ProbeTarget::new(Ipv4Addr::from(ip), port)
}

fn scanner_with(prober: Arc<MockProber>, max_concurrency: usize) -> Scanner {
    let cfg = ScannerConfig {
        max_concurrency,
        history_interval: Duration::from_secs(3600),
        ..ScannerConfig::default()
    };
    Scanner::new(
        cfg,
        prober,
        Arc::new(StaticResolver::new().with_country("AA", &["10.9.0.0/31"])),
        Arc::new(Inventory::new()),
    )
}

async fn wait_idle(scanner: &Scanner) {
    let mut rx = scanner.subscribe();
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == ScanState::Idle))
        .await
        .expect("scan did not finish in time")
        .unwrap();
}

#[tokio::test]
async fn scan_runs_to_completion() {
    let open = [target([10, 0, 0, 1], 22), target([10, 0, 0, 3], 80)];
    let prober = Arc::new(MockProber::new(&open));
    let scanner = scanner_with(prober.clone(), 4);

    let total = scanner
        .start(ScanConfig::range("10.0.0.0/30", "22,80"))
        .await
        .unwrap();
    assert_eq!(total, 8);
    wait_idle(&scanner).await;

    let status = scanner.status().await;
    assert_eq!(status.status, "Scan completed");
    assert_eq!(status.state, ScanState::Idle);
    assert!(!status.is_scanning);
    assert_eq!(status.total_targets, 8);
    assert_eq!(status.scanned_targets, 8);
    assert_eq!(status.discovered_devices, 2);
    assert_eq!(status.total_devices, 2);
    assert_eq!(status.progress, 100);
    assert!(status.start_time.is_some());

    let probed: HashSet<_> = prober.probed().into_iter().collect();
    assert_eq!(probed.len(), 8);

    let inv = scanner.inventory();
    assert_eq!(inv.len().await, 2);
    let d = inv.get(open[0]).await.unwrap();
    assert_eq!(d.banner_text(), "banner 10.0.0.1:22");
    // the run ends with a history sample
    let history = inv.history(PageRequest::default()).await;
    assert_eq!(history.items[0].devices_found, 2);
}

#[tokio::test]
async fn country_scan_uses_resolver() {
    let prober = Arc::new(MockProber::new(&[]));
    let scanner = scanner_with(prober.clone(), 4);
    let total = scanner
        .start(ScanConfig::country(vec!["aa".into()], "443"))
        .await
        .unwrap();
    assert_eq!(total, 2);
    wait_idle(&scanner).await;
    assert_eq!(prober.probed().len(), 2);
}

#[tokio::test]
async fn second_start_is_rejected() {
    let (mock, release) = MockProber::new(&[]).held();
    let scanner = scanner_with(Arc::new(mock), 4);

    scanner.start(ScanConfig::range("10.0.0.0/30", "80")).await.unwrap();
    assert_eq!(
        scanner.start(ScanConfig::range("10.0.1.0/30", "80")).await,
        Err(ScanError::ScanAlreadyRunning)
    );

    scanner.stop().await.unwrap();
    release.add_permits(64);
}

#[tokio::test]
async fn concurrent_starts_admit_exactly_one() {
    let (mock, release) = MockProber::new(&[]).held();
    let scanner = scanner_with(Arc::new(mock), 4);

    let (a, b) = tokio::join!(
        scanner.start(ScanConfig::range("10.0.0.0/30", "80")),
        scanner.start(ScanConfig::range("10.0.1.0/30", "80")),
    );
    assert_eq!([a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count(), 1);
    let err = if a.is_err() { a } else { b };
    assert_eq!(err.map(|_| ()), Err(ScanError::ScanAlreadyRunning));

    scanner.stop().await.unwrap();
    release.add_permits(64);
}

#[tokio::test]
async fn stop_discards_late_results() {
    let open = [target([10, 0, 0, 1], 80), target([10, 0, 0, 2], 80)];
    let (mock, release) = MockProber::new(&open).held();
    let scanner = scanner_with(Arc::new(mock), 8);

    scanner.start(ScanConfig::range("10.0.0.0/29", "80")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(scanner.status().await.current_target.is_some());

    scanner.stop().await.unwrap();
    let after_stop = scanner.status().await;
    assert_eq!(after_stop.status, "Scan stopped");
    assert!(!after_stop.is_scanning);
    assert!(!after_stop.is_paused);

    // let the abandoned probes answer
    release.add_permits(64);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(scanner.inventory().is_empty().await);
    assert_eq!(scanner.status().await, after_stop);
    assert_eq!(scanner.stop().await, Err(ScanError::NotRunning));
}

#[tokio::test]
async fn pause_and_resume_probe_each_target_once() {
    let mock = MockProber::new(&[target([10, 0, 0, 2], 443)]).with_delay(Duration::from_millis(10));
    let prober = Arc::new(mock);
    let scanner = scanner_with(prober.clone(), 2);

    let config = ScanConfig::range("10.0.0.0/30", "21,22,80,443,8080").with_speed(Speed::Slow);
    assert_eq!(scanner.start(config).await.unwrap(), 20);
    tokio::time::sleep(Duration::from_millis(25)).await;
    scanner.pause().await.unwrap();

    let paused = scanner.status().await;
    assert!(paused.is_scanning && paused.is_paused);
    assert_eq!(paused.status, "Scan paused");

    // in-flight probes drain, then nothing new is dispatched
    tokio::time::sleep(Duration::from_millis(60)).await;
    let dispatched = prober.probed().len();
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(prober.probed().len(), dispatched);
    assert!(dispatched < 20);

    scanner.resume().await.unwrap();
    wait_idle(&scanner).await;

    let probed = prober.probed();
    assert_eq!(probed.len(), 20);
    assert_eq!(probed.iter().collect::<HashSet<_>>().len(), 20);
    let status = scanner.status().await;
    assert_eq!(status.scanned_targets, 20);
    assert_eq!(status.discovered_devices, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn nothing_is_dispatched_once_pause_returns() {
    let prober = Arc::new(MockProber::new(&[]));
    let scanner = scanner_with(prober, 64);

    for _ in 0..20 {
        let config = ScanConfig::range("10.0.0.0/14", "80").with_speed(Speed::Fast);
        scanner.start(config).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        if scanner.pause().await.is_err() {
            wait_idle(&scanner).await;
            continue;
        }
        let at_pause = scanner.status().await.current_target;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(scanner.status().await.current_target, at_pause);
        scanner.stop().await.unwrap();
    }
}

#[tokio::test]
async fn illegal_transitions_are_rejected() {
    let (mock, release) = MockProber::new(&[]).held();
    let scanner = scanner_with(Arc::new(mock), 4);

    assert_eq!(scanner.pause().await, Err(ScanError::NotRunning));
    assert_eq!(scanner.resume().await, Err(ScanError::NotPaused));
    assert_eq!(scanner.stop().await, Err(ScanError::NotRunning));

    scanner.start(ScanConfig::range("10.0.0.1", "80")).await.unwrap();
    assert_eq!(scanner.resume().await, Err(ScanError::NotPaused));
    scanner.pause().await.unwrap();
    assert_eq!(scanner.pause().await, Err(ScanError::NotRunning));

    // stop is valid from paused
    scanner.stop().await.unwrap();
    assert_eq!(scanner.status().await.state, ScanState::Idle);
    release.add_permits(64);
}

#[tokio::test]
async fn invalid_requests_leave_scanner_idle() {
    let prober = Arc::new(MockProber::new(&[]));
    let scanner = scanner_with(prober.clone(), 4);

    let excluded = ScanConfig::range("10.0.0.0/30", "80").with_exclude("10.0.0.0/24");
    assert!(matches!(
        scanner.start(excluded).await,
        Err(ScanError::InvalidConfig(_))
    ));
    assert!(matches!(
        scanner.start(ScanConfig::range("10.0.0.999", "80")).await,
        Err(ScanError::InvalidRangeSyntax { line: 1, .. })
    ));

    let status = scanner.status().await;
    assert_eq!(status.state, ScanState::Idle);
    assert_eq!(status.status, "idle");
    assert!(prober.probed().is_empty());
}

#[tokio::test]
async fn rescan_updates_one_device_only() {
    let open = target([10, 0, 0, 7], 8080);
    let prober = Arc::new(MockProber::new(&[open]));
    let scanner = scanner_with(prober.clone(), 4);

    let device = scanner.rescan(open).await.unwrap().expect("open target");
    assert_eq!(device.target(), open);
    assert!(scanner.rescan(target([10, 0, 0, 7], 22)).await.unwrap().is_none());

    assert_eq!(scanner.inventory().len().await, 1);
    let status = scanner.status().await;
    assert_eq!(status.scanned_targets, 0);
    assert_eq!(status.discovered_devices, 0);
    assert_eq!(status.total_devices, 1);
}

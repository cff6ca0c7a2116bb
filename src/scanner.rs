//! Scan scheduler: the single process-wide scan and its probe worker pool.
//!
//! State transitions are serialized on one `tokio::sync::Mutex`. Each run owns a
//! cancellation token, a pause flag held across each dispatch and a result gate;
//! the gate is closed by whoever ends the run (stop or completion) before the
//! state returns to idle,
//! and probe results are only applied while holding it open, so a late probe can
//! never write into the inventory after the run has ended.
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::ScannerConfig;
use crate::country::CountryResolver;
use crate::error::{ScanError, ScanResult};
use crate::inventory::Inventory;
use crate::probe::Prober;
use crate::targets::{self, TargetSet};
use crate::types::{Device, ProbeTarget, ScanConfig, ScanState, ScanStatus, Speed};

const LABEL_IDLE: &str = "idle";
const LABEL_SCANNING: &str = "Scanning";
const LABEL_PAUSED: &str = "Scan paused";
const LABEL_STOPPED: &str = "Scan stopped";
const LABEL_COMPLETED: &str = "Scan completed";

/// Progress counters of one run, updated lock-free by the workers.
#[derive(Debug)]
pub struct RunProgress {
    pub start_time: OffsetDateTime,
    pub total: u64,
    scanned: AtomicU64,
    discovered: AtomicU64,
    /// 0 when unset, otherwise `(ip << 16 | port) + 1`
    current: AtomicU64,
}

impl RunProgress {
    fn new(total: u64) -> Self {
        Self {
            start_time: OffsetDateTime::now_utc(),
            total,
            scanned: AtomicU64::new(0),
            discovered: AtomicU64::new(0),
            current: AtomicU64::new(0),
        }
    }

    pub fn scanned(&self) -> u64 {
        self.scanned.load(Ordering::Relaxed)
    }

    pub fn discovered(&self) -> u64 {
        self.discovered.load(Ordering::Relaxed)
    }

    pub fn current(&self) -> Option<ProbeTarget> {
        match self.current.load(Ordering::Relaxed) {
            0 => None,
            v => {
                let v = v - 1;
                Some(ProbeTarget::new(Ipv4Addr::from((v >> 16) as u32), v as u16))
            }
        }
    }

    fn set_current(&self, t: ProbeTarget) {
        let v = ((u32::from(t.ip) as u64) << 16 | t.port as u64) + 1;
        self.current.store(v, Ordering::Relaxed);
    }
}

/// Counters frozen when a run ends; reported while idle.
#[derive(Debug, Clone, Default)]
struct LastRun {
    start_time: Option<OffsetDateTime>,
    total: u64,
    scanned: u64,
    discovered: u64,
}

impl LastRun {
    fn from_progress(p: &RunProgress) -> Self {
        Self {
            start_time: Some(p.start_time),
            total: p.total,
            scanned: p.scanned(),
            discovered: p.discovered(),
        }
    }
}

/// State shared between the control surface and the tasks of one run.
struct RunShared {
    generation: u64,
    cancel: CancellationToken,
    /// true while probe results may be applied
    gate: Mutex<bool>,
    /// true while paused; held across each dispatch
    paused: Mutex<bool>,
    progress: RunProgress,
}

struct RunHandle {
    shared: Arc<RunShared>,
    pause: watch::Sender<bool>,
}

struct Control {
    state: ScanState,
    label: String,
    generation: u64,
    run: Option<RunHandle>,
    last: LastRun,
}

struct Inner {
    cfg: ScannerConfig,
    prober: Arc<dyn Prober>,
    resolver: Arc<dyn CountryResolver>,
    inventory: Arc<Inventory>,
    control: Mutex<Control>,
    state_tx: watch::Sender<ScanState>,
    rescan_lane: Arc<Semaphore>,
    state_file: Option<PathBuf>,
}

/// Handle to the scan scheduler. Cheap to clone; all clones share one scan.
#[derive(Clone)]
pub struct Scanner {
    inner: Arc<Inner>,
}

impl Scanner {
    pub fn new(
        cfg: ScannerConfig,
        prober: Arc<dyn Prober>,
        resolver: Arc<dyn CountryResolver>,
        inventory: Arc<Inventory>,
    ) -> Self {
        Self::build(cfg, prober, resolver, inventory, None)
    }

    /// Like [`Scanner::new`], writing an inventory snapshot to `path` after every run.
    pub fn with_state_file(
        cfg: ScannerConfig,
        prober: Arc<dyn Prober>,
        resolver: Arc<dyn CountryResolver>,
        inventory: Arc<Inventory>,
        path: PathBuf,
    ) -> Self {
        Self::build(cfg, prober, resolver, inventory, Some(path))
    }

    fn build(
        cfg: ScannerConfig,
        prober: Arc<dyn Prober>,
        resolver: Arc<dyn CountryResolver>,
        inventory: Arc<Inventory>,
        state_file: Option<PathBuf>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ScanState::Idle);
        let rescan_lane = Arc::new(Semaphore::new(cfg.rescan_concurrency.max(1)));
        Self {
            inner: Arc::new(Inner {
                cfg,
                prober,
                resolver,
                inventory,
                control: Mutex::new(Control {
                    state: ScanState::Idle,
                    label: LABEL_IDLE.into(),
                    generation: 0,
                    run: None,
                    last: LastRun::default(),
                }),
                state_tx,
                rescan_lane,
                state_file,
            }),
        }
    }

    pub fn inventory(&self) -> &Arc<Inventory> {
        &self.inner.inventory
    }

    pub fn resolver(&self) -> &Arc<dyn CountryResolver> {
        &self.inner.resolver
    }

    pub fn config(&self) -> &ScannerConfig {
        &self.inner.cfg
    }

    /// Receiver that observes every state transition.
    pub fn subscribe(&self) -> watch::Receiver<ScanState> {
        self.inner.state_tx.subscribe()
    }

    /// Validate `config`, expand its targets and begin dispatching.
    /// Returns the number of targets in the run.
    pub async fn start(&self, config: ScanConfig) -> ScanResult<u64> {
        if self.inner.control.lock().await.state != ScanState::Idle {
            return Err(ScanError::ScanAlreadyRunning);
        }

        let targets = targets::expand(&config, self.inner.resolver.as_ref()).await?;
        if targets.is_empty() {
            return Err(ScanError::InvalidConfig(
                "no targets remain after exclusions".into(),
            ));
        }
        let total = targets.total();

        let mut control = self.inner.control.lock().await;
        // Re-checked: expansion ran without the lock held.
        if control.state != ScanState::Idle {
            return Err(ScanError::ScanAlreadyRunning);
        }

        control.generation += 1;
        let shared = Arc::new(RunShared {
            generation: control.generation,
            cancel: CancellationToken::new(),
            gate: Mutex::new(true),
            paused: Mutex::new(false),
            progress: RunProgress::new(total),
        });
        let (pause_tx, pause_rx) = watch::channel(false);

        control.run = Some(RunHandle {
            shared: shared.clone(),
            pause: pause_tx,
        });
        control.state = ScanState::Running;
        control.label = LABEL_SCANNING.into();
        control.last = LastRun::default();
        self.publish(&control);
        drop(control);

        let concurrency = self.inner.cfg.clamp_concurrency(config.speed.concurrency());
        info!(
            targets = total,
            ports = targets.ports().len(),
            concurrency,
            speed = ?config.speed,
            "scan started"
        );

        tokio::spawn(sample_history(self.inner.clone(), shared.clone()));
        tokio::spawn(run_scan(self.inner.clone(), shared, targets, config.speed, pause_rx));
        Ok(total)
    }

    /// Halt dispatch of new probes; in-flight probes finish.
    pub async fn pause(&self) -> ScanResult<()> {
        let mut control = self.inner.control.lock().await;
        if control.state != ScanState::Running {
            return Err(ScanError::NotRunning);
        }
        if let Some(run) = &control.run {
            // Waits out an in-progress dispatch; none starts after this.
            *run.shared.paused.lock().await = true;
            run.pause.send_replace(true);
        }
        control.state = ScanState::Paused;
        control.label = LABEL_PAUSED.into();
        self.publish(&control);
        info!("scan paused");
        Ok(())
    }

    /// Continue dispatching from the next undispatched target.
    pub async fn resume(&self) -> ScanResult<()> {
        let mut control = self.inner.control.lock().await;
        if control.state != ScanState::Paused {
            return Err(ScanError::NotPaused);
        }
        if let Some(run) = &control.run {
            *run.shared.paused.lock().await = false;
            run.pause.send_replace(false);
        }
        control.state = ScanState::Running;
        control.label = LABEL_SCANNING.into();
        self.publish(&control);
        info!("scan resumed");
        Ok(())
    }

    /// Cancel in-flight and pending probes and return to idle.
    pub async fn stop(&self) -> ScanResult<()> {
        let mut control = self.inner.control.lock().await;
        let Some(run) = control.run.take() else {
            return Err(ScanError::NotRunning);
        };
        finalize(&self.inner, &mut control, run, LABEL_STOPPED).await;
        drop(control);
        persist(&self.inner).await;
        Ok(())
    }

    /// Probe one target outside the bulk scan, in the separate rescan lane.
    /// A successful probe upserts the device; scan counters are untouched.
    pub fn rescan(&self, target: ProbeTarget) -> JoinHandle<Option<Device>> {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let _permit = inner.rescan_lane.clone().acquire_owned().await.ok()?;
            let outcome = inner.prober.probe(target, inner.cfg.rescan_timeout).await;
            if !outcome.success {
                debug!(%target, "rescan found nothing");
                return None;
            }
            let device = Device::new(target, outcome.banner.unwrap_or_default());
            inner.inventory.upsert(device.clone()).await;
            debug!(%target, "rescan updated device");
            Some(device)
        })
    }

    /// Snapshot of the scan state; no side effects.
    pub async fn status(&self) -> ScanStatus {
        let (state, label, run, last) = {
            let control = self.inner.control.lock().await;
            (
                control.state,
                control.label.clone(),
                control.run.as_ref().map(|r| r.shared.clone()),
                control.last.clone(),
            )
        };

        let (start_time, total, scanned, discovered, current) = match &run {
            Some(run) => {
                let p = &run.progress;
                (Some(p.start_time), p.total, p.scanned(), p.discovered(), p.current())
            }
            None => (last.start_time, last.total, last.scanned, last.discovered, None),
        };
        let percent = if total == 0 {
            0
        } else {
            (scanned.min(total) * 100 / total) as u8
        };

        ScanStatus {
            status: label,
            state,
            is_scanning: state != ScanState::Idle,
            is_paused: state == ScanState::Paused,
            start_time,
            discovered_devices: discovered,
            total_devices: self.inner.inventory.host_count().await,
            total_targets: total,
            scanned_targets: scanned,
            progress: percent,
            current_target: current.map(|t| t.to_string()),
        }
    }

    fn publish(&self, control: &Control) {
        self.inner.state_tx.send_replace(control.state);
    }
}

/// End a run: cancel its probes, close its result gate, freeze counters and go idle.
async fn finalize(inner: &Inner, control: &mut Control, run: RunHandle, label: &str) {
    let shared = run.shared;
    shared.cancel.cancel();
    *shared.gate.lock().await = false;

    let discovered = shared.progress.discovered();
    inner.inventory.record_sample(discovered).await;

    control.last = LastRun::from_progress(&shared.progress);
    control.state = ScanState::Idle;
    control.label = label.into();
    inner.state_tx.send_replace(ScanState::Idle);

    let elapsed = OffsetDateTime::now_utc() - shared.progress.start_time;
    info!(
        outcome = label,
        scanned = control.last.scanned,
        total = control.last.total,
        discovered,
        elapsed_s = elapsed.whole_seconds(),
        "scan finished"
    );
}

async fn persist(inner: &Inner) {
    if let Some(path) = &inner.state_file {
        if let Err(e) = inner.inventory.save_to(path).await {
            error!(error = %e, "failed to write inventory snapshot");
        }
    }
}

/// Wait until the run is not paused. Returns false if the run was cancelled.
async fn wait_while_paused(pause: &mut watch::Receiver<bool>, cancel: &CancellationToken) -> bool {
    loop {
        if cancel.is_cancelled() {
            return false;
        }
        if !*pause.borrow_and_update() {
            return true;
        }
        tokio::select! {
            _ = cancel.cancelled() => return false,
            changed = pause.changed() => {
                if changed.is_err() {
                    return false;
                }
            }
        }
    }
}

async fn run_scan(
    inner: Arc<Inner>,
    shared: Arc<RunShared>,
    targets: TargetSet,
    speed: Speed,
    mut pause: watch::Receiver<bool>,
) {
    let concurrency = inner.cfg.clamp_concurrency(speed.concurrency());
    let timeout = speed.connect_timeout();
    let sem = Arc::new(Semaphore::new(concurrency));
    let mut set = JoinSet::new();
    let mut iter = targets.iter();

    loop {
        if !wait_while_paused(&mut pause, &shared.cancel).await {
            return;
        }
        let permit = tokio::select! {
            _ = shared.cancel.cancelled() => return,
            p = sem.clone().acquire_owned() => match p {
                Ok(p) => p,
                Err(_) => return,
            },
        };
        // A pause may have arrived while waiting for a permit.
        let paused = shared.paused.lock().await;
        if *paused {
            continue;
        }
        let Some(target) = iter.next() else {
            break;
        };
        shared.progress.set_current(target);
        set.spawn(probe_one(
            inner.clone(),
            shared.clone(),
            target,
            timeout,
            permit,
        ));
        drop(paused);

        while let Some(res) = set.try_join_next() {
            log_task_result(res);
        }
    }

    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => return,
            res = set.join_next() => match res {
                Some(res) => log_task_result(res),
                None => break,
            },
        }
    }

    let mut control = inner.control.lock().await;
    let current = matches!(&control.run, Some(r) if r.shared.generation == shared.generation);
    if !current {
        return;
    }
    if let Some(run) = control.run.take() {
        finalize(&inner, &mut control, run, LABEL_COMPLETED).await;
    }
    drop(control);
    persist(&inner).await;
}

async fn probe_one(
    inner: Arc<Inner>,
    shared: Arc<RunShared>,
    target: ProbeTarget,
    timeout: Duration,
    _permit: tokio::sync::OwnedSemaphorePermit,
) {
    let outcome = tokio::select! {
        _ = shared.cancel.cancelled() => return,
        o = inner.prober.probe(target, timeout) => o,
    };

    if outcome.success {
        let open = shared.gate.lock().await;
        if !*open {
            return;
        }
        let device = Device::new(target, outcome.banner.unwrap_or_default());
        if inner.inventory.upsert(device).await {
            debug!(%target, "new device");
        }
        shared.progress.discovered.fetch_add(1, Ordering::Relaxed);
    }
    shared.progress.scanned.fetch_add(1, Ordering::Relaxed);
}

fn log_task_result(res: Result<(), tokio::task::JoinError>) {
    if let Err(e) = res {
        if e.is_panic() {
            error!(error = %e, "probe task panicked");
        }
    }
}

async fn sample_history(inner: Arc<Inner>, shared: Arc<RunShared>) {
    let mut ticker = tokio::time::interval(inner.cfg.history_interval.max(Duration::from_millis(1)));
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => return,
            _ = ticker.tick() => {
                let open = shared.gate.lock().await;
                if !*open {
                    return;
                }
                inner.inventory.record_sample(shared.progress.discovered()).await;
            }
        }
    }
}

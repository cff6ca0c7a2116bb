use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use eternal_scan::auth::UserStore;
use eternal_scan::config::ScannerConfig;
use eternal_scan::country::{RipeResolver, StaticResolver, RIPE_STAT_URL};
use eternal_scan::inventory::Inventory;
use eternal_scan::probe::TcpProber;
use eternal_scan::scanner::Scanner;
use eternal_scan::server::{self, AppState};
use eternal_scan::types::{Device, ScanConfig, ScanState, Speed};
use eternal_scan::{netdetect, ports};

/// eternal-scan: pausable async TCP connect scanner with a device inventory and HTTP API.
#[derive(Debug, Parser)]
#[command(name = "eternal-scan", version, about, long_about = None)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace). RUST_LOG overrides.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the HTTP API and serve the static UI.
    Serve(ServeArgs),
    /// Run a single scan in the foreground and print the discovered services.
    Scan(ScanArgs),
}

#[derive(Debug, Args)]
struct ServeArgs {
    /// Address to listen on.
    #[arg(long, env = "ETERNAL_SCAN_BIND", default_value = "127.0.0.1:8080")]
    bind: String,

    /// Directory with the static UI files.
    #[arg(long = "ui-dir", default_value = "ui")]
    ui_dir: PathBuf,

    /// JSON file the inventory is loaded from and saved to.
    #[arg(long = "state-file", env = "ETERNAL_SCAN_STATE_FILE")]
    state_file: Option<PathBuf>,

    /// API user as name:token. Repeatable. A token is generated when none is given.
    #[arg(long = "user", env = "ETERNAL_SCAN_USERS", value_delimiter = ',')]
    users: Vec<String>,

    /// RIPEstat country-resource-list endpoint.
    #[arg(long = "ripe-url", default_value = RIPE_STAT_URL)]
    ripe_url: String,

    #[command(flatten)]
    tuning: TuningArgs,
}

#[derive(Debug, Args)]
struct TuningArgs {
    /// Ceiling on concurrent probes for any speed.
    #[arg(long = "max-concurrency", default_value_t = 5_000)]
    max_concurrency: usize,

    /// Concurrent manual rescans.
    #[arg(long = "rescan-concurrency", default_value_t = 8)]
    rescan_concurrency: usize,

    /// Banner read timeout in milliseconds.
    #[arg(long = "banner-timeout-ms", default_value_t = 500)]
    banner_timeout_ms: u64,

    /// Seconds between history samples while a scan runs.
    #[arg(long = "history-interval-secs", default_value_t = 10)]
    history_interval_secs: u64,
}

impl TuningArgs {
    fn scanner_config(&self) -> ScannerConfig {
        ScannerConfig {
            max_concurrency: self.max_concurrency,
            rescan_concurrency: self.rescan_concurrency,
            banner_timeout: Duration::from_millis(self.banner_timeout_ms),
            history_interval: Duration::from_secs(self.history_interval_secs.max(1)),
            ..ScannerConfig::default()
        }
    }
}

#[derive(Debug, Args)]
struct ScanArgs {
    /// Ranges (CIDR, a.b.c.d-e, single IPs; comma separated) or a file with one per line.
    /// If omitted, the local /24 networks are scanned.
    #[arg(long)]
    targets: Option<String>,

    /// Ranges to leave out, same syntax as --targets.
    #[arg(long)]
    exclude: Option<String>,

    /// Port specification, e.g. "22,80,8000-8100".
    #[arg(long, conflicts_with = "ports_file")]
    ports: Option<String>,

    /// Path to a ports list file (one port or range per line).
    #[arg(long = "ports-file")]
    ports_file: Option<PathBuf>,

    /// slow, normal or fast.
    #[arg(long, default_value = "normal")]
    speed: Speed,

    /// Write results as pretty JSON to this path.
    #[arg(long)]
    output: Option<PathBuf>,

    #[command(flatten)]
    tuning: TuningArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::Scan(args) => scan(args).await,
    }
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "eternal_scan=info,tower_http=info",
        1 => "eternal_scan=debug,tower_http=debug",
        _ => "eternal_scan=trace,tower_http=debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn serve(args: ServeArgs) -> Result<()> {
    let cfg = args.tuning.scanner_config();

    let inventory = match &args.state_file {
        Some(path) => Inventory::load_from(path)
            .await
            .with_context(|| format!("failed to load state file {}", path.display()))?,
        None => Inventory::new(),
    };
    info!(devices = inventory.len().await, "inventory ready");
    let inventory = Arc::new(inventory);

    let users = if args.users.is_empty() {
        let (store, token) = UserStore::generated("admin");
        warn!(user = "admin", %token, "no API users configured, generated a token");
        store
    } else {
        UserStore::from_specs(&args.users)?
    };

    let resolver = Arc::new(RipeResolver::new(args.ripe_url.clone())?);
    let prober = Arc::new(TcpProber::new(&cfg));
    let scanner = match args.state_file.clone() {
        Some(path) => Scanner::with_state_file(cfg, prober, resolver, inventory.clone(), path),
        None => Scanner::new(cfg, prober, resolver, inventory.clone()),
    };

    let app = server::router(AppState::new(scanner.clone(), users), &args.ui_dir);
    server::serve(&args.bind, app, async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutting down");
    })
    .await?;

    if scanner.status().await.is_scanning {
        scanner.stop().await.ok();
    }
    if let Some(path) = &args.state_file {
        if let Err(e) = inventory.save_to(path).await {
            error!(error = %e, "failed to save inventory on shutdown");
        }
    }
    Ok(())
}

async fn scan(args: ScanArgs) -> Result<()> {
    let ranges = match args.targets.as_deref() {
        Some(t) => read_ranges_arg(t)?,
        None => {
            let cidrs = netdetect::detect_local_cidrs()?;
            if cidrs.is_empty() {
                anyhow::bail!("no local IPv4 networks detected; pass --targets");
            }
            for cidr in &cidrs {
                info!(%cidr, "detected local network");
            }
            netdetect::cidrs_to_range_text(&cidrs)
        }
    };

    let port_spec = match (&args.ports, &args.ports_file) {
        (Some(spec), _) => spec.clone(),
        (None, Some(path)) => ports::format_port_list(&ports::load_ports_from_path(path)?),
        (None, None) => ports::format_port_list(&ports::default_ports()),
    };

    let mut config = ScanConfig::range(ranges, port_spec).with_speed(args.speed);
    if let Some(ex) = args.exclude.as_deref() {
        config = config.with_exclude(read_ranges_arg(ex)?);
    }

    let cfg = args.tuning.scanner_config();
    let inventory = Arc::new(Inventory::new());
    let scanner = Scanner::new(
        cfg.clone(),
        Arc::new(TcpProber::new(&cfg)),
        Arc::new(StaticResolver::new()),
        inventory.clone(),
    );

    let total = scanner.start(config).await?;
    info!(targets = total, "scanning (Ctrl+C to stop)");

    let mut state = scanner.subscribe();
    tokio::select! {
        _ = state.wait_for(|s| *s == ScanState::Idle) => {}
        _ = tokio::signal::ctrl_c() => {
            scanner.stop().await.ok();
        }
    }

    let status = scanner.status().await;
    let devices = inventory.export_all().await;
    print_results_table(&devices, status.scanned_targets, status.total_targets);

    if let Some(path) = args.output.as_deref() {
        write_results_json(path, &devices)?;
        info!(path = %path.display(), "wrote JSON results");
    }
    Ok(())
}

/// Inline ranges, or the contents of a file when the argument names one.
fn read_ranges_arg(arg: &str) -> Result<String> {
    let path = Path::new(arg);
    if path.is_file() {
        return std::fs::read_to_string(path)
            .with_context(|| format!("failed to read targets file: {}", path.display()));
    }
    Ok(arg.replace(',', "\n"))
}

fn print_results_table(devices: &[Device], scanned: u64, total: u64) {
    let mut ip_w = "ip".len();
    let mut banner_w = "banner".len();
    let rows: Vec<(String, String)> = devices
        .iter()
        .map(|d| {
            let mut b = d.banner_text().replace('\n', "\\n").replace('\r', "\\r");
            if b.chars().count() > 60 {
                b = b.chars().take(60).collect();
            }
            (d.ip.to_string(), b)
        })
        .collect();
    for (ip, banner) in &rows {
        ip_w = ip_w.max(ip.len());
        banner_w = banner_w.max(banner.chars().count());
    }
    let port_w = 5usize;

    println!("\nOpen ports: {} (scanned: {}/{})", devices.len(), scanned, total);
    println!(
        "{:<ip_w$}  {:>port_w$}  {:<banner_w$}",
        "ip", "port", "banner"
    );
    println!("{:-<ip_w$}  {:-<port_w$}  {:-<banner_w$}", "", "", "");
    for (d, (ip, banner)) in devices.iter().zip(&rows) {
        println!(
            "{:<ip_w$}  {:>port_w$}  {:<banner_w$}",
            ip, d.port, banner
        );
    }
}

fn write_results_json(path: &Path, devices: &[Device]) -> Result<()> {
    let file = File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    serde_json::to_writer_pretty(file, devices)?;
    Ok(())
}

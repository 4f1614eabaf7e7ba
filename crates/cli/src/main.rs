use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use metrics::counter;
use opsprint_core::FingerprintedRecord;
use opsprint_mongohub::MongoHub;
use opsprint_monitor::{MonitorConfig, SlowOperationMonitor, DEFAULT_QUERY_THRESHOLD_SECS};
use opsprint_store::{FingerprintGroup, FingerprintTally};
use tokio::signal;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "opsprintctl", version, about = "Slow MongoDB operations, grouped by query shape")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Poll for slow operations and print them as they appear
    Watch(WatchArgs),
    /// Print the fingerprint of a JSON query shape
    Fingerprint {
        /// Filter document or pipeline, e.g. '{"_id": 1, "tags": {"$in": ["a"]}}'
        json: String,
    },
}

#[derive(Args, Debug)]
struct WatchArgs {
    /// MongoDB connection string
    #[arg(long, env = "OPSPRINT_MONGODB_URI", default_value = "mongodb://localhost:27017")]
    uri: String,
    /// Database whose profiler is read (historical mode)
    #[arg(long, env = "OPSPRINT_DB", default_value = "admin")]
    db: String,
    /// Minimum elapsed seconds for an operation to count as slow
    #[arg(
        long = "threshold-secs",
        env = "OPSPRINT_THRESHOLD_SECS",
        default_value_t = DEFAULT_QUERY_THRESHOLD_SECS
    )]
    threshold_secs: u64,
    /// Read system.profile instead of currentOp
    #[arg(long, env = "OPSPRINT_HISTORICAL", action = ArgAction::SetTrue)]
    historical: bool,
    /// Also report fast collection scans (historical mode only)
    #[arg(long = "report-all-collscans", action = ArgAction::SetTrue)]
    report_all_collscans: bool,
    /// Seconds between polls
    #[arg(long = "interval-secs", env = "OPSPRINT_INTERVAL_SECS", default_value_t = 10)]
    interval_secs: u64,
    /// Poll once and exit
    #[arg(long, action = ArgAction::SetTrue)]
    once: bool,
    /// Maximum number of distinct shapes remembered
    #[arg(long = "tally-cap", env = "OPSPRINT_TALLY_CAP", default_value_t = 4096)]
    tally_cap: usize,
    /// Shapes listed in the exit summary
    #[arg(long, default_value_t = 20)]
    top: usize,
}

impl WatchArgs {
    fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            query_threshold_secs: self.threshold_secs,
            use_historical_log: self.historical,
            report_all_collection_scans: self.report_all_collscans,
        }
    }
}

fn init_tracing() {
    let env = std::env::var("OPSPRINT_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    // stdout carries records; logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

/// Serve Prometheus metrics when `OPSPRINT_METRICS_ADDR` is set.
fn init_metrics() {
    let Ok(addr) = std::env::var("OPSPRINT_METRICS_ADDR") else {
        return;
    };
    let sock = match addr.parse::<std::net::SocketAddr>() {
        Ok(sock) => sock,
        Err(_) => {
            warn!(addr = %addr, "invalid OPSPRINT_METRICS_ADDR; expected host:port");
            return;
        }
    };
    let installed = metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(sock)
        .install();
    match installed {
        Ok(()) => info!(addr = %addr, "metrics exporter listening"),
        Err(e) => warn!(error = %e, "failed to install metrics exporter"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Fingerprint { json } => {
            let fp = opsprint_core::fingerprint_json(&json)?;
            match cli.output {
                Output::Human => println!("{}", fp),
                Output::Json => println!("{}", serde_json::json!({ "fingerprint": fp })),
            }
        }
        Commands::Watch(args) => watch(args, cli.output).await?,
    }

    Ok(())
}

async fn watch(args: WatchArgs, output: Output) -> Result<()> {
    if args.historical && args.db == "admin" {
        warn!("historical mode reads admin.system.profile; pass --db for an application database");
    }
    let hub = MongoHub::connect(&args.uri, &args.db).await.context("connecting to mongodb")?;
    let mut monitor = SlowOperationMonitor::new(hub, args.monitor_config())?;
    let mut tally = FingerprintTally::with_capacity(args.tally_cap);

    let mut ticker = tokio::time::interval(Duration::from_secs(args.interval_secs.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(mode = monitor.mode().as_str(), interval_secs = args.interval_secs, "watch started");

    if output == Output::Human {
        println!("{}", header());
    }
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match monitor.retrieve_slow_operations().await {
                    Ok(batch) => {
                        for rec in &batch {
                            match output {
                                Output::Human => println!("{}", render_record(rec)),
                                Output::Json => println!("{}", serde_json::to_string(rec)?),
                            }
                        }
                        tally.record_poll(&batch);
                    }
                    Err(e) => {
                        counter!("monitor_poll_errors_total", 1u64);
                        if args.once {
                            return Err(e).context("polling slow operations");
                        }
                        error!(error = %e, "poll failed; retrying on next tick");
                    }
                }
                if args.once { break; }
            }
            _ = signal::ctrl_c() => {
                info!("Ctrl-C received; stopping watch");
                break;
            }
        }
    }

    let top = tally.top(args.top);
    match output {
        Output::Human => {
            println!();
            println!(
                "{:>6} {:>9} {:>8}  {:<20} FINGERPRINT",
                "COUNT", "COLLSCANS", "MAX_MS", "COLLECTION"
            );
            for g in top {
                println!("{}", render_group(g));
            }
            if tally.evicted() > 0 {
                eprintln!("note: {} shapes evicted (raise --tally-cap)", tally.evicted());
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(&top)?),
    }
    Ok(())
}

fn header() -> String {
    format!(
        "{:<8} {:<20} {:>8} {:<8} {:<4} {:<12} FINGERPRINT",
        "TIME", "COLLECTION", "MS", "PLAN", "LOCK", "APP"
    )
}

fn plan_label(rec: &FingerprintedRecord) -> &'static str {
    if rec.is_collection_scan {
        "COLLSCAN"
    } else if rec.is_indexed {
        "INDEX"
    } else {
        "-"
    }
}

fn render_record(rec: &FingerprintedRecord) -> String {
    let time = match rec.timestamp {
        Some(ts) => ts.to_chrono().format("%H:%M:%S").to_string(),
        None => chrono::Local::now().format("%H:%M:%S").to_string(),
    };
    let ms = rec.duration_millis.map(|m| m.to_string()).unwrap_or_else(|| "-".to_string());
    let lock = if rec.waiting_for_lock == Some(true) { "wait" } else { "-" };
    let app = rec.app_name.as_deref().unwrap_or("-");
    format!(
        "{:<8} {:<20} {:>8} {:<8} {:<4} {:<12} {}",
        time,
        rec.collection,
        ms,
        plan_label(rec),
        lock,
        app,
        rec.fingerprint
    )
}

fn render_group(g: &FingerprintGroup) -> String {
    let max_ms = g.max_duration_millis.map(|m| m.to_string()).unwrap_or_else(|| "-".to_string());
    format!(
        "{:>6} {:>9} {:>8}  {:<20} {}",
        g.count, g.collection_scans, max_ms, g.key.collection, g.key.fingerprint
    )
}

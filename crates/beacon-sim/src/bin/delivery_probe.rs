use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use beacon_core::{Accuracy, LocationCoordinate, Resolution, Trackable};
use beacon_node::battery::NoBatteryLevel;
use beacon_node::{spawn_publisher, PublisherConfig, PublisherEvent, ResolutionPolicyEngine};
use beacon_sim::scenarios::{practical_baseline, straight_line_route};
use beacon_transport::InMemoryTransport;
use clap::Parser;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

const TRACKABLE_ID: &str = "probe-parcel";

#[derive(Parser)]
#[command(
    author,
    version,
    about = "Drives a publisher session over a lossy in-memory transport",
    long_about = None
)]
struct Cli {
    #[arg(long, default_value_t = 7)]
    seed: u64,
    /// Number of fixes to feed; defaults to the practical baseline.
    #[arg(long)]
    fixes: Option<usize>,
    /// Chance of each publish attempt failing; defaults to the practical baseline.
    #[arg(long)]
    failure_percent: Option<u8>,
    /// Publisher config in TOML. A built-in default is used when absent.
    #[arg(long, env = "BEACON_PROBE_CONFIG")]
    config: Option<PathBuf>,
    /// Write the JSON report here instead of stdout.
    #[arg(long, short)]
    out: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
struct ProbeReport {
    seed: u64,
    fixes: usize,
    failure_percent: u8,
    delivered: usize,
    failed: usize,
    unanswered: usize,
    publish_attempts: u64,
    skipped_locations_attached: usize,
    max_in_flight: usize,
    elapsed_ms: u128,
}

fn load_config(cli: &Cli) -> Result<PublisherConfig, String> {
    let Some(path) = &cli.config else {
        return Ok(PublisherConfig::new(Resolution::new(
            Accuracy::High,
            1_000,
            5.0,
        )));
    };
    let raw = fs::read_to_string(path).map_err(|err| format!("{}: {err}", path.display()))?;
    PublisherConfig::from_toml_str(&raw).map_err(|err| format!("{}: {err}", path.display()))
}

async fn run(cli: &Cli, config: PublisherConfig) -> Result<ProbeReport, String> {
    let baseline = practical_baseline();
    let fixes = cli.fixes.unwrap_or(baseline.fixes);
    let failure_percent = cli
        .failure_percent
        .unwrap_or(baseline.publish_failure_percent)
        .min(100);
    let max_attempts = config.delivery.max_retry_count + 1;
    let mut rng = StdRng::seed_from_u64(cli.seed);

    let transport = InMemoryTransport::new();
    let policy = ResolutionPolicyEngine::new(config.default_resolution, Arc::new(NoBatteryLevel));
    let publisher = spawn_publisher(config.clone(), Arc::new(transport.clone()), Box::new(policy));
    let (tx, mut events) = mpsc::unbounded_channel();
    publisher.register_listener(move |event: PublisherEvent| {
        let _ = tx.send(event);
    });

    publisher
        .track(Trackable::new(TRACKABLE_ID))
        .await
        .map_err(|err| format!("track failed: {err}"))?;

    let route = straight_line_route(
        LocationCoordinate::new(51.5007, -0.1246),
        LocationCoordinate::new(51.5155, -0.0922),
        fixes,
        0.0,
        baseline.fix_interval_ms.max(config.default_resolution.desired_interval_ms),
    );

    let started = Instant::now();
    let mut report = ProbeReport {
        seed: cli.seed,
        fixes,
        failure_percent,
        delivered: 0,
        failed: 0,
        unanswered: 0,
        publish_attempts: 0,
        skipped_locations_attached: 0,
        max_in_flight: 0,
        elapsed_ms: 0,
    };

    for fix in route {
        let failures = (0..max_attempts)
            .take_while(|_| rng.gen_range(0..100u8) < failure_percent)
            .count() as u32;
        if failures > 0 {
            transport.fail_next_publishes(TRACKABLE_ID, failures);
        }
        publisher
            .location_fix(fix)
            .map_err(|err| format!("location fix rejected: {err}"))?;

        let outcome = tokio::time::timeout(Duration::from_secs(1), async {
            while let Some(event) = events.recv().await {
                match event {
                    PublisherEvent::DeliverySucceeded {
                        skipped_locations, ..
                    } => return Some(Ok(skipped_locations)),
                    PublisherEvent::DeliveryFailed { error, .. } => return Some(Err(error)),
                    _ => {}
                }
            }
            None
        })
        .await;

        match outcome {
            Ok(Some(Ok(skipped))) => {
                report.delivered += 1;
                report.skipped_locations_attached += skipped;
            }
            Ok(Some(Err(err))) => {
                warn!(error = %err, "probe: delivery exhausted retries");
                report.failed += 1;
            }
            Ok(None) => return Err("publisher event stream closed".into()),
            Err(_) => report.unanswered += 1,
        }
    }

    report.elapsed_ms = started.elapsed().as_millis();
    report.publish_attempts = transport.publish_attempts();
    report.max_in_flight = transport.max_in_flight();

    publisher
        .stop()
        .await
        .map_err(|err| format!("stop failed: {err}"))?;
    Ok(report)
}

#[tokio::main]
async fn main() {
    let filter = std::env::var("BEACON_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(err) => {
            error!("config load failed: {err}");
            std::process::exit(1);
        }
    };

    let report = match run(&cli, config).await {
        Ok(report) => report,
        Err(err) => {
            error!("probe failed: {err}");
            std::process::exit(1);
        }
    };
    info!(
        delivered = report.delivered,
        failed = report.failed,
        max_in_flight = report.max_in_flight,
        "probe finished"
    );

    let json = match serde_json::to_string_pretty(&report) {
        Ok(json) => json,
        Err(err) => {
            error!("report encode failed: {err}");
            std::process::exit(1);
        }
    };
    match &cli.out {
        Some(path) => {
            if let Err(err) = fs::write(path, json) {
                error!("report write failed at {}: {err}", path.display());
                std::process::exit(1);
            }
        }
        None => println!("{json}"),
    }
}

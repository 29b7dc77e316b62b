use anyhow::{Context, Result};
use chat_load_core::{
    chart_series, write_chart_data, write_csv, Config, MockTransport, Orchestrator, RunReport,
    Transport, WsTransport,
};
use clap::Parser;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "client")]
#[command(about = "Chat load harness - drives warmup and measurement phases against a chat server")]
struct Args {
    /// Path to configuration file
    #[arg(long, default_value = "config/example.local.toml")]
    config: PathBuf,

    /// Transport mode: mock or ws
    #[arg(long, default_value = "ws")]
    mode: String,

    /// Total messages to generate (overrides config)
    #[arg(long)]
    total_messages: Option<u64>,

    /// Base WebSocket URI, room id is appended (overrides config)
    #[arg(long)]
    server_uri: Option<String>,

    /// Directory for the CSV, chart data and run summary (overrides config paths)
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Simulated round-trip latency in mock mode
    #[arg(long, default_value = "2")]
    mock_latency_ms: u64,
}

#[derive(Debug, Serialize)]
struct RunSummary<'a> {
    timestamp: String,
    mode: &'a str,
    csv_path: &'a Path,
    chart_data_path: &'a Path,
    config: &'a Config,
    report: &'a RunReport,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = Config::from_file(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;
    apply_overrides(&mut config, &args);

    let transport: Arc<dyn Transport> = match args.mode.as_str() {
        "mock" => Arc::new(MockTransport::new(Duration::from_millis(args.mock_latency_ms))),
        "ws" => Arc::new(WsTransport::new(config.target.server_uri.clone())),
        _ => anyhow::bail!("Invalid mode: {}, must be 'mock' or 'ws'", args.mode),
    };

    info!("Using transport: {}", transport.name());
    info!(
        "Messages: {}, rooms: {}, warmup: {}x{}, measurement workers: {}",
        config.scenario.total_messages,
        config.scenario.room_count,
        config.phases.warmup_threads,
        config.phases.warmup_messages_per_thread,
        config.phases.main_threads
    );
    if let Some(seed) = config.scenario.seed {
        info!("Seed: {}", seed);
    }

    let orchestrator =
        Orchestrator::new(config.clone(), transport).context("Invalid configuration")?;

    let cancel = orchestrator.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping run");
            cancel.cancel();
        }
    });

    let report = orchestrator.run().await;
    let records = orchestrator.metrics().records();

    let csv_path = config.metrics.csv_path.clone();
    write_csv(&records, &csv_path)
        .with_context(|| format!("Failed to write metrics CSV {:?}", csv_path))?;
    info!("Metrics written to {:?} ({} rows)", csv_path, records.len());

    let chart_path = config.metrics.chart_data_path.clone();
    let buckets = orchestrator
        .metrics()
        .throughput_buckets(config.metrics.bucket_seconds);
    write_chart_data(&chart_series(&buckets, config.metrics.bucket_seconds), &chart_path)
        .with_context(|| format!("Failed to write chart data {:?}", chart_path))?;
    info!("Chart data written to {:?}", chart_path);

    let timestamp = chrono::Utc::now();
    let summary_dir = csv_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();
    let summary_path = summary_dir.join(format!("run_{}.json", timestamp.format("%Y%m%d_%H%M%S")));
    let summary = RunSummary {
        timestamp: timestamp.to_rfc3339(),
        mode: &args.mode,
        csv_path: &csv_path,
        chart_data_path: &chart_path,
        config: &config,
        report: &report,
    };
    std::fs::write(&summary_path, serde_json::to_string_pretty(&summary)?)
        .with_context(|| format!("Failed to write run summary {:?}", summary_path))?;
    info!("Run summary written to {:?}", summary_path);

    print_summary(&report);

    if report.interrupted {
        anyhow::bail!(
            "Run interrupted after generating {} of {} messages",
            report.generated,
            config.scenario.total_messages
        );
    }
    Ok(())
}

fn apply_overrides(config: &mut Config, args: &Args) {
    if let Some(total) = args.total_messages {
        config.scenario.total_messages = total;
    }
    if let Some(uri) = &args.server_uri {
        config.target.server_uri = uri.clone();
    }
    if let Some(dir) = &args.output_dir {
        config.metrics.csv_path = relocate(&config.metrics.csv_path, dir, "metrics.csv");
        config.metrics.chart_data_path =
            relocate(&config.metrics.chart_data_path, dir, "throughput_chart.json");
    }
}

fn relocate(path: &Path, dir: &Path, fallback: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| fallback.into());
    dir.join(name)
}

fn print_summary(report: &RunReport) {
    let m = &report.metrics;

    println!("\n=== Warmup ===");
    println!(
        "Warmup complete: {} msgs in {:.2} s ({:.0} msg/s)",
        report.warmup.messages,
        report.warmup.duration_ms as f64 / 1000.0,
        report.warmup.throughput_per_sec
    );
    println!(
        "Measurement phase: {} msgs in {:.2} s",
        report.measurement.messages,
        report.measurement.duration_ms as f64 / 1000.0
    );

    println!("\n=== Summary ===");
    println!("Transport: {}", report.transport);
    println!("Generated: {}", report.generated);
    println!("Successful: {}", m.success_count);
    println!("Failed: {}", m.failure_count);
    println!("Server errors: {}", m.server_errors);
    println!("Wall time: {:.2} s", m.wall_time_ms as f64 / 1000.0);
    println!("Overall throughput: {:.2} msg/s", m.throughput_per_sec);

    println!("\n=== Connection Statistics ===");
    println!("Total connections: {}", m.total_connections);
    println!("Reconnections: {}", m.reconnections);

    println!("\n=== Latency (ms) ===");
    match &m.latency {
        Some(l) => {
            println!("Samples: {}", l.samples);
            println!("Mean: {:.3}", l.mean_ms);
            println!("Median: {:.3}", l.median_ms);
            println!("p95: {:.3}", l.p95_ms);
            println!("p99: {:.3}", l.p99_ms);
            println!("Min: {:.3}", l.min_ms);
            println!("Max: {:.3}", l.max_ms);
        }
        None => println!("No successful messages"),
    }

    println!("\n=== Throughput per Room ===");
    for room in &m.rooms {
        println!(
            "Room {:>3}: {:>8} msgs ({:.2} msg/s)",
            room.room_id, room.messages, room.per_second
        );
    }

    println!("\n=== Message Type Distribution ===");
    for share in &m.message_types {
        println!(
            "{:<6} {:>8} ({:.1}%)",
            share.message_type.as_str(),
            share.count,
            share.percent
        );
    }

    if let Some(law) = &report.littles_law {
        println!("\n=== Little's Law ===");
        println!("Concurrency (L): {}", law.concurrency);
        println!("Mean RTT (W): {:.3} ms", law.mean_rtt_ms);
        println!("Predicted throughput (L/W): {:.2} msg/s", law.predicted_throughput);
        println!("Actual throughput: {:.2} msg/s", law.actual_throughput);
        if let Some(efficiency) = law.efficiency_percent {
            println!("Efficiency: {:.1}%", efficiency);
        }
    }
    println!();
}

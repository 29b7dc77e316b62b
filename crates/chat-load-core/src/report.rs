use crate::stats::MetricsRecord;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

pub const CSV_HEADER: [&str; 5] = [
    "timestamp",
    "messageType",
    "latency_micros",
    "statusCode",
    "roomId",
];

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {:?}", parent))?;
    }
    Ok(())
}

/// One row per record, in log order.
pub fn write_csv(records: &[MetricsRecord], path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    ensure_parent(path)?;

    let mut writer =
        csv::Writer::from_path(path).with_context(|| format!("Failed to create {:?}", path))?;
    writer.write_record(CSV_HEADER)?;
    for r in records {
        writer.write_record([
            r.send_timestamp_ms.to_string(),
            r.message_type.to_string(),
            r.latency_micros.to_string(),
            r.status_code.to_string(),
            r.room_id.to_string(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

/// Input point for the throughput-over-time chart.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChartPoint {
    pub elapsed_sec: f64,
    pub messages_per_sec: f64,
}

/// Turn bucket counts into (seconds since first bucket, rate) points.
pub fn chart_series(buckets: &BTreeMap<i64, u64>, bucket_seconds: u64) -> Vec<ChartPoint> {
    let width = bucket_seconds.max(1) as f64;
    let Some(&first) = buckets.keys().next() else {
        return Vec::new();
    };
    buckets
        .iter()
        .map(|(&start, &count)| ChartPoint {
            elapsed_sec: (start - first) as f64,
            messages_per_sec: count as f64 / width,
        })
        .collect()
}

pub fn write_chart_data(points: &[ChartPoint], path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    ensure_parent(path)?;
    let json = serde_json::to_string_pretty(points)?;
    std::fs::write(path, json).with_context(|| format!("Failed to write {:?}", path))?;
    Ok(())
}

/// Throughput predicted from concurrency and round-trip time (L = lambda * W).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LittlesLaw {
    pub concurrency: usize,
    pub mean_rtt_ms: f64,
    pub predicted_throughput: f64,
    pub actual_throughput: f64,
    pub efficiency_percent: Option<f64>,
}

impl LittlesLaw {
    pub fn analyse(concurrency: usize, mean_rtt_ms: f64, actual_throughput: f64) -> Option<Self> {
        if mean_rtt_ms <= 0.0 || concurrency == 0 {
            return None;
        }
        let predicted_throughput = concurrency as f64 / (mean_rtt_ms / 1000.0);
        let efficiency_percent =
            (actual_throughput > 0.0).then(|| actual_throughput / predicted_throughput * 100.0);
        Some(Self {
            concurrency,
            mean_rtt_ms,
            predicted_throughput,
            actual_throughput,
            efficiency_percent,
        })
    }
}

use crate::message::MessageType;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

pub const STATUS_SUCCESS: u16 = 200;
pub const STATUS_FAILURE: u16 = 0;
pub const FAILED_LATENCY: i64 = -1;

/// One terminal outcome of one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsRecord {
    /// Wall-clock send time, milliseconds since the Unix epoch
    pub send_timestamp_ms: i64,
    pub message_type: MessageType,
    /// Round-trip latency in microseconds, `-1` for failures
    pub latency_micros: i64,
    /// `200` on success, `0` on failure
    pub status_code: u16,
    pub room_id: u32,
}

impl MetricsRecord {
    pub fn success(
        send_timestamp_ms: i64,
        message_type: MessageType,
        latency_micros: i64,
        room_id: u32,
    ) -> Self {
        Self {
            send_timestamp_ms,
            message_type,
            latency_micros,
            status_code: STATUS_SUCCESS,
            room_id,
        }
    }

    pub fn failure(send_timestamp_ms: i64, message_type: MessageType, room_id: u32) -> Self {
        Self {
            send_timestamp_ms,
            message_type,
            latency_micros: FAILED_LATENCY,
            status_code: STATUS_FAILURE,
            room_id,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status_code == STATUS_SUCCESS
    }
}

/// Shared sink for every sender's outcomes.
///
/// Counters are atomics so progress sampling never blocks writers; the
/// record log is append-only and is what every derived number comes from.
pub struct MetricsCollector {
    records: Mutex<Vec<MetricsRecord>>,
    successes: AtomicU64,
    failures: AtomicU64,
    server_errors: AtomicU64,
    connections: AtomicU64,
    reconnections: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            server_errors: AtomicU64::new(0),
            connections: AtomicU64::new(0),
            reconnections: AtomicU64::new(0),
        }
    }

    fn append(&self, record: MetricsRecord) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
    }

    pub fn record_success(&self, record: MetricsRecord) {
        self.append(record);
        self.successes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self, record: MetricsRecord) {
        self.append(record);
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    /// A round trip whose echo carried `status: ERROR`.
    pub fn record_server_error(&self) {
        self.server_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_connections(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_reconnections(&self) {
        self.reconnections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn server_errors(&self) -> u64 {
        self.server_errors.load(Ordering::Relaxed)
    }

    pub fn connections(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }

    pub fn reconnections(&self) -> u64 {
        self.reconnections.load(Ordering::Relaxed)
    }

    pub fn completed(&self) -> u64 {
        self.successes() + self.failures()
    }

    /// Copy of the record log in append order.
    pub fn records(&self) -> Vec<MetricsRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn throughput_buckets(&self, bucket_seconds: u64) -> BTreeMap<i64, u64> {
        throughput_buckets(&self.records(), bucket_seconds)
    }

    pub fn report(&self, wall_time: Duration, bucket_seconds: u64) -> MetricsReport {
        let records = self.records();
        let wall_secs = wall_time.as_secs_f64();
        let per_second = |count: u64| {
            if wall_secs > 0.0 {
                count as f64 / wall_secs
            } else {
                0.0
            }
        };

        let mut latencies: Vec<i64> = records
            .iter()
            .filter(|r| r.is_success() && r.latency_micros >= 0)
            .map(|r| r.latency_micros)
            .collect();
        latencies.sort_unstable();

        let mut per_room: BTreeMap<u32, u64> = BTreeMap::new();
        for r in records.iter().filter(|r| r.is_success()) {
            *per_room.entry(r.room_id).or_default() += 1;
        }

        let mut per_type: HashMap<MessageType, u64> = HashMap::new();
        for r in &records {
            *per_type.entry(r.message_type).or_default() += 1;
        }
        let message_types = MessageType::ALL
            .iter()
            .filter_map(|t| {
                let count = per_type.get(t).copied()?;
                Some(TypeShare {
                    message_type: *t,
                    count,
                    percent: 100.0 * count as f64 / records.len() as f64,
                })
            })
            .collect();

        let successes = self.successes();
        MetricsReport {
            success_count: successes,
            failure_count: self.failures(),
            server_errors: self.server_errors(),
            total_connections: self.connections(),
            reconnections: self.reconnections(),
            wall_time_ms: wall_time.as_millis() as u64,
            throughput_per_sec: per_second(successes),
            latency: LatencySummary::from_sorted_micros(&latencies),
            rooms: per_room
                .into_iter()
                .map(|(room_id, messages)| RoomThroughput {
                    room_id,
                    messages,
                    per_second: per_second(messages),
                })
                .collect(),
            message_types,
            buckets: throughput_buckets(&records, bucket_seconds)
                .into_iter()
                .map(|(start_sec, count)| ThroughputBucket { start_sec, count })
                .collect(),
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Smallest value such that at least `p` percent of `sorted` is <= it.
pub fn percentile<T: Copy>(sorted: &[T], p: f64) -> Option<T> {
    if sorted.is_empty() {
        return None;
    }
    let rank = (p / 100.0 * sorted.len() as f64).ceil() as i64 - 1;
    let idx = rank.clamp(0, sorted.len() as i64 - 1) as usize;
    Some(sorted[idx])
}

/// Count successful records per `floor(ts / width) * width` second bucket.
pub fn throughput_buckets(records: &[MetricsRecord], bucket_seconds: u64) -> BTreeMap<i64, u64> {
    let width = bucket_seconds.max(1) as i64;
    let mut buckets = BTreeMap::new();
    for r in records.iter().filter(|r| r.is_success()) {
        let secs = r.send_timestamp_ms.div_euclid(1000);
        *buckets.entry(secs.div_euclid(width) * width).or_default() += 1;
    }
    buckets
}

/// Latency distribution of successful round trips, in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencySummary {
    pub samples: usize,
    pub mean_ms: f64,
    pub median_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
}

impl LatencySummary {
    /// `None` when there are no samples.
    pub fn from_sorted_micros(sorted: &[i64]) -> Option<Self> {
        let to_ms = |micros: i64| micros as f64 / 1000.0;
        let (&first, &last) = (sorted.first()?, sorted.last()?);
        let sum: i64 = sorted.iter().sum();
        Some(Self {
            samples: sorted.len(),
            mean_ms: to_ms(sum) / sorted.len() as f64,
            median_ms: to_ms(percentile(sorted, 50.0)?),
            p95_ms: to_ms(percentile(sorted, 95.0)?),
            p99_ms: to_ms(percentile(sorted, 99.0)?),
            min_ms: to_ms(first),
            max_ms: to_ms(last),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomThroughput {
    pub room_id: u32,
    pub messages: u64,
    pub per_second: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeShare {
    pub message_type: MessageType,
    pub count: u64,
    pub percent: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThroughputBucket {
    pub start_sec: i64,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsReport {
    pub success_count: u64,
    pub failure_count: u64,
    pub server_errors: u64,
    pub total_connections: u64,
    pub reconnections: u64,
    pub wall_time_ms: u64,
    pub throughput_per_sec: f64,
    pub latency: Option<LatencySummary>,
    pub rooms: Vec<RoomThroughput>,
    pub message_types: Vec<TypeShare>,
    pub buckets: Vec<ThroughputBucket>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn ok(ts: i64, latency: i64, room: u32) -> MetricsRecord {
        MetricsRecord::success(ts, MessageType::Text, latency, room)
    }

    #[test]
    fn test_percentile_rule() {
        let sorted: Vec<i64> = (1..=100).collect();
        assert_eq!(percentile(&sorted, 50.0), Some(50));
        assert_eq!(percentile(&sorted, 95.0), Some(95));
        assert_eq!(percentile(&sorted, 99.0), Some(99));
        assert_eq!(percentile(&sorted, 100.0), Some(100));
        assert_eq!(percentile(&sorted, 0.001), Some(1));
        assert_eq!(percentile(&sorted, 0.0), Some(1));

        let small = [10, 20, 30];
        // ceil(0.5 * 3) - 1 = 1
        assert_eq!(percentile(&small, 50.0), Some(20));
        assert_eq!(percentile(&small, 100.0), Some(30));
        assert_eq!(percentile::<i64>(&[], 50.0), None);
    }

    #[test]
    fn test_percentile_is_monotonic_in_p() {
        let sorted = [1, 1, 2, 3, 5, 8, 13, 21, 34, 55];
        let mut last = i32::MIN;
        for p in 1..=100 {
            let v = percentile(&sorted, p as f64).unwrap();
            assert!(v >= last);
            last = v;
        }
        assert_eq!(last, 55);
    }

    #[test]
    fn test_counters_and_log_agree() {
        let metrics = MetricsCollector::new();
        metrics.record_success(ok(1_000, 500, 1));
        metrics.record_success(ok(1_500, 700, 2));
        metrics.record_failure(MetricsRecord::failure(2_000, MessageType::Join, 1));
        metrics.increment_connections();
        metrics.increment_reconnections();

        assert_eq!(metrics.successes(), 2);
        assert_eq!(metrics.failures(), 1);
        assert_eq!(metrics.completed(), 3);
        assert_eq!(metrics.connections(), 1);
        assert_eq!(metrics.reconnections(), 1);

        let records = metrics.records();
        assert_eq!(records.len(), 3);
        assert_eq!(records[2].latency_micros, FAILED_LATENCY);
        assert_eq!(records[2].status_code, STATUS_FAILURE);
    }

    #[test]
    fn test_concurrent_appends_are_not_lost() {
        let metrics = Arc::new(MetricsCollector::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let metrics = metrics.clone();
                std::thread::spawn(move || {
                    for i in 0..1000 {
                        if i % 10 == 0 {
                            metrics.record_failure(MetricsRecord::failure(i, MessageType::Leave, t));
                        } else {
                            metrics.record_success(ok(i, i, t));
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(metrics.successes(), 7200);
        assert_eq!(metrics.failures(), 800);
        assert_eq!(metrics.records().len(), 8000);
    }

    #[test]
    fn test_bucketing() {
        let records = vec![
            ok(10_000, 1, 1),
            ok(10_999, 1, 1),
            ok(11_000, 1, 1),
            MetricsRecord::failure(11_500, MessageType::Text, 1),
            ok(13_250, 1, 2),
        ];

        let one = throughput_buckets(&records, 1);
        assert_eq!(one.into_iter().collect::<Vec<_>>(), vec![(10, 2), (11, 1), (13, 1)]);

        let two = throughput_buckets(&records, 2);
        assert_eq!(two.into_iter().collect::<Vec<_>>(), vec![(10, 3), (12, 1)]);

        // stable and covers every success exactly once
        assert_eq!(throughput_buckets(&records, 2), throughput_buckets(&records, 2));
        assert_eq!(throughput_buckets(&records, 5).values().sum::<u64>(), 4);
    }

    #[test]
    fn test_report_with_samples() {
        let metrics = MetricsCollector::new();
        for (i, latency) in [1_000, 2_000, 3_000, 4_000].into_iter().enumerate() {
            metrics.record_success(ok(5_000 + i as i64 * 400, latency, 1 + (i as u32 % 2)));
        }
        metrics.record_failure(MetricsRecord::failure(6_000, MessageType::Join, 1));

        let report = metrics.report(Duration::from_secs(2), 1);
        assert_eq!(report.success_count, 4);
        assert_eq!(report.failure_count, 1);
        assert_eq!(report.throughput_per_sec, 2.0);

        let latency = report.latency.unwrap();
        assert_eq!(latency.samples, 4);
        assert_eq!(latency.mean_ms, 2.5);
        assert_eq!(latency.median_ms, 2.0);
        assert_eq!(latency.p99_ms, 4.0);
        assert_eq!(latency.min_ms, 1.0);
        assert_eq!(latency.max_ms, 4.0);

        assert_eq!(report.rooms.len(), 2);
        assert_eq!(report.rooms[0].room_id, 1);
        assert_eq!(report.rooms[0].messages, 2);
        assert_eq!(report.rooms[0].per_second, 1.0);

        assert_eq!(report.message_types.len(), 2);
        assert_eq!(report.message_types[0].message_type, MessageType::Text);
        assert_eq!(report.message_types[0].percent, 80.0);
        assert_eq!(report.message_types[1].percent, 20.0);

        let bucket_total: u64 = report.buckets.iter().map(|b| b.count).sum();
        assert_eq!(bucket_total, report.success_count);
    }

    #[test]
    fn test_report_without_samples_or_time() {
        let metrics = MetricsCollector::new();
        metrics.record_failure(MetricsRecord::failure(1_000, MessageType::Text, 3));

        let report = metrics.report(Duration::ZERO, 1);
        assert!(report.latency.is_none());
        assert_eq!(report.throughput_per_sec, 0.0);
        assert!(report.rooms.is_empty());
        assert!(report.buckets.is_empty());
        assert_eq!(report.message_types[0].percent, 100.0);
    }
}

use crate::config::{Config, ConfigError};
use crate::generator::{GeneratorOutcome, MessageGenerator};
use crate::message::ChatMessage;
use crate::pool::ConnectionPool;
use crate::queue::WorkQueue;
use crate::report::LittlesLaw;
use crate::sender::{MessageSender, RetryPolicy};
use crate::stats::{MetricsCollector, MetricsRecord, MetricsReport};
use crate::transport::Transport;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::{interval_at, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const GENERATOR_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseSummary {
    pub name: String,
    pub workers: usize,
    pub messages: u64,
    pub duration_ms: u64,
    pub throughput_per_sec: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub started_at: String,
    pub transport: String,
    pub generated: u64,
    pub interrupted: bool,
    pub warmup: PhaseSummary,
    pub measurement: PhaseSummary,
    pub metrics: MetricsReport,
    pub littles_law: Option<LittlesLaw>,
}

/// Split `total` across `workers`; the first `total % workers` get one extra.
pub fn split_evenly(total: u64, workers: usize) -> Vec<u64> {
    if workers == 0 {
        return Vec::new();
    }
    let base = total / workers as u64;
    let rem = total % workers as u64;
    (0..workers as u64)
        .map(|idx| if idx < rem { base + 1 } else { base })
        .collect()
}

/// Runs warmup then measurement against one shared pool and metrics sink.
pub struct Orchestrator {
    config: Config,
    transport_name: &'static str,
    pool: Arc<ConnectionPool>,
    metrics: Arc<MetricsCollector>,
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(config: Config, transport: Arc<dyn Transport>) -> Result<Self, ConfigError> {
        config.validate()?;
        let metrics = Arc::new(MetricsCollector::new());
        let pool = Arc::new(ConnectionPool::new(
            transport.clone(),
            metrics.clone(),
            config.pool.connections_per_room,
            config.pool.connect_timeout(),
        ));
        Ok(Self {
            policy: RetryPolicy::from_config(&config.retry),
            transport_name: transport.name(),
            config,
            pool,
            metrics,
            cancel: CancellationToken::new(),
        })
    }

    /// Cancelling this token aborts the run: the generator stops, senders
    /// unwind their waits and the run report is still produced.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub async fn run(&self) -> RunReport {
        let started_at = Utc::now().to_rfc3339();
        let total = self.config.scenario.total_messages;
        let queue = Arc::new(WorkQueue::new(self.config.queue.capacity));

        let generator_cancel = self.cancel.child_token();
        let mut generator = {
            let generator = MessageGenerator::new(&self.config.scenario);
            let queue = queue.clone();
            let cancel = generator_cancel.clone();
            tokio::spawn(async move {
                let outcome = generator.run(&queue, total, &cancel).await;
                queue.close();
                outcome
            })
        };

        let overall = Instant::now();

        info!("Starting warmup phase ...");
        let phases = &self.config.phases;
        let warmup = self
            .run_phase(
                "warmup",
                &queue,
                vec![phases.warmup_messages_per_thread; phases.warmup_threads],
                false,
            )
            .await;
        info!(
            "Warmup complete: {} msgs in {:.2} s ({:.0} msg/s)",
            warmup.messages,
            warmup.duration_ms as f64 / 1000.0,
            warmup.throughput_per_sec
        );

        info!("Starting measurement phase ...");
        let remaining = total.saturating_sub(phases.warmup_total());
        let measurement = self
            .run_phase(
                "measurement",
                &queue,
                split_evenly(remaining, phases.main_threads),
                true,
            )
            .await;
        info!(
            "Measurement phase complete: {:.2} s",
            measurement.duration_ms as f64 / 1000.0
        );

        let wall_time = overall.elapsed();

        let outcome = match timeout(GENERATOR_JOIN_TIMEOUT, &mut generator).await {
            Ok(joined) => joined.ok(),
            Err(_) => {
                warn!("Generator still running after the measurement phase; stopping it");
                generator_cancel.cancel();
                generator.await.ok()
            }
        };
        queue.close();
        let generated = outcome.map_or(0, |o| o.generated());
        let interrupted = !matches!(outcome, Some(GeneratorOutcome::Completed { .. }))
            || self.cancel.is_cancelled();
        if interrupted {
            warn!("Run interrupted after generating {} of {} messages", generated, total);
        }

        self.fail_abandoned(&queue).await;

        let metrics = self
            .metrics
            .report(wall_time, self.config.metrics.bucket_seconds);
        let littles_law = metrics.latency.as_ref().and_then(|latency| {
            LittlesLaw::analyse(phases.main_threads, latency.mean_ms, metrics.throughput_per_sec)
        });

        self.pool.close_all().await;

        RunReport {
            started_at,
            transport: self.transport_name.to_string(),
            generated,
            interrupted,
            warmup,
            measurement,
            metrics,
            littles_law,
        }
    }

    async fn run_phase(
        &self,
        name: &str,
        queue: &Arc<WorkQueue<ChatMessage>>,
        counts: Vec<u64>,
        report_progress: bool,
    ) -> PhaseSummary {
        let started = Instant::now();
        let workers = counts.len();

        let mut group = JoinSet::new();
        for count in counts {
            let sender = MessageSender::new(
                self.pool.clone(),
                self.metrics.clone(),
                self.policy.clone(),
                self.cancel.clone(),
            );
            let queue = queue.clone();
            group.spawn(async move { sender.run(&queue, count).await });
        }

        let stop_progress = CancellationToken::new();
        let progress = report_progress.then(|| {
            tokio::spawn(report_progress_until(
                self.metrics.clone(),
                self.config.scenario.total_messages,
                Duration::from_millis(self.config.phases.progress_interval_ms.max(1)),
                stop_progress.clone(),
            ))
        });

        let mut messages = 0u64;
        while let Some(joined) = group.join_next().await {
            match joined {
                Ok(processed) => messages += processed,
                Err(e) => warn!("{} worker failed: {}", name, e),
            }
        }

        stop_progress.cancel();
        if let Some(progress) = progress {
            let _ = progress.await;
        }

        let elapsed = started.elapsed();
        let secs = elapsed.as_secs_f64();
        PhaseSummary {
            name: name.to_string(),
            workers,
            messages,
            duration_ms: elapsed.as_millis() as u64,
            throughput_per_sec: if secs > 0.0 { messages as f64 / secs } else { 0.0 },
        }
    }

    /// Items still queued when the run ends never reached a sender; give each
    /// its terminal failure record so none disappears from the totals.
    async fn fail_abandoned(&self, queue: &WorkQueue<ChatMessage>) {
        let mut abandoned = 0u64;
        while let Some(msg) = queue.pop().await {
            self.metrics.record_failure(MetricsRecord::failure(
                Utc::now().timestamp_millis(),
                msg.message_type,
                msg.room_id,
            ));
            abandoned += 1;
        }
        if abandoned > 0 {
            warn!("{} queued messages were never sent", abandoned);
        }
    }
}

async fn report_progress_until(
    metrics: Arc<MetricsCollector>,
    total: u64,
    period: Duration,
    stop: CancellationToken,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = ticker.tick() => {
                let done = metrics.completed();
                let pct = if total > 0 { 100.0 * done as f64 / total as f64 } else { 0.0 };
                info!(
                    "Progress: {} / {} ({:.1}%) failed={}",
                    done,
                    total,
                    pct,
                    metrics.failures()
                );
            }
        }
    }
}

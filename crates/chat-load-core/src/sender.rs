use crate::config::RetryConfig;
use crate::message::{ChatMessage, ServerResponse};
use crate::pool::{ConnectionLease, ConnectionPool, PoolError};
use crate::queue::WorkQueue;
use crate::stats::{MetricsCollector, MetricsRecord};
use crate::transport::TransportError;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Bounded retry with exponential backoff between attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub response_timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            response_timeout: Duration::from_millis(config.response_timeout_ms),
        }
    }

    /// Pause after failed attempt `attempt` (1-based): `B * 2^(attempt-1)`.
    /// `None` after the final attempt.
    pub fn backoff_after(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt >= self.max_retries {
            return None;
        }
        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        Some(self.initial_backoff.saturating_mul(factor))
    }

    pub fn backoff_schedule(&self) -> Vec<Duration> {
        (1..self.max_retries)
            .filter_map(|attempt| self.backoff_after(attempt))
            .collect()
    }
}

#[derive(Debug, Error)]
enum AttemptError {
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

struct Exchange {
    send_timestamp_ms: i64,
    latency_micros: i64,
    server_error: bool,
}

/// Terminal outcome of one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered {
        attempts: u32,
        latency_micros: i64,
        server_error: bool,
    },
    Failed {
        attempts: u32,
        backoff_sleeps: u32,
    },
    Cancelled {
        attempts: u32,
    },
}

/// Worker that drives messages from the queue to a terminal record.
pub struct MessageSender {
    pool: Arc<ConnectionPool>,
    metrics: Arc<MetricsCollector>,
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl MessageSender {
    pub fn new(
        pool: Arc<ConnectionPool>,
        metrics: Arc<MetricsCollector>,
        policy: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            pool,
            metrics,
            policy,
            cancel,
        }
    }

    /// Process up to `count` messages. Returns how many reached a terminal
    /// record; fewer than `count` only if the queue ends or the run is
    /// cancelled.
    pub async fn run(&self, queue: &WorkQueue<ChatMessage>, count: u64) -> u64 {
        let mut processed = 0u64;
        while processed < count {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                msg = queue.pop() => msg,
            };
            let Some(msg) = next else {
                if !self.cancel.is_cancelled() {
                    warn!("Queue ended after {} of {} messages", processed, count);
                }
                break;
            };

            let delivery = self.send_with_retry(&msg).await;
            processed += 1;
            if matches!(delivery, Delivery::Cancelled { .. }) {
                break;
            }
        }
        processed
    }

    /// Deliver one message, retrying transport-level failures. Always records
    /// exactly one metrics record.
    pub async fn send_with_retry(&self, msg: &ChatMessage) -> Delivery {
        let mut backoff_sleeps = 0u32;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let outcome = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return self.cancelled(msg, attempt),
                outcome = self.attempt(msg) => outcome,
            };

            let err = match outcome {
                Ok(exchange) => {
                    if exchange.server_error {
                        self.metrics.record_server_error();
                    }
                    self.metrics.record_success(MetricsRecord::success(
                        exchange.send_timestamp_ms,
                        msg.message_type,
                        exchange.latency_micros,
                        msg.room_id,
                    ));
                    return Delivery::Delivered {
                        attempts: attempt,
                        latency_micros: exchange.latency_micros,
                        server_error: exchange.server_error,
                    };
                }
                Err(err) => err,
            };

            let Some(backoff) = self.policy.backoff_after(attempt) else {
                warn!(
                    "Room {}: giving up after {} attempts: {}",
                    msg.room_id, attempt, err
                );
                self.metrics.record_failure(MetricsRecord::failure(
                    Utc::now().timestamp_millis(),
                    msg.message_type,
                    msg.room_id,
                ));
                return Delivery::Failed {
                    attempts: attempt,
                    backoff_sleeps,
                };
            };

            debug!(
                "Room {}: attempt {} failed ({}), retrying in {:?}",
                msg.room_id, attempt, err, backoff
            );
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return self.cancelled(msg, attempt),
                _ = sleep(backoff) => backoff_sleeps += 1,
            }
        }
    }

    fn cancelled(&self, msg: &ChatMessage, attempts: u32) -> Delivery {
        self.metrics.record_failure(MetricsRecord::failure(
            Utc::now().timestamp_millis(),
            msg.message_type,
            msg.room_id,
        ));
        Delivery::Cancelled { attempts }
    }

    /// One borrow-send-await cycle. The lease is dropped on return, which
    /// releases the connection whatever happened.
    async fn attempt(&self, msg: &ChatMessage) -> Result<Exchange, AttemptError> {
        let lease = self.pool.borrow(msg.room_id).await?;
        let result = self.exchange(&lease, msg).await;

        if result.is_err() && !lease.is_open() {
            if let Err(e) = self.pool.reconnect(&lease).await {
                debug!("Room {}: reconnect failed: {}", msg.room_id, e);
            }
        }
        result
    }

    async fn exchange(
        &self,
        lease: &ConnectionLease,
        msg: &ChatMessage,
    ) -> Result<Exchange, AttemptError> {
        let payload = serde_json::to_string(msg)?;

        // arm before sending so an immediate echo is not lost
        let response = lease.prepare_for_response();
        let send_timestamp_ms = Utc::now().timestamp_millis();
        let started = Instant::now();

        if let Err(e) = lease.send(payload).await {
            lease.cancel_response();
            return Err(e.into());
        }

        let body = match timeout(self.policy.response_timeout, response).await {
            Ok(Ok(Ok(body))) => body,
            Ok(Ok(Err(e))) => return Err(e.into()),
            Ok(Err(_)) => return Err(TransportError::Closed.into()),
            Err(_) => {
                lease.cancel_response();
                return Err(AttemptError::Timeout(self.policy.response_timeout));
            }
        };
        let latency_micros = started.elapsed().as_micros() as i64;

        let server_error = match serde_json::from_str::<ServerResponse>(&body) {
            Ok(resp) => resp.is_error(),
            Err(e) => {
                debug!("Room {}: unparseable response ({}): {}", msg.room_id, e, body);
                false
            }
        };

        Ok(Exchange {
            send_timestamp_ms,
            latency_micros,
            server_error,
        })
    }
}

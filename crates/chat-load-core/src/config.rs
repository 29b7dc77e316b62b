use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub scenario: ScenarioConfig,
    pub phases: PhaseConfig,
    pub queue: QueueConfig,
    pub pool: PoolConfig,
    pub retry: RetryConfig,
    pub metrics: MetricsConfig,
    pub target: TargetConfig,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("message type weights must not all be zero")]
    EmptyWeights,
    #[error("warmup needs {warmup} messages but only {total} are generated")]
    WarmupExceedsTotal { warmup: u64, total: u64 },
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let non_zero: [(&'static str, u64); 9] = [
            ("scenario.total_messages", self.scenario.total_messages),
            ("scenario.max_user_id", self.scenario.max_user_id as u64),
            ("scenario.room_count", self.scenario.room_count as u64),
            ("phases.main_threads", self.phases.main_threads as u64),
            ("queue.capacity", self.queue.capacity as u64),
            ("pool.connections_per_room", self.pool.connections_per_room as u64),
            ("retry.max_retries", self.retry.max_retries as u64),
            ("retry.response_timeout_ms", self.retry.response_timeout_ms),
            ("metrics.bucket_seconds", self.metrics.bucket_seconds),
        ];
        for (name, value) in non_zero {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }

        if self.scenario.weights.total() == 0 {
            return Err(ConfigError::EmptyWeights);
        }

        let warmup = self.phases.warmup_total();
        if warmup > self.scenario.total_messages {
            return Err(ConfigError::WarmupExceedsTotal {
                warmup,
                total: self.scenario.total_messages,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScenarioConfig {
    /// Total number of messages generated over the whole run (warmup included)
    pub total_messages: u64,
    /// User ids are drawn uniformly from [1, max_user_id]
    pub max_user_id: u32,
    /// Room ids are drawn uniformly from [1, room_count]
    pub room_count: u32,
    /// Relative weights of TEXT / JOIN / LEAVE messages
    pub weights: MessageWeights,
    /// Optional seed for reproducible message generation
    pub seed: Option<u64>,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            total_messages: 500_000,
            max_user_id: 100_000,
            room_count: 20,
            weights: MessageWeights::default(),
            seed: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageWeights {
    pub text: u32,
    pub join: u32,
    pub leave: u32,
}

impl MessageWeights {
    pub fn total(&self) -> u32 {
        self.text + self.join + self.leave
    }
}

impl Default for MessageWeights {
    fn default() -> Self {
        Self {
            text: 90,
            join: 5,
            leave: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PhaseConfig {
    pub warmup_threads: usize,
    pub warmup_messages_per_thread: u64,
    pub main_threads: usize,
    /// Interval between progress lines during the measurement phase
    pub progress_interval_ms: u64,
}

impl PhaseConfig {
    pub fn warmup_total(&self) -> u64 {
        self.warmup_threads as u64 * self.warmup_messages_per_thread
    }
}

impl Default for PhaseConfig {
    fn default() -> Self {
        Self {
            warmup_threads: 32,
            warmup_messages_per_thread: 1000,
            main_threads: 64,
            progress_interval_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { capacity: 50_000 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub connections_per_room: usize,
    /// Upper bound on opening one connection
    pub connect_timeout_ms: u64,
}

impl PoolConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connections_per_room: 15,
            connect_timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub response_timeout_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff_ms: 50,
            response_timeout_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub bucket_seconds: u64,
    pub csv_path: PathBuf,
    pub chart_data_path: PathBuf,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            bucket_seconds: 1,
            csv_path: PathBuf::from("results/metrics.csv"),
            chart_data_path: PathBuf::from("results/throughput_chart.json"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    /// Base WebSocket URI; the room id is appended per connection
    pub server_uri: String,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            server_uri: "ws://localhost:8080/chat/".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_serde() {
        let config_str = r#"
[scenario]
total_messages = 1000
room_count = 4
seed = 42

[scenario.weights]
text = 80
join = 10
leave = 10

[phases]
warmup_threads = 2
warmup_messages_per_thread = 100
main_threads = 8

[pool]
connections_per_room = 3

[retry]
max_retries = 3
initial_backoff_ms = 10

[target]
server_uri = "ws://10.0.0.5:8080/chat/"
        "#;

        let config: Config = toml::from_str(config_str).unwrap();
        assert_eq!(config.scenario.total_messages, 1000);
        assert_eq!(config.scenario.room_count, 4);
        assert_eq!(config.scenario.seed, Some(42));
        assert_eq!(config.scenario.weights.text, 80);
        assert_eq!(config.phases.warmup_total(), 200);
        assert_eq!(config.pool.connections_per_room, 3);
        assert_eq!(config.retry.max_retries, 3);
        // untouched sections fall back to defaults
        assert_eq!(config.retry.response_timeout_ms, 1000);
        assert_eq!(config.queue.capacity, 50_000);
        assert_eq!(config.metrics.bucket_seconds, 1);
        assert_eq!(config.target.server_uri, "ws://10.0.0.5:8080/chat/");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert_eq!(config.scenario.total_messages, 500_000);
        assert_eq!(config.phases.warmup_total(), 32_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.pool.connections_per_room = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::Zero("pool.connections_per_room"))
        );

        let mut config = Config::default();
        config.scenario.weights = MessageWeights {
            text: 0,
            join: 0,
            leave: 0,
        };
        assert_eq!(config.validate(), Err(ConfigError::EmptyWeights));

        let mut config = Config::default();
        config.scenario.total_messages = 10;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::WarmupExceedsTotal { warmup: 32_000, total: 10 })
        ));
    }
}

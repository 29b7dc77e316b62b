use crate::config::{MessageWeights, ScenarioConfig};
use crate::message::{ChatMessage, MessageType};
use crate::queue::WorkQueue;
use chrono::{SecondsFormat, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const PROGRESS_EVERY: u64 = 10_000;

pub const MESSAGE_POOL: [&str; 50] = [
    "01. This is message #01 from the message pool.",
    "02. This is message #02 from the message pool.",
    "03. This is message #03 from the message pool.",
    "04. This is message #04 from the message pool.",
    "05. This is message #05 from the message pool.",
    "06. This is message #06 from the message pool.",
    "07. This is message #07 from the message pool.",
    "08. This is message #08 from the message pool.",
    "09. This is message #09 from the message pool.",
    "10. This is message #10 from the message pool.",
    "11. This is message #11 from the message pool.",
    "12. This is message #12 from the message pool.",
    "13. This is message #13 from the message pool.",
    "14. This is message #14 from the message pool.",
    "15. This is message #15 from the message pool.",
    "16. This is message #16 from the message pool.",
    "17. This is message #17 from the message pool.",
    "18. This is message #18 from the message pool.",
    "19. This is message #19 from the message pool.",
    "20. This is message #20 from the message pool.",
    "21. This is message #21 from the message pool.",
    "22. This is message #22 from the message pool.",
    "23. This is message #23 from the message pool.",
    "24. This is message #24 from the message pool.",
    "25. This is message #25 from the message pool.",
    "26. This is message #26 from the message pool.",
    "27. This is message #27 from the message pool.",
    "28. This is message #28 from the message pool.",
    "29. This is message #29 from the message pool.",
    "30. This is message #30 from the message pool.",
    "31. This is message #31 from the message pool.",
    "32. This is message #32 from the message pool.",
    "33. This is message #33 from the message pool.",
    "34. This is message #34 from the message pool.",
    "35. This is message #35 from the message pool.",
    "36. This is message #36 from the message pool.",
    "37. This is message #37 from the message pool.",
    "38. This is message #38 from the message pool.",
    "39. This is message #39 from the message pool.",
    "40. This is message #40 from the message pool.",
    "41. This is message #41 from the message pool.",
    "42. This is message #42 from the message pool.",
    "43. This is message #43 from the message pool.",
    "44. This is message #44 from the message pool.",
    "45. This is message #45 from the message pool.",
    "46. This is message #46 from the message pool.",
    "47. This is message #47 from the message pool.",
    "48. This is message #48 from the message pool.",
    "49. This is message #49 from the message pool.",
    "50. This is message #50 from the message pool.",
];

/// How a generator run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneratorOutcome {
    Completed { generated: u64 },
    Interrupted { generated: u64 },
}

impl GeneratorOutcome {
    pub fn generated(&self) -> u64 {
        match self {
            GeneratorOutcome::Completed { generated } | GeneratorOutcome::Interrupted { generated } => {
                *generated
            }
        }
    }
}

/// Synthetic chat traffic source.
pub struct MessageGenerator {
    rng: StdRng,
    max_user_id: u32,
    room_count: u32,
    weights: MessageWeights,
}

impl MessageGenerator {
    pub fn new(config: &ScenarioConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            rng,
            max_user_id: config.max_user_id.max(1),
            room_count: config.room_count.max(1),
            weights: config.weights,
        }
    }

    pub fn next_message(&mut self) -> ChatMessage {
        let user_id = self.rng.gen_range(1..=self.max_user_id);
        let message = MESSAGE_POOL[self.rng.gen_range(0..MESSAGE_POOL.len())];
        let message_type = self.pick_type();
        let room_id = self.rng.gen_range(1..=self.room_count);

        ChatMessage {
            user_id: user_id.to_string(),
            username: format!("user{user_id}"),
            message: message.to_string(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            message_type,
            room_id,
        }
    }

    fn pick_type(&mut self) -> MessageType {
        let total = self.weights.total().max(1);
        let roll = self.rng.gen_range(0..total);
        if roll < self.weights.text {
            MessageType::Text
        } else if roll < self.weights.text + self.weights.join {
            MessageType::Join
        } else {
            MessageType::Leave
        }
    }

    /// Push exactly `total` messages into `queue`, waiting on backpressure.
    /// Stops early when `cancel` fires or the queue is closed underneath it.
    pub async fn run(
        mut self,
        queue: &WorkQueue<ChatMessage>,
        total: u64,
        cancel: &CancellationToken,
    ) -> GeneratorOutcome {
        let mut generated = 0u64;
        while generated < total {
            let message = self.next_message();
            let pushed = tokio::select! {
                biased;
                _ = cancel.cancelled() => false,
                res = queue.push(message) => res.is_ok(),
            };
            if !pushed {
                warn!("Message generation interrupted after {} messages", generated);
                return GeneratorOutcome::Interrupted { generated };
            }
            generated += 1;

            if generated % PROGRESS_EVERY == 0 {
                info!("Generated {} messages", generated);
            }
        }
        GeneratorOutcome::Completed { generated }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn scenario(seed: u64) -> ScenarioConfig {
        ScenarioConfig {
            total_messages: 10_000,
            max_user_id: 100,
            room_count: 4,
            weights: MessageWeights::default(),
            seed: Some(seed),
        }
    }

    #[test]
    fn test_fields_within_bounds() {
        let mut generator = MessageGenerator::new(&scenario(7));
        for _ in 0..2000 {
            let msg = generator.next_message();
            let id: u32 = msg.user_id.parse().unwrap();
            assert!((1..=100).contains(&id));
            assert_eq!(msg.username, format!("user{id}"));
            assert!((1..=4).contains(&msg.room_id));
            assert!(MESSAGE_POOL.contains(&msg.message.as_str()));
            assert!(chrono::DateTime::parse_from_rfc3339(&msg.timestamp).is_ok());
        }
    }

    #[test]
    fn test_weighted_type_distribution() {
        let mut generator = MessageGenerator::new(&scenario(11));
        let mut counts: HashMap<MessageType, u32> = HashMap::new();
        for _ in 0..20_000 {
            *counts.entry(generator.next_message().message_type).or_default() += 1;
        }
        let text = counts[&MessageType::Text];
        let join = counts[&MessageType::Join];
        let leave = counts[&MessageType::Leave];
        assert!((17_500..=18_500).contains(&text), "text: {}", text);
        assert!((700..=1300).contains(&join), "join: {}", join);
        assert!((700..=1300).contains(&leave), "leave: {}", leave);
    }

    #[test]
    fn test_zero_weight_type_never_generated() {
        let mut config = scenario(3);
        config.weights = MessageWeights {
            text: 1,
            join: 0,
            leave: 1,
        };
        let mut generator = MessageGenerator::new(&config);
        for _ in 0..1000 {
            assert_ne!(generator.next_message().message_type, MessageType::Join);
        }
    }

    #[test]
    fn test_seeded_runs_are_reproducible() {
        let mut a = MessageGenerator::new(&scenario(99));
        let mut b = MessageGenerator::new(&scenario(99));
        for _ in 0..100 {
            let (x, y) = (a.next_message(), b.next_message());
            assert_eq!(x.user_id, y.user_id);
            assert_eq!(x.room_id, y.room_id);
            assert_eq!(x.message_type, y.message_type);
        }
    }

    #[tokio::test]
    async fn test_run_pushes_exact_count() {
        let queue = WorkQueue::new(100);
        let cancel = CancellationToken::new();
        let outcome = MessageGenerator::new(&scenario(1))
            .run(&queue, 25, &cancel)
            .await;
        assert_eq!(outcome, GeneratorOutcome::Completed { generated: 25 });

        queue.close();
        let mut popped = 0;
        while queue.pop().await.is_some() {
            popped += 1;
        }
        assert_eq!(popped, 25);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let queue = WorkQueue::new(5);
        let cancel = CancellationToken::new();
        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                cancel.cancel();
            })
        };

        // nobody pops, so the generator blocks after 5 pushes until cancelled
        let outcome = MessageGenerator::new(&scenario(1))
            .run(&queue, 100, &cancel)
            .await;
        canceller.await.unwrap();
        assert_eq!(outcome, GeneratorOutcome::Interrupted { generated: 5 });
    }
}

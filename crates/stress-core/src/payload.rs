use crate::client::EventData;
use crate::config::PublishConfig;
use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Random-size message generator. Each send loop owns one, seeded on its
/// own, while the sequence counter is shared by every generator in the
/// process.
pub struct RandomPayloadGenerator {
    rng: StdRng,
    min_bytes: usize,
    regular_max_bytes: usize,
    large_message_factor: f64,
    sequence: Arc<AtomicU64>,
    publisher_id: Arc<str>,
}

impl RandomPayloadGenerator {
    pub fn new(
        config: &PublishConfig,
        publisher_id: Arc<str>,
        sequence: Arc<AtomicU64>,
        seed: u64,
    ) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            min_bytes: config.min_bytes,
            regular_max_bytes: config.regular_max_bytes,
            large_message_factor: config.large_message_factor.clamp(0.0, 1.0),
            sequence,
            publisher_id,
        }
    }

    /// Draw a body size. With probability `large_message_factor` the size
    /// may reach the largest item a batch can hold, otherwise it stays
    /// below `regular_max_bytes`.
    pub fn body_size(&mut self, max_batch_item_bytes: usize) -> usize {
        let upper = if self.rng.gen_bool(self.large_message_factor) {
            max_batch_item_bytes
        } else {
            self.regular_max_bytes
        };

        if upper <= self.min_bytes {
            return self.min_bytes;
        }
        self.rng.gen_range(self.min_bytes..upper)
    }

    pub fn generate(&mut self, max_batch_item_bytes: usize) -> EventData {
        let mut body = vec![0u8; self.body_size(max_batch_item_bytes)];
        self.rng.fill_bytes(&mut body);

        EventData {
            body,
            message_id: Uuid::new_v4(),
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
            published_at: Utc::now(),
            publisher_id: self.publisher_id.clone(),
        }
    }
}

//! Seeded synthetic backend for offline calibration and tests.

use std::sync::Mutex;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::backend::ScoringBackend;
use super::prompts::JudgeRequest;
use crate::gateway::ProviderError;

/// Emits JSON replies around a target score.
///
/// The target is expressed as a fraction of the criterion scale so one
/// simulated judge can serve criteria with different scales. Jitter is in
/// scale units, scaled by the sampling temperature, and the result is clamped
/// into the scale.
#[derive(Debug)]
pub struct SimulatedBackend {
    target_fraction: f64,
    jitter: f64,
    rng: Mutex<StdRng>,
}

impl SimulatedBackend {
    pub fn new(seed: u64, target_fraction: f64, jitter: f64) -> Self {
        Self {
            target_fraction: target_fraction.clamp(0.0, 1.0),
            jitter: jitter.abs(),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    fn draw(&self, request: &JudgeRequest, temperature: f32) -> f64 {
        let scale = request.scale;
        let center = scale.min + self.target_fraction * (scale.max - scale.min);
        let spread = self.jitter * f64::from(temperature);
        let noise = if spread > 0.0 {
            let mut rng = match self.rng.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            rng.gen_range(-spread..=spread)
        } else {
            0.0
        };
        (center + noise).clamp(scale.min, scale.max)
    }
}

#[async_trait]
impl ScoringBackend for SimulatedBackend {
    async fn complete(
        &self,
        request: &JudgeRequest,
        temperature: f32,
    ) -> Result<String, ProviderError> {
        let score = self.draw(request, temperature);
        Ok(serde_json::json!({
            "score": score,
            "rationale": format!("simulated judgement for {}", request.criterion_id),
        })
        .to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::criteria::Scale;
    use crate::judge::parse::parse_score_reply;

    fn request() -> JudgeRequest {
        JudgeRequest {
            criterion_id: "relevance".into(),
            scale: Scale::new(0.0, 10.0),
            system: String::new(),
            user: String::new(),
            run_id: None,
        }
    }

    #[tokio::test]
    async fn zero_temperature_is_exact() {
        let backend = SimulatedBackend::new(7, 0.5, 2.0);
        let reply = backend.complete(&request(), 0.0).await.unwrap();
        let parsed = parse_score_reply(&reply, request().scale).unwrap();
        assert_eq!(parsed.score, 5.0);
    }

    #[tokio::test]
    async fn same_seed_same_sequence() {
        let a = SimulatedBackend::new(42, 0.5, 1.5);
        let b = SimulatedBackend::new(42, 0.5, 1.5);
        for _ in 0..5 {
            let ra = a.complete(&request(), 1.0).await.unwrap();
            let rb = b.complete(&request(), 1.0).await.unwrap();
            assert_eq!(ra, rb);
            let score = parse_score_reply(&ra, request().scale).unwrap().score;
            assert!((3.5..=6.5).contains(&score));
        }
    }
}

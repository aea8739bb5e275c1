//! Token selection from a logit vector.
//!
//! Greedy when the temperature is zero. Otherwise candidates are cut to the
//! `top_k` highest logits, softmaxed at the given temperature, cut again to
//! the smallest nucleus whose mass exceeds `top_p`, and drawn from.

use std::cmp::Ordering;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::inference::backend::TokenId;

pub const DEFAULT_TEMPERATURE: f32 = 0.8;
pub const DEFAULT_TOP_P: f32 = 0.95;
pub const DEFAULT_TOP_K: u32 = 40;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    pub temperature: f32,

    /// Nucleus mass; `>= 1.0` disables the cut.
    pub top_p: f32,

    /// Candidate count; `0` disables the cut.
    pub top_k: u32,

    pub seed: Option<u64>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: DEFAULT_TEMPERATURE,
            top_p: DEFAULT_TOP_P,
            top_k: DEFAULT_TOP_K,
            seed: None,
        }
    }
}

impl SamplingParams {
    pub fn greedy() -> Self {
        Self {
            temperature: 0.0,
            ..Self::default()
        }
    }

    pub fn is_greedy(&self) -> bool {
        self.temperature <= 0.0
    }
}

/// Stateful sampler; one per generation so a seed covers the whole run.
pub struct Sampler {
    params: SamplingParams,
    rng: StdRng,
}

impl Sampler {
    pub fn new(params: SamplingParams) -> Self {
        let rng = match params.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { params, rng }
    }

    /// Pick a token. `None` when there is nothing to pick from.
    pub fn sample(&mut self, logits: &[f32]) -> Option<TokenId> {
        if logits.is_empty() {
            return None;
        }
        if self.params.is_greedy() {
            return argmax(logits).map(to_token);
        }

        let mut candidates: Vec<(usize, f32)> = logits
            .iter()
            .copied()
            .enumerate()
            .filter(|(_, l)| !l.is_nan())
            .collect();
        if candidates.is_empty() {
            return None;
        }
        candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));

        let k = self.params.top_k as usize;
        if k > 0 && k < candidates.len() {
            candidates.truncate(k);
        }

        // Softmax at temperature, shifted by the max for stability.
        let max = candidates[0].1;
        let t = self.params.temperature;
        for c in candidates.iter_mut() {
            c.1 = ((c.1 - max) / t).exp();
        }
        let sum: f32 = candidates.iter().map(|(_, p)| p).sum();
        for c in candidates.iter_mut() {
            c.1 /= sum;
        }

        if self.params.top_p < 1.0 {
            let mut cumsum = 0.0;
            let mut keep = candidates.len();
            for (i, (_, p)) in candidates.iter().enumerate() {
                cumsum += p;
                if cumsum > self.params.top_p {
                    keep = i + 1;
                    break;
                }
            }
            candidates.truncate(keep);
        }

        let total: f32 = candidates.iter().map(|(_, p)| p).sum();
        let draw: f32 = self.rng.gen::<f32>() * total;
        let mut cumsum = 0.0;
        for (i, p) in &candidates {
            cumsum += p;
            if cumsum > draw {
                return Some(to_token(*i));
            }
        }
        candidates.last().map(|(i, _)| to_token(*i))
    }
}

fn argmax(logits: &[f32]) -> Option<usize> {
    logits
        .iter()
        .enumerate()
        .filter(|(_, l)| !l.is_nan())
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(Ordering::Equal))
        .map(|(i, _)| i)
}

fn to_token(index: usize) -> TokenId {
    index as TokenId
}

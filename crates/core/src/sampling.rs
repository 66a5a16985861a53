//! Token sampling: temperature, top-k, nucleus (top-p), repetition penalty.
//!
//! Strategy priority, first match wins:
//! greedy override > repetition penalty > temperature > (top-k + top-p |
//! top-k | top-p). The repetition penalty is applied to the raw logits
//! before any strategy runs.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SamplingError {
    #[error("empty logits vector")]
    EmptyLogits,

    #[error("invalid sampling parameters: {0}")]
    InvalidParams(String),
}

/// Parameters controlling token selection for one request.
#[derive(Debug, Clone)]
pub struct SamplingParams {
    /// Logit scale. 0 behaves as greedy.
    pub temperature: f32,
    /// Keep only the k highest logits. 1 = greedy.
    pub top_k: usize,
    /// Nucleus threshold in (0, 1]. 1.0 = disabled.
    pub top_p: f32,
    /// Penalty for tokens already generated. 1.0 = none.
    pub repetition_penalty: f32,
    /// Force argmax selection regardless of the other knobs.
    pub greedy: bool,
    /// Seed for deterministic sampling. None = entropy-seeded.
    pub seed: Option<u64>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_k: 1,
            top_p: 1.0,
            repetition_penalty: 1.0,
            greedy: false,
            seed: None,
        }
    }
}

impl SamplingParams {
    pub fn greedy() -> Self {
        Self {
            greedy: true,
            ..Default::default()
        }
    }

    pub fn is_greedy(&self) -> bool {
        self.greedy || self.temperature < 1e-6 || (self.top_k == 1 && self.top_p >= 1.0)
    }

    pub fn validate(&self) -> Result<(), SamplingError> {
        if self.temperature < 0.0 {
            return Err(SamplingError::InvalidParams(format!(
                "temperature must be >= 0, got {}",
                self.temperature
            )));
        }
        if self.top_k < 1 {
            return Err(SamplingError::InvalidParams("top_k must be >= 1".into()));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(SamplingError::InvalidParams(format!(
                "top_p must be in (0, 1], got {}",
                self.top_p
            )));
        }
        if self.repetition_penalty < 1.0 {
            return Err(SamplingError::InvalidParams(format!(
                "repetition_penalty must be >= 1, got {}",
                self.repetition_penalty
            )));
        }
        Ok(())
    }
}

/// Per-request RNG. Seeded requests reproduce their draws exactly.
pub struct SamplerState {
    rng: StdRng,
}

impl SamplerState {
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        Self { rng }
    }

    pub fn rng_mut(&mut self) -> &mut StdRng {
        &mut self.rng
    }
}

/// Select a token id from a single logits row.
pub fn sample(
    logits: &[f32],
    params: &SamplingParams,
    history: &[u32],
    state: &mut SamplerState,
) -> Result<u32, SamplingError> {
    if logits.is_empty() {
        return Err(SamplingError::EmptyLogits);
    }

    let mut logits = logits.to_vec();
    if params.repetition_penalty > 1.0 && !history.is_empty() {
        apply_repetition_penalty(&mut logits, history, params.repetition_penalty);
    }

    if params.is_greedy() {
        return Ok(argmax(&logits));
    }

    if params.temperature != 1.0 {
        let inv = 1.0 / params.temperature;
        for logit in logits.iter_mut() {
            *logit *= inv;
        }
    }

    let token = if params.top_k > 1 && params.top_p < 1.0 {
        top_k_top_p_sample(&logits, params.top_k, params.top_p, &mut state.rng)
    } else if params.top_k > 1 {
        top_k_sample(&logits, params.top_k, &mut state.rng)
    } else if params.top_p < 1.0 {
        top_p_sample(&logits, params.top_p, &mut state.rng)
    } else {
        argmax(&logits)
    };
    Ok(token)
}

/// Demote tokens seen in the history: positive logits shrink by the
/// penalty, negative logits grow in magnitude.
fn apply_repetition_penalty(logits: &mut [f32], history: &[u32], penalty: f32) {
    let mut seen = vec![false; logits.len()];
    for &token in history {
        if (token as usize) < seen.len() {
            seen[token as usize] = true;
        }
    }
    for (logit, &hit) in logits.iter_mut().zip(seen.iter()) {
        if hit {
            if *logit > 0.0 {
                *logit /= penalty;
            } else {
                *logit *= penalty;
            }
        }
    }
}

fn argmax(logits: &[f32]) -> u32 {
    let mut best = 0usize;
    let mut best_val = logits[0];
    for (idx, &val) in logits.iter().enumerate().skip(1) {
        if val > best_val {
            best_val = val;
            best = idx;
        }
    }
    best as u32
}

/// Numerically stable softmax.
fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut probs: Vec<f32> = logits.iter().map(|&l| (l - max).exp()).collect();
    let sum: f32 = probs.iter().sum();
    if sum > 0.0 {
        for p in probs.iter_mut() {
            *p /= sum;
        }
    }
    probs
}

/// The k largest logits as `(logit, token)` pairs, descending, stable on
/// ties by token id.
fn top_k_pairs(logits: &[f32], k: usize) -> Vec<(f32, usize)> {
    let mut pairs: Vec<(f32, usize)> = logits.iter().copied().zip(0..).collect();
    pairs.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    pairs.truncate(k.min(pairs.len()));
    pairs
}

fn top_k_sample(logits: &[f32], k: usize, rng: &mut StdRng) -> u32 {
    let pairs = top_k_pairs(logits, k);
    let kept: Vec<f32> = pairs.iter().map(|&(l, _)| l).collect();
    let probs = softmax(&kept);
    pairs[categorical(&probs, rng)].1 as u32
}

fn top_p_sample(logits: &[f32], p: f32, rng: &mut StdRng) -> u32 {
    let probs = softmax(logits);
    let mut pairs: Vec<(f32, usize)> = probs.iter().copied().zip(0..).collect();
    pairs.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    let nucleus = nucleus_prefix(&pairs, p);
    sample_from_pairs(nucleus, rng)
}

fn top_k_top_p_sample(logits: &[f32], k: usize, p: f32, rng: &mut StdRng) -> u32 {
    let pairs = top_k_pairs(logits, k);
    let kept: Vec<f32> = pairs.iter().map(|&(l, _)| l).collect();
    let probs = softmax(&kept);
    let prob_pairs: Vec<(f32, usize)> = probs
        .iter()
        .zip(pairs.iter())
        .map(|(&prob, &(_, token))| (prob, token))
        .collect();
    let nucleus = nucleus_prefix(&prob_pairs, p);
    sample_from_pairs(nucleus, rng)
}

/// Smallest prefix of descending-probability pairs whose mass reaches `p`.
/// Always keeps at least one element.
fn nucleus_prefix(pairs: &[(f32, usize)], p: f32) -> &[(f32, usize)] {
    let mut mass = 0.0f32;
    for (idx, &(prob, _)) in pairs.iter().enumerate() {
        mass += prob;
        if mass >= p {
            return &pairs[..=idx];
        }
    }
    pairs
}

fn sample_from_pairs(pairs: &[(f32, usize)], rng: &mut StdRng) -> u32 {
    let probs: Vec<f32> = pairs.iter().map(|&(prob, _)| prob).collect();
    let sum: f32 = probs.iter().sum();
    if sum > 0.0 {
        let normalized: Vec<f32> = probs.iter().map(|&prob| prob / sum).collect();
        pairs[categorical(&normalized, rng)].1 as u32
    } else {
        pairs[0].1 as u32
    }
}

/// Inverse-transform draw from a normalized distribution. Falls back to
/// the mode when the distribution is degenerate.
fn categorical(probs: &[f32], rng: &mut StdRng) -> usize {
    let sum: f32 = probs.iter().sum();
    if !(sum > 0.0) || !sum.is_finite() {
        return probs
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(idx, _)| idx)
            .unwrap_or(0);
    }
    let draw: f32 = rng.gen::<f32>() * sum;
    let mut acc = 0.0f32;
    for (idx, &prob) in probs.iter().enumerate() {
        acc += prob;
        if draw < acc {
            return idx;
        }
    }
    probs.len() - 1
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(seed: u64) -> SamplerState {
        SamplerState::new(Some(seed))
    }

    #[test]
    fn default_params_are_greedy_equivalent() {
        let params = SamplingParams::default();
        assert!(params.is_greedy());
        params.validate().unwrap();
    }

    #[test]
    fn greedy_picks_argmax() {
        let logits = vec![0.1, 3.0, -1.0, 2.9];
        let token = sample(&logits, &SamplingParams::greedy(), &[], &mut state(0)).unwrap();
        assert_eq!(token, 1);
    }

    #[test]
    fn zero_temperature_is_greedy() {
        let params = SamplingParams {
            temperature: 0.0,
            top_k: 50,
            top_p: 0.9,
            ..Default::default()
        };
        let logits = vec![0.0, 0.5, 5.0, 1.0];
        let token = sample(&logits, &params, &[], &mut state(7)).unwrap();
        assert_eq!(token, 2);
    }

    #[test]
    fn empty_logits_is_an_error() {
        let err = sample(&[], &SamplingParams::default(), &[], &mut state(0)).unwrap_err();
        assert!(matches!(err, SamplingError::EmptyLogits));
    }

    #[test]
    fn repetition_penalty_demotes_repeated_token() {
        let params = SamplingParams {
            repetition_penalty: 100.0,
            ..Default::default()
        };
        // Token 0 dominates, but the history has seen it; token 1 wins.
        let logits = vec![5.0, 4.9, 0.0];
        let token = sample(&logits, &params, &[0], &mut state(0)).unwrap();
        assert_eq!(token, 1);
    }

    #[test]
    fn repetition_penalty_amplifies_negative_logits() {
        let mut logits = vec![-1.0, 2.0];
        apply_repetition_penalty(&mut logits, &[0], 2.0);
        assert_eq!(logits, vec![-2.0, 2.0]);
    }

    #[test]
    fn top_k_restricts_candidates() {
        let params = SamplingParams {
            top_k: 2,
            temperature: 1.0,
            ..Default::default()
        };
        let logits = vec![10.0, 9.0, -50.0, -50.0];
        for seed in 0..50 {
            let token = sample(&logits, &params, &[], &mut state(seed)).unwrap();
            assert!(token == 0 || token == 1, "token {token} outside top-2");
        }
    }

    #[test]
    fn top_p_keeps_smallest_sufficient_prefix() {
        let params = SamplingParams {
            top_k: 1000,
            top_p: 0.5,
            ..Default::default()
        };
        // Token 3 alone carries well over half the mass.
        let logits = vec![0.0, 0.0, 0.0, 10.0];
        for seed in 0..50 {
            let token = sample(&logits, &params, &[], &mut state(seed)).unwrap();
            assert_eq!(token, 3);
        }
    }

    #[test]
    fn seeded_sampling_is_deterministic() {
        let params = SamplingParams {
            top_k: 4,
            top_p: 0.9,
            temperature: 0.8,
            ..Default::default()
        };
        let logits = vec![1.0, 1.1, 0.9, 1.05];
        let a: Vec<u32> = (0..16)
            .scan(state(42), |s, _| sample(&logits, &params, &[], s).ok())
            .collect();
        let b: Vec<u32> = (0..16)
            .scan(state(42), |s, _| sample(&logits, &params, &[], s).ok())
            .collect();
        assert_eq!(a, b);
    }

    #[test]
    fn validate_rejects_bad_params() {
        let bad = [
            SamplingParams {
                temperature: -0.1,
                ..Default::default()
            },
            SamplingParams {
                top_k: 0,
                ..Default::default()
            },
            SamplingParams {
                top_p: 0.0,
                ..Default::default()
            },
            SamplingParams {
                top_p: 1.5,
                ..Default::default()
            },
            SamplingParams {
                repetition_penalty: 0.5,
                ..Default::default()
            },
        ];
        for params in bad {
            assert!(params.validate().is_err(), "{params:?} should be rejected");
        }
    }

    #[test]
    fn softmax_handles_large_logits() {
        let probs = softmax(&[1000.0, 999.0]);
        assert!((probs.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        assert!(probs[0] > probs[1]);
    }

    #[test]
    fn nucleus_always_keeps_one() {
        let pairs = vec![(0.4, 0), (0.3, 1), (0.3, 2)];
        let kept = nucleus_prefix(&pairs, 0.1);
        assert_eq!(kept.len(), 1);
        let kept = nucleus_prefix(&pairs, 0.69);
        assert_eq!(kept.len(), 2);
        let kept = nucleus_prefix(&pairs, 1.0);
        assert_eq!(kept.len(), 3);
    }
}

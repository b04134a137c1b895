//! Candidate token set and the transforms applied to it
//!
//! Every transform works in place on a [`Candidates`] built from one decode's
//! logits. Transforms that need probabilities call [`Candidates::softmax`],
//! which sorts by descending logit; ties keep vocabulary order.

use crate::error::{LlamaCtxError, Result};
use crate::token::TokenId;
use rand::Rng;
use rand::distributions::{Distribution, WeightedIndex};
use std::collections::HashMap;

/// One vocabulary entry under consideration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenData {
    pub id: TokenId,
    /// Raw or transformed score
    pub logit: f32,
    /// Probability, valid after [`Candidates::softmax`]
    pub p: f32,
}

/// Candidate set for one sampling step.
#[derive(Debug, Clone)]
pub struct Candidates {
    data: Vec<TokenData>,
    sorted: bool,
}

impl Candidates {
    /// One candidate per vocabulary entry, in vocabulary order.
    pub fn from_logits(logits: &[f32]) -> Self {
        let data = logits
            .iter()
            .enumerate()
            .map(|(i, &logit)| TokenData {
                id: TokenId(i as i32),
                logit,
                p: 0.0,
            })
            .collect();
        Self {
            data,
            sorted: false,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[TokenData] {
        &self.data
    }

    fn sort_descending(&mut self) {
        if !self.sorted {
            // Stable: equal logits stay in vocabulary order
            self.data.sort_by(|a, b| b.logit.total_cmp(&a.logit));
            self.sorted = true;
        }
    }

    /// Sort by descending logit and fill in normalized probabilities.
    pub fn softmax(&mut self) {
        if self.data.is_empty() {
            return;
        }
        self.sort_descending();

        let max_logit = self.data[0].logit;
        let mut sum = 0.0f32;
        for d in &mut self.data {
            d.p = (d.logit - max_logit).exp();
            sum += d.p;
        }
        for d in &mut self.data {
            d.p /= sum;
        }
    }

    /// Penalize every candidate that occurs in `last_tokens`.
    ///
    /// Positive logits are divided by `penalty_repeat`, non-positive ones
    /// multiplied by it. Then `count * penalty_freq + penalty_present` is
    /// subtracted, where `count` is the number of occurrences in the window.
    pub fn apply_repetition_penalties(
        &mut self,
        last_tokens: &[TokenId],
        penalty_repeat: f32,
        penalty_freq: f32,
        penalty_present: f32,
    ) {
        if last_tokens.is_empty()
            || (penalty_repeat == 1.0 && penalty_freq == 0.0 && penalty_present == 0.0)
        {
            return;
        }

        let mut counts: HashMap<TokenId, u32> = HashMap::new();
        for &token in last_tokens {
            *counts.entry(token).or_default() += 1;
        }

        for d in &mut self.data {
            let Some(&count) = counts.get(&d.id) else {
                continue;
            };
            if d.logit <= 0.0 {
                d.logit *= penalty_repeat;
            } else {
                d.logit /= penalty_repeat;
            }
            d.logit -= count as f32 * penalty_freq + penalty_present;
        }

        self.sorted = false;
    }

    /// Highest-scoring candidate; the first one wins a tie. NaN scores never
    /// win.
    pub fn greedy(&self) -> Option<TokenId> {
        let mut best: Option<&TokenData> = None;
        for d in &self.data {
            if d.logit.is_nan() {
                continue;
            }
            if best.is_none_or(|b| d.logit > b.logit) {
                best = Some(d);
            }
        }
        best.map(|d| d.id)
    }

    /// Keep the `k` highest-scoring candidates (at least `min_keep`).
    pub fn top_k(&mut self, k: usize, min_keep: usize) {
        let k = k.max(min_keep).min(self.data.len());
        if k == 0 {
            return;
        }
        self.sort_descending();
        self.data.truncate(k);
    }

    /// Tail-free sampling. `z >= 1.0` disables it.
    pub fn tail_free(&mut self, z: f32, min_keep: usize) {
        if z >= 1.0 || self.data.len() <= 2 {
            return;
        }
        self.softmax();

        let first: Vec<f32> = self.data.windows(2).map(|w| w[0].p - w[1].p).collect();
        let mut second: Vec<f32> = first.windows(2).map(|w| (w[0] - w[1]).abs()).collect();

        let sum: f32 = second.iter().sum();
        if sum > 1e-6 {
            for v in &mut second {
                *v /= sum;
            }
        } else {
            let uniform = 1.0 / second.len() as f32;
            second.fill(uniform);
        }

        let mut cum = 0.0f32;
        let mut last_idx = self.data.len();
        for (i, v) in second.iter().enumerate() {
            cum += v;
            if cum > z && i >= min_keep {
                last_idx = i;
                break;
            }
        }
        self.data.truncate(last_idx);
    }

    /// Locally typical sampling. `p >= 1.0` disables it.
    ///
    /// Leaves the set ordered by closeness to the distribution's entropy, not
    /// by logit.
    pub fn typical(&mut self, p: f32, min_keep: usize) {
        if p >= 1.0 {
            return;
        }
        self.softmax();

        let entropy: f32 = -self
            .data
            .iter()
            .filter(|d| d.p > 0.0)
            .map(|d| d.p * d.p.ln())
            .sum::<f32>();

        let shifted: Vec<f32> = self
            .data
            .iter()
            .map(|d| (-d.p.ln() - entropy).abs())
            .collect();
        let mut indices: Vec<usize> = (0..self.data.len()).collect();
        indices.sort_by(|&a, &b| shifted[a].total_cmp(&shifted[b]));

        let mut cum = 0.0f32;
        let mut last_idx = indices.len();
        for (i, &idx) in indices.iter().enumerate() {
            cum += self.data[idx].p;
            if cum > p && i + 1 >= min_keep {
                last_idx = i + 1;
                break;
            }
        }

        self.data = indices[..last_idx].iter().map(|&i| self.data[i]).collect();
        self.sorted = false;
    }

    /// Nucleus sampling: keep the smallest prefix whose probability mass
    /// reaches `p`. `p >= 1.0` disables it.
    pub fn top_p(&mut self, p: f32, min_keep: usize) {
        if p >= 1.0 {
            return;
        }
        self.softmax();

        let mut cum = 0.0f32;
        let mut last_idx = self.data.len();
        for (i, d) in self.data.iter().enumerate() {
            cum += d.p;
            if cum >= p && i + 1 >= min_keep {
                last_idx = i + 1;
                break;
            }
        }
        self.data.truncate(last_idx);
    }

    /// Scale logits by `1 / temperature` (> 0).
    ///
    /// Logits are taken relative to the highest one first, so the top
    /// candidate lands on 0.0 and a tiny temperature cannot overflow.
    pub fn temperature(&mut self, temperature: f32) {
        let max_logit = self
            .data
            .iter()
            .map(|d| d.logit)
            .fold(f32::NEG_INFINITY, f32::max);
        for d in &mut self.data {
            d.logit = (d.logit - max_logit) / temperature;
        }
    }

    /// Draw one candidate from the softmax distribution.
    ///
    /// Scores that leave no usable distribution (all non-finite) fall back to
    /// greedy selection. Fails only on an empty candidate set.
    pub fn sample<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Result<TokenId> {
        self.softmax();
        match WeightedIndex::new(self.data.iter().map(|d| d.p)) {
            Ok(dist) => Ok(self.data[dist.sample(rng)].id),
            Err(e) => {
                tracing::debug!("Falling back to greedy selection: {}", e);
                self.greedy()
                    .or_else(|| self.data.first().map(|d| d.id))
                    .ok_or_else(|| LlamaCtxError::evaluation("no candidates to sample from"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn ids(c: &Candidates) -> Vec<i32> {
        c.as_slice().iter().map(|d| d.id.0).collect()
    }

    #[test]
    fn test_from_logits_keeps_vocab_order() {
        let c = Candidates::from_logits(&[0.5, 2.0, -1.0]);
        assert_eq!(ids(&c), vec![0, 1, 2]);
        assert_eq!(c.as_slice()[1].logit, 2.0);
    }

    #[test]
    fn test_softmax_sorts_and_normalizes() {
        let mut c = Candidates::from_logits(&[1.0, 3.0, 2.0]);
        c.softmax();
        assert_eq!(ids(&c), vec![1, 2, 0]);
        let total: f32 = c.as_slice().iter().map(|d| d.p).sum();
        assert!((total - 1.0).abs() < 1e-5);
        assert!(c.as_slice()[0].p > c.as_slice()[1].p);
    }

    #[test]
    fn test_greedy_tie_breaks_to_lowest_index() {
        let c = Candidates::from_logits(&[1.0, 5.0, 5.0, 2.0]);
        assert_eq!(c.greedy(), Some(TokenId(1)));
        assert_eq!(Candidates::from_logits(&[]).greedy(), None);
    }

    #[test]
    fn test_repetition_penalty_signs() {
        let mut c = Candidates::from_logits(&[2.0, -2.0, 4.0]);
        c.apply_repetition_penalties(&[TokenId(0), TokenId(1)], 2.0, 0.0, 0.0);
        let logits: Vec<f32> = c.as_slice().iter().map(|d| d.logit).collect();
        assert_eq!(logits, vec![1.0, -4.0, 4.0]);
    }

    #[test]
    fn test_frequency_and_presence_penalties() {
        let mut c = Candidates::from_logits(&[1.0, 1.0, 1.0]);
        let window = [TokenId(0), TokenId(0), TokenId(0), TokenId(1)];
        c.apply_repetition_penalties(&window, 1.0, 0.5, 0.25);
        let logits: Vec<f32> = c.as_slice().iter().map(|d| d.logit).collect();
        // token 0: 1.0 - 3 * 0.5 - 0.25, token 1: 1.0 - 0.5 - 0.25
        assert_eq!(logits, vec![-0.75, 0.25, 1.0]);
    }

    #[test]
    fn test_neutral_penalties_are_noop() {
        let logits = [0.3, -1.2, 2.5, 0.0];
        let mut c = Candidates::from_logits(&logits);
        c.apply_repetition_penalties(&[TokenId(0), TokenId(2), TokenId(2)], 1.0, 0.0, 0.0);
        let after: Vec<f32> = c.as_slice().iter().map(|d| d.logit).collect();
        assert_eq!(after, logits.to_vec());
    }

    #[test]
    fn test_top_k_keeps_highest() {
        let mut c = Candidates::from_logits(&[0.1, 0.9, 0.5, 0.7]);
        c.top_k(2, 1);
        assert_eq!(ids(&c), vec![1, 3]);
    }

    #[test]
    fn test_top_k_respects_min_keep_and_size() {
        let mut c = Candidates::from_logits(&[0.1, 0.9, 0.5]);
        c.top_k(1, 2);
        assert_eq!(c.len(), 2);

        let mut c = Candidates::from_logits(&[0.1, 0.9, 0.5]);
        c.top_k(100, 1);
        assert_eq!(c.len(), 3);
    }

    #[test]
    fn test_top_p_truncates_at_mass() {
        // probabilities roughly 0.64, 0.24, 0.09, 0.03
        let mut c = Candidates::from_logits(&[3.0, 2.0, 1.0, 0.0]);
        c.top_p(0.8, 1);
        assert_eq!(ids(&c), vec![0, 1]);

        let mut c = Candidates::from_logits(&[3.0, 2.0, 1.0, 0.0]);
        c.top_p(0.5, 1);
        assert_eq!(ids(&c), vec![0]);
    }

    #[test]
    fn test_top_p_disabled_at_one() {
        let mut c = Candidates::from_logits(&[3.0, 2.0, 1.0, 0.0]);
        c.top_p(1.0, 1);
        assert_eq!(c.len(), 4);
    }

    #[test]
    fn test_tail_free_disabled_at_one() {
        let mut c = Candidates::from_logits(&[3.0, 2.0, 1.0, 0.0, -5.0]);
        c.tail_free(1.0, 1);
        assert_eq!(c.len(), 5);
    }

    #[test]
    fn test_tail_free_cuts_flat_tail() {
        let mut c = Candidates::from_logits(&[10.0, 9.0, 0.0, 0.0, 0.0, 0.0]);
        c.tail_free(0.5, 1);
        assert!(c.len() < 6);
        assert_eq!(c.as_slice()[0].id, TokenId(0));
    }

    #[test]
    fn test_typical_disabled_at_one() {
        let mut c = Candidates::from_logits(&[3.0, 2.0, 1.0]);
        c.typical(1.0, 1);
        assert_eq!(ids(&c), vec![0, 1, 2]);
    }

    #[test]
    fn test_typical_keeps_min_keep() {
        let mut c = Candidates::from_logits(&[3.0, 2.0, 1.0, 0.0]);
        c.typical(0.0, 2);
        assert_eq!(c.len(), 2);
    }

    #[test]
    fn test_temperature_scales_logits() {
        let mut c = Candidates::from_logits(&[1.0, -2.0]);
        c.temperature(0.5);
        let logits: Vec<f32> = c.as_slice().iter().map(|d| d.logit).collect();
        assert_eq!(logits, vec![0.0, -6.0]);
    }

    #[test]
    fn test_tiny_temperature_stays_finite() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut c = Candidates::from_logits(&[0.0, 10.0, 3.0]);
        c.temperature(1e-39);
        assert_eq!(c.as_slice()[1].logit, 0.0);
        assert!(c.as_slice().iter().all(|d| !d.logit.is_nan()));
        assert_eq!(c.sample(&mut rng).unwrap(), TokenId(1));
    }

    #[test]
    fn test_sample_single_candidate() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut c = Candidates::from_logits(&[0.0, 5.0, 1.0]);
        c.top_k(1, 1);
        assert_eq!(c.sample(&mut rng).unwrap(), TokenId(1));
    }

    #[test]
    fn test_sample_degenerate_distribution_falls_back_to_greedy() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut c = Candidates::from_logits(&[f32::NAN, 1.0, f32::INFINITY, f32::INFINITY]);
        assert_eq!(c.sample(&mut rng).unwrap(), TokenId(2));

        let mut all_nan = Candidates::from_logits(&[f32::NAN, f32::NAN]);
        assert!(all_nan.sample(&mut rng).is_ok());
    }

    #[test]
    fn test_sample_empty_fails() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut c = Candidates::from_logits(&[]);
        assert!(matches!(
            c.sample(&mut rng),
            Err(LlamaCtxError::Evaluation(_))
        ));
    }
}

use crate::kernels::{argmax, softmax};

/// Stores a probability and its associated token ID.
#[derive(Clone, Debug)]
struct ProbIndex {
    prob: f32,
    index: usize,
}

/// Temperature / top-p sampler for next-token selection.
///
/// Owns a seeded xorshift PRNG so that runs are reproducible, and a reusable
/// candidate buffer for nucleus sampling.
#[derive(Debug)]
pub struct Sampler {
    probindex: Vec<ProbIndex>,
    temperature: f32,
    topp: f32,
    rng_state: u64,
}

impl Sampler {
    /// Creates a new sampler.
    ///
    /// # Arguments
    /// * `vocab_size` - Size of the vocabulary
    /// * `temperature` - 0.0 for greedy decoding, 1.0 for the raw distribution
    /// * `topp` - Nucleus threshold; values outside (0, 1) disable top-p
    /// * `rng_seed` - Seed for the PRNG
    pub fn new(vocab_size: usize, temperature: f32, topp: f32, rng_seed: u64) -> Self {
        assert!(vocab_size > 0, "Vocab size must be positive");
        assert!(temperature >= 0.0, "Temperature must be non-negative");

        Self {
            probindex: vec![
                ProbIndex {
                    prob: 0.0,
                    index: 0,
                };
                vocab_size
            ],
            temperature,
            topp,
            rng_state: rng_seed,
        }
    }

    /// xorshift64* step.
    fn random_u32(&mut self) -> u32 {
        self.rng_state ^= self.rng_state >> 12;
        self.rng_state ^= self.rng_state << 25;
        self.rng_state ^= self.rng_state >> 27;
        ((self.rng_state.wrapping_mul(0x2545F4914F6CDD1D)) >> 32) as u32
    }

    /// Random float in [0, 1).
    fn random_f32(&mut self) -> f32 {
        (self.random_u32() >> 8) as f32 / 16777216.0
    }

    /// Multinomial draw: smallest index whose cumulative probability exceeds
    /// `coin`. Returns the last index when rounding leaves residue.
    fn sample_mult(probabilities: &[f32], coin: f32) -> usize {
        let mut cdf = 0.0;
        for (i, &prob) in probabilities.iter().enumerate() {
            cdf += prob;
            if coin < cdf {
                return i;
            }
        }
        probabilities.len().saturating_sub(1)
    }

    /// Nucleus draw: samples among the smallest set of tokens whose
    /// cumulative probability exceeds `topp`.
    fn sample_topp(&mut self, probabilities: &[f32], coin: f32) -> usize {
        // Values below (1 - topp) / (n - 1) can never be part of the nucleus,
        // so they are cropped before sorting.
        let cutoff = (1.0 - self.topp) / (probabilities.len().saturating_sub(1).max(1)) as f32;
        let mut n0 = 0;
        for (i, &prob) in probabilities.iter().enumerate() {
            if prob >= cutoff {
                self.probindex[n0] = ProbIndex { prob, index: i };
                n0 += 1;
            }
        }

        self.probindex[..n0].sort_by(|a, b| b.prob.total_cmp(&a.prob));

        // Truncate where the cumulative probability crosses topp.
        let mut cumulative_prob = 0.0;
        let mut last_idx = n0.saturating_sub(1);
        for (i, pi) in self.probindex[..n0].iter().enumerate() {
            cumulative_prob += pi.prob;
            if cumulative_prob > self.topp {
                last_idx = i;
                break;
            }
        }

        // Draw within the truncated prefix.
        let r = coin * cumulative_prob;
        let mut cdf = 0.0;
        for pi in &self.probindex[..=last_idx] {
            cdf += pi.prob;
            if r < cdf {
                return pi.index;
            }
        }
        self.probindex[last_idx].index
    }

    /// Selects the next token from the logits, mutating them in place.
    ///
    /// Temperature 0 is greedy argmax. Otherwise the logits are scaled,
    /// converted to probabilities, and drawn from either the full
    /// distribution or the top-p nucleus.
    pub fn sample(&mut self, logits: &mut [f32]) -> usize {
        if self.temperature == 0.0 {
            return argmax(logits);
        }

        for logit in logits.iter_mut() {
            *logit /= self.temperature;
        }
        softmax(logits);

        let coin = self.random_f32();
        if self.topp <= 0.0 || self.topp >= 1.0 {
            Self::sample_mult(logits, coin)
        } else {
            self.sample_topp(logits, coin)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_draws() {
        let mut a = Sampler::new(4, 1.0, 0.0, 1234);
        let mut b = Sampler::new(4, 1.0, 0.0, 1234);
        for _ in 0..32 {
            assert_eq!(a.random_u32(), b.random_u32());
        }
    }

    #[test]
    fn greedy_at_zero_temperature() {
        let mut sampler = Sampler::new(4, 0.0, 0.9, 7);
        let mut logits = vec![0.1f32, 2.5, -1.0, 2.4];
        assert_eq!(sampler.sample(&mut logits), 1);
        // Greedy never touches the logits.
        assert_eq!(logits, vec![0.1, 2.5, -1.0, 2.4]);
    }

    #[test]
    fn multinomial_respects_cumulative_bounds() {
        let probs = vec![0.1f32, 0.2, 0.3, 0.4];
        assert_eq!(Sampler::sample_mult(&probs, 0.05), 0);
        assert_eq!(Sampler::sample_mult(&probs, 0.15), 1);
        assert_eq!(Sampler::sample_mult(&probs, 0.55), 2);
        assert_eq!(Sampler::sample_mult(&probs, 0.95), 3);
        // Rounding residue falls through to the last index.
        assert_eq!(Sampler::sample_mult(&probs, 1.0), 3);
    }

    #[test]
    fn multinomial_frequencies_converge() {
        let probs = vec![0.1f32, 0.2, 0.3, 0.4];
        let mut sampler = Sampler::new(4, 1.0, 0.0, 42);

        let draws = 20_000;
        let mut counts = [0usize; 4];
        for _ in 0..draws {
            let coin = sampler.random_f32();
            counts[Sampler::sample_mult(&probs, coin)] += 1;
        }

        for (i, &count) in counts.iter().enumerate() {
            let freq = count as f32 / draws as f32;
            assert!(
                (freq - probs[i]).abs() < 0.02,
                "token {i}: frequency {freq} too far from {}",
                probs[i]
            );
        }
    }

    #[test]
    fn topp_draws_stay_inside_the_nucleus() {
        // Sorted descending: 0.30 (3), 0.25 (4), 0.21 (2) already exceed
        // topp = 0.7, so indices 0 and 1 must never come back.
        let probs = vec![0.05f32, 0.19, 0.21, 0.30, 0.25];
        let mut sampler = Sampler::new(5, 1.0, 0.7, 99);

        for step in 0..=100 {
            let coin = step as f32 / 101.0;
            let token = sampler.sample_topp(&probs, coin);
            assert!(
                [2, 3, 4].contains(&token),
                "coin {coin} escaped the nucleus with token {token}"
            );
        }
    }

    #[test]
    fn sampling_path_is_reproducible() {
        let logits = vec![0.5f32, 1.5, 0.2, 1.4, -0.3];

        let mut a = Sampler::new(5, 0.8, 0.9, 2024);
        let mut b = Sampler::new(5, 0.8, 0.9, 2024);
        for _ in 0..16 {
            let mut la = logits.clone();
            let mut lb = logits.clone();
            assert_eq!(a.sample(&mut la), b.sample(&mut lb));
        }
    }
}

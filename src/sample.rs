//! Constant-time sampling from a fixed categorical distribution, used to
//! draw negative targets from the unigram distribution.
//!
//! Implements Vose's alias method as described in
//! <https://www.keithschwarz.com/darts-dice-coins/>.

use anyhow::{ensure, Result};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::Real;

/// Samples an index in `[0, n)` from a fixed distribution in O(1) time,
/// spending one uniform integer and one uniform real per draw.
pub struct AliasSampler {
    alias: Vec<usize>, // alias class for each bucket
    prob: Vec<Real>,   // threshold for selecting the alias class
    rng: SmallRng,
    n: usize,
}

impl AliasSampler {
    /// Build the alias table for `probs`, which must be non-negative and
    /// sum to 1 within 1e-4.
    pub fn new(probs: &[Real], seed: u64) -> Result<Self> {
        ensure!(
            probs.iter().all(|&p| p >= 0.0),
            "negative entry in sampling distribution"
        );
        let sum: f64 = probs.iter().map(|&p| p as f64).sum();
        ensure!(
            (0.9999..=1.0001).contains(&sum),
            "sampling distribution sums to {sum}, expected 1"
        );

        let n = probs.len();
        let mut alias = vec![0usize; n];
        let mut prob = vec![0.0; n];

        let mut scaled: Vec<Real> = probs.iter().map(|&p| p * n as Real).collect();
        let mut small: Vec<usize> = Vec::new();
        let mut large: Vec<usize> = Vec::new();
        for (i, &p) in scaled.iter().enumerate() {
            if p < 1.0 {
                small.push(i);
            } else {
                large.push(i);
            }
        }

        while let (Some(&l), Some(&g)) = (small.last(), large.last()) {
            small.pop();
            large.pop();
            prob[l] = scaled[l];
            alias[l] = g;
            scaled[g] = (scaled[g] + scaled[l]) - 1.0;
            if scaled[g] < 1.0 {
                small.push(g);
            } else {
                large.push(g);
            }
        }
        // Residual buckets always select themselves.
        for g in large {
            prob[g] = 1.0;
        }
        for l in small {
            prob[l] = 1.0;
        }

        Ok(AliasSampler {
            alias,
            prob,
            rng: SmallRng::seed_from_u64(seed),
            n,
        })
    }

    pub fn sample(&mut self) -> usize {
        let bucket = self.rng.random_range(0..self.n);
        let coin: Real = self.rng.random();
        if coin <= self.prob[bucket] {
            bucket
        } else {
            self.alias[bucket]
        }
    }

    pub fn num_classes(&self) -> usize {
        self.n
    }
}

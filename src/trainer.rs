//! Per-sentence SGD updates for the Skip-Gram and CBOW objectives with
//! negative sampling.
//!
//! The trainer itself is shared by every worker thread; the mutable
//! pieces (RNG, negative sampler, scratch vectors) live in a `Worker`
//! that each thread exclusively owns for the duration of a call.

use anyhow::Result;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::sample::AliasSampler;
use crate::sigmoid::{sigmoid, MIN_SIGMOID_IN_LOSS};
use crate::table::{dot, dot_mixed, Table};
use crate::{Real, Word, BASE_SEED};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrainMode {
    SkipGram,
    Cbow,
}

#[derive(Clone, Debug)]
pub struct TrainerParams {
    pub dim: usize,
    /// One-sided context extension, e.g. 4 means 4 additional words on
    /// each side: `[ . . . . x . . . . ]`.
    pub ctxs: usize,
    /// Negative targets per positive target.
    pub negatives: usize,
    /// Skip the 1/m normalization of the context-side CBOW gradient,
    /// reproducing the update most word2vec implementations ship.
    pub use_bad_update: bool,
}

/// Mutable per-thread training state. Seeded from the thread index so
/// fixed-thread-count runs are reproducible.
pub struct Worker {
    rng: StdRng,
    sampler: AliasSampler,
    avg: Vec<Real>,
    grad: Vec<Real>,
    kept: Vec<Word>,
    srcs: Vec<Word>,
}

pub struct Trainer<'a> {
    params: TrainerParams,
    /// Probability of skipping each word, downsampling frequent words.
    filter_probs: Vec<Real>,
    /// Negative-sampling distribution over the vocabulary.
    neg_probs: Vec<Real>,
    /// Center word embeddings.
    table: &'a Table,
    /// Context word embeddings.
    ctx: &'a Table,
}

impl<'a> Trainer<'a> {
    pub fn new(
        params: TrainerParams,
        table: &'a Table,
        ctx: &'a Table,
        filter_probs: Vec<Real>,
        neg_probs: Vec<Real>,
    ) -> Self {
        assert_eq!(table.dim(), params.dim);
        assert_eq!(ctx.dim(), params.dim);
        assert_eq!(filter_probs.len(), table.rows());
        Trainer {
            params,
            filter_probs,
            neg_probs,
            table,
            ctx,
        }
    }

    /// Create the state for worker `tid`, seeded `BASE_SEED + tid`.
    pub fn worker(&self, tid: usize) -> Result<Worker> {
        let seed = BASE_SEED + tid as u64;
        Ok(Worker {
            rng: StdRng::seed_from_u64(seed),
            sampler: AliasSampler::new(&self.neg_probs, seed)?,
            avg: vec![0.0; self.params.dim],
            grad: vec![0.0; self.params.dim],
            kept: Vec::new(),
            srcs: Vec::new(),
        })
    }

    /// Update embeddings for an entire sentence: downsample, then treat
    /// each surviving word as the center in turn with a freshly sampled
    /// context width. Returns the number of tokens left after
    /// downsampling.
    pub fn train(&self, worker: &mut Worker, sentence: &[Word], lr: Real, mode: TrainMode) -> usize {
        let mut kept = std::mem::take(&mut worker.kept);
        kept.clear();
        kept.reserve(sentence.len());
        for &w in sentence {
            // filter_probs[w] is the probability of dropping w
            if worker.rng.random::<Real>() >= self.filter_probs[w as usize] {
                kept.push(w);
            }
        }

        for center in 0..kept.len() {
            let radius = worker.rng.random_range(1..=self.params.ctxs);
            let left = center.saturating_sub(radius);
            let right = (center + radius + 1).min(kept.len());
            match mode {
                TrainMode::Cbow => {
                    self.cbow_update(worker, &kept, center, left, right, lr, false);
                }
                TrainMode::SkipGram => {
                    self.sg_update(worker, &kept, center, left, right, lr, false);
                }
            }
        }

        let retained = kept.len();
        worker.kept = kept;
        retained
    }

    /// Skip-Gram update for one center word and context window
    /// `[left, right)`. Returns the loss when `compute_loss` is set
    /// (used by gradient checks), otherwise 0.
    pub fn sg_update(
        &self,
        worker: &mut Worker,
        sent: &[Word],
        center: usize,
        left: usize,
        right: usize,
        lr: Real,
        compute_loss: bool,
    ) -> Real {
        let mut loss = 0.0;
        let center_word = self.table.row(sent[center]);
        let grad = &mut worker.grad;
        grad.fill(0.0);

        // Predict each context word given the center.
        for target in left..right {
            if target == center {
                continue;
            }
            let target_word = self.ctx.row(sent[target]);

            let sig_pos = sigmoid(dot(center_word, target_word));
            if compute_loss {
                loss -= sig_pos.max(MIN_SIGMOID_IN_LOSS).ln();
            }
            if sig_pos < 1.0 {
                let k = (sig_pos - 1.0) * lr;
                for (g, t) in grad.iter_mut().zip(target_word) {
                    *g -= t.get() * k;
                }
                for (t, c) in target_word.iter().zip(center_word) {
                    t.sub(c.get() * k);
                }
            }

            for _ in 0..self.params.negatives {
                let random_word = self.ctx.row(worker.sampler.sample() as Word);
                let sig_neg = sigmoid(dot(center_word, random_word));
                if compute_loss {
                    loss -= (1.0 - sig_neg).max(MIN_SIGMOID_IN_LOSS).ln();
                }
                if sig_neg > 0.0 {
                    let k = sig_neg * lr;
                    for (g, r) in grad.iter_mut().zip(random_word) {
                        *g -= r.get() * k;
                    }
                    for (r, c) in random_word.iter().zip(center_word) {
                        r.sub(c.get() * k);
                    }
                }
            }
        }

        // grad is already a descent direction, so the sign is +=.
        for (c, g) in center_word.iter().zip(grad.iter()) {
            c.add(*g);
        }
        loss
    }

    /// CBOW update for one center word and context window
    /// `[left, right)`.
    pub fn cbow_update(
        &self,
        worker: &mut Worker,
        sent: &[Word],
        center: usize,
        left: usize,
        right: usize,
        lr: Real,
        compute_loss: bool,
    ) -> Real {
        let mut loss = 0.0;
        let center_word = self.ctx.row(sent[center]);

        let avg = &mut worker.avg;
        let grad = &mut worker.grad; // shared by every context word
        avg.fill(0.0);
        grad.fill(0.0);

        let srcs = &mut worker.srcs;
        srcs.clear();
        for source in left..right {
            if source == center {
                continue;
            }
            let v = self.table.row(sent[source]);
            for (a, x) in avg.iter_mut().zip(v) {
                *a += x.get();
            }
            srcs.push(sent[source]);
        }

        let num_sources = srcs.len() as Real;
        if srcs.is_empty() {
            return loss;
        }
        for a in avg.iter_mut() {
            *a /= num_sources;
        }

        let sig_pos = sigmoid(dot_mixed(avg, center_word));
        if compute_loss {
            loss -= sig_pos.max(MIN_SIGMOID_IN_LOSS).ln();
        }
        if sig_pos < 1.0 {
            let k = (sig_pos - 1.0) * lr;
            // The 1/m normalization is the correct gradient for the
            // averaged context; use_bad_update drops it.
            let scale = if self.params.use_bad_update {
                k
            } else {
                k / num_sources
            };
            for (g, c) in grad.iter_mut().zip(center_word) {
                *g += c.get() * scale;
            }
            for (c, a) in center_word.iter().zip(avg.iter()) {
                c.sub(a * k);
            }
        }

        for _ in 0..self.params.negatives {
            let random_idx = worker.sampler.sample();
            if random_idx == center {
                continue;
            }
            let random_word = self.ctx.row(random_idx as Word);
            let sig_neg = sigmoid(dot_mixed(avg, random_word));
            if compute_loss {
                loss -= (1.0 - sig_neg).max(MIN_SIGMOID_IN_LOSS).ln();
            }
            if sig_neg > 0.0 {
                let k = sig_neg * lr;
                let scale = if self.params.use_bad_update {
                    k
                } else {
                    k / num_sources
                };
                for (g, r) in grad.iter_mut().zip(random_word) {
                    *g += r.get() * scale;
                }
                for (r, a) in random_word.iter().zip(avg.iter()) {
                    r.sub(a * k);
                }
            }
        }

        for &s in srcs.iter() {
            for (v, g) in self.table.row(s).iter().zip(grad.iter()) {
                v.sub(*g);
            }
        }
        loss
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(ctxs: usize, negatives: usize) -> TrainerParams {
        TrainerParams {
            dim: 2,
            ctxs,
            negatives,
            use_bad_update: false,
        }
    }

    fn uniform_neg(n: usize) -> Vec<Real> {
        vec![1.0 / n as Real; n]
    }

    #[test]
    fn zero_skip_probs_retain_everything() {
        let table = Table::new(1, 2);
        let ctx = Table::new(1, 2);
        let trainer = Trainer::new(params(1, 1), &table, &ctx, vec![0.0], vec![1.0]);
        let mut worker = trainer.worker(0).unwrap();
        let sentence = vec![0; 500];
        let kept = trainer.train(&mut worker, &sentence, 0.025, TrainMode::SkipGram);
        assert_eq!(kept, 500);
    }

    #[test]
    fn certain_skip_probs_retain_nothing() {
        let table = Table::new(1, 2);
        let ctx = Table::new(1, 2);
        let trainer = Trainer::new(params(1, 1), &table, &ctx, vec![1.0], vec![1.0]);
        let mut worker = trainer.worker(0).unwrap();
        let sentence = vec![0; 500];
        let kept = trainer.train(&mut worker, &sentence, 0.025, TrainMode::SkipGram);
        assert_eq!(kept, 0);
    }

    #[test]
    fn retention_tracks_binomial_expectation() {
        let table = Table::new(1, 2);
        let ctx = Table::new(1, 2);
        let trainer = Trainer::new(params(1, 1), &table, &ctx, vec![0.5], vec![1.0]);
        let mut worker = trainer.worker(0).unwrap();
        let sentence = vec![0; 10_000];
        let kept = trainer.train(&mut worker, &sentence, 0.025, TrainMode::SkipGram);
        // n*p = 5000, sigma = 50; allow a wide band around the mean.
        assert!((4800..=5200).contains(&kept), "retained {kept} of 10000");
    }

    #[test]
    fn empty_sentence_is_a_no_op() {
        let table = Table::new(2, 2);
        let ctx = Table::new(2, 2);
        let trainer = Trainer::new(params(2, 2), &table, &ctx, vec![0.0; 2], uniform_neg(2));
        let mut worker = trainer.worker(0).unwrap();
        let before = table.snapshot();
        assert_eq!(trainer.train(&mut worker, &[], 0.025, TrainMode::Cbow), 0);
        assert_eq!(table.snapshot(), before);
    }

    #[test]
    fn sg_update_moves_center_and_targets() {
        let table = Table::new(4, 2);
        let ctx = Table::new(4, 2);
        table.set_row(0, &[0.1, -0.2]);
        table.set_row(1, &[0.3, 0.1]);
        ctx.set_row(0, &[0.2, 0.2]);
        ctx.set_row(1, &[-0.1, 0.4]);
        let trainer = Trainer::new(params(5, 0), &table, &ctx, vec![0.0; 4], uniform_neg(4));
        let mut worker = trainer.worker(0).unwrap();

        let before_in = table.snapshot();
        let before_ctx = ctx.snapshot();
        trainer.sg_update(&mut worker, &[0, 1], 1, 0, 2, 0.5, false);
        // Center row of IN and the target's row of OUT both moved.
        assert_ne!(table.row(1)[0].get(), before_in[2]);
        assert_ne!(ctx.row(0)[0].get(), before_ctx[0]);
        // Untouched rows stay put.
        assert_eq!(table.row(3)[0].get(), before_in[6]);
    }

    #[test]
    fn bad_update_mode_changes_context_gradient() {
        let good = params(5, 0);
        let mut bad = good.clone();
        bad.use_bad_update = true;

        let init_in = [0.1, -0.2, 0.3, 0.1, -0.3, 0.2];
        let init_ctx = [0.2, 0.2, -0.1, 0.4, 0.1, -0.1];
        let sent = [0, 1, 2];

        let mut results = Vec::new();
        for p in [good, bad] {
            let table = Table::new(3, 2);
            let ctx = Table::new(3, 2);
            table.load_snapshot(&init_in);
            ctx.load_snapshot(&init_ctx);
            let trainer = Trainer::new(p, &table, &ctx, vec![0.0; 3], uniform_neg(3));
            let mut worker = trainer.worker(0).unwrap();
            trainer.cbow_update(&mut worker, &sent, 1, 0, 3, 1.0, false);
            results.push((table.snapshot(), ctx.snapshot()));
        }
        // Context-side updates differ by the 1/m factor; the center-side
        // update is identical.
        assert_ne!(results[0].0, results[1].0);
        assert_eq!(results[0].1, results[1].1);
    }
}

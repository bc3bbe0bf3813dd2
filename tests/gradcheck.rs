//! Numeric gradient checks for both update rules.
//!
//! Run with `cargo test --features gradcheck`. The feature switches the
//! arithmetic to f64 and the sigmoid to its exact form; with the lookup
//! table the two-sided derivative would be dominated by quantization.
#![cfg(feature = "gradcheck")]

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use wordvane::table::Table;
use wordvane::trainer::{Trainer, TrainerParams};
use wordvane::{Real, Word};

const EPS: Real = 1e-4;
const DIM: usize = 5;

/// Entries uniform in [-1, 1], like a freshly initialized test fixture.
fn random_table(rows: usize, rng: &mut StdRng) -> Table {
    let table = Table::new(rows, DIM);
    for row in 0..rows {
        for cell in table.row(row as Word) {
            cell.set(rng.random::<Real>() * 2.0 - 1.0);
        }
    }
    table
}

fn relative_close(a: Real, b: Real) -> bool {
    (a - b).abs() <= 1e-5 * a.abs().max(b.abs()).max(1.0)
}

/// Compare the parameter delta of one update (at lr = 1 the delta *is*
/// the analytic gradient) against two-sided numeric derivatives of the
/// reported loss, at every entry of both matrices.
fn check_update(
    sent: &[Word],
    center: usize,
    left: usize,
    right: usize,
    cbow: bool,
    use_bad_update: bool,
) {
    let mut rng = StdRng::seed_from_u64(7 + cbow as u64);
    let table = random_table(4, &mut rng);
    let ctx = random_table(4, &mut rng);

    let params = TrainerParams {
        dim: DIM,
        ctxs: 5,
        negatives: 1,
        use_bad_update,
    };
    // No downsampling; the degenerate distribution forces every negative
    // draw to token 3, which is in neither sentence.
    let trainer = Trainer::new(params, &table, &ctx, vec![0.0; 4], vec![0.0, 0.0, 0.0, 1.0]);
    let mut worker = trainer.worker(0).unwrap();

    let update = |worker: &mut _| {
        if cbow {
            trainer.cbow_update(worker, sent, center, left, right, 1.0, true)
        } else {
            trainer.sg_update(worker, sent, center, left, right, 1.0, true)
        }
    };

    let orig_in = table.snapshot();
    let orig_ctx = ctx.snapshot();

    update(&mut worker);
    let analytic_in: Vec<Real> = orig_in
        .iter()
        .zip(table.snapshot())
        .map(|(o, n)| o - n)
        .collect();
    let analytic_ctx: Vec<Real> = orig_ctx
        .iter()
        .zip(ctx.snapshot())
        .map(|(o, n)| o - n)
        .collect();
    table.load_snapshot(&orig_in);
    ctx.load_snapshot(&orig_ctx);

    for (which, analytic) in [(&table, &analytic_in), (&ctx, &analytic_ctx)] {
        for idx in 0..orig_in.len() {
            let loss_at = |delta: Real, worker: &mut _| {
                let cell = &which.row((idx / DIM) as Word)[idx % DIM];
                cell.set(cell.get() + delta);
                let loss = update(worker);
                table.load_snapshot(&orig_in);
                ctx.load_snapshot(&orig_ctx);
                loss
            };
            let up = loss_at(EPS, &mut worker);
            let down = loss_at(-EPS, &mut worker);
            let numeric = (up - down) / (2.0 * EPS);
            assert!(
                relative_close(analytic[idx], numeric),
                "entry {idx}: analytic {} vs numeric {numeric}",
                analytic[idx]
            );
        }
    }
}

#[test]
fn skipgram_gradient_matches() {
    // "hello world", predicting each side of the pair.
    check_update(&[0, 1], 1, 0, 2, false, false);
}

#[test]
fn cbow_gradient_matches() {
    // "hello world !", center in the middle.
    check_update(&[0, 1, 2], 1, 0, 3, true, false);
}

#[test]
fn cbow_gradient_matches_without_normalization() {
    // The unnormalized update is still the exact gradient of the loss it
    // optimizes when there is a single context word.
    check_update(&[0, 1], 1, 0, 2, true, true);
}

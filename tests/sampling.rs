//! Empirical fidelity of the alias sampler: over many draws the observed
//! class frequencies must sit within 1% relative of the target
//! distribution.

use wordvane::sample::AliasSampler;
use wordvane::Real;

const DRAWS: usize = 10_000_000;

fn empirical(probs: &[Real]) -> Vec<f64> {
    let mut sampler = AliasSampler::new(probs, 1).unwrap();
    let mut counts = vec![0u64; sampler.num_classes()];
    for _ in 0..DRAWS {
        counts[sampler.sample()] += 1;
    }
    counts
        .into_iter()
        .map(|c| c as f64 / DRAWS as f64)
        .collect()
}

fn assert_faithful(probs: &[Real]) {
    let observed = empirical(probs);
    for (i, (&expected, &observed)) in probs.iter().zip(&observed).enumerate() {
        let expected = expected as f64;
        assert!(
            (expected - observed).abs() < expected * 0.01,
            "class {i}: expected {expected}, observed {observed}"
        );
    }
}

#[test]
fn balanced_binary() {
    assert_faithful(&[0.5, 0.5]);
}

#[test]
fn balanced_ten_class() {
    assert_faithful(&vec![0.1; 10]);
}

#[test]
fn balanced_fifty_class() {
    assert_faithful(&vec![0.02; 50]);
}

#[test]
fn skewed_binary() {
    assert_faithful(&[0.1, 0.9]);
}

#[test]
fn skewed_ten_class() {
    assert_faithful(&[0.02, 0.02, 0.02, 0.02, 0.02, 0.1, 0.2, 0.2, 0.2, 0.2]);
}

//! Logistic nonlinearity for the inner training loop.
//!
//! Training evaluates the sigmoid `O((1 + negatives) * ctxs)` times per
//! center word, so the default build answers queries from a precomputed
//! table. The `gradcheck` build evaluates the exact `tanh` form instead,
//! which numeric gradient checks require.

use crate::Real;

/// First nonzero entry of the lookup table; floors `log` arguments when
/// computing losses so a saturated sigmoid never produces `log(0)`.
pub const MIN_SIGMOID_IN_LOSS: Real = 0.000340641;

#[cfg(not(feature = "gradcheck"))]
mod imp {
    use super::Real;
    use std::sync::LazyLock;

    const FACTOR: Real = 64.0;
    const WINDOW: Real = 8.0;
    const TABLE_SIZE: usize = (2 * 64 * 8 + 1) as usize;

    // Based on sigmoid(x) == tanh(x/2)/2 + 1/2. tanh handles the extremes
    // out of the box (tanh(-inf) = -1, tanh(inf) = 1), and the endpoints
    // are clamped to exactly 0 and 1.
    static TABLE: LazyLock<[Real; TABLE_SIZE]> = LazyLock::new(|| {
        let mut table = [0.0; TABLE_SIZE];
        for (i, entry) in table.iter_mut().enumerate() {
            let x = (i as Real - FACTOR * WINDOW) / FACTOR;
            *entry = (x * 0.5).tanh().mul_add(0.5, 0.5);
        }
        table[0] = 0.0;
        table[TABLE_SIZE - 1] = 1.0;
        table
    });

    pub fn sigmoid(x: Real) -> Real {
        let i = x.clamp(-WINDOW, WINDOW).mul_add(FACTOR, FACTOR * WINDOW);
        TABLE[i.round() as usize]
    }
}

#[cfg(feature = "gradcheck")]
mod imp {
    use super::Real;

    pub fn sigmoid(x: Real) -> Real {
        (x * 0.5).tanh().mul_add(0.5, 0.5)
    }
}

pub use imp::sigmoid;

#[cfg(test)]
mod tests {
    use super::*;

    fn logistic(x: Real) -> Real {
        1.0 / (1.0 + (-x).exp())
    }

    #[test]
    fn fixed_points() {
        assert_eq!(sigmoid(0.0), 0.5);
        assert_eq!(sigmoid(Real::NEG_INFINITY), 0.0);
        assert_eq!(sigmoid(Real::INFINITY), 1.0);
        assert_eq!(sigmoid(-1000.0), 0.0);
        assert_eq!(sigmoid(1000.0), 1.0);
    }

    #[test]
    fn monotonic() {
        let mut prev = -1.0;
        let mut x = -16.0;
        while x <= 16.0 {
            let y = sigmoid(x);
            assert!(y >= prev, "sigmoid({x}) = {y} dropped below {prev}");
            prev = y;
            x += 1.0 / 128.0;
        }
    }

    #[test]
    fn close_to_logistic() {
        let mut x = -8.0;
        while x <= 8.0 {
            let err = (sigmoid(x) - logistic(x)).abs();
            assert!(err <= 1e-2, "sigmoid({x}) off by {err}");
            x += 1.0 / 128.0;
        }
    }

    #[test]
    fn bounded() {
        let mut x = -32.0;
        while x <= 32.0 {
            let y = sigmoid(x);
            assert!((0.0..=1.0).contains(&y));
            x += 0.37;
        }
    }
}

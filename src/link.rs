//! Logistic link helpers and grouped reductions.
//!
//! Everything here is scalar or slice-at-a-time and allocation-light; the
//! kernel and the prediction paths call these in tight loops.

use ndarray::{Array1, ArrayView1};

/// Logistic function `1 / (1 + e^{-x})`, evaluated without overflow.
#[inline]
pub fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

/// `log(sigmoid(x))`, finite for every finite `x`.
#[inline]
pub fn log_sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        -(-x).exp().ln_1p()
    } else {
        x - x.exp().ln_1p()
    }
}

/// `log(e^a + e^b)`.
///
/// Either argument may be `-inf`; the result is then exactly the other
/// argument, so a masked branch never leaks NaN into values or gradients.
#[inline]
pub fn log_add_exp(a: f64, b: f64) -> f64 {
    if a == f64::NEG_INFINITY {
        return b;
    }
    if b == f64::NEG_INFINITY {
        return a;
    }
    let hi = a.max(b);
    hi + (-(a - b).abs()).exp().ln_1p()
}

/// Sum `values` into `n_groups` buckets keyed by `ids`.
pub fn segment_sum(values: ArrayView1<f64>, ids: &[usize], n_groups: usize) -> Array1<f64> {
    debug_assert_eq!(values.len(), ids.len());
    let mut out = Array1::zeros(n_groups);
    for (v, &g) in values.iter().zip(ids) {
        out[g] += v;
    }
    out
}

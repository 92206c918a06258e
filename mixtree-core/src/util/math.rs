//! Mathematical utility functions.

use std::f64::consts::PI;

/// Weighted mean.
pub fn weighted_mean(values: &[f64], weights: &[f64]) -> f64 {
    let (sum_wv, sum_w) = values
        .iter()
        .zip(weights.iter())
        .fold((0.0, 0.0), |(sv, sw), (&v, &w)| (sv + w * v, sw + w));
    if sum_w > 0.0 {
        sum_wv / sum_w
    } else {
        0.0
    }
}

/// Kolmogorov distribution: P(sup_t |B(t)| <= x) for a Brownian bridge B.
///
/// Uses the theta-function series for small x, where the alternating
/// series converges slowly.
pub fn kolmogorov_cdf(x: f64) -> f64 {
    if x <= 0.0 {
        return 0.0;
    }
    if x < 1.0 {
        let c = -PI * PI / (8.0 * x * x);
        let mut sum = 0.0;
        for k in 1..=50 {
            let m = (2 * k - 1) as f64;
            let term = (c * m * m).exp();
            sum += term;
            if term < 1e-18 {
                break;
            }
        }
        ((2.0 * PI).sqrt() / x * sum).clamp(0.0, 1.0)
    } else {
        let mut sum = 0.0;
        for k in 1..=100 {
            let kf = k as f64;
            let term = (-2.0 * kf * kf * x * x).exp();
            sum += if k % 2 == 1 { term } else { -term };
            if term < 1e-18 {
                break;
            }
        }
        (1.0 - 2.0 * sum).clamp(0.0, 1.0)
    }
}

/// Family-wise adjustment of one p-value over `m` tests: 1 - (1 - p)^m.
pub fn multiplicity_adjust(p: f64, m: usize) -> f64 {
    if m <= 1 {
        return p;
    }
    // -expm1(m * ln(1-p)) keeps precision for tiny p.
    (-((m as f64) * (-p).ln_1p()).exp_m1()).clamp(0.0, 1.0)
}

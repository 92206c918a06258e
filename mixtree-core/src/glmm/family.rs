//! GLMM family distributions.
//!
//! Defines the family (distribution + link) for the mixed model, providing
//! working responses and weights for penalised quasi-likelihood and the
//! conditional log-likelihood of the response.

use serde::{Deserialize, Serialize};
use statrs::function::gamma::ln_gamma;

use super::link::{Link, IDENTITY, LOG, LOGIT};

/// Response distribution selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FamilyKind {
    /// Normal errors, identity link, estimated residual variance.
    #[default]
    Gaussian,
    /// Bernoulli / proportion response, logit link, dispersion fixed at 1.
    Binomial,
    /// Counts, log link, dispersion fixed at 1.
    Poisson,
}

/// A GLMM family: distribution tag, link and variance function.
#[derive(Debug, Clone, Copy)]
pub struct Family {
    pub kind: FamilyKind,
    pub link: Link,
    /// Variance function V(mu).
    pub variance: fn(f64) -> f64,
}

fn constant_variance(_mu: f64) -> f64 {
    1.0
}

fn binomial_variance(mu: f64) -> f64 {
    mu * (1.0 - mu)
}

fn poisson_variance(mu: f64) -> f64 {
    mu
}

impl PartialEq for Family {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
    }
}

impl Family {
    pub fn new(kind: FamilyKind) -> Self {
        match kind {
            FamilyKind::Gaussian => Self {
                kind,
                link: IDENTITY,
                variance: constant_variance,
            },
            FamilyKind::Binomial => Self {
                kind,
                link: LOGIT,
                variance: binomial_variance,
            },
            FamilyKind::Poisson => Self {
                kind,
                link: LOG,
                variance: poisson_variance,
            },
        }
    }

    /// Whether the dispersion is fixed at 1 rather than estimated.
    pub fn fixed_dispersion(&self) -> bool {
        !matches!(self.kind, FamilyKind::Gaussian)
    }

    /// Check that every response value lies in the family's support.
    pub fn validate_response(&self, y: &[f64]) -> Result<(), String> {
        let bad = match self.kind {
            FamilyKind::Gaussian => y.iter().position(|v| !v.is_finite()),
            FamilyKind::Binomial => y.iter().position(|&v| !(0.0..=1.0).contains(&v)),
            FamilyKind::Poisson => y.iter().position(|&v| !(v >= 0.0 && v.fract() == 0.0)),
        };
        match bad {
            Some(i) => Err(format!(
                "response value {} at position {} is outside the {:?} support",
                y[i], i, self.kind
            )),
            None => Ok(()),
        }
    }

    /// Initialize mu from y.
    pub fn initialize_mu(&self, y: &[f64]) -> Vec<f64> {
        match self.kind {
            // mu_init = (y + 0.5) / 2
            FamilyKind::Binomial => y.iter().map(|&yi| (yi + 0.5) / 2.0).collect(),
            FamilyKind::Poisson => y.iter().map(|&yi| yi + 0.1).collect(),
            FamilyKind::Gaussian => y.to_vec(),
        }
    }

    /// Compute linear predictor eta = g(mu).
    pub fn link(&self, mu: &[f64]) -> Vec<f64> {
        mu.iter().map(|&m| (self.link.link)(m)).collect()
    }

    /// Update mu from eta, clamping to the valid range.
    pub fn update_mu(&self, eta: &[f64]) -> Vec<f64> {
        eta.iter()
            .map(|&e| {
                let m = (self.link.inverse)(e);
                match self.kind {
                    FamilyKind::Binomial => m.clamp(1e-10, 1.0 - 1e-10),
                    FamilyKind::Poisson => m.max(1e-10),
                    FamilyKind::Gaussian => m,
                }
            })
            .collect()
    }

    /// Working response z and working weights w at the current eta.
    ///
    /// z = eta + (y - mu) / mu'(eta), w = mu'(eta)^2 / V(mu). `eta` here
    /// includes any offset; the caller subtracts it from z.
    pub fn working(&self, y: &[f64], eta: &[f64], mu: &[f64]) -> (Vec<f64>, Vec<f64>) {
        let mut z = Vec::with_capacity(y.len());
        let mut w = Vec::with_capacity(y.len());
        for ((&yi, &ei), &mi) in y.iter().zip(eta.iter()).zip(mu.iter()) {
            let d = (self.link.mu_eta)(ei);
            let v = (self.variance)(mi).max(1e-30);
            z.push(ei + (yi - mi) / d);
            w.push((d * d / v).max(1e-30));
        }
        (z, w)
    }

    /// Conditional log-likelihood of y given mu.
    pub fn log_likelihood(&self, y: &[f64], mu: &[f64], dispersion: f64) -> f64 {
        match self.kind {
            FamilyKind::Gaussian => {
                let n = y.len() as f64;
                let ss: f64 = y.iter().zip(mu.iter()).map(|(yi, mi)| (yi - mi).powi(2)).sum();
                -0.5 * n * (2.0 * std::f64::consts::PI * dispersion).ln() - 0.5 * ss / dispersion
            }
            FamilyKind::Binomial => y
                .iter()
                .zip(mu.iter())
                .map(|(&yi, &mi)| {
                    let mi = mi.clamp(1e-15, 1.0 - 1e-15);
                    yi * mi.ln() + (1.0 - yi) * (1.0 - mi).ln()
                })
                .sum(),
            FamilyKind::Poisson => y
                .iter()
                .zip(mu.iter())
                .map(|(&yi, &mi)| yi * mi.max(1e-300).ln() - mi - ln_gamma(yi + 1.0))
                .sum(),
        }
    }
}

impl From<FamilyKind> for Family {
    fn from(kind: FamilyKind) -> Self {
        Family::new(kind)
    }
}

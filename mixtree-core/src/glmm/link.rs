//! Link functions for GLMMs.
//!
//! Maps between the linear predictor (eta) and the mean (mu). A link is a
//! plain bundle of function values, chosen once when the family is built.

/// Which link a [`Link`] bundles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    Identity,
    Logit,
    Log,
}

/// Link function: eta = g(mu), mu = g^{-1}(eta), and d(mu)/d(eta).
#[derive(Debug, Clone, Copy)]
pub struct Link {
    pub kind: LinkKind,
    /// eta = g(mu).
    pub link: fn(f64) -> f64,
    /// mu = g^{-1}(eta).
    pub inverse: fn(f64) -> f64,
    /// Derivative of the inverse link at eta.
    pub mu_eta: fn(f64) -> f64,
}

fn identity(x: f64) -> f64 {
    x
}

fn one(_eta: f64) -> f64 {
    1.0
}

fn logit(mu: f64) -> f64 {
    (mu / (1.0 - mu)).ln()
}

fn inv_logit(eta: f64) -> f64 {
    1.0 / (1.0 + (-eta).exp())
}

fn logit_mu_eta(eta: f64) -> f64 {
    let p = inv_logit(eta);
    (p * (1.0 - p)).max(f64::EPSILON)
}

fn log(mu: f64) -> f64 {
    mu.ln()
}

fn exp(eta: f64) -> f64 {
    eta.exp().max(f64::EPSILON)
}

/// Identity link for continuous responses.
pub const IDENTITY: Link = Link {
    kind: LinkKind::Identity,
    link: identity,
    inverse: identity,
    mu_eta: one,
};

/// Logit link for binary responses.
pub const LOGIT: Link = Link {
    kind: LinkKind::Logit,
    link: logit,
    inverse: inv_logit,
    mu_eta: logit_mu_eta,
};

/// Log link for counts.
pub const LOG: Link = Link {
    kind: LinkKind::Log,
    link: log,
    inverse: exp,
    mu_eta: exp,
};

impl PartialEq for Link {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
    }
}

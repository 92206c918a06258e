//! Mixed-model fitting for one design: Gaussian LMM or PQL GLMM.
//!
//! Gaussian responses go straight to the profiled REML/ML optimiser in
//! [`super::lmm`]. Binomial and Poisson responses use penalised
//! quasi-likelihood: working response and weights are formed from the
//! current linear predictor, a weighted LMM is fit with the dispersion held
//! at 1, and the linear predictor is updated until the Laplace
//! log-likelihood stabilises.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use mixtree_linalg::DenseMatrix;

use super::family::{Family, FamilyKind};
use super::lmm::{lambda, optimize_theta, theta_init, Criterion, ThetaFit, ThetaOptions, WeightedSystem};
use crate::data::frame::NodeDesign;
use crate::error::FitError;

/// Configuration for a single mixed-model fit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitConfig {
    /// REML (default) or ML for the variance parameters.
    pub criterion: Criterion,
    /// Maximum PQL iterations.
    pub max_iter: usize,
    /// Relative tolerance on the change in log-likelihood between PQL iterations.
    pub tol: f64,
    /// Maximum Nelder-Mead iterations per variance parameter.
    pub optimizer_max_iter: usize,
    /// Simplex standard-deviation tolerance, relative to the deviance.
    pub optimizer_tol: f64,
    /// Allowed deviance increase when snapping a variance component to zero.
    pub boundary_tol: f64,
    /// Relative pivot tolerance for rank detection in X'V^{-1}X.
    pub rank_tol: f64,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            criterion: Criterion::Reml,
            max_iter: 50,
            tol: 1e-8,
            optimizer_max_iter: 500,
            optimizer_tol: 1e-8,
            boundary_tol: 1e-6,
            rank_tol: 1e-10,
        }
    }
}

/// Predicted random effects of one cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterEffect {
    pub cluster: String,
    pub effects: Vec<f64>,
}

/// A fitted (G)LMM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FittedModel {
    pub family: FamilyKind,
    pub criterion: Criterion,
    /// Fixed-effect names, in column order of X.
    pub coef_names: Vec<String>,
    pub coefficients: Vec<f64>,
    pub std_errors: Vec<f64>,
    /// Random-effect term names, in column order of Z.
    pub re_names: Vec<String>,
    /// Random-effect covariance D = phi * L L' (row-major q x q).
    pub re_covariance: Vec<Vec<f64>>,
    /// Relative Cholesky parameters (column-major lower triangle of L).
    pub theta: Vec<f64>,
    /// Residual variance (Gaussian) or dispersion (1 for binomial/Poisson).
    pub dispersion: f64,
    pub random_effects: Vec<ClusterEffect>,
    /// Restricted (REML) or ordinary log-likelihood for Gaussian fits;
    /// Laplace-approximated log-likelihood for PQL fits.
    pub log_likelihood: f64,
    pub deviance: f64,
    pub converged: bool,
    pub iterations: usize,
    /// At least one variance component estimated at exactly zero.
    pub singular: bool,
    pub n_obs: usize,
    /// Working response minus the fixed offset.
    pub working_response: Vec<f64>,
    pub working_weights: Vec<f64>,
    /// Z b for every row.
    pub random_offset: Vec<f64>,
    /// Working response minus X beta minus Z b.
    pub working_residuals: Vec<f64>,
    /// Conditional mean (response scale), offset and random effects included.
    pub fitted: Vec<f64>,
}

impl FittedModel {
    pub fn n_clusters(&self) -> usize {
        self.random_effects.len()
    }

    /// Coefficient by name.
    pub fn coefficient(&self, name: &str) -> Option<f64> {
        self.coef_names
            .iter()
            .position(|n| n == name)
            .map(|j| self.coefficients[j])
    }

    /// Diagonal of the random-effect covariance.
    pub fn re_variances(&self) -> Vec<f64> {
        (0..self.re_covariance.len())
            .map(|d| self.re_covariance[d][d])
            .collect()
    }

    /// Per-row score contributions for the fixed effects:
    /// psi_ij = x_ij * w_i * e_i / phi.
    ///
    /// `x` is the fixed-effect matrix the model was fit on. Summed within a
    /// cluster these give the cluster's GLS score; summed over all rows they
    /// vanish at the estimate.
    pub fn scores(&self, x: &DenseMatrix) -> DenseMatrix {
        assert_eq!(x.nrows(), self.n_obs);
        let phi = self.dispersion.max(f64::MIN_POSITIVE);
        DenseMatrix::from_fn(x.nrows(), x.ncols(), |i, j| {
            x.get(i, j) * self.working_weights[i] * self.working_residuals[i] / phi
        })
    }
}

fn validate(design: &NodeDesign, family: &Family) -> Result<(), FitError> {
    let n = design.n_obs();
    let p = design.x.ncols();
    if n == 0 {
        return Err(FitError::InvalidInput("design has no rows".into()));
    }
    if n <= p {
        return Err(FitError::InvalidInput(format!(
            "{} rows cannot identify {} fixed effects",
            n, p
        )));
    }
    if design.z.ncols() > 0 && design.groups.len() != n {
        return Err(FitError::InvalidInput(
            "random effects requested without a cluster index for every row".into(),
        ));
    }
    family
        .validate_response(&design.y)
        .map_err(FitError::InvalidInput)
}

/// Fit a mixed model to `design`.
///
/// `warm_start` supplies starting variance parameters (e.g. from the parent
/// node); it is ignored when its dimension does not match.
pub fn fit_mixed_model(
    design: &NodeDesign,
    family: &Family,
    config: &FitConfig,
    warm_start: Option<&[f64]>,
) -> Result<FittedModel, FitError> {
    validate(design, family)?;

    let q = design.z.ncols();
    let start = match warm_start {
        Some(t) if t.len() == super::lmm::n_theta(q) => t.to_vec(),
        _ => theta_init(q),
    };
    let opts = ThetaOptions {
        criterion: config.criterion,
        dispersion: if family.fixed_dispersion() { Some(1.0) } else { None },
        max_iter: config.optimizer_max_iter,
        sd_tol: config.optimizer_tol,
        boundary_tol: config.boundary_tol,
        rank_tol: config.rank_tol,
    };

    if family.fixed_dispersion() {
        fit_pql(design, family, config, &opts, start)
    } else {
        fit_gaussian(design, family, &opts, &start)
    }
}

fn fit_gaussian(
    design: &NodeDesign,
    family: &Family,
    opts: &ThetaOptions,
    start: &[f64],
) -> Result<FittedModel, FitError> {
    let n = design.n_obs();
    let target: Vec<f64> = design
        .y
        .iter()
        .zip(design.offset.iter())
        .map(|(y, o)| y - o)
        .collect();
    let weights = vec![1.0; n];
    let system = WeightedSystem::new(
        &design.x,
        &design.z,
        &design.groups,
        design.group_labels.len(),
        &target,
        &weights,
    );
    let fit = optimize_theta(&system, start, opts, &design.coef_names)?;
    let log_likelihood = -0.5 * fit.evaluation.deviance;
    let iterations = fit.iterations;
    let converged = fit.converged;

    let model = assemble(design, family, opts, &system, fit, target, weights, log_likelihood, iterations, converged);
    debug!(
        "LMM fit: n={}, p={}, q={}, sigma2={:.4e}, logLik={:.4}",
        n,
        design.x.ncols(),
        design.z.ncols(),
        model.dispersion,
        model.log_likelihood
    );
    if !converged {
        warn!("LMM variance optimisation hit the iteration cap after {} iterations", iterations);
        return Err(FitError::ConvergenceFailure {
            iterations,
            last: Box::new(model),
        });
    }
    Ok(model)
}

fn fit_pql(
    design: &NodeDesign,
    family: &Family,
    config: &FitConfig,
    opts: &ThetaOptions,
    mut start: Vec<f64>,
) -> Result<FittedModel, FitError> {
    let n = design.n_obs();
    let y = &design.y;

    let mut mu = family.initialize_mu(y);
    let mut eta = family.link(&mu);
    let mut prev_ll: Option<f64> = None;
    let mut last: Option<(WeightedSystem, ThetaFit, Vec<f64>, Vec<f64>, f64)> = None;
    let mut converged = false;
    let mut iterations = 0;

    for iter in 0..config.max_iter {
        iterations = iter + 1;
        let (z, w) = family.working(y, &eta, &mu);
        let target: Vec<f64> = z.iter().zip(design.offset.iter()).map(|(zi, o)| zi - o).collect();
        let system = WeightedSystem::new(
            &design.x,
            &design.z,
            &design.groups,
            design.group_labels.len(),
            &target,
            &w,
        );
        let fit = optimize_theta(&system, &start, opts, &design.coef_names)?;
        let (u, b) = system.random_effects(&fit.evaluation, &fit.theta);

        eta = linear_predictor(design, &fit.evaluation.beta, &b);
        mu = family.update_mu(&eta);

        let penalty: f64 = u.iter().map(|ug| DenseMatrix::dot(ug, ug)).sum();
        let ll = family.log_likelihood(y, &mu, 1.0) - 0.5 * penalty - 0.5 * fit.evaluation.log_det_m;

        debug!("PQL iteration {}: logLik={:.6}, theta={:?}", iterations, ll, fit.theta);

        start = fit.theta.clone();
        let inner_ok = fit.converged;
        last = Some((system, fit, target, w, ll));

        if let Some(prev) = prev_ll {
            if inner_ok && (ll - prev).abs() <= config.tol * (ll.abs() + 1.0) {
                converged = true;
                break;
            }
        }
        prev_ll = Some(ll);
    }

    let (system, fit, target, weights, ll) = match last {
        Some(l) => l,
        None => return Err(FitError::InvalidInput("PQL iteration cap must be positive".into())),
    };
    let model = assemble(design, family, opts, &system, fit, target, weights, ll, iterations, converged);
    debug!(
        "PQL fit: n={}, family={:?}, iterations={}, logLik={:.4}",
        n, family.kind, iterations, model.log_likelihood
    );
    if !converged {
        warn!("PQL did not converge after {} iterations", iterations);
        return Err(FitError::ConvergenceFailure {
            iterations,
            last: Box::new(model),
        });
    }
    Ok(model)
}

/// offset + X beta + Z b for every row.
fn linear_predictor(design: &NodeDesign, beta: &[f64], b: &[Vec<f64>]) -> Vec<f64> {
    let xb = design.x.mat_vec(beta);
    (0..design.n_obs())
        .map(|i| design.offset[i] + xb[i] + random_part(design, b, i))
        .collect()
}

fn random_part(design: &NodeDesign, b: &[Vec<f64>], i: usize) -> f64 {
    let q = design.z.ncols();
    if q == 0 {
        return 0.0;
    }
    let bg = &b[design.groups[i]];
    (0..q).map(|k| design.z.get(i, k) * bg[k]).sum()
}

#[allow(clippy::too_many_arguments)]
fn assemble(
    design: &NodeDesign,
    family: &Family,
    opts: &ThetaOptions,
    system: &WeightedSystem,
    fit: ThetaFit,
    working_response: Vec<f64>,
    working_weights: Vec<f64>,
    log_likelihood: f64,
    iterations: usize,
    converged: bool,
) -> FittedModel {
    let n = design.n_obs();
    let q = design.z.ncols();
    let eval = &fit.evaluation;
    let phi = eval.sigma2;

    let cov_beta = eval.xtvix.inverse();
    let std_errors = (0..eval.beta.len())
        .map(|j| (phi * cov_beta.get(j, j)).max(0.0).sqrt())
        .collect();

    let lam = lambda(&fit.theta, q);
    let re_covariance = lam.mat_mul(&lam.transpose()).scale(phi).to_rows();
    let singular = (0..q).any(|d| lam.get(d, d) == 0.0);

    let (_, b) = if q > 0 {
        system.random_effects(eval, &fit.theta)
    } else {
        (Vec::new(), Vec::new())
    };
    let random_effects = design
        .group_labels
        .iter()
        .zip(b.iter())
        .map(|(label, bg)| ClusterEffect {
            cluster: label.clone(),
            effects: bg.clone(),
        })
        .collect();

    let xb = design.x.mat_vec(&eval.beta);
    let random_offset: Vec<f64> = (0..n).map(|i| random_part(design, &b, i)).collect();
    let working_residuals = (0..n)
        .map(|i| working_response[i] - xb[i] - random_offset[i])
        .collect();
    let eta: Vec<f64> = (0..n)
        .map(|i| design.offset[i] + xb[i] + random_offset[i])
        .collect();
    let fitted = family.update_mu(&eta);

    FittedModel {
        family: family.kind,
        criterion: opts.criterion,
        coef_names: design.coef_names.clone(),
        coefficients: eval.beta.clone(),
        std_errors,
        re_names: design.re_names.clone(),
        re_covariance,
        theta: fit.theta,
        dispersion: phi,
        random_effects,
        log_likelihood,
        deviance: eval.deviance,
        converged,
        iterations,
        singular,
        n_obs: n,
        working_response,
        working_weights,
        random_offset,
        working_residuals,
        fitted,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;
    use statrs::distribution::Normal;

    /// Random-intercept design: `m` clusters of `k` rows, X = [1, x].
    fn design(m: usize, k: usize, x: Vec<f64>, y: Vec<f64>) -> NodeDesign {
        let n = m * k;
        NodeDesign {
            rows: (0..n).collect(),
            x: DenseMatrix::from_fn(n, 2, |i, j| if j == 0 { 1.0 } else { x[i] }),
            coef_names: vec!["(Intercept)".into(), "x".into()],
            z: DenseMatrix::from_fn(n, 1, |_, _| 1.0),
            re_names: vec!["(Intercept)".into()],
            groups: (0..n).map(|i| i / k).collect(),
            group_labels: (0..m).map(|g| format!("c{}", g)).collect(),
            y,
            offset: vec![0.0; n],
        }
    }

    fn gaussian_data(seed: u64, m: usize, k: usize) -> NodeDesign {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let normal = Normal::new(0.0, 1.0).unwrap();
        let effects: Vec<f64> = (0..m).map(|_| rng.sample(normal)).collect();
        let x: Vec<f64> = (0..m * k).map(|_| rng.gen::<f64>()).collect();
        let y = (0..m * k)
            .map(|i| 1.0 + 2.0 * x[i] + effects[i / k] + 0.5 * rng.sample(normal))
            .collect();
        design(m, k, x, y)
    }

    #[test]
    fn test_gaussian_fit_recovers_fixed_effects() {
        let d = gaussian_data(7, 30, 10);
        let fit = fit_mixed_model(&d, &Family::new(FamilyKind::Gaussian), &FitConfig::default(), None).unwrap();
        assert!(fit.converged);
        assert!((fit.coefficient("x").unwrap() - 2.0).abs() < 0.2);
        assert!(fit.re_variances()[0] > 0.3);
        assert!((fit.dispersion - 0.25).abs() < 0.08);
        assert_eq!(fit.n_clusters(), 30);
        assert!(fit.std_errors.iter().all(|s| *s > 0.0));
    }

    /// Random intercept (sd 0.8) and random slope on x (sd 0.5).
    fn slope_data(seed: u64, m: usize, k: usize) -> NodeDesign {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let normal = Normal::new(0.0, 1.0).unwrap();
        let b: Vec<(f64, f64)> = (0..m)
            .map(|_| (0.8 * rng.sample(normal), 0.5 * rng.sample(normal)))
            .collect();
        let x: Vec<f64> = (0..m * k).map(|_| rng.gen::<f64>() * 4.0 - 2.0).collect();
        let y = (0..m * k)
            .map(|i| {
                let (b0, b1) = b[i / k];
                1.0 + b0 + (2.0 + b1) * x[i] + 0.3 * rng.sample(normal)
            })
            .collect();
        let mut d = design(m, k, x.clone(), y);
        d.z = DenseMatrix::from_fn(m * k, 2, |i, j| if j == 0 { 1.0 } else { x[i] });
        d.re_names = vec!["(Intercept)".into(), "x".into()];
        d
    }

    #[test]
    fn test_random_slope_covariance() {
        let d = slope_data(17, 60, 10);
        let fit = fit_mixed_model(&d, &Family::new(FamilyKind::Gaussian), &FitConfig::default(), None).unwrap();
        assert!(fit.converged);
        assert_eq!(fit.theta.len(), 3);
        assert_eq!(fit.re_covariance.len(), 2);
        assert_eq!(fit.re_covariance[0][1], fit.re_covariance[1][0]);
        let v = fit.re_variances();
        assert!((v[0] - 0.64).abs() < 0.3, "intercept variance {}", v[0]);
        assert!((v[1] - 0.25).abs() < 0.12, "slope variance {}", v[1]);
        assert!((fit.dispersion - 0.09).abs() < 0.03);
        assert!((fit.coefficient("x").unwrap() - 2.0).abs() < 0.2);
        assert!(fit.random_effects.iter().all(|c| c.effects.len() == 2));
    }

    #[test]
    fn test_random_slope_small_nodes_converge() {
        let config = FitConfig::default();
        for seed in 0..8 {
            let d = slope_data(100 + seed, 5, 5);
            match fit_mixed_model(&d, &Family::new(FamilyKind::Gaussian), &config, None) {
                Ok(fit) => {
                    assert!(fit.converged);
                    assert!(fit.iterations <= 2 * config.optimizer_max_iter * fit.theta.len());
                }
                Err(e) => panic!("seed {}: {}", seed, e),
            }
        }
    }

    #[test]
    fn test_scores_sum_to_zero_at_estimate() {
        let d = gaussian_data(11, 20, 8);
        let fit = fit_mixed_model(&d, &Family::new(FamilyKind::Gaussian), &FitConfig::default(), None).unwrap();
        let psi = fit.scores(&d.x);
        for j in 0..psi.ncols() {
            let total: f64 = (0..psi.nrows()).map(|i| psi.get(i, j)).sum();
            assert!(total.abs() < 1e-6, "score column {} sums to {}", j, total);
        }
    }

    #[test]
    fn test_singular_fit_reports_exact_zero() {
        let m = 8;
        let k = 5;
        let pattern = [0.3, -0.2, 0.1, -0.4, 0.2];
        let x: Vec<f64> = (0..m * k).map(|i| (i % k) as f64).collect();
        let y = (0..m * k).map(|i| 1.0 + 0.5 * x[i] + pattern[i % k]).collect();
        let d = design(m, k, x, y);
        let fit = fit_mixed_model(&d, &Family::new(FamilyKind::Gaussian), &FitConfig::default(), None).unwrap();
        assert_eq!(fit.re_covariance[0][0], 0.0);
        assert!(fit.singular);
        assert!(fit.random_effects.iter().all(|c| c.effects[0] == 0.0));
    }

    #[test]
    fn test_rank_deficient_design() {
        let mut d = gaussian_data(3, 10, 5);
        let n = d.n_obs();
        let x = d.x.clone();
        d.x = DenseMatrix::from_fn(n, 3, |i, j| if j < 2 { x.get(i, j) } else { 2.0 * x.get(i, 1) });
        d.coef_names.push("x_copy".into());
        match fit_mixed_model(&d, &Family::new(FamilyKind::Gaussian), &FitConfig::default(), None) {
            Err(FitError::RankDeficiency { column }) => assert_eq!(column, "x_copy"),
            other => panic!("expected rank deficiency, got {:?}", other.map(|m| m.coefficients)),
        }
    }

    fn binary_data(seed: u64, m: usize, k: usize) -> NodeDesign {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let normal = Normal::new(0.0, 1.0).unwrap();
        let effects: Vec<f64> = (0..m).map(|_| 0.7 * rng.sample(normal)).collect();
        let x: Vec<f64> = (0..m * k).map(|_| rng.gen::<f64>() * 2.0 - 1.0).collect();
        let y = (0..m * k)
            .map(|i| {
                let eta = -0.3 + 1.5 * x[i] + effects[i / k];
                let p = 1.0 / (1.0 + (-eta).exp());
                if rng.gen::<f64>() < p {
                    1.0
                } else {
                    0.0
                }
            })
            .collect();
        design(m, k, x, y)
    }

    #[test]
    fn test_binomial_pql_fit() {
        let d = binary_data(21, 40, 15);
        let fit = fit_mixed_model(&d, &Family::new(FamilyKind::Binomial), &FitConfig::default(), None).unwrap();
        assert!(fit.converged);
        assert_eq!(fit.dispersion, 1.0);
        let slope = fit.coefficient("x").unwrap();
        assert!((slope - 1.5).abs() < 0.5, "slope {}", slope);
        assert!(fit.fitted.iter().all(|m| *m > 0.0 && *m < 1.0));
    }

    #[test]
    fn test_iteration_cap_carries_last_estimates() {
        let d = binary_data(5, 20, 10);
        let config = FitConfig {
            max_iter: 1,
            ..FitConfig::default()
        };
        match fit_mixed_model(&d, &Family::new(FamilyKind::Binomial), &config, None) {
            Err(FitError::ConvergenceFailure { iterations, last }) => {
                assert_eq!(iterations, 1);
                assert!(!last.converged);
                assert_eq!(last.coefficients.len(), 2);
                assert!(last.coefficients.iter().all(|c| c.is_finite()));
            }
            other => panic!("expected convergence failure, got {:?}", other.map(|m| m.iterations)),
        }
    }

    #[test]
    fn test_poisson_without_random_effects() {
        let mut rng = ChaCha8Rng::seed_from_u64(99);
        let n = 300;
        let x: Vec<f64> = (0..n).map(|_| rng.gen::<f64>()).collect();
        let y: Vec<f64> = x
            .iter()
            .map(|xi| {
                let lambda = (0.5 + 1.0 * xi).exp();
                let poisson = statrs::distribution::Poisson::new(lambda).unwrap();
                rng.sample(poisson)
            })
            .collect();
        let d = NodeDesign {
            rows: (0..n).collect(),
            x: DenseMatrix::from_fn(n, 2, |i, j| if j == 0 { 1.0 } else { x[i] }),
            coef_names: vec!["(Intercept)".into(), "x".into()],
            z: DenseMatrix::zeros(n, 0),
            re_names: Vec::new(),
            groups: Vec::new(),
            group_labels: Vec::new(),
            y,
            offset: vec![0.0; n],
        };
        let fit = fit_mixed_model(&d, &Family::new(FamilyKind::Poisson), &FitConfig::default(), None).unwrap();
        assert!(fit.converged);
        assert!(fit.theta.is_empty());
        assert!((fit.coefficient("x").unwrap() - 1.0).abs() < 0.3);
    }

    #[test]
    fn test_rejects_invalid_response() {
        let mut d = binary_data(1, 5, 5);
        d.y[0] = 3.0;
        assert!(matches!(
            fit_mixed_model(&d, &Family::new(FamilyKind::Binomial), &FitConfig::default(), None),
            Err(FitError::InvalidInput(_))
        ));
    }
}

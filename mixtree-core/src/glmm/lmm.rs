//! Profiled (restricted) maximum likelihood for linear mixed models.
//!
//! Model for one grouping factor with q random terms per cluster:
//!   y_g = X_g beta + Z_g b_g + e_g,  b_g ~ N(0, s2 * L L'),  e_g ~ N(0, s2 * W_g^{-1})
//!
//! L is the lower-triangular relative covariance factor, parameterised by
//! theta (column-major lower triangle, diagonal taken in absolute value).
//! beta and s2 are profiled out, so the deviance is a function of theta
//! alone. Each evaluation works through per-cluster q x q blocks:
//!   M_g = I + L' Z_g' W_g Z_g L
//!   X'V^{-1}X = X'WX - sum_g C_g' M_g^{-1} C_g,  C_g = L' Z_g' W_g X_g
//! and theta is optimised by Nelder-Mead.

use argmin::core::{CostFunction, Executor, State, TerminationReason, TerminationStatus};
use argmin::solver::neldermead::NelderMead;
use serde::{Deserialize, Serialize};
use tracing::debug;

use mixtree_linalg::decomposition::CholeskyDecomp;
use mixtree_linalg::{DenseMatrix, LinalgError};

use crate::error::FitError;

/// Estimation criterion for the variance parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Criterion {
    /// Restricted maximum likelihood.
    #[default]
    Reml,
    /// Maximum likelihood.
    Ml,
}

/// Number of free parameters in a q x q lower-triangular factor.
pub fn n_theta(q: usize) -> usize {
    q * (q + 1) / 2
}

/// Starting value: identity relative covariance.
pub fn theta_init(q: usize) -> Vec<f64> {
    let mut theta = vec![0.0; n_theta(q)];
    let mut k = 0;
    for j in 0..q {
        theta[k] = 1.0;
        k += q - j;
    }
    theta
}

/// Build L from theta.
pub fn lambda(theta: &[f64], q: usize) -> DenseMatrix {
    assert_eq!(theta.len(), n_theta(q));
    let mut lam = DenseMatrix::zeros(q, q);
    let mut k = 0;
    for j in 0..q {
        for i in j..q {
            let v = theta[k];
            lam.set(i, j, if i == j { v.abs() } else { v });
            k += 1;
        }
    }
    lam
}

/// Positions in theta of the entries of row `d` of L.
fn row_positions(q: usize, d: usize) -> Vec<usize> {
    let mut offset = 0;
    let mut out = Vec::with_capacity(d + 1);
    for j in 0..=d {
        out.push(offset + (d - j));
        offset += q - j;
    }
    out
}

/// Per-cluster sufficient statistics for fixed working weights.
#[derive(Debug, Clone)]
struct ClusterBlock {
    ztwz: DenseMatrix,
    ztwx: DenseMatrix,
    ztwy: Vec<f64>,
}

/// Weighted cross products of (X, Z, y) for one set of working weights.
#[derive(Debug, Clone)]
pub struct WeightedSystem {
    n: usize,
    p: usize,
    q: usize,
    xtwx: DenseMatrix,
    xtwy: Vec<f64>,
    ytwy: f64,
    log_w_sum: f64,
    blocks: Vec<ClusterBlock>,
}

/// Per-cluster factorisation kept for the random-effect predictions.
#[derive(Debug, Clone)]
struct BlockFactor {
    chol: CholeskyDecomp,
    cmat: DenseMatrix,
    cvec: Vec<f64>,
}

/// Everything computed at one value of theta.
#[derive(Debug, Clone)]
pub struct Evaluation {
    /// -2 x (restricted) log-likelihood.
    pub deviance: f64,
    pub beta: Vec<f64>,
    /// Residual variance (profiled) or the fixed dispersion.
    pub sigma2: f64,
    /// Cholesky factor of X'V*^{-1}X.
    pub xtvix: CholeskyDecomp,
    /// sum_g log|M_g|.
    pub log_det_m: f64,
    factors: Vec<BlockFactor>,
}

impl WeightedSystem {
    /// Accumulate cross products. `groups[i]` is the cluster index of row i
    /// in `0..n_groups`; ignored when `z` has no columns.
    pub fn new(
        x: &DenseMatrix,
        z: &DenseMatrix,
        groups: &[usize],
        n_groups: usize,
        y: &[f64],
        w: &[f64],
    ) -> Self {
        let n = x.nrows();
        let p = x.ncols();
        let q = z.ncols();
        assert_eq!(y.len(), n);
        assert_eq!(w.len(), n);

        let xtwx = x.xtwx(w);
        let xtwy = x.xtwv(w, y);
        let ytwy = y.iter().zip(w.iter()).map(|(yi, wi)| wi * yi * yi).sum();
        let log_w_sum = w.iter().map(|wi| wi.ln()).sum();

        let mut blocks = Vec::new();
        if q > 0 {
            assert_eq!(groups.len(), n);
            blocks = (0..n_groups)
                .map(|_| ClusterBlock {
                    ztwz: DenseMatrix::zeros(q, q),
                    ztwx: DenseMatrix::zeros(q, p),
                    ztwy: vec![0.0; q],
                })
                .collect();
            for i in 0..n {
                let block = &mut blocks[groups[i]];
                let zi = z.row(i);
                let xi = x.row(i);
                block.ztwz.add_outer(&zi, w[i]);
                for a in 0..q {
                    let wz = w[i] * zi[a];
                    if wz == 0.0 {
                        continue;
                    }
                    for b in 0..p {
                        block.ztwx.set(a, b, block.ztwx.get(a, b) + wz * xi[b]);
                    }
                    block.ztwy[a] += wz * y[i];
                }
            }
        }

        Self {
            n,
            p,
            q,
            xtwx,
            xtwy,
            ytwy,
            log_w_sum,
            blocks,
        }
    }

    /// Number of random terms per cluster.
    pub fn q(&self) -> usize {
        self.q
    }

    /// Profiled deviance and estimates at theta.
    ///
    /// `dispersion = None` profiles the residual variance (Gaussian);
    /// `Some(phi)` holds it fixed (PQL working model).
    pub fn evaluate(
        &self,
        theta: &[f64],
        criterion: Criterion,
        dispersion: Option<f64>,
        rank_tol: f64,
    ) -> Result<Evaluation, LinalgError> {
        let q = self.q;
        let p = self.p;
        let lam = lambda(theta, q);
        let lam_t = lam.transpose();

        let mut xtvix = self.xtwx.clone();
        let mut xtviy = self.xtwy.clone();
        let mut ytviy = self.ytwy;
        let mut log_det_m = 0.0;
        let mut factors = Vec::with_capacity(self.blocks.len());

        for block in &self.blocks {
            let mut m = lam_t.mat_mul(&block.ztwz).mat_mul(&lam);
            for d in 0..q {
                m.set(d, d, m.get(d, d) + 1.0);
            }
            let chol = CholeskyDecomp::new(&m)?;
            log_det_m += chol.log_det();

            let cmat = lam_t.mat_mul(&block.ztwx);
            let cvec = lam_t.mat_vec(&block.ztwy);
            let minv_cmat = chol.solve_matrix(&cmat);
            let minv_cvec = chol.solve(&cvec);

            xtvix.sub_assign(&cmat.transpose().mat_mul(&minv_cmat));
            let correction = cmat.t_mat_vec(&minv_cvec);
            for j in 0..p {
                xtviy[j] -= correction[j];
            }
            ytviy -= DenseMatrix::dot(&cvec, &minv_cvec);

            factors.push(BlockFactor { chol, cmat, cvec });
        }

        let chol_x = CholeskyDecomp::with_rank_check(&xtvix, rank_tol)?;
        let beta = chol_x.solve(&xtviy);
        let r2 = (ytviy - DenseMatrix::dot(&beta, &xtviy)).max(0.0);

        let n = self.n as f64;
        let dof = match criterion {
            Criterion::Reml => n - p as f64,
            Criterion::Ml => n,
        };
        let reml_term = match criterion {
            Criterion::Reml => chol_x.log_det(),
            Criterion::Ml => 0.0,
        };
        let log_det_v = log_det_m - self.log_w_sum;
        let two_pi = 2.0 * std::f64::consts::PI;

        let (sigma2, deviance) = match dispersion {
            None => {
                let s2 = (r2 / dof).max(f64::MIN_POSITIVE);
                (s2, log_det_v + reml_term + dof * (1.0 + (two_pi * s2).ln()))
            }
            Some(phi) => (phi, log_det_v + reml_term + r2 / phi + dof * (two_pi * phi).ln()),
        };

        Ok(Evaluation {
            deviance,
            beta,
            sigma2,
            xtvix: chol_x,
            log_det_m,
            factors,
        })
    }

    /// Spherical (u_g) and scaled (b_g = L u_g) random-effect predictions.
    pub fn random_effects(&self, eval: &Evaluation, theta: &[f64]) -> (Vec<Vec<f64>>, Vec<Vec<f64>>) {
        let lam = lambda(theta, self.q);
        eval.factors
            .iter()
            .map(|f| {
                let c_beta = f.cmat.mat_vec(&eval.beta);
                let rhs: Vec<f64> = f.cvec.iter().zip(c_beta.iter()).map(|(c, cb)| c - cb).collect();
                let u = f.chol.solve(&rhs);
                let b = lam.mat_vec(&u);
                (u, b)
            })
            .unzip()
    }
}

/// Profiled deviance as an argmin cost function.
struct ProfiledDeviance<'a> {
    system: &'a WeightedSystem,
    criterion: Criterion,
    dispersion: Option<f64>,
    rank_tol: f64,
}

impl CostFunction for ProfiledDeviance<'_> {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, theta: &Self::Param) -> Result<Self::Output, argmin::core::Error> {
        Ok(match self.system.evaluate(theta, self.criterion, self.dispersion, self.rank_tol) {
            Ok(e) if e.deviance.is_finite() => e.deviance,
            _ => f64::INFINITY,
        })
    }
}

/// Tuning of the theta optimisation.
#[derive(Debug, Clone, Copy)]
pub struct ThetaOptions {
    pub criterion: Criterion,
    pub dispersion: Option<f64>,
    /// Simplex iterations per variance parameter.
    pub max_iter: usize,
    /// Standard deviation of the simplex deviances, relative to the
    /// starting deviance.
    pub sd_tol: f64,
    pub boundary_tol: f64,
    pub rank_tol: f64,
}

/// Optimised theta with its evaluation.
#[derive(Debug, Clone)]
pub struct ThetaFit {
    pub theta: Vec<f64>,
    pub evaluation: Evaluation,
    pub iterations: usize,
    pub converged: bool,
}

fn map_rank_error(err: LinalgError, names: &[String]) -> FitError {
    match err {
        LinalgError::RankDeficient { column } => FitError::RankDeficiency {
            column: names.get(column).cloned().unwrap_or_else(|| format!("#{column}")),
        },
        other => FitError::Optimizer(other.to_string()),
    }
}

/// One Nelder-Mead run from `start`; returns the best point, the iteration
/// count and whether the cap was hit.
fn run_simplex(
    system: &WeightedSystem,
    opts: &ThetaOptions,
    start: &[f64],
    sd_tol: f64,
    max_iter: usize,
) -> Result<(Vec<f64>, usize, bool), FitError> {
    let mut simplex = vec![start.to_vec()];
    for k in 0..start.len() {
        let mut vertex = start.to_vec();
        vertex[k] += if vertex[k].abs() > 0.5 { 0.5 * vertex[k].abs() } else { 0.5 };
        simplex.push(vertex);
    }

    let cost = ProfiledDeviance {
        system,
        criterion: opts.criterion,
        dispersion: opts.dispersion,
        rank_tol: opts.rank_tol,
    };
    let solver = NelderMead::new(simplex)
        .with_sd_tolerance(sd_tol)
        .map_err(|e| FitError::Optimizer(e.to_string()))?;
    let result = Executor::new(cost, solver)
        .configure(|state| state.max_iters(max_iter as u64))
        .run()
        .map_err(|e| FitError::Optimizer(e.to_string()))?;

    let state = result.state();
    let hit_cap = matches!(
        state.get_termination_status(),
        TerminationStatus::Terminated(TerminationReason::MaxItersReached)
    );
    let best = state.get_best_param().cloned().unwrap_or_else(|| start.to_vec());
    Ok((best, state.get_iter() as usize, hit_cap))
}

/// Minimise the profiled deviance over theta, starting at `start`.
///
/// The simplex tolerance scales with the starting deviance and the
/// iteration cap with the number of parameters. A run that hits the cap is
/// restarted once from its best point with a fresh simplex.
///
/// After the simplex search every row of L is tried at exactly zero and
/// kept there when the deviance does not rise by more than
/// `boundary_tol`, so a vanishing variance component is reported as 0.
pub fn optimize_theta(
    system: &WeightedSystem,
    start: &[f64],
    opts: &ThetaOptions,
    coef_names: &[String],
) -> Result<ThetaFit, FitError> {
    let q = system.q();
    let eval_at = |theta: &[f64]| {
        system
            .evaluate(theta, opts.criterion, opts.dispersion, opts.rank_tol)
            .map_err(|e| map_rank_error(e, coef_names))
    };

    // Rank is a property of X alone; surface it before searching.
    let start_eval = eval_at(start)?;
    if q == 0 {
        return Ok(ThetaFit {
            theta: Vec::new(),
            evaluation: start_eval,
            iterations: 0,
            converged: true,
        });
    }

    let sd_tol = opts.sd_tol * start_eval.deviance.abs().max(1.0);
    let cap = opts.max_iter * start.len();
    let (mut theta, mut iterations, mut hit_cap) = run_simplex(system, opts, start, sd_tol, cap)?;
    if hit_cap {
        debug!("Simplex hit {} iterations; restarting from best point", iterations);
        let (restarted, more, capped) = run_simplex(system, opts, &theta, sd_tol, cap)?;
        theta = restarted;
        iterations += more;
        hit_cap = capped;
    }

    // Canonical sign: non-negative diagonal.
    let mut k = 0;
    for j in 0..q {
        theta[k] = theta[k].abs();
        k += q - j;
    }
    let mut best = eval_at(&theta)?;
    if start_eval.deviance < best.deviance {
        theta = start.to_vec();
        best = start_eval;
    }

    for d in 0..q {
        let positions = row_positions(q, d);
        if positions.iter().all(|&pos| theta[pos] == 0.0) {
            continue;
        }
        let mut candidate = theta.clone();
        for &pos in &positions {
            candidate[pos] = 0.0;
        }
        if let Ok(eval) = eval_at(&candidate) {
            if eval.deviance <= best.deviance + opts.boundary_tol {
                debug!("Variance component {} at boundary (deviance change {:.2e})", d, eval.deviance - best.deviance);
                theta = candidate;
                best = eval;
            }
        }
    }

    debug!(
        "theta optimisation: {} iterations, deviance {:.6}, theta {:?}",
        iterations, best.deviance, theta
    );

    Ok(ThetaFit {
        theta,
        evaluation: best,
        iterations,
        converged: !hit_cap,
    })
}

//! Score-based parameter instability tests.
//!
//! For each candidate partitioning covariate the fixed-effect score
//! contributions are ordered (or grouped) by the covariate and summarised by
//! a fluctuation statistic. Under parameter stability the decorrelated
//! cumulative score process converges to a k-dimensional Brownian bridge.
//!
//! Ordered covariates use either the double-maximum functional (analytic
//! p-value from the Kolmogorov distribution) or the trimmed sup-LM
//! functional (p-value from a simulated null table). Unordered covariates
//! use the chi-squared statistic of the per-category score sums.

use std::collections::BTreeMap;

use anyhow::{bail, Result};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ChiSquared, ContinuousCDF, Normal};
use tracing::debug;

use mixtree_linalg::decomposition::inverse_sqrt_psd;
use mixtree_linalg::DenseMatrix;

use crate::data::frame::{Candidate, CovariateKind};
use crate::util::math::{kolmogorov_cdf, multiplicity_adjust};

/// Relative eigenvalue cut-off when decorrelating the scores.
const RANK_TOL: f64 = 1e-10;

/// Adjusted p-values closer than this count as tied.
const TIE_TOL: f64 = 1e-12;

/// Number of grid points per simulated Brownian bridge.
const BRIDGE_GRID: usize = 500;

/// Functional applied to the cumulative score process of ordered covariates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Functional {
    /// max_t max_j |W_j(t)|.
    #[default]
    DoubleMax,
    /// max over t in [trim, 1 - trim] of ||W(t)||^2 / (t (1 - t)).
    SupLm,
}

/// Configuration for the instability tests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestConfig {
    pub functional: Functional,
    /// Trimming fraction for `SupLm`.
    pub trim: f64,
    /// Adjust p-values for the number of tested covariates.
    pub bonferroni: bool,
    /// Aggregate scores by cluster for covariates constant within clusters.
    pub cluster_aware: bool,
    /// Monte Carlo replications of the `SupLm` null table.
    pub replications: usize,
    pub seed: u64,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            functional: Functional::DoubleMax,
            trim: 0.1,
            bonferroni: true,
            cluster_aware: true,
            replications: 5000,
            seed: 20240101,
        }
    }
}

/// Whether a test ran over rows or over cluster-aggregated scores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TestLevel {
    Row,
    Cluster,
}

/// Outcome of the instability test for one covariate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CovariateTest {
    pub covariate: String,
    pub statistic: f64,
    pub p_value: f64,
    /// Multiplicity-adjusted p-value.
    pub p_adjusted: f64,
    /// Degrees of freedom (chi-squared) or bridge dimension (ordered tests).
    pub df: usize,
    pub level: TestLevel,
    /// Number of units (rows or clusters) entering the statistic.
    pub n_units: usize,
    /// False when the covariate carries no ordering information in the node.
    pub testable: bool,
}

/// Simulated null distribution of the sup-LM statistic, per bridge dimension.
#[derive(Debug, Clone)]
pub struct SupLmTable {
    trim: f64,
    /// Sorted simulated statistics; index k - 1 for dimension k.
    samples: Vec<Vec<f64>>,
}

impl SupLmTable {
    /// Simulate `replications` draws for every dimension up to `max_rank`.
    pub fn simulate(max_rank: usize, trim: f64, replications: usize, seed: u64) -> Result<Self> {
        if !(0.0..0.5).contains(&trim) {
            bail!("Trimming fraction must lie in [0, 0.5), got {}", trim);
        }
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let normal = Normal::new(0.0, 1.0)?;
        let g = BRIDGE_GRID;
        let step = (1.0 / g as f64).sqrt();
        let lo = ((trim * g as f64).ceil() as usize).max(1);
        let hi = (((1.0 - trim) * g as f64).floor() as usize).min(g - 1);

        let mut samples = vec![Vec::with_capacity(replications); max_rank];
        let mut walk = vec![0.0; g + 1];
        let mut sum_sq = vec![0.0; g + 1];
        for _ in 0..replications {
            sum_sq.iter_mut().for_each(|s| *s = 0.0);
            for k in 0..max_rank {
                walk[0] = 0.0;
                for i in 1..=g {
                    walk[i] = walk[i - 1] + step * rng.sample(normal);
                }
                let end = walk[g];
                let mut best = 0.0f64;
                for i in lo..=hi {
                    let t = i as f64 / g as f64;
                    let b = walk[i] - t * end;
                    sum_sq[i] += b * b;
                    best = best.max(sum_sq[i] / (t * (1.0 - t)));
                }
                samples[k].push(best);
            }
        }
        for s in &mut samples {
            s.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        }
        debug!(
            "Simulated sup-LM null table: {} dimensions x {} replications",
            max_rank, replications
        );
        Ok(Self { trim, samples })
    }

    pub fn trim(&self) -> f64 {
        self.trim
    }

    pub fn max_rank(&self) -> usize {
        self.samples.len()
    }

    /// Monte Carlo p-value (1 + #{sim >= stat}) / (R + 1).
    pub fn p_value(&self, statistic: f64, rank: usize) -> f64 {
        let Some(s) = self.samples.get(rank.saturating_sub(1)) else {
            return 1.0;
        };
        let below = s.partition_point(|&v| v < statistic);
        (1 + s.len() - below) as f64 / (s.len() + 1) as f64
    }
}

/// Units entering a test: one score vector and one covariate key each.
struct Units {
    scores: Vec<Vec<f64>>,
    keys: Vec<f64>,
    level: TestLevel,
}

/// Collect units for one covariate. Rows with a missing covariate are dropped;
/// when the covariate is constant within every cluster the scores are summed
/// per cluster.
///
/// Row-level covariates keep row units with the per-row variance. Cluster
/// sums of conditional scores are shrunk by the BLUPs (to zero for a random
/// slope on a regressor), so they cannot estimate the variance of a process
/// that cuts through clusters.
fn collect_units(
    psi: &DenseMatrix,
    rows: &[usize],
    key: impl Fn(usize) -> Option<f64>,
    clusters: Option<&[u32]>,
    cluster_aware: bool,
) -> Units {
    let p = psi.ncols();
    let present: Vec<(usize, f64)> = rows
        .iter()
        .enumerate()
        .filter_map(|(r, &row)| key(row).map(|v| (r, v)))
        .collect();

    if let (true, Some(cl)) = (cluster_aware, clusters) {
        let mut by_cluster: BTreeMap<u32, (f64, Vec<f64>, bool)> = BTreeMap::new();
        for &(r, v) in &present {
            let entry = by_cluster.entry(cl[r]).or_insert_with(|| (v, vec![0.0; p], true));
            if entry.0 != v {
                entry.2 = false;
            }
            for j in 0..p {
                entry.1[j] += psi.get(r, j);
            }
        }
        if by_cluster.values().all(|e| e.2) {
            let (keys, scores) = by_cluster.into_values().map(|(v, s, _)| (v, s)).unzip();
            return Units {
                scores,
                keys,
                level: TestLevel::Cluster,
            };
        }
    }

    Units {
        scores: present.iter().map(|&(r, _)| psi.row(r)).collect(),
        keys: present.iter().map(|&(_, v)| v).collect(),
        level: TestLevel::Row,
    }
}

impl Units {
    fn len(&self) -> usize {
        self.keys.len()
    }

    fn center(&mut self) {
        let n = self.len() as f64;
        let p = self.scores.first().map(|s| s.len()).unwrap_or(0);
        for j in 0..p {
            let mean = self.scores.iter().map(|s| s[j]).sum::<f64>() / n;
            self.scores.iter_mut().for_each(|s| s[j] -= mean);
        }
    }

    /// Score variance per unit (mean outer product of the centred scores).
    fn information(&self) -> DenseMatrix {
        let n = self.len() as f64;
        let p = self.scores.first().map(|s| s.len()).unwrap_or(0);
        let mut j = DenseMatrix::zeros(p, p);
        for s in &self.scores {
            j.add_outer(s, 1.0 / n);
        }
        j
    }
}

fn untestable(name: &str, level: TestLevel, n_units: usize) -> CovariateTest {
    CovariateTest {
        covariate: name.to_string(),
        statistic: 0.0,
        p_value: 1.0,
        p_adjusted: 1.0,
        df: 0,
        level,
        n_units,
        testable: false,
    }
}

fn ordered_test(name: &str, mut units: Units, config: &TestConfig, table: Option<&SupLmTable>) -> CovariateTest {
    let n = units.len();
    let level = units.level;
    let mut distinct = units.keys.clone();
    distinct.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    distinct.dedup();
    if n < 2 || distinct.len() < 2 {
        return untestable(name, level, n);
    }
    units.center();
    let t_mat = match inverse_sqrt_psd(&units.information(), RANK_TOL) {
        Ok(t) if t.nrows() > 0 => t,
        _ => return untestable(name, level, n),
    };
    let rank = t_mat.nrows();

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| {
        units.keys[a]
            .partial_cmp(&units.keys[b])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let sqrt_n = (n as f64).sqrt();
    let p = units.scores[0].len();
    let mut cum = vec![0.0; p];
    let mut statistic = 0.0f64;
    let mut evaluated = false;
    for (pos, &u) in order.iter().enumerate() {
        cum.iter_mut().zip(units.scores[u].iter()).for_each(|(c, s)| *c += s);
        let last_of_tie = pos + 1 == n || units.keys[order[pos + 1]] != units.keys[u];
        if !last_of_tie || pos + 1 == n {
            continue;
        }
        let w: Vec<f64> = t_mat.mat_vec(&cum).into_iter().map(|v| v / sqrt_n).collect();
        let t = (pos + 1) as f64 / n as f64;
        let value = match config.functional {
            Functional::DoubleMax => w.iter().fold(0.0f64, |m, v| m.max(v.abs())),
            Functional::SupLm => {
                if t < config.trim || t > 1.0 - config.trim {
                    continue;
                }
                w.iter().map(|v| v * v).sum::<f64>() / (t * (1.0 - t))
            }
        };
        evaluated = true;
        statistic = statistic.max(value);
    }
    if !evaluated {
        return untestable(name, level, n);
    }

    let p_value = match config.functional {
        Functional::DoubleMax => 1.0 - kolmogorov_cdf(statistic).powi(rank as i32),
        Functional::SupLm => match table {
            Some(tab) => tab.p_value(statistic, rank),
            None => 1.0,
        },
    };
    CovariateTest {
        covariate: name.to_string(),
        statistic,
        p_value: p_value.clamp(0.0, 1.0),
        p_adjusted: p_value.clamp(0.0, 1.0),
        df: rank,
        level,
        n_units: n,
        testable: true,
    }
}

fn categorical_test(name: &str, mut units: Units) -> CovariateTest {
    let n = units.len();
    let level = units.level;
    let mut categories: BTreeMap<u64, (Vec<f64>, usize)> = BTreeMap::new();
    if n < 2 {
        return untestable(name, level, n);
    }
    units.center();
    let t_mat = match inverse_sqrt_psd(&units.information(), RANK_TOL) {
        Ok(t) if t.nrows() > 0 => t,
        _ => return untestable(name, level, n),
    };
    let rank = t_mat.nrows();
    let p = units.scores[0].len();
    for (s, &k) in units.scores.iter().zip(units.keys.iter()) {
        let entry = categories.entry(k as u64).or_insert_with(|| (vec![0.0; p], 0));
        entry.0.iter_mut().zip(s.iter()).for_each(|(a, v)| *a += v);
        entry.1 += 1;
    }
    let c = categories.len();
    if c < 2 {
        return untestable(name, level, n);
    }
    let statistic: f64 = categories
        .values()
        .map(|(sum, count)| {
            let ts = t_mat.mat_vec(sum);
            DenseMatrix::dot(&ts, &ts) / *count as f64
        })
        .sum();
    let df = rank * (c - 1);
    let p_value = match ChiSquared::new(df as f64) {
        Ok(chi) => chi.sf(statistic),
        Err(_) => 1.0,
    };
    CovariateTest {
        covariate: name.to_string(),
        statistic,
        p_value,
        p_adjusted: p_value,
        df,
        level,
        n_units: n,
        testable: true,
    }
}

/// Instability tests for every candidate covariate over the node's rows.
///
/// `psi` holds the per-row score contributions (rows aligned with `rows`),
/// `clusters` the test cluster of each row. Results keep candidate order.
pub fn test(
    psi: &DenseMatrix,
    rows: &[usize],
    candidates: &[Candidate<'_>],
    clusters: Option<&[u32]>,
    config: &TestConfig,
    table: Option<&SupLmTable>,
) -> Vec<CovariateTest> {
    let mut results: Vec<CovariateTest> = candidates
        .iter()
        .map(|cand| match cand.kind {
            CovariateKind::Numeric | CovariateKind::Ordered => {
                let units = collect_units(psi, rows, |r| cand.ordinal(r), clusters, config.cluster_aware);
                ordered_test(cand.name, units, config, table)
            }
            CovariateKind::Unordered => {
                let units = collect_units(
                    psi,
                    rows,
                    |r| cand.level(r).map(|l| l as f64),
                    clusters,
                    config.cluster_aware,
                );
                categorical_test(cand.name, units)
            }
        })
        .collect();

    let m = results.iter().filter(|t| t.testable).count();
    if config.bonferroni {
        for t in results.iter_mut().filter(|t| t.testable) {
            t.p_adjusted = multiplicity_adjust(t.p_value, m);
        }
    }
    for t in &results {
        debug!(
            "  {}: stat={:.4}, p={:.4e}, p_adj={:.4e} ({:?}, {} units)",
            t.covariate, t.statistic, t.p_value, t.p_adjusted, t.level, t.n_units
        );
    }
    results
}

/// Index of the covariate to split on: smallest adjusted p-value below
/// `alpha`, earlier candidates winning ties.
pub fn select(tests: &[CovariateTest], alpha: f64) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (i, t) in tests.iter().enumerate().filter(|(_, t)| t.testable) {
        match best {
            Some(b) if t.p_adjusted >= tests[b].p_adjusted - TIE_TOL => {}
            _ => best = Some(i),
        }
    }
    best.filter(|&b| tests[b].p_adjusted < alpha)
}

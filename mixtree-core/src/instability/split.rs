//! Split-point search for a selected partitioning covariate.
//!
//! The objective is the summed weighted residual sum of squares of the two
//! child models, each regressing the node's working target on the node
//! regressors. Sufficient statistics (X'WX, X'Wt, t'Wt) are accumulated
//! along the covariate order, so each candidate costs one p x p solve.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use mixtree_linalg::decomposition::CholeskyDecomp;
use mixtree_linalg::DenseMatrix;

use crate::data::frame::{Candidate, CovariateKind};
use crate::util::math::weighted_mean;

/// Upper bound on exhaustively enumerated factor levels (2^19 bipartitions).
pub const EXHAUSTIVE_LIMIT: usize = 20;

/// How a split sends rows to its children.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SplitRule {
    /// value <= `value` goes left.
    Threshold { value: f64 },
    /// Categorical levels seen in the node, by label.
    Levels { left: Vec<String>, right: Vec<String> },
}

impl SplitRule {
    /// Direction for a non-missing value: `Some(true)` = left, `None` when the
    /// value is a level the rule has not seen.
    pub fn goes_left(&self, candidate: &Candidate<'_>, row: usize) -> Option<bool> {
        match self {
            SplitRule::Threshold { value } => candidate.ordinal(row).map(|v| v <= *value),
            SplitRule::Levels { left, right } => {
                let label = candidate.levels().get(candidate.level(row)? as usize)?;
                if left.contains(label) {
                    Some(true)
                } else if right.contains(label) {
                    Some(false)
                } else {
                    None
                }
            }
        }
    }
}

/// Best admissible split of a node on one covariate.
#[derive(Debug, Clone)]
pub struct SplitCandidate {
    pub rule: SplitRule,
    /// Missing values and unseen levels follow the larger child.
    pub majority_left: bool,
    /// Summed child weighted RSS.
    pub objective: f64,
    pub left: Vec<usize>,
    pub right: Vec<usize>,
}

/// Constraints on the children of a split.
#[derive(Debug, Clone, Copy)]
pub struct SplitConstraints {
    pub min_size: usize,
    /// Minimum distinct clusters per child, when clusters are tracked.
    pub min_clusters: Option<usize>,
    pub max_exhaustive_levels: usize,
    pub rank_tol: f64,
}

/// Node-level inputs to the split search, rows aligned with `rows`.
pub struct SplitInput<'a> {
    pub rows: &'a [usize],
    pub x: &'a DenseMatrix,
    pub target: &'a [f64],
    pub weights: &'a [f64],
    pub clusters: Option<&'a [u32]>,
}

/// Weighted least-squares sufficient statistics of a row set.
#[derive(Debug, Clone)]
struct Stats {
    xtwx: DenseMatrix,
    xtwt: Vec<f64>,
    twt: f64,
    n: usize,
}

impl Stats {
    fn zeros(p: usize) -> Self {
        Self {
            xtwx: DenseMatrix::zeros(p, p),
            xtwt: vec![0.0; p],
            twt: 0.0,
            n: 0,
        }
    }

    fn add_row(&mut self, x: &[f64], w: f64, t: f64) {
        self.xtwx.add_outer(x, w);
        self.xtwt.iter_mut().zip(x.iter()).for_each(|(a, xi)| *a += w * xi * t);
        self.twt += w * t * t;
        self.n += 1;
    }

    fn add(&mut self, other: &Stats) {
        self.xtwx.add_assign(&other.xtwx);
        self.xtwt.iter_mut().zip(other.xtwt.iter()).for_each(|(a, b)| *a += b);
        self.twt += other.twt;
        self.n += other.n;
    }

    fn minus(&self, other: &Stats) -> Stats {
        let mut out = self.clone();
        out.xtwx.sub_assign(&other.xtwx);
        out.xtwt.iter_mut().zip(other.xtwt.iter()).for_each(|(a, b)| *a -= b);
        out.twt -= other.twt;
        out.n -= other.n;
        out
    }

    /// Weighted RSS of the least-squares fit; `None` when X'WX is rank deficient.
    fn rss(&self, rank_tol: f64) -> Option<f64> {
        let chol = CholeskyDecomp::with_rank_check(&self.xtwx, rank_tol).ok()?;
        let b = chol.solve(&self.xtwt);
        Some((self.twt - DenseMatrix::dot(&b, &self.xtwt)).max(0.0))
    }
}

/// Distinct-cluster bookkeeping for one side of a moving split.
#[derive(Default)]
struct ClusterCounts {
    counts: HashMap<u32, usize>,
}

impl ClusterCounts {
    fn add(&mut self, c: u32) {
        *self.counts.entry(c).or_insert(0) += 1;
    }

    fn remove(&mut self, c: u32) {
        if let Some(k) = self.counts.get_mut(&c) {
            *k -= 1;
            if *k == 0 {
                self.counts.remove(&c);
            }
        }
    }

    fn distinct(&self) -> usize {
        self.counts.len()
    }
}

struct Scan<'a> {
    input: &'a SplitInput<'a>,
    constraints: SplitConstraints,
    total: Stats,
    missing: Stats,
    best: Option<(f64, SplitRule, bool)>,
}

impl Scan<'_> {
    /// Score one partition of the present rows; missing rows join the larger side.
    fn consider(&mut self, left: &Stats, left_clusters: usize, right_clusters: usize, rule: impl FnOnce() -> SplitRule) {
        let right = self.total.minus(left);
        let majority_left = left.n >= right.n;
        let (mut l, mut r) = (left.clone(), right);
        if majority_left {
            l.add(&self.missing);
        } else {
            r.add(&self.missing);
        }
        let c = &self.constraints;
        if l.n < c.min_size || r.n < c.min_size {
            return;
        }
        if let Some(mc) = c.min_clusters {
            if left_clusters < mc || right_clusters < mc {
                return;
            }
        }
        let (Some(rl), Some(rr)) = (l.rss(c.rank_tol), r.rss(c.rank_tol)) else {
            return;
        };
        let objective = rl + rr;
        if self.best.as_ref().map_or(true, |(b, _, _)| objective < *b) {
            self.best = Some((objective, rule(), majority_left));
        }
    }

    fn row_stats(&self, r: usize) -> (Vec<f64>, f64, f64) {
        (self.input.x.row(r), self.input.weights[r], self.input.target[r])
    }
}

/// Find the admissible split of `candidate` minimising the summed child RSS.
pub fn best_split(
    candidate: &Candidate<'_>,
    input: &SplitInput<'_>,
    constraints: SplitConstraints,
) -> Option<SplitCandidate> {
    let p = input.x.ncols();
    let n = input.rows.len();
    let track_clusters = constraints.min_clusters.is_some() && input.clusters.is_some();
    let cluster_of = |r: usize| input.clusters.map(|c| c[r]).unwrap_or(0);

    let mut total = Stats::zeros(p);
    let mut missing = Stats::zeros(p);
    let mut present: Vec<usize> = Vec::with_capacity(n);
    for r in 0..n {
        let row = input.rows[r];
        let observed = match candidate.kind {
            CovariateKind::Numeric => candidate.ordinal(row).is_some(),
            _ => candidate.level(row).is_some(),
        };
        let xr = input.x.row(r);
        if observed {
            total.add_row(&xr, input.weights[r], input.target[r]);
            present.push(r);
        } else {
            missing.add_row(&xr, input.weights[r], input.target[r]);
        }
    }

    let mut scan = Scan {
        input,
        constraints,
        total,
        missing,
        best: None,
    };

    match candidate.kind {
        CovariateKind::Numeric => {
            let mut order = present.clone();
            let value = |r: usize| candidate.ordinal(input.rows[r]).unwrap_or(f64::NAN);
            order.sort_by(|&a, &b| value(a).partial_cmp(&value(b)).unwrap_or(std::cmp::Ordering::Equal));
            scan_ordered(&mut scan, &order, &value, &cluster_of, track_clusters, |v| SplitRule::Threshold { value: v });
        }
        CovariateKind::Ordered | CovariateKind::Unordered => {
            let level_of = |r: usize| candidate.level(input.rows[r]).unwrap_or(u32::MAX);
            let mut by_level: BTreeMap<u32, (Stats, Vec<u32>)> = BTreeMap::new();
            for &r in &present {
                let (xr, w, t) = scan.row_stats(r);
                let entry = by_level
                    .entry(level_of(r))
                    .or_insert_with(|| (Stats::zeros(p), Vec::new()));
                entry.0.add_row(&xr, w, t);
                if track_clusters {
                    entry.1.push(cluster_of(r));
                }
            }
            let levels: Vec<u32> = by_level.keys().copied().collect();
            if levels.len() < 2 {
                return None;
            }
            let exhaustive = constraints.max_exhaustive_levels.min(EXHAUSTIVE_LIMIT);
            if candidate.kind == CovariateKind::Unordered && levels.len() <= exhaustive {
                scan_bipartitions(&mut scan, &levels, candidate.levels(), &by_level, track_clusters);
            } else {
                let ordered_levels = if candidate.kind == CovariateKind::Ordered {
                    levels.clone()
                } else {
                    order_by_mean(&present, &level_of, input, &levels)
                };
                let rank: HashMap<u32, usize> = ordered_levels.iter().enumerate().map(|(i, &l)| (l, i)).collect();
                let mut order = present.clone();
                order.sort_by_key(|&r| rank[&level_of(r)]);
                let position = |r: usize| rank[&level_of(r)] as f64;
                scan_ordered(&mut scan, &order, &position, &cluster_of, track_clusters, |v| {
                    let cut = v as usize;
                    SplitRule::Levels {
                        left: labels(candidate.levels(), &ordered_levels[..=cut]),
                        right: labels(candidate.levels(), &ordered_levels[cut + 1..]),
                    }
                });
            }
        }
    }

    let (objective, rule, majority_left) = scan.best?;
    let mut left = Vec::new();
    let mut right = Vec::new();
    for &row in input.rows {
        let goes_left = rule.goes_left(candidate, row).unwrap_or(majority_left);
        if goes_left {
            left.push(row);
        } else {
            right.push(row);
        }
    }
    Some(SplitCandidate {
        rule,
        majority_left,
        objective,
        left,
        right,
    })
}

/// Scan contiguous cut points of an ordering; cuts only between distinct keys.
fn scan_ordered(
    scan: &mut Scan<'_>,
    order: &[usize],
    key: &dyn Fn(usize) -> f64,
    cluster_of: &dyn Fn(usize) -> u32,
    track_clusters: bool,
    make_rule: impl Fn(f64) -> SplitRule,
) {
    let p = scan.total.xtwt.len();
    let mut left = Stats::zeros(p);
    let mut lc = ClusterCounts::default();
    let mut rc = ClusterCounts::default();
    if track_clusters {
        order.iter().for_each(|&r| rc.add(cluster_of(r)));
    }
    for (pos, &r) in order.iter().enumerate() {
        let (xr, w, t) = scan.row_stats(r);
        left.add_row(&xr, w, t);
        if track_clusters {
            lc.add(cluster_of(r));
            rc.remove(cluster_of(r));
        }
        if pos + 1 == order.len() || key(order[pos + 1]) == key(r) {
            continue;
        }
        let cut = key(r);
        scan.consider(&left, lc.distinct(), rc.distinct(), || make_rule(cut));
    }
}

fn labels(names: &[String], codes: &[u32]) -> Vec<String> {
    codes.iter().filter_map(|&c| names.get(c as usize).cloned()).collect()
}

/// All bipartitions of the observed levels, the first level always left.
fn scan_bipartitions(
    scan: &mut Scan<'_>,
    levels: &[u32],
    names: &[String],
    by_level: &BTreeMap<u32, (Stats, Vec<u32>)>,
    track_clusters: bool,
) {
    let k = levels.len();
    let p = scan.total.xtwt.len();
    for mask in 0..(1u64 << (k - 1)) {
        // bit i set: level i + 1 goes left
        if mask == (1u64 << (k - 1)) - 1 {
            continue;
        }
        let goes_left = |i: usize| i == 0 || mask & (1 << (i - 1)) != 0;
        let mut left = Stats::zeros(p);
        let mut lc = ClusterCounts::default();
        let mut rc = ClusterCounts::default();
        for (i, level) in levels.iter().enumerate() {
            let (stats, clusters) = &by_level[level];
            if goes_left(i) {
                left.add(stats);
            }
            if track_clusters {
                let side = if goes_left(i) { &mut lc } else { &mut rc };
                clusters.iter().for_each(|&c| side.add(c));
            }
        }
        let rule = || SplitRule::Levels {
            left: (0..k).filter(|&i| goes_left(i)).filter_map(|i| names.get(levels[i] as usize).cloned()).collect(),
            right: (0..k).filter(|&i| !goes_left(i)).filter_map(|i| names.get(levels[i] as usize).cloned()).collect(),
        };
        scan.consider(&left, lc.distinct(), rc.distinct(), rule);
    }
}

/// Levels ordered by weighted mean working target.
fn order_by_mean(present: &[usize], level_of: &dyn Fn(usize) -> u32, input: &SplitInput<'_>, levels: &[u32]) -> Vec<u32> {
    let mut means: Vec<(u32, f64)> = levels
        .iter()
        .map(|&l| {
            let (t, w): (Vec<f64>, Vec<f64>) = present
                .iter()
                .filter(|&&r| level_of(r) == l)
                .map(|&r| (input.target[r], input.weights[r]))
                .unzip();
            (l, weighted_mean(&t, &w))
        })
        .collect();
    means.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
    means.into_iter().map(|(l, _)| l).collect()
}

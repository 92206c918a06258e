//! Recursive partitioning driver.
//!
//! Every node moves through the stages Fitting -> Testing -> Splitting or
//! Terminal. Fitting estimates the node's mixed model with the global
//! effects as a frozen offset; Testing checks the node size and runs the
//! instability tests; Splitting searches the split point of the selected
//! covariate and grows both children.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::data::dataset::Dataset;
use crate::data::frame::{Candidate, ModelFrame, ModelSpec, NodeDesign};
use crate::error::{FitError, MobError};
use crate::glmm::fit::{fit_mixed_model, FittedModel};
use crate::instability::split::{best_split, SplitConstraints, SplitInput};
use crate::instability::{select, test, CovariateTest, Functional, SplitCandidate, SplitRule, SupLmTable};
use crate::tree::node::{FailureKind, Node, NodeId, NodeStatus, Split, TruncationReason};
use crate::tree::partition::{GlobalEffects, PartitionTree};

use super::config::{GlobalStrategy, MobConfig, RankDeficiencyPolicy};
use super::global;

/// Shared node and time budget of one growth pass.
struct BudgetState {
    started: Instant,
    time_limit: Option<Duration>,
    max_nodes: Option<usize>,
    nodes: AtomicUsize,
}

impl BudgetState {
    fn new(config: &MobConfig, started: Instant) -> Self {
        Self {
            started,
            time_limit: config.budget.time_limit,
            max_nodes: config.budget.max_nodes,
            nodes: AtomicUsize::new(1),
        }
    }

    /// Reserve two child nodes; false when the budget is exhausted.
    fn try_reserve(&self) -> bool {
        if let Some(limit) = self.time_limit {
            if self.started.elapsed() > limit {
                return false;
            }
        }
        match self.max_nodes {
            Some(max) => self
                .nodes
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n + 2 <= max).then_some(n + 2))
                .is_ok(),
            None => {
                self.nodes.fetch_add(2, Ordering::SeqCst);
                true
            }
        }
    }
}

/// Split decided during growth, before arena ids exist.
struct GrownSplit {
    covariate: String,
    rule: SplitRule,
    majority_left: bool,
    left_label: String,
    right_label: String,
    objective: f64,
}

/// Recursively grown subtree.
struct Grown {
    depth: usize,
    rows: Vec<usize>,
    n_clusters: usize,
    model: Option<FittedModel>,
    status: NodeStatus,
    tests: Vec<CovariateTest>,
    children: Option<(GrownSplit, Box<Grown>, Box<Grown>)>,
}

enum Stage {
    Fitting,
    Testing {
        model: FittedModel,
        design: NodeDesign,
    },
    Splitting {
        model: FittedModel,
        tests: Vec<CovariateTest>,
        covariate: usize,
        split: SplitCandidate,
    },
    Terminal {
        model: Option<FittedModel>,
        status: NodeStatus,
        tests: Vec<CovariateTest>,
    },
}

struct Grower<'a, 'd> {
    frame: &'a ModelFrame<'d>,
    config: &'a MobConfig,
    table: Option<&'a SupLmTable>,
    offset: &'a [f64],
    budget: &'a BudgetState,
}

fn describe(candidate: &Candidate<'_>, rule: &SplitRule) -> (String, String) {
    match rule {
        SplitRule::Threshold { value } => (
            format!("{} <= {}", candidate.name, value),
            format!("{} > {}", candidate.name, value),
        ),
        SplitRule::Levels { left, right } => (
            format!("{} in {{{}}}", candidate.name, left.join(", ")),
            format!("{} in {{{}}}", candidate.name, right.join(", ")),
        ),
    }
}

impl Grower<'_, '_> {
    fn grow(&self, rows: Vec<usize>, depth: usize, path: String, warm: Option<&[f64]>) -> Result<Grown, MobError> {
        let config = self.config;
        let frame = self.frame;
        let n_clusters = frame.n_clusters(&rows);
        let mut stage = Stage::Fitting;

        loop {
            stage = match stage {
                Stage::Fitting if rows.len() <= frame.n_regressors() => {
                    debug!("[{}] terminal: {} rows cannot identify the node model", path, rows.len());
                    Stage::Terminal {
                        model: None,
                        status: NodeStatus::InsufficientNodeSize,
                        tests: Vec::new(),
                    }
                }

                Stage::Fitting => {
                    debug!("[{}] fitting: {} rows, {} clusters", path, rows.len(), n_clusters);
                    let design = frame.node_design(&rows, Some(self.offset), false);
                    match fit_mixed_model(&design, frame.family(), &config.fit, warm) {
                        Ok(model) => Stage::Testing { model, design },
                        Err(err @ FitError::RankDeficiency { .. }) => {
                            if config.rank_policy == RankDeficiencyPolicy::Abort {
                                return Err(MobError::NodeFit { path, source: err });
                            }
                            warn!("[{}] {}; node left unsplit", path, err);
                            Stage::Terminal {
                                model: None,
                                status: NodeStatus::Failed(FailureKind::from(&err)),
                                tests: Vec::new(),
                            }
                        }
                        Err(err) => {
                            warn!("[{}] {}", path, err);
                            let status = NodeStatus::Failed(FailureKind::from(&err));
                            let model = match err {
                                FitError::ConvergenceFailure { last, .. } => Some(*last),
                                _ => None,
                            };
                            Stage::Terminal {
                                model,
                                status,
                                tests: Vec::new(),
                            }
                        }
                    }
                }

                Stage::Testing { model, design } => {
                    let n = rows.len();
                    let clusters = frame.clusters_of(&rows);
                    let cluster_aware = config.test.cluster_aware && clusters.is_some();
                    let too_small = n < 2 * config.min_size
                        || (cluster_aware && n_clusters < 2 * config.min_clusters);
                    if too_small {
                        debug!("[{}] terminal: {} rows below the minimum node size", path, n);
                        Stage::Terminal {
                            model: Some(model),
                            status: NodeStatus::InsufficientNodeSize,
                            tests: Vec::new(),
                        }
                    } else {
                        let psi = model.scores(&design.x);
                        let tests = test(
                            &psi,
                            &rows,
                            frame.candidates(),
                            clusters.as_deref(),
                            &config.test,
                            self.table,
                        );
                        match select(&tests, config.alpha) {
                            None => {
                                debug!("[{}] terminal: no significant instability", path);
                                Stage::Terminal {
                                    model: Some(model),
                                    status: NodeStatus::NoAdmissibleSplit,
                                    tests,
                                }
                            }
                            Some(covariate) => {
                                let target: Vec<f64> = model
                                    .working_response
                                    .iter()
                                    .zip(model.random_offset.iter())
                                    .map(|(z, r)| z - r)
                                    .collect();
                                let input = SplitInput {
                                    rows: &rows,
                                    x: &design.x,
                                    target: &target,
                                    weights: &model.working_weights,
                                    clusters: if cluster_aware { clusters.as_deref() } else { None },
                                };
                                let constraints = SplitConstraints {
                                    min_size: config.min_size,
                                    min_clusters: cluster_aware.then_some(config.min_clusters),
                                    max_exhaustive_levels: config.max_exhaustive_levels,
                                    rank_tol: config.fit.rank_tol,
                                };
                                let candidate = &frame.candidates()[covariate];
                                match best_split(candidate, &input, constraints) {
                                    None => {
                                        debug!("[{}] terminal: no admissible split point on '{}'", path, candidate.name);
                                        Stage::Terminal {
                                            model: Some(model),
                                            status: NodeStatus::NoAdmissibleSplit,
                                            tests,
                                        }
                                    }
                                    Some(_) if depth >= config.max_depth => {
                                        debug!("[{}] truncated at depth {}", path, depth);
                                        Stage::Terminal {
                                            model: Some(model),
                                            status: NodeStatus::Truncated(TruncationReason::DepthLimit),
                                            tests,
                                        }
                                    }
                                    Some(_) if !self.budget.try_reserve() => {
                                        warn!("[{}] growth budget exhausted", path);
                                        Stage::Terminal {
                                            model: Some(model),
                                            status: NodeStatus::Truncated(TruncationReason::Budget),
                                            tests,
                                        }
                                    }
                                    Some(split) => Stage::Splitting {
                                        model,
                                        tests,
                                        covariate,
                                        split,
                                    },
                                }
                            }
                        }
                    }
                }

                Stage::Splitting {
                    model,
                    tests,
                    covariate,
                    split,
                } => {
                    let candidate = &frame.candidates()[covariate];
                    let (left_label, right_label) = describe(candidate, &split.rule);
                    debug!(
                        "[{}] split on {} ({} | {} rows)",
                        path,
                        left_label,
                        split.left.len(),
                        split.right.len()
                    );
                    let theta = model.theta.clone();
                    let SplitCandidate {
                        rule,
                        majority_left,
                        objective,
                        left,
                        right,
                    } = split;
                    let left_path = format!("{}/L", path);
                    let right_path = format!("{}/R", path);
                    // Node reservations race across threads, so a node cap forces sequential growth.
                    let (l, r) = if config.parallel && config.budget.max_nodes.is_none() {
                        rayon::join(
                            || self.grow(left, depth + 1, left_path, Some(&theta)),
                            || self.grow(right, depth + 1, right_path, Some(&theta)),
                        )
                    } else {
                        (
                            self.grow(left, depth + 1, left_path, Some(&theta)),
                            self.grow(right, depth + 1, right_path, Some(&theta)),
                        )
                    };
                    let grown_split = GrownSplit {
                        covariate: candidate.name.to_string(),
                        rule,
                        majority_left,
                        left_label,
                        right_label,
                        objective,
                    };
                    return Ok(Grown {
                        depth,
                        rows,
                        n_clusters,
                        model: Some(model),
                        status: NodeStatus::Split,
                        tests,
                        children: Some((grown_split, Box::new(l?), Box::new(r?))),
                    });
                }

                Stage::Terminal { model, status, tests } => {
                    return Ok(Grown {
                        depth,
                        rows,
                        n_clusters,
                        model,
                        status,
                        tests,
                        children: None,
                    });
                }
            };
        }
    }
}

/// Move a grown subtree into the arena in pre-order; returns its root id.
fn flatten(grown: Grown, nodes: &mut Vec<Node>) -> NodeId {
    let Grown {
        depth,
        rows,
        n_clusters,
        model,
        status,
        tests,
        children,
    } = grown;
    let id = nodes.len();
    nodes.push(Node {
        id,
        depth,
        rows,
        n_clusters,
        model,
        status,
        split: None,
        tests,
    });
    if let Some((s, l, r)) = children {
        let left = flatten(*l, nodes);
        let right = flatten(*r, nodes);
        nodes[id].split = Some(Split {
            covariate: s.covariate,
            rule: s.rule,
            majority_left: s.majority_left,
            left_label: s.left_label,
            right_label: s.right_label,
            objective: s.objective,
            left,
            right,
        });
    }
    id
}

fn leaf_rows<'g>(grown: &'g Grown, out: &mut Vec<&'g [usize]>) {
    match &grown.children {
        Some((_, l, r)) => {
            leaf_rows(l, out);
            leaf_rows(r, out);
        }
        None => out.push(&grown.rows),
    }
}

/// Fit a GLMM tree to `data` under `spec`.
pub fn fit_tree(data: &Dataset, spec: &ModelSpec, config: &MobConfig) -> Result<PartitionTree, MobError> {
    let started = Instant::now();
    let frame = ModelFrame::new(data, spec)?;
    let n_rows = data.n_rows();
    info!(
        "Growing tree: {} rows, {} candidate covariates, family {:?}",
        frame.rows().len(),
        frame.candidates().len(),
        spec.family
    );

    let table = match config.test.functional {
        Functional::SupLm => Some(SupLmTable::simulate(
            frame.n_regressors(),
            config.test.trim,
            config.test.replications,
            config.test.seed,
        )?),
        Functional::DoubleMax => None,
    };

    let grow_pass = |offset: &[f64], warm: Option<&[f64]>| {
        let budget = BudgetState::new(config, started);
        let grower = Grower {
            frame: &frame,
            config,
            table: table.as_ref(),
            offset,
            budget: &budget,
        };
        grower.grow(frame.rows().to_vec(), 0, "root".to_string(), warm)
    };

    // Global effects are settled before the final growth pass.
    let mut global: Option<(GlobalEffects, Vec<f64>)> = global::pretrain(&frame, config)?;
    if let (GlobalStrategy::Alternating { max_iter, tol }, Some((mut effects, mut theta))) =
        (config.global_strategy, global.take())
    {
        let mut converged = false;
        for round in 1..=max_iter {
            let offset = frame.global_offset(&effects.coefficients, n_rows);
            let grown = grow_pass(&offset, Some(&theta))?;
            let mut leaves = Vec::new();
            leaf_rows(&grown, &mut leaves);
            let mut leaf_of = vec![0; n_rows];
            for (k, rows) in leaves.iter().enumerate() {
                rows.iter().for_each(|&i| leaf_of[i] = k);
            }
            let labels: Vec<String> = (1..=leaves.len()).map(|k| format!("leaf{}", k)).collect();
            let (next, next_theta) = global::joint_update(&frame, config, &leaf_of, &labels, round, Some(&theta))?;
            let change = (next.log_likelihood - effects.log_likelihood).abs();
            debug!(
                "Alternating round {}: {} leaves, logLik {:.6} (change {:.3e})",
                round,
                leaves.len(),
                next.log_likelihood,
                change
            );
            effects = next;
            theta = next_theta;
            if change < tol {
                converged = true;
                break;
            }
        }
        if !converged {
            warn!("Alternating global estimation stopped after {} rounds", max_iter);
        }
        effects.converged = converged && effects.converged;
        global = Some((effects, theta));
    }

    let offset = match &global {
        Some((effects, _)) => frame.global_offset(&effects.coefficients, n_rows),
        None => vec![0.0; n_rows],
    };
    let warm = global.as_ref().map(|(_, theta)| theta.as_slice());
    let grown = grow_pass(&offset, warm)?;

    let mut nodes = Vec::new();
    flatten(grown, &mut nodes);
    let tree = PartitionTree::new(
        nodes,
        global.map(|(effects, _)| effects),
        spec.clone(),
        config.clone(),
        frame.n_excluded(),
    );
    info!(
        "Tree grown: {} nodes, {} leaves, depth {}{}, {:.2?}",
        tree.len(),
        tree.leaves().len(),
        tree.depth(),
        if tree.truncated() { " (truncated)" } else { "" },
        started.elapsed()
    );
    Ok(tree)
}

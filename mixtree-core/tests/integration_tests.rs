//! End-to-end tests of tree growing on simulated data.
//!
//! Every dataset is generated from a fixed seed, so the expected trees are
//! deterministic.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use statrs::distribution::Normal;
use tracing_subscriber::EnvFilter;

use mixtree_core::glmm::family::FamilyKind;
use mixtree_core::instability::SplitRule;
use mixtree_core::mob::{GlobalStrategy, MobConfig};
use mixtree_core::model::{decode_tree, encode_tree};
use mixtree_core::tree::NodeStatus;
use mixtree_core::{fit_tree, Dataset, ModelSpec, PartitionTree, RandomEffects, TreeReport};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_test_writer()
        .try_init();
}

fn normal() -> Normal {
    Normal::new(0.0, 1.0).unwrap()
}

/// Threshold of the root split, panicking if the root is not split on a
/// numeric covariate.
fn root_threshold(tree: &PartitionTree) -> f64 {
    match &tree.root().split.as_ref().expect("root is not split").rule {
        SplitRule::Threshold { value } => *value,
        other => panic!("unexpected rule {:?}", other),
    }
}

/// Random-intercept data with an intercept shift of `shift` at z = 0.5.
fn clustered_shift(seed: u64, m: usize, k: usize, shift: f64) -> Dataset {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let n = m * k;
    let b: Vec<f64> = (0..m).map(|_| 0.5 * rng.sample(normal())).collect();
    let z: Vec<f64> = (0..n).map(|_| rng.gen::<f64>()).collect();
    let noise: Vec<f64> = (0..n).map(|_| 0.3 * rng.sample(normal())).collect();
    let y: Vec<f64> = (0..n)
        .map(|i| (if z[i] <= 0.5 { 0.0 } else { shift }) + b[i / k] + noise[i])
        .collect();
    Dataset::new()
        .with_numeric("y", y)
        .unwrap()
        .with_numeric("z", z)
        .unwrap()
        .with_identifier("id", (0..n).map(|i| format!("c{}", i / k)))
        .unwrap()
}

fn clustered_spec() -> ModelSpec {
    ModelSpec {
        response: "y".into(),
        random: Some(RandomEffects::intercept("id")),
        partitioning: vec!["z".into()],
        ..ModelSpec::default()
    }
}

/// y = slope(z) * x + noise with slope 1 below z = 0.5 and -1 above.
fn slope_change(seed: u64, n: usize, slope_right: f64) -> Dataset {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let x: Vec<f64> = (0..n).map(|_| rng.gen_range(-1.0..1.0)).collect();
    let z: Vec<f64> = (0..n).map(|_| rng.gen::<f64>()).collect();
    let y: Vec<f64> = (0..n)
        .map(|i| {
            let slope = if z[i] < 0.5 { 1.0 } else { slope_right };
            slope * x[i] + 0.1 * rng.sample(normal())
        })
        .collect();
    Dataset::new()
        .with_numeric("y", y)
        .unwrap()
        .with_numeric("x", x)
        .unwrap()
        .with_numeric("z", z)
        .unwrap()
}

fn slope_spec() -> ModelSpec {
    ModelSpec {
        response: "y".into(),
        regressors: vec!["x".into()],
        partitioning: vec!["z".into()],
        ..ModelSpec::default()
    }
}

fn strict() -> MobConfig {
    MobConfig {
        alpha: 0.01,
        ..MobConfig::default()
    }
}

mod partitioning {
    use super::*;

    #[test]
    fn test_leaves_partition_all_rows() {
        init_tracing();
        let data = clustered_shift(11, 40, 10, 2.0);
        let tree = fit_tree(&data, &clustered_spec(), &MobConfig::default()).unwrap();

        let visited: Vec<usize> = tree.pre_order().map(|n| n.id).collect();
        let mut sorted = visited.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), tree.len(), "pre-order must visit each node once");
        assert_eq!(visited.len(), tree.len());

        let mut owner = vec![None; data.n_rows()];
        for leaf in tree.leaves() {
            for &row in &leaf.rows {
                assert!(owner[row].is_none(), "row {} in two leaves", row);
                owner[row] = Some(leaf.id);
            }
        }
        assert!(owner.iter().all(Option::is_some));

        let total: usize = tree.leaves().iter().map(|n| n.n_obs()).sum();
        assert_eq!(total, tree.root().n_obs());
        assert_eq!(total, data.n_rows());
    }

    #[test]
    fn test_children_split_parent_rows() {
        let data = slope_change(12, 500, -1.0);
        let tree = fit_tree(&data, &slope_spec(), &MobConfig::default()).unwrap();
        for node in tree.nodes() {
            if let Some(split) = &node.split {
                let left = tree.node(split.left).unwrap();
                let right = tree.node(split.right).unwrap();
                assert_eq!(left.n_obs() + right.n_obs(), node.n_obs());
                assert_eq!(left.depth, node.depth + 1);
                assert_eq!(node.status, NodeStatus::Split);
            } else {
                assert!(node.status.is_terminal());
            }
        }
    }

    #[test]
    fn test_fewer_rows_than_min_size() {
        let data = slope_change(13, 15, -1.0);
        let tree = fit_tree(&data, &slope_spec(), &MobConfig::default()).unwrap();
        assert_eq!(tree.len(), 1);
        assert!(tree.root().is_leaf());
        assert_eq!(tree.root().status, NodeStatus::InsufficientNodeSize);
        assert!(tree.root().model.is_some());
    }

    #[test]
    fn test_missing_values() {
        let mut data = slope_change(14, 300, -1.0);
        let mut x = data.numeric("x").unwrap().to_vec();
        let mut z = data.numeric("z").unwrap().to_vec();
        x[3] = f64::NAN;
        x[4] = f64::NAN;
        z[10] = f64::NAN;
        let y = data.numeric("y").unwrap().to_vec();
        data = Dataset::new()
            .with_numeric("y", y)
            .unwrap()
            .with_numeric("x", x)
            .unwrap()
            .with_numeric("z", z)
            .unwrap();

        let tree = fit_tree(&data, &slope_spec(), &strict()).unwrap();
        assert_eq!(tree.n_excluded(), 2);
        assert_eq!(tree.root().n_obs(), 298);
        assert!(!tree.root().rows.contains(&3));

        // A missing partitioning value keeps the row and follows the larger child.
        let split = tree.root().split.as_ref().unwrap();
        let larger = if split.majority_left { split.left } else { split.right };
        let leaf = tree.route(&data, 10).unwrap();
        let mut id = larger;
        while let Some(s) = &tree.node(id).unwrap().split {
            id = if s.majority_left { s.left } else { s.right };
        }
        assert_eq!(leaf, id);
    }
}

mod scenarios {
    use super::*;

    #[test]
    fn test_recovers_slope_change() {
        init_tracing();
        let data = slope_change(21, 500, -1.0);
        let tree = fit_tree(&data, &slope_spec(), &strict()).unwrap();
        assert_eq!(tree.len(), 3, "{}", TreeReport::new(&tree));
        assert!((root_threshold(&tree) - 0.5).abs() < 0.05);
        assert_eq!(tree.root().split.as_ref().unwrap().covariate, "z");

        let slopes: Vec<f64> = tree
            .leaf_models()
            .iter()
            .map(|(_, m)| m.coefficient("x").unwrap())
            .collect();
        assert!((slopes[0] - 1.0).abs() < 0.1, "left slope {}", slopes[0]);
        assert!((slopes[1] + 1.0).abs() < 0.1, "right slope {}", slopes[1]);
    }

    #[test]
    fn test_no_structure_rarely_splits() {
        // Nominal 95% unsplit at alpha = 0.05; allow three Monte Carlo
        // standard errors (sqrt(0.95 * 0.05 / 200) ~ 0.015): 181 of 200.
        let reps = 200;
        let unsplit = (0..reps)
            .filter(|&r| {
                let data = slope_change(1000 + r, 500, 1.0);
                let tree = fit_tree(&data, &slope_spec(), &MobConfig::default()).unwrap();
                tree.len() == 1
            })
            .count();
        assert!(unsplit >= 181, "only {} of {} null fits unsplit", unsplit, reps);
    }

    #[test]
    fn test_random_intercept_shift() {
        let data = clustered_shift(22, 50, 10, 2.0);
        let tree = fit_tree(&data, &clustered_spec(), &strict()).unwrap();
        assert_eq!(tree.len(), 3);
        assert!((root_threshold(&tree) - 0.5).abs() < 0.05);
        for (_, model) in tree.leaf_models() {
            assert_eq!(model.re_covariance.len(), 1);
            assert!(model.re_variances()[0] > 0.05);
        }
        let means: Vec<f64> = tree
            .leaf_models()
            .iter()
            .map(|(_, m)| m.coefficient("(Intercept)").unwrap())
            .collect();
        assert!((means[1] - means[0] - 2.0).abs() < 0.3);
    }

    #[test]
    fn test_random_slope_tree() {
        init_tracing();
        let mut rng = ChaCha8Rng::seed_from_u64(24);
        let (m, k) = (50, 10);
        let n = m * k;
        let b0: Vec<f64> = (0..m).map(|_| 0.5 * rng.sample(normal())).collect();
        let b1: Vec<f64> = (0..m).map(|_| 0.3 * rng.sample(normal())).collect();
        let x: Vec<f64> = (0..n).map(|_| rng.gen_range(-1.0..1.0)).collect();
        let z: Vec<f64> = (0..n).map(|_| rng.gen::<f64>()).collect();
        let y: Vec<f64> = (0..n)
            .map(|i| {
                let slope = if z[i] <= 0.5 { 1.0 } else { -1.0 };
                1.0 + b0[i / k] + (slope + b1[i / k]) * x[i] + 0.3 * rng.sample(normal())
            })
            .collect();
        let data = Dataset::new()
            .with_numeric("y", y)
            .unwrap()
            .with_numeric("x", x)
            .unwrap()
            .with_numeric("z", z)
            .unwrap()
            .with_identifier("id", (0..n).map(|i| format!("c{}", i / k)))
            .unwrap();
        let spec = ModelSpec {
            response: "y".into(),
            regressors: vec!["x".into()],
            random: Some(RandomEffects {
                grouping: "id".into(),
                intercept: true,
                slopes: vec!["x".into()],
            }),
            partitioning: vec!["z".into()],
            ..ModelSpec::default()
        };
        let tree = fit_tree(&data, &spec, &strict()).unwrap();
        assert_eq!(tree.len(), 3, "{}", TreeReport::new(&tree));
        assert!((root_threshold(&tree) - 0.5).abs() < 0.05);

        let slopes: Vec<f64> = tree
            .leaf_models()
            .iter()
            .map(|(_, m)| m.coefficient("x").unwrap())
            .collect();
        assert!((slopes[0] - 1.0).abs() < 0.25, "left slope {}", slopes[0]);
        assert!((slopes[1] + 1.0).abs() < 0.25, "right slope {}", slopes[1]);
        for (_, model) in tree.leaf_models() {
            assert_eq!(model.re_covariance.len(), 2);
            assert_eq!(model.re_covariance[0].len(), 2);
            assert!((model.re_covariance[0][1] - model.re_covariance[1][0]).abs() < 1e-10);
        }
    }

    #[test]
    fn test_binomial_tree() {
        let mut rng = ChaCha8Rng::seed_from_u64(23);
        let (m, k) = (60, 10);
        let n = m * k;
        let b: Vec<f64> = (0..m).map(|_| 0.5 * rng.sample(normal())).collect();
        let z: Vec<f64> = (0..n).map(|_| rng.gen::<f64>()).collect();
        let y: Vec<f64> = (0..n)
            .map(|i| {
                let eta = (if z[i] <= 0.5 { -1.5 } else { 1.5 }) + b[i / k];
                let p = 1.0 / (1.0 + (-eta).exp());
                if rng.gen::<f64>() < p { 1.0 } else { 0.0 }
            })
            .collect();
        let data = Dataset::new()
            .with_numeric("y", y)
            .unwrap()
            .with_numeric("z", z)
            .unwrap()
            .with_identifier("id", (0..n).map(|i| format!("c{}", i / k)))
            .unwrap();
        let spec = ModelSpec {
            family: FamilyKind::Binomial,
            ..clustered_spec()
        };
        let tree = fit_tree(&data, &spec, &strict()).unwrap();
        assert!((root_threshold(&tree) - 0.5).abs() < 0.1);
        for (_, model) in tree.leaf_models() {
            assert_eq!(model.family, FamilyKind::Binomial);
            assert_eq!(model.dispersion, 1.0);
            assert!(model.fitted.iter().all(|&p| p > 0.0 && p < 1.0));
        }
        let left = tree.node(tree.root().split.as_ref().unwrap().left).unwrap();
        let right = tree.node(tree.root().split.as_ref().unwrap().right).unwrap();
        let intercept = |id| tree.node(id).unwrap().model.as_ref().unwrap().coefficient("(Intercept)").unwrap();
        assert!(intercept(left.id) < 0.0);
        assert!(intercept(right.id) > 0.0);
    }
}

mod clusters {
    use super::*;

    /// Strong cluster effect, covariate `w` constant within cluster, no
    /// random effect in the node model.
    fn pseudo_replicated(seed: u64) -> Dataset {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let (m, k) = (30, 10);
        let n = m * k;
        let b: Vec<f64> = (0..m).map(|_| 2.0 * rng.sample(normal())).collect();
        let w: Vec<f64> = (0..m).map(|_| rng.gen::<f64>()).collect();
        let y: Vec<f64> = (0..n).map(|i| b[i / k] + 0.3 * rng.sample(normal())).collect();
        Dataset::new()
            .with_numeric("y", y)
            .unwrap()
            .with_numeric("w", (0..n).map(|i| w[i / k]).collect())
            .unwrap()
            .with_identifier("id", (0..n).map(|i| format!("c{}", i / k)))
            .unwrap()
    }

    #[test]
    fn test_cluster_aware_p_value_not_smaller() {
        init_tracing();
        let spec = ModelSpec {
            response: "y".into(),
            partitioning: vec!["w".into()],
            cluster: Some("id".into()),
            ..ModelSpec::default()
        };
        for seed in 0..5 {
            let data = pseudo_replicated(seed);
            let mut aware = MobConfig {
                max_depth: 0,
                ..MobConfig::default()
            };
            aware.test.cluster_aware = true;
            let mut naive = aware.clone();
            naive.test.cluster_aware = false;

            let p_aware = fit_tree(&data, &spec, &aware).unwrap().root().tests[0].p_value;
            let p_naive = fit_tree(&data, &spec, &naive).unwrap().root().tests[0].p_value;
            assert!(
                p_aware >= p_naive,
                "seed {}: cluster-aware p {} below naive p {}",
                seed,
                p_aware,
                p_naive
            );
        }
    }
}

mod determinism {
    use super::*;

    #[test]
    fn test_identical_runs() {
        let data = clustered_shift(31, 40, 10, 2.0);
        let first = fit_tree(&data, &clustered_spec(), &MobConfig::default()).unwrap();
        let second = fit_tree(&data, &clustered_spec(), &MobConfig::default()).unwrap();
        assert_eq!(first, second);

        let parallel = MobConfig {
            parallel: true,
            ..MobConfig::default()
        };
        let third = fit_tree(&data, &clustered_spec(), &parallel).unwrap();
        assert_eq!(first.nodes(), third.nodes());
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let data = slope_change(32, 400, -1.0);
        let tree = fit_tree(&data, &slope_spec(), &strict()).unwrap();
        let decoded = decode_tree(&encode_tree(&tree).unwrap()).unwrap();
        assert_eq!(decoded, tree);
        for row in 0..data.n_rows() {
            assert_eq!(decoded.route(&data, row).unwrap(), tree.route(&data, row).unwrap());
        }
    }
}

mod global_effects {
    use super::*;

    /// Intercept shift on z plus a global effect of 1.5 on w.
    fn with_global(seed: u64) -> Dataset {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let (m, k) = (40, 10);
        let n = m * k;
        let b: Vec<f64> = (0..m).map(|_| 0.5 * rng.sample(normal())).collect();
        let z: Vec<f64> = (0..n).map(|_| rng.gen::<f64>()).collect();
        let w: Vec<f64> = (0..n).map(|_| rng.sample(normal())).collect();
        let y: Vec<f64> = (0..n)
            .map(|i| (if z[i] <= 0.5 { 0.0 } else { 2.0 }) + 1.5 * w[i] + b[i / k] + 0.3 * rng.sample(normal()))
            .collect();
        Dataset::new()
            .with_numeric("y", y)
            .unwrap()
            .with_numeric("z", z)
            .unwrap()
            .with_numeric("w", w)
            .unwrap()
            .with_identifier("id", (0..n).map(|i| format!("c{}", i / k)))
            .unwrap()
    }

    fn spec() -> ModelSpec {
        ModelSpec {
            global: vec!["w".into()],
            ..clustered_spec()
        }
    }

    #[test]
    fn test_pretrained_global_effect() {
        let data = with_global(41);
        let tree = fit_tree(&data, &spec(), &strict()).unwrap();
        let global = tree.global().unwrap();
        assert_eq!(global.names, vec!["w".to_string()]);
        assert_eq!(global.iterations, 0);
        // Pretraining ignores the shift, so only a loose bound holds.
        assert!((global.coefficients[0] - 1.5).abs() < 0.3);
        assert!(tree.len() >= 3);
        for (_, model) in tree.leaf_models() {
            assert!(model.coefficient("w").is_none());
        }
    }

    #[test]
    fn test_alternating_global_effect() {
        init_tracing();
        let data = with_global(42);
        let config = MobConfig {
            global_strategy: GlobalStrategy::Alternating { max_iter: 10, tol: 1e-6 },
            ..strict()
        };
        let tree = fit_tree(&data, &spec(), &config).unwrap();
        let global = tree.global().unwrap();
        assert!(global.iterations >= 1);
        assert!(global.converged);
        assert!((global.coefficients[0] - 1.5).abs() < 0.1, "gamma {}", global.coefficients[0]);
        assert_eq!(tree.len(), 3);
        assert!((root_threshold(&tree) - 0.5).abs() < 0.05);

        // Predictions add the global effect to the leaf's fixed effects.
        let leaf = tree.route(&data, 0).unwrap();
        let model = tree.node(leaf).unwrap().model.as_ref().unwrap();
        let expected = model.coefficient("(Intercept)").unwrap() + global.coefficients[0] * data.numeric("w").unwrap()[0];
        assert!((tree.predict(&data, 0).unwrap() - expected).abs() < 1e-12);
    }
}

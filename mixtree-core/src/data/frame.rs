//! Model specification and the validated view of a dataset it induces.
//!
//! A [`ModelFrame`] resolves every column named by a [`ModelSpec`], drops
//! rows with missing model values and builds per-node designs from row
//! subsets. It borrows the dataset and never copies it.

use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use mixtree_linalg::DenseMatrix;

use super::dataset::{Column, Dataset};
use crate::glmm::family::{Family, FamilyKind};

/// Name of the intercept column in coefficient tables.
pub const INTERCEPT: &str = "(Intercept)";

/// Random-effect structure: one grouping factor with an optional random
/// intercept and random slopes on numeric columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RandomEffects {
    pub grouping: String,
    pub intercept: bool,
    pub slopes: Vec<String>,
}

impl RandomEffects {
    /// Random intercept only.
    pub fn intercept(grouping: &str) -> Self {
        Self {
            grouping: grouping.to_string(),
            intercept: true,
            slopes: Vec::new(),
        }
    }
}

/// What to model: response, node regressors, global covariates, random
/// effects and the candidate partitioning covariates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSpec {
    pub response: String,
    /// Node-specific fixed effects (estimated per tree node).
    pub regressors: Vec<String>,
    pub intercept: bool,
    /// Fixed effects shared by all nodes.
    pub global: Vec<String>,
    pub random: Option<RandomEffects>,
    pub partitioning: Vec<String>,
    /// Cluster column for the instability tests. Defaults to the random-effect grouping.
    pub cluster: Option<String>,
    pub family: FamilyKind,
}

impl Default for ModelSpec {
    fn default() -> Self {
        Self {
            response: String::new(),
            regressors: Vec::new(),
            intercept: true,
            global: Vec::new(),
            random: None,
            partitioning: Vec::new(),
            cluster: None,
            family: FamilyKind::Gaussian,
        }
    }
}

/// Kind of a partitioning covariate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CovariateKind {
    Numeric,
    Ordered,
    Unordered,
}

/// A candidate partitioning covariate resolved against the dataset.
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    pub name: &'a str,
    pub kind: CovariateKind,
    column: &'a Column,
}

impl<'a> Candidate<'a> {
    /// Classify a dataset column as a partitioning covariate.
    pub fn from_column(name: &'a str, column: &'a Column) -> Self {
        let kind = match column {
            Column::Numeric(_) => CovariateKind::Numeric,
            Column::Categorical { ordered: true, .. } => CovariateKind::Ordered,
            Column::Categorical { .. } | Column::Identifier { .. } => CovariateKind::Unordered,
        };
        Self { name, kind, column }
    }

    /// Value used for ordering: the number itself, or the level code of an
    /// ordered factor. `None` when missing.
    pub fn ordinal(&self, row: usize) -> Option<f64> {
        match self.column {
            Column::Numeric(v) => Some(v[row]).filter(|x| x.is_finite()),
            Column::Categorical { codes, .. } => codes[row].map(|c| c as f64),
            Column::Identifier { codes, .. } => codes[row].map(|c| c as f64),
        }
    }

    /// Level code of a categorical value. `None` for numerics or missing.
    pub fn level(&self, row: usize) -> Option<u32> {
        match self.column {
            Column::Categorical { codes, .. } | Column::Identifier { codes, .. } => codes[row],
            Column::Numeric(_) => None,
        }
    }

    pub fn levels(&self) -> &'a [String] {
        match self.column {
            Column::Categorical { levels, .. } => levels,
            Column::Identifier { labels, .. } => labels,
            Column::Numeric(_) => &[],
        }
    }
}

/// Design for one mixed-model fit over a subset of rows.
#[derive(Debug, Clone)]
pub struct NodeDesign {
    /// Dataset row of every design row.
    pub rows: Vec<usize>,
    pub x: DenseMatrix,
    pub coef_names: Vec<String>,
    /// Random-effect matrix; zero columns when there is no grouping.
    pub z: DenseMatrix,
    pub re_names: Vec<String>,
    /// Local cluster index of every row (empty without random effects).
    pub groups: Vec<usize>,
    pub group_labels: Vec<String>,
    pub y: Vec<f64>,
    /// Fixed offset on the linear-predictor scale.
    pub offset: Vec<f64>,
}

impl NodeDesign {
    pub fn n_obs(&self) -> usize {
        self.rows.len()
    }
}

/// Validated, borrowed view of a dataset under a model specification.
#[derive(Debug)]
pub struct ModelFrame<'a> {
    spec: &'a ModelSpec,
    family: Family,
    rows: Vec<usize>,
    n_excluded: usize,
    response: &'a [f64],
    regressors: Vec<&'a [f64]>,
    global: Vec<&'a [f64]>,
    slopes: Vec<&'a [f64]>,
    grouping: Option<(&'a [Option<u32>], &'a [String])>,
    clusters: Option<&'a [Option<u32>]>,
    candidates: Vec<Candidate<'a>>,
}

fn numeric_columns<'a>(data: &'a Dataset, names: &[String], role: &str) -> Result<Vec<&'a [f64]>> {
    names
        .iter()
        .map(|n| data.numeric(n).with_context(|| format!("{} column '{}'", role, n)))
        .collect()
}

fn coded_column<'a>(data: &'a Dataset, name: &str) -> Result<(&'a [Option<u32>], &'a [String])> {
    match data.column(name)? {
        Column::Identifier { labels, codes } => Ok((codes, labels)),
        Column::Categorical { levels, codes, .. } => Ok((codes, levels)),
        other => bail!("Grouping column '{}' is {}, expected identifier or categorical", name, other.kind()),
    }
}

impl<'a> ModelFrame<'a> {
    /// Resolve `spec` against `data`.
    ///
    /// Rows with a missing response, regressor, global covariate or slope
    /// are excluded (and counted). A missing grouping or cluster identifier
    /// on a retained row is an error.
    pub fn new(data: &'a Dataset, spec: &'a ModelSpec) -> Result<Self> {
        let family = Family::new(spec.family);
        let response = data
            .numeric(&spec.response)
            .with_context(|| format!("response column '{}'", spec.response))?;
        let regressors = numeric_columns(data, &spec.regressors, "regressor")?;
        let global = numeric_columns(data, &spec.global, "global")?;
        let (slopes, grouping) = match &spec.random {
            Some(re) => {
                if !re.intercept && re.slopes.is_empty() {
                    bail!("Random-effect specification for '{}' has no terms", re.grouping);
                }
                (
                    numeric_columns(data, &re.slopes, "random slope")?,
                    Some(coded_column(data, &re.grouping)?),
                )
            }
            None => (Vec::new(), None),
        };
        if !spec.intercept && spec.regressors.is_empty() {
            bail!("Model has no node-specific fixed effects");
        }

        let cluster_name = spec
            .cluster
            .as_deref()
            .or_else(|| spec.random.as_ref().map(|r| r.grouping.as_str()));
        let clusters = match cluster_name {
            Some(name) => Some(coded_column(data, name)?.0),
            None => None,
        };

        let mut candidates = Vec::with_capacity(spec.partitioning.len());
        for name in &spec.partitioning {
            candidates.push(Candidate::from_column(name, data.column(name)?));
        }

        let mut rows = Vec::with_capacity(data.n_rows());
        for i in 0..data.n_rows() {
            let complete = response[i].is_finite()
                && regressors.iter().all(|c| c[i].is_finite())
                && global.iter().all(|c| c[i].is_finite())
                && slopes.iter().all(|c| c[i].is_finite());
            if complete {
                rows.push(i);
            }
        }
        let n_excluded = data.n_rows() - rows.len();
        if n_excluded > 0 {
            warn!("Excluded {} rows with missing model values", n_excluded);
        }
        if rows.is_empty() {
            bail!("No complete rows remain for the model");
        }

        if let Some((codes, _)) = grouping {
            if let Some(&i) = rows.iter().find(|&&i| codes[i].is_none()) {
                bail!("Missing grouping identifier at row {}", i);
            }
        }
        if let Some(codes) = clusters {
            if let Some(&i) = rows.iter().find(|&&i| codes[i].is_none()) {
                bail!("Missing cluster identifier at row {}", i);
            }
        }

        let y: Vec<f64> = rows.iter().map(|&i| response[i]).collect();
        family
            .validate_response(&y)
            .map_err(|e| anyhow::anyhow!("Response '{}': {}", spec.response, e))?;

        info!(
            "Model frame: {} rows, {} regressors, {} global, {} candidates",
            rows.len(),
            regressors.len() + spec.intercept as usize,
            global.len(),
            candidates.len()
        );

        Ok(Self {
            spec,
            family,
            rows,
            n_excluded,
            response,
            regressors,
            global,
            slopes,
            grouping,
            clusters,
            candidates,
        })
    }

    pub fn spec(&self) -> &ModelSpec {
        self.spec
    }

    pub fn family(&self) -> &Family {
        &self.family
    }

    /// Retained dataset rows, ascending.
    pub fn rows(&self) -> &[usize] {
        &self.rows
    }

    pub fn n_excluded(&self) -> usize {
        self.n_excluded
    }

    pub fn candidates(&self) -> &[Candidate<'a>] {
        &self.candidates
    }

    /// Names of the node-specific coefficients.
    pub fn regressor_names(&self) -> Vec<String> {
        let mut names = Vec::with_capacity(self.regressors.len() + 1);
        if self.spec.intercept {
            names.push(INTERCEPT.to_string());
        }
        names.extend(self.spec.regressors.iter().cloned());
        names
    }

    pub fn n_regressors(&self) -> usize {
        self.regressors.len() + self.spec.intercept as usize
    }

    /// Test-cluster code of every row in `rows`, when clusters are defined.
    pub fn clusters_of(&self, rows: &[usize]) -> Option<Vec<u32>> {
        self.clusters
            .map(|codes| rows.iter().map(|&i| codes[i].unwrap_or(u32::MAX)).collect())
    }

    /// Number of distinct test clusters among `rows` (rows when no clusters).
    pub fn n_clusters(&self, rows: &[usize]) -> usize {
        match self.clusters_of(rows) {
            Some(mut c) => {
                c.sort_unstable();
                c.dedup();
                c.len()
            }
            None => rows.len(),
        }
    }

    /// Node regressor row `i`.
    fn regressor_row(&self, i: usize) -> impl Iterator<Item = f64> + '_ {
        let intercept = if self.spec.intercept { Some(1.0) } else { None };
        intercept.into_iter().chain(self.regressors.iter().map(move |c| c[i]))
    }

    /// Linear predictor contribution of the global covariates, per dataset row.
    pub fn global_offset(&self, gamma: &[f64], n_rows: usize) -> Vec<f64> {
        let mut offset = vec![0.0; n_rows];
        for &i in &self.rows {
            offset[i] = self.global.iter().zip(gamma.iter()).map(|(c, g)| c[i] * g).sum();
        }
        offset
    }

    pub fn global_names(&self) -> &[String] {
        &self.spec.global
    }

    fn random_part(&self, rows: &[usize]) -> (DenseMatrix, Vec<String>, Vec<usize>, Vec<String>) {
        let n = rows.len();
        let Some((codes, labels)) = self.grouping else {
            return (DenseMatrix::zeros(n, 0), Vec::new(), Vec::new(), Vec::new());
        };
        // Clusters in ascending code order for stable output.
        let mut local: BTreeMap<u32, usize> = BTreeMap::new();
        for &i in rows {
            if let Some(c) = codes[i] {
                local.entry(c).or_insert(0);
            }
        }
        for (k, v) in local.values_mut().enumerate() {
            *v = k;
        }
        let groups = rows
            .iter()
            .map(|&i| codes[i].and_then(|c| local.get(&c).copied()).unwrap_or(0))
            .collect();
        let group_labels = local.keys().map(|&c| labels[c as usize].clone()).collect();

        let re = self.spec.random.as_ref();
        let intercept = re.map(|r| r.intercept).unwrap_or(false);
        let mut re_names = Vec::new();
        if intercept {
            re_names.push(INTERCEPT.to_string());
        }
        if let Some(r) = re {
            re_names.extend(r.slopes.iter().cloned());
        }
        let q = re_names.len();
        let z = DenseMatrix::from_fn(n, q, |r, k| {
            if intercept && k == 0 {
                1.0
            } else {
                self.slopes[k - intercept as usize][rows[r]]
            }
        });
        (z, re_names, groups, group_labels)
    }

    /// Design over `rows` with node regressors (and, when `include_global`,
    /// the global covariates appended) and an optional per-dataset-row offset.
    pub fn node_design(&self, rows: &[usize], offset: Option<&[f64]>, include_global: bool) -> NodeDesign {
        let n = rows.len();
        let mut coef_names = self.regressor_names();
        if include_global {
            coef_names.extend(self.spec.global.iter().cloned());
        }
        let p = coef_names.len();
        let mut data = Vec::with_capacity(n * p);
        for &i in rows {
            data.extend(self.regressor_row(i));
            if include_global {
                data.extend(self.global.iter().map(|c| c[i]));
            }
        }
        let x = DenseMatrix::from_row_major(n, p, &data);
        let (z, re_names, groups, group_labels) = self.random_part(rows);
        NodeDesign {
            rows: rows.to_vec(),
            x,
            coef_names,
            z,
            re_names,
            groups,
            group_labels,
            y: rows.iter().map(|&i| self.response[i]).collect(),
            offset: match offset {
                Some(o) => rows.iter().map(|&i| o[i]).collect(),
                None => vec![0.0; n],
            },
        }
    }

    /// Joint design over all retained rows: one block of node regressors per
    /// leaf (zero outside that leaf) followed by the global covariates.
    /// `leaf_of` maps each dataset row to the position of its leaf in `labels`.
    pub fn joint_design(&self, leaf_of: &[usize], labels: &[String]) -> NodeDesign {
        let rows = &self.rows;
        let n = rows.len();
        let k = self.n_regressors();
        let names = self.regressor_names();
        let mut coef_names = Vec::with_capacity(labels.len() * k + self.global.len());
        for label in labels {
            coef_names.extend(names.iter().map(|c| format!("{}:{}", label, c)));
        }
        coef_names.extend(self.spec.global.iter().cloned());
        let p = coef_names.len();

        let mut data = vec![0.0; n * p];
        for (r, &i) in rows.iter().enumerate() {
            let base = r * p + leaf_of[i] * k;
            for (j, v) in self.regressor_row(i).enumerate() {
                data[base + j] = v;
            }
            for (g, c) in self.global.iter().enumerate() {
                data[r * p + labels.len() * k + g] = c[i];
            }
        }
        let x = DenseMatrix::from_row_major(n, p, &data);
        let (z, re_names, groups, group_labels) = self.random_part(rows);
        NodeDesign {
            rows: rows.clone(),
            x,
            coef_names,
            z,
            re_names,
            groups,
            group_labels,
            y: rows.iter().map(|&i| self.response[i]).collect(),
            offset: vec![0.0; n],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data() -> Dataset {
        Dataset::new()
            .with_numeric("y", vec![1.0, 2.0, 3.0, f64::NAN, 5.0, 6.0])
            .unwrap()
            .with_numeric("x", vec![0.1, 0.2, 0.3, 0.4, 0.5, 0.6])
            .unwrap()
            .with_numeric("age", vec![30.0, 40.0, 50.0, 60.0, 70.0, 80.0])
            .unwrap()
            .with_identifier("id", ["b", "a", "b", "a", "c", "c"])
            .unwrap()
            .with_categorical("arm", ["t", "c", "t", "c", "NA", "t"])
            .unwrap()
    }

    fn spec() -> ModelSpec {
        ModelSpec {
            response: "y".into(),
            regressors: vec!["x".into()],
            global: vec!["age".into()],
            random: Some(RandomEffects::intercept("id")),
            partitioning: vec!["age".into(), "arm".into()],
            ..ModelSpec::default()
        }
    }

    #[test]
    fn test_missing_response_rows_excluded() {
        let data = data();
        let spec = spec();
        let frame = ModelFrame::new(&data, &spec).unwrap();
        assert_eq!(frame.rows(), &[0, 1, 2, 4, 5]);
        assert_eq!(frame.n_excluded(), 1);
        assert_eq!(frame.candidates()[0].kind, CovariateKind::Numeric);
        assert_eq!(frame.candidates()[1].kind, CovariateKind::Unordered);
        // partitioning values may be missing
        assert_eq!(frame.candidates()[1].level(4), None);
    }

    #[test]
    fn test_node_design_layout() {
        let data = data();
        let spec = spec();
        let frame = ModelFrame::new(&data, &spec).unwrap();
        let offset = frame.global_offset(&[0.5], data.n_rows());
        let d = frame.node_design(&[0, 1, 2], Some(&offset), false);
        assert_eq!(d.coef_names, vec![INTERCEPT, "x"]);
        assert_eq!(d.x.get(2, 1), 0.3);
        assert_eq!(d.offset, vec![15.0, 20.0, 25.0]);
        // "a" has code 1, "b" code 0: ascending code order
        assert_eq!(d.group_labels, vec!["b", "a"]);
        assert_eq!(d.groups, vec![0, 1, 0]);
        assert_eq!(d.z.ncols(), 1);

        let g = frame.node_design(&[0, 1], None, true);
        assert_eq!(g.coef_names, vec![INTERCEPT, "x", "age"]);
        assert_eq!(g.x.get(1, 2), 40.0);
    }

    #[test]
    fn test_joint_design_blocks() {
        let data = data();
        let spec = spec();
        let frame = ModelFrame::new(&data, &spec).unwrap();
        let leaf_of = vec![0, 0, 1, 0, 1, 1];
        let d = frame.joint_design(&leaf_of, &["n1".to_string(), "n2".to_string()]);
        assert_eq!(d.coef_names.len(), 5);
        assert_eq!(d.coef_names[2], "n2:(Intercept)");
        // row 2 is in leaf 1
        assert_eq!(d.x.get(2, 0), 0.0);
        assert_eq!(d.x.get(2, 2), 1.0);
        assert_eq!(d.x.get(2, 3), 0.3);
        assert_eq!(d.x.get(2, 4), 50.0);
    }

    #[test]
    fn test_missing_grouping_id_is_error() {
        let data = Dataset::new()
            .with_numeric("y", vec![1.0, 2.0])
            .unwrap()
            .with_identifier("id", ["a", ""])
            .unwrap();
        let spec = ModelSpec {
            response: "y".into(),
            random: Some(RandomEffects::intercept("id")),
            ..ModelSpec::default()
        };
        let err = ModelFrame::new(&data, &spec).unwrap_err();
        assert!(err.to_string().contains("grouping"));
    }

    #[test]
    fn test_invalid_response_for_family() {
        let data = Dataset::new().with_numeric("y", vec![0.0, 2.0]).unwrap();
        let spec = ModelSpec {
            response: "y".into(),
            family: FamilyKind::Binomial,
            ..ModelSpec::default()
        };
        assert!(ModelFrame::new(&data, &spec).is_err());
    }
}

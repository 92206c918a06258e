//! In-memory tabular dataset.
//!
//! Columns are stored whole and typed: numeric (`NaN` marks a missing value),
//! categorical (integer codes into a level table, optionally ordered) and
//! identifier (cluster labels). Model code never copies the table; it holds
//! row indices into it.

use std::collections::HashMap;

use anyhow::{bail, Result};

/// Values parsed as missing in string-valued columns.
const MISSING_LABELS: [&str; 5] = ["", "NA", "na", "NaN", "."];

/// A single typed column.
#[derive(Debug, Clone)]
pub enum Column {
    /// Continuous values.
    Numeric(Vec<f64>),
    /// Factor: `codes[i]` indexes `levels`. `None` marks a missing value.
    Categorical {
        levels: Vec<String>,
        codes: Vec<Option<u32>>,
        ordered: bool,
    },
    /// Cluster / subject identifier. `None` marks a missing identifier.
    Identifier {
        labels: Vec<String>,
        codes: Vec<Option<u32>>,
    },
}

impl Column {
    /// Number of rows in the column.
    pub fn len(&self) -> usize {
        match self {
            Column::Numeric(v) => v.len(),
            Column::Categorical { codes, .. } | Column::Identifier { codes, .. } => codes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether row `i` holds a missing value.
    pub fn is_missing(&self, i: usize) -> bool {
        match self {
            Column::Numeric(v) => !v[i].is_finite(),
            Column::Categorical { codes, .. } | Column::Identifier { codes, .. } => codes[i].is_none(),
        }
    }

    /// Short kind name for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Column::Numeric(_) => "numeric",
            Column::Categorical { ordered: true, .. } => "ordered categorical",
            Column::Categorical { .. } => "categorical",
            Column::Identifier { .. } => "identifier",
        }
    }
}

/// Encode string values into (levels, codes) in order of first appearance.
fn encode<I, S>(values: I) -> (Vec<String>, Vec<Option<u32>>)
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut levels: Vec<String> = Vec::new();
    let mut lookup: HashMap<String, u32> = HashMap::new();
    let codes = values
        .into_iter()
        .map(|v| {
            let v = v.as_ref().trim();
            if MISSING_LABELS.contains(&v) {
                return None;
            }
            let code = *lookup.entry(v.to_string()).or_insert_with(|| {
                levels.push(v.to_string());
                (levels.len() - 1) as u32
            });
            Some(code)
        })
        .collect();
    (levels, codes)
}

/// Column-oriented, immutable-once-built dataset.
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    names: Vec<String>,
    columns: Vec<Column>,
    n_rows: usize,
}

impl Dataset {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(mut self, name: &str, column: Column) -> Result<Self> {
        if self.names.iter().any(|n| n == name) {
            bail!("Duplicate column name '{}'", name);
        }
        if !self.columns.is_empty() && column.len() != self.n_rows {
            bail!(
                "Column '{}' has {} rows, dataset has {}",
                name,
                column.len(),
                self.n_rows
            );
        }
        self.n_rows = column.len();
        self.names.push(name.to_string());
        self.columns.push(column);
        Ok(self)
    }

    /// Add a numeric column.
    pub fn with_numeric(self, name: &str, values: Vec<f64>) -> Result<Self> {
        self.push(name, Column::Numeric(values))
    }

    /// Add an unordered categorical column; levels are coded in order of first appearance.
    pub fn with_categorical<I, S>(self, name: &str, values: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let (levels, codes) = encode(values);
        self.push(
            name,
            Column::Categorical {
                levels,
                codes,
                ordered: false,
            },
        )
    }

    /// Add an ordered categorical column with an explicit level order.
    pub fn with_ordered<I, S>(self, name: &str, values: I, levels: &[&str]) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let lookup: HashMap<&str, u32> = levels
            .iter()
            .enumerate()
            .map(|(i, l)| (*l, i as u32))
            .collect();
        let mut codes = Vec::new();
        for v in values {
            let v = v.as_ref().trim();
            if MISSING_LABELS.contains(&v) {
                codes.push(None);
                continue;
            }
            match lookup.get(v) {
                Some(&c) => codes.push(Some(c)),
                None => bail!("Value '{}' of column '{}' is not a declared level", v, name),
            }
        }
        self.push(
            name,
            Column::Categorical {
                levels: levels.iter().map(|l| l.to_string()).collect(),
                codes,
                ordered: true,
            },
        )
    }

    /// Add an identifier (cluster) column.
    pub fn with_identifier<I, S>(self, name: &str, values: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let (labels, codes) = encode(values);
        self.push(name, Column::Identifier { labels, codes })
    }

    /// Number of rows.
    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    /// Column names in insertion order.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Look up a column by name.
    pub fn column(&self, name: &str) -> Result<&Column> {
        match self.names.iter().position(|n| n == name) {
            Some(i) => Ok(&self.columns[i]),
            None => bail!("Column '{}' not found in dataset", name),
        }
    }

    /// Look up a numeric column by name.
    pub fn numeric(&self, name: &str) -> Result<&[f64]> {
        match self.column(name)? {
            Column::Numeric(v) => Ok(v),
            other => bail!("Column '{}' is {}, expected numeric", name, other.kind()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_dataset() {
        let data = Dataset::new()
            .with_numeric("y", vec![1.0, 2.0, f64::NAN])
            .unwrap()
            .with_categorical("arm", ["a", "b", "a"])
            .unwrap()
            .with_identifier("id", ["s1", "s1", "NA"])
            .unwrap();

        assert_eq!(data.n_rows(), 3);
        assert_eq!(data.names(), &["y", "arm", "id"]);
        assert!(data.column("y").unwrap().is_missing(2));
        assert!(data.column("id").unwrap().is_missing(2));
        match data.column("arm").unwrap() {
            Column::Categorical { levels, codes, ordered } => {
                assert_eq!(levels, &["a", "b"]);
                assert_eq!(codes, &[Some(0), Some(1), Some(0)]);
                assert!(!ordered);
            }
            other => panic!("unexpected column kind {}", other.kind()),
        }
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let result = Dataset::new()
            .with_numeric("y", vec![1.0, 2.0])
            .unwrap()
            .with_numeric("x", vec![1.0]);
        assert!(result.is_err());
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let result = Dataset::new()
            .with_numeric("y", vec![1.0])
            .unwrap()
            .with_numeric("y", vec![2.0]);
        assert!(result.is_err());
    }

    #[test]
    fn test_ordered_levels() {
        let data = Dataset::new()
            .with_ordered("dose", ["low", "high", "mid"], &["low", "mid", "high"])
            .unwrap();
        match data.column("dose").unwrap() {
            Column::Categorical { codes, ordered, .. } => {
                assert!(*ordered);
                assert_eq!(codes, &[Some(0), Some(2), Some(1)]);
            }
            other => panic!("unexpected column kind {}", other.kind()),
        }
        assert!(Dataset::new()
            .with_ordered("dose", ["none"], &["low"])
            .is_err());
    }

    #[test]
    fn test_numeric_lookup_type_check() {
        let data = Dataset::new().with_categorical("g", ["a"]).unwrap();
        assert!(data.numeric("g").is_err());
        assert!(data.numeric("missing").is_err());
    }
}

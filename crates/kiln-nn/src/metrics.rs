//! Score functions and the per-epoch metric table.

use std::fmt::Write as _;
use std::sync::Arc;

use kiln_core::{KilnError, Result};
use serde::Serialize;

/// `(targets, predictions) -> score`. Both slices are flat; classification
/// predictions arrive already reduced to label ids.
pub type ScoreFn = Arc<dyn Fn(&[f32], &[f32]) -> Result<f64> + Send + Sync>;

/// Fraction of positions where prediction equals target.
pub fn accuracy(targets: &[f32], predictions: &[f32]) -> Result<f64> {
    if targets.len() != predictions.len() {
        return Err(KilnError::ShapeMismatch { expected: vec![targets.len()], got: vec![predictions.len()] });
    }
    if targets.is_empty() {
        return Err(KilnError::ShapeMismatch { expected: vec![1], got: vec![0] });
    }
    let hits = targets.iter().zip(predictions).filter(|(t, p)| t == p).count();
    Ok(hits as f64 / targets.len() as f64)
}

/// Named score functions in insertion order.
#[derive(Clone, Default)]
pub struct ScoreFns {
    entries: Vec<(String, ScoreFn)>,
}

impl ScoreFns {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh collection holding only `accuracy`.
    pub fn with_accuracy() -> Self {
        let mut fns = Self::new();
        fns.insert("accuracy", Arc::new(accuracy));
        fns
    }

    /// Add or replace the function registered under `name`.
    pub fn insert(&mut self, name: impl Into<String>, score: ScoreFn) {
        let name = name.into();
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = score,
            None => self.entries.push((name, score)),
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ScoreFn)> {
        self.entries.iter().map(|(n, f)| (n.as_str(), f))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for ScoreFns {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

/// Ordered `name → per-epoch values` columns.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricTable {
    columns: Vec<(String, Vec<f64>)>,
}

impl MetricTable {
    /// Table with the given (empty) columns.
    pub fn with_columns<S: Into<String>>(names: impl IntoIterator<Item = S>) -> Self {
        Self { columns: names.into_iter().map(|n| (n.into(), Vec::new())).collect() }
    }

    /// Append `value` to column `name`, creating the column if needed.
    pub fn push(&mut self, name: &str, value: f64) {
        match self.columns.iter_mut().find(|(n, _)| n == name) {
            Some((_, values)) => values.push(value),
            None => self.columns.push((name.to_string(), vec![value])),
        }
    }

    pub fn get(&self, name: &str) -> Option<&[f64]> {
        self.columns.iter().find(|(n, _)| n == name).map(|(_, v)| v.as_slice())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(n, _)| n.as_str())
    }

    /// Length of the longest column.
    pub fn num_rows(&self) -> usize {
        self.columns.iter().map(|(_, v)| v.len()).max().unwrap_or(0)
    }

    /// Header row plus one row per epoch. Missing cells are empty, NaN
    /// prints as `NaN`.
    pub fn to_csv(&self) -> String {
        let mut out = self.columns().collect::<Vec<_>>().join(",");
        out.push('\n');
        for row in 0..self.num_rows() {
            let cells: Vec<String> = self
                .columns
                .iter()
                .map(|(_, v)| v.get(row).map(|x| x.to_string()).unwrap_or_default())
                .collect();
            let _ = writeln!(out, "{}", cells.join(","));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accuracy() {
        assert_eq!(accuracy(&[1.0, 2.0, 3.0, 4.0], &[1.0, 0.0, 3.0, 0.0]).unwrap(), 0.5);
        assert!(accuracy(&[1.0], &[1.0, 2.0]).is_err());
        assert!(accuracy(&[], &[]).is_err());
    }

    #[test]
    fn test_score_fns_fresh_and_ordered() {
        let mut a = ScoreFns::with_accuracy();
        let b = ScoreFns::with_accuracy();
        a.insert("zero", Arc::new(|_: &[f32], _: &[f32]| -> Result<f64> { Ok(0.0) }));
        assert_eq!(a.names().collect::<Vec<_>>(), vec!["accuracy", "zero"]);
        assert_eq!(b.len(), 1);

        a.insert("accuracy", Arc::new(|_: &[f32], _: &[f32]| -> Result<f64> { Ok(1.0) }));
        assert_eq!(a.len(), 2);
    }

    #[test]
    fn test_metric_table() {
        let mut table = MetricTable::with_columns(["epoch_time", "training_loss"]);
        table.push("training_loss", 2.0);
        table.push("training_loss", 1.5);
        table.push("epoch_time", 0.1);
        table.push("training_accuracy", f64::NAN);

        assert_eq!(table.num_rows(), 2);
        assert_eq!(table.get("training_loss").unwrap(), &[2.0, 1.5]);
        assert!(table.get("training_accuracy").unwrap()[0].is_nan());
        assert!(!table.contains("validation_loss"));

        let csv = table.to_csv();
        let mut lines = csv.lines();
        assert_eq!(lines.next().unwrap(), "epoch_time,training_loss,training_accuracy");
        assert_eq!(lines.next().unwrap(), "0.1,2,NaN");
        assert_eq!(lines.next().unwrap(), ",1.5,");
    }
}

//! Per-learner metric history and the population result table.
//!
//! [`History`] collects one rounded value per batch-of-steps under each
//! metric name for the learner currently training. When the learner
//! finishes, [`ResultTable::push`] turns the history into one row and tags it
//! with the learner's checkpoint path.

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Column holding the checkpoint path of each learner.
pub const PATH_COLUMN: &str = "Path";

/// Round to three decimals, the precision every history value is kept at.
pub fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

// ── History ─────────────────────────────────────────────────────────────────

/// Metric name → ordered per-step values. Recording under a name that has
/// not been seen yet starts a new empty series, then appends. Series keep
/// the order in which names were first recorded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct History {
    series: Vec<(String, Vec<f64>)>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `value` (rounded to three decimals) to the series `name`.
    pub fn record(&mut self, name: &str, value: f64) {
        let value = round3(value);
        match self.series.iter_mut().find(|(n, _)| n == name) {
            Some((_, values)) => values.push(value),
            None => self.series.push((name.to_string(), vec![value])),
        }
    }

    /// Record every entry of a computed metric map under `prefix + name`.
    pub fn record_prefixed<'a>(
        &mut self,
        prefix: &str,
        values: impl IntoIterator<Item = (&'a String, &'a f64)>,
    ) {
        for (name, value) in values {
            self.record(&format!("{prefix}{name}"), *value);
        }
    }

    pub fn get(&self, name: &str) -> Option<&[f64]> {
        self.series
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_slice())
    }

    /// Latest value of every series.
    pub fn latest(&self) -> Vec<(&str, f64)> {
        self.series
            .iter()
            .filter_map(|(n, v)| v.last().map(|x| (n.as_str(), *x)))
            .collect()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.series.iter().map(|(n, _)| n.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }
}

// ── ResultTable ─────────────────────────────────────────────────────────────

/// History of one learner plus where its checkpoint was written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearnerRow {
    pub history: History,
    pub path: PathBuf,
}

/// One row per trained learner. Columns are the union of all metric names
/// (first-seen order) followed by [`PATH_COLUMN`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultTable {
    rows: Vec<LearnerRow>,
}

impl ResultTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, history: History, path: PathBuf) {
        self.rows.push(LearnerRow { history, path });
    }

    pub fn rows(&self) -> &[LearnerRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn columns(&self) -> Vec<String> {
        let mut columns: Vec<String> = Vec::new();
        for row in &self.rows {
            for name in row.history.names() {
                if !columns.iter().any(|c| c == name) {
                    columns.push(name.to_string());
                }
            }
        }
        columns.push(PATH_COLUMN.to_string());
        columns
    }

    /// Per-row series for a metric column; `None` cells where a learner
    /// never recorded it.
    pub fn column(&self, name: &str) -> Vec<Option<&[f64]>> {
        self.rows.iter().map(|r| r.history.get(name)).collect()
    }

    pub fn paths(&self) -> Vec<&Path> {
        self.rows.iter().map(|r| r.path.as_path()).collect()
    }

    pub fn save_json(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn load_json(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }

    /// CSV with list cells rendered as `[a;b;c]`.
    pub fn save_csv(&self, path: &Path) -> Result<()> {
        let columns = self.columns();
        let mut f = std::fs::File::create(path)?;
        writeln!(f, "{}", columns.join(","))?;
        for row in &self.rows {
            let cells: Vec<String> = columns
                .iter()
                .map(|c| {
                    if c == PATH_COLUMN {
                        row.path.display().to_string()
                    } else {
                        row.history
                            .get(c)
                            .map(|v| {
                                let items: Vec<String> = v.iter().map(|x| x.to_string()).collect();
                                format!("[{}]", items.join(";"))
                            })
                            .unwrap_or_default()
                    }
                })
                .collect();
            writeln!(f, "{}", cells.join(","))?;
        }
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_starts_missing_series() {
        let mut h = History::new();
        h.record("InnerLoss", 1.23456);
        h.record("TrainLoss", 2.0);
        h.record("InnerLoss", 0.9994);
        assert_eq!(h.get("InnerLoss").unwrap(), &[1.235, 0.999]);
        assert_eq!(h.get("TrainLoss").unwrap(), &[2.0]);
        assert!(h.get("TestLoss").is_none());
        assert_eq!(h.names().collect::<Vec<_>>(), vec!["InnerLoss", "TrainLoss"]);
        assert_eq!(h.latest(), vec![("InnerLoss", 0.999), ("TrainLoss", 2.0)]);
    }

    #[test]
    fn prefixed_records() {
        let mut h = History::new();
        let computed = std::collections::BTreeMap::from([("Accuracy".to_string(), 0.5)]);
        h.record_prefixed("Test", &computed);
        assert_eq!(h.get("TestAccuracy").unwrap(), &[0.5]);
    }

    #[test]
    fn table_columns_are_union_plus_path() {
        let mut a = History::new();
        a.record("InnerLoss", 1.0);
        let mut b = History::new();
        b.record("InnerLoss", 2.0);
        b.record("TestLoss", 3.0);

        let mut table = ResultTable::new();
        table.push(a, PathBuf::from("out/0.pth"));
        table.push(b, PathBuf::from("out/1.pth"));

        assert_eq!(table.len(), 2);
        assert_eq!(table.columns(), vec!["InnerLoss", "TestLoss", "Path"]);
        assert_eq!(table.column("TestLoss")[0], None);
        assert_eq!(table.column("TestLoss")[1], Some(&[3.0][..]));
        assert_eq!(
            table.paths(),
            vec![Path::new("out/0.pth"), Path::new("out/1.pth")]
        );
    }

    #[test]
    fn table_files() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut h = History::new();
        h.record("TrainAccuracy", 0.25);
        h.record("TrainAccuracy", 0.5);
        let mut table = ResultTable::new();
        table.push(h, dir.path().join("0.pth"));

        let json = dir.path().join("history.json");
        table.save_json(&json).unwrap();
        assert_eq!(ResultTable::load_json(&json).unwrap(), table);

        let csv = dir.path().join("history.csv");
        table.save_csv(&csv).unwrap();
        let text = std::fs::read_to_string(&csv).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next().unwrap(), "TrainAccuracy,Path");
        assert!(lines.next().unwrap().starts_with("[0.25;0.5],"));
    }
}

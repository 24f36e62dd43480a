//! Named per-iteration diagnostics
//!
//! The M-step reports the number of datapoints, the number kept by truncation and the free
//! energy through a [MetricsSink]. [DataLog] is the in-memory sink used by the EM driver.

use std::collections::BTreeMap;

use ndarray::Array1;
use serde_derive::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Metric {
    Scalar(f64),
    Count(usize),
    Array(Array1<f64>),
}

impl Metric {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Metric::Scalar(v) => Some(*v),
            Metric::Count(n) => Some(*n as f64),
            Metric::Array(_) => None,
        }
    }
}

impl From<f64> for Metric {
    fn from(v: f64) -> Self {
        Metric::Scalar(v)
    }
}

impl From<usize> for Metric {
    fn from(n: usize) -> Self {
        Metric::Count(n)
    }
}

impl From<Array1<f64>> for Metric {
    fn from(v: Array1<f64>) -> Self {
        Metric::Array(v)
    }
}

pub trait MetricsSink {
    fn append(&mut self, name: &str, value: Metric);
}

/// Discards everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl MetricsSink for NullSink {
    fn append(&mut self, _name: &str, _value: Metric) {}
}

/// Every value appended under each name, in order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataLog {
    entries: BTreeMap<String, Vec<Metric>>,
}

impl DataLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&[Metric]> {
        self.entries.get(name).map(|v| v.as_slice())
    }

    pub fn last(&self, name: &str) -> Option<&Metric> {
        self.entries.get(name).and_then(|v| v.last())
    }

    /// Scalar history of `name`, skipping array entries
    pub fn series(&self, name: &str) -> Vec<f64> {
        self.get(name)
            .map(|v| v.iter().filter_map(Metric::as_f64).collect())
            .unwrap_or_default()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(|k| k.as_str())
    }
}

impl MetricsSink for DataLog {
    fn append(&mut self, name: &str, value: Metric) {
        if let Some(v) = value.as_f64() {
            tracing::debug!("{} = {}", name, v);
        }
        self.entries.entry(name.to_string()).or_default().push(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_append_and_read_back() {
        let mut log = DataLog::new();
        log.append("N", 100usize.into());
        log.append("L", (-3.5_f64).into());
        log.append("N", 80usize.into());
        log.append("pi_hist", array![0.1, 0.2].into());
        assert_eq!(log.series("N"), vec![100.0, 80.0]);
        assert_eq!(log.last("L"), Some(&Metric::Scalar(-3.5)));
        assert!(log.series("pi_hist").is_empty());
        assert_eq!(log.names().collect::<Vec<_>>(), vec!["L", "N", "pi_hist"]);
        assert!(log.get("sigma").is_none());
    }

    #[test]
    fn test_serializes_to_json() {
        let mut log = DataLog::new();
        log.append("N_use", 7usize.into());
        let json = serde_json::to_string(&log).unwrap();
        let back: DataLog = serde_json::from_str(&json).unwrap();
        assert_eq!(back, log);
    }
}

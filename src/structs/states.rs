use eyre::Result;
use ndarray::{Array1, Array2};

use crate::error::EtError;

/// Table of the admissible multi-cause activation patterns.
///
/// Each row is a 0/1 pattern over the `Hprime` candidate positions of a datapoint (not over
/// all H causes), with between 2 and `gamma` active entries. The zero-cause state and the
/// single-cause states are scored separately and never appear here.
///
/// The table is generated once and shared read-only by every datapoint and iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct StateMatrix {
    matrix: Array2<f64>,
    state_abs: Array1<usize>,
}

impl StateMatrix {
    /// Enumerate all patterns over `hprime` positions with 2..=`gamma` active entries,
    /// ordered by cardinality and then lexicographically by active positions.
    pub fn generate(hprime: usize, gamma: usize) -> Self {
        let rows: Vec<Vec<usize>> = (2..=gamma.min(hprime))
            .flat_map(|k| combinations(hprime, k))
            .collect();

        let mut matrix = Array2::zeros((rows.len(), hprime));
        for (i, active) in rows.iter().enumerate() {
            for &j in active {
                matrix[[i, j]] = 1.0;
            }
        }
        let state_abs = Array1::from_iter(rows.iter().map(|r| r.len()));
        tracing::debug!(
            "Generated {} multi-cause states over {} candidates (gamma = {})",
            rows.len(),
            hprime,
            gamma
        );
        Self { matrix, state_abs }
    }

    /// Build a state matrix from an externally supplied 0/1 table
    pub fn from_matrix(matrix: Array2<f64>) -> Result<Self> {
        let mut state_abs = Array1::zeros(matrix.nrows());
        for (i, row) in matrix.rows().into_iter().enumerate() {
            if row.iter().any(|&v| v != 0.0 && v != 1.0) {
                return Err(EtError::InvalidConfiguration(format!(
                    "state {} is not a 0/1 pattern",
                    i
                ))
                .into());
            }
            let card = row.iter().filter(|&&v| v == 1.0).count();
            if card < 2 {
                return Err(EtError::InvalidConfiguration(format!(
                    "state {} has {} active causes, multi-cause states need at least 2",
                    i, card
                ))
                .into());
            }
            state_abs[i] = card;
        }
        Ok(Self { matrix, state_abs })
    }

    /// The (no_states x Hprime) pattern table
    pub fn matrix(&self) -> &Array2<f64> {
        &self.matrix
    }

    /// Number of active causes of every pattern
    pub fn state_abs(&self) -> &Array1<usize> {
        &self.state_abs
    }

    pub fn no_states(&self) -> usize {
        self.matrix.nrows()
    }

    pub fn hprime(&self) -> usize {
        self.matrix.ncols()
    }
}

/// All `k`-subsets of `0..n` in lexicographic order
fn combinations(n: usize, k: usize) -> Vec<Vec<usize>> {
    let mut out = Vec::new();
    if k == 0 || k > n {
        return out;
    }
    let mut idx: Vec<usize> = (0..k).collect();
    loop {
        out.push(idx.clone());
        let Some(i) = (0..k).rev().find(|&i| idx[i] != i + n - k) else {
            return out;
        };
        idx[i] += 1;
        for j in i + 1..k {
            idx[j] = idx[j - 1] + 1;
        }
    }
}

use ndarray::{Array1, Array2, Axis};

use crate::routines::math::logsumexp_rows;

/// Output of the E-step: the unnormalized log-joint of every datapoint and hidden state.
///
/// Columns are ordered as the zero-cause state, the H single-cause states and the
/// multi-cause states of the [StateMatrix](crate::structs::states::StateMatrix).
#[derive(Debug, Clone, PartialEq)]
pub struct SufficientStatistics {
    logpj: Array2<f64>,
}

impl SufficientStatistics {
    pub fn new(logpj: Array2<f64>) -> Self {
        Self { logpj }
    }

    pub fn logpj(&self) -> &Array2<f64> {
        &self.logpj
    }

    pub fn into_logpj(self) -> Array2<f64> {
        self.logpj
    }

    /// Number of datapoints
    pub fn nrows(&self) -> usize {
        self.logpj.nrows()
    }

    /// Number of hidden states, `1 + H + no_states`
    pub fn nstates(&self) -> usize {
        self.logpj.ncols()
    }

    /// Log of the evidence of every datapoint, `log(sum(exp(logpj)))` per row
    pub fn log_evidence(&self) -> Array1<f64> {
        logsumexp_rows(&self.logpj)
    }

    pub(crate) fn select_rows(&self, keep: &[usize]) -> Self {
        Self {
            logpj: self.logpj.select(Axis(0), keep),
        }
    }
}

//! Sufficient statistics and closed-form parameter updates of the M-step
//!
//! Every worker accumulates [Accumulators] over its own (truncated) shard. The sums are
//! reduced across workers by the caller and turned into new parameters by the `update_*`
//! functions.

use std::f64::consts::PI;

use eyre::Result;
use ndarray::{s, Array1, Array2, Axis};

use crate::error::EtError;
use crate::routines::math::{lstsq, shifted_exp};
use crate::routines::prior::TruncatedPrior;
use crate::structs::states::StateMatrix;
use crate::structs::suffstats::SufficientStatistics;

/// Posterior-weighted sums over the datapoints of one shard
///
/// * `wp` - numerator of the dictionary update (H x D)
/// * `wq` - denominator of the dictionary update (H x H)
/// * `pi_sum` - expected number of active causes
/// * `mu_sum` - expected activation of every cause (H)
/// * `data_sum` - plain sum of the observations (D)
#[derive(Debug, Clone, PartialEq)]
pub struct Accumulators {
    pub wp: Array2<f64>,
    pub wq: Array2<f64>,
    pub pi_sum: f64,
    pub mu_sum: Array1<f64>,
    pub data_sum: Array1<f64>,
}

impl Accumulators {
    pub fn zeros(h: usize, d: usize) -> Self {
        Self {
            wp: Array2::zeros((h, d)),
            wq: Array2::zeros((h, h)),
            pi_sum: 0.0,
            mu_sum: Array1::zeros(h),
            data_sum: Array1::zeros(d),
        }
    }

    /// Accumulate the statistics of every datapoint.
    ///
    /// The posterior of each datapoint is normalized over its states. Single-cause states
    /// contribute to their own cause, multi-cause states to the candidate causes they
    /// activate. Observations are centred on `mu`, except for `data_sum`.
    pub fn accumulate(
        stats: &SufficientStatistics,
        y: &Array2<f64>,
        mu: &Array1<f64>,
        candidates: &Array2<usize>,
        states: &StateMatrix,
    ) -> Result<Self> {
        let no_states = states.no_states();
        let h = stats
            .nstates()
            .checked_sub(1 + no_states)
            .ok_or_else(|| EtError::ShapeMismatch(format!("{} state columns are too few", stats.nstates())))?;
        if y.nrows() != stats.nrows() || candidates.nrows() != stats.nrows() {
            return Err(EtError::ShapeMismatch(format!(
                "{} rows of statistics, {} observations, {} candidate rows",
                stats.nrows(),
                y.nrows(),
                candidates.nrows()
            ))
            .into());
        }

        let sm = states.matrix();
        let state_abs = states.state_abs().mapv(|a| a as f64);
        let mut acc = Self::zeros(h, y.ncols());

        let rows = stats.logpj().rows().into_iter().zip(y.rows()).zip(candidates.rows());
        for ((logpj, y_n), cand) in rows {
            let (pjb, denom) = shifted_exp(logpj);
            let pjb = pjb / denom;
            let yh = &y_n - mu;
            let single = pjb.slice(s![1..1 + h]);
            let multi = pjb.slice(s![1 + h..]);

            for (hh, &p) in single.iter().enumerate() {
                acc.wp.row_mut(hh).scaled_add(p, &yh);
                acc.wq[[hh, hh]] += p;
                acc.mu_sum[hh] += p;
            }
            acc.pi_sum += single.sum() + multi.dot(&state_abs);

            if no_states > 0 {
                let weights = sm.t().dot(&multi);
                let cov = sm.t().dot(&(sm * &multi.insert_axis(Axis(1))));
                for (i, &ci) in cand.iter().enumerate() {
                    acc.wp.row_mut(ci).scaled_add(weights[i], &yh);
                    acc.mu_sum[ci] += weights[i];
                    for (j, &cj) in cand.iter().enumerate() {
                        acc.wq[[ci, cj]] += cov[[i, j]];
                    }
                }
            }

            acc.data_sum += &y_n;
        }
        Ok(acc)
    }
}

/// Posterior-weighted sum of reconstruction errors, the numerator of the sigma update
pub fn weighted_error_sum(stats: &SufficientStatistics, errors: &Array2<f64>) -> f64 {
    stats
        .logpj()
        .rows()
        .into_iter()
        .zip(errors.rows())
        .map(|(logpj, err)| {
            let (pjb, denom) = shifted_exp(logpj);
            pjb.dot(&err) / denom
        })
        .sum()
}

/// Dictionary solving `Wq W = Wp` in the least-squares sense
pub fn update_w(wq: &Array2<f64>, wp: &Array2<f64>) -> Result<Array2<f64>> {
    lstsq(wq, wp)
}

/// `E pi_sum / (H N_use)`, corrected for the cap of `gamma` active causes
pub fn update_pi(prior: &TruncatedPrior, pi_sum: f64, h: usize, n_use: usize) -> f64 {
    prior.e * pi_sum / h as f64 / n_use as f64
}

pub fn update_sigma(error_sum: f64, d: usize, n_use: usize) -> f64 {
    (error_sum / d as f64 / n_use as f64).sqrt()
}

/// `data_sum / N - W^T mu_sum / N`
pub fn update_mu(data_sum: &Array1<f64>, mu_sum: &Array1<f64>, w: &Array2<f64>, n: usize) -> Array1<f64> {
    let n = n as f64;
    data_sum / n - w.t().dot(mu_sum) / n
}

/// Truncated log-likelihood per datapoint, from the global sum of log evidences
pub fn log_likelihood(
    h: usize,
    d: usize,
    pi: f64,
    sigma: f64,
    prior: &TruncatedPrior,
    log_evidence_sum: f64,
    n_use: usize,
) -> f64 {
    h as f64 * (1.0 - pi).ln() - 0.5 * d as f64 * (2.0 * PI * sigma * sigma).ln() - prior.a.ln()
        + log_evidence_sum / n_use as f64
}

use eyre::Result;
use ndarray::{s, Array1, Array2, Axis, Zip};

use crate::error::EtError;
use crate::routines::anneal::Annealing;
use crate::routines::math::sq_dist;
use crate::structs::params::ModelParameters;
use crate::structs::shard::DataShard;
use crate::structs::states::StateMatrix;
use crate::structs::suffstats::SufficientStatistics;

/// Log-prior of every hidden state, relative to the zero-cause state.
///
/// `log(pi / (1 - pi))` times the number of active causes: 0 for the zero-cause state,
/// 1 for each of the `h` single-cause states and `state_abs` for the multi-cause states.
pub fn log_prior(pi: f64, h: usize, states: &StateMatrix) -> Array1<f64> {
    let pil_bar = (pi / (1.0 - pi)).ln();
    let mut pre_f = Array1::zeros(1 + h + states.no_states());
    pre_f.slice_mut(s![1..1 + h]).fill(pil_bar);
    for (p, &card) in pre_f
        .slice_mut(s![1 + h..])
        .iter_mut()
        .zip(states.state_abs().iter())
    {
        *p = pil_bar * card as f64;
    }
    pre_f
}

/// Squared reconstruction error `||Wbar - (y - mu)||^2` of every datapoint under every state.
///
/// All H single-cause states are scored, the multi-cause states combine the dictionary rows
/// of the datapoint's candidates.
pub fn reconstruction_errors(
    params: &ModelParameters,
    y: &Array2<f64>,
    candidates: &Array2<usize>,
    states: &StateMatrix,
) -> Result<Array2<f64>> {
    let (h, d) = params.w.dim();
    if y.ncols() != d {
        return Err(EtError::ShapeMismatch(format!(
            "observations have {} dimensions, W has {}",
            y.ncols(),
            d
        ))
        .into());
    }
    if candidates.nrows() != y.nrows() || candidates.ncols() != states.hprime() {
        return Err(EtError::ShapeMismatch(format!(
            "candidates have shape {:?}, expected ({}, {})",
            candidates.dim(),
            y.nrows(),
            states.hprime()
        ))
        .into());
    }
    if let Some(bad) = candidates.iter().find(|&&c| c >= h) {
        return Err(EtError::ShapeMismatch(format!(
            "candidate index {} outside [0, {})",
            bad, h
        ))
        .into());
    }

    let w = &params.w;
    let mu = params.mu_or_zero();
    let sm = states.matrix();
    let no_states = states.no_states();

    let mut err = Array2::zeros((y.nrows(), 1 + h + no_states));
    Zip::from(err.rows_mut())
        .and(y.rows())
        .and(candidates.rows())
        .par_for_each(|mut row, y, cand| {
            let y = &y - &mu;

            // Zero active causes
            row[0] = y.dot(&y);

            // One active cause
            for (hh, w_h) in w.rows().into_iter().enumerate() {
                row[1 + hh] = sq_dist(w_h, y.view());
            }

            // More than one active cause, over the candidate positions
            if no_states > 0 {
                let w_cand = w.select(Axis(0), &cand.to_vec());
                let wbar = sm.dot(&w_cand);
                for (ss, wbar_s) in wbar.rows().into_iter().enumerate() {
                    row[1 + h + ss] = sq_dist(wbar_s, y.view());
                }
            }
        });
    Ok(err)
}

/// Gaussian data term `-||Wbar - (y - mu)||^2 / (2 sigma^2)` for every datapoint and state
pub fn log_likelihood_terms(
    params: &ModelParameters,
    shard: &DataShard,
    states: &StateMatrix,
) -> Result<Array2<f64>> {
    let pre1 = -0.5 / (params.sigma * params.sigma);
    let mut f = reconstruction_errors(params, &shard.y, shard.candidates()?, states)?;
    f.mapv_inplace(|e| pre1 * e);
    Ok(f)
}

/// E-step: unnormalized, annealed log-joint of every datapoint and hidden state.
///
/// With `beta = 1/T`, an annealed prior scales the whole log-joint, `beta (prior + data)`;
/// otherwise only the data term is scaled, `prior + beta data`. No normalization happens here.
pub fn e_step<A>(
    anneal: &A,
    params: &ModelParameters,
    shard: &DataShard,
    states: &StateMatrix,
) -> Result<SufficientStatistics>
where
    A: Annealing + ?Sized,
{
    let t = anneal.temperature();
    if !(t > 0.0) {
        return Err(EtError::InvalidConfiguration(format!(
            "temperature must be positive, got {}",
            t
        ))
        .into());
    }
    let beta = 1.0 / t;
    let pre_f = log_prior(params.pi, params.h(), states);
    let mut f = log_likelihood_terms(params, shard, states)?;

    if anneal.anneal_prior() {
        f += &pre_f;
        f *= beta;
    } else {
        f *= beta;
        f += &pre_f;
    }
    tracing::debug!(
        "E-step scored {} datapoints over {} states (T = {})",
        f.nrows(),
        f.ncols(),
        t
    );
    Ok(SufficientStatistics::new(f))
}

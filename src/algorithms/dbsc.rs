use std::sync::Arc;

use eyre::Result;

use crate::comm::Communicator;
use crate::error::EtError;
use crate::routines::anneal::Annealing;
use crate::routines::candidates::{self, LabelMask};
use crate::routines::datalog::MetricsSink;
use crate::routines::estep::{self, reconstruction_errors};
use crate::routines::mstep::{
    log_likelihood, update_mu, update_pi, update_sigma, update_w, weighted_error_sum,
    Accumulators,
};
use crate::routines::prior::TruncatedPrior;
use crate::routines::settings::Settings;
use crate::routines::truncation::{truncate, Truncation};
use crate::structs::params::{ModelParameters, ToLearn};
use crate::structs::shard::DataShard;
use crate::structs::states::StateMatrix;
use crate::structs::suffstats::SufficientStatistics;

/// Binary sparse coding with Expectation Truncation
///
/// Holds the model dimensions, the parameters to learn and the multi-cause state table.
/// The parameters themselves are passed to every step, so one model can serve any number of
/// workers and iterations.
#[derive(Debug, Clone)]
pub struct DbscEt {
    d: usize,
    h: usize,
    hprime: usize,
    gamma: usize,
    to_learn: ToLearn,
    states: Arc<StateMatrix>,
}

/// Result of an M-step
#[derive(Debug, Clone, PartialEq)]
pub struct MStepOutput {
    pub params: ModelParameters,
    /// Truncated log-likelihood per datapoint, under the input parameters
    pub log_likelihood: f64,
    pub n: usize,
    pub n_use: usize,
}

impl DbscEt {
    pub fn new(d: usize, h: usize, hprime: usize, gamma: usize, to_learn: ToLearn) -> Result<Self> {
        if d == 0 || h == 0 {
            return Err(EtError::InvalidConfiguration(format!(
                "D and H must be positive, got D = {}, H = {}",
                d, h
            ))
            .into());
        }
        if hprime == 0 || hprime > h {
            return Err(EtError::InvalidConfiguration(format!(
                "Hprime must lie in [1, {}], got {}",
                h, hprime
            ))
            .into());
        }
        if gamma == 0 || gamma > h {
            return Err(EtError::InvalidConfiguration(format!(
                "gamma must lie in [1, {}], got {}",
                h, gamma
            ))
            .into());
        }
        let states = Arc::new(StateMatrix::generate(hprime, gamma));
        tracing::debug!(
            "DBSC-ET model with D = {}, H = {}, Hprime = {}, gamma = {}, learning {:?}",
            d,
            h,
            hprime,
            gamma,
            to_learn.params()
        );
        Ok(Self {
            d,
            h,
            hprime,
            gamma,
            to_learn,
            states,
        })
    }

    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let m = &settings.model;
        Self::new(m.d, m.h, m.hprime, m.gamma, settings.to_learn())
    }

    pub fn d(&self) -> usize {
        self.d
    }

    pub fn h(&self) -> usize {
        self.h
    }

    pub fn hprime(&self) -> usize {
        self.hprime
    }

    pub fn gamma(&self) -> usize {
        self.gamma
    }

    pub fn to_learn(&self) -> &ToLearn {
        &self.to_learn
    }

    pub fn states(&self) -> &StateMatrix {
        &self.states
    }

    /// Attach the `Hprime` candidate causes of every datapoint to the shard
    pub fn select_candidates(
        &self,
        params: &ModelParameters,
        shard: &mut DataShard,
        mask: Option<&LabelMask>,
    ) -> Result<()> {
        params.validate(self.h, self.d)?;
        candidates::select_candidates(&params.w, shard, self.hprime, mask)
    }

    /// Score every datapoint of the shard under every hidden state
    pub fn e_step<A>(
        &self,
        anneal: &A,
        params: &ModelParameters,
        shard: &DataShard,
    ) -> Result<SufficientStatistics>
    where
        A: Annealing + ?Sized,
    {
        params.validate(self.h, self.d)?;
        estep::e_step(anneal, params, shard, &self.states)
    }

    /// Truncate the batch, accumulate the sufficient statistics and update the learned
    /// parameters.
    ///
    /// Collective. Every worker enters, in this order: the batch size reduction, the
    /// truncation sort and kept-count reduction (only if `Ncut_factor > 0`), the evidence
    /// reduction, then the reductions of the learned parameters: `Wp` and `Wq` for `W`, the
    /// activation sum for `pi`, the error sum for `sigma`, the activation and data sums for
    /// `mu`. The input shard is left untouched.
    pub fn m_step<C, A, M>(
        &self,
        comm: &C,
        anneal: &mut A,
        params: &ModelParameters,
        stats: SufficientStatistics,
        shard: &DataShard,
        sink: &mut M,
    ) -> Result<MStepOutput>
    where
        C: Communicator,
        A: Annealing + ?Sized,
        M: MetricsSink + ?Sized,
    {
        let (h, d) = (self.h, self.d);
        params.validate(h, d)?;
        let expected = 1 + h + self.states.no_states();
        if stats.nstates() != expected {
            return Err(EtError::ShapeMismatch(format!(
                "statistics have {} state columns, expected {}",
                stats.nstates(),
                expected
            ))
            .into());
        }

        let mut work = DataShard {
            y: shard.noisy_y(anneal.data_noise()),
            labels: shard.labels.clone(),
            candidates: Some(shard.candidates()?.clone()),
            data_noise: None,
        };
        let mut stats = stats;
        let prior = TruncatedPrior::new(h, self.gamma, params.pi);

        let Truncation { n, n_use } =
            truncate(comm, anneal.ncut_factor(), &prior, &mut work, &mut stats)?;
        // Kept count, as the batch size seen by the updates
        sink.append("N", n_use.into());

        let evidence_sum = comm.allreduce_scalar(stats.log_evidence().sum())?;
        let l = log_likelihood(h, d, params.pi, params.sigma, &prior, evidence_sum, n_use);
        sink.append("L", l.into());

        let mu = params.mu_or_zero();
        let candidates = work.candidates()?;
        let acc = Accumulators::accumulate(&stats, &work.y, &mu, candidates, &self.states)?;

        let w = if self.to_learn.w {
            let wp = comm.allreduce_array(&acc.wp)?;
            let wq = comm.allreduce_array(&acc.wq)?;
            update_w(&wq, &wp)?
        } else {
            params.w.clone()
        };

        let pi = if self.to_learn.pi {
            update_pi(&prior, comm.allreduce_scalar(acc.pi_sum)?, h, n_use)
        } else {
            params.pi
        };

        let sigma = if self.to_learn.sigma {
            // Second pass, with the dictionary and offset of this iteration
            let errors = reconstruction_errors(params, &work.y, candidates, &self.states)?;
            let error_sum = comm.allreduce_scalar(weighted_error_sum(&stats, &errors))?;
            update_sigma(error_sum, d, n_use)
        } else {
            params.sigma
        };

        let mu_new = if self.to_learn.mu {
            let mu_sum = comm.allreduce_array(&acc.mu_sum)?;
            let data_sum = comm.allreduce_array(&acc.data_sum)?;
            // Normalized by the local number of kept datapoints
            let my_n = if work.is_empty() {
                tracing::warn!("No datapoints left on this worker, normalizing mu by N_use");
                n_use
            } else {
                work.len()
            };
            Some(update_mu(&data_sum, &mu_sum, &w, my_n))
        } else {
            params.mu.clone()
        };

        let new_params = ModelParameters {
            w,
            pi,
            sigma,
            mu: mu_new,
        };
        if !new_params.pi.is_finite() || !new_params.sigma.is_finite() {
            tracing::warn!(
                "Degenerate parameters after the M-step: pi = {}, sigma = {}",
                new_params.pi,
                new_params.sigma
            );
        }

        for param in anneal.crit_params().to_vec() {
            anneal.dyn_param(param, new_params.value(param));
        }
        sink.append("N_use", n_use.into());

        Ok(MStepOutput {
            params: new_params,
            log_likelihood: l,
            n,
            n_use,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::SingleProcess;
    use crate::routines::anneal::ConstantAnnealing;
    use crate::routines::datalog::{DataLog, Metric};
    use crate::structs::params::{Param, ParamValue};
    use ndarray::array;

    fn model(to_learn: ToLearn) -> DbscEt {
        DbscEt::new(2, 3, 2, 2, to_learn).unwrap()
    }

    fn setup() -> (ModelParameters, DataShard) {
        let params = ModelParameters::new(array![[1.0, 0.0], [0.0, 1.0], [1.0, 1.0]], 0.3, 0.4);
        let shard = DataShard::new(array![[1.1, 0.0], [0.0, 0.9], [1.0, 1.1], [2.0, 1.0], [0.1, 0.0]]);
        (params, shard)
    }

    #[test]
    fn test_invalid_dimensions() {
        assert!(DbscEt::new(2, 3, 4, 2, ToLearn::default()).is_err());
        assert!(DbscEt::new(2, 3, 2, 0, ToLearn::default()).is_err());
        assert!(DbscEt::new(0, 3, 2, 2, ToLearn::default()).is_err());
    }

    #[test]
    fn test_nothing_learned_keeps_parameters() {
        let model = model(ToLearn::none());
        let (params, mut shard) = setup();
        let mut anneal = ConstantAnnealing::default();
        model.select_candidates(&params, &mut shard, None).unwrap();
        let stats = model.e_step(&anneal, &params, &shard).unwrap();
        let mut log = DataLog::new();
        let out = model
            .m_step(&SingleProcess, &mut anneal, &params, stats, &shard, &mut log)
            .unwrap();
        assert_eq!(out.params, params);
        assert_eq!(out.n_use, 5);
        assert_eq!(log.last("N_use"), Some(&Metric::Count(5)));
        assert!(log.last("L").is_some());
    }

    #[test]
    fn test_critical_parameters_reported() {
        let model = model(ToLearn::default());
        let (params, mut shard) = setup();
        let mut anneal = ConstantAnnealing {
            crit_params: vec![Param::Pi, Param::Sigma],
            ..Default::default()
        };
        model.select_candidates(&params, &mut shard, None).unwrap();
        let stats = model.e_step(&anneal, &params, &shard).unwrap();
        let out = model
            .m_step(&SingleProcess, &mut anneal, &params, stats, &shard, &mut DataLog::new())
            .unwrap();
        assert_eq!(anneal.history[&Param::Pi], vec![ParamValue::Scalar(out.params.pi)]);
        assert_eq!(anneal.history[&Param::Sigma], vec![ParamValue::Scalar(out.params.sigma)]);
        assert!(!anneal.history.contains_key(&Param::W));
    }

    #[test]
    fn test_input_shard_untouched_by_truncation() {
        let model = model(ToLearn::all());
        let (params, mut shard) = setup();
        let mut anneal = ConstantAnnealing {
            ncut_factor: 1.0,
            ..Default::default()
        };
        model.select_candidates(&params, &mut shard, None).unwrap();
        let before = shard.clone();
        let stats = model.e_step(&anneal, &params, &shard).unwrap();
        let out = model
            .m_step(&SingleProcess, &mut anneal, &params, stats, &shard, &mut DataLog::new())
            .unwrap();
        assert_eq!(shard, before);
        assert!(out.n_use <= out.n);
        assert!(out.params.mu.is_some());
        assert!(out.params.sigma > 0.0);
    }

    #[test]
    fn test_batch_size_metric_counts_kept_rows() {
        let model = model(ToLearn::default());
        let (params, mut shard) = setup();
        let mut anneal = ConstantAnnealing {
            ncut_factor: 1.0,
            ..Default::default()
        };
        model.select_candidates(&params, &mut shard, None).unwrap();
        let stats = model.e_step(&anneal, &params, &shard).unwrap();
        let mut log = DataLog::new();
        let out = model
            .m_step(&SingleProcess, &mut anneal, &params, stats, &shard, &mut log)
            .unwrap();
        // floor(5 * A) with A = 1 - 0.3^3
        assert_eq!(out.n, 5);
        assert_eq!(out.n_use, 4);
        assert_eq!(log.series("N"), vec![4.0]);
        assert_eq!(log.series("N_use"), vec![4.0]);
    }

    #[test]
    fn test_statistics_shape_checked() {
        let model = model(ToLearn::default());
        let (params, mut shard) = setup();
        model.select_candidates(&params, &mut shard, None).unwrap();
        let stats = SufficientStatistics::new(ndarray::Array2::zeros((5, 3)));
        let mut anneal = ConstantAnnealing::default();
        let err = model
            .m_step(&SingleProcess, &mut anneal, &params, stats, &shard, &mut DataLog::new())
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EtError>(),
            Some(EtError::ShapeMismatch(_))
        ));
    }
}

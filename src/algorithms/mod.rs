use eyre::{Result, WrapErr};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_derive::{Deserialize, Serialize};

use crate::comm::Communicator;
use crate::routines::anneal::{Annealing, LinearAnnealing};
use crate::routines::candidates::LabelMask;
use crate::routines::datalog::DataLog;
use crate::routines::settings::Settings;
use crate::structs::params::ModelParameters;
use crate::structs::shard::DataShard;

pub mod dbsc;

pub use dbsc::{DbscEt, MStepOutput};

/// Represents the status of an EM run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    /// Run is starting up
    Starting,
    /// Run is currently iterating
    InProgress,
    /// The annealing schedule has run out of steps
    ScheduleFinished,
    /// Run stopped due to reaching the iteration limit
    MaxIterations,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Starting => write!(f, "Starting"),
            Status::InProgress => write!(f, "In progress"),
            Status::ScheduleFinished => write!(f, "Annealing schedule finished"),
            Status::MaxIterations => write!(f, "Maximum iterations reached"),
        }
    }
}

/// Final state of an EM run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmResult {
    pub params: ModelParameters,
    pub log: DataLog,
    pub iterations: usize,
    pub status: Status,
}

impl EmResult {
    /// Write the result as pretty-printed JSON
    pub fn write(&self, path: &str) -> Result<()> {
        let serialized = serde_json::to_string_pretty(self)?;
        std::fs::write(path, serialized).wrap_err_with(|| format!("Failed to write result to {}", path))?;
        Ok(())
    }
}

/// EM driver for one worker
///
/// Every worker of a group runs its own driver over its own shard. All drivers must be
/// configured identically and advanced in lockstep, since every iteration enters the same
/// collectives.
pub struct Em<C, A> {
    model: DbscEt,
    comm: C,
    anneal: A,
    params: ModelParameters,
    shard: DataShard,
    mask: Option<LabelMask>,
    log: DataLog,
    rng: StdRng,
    iteration: usize,
    max_iterations: usize,
    status: Status,
}

impl<C, A> Em<C, A>
where
    C: Communicator,
    A: Annealing,
{
    pub fn new(model: DbscEt, comm: C, anneal: A, params: ModelParameters, shard: DataShard) -> Result<Self> {
        params.validate(model.h(), model.d())?;
        let rng = StdRng::seed_from_u64(347 + comm.rank() as u64);
        Ok(Self {
            model,
            comm,
            anneal,
            params,
            shard,
            mask: None,
            log: DataLog::new(),
            rng,
            iteration: 0,
            max_iterations: usize::MAX,
            status: Status::Starting,
        })
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Seed of the data-noise draws, offset by the worker's rank
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed.wrapping_add(self.comm.rank() as u64));
        self
    }

    pub fn with_label_mask(mut self, mask: LabelMask) -> Self {
        self.mask = Some(mask);
        self
    }

    /// Draw a random label mask shared by all workers and use it from now on.
    ///
    /// Collective. The shard must carry labels.
    pub fn initialize_label_mask(&mut self) -> Result<&LabelMask> {
        let labels = self
            .shard
            .labels
            .as_ref()
            .ok_or_else(|| eyre::eyre!("the shard carries no labels"))?;
        let mask = LabelMask::initialize(&self.comm, labels, self.model.h(), &mut self.rng)?;
        Ok(&*self.mask.insert(mask))
    }

    pub fn label_mask(&self) -> Option<&LabelMask> {
        self.mask.as_ref()
    }

    pub fn params(&self) -> &ModelParameters {
        &self.params
    }

    pub fn log(&self) -> &DataLog {
        &self.log
    }

    pub fn anneal(&self) -> &A {
        &self.anneal
    }

    pub fn iteration(&self) -> usize {
        self.iteration
    }

    pub fn status(&self) -> &Status {
        &self.status
    }

    pub fn finished(&self) -> bool {
        self.anneal.finished() || self.iteration >= self.max_iterations
    }

    /// Run one iteration: candidate selection, E-step, M-step, schedule step.
    ///
    /// Returns `true` once the run is finished.
    pub fn next_iteration(&mut self) -> Result<bool> {
        self.iteration += 1;
        self.status = Status::InProgress;
        let span = tracing::info_span!("", "{}", format!("Iteration {}", self.iteration));
        let _enter = span.enter();

        self.model
            .select_candidates(&self.params, &mut self.shard, self.mask.as_ref())?;
        let stats = self.model.e_step(&self.anneal, &self.params, &self.shard)?;

        let noise = self.anneal.data_noise();
        if noise > 0.0 {
            self.shard.add_data_noise(noise, &mut self.rng)?;
        }

        let out = self.model.m_step(
            &self.comm,
            &mut self.anneal,
            &self.params,
            stats,
            &self.shard,
            &mut self.log,
        )?;
        tracing::info!(
            "L = {:.4}, N_use = {}/{}, pi = {:.4}, sigma = {:.4} (T = {:.3})",
            out.log_likelihood,
            out.n_use,
            out.n,
            out.params.pi,
            out.params.sigma,
            self.anneal.temperature()
        );
        self.params = out.params;
        self.anneal.advance();

        if self.anneal.finished() {
            self.status = Status::ScheduleFinished;
        } else if self.iteration >= self.max_iterations {
            self.status = Status::MaxIterations;
        }
        Ok(self.finished())
    }

    /// Iterate until the schedule or the iteration limit runs out
    pub fn fit(mut self) -> Result<EmResult> {
        while !self.finished() {
            self.next_iteration()?;
        }
        tracing::info!("{} after {} iterations", self.status, self.iteration);
        Ok(self.into_result())
    }

    pub fn into_result(self) -> EmResult {
        EmResult {
            params: self.params,
            log: self.log,
            iterations: self.iteration,
            status: self.status,
        }
    }
}

impl<C> Em<C, LinearAnnealing>
where
    C: Communicator,
{
    /// Driver configured by a settings file, starting from data-driven parameters.
    ///
    /// Collective. A labelled shard also gets a label mask shared by all workers, so every
    /// worker must pass labels or none must.
    pub fn from_settings(settings: &Settings, comm: C, shard: DataShard) -> Result<Self> {
        let model = DbscEt::from_settings(settings)?;
        let anneal = settings.annealing()?;
        let mut init_rng = StdRng::seed_from_u64(settings.config.seed);
        let params = ModelParameters::standard_init(&comm, model.h(), &shard.y, &mut init_rng)?;
        let labelled = shard.labels.is_some();
        let mut em = Self::new(model, comm, anneal, params, shard)?
            .with_max_iterations(settings.config.iterations)
            .with_seed(settings.config.seed);
        if labelled {
            let mask = em.initialize_label_mask()?;
            tracing::info!("Candidates restricted by a mask over {} labels", mask.labels().len());
        }
        Ok(em)
    }
}

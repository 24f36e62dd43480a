//! Deterministic annealing schedules
//!
//! A schedule supplies the temperature, the truncation factor and the data noise of every
//! iteration, and is told about the new values of its critical parameters after each M-step.

use std::collections::BTreeMap;

use eyre::Result;
use serde_derive::{Deserialize, Serialize};

use crate::error::EtError;
use crate::structs::params::{Param, ParamValue};

pub trait Annealing {
    /// Temperature `T`, the E-step scales by `beta = 1/T`
    fn temperature(&self) -> f64;
    /// Whether the prior term is annealed together with the data term
    fn anneal_prior(&self) -> bool;
    /// Fraction of the evidence-based truncation applied, in [0, 1]
    fn ncut_factor(&self) -> f64;
    /// Scale of the additive noise applied to the data during the M-step
    fn data_noise(&self) -> f64;
    /// Parameters whose new values the schedule wants to see
    fn crit_params(&self) -> &[Param];
    /// Receive the new value of a critical parameter
    fn dyn_param(&mut self, param: Param, value: ParamValue);
    /// Move to the next iteration
    fn advance(&mut self) {}
    /// Whether the schedule has run out of iterations
    fn finished(&self) -> bool {
        false
    }
}

/// Values reported for the critical parameters, one entry per M-step
pub type ParamHistory = BTreeMap<Param, Vec<ParamValue>>;

/// A schedule that never changes
#[derive(Debug, Clone, PartialEq)]
pub struct ConstantAnnealing {
    pub temperature: f64,
    pub anneal_prior: bool,
    pub ncut_factor: f64,
    pub data_noise: f64,
    pub crit_params: Vec<Param>,
    pub history: ParamHistory,
}

impl Default for ConstantAnnealing {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            anneal_prior: false,
            ncut_factor: 0.0,
            data_noise: 0.0,
            crit_params: Vec::new(),
            history: ParamHistory::new(),
        }
    }
}

impl Annealing for ConstantAnnealing {
    fn temperature(&self) -> f64 {
        self.temperature
    }

    fn anneal_prior(&self) -> bool {
        self.anneal_prior
    }

    fn ncut_factor(&self) -> f64 {
        self.ncut_factor
    }

    fn data_noise(&self) -> f64 {
        self.data_noise
    }

    fn crit_params(&self) -> &[Param] {
        &self.crit_params
    }

    fn dyn_param(&mut self, param: Param, value: ParamValue) {
        self.history.entry(param).or_default().push(value);
    }
}

/// A value interpolated linearly between `(position, value)` points.
///
/// Positions are fractions of the total number of steps. Before the first point the first
/// value holds, after the last point the last value holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ramp(pub Vec<(f64, f64)>);

impl Ramp {
    pub fn constant(value: f64) -> Self {
        Self(vec![(0.0, value)])
    }

    pub fn at(&self, position: f64) -> f64 {
        let points = &self.0;
        match points.iter().position(|&(p, _)| p > position) {
            Some(0) => points[0].1,
            Some(i) => {
                let (p0, v0) = points[i - 1];
                let (p1, v1) = points[i];
                v0 + (v1 - v0) * (position - p0) / (p1 - p0)
            }
            None => points.last().map(|&(_, v)| v).unwrap_or(0.0),
        }
    }

    fn validate(&self, name: &str) -> Result<()> {
        if self.0.is_empty() {
            return Err(EtError::InvalidConfiguration(format!("{} schedule has no points", name)).into());
        }
        if self.0.windows(2).any(|w| w[0].0 >= w[1].0) {
            return Err(EtError::InvalidConfiguration(format!(
                "{} schedule positions must be strictly increasing",
                name
            ))
            .into());
        }
        Ok(())
    }
}

/// Piecewise-linear schedule over a fixed number of steps
#[derive(Debug, Clone, PartialEq)]
pub struct LinearAnnealing {
    steps: usize,
    cur_pos: usize,
    temperature: Ramp,
    ncut_factor: Ramp,
    data_noise: Ramp,
    anneal_prior: bool,
    crit_params: Vec<Param>,
    history: ParamHistory,
}

impl LinearAnnealing {
    /// A schedule of `steps` iterations at `T = 1` without truncation or data noise
    pub fn new(steps: usize) -> Self {
        Self {
            steps,
            cur_pos: 0,
            temperature: Ramp::constant(1.0),
            ncut_factor: Ramp::constant(0.0),
            data_noise: Ramp::constant(0.0),
            anneal_prior: false,
            crit_params: Vec::new(),
            history: ParamHistory::new(),
        }
    }

    pub fn with_temperature(mut self, ramp: Ramp) -> Result<Self> {
        ramp.validate("T")?;
        if ramp.0.iter().any(|&(_, t)| !(t > 0.0)) {
            return Err(EtError::InvalidConfiguration("temperatures must be positive".to_string()).into());
        }
        self.temperature = ramp;
        Ok(self)
    }

    pub fn with_ncut_factor(mut self, ramp: Ramp) -> Result<Self> {
        ramp.validate("Ncut_factor")?;
        if ramp.0.iter().any(|&(_, v)| !(0.0..=1.0).contains(&v)) {
            return Err(EtError::InvalidConfiguration("Ncut_factor must lie in [0, 1]".to_string()).into());
        }
        self.ncut_factor = ramp;
        Ok(self)
    }

    pub fn with_data_noise(mut self, ramp: Ramp) -> Result<Self> {
        ramp.validate("data_noise")?;
        self.data_noise = ramp;
        Ok(self)
    }

    pub fn with_anneal_prior(mut self, anneal_prior: bool) -> Self {
        self.anneal_prior = anneal_prior;
        self
    }

    pub fn with_crit_params(mut self, params: Vec<Param>) -> Self {
        self.crit_params = params;
        self
    }

    /// Current step, starting at 0
    pub fn step(&self) -> usize {
        self.cur_pos
    }

    pub fn history(&self) -> &ParamHistory {
        &self.history
    }

    fn position(&self) -> f64 {
        if self.steps == 0 {
            1.0
        } else {
            self.cur_pos as f64 / self.steps as f64
        }
    }
}

impl Annealing for LinearAnnealing {
    fn temperature(&self) -> f64 {
        self.temperature.at(self.position())
    }

    fn anneal_prior(&self) -> bool {
        self.anneal_prior
    }

    fn ncut_factor(&self) -> f64 {
        self.ncut_factor.at(self.position())
    }

    fn data_noise(&self) -> f64 {
        self.data_noise.at(self.position())
    }

    fn crit_params(&self) -> &[Param] {
        &self.crit_params
    }

    fn dyn_param(&mut self, param: Param, value: ParamValue) {
        self.history.entry(param).or_default().push(value);
    }

    fn advance(&mut self) {
        self.cur_pos += 1;
    }

    fn finished(&self) -> bool {
        self.cur_pos >= self.steps
    }
}

use config::Config as eConfig;
use eyre::{Result, WrapErr};
use serde_derive::{Deserialize, Serialize};

use crate::error::EtError;
use crate::routines::anneal::{LinearAnnealing, Ramp};
use crate::structs::params::{Param, ToLearn};

/// Run configuration, read from a TOML file and overridable through `DBSC_*` environment
/// variables
#[derive(Debug, Deserialize, Clone, Serialize, PartialEq)]
pub struct Settings {
    pub model: Model,
    #[serde(default)]
    pub anneal: Anneal,
    pub config: Config,
    #[serde(default)]
    pub log: Log,
}

#[derive(Debug, Deserialize, Clone, Serialize, PartialEq)]
pub struct Model {
    #[serde(alias = "D")]
    pub d: usize,
    #[serde(alias = "H")]
    pub h: usize,
    #[serde(alias = "Hprime")]
    pub hprime: usize,
    pub gamma: usize,
    #[serde(default = "default_to_learn")]
    pub to_learn: Vec<Param>,
}

/// A schedule entry, either a constant or `(position, value)` points interpolated over the run
#[derive(Debug, Deserialize, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum ScheduleValue {
    Constant(f64),
    Points(Vec<(f64, f64)>),
}

impl ScheduleValue {
    pub fn ramp(&self) -> Ramp {
        match self {
            ScheduleValue::Constant(v) => Ramp::constant(*v),
            ScheduleValue::Points(points) => Ramp(points.clone()),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Serialize, PartialEq)]
pub struct Anneal {
    #[serde(default = "default_temperature", alias = "t", alias = "T")]
    pub temperature: ScheduleValue,
    #[serde(default = "default_false")]
    pub anneal_prior: bool,
    #[serde(default = "default_zero", alias = "Ncut_factor")]
    pub ncut_factor: ScheduleValue,
    #[serde(default = "default_zero")]
    pub data_noise: ScheduleValue,
    #[serde(default)]
    pub crit_params: Vec<Param>,
}

impl Default for Anneal {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            anneal_prior: false,
            ncut_factor: default_zero(),
            data_noise: default_zero(),
            crit_params: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Serialize, PartialEq)]
pub struct Config {
    pub iterations: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

#[derive(Debug, Deserialize, Clone, Serialize, PartialEq)]
pub struct Log {
    #[serde(default = "default_log_level")]
    pub level: String,
    pub file: Option<String>,
}

impl Default for Log {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

impl Settings {
    /// Read and validate the settings file at `path`
    pub fn read(path: &str) -> Result<Settings> {
        let parsed = eConfig::builder()
            .add_source(config::File::with_name(path).format(config::FileFormat::Toml))
            .add_source(config::Environment::with_prefix("DBSC").separator("_"))
            .build()
            .wrap_err_with(|| format!("Failed to read settings from {}", path))?;
        let settings: Settings = parsed.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Parse and validate settings given as a TOML string
    pub fn from_toml(toml: &str) -> Result<Settings> {
        let parsed = eConfig::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()?;
        let settings: Settings = parsed.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        let m = &self.model;
        if m.d == 0 || m.h == 0 {
            return Err(EtError::InvalidConfiguration(format!(
                "D and H must be positive, got D = {}, H = {}",
                m.d, m.h
            ))
            .into());
        }
        if m.hprime == 0 || m.hprime > m.h {
            return Err(EtError::InvalidConfiguration(format!(
                "Hprime must lie in [1, {}], got {}",
                m.h, m.hprime
            ))
            .into());
        }
        if m.gamma == 0 || m.gamma > m.h {
            return Err(EtError::InvalidConfiguration(format!(
                "gamma must lie in [1, {}], got {}",
                m.h, m.gamma
            ))
            .into());
        }
        self.annealing().map(|_| ())
    }

    pub fn to_learn(&self) -> ToLearn {
        ToLearn::from_params(&self.model.to_learn)
    }

    /// The annealing schedule described by the `[anneal]` section, over all iterations
    pub fn annealing(&self) -> Result<LinearAnnealing> {
        let a = &self.anneal;
        Ok(LinearAnnealing::new(self.config.iterations)
            .with_temperature(a.temperature.ramp())?
            .with_ncut_factor(a.ncut_factor.ramp())?
            .with_data_noise(a.data_noise.ramp())?
            .with_anneal_prior(a.anneal_prior)
            .with_crit_params(a.crit_params.clone()))
    }
}

/// Record the settings of a run as pretty-printed JSON
pub fn write_settings_to_file(settings: &Settings, path: &str) -> Result<()> {
    let serialized = serde_json::to_string_pretty(settings)?;
    std::fs::write(path, serialized).wrap_err_with(|| format!("Failed to write settings to {}", path))?;
    Ok(())
}

// *********************************
// Default values for deserializing
// *********************************
fn default_false() -> bool {
    false
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_seed() -> u64 {
    347
}

fn default_temperature() -> ScheduleValue {
    ScheduleValue::Constant(1.0)
}

fn default_zero() -> ScheduleValue {
    ScheduleValue::Constant(0.0)
}

fn default_to_learn() -> Vec<Param> {
    vec![Param::W, Param::Pi, Param::Sigma]
}

use std::fmt;
use std::str::FromStr;

use eyre::{eyre, Result};
use ndarray::{Array1, Array2, Axis};
use rand::Rng;
use rand_distr::StandardNormal;
use serde_derive::{Deserialize, Serialize};

use crate::comm::{Communicator, Payload};
use crate::error::EtError;

/// The four parameters of the binary sparse coding model
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Param {
    #[serde(rename = "W")]
    W,
    #[serde(rename = "pi")]
    Pi,
    #[serde(rename = "sigma")]
    Sigma,
    #[serde(rename = "mu")]
    Mu,
}

impl Param {
    pub fn name(&self) -> &'static str {
        match self {
            Param::W => "W",
            Param::Pi => "pi",
            Param::Sigma => "sigma",
            Param::Mu => "mu",
        }
    }
}

impl fmt::Display for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for Param {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "W" => Ok(Param::W),
            "pi" => Ok(Param::Pi),
            "sigma" => Ok(Param::Sigma),
            "mu" => Ok(Param::Mu),
            other => Err(EtError::InvalidConfiguration(format!(
                "unknown parameter '{}', expected one of W, pi, sigma, mu",
                other
            ))
            .into()),
        }
    }
}

/// Which parameters the M-step updates. Parameters not set keep their input value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToLearn {
    pub w: bool,
    pub pi: bool,
    pub sigma: bool,
    pub mu: bool,
}

impl Default for ToLearn {
    fn default() -> Self {
        Self::from_params(&[Param::W, Param::Pi, Param::Sigma])
    }
}

impl ToLearn {
    pub fn none() -> Self {
        Self {
            w: false,
            pi: false,
            sigma: false,
            mu: false,
        }
    }

    pub fn all() -> Self {
        Self {
            w: true,
            pi: true,
            sigma: true,
            mu: true,
        }
    }

    pub fn from_params(params: &[Param]) -> Self {
        let mut learn = Self::none();
        for param in params {
            match param {
                Param::W => learn.w = true,
                Param::Pi => learn.pi = true,
                Param::Sigma => learn.sigma = true,
                Param::Mu => learn.mu = true,
            }
        }
        learn
    }

    pub fn contains(&self, param: Param) -> bool {
        match param {
            Param::W => self.w,
            Param::Pi => self.pi,
            Param::Sigma => self.sigma,
            Param::Mu => self.mu,
        }
    }

    /// The learned parameters, in the order their reductions are performed
    pub fn params(&self) -> Vec<Param> {
        [Param::W, Param::Pi, Param::Sigma, Param::Mu]
            .into_iter()
            .filter(|p| self.contains(*p))
            .collect()
    }
}

/// Value of a single parameter, as reported to the annealing schedule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParamValue {
    Matrix(Array2<f64>),
    Scalar(f64),
    Vector(Array1<f64>),
}

impl ParamValue {
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            ParamValue::Scalar(v) => Some(*v),
            _ => None,
        }
    }
}

/// Parameters of the binary sparse coding model
///
/// * `w` - dictionary, one row per cause (H x D)
/// * `pi` - prior probability of each cause being active
/// * `sigma` - standard deviation of the Gaussian observation noise
/// * `mu` - mean offset of the data. `None` is treated as the zero vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelParameters {
    pub w: Array2<f64>,
    pub pi: f64,
    pub sigma: f64,
    #[serde(default)]
    pub mu: Option<Array1<f64>>,
}

impl ModelParameters {
    pub fn new(w: Array2<f64>, pi: f64, sigma: f64) -> Self {
        Self {
            w,
            pi,
            sigma,
            mu: None,
        }
    }

    pub fn with_mu(mut self, mu: Array1<f64>) -> Self {
        self.mu = Some(mu);
        self
    }

    /// Number of causes
    pub fn h(&self) -> usize {
        self.w.nrows()
    }

    /// Data dimensionality
    pub fn d(&self) -> usize {
        self.w.ncols()
    }

    /// The mean offset, or the zero vector if none was set
    pub fn mu_or_zero(&self) -> Array1<f64> {
        self.mu
            .clone()
            .unwrap_or_else(|| Array1::zeros(self.d()))
    }

    pub fn value(&self, param: Param) -> ParamValue {
        match param {
            Param::W => ParamValue::Matrix(self.w.clone()),
            Param::Pi => ParamValue::Scalar(self.pi),
            Param::Sigma => ParamValue::Scalar(self.sigma),
            Param::Mu => ParamValue::Vector(self.mu_or_zero()),
        }
    }

    /// Check the parameters against the model dimensions
    pub fn validate(&self, h: usize, d: usize) -> Result<()> {
        if self.w.dim() != (h, d) {
            return Err(EtError::ShapeMismatch(format!(
                "W has shape {:?}, expected ({}, {})",
                self.w.dim(),
                h,
                d
            ))
            .into());
        }
        if let Some(mu) = &self.mu {
            if mu.len() != d {
                return Err(EtError::ShapeMismatch(format!(
                    "mu has length {}, expected {}",
                    mu.len(),
                    d
                ))
                .into());
            }
        }
        if !(self.pi > 0.0 && self.pi < 1.0) {
            return Err(eyre!("pi must lie in (0, 1), got {}", self.pi));
        }
        if !(self.sigma > 0.0) || !self.sigma.is_finite() {
            return Err(eyre!("sigma must be positive and finite, got {}", self.sigma));
        }
        Ok(())
    }

    /// Data-driven starting point for a run.
    ///
    /// Every worker contributes its shard to the global mean and variance. Dictionary rows are
    /// drawn on rank 0 as `mean + N(0, 1) * std` per dimension and broadcast, so all workers
    /// start from the same parameters. `pi` starts at `1/H` and `sigma` at the mean standard
    /// deviation over dimensions.
    pub fn standard_init<C, R>(comm: &C, h: usize, y: &Array2<f64>, rng: &mut R) -> Result<Self>
    where
        C: Communicator,
        R: Rng,
    {
        let d = y.ncols();
        let n = comm.allreduce_count(y.nrows())?;
        if n == 0 || h == 0 {
            return Err(EtError::InvalidConfiguration(
                "cannot initialise from an empty batch or without causes".to_string(),
            )
            .into());
        }
        let sum = comm.allreduce_array(&y.sum_axis(Axis(0)))?;
        let sq_sum = comm.allreduce_array(&y.mapv(|v| v * v).sum_axis(Axis(0)))?;
        let mean = &sum / n as f64;
        let var = (&sq_sum / n as f64 - &mean.mapv(|m| m * m)).mapv(|v| v.max(0.0));
        let std = var.mapv(f64::sqrt);

        let draw = if comm.rank() == 0 {
            let w = Array2::from_shape_fn((h, d), |(_, j)| {
                let z: f64 = rng.sample(StandardNormal);
                mean[j] + z * std[j]
            });
            Payload::Float(w.into_raw_vec())
        } else {
            Payload::Float(Vec::new())
        };
        let w = Array2::from_shape_vec((h, d), comm.broadcast(draw, 0)?.into_floats()?)?;

        let sigma = std.mean().unwrap_or(1.0);
        tracing::debug!("Initial sigma {:.4} from {} datapoints", sigma, n);
        Ok(Self::new(w, 1.0 / h as f64, if sigma > 0.0 { sigma } else { 1.0 }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::SingleProcess;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_param_names_roundtrip() {
        for p in [Param::W, Param::Pi, Param::Sigma, Param::Mu] {
            assert_eq!(p.name().parse::<Param>().unwrap(), p);
        }
        assert!("beta".parse::<Param>().is_err());
    }

    #[test]
    fn test_to_learn_order() {
        let learn = ToLearn::from_params(&[Param::Mu, Param::W]);
        assert_eq!(learn.params(), vec![Param::W, Param::Mu]);
        assert!(!learn.contains(Param::Pi));
        assert_eq!(ToLearn::default().params().len(), 3);
    }

    #[test]
    fn test_missing_mu_is_zero() {
        let params = ModelParameters::new(array![[1.0, 2.0, 3.0]], 0.5, 1.0);
        assert_eq!(params.mu_or_zero(), array![0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_validate_shapes() {
        let params = ModelParameters::new(Array2::zeros((3, 2)), 0.2, 1.0);
        assert!(params.validate(3, 2).is_ok());
        let err = params.validate(2, 3).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EtError>(),
            Some(EtError::ShapeMismatch(_))
        ));
        let bad_pi = ModelParameters::new(Array2::zeros((3, 2)), 1.0, 1.0);
        assert!(bad_pi.validate(3, 2).is_err());
    }

    #[test]
    fn test_standard_init() {
        let y = array![[1.0, 10.0], [3.0, 10.0], [2.0, 10.0]];
        let mut rng = StdRng::seed_from_u64(347);
        let params = ModelParameters::standard_init(&SingleProcess, 4, &y, &mut rng).unwrap();
        assert_eq!(params.w.dim(), (4, 2));
        assert_eq!(params.pi, 0.25);
        // The second dimension has no spread, so every row sits on its mean
        for row in params.w.rows() {
            assert!((row[1] - 10.0).abs() < 1e-12);
        }
        assert!(params.sigma > 0.0);
        assert!(params.mu.is_none());
    }
}

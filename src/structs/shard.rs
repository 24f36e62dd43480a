use eyre::{eyre, Result};
use ndarray::{Array1, Array2, Axis};
use rand::Rng;
use rand_distr::{Distribution, Normal};

use crate::error::EtError;

/// The rows of the global batch owned by one worker
///
/// * `y` - observations (my_N x D)
/// * `labels` - optional integer label per observation
/// * `candidates` - candidate causes per observation (my_N x Hprime), set by candidate selection
/// * `data_noise` - optional additive noise applied to `y` during the M-step
#[derive(Debug, Clone, PartialEq)]
pub struct DataShard {
    pub y: Array2<f64>,
    pub labels: Option<Array1<i64>>,
    pub candidates: Option<Array2<usize>>,
    pub data_noise: Option<Array2<f64>>,
}

impl DataShard {
    pub fn new(y: Array2<f64>) -> Self {
        Self {
            y,
            labels: None,
            candidates: None,
            data_noise: None,
        }
    }

    pub fn with_labels(mut self, labels: Array1<i64>) -> Result<Self> {
        if labels.len() != self.len() {
            return Err(EtError::ShapeMismatch(format!(
                "{} labels for {} observations",
                labels.len(),
                self.len()
            ))
            .into());
        }
        self.labels = Some(labels);
        Ok(self)
    }

    /// Number of local datapoints (my_N)
    pub fn len(&self) -> usize {
        self.y.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Data dimensionality
    pub fn dim(&self) -> usize {
        self.y.ncols()
    }

    /// The candidate sets, failing if candidate selection has not run on this shard
    pub fn candidates(&self) -> Result<&Array2<usize>> {
        self.candidates
            .as_ref()
            .ok_or_else(|| eyre!("no candidate sets attached to the shard, run candidate selection first"))
    }

    /// Keep only the rows in `keep`, filtering every per-row field identically
    pub fn select_rows(&self, keep: &[usize]) -> Self {
        Self {
            y: self.y.select(Axis(0), keep),
            labels: self.labels.as_ref().map(|l| l.select(Axis(0), keep)),
            candidates: self.candidates.as_ref().map(|c| c.select(Axis(0), keep)),
            data_noise: self.data_noise.as_ref().map(|n| n.select(Axis(0), keep)),
        }
    }

    /// Draw a fresh N(0, scale^2) noise matrix for the M-step
    pub fn add_data_noise<R: Rng>(&mut self, scale: f64, rng: &mut R) -> Result<()> {
        let normal = Normal::new(0.0, scale).map_err(|e| eyre!("invalid data noise scale {}: {}", scale, e))?;
        self.data_noise = Some(Array2::from_shape_fn(self.y.dim(), |_| normal.sample(rng)));
        Ok(())
    }

    /// Split into `parts` contiguous shards, the first ones taking the remainder rows
    pub fn split(&self, parts: usize) -> Vec<DataShard> {
        let parts = parts.max(1);
        let n = self.len();
        let base = n / parts;
        let extra = n % parts;
        let mut start = 0;
        (0..parts)
            .map(|i| {
                let len = base + usize::from(i < extra);
                let rows: Vec<usize> = (start..start + len).collect();
                start += len;
                self.select_rows(&rows)
            })
            .collect()
    }

    /// Observations with the M-step noise added, if any
    pub(crate) fn noisy_y(&self, scale: f64) -> Array2<f64> {
        match (&self.data_noise, scale > 0.0) {
            (Some(noise), true) => &self.y + noise,
            _ => self.y.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn shard() -> DataShard {
        DataShard::new(array![[0.0, 1.0], [1.0, 1.0], [2.0, 1.0], [3.0, 1.0], [4.0, 1.0]])
            .with_labels(array![0, 1, 0, 1, 2])
            .unwrap()
    }

    #[test]
    fn test_select_rows_is_consistent() {
        let mut shard = shard();
        shard.candidates = Some(array![[0, 1], [1, 2], [0, 2], [2, 1], [1, 0]]);
        let kept = shard.select_rows(&[1, 3]);
        assert_eq!(kept.y, array![[1.0, 1.0], [3.0, 1.0]]);
        assert_eq!(kept.labels, Some(array![1, 1]));
        assert_eq!(kept.candidates, Some(array![[1, 2], [2, 1]]));
        assert!(kept.data_noise.is_none());
    }

    #[test]
    fn test_split_covers_all_rows() {
        let parts = shard().split(3);
        assert_eq!(parts.iter().map(|p| p.len()).collect::<Vec<_>>(), vec![2, 2, 1]);
        assert_eq!(parts[2].y, array![[4.0, 1.0]]);
    }

    #[test]
    fn test_label_length_checked() {
        let err = DataShard::new(Array2::zeros((3, 2)))
            .with_labels(array![1, 2])
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EtError>(),
            Some(EtError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_data_noise_only_applied_when_enabled() {
        let mut shard = shard();
        let mut rng = StdRng::seed_from_u64(1);
        shard.add_data_noise(0.5, &mut rng).unwrap();
        assert_eq!(shard.noisy_y(0.0), shard.y);
        assert_ne!(shard.noisy_y(0.5), shard.y);
    }

    #[test]
    fn test_candidates_required() {
        assert!(shard().candidates().is_err());
    }
}

//! Synthetic data from the generative model, for diagnostics and tests

use eyre::{eyre, Result};
use ndarray::Array2;
use rand::Rng;
use rand_distr::{Distribution, Normal};

use crate::error::EtError;
use crate::structs::params::ModelParameters;
use crate::structs::shard::DataShard;

/// Draw `n` binary hidden vectors, every cause active with probability `pi`
pub fn generate_hidden<R: Rng>(h: usize, pi: f64, n: usize, rng: &mut R) -> Result<Array2<bool>> {
    if !(0.0..=1.0).contains(&pi) {
        return Err(eyre!("pi must lie in [0, 1], got {}", pi));
    }
    Ok(Array2::from_shape_fn((n, h), |_| rng.gen_bool(pi)))
}

/// Observations `y_n = sum_h s_nh W_h + mu + N(0, sigma^2)` for the given hidden vectors.
///
/// The number of active causes is not capped at `gamma`.
pub fn generate_from_hidden<R: Rng>(
    params: &ModelParameters,
    s: &Array2<bool>,
    rng: &mut R,
) -> Result<DataShard> {
    let (h, d) = params.w.dim();
    if s.ncols() != h {
        return Err(EtError::ShapeMismatch(format!(
            "hidden vectors have {} causes, W has {}",
            s.ncols(),
            h
        ))
        .into());
    }
    let noise = Normal::new(0.0, params.sigma)
        .map_err(|e| eyre!("invalid sigma {}: {}", params.sigma, e))?;

    let s = s.mapv(|active| if active { 1.0 } else { 0.0 });
    let mut y = s.dot(&params.w);
    y.mapv_inplace(|v| v + noise.sample(rng));
    if let Some(mu) = &params.mu {
        y += mu;
    }
    tracing::debug!("Generated {} datapoints of dimension {}", y.nrows(), d);
    Ok(DataShard::new(y))
}

/// Observations for single-cause hidden vectors cycling through the causes, without noise
pub fn single_cause_data(params: &ModelParameters, n: usize) -> DataShard {
    let h = params.h();
    let mu = params.mu_or_zero();
    let mut y = Array2::zeros((n, params.d()));
    for (i, mut row) in y.rows_mut().into_iter().enumerate() {
        row.assign(&(&params.w.row(i % h) + &mu));
    }
    DataShard::new(y)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn active_counts(s: &Array2<bool>) -> Vec<usize> {
        s.rows()
            .into_iter()
            .map(|row| row.iter().filter(|&&a| a).count())
            .collect()
    }

    #[test]
    fn test_hidden_activation_rate() {
        let mut rng = StdRng::seed_from_u64(347);
        let s = generate_hidden(5, 0.2, 4000, &mut rng).unwrap();
        let rate = active_counts(&s).iter().sum::<usize>() as f64 / (5.0 * 4000.0);
        assert!((rate - 0.2).abs() < 0.02);
    }

    #[test]
    fn test_generated_means_match_dictionary() {
        let mut rng = StdRng::seed_from_u64(1);
        let params = ModelParameters::new(array![[1.0, 0.0], [0.0, 2.0]], 0.5, 0.05)
            .with_mu(array![10.0, -10.0]);
        let s = array![[true, false], [true, true], [false, false]];
        let shard = generate_from_hidden(&params, &s, &mut rng).unwrap();
        let expected = array![[11.0, -10.0], [11.0, -8.0], [10.0, -10.0]];
        for (v, e) in shard.y.iter().zip(expected.iter()) {
            assert!((v - e).abs() < 0.5);
        }
    }

    #[test]
    fn test_shape_checked() {
        let mut rng = StdRng::seed_from_u64(1);
        let params = ModelParameters::new(Array2::zeros((3, 2)), 0.5, 1.0);
        let s = Array2::from_elem((4, 2), false);
        assert!(generate_from_hidden(&params, &s, &mut rng).is_err());
    }

    #[test]
    fn test_single_cause_data() {
        let params = ModelParameters::new(array![[1.0, 0.0], [0.0, 1.0]], 0.5, 1.0);
        let shard = single_cause_data(&params, 3);
        assert_eq!(shard.y, array![[1.0, 0.0], [0.0, 1.0], [1.0, 0.0]]);
    }
}

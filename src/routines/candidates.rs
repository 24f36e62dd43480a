use eyre::Result;
use ndarray::{Array1, Array2, ArrayView1, Axis};
use rand::Rng;
use rayon::prelude::*;
use serde_derive::{Deserialize, Serialize};

use crate::comm::{Communicator, Payload};
use crate::error::EtError;
use crate::structs::shard::DataShard;

/// Per-label restriction of the causes eligible as candidates.
///
/// Row `i` of the mask belongs to `labels[i]`; the labels are the sorted unique labels of
/// the whole batch. The mask is created once per run and reused for every iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelMask {
    labels: Vec<i64>,
    mask: Array2<bool>,
}

impl LabelMask {
    /// Draw a random mask on rank 0 and broadcast it, so all workers agree.
    ///
    /// Collective: every worker must call this with its own labels.
    pub fn initialize<C, R>(comm: &C, labels: &Array1<i64>, h: usize, rng: &mut R) -> Result<Self>
    where
        C: Communicator,
        R: Rng,
    {
        let labels = comm.allunique(&labels.to_vec())?;
        let draw = if comm.rank() == 0 {
            Payload::Bool((0..labels.len() * h).map(|_| rng.gen_bool(0.5)).collect())
        } else {
            Payload::Bool(Vec::new())
        };
        let mask = comm.broadcast(draw, 0)?.into_bools()?;
        let mask = Array2::from_shape_vec((labels.len(), h), mask)?;
        tracing::debug!(
            "Label mask initialised for {} labels over {} causes",
            labels.len(),
            h
        );
        Ok(Self { labels, mask })
    }

    /// Build a mask from known labels and their rows
    pub fn from_parts(labels: Vec<i64>, mask: Array2<bool>) -> Result<Self> {
        if labels.len() != mask.nrows() {
            return Err(EtError::ShapeMismatch(format!(
                "{} labels for a mask with {} rows",
                labels.len(),
                mask.nrows()
            ))
            .into());
        }
        if labels.windows(2).any(|w| w[0] >= w[1]) {
            return Err(EtError::InvalidConfiguration(
                "mask labels must be sorted and unique".to_string(),
            )
            .into());
        }
        Ok(Self { labels, mask })
    }

    pub fn labels(&self) -> &[i64] {
        &self.labels
    }

    pub fn mask(&self) -> &Array2<bool> {
        &self.mask
    }

    /// Causes eligible for datapoints carrying `label`
    pub fn eligible(&self, label: i64) -> Result<ArrayView1<bool>> {
        let row = self.labels.binary_search(&label).map_err(|_| {
            EtError::InvalidConfiguration(format!("label {} has no mask entry", label))
        })?;
        Ok(self.mask.row(row))
    }
}

/// Cosine similarity between `y` and every row of `w`.
///
/// Undefined similarities (zero-norm rows or observation) rank lowest.
fn similarity(w: &Array2<f64>, w_norms: &Array1<f64>, y: ArrayView1<f64>) -> Array1<f64> {
    let y_norm = y.dot(&y).sqrt();
    let sim = w.dot(&y) / w_norms / y_norm;
    sim.mapv(|s| if s.is_nan() { f64::NEG_INFINITY } else { s })
}

/// Indices of the `hprime` most similar causes among `eligible`, least similar first
fn top_candidates(sim: &Array1<f64>, eligible: impl Iterator<Item = usize>, hprime: usize) -> Vec<usize> {
    let mut order: Vec<usize> = eligible.collect();
    // Stable, so ties keep index order
    order.sort_by(|&a, &b| sim[a].total_cmp(&sim[b]));
    order.split_off(order.len() - hprime)
}

/// Select `hprime` candidate causes for every datapoint and attach them to the shard.
///
/// Candidates are the causes whose dictionary rows have the highest cosine similarity with
/// the observation. With a label mask, only the causes enabled for the datapoint's label
/// are considered.
pub fn select_candidates(
    w: &Array2<f64>,
    shard: &mut DataShard,
    hprime: usize,
    mask: Option<&LabelMask>,
) -> Result<()> {
    let (h, d) = w.dim();
    if hprime == 0 || hprime > h {
        return Err(EtError::InvalidConfiguration(format!(
            "Hprime must lie in [1, {}], got {}",
            h, hprime
        ))
        .into());
    }
    if shard.dim() != d {
        return Err(EtError::ShapeMismatch(format!(
            "observations have {} dimensions, W has {}",
            shard.dim(),
            d
        ))
        .into());
    }
    let labels = match mask {
        Some(mask) => {
            if mask.mask().ncols() != h {
                return Err(EtError::ShapeMismatch(format!(
                    "label mask covers {} causes, W has {}",
                    mask.mask().ncols(),
                    h
                ))
                .into());
            }
            let labels = shard.labels.as_ref().ok_or_else(|| {
                EtError::InvalidConfiguration(
                    "a label mask was given but the shard carries no labels".to_string(),
                )
            })?;
            Some((mask, labels))
        }
        None => None,
    };

    let w_norms = w.map_axis(Axis(1), |row| row.dot(&row).sqrt());
    let rows: Vec<Vec<usize>> = (0..shard.len())
        .into_par_iter()
        .map(|n| {
            let sim = similarity(w, &w_norms, shard.y.row(n));
            match labels {
                Some((mask, labels)) => {
                    let eligible = mask.eligible(labels[n])?;
                    let count = eligible.iter().filter(|&&m| m).count();
                    if count < hprime {
                        return Err(EtError::InvalidConfiguration(format!(
                            "label {} enables {} causes, fewer than Hprime = {}",
                            labels[n], count, hprime
                        ))
                        .into());
                    }
                    Ok(top_candidates(
                        &sim,
                        (0..h).filter(|&c| eligible[c]),
                        hprime,
                    ))
                }
                None => Ok(top_candidates(&sim, 0..h, hprime)),
            }
        })
        .collect::<Result<Vec<_>>>()?;

    let flat: Vec<usize> = rows.into_iter().flatten().collect();
    shard.candidates = Some(Array2::from_shape_vec((shard.len(), hprime), flat)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::{LocalGroup, SingleProcess};
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn dictionary() -> Array2<f64> {
        array![[1.0, 0.0], [0.0, 1.0], [1.0, 1.0], [-1.0, 0.0]]
    }

    #[test]
    fn test_selects_most_similar() {
        let mut shard = DataShard::new(array![[2.0, 0.1], [0.0, 3.0]]);
        select_candidates(&dictionary(), &mut shard, 2, None).unwrap();
        let cand = shard.candidates.unwrap();
        // Ascending similarity, best match last
        assert_eq!(cand.row(0).to_vec(), vec![2, 0]);
        assert_eq!(cand.row(1).to_vec(), vec![2, 1]);
    }

    #[test]
    fn test_candidates_distinct_and_in_range() {
        let w = array![[0.3, 0.1, 0.2], [0.5, 0.5, 0.5], [0.0, 1.0, 0.0], [1.0, 0.0, 0.0], [0.2, 0.2, 0.9]];
        let mut shard = DataShard::new(array![
            [1.0, 2.0, 3.0],
            [0.0, 0.0, 0.0],
            [-1.0, 0.5, 0.5],
            [0.1, 0.1, 0.1]
        ]);
        for hprime in 1..=5 {
            select_candidates(&w, &mut shard, hprime, None).unwrap();
            let cand = shard.candidates.clone().unwrap();
            assert_eq!(cand.dim(), (4, hprime));
            for row in cand.rows() {
                let mut v = row.to_vec();
                assert!(v.iter().all(|&c| c < 5));
                v.sort_unstable();
                v.dedup();
                assert_eq!(v.len(), hprime);
            }
        }
    }

    #[test]
    fn test_invalid_hprime() {
        let mut shard = DataShard::new(array![[1.0, 0.0]]);
        assert!(select_candidates(&dictionary(), &mut shard, 0, None).is_err());
        assert!(select_candidates(&dictionary(), &mut shard, 5, None).is_err());
    }

    #[test]
    fn test_label_mask_restricts_candidates() {
        let mask = LabelMask::from_parts(
            vec![0, 1],
            array![[true, false, true, true], [false, true, true, false]],
        )
        .unwrap();
        let mut shard = DataShard::new(array![[1.0, 0.0], [1.0, 0.0]])
            .with_labels(array![0, 1])
            .unwrap();
        select_candidates(&dictionary(), &mut shard, 2, Some(&mask)).unwrap();
        let cand = shard.candidates.unwrap();
        assert_eq!(cand.row(0).to_vec(), vec![2, 0]);
        assert_eq!(cand.row(1).to_vec(), vec![1, 2]);
    }

    #[test]
    fn test_label_mask_with_too_few_causes() {
        let mask = LabelMask::from_parts(vec![3], array![[true, false, false, false]]).unwrap();
        let mut shard = DataShard::new(array![[1.0, 0.0]])
            .with_labels(array![3])
            .unwrap();
        let err = select_candidates(&dictionary(), &mut shard, 2, Some(&mask)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EtError>(),
            Some(EtError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_mask_requires_labels() {
        let mask = LabelMask::from_parts(vec![0], array![[true, true, true, true]]).unwrap();
        let mut shard = DataShard::new(array![[1.0, 0.0]]);
        assert!(select_candidates(&dictionary(), &mut shard, 2, Some(&mask)).is_err());
    }

    #[test]
    fn test_mask_initialization_single_process() {
        let mut rng = StdRng::seed_from_u64(347);
        let mask = LabelMask::initialize(&SingleProcess, &array![2, 0, 2, 5], 6, &mut rng).unwrap();
        assert_eq!(mask.labels(), &[0, 2, 5]);
        assert_eq!(mask.mask().dim(), (3, 6));
        assert!(mask.eligible(2).is_ok());
        assert!(mask.eligible(1).is_err());
    }

    #[test]
    fn test_mask_identical_on_all_workers() {
        let masks = LocalGroup::run(3, |comm| {
            // Each worker seeds differently, only rank 0 draws
            let mut rng = StdRng::seed_from_u64(comm.rank() as u64);
            let labels = array![comm.rank() as i64, 7];
            LabelMask::initialize(&comm, &labels, 4, &mut rng)
        })
        .unwrap();
        assert_eq!(masks[0].labels(), &[0, 1, 2, 7]);
        assert!(masks.iter().all(|m| m == &masks[0]));
    }
}

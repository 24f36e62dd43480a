//! Collective operations between the workers that share a batch.
//!
//! Every worker owns a disjoint shard of the data and all of them must enter the same
//! collectives in the same order. The only primitive an implementation has to provide is
//! [Communicator::allgather]; sum-reduction, global sort, unique and broadcast are built on
//! top of it and combine contributions in rank order, so every worker computes bit-identical
//! results.

use eyre::Result;
use ndarray::{Array, Dimension};

use crate::error::EtError;

pub mod local;

pub use local::{LocalComm, LocalGroup};

/// The value a worker contributes to a collective
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Float(Vec<f64>),
    Int(Vec<i64>),
    Bool(Vec<bool>),
}

impl Payload {
    fn kind(&self) -> &'static str {
        match self {
            Payload::Float(_) => "float",
            Payload::Int(_) => "int",
            Payload::Bool(_) => "bool",
        }
    }

    pub fn into_floats(self) -> Result<Vec<f64>> {
        match self {
            Payload::Float(v) => Ok(v),
            other => Err(mismatch("float", other.kind())),
        }
    }

    pub fn into_ints(self) -> Result<Vec<i64>> {
        match self {
            Payload::Int(v) => Ok(v),
            other => Err(mismatch("int", other.kind())),
        }
    }

    pub fn into_bools(self) -> Result<Vec<bool>> {
        match self {
            Payload::Bool(v) => Ok(v),
            other => Err(mismatch("bool", other.kind())),
        }
    }
}

fn mismatch(expected: &str, got: &str) -> eyre::Report {
    EtError::CollectiveMismatch(format!("expected a {} payload, got {}", expected, got)).into()
}

/// Execution context for the distributed parts of an EM iteration
pub trait Communicator: Sync {
    /// Rank of this worker, in `0..size()`
    fn rank(&self) -> usize;

    /// Number of workers
    fn size(&self) -> usize;

    /// Contribute `payload` and receive the contributions of all workers, indexed by rank.
    ///
    /// Blocks until every worker has contributed.
    fn allgather(&self, payload: Payload) -> Result<Vec<Payload>>;

    /// Element-wise sum of `values` over all workers
    fn allreduce(&self, values: &[f64]) -> Result<Vec<f64>> {
        let gathered = self.allgather(Payload::Float(values.to_vec()))?;
        let mut sum = vec![0.0; values.len()];
        for (rank, payload) in gathered.into_iter().enumerate() {
            let part = payload.into_floats()?;
            if part.len() != sum.len() {
                return Err(EtError::CollectiveMismatch(format!(
                    "rank {} contributed {} values to a reduction of {}",
                    rank,
                    part.len(),
                    sum.len()
                ))
                .into());
            }
            for (s, v) in sum.iter_mut().zip(part) {
                *s += v;
            }
        }
        Ok(sum)
    }

    fn allreduce_scalar(&self, value: f64) -> Result<f64> {
        Ok(self.allreduce(&[value])?[0])
    }

    fn allreduce_count(&self, value: usize) -> Result<usize> {
        let gathered = self.allgather(Payload::Int(vec![value as i64]))?;
        let mut total = 0;
        for payload in gathered {
            total += payload.into_ints()?.iter().sum::<i64>();
        }
        Ok(total as usize)
    }

    /// Sum of an array of any dimension over all workers. Shapes must agree.
    fn allreduce_array<D: Dimension>(&self, values: &Array<f64, D>) -> Result<Array<f64, D>>
    where
        Self: Sized,
    {
        let flat: Vec<f64> = values.iter().copied().collect();
        let sum = self.allreduce(&flat)?;
        Ok(Array::from_shape_vec(values.raw_dim(), sum)?)
    }

    /// All workers' values in one ascending array, identical on every worker
    fn allsort(&self, values: &[f64]) -> Result<Vec<f64>> {
        let mut all = Vec::new();
        for payload in self.allgather(Payload::Float(values.to_vec()))? {
            all.extend(payload.into_floats()?);
        }
        all.sort_by(|a, b| a.total_cmp(b));
        Ok(all)
    }

    /// Sorted unique values over all workers
    fn allunique(&self, values: &[i64]) -> Result<Vec<i64>> {
        let mut all = Vec::new();
        for payload in self.allgather(Payload::Int(values.to_vec()))? {
            all.extend(payload.into_ints()?);
        }
        all.sort_unstable();
        all.dedup();
        Ok(all)
    }

    /// The payload of `root`, delivered to every worker. Other workers' payloads are ignored.
    fn broadcast(&self, value: Payload, root: usize) -> Result<Payload> {
        let size = self.size();
        self.allgather(value)?
            .into_iter()
            .nth(root)
            .ok_or_else(|| {
                EtError::CollectiveMismatch(format!(
                    "broadcast root {} outside a group of {}",
                    root, size
                ))
                .into()
            })
    }
}

/// A group of one: every collective returns the local value
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleProcess;

impl Communicator for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn allgather(&self, payload: Payload) -> Result<Vec<Payload>> {
        Ok(vec![payload])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_single_process_collectives() {
        let comm = SingleProcess;
        assert_eq!(comm.allreduce(&[1.0, 2.0]).unwrap(), vec![1.0, 2.0]);
        assert_eq!(comm.allreduce_count(7).unwrap(), 7);
        assert_eq!(comm.allsort(&[3.0, 1.0, 2.0]).unwrap(), vec![1.0, 2.0, 3.0]);
        assert_eq!(comm.allunique(&[2, 1, 2, 5]).unwrap(), vec![1, 2, 5]);
        let a = array![[1.0, 2.0], [3.0, 4.0]];
        assert_eq!(comm.allreduce_array(&a).unwrap(), a);
        assert_eq!(
            comm.broadcast(Payload::Bool(vec![true]), 0).unwrap(),
            Payload::Bool(vec![true])
        );
        assert!(comm.broadcast(Payload::Bool(vec![true]), 1).is_err());
    }

    #[test]
    fn test_payload_kind_mismatch() {
        let err = Payload::Int(vec![1]).into_floats().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EtError>(),
            Some(EtError::CollectiveMismatch(_))
        ));
    }
}

use eyre::Result;

use crate::comm::Communicator;
use crate::error::EtError;
use crate::routines::prior::TruncatedPrior;
use crate::structs::shard::DataShard;
use crate::structs::suffstats::SufficientStatistics;

/// Batch sizes before and after evidence truncation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Truncation {
    /// Global number of datapoints
    pub n: usize,
    /// Global number of datapoints kept
    pub n_use: usize,
}

/// Number of datapoints to keep, `floor(N (1 - (1 - A) Ncut_factor))`, at least one
pub fn target_n_use(n: usize, a: f64, ncut_factor: f64) -> usize {
    let target = (n as f64 * (1.0 - (1.0 - a) * ncut_factor)).floor();
    (target as usize).clamp(1, n.max(1))
}

/// Discard the lowest-evidence datapoints of the global batch.
///
/// Collective. Reduces the global batch size, and when `ncut_factor > 0` sorts the evidence
/// of all workers, keeps every local row whose evidence reaches the cutoff and reduces the
/// number of kept rows. Ties at the cutoff are all kept, so `n_use` can exceed the target.
/// Shard and statistics are filtered with the same rows.
pub fn truncate<C>(
    comm: &C,
    ncut_factor: f64,
    prior: &TruncatedPrior,
    shard: &mut DataShard,
    stats: &mut SufficientStatistics,
) -> Result<Truncation>
where
    C: Communicator,
{
    if stats.nrows() != shard.len() {
        return Err(EtError::ShapeMismatch(format!(
            "{} rows of statistics for {} datapoints",
            stats.nrows(),
            shard.len()
        ))
        .into());
    }
    if !(0.0..=1.0).contains(&ncut_factor) {
        return Err(EtError::InvalidConfiguration(format!(
            "Ncut_factor must lie in [0, 1], got {}",
            ncut_factor
        ))
        .into());
    }

    let n = comm.allreduce_count(shard.len())?;
    if n == 0 {
        return Err(EtError::InvalidConfiguration("the global batch is empty".to_string()).into());
    }
    if ncut_factor == 0.0 {
        return Ok(Truncation { n, n_use: n });
    }

    let target = target_n_use(n, prior.a, ncut_factor);
    let evidence = stats.log_evidence();
    let sorted = comm.allsort(&evidence.to_vec())?;
    let cut = sorted[sorted.len() - target];

    let keep: Vec<usize> = evidence
        .iter()
        .enumerate()
        .filter(|(_, &e)| e >= cut)
        .map(|(i, _)| i)
        .collect();
    if keep.len() < shard.len() {
        *shard = shard.select_rows(&keep);
        *stats = stats.select_rows(&keep);
    }
    let n_use = comm.allreduce_count(keep.len())?;
    tracing::debug!(
        "Truncation kept {} of {} datapoints (target {}, cutoff {:.4})",
        n_use,
        n,
        target,
        cut
    );
    Ok(Truncation { n, n_use })
}

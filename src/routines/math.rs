//! Numerical helpers shared by the E- and M-step
//!
//! Log-sum-exp with the "shift by max" trick and a least-squares solver that tolerates
//! rank-deficient systems.

use eyre::{eyre, Result};
use linfa_linalg::svd::SVD;
use ndarray::{Array1, Array2, ArrayView1, Axis};
use ndarray_stats::QuantileExt;

/// Compute `log(sum(exp(x_i)))` in a numerically stable way.
///
/// `logsumexp(x) = max(x) + log(sum(exp(x_i - max(x))))`
///
/// Returns `f64::NEG_INFINITY` for an empty row or a row of `-inf`.
#[inline]
pub fn logsumexp(values: ArrayView1<f64>) -> f64 {
    if values.is_empty() {
        return f64::NEG_INFINITY;
    }

    let max_val = *values.max_skipnan();

    if max_val.is_infinite() {
        max_val
    } else {
        max_val + values.iter().map(|&x| (x - max_val).exp()).sum::<f64>().ln()
    }
}

/// Log-sum-exp of every row of a matrix
pub fn logsumexp_rows(matrix: &Array2<f64>) -> Array1<f64> {
    matrix.map_axis(Axis(1), logsumexp)
}

/// Exponentiate a row after subtracting its maximum.
///
/// Returns the shifted exponentials and their sum. The largest entry maps to 1, so the sum
/// is at least 1 for any row with a finite maximum.
pub fn shifted_exp(row: ArrayView1<f64>) -> (Array1<f64>, f64) {
    let corr = *row.max_skipnan();
    let pjb = row.mapv(|x| (x - corr).exp());
    let denom = pjb.sum();
    (pjb, denom)
}

/// Squared euclidean distance between two vectors
#[inline]
pub fn sq_dist(a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y).powi(2)).sum()
}

/// Minimum-norm least-squares solution `X` of `A X = B`.
///
/// Solved through the SVD of `A`; singular values below `eps * max(m, n) * s_max` are
/// treated as zero, so rank-deficient and singular systems return their best fit instead
/// of failing.
pub fn lstsq(a: &Array2<f64>, b: &Array2<f64>) -> Result<Array2<f64>> {
    if a.nrows() != b.nrows() {
        return Err(eyre!(
            "lstsq: A has {} rows but B has {}",
            a.nrows(),
            b.nrows()
        ));
    }
    if a.iter().all(|v| *v == 0.0) {
        return Ok(Array2::zeros((a.ncols(), b.ncols())));
    }
    let (u, s, vt) = a.svd(true, true)?;
    let (u, vt) = match (u, vt) {
        (Some(u), Some(vt)) => (u, vt),
        _ => return Err(eyre!("lstsq: SVD did not return singular vectors")),
    };

    let s_max = s.iter().fold(0.0_f64, |acc, v| acc.max(v.abs()));
    let cutoff = f64::EPSILON * a.nrows().max(a.ncols()) as f64 * s_max;
    let rank = s.iter().filter(|v| v.abs() > cutoff).count();
    if rank < a.ncols().min(a.nrows()) {
        tracing::debug!("lstsq: rank deficient system (rank {} of {})", rank, a.ncols());
    }
    let s_inv = s.mapv(|v| if v.abs() > cutoff { 1.0 / v } else { 0.0 });

    // X = V diag(1/s) U^T B
    let utb = u.t().dot(b);
    let scaled = &utb * &s_inv.insert_axis(Axis(1));
    Ok(vt.t().dot(&scaled))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_logsumexp_basic() {
        let values = array![-1.0, -2.0, -3.0];
        let result = logsumexp(values.view());
        let expected = ((-1.0_f64).exp() + (-2.0_f64).exp() + (-3.0_f64).exp()).ln();
        assert!((result - expected).abs() < 1e-10);
    }

    #[test]
    fn test_logsumexp_empty() {
        let values: Array1<f64> = array![];
        let result = logsumexp(values.view());
        assert!(result.is_infinite() && result.is_sign_negative());
    }

    #[test]
    fn test_logsumexp_all_neg_inf() {
        let values = array![f64::NEG_INFINITY, f64::NEG_INFINITY];
        let result = logsumexp(values.view());
        assert!(result.is_infinite() && result.is_sign_negative());
    }

    #[test]
    fn test_logsumexp_large_values() {
        // Naive exponentiation overflows here
        let values = array![1000.0, 1001.0, 1002.0];
        let result = logsumexp(values.view());
        let expected = 1002.0 + ((-2.0_f64).exp() + (-1.0_f64).exp() + 1.0).ln();
        assert!((result - expected).abs() < 1e-10);
    }

    #[test]
    fn test_logsumexp_very_negative() {
        let values = array![-1000.0, -1001.0, -1002.0];
        let result = logsumexp(values.view());
        let expected = -1000.0 + (1.0 + (-1.0_f64).exp() + (-2.0_f64).exp()).ln();
        assert!((result - expected).abs() < 1e-10);
    }

    #[test]
    fn test_logsumexp_rows() {
        let matrix = array![[-1.0, -2.0], [-3.0, -4.0]];
        let result = logsumexp_rows(&matrix);
        assert!((result[0] - logsumexp(array![-1.0, -2.0].view())).abs() < 1e-12);
        assert!((result[1] - logsumexp(array![-3.0, -4.0].view())).abs() < 1e-12);
    }

    #[test]
    fn test_shifted_exp() {
        let (pjb, denom) = shifted_exp(array![-800.0, -801.0].view());
        assert_eq!(pjb[0], 1.0);
        assert!((pjb[1] - (-1.0_f64).exp()).abs() < 1e-12);
        assert!((denom - (1.0 + (-1.0_f64).exp())).abs() < 1e-12);
    }

    #[test]
    fn test_lstsq_full_rank() {
        let a = array![[2.0, 0.0], [0.0, 4.0]];
        let b = array![[2.0, 4.0], [8.0, 4.0]];
        let x = lstsq(&a, &b).unwrap();
        let expected = array![[1.0, 2.0], [2.0, 1.0]];
        for (v, e) in x.iter().zip(expected.iter()) {
            assert!((v - e).abs() < 1e-10);
        }
    }

    #[test]
    fn test_lstsq_singular() {
        // Second unknown is unconstrained, the minimum-norm solution sets it to zero
        let a = array![[1.0, 0.0], [0.0, 0.0]];
        let b = array![[3.0, -1.0], [0.0, 0.0]];
        let x = lstsq(&a, &b).unwrap();
        let expected = array![[3.0, -1.0], [0.0, 0.0]];
        for (v, e) in x.iter().zip(expected.iter()) {
            assert!((v - e).abs() < 1e-10);
        }
    }

    #[test]
    fn test_lstsq_zero_matrix() {
        let a = Array2::<f64>::zeros((3, 3));
        let b = Array2::<f64>::ones((3, 2));
        let x = lstsq(&a, &b).unwrap();
        assert!(x.iter().all(|v| *v == 0.0));
    }
}

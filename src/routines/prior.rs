/// Correction factors for the prior truncated at `gamma` active causes.
///
/// With `P(g) = C(H, g) pi^g (1 - pi)^(H - g)`:
///
/// * `a = sum_{g=0}^{gamma} P(g)`, the prior mass the truncated model can represent
/// * `b = sum_{g=0}^{gamma} g P(g)`, its cardinality-weighted analogue
/// * `e = pi H a / b`, the factor that corrects the `pi` update for the cap on active causes
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TruncatedPrior {
    pub a: f64,
    pub b: f64,
    pub e: f64,
}

impl TruncatedPrior {
    pub fn new(h: usize, gamma: usize, pi: f64) -> Self {
        let mut a = 0.0;
        let mut b = 0.0;
        for g in 0..=gamma.min(h) {
            let p = binomial(h, g) * pi.powi(g as i32) * (1.0 - pi).powi((h - g) as i32);
            a += p;
            b += g as f64 * p;
        }
        let e = pi * h as f64 * a / b;
        Self { a, b, e }
    }
}

/// Binomial coefficient as a float, exact for the sizes used here
pub fn binomial(n: usize, k: usize) -> f64 {
    if k > n {
        return 0.0;
    }
    let k = k.min(n - k);
    (0..k).fold(1.0, |acc, i| acc * (n - i) as f64 / (i + 1) as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binomial() {
        assert_eq!(binomial(5, 0), 1.0);
        assert_eq!(binomial(5, 2), 10.0);
        assert_eq!(binomial(10, 3), 120.0);
        assert_eq!(binomial(3, 4), 0.0);
    }

    #[test]
    fn test_untruncated_prior_needs_no_correction() {
        let prior = TruncatedPrior::new(6, 6, 0.2);
        assert!((prior.a - 1.0).abs() < 1e-12);
        // Mean of the binomial
        assert!((prior.b - 6.0 * 0.2).abs() < 1e-12);
        assert!((prior.e - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_gamma_one() {
        let (h, pi) = (3, 0.3);
        let prior = TruncatedPrior::new(h, 1, pi);
        let p0 = 0.7_f64.powi(3);
        let p1 = 3.0 * 0.3 * 0.7_f64.powi(2);
        assert!((prior.a - (p0 + p1)).abs() < 1e-12);
        assert!((prior.b - p1).abs() < 1e-12);
        assert!((prior.e - pi * 3.0 * (p0 + p1) / p1).abs() < 1e-12);
    }
}

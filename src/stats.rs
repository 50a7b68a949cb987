//! Banding parameter selection.
//!
//! A sketch of `K` slots is cut into `b` bands of `r` rows. Two sets with Jaccard similarity `s`
//! share at least one band with probability `1 - (1 - s^r)^b`. The solvers below pick the
//! `(b, r)` pair that minimizes the weighted area under that S-curve on the wrong side of the
//! threshold.
use crate::{Error, Result};
use log::debug;

/// Number of (even) Simpson intervals used for every integral.
const INTEGRATION_INTERVALS: usize = 1000;

/// Composite Simpson rule over `[a, b]`. Returns 0 for an empty range.
pub fn integrate<F: Fn(f64) -> f64>(f: F, a: f64, b: f64) -> f64 {
    if b <= a {
        return 0.;
    }
    let n = INTEGRATION_INTERVALS;
    let h = (b - a) / n as f64;
    let mut sum = f(a) + f(b);
    for i in 1..n {
        let w = if i % 2 == 1 { 4. } else { 2. };
        sum += w * f(a + h * i as f64);
    }
    sum * h / 3.
}

/// Probability that two sets with similarity `s` collide in at least one band.
pub fn collision_probability(s: f64, b: usize, r: usize) -> f64 {
    1. - (1. - s.powi(r as i32)).powi(b as i32)
}

/// Area of the S-curve below the threshold.
pub fn false_positive_probability(threshold: f64, b: usize, r: usize) -> f64 {
    integrate(|s| collision_probability(s, b, r), 0., threshold)
}

/// Area above the threshold that the S-curve misses.
pub fn false_negative_probability(threshold: f64, b: usize, r: usize) -> f64 {
    integrate(|s| 1. - collision_probability(s, b, r), threshold, 1.)
}

/// All `(b, r)` with `b * r == k`, ordered by increasing `b`.
pub fn divisor_pairs(k: usize) -> Vec<(usize, usize)> {
    (1..=k).filter(|b| k % b == 0).map(|b| (b, k / b)).collect()
}

fn validate_weights(false_positive_weight: f64, false_negative_weight: f64) -> Result<()> {
    for &w in &[false_positive_weight, false_negative_weight] {
        if !w.is_finite() || w < 0. {
            return Err(Error::param(format!("weight must be finite and >= 0, got {}", w)));
        }
    }
    if false_positive_weight + false_negative_weight <= 0. {
        return Err(Error::param("at least one weight must be positive"));
    }
    Ok(())
}

fn argmin_pairs<F: Fn(usize, usize) -> f64>(
    pairs: impl Iterator<Item = (usize, usize)>,
    error: F,
) -> Option<(usize, usize)> {
    let mut min_error = f64::INFINITY;
    let mut opt = None;
    // strict comparison: on a tie the pair with fewer bands wins
    for (b, r) in pairs {
        let e = error(b, r);
        if e < min_error {
            min_error = e;
            opt = Some((b, r));
        }
    }
    opt
}

/// Compute the `(b, r)` pair with `b * r == num_perm` that minimizes
/// `fp_weight * FP + fn_weight * FN` for a Jaccard `threshold`.
///
/// # Arguments
/// * `threshold` - Jaccard similarity threshold in `(0, 1)`.
/// * `num_perm` - Number of permutations `K` of the sketches.
/// * `false_positive_weight` - Relative cost of a false positive.
/// * `false_negative_weight` - Relative cost of a false negative.
pub fn optimal_param(
    threshold: f64,
    num_perm: usize,
    false_positive_weight: f64,
    false_negative_weight: f64,
) -> Result<(usize, usize)> {
    if !(threshold > 0. && threshold < 1.) {
        return Err(Error::param(format!(
            "threshold must be in (0, 1), got {}",
            threshold
        )));
    }
    if num_perm == 0 {
        return Err(Error::param("num_perm must be positive"));
    }
    validate_weights(false_positive_weight, false_negative_weight)?;

    let opt = argmin_pairs(divisor_pairs(num_perm).into_iter(), |b, r| {
        false_positive_weight * false_positive_probability(threshold, b, r)
            + false_negative_weight * false_negative_probability(threshold, b, r)
    })
    .ok_or_else(|| Error::param("no banding satisfies the constraints"))?;
    debug!(
        "optimal banding for threshold {} and {} permutations: b={}, r={}",
        threshold, num_perm, opt.0, opt.1
    );
    Ok(opt)
}

/// Collision probability for a containment `t` of the query in an indexed set, where `xq` is
/// the size ratio `|X| / |Q|`. The containment is converted to Jaccard first.
pub fn containment_collision_probability(t: f64, xq: f64, b: usize, r: usize) -> f64 {
    collision_probability(t / (1. + xq - t), b, r)
}

pub fn containment_false_positive_probability(threshold: f64, b: usize, r: usize, xq: f64) -> f64 {
    let upper = if xq >= threshold { threshold } else { xq };
    integrate(
        |t| containment_collision_probability(t, xq, b, r),
        0.,
        upper,
    )
}

pub fn containment_false_negative_probability(threshold: f64, b: usize, r: usize, xq: f64) -> f64 {
    let miss = |t| 1. - containment_collision_probability(t, xq, b, r);
    if xq >= 1. {
        integrate(miss, threshold, 1.)
    } else if xq >= threshold {
        integrate(miss, threshold, xq)
    } else {
        0.
    }
}

/// Containment counterpart of [optimal_param](fn.optimal_param.html). Only pairs with
/// `b * r == num_perm` and `r <= max_r` are considered.
pub fn optimal_containment_param(
    threshold: f64,
    num_perm: usize,
    max_r: usize,
    xq: f64,
    false_positive_weight: f64,
    false_negative_weight: f64,
) -> Result<(usize, usize)> {
    if !(0. ..=1.).contains(&threshold) {
        return Err(Error::param(format!(
            "threshold must be in [0, 1], got {}",
            threshold
        )));
    }
    if !(xq.is_finite() && xq > 0.) {
        return Err(Error::param(format!("size ratio must be positive, got {}", xq)));
    }
    validate_weights(false_positive_weight, false_negative_weight)?;

    let pairs = divisor_pairs(num_perm).into_iter().filter(|&(_, r)| r <= max_r);
    argmin_pairs(pairs, |b, r| {
        false_positive_weight * containment_false_positive_probability(threshold, b, r, xq)
            + false_negative_weight * containment_false_negative_probability(threshold, b, r, xq)
    })
    .ok_or_else(|| {
        Error::param(format!(
            "no banding of {} permutations with r <= {}",
            num_perm, max_r
        ))
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_integrate() {
        // Simpson is exact for cubics
        let v = integrate(|x| x.powi(3), 0., 2.);
        assert!((v - 4.).abs() < 1e-9);
        assert_eq!(integrate(|x| x, 1., 1.), 0.);
        assert_eq!(integrate(|x| x, 1., 0.), 0.);
    }

    #[test]
    fn test_divisor_pairs() {
        assert_eq!(
            divisor_pairs(64),
            vec![(1, 64), (2, 32), (4, 16), (8, 8), (16, 4), (32, 2), (64, 1)]
        );
        assert_eq!(divisor_pairs(7), vec![(1, 7), (7, 1)]);
    }

    #[test]
    fn test_error_integrals() {
        // reference values computed w/ the same Simpson rule in numpy
        let fp = false_positive_probability(0.7, 8, 8);
        let fn_ = false_negative_probability(0.7, 8, 8);
        assert!((fp - 0.032322906).abs() < 1e-6);
        assert!((fn_ - 0.052313613).abs() < 1e-6);
        assert!((false_negative_probability(0.7, 1, 64) - 0.284615385).abs() < 1e-6);
    }

    #[test]
    fn test_optimal_param_reference() {
        assert_eq!(optimal_param(0.7, 64, 0.5, 0.5).unwrap(), (8, 8));
        assert_eq!(optimal_param(0.5, 64, 0.5, 0.5).unwrap(), (16, 4));
        assert_eq!(optimal_param(0.3, 64, 0.5, 0.5).unwrap(), (32, 2));
        assert_eq!(optimal_param(0.8, 64, 0.5, 0.5).unwrap(), (4, 16));
        assert_eq!(optimal_param(0.7, 128, 0.5, 0.5).unwrap(), (16, 8));
        assert_eq!(optimal_param(0.9, 128, 0.5, 0.5).unwrap(), (4, 32));
    }

    #[test]
    fn test_weights_shift_optimum() {
        // punishing false positives means fewer, longer bands
        assert_eq!(optimal_param(0.7, 64, 0.9, 0.1).unwrap(), (4, 16));
        assert_eq!(optimal_param(0.7, 64, 0.1, 0.9).unwrap(), (16, 4));
        assert_eq!(optimal_param(0.7, 64, 1., 0.).unwrap(), (1, 64));
        assert_eq!(optimal_param(0.7, 64, 0., 1.).unwrap(), (64, 1));
        // weights are relative costs
        assert_eq!(
            optimal_param(0.7, 64, 5., 5.).unwrap(),
            optimal_param(0.7, 64, 0.5, 0.5).unwrap()
        );
    }

    #[test]
    fn test_optimal_param_deterministic() {
        for &t in &[0.1, 0.25, 0.5, 0.75, 0.95] {
            let first = optimal_param(t, 64, 0.5, 0.5).unwrap();
            for _ in 0..3 {
                assert_eq!(first, optimal_param(t, 64, 0.5, 0.5).unwrap());
            }
            assert_eq!(first.0 * first.1, 64);
        }
    }

    #[test]
    fn test_prime_num_perm() {
        let (b, r) = optimal_param(0.5, 13, 0.5, 0.5).unwrap();
        assert_eq!(b * r, 13);
    }

    #[test]
    fn test_invalid_parameters() {
        assert!(optimal_param(0., 64, 0.5, 0.5).is_err());
        assert!(optimal_param(1., 64, 0.5, 0.5).is_err());
        assert!(optimal_param(f64::NAN, 64, 0.5, 0.5).is_err());
        assert!(optimal_param(0.5, 0, 0.5, 0.5).is_err());
        assert!(optimal_param(0.5, 64, -0.1, 0.5).is_err());
        assert!(optimal_param(0.5, 64, 0., 0.).is_err());
        assert!(optimal_param(0.5, 64, f64::INFINITY, 0.5)
            .unwrap_err()
            .is_parameter_error());
    }

    #[test]
    fn test_optimal_containment_param() {
        // r is capped at max_r
        assert_eq!(
            optimal_containment_param(0.9, 64, 8, 1., 0.5, 0.5).unwrap(),
            (8, 8)
        );
        // indexed sets much larger than the query need more, shorter bands
        assert_eq!(
            optimal_containment_param(0.7, 64, 8, 5f64.exp(), 0.5, 0.5).unwrap(),
            (32, 2)
        );
        assert_eq!(
            optimal_containment_param(0.7, 64, 8, (-5f64).exp(), 0.5, 0.5).unwrap(),
            (8, 8)
        );
        assert!(optimal_containment_param(0.7, 64, 8, 0., 0.5, 0.5).is_err());
        assert!(optimal_containment_param(1.5, 64, 8, 1., 0.5, 0.5).is_err());
    }

    #[test]
    fn test_containment_fn_zero_below_threshold() {
        // X is too small to ever contain t of Q
        assert_eq!(containment_false_negative_probability(0.9, 8, 8, 0.5), 0.);
    }
}

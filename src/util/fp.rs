//! Epsilon-disciplined `f64` comparisons.
//!
//! Every threshold / zero comparison in the detector and the position
//! controller goes through these helpers. Prices and sizes are IEEE-754
//! doubles end to end; direct `==` / `<` against thresholds is banned.

/// Shared tolerance for all price/size comparisons.
pub const EPSILON: f64 = 1e-9;

#[inline]
pub fn is_zero(v: f64) -> bool {
    v.abs() < EPSILON
}

#[inline]
pub fn is_positive(v: f64) -> bool {
    v > EPSILON
}

#[inline]
pub fn is_negative_or_zero(v: f64) -> bool {
    v < EPSILON
}

#[inline]
pub fn approx_eq(a: f64, b: f64) -> bool {
    (a - b).abs() < EPSILON
}

#[inline]
pub fn gt(a: f64, b: f64) -> bool {
    a - b > EPSILON
}

#[inline]
pub fn lt(a: f64, b: f64) -> bool {
    b - a > EPSILON
}

#[inline]
pub fn gte(a: f64, b: f64) -> bool {
    a - b > -EPSILON
}

#[inline]
pub fn lte(a: f64, b: f64) -> bool {
    b - a > -EPSILON
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_band() {
        assert!(is_zero(0.0));
        assert!(is_zero(1e-12));
        assert!(is_zero(-1e-12));
        assert!(!is_zero(1e-8));
    }

    #[test]
    fn strict_ordering_uses_epsilon() {
        assert!(!gt(1.0 + 1e-12, 1.0));
        assert!(gt(1.0 + 1e-8, 1.0));
        assert!(!lt(1.0, 1.0 + 1e-12));
        assert!(lt(1.0, 1.0 + 1e-8));
    }

    #[test]
    fn inclusive_ordering_admits_equal() {
        assert!(gte(1.0, 1.0));
        assert!(lte(1.0, 1.0));
        assert!(gte(1.0 + 1e-12, 1.0));
        assert!(!gte(1.0 - 1e-8, 1.0));
    }

    #[test]
    fn approx_eq_is_symmetric() {
        assert!(approx_eq(0.1 + 0.2, 0.3));
        assert!(!approx_eq(0.3, 0.300001));
    }
}

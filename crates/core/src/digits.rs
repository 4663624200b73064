//! Last-digit derivation for digit contracts.
//!
//! A digit contract settles against the final digit of a quote displayed at
//! the instrument's pip precision. "No usable digit" (non-finite input,
//! degenerate pip size) is digit 0 by broker convention, not an error.

/// Derive the digit 0-9 that a digit contract settles against for `quote`
/// at the precision implied by `pip_size`.
///
/// Decimal places are `round(-log10(pip_size))`; the quote is scaled to that
/// precision, rounded, and the last digit taken. Pure arithmetic, no
/// per-call allocation.
pub fn last_digit(quote: f64, pip_size: f64) -> u8 {
    if !quote.is_finite() || !pip_size.is_finite() || pip_size <= 0.0 {
        return 0;
    }
    let places = (-pip_size.log10()).round();
    if !places.is_finite() || !(0.0..=12.0).contains(&places) {
        return 0;
    }
    let scaled = (quote * 10f64.powi(places as i32)).round();
    if !scaled.is_finite() || scaled.abs() >= i64::MAX as f64 {
        return 0;
    }
    (scaled.abs() as i64 % 10) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digit_at_pip_precision() {
        assert_eq!(last_digit(12.345, 0.001), 5);
        assert_eq!(last_digit(1.2345, 0.0001), 5);
        assert_eq!(last_digit(9876.1, 0.1), 1);
    }

    #[test]
    fn test_trailing_zero_counts_as_zero() {
        assert_eq!(last_digit(100.50, 0.01), 0);
        assert_eq!(last_digit(100.0, 0.01), 0);
    }

    #[test]
    fn test_integer_pip_size() {
        assert_eq!(last_digit(1234.0, 1.0), 4);
    }

    #[test]
    fn test_degenerate_inputs_are_digit_zero() {
        assert_eq!(last_digit(f64::NAN, 0.01), 0);
        assert_eq!(last_digit(f64::INFINITY, 0.01), 0);
        assert_eq!(last_digit(1.23, f64::NAN), 0);
        assert_eq!(last_digit(1.23, 0.0), 0);
        assert_eq!(last_digit(1.23, -0.01), 0);
    }

    #[test]
    fn test_representation_noise_is_rounded_away() {
        // 4.56 is not exact in binary; scaling must still yield 6.
        assert_eq!(last_digit(4.56, 0.01), 6);
        assert_eq!(last_digit(0.29, 0.01), 9);
    }
}

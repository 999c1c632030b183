//! Fixed-point encoding for device-side integer arithmetic.
//!
//! Measurements carry two decimal digits. They are scaled by [`SCALE`] and
//! rounded, so reduction kernels only ever see integers and results do not
//! depend on work-group grouping.

/// Multiplier between real values and their encoded form.
pub const SCALE: i64 = 100;

/// Encode a real value as a scaled integer, rounding to the nearest step.
///
/// Values outside the `i32` range saturate; NaN encodes to 0.
pub fn encode(value: f64) -> i32 {
    (value * SCALE as f64).round() as i32
}

/// Decode an aggregate at scale [`SCALE`] back to a real value.
pub fn decode(encoded: i64) -> f64 {
    encoded as f64 / SCALE as f64
}

/// Encode a real value, or `None` if it is not finite or its scaled form
/// falls outside `i32`.
pub fn checked_encode(value: f64) -> Option<i32> {
    let scaled = (value * SCALE as f64).round();
    if scaled.is_finite() && scaled >= i32::MIN as f64 && scaled <= i32::MAX as f64 {
        Some(scaled as i32)
    } else {
        None
    }
}

/// Encoded mean of `count` encoded values summing to `sum`.
///
/// Integer division, truncating toward zero. `count` must be non-zero.
pub fn encode_mean(sum: i64, count: usize) -> i64 {
    sum / count as i64
}

/// Exact population variance, decoded.
///
/// `sum_squares` is `Σ(x - shift)^2` at scale `SCALE^2` around any integer
/// `shift` (the truncated mean in practice), and `sum` is `Σx`. With
/// `m = sum / count`:
///
/// ```text
/// count * Σ(x - m)^2 = count * Σ(x - shift)^2 - (sum - count * shift)^2
/// ```
///
/// The right-hand side is evaluated in `i128`, so the only rounding is the
/// final division. `count` must be non-zero.
pub fn population_variance(sum: i64, shift: i64, sum_squares: i128, count: usize) -> f64 {
    let n = count as i128;
    let offset = sum as i128 - n * shift as i128;
    let scaled = n * sum_squares - offset * offset;
    scaled as f64 / (count as f64 * count as f64 * (SCALE * SCALE) as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_rounds_to_hundredths() {
        assert_eq!(encode(12.344), 1234);
        assert_eq!(encode(-2.456), -246);
        assert_eq!(encode(0.29), 29);
        assert_eq!(encode(0.0), 0);
    }

    #[test]
    fn test_encode_saturates_and_handles_nan() {
        assert_eq!(encode(1e12), i32::MAX);
        assert_eq!(encode(-1e12), i32::MIN);
        assert_eq!(encode(f64::NAN), 0);
    }

    #[test]
    fn test_decode_within_tolerance() {
        for x in [0.0, 1.0, -1.0, 0.29, 8.9, 35.25, -17.61, 1234.56, 0.004] {
            let back = decode(encode(x) as i64);
            assert!((back - x).abs() < 0.01, "{} decoded as {}", x, back);
        }
    }

    #[test]
    fn test_checked_encode_rejects_out_of_range() {
        assert_eq!(checked_encode(-2.456), Some(-246));
        assert_eq!(checked_encode(21_474_836.47), Some(i32::MAX));
        assert_eq!(checked_encode(21_474_836.48), None);
        assert_eq!(checked_encode(-21_474_836.48), Some(i32::MIN));
        assert_eq!(checked_encode(1e12), None);
        assert_eq!(checked_encode(f64::INFINITY), None);
        assert_eq!(checked_encode(f64::NAN), None);
    }

    #[test]
    fn test_population_variance_corrects_truncated_shift() {
        // 0.01, 0.02: mean 0.015 truncates to 1; squares about it are 0 and 1
        assert_eq!(population_variance(3, 1, 1, 2), 0.000025);
        // 1.00, 1.01, 1.01: mean truncates to 100; squares 0, 1, 1
        let variance = population_variance(302, 100, 2, 3);
        assert!((variance - 2.0 / 90_000.0).abs() < 1e-18);
    }

    #[test]
    fn test_population_variance_exact_shift() {
        // 10, 2, 3, 4, 5, 6, 7, 8, 9, 35 around their mean 8.90
        assert_eq!(population_variance(8900, 890, 8_169_000, 10), 81.69);
    }

    #[test]
    fn test_encode_mean() {
        assert_eq!(encode_mean(8900, 10), 890);
        assert_eq!(encode_mean(-7, 2), -3);
    }
}

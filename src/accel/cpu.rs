use super::{
    check_mean, AccelError, DeviceInfo, Lane, PlatformInfo, ReduceOp, SquareLimbs, Strategy,
};
use crate::fixed;

pub fn platform() -> PlatformInfo {
    PlatformInfo {
        index: 0,
        name: "Scalar reference".to_string(),
        vendor: "parastat".to_string(),
        devices: vec![DeviceInfo {
            index: 0,
            name: "Sequential CPU".to_string(),
            vendor: "parastat".to_string(),
            max_work_group_size: super::workgroup::MAX_WORK_GROUP_SIZE,
            compute_units: 1,
        }],
    }
}

/// Scalar reference reduction. Folds left to right from the identity.
pub fn reduce<T: Lane>(op: ReduceOp, strategy: Strategy, data: &[T]) -> Result<T, AccelError> {
    if strategy == Strategy::Atomic && op == ReduceOp::Sum {
        return Err(AccelError::UnsupportedStrategy { op, strategy });
    }
    if data.is_empty() {
        return Err(AccelError::EmptyInput { op: op.name().to_string() });
    }
    Ok(data.iter().fold(op.identity(), |acc, &x| op.combine(acc, x)))
}

/// Scalar reference for the squared-deviation kernel.
pub fn squared_deviation(
    data: &[i32],
    logical_len: usize,
    mean: i64,
) -> Result<SquareLimbs, AccelError> {
    if data.is_empty() {
        return Err(AccelError::EmptyInput { op: "squared_deviation".to_string() });
    }
    check_mean(mean)?;

    let mut limbs = SquareLimbs::with_len(data.len());
    for (gid, &x) in data.iter().enumerate() {
        let (lo, hi) = super::workgroup::squared_deviation_item(gid, x, logical_len, mean);
        limbs.lo[gid] = lo;
        limbs.hi[gid] = hi;
    }
    Ok(limbs)
}

/// Decoded statistics computed directly on the host in `f64`.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ReferenceStats {
    pub min: f64,
    pub max: f64,
    pub sum: f64,
    pub mean: f64,
    pub variance: f64, // Population variance
    pub stdev: f64,
}

/// Two-pass reference statistics over an encoded dataset.
pub fn stats(data: &[i32]) -> Result<ReferenceStats, AccelError> {
    if data.is_empty() {
        return Err(AccelError::EmptyInput { op: "stats".to_string() });
    }

    let mut min = i32::MAX;
    let mut max = i32::MIN;
    let mut sum: i64 = 0;
    for &val in data {
        min = min.min(val);
        max = max.max(val);
        sum += val as i64;
    }

    let n = data.len() as f64;
    let mean = fixed::decode(sum) / n;
    let variance = data
        .iter()
        .map(|&val| {
            let diff = fixed::decode(val as i64) - mean;
            diff * diff
        })
        .sum::<f64>()
        / n;

    Ok(ReferenceStats {
        min: fixed::decode(min as i64),
        max: fixed::decode(max as i64),
        sum: fixed::decode(sum),
        mean,
        variance,
        stdev: variance.sqrt(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_stats() {
        let data: Vec<i32> = [10.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 35.0]
            .iter()
            .map(|&x| fixed::encode(x))
            .collect();
        let s = stats(&data).unwrap();
        assert_eq!(s.min, 2.0);
        assert_eq!(s.max, 35.0);
        assert_eq!(s.sum, 89.0);
        assert!((s.mean - 8.9).abs() < 1e-9);
        assert!((s.variance - 81.69).abs() < 1e-9);
    }

    #[test]
    fn test_reduce_empty_is_error() {
        assert!(reduce::<i32>(ReduceOp::Min, Strategy::Tree, &[]).is_err());
        assert!(stats(&[]).is_err());
    }

    #[test]
    fn test_single_element() {
        let s = stats(&[fixed::encode(4.2)]).unwrap();
        assert_eq!(s.min, s.max);
        assert!((s.mean - 4.2).abs() < 1e-9);
        assert_eq!(s.variance, 0.0);
        assert_eq!(s.stdev, 0.0);
    }

    #[test]
    fn test_squared_deviation_rejects_mean_out_of_range() {
        let err = squared_deviation(&[1, 2], 2, i64::from(i32::MAX) + 1).unwrap_err();
        assert!(matches!(err, AccelError::MeanOutOfRange { .. }));
    }
}

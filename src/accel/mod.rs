//! Reduction backends -- OpenCL device / work-group emulator / scalar reference.
//!
//! Every reduction kernel has three implementations behind the
//! [`AcceleratedOp`] trait. The OpenCL path runs `kernels/reduce.cl` on a real
//! device (cargo feature `opencl`); the emulated path executes the same
//! NDRange model on the host, work-groups in parallel; the scalar path is the
//! sequential reference used for verification.

pub mod cpu;
pub mod manager;
#[cfg(feature = "opencl")]
pub mod opencl;
pub mod ops;
pub mod pad;
pub mod workgroup;

pub use manager::{AcceleratedOp, AccelerationManager, Backend, BackendPreference, ManagerOptions};

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AccelError {
    #[error("no device at platform {platform}, device {device}: {reason}")]
    DeviceSelection {
        platform: usize,
        device: usize,
        reason: String,
    },

    #[error("{backend} backend unavailable: {reason}")]
    BackendUnavailable { backend: Backend, reason: String },

    #[error("kernel build failed (status {status}, options '{options}'):\n{log}")]
    BuildFailed {
        status: i32,
        options: String,
        log: String,
    },

    #[error("invalid work-group size {local_size} for {len} elements: {reason}")]
    InvalidWorkGroup {
        local_size: usize,
        len: usize,
        reason: String,
    },

    #[error("{op} dispatched on an empty buffer")]
    EmptyInput { op: String },

    #[error("{strategy:?} strategy does not support {op}")]
    UnsupportedStrategy { op: ReduceOp, strategy: Strategy },

    #[error("{op} failed on device (code {code}): {message}")]
    Dispatch {
        op: String,
        code: i32,
        message: String,
    },

    #[error("mean {mean} is outside the encoded value range")]
    MeanOutOfRange { mean: i64 },

    #[error("{op} on {backend} disagrees with the scalar reference")]
    VerificationFailed { op: String, backend: Backend },
}

/// Which acceleration path executed a dispatch, and how long it took.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct AccelMetadata {
    pub path_used: Backend,
    pub duration_us: u64,
}

/// Reduction operator applied within a work-group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReduceOp {
    Min,
    Max,
    Sum,
}

impl ReduceOp {
    /// Identity element: padding with it never changes the reduction.
    pub fn identity<T: Lane>(self) -> T {
        match self {
            ReduceOp::Min => T::HIGHEST,
            ReduceOp::Max => T::LOWEST,
            ReduceOp::Sum => T::ZERO,
        }
    }

    pub fn combine<T: Lane>(self, a: T, b: T) -> T {
        match self {
            ReduceOp::Min => a.min(b),
            ReduceOp::Max => a.max(b),
            ReduceOp::Sum => a.wrapping_add(b),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ReduceOp::Min => "min",
            ReduceOp::Max => "max",
            ReduceOp::Sum => "sum",
        }
    }
}

impl fmt::Display for ReduceOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How a work-group combines its elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Local-memory binary tree with a barrier between halving steps.
    Tree,
    /// Every work-item races to update one shared location (min/max only).
    Atomic,
}

/// Integer element type a reduction kernel operates on.
///
/// Device arithmetic wraps on overflow, so `wrapping_add` is used for sums on
/// every backend to keep results bitwise identical.
pub trait Lane: Copy + Ord + Send + Sync + fmt::Debug + 'static {
    const LOWEST: Self;
    const HIGHEST: Self;
    const ZERO: Self;
    /// OpenCL C scalar type name, used to pick kernel entry points.
    const CL_TYPE: &'static str;

    type Atomic: Send + Sync;

    fn wrapping_add(self, other: Self) -> Self;
    fn new_atomic(value: Self) -> Self::Atomic;
    fn atomic_min(cell: &Self::Atomic, value: Self);
    fn atomic_max(cell: &Self::Atomic, value: Self);
    fn atomic_load(cell: &Self::Atomic) -> Self;
}

macro_rules! impl_lane {
    ($ty:ty, $atomic:ty, $cl:literal) => {
        impl Lane for $ty {
            const LOWEST: Self = <$ty>::MIN;
            const HIGHEST: Self = <$ty>::MAX;
            const ZERO: Self = 0;
            const CL_TYPE: &'static str = $cl;

            type Atomic = $atomic;

            fn wrapping_add(self, other: Self) -> Self {
                <$ty>::wrapping_add(self, other)
            }

            fn new_atomic(value: Self) -> Self::Atomic {
                <$atomic>::new(value)
            }

            fn atomic_min(cell: &Self::Atomic, value: Self) {
                cell.fetch_min(value, Ordering::AcqRel);
            }

            fn atomic_max(cell: &Self::Atomic, value: Self) {
                cell.fetch_max(value, Ordering::AcqRel);
            }

            fn atomic_load(cell: &Self::Atomic) -> Self {
                cell.load(Ordering::Acquire)
            }
        }
    };
}

impl_lane!(i32, AtomicI32, "int");
impl_lane!(i64, AtomicI64, "long");

/// Per-element squared deviations, split into 32-bit limbs.
///
/// A square of two encoded `i32` values needs up to 64 unsigned bits, so no
/// `i64` lane can hold it, let alone a sum of them. Each limb is below `2^32`
/// and is summed in its own `i64` reduction; [`SquareLimbs::join`] recombines
/// the two limb sums on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SquareLimbs {
    pub lo: Vec<i64>,
    pub hi: Vec<i64>,
}

impl SquareLimbs {
    pub fn with_len(len: usize) -> Self {
        Self {
            lo: vec![0; len],
            hi: vec![0; len],
        }
    }

    pub fn len(&self) -> usize {
        self.lo.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lo.is_empty()
    }

    /// Split one square into `(lo, hi)` limbs.
    pub fn split(square: u64) -> (i64, i64) {
        ((square & 0xFFFF_FFFF) as i64, (square >> 32) as i64)
    }

    /// Recombine the limb sums into the full sum of squares.
    pub fn join(lo_sum: i64, hi_sum: i64) -> i128 {
        ((hi_sum as i128) << 32) + lo_sum as i128
    }
}

/// A compute platform and the devices it exposes.
#[derive(Debug, Clone, Serialize)]
pub struct PlatformInfo {
    pub index: usize,
    pub name: String,
    pub vendor: String,
    pub devices: Vec<DeviceInfo>,
}

/// A single compute device.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    pub index: usize,
    pub name: String,
    pub vendor: String,
    pub max_work_group_size: usize,
    pub compute_units: u32,
}

/// List the platforms and devices reachable through `backend`.
pub fn enumerate(backend: Backend) -> Vec<PlatformInfo> {
    match backend {
        Backend::OpenCl => {
            #[cfg(feature = "opencl")]
            {
                opencl::platforms()
            }
            #[cfg(not(feature = "opencl"))]
            {
                Vec::new()
            }
        }
        Backend::Emulated => vec![workgroup::WorkGroupEmulator::platform()],
        Backend::Scalar => vec![cpu::platform()],
    }
}

/// Resolve `(platform, device)` indices against an enumeration.
pub fn select(
    platforms: &[PlatformInfo],
    platform: usize,
    device: usize,
) -> Result<DeviceInfo, AccelError> {
    let found = platforms.get(platform).ok_or_else(|| AccelError::DeviceSelection {
        platform,
        device,
        reason: format!("{} platform(s) available", platforms.len()),
    })?;

    found
        .devices
        .get(device)
        .cloned()
        .ok_or_else(|| AccelError::DeviceSelection {
            platform,
            device,
            reason: format!("platform '{}' has {} device(s)", found.name, found.devices.len()),
        })
}

/// Check the launch preconditions shared by every kernel dispatch.
pub(crate) fn check_launch(
    op: &str,
    len: usize,
    local_size: usize,
    max_work_group_size: usize,
) -> Result<(), AccelError> {
    if len == 0 {
        return Err(AccelError::EmptyInput { op: op.to_string() });
    }
    let reason = if local_size < 2 {
        Some("work-group size must be at least 2".to_string())
    } else if local_size > max_work_group_size {
        Some(format!("device maximum is {}", max_work_group_size))
    } else if len % local_size != 0 {
        Some("global size must be a multiple of the work-group size".to_string())
    } else {
        None
    };

    match reason {
        Some(reason) => Err(AccelError::InvalidWorkGroup { local_size, len, reason }),
        None => Ok(()),
    }
}

/// The squared-deviation kernel takes a mean of encoded `i32` values.
pub(crate) fn check_mean(mean: i64) -> Result<(), AccelError> {
    if i32::try_from(mean).is_err() {
        return Err(AccelError::MeanOutOfRange { mean });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_does_not_change_result() {
        for op in [ReduceOp::Min, ReduceOp::Max, ReduceOp::Sum] {
            for x in [-7i32, 0, 42] {
                assert_eq!(op.combine(x, op.identity()), x, "{} identity", op);
            }
        }
    }

    #[test]
    fn test_select_out_of_range() {
        let platforms = enumerate(Backend::Emulated);
        assert!(select(&platforms, 0, 0).is_ok());
        assert!(matches!(
            select(&platforms, 3, 0),
            Err(AccelError::DeviceSelection { platform: 3, .. })
        ));
        assert!(matches!(
            select(&platforms, 0, 9),
            Err(AccelError::DeviceSelection { device: 9, .. })
        ));
    }

    #[test]
    fn test_check_launch_preconditions() {
        assert!(check_launch("min", 20, 10, 1024).is_ok());
        assert!(matches!(
            check_launch("min", 0, 10, 1024),
            Err(AccelError::EmptyInput { .. })
        ));
        for (len, local_size) in [(15, 10), (10, 1), (2048, 2048)] {
            assert!(matches!(
                check_launch("min", len, local_size, 1024),
                Err(AccelError::InvalidWorkGroup { .. })
            ));
        }
    }

    #[test]
    fn test_square_limbs_round_trip_largest_square() {
        let d = u32::MAX as u64;
        let square = d * d;
        let (lo, hi) = SquareLimbs::split(square);
        assert!(lo < 1 << 32 && hi < 1 << 32);
        assert_eq!(SquareLimbs::join(lo, hi), square as i128);
    }
}

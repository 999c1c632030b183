//! Host emulation of the NDRange work-group execution model.
//!
//! A dispatch splits the global range into work-groups of `local_size`
//! work-items. Work-groups run in parallel on the rayon pool; the work-items
//! of one group advance in lockstep, one halving step at a time, so the end of
//! each step plays the role of a local-memory barrier. There is no
//! synchronization between work-groups inside a dispatch.

use rayon::prelude::*;
use tracing::trace;

use super::{
    check_launch, check_mean, pad, AccelError, DeviceInfo, Lane, PlatformInfo, ReduceOp,
    SquareLimbs, Strategy,
};

/// Largest work-group the emulator accepts, matching common GPU limits.
pub const MAX_WORK_GROUP_SIZE: usize = 1024;

#[derive(Debug, Clone, Default)]
pub struct WorkGroupEmulator;

impl WorkGroupEmulator {
    pub fn new() -> Self {
        Self
    }

    pub fn platform() -> PlatformInfo {
        PlatformInfo {
            index: 0,
            name: "Host work-group emulation".to_string(),
            vendor: "parastat".to_string(),
            devices: vec![Self::device()],
        }
    }

    pub fn device() -> DeviceInfo {
        DeviceInfo {
            index: 0,
            name: format!("Emulated device ({} threads)", rayon::current_num_threads()),
            vendor: "parastat".to_string(),
            max_work_group_size: MAX_WORK_GROUP_SIZE,
            compute_units: rayon::current_num_threads() as u32,
        }
    }

    /// Reduce `data` to a single value.
    ///
    /// `data` must already be padded to a multiple of `local_size`. Tree
    /// reductions repeat over the per-group partials until one remains.
    pub fn reduce<T: Lane>(
        &self,
        op: ReduceOp,
        strategy: Strategy,
        data: &[T],
        local_size: usize,
    ) -> Result<T, AccelError> {
        check_launch(op.name(), data.len(), local_size, MAX_WORK_GROUP_SIZE)?;

        match strategy {
            Strategy::Tree => {
                let mut partials = tree_pass(op, data, local_size);
                let mut level = 1;
                while partials.len() > 1 {
                    trace!(%op, level, groups = partials.len(), "reducing partials");
                    let padded = pad::pad_for(op, &partials, local_size);
                    partials = tree_pass(op, &padded, local_size);
                    level += 1;
                }
                Ok(partials[0])
            }
            Strategy::Atomic => atomic_pass(op, data, local_size),
        }
    }

    /// Per-element `(x - mean)^2` at scale `SCALE^2`, as 32-bit limbs; slots
    /// at or beyond `logical_len` are padding and contribute 0.
    pub fn squared_deviation(
        &self,
        data: &[i32],
        logical_len: usize,
        mean: i64,
        local_size: usize,
    ) -> Result<SquareLimbs, AccelError> {
        check_launch("squared_deviation", data.len(), local_size, MAX_WORK_GROUP_SIZE)?;
        check_mean(mean)?;

        let (lo, hi): (Vec<i64>, Vec<i64>) = data
            .par_iter()
            .enumerate()
            .map(|(gid, &x)| squared_deviation_item(gid, x, logical_len, mean))
            .unzip();
        Ok(SquareLimbs { lo, hi })
    }
}

/// One dispatch: every work-group writes its partial into its own slot.
fn tree_pass<T: Lane>(op: ReduceOp, data: &[T], local_size: usize) -> Vec<T> {
    data.par_chunks_exact(local_size)
        .map(|group| reduce_group(op, group))
        .collect()
}

/// Tree reduction of one work-group in local memory.
///
/// Each step keeps `half = ceil(active / 2)` live slots; work-items below
/// `active - half` fold in their partner at `lid + half`. This covers
/// non-power-of-two group sizes: the odd element out is carried to the next
/// step untouched.
pub(crate) fn reduce_group<T: Lane>(op: ReduceOp, group: &[T]) -> T {
    let mut scratch = group.to_vec();
    let mut active = scratch.len();

    while active > 1 {
        let half = (active + 1) / 2;
        for lid in 0..active - half {
            scratch[lid] = op.combine(scratch[lid], scratch[lid + half]);
        }
        // barrier(CLK_LOCAL_MEM_FENCE)
        active = half;
    }

    scratch[0]
}

/// Every work-item applies an atomic min/max to one shared location.
fn atomic_pass<T: Lane>(op: ReduceOp, data: &[T], local_size: usize) -> Result<T, AccelError> {
    let update: fn(&T::Atomic, T) = match op {
        ReduceOp::Min => T::atomic_min,
        ReduceOp::Max => T::atomic_max,
        ReduceOp::Sum => {
            return Err(AccelError::UnsupportedStrategy {
                op,
                strategy: Strategy::Atomic,
            })
        }
    };

    let shared = T::new_atomic(op.identity());
    data.par_chunks_exact(local_size).for_each(|group| {
        for &x in group {
            update(&shared, x);
        }
    });

    Ok(T::atomic_load(&shared))
}

/// `mean` lies within the `i32` range (see [`check_mean`]), so
/// `|x - mean| < 2^32` and the square fits a `u64`.
pub(crate) fn squared_deviation_item(
    gid: usize,
    x: i32,
    logical_len: usize,
    mean: i64,
) -> (i64, i64) {
    if gid < logical_len {
        let d = (x as i64 - mean).unsigned_abs();
        SquareLimbs::split(d * d)
    } else {
        (0, 0)
    }
}

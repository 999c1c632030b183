use std::sync::Arc;

use crate::accel::manager::Dispatched;
use crate::accel::{
    cpu, AccelError, AcceleratedOp, AccelerationManager, Lane, ReduceOp, SquareLimbs, Strategy,
};

/// Input to a reduction: a buffer already padded to whole work-groups.
#[derive(Debug, Clone)]
pub struct ReduceInput<T> {
    pub data: Arc<[T]>,
    pub local_size: usize,
}

/// Reduce a buffer to one value with `op`, using `strategy` within each
/// work-group. Tree and atomic strategies share this single entry point.
#[derive(Debug, Clone, Copy)]
pub struct Reduction {
    pub op: ReduceOp,
    pub strategy: Strategy,
}

impl Reduction {
    pub fn tree(op: ReduceOp) -> Self {
        Self {
            op,
            strategy: Strategy::Tree,
        }
    }

    pub fn atomic(op: ReduceOp) -> Self {
        Self {
            op,
            strategy: Strategy::Atomic,
        }
    }
}

impl<T: Lane> AcceleratedOp<ReduceInput<T>, T> for Reduction {
    fn label(&self) -> String {
        match self.strategy {
            Strategy::Tree => self.op.name().to_string(),
            Strategy::Atomic => format!("atomic_{}", self.op),
        }
    }

    #[cfg(feature = "opencl")]
    fn run_opencl(
        &self,
        input: &ReduceInput<T>,
        manager: &AccelerationManager,
    ) -> Result<Dispatched<T>, AccelError> {
        let engine = opencl_engine(manager)?;
        engine.reduce(self.op, self.strategy, &input.data, input.local_size)
    }

    #[cfg(not(feature = "opencl"))]
    fn run_opencl(
        &self,
        _input: &ReduceInput<T>,
        _manager: &AccelerationManager,
    ) -> Result<Dispatched<T>, AccelError> {
        Err(opencl_missing())
    }

    fn run_emulated(
        &self,
        input: &ReduceInput<T>,
        manager: &AccelerationManager,
    ) -> Result<T, AccelError> {
        manager
            .emulator()
            .reduce(self.op, self.strategy, &input.data, input.local_size)
    }

    fn run_scalar(&self, input: &ReduceInput<T>) -> Result<T, AccelError> {
        cpu::reduce(self.op, self.strategy, &input.data)
    }
}

/// Input to the per-element variance kernel.
#[derive(Debug, Clone)]
pub struct DeviationInput {
    /// Dataset padded to whole work-groups.
    pub data: Arc<[i32]>,
    /// Number of real elements; the rest is padding.
    pub logical_len: usize,
    pub local_size: usize,
}

/// Per-element `(x - mean)^2` as [`SquareLimbs`], with the encoded mean as a
/// kernel argument.
#[derive(Debug, Clone, Copy)]
pub struct SquaredDeviation {
    pub mean: i64,
}

impl AcceleratedOp<DeviationInput, SquareLimbs> for SquaredDeviation {
    fn label(&self) -> String {
        "squared_deviation".to_string()
    }

    #[cfg(feature = "opencl")]
    fn run_opencl(
        &self,
        input: &DeviationInput,
        manager: &AccelerationManager,
    ) -> Result<Dispatched<SquareLimbs>, AccelError> {
        let engine = opencl_engine(manager)?;
        engine.squared_deviation(&input.data, input.logical_len, self.mean, input.local_size)
    }

    #[cfg(not(feature = "opencl"))]
    fn run_opencl(
        &self,
        _input: &DeviationInput,
        _manager: &AccelerationManager,
    ) -> Result<Dispatched<SquareLimbs>, AccelError> {
        Err(opencl_missing())
    }

    fn run_emulated(
        &self,
        input: &DeviationInput,
        manager: &AccelerationManager,
    ) -> Result<SquareLimbs, AccelError> {
        manager
            .emulator()
            .squared_deviation(&input.data, input.logical_len, self.mean, input.local_size)
    }

    fn run_scalar(&self, input: &DeviationInput) -> Result<SquareLimbs, AccelError> {
        cpu::squared_deviation(&input.data, input.logical_len, self.mean)
    }
}

#[cfg(feature = "opencl")]
fn opencl_engine(
    manager: &AccelerationManager,
) -> Result<&crate::accel::opencl::OpenClEngine, AccelError> {
    manager
        .get_opencl()
        .ok_or_else(|| AccelError::BackendUnavailable {
            backend: crate::accel::Backend::OpenCl,
            reason: "no OpenCL engine selected".to_string(),
        })
}

#[cfg(not(feature = "opencl"))]
fn opencl_missing() -> AccelError {
    AccelError::BackendUnavailable {
        backend: crate::accel::Backend::OpenCl,
        reason: "built without the `opencl` feature".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accel::pad;

    #[test]
    fn test_reduction_through_manager() {
        let manager = AccelerationManager::emulated();
        let data: Vec<i32> = vec![5, -3, 8, 1, 9];
        let input = ReduceInput {
            data: pad::pad_for(ReduceOp::Min, &data, 4).into(),
            local_size: 4,
        };
        let (min, meta) = manager.execute(&Reduction::tree(ReduceOp::Min), &input).unwrap();
        assert_eq!(min, -3);
        assert_eq!(meta.path_used, crate::accel::Backend::Emulated);

        let (atomic_min, _) = manager.execute(&Reduction::atomic(ReduceOp::Min), &input).unwrap();
        assert_eq!(atomic_min, min);
    }

    #[test]
    fn test_labels() {
        let tree: &dyn AcceleratedOp<ReduceInput<i32>, i32> = &Reduction::tree(ReduceOp::Max);
        let atomic: &dyn AcceleratedOp<ReduceInput<i32>, i32> = &Reduction::atomic(ReduceOp::Max);
        assert_eq!(tree.label(), "max");
        assert_eq!(atomic.label(), "atomic_max");
    }

    #[test]
    fn test_squared_deviation_through_manager() {
        let manager = AccelerationManager::emulated();
        let input = DeviationInput {
            data: vec![100, 300, 0, 0].into(),
            logical_len: 2,
            local_size: 2,
        };
        let (out, _) = manager.execute(&SquaredDeviation { mean: 200 }, &input).unwrap();
        assert_eq!(out.lo, vec![10_000, 10_000, 0, 0]);
        assert_eq!(out.hi, vec![0; 4]);
    }
}

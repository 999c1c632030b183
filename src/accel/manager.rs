use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::workgroup::WorkGroupEmulator;
use super::{AccelError, AccelMetadata, DeviceInfo};

/// Backend types for reduction dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// OpenCL device (GPU or accelerator) through the ICD loader
    OpenCl,
    /// Host emulation of the work-group model
    Emulated,
    /// Scalar CPU Reference - Verification only
    Scalar,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Backend::OpenCl => "opencl",
            Backend::Emulated => "emulated",
            Backend::Scalar => "scalar",
        })
    }
}

/// Backend requested by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum BackendPreference {
    /// OpenCL when compiled in and a device exists, otherwise emulated
    #[default]
    Auto,
    #[value(name = "opencl")]
    #[serde(rename = "opencl")]
    OpenCl,
    Emulated,
    Scalar,
}

/// Result of a device dispatch, with device-side execution time when the
/// backend can measure it.
#[derive(Debug)]
pub struct Dispatched<T> {
    pub value: T,
    pub device_ns: Option<u64>,
}

/// Trait that all reduction kernels implement: one entry per backend.
pub trait AcceleratedOp<Input, Output> {
    /// Label used in logs and stage timings.
    fn label(&self) -> String;

    /// OpenCL implementation (device kernels from `kernels/reduce.cl`)
    fn run_opencl(
        &self,
        input: &Input,
        manager: &AccelerationManager,
    ) -> Result<Dispatched<Output>, AccelError>;

    /// Emulated work-group implementation
    fn run_emulated(
        &self,
        input: &Input,
        manager: &AccelerationManager,
    ) -> Result<Output, AccelError>;

    /// Scalar implementation (Reference)
    fn run_scalar(&self, input: &Input) -> Result<Output, AccelError>;
}

/// How the manager should pick and check its device.
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub backend: BackendPreference,
    pub platform_index: usize,
    pub device_index: usize,
    pub build_options: String,
    pub profiling: bool,
    /// Re-run every dispatch on the scalar reference and compare.
    pub verify: bool,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            backend: BackendPreference::Auto,
            platform_index: 0,
            device_index: 0,
            build_options: String::new(),
            profiling: false,
            verify: cfg!(debug_assertions),
        }
    }
}

/// Manager to handle backend selection and dispatch
pub struct AccelerationManager {
    backend: Backend,
    device: DeviceInfo,
    emulator: WorkGroupEmulator,
    #[cfg(feature = "opencl")]
    opencl: Option<super::opencl::OpenClEngine>,
    verify: bool,
}

impl AccelerationManager {
    /// Resolve the backend and select the `(platform, device)` pair.
    ///
    /// Fails before any device work if the indices are out of range or the
    /// kernel program does not build.
    pub fn new(options: &ManagerOptions) -> Result<Self, AccelError> {
        let backend = match options.backend {
            BackendPreference::Auto if opencl_available() => Backend::OpenCl,
            BackendPreference::Auto | BackendPreference::Emulated => Backend::Emulated,
            BackendPreference::OpenCl => Backend::OpenCl,
            BackendPreference::Scalar => Backend::Scalar,
        };

        let manager = match backend {
            Backend::OpenCl => Self::with_opencl(options)?,
            Backend::Emulated | Backend::Scalar => {
                let platforms = super::enumerate(backend);
                let device =
                    super::select(&platforms, options.platform_index, options.device_index)?;
                Self {
                    backend,
                    device,
                    emulator: WorkGroupEmulator::new(),
                    #[cfg(feature = "opencl")]
                    opencl: None,
                    verify: options.verify,
                }
            }
        };

        info!(
            "AccelerationManager initialized. Backend: {}, device: {}, max work-group: {}, \
             verify: {}",
            manager.backend,
            manager.device.name,
            manager.device.max_work_group_size,
            manager.verify
        );
        Ok(manager)
    }

    /// Emulated device with default options.
    pub fn emulated() -> Self {
        Self {
            backend: Backend::Emulated,
            device: WorkGroupEmulator::device(),
            emulator: WorkGroupEmulator::new(),
            #[cfg(feature = "opencl")]
            opencl: None,
            verify: cfg!(debug_assertions),
        }
    }

    #[cfg(feature = "opencl")]
    fn with_opencl(options: &ManagerOptions) -> Result<Self, AccelError> {
        let engine = super::opencl::OpenClEngine::select(
            options.platform_index,
            options.device_index,
            &options.build_options,
            options.profiling,
        )?;
        Ok(Self {
            backend: Backend::OpenCl,
            device: engine.device().clone(),
            emulator: WorkGroupEmulator::new(),
            opencl: Some(engine),
            verify: options.verify,
        })
    }

    #[cfg(not(feature = "opencl"))]
    fn with_opencl(_options: &ManagerOptions) -> Result<Self, AccelError> {
        Err(AccelError::BackendUnavailable {
            backend: Backend::OpenCl,
            reason: "built without the `opencl` feature".to_string(),
        })
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub fn device(&self) -> &DeviceInfo {
        &self.device
    }

    pub fn emulator(&self) -> &WorkGroupEmulator {
        &self.emulator
    }

    #[cfg(feature = "opencl")]
    pub fn get_opencl(&self) -> Option<&super::opencl::OpenClEngine> {
        self.opencl.as_ref()
    }

    /// Execute an operation on the selected backend.
    /// With verification on, the result must match the scalar reference.
    pub fn execute<Op, Input, Output>(
        &self,
        op: &Op,
        input: &Input,
    ) -> Result<(Output, AccelMetadata), AccelError>
    where
        Op: AcceleratedOp<Input, Output>,
        Output: PartialEq + fmt::Debug,
    {
        let started = Instant::now();
        let (result, device_ns) = match self.backend {
            Backend::OpenCl => {
                let dispatched = op.run_opencl(input, self)?;
                (dispatched.value, dispatched.device_ns)
            }
            Backend::Emulated => (op.run_emulated(input, self)?, None),
            Backend::Scalar => (op.run_scalar(input)?, None),
        };
        let duration_us = device_ns
            .map(|ns| ns / 1_000)
            .unwrap_or_else(|| started.elapsed().as_micros() as u64);

        if self.verify && self.backend != Backend::Scalar {
            let reference = op.run_scalar(input)?;
            if result != reference {
                warn!(
                    op = %op.label(),
                    backend = %self.backend,
                    "Acceleration mismatch! got {:?}, scalar reference {:?}",
                    result,
                    reference
                );
                return Err(AccelError::VerificationFailed {
                    op: op.label(),
                    backend: self.backend,
                });
            }
            debug!(op = %op.label(), "Acceleration verification passed for {}", self.backend);
        }

        Ok((
            result,
            AccelMetadata {
                path_used: self.backend,
                duration_us,
            },
        ))
    }
}

fn opencl_available() -> bool {
    #[cfg(feature = "opencl")]
    {
        super::opencl::platforms().iter().any(|p| !p.devices.is_empty())
    }
    #[cfg(not(feature = "opencl"))]
    {
        false
    }
}

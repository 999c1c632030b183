//! OpenCL device backend.
//!
//! Builds `kernels/reduce.cl` for one selected device and runs the reduction
//! family on it. Multi-level tree reductions stay on the device: each level's
//! partial buffer is pre-filled with the operator identity, sized to a whole
//! number of work-groups, and becomes the next level's input. Only the final
//! slot is read back.

use std::ptr;

use opencl3::command_queue::{CommandQueue, CL_QUEUE_PROFILING_ENABLE};
use opencl3::context::Context;
use opencl3::device::{Device, CL_DEVICE_TYPE_ALL};
use opencl3::error_codes::ClError;
use opencl3::event::Event;
use opencl3::kernel::{ExecuteKernel, Kernel};
use opencl3::memory::{Buffer, CL_MEM_READ_ONLY, CL_MEM_READ_WRITE};
use opencl3::platform::get_platforms;
use opencl3::program::Program;
use opencl3::types::{cl_long, cl_ulong, CL_BLOCKING};
use tracing::{debug, info};

use super::manager::Dispatched;
use super::{
    check_launch, check_mean, pad, AccelError, DeviceInfo, Lane, PlatformInfo, ReduceOp,
    SquareLimbs, Strategy,
};

const REDUCE_KERNEL_SOURCE: &str = include_str!("../../kernels/reduce.cl");

/// Enumerate OpenCL platforms and their devices.
///
/// Returns an empty vec if no ICD loader or platform is installed.
pub fn platforms() -> Vec<PlatformInfo> {
    let platforms = match get_platforms() {
        Ok(platforms) => platforms,
        Err(_) => return Vec::new(),
    };

    platforms
        .iter()
        .enumerate()
        .map(|(index, platform)| {
            let devices = platform
                .get_devices(CL_DEVICE_TYPE_ALL)
                .unwrap_or_default()
                .into_iter()
                .enumerate()
                .map(|(index, id)| describe(index, &Device::new(id)))
                .collect();
            PlatformInfo {
                index,
                name: platform.name().unwrap_or_default().trim().to_string(),
                vendor: platform.vendor().unwrap_or_default().trim().to_string(),
                devices,
            }
        })
        .collect()
}

fn describe(index: usize, device: &Device) -> DeviceInfo {
    DeviceInfo {
        index,
        name: device.name().unwrap_or_default().trim().to_string(),
        vendor: device.vendor().unwrap_or_default().trim().to_string(),
        max_work_group_size: device.max_work_group_size().unwrap_or(1),
        compute_units: device.max_compute_units().unwrap_or(1),
    }
}

fn device_error(op: &str) -> impl Fn(ClError) -> AccelError + '_ {
    move |e| AccelError::Dispatch {
        op: op.to_string(),
        code: e.0,
        message: e.to_string(),
    }
}

/// Context, queue, and built program for one selected device.
///
/// Kernels are created per dispatch: concurrent first-wave dispatches must
/// not share kernel argument state.
pub struct OpenClEngine {
    _device: Device,
    info: DeviceInfo,
    context: Context,
    queue: CommandQueue,
    program: Program,
    profiling: bool,
}

// SAFETY: OpenCL 1.2+ guarantees thread safety for context, command queue,
// program, and memory objects. Kernel objects, which are not thread safe,
// never leave the dispatching thread.
unsafe impl Send for OpenClEngine {}
unsafe impl Sync for OpenClEngine {}

impl std::fmt::Debug for OpenClEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenClEngine")
            .field("device", &self.info.name)
            .field("profiling", &self.profiling)
            .finish_non_exhaustive()
    }
}

impl OpenClEngine {
    /// Select `(platform, device)` and build the reduction program for it.
    pub fn select(
        platform_index: usize,
        device_index: usize,
        build_options: &str,
        profiling: bool,
    ) -> Result<Self, AccelError> {
        let selection_error = |reason: String| AccelError::DeviceSelection {
            platform: platform_index,
            device: device_index,
            reason,
        };

        let platforms = get_platforms().map_err(|e| selection_error(e.to_string()))?;
        let platform = platforms
            .get(platform_index)
            .ok_or_else(|| selection_error(format!("{} platform(s) available", platforms.len())))?;
        let ids = platform
            .get_devices(CL_DEVICE_TYPE_ALL)
            .map_err(|e| selection_error(e.to_string()))?;
        let id = *ids
            .get(device_index)
            .ok_or_else(|| selection_error(format!("platform has {} device(s)", ids.len())))?;

        let device = Device::new(id);
        let info = describe(device_index, &device);
        let context = Context::from_device(&device).map_err(device_error("create context"))?;

        let queue_props = if profiling { CL_QUEUE_PROFILING_ENABLE } else { 0 };
        #[allow(deprecated)]
        let queue = CommandQueue::create_default(&context, queue_props)
            .map_err(device_error("create queue"))?;

        let program = build_program(&context, &device, build_options)?;

        info!(
            platform = %platform.name().unwrap_or_default().trim(),
            device = %info.name,
            max_work_group = info.max_work_group_size,
            "OpenCL device selected"
        );

        Ok(Self {
            _device: device,
            info,
            context,
            queue,
            program,
            profiling,
        })
    }

    pub fn device(&self) -> &DeviceInfo {
        &self.info
    }

    fn kernel(&self, name: &str) -> Result<Kernel, AccelError> {
        Kernel::create(&self.program, name).map_err(device_error(name))
    }

    fn elapsed_ns(&self, event: &Event) -> Option<u64> {
        if !self.profiling {
            return None;
        }
        let start = event.profiling_command_start().ok()?;
        let end = event.profiling_command_end().ok()?;
        Some(end.saturating_sub(start))
    }

    fn upload<T: Lane>(&self, op: &str, data: &[T], flags: u64) -> Result<Buffer<T>, AccelError> {
        let mut buffer = unsafe {
            Buffer::<T>::create(&self.context, flags, data.len(), ptr::null_mut())
                .map_err(device_error(op))?
        };
        let event = unsafe {
            self.queue
                .enqueue_write_buffer(&mut buffer, CL_BLOCKING, 0, data, &[])
                .map_err(device_error(op))?
        };
        event.wait().map_err(device_error(op))?;
        Ok(buffer)
    }

    fn read_first<T: Lane>(&self, op: &str, buffer: &Buffer<T>) -> Result<T, AccelError> {
        let mut out = [T::ZERO];
        let event = unsafe {
            self.queue
                .enqueue_read_buffer(buffer, CL_BLOCKING, 0, &mut out, &[])
                .map_err(device_error(op))?
        };
        event.wait().map_err(device_error(op))?;
        Ok(out[0])
    }

    /// Reduce a buffer padded to whole work-groups.
    pub fn reduce<T: Lane>(
        &self,
        op: ReduceOp,
        strategy: Strategy,
        data: &[T],
        local_size: usize,
    ) -> Result<Dispatched<T>, AccelError> {
        check_launch(op.name(), data.len(), local_size, self.info.max_work_group_size)?;
        match strategy {
            Strategy::Tree => self.tree_reduce(op, data, local_size),
            Strategy::Atomic => self.atomic_reduce(op, data, local_size),
        }
    }

    fn tree_reduce<T: Lane>(
        &self,
        op: ReduceOp,
        data: &[T],
        local_size: usize,
    ) -> Result<Dispatched<T>, AccelError> {
        let name = format!("reduce_{}_{}", op, T::CL_TYPE);
        let kernel = self.kernel(&name)?;
        let mut input = self.upload(&name, data, CL_MEM_READ_WRITE)?;
        let mut len = data.len();
        let mut device_ns: Option<u64> = None;

        loop {
            let groups = len / local_size;
            let next_len = groups + pad::padding_len(groups, local_size);
            let identity = vec![op.identity::<T>(); next_len.max(1)];
            let partials = self.upload(&name, &identity, CL_MEM_READ_WRITE)?;

            let event = unsafe {
                ExecuteKernel::new(&kernel)
                    .set_arg(&input)
                    .set_arg(&partials)
                    .set_arg_local_buffer(local_size * std::mem::size_of::<T>())
                    .set_global_work_size(len)
                    .set_local_work_size(local_size)
                    .enqueue_nd_range(&self.queue)
                    .map_err(device_error(&name))?
            };
            event.wait().map_err(device_error(&name))?;
            if let Some(ns) = self.elapsed_ns(&event) {
                device_ns = Some(device_ns.unwrap_or(0) + ns);
            }
            debug!(kernel = %name, global = len, groups, "tree level complete");

            if groups == 1 {
                let value = self.read_first(&name, &partials)?;
                return Ok(Dispatched { value, device_ns });
            }
            input = partials;
            len = next_len;
        }
    }

    fn atomic_reduce<T: Lane>(
        &self,
        op: ReduceOp,
        data: &[T],
        local_size: usize,
    ) -> Result<Dispatched<T>, AccelError> {
        if op == ReduceOp::Sum || T::CL_TYPE != "int" {
            return Err(AccelError::UnsupportedStrategy {
                op,
                strategy: Strategy::Atomic,
            });
        }

        let name = format!("atomic_{}_{}", op, T::CL_TYPE);
        let kernel = self.kernel(&name)?;
        let input = self.upload(&name, data, CL_MEM_READ_ONLY)?;
        let result = self.upload(&name, &[op.identity::<T>()], CL_MEM_READ_WRITE)?;

        let event = unsafe {
            ExecuteKernel::new(&kernel)
                .set_arg(&input)
                .set_arg(&result)
                .set_global_work_size(data.len())
                .set_local_work_size(local_size)
                .enqueue_nd_range(&self.queue)
                .map_err(device_error(&name))?
        };
        event.wait().map_err(device_error(&name))?;

        let value = self.read_first(&name, &result)?;
        Ok(Dispatched {
            value,
            device_ns: self.elapsed_ns(&event),
        })
    }

    /// Per-element squared deviation from the encoded `mean`, as limbs.
    pub fn squared_deviation(
        &self,
        data: &[i32],
        logical_len: usize,
        mean: i64,
        local_size: usize,
    ) -> Result<Dispatched<SquareLimbs>, AccelError> {
        let name = "squared_deviation";
        check_launch(name, data.len(), local_size, self.info.max_work_group_size)?;
        check_mean(mean)?;

        let kernel = self.kernel(name)?;
        let input = self.upload(name, data, CL_MEM_READ_ONLY)?;
        let create_output = || unsafe {
            Buffer::<i64>::create(&self.context, CL_MEM_READ_WRITE, data.len(), ptr::null_mut())
                .map_err(device_error(name))
        };
        let lo = create_output()?;
        let hi = create_output()?;
        let n = logical_len as cl_ulong;
        let mean = mean as cl_long;

        let event = unsafe {
            ExecuteKernel::new(&kernel)
                .set_arg(&input)
                .set_arg(&lo)
                .set_arg(&hi)
                .set_arg(&n)
                .set_arg(&mean)
                .set_global_work_size(data.len())
                .set_local_work_size(local_size)
                .enqueue_nd_range(&self.queue)
                .map_err(device_error(name))?
        };
        event.wait().map_err(device_error(name))?;

        let mut out = SquareLimbs::with_len(data.len());
        for (buffer, host) in [(&lo, &mut out.lo), (&hi, &mut out.hi)] {
            let read = unsafe {
                self.queue
                    .enqueue_read_buffer(buffer, CL_BLOCKING, 0, host, &[])
                    .map_err(device_error(name))?
            };
            read.wait().map_err(device_error(name))?;
        }

        Ok(Dispatched {
            value: out,
            device_ns: self.elapsed_ns(&event),
        })
    }
}

/// Build the reduction program, attaching status, options, and log on failure.
fn build_program(context: &Context, device: &Device, options: &str) -> Result<Program, AccelError> {
    let mut program =
        Program::create_from_source(context, REDUCE_KERNEL_SOURCE).map_err(|e| {
            AccelError::BuildFailed {
                status: e.0,
                options: options.to_string(),
                log: e.to_string(),
            }
        })?;

    if let Err(e) = program.build(context.devices(), options) {
        let id = device.id();
        return Err(AccelError::BuildFailed {
            status: program.get_build_status(id).unwrap_or(e.0),
            options: program.get_build_options(id).unwrap_or_else(|_| options.to_string()),
            log: program.get_build_log(id).unwrap_or_else(|_| e.to_string()),
        });
    }

    debug!(options, "reduction program built");
    Ok(program)
}

//! OpenCL implementation of the compute boundary: device enumeration,
//! program bootstrap with a per-device binary cache, and one driver per
//! device. Requires the `opencl` feature and a working OpenCL ICD loader.

use std::fs;
use std::path::PathBuf;
use std::ptr;
use std::thread::{self, JoinHandle};

use anyhow::{anyhow, bail, Context as _, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use opencl3::command_queue::CommandQueue;
use opencl3::context::Context;
use opencl3::device::{Device, CL_DEVICE_TYPE_GPU};
use opencl3::error_codes::{ClError, CL_INVALID_WORK_GROUP_SIZE, CL_INVALID_WORK_ITEM_SIZE};
use opencl3::event::{Event, CL_COMPLETE};
use opencl3::kernel::{ExecuteKernel, Kernel};
use opencl3::memory::{
    Buffer, CL_MEM_HOST_READ_ONLY, CL_MEM_HOST_WRITE_ONLY, CL_MEM_READ_ONLY, CL_MEM_READ_WRITE,
};
use opencl3::platform::get_platforms;
use opencl3::types::{cl_device_id, cl_uchar, cl_uint, cl_ulong, CL_BLOCKING, CL_NON_BLOCKING};
use sha3::{Digest, Keccak256};

use crate::mode::Mode;
use crate::types::{ResultSlot, MAX_SCORE, SCORE_SLOTS};

use super::{Completion, CompletionFn, ComputeError, ComputeResult, KernelDriver, RunSetup};

const KERNEL_INIT: &str = "dredge_init";
const KERNEL_ITERATE: &str = "dredge_iterate";
const KERNEL_FILES: [&str; 2] = ["keccak.cl", "dredge.cl"];

/// One usable device picked during enumeration, with its cached program
/// binary if one exists on disk.
pub struct SelectedDevice {
    pub index: usize,
    pub name: String,
    device: Device,
    cache_path: PathBuf,
    binary: Option<Vec<u8>>,
}

/// Enumerate GPU devices across every platform, honoring skip indices, and
/// probe the binary cache. Prints one banner line per device.
pub fn enumerate_devices(skip: &[usize], no_cache: bool) -> Result<Vec<SelectedDevice>> {
    let platforms = get_platforms().map_err(|err| anyhow!("platform query failed: {err}"))?;

    let mut selected = Vec::new();
    let mut index = 0usize;
    println!("Devices:");
    for platform in platforms {
        let platform_name = platform.name().unwrap_or_default();
        let device_ids = platform.get_devices(CL_DEVICE_TYPE_GPU).unwrap_or_default();
        for device_id in device_ids {
            let current = index;
            index += 1;
            if skip.contains(&current) {
                continue;
            }

            let device = Device::new(device_id);
            let name = device.name().unwrap_or_default();
            let vendor = device.vendor().unwrap_or_default();
            let global_mem = device.global_mem_size().unwrap_or_default();
            let compute_units = device.max_compute_units().unwrap_or_default();

            let cache_path = cache_filename(&platform_name, &vendor, &name, current);
            let binary = if no_cache {
                None
            } else {
                fs::read(&cache_path).ok()
            };

            println!(
                "  GPU{current}: {name}, {global_mem} bytes available, {compute_units} compute units (precompiled = {})",
                if binary.is_some() { "yes" } else { "no" }
            );

            selected.push(SelectedDevice {
                index: current,
                name,
                device,
                cache_path,
                binary,
            });
        }
    }
    Ok(selected)
}

/// Cache file keyed on a stable identity for the device plus its enumeration
/// index, so identical models get separate entries.
fn cache_filename(platform: &str, vendor: &str, name: &str, index: usize) -> PathBuf {
    let digest = Keccak256::digest(format!("{platform}|{vendor}|{name}").as_bytes());
    let id = crate::types::encode_hex(&digest[..4]);
    PathBuf::from(format!("cache-opencl.{id}.{index}"))
}

/// Shared context and compiled program for all selected devices.
pub struct Bootstrap {
    context: Context,
    program: opencl3::program::Program,
}

impl Bootstrap {
    pub fn create(devices: &[SelectedDevice], init_hash: &str, no_cache: bool) -> Result<Self> {
        let ids: Vec<cl_device_id> = devices.iter().map(|d| d.device.id()).collect();

        println!();
        println!("Initializing OpenCL...");
        print!("  Creating context...");
        let context = Context::from_devices(&ids, &[], None, ptr::null_mut())
            .map_err(|err| anyhow!("failed to create context (status {})", err.0))?;
        println!(" OK");

        let options = format!("-D MAX_SCORE={MAX_SCORE} -D DREDGE_INITHASH={init_hash}");
        let cached = devices.iter().all(|d| d.binary.is_some());

        let program = if cached {
            print!("  Loading kernel from binary...");
            let binaries: Vec<&[u8]> = devices
                .iter()
                .filter_map(|d| d.binary.as_deref())
                .collect();
            let mut program = opencl3::program::Program::create_from_binary(&context, &ids, &binaries)
                .map_err(|err| anyhow!("failed to load kernel binaries (status {})", err.0))?;
            program
                .build(&ids, &options)
                .map_err(|err| anyhow!("failed to build cached program (status {})", err.0))?;
            println!(" OK");
            program
        } else {
            print!("  Compiling kernel...");
            let source = read_kernel_source()?;
            let program =
                opencl3::program::Program::create_and_build_from_source(&context, &source, &options)
                    .map_err(|log| anyhow!("kernel build failed: {log}"))?;
            println!(" OK");

            if !no_cache {
                print!("  Saving program...");
                save_binaries(&program, devices)?;
                println!(" OK");
            }
            program
        };

        println!();
        Ok(Self { context, program })
    }

    pub fn driver(&self, device: &SelectedDevice) -> Result<Box<OpenClDriver>> {
        OpenClDriver::create(&self.context, &self.program, device).map(Box::new)
    }
}

fn read_kernel_source() -> Result<String> {
    let mut source = String::new();
    for file in KERNEL_FILES {
        let part = fs::read_to_string(file)
            .with_context(|| format!("failed to read kernel source {file}"))?;
        source.push_str(&part);
        source.push('\n');
    }
    Ok(source)
}

fn save_binaries(program: &opencl3::program::Program, devices: &[SelectedDevice]) -> Result<()> {
    let binaries = program
        .get_binaries()
        .map_err(|err| anyhow!("failed to fetch program binaries (status {})", err.0))?;
    if binaries.len() != devices.len() {
        bail!(
            "program returned {} binaries for {} devices",
            binaries.len(),
            devices.len()
        );
    }
    for (device, binary) in devices.iter().zip(binaries) {
        fs::write(&device.cache_path, binary).with_context(|| {
            format!("failed to write kernel cache {}", device.cache_path.display())
        })?;
    }
    Ok(())
}

struct WatchTask {
    event: Event,
    host: Vec<ResultSlot>,
    on_complete: CompletionFn,
}

// OpenCL event objects are thread-safe; the watcher thread is the only
// consumer of the event after hand-off.
unsafe impl Send for WatchTask {}

/// Driver for one device: queue, kernels, device-resident buffers and a
/// watcher thread that turns read-back events into completion calls.
pub struct OpenClDriver {
    device_index: usize,
    queue: CommandQueue,
    kernel_init: Kernel,
    kernel_iterate: Kernel,
    mem_results: Buffer<ResultSlot>,
    mem_mode: Buffer<cl_uchar>,
    mem_address: Buffer<cl_uchar>,
    mem_digest: Buffer<cl_uchar>,
    mem_seed: Buffer<cl_ulong>,
    skip_score: u8,
    round: u32,
    watcher_tx: Option<Sender<WatchTask>>,
    watcher: Option<JoinHandle<()>>,
}

// The queue and buffers are only ever touched from the owning unit; the
// watcher thread sees events and host vectors, never device memory.
unsafe impl Send for OpenClDriver {}

impl OpenClDriver {
    fn create(
        context: &Context,
        program: &opencl3::program::Program,
        device: &SelectedDevice,
    ) -> Result<Self> {
        let queue = CommandQueue::create(context, device.device.id(), 0)
            .map_err(|err| anyhow!("failed to create command queue (status {})", err.0))?;
        let kernel_init = Kernel::create(program, KERNEL_INIT)
            .map_err(|err| anyhow!("failed to create kernel {KERNEL_INIT} (status {})", err.0))?;
        let kernel_iterate = Kernel::create(program, KERNEL_ITERATE).map_err(|err| {
            anyhow!("failed to create kernel {KERNEL_ITERATE} (status {})", err.0)
        })?;

        let mem_results = create_buffer::<ResultSlot>(
            context,
            CL_MEM_READ_WRITE | CL_MEM_HOST_READ_ONLY,
            SCORE_SLOTS,
        )?;
        let mem_mode = create_buffer::<cl_uchar>(
            context,
            CL_MEM_READ_ONLY | CL_MEM_HOST_WRITE_ONLY,
            Mode::DEVICE_BYTES,
        )?;
        let mem_address =
            create_buffer::<cl_uchar>(context, CL_MEM_READ_ONLY | CL_MEM_HOST_WRITE_ONLY, 20)?;
        let mem_digest =
            create_buffer::<cl_uchar>(context, CL_MEM_READ_ONLY | CL_MEM_HOST_WRITE_ONLY, 32)?;
        let mem_seed =
            create_buffer::<cl_ulong>(context, CL_MEM_READ_ONLY | CL_MEM_HOST_WRITE_ONLY, 4)?;

        let (watcher_tx, watcher_rx) = unbounded::<WatchTask>();
        let watcher = thread::Builder::new()
            .name(format!("dredge-watch-{}", device.index))
            .spawn(move || watch_loop(watcher_rx))
            .context("failed to spawn completion watcher")?;

        Ok(Self {
            device_index: device.index,
            queue,
            kernel_init,
            kernel_iterate,
            mem_results,
            mem_mode,
            mem_address,
            mem_digest,
            mem_seed,
            skip_score: 0,
            round: 0,
            watcher_tx: Some(watcher_tx),
            watcher: Some(watcher),
        })
    }

}

fn transport(device: usize, call: &'static str, err: ClError) -> ComputeError {
    ComputeError::Transport {
        device,
        call,
        status: err.0,
    }
}

fn create_buffer<T>(context: &Context, flags: u64, count: usize) -> Result<Buffer<T>> {
    unsafe {
        Buffer::<T>::create(context, flags, count, ptr::null_mut())
            .map_err(|err| anyhow!("failed to create device buffer (status {})", err.0))
    }
}

fn watch_loop(rx: Receiver<WatchTask>) {
    while let Ok(task) = rx.recv() {
        let completion = match task.event.wait() {
            Ok(()) => match task.event.command_execution_status() {
                Ok(status) if status.0 == CL_COMPLETE => Completion::Complete(task.host),
                Ok(status) => Completion::Failed { status: status.0 },
                Err(err) => Completion::Failed { status: err.0 },
            },
            Err(err) => Completion::Failed { status: err.0 },
        };
        (task.on_complete)(completion);
    }
}

impl KernelDriver for OpenClDriver {
    fn prepare(&mut self, mode: &Mode, setup: &RunSetup) -> ComputeResult<()> {
        self.skip_score = 0;
        self.round = 0;

        let zeroed = vec![ResultSlot::default(); SCORE_SLOTS];
        let mode_bytes = mode.device_bytes();
        unsafe {
            self.queue
                .enqueue_write_buffer(&mut self.mem_results, CL_BLOCKING, 0, &zeroed, &[])
                .map_err(|err| transport(self.device_index, "result buffer write", err))?;
            self.queue
                .enqueue_write_buffer(&mut self.mem_mode, CL_BLOCKING, 0, &mode_bytes, &[])
                .map_err(|err| transport(self.device_index, "mode buffer write", err))?;
            self.queue
                .enqueue_write_buffer(&mut self.mem_address, CL_BLOCKING, 0, &setup.address, &[])
                .map_err(|err| transport(self.device_index, "address buffer write", err))?;
            self.queue
                .enqueue_write_buffer(
                    &mut self.mem_digest,
                    CL_BLOCKING,
                    0,
                    &setup.init_code_digest,
                    &[],
                )
                .map_err(|err| transport(self.device_index, "init code digest write", err))?;
            self.queue
                .enqueue_write_buffer(&mut self.mem_seed, CL_BLOCKING, 0, &setup.seed, &[])
                .map_err(|err| transport(self.device_index, "seed buffer write", err))?;
        }

        let result = unsafe {
            ExecuteKernel::new(&self.kernel_init)
                .set_arg(&self.mem_results)
                .set_arg(&self.mem_address)
                .set_arg(&self.mem_digest)
                .set_arg(&self.mem_seed)
                .set_arg(&setup.size)
                .set_global_work_size(1)
                .enqueue_nd_range(&self.queue)
        };
        result.map_err(|err| transport(self.device_index, "init enqueue", err))?;

        self.queue
            .finish()
            .map_err(|err| transport(self.device_index, "init finish", err))
    }

    fn set_skip_score(&mut self, score: u8) -> ComputeResult<()> {
        self.skip_score = score;
        Ok(())
    }

    fn set_round(&mut self, round: u32) -> ComputeResult<()> {
        self.round = round;
        Ok(())
    }

    fn enqueue_iterate(
        &mut self,
        offset: u64,
        count: u64,
        local: Option<u64>,
    ) -> ComputeResult<()> {
        let device_index = self.device_index as cl_uint;
        let result = unsafe {
            let mut exec = ExecuteKernel::new(&self.kernel_iterate);
            exec.set_arg(&self.mem_results)
                .set_arg(&self.mem_mode)
                .set_arg(&self.skip_score)
                .set_arg(&device_index)
                .set_arg(&self.round)
                .set_global_work_offsets(&[offset as usize])
                .set_global_work_size(count as usize);
            if let Some(local) = local {
                exec.set_local_work_size(local as usize);
            }
            exec.enqueue_nd_range(&self.queue)
        };
        match result {
            Ok(_event) => Ok(()),
            Err(err)
                if err.0 == CL_INVALID_WORK_GROUP_SIZE || err.0 == CL_INVALID_WORK_ITEM_SIZE =>
            {
                Err(ComputeError::WorkGroupSize {
                    device: self.device_index,
                    status: err.0,
                })
            }
            Err(err) => Err(transport(self.device_index, "iterate enqueue", err)),
        }
    }

    fn flush(&mut self) -> ComputeResult<()> {
        self.queue
            .flush()
            .map_err(|err| transport(self.device_index, "queue flush", err))
    }

    fn read_results_async(&mut self, on_complete: CompletionFn) -> ComputeResult<()> {
        let mut host = vec![ResultSlot::default(); SCORE_SLOTS];
        let event = unsafe {
            self.queue
                .enqueue_read_buffer(&self.mem_results, CL_NON_BLOCKING, 0, &mut host, &[])
        }
        .map_err(|err| transport(self.device_index, "result read enqueue", err))?;
        self.flush()?;

        let task = WatchTask {
            event,
            host,
            on_complete,
        };
        let sender = self.watcher_tx.as_ref().ok_or(ComputeError::Transport {
            device: self.device_index,
            call: "completion watcher",
            status: 0,
        })?;
        sender.send(task).map_err(|_| ComputeError::Transport {
            device: self.device_index,
            call: "completion watcher",
            status: 0,
        })
    }
}

impl Drop for OpenClDriver {
    fn drop(&mut self) {
        // Closing the channel stops the watcher after its current task.
        self.watcher_tx.take();
        if let Some(watcher) = self.watcher.take() {
            let _ = watcher.join();
        }
    }
}

mod device;

pub use device::DeviceUnit;

use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Instant;

use anyhow::Result;
use crossbeam_channel::{bounded, Sender};

use crate::compute::{Completion, ComputeError, ComputeResult, KernelDriver, RunSetup};
use crate::mode::Mode;
use crate::speed::{SpeedSampler, CLEAR_LINE};
use crate::types::{encode_hex, ResultSlot};

/// A winning candidate promoted past the global watermark.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundResult {
    pub score: u8,
    pub salt: [u8; 32],
    pub address: [u8; 20],
    pub device: usize,
}

#[derive(Debug, Clone)]
pub enum DispatchEvent {
    Result(FoundResult),
}

/// Per-run coordinator state. Everything shared across device callbacks
/// lives here, under one mutex, so the quit/running/watermark invariant is
/// auditable in one place.
struct RunState {
    quit: bool,
    running: usize,
    best_score: u8,
    best: Option<FoundResult>,
    fatal: Option<ComputeError>,
    started_at: Instant,
    done: Option<Sender<()>>,
}

struct Shared {
    state: Mutex<RunState>,
    speed: SpeedSampler,
    event_sink: RwLock<Option<Sender<DispatchEvent>>>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, RunState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Everything one round-completion continuation needs. Owned clones only:
/// the unit cannot be destroyed while a round is outstanding.
#[derive(Clone)]
struct RoundContext {
    shared: Arc<Shared>,
    unit: Arc<Mutex<DeviceUnit>>,
    size: u64,
    worksize_max: u64,
}

/// Requests run termination. Stopping never cancels in-flight rounds; each
/// device drains its current round and retires at the next completion.
#[derive(Clone)]
pub struct StopHandle {
    shared: Arc<Shared>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.shared.state().quit = true;
    }
}

/// The dispatch core: owns the device units, the global best-score
/// watermark and the round-lifecycle/termination protocol.
///
/// `run` launches one round per device and then blocks on a one-shot latch;
/// all further scheduling happens inside completion continuations delivered
/// by the compute runtime. No dispatcher-owned thread, no polling.
pub struct Dispatcher {
    units: Vec<Arc<Mutex<DeviceUnit>>>,
    worksize_max: u64,
    size: u64,
    shared: Arc<Shared>,
}

impl Dispatcher {
    pub fn new(worksize_max: u64, size: u64) -> Self {
        Self {
            units: Vec::new(),
            worksize_max,
            size,
            shared: Arc::new(Shared {
                state: Mutex::new(RunState {
                    quit: false,
                    running: 0,
                    best_score: 0,
                    best: None,
                    fatal: None,
                    started_at: Instant::now(),
                    done: None,
                }),
                speed: SpeedSampler::new(),
                event_sink: RwLock::new(None),
            }),
        }
    }

    pub fn add_device(
        &mut self,
        driver: Box<dyn KernelDriver>,
        index: usize,
        worksize_local: Option<u64>,
    ) {
        self.units.push(Arc::new(Mutex::new(DeviceUnit::new(
            driver,
            index,
            worksize_local,
        ))));
    }

    pub fn device_count(&self) -> usize {
        self.units.len()
    }

    pub fn set_event_sink(&mut self, sink: Sender<DispatchEvent>) {
        if let Ok(mut slot) = self.shared.event_sink.write() {
            *slot = Some(sink);
        }
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Best result promoted during the most recent run.
    pub fn best_result(&self) -> Option<FoundResult> {
        self.shared.state().best.clone()
    }

    /// Run the search until stopped or a fatal device error.
    ///
    /// Blocks the calling thread on the run's completion latch; the latch
    /// fires when every device has observed the quit flag and retired (or
    /// immediately, with zero devices attached).
    pub fn run(&mut self, mode: &Mode, address: [u8; 20], init_code_digest: [u8; 32]) -> Result<()> {
        let (done_tx, done_rx) = bounded::<()>(1);

        {
            let mut state = self.shared.state();
            state.quit = false;
            state.running = self.units.len();
            state.best_score = 0;
            state.best = None;
            state.fatal = None;
            state.started_at = Instant::now();
            state.done = Some(done_tx);
            if state.running == 0 {
                fire_latch(&mut state);
            }
        }

        for unit in &self.units {
            let setup = RunSetup {
                address,
                init_code_digest,
                seed: rand::random(),
                size: self.size as u32,
            };
            lock_unit(unit).prepare(mode, &setup)?;
        }

        // First round on every device; devices that fail to launch retire
        // immediately so the latch still fires once the rest drain.
        let mut launch_failed = false;
        for unit in &self.units {
            if launch_failed {
                retire_device(&mut self.shared.state());
                continue;
            }
            let context = RoundContext {
                shared: Arc::clone(&self.shared),
                unit: Arc::clone(unit),
                size: self.size,
                worksize_max: self.worksize_max,
            };
            if let Err(err) = launch_and_attach(context) {
                record_fatal(&self.shared, err);
                launch_failed = true;
            }
        }

        let _ = done_rx.recv();

        let mut state = self.shared.state();
        match state.fatal.take() {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }
}

fn lock_unit(unit: &Arc<Mutex<DeviceUnit>>) -> MutexGuard<'_, DeviceUnit> {
    match unit.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn fire_latch(state: &mut RunState) {
    if let Some(done) = state.done.take() {
        let _ = done.send(());
    }
}

fn retire_device(state: &mut RunState) {
    state.running = state.running.saturating_sub(1);
    if state.running == 0 {
        fire_latch(state);
    }
}

/// Record a fatal error, request quit and retire the reporting device.
fn record_fatal(shared: &Shared, err: ComputeError) {
    let mut state = shared.state();
    if state.fatal.is_none() {
        state.fatal = Some(err);
    }
    state.quit = true;
    retire_device(&mut state);
}

/// Launch one round and attach its completion continuation.
fn launch_and_attach(context: RoundContext) -> ComputeResult<()> {
    let mut unit = lock_unit(&context.unit);
    unit.launch_round(context.size, context.worksize_max)?;
    let continuation = context.clone();
    unit.read_results(Box::new(move |completion| {
        on_round_complete(continuation, completion);
    }))
}

/// The sole re-entrant hot path: invoked by the compute runtime on one of
/// its worker threads, once per round per device. Bounded local work only;
/// never blocks on device progress.
fn on_round_complete(context: RoundContext, completion: Completion) {
    let slots = match completion {
        Completion::Complete(slots) => slots,
        Completion::Failed { status } => {
            let device = lock_unit(&context.unit).index();
            record_fatal(&context.shared, ComputeError::CallbackStatus { device, status });
            return;
        }
    };

    let device;
    let harvested = {
        let mut unit = lock_unit(&context.unit);
        device = unit.index();
        match unit.harvest(&slots) {
            Ok(hit) => hit,
            Err(err) => {
                drop(unit);
                record_fatal(&context.shared, err);
                return;
            }
        }
    };

    if let Some((score, slot)) = harvested {
        promote(&context.shared, score, &slot, device);
    }

    // Telemetry outside the coordinator mutex so unrelated devices never
    // serialize on it.
    context.shared.speed.record(context.size, device);

    {
        let mut state = context.shared.state();
        if state.quit {
            retire_device(&mut state);
            return;
        }
    }

    let next = {
        let mut unit = lock_unit(&context.unit);
        unit.begin_round()
            .and_then(|()| unit.launch_round(context.size, context.worksize_max))
            .and_then(|()| {
                let continuation = context.clone();
                unit.read_results(Box::new(move |completion| {
                    on_round_complete(continuation, completion);
                }))
            })
    };
    if let Err(err) = next {
        record_fatal(&context.shared, err);
    }
}

/// Double-checked promotion past the global watermark. Only a strictly
/// greater score updates and reports; ties are dropped so concurrent devices
/// never print the same score twice.
fn promote(shared: &Shared, score: u8, slot: &ResultSlot, device: usize) {
    let mut state = shared.state();
    if score <= state.best_score && state.best.is_some() {
        return;
    }
    state.best_score = score;
    let found = FoundResult {
        score,
        salt: slot.salt,
        address: slot.hash,
        device,
    };
    state.best = Some(found.clone());
    let seconds = state.started_at.elapsed().as_secs();
    // Printing under the mutex keeps result lines whole under concurrency.
    println!(
        "{CLEAR_LINE}  Time: {seconds:>5}s Score: {score:>2} Salt: 0x{} Address: 0x{}",
        encode_hex(&found.salt),
        encode_hex(&found.address),
    );
    drop(state);

    let sink = match shared.event_sink.read() {
        Ok(slot) => slot.clone(),
        Err(_) => None,
    };
    if let Some(sink) = sink {
        let _ = sink.send(DispatchEvent::Result(found));
    }
}

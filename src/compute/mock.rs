//! Scripted in-memory driver for dispatch tests. Records every call and lets
//! the test thread deliver completions deterministically.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::mode::Mode;
use crate::types::{ResultSlot, SCORE_SLOTS};

use super::{Completion, CompletionFn, ComputeError, ComputeResult, KernelDriver, RunSetup};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LaunchRecord {
    pub device: usize,
    pub offset: u64,
    pub count: u64,
    pub local: Option<u64>,
}

#[derive(Default)]
pub(crate) struct MockState {
    pub prepares: Vec<usize>,
    pub launches: Vec<LaunchRecord>,
    pub skip_scores: Vec<(usize, u8)>,
    pub rounds: Vec<(usize, u32)>,
    pub flushes: Vec<usize>,
    pub reads: Vec<usize>,
    /// While positive for a device, every enqueue is rejected with a
    /// work-group-size error (regardless of the hint, so tests can force the
    /// post-fallback rejection too).
    pub workgroup_rejections: HashMap<usize, u32>,
    pending: Vec<(usize, CompletionFn)>,
}

#[derive(Clone, Default)]
pub(crate) struct MockRuntime {
    state: Arc<Mutex<MockState>>,
}

impl MockRuntime {
    pub fn driver(&self, device: usize) -> Box<MockDriver> {
        Box::new(MockDriver {
            device,
            runtime: self.clone(),
        })
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().expect("mock state lock")
    }

    pub fn reject_workgroup_size(&self, device: usize, times: u32) {
        self.state().workgroup_rejections.insert(device, times);
    }

    pub fn pending_count(&self) -> usize {
        self.state().pending.len()
    }

    /// Block until `count` read-backs are outstanding.
    pub fn wait_pending(&self, count: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while self.pending_count() < count {
            assert!(
                Instant::now() < deadline,
                "timed out waiting for {count} pending completions"
            );
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Deliver a successful completion for `device`'s oldest outstanding
    /// read-back. The callback runs on the calling thread, outside the mock
    /// lock, so it may re-enter the driver.
    pub fn complete(&self, device: usize, slots: Vec<ResultSlot>) {
        let callback = self.take_pending(device);
        callback(Completion::Complete(slots));
    }

    pub fn complete_failed(&self, device: usize, status: i32) {
        let callback = self.take_pending(device);
        callback(Completion::Failed { status });
    }

    fn take_pending(&self, device: usize) -> CompletionFn {
        let mut state = self.state();
        let position = state
            .pending
            .iter()
            .position(|(pending_device, _)| *pending_device == device)
            .unwrap_or_else(|| panic!("no pending completion for device {device}"));
        state.pending.remove(position).1
    }
}

pub(crate) struct MockDriver {
    device: usize,
    runtime: MockRuntime,
}

impl KernelDriver for MockDriver {
    fn prepare(&mut self, _mode: &Mode, _setup: &RunSetup) -> ComputeResult<()> {
        self.runtime.state().prepares.push(self.device);
        Ok(())
    }

    fn set_skip_score(&mut self, score: u8) -> ComputeResult<()> {
        self.runtime.state().skip_scores.push((self.device, score));
        Ok(())
    }

    fn set_round(&mut self, round: u32) -> ComputeResult<()> {
        self.runtime.state().rounds.push((self.device, round));
        Ok(())
    }

    fn enqueue_iterate(
        &mut self,
        offset: u64,
        count: u64,
        local: Option<u64>,
    ) -> ComputeResult<()> {
        let mut state = self.runtime.state();
        if let Some(remaining) = state.workgroup_rejections.get_mut(&self.device) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(ComputeError::WorkGroupSize {
                    device: self.device,
                    status: -54,
                });
            }
        }
        state.launches.push(LaunchRecord {
            device: self.device,
            offset,
            count,
            local,
        });
        Ok(())
    }

    fn flush(&mut self) -> ComputeResult<()> {
        self.runtime.state().flushes.push(self.device);
        Ok(())
    }

    fn read_results_async(&mut self, on_complete: CompletionFn) -> ComputeResult<()> {
        let mut state = self.runtime.state();
        state.reads.push(self.device);
        state.pending.push((self.device, on_complete));
        Ok(())
    }
}

pub(crate) fn empty_slots() -> Vec<ResultSlot> {
    vec![ResultSlot::default(); SCORE_SLOTS]
}

pub(crate) fn slots_with(found: &[(usize, [u8; 32], [u8; 20])]) -> Vec<ResultSlot> {
    let mut slots = empty_slots();
    for (score, salt, hash) in found {
        slots[*score] = ResultSlot {
            salt: *salt,
            hash: *hash,
            found: 1,
        };
    }
    slots
}

use crate::compute::{CompletionFn, ComputeError, ComputeResult, KernelDriver, RunSetup};
use crate::mode::Mode;
use crate::speed::CLEAR_LINE;
use crate::types::{ResultSlot, MAX_SCORE};

/// One compute device's scheduling unit: its driver handle, launch hints and
/// the local best-score watermark.
pub struct DeviceUnit {
    driver: Box<dyn KernelDriver>,
    index: usize,
    worksize_local: Option<u64>,
    best_score: u8,
    round: u32,
}

impl DeviceUnit {
    pub fn new(driver: Box<dyn KernelDriver>, index: usize, worksize_local: Option<u64>) -> Self {
        Self {
            driver,
            index,
            worksize_local,
            best_score: 0,
            round: 0,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn best_score(&self) -> u8 {
        self.best_score
    }

    pub fn round(&self) -> u32 {
        self.round
    }

    #[cfg(test)]
    pub(crate) fn worksize_local(&self) -> Option<u64> {
        self.worksize_local
    }

    /// Reset per-run state and run the device-side initialization
    /// synchronously: result slots zeroed, mode and seeding inputs uploaded,
    /// kernel arguments bound.
    pub fn prepare(&mut self, mode: &Mode, setup: &RunSetup) -> ComputeResult<()> {
        self.best_score = 0;
        self.round = 0;
        self.driver.prepare(mode, setup)?;
        self.driver.set_skip_score(0)?;
        self.driver.set_round(0)
    }

    /// Enqueue one round's worth of work, chunked so no single launch exceeds
    /// `worksize_max`. Synchronization happens on the round's read-back, not
    /// on individual chunks.
    pub fn launch_round(&mut self, worksize_global: u64, worksize_max: u64) -> ComputeResult<()> {
        let chunk_max = worksize_max.max(1);
        let mut remaining = worksize_global;
        let mut offset = 0u64;
        while remaining > 0 {
            let count = remaining.min(chunk_max);
            self.enqueue_chunk(offset, count)?;
            remaining -= count;
            offset += count;
        }
        self.driver.flush()
    }

    /// Single chunk enqueue with the one-shot local-size fallback: a
    /// work-group-size rejection while a hint is set abandons the hint for
    /// the rest of the run and retries once relaxed. A rejection with no hint
    /// left propagates as fatal.
    fn enqueue_chunk(&mut self, offset: u64, count: u64) -> ComputeResult<()> {
        match self.driver.enqueue_iterate(offset, count, self.worksize_local) {
            Err(ComputeError::WorkGroupSize { .. }) if self.worksize_local.is_some() => {
                eprintln!("{CLEAR_LINE}warning: local work size abandoned on GPU{}", self.index);
                self.worksize_local = None;
                self.driver.enqueue_iterate(offset, count, None)
            }
            other => other,
        }
    }

    /// Advance the round counter and re-arm it as a kernel argument.
    pub fn begin_round(&mut self) -> ComputeResult<()> {
        self.round = self.round.wrapping_add(1);
        self.driver.set_round(self.round)
    }

    /// Scan the mirrored slots from `MAX_SCORE` down to (but not including)
    /// the local watermark. The first slot with a raised found flag is the
    /// new watermark; the skip-score argument is re-armed and the slot
    /// returned for global arbitration. At most one advance per round: the
    /// scan stops at the first hit from the top.
    pub fn harvest(&mut self, slots: &[ResultSlot]) -> ComputeResult<Option<(u8, ResultSlot)>> {
        let floor = self.best_score as usize;
        for score in ((floor + 1)..=(MAX_SCORE as usize)).rev() {
            let Some(slot) = slots.get(score).copied() else {
                continue;
            };
            if slot.found > 0 {
                self.best_score = score as u8;
                self.driver.set_skip_score(self.best_score)?;
                return Ok(Some((self.best_score, slot)));
            }
        }
        Ok(None)
    }

    pub fn read_results(&mut self, on_complete: CompletionFn) -> ComputeResult<()> {
        self.driver.read_results_async(on_complete)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::mock::{slots_with, LaunchRecord, MockRuntime};

    fn unit(runtime: &MockRuntime, device: usize, local: Option<u64>) -> DeviceUnit {
        DeviceUnit::new(runtime.driver(device), device, local)
    }

    fn setup() -> RunSetup {
        RunSetup {
            address: [0u8; 20],
            init_code_digest: [0u8; 32],
            seed: [1, 2, 3, 4],
            size: 1024,
        }
    }

    #[test]
    fn launch_round_chunks_at_worksize_max() {
        let runtime = MockRuntime::default();
        let mut unit = unit(&runtime, 0, Some(64));

        unit.launch_round(3 * 1000 + 1, 1000).expect("launch");

        let state = runtime.state();
        let expected: Vec<LaunchRecord> = [(0u64, 1000u64), (1000, 1000), (2000, 1000), (3000, 1)]
            .iter()
            .map(|&(offset, count)| LaunchRecord {
                device: 0,
                offset,
                count,
                local: Some(64),
            })
            .collect();
        assert_eq!(state.launches, expected);
        assert_eq!(state.flushes, vec![0]);
    }

    #[test]
    fn launch_round_without_remainder() {
        let runtime = MockRuntime::default();
        let mut unit = unit(&runtime, 0, None);

        unit.launch_round(2048, 1024).expect("launch");

        let state = runtime.state();
        assert_eq!(state.launches.len(), 2);
        assert_eq!(state.launches[1].offset, 1024);
        assert_eq!(state.launches[1].count, 1024);
    }

    #[test]
    fn workgroup_rejection_abandons_hint_and_retries() {
        let runtime = MockRuntime::default();
        runtime.reject_workgroup_size(0, 1);
        let mut unit = unit(&runtime, 0, Some(128));

        unit.launch_round(500, 1000).expect("fallback recovers");

        assert_eq!(unit.worksize_local(), None);
        let state = runtime.state();
        assert_eq!(state.launches.len(), 1);
        assert_eq!(state.launches[0].local, None);
    }

    #[test]
    fn second_workgroup_rejection_is_fatal() {
        let runtime = MockRuntime::default();
        runtime.reject_workgroup_size(0, 2);
        let mut unit = unit(&runtime, 0, Some(128));

        let err = unit.launch_round(500, 1000).expect_err("fatal after fallback");
        assert!(matches!(err, ComputeError::WorkGroupSize { device: 0, .. }));
        assert!(runtime.state().launches.is_empty());
    }

    #[test]
    fn rejection_without_hint_is_fatal() {
        let runtime = MockRuntime::default();
        runtime.reject_workgroup_size(0, 1);
        let mut unit = unit(&runtime, 0, None);

        let err = unit.launch_round(500, 1000).expect_err("no hint to abandon");
        assert!(matches!(err, ComputeError::WorkGroupSize { device: 0, .. }));
    }

    #[test]
    fn harvest_takes_first_hit_from_the_top() {
        let runtime = MockRuntime::default();
        let mut unit = unit(&runtime, 0, None);
        unit.prepare(&Mode::benchmark(), &setup()).expect("prepare");

        let slots = slots_with(&[(3, [0xaa; 32], [0xbb; 20]), (9, [0xcc; 32], [0xdd; 20])]);
        let hit = unit.harvest(&slots).expect("harvest").expect("found slot");

        assert_eq!(hit.0, 9);
        assert_eq!(hit.1.salt, [0xcc; 32]);
        assert_eq!(unit.best_score(), 9);
        // skip-score re-armed: 0 at prepare, then 9.
        assert_eq!(runtime.state().skip_scores, vec![(0, 0), (0, 9)]);
    }

    #[test]
    fn harvest_never_regresses_the_watermark() {
        let runtime = MockRuntime::default();
        let mut unit = unit(&runtime, 0, None);
        unit.prepare(&Mode::benchmark(), &setup()).expect("prepare");

        let first = slots_with(&[(9, [1; 32], [1; 20])]);
        assert!(unit.harvest(&first).expect("harvest").is_some());

        // Same score again, plus lower hits: no advance.
        let repeat = slots_with(&[(9, [2; 32], [2; 20]), (4, [3; 32], [3; 20])]);
        assert!(unit.harvest(&repeat).expect("harvest").is_none());
        assert_eq!(unit.best_score(), 9);

        // Strictly higher hit advances once more.
        let better = slots_with(&[(12, [4; 32], [4; 20]), (11, [5; 32], [5; 20])]);
        let hit = unit.harvest(&better).expect("harvest").expect("found slot");
        assert_eq!(hit.0, 12);
        assert_eq!(unit.best_score(), 12);
    }

    #[test]
    fn prepare_resets_per_run_state() {
        let runtime = MockRuntime::default();
        let mut unit = unit(&runtime, 2, None);
        unit.prepare(&Mode::benchmark(), &setup()).expect("prepare");

        let slots = slots_with(&[(7, [0; 32], [0; 20])]);
        unit.harvest(&slots).expect("harvest");
        unit.begin_round().expect("round");
        assert_eq!(unit.best_score(), 7);
        assert_eq!(unit.round(), 1);

        unit.prepare(&Mode::benchmark(), &setup()).expect("prepare");
        assert_eq!(unit.best_score(), 0);
        assert_eq!(unit.round(), 0);

        let state = runtime.state();
        assert_eq!(state.prepares, vec![2, 2]);
        assert_eq!(state.rounds, vec![(2, 0), (2, 1), (2, 0)]);
    }
}

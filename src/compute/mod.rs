use thiserror::Error;

use crate::mode::Mode;
use crate::types::ResultSlot;

#[cfg(test)]
pub(crate) mod mock;
#[cfg(feature = "opencl")]
pub mod opencl;

/// Failures crossing the compute-runtime boundary.
///
/// Work-group-size rejections are the only recoverable case: the device unit
/// abandons its local-size hint once per run and retries. Everything else
/// aborts the run with the underlying status code attached.
#[derive(Debug, Error)]
pub enum ComputeError {
    #[error("device {device}: {call} failed (status {status})")]
    Transport {
        device: usize,
        call: &'static str,
        status: i32,
    },
    #[error("device {device}: local work size rejected (status {status})")]
    WorkGroupSize { device: usize, status: i32 },
    #[error("device {device}: completion reported status {status}")]
    CallbackStatus { device: usize, status: i32 },
}

pub type ComputeResult<T> = Result<T, ComputeError>;

/// Per-run, per-device seeding inputs for the init kernel.
#[derive(Debug, Clone)]
pub struct RunSetup {
    pub address: [u8; 20],
    pub init_code_digest: [u8; 32],
    pub seed: [u64; 4],
    pub size: u32,
}

/// Outcome of one round's asynchronous result read-back. The mirrored slots
/// are owned by the completion; nothing aliases device memory across the
/// callback boundary.
pub enum Completion {
    Complete(Vec<ResultSlot>),
    Failed { status: i32 },
}

pub type CompletionFn = Box<dyn FnOnce(Completion) + Send + 'static>;

/// One compute device's queue, kernels and device-resident buffers.
///
/// The dispatch core treats this purely as typed remote storage plus two
/// kernel entry points; transport details never leak past it. Completions are
/// delivered on the runtime's own worker threads, never on the caller's.
pub trait KernelDriver: Send {
    /// Upload the mode descriptor and seeding inputs, zero the result slots
    /// on the device and run the init kernel once, synchronously.
    fn prepare(&mut self, mode: &Mode, setup: &RunSetup) -> ComputeResult<()>;

    /// Re-arm the "skip scores at or below" kernel argument.
    fn set_skip_score(&mut self, score: u8) -> ComputeResult<()>;

    /// Re-arm the round counter kernel argument.
    fn set_round(&mut self, round: u32) -> ComputeResult<()>;

    /// Fire-and-forget enqueue of one iterate chunk.
    fn enqueue_iterate(&mut self, offset: u64, count: u64, local: Option<u64>)
        -> ComputeResult<()>;

    fn flush(&mut self) -> ComputeResult<()>;

    /// Enqueue the asynchronous read-back of the result slots and hand the
    /// completion to the runtime. Invoked exactly once per call, on an
    /// arbitrary worker thread.
    fn read_results_async(&mut self, on_complete: CompletionFn) -> ComputeResult<()>;
}

/// Preprocessor expression baking the sponge state for the fixed part of the
/// CREATE2 preimage (0xff ++ address ++ salt placeholder ++ init-code digest)
/// into the program build, as 25 little-endian u64 words. The salt bytes are
/// randomized per build; the kernel overwrites them anyway.
pub fn init_hash_expression(address: &[u8; 20], init_code_digest: &[u8; 32]) -> String {
    let mut state = [0u8; 200];
    state[0] = 0xff;
    state[1..21].copy_from_slice(address);
    let salt_filler: [u8; 32] = rand::random();
    state[21..53].copy_from_slice(&salt_filler);
    state[53..85].copy_from_slice(init_code_digest);
    state[85] ^= 0x01;

    let words: Vec<String> = state
        .chunks_exact(8)
        .map(|chunk| {
            let word = u64::from_le_bytes(chunk.try_into().expect("8-byte chunk"));
            format!("{word:#x}")
        })
        .collect();
    words.join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_hash_expression_has_25_words() {
        let address = [0x11u8; 20];
        let digest = [0x22u8; 32];
        let expr = init_hash_expression(&address, &digest);

        let words: Vec<&str> = expr.split(',').collect();
        assert_eq!(words.len(), 25);
        for word in &words {
            assert!(word.starts_with("0x"), "word {word} missing 0x prefix");
        }

        // Word 0 starts with the 0xff marker and the first address bytes.
        let first = u64::from_str_radix(words[0].trim_start_matches("0x"), 16).unwrap();
        assert_eq!(first.to_le_bytes()[0], 0xff);
        assert_eq!(first.to_le_bytes()[1], 0x11);
    }

    #[test]
    fn init_hash_expression_domain_separator_is_flipped() {
        let expr = init_hash_expression(&[0u8; 20], &[0u8; 32]);
        let words: Vec<&str> = expr.split(',').collect();
        // Byte 85 lives in word 10 (bytes 80..88), lane byte 5.
        let word10 = u64::from_str_radix(words[10].trim_start_matches("0x"), 16).unwrap();
        assert_eq!(word10.to_le_bytes()[5] & 0x01, 0x01);
    }
}

//! Model executor seam
//!
//! The numerical forward computation and weight loading live behind
//! [`ModelExecutor`]: an opaque capability invoked synchronously by the
//! driver. The executor reads the contract's input descriptors and writes
//! into output descriptors it does not own; any concurrency inside it
//! (worker pools, device command queues) is invisible here, and the call
//! does not return until results are host-visible.
//!
//! [`MockExecutor`] is a deterministic stand-in used by tests and the demo
//! binary: it echoes prompt tokens and continues each beam with a
//! rank-independent arithmetic sequence, so every rank produces identical
//! output buffers.

use crate::contract::TensorContract;
use crate::error::{RepartirError, Result};

/// Synchronous forward-pass capability
///
/// Errors are fatal to the whole distributed run; the driver never retries
/// a call, because retrying a partially executed multi-rank collective
/// risks divergent rank state.
pub trait ModelExecutor {
    /// Run one forward pass over the contract
    ///
    /// # Errors
    ///
    /// Returns `ExecutorFailure` on a device or numerical error.
    fn forward(&mut self, contract: &mut TensorContract) -> Result<()>;
}

/// Deterministic executor for tests and wiring validation
#[derive(Debug, Clone)]
pub struct MockExecutor {
    vocab_size: usize,
}

impl MockExecutor {
    /// Create a mock bounded to the model's vocabulary
    #[must_use]
    pub fn new(vocab_size: usize) -> Self {
        Self { vocab_size }
    }

    fn generated_token(&self, batch: usize, beam: usize, step: usize) -> i32 {
        ((1 + batch * 31 + beam * 7 + step) % self.vocab_size) as i32
    }
}

impl ModelExecutor for MockExecutor {
    fn forward(&mut self, contract: &mut TensorContract) -> Result<()> {
        if self.vocab_size == 0 {
            return Err(RepartirError::ExecutorFailure {
                reason: "vocab_size must be positive".to_string(),
            });
        }
        let batch = contract.batch_size();
        let beam = contract.beam_width();
        let total = contract.total_output_len();
        let max_input_len = contract.input_ids.shape()[1];

        let input_ids = contract
            .input_ids
            .as_i32()
            .map(<[i32]>::to_vec)
            .unwrap_or_default();
        let input_lengths = contract
            .input_lengths
            .as_i32()
            .map(<[i32]>::to_vec)
            .unwrap_or_default();

        let out = contract
            .output_ids
            .as_i32_mut()
            .ok_or_else(|| RepartirError::ExecutorFailure {
                reason: "output_ids holds non-integer data".to_string(),
            })?;
        for b in 0..batch {
            for w in 0..beam {
                let row = b * beam + w;
                let prompt_len = input_lengths.get(row).copied().unwrap_or(0) as usize;
                let base = row * total;
                for t in 0..total {
                    out[base + t] = if t < prompt_len {
                        input_ids[row * max_input_len + t]
                    } else {
                        self.generated_token(b, w, t)
                    };
                }
            }
        }

        if let Some(parents) = contract.parent_ids.as_i32_mut() {
            for t in 0..total {
                for b in 0..batch {
                    for w in 0..beam {
                        parents[t * batch * beam + b * beam + w] = w as i32;
                    }
                }
            }
        }
        if let Some(lengths) = contract.sequence_lengths.as_i32_mut() {
            lengths.fill(total as i32);
        }
        if let Some(desc) = contract.output_log_probs.as_mut() {
            if let Some(probs) = desc.as_f32_mut() {
                probs.fill(-0.5);
            }
        }
        Ok(())
    }
}

//! Request/response tensor contract for one inference call
//!
//! Builds the shaped input/output descriptor set (including beam-search
//! bookkeeping buffers) that frames a distributed forward pass. All shapes
//! follow `(batch, beam, length)` ordering conventions. Buffers are
//! allocated once, sized exactly to the worst case, and never resized
//! mid-call: growth would require a reallocation protocol synchronized
//! across all ranks, so an oversized request fails fast instead.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{RepartirError, Result};
use crate::tensor::{Storage, TensorDescriptor};
use crate::topology::ModelShape;

/// Immutable per-call request bundle
///
/// `input_ids` is a flat `(batch * beam, max_input_len)` row-major buffer;
/// `input_lengths` holds one entry per `(batch, beam)` row. An empty
/// request (`max_input_len == 0`) selects unconditional generation.
///
/// # Examples
///
/// ```
/// use repartir::contract::InferenceRequest;
///
/// let request = InferenceRequest::new(2, 1, 16)
///     .with_inputs(vec![5, 6, 7, 8, 9, 10], vec![3, 3], 3)
///     .unwrap();
/// assert_eq!(request.total_output_len(), 19);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InferenceRequest {
    /// Number of independent sequences in the batch
    pub batch_size: usize,
    /// Parallel candidate sequences tracked per batch element
    pub beam_width: usize,
    /// Longest input prompt, in tokens; zero for unconditional generation
    pub max_input_len: usize,
    /// Number of tokens the model should generate
    pub request_output_len: usize,
    /// Flat `(batch * beam, max_input_len)` prompt token ids
    pub input_ids: Vec<i32>,
    /// Per-`(batch, beam)` prompt lengths
    pub input_lengths: Vec<i32>,
    /// Whether to allocate the output log-probability buffer
    pub return_log_probs: bool,
}

impl InferenceRequest {
    /// Create an unconditional-generation request with no input tokens
    #[must_use]
    pub fn new(batch_size: usize, beam_width: usize, request_output_len: usize) -> Self {
        Self {
            batch_size,
            beam_width,
            max_input_len: 0,
            request_output_len,
            input_ids: Vec::new(),
            input_lengths: Vec::new(),
            return_log_probs: false,
        }
    }

    /// Attach prompt tokens to the request
    ///
    /// # Errors
    ///
    /// Returns `InvalidShape` if the buffers do not match
    /// `(batch * beam, max_input_len)` or any length exceeds `max_input_len`.
    pub fn with_inputs(
        mut self,
        input_ids: Vec<i32>,
        input_lengths: Vec<i32>,
        max_input_len: usize,
    ) -> Result<Self> {
        let rows = self.batch_size * self.beam_width;
        if input_ids.len() != rows * max_input_len {
            return Err(RepartirError::InvalidShape {
                reason: format!(
                    "input_ids length ({}) does not match batch_size ({}) * beam_width ({}) \
                     * max_input_len ({})",
                    input_ids.len(),
                    self.batch_size,
                    self.beam_width,
                    max_input_len
                ),
            });
        }
        if input_lengths.len() != rows {
            return Err(RepartirError::InvalidShape {
                reason: format!(
                    "input_lengths length ({}) does not match batch_size ({}) * beam_width ({})",
                    input_lengths.len(),
                    self.batch_size,
                    self.beam_width
                ),
            });
        }
        if let Some(bad) = input_lengths
            .iter()
            .find(|&&len| len < 0 || len as usize > max_input_len)
        {
            return Err(RepartirError::InvalidShape {
                reason: format!("input length ({bad}) exceeds max_input_len ({max_input_len})"),
            });
        }
        self.input_ids = input_ids;
        self.input_lengths = input_lengths;
        self.max_input_len = max_input_len;
        Ok(self)
    }

    /// Request the optional output log-probability buffer
    #[must_use]
    pub fn with_log_probs(mut self, enabled: bool) -> Self {
        self.return_log_probs = enabled;
        self
    }

    /// Total sequence length written per beam, input plus generated
    #[must_use]
    pub fn total_output_len(&self) -> usize {
        self.max_input_len + self.request_output_len
    }
}

/// Read prompt token ids from a comma-separated csv file
///
/// One line per batch element. Every line is right-padded with `pad_id` to
/// the longest line, then tiled `beam_width` times, matching the flat
/// `(batch * beam, max_input_len)` request layout. Returns
/// `(input_ids, input_lengths, max_input_len)`.
///
/// # Errors
///
/// Returns `IoError` if the file cannot be read, `InvalidShape` if a token
/// fails to parse, or `InvalidConfiguration` if the file holds fewer lines
/// than `batch_size`.
pub fn read_start_ids(
    path: &Path,
    batch_size: usize,
    beam_width: usize,
    pad_id: i32,
) -> Result<(Vec<i32>, Vec<i32>, usize)> {
    let text = fs::read_to_string(path)?;
    let mut rows: Vec<Vec<i32>> = Vec::with_capacity(batch_size);
    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let mut row = Vec::new();
        for field in trimmed.split(',') {
            let field = field.trim();
            if field.is_empty() {
                continue;
            }
            let token = field
                .parse::<i32>()
                .map_err(|e| RepartirError::InvalidShape {
                    reason: format!("bad token id {field:?} in {}: {e}", path.display()),
                })?;
            row.push(token);
        }
        rows.push(row);
        if rows.len() == batch_size {
            break;
        }
    }
    if rows.len() < batch_size {
        return Err(RepartirError::InvalidConfiguration {
            reason: format!(
                "{} holds {} sequences but batch_size is {batch_size}",
                path.display(),
                rows.len()
            ),
        });
    }

    let max_input_len = rows.iter().map(Vec::len).max().unwrap_or(0);
    let mut input_ids = Vec::with_capacity(batch_size * beam_width * max_input_len);
    let mut input_lengths = Vec::with_capacity(batch_size * beam_width);
    for row in &rows {
        for _ in 0..beam_width {
            input_ids.extend_from_slice(row);
            input_ids.extend(std::iter::repeat(pad_id).take(max_input_len - row.len()));
            input_lengths.push(row.len() as i32);
        }
    }
    Ok((input_ids, input_lengths, max_input_len))
}

/// The full descriptor set framing one forward call
///
/// Input descriptors are read-only for the executor; output descriptors are
/// written by the executor but owned by the driver. Shapes (outer first):
///
/// | descriptor          | shape                              | storage | dtype |
/// |---------------------|------------------------------------|---------|-------|
/// | `input_ids`         | `(batch*beam, max_input_len)`      | device  | I32   |
/// | `input_lengths`     | `(batch*beam)`                     | device  | I32   |
/// | `total_output_len`  | `(1)`                              | host    | I32   |
/// | `output_ids`        | `(batch, beam, total_output_len)`  | device  | I32   |
/// | `parent_ids`        | `(total_output_len, batch, beam)`  | device  | I32   |
/// | `sequence_lengths`  | `(batch, beam)`                    | device  | I32   |
/// | `output_log_probs`  | `(request_output_len, batch, beam)`| device  | F32   |
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorContract {
    /// Prompt token ids, `(batch * beam, max_input_len)`
    pub input_ids: TensorDescriptor,
    /// Prompt lengths, `(batch * beam)`
    pub input_lengths: TensorDescriptor,
    /// Host scalar wrapped as a 1-element tensor
    pub total_output_len: TensorDescriptor,
    /// Generated ids, `(batch, beam, total_output_len)`
    pub output_ids: TensorDescriptor,
    /// Beam-search parent indices, `(total_output_len, batch, beam)`
    pub parent_ids: TensorDescriptor,
    /// Final sequence lengths, `(batch, beam)`
    pub sequence_lengths: TensorDescriptor,
    /// Per-step log probabilities, `(request_output_len, batch, beam)`
    pub output_log_probs: Option<TensorDescriptor>,
}

impl TensorContract {
    /// Build the descriptor set for a request against a model shape
    ///
    /// Idempotent: an identical request yields descriptors with identical
    /// shapes. A zero `max_input_len` produces sentinel empty input
    /// descriptors and a fully valid output set.
    ///
    /// # Errors
    ///
    /// Returns `InvalidShape` when `max_input_len + request_output_len`
    /// exceeds `max_seq_len`, or if the request buffers are inconsistent.
    pub fn build(request: &InferenceRequest, model: &ModelShape) -> Result<Self> {
        if request.batch_size == 0 || request.beam_width == 0 {
            return Err(RepartirError::InvalidShape {
                reason: format!(
                    "batch_size ({}) and beam_width ({}) must be positive",
                    request.batch_size, request.beam_width
                ),
            });
        }
        let total_output_len = request.total_output_len();
        if total_output_len > model.max_seq_len {
            return Err(RepartirError::InvalidShape {
                reason: format!(
                    "total_output_len ({total_output_len}) should be <= max_seq_len ({})",
                    model.max_seq_len
                ),
            });
        }

        let batch = request.batch_size;
        let beam = request.beam_width;
        let rows = batch * beam;

        let input_ids = TensorDescriptor::from_i32(
            Storage::Device,
            vec![rows, request.max_input_len],
            request.input_ids.clone(),
        )?;
        let input_lengths = if request.max_input_len == 0 {
            // Sentinel: zero prompt lengths for every row
            TensorDescriptor::from_i32(Storage::Device, vec![rows], vec![0; rows])?
        } else {
            TensorDescriptor::from_i32(
                Storage::Device,
                vec![rows],
                request.input_lengths.clone(),
            )?
        };
        let total = TensorDescriptor::from_i32(
            Storage::Host,
            vec![1],
            vec![total_output_len as i32],
        )?;
        let output_ids =
            TensorDescriptor::zeros_i32(Storage::Device, vec![batch, beam, total_output_len])?;
        let parent_ids =
            TensorDescriptor::zeros_i32(Storage::Device, vec![total_output_len, batch, beam])?;
        let sequence_lengths = TensorDescriptor::zeros_i32(Storage::Device, vec![batch, beam])?;
        let output_log_probs = if request.return_log_probs {
            Some(TensorDescriptor::zeros_f32(
                Storage::Device,
                vec![request.request_output_len, batch, beam],
            )?)
        } else {
            None
        };

        Ok(Self {
            input_ids,
            input_lengths,
            total_output_len: total,
            output_ids,
            parent_ids,
            sequence_lengths,
            output_log_probs,
        })
    }

    /// The scalar total output length carried in the host descriptor
    #[must_use]
    pub fn total_output_len(&self) -> usize {
        self.total_output_len
            .as_i32()
            .and_then(<[i32]>::first)
            .copied()
            .unwrap_or(0) as usize
    }

    /// Batch size, from the output ids shape
    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.output_ids.shape()[0]
    }

    /// Beam width, from the output ids shape
    #[must_use]
    pub fn beam_width(&self) -> usize {
        self.output_ids.shape()[1]
    }

    /// Extract the device-resident outputs as a host-side result
    ///
    /// # Errors
    ///
    /// Returns `InvalidShape` if any output descriptor holds the wrong dtype.
    pub fn into_result(self) -> Result<InferenceResult> {
        let output_log_probs = match &self.output_log_probs {
            Some(desc) => Some(desc.as_f32().map(<[f32]>::to_vec).ok_or_else(|| {
                RepartirError::InvalidShape {
                    reason: "output_log_probs holds non-float data".to_string(),
                }
            })?),
            None => None,
        };
        Ok(InferenceResult {
            batch_size: self.batch_size(),
            beam_width: self.beam_width(),
            total_output_len: self.total_output_len(),
            output_ids: self.output_ids.to_host_i32()?,
            parent_ids: self.parent_ids.to_host_i32()?,
            sequence_lengths: self.sequence_lengths.to_host_i32()?,
            output_log_probs,
        })
    }
}

/// Host-side copy of the executor outputs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceResult {
    /// Number of independent sequences
    pub batch_size: usize,
    /// Beams per sequence
    pub beam_width: usize,
    /// Tokens per `(batch, beam)` row
    pub total_output_len: usize,
    /// Flat `(batch, beam, total_output_len)` token ids
    pub output_ids: Vec<i32>,
    /// Flat `(total_output_len, batch, beam)` parent beam indices
    pub parent_ids: Vec<i32>,
    /// Flat `(batch, beam)` sequence lengths
    pub sequence_lengths: Vec<i32>,
    /// Flat `(request_output_len, batch, beam)` log probabilities
    pub output_log_probs: Option<Vec<f32>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn model() -> ModelShape {
        ModelShape {
            head_num: 16,
            size_per_head: 64,
            vocab_size: 50257,
            decoder_layers: 24,
            max_seq_len: 8,
        }
    }

    #[test]
    fn test_contract_shapes() {
        let request = InferenceRequest::new(1, 1, 3)
            .with_inputs(vec![10, 11, 12, 13, 14], vec![5], 5)
            .unwrap();
        let contract = TensorContract::build(&request, &model()).unwrap();
        assert_eq!(contract.input_ids.shape(), &[1, 5]);
        assert_eq!(contract.input_lengths.shape(), &[1]);
        assert_eq!(contract.total_output_len.shape(), &[1]);
        assert_eq!(contract.output_ids.shape(), &[1, 1, 8]);
        assert_eq!(contract.parent_ids.shape(), &[8, 1, 1]);
        assert_eq!(contract.sequence_lengths.shape(), &[1, 1]);
        assert!(contract.output_log_probs.is_none());
        assert_eq!(contract.total_output_len(), 8);
    }

    #[test]
    fn test_total_at_ceiling_succeeds() {
        // max_input_len + request_output_len == max_seq_len
        let request = InferenceRequest::new(1, 1, 3)
            .with_inputs(vec![1, 2, 3, 4, 5], vec![5], 5)
            .unwrap();
        assert!(TensorContract::build(&request, &model()).is_ok());
    }

    #[test]
    fn test_total_over_ceiling_fails() {
        // == max_seq_len + 1
        let request = InferenceRequest::new(1, 1, 4)
            .with_inputs(vec![1, 2, 3, 4, 5], vec![5], 5)
            .unwrap();
        let err = TensorContract::build(&request, &model()).unwrap_err();
        assert!(matches!(err, RepartirError::InvalidShape { .. }));
        assert!(err.to_string().contains("total_output_len (9)"));
    }

    #[test]
    fn test_unconditional_generation_contract() {
        let request = InferenceRequest::new(2, 2, 4);
        let contract = TensorContract::build(&request, &model()).unwrap();
        assert_eq!(contract.input_ids.shape(), &[4, 0]);
        assert_eq!(contract.input_ids.element_count(), 0);
        assert_eq!(contract.input_lengths.as_i32().unwrap(), &[0, 0, 0, 0]);
        assert_eq!(contract.output_ids.shape(), &[2, 2, 4]);
    }

    #[test]
    fn test_build_is_idempotent_on_shapes() {
        let request = InferenceRequest::new(2, 3, 2)
            .with_inputs(vec![7; 2 * 3 * 4], vec![4; 6], 4)
            .unwrap();
        let a = TensorContract::build(&request, &model()).unwrap();
        let b = TensorContract::build(&request, &model()).unwrap();
        assert_eq!(a.input_ids.shape(), b.input_ids.shape());
        assert_eq!(a.output_ids.shape(), b.output_ids.shape());
        assert_eq!(a.parent_ids.shape(), b.parent_ids.shape());
        assert_eq!(a.sequence_lengths.shape(), b.sequence_lengths.shape());
    }

    #[test]
    fn test_log_prob_buffer_allocation() {
        let request = InferenceRequest::new(1, 2, 3).with_log_probs(true);
        let contract = TensorContract::build(&request, &model()).unwrap();
        let probs = contract.output_log_probs.as_ref().unwrap();
        assert_eq!(probs.shape(), &[3, 1, 2]);
    }

    #[test]
    fn test_zero_batch_fails() {
        let request = InferenceRequest::new(0, 1, 3);
        assert!(TensorContract::build(&request, &model()).is_err());
    }

    #[test]
    fn test_request_input_validation() {
        // Wrong ids length
        assert!(InferenceRequest::new(1, 1, 3)
            .with_inputs(vec![1, 2], vec![3], 3)
            .is_err());
        // Wrong lengths length
        assert!(InferenceRequest::new(2, 1, 3)
            .with_inputs(vec![1, 2, 3, 4], vec![2], 2)
            .is_err());
        // Length exceeding max_input_len
        assert!(InferenceRequest::new(1, 1, 3)
            .with_inputs(vec![1, 2], vec![3], 2)
            .is_err());
    }

    #[test]
    fn test_into_result() {
        let request = InferenceRequest::new(1, 1, 3).with_log_probs(true);
        let mut contract = TensorContract::build(&request, &model()).unwrap();
        contract.output_ids.as_i32_mut().unwrap()[0] = 42;
        let result = contract.into_result().unwrap();
        assert_eq!(result.output_ids[0], 42);
        assert_eq!(result.output_ids.len(), 3);
        assert_eq!(result.total_output_len, 3);
        assert_eq!(result.output_log_probs.unwrap().len(), 3);
    }

    #[test]
    fn test_read_start_ids_padding_and_tiling() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "1, 2, 3").unwrap();
        writeln!(file, "4, 5").unwrap();
        file.flush().unwrap();

        let (ids, lengths, max_len) = read_start_ids(file.path(), 2, 2, 50256).unwrap();
        assert_eq!(max_len, 3);
        assert_eq!(lengths, vec![3, 3, 2, 2]);
        assert_eq!(
            ids,
            vec![1, 2, 3, 1, 2, 3, 4, 5, 50256, 4, 5, 50256]
        );
    }

    #[test]
    fn test_read_start_ids_too_few_lines() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "1,2").unwrap();
        file.flush().unwrap();

        let err = read_start_ids(file.path(), 3, 1, 0).unwrap_err();
        assert!(matches!(err, RepartirError::InvalidConfiguration { .. }));
    }

    #[test]
    fn test_read_start_ids_bad_token() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "1,x,3").unwrap();
        file.flush().unwrap();

        let err = read_start_ids(file.path(), 1, 1, 0).unwrap_err();
        assert!(matches!(err, RepartirError::InvalidShape { .. }));
    }

    #[test]
    fn test_read_start_ids_missing_file() {
        let err = read_start_ids(Path::new("/nonexistent/start_ids.csv"), 1, 1, 0).unwrap_err();
        assert!(matches!(err, RepartirError::IoError { .. }));
    }
}

//! CLI command implementations (extracted for testability)
//!
//! The binary parses arguments and delegates here; keeping the command
//! bodies in the library lets integration tests drive them directly.

use std::path::PathBuf;

use clap::Args;

use crate::contract::{read_start_ids, InferenceRequest};
use crate::driver::{run_local_world, RunReport};
use crate::error::Result;
use crate::executor::MockExecutor;
use crate::topology::{ModelShape, ProcessGrid};

/// Arguments for one coordinated inference run
///
/// Group-formation sizes, model shape, and request parameters. The world
/// size defaults to `tensor_para_size * pipeline_para_size` but may be
/// pinned explicitly to surface configuration mismatches.
#[derive(Debug, Clone, Args)]
pub struct RunArgs {
    /// Ranks sharding within a layer
    #[arg(long, default_value_t = 1)]
    pub tensor_para_size: usize,

    /// Ranks sharding across layers
    #[arg(long, default_value_t = 1)]
    pub pipeline_para_size: usize,

    /// Total rank count; must equal the product of the two parallel sizes
    #[arg(long)]
    pub world_size: Option<usize>,

    /// Independent sequences per request
    #[arg(long, default_value_t = 1)]
    pub batch_size: usize,

    /// Candidate sequences tracked per batch element
    #[arg(long, default_value_t = 1)]
    pub beam_width: usize,

    /// Tokens to generate per beam
    #[arg(long, default_value_t = 32)]
    pub request_output_len: usize,

    /// Comma-separated prompt token ids, one line per batch element;
    /// omitted means unconditional generation
    #[arg(long)]
    pub input_csv: Option<PathBuf>,

    /// Token id used to right-pad shorter prompts
    #[arg(long, default_value_t = 50256)]
    pub pad_id: i32,

    /// Where the root rank writes the token artifact
    #[arg(long, default_value = "out")]
    pub output: PathBuf,

    /// Number of attention heads
    #[arg(long, default_value_t = 16)]
    pub head_num: usize,

    /// Dimension of each attention head
    #[arg(long, default_value_t = 64)]
    pub size_per_head: usize,

    /// Vocabulary size
    #[arg(long, default_value_t = 50257)]
    pub vocab_size: usize,

    /// Number of decoder layers
    #[arg(long, default_value_t = 24)]
    pub decoder_layers: usize,

    /// Hard ceiling on input length + requested output length
    #[arg(long, default_value_t = 2048)]
    pub max_seq_len: usize,

    /// Print the run report as JSON instead of text
    #[arg(long)]
    pub json: bool,
}

impl RunArgs {
    /// Effective world size, explicit or derived from the grid
    #[must_use]
    pub fn effective_world_size(&self) -> usize {
        self.world_size
            .unwrap_or(self.tensor_para_size * self.pipeline_para_size)
    }
}

/// Execute a full run over a local fabric with the mock executor
///
/// The real model executor is an external collaborator; the binary
/// validates the distributed wiring end to end against the deterministic
/// mock.
///
/// # Errors
///
/// Propagates any configuration, shape, communication, executor, or I/O
/// error; all map to a non-zero process exit in the binary.
pub fn run_command(args: &RunArgs) -> Result<RunReport> {
    let grid = ProcessGrid::new(
        args.effective_world_size(),
        args.tensor_para_size,
        args.pipeline_para_size,
    )?;
    let model = ModelShape {
        head_num: args.head_num,
        size_per_head: args.size_per_head,
        vocab_size: args.vocab_size,
        decoder_layers: args.decoder_layers,
        max_seq_len: args.max_seq_len,
    };
    grid.validate_model(&model)?;

    let mut request = InferenceRequest::new(
        args.batch_size,
        args.beam_width,
        args.request_output_len,
    );
    if let Some(path) = &args.input_csv {
        let (input_ids, input_lengths, max_input_len) =
            read_start_ids(path, args.batch_size, args.beam_width, args.pad_id)?;
        request = request.with_inputs(input_ids, input_lengths, max_input_len)?;
    }

    tracing::info!(
        world_size = grid.world_size(),
        tensor_para_size = grid.tensor_para_size(),
        pipeline_para_size = grid.pipeline_para_size(),
        "starting coordinated run"
    );
    run_local_world(grid, model, &request, &args.output, |_| {
        MockExecutor::new(args.vocab_size)
    })
}

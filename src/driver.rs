//! Distributed inference driver
//!
//! Sequences one distributed forward pass: topology validation, collective
//! handle bootstrap, a discarded warm-up pass, a timed pass bracketed by
//! full-world barriers, and reporting on the rank holding grid coordinate
//! (0, 0). The state machine is strictly linear; no transition is retried,
//! and any executor failure is fatal to the whole run since subsequent
//! barriers would otherwise hang.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::comm::{init_groups, GroupComm, LocalFabric, RankEndpoint};
use crate::contract::{InferenceRequest, TensorContract};
use crate::error::{RepartirError, Result};
use crate::executor::ModelExecutor;
use crate::topology::{GridCoordinate, ModelShape, ProcessGrid};

/// Progress of one rank through the run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DriverState {
    /// Nothing validated yet
    Idle,
    /// Grid and model shape validated, coordinate derived
    TopologyReady,
    /// Both group handles held
    CommReady,
    /// Warm-up pass returned and the whole world has caught up
    WarmedUp,
    /// Timed pass complete, elapsed time captured
    Executed,
    /// Root rank has written the artifact (non-roots skip straight through)
    Reported,
    /// Communication handles released
    Done,
}

/// Everything one rank's driver owns for the duration of a run
///
/// Replaces process-wide globals with an explicit context: the fabric
/// endpoint, the grid, this rank's identity, and the output path. Torn
/// down when the driver reaches [`DriverState::Done`].
pub struct DriverContext {
    /// This rank's fabric endpoint
    pub endpoint: RankEndpoint,
    /// The validated 2D grid
    pub grid: ProcessGrid,
    /// This rank's world rank
    pub rank: usize,
    /// Where the root rank writes the token artifact
    pub output_path: PathBuf,
}

/// What the root rank observed, returned to the caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    /// Wall-clock milliseconds for the timed pass, barriers excluded
    pub elapsed_ms: f64,
    /// Token count written to the artifact,
    /// `total_output_len * batch * beam`
    pub tokens_written: usize,
    /// Zero-valued tokens in the output buffer (debugging heuristic, not a
    /// correctness check)
    pub zero_count: usize,
    /// At most the first ten output tokens
    pub preview: Vec<i32>,
}

/// Per-rank driver for one distributed inference invocation
pub struct InferenceDriver {
    ctx: DriverContext,
    state: DriverState,
    coordinate: Option<GridCoordinate>,
    tensor_group: Option<GroupComm>,
    pipeline_group: Option<GroupComm>,
}

impl InferenceDriver {
    /// Create an idle driver owning its context
    #[must_use]
    pub fn new(ctx: DriverContext) -> Self {
        Self {
            ctx,
            state: DriverState::Idle,
            coordinate: None,
            tensor_group: None,
            pipeline_group: None,
        }
    }

    /// Current state-machine position
    #[must_use]
    pub fn state(&self) -> DriverState {
        self.state
    }

    /// Grid coordinate, available once topology is ready
    #[must_use]
    pub fn coordinate(&self) -> Option<GridCoordinate> {
        self.coordinate
    }

    /// Tensor-group membership, held from handle bootstrap until shutdown
    #[must_use]
    pub fn tensor_group(&self) -> Option<&GroupComm> {
        self.tensor_group.as_ref()
    }

    /// Pipeline-group membership, held from handle bootstrap until shutdown
    #[must_use]
    pub fn pipeline_group(&self) -> Option<&GroupComm> {
        self.pipeline_group.as_ref()
    }

    /// Drive the full state machine for this rank
    ///
    /// Returns the run report on the rank holding grid coordinate (0, 0)
    /// and `None` on every other rank.
    ///
    /// # Errors
    ///
    /// `InvalidConfiguration` before any handle is created,
    /// `InvalidShape` before any output buffer is sized, `CommFailure` if
    /// a peer endpoint disconnects, `ExecutorFailure` or `IoError`
    /// afterwards. All are fatal; nothing is retried.
    pub fn run<E: ModelExecutor>(
        &mut self,
        executor: &mut E,
        request: &InferenceRequest,
        model: &ModelShape,
    ) -> Result<Option<RunReport>> {
        // Idle -> TopologyReady: pure validation, no communication yet
        self.ctx.grid.validate_model(model)?;
        let coord = self.ctx.grid.coordinate_of(self.ctx.rank)?;
        self.coordinate = Some(coord);
        self.state = DriverState::TopologyReady;
        tracing::debug!(
            rank = self.ctx.rank,
            pipeline_rank = coord.pipeline_rank,
            tensor_rank = coord.tensor_rank,
            "topology ready"
        );

        // TopologyReady -> CommReady: both handles held before returning
        let (tensor_group, pipeline_group) = init_groups(&mut self.ctx.endpoint, &self.ctx.grid)?;
        self.tensor_group = Some(tensor_group);
        self.pipeline_group = Some(pipeline_group);
        self.state = DriverState::CommReady;
        tracing::debug!(rank = self.ctx.rank, "collective handles distributed");

        // CommReady -> WarmedUp: discarded pass amortizes one-time setup
        // cost so it does not pollute the measured pass
        let mut contract = TensorContract::build(request, model)?;
        executor.forward(&mut contract)?;
        self.ctx.endpoint.barrier()?;
        self.state = DriverState::WarmedUp;
        tracing::debug!(rank = self.ctx.rank, "warm-up complete");

        // WarmedUp -> Executed: timestamps taken after each synchronization
        // point so execution time, not barrier-wait time, is measured
        self.ctx.endpoint.barrier()?;
        let start = Instant::now();
        executor.forward(&mut contract)?;
        self.ctx.endpoint.barrier()?;
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        self.state = DriverState::Executed;
        tracing::info!(rank = self.ctx.rank, elapsed_ms, "timed pass complete");

        // Executed -> Reported: only grid cell (0, 0) reports
        let report = if coord.is_root() {
            Some(self.report(&contract, request, model, elapsed_ms)?)
        } else {
            None
        };
        self.state = DriverState::Reported;

        // Reported -> Done: release communication handles
        self.tensor_group = None;
        self.pipeline_group = None;
        self.state = DriverState::Done;
        Ok(report)
    }

    /// Copy outputs to host, write the artifact, print the summary
    fn report(
        &self,
        contract: &TensorContract,
        request: &InferenceRequest,
        model: &ModelShape,
        elapsed_ms: f64,
    ) -> Result<RunReport> {
        let output_ids = contract.output_ids.to_host_i32()?;
        let total_output_len = contract.total_output_len();

        let file = File::create(&self.ctx.output_path)?;
        let mut writer = BufWriter::new(file);
        if total_output_len > 0 {
            for row in output_ids.chunks(total_output_len) {
                let line: Vec<String> = row.iter().map(ToString::to_string).collect();
                writeln!(writer, "{}", line.join(" "))?;
            }
        }
        writer.flush()?;

        let zero_count = output_ids.iter().filter(|&&t| t == 0).count();
        let preview: Vec<i32> = output_ids.iter().take(10).copied().collect();

        println!("writing {} elements to {}", output_ids.len(), self.ctx.output_path.display());
        let rendered: Vec<String> = preview.iter().map(|t| format!("{t:5}")).collect();
        println!("{}", rendered.join(" "));
        println!("zero_count = {zero_count}");
        println!(
            "[INFO] request_batch_size {} beam_width {} head_num {} size_per_head {} \
             total_output_len {} decoder_layers {} vocab_size {} decode_time {:.2} ms",
            request.batch_size,
            request.beam_width,
            model.head_num,
            model.size_per_head,
            total_output_len,
            model.decoder_layers,
            model.vocab_size,
            elapsed_ms
        );

        Ok(RunReport {
            elapsed_ms,
            tokens_written: output_ids.len(),
            zero_count,
            preview,
        })
    }
}

/// Run a full world of ranks over an in-process fabric
///
/// Spawns one thread per rank, each owning a driver and an executor built
/// by `make_executor(rank)`, and returns the root rank's report. The first
/// failing rank's error is returned if any rank fails.
///
/// # Errors
///
/// Propagates the first rank error in rank order.
pub fn run_local_world<E, F>(
    grid: ProcessGrid,
    model: ModelShape,
    request: &InferenceRequest,
    output_path: &Path,
    make_executor: F,
) -> Result<RunReport>
where
    E: ModelExecutor,
    F: Fn(usize) -> E + Sync,
{
    let endpoints = LocalFabric::new(grid.world_size()).into_endpoints();
    let results: Vec<Result<Option<RunReport>>> = thread::scope(|s| {
        let make_executor = &make_executor;
        let handles: Vec<_> = endpoints
            .into_iter()
            .map(|endpoint| {
                s.spawn(move || {
                    let rank = endpoint.rank();
                    let mut executor = make_executor(rank);
                    let ctx = DriverContext {
                        endpoint,
                        grid,
                        rank,
                        output_path: output_path.to_path_buf(),
                    };
                    let mut driver = InferenceDriver::new(ctx);
                    driver.run(&mut executor, request, &model)
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| {
                handle.join().unwrap_or_else(|_| {
                    Err(RepartirError::ExecutorFailure {
                        reason: "rank thread panicked".to_string(),
                    })
                })
            })
            .collect()
    });

    let mut report = None;
    for outcome in results {
        match outcome {
            Ok(Some(r)) => report = Some(r),
            Ok(None) => {}
            Err(e) => return Err(e),
        }
    }
    report.ok_or_else(|| RepartirError::ExecutorFailure {
        reason: "root rank produced no report".to_string(),
    })
}

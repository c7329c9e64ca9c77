//! # Repartir
//!
//! Distributed-inference coordination for large sharded language models.
//!
//! Repartir (Spanish: "to distribute, to share out") implements the
//! distributed wiring and execution protocol around a model executor: it
//! maps a flat set of worker ranks onto a 2D grid of tensor-parallel and
//! pipeline-parallel groups, bootstraps one collective handle per group
//! via root election and rooted broadcast, builds the shaped tensor
//! contract framing one forward pass, and sequences a warm-up plus a timed
//! pass bracketed by full-world barriers. The neural-network math itself
//! is an external collaborator behind the [`executor::ModelExecutor`]
//! seam.
//!
//! ## Example
//!
//! ```rust
//! use repartir::topology::{ParallelGroupKind, ProcessGrid};
//!
//! // Four ranks as a 2x2 grid: two pipeline stages, two tensor shards
//! let grid = ProcessGrid::new(4, 2, 2).unwrap();
//! let coord = grid.coordinate_of(2).unwrap();
//! assert_eq!((coord.pipeline_rank, coord.tensor_rank), (1, 0));
//!
//! // Rank 2 shares its tensor-parallel group with rank 3
//! let members = grid.group_members(2, ParallelGroupKind::Tensor).unwrap();
//! assert_eq!(members, vec![2, 3]);
//! ```
//!
//! ## Failure philosophy
//!
//! Fail-fast validation up front, then unconditional trust in the
//! collective protocol once started: configuration and shape errors are
//! caught before any handle or buffer exists, and any later failure is
//! fatal to the whole run on every rank. There is no retry, timeout, or
//! partial-failure recovery; a peer that never reaches a collective blocks
//! the remaining members indefinitely, and supervision is external.

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::cast_precision_loss)] // elapsed-ms and count arithmetic
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)] // token ids are well under i32::MAX
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::uninlined_format_args)]

/// CLI command implementations (extracted for testability)
pub mod cli;
/// Collective handle bootstrap over an in-process fabric
pub mod comm;
/// Request/response tensor contract for one inference call
pub mod contract;
/// The distributed inference driver state machine
pub mod driver;
/// Crate-wide error taxonomy
pub mod error;
/// The opaque model-executor seam and its deterministic mock
pub mod executor;
/// Tensor descriptors exchanged with the executor
pub mod tensor;
/// Flat-rank to 2D-grid process topology
pub mod topology;

pub use error::{RepartirError, Result};
pub use tensor::TensorDescriptor;
pub use topology::{GridCoordinate, ModelShape, ParallelGroupKind, ProcessGrid};

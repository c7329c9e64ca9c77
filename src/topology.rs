//! Process topology for 2D-parallel inference
//!
//! Maps a flat set of worker ranks onto a `pipeline_para_size x
//! tensor_para_size` grid and derives, for each rank, its coordinates and
//! its two sub-group memberships. The mapping is pure integer arithmetic,
//! so it is testable without standing up real distributed processes.
//!
//! Ranks are assigned row-major: pipeline dimension first, then tensor
//! dimension (`world_rank = pipeline_rank * tensor_para_size +
//! tensor_rank`). This ordering is load-bearing: collective handle root
//! election relies on cells `(0, *)` and `(*, 0)` being the lowest world
//! rank in their respective groups.

use serde::{Deserialize, Serialize};

use crate::error::{RepartirError, Result};

/// Position of one rank in the 2D parallelism grid
///
/// Invariant: `world_rank = pipeline_rank * tensor_para_size + tensor_rank`.
///
/// # Examples
///
/// ```
/// use repartir::topology::ProcessGrid;
///
/// let grid = ProcessGrid::new(4, 2, 2).unwrap();
/// let coord = grid.coordinate_of(3).unwrap();
/// assert_eq!(coord.pipeline_rank, 1);
/// assert_eq!(coord.tensor_rank, 1);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GridCoordinate {
    /// Which pipeline stage this rank belongs to (row index)
    pub pipeline_rank: usize,
    /// Which tensor shard this rank owns within its stage (column index)
    pub tensor_rank: usize,
}

impl GridCoordinate {
    /// Whether this is the designated reporting rank, grid cell (0, 0)
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.pipeline_rank == 0 && self.tensor_rank == 0
    }
}

/// The two kinds of parallel group a rank belongs to
///
/// Every rank belongs to exactly one group of each kind; groups of one kind
/// partition the world exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParallelGroupKind {
    /// All ranks sharing a pipeline stage (one grid row); shards within a layer
    Tensor,
    /// All ranks sharing a tensor shard index (one grid column); shards across layers
    Pipeline,
}

/// Model dimensions relevant to sharding validation
///
/// The forward math itself is out of scope; these values only drive
/// divisibility checks and the tensor contract shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelShape {
    /// Number of attention heads
    pub head_num: usize,
    /// Dimension of each attention head
    pub size_per_head: usize,
    /// Vocabulary size
    pub vocab_size: usize,
    /// Number of decoder layers
    pub decoder_layers: usize,
    /// Hard ceiling on input length + requested output length
    pub max_seq_len: usize,
}

impl ModelShape {
    /// Hidden dimension, `head_num * size_per_head`
    #[must_use]
    pub fn hidden_units(&self) -> usize {
        self.head_num * self.size_per_head
    }
}

/// 2D decomposition of a flat rank set
///
/// Validated at construction: `tensor_para_size * pipeline_para_size` must
/// equal `world_size` and all sizes must be positive. This check runs
/// before any communication handle exists, since a mismatch makes later
/// group formation meaningless.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessGrid {
    world_size: usize,
    tensor_para_size: usize,
    pipeline_para_size: usize,
}

impl ProcessGrid {
    /// Create a grid from the three group-formation sizes
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfiguration` if any size is zero or the product
    /// of the two parallel sizes does not equal `world_size`.
    pub fn new(
        world_size: usize,
        tensor_para_size: usize,
        pipeline_para_size: usize,
    ) -> Result<Self> {
        if world_size == 0 || tensor_para_size == 0 || pipeline_para_size == 0 {
            return Err(RepartirError::InvalidConfiguration {
                reason: format!(
                    "group sizes must be positive: world_size ({world_size}), \
                     tensor_para_size ({tensor_para_size}), \
                     pipeline_para_size ({pipeline_para_size})"
                ),
            });
        }
        if tensor_para_size * pipeline_para_size != world_size {
            return Err(RepartirError::InvalidConfiguration {
                reason: format!(
                    "tensor_para_size ({tensor_para_size}) * pipeline_para_size \
                     ({pipeline_para_size}) should equal world_size ({world_size})"
                ),
            });
        }
        Ok(Self {
            world_size,
            tensor_para_size,
            pipeline_para_size,
        })
    }

    /// Total number of ranks
    #[must_use]
    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// Size of every tensor-parallel group
    #[must_use]
    pub fn tensor_para_size(&self) -> usize {
        self.tensor_para_size
    }

    /// Size of every pipeline-parallel group
    #[must_use]
    pub fn pipeline_para_size(&self) -> usize {
        self.pipeline_para_size
    }

    /// Validate that the model shards evenly onto this grid
    ///
    /// Each pipeline stage owns a contiguous, equal-sized layer range and
    /// each tensor shard owns a contiguous, equal-sized head range.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfiguration` if any model dimension is zero, the
    /// layer count is not divisible by the pipeline size, or the head count
    /// is not divisible by the tensor size.
    pub fn validate_model(&self, model: &ModelShape) -> Result<()> {
        if model.head_num == 0
            || model.size_per_head == 0
            || model.vocab_size == 0
            || model.decoder_layers == 0
            || model.max_seq_len == 0
        {
            return Err(RepartirError::InvalidConfiguration {
                reason: format!("model dimensions must be positive: {model:?}"),
            });
        }
        if model.decoder_layers % self.pipeline_para_size != 0 {
            return Err(RepartirError::InvalidConfiguration {
                reason: format!(
                    "decoder_layers ({}) should be divisible by pipeline_para_size ({})",
                    model.decoder_layers, self.pipeline_para_size
                ),
            });
        }
        if model.head_num % self.tensor_para_size != 0 {
            return Err(RepartirError::InvalidConfiguration {
                reason: format!(
                    "head_num ({}) should be divisible by tensor_para_size ({})",
                    model.head_num, self.tensor_para_size
                ),
            });
        }
        Ok(())
    }

    /// Contiguous layers owned by each pipeline stage
    ///
    /// Call after [`ProcessGrid::validate_model`]; truncates otherwise.
    #[must_use]
    pub fn layers_per_stage(&self, model: &ModelShape) -> usize {
        model.decoder_layers / self.pipeline_para_size
    }

    /// Contiguous heads owned by each tensor shard
    ///
    /// Call after [`ProcessGrid::validate_model`]; truncates otherwise.
    #[must_use]
    pub fn heads_per_shard(&self, model: &ModelShape) -> usize {
        model.head_num / self.tensor_para_size
    }

    /// Map a world rank to its grid coordinate
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfiguration` if `rank` is outside `[0, world_size)`.
    pub fn coordinate_of(&self, rank: usize) -> Result<GridCoordinate> {
        self.check_rank(rank)?;
        Ok(GridCoordinate {
            pipeline_rank: rank / self.tensor_para_size,
            tensor_rank: rank % self.tensor_para_size,
        })
    }

    /// Map a grid coordinate back to its world rank
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfiguration` if the coordinate lies outside the grid.
    pub fn rank_of(&self, coord: GridCoordinate) -> Result<usize> {
        if coord.pipeline_rank >= self.pipeline_para_size
            || coord.tensor_rank >= self.tensor_para_size
        {
            return Err(RepartirError::InvalidConfiguration {
                reason: format!(
                    "coordinate ({}, {}) outside grid ({} x {})",
                    coord.pipeline_rank,
                    coord.tensor_rank,
                    self.pipeline_para_size,
                    self.tensor_para_size
                ),
            });
        }
        Ok(coord.pipeline_rank * self.tensor_para_size + coord.tensor_rank)
    }

    /// World ranks sharing a group with `rank`, ascending
    ///
    /// For [`ParallelGroupKind::Tensor`] this is the rank's grid row; for
    /// [`ParallelGroupKind::Pipeline`] its grid column. The first member is
    /// always the lowest world rank and is the group's broadcast root.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfiguration` if `rank` is outside the world.
    pub fn group_members(&self, rank: usize, kind: ParallelGroupKind) -> Result<Vec<usize>> {
        let coord = self.coordinate_of(rank)?;
        let members = match kind {
            ParallelGroupKind::Tensor => (0..self.tensor_para_size)
                .map(|t| coord.pipeline_rank * self.tensor_para_size + t)
                .collect(),
            ParallelGroupKind::Pipeline => (0..self.pipeline_para_size)
                .map(|p| p * self.tensor_para_size + coord.tensor_rank)
                .collect(),
        };
        Ok(members)
    }

    /// Position of `rank` within its group of the given kind
    ///
    /// The tensor-group local rank equals the tensor coordinate and the
    /// pipeline-group local rank equals the pipeline coordinate, so local
    /// rank 0 is always the group's lowest world rank.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfiguration` if `rank` is outside the world.
    pub fn group_rank(&self, rank: usize, kind: ParallelGroupKind) -> Result<usize> {
        let coord = self.coordinate_of(rank)?;
        Ok(match kind {
            ParallelGroupKind::Tensor => coord.tensor_rank,
            ParallelGroupKind::Pipeline => coord.pipeline_rank,
        })
    }

    fn check_rank(&self, rank: usize) -> Result<()> {
        if rank >= self.world_size {
            return Err(RepartirError::InvalidConfiguration {
                reason: format!(
                    "rank ({rank}) outside world of size ({})",
                    self.world_size
                ),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model_24_layers() -> ModelShape {
        ModelShape {
            head_num: 16,
            size_per_head: 64,
            vocab_size: 50257,
            decoder_layers: 24,
            max_seq_len: 128,
        }
    }

    #[test]
    fn test_2x2_grid_coordinates() {
        let grid = ProcessGrid::new(4, 2, 2).unwrap();
        let coords: Vec<_> = (0..4).map(|r| grid.coordinate_of(r).unwrap()).collect();
        assert_eq!(coords[0], GridCoordinate { pipeline_rank: 0, tensor_rank: 0 });
        assert_eq!(coords[1], GridCoordinate { pipeline_rank: 0, tensor_rank: 1 });
        assert_eq!(coords[2], GridCoordinate { pipeline_rank: 1, tensor_rank: 0 });
        assert_eq!(coords[3], GridCoordinate { pipeline_rank: 1, tensor_rank: 1 });
    }

    #[test]
    fn test_2x2_group_membership() {
        let grid = ProcessGrid::new(4, 2, 2).unwrap();
        assert_eq!(grid.group_members(0, ParallelGroupKind::Tensor).unwrap(), vec![0, 1]);
        assert_eq!(grid.group_members(1, ParallelGroupKind::Tensor).unwrap(), vec![0, 1]);
        assert_eq!(grid.group_members(2, ParallelGroupKind::Tensor).unwrap(), vec![2, 3]);
        assert_eq!(grid.group_members(0, ParallelGroupKind::Pipeline).unwrap(), vec![0, 2]);
        assert_eq!(grid.group_members(3, ParallelGroupKind::Pipeline).unwrap(), vec![1, 3]);
    }

    #[test]
    fn test_group_rank_matches_coordinate() {
        let grid = ProcessGrid::new(6, 3, 2).unwrap();
        for rank in 0..6 {
            let coord = grid.coordinate_of(rank).unwrap();
            assert_eq!(
                grid.group_rank(rank, ParallelGroupKind::Tensor).unwrap(),
                coord.tensor_rank
            );
            assert_eq!(
                grid.group_rank(rank, ParallelGroupKind::Pipeline).unwrap(),
                coord.pipeline_rank
            );
        }
    }

    #[test]
    fn test_roundtrip_rank_coordinate() {
        let grid = ProcessGrid::new(12, 4, 3).unwrap();
        for rank in 0..12 {
            let coord = grid.coordinate_of(rank).unwrap();
            assert_eq!(grid.rank_of(coord).unwrap(), rank);
        }
    }

    #[test]
    fn test_mismatched_world_size_fails() {
        let result = ProcessGrid::new(5, 3, 2);
        assert!(matches!(
            result.unwrap_err(),
            RepartirError::InvalidConfiguration { .. }
        ));
    }

    #[test]
    fn test_zero_sizes_fail() {
        assert!(ProcessGrid::new(0, 0, 0).is_err());
        assert!(ProcessGrid::new(4, 0, 4).is_err());
    }

    #[test]
    fn test_rank_out_of_range() {
        let grid = ProcessGrid::new(4, 2, 2).unwrap();
        assert!(grid.coordinate_of(4).is_err());
        assert!(grid.group_members(7, ParallelGroupKind::Tensor).is_err());
    }

    #[test]
    fn test_coordinate_out_of_grid() {
        let grid = ProcessGrid::new(4, 2, 2).unwrap();
        let bad = GridCoordinate { pipeline_rank: 2, tensor_rank: 0 };
        assert!(grid.rank_of(bad).is_err());
    }

    #[test]
    fn test_model_divisibility() {
        let grid = ProcessGrid::new(4, 2, 2).unwrap();
        let model = model_24_layers();
        grid.validate_model(&model).unwrap();
        assert_eq!(grid.layers_per_stage(&model), 12);
        assert_eq!(grid.heads_per_shard(&model), 8);
    }

    #[test]
    fn test_indivisible_layers_fail() {
        let grid = ProcessGrid::new(6, 2, 3).unwrap();
        let mut model = model_24_layers();
        model.decoder_layers = 25;
        let err = grid.validate_model(&model).unwrap_err();
        assert!(err.to_string().contains("decoder_layers (25)"));
    }

    #[test]
    fn test_indivisible_heads_fail() {
        let grid = ProcessGrid::new(6, 3, 2).unwrap();
        let model = model_24_layers(); // 16 heads, not divisible by 3
        let err = grid.validate_model(&model).unwrap_err();
        assert!(err.to_string().contains("head_num (16)"));
    }

    #[test]
    fn test_root_coordinate() {
        let grid = ProcessGrid::new(4, 2, 2).unwrap();
        assert!(grid.coordinate_of(0).unwrap().is_root());
        assert!(!grid.coordinate_of(1).unwrap().is_root());
    }

    #[test]
    fn test_single_rank_world() {
        let grid = ProcessGrid::new(1, 1, 1).unwrap();
        let coord = grid.coordinate_of(0).unwrap();
        assert!(coord.is_root());
        assert_eq!(grid.group_members(0, ParallelGroupKind::Tensor).unwrap(), vec![0]);
        assert_eq!(grid.group_members(0, ParallelGroupKind::Pipeline).unwrap(), vec![0]);
    }

    #[test]
    fn test_hidden_units() {
        assert_eq!(model_24_layers().hidden_units(), 1024);
    }
}

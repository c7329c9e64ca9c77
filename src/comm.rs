//! Collective-communication bootstrap
//!
//! For each parallel group, the member with group-local rank 0 generates
//! exactly one [`CommHandle`] and every other member receives a copy via a
//! group-scoped broadcast rooted at that member, before any collective
//! operation on the group is issued. Handle distribution for the tensor and
//! pipeline groups is independent; within a group, every member blocks
//! until it holds the handle.
//!
//! The fabric here is an in-process message-passing abstraction with
//! delivery-before-return semantics: one thread per rank, endpoints
//! pre-wired by [`LocalFabric`]. The protocol (root election, rooted
//! broadcast, full-world barrier) is the same one a real MPI/NCCL
//! deployment runs, which keeps it testable without standing up devices.
//!
//! Known limitation: a participant that never reaches a collective causes
//! the remaining members to block indefinitely. There is no internal
//! timeout; external process supervision is assumed. Only a *disconnected*
//! peer (its endpoint dropped) is detectable, surfacing as `CommFailure`.

use std::collections::VecDeque;
use std::sync::mpsc::{channel, Receiver, Sender};

use serde::{Deserialize, Serialize};

use crate::error::{RepartirError, Result};
use crate::topology::{ParallelGroupKind, ProcessGrid};

/// Opaque communication-channel identity scoped to one parallel group
///
/// Created once by the group's root, immutable after distribution, and
/// shared read-only across all later operations. Lifetime is the inference
/// run; dropped at shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommHandle(u128);

impl CommHandle {
    fn generate() -> Self {
        Self(rand::random())
    }

    /// Raw 128-bit identity
    #[must_use]
    pub fn id(&self) -> u128 {
        self.0
    }
}

/// A rank's membership in one parallel group, handle included
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupComm {
    /// Which dimension this group spans
    pub kind: ParallelGroupKind,
    /// The group-scoped handle, identical on every member
    pub handle: CommHandle,
    /// World ranks of all members, ascending; first is the root
    pub members: Vec<usize>,
    /// This rank's position within `members`
    pub local_rank: usize,
}

#[derive(Debug)]
enum Message {
    Handle {
        kind: ParallelGroupKind,
        handle: CommHandle,
    },
    BarrierArrive {
        epoch: u64,
    },
    BarrierRelease {
        epoch: u64,
    },
}

#[derive(Debug)]
struct Envelope {
    src: usize,
    msg: Message,
}

/// A fully wired in-process fabric, one endpoint per rank
///
/// # Examples
///
/// ```
/// use repartir::comm::LocalFabric;
///
/// let endpoints = LocalFabric::new(4).into_endpoints();
/// assert_eq!(endpoints.len(), 4);
/// assert_eq!(endpoints[2].rank(), 2);
/// ```
pub struct LocalFabric {
    endpoints: Vec<RankEndpoint>,
}

impl LocalFabric {
    /// Wire up one endpoint per rank, every pair connected
    #[must_use]
    pub fn new(world_size: usize) -> Self {
        let mut txs = Vec::with_capacity(world_size);
        let mut rxs = Vec::with_capacity(world_size);
        for _ in 0..world_size {
            let (tx, rx) = channel();
            txs.push(tx);
            rxs.push(rx);
        }
        let endpoints = rxs
            .into_iter()
            .enumerate()
            .map(|(rank, rx)| RankEndpoint {
                rank,
                world_size,
                txs: txs.clone(),
                rx,
                pending: VecDeque::new(),
                barrier_epoch: 0,
            })
            .collect();
        Self { endpoints }
    }

    /// Number of ranks in the fabric
    #[must_use]
    pub fn world_size(&self) -> usize {
        self.endpoints.len()
    }

    /// Hand each rank its endpoint
    #[must_use]
    pub fn into_endpoints(self) -> Vec<RankEndpoint> {
        self.endpoints
    }
}

/// Per-rank view of the fabric
///
/// Supports point-to-point delivery to any world rank, rooted group
/// broadcast of a [`CommHandle`], and a full-world barrier. Receives match
/// on source and message kind; out-of-order arrivals are stashed, so
/// independent collectives on different groups cannot cross-talk.
pub struct RankEndpoint {
    rank: usize,
    world_size: usize,
    txs: Vec<Sender<Envelope>>,
    rx: Receiver<Envelope>,
    pending: VecDeque<Envelope>,
    barrier_epoch: u64,
}

impl RankEndpoint {
    /// World rank this endpoint belongs to
    #[must_use]
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Number of ranks in the fabric
    #[must_use]
    pub fn world_size(&self) -> usize {
        self.world_size
    }

    fn send(&self, dst: usize, msg: Message) -> Result<()> {
        self.txs[dst]
            .send(Envelope {
                src: self.rank,
                msg,
            })
            .map_err(|_| RepartirError::CommFailure {
                reason: format!(
                    "rank {} could not deliver to rank {dst}: peer endpoint dropped",
                    self.rank
                ),
            })
    }

    /// Blocks until a matching message arrives; stashes everything else.
    fn recv_matching<F>(&mut self, want: F) -> Result<Envelope>
    where
        F: Fn(&Envelope) -> bool,
    {
        if let Some(pos) = self.pending.iter().position(&want) {
            // Earlier collectives may have left this in the stash
            return Ok(self.pending.remove(pos).unwrap_or_else(|| unreachable!()));
        }
        loop {
            let envelope = self.rx.recv().map_err(|_| RepartirError::CommFailure {
                reason: format!(
                    "rank {} receive failed: all peer endpoints dropped",
                    self.rank
                ),
            })?;
            if want(&envelope) {
                return Ok(envelope);
            }
            self.pending.push_back(envelope);
        }
    }

    /// Distribute a group handle from the group root to every member
    ///
    /// The member with `local_rank == 0` generates the handle and sends it
    /// to each other member before returning; every other member blocks
    /// until the handle from the root arrives. Delivery-before-return holds
    /// on every member.
    ///
    /// # Errors
    ///
    /// Returns `CommFailure` if a member endpoint has been dropped.
    pub fn broadcast_handle(
        &mut self,
        kind: ParallelGroupKind,
        members: &[usize],
        local_rank: usize,
    ) -> Result<CommHandle> {
        debug_assert_eq!(members[local_rank], self.rank);
        if local_rank == 0 {
            let handle = CommHandle::generate();
            for &member in &members[1..] {
                self.send(member, Message::Handle { kind, handle })?;
            }
            tracing::debug!(rank = self.rank, ?kind, "generated group handle");
            Ok(handle)
        } else {
            let root = members[0];
            let envelope = self.recv_matching(|e| {
                e.src == root && matches!(&e.msg, Message::Handle { kind: k, .. } if *k == kind)
            })?;
            match envelope.msg {
                Message::Handle { handle, .. } => {
                    tracing::debug!(rank = self.rank, ?kind, "received group handle");
                    Ok(handle)
                }
                _ => unreachable!("matched on Message::Handle"),
            }
        }
    }

    /// Full-world rendezvous
    ///
    /// Centralized: every rank reports arrival to rank 0, which releases
    /// all ranks once the last arrival lands. Epoch-tagged so back-to-back
    /// barriers cannot be confused.
    ///
    /// # Errors
    ///
    /// Returns `CommFailure` if a peer endpoint has been dropped.
    pub fn barrier(&mut self) -> Result<()> {
        let epoch = self.barrier_epoch;
        self.barrier_epoch += 1;
        if self.world_size == 1 {
            return Ok(());
        }
        if self.rank == 0 {
            for _ in 1..self.world_size {
                self.recv_matching(
                    |e| matches!(e.msg, Message::BarrierArrive { epoch: ep } if ep == epoch),
                )?;
            }
            for dst in 1..self.world_size {
                self.send(dst, Message::BarrierRelease { epoch })?;
            }
        } else {
            self.send(0, Message::BarrierArrive { epoch })?;
            self.recv_matching(|e| {
                e.src == 0 && matches!(e.msg, Message::BarrierRelease { epoch: ep } if ep == epoch)
            })?;
        }
        Ok(())
    }
}

/// Elect roots and distribute handles for both of a rank's groups
///
/// Returns the rank's `(tensor_group, pipeline_group)` memberships, each
/// carrying the distributed handle. Both broadcasts complete before this
/// returns, so the caller may immediately issue collective operations.
///
/// # Errors
///
/// Returns `InvalidConfiguration` if the endpoint rank lies outside the
/// grid, or `CommFailure` if a peer endpoint has been dropped.
pub fn init_groups(
    endpoint: &mut RankEndpoint,
    grid: &ProcessGrid,
) -> Result<(GroupComm, GroupComm)> {
    let rank = endpoint.rank();
    let mut groups = Vec::with_capacity(2);
    for kind in [ParallelGroupKind::Tensor, ParallelGroupKind::Pipeline] {
        let members = grid.group_members(rank, kind)?;
        let local_rank = grid.group_rank(rank, kind)?;
        let handle = endpoint.broadcast_handle(kind, &members, local_rank)?;
        groups.push(GroupComm {
            kind,
            handle,
            members,
            local_rank,
        });
    }
    let pipeline = groups.pop().unwrap_or_else(|| unreachable!());
    let tensor = groups.pop().unwrap_or_else(|| unreachable!());
    Ok((tensor, pipeline))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_single_rank_barrier_and_broadcast() {
        let mut endpoints = LocalFabric::new(1).into_endpoints();
        let mut ep = endpoints.remove(0);
        ep.barrier().unwrap();
        let handle = ep
            .broadcast_handle(ParallelGroupKind::Tensor, &[0], 0)
            .unwrap();
        assert_eq!(handle.id(), handle.id());
    }

    #[test]
    fn test_handle_distribution_2x2() {
        let grid = ProcessGrid::new(4, 2, 2).unwrap();
        let endpoints = LocalFabric::new(4).into_endpoints();

        let results: Vec<(GroupComm, GroupComm)> = thread::scope(|s| {
            let handles: Vec<_> = endpoints
                .into_iter()
                .map(|mut ep| s.spawn(move || init_groups(&mut ep, &grid).unwrap()))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        // Tensor groups: {0,1} share a handle, {2,3} share a different one
        assert_eq!(results[0].0.handle, results[1].0.handle);
        assert_eq!(results[2].0.handle, results[3].0.handle);
        assert_ne!(results[0].0.handle, results[2].0.handle);
        assert_eq!(results[0].0.members, vec![0, 1]);
        assert_eq!(results[3].0.members, vec![2, 3]);

        // Pipeline groups: {0,2} and {1,3}
        assert_eq!(results[0].1.handle, results[2].1.handle);
        assert_eq!(results[1].1.handle, results[3].1.handle);
        assert_ne!(results[0].1.handle, results[1].1.handle);
        assert_eq!(results[0].1.members, vec![0, 2]);
        assert_eq!(results[3].1.members, vec![1, 3]);

        // Local ranks mirror grid coordinates
        assert_eq!(results[3].0.local_rank, 1);
        assert_eq!(results[3].1.local_rank, 1);
        assert_eq!(results[0].0.local_rank, 0);
    }

    #[test]
    fn test_barrier_synchronizes_all_ranks() {
        let world = 4;
        let endpoints = LocalFabric::new(world).into_endpoints();
        let counter = Arc::new(AtomicUsize::new(0));

        thread::scope(|s| {
            for mut ep in endpoints {
                let counter = Arc::clone(&counter);
                s.spawn(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    ep.barrier().unwrap();
                    // Every rank has incremented before any rank passes
                    assert_eq!(counter.load(Ordering::SeqCst), world);
                    ep.barrier().unwrap();
                });
            }
        });
    }

    #[test]
    fn test_dropped_peer_is_comm_failure() {
        let mut endpoints = LocalFabric::new(2).into_endpoints();
        let dropped = endpoints.pop().unwrap();
        drop(dropped);
        let mut root = endpoints.pop().unwrap();

        let err = root
            .broadcast_handle(ParallelGroupKind::Pipeline, &[0, 1], 0)
            .unwrap_err();
        assert!(matches!(err, RepartirError::CommFailure { .. }));
    }

    #[test]
    fn test_back_to_back_barriers_do_not_cross() {
        // Repeated barriers with uneven arrival order must stay paired
        let endpoints = LocalFabric::new(3).into_endpoints();
        thread::scope(|s| {
            for mut ep in endpoints {
                s.spawn(move || {
                    for _ in 0..50 {
                        ep.barrier().unwrap();
                    }
                });
            }
        });
    }
}

//! Sub-request (siots) and parent-request (iots) structures.
//!
//! A [`SubRequest`] is one state-machine-driven unit of work over a bounded
//! logical range. The orchestrator creates it with the logical range, opcode,
//! and geometry already populated; the engine drives it to exactly one
//! terminal [`BlockStatus`] and never reports partial outcomes — partial
//! progress is visible only through the parent's blocks-transferred counter.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use fraid_eboard::ErrorBoard;
use fraid_error::RaidError;
use fraid_fruts::FruArena;
use fraid_geometry::{compute_geometry, MirrorConfig, MirrorKind, PositionMap};
use fraid_io::{BufferSet, ErrorRegion, Topology};
use fraid_types::{
    Algorithm, BlockCount, BlockQualifier, BlockStatus, Lba, PositionBitmask, RaidPosition, Width,
};

use crate::state::MachineState;

/// Parent request owning one or more sibling sub-requests.
///
/// The engine only advances `blocks_transferred` and raises `remap_needed`;
/// everything else about the parent belongs to the orchestrator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParentRequest {
    pub blocks_transferred: BlockCount,
    pub remap_needed: bool,
}

/// Why a checkpoint stopped a state function before it issued I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointStop {
    Aborted,
    Expired,
    /// Parked by an external coordinator; must be explicitly resumed.
    Quiesced,
}

/// Terminal report surfaced alongside the block status, serializable for
/// orchestrator logging.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TerminalReport {
    pub status: BlockStatus,
    pub qualifier: BlockQualifier,
    pub lba: Lba,
    pub blocks: BlockCount,
    pub error_regions: Vec<ErrorRegion>,
    pub eboard: ErrorBoard,
}

/// One state-machine-driven unit of work over a bounded logical range.
#[derive(Debug)]
pub struct SubRequest {
    pub id: u64,
    pub algorithm: Algorithm,
    pub kind: MirrorKind,
    pub config: MirrorConfig,

    /// Full logical range of this sub-request.
    pub start_lba: Lba,
    pub xfer_count: BlockCount,
    /// Currently active range (shrunk to a chunk while region mining).
    pub parity_start: Lba,
    pub parity_count: BlockCount,

    pub width: Width,
    pub map: PositionMap,
    /// Live position count; `data_disks + degraded count == width` always.
    pub data_disks: u32,

    pub eboard: ErrorBoard,
    pub fruts: FruArena,
    pub buffers: Option<BufferSet>,
    /// Host payload for write-family requests (one logical copy).
    pub host_data: Option<Vec<u8>>,

    pub state: MachineState,
    pub status: BlockStatus,
    pub qualifier: BlockQualifier,
    pub error_regions: Vec<ErrorRegion>,

    /// Outstanding completions expected before evaluation may run.
    pub wait_count: u32,
    /// Waiting on a deferred buffer allocation.
    pub awaiting_alloc: bool,
    pub retry_count: u32,
    /// Positions already tried as a read source this request.
    pub tried_positions: PositionBitmask,
    pub region_mining: bool,

    pub aborted: bool,
    pub quiesced: bool,
    started_at: Instant,

    /// Nested recovery-verify sub-request (strict LIFO, depth ≤ 1).
    pub nested: Option<Box<SubRequest>>,
}

impl SubRequest {
    /// Build a sub-request with identity geometry for its width.
    pub fn new(
        id: u64,
        algorithm: Algorithm,
        kind: MirrorKind,
        config: MirrorConfig,
        width: Width,
        start_lba: Lba,
        xfer_count: BlockCount,
    ) -> Result<Self, RaidError> {
        let map = compute_geometry(width, kind)
            .map_err(|e| RaidError::Generate(e.to_string()))?;
        Ok(Self {
            id,
            algorithm,
            kind,
            config,
            start_lba,
            xfer_count,
            parity_start: start_lba,
            parity_count: xfer_count,
            width,
            map,
            data_disks: width.get(),
            eboard: ErrorBoard::default(),
            fruts: FruArena::new(width),
            buffers: None,
            host_data: None,
            state: MachineState::for_algorithm(algorithm),
            status: BlockStatus::Invalid,
            qualifier: BlockQualifier::None,
            error_regions: Vec::new(),
            wait_count: 0,
            awaiting_alloc: false,
            retry_count: 0,
            tried_positions: PositionBitmask::EMPTY,
            region_mining: false,
            aborted: false,
            quiesced: false,
            started_at: Instant::now(),
            nested: None,
        })
    }

    /// Attach the host payload for a write-family request.
    #[must_use]
    pub fn with_host_data(mut self, data: Vec<u8>) -> Self {
        self.host_data = Some(data);
        self
    }

    // ── Degraded tracking ───────────────────────────────────────────────

    /// Re-query the live topology and update the degraded/disabled masks.
    ///
    /// Called before every I/O dispatch: topology can change between
    /// state-machine steps, and this is where those changes are absorbed.
    pub fn refresh_degraded(
        &mut self,
        topology: &dyn Topology,
        for_write: bool,
        allow_write_degraded: bool,
    ) -> Result<(), RaidError> {
        let full = self.width.full_mask();
        self.eboard.degraded = topology.degraded_bitmask() & full;
        self.eboard.disabled = topology.disabled_bitmask() & full;

        let live = self.live_positions();
        self.data_disks = live.count();

        // Reads and ordinary writes need at least one live position. Writes
        // that tolerate degraded members (zero, degraded-write paths) only
        // need a member that is physically present.
        let present = full.difference(self.eboard.disabled);
        let satisfied = if for_write && allow_write_degraded {
            !present.is_empty()
        } else {
            !live.is_empty()
        };
        if !satisfied {
            return Err(RaidError::InsufficientLivePositions {
                live: self.data_disks,
                width: self.width.get(),
                required: 1,
            });
        }
        Ok(())
    }

    /// Positions neither degraded nor disabled.
    #[must_use]
    pub fn live_positions(&self) -> PositionBitmask {
        self.width
            .full_mask()
            .difference(self.eboard.degraded | self.eboard.disabled)
    }

    /// Degraded-but-present positions (rebuild targets).
    #[must_use]
    pub fn rebuild_targets(&self) -> PositionBitmask {
        self.eboard.degraded.difference(self.eboard.disabled)
    }

    // ── Cooperative suspension ──────────────────────────────────────────

    /// Cooperative-cancellation point at the top of every state that is
    /// about to issue I/O.
    #[must_use]
    pub fn checkpoint(&self) -> Option<CheckpointStop> {
        if self.aborted {
            Some(CheckpointStop::Aborted)
        } else if self.started_at.elapsed() >= self.config.expiration {
            Some(CheckpointStop::Expired)
        } else if self.quiesced {
            Some(CheckpointStop::Quiesced)
        } else {
            None
        }
    }

    /// Register `count` expected completions before the next evaluation.
    pub fn expect_completions(&mut self, count: u32) {
        self.wait_count = count;
    }

    /// Consume one arrived completion. A completion arriving when none is
    /// expected is a duplicate-callback bug; the caller must report
    /// `UnexpectedError` and must not re-issue I/O.
    pub fn consume_completion(&mut self) -> Result<(), RaidError> {
        if self.wait_count == 0 {
            warn!(id = self.id, "completion arrived with zero wait count");
            return Err(RaidError::Unexpected(
                "completion arrived with zero wait count".into(),
            ));
        }
        self.wait_count -= 1;
        Ok(())
    }

    // ── Region mining ───────────────────────────────────────────────────

    /// Blocks to mine in the next chunk.
    ///
    /// A runt first chunk aligns its end to the region boundary so every
    /// later chunk is fully aligned; aligned chunks take one region at a
    /// time; everything is clamped to the remaining transfer. Returns an
    /// error (never 0) if called with nothing left to transfer.
    pub fn region_mining_count(&self) -> Result<BlockCount, RaidError> {
        let region_size = self.config.region_size;
        if region_size == 0 || self.xfer_count.is_zero() {
            return Err(RaidError::Unexpected(format!(
                "mining with region_size {region_size} and xfer_count {}",
                self.xfer_count
            )));
        }
        let misalign = self.parity_start.0 % region_size;
        let count = if misalign != 0 {
            region_size - misalign
        } else {
            region_size
        };
        Ok(BlockCount(count).min(self.xfer_count))
    }

    /// Shrink the active span to one mining chunk.
    pub fn enter_region_mining(&mut self) -> Result<(), RaidError> {
        self.parity_count = self.region_mining_count()?;
        if !self.region_mining {
            info!(
                id = self.id,
                lba = %self.parity_start,
                chunk = %self.parity_count,
                "entering region mining"
            );
            self.region_mining = true;
        }
        Ok(())
    }

    /// True when the active chunk cannot be shrunk any further.
    #[must_use]
    pub fn mining_at_min(&self) -> bool {
        self.region_mining && self.parity_count.0 <= self.config.region_size
    }

    /// Retire the completed active span into the parent and advance.
    /// Returns the remaining transfer.
    pub fn advance_region(&mut self, parent: &mut ParentRequest) -> Result<BlockCount, RaidError> {
        let done = self.parity_count;
        parent.blocks_transferred = BlockCount(parent.blocks_transferred.0 + done.0);
        self.xfer_count = self
            .xfer_count
            .checked_sub(done)
            .ok_or_else(|| RaidError::Unexpected("advance past end of transfer".into()))?;
        self.parity_start = self
            .parity_start
            .checked_add(done)
            .ok_or_else(|| RaidError::Unexpected("parity_start overflow".into()))?;

        if self.xfer_count.is_zero() {
            self.parity_count = BlockCount::ZERO;
        } else if self.region_mining {
            self.parity_count = self.region_mining_count()?;
        } else {
            self.parity_count = self.xfer_count;
        }
        Ok(self.xfer_count)
    }

    // ── Terminal handling ───────────────────────────────────────────────

    /// Set the terminal status. Logged once, here, with full context.
    pub fn finish(&mut self, status: BlockStatus, qualifier: BlockQualifier) {
        info!(
            id = self.id,
            algorithm = ?self.algorithm,
            status = ?status,
            qualifier = ?qualifier,
            lba = %self.start_lba,
            blocks = %self.xfer_count,
            "sub-request terminal"
        );
        self.status = status;
        self.qualifier = qualifier;
    }

    /// Terminal report for the orchestrator.
    #[must_use]
    pub fn report(&self) -> TerminalReport {
        TerminalReport {
            status: self.status,
            qualifier: self.qualifier,
            lba: self.start_lba,
            blocks: self.xfer_count,
            error_regions: self.error_regions.clone(),
            eboard: self.eboard,
        }
    }
}

/// Map a `RaidError` to its terminal block status.
///
/// Exhaustive — adding a `RaidError` variant is a compile error until its
/// terminal status is assigned here.
#[must_use]
pub fn block_status_for_error(error: &RaidError) -> BlockStatus {
    match error {
        RaidError::Generate(_) | RaidError::Unexpected(_) => BlockStatus::UnexpectedError,
        RaidError::InsufficientLivePositions { .. } | RaidError::TooManyDead { .. } => {
            BlockStatus::DeadError
        }
        RaidError::Transport(_) | RaidError::Shutdown => BlockStatus::ShutdownError,
        RaidError::AllocationFailed(_) => BlockStatus::ShutdownError,
        RaidError::MediaError { .. } => BlockStatus::MediaError,
        RaidError::Aborted => BlockStatus::Aborted,
        RaidError::Expired => BlockStatus::Expired,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fraid_types::Algorithm;
    use std::time::Duration;

    fn request(lba: u64, blocks: u64, region: u64) -> SubRequest {
        let config = MirrorConfig {
            region_size: region,
            ..MirrorConfig::default()
        };
        SubRequest::new(
            1,
            Algorithm::Verify,
            MirrorKind::Standard,
            config,
            Width::new(2).unwrap(),
            Lba(lba),
            BlockCount(blocks),
        )
        .unwrap()
    }

    #[test]
    fn mining_chunk_aligned_start() {
        let req = request(0x1000, 0x100, 0x40);
        // 0x1000 % 0x40 == 0: one full region
        assert_eq!(req.region_mining_count().unwrap(), BlockCount(0x40));
    }

    #[test]
    fn mining_chunk_runt_first() {
        let req = request(0x1010, 0x100, 0x40);
        // End of the first chunk aligns to the next region boundary.
        assert_eq!(req.region_mining_count().unwrap(), BlockCount(0x30));
    }

    #[test]
    fn mining_chunk_clamps_to_remaining() {
        let req = request(0x1000, 0x10, 0x40);
        assert_eq!(req.region_mining_count().unwrap(), BlockCount(0x10));
    }

    #[test]
    fn mining_chunk_never_zero() {
        let mut req = request(0x1000, 0x100, 0x40);
        req.xfer_count = BlockCount::ZERO;
        assert!(req.region_mining_count().is_err());
    }

    #[test]
    fn mining_progress_is_exact() {
        // Each completed chunk decreases the remaining transfer by exactly
        // parity_count, and the last chunk clamps without overshoot.
        let mut req = request(0x1010, 0xA0, 0x40);
        let mut parent = ParentRequest::default();
        req.enter_region_mining().unwrap();

        let mut total = BlockCount::ZERO;
        let mut chunks = Vec::new();
        while !req.xfer_count.is_zero() {
            let chunk = req.parity_count;
            assert!(!chunk.is_zero(), "parity_count must never be 0 while mining");
            chunks.push(chunk.0);
            total = BlockCount(total.0 + chunk.0);
            req.advance_region(&mut parent).unwrap();
        }
        assert_eq!(total, BlockCount(0xA0));
        assert_eq!(parent.blocks_transferred, BlockCount(0xA0));
        // runt first chunk, then aligned regions
        assert_eq!(chunks, vec![0x30, 0x40, 0x30]);
    }

    #[test]
    fn refresh_degraded_conserves_masks() {
        struct Topo;
        impl Topology for Topo {
            fn degraded_bitmask(&self) -> PositionBitmask {
                PositionBitmask(0b10)
            }
            fn disabled_bitmask(&self) -> PositionBitmask {
                PositionBitmask::EMPTY
            }
            fn full_access_bitmask(&self) -> PositionBitmask {
                PositionBitmask(0b01)
            }
        }

        let mut req = request(0, 0x100, 0x40);
        req.refresh_degraded(&Topo, false, false).unwrap();

        let full = req.width.full_mask();
        let live = req.live_positions();
        assert_eq!(req.eboard.degraded | live, full);
        assert_eq!(req.eboard.degraded & live, PositionBitmask::EMPTY);
        assert_eq!(req.data_disks + req.eboard.degraded.count(), req.width.get());
    }

    #[test]
    fn refresh_degraded_fails_with_no_live() {
        struct Topo;
        impl Topology for Topo {
            fn degraded_bitmask(&self) -> PositionBitmask {
                PositionBitmask(0b01)
            }
            fn disabled_bitmask(&self) -> PositionBitmask {
                PositionBitmask(0b10)
            }
            fn full_access_bitmask(&self) -> PositionBitmask {
                PositionBitmask::EMPTY
            }
        }

        let mut req = request(0, 0x100, 0x40);
        assert!(matches!(
            req.refresh_degraded(&Topo, false, false),
            Err(RaidError::InsufficientLivePositions { live: 0, .. })
        ));
    }

    #[test]
    fn wait_count_guard() {
        let mut req = request(0, 0x100, 0x40);
        req.expect_completions(1);
        req.consume_completion().unwrap();
        // duplicate completion callback
        assert!(matches!(
            req.consume_completion(),
            Err(RaidError::Unexpected(_))
        ));
    }

    #[test]
    fn checkpoint_orders_abort_over_quiesce() {
        let mut req = request(0, 0x100, 0x40);
        assert_eq!(req.checkpoint(), None);
        req.quiesced = true;
        assert_eq!(req.checkpoint(), Some(CheckpointStop::Quiesced));
        req.aborted = true;
        assert_eq!(req.checkpoint(), Some(CheckpointStop::Aborted));
    }

    #[test]
    fn checkpoint_expires() {
        let mut req = request(0, 0x100, 0x40);
        req.config.expiration = Duration::ZERO;
        assert_eq!(req.checkpoint(), Some(CheckpointStop::Expired));
    }

    #[test]
    fn error_status_mapping() {
        assert_eq!(
            block_status_for_error(&RaidError::Aborted),
            BlockStatus::Aborted
        );
        assert_eq!(
            block_status_for_error(&RaidError::MediaError { lba: 0, blocks: 0, positions: 0 }),
            BlockStatus::MediaError
        );
        assert_eq!(
            block_status_for_error(&RaidError::Unexpected("x".into())),
            BlockStatus::UnexpectedError
        );
        assert_eq!(
            block_status_for_error(&RaidError::TooManyDead { dead: 0b11, width: 2 }),
            BlockStatus::DeadError
        );
    }
}

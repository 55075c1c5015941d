#![forbid(unsafe_code)]
//! Collaborator interfaces for the mirror engine.
//!
//! The engine owns sequencing and policy; everything that touches real
//! hardware or sector mathematics is behind one of four narrow traits:
//!
//! - [`BufferArena`] — per-request buffer allocation, possibly deferred.
//! - [`BlockTransport`] — issues a fru chain to the member drives and
//!   surfaces per-fru completions.
//! - [`XorEngine`] — checksum generation/validation, copy reconciliation,
//!   reconstruction, and sector invalidation.
//! - [`Topology`] — the live degraded/disabled view of the raid group.
//!
//! All traits are object-safe and `Send + Sync` so an orchestrator can share
//! one implementation across concurrently-active sub-requests.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use fraid_types::{BlockCount, FruOpcode, FruOutcome, Lba, PositionBitmask, RaidPosition};

// ── Buffers ─────────────────────────────────────────────────────────────────

/// Per-position data buffers for one sub-request.
///
/// Slot `i` holds position `i`'s buffer; rebuild keeps separate buffers for
/// source and destination positions because reconstruction may not read and
/// write the same memory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufferSet {
    buffers: [Option<Vec<u8>>; 3],
}

impl BufferSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, position: RaidPosition, buf: Vec<u8>) {
        if let Some(slot) = self.buffers.get_mut(position.0 as usize) {
            *slot = Some(buf);
        }
    }

    #[must_use]
    pub fn get(&self, position: RaidPosition) -> Option<&[u8]> {
        self.buffers.get(position.0 as usize)?.as_deref()
    }

    pub fn get_mut(&mut self, position: RaidPosition) -> Option<&mut Vec<u8>> {
        self.buffers.get_mut(position.0 as usize)?.as_mut()
    }

    /// Positions that currently hold a buffer.
    #[must_use]
    pub fn positions(&self) -> PositionBitmask {
        let mut mask = PositionBitmask::EMPTY;
        for (i, slot) in self.buffers.iter().enumerate() {
            if slot.is_some() {
                mask.insert(RaidPosition(i as u32));
            }
        }
        mask
    }
}

/// What a state machine asks the arena for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferRequest {
    /// Positions needing a buffer.
    pub positions: PositionBitmask,
    /// Blocks per buffer.
    pub blocks: BlockCount,
    /// Bytes per block, including checksum metadata.
    pub sector_size: usize,
}

/// Arena response. `Pending` means the arena will complete asynchronously;
/// the driver re-enters the state machine once [`BufferArena::take_ready`]
/// yields the set.
#[derive(Debug)]
pub enum AllocOutcome {
    Ready(BufferSet),
    Pending,
    Failed(String),
}

pub trait BufferArena: Send + Sync {
    fn allocate(&self, request: &BufferRequest) -> AllocOutcome;

    /// Claim a previously-`Pending` allocation, if it has completed.
    fn take_ready(&self) -> Option<BufferSet> {
        None
    }
}

// ── Transport ───────────────────────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("chain rejected: {0}")]
    Rejected(String),
}

/// One wire operation of a fru chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FruOp {
    pub position: RaidPosition,
    pub opcode: FruOpcode,
    pub lba: Lba,
    pub blocks: BlockCount,
    /// Payload for writes; `None` for reads and write-same.
    pub data: Option<Vec<u8>>,
}

/// Completion of one [`FruOp`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FruCompletion {
    pub position: RaidPosition,
    pub outcome: FruOutcome,
    /// Data for completed reads.
    pub data: Option<Vec<u8>>,
}

/// Issues fru chains to the member drives. Submission is always
/// asynchronous from the engine's point of view: `send_chain` only queues,
/// and completions are drained by the driver loop and fed back into the
/// state machine on re-entry.
pub trait BlockTransport: Send + Sync {
    fn send_chain(&self, request_id: u64, ops: Vec<FruOp>) -> Result<(), TransportError>;

    /// Completions that have arrived for `request_id` since the last drain.
    fn drain_completions(&self, request_id: u64) -> Vec<FruCompletion>;
}

// ── XOR / checksum engine ───────────────────────────────────────────────────

/// Outcome of a checksum/XOR pass over a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum XorStatus {
    NoError,
    ChecksumError,
    /// The buffer itself is unusable (arena corruption); always unexpected.
    BadMemory,
}

/// Kind of sector-level damage recorded in an error region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorRegionKind {
    Checksum,
    Media,
    Stamp,
    Invalidated,
}

/// One contiguous run of damaged sectors, kept for orchestrator diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRegion {
    pub lba: Lba,
    pub blocks: BlockCount,
    pub positions: PositionBitmask,
    pub kind: ErrorRegionKind,
}

/// Result of a reconcile or rebuild pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XorVerdict {
    /// Positions whose buffers were corrected in place and must be
    /// rewritten to media.
    pub needs_write: PositionBitmask,
    /// Positions whose damage could not be attributed or repaired.
    pub uncorrectable: PositionBitmask,
    /// Sector-level detail for diagnostics.
    pub error_regions: Vec<ErrorRegion>,
}

impl XorVerdict {
    #[must_use]
    pub fn clean() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.needs_write.is_empty() && self.uncorrectable.is_empty()
    }
}

/// Reason recorded when unrecoverable sectors are deliberately invalidated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidateReason {
    /// Source media error during a copy-style rebuild.
    CopySourceMediaError,
    /// Verify exhausted every live copy over the chunk.
    VerifyUnrecoverable,
}

/// Sector mathematics: validation, repair, reconstruction, invalidation.
///
/// Implementations interpret each position's buffer as `blocks` sectors of
/// the configured sector size (data plus trailing checksum/stamp metadata).
pub trait XorEngine: Send + Sync {
    /// Validate checksums over `positions`, generating fresh checksum and
    /// lba-stamp metadata when `generate_stamps` is set (standard mirrors;
    /// sparing groups skip generation).
    fn check_and_generate(
        &self,
        buffers: &mut BufferSet,
        positions: PositionBitmask,
        lba: Lba,
        blocks: BlockCount,
        generate_stamps: bool,
    ) -> XorStatus;

    /// Reconcile all live copies over the region: pick valid data, correct
    /// damaged copies in place, and report who needs a write-back.
    fn reconcile(
        &self,
        buffers: &mut BufferSet,
        live: PositionBitmask,
        lba: Lba,
        blocks: BlockCount,
    ) -> XorVerdict;

    /// Reconstruct `targets` from `sources` (separate buffers per position).
    fn rebuild(
        &self,
        buffers: &mut BufferSet,
        sources: PositionBitmask,
        targets: PositionBitmask,
        lba: Lba,
        blocks: BlockCount,
    ) -> XorVerdict;

    /// Write the well-known invalid pattern over the range, recording the
    /// reason code in each sector.
    fn invalidate_sectors(
        &self,
        buffers: &mut BufferSet,
        positions: PositionBitmask,
        lba: Lba,
        blocks: BlockCount,
        reason: InvalidateReason,
    );
}

// ── Topology ────────────────────────────────────────────────────────────────

/// Live degraded/disabled view of the raid group. Queried before every
/// dispatch because topology can change between state-machine steps.
pub trait Topology: Send + Sync {
    /// Live-but-stale positions requiring rebuild.
    fn degraded_bitmask(&self) -> PositionBitmask;

    /// Physically missing positions.
    fn disabled_bitmask(&self) -> PositionBitmask;

    /// Positions with full, unrestricted access.
    fn full_access_bitmask(&self) -> PositionBitmask;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_set_positions() {
        let mut set = BufferSet::new();
        assert_eq!(set.positions(), PositionBitmask::EMPTY);

        set.insert(RaidPosition(0), vec![0_u8; 8]);
        set.insert(RaidPosition(2), vec![0_u8; 8]);
        assert_eq!(set.positions(), PositionBitmask(0b101));
        assert!(set.get(RaidPosition(1)).is_none());
        assert_eq!(set.get(RaidPosition(2)).map(<[u8]>::len), Some(8));
    }

    #[test]
    fn buffer_set_mutation() {
        let mut set = BufferSet::new();
        set.insert(RaidPosition(1), vec![0_u8; 4]);
        set.get_mut(RaidPosition(1)).unwrap()[0] = 0xAA;
        assert_eq!(set.get(RaidPosition(1)).unwrap()[0], 0xAA);
    }

    #[test]
    fn verdict_cleanliness() {
        assert!(XorVerdict::clean().is_clean());
        let dirty = XorVerdict {
            needs_write: PositionBitmask(0b1),
            ..XorVerdict::default()
        };
        assert!(!dirty.is_clean());
    }

    #[test]
    fn error_region_serializes() {
        let region = ErrorRegion {
            lba: Lba(0x1000),
            blocks: BlockCount(0x40),
            positions: PositionBitmask(0b10),
            kind: ErrorRegionKind::Checksum,
        };
        let json = serde_json::to_string(&region).unwrap();
        assert!(json.contains("checksum"));
    }
}

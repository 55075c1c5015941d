#![forbid(unsafe_code)]
//! Core primitives for the FrankenRAID mirror engine.
//!
//! Everything here is a plain value type: unit-carrying newtypes for LBAs and
//! block counts, the fixed-width position bitmask used by every error-board
//! evaluation pass, and the status enums shared between the fru layer, the
//! error board, and the state machines. No I/O, no policy.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitAnd, BitOr};
use thiserror::Error;

/// Maximum number of member positions in a mirror raid group.
pub const MAX_MIRROR_WIDTH: u32 = 3;

/// Role index of the primary position in a position map.
pub const PRIMARY_ROLE: usize = 0;
/// Role index of the secondary position in a position map.
pub const SECONDARY_ROLE: usize = 1;
/// Role index of the tertiary position in a position map.
pub const TERTIARY_ROLE: usize = 2;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RangeError {
    #[error("invalid mirror width: {got} (expected {expected})")]
    InvalidWidth { got: u32, expected: &'static str },
    #[error("invalid position: {position} for width {width}")]
    InvalidPosition { position: u32, width: u32 },
    #[error("arithmetic overflow: {field}")]
    Overflow { field: &'static str },
}

/// Logical block address on the mirror's logical address space.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Lba(pub u64);

impl Lba {
    /// Add a block count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, count: BlockCount) -> Option<Self> {
        self.0.checked_add(count.0).map(Self)
    }

    /// Offset of `self` past `base`, returning `None` if `self < base`.
    #[must_use]
    pub fn checked_offset_from(self, base: Lba) -> Option<BlockCount> {
        self.0.checked_sub(base.0).map(BlockCount)
    }
}

/// Count of logical blocks.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct BlockCount(pub u64);

impl BlockCount {
    pub const ZERO: Self = Self(0);

    #[must_use]
    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Subtract, returning `None` on underflow.
    #[must_use]
    pub fn checked_sub(self, other: BlockCount) -> Option<Self> {
        self.0.checked_sub(other.0).map(Self)
    }

    #[must_use]
    pub fn min(self, other: BlockCount) -> Self {
        Self(self.0.min(other.0))
    }
}

impl fmt::Display for Lba {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Display for BlockCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Physical member position within the raid group (0-based).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RaidPosition(pub u32);

impl fmt::Display for RaidPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Validated mirror width (1..=3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Width(u32);

impl Width {
    /// Create a `Width` if `value` is in `[1, MAX_MIRROR_WIDTH]`.
    pub fn new(value: u32) -> Result<Self, RangeError> {
        if !(1..=MAX_MIRROR_WIDTH).contains(&value) {
            return Err(RangeError::InvalidWidth {
                got: value,
                expected: "1..=3",
            });
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    /// Iterate over the physical positions `0..width`.
    pub fn positions(self) -> impl Iterator<Item = RaidPosition> {
        (0..self.0).map(RaidPosition)
    }

    /// Bitmask with one bit set per position in the group.
    #[must_use]
    pub fn full_mask(self) -> PositionBitmask {
        PositionBitmask((1_u16 << self.0) - 1)
    }
}

impl fmt::Display for Width {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Bitmask keyed by raid-group position.
///
/// The mirror width never exceeds [`MAX_MIRROR_WIDTH`], so a `u16` matches the
/// original wire width with room to spare. All set-algebra the error board
/// needs lives here.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct PositionBitmask(pub u16);

impl PositionBitmask {
    pub const EMPTY: Self = Self(0);

    #[must_use]
    pub fn from_position(position: RaidPosition) -> Self {
        Self(1 << position.0)
    }

    #[must_use]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub fn contains(self, position: RaidPosition) -> bool {
        self.0 & (1 << position.0) != 0
    }

    pub fn insert(&mut self, position: RaidPosition) {
        self.0 |= 1 << position.0;
    }

    pub fn remove(&mut self, position: RaidPosition) {
        self.0 &= !(1 << position.0);
    }

    /// Number of positions present.
    #[must_use]
    pub fn count(self) -> u32 {
        self.0.count_ones()
    }

    /// Lowest position present, if any.
    #[must_use]
    pub fn first(self) -> Option<RaidPosition> {
        if self.0 == 0 {
            None
        } else {
            Some(RaidPosition(self.0.trailing_zeros()))
        }
    }

    /// Positions present, lowest first.
    pub fn iter(self) -> impl Iterator<Item = RaidPosition> {
        (0..u16::BITS).map(RaidPosition).filter(move |p| self.contains(*p))
    }

    /// Positions of `width` not present in `self`.
    #[must_use]
    pub fn invert(self, width: Width) -> Self {
        Self(!self.0 & width.full_mask().0)
    }

    /// Remove every position in `other`.
    #[must_use]
    pub fn difference(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }
}

impl BitOr for PositionBitmask {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitAnd for PositionBitmask {
    type Output = Self;
    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl fmt::Display for PositionBitmask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

// ── Opcodes and algorithms ──────────────────────────────────────────────────

/// Operation issued to a single member drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FruOpcode {
    Read,
    Write,
    /// Write-same: the transport replicates a zeroed block over the range.
    WriteSame,
}

/// Mirror algorithm selected at generate time.
///
/// The tag pins which state machine runs and which policy variants apply
/// (stamp generation, degraded-write acceptance, mining eligibility).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    Read,
    Write,
    /// Diagnostic fault injection: write exactly one position.
    CorruptData,
    Verify,
    /// Verify that reports but never writes back; remap is flagged instead.
    ReadOnlyVerify,
    /// Nested verify run by read/write when redundancy is exhausted.
    RecoveryVerify,
    Rebuild,
    /// Proactive-copy style rebuild; source media errors invalidate, not fail.
    Copy,
    Zero,
    Rekey,
}

impl Algorithm {
    /// Sparing groups (hot spare / proactive copy) do not own the
    /// checksum/stamp metadata contract.
    #[must_use]
    pub fn is_sparing(self) -> bool {
        matches!(self, Self::Copy)
    }

    #[must_use]
    pub fn is_verify_family(self) -> bool {
        matches!(self, Self::Verify | Self::ReadOnlyVerify | Self::RecoveryVerify)
    }
}

// ── Per-fru completion outcome ──────────────────────────────────────────────

/// Completion status of one fru request, as reported by the block transport.
///
/// `Waiting` means the completion has not arrived yet; the chain classifier
/// treats a chain with any `Waiting` member as still in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FruOutcome {
    #[default]
    Waiting,
    Success,
    /// The position is gone (drive removed or failed mid-request).
    Dead,
    /// Transient transport error; eligible for local retry.
    Retryable,
    /// Unreadable media over some part of the range.
    MediaError,
    /// The range carries a previously-invalidated sector pattern.
    InvalidatedMedia,
    Aborted,
}

// ── Terminal status of a sub-request ────────────────────────────────────────

/// Final block status reported to the orchestrator, one per sub-request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BlockStatus {
    /// Not yet terminal. Never reported upward.
    #[default]
    Invalid,
    Success,
    /// Data lost or unrecoverable over some sub-range.
    MediaError,
    /// Too many positions missing to satisfy the request.
    DeadError,
    /// The raid group as a whole can no longer accept I/O.
    ShutdownError,
    Aborted,
    /// The wall-clock budget ran out (mining loops honor this).
    Expired,
    /// Invariant violation; logged with context, never silently downgraded.
    UnexpectedError,
}

impl BlockStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        self != Self::Invalid
    }
}

/// Qualifier refining a terminal [`BlockStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BlockQualifier {
    #[default]
    None,
    /// Completed, but a sub-range should be remapped out-of-band.
    CompleteWithRemap,
    /// Completed with one or more degraded positions skipped.
    DegradedComplete,
    /// Completed after invalidating unrecoverable sectors.
    InvalidatedSectors,
}

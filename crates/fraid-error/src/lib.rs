#![forbid(unsafe_code)]
//! Error types for the FrankenRAID mirror engine.
//!
//! # Error Taxonomy
//!
//! The engine uses a three-layer error model:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Per-fru | `FruOutcome` | `fraid-types` | Raw completion status of one member-drive operation |
//! | Raid-level | `RaidStatus` | `fraid-eboard` | Policy verdict after classifying a completed chain |
//! | Runtime | `RaidError` | `fraid-error` (this crate) | Error surface for the orchestrator and harness |
//!
//! ## Boundary conversions
//!
//! `fraid-error` is intentionally independent of every other workspace crate
//! to avoid cyclic dependencies. Crate-local errors convert into `RaidError`
//! at their crate boundaries:
//!
//! | Source | Variant | Where converted |
//! |--------|---------|-----------------|
//! | `fraid-types::RangeError` | `Generate` | `fraid-mirror` generate/validate |
//! | `fraid-geometry::PositionError` | `Generate` / `Unexpected` | `fraid-mirror` (a failed swap during error recovery is an invariant violation, not bad input) |
//! | `fraid-fruts::FruError` | `Unexpected` | `fraid-mirror` (arena misuse is always a programming error) |
//! | `fraid-io::TransportError` | `Transport` | `fraid-mirror` dispatch paths |
//!
//! The mapping from `RaidError` to a terminal `BlockStatus` lives in
//! `fraid-mirror`, which depends on both this crate and `fraid-types`; the
//! mapping there is exhaustive so adding a variant here is a compile error
//! until its terminal status is assigned.
//!
//! ## Design constraints
//!
//! - `RaidError` MUST NOT depend on any other `fraid-*` crate.
//! - Bitmask payloads are carried as raw `u16` (the position-bitmask wire
//!   width) so diagnostics survive the crate boundary without a type import.
//! - All string payloads are owned (`String`).

use thiserror::Error;

/// Unified error type for all mirror-engine operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RaidError {
    /// The incoming sub-request failed generate-time validation.
    #[error("invalid request: {0}")]
    Generate(String),

    /// Too few live positions remain for the requested access mode.
    #[error("insufficient live positions: {live} live of width {width} (need {required})")]
    InsufficientLivePositions { live: u32, width: u32, required: u32 },

    /// The block transport rejected a chain submission outright.
    #[error("transport error: {0}")]
    Transport(String),

    /// The buffer arena reported a hard allocation failure.
    #[error("buffer allocation failed: {0}")]
    AllocationFailed(String),

    /// Data over some sub-range is lost or unrecoverable.
    ///
    /// `positions` is the raw position bitmask of members that contributed
    /// unrecoverable errors; the error-region log carries the sector detail.
    #[error("media error: lba {lba:#x} blocks {blocks:#x} positions {positions:#x}")]
    MediaError { lba: u64, blocks: u64, positions: u16 },

    /// Too many positions are gone to satisfy the request.
    #[error("too many dead positions: dead mask {dead:#x} of width {width}")]
    TooManyDead { dead: u16, width: u32 },

    /// The raid group as a whole can no longer accept I/O.
    #[error("raid group shutdown")]
    Shutdown,

    /// The request was aborted by the orchestrator.
    #[error("request aborted")]
    Aborted,

    /// The request exceeded its wall-clock budget.
    #[error("request expired")]
    Expired,

    /// Invariant violation. Always logged with full context by the caller;
    /// never retried, since retrying a corrupted state risks data damage.
    #[error("unexpected condition: {0}")]
    Unexpected(String),
}

/// Result alias using `RaidError`.
pub type Result<T> = std::result::Result<T, RaidError>;

impl RaidError {
    /// True for errors that may clear on a later attempt of the whole
    /// request (the orchestrator's retry policy keys off this).
    #[must_use]
    pub fn is_retryable_upstream(&self) -> bool {
        matches!(self, Self::Expired | Self::AllocationFailed(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_formatting() {
        let err = RaidError::MediaError {
            lba: 0x1000,
            blocks: 0x40,
            positions: 0b101,
        };
        assert_eq!(
            err.to_string(),
            "media error: lba 0x1000 blocks 0x40 positions 0x5"
        );

        let dead = RaidError::TooManyDead { dead: 0b111, width: 3 };
        assert_eq!(dead.to_string(), "too many dead positions: dead mask 0x7 of width 3");

        let gen = RaidError::Generate("parity_count exceeds xfer_count".into());
        assert!(gen.to_string().starts_with("invalid request:"));
    }

    #[test]
    fn upstream_retry_classification() {
        assert!(RaidError::Expired.is_retryable_upstream());
        assert!(RaidError::AllocationFailed("arena drained".into()).is_retryable_upstream());
        assert!(!RaidError::Shutdown.is_retryable_upstream());
        assert!(!RaidError::Unexpected("wait count mismatch".into()).is_retryable_upstream());
    }
}

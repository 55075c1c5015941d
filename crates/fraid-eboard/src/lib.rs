#![forbid(unsafe_code)]
//! Error board and mirror error-classification policy.
//!
//! The [`ErrorBoard`] is the transient per-request record of which positions
//! are degraded, disabled, errored, or owed a corrective write. It is rebuilt
//! on every evaluation pass — state machines call [`ErrorBoard::reset`] at
//! the top of each reconcile, accumulate fru outcomes and XOR verdicts into
//! it, then branch on the two classification layers:
//!
//! 1. [`classify_chain`] — one coarse [`FruErrorStatus`] per completed chain.
//! 2. [`process_error`] — the mirror-specific [`RaidStatus`] policy verdict
//!    the error branches dispatch on.
//!
//! The board is an owned value on the sub-request, never shared across
//! sub-requests.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, warn};

use fraid_types::{FruOutcome, PositionBitmask, RaidPosition, Width};

// ── The board ───────────────────────────────────────────────────────────────

/// Transient per-pass record of error bitmasks, keyed by raid-group position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ErrorBoard {
    /// Live but stale; requires rebuild over some range.
    pub degraded: PositionBitmask,
    /// Physically missing or inaccessible.
    pub disabled: PositionBitmask,
    /// Gone mid-request (transport reported the position dead).
    pub dead: PositionBitmask,
    /// Positions owed a corrective or reconstructed write.
    pub needs_write: PositionBitmask,
    /// Checksum/coherency errors the XOR engine could not attribute a fix to.
    pub uncorrectable: PositionBitmask,
    /// Unreadable media reported by the transport.
    pub hard_media: PositionBitmask,
    /// Transient errors eligible for local retry.
    pub retry: PositionBitmask,
    /// Ranges carrying a previously-invalidated sector pattern.
    pub invalidated: PositionBitmask,
}

impl ErrorBoard {
    /// Clear every mask. Called at the top of each evaluation pass.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Fold one fru completion into the board.
    pub fn accumulate(&mut self, position: RaidPosition, outcome: FruOutcome) {
        match outcome {
            FruOutcome::Waiting | FruOutcome::Success => {}
            FruOutcome::Dead => self.dead.insert(position),
            FruOutcome::Retryable => self.retry.insert(position),
            FruOutcome::MediaError => self.hard_media.insert(position),
            FruOutcome::InvalidatedMedia => self.invalidated.insert(position),
            FruOutcome::Aborted => {}
        }
    }

    /// Remove disabled positions from the needs-write mask, returning what
    /// was dropped. A disabled member cannot take a write; this is routine
    /// for degraded groups, logged rather than treated as an error.
    pub fn exclude_disabled_from_needs_write(&mut self) -> PositionBitmask {
        let dropped = self.needs_write & self.disabled;
        if !dropped.is_empty() {
            debug!(dropped = %dropped, "dropping disabled positions from needs-write");
            self.needs_write = self.needs_write.difference(self.disabled);
        }
        dropped
    }

    /// Positions with any error recorded this pass.
    #[must_use]
    pub fn errored(&self) -> PositionBitmask {
        self.dead | self.retry | self.hard_media | self.uncorrectable | self.invalidated
    }

    /// True when unreadable media and unattributable checksum damage overlap
    /// the same pass; the span must be isolated by region mining.
    #[must_use]
    pub fn requires_mining(&self) -> bool {
        !self.hard_media.is_empty() && !self.uncorrectable.is_empty()
    }
}

// ── Chain classification ────────────────────────────────────────────────────

/// Coarse status of one completed fru chain; the single signal every state
/// machine branches on after an I/O chain completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FruErrorStatus {
    Success,
    /// One or more positions gone, within redundancy.
    Dead,
    /// More positions gone than the group can tolerate.
    Shutdown,
    Retry,
    /// At least one completion has not arrived; evaluation must wait.
    Waiting,
    Aborted,
    /// Unrecoverable data was already invalidated on media.
    Invalidate,
    /// Needs the second-level [`process_error`] classification.
    HardError,
}

impl FruErrorStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Dead => "dead",
            Self::Shutdown => "shutdown",
            Self::Retry => "retry",
            Self::Waiting => "waiting",
            Self::Aborted => "aborted",
            Self::Invalidate => "invalidate",
            Self::HardError => "hard_error",
        }
    }
}

impl fmt::Display for FruErrorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scan a chain's outcomes and produce the coarse chain status.
///
/// `max_dead` is how many dead positions the access mode can tolerate
/// (redundancy remaining); more than that is a shutdown condition.
///
/// Priority: Waiting > Aborted > Shutdown > Dead > Retry > HardError >
/// Invalidate > Success. Waiting wins because no evaluation is sound while a
/// completion is still in flight.
pub fn classify_chain(
    outcomes: impl IntoIterator<Item = (RaidPosition, FruOutcome)>,
    max_dead: u32,
) -> FruErrorStatus {
    let mut dead_count = 0_u32;
    let mut saw_aborted = false;
    let mut saw_retry = false;
    let mut saw_hard = false;
    let mut saw_invalidate = false;

    for (_, outcome) in outcomes {
        match outcome {
            FruOutcome::Waiting => return FruErrorStatus::Waiting,
            FruOutcome::Aborted => saw_aborted = true,
            FruOutcome::Dead => dead_count += 1,
            FruOutcome::Retryable => saw_retry = true,
            FruOutcome::MediaError => saw_hard = true,
            FruOutcome::InvalidatedMedia => saw_invalidate = true,
            FruOutcome::Success => {}
        }
    }

    if saw_aborted {
        FruErrorStatus::Aborted
    } else if dead_count > max_dead {
        FruErrorStatus::Shutdown
    } else if dead_count > 0 {
        FruErrorStatus::Dead
    } else if saw_retry {
        FruErrorStatus::Retry
    } else if saw_hard {
        FruErrorStatus::HardError
    } else if saw_invalidate {
        FruErrorStatus::Invalidate
    } else {
        FruErrorStatus::Success
    }
}

// ── Second-level policy ─────────────────────────────────────────────────────

/// Raid-level verdict from [`process_error`]; the fine-grained signal every
/// state machine's error branch dispatches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RaidStatus {
    Ok,
    /// Acceptable degraded outcome (e.g. partial write failure on a member
    /// that is allowed to lag).
    OkToContinue,
    RetryPossible,
    /// The span must be isolated by single-strip region mining.
    MiningRequired,
    TooManyDead,
    /// Unrecoverable at the current (smallest) scope; data is lost.
    MediaErrorDetected,
    UnsupportedCondition,
    /// Invariant violation; reported up immediately, never retried.
    UnexpectedCondition,
}

impl RaidStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::OkToContinue => "ok_to_continue",
            Self::RetryPossible => "retry_possible",
            Self::MiningRequired => "mining_required",
            Self::TooManyDead => "too_many_dead",
            Self::MediaErrorDetected => "media_error_detected",
            Self::UnsupportedCondition => "unsupported_condition",
            Self::UnexpectedCondition => "unexpected_condition",
        }
    }
}

impl fmt::Display for RaidStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs to [`process_error`] beyond the board itself.
#[derive(Debug, Clone, Copy)]
pub struct ErrorContext {
    pub width: Width,
    /// Retries remain under the request's retry/expiration budget.
    pub retries_remaining: bool,
    /// The request is already mining at the minimum chunk size; a hard
    /// error here cannot be isolated any further.
    pub mining_at_min: bool,
    /// Degraded completion is acceptable (writes to a group that tolerates
    /// lagging members, zero requests, corrupt-data injection).
    pub degraded_acceptable: bool,
}

/// Apply mirror-specific policy to a `HardError`-classified pass.
///
/// The caller has already folded fru outcomes and any XOR verdict into the
/// board; this function only ranks what is there.
#[must_use]
pub fn process_error(board: &ErrorBoard, ctx: &ErrorContext) -> RaidStatus {
    // Retries that ran out of budget are as good as dead positions.
    let effective_dead = if ctx.retries_remaining {
        board.dead
    } else {
        board.dead | board.retry
    };
    let unusable = effective_dead | board.disabled;

    if unusable.count() >= ctx.width.get() {
        warn!(dead = %effective_dead, disabled = %board.disabled, "no usable positions remain");
        return RaidStatus::TooManyDead;
    }

    if !board.retry.is_empty() && ctx.retries_remaining {
        return RaidStatus::RetryPossible;
    }

    if board.requires_mining() || !board.hard_media.is_empty() {
        return if ctx.mining_at_min {
            RaidStatus::MediaErrorDetected
        } else {
            RaidStatus::MiningRequired
        };
    }

    if !board.invalidated.is_empty() {
        // Data was already invalidated on media; nothing smaller to isolate.
        return RaidStatus::MediaErrorDetected;
    }

    if !effective_dead.is_empty() {
        return if ctx.degraded_acceptable {
            RaidStatus::OkToContinue
        } else {
            RaidStatus::UnsupportedCondition
        };
    }

    RaidStatus::Ok
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pos(p: u32) -> RaidPosition {
        RaidPosition(p)
    }

    fn ctx(width: u32) -> ErrorContext {
        ErrorContext {
            width: Width::new(width).unwrap(),
            retries_remaining: true,
            mining_at_min: false,
            degraded_acceptable: false,
        }
    }

    #[test]
    fn accumulate_routes_outcomes() {
        let mut board = ErrorBoard::default();
        board.accumulate(pos(0), FruOutcome::Dead);
        board.accumulate(pos(1), FruOutcome::MediaError);
        board.accumulate(pos(2), FruOutcome::Retryable);
        board.accumulate(pos(2), FruOutcome::Success);

        assert_eq!(board.dead, PositionBitmask(0b001));
        assert_eq!(board.hard_media, PositionBitmask(0b010));
        assert_eq!(board.retry, PositionBitmask(0b100));
        assert_eq!(board.errored(), PositionBitmask(0b111));
    }

    #[test]
    fn reset_clears_everything() {
        let mut board = ErrorBoard::default();
        board.accumulate(pos(0), FruOutcome::Dead);
        board.needs_write.insert(pos(1));
        board.reset();
        assert_eq!(board, ErrorBoard::default());
    }

    #[test]
    fn needs_write_excludes_disabled() {
        let mut board = ErrorBoard::default();
        board.needs_write = PositionBitmask(0b011);
        board.disabled = PositionBitmask(0b010);

        let dropped = board.exclude_disabled_from_needs_write();
        assert_eq!(dropped, PositionBitmask(0b010));
        assert_eq!(board.needs_write, PositionBitmask(0b001));
        assert_eq!(board.needs_write & board.disabled, PositionBitmask::EMPTY);
    }

    #[test]
    fn classify_waiting_wins() {
        let status = classify_chain(
            vec![
                (pos(0), FruOutcome::Dead),
                (pos(1), FruOutcome::Waiting),
                (pos(2), FruOutcome::MediaError),
            ],
            2,
        );
        assert_eq!(status, FruErrorStatus::Waiting);
    }

    #[test]
    fn classify_priority_order() {
        assert_eq!(
            classify_chain(vec![(pos(0), FruOutcome::Aborted), (pos(1), FruOutcome::Dead)], 2),
            FruErrorStatus::Aborted
        );
        assert_eq!(
            classify_chain(
                vec![(pos(0), FruOutcome::Dead), (pos(1), FruOutcome::Retryable)],
                1
            ),
            FruErrorStatus::Dead
        );
        assert_eq!(
            classify_chain(
                vec![(pos(0), FruOutcome::Retryable), (pos(1), FruOutcome::MediaError)],
                1
            ),
            FruErrorStatus::Retry
        );
        assert_eq!(
            classify_chain(vec![(pos(0), FruOutcome::MediaError)], 1),
            FruErrorStatus::HardError
        );
        assert_eq!(
            classify_chain(vec![(pos(0), FruOutcome::InvalidatedMedia)], 1),
            FruErrorStatus::Invalidate
        );
        assert_eq!(
            classify_chain(vec![(pos(0), FruOutcome::Success)], 1),
            FruErrorStatus::Success
        );
    }

    #[test]
    fn classify_dead_beyond_tolerance_is_shutdown() {
        let outcomes = vec![(pos(0), FruOutcome::Dead), (pos(1), FruOutcome::Dead)];
        assert_eq!(classify_chain(outcomes.clone(), 1), FruErrorStatus::Shutdown);
        assert_eq!(classify_chain(outcomes, 2), FruErrorStatus::Dead);
    }

    #[test]
    fn process_error_too_many_dead() {
        let mut board = ErrorBoard::default();
        board.dead = PositionBitmask(0b01);
        board.disabled = PositionBitmask(0b10);
        assert_eq!(process_error(&board, &ctx(2)), RaidStatus::TooManyDead);
    }

    #[test]
    fn process_error_retry_budget() {
        let mut board = ErrorBoard::default();
        board.retry = PositionBitmask(0b01);

        assert_eq!(process_error(&board, &ctx(2)), RaidStatus::RetryPossible);

        // Exhausted budget escalates the retrying position to dead; with one
        // live member left on a 2-way mirror, a degraded-tolerant request
        // continues, an intolerant one cannot.
        let exhausted = ErrorContext { retries_remaining: false, ..ctx(2) };
        assert_eq!(process_error(&board, &exhausted), RaidStatus::UnsupportedCondition);

        let tolerant = ErrorContext { degraded_acceptable: true, ..exhausted };
        assert_eq!(process_error(&board, &tolerant), RaidStatus::OkToContinue);
    }

    #[test]
    fn process_error_mining_escalation() {
        let mut board = ErrorBoard::default();
        board.hard_media = PositionBitmask(0b01);
        board.uncorrectable = PositionBitmask(0b10);
        assert!(board.requires_mining());
        assert_eq!(process_error(&board, &ctx(2)), RaidStatus::MiningRequired);

        let at_min = ErrorContext { mining_at_min: true, ..ctx(2) };
        assert_eq!(process_error(&board, &at_min), RaidStatus::MediaErrorDetected);
    }

    #[test]
    fn process_error_degraded_write_continues() {
        let mut board = ErrorBoard::default();
        board.dead = PositionBitmask(0b10);
        let tolerant = ErrorContext { degraded_acceptable: true, ..ctx(2) };
        assert_eq!(process_error(&board, &tolerant), RaidStatus::OkToContinue);
    }

    #[test]
    fn process_error_clean_board_is_ok() {
        assert_eq!(process_error(&ErrorBoard::default(), &ctx(3)), RaidStatus::Ok);
    }
}

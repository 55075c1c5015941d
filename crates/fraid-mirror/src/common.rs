//! Helpers shared by every mirror state machine.
//!
//! The machines differ in policy, not plumbing: they all check the same
//! cooperative-cancellation points, request buffers the same way, issue fru
//! chains through the same transport call, and fold completions into the
//! error board identically. That plumbing lives here.

use tracing::{debug, info};

use fraid_eboard::{classify_chain, ErrorContext, FruErrorStatus};
use fraid_error::{RaidError, Result};
use fraid_fruts::ChainTag;
use fraid_io::{AllocOutcome, BufferRequest, FruOp};
use fraid_types::{
    Algorithm, BlockCount, BlockQualifier, BlockStatus, FruOpcode, FruOutcome, Lba,
    PositionBitmask, RaidPosition,
};

use crate::siots::{CheckpointStop, ParentRequest, SubRequest};
use crate::state::StepOutcome;
use crate::Collaborators;

/// Cooperative-cancellation point for states about to issue I/O.
///
/// Aborted and expired requests short-circuit to their terminal state;
/// quiesced requests park until explicitly resumed.
pub fn checkpoint(req: &mut SubRequest) -> Option<StepOutcome> {
    match req.checkpoint() {
        None => None,
        Some(CheckpointStop::Aborted) => {
            req.finish(BlockStatus::Aborted, BlockQualifier::None);
            Some(StepOutcome::Done)
        }
        Some(CheckpointStop::Expired) => {
            req.finish(BlockStatus::Expired, BlockQualifier::None);
            Some(StepOutcome::Done)
        }
        Some(CheckpointStop::Quiesced) => Some(StepOutcome::Waiting),
    }
}

/// Ask the arena for per-position buffers over the active range.
///
/// Returns `None` when the buffers are ready and the state may proceed, or
/// `Some(Waiting)` when the allocation was deferred.
pub fn request_buffers(
    req: &mut SubRequest,
    collab: &Collaborators,
    positions: PositionBitmask,
    blocks: BlockCount,
) -> Result<Option<StepOutcome>> {
    if req.awaiting_alloc {
        // A deferred allocation is already outstanding; asking the arena
        // again would duplicate it.
        return Ok(Some(StepOutcome::Waiting));
    }
    if req.buffers.is_some() {
        return Ok(None);
    }
    let request = BufferRequest {
        positions,
        blocks,
        sector_size: req.config.sector_size,
    };
    match collab.arena.allocate(&request) {
        AllocOutcome::Ready(buffers) => {
            req.buffers = Some(buffers);
            Ok(None)
        }
        AllocOutcome::Pending => {
            debug!(id = req.id, "buffer allocation deferred");
            req.awaiting_alloc = true;
            Ok(Some(StepOutcome::Waiting))
        }
        AllocOutcome::Failed(detail) => Err(RaidError::AllocationFailed(detail)),
    }
}

/// Issue every fru on `chain` to the transport as one chain.
///
/// An empty chain where one is required is a structural inconsistency.
pub fn issue_chain(
    req: &mut SubRequest,
    collab: &Collaborators,
    chain: ChainTag,
) -> Result<StepOutcome> {
    let mut ops = Vec::new();
    for fru in req.fruts.chain(chain) {
        let data = match fru.opcode {
            FruOpcode::Write => {
                let buf = req
                    .buffers
                    .as_ref()
                    .and_then(|b| b.get(fru.position))
                    .ok_or_else(|| {
                        RaidError::Unexpected(format!(
                            "write fru for position {} has no buffer",
                            fru.position
                        ))
                    })?;
                Some(buf.to_vec())
            }
            FruOpcode::Read | FruOpcode::WriteSame => None,
        };
        ops.push(FruOp {
            position: fru.position,
            opcode: fru.opcode,
            lba: fru.lba,
            blocks: fru.blocks,
            data,
        });
    }
    if ops.is_empty() {
        return Err(RaidError::Unexpected("empty fru chain at dispatch".into()));
    }

    let count = ops.len() as u32;
    collab
        .transport
        .send_chain(req.id, ops)
        .map_err(|e| RaidError::Transport(e.to_string()))?;
    req.expect_completions(count);
    debug!(id = req.id, ?chain, frus = count, lba = %req.parity_start, "chain issued");
    Ok(StepOutcome::Waiting)
}

/// Outcomes of a chain, position-keyed, for classification.
#[must_use]
pub fn chain_outcomes(req: &SubRequest, chain: ChainTag) -> Vec<(RaidPosition, FruOutcome)> {
    req.fruts
        .chain(chain)
        .map(|fru| (fru.position, fru.outcome))
        .collect()
}

/// Classify a completed chain, tolerating up to `max_dead` dead members.
#[must_use]
pub fn classify(req: &SubRequest, chain: ChainTag, max_dead: u32) -> FruErrorStatus {
    classify_chain(chain_outcomes(req, chain), max_dead)
}

/// Fold a completed chain's outcomes into the error board.
pub fn accumulate_chain(req: &mut SubRequest, chain: ChainTag) {
    let outcomes = chain_outcomes(req, chain);
    for (position, outcome) in outcomes {
        req.eboard.accumulate(position, outcome);
    }
}

/// Second-level classification context for the current pass.
#[must_use]
pub fn error_context(req: &SubRequest, degraded_acceptable: bool) -> ErrorContext {
    ErrorContext {
        width: req.width,
        retries_remaining: req.retry_count < req.config.retry_limit,
        mining_at_min: req.mining_at_min(),
        degraded_acceptable,
    }
}

/// Reset a chain's outcomes and reissue it, counting against the retry
/// budget.
pub fn retry_chain(
    req: &mut SubRequest,
    collab: &Collaborators,
    chain: ChainTag,
) -> Result<StepOutcome> {
    req.retry_count += 1;
    debug!(id = req.id, retry = req.retry_count, ?chain, "retrying chain");
    req.fruts.reset_outcomes(chain);
    issue_chain(req, collab, chain)
}

/// Media-error value carrying the active range and offending positions.
#[must_use]
pub fn media_error(req: &SubRequest) -> RaidError {
    RaidError::MediaError {
        lba: req.parity_start.0,
        blocks: req.parity_count.0,
        positions: (req.eboard.hard_media | req.eboard.uncorrectable | req.eboard.invalidated).0,
    }
}

/// Blocks covered by the active span (`parity_count`), as a byte length.
#[must_use]
pub fn active_span_bytes(req: &SubRequest) -> usize {
    (req.parity_count.0 as usize).saturating_mul(req.config.sector_size)
}

/// Slice of the host payload covering the active span.
pub fn host_slice(req: &SubRequest) -> Result<&[u8]> {
    let data = req
        .host_data
        .as_ref()
        .ok_or_else(|| RaidError::Unexpected("host data missing for write".into()))?;
    let offset_blocks = req
        .parity_start
        .checked_offset_from(req.start_lba)
        .ok_or_else(|| RaidError::Unexpected("active span precedes request start".into()))?;
    let start = (offset_blocks.0 as usize).saturating_mul(req.config.sector_size);
    let len = active_span_bytes(req);
    data.get(start..start + len)
        .ok_or_else(|| RaidError::Unexpected("host data shorter than active span".into()))
}

/// Dead-member tolerance for a read-style chain: every live member beyond
/// the first is redundancy.
#[must_use]
pub fn read_redundancy(req: &SubRequest) -> u32 {
    req.data_disks.saturating_sub(1)
}

// ── Nested recovery verify ──────────────────────────────────────────────────

/// High bit distinguishes a nested request's transport traffic from its
/// parent's.
const NESTED_ID_BIT: u64 = 1 << 63;

/// Spawn the nested recovery verify over `[lba, lba + blocks)`.
///
/// Nesting is strictly LIFO with depth one: a request that already ran its
/// recovery verify cannot run another.
pub fn start_recovery_verify(req: &mut SubRequest, lba: Lba, blocks: BlockCount) -> Result<()> {
    if req.nested.is_some() {
        return Err(RaidError::Unexpected(
            "recovery verify already ran for this request".into(),
        ));
    }
    info!(id = req.id, lba = %lba, blocks = %blocks, "starting recovery verify");
    let nested = SubRequest::new(
        req.id | NESTED_ID_BIT,
        Algorithm::RecoveryVerify,
        req.kind,
        req.config,
        req.width,
        lba,
        blocks,
    )?;
    req.nested = Some(Box::new(nested));
    Ok(())
}

/// Progress of the nested recovery verify after one dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NestedOutcome {
    Running(StepOutcome),
    Finished(BlockStatus),
}

/// Dispatch the nested recovery verify once.
///
/// The nested request runs against a scratch parent so its chunk progress
/// never counts toward the outer transfer; remap interest and error regions
/// do propagate. On completion the nested request stays attached (terminal)
/// as the marker that recovery already ran.
pub fn step_recovery_verify(
    req: &mut SubRequest,
    parent: &mut ParentRequest,
    collab: &Collaborators,
) -> Result<NestedOutcome> {
    let mut scratch = ParentRequest::default();
    let (outcome, finished) = {
        let nested = req
            .nested
            .as_deref_mut()
            .ok_or_else(|| RaidError::Unexpected("no nested recovery verify to step".into()))?;
        if nested.status.is_terminal() {
            (StepOutcome::Done, Some((nested.status, Vec::new())))
        } else {
            let outcome = crate::verify::step(nested, &mut scratch, collab)?;
            if outcome == StepOutcome::Done {
                let regions = std::mem::take(&mut nested.error_regions);
                (outcome, Some((nested.status, regions)))
            } else {
                (outcome, None)
            }
        }
    };
    if scratch.remap_needed {
        parent.remap_needed = true;
    }
    match finished {
        Some((status, regions)) => {
            req.error_regions.extend(regions);
            Ok(NestedOutcome::Finished(status))
        }
        None => Ok(NestedOutcome::Running(outcome)),
    }
}

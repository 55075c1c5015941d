//! Verify state machine.
//!
//! Reads every live copy of the active span, reconciles them through the
//! XOR engine, and writes corrections back to the damaged members. Runs
//! standalone (`Verify`, `ReadOnlyVerify`) and nested under read/write as
//! the recovery verify. When unreadable media and unattributable checksum
//! damage overlap, the span is isolated chunk by chunk through region
//! mining; a chunk that stays unrecoverable at the minimum chunk size has
//! its sectors deliberately invalidated so later reads fail
//! deterministically instead of returning stale data.

use tracing::{debug, info};

use fraid_eboard::{process_error, FruErrorStatus, RaidStatus};
use fraid_error::{RaidError, Result};
use fraid_fruts::{ChainTag, FruRequest};
use fraid_io::{ErrorRegion, ErrorRegionKind, InvalidateReason};
use fraid_types::{
    Algorithm, BlockQualifier, BlockStatus, FruOpcode, FruOutcome, PositionBitmask,
};

use crate::common;
use crate::generate;
use crate::siots::{ParentRequest, SubRequest};
use crate::state::{MachineState, StepOutcome, VerifyState};
use crate::Collaborators;

fn set_state(req: &mut SubRequest, state: VerifyState) {
    req.state = MachineState::Verify(state);
}

fn unexpected(e: impl std::fmt::Display) -> RaidError {
    RaidError::Unexpected(e.to_string())
}

pub fn step(
    req: &mut SubRequest,
    parent: &mut ParentRequest,
    collab: &Collaborators,
) -> Result<StepOutcome> {
    let MachineState::Verify(state) = req.state else {
        return Err(RaidError::Unexpected(
            "verify dispatch with a non-verify state".into(),
        ));
    };
    match state {
        VerifyState::Start => start(req, collab),
        VerifyState::Allocate => allocate(req, collab),
        VerifyState::IssueReads => issue_reads(req, collab),
        VerifyState::EvaluateReads => evaluate_reads(req, collab),
        VerifyState::Reconcile => reconcile(req, parent, collab),
        VerifyState::IssueWrites => issue_writes(req, collab),
        VerifyState::EvaluateWrites => evaluate_writes(req, collab),
        VerifyState::Advance => advance(req, parent),
    }
}

fn start(req: &mut SubRequest, collab: &Collaborators) -> Result<StepOutcome> {
    generate::validate(req)?;
    req.refresh_degraded(collab.topology.as_ref(), false, false)?;
    build_read_chain(req)?;
    set_state(req, VerifyState::Allocate);
    Ok(StepOutcome::Executing)
}

fn build_read_chain(req: &mut SubRequest) -> Result<()> {
    req.fruts.clear();
    for position in req.live_positions().iter() {
        let fru = FruRequest::new(position, FruOpcode::Read, req.parity_start, req.parity_count);
        req.fruts
            .insert(fru, ChainTag::ReadChain)
            .map_err(unexpected)?;
    }
    if req.fruts.chain_len(ChainTag::ReadChain) == 0 {
        return Err(RaidError::InsufficientLivePositions {
            live: 0,
            width: req.width.get(),
            required: 1,
        });
    }
    Ok(())
}

fn allocate(req: &mut SubRequest, collab: &Collaborators) -> Result<StepOutcome> {
    let positions = req.fruts.chain_positions(ChainTag::ReadChain);
    if let Some(wait) = common::request_buffers(req, collab, positions, req.parity_count)? {
        return Ok(wait);
    }
    set_state(req, VerifyState::IssueReads);
    Ok(StepOutcome::Executing)
}

fn issue_reads(req: &mut SubRequest, collab: &Collaborators) -> Result<StepOutcome> {
    if let Some(stop) = common::checkpoint(req) {
        return Ok(stop);
    }
    req.fruts
        .reinit_chain(ChainTag::ReadChain, req.parity_start, req.parity_count);
    let outcome = common::issue_chain(req, collab, ChainTag::ReadChain)?;
    set_state(req, VerifyState::EvaluateReads);
    Ok(outcome)
}

fn evaluate_reads(req: &mut SubRequest, collab: &Collaborators) -> Result<StepOutcome> {
    let max_dead = common::read_redundancy(req);
    match common::classify(req, ChainTag::ReadChain, max_dead) {
        FruErrorStatus::Waiting => return Ok(StepOutcome::Waiting),
        FruErrorStatus::Aborted => {
            req.finish(BlockStatus::Aborted, BlockQualifier::None);
            return Ok(StepOutcome::Done);
        }
        FruErrorStatus::Retry if req.retry_count < req.config.retry_limit => {
            return common::retry_chain(req, collab, ChainTag::ReadChain);
        }
        FruErrorStatus::Success
        | FruErrorStatus::Retry
        | FruErrorStatus::Dead
        | FruErrorStatus::Shutdown
        | FruErrorStatus::HardError
        | FruErrorStatus::Invalidate => {}
    }

    // Fresh board each pass; degraded/disabled are re-absorbed from the
    // live topology, everything else from this pass's outcomes.
    req.eboard.reset();
    req.refresh_degraded(collab.topology.as_ref(), false, false)?;
    common::accumulate_chain(req, ChainTag::ReadChain);

    // A member that died mid-pass stops being a verify participant.
    let dead = req.eboard.dead;
    for position in dead.iter() {
        req.fruts
            .move_to_chain(position, ChainTag::Unused)
            .map_err(unexpected)?;
    }

    set_state(req, VerifyState::Reconcile);
    Ok(StepOutcome::Executing)
}

/// Positions whose read completed with valid data in hand.
fn readable_positions(req: &SubRequest) -> PositionBitmask {
    let mut mask = PositionBitmask::EMPTY;
    for fru in req.fruts.chain(ChainTag::ReadChain) {
        if fru.outcome == FruOutcome::Success {
            mask.insert(fru.position);
        }
    }
    mask
}

fn reconcile(
    req: &mut SubRequest,
    parent: &mut ParentRequest,
    collab: &Collaborators,
) -> Result<StepOutcome> {
    if req.fruts.chain_len(ChainTag::ReadChain) == 0 {
        return Err(RaidError::TooManyDead {
            dead: (req.eboard.dead | req.eboard.disabled).0,
            width: req.width.get(),
        });
    }

    let readable = readable_positions(req);
    if readable.is_empty() {
        // Nothing trustworthy over the span: isolate before giving up.
        return mine_or_invalidate(req, parent, collab);
    }

    let verdict = {
        let buffers = req
            .buffers
            .as_mut()
            .ok_or_else(|| RaidError::Unexpected("reconcile without buffers".into()))?;
        collab
            .xor
            .reconcile(buffers, readable, req.parity_start, req.parity_count)
    };

    if !req.eboard.hard_media.is_empty() {
        req.error_regions.push(ErrorRegion {
            lba: req.parity_start,
            blocks: req.parity_count,
            positions: req.eboard.hard_media,
            kind: ErrorRegionKind::Media,
        });
    }
    req.error_regions.extend(verdict.error_regions.iter().copied());
    req.eboard.needs_write =
        req.eboard.needs_write | verdict.needs_write | req.eboard.hard_media;
    req.eboard.uncorrectable = req.eboard.uncorrectable | verdict.uncorrectable;

    if !req.eboard.uncorrectable.is_empty() {
        // No copy of the span is trustworthy; isolate before giving up.
        return mine_or_invalidate(req, parent, collab);
    }
    // Every damaged copy is repairable from a good one, so unreadable
    // members become remap writes instead of mining candidates.
    req.eboard.hard_media = PositionBitmask::EMPTY;

    let ctx = common::error_context(req, true);
    match process_error(&req.eboard, &ctx) {
        RaidStatus::Ok | RaidStatus::OkToContinue => {
            schedule_corrections(req, parent, readable)
        }
        RaidStatus::RetryPossible => {
            req.retry_count += 1;
            set_state(req, VerifyState::IssueReads);
            Ok(StepOutcome::Executing)
        }
        RaidStatus::MiningRequired | RaidStatus::MediaErrorDetected => {
            mine_or_invalidate(req, parent, collab)
        }
        RaidStatus::TooManyDead => Err(RaidError::TooManyDead {
            dead: (req.eboard.dead | req.eboard.disabled).0,
            width: req.width.get(),
        }),
        status @ (RaidStatus::UnsupportedCondition | RaidStatus::UnexpectedCondition) => Err(
            RaidError::Unexpected(format!("verify error classification: {status}")),
        ),
    }
}

/// Shrink to a mining chunk, or invalidate the chunk once mining cannot
/// shrink it any further.
fn mine_or_invalidate(
    req: &mut SubRequest,
    parent: &mut ParentRequest,
    collab: &Collaborators,
) -> Result<StepOutcome> {
    if !req.mining_at_min() {
        req.enter_region_mining()?;
        set_state(req, VerifyState::IssueReads);
        return Ok(StepOutcome::Executing);
    }

    let live = req.live_positions();
    info!(
        id = req.id,
        lba = %req.parity_start,
        blocks = %req.parity_count,
        positions = %live,
        "chunk unrecoverable at minimum scope; invalidating"
    );
    {
        let buffers = req
            .buffers
            .as_mut()
            .ok_or_else(|| RaidError::Unexpected("invalidation without buffers".into()))?;
        collab.xor.invalidate_sectors(
            buffers,
            live,
            req.parity_start,
            req.parity_count,
            InvalidateReason::VerifyUnrecoverable,
        );
    }
    req.error_regions.push(ErrorRegion {
        lba: req.parity_start,
        blocks: req.parity_count,
        positions: live,
        kind: ErrorRegionKind::Invalidated,
    });

    if req.algorithm == Algorithm::ReadOnlyVerify {
        parent.remap_needed = true;
        set_state(req, VerifyState::Advance);
        return Ok(StepOutcome::Executing);
    }
    chain_for_write(req, live)?;
    set_state(req, VerifyState::IssueWrites);
    Ok(StepOutcome::Executing)
}

fn schedule_corrections(
    req: &mut SubRequest,
    parent: &mut ParentRequest,
    readable: PositionBitmask,
) -> Result<StepOutcome> {
    req.eboard.exclude_disabled_from_needs_write();
    let needs = req.eboard.needs_write;
    if needs.is_empty() {
        set_state(req, VerifyState::Advance);
        return Ok(StepOutcome::Executing);
    }
    if req.algorithm == Algorithm::ReadOnlyVerify {
        debug!(id = req.id, positions = %needs, "corrections deferred to a later verify");
        parent.remap_needed = true;
        set_state(req, VerifyState::Advance);
        return Ok(StepOutcome::Executing);
    }

    req.qualifier = BlockQualifier::CompleteWithRemap;
    fill_missing_buffers(req, readable, needs)?;
    chain_for_write(req, needs)?;
    set_state(req, VerifyState::IssueWrites);
    Ok(StepOutcome::Executing)
}

/// Members that never returned data (unreadable media) get a copy of a good
/// member's reconciled buffer before the corrective write.
fn fill_missing_buffers(
    req: &mut SubRequest,
    readable: PositionBitmask,
    needs: PositionBitmask,
) -> Result<()> {
    let missing = needs.difference(readable);
    if missing.is_empty() {
        return Ok(());
    }
    let donor = readable
        .difference(req.eboard.uncorrectable)
        .first()
        .ok_or_else(|| RaidError::Unexpected("no donor copy for remap write".into()))?;
    let buffers = req
        .buffers
        .as_mut()
        .ok_or_else(|| RaidError::Unexpected("remap without buffers".into()))?;
    let data = buffers
        .get(donor)
        .ok_or_else(|| RaidError::Unexpected("donor position has no buffer".into()))?
        .to_vec();
    for position in missing.iter() {
        buffers.insert(position, data.clone());
    }
    Ok(())
}

/// Put `positions` on the write chain as writes over the active span.
fn chain_for_write(req: &mut SubRequest, positions: PositionBitmask) -> Result<()> {
    for position in positions.iter() {
        if req.fruts.get(position).is_some() {
            req.fruts
                .move_to_chain(position, ChainTag::WriteChain)
                .map_err(unexpected)?;
        } else {
            let fru =
                FruRequest::new(position, FruOpcode::Write, req.parity_start, req.parity_count);
            req.fruts
                .insert(fru, ChainTag::WriteChain)
                .map_err(unexpected)?;
        }
    }
    let (lba, blocks) = (req.parity_start, req.parity_count);
    for fru in req.fruts.chain_mut(ChainTag::WriteChain) {
        fru.opcode = FruOpcode::Write;
        fru.lba = lba;
        fru.blocks = blocks;
        fru.outcome = FruOutcome::Waiting;
    }
    Ok(())
}

fn issue_writes(req: &mut SubRequest, collab: &Collaborators) -> Result<StepOutcome> {
    if let Some(stop) = common::checkpoint(req) {
        return Ok(stop);
    }
    let outcome = common::issue_chain(req, collab, ChainTag::WriteChain)?;
    set_state(req, VerifyState::EvaluateWrites);
    Ok(outcome)
}

fn evaluate_writes(req: &mut SubRequest, collab: &Collaborators) -> Result<StepOutcome> {
    let members = req.fruts.chain_len(ChainTag::WriteChain);
    match common::classify(req, ChainTag::WriteChain, members.saturating_sub(1)) {
        FruErrorStatus::Waiting => Ok(StepOutcome::Waiting),
        FruErrorStatus::Aborted => {
            req.finish(BlockStatus::Aborted, BlockQualifier::None);
            Ok(StepOutcome::Done)
        }
        FruErrorStatus::Retry if req.retry_count < req.config.retry_limit => {
            common::retry_chain(req, collab, ChainTag::WriteChain)
        }
        FruErrorStatus::Success | FruErrorStatus::Dead | FruErrorStatus::Retry => {
            // A member dying during a correction write is just new
            // degradation; the correction stands on the survivors.
            common::accumulate_chain(req, ChainTag::WriteChain);
            set_state(req, VerifyState::Advance);
            Ok(StepOutcome::Executing)
        }
        FruErrorStatus::Shutdown => Err(RaidError::TooManyDead {
            dead: req.fruts.chain_positions(ChainTag::WriteChain).0,
            width: req.width.get(),
        }),
        FruErrorStatus::HardError | FruErrorStatus::Invalidate => {
            common::accumulate_chain(req, ChainTag::WriteChain);
            Err(common::media_error(req))
        }
    }
}

fn advance(req: &mut SubRequest, parent: &mut ParentRequest) -> Result<StepOutcome> {
    // Corrective writers become readers again for the next chunk.
    let writers = req.fruts.chain_positions(ChainTag::WriteChain);
    for position in writers.iter() {
        req.fruts
            .move_to_chain(position, ChainTag::ReadChain)
            .map_err(unexpected)?;
    }
    for fru in req.fruts.chain_mut(ChainTag::ReadChain) {
        fru.opcode = FruOpcode::Read;
    }

    let remaining = req.advance_region(parent)?;
    if remaining.is_zero() {
        let status = if req
            .error_regions
            .iter()
            .any(|r| r.kind == ErrorRegionKind::Invalidated)
        {
            BlockStatus::MediaError
        } else {
            BlockStatus::Success
        };
        let qualifier = req.qualifier;
        req.finish(status, qualifier);
        return Ok(StepOutcome::Done);
    }
    set_state(req, VerifyState::IssueReads);
    Ok(StepOutcome::Executing)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fraid_geometry::{MirrorConfig, MirrorKind};
    use fraid_types::{BlockCount, Lba, RaidPosition, Width};

    fn request() -> SubRequest {
        SubRequest::new(
            11,
            Algorithm::Verify,
            MirrorKind::Standard,
            MirrorConfig::default(),
            Width::new(2).unwrap(),
            Lba(0x4000),
            BlockCount(0x100),
        )
        .unwrap()
    }

    #[test]
    fn read_chain_covers_live_positions() {
        let mut req = request();
        req.eboard.degraded.insert(RaidPosition(1));
        req.data_disks = 1;
        build_read_chain(&mut req).unwrap();
        assert_eq!(
            req.fruts.chain_positions(ChainTag::ReadChain),
            PositionBitmask(0b01)
        );
    }

    #[test]
    fn readable_excludes_failed_members() {
        let mut req = request();
        build_read_chain(&mut req).unwrap();
        req.fruts
            .set_outcome(RaidPosition(0), FruOutcome::Success)
            .unwrap();
        req.fruts
            .set_outcome(RaidPosition(1), FruOutcome::MediaError)
            .unwrap();
        assert_eq!(readable_positions(&req), PositionBitmask(0b01));
    }

    #[test]
    fn chain_for_write_retargets_active_span() {
        let mut req = request();
        build_read_chain(&mut req).unwrap();
        chain_for_write(&mut req, PositionBitmask(0b10)).unwrap();

        assert_eq!(req.fruts.chain_len(ChainTag::WriteChain), 1);
        let fru = req.fruts.get(RaidPosition(1)).unwrap();
        assert_eq!(fru.opcode, FruOpcode::Write);
        assert_eq!(fru.lba, req.parity_start);
        assert_eq!(fru.outcome, FruOutcome::Waiting);
    }
}

//! Rebuild state machine.
//!
//! Reads the live sources over the active span, reconstructs the degraded
//! targets through the XOR engine, and writes the reconstruction out.
//! `Copy` is the sparing-group variant: the position map's primary is the
//! one source and the secondary the one destination, and a source media
//! error that survives region mining invalidates the destination sectors
//! and keeps going — a hot-spare copy must complete even over lost data.

use tracing::{debug, info};

use fraid_eboard::{process_error, FruErrorStatus, RaidStatus};
use fraid_error::{RaidError, Result};
use fraid_fruts::{ChainTag, FruRequest};
use fraid_io::{ErrorRegion, ErrorRegionKind, InvalidateReason};
use fraid_types::{
    Algorithm, BlockCount, BlockQualifier, BlockStatus, FruOpcode, FruOutcome, PositionBitmask,
    SECONDARY_ROLE,
};

use crate::common;
use crate::generate;
use crate::siots::{ParentRequest, SubRequest};
use crate::state::{MachineState, RebuildState, StepOutcome};
use crate::Collaborators;

fn set_state(req: &mut SubRequest, state: RebuildState) {
    req.state = MachineState::Rebuild(state);
}

fn unexpected(e: impl std::fmt::Display) -> RaidError {
    RaidError::Unexpected(e.to_string())
}

pub fn step(
    req: &mut SubRequest,
    parent: &mut ParentRequest,
    collab: &Collaborators,
) -> Result<StepOutcome> {
    let MachineState::Rebuild(state) = req.state else {
        return Err(RaidError::Unexpected(
            "rebuild dispatch with a non-rebuild state".into(),
        ));
    };
    match state {
        RebuildState::Start => start(req, parent, collab),
        RebuildState::Allocate => allocate(req, collab),
        RebuildState::IssueReads => issue_reads(req, collab),
        RebuildState::EvaluateReads => evaluate_reads(req, collab),
        RebuildState::Reconstruct => reconstruct(req, collab),
        RebuildState::IssueWrites => issue_writes(req, collab),
        RebuildState::EvaluateWrites => evaluate_writes(req, collab),
        RebuildState::Advance => advance(req, parent),
    }
}

/// Source and destination masks for this pass.
fn roles(req: &SubRequest) -> Result<(PositionBitmask, PositionBitmask)> {
    if req.algorithm == Algorithm::Copy {
        let mut sources = PositionBitmask::EMPTY;
        sources.insert(req.map.primary());
        let destination = req
            .map
            .position_for_role(SECONDARY_ROLE)
            .ok_or_else(|| RaidError::Unexpected("sparing group without a secondary".into()))?;
        let mut targets = PositionBitmask::EMPTY;
        targets.insert(destination);
        return Ok((sources, targets));
    }
    Ok((req.live_positions(), req.rebuild_targets()))
}

fn start(
    req: &mut SubRequest,
    parent: &mut ParentRequest,
    collab: &Collaborators,
) -> Result<StepOutcome> {
    generate::validate(req)?;
    req.refresh_degraded(collab.topology.as_ref(), false, false)?;

    let (sources, targets) = roles(req)?;
    if targets.is_empty() {
        // Nothing is degraded over this range; the checkpoint simply moves.
        debug!(id = req.id, lba = %req.start_lba, "no rebuild targets over range");
        parent.blocks_transferred =
            BlockCount(parent.blocks_transferred.0 + req.xfer_count.0);
        req.finish(BlockStatus::Success, BlockQualifier::None);
        return Ok(StepOutcome::Done);
    }
    if !(sources & targets).is_empty() {
        return Err(RaidError::Unexpected(
            "rebuild source and target masks overlap".into(),
        ));
    }

    req.fruts.clear();
    for position in sources.iter() {
        let fru = FruRequest::new(position, FruOpcode::Read, req.parity_start, req.parity_count);
        req.fruts
            .insert(fru, ChainTag::ReadChain)
            .map_err(unexpected)?;
    }
    for position in targets.iter() {
        let fru = FruRequest::new(position, FruOpcode::Write, req.parity_start, req.parity_count);
        req.fruts
            .insert(fru, ChainTag::WriteChain)
            .map_err(unexpected)?;
    }
    set_state(req, RebuildState::Allocate);
    Ok(StepOutcome::Executing)
}

fn allocate(req: &mut SubRequest, collab: &Collaborators) -> Result<StepOutcome> {
    let positions = req.fruts.chain_positions(ChainTag::ReadChain)
        | req.fruts.chain_positions(ChainTag::WriteChain);
    if let Some(wait) = common::request_buffers(req, collab, positions, req.parity_count)? {
        return Ok(wait);
    }
    set_state(req, RebuildState::IssueReads);
    Ok(StepOutcome::Executing)
}

fn issue_reads(req: &mut SubRequest, collab: &Collaborators) -> Result<StepOutcome> {
    if let Some(stop) = common::checkpoint(req) {
        return Ok(stop);
    }
    req.fruts
        .reinit_chain(ChainTag::ReadChain, req.parity_start, req.parity_count);
    let outcome = common::issue_chain(req, collab, ChainTag::ReadChain)?;
    set_state(req, RebuildState::EvaluateReads);
    Ok(outcome)
}

fn evaluate_reads(req: &mut SubRequest, collab: &Collaborators) -> Result<StepOutcome> {
    let sources = req.fruts.chain_len(ChainTag::ReadChain);
    match common::classify(req, ChainTag::ReadChain, sources.saturating_sub(1)) {
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

    let degraded = req.eboard.degraded;
    let disabled = req.eboard.disabled;
    req.eboard.reset();
    req.eboard.degraded = degraded;
    req.eboard.disabled = disabled;
    common::accumulate_chain(req, ChainTag::ReadChain);

    let dead = req.eboard.dead;
    for position in dead.iter() {
        req.fruts
            .move_to_chain(position, ChainTag::Unused)
            .map_err(unexpected)?;
    }

    set_state(req, RebuildState::Reconstruct);
    Ok(StepOutcome::Executing)
}

fn readable_sources(req: &SubRequest) -> PositionBitmask {
    let mut mask = PositionBitmask::EMPTY;
    for fru in req.fruts.chain(ChainTag::ReadChain) {
        if fru.outcome == FruOutcome::Success {
            mask.insert(fru.position);
        }
    }
    mask
}

fn reconstruct(req: &mut SubRequest, collab: &Collaborators) -> Result<StepOutcome> {
    if req.fruts.chain_len(ChainTag::ReadChain) == 0 {
        // Every source died; nothing to reconstruct from.
        return Err(RaidError::TooManyDead {
            dead: (req.eboard.dead | req.eboard.disabled).0,
            width: req.width.get(),
        });
    }
    let readable = readable_sources(req);
    let targets = req.fruts.chain_positions(ChainTag::WriteChain);

    if readable.is_empty() {
        return mine_or_invalidate(req, collab, targets);
    }

    let verdict = {
        let buffers = req
            .buffers
            .as_mut()
            .ok_or_else(|| RaidError::Unexpected("reconstruct without buffers".into()))?;
        collab
            .xor
            .rebuild(buffers, readable, targets, req.parity_start, req.parity_count)
    };
    req.error_regions.extend(verdict.error_regions.iter().copied());
    req.eboard.uncorrectable = req.eboard.uncorrectable | verdict.uncorrectable;

    if !req.eboard.uncorrectable.is_empty() {
        return mine_or_invalidate(req, collab, targets);
    }

    let ctx = common::error_context(req, true);
    match process_error(&req.eboard, &ctx) {
        RaidStatus::Ok | RaidStatus::OkToContinue => {
            req.fruts
                .reinit_chain(ChainTag::WriteChain, req.parity_start, req.parity_count);
            set_state(req, RebuildState::IssueWrites);
            Ok(StepOutcome::Executing)
        }
        RaidStatus::RetryPossible => {
            req.retry_count += 1;
            set_state(req, RebuildState::IssueReads);
            Ok(StepOutcome::Executing)
        }
        RaidStatus::MiningRequired | RaidStatus::MediaErrorDetected => {
            mine_or_invalidate(req, collab, targets)
        }
        RaidStatus::TooManyDead => Err(RaidError::TooManyDead {
            dead: (req.eboard.dead | req.eboard.disabled).0,
            width: req.width.get(),
        }),
        status @ (RaidStatus::UnsupportedCondition | RaidStatus::UnexpectedCondition) => Err(
            RaidError::Unexpected(format!("rebuild error classification: {status}")),
        ),
    }
}

/// Shrink to a mining chunk; once at the minimum, give the destination the
/// invalid pattern over the chunk and keep copying.
fn mine_or_invalidate(
    req: &mut SubRequest,
    collab: &Collaborators,
    targets: PositionBitmask,
) -> Result<StepOutcome> {
    if !req.mining_at_min() {
        req.enter_region_mining()?;
        set_state(req, RebuildState::IssueReads);
        return Ok(StepOutcome::Executing);
    }

    let failed = req.eboard.hard_media | req.eboard.uncorrectable;
    info!(
        id = req.id,
        lba = %req.parity_start,
        blocks = %req.parity_count,
        sources = %failed,
        "source unreadable at minimum scope; invalidating destination"
    );
    let reason = if req.algorithm == Algorithm::Copy {
        InvalidateReason::CopySourceMediaError
    } else {
        InvalidateReason::VerifyUnrecoverable
    };
    {
        let buffers = req
            .buffers
            .as_mut()
            .ok_or_else(|| RaidError::Unexpected("invalidation without buffers".into()))?;
        collab.xor.invalidate_sectors(
            buffers,
            targets,
            req.parity_start,
            req.parity_count,
            reason,
        );
    }
    if !failed.is_empty() {
        req.error_regions.push(ErrorRegion {
            lba: req.parity_start,
            blocks: req.parity_count,
            positions: failed,
            kind: ErrorRegionKind::Media,
        });
    }
    req.error_regions.push(ErrorRegion {
        lba: req.parity_start,
        blocks: req.parity_count,
        positions: targets,
        kind: ErrorRegionKind::Invalidated,
    });
    req.qualifier = BlockQualifier::InvalidatedSectors;

    req.fruts
        .reinit_chain(ChainTag::WriteChain, req.parity_start, req.parity_count);
    set_state(req, RebuildState::IssueWrites);
    Ok(StepOutcome::Executing)
}

fn issue_writes(req: &mut SubRequest, collab: &Collaborators) -> Result<StepOutcome> {
    if let Some(stop) = common::checkpoint(req) {
        return Ok(stop);
    }
    let outcome = common::issue_chain(req, collab, ChainTag::WriteChain)?;
    set_state(req, RebuildState::EvaluateWrites);
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
            common::accumulate_chain(req, ChainTag::WriteChain);
            set_state(req, RebuildState::Advance);
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
    let remaining = req.advance_region(parent)?;
    if remaining.is_zero() {
        let qualifier = req.qualifier;
        req.finish(BlockStatus::Success, qualifier);
        return Ok(StepOutcome::Done);
    }
    set_state(req, RebuildState::IssueReads);
    Ok(StepOutcome::Executing)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fraid_geometry::{MirrorConfig, MirrorKind, SparingPreference};
    use fraid_types::{Lba, RaidPosition, Width};

    #[test]
    fn copy_roles_follow_the_map() {
        let req = SubRequest::new(
            5,
            Algorithm::Copy,
            MirrorKind::Sparing(SparingPreference::SecondaryFirst),
            MirrorConfig::default(),
            Width::new(2).unwrap(),
            Lba(0),
            BlockCount(0x40),
        )
        .unwrap();
        let (sources, targets) = roles(&req).unwrap();
        assert!(sources.contains(RaidPosition(1)));
        assert!(targets.contains(RaidPosition(0)));
        assert!((sources & targets).is_empty());
    }

    #[test]
    fn rebuild_roles_split_live_and_degraded() {
        let mut req = SubRequest::new(
            6,
            Algorithm::Rebuild,
            MirrorKind::Standard,
            MirrorConfig::default(),
            Width::new(3).unwrap(),
            Lba(0),
            BlockCount(0x40),
        )
        .unwrap();
        req.eboard.degraded.insert(RaidPosition(2));
        let (sources, targets) = roles(&req).unwrap();
        assert_eq!(sources, PositionBitmask(0b011));
        assert_eq!(targets, PositionBitmask(0b100));
    }
}

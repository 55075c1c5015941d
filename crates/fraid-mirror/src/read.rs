//! Read state machine.
//!
//! A mirror read touches exactly one member: the primary role of the
//! position map. Checksum damage or a fru error switches the primary to the
//! next untried live member and re-reads; once every live member has been
//! tried the machine nests a recovery verify over the range, and a re-read
//! after recovery that still fails is a genuine media error.

use tracing::debug;

use fraid_eboard::FruErrorStatus;
use fraid_error::{RaidError, Result};
use fraid_fruts::{ChainTag, FruRequest};
use fraid_geometry::MirrorKind;
use fraid_io::{ErrorRegion, ErrorRegionKind, XorStatus};
use fraid_types::{
    BlockCount, BlockQualifier, BlockStatus, FruOpcode, PositionBitmask, RaidPosition,
};

use crate::common::{self, NestedOutcome};
use crate::generate;
use crate::siots::{ParentRequest, SubRequest};
use crate::state::{MachineState, ReadState, StepOutcome};
use crate::Collaborators;

fn set_state(req: &mut SubRequest, state: ReadState) {
    req.state = MachineState::Read(state);
}

pub fn step(
    req: &mut SubRequest,
    parent: &mut ParentRequest,
    collab: &Collaborators,
) -> Result<StepOutcome> {
    let MachineState::Read(state) = req.state else {
        return Err(RaidError::Unexpected(
            "read dispatch with a non-read state".into(),
        ));
    };
    match state {
        ReadState::Start => start(req, collab),
        ReadState::Allocate => allocate(req, collab),
        ReadState::IssueReads => issue_reads(req, collab),
        ReadState::EvaluateReads => evaluate_reads(req, parent, collab),
        ReadState::RecoveryVerify => recovery_verify(req, parent, collab),
    }
}

fn start(req: &mut SubRequest, collab: &Collaborators) -> Result<StepOutcome> {
    generate::validate(req)?;
    req.refresh_degraded(collab.topology.as_ref(), false, false)?;
    let source = choose_source(req)?;
    set_source_fru(req, collab, source)?;
    set_state(req, ReadState::Allocate);
    Ok(StepOutcome::Executing)
}

/// Current primary if live, otherwise swap the primary role to the first
/// live member.
fn choose_source(req: &mut SubRequest) -> Result<RaidPosition> {
    let live = req.live_positions();
    if live.contains(req.map.primary()) {
        return Ok(req.map.primary());
    }
    let alt = live
        .first()
        .ok_or(RaidError::InsufficientLivePositions {
            live: 0,
            width: req.width.get(),
            required: 1,
        })?;
    req.map
        .swap_primary(alt)
        .map_err(|e| RaidError::Unexpected(e.to_string()))?;
    Ok(alt)
}

fn set_source_fru(
    req: &mut SubRequest,
    collab: &Collaborators,
    source: RaidPosition,
) -> Result<()> {
    req.fruts.clear();
    let mut fru = FruRequest::new(source, FruOpcode::Read, req.parity_start, req.parity_count);
    // Load-distribution placement only applies to a fully live standard
    // mirror whose source carries no access restriction; anything else pins
    // the read to the chosen source.
    fru.optimize = matches!(req.kind, MirrorKind::Standard)
        && req.live_positions() == req.width.full_mask()
        && collab.topology.full_access_bitmask().contains(source);
    req.fruts
        .insert(fru, ChainTag::ReadChain)
        .map_err(|e| RaidError::Unexpected(e.to_string()))?;
    req.tried_positions.insert(source);
    Ok(())
}

fn allocate(req: &mut SubRequest, collab: &Collaborators) -> Result<StepOutcome> {
    let positions = req.fruts.chain_positions(ChainTag::ReadChain);
    if let Some(wait) = common::request_buffers(req, collab, positions, req.parity_count)? {
        return Ok(wait);
    }
    set_state(req, ReadState::IssueReads);
    Ok(StepOutcome::Executing)
}

fn issue_reads(req: &mut SubRequest, collab: &Collaborators) -> Result<StepOutcome> {
    if let Some(stop) = common::checkpoint(req) {
        return Ok(stop);
    }
    let outcome = common::issue_chain(req, collab, ChainTag::ReadChain)?;
    set_state(req, ReadState::EvaluateReads);
    Ok(outcome)
}

fn evaluate_reads(
    req: &mut SubRequest,
    parent: &mut ParentRequest,
    collab: &Collaborators,
) -> Result<StepOutcome> {
    match common::classify(req, ChainTag::ReadChain, 0) {
        FruErrorStatus::Waiting => return Ok(StepOutcome::Waiting),
        FruErrorStatus::Aborted => {
            req.finish(BlockStatus::Aborted, BlockQualifier::None);
            return Ok(StepOutcome::Done);
        }
        FruErrorStatus::Success => {
            if let Some(done) = validate_data(req, parent, collab)? {
                return Ok(done);
            }
            // checksum damage recorded; fall through to the source switch
        }
        FruErrorStatus::Retry if req.retry_count < req.config.retry_limit => {
            return common::retry_chain(req, collab, ChainTag::ReadChain);
        }
        FruErrorStatus::Retry
        | FruErrorStatus::Dead
        | FruErrorStatus::Shutdown
        | FruErrorStatus::HardError
        | FruErrorStatus::Invalidate => {}
    }
    common::accumulate_chain(req, ChainTag::ReadChain);
    next_source(req, collab)
}

/// Checksum-validate the returned data; on success the request is terminal.
/// Returns `None` when the copy is damaged and another source is needed.
fn validate_data(
    req: &mut SubRequest,
    parent: &mut ParentRequest,
    collab: &Collaborators,
) -> Result<Option<StepOutcome>> {
    let mask = req.fruts.chain_positions(ChainTag::ReadChain);
    let buffers = req
        .buffers
        .as_mut()
        .ok_or_else(|| RaidError::Unexpected("read completed without buffers".into()))?;
    let status =
        collab
            .xor
            .check_and_generate(buffers, mask, req.parity_start, req.parity_count, false);
    match status {
        XorStatus::NoError => {
            parent.blocks_transferred =
                BlockCount(parent.blocks_transferred.0 + req.xfer_count.0);
            req.finish(BlockStatus::Success, BlockQualifier::None);
            Ok(Some(StepOutcome::Done))
        }
        XorStatus::ChecksumError => {
            debug!(id = req.id, positions = %mask, "read source failed checksum validation");
            req.eboard.uncorrectable = req.eboard.uncorrectable | mask;
            req.error_regions.push(ErrorRegion {
                lba: req.parity_start,
                blocks: req.parity_count,
                positions: mask,
                kind: ErrorRegionKind::Checksum,
            });
            Ok(None)
        }
        XorStatus::BadMemory => Err(RaidError::Unexpected(
            "buffer memory fault during read validation".into(),
        )),
    }
}

/// Switch to the next untried live source, or nest a recovery verify when
/// every source has been tried.
fn next_source(req: &mut SubRequest, collab: &Collaborators) -> Result<StepOutcome> {
    let untried = req.live_positions().difference(req.tried_positions);
    if let Some(alt) = untried.first() {
        debug!(id = req.id, new_source = %alt, "switching read source");
        req.map
            .swap_primary(alt)
            .map_err(|e| RaidError::Unexpected(e.to_string()))?;
        set_source_fru(req, collab, alt)?;
        set_state(req, ReadState::Allocate);
        return Ok(StepOutcome::Executing);
    }
    if req.nested.is_some() {
        // Recovery already ran once; the range is genuinely unreadable.
        return Err(common::media_error(req));
    }
    common::start_recovery_verify(req, req.parity_start, req.parity_count)?;
    set_state(req, ReadState::RecoveryVerify);
    Ok(StepOutcome::Executing)
}

fn recovery_verify(
    req: &mut SubRequest,
    parent: &mut ParentRequest,
    collab: &Collaborators,
) -> Result<StepOutcome> {
    match common::step_recovery_verify(req, parent, collab)? {
        NestedOutcome::Running(outcome) => Ok(outcome),
        NestedOutcome::Finished(BlockStatus::Success) => {
            // Repaired on media; re-read with a clean slate of sources.
            req.tried_positions = PositionBitmask::EMPTY;
            let source = choose_source(req)?;
            set_source_fru(req, collab, source)?;
            set_state(req, ReadState::Allocate);
            Ok(StepOutcome::Executing)
        }
        NestedOutcome::Finished(BlockStatus::MediaError) => Err(common::media_error(req)),
        NestedOutcome::Finished(status) => {
            req.finish(status, BlockQualifier::None);
            Ok(StepOutcome::Done)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fraid_geometry::MirrorConfig;
    use fraid_types::{Algorithm, Lba, Width};

    fn request() -> SubRequest {
        SubRequest::new(
            7,
            Algorithm::Read,
            MirrorKind::Standard,
            MirrorConfig::default(),
            Width::new(3).unwrap(),
            Lba(0x2000),
            BlockCount(0x80),
        )
        .unwrap()
    }

    #[test]
    fn choose_source_prefers_primary() {
        let mut req = request();
        assert_eq!(choose_source(&mut req).unwrap(), RaidPosition(0));
    }

    #[test]
    fn choose_source_swaps_when_primary_degraded() {
        let mut req = request();
        req.eboard.degraded.insert(RaidPosition(0));
        let source = choose_source(&mut req).unwrap();
        assert_eq!(source, RaidPosition(1));
        assert_eq!(req.map.primary(), RaidPosition(1));
    }

    #[test]
    fn choose_source_fails_with_no_live() {
        let mut req = request();
        req.eboard.disabled = req.width.full_mask();
        assert!(matches!(
            choose_source(&mut req),
            Err(RaidError::InsufficientLivePositions { .. })
        ));
    }
}

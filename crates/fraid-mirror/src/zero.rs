//! Zero state machine.
//!
//! Issues write-same over the whole range to every live member. No buffers
//! are allocated and no mining applies: the pattern is constant, so an
//! error either retries, completes degraded, or fails the request.

use fraid_eboard::{process_error, FruErrorStatus, RaidStatus};
use fraid_error::{RaidError, Result};
use fraid_fruts::{ChainTag, FruRequest};
use fraid_types::{BlockCount, BlockQualifier, BlockStatus, FruOpcode};

use crate::common;
use crate::generate;
use crate::siots::{ParentRequest, SubRequest};
use crate::state::{MachineState, StepOutcome, ZeroState};
use crate::Collaborators;

fn set_state(req: &mut SubRequest, state: ZeroState) {
    req.state = MachineState::Zero(state);
}

pub fn step(
    req: &mut SubRequest,
    parent: &mut ParentRequest,
    collab: &Collaborators,
) -> Result<StepOutcome> {
    let MachineState::Zero(state) = req.state else {
        return Err(RaidError::Unexpected(
            "zero dispatch with a non-zero state".into(),
        ));
    };
    match state {
        ZeroState::Start => start(req, collab),
        ZeroState::IssueWrites => issue_writes(req, collab),
        ZeroState::EvaluateWrites => evaluate_writes(req, parent, collab),
    }
}

fn start(req: &mut SubRequest, collab: &Collaborators) -> Result<StepOutcome> {
    generate::validate(req)?;
    req.refresh_degraded(collab.topology.as_ref(), true, true)?;

    req.fruts.clear();
    for position in req.live_positions().iter() {
        let fru =
            FruRequest::new(position, FruOpcode::WriteSame, req.start_lba, req.xfer_count);
        req.fruts
            .insert(fru, ChainTag::WriteChain)
            .map_err(|e| RaidError::Unexpected(e.to_string()))?;
    }
    if req.fruts.chain_len(ChainTag::WriteChain) == 0 {
        return Err(RaidError::InsufficientLivePositions {
            live: 0,
            width: req.width.get(),
            required: 1,
        });
    }
    set_state(req, ZeroState::IssueWrites);
    Ok(StepOutcome::Executing)
}

fn issue_writes(req: &mut SubRequest, collab: &Collaborators) -> Result<StepOutcome> {
    if let Some(stop) = common::checkpoint(req) {
        return Ok(stop);
    }
    let outcome = common::issue_chain(req, collab, ChainTag::WriteChain)?;
    set_state(req, ZeroState::EvaluateWrites);
    Ok(outcome)
}

fn evaluate_writes(
    req: &mut SubRequest,
    parent: &mut ParentRequest,
    collab: &Collaborators,
) -> Result<StepOutcome> {
    let members = req.fruts.chain_len(ChainTag::WriteChain);
    match common::classify(req, ChainTag::WriteChain, members.saturating_sub(1)) {
        FruErrorStatus::Waiting => return Ok(StepOutcome::Waiting),
        FruErrorStatus::Aborted => {
            req.finish(BlockStatus::Aborted, BlockQualifier::None);
            return Ok(StepOutcome::Done);
        }
        FruErrorStatus::Retry if req.retry_count < req.config.retry_limit => {
            return common::retry_chain(req, collab, ChainTag::WriteChain);
        }
        FruErrorStatus::Success => return complete(req, parent),
        FruErrorStatus::Retry
        | FruErrorStatus::Dead
        | FruErrorStatus::Shutdown
        | FruErrorStatus::HardError
        | FruErrorStatus::Invalidate => {}
    }
    common::accumulate_chain(req, ChainTag::WriteChain);

    let ctx = common::error_context(req, true);
    match process_error(&req.eboard, &ctx) {
        RaidStatus::Ok | RaidStatus::OkToContinue => complete(req, parent),
        RaidStatus::RetryPossible => common::retry_chain(req, collab, ChainTag::WriteChain),
        RaidStatus::TooManyDead => Err(RaidError::TooManyDead {
            dead: (req.eboard.dead | req.eboard.disabled).0,
            width: req.width.get(),
        }),
        RaidStatus::MiningRequired | RaidStatus::MediaErrorDetected => {
            Err(common::media_error(req))
        }
        status @ (RaidStatus::UnsupportedCondition | RaidStatus::UnexpectedCondition) => Err(
            RaidError::Unexpected(format!("zero error classification: {status}")),
        ),
    }
}

fn complete(req: &mut SubRequest, parent: &mut ParentRequest) -> Result<StepOutcome> {
    parent.blocks_transferred = BlockCount(parent.blocks_transferred.0 + req.xfer_count.0);
    let skipped = req.eboard.degraded | req.eboard.disabled | req.eboard.dead;
    let qualifier = if skipped.is_empty() {
        BlockQualifier::None
    } else {
        BlockQualifier::DegradedComplete
    };
    req.finish(BlockStatus::Success, qualifier);
    Ok(StepOutcome::Done)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fraid_geometry::{MirrorConfig, MirrorKind};
    use fraid_types::{Algorithm, Lba, RaidPosition, Width};

    #[test]
    fn zero_chain_skips_degraded_members() {
        let mut req = SubRequest::new(
            9,
            Algorithm::Zero,
            MirrorKind::Standard,
            MirrorConfig::default(),
            Width::new(3).unwrap(),
            Lba(0x1000),
            BlockCount(0x100),
        )
        .unwrap();
        req.eboard.degraded.insert(RaidPosition(1));

        req.fruts.clear();
        for position in req.live_positions().iter() {
            req.fruts
                .insert(
                    FruRequest::new(position, FruOpcode::WriteSame, req.start_lba, req.xfer_count),
                    ChainTag::WriteChain,
                )
                .unwrap();
        }
        assert_eq!(
            req.fruts.chain_positions(ChainTag::WriteChain),
            fraid_types::PositionBitmask(0b101)
        );
        for fru in req.fruts.chain(ChainTag::WriteChain) {
            assert_eq!(fru.opcode, FruOpcode::WriteSame);
            assert_eq!(fru.blocks, BlockCount(0x100));
        }
    }
}

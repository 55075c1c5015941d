//! Rekey state machine.
//!
//! Encryption rekey reads the range once from the primary, then rewrites it
//! to every live member so the transport re-encrypts each copy under the
//! new key. The read follows the same source-switching rules as a normal
//! read; the rewrite follows the degraded-tolerant write rules.

use tracing::debug;

use fraid_eboard::{process_error, FruErrorStatus, RaidStatus};
use fraid_error::{RaidError, Result};
use fraid_fruts::{ChainTag, FruRequest};
use fraid_geometry::MirrorKind;
use fraid_io::XorStatus;
use fraid_types::{
    BlockCount, BlockQualifier, BlockStatus, FruOpcode, FruOutcome, RaidPosition,
};

use crate::common;
use crate::generate;
use crate::siots::{ParentRequest, SubRequest};
use crate::state::{MachineState, RekeyState, StepOutcome};
use crate::Collaborators;

fn set_state(req: &mut SubRequest, state: RekeyState) {
    req.state = MachineState::Rekey(state);
}

fn unexpected(e: impl std::fmt::Display) -> RaidError {
    RaidError::Unexpected(e.to_string())
}

pub fn step(
    req: &mut SubRequest,
    parent: &mut ParentRequest,
    collab: &Collaborators,
) -> Result<StepOutcome> {
    let MachineState::Rekey(state) = req.state else {
        return Err(RaidError::Unexpected(
            "rekey dispatch with a non-rekey state".into(),
        ));
    };
    match state {
        RekeyState::Start => start(req, collab),
        RekeyState::Allocate => allocate(req, collab),
        RekeyState::IssueReads => issue_reads(req, collab),
        RekeyState::EvaluateReads => evaluate_reads(req, collab),
        RekeyState::IssueWrites => issue_writes(req, collab),
        RekeyState::EvaluateWrites => evaluate_writes(req, parent, collab),
    }
}

fn start(req: &mut SubRequest, collab: &Collaborators) -> Result<StepOutcome> {
    generate::validate(req)?;
    req.refresh_degraded(collab.topology.as_ref(), false, false)?;

    let live = req.live_positions();
    let source = if live.contains(req.map.primary()) {
        req.map.primary()
    } else {
        let alt = live.first().ok_or(RaidError::InsufficientLivePositions {
            live: 0,
            width: req.width.get(),
            required: 1,
        })?;
        req.map.swap_primary(alt).map_err(unexpected)?;
        alt
    };

    req.fruts.clear();
    for position in live.iter() {
        let (opcode, chain) = if position == source {
            (FruOpcode::Read, ChainTag::ReadChain)
        } else {
            (FruOpcode::Write, ChainTag::WriteChain)
        };
        req.fruts
            .insert(
                FruRequest::new(position, opcode, req.parity_start, req.parity_count),
                chain,
            )
            .map_err(unexpected)?;
    }
    req.tried_positions.insert(source);
    set_state(req, RekeyState::Allocate);
    Ok(StepOutcome::Executing)
}

fn allocate(req: &mut SubRequest, collab: &Collaborators) -> Result<StepOutcome> {
    let positions = req.fruts.chain_positions(ChainTag::ReadChain)
        | req.fruts.chain_positions(ChainTag::WriteChain);
    if let Some(wait) = common::request_buffers(req, collab, positions, req.parity_count)? {
        return Ok(wait);
    }
    set_state(req, RekeyState::IssueReads);
    Ok(StepOutcome::Executing)
}

fn issue_reads(req: &mut SubRequest, collab: &Collaborators) -> Result<StepOutcome> {
    if let Some(stop) = common::checkpoint(req) {
        return Ok(stop);
    }
    let outcome = common::issue_chain(req, collab, ChainTag::ReadChain)?;
    set_state(req, RekeyState::EvaluateReads);
    Ok(outcome)
}

fn evaluate_reads(req: &mut SubRequest, collab: &Collaborators) -> Result<StepOutcome> {
    match common::classify(req, ChainTag::ReadChain, 0) {
        FruErrorStatus::Waiting => return Ok(StepOutcome::Waiting),
        FruErrorStatus::Aborted => {
            req.finish(BlockStatus::Aborted, BlockQualifier::None);
            return Ok(StepOutcome::Done);
        }
        FruErrorStatus::Success => {
            let source = req
                .fruts
                .chain_positions(ChainTag::ReadChain)
                .first()
                .ok_or_else(|| RaidError::Unexpected("rekey read chain is empty".into()))?;
            let mask = req.fruts.chain_positions(ChainTag::ReadChain);
            let buffers = req
                .buffers
                .as_mut()
                .ok_or_else(|| RaidError::Unexpected("rekey read without buffers".into()))?;
            match collab.xor.check_and_generate(
                buffers,
                mask,
                req.parity_start,
                req.parity_count,
                false,
            ) {
                XorStatus::NoError => {
                    fan_out(req, source)?;
                    set_state(req, RekeyState::IssueWrites);
                    return Ok(StepOutcome::Executing);
                }
                XorStatus::ChecksumError => {
                    req.eboard.uncorrectable = req.eboard.uncorrectable | mask;
                    // fall through to the source switch
                }
                XorStatus::BadMemory => {
                    return Err(RaidError::Unexpected(
                        "buffer memory fault during rekey validation".into(),
                    ));
                }
            }
        }
        FruErrorStatus::Retry if req.retry_count < req.config.retry_limit => {
            return common::retry_chain(req, collab, ChainTag::ReadChain);
        }
        FruErrorStatus::Retry
        | FruErrorStatus::Dead
        | FruErrorStatus::Shutdown
        | FruErrorStatus::HardError
        | FruErrorStatus::Invalidate => {
            common::accumulate_chain(req, ChainTag::ReadChain);
        }
    }
    next_source(req)
}

/// Copy the validated source data into every writer's buffer.
fn fan_out(req: &mut SubRequest, source: RaidPosition) -> Result<()> {
    let writers = req.fruts.chain_positions(ChainTag::WriteChain);
    let buffers = req
        .buffers
        .as_mut()
        .ok_or_else(|| RaidError::Unexpected("rekey fan-out without buffers".into()))?;
    let data = buffers
        .get(source)
        .ok_or_else(|| RaidError::Unexpected("rekey source has no buffer".into()))?
        .to_vec();
    for position in writers.iter() {
        buffers.insert(position, data.clone());
    }
    // The source copy is rewritten too so it re-encrypts with the rest.
    req.fruts
        .move_to_chain(source, ChainTag::WriteChain)
        .map_err(unexpected)?;
    if let Some(fru) = req.fruts.get_mut(source) {
        fru.opcode = FruOpcode::Write;
        fru.outcome = FruOutcome::Waiting;
    }
    Ok(())
}

fn next_source(req: &mut SubRequest) -> Result<StepOutcome> {
    let current = req
        .fruts
        .chain_positions(ChainTag::ReadChain)
        .first()
        .ok_or_else(|| RaidError::Unexpected("rekey read chain is empty".into()))?;
    let untried = req.live_positions().difference(req.tried_positions);
    let Some(alt) = untried.first() else {
        return Err(common::media_error(req));
    };
    debug!(id = req.id, new_source = %alt, "switching rekey source");
    req.map.swap_primary(alt).map_err(unexpected)?;
    req.fruts
        .move_to_chain(current, ChainTag::WriteChain)
        .map_err(unexpected)?;
    req.fruts
        .move_to_chain(alt, ChainTag::ReadChain)
        .map_err(unexpected)?;
    let (lba, blocks) = (req.parity_start, req.parity_count);
    if let Some(fru) = req.fruts.get_mut(alt) {
        fru.opcode = FruOpcode::Read;
        fru.lba = lba;
        fru.blocks = blocks;
        fru.outcome = FruOutcome::Waiting;
    }
    if let Some(fru) = req.fruts.get_mut(current) {
        fru.opcode = FruOpcode::Write;
        fru.outcome = FruOutcome::Waiting;
    }
    req.tried_positions.insert(alt);
    set_state(req, RekeyState::IssueReads);
    Ok(StepOutcome::Executing)
}

fn issue_writes(req: &mut SubRequest, collab: &Collaborators) -> Result<StepOutcome> {
    if let Some(stop) = common::checkpoint(req) {
        return Ok(stop);
    }
    let outcome = common::issue_chain(req, collab, ChainTag::WriteChain)?;
    set_state(req, RekeyState::EvaluateWrites);
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
            RaidError::Unexpected(format!("rekey error classification: {status}")),
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
    use fraid_geometry::MirrorConfig;
    use fraid_io::BufferSet;
    use fraid_types::{Algorithm, Lba, PositionBitmask, Width};

    fn request() -> SubRequest {
        SubRequest::new(
            13,
            Algorithm::Rekey,
            MirrorKind::Standard,
            MirrorConfig::default(),
            Width::new(3).unwrap(),
            Lba(0x8000),
            BlockCount(0x40),
        )
        .unwrap()
    }

    #[test]
    fn fan_out_copies_source_to_every_writer() {
        let mut req = request();
        for position in [0_u32, 1, 2] {
            let (opcode, chain) = if position == 0 {
                (FruOpcode::Read, ChainTag::ReadChain)
            } else {
                (FruOpcode::Write, ChainTag::WriteChain)
            };
            req.fruts
                .insert(
                    FruRequest::new(
                        RaidPosition(position),
                        opcode,
                        req.parity_start,
                        req.parity_count,
                    ),
                    chain,
                )
                .unwrap();
        }
        let mut buffers = BufferSet::new();
        buffers.insert(RaidPosition(0), vec![0x5A; 64]);
        req.buffers = Some(buffers);

        fan_out(&mut req, RaidPosition(0)).unwrap();

        let buffers = req.buffers.as_ref().unwrap();
        for position in [1_u32, 2] {
            assert_eq!(buffers.get(RaidPosition(position)).unwrap(), &[0x5A; 64]);
        }
        // every live member is rewritten, the old source included
        assert_eq!(
            req.fruts.chain_positions(ChainTag::WriteChain),
            PositionBitmask(0b111)
        );
        assert_eq!(
            req.fruts.get(RaidPosition(0)).unwrap().opcode,
            FruOpcode::Write
        );
    }
}

//! Write state machine.
//!
//! A mirror write sends the same payload to every live member. When the
//! range does not cover whole multiples of the optimal block size, the
//! missing edges are pre-read from a live member, the payload is overlaid,
//! and the aligned span is written. `CorruptData` is the deliberate
//! single-member corruption used by error-injection tooling: it writes its
//! payload to exactly one member and skips stamp handling entirely.

use tracing::debug;

use fraid_eboard::{process_error, FruErrorStatus, RaidStatus};
use fraid_error::{RaidError, Result};
use fraid_fruts::{ChainTag, FruRequest};
use fraid_geometry::MirrorKind;
use fraid_io::{ErrorRegion, ErrorRegionKind, XorStatus};
use fraid_types::{
    Algorithm, BlockCount, BlockQualifier, BlockStatus, FruOpcode, FruOutcome, Lba,
    PositionBitmask,
};

use crate::common::{self, NestedOutcome};
use crate::generate;
use crate::siots::{ParentRequest, SubRequest};
use crate::state::{MachineState, StepOutcome, WriteState};
use crate::Collaborators;

fn set_state(req: &mut SubRequest, state: WriteState) {
    req.state = MachineState::Write(state);
}

fn unexpected(e: impl std::fmt::Display) -> RaidError {
    RaidError::Unexpected(e.to_string())
}

pub fn step(
    req: &mut SubRequest,
    parent: &mut ParentRequest,
    collab: &Collaborators,
) -> Result<StepOutcome> {
    let MachineState::Write(state) = req.state else {
        return Err(RaidError::Unexpected(
            "write dispatch with a non-write state".into(),
        ));
    };
    match state {
        WriteState::Start => start(req, collab),
        WriteState::Allocate => allocate(req, collab),
        WriteState::ValidateStamps => validate_stamps(req, collab),
        WriteState::IssuePreRead => issue_pre_read(req, collab),
        WriteState::CheckPreRead => check_pre_read(req, collab),
        WriteState::PreReadRecoveryVerify => pre_read_recovery(req, parent, collab),
        WriteState::IssueWrites => issue_writes(req, collab),
        WriteState::EvaluateWrites => evaluate_writes(req, parent, collab),
    }
}

/// Aligned span covering the write when the optimal block size demands it.
fn aligned_span(req: &SubRequest) -> (Lba, BlockCount) {
    let optimal = req.config.optimal_block_size;
    if optimal <= 1 {
        return (req.parity_start, req.parity_count);
    }
    let start = req.parity_start.0 - req.parity_start.0 % optimal;
    let end = (req.parity_start.0 + req.parity_count.0).div_ceil(optimal) * optimal;
    (Lba(start), BlockCount(end - start))
}

fn is_aligned(req: &SubRequest) -> bool {
    aligned_span(req) == (req.parity_start, req.parity_count)
}

fn write_targets(req: &SubRequest) -> PositionBitmask {
    if req.algorithm == Algorithm::CorruptData {
        let mut mask = PositionBitmask::EMPTY;
        mask.insert(req.map.primary());
        return mask;
    }
    req.live_positions()
}

fn start(req: &mut SubRequest, collab: &Collaborators) -> Result<StepOutcome> {
    generate::validate(req)?;
    req.refresh_degraded(collab.topology.as_ref(), true, true)?;

    let targets = write_targets(req);
    if targets.is_empty() {
        return Err(RaidError::InsufficientLivePositions {
            live: 0,
            width: req.width.get(),
            required: 1,
        });
    }
    let (lba, blocks) = aligned_span(req);
    build_chains(req, targets, lba, blocks)?;
    req.tried_positions = req.fruts.chain_positions(ChainTag::ReadChain);
    set_state(req, WriteState::Allocate);
    Ok(StepOutcome::Executing)
}

/// Write frus for every target; when unaligned, one target doubles as the
/// pre-read source and starts on the read chain.
fn build_chains(
    req: &mut SubRequest,
    targets: PositionBitmask,
    lba: Lba,
    blocks: BlockCount,
) -> Result<()> {
    req.fruts.clear();
    let pre_read_source = if is_aligned(req) {
        None
    } else {
        // Prefer an up-to-date live member as the edge source.
        let live = req.live_positions();
        Some(if live.contains(req.map.primary()) {
            req.map.primary()
        } else {
            live.first().ok_or(RaidError::InsufficientLivePositions {
                live: 0,
                width: req.width.get(),
                required: 1,
            })?
        })
    };
    for position in targets.iter() {
        let (opcode, chain) = if pre_read_source == Some(position) {
            (FruOpcode::Read, ChainTag::ReadChain)
        } else {
            (FruOpcode::Write, ChainTag::WriteChain)
        };
        req.fruts
            .insert(FruRequest::new(position, opcode, lba, blocks), chain)
            .map_err(unexpected)?;
    }
    Ok(())
}

fn allocate(req: &mut SubRequest, collab: &Collaborators) -> Result<StepOutcome> {
    let positions = req.fruts.chain_positions(ChainTag::ReadChain)
        | req.fruts.chain_positions(ChainTag::WriteChain);
    let (_, blocks) = aligned_span(req);
    if let Some(wait) = common::request_buffers(req, collab, positions, blocks)? {
        return Ok(wait);
    }
    if is_aligned(req) {
        set_state(req, WriteState::ValidateStamps);
    } else {
        set_state(req, WriteState::IssuePreRead);
    }
    Ok(StepOutcome::Executing)
}

fn issue_pre_read(req: &mut SubRequest, collab: &Collaborators) -> Result<StepOutcome> {
    if let Some(stop) = common::checkpoint(req) {
        return Ok(stop);
    }
    let outcome = common::issue_chain(req, collab, ChainTag::ReadChain)?;
    set_state(req, WriteState::CheckPreRead);
    Ok(outcome)
}

fn check_pre_read(req: &mut SubRequest, collab: &Collaborators) -> Result<StepOutcome> {
    match common::classify(req, ChainTag::ReadChain, 0) {
        FruErrorStatus::Waiting => return Ok(StepOutcome::Waiting),
        FruErrorStatus::Aborted => {
            req.finish(BlockStatus::Aborted, BlockQualifier::None);
            return Ok(StepOutcome::Done);
        }
        FruErrorStatus::Success => {
            let mask = req.fruts.chain_positions(ChainTag::ReadChain);
            let (lba, blocks) = aligned_span(req);
            let buffers = req
                .buffers
                .as_mut()
                .ok_or_else(|| RaidError::Unexpected("pre-read without buffers".into()))?;
            match collab.xor.check_and_generate(buffers, mask, lba, blocks, false) {
                XorStatus::NoError => {
                    set_state(req, WriteState::ValidateStamps);
                    return Ok(StepOutcome::Executing);
                }
                XorStatus::ChecksumError => {
                    req.eboard.uncorrectable = req.eboard.uncorrectable | mask;
                    req.error_regions.push(ErrorRegion {
                        lba,
                        blocks,
                        positions: mask,
                        kind: ErrorRegionKind::Checksum,
                    });
                    // fall through to the source switch
                }
                XorStatus::BadMemory => {
                    return Err(RaidError::Unexpected(
                        "buffer memory fault during pre-read validation".into(),
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
    next_pre_read_source(req)
}

/// Switch the pre-read to the next untried live member, or nest a recovery
/// verify over the aligned span once every member has been tried.
fn next_pre_read_source(req: &mut SubRequest) -> Result<StepOutcome> {
    let current = req
        .fruts
        .chain_positions(ChainTag::ReadChain)
        .first()
        .ok_or_else(|| RaidError::Unexpected("pre-read chain is empty".into()))?;
    let untried = req.live_positions().difference(req.tried_positions);
    if let Some(alt) = untried.first() {
        debug!(id = req.id, new_source = %alt, "switching pre-read source");
        // The failed source is still a write target; the replacement swaps
        // roles with it on the chains.
        req.fruts
            .move_to_chain(current, ChainTag::WriteChain)
            .map_err(unexpected)?;
        req.fruts
            .move_to_chain(alt, ChainTag::ReadChain)
            .map_err(unexpected)?;
        let (lba, blocks) = aligned_span(req);
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
        set_state(req, WriteState::IssuePreRead);
        return Ok(StepOutcome::Executing);
    }
    if req.nested.is_some() {
        return Err(common::media_error(req));
    }
    let (lba, blocks) = aligned_span(req);
    common::start_recovery_verify(req, lba, blocks)?;
    set_state(req, WriteState::PreReadRecoveryVerify);
    Ok(StepOutcome::Executing)
}

fn pre_read_recovery(
    req: &mut SubRequest,
    parent: &mut ParentRequest,
    collab: &Collaborators,
) -> Result<StepOutcome> {
    match common::step_recovery_verify(req, parent, collab)? {
        NestedOutcome::Running(outcome) => Ok(outcome),
        NestedOutcome::Finished(BlockStatus::Success) => {
            req.fruts.reset_outcomes(ChainTag::ReadChain);
            set_state(req, WriteState::IssuePreRead);
            Ok(StepOutcome::Executing)
        }
        NestedOutcome::Finished(BlockStatus::MediaError) => Err(common::media_error(req)),
        NestedOutcome::Finished(status) => {
            req.finish(status, BlockQualifier::None);
            Ok(StepOutcome::Done)
        }
    }
}

/// Build the per-member write images and stamp them.
fn validate_stamps(req: &mut SubRequest, collab: &Collaborators) -> Result<StepOutcome> {
    // A surviving pre-read source joins the writers now that its data is in.
    let readers = req.fruts.chain_positions(ChainTag::ReadChain);
    for position in readers.iter() {
        req.fruts
            .move_to_chain(position, ChainTag::WriteChain)
            .map_err(unexpected)?;
    }
    let (lba, blocks) = aligned_span(req);
    for fru in req.fruts.chain_mut(ChainTag::WriteChain) {
        fru.opcode = FruOpcode::Write;
        fru.lba = lba;
        fru.blocks = blocks;
        fru.outcome = FruOutcome::Waiting;
    }

    let writers = req.fruts.chain_positions(ChainTag::WriteChain);
    let image = write_image(req, readers)?;
    let buffers = req
        .buffers
        .as_mut()
        .ok_or_else(|| RaidError::Unexpected("write without buffers".into()))?;
    for position in writers.iter() {
        buffers.insert(position, image.clone());
    }

    if req.algorithm != Algorithm::CorruptData {
        // Sparing groups carry the source's stamps through unchanged.
        let generate = matches!(req.kind, MirrorKind::Standard);
        match collab
            .xor
            .check_and_generate(buffers, writers, lba, blocks, generate)
        {
            XorStatus::NoError => {}
            XorStatus::ChecksumError => {
                return Err(RaidError::Unexpected(
                    "host payload failed stamp validation".into(),
                ));
            }
            XorStatus::BadMemory => {
                return Err(RaidError::Unexpected(
                    "buffer memory fault during stamp generation".into(),
                ));
            }
        }
    }
    set_state(req, WriteState::IssueWrites);
    Ok(StepOutcome::Executing)
}

/// One member's write image over the aligned span: the host payload, with
/// pre-read edge data around it when the span was widened for alignment.
fn write_image(req: &SubRequest, pre_read_source: PositionBitmask) -> Result<Vec<u8>> {
    let payload = common::host_slice(req)?;
    if is_aligned(req) {
        return Ok(payload.to_vec());
    }
    let (lba, _) = aligned_span(req);
    let source = pre_read_source
        .first()
        .ok_or_else(|| RaidError::Unexpected("unaligned write without a pre-read".into()))?;
    let base = req
        .buffers
        .as_ref()
        .and_then(|b| b.get(source))
        .ok_or_else(|| RaidError::Unexpected("pre-read source has no buffer".into()))?;
    let offset = ((req.parity_start.0 - lba.0) as usize) * req.config.sector_size;
    let mut image = base.to_vec();
    let end = offset + payload.len();
    image
        .get_mut(offset..end)
        .ok_or_else(|| RaidError::Unexpected("pre-read buffer shorter than aligned span".into()))?
        .copy_from_slice(payload);
    Ok(image)
}

fn issue_writes(req: &mut SubRequest, collab: &Collaborators) -> Result<StepOutcome> {
    if let Some(stop) = common::checkpoint(req) {
        return Ok(stop);
    }
    let outcome = common::issue_chain(req, collab, ChainTag::WriteChain)?;
    set_state(req, WriteState::EvaluateWrites);
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

    if req.algorithm == Algorithm::CorruptData {
        // Injection wants one corrupted copy; a target that died or ran out
        // of retries never took the payload, so move to the next live member.
        let mut failed = req.eboard.dead;
        if req.retry_count >= req.config.retry_limit {
            failed = failed | req.eboard.retry;
        }
        let tried = req.tried_positions | failed;
        if !failed.is_empty() {
            if let Some(alt) = req.live_positions().difference(tried).first() {
                debug!(id = req.id, target = %alt, "moving corrupt-data target");
                req.tried_positions = tried;
                req.retry_count = 0;
                let mut mask = PositionBitmask::EMPTY;
                mask.insert(alt);
                let (lba, blocks) = aligned_span(req);
                build_chains(req, mask, lba, blocks)?;
                set_state(req, WriteState::Allocate);
                return Ok(StepOutcome::Executing);
            }
        }
    }

    // A corrupt-data pass that could not land its payload anywhere must not
    // report success, so degraded completion is reserved for real writes.
    let ctx = common::error_context(req, req.algorithm != Algorithm::CorruptData);
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
            RaidError::Unexpected(format!("write error classification: {status}")),
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
    use fraid_types::{Lba, RaidPosition, Width};

    fn request(start: u64, blocks: u64, optimal: u64) -> SubRequest {
        let config = MirrorConfig {
            optimal_block_size: optimal,
            sector_size: 8,
            ..MirrorConfig::default()
        };
        SubRequest::new(
            3,
            Algorithm::Write,
            MirrorKind::Standard,
            config,
            Width::new(2).unwrap(),
            Lba(start),
            BlockCount(blocks),
        )
        .unwrap()
        .with_host_data(vec![0xAB; (blocks as usize) * 8])
    }

    #[test]
    fn aligned_span_identity_for_unit_optimal() {
        let req = request(0x1001, 0x7, 1);
        assert_eq!(aligned_span(&req), (Lba(0x1001), BlockCount(0x7)));
        assert!(is_aligned(&req));
    }

    #[test]
    fn aligned_span_widens_both_edges() {
        let req = request(0x1001, 0x7, 0x10);
        assert_eq!(aligned_span(&req), (Lba(0x1000), BlockCount(0x10)));
        assert!(!is_aligned(&req));
    }

    #[test]
    fn aligned_request_stays_put() {
        let req = request(0x1000, 0x20, 0x10);
        assert!(is_aligned(&req));
    }

    #[test]
    fn unaligned_chains_split_reader_and_writers() {
        let mut req = request(0x1001, 0x7, 0x10);
        let targets = req.width.full_mask();
        let (lba, blocks) = aligned_span(&req);
        build_chains(&mut req, targets, lba, blocks).unwrap();

        assert_eq!(req.fruts.chain_len(ChainTag::ReadChain), 1);
        assert_eq!(req.fruts.chain_len(ChainTag::WriteChain), 1);
        let reader = req
            .fruts
            .chain(ChainTag::ReadChain)
            .next()
            .unwrap();
        assert_eq!(reader.opcode, FruOpcode::Read);
        assert_eq!(reader.lba, Lba(0x1000));
        assert_eq!(reader.blocks, BlockCount(0x10));
    }

    #[test]
    fn unaligned_image_overlays_payload_on_pre_read() {
        let mut req = request(0x1001, 0x7, 0x10);
        let targets = req.width.full_mask();
        build_chains(&mut req, targets, Lba(0x1000), BlockCount(0x10)).unwrap();

        let mut buffers = fraid_io::BufferSet::new();
        buffers.insert(RaidPosition(0), vec![0x11; 0x10 * 8]);
        req.buffers = Some(buffers);

        let mut source = PositionBitmask::EMPTY;
        source.insert(RaidPosition(0));
        let image = write_image(&req, source).unwrap();
        assert_eq!(image.len(), 0x10 * 8);
        // leading edge from the pre-read, payload in the middle, trailing
        // edge from the pre-read
        assert_eq!(image[0], 0x11);
        assert_eq!(image[8], 0xAB);
        assert_eq!(image[8 + 7 * 8 - 1], 0xAB);
        assert_eq!(image[8 + 7 * 8], 0x11);
    }

    #[test]
    fn corrupt_data_targets_single_member() {
        let mut req = request(0x1000, 0x10, 1);
        req.algorithm = Algorithm::CorruptData;
        assert_eq!(write_targets(&req).count(), 1);
    }
}

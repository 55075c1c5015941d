#![forbid(unsafe_code)]
//! Mirrored-redundancy engine: cooperative state machines for N-way mirrors.
//!
//! Given a sub-request against a mirror raid group (width 1–3), the engine
//! drives it to exactly one terminal status across the member drives,
//! handling degraded members, media/checksum errors, partial rebuilds, and
//! strip-wise region-mining recovery. Five state machines (read, write,
//! verify, rebuild, zero — plus the rekey variant) share the position-map,
//! error-board, and fru-chain utilities; verify and rebuild share the
//! region-mining policy, and read/write invoke verify nested as recovery
//! verify when redundancy is exhausted.
//!
//! # Execution model
//!
//! Single-threaded and cooperative: [`MirrorEngine::step`] runs one state
//! function to completion and returns [`StepOutcome`]. `Executing` means
//! "dispatch me again"; `Waiting` means allocation or a fru chain is in
//! flight and the driver must feed completions back
//! ([`MirrorEngine::pump`]) before re-entering. [`MirrorEngine::drive`]
//! wraps both into a run-to-park loop. Concurrency exists only across
//! sub-requests; within one, reads always complete before reconciliation
//! and writes are only issued after reconciliation computed the
//! needs-write mask.

pub mod common;
pub mod generate;
pub mod read;
pub mod rebuild;
pub mod rekey;
pub mod siots;
pub mod state;
pub mod verify;
pub mod write;
pub mod zero;

use std::sync::Arc;

use tracing::{debug, error};

use fraid_error::{RaidError, Result};
use fraid_io::{BlockTransport, BufferArena, FruCompletion, Topology, XorEngine};
use fraid_types::{Algorithm, BlockQualifier, BlockStatus};

pub use siots::{block_status_for_error, ParentRequest, SubRequest, TerminalReport};
pub use state::{MachineState, StepOutcome};

use fraid_fruts::ChainTag;

/// The external collaborators every state machine calls through.
#[derive(Clone)]
pub struct Collaborators {
    pub arena: Arc<dyn BufferArena>,
    pub transport: Arc<dyn BlockTransport>,
    pub xor: Arc<dyn XorEngine>,
    pub topology: Arc<dyn Topology>,
}

/// Result of a [`MirrorEngine::drive`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveOutcome {
    /// Terminal status reached; read the report off the sub-request.
    Complete(BlockStatus),
    /// Parked: waiting on an external completion or explicitly quiesced.
    Parked,
}

/// Entry point for the orchestrator: owns the collaborator handles and
/// dispatches sub-requests through their state machines.
pub struct MirrorEngine {
    collab: Collaborators,
}

impl MirrorEngine {
    #[must_use]
    pub fn new(collab: Collaborators) -> Self {
        Self { collab }
    }

    #[must_use]
    pub fn collaborators(&self) -> &Collaborators {
        &self.collab
    }

    // ── Per-algorithm entry points ──────────────────────────────────────

    pub fn start_read(&self, req: &mut SubRequest, parent: &mut ParentRequest) -> Result<DriveOutcome> {
        self.start(req, parent, Algorithm::Read)
    }

    pub fn start_write(&self, req: &mut SubRequest, parent: &mut ParentRequest) -> Result<DriveOutcome> {
        if req.algorithm != Algorithm::CorruptData {
            req.algorithm = Algorithm::Write;
        }
        let algorithm = req.algorithm;
        self.start(req, parent, algorithm)
    }

    pub fn start_verify(&self, req: &mut SubRequest, parent: &mut ParentRequest) -> Result<DriveOutcome> {
        if !req.algorithm.is_verify_family() {
            req.algorithm = Algorithm::Verify;
        }
        let algorithm = req.algorithm;
        self.start(req, parent, algorithm)
    }

    pub fn start_rebuild(&self, req: &mut SubRequest, parent: &mut ParentRequest) -> Result<DriveOutcome> {
        if req.algorithm != Algorithm::Copy {
            req.algorithm = Algorithm::Rebuild;
        }
        let algorithm = req.algorithm;
        self.start(req, parent, algorithm)
    }

    pub fn start_zero(&self, req: &mut SubRequest, parent: &mut ParentRequest) -> Result<DriveOutcome> {
        self.start(req, parent, Algorithm::Zero)
    }

    pub fn start_rekey(&self, req: &mut SubRequest, parent: &mut ParentRequest) -> Result<DriveOutcome> {
        self.start(req, parent, Algorithm::Rekey)
    }

    fn start(
        &self,
        req: &mut SubRequest,
        parent: &mut ParentRequest,
        algorithm: Algorithm,
    ) -> Result<DriveOutcome> {
        req.algorithm = algorithm;
        req.state = MachineState::for_algorithm(algorithm);
        self.drive(req, parent)
    }

    // ── Dispatch ────────────────────────────────────────────────────────

    /// Run one state function of the innermost active sub-request.
    pub fn step(&self, req: &mut SubRequest, parent: &mut ParentRequest) -> Result<StepOutcome> {
        if req.status.is_terminal() {
            return Ok(StepOutcome::Done);
        }
        if req.aborted {
            // Abort is honored between state functions even with a chain in
            // flight; late completions for this id stay with the transport.
            req.finish(BlockStatus::Aborted, BlockQualifier::None);
            return Ok(StepOutcome::Done);
        }
        let outcome = match req.state {
            MachineState::Read(_) => read::step(req, parent, &self.collab),
            MachineState::Write(_) => write::step(req, parent, &self.collab),
            MachineState::Verify(_) => verify::step(req, parent, &self.collab),
            MachineState::Rebuild(_) => rebuild::step(req, parent, &self.collab),
            MachineState::Zero(_) => zero::step(req, parent, &self.collab),
            MachineState::Rekey(_) => rekey::step(req, parent, &self.collab),
        };
        match outcome {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                // Every error maps to exactly one terminal status; the full
                // context is logged here, once.
                error!(
                    id = req.id,
                    algorithm = ?req.algorithm,
                    error = %err,
                    lba = %req.parity_start,
                    blocks = %req.parity_count,
                    "state machine error"
                );
                if let RaidError::MediaError { .. } = &err {
                    req.finish(BlockStatus::MediaError, BlockQualifier::None);
                } else {
                    req.finish(block_status_for_error(&err), BlockQualifier::None);
                }
                Ok(StepOutcome::Done)
            }
        }
    }

    /// Drive the sub-request until it parks or completes.
    pub fn drive(&self, req: &mut SubRequest, parent: &mut ParentRequest) -> Result<DriveOutcome> {
        loop {
            match self.step(req, parent)? {
                StepOutcome::Done => return Ok(DriveOutcome::Complete(req.status)),
                StepOutcome::Executing => {}
                StepOutcome::Waiting => {
                    if !self.pump(req)? {
                        return Ok(DriveOutcome::Parked);
                    }
                }
            }
        }
    }

    /// Move pending external completions into the innermost active
    /// sub-request (the nested recovery verify when one is running).
    /// Returns whether any progress was made.
    pub fn pump(&self, req: &mut SubRequest) -> Result<bool> {
        let nested_active = req
            .nested
            .as_ref()
            .is_some_and(|nested| !nested.status.is_terminal());
        if nested_active {
            if let Some(nested) = req.nested.as_deref_mut() {
                return self.pump_one(nested);
            }
        }
        self.pump_one(req)
    }

    fn pump_one(&self, active: &mut SubRequest) -> Result<bool> {
        if active.quiesced || active.aborted {
            // Abort still needs a dispatch to reach its terminal state, so
            // report progress; quiesce genuinely parks.
            return Ok(active.aborted);
        }

        if active.awaiting_alloc {
            if let Some(buffers) = self.collab.arena.take_ready() {
                debug!(id = active.id, "deferred allocation completed");
                active.buffers = Some(buffers);
                active.awaiting_alloc = false;
                return Ok(true);
            }
            return Ok(false);
        }

        let completions = self.collab.transport.drain_completions(active.id);
        if completions.is_empty() {
            return Ok(false);
        }
        apply_completions(active, completions)?;
        Ok(true)
    }
}

/// Record arrived completions on the fru arena and buffers.
///
/// Completions beyond the expected wait count indicate a duplicate callback;
/// the request is failed with `UnexpectedError` rather than re-evaluated.
fn apply_completions(req: &mut SubRequest, completions: Vec<FruCompletion>) -> Result<()> {
    for completion in completions {
        req.consume_completion()?;
        let position = completion.position;
        let on_read_chain = req.fruts.chain_of(position) == ChainTag::ReadChain;
        req.fruts
            .set_outcome(position, completion.outcome)
            .map_err(|e| RaidError::Unexpected(e.to_string()))?;
        if on_read_chain {
            if let (Some(data), Some(buffers)) = (completion.data, req.buffers.as_mut()) {
                buffers.insert(position, data);
            }
        }
    }
    Ok(())
}

//! State identifiers for the cooperating mirror state machines.
//!
//! Each machine is a closed enum of states plus a single `step` dispatcher
//! (in its own module) that matches exhaustively, so "what states exist" is
//! a compile-time fact. A state function either computes a transition and
//! returns [`StepOutcome::Executing`] (the driver re-dispatches in the same
//! turn) or issues allocation/I/O and returns [`StepOutcome::Waiting`] (the
//! driver re-enters on completion).

use fraid_types::Algorithm;

/// Outcome of one state-function invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// A transition was computed; dispatch again immediately.
    Executing,
    /// I/O or allocation is in flight (or the request is quiesced);
    /// re-enter when the external completion arrives.
    Waiting,
    /// The request reached a terminal status.
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadState {
    Start,
    Allocate,
    IssueReads,
    EvaluateReads,
    /// Nested recovery verify running to completion (LIFO, depth 1).
    RecoveryVerify,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteState {
    Start,
    Allocate,
    ValidateStamps,
    IssuePreRead,
    CheckPreRead,
    PreReadRecoveryVerify,
    IssueWrites,
    EvaluateWrites,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyState {
    Start,
    Allocate,
    IssueReads,
    EvaluateReads,
    Reconcile,
    IssueWrites,
    EvaluateWrites,
    Advance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebuildState {
    Start,
    Allocate,
    IssueReads,
    EvaluateReads,
    Reconstruct,
    IssueWrites,
    EvaluateWrites,
    Advance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZeroState {
    Start,
    IssueWrites,
    EvaluateWrites,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RekeyState {
    Start,
    Allocate,
    IssueReads,
    EvaluateReads,
    IssueWrites,
    EvaluateWrites,
}

/// Current machine and state of a sub-request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineState {
    Read(ReadState),
    Write(WriteState),
    Verify(VerifyState),
    Rebuild(RebuildState),
    Zero(ZeroState),
    Rekey(RekeyState),
}

impl MachineState {
    /// Initial state for an algorithm tag.
    #[must_use]
    pub fn for_algorithm(algorithm: Algorithm) -> Self {
        match algorithm {
            Algorithm::Read => Self::Read(ReadState::Start),
            Algorithm::Write | Algorithm::CorruptData => Self::Write(WriteState::Start),
            Algorithm::Verify | Algorithm::ReadOnlyVerify | Algorithm::RecoveryVerify => {
                Self::Verify(VerifyState::Start)
            }
            Algorithm::Rebuild | Algorithm::Copy => Self::Rebuild(RebuildState::Start),
            Algorithm::Zero => Self::Zero(ZeroState::Start),
            Algorithm::Rekey => Self::Rekey(RekeyState::Start),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_states_match_algorithms() {
        assert_eq!(
            MachineState::for_algorithm(Algorithm::Read),
            MachineState::Read(ReadState::Start)
        );
        assert_eq!(
            MachineState::for_algorithm(Algorithm::CorruptData),
            MachineState::Write(WriteState::Start)
        );
        assert_eq!(
            MachineState::for_algorithm(Algorithm::RecoveryVerify),
            MachineState::Verify(VerifyState::Start)
        );
        assert_eq!(
            MachineState::for_algorithm(Algorithm::Copy),
            MachineState::Rebuild(RebuildState::Start)
        );
        assert_eq!(
            MachineState::for_algorithm(Algorithm::Zero),
            MachineState::Zero(ZeroState::Start)
        );
        assert_eq!(
            MachineState::for_algorithm(Algorithm::Rekey),
            MachineState::Rekey(RekeyState::Start)
        );
    }
}

#![forbid(unsafe_code)]
//! Fru request arena for mirror sub-requests.
//!
//! One [`FruRequest`] exists per physical position per sub-request, carrying
//! the opcode, range, and completion outcome of that member's share of the
//! work. Requests live in a fixed arena of at most three slots indexed by
//! position; membership in the "read" or "write" work chain is an ownership
//! tag on the slot ([`ChainTag`]), so moving a fru between chains is a tag
//! write, never pointer surgery, and a position can never be on two chains.

use thiserror::Error;
use tracing::trace;

use fraid_types::{BlockCount, FruOpcode, FruOutcome, Lba, PositionBitmask, RaidPosition, Width};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FruError {
    #[error("position {0} out of range for this arena")]
    PositionOutOfRange(RaidPosition),
    #[error("position {0} has no fru allocated")]
    NotAllocated(RaidPosition),
    #[error("position {0} already has a fru allocated")]
    AlreadyAllocated(RaidPosition),
}

/// Which work chain a fru slot currently belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChainTag {
    #[default]
    Unused,
    ReadChain,
    WriteChain,
}

/// One per-drive sub-operation of a sub-request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FruRequest {
    pub position: RaidPosition,
    pub opcode: FruOpcode,
    pub lba: Lba,
    pub blocks: BlockCount,
    pub outcome: FruOutcome,
    /// Eligible for optimizer placement (N-way read load distribution).
    pub optimize: bool,
}

impl FruRequest {
    #[must_use]
    pub fn new(position: RaidPosition, opcode: FruOpcode, lba: Lba, blocks: BlockCount) -> Self {
        Self {
            position,
            opcode,
            lba,
            blocks,
            outcome: FruOutcome::Waiting,
            optimize: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Slot {
    fru: Option<FruRequest>,
    chain: ChainTag,
}

/// Fixed arena of fru slots, one per raid-group position.
#[derive(Debug, Clone)]
pub struct FruArena {
    slots: [Slot; 3],
    width: Width,
}

impl FruArena {
    #[must_use]
    pub fn new(width: Width) -> Self {
        Self {
            slots: [Slot::default(), Slot::default(), Slot::default()],
            width,
        }
    }

    #[must_use]
    pub fn width(&self) -> Width {
        self.width
    }

    fn slot_index(&self, position: RaidPosition) -> Result<usize, FruError> {
        let index = position.0 as usize;
        if position.0 >= self.width.get() {
            return Err(FruError::PositionOutOfRange(position));
        }
        Ok(index)
    }

    /// Place a fru on a chain. The slot must be empty.
    pub fn insert(&mut self, fru: FruRequest, chain: ChainTag) -> Result<(), FruError> {
        let index = self.slot_index(fru.position)?;
        if self.slots[index].fru.is_some() {
            return Err(FruError::AlreadyAllocated(fru.position));
        }
        trace!(position = %fru.position, ?chain, opcode = ?fru.opcode, "fru inserted");
        self.slots[index] = Slot { fru: Some(fru), chain };
        Ok(())
    }

    #[must_use]
    pub fn get(&self, position: RaidPosition) -> Option<&FruRequest> {
        self.slots.get(position.0 as usize)?.fru.as_ref()
    }

    pub fn get_mut(&mut self, position: RaidPosition) -> Option<&mut FruRequest> {
        self.slots.get_mut(position.0 as usize)?.fru.as_mut()
    }

    /// Chain the position currently belongs to.
    #[must_use]
    pub fn chain_of(&self, position: RaidPosition) -> ChainTag {
        self.slots
            .get(position.0 as usize)
            .map_or(ChainTag::Unused, |s| if s.fru.is_some() { s.chain } else { ChainTag::Unused })
    }

    /// Move a fru between chains. O(1); the fru itself is not copied.
    pub fn move_to_chain(&mut self, position: RaidPosition, chain: ChainTag) -> Result<(), FruError> {
        let index = self.slot_index(position)?;
        if self.slots[index].fru.is_none() {
            return Err(FruError::NotAllocated(position));
        }
        trace!(position = %position, from = ?self.slots[index].chain, to = ?chain, "fru re-chained");
        self.slots[index].chain = chain;
        Ok(())
    }

    /// Remove a fru from the arena entirely.
    pub fn remove(&mut self, position: RaidPosition) -> Result<FruRequest, FruError> {
        let index = self.slot_index(position)?;
        let slot = &mut self.slots[index];
        let fru = slot.fru.take().ok_or(FruError::NotAllocated(position))?;
        slot.chain = ChainTag::Unused;
        Ok(fru)
    }

    /// Drop every fru and reset all chain tags.
    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = Slot::default();
        }
    }

    /// Frus on a chain, lowest position first.
    pub fn chain(&self, chain: ChainTag) -> impl Iterator<Item = &FruRequest> {
        self.slots
            .iter()
            .filter(move |s| s.chain == chain)
            .filter_map(|s| s.fru.as_ref())
    }

    /// Mutable view of a chain's frus.
    pub fn chain_mut(&mut self, chain: ChainTag) -> impl Iterator<Item = &mut FruRequest> {
        self.slots
            .iter_mut()
            .filter(move |s| s.chain == chain)
            .filter_map(|s| s.fru.as_mut())
    }

    /// Bitmask of positions on a chain.
    #[must_use]
    pub fn chain_positions(&self, chain: ChainTag) -> PositionBitmask {
        let mut mask = PositionBitmask::EMPTY;
        for fru in self.chain(chain) {
            mask.insert(fru.position);
        }
        mask
    }

    /// Number of frus on a chain.
    #[must_use]
    pub fn chain_len(&self, chain: ChainTag) -> u32 {
        self.chain(chain).count() as u32
    }

    /// Record a completion outcome for one position.
    pub fn set_outcome(&mut self, position: RaidPosition, outcome: FruOutcome) -> Result<(), FruError> {
        let fru = self
            .get_mut(position)
            .ok_or(FruError::NotAllocated(position))?;
        fru.outcome = outcome;
        Ok(())
    }

    /// Re-target every fru on a chain for the next mining chunk: new range,
    /// outcome reset to `Waiting`. Opcode and chain membership are kept.
    pub fn reinit_chain(&mut self, chain: ChainTag, lba: Lba, blocks: BlockCount) {
        for fru in self.chain_mut(chain) {
            fru.lba = lba;
            fru.blocks = blocks;
            fru.outcome = FruOutcome::Waiting;
        }
    }

    /// Reset outcomes on a chain to `Waiting` without touching ranges.
    pub fn reset_outcomes(&mut self, chain: ChainTag) {
        for fru in self.chain_mut(chain) {
            fru.outcome = FruOutcome::Waiting;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arena3() -> FruArena {
        FruArena::new(Width::new(3).unwrap())
    }

    fn read_fru(position: u32) -> FruRequest {
        FruRequest::new(
            RaidPosition(position),
            FruOpcode::Read,
            Lba(0x1000),
            BlockCount(0x100),
        )
    }

    #[test]
    fn insert_and_chain_membership() {
        let mut arena = arena3();
        arena.insert(read_fru(0), ChainTag::ReadChain).unwrap();
        arena.insert(read_fru(2), ChainTag::ReadChain).unwrap();

        assert_eq!(arena.chain_len(ChainTag::ReadChain), 2);
        assert_eq!(arena.chain_len(ChainTag::WriteChain), 0);
        assert_eq!(
            arena.chain_positions(ChainTag::ReadChain),
            PositionBitmask(0b101)
        );
        assert_eq!(arena.chain_of(RaidPosition(0)), ChainTag::ReadChain);
        assert_eq!(arena.chain_of(RaidPosition(1)), ChainTag::Unused);
    }

    #[test]
    fn double_insert_rejected() {
        let mut arena = arena3();
        arena.insert(read_fru(1), ChainTag::ReadChain).unwrap();
        assert_eq!(
            arena.insert(read_fru(1), ChainTag::WriteChain),
            Err(FruError::AlreadyAllocated(RaidPosition(1)))
        );
    }

    #[test]
    fn position_out_of_range_rejected() {
        let mut arena = FruArena::new(Width::new(2).unwrap());
        assert_eq!(
            arena.insert(read_fru(2), ChainTag::ReadChain),
            Err(FruError::PositionOutOfRange(RaidPosition(2)))
        );
    }

    #[test]
    fn move_between_chains_is_exclusive() {
        // A position is on at most one chain at a time.
        let mut arena = arena3();
        arena.insert(read_fru(1), ChainTag::ReadChain).unwrap();
        arena.move_to_chain(RaidPosition(1), ChainTag::WriteChain).unwrap();

        assert_eq!(arena.chain_len(ChainTag::ReadChain), 0);
        assert_eq!(arena.chain_len(ChainTag::WriteChain), 1);
        assert_eq!(arena.chain_of(RaidPosition(1)), ChainTag::WriteChain);
    }

    #[test]
    fn move_unallocated_rejected() {
        let mut arena = arena3();
        assert_eq!(
            arena.move_to_chain(RaidPosition(0), ChainTag::WriteChain),
            Err(FruError::NotAllocated(RaidPosition(0)))
        );
    }

    #[test]
    fn outcomes_and_reset() {
        let mut arena = arena3();
        arena.insert(read_fru(0), ChainTag::ReadChain).unwrap();
        arena.set_outcome(RaidPosition(0), FruOutcome::MediaError).unwrap();
        assert_eq!(arena.get(RaidPosition(0)).unwrap().outcome, FruOutcome::MediaError);

        arena.reset_outcomes(ChainTag::ReadChain);
        assert_eq!(arena.get(RaidPosition(0)).unwrap().outcome, FruOutcome::Waiting);
    }

    #[test]
    fn reinit_chain_retargets_range() {
        let mut arena = arena3();
        arena.insert(read_fru(0), ChainTag::ReadChain).unwrap();
        arena.insert(read_fru(1), ChainTag::ReadChain).unwrap();
        arena.set_outcome(RaidPosition(0), FruOutcome::Success).unwrap();

        arena.reinit_chain(ChainTag::ReadChain, Lba(0x1040), BlockCount(0x40));
        for fru in arena.chain(ChainTag::ReadChain) {
            assert_eq!(fru.lba, Lba(0x1040));
            assert_eq!(fru.blocks, BlockCount(0x40));
            assert_eq!(fru.outcome, FruOutcome::Waiting);
        }
    }

    #[test]
    fn remove_clears_slot() {
        let mut arena = arena3();
        arena.insert(read_fru(0), ChainTag::ReadChain).unwrap();
        let fru = arena.remove(RaidPosition(0)).unwrap();
        assert_eq!(fru.position, RaidPosition(0));
        assert_eq!(arena.chain_of(RaidPosition(0)), ChainTag::Unused);
        assert!(arena.get(RaidPosition(0)).is_none());
    }
}

#![forbid(unsafe_code)]
//! Deterministic in-memory collaborators for exercising the mirror engine.
//!
//! [`MemoryDrives`] models the member drives as flat byte vectors with a
//! per-position fault table; [`SyncTransport`] executes fru chains against
//! them immediately and parks the completions for the driver to drain, so
//! every engine test runs the real asynchronous protocol without threads.
//! [`SoftwareXor`] implements the sector checksum model (crc32c over the
//! data portion, stored in the sector's trailing metadata), which is enough
//! to exercise every reconcile/rebuild/invalidate path.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::trace;

use fraid_io::{
    AllocOutcome, BlockTransport, BufferArena, BufferRequest, BufferSet, ErrorRegion,
    ErrorRegionKind, FruCompletion, FruOp, InvalidateReason, Topology, TransportError, XorEngine,
    XorStatus, XorVerdict,
};
use fraid_types::{BlockCount, FruOpcode, FruOutcome, Lba, PositionBitmask, RaidPosition, Width};

/// Trailing bytes of each sector holding the crc32c of the data portion.
pub const CHECKSUM_BYTES: usize = 4;

/// Byte the invalid pattern is filled with.
const INVALID_FILL: u8 = 0xDE;

// ── Fault injection ─────────────────────────────────────────────────────────

/// What a matching drive access reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    Dead,
    MediaError,
    Retryable,
    InvalidatedMedia,
}

/// One scripted fault on a member drive.
#[derive(Debug, Clone)]
pub struct Fault {
    pub position: RaidPosition,
    pub lba: Lba,
    pub blocks: BlockCount,
    pub kind: FaultKind,
    /// Fires this many times, then disappears. `None` fires forever.
    pub remaining: Option<u32>,
    /// A write overlapping the fault removes it (remap semantics).
    pub clear_on_write: bool,
}

impl Fault {
    /// Persistent media error over a range, cleared by a remap write.
    #[must_use]
    pub fn media(position: RaidPosition, lba: Lba, blocks: BlockCount) -> Self {
        Self {
            position,
            lba,
            blocks,
            kind: FaultKind::MediaError,
            remaining: None,
            clear_on_write: true,
        }
    }

    /// Transient error that fires `count` times and then goes away.
    #[must_use]
    pub fn transient(position: RaidPosition, lba: Lba, blocks: BlockCount, count: u32) -> Self {
        Self {
            position,
            lba,
            blocks,
            kind: FaultKind::Retryable,
            remaining: Some(count),
            clear_on_write: false,
        }
    }

    /// Drive gone for good.
    #[must_use]
    pub fn dead(position: RaidPosition) -> Self {
        Self {
            position,
            lba: Lba(0),
            blocks: BlockCount(u64::MAX),
            kind: FaultKind::Dead,
            remaining: None,
            clear_on_write: false,
        }
    }

    fn overlaps(&self, position: RaidPosition, lba: Lba, blocks: BlockCount) -> bool {
        self.position == position
            && lba.0 < self.lba.0.saturating_add(self.blocks.0)
            && self.lba.0 < lba.0.saturating_add(blocks.0)
    }
}

// ── In-memory drives ────────────────────────────────────────────────────────

struct DriveState {
    media: Vec<Vec<u8>>,
    faults: Vec<Fault>,
}

/// The member drives of one raid group as flat in-memory media.
pub struct MemoryDrives {
    state: Mutex<DriveState>,
    sector_size: usize,
    capacity: BlockCount,
}

impl MemoryDrives {
    #[must_use]
    pub fn new(width: u32, capacity: BlockCount, sector_size: usize) -> Self {
        let media = (0..width)
            .map(|_| vec![0_u8; (capacity.0 as usize) * sector_size])
            .collect();
        Self {
            state: Mutex::new(DriveState {
                media,
                faults: Vec::new(),
            }),
            sector_size,
            capacity,
        }
    }

    #[must_use]
    pub fn sector_size(&self) -> usize {
        self.sector_size
    }

    pub fn inject(&self, fault: Fault) {
        self.state.lock().faults.push(fault);
    }

    /// Write sectors with a valid checksum, deterministic per seed.
    pub fn fill_sectors(&self, position: RaidPosition, lba: Lba, blocks: BlockCount, seed: u8) {
        let mut state = self.state.lock();
        for block in 0..blocks.0 {
            let sector = make_sector(self.sector_size, seed.wrapping_add(block as u8));
            let offset = ((lba.0 + block) as usize) * self.sector_size;
            state.media[position.0 as usize][offset..offset + self.sector_size]
                .copy_from_slice(&sector);
        }
    }

    /// Flip a data byte of one sector so its checksum no longer matches.
    pub fn corrupt_sector(&self, position: RaidPosition, lba: Lba) {
        let mut state = self.state.lock();
        let offset = (lba.0 as usize) * self.sector_size;
        state.media[position.0 as usize][offset] ^= 0xFF;
    }

    /// Raw media snapshot of a range, for assertions.
    #[must_use]
    pub fn read_raw(&self, position: RaidPosition, lba: Lba, blocks: BlockCount) -> Vec<u8> {
        let state = self.state.lock();
        let offset = (lba.0 as usize) * self.sector_size;
        let len = (blocks.0 as usize) * self.sector_size;
        state.media[position.0 as usize][offset..offset + len].to_vec()
    }

    fn check_fault(
        state: &mut DriveState,
        op: &FruOp,
    ) -> Option<FruOutcome> {
        let is_write = matches!(op.opcode, FruOpcode::Write | FruOpcode::WriteSame);
        let mut hit = None;
        for (index, fault) in state.faults.iter().enumerate() {
            if fault.overlaps(op.position, op.lba, op.blocks) {
                hit = Some(index);
                break;
            }
        }
        let index = hit?;
        let fault = &mut state.faults[index];
        if is_write && fault.clear_on_write {
            trace!(position = %op.position, lba = %op.lba, "write cleared fault");
            state.faults.remove(index);
            return None;
        }
        let outcome = match fault.kind {
            FaultKind::Dead => FruOutcome::Dead,
            FaultKind::MediaError => FruOutcome::MediaError,
            FaultKind::Retryable => FruOutcome::Retryable,
            FaultKind::InvalidatedMedia => FruOutcome::InvalidatedMedia,
        };
        if let Some(remaining) = &mut fault.remaining {
            *remaining = remaining.saturating_sub(1);
            if *remaining == 0 {
                state.faults.remove(index);
            }
        }
        Some(outcome)
    }

    /// Execute one fru op against the media and fault table.
    pub fn perform(&self, op: &FruOp) -> FruCompletion {
        let mut state = self.state.lock();
        if op.lba.0 + op.blocks.0 > self.capacity.0 {
            return FruCompletion {
                position: op.position,
                outcome: FruOutcome::MediaError,
                data: None,
            };
        }
        if let Some(outcome) = Self::check_fault(&mut state, op) {
            return FruCompletion {
                position: op.position,
                outcome,
                data: None,
            };
        }
        let offset = (op.lba.0 as usize) * self.sector_size;
        let len = (op.blocks.0 as usize) * self.sector_size;
        let media = &mut state.media[op.position.0 as usize];
        match op.opcode {
            FruOpcode::Read => FruCompletion {
                position: op.position,
                outcome: FruOutcome::Success,
                data: Some(media[offset..offset + len].to_vec()),
            },
            FruOpcode::Write => {
                let data = op.data.as_deref().unwrap_or(&[]);
                if data.len() != len {
                    return FruCompletion {
                        position: op.position,
                        outcome: FruOutcome::MediaError,
                        data: None,
                    };
                }
                media[offset..offset + len].copy_from_slice(data);
                FruCompletion {
                    position: op.position,
                    outcome: FruOutcome::Success,
                    data: None,
                }
            }
            FruOpcode::WriteSame => {
                // Zeroed sectors with valid checksums.
                let sector_size = self.sector_size;
                for block in 0..op.blocks.0 as usize {
                    let sector = make_sector(sector_size, 0);
                    let at = offset + block * sector_size;
                    media[at..at + sector_size].copy_from_slice(&sector);
                }
                FruCompletion {
                    position: op.position,
                    outcome: FruOutcome::Success,
                    data: None,
                }
            }
        }
    }
}

/// One sector of repeated `seed` bytes with a valid trailing checksum.
#[must_use]
pub fn make_sector(sector_size: usize, seed: u8) -> Vec<u8> {
    let mut sector = vec![seed; sector_size];
    let data_len = sector_size - CHECKSUM_BYTES;
    let crc = crc32c::crc32c(&sector[..data_len]);
    sector[data_len..].copy_from_slice(&crc.to_le_bytes());
    sector
}

fn sector_checksum_ok(sector: &[u8]) -> bool {
    let data_len = sector.len() - CHECKSUM_BYTES;
    let stored = u32::from_le_bytes([
        sector[data_len],
        sector[data_len + 1],
        sector[data_len + 2],
        sector[data_len + 3],
    ]);
    crc32c::crc32c(&sector[..data_len]) == stored
}

// ── Transport ───────────────────────────────────────────────────────────────

/// Executes chains against [`MemoryDrives`] at `send_chain` time and parks
/// the completions until the driver drains them.
pub struct SyncTransport {
    drives: std::sync::Arc<MemoryDrives>,
    pending: Mutex<HashMap<u64, Vec<FruCompletion>>>,
}

impl SyncTransport {
    #[must_use]
    pub fn new(drives: std::sync::Arc<MemoryDrives>) -> Self {
        Self {
            drives,
            pending: Mutex::new(HashMap::new()),
        }
    }
}

impl BlockTransport for SyncTransport {
    fn send_chain(&self, request_id: u64, ops: Vec<FruOp>) -> Result<(), TransportError> {
        let completions: Vec<_> = ops.iter().map(|op| self.drives.perform(op)).collect();
        self.pending.lock().entry(request_id).or_default().extend(completions);
        Ok(())
    }

    fn drain_completions(&self, request_id: u64) -> Vec<FruCompletion> {
        self.pending.lock().remove(&request_id).unwrap_or_default()
    }
}

// ── Arenas ──────────────────────────────────────────────────────────────────

/// Always-ready arena handing out zero-filled buffers.
pub struct ImmediateArena;

fn build_set(request: &BufferRequest) -> BufferSet {
    let mut set = BufferSet::new();
    let len = (request.blocks.0 as usize) * request.sector_size;
    for position in request.positions.iter() {
        set.insert(position, vec![0_u8; len]);
    }
    set
}

impl BufferArena for ImmediateArena {
    fn allocate(&self, request: &BufferRequest) -> AllocOutcome {
        AllocOutcome::Ready(build_set(request))
    }
}

/// Arena that defers every allocation one driver pass, exercising the
/// pending-allocation path.
#[derive(Default)]
pub struct DeferredArena {
    parked: Mutex<Vec<BufferSet>>,
}

impl BufferArena for DeferredArena {
    fn allocate(&self, request: &BufferRequest) -> AllocOutcome {
        self.parked.lock().push(build_set(request));
        AllocOutcome::Pending
    }

    fn take_ready(&self) -> Option<BufferSet> {
        self.parked.lock().pop()
    }
}

// ── XOR engine ──────────────────────────────────────────────────────────────

/// Sector-checksum XOR engine over the crc32c model.
pub struct SoftwareXor {
    sector_size: usize,
}

impl SoftwareXor {
    #[must_use]
    pub fn new(sector_size: usize) -> Self {
        Self { sector_size }
    }

    /// True when every sector of the buffer carries a valid checksum.
    fn buffer_valid(&self, buf: &[u8]) -> bool {
        buf.len() % self.sector_size == 0
            && buf
                .chunks_exact(self.sector_size)
                .all(sector_checksum_ok)
    }
}

impl XorEngine for SoftwareXor {
    fn check_and_generate(
        &self,
        buffers: &mut BufferSet,
        positions: PositionBitmask,
        _lba: Lba,
        blocks: BlockCount,
        generate_stamps: bool,
    ) -> XorStatus {
        let expected = (blocks.0 as usize) * self.sector_size;
        for position in positions.iter() {
            let Some(buf) = buffers.get_mut(position) else {
                return XorStatus::BadMemory;
            };
            if buf.len() != expected {
                return XorStatus::BadMemory;
            }
            if generate_stamps {
                for sector in buf.chunks_exact_mut(self.sector_size) {
                    let data_len = self.sector_size - CHECKSUM_BYTES;
                    let crc = crc32c::crc32c(&sector[..data_len]);
                    sector[data_len..].copy_from_slice(&crc.to_le_bytes());
                }
            } else if !self.buffer_valid(buf) {
                return XorStatus::ChecksumError;
            }
        }
        XorStatus::NoError
    }

    fn reconcile(
        &self,
        buffers: &mut BufferSet,
        live: PositionBitmask,
        lba: Lba,
        blocks: BlockCount,
    ) -> XorVerdict {
        let mut good = PositionBitmask::EMPTY;
        let mut bad = PositionBitmask::EMPTY;
        for position in live.iter() {
            match buffers.get(position) {
                Some(buf) if self.buffer_valid(buf) => good.insert(position),
                _ => bad.insert(position),
            }
        }
        let Some(donor) = good.first() else {
            return XorVerdict {
                needs_write: PositionBitmask::EMPTY,
                uncorrectable: live,
                error_regions: vec![ErrorRegion {
                    lba,
                    blocks,
                    positions: live,
                    kind: ErrorRegionKind::Checksum,
                }],
            };
        };
        if bad.is_empty() {
            return XorVerdict::clean();
        }
        let reference = buffers
            .get(donor)
            .map(<[u8]>::to_vec)
            .unwrap_or_default();
        for position in bad.iter() {
            buffers.insert(position, reference.clone());
        }
        XorVerdict {
            needs_write: bad,
            uncorrectable: PositionBitmask::EMPTY,
            error_regions: vec![ErrorRegion {
                lba,
                blocks,
                positions: bad,
                kind: ErrorRegionKind::Checksum,
            }],
        }
    }

    fn rebuild(
        &self,
        buffers: &mut BufferSet,
        sources: PositionBitmask,
        targets: PositionBitmask,
        lba: Lba,
        blocks: BlockCount,
    ) -> XorVerdict {
        let donor = sources
            .iter()
            .find(|p| buffers.get(*p).is_some_and(|b| self.buffer_valid(b)));
        let Some(donor) = donor else {
            return XorVerdict {
                needs_write: PositionBitmask::EMPTY,
                uncorrectable: sources,
                error_regions: vec![ErrorRegion {
                    lba,
                    blocks,
                    positions: sources,
                    kind: ErrorRegionKind::Checksum,
                }],
            };
        };
        let reference = buffers
            .get(donor)
            .map(<[u8]>::to_vec)
            .unwrap_or_default();
        for position in targets.iter() {
            buffers.insert(position, reference.clone());
        }
        XorVerdict {
            needs_write: targets,
            uncorrectable: PositionBitmask::EMPTY,
            error_regions: Vec::new(),
        }
    }

    fn invalidate_sectors(
        &self,
        buffers: &mut BufferSet,
        positions: PositionBitmask,
        _lba: Lba,
        blocks: BlockCount,
        reason: InvalidateReason,
    ) {
        // The pattern is deliberately checksum-invalid; the reason code sits
        // in the first data byte of every sector.
        let tag = match reason {
            InvalidateReason::CopySourceMediaError => 0x01,
            InvalidateReason::VerifyUnrecoverable => 0x02,
        };
        let len = (blocks.0 as usize) * self.sector_size;
        for position in positions.iter() {
            let mut buf = vec![INVALID_FILL; len];
            for sector in buf.chunks_exact_mut(self.sector_size) {
                sector[0] = tag;
            }
            buffers.insert(position, buf);
        }
    }
}

// ── Topology ────────────────────────────────────────────────────────────────

/// Scripted topology whose masks tests flip mid-scenario.
pub struct ScriptedTopology {
    width: Width,
    degraded: Mutex<PositionBitmask>,
    disabled: Mutex<PositionBitmask>,
    restricted: Mutex<PositionBitmask>,
}

impl ScriptedTopology {
    #[must_use]
    pub fn fully_live(width: Width) -> Self {
        Self {
            width,
            degraded: Mutex::new(PositionBitmask::EMPTY),
            disabled: Mutex::new(PositionBitmask::EMPTY),
            restricted: Mutex::new(PositionBitmask::EMPTY),
        }
    }

    pub fn set_degraded(&self, mask: PositionBitmask) {
        *self.degraded.lock() = mask;
    }

    pub fn set_disabled(&self, mask: PositionBitmask) {
        *self.disabled.lock() = mask;
    }

    /// Positions whose access is restricted (e.g. a pending background
    /// verify pins reads away from load distribution).
    pub fn set_restricted(&self, mask: PositionBitmask) {
        *self.restricted.lock() = mask;
    }
}

impl Topology for ScriptedTopology {
    fn degraded_bitmask(&self) -> PositionBitmask {
        *self.degraded.lock()
    }

    fn disabled_bitmask(&self) -> PositionBitmask {
        *self.disabled.lock()
    }

    fn full_access_bitmask(&self) -> PositionBitmask {
        let restricted = *self.restricted.lock();
        (*self.degraded.lock() | *self.disabled.lock() | restricted).invert(self.width)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const SECTOR: usize = 16;

    fn drives(width: u32) -> Arc<MemoryDrives> {
        let drives = Arc::new(MemoryDrives::new(width, BlockCount(0x200), SECTOR));
        for position in 0..width {
            drives.fill_sectors(RaidPosition(position), Lba(0), BlockCount(0x200), 7);
        }
        drives
    }

    fn read_op(position: u32, lba: u64, blocks: u64) -> FruOp {
        FruOp {
            position: RaidPosition(position),
            opcode: FruOpcode::Read,
            lba: Lba(lba),
            blocks: BlockCount(blocks),
            data: None,
        }
    }

    #[test]
    fn read_returns_checksummed_sectors() {
        let drives = drives(2);
        let completion = drives.perform(&read_op(0, 0x10, 4));
        assert_eq!(completion.outcome, FruOutcome::Success);
        let data = completion.data.unwrap();
        assert_eq!(data.len(), 4 * SECTOR);
        assert!(data.chunks_exact(SECTOR).all(sector_checksum_ok));
    }

    #[test]
    fn media_fault_fires_until_overwritten() {
        let drives = drives(2);
        drives.inject(Fault::media(RaidPosition(0), Lba(0x10), BlockCount(4)));

        let completion = drives.perform(&read_op(0, 0x12, 1));
        assert_eq!(completion.outcome, FruOutcome::MediaError);

        // a remap write over the range clears the fault
        let sector = make_sector(SECTOR, 9);
        let write = FruOp {
            position: RaidPosition(0),
            opcode: FruOpcode::Write,
            lba: Lba(0x10),
            blocks: BlockCount(4),
            data: Some(sector.repeat(4)),
        };
        assert_eq!(drives.perform(&write).outcome, FruOutcome::Success);
        assert_eq!(drives.perform(&read_op(0, 0x12, 1)).outcome, FruOutcome::Success);
    }

    #[test]
    fn transient_fault_expires() {
        let drives = drives(2);
        drives.inject(Fault::transient(RaidPosition(1), Lba(0), BlockCount(8), 2));
        assert_eq!(drives.perform(&read_op(1, 0, 8)).outcome, FruOutcome::Retryable);
        assert_eq!(drives.perform(&read_op(1, 0, 8)).outcome, FruOutcome::Retryable);
        assert_eq!(drives.perform(&read_op(1, 0, 8)).outcome, FruOutcome::Success);
    }

    #[test]
    fn sync_transport_parks_completions() {
        let drives = drives(2);
        let transport = SyncTransport::new(drives);
        transport
            .send_chain(42, vec![read_op(0, 0, 2), read_op(1, 0, 2)])
            .unwrap();

        assert!(transport.drain_completions(7).is_empty());
        let completions = transport.drain_completions(42);
        assert_eq!(completions.len(), 2);
        assert!(transport.drain_completions(42).is_empty());
    }

    #[test]
    fn deferred_arena_parks_one_pass() {
        let arena = DeferredArena::default();
        let request = BufferRequest {
            positions: PositionBitmask(0b11),
            blocks: BlockCount(2),
            sector_size: SECTOR,
        };
        assert!(matches!(arena.allocate(&request), AllocOutcome::Pending));
        let set = arena.take_ready().unwrap();
        assert_eq!(set.positions(), PositionBitmask(0b11));
        assert!(arena.take_ready().is_none());
    }

    #[test]
    fn reconcile_corrects_bad_copy_from_good() {
        let xor = SoftwareXor::new(SECTOR);
        let mut buffers = BufferSet::new();
        buffers.insert(RaidPosition(0), make_sector(SECTOR, 1));
        let mut bad = make_sector(SECTOR, 1);
        bad[0] ^= 0xFF;
        buffers.insert(RaidPosition(1), bad);

        let verdict = xor.reconcile(&mut buffers, PositionBitmask(0b11), Lba(0), BlockCount(1));
        assert_eq!(verdict.needs_write, PositionBitmask(0b10));
        assert!(verdict.uncorrectable.is_empty());
        assert_eq!(
            buffers.get(RaidPosition(1)),
            buffers.get(RaidPosition(0))
        );
    }

    #[test]
    fn reconcile_with_no_good_copy_is_uncorrectable() {
        let xor = SoftwareXor::new(SECTOR);
        let mut buffers = BufferSet::new();
        for position in 0..2 {
            let mut bad = make_sector(SECTOR, 3);
            bad[1] ^= 0xFF;
            buffers.insert(RaidPosition(position), bad);
        }
        let verdict = xor.reconcile(&mut buffers, PositionBitmask(0b11), Lba(0), BlockCount(1));
        assert_eq!(verdict.uncorrectable, PositionBitmask(0b11));
        assert_eq!(verdict.error_regions.len(), 1);
        assert_eq!(verdict.error_regions[0].kind, ErrorRegionKind::Checksum);
    }

    #[test]
    fn invalidated_sectors_fail_validation() {
        let xor = SoftwareXor::new(SECTOR);
        let mut buffers = BufferSet::new();
        buffers.insert(RaidPosition(0), make_sector(SECTOR, 5));
        xor.invalidate_sectors(
            &mut buffers,
            PositionBitmask(0b01),
            Lba(0),
            BlockCount(1),
            InvalidateReason::VerifyUnrecoverable,
        );
        let status = xor.check_and_generate(
            &mut buffers,
            PositionBitmask(0b01),
            Lba(0),
            BlockCount(1),
            false,
        );
        assert_eq!(status, XorStatus::ChecksumError);
        assert_eq!(buffers.get(RaidPosition(0)).unwrap()[0], 0x02);
    }

    #[test]
    fn topology_full_access_excludes_restricted() {
        let topology = ScriptedTopology::fully_live(Width::new(3).unwrap());
        topology.set_restricted(PositionBitmask(0b010));
        assert!(!topology
            .full_access_bitmask()
            .contains(RaidPosition(1)));
        assert!(topology.full_access_bitmask().contains(RaidPosition(0)));
    }
}

//! Generate-time validation of incoming sub-requests.
//!
//! Every entry point validates before its state machine runs. A failure here
//! is a generation bug in the orchestrator, reported as `Generate` and
//! terminal `UnexpectedError` — never retried.

use fraid_error::RaidError;
use fraid_geometry::MirrorKind;
use fraid_types::Algorithm;

use crate::siots::SubRequest;

fn fail(detail: impl Into<String>) -> RaidError {
    RaidError::Generate(detail.into())
}

/// Check that a sub-request is well-formed for mirror algorithms.
pub fn validate(request: &SubRequest) -> Result<(), RaidError> {
    let config = &request.config;
    if config.region_size == 0 {
        return Err(fail("region_size is zero"));
    }
    if config.optimal_block_size == 0 {
        return Err(fail("optimal_block_size is zero"));
    }
    if config.sector_size == 0 {
        return Err(fail("sector_size is zero"));
    }

    if request.xfer_count.is_zero() {
        return Err(fail("xfer_count is zero"));
    }
    if request.parity_count.is_zero() {
        return Err(fail("parity_count is zero"));
    }
    if request.parity_count > request.xfer_count {
        return Err(fail(format!(
            "parity_count {} exceeds xfer_count {}",
            request.parity_count, request.xfer_count
        )));
    }

    let Some(offset) = request.parity_start.checked_offset_from(request.start_lba) else {
        return Err(fail("parity_start precedes start_lba"));
    };
    let span_end = offset.0.checked_add(request.parity_count.0);
    if span_end.is_none() || span_end.unwrap_or(u64::MAX) > request.xfer_count.0 {
        return Err(fail("parity range extends past the transfer"));
    }

    match request.algorithm {
        Algorithm::Zero => {
            let optimal = config.optimal_block_size;
            if request.start_lba.0 % optimal != 0 || request.xfer_count.0 % optimal != 0 {
                return Err(fail("zero request not aligned to optimal block size"));
            }
        }
        Algorithm::Copy => {
            if !matches!(request.kind, MirrorKind::Sparing(_)) {
                return Err(fail("copy algorithm requires a sparing-type group"));
            }
        }
        Algorithm::Write | Algorithm::CorruptData => {
            let expected = (request.xfer_count.0 as usize).saturating_mul(config.sector_size);
            match &request.host_data {
                None => return Err(fail("write request has no host data")),
                Some(data) if data.len() != expected => {
                    return Err(fail(format!(
                        "host data length {} does not match transfer ({expected} bytes)",
                        data.len()
                    )));
                }
                Some(_) => {}
            }
        }
        Algorithm::Read
        | Algorithm::Verify
        | Algorithm::ReadOnlyVerify
        | Algorithm::RecoveryVerify
        | Algorithm::Rebuild
        | Algorithm::Rekey => {}
    }

    // Sparing groups never exceed two members regardless of algorithm.
    if matches!(request.kind, MirrorKind::Sparing(_)) && request.width.get() != 2 {
        return Err(fail("sparing-type group must have width 2"));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fraid_geometry::{MirrorConfig, SparingPreference};
    use fraid_types::{BlockCount, Lba, Width};

    fn request(algorithm: Algorithm) -> SubRequest {
        SubRequest::new(
            1,
            algorithm,
            MirrorKind::Standard,
            MirrorConfig::default(),
            Width::new(2).unwrap(),
            Lba(0x1000),
            BlockCount(0x100),
        )
        .unwrap()
    }

    #[test]
    fn read_request_valid() {
        assert!(validate(&request(Algorithm::Read)).is_ok());
    }

    #[test]
    fn zero_transfer_rejected() {
        let mut req = request(Algorithm::Read);
        req.xfer_count = BlockCount::ZERO;
        req.parity_count = BlockCount::ZERO;
        assert!(validate(&req).is_err());
    }

    #[test]
    fn parity_count_bounded_by_xfer() {
        let mut req = request(Algorithm::Verify);
        req.parity_count = BlockCount(0x200);
        assert!(validate(&req).is_err());
    }

    #[test]
    fn parity_range_must_sit_inside_transfer() {
        let mut req = request(Algorithm::Verify);
        req.parity_start = Lba(0x10C0);
        req.parity_count = BlockCount(0x80);
        assert!(validate(&req).is_err());

        req.parity_count = BlockCount(0x40);
        assert!(validate(&req).is_ok());
    }

    #[test]
    fn write_requires_host_data_of_exact_size() {
        let mut req = request(Algorithm::Write);
        assert!(validate(&req).is_err());

        let sector = req.config.sector_size;
        req.host_data = Some(vec![0_u8; 0x100 * sector]);
        assert!(validate(&req).is_ok());

        req.host_data = Some(vec![0_u8; 7]);
        assert!(validate(&req).is_err());
    }

    #[test]
    fn zero_must_be_aligned() {
        let mut req = request(Algorithm::Zero);
        req.config.optimal_block_size = 0x10;
        assert!(validate(&req).is_ok());

        req.start_lba = Lba(0x1001);
        req.parity_start = Lba(0x1001);
        assert!(validate(&req).is_err());
    }

    #[test]
    fn copy_requires_sparing_group() {
        let req = request(Algorithm::Copy);
        assert!(validate(&req).is_err());

        let sparing = SubRequest::new(
            2,
            Algorithm::Copy,
            MirrorKind::Sparing(SparingPreference::PrimaryFirst),
            MirrorConfig::default(),
            Width::new(2).unwrap(),
            Lba(0),
            BlockCount(0x40),
        )
        .unwrap();
        assert!(validate(&sparing).is_ok());
    }
}

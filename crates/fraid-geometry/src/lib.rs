#![forbid(unsafe_code)]
//! Position/geometry mapping for mirror raid groups.
//!
//! A [`PositionMap`] assigns abstract roles (primary, secondary, tertiary) to
//! physical member positions for one sub-request. Read machines read from the
//! primary role; when an error forces a different source the primary role is
//! swapped with whichever role currently holds the desired position
//! ([`PositionMap::swap_primary`]), so the map stays a permutation of its
//! initial positions at all times.
//!
//! [`MirrorConfig`] carries the raid group's fixed parameters (region size
//! for mining, sector size, retry and expiration budgets). It is plain data
//! with serde derives so harness scenarios can load it from JSON.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use fraid_types::{RaidPosition, RangeError, Width, PRIMARY_ROLE};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PositionError {
    /// A swap to the current primary is a caller bug, not a no-op.
    #[error("position {0} is already the primary")]
    AlreadyPrimary(RaidPosition),
    #[error("position {0} is not in the map")]
    NotInMap(RaidPosition),
}

/// Ordering preference for sparing-type (hot-spare / proactive-copy) pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SparingPreference {
    /// Position 0 is the source, position 1 the spare/destination.
    PrimaryFirst,
    /// Position 1 is the source (e.g. copying back onto a replaced member).
    SecondaryFirst,
}

/// Kind of mirror group a geometry is computed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MirrorKind {
    /// Standard user mirror, width 1..=3.
    Standard,
    /// Hot-spare or proactive-copy pair; always width 2, with a preference
    /// deciding which member is the read source.
    Sparing(SparingPreference),
}

/// Role-indexed map of physical positions for one sub-request.
///
/// Index 0 is the primary role, 1 the secondary, 2 the tertiary. Only the
/// first `width` entries are meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionMap {
    roles: [RaidPosition; 3],
    width: Width,
}

/// Compute the role→position map for a sub-request.
///
/// Standard mirrors get identity defaults (role i → position i). Sparing
/// groups must be width 2 and order primary/secondary by the preference.
pub fn compute_geometry(width: Width, kind: MirrorKind) -> Result<PositionMap, RangeError> {
    let roles = match kind {
        MirrorKind::Standard => [RaidPosition(0), RaidPosition(1), RaidPosition(2)],
        MirrorKind::Sparing(preference) => {
            if width.get() != 2 {
                return Err(RangeError::InvalidWidth {
                    got: width.get(),
                    expected: "2 for sparing groups",
                });
            }
            match preference {
                SparingPreference::PrimaryFirst => {
                    [RaidPosition(0), RaidPosition(1), RaidPosition(2)]
                }
                SparingPreference::SecondaryFirst => {
                    [RaidPosition(1), RaidPosition(0), RaidPosition(2)]
                }
            }
        }
    };
    Ok(PositionMap { roles, width })
}

impl PositionMap {
    #[must_use]
    pub fn width(&self) -> Width {
        self.width
    }

    /// Physical position currently holding the primary role.
    #[must_use]
    pub fn primary(&self) -> RaidPosition {
        self.roles[PRIMARY_ROLE]
    }

    /// Physical position for a role index, if the role is in range.
    #[must_use]
    pub fn position_for_role(&self, role: usize) -> Option<RaidPosition> {
        if role < self.width.get() as usize {
            Some(self.roles[role])
        } else {
            None
        }
    }

    /// All positions in role order (primary first).
    pub fn positions(&self) -> impl Iterator<Item = RaidPosition> + '_ {
        self.roles.iter().copied().take(self.width.get() as usize)
    }

    /// Swap the primary role to the role currently holding `new_primary`.
    ///
    /// Fails if `new_primary` already holds the primary role (callers must
    /// only request a swap when changing sources) or is not in the map.
    pub fn swap_primary(&mut self, new_primary: RaidPosition) -> Result<(), PositionError> {
        if self.primary() == new_primary {
            return Err(PositionError::AlreadyPrimary(new_primary));
        }
        let role = self
            .positions()
            .position(|p| p == new_primary)
            .ok_or(PositionError::NotInMap(new_primary))?;
        debug!(
            old_primary = %self.roles[PRIMARY_ROLE],
            new_primary = %new_primary,
            role,
            "swapping primary role"
        );
        self.roles.swap(PRIMARY_ROLE, role);
        Ok(())
    }
}

// ── Mirror configuration ────────────────────────────────────────────────────

/// Fixed parameters of a mirror raid group, carried on every sub-request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorConfig {
    /// Smallest alignable unit in blocks; region mining shrinks the active
    /// span to this granularity. Must be non-zero.
    pub region_size: u64,
    /// Optimal block size in blocks; writes not covering whole multiples of
    /// this need a pre-read of the missing edges.
    pub optimal_block_size: u64,
    /// Bytes per logical block, including checksum metadata.
    pub sector_size: usize,
    /// Local retries allowed per chain before the error is surfaced.
    pub retry_limit: u32,
    /// Wall-clock budget; mining loops check this so a stuck request
    /// surfaces to the orchestrator instead of looping.
    pub expiration: Duration,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            region_size: 0x40,
            optimal_block_size: 1,
            sector_size: 520,
            retry_limit: 3,
            expiration: Duration::from_secs(30),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn width(w: u32) -> Width {
        Width::new(w).unwrap()
    }

    #[test]
    fn standard_geometry_is_identity() {
        for w in 1..=3 {
            let map = compute_geometry(width(w), MirrorKind::Standard).unwrap();
            for role in 0..w as usize {
                assert_eq!(map.position_for_role(role), Some(RaidPosition(role as u32)));
            }
            assert_eq!(map.position_for_role(w as usize), None);
        }
    }

    #[test]
    fn sparing_geometry_orders_by_preference() {
        let map = compute_geometry(
            width(2),
            MirrorKind::Sparing(SparingPreference::SecondaryFirst),
        )
        .unwrap();
        assert_eq!(map.primary(), RaidPosition(1));
        assert_eq!(map.position_for_role(1), Some(RaidPosition(0)));

        let map = compute_geometry(
            width(2),
            MirrorKind::Sparing(SparingPreference::PrimaryFirst),
        )
        .unwrap();
        assert_eq!(map.primary(), RaidPosition(0));
    }

    #[test]
    fn sparing_geometry_rejects_bad_width() {
        for w in [1, 3] {
            assert!(compute_geometry(
                width(w),
                MirrorKind::Sparing(SparingPreference::PrimaryFirst)
            )
            .is_err());
        }
    }

    #[test]
    fn swap_primary_exchanges_roles() {
        let mut map = compute_geometry(width(3), MirrorKind::Standard).unwrap();
        map.swap_primary(RaidPosition(2)).unwrap();
        assert_eq!(map.primary(), RaidPosition(2));
        assert_eq!(map.position_for_role(2), Some(RaidPosition(0)));
        // the displaced role keeps its old content
        assert_eq!(map.position_for_role(1), Some(RaidPosition(1)));
    }

    #[test]
    fn swap_to_current_primary_is_rejected() {
        let mut map = compute_geometry(width(2), MirrorKind::Standard).unwrap();
        let before = map;
        assert_eq!(
            map.swap_primary(RaidPosition(0)),
            Err(PositionError::AlreadyPrimary(RaidPosition(0)))
        );
        // never mutates on failure
        assert_eq!(map, before);
    }

    #[test]
    fn swap_to_unknown_position_is_rejected() {
        let mut map = compute_geometry(width(2), MirrorKind::Standard).unwrap();
        assert_eq!(
            map.swap_primary(RaidPosition(2)),
            Err(PositionError::NotInMap(RaidPosition(2)))
        );
    }

    #[test]
    fn map_stays_a_permutation_under_swaps() {
        // Position-map invariant: after any sequence of valid swaps the map
        // is a duplicate-free permutation of the initial positions, and the
        // primary always holds a position present at initialization.
        let mut map = compute_geometry(width(3), MirrorKind::Standard).unwrap();
        let initial: Vec<_> = map.positions().collect();

        for target in [2_u32, 0, 1, 2, 0] {
            let target = RaidPosition(target);
            if map.primary() == target {
                continue;
            }
            map.swap_primary(target).unwrap();

            let mut seen: Vec<_> = map.positions().collect();
            seen.sort();
            let mut expected = initial.clone();
            expected.sort();
            assert_eq!(seen, expected, "map must stay a permutation");
            assert!(initial.contains(&map.primary()));
        }
    }

    #[test]
    fn config_defaults_are_sane() {
        let config = MirrorConfig::default();
        assert!(config.region_size > 0);
        assert!(config.sector_size > 0);
        assert!(config.retry_limit > 0);
    }
}

//! Per-particle pin partitions.
//!
//! Every labelled edge of a particle carries `k` pins. Pin `p` of a particle
//! sits on local label `p / k` at offset `p % k`; offsets run in the
//! particle's own rotational sense. A [`PinConfiguration`] groups all pins
//! into disjoint partition sets, and partition sets of neighboring particles
//! connected through facing pins form circuits.

use serde::{Deserialize, Serialize};

use crate::grid::{Chirality, Direction, label_count, label_to_global, label_to_local};
use crate::id::PartitionSetId;

/// Invalid pin configuration edits.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PinError {
    #[error("pin {pin} out of range (particle has {count} pins)")]
    PinOutOfRange { pin: usize, count: usize },
    #[error("partition set {set} out of range (at most {count} sets)")]
    SetOutOfRange { set: usize, count: usize },
    #[error("configuration built for expansion {built:?}, particle has {actual:?}")]
    ShapeMismatch {
        built: Option<Direction>,
        actual: Option<Direction>,
    },
}

// ---------------------------------------------------------------------------
// PinConfiguration
// ---------------------------------------------------------------------------

/// A partition of one particle's pins into partition sets.
///
/// The pin count depends on the particle's shape, so a configuration is tied
/// to the local expansion direction it was built for. Set ids range over
/// `0..pin_count()`; every pin belongs to exactly one set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PinConfiguration {
    pins_per_edge: u8,
    expansion: Option<Direction>,
    partition_of: Vec<u8>,
}

impl PinConfiguration {
    /// Every pin in its own partition set, set id equal to the pin id.
    pub fn singleton(pins_per_edge: u8, expansion: Option<Direction>) -> Self {
        let count = label_count(expansion) * pins_per_edge as usize;
        Self {
            pins_per_edge,
            expansion,
            partition_of: (0..count as u8).collect(),
        }
    }

    /// All pins in partition set 0.
    pub fn global(pins_per_edge: u8, expansion: Option<Direction>) -> Self {
        let count = label_count(expansion) * pins_per_edge as usize;
        Self {
            pins_per_edge,
            expansion,
            partition_of: vec![0; count],
        }
    }

    pub fn pins_per_edge(&self) -> usize {
        self.pins_per_edge as usize
    }

    /// Local expansion direction this configuration was built for.
    pub fn expansion(&self) -> Option<Direction> {
        self.expansion
    }

    pub fn pin_count(&self) -> usize {
        self.partition_of.len()
    }

    /// Pin id of the pin at `offset` on local `label`.
    pub fn pin_id(&self, label: usize, offset: usize) -> usize {
        label * self.pins_per_edge() + offset
    }

    /// Move `pins` into partition set `set`. Pins keep their other sets
    /// untouched, so sets left without pins simply become empty.
    pub fn make_partition_set(
        &mut self,
        pins: &[usize],
        set: PartitionSetId,
    ) -> Result<(), PinError> {
        let count = self.pin_count();
        if set.0 as usize >= count {
            return Err(PinError::SetOutOfRange {
                set: set.0 as usize,
                count,
            });
        }
        if let Some(&pin) = pins.iter().find(|&&p| p >= count) {
            return Err(PinError::PinOutOfRange { pin, count });
        }
        for &pin in pins {
            self.partition_of[pin] = set.0;
        }
        Ok(())
    }

    /// The partition set holding `pin`.
    pub fn partition_set_of(&self, pin: usize) -> Option<PartitionSetId> {
        self.partition_of.get(pin).map(|&s| PartitionSetId(s))
    }

    /// Pins belonging to `set`, in ascending order.
    pub fn pins_of(&self, set: PartitionSetId) -> impl Iterator<Item = usize> + '_ {
        self.partition_of
            .iter()
            .enumerate()
            .filter(move |(_, s)| **s == set.0)
            .map(|(pin, _)| pin)
    }

    /// Ids of all partition sets holding at least one pin, ascending.
    pub fn non_empty_sets(&self) -> Vec<PartitionSetId> {
        let mut sets: Vec<u8> = self.partition_of.clone();
        sets.sort_unstable();
        sets.dedup();
        sets.into_iter().map(PartitionSetId).collect()
    }

    /// Whether this configuration fits a particle with the given local
    /// expansion direction.
    pub fn check_shape(&self, expansion: Option<Direction>) -> Result<(), PinError> {
        if self.expansion != expansion {
            return Err(PinError::ShapeMismatch {
                built: self.expansion,
                actual: expansion,
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Frame conversion
// ---------------------------------------------------------------------------

/// A pin in the global frame: global edge label and counter-clockwise offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GlobalPin {
    pub label: usize,
    pub offset: usize,
}

/// Convert a local pin id into its global label and offset.
pub fn pin_to_global(
    pin: usize,
    pins_per_edge: usize,
    local_expansion: Option<Direction>,
    compass: Direction,
    chirality: Chirality,
) -> Option<GlobalPin> {
    let label = label_to_global(pin / pins_per_edge, local_expansion, compass, chirality)?;
    let offset = match chirality {
        Chirality::CounterClockwise => pin % pins_per_edge,
        Chirality::Clockwise => pins_per_edge - 1 - pin % pins_per_edge,
    };
    Some(GlobalPin { label, offset })
}

/// Convert a global pin into the local pin id of a particle. Inverse of
/// [`pin_to_global`].
pub fn pin_to_local(
    pin: GlobalPin,
    pins_per_edge: usize,
    global_expansion: Option<Direction>,
    compass: Direction,
    chirality: Chirality,
) -> Option<usize> {
    let label = label_to_local(pin.label, global_expansion, compass, chirality)?;
    let offset = match chirality {
        Chirality::CounterClockwise => pin.offset,
        Chirality::Clockwise => pins_per_edge - 1 - pin.offset,
    };
    Some(label * pins_per_edge + offset)
}

/// Offset of the pin facing `offset` across an edge, in the neighbor's
/// global numbering. Both sides count counter-clockwise around themselves,
/// so the order flips across the edge.
pub fn opposing_offset(offset: usize, pins_per_edge: usize) -> usize {
    pins_per_edge - 1 - offset
}

// ===========================================================================
// Tests
// ===========================================================================

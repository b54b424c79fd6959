//! Movement actions and their precondition checks.
//!
//! Behaviors schedule an [`Action`] in their own local frame. Scheduling
//! validates the preconditions against the pre-round snapshot and converts
//! the action into a global [`Movement`] for the solver. Nothing moves until
//! the round's movement resolution runs.

use serde::{Deserialize, Serialize};

use crate::grid::{Chirality, Direction, GridPos, Placement, to_global};
use crate::id::ParticleId;

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

/// A movement request, expressed in the requesting particle's local frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    /// Expand from a contracted state; the head moves to the neighbor node.
    Expand(Direction),
    /// Contract into the head, vacating the tail.
    ContractHead,
    /// Contract into the tail, vacating the head.
    ContractTail,
    /// Expand into a node held by an expanded neighbor, which must contract
    /// away from it in the same round.
    PushHandover(Direction),
    /// Contract into the head. The contracted neighbor at the tail in the
    /// given direction expands into the vacated tail node.
    PullHandoverHead(Direction),
    /// Contract into the tail. The contracted neighbor at the head in the
    /// given direction expands into the vacated head node.
    PullHandoverTail(Direction),
}

impl Action {
    /// Whether the action starts from a contracted particle.
    pub fn is_expansion(&self) -> bool {
        matches!(self, Action::Expand(_) | Action::PushHandover(_))
    }

    pub fn is_handover(&self) -> bool {
        matches!(
            self,
            Action::PushHandover(_) | Action::PullHandoverHead(_) | Action::PullHandoverTail(_)
        )
    }

    /// Convert into the global frame of a particle with the given compass
    /// and chirality.
    pub fn to_global(self, compass: Direction, chirality: Chirality) -> Movement {
        let g = |d: Direction| to_global(d, compass, chirality);
        match self {
            Action::Expand(d) => Movement::Expand(g(d)),
            Action::ContractHead => Movement::ContractHead,
            Action::ContractTail => Movement::ContractTail,
            Action::PushHandover(d) => Movement::Push(g(d)),
            Action::PullHandoverHead(d) => Movement::PullHead(g(d)),
            Action::PullHandoverTail(d) => Movement::PullTail(g(d)),
        }
    }
}

/// A validated action in the global frame, consumed by the movement solver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Movement {
    Expand(Direction),
    ContractHead,
    ContractTail,
    Push(Direction),
    PullHead(Direction),
    PullTail(Direction),
}

impl Movement {
    /// Direction of the new head for expansions and pushes.
    pub fn expansion_dir(&self) -> Option<Direction> {
        match self {
            Movement::Expand(d) | Movement::Push(d) => Some(*d),
            _ => None,
        }
    }

    /// For contractions and pulls: `true` if the particle keeps its head.
    pub fn keeps_head(&self) -> Option<bool> {
        match self {
            Movement::ContractHead | Movement::PullHead(_) => Some(true),
            Movement::ContractTail | Movement::PullTail(_) => Some(false),
            _ => None,
        }
    }

    pub fn is_handover(&self) -> bool {
        matches!(
            self,
            Movement::Push(_) | Movement::PullHead(_) | Movement::PullTail(_)
        )
    }

    /// The node a handover partner occupies, given the mover's placement.
    pub fn handover_target(&self, placement: &Placement) -> Option<GridPos> {
        match self {
            Movement::Push(d) => Some(placement.tail.neighbor(*d)),
            Movement::PullHead(d) => Some(placement.tail.neighbor(*d)),
            Movement::PullTail(d) => Some(placement.head().neighbor(*d)),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Errors and anomalies
// ---------------------------------------------------------------------------

/// A violated movement precondition.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ActionError {
    #[error("{action:?} requires a contracted particle")]
    NotContracted { action: Action },
    #[error("{action:?} requires an expanded particle")]
    NotExpanded { action: Action },
    #[error("push handover target {target} does not hold an expanded particle")]
    NoExpandedTarget { target: GridPos },
    #[error("pull handover target {target} does not hold a contracted particle")]
    NoContractedTarget { target: GridPos },
    #[error("{action:?} points into the particle itself")]
    TargetIsSelf { action: Action },
}

/// Non-fatal irregularities reported with a round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Anomaly {
    /// A particle scheduled a second action in one round; the later one wins.
    ActionOverwritten {
        particle: ParticleId,
        previous: Action,
        replacement: Action,
    },
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Check the preconditions of `action` for a particle at `placement`.
///
/// `occupant` looks up the placement of the particle holding a node in the
/// pre-round snapshot. On success the action is returned in global form.
pub fn validate(
    action: Action,
    placement: &Placement,
    compass: Direction,
    chirality: Chirality,
    occupant: impl Fn(GridPos) -> Option<Placement>,
) -> Result<Movement, ActionError> {
    if action.is_expansion() && placement.is_expanded() {
        return Err(ActionError::NotContracted { action });
    }
    if !action.is_expansion() && !placement.is_expanded() {
        return Err(ActionError::NotExpanded { action });
    }
    let movement = action.to_global(compass, chirality);
    let Some(target) = movement.handover_target(placement) else {
        return Ok(movement);
    };
    if placement.part_at(target).is_some() {
        return Err(ActionError::TargetIsSelf { action });
    }
    match (movement, occupant(target)) {
        (Movement::Push(_), Some(p)) if p.is_expanded() => Ok(movement),
        (Movement::Push(_), _) => Err(ActionError::NoExpandedTarget { target }),
        (_, Some(p)) if !p.is_expanded() => Ok(movement),
        _ => Err(ActionError::NoContractedTarget { target }),
    }
}

// ===========================================================================
// Tests
// ===========================================================================

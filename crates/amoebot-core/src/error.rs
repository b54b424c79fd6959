//! Engine-level errors.
//!
//! Every failure during a round surfaces as a [`SimError`] after the engine
//! has rolled back to the last committed round.

use crate::action::ActionError;
use crate::grid::GridPos;
use crate::history::HistoryError;
use crate::id::ParticleId;
use crate::movement::Conflict;

/// Errors raised while setting up a system.
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("node {0} is already occupied")]
    Occupied(GridPos),

    #[error("head {head} and tail {tail} are not adjacent")]
    NotAdjacent { head: GridPos, tail: GridPos },

    #[error("particle {0:?} does not exist")]
    UnknownParticle(ParticleId),

    #[error("particles can only be added at the earliest round while tracking")]
    NotAtEarliestRound,
}

/// Errors raised by the engine.
#[derive(Debug, thiserror::Error)]
pub enum SimError {
    #[error("particle {particle:?} scheduled an invalid action: {source}")]
    InvalidAction {
        particle: ParticleId,
        source: ActionError,
    },

    #[error("simulation conflict: {0}")]
    SimulationConflict(#[from] Conflict),

    #[error("algorithm fault in particle {particle:?}: {reason}")]
    AlgorithmFault { particle: ParticleId, reason: String },

    #[error("rounds cannot be simulated while replaying")]
    ReplayActive,

    #[error(transparent)]
    History(#[from] HistoryError),

    #[error(transparent)]
    Setup(#[from] SetupError),
}

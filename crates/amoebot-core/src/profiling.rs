//! Per-phase timing of the most recent round.
//!
//! Only compiled with the `profiling` feature. The engine records a
//! [`RoundProfile`] after every committed round.

use std::time::Duration;

use crate::sim::Round;

/// Per-phase timing from the most recent committed round.
#[derive(Debug, Clone, Default)]
pub struct RoundProfile {
    /// Behavior move activations.
    pub move_phase: Duration,
    /// Joint movement resolution and position updates.
    pub resolution: Duration,
    /// Beep activations, circuit discovery and delivery.
    pub signal: Duration,
    /// History commit and event emission.
    pub commit: Duration,
    pub total: Duration,
    /// The committed round.
    pub round: Round,
}

impl RoundProfile {
    /// Returns the name and duration of the slowest phase. Ties go to the
    /// later phase.
    pub fn bottleneck_phase(&self) -> (&'static str, Duration) {
        let phases = [
            ("move", self.move_phase),
            ("resolution", self.resolution),
            ("signal", self.signal),
            ("commit", self.commit),
        ];
        phases
            .into_iter()
            .fold(("move", Duration::ZERO), |best, phase| {
                if phase.1 >= best.1 { phase } else { best }
            })
    }
}

// ===========================================================================
// Tests
// ===========================================================================

//! Round bookkeeping, per-round reports and the state hash.

use crate::action::Anomaly;
use crate::id::ParticleId;

/// Simulation time. One round is one synchronous step of every particle.
pub type Round = u64;

// ---------------------------------------------------------------------------
// Simulation state
// ---------------------------------------------------------------------------

/// Round counters tracked by the engine.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SimState {
    /// First round still held by the histories.
    pub earliest_round: Round,

    /// Last committed round. The system state at this round is the state
    /// the next [`Engine::step`](crate::engine::Engine::step) starts from.
    pub latest_round: Round,

    /// Round shown while replaying. Equals `latest_round` while tracking.
    pub marked_round: Round,

    /// Whether the engine follows the latest round.
    pub tracking: bool,

    /// First round at which every behavior reported it was finished.
    pub finished_round: Option<Round>,
}

impl SimState {
    /// Create a state starting at round 0.
    pub fn new() -> Self {
        Self {
            earliest_round: 0,
            latest_round: 0,
            marked_round: 0,
            tracking: true,
            finished_round: None,
        }
    }

    /// The round currently visible to queries.
    pub fn visible_round(&self) -> Round {
        if self.tracking {
            self.latest_round
        } else {
            self.marked_round
        }
    }
}

impl Default for SimState {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Round report
// ---------------------------------------------------------------------------

/// Summary of one committed round, returned by `Engine::step`.
#[derive(Debug, Clone, Default)]
pub struct RoundReport {
    /// The round that was committed (the new latest round).
    pub round: Round,

    /// Particles whose placement changed.
    pub moved: Vec<ParticleId>,

    /// Particles whose movement was dropped under the first-come-first-served
    /// policy.
    pub dropped: Vec<ParticleId>,

    /// Non-fatal scheduling anomalies.
    pub anomalies: Vec<Anomaly>,

    /// Number of circuits discovered in the signal phase.
    pub circuit_count: usize,

    /// Number of circuits that carried a beep or a message.
    pub signalling_circuits: usize,

    /// Whether every behavior reported it was finished after this round.
    pub finished: bool,
}

// ---------------------------------------------------------------------------
// State hash
// ---------------------------------------------------------------------------

/// A deterministic hash of the visible system state.
///
/// Uses FNV-1a (64-bit). Not cryptographic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateHash(pub u64);

impl StateHash {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    pub fn new() -> Self {
        Self(Self::FNV_OFFSET)
    }

    /// Feed bytes into the hash.
    pub fn write(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.0 ^= b as u64;
            self.0 = self.0.wrapping_mul(Self::FNV_PRIME);
        }
    }

    pub fn write_u64(&mut self, v: u64) {
        self.write(&v.to_le_bytes());
    }

    pub fn write_u32(&mut self, v: u32) {
        self.write(&v.to_le_bytes());
    }

    pub fn write_i32(&mut self, v: i32) {
        self.write(&v.to_le_bytes());
    }

    /// Finalize and return the hash value.
    pub fn finish(self) -> u64 {
        self.0
    }
}

impl Default for StateHash {
    fn default() -> Self {
        Self::new()
    }
}

use serde::{Deserialize, Serialize};
use slotmap::new_key_type;

new_key_type! {
    /// Identifies a particle in the system.
    pub struct ParticleId;
}

/// Identifies a circuit within one round's [`CircuitLayout`](crate::circuit::CircuitLayout).
/// Circuit ids are not stable across rounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CircuitId(pub u32);

/// Index of a partition set within one particle's pin configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartitionSetId(pub u8);

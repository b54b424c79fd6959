//! Persistence of complete particle systems.
//!
//! [`SaveData`] holds every particle's fixed attributes and full histories.
//! It is written as JSON via `serde_json` or as a binary blob via `bitcode`
//! with a versioned header. Behaviors are not serialized; they are rebuilt
//! by name from a [`BehaviorRegistry`] and must keep any state they need
//! across a save in attributes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use slotmap::{SecondaryMap, SlotMap};

use crate::action::Action;
use crate::behavior::{BehaviorRegistry, RegistryError};
use crate::config::{ConfigError, SimConfig};
use crate::engine::Engine;
use crate::grid::{Chirality, Direction, GridPos};
use crate::history::ValueHistory;
use crate::particle::{AttributeValue, BondFlags, Particle, Signals};
use crate::pins::PinConfiguration;
use crate::sim::{Round, SimState};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Magic number identifying an amoebot system snapshot.
pub const SNAPSHOT_MAGIC: u32 = 0xA30B_0001;

/// Current format version. Increment when breaking the wire format.
pub const FORMAT_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors that can occur during serialization.
#[derive(Debug, thiserror::Error)]
pub enum SerializeError {
    #[error("bitcode encoding failed: {0}")]
    Encode(String),
    #[error("json encoding failed: {0}")]
    Json(String),
}

/// Errors that can occur while decoding or loading a saved system.
#[derive(Debug, thiserror::Error)]
pub enum DeserializeError {
    #[error("invalid magic number: expected 0x{:08X}, got 0x{:08X}", SNAPSHOT_MAGIC, .0)]
    InvalidMagic(u32),
    #[error("unsupported format version: expected {}, got {}", FORMAT_VERSION, .0)]
    UnsupportedVersion(u32),
    #[error("snapshot from future version {0} (this build supports up to {FORMAT_VERSION})")]
    FutureVersion(u32),
    #[error("bitcode decoding failed: {0}")]
    Decode(String),
    #[error("json decoding failed: {0}")]
    Json(String),
    #[error("malformed save data: {0}")]
    Malformed(String),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

// ---------------------------------------------------------------------------
// Snapshot header
// ---------------------------------------------------------------------------

/// Header prepended to every binary snapshot. Enables format detection
/// and version checking before the payload is used.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotHeader {
    pub magic: u32,
    pub version: u32,
    /// Latest round at the time the snapshot was taken.
    pub round: Round,
}

impl SnapshotHeader {
    /// Create a header for the current format version.
    pub fn new(round: Round) -> Self {
        Self {
            magic: SNAPSHOT_MAGIC,
            version: FORMAT_VERSION,
            round,
        }
    }

    pub fn validate(&self) -> Result<(), DeserializeError> {
        if self.magic != SNAPSHOT_MAGIC {
            return Err(DeserializeError::InvalidMagic(self.magic));
        }
        if self.version > FORMAT_VERSION {
            return Err(DeserializeError::FutureVersion(self.version));
        }
        if self.version < FORMAT_VERSION {
            return Err(DeserializeError::UnsupportedVersion(self.version));
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SystemSnapshot {
    header: SnapshotHeader,
    data: SaveData,
}

/// Read just the header of a binary snapshot.
///
/// bitcode has no partial decoding, so the whole snapshot is decoded.
pub fn read_snapshot_header(data: &[u8]) -> Result<SnapshotHeader, DeserializeError> {
    let snapshot: SystemSnapshot =
        bitcode::deserialize(data).map_err(|e| DeserializeError::Decode(e.to_string()))?;
    Ok(snapshot.header)
}

// ---------------------------------------------------------------------------
// Save data
// ---------------------------------------------------------------------------

/// A complete particle system with its history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveData {
    pub earliest_round: Round,
    pub latest_round: Round,
    pub finished_round: Option<Round>,
    /// Index into `particles`.
    pub anchor: Option<usize>,
    pub pins_per_edge: u8,
    pub particles: Vec<ParticleData>,
}

/// One particle's fixed attributes and histories.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticleData {
    pub behavior: String,
    pub compass: Direction,
    pub chirality: Chirality,
    pub position_history: ValueHistory<GridPos>,
    pub expansion_history: ValueHistory<Option<Direction>>,
    pub bond_history: ValueHistory<BondFlags>,
    pub action_history: ValueHistory<Option<Action>>,
    pub pin_history: ValueHistory<PinConfiguration>,
    pub sent_history: ValueHistory<Signals>,
    pub received_history: ValueHistory<Signals>,
    pub failed_history: ValueHistory<bool>,
    pub attributes: BTreeMap<String, ValueHistory<Option<AttributeValue>>>,
}

impl SaveData {
    pub fn to_json(&self) -> Result<String, SerializeError> {
        serde_json::to_string_pretty(self).map_err(|e| SerializeError::Json(e.to_string()))
    }

    pub fn from_json(text: &str) -> Result<Self, DeserializeError> {
        serde_json::from_str(text).map_err(|e| DeserializeError::Json(e.to_string()))
    }

    /// Encode as a bitcode blob with a [`SnapshotHeader`].
    pub fn to_bytes(&self) -> Result<Vec<u8>, SerializeError> {
        let snapshot = SystemSnapshot {
            header: SnapshotHeader::new(self.latest_round),
            data: self.clone(),
        };
        bitcode::serialize(&snapshot).map_err(|e| SerializeError::Encode(e.to_string()))
    }

    /// Decode a bitcode blob, validating the header first.
    pub fn from_bytes(data: &[u8]) -> Result<Self, DeserializeError> {
        let snapshot: SystemSnapshot =
            bitcode::deserialize(data).map_err(|e| DeserializeError::Decode(e.to_string()))?;
        snapshot.header.validate()?;
        Ok(snapshot.data)
    }

    /// Check that every history covers exactly `earliest_round..=latest_round`
    /// and that pin configurations match the system's pin count.
    fn check(&self) -> Result<(), DeserializeError> {
        let malformed = |msg: String| Err(DeserializeError::Malformed(msg));
        if self.earliest_round > self.latest_round {
            return malformed(format!(
                "earliest round {} after latest round {}",
                self.earliest_round, self.latest_round
            ));
        }
        if let Some(anchor) = self.anchor
            && anchor >= self.particles.len()
        {
            return malformed(format!("anchor index {anchor} out of range"));
        }
        for (i, p) in self.particles.iter().enumerate() {
            let spans = [
                span(&p.position_history),
                span(&p.expansion_history),
                span(&p.bond_history),
                span(&p.action_history),
                span(&p.pin_history),
                span(&p.sent_history),
                span(&p.received_history),
                span(&p.failed_history),
            ];
            let attributes = p.attributes.values().map(span);
            for (well_formed, first, last) in spans.into_iter().chain(attributes) {
                if !well_formed || first != self.earliest_round || last != self.latest_round {
                    return malformed(format!(
                        "particle {i} has a history spanning {first}..={last}"
                    ));
                }
            }
            if p
                .pin_history
                .entries()
                .any(|(_, pins)| pins.pins_per_edge() != self.pins_per_edge as usize)
            {
                return malformed(format!("particle {i} has pins of a different size"));
            }
        }
        Ok(())
    }
}

fn span<T: Clone + PartialEq>(history: &ValueHistory<T>) -> (bool, Round, Round) {
    (
        history.is_well_formed(),
        history.first_round(),
        history.last_round(),
    )
}

// ---------------------------------------------------------------------------
// Engine save / load
// ---------------------------------------------------------------------------

impl Engine {
    /// Capture the full system, independent of the replay marker.
    pub fn save(&self) -> SaveData {
        let anchor = self
            .anchor
            .and_then(|a| self.order.iter().position(|id| *id == a));
        let particles = self
            .order
            .iter()
            .filter_map(|id| self.particles.get(*id))
            .map(|p| ParticleData {
                behavior: p.behavior.clone(),
                compass: p.compass,
                chirality: p.chirality,
                position_history: p.tail.clone(),
                expansion_history: p.expansion.clone(),
                bond_history: p.bonds.clone(),
                action_history: p.action.clone(),
                pin_history: p.pins.clone(),
                sent_history: p.sent.clone(),
                received_history: p.received.clone(),
                failed_history: p.movement_failed.clone(),
                attributes: p.attributes.clone(),
            })
            .collect();
        SaveData {
            earliest_round: self.sim_state.earliest_round,
            latest_round: self.sim_state.latest_round,
            finished_round: self.sim_state.finished_round,
            anchor,
            pins_per_edge: self.config.pins_per_edge,
            particles,
        }
    }

    /// Rebuild a system from saved data. The engine tracks the latest round.
    ///
    /// `config.pins_per_edge` is replaced by the saved value.
    pub fn load(
        save: SaveData,
        registry: &BehaviorRegistry,
        mut config: SimConfig,
    ) -> Result<Self, DeserializeError> {
        config.pins_per_edge = save.pins_per_edge;
        let mut engine = Engine::new(config)?;
        save.check()?;

        let mut particles = SlotMap::with_key();
        let mut behaviors = SecondaryMap::new();
        let mut order = Vec::with_capacity(save.particles.len());
        for data in save.particles {
            let behavior = registry.create(&data.behavior)?;
            let id = particles.insert(Particle {
                behavior: data.behavior,
                compass: data.compass,
                chirality: data.chirality,
                tail: data.position_history,
                expansion: data.expansion_history,
                bonds: data.bond_history,
                action: data.action_history,
                pins: data.pin_history,
                sent: data.sent_history,
                received: data.received_history,
                movement_failed: data.failed_history,
                attributes: data.attributes,
            });
            behaviors.insert(id, behavior);
            order.push(id);
        }

        engine.anchor = save.anchor.and_then(|i| order.get(i).copied());
        engine.particles = particles;
        engine.behaviors = behaviors;
        engine.order = order;
        engine.sim_state = SimState {
            earliest_round: save.earliest_round,
            latest_round: save.latest_round,
            marked_round: save.latest_round,
            tracking: true,
            finished_round: save.finished_round,
        };
        engine.rebuild_index();

        let occupied: usize = engine
            .particles
            .values()
            .map(|p| p.placement().nodes().count())
            .sum();
        if occupied != engine.index.len() {
            return Err(DeserializeError::Malformed(
                "particles overlap at the latest round".into(),
            ));
        }
        engine.layout = engine.compute_layout();
        Ok(engine)
    }

    /// Serialize the system to a binary blob via bitcode.
    pub fn serialize(&self) -> Result<Vec<u8>, SerializeError> {
        self.save().to_bytes()
    }

    /// Deserialize a system from a binary blob.
    pub fn deserialize(
        data: &[u8],
        registry: &BehaviorRegistry,
        config: SimConfig,
    ) -> Result<Self, DeserializeError> {
        Self::load(SaveData::from_bytes(data)?, registry, config)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

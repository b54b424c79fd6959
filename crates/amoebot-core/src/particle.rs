//! Particle state: fixed attributes plus one [`ValueHistory`] per versioned
//! attribute.
//!
//! The value of every history at round `r` is the particle's state at the
//! start of round `r`. All histories of a particle share the same first
//! round, so the whole particle can be seeked, truncated and shifted as a
//! unit.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::action::Action;
use crate::grid::{Chirality, Direction, GridPos, MAX_LABELS, Placement, to_global, to_local};
use crate::history::{HistoryError, Timeline, ValueHistory};
use crate::id::{ParticleId, PartitionSetId};
use crate::pins::PinConfiguration;
use crate::sim::Round;

// ---------------------------------------------------------------------------
// Bond flags
// ---------------------------------------------------------------------------

/// Per-label bond state in the particle's local label numbering.
///
/// Bit `l` of `active` is set while the bond at local label `l` is kept;
/// bit `l` of `marked` is set for bonds the particle carries along with its
/// own movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BondFlags {
    pub active: u16,
    pub marked: u16,
}

impl BondFlags {
    const ALL: u16 = (1 << MAX_LABELS) - 1;

    pub fn is_active(&self, label: usize) -> bool {
        self.active & (1 << label) != 0
    }

    pub fn is_marked(&self, label: usize) -> bool {
        self.marked & (1 << label) != 0
    }

    pub fn set_active(&mut self, label: usize, active: bool) {
        if active {
            self.active |= 1 << label;
        } else {
            self.active &= !(1 << label);
        }
    }

    pub fn set_marked(&mut self, label: usize, marked: bool) {
        if marked {
            self.marked |= 1 << label;
        } else {
            self.marked &= !(1 << label);
        }
    }
}

impl Default for BondFlags {
    /// All bonds active, none marked.
    fn default() -> Self {
        Self {
            active: Self::ALL,
            marked: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Signals
// ---------------------------------------------------------------------------

/// Payload carried on a circuit for one round. When several partition sets
/// of one circuit send messages, the greatest message wins.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Message(pub Vec<u8>);

/// Beeps and messages attached to a particle's partition sets in one round.
///
/// Both lists are kept sorted by partition set and hold at most one entry
/// per set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Signals {
    pub beeps: Vec<PartitionSetId>,
    pub messages: Vec<(PartitionSetId, Message)>,
}

impl Signals {
    pub fn is_empty(&self) -> bool {
        self.beeps.is_empty() && self.messages.is_empty()
    }

    pub fn add_beep(&mut self, set: PartitionSetId) {
        if let Err(i) = self.beeps.binary_search(&set) {
            self.beeps.insert(i, set);
        }
    }

    /// Attach `message` to `set`, replacing any earlier message on it.
    pub fn add_message(&mut self, set: PartitionSetId, message: Message) {
        match self.messages.binary_search_by_key(&set, |(s, _)| *s) {
            Ok(i) => self.messages[i].1 = message,
            Err(i) => self.messages.insert(i, (set, message)),
        }
    }

    pub fn has_beep(&self, set: PartitionSetId) -> bool {
        self.beeps.binary_search(&set).is_ok()
    }

    pub fn message(&self, set: PartitionSetId) -> Option<&Message> {
        self.messages
            .binary_search_by_key(&set, |(s, _)| *s)
            .ok()
            .map(|i| &self.messages[i].1)
    }
}

// ---------------------------------------------------------------------------
// Attributes
// ---------------------------------------------------------------------------

/// A named, versioned value owned by a particle's behavior.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttributeValue {
    Bool(bool),
    Int(i64),
    Dir(Option<Direction>),
    Text(String),
}

// ---------------------------------------------------------------------------
// Particle
// ---------------------------------------------------------------------------

/// A particle and its complete history.
#[derive(Debug, Clone)]
pub struct Particle {
    pub(crate) behavior: String,
    pub(crate) compass: Direction,
    pub(crate) chirality: Chirality,
    pub(crate) tail: ValueHistory<GridPos>,
    /// Global expansion direction; `None` while contracted.
    pub(crate) expansion: ValueHistory<Option<Direction>>,
    pub(crate) bonds: ValueHistory<BondFlags>,
    /// Action executed in the round leading to this state.
    pub(crate) action: ValueHistory<Option<Action>>,
    pub(crate) pins: ValueHistory<PinConfiguration>,
    pub(crate) sent: ValueHistory<Signals>,
    pub(crate) received: ValueHistory<Signals>,
    pub(crate) movement_failed: ValueHistory<bool>,
    /// Absent attributes are `None` in rounds before they were first set.
    pub(crate) attributes: BTreeMap<String, ValueHistory<Option<AttributeValue>>>,
}

impl Particle {
    pub(crate) fn new(
        behavior: String,
        placement: Placement,
        compass: Direction,
        chirality: Chirality,
        pins_per_edge: u8,
        round: Round,
    ) -> Self {
        let local_exp = placement.expansion.map(|e| to_local(e, compass, chirality));
        Self {
            behavior,
            compass,
            chirality,
            tail: ValueHistory::new(placement.tail, round),
            expansion: ValueHistory::new(placement.expansion, round),
            bonds: ValueHistory::new(BondFlags::default(), round),
            action: ValueHistory::new(None, round),
            pins: ValueHistory::new(PinConfiguration::singleton(pins_per_edge, local_exp), round),
            sent: ValueHistory::new(Signals::default(), round),
            received: ValueHistory::new(Signals::default(), round),
            movement_failed: ValueHistory::new(false, round),
            attributes: BTreeMap::new(),
        }
    }

    /// Placement shown at the marked round.
    pub(crate) fn placement(&self) -> Placement {
        Placement {
            tail: *self.tail.marked_value(),
            expansion: *self.expansion.marked_value(),
        }
    }

    /// First round held by the particle's histories.
    pub(crate) fn first_round(&self) -> Round {
        self.tail.first_round()
    }

    /// Set an attribute from `round` on, creating its history if needed.
    pub(crate) fn record_attribute(
        &mut self,
        name: &str,
        value: AttributeValue,
        round: Round,
    ) -> Result<(), HistoryError> {
        if let Some(history) = self.attributes.get_mut(name) {
            return history.record_at(Some(value), round);
        }
        let mut history = ValueHistory::new(None, self.first_round());
        history.record_at(Some(value), round)?;
        self.attributes.insert(name.to_owned(), history);
        Ok(())
    }

    /// Every history of the particle, type-erased.
    fn timelines_mut(&mut self) -> Vec<&mut dyn Timeline> {
        let mut all: Vec<&mut dyn Timeline> = vec![
            &mut self.tail,
            &mut self.expansion,
            &mut self.bonds,
            &mut self.action,
            &mut self.pins,
            &mut self.sent,
            &mut self.received,
            &mut self.movement_failed,
        ];
        for history in self.attributes.values_mut() {
            all.push(history);
        }
        all
    }

    /// Apply `op` to every history, stopping at the first error.
    pub(crate) fn for_each_timeline(
        &mut self,
        mut op: impl FnMut(&mut dyn Timeline) -> Result<(), HistoryError>,
    ) -> Result<(), HistoryError> {
        for timeline in self.timelines_mut() {
            op(timeline)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ParticleView
// ---------------------------------------------------------------------------

/// Read-only view of a particle at the engine's visible round.
#[derive(Debug, Clone, Copy)]
pub struct ParticleView<'a> {
    id: ParticleId,
    particle: &'a Particle,
}

impl<'a> ParticleView<'a> {
    pub(crate) fn new(id: ParticleId, particle: &'a Particle) -> Self {
        Self { id, particle }
    }

    pub fn id(&self) -> ParticleId {
        self.id
    }

    /// Registered name of the particle's behavior.
    pub fn behavior_name(&self) -> &'a str {
        &self.particle.behavior
    }

    /// The global direction the particle calls East.
    pub fn compass(&self) -> Direction {
        self.particle.compass
    }

    pub fn chirality(&self) -> Chirality {
        self.particle.chirality
    }

    pub fn placement(&self) -> Placement {
        self.particle.placement()
    }

    pub fn head(&self) -> GridPos {
        self.placement().head()
    }

    pub fn tail(&self) -> GridPos {
        self.placement().tail
    }

    pub fn is_expanded(&self) -> bool {
        self.placement().is_expanded()
    }

    /// Expansion direction in the global frame.
    pub fn global_expansion(&self) -> Option<Direction> {
        *self.particle.expansion.marked_value()
    }

    /// Expansion direction in the particle's own frame.
    pub fn local_expansion(&self) -> Option<Direction> {
        self.global_expansion().map(|e| self.local_direction(e))
    }

    /// Global direction of the particle's local `dir`.
    pub fn global_direction(&self, dir: Direction) -> Direction {
        to_global(dir, self.particle.compass, self.particle.chirality)
    }

    /// Local direction of the global `dir` as seen by the particle.
    pub fn local_direction(&self, dir: Direction) -> Direction {
        to_local(dir, self.particle.compass, self.particle.chirality)
    }

    pub fn bonds(&self) -> BondFlags {
        *self.particle.bonds.marked_value()
    }

    /// Action executed in the round leading to the visible state.
    pub fn last_action(&self) -> Option<Action> {
        *self.particle.action.marked_value()
    }

    pub fn pin_configuration(&self) -> &'a PinConfiguration {
        self.particle.pins.marked_value()
    }

    /// Signals sent in the round leading to the visible state.
    pub fn sent(&self) -> &'a Signals {
        self.particle.sent.marked_value()
    }

    /// Signals received in the round leading to the visible state.
    pub fn received(&self) -> &'a Signals {
        self.particle.received.marked_value()
    }

    /// Whether the particle's last movement was dropped.
    pub fn movement_failed(&self) -> bool {
        *self.particle.movement_failed.marked_value()
    }

    pub fn attribute(&self, name: &str) -> Option<&'a AttributeValue> {
        self.particle
            .attributes
            .get(name)
            .and_then(|h| h.marked_value().as_ref())
    }
}

// ===========================================================================
// Tests
// ===========================================================================

//! The capability contract between the engine and particle algorithms.
//!
//! A particle's algorithm implements [`Behavior`]. Once per round the engine
//! calls [`Behavior::activate_move`] with a [`MoveContext`] and, after the
//! movements are resolved, [`Behavior::activate_beep`] with a
//! [`BeepContext`]. Signals arriving on circuits are delivered through
//! [`Behavior::receive_beep`] and [`Behavior::receive_message`].
//!
//! Contexts only read the snapshot taken at the start of their phase; all
//! writes are staged and applied by the engine afterwards, so no particle
//! observes another particle's decisions within the same phase.
//!
//! Behaviors are not rolled back with the histories. State that must survive
//! replay, rollback or persistence belongs in attributes
//! ([`MoveContext::set_attribute`]).

use std::collections::{BTreeMap, HashMap};
use std::ops::ControlFlow;

use slotmap::SlotMap;
use tracing::warn;

use crate::action::{self, Action, ActionError, Anomaly, Movement};
use crate::grid::{Direction, GridPos, direction_of_label, label_count, label_of};
use crate::id::{ParticleId, PartitionSetId};
use crate::particle::{AttributeValue, BondFlags, Message, Particle, ParticleView, Signals};
use crate::pins::{PinConfiguration, PinError};
use crate::sim::Round;

// ---------------------------------------------------------------------------
// Behavior trait
// ---------------------------------------------------------------------------

/// Result of a behavior callback.
pub type BehaviorResult = Result<(), BehaviorError>;

/// A particle algorithm.
///
/// All callbacks default to no-ops, so behaviors only override what they
/// use. An error returned from a callback aborts the round.
pub trait Behavior: std::fmt::Debug + Send {
    /// Registered name, used to rebuild the behavior when loading a save.
    fn name(&self) -> &str;

    /// Move phase: schedule at most one action and set bond flags.
    fn activate_move(&mut self, _ctx: &mut MoveContext<'_>) -> BehaviorResult {
        Ok(())
    }

    /// Signal phase: configure pins and send beeps or messages.
    fn activate_beep(&mut self, _ctx: &mut BeepContext<'_>) -> BehaviorResult {
        Ok(())
    }

    /// A beep arrived on the circuit of partition set `set`.
    fn receive_beep(&mut self, _set: PartitionSetId) -> BehaviorResult {
        Ok(())
    }

    /// A message arrived on the circuit of partition set `set`.
    fn receive_message(&mut self, _set: PartitionSetId, _message: &Message) -> BehaviorResult {
        Ok(())
    }

    /// Whether the particle has terminated. Checked after every round.
    fn is_finished(&self, _view: &ParticleView<'_>) -> bool {
        false
    }
}

/// Failures reported by behavior callbacks.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BehaviorError {
    #[error(transparent)]
    Action(#[from] ActionError),
    #[error(transparent)]
    Pins(#[from] PinError),
    #[error("label {label} out of range for a particle with {count} labels")]
    InvalidLabel { label: usize, count: usize },
    #[error("{0}")]
    Failed(String),
}

// ---------------------------------------------------------------------------
// Staged intent
// ---------------------------------------------------------------------------

/// Everything a particle decided during one round, applied by the engine.
#[derive(Debug, Clone, Default)]
pub(crate) struct ParticleIntent {
    /// Scheduled action, already validated and converted to global form.
    pub action: Option<(Action, Movement)>,
    /// Bond flags in local labels. Reset to the default every round.
    pub bonds: BondFlags,
    pub attributes: BTreeMap<String, AttributeValue>,
    pub anomalies: Vec<Anomaly>,
    /// New pin configuration, if the particle set one.
    pub pins: Option<PinConfiguration>,
    pub sent: Signals,
}

// ---------------------------------------------------------------------------
// Snapshot and neighbors
// ---------------------------------------------------------------------------

/// Read-only state shared by every context of one phase.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Snapshot<'a> {
    pub particles: &'a SlotMap<ParticleId, Particle>,
    pub index: &'a BTreeMap<GridPos, ParticleId>,
}

/// A particle found next to the querying particle.
#[derive(Debug, Clone, Copy)]
pub struct Neighbor<'a> {
    pub view: ParticleView<'a>,
    /// Local label of the edge leading to the neighbor.
    pub label: usize,
    /// Local direction of that edge.
    pub direction: Direction,
    /// Whether the edge leaves the querying particle's head.
    pub from_head: bool,
    /// Whether the edge ends at the neighbor's head.
    pub at_head: bool,
}

impl<'a> Snapshot<'a> {
    fn view(&self, id: ParticleId) -> Option<ParticleView<'a>> {
        self.particles.get(id).map(|p| ParticleView::new(id, p))
    }

    /// The neighbor behind local `label` of particle `id`.
    fn neighbor_at_label(&self, id: ParticleId, label: usize) -> Option<Neighbor<'a>> {
        let me = self.view(id)?;
        let local_exp = me.local_expansion();
        let (local_dir, from_head) = direction_of_label(label, local_exp)?;
        let global_dir = me.global_direction(local_dir);
        let node = me.placement().part(from_head).neighbor(global_dir);
        let other = *self.index.get(&node)?;
        if other == id {
            return None;
        }
        let view = self.view(other)?;
        Some(Neighbor {
            view,
            label,
            direction: local_dir,
            from_head,
            at_head: view.placement().part_at(node)?,
        })
    }

    fn for_each_neighbor(
        &self,
        id: ParticleId,
        start_dir: Direction,
        start_at_head: bool,
        with_chirality: bool,
        max_search: usize,
        mut visit: impl FnMut(Neighbor<'a>) -> ControlFlow<()>,
    ) {
        let Some(me) = self.view(id) else { return };
        let local_exp = me.local_expansion();
        let count = label_count(local_exp);
        // The internal edge has no label; start at the next one instead.
        let start = label_of(start_dir, start_at_head, local_exp).unwrap_or_else(|| {
            label_of(start_dir.rotate(1), start_at_head, local_exp).unwrap_or(0)
        });
        for step in 0..count.min(max_search) {
            let label = if with_chirality {
                (start + step) % count
            } else {
                (start + count - step) % count
            };
            if let Some(neighbor) = self.neighbor_at_label(id, label)
                && visit(neighbor).is_break()
            {
                return;
            }
        }
    }
}

fn check_label(label: usize, local_exp: Option<Direction>) -> Result<(), BehaviorError> {
    let count = label_count(local_exp);
    if label >= count {
        return Err(BehaviorError::InvalidLabel { label, count });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// MoveContext
// ---------------------------------------------------------------------------

/// Capabilities available during the move phase.
pub struct MoveContext<'a> {
    id: ParticleId,
    round: Round,
    snapshot: Snapshot<'a>,
    intent: &'a mut ParticleIntent,
}

impl<'a> MoveContext<'a> {
    pub(crate) fn new(
        id: ParticleId,
        round: Round,
        snapshot: Snapshot<'a>,
        intent: &'a mut ParticleIntent,
    ) -> Self {
        Self {
            id,
            round,
            snapshot,
            intent,
        }
    }

    pub fn id(&self) -> ParticleId {
        self.id
    }

    /// The round being computed.
    pub fn round(&self) -> Round {
        self.round
    }

    fn me(&self) -> Option<ParticleView<'a>> {
        self.snapshot.view(self.id)
    }

    /// The particle's own pre-round state.
    pub fn view(&self) -> Option<ParticleView<'a>> {
        self.me()
    }

    pub fn is_expanded(&self) -> bool {
        self.me().is_some_and(|v| v.is_expanded())
    }

    /// Expansion direction in the particle's own frame.
    pub fn expansion(&self) -> Option<Direction> {
        self.me().and_then(|v| v.local_expansion())
    }

    /// Signals delivered in the previous round.
    pub fn received(&self) -> Option<&'a Signals> {
        self.me().map(|v| v.received())
    }

    /// Whether the particle's previous movement was dropped.
    pub fn movement_failed(&self) -> bool {
        self.me().is_some_and(|v| v.movement_failed())
    }

    // -----------------------------------------------------------------------
    // Actions
    // -----------------------------------------------------------------------

    fn schedule(&mut self, action: Action) -> Result<(), ActionError> {
        let Some(me) = self.me() else {
            return Ok(());
        };
        let snapshot = self.snapshot;
        let movement = action::validate(
            action,
            &me.placement(),
            me.compass(),
            me.chirality(),
            |pos| {
                let id = snapshot.index.get(&pos)?;
                snapshot.particles.get(*id).map(|p| p.placement())
            },
        )?;
        if let Some((previous, _)) = self.intent.action.replace((action, movement)) {
            warn!(particle = ?self.id, ?previous, replacement = ?action, "action overwritten");
            self.intent.anomalies.push(Anomaly::ActionOverwritten {
                particle: self.id,
                previous,
                replacement: action,
            });
        }
        Ok(())
    }

    pub fn expand(&mut self, dir: Direction) -> Result<(), ActionError> {
        self.schedule(Action::Expand(dir))
    }

    pub fn contract_head(&mut self) -> Result<(), ActionError> {
        self.schedule(Action::ContractHead)
    }

    pub fn contract_tail(&mut self) -> Result<(), ActionError> {
        self.schedule(Action::ContractTail)
    }

    pub fn push_handover(&mut self, dir: Direction) -> Result<(), ActionError> {
        self.schedule(Action::PushHandover(dir))
    }

    pub fn pull_handover_head(&mut self, dir: Direction) -> Result<(), ActionError> {
        self.schedule(Action::PullHandoverHead(dir))
    }

    pub fn pull_handover_tail(&mut self, dir: Direction) -> Result<(), ActionError> {
        self.schedule(Action::PullHandoverTail(dir))
    }

    /// The action staged so far.
    pub fn scheduled(&self) -> Option<Action> {
        self.intent.action.map(|(a, _)| a)
    }

    // -----------------------------------------------------------------------
    // Bonds
    // -----------------------------------------------------------------------

    /// Keep or release the bond at local `label`.
    pub fn set_bond_active(&mut self, label: usize, active: bool) -> BehaviorResult {
        check_label(label, self.expansion())?;
        self.intent.bonds.set_active(label, active);
        Ok(())
    }

    /// Mark the bond at local `label` so it follows this particle's movement.
    pub fn mark_bond(&mut self, label: usize, marked: bool) -> BehaviorResult {
        check_label(label, self.expansion())?;
        self.intent.bonds.set_marked(label, marked);
        Ok(())
    }

    /// Bond flags staged for this round.
    pub fn bonds(&self) -> BondFlags {
        self.intent.bonds
    }

    // -----------------------------------------------------------------------
    // Neighbors
    // -----------------------------------------------------------------------

    /// The neighbor in local direction `dir` of the head or tail.
    pub fn neighbor_at(&self, dir: Direction, head: bool) -> Option<Neighbor<'a>> {
        let label = label_of(dir, head, self.expansion())?;
        self.snapshot.neighbor_at_label(self.id, label)
    }

    /// Visit neighbors label by label, starting at `start_dir` of the head
    /// (or tail), following the particle's own rotational sense when
    /// `with_chirality` is set. At most `max_search` labels are inspected;
    /// `visit` can stop early by returning `ControlFlow::Break`.
    pub fn for_each_neighbor(
        &self,
        start_dir: Direction,
        start_at_head: bool,
        with_chirality: bool,
        max_search: usize,
        visit: impl FnMut(Neighbor<'a>) -> ControlFlow<()>,
    ) {
        self.snapshot.for_each_neighbor(
            self.id,
            start_dir,
            start_at_head,
            with_chirality,
            max_search,
            visit,
        );
    }

    /// Whether a neighbor exists in local direction `dir`.
    pub fn has_neighbor(&self, dir: Direction, head: bool) -> bool {
        self.neighbor_at(dir, head).is_some()
    }

    // -----------------------------------------------------------------------
    // Attributes
    // -----------------------------------------------------------------------

    /// The attribute value, including writes staged this round.
    pub fn attribute(&self, name: &str) -> Option<AttributeValue> {
        self.intent
            .attributes
            .get(name)
            .cloned()
            .or_else(|| self.me().and_then(|v| v.attribute(name).cloned()))
    }

    /// Stage an attribute write. It becomes visible in the next round's
    /// snapshot.
    pub fn set_attribute(&mut self, name: &str, value: AttributeValue) {
        self.intent.attributes.insert(name.to_owned(), value);
    }
}

// ---------------------------------------------------------------------------
// BeepContext
// ---------------------------------------------------------------------------

/// Capabilities available during the signal phase.
pub struct BeepContext<'a> {
    id: ParticleId,
    round: Round,
    pins_per_edge: u8,
    snapshot: Snapshot<'a>,
    intent: &'a mut ParticleIntent,
}

impl<'a> BeepContext<'a> {
    pub(crate) fn new(
        id: ParticleId,
        round: Round,
        pins_per_edge: u8,
        snapshot: Snapshot<'a>,
        intent: &'a mut ParticleIntent,
    ) -> Self {
        Self {
            id,
            round,
            pins_per_edge,
            snapshot,
            intent,
        }
    }

    pub fn id(&self) -> ParticleId {
        self.id
    }

    pub fn round(&self) -> Round {
        self.round
    }

    fn me(&self) -> Option<ParticleView<'a>> {
        self.snapshot.view(self.id)
    }

    /// The particle's state after this round's movements.
    pub fn view(&self) -> Option<ParticleView<'a>> {
        self.me()
    }

    pub fn expansion(&self) -> Option<Direction> {
        self.me().and_then(|v| v.local_expansion())
    }

    /// Signals delivered in the previous round.
    pub fn received(&self) -> Option<&'a Signals> {
        self.me().map(|v| v.received())
    }

    // -----------------------------------------------------------------------
    // Pins
    // -----------------------------------------------------------------------

    /// The pin configuration in effect, including a staged replacement.
    pub fn pin_configuration(&self) -> Option<&PinConfiguration> {
        match &self.intent.pins {
            Some(pins) => Some(pins),
            None => self.me().map(|v| v.pin_configuration()),
        }
    }

    /// A configuration with every pin in its own set, shaped for this
    /// particle.
    pub fn singleton_pins(&self) -> PinConfiguration {
        PinConfiguration::singleton(self.pins_per_edge, self.expansion())
    }

    /// A configuration with every pin in set 0, shaped for this particle.
    pub fn global_pins(&self) -> PinConfiguration {
        PinConfiguration::global(self.pins_per_edge, self.expansion())
    }

    /// Stage a new pin configuration for this round.
    pub fn set_pin_configuration(&mut self, pins: PinConfiguration) -> BehaviorResult {
        pins.check_shape(self.expansion())?;
        if pins.pins_per_edge() != self.pins_per_edge as usize {
            return Err(BehaviorError::Failed(format!(
                "pin configuration has {} pins per edge, system uses {}",
                pins.pins_per_edge(),
                self.pins_per_edge
            )));
        }
        self.intent.pins = Some(pins);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Signals
    // -----------------------------------------------------------------------

    pub fn send_beep(&mut self, set: PartitionSetId) {
        self.intent.sent.add_beep(set);
    }

    pub fn send_message(&mut self, set: PartitionSetId, message: Message) {
        self.intent.sent.add_message(set, message);
    }

    // -----------------------------------------------------------------------
    // Neighbors and attributes
    // -----------------------------------------------------------------------

    pub fn neighbor_at(&self, dir: Direction, head: bool) -> Option<Neighbor<'a>> {
        let label = label_of(dir, head, self.expansion())?;
        self.snapshot.neighbor_at_label(self.id, label)
    }

    /// See [`MoveContext::for_each_neighbor`].
    pub fn for_each_neighbor(
        &self,
        start_dir: Direction,
        start_at_head: bool,
        with_chirality: bool,
        max_search: usize,
        visit: impl FnMut(Neighbor<'a>) -> ControlFlow<()>,
    ) {
        self.snapshot.for_each_neighbor(
            self.id,
            start_dir,
            start_at_head,
            with_chirality,
            max_search,
            visit,
        );
    }

    pub fn attribute(&self, name: &str) -> Option<AttributeValue> {
        self.intent
            .attributes
            .get(name)
            .cloned()
            .or_else(|| self.me().and_then(|v| v.attribute(name).cloned()))
    }

    pub fn set_attribute(&mut self, name: &str, value: AttributeValue) {
        self.intent.attributes.insert(name.to_owned(), value);
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Creates a fresh behavior instance.
pub type BehaviorFactory = Box<dyn Fn() -> Box<dyn Behavior> + Send + Sync>;

/// Errors raised by [`BehaviorRegistry`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("behavior already registered: {0}")]
    Duplicate(String),
    #[error("unknown behavior: {0}")]
    Unknown(String),
}

/// Maps behavior names to factories, used to rebuild behaviors when a saved
/// system is loaded.
#[derive(Default)]
pub struct BehaviorRegistry {
    factories: HashMap<String, BehaviorFactory>,
}

impl std::fmt::Debug for BehaviorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.factories.keys().collect();
        names.sort();
        f.debug_struct("BehaviorRegistry")
            .field("behaviors", &names)
            .finish()
    }
}

impl BehaviorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under `name`.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        factory: impl Fn() -> Box<dyn Behavior> + Send + Sync + 'static,
    ) -> Result<(), RegistryError> {
        let name = name.into();
        if self.factories.contains_key(&name) {
            return Err(RegistryError::Duplicate(name));
        }
        self.factories.insert(name, Box::new(factory));
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Instantiate the behavior registered under `name`.
    pub fn create(&self, name: &str) -> Result<Box<dyn Behavior>, RegistryError> {
        self.factories
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| RegistryError::Unknown(name.to_owned()))
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

//! The round controller: owns the particle system and runs rounds.
//!
//! # Architecture
//!
//! The `Engine` owns:
//! - The particles ([`Particle`], keyed by [`ParticleId`]) with their full
//!   histories, and one [`Behavior`] per particle (SoA, `SecondaryMap`)
//! - The position index, a map from occupied nodes to particles. The engine
//!   is its only writer.
//! - The anchor particle, the circuit layout of the visible round, the
//!   [`EventBus`] and the round counters ([`SimState`])
//!
//! # Round pipeline
//!
//! Each [`Engine::step`] simulates round `r` and commits round `r + 1`:
//! 1. **Move** -- every behavior's `activate_move` runs against the
//!    pre-round snapshot; actions, bond flags and attributes are staged
//! 2. **Resolution** -- the joint movement solver computes new placements,
//!    which are recorded at `r + 1`; pins reset where the shape changed
//! 3. **Signal** -- `activate_beep` runs against the moved system, circuits
//!    are discovered, and beeps and messages are delivered
//! 4. **Commit** -- counters advance, finished detection, render events
//!
//! Any error rolls every history back to round `r` before it is returned.
//!
//! # Replay
//!
//! [`Engine::set_marker`] and friends move a marker through the recorded
//! rounds. While the marker is paused the position index, the circuit
//! layout and all views show the marked round and `step` is refused.

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};

use slotmap::{SecondaryMap, SlotMap};
use tracing::{debug, info, warn};

use crate::behavior::{
    BeepContext, Behavior, BehaviorError, BehaviorResult, MoveContext, ParticleIntent, Snapshot,
};
use crate::circuit::{self, CircuitInput, CircuitLayout};
use crate::config::{ConfigError, SimConfig};
use crate::error::{SetupError, SimError};
use crate::events::{EventBus, EventKind, Listener, RenderEvent};
use crate::grid::{Chirality, Direction, GridPos, Placement, to_local};
use crate::history::HistoryError;
use crate::id::ParticleId;
use crate::movement::{self, MoveInfo, MovementOutcome};
use crate::particle::{AttributeValue, Particle, ParticleView};
use crate::pins::PinConfiguration;
use crate::sim::{Round, RoundReport, SimState, StateHash};

type Intents = SecondaryMap<ParticleId, ParticleIntent>;

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// The simulation engine. Runs synchronous rounds over a particle system.
#[derive(Debug)]
pub struct Engine {
    pub(crate) particles: SlotMap<ParticleId, Particle>,

    pub(crate) behaviors: SecondaryMap<ParticleId, Box<dyn Behavior>>,

    /// Insertion order. Every per-particle loop runs in this order.
    pub(crate) order: Vec<ParticleId>,

    /// Occupied nodes at the visible round.
    pub(crate) index: BTreeMap<GridPos, ParticleId>,

    /// Reference particle of the movement solver. Defaults to the first
    /// particle added.
    pub(crate) anchor: Option<ParticleId>,

    /// Circuits of the visible round.
    pub(crate) layout: CircuitLayout,

    pub(crate) sim_state: SimState,

    pub(crate) config: SimConfig,

    /// Render notifications, delivered at commit and rollback.
    pub event_bus: EventBus,

    /// Timing profile for the most recent round (profiling feature only).
    #[cfg(feature = "profiling")]
    pub(crate) last_profile: Option<crate::profiling::RoundProfile>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::with_valid_config(SimConfig::default())
    }
}

impl Engine {
    /// Create an empty engine. Fails if the configuration is invalid.
    pub fn new(config: SimConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::with_valid_config(config))
    }

    fn with_valid_config(config: SimConfig) -> Self {
        Self {
            particles: SlotMap::with_key(),
            behaviors: SecondaryMap::new(),
            order: Vec::new(),
            index: BTreeMap::new(),
            anchor: None,
            layout: CircuitLayout::default(),
            sim_state: SimState::new(),
            event_bus: EventBus::new(config.event_capacity),
            config,
            #[cfg(feature = "profiling")]
            last_profile: None,
        }
    }

    // -----------------------------------------------------------------------
    // System setup
    // -----------------------------------------------------------------------

    /// Add a contracted particle at `pos`.
    pub fn add_contracted(
        &mut self,
        pos: GridPos,
        compass: Direction,
        chirality: Chirality,
        behavior: Box<dyn Behavior>,
    ) -> Result<ParticleId, SimError> {
        self.check_setup(&[pos])?;
        Ok(self.insert_particle(Placement::contracted(pos), compass, chirality, behavior))
    }

    /// Add an expanded particle occupying `head` and `tail`.
    pub fn add_expanded(
        &mut self,
        head: GridPos,
        tail: GridPos,
        compass: Direction,
        chirality: Chirality,
        behavior: Box<dyn Behavior>,
    ) -> Result<ParticleId, SimError> {
        let Some(expansion) = tail.direction_to(head) else {
            return Err(SetupError::NotAdjacent { head, tail }.into());
        };
        self.check_setup(&[tail, head])?;
        Ok(self.insert_particle(
            Placement::expanded(tail, expansion),
            compass,
            chirality,
            behavior,
        ))
    }

    /// Make `id` the particle whose position stays fixed during resolution.
    pub fn set_anchor(&mut self, id: ParticleId) -> Result<(), SimError> {
        if !self.particles.contains_key(id) {
            return Err(SetupError::UnknownParticle(id).into());
        }
        self.anchor = Some(id);
        Ok(())
    }

    fn check_setup(&self, nodes: &[GridPos]) -> Result<(), SetupError> {
        if !self.sim_state.tracking || self.sim_state.latest_round != self.sim_state.earliest_round
        {
            return Err(SetupError::NotAtEarliestRound);
        }
        for node in nodes {
            if self.index.contains_key(node) {
                return Err(SetupError::Occupied(*node));
            }
        }
        Ok(())
    }

    fn insert_particle(
        &mut self,
        placement: Placement,
        compass: Direction,
        chirality: Chirality,
        behavior: Box<dyn Behavior>,
    ) -> ParticleId {
        let particle = Particle::new(
            behavior.name().to_owned(),
            placement,
            compass,
            chirality,
            self.config.pins_per_edge,
            self.sim_state.earliest_round,
        );
        let id = self.particles.insert(particle);
        self.behaviors.insert(id, behavior);
        self.order.push(id);
        for node in placement.nodes() {
            self.index.insert(node, id);
        }
        self.anchor.get_or_insert(id);
        self.layout = self.compute_layout();
        debug!(particle = ?id, tail = %placement.tail, "particle added");
        id
    }

    // -----------------------------------------------------------------------
    // Event wiring
    // -----------------------------------------------------------------------

    pub fn suppress_event(&mut self, kind: EventKind) {
        self.event_bus.suppress(kind);
    }

    pub fn on_event(&mut self, kind: EventKind, listener: Listener) {
        self.event_bus.on(kind, listener);
    }

    // -----------------------------------------------------------------------
    // Simulation
    // -----------------------------------------------------------------------

    /// Simulate one round and commit it.
    ///
    /// On error every history is rolled back to the last committed round
    /// and the error is returned.
    pub fn step(&mut self) -> Result<RoundReport, SimError> {
        if !self.sim_state.tracking {
            return Err(SimError::ReplayActive);
        }
        let round = self.sim_state.latest_round;
        match self.simulate_round(round) {
            Ok(report) => Ok(report),
            Err(err) => {
                self.rollback(round, &err);
                Err(err)
            }
        }
    }

    /// Step until every behavior is finished or `max_rounds` rounds have
    /// run (the configured limit if `None`). Returns the number of rounds
    /// run and stops at the first error.
    pub fn run(&mut self, max_rounds: Option<u64>) -> Result<u64, SimError> {
        let limit = max_rounds.unwrap_or(self.config.max_rounds);
        let mut rounds = 0;
        while rounds < limit && !self.is_finished() {
            self.step()?;
            rounds += 1;
        }
        Ok(rounds)
    }

    fn simulate_round(&mut self, round: Round) -> Result<RoundReport, SimError> {
        #[cfg(feature = "profiling")]
        let step_start = std::time::Instant::now();

        // Phase 1: Move -- behaviors stage actions against the snapshot.
        #[cfg(feature = "profiling")]
        let phase_start = std::time::Instant::now();
        let mut intents = self.phase_move(round)?;
        #[cfg(feature = "profiling")]
        let move_dur = phase_start.elapsed();

        // Phase 2: Resolution -- joint movement and position updates.
        #[cfg(feature = "profiling")]
        let phase_start = std::time::Instant::now();
        let (infos, outcome) = self.phase_resolve(round, &intents)?;
        #[cfg(feature = "profiling")]
        let resolution_dur = phase_start.elapsed();

        // Phase 3: Signal -- pins, circuits, delivery.
        #[cfg(feature = "profiling")]
        let phase_start = std::time::Instant::now();
        let layout = self.phase_signal(round, &mut intents)?;
        #[cfg(feature = "profiling")]
        let signal_dur = phase_start.elapsed();

        // Phase 4: Commit -- counters, finished detection, events.
        #[cfg(feature = "profiling")]
        let phase_start = std::time::Instant::now();
        let report = self.phase_commit(round, &intents, &infos, &outcome, layout);
        #[cfg(feature = "profiling")]
        {
            self.last_profile = Some(crate::profiling::RoundProfile {
                move_phase: move_dur,
                resolution: resolution_dur,
                signal: signal_dur,
                commit: phase_start.elapsed(),
                total: step_start.elapsed(),
                round: report.round,
            });
        }

        Ok(report)
    }

    // -----------------------------------------------------------------------
    // Phase 1: Move
    // -----------------------------------------------------------------------

    fn phase_move(&mut self, round: Round) -> Result<Intents, SimError> {
        let snapshot = Snapshot {
            particles: &self.particles,
            index: &self.index,
        };
        let catch_panics = self.config.catch_panics;
        let mut intents = Intents::new();
        for &id in &self.order {
            let Some(behavior) = self.behaviors.get_mut(id) else {
                continue;
            };
            let mut intent = ParticleIntent::default();
            let mut ctx = MoveContext::new(id, round, snapshot, &mut intent);
            invoke(catch_panics, id, || behavior.activate_move(&mut ctx))?;
            intents.insert(id, intent);
        }
        debug!(round, particles = intents.len(), "move phase complete");
        Ok(intents)
    }

    // -----------------------------------------------------------------------
    // Phase 2: Resolution
    // -----------------------------------------------------------------------

    fn phase_resolve(
        &mut self,
        round: Round,
        intents: &Intents,
    ) -> Result<(Vec<MoveInfo>, MovementOutcome), SimError> {
        let infos = self.gather_move_infos(intents);
        let outcome = match self.anchor {
            Some(anchor) => movement::resolve(&infos, anchor, self.config.movement_policy)?,
            None => MovementOutcome::default(),
        };

        let next = round + 1;
        let pins_per_edge = self.config.pins_per_edge;
        for (i, info) in infos.iter().enumerate() {
            let Some(particle) = self.particles.get_mut(info.id) else {
                continue;
            };
            let intent = intents.get(info.id);
            let placement = outcome.placements.get(i).copied().unwrap_or(info.placement);
            let executed = outcome.applied.get(i).copied().flatten().is_some();
            let action = intent
                .and_then(|it| it.action)
                .filter(|_| executed)
                .map(|(action, _)| action);

            particle.tail.record_at(placement.tail, next)?;
            particle.expansion.record_at(placement.expansion, next)?;
            particle
                .bonds
                .record_at(intent.map(|it| it.bonds).unwrap_or_default(), next)?;
            particle.action.record_at(action, next)?;
            particle
                .movement_failed
                .record_at(outcome.dropped.contains(&info.id), next)?;

            let pins = if placement.expansion != info.placement.expansion {
                let local = placement
                    .expansion
                    .map(|e| to_local(e, particle.compass, particle.chirality));
                PinConfiguration::singleton(pins_per_edge, local)
            } else {
                particle.pins.latest().clone()
            };
            particle.pins.record_at(pins, next)?;
        }
        self.rebuild_index();
        debug!(
            round,
            moved = outcome.applied.iter().flatten().count(),
            dropped = outcome.dropped.len(),
            "movements resolved"
        );
        Ok((infos, outcome))
    }

    /// Solver input for every particle, in insertion order.
    fn gather_move_infos(&self, intents: &Intents) -> Vec<MoveInfo> {
        let particles = &self.particles;
        let build = |id: &ParticleId| -> Option<MoveInfo> {
            let particle = particles.get(*id)?;
            let placement = particle.placement();
            let local_exp = placement
                .expansion
                .map(|e| to_local(e, particle.compass, particle.chirality));
            let intent = intents.get(*id);
            Some(MoveInfo {
                id: *id,
                placement,
                movement: intent.and_then(|it| it.action).map(|(_, m)| m),
                bonds: movement::global_bond_flags(
                    intent.map(|it| it.bonds).unwrap_or_default(),
                    local_exp,
                    particle.compass,
                    particle.chirality,
                ),
            })
        };

        #[cfg(feature = "parallel")]
        {
            use rayon::prelude::*;
            self.order.par_iter().filter_map(build).collect()
        }
        #[cfg(not(feature = "parallel"))]
        {
            self.order.iter().filter_map(build).collect()
        }
    }

    // -----------------------------------------------------------------------
    // Phase 3: Signal
    // -----------------------------------------------------------------------

    fn phase_signal(&mut self, round: Round, intents: &mut Intents) -> Result<CircuitLayout, SimError> {
        let next = round + 1;
        let catch_panics = self.config.catch_panics;
        let pins_per_edge = self.config.pins_per_edge;

        let snapshot = Snapshot {
            particles: &self.particles,
            index: &self.index,
        };
        for &id in &self.order {
            let (Some(behavior), Some(intent)) = (self.behaviors.get_mut(id), intents.get_mut(id))
            else {
                continue;
            };
            let mut ctx = BeepContext::new(id, round, pins_per_edge, snapshot, intent);
            invoke(catch_panics, id, || behavior.activate_beep(&mut ctx))?;
        }

        for &id in &self.order {
            let (Some(particle), Some(intent)) = (self.particles.get_mut(id), intents.get(id)) else {
                continue;
            };
            if let Some(pins) = &intent.pins {
                particle.pins.record_at(pins.clone(), next)?;
            }
            particle.sent.record_at(intent.sent.clone(), next)?;
            record_attributes(particle, &intent.attributes, next)?;
        }

        let layout = self.compute_layout();
        for &id in &self.order {
            let received = layout.received_by(id);
            if let Some(behavior) = self.behaviors.get_mut(id) {
                for &set in &received.beeps {
                    invoke(catch_panics, id, || behavior.receive_beep(set))?;
                }
                for (set, message) in &received.messages {
                    invoke(catch_panics, id, || behavior.receive_message(*set, message))?;
                }
            }
            if let Some(particle) = self.particles.get_mut(id) {
                particle.received.record_at(received, next)?;
            }
        }
        debug!(
            round,
            circuits = layout.len(),
            signalling = layout.signalling().count(),
            "signal phase complete"
        );
        Ok(layout)
    }

    /// Discover the circuits of the visible round.
    pub(crate) fn compute_layout(&self) -> CircuitLayout {
        let inputs: Vec<CircuitInput<'_>> = self
            .order
            .iter()
            .filter_map(|&id| {
                let particle = self.particles.get(id)?;
                Some(CircuitInput {
                    id,
                    placement: particle.placement(),
                    compass: particle.compass,
                    chirality: particle.chirality,
                    pins: particle.pins.marked_value(),
                    signals: particle.sent.marked_value(),
                })
            })
            .collect();
        circuit::discover(&inputs)
    }

    // -----------------------------------------------------------------------
    // Phase 4: Commit
    // -----------------------------------------------------------------------

    fn phase_commit(
        &mut self,
        round: Round,
        intents: &Intents,
        infos: &[MoveInfo],
        outcome: &MovementOutcome,
        layout: CircuitLayout,
    ) -> RoundReport {
        let next = round + 1;
        self.sim_state.latest_round = next;
        self.sim_state.marked_round = next;

        let finished = self.all_finished();
        if finished && self.sim_state.finished_round.is_none() {
            self.sim_state.finished_round = Some(next);
            info!(round = next, "all particles finished");
        }

        let mut moved = Vec::new();
        for (i, info) in infos.iter().enumerate() {
            let Some(&to) = outcome.placements.get(i) else {
                continue;
            };
            if to != info.placement {
                moved.push(info.id);
                self.event_bus.emit(RenderEvent::ParticleMoved {
                    particle: info.id,
                    from: info.placement,
                    to,
                    round: next,
                });
            }
        }
        for bond in &outcome.bonds {
            self.event_bus.emit(RenderEvent::BondRendered {
                particles: bond.particles,
                nodes: bond.nodes,
                marked: bond.marked,
                round: next,
            });
        }
        for circuit in layout.circuits() {
            self.event_bus.emit(RenderEvent::CircuitUpdated {
                circuit: circuit.id,
                members: circuit.members.len(),
                beep: circuit.beep,
                message: circuit.message.is_some(),
                round: next,
            });
        }
        self.event_bus.emit(RenderEvent::RoundCommitted {
            round: next,
            moved: moved.len(),
        });
        self.event_bus.deliver();

        let anomalies = self
            .order
            .iter()
            .filter_map(|id| intents.get(*id))
            .flat_map(|it| it.anomalies.iter().cloned())
            .collect();
        let report = RoundReport {
            round: next,
            moved,
            dropped: outcome.dropped.clone(),
            anomalies,
            circuit_count: layout.len(),
            signalling_circuits: layout.signalling().count(),
            finished,
        };
        self.layout = layout;
        debug!(round = next, moved = report.moved.len(), "round committed");
        report
    }

    fn all_finished(&self) -> bool {
        !self.order.is_empty()
            && self.order.iter().all(|&id| {
                match (self.behaviors.get(id), self.particles.get(id)) {
                    (Some(behavior), Some(particle)) => {
                        behavior.is_finished(&ParticleView::new(id, particle))
                    }
                    _ => true,
                }
            })
    }

    // -----------------------------------------------------------------------
    // Rollback
    // -----------------------------------------------------------------------

    fn rollback(&mut self, round: Round, err: &SimError) {
        for particle in self.particles.values_mut() {
            let result = particle.for_each_timeline(|t| {
                t.truncate_after_round(round)?;
                t.continue_tracking();
                Ok(())
            });
            if let Err(e) = result {
                warn!(round, error = %e, "history truncation failed during rollback");
            }
        }
        self.sim_state.latest_round = round;
        self.sim_state.marked_round = round;
        self.sim_state.tracking = true;
        self.refresh_view();

        self.event_bus.emit(RenderEvent::RoundRolledBack {
            round,
            reason: err.to_string(),
        });
        self.event_bus.deliver();
        info!(round, error = %err, "round rolled back");
    }

    pub(crate) fn rebuild_index(&mut self) {
        self.index.clear();
        for &id in &self.order {
            if let Some(particle) = self.particles.get(id) {
                for node in particle.placement().nodes() {
                    self.index.insert(node, id);
                }
            }
        }
    }

    fn refresh_view(&mut self) {
        self.rebuild_index();
        self.layout = self.compute_layout();
    }

    // -----------------------------------------------------------------------
    // Replay
    // -----------------------------------------------------------------------

    /// Pause and show the system as it was at `round`.
    pub fn set_marker(&mut self, round: Round) -> Result<(), SimError> {
        let first = self.sim_state.earliest_round;
        let last = self.sim_state.latest_round;
        if round < first {
            return Err(HistoryError::RoundBeforeFirst { round, first }.into());
        }
        if round > last {
            return Err(HistoryError::RoundAfterLast { round, last }.into());
        }
        for particle in self.particles.values_mut() {
            particle.for_each_timeline(|t| t.set_marker(round))?;
        }
        self.sim_state.tracking = false;
        self.sim_state.marked_round = round;
        self.refresh_view();
        info!(round, "replay marker set");
        Ok(())
    }

    /// Move the marker one round back.
    pub fn step_back(&mut self) -> Result<(), SimError> {
        let marked = self.sim_state.visible_round();
        let first = self.sim_state.earliest_round;
        if marked <= first {
            return Err(HistoryError::StepBeforeFirst { first }.into());
        }
        self.set_marker(marked - 1)
    }

    /// Move the marker one round forward.
    pub fn step_forward(&mut self) -> Result<(), SimError> {
        self.set_marker(self.sim_state.visible_round() + 1)
    }

    /// Leave replay and show the latest round again.
    pub fn continue_tracking(&mut self) {
        for particle in self.particles.values_mut() {
            let _ = particle.for_each_timeline(|t| {
                t.continue_tracking();
                Ok(())
            });
        }
        self.sim_state.tracking = true;
        self.sim_state.marked_round = self.sim_state.latest_round;
        self.refresh_view();
        info!(round = self.sim_state.latest_round, "tracking resumed");
    }

    /// Discard every round after the marker and resume tracking from it.
    /// No-op while tracking.
    pub fn cut_off_at_marker(&mut self) {
        if self.sim_state.tracking {
            return;
        }
        let round = self.sim_state.marked_round;
        for particle in self.particles.values_mut() {
            let _ = particle.for_each_timeline(|t| {
                t.truncate_after_marker();
                t.continue_tracking();
                Ok(())
            });
        }
        self.sim_state.latest_round = round;
        self.sim_state.tracking = true;
        if self.sim_state.finished_round.is_some_and(|f| f > round) {
            self.sim_state.finished_round = None;
        }
        self.refresh_view();
        info!(round, "history cut off at marker");
    }

    /// Add `delta` to every recorded round.
    pub fn shift_timescale(&mut self, delta: i64) -> Result<(), SimError> {
        let earliest = self.sim_state.earliest_round;
        if earliest.checked_add_signed(delta).is_none() {
            return Err(HistoryError::TimescaleUnderflow {
                round: earliest,
                delta,
            }
            .into());
        }
        for particle in self.particles.values_mut() {
            particle.for_each_timeline(|t| t.shift_timescale(delta))?;
        }
        let state = &mut self.sim_state;
        state.earliest_round = state.earliest_round.saturating_add_signed(delta);
        state.latest_round = state.latest_round.saturating_add_signed(delta);
        state.marked_round = state.marked_round.saturating_add_signed(delta);
        state.finished_round = state.finished_round.map(|f| f.saturating_add_signed(delta));
        Ok(())
    }

    /// Forget every round before `round`.
    pub fn trim_history_before(&mut self, round: Round) -> Result<(), SimError> {
        let last = self.sim_state.latest_round;
        if round > last {
            return Err(HistoryError::RoundAfterLast { round, last }.into());
        }
        if round <= self.sim_state.earliest_round {
            return Ok(());
        }
        for particle in self.particles.values_mut() {
            particle.for_each_timeline(|t| t.trim_before(round))?;
        }
        self.sim_state.earliest_round = round;
        self.sim_state.marked_round = self.sim_state.marked_round.max(round);
        self.refresh_view();
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Query API (read-only)
    // -----------------------------------------------------------------------

    pub fn particle(&self, id: ParticleId) -> Option<ParticleView<'_>> {
        self.particles.get(id).map(|p| ParticleView::new(id, p))
    }

    /// The particle occupying `pos` at the visible round.
    pub fn particle_at(&self, pos: GridPos) -> Option<ParticleView<'_>> {
        self.index.get(&pos).and_then(|&id| self.particle(id))
    }

    /// Particle ids in insertion order.
    pub fn particle_ids(&self) -> &[ParticleId] {
        &self.order
    }

    /// Placements at the visible round, in insertion order.
    pub fn positions(&self) -> Vec<(ParticleId, Placement)> {
        self.order
            .iter()
            .filter_map(|&id| self.particles.get(id).map(|p| (id, p.placement())))
            .collect()
    }

    /// Circuits at the visible round.
    pub fn circuits(&self) -> &CircuitLayout {
        &self.layout
    }

    pub fn behavior(&self, id: ParticleId) -> Option<&dyn Behavior> {
        self.behaviors.get(id).map(|b| b.as_ref())
    }

    pub fn anchor(&self) -> Option<ParticleId> {
        self.anchor
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    pub fn sim_state(&self) -> &SimState {
        &self.sim_state
    }

    /// The round shown by queries.
    pub fn current_round(&self) -> Round {
        self.sim_state.visible_round()
    }

    pub fn earliest_round(&self) -> Round {
        self.sim_state.earliest_round
    }

    pub fn latest_round(&self) -> Round {
        self.sim_state.latest_round
    }

    pub fn finished_round(&self) -> Option<Round> {
        self.sim_state.finished_round
    }

    pub fn is_finished(&self) -> bool {
        self.sim_state.finished_round.is_some()
    }

    pub fn is_tracking(&self) -> bool {
        self.sim_state.tracking
    }

    pub fn marked_round(&self) -> Round {
        self.sim_state.visible_round()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Timing profile of the most recent committed round.
    #[cfg(feature = "profiling")]
    pub fn last_round_profile(&self) -> Option<&crate::profiling::RoundProfile> {
        self.last_profile.as_ref()
    }

    /// Deterministic hash of the visible state: round, placements, bonds
    /// and circuit structure. Particles are identified by insertion order,
    /// so a reloaded system hashes like the original.
    pub fn state_hash(&self) -> u64 {
        let mut hasher = StateHash::new();
        hasher.write_u64(self.sim_state.visible_round());

        let rank: BTreeMap<ParticleId, u32> = self
            .order
            .iter()
            .enumerate()
            .map(|(i, id)| (*id, i as u32))
            .collect();

        for &id in &self.order {
            let Some(particle) = self.particles.get(id) else {
                continue;
            };
            let placement = particle.placement();
            hasher.write_i32(placement.tail.x);
            hasher.write_i32(placement.tail.y);
            hasher.write_u32(placement.expansion.map_or(6, |d| d.to_int() as u32));
            let bonds = particle.bonds.marked_value();
            hasher.write_u32(u32::from(bonds.active));
            hasher.write_u32(u32::from(bonds.marked));
            hasher.write_u32(u32::from(*particle.movement_failed.marked_value()));
        }

        for circuit in self.layout.circuits() {
            hasher.write_u32(circuit.members.len() as u32);
            for (particle, set) in &circuit.members {
                hasher.write_u32(rank.get(particle).copied().unwrap_or(u32::MAX));
                hasher.write_u32(u32::from(set.0));
            }
            hasher.write_u32(u32::from(circuit.beep));
        }

        hasher.finish()
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Run a behavior callback, mapping its failure to a [`SimError`].
fn invoke(
    catch_panics: bool,
    particle: ParticleId,
    callback: impl FnOnce() -> BehaviorResult,
) -> Result<(), SimError> {
    let result = if catch_panics {
        panic::catch_unwind(AssertUnwindSafe(callback)).map_err(|payload| {
            SimError::AlgorithmFault {
                particle,
                reason: panic_reason(payload.as_ref()),
            }
        })?
    } else {
        callback()
    };
    result.map_err(|err| match err {
        BehaviorError::Action(source) => SimError::InvalidAction { particle, source },
        other => SimError::AlgorithmFault {
            particle,
            reason: other.to_string(),
        },
    })
}

fn panic_reason(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("panicked: {msg}")
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("panicked: {msg}")
    } else {
        "panicked".to_owned()
    }
}

/// Record staged attribute writes at `round` and carry every other
/// attribute forward, so all histories end at the same round.
fn record_attributes(
    particle: &mut Particle,
    staged: &BTreeMap<String, AttributeValue>,
    round: Round,
) -> Result<(), HistoryError> {
    for (name, history) in particle.attributes.iter_mut() {
        if !staged.contains_key(name) {
            let value = history.latest().clone();
            history.record_at(value, round)?;
        }
    }
    for (name, value) in staged {
        particle.record_attribute(name, value.clone(), round)?;
    }
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ActionError, Anomaly};
    use crate::grid::Direction::*;
    use crate::id::PartitionSetId;
    use crate::movement::{Conflict, MovementPolicy};
    use crate::test_utils::{IdleBehavior, ScriptedBehavior, contracted_line};
    use std::sync::{Arc, Mutex};

    const CCW: Chirality = Chirality::CounterClockwise;

    fn expander(dir: Direction) -> Box<dyn Behavior> {
        Box::new(ScriptedBehavior::new("expander").on_move(move |ctx| {
            if !ctx.is_expanded() {
                ctx.expand(dir)?;
            }
            Ok(())
        }))
    }

    // -----------------------------------------------------------------------
    // Test 1: empty and idle systems
    // -----------------------------------------------------------------------
    #[test]
    fn empty_engine_steps() {
        let mut engine = Engine::default();
        let report = engine.step().unwrap();
        assert_eq!(report.round, 1);
        assert_eq!(engine.latest_round(), 1);
        assert!(!engine.is_finished());
    }

    #[test]
    fn idle_particles_stay_put() {
        let mut engine = Engine::default();
        let ids = contracted_line(&mut engine, GridPos::ZERO, E, 3, || Box::new(IdleBehavior));
        let before = engine.positions();
        for _ in 0..3 {
            let report = engine.step().unwrap();
            assert!(report.moved.is_empty());
        }
        assert_eq!(engine.positions(), before);
        assert_eq!(engine.current_round(), 3);
        assert_eq!(engine.anchor(), Some(ids[0]));
    }

    // -----------------------------------------------------------------------
    // Test 2: setup validation
    // -----------------------------------------------------------------------
    #[test]
    fn setup_rejects_occupied_and_non_adjacent() {
        let mut engine = Engine::default();
        engine
            .add_contracted(GridPos::ZERO, E, CCW, Box::new(IdleBehavior))
            .unwrap();
        let occupied = engine.add_contracted(GridPos::ZERO, E, CCW, Box::new(IdleBehavior));
        assert!(matches!(
            occupied,
            Err(SimError::Setup(SetupError::Occupied(_)))
        ));
        let far = engine.add_expanded(
            GridPos::new(5, 0),
            GridPos::new(3, 0),
            E,
            CCW,
            Box::new(IdleBehavior),
        );
        assert!(matches!(
            far,
            Err(SimError::Setup(SetupError::NotAdjacent { .. }))
        ));
    }

    #[test]
    fn setup_only_at_earliest_round() {
        let mut engine = Engine::default();
        engine
            .add_contracted(GridPos::ZERO, E, CCW, Box::new(IdleBehavior))
            .unwrap();
        engine.step().unwrap();
        let late = engine.add_contracted(GridPos::new(4, 4), E, CCW, Box::new(IdleBehavior));
        assert!(matches!(
            late,
            Err(SimError::Setup(SetupError::NotAtEarliestRound))
        ));
    }

    #[test]
    fn set_anchor_requires_known_particle() {
        let mut engine = Engine::default();
        let id = engine
            .add_contracted(GridPos::ZERO, E, CCW, Box::new(IdleBehavior))
            .unwrap();
        let mut other = Engine::default();
        assert!(other.set_anchor(id).is_err());
        assert!(engine.set_anchor(id).is_ok());
    }

    #[test]
    fn invalid_config_is_rejected_on_construction() {
        let config = SimConfig {
            pins_per_edge: 0,
            ..Default::default()
        };
        assert!(matches!(
            Engine::new(config),
            Err(ConfigError::PinsPerEdge(0))
        ));
    }

    // -----------------------------------------------------------------------
    // Test 3: movement is recorded at the next round
    // -----------------------------------------------------------------------
    #[test]
    fn expansion_recorded_at_next_round() {
        let mut engine = Engine::default();
        let id = engine
            .add_contracted(GridPos::ZERO, E, CCW, expander(E))
            .unwrap();
        let report = engine.step().unwrap();
        assert_eq!(report.moved, vec![id]);

        let view = engine.particle(id).unwrap();
        assert_eq!(view.placement(), Placement::expanded(GridPos::ZERO, E));
        assert_eq!(view.last_action(), Some(crate::action::Action::Expand(E)));
        assert_eq!(engine.particle_at(GridPos::new(1, 0)).map(|v| v.id()), Some(id));
        // Pins follow the new shape.
        assert_eq!(view.pin_configuration().pin_count(), 20);
    }

    #[test]
    fn second_action_reported_as_anomaly() {
        let mut engine = Engine::default();
        let id = engine
            .add_contracted(
                GridPos::ZERO,
                E,
                CCW,
                Box::new(ScriptedBehavior::new("fickle").on_move(|ctx| {
                    ctx.expand(E)?;
                    ctx.expand(W)?;
                    Ok(())
                })),
            )
            .unwrap();
        let report = engine.step().unwrap();
        assert!(matches!(
            report.anomalies.as_slice(),
            [Anomaly::ActionOverwritten { particle, .. }] if *particle == id
        ));
        assert_eq!(
            engine.particle(id).unwrap().placement(),
            Placement::expanded(GridPos::ZERO, W)
        );
    }

    // -----------------------------------------------------------------------
    // Test 4: failures roll back
    // -----------------------------------------------------------------------
    #[test]
    fn invalid_action_rolls_back() {
        let mut engine = Engine::default();
        let id = engine
            .add_contracted(
                GridPos::ZERO,
                E,
                CCW,
                Box::new(ScriptedBehavior::new("bad").on_move(|ctx| {
                    ctx.contract_head()?;
                    Ok(())
                })),
            )
            .unwrap();
        let hash = engine.state_hash();
        let err = engine.step().unwrap_err();
        assert!(matches!(
            err,
            SimError::InvalidAction {
                particle,
                source: ActionError::NotExpanded { .. },
            } if particle == id
        ));
        assert_eq!(engine.latest_round(), 0);
        assert_eq!(engine.state_hash(), hash);
    }

    #[test]
    fn collision_conflict_rolls_back() {
        let mut engine = Engine::default();
        let p = engine
            .add_contracted(GridPos::ZERO, E, CCW, expander(E))
            .unwrap();
        engine
            .add_contracted(GridPos::new(1, 0), E, CCW, Box::new(IdleBehavior))
            .unwrap();
        let rolled_back = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&rolled_back);
        engine.on_event(
            EventKind::RoundRolledBack,
            Box::new(move |e| log.lock().unwrap().push(e.clone())),
        );

        let err = engine.step().unwrap_err();
        assert!(matches!(
            err,
            SimError::SimulationConflict(Conflict::Collision { .. })
        ));
        assert_eq!(engine.latest_round(), 0);
        assert_eq!(
            engine.particle(p).unwrap().placement(),
            Placement::contracted(GridPos::ZERO)
        );
        assert_eq!(rolled_back.lock().unwrap().len(), 1);
    }

    #[test]
    fn first_come_first_served_drops_blocked_expansion() {
        let config = SimConfig {
            movement_policy: MovementPolicy::FirstComeFirstServed,
            ..Default::default()
        };
        let mut engine = Engine::new(config).unwrap();
        let p = engine
            .add_contracted(GridPos::ZERO, E, CCW, expander(E))
            .unwrap();
        engine
            .add_contracted(GridPos::new(1, 0), E, CCW, Box::new(IdleBehavior))
            .unwrap();
        let report = engine.step().unwrap();
        assert_eq!(report.dropped, vec![p]);
        let view = engine.particle(p).unwrap();
        assert!(view.movement_failed());
        assert!(!view.is_expanded());
        assert_eq!(view.last_action(), None);
    }

    #[test]
    fn panics_become_algorithm_faults() {
        let mut engine = Engine::default();
        let id = engine
            .add_contracted(
                GridPos::ZERO,
                E,
                CCW,
                Box::new(ScriptedBehavior::new("panicky").on_move(|_| panic!("boom"))),
            )
            .unwrap();
        match engine.step() {
            Err(SimError::AlgorithmFault { particle, reason }) => {
                assert_eq!(particle, id);
                assert!(reason.contains("boom"));
            }
            other => panic!("expected algorithm fault, got {other:?}"),
        }
        assert_eq!(engine.latest_round(), 0);
    }

    #[test]
    fn behavior_errors_become_algorithm_faults() {
        let mut engine = Engine::default();
        engine
            .add_contracted(
                GridPos::ZERO,
                E,
                CCW,
                Box::new(
                    ScriptedBehavior::new("failing")
                        .on_beep(|_| Err(BehaviorError::Failed("no".into()))),
                ),
            )
            .unwrap();
        assert!(matches!(
            engine.step(),
            Err(SimError::AlgorithmFault { .. })
        ));
        assert_eq!(engine.latest_round(), 0);
    }

    // -----------------------------------------------------------------------
    // Test 5: signals
    // -----------------------------------------------------------------------
    #[test]
    fn beep_reaches_bonded_neighbor() {
        let inbox = Arc::new(Mutex::new(Vec::new()));
        let mut engine = Engine::default();
        let p = engine
            .add_contracted(
                GridPos::ZERO,
                E,
                CCW,
                Box::new(ScriptedBehavior::new("sender").on_beep(|ctx| {
                    let pins = ctx.global_pins();
                    ctx.set_pin_configuration(pins)?;
                    ctx.send_beep(PartitionSetId(0));
                    Ok(())
                })),
            )
            .unwrap();
        let q = engine
            .add_contracted(
                GridPos::new(1, 0),
                E,
                CCW,
                Box::new(
                    ScriptedBehavior::new("listener")
                        .on_beep(|ctx| {
                            let pins = ctx.global_pins();
                            ctx.set_pin_configuration(pins)?;
                            Ok(())
                        })
                        .with_inbox(Arc::clone(&inbox)),
                ),
            )
            .unwrap();

        let report = engine.step().unwrap();
        assert_eq!(report.circuit_count, 1);
        assert_eq!(report.signalling_circuits, 1);
        assert_eq!(*inbox.lock().unwrap(), vec![PartitionSetId(0)]);
        assert!(
            engine
                .particle(q)
                .unwrap()
                .received()
                .has_beep(PartitionSetId(0))
        );
        assert!(engine.particle(p).unwrap().sent().has_beep(PartitionSetId(0)));
    }

    #[test]
    fn pins_reset_when_shape_changes() {
        let mut engine = Engine::default();
        let id = engine
            .add_contracted(
                GridPos::ZERO,
                E,
                CCW,
                Box::new(
                    ScriptedBehavior::new("grower")
                        .on_move(|ctx| {
                            if ctx.round() == 1 {
                                ctx.expand(E)?;
                            }
                            Ok(())
                        })
                        .on_beep(|ctx| {
                            if ctx.round() == 0 {
                                let pins = ctx.global_pins();
                                ctx.set_pin_configuration(pins)?;
                            }
                            Ok(())
                        }),
                ),
            )
            .unwrap();
        engine.step().unwrap();
        assert_eq!(
            engine.particle(id).unwrap().pin_configuration().non_empty_sets().len(),
            1
        );
        engine.step().unwrap();
        let pins = engine.particle(id).unwrap().pin_configuration().clone();
        assert_eq!(pins.pin_count(), 20);
        assert_eq!(pins.non_empty_sets().len(), 20);
    }

    // -----------------------------------------------------------------------
    // Test 6: replay
    // -----------------------------------------------------------------------
    #[test]
    fn replay_shows_past_rounds() {
        let mut engine = Engine::default();
        let id = engine
            .add_contracted(GridPos::ZERO, E, CCW, expander(E))
            .unwrap();
        engine.step().unwrap();
        engine.step().unwrap();
        let latest_hash = engine.state_hash();

        engine.set_marker(0).unwrap();
        assert!(!engine.is_tracking());
        assert_eq!(engine.current_round(), 0);
        assert!(!engine.particle(id).unwrap().is_expanded());
        assert!(engine.particle_at(GridPos::new(1, 0)).is_none());
        assert!(matches!(engine.step(), Err(SimError::ReplayActive)));

        engine.step_forward().unwrap();
        assert!(engine.particle(id).unwrap().is_expanded());
        engine.step_back().unwrap();
        assert!(engine.step_back().is_err());
        assert!(engine.set_marker(3).is_err());

        engine.continue_tracking();
        assert_eq!(engine.current_round(), 2);
        assert_eq!(engine.state_hash(), latest_hash);
    }

    #[test]
    fn cut_off_discards_future() {
        let mut engine = Engine::default();
        let id = engine
            .add_contracted(GridPos::ZERO, E, CCW, expander(E))
            .unwrap();
        engine.step().unwrap();
        engine.step().unwrap();
        engine.set_marker(0).unwrap();
        engine.cut_off_at_marker();
        assert!(engine.is_tracking());
        assert_eq!(engine.latest_round(), 0);
        assert!(!engine.particle(id).unwrap().is_expanded());
        engine.step().unwrap();
        assert!(engine.particle(id).unwrap().is_expanded());
    }

    #[test]
    fn shift_and_trim_history() {
        let mut engine = Engine::default();
        engine
            .add_contracted(GridPos::ZERO, E, CCW, Box::new(IdleBehavior))
            .unwrap();
        engine.run(Some(4)).unwrap();
        engine.shift_timescale(10).unwrap();
        assert_eq!((engine.earliest_round(), engine.latest_round()), (10, 14));
        assert!(engine.shift_timescale(-11).is_err());
        assert_eq!(engine.earliest_round(), 10);

        engine.trim_history_before(12).unwrap();
        assert_eq!(engine.earliest_round(), 12);
        assert!(engine.set_marker(11).is_err());
        engine.set_marker(12).unwrap();
        engine.continue_tracking();
        engine.step().unwrap();
        assert_eq!(engine.latest_round(), 15);
    }

    // -----------------------------------------------------------------------
    // Test 7: attributes and termination
    // -----------------------------------------------------------------------
    #[test]
    fn attributes_follow_rounds_and_run_stops_when_finished() {
        let mut engine = Engine::default();
        let id = engine
            .add_contracted(
                GridPos::ZERO,
                E,
                CCW,
                Box::new(
                    ScriptedBehavior::new("counter")
                        .on_move(|ctx| {
                            let n = match ctx.attribute("count") {
                                Some(AttributeValue::Int(n)) => n,
                                _ => 0,
                            };
                            ctx.set_attribute("count", AttributeValue::Int(n + 1));
                            Ok(())
                        })
                        .finish_when(|view| {
                            view.attribute("count") == Some(&AttributeValue::Int(3))
                        }),
                ),
            )
            .unwrap();
        let rounds = engine.run(None).unwrap();
        assert_eq!(rounds, 3);
        assert_eq!(engine.finished_round(), Some(3));
        assert_eq!(
            engine.particle(id).unwrap().attribute("count"),
            Some(&AttributeValue::Int(3))
        );
        engine.set_marker(1).unwrap();
        assert_eq!(
            engine.particle(id).unwrap().attribute("count"),
            Some(&AttributeValue::Int(1))
        );
        engine.set_marker(0).unwrap();
        assert_eq!(engine.particle(id).unwrap().attribute("count"), None);
    }

    // -----------------------------------------------------------------------
    // Test 8: determinism
    // -----------------------------------------------------------------------
    #[test]
    fn identical_systems_hash_identically() {
        fn build() -> Vec<u64> {
            let mut engine = Engine::default();
            engine
                .add_contracted(GridPos::ZERO, E, CCW, expander(NNE))
                .unwrap();
            engine
                .add_contracted(GridPos::new(1, 0), E, Chirality::Clockwise, expander(E))
                .unwrap();
            (0..3)
                .map(|_| {
                    engine.step().unwrap();
                    engine.state_hash()
                })
                .collect()
        }
        assert_eq!(build(), build());
    }

    #[test]
    fn committed_events_are_delivered() {
        let mut engine = Engine::default();
        engine
            .add_contracted(GridPos::ZERO, E, CCW, expander(E))
            .unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        engine.on_event(
            EventKind::ParticleMoved,
            Box::new(move |e| log.lock().unwrap().push(e.clone())),
        );
        engine.suppress_event(EventKind::CircuitUpdated);
        engine.step().unwrap();
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(engine.event_bus.total_emitted(EventKind::RoundCommitted), 1);
        assert_eq!(engine.event_bus.total_emitted(EventKind::CircuitUpdated), 0);
    }
}

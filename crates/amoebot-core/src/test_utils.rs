//! Shared test helpers for integration tests and benchmarks.
//!
//! Gated behind `#[cfg(any(test, feature = "test-utils"))]` so these helpers
//! are available in unit tests, integration tests, and benchmarks (via the
//! `test-utils` feature).

use std::sync::{Arc, Mutex};

use crate::behavior::{BeepContext, Behavior, BehaviorRegistry, BehaviorResult, MoveContext};
use crate::engine::Engine;
use crate::grid::{Chirality, Direction, GridPos};
use crate::id::{ParticleId, PartitionSetId};
use crate::particle::{Message, ParticleView};

// ===========================================================================
// Behaviors
// ===========================================================================

/// A behavior that never acts.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdleBehavior;

impl Behavior for IdleBehavior {
    fn name(&self) -> &str {
        "idle"
    }
}

type MoveScript = Box<dyn FnMut(&mut MoveContext<'_>) -> BehaviorResult + Send>;
type BeepScript = Box<dyn FnMut(&mut BeepContext<'_>) -> BehaviorResult + Send>;
type FinishScript = Box<dyn Fn(&ParticleView<'_>) -> bool + Send>;

/// A behavior assembled from closures.
pub struct ScriptedBehavior {
    name: String,
    on_move: Option<MoveScript>,
    on_beep: Option<BeepScript>,
    finish: Option<FinishScript>,
    inbox: Option<Arc<Mutex<Vec<PartitionSetId>>>>,
    messages: Option<Arc<Mutex<Vec<(PartitionSetId, Message)>>>>,
}

impl std::fmt::Debug for ScriptedBehavior {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedBehavior")
            .field("name", &self.name)
            .field("on_move", &self.on_move.is_some())
            .field("on_beep", &self.on_beep.is_some())
            .finish()
    }
}

impl ScriptedBehavior {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            on_move: None,
            on_beep: None,
            finish: None,
            inbox: None,
            messages: None,
        }
    }

    pub fn on_move(
        mut self,
        script: impl FnMut(&mut MoveContext<'_>) -> BehaviorResult + Send + 'static,
    ) -> Self {
        self.on_move = Some(Box::new(script));
        self
    }

    pub fn on_beep(
        mut self,
        script: impl FnMut(&mut BeepContext<'_>) -> BehaviorResult + Send + 'static,
    ) -> Self {
        self.on_beep = Some(Box::new(script));
        self
    }

    /// Report finished once `check` holds for the committed state.
    pub fn finish_when(
        mut self,
        check: impl Fn(&ParticleView<'_>) -> bool + Send + 'static,
    ) -> Self {
        self.finish = Some(Box::new(check));
        self
    }

    /// Collect the partition sets of received beeps.
    pub fn with_inbox(mut self, inbox: Arc<Mutex<Vec<PartitionSetId>>>) -> Self {
        self.inbox = Some(inbox);
        self
    }

    /// Collect received messages.
    pub fn with_message_inbox(
        mut self,
        messages: Arc<Mutex<Vec<(PartitionSetId, Message)>>>,
    ) -> Self {
        self.messages = Some(messages);
        self
    }
}

impl Behavior for ScriptedBehavior {
    fn name(&self) -> &str {
        &self.name
    }

    fn activate_move(&mut self, ctx: &mut MoveContext<'_>) -> BehaviorResult {
        match self.on_move.as_mut() {
            Some(script) => script(ctx),
            None => Ok(()),
        }
    }

    fn activate_beep(&mut self, ctx: &mut BeepContext<'_>) -> BehaviorResult {
        match self.on_beep.as_mut() {
            Some(script) => script(ctx),
            None => Ok(()),
        }
    }

    fn receive_beep(&mut self, set: PartitionSetId) -> BehaviorResult {
        if let Some(inbox) = &self.inbox {
            inbox.lock().unwrap().push(set);
        }
        Ok(())
    }

    fn receive_message(&mut self, set: PartitionSetId, message: &Message) -> BehaviorResult {
        if let Some(messages) = &self.messages {
            messages.lock().unwrap().push((set, message.clone()));
        }
        Ok(())
    }

    fn is_finished(&self, view: &ParticleView<'_>) -> bool {
        self.finish.as_ref().is_some_and(|check| check(view))
    }
}

// ===========================================================================
// System builders
// ===========================================================================

/// Add `len` contracted particles in a straight line from `start` towards
/// `dir`, all with compass East and counter-clockwise chirality.
pub fn contracted_line(
    engine: &mut Engine,
    start: GridPos,
    dir: Direction,
    len: usize,
    mut behavior: impl FnMut() -> Box<dyn Behavior>,
) -> Vec<ParticleId> {
    let mut pos = start;
    let mut ids = Vec::with_capacity(len);
    for _ in 0..len {
        let id = engine
            .add_contracted(pos, Direction::E, Chirality::CounterClockwise, behavior())
            .unwrap();
        ids.push(id);
        pos = pos.neighbor(dir);
    }
    ids
}

/// Add `len` particles expanded along `dir`, tail to head, each occupying
/// two consecutive nodes of the line starting at `start`.
pub fn expanded_line(
    engine: &mut Engine,
    start: GridPos,
    dir: Direction,
    len: usize,
    mut behavior: impl FnMut() -> Box<dyn Behavior>,
) -> Vec<ParticleId> {
    let mut tail = start;
    let mut ids = Vec::with_capacity(len);
    for _ in 0..len {
        let head = tail.neighbor(dir);
        let id = engine
            .add_expanded(
                head,
                tail,
                Direction::E,
                Chirality::CounterClockwise,
                behavior(),
            )
            .unwrap();
        ids.push(id);
        tail = head.neighbor(dir);
    }
    ids
}

/// A registry that knows the idle behavior.
pub fn idle_registry() -> BehaviorRegistry {
    let mut registry = BehaviorRegistry::new();
    registry
        .register("idle", || Box::new(IdleBehavior))
        .unwrap();
    registry
}

//! Renderer notifications with pre-allocated ring buffers.
//!
//! The engine emits [`RenderEvent`]s while committing or rolling back a
//! round and delivers them in one batch at the end of the call. Each event
//! kind has its own [`EventBuffer`]; when a buffer is full the oldest events
//! are dropped. Listeners are passive: nothing the engine does depends on
//! them.
//!
//! Event kinds can be suppressed via [`EventBus::suppress`], which prevents
//! any allocation or recording for that kind.

use crate::grid::{GridPos, Placement};
use crate::id::{CircuitId, ParticleId};
use crate::sim::Round;

// ---------------------------------------------------------------------------
// Event types
// ---------------------------------------------------------------------------

/// A post-round notification for renderers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderEvent {
    ParticleMoved {
        particle: ParticleId,
        from: Placement,
        to: Placement,
        round: Round,
    },
    BondRendered {
        particles: (ParticleId, ParticleId),
        nodes: (GridPos, GridPos),
        marked: bool,
        round: Round,
    },
    CircuitUpdated {
        circuit: CircuitId,
        members: usize,
        beep: bool,
        message: bool,
        round: Round,
    },
    RoundCommitted {
        round: Round,
        moved: usize,
    },
    RoundRolledBack {
        round: Round,
        reason: String,
    },
}

/// Discriminant tag for event types, used for suppression and filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ParticleMoved,
    BondRendered,
    CircuitUpdated,
    RoundCommitted,
    RoundRolledBack,
}

/// Total number of event kinds.
const EVENT_KIND_COUNT: usize = 5;

impl RenderEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            RenderEvent::ParticleMoved { .. } => EventKind::ParticleMoved,
            RenderEvent::BondRendered { .. } => EventKind::BondRendered,
            RenderEvent::CircuitUpdated { .. } => EventKind::CircuitUpdated,
            RenderEvent::RoundCommitted { .. } => EventKind::RoundCommitted,
            RenderEvent::RoundRolledBack { .. } => EventKind::RoundRolledBack,
        }
    }
}

impl EventKind {
    fn index(self) -> usize {
        self as usize
    }
}

// ---------------------------------------------------------------------------
// EventBuffer
// ---------------------------------------------------------------------------

/// A pre-allocated ring buffer for events. Fixed capacity; when full, the
/// oldest events are dropped.
#[derive(Debug)]
pub struct EventBuffer {
    events: Vec<Option<RenderEvent>>,
    /// Write position (wraps around).
    head: usize,
    len: usize,
    /// Total events ever written (including dropped).
    total_written: u64,
    /// Events overwritten before they were read.
    dropped: u64,
}

impl EventBuffer {
    /// Create a new ring buffer with the given capacity.
    /// A capacity of 0 is clamped to 1.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: (0..capacity).map(|_| None).collect(),
            head: 0,
            len: 0,
            total_written: 0,
            dropped: 0,
        }
    }

    pub fn push(&mut self, event: RenderEvent) {
        if self.len == self.capacity() {
            self.dropped += 1;
        }
        self.events[self.head] = Some(event);
        self.head = (self.head + 1) % self.capacity();
        if self.len < self.capacity() {
            self.len += 1;
        }
        self.total_written += 1;
    }

    pub fn capacity(&self) -> usize {
        self.events.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn total_written(&self) -> u64 {
        self.total_written
    }

    /// Number of events that were dropped because the buffer was full.
    pub fn dropped_count(&self) -> u64 {
        self.dropped
    }

    /// Iterate over events from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &RenderEvent> {
        let start = if self.len < self.capacity() {
            0
        } else {
            self.head
        };
        (0..self.len).filter_map(move |i| self.events[(start + i) % self.capacity()].as_ref())
    }

    pub fn clear(&mut self) {
        for slot in &mut self.events {
            *slot = None;
        }
        self.head = 0;
        self.len = 0;
    }
}

// ---------------------------------------------------------------------------
// Listeners
// ---------------------------------------------------------------------------

/// A passive listener receives events read-only.
pub type Listener = Box<dyn FnMut(&RenderEvent) + Send>;

/// Optional predicate that filters events for a listener.
pub type EventFilter = Box<dyn Fn(&RenderEvent) -> bool + Send>;

/// Priority level for listeners. Lower priorities run first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ListenerPriority {
    Pre = 0,
    Normal = 1,
    Post = 2,
}

struct ListenerEntry {
    listener: Listener,
    priority: ListenerPriority,
    filter: Option<EventFilter>,
    insertion_order: u64,
}

impl std::fmt::Debug for ListenerEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerEntry")
            .field("priority", &self.priority)
            .field("filtered", &self.filter.is_some())
            .field("insertion_order", &self.insertion_order)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Ring buffers, listeners and suppression flags per event kind.
#[derive(Debug)]
pub struct EventBus {
    buffers: [Option<EventBuffer>; EVENT_KIND_COUNT],
    suppressed: [bool; EVENT_KIND_COUNT],
    listeners: [Vec<ListenerEntry>; EVENT_KIND_COUNT],
    default_capacity: usize,
    next_insertion_order: u64,
}

impl EventBus {
    /// Create an event bus with the given buffer capacity per kind.
    pub fn new(default_capacity: usize) -> Self {
        Self {
            buffers: Default::default(),
            suppressed: [false; EVENT_KIND_COUNT],
            listeners: Default::default(),
            default_capacity,
            next_insertion_order: 0,
        }
    }

    /// Suppress an event kind. Suppressed events are never buffered.
    pub fn suppress(&mut self, kind: EventKind) {
        self.suppressed[kind.index()] = true;
        self.buffers[kind.index()] = None;
    }

    pub fn is_suppressed(&self, kind: EventKind) -> bool {
        self.suppressed[kind.index()]
    }

    /// Buffer an event. No-op if its kind is suppressed.
    pub fn emit(&mut self, event: RenderEvent) {
        let idx = event.kind().index();
        if self.suppressed[idx] {
            return;
        }
        let capacity = self.default_capacity;
        self.buffers[idx]
            .get_or_insert_with(|| EventBuffer::new(capacity))
            .push(event);
    }

    /// Register a listener with normal priority and no filter.
    pub fn on(&mut self, kind: EventKind, listener: Listener) {
        self.on_filtered(kind, ListenerPriority::Normal, None, listener);
    }

    /// Register a listener with explicit priority and optional filter.
    pub fn on_filtered(
        &mut self,
        kind: EventKind,
        priority: ListenerPriority,
        filter: Option<EventFilter>,
        listener: Listener,
    ) {
        let order = self.next_insertion_order;
        self.next_insertion_order += 1;
        self.listeners[kind.index()].push(ListenerEntry {
            listener,
            priority,
            filter,
            insertion_order: order,
        });
    }

    /// Deliver all buffered events to listeners, ordered by
    /// `(priority, insertion_order)`, then clear the buffers.
    pub fn deliver(&mut self) {
        for idx in 0..EVENT_KIND_COUNT {
            let Some(buffer) = self.buffers[idx].as_mut() else {
                continue;
            };
            if buffer.is_empty() {
                continue;
            }
            let events: Vec<RenderEvent> = buffer.iter().cloned().collect();
            buffer.clear();

            let listeners = &mut self.listeners[idx];
            listeners.sort_by_key(|entry| (entry.priority, entry.insertion_order));
            for entry in listeners.iter_mut() {
                for event in &events {
                    if let Some(filter) = &entry.filter
                        && !filter(event)
                    {
                        continue;
                    }
                    (entry.listener)(event);
                }
            }
        }
    }

    pub fn buffer(&self, kind: EventKind) -> Option<&EventBuffer> {
        self.buffers[kind.index()].as_ref()
    }

    pub fn buffered_count(&self, kind: EventKind) -> usize {
        self.buffers[kind.index()].as_ref().map_or(0, |b| b.len())
    }

    /// Total events ever emitted for a kind (including dropped).
    pub fn total_emitted(&self, kind: EventKind) -> u64 {
        self.buffers[kind.index()]
            .as_ref()
            .map_or(0, |b| b.total_written())
    }

    /// Clear all buffers. Listeners and suppression settings are kept.
    pub fn clear_all(&mut self) {
        for buffer in self.buffers.iter_mut().flatten() {
            buffer.clear();
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

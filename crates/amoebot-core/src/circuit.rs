//! Circuit discovery.
//!
//! Partition sets of neighboring particles whose pins face each other across
//! a grid edge belong to the same circuit. Circuits are the connected
//! components of that relation and are recomputed from scratch every round.
//!
//! Discovery walks the particles breadth-first over grid adjacency. Each
//! non-empty partition set becomes a node of a [`CircuitForest`]; when one
//! of its pins faces a pin of an already processed neighbor, the two
//! partition sets are merged. Merging ORs the beep flags and keeps the
//! greatest message.

use std::collections::{BTreeMap, VecDeque};

use tracing::debug;

use crate::grid::{Chirality, Direction, GridPos, Placement, direction_of_label, label_of};
use crate::id::{CircuitId, ParticleId, PartitionSetId};
use crate::particle::{Message, Signals};
use crate::pins::{GlobalPin, PinConfiguration, opposing_offset, pin_to_global, pin_to_local};

// ---------------------------------------------------------------------------
// Union-find
// ---------------------------------------------------------------------------

/// Disjoint-set forest over partition sets with per-root signal aggregates.
#[derive(Debug, Clone, Default)]
pub struct CircuitForest {
    parent: Vec<usize>,
    rank: Vec<u8>,
    beep: Vec<bool>,
    message: Vec<Option<Message>>,
}

impl CircuitForest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a singleton circuit and return its node.
    pub fn add(&mut self, beep: bool, message: Option<Message>) -> usize {
        let node = self.parent.len();
        self.parent.push(node);
        self.rank.push(0);
        self.beep.push(beep);
        self.message.push(message);
        node
    }

    pub fn len(&self) -> usize {
        self.parent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parent.is_empty()
    }

    /// Root of `node`'s circuit, compressing the path on the way.
    pub fn find(&mut self, node: usize) -> usize {
        let mut root = node;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        let mut current = node;
        while self.parent[current] != root {
            let next = self.parent[current];
            self.parent[current] = root;
            current = next;
        }
        root
    }

    /// Merge the circuits of `a` and `b` and return the new root.
    pub fn union(&mut self, a: usize, b: usize) -> usize {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return ra;
        }
        let (root, child) = if self.rank[ra] >= self.rank[rb] {
            (ra, rb)
        } else {
            (rb, ra)
        };
        if self.rank[root] == self.rank[child] {
            self.rank[root] += 1;
        }
        self.parent[child] = root;
        self.beep[root] |= self.beep[child];
        let child_message = self.message[child].take();
        if child_message > self.message[root] {
            self.message[root] = child_message;
        }
        root
    }

    /// Whether the circuit of `node` carries a beep.
    pub fn beep(&mut self, node: usize) -> bool {
        let root = self.find(node);
        self.beep[root]
    }

    /// The message carried by the circuit of `node`.
    pub fn message(&mut self, node: usize) -> Option<&Message> {
        let root = self.find(node);
        self.message[root].as_ref()
    }
}

// ---------------------------------------------------------------------------
// Layout
// ---------------------------------------------------------------------------

/// One particle's input to discovery.
#[derive(Debug, Clone, Copy)]
pub struct CircuitInput<'a> {
    pub id: ParticleId,
    /// Placement in the global frame.
    pub placement: Placement,
    pub compass: Direction,
    pub chirality: Chirality,
    pub pins: &'a PinConfiguration,
    /// Signals the particle sends this round.
    pub signals: &'a Signals,
}

/// A discovered circuit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Circuit {
    pub id: CircuitId,
    /// Member partition sets, in discovery order.
    pub members: Vec<(ParticleId, PartitionSetId)>,
    pub beep: bool,
    pub message: Option<Message>,
}

impl Circuit {
    pub fn has_signal(&self) -> bool {
        self.beep || self.message.is_some()
    }
}

/// The circuits of one round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CircuitLayout {
    assignments: BTreeMap<(ParticleId, PartitionSetId), CircuitId>,
    circuits: Vec<Circuit>,
}

impl CircuitLayout {
    pub fn circuit_of(&self, particle: ParticleId, set: PartitionSetId) -> Option<CircuitId> {
        self.assignments.get(&(particle, set)).copied()
    }

    pub fn circuit(&self, id: CircuitId) -> Option<&Circuit> {
        self.circuits.get(id.0 as usize)
    }

    pub fn circuits(&self) -> &[Circuit] {
        &self.circuits
    }

    pub fn len(&self) -> usize {
        self.circuits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.circuits.is_empty()
    }

    /// Circuits carrying a beep or a message.
    pub fn signalling(&self) -> impl Iterator<Item = &Circuit> {
        self.circuits.iter().filter(|c| c.has_signal())
    }

    /// Signals arriving at each partition set of `particle`.
    pub fn received_by(&self, particle: ParticleId) -> Signals {
        let mut signals = Signals::default();
        let lo = (particle, PartitionSetId(0));
        let hi = (particle, PartitionSetId(u8::MAX));
        for (&(_, set), id) in self.assignments.range(lo..=hi) {
            let Some(circuit) = self.circuit(*id) else {
                continue;
            };
            if circuit.beep {
                signals.add_beep(set);
            }
            if let Some(message) = &circuit.message {
                signals.add_message(set, message.clone());
            }
        }
        signals
    }
}

// ---------------------------------------------------------------------------
// Discovery
// ---------------------------------------------------------------------------

/// Compute the circuits formed by the given particles.
pub fn discover(inputs: &[CircuitInput<'_>]) -> CircuitLayout {
    let mut occupancy = BTreeMap::new();
    for (i, input) in inputs.iter().enumerate() {
        for node in input.placement.nodes() {
            occupancy.insert(node, i);
        }
    }

    let mut forest = CircuitForest::new();
    // Forest node of each (particle, partition set), once processed.
    let mut set_nodes: Vec<Option<BTreeMap<PartitionSetId, usize>>> = vec![None; inputs.len()];
    let mut order: Vec<(usize, PartitionSetId, usize)> = Vec::new();

    let mut queued = vec![false; inputs.len()];
    for start in 0..inputs.len() {
        if queued[start] {
            continue;
        }
        queued[start] = true;
        let mut queue = VecDeque::from([start]);
        while let Some(i) = queue.pop_front() {
            let input = &inputs[i];
            let k = input.pins.pins_per_edge();
            let local_exp = input.pins.expansion();
            let mut nodes = BTreeMap::new();

            for set in input.pins.non_empty_sets() {
                let node = forest.add(
                    input.signals.has_beep(set),
                    input.signals.message(set).cloned(),
                );
                nodes.insert(set, node);
                order.push((i, set, node));

                for pin in input.pins.pins_of(set) {
                    let Some(global) =
                        pin_to_global(pin, k, local_exp, input.compass, input.chirality)
                    else {
                        continue;
                    };
                    let Some((dir, head)) =
                        direction_of_label(global.label, input.placement.expansion)
                    else {
                        continue;
                    };
                    let across = input.placement.part(head).neighbor(dir);
                    let Some(&j) = occupancy.get(&across) else {
                        continue;
                    };
                    let Some(their_nodes) = set_nodes[j].as_ref() else {
                        continue;
                    };
                    let other = &inputs[j];
                    let Some(their_set) = facing_set(other, across, dir, global, k) else {
                        continue;
                    };
                    if let Some(&their_node) = their_nodes.get(&their_set) {
                        forest.union(node, their_node);
                    }
                }
            }
            set_nodes[i] = Some(nodes);

            for node in input.placement.nodes() {
                for dir in Direction::ALL {
                    if let Some(&j) = occupancy.get(&node.neighbor(dir))
                        && !queued[j]
                    {
                        queued[j] = true;
                        queue.push_back(j);
                    }
                }
            }
        }
    }

    let mut layout = CircuitLayout::default();
    let mut circuit_of_root: BTreeMap<usize, CircuitId> = BTreeMap::new();
    for (i, set, node) in order {
        let root = forest.find(node);
        let id = *circuit_of_root.entry(root).or_insert_with(|| {
            let id = CircuitId(layout.circuits.len() as u32);
            layout.circuits.push(Circuit {
                id,
                members: Vec::new(),
                beep: false,
                message: None,
            });
            id
        });
        let circuit = &mut layout.circuits[id.0 as usize];
        circuit.members.push((inputs[i].id, set));
        layout.assignments.insert((inputs[i].id, set), id);
    }
    for (&root, id) in &circuit_of_root {
        let circuit = &mut layout.circuits[id.0 as usize];
        circuit.beep = forest.beep[root];
        circuit.message = forest.message[root].clone();
    }

    debug!(
        particles = inputs.len(),
        circuits = layout.len(),
        signalling = layout.signalling().count(),
        "circuits discovered"
    );
    layout
}

/// Partition set of `other` owning the pin that faces `global` across the
/// edge from direction `dir` into node `across`.
fn facing_set(
    other: &CircuitInput<'_>,
    across: GridPos,
    dir: Direction,
    global: GlobalPin,
    k: usize,
) -> Option<PartitionSetId> {
    if other.pins.pins_per_edge() != k {
        return None;
    }
    let head = other.placement.part_at(across)?;
    let label = label_of(dir.opposite(), head, other.placement.expansion)?;
    let facing = GlobalPin {
        label,
        offset: opposing_offset(global.offset, k),
    };
    let pin = pin_to_local(
        facing,
        k,
        other.placement.expansion,
        other.compass,
        other.chirality,
    )?;
    other.pins.partition_set_of(pin)
}

// ===========================================================================
// Tests
// ===========================================================================

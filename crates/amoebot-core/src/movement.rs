//! Joint movement resolution.
//!
//! Given every particle's placement, validated movement and global bond
//! flags, the solver computes one translation offset per particle so that
//! all active bonds stay intact, or reports a [`Conflict`].
//!
//! # Offsets
//!
//! Each particle has a reference part: the origin node for expansions, the
//! part it keeps for contractions, the tail otherwise. `off(P)` is the
//! translation of that reference part. A bond endpoint of `P` at label `l`
//! additionally moves by `mv(P, l)`:
//!
//! - no movement: zero;
//! - expansion in direction `d`: `d` if the bond is marked, zero otherwise;
//! - contraction into part `S`, vacating `V`: zero at `S`; at `V` the vector
//!   `V -> S`, except that unmarked bonds at shared labels are transferred
//!   to `S` (zero).
//!
//! For bonded particles the endpoints must stay adjacent, which gives
//! `off(Q) = off(P) + mv(P, l) - mv(Q, l')` per bond. The solver derives
//! one relative offset per bonded pair and propagates absolute offsets by
//! BFS from the anchor.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::action::Movement;
use crate::grid::{
    Chirality, Direction, GridPos, Placement, direction_of_label, is_shared_label, label_count,
    label_of, label_to_global,
};
use crate::id::ParticleId;
use crate::particle::BondFlags;

// ---------------------------------------------------------------------------
// Inputs and outputs
// ---------------------------------------------------------------------------

/// How application-time movement failures are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MovementPolicy {
    /// Any inconsistency aborts the round.
    #[default]
    Strict,
    /// Handover disagreements and blocked expansions drop the offending
    /// movement, in ascending particle insertion order, instead of aborting.
    FirstComeFirstServed,
}

/// One particle's input to the solver, in the global frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoveInfo {
    pub id: ParticleId,
    pub placement: Placement,
    pub movement: Option<Movement>,
    /// Bond flags indexed by global label.
    pub bonds: BondFlags,
}

/// A bond as drawn after the round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BondSegment {
    pub particles: (ParticleId, ParticleId),
    pub nodes: (GridPos, GridPos),
    pub marked: bool,
}

/// Result of a successful resolution. Vectors are aligned with the input.
#[derive(Debug, Clone, Default)]
pub struct MovementOutcome {
    pub placements: Vec<Placement>,
    pub offsets: Vec<GridPos>,
    /// Movements actually applied, after policy drops.
    pub applied: Vec<Option<Movement>>,
    /// Particles whose movement was dropped.
    pub dropped: Vec<ParticleId>,
    pub bonds: Vec<BondSegment>,
}

/// Reasons a round's movements cannot be applied jointly.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Conflict {
    #[error("anchor {anchor:?} is not part of the system")]
    MissingAnchor { anchor: ParticleId },
    #[error("particle {particle:?} reached with offset {found} but expected {expected}")]
    OffsetMismatch {
        particle: ParticleId,
        expected: GridPos,
        found: GridPos,
    },
    #[error("bonds between {first:?} and {second:?} require different offsets")]
    BondDisagreement {
        first: ParticleId,
        second: ParticleId,
    },
    #[error("particle {particle:?} is not connected to the anchor through active bonds")]
    Disconnected { particle: ParticleId },
    #[error("particles {first:?} and {second:?} both end up at {node}")]
    Collision {
        node: GridPos,
        first: ParticleId,
        second: ParticleId,
    },
    #[error("handover of {particle:?} is not matched by its partner")]
    HandoverDisagreement { particle: ParticleId },
    #[error("handover between {first:?} and {second:?} would tear a marked bond")]
    HandoverTear {
        first: ParticleId,
        second: ParticleId,
    },
    #[error("parallel bonds between {first:?} and {second:?} disagree on movement")]
    ParallelBondDisagreement {
        first: ParticleId,
        second: ParticleId,
    },
    #[error("three bonds between {first:?} and {second:?} forbid this movement")]
    RigidBondViolation {
        first: ParticleId,
        second: ParticleId,
    },
}

/// Translate local bond flags into global label numbering.
pub fn global_bond_flags(
    local: BondFlags,
    local_expansion: Option<Direction>,
    compass: Direction,
    chirality: Chirality,
) -> BondFlags {
    let mut global = BondFlags {
        active: 0,
        marked: 0,
    };
    for l in 0..label_count(local_expansion) {
        if let Some(g) = label_to_global(l, local_expansion, compass, chirality) {
            global.set_active(g, local.is_active(l));
            global.set_marked(g, local.is_marked(l));
        }
    }
    global
}

/// Resolve one round of movements.
pub fn resolve(
    infos: &[MoveInfo],
    anchor: ParticleId,
    policy: MovementPolicy,
) -> Result<MovementOutcome, Conflict> {
    if infos.is_empty() {
        return Ok(MovementOutcome::default());
    }
    let anchor = infos
        .iter()
        .position(|info| info.id == anchor)
        .ok_or(Conflict::MissingAnchor { anchor })?;
    let mut solver = Solver::new(infos, policy);
    solver.agree_handovers()?;
    if policy == MovementPolicy::FirstComeFirstServed {
        solver.drop_blocked_expansions();
    }
    solver.solve(anchor)
}

// ---------------------------------------------------------------------------
// Solver
// ---------------------------------------------------------------------------

/// One end of a bond.
#[derive(Debug, Clone, Copy)]
struct BondEnd {
    label: usize,
    node: GridPos,
}

/// A bond between particles `i < j`; `a` belongs to `i`, `b` to `j`.
#[derive(Debug, Clone, Copy)]
struct PairBond {
    a: BondEnd,
    b: BondEnd,
}

struct Solver<'a> {
    infos: &'a [MoveInfo],
    policy: MovementPolicy,
    /// Pre-round node occupancy.
    nodes: BTreeMap<GridPos, usize>,
    movements: Vec<Option<Movement>>,
    partners: Vec<Option<usize>>,
    dropped: Vec<usize>,
}

impl<'a> Solver<'a> {
    fn new(infos: &'a [MoveInfo], policy: MovementPolicy) -> Self {
        let mut nodes = BTreeMap::new();
        for (i, info) in infos.iter().enumerate() {
            for node in info.placement.nodes() {
                nodes.insert(node, i);
            }
        }
        Self {
            infos,
            policy,
            nodes,
            movements: infos.iter().map(|info| info.movement).collect(),
            partners: vec![None; infos.len()],
            dropped: Vec::new(),
        }
    }

    fn id(&self, i: usize) -> ParticleId {
        self.infos[i].id
    }

    fn placement(&self, i: usize) -> &Placement {
        &self.infos[i].placement
    }

    fn drop_movement(&mut self, i: usize, reason: &str) {
        warn!(particle = ?self.id(i), movement = ?self.movements[i], reason, "movement dropped");
        self.movements[i] = None;
        self.dropped.push(i);
    }

    /// Node a contracting particle leaves.
    fn vacated(&self, i: usize) -> Option<GridPos> {
        let keeps_head = self.movements[i]?.keeps_head()?;
        let p = self.placement(i);
        p.is_expanded().then(|| p.part(!keeps_head))
    }

    /// Vector from the vacated part to the kept part.
    fn contraction_vector(&self, i: usize) -> Option<GridPos> {
        let keeps_head = self.movements[i]?.keeps_head()?;
        let e = self.placement(i).expansion?.offset();
        Some(if keeps_head { e } else { -e })
    }

    // -----------------------------------------------------------------------
    // Handovers
    // -----------------------------------------------------------------------

    /// The agreed handover partner of `i`, if `i` performs a handover.
    fn handover_partner(&self, i: usize) -> Option<usize> {
        let m = self.movements[i]?;
        let target = m.handover_target(self.placement(i))?;
        let j = *self.nodes.get(&target)?;
        let (pusher, puller) = match m {
            Movement::Push(_) => (i, j),
            _ => (j, i),
        };
        let push = self.movements[pusher]?;
        let pull = self.movements[puller]?;
        let agreed = matches!(push, Movement::Push(_))
            && matches!(pull, Movement::PullHead(_) | Movement::PullTail(_))
            && push.handover_target(self.placement(pusher)) == self.vacated(puller)
            && pull.handover_target(self.placement(puller)) == Some(self.placement(pusher).tail);
        agreed.then_some(j)
    }

    /// Make sure every handover is matched by its partner.
    fn agree_handovers(&mut self) -> Result<(), Conflict> {
        loop {
            let unmatched = (0..self.infos.len()).find(|&i| {
                self.movements[i].is_some_and(|m| m.is_handover())
                    && self.handover_partner(i).is_none()
            });
            let Some(i) = unmatched else { break };
            match self.policy {
                MovementPolicy::Strict => {
                    return Err(Conflict::HandoverDisagreement {
                        particle: self.id(i),
                    });
                }
                MovementPolicy::FirstComeFirstServed => {
                    self.drop_movement(i, "unmatched handover");
                }
            }
        }
        for i in 0..self.infos.len() {
            self.partners[i] = self.handover_partner(i);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // First-come-first-served expansion checks
    // -----------------------------------------------------------------------

    fn drop_blocked_expansions(&mut self) {
        let mut claimed: BTreeSet<GridPos> = (0..self.infos.len())
            .filter(|&i| matches!(self.movements[i], Some(Movement::Push(_))))
            .filter_map(|i| self.movements[i]?.handover_target(self.placement(i)))
            .collect();
        for i in 0..self.infos.len() {
            let Some(Movement::Expand(d)) = self.movements[i] else {
                continue;
            };
            let target = self.placement(i).tail.neighbor(d);
            let blocked = claimed.contains(&target)
                || self.nodes.get(&target).is_some_and(|&j| {
                    self.vacated(j) != Some(target) && !self.pushes_over_marked_bond(i, j, d)
                });
            if blocked {
                self.drop_movement(i, "expansion target blocked");
            } else {
                claimed.insert(target);
            }
        }
    }

    /// Whether contracted `i` is bonded to `j` by an active, marked bond in
    /// direction `d`.
    fn pushes_over_marked_bond(&self, i: usize, j: usize, d: Direction) -> bool {
        let flags = &self.infos[i].bonds;
        let l = d.to_int();
        if !flags.is_active(l) || !flags.is_marked(l) {
            return false;
        }
        let pj = self.placement(j);
        let target = self.placement(i).tail.neighbor(d);
        pj.part_at(target)
            .and_then(|head| label_of(d.opposite(), head, pj.expansion))
            .is_some_and(|lj| self.infos[j].bonds.is_active(lj))
    }

    // -----------------------------------------------------------------------
    // Bond graph
    // -----------------------------------------------------------------------

    fn collect_bonds(&self) -> BTreeMap<(usize, usize), Vec<PairBond>> {
        let mut pairs: BTreeMap<(usize, usize), Vec<PairBond>> = BTreeMap::new();
        for (i, info) in self.infos.iter().enumerate() {
            let p = &info.placement;
            for l in 0..label_count(p.expansion) {
                if !info.bonds.is_active(l) {
                    continue;
                }
                let Some((dir, head)) = direction_of_label(l, p.expansion) else {
                    continue;
                };
                let node = p.part(head);
                let other = node.neighbor(dir);
                let Some(&j) = self.nodes.get(&other) else {
                    continue;
                };
                if j <= i {
                    continue;
                }
                let pj = self.placement(j);
                let Some(lj) = pj
                    .part_at(other)
                    .and_then(|h| label_of(dir.opposite(), h, pj.expansion))
                else {
                    continue;
                };
                if self.infos[j].bonds.is_active(lj) {
                    pairs.entry((i, j)).or_default().push(PairBond {
                        a: BondEnd { label: l, node },
                        b: BondEnd {
                            label: lj,
                            node: other,
                        },
                    });
                }
            }
        }
        pairs
    }

    /// Movement of the bond endpoint at label `l` relative to `off(i)`.
    fn endpoint_shift(&self, i: usize, l: usize, allow_transfer: bool) -> GridPos {
        let Some(m) = self.movements[i] else {
            return GridPos::ZERO;
        };
        let marked = self.infos[i].bonds.is_marked(l);
        if let Some(d) = m.expansion_dir() {
            return if marked { d.offset() } else { GridPos::ZERO };
        }
        let (Some(keeps_head), Some(c)) = (m.keeps_head(), self.contraction_vector(i)) else {
            return GridPos::ZERO;
        };
        let exp = self.placement(i).expansion;
        match direction_of_label(l, exp) {
            Some((_, at_head)) if at_head == keeps_head => GridPos::ZERO,
            _ if allow_transfer && is_shared_label(l, exp) && !marked => GridPos::ZERO,
            _ => c,
        }
    }

    /// Per-bond relative offsets; every bond must give the same answer.
    fn per_bond(&self, i: usize, j: usize, bonds: &[PairBond], allow_transfer: bool) -> Option<GridPos> {
        let mut rel = None;
        for bond in bonds {
            let r = self.endpoint_shift(i, bond.a.label, allow_transfer)
                - self.endpoint_shift(j, bond.b.label, allow_transfer);
            match rel {
                None => rel = Some(r),
                Some(prev) if prev != r => return None,
                Some(_) => {}
            }
        }
        rel
    }

    fn is_marked(&self, i: usize, end: &BondEnd) -> bool {
        self.infos[i].bonds.is_marked(end.label)
    }

    /// Whether `bond` is the edge a handover between `i` and `j` runs over.
    fn is_handover_bond(&self, i: usize, j: usize, bond: &PairBond) -> bool {
        self.vacated(i) == Some(bond.a.node) || self.vacated(j) == Some(bond.b.node)
    }

    /// `off(j) - off(i)` for bonded particles `i < j`.
    fn relation(&self, i: usize, j: usize, bonds: &[PairBond]) -> Result<GridPos, Conflict> {
        let (first, second) = (self.id(i), self.id(j));

        if self.partners[i] == Some(j) {
            let tears = bonds.iter().any(|b| {
                !self.is_handover_bond(i, j, b) && (self.is_marked(i, &b.a) || self.is_marked(j, &b.b))
            });
            if tears {
                return Err(Conflict::HandoverTear { first, second });
            }
            return Ok(GridPos::ZERO);
        }

        let both_expanded = self.placement(i).is_expanded() && self.placement(j).is_expanded();
        if both_expanded && bonds.len() >= 3 {
            let still = self.movements[i].is_none() && self.movements[j].is_none();
            let same_side = self.contraction_vector(i).is_some()
                && self.contraction_vector(i) == self.contraction_vector(j)
                && bonds
                    .iter()
                    .all(|b| self.is_marked(i, &b.a) && self.is_marked(j, &b.b));
            return if still || same_side {
                Ok(GridPos::ZERO)
            } else {
                Err(Conflict::RigidBondViolation { first, second })
            };
        }
        if both_expanded
            && bonds.len() == 2
            && bonds[0].a.node != bonds[1].a.node
            && bonds[0].b.node != bonds[1].b.node
        {
            if self.movements[i].is_some() != self.movements[j].is_some() {
                return Err(Conflict::ParallelBondDisagreement { first, second });
            }
            return self
                .per_bond(i, j, bonds, false)
                .ok_or(Conflict::ParallelBondDisagreement { first, second });
        }
        self.per_bond(i, j, bonds, true)
            .ok_or(Conflict::BondDisagreement { first, second })
    }

    // -----------------------------------------------------------------------
    // Traversal and application
    // -----------------------------------------------------------------------

    fn solve(self, anchor: usize) -> Result<MovementOutcome, Conflict> {
        let n = self.infos.len();
        let pairs = self.collect_bonds();

        let mut adjacency: Vec<Vec<(usize, GridPos)>> = vec![Vec::new(); n];
        for (&(i, j), bonds) in &pairs {
            let rel = self.relation(i, j, bonds)?;
            adjacency[i].push((j, rel));
            adjacency[j].push((i, -rel));
        }

        let mut offsets: Vec<Option<GridPos>> = vec![None; n];
        offsets[anchor] = Some(GridPos::ZERO);
        let mut queue = VecDeque::from([anchor]);
        while let Some(i) = queue.pop_front() {
            let Some(oi) = offsets[i] else { continue };
            for &(j, rel) in &adjacency[i] {
                let expected = oi + rel;
                match offsets[j] {
                    None => {
                        offsets[j] = Some(expected);
                        queue.push_back(j);
                    }
                    Some(found) if found != expected => {
                        return Err(Conflict::OffsetMismatch {
                            particle: self.id(j),
                            expected,
                            found,
                        });
                    }
                    Some(_) => {}
                }
            }
        }

        let mut resolved = Vec::with_capacity(n);
        for (i, off) in offsets.iter().enumerate() {
            match off {
                Some(off) => resolved.push(*off),
                None => return Err(Conflict::Disconnected { particle: self.id(i) }),
            }
        }

        let placements: Vec<Placement> = (0..n).map(|i| self.new_placement(i, resolved[i])).collect();

        let mut claimed: BTreeMap<GridPos, usize> = BTreeMap::new();
        for (i, p) in placements.iter().enumerate() {
            for node in p.nodes() {
                if let Some(&other) = claimed.get(&node) {
                    return Err(Conflict::Collision {
                        node,
                        first: self.id(other),
                        second: self.id(i),
                    });
                }
                claimed.insert(node, i);
            }
        }

        let mut segments = Vec::new();
        for (&(i, j), bonds) in &pairs {
            for bond in bonds {
                let handover = self.partners[i] == Some(j) && self.is_handover_bond(i, j, bond);
                segments.push(BondSegment {
                    particles: (self.id(i), self.id(j)),
                    nodes: (
                        self.endpoint_after(i, &bond.a, &placements[i], handover),
                        self.endpoint_after(j, &bond.b, &placements[j], handover),
                    ),
                    marked: self.is_marked(i, &bond.a) || self.is_marked(j, &bond.b),
                });
            }
        }

        let moved = self.movements.iter().filter(|m| m.is_some()).count();
        debug!(particles = n, moved, dropped = self.dropped.len(), bonds = segments.len(), "movements resolved");

        Ok(MovementOutcome {
            placements,
            offsets: resolved,
            dropped: self.dropped.iter().map(|&i| self.infos[i].id).collect(),
            applied: self.movements,
            bonds: segments,
        })
    }

    fn new_placement(&self, i: usize, off: GridPos) -> Placement {
        let p = self.placement(i);
        match self.movements[i] {
            None => p.translated(off),
            Some(m) => match (m.expansion_dir(), m.keeps_head()) {
                (Some(d), _) => Placement::expanded(p.tail + off, d),
                (None, Some(true)) => Placement::contracted(p.head() + off),
                _ => Placement::contracted(p.tail + off),
            },
        }
    }

    fn endpoint_after(&self, i: usize, end: &BondEnd, new: &Placement, handover: bool) -> GridPos {
        match self.movements[i] {
            None => new.part(self.placement(i).part_at(end.node).unwrap_or(true)),
            Some(m) if m.expansion_dir().is_some() => {
                if handover || self.is_marked(i, end) {
                    new.head()
                } else {
                    new.tail
                }
            }
            Some(_) => new.tail,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn ids(n: usize) -> Vec<ParticleId> {
        let mut sm = SlotMap::<ParticleId, ()>::with_key();
        (0..n).map(|_| sm.insert(())).collect()
    }

    fn info(id: ParticleId, placement: Placement, movement: Option<Movement>) -> MoveInfo {
        MoveInfo {
            id,
            placement,
            movement,
            bonds: BondFlags::default(),
        }
    }

    fn at(x: i32, y: i32) -> GridPos {
        GridPos::new(x, y)
    }

    // -----------------------------------------------------------------------
    // Test 1: no movement keeps everyone in place
    // -----------------------------------------------------------------------
    #[test]
    fn idle_system_has_zero_offsets() {
        let id = ids(3);
        let infos = vec![
            info(id[0], Placement::contracted(at(0, 0)), None),
            info(id[1], Placement::contracted(at(1, 0)), None),
            info(id[2], Placement::expanded(at(2, 0), Direction::E), None),
        ];
        let out = resolve(&infos, id[0], MovementPolicy::Strict).unwrap();
        assert!(out.offsets.iter().all(|o| *o == GridPos::ZERO));
        assert_eq!(out.bonds.len(), 2);
    }

    // -----------------------------------------------------------------------
    // Test 2: contraction with marked bonds collapses a line
    // -----------------------------------------------------------------------
    #[test]
    fn line_collapses_by_one_unit() {
        let id = ids(3);
        let mut middle = info(
            id[1],
            Placement::expanded(at(1, 0), Direction::E),
            Some(Movement::ContractHead),
        );
        middle.bonds.set_marked(0, true);
        middle.bonds.set_marked(5, true);
        let infos = vec![
            info(id[0], Placement::contracted(at(0, 0)), None),
            middle,
            info(id[2], Placement::contracted(at(3, 0)), None),
        ];
        let out = resolve(&infos, id[0], MovementPolicy::Strict).unwrap();
        assert_eq!(out.offsets[1], at(-1, 0));
        assert_eq!(out.offsets[2], at(-1, 0));
        assert_eq!(out.placements[0], Placement::contracted(at(0, 0)));
        assert_eq!(out.placements[1], Placement::contracted(at(1, 0)));
        assert_eq!(out.placements[2], Placement::contracted(at(2, 0)));
    }

    // -----------------------------------------------------------------------
    // Test 3: expansion into an idle neighbor without a marked bond
    // -----------------------------------------------------------------------
    #[test]
    fn unmarked_expansion_into_neighbor_collides() {
        let id = ids(2);
        let infos = vec![
            info(id[0], Placement::contracted(at(0, 0)), Some(Movement::Expand(Direction::E))),
            info(id[1], Placement::contracted(at(1, 0)), None),
        ];
        let err = resolve(&infos, id[0], MovementPolicy::Strict).unwrap_err();
        assert!(matches!(err, Conflict::Collision { node, .. } if node == at(1, 0)));

        let out = resolve(&infos, id[0], MovementPolicy::FirstComeFirstServed).unwrap();
        assert_eq!(out.dropped, vec![id[0]]);
        assert_eq!(out.applied[0], None);
        assert_eq!(out.placements[0], Placement::contracted(at(0, 0)));
    }

    #[test]
    fn marked_expansion_pushes_neighbor() {
        let id = ids(2);
        let mut pusher = info(
            id[0],
            Placement::contracted(at(0, 0)),
            Some(Movement::Expand(Direction::E)),
        );
        pusher.bonds.set_marked(0, true);
        let infos = vec![pusher, info(id[1], Placement::contracted(at(1, 0)), None)];
        for policy in [MovementPolicy::Strict, MovementPolicy::FirstComeFirstServed] {
            let out = resolve(&infos, id[0], policy).unwrap();
            assert_eq!(out.placements[0], Placement::expanded(at(0, 0), Direction::E));
            assert_eq!(out.placements[1], Placement::contracted(at(2, 0)));
            assert!(out.dropped.is_empty());
        }
    }

    // -----------------------------------------------------------------------
    // Test 4: expanded pairs
    // -----------------------------------------------------------------------
    fn stacked_pair(id: &[ParticleId], first: Option<Movement>) -> Vec<MoveInfo> {
        vec![
            info(id[0], Placement::expanded(at(0, 0), Direction::E), first),
            info(id[1], Placement::expanded(at(0, 1), Direction::E), None),
        ]
    }

    #[test]
    fn parallel_bonds_forbid_unilateral_contraction() {
        let id = ids(2);
        let mut infos = stacked_pair(&id, Some(Movement::ContractHead));
        // Release the diagonal bond so only the two parallel bonds remain.
        infos[0].bonds.set_active(2, false);
        let err = resolve(&infos, id[0], MovementPolicy::Strict).unwrap_err();
        assert!(matches!(err, Conflict::ParallelBondDisagreement { .. }));
    }

    #[test]
    fn parallel_bonds_allow_opposite_contractions() {
        let id = ids(2);
        let mut infos = stacked_pair(&id, Some(Movement::ContractHead));
        infos[0].bonds.set_active(2, false);
        infos[1].movement = Some(Movement::ContractTail);
        let out = resolve(&infos, id[0], MovementPolicy::Strict).unwrap();
        assert_eq!(out.offsets[1], at(1, 0));
        assert_eq!(out.placements[0], Placement::contracted(at(1, 0)));
        assert_eq!(out.placements[1], Placement::contracted(at(1, 1)));
    }

    #[test]
    fn three_bonds_are_rigid() {
        let id = ids(2);
        let infos = stacked_pair(&id, Some(Movement::ContractHead));
        let err = resolve(&infos, id[0], MovementPolicy::Strict).unwrap_err();
        assert!(matches!(err, Conflict::RigidBondViolation { .. }));
    }

    #[test]
    fn three_bonds_allow_joint_marked_contraction() {
        let id = ids(2);
        let mut infos = stacked_pair(&id, Some(Movement::ContractHead));
        infos[1].movement = Some(Movement::ContractHead);
        infos[0].bonds.marked = 0b11_1111_1111;
        infos[1].bonds.marked = 0b11_1111_1111;
        let out = resolve(&infos, id[0], MovementPolicy::Strict).unwrap();
        assert_eq!(out.placements[0], Placement::contracted(at(1, 0)));
        assert_eq!(out.placements[1], Placement::contracted(at(1, 1)));
    }

    // -----------------------------------------------------------------------
    // Test 5: contraction transfers shared bonds and pulls the rest
    // -----------------------------------------------------------------------
    #[test]
    fn contraction_transfers_shared_bonds() {
        let id = ids(3);
        let infos = vec![
            info(
                id[0],
                Placement::expanded(at(0, 0), Direction::E),
                Some(Movement::ContractHead),
            ),
            info(id[1], Placement::contracted(at(0, 1)), None),
            info(id[2], Placement::contracted(at(-1, 0)), None),
        ];
        let out = resolve(&infos, id[0], MovementPolicy::Strict).unwrap();
        assert_eq!(out.placements[0], Placement::contracted(at(1, 0)));
        assert_eq!(out.placements[1], Placement::contracted(at(0, 1)));
        assert_eq!(out.placements[2], Placement::contracted(at(0, 0)));
    }

    // -----------------------------------------------------------------------
    // Test 6: handovers
    // -----------------------------------------------------------------------
    fn handover_pair(id: &[ParticleId], pull: Option<Movement>) -> Vec<MoveInfo> {
        vec![
            info(id[0], Placement::contracted(at(0, 0)), Some(Movement::Push(Direction::E))),
            info(id[1], Placement::expanded(at(1, 0), Direction::E), pull),
        ]
    }

    #[test]
    fn agreed_handover_swaps_node() {
        let id = ids(2);
        let infos = handover_pair(&id, Some(Movement::PullHead(Direction::W)));
        let out = resolve(&infos, id[0], MovementPolicy::Strict).unwrap();
        assert_eq!(out.placements[0], Placement::expanded(at(0, 0), Direction::E));
        assert_eq!(out.placements[1], Placement::contracted(at(2, 0)));
        assert_eq!(out.bonds[0].nodes, (at(1, 0), at(2, 0)));
    }

    #[test]
    fn unmatched_handover_conflicts_or_drops() {
        let id = ids(2);
        let infos = handover_pair(&id, None);
        let err = resolve(&infos, id[0], MovementPolicy::Strict).unwrap_err();
        assert_eq!(err, Conflict::HandoverDisagreement { particle: id[0] });

        let out = resolve(&infos, id[0], MovementPolicy::FirstComeFirstServed).unwrap();
        assert_eq!(out.dropped, vec![id[0]]);
        assert!(out.offsets.iter().all(|o| *o == GridPos::ZERO));
    }

    // -----------------------------------------------------------------------
    // Test 7: connectivity and anchor
    // -----------------------------------------------------------------------
    #[test]
    fn disconnected_system_conflicts() {
        let id = ids(2);
        let infos = vec![
            info(id[0], Placement::contracted(at(0, 0)), None),
            info(id[1], Placement::contracted(at(5, 5)), None),
        ];
        let err = resolve(&infos, id[0], MovementPolicy::Strict).unwrap_err();
        assert_eq!(err, Conflict::Disconnected { particle: id[1] });
    }

    #[test]
    fn released_bond_disconnects() {
        let id = ids(2);
        let mut a = info(id[0], Placement::contracted(at(0, 0)), None);
        a.bonds.set_active(0, false);
        let infos = vec![a, info(id[1], Placement::contracted(at(1, 0)), None)];
        assert!(matches!(
            resolve(&infos, id[0], MovementPolicy::Strict),
            Err(Conflict::Disconnected { .. })
        ));
    }

    #[test]
    fn anchor_must_exist() {
        let id = ids(2);
        let infos = vec![info(id[0], Placement::contracted(at(0, 0)), None)];
        assert_eq!(
            resolve(&infos, id[1], MovementPolicy::Strict).unwrap_err(),
            Conflict::MissingAnchor { anchor: id[1] }
        );
    }

    // -----------------------------------------------------------------------
    // Test 8: global flag translation
    // -----------------------------------------------------------------------
    #[test]
    fn bond_flags_follow_compass() {
        let mut local = BondFlags::default();
        local.set_marked(0, true);
        local.set_active(1, false);
        let global = global_bond_flags(local, None, Direction::W, Chirality::CounterClockwise);
        assert!(global.is_marked(3));
        assert!(!global.is_active(4));
        assert!(global.is_active(0));
    }
}

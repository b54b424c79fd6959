//! Triangular grid coordinates, the six cardinal directions, and the label
//! arithmetic shared by the movement solver and circuit discovery.
//!
//! Positions use axial coordinates. Directions are numbered
//! counter-clockwise starting at East, so `d.rotate(1)` is `d` turned by
//! 60 degrees counter-clockwise.
//!
//! # Labels
//!
//! A contracted particle labels its six incident edges by direction
//! (`0..6`). An expanded particle with expansion direction `e` (pointing
//! from tail to head) has ten incident edges, labelled counter-clockwise
//! along its outline starting at the head's edge in direction `e`:
//!
//! | label | part | direction |
//! |-------|------|-----------|
//! | 0, 1, 2 | head | e, e+1, e+2 |
//! | 3 ..= 7 | tail | e+1 ..= e+5 |
//! | 8, 9 | head | e+4, e+5 |
//!
//! Labels 2/3 and 7/8 point at the two nodes adjacent to both parts.

use serde::{Deserialize, Serialize};
use std::ops::{Add, Neg, Sub};

// ---------------------------------------------------------------------------
// Grid positions
// ---------------------------------------------------------------------------

/// A node of the triangular lattice. Also used as an offset vector.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct GridPos {
    pub x: i32,
    pub y: i32,
}

impl GridPos {
    /// The origin, and the zero offset.
    pub const ZERO: GridPos = GridPos { x: 0, y: 0 };

    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// The adjacent node in the given direction.
    pub fn neighbor(self, dir: Direction) -> GridPos {
        self + dir.offset()
    }

    /// The direction pointing from `self` to an adjacent `other`.
    pub fn direction_to(self, other: GridPos) -> Option<Direction> {
        Direction::from_offset(other - self)
    }

    /// Whether `other` is one of the six neighbors of `self`.
    pub fn is_adjacent(self, other: GridPos) -> bool {
        self.direction_to(other).is_some()
    }
}

impl Add for GridPos {
    type Output = GridPos;

    fn add(self, rhs: GridPos) -> GridPos {
        GridPos::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl Sub for GridPos {
    type Output = GridPos;

    fn sub(self, rhs: GridPos) -> GridPos {
        GridPos::new(self.x - rhs.x, self.y - rhs.y)
    }
}

impl Neg for GridPos {
    type Output = GridPos;

    fn neg(self) -> GridPos {
        GridPos::new(-self.x, -self.y)
    }
}

impl std::fmt::Display for GridPos {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

// ---------------------------------------------------------------------------
// Directions
// ---------------------------------------------------------------------------

/// The six cardinal directions of the triangular grid.
///
/// "No direction" is expressed as `Option<Direction>::None` throughout the
/// crate.
#[allow(clippy::upper_case_acronyms)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Direction {
    E = 0,
    NNE = 1,
    NNW = 2,
    W = 3,
    SSW = 4,
    SSE = 5,
}

impl Direction {
    /// All six directions in counter-clockwise order starting at East.
    pub const ALL: [Direction; 6] = [
        Direction::E,
        Direction::NNE,
        Direction::NNW,
        Direction::W,
        Direction::SSW,
        Direction::SSE,
    ];

    /// Direction with the given index, taken modulo 6.
    pub fn from_int(i: i32) -> Direction {
        Self::ALL[i.rem_euclid(6) as usize]
    }

    pub fn to_int(self) -> usize {
        self as usize
    }

    /// Rotate by `steps` multiples of 60 degrees (positive = counter-clockwise).
    pub fn rotate(self, steps: i32) -> Direction {
        Self::from_int(self as i32 + steps)
    }

    pub fn opposite(self) -> Direction {
        self.rotate(3)
    }

    /// Number of counter-clockwise 60 degree steps from `self` to `to`.
    pub fn ccw_distance(self, to: Direction) -> usize {
        (to as i32 - self as i32).rem_euclid(6) as usize
    }

    /// Unit offset vector of this direction.
    pub fn offset(self) -> GridPos {
        match self {
            Direction::E => GridPos::new(1, 0),
            Direction::NNE => GridPos::new(0, 1),
            Direction::NNW => GridPos::new(-1, 1),
            Direction::W => GridPos::new(-1, 0),
            Direction::SSW => GridPos::new(0, -1),
            Direction::SSE => GridPos::new(1, -1),
        }
    }

    /// The direction whose unit offset equals `offset`, if any.
    pub fn from_offset(offset: GridPos) -> Option<Direction> {
        Self::ALL.into_iter().find(|d| d.offset() == offset)
    }
}

// ---------------------------------------------------------------------------
// Chirality and compass
// ---------------------------------------------------------------------------

/// Rotational sense in which a particle numbers its own neighbors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Chirality {
    #[default]
    CounterClockwise,
    Clockwise,
}

impl Chirality {
    fn sign(self) -> i32 {
        match self {
            Chirality::CounterClockwise => 1,
            Chirality::Clockwise => -1,
        }
    }
}

/// Convert a particle-local direction into the global frame.
///
/// `compass` is the global direction the particle calls its East.
pub fn to_global(local: Direction, compass: Direction, chirality: Chirality) -> Direction {
    compass.rotate(chirality.sign() * local as i32)
}

/// Convert a global direction into a particle's local frame. Inverse of
/// [`to_global`].
pub fn to_local(global: Direction, compass: Direction, chirality: Chirality) -> Direction {
    Direction::from_int(chirality.sign() * (global as i32 - compass as i32))
}

// ---------------------------------------------------------------------------
// Label arithmetic
// ---------------------------------------------------------------------------

/// Number of labelled edges of a contracted particle.
pub const CONTRACTED_LABELS: usize = 6;

/// Number of labelled edges of an expanded particle.
pub const EXPANDED_LABELS: usize = 10;

/// Maximum label count; used to size per-label arrays.
pub const MAX_LABELS: usize = EXPANDED_LABELS;

/// Number of labels for the given expansion state.
pub fn label_count(expansion: Option<Direction>) -> usize {
    match expansion {
        None => CONTRACTED_LABELS,
        Some(_) => EXPANDED_LABELS,
    }
}

/// Label of the edge leaving the head (`is_head`) or tail in direction `dir`.
///
/// Returns `None` for the internal edge between head and tail. For
/// contracted particles `is_head` is ignored.
pub fn label_of(dir: Direction, is_head: bool, expansion: Option<Direction>) -> Option<usize> {
    let Some(e) = expansion else {
        return Some(dir.to_int());
    };
    let k = e.ccw_distance(dir);
    if is_head {
        match k {
            0 => Some(0),
            1 => Some(1),
            2 => Some(2),
            4 => Some(8),
            5 => Some(9),
            _ => None,
        }
    } else {
        match k {
            0 => None,
            k => Some(k + 2),
        }
    }
}

/// Direction and part (`true` = head) of a label. Inverse of [`label_of`].
///
/// Contracted particles report every label at the head.
pub fn direction_of_label(label: usize, expansion: Option<Direction>) -> Option<(Direction, bool)> {
    match expansion {
        None if label < CONTRACTED_LABELS => Some((Direction::ALL[label], true)),
        None => None,
        Some(e) => {
            let (steps, head) = match label {
                0 => (0, true),
                1 => (1, true),
                2 => (2, true),
                3..=7 => (label as i32 - 2, false),
                8 => (4, true),
                9 => (5, true),
                _ => return None,
            };
            Some((e.rotate(steps), head))
        }
    }
}

/// Whether the label points at a node adjacent to both parts of an expanded
/// particle.
pub fn is_shared_label(label: usize, expansion: Option<Direction>) -> bool {
    expansion.is_some() && matches!(label, 2 | 3 | 7 | 8)
}

/// Translate a particle-local label into the global label of the same edge.
pub fn label_to_global(
    local_label: usize,
    local_expansion: Option<Direction>,
    compass: Direction,
    chirality: Chirality,
) -> Option<usize> {
    let (dir, head) = direction_of_label(local_label, local_expansion)?;
    let global_expansion = local_expansion.map(|e| to_global(e, compass, chirality));
    label_of(to_global(dir, compass, chirality), head, global_expansion)
}

/// Translate a global label into the particle-local label of the same edge.
pub fn label_to_local(
    global_label: usize,
    global_expansion: Option<Direction>,
    compass: Direction,
    chirality: Chirality,
) -> Option<usize> {
    let (dir, head) = direction_of_label(global_label, global_expansion)?;
    let local_expansion = global_expansion.map(|e| to_local(e, compass, chirality));
    label_of(to_local(dir, compass, chirality), head, local_expansion)
}

// ---------------------------------------------------------------------------
// Placement
// ---------------------------------------------------------------------------

/// The nodes a particle occupies, in the global frame.
///
/// A contracted particle has `expansion == None` and occupies `tail` only.
/// An expanded particle occupies `tail` and `tail + expansion`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Placement {
    pub tail: GridPos,
    pub expansion: Option<Direction>,
}

impl Placement {
    pub fn contracted(pos: GridPos) -> Self {
        Self {
            tail: pos,
            expansion: None,
        }
    }

    pub fn expanded(tail: GridPos, expansion: Direction) -> Self {
        Self {
            tail,
            expansion: Some(expansion),
        }
    }

    pub fn head(&self) -> GridPos {
        match self.expansion {
            Some(e) => self.tail.neighbor(e),
            None => self.tail,
        }
    }

    pub fn is_expanded(&self) -> bool {
        self.expansion.is_some()
    }

    /// Occupied nodes: the head first, then the tail if expanded.
    pub fn nodes(&self) -> impl Iterator<Item = GridPos> + use<> {
        let head = self.head();
        let tail = self.expansion.map(|_| self.tail);
        std::iter::once(head).chain(tail)
    }

    /// `Some(true)` if `pos` is the head, `Some(false)` if it is the tail of
    /// an expanded particle, `None` if the particle does not occupy `pos`.
    pub fn part_at(&self, pos: GridPos) -> Option<bool> {
        if pos == self.head() {
            Some(true)
        } else if self.is_expanded() && pos == self.tail {
            Some(false)
        } else {
            None
        }
    }

    /// The node the given part occupies.
    pub fn part(&self, head: bool) -> GridPos {
        if head { self.head() } else { self.tail }
    }

    /// The neighboring node behind a (global) label.
    pub fn label_node(&self, label: usize) -> Option<GridPos> {
        let (dir, head) = direction_of_label(label, self.expansion)?;
        Some(self.part(head).neighbor(dir))
    }

    /// Translate the placement by `offset`.
    pub fn translated(&self, offset: GridPos) -> Placement {
        Placement {
            tail: self.tail + offset,
            expansion: self.expansion,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

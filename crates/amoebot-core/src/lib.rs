//! Amoebot Core -- a round-based simulation engine for programmable matter.
//!
//! Particles occupy one or two adjacent nodes of the triangular grid, bond
//! to their neighbors, move by expanding and contracting, and communicate
//! over circuits formed by their pins. Every piece of particle state is
//! recorded per round, so any past round can be shown again or the
//! simulation can be cut back and resumed.
//!
//! # Round Pipeline
//!
//! Each call to [`engine::Engine::step`] simulates one round:
//!
//! 1. **Move** -- Behaviors schedule at most one action and set bond flags.
//! 2. **Resolution** -- The joint movement solver finds one consistent
//!    translation per particle, or reports a conflict.
//! 3. **Signal** -- Behaviors configure pins and send beeps and messages;
//!    circuits are discovered and signals delivered.
//! 4. **Commit** -- Round counters advance and render events are delivered.
//!
//! Any failure rolls the whole system back to the last committed round.
//!
//! # Key Types
//!
//! - [`engine::Engine`] -- Round controller, replay and queries.
//! - [`behavior::Behavior`] -- The particle algorithm contract, with
//!   [`behavior::MoveContext`] and [`behavior::BeepContext`].
//! - [`history::ValueHistory`] -- Compacted round-indexed step function.
//! - [`movement::resolve`] -- Joint movement solver.
//! - [`circuit::discover`] -- Circuit discovery over partition sets.
//! - [`events::EventBus`] -- Buffered render notifications.
//! - [`serialize::SaveData`] -- Persistence via serde_json and bitcode.

pub mod action;
pub mod behavior;
pub mod circuit;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod grid;
pub mod history;
pub mod id;
pub mod movement;
pub mod particle;
pub mod pins;
#[cfg(feature = "profiling")]
pub mod profiling;
pub mod serialize;
pub mod sim;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

//! Integration test: replay, cut-off and rollback.
//!
//! Records a short history, seeks through it, then branches off a past round
//! and checks that the discarded future is gone. Also checks that a failing
//! round leaves the committed history and the render stream consistent.

use std::sync::{Arc, Mutex};

use amoebot_core::behavior::Behavior;
use amoebot_core::engine::Engine;
use amoebot_core::error::SimError;
use amoebot_core::events::{EventKind, RenderEvent};
use amoebot_core::grid::{Chirality, Direction, GridPos, Placement};
use amoebot_core::history::HistoryError;
use amoebot_core::movement::Conflict;
use amoebot_core::particle::AttributeValue;
use amoebot_core::test_utils::ScriptedBehavior;

const CCW: Chirality = Chirality::CounterClockwise;

/// Expands East on even rounds and contracts into the head on odd rounds,
/// so its head advances one node every two rounds.
fn walker() -> Box<dyn Behavior> {
    Box::new(ScriptedBehavior::new("walker").on_move(|ctx| {
        if ctx.is_expanded() {
            ctx.contract_head()?;
        } else {
            ctx.expand(Direction::E)?;
        }
        ctx.set_attribute("seen", AttributeValue::Int(ctx.round() as i64));
        Ok(())
    }))
}

fn walking_engine(rounds: u64) -> (Engine, amoebot_core::id::ParticleId) {
    let mut engine = Engine::default();
    let id = engine
        .add_contracted(GridPos::ZERO, Direction::E, CCW, walker())
        .unwrap();
    engine.run(Some(rounds)).unwrap();
    (engine, id)
}

// ============================================================================
// Test 1: Seeking shows every recorded round
// ============================================================================

#[test]
fn seeking_shows_recorded_rounds() {
    let (mut engine, id) = walking_engine(6);
    assert_eq!(engine.latest_round(), 6);

    for round in 0..=6u64 {
        engine.set_marker(round).unwrap();
        let view = engine.particle(id).unwrap();
        assert_eq!(view.head(), GridPos::new(round.div_ceil(2) as i32, 0));
        assert_eq!(view.is_expanded(), round % 2 == 1);
        assert_eq!(engine.particle_at(view.head()).map(|v| v.id()), Some(id));
    }

    engine.set_marker(2).unwrap();
    engine.step_forward().unwrap();
    assert_eq!(engine.current_round(), 3);
    engine.step_back().unwrap();
    engine.step_back().unwrap();
    assert_eq!(engine.current_round(), 1);
    assert_eq!(
        engine.particle(id).unwrap().attribute("seen"),
        Some(&AttributeValue::Int(0))
    );

    assert!(matches!(engine.step(), Err(SimError::ReplayActive)));
    engine.continue_tracking();
    assert!(engine.is_tracking());
    assert_eq!(engine.current_round(), 6);
}

#[test]
fn seeking_before_the_first_round_fails() {
    let (mut engine, _) = walking_engine(4);
    engine.trim_history_before(2).unwrap();
    assert_eq!(engine.earliest_round(), 2);
    assert!(matches!(
        engine.set_marker(1),
        Err(SimError::History(HistoryError::RoundBeforeFirst { .. }))
    ));
    engine.set_marker(2).unwrap();
    assert!(engine.step_back().is_err());
}

// ============================================================================
// Test 2: Cutting off at the marker branches the history
// ============================================================================

#[test]
fn cut_off_then_resume() {
    let (mut engine, id) = walking_engine(6);
    let (reference, _) = walking_engine(3);

    engine.set_marker(3).unwrap();
    engine.cut_off_at_marker();
    assert_eq!(engine.latest_round(), 3);
    assert!(engine.is_tracking());
    assert_eq!(engine.state_hash(), reference.state_hash());
    assert!(matches!(
        engine.set_marker(5),
        Err(SimError::History(HistoryError::RoundAfterLast { .. }))
    ));

    // The branch replays the same moves as the discarded future.
    engine.run(Some(3)).unwrap();
    assert_eq!(engine.latest_round(), 6);
    assert_eq!(
        engine.particle(id).unwrap().placement(),
        Placement::contracted(GridPos::new(3, 0))
    );
}

#[test]
fn cut_off_while_tracking_is_a_no_op() {
    let (mut engine, _) = walking_engine(3);
    let hash = engine.state_hash();
    engine.cut_off_at_marker();
    assert_eq!(engine.latest_round(), 3);
    assert_eq!(engine.state_hash(), hash);
}

// ============================================================================
// Test 3: Timescale shift keeps the shape of the history
// ============================================================================

#[test]
fn shifted_history_is_relabelled() {
    let (mut engine, id) = walking_engine(4);
    engine.set_marker(1).unwrap();
    let head_at_one = engine.particle(id).unwrap().head();
    engine.continue_tracking();

    engine.shift_timescale(10).unwrap();
    assert_eq!(engine.earliest_round(), 10);
    assert_eq!(engine.latest_round(), 14);
    engine.set_marker(11).unwrap();
    assert_eq!(engine.particle(id).unwrap().head(), head_at_one);
    engine.continue_tracking();

    assert!(engine.shift_timescale(-11).is_err());
    assert_eq!(engine.earliest_round(), 10);
}

// ============================================================================
// Test 4: Rollback leaves history and render stream consistent
// ============================================================================

#[test]
fn failed_round_is_rolled_back_and_reported() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let mut engine = Engine::default();
    let walker_id = engine
        .add_contracted(GridPos::ZERO, Direction::E, CCW, walker())
        .unwrap();
    // Expands into the walker's head in round 1, while the walker contracts
    // into that head.
    engine
        .add_contracted(
            GridPos::new(0, 1),
            Direction::E,
            CCW,
            Box::new(ScriptedBehavior::new("blocker").on_move(|ctx| {
                if ctx.round() == 1 {
                    ctx.expand(Direction::SSE)?;
                }
                Ok(())
            })),
        )
        .unwrap();
    for kind in [EventKind::RoundCommitted, EventKind::RoundRolledBack] {
        let log = Arc::clone(&events);
        engine.on_event(kind, Box::new(move |e| log.lock().unwrap().push(e.clone())));
    }

    engine.step().unwrap();
    let committed_hash = engine.state_hash();
    let err = engine.step().unwrap_err();
    assert!(matches!(
        err,
        SimError::SimulationConflict(Conflict::Collision { .. })
    ));
    assert_eq!(engine.latest_round(), 1);
    assert_eq!(engine.state_hash(), committed_hash);
    assert_eq!(
        engine.particle(walker_id).unwrap().placement(),
        Placement::expanded(GridPos::ZERO, Direction::E)
    );

    let events = events.lock().unwrap();
    assert_eq!(events.len(), 2);
    assert!(matches!(events[0], RenderEvent::RoundCommitted { round: 1, .. }));
    assert!(matches!(events[1], RenderEvent::RoundRolledBack { round: 1, .. }));
}

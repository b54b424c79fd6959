//! Integration test: saving and restoring a running system.
//!
//! A line of crawling particles is run for a few rounds, saved through both
//! the JSON and the binary format, restored with a behavior registry, and
//! then run side by side with the original. Both copies must stay in lock
//! step, round for round.

use amoebot_core::behavior::{Behavior, BehaviorRegistry};
use amoebot_core::config::SimConfig;
use amoebot_core::engine::Engine;
use amoebot_core::grid::{Chirality, Direction, GridPos};
use amoebot_core::id::PartitionSetId;
use amoebot_core::particle::AttributeValue;
use amoebot_core::serialize::{DeserializeError, SaveData, read_snapshot_header};
use amoebot_core::test_utils::{IdleBehavior, contracted_line};

/// Crawls East: expands with its eastern bond marked, then contracts into
/// the head. Counts its moves in an attribute and beeps on even counts.
#[derive(Debug, Default)]
struct Crawler;

impl Behavior for Crawler {
    fn name(&self) -> &str {
        "crawler"
    }

    fn activate_move(
        &mut self,
        ctx: &mut amoebot_core::behavior::MoveContext<'_>,
    ) -> amoebot_core::behavior::BehaviorResult {
        let moves = match ctx.attribute("moves") {
            Some(AttributeValue::Int(n)) => n,
            _ => 0,
        };
        if ctx.is_expanded() {
            ctx.contract_head()?;
        } else {
            ctx.expand(Direction::E)?;
            ctx.mark_bond(0, true)?;
        }
        ctx.set_attribute("moves", AttributeValue::Int(moves + 1));
        Ok(())
    }

    fn activate_beep(
        &mut self,
        ctx: &mut amoebot_core::behavior::BeepContext<'_>,
    ) -> amoebot_core::behavior::BehaviorResult {
        let pins = ctx.global_pins();
        ctx.set_pin_configuration(pins)?;
        if let Some(AttributeValue::Int(n)) = ctx.attribute("moves")
            && n % 2 == 0
        {
            ctx.send_beep(PartitionSetId(0));
        }
        Ok(())
    }
}

fn registry() -> BehaviorRegistry {
    let mut registry = BehaviorRegistry::new();
    registry
        .register("crawler", || Box::new(Crawler))
        .unwrap();
    registry
        .register("idle", || Box::new(IdleBehavior))
        .unwrap();
    registry
}

fn crawling_line() -> Engine {
    let mut engine = Engine::default();
    contracted_line(&mut engine, GridPos::ZERO, Direction::E, 3, || Box::new(Crawler));
    engine
        .add_contracted(
            GridPos::new(-1, 0),
            Direction::SSW,
            Chirality::Clockwise,
            Box::new(IdleBehavior),
        )
        .unwrap();
    engine
}

/// Step both engines `rounds` times and compare after every round.
fn assert_lock_step(original: &mut Engine, restored: &mut Engine, rounds: usize) {
    for _ in 0..rounds {
        let a = original.step().unwrap();
        let b = restored.step().unwrap();
        assert_eq!(a.round, b.round);
        assert_eq!(a.moved.len(), b.moved.len());
        assert_eq!(original.state_hash(), restored.state_hash());
        assert_eq!(original.positions().len(), restored.positions().len());
    }
}

// ============================================================================
// Test 1: JSON round trip, then continue
// ============================================================================

#[test]
fn json_save_continues_in_lock_step() {
    let mut original = crawling_line();
    original.run(Some(5)).unwrap();

    let json = original.save().to_json().unwrap();
    let value: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(value["latest_round"], 5);
    assert_eq!(value["particles"].as_array().unwrap().len(), 4);

    let save = SaveData::from_json(&json).unwrap();
    let mut restored = Engine::load(save, &registry(), SimConfig::default()).unwrap();
    assert_eq!(restored.latest_round(), 5);
    assert_eq!(restored.state_hash(), original.state_hash());

    assert_lock_step(&mut original, &mut restored, 6);

    let first = original.particle_ids()[0];
    let restored_first = restored.particle_ids()[0];
    assert_eq!(
        original.particle(first).unwrap().attribute("moves"),
        Some(&AttributeValue::Int(11))
    );
    assert_eq!(
        restored.particle(restored_first).unwrap().attribute("moves"),
        Some(&AttributeValue::Int(11))
    );
}

// ============================================================================
// Test 2: Binary snapshot with header
// ============================================================================

#[test]
fn binary_snapshot_keeps_the_whole_history() {
    let mut original = crawling_line();
    original.run(Some(4)).unwrap();

    let bytes = original.serialize().unwrap();
    assert_eq!(read_snapshot_header(&bytes).unwrap().round, 4);

    let mut restored = Engine::deserialize(&bytes, &registry(), SimConfig::default()).unwrap();

    // Every past round is still there.
    for round in 0..=4 {
        original.set_marker(round).unwrap();
        restored.set_marker(round).unwrap();
        assert_eq!(original.state_hash(), restored.state_hash());
    }
    original.continue_tracking();
    restored.continue_tracking();
    assert_lock_step(&mut original, &mut restored, 4);
}

// ============================================================================
// Test 3: Loading needs every behavior
// ============================================================================

#[test]
fn load_without_behavior_fails() {
    let original = crawling_line();
    let mut partial = BehaviorRegistry::new();
    partial.register("idle", || Box::new(IdleBehavior)).unwrap();

    let err = Engine::load(original.save(), &partial, SimConfig::default()).unwrap_err();
    assert!(matches!(err, DeserializeError::Registry(_)));
}

// ============================================================================
// Test 4: Saved pin size wins over the configured one
// ============================================================================

#[test]
fn saved_pin_size_overrides_config() {
    let config = SimConfig {
        pins_per_edge: 3,
        ..Default::default()
    };
    let mut original = Engine::new(config).unwrap();
    contracted_line(&mut original, GridPos::ZERO, Direction::E, 2, || Box::new(Crawler));
    original.step().unwrap();

    let restored = Engine::load(original.save(), &registry(), SimConfig::default()).unwrap();
    assert_eq!(restored.config().pins_per_edge, 3);
    let id = restored.particle_ids()[0];
    assert_eq!(
        restored.particle(id).unwrap().pin_configuration().pins_per_edge(),
        3
    );
}

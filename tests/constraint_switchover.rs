// Constraint updates during flight: speed caps bite immediately through the
// reference pipeline, higher derivatives wait for the plant to settle.

use std::sync::Arc;

use rotortrack::tracker::now_secs;
use rotortrack::{
    DynamicsConstraints, EstimatorKind, IdentityTransformer, MpcTracker, Reference, Tracker,
    TrackerConfig, VehicleState,
};

fn envelope(horizontal_speed: f64) -> DynamicsConstraints {
    DynamicsConstraints {
        horizontal_speed,
        horizontal_acceleration: 2.5,
        horizontal_jerk: 20.0,
        horizontal_snap: 20.0,
        vertical_ascending_speed: 2.0,
        vertical_ascending_acceleration: 2.0,
        vertical_ascending_jerk: 20.0,
        vertical_ascending_snap: 20.0,
        vertical_descending_speed: 1.5,
        vertical_descending_acceleration: 2.0,
        vertical_descending_jerk: 20.0,
        vertical_descending_snap: 20.0,
        heading_speed: 1.0,
        heading_acceleration: 2.0,
        heading_jerk: 10.0,
        heading_snap: 10.0,
    }
}

fn state_at(x: f64, y: f64, z: f64) -> VehicleState {
    VehicleState {
        stamp: now_secs(),
        frame_id: "world".to_string(),
        position: [x, y, z],
        heading: 0.0,
        velocity: [0.0; 3],
        angular_velocity: [0.0; 3],
        estimator_horizontal: EstimatorKind::Gps,
    }
}

fn step(tracker: &MpcTracker, state: &mut VehicleState) {
    tracker.mpc_tick();
    if let Some(command) = tracker.update(state) {
        state.position = command.position;
        state.velocity = command.velocity;
        state.heading = command.heading;
        state.angular_velocity[2] = command.heading_rate;
    }
}

#[tokio::test]
async fn test_speed_cap_applies_immediately() {
    let mut state = state_at(0.0, 0.0, 5.0);

    let tracker = MpcTracker::new(TrackerConfig::default(), Arc::new(IdentityTransformer)).unwrap();
    tracker.set_constraints(&envelope(4.0)).await;
    tracker.update(&state);
    assert!(tracker.activate(None).await.success);

    // long cruise: far enough that the reference ramps across the whole
    // horizon and braking never engages
    tracker
        .set_reference(&Reference { position: [100.0, 0.0, 5.0], heading: 0.0, use_heading: false })
        .await;

    for _ in 0..500 {
        step(&tracker, &mut state);
    }
    assert!(state.velocity[0] > 2.0, "vx = {} (should be cruising)", state.velocity[0]);

    // tighten the speed: the reference saturation slows the vehicle down
    tracker.set_constraints(&envelope(1.0)).await;

    for _ in 0..600 {
        step(&tracker, &mut state);
    }
    assert!(
        state.velocity[0] < 1.3,
        "vx = {} (should respect the tightened speed cap)",
        state.velocity[0]
    );

    // and it keeps making progress under the new cap
    let x_before = state.position[0];
    for _ in 0..200 {
        step(&tracker, &mut state);
    }
    assert!(state.position[0] > x_before + 0.5);
}

#[tokio::test]
async fn test_activation_requires_constraints_and_state() {
    let tracker = MpcTracker::new(TrackerConfig::default(), Arc::new(IdentityTransformer)).unwrap();

    // neither constraints nor state: constraints are checked first
    let reply = tracker.activate(None).await;
    assert!(!reply.success);
    assert!(reply.message.contains("constraints"), "message: {}", reply.message);

    // constraints alone are not enough
    tracker.set_constraints(&envelope(4.0)).await;
    let reply = tracker.activate(None).await;
    assert!(!reply.success);
    assert!(reply.message.contains("state"), "message: {}", reply.message);

    // with both, activation succeeds
    tracker.update(&state_at(0.0, 0.0, 2.0));
    let reply = tracker.activate(None).await;
    assert!(reply.success, "{}", reply.message);
    assert!(tracker.status().active);
}

#[tokio::test]
async fn test_activation_seeds_from_last_command() {
    let tracker = MpcTracker::new(TrackerConfig::default(), Arc::new(IdentityTransformer)).unwrap();
    tracker.set_constraints(&envelope(4.0)).await;
    tracker.update(&state_at(0.0, 0.0, 2.0));

    // the previous tracker was commanding a slightly different position
    let last = rotortrack::PositionCommand {
        position: [0.3, -0.2, 2.1],
        heading: 0.1,
        use_position_horizontal: true,
        use_position_vertical: true,
        use_heading: true,
        ..rotortrack::PositionCommand::default()
    };

    assert!(tracker.activate(Some(&last)).await.success);

    // the first commands continue from the handed-over position, not from
    // the estimate
    let mut state = state_at(0.0, 0.0, 2.0);
    tracker.mpc_tick();
    let command = tracker.update(&state).unwrap();
    assert!((command.position[0] - 0.3).abs() < 0.05, "x = {}", command.position[0]);
    assert!((command.position[1] + 0.2).abs() < 0.05);
    assert!((command.heading - 0.1).abs() < 0.05);

    // and the hold keeps it there
    for _ in 0..100 {
        step(&tracker, &mut state);
    }
    assert!((state.position[0] - 0.3).abs() < 0.05);
}

#[tokio::test]
async fn test_deactivate_and_reactivate() {
    let mut state = state_at(1.0, 1.0, 3.0);

    let tracker = MpcTracker::new(TrackerConfig::default(), Arc::new(IdentityTransformer)).unwrap();
    tracker.set_constraints(&envelope(4.0)).await;
    tracker.update(&state);
    assert!(tracker.activate(None).await.success);

    for _ in 0..50 {
        step(&tracker, &mut state);
    }

    tracker.deactivate().await;
    assert!(!tracker.status().active);
    assert!(tracker.update(&state).is_none());

    // reactivation reinitializes and works again
    assert!(tracker.activate(None).await.success);
    for _ in 0..50 {
        step(&tracker, &mut state);
    }
    assert!((state.position[0] - 1.0).abs() < 0.05);
}

#[tokio::test]
async fn test_enable_callbacks_is_reported() {
    let tracker = MpcTracker::new(TrackerConfig::default(), Arc::new(IdentityTransformer)).unwrap();

    let reply = tracker.enable_callbacks(false).await;
    assert!(reply.success);
    assert!(reply.message.contains("disabled"));

    let reply = tracker.enable_callbacks(false).await;
    assert!(reply.success);
    assert!(reply.message.contains("already"));

    let reply = tracker.enable_callbacks(true).await;
    assert!(reply.message.contains("enabled"));
}

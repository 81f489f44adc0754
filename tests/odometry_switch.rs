// Switching the odometry source mid-flight: stored references and the plant
// state are rewritten into the new frame without a step in the command.

use std::f64::consts::FRAC_PI_2;
use std::sync::Arc;

use rotortrack::tracker::now_secs;
use rotortrack::{
    DynamicsConstraints, EstimatorKind, IdentityTransformer, MpcTracker, Reference, Tracker,
    TrackerConfig, VehicleState,
};

fn test_constraints() -> DynamicsConstraints {
    DynamicsConstraints {
        horizontal_speed: 4.0,
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

fn state_at(x: f64, y: f64, z: f64, heading: f64) -> VehicleState {
    VehicleState {
        stamp: now_secs(),
        frame_id: "f1".to_string(),
        position: [x, y, z],
        heading,
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
async fn test_frame_switch_preserves_the_goal() {
    let mut state = state_at(10.0, 0.0, 5.0, 0.0);

    let tracker = MpcTracker::new(TrackerConfig::default(), Arc::new(IdentityTransformer)).unwrap();
    tracker.set_constraints(&test_constraints()).await;
    tracker.update(&state);
    assert!(tracker.activate(None).await.success);

    // hold the setpoint (10, 0, 5, 0) and converge onto it
    tracker
        .set_reference(&Reference { position: [10.0, 0.0, 5.0], heading: 0.0, use_heading: true })
        .await;
    for _ in 0..500 {
        step(&tracker, &mut state);
    }
    assert!((state.position[0] - 10.0).abs() < 0.05);
    assert!(state.velocity.iter().all(|v| v.abs() < 0.05));

    // the estimator jumps to frame f2: translated and rotated by 90 deg
    let old = state.clone();
    let new_state = VehicleState {
        stamp: now_secs(),
        frame_id: "f2".to_string(),
        position: [1.0, 9.0, 5.0],
        heading: FRAC_PI_2,
        velocity: [0.0; 3],
        angular_velocity: [0.0; 3],
        estimator_horizontal: EstimatorKind::Gps,
    };

    let reply = tracker.switch_odometry_source(&new_state).await;
    assert!(reply.success, "{}", reply.message);

    // expected setpoint: rotate around the old position by the heading
    // delta, then shift to the new position
    let dheading = new_state.heading - old.heading;
    let (sin, cos) = dheading.sin_cos();
    let rel = (10.0 - old.position[0], 0.0 - old.position[1]);
    let expected_x = new_state.position[0] + cos * rel.0 - sin * rel.1;
    let expected_y = new_state.position[1] + sin * rel.0 + cos * rel.1;
    // the stored reference heading was exactly 0.0 and is shifted by the
    // heading delta
    let expected_heading = dheading;

    let mut diagnostics_rx = tracker.subscribe_diagnostics();
    tracker.diagnostics_tick();
    let diagnostics = diagnostics_rx.recv().await.unwrap();

    assert!((diagnostics.setpoint.x - expected_x).abs() < 1e-6);
    assert!((diagnostics.setpoint.y - expected_y).abs() < 1e-6);
    assert!((diagnostics.setpoint.z - 5.0).abs() < 1e-6);
    assert!((diagnostics.setpoint.heading - expected_heading).abs() < 1e-6);

    // the command stream continues in the new frame without a jump: the
    // first updates pass the estimate through, then the MPC takes over
    let mut new_state = new_state;
    let command = tracker.update(&new_state).unwrap();
    assert!((command.position[0] - 1.0).abs() < 0.1);
    assert!((command.position[1] - 9.0).abs() < 0.1);

    for _ in 0..200 {
        step(&tracker, &mut new_state);
    }
    assert!((new_state.position[0] - expected_x).abs() < 0.2);
    assert!((new_state.position[1] - expected_y).abs() < 0.2);
    assert!((new_state.position[2] - 5.0).abs() < 0.2);
}

#[tokio::test]
async fn test_frame_switch_rewrites_a_loaded_trajectory() {
    let mut state = state_at(0.0, 0.0, 2.0, 0.0);

    let tracker = MpcTracker::new(TrackerConfig::default(), Arc::new(IdentityTransformer)).unwrap();
    tracker.set_constraints(&test_constraints()).await;
    tracker.update(&state);
    assert!(tracker.activate(None).await.success);

    let msg = rotortrack::TrajectoryReference {
        header_stamp: 0.0,
        frame_id: "f1".to_string(),
        dt: 0.2,
        fly_now: false,
        looping: false,
        use_heading: false,
        points: (0..50)
            .map(|i| rotortrack::ReferencePoint {
                x: 0.2 * i as f64,
                y: 0.0,
                z: 2.0,
                heading: 0.0,
            })
            .collect(),
    };
    assert!(tracker.set_trajectory_reference(&msg).await.success);

    for _ in 0..20 {
        step(&tracker, &mut state);
    }

    // pure translation by (5, -2, 1), no rotation
    let old = state.clone();
    let new_state = VehicleState {
        stamp: now_secs(),
        frame_id: "f2".to_string(),
        position: [old.position[0] + 5.0, old.position[1] - 2.0, old.position[2] + 1.0],
        heading: old.heading,
        velocity: old.velocity,
        angular_velocity: old.angular_velocity,
        estimator_horizontal: EstimatorKind::Gps,
    };
    assert!(tracker.switch_odometry_source(&new_state).await.success);

    // start tracking: the first trajectory point moved with the frame
    let mut new_state = new_state;
    assert!(tracker.start_trajectory_tracking().await.success);
    for i in 1..=200 {
        step(&tracker, &mut new_state);
        if i % 20 == 0 {
            tracker.trajectory_tick();
        }
    }

    let status = tracker.status();
    assert!(status.tracking_trajectory);
    let point = status.trajectory_reference.unwrap();
    // sample i of the line was (0.2*i, 0, 2) in f1
    let expected_x = 0.2 * status.trajectory_idx as f64 + 5.0;
    assert!((point.x - expected_x).abs() < 1e-6, "x = {} vs {}", point.x, expected_x);
    assert!((point.y + 2.0).abs() < 1e-6);
    assert!((point.z - 3.0).abs() < 1e-6);
}

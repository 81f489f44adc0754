// Two-vehicle mutual avoidance: the peer with the larger priority number
// yields, climbs above the conflict, and slows down.

use std::sync::Arc;

use rotortrack::tracker::now_secs;
use rotortrack::{
    DynamicsConstraints, EstimatorKind, FuturePoint, FutureTrajectory, IdentityTransformer,
    MpcTracker, Reference, Tracker, TrackerConfig, VehicleState,
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

async fn activated_tracker(name: &str, state: &VehicleState) -> MpcTracker {
    let mut config = TrackerConfig::default();
    config.uav_name = name.to_string();
    config.avoidance.peer_names = vec!["uav1".to_string(), "uav2".to_string()];

    let tracker = MpcTracker::new(config, Arc::new(IdentityTransformer)).unwrap();
    tracker.set_constraints(&test_constraints()).await;
    tracker.update(state);
    let reply = tracker.activate(None).await;
    assert!(reply.success, "{}", reply.message);
    tracker
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
async fn test_lower_priority_vehicle_climbs() {
    // head-on approach at the same altitude; uav1 has the right of way
    let mut state_a = state_at(0.0, 0.0, 10.0);
    let mut state_b = state_at(20.0, 0.0, 10.0);

    let tracker_a = activated_tracker("uav1", &state_a).await;
    let tracker_b = activated_tracker("uav2", &state_b).await;

    let mut future_a_rx = tracker_a.subscribe_predicted_future();
    let mut future_b_rx = tracker_b.subscribe_predicted_future();
    let mut diag_a_rx = tracker_a.subscribe_diagnostics();
    let mut diag_b_rx = tracker_b.subscribe_diagnostics();

    assert!(
        tracker_a
            .set_reference(&Reference { position: [30.0, 0.0, 10.0], heading: 0.0, use_heading: false })
            .await
            .success
    );
    assert!(
        tracker_b
            .set_reference(&Reference { position: [-10.0, 0.0, 10.0], heading: 0.0, use_heading: false })
            .await
            .success
    );

    let mut max_z_a: f64 = 10.0;
    let mut max_z_b: f64 = 10.0;
    let mut saw_avoiding_a = false;
    let mut saw_avoiding_b = false;

    for i in 1..=900 {
        step(&tracker_a, &mut state_a);
        step(&tracker_b, &mut state_b);

        max_z_a = max_z_a.max(state_a.position[2]);
        max_z_b = max_z_b.max(state_b.position[2]);

        // exchange predicted futures, as the publish timers would
        if i % 10 == 0 {
            tracker_a.avoidance_tick();
            tracker_b.avoidance_tick();

            if let Ok(future_a) = future_a_rx.try_recv() {
                assert_eq!(future_a.priority, 1);
                assert!(future_a.collision_avoidance);
                tracker_b.peer_trajectory(future_a);
            }
            if let Ok(future_b) = future_b_rx.try_recv() {
                assert_eq!(future_b.priority, 2);
                tracker_a.peer_trajectory(future_b);
            }
        }

        if i % 50 == 0 {
            tracker_a.diagnostics_tick();
            tracker_b.diagnostics_tick();
            while let Ok(d) = diag_a_rx.try_recv() {
                saw_avoiding_a |= d.avoiding_collision;
            }
            while let Ok(d) = diag_b_rx.try_recv() {
                saw_avoiding_b |= d.avoiding_collision;
            }
        }
    }

    // uav2 (larger number) climbed above the conflict at some point,
    // uav1 never left its altitude
    assert!(max_z_b > 11.0, "uav2 peak z = {max_z_b} (should have climbed)");
    assert!(max_z_a < 10.5, "uav1 peak z = {max_z_a} (should hold altitude)");
    assert!(saw_avoiding_b, "uav2 never reported an active avoidance");
    assert!(!saw_avoiding_a, "uav1 must not avoid");
}

#[tokio::test]
async fn test_avoidance_disabled_vehicle_is_avoided() {
    let mut state_a = state_at(0.0, 0.0, 10.0);
    let mut state_b = state_at(20.0, 0.0, 10.0);

    // uav1 would normally have the right of way, but turns avoidance off
    let tracker_a = activated_tracker("uav1", &state_a).await;
    let tracker_b = activated_tracker("uav2", &state_b).await;
    tracker_a.toggle_collision_avoidance(false);

    let mut future_a_rx = tracker_a.subscribe_predicted_future();
    let mut future_b_rx = tracker_b.subscribe_predicted_future();

    tracker_a
        .set_reference(&Reference { position: [30.0, 0.0, 10.0], heading: 0.0, use_heading: false })
        .await;
    tracker_b
        .set_reference(&Reference { position: [-10.0, 0.0, 10.0], heading: 0.0, use_heading: false })
        .await;

    let mut max_z_b: f64 = 10.0;

    for i in 1..=900 {
        step(&tracker_a, &mut state_a);
        step(&tracker_b, &mut state_b);
        max_z_b = max_z_b.max(state_b.position[2]);

        if i % 10 == 0 {
            tracker_a.avoidance_tick();
            tracker_b.avoidance_tick();
            if let Ok(future_a) = future_a_rx.try_recv() {
                assert!(!future_a.collision_avoidance);
                tracker_b.peer_trajectory(future_a);
            }
            if let Ok(future_b) = future_b_rx.try_recv() {
                tracker_a.peer_trajectory(future_b);
            }
        }
    }

    // uav2 climbs even though its priority number is larger, because uav1
    // is not participating
    assert!(max_z_b > 11.0, "uav2 peak z = {max_z_b}");
}

#[tokio::test]
async fn test_no_avoidance_without_global_estimator() {
    let mut state_b = state_at(20.0, 0.0, 10.0);
    state_b.estimator_horizontal = EstimatorKind::Other;

    let tracker_b = activated_tracker("uav2", &state_b).await;

    // a conflicting peer parked straight on top of us
    let peer = FutureTrajectory {
        uav_name: "uav1".to_string(),
        priority: 1,
        collision_avoidance: true,
        stamp: now_secs(),
        points: (0..40).map(|_| FuturePoint { x: 20.0, y: 0.0, z: 10.0 }).collect(),
    };

    for i in 1..=300 {
        step(&tracker_b, &mut state_b);
        if i % 10 == 0 {
            tracker_b.peer_trajectory(peer.clone());
        }
    }

    // without GPS/RTK the tracker must not react
    assert!((state_b.position[2] - 10.0).abs() < 0.1, "z = {}", state_b.position[2]);
}

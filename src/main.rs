// src/main.rs - demo host: runs the MPC tracker against a synthetic estimator

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use rand::Rng;
use tokio::signal;

use rotortrack::tracker::now_secs;
use rotortrack::{
    DynamicsConstraints, EstimatorKind, IdentityTransformer, MpcTracker, Reference, Tracker,
    TrackerConfig, VehicleState,
};

#[derive(Parser, Debug)]
#[command(name = "rotortrack-host", about = "MPC trajectory tracker demo host")]
struct Args {
    /// Path to the tracker configuration file
    #[arg(default_value = "tracker.toml")]
    config: String,
}

fn demo_constraints() -> DynamicsConstraints {
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

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args = Args::parse();

    tracing::info!("Starting rotortrack host");

    let config = match TrackerConfig::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!("could not load '{}' ({e}), using the default configuration", args.config);
            TrackerConfig::default()
        }
    };

    tracing::info!("UAV: {}", config.uav_name);
    tracing::info!("MPC rate: {} Hz, horizon: {}", config.mpc.rate, config.mpc.horizon_len);

    let dt1 = config.dt1();
    let tracker = Arc::new(MpcTracker::new(config, Arc::new(IdentityTransformer))?);
    tracker.start();

    // log diagnostics as they come
    {
        let mut diagnostics_rx = tracker.subscribe_diagnostics();
        tokio::spawn(async move {
            while let Ok(d) = diagnostics_rx.recv().await {
                tracing::debug!(
                    active = d.active,
                    avoiding = d.avoiding_collision,
                    setpoint_x = d.setpoint.x,
                    setpoint_y = d.setpoint.y,
                    setpoint_z = d.setpoint.z,
                    "diagnostics"
                );
            }
        });
    }

    // synthetic estimator: the vehicle follows the command perfectly, plus
    // a little measurement noise
    let estimator_tracker = tracker.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs_f64(dt1));
        let mut state = VehicleState {
            stamp: now_secs(),
            frame_id: "world".to_string(),
            position: [0.0, 0.0, 0.0],
            heading: 0.0,
            velocity: [0.0; 3],
            angular_velocity: [0.0; 3],
            estimator_horizontal: EstimatorKind::Gps,
        };
        loop {
            interval.tick().await;
            state.stamp = now_secs();
            let mut rng = rand::rng();

            if let Some(command) = estimator_tracker.update(&state) {
                for i in 0..3 {
                    state.position[i] = command.position[i] + rng.random_range(-0.005..0.005);
                    state.velocity[i] = command.velocity[i];
                }
                state.heading = command.heading;
                state.angular_velocity[2] = command.heading_rate;
            }
        }
    });

    // small demo flight: constraints, activation, one setpoint
    let reply = tracker.set_constraints(&demo_constraints()).await;
    tracing::info!("set_constraints: {}", reply.message);

    // give the estimator loop a moment to deliver the first state
    tokio::time::sleep(Duration::from_millis(100)).await;

    let reply = tracker.activate(None).await;
    tracing::info!("activate: {}", reply.message);

    let reply = tracker
        .set_reference(&Reference {
            position: [5.0, 3.0, 4.0],
            heading: std::f64::consts::FRAC_PI_2,
            use_heading: true,
        })
        .await;
    tracing::info!("set_reference: {}", reply.message);

    tracing::info!("Tracker is running. Press Ctrl+C to shut down...");

    match signal::ctrl_c().await {
        Ok(()) => tracing::info!("shutdown signal received"),
        Err(e) => tracing::warn!("failed to wait for the shutdown signal: {e}"),
    }

    tracker.deactivate().await;
    tracker.shutdown();

    Ok(())
}

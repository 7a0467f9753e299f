//! Periodic device polling.
//!
//! Each tick gathers a [`DeviceSnapshot`] with every refresh running
//! concurrently and failing on its own, then hands it to
//! [`CameraSession::fold`] once.

use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use chrono::{DateTime, Utc};
use shared::{domain::Axis, protocol::TemperatureReadings};
use tokio::{
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tracing::{debug, info};

use crate::{
    error::{GatewayError, ServoError},
    servo::{AngleReading, ServoCoordinator},
    session::CameraSession,
    stream::{StreamController, StreamObservation},
    system::SystemClient,
};

/// Result of one poll tick. Every field holds its own outcome.
#[derive(Debug)]
pub struct DeviceSnapshot {
    pub observed_at: DateTime<Utc>,
    pub hostname: Result<String, GatewayError>,
    pub temperatures: Result<TemperatureReadings, GatewayError>,
    pub camera_on: Result<bool, GatewayError>,
    pub pan: Result<AngleReading, ServoError>,
    pub tilt: Result<AngleReading, ServoError>,
    pub stream: Result<StreamObservation, GatewayError>,
}

pub async fn collect_snapshot(
    system: &SystemClient,
    servo: &ServoCoordinator,
    stream: &StreamController,
) -> DeviceSnapshot {
    let (hostname, temperatures, camera_on, pan, tilt, stream) = tokio::join!(
        system.hostname(),
        system.temperatures(),
        system.camera_power(),
        servo.read_angle(Axis::Pan),
        servo.read_angle(Axis::Tilt),
        stream.poll_status(),
    );
    DeviceSnapshot {
        observed_at: Utc::now(),
        hostname,
        temperatures,
        camera_on,
        pan,
        tilt,
        stream,
    }
}

/// Polls `session` every `period` until the session is dropped or the
/// returned handle is aborted.
pub fn spawn_reconciliation(session: Weak<CameraSession>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("reconcile: polling every {period:?}");
        loop {
            ticker.tick().await;
            let Some(session) = session.upgrade() else {
                break;
            };
            poll_tick(&session).await;
        }
        debug!("reconcile: session dropped, polling stopped");
    })
}

async fn poll_tick(session: &Arc<CameraSession>) {
    let snapshot = session.collect_snapshot().await;
    session.fold(snapshot).await;
}

#[cfg(test)]
#[path = "tests/reconcile_tests.rs"]
mod tests;

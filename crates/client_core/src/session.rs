use std::{sync::Arc, time::Duration};

use player_integration::{MissingPlayer, PlayerBackend};
use shared::domain::{Axis, StreamProtocol};
use tokio::{
    sync::{broadcast, Mutex, RwLock},
    task::JoinHandle,
};
use tracing::{info, warn};

use crate::{
    error::{GatewayError, SystemError},
    gateway::DeviceGateway,
    limits::LimitAdjustment,
    reconcile::{self, DeviceSnapshot},
    servo::{ServoCoordinator, ServoTiming},
    stream::{StreamController, StreamTiming},
    system::{SystemClient, Telemetry},
    ClientEvent,
};

#[derive(Debug, Clone, PartialEq)]
pub struct SessionOptions {
    pub servo: ServoTiming,
    pub stream: StreamTiming,
    pub poll_interval: Duration,
    pub limit_adjustment: LimitAdjustment,
    /// Readings at or above this many degrees Celsius raise `TemperatureHigh`.
    pub temperature_warning: f64,
    pub protocol: StreamProtocol,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            servo: ServoTiming::default(),
            stream: StreamTiming::default(),
            poll_interval: Duration::from_millis(1000),
            limit_adjustment: LimitAdjustment::default(),
            temperature_warning: 80.0,
            protocol: StreamProtocol::Hls,
        }
    }
}

/// One control session against one device.
pub struct CameraSession {
    servo: Arc<ServoCoordinator>,
    stream: Arc<StreamController>,
    system: SystemClient,
    telemetry: RwLock<Telemetry>,
    temperature_warning: f64,
    poll_interval: Duration,
    reconciliation: Mutex<Option<JoinHandle<()>>>,
    events: broadcast::Sender<ClientEvent>,
}

impl CameraSession {
    pub fn new(gateway: Arc<dyn DeviceGateway>, options: SessionOptions) -> Arc<Self> {
        Self::new_with_player(gateway, Arc::new(MissingPlayer), options)
    }

    pub fn new_with_player(
        gateway: Arc<dyn DeviceGateway>,
        player: Arc<dyn PlayerBackend>,
        options: SessionOptions,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        let servo = ServoCoordinator::new(
            Arc::clone(&gateway),
            options.servo,
            options.limit_adjustment,
            events.clone(),
        );
        let stream = StreamController::new(
            Arc::clone(&gateway),
            player,
            options.protocol,
            options.stream,
            events.clone(),
        );
        Arc::new(Self {
            servo,
            stream,
            system: SystemClient::new(gateway),
            telemetry: RwLock::new(Telemetry::default()),
            temperature_warning: options.temperature_warning,
            poll_interval: options.poll_interval,
            reconciliation: Mutex::new(None),
            events,
        })
    }

    pub fn servo(&self) -> &Arc<ServoCoordinator> {
        &self.servo
    }

    pub fn stream(&self) -> &Arc<StreamController> {
        &self.stream
    }

    pub fn system(&self) -> &SystemClient {
        &self.system
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub async fn telemetry(&self) -> Telemetry {
        self.telemetry.read().await.clone()
    }

    /// Replaces the placeholder limits, angle mapping and angles with the
    /// device's values. Failures are reported and leave the placeholders in
    /// place.
    pub async fn initialize(&self) {
        match self.system.init_config().await {
            Ok(config) => {
                for (axis, mapping) in config.servo_map.unwrap_or_default() {
                    self.servo.set_mapping(axis, mapping).await;
                }
            }
            Err(err) => warn!("session: could not load servo mapping: {err}"),
        }
        for axis in Axis::ALL {
            if let Err(err) = self.servo.load_limits(axis).await {
                warn!("session: could not load {axis} limits: {err}");
            }
        }
        self.poll_once().await;
        info!("session: initialized");
    }

    pub async fn collect_snapshot(&self) -> DeviceSnapshot {
        reconcile::collect_snapshot(&self.system, &self.servo, &self.stream).await
    }

    pub async fn poll_once(&self) {
        let snapshot = self.collect_snapshot().await;
        self.fold(snapshot).await;
    }

    /// Merges one poll result into local state; device values win.
    pub async fn fold(&self, snapshot: DeviceSnapshot) {
        for (axis, reading) in [(Axis::Pan, snapshot.pan), (Axis::Tilt, snapshot.tilt)] {
            match reading {
                Ok(reading) => {
                    self.servo.apply_reading(reading).await;
                }
                Err(err) => {
                    warn!("session: {axis} refresh failed");
                    self.servo.report(&err);
                }
            }
        }

        match snapshot.stream {
            Ok(observation) => {
                self.stream.fold_observation(observation).await;
            }
            Err(err) => self.report_transport("stream status", &err),
        }

        let (telemetry, power_changed, overheated) = {
            let mut telemetry = self.telemetry.write().await;
            let mut observed = false;
            match snapshot.hostname {
                Ok(hostname) => {
                    telemetry.hostname = Some(hostname);
                    observed = true;
                }
                Err(err) => self.report_transport("hostname", &err),
            }

            let mut overheated = Vec::new();
            match snapshot.temperatures {
                Ok(readings) => {
                    for (sensor, celsius) in &readings {
                        let was_hot = telemetry
                            .temperatures
                            .get(sensor)
                            .is_some_and(|previous| *previous >= self.temperature_warning);
                        if *celsius >= self.temperature_warning && !was_hot {
                            overheated.push((sensor.clone(), *celsius));
                        }
                    }
                    telemetry.temperatures = readings;
                    observed = true;
                }
                Err(err) => self.report_transport("temperature", &err),
            }

            let mut power_changed = None;
            match snapshot.camera_on {
                Ok(on) => {
                    if telemetry.camera_on != Some(on) {
                        power_changed = Some(on);
                    }
                    telemetry.camera_on = Some(on);
                    observed = true;
                }
                Err(err) => self.report_transport("camera power", &err),
            }

            if observed {
                telemetry.observed_at = Some(snapshot.observed_at);
            }
            (telemetry.clone(), power_changed, overheated)
        };

        for (sensor, celsius) in overheated {
            warn!("session: {sensor} at {celsius:.1}C");
            let _ = self
                .events
                .send(ClientEvent::TemperatureHigh { sensor, celsius });
        }
        if let Some(on) = power_changed {
            let _ = self.events.send(ClientEvent::CameraPowerChanged(on));
        }
        let _ = self.events.send(ClientEvent::TelemetryUpdated(telemetry));
    }

    pub async fn start_reconciliation(self: &Arc<Self>) {
        let mut task = self.reconciliation.lock().await;
        if task.as_ref().is_some_and(|task| !task.is_finished()) {
            warn!("session: reconciliation already running");
            return;
        }
        *task = Some(reconcile::spawn_reconciliation(
            Arc::downgrade(self),
            self.poll_interval,
        ));
    }

    pub async fn stop_reconciliation(&self) {
        if let Some(task) = self.reconciliation.lock().await.take() {
            task.abort();
            info!("session: reconciliation stopped");
        }
    }

    /// Switches camera power. Turning the camera off stops an active stream
    /// first.
    pub async fn set_camera_power(&self, on: bool) -> Result<bool, SystemError> {
        if !on && self.stream.is_active().await {
            info!("session: stopping stream before camera power-off");
            if let Err(err) = self.stream.stop().await {
                warn!("session: stream stop before power-off failed: {err}");
            }
        }
        let confirmed = self.system.set_camera_power(on).await.map_err(|err| {
            let _ = self
                .events
                .send(ClientEvent::Error(format!("camera power: {err}")));
            err
        })?;
        let changed = {
            let mut telemetry = self.telemetry.write().await;
            let changed = telemetry.camera_on != Some(confirmed);
            telemetry.camera_on = Some(confirmed);
            changed
        };
        if changed {
            let _ = self.events.send(ClientEvent::CameraPowerChanged(confirmed));
        }
        Ok(confirmed)
    }

    /// Releases every timer, task and player owned by the session.
    pub async fn shutdown(&self) {
        self.stop_reconciliation().await;
        self.servo.shutdown().await;
        self.stream.shutdown().await;
        info!("session: shut down");
    }

    fn report_transport(&self, operation: &str, err: &GatewayError) {
        warn!("session: {operation} refresh failed: {err}");
        let _ = self.events.send(ClientEvent::TransportFailure {
            operation: operation.to_string(),
            message: err.to_string(),
        });
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;

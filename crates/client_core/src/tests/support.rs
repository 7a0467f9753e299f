use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use serde_json::{json, Value};
use shared::{
    domain::{Axis, StreamProtocol},
    protocol::ServoMapping,
};
use tokio::time::{sleep, Instant};

use crate::{
    error::GatewayError,
    gateway::{DeviceGateway, DeviceRequest, Endpoint, Method},
};

pub(crate) const HLS_URL: &str = "http://camera.local:8080/hls/stream.m3u8";
pub(crate) const RTSP_URL: &str = "rtsp://camera.local:8554/stream";
/// Servo positions the firmware allows on both axes: -90..90 through the
/// factory mapping.
const RAW_LIMITS: (f64, f64) = (30.0, 210.0);

#[derive(Debug, Clone)]
pub(crate) struct RecordedCall {
    pub request: DeviceRequest,
    pub at: Instant,
}

#[derive(Default)]
struct DeviceModel {
    angles: HashMap<Axis, f64>,
    mappings: HashMap<Axis, ServoMapping>,
    streams: HashMap<StreamProtocol, bool>,
    camera_on: bool,
    hostname: String,
}

/// In-memory device. Answers like the real firmware unless a reply has been
/// queued for an endpoint, in which case queued replies are used first.
pub(crate) struct FakeDevice {
    model: Mutex<DeviceModel>,
    scripted: Mutex<HashMap<(Method, Endpoint), VecDeque<Result<Value, GatewayError>>>>,
    calls: Mutex<Vec<RecordedCall>>,
    latency: Duration,
    servo_in_flight: AtomicUsize,
    max_servo_in_flight: AtomicUsize,
}

impl DeviceModel {
    fn mapping(&self, axis: Axis) -> ServoMapping {
        self.mappings.get(&axis).copied().unwrap_or_default()
    }

    fn physical(&self, axis: Axis, angle: f64) -> f64 {
        let mapping = self.mapping(axis);
        mapping.center + mapping.direction * angle * mapping.scale
    }
}

impl FakeDevice {
    pub(crate) fn new() -> Self {
        Self::with_latency(Duration::from_millis(10))
    }

    pub(crate) fn with_latency(latency: Duration) -> Self {
        Self {
            model: Mutex::new(DeviceModel {
                camera_on: true,
                hostname: "ptz-cam".to_string(),
                ..DeviceModel::default()
            }),
            scripted: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            latency,
            servo_in_flight: AtomicUsize::new(0),
            max_servo_in_flight: AtomicUsize::new(0),
        }
    }

    pub(crate) fn push(&self, method: Method, endpoint: Endpoint, reply: Result<Value, GatewayError>) {
        self.scripted
            .lock()
            .expect("script lock")
            .entry((method, endpoint))
            .or_default()
            .push_back(reply);
    }

    pub(crate) fn set_angle(&self, axis: Axis, angle: f64) {
        self.model.lock().expect("model lock").angles.insert(axis, angle);
    }

    pub(crate) fn set_mapping(&self, axis: Axis, mapping: ServoMapping) {
        self.model
            .lock()
            .expect("model lock")
            .mappings
            .insert(axis, mapping);
    }

    pub(crate) fn set_stream(&self, protocol: StreamProtocol, on: bool) {
        self.model
            .lock()
            .expect("model lock")
            .streams
            .insert(protocol, on);
    }

    pub(crate) fn stream_on(&self, protocol: StreamProtocol) -> bool {
        self.model
            .lock()
            .expect("model lock")
            .streams
            .get(&protocol)
            .copied()
            .unwrap_or(false)
    }

    pub(crate) fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().expect("calls lock").clone()
    }

    pub(crate) fn calls_to(&self, method: Method, endpoint: Endpoint) -> Vec<RecordedCall> {
        self.calls()
            .into_iter()
            .filter(|call| call.request.method == method && call.request.endpoint == endpoint)
            .collect()
    }

    pub(crate) fn max_servo_in_flight(&self) -> usize {
        self.max_servo_in_flight.load(Ordering::SeqCst)
    }

    fn answer(&self, request: &DeviceRequest) -> Result<Value, GatewayError> {
        if let Some(reply) = self
            .scripted
            .lock()
            .expect("script lock")
            .get_mut(&(request.method, request.endpoint))
            .and_then(VecDeque::pop_front)
        {
            return reply;
        }

        let body = request.body.clone().unwrap_or(Value::Null);
        let mut model = self.model.lock().expect("model lock");
        match (request.method, request.endpoint) {
            // Echoes the requested angle; the clamped servo position is only
            // in `physical_angle`.
            (Method::Post, Endpoint::Motion(axis)) => {
                let angle = body["angle"].as_f64().unwrap_or_default();
                let physical = model.physical(axis, angle);
                let limited = physical.clamp(RAW_LIMITS.0, RAW_LIMITS.1);
                let status = if limited == physical { "ok" } else { "limited" };
                let reached = model.mapping(axis).to_mapped(limited).unwrap_or(angle);
                model.angles.insert(axis, reached);
                Ok(json!({"status": status, "angle": angle, "physical_angle": limited, "axis": axis.as_str()}))
            }
            (Method::Get, Endpoint::Motion(axis)) => {
                let angle = model.angles.get(&axis).copied().unwrap_or_default();
                let physical = model.physical(axis, angle);
                Ok(json!({"angle": angle, "physical_angle": physical, "axis": axis.as_str()}))
            }
            (Method::Get, Endpoint::MotionLimit(_)) => Ok(json!({
                "min": -90.0,
                "max": 90.0,
                "min_raw": RAW_LIMITS.0,
                "max_raw": RAW_LIMITS.1
            })),
            (Method::Post, Endpoint::MotionLimit(_)) => {
                Ok(json!({"status": "ok", "min": body["min"], "max": body["max"]}))
            }
            (Method::Get, Endpoint::Stream(protocol)) => {
                let on = model.streams.get(&protocol).copied().unwrap_or(false);
                Ok(json!({"on": on}))
            }
            (Method::Post, Endpoint::Stream(protocol)) => {
                let on = body["on"].as_bool().unwrap_or(false);
                model.streams.insert(protocol, on);
                Ok(match (on, protocol) {
                    (true, StreamProtocol::Hls) => json!({"status": "ok", "url": HLS_URL}),
                    (true, StreamProtocol::Rtsp) => json!({"status": "ok", "url": RTSP_URL}),
                    _ => json!({"status": "ok"}),
                })
            }
            (Method::Get, Endpoint::CameraPower) => Ok(json!({"on": model.camera_on})),
            (Method::Post, Endpoint::CameraPower) => {
                let on = body["on"].as_bool().unwrap_or(false);
                if !on {
                    model.streams.clear();
                }
                model.camera_on = on;
                Ok(json!({"status": "ok", "on": on}))
            }
            (Method::Post, Endpoint::SystemPower) => Ok(json!({"status": "ok", "msg": "rebooting"})),
            (Method::Get, Endpoint::Hostname) => Ok(json!({"hostname": model.hostname})),
            (Method::Post, Endpoint::Hostname) => {
                model.hostname = body["hostname"].as_str().unwrap_or_default().to_string();
                Ok(json!({"status": "ok", "hostname": model.hostname}))
            }
            (Method::Get, Endpoint::DeviceIp) => Ok(json!({"ip": "192.168.1.20"})),
            (Method::Get, Endpoint::ClientIp) => Ok(json!({"ip": "192.168.1.50"})),
            (Method::Get, Endpoint::Temperature) => Ok(json!({"cpu_thermal": 48.5})),
            (Method::Get, Endpoint::SystemInit) => Ok(json!({
                "pwr_init": true,
                "pan_init": 0.0,
                "tilt_init": 0.0,
                "servo_map": {
                    "pan": model.mapping(Axis::Pan),
                    "tilt": model.mapping(Axis::Tilt)
                },
                "servo_limits": {
                    "pan": [RAW_LIMITS.0, RAW_LIMITS.1],
                    "tilt": [RAW_LIMITS.0, RAW_LIMITS.1]
                }
            })),
            (Method::Post, Endpoint::SystemInit) => {
                let mut reply = body;
                reply["status"] = json!("ok");
                Ok(reply)
            }
            (method, endpoint) => Err(GatewayError::Status {
                status: 405,
                body: Some(json!({"error": format!("{method:?} {endpoint} not supported")})),
            }),
        }
    }
}

fn is_servo_link(endpoint: Endpoint) -> bool {
    matches!(endpoint, Endpoint::Motion(_) | Endpoint::MotionLimit(_))
}

#[async_trait]
impl DeviceGateway for FakeDevice {
    async fn call(&self, request: DeviceRequest) -> Result<Value, GatewayError> {
        self.calls.lock().expect("calls lock").push(RecordedCall {
            request: request.clone(),
            at: Instant::now(),
        });
        let servo = is_servo_link(request.endpoint);
        if servo {
            let now = self.servo_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_servo_in_flight.fetch_max(now, Ordering::SeqCst);
        }
        sleep(self.latency).await;
        let reply = self.answer(&request);
        if servo {
            self.servo_in_flight.fetch_sub(1, Ordering::SeqCst);
        }
        reply
    }
}

pub(crate) fn drain_events(
    rx: &mut tokio::sync::broadcast::Receiver<crate::ClientEvent>,
) -> Vec<crate::ClientEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum PlayerCall {
    Attach(player_integration::PlaybackSource),
    Detach,
}

/// Player that records what the session asked of it.
pub(crate) struct RecordingPlayer {
    calls: Mutex<Vec<(PlayerCall, Instant)>>,
    current: Mutex<Option<player_integration::PlaybackSource>>,
    fail_attach: bool,
}

impl RecordingPlayer {
    pub(crate) fn new() -> Self {
        Self::build(false)
    }

    pub(crate) fn failing() -> Self {
        Self::build(true)
    }

    fn build(fail_attach: bool) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            current: Mutex::new(None),
            fail_attach,
        }
    }

    pub(crate) fn calls(&self) -> Vec<(PlayerCall, Instant)> {
        self.calls.lock().expect("player lock").clone()
    }

    pub(crate) fn attaches(&self) -> Vec<(player_integration::PlaybackSource, Instant)> {
        self.calls()
            .into_iter()
            .filter_map(|(call, at)| match call {
                PlayerCall::Attach(source) => Some((source, at)),
                PlayerCall::Detach => None,
            })
            .collect()
    }

    pub(crate) fn detached(&self) -> bool {
        self.calls()
            .iter()
            .any(|(call, _)| *call == PlayerCall::Detach)
    }

    pub(crate) fn is_attached(&self) -> bool {
        self.current.lock().expect("player lock").is_some()
    }
}

#[async_trait]
impl player_integration::PlayerBackend for RecordingPlayer {
    async fn attach(&self, source: player_integration::PlaybackSource) -> anyhow::Result<()> {
        self.calls
            .lock()
            .expect("player lock")
            .push((PlayerCall::Attach(source.clone()), Instant::now()));
        if self.fail_attach {
            anyhow::bail!("decoder unavailable");
        }
        *self.current.lock().expect("player lock") = Some(source);
        Ok(())
    }

    async fn detach(&self) -> anyhow::Result<()> {
        self.calls
            .lock()
            .expect("player lock")
            .push((PlayerCall::Detach, Instant::now()));
        *self.current.lock().expect("player lock") = None;
        Ok(())
    }

    async fn current_source(&self) -> Option<player_integration::PlaybackSource> {
        self.current.lock().expect("player lock").clone()
    }

    fn plays(&self, protocol: StreamProtocol) -> bool {
        matches!(protocol, StreamProtocol::Hls | StreamProtocol::Rtsp)
    }
}

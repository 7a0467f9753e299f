use shared::{domain::Axis, error::DeviceError};

pub mod error;
pub mod gateway;
pub mod limits;
pub mod reconcile;
pub mod servo;
pub mod session;
pub mod stream;
pub mod system;

pub use error::{GatewayError, LimitError, ServoError, StreamError, SystemError};
pub use gateway::{DeviceGateway, DeviceRequest, Endpoint, HttpDeviceGateway, Method};
pub use limits::{AxisLimits, LimitAdjustment};
pub use reconcile::DeviceSnapshot;
pub use servo::{AngleReading, AxisState, PendingCommand, ServoCoordinator, ServoTiming};
pub use session::{CameraSession, SessionOptions};
pub use stream::{
    fold_stream, PlayerAction, StreamController, StreamPhase, StreamSession, StreamTiming,
};
pub use system::{SystemClient, Telemetry};

/// Everything the session reports to observers. Errors are absorbed where
/// they happen and surface here.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    AxisUpdated {
        axis: Axis,
        angle: f64,
    },
    LimitsUpdated {
        axis: Axis,
        limits: AxisLimits,
    },
    /// The device moved less far than requested.
    ClampNotice {
        axis: Axis,
        requested: f64,
        /// `None` when the reply carried no position the client can map.
        effective: Option<f64>,
    },
    /// A motion reply named a different (or no) axis. Nothing was applied.
    IntegrityViolation {
        requested: Axis,
        reported: Option<String>,
    },
    DeviceFailure {
        axis: Axis,
        error: DeviceError,
    },
    TransportFailure {
        operation: String,
        message: String,
    },
    StreamStateChanged(StreamSession),
    StreamFailed(String),
    /// The device's stream flag disagreed with local intent and was adopted.
    StreamDrift {
        device_on: bool,
        local_on: bool,
    },
    TelemetryUpdated(Telemetry),
    TemperatureHigh {
        sensor: String,
        celsius: f64,
    },
    CameraPowerChanged(bool),
    Error(String),
}

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;

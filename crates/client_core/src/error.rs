use serde_json::Value;
use shared::{domain::Axis, error::DeviceError};
use thiserror::Error;

use crate::stream::StreamPhase;

#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error("device unreachable: {0}")]
    Transport(String),
    #[error("device answered with HTTP {status}")]
    Status { status: u16, body: Option<Value> },
    #[error("malformed device payload: {0}")]
    Decode(String),
    #[error("request body could not be encoded: {0}")]
    Encode(String),
    #[error("invalid device address: {0}")]
    Address(String),
}

impl GatewayError {
    /// The `error` string a device puts in a non-success body, if any.
    pub fn device_message(&self) -> Option<String> {
        match self {
            GatewayError::Status {
                body: Some(body), ..
            } => ["error", "msg", "message"]
                .iter()
                .find_map(|key| body.get(*key).and_then(Value::as_str))
                .map(ToOwned::to_owned),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum LimitError {
    #[error("limit range must satisfy min < max (got min={min}, max={max})")]
    InvalidRange { min: f64, max: f64 },
}

#[derive(Debug, Clone, Error)]
pub enum ServoError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    Limits(#[from] LimitError),
    #[error("axis integrity violation: requested {requested}, device answered for {reported:?}")]
    IntegrityViolation {
        requested: Axis,
        reported: Option<String>,
    },
    #[error("{axis} servo failure reported by device: {error}")]
    Device { axis: Axis, error: DeviceError },
}

#[derive(Debug, Clone, Error)]
pub enum StreamError {
    #[error("stream session is busy ({0:?})")]
    Busy(StreamPhase),
    #[error("udp streaming needs a target address and none could be discovered")]
    MissingUdpAddress,
    #[error("udp target must look like udp://<ipv4>:<port>, got {0}")]
    InvalidUdpAddress(String),
    #[error("device did not return a playback url for {0} stream")]
    MissingPlaybackUrl(shared::domain::StreamProtocol),
    #[error("device rejected stream command: {0}")]
    Rejected(String),
    #[error(transparent)]
    Gateway(GatewayError),
}

impl From<GatewayError> for StreamError {
    fn from(err: GatewayError) -> Self {
        match err.device_message() {
            Some(message) => StreamError::Rejected(message),
            None => StreamError::Gateway(err),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum SystemError {
    #[error("hostname must not be empty")]
    EmptyHostname,
    #[error("device rejected request: {0}")]
    Rejected(String),
    #[error(transparent)]
    Gateway(GatewayError),
}

impl From<GatewayError> for SystemError {
    fn from(err: GatewayError) -> Self {
        match err.device_message() {
            Some(message) => SystemError::Rejected(message),
            None => SystemError::Gateway(err),
        }
    }
}

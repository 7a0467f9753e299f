use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
    domain::{Axis, MotionStatus, ViewMode},
    error::{DeviceError, DeviceErrorCode},
};

/// Generic `{status, msg}` acknowledgement returned by write endpoints.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Ack {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, alias = "msg", skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Ack {
    pub fn is_error(&self) -> bool {
        self.error.is_some() || self.status.as_deref() == Some("error")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamCommand {
    pub on: bool,
    pub view: ViewMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamCommandReply {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamStatus {
    pub on: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PowerCommand {
    pub on: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowerStatus {
    pub on: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MotionCommand {
    pub angle: f64,
}

/// Reply to both `POST /motion/{axis}` and `GET /motion/{axis}`.
///
/// The axis is kept as the raw string the device sent so a foreign or
/// misspelled axis surfaces as an integrity violation rather than a decode
/// failure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MotionReply {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub axis: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub angle: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub physical_angle: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<MotionStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<DeviceErrorCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl MotionReply {
    pub fn echoes(&self, axis: Axis) -> bool {
        self.axis.as_deref() == Some(axis.as_str())
    }

    /// Device-side failure carried in the reply, if any. An `error` field wins
    /// over any `angle` the device filled in alongside it.
    pub fn device_error(&self) -> Option<DeviceError> {
        if let Some(code) = &self.error {
            return Some(DeviceError::new(
                code.clone(),
                self.message.clone().unwrap_or_default(),
            ));
        }
        if self.status == Some(MotionStatus::Error) {
            return Some(DeviceError::new(
                DeviceErrorCode::Unknown,
                self.message.clone().unwrap_or_default(),
            ));
        }
        None
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LimitCommand {
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LimitReply {
    pub min: f64,
    pub max: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_raw: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_raw: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostnameBody {
    pub hostname: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpReply {
    #[serde(default)]
    pub ip: Option<String>,
}

/// Sensor name to degrees Celsius.
pub type TemperatureReadings = BTreeMap<String, f64>;

/// Linear map between client angles and servo positions:
/// `physical = center + direction * angle * scale`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ServoMapping {
    pub center: f64,
    pub direction: f64,
    pub scale: f64,
}

impl ServoMapping {
    /// Client angle for a servo position. `None` for a degenerate mapping.
    pub fn to_mapped(&self, physical: f64) -> Option<f64> {
        let factor = self.direction * self.scale;
        if factor == 0.0 || !factor.is_finite() || !physical.is_finite() {
            return None;
        }
        Some((physical - self.center) / factor)
    }
}

/// Factory mapping the firmware falls back to when none is configured.
impl Default for ServoMapping {
    fn default() -> Self {
        Self {
            center: 120.0,
            direction: -1.0,
            scale: 1.0,
        }
    }
}

/// Boot-time defaults stored on the device (`/system/init`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceInitConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pwr_init: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pan_init: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tilt_init: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub servo_map: Option<BTreeMap<Axis, ServoMapping>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub servo_limits: Option<BTreeMap<Axis, [f64; 2]>>,
}

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Axis {
    Pan,
    Tilt,
}

impl Axis {
    pub const ALL: [Axis; 2] = [Axis::Pan, Axis::Tilt];

    pub fn as_str(self) -> &'static str {
        match self {
            Axis::Pan => "pan",
            Axis::Tilt => "tilt",
        }
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamProtocol {
    Hls,
    Rtsp,
    Udp,
}

impl StreamProtocol {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamProtocol::Hls => "hls",
            StreamProtocol::Rtsp => "rtsp",
            StreamProtocol::Udp => "udp",
        }
    }
}

impl fmt::Display for StreamProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pipeline flavour requested from the device: `yolo` runs detection overlays,
/// `pure` bypasses inference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewMode {
    #[default]
    Yolo,
    Pure,
}

impl fmt::Display for ViewMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ViewMode::Yolo => f.write_str("yolo"),
            ViewMode::Pure => f.write_str("pure"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MotionStatus {
    Ok,
    Limited,
    Error,
}

/// Directional input as produced by held keys or a d-pad.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JogDirection {
    Left,
    Right,
    Up,
    Down,
}

impl JogDirection {
    pub fn axis(self) -> Axis {
        match self {
            JogDirection::Left | JogDirection::Right => Axis::Pan,
            JogDirection::Up | JogDirection::Down => Axis::Tilt,
        }
    }

    pub fn signed_step(self, step: f64) -> f64 {
        match self {
            JogDirection::Right | JogDirection::Up => step.abs(),
            JogDirection::Left | JogDirection::Down => -step.abs(),
        }
    }
}

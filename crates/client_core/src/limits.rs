//! Per-axis angle ranges: the values the device reports, the adjustment the
//! client applies to them, and the limit endpoints.

use shared::{
    domain::Axis,
    protocol::{LimitCommand, LimitReply},
};

use crate::{
    error::{GatewayError, LimitError},
    gateway::{call_json, DeviceGateway, DeviceRequest, Endpoint},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AxisLimits {
    pub min: i32,
    pub max: i32,
}

impl AxisLimits {
    /// Full mechanical sweep of the servo around its center, used until the
    /// device has reported real limits.
    pub const PLACEHOLDER: AxisLimits = AxisLimits {
        min: -120,
        max: 120,
    };

    pub fn new(min: i32, max: i32) -> Result<Self, LimitError> {
        if min >= max {
            return Err(LimitError::InvalidRange {
                min: f64::from(min),
                max: f64::from(max),
            });
        }
        Ok(Self { min, max })
    }

    pub fn clamp(&self, angle: f64) -> f64 {
        if angle.is_nan() {
            return f64::from(self.min).max(0.0).min(f64::from(self.max));
        }
        angle.clamp(f64::from(self.min), f64::from(self.max))
    }

    pub fn contains(&self, angle: f64) -> bool {
        angle >= f64::from(self.min) && angle <= f64::from(self.max)
    }
}

/// Margin applied to device-reported limits before the client uses them.
///
/// Positive margins widen the range; the device still enforces its own
/// bounds and answers `limited` when a target falls outside them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitAdjustment {
    pub margin: i32,
}

impl LimitAdjustment {
    pub const NONE: LimitAdjustment = LimitAdjustment { margin: 0 };

    pub fn apply(&self, reply: &LimitReply) -> Result<AxisLimits, LimitError> {
        let (low, high) = if reply.min <= reply.max {
            (reply.min, reply.max)
        } else {
            (reply.max, reply.min)
        };
        if !low.is_finite() || !high.is_finite() {
            return Err(LimitError::InvalidRange {
                min: reply.min,
                max: reply.max,
            });
        }
        let min = low.floor() as i32 - self.margin;
        let max = high.ceil() as i32 + self.margin;
        AxisLimits::new(min, max).map_err(|_| LimitError::InvalidRange {
            min: reply.min,
            max: reply.max,
        })
    }
}

impl Default for LimitAdjustment {
    fn default() -> Self {
        Self { margin: 1 }
    }
}

pub async fn fetch_limits(
    gateway: &dyn DeviceGateway,
    axis: Axis,
) -> Result<LimitReply, GatewayError> {
    call_json(gateway, DeviceRequest::get(Endpoint::MotionLimit(axis))).await
}

pub async fn push_limits(
    gateway: &dyn DeviceGateway,
    axis: Axis,
    limits: AxisLimits,
) -> Result<(), GatewayError> {
    let request = DeviceRequest::post(
        Endpoint::MotionLimit(axis),
        &LimitCommand {
            min: f64::from(limits.min),
            max: f64::from(limits.max),
        },
    )?;
    gateway.call(request).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(min: f64, max: f64) -> LimitReply {
        LimitReply {
            min,
            max,
            min_raw: None,
            max_raw: None,
        }
    }

    #[test]
    fn rejects_empty_or_inverted_ranges() {
        assert!(AxisLimits::new(10, 10).is_err());
        assert!(AxisLimits::new(20, -20).is_err());
        assert_eq!(
            AxisLimits::new(-45, 40).expect("limits"),
            AxisLimits { min: -45, max: 40 }
        );
    }

    #[test]
    fn clamp_pins_angles_to_the_range() {
        let limits = AxisLimits { min: -45, max: 40 };
        assert_eq!(limits.clamp(90.0), 40.0);
        assert_eq!(limits.clamp(-90.0), -45.0);
        assert_eq!(limits.clamp(12.5), 12.5);
        assert_eq!(limits.clamp(f64::NAN), 0.0);
    }

    #[test]
    fn default_adjustment_widens_reported_limits_by_one() {
        let limits = LimitAdjustment::default()
            .apply(&reply(-90.0, 90.0))
            .expect("limits");
        assert_eq!(limits, AxisLimits { min: -91, max: 91 });
    }

    #[test]
    fn adjustment_rounds_outward_and_orders_swapped_bounds() {
        let limits = LimitAdjustment::NONE
            .apply(&reply(40.5, -44.2))
            .expect("limits");
        assert_eq!(limits, AxisLimits { min: -45, max: 41 });
    }

    #[test]
    fn adjustment_rejects_degenerate_reports() {
        assert!(LimitAdjustment::NONE.apply(&reply(5.0, 5.0)).is_err());
        assert!(LimitAdjustment::NONE
            .apply(&reply(f64::NAN, 5.0))
            .is_err());
    }
}

use std::sync::Arc;

use chrono::{DateTime, Utc};
use shared::protocol::{
    Ack, DeviceInitConfig, HostnameBody, IpReply, PowerCommand, PowerStatus, TemperatureReadings,
};
use tracing::{info, warn};

use crate::{
    error::{GatewayError, SystemError},
    gateway::{call_json, DeviceGateway, DeviceRequest, Endpoint},
};

/// Device health as last seen by the reconciliation loop.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Telemetry {
    pub hostname: Option<String>,
    pub temperatures: TemperatureReadings,
    pub camera_on: Option<bool>,
    pub observed_at: Option<DateTime<Utc>>,
}

impl Telemetry {
    /// Hottest sensor, if any reading is present.
    pub fn hottest(&self) -> Option<(&str, f64)> {
        self.temperatures
            .iter()
            .filter(|(_, celsius)| celsius.is_finite())
            .max_by(|(_, a), (_, b)| a.total_cmp(b))
            .map(|(name, celsius)| (name.as_str(), *celsius))
    }
}

/// Thin wrapper around the device's system and power endpoints.
#[derive(Clone)]
pub struct SystemClient {
    gateway: Arc<dyn DeviceGateway>,
}

impl SystemClient {
    pub fn new(gateway: Arc<dyn DeviceGateway>) -> Self {
        Self { gateway }
    }

    pub async fn hostname(&self) -> Result<String, GatewayError> {
        let body: HostnameBody =
            call_json(self.gateway.as_ref(), DeviceRequest::get(Endpoint::Hostname)).await?;
        Ok(body.hostname)
    }

    pub async fn set_hostname(&self, hostname: &str) -> Result<String, SystemError> {
        let hostname = hostname.trim();
        if hostname.is_empty() {
            return Err(SystemError::EmptyHostname);
        }
        let request = DeviceRequest::post(
            Endpoint::Hostname,
            &HostnameBody {
                hostname: hostname.to_string(),
            },
        )?;
        let ack: Ack = call_json(self.gateway.as_ref(), request).await?;
        ensure_ok(&ack)?;
        info!("system: hostname set to {hostname}");
        Ok(hostname.to_string())
    }

    pub async fn device_ip(&self) -> Result<Option<String>, GatewayError> {
        let reply: IpReply =
            call_json(self.gateway.as_ref(), DeviceRequest::get(Endpoint::DeviceIp)).await?;
        Ok(reply.ip)
    }

    /// Address the device sees this client connecting from.
    pub async fn client_ip(&self) -> Result<Option<String>, GatewayError> {
        let reply: IpReply =
            call_json(self.gateway.as_ref(), DeviceRequest::get(Endpoint::ClientIp)).await?;
        Ok(reply.ip)
    }

    pub async fn temperatures(&self) -> Result<TemperatureReadings, GatewayError> {
        call_json(self.gateway.as_ref(), DeviceRequest::get(Endpoint::Temperature)).await
    }

    pub async fn camera_power(&self) -> Result<bool, GatewayError> {
        let status: PowerStatus =
            call_json(self.gateway.as_ref(), DeviceRequest::get(Endpoint::CameraPower)).await?;
        Ok(status.on)
    }

    pub async fn set_camera_power(&self, on: bool) -> Result<bool, SystemError> {
        let request = DeviceRequest::post(Endpoint::CameraPower, &PowerCommand { on })?;
        let status: PowerStatus = call_json(self.gateway.as_ref(), request).await?;
        info!("system: camera power on={}", status.on);
        Ok(status.on)
    }

    pub async fn reboot(&self) -> Result<(), SystemError> {
        let ack: Ack = call_json(
            self.gateway.as_ref(),
            DeviceRequest::post_empty(Endpoint::SystemPower),
        )
        .await?;
        ensure_ok(&ack)?;
        warn!("system: device reboot requested");
        Ok(())
    }

    pub async fn init_config(&self) -> Result<DeviceInitConfig, GatewayError> {
        call_json(self.gateway.as_ref(), DeviceRequest::get(Endpoint::SystemInit)).await
    }

    /// Writes boot-time defaults. The device applies them immediately and
    /// ignores `servo_limits`, which is only changed through the limit
    /// endpoints.
    pub async fn update_init_config(
        &self,
        update: &DeviceInitConfig,
    ) -> Result<DeviceInitConfig, SystemError> {
        let update = DeviceInitConfig {
            servo_limits: None,
            ..update.clone()
        };
        let request = DeviceRequest::post(Endpoint::SystemInit, &update)?;
        let applied: DeviceInitConfig = call_json(self.gateway.as_ref(), request).await?;
        info!("system: init config updated");
        Ok(applied)
    }
}

fn ensure_ok(ack: &Ack) -> Result<(), SystemError> {
    if ack.is_error() {
        let message = ack
            .error
            .clone()
            .or_else(|| ack.message.clone())
            .unwrap_or_else(|| "unspecified device error".to_string());
        return Err(SystemError::Rejected(message));
    }
    Ok(())
}

#[cfg(test)]
#[path = "tests/system_tests.rs"]
mod tests;

use std::{fmt, time::Duration};

use async_trait::async_trait;
use reqwest::Client;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use shared::domain::{Axis, StreamProtocol};
use tracing::debug;
use url::Url;

use crate::error::GatewayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
}

/// Logical device endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Stream(StreamProtocol),
    CameraPower,
    SystemPower,
    Motion(Axis),
    MotionLimit(Axis),
    Hostname,
    DeviceIp,
    ClientIp,
    Temperature,
    SystemInit,
}

impl Endpoint {
    pub fn path(&self) -> String {
        match self {
            Endpoint::Stream(protocol) => format!("/stream/{protocol}"),
            Endpoint::CameraPower => "/power/camera".to_string(),
            Endpoint::SystemPower => "/power/system".to_string(),
            Endpoint::Motion(axis) => format!("/motion/{axis}"),
            Endpoint::MotionLimit(axis) => format!("/motion/{axis}/limit"),
            Endpoint::Hostname => "/system/hostname".to_string(),
            Endpoint::DeviceIp => "/system/ip".to_string(),
            Endpoint::ClientIp => "/system/client_ip".to_string(),
            Endpoint::Temperature => "/system/temperature".to_string(),
            Endpoint::SystemInit => "/system/init".to_string(),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceRequest {
    pub method: Method,
    pub endpoint: Endpoint,
    pub body: Option<Value>,
}

impl DeviceRequest {
    pub fn get(endpoint: Endpoint) -> Self {
        Self {
            method: Method::Get,
            endpoint,
            body: None,
        }
    }

    pub fn post<B: Serialize>(endpoint: Endpoint, body: &B) -> Result<Self, GatewayError> {
        let body =
            serde_json::to_value(body).map_err(|err| GatewayError::Encode(err.to_string()))?;
        Ok(Self {
            method: Method::Post,
            endpoint,
            body: Some(body),
        })
    }

    pub fn post_empty(endpoint: Endpoint) -> Self {
        Self {
            method: Method::Post,
            endpoint,
            body: None,
        }
    }
}

/// Opaque request/response access to the device.
#[async_trait]
pub trait DeviceGateway: Send + Sync {
    async fn call(&self, request: DeviceRequest) -> Result<Value, GatewayError>;
}

pub fn decode<T: DeserializeOwned>(value: Value) -> Result<T, GatewayError> {
    serde_json::from_value(value).map_err(|err| GatewayError::Decode(err.to_string()))
}

pub async fn call_json<T: DeserializeOwned>(
    gateway: &dyn DeviceGateway,
    request: DeviceRequest,
) -> Result<T, GatewayError> {
    decode(gateway.call(request).await?)
}

pub struct HttpDeviceGateway {
    http: Client,
    base_url: Url,
}

impl HttpDeviceGateway {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, GatewayError> {
        let mut base_url = Url::parse(base_url.trim())
            .map_err(|err| GatewayError::Address(format!("{base_url}: {err}")))?;
        if !matches!(base_url.scheme(), "http" | "https") {
            return Err(GatewayError::Address(format!(
                "device url must start with http:// or https://, got {base_url}"
            )));
        }
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| GatewayError::Transport(err.to_string()))?;
        Ok(Self { http, base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn url_for(&self, endpoint: Endpoint) -> Result<Url, GatewayError> {
        let path = endpoint.path();
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|err| GatewayError::Address(format!("{path}: {err}")))
    }
}

#[async_trait]
impl DeviceGateway for HttpDeviceGateway {
    async fn call(&self, request: DeviceRequest) -> Result<Value, GatewayError> {
        let url = self.url_for(request.endpoint)?;
        let builder = match request.method {
            Method::Get => self.http.get(url),
            Method::Post => match &request.body {
                Some(body) => self.http.post(url).json(body),
                None => self.http.post(url),
            },
        };

        let response = builder
            .send()
            .await
            .map_err(|err| GatewayError::Transport(err.to_string()))?;
        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|err| GatewayError::Transport(err.to_string()))?;
        debug!(
            "gateway: {:?} {} -> {} ({} bytes)",
            request.method,
            request.endpoint,
            status.as_u16(),
            bytes.len()
        );

        let parsed = if bytes.is_empty() {
            Ok(Value::Null)
        } else {
            serde_json::from_slice::<Value>(&bytes)
        };

        if !status.is_success() {
            return Err(GatewayError::Status {
                status: status.as_u16(),
                body: parsed.ok(),
            });
        }
        parsed.map_err(|err| GatewayError::Decode(err.to_string()))
    }
}

#[cfg(test)]
#[path = "tests/gateway_tests.rs"]
mod tests;

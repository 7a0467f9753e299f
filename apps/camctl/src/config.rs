use std::{fs, path::Path, time::Duration};

use anyhow::{bail, Context};
use client_core::{LimitAdjustment, ServoTiming, SessionOptions, StreamTiming};
use serde::Deserialize;
use shared::domain::StreamProtocol;
use tracing::warn;

pub const SETTINGS_FILE: &str = "camctl.toml";

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub device_url: String,
    pub request_timeout_ms: u64,
    pub throttle_ms: u64,
    pub settle_ms: u64,
    pub repoll_offsets_ms: Vec<u64>,
    pub hls_grace_ms: u64,
    pub poll_interval_ms: u64,
    pub limit_margin: i32,
    pub udp_port: u16,
    pub temperature_warning: f64,
    pub protocol: StreamProtocol,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            device_url: "http://127.0.0.1:8080".into(),
            request_timeout_ms: 5000,
            throttle_ms: 200,
            settle_ms: 50,
            repoll_offsets_ms: vec![200, 600, 1200],
            hls_grace_ms: 3000,
            poll_interval_ms: 1000,
            limit_margin: 1,
            udp_port: 5000,
            temperature_warning: 80.0,
            protocol: StreamProtocol::Hls,
        }
    }
}

/// Keys accepted in `camctl.toml`. Everything is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileSettings {
    device_url: Option<String>,
    request_timeout_ms: Option<u64>,
    throttle_ms: Option<u64>,
    settle_ms: Option<u64>,
    repoll_offsets_ms: Option<Vec<u64>>,
    hls_grace_ms: Option<u64>,
    poll_interval_ms: Option<u64>,
    limit_margin: Option<i32>,
    udp_port: Option<u16>,
    temperature_warning: Option<f64>,
    protocol: Option<StreamProtocol>,
}

impl Settings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn session_options(&self) -> anyhow::Result<SessionOptions> {
        if self.poll_interval_ms == 0 {
            bail!("poll_interval_ms must be greater than zero");
        }
        if self.limit_margin < 0 {
            bail!("limit_margin must not be negative (got {})", self.limit_margin);
        }
        Ok(SessionOptions {
            servo: ServoTiming {
                throttle_delay: Duration::from_millis(self.throttle_ms),
                settle_delay: Duration::from_millis(self.settle_ms),
                repoll_offsets: self
                    .repoll_offsets_ms
                    .iter()
                    .copied()
                    .map(Duration::from_millis)
                    .collect(),
            },
            stream: StreamTiming {
                hls_grace: Duration::from_millis(self.hls_grace_ms),
                udp_port: self.udp_port,
            },
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            limit_adjustment: LimitAdjustment {
                margin: self.limit_margin,
            },
            temperature_warning: self.temperature_warning,
            protocol: self.protocol,
        })
    }

    fn apply_file(&mut self, file: FileSettings) {
        if let Some(v) = file.device_url {
            self.device_url = v;
        }
        if let Some(v) = file.request_timeout_ms {
            self.request_timeout_ms = v;
        }
        if let Some(v) = file.throttle_ms {
            self.throttle_ms = v;
        }
        if let Some(v) = file.settle_ms {
            self.settle_ms = v;
        }
        if let Some(v) = file.repoll_offsets_ms {
            self.repoll_offsets_ms = v;
        }
        if let Some(v) = file.hls_grace_ms {
            self.hls_grace_ms = v;
        }
        if let Some(v) = file.poll_interval_ms {
            self.poll_interval_ms = v;
        }
        if let Some(v) = file.limit_margin {
            self.limit_margin = v;
        }
        if let Some(v) = file.udp_port {
            self.udp_port = v;
        }
        if let Some(v) = file.temperature_warning {
            self.temperature_warning = v;
        }
        if let Some(v) = file.protocol {
            self.protocol = v;
        }
    }

    fn apply_env(&mut self, env: &impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        if let Some(v) = lookup(env, "DEVICE_URL") {
            self.device_url = v;
        }
        if let Some(v) = lookup(env, "REQUEST_TIMEOUT_MS") {
            self.request_timeout_ms = parse("REQUEST_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup(env, "THROTTLE_MS") {
            self.throttle_ms = parse("THROTTLE_MS", &v)?;
        }
        if let Some(v) = lookup(env, "SETTLE_MS") {
            self.settle_ms = parse("SETTLE_MS", &v)?;
        }
        if let Some(v) = lookup(env, "REPOLL_OFFSETS_MS") {
            self.repoll_offsets_ms = v
                .split(',')
                .map(str::trim)
                .filter(|part| !part.is_empty())
                .map(|part| parse("REPOLL_OFFSETS_MS", part))
                .collect::<anyhow::Result<_>>()?;
        }
        if let Some(v) = lookup(env, "HLS_GRACE_MS") {
            self.hls_grace_ms = parse("HLS_GRACE_MS", &v)?;
        }
        if let Some(v) = lookup(env, "POLL_INTERVAL_MS") {
            self.poll_interval_ms = parse("POLL_INTERVAL_MS", &v)?;
        }
        if let Some(v) = lookup(env, "LIMIT_MARGIN") {
            self.limit_margin = parse("LIMIT_MARGIN", &v)?;
        }
        if let Some(v) = lookup(env, "UDP_PORT") {
            self.udp_port = parse("UDP_PORT", &v)?;
        }
        if let Some(v) = lookup(env, "TEMPERATURE_WARNING") {
            self.temperature_warning = parse("TEMPERATURE_WARNING", &v)?;
        }
        if let Some(v) = lookup(env, "PROTOCOL") {
            self.protocol = parse_protocol(&v)?;
        }
        Ok(())
    }
}

pub fn load_settings() -> anyhow::Result<Settings> {
    load_settings_from(Path::new(SETTINGS_FILE), &|key| std::env::var(key).ok())
}

/// Defaults, then the settings file if present, then `CAMCTL_*` and finally
/// `APP__*` environment variables.
pub fn load_settings_from(
    path: &Path,
    env: &impl Fn(&str) -> Option<String>,
) -> anyhow::Result<Settings> {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        let file = toml::from_str::<FileSettings>(&raw)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        settings.apply_file(file);
    } else if path != Path::new(SETTINGS_FILE) {
        warn!("config: {} not readable, using defaults", path.display());
    }

    settings.apply_env(env)?;
    Ok(settings)
}

pub fn parse_protocol(raw: &str) -> anyhow::Result<StreamProtocol> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "hls" => Ok(StreamProtocol::Hls),
        "rtsp" => Ok(StreamProtocol::Rtsp),
        "udp" => Ok(StreamProtocol::Udp),
        other => bail!("unknown stream protocol '{other}' (expected hls, rtsp or udp)"),
    }
}

fn lookup(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    env(&format!("APP__{key}")).or_else(|| env(&format!("CAMCTL_{key}")))
}

fn parse<T>(key: &str, raw: &str) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.trim()
        .parse::<T>()
        .with_context(|| format!("invalid value for {key}: '{raw}'"))
}

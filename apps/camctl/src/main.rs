mod config;

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use client_core::{CameraSession, ClientEvent, HttpDeviceGateway, StreamPhase};
use player_integration::HeadlessPlayer;
use serde_json::json;
use shared::{
    domain::{Axis, JogDirection, StreamProtocol, ViewMode},
    protocol::DeviceInitConfig,
};
use tokio::time::{sleep, Instant};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::{load_settings, load_settings_from, parse_protocol, Settings};

#[derive(Parser, Debug)]
#[command(name = "camctl", about = "Control a pan/tilt streaming camera")]
struct Cli {
    /// Settings file; defaults to ./camctl.toml when present.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    device_url: Option<String>,
    /// Stream protocol used by `stream` and the status poll.
    #[arg(long, value_parser = parse_protocol)]
    protocol: Option<StreamProtocol>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum AxisArg {
    Pan,
    Tilt,
}

impl From<AxisArg> for Axis {
    fn from(value: AxisArg) -> Self {
        match value {
            AxisArg::Pan => Axis::Pan,
            AxisArg::Tilt => Axis::Tilt,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum DirectionArg {
    Left,
    Right,
    Up,
    Down,
}

impl From<DirectionArg> for JogDirection {
    fn from(value: DirectionArg) -> Self {
        match value {
            DirectionArg::Left => JogDirection::Left,
            DirectionArg::Right => JogDirection::Right,
            DirectionArg::Up => JogDirection::Up,
            DirectionArg::Down => JogDirection::Down,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ViewArg {
    Yolo,
    Pure,
}

impl From<ViewArg> for ViewMode {
    fn from(value: ViewArg) -> Self {
        match value {
            ViewArg::Yolo => ViewMode::Yolo,
            ViewArg::Pure => ViewMode::Pure,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Switch {
    On,
    Off,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Poll the device once and print what it reports.
    Status,
    /// Move an axis to an absolute angle.
    Move {
        #[arg(value_enum)]
        axis: AxisArg,
        #[arg(allow_negative_numbers = true)]
        angle: f64,
    },
    /// Move an axis relative to its current position.
    Nudge {
        #[arg(value_enum)]
        axis: AxisArg,
        #[arg(allow_negative_numbers = true)]
        delta: f64,
    },
    /// Simulate a held direction key.
    Jog {
        #[arg(value_enum)]
        direction: DirectionArg,
        #[arg(long, default_value_t = 2.0)]
        step: f64,
        #[arg(long, default_value_t = 1)]
        repeat: u32,
        /// Key repeat interval in milliseconds.
        #[arg(long, default_value_t = 100)]
        interval_ms: u64,
    },
    Center,
    /// Show limits, or set them when both bounds are given.
    Limits {
        #[arg(value_enum)]
        axis: AxisArg,
        #[arg(long, allow_negative_numbers = true)]
        min: Option<i32>,
        #[arg(long, allow_negative_numbers = true)]
        max: Option<i32>,
    },
    #[command(subcommand)]
    Stream(StreamCommand),
    /// Switch camera power.
    Power {
        #[arg(value_enum)]
        state: Switch,
    },
    /// Show or change the device hostname.
    Hostname { name: Option<String> },
    Reboot,
    /// Show or update the device's boot defaults.
    Init {
        #[arg(long)]
        power: Option<bool>,
        #[arg(long, allow_negative_numbers = true)]
        pan: Option<f64>,
        #[arg(long, allow_negative_numbers = true)]
        tilt: Option<f64>,
    },
    /// Keep polling and print session events.
    Watch {
        /// Stop after this many seconds; runs until Ctrl-C otherwise.
        #[arg(long)]
        seconds: Option<u64>,
    },
}

#[derive(Subcommand, Debug)]
enum StreamCommand {
    Start {
        #[arg(long, value_enum, default_value = "yolo")]
        view: ViewArg,
        /// Target for udp streams, e.g. udp://192.168.1.50:5000.
        #[arg(long)]
        url: Option<String>,
    },
    Stop,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();

    let mut settings = match &cli.config {
        Some(path) => load_settings_from(path, &|key| std::env::var(key).ok())?,
        None => load_settings()?,
    };
    if let Some(url) = &cli.device_url {
        settings.device_url = url.clone();
    }
    if let Some(protocol) = cli.protocol {
        settings.protocol = protocol;
    }

    let session = connect(&settings)?;
    let result = run(&session, &settings, cli.command).await;
    session.shutdown().await;
    result
}

fn connect(settings: &Settings) -> Result<Arc<CameraSession>> {
    let gateway = HttpDeviceGateway::new(&settings.device_url, settings.request_timeout())
        .with_context(|| format!("cannot use device url {}", settings.device_url))?;
    info!("camctl: device {}", gateway.base_url());
    Ok(CameraSession::new_with_player(
        Arc::new(gateway),
        Arc::new(HeadlessPlayer::new()),
        settings.session_options()?,
    ))
}

async fn run(session: &Arc<CameraSession>, settings: &Settings, command: Command) -> Result<()> {
    match command {
        Command::Status => {
            session.initialize().await;
            print_status(session).await?;
        }
        Command::Move { axis, angle } => {
            session.initialize().await;
            let target = session.servo().request_angle(axis.into(), angle).await;
            info!("camctl: {} target {target}", Axis::from(axis));
            wait_for_motion(session, settings).await;
            print_status(session).await?;
        }
        Command::Nudge { axis, delta } => {
            session.initialize().await;
            session.servo().request_delta(axis.into(), delta).await;
            wait_for_motion(session, settings).await;
            print_status(session).await?;
        }
        Command::Jog {
            direction,
            step,
            repeat,
            interval_ms,
        } => {
            session.initialize().await;
            for _ in 0..repeat.max(1) {
                session.servo().jog(direction.into(), step).await;
                sleep(Duration::from_millis(interval_ms)).await;
            }
            wait_for_motion(session, settings).await;
            print_status(session).await?;
        }
        Command::Center => {
            session.initialize().await;
            session.servo().center().await;
            wait_for_motion(session, settings).await;
            print_status(session).await?;
        }
        Command::Limits { axis, min, max } => {
            let axis = Axis::from(axis);
            match (min, max) {
                (Some(min), Some(max)) => {
                    session.initialize().await;
                    let limits = session.servo().set_limits(axis, min, max).await?;
                    wait_for_motion(session, settings).await;
                    print_json(&json!({"axis": axis, "min": limits.min, "max": limits.max}))?;
                }
                (None, None) => {
                    let limits = session.servo().load_limits(axis).await?;
                    print_json(&json!({"axis": axis, "min": limits.min, "max": limits.max}))?;
                }
                _ => bail!("set limits with both --min and --max"),
            }
        }
        Command::Stream(StreamCommand::Start { view, url }) => {
            let stream = session.stream();
            let started = stream.start(settings.protocol, view.into(), url).await?;
            if started.phase == StreamPhase::Starting {
                sleep(settings.session_options()?.stream.hls_grace + Duration::from_millis(100))
                    .await;
            }
            let current = stream.session().await;
            print_json(&json!({
                "protocol": settings.protocol,
                "phase": format!("{:?}", current.phase),
                "url": current.playback_url,
            }))?;
        }
        Command::Stream(StreamCommand::Stop) => {
            session.stream().stop().await?;
            print_json(&json!({"protocol": settings.protocol, "on": false}))?;
        }
        Command::Power { state } => {
            session.poll_once().await;
            let on = session
                .set_camera_power(matches!(state, Switch::On))
                .await?;
            print_json(&json!({"camera_on": on}))?;
        }
        Command::Hostname { name: Some(name) } => {
            let hostname = session.system().set_hostname(&name).await?;
            print_json(&json!({"hostname": hostname}))?;
        }
        Command::Hostname { name: None } => {
            let hostname = session.system().hostname().await?;
            print_json(&json!({"hostname": hostname}))?;
        }
        Command::Reboot => {
            session.system().reboot().await?;
            print_json(&json!({"status": "rebooting"}))?;
        }
        Command::Init { power, pan, tilt } => {
            let config = if power.is_none() && pan.is_none() && tilt.is_none() {
                session.system().init_config().await?
            } else {
                session
                    .system()
                    .update_init_config(&DeviceInitConfig {
                        pwr_init: power,
                        pan_init: pan,
                        tilt_init: tilt,
                        ..DeviceInitConfig::default()
                    })
                    .await?
            };
            print_json(&serde_json::to_value(config)?)?;
        }
        Command::Watch { seconds } => watch(session, seconds).await?,
    }
    Ok(())
}

/// Waits until no throttled command is left and the follow-up reads have run.
async fn wait_for_motion(session: &Arc<CameraSession>, settings: &Settings) {
    let servo = session.servo();
    let timing = servo.timing().clone();
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        let mut idle = true;
        for axis in Axis::ALL {
            idle &= servo.pending(axis).await.is_none();
        }
        if idle {
            break;
        }
        sleep(timing.settle_delay.max(Duration::from_millis(10))).await;
    }
    let last_repoll = timing.repoll_offsets.iter().max().copied().unwrap_or_default();
    sleep(last_repoll + settings.request_timeout().min(Duration::from_millis(500))).await;
}

async fn print_status(session: &Arc<CameraSession>) -> Result<()> {
    let telemetry = session.telemetry().await;
    let stream = session.stream().session().await;
    let mut axes = serde_json::Map::new();
    for axis in Axis::ALL {
        let state = session.servo().axis_state(axis).await;
        axes.insert(
            axis.to_string(),
            json!({
                "angle": state.current_angle,
                "min": state.min_limit,
                "max": state.max_limit,
            }),
        );
    }
    print_json(&json!({
        "hostname": telemetry.hostname,
        "camera_on": telemetry.camera_on,
        "temperatures": telemetry.temperatures,
        "hottest": telemetry.hottest().map(|(sensor, celsius)| json!({"sensor": sensor, "celsius": celsius})),
        "axes": axes,
        "stream": {
            "protocol": stream.observed_protocol(),
            "on": stream.confirmed_on,
            "url": stream.playback_url,
        },
        "observed_at": telemetry.observed_at.map(|at| at.to_rfc3339()),
    }))
}

async fn watch(session: &Arc<CameraSession>, seconds: Option<u64>) -> Result<()> {
    let mut events = session.subscribe_events();
    session.initialize().await;
    session.start_reconciliation().await;

    let until = seconds.map(|seconds| Instant::now() + Duration::from_secs(seconds));
    loop {
        let timeout = async {
            match until {
                Some(until) => tokio::time::sleep_until(until).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = timeout => break,
            event = events.recv() => match event {
                Ok(event) => print_event(&event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    info!("camctl: skipped {skipped} events");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    session.stop_reconciliation().await;
    Ok(())
}

fn print_event(event: &ClientEvent) {
    match event {
        ClientEvent::AxisUpdated { axis, angle } => println!("{axis}: {angle:.1}"),
        ClientEvent::TelemetryUpdated(telemetry) => {
            if let Some((sensor, celsius)) = telemetry.hottest() {
                println!("temperature: {sensor} {celsius:.1}C");
            }
        }
        ClientEvent::StreamStateChanged(stream) => println!(
            "stream: {} {:?} url={}",
            stream.observed_protocol(),
            stream.phase,
            stream.playback_url.as_deref().unwrap_or("-")
        ),
        other => println!("{other:?}"),
    }
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

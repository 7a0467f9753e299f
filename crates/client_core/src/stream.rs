//! Streaming session lifecycle: `Idle → Starting → Live → Stopping → Idle`.
//!
//! `desired_on` is the local intent and flips optimistically when a start is
//! issued; `confirmed_on` only ever comes from the reconciliation loop.

use std::{net::Ipv4Addr, sync::Arc, time::Duration};

use player_integration::{PlaybackSource, PlayerBackend};
use shared::{
    domain::{StreamProtocol, ViewMode},
    protocol::{IpReply, StreamCommand, StreamCommandReply, StreamStatus},
};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
    time::sleep,
};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    error::{GatewayError, StreamError},
    gateway::{call_json, DeviceGateway, DeviceRequest, Endpoint},
    ClientEvent,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamTiming {
    /// Time the device's HLS muxer needs before the playlist is servable.
    pub hls_grace: Duration,
    /// Port used when the udp target is discovered rather than supplied.
    pub udp_port: u16,
}

impl Default for StreamTiming {
    fn default() -> Self {
        Self {
            hls_grace: Duration::from_millis(3000),
            udp_port: 5000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    Idle,
    Starting,
    Live,
    Stopping,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamSession {
    /// Protocol the next `start` will use.
    pub protocol: StreamProtocol,
    pub phase: StreamPhase,
    pub desired_on: bool,
    pub confirmed_on: Option<bool>,
    pub playback_url: Option<String>,
    pub view_mode: ViewMode,
    /// Protocol of the stream currently running on the device.
    pub live_protocol: Option<StreamProtocol>,
}

impl StreamSession {
    pub fn new(protocol: StreamProtocol) -> Self {
        Self {
            protocol,
            phase: StreamPhase::Idle,
            desired_on: false,
            confirmed_on: None,
            playback_url: None,
            view_mode: ViewMode::default(),
            live_protocol: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.desired_on || self.phase != StreamPhase::Idle
    }

    /// The protocol whose status reflects this session.
    pub fn observed_protocol(&self) -> StreamProtocol {
        self.live_protocol.unwrap_or(self.protocol)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlayerAction {
    None,
    Attach(PlaybackSource),
    Detach,
}

/// Merges an observed device status into the local session. The device wins
/// whenever its on/off state disagrees with `desired_on`.
pub fn fold_stream(local: &StreamSession, observed: &StreamStatus) -> (StreamSession, PlayerAction) {
    let mut next = local.clone();
    next.confirmed_on = Some(observed.on);
    if observed.on == local.desired_on {
        return (next, PlayerAction::None);
    }

    if observed.on {
        let protocol = local.observed_protocol();
        next.desired_on = true;
        next.phase = StreamPhase::Live;
        next.live_protocol = Some(protocol);
        next.playback_url = observed.url.clone().or_else(|| local.playback_url.clone());
        let action = match (&next.playback_url, protocol) {
            (Some(url), StreamProtocol::Hls | StreamProtocol::Rtsp) => {
                PlayerAction::Attach(PlaybackSource {
                    protocol,
                    url: url.clone(),
                })
            }
            _ => PlayerAction::None,
        };
        (next, action)
    } else {
        next.desired_on = false;
        next.phase = StreamPhase::Idle;
        next.live_protocol = None;
        next.playback_url = None;
        (next, PlayerAction::Detach)
    }
}

/// A stream status read, tagged with the lifecycle revision current when it
/// was requested.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamObservation {
    pub protocol: StreamProtocol,
    pub revision: u64,
    pub status: StreamStatus,
}

pub fn validate_udp_url(raw: &str) -> Result<String, StreamError> {
    let invalid = || StreamError::InvalidUdpAddress(raw.to_string());
    let url = Url::parse(raw.trim()).map_err(|_| invalid())?;
    if url.scheme() != "udp" || url.port().is_none() {
        return Err(invalid());
    }
    // udp is not a special scheme, so the host comes back opaque.
    match url.host_str().map(str::parse::<Ipv4Addr>) {
        Some(Ok(_)) => Ok(raw.trim().to_string()),
        _ => Err(invalid()),
    }
}

struct StreamState {
    session: StreamSession,
    revision: u64,
    epoch: u64,
    attach_task: Option<JoinHandle<()>>,
}

impl StreamState {
    fn cancel_attach(&mut self) {
        self.epoch += 1;
        if let Some(task) = self.attach_task.take() {
            task.abort();
        }
    }
}

pub struct StreamController {
    gateway: Arc<dyn DeviceGateway>,
    player: Arc<dyn PlayerBackend>,
    timing: StreamTiming,
    state: Mutex<StreamState>,
    transition: Mutex<()>,
    events: broadcast::Sender<ClientEvent>,
}

impl StreamController {
    pub fn new(
        gateway: Arc<dyn DeviceGateway>,
        player: Arc<dyn PlayerBackend>,
        protocol: StreamProtocol,
        timing: StreamTiming,
        events: broadcast::Sender<ClientEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            gateway,
            player,
            timing,
            state: Mutex::new(StreamState {
                session: StreamSession::new(protocol),
                revision: 0,
                epoch: 0,
                attach_task: None,
            }),
            transition: Mutex::new(()),
            events,
        })
    }

    pub async fn session(&self) -> StreamSession {
        self.state.lock().await.session.clone()
    }

    pub async fn is_active(&self) -> bool {
        self.state.lock().await.session.is_active()
    }

    /// Changes the protocol of the next `start`. A running stream keeps going.
    pub async fn select_protocol(&self, protocol: StreamProtocol) {
        let snapshot = {
            let mut state = self.state.lock().await;
            state.session.protocol = protocol;
            state.session.clone()
        };
        info!("stream: protocol {protocol} selected for next start");
        self.emit_state(snapshot);
    }

    /// Starts a `protocol` stream, which also becomes the selected protocol.
    /// Refused unless the session is idle.
    pub async fn start(
        self: &Arc<Self>,
        protocol: StreamProtocol,
        view_mode: ViewMode,
        custom_url: Option<String>,
    ) -> Result<StreamSession, StreamError> {
        let _transition = self.transition.lock().await;
        let (previous, optimistic) = {
            let mut state = self.state.lock().await;
            if state.session.phase != StreamPhase::Idle {
                return Err(StreamError::Busy(state.session.phase));
            }
            state.session.protocol = protocol;
            let previous = state.session.clone();
            state.session.phase = StreamPhase::Starting;
            state.session.desired_on = true;
            state.session.view_mode = view_mode;
            (previous, state.session.clone())
        };
        self.emit_state(optimistic);
        info!("stream: starting {protocol} view={view_mode}");

        let started = match self.request_start(protocol, view_mode, custom_url).await {
            Ok(url) => url,
            Err(err) => return Err(self.revert(previous, err).await),
        };

        match protocol {
            StreamProtocol::Hls => {
                let Some(url) = started else {
                    return Err(self
                        .revert(previous, StreamError::MissingPlaybackUrl(protocol))
                        .await);
                };
                let snapshot = {
                    let mut state = self.state.lock().await;
                    state.revision += 1;
                    state.cancel_attach();
                    state.session.playback_url = Some(url);
                    state.session.live_protocol = Some(protocol);
                    let epoch = state.epoch;
                    let controller = Arc::clone(self);
                    let grace = self.timing.hls_grace;
                    state.attach_task = Some(tokio::spawn(async move {
                        sleep(grace).await;
                        controller.finish_hls_attach(epoch).await;
                    }));
                    state.session.clone()
                };
                debug!(
                    "stream: hls accepted, attaching player in {:?}",
                    self.timing.hls_grace
                );
                self.emit_state(snapshot.clone());
                Ok(snapshot)
            }
            StreamProtocol::Rtsp => {
                let Some(url) = started else {
                    return Err(self
                        .revert(previous, StreamError::MissingPlaybackUrl(protocol))
                        .await);
                };
                let snapshot = self.go_live(protocol, Some(url.clone())).await;
                self.attach_player(PlaybackSource { protocol, url }).await;
                Ok(snapshot)
            }
            StreamProtocol::Udp => Ok(self.go_live(protocol, started).await),
        }
    }

    async fn request_start(
        &self,
        protocol: StreamProtocol,
        view_mode: ViewMode,
        custom_url: Option<String>,
    ) -> Result<Option<String>, StreamError> {
        let target = match protocol {
            StreamProtocol::Udp => Some(self.resolve_udp_target(custom_url).await?),
            _ => custom_url,
        };
        let request = DeviceRequest::post(
            Endpoint::Stream(protocol),
            &StreamCommand {
                on: true,
                view: view_mode,
                url: target.clone(),
            },
        )?;
        let reply: StreamCommandReply = call_json(self.gateway.as_ref(), request).await?;
        if let Some(error) = reply.error {
            return Err(StreamError::Rejected(error));
        }
        Ok(match protocol {
            StreamProtocol::Udp => target,
            _ => reply.url,
        })
    }

    async fn resolve_udp_target(&self, custom_url: Option<String>) -> Result<String, StreamError> {
        if let Some(url) = custom_url.filter(|url| !url.trim().is_empty()) {
            return validate_udp_url(&url);
        }
        let reply: IpReply =
            call_json(self.gateway.as_ref(), DeviceRequest::get(Endpoint::ClientIp)).await?;
        let ip = reply
            .ip
            .and_then(|ip| ip.trim().parse::<Ipv4Addr>().ok())
            .ok_or(StreamError::MissingUdpAddress)?;
        validate_udp_url(&format!("udp://{ip}:{}", self.timing.udp_port))
    }

    async fn go_live(&self, protocol: StreamProtocol, url: Option<String>) -> StreamSession {
        let snapshot = {
            let mut state = self.state.lock().await;
            state.revision += 1;
            state.cancel_attach();
            state.session.phase = StreamPhase::Live;
            state.session.live_protocol = Some(protocol);
            state.session.playback_url = url;
            state.session.clone()
        };
        info!("stream: {protocol} live");
        self.emit_state(snapshot.clone());
        snapshot
    }

    async fn finish_hls_attach(self: Arc<Self>, epoch: u64) {
        let _transition = self.transition.lock().await;
        let (snapshot, source) = {
            let mut state = self.state.lock().await;
            if state.epoch != epoch || state.session.phase != StreamPhase::Starting {
                return;
            }
            state.attach_task = None;
            state.session.phase = StreamPhase::Live;
            let source = state.session.playback_url.clone().map(|url| PlaybackSource {
                protocol: StreamProtocol::Hls,
                url,
            });
            (state.session.clone(), source)
        };
        info!("stream: hls grace elapsed, live");
        self.emit_state(snapshot);
        if let Some(source) = source {
            self.attach_player(source).await;
        }
    }

    async fn attach_player(&self, source: PlaybackSource) {
        if !self.player.plays(source.protocol) {
            debug!("stream: player does not handle {}", source.protocol);
            return;
        }
        // The device stream is up either way; a local player failure is
        // reported without reverting the session.
        if let Err(err) = self.player.attach(source).await {
            warn!("stream: player attach failed: {err}");
            let _ = self
                .events
                .send(ClientEvent::StreamFailed(format!("player attach failed: {err}")));
        }
    }

    async fn detach_player(&self) {
        if let Err(err) = self.player.detach().await {
            warn!("stream: player detach failed: {err}");
        }
    }

    async fn revert(&self, previous: StreamSession, err: StreamError) -> StreamError {
        let snapshot = {
            let mut state = self.state.lock().await;
            state.revision += 1;
            state.cancel_attach();
            let protocol = state.session.protocol;
            state.session = previous;
            state.session.protocol = protocol;
            state.session.clone()
        };
        warn!("stream: start failed: {err}");
        let _ = self.events.send(ClientEvent::StreamFailed(err.to_string()));
        self.emit_state(snapshot);
        err
    }

    /// Stops the stream. The session always ends `Idle`; a failed stop
    /// command is still returned and reported.
    pub async fn stop(&self) -> Result<(), StreamError> {
        let _transition = self.transition.lock().await;
        let (protocol, view_mode, stopping) = {
            let mut state = self.state.lock().await;
            state.cancel_attach();
            state.session.phase = StreamPhase::Stopping;
            (
                state.session.observed_protocol(),
                state.session.view_mode,
                state.session.clone(),
            )
        };
        self.emit_state(stopping);
        info!("stream: stopping {protocol}");

        let result = match DeviceRequest::post(
            Endpoint::Stream(protocol),
            &StreamCommand {
                on: false,
                view: view_mode,
                url: None,
            },
        ) {
            Ok(request) => self.gateway.call(request).await.map(|_| ()),
            Err(err) => Err(err),
        };
        self.detach_player().await;

        let idle = {
            let mut state = self.state.lock().await;
            state.revision += 1;
            state.session.phase = StreamPhase::Idle;
            state.session.desired_on = false;
            state.session.playback_url = None;
            state.session.live_protocol = None;
            state.session.clone()
        };
        self.emit_state(idle);

        result.map_err(|err: GatewayError| {
            let err = StreamError::from(err);
            warn!("stream: stop command failed: {err}");
            let _ = self.events.send(ClientEvent::StreamFailed(err.to_string()));
            err
        })
    }

    /// Reads the device's stream flag for the protocol this session tracks.
    pub async fn poll_status(&self) -> Result<StreamObservation, GatewayError> {
        let (protocol, revision) = {
            let state = self.state.lock().await;
            (state.session.observed_protocol(), state.revision)
        };
        let status: StreamStatus = call_json(
            self.gateway.as_ref(),
            DeviceRequest::get(Endpoint::Stream(protocol)),
        )
        .await?;
        Ok(StreamObservation {
            protocol,
            revision,
            status,
        })
    }

    /// Folds a polled status into the session. Observations that predate the
    /// latest lifecycle transition, or arrive while one is running, are
    /// dropped. Returns whether the observation was applied.
    pub async fn fold_observation(&self, observation: StreamObservation) -> bool {
        let Ok(_transition) = self.transition.try_lock() else {
            debug!("stream: transition in progress, skipping observation");
            return false;
        };
        let (before, after, action) = {
            let mut state = self.state.lock().await;
            if state.revision != observation.revision
                || state.session.observed_protocol() != observation.protocol
            {
                debug!("stream: stale observation dropped");
                return false;
            }
            let before = state.session.clone();
            let (after, action) = fold_stream(&before, &observation.status);
            if after.desired_on != before.desired_on {
                state.cancel_attach();
                state.revision += 1;
            }
            state.session = after.clone();
            (before, after, action)
        };

        if after.desired_on != before.desired_on {
            warn!(
                "stream: drift on {} device_on={} local_on={}; adopting device state",
                observation.protocol, observation.status.on, before.desired_on
            );
            let _ = self.events.send(ClientEvent::StreamDrift {
                device_on: observation.status.on,
                local_on: before.desired_on,
            });
        }
        match action {
            PlayerAction::Attach(source) => self.attach_player(source).await,
            PlayerAction::Detach => self.detach_player().await,
            PlayerAction::None => {}
        }
        if after != before {
            self.emit_state(after);
        }
        true
    }

    pub async fn shutdown(&self) {
        self.state.lock().await.cancel_attach();
        self.detach_player().await;
    }

    fn emit_state(&self, session: StreamSession) {
        let _ = self.events.send(ClientEvent::StreamStateChanged(session));
    }
}

#[cfg(test)]
#[path = "tests/stream_tests.rs"]
mod tests;

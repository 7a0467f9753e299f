//! Servo command coordination.
//!
//! The actuator link carries one request at a time for both axes. Every
//! motion read or write goes through [`ServoCoordinator`], which holds the
//! link gate for the whole request/response cycle and waits out the settle
//! delay before the next holder may send. User input is coalesced per axis
//! into throttle windows; only the newest target of a window is dispatched.

use std::{collections::HashMap, sync::Arc, time::Duration};

use shared::{
    domain::{Axis, JogDirection, MotionStatus},
    protocol::{MotionCommand, MotionReply, ServoMapping},
};
use tokio::{
    sync::{broadcast, Mutex, MutexGuard},
    task::JoinHandle,
    time::{sleep, sleep_until, Instant},
};
use tracing::{debug, info, warn};

use crate::{
    error::{GatewayError, ServoError},
    gateway::{decode, DeviceGateway, DeviceRequest, Endpoint},
    limits::{fetch_limits, push_limits, AxisLimits, LimitAdjustment},
    ClientEvent,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServoTiming {
    /// Length of a throttle window. The window opens with the first request
    /// for an axis that has nothing pending and dispatches when it closes,
    /// so an isolated request also waits this long.
    pub throttle_delay: Duration,
    pub settle_delay: Duration,
    pub repoll_offsets: Vec<Duration>,
}

impl Default for ServoTiming {
    fn default() -> Self {
        Self {
            throttle_delay: Duration::from_millis(200),
            settle_delay: Duration::from_millis(50),
            repoll_offsets: vec![
                Duration::from_millis(200),
                Duration::from_millis(600),
                Duration::from_millis(1200),
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AxisState {
    pub axis: Axis,
    pub current_angle: f64,
    pub min_limit: i32,
    pub max_limit: i32,
    pub last_commanded_angle: f64,
    pub last_command_at: Option<Instant>,
}

impl AxisState {
    fn placeholder(axis: Axis) -> Self {
        Self {
            axis,
            current_angle: 0.0,
            min_limit: AxisLimits::PLACEHOLDER.min,
            max_limit: AxisLimits::PLACEHOLDER.max,
            last_commanded_angle: 0.0,
            last_command_at: None,
        }
    }

    pub fn limits(&self) -> AxisLimits {
        AxisLimits {
            min: self.min_limit,
            max: self.max_limit,
        }
    }

    pub fn clamp(&self, angle: f64) -> f64 {
        self.limits().clamp(angle)
    }

    fn set_limits(&mut self, limits: AxisLimits) {
        self.min_limit = limits.min;
        self.max_limit = limits.max;
        self.current_angle = limits.clamp(self.current_angle);
    }
}

/// A throttled command that has not been sent yet.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PendingCommand {
    pub axis: Axis,
    pub target_angle: f64,
    pub deadline: Instant,
}

/// An authoritative angle read from the device, tagged with the sequence
/// number the read was issued under.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AngleReading {
    pub axis: Axis,
    pub angle: f64,
    pub seq: u64,
}

struct PendingSlot {
    command: PendingCommand,
    ticket: u64,
    task: JoinHandle<()>,
}

struct InFlight {
    ticket: u64,
    target: f64,
}

struct AxisTrack {
    state: AxisState,
    last_applied_seq: u64,
    mapping: ServoMapping,
    /// Range the device enforces, before the client's margin.
    device_range: Option<(f64, f64)>,
}

#[derive(Default)]
struct ServoState {
    axes: HashMap<Axis, AxisTrack>,
    pending: HashMap<Axis, PendingSlot>,
    in_flight: HashMap<Axis, InFlight>,
    repoll_generation: HashMap<Axis, u64>,
    repoll_tasks: Vec<JoinHandle<()>>,
    next_seq: u64,
    next_ticket: u64,
}

impl ServoState {
    fn track_mut(&mut self, axis: Axis) -> &mut AxisTrack {
        self.axes.entry(axis).or_insert_with(|| AxisTrack {
            state: AxisState::placeholder(axis),
            last_applied_seq: 0,
            mapping: ServoMapping::default(),
            device_range: None,
        })
    }

    fn issue_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn issue_ticket(&mut self) -> u64 {
        self.next_ticket += 1;
        self.next_ticket
    }

    /// Target the axis is heading for: the unsent pending target, else the
    /// in-flight one, else where the device last said it was.
    fn heading(&mut self, axis: Axis) -> f64 {
        if let Some(slot) = self.pending.get(&axis) {
            return slot.command.target_angle;
        }
        if let Some(in_flight) = self.in_flight.get(&axis) {
            return in_flight.target;
        }
        self.track_mut(axis).state.current_angle
    }
}

struct LinkGate {
    last_release: Option<Instant>,
}

pub struct ServoCoordinator {
    gateway: Arc<dyn DeviceGateway>,
    timing: ServoTiming,
    adjustment: LimitAdjustment,
    state: Mutex<ServoState>,
    link: Mutex<LinkGate>,
    events: broadcast::Sender<ClientEvent>,
}

impl ServoCoordinator {
    pub fn new(
        gateway: Arc<dyn DeviceGateway>,
        timing: ServoTiming,
        adjustment: LimitAdjustment,
        events: broadcast::Sender<ClientEvent>,
    ) -> Arc<Self> {
        let mut state = ServoState::default();
        for axis in Axis::ALL {
            state.track_mut(axis);
        }
        Arc::new(Self {
            gateway,
            timing,
            adjustment,
            state: Mutex::new(state),
            link: Mutex::new(LinkGate { last_release: None }),
            events,
        })
    }

    pub fn timing(&self) -> &ServoTiming {
        &self.timing
    }

    pub async fn axis_state(&self, axis: Axis) -> AxisState {
        self.state.lock().await.track_mut(axis).state.clone()
    }

    pub async fn pending(&self, axis: Axis) -> Option<PendingCommand> {
        self.state
            .lock()
            .await
            .pending
            .get(&axis)
            .map(|slot| slot.command)
    }

    pub async fn mapping(&self, axis: Axis) -> ServoMapping {
        self.state.lock().await.track_mut(axis).mapping
    }

    /// Installs the device's angle mapping for `axis`, used to read servo
    /// positions out of motion replies.
    pub async fn set_mapping(&self, axis: Axis, mapping: ServoMapping) {
        self.state.lock().await.track_mut(axis).mapping = mapping;
        debug!("servo: {axis} mapping {mapping:?}");
    }

    /// Requests an absolute angle. Returns the clamped target that will be
    /// dispatched when the axis' throttle window closes.
    pub async fn request_angle(self: &Arc<Self>, axis: Axis, angle: f64) -> f64 {
        let mut state = self.state.lock().await;
        let target = state.track_mut(axis).state.clamp(angle);
        self.schedule_locked(&mut state, axis, target);
        target
    }

    /// Requests a move relative to where the axis is heading.
    pub async fn request_delta(self: &Arc<Self>, axis: Axis, delta: f64) -> f64 {
        let mut state = self.state.lock().await;
        let base = state.heading(axis);
        let target = state.track_mut(axis).state.clamp(base + delta);
        self.schedule_locked(&mut state, axis, target);
        target
    }

    pub async fn jog(self: &Arc<Self>, direction: JogDirection, step: f64) -> f64 {
        self.request_delta(direction.axis(), direction.signed_step(step))
            .await
    }

    /// Pan to zero, then tilt to zero one settle delay later.
    pub async fn center(self: &Arc<Self>) {
        self.request_angle(Axis::Pan, 0.0).await;
        sleep(self.timing.settle_delay).await;
        self.request_angle(Axis::Tilt, 0.0).await;
    }

    fn schedule_locked(self: &Arc<Self>, state: &mut ServoState, axis: Axis, target: f64) {
        let deadline = match state.pending.remove(&axis) {
            Some(previous) => {
                previous.task.abort();
                previous.command.deadline
            }
            None => Instant::now() + self.timing.throttle_delay,
        };
        let ticket = state.issue_ticket();
        let coordinator = Arc::clone(self);
        let task = tokio::spawn(async move {
            sleep_until(deadline).await;
            coordinator.fire_pending(axis, ticket).await;
        });
        debug!("servo: {axis} pending target={target} ticket={ticket}");
        state.pending.insert(
            axis,
            PendingSlot {
                command: PendingCommand {
                    axis,
                    target_angle: target,
                    deadline,
                },
                ticket,
                task,
            },
        );
    }

    async fn fire_pending(self: Arc<Self>, axis: Axis, ticket: u64) {
        let target = {
            let mut state = self.state.lock().await;
            if state.pending.get(&axis).map(|slot| slot.ticket) != Some(ticket) {
                return;
            }
            let Some(slot) = state.pending.remove(&axis) else {
                return;
            };
            state.in_flight.insert(
                axis,
                InFlight {
                    ticket,
                    target: slot.command.target_angle,
                },
            );
            slot.command.target_angle
        };
        self.dispatch(axis, target, ticket).await;
    }

    async fn acquire_link(&self) -> MutexGuard<'_, LinkGate> {
        let guard = self.link.lock().await;
        if let Some(released) = guard.last_release {
            sleep_until(released + self.timing.settle_delay).await;
        }
        guard
    }

    fn release_link(mut guard: MutexGuard<'_, LinkGate>) {
        guard.last_release = Some(Instant::now());
    }

    async fn dispatch(self: &Arc<Self>, axis: Axis, target: f64, ticket: u64) {
        let link = self.acquire_link().await;
        let (target, seq) = {
            let mut state = self.state.lock().await;
            let seq = state.issue_seq();
            let axis_state = &mut state.track_mut(axis).state;
            // Limits may have moved while the command waited for the link.
            let target = axis_state.clamp(target);
            axis_state.last_commanded_angle = target;
            axis_state.last_command_at = Some(Instant::now());
            (target, seq)
        };
        info!("servo: dispatch {axis} target={target} seq={seq}");

        let request = DeviceRequest::post(Endpoint::Motion(axis), &MotionCommand { angle: target });
        let result = match request {
            Ok(request) => self.gateway.call(request).await,
            Err(err) => Err(err),
        };
        let verified = self.absorb_command_reply(axis, target, seq, result).await;

        {
            let mut state = self.state.lock().await;
            if state.in_flight.get(&axis).map(|f| f.ticket) == Some(ticket) {
                state.in_flight.remove(&axis);
            }
        }
        Self::release_link(link);

        if verified {
            self.schedule_repolls(axis).await;
        }
    }

    /// Folds a command reply into local state. Returns whether the device
    /// answered for the requested axis.
    async fn absorb_command_reply(
        &self,
        axis: Axis,
        requested: f64,
        seq: u64,
        result: Result<serde_json::Value, GatewayError>,
    ) -> bool {
        let reply = match motion_reply(result) {
            Ok(reply) => reply,
            Err(err) => {
                self.report(&ServoError::Gateway(err));
                return false;
            }
        };
        if !reply.echoes(axis) {
            self.report(&ServoError::IntegrityViolation {
                requested: axis,
                reported: reply.axis,
            });
            return false;
        }
        if let Some(error) = reply.device_error() {
            self.report(&ServoError::Device { axis, error });
            return true;
        }

        if reply.status == Some(MotionStatus::Limited) {
            let effective = self.limited_angle(axis, requested, &reply).await;
            info!("servo: {axis} limited by device requested={requested} effective={effective:?}");
            let _ = self.events.send(ClientEvent::ClampNotice {
                axis,
                requested,
                effective,
            });
            // With no usable position the re-polls settle the angle.
            if let Some(angle) = effective {
                self.apply_angle(axis, angle, seq).await;
            }
            return true;
        }
        self.apply_angle(axis, reply.angle.unwrap_or(requested), seq)
            .await;
        true
    }

    /// Where the axis ended up after the device refused part of a move. A
    /// `limited` reply echoes the requested angle; the position it moved to
    /// is only in `physical_angle`.
    async fn limited_angle(&self, axis: Axis, requested: f64, reply: &MotionReply) -> Option<f64> {
        let mut state = self.state.lock().await;
        let track = state.track_mut(axis);
        reply
            .physical_angle
            .and_then(|physical| track.mapping.to_mapped(physical))
            .or_else(|| {
                track
                    .device_range
                    .map(|(low, high)| requested.clamp(low, high))
            })
    }

    async fn schedule_repolls(self: &Arc<Self>, axis: Axis) {
        if self.timing.repoll_offsets.is_empty() {
            return;
        }
        let mut state = self.state.lock().await;
        let generation = {
            let entry = state.repoll_generation.entry(axis).or_insert(0);
            *entry += 1;
            *entry
        };
        let offsets = self.timing.repoll_offsets.clone();
        let coordinator = Arc::clone(self);
        let task = tokio::spawn(async move {
            let start = Instant::now();
            for offset in offsets {
                sleep_until(start + offset).await;
                if coordinator.repoll_generation(axis).await != generation {
                    return;
                }
                coordinator.refresh_angle(axis).await;
            }
        });
        state.repoll_tasks.retain(|task| !task.is_finished());
        state.repoll_tasks.push(task);
    }

    async fn repoll_generation(&self, axis: Axis) -> u64 {
        self.state
            .lock()
            .await
            .repoll_generation
            .get(&axis)
            .copied()
            .unwrap_or(0)
    }

    /// Reads the authoritative angle through the link gate without applying it.
    pub async fn read_angle(&self, axis: Axis) -> Result<AngleReading, ServoError> {
        let link = self.acquire_link().await;
        let seq = self.state.lock().await.issue_seq();
        let result = self.gateway.call(DeviceRequest::get(Endpoint::Motion(axis))).await;
        Self::release_link(link);

        let reply = motion_reply(result)?;
        if !reply.echoes(axis) {
            return Err(ServoError::IntegrityViolation {
                requested: axis,
                reported: reply.axis,
            });
        }
        if let Some(error) = reply.device_error() {
            return Err(ServoError::Device { axis, error });
        }
        let angle = reply.angle.ok_or_else(|| {
            GatewayError::Decode(format!("{axis} position reply carried no angle"))
        })?;
        Ok(AngleReading { axis, angle, seq })
    }

    /// Applies a reading unless a newer one for the same axis already landed.
    pub async fn apply_reading(&self, reading: AngleReading) -> bool {
        self.apply_angle(reading.axis, reading.angle, reading.seq)
            .await
    }

    pub async fn refresh_angle(&self, axis: Axis) {
        match self.read_angle(axis).await {
            Ok(reading) => {
                self.apply_reading(reading).await;
            }
            Err(err) => self.report(&err),
        }
    }

    async fn apply_angle(&self, axis: Axis, angle: f64, seq: u64) -> bool {
        let applied = {
            let mut state = self.state.lock().await;
            let track = state.track_mut(axis);
            if seq <= track.last_applied_seq {
                debug!(
                    "servo: discard stale {axis} angle={angle} seq={seq} newest={}",
                    track.last_applied_seq
                );
                None
            } else {
                track.last_applied_seq = seq;
                track.state.current_angle = track.state.clamp(angle);
                Some(track.state.current_angle)
            }
        };
        match applied {
            Some(angle) => {
                let _ = self.events.send(ClientEvent::AxisUpdated { axis, angle });
                true
            }
            None => false,
        }
    }

    /// Sends new bounds to the device; on success re-clamps the axis and
    /// corrects the commanded position if it fell outside.
    pub async fn set_limits(
        self: &Arc<Self>,
        axis: Axis,
        min: i32,
        max: i32,
    ) -> Result<AxisLimits, ServoError> {
        let limits = AxisLimits::new(min, max)?;
        let link = self.acquire_link().await;
        let result = push_limits(self.gateway.as_ref(), axis, limits).await;
        Self::release_link(link);
        if let Err(err) = result {
            let err = ServoError::Gateway(err);
            self.report(&err);
            return Err(err);
        }

        let correction = {
            let mut state = self.state.lock().await;
            let pending = state.pending.get(&axis).map(|slot| slot.command.target_angle);
            let in_flight = state.in_flight.get(&axis).map(|in_flight| in_flight.target);
            let axis_state = &mut state.track_mut(axis).state;
            let commanded = pending
                .or(in_flight)
                .unwrap_or(axis_state.last_commanded_angle);
            let was_outside = !limits.contains(axis_state.current_angle);
            axis_state.set_limits(limits);
            (was_outside || !limits.contains(commanded)).then(|| limits.clamp(commanded))
        };
        info!("servo: {axis} limits set to [{}, {}]", limits.min, limits.max);
        let _ = self.events.send(ClientEvent::LimitsUpdated { axis, limits });

        if let Some(angle) = correction {
            info!("servo: {axis} commanded position outside new limits, correcting to {angle}");
            self.request_angle(axis, angle).await;
        }
        Ok(limits)
    }

    /// Pulls the device's limits for `axis` and adopts them after adjustment.
    pub async fn load_limits(&self, axis: Axis) -> Result<AxisLimits, ServoError> {
        let link = self.acquire_link().await;
        let result = fetch_limits(self.gateway.as_ref(), axis).await;
        Self::release_link(link);
        let reply = match result {
            Ok(reply) => reply,
            Err(err) => {
                let err = ServoError::Gateway(err);
                self.report(&err);
                return Err(err);
            }
        };
        let limits = self.adjustment.apply(&reply)?;
        {
            let mut state = self.state.lock().await;
            let track = state.track_mut(axis);
            track.device_range = Some((reply.min.min(reply.max), reply.min.max(reply.max)));
            track.state.set_limits(limits);
        }
        let _ = self.events.send(ClientEvent::LimitsUpdated { axis, limits });
        Ok(limits)
    }

    pub fn report(&self, err: &ServoError) {
        let event = match err {
            ServoError::Gateway(err) => {
                warn!("servo: link request failed: {err}");
                ClientEvent::TransportFailure {
                    operation: "servo".to_string(),
                    message: err.to_string(),
                }
            }
            ServoError::Limits(err) => {
                warn!("servo: {err}");
                ClientEvent::Error(err.to_string())
            }
            ServoError::IntegrityViolation {
                requested,
                reported,
            } => {
                warn!("servo: reply for {reported:?} while {requested} was requested; discarded");
                ClientEvent::IntegrityViolation {
                    requested: *requested,
                    reported: reported.clone(),
                }
            }
            ServoError::Device { axis, error } => {
                warn!("servo: {axis} device failure {error}; keeping last known angle");
                ClientEvent::DeviceFailure {
                    axis: *axis,
                    error: error.clone(),
                }
            }
        };
        let _ = self.events.send(event);
    }

    /// Cancels pending throttle dispatches and scheduled re-polls.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        for (_, slot) in state.pending.drain() {
            slot.task.abort();
        }
        for task in state.repoll_tasks.drain(..) {
            task.abort();
        }
    }
}

/// Motion failures come back as HTTP 500 with a JSON body that still carries
/// the axis; those are device replies, not transport failures.
fn motion_reply(
    result: Result<serde_json::Value, GatewayError>,
) -> Result<MotionReply, GatewayError> {
    match result {
        Ok(value) => decode(value),
        Err(GatewayError::Status {
            status,
            body: Some(body),
        }) => match decode::<MotionReply>(body) {
            Ok(reply) if reply.axis.is_some() => Ok(reply),
            _ => Err(GatewayError::Status { status, body: None }),
        },
        Err(err) => Err(err),
    }
}

#[cfg(test)]
#[path = "tests/servo_tests.rs"]
mod tests;

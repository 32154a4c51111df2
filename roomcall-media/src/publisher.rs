//! Local producers: camera, screen share and microphone
//!
//! Each role goes `Idle -> Acquiring -> Active -> Closing -> Idle`. A failed
//! acquisition or negotiation returns to `Idle` without leaving a producer
//! behind. Camera and screen share one local video slot: turning one on
//! closes the other before any capture starts, so the server never holds
//! both.
//!
//! `closeProducer` is issued synchronously but its ack is never awaited on
//! the caller's path. An unresponsive server cannot wedge a toggle or a
//! teardown.

use crate::encoding;
use crate::error::{Result, SessionError};
use crate::events::{SessionEvent, SessionNotice};
use crate::generation::GenerationToken;
use crate::media::{CaptureRequest, MediaDevices, MediaStream, MediaTrack, StreamHandle, TrackState};
use crate::protocol::{MediaKind, RtpCapabilities, StreamRole};
use crate::session::Shared;
use crate::types::ProducerId;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerState {
    Idle,
    Acquiring,
    Active,
    Closing,
}

/// Which source currently feeds local video
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LocalVideoSource {
    #[default]
    None,
    Camera,
    Screen,
}

/// A published local stream
#[derive(Debug)]
pub struct Producer {
    pub id: ProducerId,
    pub role: StreamRole,
    pub kind: MediaKind,
    stream: Arc<MediaStream>,
}

impl Producer {
    #[must_use]
    pub fn handle(&self) -> StreamHandle {
        StreamHandle::new(Arc::clone(&self.stream))
    }

    #[must_use]
    pub fn track(&self) -> Option<&Arc<MediaTrack>> {
        self.stream.track(self.kind)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Acquiring,
    Closing,
}

#[derive(Default)]
struct PublisherState {
    /// Camera or screen, never both
    video: Option<Arc<Producer>>,
    mic: Option<Arc<Producer>>,
    phases: HashMap<StreamRole, Phase>,
}

impl PublisherState {
    fn active(&self, role: StreamRole) -> Option<&Arc<Producer>> {
        let slot = match role {
            StreamRole::Camera | StreamRole::Screen => self.video.as_ref(),
            StreamRole::Mic => self.mic.as_ref(),
        };
        slot.filter(|producer| producer.role == role)
    }

    fn take_active(&mut self, role: StreamRole) -> Option<Arc<Producer>> {
        let slot = match role {
            StreamRole::Camera | StreamRole::Screen => &mut self.video,
            StreamRole::Mic => &mut self.mic,
        };
        if slot.as_ref().is_some_and(|producer| producer.role == role) {
            slot.take()
        } else {
            None
        }
    }

    /// Slot must already be empty: the exclusive role is closed before acquiring
    fn install(&mut self, producer: Arc<Producer>) {
        match producer.role {
            StreamRole::Camera | StreamRole::Screen => self.video = Some(producer),
            StreamRole::Mic => self.mic = Some(producer),
        }
    }

    /// Whether the role sharing this one's slot is mid-transition
    fn exclusive_busy(&self, role: StreamRole) -> bool {
        role.exclusive_with()
            .is_some_and(|other| self.phases.contains_key(&other))
    }

    fn state(&self, role: StreamRole) -> ProducerState {
        match self.phases.get(&role) {
            Some(Phase::Acquiring) => ProducerState::Acquiring,
            Some(Phase::Closing) => ProducerState::Closing,
            None if self.active(role).is_some() => ProducerState::Active,
            None => ProducerState::Idle,
        }
    }
}

pub struct PublisherRegistry {
    shared: Arc<Shared>,
    devices: Arc<dyn MediaDevices>,
    state: Mutex<PublisherState>,
}

impl PublisherRegistry {
    pub(crate) fn new(shared: Arc<Shared>, devices: Arc<dyn MediaDevices>) -> Self {
        Self {
            shared,
            devices,
            state: Mutex::new(PublisherState::default()),
        }
    }

    /// Turn `role` on or off. Returns whether it is enabled afterwards.
    ///
    /// Failures are classified, reported as a notice and returned.
    pub async fn toggle(&self, role: StreamRole) -> Result<bool> {
        let result = self.toggle_inner(role).await;
        if let Err(e) = &result {
            if e.is_reportable() {
                let _ = self.shared.notices.send(SessionNotice::Error(e.clone()));
            }
        }
        result
    }

    async fn toggle_inner(&self, role: StreamRole) -> Result<bool> {
        if self.shared.shutdown.is_cancelled() {
            return Err(SessionError::StaleEvent(format!("toggle {role} after leave")));
        }

        let (existing, displaced) = {
            let mut state = self.state.lock();
            if let Some(phase) = state.phases.get(&role) {
                debug!(role = %role, phase = ?phase, "Toggle ignored while in progress");
                return Ok(false);
            }
            let existing = state.take_active(role);
            if existing.is_some() {
                state.phases.insert(role, Phase::Closing);
                (existing, None)
            } else {
                if state.exclusive_busy(role) {
                    debug!(role = %role, "Toggle ignored while the other video source is in progress");
                    return Ok(false);
                }
                state.phases.insert(role, Phase::Acquiring);
                let displaced = role
                    .exclusive_with()
                    .and_then(|other| state.take_active(other));
                (None, displaced)
            }
        };

        if let Some(producer) = existing {
            self.release(&producer);
            self.state.lock().phases.remove(&role);
            info!(role = %role, producer_id = %producer.id, "Producer closed by toggle");
            return Ok(false);
        }

        if let Some(displaced) = displaced {
            self.release(&displaced);
            info!(
                role = %displaced.role,
                replaced_by = %role,
                producer_id = %displaced.id,
                "Local video source closed for switch"
            );
        }

        let token = self.shared.generation.token();
        let result = self.activate(role, &token).await;
        match result {
            Ok(producer) => {
                let installed = {
                    let mut state = self.state.lock();
                    state.phases.remove(&role);
                    let current = token.is_current();
                    if current {
                        state.install(Arc::clone(&producer));
                    }
                    current
                };
                if !installed {
                    self.release(&producer);
                    return Err(SessionError::StaleEvent(format!(
                        "{role} producer completed after leave"
                    )));
                }
                self.watch_track(&producer);
                self.notify_local(role, Some(producer.handle()));
                info!(role = %role, producer_id = %producer.id, "Producer active");
                Ok(true)
            }
            Err(e) => {
                self.state.lock().phases.remove(&role);
                warn!(role = %role, error = %e, "Toggle on failed");
                Err(e)
            }
        }
    }

    /// Acquire media and negotiate a producer. Nothing is visible to the
    /// rest of the session until this returns `Ok`.
    async fn activate(&self, role: StreamRole, token: &GenerationToken) -> Result<Arc<Producer>> {
        if !self.shared.signaling.is_connected() {
            return Err(SessionError::SignalingUnavailable(format!(
                "cannot publish {role}: not connected"
            )));
        }

        let stream = Arc::new(self.devices.acquire(self.capture_request(role)).await?);

        match self.negotiate(role, &stream, token).await {
            Ok(id) => Ok(Arc::new(Producer {
                id,
                role,
                kind: role.kind(),
                stream,
            })),
            Err(e) => {
                stream.stop_all();
                Err(e)
            }
        }
    }

    async fn negotiate(
        &self,
        role: StreamRole,
        stream: &Arc<MediaStream>,
        token: &GenerationToken,
    ) -> Result<ProducerId> {
        token.check("media acquisition")?;
        let kind = role.kind();
        let track = stream
            .track(kind)
            .ok_or_else(|| SessionError::CaptureFailed(format!("no {kind} track captured")))?;

        let capabilities = self.wait_capabilities().await?;
        if !self.shared.negotiator.can_produce(kind) {
            return Err(SessionError::NegotiationFailure(format!(
                "router cannot receive {kind}"
            )));
        }

        let transport = self.shared.transports.send_transport().await?;
        let options = encoding::send_options(role, &self.shared.config);
        let id = transport.produce(track, role, &options, &capabilities).await?;

        if let Err(e) = token.check("produce") {
            // The server already created it and nobody owns it now
            self.send_close(id);
            return Err(e);
        }
        Ok(id)
    }

    /// Capabilities, waiting for the negotiation if it is still running
    async fn wait_capabilities(&self) -> Result<RtpCapabilities> {
        tokio::select! {
            caps = self.shared.negotiator.wait_loaded() => caps.ok_or_else(|| {
                SessionError::NegotiationFailure("capabilities unavailable".to_string())
            }),
            () = self.shared.shutdown.cancelled() => Err(SessionError::StaleEvent(
                "session left while waiting for capabilities".to_string(),
            )),
        }
    }

    fn capture_request(&self, role: StreamRole) -> CaptureRequest {
        let config = &self.shared.config;
        match role {
            StreamRole::Camera => CaptureRequest::Camera(config.camera.constraints()),
            StreamRole::Screen => CaptureRequest::Display {
                frame_rate: config.screen.frame_rate,
            },
            StreamRole::Mic => CaptureRequest::Microphone(config.mic.constraints()),
        }
    }

    /// Stop the producer's tracks and close it on the server
    fn release(&self, producer: &Producer) {
        let stopped = producer.stream.stop_all();
        debug!(producer_id = %producer.id, stopped, "Local tracks stopped");
        self.send_close(producer.id.clone());
        self.notify_local(producer.role, None);
    }

    /// Issue `closeProducer` now and leave the ack to a tracked task.
    ///
    /// The request goes out on the first poll, so it precedes any
    /// disconnect that follows. Disconnect fails the pending ack, which
    /// lets the task finish.
    fn send_close(&self, producer_id: ProducerId) {
        let signaling = Arc::clone(&self.shared.signaling);
        let mut request = Box::pin(async move {
            if let Err(e) = signaling.close_producer(&producer_id).await {
                debug!(producer_id = %producer_id, error = %e, "closeProducer not acknowledged");
            }
        });
        if (&mut request).now_or_never().is_none() {
            self.shared.tasks.spawn(request);
        }
    }

    /// Forward the track's own termination into the event loop
    fn watch_track(&self, producer: &Producer) {
        let Some(track) = producer.track().cloned() else {
            return;
        };
        let events = self.shared.events.clone();
        let shutdown = self.shared.shutdown.clone();
        let role = producer.role;
        let producer_id = producer.id.clone();

        self.shared.tasks.spawn(async move {
            tokio::select! {
                state = track.ended() => {
                    if state == TrackState::Ended {
                        let _ = events.send(SessionEvent::LocalTrackEnded { role, producer_id });
                    }
                }
                () = shutdown.cancelled() => {}
            }
        });
    }

    /// Reducer for [`SessionEvent::LocalTrackEnded`]
    pub(crate) fn on_local_track_ended(&self, role: StreamRole, producer_id: &ProducerId) {
        let producer = {
            let mut state = self.state.lock();
            if state.active(role).is_some_and(|p| &p.id == producer_id) {
                state.phases.insert(role, Phase::Closing);
                state.take_active(role)
            } else {
                None
            }
        };

        match producer {
            Some(producer) => {
                self.release(&producer);
                self.state.lock().phases.remove(&role);
                info!(role = %role, producer_id = %producer_id, "Producer closed after its track ended");
            }
            None => debug!(role = %role, producer_id = %producer_id, "Track end for inactive producer ignored"),
        }
    }

    /// Close every local producer. Returns how many were active.
    pub(crate) fn close_all(&self) -> usize {
        let producers: Vec<_> = {
            let mut state = self.state.lock();
            state.phases.clear();
            [state.video.take(), state.mic.take()]
                .into_iter()
                .flatten()
                .collect()
        };
        for producer in &producers {
            self.release(producer);
        }
        producers.len()
    }

    fn notify_local(&self, role: StreamRole, stream: Option<StreamHandle>) {
        let _ = self
            .shared
            .notices
            .send(SessionNotice::LocalStreamChanged { role, stream });
    }

    #[must_use]
    pub fn state(&self, role: StreamRole) -> ProducerState {
        self.state.lock().state(role)
    }

    #[must_use]
    pub fn is_enabled(&self, role: StreamRole) -> bool {
        self.state.lock().active(role).is_some()
    }

    #[must_use]
    pub fn local_video_source(&self) -> LocalVideoSource {
        match self.state.lock().video.as_ref().map(|p| p.role) {
            Some(StreamRole::Camera) => LocalVideoSource::Camera,
            Some(StreamRole::Screen) => LocalVideoSource::Screen,
            _ => LocalVideoSource::None,
        }
    }

    #[must_use]
    pub fn producer_id(&self, role: StreamRole) -> Option<ProducerId> {
        self.state.lock().active(role).map(|p| p.id.clone())
    }

    #[must_use]
    pub fn local_stream(&self, role: StreamRole) -> Option<StreamHandle> {
        self.state.lock().active(role).map(|p| p.handle())
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        let state = self.state.lock();
        usize::from(state.video.is_some()) + usize::from(state.mic.is_some())
    }
}

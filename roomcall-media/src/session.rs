//! Session lifecycle: join, event dispatch and teardown
//!
//! A [`Session`] owns every component for the duration of one room visit.
//! All inbound events (server pushes, retry timers, track terminations,
//! device changes) are funneled into a single loop and applied in receipt
//! order. Leaving bumps the generation first, so anything still in flight
//! from before the leave discards itself when it completes.

use crate::capabilities::CapabilityNegotiator;
use crate::config::SessionConfig;
use crate::engine::MediaEngine;
use crate::error::{Result, SessionError};
use crate::events::{EventSender, NoticeSender, SessionEvent, SessionNotice};
use crate::generation::{Generation, GenerationToken};
use crate::media::{DeviceInfo, MediaDevices, StreamHandle};
use crate::protocol::StreamRole;
use crate::publisher::{LocalVideoSource, ProducerState, PublisherRegistry};
use crate::scheduler::{Scheduler, TokioScheduler};
use crate::signaling::{SignalingChannel, SignalingEvent};
use crate::subscriber::{ConsumerState, RemoteStreamInfo, SubscriberRegistry};
use crate::transport::{ConnectionState, TransportDirection, TransportManager};
use crate::types::{ProducerId, RoomId};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Dependencies shared by the registries of one session
pub(crate) struct Shared {
    pub config: Arc<SessionConfig>,
    pub signaling: Arc<dyn SignalingChannel>,
    pub negotiator: Arc<CapabilityNegotiator>,
    pub transports: Arc<TransportManager>,
    pub generation: Generation,
    pub shutdown: CancellationToken,
    pub tasks: TaskTracker,
    pub events: EventSender,
    pub notices: NoticeSender,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Joining,
    Joined,
    Leaving,
    Closed,
}

/// External collaborators a session runs against
pub struct Backends {
    pub signaling: Arc<dyn SignalingChannel>,
    pub devices: Arc<dyn MediaDevices>,
    pub engine: Arc<dyn MediaEngine>,
    pub scheduler: Arc<dyn Scheduler>,
}

impl Backends {
    /// Backends driven by tokio timers
    pub fn new(
        signaling: Arc<dyn SignalingChannel>,
        devices: Arc<dyn MediaDevices>,
        engine: Arc<dyn MediaEngine>,
    ) -> Self {
        Self {
            signaling,
            devices,
            engine,
            scheduler: Arc::new(TokioScheduler::new()),
        }
    }

    #[must_use]
    pub fn with_scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }
}

/// Local streams by role, for the rendering layer
#[derive(Debug, Clone, Default)]
pub struct LocalStreams {
    pub camera: Option<StreamHandle>,
    pub screen: Option<StreamHandle>,
    pub mic: Option<StreamHandle>,
}

/// Point-in-time session statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    pub state: SessionState,
    pub joined_at: Option<DateTime<Utc>>,
    /// Teardowns so far
    pub generation: u64,
    /// Local producers currently published
    pub active_producers: usize,
    pub active_consumers: usize,
    /// Consumes waiting for a retry timer
    pub pending_consumes: usize,
    pub closed_consumers: usize,
    pub abandoned_consumers: usize,
    /// Remote video streams exposed to the renderer
    pub remote_streams: usize,
    pub send_transport_connected: bool,
    pub recv_transport_connected: bool,
}

pub struct Session {
    room_id: RoomId,
    shared: Arc<Shared>,
    engine: Arc<dyn MediaEngine>,
    devices: Arc<dyn MediaDevices>,
    publisher: Arc<PublisherRegistry>,
    subscriber: Arc<SubscriberRegistry>,
    state: RwLock<SessionState>,
    joined_at: RwLock<Option<DateTime<Utc>>>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<SessionEvent>>>,
    notices_rx: Mutex<Option<mpsc::UnboundedReceiver<SessionNotice>>>,
}

impl Session {
    pub fn new(room_id: impl Into<RoomId>, config: SessionConfig, backends: Backends) -> Arc<Self> {
        let Backends {
            signaling,
            devices,
            engine,
            scheduler,
        } = backends;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (notices_tx, notices_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            config: Arc::new(config),
            transports: Arc::new(TransportManager::new(
                Arc::clone(&signaling),
                Arc::clone(&engine),
            )),
            signaling,
            negotiator: Arc::new(CapabilityNegotiator::new()),
            generation: Generation::new(),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
            events: events_tx,
            notices: notices_tx,
        });

        Arc::new(Self {
            room_id: room_id.into(),
            publisher: Arc::new(PublisherRegistry::new(
                Arc::clone(&shared),
                Arc::clone(&devices),
            )),
            subscriber: Arc::new(SubscriberRegistry::new(Arc::clone(&shared), scheduler)),
            shared,
            engine,
            devices,
            state: RwLock::new(SessionState::Idle),
            joined_at: RwLock::new(None),
            events_rx: Mutex::new(Some(events_rx)),
            notices_rx: Mutex::new(Some(notices_rx)),
        })
    }

    /// Enter the room.
    ///
    /// On failure the session is left (nothing stays half-open), the error
    /// is reported as a notice and returned. A failure caused by a leave
    /// that ran meanwhile comes back as [`SessionError::StaleEvent`] and is
    /// not reported.
    pub async fn join(self: &Arc<Self>) -> Result<()> {
        {
            let mut state = self.state.write();
            if *state != SessionState::Idle {
                return Err(SessionError::StaleEvent(format!(
                    "join while {:?}",
                    *state
                )));
            }
            *state = SessionState::Joining;
        }

        info!(room_id = %self.room_id, "Joining room");
        let token = self.shared.generation.token();
        match self.join_inner(&token).await {
            Ok(()) => Ok(()),
            Err(e) if !token.is_current() => {
                debug!(room_id = %self.room_id, error = %e, "Join abandoned by leave");
                Err(SessionError::StaleEvent(format!("left while joining: {e}")))
            }
            Err(e) => {
                warn!(room_id = %self.room_id, error = %e, "Join failed");
                if e.is_reportable() {
                    let _ = self.shared.notices.send(SessionNotice::Error(e.clone()));
                }
                self.leave().await;
                Err(e)
            }
        }
    }

    async fn join_inner(self: &Arc<Self>, token: &GenerationToken) -> Result<()> {
        let signaling = &self.shared.signaling;

        signaling.connect().await?;
        let router = signaling.join_room(&self.room_id).await?;
        token.check("joinRoom")?;

        self.shared
            .negotiator
            .load(&router, &self.engine.native_capabilities())?;

        // Eager, so consumes can start as soon as producers show up
        self.shared.transports.recv_transport().await?;

        // Taken before the snapshot so nothing pushed meanwhile is lost
        let pushed = signaling.subscribe();
        let device_changes = self.devices.device_changes();

        let existing = signaling.existing_producers().await?;
        token.check("getExistingProducers")?;

        debug!(room_id = %self.room_id, count = existing.len(), "Existing producers");
        for info in existing {
            self.subscriber.on_new_producer(info);
        }

        let events = self.events_rx.lock().take().ok_or_else(|| {
            SessionError::StaleEvent("event loop already started".to_string())
        })?;
        self.shared.tasks.spawn(run_event_loop(
            Arc::downgrade(self),
            events,
            pushed,
            device_changes,
            self.shared.shutdown.clone(),
        ));

        {
            let mut state = self.state.write();
            if *state != SessionState::Joining {
                return Err(SessionError::StaleEvent("left while joining".to_string()));
            }
            *state = SessionState::Joined;
        }
        *self.joined_at.write() = Some(Utc::now());
        info!(room_id = %self.room_id, "Joined room");
        Ok(())
    }

    /// Apply one inbound event
    async fn dispatch(&self, event: SessionEvent) {
        match event {
            SessionEvent::NewProducer(info) => self.subscriber.on_new_producer(info),
            SessionEvent::ProducerClosed(producer_id) => {
                self.subscriber.on_producer_closed(&producer_id);
            }
            SessionEvent::RetryConsume {
                producer_id,
                generation,
            } => self.subscriber.on_retry(&producer_id, generation),
            SessionEvent::LocalTrackEnded { role, producer_id } => {
                self.publisher.on_local_track_ended(role, &producer_id);
            }
            SessionEvent::RemoteTrackEnded {
                producer_id,
                consumer_id,
            } => self
                .subscriber
                .on_remote_track_ended(&producer_id, &consumer_id),
            SessionEvent::DevicesChanged(devices) => self.on_devices_changed(devices),
            SessionEvent::SignalingLost => {
                warn!(room_id = %self.room_id, "Signaling connection lost");
                let _ = self.shared.notices.send(SessionNotice::SignalingLost);
            }
        }
    }

    fn on_devices_changed(&self, devices: Vec<DeviceInfo>) {
        if self.state() != SessionState::Joined {
            return;
        }
        debug!(room_id = %self.room_id, devices = devices.len(), "Media devices changed");
        let _ = self
            .shared
            .notices
            .send(SessionNotice::DevicesChanged(devices));
    }

    /// Tear the session down. Safe to call more than once.
    pub async fn leave(&self) {
        {
            let mut state = self.state.write();
            if matches!(*state, SessionState::Leaving | SessionState::Closed) {
                return;
            }
            *state = SessionState::Leaving;
        }

        let generation = self.shared.generation.bump();
        self.shared.shutdown.cancel();

        let timers = self.subscriber.teardown();
        let transports = self.shared.transports.close_all();
        let producers = self.publisher.close_all();
        self.shared.signaling.disconnect().await;

        self.shared.tasks.close();
        self.shared.tasks.wait().await;

        *self.state.write() = SessionState::Closed;
        info!(
            room_id = %self.room_id,
            generation,
            timers,
            transports,
            producers,
            "Left room"
        );
    }

    pub async fn toggle_camera(&self) -> Result<bool> {
        self.publisher.toggle(StreamRole::Camera).await
    }

    pub async fn toggle_screen(&self) -> Result<bool> {
        self.publisher.toggle(StreamRole::Screen).await
    }

    pub async fn toggle_mic(&self) -> Result<bool> {
        self.publisher.toggle(StreamRole::Mic).await
    }

    #[must_use]
    pub fn cam_enabled(&self) -> bool {
        self.publisher.is_enabled(StreamRole::Camera)
    }

    #[must_use]
    pub fn screen_enabled(&self) -> bool {
        self.publisher.is_enabled(StreamRole::Screen)
    }

    #[must_use]
    pub fn mic_enabled(&self) -> bool {
        self.publisher.is_enabled(StreamRole::Mic)
    }

    #[must_use]
    pub fn local_video_source(&self) -> LocalVideoSource {
        self.publisher.local_video_source()
    }

    #[must_use]
    pub fn local_streams(&self) -> LocalStreams {
        LocalStreams {
            camera: self.publisher.local_stream(StreamRole::Camera),
            screen: self.publisher.local_stream(StreamRole::Screen),
            mic: self.publisher.local_stream(StreamRole::Mic),
        }
    }

    #[must_use]
    pub fn remote_streams(&self) -> Vec<RemoteStreamInfo> {
        self.subscriber.remote_streams()
    }

    #[must_use]
    pub fn remote_audio(&self, producer_id: &ProducerId) -> Option<StreamHandle> {
        self.subscriber.audio_sink(producer_id)
    }

    #[must_use]
    pub fn producer_state(&self, role: StreamRole) -> ProducerState {
        self.publisher.state(role)
    }

    #[must_use]
    pub fn consumer_state(&self, producer_id: &ProducerId) -> Option<ConsumerState> {
        self.subscriber.consumer_state(producer_id)
    }

    /// Take the notice stream. Only the first call gets it.
    pub fn take_notices(&self) -> Option<mpsc::UnboundedReceiver<SessionNotice>> {
        self.notices_rx.lock().take()
    }

    #[must_use]
    pub const fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    #[must_use]
    pub fn capabilities_loaded(&self) -> bool {
        self.shared.negotiator.is_loaded()
    }

    #[must_use]
    pub fn stats(&self) -> SessionStats {
        let connected = |direction| {
            self.shared
                .transports
                .get(direction)
                .is_some_and(|t| t.state() == ConnectionState::Connected)
        };
        let (closed_consumers, abandoned_consumers) = self.subscriber.finished_counts();

        SessionStats {
            state: self.state(),
            joined_at: *self.joined_at.read(),
            generation: self.shared.generation.current(),
            active_producers: self.publisher.active_count(),
            active_consumers: self.subscriber.active_count(),
            pending_consumes: self.subscriber.pending_count(),
            closed_consumers,
            abandoned_consumers,
            remote_streams: self.subscriber.remote_streams().len(),
            send_transport_connected: connected(TransportDirection::Send),
            recv_transport_connected: connected(TransportDirection::Recv),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if matches!(*self.state.read(), SessionState::Closed | SessionState::Idle) {
            return;
        }

        // Dropped without leave: do the synchronous part now
        self.shared.generation.bump();
        self.shared.shutdown.cancel();
        let timers = self.subscriber.teardown();
        self.shared.transports.close_all();

        // Closing producers spawns the ack waits, which needs a runtime
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            self.publisher.close_all();
            let signaling = Arc::clone(&self.shared.signaling);
            runtime.spawn(async move { signaling.disconnect().await });
        }
        debug!(room_id = %self.room_id, timers, "Session dropped without leave");
    }
}

/// Receive from an optional stream, pending forever when there is none
async fn recv_from<T>(rx: &mut Option<mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn run_event_loop(
    session: Weak<Session>,
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
    mut pushed: Option<mpsc::UnboundedReceiver<SignalingEvent>>,
    mut device_changes: Option<mpsc::UnboundedReceiver<Vec<DeviceInfo>>>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            () = shutdown.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
            event = recv_from(&mut pushed) => match event {
                Some(event) => SessionEvent::from(event),
                None => {
                    pushed = None;
                    SessionEvent::SignalingLost
                }
            },
            devices = recv_from(&mut device_changes) => match devices {
                Some(devices) => SessionEvent::DevicesChanged(devices),
                None => {
                    device_changes = None;
                    continue;
                }
            },
        };

        let Some(session) = session.upgrade() else {
            break;
        };
        session.dispatch(event).await;
    }
    debug!("Session event loop stopped");
}

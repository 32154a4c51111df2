//! Scripted fakes of the signaling server, capture devices and media engine

use crate::capabilities::CapabilityNegotiator;
use crate::config::SessionConfig;
use crate::engine::{MediaEngine, SendOptions};
use crate::error::{Result, SessionError};
use crate::events::{SessionEvent, SessionNotice};
use crate::generation::Generation;
use crate::media::{AcquireError, CaptureRequest, DeviceInfo, MediaDevices, MediaStream, MediaTrack};
use crate::protocol::{
    AppData, ConsumerParams, DtlsFingerprint, DtlsParameters, MediaKind, ProducerInfo,
    RtpCapabilities, RtpCodecCapability, RtpCodecParameters, RtpParameters, StreamRole,
    TransportParams,
};
use crate::scheduler::ManualScheduler;
use crate::session::Shared;
use crate::signaling::{SignalingChannel, SignalingEvent};
use crate::transport::{TransportDirection, TransportManager};
use crate::types::{ConsumerId, PeerId, ProducerId, RoomId, TransportId};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

pub fn codec(kind: MediaKind, mime: &str, clock_rate: u32) -> RtpCodecCapability {
    RtpCodecCapability {
        kind,
        mime_type: mime.to_string(),
        clock_rate,
        channels: (kind == MediaKind::Audio).then_some(2),
        preferred_payload_type: None,
        parameters: Value::Null,
        rtcp_feedback: vec![],
    }
}

pub fn router_capabilities() -> RtpCapabilities {
    RtpCapabilities {
        codecs: vec![
            codec(MediaKind::Audio, "audio/opus", 48000),
            codec(MediaKind::Video, "video/VP8", 90000),
            codec(MediaKind::Video, "video/H264", 90000),
        ],
        header_extensions: vec![],
    }
}

pub fn producer_info(id: &str, role: StreamRole, peer: &str) -> ProducerInfo {
    ProducerInfo {
        producer_id: ProducerId::from(id),
        kind: role.kind(),
        app_data: AppData { role },
        socket_id: PeerId::from(peer),
    }
}

/// Recorded signaling request
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Connect,
    JoinRoom(RoomId),
    CreateTransport(TransportDirection),
    ConnectTransport(TransportDirection, TransportId),
    Produce { role: StreamRole, layers: usize },
    Consume(ProducerId),
    CloseProducer(ProducerId),
    ExistingProducers,
    Disconnect,
}

/// In-memory SFU signaling server
pub struct FakeSignaling {
    connected: AtomicBool,
    next_id: AtomicU64,
    router: RtpCapabilities,
    existing: Mutex<Vec<ProducerInfo>>,
    kinds: Mutex<HashMap<ProducerId, MediaKind>>,
    journal: Mutex<Vec<Call>>,
    failing: Mutex<HashSet<&'static str>>,
    declined: Mutex<HashSet<ProducerId>>,
    consume_gates: Mutex<HashMap<ProducerId, oneshot::Receiver<()>>>,
    events_tx: mpsc::UnboundedSender<SignalingEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<SignalingEvent>>>,
}

impl FakeSignaling {
    pub fn new() -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            connected: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            router: router_capabilities(),
            existing: Mutex::new(Vec::new()),
            kinds: Mutex::new(HashMap::new()),
            journal: Mutex::new(Vec::new()),
            failing: Mutex::new(HashSet::new()),
            declined: Mutex::new(HashSet::new()),
            consume_gates: Mutex::new(HashMap::new()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        })
    }

    /// Connected without going through `connect`
    pub fn connected() -> Arc<Self> {
        let fake = Self::new();
        fake.set_connected(true);
        fake
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Make the server aware of a remote producer
    pub fn register(&self, info: &ProducerInfo) {
        self.kinds.lock().insert(info.producer_id.clone(), info.kind);
    }

    /// Register a producer that is already in the room when joining
    pub fn add_existing(&self, info: ProducerInfo) {
        self.register(&info);
        self.existing.lock().push(info);
    }

    /// Register and push a `newProducer` event
    pub fn announce(&self, info: ProducerInfo) {
        self.register(&info);
        let _ = self.events_tx.send(SignalingEvent::NewProducer(info));
    }

    pub fn push(&self, event: SignalingEvent) {
        let _ = self.events_tx.send(event);
    }

    /// Reject the next requests of the named operation
    pub fn fail(&self, op: &'static str) {
        self.failing.lock().insert(op);
    }

    pub fn recover(&self, op: &'static str) {
        self.failing.lock().remove(op);
    }

    /// Answer `consume` for this producer with `null`
    pub fn decline(&self, producer_id: &str) {
        self.declined.lock().insert(ProducerId::from(producer_id));
    }

    /// Hold the `consume` answer for this producer until the sender fires
    pub fn hold_consume(&self, producer_id: &str) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.consume_gates
            .lock()
            .insert(ProducerId::from(producer_id), rx);
        tx
    }

    pub fn calls(&self) -> Vec<Call> {
        self.journal.lock().clone()
    }

    pub fn count(&self, matches: impl Fn(&Call) -> bool) -> usize {
        self.journal.lock().iter().filter(|call| matches(call)).count()
    }

    fn record(&self, call: Call) {
        self.journal.lock().push(call);
    }

    fn next(&self, prefix: &str) -> String {
        format!("{prefix}-{}", self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn check(&self, op: &'static str) -> Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(SessionError::SignalingUnavailable(format!("{op}: offline")));
        }
        if self.failing.lock().contains(op) {
            return Err(SessionError::NegotiationFailure(format!("{op}: rejected")));
        }
        Ok(())
    }
}

#[async_trait]
impl SignalingChannel for FakeSignaling {
    async fn connect(&self) -> Result<()> {
        self.record(Call::Connect);
        self.set_connected(true);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn join_room(&self, room_id: &RoomId) -> Result<RtpCapabilities> {
        self.record(Call::JoinRoom(room_id.clone()));
        self.check("joinRoom")?;
        Ok(self.router.clone())
    }

    async fn create_transport(&self, direction: TransportDirection) -> Result<TransportParams> {
        self.record(Call::CreateTransport(direction));
        tokio::task::yield_now().await;
        self.check("createTransport")?;
        Ok(TransportParams {
            id: TransportId::new(self.next(&direction.to_string())),
            ice_parameters: json!({ "usernameFragment": "frag", "password": "pwd" }),
            ice_candidates: vec![json!({ "ip": "127.0.0.1", "port": 40000 })],
            dtls_parameters: DtlsParameters {
                role: Some("auto".into()),
                fingerprints: vec![],
            },
        })
    }

    async fn connect_transport(
        &self,
        direction: TransportDirection,
        transport_id: &TransportId,
        _dtls_parameters: &DtlsParameters,
    ) -> Result<()> {
        self.record(Call::ConnectTransport(direction, transport_id.clone()));
        self.check("transportConnect")
    }

    async fn produce(
        &self,
        _transport_id: &TransportId,
        _kind: MediaKind,
        rtp_parameters: &RtpParameters,
        app_data: AppData,
    ) -> Result<ProducerId> {
        self.record(Call::Produce {
            role: app_data.role,
            layers: rtp_parameters.encodings.len(),
        });
        self.check("transportProduce")?;
        Ok(ProducerId::new(self.next("local")))
    }

    async fn consume(
        &self,
        producer_id: &ProducerId,
        _capabilities: &RtpCapabilities,
    ) -> Result<Option<ConsumerParams>> {
        self.record(Call::Consume(producer_id.clone()));
        let gate = self.consume_gates.lock().remove(producer_id);
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        self.check("consume")?;
        if self.declined.lock().contains(producer_id) {
            return Ok(None);
        }
        let kind = self
            .kinds
            .lock()
            .get(producer_id)
            .copied()
            .unwrap_or(MediaKind::Video);
        Ok(Some(ConsumerParams {
            id: ConsumerId::new(self.next("consumer")),
            producer_id: producer_id.clone(),
            kind,
            rtp_parameters: RtpParameters::default(),
        }))
    }

    async fn close_producer(&self, producer_id: &ProducerId) -> Result<()> {
        self.record(Call::CloseProducer(producer_id.clone()));
        self.check("closeProducer")
    }

    async fn existing_producers(&self) -> Result<Vec<ProducerInfo>> {
        self.record(Call::ExistingProducers);
        self.check("getExistingProducers")?;
        Ok(self.existing.lock().clone())
    }

    fn subscribe(&self) -> Option<mpsc::UnboundedReceiver<SignalingEvent>> {
        self.events_rx.lock().take()
    }

    async fn disconnect(&self) {
        self.record(Call::Disconnect);
        self.set_connected(false);
    }
}

/// Capture devices that hand out fresh tracks
pub struct FakeDevices {
    failures: Mutex<VecDeque<AcquireError>>,
    gate: Mutex<Option<oneshot::Receiver<()>>>,
    captured: Mutex<Vec<(CaptureRequest, Arc<MediaTrack>)>>,
    changes_tx: mpsc::UnboundedSender<Vec<DeviceInfo>>,
    changes_rx: Mutex<Option<mpsc::UnboundedReceiver<Vec<DeviceInfo>>>>,
}

impl FakeDevices {
    pub fn new() -> Arc<Self> {
        let (changes_tx, changes_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            failures: Mutex::new(VecDeque::new()),
            gate: Mutex::new(None),
            captured: Mutex::new(Vec::new()),
            changes_tx,
            changes_rx: Mutex::new(Some(changes_rx)),
        })
    }

    pub fn fail_next(&self, error: AcquireError) {
        self.failures.lock().push_back(error);
    }

    /// Hold the next acquisition (a pending permission prompt)
    pub fn hold_next(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.gate.lock() = Some(rx);
        tx
    }

    pub fn requests(&self) -> Vec<CaptureRequest> {
        self.captured.lock().iter().map(|(req, _)| *req).collect()
    }

    pub fn tracks(&self) -> Vec<Arc<MediaTrack>> {
        self.captured.lock().iter().map(|(_, t)| Arc::clone(t)).collect()
    }

    pub fn last_track(&self) -> Option<Arc<MediaTrack>> {
        self.captured.lock().last().map(|(_, t)| Arc::clone(t))
    }

    pub fn plug(&self, devices: Vec<DeviceInfo>) {
        let _ = self.changes_tx.send(devices);
    }
}

#[async_trait]
impl MediaDevices for FakeDevices {
    async fn acquire(&self, request: CaptureRequest) -> std::result::Result<MediaStream, AcquireError> {
        let gate = self.gate.lock().take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        if let Some(error) = self.failures.lock().pop_front() {
            return Err(error);
        }
        let label = match request {
            CaptureRequest::Camera(_) => "camera",
            CaptureRequest::Display { .. } => "screen",
            CaptureRequest::Microphone(_) => "mic",
        };
        let track = MediaTrack::new(request.kind(), label);
        self.captured.lock().push((request, Arc::clone(&track)));
        Ok(MediaStream::new(vec![track]))
    }

    fn device_changes(&self) -> Option<mpsc::UnboundedReceiver<Vec<DeviceInfo>>> {
        self.changes_rx.lock().take()
    }
}

/// Media engine supporting Opus and VP8
pub struct FakeEngine {
    received: Mutex<HashMap<ProducerId, Arc<MediaTrack>>>,
}

impl FakeEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            received: Mutex::new(HashMap::new()),
        })
    }

    /// Track created for a consumed producer
    pub fn remote_track(&self, producer_id: &str) -> Option<Arc<MediaTrack>> {
        self.received.lock().get(&ProducerId::from(producer_id)).cloned()
    }
}

impl MediaEngine for FakeEngine {
    fn native_capabilities(&self) -> RtpCapabilities {
        RtpCapabilities {
            codecs: vec![
                codec(MediaKind::Audio, "audio/opus", 48000),
                codec(MediaKind::Video, "video/VP8", 90000),
            ],
            header_extensions: vec![],
        }
    }

    fn dtls_parameters(
        &self,
        _direction: TransportDirection,
        _remote: &TransportParams,
    ) -> Result<DtlsParameters> {
        Ok(DtlsParameters {
            role: Some("client".into()),
            fingerprints: vec![DtlsFingerprint {
                algorithm: "sha-256".into(),
                value: "AA:BB".into(),
            }],
        })
    }

    fn send_parameters(
        &self,
        track: &MediaTrack,
        options: &SendOptions,
        capabilities: &RtpCapabilities,
    ) -> Result<RtpParameters> {
        let codec = capabilities
            .codecs
            .iter()
            .find(|codec| codec.kind == track.kind())
            .ok_or_else(|| SessionError::NegotiationFailure("no codec".into()))?;
        Ok(RtpParameters {
            mid: None,
            codecs: vec![RtpCodecParameters {
                mime_type: codec.mime_type.clone(),
                payload_type: 100,
                clock_rate: codec.clock_rate,
                channels: codec.channels,
                parameters: Value::Null,
            }],
            encodings: options.encodings.clone(),
            header_extensions: vec![],
        })
    }

    fn receive(&self, params: &ConsumerParams) -> Result<Arc<MediaStream>> {
        let track = MediaTrack::new(params.kind, params.producer_id.as_str());
        self.received
            .lock()
            .insert(params.producer_id.clone(), Arc::clone(&track));
        Ok(Arc::new(MediaStream::new(vec![track])))
    }
}

/// Session internals wired to fakes, with capabilities not yet loaded
pub struct Rig {
    pub shared: Arc<Shared>,
    pub signaling: Arc<FakeSignaling>,
    pub devices: Arc<FakeDevices>,
    pub engine: Arc<FakeEngine>,
    pub scheduler: Arc<ManualScheduler>,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
    pub notices: mpsc::UnboundedReceiver<SessionNotice>,
}

impl Rig {
    pub fn new() -> Self {
        let signaling = FakeSignaling::connected();
        let engine = FakeEngine::new();
        let (events_tx, events) = mpsc::unbounded_channel();
        let (notices_tx, notices) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            config: Arc::new(SessionConfig::default()),
            signaling: signaling.clone(),
            negotiator: Arc::new(CapabilityNegotiator::new()),
            transports: Arc::new(TransportManager::new(signaling.clone(), engine.clone())),
            generation: Generation::new(),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
            events: events_tx,
            notices: notices_tx,
        });

        Self {
            shared,
            signaling,
            devices: FakeDevices::new(),
            engine,
            scheduler: ManualScheduler::new(),
            events,
            notices,
        }
    }

    pub fn load_capabilities(&self) {
        self.shared
            .negotiator
            .load(&router_capabilities(), &self.engine.native_capabilities())
            .unwrap();
    }

    pub fn drain_notices(&mut self) -> Vec<SessionNotice> {
        let mut notices = Vec::new();
        while let Ok(notice) = self.notices.try_recv() {
            notices.push(notice);
        }
        notices
    }
}

/// Let spawned continuations run until they block. Needs a paused clock.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

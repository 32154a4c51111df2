//! Signaling channel to the SFU
//!
//! [`SignalingChannel`] is the request/response and push contract the
//! session core depends on. [`SocketSignaling`] implements it over a pair
//! of text frame queues carrying JSON:
//!
//! - request: `{"id": 7, "event": "consume", "data": {...}}`
//! - answer:  `{"ack": 7, "data": {...}}` or `{"ack": 7, "error": "..."}`
//! - push:    `{"event": "newProducer", "data": {...}}`
//!
//! The host owns the actual socket and pumps frames in and out.

use crate::error::{Result, SessionError};
use crate::protocol::{
    AppData, ConsumerParams, DtlsParameters, MediaKind, ProducerInfo, RtpCapabilities,
    RtpParameters, TransportParams,
};
use crate::transport::TransportDirection;
use crate::types::{ProducerId, RoomId, TransportId};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Server-pushed lifecycle event
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    NewProducer(ProducerInfo),
    ProducerClosed(ProducerId),
    /// The underlying connection went away
    Disconnected,
}

#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Open the connection. Calling it again while connected is a no-op.
    async fn connect(&self) -> Result<()>;

    fn is_connected(&self) -> bool;

    async fn join_room(&self, room_id: &RoomId) -> Result<RtpCapabilities>;

    async fn create_transport(&self, direction: TransportDirection) -> Result<TransportParams>;

    async fn connect_transport(
        &self,
        direction: TransportDirection,
        transport_id: &TransportId,
        dtls_parameters: &DtlsParameters,
    ) -> Result<()>;

    async fn produce(
        &self,
        transport_id: &TransportId,
        kind: MediaKind,
        rtp_parameters: &RtpParameters,
        app_data: AppData,
    ) -> Result<ProducerId>;

    /// `None` when the server declines (e.g. the producer is already gone)
    async fn consume(
        &self,
        producer_id: &ProducerId,
        capabilities: &RtpCapabilities,
    ) -> Result<Option<ConsumerParams>>;

    /// Must send the request on the first poll. Callers may stop polling
    /// once it is out and never see the ack.
    async fn close_producer(&self, producer_id: &ProducerId) -> Result<()>;

    async fn existing_producers(&self) -> Result<Vec<ProducerInfo>>;

    /// Take the stream of pushed events. Only the first call gets it.
    fn subscribe(&self) -> Option<mpsc::UnboundedReceiver<SignalingEvent>>;

    /// Close the connection. No request may be issued afterwards.
    async fn disconnect(&self);
}

#[derive(Serialize)]
struct RequestFrame<'a> {
    id: u64,
    event: &'a str,
    data: Value,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum InboundFrame {
    Ack(AckFrame),
    Push(PushFrame),
}

#[derive(Debug, Deserialize)]
struct AckFrame {
    ack: u64,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
enum PushFrame {
    NewProducer(ProducerInfo),
    ProducerClosed(ProducerClosedPayload),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProducerClosedPayload {
    producer_id: ProducerId,
}

#[derive(Deserialize)]
struct ProduceAnswer {
    id: ProducerId,
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T> {
    Ok(serde_json::from_value(value)?)
}

type PendingMap = DashMap<u64, oneshot::Sender<AckFrame>>;

/// [`SignalingChannel`] over JSON text frames
pub struct SocketSignaling {
    outbound: mpsc::UnboundedSender<String>,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    pending: Arc<PendingMap>,
    next_id: AtomicU64,
    connected: Arc<AtomicBool>,
    events_tx: mpsc::UnboundedSender<SignalingEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<SignalingEvent>>>,
    shutdown: CancellationToken,
}

impl SocketSignaling {
    /// Build a channel over the host's frame queues
    #[must_use]
    pub fn new(
        outbound: mpsc::UnboundedSender<String>,
        inbound: mpsc::UnboundedReceiver<String>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            outbound,
            inbound: Mutex::new(Some(inbound)),
            pending: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
            connected: Arc::new(AtomicBool::new(false)),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            shutdown: CancellationToken::new(),
        }
    }

    /// Number of requests awaiting an answer
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    async fn request(&self, event: &str, data: Value) -> Result<Value> {
        if !self.is_connected() {
            return Err(SessionError::SignalingUnavailable(format!(
                "cannot send {event}: not connected"
            )));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        let frame = serde_json::to_string(&RequestFrame { id, event, data })?;
        if self.outbound.send(frame).is_err() {
            self.pending.remove(&id);
            self.mark_disconnected();
            return Err(SessionError::SignalingUnavailable(format!(
                "cannot send {event}: socket closed"
            )));
        }

        debug!(request_id = id, event, "Signaling request sent");

        // No deadline: an unresponsive server holds the caller until disconnect
        let ack = rx.await.map_err(|_| {
            SessionError::SignalingUnavailable(format!("connection lost while awaiting {event}"))
        })?;

        match ack.error {
            Some(message) => {
                warn!(request_id = id, event, error = %message, "Signaling request rejected");
                Err(SessionError::NegotiationFailure(format!("{event}: {message}")))
            }
            None => Ok(ack.data),
        }
    }

    fn mark_disconnected(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.pending.clear();
            let _ = self.events_tx.send(SignalingEvent::Disconnected);
        }
    }

    fn route_frame(
        frame: &str,
        pending: &PendingMap,
        events: &mpsc::UnboundedSender<SignalingEvent>,
    ) {
        match serde_json::from_str::<InboundFrame>(frame) {
            Ok(InboundFrame::Ack(ack)) => match pending.remove(&ack.ack) {
                Some((_, waiter)) => {
                    let _ = waiter.send(ack);
                }
                None => debug!(request_id = ack.ack, "Answer for unknown request dropped"),
            },
            Ok(InboundFrame::Push(PushFrame::NewProducer(info))) => {
                let _ = events.send(SignalingEvent::NewProducer(info));
            }
            Ok(InboundFrame::Push(PushFrame::ProducerClosed(payload))) => {
                let _ = events.send(SignalingEvent::ProducerClosed(payload.producer_id));
            }
            Err(e) => debug!(error = %e, "Unrecognized signaling frame dropped"),
        }
    }
}

#[async_trait]
impl SignalingChannel for SocketSignaling {
    async fn connect(&self) -> Result<()> {
        let Some(mut inbound) = self.inbound.lock().take() else {
            return if self.is_connected() {
                Ok(())
            } else {
                Err(SessionError::SignalingUnavailable(
                    "signaling connection already closed".to_string(),
                ))
            };
        };

        self.connected.store(true, Ordering::SeqCst);

        let pending = Arc::clone(&self.pending);
        let connected = Arc::clone(&self.connected);
        let events = self.events_tx.clone();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    frame = inbound.recv() => match frame {
                        Some(frame) => Self::route_frame(&frame, &pending, &events),
                        None => {
                            info!("Signaling socket closed by peer");
                            if connected.swap(false, Ordering::SeqCst) {
                                pending.clear();
                                let _ = events.send(SignalingEvent::Disconnected);
                            }
                            break;
                        }
                    },
                }
            }
            debug!("Signaling reader stopped");
        });

        info!("Signaling connected");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn join_room(&self, room_id: &RoomId) -> Result<RtpCapabilities> {
        let data = self.request("joinRoom", json!({ "roomId": room_id })).await?;
        decode(data)
    }

    async fn create_transport(&self, direction: TransportDirection) -> Result<TransportParams> {
        let event = match direction {
            TransportDirection::Send => "createTransport",
            TransportDirection::Recv => "createRecvTransport",
        };
        decode(self.request(event, json!({})).await?)
    }

    async fn connect_transport(
        &self,
        direction: TransportDirection,
        transport_id: &TransportId,
        dtls_parameters: &DtlsParameters,
    ) -> Result<()> {
        let event = match direction {
            TransportDirection::Send => "transportConnect",
            TransportDirection::Recv => "transportRecvConnect",
        };
        self.request(
            event,
            json!({ "transportId": transport_id, "dtlsParameters": dtls_parameters }),
        )
        .await?;
        Ok(())
    }

    async fn produce(
        &self,
        transport_id: &TransportId,
        kind: MediaKind,
        rtp_parameters: &RtpParameters,
        app_data: AppData,
    ) -> Result<ProducerId> {
        let data = self
            .request(
                "transportProduce",
                json!({
                    "transportId": transport_id,
                    "kind": kind,
                    "rtpParameters": rtp_parameters,
                    "appData": app_data,
                }),
            )
            .await?;
        let answer: ProduceAnswer = decode(data)?;
        Ok(answer.id)
    }

    async fn consume(
        &self,
        producer_id: &ProducerId,
        capabilities: &RtpCapabilities,
    ) -> Result<Option<ConsumerParams>> {
        let data = self
            .request(
                "consume",
                json!({ "producerId": producer_id, "rtpCapabilities": capabilities }),
            )
            .await?;
        if data.is_null() {
            return Ok(None);
        }
        decode(data).map(Some)
    }

    async fn close_producer(&self, producer_id: &ProducerId) -> Result<()> {
        self.request("closeProducer", json!({ "producerId": producer_id }))
            .await?;
        Ok(())
    }

    async fn existing_producers(&self) -> Result<Vec<ProducerInfo>> {
        let data = self.request("getExistingProducers", json!({})).await?;
        if data.is_null() {
            return Ok(Vec::new());
        }
        decode(data)
    }

    fn subscribe(&self) -> Option<mpsc::UnboundedReceiver<SignalingEvent>> {
        self.events_rx.lock().take()
    }

    async fn disconnect(&self) {
        self.shutdown.cancel();
        self.inbound.lock().take();
        if self.connected.swap(false, Ordering::SeqCst) {
            self.pending.clear();
            info!("Signaling disconnected");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_frames_are_routed() {
        let pending = PendingMap::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        SocketSignaling::route_frame(
            r#"{"event":"producerClosed","data":{"producerId":"p-1"}}"#,
            &pending,
            &tx,
        );
        SocketSignaling::route_frame(r#"{"event":"chatMessage","data":{}}"#, &pending, &tx);

        assert_eq!(
            rx.try_recv().unwrap(),
            SignalingEvent::ProducerClosed(ProducerId::from("p-1"))
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_ack_frames_resolve_waiters() {
        let pending = PendingMap::new();
        let (events, _rx) = mpsc::unbounded_channel();
        let (tx, mut waiter) = oneshot::channel();
        pending.insert(4, tx);

        SocketSignaling::route_frame(r#"{"ack":4,"error":"router closed"}"#, &pending, &events);

        let ack = waiter.try_recv().unwrap();
        assert_eq!(ack.error.as_deref(), Some("router closed"));
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_request_before_connect_is_unavailable() {
        let (out_tx, _out_rx) = mpsc::unbounded_channel();
        let (_in_tx, in_rx) = mpsc::unbounded_channel();
        let signaling = SocketSignaling::new(out_tx, in_rx);

        let err = signaling.existing_producers().await.unwrap_err();
        assert!(matches!(err, SessionError::SignalingUnavailable(_)));
    }
}

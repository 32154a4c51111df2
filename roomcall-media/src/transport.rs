//! Send and receive transports
//!
//! A session owns at most one transport per direction. Each is created on
//! first use and connects (announces its local DTLS parameters) lazily
//! before the first produce or consume goes through it.

use crate::engine::{MediaEngine, SendOptions};
use crate::error::{Result, SessionError};
use crate::media::{MediaStream, MediaTrack};
use crate::protocol::{AppData, ConsumerParams, RtpCapabilities, StreamRole, TransportParams};
use crate::signaling::SignalingChannel;
use crate::types::{ProducerId, TransportId};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportDirection {
    Send,
    Recv,
}

impl fmt::Display for TransportDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Send => f.write_str("send"),
            Self::Recv => f.write_str("recv"),
        }
    }
}

/// Connection state of a transport as seen by the session core
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Closed,
}

pub struct Transport {
    params: TransportParams,
    direction: TransportDirection,
    state: RwLock<ConnectionState>,
    /// Serializes connect attempts
    connect_lock: Mutex<()>,
    signaling: Arc<dyn SignalingChannel>,
    engine: Arc<dyn MediaEngine>,
}

impl Transport {
    fn new(
        direction: TransportDirection,
        params: TransportParams,
        signaling: Arc<dyn SignalingChannel>,
        engine: Arc<dyn MediaEngine>,
    ) -> Self {
        Self {
            params,
            direction,
            state: RwLock::new(ConnectionState::New),
            connect_lock: Mutex::new(()),
            signaling,
            engine,
        }
    }

    #[must_use]
    pub fn id(&self) -> &TransportId {
        &self.params.id
    }

    #[must_use]
    pub const fn direction(&self) -> TransportDirection {
        self.direction
    }

    #[must_use]
    pub const fn params(&self) -> &TransportParams {
        &self.params
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Mark the transport closed. Returns false if it already was.
    pub(crate) fn close(&self) -> bool {
        let mut state = self.state.write();
        if *state == ConnectionState::Closed {
            return false;
        }
        *state = ConnectionState::Closed;
        info!(transport_id = %self.params.id, direction = %self.direction, "Transport closed");
        true
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(SessionError::StaleEvent(format!(
                "{} transport {} is closed",
                self.direction, self.params.id
            )));
        }
        Ok(())
    }

    /// Send the local DTLS parameters once. A failed attempt leaves the
    /// transport unconnected so the next use tries again.
    async fn ensure_connected(&self) -> Result<()> {
        let _guard = self.connect_lock.lock().await;
        match self.state() {
            ConnectionState::Connected => return Ok(()),
            ConnectionState::Closed => return self.ensure_open(),
            ConnectionState::New | ConnectionState::Connecting => {}
        }

        *self.state.write() = ConnectionState::Connecting;
        let dtls = self.engine.dtls_parameters(self.direction, &self.params);
        let result = match dtls {
            Ok(dtls) => {
                self.signaling
                    .connect_transport(self.direction, &self.params.id, &dtls)
                    .await
            }
            Err(e) => Err(e),
        };

        let mut state = self.state.write();
        match result {
            Ok(()) if *state == ConnectionState::Connecting => {
                *state = ConnectionState::Connected;
                debug!(transport_id = %self.params.id, direction = %self.direction, "Transport connected");
                Ok(())
            }
            Ok(()) => {
                drop(state);
                self.ensure_open()
            }
            Err(e) => {
                if *state == ConnectionState::Connecting {
                    *state = ConnectionState::New;
                }
                warn!(transport_id = %self.params.id, error = %e, "Transport connect failed");
                Err(e)
            }
        }
    }

    /// Publish `track` and return the server-assigned producer id
    pub async fn produce(
        &self,
        track: &MediaTrack,
        role: StreamRole,
        options: &SendOptions,
        capabilities: &RtpCapabilities,
    ) -> Result<ProducerId> {
        if self.direction != TransportDirection::Send {
            return Err(SessionError::NegotiationFailure(
                "produce requires the send transport".to_string(),
            ));
        }
        self.ensure_open()?;
        self.ensure_connected().await?;

        let rtp_parameters = self.engine.send_parameters(track, options, capabilities)?;
        self.signaling
            .produce(&self.params.id, track.kind(), &rtp_parameters, AppData { role })
            .await
    }

    /// Consume a remote producer. `None` when the server declines.
    pub async fn consume(
        &self,
        producer_id: &ProducerId,
        capabilities: &RtpCapabilities,
    ) -> Result<Option<(ConsumerParams, Arc<MediaStream>)>> {
        if self.direction != TransportDirection::Recv {
            return Err(SessionError::NegotiationFailure(
                "consume requires the recv transport".to_string(),
            ));
        }
        self.ensure_open()?;

        let Some(params) = self.signaling.consume(producer_id, capabilities).await? else {
            return Ok(None);
        };
        self.ensure_connected().await?;

        let stream = self.engine.receive(&params)?;
        Ok(Some((params, stream)))
    }
}

/// Get-or-create owner of the session's two transports
pub struct TransportManager {
    signaling: Arc<dyn SignalingChannel>,
    engine: Arc<dyn MediaEngine>,
    send: OnceCell<Arc<Transport>>,
    recv: OnceCell<Arc<Transport>>,
}

impl TransportManager {
    pub fn new(signaling: Arc<dyn SignalingChannel>, engine: Arc<dyn MediaEngine>) -> Self {
        Self {
            signaling,
            engine,
            send: OnceCell::new(),
            recv: OnceCell::new(),
        }
    }

    pub async fn send_transport(&self) -> Result<Arc<Transport>> {
        self.get_or_create(TransportDirection::Send).await
    }

    pub async fn recv_transport(&self) -> Result<Arc<Transport>> {
        self.get_or_create(TransportDirection::Recv).await
    }

    /// Existing transport for `direction`, without creating one
    #[must_use]
    pub fn get(&self, direction: TransportDirection) -> Option<Arc<Transport>> {
        self.cell(direction).get().cloned()
    }

    /// Close both transports. Returns how many were open.
    pub fn close_all(&self) -> usize {
        [TransportDirection::Send, TransportDirection::Recv]
            .into_iter()
            .filter_map(|direction| self.get(direction))
            .filter(|transport| transport.close())
            .count()
    }

    const fn cell(&self, direction: TransportDirection) -> &OnceCell<Arc<Transport>> {
        match direction {
            TransportDirection::Send => &self.send,
            TransportDirection::Recv => &self.recv,
        }
    }

    async fn get_or_create(&self, direction: TransportDirection) -> Result<Arc<Transport>> {
        // Concurrent callers wait on the same initialization
        let transport = self
            .cell(direction)
            .get_or_try_init(|| self.create(direction))
            .await?;
        transport.ensure_open()?;
        Ok(Arc::clone(transport))
    }

    async fn create(&self, direction: TransportDirection) -> Result<Arc<Transport>> {
        let params = self.signaling.create_transport(direction).await?;
        info!(transport_id = %params.id, direction = %direction, "Transport created");
        Ok(Arc::new(Transport::new(
            direction,
            params,
            Arc::clone(&self.signaling),
            Arc::clone(&self.engine),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::encoding::send_options;
    use crate::test_helpers::{router_capabilities, Call, FakeEngine, FakeSignaling};

    fn manager(signaling: &Arc<FakeSignaling>) -> TransportManager {
        TransportManager::new(signaling.clone(), FakeEngine::new())
    }

    #[tokio::test]
    async fn test_transports_are_singletons() {
        let signaling = FakeSignaling::connected();
        let transports = manager(&signaling);

        let (a, b) = tokio::join!(transports.send_transport(), transports.send_transport());
        let (a, b) = (a.unwrap(), b.unwrap());
        assert!(Arc::ptr_eq(&a, &b));

        let recv = transports.recv_transport().await.unwrap();
        assert_ne!(recv.id(), a.id());
        assert!(Arc::ptr_eq(&recv, &transports.recv_transport().await.unwrap()));

        assert_eq!(
            signaling.count(|c| matches!(c, Call::CreateTransport(TransportDirection::Send))),
            1
        );
        assert_eq!(
            signaling.count(|c| matches!(c, Call::CreateTransport(TransportDirection::Recv))),
            1
        );
    }

    #[tokio::test]
    async fn test_failed_creation_is_retried_on_next_use() {
        let signaling = FakeSignaling::connected();
        let transports = manager(&signaling);

        signaling.fail("createTransport");
        assert!(transports.recv_transport().await.is_err());
        assert!(transports.get(TransportDirection::Recv).is_none());

        signaling.recover("createTransport");
        assert!(transports.recv_transport().await.is_ok());
    }

    #[tokio::test]
    async fn test_connect_happens_once_before_first_produce() {
        let signaling = FakeSignaling::connected();
        let transports = manager(&signaling);
        let send = transports.send_transport().await.unwrap();
        assert_eq!(send.state(), ConnectionState::New);

        let track = MediaTrack::new(crate::protocol::MediaKind::Audio, "mic");
        let options = send_options(StreamRole::Mic, &SessionConfig::default());
        let caps = router_capabilities();

        send.produce(&track, StreamRole::Mic, &options, &caps).await.unwrap();
        send.produce(&track, StreamRole::Mic, &options, &caps).await.unwrap();

        assert_eq!(send.state(), ConnectionState::Connected);
        assert_eq!(
            signaling.count(|c| matches!(c, Call::ConnectTransport(TransportDirection::Send, _))),
            1
        );
    }

    #[tokio::test]
    async fn test_failed_connect_is_retried() {
        let signaling = FakeSignaling::connected();
        let transports = manager(&signaling);
        let recv = transports.recv_transport().await.unwrap();
        let caps = router_capabilities();

        signaling.fail("transportConnect");
        assert!(recv.consume(&ProducerId::from("p"), &caps).await.is_err());
        assert_eq!(recv.state(), ConnectionState::New);

        signaling.recover("transportConnect");
        assert!(recv.consume(&ProducerId::from("p"), &caps).await.unwrap().is_some());
        assert_eq!(recv.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_closed_transports_refuse_work() {
        let signaling = FakeSignaling::connected();
        let transports = manager(&signaling);
        transports.send_transport().await.unwrap();
        transports.recv_transport().await.unwrap();

        assert_eq!(transports.close_all(), 2);
        assert_eq!(transports.close_all(), 0);
        assert!(matches!(
            transports.recv_transport().await,
            Err(SessionError::StaleEvent(_))
        ));
    }

    #[tokio::test]
    async fn test_direction_is_enforced() {
        let signaling = FakeSignaling::connected();
        let transports = manager(&signaling);
        let send = transports.send_transport().await.unwrap();
        let caps = router_capabilities();
        assert!(matches!(
            send.consume(&ProducerId::from("p"), &caps).await,
            Err(SessionError::NegotiationFailure(_))
        ));
    }
}

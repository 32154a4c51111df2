//! Remote producers consumed over the recv transport
//!
//! A consumer goes `Pending(attempt, max) -> Active -> Closed`, or
//! `Pending -> Abandoned` when the session never becomes ready within the
//! retry bound. Closed and abandoned producer ids are remembered so a late
//! event for them is ignored rather than resurrecting the consumer.

use crate::error::{Result, SessionError};
use crate::events::{SessionEvent, SessionNotice};
use crate::generation::GenerationToken;
use crate::media::{MediaStream, StreamHandle, TrackState};
use crate::protocol::{ConsumerParams, MediaKind, ProducerInfo, StreamRole};
use crate::scheduler::{Scheduler, TimerId};
use crate::session::Shared;
use crate::types::{ConsumerId, PeerId, ProducerId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Externally visible projection of an active video consumer
#[derive(Debug, Clone)]
pub struct RemoteStreamInfo {
    pub producer_id: ProducerId,
    pub peer_id: PeerId,
    pub role: StreamRole,
    pub stream: StreamHandle,
}

#[derive(Debug)]
pub struct Consumer {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub peer_id: PeerId,
    pub role: StreamRole,
    stream: Arc<MediaStream>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Pending { attempt: u32, max: u32 },
    /// A consume round trip is in flight
    Consuming { attempt: u32 },
    Active,
    Closed,
    Abandoned,
}

enum Entry {
    Pending {
        info: ProducerInfo,
        attempt: u32,
        timer: TimerId,
    },
    Consuming {
        attempt: u32,
    },
    Active(Arc<Consumer>),
}

#[derive(Default)]
struct SubscriberState {
    entries: HashMap<ProducerId, Entry>,
    /// Closed or abandoned, never consumed again
    finished: HashMap<ProducerId, ConsumerState>,
    remote_streams: Vec<RemoteStreamInfo>,
    /// Hidden playback sinks for remote audio, tagged by producer
    audio_sinks: HashMap<ProducerId, StreamHandle>,
}

type ConsumeResult = Result<Option<(ConsumerParams, Arc<MediaStream>)>>;

fn discard(result: ConsumeResult) {
    if let Ok(Some((_, stream))) = result {
        stream.stop_all();
    }
}

pub struct SubscriberRegistry {
    shared: Arc<Shared>,
    scheduler: Arc<dyn Scheduler>,
    state: Mutex<SubscriberState>,
}

impl SubscriberRegistry {
    pub(crate) fn new(shared: Arc<Shared>, scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            shared,
            scheduler,
            state: Mutex::new(SubscriberState::default()),
        }
    }

    /// Reducer for [`SessionEvent::NewProducer`]
    pub(crate) fn on_new_producer(self: &Arc<Self>, info: ProducerInfo) {
        {
            let state = self.state.lock();
            if let Some(outcome) = state.finished.get(&info.producer_id) {
                debug!(
                    producer_id = %info.producer_id,
                    outcome = ?outcome,
                    "newProducer for finished producer ignored"
                );
                return;
            }
            if state.entries.contains_key(&info.producer_id) {
                debug!(producer_id = %info.producer_id, "Duplicate newProducer ignored");
                return;
            }
        }

        debug!(
            producer_id = %info.producer_id,
            peer_id = %info.socket_id,
            kind = %info.kind,
            role = %info.app_data.role,
            "Remote producer announced"
        );
        self.attempt(info, 1);
    }

    /// Reducer for [`SessionEvent::RetryConsume`]
    pub(crate) fn on_retry(self: &Arc<Self>, producer_id: &ProducerId, generation: u64) {
        if generation != self.shared.generation.current() {
            debug!(producer_id = %producer_id, generation, "Retry from previous generation ignored");
            return;
        }

        let next = match self.state.lock().entries.get(producer_id) {
            Some(Entry::Pending { info, attempt, .. }) => Some((info.clone(), *attempt)),
            _ => None,
        };

        match next {
            Some((info, attempt)) => self.attempt(info, attempt + 1),
            None => debug!(producer_id = %producer_id, "Retry for settled producer ignored"),
        }
    }

    fn attempt(self: &Arc<Self>, info: ProducerInfo, attempt: u32) {
        if self.shared.shutdown.is_cancelled() {
            return;
        }

        let ready = self.shared.negotiator.is_loaded() && self.shared.signaling.is_connected();
        if !ready {
            self.defer(info, attempt);
            return;
        }

        self.state
            .lock()
            .entries
            .insert(info.producer_id.clone(), Entry::Consuming { attempt });

        let token = self.shared.generation.token();
        let shutdown = self.shared.shutdown.clone();
        let registry = Arc::clone(self);

        self.shared.tasks.spawn(async move {
            let result = tokio::select! {
                result = registry.consume(&info.producer_id) => result,
                () = shutdown.cancelled() => return,
            };
            registry.commit(info, attempt, &token, result);
        });
    }

    /// Schedule another attempt, or abandon once the bound is reached
    fn defer(&self, info: ProducerInfo, attempt: u32) {
        let mut state = self.state.lock();
        self.defer_locked(&mut state, info, attempt);
    }

    /// Same as [`Self::defer`], for callers already holding the state lock
    fn defer_locked(&self, state: &mut SubscriberState, info: ProducerInfo, attempt: u32) {
        let retry = self.shared.config.retry;
        let producer_id = info.producer_id.clone();

        if attempt >= retry.max_attempts {
            state.entries.remove(&producer_id);
            state
                .finished
                .insert(producer_id.clone(), ConsumerState::Abandoned);
            debug!(producer_id = %producer_id, attempts = attempt, "Pending consume abandoned");
            return;
        }

        let events = self.shared.events.clone();
        let generation = self.shared.generation.current();
        let retry_id = producer_id.clone();
        let timer = self.scheduler.schedule(
            retry.delay(),
            Box::new(move || {
                let _ = events.send(SessionEvent::RetryConsume {
                    producer_id: retry_id,
                    generation,
                });
            }),
        );

        state.entries.insert(
            producer_id.clone(),
            Entry::Pending {
                info,
                attempt,
                timer,
            },
        );
        debug!(
            producer_id = %producer_id,
            attempt,
            max = retry.max_attempts,
            "Consume deferred until the session is ready"
        );
    }

    async fn consume(&self, producer_id: &ProducerId) -> ConsumeResult {
        let capabilities = self.shared.negotiator.capabilities().ok_or_else(|| {
            SessionError::NegotiationFailure("capabilities not loaded".to_string())
        })?;
        let transport = self.shared.transports.recv_transport().await?;
        transport.consume(producer_id, &capabilities).await
    }

    /// Apply a consume answer unless the producer closed or the session
    /// was torn down while it was in flight
    fn commit(
        self: &Arc<Self>,
        info: ProducerInfo,
        attempt: u32,
        token: &GenerationToken,
        result: ConsumeResult,
    ) {
        let producer_id = info.producer_id.clone();
        if token.check("consume").is_err() {
            debug!(producer_id = %producer_id, "Consume answer after teardown discarded");
            discard(result);
            return;
        }

        let mut state = self.state.lock();
        if !matches!(state.entries.get(&producer_id), Some(Entry::Consuming { .. })) {
            drop(state);
            debug!(producer_id = %producer_id, "Consume answer for closed producer discarded");
            discard(result);
            return;
        }

        match result {
            Ok(Some((params, stream))) => {
                let consumer = Arc::new(Consumer {
                    id: params.id.clone(),
                    producer_id: producer_id.clone(),
                    kind: params.kind,
                    peer_id: info.socket_id.clone(),
                    role: info.app_data.role,
                    stream: Arc::clone(&stream),
                });
                state
                    .entries
                    .insert(producer_id.clone(), Entry::Active(Arc::clone(&consumer)));

                let handle = StreamHandle::new(stream);
                let notice = match consumer.kind {
                    MediaKind::Video => {
                        let remote = RemoteStreamInfo {
                            producer_id: producer_id.clone(),
                            peer_id: consumer.peer_id.clone(),
                            role: consumer.role,
                            stream: handle,
                        };
                        state.remote_streams.push(remote.clone());
                        SessionNotice::RemoteStreamAdded(remote)
                    }
                    MediaKind::Audio => {
                        state.audio_sinks.insert(producer_id.clone(), handle.clone());
                        SessionNotice::AudioAttached {
                            producer_id: producer_id.clone(),
                            peer_id: consumer.peer_id.clone(),
                            stream: handle,
                        }
                    }
                };
                drop(state);

                let _ = self.shared.notices.send(notice);
                self.watch_track(&consumer);
                info!(
                    producer_id = %producer_id,
                    consumer_id = %consumer.id,
                    peer_id = %consumer.peer_id,
                    kind = %consumer.kind,
                    attempt,
                    "Consumer active"
                );
            }
            Ok(None) => {
                state.entries.remove(&producer_id);
                debug!(producer_id = %producer_id, "Server declined consume");
            }
            Err(SessionError::SignalingUnavailable(reason)) => {
                // Replaced in place so a concurrent close still finds the entry
                debug!(producer_id = %producer_id, reason = %reason, "Consume lost the signaling connection");
                self.defer_locked(&mut state, info, attempt);
            }
            Err(e) => {
                state.entries.remove(&producer_id);
                warn!(producer_id = %producer_id, error = %e, "Consume rolled back");
            }
        }
    }

    /// Forward a consumed track's own termination into the event loop
    fn watch_track(&self, consumer: &Consumer) {
        let Some(track) = consumer.stream.track(consumer.kind).cloned() else {
            return;
        };
        let events = self.shared.events.clone();
        let shutdown = self.shared.shutdown.clone();
        let producer_id = consumer.producer_id.clone();
        let consumer_id = consumer.id.clone();

        self.shared.tasks.spawn(async move {
            tokio::select! {
                state = track.ended() => {
                    if state == TrackState::Ended {
                        let _ = events.send(SessionEvent::RemoteTrackEnded { producer_id, consumer_id });
                    }
                }
                () = shutdown.cancelled() => {}
            }
        });
    }

    /// Reducer for [`SessionEvent::ProducerClosed`]. Unknown ids are a no-op.
    pub(crate) fn on_producer_closed(&self, producer_id: &ProducerId) {
        let mut state = self.state.lock();
        let Some(entry) = state.entries.remove(producer_id) else {
            let known = state.finished.contains_key(producer_id);
            drop(state);
            debug!(producer_id = %producer_id, known, "producerClosed without live consumer ignored");
            return;
        };

        state
            .finished
            .insert(producer_id.clone(), ConsumerState::Closed);
        let had_stream = match state
            .remote_streams
            .iter()
            .position(|remote| &remote.producer_id == producer_id)
        {
            Some(index) => {
                state.remote_streams.remove(index);
                true
            }
            None => false,
        };
        let had_sink = state.audio_sinks.remove(producer_id).is_some();
        drop(state);

        match entry {
            Entry::Pending { timer, .. } => {
                self.scheduler.cancel(timer);
            }
            Entry::Active(consumer) => {
                consumer.stream.stop_all();
            }
            // The in-flight answer finds no entry and discards itself
            Entry::Consuming { .. } => {}
        }

        if had_stream {
            let _ = self.shared.notices.send(SessionNotice::RemoteStreamRemoved {
                producer_id: producer_id.clone(),
            });
        }
        if had_sink {
            let _ = self.shared.notices.send(SessionNotice::AudioDetached {
                producer_id: producer_id.clone(),
            });
        }
        info!(producer_id = %producer_id, "Remote producer closed");
    }

    /// Reducer for [`SessionEvent::RemoteTrackEnded`]
    pub(crate) fn on_remote_track_ended(&self, producer_id: &ProducerId, consumer_id: &ConsumerId) {
        let matches = matches!(
            self.state.lock().entries.get(producer_id),
            Some(Entry::Active(consumer)) if &consumer.id == consumer_id
        );
        if matches {
            debug!(producer_id = %producer_id, "Remote track ended without close event");
            self.on_producer_closed(producer_id);
        }
    }

    /// Close every consumer and cancel every pending retry.
    /// Returns how many retry timers were canceled.
    pub(crate) fn teardown(&self) -> usize {
        let (entries, streams, sinks) = {
            let mut state = self.state.lock();
            let entries: Vec<_> = state.entries.drain().collect();
            for (producer_id, _) in &entries {
                state
                    .finished
                    .insert(producer_id.clone(), ConsumerState::Closed);
            }
            (
                entries,
                std::mem::take(&mut state.remote_streams),
                std::mem::take(&mut state.audio_sinks),
            )
        };

        let mut canceled = 0;
        for (_, entry) in entries {
            match entry {
                Entry::Pending { timer, .. } => {
                    if self.scheduler.cancel(timer) {
                        canceled += 1;
                    }
                }
                Entry::Active(consumer) => {
                    consumer.stream.stop_all();
                }
                Entry::Consuming { .. } => {}
            }
        }

        for remote in streams {
            let _ = self.shared.notices.send(SessionNotice::RemoteStreamRemoved {
                producer_id: remote.producer_id,
            });
        }
        for (producer_id, _) in sinks {
            let _ = self
                .shared
                .notices
                .send(SessionNotice::AudioDetached { producer_id });
        }

        canceled
    }

    #[must_use]
    pub fn remote_streams(&self) -> Vec<RemoteStreamInfo> {
        self.state.lock().remote_streams.clone()
    }

    /// Playback sink holding a remote audio stream
    #[must_use]
    pub fn audio_sink(&self, producer_id: &ProducerId) -> Option<StreamHandle> {
        self.state.lock().audio_sinks.get(producer_id).cloned()
    }

    #[must_use]
    pub fn consumer_state(&self, producer_id: &ProducerId) -> Option<ConsumerState> {
        let state = self.state.lock();
        if let Some(entry) = state.entries.get(producer_id) {
            return Some(match entry {
                Entry::Pending { attempt, .. } => ConsumerState::Pending {
                    attempt: *attempt,
                    max: self.shared.config.retry.max_attempts,
                },
                Entry::Consuming { attempt } => ConsumerState::Consuming { attempt: *attempt },
                Entry::Active(_) => ConsumerState::Active,
            });
        }
        state.finished.get(producer_id).copied()
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.count(|entry| matches!(entry, Entry::Pending { .. }))
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.count(|entry| matches!(entry, Entry::Active(_)))
    }

    fn count(&self, predicate: impl Fn(&Entry) -> bool) -> usize {
        self.state.lock().entries.values().filter(|e| predicate(e)).count()
    }

    /// (closed, abandoned) producer counts
    #[must_use]
    pub fn finished_counts(&self) -> (usize, usize) {
        let state = self.state.lock();
        let abandoned = state
            .finished
            .values()
            .filter(|outcome| **outcome == ConsumerState::Abandoned)
            .count();
        (state.finished.len() - abandoned, abandoned)
    }
}

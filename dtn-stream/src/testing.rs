//! In-memory transport and recording listener for tests and host integration checks.

use std::collections::VecDeque;
use std::io::{Cursor, Read};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::buffer::{Frame, StreamListener};
use crate::identity::StreamId;
use crate::protocol::{MediaType, PAYLOAD_BLOCK_TYPE};
use crate::transport::{BlockMeta, BundleId, Endpoint, PayloadBlock, Transport, TransportError};

/// A bundle accepted by [`LoopbackTransport::send`] or `send_stream`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentBundle {
    pub id: BundleId,
    pub destination: Endpoint,
    pub lifetime: u64,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone)]
struct InboundBundle {
    id: BundleId,
    block_type: u8,
    lifetime: u64,
    payload: Vec<u8>,
}

#[derive(Default)]
struct LoopbackState {
    sent: Vec<SentBundle>,
    forwarded: usize,
    inbound: VecDeque<InboundBundle>,
    delivered: Vec<BundleId>,
}

/// Transport that keeps every bundle in memory.
///
/// Sent bundles are recorded; inbound bundles are injected by the test (or forwarded
/// from another loopback) and stay pending until marked delivered.
pub struct LoopbackTransport {
    local: Endpoint,
    state: Mutex<LoopbackState>,
    changed: Condvar,
    next_sequence: AtomicU64,
    fail_sends: AtomicBool,
}

impl LoopbackTransport {
    pub fn new(local: Endpoint) -> Self {
        Self {
            local,
            state: Mutex::new(LoopbackState::default()),
            changed: Condvar::new(),
            next_sequence: AtomicU64::new(1),
            fail_sends: AtomicBool::new(false),
        }
    }

    pub fn local(&self) -> &Endpoint {
        &self.local
    }

    /// Make every following send fail with [`TransportError::Send`].
    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    fn next_id(&self, source: Endpoint) -> BundleId {
        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        BundleId::new(source, 0, sequence)
    }

    fn record(&self, destination: &Endpoint, lifetime: u64, payload: Vec<u8>) -> BundleId {
        let id = self.next_id(self.local.clone());
        let mut state = self.state.lock();
        state.sent.push(SentBundle {
            id: id.clone(),
            destination: destination.clone(),
            lifetime,
            payload,
        });
        self.changed.notify_all();
        id
    }

    pub fn sent(&self) -> Vec<SentBundle> {
        self.state.lock().sent.clone()
    }

    /// Block until at least `count` bundles were sent or `timeout` passes.
    pub fn wait_for_sent(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.sent.len() < count {
            if self.changed.wait_until(&mut state, deadline).timed_out() {
                return state.sent.len() >= count;
            }
        }
        true
    }

    /// Queue an inbound bundle from `source` carrying `payload` in its payload block.
    pub fn inject(&self, source: Endpoint, lifetime: u64, payload: Vec<u8>) -> BundleId {
        self.inject_block(source, PAYLOAD_BLOCK_TYPE, lifetime, payload)
    }

    /// Queue an inbound bundle whose only block has type `block_type`.
    pub fn inject_block(
        &self,
        source: Endpoint,
        block_type: u8,
        lifetime: u64,
        payload: Vec<u8>,
    ) -> BundleId {
        let id = self.next_id(source);
        let mut state = self.state.lock();
        state.inbound.push_back(InboundBundle {
            id: id.clone(),
            block_type,
            lifetime,
            payload,
        });
        self.changed.notify_all();
        id
    }

    /// Copy bundles sent since the last call into `peer`'s inbound queue, in send order.
    pub fn forward_to(&self, peer: &LoopbackTransport) -> Vec<BundleId> {
        let fresh: Vec<SentBundle> = {
            let mut state = self.state.lock();
            let fresh = state.sent[state.forwarded..].to_vec();
            state.forwarded = state.sent.len();
            fresh
        };
        fresh
            .into_iter()
            .map(|b| peer.inject(self.local.clone(), b.lifetime, b.payload))
            .collect()
    }

    pub fn delivered(&self) -> Vec<BundleId> {
        self.state.lock().delivered.clone()
    }

    /// Block until at least `count` bundles were marked delivered or `timeout` passes.
    pub fn wait_for_delivered(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.delivered.len() < count {
            if self.changed.wait_until(&mut state, deadline).timed_out() {
                return state.delivered.len() >= count;
            }
        }
        true
    }

    pub fn pending_len(&self) -> usize {
        self.state.lock().inbound.len()
    }
}

impl Transport for LoopbackTransport {
    fn send(
        &self,
        destination: &Endpoint,
        lifetime: u64,
        payload: &[u8],
    ) -> Result<BundleId, TransportError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::Send("loopback send disabled".into()));
        }
        Ok(self.record(destination, lifetime, payload.to_vec()))
    }

    fn send_stream(
        &self,
        destination: &Endpoint,
        lifetime: u64,
        payload: &mut dyn Read,
        declared_len: Option<u64>,
    ) -> Result<BundleId, TransportError> {
        let mut buf = Vec::with_capacity(declared_len.unwrap_or(0) as usize);
        payload.read_to_end(&mut buf)?;
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::Send("loopback send disabled".into()));
        }
        Ok(self.record(destination, lifetime, buf))
    }

    fn enumerate_pending(&self) -> Result<Vec<BundleId>, TransportError> {
        Ok(self
            .state
            .lock()
            .inbound
            .iter()
            .map(|b| b.id.clone())
            .collect())
    }

    fn open_payload_block(&self, id: &BundleId) -> Result<PayloadBlock, TransportError> {
        let state = self.state.lock();
        let bundle = state
            .inbound
            .iter()
            .find(|b| &b.id == id)
            .ok_or_else(|| TransportError::UnknownBundle(id.clone()))?;
        Ok(PayloadBlock {
            meta: BlockMeta {
                block_type: bundle.block_type,
                length: bundle.payload.len() as u64,
                lifetime: bundle.lifetime,
            },
            reader: Box::new(Cursor::new(bundle.payload.clone())),
        })
    }

    fn mark_delivered(&self, id: &BundleId) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        let before = state.inbound.len();
        state.inbound.retain(|b| &b.id != id);
        if state.inbound.len() == before {
            return Err(TransportError::UnknownBundle(id.clone()));
        }
        state.delivered.push(id.clone());
        self.changed.notify_all();
        Ok(())
    }
}

/// Event observed by a [`RecordingListener`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerEvent {
    Initial {
        id: StreamId,
        media: MediaType,
        metadata: Vec<u8>,
    },
    Frame {
        id: StreamId,
        sequence: i32,
        index: i32,
        payload: Vec<u8>,
    },
    Finish(StreamId),
    Expired(StreamId),
}

/// Listener that records every callback in order.
#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<ListenerEvent>>,
    changed: Condvar,
}

impl RecordingListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ListenerEvent> {
        self.events.lock().clone()
    }

    /// Payloads of all delivered data frames, in delivery order.
    pub fn frame_payloads(&self) -> Vec<Vec<u8>> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                ListenerEvent::Frame { payload, .. } => Some(payload.clone()),
                _ => None,
            })
            .collect()
    }

    /// Block until `done` holds for the recorded events or `timeout` passes.
    pub fn wait_for(&self, timeout: Duration, done: impl Fn(&[ListenerEvent]) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        let mut events = self.events.lock();
        while !done(&events) {
            if self.changed.wait_until(&mut events, deadline).timed_out() {
                return done(&events);
            }
        }
        true
    }

    fn push(&self, event: ListenerEvent) {
        self.events.lock().push(event);
        self.changed.notify_all();
    }
}

impl StreamListener for RecordingListener {
    fn on_initial(&self, id: &StreamId, media: MediaType, metadata: &[u8]) {
        self.push(ListenerEvent::Initial {
            id: id.clone(),
            media,
            metadata: metadata.to_vec(),
        });
    }

    fn on_frame_received(&self, id: &StreamId, frame: &Frame) {
        self.push(ListenerEvent::Frame {
            id: id.clone(),
            sequence: frame.segment_sequence(),
            index: frame.frame_index(),
            payload: frame.payload().unwrap_or_default().to_vec(),
        });
    }

    fn on_finish(&self, id: &StreamId) {
        self.push(ListenerEvent::Finish(id.clone()));
    }

    fn on_expired(&self, id: &StreamId) {
        self.push(ListenerEvent::Expired(id.clone()));
    }
}

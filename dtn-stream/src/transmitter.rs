//! Sending side of a stream: one INITIAL bundle, DATA segments cut by an RTT-paced flush,
//! and a FIN carrying the next unused segment sequence.
//!
//! Writes go into a segment pipe whose reading end is handed to [`Transport::send_stream`]
//! by the sender worker. Closing the pipe ends the bundle; the worker then opens the next one.

use std::io::{self, Read};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use crate::config::StreamConfig;
use crate::error::{Result, StreamError};
use crate::identity::generate_correlator;
use crate::protocol::{MediaType, SegmentHeader};
use crate::scheduler::{FlushSchedule, FlushTiming, RttEstimator};
use crate::transport::{BundleId, Endpoint, Transport, TransportError};
use crate::wire::{encode_frame, encode_header};

const TARGET: &str = "dtn-stream::transmitter";

/// Lifecycle of a [`StreamTransmitter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransmitterState {
    Idle,
    /// `connect()` is sending the INITIAL bundle.
    Connecting,
    Connected,
    /// `close()` is flushing the last segment.
    Draining,
    Closed,
}

struct TxState {
    state: TransmitterState,
    lifetime: u64,
    destination: Option<Endpoint>,
    correlator: i32,
    next_sequence: i32,
    header_pending: bool,
    pipe: Option<Sender<Vec<u8>>>,
    last_sent: Option<BundleId>,
    last_acked: Option<BundleId>,
    ack_matched: bool,
    rtt: RttEstimator,
    schedule: Option<FlushSchedule>,
    failure: Option<String>,
}

struct Shared<T> {
    transport: Arc<T>,
    flush_delay_factor: f64,
    state: Mutex<TxState>,
    pipe_ready: Condvar,
}

/// Streams frames to one destination.
///
/// All methods take `&self`; `write` may be called from several threads, acknowledgements
/// usually arrive on the host's session thread.
pub struct StreamTransmitter<T: Transport> {
    shared: Arc<Shared<T>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Transport> StreamTransmitter<T> {
    pub fn new(transport: Arc<T>, config: StreamConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                transport,
                flush_delay_factor: config.flush_delay_factor,
                state: Mutex::new(TxState {
                    state: TransmitterState::Idle,
                    lifetime: config.lifetime,
                    destination: None,
                    correlator: 0,
                    next_sequence: 0,
                    header_pending: false,
                    pipe: None,
                    last_sent: None,
                    last_acked: None,
                    ack_matched: false,
                    rtt: RttEstimator::new(),
                    schedule: None,
                    failure: None,
                }),
                pipe_ready: Condvar::new(),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Lifetime in seconds for bundles sent from now on.
    pub fn set_lifetime(&self, lifetime: u64) {
        self.shared.state.lock().lifetime = lifetime;
    }

    pub fn lifetime(&self) -> u64 {
        self.shared.state.lock().lifetime
    }

    pub fn state(&self) -> TransmitterState {
        self.shared.state.lock().state
    }

    /// Correlator of the stream, once connected.
    pub fn correlator(&self) -> Option<i32> {
        let st = self.shared.state.lock();
        st.destination.as_ref().map(|_| st.correlator)
    }

    pub fn rtt(&self) -> Option<Duration> {
        self.shared.state.lock().rtt.rtt()
    }

    /// Sequence number the next DATA segment (or the FIN) will carry.
    pub fn next_sequence(&self) -> i32 {
        self.shared.state.lock().next_sequence
    }

    pub fn last_sent_bundle(&self) -> Option<BundleId> {
        self.shared.state.lock().last_sent.clone()
    }

    pub fn last_acknowledged(&self) -> Option<BundleId> {
        self.shared.state.lock().last_acked.clone()
    }

    /// Open the stream: send the INITIAL bundle and start the sender worker.
    pub fn connect(&self, destination: Endpoint, media: MediaType, metadata: &[u8]) -> Result<()> {
        let correlator = generate_correlator();
        let mut bundle = encode_header(&SegmentHeader::Initial { correlator, media });
        bundle.extend_from_slice(&encode_frame(metadata)?);
        let lifetime = {
            let mut st = self.shared.state.lock();
            if st.state != TransmitterState::Idle {
                return Err(StreamError::StreamState("stream already connected"));
            }
            st.state = TransmitterState::Connecting;
            st.lifetime
        };

        let begin = Instant::now();
        let sent = self.shared.transport.send(&destination, lifetime, &bundle);
        {
            let mut st = self.shared.state.lock();
            let id = match sent {
                Ok(id) => id,
                Err(e) => {
                    st.state = TransmitterState::Idle;
                    return Err(e.into());
                }
            };
            st.rtt.start(begin);
            if st.last_acked.as_ref() == Some(&id) {
                // acknowledged while send() was still returning
                st.rtt.on_ack(Instant::now());
                st.ack_matched = true;
            }
            info!(
                target: TARGET,
                destination = %destination,
                correlator = format_args!("{correlator:08x}"),
                bundle = %id,
                ?media,
                "stream connected"
            );
            st.last_sent = Some(id);
            st.correlator = correlator;
            st.destination = Some(destination);
            st.state = TransmitterState::Connected;
        }

        let shared = self.shared.clone();
        let spawned = thread::Builder::new()
            .name("dtn-stream-sender".into())
            .spawn(move || shared.run_sender());
        match spawned {
            Ok(handle) => {
                *self.worker.lock() = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.shared.state.lock().state = TransmitterState::Closed;
                Err(e.into())
            }
        }
    }

    /// Append one frame to the current segment. Blocks until a segment is open.
    pub fn write(&self, payload: &[u8]) -> Result<()> {
        let frame = encode_frame(payload)?;
        let mut st = self.shared.state.lock();
        loop {
            if let Some(reason) = &st.failure {
                return Err(TransportError::Send(reason.clone()).into());
            }
            match st.state {
                TransmitterState::Idle | TransmitterState::Connecting => {
                    return Err(StreamError::StreamState("stream not connected"))
                }
                TransmitterState::Draining | TransmitterState::Closed => {
                    return Err(StreamError::StreamState("stream closed"))
                }
                TransmitterState::Connected => {}
            }
            if st.pipe.is_some() {
                break;
            }
            self.shared.pipe_ready.wait(&mut st);
        }

        let mut chunk = Vec::with_capacity(frame.len() + 12);
        if st.header_pending {
            let header = SegmentHeader::Data {
                correlator: st.correlator,
                sequence: st.next_sequence,
            };
            chunk.extend_from_slice(&encode_header(&header));
            st.next_sequence = st.next_sequence.wrapping_add(1);
            st.header_pending = false;
        }
        chunk.extend_from_slice(&frame);
        let delivered = st
            .pipe
            .as_ref()
            .is_some_and(|pipe| pipe.send(chunk).is_ok());
        if !delivered {
            return Err(TransportError::SessionClosed.into());
        }
        arm_flush(&self.shared, &mut st);
        Ok(())
    }

    /// Delivery acknowledgement reported by the bundle session.
    pub fn on_delivery_acknowledged(&self, id: &BundleId) {
        let mut st = self.shared.state.lock();
        if st.last_acked.as_ref().is_some_and(|prev| id <= prev) {
            debug!(target: TARGET, bundle = %id, "ignoring stale acknowledgement");
            return;
        }
        st.last_acked = Some(id.clone());
        let first_sample = st.rtt.rtt().is_none();
        if let Some(rtt) = st.rtt.on_ack(Instant::now()) {
            if first_sample {
                debug!(target: TARGET, rtt_ms = rtt.as_millis() as u64, "round-trip time measured");
            }
        }
        if st.last_sent.as_ref() == Some(id) {
            st.ack_matched = true;
        }
        arm_flush(&self.shared, &mut st);
    }

    /// Flush the last segment, stop the worker and send the FIN.
    ///
    /// If the sender worker failed, its error is returned and no FIN is sent.
    pub fn close(&self) -> Result<()> {
        let schedule = {
            let mut st = self.shared.state.lock();
            if st.state != TransmitterState::Connected {
                return Err(StreamError::StreamState("stream not connected"));
            }
            st.state = TransmitterState::Draining;
            st.pipe = None;
            self.shared.pipe_ready.notify_all();
            st.schedule.take()
        };
        // the flush callback takes the state lock, so cancel outside of it
        if let Some(schedule) = schedule {
            schedule.cancel();
        }
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                error!(target: TARGET, "sender worker panicked");
            }
        }

        // still Draining while the FIN is sent, so a concurrent close() is refused
        let (destination, lifetime, sequence, fin) = {
            let mut st = self.shared.state.lock();
            if let Some(reason) = st.failure.clone() {
                st.state = TransmitterState::Closed;
                warn!(target: TARGET, error = %reason, "stream closed without FIN");
                return Err(TransportError::Send(reason).into());
            }
            let Some(destination) = st.destination.clone() else {
                st.state = TransmitterState::Closed;
                return Err(StreamError::StreamState("stream not connected"));
            };
            let fin = SegmentHeader::Fin {
                correlator: st.correlator,
                sequence: st.next_sequence,
            };
            (destination, st.lifetime, st.next_sequence, encode_header(&fin))
        };

        let sent = self.shared.transport.send(&destination, lifetime, &fin);
        let mut st = self.shared.state.lock();
        st.state = TransmitterState::Closed;
        let id = sent?;
        info!(
            target: TARGET,
            destination = %destination,
            bundle = %id,
            sequence,
            "stream finished"
        );
        st.last_sent = Some(id);
        Ok(())
    }
}

impl<T: Transport> Drop for StreamTransmitter<T> {
    fn drop(&mut self) {
        let schedule = {
            let mut st = self.shared.state.lock();
            if st.state == TransmitterState::Connected {
                warn!(target: TARGET, "transmitter dropped without close, no FIN sent");
                st.state = TransmitterState::Closed;
            }
            st.pipe = None;
            self.shared.pipe_ready.notify_all();
            st.schedule.take()
        };
        if let Some(schedule) = schedule {
            schedule.cancel();
        }
        if let Some(handle) = self.worker.get_mut().take() {
            let _ = handle.join();
        }
    }
}

impl<T: Transport> Shared<T> {
    fn run_sender(&self) {
        loop {
            let (pipe, chunks) = unbounded();
            let (destination, lifetime) = {
                let mut st = self.state.lock();
                if st.state != TransmitterState::Connected {
                    break;
                }
                let Some(destination) = st.destination.clone() else {
                    break;
                };
                st.pipe = Some(pipe);
                st.header_pending = true;
                self.pipe_ready.notify_all();
                (destination, st.lifetime)
            };

            let mut reader = SegmentReader::new(chunks);
            if !reader.wait_for_data() {
                // flushed or closed before anything was written
                continue;
            }
            match self
                .transport
                .send_stream(&destination, lifetime, &mut reader, None)
            {
                Ok(id) => {
                    debug!(target: TARGET, bundle = %id, "segment sent");
                    self.state.lock().last_sent = Some(id);
                }
                Err(e) => {
                    error!(target: TARGET, error = %e, "segment send failed, stopping sender");
                    let mut st = self.state.lock();
                    st.failure = Some(e.to_string());
                    st.pipe = None;
                    self.pipe_ready.notify_all();
                    break;
                }
            }
        }
        debug!(target: TARGET, "sender worker stopped");
    }

    /// Close the current segment so the worker ships it.
    fn flush(&self) {
        let mut st = self.state.lock();
        if st.state == TransmitterState::Connected && st.pipe.take().is_some() {
            debug!(target: TARGET, sequence = st.next_sequence, "segment flushed");
        }
    }
}

/// Start the periodic flush once the last sent bundle was acknowledged and the open
/// segment already has its header. Consumes the acknowledgement.
fn arm_flush<T: Transport>(shared: &Arc<Shared<T>>, st: &mut TxState) {
    if st.state != TransmitterState::Connected
        || !st.ack_matched
        || st.schedule.is_some()
        || st.header_pending
        || st.pipe.is_none()
    {
        return;
    }
    let Some(rtt) = st.rtt.rtt() else {
        return;
    };
    let timing = FlushTiming::from_rtt(rtt, shared.flush_delay_factor);
    let weak = Arc::downgrade(shared);
    let started = FlushSchedule::start(timing, move || {
        if let Some(shared) = weak.upgrade() {
            shared.flush();
        }
    });
    match started {
        Ok(schedule) => {
            debug!(
                target: TARGET,
                delay_ms = timing.delay.as_millis() as u64,
                period_ms = timing.period.as_millis() as u64,
                "flush schedule armed"
            );
            st.schedule = Some(schedule);
            st.ack_matched = false;
        }
        Err(e) => warn!(target: TARGET, error = %e, "cannot start flush timer"),
    }
}

/// Reading end of a segment pipe. Yields the written chunks in order, then end of input
/// once the writing end is dropped.
struct SegmentReader {
    chunks: Receiver<Vec<u8>>,
    current: Vec<u8>,
    pos: usize,
}

impl SegmentReader {
    fn new(chunks: Receiver<Vec<u8>>) -> Self {
        Self {
            chunks,
            current: Vec::new(),
            pos: 0,
        }
    }

    /// Block until the first chunk arrives. False if the pipe closed empty.
    fn wait_for_data(&mut self) -> bool {
        match self.chunks.recv() {
            Ok(chunk) => {
                self.current = chunk;
                self.pos = 0;
                true
            }
            Err(_) => false,
        }
    }
}

impl Read for SegmentReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.pos >= self.current.len() {
            match self.chunks.recv() {
                Ok(chunk) => {
                    self.current = chunk;
                    self.pos = 0;
                }
                Err(_) => return Ok(0),
            }
        }
        let n = buf.len().min(self.current.len() - self.pos);
        buf[..n].copy_from_slice(&self.current[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

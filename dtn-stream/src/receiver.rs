//! Receiving side: pull pending bundles, parse segments, route them to per-stream buffers.
//!
//! Three kinds of threads cooperate:
//! - the dispatch thread serializes `notify()` and mark-delivered requests and talks to the
//!   transport,
//! - a small rayon pool parses payload blocks,
//! - the stream-table thread owns every [`ReassemblyBuffer`] and runs the garbage collector.

use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{select, tick, unbounded, Receiver, Sender};
use tracing::{debug, info, warn};

use crate::buffer::{Frame, ReassemblyBuffer, StreamListener};
use crate::config::StreamConfig;
use crate::error::Result;
use crate::identity::StreamId;
use crate::protocol::{MediaType, SegmentHeader, PAYLOAD_BLOCK_TYPE};
use crate::transport::{BlockMeta, BoundedReader, BundleId, Endpoint, PayloadBlock, Transport};
use crate::wire::{read_frame, read_header, FrameDecodeError};

const TARGET: &str = "dtn-stream::receiver";

/// Decides which pending bundles are stream segments, from the bundle id and the
/// metadata of its payload block.
pub trait StreamFilter: Send + Sync {
    fn accept(&self, id: &BundleId, meta: &BlockMeta) -> bool;
}

impl<F> StreamFilter for F
where
    F: Fn(&BundleId, &BlockMeta) -> bool + Send + Sync,
{
    fn accept(&self, id: &BundleId, meta: &BlockMeta) -> bool {
        self(id, meta)
    }
}

/// Takes bundles the [`StreamFilter`] rejected.
pub trait PlainBundleHandler: Send + Sync {
    /// Consume the bundle. Returning true marks it delivered; false leaves it pending.
    fn on_bundle(&self, id: &BundleId, block: PayloadBlock) -> bool;
}

impl<F> PlainBundleHandler for F
where
    F: Fn(&BundleId, PayloadBlock) -> bool + Send + Sync,
{
    fn on_bundle(&self, id: &BundleId, block: PayloadBlock) -> bool {
        self(id, block)
    }
}

/// Decoded content of one segment bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentBody {
    Initial {
        correlator: i32,
        media: MediaType,
        metadata: Vec<u8>,
    },
    Data {
        correlator: i32,
        frames: Vec<Frame>,
    },
    Fin {
        correlator: i32,
        sequence: i32,
    },
}

impl SegmentBody {
    pub fn correlator(&self) -> i32 {
        match self {
            SegmentBody::Initial { correlator, .. }
            | SegmentBody::Data { correlator, .. }
            | SegmentBody::Fin { correlator, .. } => *correlator,
        }
    }
}

/// Parse one segment from a payload block bounded to its declared length.
///
/// A DATA segment ends at end of input; a frame cut short by the block end also ends it.
pub fn parse_segment<R: Read>(r: &mut R) -> Result<SegmentBody> {
    match read_header(r)? {
        SegmentHeader::Initial { correlator, media } => {
            let metadata = read_frame(r)?.ok_or(FrameDecodeError::Truncated)?;
            Ok(SegmentBody::Initial {
                correlator,
                media,
                metadata,
            })
        }
        SegmentHeader::Data {
            correlator,
            sequence,
        } => {
            let mut frames = Vec::new();
            loop {
                match read_frame(r) {
                    Ok(Some(payload)) => {
                        let index = frames.len() as i32;
                        frames.push(Frame::data(payload, sequence, index));
                    }
                    Ok(None) | Err(FrameDecodeError::Truncated) => break,
                    Err(e) => return Err(e.into()),
                }
            }
            Ok(SegmentBody::Data { correlator, frames })
        }
        SegmentHeader::Fin {
            correlator,
            sequence,
        } => Ok(SegmentBody::Fin {
            correlator,
            sequence,
        }),
    }
}

struct ParsedSegment {
    source: Endpoint,
    lifetime: u64,
    body: SegmentBody,
}

enum Control {
    Notify,
    Parsed(BundleId),
    Shutdown,
}

/// Handle to a running receiver. Dropping it releases the receiver.
pub struct StreamReceiver {
    control: Sender<Control>,
    dispatcher: Option<JoinHandle<()>>,
    owner: Option<JoinHandle<()>>,
}

/// Configures and starts a [`StreamReceiver`].
pub struct ReceiverBuilder<T> {
    transport: Arc<T>,
    listener: Arc<dyn StreamListener>,
    config: StreamConfig,
    filter: Option<Arc<dyn StreamFilter>>,
    plain: Option<Arc<dyn PlainBundleHandler>>,
}

impl<T: Transport> ReceiverBuilder<T> {
    pub fn config(mut self, config: StreamConfig) -> Self {
        self.config = config;
        self
    }

    pub fn filter(mut self, filter: impl StreamFilter + 'static) -> Self {
        self.filter = Some(Arc::new(filter));
        self
    }

    pub fn plain_handler(mut self, handler: impl PlainBundleHandler + 'static) -> Self {
        self.plain = Some(Arc::new(handler));
        self
    }

    /// Spawn the receiver threads and process whatever is already pending.
    pub fn start(self) -> Result<StreamReceiver> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.parse_workers.max(1))
            .thread_name(|i| format!("dtn-stream-parse-{i}"))
            .build()?;
        let (control, inbox) = unbounded();
        let (segments, segment_rx) = unbounded();

        let table = StreamTable::new(self.listener);
        let gc_interval = self.config.gc_interval();
        let owner = thread::Builder::new()
            .name("dtn-stream-table".into())
            .spawn(move || table.run(segment_rx, gc_interval))?;

        let dispatcher = Dispatcher {
            transport: self.transport,
            filter: self.filter,
            plain: self.plain,
            pool,
            segments,
            control: control.clone(),
            in_flight: HashSet::new(),
            ignored: HashSet::new(),
        };
        let dispatch = thread::Builder::new()
            .name("dtn-stream-dispatch".into())
            .spawn(move || dispatcher.run(inbox))?;

        info!(target: TARGET, parse_workers = self.config.parse_workers, "receiver started");
        Ok(StreamReceiver {
            control,
            dispatcher: Some(dispatch),
            owner: Some(owner),
        })
    }
}

impl StreamReceiver {
    pub fn builder<T: Transport>(
        transport: Arc<T>,
        listener: Arc<dyn StreamListener>,
    ) -> ReceiverBuilder<T> {
        ReceiverBuilder {
            transport,
            listener,
            config: StreamConfig::default(),
            filter: None,
            plain: None,
        }
    }

    /// Start a receiver with default configuration, no filter and no plain handler.
    pub fn start<T: Transport>(
        transport: Arc<T>,
        listener: Arc<dyn StreamListener>,
    ) -> Result<Self> {
        Self::builder(transport, listener).start()
    }

    /// New bundles are pending at the transport.
    pub fn notify(&self) {
        if self.control.send(Control::Notify).is_err() {
            debug!(target: TARGET, "notify after release ignored");
        }
    }

    /// Stop accepting notifications, let running parses finish and stop all threads.
    pub fn release(&mut self) {
        if let Some(dispatcher) = self.dispatcher.take() {
            let _ = self.control.send(Control::Shutdown);
            if dispatcher.join().is_err() {
                warn!(target: TARGET, "dispatch thread panicked");
            }
        }
        if let Some(owner) = self.owner.take() {
            if owner.join().is_err() {
                warn!(target: TARGET, "stream table thread panicked");
            }
        }
    }
}

impl Drop for StreamReceiver {
    fn drop(&mut self) {
        self.release();
    }
}

struct Dispatcher<T> {
    transport: Arc<T>,
    filter: Option<Arc<dyn StreamFilter>>,
    plain: Option<Arc<dyn PlainBundleHandler>>,
    pool: rayon::ThreadPool,
    segments: Sender<ParsedSegment>,
    control: Sender<Control>,
    in_flight: HashSet<BundleId>,
    /// Rejected bundles nobody consumed; stay pending at the transport.
    ignored: HashSet<BundleId>,
}

impl<T: Transport> Dispatcher<T> {
    fn run(mut self, inbox: Receiver<Control>) {
        self.poll();
        while let Ok(msg) = inbox.recv() {
            match msg {
                Control::Notify => self.poll(),
                Control::Parsed(id) => self.finish(id),
                Control::Shutdown => break,
            }
        }
        while !self.in_flight.is_empty() {
            match inbox.recv() {
                Ok(Control::Parsed(id)) => self.finish(id),
                Ok(_) => {}
                Err(_) => break,
            }
        }
        debug!(target: TARGET, "dispatcher stopped");
    }

    fn poll(&mut self) {
        let pending = match self.transport.enumerate_pending() {
            Ok(pending) => pending,
            Err(e) => {
                warn!(target: TARGET, error = %e, "cannot enumerate pending bundles");
                return;
            }
        };
        {
            let still_pending: HashSet<&BundleId> = pending.iter().collect();
            self.ignored.retain(|id| still_pending.contains(id));
        }
        for id in pending {
            if self.in_flight.contains(&id) || self.ignored.contains(&id) {
                continue;
            }
            self.dispatch(id);
        }
    }

    fn dispatch(&mut self, id: BundleId) {
        let block = match self.transport.open_payload_block(&id) {
            Ok(block) => block,
            Err(e) => {
                warn!(target: TARGET, bundle = %id, error = %e, "cannot open payload block");
                return;
            }
        };
        if let Some(filter) = &self.filter {
            if !filter.accept(&id, &block.meta) {
                self.hand_off(id, block);
                return;
            }
        }
        if block.meta.block_type != PAYLOAD_BLOCK_TYPE {
            debug!(target: TARGET, bundle = %id, block_type = block.meta.block_type, "skipping non-payload block");
            self.mark_delivered(&id);
            return;
        }

        self.in_flight.insert(id.clone());
        let segments = self.segments.clone();
        let control = self.control.clone();
        self.pool.spawn(move || {
            parse_bundle(&id, block, &segments);
            let _ = control.send(Control::Parsed(id));
        });
    }

    fn hand_off(&mut self, id: BundleId, block: PayloadBlock) {
        let Some(handler) = self.plain.clone() else {
            info!(target: TARGET, bundle = %id, "bundle is not a stream segment, leaving it pending");
            self.ignored.insert(id);
            return;
        };
        if handler.on_bundle(&id, block) {
            self.mark_delivered(&id);
        } else {
            self.ignored.insert(id);
        }
    }

    fn finish(&mut self, id: BundleId) {
        self.in_flight.remove(&id);
        self.mark_delivered(&id);
    }

    fn mark_delivered(&self, id: &BundleId) {
        match self.transport.mark_delivered(id) {
            Ok(()) => debug!(target: TARGET, bundle = %id, "bundle delivered"),
            Err(e) => warn!(target: TARGET, bundle = %id, error = %e, "cannot mark bundle delivered"),
        }
    }
}

fn parse_bundle(id: &BundleId, block: PayloadBlock, segments: &Sender<ParsedSegment>) {
    let mut reader = BoundedReader::new(block.reader, block.meta.length);
    match parse_segment(&mut reader) {
        Ok(body) => {
            debug!(
                target: TARGET,
                bundle = %id,
                correlator = format_args!("{:08x}", body.correlator()),
                "segment parsed"
            );
            let parsed = ParsedSegment {
                source: id.source.clone(),
                lifetime: block.meta.lifetime,
                body,
            };
            if segments.send(parsed).is_err() {
                debug!(target: TARGET, bundle = %id, "stream table gone, segment dropped");
            }
        }
        Err(e) => warn!(target: TARGET, bundle = %id, error = %e, "dropping malformed segment"),
    }
    if let Err(e) = reader.drain() {
        debug!(target: TARGET, bundle = %id, error = %e, "cannot drain payload block");
    }
}

/// Owns the reassembly buffers of all streams seen by one receiver.
struct StreamTable {
    listener: Arc<dyn StreamListener>,
    streams: HashMap<StreamId, ReassemblyBuffer>,
}

impl StreamTable {
    fn new(listener: Arc<dyn StreamListener>) -> Self {
        Self {
            listener,
            streams: HashMap::new(),
        }
    }

    fn run(mut self, segments: Receiver<ParsedSegment>, gc_interval: Duration) {
        let ticker = tick(gc_interval);
        loop {
            select! {
                recv(segments) -> msg => match msg {
                    Ok(segment) => self.apply(segment, Instant::now()),
                    Err(_) => break,
                },
                recv(ticker) -> _ => {
                    self.collect_garbage(Instant::now());
                }
            }
        }
        debug!(target: TARGET, streams = self.streams.len(), "stream table stopped");
    }

    fn apply(&mut self, segment: ParsedSegment, now: Instant) {
        let id = StreamId::new(segment.source, segment.body.correlator());
        let buffer = self.streams.entry(id.clone()).or_insert_with(|| {
            debug!(target: TARGET, stream = %id, "new stream");
            ReassemblyBuffer::new(id, self.listener.clone())
        });
        buffer.prolong(now, Duration::from_secs(segment.lifetime));
        match segment.body {
            SegmentBody::Initial { media, metadata, .. } => buffer.initialize(media, &metadata),
            SegmentBody::Data { frames, .. } => buffer.push_frames(frames),
            SegmentBody::Fin { sequence, .. } => buffer.push_frame(Frame::terminal(sequence)),
        }
    }

    /// Drop finished and expired streams. Returns how many were removed.
    fn collect_garbage(&mut self, now: Instant) -> usize {
        let before = self.streams.len();
        self.streams.retain(|_, buffer| !buffer.is_garbage(now));
        let removed = before - self.streams.len();
        if removed > 0 {
            debug!(target: TARGET, removed, remaining = self.streams.len(), "streams collected");
        }
        removed
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.streams.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StreamError;
    use crate::testing::{ListenerEvent, LoopbackTransport, RecordingListener};
    use crate::transmitter::StreamTransmitter;
    use crate::wire::{encode_frame, encode_header};
    use parking_lot::Mutex;

    const WAIT: Duration = Duration::from_secs(3);

    fn local() -> Endpoint {
        Endpoint::new("dtn://bob/stream")
    }

    fn remote() -> Endpoint {
        Endpoint::new("dtn://alice/stream")
    }

    fn segment(header: SegmentHeader, frames: &[&[u8]]) -> Vec<u8> {
        let mut out = encode_header(&header);
        for f in frames {
            out.extend_from_slice(&encode_frame(f).unwrap());
        }
        out
    }

    fn initial(correlator: i32) -> Vec<u8> {
        segment(
            SegmentHeader::Initial {
                correlator,
                media: MediaType::Audio,
            },
            &[b"meta"],
        )
    }

    fn data(correlator: i32, sequence: i32, frames: &[&[u8]]) -> Vec<u8> {
        segment(
            SegmentHeader::Data {
                correlator,
                sequence,
            },
            frames,
        )
    }

    fn fin(correlator: i32, sequence: i32) -> Vec<u8> {
        segment(
            SegmentHeader::Fin {
                correlator,
                sequence,
            },
            &[],
        )
    }

    fn setup() -> (Arc<LoopbackTransport>, Arc<RecordingListener>) {
        (
            Arc::new(LoopbackTransport::new(local())),
            Arc::new(RecordingListener::new()),
        )
    }

    fn finished(events: &[ListenerEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, ListenerEvent::Finish(_)))
            .count()
    }

    #[test]
    fn parse_data_segment_indexes_frames() {
        let bytes = data(5, 3, &[b"a", b"bc"]);
        let body = parse_segment(&mut bytes.as_slice()).unwrap();
        assert_eq!(
            body,
            SegmentBody::Data {
                correlator: 5,
                frames: vec![Frame::data(b"a".to_vec(), 3, 0), Frame::data(b"bc".to_vec(), 3, 1)],
            }
        );
    }

    #[test]
    fn parse_truncated_frame_ends_data_batch() {
        let mut bytes = data(5, 0, &[b"whole"]);
        bytes.extend_from_slice(&[10, 1, 2]);
        match parse_segment(&mut bytes.as_slice()).unwrap() {
            SegmentBody::Data { frames, .. } => assert_eq!(frames.len(), 1),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn parse_initial_requires_metadata() {
        let bytes = encode_header(&SegmentHeader::Initial {
            correlator: 1,
            media: MediaType::Video,
        });
        assert!(matches!(
            parse_segment(&mut bytes.as_slice()),
            Err(StreamError::Frame(FrameDecodeError::Truncated))
        ));
    }

    #[test]
    fn parse_rejects_bad_version() {
        let mut bytes = fin(1, 0);
        bytes[1] = 9;
        assert!(matches!(
            parse_segment(&mut bytes.as_slice()),
            Err(StreamError::Protocol(_))
        ));
    }

    #[test]
    fn out_of_order_segments_before_initial() {
        let (transport, listener) = setup();
        transport.inject(remote(), 3600, data(7, 2, &[b"two"]));
        transport.inject(remote(), 3600, data(7, 1, &[b"one"]));
        transport.inject(remote(), 3600, initial(7));
        let receiver = StreamReceiver::start(transport.clone(), listener.clone()).unwrap();
        assert!(transport.wait_for_delivered(3, WAIT));

        transport.inject(remote(), 3600, data(7, 0, &[b"zero"]));
        receiver.notify();
        assert!(listener.wait_for(WAIT, |e| e.len() == 4));

        let events = listener.events();
        assert!(matches!(
            &events[0],
            ListenerEvent::Initial { media: MediaType::Audio, metadata, .. } if metadata == b"meta"
        ));
        assert_eq!(
            listener.frame_payloads(),
            vec![b"zero".to_vec(), b"one".to_vec(), b"two".to_vec()]
        );
        assert!(transport.wait_for_delivered(4, WAIT));
        assert_eq!(transport.pending_len(), 0);
    }

    #[test]
    fn duplicate_segment_delivered_once() {
        let (transport, listener) = setup();
        transport.inject(remote(), 3600, initial(9));
        transport.inject(remote(), 3600, data(9, 0, &[b"A", b"B"]));
        transport.inject(remote(), 3600, data(9, 0, &[b"A", b"B"]));
        let receiver = StreamReceiver::start(transport.clone(), listener.clone()).unwrap();
        assert!(transport.wait_for_delivered(3, WAIT));

        transport.inject(remote(), 3600, fin(9, 1));
        receiver.notify();
        assert!(listener.wait_for(WAIT, |e| finished(e) == 1));
        assert_eq!(listener.frame_payloads(), vec![b"A".to_vec(), b"B".to_vec()]);
    }

    #[test]
    fn streams_are_kept_apart() {
        let (transport, listener) = setup();
        for seq in 0..3 {
            transport.inject(remote(), 3600, data(1, seq, &[&[1, seq as u8]]));
            transport.inject(remote(), 3600, data(2, seq, &[&[2, seq as u8]]));
        }
        transport.inject(remote(), 3600, fin(2, 3));
        transport.inject(remote(), 3600, fin(1, 3));
        transport.inject(remote(), 3600, initial(2));
        transport.inject(remote(), 3600, initial(1));
        let _receiver = StreamReceiver::builder(transport.clone(), listener.clone())
            .config(StreamConfig {
                parse_workers: 4,
                ..StreamConfig::default()
            })
            .start()
            .unwrap();
        assert!(listener.wait_for(WAIT, |e| finished(e) == 2));

        for correlator in [1, 2] {
            let id = StreamId::new(remote(), correlator);
            let payloads: Vec<Vec<u8>> = listener
                .events()
                .into_iter()
                .filter_map(|e| match e {
                    ListenerEvent::Frame { id: s, payload, .. } if s == id => Some(payload),
                    _ => None,
                })
                .collect();
            let expected: Vec<Vec<u8>> = (0..3u8).map(|s| vec![correlator as u8, s]).collect();
            assert_eq!(payloads, expected);
        }
    }

    #[test]
    fn same_correlator_from_other_source_is_other_stream() {
        let (transport, listener) = setup();
        transport.inject(remote(), 3600, initial(4));
        transport.inject(Endpoint::new("dtn://carol/stream"), 3600, initial(4));
        let _receiver = StreamReceiver::start(transport.clone(), listener.clone()).unwrap();
        assert!(listener.wait_for(WAIT, |e| e.len() == 2));
    }

    #[test]
    fn malformed_bundles_still_delivered() {
        let (transport, listener) = setup();
        let mut bad_version = initial(3);
        bad_version[1] = 2;
        let mut cut_metadata = encode_header(&SegmentHeader::Initial {
            correlator: 3,
            media: MediaType::Binary,
        });
        cut_metadata.extend_from_slice(&[10, 1, 2]);
        let mut unknown_kind = fin(3, 0);
        unknown_kind[3] = 8;
        transport.inject(remote(), 3600, bad_version);
        transport.inject(remote(), 3600, cut_metadata);
        transport.inject(remote(), 3600, unknown_kind);
        transport.inject(remote(), 3600, Vec::new());

        let _receiver = StreamReceiver::start(transport.clone(), listener.clone()).unwrap();
        assert!(transport.wait_for_delivered(4, WAIT));
        assert!(listener.events().is_empty());
    }

    #[test]
    fn non_payload_block_skipped() {
        let (transport, listener) = setup();
        transport.inject_block(remote(), 9, 3600, initial(1));
        let _receiver = StreamReceiver::start(transport.clone(), listener.clone()).unwrap();
        assert!(transport.wait_for_delivered(1, WAIT));
        assert!(listener.events().is_empty());
    }

    #[test]
    fn rejected_bundles_go_to_plain_handler() {
        let (transport, listener) = setup();
        let plain = Arc::new(Mutex::new(Vec::new()));
        let seen = plain.clone();
        let chat = Endpoint::new("dtn://carol/chat");
        transport.inject(chat.clone(), 3600, b"hello".to_vec());
        transport.inject(remote(), 3600, initial(6));

        let stream_source = remote();
        let _receiver = StreamReceiver::builder(transport.clone(), listener.clone())
            .filter(move |id: &BundleId, _: &BlockMeta| id.source == stream_source)
            .plain_handler(move |id: &BundleId, mut block: PayloadBlock| {
                let mut body = Vec::new();
                if block.reader.read_to_end(&mut body).is_err() {
                    return false;
                }
                seen.lock().push((id.source.clone(), body));
                true
            })
            .start()
            .unwrap();

        assert!(transport.wait_for_delivered(2, WAIT));
        assert_eq!(plain.lock().clone(), vec![(chat, b"hello".to_vec())]);
        assert!(listener.wait_for(WAIT, |e| e.len() == 1));
    }

    #[test]
    fn rejected_bundle_without_handler_stays_pending() {
        let (transport, listener) = setup();
        transport.inject(Endpoint::new("dtn://carol/chat"), 3600, b"hello".to_vec());
        transport.inject(remote(), 3600, initial(6));

        let stream_source = remote();
        let receiver = StreamReceiver::builder(transport.clone(), listener.clone())
            .filter(move |id: &BundleId, _: &BlockMeta| id.source == stream_source)
            .start()
            .unwrap();
        assert!(transport.wait_for_delivered(1, WAIT));
        transport.inject(remote(), 3600, fin(6, 0));
        receiver.notify();
        assert!(transport.wait_for_delivered(2, WAIT));
        assert_eq!(transport.pending_len(), 1);
    }

    #[test]
    fn idle_stream_expires() {
        let (transport, listener) = setup();
        transport.inject(remote(), 0, data(11, 0, &[b"orphan"]));
        let _receiver = StreamReceiver::builder(transport.clone(), listener.clone())
            .config(StreamConfig {
                gc_interval: 1,
                ..StreamConfig::default()
            })
            .start()
            .unwrap();
        let expected = StreamId::new(remote(), 11);
        assert!(listener.wait_for(WAIT, |e| {
            matches!(e, [ListenerEvent::Expired(id)] if *id == expected)
        }));
    }

    #[test]
    fn finished_stream_swallows_duplicates_until_collected() {
        let listener = Arc::new(RecordingListener::new());
        let mut table = StreamTable::new(listener.clone());
        let now = Instant::now();
        let seg = |body| ParsedSegment {
            source: remote(),
            lifetime: 60,
            body,
        };

        table.apply(
            seg(SegmentBody::Initial {
                correlator: 2,
                media: MediaType::Binary,
                metadata: Vec::new(),
            }),
            now,
        );
        table.apply(
            seg(SegmentBody::Fin {
                correlator: 2,
                sequence: 0,
            }),
            now,
        );
        table.apply(
            seg(SegmentBody::Data {
                correlator: 2,
                frames: vec![Frame::data(b"late".to_vec(), 0, 0)],
            }),
            now,
        );
        assert_eq!(table.len(), 1);
        assert_eq!(finished(&listener.events()), 1);
        assert!(listener.frame_payloads().is_empty());

        assert_eq!(table.collect_garbage(now), 1);
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn expiry_follows_latest_bundle_lifetime() {
        let listener = Arc::new(RecordingListener::new());
        let mut table = StreamTable::new(listener.clone());
        let now = Instant::now();
        let data_at = |lifetime| ParsedSegment {
            source: remote(),
            lifetime,
            body: SegmentBody::Data {
                correlator: 8,
                frames: vec![Frame::data(b"x".to_vec(), 1, 0)],
            },
        };
        table.apply(data_at(10), now);
        table.apply(data_at(30), now + Duration::from_secs(5));

        assert_eq!(table.collect_garbage(now + Duration::from_secs(20)), 0);
        assert_eq!(table.collect_garbage(now + Duration::from_secs(35)), 1);
        assert_eq!(
            listener.events(),
            vec![ListenerEvent::Expired(StreamId::new(remote(), 8))]
        );
    }

    #[test]
    fn huge_lifetime_does_not_stop_stream_table() {
        let listener = Arc::new(RecordingListener::new());
        let mut table = StreamTable::new(listener.clone());
        let now = Instant::now();
        let seg = |correlator, lifetime, body| ParsedSegment {
            source: remote(),
            lifetime,
            body: match body {
                0 => SegmentBody::Initial {
                    correlator,
                    media: MediaType::Binary,
                    metadata: Vec::new(),
                },
                _ => SegmentBody::Fin {
                    correlator,
                    sequence: 0,
                },
            },
        };
        table.apply(seg(1, u64::MAX, 0), now);
        assert_eq!(table.collect_garbage(now + Duration::from_secs(3600)), 0);
        table.apply(seg(1, u64::MAX, 1), now);
        table.apply(seg(2, 60, 0), now);
        table.apply(seg(2, 60, 1), now);
        assert_eq!(finished(&listener.events()), 2);
        assert_eq!(table.collect_garbage(now), 2);
    }

    #[test]
    fn receiver_survives_huge_lifetime() {
        let (transport, listener) = setup();
        transport.inject(remote(), u64::MAX, initial(12));
        transport.inject(remote(), u64::MAX, fin(12, 0));
        let receiver = StreamReceiver::start(transport.clone(), listener.clone()).unwrap();
        assert!(transport.wait_for_delivered(2, WAIT));

        transport.inject(remote(), 3600, initial(13));
        transport.inject(remote(), 3600, fin(13, 0));
        receiver.notify();
        assert!(listener.wait_for(WAIT, |e| finished(e) == 2));
    }

    #[test]
    fn filter_sees_block_metadata() {
        let (transport, listener) = setup();
        transport.inject(remote(), 5, b"short-lived".to_vec());
        transport.inject(remote(), 3600, initial(14));
        let plain = Arc::new(Mutex::new(Vec::new()));
        let seen = plain.clone();
        let _receiver = StreamReceiver::builder(transport.clone(), listener.clone())
            .filter(|_: &BundleId, meta: &BlockMeta| meta.lifetime >= 60)
            .plain_handler(move |_: &BundleId, block: PayloadBlock| {
                seen.lock().push(block.meta.lifetime);
                true
            })
            .start()
            .unwrap();
        assert!(transport.wait_for_delivered(2, WAIT));
        assert_eq!(plain.lock().clone(), vec![5]);
        assert!(listener.wait_for(WAIT, |e| e.len() == 1));
    }

    #[test]
    fn transmitter_to_receiver() {
        let alice = Arc::new(LoopbackTransport::new(remote()));
        let bob = Arc::new(LoopbackTransport::new(local()));
        let listener = Arc::new(RecordingListener::new());

        let tx = StreamTransmitter::new(alice.clone(), StreamConfig::default());
        tx.connect(local(), MediaType::Mixed, b"title").unwrap();
        tx.write(b"first").unwrap();
        tx.write(b"second").unwrap();
        tx.close().unwrap();
        let forwarded = alice.forward_to(&bob);
        assert_eq!(forwarded.len(), 3);

        let receiver = StreamReceiver::start(bob.clone(), listener.clone()).unwrap();
        receiver.notify();
        assert!(listener.wait_for(WAIT, |e| finished(e) == 1));

        let id = StreamId::new(remote(), tx.correlator().unwrap());
        assert_eq!(
            listener.events(),
            vec![
                ListenerEvent::Initial {
                    id: id.clone(),
                    media: MediaType::Mixed,
                    metadata: b"title".to_vec(),
                },
                ListenerEvent::Frame {
                    id: id.clone(),
                    sequence: 0,
                    index: 0,
                    payload: b"first".to_vec(),
                },
                ListenerEvent::Frame {
                    id: id.clone(),
                    sequence: 0,
                    index: 1,
                    payload: b"second".to_vec(),
                },
                ListenerEvent::Finish(id),
            ]
        );
    }

    #[test]
    fn release_stops_processing() {
        let (transport, listener) = setup();
        let mut receiver = StreamReceiver::start(transport.clone(), listener.clone()).unwrap();
        receiver.release();
        transport.inject(remote(), 3600, initial(1));
        receiver.notify();
        receiver.release();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(transport.pending_len(), 1);
        assert!(listener.events().is_empty());
    }
}

//! Per-stream reassembly: reorder frames by segment sequence, deliver in order, track completion.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::identity::StreamId;
use crate::protocol::MediaType;

/// One application chunk, or the terminal marker ending the stream.
///
/// Ordered by `(segment_sequence, frame_index)`; a terminal marker sorts after a
/// data frame with the same key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    payload: Option<Vec<u8>>,
    segment_sequence: i32,
    frame_index: i32,
}

impl Frame {
    pub fn data(payload: Vec<u8>, segment_sequence: i32, frame_index: i32) -> Self {
        Self {
            payload: Some(payload),
            segment_sequence,
            frame_index,
        }
    }

    /// Marker for "stream ends at `segment_sequence`".
    pub fn terminal(segment_sequence: i32) -> Self {
        Self {
            payload: None,
            segment_sequence,
            frame_index: 0,
        }
    }

    pub fn payload(&self) -> Option<&[u8]> {
        self.payload.as_deref()
    }

    pub fn into_payload(self) -> Option<Vec<u8>> {
        self.payload
    }

    pub fn is_terminal(&self) -> bool {
        self.payload.is_none()
    }

    pub fn segment_sequence(&self) -> i32 {
        self.segment_sequence
    }

    pub fn frame_index(&self) -> i32 {
        self.frame_index
    }
}

impl Ord for Frame {
    fn cmp(&self, other: &Self) -> Ordering {
        self.segment_sequence
            .cmp(&other.segment_sequence)
            .then(self.frame_index.cmp(&other.frame_index))
            .then(self.is_terminal().cmp(&other.is_terminal()))
            .then_with(|| self.payload.cmp(&other.payload))
    }
}

impl PartialOrd for Frame {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Receives decoded stream events. Called from a single thread per receiver.
pub trait StreamListener: Send + Sync {
    fn on_initial(&self, id: &StreamId, media: MediaType, metadata: &[u8]);
    fn on_frame_received(&self, id: &StreamId, frame: &Frame);
    fn on_finish(&self, id: &StreamId);

    /// Stream timed out before its FIN arrived. Reported like a regular finish unless overridden.
    fn on_expired(&self, id: &StreamId) {
        self.on_finish(id);
    }
}

/// Reorders the frames of one stream and hands them to the listener in sequence order.
pub struct ReassemblyBuffer {
    id: StreamId,
    listener: Arc<dyn StreamListener>,
    expected: i32,
    pending: BinaryHeap<Reverse<Frame>>,
    media: Option<MediaType>,
    finalized: bool,
    expiration: Option<Instant>,
}

impl ReassemblyBuffer {
    pub fn new(id: StreamId, listener: Arc<dyn StreamListener>) -> Self {
        Self {
            id,
            listener,
            expected: 0,
            pending: BinaryHeap::new(),
            media: None,
            finalized: false,
            expiration: None,
        }
    }

    pub fn stream_id(&self) -> &StreamId {
        &self.id
    }

    /// Put the stream's media type and metadata. Only the first call has an effect.
    pub fn initialize(&mut self, media: MediaType, metadata: &[u8]) {
        if self.media.is_some() {
            return;
        }
        self.media = Some(media);
        self.listener.on_initial(&self.id, media, metadata);
        self.deliver_frames();
    }

    /// Queue a batch of frames (re-ordering). Frames older than the expected sequence are dropped.
    pub fn push_frames(&mut self, frames: impl IntoIterator<Item = Frame>) {
        if self.finalized {
            return;
        }
        for f in frames {
            if f.segment_sequence >= self.expected {
                self.pending.push(Reverse(f));
            }
        }
        self.deliver_frames();
    }

    /// Queue a single frame, typically the terminal marker.
    pub fn push_frame(&mut self, frame: Frame) {
        self.push_frames(std::iter::once(frame));
    }

    fn deliver_frames(&mut self) {
        // no delivery until the initial is received
        if self.media.is_none() {
            return;
        }
        while self
            .pending
            .peek()
            .is_some_and(|Reverse(head)| head.segment_sequence <= self.expected)
        {
            let Some(Reverse(head)) = self.pending.pop() else {
                break;
            };
            if head.is_terminal() {
                self.listener.on_finish(&self.id);
                self.close();
                return;
            }
            self.listener.on_frame_received(&self.id, &head);
            self.expected = head.segment_sequence.saturating_add(1);
        }
    }

    fn close(&mut self) {
        self.finalized = true;
        self.pending.clear();
    }

    /// Extend the stream's validity to `now + lifetime`. A lifetime past the clock's
    /// range leaves the stream without expiry.
    pub fn prolong(&mut self, now: Instant, lifetime: Duration) {
        self.expiration = now.checked_add(lifetime);
    }

    /// True once the stream finished, or expired at `now`. An expiring stream is
    /// reported to the listener and closed first.
    pub fn is_garbage(&mut self, now: Instant) -> bool {
        if self.finalized {
            return true;
        }
        match self.expiration {
            Some(expiration) if expiration <= now => {
                self.listener.on_expired(&self.id);
                self.close();
                true
            }
            _ => false,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.media.is_some()
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn media_type(&self) -> Option<MediaType> {
        self.media
    }

    /// Next segment sequence the buffer is waiting for.
    pub fn expected_segment(&self) -> i32 {
        self.expected
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

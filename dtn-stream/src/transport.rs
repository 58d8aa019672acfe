//! Bundle transport contract: what the streaming layer needs from a DTN session.
//!
//! The session itself (socket, control protocol, daemon) lives outside this crate;
//! hosts implement [`Transport`] on top of it. [`crate::testing::LoopbackTransport`]
//! is an in-memory implementation.

use std::cmp::Ordering;
use std::fmt;
use std::io::{self, Read};

/// A bundle endpoint identifier, e.g. `dtn://node/app`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint(String);

impl Endpoint {
    pub fn new(eid: impl Into<String>) -> Self {
        Endpoint(eid.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Bundle identifier: source, creation timestamp and sequence number.
///
/// Ordered by creation time, then sequence, then source, so a later
/// acknowledgement compares greater than an earlier one from the same node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BundleId {
    pub source: Endpoint,
    pub timestamp: u64,
    pub sequence: u64,
}

impl BundleId {
    pub fn new(source: Endpoint, timestamp: u64, sequence: u64) -> Self {
        Self {
            source,
            timestamp,
            sequence,
        }
    }
}

impl Ord for BundleId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then(self.sequence.cmp(&other.sequence))
            .then_with(|| self.source.cmp(&other.source))
    }
}

impl PartialOrd for BundleId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for BundleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.timestamp, self.sequence, self.source)
    }
}

/// Metadata of the block handed out by [`Transport::open_payload_block`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockMeta {
    /// Block type code; the primary payload block is [`crate::protocol::PAYLOAD_BLOCK_TYPE`].
    pub block_type: u8,
    /// Declared block length in bytes.
    pub length: u64,
    /// Lifetime of the enclosing bundle in seconds.
    pub lifetime: u64,
}

/// One bundle's payload block: metadata plus a reader over its bytes.
pub struct PayloadBlock {
    pub meta: BlockMeta,
    pub reader: Box<dyn Read + Send>,
}

/// Bundle session used by both the transmitter and the receiver.
///
/// All calls may block on the local daemon. Delivery acknowledgements are not part of this
/// trait: the host forwards them to
/// [`StreamTransmitter::on_delivery_acknowledged`](crate::transmitter::StreamTransmitter::on_delivery_acknowledged).
pub trait Transport: Send + Sync + 'static {
    /// Submit one bundle with an in-memory payload.
    fn send(
        &self,
        destination: &Endpoint,
        lifetime: u64,
        payload: &[u8],
    ) -> Result<BundleId, TransportError>;

    /// Submit one bundle whose payload is read from `payload` until end of input.
    /// Returns once the whole payload has been consumed and accepted.
    fn send_stream(
        &self,
        destination: &Endpoint,
        lifetime: u64,
        payload: &mut dyn Read,
        declared_len: Option<u64>,
    ) -> Result<BundleId, TransportError>;

    /// Ids of inbound bundles not yet marked delivered.
    fn enumerate_pending(&self) -> Result<Vec<BundleId>, TransportError>;

    /// Open the primary payload block of a pending bundle.
    fn open_payload_block(&self, id: &BundleId) -> Result<PayloadBlock, TransportError>;

    /// Tell the session the application has fully consumed `id`.
    fn mark_delivered(&self, id: &BundleId) -> Result<(), TransportError>;
}

/// Error reported by a [`Transport`].
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("send failed: {0}")]
    Send(String),
    #[error("unknown bundle {0}")]
    UnknownBundle(BundleId),
    #[error("session closed")]
    SessionClosed,
    #[error("transport io error: {0}")]
    Io(#[from] io::Error),
}

/// Reader that yields at most `limit` bytes of the wrapped reader, then end of input.
pub struct BoundedReader<R> {
    inner: R,
    remaining: u64,
}

impl<R: Read> BoundedReader<R> {
    pub fn new(inner: R, limit: u64) -> Self {
        Self {
            inner,
            remaining: limit,
        }
    }

    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Discard whatever is left up to the bound. Returns the number of bytes skipped.
    pub fn drain(&mut self) -> io::Result<u64> {
        io::copy(self, &mut io::sink())
    }
}

impl<R: Read> Read for BoundedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 {
            return Ok(0);
        }
        let max = buf.len().min(self.remaining.min(usize::MAX as u64) as usize);
        let n = self.inner.read(&mut buf[..max])?;
        self.remaining -= n as u64;
        Ok(n)
    }
}

//! Ordered frame streams over store-and-forward DTN bundles.
//! The bundle session is supplied by the host through [`Transport`].

pub mod buffer;
pub mod config;
pub mod error;
pub mod identity;
pub mod protocol;
pub mod receiver;
pub mod scheduler;
pub mod transmitter;
pub mod transport;
pub mod wire;

// In-memory transport and listener, also usable for host integration checks.
pub mod testing;

pub use buffer::{Frame, ReassemblyBuffer, StreamListener};
pub use config::StreamConfig;
pub use error::{Result, StreamError};
pub use identity::StreamId;
pub use protocol::{MediaType, SegmentHeader, SegmentKind, PROTOCOL_VERSION};
pub use receiver::{PlainBundleHandler, ReceiverBuilder, StreamFilter, StreamReceiver};
pub use transmitter::{StreamTransmitter, TransmitterState};
pub use transport::{BlockMeta, BundleId, Endpoint, PayloadBlock, Transport, TransportError};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError, ProtocolError};

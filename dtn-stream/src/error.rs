//! Crate-level error for transmitter and receiver operations.

use crate::transport::TransportError;
use crate::wire::{FrameDecodeError, FrameEncodeError, ProtocolError};

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("frame decode error: {0}")]
    Frame(#[from] FrameDecodeError),
    #[error("frame encode error: {0}")]
    Encode(#[from] FrameEncodeError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("invalid stream state: {0}")]
    StreamState(&'static str),
    #[error("cannot start parser pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = StreamError> = std::result::Result<T, E>;

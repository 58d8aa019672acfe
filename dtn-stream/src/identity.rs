//! Stream identity: source endpoint + sender-chosen correlator.

use std::fmt;

use crate::transport::Endpoint;

/// Identifies one logical stream at the receiver.
///
/// Equality and hashing cover both fields. Without a known source the identity
/// degenerates to the correlator alone.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamId {
    pub source: Option<Endpoint>,
    pub correlator: i32,
}

impl StreamId {
    pub fn new(source: Endpoint, correlator: i32) -> Self {
        Self {
            source: Some(source),
            correlator,
        }
    }

    pub fn anonymous(correlator: i32) -> Self {
        Self {
            source: None,
            correlator,
        }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(source) => write!(f, "{}#{:08x}", source, self.correlator),
            None => write!(f, "#{:08x}", self.correlator),
        }
    }
}

/// Pick a fresh correlator: the most significant 32 bits of a random v4 UUID.
pub fn generate_correlator() -> i32 {
    let bytes = uuid::Uuid::new_v4().into_bytes();
    i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

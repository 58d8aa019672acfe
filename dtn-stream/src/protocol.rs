//! Streaming wire protocol: segment kinds, media types and version.

/// Current protocol version. Written into every segment header.
pub const PROTOCOL_VERSION: u16 = 1;

/// Block type of a bundle's primary payload block. Only this block is parsed.
pub const PAYLOAD_BLOCK_TYPE: u8 = 1;

/// Kind of a segment. Encoded as a 2 byte code after the version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SegmentKind {
    Initial,
    Data,
    Fin,
}

impl SegmentKind {
    pub fn code(self) -> u16 {
        match self {
            SegmentKind::Initial => 1,
            SegmentKind::Data => 2,
            SegmentKind::Fin => 3,
        }
    }

    /// Map a wire code to a kind. Codes outside 1..=3 are unknown.
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            1 => Some(SegmentKind::Initial),
            2 => Some(SegmentKind::Data),
            3 => Some(SegmentKind::Fin),
            _ => None,
        }
    }
}

/// Media carried by a stream. Announced once, in the INITIAL segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MediaType {
    #[default]
    Unknown,
    Binary,
    Audio,
    Video,
    Mixed,
}

impl MediaType {
    pub fn code(self) -> u16 {
        match self {
            MediaType::Unknown => 0,
            MediaType::Binary => 1,
            MediaType::Audio => 2,
            MediaType::Video => 3,
            MediaType::Mixed => 4,
        }
    }

    /// Unrecognised codes decode to `Unknown` instead of failing the segment.
    pub fn from_code(code: u16) -> Self {
        match code {
            1 => MediaType::Binary,
            2 => MediaType::Audio,
            3 => MediaType::Video,
            4 => MediaType::Mixed,
            _ => MediaType::Unknown,
        }
    }
}

/// Header preceding every segment. Each variant carries exactly the fields
/// present on the wire for that kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentHeader {
    /// Opens a stream and announces its media type; followed by one metadata frame.
    Initial { correlator: i32, media: MediaType },
    /// Batch of frames, all belonging to `sequence`.
    Data { correlator: i32, sequence: i32 },
    /// End of stream; `sequence` is the first sequence number never used for data.
    Fin { correlator: i32, sequence: i32 },
}

impl SegmentHeader {
    pub fn kind(&self) -> SegmentKind {
        match self {
            SegmentHeader::Initial { .. } => SegmentKind::Initial,
            SegmentHeader::Data { .. } => SegmentKind::Data,
            SegmentHeader::Fin { .. } => SegmentKind::Fin,
        }
    }

    pub fn correlator(&self) -> i32 {
        match *self {
            SegmentHeader::Initial { correlator, .. }
            | SegmentHeader::Data { correlator, .. }
            | SegmentHeader::Fin { correlator, .. } => correlator,
        }
    }

    /// Segment sequence of DATA and FIN headers.
    pub fn sequence(&self) -> Option<i32> {
        match *self {
            SegmentHeader::Initial { .. } => None,
            SegmentHeader::Data { sequence, .. } | SegmentHeader::Fin { sequence, .. } => {
                Some(sequence)
            }
        }
    }

    /// Encoded size in bytes: version + kind + correlator + one kind-specific field.
    pub fn encoded_len(&self) -> usize {
        match self {
            SegmentHeader::Initial { .. } => 2 + 2 + 4 + 2,
            SegmentHeader::Data { .. } | SegmentHeader::Fin { .. } => 2 + 2 + 4 + 4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_codes() {
        for kind in [SegmentKind::Initial, SegmentKind::Data, SegmentKind::Fin] {
            assert_eq!(SegmentKind::from_code(kind.code()), Some(kind));
        }
        assert_eq!(SegmentKind::from_code(0), None);
        assert_eq!(SegmentKind::from_code(4), None);
    }

    #[test]
    fn unknown_media_code_is_unknown() {
        assert_eq!(MediaType::from_code(2), MediaType::Audio);
        assert_eq!(MediaType::from_code(99), MediaType::Unknown);
    }

    #[test]
    fn header_accessors() {
        let h = SegmentHeader::Data {
            correlator: -7,
            sequence: 3,
        };
        assert_eq!(h.kind(), SegmentKind::Data);
        assert_eq!(h.correlator(), -7);
        assert_eq!(h.sequence(), Some(3));
        assert_eq!(h.encoded_len(), 12);

        let i = SegmentHeader::Initial {
            correlator: 1,
            media: MediaType::Audio,
        };
        assert_eq!(i.sequence(), None);
        assert_eq!(i.encoded_len(), 10);
    }
}

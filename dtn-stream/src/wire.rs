//! Framing: big-endian segment header, SDNV length prefix + raw frame payload.

use std::io::{self, Read, Write};

use crate::protocol::{MediaType, SegmentHeader, SegmentKind, PROTOCOL_VERSION};

const MAX_FRAME_LEN: u64 = 16 * 1024 * 1024; // 16 MiB

/// An SDNV encoding of a u64 never needs more than 10 bytes.
const MAX_VARINT_LEN: usize = 10;

/// Encode a segment header into its fixed big-endian layout.
pub fn encode_header(header: &SegmentHeader) -> Vec<u8> {
    let mut out = Vec::with_capacity(header.encoded_len());
    out.extend_from_slice(&PROTOCOL_VERSION.to_be_bytes());
    out.extend_from_slice(&header.kind().code().to_be_bytes());
    out.extend_from_slice(&header.correlator().to_be_bytes());
    match *header {
        SegmentHeader::Initial { media, .. } => {
            out.extend_from_slice(&media.code().to_be_bytes());
        }
        SegmentHeader::Data { sequence, .. } | SegmentHeader::Fin { sequence, .. } => {
            out.extend_from_slice(&sequence.to_be_bytes());
        }
    }
    out
}

/// Write a segment header to `w`.
pub fn write_header<W: Write>(w: &mut W, header: &SegmentHeader) -> io::Result<()> {
    w.write_all(&encode_header(header))
}

/// Read one segment header from `r`.
pub fn read_header<R: Read>(r: &mut R) -> Result<SegmentHeader, ProtocolError> {
    let mut fixed = [0u8; 8];
    r.read_exact(&mut fixed)?;
    let version = u16::from_be_bytes([fixed[0], fixed[1]]);
    if version != PROTOCOL_VERSION {
        return Err(ProtocolError::UnsupportedVersion(version));
    }
    let code = u16::from_be_bytes([fixed[2], fixed[3]]);
    let correlator = i32::from_be_bytes([fixed[4], fixed[5], fixed[6], fixed[7]]);
    match SegmentKind::from_code(code) {
        Some(SegmentKind::Initial) => {
            let mut media = [0u8; 2];
            r.read_exact(&mut media)?;
            Ok(SegmentHeader::Initial {
                correlator,
                media: MediaType::from_code(u16::from_be_bytes(media)),
            })
        }
        Some(kind) => {
            let mut seq = [0u8; 4];
            r.read_exact(&mut seq)?;
            let sequence = i32::from_be_bytes(seq);
            Ok(if kind == SegmentKind::Data {
                SegmentHeader::Data {
                    correlator,
                    sequence,
                }
            } else {
                SegmentHeader::Fin {
                    correlator,
                    sequence,
                }
            })
        }
        None => Err(ProtocolError::UnknownSegmentKind(code)),
    }
}

/// Error decoding a segment header.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u16),
    #[error("unknown segment kind {0}")]
    UnknownSegmentKind(u16),
    #[error("header read failed: {0}")]
    Io(#[from] io::Error),
}

/// Append the SDNV encoding of `value` (most-significant 7-bit group first).
pub fn encode_varint(value: u64, out: &mut Vec<u8>) {
    let len = varint_len(value);
    for i in (0..len).rev() {
        let group = ((value >> (7 * i)) & 0x7f) as u8;
        out.push(if i == 0 { group } else { group | 0x80 });
    }
}

/// Number of bytes `encode_varint` produces for `value`.
pub fn varint_len(value: u64) -> usize {
    let mut len = 1;
    let mut rest = value >> 7;
    while rest != 0 {
        rest >>= 7;
        len += 1;
    }
    len
}

/// Read an SDNV from `r`. `Ok(None)` when the input ends before the first byte.
pub fn read_varint<R: Read>(r: &mut R) -> Result<Option<u64>, FrameDecodeError> {
    let mut value: u64 = 0;
    for n in 0..MAX_VARINT_LEN {
        let byte = match read_byte(r)? {
            Some(b) => b,
            None if n == 0 => return Ok(None),
            None => return Err(FrameDecodeError::Truncated),
        };
        if value > (u64::MAX >> 7) {
            return Err(FrameDecodeError::Overflow);
        }
        value = (value << 7) | u64::from(byte & 0x7f);
        if byte & 0x80 == 0 {
            return Ok(Some(value));
        }
    }
    Err(FrameDecodeError::Overflow)
}

fn read_byte<R: Read>(r: &mut R) -> io::Result<Option<u8>> {
    let mut b = [0u8; 1];
    loop {
        match r.read(&mut b) {
            Ok(0) => return Ok(None),
            Ok(_) => return Ok(Some(b[0])),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Encode a payload into a single frame: SDNV length + raw bytes.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, FrameEncodeError> {
    let len = payload.len() as u64;
    if len > MAX_FRAME_LEN {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(varint_len(len) + payload.len());
    encode_varint(len, &mut out);
    out.extend_from_slice(payload);
    Ok(out)
}

/// Write one frame to `w`.
pub fn write_frame<W: Write>(w: &mut W, payload: &[u8]) -> Result<(), FrameEncodeError> {
    let frame = encode_frame(payload)?;
    w.write_all(&frame)?;
    Ok(())
}

/// Error encoding a frame (size limit or sink failure).
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("frame too large")]
    TooLarge,
    #[error("write failed: {0}")]
    Io(#[from] io::Error),
}

/// Read one frame from a bounded reader.
/// `Ok(None)` means the input ended cleanly on a frame boundary: no more frames in this segment.
pub fn read_frame<R: Read>(r: &mut R) -> Result<Option<Vec<u8>>, FrameDecodeError> {
    let Some(len) = read_varint(r)? else {
        return Ok(None);
    };
    if len > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge);
    }
    // Grow with the bytes actually present rather than trusting the prefix.
    let mut payload = Vec::new();
    r.by_ref().take(len).read_to_end(&mut payload)?;
    if (payload.len() as u64) < len {
        return Err(FrameDecodeError::Truncated);
    }
    Ok(Some(payload))
}

/// Decode one frame from the front of `bytes`. Returns the payload and the number of bytes consumed.
/// Call with partial buffer; returns `NeedMore` if not enough bytes (caller should try again after more data).
pub fn decode_frame(bytes: &[u8]) -> Result<(Vec<u8>, usize), FrameDecodeError> {
    let mut cursor = bytes;
    let len = match read_varint(&mut cursor) {
        Ok(Some(len)) => len,
        Ok(None) | Err(FrameDecodeError::Truncated) => return Err(FrameDecodeError::NeedMore),
        Err(e) => return Err(e),
    };
    if len > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge);
    }
    let prefix = bytes.len() - cursor.len();
    let len = len as usize;
    if cursor.len() < len {
        return Err(FrameDecodeError::NeedMore);
    }
    Ok((cursor[..len].to_vec(), prefix + len))
}

/// Error decoding a frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame truncated by end of block")]
    Truncated,
    #[error("length prefix overflows 64 bits")]
    Overflow,
    #[error("frame too large")]
    TooLarge,
    #[error("frame read failed: {0}")]
    Io(#[from] io::Error),
}

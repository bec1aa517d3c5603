use crate::{Envelope, ProtocolError};

/// Frame magic, first four header bytes, big-endian.
pub const FRAME_MAGIC: u32 = 0xDEAD_BEEF;

/// Current frame protocol version.
pub const FRAME_VERSION: u16 = 1;

/// Fixed header size preceding every JSON body.
pub const HEADER_LEN: usize = 16;

/// Upper bound on a frame body; a header announcing more than this is
/// treated as corrupt rather than allocated.
pub const MAX_BODY_LEN: u32 = 16 * 1024 * 1024;

/// Parsed 16-byte frame header for the worker socket protocol.
///
/// ```text
/// ┌───────────┬───────────┬───────────┬───────────┬───────────┐
/// │ magic (4) │ ver (2)   │ type (2)  │ len (4)   │ rsvd (4)  │
/// │ DEADBEEF  │ 1         │ event     │ body len  │ zero      │
/// └───────────┴───────────┴───────────┴───────────┴───────────┘
/// ```
///
/// All fields big-endian. `event_type` mirrors the envelope's
/// `event_type`; the reserved word is ignored on read and zero on write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: u16,
    pub event_type: u16,
    pub body_len: u32,
}

impl FrameHeader {
    /// Parse and validate a header from exactly [`HEADER_LEN`] bytes.
    pub fn parse(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < HEADER_LEN {
            return Err(ProtocolError::HeaderTooShort {
                expected: HEADER_LEN,
                got: buf.len(),
            });
        }
        let magic = u32::from_be_bytes(buf[0..4].try_into().expect("slice is 4 bytes"));
        if magic != FRAME_MAGIC {
            return Err(ProtocolError::BadMagic(magic));
        }
        let version = u16::from_be_bytes(buf[4..6].try_into().expect("slice is 2 bytes"));
        if version != FRAME_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }
        let event_type = u16::from_be_bytes(buf[6..8].try_into().expect("slice is 2 bytes"));
        let body_len = u32::from_be_bytes(buf[8..12].try_into().expect("slice is 4 bytes"));
        if body_len > MAX_BODY_LEN {
            return Err(ProtocolError::BodyTooLarge(body_len));
        }
        Ok(Self {
            version,
            event_type,
            body_len,
        })
    }

    /// Encode into the fixed wire layout.
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(&FRAME_MAGIC.to_be_bytes());
        buf[4..6].copy_from_slice(&self.version.to_be_bytes());
        buf[6..8].copy_from_slice(&self.event_type.to_be_bytes());
        buf[8..12].copy_from_slice(&self.body_len.to_be_bytes());
        buf
    }
}

/// Encode an envelope as a complete frame: header followed by the JSON body.
pub fn build_frame(env: &Envelope) -> Result<Vec<u8>, ProtocolError> {
    let body = serde_json::to_vec(env)?;
    let header = FrameHeader {
        version: FRAME_VERSION,
        event_type: u16::from(env.event_type),
        body_len: body.len() as u32,
    };
    let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
    frame.extend_from_slice(&header.encode());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Decode a complete frame produced by [`build_frame`].
///
/// Stream readers should instead read [`HEADER_LEN`] bytes, call
/// [`FrameHeader::parse`], then read exactly `body_len` bytes and hand
/// them to [`Envelope::from_json_bytes`]; this whole-buffer form exists
/// for tests and one-shot callers.
pub fn parse_frame(data: &[u8]) -> Result<Envelope, ProtocolError> {
    let header = FrameHeader::parse(data)?;
    let body = &data[HEADER_LEN..];
    if body.len() < header.body_len as usize {
        return Err(ProtocolError::HeaderTooShort {
            expected: HEADER_LEN + header.body_len as usize,
            got: data.len(),
        });
    }
    Envelope::from_json_bytes(&body[..header.body_len as usize])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EventType;

    fn sample() -> Envelope {
        let mut env = Envelope::new(EventType::UserIn, "d1", "u1");
        env.intention = "checkStatus".into();
        env.messages.content = "查看自动构建状态".into();
        env
    }

    #[test]
    fn frame_roundtrip() {
        let env = sample();
        let frame = build_frame(&env).unwrap();
        let decoded = parse_frame(&frame).unwrap();
        assert_eq!(env, decoded);
    }

    #[test]
    fn header_carries_event_code() {
        let frame = build_frame(&sample()).unwrap();
        let header = FrameHeader::parse(&frame).unwrap();
        assert_eq!(header.event_type, 1001);
        assert_eq!(header.version, FRAME_VERSION);
        assert_eq!(header.body_len as usize, frame.len() - HEADER_LEN);
    }

    #[test]
    fn reserved_word_is_zero_on_write_ignored_on_read() {
        let mut frame = build_frame(&sample()).unwrap();
        assert_eq!(&frame[12..16], &[0, 0, 0, 0]);
        frame[12..16].copy_from_slice(&[0xAA; 4]);
        assert!(parse_frame(&frame).is_ok());
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut frame = build_frame(&sample()).unwrap();
        frame[0] = 0x00;
        assert!(matches!(
            FrameHeader::parse(&frame),
            Err(ProtocolError::BadMagic(_))
        ));
    }

    #[test]
    fn unsupported_version_is_rejected() {
        let mut frame = build_frame(&sample()).unwrap();
        frame[4..6].copy_from_slice(&7u16.to_be_bytes());
        assert!(matches!(
            FrameHeader::parse(&frame),
            Err(ProtocolError::UnsupportedVersion(7))
        ));
    }

    #[test]
    fn short_header_is_rejected() {
        assert!(matches!(
            FrameHeader::parse(&[0u8; 10]),
            Err(ProtocolError::HeaderTooShort { expected: 16, got: 10 })
        ));
    }

    #[test]
    fn oversized_body_len_is_rejected() {
        let mut frame = build_frame(&sample()).unwrap();
        frame[8..12].copy_from_slice(&(MAX_BODY_LEN + 1).to_be_bytes());
        assert!(matches!(
            FrameHeader::parse(&frame),
            Err(ProtocolError::BodyTooLarge(_))
        ));
    }

    #[test]
    fn truncated_body_is_rejected() {
        let frame = build_frame(&sample()).unwrap();
        assert!(parse_frame(&frame[..frame.len() - 1]).is_err());
    }
}

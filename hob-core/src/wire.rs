//! Framing: length-prefix (4 bytes LE) + UTF-8 JSON payload, and the connection handshake.

use crate::protocol::ProtocolVersion;

const LEN_SIZE: usize = 4;
const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

/// Handshake preamble sent by both sides before any frame.
pub const HANDSHAKE_MAGIC: &[u8; 3] = b"HOB";
pub const HANDSHAKE_LEN: usize = 4;

/// Encode a JSON text into a single frame: 4 bytes LE length + payload.
pub fn encode_frame(payload: &str) -> Result<Vec<u8>, FrameEncodeError> {
    let len = u32::try_from(payload.len()).map_err(|_| FrameEncodeError::TooLarge)?;
    if len > MAX_FRAME_LEN {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(payload.as_bytes());
    Ok(out)
}

#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("frame too large")]
    TooLarge,
}

/// Decode one frame from the front of `bytes`. Returns the payload and the number of bytes consumed.
/// Call with partial buffer; returns `NeedMore` if not enough bytes (caller should try again after more data).
pub fn decode_frame(bytes: &[u8]) -> Result<(String, usize), FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    if len > MAX_FRAME_LEN as usize {
        return Err(FrameDecodeError::TooLarge);
    }
    if bytes.len() < LEN_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    let text = std::str::from_utf8(&bytes[LEN_SIZE..LEN_SIZE + len])?;
    Ok((text.to_string(), LEN_SIZE + len))
}

#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
    #[error("payload is not utf-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
}

/// Handshake bytes advertising the highest protocol the sender speaks.
pub fn handshake_bytes(version: ProtocolVersion) -> [u8; HANDSHAKE_LEN] {
    let mut out = [0u8; HANDSHAKE_LEN];
    out[..3].copy_from_slice(HANDSHAKE_MAGIC);
    out[3] = version.index();
    out
}

/// Parse a peer's handshake. Unknown protocol indices above ours are clamped to the newest known.
pub fn parse_handshake(bytes: &[u8; HANDSHAKE_LEN]) -> Result<ProtocolVersion, HandshakeError> {
    if &bytes[..3] != HANDSHAKE_MAGIC {
        return Err(HandshakeError::BadMagic);
    }
    Ok(ProtocolVersion::from_index(bytes[3]).unwrap_or(ProtocolVersion::R2))
}

/// Both sides settle on the older of the two versions.
pub fn negotiate(ours: ProtocolVersion, theirs: ProtocolVersion) -> ProtocolVersion {
    ours.min(theirs)
}

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("bad handshake magic")]
    BadMagic,
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{"object":"B2","frame":"B2f","node":"N2","logic":false,"data":{"value":0.7}}"#;

    #[test]
    fn roundtrip_message() {
        let frame = encode_frame(SAMPLE).unwrap();
        let (decoded, n) = decode_frame(&frame).unwrap();
        assert_eq!(n, frame.len());
        assert_eq!(decoded, SAMPLE);
    }

    #[test]
    fn partial_read_need_more() {
        let frame = encode_frame(SAMPLE).unwrap();
        assert!(matches!(
            decode_frame(&frame[..2]),
            Err(FrameDecodeError::NeedMore)
        ));
        assert!(matches!(
            decode_frame(&frame[..super::LEN_SIZE]),
            Err(FrameDecodeError::NeedMore)
        ));
        assert!(matches!(
            decode_frame(&frame[..frame.len() - 1]),
            Err(FrameDecodeError::NeedMore)
        ));
    }

    #[test]
    fn multiple_messages() {
        let b = r#"{"obj":"lamp","pos":"lampled","mode":"d"}"#;
        let fa = encode_frame(SAMPLE).unwrap();
        let fb = encode_frame(b).unwrap();
        let mut buf = Vec::new();
        buf.extend_from_slice(&fa);
        buf.extend_from_slice(&fb);
        let (m1, n1) = decode_frame(&buf).unwrap();
        assert_eq!(n1, fa.len());
        let (m2, n2) = decode_frame(&buf[n1..]).unwrap();
        assert_eq!(n2, fb.len());
        assert_eq!(m1, SAMPLE);
        assert_eq!(m2, b);
    }

    #[test]
    fn oversized_length_rejected() {
        let mut buf = (MAX_FRAME_LEN + 1).to_le_bytes().to_vec();
        buf.extend_from_slice(b"{}");
        assert!(matches!(decode_frame(&buf), Err(FrameDecodeError::TooLarge)));
    }

    #[test]
    fn handshake_negotiates_older_version() {
        let hs = handshake_bytes(ProtocolVersion::R1);
        let theirs = parse_handshake(&hs).unwrap();
        assert_eq!(theirs, ProtocolVersion::R1);
        assert_eq!(negotiate(ProtocolVersion::R2, theirs), ProtocolVersion::R1);
        assert!(matches!(
            parse_handshake(b"XYZ\x02"),
            Err(HandshakeError::BadMagic)
        ));
    }
}

//! Wire framing (length + crc32c)
//!
//! Each frame is an 8 byte little-endian header (u32 payload length, u32
//! crc32c of the payload) followed by the serialized [`Message`]. The length
//! guard bounds allocations; the checksum rejects torn frames before they
//! reach the codec.

use crc32c::crc32c;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::message::Message;

pub const FRAME_HEADER_LEN: usize = 8;

/// Serialize a message into a frame payload
pub fn encode_message(message: &Message) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(message)?)
}

/// Deserialize a frame payload into a message
pub fn decode_message(payload: &[u8]) -> Result<Message> {
    Ok(serde_json::from_slice(payload)?)
}

/// Build a complete frame (header + payload) ready for the wire
pub fn encode_frame(payload: &[u8], max_frame_bytes: usize) -> Result<Vec<u8>> {
    if payload.len() > max_frame_bytes {
        return Err(Error::FrameTooLarge {
            max: max_frame_bytes,
            got: payload.len(),
        });
    }
    let length = payload.len() as u32;
    let crc = crc32c(payload);

    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.extend_from_slice(&length.to_le_bytes());
    frame.extend_from_slice(&crc.to_le_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Write one frame to the stream
pub async fn write_frame<W>(writer: &mut W, payload: &[u8], max_frame_bytes: usize) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(payload, max_frame_bytes)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame payload from the stream
///
/// Returns `Ok(None)` when the peer closed the connection at a frame
/// boundary.
pub async fn read_frame<R>(reader: &mut R, max_frame_bytes: usize) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let length = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let expected_crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

    if length > max_frame_bytes {
        return Err(Error::FrameTooLarge {
            max: max_frame_bytes,
            got: length,
        });
    }

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;

    let actual_crc = crc32c(&payload);
    if actual_crc != expected_crc {
        return Err(Error::FrameCrcMismatch {
            expected: expected_crc,
            got: actual_crc,
        });
    }

    Ok(Some(payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageType;

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let payload = b"hello";
        let frame = encode_frame(payload, 1024).unwrap();

        let decoded = read_frame(&mut frame.as_slice(), 1024).await.unwrap().unwrap();
        assert_eq!(decoded, payload);
    }

    #[tokio::test]
    async fn test_clean_eof_yields_none() {
        let empty: &[u8] = &[];
        let result = read_frame(&mut &*empty, 1024).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_reader_rejects_oversize_frame() {
        let frame = encode_frame(&[0u8; 64], 1024).unwrap();
        let err = read_frame(&mut frame.as_slice(), 16).await.unwrap_err();
        assert!(matches!(err, Error::FrameTooLarge { max: 16, got: 64 }));
    }

    #[test]
    fn test_encoder_rejects_oversize_payload() {
        let err = encode_frame(&[0u8; 64], 16).unwrap_err();
        assert!(matches!(err, Error::FrameTooLarge { .. }));
    }

    #[tokio::test]
    async fn test_corrupt_payload_fails_crc() {
        let mut frame = encode_frame(b"payload", 1024).unwrap();
        let last = frame.len() - 1;
        frame[last] ^= 0xff;

        let err = read_frame(&mut frame.as_slice(), 1024).await.unwrap_err();
        assert!(matches!(err, Error::FrameCrcMismatch { .. }));
    }

    #[tokio::test]
    async fn test_message_through_frame() {
        let mut message = Message::new(MessageType::Ping);
        message.source_name = "testSource".to_string();

        let payload = encode_message(&message).unwrap();
        let frame = encode_frame(&payload, 1024).unwrap();

        let bytes = read_frame(&mut frame.as_slice(), 1024).await.unwrap().unwrap();
        let decoded = decode_message(&bytes).unwrap();
        assert_eq!(decoded.msg_type, MessageType::Ping);
        assert_eq!(decoded.source_name, "testSource");
    }
}

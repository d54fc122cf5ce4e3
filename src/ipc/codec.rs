use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::MAX_MESSAGE_SIZE;

/// Size of the big-endian length prefix.
const HEADER_LEN: usize = 4;

/// Frames one JSON message on a spawner control socket or a server data
/// socket.
///
/// Wire format: `[u32 BE payload length][payload]`. A payload is a single
/// JSON object, so zero-length frames are rejected along with anything over
/// [`MAX_MESSAGE_SIZE`]. PTY output rides inside the JSON as base64 and is
/// split by the server well below the limit.
pub struct MessageCodec;

fn check_length(length: usize) -> io::Result<()> {
    if length == 0 {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "empty frame"));
    }
    if length > MAX_MESSAGE_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "frame of {} bytes exceeds the {} byte limit",
                length, MAX_MESSAGE_SIZE
            ),
        ));
    }
    Ok(())
}

impl Decoder for MessageCodec {
    type Item = BytesMut;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(header) = src.get(..HEADER_LEN) else {
            return Ok(None);
        };
        let length = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        // Fail before buffering a peer's oversized frame
        check_length(length)?;

        let frame_len = HEADER_LEN + length;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        Ok(Some(src.split_to(length)))
    }
}

impl Encoder<Bytes> for MessageCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        check_length(item.len())?;
        dst.reserve(HEADER_LEN + item.len());
        dst.put_u32(item.len() as u32);
        dst.extend_from_slice(&item);
        Ok(())
    }
}

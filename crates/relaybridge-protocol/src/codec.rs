//! Newline-delimited JSON frame codec.
//!
//! One frame is one UTF-8 JSON object followed by a single `\n`. A frame of
//! exactly [`MAX_FRAME_SIZE`] bytes (terminator excluded) is accepted; one
//! byte more is a framing error that is fatal to the session.

use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;
use crate::messages::ControlMessage;

/// Maximum frame size on the wire, excluding the `\n` terminator
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Splits a byte stream into frames and joins frames back onto it
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    /// Create a codec with the standard 1 MiB frame cap
    pub fn new() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    /// Create a codec with a custom frame cap (tests only need smaller)
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, ProtocolError> {
        match src.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                if pos > self.max_frame_size {
                    return Err(ProtocolError::Oversize(pos));
                }
                let line = src.split_to(pos + 1).freeze();
                Ok(Some(line.slice(..pos)))
            }
            None => {
                // No terminator yet; a buffer already past the cap can never
                // become a valid frame.
                if src.len() > self.max_frame_size {
                    Err(ProtocolError::Oversize(src.len()))
                } else {
                    Ok(None)
                }
            }
        }
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Bytes, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        if frame.len() > self.max_frame_size {
            return Err(ProtocolError::Oversize(frame.len()));
        }
        dst.reserve(frame.len() + 1);
        dst.put_slice(&frame);
        dst.put_u8(b'\n');
        Ok(())
    }
}

/// Serialize a control message into a single frame (terminator excluded)
pub fn encode_message(msg: &ControlMessage) -> Result<Bytes, ProtocolError> {
    let json = serde_json::to_vec(msg).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    if json.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::Oversize(json.len()));
    }
    Ok(Bytes::from(json))
}

/// Parse one frame into a control message, validating required fields
pub fn decode_message(frame: &[u8]) -> Result<ControlMessage, ProtocolError> {
    if frame.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::Oversize(frame.len()));
    }
    serde_json::from_slice(frame).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

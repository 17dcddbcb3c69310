//! Message framing for the wire protocol.
//!
//! A frame is a routing header followed by one typed payload, preceded by a
//! u32 length covering both.

use crate::header::{Header, ADMIN_UUID};
use crate::message::Message;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::trace;

/// Maximum frame size (1 MiB default)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Complete wire frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Routing header
    pub header: Header,
    /// Typed payload
    pub message: Message,
}

impl Frame {
    /// Create a frame whose header type matches the payload
    pub fn new(
        sender: impl Into<String>,
        accepter: impl Into<String>,
        route: impl Into<String>,
        message: Message,
    ) -> Self {
        let header = Header::new(sender, accepter, message.message_type(), route);
        Self { header, message }
    }

    /// Create a frame sent by the admin
    pub fn from_admin(accepter: impl Into<String>, route: impl Into<String>, message: Message) -> Self {
        Self::new(ADMIN_UUID, accepter, route, message)
    }

    /// Get the total frame size when encoded
    pub fn encoded_size(&self) -> usize {
        4 + self.header.encoded_len() + self.message.encoded_len()
    }

    /// Encode frame to a contiguous buffer
    pub fn encode(&self, max_frame_size: usize) -> Result<Bytes, crate::WireError> {
        if self.header.message_type != self.message.message_type() {
            return Err(crate::WireError::Malformed);
        }
        self.header.validate()?;
        self.message.validate()?;

        let total_size = self.encoded_size();
        if total_size > max_frame_size {
            return Err(crate::WireError::Size(total_size));
        }

        let mut buf = BytesMut::with_capacity(total_size);
        buf.put_u32((total_size - 4) as u32);
        self.header.encode(&mut buf);
        self.message.encode(&mut buf);

        Ok(buf.freeze())
    }
}

/// Frame decoder for parsing incoming frames
#[derive(Debug)]
pub struct FrameDecoder {
    max_frame_size: usize,
}

impl FrameDecoder {
    /// Create a new frame decoder
    pub fn new() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Create a decoder with a custom frame size limit
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// Decode one frame from a buffer; `Ok(None)` means more bytes are needed
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, crate::WireError> {
        if buf.len() < 4 {
            return Ok(None);
        }

        let frame_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if frame_len + 4 > self.max_frame_size {
            return Err(crate::WireError::Size(frame_len));
        }

        if buf.len() < 4 + frame_len {
            return Ok(None);
        }

        buf.advance(4);
        let mut frame_buf = buf.split_to(frame_len).freeze();

        let header = Header::decode(&mut frame_buf).map_err(|e| match e {
            crate::WireError::Incomplete => crate::WireError::Malformed,
            other => other,
        })?;
        let message = crate::message::Message::decode(header.message_type, &mut frame_buf)
            .map_err(|e| match e {
                crate::WireError::Incomplete => crate::WireError::Malformed,
                other => other,
            })?;

        trace!(
            "Decoded {:?} frame from {} for {}",
            header.message_type,
            header.sender,
            header.accepter
        );

        Ok(Some(Frame { header, message }))
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

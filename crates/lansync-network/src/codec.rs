//! Transfer channel framing
//!
//! Every frame is `[magic][u32 big-endian length][body]`. Control frames
//! carry a JSON [`Envelope`](crate::Envelope); chunk frames carry compressed
//! file bytes. The magic byte lets a receiver reject a misaligned stream
//! before trusting the length.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use lansync_types::Error;
use tokio_util::codec::{Decoder, Encoder};

/// First byte of every frame
pub const FRAME_MAGIC: u8 = 0xA7;

/// Magic plus length prefix
pub const FRAME_HEADER_LEN: usize = 5;

/// Default upper bound on a frame body
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Magic-prefixed, length-delimited frame codec
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    /// Codec accepting bodies up to `max_frame_size` bytes
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// Largest accepted body
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        if src[0] != FRAME_MAGIC {
            return Err(Error::protocol(format!(
                "Bad frame magic 0x{:02x}, stream is misaligned",
                src[0]
            )));
        }

        if src.len() < FRAME_HEADER_LEN {
            src.reserve(FRAME_HEADER_LEN - src.len());
            return Ok(None);
        }

        let length = u32::from_be_bytes([src[1], src[2], src[3], src[4]]) as usize;
        if length > self.max_frame_size {
            return Err(Error::protocol(format!(
                "Frame of {} bytes exceeds limit of {}",
                length, self.max_frame_size
            )));
        }

        if src.len() < FRAME_HEADER_LEN + length {
            src.reserve(FRAME_HEADER_LEN + length - src.len());
            return Ok(None);
        }

        src.advance(FRAME_HEADER_LEN);
        Ok(Some(src.split_to(length).freeze()))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(buf)? {
            Some(frame) => Ok(Some(frame)),
            None if buf.is_empty() => Ok(None),
            None => Err(Error::network(format!(
                "Connection closed mid-frame with {} bytes buffered",
                buf.len()
            ))),
        }
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.len() > self.max_frame_size {
            return Err(Error::protocol(format!(
                "Refusing to send frame of {} bytes, limit is {}",
                item.len(),
                self.max_frame_size
            )));
        }

        dst.reserve(FRAME_HEADER_LEN + item.len());
        dst.put_u8(FRAME_MAGIC);
        dst.put_u32(item.len() as u32);
        dst.extend_from_slice(&item);
        Ok(())
    }
}

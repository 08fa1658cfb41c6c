//! DNS-over-stream framing (RFC 1035 §4.2.2, RFC 7766): a 2-byte big-endian
//! length followed by the message.

use crate::base::neterror::NetError;
use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

pub const MAX_MESSAGE_LEN: usize = u16::MAX as usize;

/// Codec for 2-byte length-prefixed DNS messages.
pub fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(2)
        .max_frame_length(MAX_MESSAGE_LEN)
        .new_codec()
}

/// Prefix `message` with its length.
pub fn frame_message(message: &[u8]) -> Result<Bytes, NetError> {
    if message.len() > MAX_MESSAGE_LEN {
        return Err(NetError::MsgTooBig);
    }

    let mut out = BytesMut::with_capacity(2 + message.len());
    codec()
        .encode(Bytes::copy_from_slice(message), &mut out)
        .map_err(|_| NetError::MsgTooBig)?;
    Ok(out.freeze())
}

/// Incremental decoder for a stream of framed messages.
///
/// Holds codec state between calls, so a frame split across reads is
/// reassembled.
#[derive(Debug)]
pub struct FrameDecoder {
    codec: LengthDelimitedCodec,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self { codec: codec() }
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pop one complete message off the front of `buf`, if there is one.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, NetError> {
        self.codec
            .decode(buf)
            .map(|frame| frame.map(BytesMut::freeze))
            .map_err(|_| NetError::InvalidMessage)
    }
}

//! Transport layer for extension ↔ host communication.
//!
//! Native messaging frames: [4-byte little-endian length][UTF-8 JSON payload].
//! `FrameCodec` plugs into `tokio_util`'s `FramedRead`/`FramedWrite` so both
//! sides read and write discrete messages over raw byte streams.

pub mod protocol;

pub use protocol::{Request, RequestPayload, Response, ResponsePayload};

use std::{io, marker::PhantomData};

use bytes::{Buf, BufMut, BytesMut};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Maximum frame size (1 MiB). Browsers cap native-messaging frames here;
/// anything larger is a protocol violation, not something to truncate.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Framing and decoding failures.
///
/// `FrameTooLarge` and `Json` on the *read* path are fatal to the
/// transport: the stream can no longer be trusted to be frame-aligned.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("frame size {size} exceeds limit {limit}")]
    FrameTooLarge { size: usize, limit: usize },
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Length-prefixed JSON codec, generic over the message type.
///
/// The host reads `serde_json::Value` frames (schema validation happens in
/// the router, where failures can be answered per correlation id) and
/// writes [`Response`]; the peer does the inverse.
pub struct FrameCodec<T> {
    max_frame_size: usize,
    _marker: PhantomData<T>,
}

impl<T> FrameCodec<T> {
    /// Codec with a custom frame cap. Used by tests; production code uses
    /// [`Default`], which applies [`MAX_FRAME_SIZE`].
    pub const fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            max_frame_size,
            _marker: PhantomData,
        }
    }
}

impl<T> Default for FrameCodec<T> {
    fn default() -> Self {
        Self::with_max_frame_size(MAX_FRAME_SIZE)
    }
}

impl<T: Serialize> Encoder<T> for FrameCodec<T> {
    type Error = CodecError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = serde_json::to_vec(&item)?;

        if payload.len() > self.max_frame_size {
            return Err(CodecError::FrameTooLarge {
                size: payload.len(),
                limit: self.max_frame_size,
            });
        }

        #[allow(clippy::cast_possible_truncation)]
        let len = payload.len() as u32;
        dst.reserve(4 + payload.len());
        dst.put_u32_le(len);
        dst.put_slice(&payload);
        Ok(())
    }
}

impl<T: DeserializeOwned> Decoder for FrameCodec<T> {
    type Item = T;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }

        let mut prefix = [0u8; 4];
        prefix.copy_from_slice(&src[..4]);
        let frame_len = u32::from_le_bytes(prefix) as usize;

        // Reject before buffering the payload, so a malicious peer cannot
        // make us allocate up to 4 GiB from one bogus prefix.
        if frame_len > self.max_frame_size {
            return Err(CodecError::FrameTooLarge {
                size: frame_len,
                limit: self.max_frame_size,
            });
        }

        if src.len() < 4 + frame_len {
            src.reserve(4 + frame_len - src.len());
            return Ok(None);
        }

        src.advance(4);
        let payload = src.split_to(frame_len);
        let message = serde_json::from_slice(&payload)?;
        Ok(Some(message))
    }
}

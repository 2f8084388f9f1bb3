//! Frames are a big-endian `i32` payload length followed by that much JSON.

use std::{io, marker::PhantomData};

use bytes::{Buf, BufMut, BytesMut};
use futures_util::{SinkExt, StreamExt};
use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Decoder, Encoder, Framed};

pub const MAX_FRAME_SIZE: usize = 8 * 1024;

const LENGTH_FIELD_LEN: usize = 4;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("missing frame length: expected {LENGTH_FIELD_LEN} bytes, received {received}")]
    MissingLength { received: usize },

    #[error("missing frame payload: expected {expected} bytes, received {received}")]
    MissingPayload { expected: usize, received: usize },

    #[error("frame of {size} bytes exceeds the maximum of {max} bytes")]
    TooLarge { size: usize, max: usize },

    #[error("negative frame length {0}")]
    NegativeLength(i32),

    #[error("malformed frame payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug)]
pub struct JsonFrameCodec<T> {
    max_frame_size: usize,
    _item: PhantomData<fn() -> T>,
}

impl<T> JsonFrameCodec<T> {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            max_frame_size,
            _item: PhantomData,
        }
    }
}

impl<T> Default for JsonFrameCodec<T> {
    fn default() -> Self {
        Self::new(MAX_FRAME_SIZE)
    }
}

impl<T: DeserializeOwned> Decoder for JsonFrameCodec<T> {
    type Item = T;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<T>, FrameError> {
        if src.len() < LENGTH_FIELD_LEN {
            return Ok(None);
        }

        let mut header = [0u8; LENGTH_FIELD_LEN];
        header.copy_from_slice(&src[..LENGTH_FIELD_LEN]);
        let declared = i32::from_be_bytes(header);
        let length = usize::try_from(declared).map_err(|_| FrameError::NegativeLength(declared))?;
        if length > self.max_frame_size {
            return Err(FrameError::TooLarge {
                size: length,
                max: self.max_frame_size,
            });
        }

        let frame_len = LENGTH_FIELD_LEN + length;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_FIELD_LEN);
        let payload = src.split_to(length);
        Ok(Some(serde_json::from_slice(&payload)?))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<T>, FrameError> {
        if let Some(item) = self.decode(src)? {
            return Ok(Some(item));
        }
        if src.is_empty() {
            return Ok(None);
        }
        if src.len() < LENGTH_FIELD_LEN {
            return Err(FrameError::MissingLength {
                received: src.len(),
            });
        }
        // decode() already validated the header, so it is a sane length.
        let expected = i32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        Err(FrameError::MissingPayload {
            expected,
            received: src.len() - LENGTH_FIELD_LEN,
        })
    }
}

impl<T, U: Serialize> Encoder<U> for JsonFrameCodec<T> {
    type Error = FrameError;

    fn encode(&mut self, item: U, dst: &mut BytesMut) -> Result<(), FrameError> {
        let payload = serde_json::to_vec(&item)?;
        if payload.len() > self.max_frame_size {
            return Err(FrameError::TooLarge {
                size: payload.len(),
                max: self.max_frame_size,
            });
        }
        dst.reserve(LENGTH_FIELD_LEN + payload.len());
        // max_frame_size is far below i32::MAX for any sane configuration.
        dst.put_i32(payload.len() as i32);
        dst.extend_from_slice(&payload);
        Ok(())
    }
}

pub async fn send<S, T, U>(framed: &mut Framed<S, JsonFrameCodec<T>>, value: U) -> Result<(), FrameError>
where
    S: AsyncWrite + Unpin,
    U: Serialize,
{
    framed.send(value).await
}

/// A stream that ends before any byte arrives is a missing frame length.
pub async fn receive<S, T>(framed: &mut Framed<S, JsonFrameCodec<T>>) -> Result<T, FrameError>
where
    S: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    match framed.next().await {
        Some(frame) => frame,
        None => Err(FrameError::MissingLength { received: 0 }),
    }
}

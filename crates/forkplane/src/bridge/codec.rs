//! Length-prefixed JSON framing for the control connection.
//!
//! Each frame is a 4-byte big-endian length followed by one serde_json
//! document. The same codec type serves both directions: the fork encodes
//! `ForkRequest` and decodes `ForkAction`, the master the reverse.

use std::any::type_name;
use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Upper bound for a single frame; a larger length prefix is treated as corrupt.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Frames beyond this size are logged; large payloads usually mean a
/// work item is carrying more than a descriptor.
const LARGE_FRAME_BYTES: usize = 100_000;

pub struct JsonCodec<T> {
    frames: LengthDelimitedCodec,
    _message: PhantomData<T>,
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self::with_max_frame_length(DEFAULT_MAX_FRAME_BYTES)
    }

    pub fn with_max_frame_length(max_frame_length: usize) -> Self {
        Self {
            frames: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .max_frame_length(max_frame_length)
                .new_codec(),
            _message: PhantomData,
        }
    }
}

fn invalid<T>(e: serde_json::Error) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("invalid {} frame: {e}", type_name::<T>()),
    )
}

impl<T: DeserializeOwned> Decoder for JsonCodec<T> {
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<T>, io::Error> {
        let Some(frame) = self.frames.decode(src)? else {
            return Ok(None);
        };
        serde_json::from_slice(&frame).map(Some).map_err(invalid::<T>)
    }
}

impl<T: Serialize> Encoder<T> for JsonCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, message: T, dst: &mut BytesMut) -> Result<(), io::Error> {
        let json = serde_json::to_vec(&message).map_err(invalid::<T>)?;
        if json.len() > LARGE_FRAME_BYTES {
            tracing::info!(
                frame_bytes = json.len(),
                message = type_name::<T>(),
                "Large frame being encoded"
            );
        }
        self.frames.encode(Bytes::from(json), dst)
    }
}

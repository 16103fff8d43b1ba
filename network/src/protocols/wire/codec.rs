// Copyright (c) TerraGraf Contributors
// SPDX-License-Identifier: Apache-2.0

//! Message codec for framing and serialization

use crate::constants::MAX_FRAME_SIZE;
use crate::error::{NetworkError, Result};
use crate::protocols::Message;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::sync::Arc;
use tokio_util::codec::{Decoder, Encoder};

/// Turns messages into bytes and back
///
/// The core only requires every message kind to round-trip through
/// `write`/`read`; the byte layout is up to the formatter.
pub trait MessageFormatter: Send + Sync {
    fn write(&self, message: &Message) -> Result<Bytes>;
    fn read(&self, bytes: &[u8]) -> Result<Message>;
}

/// Default formatter backed by bincode
#[derive(Debug, Default, Clone, Copy)]
pub struct BincodeFormatter;

impl MessageFormatter for BincodeFormatter {
    fn write(&self, message: &Message) -> Result<Bytes> {
        let bytes = bincode::serialize(message)
            .map_err(|e| NetworkError::SerializationError(e.to_string()))?;
        Ok(Bytes::from(bytes))
    }

    fn read(&self, bytes: &[u8]) -> Result<Message> {
        let message: Message = bincode::deserialize(bytes)
            .map_err(|e| NetworkError::DeserializationError(e.to_string()))?;
        message.validate()?;
        Ok(message)
    }
}

/// Codec for encoding/decoding length-prefixed network messages
#[derive(Clone)]
pub struct MessageCodec {
    max_frame_size: usize,
    formatter: Arc<dyn MessageFormatter>,
}

impl MessageCodec {
    /// Create a new message codec; `max_frame_size` is checked by the
    /// configuration
    pub fn new(max_frame_size: usize, formatter: Arc<dyn MessageFormatter>) -> Self {
        Self {
            max_frame_size,
            formatter,
        }
    }

    /// Encode a single message as one datagram, without a length prefix
    pub fn encode_datagram(&self, message: &Message) -> Result<Bytes> {
        self.formatter.write(message)
    }

    /// Decode a single datagram
    pub fn decode_datagram(&self, datagram: &[u8]) -> Result<Message> {
        self.formatter.read(datagram)
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new(MAX_FRAME_SIZE, Arc::new(BincodeFormatter))
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = NetworkError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.len() < 4 {
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&src[..4]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > self.max_frame_size {
            return Err(NetworkError::InvalidMessage(format!(
                "Frame size {} exceeds maximum {}",
                length, self.max_frame_size
            )));
        }

        if src.len() < 4 + length {
            src.reserve(4 + length - src.len());
            return Ok(None);
        }

        src.advance(4);
        let message_bytes = src.split_to(length);

        self.formatter.read(&message_bytes).map(Some)
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = NetworkError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<()> {
        let message_bytes = self.formatter.write(&item)?;

        if message_bytes.len() > self.max_frame_size {
            return Err(NetworkError::InvalidMessage(format!(
                "Message size {} exceeds maximum {}",
                message_bytes.len(),
                self.max_frame_size
            )));
        }

        dst.reserve(4 + message_bytes.len());
        dst.put_u32(message_bytes.len() as u32);
        dst.put_slice(&message_bytes);

        Ok(())
    }
}

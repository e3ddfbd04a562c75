//! Peer wire codec.
//!
//! Every channel message is one frame: `u32 LE` length of the rest, one kind byte,
//! then the kind-specific payload. Control frames carry JSON; chunk frames use a
//! compact binary layout so file bytes are never re-encoded.

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::{
    CHUNK_SIZE, CoreError, MAX_FILE_NAME_LEN, MAX_FRAME_BYTES, MAX_MIME_LEN, MAX_TRANSFER_BYTES,
    MAX_TRANSFER_CHUNKS, PeerIdentity, chunk_count, validate_identity,
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Hello {
    pub identity: PeerIdentity,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransferMetadata {
    pub file_name: String,
    pub total_size: u64,
    pub chunk_size: u32,
    pub total_chunks: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime: Option<String>,
}

impl TransferMetadata {
    pub fn new(
        file_name: impl Into<String>,
        total_size: u64,
        mime: Option<String>,
    ) -> Result<Self, CoreError> {
        let metadata = Self {
            file_name: file_name.into(),
            total_size,
            chunk_size: CHUNK_SIZE as u32,
            total_chunks: chunk_count(total_size, CHUNK_SIZE)?,
            mime,
        };
        metadata.validate()?;
        Ok(metadata)
    }

    /// Checks the invariants a well-behaved encoder always upholds.
    pub fn validate(&self) -> Result<(), CoreError> {
        let name = self.file_name.trim();
        if name.is_empty() || name.len() > MAX_FILE_NAME_LEN {
            return Err(CoreError::ProtocolViolation(format!(
                "file name must be 1..={MAX_FILE_NAME_LEN} bytes"
            )));
        }
        if self.total_size > MAX_TRANSFER_BYTES {
            return Err(CoreError::FileTooLarge {
                size: self.total_size,
            });
        }
        if self.chunk_size as usize != CHUNK_SIZE {
            return Err(CoreError::ProtocolViolation(format!(
                "chunk size {} does not match the fixed {CHUNK_SIZE}",
                self.chunk_size
            )));
        }
        if self.total_chunks > MAX_TRANSFER_CHUNKS {
            return Err(CoreError::ProtocolViolation(format!(
                "total_chunks {} exceeds {MAX_TRANSFER_CHUNKS}",
                self.total_chunks
            )));
        }
        let expected = chunk_count(self.total_size, self.chunk_size as usize)?;
        if expected != self.total_chunks {
            return Err(CoreError::ProtocolViolation(format!(
                "total_chunks {} does not match {} bytes at {} per chunk",
                self.total_chunks, self.total_size, self.chunk_size
            )));
        }
        if let Some(mime) = &self.mime
            && mime.len() > MAX_MIME_LEN
        {
            return Err(CoreError::ProtocolViolation("mime type too long".to_owned()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub index: u32,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransferDone {
    pub total_chunks: u32,
    /// Hex-encoded SHA-256 of the whole payload.
    pub sha256: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Hello(Hello),
    Accepted,
    Metadata(TransferMetadata),
    Chunk(Chunk),
    Done(TransferDone),
}

impl Frame {
    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Hello(_) => FrameKind::Hello,
            Frame::Accepted => FrameKind::Accepted,
            Frame::Metadata(_) => FrameKind::Metadata,
            Frame::Chunk(_) => FrameKind::Chunk,
            Frame::Done(_) => FrameKind::Done,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Hello = 0,
    Accepted = 1,
    Metadata = 2,
    Chunk = 3,
    Done = 4,
}

impl FrameKind {
    pub fn name(self) -> &'static str {
        match self {
            FrameKind::Hello => "hello",
            FrameKind::Accepted => "accepted",
            FrameKind::Metadata => "start",
            FrameKind::Chunk => "chunk",
            FrameKind::Done => "done",
        }
    }
}

pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, CoreError> {
    let payload = match frame {
        Frame::Hello(hello) => to_json(hello)?,
        Frame::Accepted => Vec::new(),
        Frame::Metadata(metadata) => to_json(metadata)?,
        Frame::Chunk(chunk) => encode_chunk_payload(chunk)?,
        Frame::Done(done) => to_json(done)?,
    };
    wrap(frame.kind() as u8, &payload)
}

pub fn decode_frame(frame: &[u8]) -> Result<Frame, CoreError> {
    let (kind, payload) = unwrap(frame)?;

    match kind {
        x if x == FrameKind::Hello as u8 => {
            let hello: Hello = from_json(payload)?;
            validate_identity(&hello.identity)?;
            Ok(Frame::Hello(hello))
        }
        x if x == FrameKind::Accepted as u8 => {
            if !payload.is_empty() {
                return Err(CoreError::InvalidFrameLength);
            }
            Ok(Frame::Accepted)
        }
        x if x == FrameKind::Metadata as u8 => Ok(Frame::Metadata(from_json(payload)?)),
        x if x == FrameKind::Chunk as u8 => Ok(Frame::Chunk(decode_chunk_payload(payload)?)),
        x if x == FrameKind::Done as u8 => Ok(Frame::Done(from_json(payload)?)),
        other => Err(CoreError::UnsupportedFrameKind(other)),
    }
}

/// Prefixes `payload` with its length and kind byte.
pub(crate) fn wrap(kind: u8, payload: &[u8]) -> Result<Vec<u8>, CoreError> {
    let frame_len = 1usize
        .checked_add(payload.len())
        .ok_or(CoreError::InvalidFrameLength)?;
    if frame_len + 4 > MAX_FRAME_BYTES {
        return Err(CoreError::InvalidFrameLength);
    }
    let frame_len_u32 = u32::try_from(frame_len).map_err(|_| CoreError::InvalidFrameLength)?;

    let mut out = BytesMut::with_capacity(4 + frame_len);
    out.put_u32_le(frame_len_u32);
    out.put_u8(kind);
    out.extend_from_slice(payload);
    Ok(out.to_vec())
}

pub(crate) fn unwrap(frame: &[u8]) -> Result<(u8, &[u8]), CoreError> {
    if frame.len() < 5 || frame.len() > MAX_FRAME_BYTES {
        return Err(CoreError::InvalidFrameLength);
    }

    let mut cursor = frame;
    let expected_len = cursor.get_u32_le() as usize;
    if expected_len + 4 != frame.len() {
        return Err(CoreError::InvalidFrameLength);
    }

    let kind = cursor.get_u8();
    Ok((kind, cursor))
}

pub(crate) fn to_json<T: Serialize>(value: &T) -> Result<Vec<u8>, CoreError> {
    serde_json::to_vec(value).map_err(|err| CoreError::Serialization(err.to_string()))
}

pub(crate) fn from_json<'a, T: Deserialize<'a>>(payload: &'a [u8]) -> Result<T, CoreError> {
    serde_json::from_slice(payload).map_err(|err| CoreError::Serialization(err.to_string()))
}

fn encode_chunk_payload(chunk: &Chunk) -> Result<Vec<u8>, CoreError> {
    // Layout:
    // - index: u32
    // - bytes_len: u32
    // - bytes
    let bytes_len = u32::try_from(chunk.bytes.len()).map_err(|_| CoreError::InvalidFrameLength)?;

    let mut out = BytesMut::with_capacity(4 + 4 + chunk.bytes.len());
    out.put_u32_le(chunk.index);
    out.put_u32_le(bytes_len);
    out.extend_from_slice(&chunk.bytes);
    Ok(out.to_vec())
}

fn decode_chunk_payload(mut bytes: &[u8]) -> Result<Chunk, CoreError> {
    if bytes.len() < 4 + 4 {
        return Err(CoreError::InvalidFrameLength);
    }

    let index = bytes.get_u32_le();
    let bytes_len = bytes.get_u32_le() as usize;
    if bytes.len() != bytes_len {
        return Err(CoreError::InvalidFrameLength);
    }

    Ok(Chunk {
        index,
        bytes: bytes.to_vec(),
    })
}

use sha2::{Digest, Sha256};

use crate::{
    CoreError,
    frame::{Chunk, Frame, TransferDone, TransferMetadata},
};

#[derive(Debug)]
struct Outgoing {
    metadata: TransferMetadata,
    next_index: u32,
    hasher: Sha256,
}

/// Initiator side of a connection. Turns one file at a time into a metadata frame,
/// an ordered run of chunk frames and a closing `Done` frame.
///
/// The encoder never touches the file itself: the caller reads the slice reported
/// by [`next_chunk_len`](Self::next_chunk_len) and hands it back, which keeps reads
/// strictly sequential.
#[derive(Debug, Default)]
pub struct TransferEncoder {
    current: Option<Outgoing>,
    completed_transfers: u32,
}

impl TransferEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_busy(&self) -> bool {
        self.current.is_some()
    }

    pub fn completed_transfers(&self) -> u32 {
        self.completed_transfers
    }

    pub fn metadata(&self) -> Option<&TransferMetadata> {
        self.current.as_ref().map(|outgoing| &outgoing.metadata)
    }

    pub fn begin(
        &mut self,
        file_name: &str,
        total_size: u64,
        mime: Option<String>,
    ) -> Result<Frame, CoreError> {
        if self.current.is_some() {
            return Err(CoreError::Busy);
        }
        let metadata = TransferMetadata::new(file_name, total_size, mime)?;
        self.current = Some(Outgoing {
            metadata: metadata.clone(),
            next_index: 0,
            hasher: Sha256::new(),
        });
        Ok(Frame::Metadata(metadata))
    }

    pub fn next_chunk_len(&self) -> Option<usize> {
        let outgoing = self.current.as_ref()?;
        crate::chunk_len(
            outgoing.next_index,
            outgoing.metadata.total_size,
            outgoing.metadata.chunk_size as usize,
        )
    }

    pub fn encode_chunk(&mut self, bytes: Vec<u8>) -> Result<Frame, CoreError> {
        let expected = self.next_chunk_len();
        let outgoing = self
            .current
            .as_mut()
            .ok_or_else(|| CoreError::ProtocolViolation("no transfer in flight".to_owned()))?;
        let expected = expected.ok_or_else(|| {
            CoreError::ProtocolViolation("all chunks have already been emitted".to_owned())
        })?;
        if bytes.len() != expected {
            return Err(CoreError::ChunkLengthMismatch {
                index: outgoing.next_index,
                expected,
                actual: bytes.len(),
            });
        }

        outgoing.hasher.update(&bytes);
        let index = outgoing.next_index;
        outgoing.next_index += 1;
        Ok(Frame::Chunk(Chunk { index, bytes }))
    }

    /// `min(1.0, emitted * CHUNK_SIZE / size)`; an empty file is done as soon as
    /// its metadata went out.
    pub fn progress(&self) -> f64 {
        let Some(outgoing) = self.current.as_ref() else {
            return 0.0;
        };
        let metadata = &outgoing.metadata;
        if metadata.total_size == 0 {
            return 1.0;
        }
        let sent = u64::from(outgoing.next_index) * u64::from(metadata.chunk_size);
        (sent as f64 / metadata.total_size as f64).min(1.0)
    }

    pub fn is_complete(&self) -> bool {
        self.current
            .as_ref()
            .is_some_and(|outgoing| outgoing.next_index == outgoing.metadata.total_chunks)
    }

    /// Emits the terminal frame and frees the encoder for the next file.
    pub fn finish(&mut self) -> Result<Frame, CoreError> {
        if !self.is_complete() {
            return Err(CoreError::ProtocolViolation(
                "cannot finish a transfer with chunks left to send".to_owned(),
            ));
        }
        let outgoing = self
            .current
            .take()
            .ok_or_else(|| CoreError::ProtocolViolation("no transfer in flight".to_owned()))?;
        self.completed_transfers += 1;
        Ok(Frame::Done(TransferDone {
            total_chunks: outgoing.metadata.total_chunks,
            sha256: hex::encode(outgoing.hasher.finalize()),
        }))
    }

    /// Drops the in-flight transfer without emitting anything.
    pub fn abort(&mut self) -> Option<TransferMetadata> {
        self.current.take().map(|outgoing| outgoing.metadata)
    }
}

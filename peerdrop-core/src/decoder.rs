//! Responder side reassembly.
//!
//! Chunks land in a slot keyed by their index, so the payload is correct even if
//! the channel reorders frames. Completion is counted: the payload is assembled
//! the moment every slot is filled.

use bytes::Bytes;
use sha2::{Digest, Sha256};

use crate::{
    CoreError,
    frame::{Chunk, TransferDone, TransferMetadata},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadReady {
    pub file_name: String,
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DecoderEvent {
    Started(TransferMetadata),
    Progress { received: u32, total: u32 },
    DownloadReady(DownloadReady),
    /// A superseded transfer that never completed.
    Discarded { file_name: String, received: u32 },
    Verified { file_name: String },
}

#[derive(Debug, Default)]
pub struct TransferState {
    pub metadata: Option<TransferMetadata>,
    slots: Vec<Option<Vec<u8>>>,
    pub received_count: u32,
    pub assembled: Option<Bytes>,
}

impl TransferState {
    fn start(metadata: TransferMetadata) -> Self {
        Self {
            slots: vec![None; metadata.total_chunks as usize],
            metadata: Some(metadata),
            received_count: 0,
            assembled: None,
        }
    }

    pub fn total_chunks(&self) -> u32 {
        self.metadata.as_ref().map_or(0, |m| m.total_chunks)
    }

    pub fn is_complete(&self) -> bool {
        self.assembled.is_some()
    }

    pub fn progress(&self) -> f64 {
        match &self.metadata {
            None => 0.0,
            Some(metadata) if metadata.total_chunks == 0 => 1.0,
            Some(metadata) => f64::from(self.received_count) / f64::from(metadata.total_chunks),
        }
    }
}

#[derive(Debug, Default)]
pub struct TransferDecoder {
    state: TransferState,
    dropped_frames: u64,
    completed_transfers: u32,
}

impl TransferDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &TransferState {
        &self.state
    }

    pub fn progress(&self) -> f64 {
        self.state.progress()
    }

    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames
    }

    pub fn completed_transfers(&self) -> u32 {
        self.completed_transfers
    }

    /// Counts a frame that was discarded without affecting the transfer.
    fn record_dropped(&mut self) {
        self.dropped_frames += 1;
    }

    pub fn on_metadata(&mut self, metadata: TransferMetadata) -> Result<Vec<DecoderEvent>, CoreError> {
        if let Err(err) = metadata.validate() {
            self.record_dropped();
            return Err(err);
        }

        let mut events = Vec::new();
        if let Some(previous) = self.state.metadata.as_ref()
            && !self.state.is_complete()
        {
            events.push(DecoderEvent::Discarded {
                file_name: previous.file_name.clone(),
                received: self.state.received_count,
            });
        }

        self.state = TransferState::start(metadata.clone());
        events.push(DecoderEvent::Started(metadata));
        if self.state.total_chunks() == 0 {
            events.push(self.assemble()?);
        }
        Ok(events)
    }

    pub fn on_chunk(&mut self, chunk: Chunk) -> Result<Vec<DecoderEvent>, CoreError> {
        let result = self.place_chunk(chunk);
        if result.is_err() {
            self.record_dropped();
        }
        result
    }

    fn place_chunk(&mut self, chunk: Chunk) -> Result<Vec<DecoderEvent>, CoreError> {
        let Some(metadata) = self.state.metadata.as_ref() else {
            return Err(CoreError::ProtocolViolation(format!(
                "chunk {} arrived before any metadata",
                chunk.index
            )));
        };
        if self.state.is_complete() {
            return Err(CoreError::ProtocolViolation(format!(
                "chunk {} arrived after {} completed",
                chunk.index, metadata.file_name
            )));
        }
        let expected_len = crate::chunk_len(
            chunk.index,
            metadata.total_size,
            metadata.chunk_size as usize,
        )
        .ok_or_else(|| {
            CoreError::ProtocolViolation(format!(
                "chunk index {} out of range for {} chunks",
                chunk.index, metadata.total_chunks
            ))
        })?;
        if chunk.bytes.len() != expected_len {
            return Err(CoreError::ProtocolViolation(format!(
                "chunk {} carries {} bytes, expected {}",
                chunk.index,
                chunk.bytes.len(),
                expected_len
            )));
        }

        let total = metadata.total_chunks;
        let slot = &mut self.state.slots[chunk.index as usize];
        if slot.is_some() {
            return Err(CoreError::ProtocolViolation(format!(
                "duplicate chunk {}",
                chunk.index
            )));
        }
        *slot = Some(chunk.bytes);
        self.state.received_count += 1;

        let mut events = vec![DecoderEvent::Progress {
            received: self.state.received_count,
            total,
        }];
        if self.state.received_count == total {
            events.push(self.assemble()?);
        }
        Ok(events)
    }

    /// Handles the sender's terminal frame. A transfer that is still missing
    /// chunks at this point can never complete and is discarded.
    pub fn on_done(&mut self, done: TransferDone) -> Result<Vec<DecoderEvent>, CoreError> {
        let Some(metadata) = self.state.metadata.clone() else {
            self.record_dropped();
            return Err(CoreError::ProtocolViolation(
                "done arrived before any metadata".to_owned(),
            ));
        };
        if done.total_chunks != metadata.total_chunks {
            self.record_dropped();
            return Err(CoreError::ProtocolViolation(format!(
                "done announces {} chunks, metadata announced {}",
                done.total_chunks, metadata.total_chunks
            )));
        }

        let Some(payload) = self.state.assembled.as_ref() else {
            let received = self.state.received_count;
            self.state = TransferState::default();
            return Err(CoreError::Stalled {
                received,
                expected: metadata.total_chunks,
            });
        };

        let digest = hex::encode(Sha256::digest(payload));
        if !digest.eq_ignore_ascii_case(&done.sha256) {
            return Err(CoreError::ProtocolViolation(format!(
                "digest mismatch for {}: peer sent {}, received {}",
                metadata.file_name, done.sha256, digest
            )));
        }
        Ok(vec![DecoderEvent::Verified {
            file_name: metadata.file_name,
        }])
    }

    /// Throws away any partial transfer, e.g. when the connection drops.
    pub fn discard(&mut self) -> Option<TransferMetadata> {
        let state = std::mem::take(&mut self.state);
        if state.is_complete() {
            None
        } else {
            state.metadata
        }
    }

    fn assemble(&mut self) -> Result<DecoderEvent, CoreError> {
        let metadata = self
            .state
            .metadata
            .as_ref()
            .ok_or_else(|| CoreError::ProtocolViolation("no transfer to assemble".to_owned()))?;

        let mut payload = Vec::with_capacity(metadata.total_size as usize);
        for slot in self.state.slots.drain(..) {
            match slot {
                Some(bytes) => payload.extend_from_slice(&bytes),
                None => {
                    return Err(CoreError::ProtocolViolation(
                        "assembly attempted with missing chunks".to_owned(),
                    ));
                }
            }
        }
        if payload.len() as u64 != metadata.total_size {
            return Err(CoreError::ProtocolViolation(format!(
                "assembled {} bytes, expected {}",
                payload.len(),
                metadata.total_size
            )));
        }

        let payload = Bytes::from(payload);
        self.state.assembled = Some(payload.clone());
        self.completed_transfers += 1;
        Ok(DecoderEvent::DownloadReady(DownloadReady {
            file_name: metadata.file_name.clone(),
            payload,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        CHUNK_SIZE,
        encoder::tests::encode_payload,
        frame::{Frame, decode_frame, encode_frame},
    };

    fn feed(decoder: &mut TransferDecoder, frame: Frame) -> Result<Vec<DecoderEvent>, CoreError> {
        match frame {
            Frame::Metadata(metadata) => decoder.on_metadata(metadata),
            Frame::Chunk(chunk) => decoder.on_chunk(chunk),
            Frame::Done(done) => decoder.on_done(done),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    fn roundtrip(payload: &[u8]) -> DownloadReady {
        let mut decoder = TransferDecoder::new();
        let mut ready = Vec::new();
        for frame in encode_payload("blob.bin", payload).unwrap() {
            let wire = encode_frame(&frame).unwrap();
            for event in feed(&mut decoder, decode_frame(&wire).unwrap()).unwrap() {
                if let DecoderEvent::DownloadReady(download) = event {
                    ready.push(download);
                }
            }
        }
        assert_eq!(ready.len(), 1, "download must be signaled exactly once");
        ready.remove(0)
    }

    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    fn chunk(index: u32, len: usize) -> Chunk {
        Chunk {
            index,
            bytes: vec![index as u8; len],
        }
    }

    #[test]
    fn roundtrip_preserves_payload_across_sizes() {
        for size in [0, 1000, CHUNK_SIZE, 2 * CHUNK_SIZE + 17] {
            let payload = patterned(size);
            let download = roundtrip(&payload);
            assert_eq!(download.file_name, "blob.bin");
            assert_eq!(download.payload.as_ref(), payload.as_slice(), "size {size}");
        }
    }

    #[test]
    fn empty_file_is_ready_immediately() {
        let mut decoder = TransferDecoder::new();
        let metadata = TransferMetadata::new("empty.txt", 0, None).unwrap();
        let events = decoder.on_metadata(metadata).unwrap();
        assert!(matches!(
            events.last(),
            Some(DecoderEvent::DownloadReady(download)) if download.payload.is_empty()
        ));
        assert_eq!(decoder.progress(), 1.0);
    }

    #[test]
    fn chunk_before_metadata_is_dropped() {
        let mut decoder = TransferDecoder::new();
        assert!(matches!(
            decoder.on_chunk(chunk(0, 10)),
            Err(CoreError::ProtocolViolation(_))
        ));
        assert_eq!(decoder.dropped_frames(), 1);
        assert!(decoder.state().metadata.is_none());
    }

    #[test]
    fn second_metadata_resets_partial_transfer() {
        let mut decoder = TransferDecoder::new();
        let size = 3 * CHUNK_SIZE as u64;
        decoder
            .on_metadata(TransferMetadata::new("first.bin", size, None).unwrap())
            .unwrap();
        decoder.on_chunk(chunk(0, CHUNK_SIZE)).unwrap();
        decoder.on_chunk(chunk(1, CHUNK_SIZE)).unwrap();

        let events = decoder
            .on_metadata(TransferMetadata::new("second.bin", 10, None).unwrap())
            .unwrap();
        assert!(matches!(
            &events[0],
            DecoderEvent::Discarded { file_name, received: 2 } if file_name == "first.bin"
        ));
        assert_eq!(decoder.state().received_count, 0);
        assert_eq!(decoder.progress(), 0.0);

        let events = decoder.on_chunk(chunk(0, 10)).unwrap();
        match events.last() {
            Some(DecoderEvent::DownloadReady(download)) => {
                assert_eq!(download.file_name, "second.bin");
                assert_eq!(download.payload.len(), 10);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn out_of_order_chunks_reassemble_by_index() {
        let payload = patterned(2 * CHUNK_SIZE + 5);
        let mut frames = encode_payload("shuffled.bin", &payload).unwrap();
        // metadata, c0, c1, c2, done -> metadata, c2, c0, c1, done
        frames[1..4].rotate_right(1);

        let mut decoder = TransferDecoder::new();
        let mut download = None;
        for frame in frames {
            for event in feed(&mut decoder, frame).unwrap() {
                if let DecoderEvent::DownloadReady(ready) = event {
                    download = Some(ready);
                }
            }
        }
        assert_eq!(download.unwrap().payload.as_ref(), payload.as_slice());
    }

    #[test]
    fn progress_is_monotonic() {
        let mut decoder = TransferDecoder::new();
        let size = 4 * CHUNK_SIZE as u64 + 1;
        decoder
            .on_metadata(TransferMetadata::new("a.bin", size, None).unwrap())
            .unwrap();
        let mut last = decoder.progress();
        for index in 0..5 {
            let len = crate::chunk_len(index, size, CHUNK_SIZE).unwrap();
            decoder.on_chunk(chunk(index, len)).unwrap();
            let progress = decoder.progress();
            assert!(progress >= last);
            assert_eq!(progress == 1.0, decoder.state().is_complete());
            last = progress;
        }
        assert_eq!(last, 1.0);
    }

    #[test]
    fn malformed_chunks_are_dropped_without_touching_state() {
        let mut decoder = TransferDecoder::new();
        decoder
            .on_metadata(TransferMetadata::new("a.bin", 2 * CHUNK_SIZE as u64, None).unwrap())
            .unwrap();
        decoder.on_chunk(chunk(0, CHUNK_SIZE)).unwrap();

        assert!(decoder.on_chunk(chunk(0, CHUNK_SIZE)).is_err());
        assert!(decoder.on_chunk(chunk(5, CHUNK_SIZE)).is_err());
        assert!(decoder.on_chunk(chunk(1, 3)).is_err());
        assert_eq!(decoder.dropped_frames(), 3);
        assert_eq!(decoder.state().received_count, 1);
    }

    #[test]
    fn done_before_completion_is_stalled() {
        let mut decoder = TransferDecoder::new();
        decoder
            .on_metadata(TransferMetadata::new("a.bin", 2 * CHUNK_SIZE as u64, None).unwrap())
            .unwrap();
        decoder.on_chunk(chunk(0, CHUNK_SIZE)).unwrap();

        let err = decoder
            .on_done(TransferDone {
                total_chunks: 2,
                sha256: String::new(),
            })
            .unwrap_err();
        assert!(matches!(
            err,
            CoreError::Stalled {
                received: 1,
                expected: 2
            }
        ));
        assert!(decoder.state().metadata.is_none());
    }

    #[test]
    fn done_with_wrong_digest_is_a_violation() {
        let mut decoder = TransferDecoder::new();
        decoder
            .on_metadata(TransferMetadata::new("a.bin", 4, None).unwrap())
            .unwrap();
        decoder.on_chunk(chunk(0, 4)).unwrap();
        assert!(matches!(
            decoder.on_done(TransferDone {
                total_chunks: 1,
                sha256: "00".repeat(32),
            }),
            Err(CoreError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn chunk_after_completion_is_dropped() {
        let mut decoder = TransferDecoder::new();
        decoder
            .on_metadata(TransferMetadata::new("a.bin", 4, None).unwrap())
            .unwrap();
        decoder.on_chunk(chunk(0, 4)).unwrap();
        assert!(decoder.on_chunk(chunk(0, 4)).is_err());
        assert_eq!(decoder.completed_transfers(), 1);
    }

    #[test]
    fn foreign_chunk_size_is_dropped_before_allocating() {
        let mut decoder = TransferDecoder::new();
        decoder
            .on_metadata(TransferMetadata::new("keep.bin", 2 * CHUNK_SIZE as u64, None).unwrap())
            .unwrap();
        decoder.on_chunk(chunk(0, CHUNK_SIZE)).unwrap();

        for chunk_size in [1_u32, 1024, CHUNK_SIZE as u32 * 2] {
            let total_size = u64::from(u32::MAX);
            let hostile = TransferMetadata {
                file_name: "huge.bin".to_owned(),
                total_size,
                chunk_size,
                total_chunks: crate::chunk_count(total_size, chunk_size as usize).unwrap(),
                mime: None,
            };
            assert!(matches!(
                decoder.on_metadata(hostile),
                Err(CoreError::ProtocolViolation(_))
            ));
        }

        assert_eq!(decoder.dropped_frames(), 3);
        let state = decoder.state();
        assert_eq!(state.metadata.as_ref().unwrap().file_name, "keep.bin");
        assert_eq!(state.received_count, 1);
        assert_eq!(state.slots.len(), 2);
    }

    #[test]
    fn chunk_count_beyond_transfer_limit_is_dropped() {
        let mut decoder = TransferDecoder::new();
        let oversized = TransferMetadata {
            file_name: "huge.bin".to_owned(),
            total_size: 1,
            chunk_size: CHUNK_SIZE as u32,
            total_chunks: crate::MAX_TRANSFER_CHUNKS + 1,
            mime: None,
        };
        assert!(matches!(
            decoder.on_metadata(oversized),
            Err(CoreError::ProtocolViolation(_))
        ));
        assert!(decoder.state().metadata.is_none());
        assert!(decoder.state().slots.is_empty());

        let largest = TransferMetadata::new("max.bin", crate::MAX_TRANSFER_BYTES, None).unwrap();
        assert_eq!(largest.total_chunks, crate::MAX_TRANSFER_CHUNKS);
    }
}

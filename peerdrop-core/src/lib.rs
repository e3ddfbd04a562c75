pub mod call;
pub mod decoder;
pub mod encoder;
pub mod frame;
pub mod session;
pub mod signal;

use thiserror::Error;

pub use call::{CallRequest, CallState, CallStateMachine, Role};
pub use decoder::{DecoderEvent, DownloadReady, TransferDecoder, TransferState};
pub use encoder::TransferEncoder;
pub use frame::{Chunk, Frame, FrameKind, Hello, TransferDone, TransferMetadata, decode_frame, encode_frame};
pub use session::{ChannelEvent, Session, SessionEvent, SessionSnapshot};
pub use signal::{SignalError, SignalErrorKind, SignalMessage, decode_signal, encode_signal};

pub const CHUNK_SIZE: usize = 256 * 1024;
pub const MAX_FRAME_BYTES: usize = CHUNK_SIZE + 64 * 1024;
pub const MAX_TRANSFER_BYTES: u64 = 4 * 1024 * 1024 * 1024;
/// Upper bound on the decoder's slot table.
pub const MAX_TRANSFER_CHUNKS: u32 = MAX_TRANSFER_BYTES.div_ceil(CHUNK_SIZE as u64) as u32;
pub const MAX_FILE_NAME_LEN: usize = 255;
pub const MAX_IDENTITY_LEN: usize = 64;
pub const MAX_MIME_LEN: usize = 128;

pub type PeerIdentity = String;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("identity {0} is already taken")]
    IdentityUnavailable(String),
    #[error("dial to {remote} failed: {reason}")]
    DialFailed { remote: String, reason: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("a transfer is already in flight on this connection")]
    Busy,
    #[error("{operation} is not valid in state {state}")]
    InvalidState {
        operation: &'static str,
        state: CallState,
    },
    #[error("transfer stalled: peer finished after {received} of {expected} chunks")]
    Stalled { received: u32, expected: u32 },
    #[error("invalid identity: {0}")]
    InvalidIdentity(String),
    #[error("file of {size} bytes exceeds the transfer limit")]
    FileTooLarge { size: u64 },
    #[error("chunk {index} has {actual} bytes, expected {expected}")]
    ChunkLengthMismatch {
        index: u32,
        expected: usize,
        actual: usize,
    },
    #[error("invalid frame length")]
    InvalidFrameLength,
    #[error("unsupported frame kind {0}")]
    UnsupportedFrameKind(u8),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl CoreError {
    /// Errors that end the connection they occurred on.
    pub fn is_terminal(&self) -> bool {
        matches!(self, CoreError::Transport(_))
    }
}

/// Number of `chunk_size` slices needed to carry `total_size` bytes.
pub fn chunk_count(total_size: u64, chunk_size: usize) -> Result<u32, CoreError> {
    if chunk_size == 0 {
        return Err(CoreError::ProtocolViolation("chunk size must be non-zero".to_owned()));
    }
    let chunk_size = chunk_size as u64;
    let count = total_size.div_ceil(chunk_size);
    u32::try_from(count).map_err(|_| CoreError::FileTooLarge { size: total_size })
}

/// Byte length of slice `index` of a `total_size` byte file.
pub fn chunk_len(index: u32, total_size: u64, chunk_size: usize) -> Option<usize> {
    let start = u64::from(index).checked_mul(chunk_size as u64)?;
    if start >= total_size {
        return None;
    }
    let remaining = total_size - start;
    Some(remaining.min(chunk_size as u64) as usize)
}

pub fn validate_identity(identity: &str) -> Result<(), CoreError> {
    if identity.is_empty() {
        return Err(CoreError::InvalidIdentity("identity must not be empty".to_owned()));
    }
    if identity.len() > MAX_IDENTITY_LEN {
        return Err(CoreError::InvalidIdentity(format!(
            "identity exceeds {MAX_IDENTITY_LEN} chars"
        )));
    }
    if !identity
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
    {
        return Err(CoreError::InvalidIdentity(format!(
            "identity {identity:?} may only contain letters, digits, '-' and '_'"
        )));
    }
    Ok(())
}

/// Human-readable size: KB below one MiB, then MB, then GB.
pub fn format_file_size(size: u64) -> String {
    const KIB: f64 = 1024.0;
    const MIB: f64 = KIB * 1024.0;
    const GIB: f64 = MIB * 1024.0;

    let size = size as f64;
    if size >= GIB {
        format!("{:.2} GB", size / GIB)
    } else if size >= MIB {
        format!("{:.2} MB", size / MIB)
    } else {
        format!("{:.2} KB", size / KIB)
    }
}

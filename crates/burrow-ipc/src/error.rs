use thiserror::Error;

/// Socket, framing, and CBOR failures on the burrow transport.
#[derive(Debug, Error)]
pub enum IpcError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode cbor payload: {0}")]
    Encode(String),
    #[error("failed to decode cbor payload: {0}")]
    Decode(String),
    #[error("request timed out")]
    Timeout,
    /// Declared or actual payload size is above [`crate::framing::MAX_FRAME_SIZE`].
    #[error("frame too large: {size} > {max}")]
    FrameTooLarge { size: u32, max: u32 },
    /// The peer went away before a response arrived.
    #[error("connection closed")]
    Closed,
    #[error("protocol mismatch: expected {expected}, got {actual}")]
    ProtocolMismatch { expected: u32, actual: u32 },
}

impl IpcError {
    /// True for read errors that just mean the peer hung up.
    pub fn is_disconnect(&self) -> bool {
        match self {
            Self::Io(err) => matches!(
                err.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::BrokenPipe
            ),
            Self::Closed => true,
            _ => false,
        }
    }
}

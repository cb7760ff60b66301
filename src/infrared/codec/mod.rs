//! Minecraft wire format: varints, typed field readers/writers, Java packet
//! frames and Bedrock batches.

pub mod bedrock;
pub mod bedrock_login;
pub mod buf;
pub mod java;
pub mod packet;
pub mod varint;

use thiserror::Error;

pub use buf::{Reader, Writer};
pub use packet::Packet;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("varint too long")]
    VarintTooLong,
    #[error("truncated: need {need} more bytes")]
    Truncated { need: usize },
    #[error("batch too large: more than {max} packets")]
    BatchTooLarge { max: usize },
    #[error("unexpected packet id {got:#04x} (expected {expected:#04x})")]
    UnexpectedPacketId { expected: i32, got: i32 },
    #[error("invalid string: {0}")]
    InvalidString(String),
    #[error("compression: {0}")]
    Compression(String),
    #[error("invalid login: {0}")]
    InvalidLogin(String),
    #[error(transparent)]
    Io(std::io::Error),
}

impl From<std::io::Error> for CodecError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            return CodecError::MalformedFrame("stream ended early".into());
        }
        CodecError::Io(err)
    }
}

impl CodecError {
    /// Short label used for metrics and event payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            CodecError::MalformedFrame(_) => "malformed_frame",
            CodecError::VarintTooLong => "varint_too_long",
            CodecError::Truncated { .. } => "truncated",
            CodecError::BatchTooLarge { .. } => "batch_too_large",
            CodecError::UnexpectedPacketId { .. } => "unexpected_packet_id",
            CodecError::InvalidString(_) => "invalid_string",
            CodecError::Compression(_) => "compression",
            CodecError::InvalidLogin(_) => "invalid_login",
            CodecError::Io(err) if err.kind() == std::io::ErrorKind::TimedOut => "timeout",
            CodecError::Io(_) => "io",
        }
    }
}

//! Error types surfaced by the decoder and its collaborators.

use thiserror::Error;

/// Errors returned by [`OpusDecoder`](crate::opus_decoder::OpusDecoder).
///
/// Corrupt payloads never show up here: they are concealed like lost
/// packets.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    /// An argument is out of range, e.g. a frame size that is not a multiple
    /// of 2.5 ms.
    #[error("invalid argument")]
    BadArgument,
    /// The output buffer cannot hold the requested duration.
    #[error("output buffer too small")]
    BufferTooSmall,
    /// The packet header or its frame layout is malformed.
    #[error("invalid packet")]
    InvalidPacket,
    /// An internal invariant was violated.
    #[error("internal error")]
    InternalError,
}

/// Errors produced while parsing a packet header.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    /// The frame layout is inconsistent with the packet length.
    #[error("invalid packet")]
    InvalidPacket,
}

impl From<PacketError> for DecodeError {
    fn from(value: PacketError) -> Self {
        match value {
            PacketError::InvalidPacket => DecodeError::InvalidPacket,
        }
    }
}

/// Failures reported by the speech and transform decoders.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum CollaboratorError {
    /// The payload is self-inconsistent. Treated like a lost packet.
    #[error("corrupt frame")]
    Corrupt,
    /// The output slice is shorter than the frame.
    #[error("buffer too small")]
    BufferTooSmall,
    /// An internal invariant was violated.
    #[error("internal error")]
    Internal,
}

impl From<CollaboratorError> for DecodeError {
    fn from(value: CollaboratorError) -> Self {
        match value {
            CollaboratorError::BufferTooSmall => DecodeError::BufferTooSmall,
            CollaboratorError::Corrupt | CollaboratorError::Internal => DecodeError::InternalError,
        }
    }
}

/// Errors returned when a decoder is constructed.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum DecoderInitError {
    /// The sample rate is not one of 8, 12, 16, 24 or 48 kHz.
    #[error("unsupported sample rate {0} Hz")]
    InvalidSampleRate(u32),
    /// Only mono and stereo are supported.
    #[error("unsupported channel count {0}")]
    InvalidChannels(usize),
    /// The output gain is outside the Q8 dB range.
    #[error("gain {0} out of range")]
    InvalidGain(i32),
    /// The complexity is outside `0..=10`.
    #[error("complexity {0} out of range")]
    InvalidComplexity(u32),
}

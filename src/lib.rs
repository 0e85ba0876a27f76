#![no_std]

//! Core of an Opus-family decoder: the range coder every layer reads its
//! symbols through, a transform-layer decoder with packet-loss concealment,
//! and the frame dispatcher that routes packets between the speech and
//! transform layers.
//!
//! The speech layer and the transform layer's band pipeline are supplied by
//! the caller through [`SpeechModelDecoder`] and [`BandDecoder`].

extern crate alloc;

pub mod celt;
pub mod error;
pub mod opus;
pub mod opus_decoder;
pub mod packet;
pub mod silk;

pub use celt::{BandDecoder, BandFrame, CeltDecoder, EcDec, EcEnc, TransformFrame, TransformModelDecoder};
pub use error::{CollaboratorError, DecodeError, DecoderInitError, PacketError};
pub use opus_decoder::{Concealment, DecoderConfig, OpusDecoder};
pub use packet::{Bandwidth, HeaderParser, Mode, ParsedPacket, Toc, TocParser};
pub use silk::{DecControl, DecodeFlag, SpeechModelDecoder};

//! Call contract of the linear-prediction ("speech") layer.
//!
//! The speech layer itself lives outside this crate. The dispatcher drives it
//! through [`SpeechModelDecoder`], one 10 or 20 ms frame at a time, and
//! describes each call with a [`DecControl`].

use crate::celt::EcDec;
use crate::error::CollaboratorError;
use crate::packet::Bandwidth;

/// How the speech layer should treat the current frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecodeFlag {
    /// Regular frame decode.
    Normal,
    /// Packet was lost; synthesize audio via PLC/CNG only.
    PacketLoss,
    /// Decode the low-bit-rate redundancy (LBRR) data instead of the primary frame.
    Lbrr,
}

/// Decoder control parameters handed to the speech layer on every call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecControl {
    /// Number of channels advertised through the public API (1 or 2).
    pub n_channels_api: usize,
    /// Number of internally decoded channels (1 or 2).
    pub n_channels_internal: usize,
    /// Output sample rate in Hertz.
    pub api_sample_rate: u32,
    /// Internal decoder sample rate in Hertz.
    pub internal_sample_rate: u32,
    /// Packet duration in milliseconds (10/20/40/60).
    pub payload_size_ms: usize,
    /// Complexity requested by the application, 0 to 10.
    pub complexity: u32,
}

impl Default for DecControl {
    fn default() -> Self {
        Self {
            n_channels_api: 1,
            n_channels_internal: 1,
            api_sample_rate: 16_000,
            internal_sample_rate: 16_000,
            payload_size_ms: 20,
            complexity: 0,
        }
    }
}

impl DecControl {
    /// Selects the internal rate for a packet of `bandwidth`.
    ///
    /// Hybrid packets always run the speech layer at 16 kHz.
    pub fn set_bandwidth(&mut self, bandwidth: Bandwidth, hybrid: bool) {
        self.internal_sample_rate = if hybrid { 16_000 } else { bandwidth.silk_sample_rate() };
    }
}

/// Decoder of the speech layer.
pub trait SpeechModelDecoder {
    /// Decodes one internal frame into interleaved 16-bit `pcm` at
    /// `control.api_sample_rate`.
    ///
    /// `dec` is `None` only for [`DecodeFlag::PacketLoss`]. `first_frame`
    /// marks the first call for a packet, when the per-packet side
    /// information is read. Returns the samples per channel written, which
    /// the dispatcher accumulates until the requested duration is covered.
    ///
    /// # Errors
    ///
    /// [`CollaboratorError::Corrupt`] when the payload does not decode
    /// consistently, [`CollaboratorError::BufferTooSmall`] when `pcm` cannot
    /// hold the frame.
    fn decode(
        &mut self,
        dec: Option<&mut EcDec<'_>>,
        control: &DecControl,
        flag: DecodeFlag,
        first_frame: bool,
        pcm: &mut [i16],
    ) -> Result<usize, CollaboratorError>;

    /// Clears the decoder state, as after a switch from the transform layer.
    fn reset(&mut self);

    /// Pitch lag of the last decoded frame, in samples at the API rate.
    fn pitch_lag(&self) -> usize;
}

//! Top-level decoder: packet dispatch across the speech and transform layers.
//!
//! [`OpusDecoder`] owns the session state that outlives individual packets:
//! the previous coding mode, the bandwidth and channel layout of the last
//! packet, the redundancy bookkeeping and the loss run length. Each packet is
//! split into frames by a [`HeaderParser`]; every frame is then decoded by the
//! speech layer, the transform layer or both, with redundant 5 ms frames and
//! short crossfades smoothing the seams between modes.
//!
//! Missing data is concealed in chunks of at most 20 ms through the same
//! layers. Concealment is a pure computation on a copy of the session
//! ([`OpusDecoder::preview_conceal`]) that is applied separately
//! ([`OpusDecoder::commit`]). Frames that fail to decode consistently are
//! concealed as well, after the session is rolled back to its state before
//! the frame.

use alloc::vec;
use alloc::vec::Vec;

use log::{debug, trace, warn};

use crate::celt::{
    EcDec, HYBRID_START_BAND, NB_EBANDS, STANDARD_MODE, TransformFrame, TransformModelDecoder,
};
use crate::error::{CollaboratorError, DecodeError, DecoderInitError};
use crate::opus::{float_to_i16, gain_scale, opus_pcm_soft_clip};
use crate::packet::{Bandwidth, HeaderParser, Mode, ParsedPacket, TocParser};
use crate::silk::{DecControl, DecodeFlag, SpeechModelDecoder};

/// Maximum supported channel count.
const MAX_CHANNELS: usize = 2;

/// Payload decoding a hybrid-to-speech seam: a transform frame whose silence
/// flag is set.
const SILENCE_FRAME: [u8; 2] = [0xff, 0xff];

/// Decoder configuration, validated once at construction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DecoderConfig {
    /// Output rate: 8, 12, 16, 24 or 48 kHz.
    pub sample_rate: u32,
    /// Output channels, 1 or 2.
    pub channels: usize,
    /// Output gain in Q8 dB.
    pub gain: i32,
    /// Complexity forwarded to the speech layer, 0 to 10.
    pub complexity: u32,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            channels: 1,
            gain: 0,
            complexity: 0,
        }
    }
}

impl DecoderConfig {
    /// Checks every field against its legal range.
    ///
    /// # Errors
    ///
    /// The [`DecoderInitError`] naming the first offending field.
    pub fn validate(&self) -> Result<(), DecoderInitError> {
        if !matches!(self.sample_rate, 48_000 | 24_000 | 16_000 | 12_000 | 8_000) {
            return Err(DecoderInitError::InvalidSampleRate(self.sample_rate));
        }
        if !(1..=MAX_CHANNELS).contains(&self.channels) {
            return Err(DecoderInitError::InvalidChannels(self.channels));
        }
        validate_gain(self.gain)?;
        validate_complexity(self.complexity)
    }

    fn f20(&self) -> usize {
        self.sample_rate as usize / 50
    }
}

fn validate_gain(gain: i32) -> Result<(), DecoderInitError> {
    if (-32_768..=32_767).contains(&gain) {
        Ok(())
    } else {
        Err(DecoderInitError::InvalidGain(gain))
    }
}

fn validate_complexity(complexity: u32) -> Result<(), DecoderInitError> {
    if complexity <= 10 {
        Ok(())
    } else {
        Err(DecoderInitError::InvalidComplexity(complexity))
    }
}

/// Session fields owned by the dispatcher itself.
#[derive(Clone, Debug, PartialEq)]
struct Session {
    stream_channels: usize,
    bandwidth: Option<Bandwidth>,
    mode: Option<Mode>,
    prev_mode: Option<Mode>,
    /// Samples per channel of the frames in the last packet.
    frame_size: usize,
    prev_redundancy: bool,
    /// Transform end band of the last packet.
    end_band: usize,
    range_final: u32,
    loss_run_length: usize,
    last_packet_duration: usize,
}

impl Session {
    fn new(config: &DecoderConfig) -> Self {
        Self {
            stream_channels: config.channels,
            bandwidth: None,
            mode: None,
            prev_mode: None,
            frame_size: config.sample_rate as usize / 400,
            prev_redundancy: false,
            end_band: NB_EBANDS,
            range_final: 0,
            loss_run_length: 0,
            last_packet_duration: 0,
        }
    }

    fn enter_packet(&mut self, packet: &ParsedPacket<'_>) {
        if self.mode != Some(packet.mode) {
            trace!("mode {:?} -> {:?}", self.mode, packet.mode);
        }
        self.mode = Some(packet.mode);
        self.bandwidth = Some(packet.bandwidth);
        self.frame_size = packet.frame_size;
        self.stream_channels = packet.channels;
    }
}

/// Why a frame could not be decoded.
enum FrameFailure {
    /// The payload is self-inconsistent; the frame is concealed instead.
    Corrupt,
    Fatal(DecodeError),
}

impl From<DecodeError> for FrameFailure {
    fn from(value: DecodeError) -> Self {
        FrameFailure::Fatal(value)
    }
}

impl From<CollaboratorError> for FrameFailure {
    fn from(value: CollaboratorError) -> Self {
        match value {
            CollaboratorError::Corrupt => FrameFailure::Corrupt,
            other => FrameFailure::Fatal(other.into()),
        }
    }
}

/// Everything a frame decode may mutate: both layers and the session.
#[derive(Clone, Debug)]
struct Layers<S, T> {
    speech: S,
    transform: T,
    control: DecControl,
    session: Session,
}

/// Crossfades the first `overlap` interleaved samples of `pcm` with `other`
/// using the squared transform window.
///
/// With `fade_in` set `pcm` is the incoming signal; otherwise `other` is.
fn smooth_fade(
    pcm: &mut [f32],
    other: &[f32],
    fade_in: bool,
    overlap: usize,
    channels: usize,
    window: &[f32],
    sample_rate: u32,
) {
    let inc = (48_000 / sample_rate) as usize;
    for c in 0..channels {
        for i in 0..overlap {
            let w = window[i * inc] * window[i * inc];
            let idx = i * channels + c;
            let (incoming, outgoing) = if fade_in {
                (pcm[idx], other[idx])
            } else {
                (other[idx], pcm[idx])
            };
            pcm[idx] = w * incoming + (1.0 - w) * outgoing;
        }
    }
}

impl<S, T> Layers<S, T>
where
    S: SpeechModelDecoder + Clone,
    T: TransformModelDecoder + Clone,
{
    /// Conceals exactly `frame_size` samples per channel.
    fn conceal(
        &mut self,
        config: &DecoderConfig,
        window: &[f32],
        pcm: &mut [f32],
        frame_size: usize,
    ) -> Result<usize, DecodeError> {
        let channels = config.channels;
        let mut count = 0;
        while count < frame_size {
            let out = &mut pcm[count * channels..];
            let ret = match self.decode_frame(config, window, None, out, frame_size - count, false) {
                Ok(ret) => ret,
                Err(FrameFailure::Fatal(err)) => return Err(err),
                Err(FrameFailure::Corrupt) => return Err(DecodeError::InternalError),
            };
            if ret == 0 {
                return Err(DecodeError::InternalError);
            }
            count += ret;
        }
        Ok(count)
    }

    /// Runs concealment on a copy of the layers, leaving `self` untouched.
    fn preview(
        &self,
        config: &DecoderConfig,
        window: &[f32],
        frame_size: usize,
    ) -> Result<Vec<f32>, FrameFailure> {
        let mut scratch = self.clone();
        let mut pcm = vec![0.0; frame_size * config.channels];
        scratch.decode_frame(config, window, None, &mut pcm, frame_size, false)?;
        Ok(pcm)
    }

    /// Decodes one frame of `data`, or conceals up to `frame_size` samples
    /// when `data` is `None`. Returns the samples per channel written.
    #[allow(clippy::too_many_lines)]
    fn decode_frame(
        &mut self,
        config: &DecoderConfig,
        window: &[f32],
        data: Option<&[u8]>,
        pcm: &mut [f32],
        frame_size: usize,
        decode_fec: bool,
    ) -> Result<usize, FrameFailure> {
        let fs = config.sample_rate;
        let channels = config.channels;
        let f20 = config.f20();
        let f10 = f20 / 2;
        let f5 = f10 / 2;
        let f2_5 = f5 / 2;

        let data = data.filter(|d| d.len() > 1);
        if frame_size < f2_5 {
            return Err(DecodeError::BufferTooSmall.into());
        }
        let mut frame_size = frame_size.min(fs as usize / 25 * 3);

        let (audiosize, mode, bandwidth) = match data {
            Some(_) => {
                let mode = self.session.mode.ok_or(DecodeError::InternalError)?;
                (self.session.frame_size, mode, self.session.bandwidth)
            }
            None => {
                frame_size = frame_size.min(self.session.frame_size);
                let previous = if self.session.prev_redundancy {
                    Some(Mode::Celt)
                } else {
                    self.session.prev_mode
                };
                let Some(mode) = previous else {
                    pcm[..frame_size * channels].fill(0.0);
                    return Ok(frame_size);
                };
                let mut audiosize = frame_size;
                if audiosize > f20 {
                    audiosize = f20;
                } else if audiosize < f20 {
                    if audiosize > f10 {
                        audiosize = f10;
                    } else if mode != Mode::Silk && audiosize > f5 && audiosize < f10 {
                        audiosize = f5;
                    }
                }
                debug!("concealing {audiosize} samples in {mode:?} mode");
                (audiosize, mode, None)
            }
        };

        let mut dec = data.map(EcDec::new);
        let mut len = data.map_or(0, <[u8]>::len);

        let prev_mode = self.session.prev_mode;
        let mut transition = data.is_some()
            && prev_mode.is_some()
            && ((mode == Mode::Celt && prev_mode != Some(Mode::Celt) && !self.session.prev_redundancy)
                || (mode != Mode::Celt && prev_mode == Some(Mode::Celt)));

        let mut pcm_transition = Vec::new();
        if transition && mode == Mode::Celt {
            trace!("{prev_mode:?} -> {mode:?} transition, previewing previous mode");
            pcm_transition = self.preview(config, window, f5.min(audiosize))?;
        }

        if audiosize > frame_size {
            return Err(DecodeError::BadArgument.into());
        }
        frame_size = audiosize;

        let mut pcm_silk = Vec::new();
        if mode != Mode::Celt {
            pcm_silk = vec![0i16; f10.max(frame_size) * channels];
            if prev_mode == Some(Mode::Celt) {
                self.speech.reset();
            }
            self.control.payload_size_ms = (1000 * audiosize / fs as usize).max(10);
            self.control.n_channels_api = channels;
            self.control.api_sample_rate = fs;
            self.control.complexity = config.complexity;
            if let Some(bandwidth) = bandwidth {
                self.control.n_channels_internal = self.session.stream_channels;
                self.control.set_bandwidth(bandwidth, mode == Mode::Hybrid);
            }

            let flag = match (data.is_some(), decode_fec) {
                (false, _) => DecodeFlag::PacketLoss,
                (true, true) => DecodeFlag::Lbrr,
                (true, false) => DecodeFlag::Normal,
            };
            let mut decoded = 0;
            while decoded < frame_size {
                let out = &mut pcm_silk[decoded * channels..];
                let coder = if flag == DecodeFlag::PacketLoss { None } else { dec.as_mut() };
                let produced = match self.speech.decode(coder, &self.control, flag, decoded == 0, out) {
                    Ok(produced) => produced,
                    Err(err) if flag == DecodeFlag::PacketLoss => {
                        warn!("speech layer failed to conceal ({err}), filling with silence");
                        let remaining = frame_size - decoded;
                        out[..remaining * channels].fill(0);
                        remaining
                    }
                    Err(err) => return Err(err.into()),
                };
                if produced == 0 {
                    return Err(DecodeError::InternalError.into());
                }
                decoded += produced;
            }
        }

        let mut redundancy = false;
        let mut celt_to_silk = false;
        let mut redundancy_bytes = 0usize;
        if !decode_fec && mode != Mode::Celt {
            if let Some(dec) = dec.as_mut() {
                let hybrid = mode == Mode::Hybrid;
                if dec.tell() + 17 + 20 * i32::from(hybrid) <= 8 * len as i32 {
                    redundancy = if hybrid { dec.dec_bit_logp(12) } else { true };
                    if redundancy {
                        celt_to_silk = dec.dec_bit_logp(1);
                        redundancy_bytes = if hybrid {
                            dec.dec_uint(256) as usize + 2
                        } else {
                            len - ((dec.tell() as usize + 7) >> 3)
                        };
                        if redundancy_bytes > len || ((len - redundancy_bytes) * 8) < dec.tell() as usize {
                            len = 0;
                            redundancy_bytes = 0;
                            redundancy = false;
                        } else {
                            len -= redundancy_bytes;
                        }
                        dec.shrink_storage(redundancy_bytes as u32);
                        trace!(
                            "redundant frame: {redundancy_bytes} bytes, {}",
                            if celt_to_silk { "before the main frame" } else { "after the main frame" }
                        );
                    }
                }
            }
        }
        let start_band = if mode == Mode::Celt { 0 } else { HYBRID_START_BAND };

        if redundancy {
            transition = false;
        }
        if transition && mode != Mode::Celt {
            trace!("{prev_mode:?} -> {mode:?} transition, previewing previous mode");
            pcm_transition = self.preview(config, window, f5.min(audiosize))?;
        }

        if let Some(bandwidth) = bandwidth {
            self.session.end_band = bandwidth.celt_end_band();
        }
        let transform_frame = |frame_size, start_band| TransformFrame {
            frame_size,
            start_band,
            end_band: self.session.end_band,
            stream_channels: self.session.stream_channels,
            accumulate: false,
        };
        let redundant_payload = match data {
            Some(data) if redundancy => &data[len..len + redundancy_bytes],
            _ => &[][..],
        };

        let mut redundant_audio = Vec::new();
        let mut redundant_rng = 0;
        if redundancy {
            redundant_audio = vec![0.0; f5 * channels];
        }
        if redundancy && celt_to_silk {
            self.transform.decode(None, Some(redundant_payload), &transform_frame(f5, 0), &mut redundant_audio)?;
            redundant_rng = self.transform.final_range();
        }

        if mode != Mode::Silk {
            let celt_frame_size = f20.min(frame_size);
            if Some(mode) != prev_mode && prev_mode.is_some() && !self.session.prev_redundancy {
                self.transform.reset();
            }
            let frame = transform_frame(celt_frame_size, start_band);
            let out = &mut pcm[..celt_frame_size * channels];
            if decode_fec {
                self.transform.decode(None, None, &frame, out)?;
            } else {
                self.transform.decode(dec.as_mut(), data.map(|d| &d[..len]), &frame, out)?;
            }
        } else {
            pcm[..frame_size * channels].fill(0.0);
            if prev_mode == Some(Mode::Hybrid)
                && !(redundancy && celt_to_silk && self.session.prev_redundancy)
            {
                trace!("flushing the transform layer with a silence frame");
                let frame = transform_frame(f2_5, 0);
                self.transform.decode(None, Some(&SILENCE_FRAME), &frame, &mut pcm[..f2_5 * channels])?;
            }
        }

        if mode != Mode::Celt {
            for (out, &s) in pcm[..frame_size * channels].iter_mut().zip(&pcm_silk) {
                *out += f32::from(s) / 32_768.0;
            }
        }

        if redundancy && !celt_to_silk {
            self.transform.reset();
            self.transform.decode(None, Some(redundant_payload), &transform_frame(f5, 0), &mut redundant_audio)?;
            redundant_rng = self.transform.final_range();
            let fade_off = channels * (frame_size - f2_5);
            smooth_fade(
                &mut pcm[fade_off..],
                &redundant_audio[channels * f2_5..],
                false,
                f2_5,
                channels,
                window,
                fs,
            );
        }
        if redundancy && celt_to_silk && (prev_mode != Some(Mode::Silk) || self.session.prev_redundancy) {
            let head = channels * f2_5;
            pcm[..head].copy_from_slice(&redundant_audio[..head]);
            smooth_fade(&mut pcm[head..], &redundant_audio[head..], true, f2_5, channels, window, fs);
        }

        if transition {
            let head = channels * f2_5;
            if audiosize >= f5 {
                pcm[..head].copy_from_slice(&pcm_transition[..head]);
                smooth_fade(&mut pcm[head..], &pcm_transition[head..], true, f2_5, channels, window, fs);
            } else {
                smooth_fade(pcm, &pcm_transition, true, f2_5, channels, window, fs);
            }
        }

        if config.gain != 0 {
            let gain = gain_scale(config.gain);
            for sample in &mut pcm[..frame_size * channels] {
                *sample *= gain;
            }
        }

        match dec {
            Some(dec) if dec.error() => return Err(FrameFailure::Corrupt),
            Some(dec) => {
                self.session.range_final = dec.rng() ^ redundant_rng;
                self.session.loss_run_length = 0;
            }
            None => {
                self.session.range_final = 0;
                self.session.loss_run_length += 1;
            }
        }
        self.session.prev_mode = Some(mode);
        self.session.prev_redundancy = redundancy && !celt_to_silk;
        Ok(audiosize)
    }
}

/// Audio fabricated for a missing stretch of the stream, together with the
/// session it leaves behind.
///
/// Produced by [`OpusDecoder::preview_conceal`]; applying it with
/// [`OpusDecoder::commit`] advances the decoder as if the concealment had
/// been decoded directly.
#[derive(Clone, Debug)]
pub struct Concealment<S, T> {
    pcm: Vec<f32>,
    samples: usize,
    layers: Layers<S, T>,
}

impl<S, T> Concealment<S, T> {
    /// Interleaved concealment audio.
    #[must_use]
    pub fn pcm(&self) -> &[f32] {
        &self.pcm
    }

    /// Samples per channel.
    #[must_use]
    pub fn samples(&self) -> usize {
        self.samples
    }
}

/// Packet decoder over a speech layer `S`, a transform layer `T` and a
/// header parser `P`.
///
/// Both layers must produce audio at the configured rate and channel count.
#[derive(Clone, Debug)]
pub struct OpusDecoder<S, T, P = TocParser> {
    config: DecoderConfig,
    window: Vec<f32>,
    parser: P,
    layers: Layers<S, T>,
    /// Soft-clipping memory of the 16-bit output path.
    softclip_mem: [f32; MAX_CHANNELS],
}

impl<S, T> OpusDecoder<S, T, TocParser>
where
    S: SpeechModelDecoder + Clone,
    T: TransformModelDecoder + Clone,
{
    /// Creates a decoder for standard packets.
    ///
    /// # Errors
    ///
    /// Fails when `config` does not validate.
    pub fn new(config: DecoderConfig, speech: S, transform: T) -> Result<Self, DecoderInitError> {
        Self::with_parser(config, speech, transform, TocParser)
    }
}

impl<S, T, P> OpusDecoder<S, T, P>
where
    S: SpeechModelDecoder + Clone,
    T: TransformModelDecoder + Clone,
    P: HeaderParser,
{
    /// Creates a decoder that frames packets with `parser`.
    ///
    /// # Errors
    ///
    /// Fails when `config` does not validate.
    pub fn with_parser(
        config: DecoderConfig,
        speech: S,
        transform: T,
        parser: P,
    ) -> Result<Self, DecoderInitError> {
        config.validate()?;
        let control = DecControl {
            n_channels_api: config.channels,
            n_channels_internal: config.channels,
            api_sample_rate: config.sample_rate,
            complexity: config.complexity,
            ..DecControl::default()
        };
        Ok(Self {
            config,
            window: STANDARD_MODE.window(),
            parser,
            layers: Layers {
                speech,
                transform,
                control,
                session: Session::new(&config),
            },
            softclip_mem: [0.0; MAX_CHANNELS],
        })
    }

    /// Decodes a packet into interleaved float PCM.
    ///
    /// `data` of `None` (or empty) conceals `frame_size` samples per channel.
    /// With `decode_fec` set the in-band redundancy of the speech layer is
    /// decoded in place of the packet's own audio, so that the packet
    /// *preceding* `data` is recovered. Returns the samples per channel
    /// written.
    ///
    /// # Errors
    ///
    /// - [`DecodeError::BadArgument`] when `frame_size` is zero, or not a
    ///   multiple of 2.5 ms while concealing or recovering.
    /// - [`DecodeError::BufferTooSmall`] when `pcm` or `frame_size` cannot
    ///   hold the packet.
    /// - [`DecodeError::InvalidPacket`] when the packet framing is malformed.
    pub fn decode_float(
        &mut self,
        data: Option<&[u8]>,
        pcm: &mut [f32],
        frame_size: usize,
        decode_fec: bool,
    ) -> Result<usize, DecodeError> {
        self.decode_native(data, pcm, frame_size, decode_fec, false)
    }

    /// Decodes a packet into interleaved 16-bit PCM.
    ///
    /// The float output is soft-clipped before conversion.
    ///
    /// # Errors
    ///
    /// As [`OpusDecoder::decode_float`].
    pub fn decode(
        &mut self,
        data: Option<&[u8]>,
        pcm: &mut [i16],
        frame_size: usize,
        decode_fec: bool,
    ) -> Result<usize, DecodeError> {
        if frame_size == 0 {
            return Err(DecodeError::BadArgument);
        }
        let data = data.filter(|d| !d.is_empty());
        let mut frame_size = frame_size;
        if let Some(packet) = data {
            if !decode_fec {
                let samples = self.nb_samples(packet)?;
                frame_size = frame_size.min(samples);
            }
        }
        let channels = self.config.channels;
        if pcm.len() < frame_size * channels {
            return Err(DecodeError::BufferTooSmall);
        }
        let mut out = vec![0.0f32; frame_size * channels];
        let ret = self.decode_native(data, &mut out, frame_size, decode_fec, true)?;
        for (dst, &src) in pcm.iter_mut().zip(&out[..ret * channels]) {
            *dst = float_to_i16(src);
        }
        Ok(ret)
    }

    /// Total samples per channel in `packet` at the decoder's rate.
    ///
    /// # Errors
    ///
    /// [`DecodeError::InvalidPacket`] when the packet cannot be framed.
    pub fn nb_samples(&self, packet: &[u8]) -> Result<usize, DecodeError> {
        let parsed = self.parser.parse(packet, self.config.sample_rate)?;
        let samples = parsed.frames.len() * parsed.frame_size;
        if samples * 25 > self.config.sample_rate as usize * 3 {
            return Err(DecodeError::InvalidPacket);
        }
        Ok(samples)
    }

    /// Computes `frame_size` samples of concealment without touching the
    /// decoder.
    ///
    /// # Errors
    ///
    /// [`DecodeError::BadArgument`] when `frame_size` is zero or not a
    /// multiple of 2.5 ms.
    pub fn preview_conceal(&self, frame_size: usize) -> Result<Concealment<S, T>, DecodeError> {
        self.check_conceal_size(frame_size)?;
        let mut layers = self.layers.clone();
        let mut pcm = vec![0.0; frame_size * self.config.channels];
        let samples = layers.conceal(&self.config, &self.window, &mut pcm, frame_size)?;
        layers.session.last_packet_duration = samples;
        Ok(Concealment { pcm, samples, layers })
    }

    /// Advances the decoder to the state a concealment left behind.
    ///
    /// Anything decoded since the concealment was previewed is discarded.
    pub fn commit(&mut self, concealment: Concealment<S, T>) {
        self.layers = concealment.layers;
    }

    /// Restores the freshly constructed session and resets both layers.
    ///
    /// The configuration, including the gain, is kept.
    pub fn reset_state(&mut self) {
        self.layers.speech.reset();
        self.layers.transform.reset();
        self.layers.session = Session::new(&self.config);
        self.layers.control = DecControl {
            n_channels_api: self.config.channels,
            n_channels_internal: self.config.channels,
            api_sample_rate: self.config.sample_rate,
            complexity: self.config.complexity,
            ..DecControl::default()
        };
        self.softclip_mem = [0.0; MAX_CHANNELS];
    }

    /// Sets the output gain in Q8 dB.
    ///
    /// # Errors
    ///
    /// [`DecoderInitError::InvalidGain`] outside `-32768..=32767`.
    pub fn set_gain(&mut self, gain: i32) -> Result<(), DecoderInitError> {
        validate_gain(gain)?;
        self.config.gain = gain;
        Ok(())
    }

    /// Sets the complexity forwarded to the speech layer.
    ///
    /// # Errors
    ///
    /// [`DecoderInitError::InvalidComplexity`] above 10.
    pub fn set_complexity(&mut self, complexity: u32) -> Result<(), DecoderInitError> {
        validate_complexity(complexity)?;
        self.config.complexity = complexity;
        Ok(())
    }

    #[must_use]
    pub fn gain(&self) -> i32 {
        self.config.gain
    }

    #[must_use]
    pub fn complexity(&self) -> u32 {
        self.config.complexity
    }

    #[must_use]
    pub fn sample_rate(&self) -> u32 {
        self.config.sample_rate
    }

    #[must_use]
    pub fn channels(&self) -> usize {
        self.config.channels
    }

    /// Bandwidth of the last packet.
    #[must_use]
    pub fn bandwidth(&self) -> Option<Bandwidth> {
        self.layers.session.bandwidth
    }

    /// Range coder state after the last frame, for conformance checks.
    #[must_use]
    pub fn final_range(&self) -> u32 {
        self.layers.session.range_final
    }

    /// Pitch period of the layer that produced the last frame.
    #[must_use]
    pub fn pitch(&self) -> usize {
        match self.layers.session.prev_mode {
            Some(Mode::Celt) => self.layers.transform.pitch_period(),
            _ => self.layers.speech.pitch_lag(),
        }
    }

    /// Samples per channel returned by the last call.
    #[must_use]
    pub fn last_packet_duration(&self) -> usize {
        self.layers.session.last_packet_duration
    }

    /// Consecutive concealed frames since the last decoded one.
    #[must_use]
    pub fn loss_run_length(&self) -> usize {
        self.layers.session.loss_run_length
    }

    /// Mode of the last packet.
    #[must_use]
    pub fn mode(&self) -> Option<Mode> {
        self.layers.session.mode
    }

    /// Mode of the last decoded or concealed frame.
    #[must_use]
    pub fn prev_mode(&self) -> Option<Mode> {
        self.layers.session.prev_mode
    }

    #[must_use]
    pub fn speech_decoder(&self) -> &S {
        &self.layers.speech
    }

    #[must_use]
    pub fn transform_decoder(&self) -> &T {
        &self.layers.transform
    }

    fn check_conceal_size(&self, frame_size: usize) -> Result<(), DecodeError> {
        let f2_5 = self.config.sample_rate as usize / 400;
        if frame_size == 0 || frame_size % f2_5 != 0 {
            return Err(DecodeError::BadArgument);
        }
        Ok(())
    }

    fn conceal_into(&mut self, pcm: &mut [f32], frame_size: usize) -> Result<usize, DecodeError> {
        let concealment = self.preview_conceal(frame_size)?;
        let samples = concealment.samples;
        pcm[..samples * self.config.channels].copy_from_slice(&concealment.pcm);
        self.commit(concealment);
        Ok(samples)
    }

    /// Decodes one frame, concealing it instead when it is corrupt or too
    /// short to carry audio.
    fn decode_or_conceal(
        &mut self,
        frame: &[u8],
        pcm: &mut [f32],
        frame_size: usize,
        decode_fec: bool,
    ) -> Result<usize, DecodeError> {
        let snapshot = self.layers.clone();
        let expected = self.layers.session.frame_size.min(frame_size);
        let result = if frame.len() <= 1 {
            debug!("{}-byte frame, concealing {expected} samples", frame.len());
            self.layers.conceal(&self.config, &self.window, pcm, expected)
        } else {
            match self
                .layers
                .decode_frame(&self.config, &self.window, Some(frame), pcm, frame_size, decode_fec)
            {
                Ok(samples) => Ok(samples),
                Err(FrameFailure::Corrupt) => {
                    self.layers = snapshot.clone();
                    debug!("corrupt {}-byte frame, concealing {expected} samples", frame.len());
                    self.layers.conceal(&self.config, &self.window, pcm, expected)
                }
                Err(FrameFailure::Fatal(err)) => Err(err),
            }
        };
        if result.is_err() {
            self.layers = snapshot;
        }
        result
    }

    fn decode_native(
        &mut self,
        data: Option<&[u8]>,
        pcm: &mut [f32],
        frame_size: usize,
        decode_fec: bool,
        soft_clip: bool,
    ) -> Result<usize, DecodeError> {
        let channels = self.config.channels;
        let data = data.filter(|d| !d.is_empty());
        if frame_size == 0 {
            return Err(DecodeError::BadArgument);
        }
        if decode_fec || data.is_none() {
            self.check_conceal_size(frame_size)?;
        }
        if pcm.len() < frame_size * channels {
            return Err(DecodeError::BufferTooSmall);
        }

        let Some(data) = data else {
            debug!("packet missing, concealing {frame_size} samples");
            return self.conceal_into(pcm, frame_size);
        };

        let packet = self.parser.parse(data, self.config.sample_rate)?;
        let packet_frame_size = packet.frame_size;

        if decode_fec {
            if frame_size < packet_frame_size
                || packet.mode == Mode::Celt
                || self.layers.session.mode == Some(Mode::Celt)
            {
                debug!("no speech-layer redundancy to recover, concealing");
                return self.conceal_into(pcm, frame_size);
            }
            let gap = frame_size - packet_frame_size;
            if gap > 0 {
                let duration = self.layers.session.last_packet_duration;
                if let Err(err) = self.conceal_into(pcm, gap) {
                    self.layers.session.last_packet_duration = duration;
                    return Err(err);
                }
            }
            self.layers.session.enter_packet(&packet);
            let first = packet.frames.first().copied().ok_or(DecodeError::InvalidPacket)?;
            self.decode_or_conceal(first, &mut pcm[channels * gap..], packet_frame_size, true)?;
            self.layers.session.last_packet_duration = frame_size;
            return Ok(frame_size);
        }

        if packet.frames.len() * packet_frame_size > frame_size {
            return Err(DecodeError::BufferTooSmall);
        }
        self.layers.session.enter_packet(&packet);

        let mut nb_samples = 0;
        for frame in &packet.frames {
            let out = &mut pcm[nb_samples * channels..];
            let ret = self.decode_or_conceal(frame, out, frame_size - nb_samples, false)?;
            if ret != packet_frame_size {
                return Err(DecodeError::InternalError);
            }
            nb_samples += ret;
        }
        self.layers.session.last_packet_duration = nb_samples;

        if soft_clip {
            opus_pcm_soft_clip(pcm, nb_samples, channels, &mut self.softclip_mem);
        } else {
            self.softclip_mem = [0.0; MAX_CHANNELS];
        }
        Ok(nb_samples)
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec;
    use alloc::vec::Vec;

    use pretty_assertions::assert_eq;

    use super::{DecoderConfig, OpusDecoder, smooth_fade};
    use crate::celt::{EcDec, EcEnc, STANDARD_MODE, TransformFrame, TransformModelDecoder};
    use crate::error::{CollaboratorError, DecodeError, DecoderInitError};
    use crate::packet::{Bandwidth, Mode};
    use crate::silk::{DecControl, DecodeFlag, SpeechModelDecoder};

    /// Speech layer producing a constant level; reads one 8 bit raw field per
    /// frame and reports a corrupt frame when it reads `0xee`.
    #[derive(Clone, Debug, Default, PartialEq)]
    struct ToneSpeech {
        level: i16,
        calls: Vec<DecodeFlag>,
        resets: usize,
    }

    impl SpeechModelDecoder for ToneSpeech {
        fn decode(
            &mut self,
            dec: Option<&mut EcDec<'_>>,
            control: &DecControl,
            flag: DecodeFlag,
            _first_frame: bool,
            pcm: &mut [i16],
        ) -> Result<usize, CollaboratorError> {
            self.calls.push(flag);
            if let Some(dec) = dec {
                if dec.dec_bits(8) == 0xee {
                    return Err(CollaboratorError::Corrupt);
                }
            }
            let n = control.api_sample_rate as usize / 1000 * control.payload_size_ms.min(20);
            let level = if flag == DecodeFlag::PacketLoss { self.level / 2 } else { self.level };
            pcm[..n * control.n_channels_api].fill(level);
            Ok(n)
        }

        fn reset(&mut self) {
            self.resets += 1;
        }

        fn pitch_lag(&self) -> usize {
            240
        }
    }

    /// Transform layer writing a constant per call kind; corrupt when every
    /// payload byte is `0xee`.
    #[derive(Clone, Debug, Default, PartialEq)]
    struct FlatTransform {
        frames: Vec<(bool, TransformFrame)>,
        resets: usize,
    }

    impl TransformModelDecoder for FlatTransform {
        fn decode(
            &mut self,
            dec: Option<&mut EcDec<'_>>,
            data: Option<&[u8]>,
            frame: &TransformFrame,
            pcm: &mut [f32],
        ) -> Result<usize, CollaboratorError> {
            let data = data.filter(|d| d.len() > 1);
            self.frames.push((data.is_some(), *frame));
            if let Some(dec) = dec {
                dec.dec_bits(4);
            }
            if data.is_some_and(|d| d.iter().all(|&b| b == 0xee)) {
                return Err(CollaboratorError::Corrupt);
            }
            let value = if data.is_some() { 0.25 } else { 0.125 };
            pcm[..frame.frame_size].fill(value);
            Ok(frame.frame_size)
        }

        fn reset(&mut self) {
            self.resets += 1;
        }

        fn final_range(&self) -> u32 {
            0
        }

        fn pitch_period(&self) -> usize {
            480
        }
    }

    type TestDecoder = OpusDecoder<ToneSpeech, FlatTransform>;

    fn decoder() -> TestDecoder {
        OpusDecoder::new(
            DecoderConfig::default(),
            ToneSpeech { level: 8192, ..ToneSpeech::default() },
            FlatTransform::default(),
        )
        .unwrap()
    }

    fn celt_packet() -> Vec<u8> {
        // Config 31: transform only, fullband, 20 ms.
        let mut packet = vec![31 << 3];
        packet.extend([0x55; 20]);
        packet
    }

    fn silk_packet() -> Vec<u8> {
        // Config 9: speech only, wideband, 20 ms, a payload too short for
        // a redundancy flag.
        vec![9 << 3, 0x12, 0x34]
    }

    #[test]
    fn rejects_invalid_configuration() {
        let config = DecoderConfig { sample_rate: 44_100, ..DecoderConfig::default() };
        assert_eq!(
            OpusDecoder::new(config, ToneSpeech::default(), FlatTransform::default()).unwrap_err(),
            DecoderInitError::InvalidSampleRate(44_100)
        );
        let config = DecoderConfig { channels: 3, ..DecoderConfig::default() };
        assert!(OpusDecoder::new(config, ToneSpeech::default(), FlatTransform::default()).is_err());
        let config = DecoderConfig { complexity: 11, ..DecoderConfig::default() };
        assert!(OpusDecoder::new(config, ToneSpeech::default(), FlatTransform::default()).is_err());
    }

    #[test]
    fn gain_round_trips_and_validates_range() {
        let mut decoder = decoder();
        decoder.set_gain(-15).unwrap();
        assert_eq!(decoder.gain(), -15);
        assert_eq!(decoder.set_gain(40_000), Err(DecoderInitError::InvalidGain(40_000)));
        assert_eq!(decoder.gain(), -15);
    }

    #[test]
    fn concealment_before_any_packet_is_silence() {
        let mut decoder = decoder();
        let mut pcm = vec![1.0f32; 960];
        assert_eq!(decoder.decode_float(None, &mut pcm, 960, false), Ok(960));
        assert!(pcm.iter().all(|&v| v == 0.0));
        assert_eq!(decoder.loss_run_length(), 0);
        assert_eq!(decoder.last_packet_duration(), 960);
    }

    #[test]
    fn bad_frame_size_leaves_state_unchanged() {
        let mut decoder = decoder();
        let mut pcm = vec![0.0f32; 960];
        decoder.decode_float(Some(&celt_packet()), &mut pcm, 960, false).unwrap();
        let before = decoder.clone();
        assert_eq!(decoder.decode_float(None, &mut pcm, 100, false), Err(DecodeError::BadArgument));
        assert_eq!(decoder.layers.session, before.layers.session);
        assert_eq!(decoder.layers.transform, before.layers.transform);
    }

    #[test]
    fn transform_packet_decodes_and_routes_loss_to_transform_layer() {
        let mut decoder = decoder();
        let mut pcm = vec![0.0f32; 960];
        assert_eq!(decoder.decode_float(Some(&celt_packet()), &mut pcm, 960, false), Ok(960));
        assert!(pcm.iter().all(|&v| v == 0.25));
        assert_eq!(decoder.mode(), Some(Mode::Celt));
        assert_eq!(decoder.bandwidth(), Some(Bandwidth::Full));
        assert_eq!(decoder.pitch(), 480);

        assert_eq!(decoder.decode_float(None, &mut pcm, 960, false), Ok(960));
        assert!(pcm.iter().all(|&v| v == 0.125));
        assert_eq!(decoder.loss_run_length(), 1);
        assert_eq!(decoder.final_range(), 0);
        let (had_data, frame) = decoder.transform_decoder().frames.last().copied().unwrap();
        assert!(!had_data);
        assert_eq!(frame.start_band, 0);
        assert_eq!(frame.end_band, 21);
    }

    #[test]
    fn preview_does_not_mutate_until_committed() {
        let mut decoder = decoder();
        let mut pcm = vec![0.0f32; 960];
        decoder.decode_float(Some(&celt_packet()), &mut pcm, 960, false).unwrap();

        let first = decoder.preview_conceal(960).unwrap();
        let second = decoder.preview_conceal(960).unwrap();
        assert_eq!(first.pcm(), second.pcm());
        assert_eq!(decoder.loss_run_length(), 0);

        decoder.commit(first);
        assert_eq!(decoder.loss_run_length(), 1);
        assert_eq!(decoder.last_packet_duration(), 960);
    }

    #[test]
    fn speech_packet_uses_internal_rate_and_adds_speech_output() {
        let mut decoder = decoder();
        let mut pcm = vec![0.0f32; 960];
        assert_eq!(decoder.decode_float(Some(&silk_packet()), &mut pcm, 960, false), Ok(960));
        assert!(pcm.iter().all(|&v| v == 0.25));
        assert_eq!(decoder.layers.control.internal_sample_rate, 16_000);
        assert_eq!(decoder.layers.control.payload_size_ms, 20);
        assert_eq!(decoder.prev_mode(), Some(Mode::Silk));
        assert_eq!(decoder.pitch(), 240);
    }

    #[test]
    fn switching_from_transform_to_speech_resets_and_crossfades() {
        let mut decoder = decoder();
        let mut pcm = vec![0.0f32; 960];
        decoder.decode_float(Some(&celt_packet()), &mut pcm, 960, false).unwrap();
        decoder.decode_float(Some(&silk_packet()), &mut pcm, 960, false).unwrap();
        assert_eq!(decoder.speech_decoder().resets, 1);

        // The first 2.5 ms come from a transform-layer concealment preview,
        // the next 2.5 ms fade into the speech output.
        assert!(pcm[..120].iter().all(|&v| v == 0.125));
        assert!((pcm[120] - 0.125).abs() < 1e-3);
        assert!((pcm[239] - 0.25).abs() < 1e-3);
        assert!(pcm[120..240].windows(2).all(|p| p[0] <= p[1]));
        assert!(pcm[240..].iter().all(|&v| v == 0.25));
        // The preview ran on a copy.
        assert_eq!(decoder.loss_run_length(), 0);
    }

    #[test]
    fn corrupt_frame_is_concealed_and_state_rolled_back() {
        let mut decoder = decoder();
        let mut pcm = vec![0.0f32; 960];
        decoder.decode_float(Some(&celt_packet()), &mut pcm, 960, false).unwrap();

        let mut corrupt = celt_packet();
        corrupt[1..].fill(0xee);
        assert_eq!(decoder.decode_float(Some(&corrupt), &mut pcm, 960, false), Ok(960));
        assert!(pcm.iter().all(|&v| v == 0.125));
        assert_eq!(decoder.loss_run_length(), 1);
        // The rejected attempt is not part of the transform layer's history.
        let decoded: Vec<bool> = decoder.transform_decoder().frames.iter().map(|f| f.0).collect();
        assert_eq!(decoded, vec![true, false]);
    }

    #[test]
    fn packet_longer_than_frame_size_is_rejected() {
        let mut decoder = decoder();
        let mut pcm = vec![0.0f32; 960];
        assert_eq!(
            decoder.decode_float(Some(&celt_packet()), &mut pcm, 480, false),
            Err(DecodeError::BufferTooSmall)
        );
        assert_eq!(
            decoder.decode_float(Some(&[31 << 3 | 3]), &mut pcm, 960, false),
            Err(DecodeError::InvalidPacket)
        );
    }

    #[test]
    fn fec_decodes_speech_redundancy_after_concealing_the_gap() {
        let mut decoder = decoder();
        let mut pcm = vec![0.0f32; 1920];
        decoder.decode_float(Some(&silk_packet()), &mut pcm, 960, false).unwrap();
        decoder.layers.speech.calls.clear();

        assert_eq!(decoder.decode_float(Some(&silk_packet()), &mut pcm, 1920, true), Ok(1920));
        assert_eq!(
            decoder.speech_decoder().calls,
            vec![DecodeFlag::PacketLoss, DecodeFlag::Lbrr]
        );
        assert!(pcm[960..].iter().all(|&v| v == 0.25));
        assert_eq!(decoder.last_packet_duration(), 1920);
    }

    #[test]
    fn sixteen_bit_output_is_soft_clipped_and_scaled() {
        let config = DecoderConfig { gain: 1541, ..DecoderConfig::default() };
        let mut decoder = OpusDecoder::new(
            config,
            ToneSpeech { level: 8192, ..ToneSpeech::default() },
            FlatTransform::default(),
        )
        .unwrap();
        let mut pcm = vec![0i16; 960];
        assert_eq!(decoder.decode(Some(&celt_packet()), &mut pcm, 960, false), Ok(960));
        // 0.25 doubled by the gain.
        assert!(pcm.iter().all(|&v| (i32::from(v) - 16_384).abs() <= 8));
    }

    #[test]
    fn reset_state_keeps_configuration() {
        let mut decoder = decoder();
        decoder.set_gain(123).unwrap();
        let mut pcm = vec![0.0f32; 960];
        decoder.decode_float(Some(&celt_packet()), &mut pcm, 960, false).unwrap();
        decoder.reset_state();
        assert_eq!(decoder.gain(), 123);
        assert_eq!(decoder.prev_mode(), None);
        assert_eq!(decoder.mode(), None);
        assert_eq!(decoder.last_packet_duration(), 0);
        assert_eq!(decoder.final_range(), 0);
        assert_eq!(decoder.transform_decoder().resets, 1);
    }

    #[test]
    fn hybrid_redundancy_is_carved_from_the_tail() {
        // Hybrid fullband 20 ms: redundancy flag, celt_to_silk = 0 and a
        // 2 + 8 byte redundant frame at the end.
        let mut body = vec![0u8; 40];
        {
            let mut enc = EcEnc::new(&mut body);
            enc.enc_bits(0x12, 8);
            enc.enc_bit_logp(true, 12);
            enc.enc_bit_logp(false, 1);
            enc.enc_uint(8, 256);
            enc.enc_done();
        }
        let mut packet = vec![15 << 3];
        packet.extend(&body);

        let mut decoder = decoder();
        let mut pcm = vec![0.0f32; 960];
        assert_eq!(decoder.decode_float(Some(&packet), &mut pcm, 960, false), Ok(960));
        let frames = &decoder.transform_decoder().frames;
        // Main frame at band 17, then the 5 ms redundant frame from band 0.
        assert_eq!(frames[0].1.start_band, 17);
        assert_eq!(frames[1].1.frame_size, 240);
        assert_eq!(frames[1].1.start_band, 0);
        assert!(decoder.layers.session.prev_redundancy);
    }

    #[test]
    fn fade_weights_follow_the_window() {
        let window = STANDARD_MODE.window();
        let mut pcm = vec![1.0f32; 120];
        let other = vec![0.0f32; 120];
        smooth_fade(&mut pcm, &other, true, 120, 1, &window, 48_000);
        assert!(pcm[0] < 0.01);
        assert!(pcm[119] > 0.99);
        assert!(pcm.windows(2).all(|p| p[0] <= p[1]));
    }
}

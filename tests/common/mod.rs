#![allow(dead_code)]

use opus_core::celt::EBAND_5MS;
use opus_core::{
    BandDecoder, BandFrame, CeltDecoder, CollaboratorError, DecControl, DecodeFlag, DecoderConfig,
    EcDec, EcEnc, OpusDecoder, SpeechModelDecoder,
};

/// TOC byte of a 20 ms fullband transform-only packet.
pub const CELT_FB_20MS: u8 = 31 << 3;

/// TOC byte of a 20 ms wideband speech-only packet.
pub const SILK_WB_20MS: u8 = 9 << 3;

/// TOC byte of a 40 ms wideband speech-only packet.
pub const SILK_WB_40MS: u8 = 10 << 3;

/// Band decoder that places one unit pulse per band, at an offset read from
/// the stream, with every band at `level` (log2 amplitude).
#[derive(Clone, Debug, PartialEq)]
pub struct PulseBands {
    pub level: f32,
}

impl BandDecoder for PulseBands {
    fn decode_bands(
        &mut self,
        dec: &mut EcDec<'_>,
        frame: &BandFrame,
        x: &mut [f32],
        band_log_e: &mut [f32],
    ) -> Result<(), CollaboratorError> {
        if frame.silence {
            return Ok(());
        }
        let offset = dec.dec_bits(4) as usize;
        let n = x.len() / frame.channels;
        let m = 1 << frame.lm;
        for ch in 0..frame.channels {
            let shape = &mut x[ch * n..(ch + 1) * n];
            shape.fill(0.0);
            for band in frame.start..frame.end {
                let lo = m * EBAND_5MS[band] as usize;
                let hi = m * EBAND_5MS[band + 1] as usize;
                shape[lo + offset % (hi - lo)] = 1.0;
                band_log_e[ch * 21 + band] = self.level;
            }
        }
        Ok(())
    }
}

/// Speech decoder producing a square wave of period `period` at the API
/// rate. Lost frames continue the wave at half amplitude.
#[derive(Clone, Debug, PartialEq)]
pub struct SquareSpeech {
    pub amplitude: i16,
    pub period: usize,
    pub phase: usize,
}

impl Default for SquareSpeech {
    fn default() -> Self {
        Self {
            amplitude: 4096,
            period: 96,
            phase: 0,
        }
    }
}

impl SpeechModelDecoder for SquareSpeech {
    fn decode(
        &mut self,
        dec: Option<&mut EcDec<'_>>,
        control: &DecControl,
        flag: DecodeFlag,
        _first_frame: bool,
        pcm: &mut [i16],
    ) -> Result<usize, CollaboratorError> {
        if let Some(dec) = dec {
            let _ = dec.dec_bits(8);
        }
        let n = control.api_sample_rate as usize / 1000 * control.payload_size_ms.min(20);
        let channels = control.n_channels_api;
        if pcm.len() < n * channels {
            return Err(CollaboratorError::BufferTooSmall);
        }
        let amplitude = match flag {
            DecodeFlag::PacketLoss => self.amplitude / 2,
            _ => self.amplitude,
        };
        for frame in pcm[..n * channels].chunks_mut(channels) {
            let value = if self.phase < self.period / 2 { amplitude } else { -amplitude };
            frame.fill(value);
            self.phase = (self.phase + 1) % self.period;
        }
        Ok(n)
    }

    fn reset(&mut self) {
        self.phase = 0;
    }

    fn pitch_lag(&self) -> usize {
        self.period
    }
}

pub type TestDecoder = OpusDecoder<SquareSpeech, CeltDecoder<PulseBands>>;

pub fn decoder(sample_rate: u32, channels: usize, level: f32) -> TestDecoder {
    let config = DecoderConfig {
        sample_rate,
        channels,
        ..DecoderConfig::default()
    };
    let transform = CeltDecoder::new(sample_rate, channels, PulseBands { level })
        .expect("supported configuration");
    OpusDecoder::new(config, SquareSpeech::default(), transform).expect("valid configuration")
}

/// A transform-only packet whose frame header carries no post-filter and
/// whose band decoder reads `offset`.
pub fn transform_packet(offset: u32, silence: bool) -> Vec<u8> {
    let mut body = vec![0u8; 60];
    {
        let mut enc = EcEnc::new(&mut body);
        enc.enc_bit_logp(silence, 15);
        if !silence {
            enc.enc_bit_logp(false, 1);
            enc.enc_bit_logp(false, 3);
            enc.enc_bit_logp(false, 3);
            enc.enc_bits(offset & 0xf, 4);
        }
        enc.enc_done();
    }
    let mut packet = vec![CELT_FB_20MS];
    packet.extend(body);
    packet
}

/// A speech-only packet too short to carry a redundant frame.
pub fn speech_packet() -> Vec<u8> {
    vec![SILK_WB_20MS, 0x5a, 0xa5]
}

/// A 5 ms transform frame whose band decoder reads `offset`, as carried in a
/// redundancy sub-frame.
pub fn redundant_frame(offset: u32) -> Vec<u8> {
    let mut body = vec![0u8; 20];
    {
        let mut enc = EcEnc::new(&mut body);
        enc.enc_bit_logp(false, 15);
        enc.enc_bit_logp(false, 1);
        // The shortest frame size has no transient flag.
        enc.enc_bit_logp(false, 3);
        enc.enc_bits(offset & 0xf, 4);
        enc.enc_done();
    }
    body
}

/// A speech-only packet whose trailing bytes hold a redundant transform
/// frame. With `celt_to_silk` the redundant audio leads into the speech
/// frame, otherwise it trails it.
///
/// The speech layer's raw byte and the direction flag leave the range coder
/// ten bits in, so the redundant frame starts at the third payload byte.
pub fn speech_packet_with_redundancy(celt_to_silk: bool, offset: u32) -> Vec<u8> {
    let mut head = [0u8; 2];
    {
        let mut enc = EcEnc::new(&mut head);
        enc.enc_bit_logp(celt_to_silk, 1);
        enc.enc_done();
        assert!(!enc.error());
    }
    let mut packet = vec![SILK_WB_20MS];
    packet.extend(head);
    packet.extend(redundant_frame(offset));
    packet
}

/// What [`SquareSpeech`] writes for `samples` samples starting at phase 0.
pub fn square_wave(samples: usize) -> Vec<f32> {
    let speech = SquareSpeech::default();
    let level = f32::from(speech.amplitude) / 32_768.0;
    (0..samples)
        .map(|i| if i % speech.period < speech.period / 2 { level } else { -level })
        .collect()
}

/// Asserts that `mixed` moves from `from` towards `to` with a weight that
/// never falls back and passes through the middle.
pub fn assert_crossfade(mixed: &[f32], from: &[f32], to: &[f32]) {
    let mut weights = Vec::new();
    for (i, ((&m, &a), &b)) in mixed.iter().zip(from).zip(to).enumerate() {
        let (lo, hi) = if a < b { (a, b) } else { (b, a) };
        assert!(lo - 1e-6 <= m && m <= hi + 1e-6, "sample {i}: {m} outside {a}..{b}");
        if (b - a).abs() > 1e-3 {
            weights.push((m - a) / (b - a));
        }
    }
    for pair in weights.windows(2) {
        assert!(pair[1] >= pair[0] - 1e-3, "weight fell back: {weights:?}");
    }
    assert!(weights.iter().any(|w| (0.2..0.8).contains(w)), "hard cut: {weights:?}");
}

pub fn energy(pcm: &[f32]) -> f32 {
    pcm.iter().map(|v| v * v).sum()
}

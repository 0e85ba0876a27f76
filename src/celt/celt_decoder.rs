//! Transform-layer decoder and its packet-loss concealment.
//!
//! [`CeltDecoder`] owns everything the transform layer carries from one frame
//! to the next: the per-channel synthesis history (2048 samples plus the MDCT
//! overlap), the post-filter parameters, the band energy trackers and the LPC
//! model used while concealing. The band energy and shape pipeline itself is
//! supplied through [`BandDecoder`]; this module decodes the frame header,
//! synthesises audio from the decoded bands and fabricates audio when no
//! payload is available.
//!
//! Concealment has two branches. For the first few losses of a run the last
//! pitch period of the history is extrapolated through an LPC model
//! ("pitch branch"). Once five frames are lost in a row, or when only the high
//! bands are coded, the bands are refilled with noise at slowly decaying
//! energies ("noise branch"). Both branches are deterministic functions of
//! the decoder state.

use alloc::vec;
use alloc::vec::Vec;

use log::trace;

use crate::celt::bands::{denormalise_bands, fill_band_noise};
use crate::celt::celt::{COMBFILTER_MAXPERIOD, CombParams, comb_filter, comb_filter_inplace};
use crate::celt::entdec::EcDec;
use crate::celt::lpc::{celt_autocorr, celt_fir, celt_iir, celt_lpc};
use crate::celt::math::{celt_sqrt, frac_div32};
use crate::celt::mdct::inverse_transform;
use crate::celt::modes::{CeltMode, NB_EBANDS, PREEMPH, STANDARD_MODE, resampling_factor};
use crate::celt::pitch::{pitch_downsample, pitch_search};
use crate::error::{CollaboratorError, DecoderInitError};

/// Order of the LPC model fitted to the history when concealing.
const LPC_ORDER: usize = 24;

/// Samples of synthesis history kept per channel in front of the overlap.
const DECODE_BUFFER_SIZE: usize = 2048;

/// Longest excitation period the pitch branch repeats.
const MAX_PERIOD: usize = 1024;

/// Upper bound on the concealment pitch lag.
const PLC_PITCH_LAG_MAX: usize = 720;

/// Lower bound on the concealment pitch lag.
const PLC_PITCH_LAG_MIN: usize = 100;

/// Largest frame payload the format allows.
const MAX_FRAME_BYTES: usize = 1275;

/// Longest frame at 48 kHz.
const MAX_FRAME_SIZE: usize = 960;

/// Post-filter tapset distribution.
const TAPSET_ICDF: [u8; 3] = [2, 1, 0];

const POSTFILTER_GAIN_SCALE: f32 = 0.093_75;

/// Log energy assigned to bands that are not coded.
const ENERGY_FLOOR: f32 = -28.0;

const VERY_SMALL: f32 = 1.0e-30;

/// Internal signal scale relative to `[-1, 1]` PCM.
const SIG_SCALE: f32 = 32_768.0;

/// Saturation limit applied to the inverse transform output.
const SIG_SAT: f32 = 536_870_911.0;

// The post-filter reads up to two samples past its period behind the start of
// the longest frame.
const _: () = assert!(DECODE_BUFFER_SIZE - MAX_FRAME_SIZE >= COMBFILTER_MAXPERIOD + 2);

/// How a frame handed to a [`TransformModelDecoder`] should be decoded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransformFrame {
    /// Samples per channel at the output rate.
    pub frame_size: usize,
    /// First coded band; 17 in hybrid frames, 0 otherwise.
    pub start_band: usize,
    /// One past the last coded band, derived from the audio bandwidth.
    pub end_band: usize,
    /// Channels coded in the packet, which may differ from the output.
    pub stream_channels: usize,
    /// Add to `pcm` instead of overwriting it.
    pub accumulate: bool,
}

/// Decoder of the transform-coded layer.
pub trait TransformModelDecoder {
    /// Decodes one frame into interleaved `pcm`.
    ///
    /// With `dec` set the frame continues a range coder shared with the speech
    /// layer; otherwise a coder is started over `data`. Without `data` (or
    /// with a payload of at most one byte) the frame is concealed. Returns the
    /// number of samples per channel written.
    ///
    /// # Errors
    ///
    /// [`CollaboratorError::Corrupt`] when the payload does not decode
    /// consistently, [`CollaboratorError::BufferTooSmall`] when `pcm` cannot
    /// hold the frame.
    fn decode(
        &mut self,
        dec: Option<&mut EcDec<'_>>,
        data: Option<&[u8]>,
        frame: &TransformFrame,
        pcm: &mut [f32],
    ) -> Result<usize, CollaboratorError>;

    /// Returns the decoder to its freshly constructed state.
    fn reset(&mut self);

    /// Range coder state after the last decoded frame.
    fn final_range(&self) -> u32;

    /// Pitch period of the active post-filter, in 48 kHz samples.
    fn pitch_period(&self) -> usize;
}

/// Per-frame parameters handed to a [`BandDecoder`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BandFrame {
    pub start: usize,
    pub end: usize,
    pub lm: usize,
    pub channels: usize,
    pub is_transient: bool,
    pub intra: bool,
    pub silence: bool,
    /// Size of the payload in bits.
    pub total_bits: i32,
}

/// Energy quantisation, bit allocation and band shape decoding.
pub trait BandDecoder {
    /// Decodes the bands `frame.start..frame.end` of every coded channel.
    ///
    /// `band_log_e` holds the previous frame's log2 band energies (channel
    /// stride [`NB_EBANDS`]) on entry and must hold this frame's on return.
    /// `x` receives unit-norm band shapes, one block of `frame_size` bins
    /// per channel.
    ///
    /// # Errors
    ///
    /// [`CollaboratorError::Corrupt`] when the bands do not decode
    /// consistently.
    fn decode_bands(
        &mut self,
        dec: &mut EcDec<'_>,
        frame: &BandFrame,
        x: &mut [f32],
        band_log_e: &mut [f32],
    ) -> Result<(), CollaboratorError>;

    /// Clears any state carried between frames.
    fn reset(&mut self) {}
}

/// Transform-layer decoder state.
#[derive(Clone, Debug, PartialEq)]
pub struct CeltDecoder<B> {
    mode: CeltMode,
    window: Vec<f32>,
    bands: B,
    channels: usize,
    stream_channels: usize,
    downsample: usize,
    start: usize,
    end: usize,

    rng: u32,
    final_range: u32,
    loss_count: usize,
    last_pitch_index: usize,
    /// Output energy of the previous concealed frame in the current run.
    plc_energy: Option<f32>,

    postfilter: CombParams,
    postfilter_old: CombParams,
    preemph_mem: [f32; 2],

    decode_mem: Vec<f32>,
    lpc: Vec<f32>,
    old_band_e: [f32; 2 * NB_EBANDS],
    old_log_e: [f32; 2 * NB_EBANDS],
    old_log_e2: [f32; 2 * NB_EBANDS],
    background_log_e: [f32; 2 * NB_EBANDS],
}

impl<B: BandDecoder> CeltDecoder<B> {
    /// Creates a decoder producing `channels` channels at `sample_rate`.
    ///
    /// # Errors
    ///
    /// Fails for rates other than 8, 12, 16, 24 and 48 kHz and for channel
    /// counts other than one and two.
    pub fn new(sample_rate: u32, channels: usize, bands: B) -> Result<Self, DecoderInitError> {
        let downsample =
            resampling_factor(sample_rate).ok_or(DecoderInitError::InvalidSampleRate(sample_rate))?;
        if !(1..=2).contains(&channels) {
            return Err(DecoderInitError::InvalidChannels(channels));
        }
        let mode = STANDARD_MODE;
        let mut decoder = Self {
            window: mode.window(),
            decode_mem: vec![0.0; channels * (DECODE_BUFFER_SIZE + mode.overlap)],
            lpc: vec![0.0; channels * LPC_ORDER],
            mode,
            bands,
            channels,
            stream_channels: channels,
            downsample,
            start: 0,
            end: mode.eff_ebands,
            rng: 0,
            final_range: 0,
            loss_count: 0,
            last_pitch_index: 0,
            plc_energy: None,
            postfilter: CombParams::default(),
            postfilter_old: CombParams::default(),
            preemph_mem: [0.0; 2],
            old_band_e: [0.0; 2 * NB_EBANDS],
            old_log_e: [ENERGY_FLOOR; 2 * NB_EBANDS],
            old_log_e2: [ENERGY_FLOOR; 2 * NB_EBANDS],
            background_log_e: [0.0; 2 * NB_EBANDS],
        };
        decoder.reset_state();
        Ok(decoder)
    }

    /// Number of frames concealed since the last decoded one.
    #[must_use]
    pub fn loss_count(&self) -> usize {
        self.loss_count
    }

    /// Output channel count.
    #[must_use]
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Smoothed log2 band energies of the last frame, channel after channel.
    #[must_use]
    pub fn band_energies(&self) -> &[f32] {
        &self.old_band_e
    }

    /// Background energy floor noise concealment decays towards.
    #[must_use]
    pub fn background_energies(&self) -> &[f32] {
        &self.background_log_e
    }

    /// The injected band decoder.
    #[must_use]
    pub fn band_decoder(&self) -> &B {
        &self.bands
    }

    fn reset_state(&mut self) {
        self.stream_channels = self.channels;
        self.start = 0;
        self.end = self.mode.eff_ebands;
        self.rng = 0;
        self.final_range = 0;
        self.loss_count = 0;
        self.last_pitch_index = 0;
        self.plc_energy = None;
        self.postfilter = CombParams::default();
        self.postfilter_old = CombParams::default();
        self.preemph_mem = [0.0; 2];
        self.decode_mem.fill(0.0);
        self.lpc.fill(0.0);
        self.old_band_e = [0.0; 2 * NB_EBANDS];
        self.old_log_e = [ENERGY_FLOOR; 2 * NB_EBANDS];
        self.old_log_e2 = [ENERGY_FLOOR; 2 * NB_EBANDS];
        self.background_log_e = [0.0; 2 * NB_EBANDS];
        self.bands.reset();
    }

    fn stride(&self) -> usize {
        DECODE_BUFFER_SIZE + self.mode.overlap
    }

    fn decode_frame(
        &mut self,
        dec: &mut EcDec<'_>,
        len: usize,
        n: usize,
        lm: usize,
        pcm: &mut [f32],
        accumulate: bool,
    ) -> Result<(), CollaboratorError> {
        let c = self.stream_channels;
        let m = 1usize << lm;
        let eff_end = self.end.min(self.mode.eff_ebands);

        if c == 1 {
            let (first, second) = self.old_band_e.split_at_mut(NB_EBANDS);
            for (a, &b) in first.iter_mut().zip(second.iter()) {
                *a = a.max(b);
            }
        }

        let total_bits = (len * 8) as i32;
        let mut tell = dec.tell();
        let silence = if tell >= total_bits {
            true
        } else if tell == 1 {
            dec.dec_bit_logp(15)
        } else {
            false
        };
        if silence {
            dec.consume_all(total_bits);
            tell = total_bits;
        }

        let mut postfilter = CombParams::default();
        if self.start == 0 && tell + 16 <= total_bits {
            if dec.dec_bit_logp(1) {
                let octave = dec.dec_uint(6);
                let period = (16u32 << octave) + dec.dec_bits(4 + octave) - 1;
                let qg = dec.dec_bits(3);
                let tapset = if dec.tell() + 2 <= total_bits {
                    dec.dec_icdf(&TAPSET_ICDF, 2)
                } else {
                    0
                };
                postfilter = CombParams {
                    period: period as usize,
                    gain: POSTFILTER_GAIN_SCALE * (qg + 1) as f32,
                    tapset,
                };
            }
            tell = dec.tell();
        }

        let is_transient = if lm > 0 && tell + 3 <= total_bits {
            let transient = dec.dec_bit_logp(3);
            tell = dec.tell();
            transient
        } else {
            false
        };
        let intra = tell + 3 <= total_bits && dec.dec_bit_logp(3);

        let frame = BandFrame {
            start: self.start,
            end: self.end,
            lm,
            channels: c,
            is_transient,
            intra,
            silence,
            total_bits,
        };
        let mut x = vec![0.0f32; c * n];
        self.bands
            .decode_bands(dec, &frame, &mut x, &mut self.old_band_e)?;

        if silence {
            self.old_band_e[..c * NB_EBANDS].fill(ENERGY_FLOOR);
        }

        self.shift_history(n);
        self.synthesise(&x, c, n, lm, eff_end, is_transient, silence);

        let stride = self.stride();
        let short = self.mode.short_mdct_size;
        for ch in 0..self.channels {
            let mem = &mut self.decode_mem[ch * stride..(ch + 1) * stride];
            let out = DECODE_BUFFER_SIZE - n;
            comb_filter_inplace(mem, out, short, self.postfilter_old, self.postfilter, &self.window);
            if lm != 0 {
                comb_filter_inplace(mem, out + short, n - short, self.postfilter, postfilter, &self.window);
            }
        }
        self.postfilter_old = self.postfilter;
        self.postfilter = postfilter;
        if lm != 0 {
            self.postfilter_old = self.postfilter;
        }

        self.update_energy_trackers(c, m, is_transient);
        self.rng = dec.rng();
        self.final_range = dec.rng();
        self.deemphasis(n, pcm, accumulate);
        self.loss_count = 0;
        self.plc_energy = None;

        if dec.tell() > 8 * len as i32 || dec.error() {
            return Err(CollaboratorError::Corrupt);
        }
        Ok(())
    }

    fn update_energy_trackers(&mut self, c: usize, m: usize, is_transient: bool) {
        if c == 1 {
            let (first, second) = self.old_band_e.split_at_mut(NB_EBANDS);
            second.copy_from_slice(first);
        }
        if is_transient {
            for (log_e, &band_e) in self.old_log_e.iter_mut().zip(&self.old_band_e) {
                *log_e = log_e.min(band_e);
            }
        } else {
            self.old_log_e2 = self.old_log_e;
            self.old_log_e = self.old_band_e;
            let max_increase = if self.loss_count < 10 { m as f32 * 0.001 } else { 1.0 };
            for (bg, &band_e) in self.background_log_e.iter_mut().zip(&self.old_band_e) {
                *bg = (*bg + max_increase).min(band_e);
            }
        }
        for ch in 0..2 {
            let base = ch * NB_EBANDS;
            for band in (0..self.start).chain(self.end..NB_EBANDS) {
                self.old_band_e[base + band] = 0.0;
                self.old_log_e[base + band] = ENERGY_FLOOR;
                self.old_log_e2[base + band] = ENERGY_FLOOR;
            }
        }
    }

    /// Drops the oldest `n` samples of every channel's history.
    ///
    /// The overlap tail moves along so the next synthesis can add to it.
    fn shift_history(&mut self, n: usize) {
        let stride = self.stride();
        for mem in self.decode_mem.chunks_exact_mut(stride) {
            mem.copy_within(n.., 0);
        }
    }

    /// Denormalises `x` with the current band energies and runs the inverse
    /// transform into the last `n + overlap` samples of each history.
    #[allow(clippy::too_many_arguments)]
    fn synthesise(
        &mut self,
        x: &[f32],
        coded: usize,
        n: usize,
        lm: usize,
        eff_end: usize,
        is_transient: bool,
        silence: bool,
    ) {
        let m = 1usize << lm;
        let blocks = if is_transient { m } else { 1 };
        let stride = self.stride();
        let mut freq = vec![0.0f32; n];
        let mut other = if coded == 2 && self.channels == 1 {
            vec![0.0f32; n]
        } else {
            Vec::new()
        };

        for ch in 0..self.channels {
            let src = ch.min(coded - 1);
            denormalise_bands(
                &self.mode,
                &x[src * n..(src + 1) * n],
                &mut freq,
                &self.old_band_e[src * NB_EBANDS..(src + 1) * NB_EBANDS],
                self.start,
                eff_end,
                m,
                self.downsample,
                silence,
            );
            if !other.is_empty() {
                // Stereo stream into a mono output: average both spectra.
                denormalise_bands(
                    &self.mode,
                    &x[n..2 * n],
                    &mut other,
                    &self.old_band_e[NB_EBANDS..],
                    self.start,
                    eff_end,
                    m,
                    self.downsample,
                    silence,
                );
                for (a, &b) in freq.iter_mut().zip(&other) {
                    *a = 0.5 * (*a + b);
                }
            }
            let out = &mut self.decode_mem[ch * stride + DECODE_BUFFER_SIZE - n..(ch + 1) * stride];
            inverse_transform(&freq, n, blocks, &self.window, out);
            for sample in &mut out[..n] {
                *sample = sample.clamp(-SIG_SAT, SIG_SAT);
            }
        }
    }

    /// Undoes the pre-emphasis, decimates to the output rate and writes
    /// interleaved PCM scaled to `[-1, 1]`.
    fn deemphasis(&mut self, n: usize, pcm: &mut [f32], accumulate: bool) {
        let coef = PREEMPH[0];
        let stride = self.stride();
        let cc = self.channels;
        let ds = self.downsample;
        for ch in 0..cc {
            let history = &self.decode_mem[ch * stride + DECODE_BUFFER_SIZE - n..ch * stride + DECODE_BUFFER_SIZE];
            let mut mem = self.preemph_mem[ch];
            for (j, &sample) in history.iter().enumerate() {
                let tmp = sample + VERY_SMALL + mem;
                mem = coef * tmp;
                if j % ds == 0 {
                    let out = &mut pcm[ch + (j / ds) * cc];
                    let value = tmp / SIG_SCALE;
                    if accumulate {
                        *out += value;
                    } else {
                        *out = value;
                    }
                }
            }
            self.preemph_mem[ch] = mem;
        }
    }

    /// Fabricates the next `n` samples of every channel without a payload.
    /// Returns whether the noise branch produced them.
    fn decode_lost(&mut self, n: usize, lm: usize) -> bool {
        let noise_based = self.loss_count >= 5 || self.start != 0;
        trace!(
            "concealing {n} samples, loss #{} via {} branch",
            self.loss_count + 1,
            if noise_based { "noise" } else { "pitch" }
        );
        if noise_based {
            self.conceal_with_noise(n, lm);
        } else {
            self.conceal_with_pitch(n);
        }
        self.loss_count += 1;
        noise_based
    }

    /// Scales a noise-concealed frame down to the output energy of the
    /// concealed frame before it, so a run of losses never grows louder.
    fn limit_concealed_energy(&mut self, pcm: &mut [f32], noise_based: bool) {
        // Leaves room for the rounding of the rescaled sum.
        const HEADROOM: f32 = 0.999;
        let mut energy: f32 = pcm.iter().map(|v| v * v).sum();
        if let Some(prev) = self.plc_energy.filter(|&prev| noise_based && energy > prev) {
            let gain = HEADROOM * celt_sqrt(prev / energy);
            trace!("noise frame {energy:e} above previous {prev:e}, scaling by {gain}");
            for v in pcm.iter_mut() {
                *v *= gain;
            }
            energy = pcm.iter().map(|v| v * v).sum();
        }
        self.plc_energy = Some(energy);
    }

    fn conceal_with_noise(&mut self, n: usize, lm: usize) {
        let cc = self.channels;
        let start = self.start;
        let end = self.end;
        let eff_end = start.max(end.min(self.mode.eff_ebands));
        let decay = if self.loss_count == 0 { 1.5 } else { 0.5 };

        for ch in 0..cc {
            for band in start..end {
                let idx = ch * NB_EBANDS + band;
                self.old_band_e[idx] = self.background_log_e[idx].max(self.old_band_e[idx] - decay);
            }
        }

        let mut x = vec![0.0f32; cc * n];
        let mut seed = self.rng;
        for block in x.chunks_exact_mut(n) {
            seed = fill_band_noise(&self.mode, block, start, eff_end, 1 << lm, seed);
        }
        self.rng = seed;

        self.shift_history(n);
        self.synthesise(&x, cc, n, lm, eff_end, false, false);

        // The tail only feeds the next frame's overlap; move it into the
        // unfiltered domain the next post-filter pass expects.
        let inverse = self.postfilter.inverse();
        let stride = self.stride();
        let overlap = self.mode.overlap;
        let mut etmp = vec![0.0f32; overlap];
        for mem in self.decode_mem.chunks_exact_mut(stride) {
            comb_filter(&mut etmp, mem, DECODE_BUFFER_SIZE, overlap, inverse, inverse, &[]);
            mem[DECODE_BUFFER_SIZE..].copy_from_slice(&etmp);
        }
    }

    /// Pitch lag of the history, searched on the first loss of a run.
    fn plc_pitch_search(&self) -> usize {
        let stride = self.stride();
        let channels: Vec<&[f32]> = self
            .decode_mem
            .chunks_exact(stride)
            .map(|mem| &mem[..DECODE_BUFFER_SIZE])
            .collect();
        let mut lp = vec![0.0f32; DECODE_BUFFER_SIZE / 2];
        pitch_downsample(&channels, &mut lp, DECODE_BUFFER_SIZE);
        let offset = pitch_search(
            &lp[PLC_PITCH_LAG_MAX / 2..],
            &lp,
            DECODE_BUFFER_SIZE - PLC_PITCH_LAG_MAX,
            PLC_PITCH_LAG_MAX - PLC_PITCH_LAG_MIN,
        );
        PLC_PITCH_LAG_MAX
            .saturating_sub(offset)
            .clamp(PLC_PITCH_LAG_MIN, PLC_PITCH_LAG_MAX)
    }

    fn conceal_with_pitch(&mut self, n: usize) {
        let (pitch_index, fade) = if self.loss_count == 0 {
            let pitch = self.plc_pitch_search();
            self.last_pitch_index = pitch;
            (pitch, 1.0f32)
        } else {
            (self.last_pitch_index, 0.8f32)
        };
        trace!("pitch concealment with lag {pitch_index}");

        let overlap = self.mode.overlap;
        let stride = self.stride();
        let exc_length = (2 * pitch_index).min(MAX_PERIOD);
        let decay_length = exc_length / 2;
        let extrapolation_offset = MAX_PERIOD - pitch_index;
        let extrapolation_len = n + overlap;
        let first_loss = self.loss_count == 0;
        let inverse = self.postfilter.inverse();
        let mut etmp = vec![0.0f32; overlap];
        let mut fir_tmp = vec![0.0f32; exc_length];

        for ch in 0..self.channels {
            let mem = &mut self.decode_mem[ch * stride..(ch + 1) * stride];
            let lpc = &mut self.lpc[ch * LPC_ORDER..(ch + 1) * LPC_ORDER];

            // LPC_ORDER samples of filter history followed by one period block.
            let mut exc = [0.0f32; MAX_PERIOD + LPC_ORDER];
            exc.copy_from_slice(&mem[DECODE_BUFFER_SIZE - MAX_PERIOD - LPC_ORDER..DECODE_BUFFER_SIZE]);

            if first_loss {
                let mut ac = [0.0f32; LPC_ORDER + 1];
                celt_autocorr(&exc[LPC_ORDER..], &mut ac, Some(&self.window[..]), LPC_ORDER);
                // Noise floor at -40 dB plus lag windowing.
                ac[0] *= 1.0001;
                for (i, v) in ac.iter_mut().enumerate().skip(1) {
                    *v -= *v * (0.008 * 0.008) * (i * i) as f32;
                }
                celt_lpc(lpc, &ac);
            }

            // Whiten the last two periods into the excitation.
            celt_fir(&exc[MAX_PERIOD - exc_length..], lpc, &mut fir_tmp);
            exc[LPC_ORDER + MAX_PERIOD - exc_length..].copy_from_slice(&fir_tmp);
            let exc = &exc[LPC_ORDER..];

            let mut e1 = 1.0f32;
            let mut e2 = 1.0f32;
            for i in 0..decay_length {
                let a = exc[MAX_PERIOD - decay_length + i];
                let b = exc[MAX_PERIOD - 2 * decay_length + i];
                e1 += a * a;
                e2 += b * b;
            }
            let decay = celt_sqrt(frac_div32(e1.min(e2), e2));

            mem.copy_within(n..DECODE_BUFFER_SIZE, 0);

            let out = DECODE_BUFFER_SIZE - n;
            let mut attenuation = fade * decay;
            let mut j = 0usize;
            let mut s1 = 0.0f32;
            for i in 0..extrapolation_len {
                if j >= pitch_index {
                    j -= pitch_index;
                    attenuation *= decay;
                }
                mem[out + i] = attenuation * exc[extrapolation_offset + j];
                let reference = mem[DECODE_BUFFER_SIZE - MAX_PERIOD - n + extrapolation_offset + j];
                s1 += reference * reference;
                j += 1;
            }

            let mut lpc_mem = [0.0f32; LPC_ORDER];
            for (i, slot) in lpc_mem.iter_mut().enumerate() {
                *slot = mem[out - 1 - i];
            }
            celt_iir(&mut mem[out..out + extrapolation_len], lpc, &mut lpc_mem);

            let s2: f32 = mem[out..out + extrapolation_len].iter().map(|v| v * v).sum();
            if !(s1 > 0.2 * s2) {
                mem[out..out + extrapolation_len].fill(0.0);
            } else if s1 < s2 {
                let ratio = celt_sqrt(frac_div32(s1 + 1.0, s2 + 1.0));
                for (i, sample) in mem[out..out + overlap].iter_mut().enumerate() {
                    *sample *= 1.0 - self.window[i] * (1.0 - ratio);
                }
                for sample in &mut mem[out + overlap..out + extrapolation_len] {
                    *sample *= ratio;
                }
            }

            // Undo the post-filter on the overlap and fold it into the shape
            // an inverse transform would have left behind.
            comb_filter(&mut etmp, mem, DECODE_BUFFER_SIZE, overlap, inverse, inverse, &[]);
            let w = &self.window;
            for i in 0..overlap {
                let fall = w[overlap - 1 - i];
                mem[DECODE_BUFFER_SIZE + i] = fall * (fall * etmp[i] + w[i] * etmp[overlap - 1 - i]);
            }
        }
    }
}

impl<B: BandDecoder> TransformModelDecoder for CeltDecoder<B> {
    fn decode(
        &mut self,
        dec: Option<&mut EcDec<'_>>,
        data: Option<&[u8]>,
        frame: &TransformFrame,
        pcm: &mut [f32],
    ) -> Result<usize, CollaboratorError> {
        let n = frame.frame_size * self.downsample;
        let lm = self
            .mode
            .lm_for_frame_size(n)
            .ok_or(CollaboratorError::Internal)?;
        if !(1..=2).contains(&frame.stream_channels) || frame.end_band > NB_EBANDS {
            return Err(CollaboratorError::Internal);
        }
        if pcm.len() < frame.frame_size * self.channels {
            return Err(CollaboratorError::BufferTooSmall);
        }
        self.start = frame.start_band;
        self.end = frame.end_band;
        self.stream_channels = frame.stream_channels;

        match data.filter(|d| d.len() > 1) {
            None => {
                let noise_based = self.decode_lost(n, lm);
                let out = &mut pcm[..frame.frame_size * self.channels];
                if frame.accumulate {
                    let mut own = vec![0.0f32; out.len()];
                    self.deemphasis(n, &mut own, false);
                    self.limit_concealed_energy(&mut own, noise_based);
                    for (o, v) in out.iter_mut().zip(&own) {
                        *o += v;
                    }
                } else {
                    self.deemphasis(n, out, false);
                    self.limit_concealed_energy(out, noise_based);
                }
            }
            Some(data) => {
                if data.len() > MAX_FRAME_BYTES {
                    return Err(CollaboratorError::Corrupt);
                }
                match dec {
                    Some(dec) => self.decode_frame(dec, data.len(), n, lm, pcm, frame.accumulate)?,
                    None => {
                        let mut dec = EcDec::new(data);
                        self.decode_frame(&mut dec, data.len(), n, lm, pcm, frame.accumulate)?;
                    }
                }
            }
        }
        Ok(frame.frame_size)
    }

    fn reset(&mut self) {
        self.reset_state();
    }

    fn final_range(&self) -> u32 {
        self.final_range
    }

    fn pitch_period(&self) -> usize {
        self.postfilter.period
    }
}

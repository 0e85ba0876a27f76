//! Static description of the 48 kHz / 20 ms transform-codec mode.
//!
//! Only the standard mode exists on the wire, so its tables are plain
//! constants. The overlap window is the one table that needs transcendental
//! functions; [`CeltMode::window`] computes it on demand and decoders cache
//! the result.

use alloc::vec::Vec;

use libm::sinf;

/// Number of energy bands.
pub const NB_EBANDS: usize = 21;

/// Band edges in units of the shortest MDCT (2.5 ms) bin spacing.
pub const EBAND_5MS: [i16; NB_EBANDS + 1] = [
    0, 1, 2, 3, 4, 5, 6, 7, 8, 10, 12, 14, 16, 20, 24, 28, 34, 40, 48, 60, 78, 100,
];

/// Mean log2 energy of each band, added back when denormalising.
pub const E_MEANS: [f32; 25] = [
    6.437_5, 6.25, 5.75, 5.312_5, 5.062_5, 4.812_5, 4.5, 4.375, 4.875, 4.687_5, 4.562_5, 4.437_5,
    4.875, 4.625, 4.312_5, 4.5, 4.375, 4.625, 4.75, 4.437_5, 3.75, 3.75, 3.75, 3.75, 3.75,
];

/// Samples of overlap between consecutive MDCT windows.
pub const OVERLAP: usize = 120;

/// Samples per 2.5 ms at 48 kHz.
pub const SHORT_MDCT_SIZE: usize = 120;

/// Largest `log2(frame / 2.5 ms)`.
pub const MAX_LM: usize = 3;

/// Pre-emphasis filter coefficients.
pub const PREEMPH: [f32; 4] = [0.850_006_1, 0.0, 1.0, 1.0];

/// Sample rate the mode is defined at.
pub const MODE_SAMPLE_RATE: u32 = 48_000;

/// First band coded by the transform layer in hybrid packets.
pub const HYBRID_START_BAND: usize = 17;

/// Parameters of the standard mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CeltMode {
    pub overlap: usize,
    pub eff_ebands: usize,
    pub short_mdct_size: usize,
    pub max_lm: usize,
    pub e_bands: &'static [i16],
}

/// The only mode used by the decoder.
pub const STANDARD_MODE: CeltMode = CeltMode {
    overlap: OVERLAP,
    eff_ebands: NB_EBANDS,
    short_mdct_size: SHORT_MDCT_SIZE,
    max_lm: MAX_LM,
    e_bands: &EBAND_5MS,
};

impl CeltMode {
    /// Power-complementary low-overlap window, `w[i]^2 + w[ov-1-i]^2 = 1`.
    #[must_use]
    pub fn window(&self) -> Vec<f32> {
        use core::f32::consts::FRAC_PI_2;
        let ov = self.overlap as f32;
        (0..self.overlap)
            .map(|i| {
                let s = sinf(FRAC_PI_2 * (i as f32 + 0.5) / ov);
                sinf(FRAC_PI_2 * s * s)
            })
            .collect()
    }

    /// Frame length (in 48 kHz samples) for `lm`.
    #[must_use]
    pub fn frame_size(&self, lm: usize) -> usize {
        self.short_mdct_size << lm
    }

    /// `lm` for a frame of `n` samples at 48 kHz, if the mode supports it.
    #[must_use]
    pub fn lm_for_frame_size(&self, n: usize) -> Option<usize> {
        (0..=self.max_lm).find(|&lm| self.frame_size(lm) == n)
    }

    /// Number of MDCT bins covered by `band` at resolution `m = 1 << lm`.
    #[must_use]
    pub fn band_width(&self, band: usize, m: usize) -> usize {
        (self.e_bands[band + 1] - self.e_bands[band]) as usize * m
    }
}

/// Decimation factor from 48 kHz to `rate`, or `None` for unsupported rates.
#[must_use]
pub fn resampling_factor(rate: u32) -> Option<usize> {
    match rate {
        48_000 | 24_000 | 16_000 | 12_000 | 8_000 => Some((MODE_SAMPLE_RATE / rate) as usize),
        _ => None,
    }
}

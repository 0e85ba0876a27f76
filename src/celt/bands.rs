//! Band-domain helpers shared by real decoding and noise concealment.

use crate::celt::math::{celt_exp2, celt_sqrt};
use crate::celt::modes::{CeltMode, E_MEANS};

const EPSILON: f32 = 1e-15;

/// Linear congruential generator (Numerical Recipes constants).
#[must_use]
#[inline]
pub(crate) fn celt_lcg_rand(seed: u32) -> u32 {
    seed.wrapping_mul(1_664_525).wrapping_add(1_013_904_223)
}

/// Scales `x` to the norm `gain`.
pub(crate) fn renormalise_vector(x: &mut [f32], gain: f32) {
    let energy = EPSILON + x.iter().map(|&v| v * v).sum::<f32>();
    let g = gain / celt_sqrt(energy);
    for v in x.iter_mut() {
        *v *= g;
    }
}

/// Turns unit-norm band shapes back into MDCT coefficients.
///
/// Each band in `start..end` is scaled by `2^(log_e + mean)`, with the
/// exponent capped at 32. Bins below `start` and above the last coded (or,
/// when downsampling, representable) bin are zeroed.
#[allow(clippy::too_many_arguments)]
pub(crate) fn denormalise_bands(
    mode: &CeltMode,
    x: &[f32],
    freq: &mut [f32],
    band_log_e: &[f32],
    start: usize,
    end: usize,
    m: usize,
    downsample: usize,
    silence: bool,
) {
    let n = m * mode.short_mdct_size;
    let e_bands = mode.e_bands;
    let (start, end) = if silence { (0, 0) } else { (start, end) };
    let mut bound = m * e_bands[end] as usize;
    if downsample != 1 {
        bound = bound.min(n / downsample);
    }

    let start_bin = m * e_bands[start] as usize;
    freq[..start_bin].fill(0.0);
    for band in start..end {
        let lo = m * e_bands[band] as usize;
        let hi = m * e_bands[band + 1] as usize;
        let g = celt_exp2((band_log_e[band] + E_MEANS[band]).min(32.0));
        for (f, &v) in freq[lo..hi].iter_mut().zip(&x[lo..hi]) {
            *f = v * g;
        }
    }
    freq[bound..n].fill(0.0);
}

/// Fills bands `start..end` of `x` with unit-norm noise driven by `seed`.
///
/// Returns the advanced seed.
pub(crate) fn fill_band_noise(
    mode: &CeltMode,
    x: &mut [f32],
    start: usize,
    end: usize,
    m: usize,
    mut seed: u32,
) -> u32 {
    for band in start..end {
        let lo = m * mode.e_bands[band] as usize;
        let hi = lo + mode.band_width(band, m);
        for v in &mut x[lo..hi] {
            seed = celt_lcg_rand(seed);
            *v = (seed as i32 >> 20) as f32;
        }
        renormalise_vector(&mut x[lo..hi], 1.0);
    }
    seed
}

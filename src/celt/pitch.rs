//! Open-loop pitch search over the decoded history.
//!
//! Concealment needs a single lag estimate per loss run. The history is
//! low-passed and decimated by two ([`pitch_downsample`]), then searched
//! coarse-to-fine ([`pitch_search`]).

use alloc::vec;

use crate::celt::lpc::{celt_autocorr, celt_lpc};

/// Dot product of two equally long vectors.
#[inline]
pub(crate) fn celt_inner_prod(x: &[f32], y: &[f32]) -> f32 {
    debug_assert_eq!(x.len(), y.len());
    x.iter().zip(y).map(|(&a, &b)| a * b).sum()
}

/// Correlates `x[..len]` against `y` at delays `0..max_pitch`.
pub(crate) fn celt_pitch_xcorr(x: &[f32], y: &[f32], len: usize, max_pitch: usize, xcorr: &mut [f32]) {
    debug_assert!(y.len() + 1 >= len + max_pitch);
    let x = &x[..len];
    for (delay, slot) in xcorr.iter_mut().enumerate().take(max_pitch) {
        *slot = celt_inner_prod(x, &y[delay..delay + len]);
    }
}

/// Keeps the two lags with the highest energy-normalised correlation.
///
/// Scores are compared as cross-multiplied fractions so no division is
/// needed.
fn find_best_pitch(xcorr: &[f32], y: &[f32], len: usize, max_pitch: usize) -> [usize; 2] {
    let mut syy = 1.0 + y[..len].iter().map(|&v| v * v).sum::<f32>();
    let mut best_num = [-1.0f32, -1.0];
    let mut best_den = [0.0f32, 0.0];
    let mut best = [0usize, usize::from(max_pitch > 1)];

    for (i, &corr) in xcorr.iter().enumerate().take(max_pitch) {
        if corr > 0.0 {
            // Rescaled so squaring cannot overflow; the factor cancels out.
            let c = corr * 1e-12;
            let num = c * c;
            if num * best_den[1] > best_num[1] * syy {
                if num * best_den[0] > best_num[0] * syy {
                    best_num[1] = best_num[0];
                    best_den[1] = best_den[0];
                    best[1] = best[0];
                    best_num[0] = num;
                    best_den[0] = syy;
                    best[0] = i;
                } else {
                    best_num[1] = num;
                    best_den[1] = syy;
                    best[1] = i;
                }
            }
        }
        syy += y[i + len] * y[i + len] - y[i] * y[i];
        syy = syy.max(1.0);
    }
    best
}

/// Coarse-to-fine search for the lag of `x_lp` inside `y`.
///
/// Both inputs are already decimated by two while `len` and `max_pitch`
/// count full-rate samples. A further decimated sweep picks two candidates
/// which are then refined at half rate. The returned lag is in full-rate
/// samples with a pseudo-interpolated last bit.
pub(crate) fn pitch_search(x_lp: &[f32], y: &[f32], len: usize, max_pitch: usize) -> usize {
    debug_assert!(len > 0 && max_pitch > 0);
    debug_assert!(x_lp.len() >= len >> 1 && y.len() >= (len + max_pitch) >> 1);
    let lag = len + max_pitch;

    let x_lp4: alloc::vec::Vec<f32> = (0..len >> 2).map(|j| x_lp[2 * j]).collect();
    let y_lp4: alloc::vec::Vec<f32> = (0..lag >> 2).map(|j| y[2 * j]).collect();

    let mut xcorr = vec![0.0f32; (max_pitch >> 1).max(1)];
    celt_pitch_xcorr(&x_lp4, &y_lp4, len >> 2, max_pitch >> 2, &mut xcorr);
    let coarse = find_best_pitch(&xcorr, &y_lp4, len >> 2, max_pitch >> 2);

    let half_len = len >> 1;
    let half_pitch = max_pitch >> 1;
    for (i, slot) in xcorr.iter_mut().enumerate().take(half_pitch) {
        *slot = 0.0;
        let near = |c: usize| (i as isize - 2 * c as isize).abs() <= 2;
        if !near(coarse[0]) && !near(coarse[1]) {
            continue;
        }
        let sum = celt_inner_prod(&x_lp[..half_len], &y[i..i + half_len]);
        *slot = sum.max(-1.0);
    }
    let fine = find_best_pitch(&xcorr, y, half_len, half_pitch);

    let best = fine[0];
    let mut offset = 0isize;
    if best > 0 && best + 1 < half_pitch {
        let (a, b, c) = (xcorr[best - 1], xcorr[best], xcorr[best + 1]);
        if c - a > 0.7 * (b - a) {
            offset = 1;
        } else if a - c > 0.7 * (b - c) {
            offset = -1;
        }
    }
    (2 * best as isize - offset).max(0) as usize
}

/// Five-tap FIR applied in place with zero history.
fn celt_fir5(x: &mut [f32], num: &[f32; 5]) {
    let mut mem = [0.0f32; 5];
    for sample in x.iter_mut() {
        let cur = *sample;
        *sample = cur + num.iter().zip(&mem).map(|(&c, &m)| c * m).sum::<f32>();
        mem.copy_within(..4, 1);
        mem[0] = cur;
    }
}

/// Low-passes, decimates by two and whitens one or two channels into `x_lp`.
///
/// `x_lp` receives `len / 2` samples; channels are summed.
pub(crate) fn pitch_downsample(x: &[&[f32]], x_lp: &mut [f32], len: usize) {
    let half = len / 2;
    debug_assert!(x_lp.len() >= half && half > 0);
    let x_lp = &mut x_lp[..half];
    x_lp.fill(0.0);

    for channel in x {
        x_lp[0] += 0.25 * channel[1] + 0.5 * channel[0];
        for i in 1..half {
            x_lp[i] += 0.25 * channel[2 * i - 1] + 0.5 * channel[2 * i] + 0.25 * channel[2 * i + 1];
        }
    }

    let mut ac = [0.0f32; 5];
    celt_autocorr(x_lp, &mut ac, None, 4);
    // Noise floor at -40 dB plus lag windowing.
    ac[0] *= 1.0001;
    for (i, v) in ac.iter_mut().enumerate().skip(1) {
        let f = 0.008 * i as f32;
        *v -= *v * f * f;
    }

    let mut lpc = [0.0f32; 4];
    celt_lpc(&mut lpc, &ac);
    let mut g = 1.0f32;
    for c in &mut lpc {
        g *= 0.9;
        *c *= g;
    }

    const C1: f32 = 0.8;
    let taps = [
        lpc[0] + C1,
        lpc[1] + C1 * lpc[0],
        lpc[2] + C1 * lpc[1],
        lpc[3] + C1 * lpc[2],
        C1 * lpc[3],
    ];
    celt_fir5(x_lp, &taps);
}

//! Linear prediction used by pitch-based concealment.
//!
//! The concealment path fits a short all-pole model to the decoded history
//! ([`celt_autocorr`] + [`celt_lpc`]), whitens the history into an excitation
//! ([`celt_fir`]) and, once the excitation has been extrapolated, shapes it
//! back with [`celt_iir`].

use alloc::vec::Vec;

use crate::celt::math::frac_div32;
use crate::celt::pitch::celt_pitch_xcorr;

/// Levinson-Durbin recursion.
///
/// `ac` holds at least `lpc.len() + 1` autocorrelation values, zero lag
/// first. The recursion stops early once the prediction error drops below
/// 30 dB under `ac[0]`, which keeps the filter stable on near-silent input.
pub(crate) fn celt_lpc(lpc: &mut [f32], ac: &[f32]) {
    let order = lpc.len();
    debug_assert!(ac.len() > order);
    lpc.fill(0.0);
    if order == 0 || ac[0] <= 1e-10 {
        return;
    }

    let ac0 = ac[0];
    let mut error = ac0;
    for i in 0..order {
        let rr = ac[i + 1]
            + lpc[..i]
                .iter()
                .enumerate()
                .map(|(j, &c)| c * ac[i - j])
                .sum::<f32>();
        let r = -frac_div32(rr, error);
        lpc[i] = r;
        for j in 0..(i + 1) >> 1 {
            let a = lpc[j];
            let b = lpc[i - 1 - j];
            lpc[j] = a + r * b;
            lpc[i - 1 - j] = b + r * a;
        }
        error -= r * r * error;
        if error <= 0.001 * ac0 {
            break;
        }
    }
}

/// FIR filter `y[i] = x[ord + i] + sum_k num[k] * x[ord + i - 1 - k]`.
///
/// `x` starts with `num.len()` samples of history followed by `y.len()` new
/// samples.
pub(crate) fn celt_fir(x: &[f32], num: &[f32], y: &mut [f32]) {
    let ord = num.len();
    debug_assert!(x.len() >= ord + y.len());
    for (i, out) in y.iter_mut().enumerate() {
        let past = &x[i..ord + i];
        *out = x[ord + i]
            + num
                .iter()
                .zip(past.iter().rev())
                .map(|(&c, &s)| c * s)
                .sum::<f32>();
    }
}

/// All-pole filter applied in place.
///
/// `mem` holds the most recent outputs, newest first, and is updated so the
/// filter can be resumed on the next block.
pub(crate) fn celt_iir(buf: &mut [f32], den: &[f32], mem: &mut [f32]) {
    let ord = den.len();
    debug_assert_eq!(mem.len(), ord);
    if ord == 0 {
        return;
    }
    for sample in buf.iter_mut() {
        let acc = *sample - den.iter().zip(mem.iter()).map(|(&c, &m)| c * m).sum::<f32>();
        mem.copy_within(..ord - 1, 1);
        mem[0] = acc;
        *sample = acc;
    }
}

/// Autocorrelation of `x` for lags `0..=lag`.
///
/// When `window` is given, its first `window.len()` coefficients taper both
/// ends of the signal before correlating.
pub(crate) fn celt_autocorr(x: &[f32], ac: &mut [f32], window: Option<&[f32]>, lag: usize) {
    let n = x.len();
    debug_assert!(ac.len() > lag && lag <= n);

    let mut tapered: Vec<f32>;
    let xs: &[f32] = match window {
        Some(w) if !w.is_empty() => {
            let overlap = w.len().min(n);
            tapered = x.to_vec();
            for (i, &c) in w.iter().take(overlap).enumerate() {
                tapered[i] *= c;
                tapered[n - 1 - i] *= c;
            }
            &tapered
        }
        _ => x,
    };

    let fast_n = n - lag;
    celt_pitch_xcorr(xs, xs, fast_n, lag + 1, ac);
    for (k, slot) in ac.iter_mut().enumerate().take(lag + 1) {
        *slot += (k + fast_n..n).map(|i| xs[i] * xs[i - k]).sum::<f32>();
    }
}

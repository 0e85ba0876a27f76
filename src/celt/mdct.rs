//! Inverse MDCT with low-overlap windowing.
//!
//! The transform is evaluated directly: each output sample is a cosine sum
//! over the coefficients, generated by a Chebyshev recurrence in double
//! precision. Frames are at most 960 bins, which keeps the quadratic cost
//! acceptable for a decoder that only synthesises the transform layer.

use libm::cos;

/// Inverse MDCT of `coef.len()` bins, windowed and overlap-added into `out`.
///
/// Of the `2 * n` samples the inverse transform yields, only the middle
/// `n + overlap` carry window support. They are written to
/// `out[..n + overlap]`: the first `overlap` samples are added to what is
/// already there (the previous frame's tail), the rest overwrite it.
/// Coefficients are taken from `coef[k * stride]` so interleaved short blocks
/// can be read in place.
pub(crate) fn imdct_overlap_add(coef: &[f32], n: usize, stride: usize, window: &[f32], out: &mut [f32]) {
    let overlap = window.len();
    debug_assert!(overlap <= n && (n - overlap) % 2 == 0);
    debug_assert!(out.len() >= n + overlap);
    debug_assert!(coef.len() > (n - 1) * stride);

    let nf = n as f64;
    let shift = (n - overlap) / 2;
    for (i, slot) in out.iter_mut().enumerate().take(n + overlap) {
        let t = (i + shift) as f64;
        let a = core::f64::consts::PI / nf * (t + 0.5 + nf / 2.0);
        // cos(a * (k + 1/2)) for k = 0, 1, .. via c[k+1] = 2cos(a) c[k] - c[k-1].
        let two_cos = 2.0 * cos(a);
        let mut prev = cos(-0.5 * a);
        let mut cur = cos(0.5 * a);
        let mut acc = 0.0f64;
        for k in 0..n {
            acc += f64::from(coef[k * stride]) * cur;
            let next = two_cos * cur - prev;
            prev = cur;
            cur = next;
        }
        let mut y = acc as f32;
        if i < overlap {
            y *= window[i];
            *slot += y;
        } else {
            if i >= n {
                y *= window[n + overlap - 1 - i];
            }
            *slot = y;
        }
    }
}

/// Synthesises one channel of a frame from its MDCT coefficients.
///
/// A transient frame carries `blocks` interleaved short transforms of
/// `n / blocks` bins each; a normal frame one long transform.
pub(crate) fn inverse_transform(freq: &[f32], n: usize, blocks: usize, window: &[f32], out: &mut [f32]) {
    let nb = n / blocks;
    for b in 0..blocks {
        imdct_overlap_add(&freq[b..], nb, blocks, window, &mut out[b * nb..]);
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec;
    use alloc::vec::Vec;

    use super::{imdct_overlap_add, inverse_transform};
    use crate::celt::modes::STANDARD_MODE;

    fn forward_mdct(x: &[f64], n: usize) -> Vec<f64> {
        // Reference forward transform over 2n windowed samples.
        (0..n)
            .map(|k| {
                (0..2 * n)
                    .map(|t| {
                        let a = core::f64::consts::PI / n as f64
                            * (t as f64 + 0.5 + n as f64 / 2.0)
                            * (k as f64 + 0.5);
                        x[t] * a.cos()
                    })
                    .sum::<f64>()
                    * 2.0
                    / n as f64
            })
            .collect()
    }

    #[test]
    fn zero_spectrum_keeps_only_previous_overlap() {
        let window = STANDARD_MODE.window();
        let mut out = vec![1.0f32; 240 + 120];
        imdct_overlap_add(&[0.0; 240], 240, 1, &window, &mut out);
        assert!(out[..120].iter().all(|&v| v == 1.0));
        assert!(out[120..].iter().all(|&v| v == 0.0));
    }

    #[test]
    fn overlap_add_reconstructs_constant_signal() {
        // Two consecutive frames of a signal that is 1.0 over the whole
        // support must overlap-add back to 1.0 in the shared region.
        let n = 240;
        let window: Vec<f32> = STANDARD_MODE.window();
        let ov = window.len();
        let shift = (n - ov) / 2;

        let mut full_window = vec![0.0f64; 2 * n];
        for i in 0..n + ov {
            let w = if i < ov {
                f64::from(window[i])
            } else if i >= n {
                f64::from(window[n + ov - 1 - i])
            } else {
                1.0
            };
            full_window[i + shift] = w;
        }
        let frame: Vec<f64> = full_window.clone();
        let coef: Vec<f32> = forward_mdct(&frame, n).iter().map(|&v| v as f32).collect();

        let mut out = vec![0.0f32; 2 * n + ov];
        imdct_overlap_add(&coef, n, 1, &window, &mut out[..]);
        imdct_overlap_add(&coef, n, 1, &window, &mut out[n..]);
        for (i, &v) in out[n..n + ov].iter().enumerate() {
            assert!((v - 1.0).abs() < 1e-3, "i={i} v={v}");
        }
        for &v in &out[ov..n] {
            assert!((v - 1.0).abs() < 1e-3);
        }
    }

    #[test]
    fn short_blocks_tile_the_frame() {
        let window = STANDARD_MODE.window();
        let n = 960;
        let freq = vec![0.0f32; n];
        let mut out = vec![2.0f32; n + 120];
        inverse_transform(&freq, n, 8, &window, &mut out);
        assert!(out[..120].iter().all(|&v| v == 2.0));
        assert!(out[120..].iter().all(|&v| v == 0.0));
    }
}

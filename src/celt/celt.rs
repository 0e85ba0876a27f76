//! Pitch post-filter ("comb filter").
//!
//! The decoder runs a three-tap periodic filter over its synthesis output.
//! Parameters change at frame boundaries; across the first `overlap` samples
//! of a frame the old and new filters are cross-faded with the squared
//! overlap window.

/// Shortest period the filter accepts.
pub(crate) const COMBFILTER_MINPERIOD: usize = 15;

/// Longest period the bitstream can signal.
pub(crate) const COMBFILTER_MAXPERIOD: usize = 1024;

/// Tap gains for the three tapsets.
pub(crate) const GAINS: [[f32; 3]; 3] = [
    [0.306_640_63, 0.217_041_02, 0.129_638_67],
    [0.463_867_2, 0.268_066_4, 0.0],
    [0.799_804_7, 0.100_097_66, 0.0],
];

/// One parameter set of the post-filter.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub(crate) struct CombParams {
    pub period: usize,
    pub gain: f32,
    pub tapset: usize,
}

impl CombParams {
    fn taps(&self) -> [f32; 3] {
        let g = GAINS[self.tapset.min(2)];
        [self.gain * g[0], self.gain * g[1], self.gain * g[2]]
    }

    fn clamped_period(&self) -> usize {
        self.period.max(COMBFILTER_MINPERIOD)
    }

    /// Same parameters with the gain negated, which undoes the filter.
    #[must_use]
    pub fn inverse(self) -> Self {
        Self {
            gain: -self.gain,
            ..self
        }
    }
}

#[inline]
fn comb_tap(read: impl Fn(usize) -> f32, pos: usize, t: usize, g: &[f32; 3]) -> f32 {
    g[0] * read(pos - t)
        + g[1] * (read(pos - t + 1) + read(pos - t - 1))
        + g[2] * (read(pos - t + 2) + read(pos - t - 2))
}

/// Filters `buf[start..start + n]` in place.
///
/// Reads reach up to `period + 2` samples before `start`. Because the filter
/// writes its output back into the history it reads, it behaves recursively.
pub(crate) fn comb_filter_inplace(
    buf: &mut [f32],
    start: usize,
    n: usize,
    old: CombParams,
    new: CombParams,
    window: &[f32],
) {
    if old.gain == 0.0 && new.gain == 0.0 {
        return;
    }
    let t0 = old.clamped_period();
    let t1 = new.clamped_period();
    debug_assert!(start >= t0.max(t1) + 2);
    let g0 = old.taps();
    let g1 = new.taps();
    let overlap = if old.gain == new.gain && t0 == t1 && old.tapset == new.tapset {
        0
    } else {
        window.len().min(n)
    };

    for i in 0..overlap {
        let pos = start + i;
        let f = window[i] * window[i];
        let faded_out = comb_tap(|k| buf[k], pos, t0, &g0);
        let faded_in = comb_tap(|k| buf[k], pos, t1, &g1);
        buf[pos] += (1.0 - f) * faded_out + f * faded_in;
    }
    if new.gain == 0.0 {
        return;
    }
    for pos in start + overlap..start + n {
        let echo = comb_tap(|k| buf[k], pos, t1, &g1);
        buf[pos] += echo;
    }
}

/// Filters `x[start..start + n]` into `y[..n]` without touching `x`.
pub(crate) fn comb_filter(
    y: &mut [f32],
    x: &[f32],
    start: usize,
    n: usize,
    old: CombParams,
    new: CombParams,
    window: &[f32],
) {
    y[..n].copy_from_slice(&x[start..start + n]);
    if old.gain == 0.0 && new.gain == 0.0 {
        return;
    }
    let t0 = old.clamped_period();
    let t1 = new.clamped_period();
    let g0 = old.taps();
    let g1 = new.taps();
    let overlap = if old.gain == new.gain && t0 == t1 && old.tapset == new.tapset {
        0
    } else {
        window.len().min(n)
    };

    for (i, out) in y.iter_mut().enumerate().take(n) {
        let pos = start + i;
        if i < overlap {
            let f = window[i] * window[i];
            *out += (1.0 - f) * comb_tap(|k| x[k], pos, t0, &g0) + f * comb_tap(|k| x[k], pos, t1, &g1);
        } else if new.gain != 0.0 {
            *out += comb_tap(|k| x[k], pos, t1, &g1);
        }
    }
}

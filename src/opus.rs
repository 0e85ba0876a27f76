//! Output stage helpers: soft clipping and 16-bit conversion.
//!
//! The soft clipper bounds floating-point PCM to the [-1, 1] range while
//! smoothing the transition across frames, so the 16-bit output path never
//! wraps or hard-clips.

use libm::rintf;

/// Clamps every sample to [-2, 2] and reports whether all of them were
/// already inside [-1, 1].
fn limit2_check_within1(samples: &mut [f32]) -> bool {
    let mut within = true;
    for sample in samples.iter_mut() {
        *sample = sample.clamp(-2.0, 2.0);
        within &= (-1.0..=1.0).contains(sample);
    }
    within
}

/// Soft-clips interleaved `pcm` in place.
///
/// `softclip_mem` carries one coefficient per channel so that subsequent
/// frames continue the same non-linearity until the waveform crosses zero.
pub fn opus_pcm_soft_clip(pcm: &mut [f32], frame_size: usize, channels: usize, softclip_mem: &mut [f32]) {
    let Some(total) = frame_size.checked_mul(channels) else {
        return;
    };
    if total == 0 || pcm.len() < total || softclip_mem.len() < channels {
        return;
    }

    let samples = &mut pcm[..total];
    let all_within = limit2_check_within1(samples);
    for (channel, mem) in softclip_mem[..channels].iter_mut().enumerate() {
        let mut view = Strided { samples: &mut *samples, channel, channels };
        *mem = clip_channel(&mut view, frame_size, *mem, all_within);
    }
}

/// One channel of an interleaved buffer.
struct Strided<'a> {
    samples: &'a mut [f32],
    channel: usize,
    channels: usize,
}

impl Strided<'_> {
    fn get(&self, i: usize) -> f32 {
        self.samples[i * self.channels + self.channel]
    }

    fn set(&mut self, i: usize, value: f32) {
        self.samples[i * self.channels + self.channel] = value;
    }

    /// Applies `x + a*x^2` to the samples in `range`.
    fn bend(&mut self, range: core::ops::Range<usize>, a: f32) {
        for i in range {
            let x = self.get(i);
            self.set(i, x + a * x * x);
        }
    }
}

/// Soft-clips one channel and returns the coefficient the next frame starts
/// with.
fn clip_channel(x: &mut Strided<'_>, n: usize, mem: f32, all_within: bool) -> f32 {
    // The previous frame's curve runs on until the first zero crossing.
    let carry = (0..n).find(|&i| x.get(i) * mem >= 0.0).unwrap_or(n);
    x.bend(0..carry, mem);

    let x0 = x.get(0);
    let mut a = 0.0;
    let mut curr = 0;
    while curr < n {
        let next = if all_within {
            None
        } else {
            (curr..n).find(|&i| !(-1.0..=1.0).contains(&x.get(i)))
        };
        let Some(clipped) = next else {
            return 0.0;
        };

        let peak_sign = x.get(clipped);
        let same_side = |x: &Strided<'_>, i: usize| peak_sign * x.get(i) >= 0.0;

        let mut start = clipped;
        while start > 0 && same_side(&*x, start - 1) {
            start -= 1;
        }
        let mut end = clipped;
        let mut peak = clipped;
        let mut maxval = peak_sign.abs();
        while end < n && same_side(&*x, end) {
            if x.get(end).abs() > maxval {
                maxval = x.get(end).abs();
                peak = end;
            }
            end += 1;
        }
        let touches_start = start == 0 && same_side(&*x, 0);

        // Solve maxval + a*maxval^2 = 1, nudged so the peak lands inside.
        a = (maxval - 1.0) / (maxval * maxval);
        a += a * 2.4e-7;
        if peak_sign > 0.0 {
            a = -a;
        }
        x.bend(start..end, a);

        if touches_start && peak >= 2 {
            // Ramp from the untouched first sample to the peak so the frame
            // start stays continuous.
            let mut offset = x0 - x.get(0);
            let delta = offset / peak as f32;
            for i in curr..peak {
                offset -= delta;
                let v = (x.get(i) + offset).clamp(-1.0, 1.0);
                x.set(i, v);
            }
        }
        curr = end;
    }
    a
}

/// Converts a sample in [-1, 1] to 16 bits, rounding to nearest even and
/// saturating outside the range.
#[must_use]
pub fn float_to_i16(value: f32) -> i16 {
    let scaled = (value * 32_768.0).clamp(-32_768.0, 32_767.0);
    rintf(scaled) as i16
}

/// Linear scale for an output gain in Q8 dB.
#[must_use]
pub fn gain_scale(gain_q8: i32) -> f32 {
    libm::exp2f(6.488_140_8e-4 * gain_q8 as f32)
}

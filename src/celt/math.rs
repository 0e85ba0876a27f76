//! Scalar helpers shared by the synthesis and concealment paths.
//!
//! Everything here runs in single precision through `libm` so the crate stays
//! `no_std`.

use libm::{expf, sqrtf};

/// Square root.
#[inline]
pub(crate) fn celt_sqrt(x: f32) -> f32 {
    sqrtf(x)
}

/// Division of two Q-format values; a plain division in the float build.
#[inline]
pub(crate) fn frac_div32(a: f32, b: f32) -> f32 {
    a / b
}

/// Base-2 exponential.
#[inline]
pub(crate) fn celt_exp2(x: f32) -> f32 {
    expf(core::f32::consts::LN_2 * x)
}

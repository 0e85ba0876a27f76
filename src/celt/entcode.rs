//! Shared state of the range coder.
//!
//! Both [`EcDec`](crate::celt::EcDec) and [`EcEnc`](crate::celt::EcEnc) keep
//! their registers in an [`EcCtx`]. The buffer lives next to the context in the
//! coder itself so that the decoder can borrow its input immutably.

/// Window type used to buffer raw bits at the tail of the stream.
pub type EcWindow = u32;

/// Number of bits in the raw-bit window.
pub const EC_WINDOW_SIZE: u32 = EcWindow::BITS;

/// Number of bits output at a time by the range coder.
pub const EC_SYM_BITS: u32 = 8;

/// Total number of bits in the coder's state registers.
pub const EC_CODE_BITS: u32 = 32;

/// Maximum value of a single output symbol.
pub const EC_SYM_MAX: u32 = (1 << EC_SYM_BITS) - 1;

/// Carry bit of the high-order range symbol.
pub const EC_CODE_TOP: u32 = 1 << (EC_CODE_BITS - 1);

/// Renormalisation floor: `rng` is kept strictly above this value.
pub const EC_CODE_BOT: u32 = EC_CODE_TOP >> EC_SYM_BITS;

/// Shift that extracts the top output symbol from `val`.
pub const EC_CODE_SHIFT: u32 = EC_CODE_BITS - EC_SYM_BITS - 1;

/// Number of bits carried in the coder state that are not yet output.
pub const EC_CODE_EXTRA: u32 = ((EC_CODE_BITS - 2) % EC_SYM_BITS) + 1;

/// Uniform integers wider than this many bits are split into raw low bits.
pub const EC_UINT_BITS: u32 = 8;

/// Resolution of fractional bit counts reported by [`EcCtx::tell_frac`].
pub const BITRES: u32 = 3;

/// Register file shared by the encoder and the decoder.
///
/// `offs` counts bytes at the front of the buffer (range-coded data) and
/// `end_offs` counts bytes at the back (raw bits). The two never cross.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EcCtx {
    pub storage: u32,
    pub end_offs: u32,
    pub end_window: EcWindow,
    pub nend_bits: i32,
    pub nbits_total: i32,
    pub offs: u32,
    pub rng: u32,
    pub val: u32,
    pub ext: u32,
    pub rem: i32,
    pub error: bool,
}

impl EcCtx {
    /// Number of whole bits consumed (or produced) so far, rounded up.
    #[must_use]
    pub fn tell(&self) -> i32 {
        self.nbits_total - ec_ilog(self.rng)
    }

    /// Number of bits consumed so far in 1/8th bit units.
    #[must_use]
    pub fn tell_frac(&self) -> u32 {
        const CORRECTION: [u32; 8] = [35733, 38967, 42495, 46340, 50535, 55109, 60097, 65535];

        let nbits = (self.nbits_total as u32) << BITRES;
        let mut l = ec_ilog(self.rng);
        debug_assert!(l >= 16);
        let r = self.rng >> ((l - 16) as u32);
        let mut b = ((r >> 12) as usize).saturating_sub(8).min(CORRECTION.len() - 1);
        if r > CORRECTION[b] {
            b += 1;
        }
        l = (l << 3) + b as i32;
        nbits.wrapping_sub(l as u32)
    }

    /// Number of bytes of range-coded data at the front of the buffer.
    #[must_use]
    pub fn range_bytes(&self) -> u32 {
        self.offs
    }

    /// Final interval width, used by conformance checks of decoded streams.
    #[must_use]
    pub fn range_final(&self) -> u32 {
        self.rng
    }
}

/// Integer binary logarithm: one plus the index of the highest set bit.
#[must_use]
pub fn ec_ilog(v: u32) -> i32 {
    (u32::BITS - v.leading_zeros()) as i32
}

/// Unsigned division used for interval scaling.
#[inline]
#[must_use]
pub fn celt_udiv(n: u32, d: u32) -> u32 {
    debug_assert!(d > 0);
    n / d
}

//! Range decoder.
//!
//! The decoder reads range-coded symbols from the front of the packet and raw
//! bits from its back. Reads past the end of the buffer yield zero bytes, so a
//! truncated packet degrades into a deterministic (if meaningless) symbol
//! stream instead of an out-of-bounds access.
//!
//! Errors are sticky: once a decoded value is found to be out of range the
//! error flag is raised and every later decode returns `0` without touching
//! the coder state. Callers inspect [`EcDec::error`] once the frame is done.

use core::cmp::min;

use crate::celt::entcode::{
    EC_CODE_BITS, EC_CODE_BOT, EC_CODE_EXTRA, EC_CODE_TOP, EC_SYM_BITS, EC_SYM_MAX, EC_UINT_BITS,
    EC_WINDOW_SIZE, EcCtx, EcWindow, celt_udiv, ec_ilog,
};

/// Range decoder borrowing a packet payload.
#[derive(Clone, Debug)]
pub struct EcDec<'a> {
    buf: &'a [u8],
    ctx: EcCtx,
}

impl<'a> EcDec<'a> {
    /// Starts decoding `buf`, pre-loading the first symbol.
    #[must_use]
    pub fn new(buf: &'a [u8]) -> Self {
        let ctx = EcCtx {
            storage: u32::try_from(buf.len()).unwrap_or(u32::MAX),
            nbits_total: (EC_CODE_BITS + 1
                - ((EC_CODE_BITS - EC_CODE_EXTRA) / EC_SYM_BITS) * EC_SYM_BITS)
                as i32,
            rng: 1 << EC_CODE_EXTRA,
            ..EcCtx::default()
        };
        let mut dec = Self { buf, ctx };
        dec.ctx.rem = i32::from(dec.read_byte());
        dec.ctx.val = dec.ctx.rng - 1 - ((dec.ctx.rem as u32) >> (EC_SYM_BITS - EC_CODE_EXTRA));
        dec.normalize();
        dec
    }

    /// Read-only view of the coder registers.
    #[must_use]
    pub fn ctx(&self) -> &EcCtx {
        &self.ctx
    }

    /// Whole bits consumed so far.
    #[must_use]
    pub fn tell(&self) -> i32 {
        self.ctx.tell()
    }

    /// Bits consumed so far in 1/8th bit units.
    #[must_use]
    pub fn tell_frac(&self) -> u32 {
        self.ctx.tell_frac()
    }

    /// Whether a decoded value was found to be out of range.
    #[must_use]
    pub fn error(&self) -> bool {
        self.ctx.error
    }

    /// Size of the readable region in bytes.
    #[must_use]
    pub fn storage(&self) -> u32 {
        self.ctx.storage
    }

    /// Current interval width.
    #[must_use]
    pub fn rng(&self) -> u32 {
        self.ctx.rng
    }

    /// Cuts `bytes` off the end of the readable region.
    ///
    /// Used when a trailing sub-frame is carved out of the packet; raw bits
    /// are then read from the new end.
    pub fn shrink_storage(&mut self, bytes: u32) {
        self.ctx.storage = self.ctx.storage.saturating_sub(bytes);
    }

    /// Accounts `total_bits` as consumed.
    ///
    /// A silence frame carries nothing after its flag, so later budget checks
    /// must see it as exhausted.
    pub fn consume_all(&mut self, total_bits: i32) {
        self.ctx.nbits_total += total_bits - self.tell();
    }

    fn read_byte(&mut self) -> u8 {
        if self.ctx.offs < self.ctx.storage {
            let byte = self.buf.get(self.ctx.offs as usize).copied().unwrap_or(0);
            self.ctx.offs += 1;
            byte
        } else {
            0
        }
    }

    fn read_byte_from_end(&mut self) -> u8 {
        if self.ctx.end_offs < self.ctx.storage {
            self.ctx.end_offs += 1;
            let idx = (self.ctx.storage - self.ctx.end_offs) as usize;
            self.buf.get(idx).copied().unwrap_or(0)
        } else {
            0
        }
    }

    fn normalize(&mut self) {
        while self.ctx.rng <= EC_CODE_BOT {
            self.ctx.nbits_total += EC_SYM_BITS as i32;
            self.ctx.rng <<= EC_SYM_BITS;
            let prev = self.ctx.rem as u32;
            self.ctx.rem = i32::from(self.read_byte());
            let sym = ((prev << EC_SYM_BITS) | self.ctx.rem as u32) >> (EC_SYM_BITS - EC_CODE_EXTRA);
            self.ctx.val = ((self.ctx.val << EC_SYM_BITS) + (EC_SYM_MAX & !sym)) & (EC_CODE_TOP - 1);
        }
    }

    /// Returns the cumulative frequency of the next symbol out of `ft`.
    ///
    /// Must be followed by [`EcDec::update`] with the interval of the symbol
    /// that owns the returned frequency. A total wider than the current range
    /// cannot be resolved: it raises the error flag and returns `0`.
    #[must_use]
    pub fn decode(&mut self, ft: u32) -> u32 {
        if self.ctx.error {
            return 0;
        }
        if ft == 0 || ft > self.ctx.rng {
            self.ctx.error = true;
            return 0;
        }
        self.ctx.ext = celt_udiv(self.ctx.rng, ft);
        let s = self.ctx.val / self.ctx.ext;
        ft - min(s + 1, ft)
    }

    /// Like [`EcDec::decode`] with `ft = 1 << bits`.
    #[must_use]
    pub fn decode_bin(&mut self, bits: u32) -> u32 {
        if self.ctx.error {
            return 0;
        }
        self.ctx.ext = self.ctx.rng >> bits;
        let s = self.ctx.val / self.ctx.ext;
        (1 << bits) - min(s + 1, 1 << bits)
    }

    /// Narrows the interval to the symbol `[fl, fh)` out of `ft`.
    pub fn update(&mut self, fl: u32, fh: u32, ft: u32) {
        if self.ctx.error {
            return;
        }
        let s = self.ctx.ext.wrapping_mul(ft - fh);
        self.ctx.val = self.ctx.val.wrapping_sub(s);
        self.ctx.rng = if fl > 0 {
            self.ctx.ext.wrapping_mul(fh - fl)
        } else {
            self.ctx.rng.wrapping_sub(s)
        };
        self.normalize();
    }

    /// Decodes a symbol against a cumulative frequency table.
    ///
    /// `cdf` holds the ascending symbol boundaries `[0, f0, f0 + f1, .., ft]`;
    /// symbol `i` owns `[cdf[i], cdf[i + 1])`. Returns the symbol index.
    #[must_use]
    pub fn dec_symbol(&mut self, cdf: &[u32]) -> usize {
        let Some(&ft) = cdf.last() else {
            self.ctx.error = true;
            return 0;
        };
        if self.ctx.error || cdf.len() < 2 {
            return 0;
        }
        let fs = self.decode(ft);
        let sym = cdf[1..].partition_point(|&hi| hi <= fs);
        let sym = sym.min(cdf.len() - 2);
        self.update(cdf[sym], cdf[sym + 1], ft);
        sym
    }

    /// Decodes a flag that is set with probability `1 / (1 << logp)`.
    #[must_use]
    pub fn dec_bit_logp(&mut self, logp: u32) -> bool {
        if self.ctx.error {
            return false;
        }
        let r = self.ctx.rng;
        let d = self.ctx.val;
        let s = r >> logp;
        let set = d < s;
        if set {
            self.ctx.rng = s;
        } else {
            self.ctx.val = d - s;
            self.ctx.rng = r - s;
        }
        self.normalize();
        set
    }

    /// Decodes a symbol described by an 8-bit inverse CDF with `ftb` bits of
    /// total frequency. The table must end with `0`.
    #[must_use]
    pub fn dec_icdf(&mut self, icdf: &[u8], ftb: u32) -> usize {
        self.dec_icdf_with(icdf.len(), |i| u32::from(icdf[i]), ftb)
    }

    /// 16-bit variant of [`EcDec::dec_icdf`].
    #[must_use]
    pub fn dec_icdf16(&mut self, icdf: &[u16], ftb: u32) -> usize {
        self.dec_icdf_with(icdf.len(), |i| u32::from(icdf[i]), ftb)
    }

    fn dec_icdf_with(&mut self, len: usize, icdf: impl Fn(usize) -> u32, ftb: u32) -> usize {
        if self.ctx.error || len == 0 {
            return 0;
        }
        let d = self.ctx.val;
        let r = self.ctx.rng >> ftb;
        let mut hi = self.ctx.rng;
        for sym in 0..len {
            let lo = r.wrapping_mul(icdf(sym));
            if d >= lo {
                self.ctx.val = d - lo;
                self.ctx.rng = hi - lo;
                self.normalize();
                return sym;
            }
            hi = lo;
        }
        // A well-formed table ends in zero, so the loop always returns.
        self.ctx.error = true;
        0
    }

    /// Decodes an integer uniformly distributed in `[0, ft)`.
    ///
    /// Values needing more than eight bits are split into a range-coded high
    /// part and raw low bits. A decoded value outside the range raises the
    /// error flag and yields `ft - 1`.
    #[must_use]
    pub fn dec_uint(&mut self, ft: u32) -> u32 {
        debug_assert!(ft > 1);
        if self.ctx.error || ft <= 1 {
            return 0;
        }
        let top = ft - 1;
        let ftb = ec_ilog(top) as u32;
        if ftb > EC_UINT_BITS {
            let low_bits = ftb - EC_UINT_BITS;
            let ft_small = (top >> low_bits) + 1;
            let s = self.decode(ft_small);
            self.update(s, s + 1, ft_small);
            let t = (s << low_bits) | self.dec_bits(low_bits);
            if t <= top {
                return t;
            }
            self.ctx.error = true;
            top
        } else {
            let s = self.decode(ft);
            self.update(s, s + 1, ft);
            s
        }
    }

    /// Reads `bits` raw bits (at most 25) from the tail of the buffer.
    #[must_use]
    pub fn dec_bits(&mut self, bits: u32) -> u32 {
        if self.ctx.error || bits == 0 {
            return 0;
        }
        debug_assert!(bits <= EC_WINDOW_SIZE - EC_SYM_BITS + 1);
        let mut window = self.ctx.end_window;
        let mut available = self.ctx.nend_bits;
        if (available as u32) < bits {
            while available <= (EC_WINDOW_SIZE - EC_SYM_BITS) as i32 {
                window |= EcWindow::from(self.read_byte_from_end()) << available as u32;
                available += EC_SYM_BITS as i32;
            }
        }
        let ret = window & ((1u32 << bits) - 1);
        self.ctx.end_window = window >> bits;
        self.ctx.nend_bits = available - bits as i32;
        self.ctx.nbits_total += bits as i32;
        ret
    }

    /// Marks the stream as corrupt from outside the coder.
    pub fn set_error(&mut self) {
        self.ctx.error = true;
    }
}

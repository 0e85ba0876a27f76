//! Range encoder.
//!
//! The encoder is the mirror image of [`EcDec`](crate::celt::EcDec): symbols
//! are range coded into the front of the buffer while raw bits are packed
//! into its back. Output bytes are held back until any pending carry has been
//! resolved.
//!
//! Running out of space raises a sticky error flag; once raised, every
//! further call is a no-op so the partial output is never overwritten.

use crate::celt::entcode::{
    EC_CODE_BITS, EC_CODE_BOT, EC_CODE_SHIFT, EC_CODE_TOP, EC_SYM_BITS, EC_SYM_MAX, EC_UINT_BITS,
    EC_WINDOW_SIZE, EcCtx, EcWindow, celt_udiv, ec_ilog,
};

/// Range encoder writing into a caller-provided buffer.
#[derive(Debug)]
pub struct EcEnc<'a> {
    buf: &'a mut [u8],
    ctx: EcCtx,
}

impl<'a> EcEnc<'a> {
    /// Starts encoding into `buf`; its length is the storage limit.
    #[must_use]
    pub fn new(buf: &'a mut [u8]) -> Self {
        let ctx = EcCtx {
            storage: u32::try_from(buf.len()).unwrap_or(u32::MAX),
            nbits_total: EC_CODE_BITS as i32 + 1,
            rng: EC_CODE_TOP,
            rem: -1,
            ..EcCtx::default()
        };
        Self { buf, ctx }
    }

    /// Read-only view of the coder registers.
    #[must_use]
    pub fn ctx(&self) -> &EcCtx {
        &self.ctx
    }

    /// Whole bits produced so far.
    #[must_use]
    pub fn tell(&self) -> i32 {
        self.ctx.tell()
    }

    /// Bits produced so far in 1/8th bit units.
    #[must_use]
    pub fn tell_frac(&self) -> u32 {
        self.ctx.tell_frac()
    }

    /// Whether the encoder ran out of space or was misused.
    #[must_use]
    pub fn error(&self) -> bool {
        self.ctx.error
    }

    /// Number of bytes written to the front of the buffer.
    #[must_use]
    pub fn range_bytes(&self) -> u32 {
        self.ctx.range_bytes()
    }

    /// Shared view of the output buffer.
    #[must_use]
    pub fn buffer(&self) -> &[u8] {
        self.buf
    }

    fn write_byte(&mut self, value: u32) {
        if self.ctx.offs + self.ctx.end_offs >= self.ctx.storage {
            self.ctx.error = true;
        } else {
            self.buf[self.ctx.offs as usize] = value as u8;
            self.ctx.offs += 1;
        }
    }

    fn write_byte_at_end(&mut self, value: u32) {
        if self.ctx.offs + self.ctx.end_offs >= self.ctx.storage {
            self.ctx.error = true;
        } else {
            self.ctx.end_offs += 1;
            self.buf[(self.ctx.storage - self.ctx.end_offs) as usize] = value as u8;
        }
    }

    /// Emits the symbol `c`, propagating a carry into held-back bytes.
    ///
    /// A run of `0xFF` symbols cannot be written until it is known whether a
    /// carry will roll it over, so only its length is counted in `ext`.
    fn carry_out(&mut self, c: i32) {
        if c == EC_SYM_MAX as i32 {
            self.ctx.ext += 1;
            return;
        }
        let carry = c >> EC_SYM_BITS;
        if self.ctx.rem >= 0 {
            self.write_byte((self.ctx.rem + carry) as u32);
        }
        if self.ctx.ext > 0 {
            let sym = (EC_SYM_MAX + carry as u32) & EC_SYM_MAX;
            for _ in 0..self.ctx.ext {
                self.write_byte(sym);
            }
            self.ctx.ext = 0;
        }
        self.ctx.rem = c & EC_SYM_MAX as i32;
    }

    fn normalize(&mut self) {
        while self.ctx.rng <= EC_CODE_BOT {
            self.carry_out((self.ctx.val >> EC_CODE_SHIFT) as i32);
            self.ctx.val = (self.ctx.val << EC_SYM_BITS) & (EC_CODE_TOP - 1);
            self.ctx.rng <<= EC_SYM_BITS;
            self.ctx.nbits_total += EC_SYM_BITS as i32;
        }
    }

    /// Narrows the interval by `r`-scaled bounds of the symbol `[fl, fh)`
    /// out of a total `ft`.
    fn narrow(&mut self, r: u32, fl: u32, fh: u32, ft: u32) {
        if fl > 0 {
            self.ctx.val = self
                .ctx
                .val
                .wrapping_add(self.ctx.rng.wrapping_sub(r.wrapping_mul(ft - fl)));
            self.ctx.rng = r.wrapping_mul(fh - fl);
        } else {
            self.ctx.rng = self.ctx.rng.wrapping_sub(r.wrapping_mul(ft - fh));
        }
        self.normalize();
    }

    /// Encodes the symbol occupying `[fl, fh)` out of a total frequency `ft`.
    ///
    /// An empty interval, or a total wider than the current range, raises the
    /// error flag and writes nothing.
    pub fn encode(&mut self, fl: u32, fh: u32, ft: u32) {
        if self.ctx.error {
            return;
        }
        if fl >= fh || fh > ft || ft > self.ctx.rng {
            self.ctx.error = true;
            return;
        }
        let r = celt_udiv(self.ctx.rng, ft);
        self.narrow(r, fl, fh, ft);
    }

    /// Like [`EcEnc::encode`] with `ft = 1 << bits`.
    pub fn encode_bin(&mut self, fl: u32, fh: u32, bits: u32) {
        if self.ctx.error {
            return;
        }
        let r = self.ctx.rng >> bits;
        self.narrow(r, fl, fh, 1 << bits);
    }

    /// Encodes symbol `s` of a cumulative frequency table laid out as for
    /// [`EcDec::dec_symbol`](crate::celt::EcDec::dec_symbol).
    pub fn enc_symbol(&mut self, s: usize, cdf: &[u32]) {
        debug_assert!(s + 1 < cdf.len());
        if let (Some(&fl), Some(&fh), Some(&ft)) = (cdf.get(s), cdf.get(s + 1), cdf.last()) {
            self.encode(fl, fh, ft);
        } else {
            self.ctx.error = true;
        }
    }

    /// Encodes a flag that is set with probability `1 / (1 << logp)`.
    pub fn enc_bit_logp(&mut self, set: bool, logp: u32) {
        if self.ctx.error {
            return;
        }
        let r = self.ctx.rng;
        let s = r >> logp;
        if set {
            self.ctx.val = self.ctx.val.wrapping_add(r - s);
            self.ctx.rng = s;
        } else {
            self.ctx.rng = r - s;
        }
        self.normalize();
    }

    /// Encodes symbol `s` of an 8-bit inverse CDF with `ftb` bits of total
    /// frequency.
    pub fn enc_icdf(&mut self, s: usize, icdf: &[u8], ftb: u32) {
        let hi = if s > 0 { u32::from(icdf[s - 1]) } else { 0 };
        self.enc_icdf_bounds(s > 0, hi, u32::from(icdf[s]), ftb);
    }

    /// 16-bit variant of [`EcEnc::enc_icdf`].
    pub fn enc_icdf16(&mut self, s: usize, icdf: &[u16], ftb: u32) {
        let hi = if s > 0 { u32::from(icdf[s - 1]) } else { 0 };
        self.enc_icdf_bounds(s > 0, hi, u32::from(icdf[s]), ftb);
    }

    fn enc_icdf_bounds(&mut self, has_prev: bool, hi: u32, lo: u32, ftb: u32) {
        if self.ctx.error {
            return;
        }
        let r = self.ctx.rng >> ftb;
        if has_prev {
            self.ctx.val = self
                .ctx
                .val
                .wrapping_add(self.ctx.rng.wrapping_sub(r.wrapping_mul(hi)));
            self.ctx.rng = r.wrapping_mul(hi - lo);
        } else {
            self.ctx.rng = self.ctx.rng.wrapping_sub(r.wrapping_mul(lo));
        }
        self.normalize();
    }

    /// Encodes `fl` uniformly distributed in `[0, ft)`.
    pub fn enc_uint(&mut self, fl: u32, ft: u32) {
        debug_assert!(ft > 1 && fl < ft);
        if ft <= 1 {
            return;
        }
        let top = ft - 1;
        let ftb = ec_ilog(top) as u32;
        if ftb > EC_UINT_BITS {
            let low_bits = ftb - EC_UINT_BITS;
            let high = fl >> low_bits;
            self.encode(high, high + 1, (top >> low_bits) + 1);
            self.enc_bits(fl & ((1 << low_bits) - 1), low_bits);
        } else {
            self.encode(fl, fl + 1, ft);
        }
    }

    /// Appends `bits` raw bits (at most 25) to the tail of the stream.
    pub fn enc_bits(&mut self, fl: u32, bits: u32) {
        if self.ctx.error {
            return;
        }
        debug_assert!(bits > 0 && bits <= EC_WINDOW_SIZE - EC_SYM_BITS + 1);
        let mut window = self.ctx.end_window;
        let mut used = self.ctx.nend_bits;
        if used as u32 + bits > EC_WINDOW_SIZE {
            while used >= EC_SYM_BITS as i32 {
                self.write_byte_at_end(window & EC_SYM_MAX);
                window >>= EC_SYM_BITS;
                used -= EC_SYM_BITS as i32;
            }
        }
        window |= (fl as EcWindow) << used as u32;
        self.ctx.end_window = window;
        self.ctx.nend_bits = used + bits as i32;
        self.ctx.nbits_total += bits as i32;
    }

    /// Overwrites the first `nbits` bits of the stream after the fact.
    ///
    /// Fails (raising the error flag) when fewer than `nbits` bits have been
    /// committed so far.
    pub fn enc_patch_initial_bits(&mut self, val: u32, nbits: u32) {
        if self.ctx.error {
            return;
        }
        debug_assert!(nbits <= EC_SYM_BITS);
        let shift = EC_SYM_BITS - nbits;
        let mask = ((1u32 << nbits) - 1) << shift;
        let patched = (val & ((1 << nbits) - 1)) << shift;
        if self.ctx.offs > 0 {
            self.buf[0] = ((u32::from(self.buf[0]) & !mask) | patched) as u8;
        } else if self.ctx.rem >= 0 {
            self.ctx.rem = ((self.ctx.rem as u32 & !mask) | patched) as i32;
        } else if self.ctx.rng <= (EC_CODE_TOP >> nbits) {
            self.ctx.val = (self.ctx.val & !(mask << EC_CODE_SHIFT)) | (patched << EC_CODE_SHIFT);
        } else {
            self.ctx.error = true;
        }
    }

    /// Reduces the storage limit to `size` bytes, moving the raw-bit tail.
    pub fn enc_shrink(&mut self, size: u32) {
        if self.ctx.error {
            return;
        }
        if self.ctx.offs + self.ctx.end_offs > size {
            self.ctx.error = true;
            return;
        }
        if size < self.ctx.storage {
            let len = self.ctx.end_offs as usize;
            let src = (self.ctx.storage - self.ctx.end_offs) as usize;
            let dst = (size - self.ctx.end_offs) as usize;
            self.buf.copy_within(src..src + len, dst);
            self.ctx.storage = size;
        }
    }

    /// Flushes the interval and the raw-bit window.
    ///
    /// Writes the fewest bits that identify the final interval, then zero
    /// fills the gap between the range-coded and raw regions.
    pub fn enc_done(&mut self) {
        if self.ctx.error {
            return;
        }
        let mut l = EC_CODE_BITS as i32 - ec_ilog(self.ctx.rng);
        let mut msk = (EC_CODE_TOP - 1) >> l;
        let mut end = self.ctx.val.wrapping_add(msk) & !msk;
        if (end | msk) >= self.ctx.val.wrapping_add(self.ctx.rng) {
            l += 1;
            msk >>= 1;
            end = self.ctx.val.wrapping_add(msk) & !msk;
        }
        while l > 0 {
            self.carry_out((end >> EC_CODE_SHIFT) as i32);
            end = (end << EC_SYM_BITS) & (EC_CODE_TOP - 1);
            l -= EC_SYM_BITS as i32;
        }
        if self.ctx.rem >= 0 || self.ctx.ext > 0 {
            self.carry_out(0);
        }

        let mut window = self.ctx.end_window;
        let mut used = self.ctx.nend_bits;
        while used >= EC_SYM_BITS as i32 {
            self.write_byte_at_end(window & EC_SYM_MAX);
            window >>= EC_SYM_BITS;
            used -= EC_SYM_BITS as i32;
        }
        if !self.ctx.error {
            let gap = self.ctx.offs as usize..(self.ctx.storage - self.ctx.end_offs) as usize;
            self.buf[gap].fill(0);
            if used > 0 {
                if self.ctx.end_offs >= self.ctx.storage {
                    self.ctx.error = true;
                } else {
                    // Bits of the final partial byte that would collide with
                    // range-coded data are dropped.
                    let room = -l;
                    if self.ctx.offs + self.ctx.end_offs >= self.ctx.storage && room < used {
                        window &= if room > 0 { (1 << room) - 1 } else { 0 };
                        self.ctx.error = true;
                    }
                    let idx = (self.ctx.storage - self.ctx.end_offs - 1) as usize;
                    self.buf[idx] |= window as u8;
                }
            }
        }
        self.ctx.end_window = window;
        self.ctx.nend_bits = used;
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec;
    use alloc::vec::Vec;

    use super::EcEnc;
    use crate::celt::entcode::{EC_CODE_BITS, EC_CODE_TOP};
    use crate::celt::entdec::EcDec;

    #[test]
    fn encoder_initial_registers() {
        let mut buf = vec![0u8; 8];
        let enc = EcEnc::new(&mut buf);
        let ctx = enc.ctx();
        assert_eq!(ctx.storage, 8);
        assert_eq!(ctx.nbits_total, EC_CODE_BITS as i32 + 1);
        assert_eq!(ctx.rng, EC_CODE_TOP);
        assert_eq!(ctx.rem, -1);
        assert_eq!(enc.tell(), 1);
        assert!(!enc.error());
    }

    #[test]
    fn enc_done_flushes_raw_bits_to_last_byte() {
        let mut buf = vec![0u8; 4];
        let mut enc = EcEnc::new(&mut buf);
        enc.enc_bits(0b1011, 4);
        enc.enc_done();
        assert!(!enc.error());
        assert_eq!(buf[3], 0b1011);
    }

    #[test]
    fn enc_shrink_moves_tail_bytes() {
        let mut buf = vec![0u8; 8];
        let mut enc = EcEnc::new(&mut buf);
        enc.enc_uint(3, 5);
        for _ in 0..3 {
            enc.enc_bits(0xAB, 8);
        }
        // Forces the first three raw bytes out of the window.
        enc.enc_bits(0x1FF, 9);
        enc.enc_shrink(6);
        enc.enc_done();
        assert!(!enc.error());

        let mut dec = EcDec::new(&buf[..6]);
        assert_eq!(dec.dec_uint(5), 3);
        for _ in 0..3 {
            assert_eq!(dec.dec_bits(8), 0xAB);
        }
        assert_eq!(dec.dec_bits(9), 0x1FF);
    }

    #[test]
    fn uint_roundtrip_all_small_ranges() {
        let mut buf = vec![0u8; 1_000_000];
        {
            let mut enc = EcEnc::new(&mut buf);
            for ft in 2..1024u32 {
                for i in 0..ft {
                    enc.enc_uint(i, ft);
                }
            }
            enc.enc_done();
            assert!(!enc.error());
        }
        let mut dec = EcDec::new(&buf);
        for ft in 2..1024u32 {
            for i in 0..ft {
                assert_eq!(dec.dec_uint(ft), i, "ft={ft}");
            }
        }
    }

    #[test]
    fn raw_bits_cost_exactly_their_width() {
        let mut buf = vec![0u8; 1_000_000];
        {
            let mut enc = EcEnc::new(&mut buf);
            for ftb in 1..16u32 {
                for i in 0..(1u32 << ftb) {
                    let before = enc.tell();
                    enc.enc_bits(i, ftb);
                    assert_eq!(enc.tell() - before, ftb as i32);
                }
            }
            enc.enc_done();
            assert!(!enc.error());
        }
        let mut dec = EcDec::new(&buf);
        for ftb in 1..16u32 {
            for i in 0..(1u32 << ftb) {
                assert_eq!(dec.dec_bits(ftb), i, "ftb={ftb}");
            }
        }
    }

    #[test]
    fn patch_initial_bits() {
        let mut buf = vec![0u8; 16];
        {
            let mut enc = EcEnc::new(&mut buf);
            for _ in 0..4 {
                enc.enc_bit_logp(false, 1);
            }
            enc.enc_bit_logp(false, 2);
            enc.enc_patch_initial_bits(3, 2);
            assert!(!enc.error());
            enc.enc_done();
            assert_eq!(enc.range_bytes(), 1);
        }
        assert_eq!(buf[0], 192);

        {
            let mut enc = EcEnc::new(&mut buf);
            enc.enc_bit_logp(false, 1);
            enc.enc_bit_logp(false, 1);
            enc.enc_bit_logp(true, 6);
            enc.enc_bit_logp(false, 2);
            enc.enc_patch_initial_bits(0, 2);
            assert!(!enc.error());
            enc.enc_done();
            assert_eq!(enc.range_bytes(), 2);
        }
        assert_eq!(buf[0], 63);
    }

    #[test]
    fn patching_more_bits_than_committed_fails() {
        let mut buf = vec![0u8; 16];
        let mut enc = EcEnc::new(&mut buf);
        enc.enc_bit_logp(false, 1);
        enc.enc_patch_initial_bits(0, 5);
        assert!(enc.error());
    }

    #[test]
    fn raw_bits_overfill_is_reported() {
        let mut buf = vec![0u8; 2];
        {
            let mut enc = EcEnc::new(&mut buf);
            enc.enc_bit_logp(false, 2);
            for _ in 0..48 {
                enc.enc_bits(0, 1);
            }
            enc.enc_done();
            assert!(enc.error());
        }
        {
            let mut enc = EcEnc::new(&mut buf);
            for _ in 0..17 {
                enc.enc_bits(0, 1);
            }
            enc.enc_done();
            assert!(enc.error());
        }
    }

    #[test]
    fn total_wider_than_the_range_is_reported() {
        let mut buf = vec![0u8; 8];
        let mut enc = EcEnc::new(&mut buf);
        let before = *enc.ctx();
        enc.encode(0, 1 << 31, 0xF000_0000);
        assert!(enc.error());
        assert_eq!(enc.ctx().rng, before.rng);
        assert_eq!(enc.ctx().val, before.val);

        let mut buf = vec![0u8; 8];
        let mut enc = EcEnc::new(&mut buf);
        enc.encode(3, 3, 10);
        assert!(enc.error());
    }

    #[test]
    fn errored_encoder_ignores_further_writes() {
        let mut buf = vec![0u8; 1];
        let mut enc = EcEnc::new(&mut buf);
        for i in 0..64 {
            enc.enc_uint(i % 7, 7);
        }
        assert!(enc.error());
        let frozen = *enc.ctx();
        enc.enc_uint(1, 7);
        enc.enc_bits(1, 3);
        enc.enc_done();
        assert_eq!(*enc.ctx(), frozen);
    }

    struct Lcg(u32);

    impl Lcg {
        fn next(&mut self) -> u32 {
            self.0 = self.0.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            self.0 >> 1
        }
    }

    #[test]
    fn random_uint_streams_agree_on_tell() {
        let mut buf = vec![0u8; 10_000];
        let mut rng = Lcg(12_345);

        for iteration in 0..500 {
            let ft = (rng.next() >> (31 - rng.next() % 11)) + 10;
            let sz = (rng.next() >> (31 - rng.next() % 9)) as usize;
            let zeros = rng.next() % 13 == 0;
            let data: Vec<u32> = (0..sz)
                .map(|_| if zeros { 0 } else { rng.next() % ft })
                .collect();

            let mut tells = Vec::with_capacity(sz + 1);
            {
                let mut enc = EcEnc::new(&mut buf);
                tells.push(enc.tell_frac());
                for &value in &data {
                    enc.enc_uint(value, ft);
                    tells.push(enc.tell_frac());
                }
                enc.enc_done();
                assert!(!enc.error(), "iteration {iteration}");
            }

            let mut dec = EcDec::new(&buf);
            assert_eq!(dec.tell_frac(), tells[0]);
            for (j, &expected) in data.iter().enumerate() {
                assert_eq!(dec.dec_uint(ft), expected, "iteration {iteration}, symbol {j}");
                assert_eq!(dec.tell_frac(), tells[j + 1], "iteration {iteration}, symbol {j}");
            }
        }
    }
}

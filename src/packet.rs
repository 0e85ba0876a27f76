//! Packet header (`TOC` byte) decoding and frame layout parsing.
//!
//! See [section-3](https://datatracker.ietf.org/doc/html/rfc6716#section-3)

use alloc::vec::Vec;

use log::trace;

use crate::error::PacketError;

/// Largest compressed frame.
pub const MAX_FRAME_BYTES: usize = 1275;

/// Largest number of frames in one packet.
pub const MAX_FRAMES: usize = 48;

/// The remaining two bits of the `TOC` byte, labeled `c`, code the number
/// of frames per packet (codes 0 to 3) as follows
///
/// See [section-3.1](https://datatracker.ietf.org/doc/html/rfc6716#section-3.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameCountCode {
    /// 1 frame in the packet
    Single = 0,
    /// 2 frames in the packet, each with equal compressed size
    DoubleEqual = 1,
    /// 2 frames in the packet, with different compressed sizes
    DoubleDifferent = 2,
    /// an arbitrary number of frames in the packet
    // invariant: max_count = 48
    // see https://datatracker.ietf.org/doc/html/rfc6716#section-3.2.5
    Arbitrary = 3,
}

impl FrameCountCode {
    fn from_toc(toc: u8) -> Self {
        match toc & 0x3 {
            0 => FrameCountCode::Single,
            1 => FrameCountCode::DoubleEqual,
            2 => FrameCountCode::DoubleDifferent,
            _ => FrameCountCode::Arbitrary,
        }
    }
}

/// Coding mode of a packet.
///
/// See [section-3.1](https://datatracker.ietf.org/doc/html/rfc6716#section-3.1)
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Mode {
    /// Speech model only.
    Silk,
    /// Speech model for the low band, transform model above 8 kHz.
    Hybrid,
    /// Transform model only.
    Celt,
}

/// Bandwidth
///
/// See [section-2](https://datatracker.ietf.org/doc/html/rfc6716#section-2)
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
pub enum Bandwidth {
    Narrow,
    Medium,
    Wide,
    SuperWide,
    Full,
}

impl Bandwidth {
    #[inline]
    pub fn audio_band_width(&self) -> u16 {
        match self {
            Bandwidth::Narrow => 4000,
            Bandwidth::Medium => 6000,
            Bandwidth::Wide => 8000,
            Bandwidth::SuperWide => 12000,
            Bandwidth::Full => 20000,
        }
    }

    #[inline]
    pub fn sample_rate(&self) -> u32 {
        match self {
            Bandwidth::Narrow => 8000,
            Bandwidth::Medium => 12000,
            Bandwidth::Wide => 16000,
            Bandwidth::SuperWide => 24000,
            Bandwidth::Full => 48000,
        }
    }

    /// One past the last transform band coded at this bandwidth.
    #[inline]
    pub fn celt_end_band(&self) -> usize {
        match self {
            Bandwidth::Narrow => 13,
            Bandwidth::Medium | Bandwidth::Wide => 17,
            Bandwidth::SuperWide => 19,
            Bandwidth::Full => 21,
        }
    }

    /// Internal rate of the speech model: 8, 12 or 16 kHz.
    #[inline]
    pub fn silk_sample_rate(&self) -> u32 {
        match self {
            Bandwidth::Narrow => 8000,
            Bandwidth::Medium => 12000,
            _ => 16000,
        }
    }
}

/// See [section-2.1.4](https://datatracker.ietf.org/doc/html/rfc6716#section-2.1.4)
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum FrameDuration {
    /// 2.5 ms
    Ms2_5,
    /// 5 ms
    Ms5,
    /// 10 ms
    Ms10,
    /// 20 ms
    Ms20,
    /// 40 ms
    Ms40,
    /// 60 ms
    Ms60,
}

impl FrameDuration {
    /// Samples per channel at `sample_rate`.
    #[must_use]
    pub fn samples(&self, sample_rate: u32) -> usize {
        let fs = sample_rate as usize;
        match self {
            FrameDuration::Ms2_5 => fs / 400,
            FrameDuration::Ms5 => fs / 200,
            FrameDuration::Ms10 => fs / 100,
            FrameDuration::Ms20 => fs / 50,
            FrameDuration::Ms40 => fs / 25,
            FrameDuration::Ms60 => fs * 3 / 50,
        }
    }
}

impl core::fmt::Debug for FrameDuration {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            FrameDuration::Ms2_5 => write!(f, "2.5 ms"),
            FrameDuration::Ms5 => write!(f, "5 ms"),
            FrameDuration::Ms10 => write!(f, "10 ms"),
            FrameDuration::Ms20 => write!(f, "20 ms"),
            FrameDuration::Ms40 => write!(f, "40 ms"),
            FrameDuration::Ms60 => write!(f, "60 ms"),
        }
    }
}

use Bandwidth::{Full, Medium, Narrow, SuperWide, Wide};
use FrameDuration::{Ms2_5, Ms5, Ms10, Ms20, Ms40, Ms60};
use Mode::{Celt, Hybrid, Silk};

/// Mode, bandwidth and frame duration of each of the 32 configurations.
///
/// See [section-3.1](https://datatracker.ietf.org/doc/html/rfc6716#section-3.1)
const CONFIGS: [(Mode, Bandwidth, FrameDuration); 32] = [
    (Silk, Narrow, Ms10),
    (Silk, Narrow, Ms20),
    (Silk, Narrow, Ms40),
    (Silk, Narrow, Ms60),
    (Silk, Medium, Ms10),
    (Silk, Medium, Ms20),
    (Silk, Medium, Ms40),
    (Silk, Medium, Ms60),
    (Silk, Wide, Ms10),
    (Silk, Wide, Ms20),
    (Silk, Wide, Ms40),
    (Silk, Wide, Ms60),
    (Hybrid, SuperWide, Ms10),
    (Hybrid, SuperWide, Ms20),
    (Hybrid, Full, Ms10),
    (Hybrid, Full, Ms20),
    (Celt, Narrow, Ms2_5),
    (Celt, Narrow, Ms5),
    (Celt, Narrow, Ms10),
    (Celt, Narrow, Ms20),
    (Celt, Wide, Ms2_5),
    (Celt, Wide, Ms5),
    (Celt, Wide, Ms10),
    (Celt, Wide, Ms20),
    (Celt, SuperWide, Ms2_5),
    (Celt, SuperWide, Ms5),
    (Celt, SuperWide, Ms10),
    (Celt, SuperWide, Ms20),
    (Celt, Full, Ms2_5),
    (Celt, Full, Ms5),
    (Celt, Full, Ms10),
    (Celt, Full, Ms20),
];

/// Decoded `TOC` byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Toc {
    pub config: u8,
    pub mode: Mode,
    pub bandwidth: Bandwidth,
    pub frame_duration: FrameDuration,
    pub stereo: bool,
    pub frame_count_code: FrameCountCode,
}

impl Toc {
    #[must_use]
    pub fn from_byte(toc: u8) -> Self {
        let config = toc >> 3;
        let (mode, bandwidth, frame_duration) = CONFIGS[config as usize];
        Self {
            config,
            mode,
            bandwidth,
            frame_duration,
            stereo: toc & 0x4 != 0,
            frame_count_code: FrameCountCode::from_toc(toc),
        }
    }
}

/// Bandwidth signalled by a `TOC` byte.
#[must_use]
pub fn packet_get_bandwidth(toc: u8) -> Bandwidth {
    Toc::from_byte(toc).bandwidth
}

/// Channel count signalled by a `TOC` byte.
#[must_use]
pub fn packet_get_nb_channels(toc: u8) -> usize {
    if toc & 0x4 != 0 { 2 } else { 1 }
}

/// Samples per frame at `sample_rate`.
#[must_use]
pub fn packet_get_samples_per_frame(toc: u8, sample_rate: u32) -> usize {
    Toc::from_byte(toc).frame_duration.samples(sample_rate)
}

/// Number of frames in `packet`.
///
/// # Errors
///
/// [`PacketError::InvalidPacket`] for an empty packet or a code 3 packet
/// without its frame count byte.
pub fn packet_get_nb_frames(packet: &[u8]) -> Result<usize, PacketError> {
    let toc = *packet.first().ok_or(PacketError::InvalidPacket)?;
    match FrameCountCode::from_toc(toc) {
        FrameCountCode::Single => Ok(1),
        FrameCountCode::DoubleEqual | FrameCountCode::DoubleDifferent => Ok(2),
        FrameCountCode::Arbitrary => packet
            .get(1)
            .map(|&count| usize::from(count & 0x3f))
            .ok_or(PacketError::InvalidPacket),
    }
}

/// Total samples per channel in `packet` at `sample_rate`.
///
/// # Errors
///
/// [`PacketError::InvalidPacket`] when the frame count cannot be read or the
/// packet would last longer than 120 ms.
pub fn packet_get_nb_samples(packet: &[u8], sample_rate: u32) -> Result<usize, PacketError> {
    let count = packet_get_nb_frames(packet)?;
    let samples = count * packet_get_samples_per_frame(packet[0], sample_rate);
    if samples * 25 > sample_rate as usize * 3 {
        return Err(PacketError::InvalidPacket);
    }
    Ok(samples)
}

/// Everything the decoder needs to know about a packet before decoding it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedPacket<'a> {
    pub toc: Toc,
    pub mode: Mode,
    pub bandwidth: Bandwidth,
    /// Samples per channel of each frame at the decoder's rate.
    pub frame_size: usize,
    pub channels: usize,
    /// Compressed frames in packet order.
    pub frames: Vec<&'a [u8]>,
    /// Bytes of trailing padding.
    pub padding: usize,
}

/// Turns packet bytes into a [`ParsedPacket`].
pub trait HeaderParser {
    /// Parses `packet` for a decoder running at `sample_rate`.
    ///
    /// # Errors
    ///
    /// [`PacketError::InvalidPacket`] when the frame layout is inconsistent.
    fn parse<'a>(&self, packet: &'a [u8], sample_rate: u32) -> Result<ParsedPacket<'a>, PacketError>;
}

/// Parser for the standard `TOC` byte framing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TocParser;

impl HeaderParser for TocParser {
    fn parse<'a>(&self, packet: &'a [u8], sample_rate: u32) -> Result<ParsedPacket<'a>, PacketError> {
        parse_packet(packet, sample_rate)
    }
}

/// Reads a one or two byte frame length.
///
/// Returns the length and the number of bytes it occupied.
fn parse_size(data: &[u8]) -> Result<(usize, usize), PacketError> {
    match data {
        [] => Err(PacketError::InvalidPacket),
        [first, ..] if *first < 252 => Ok((usize::from(*first), 1)),
        [_] => Err(PacketError::InvalidPacket),
        [first, second, ..] => Ok((4 * usize::from(*second) + usize::from(*first), 2)),
    }
}

/// Splits `packet` into its frames.
///
/// # Errors
///
/// [`PacketError::InvalidPacket`] for empty packets, lengths that do not add
/// up, frames over 1275 bytes and packets longer than 120 ms.
pub fn parse_packet(packet: &[u8], sample_rate: u32) -> Result<ParsedPacket<'_>, PacketError> {
    let (&toc_byte, mut data) = packet.split_first().ok_or(PacketError::InvalidPacket)?;
    let toc = Toc::from_byte(toc_byte);
    let frame_size_48k = toc.frame_duration.samples(48_000);

    let mut sizes: Vec<usize> = Vec::with_capacity(2);
    let mut padding = 0usize;
    let last_size;

    match toc.frame_count_code {
        FrameCountCode::Single => last_size = data.len(),
        FrameCountCode::DoubleEqual => {
            if data.len() % 2 != 0 {
                return Err(PacketError::InvalidPacket);
            }
            last_size = data.len() / 2;
            sizes.push(last_size);
        }
        FrameCountCode::DoubleDifferent => {
            let (size, bytes) = parse_size(data)?;
            data = &data[bytes..];
            if size > data.len() {
                return Err(PacketError::InvalidPacket);
            }
            sizes.push(size);
            last_size = data.len() - size;
        }
        FrameCountCode::Arbitrary => {
            let (&ch, rest) = data.split_first().ok_or(PacketError::InvalidPacket)?;
            data = rest;
            let count = usize::from(ch & 0x3f);
            if count == 0 || frame_size_48k * count > 5760 {
                return Err(PacketError::InvalidPacket);
            }

            if ch & 0x40 != 0 {
                loop {
                    let (&p, rest) = data.split_first().ok_or(PacketError::InvalidPacket)?;
                    data = rest;
                    let bytes = if p == 255 { 254 } else { usize::from(p) };
                    padding += bytes;
                    if p < 255 {
                        break;
                    }
                }
                if padding > data.len() {
                    return Err(PacketError::InvalidPacket);
                }
                data = &data[..data.len() - padding];
            }

            if ch & 0x80 != 0 {
                let mut remaining = data.len();
                for _ in 0..count - 1 {
                    let (size, bytes) = parse_size(data)?;
                    data = &data[bytes..];
                    if size > data.len() {
                        return Err(PacketError::InvalidPacket);
                    }
                    remaining = remaining
                        .checked_sub(bytes + size)
                        .ok_or(PacketError::InvalidPacket)?;
                    sizes.push(size);
                }
                last_size = remaining;
            } else {
                last_size = data.len() / count;
                if last_size * count != data.len() {
                    return Err(PacketError::InvalidPacket);
                }
                sizes.resize(count - 1, last_size);
            }
        }
    }

    if last_size > MAX_FRAME_BYTES || sizes.iter().any(|&s| s > MAX_FRAME_BYTES) {
        return Err(PacketError::InvalidPacket);
    }
    sizes.push(last_size);

    let mut frames = Vec::with_capacity(sizes.len());
    for size in sizes {
        let (frame, rest) = data.split_at_checked(size).ok_or(PacketError::InvalidPacket)?;
        frames.push(frame);
        data = rest;
    }

    trace!(
        "parsed {:?} packet: {} frame(s) of {:?}, {} bytes padding",
        toc.mode,
        frames.len(),
        toc.frame_duration,
        padding
    );

    Ok(ParsedPacket {
        toc,
        mode: toc.mode,
        bandwidth: toc.bandwidth,
        frame_size: toc.frame_duration.samples(sample_rate),
        channels: if toc.stereo { 2 } else { 1 },
        frames,
        padding,
    })
}

#[cfg(test)]
mod tests {
    use alloc::vec;
    use alloc::vec::Vec;

    use pretty_assertions::assert_eq;

    use super::{
        Bandwidth, FrameCountCode, FrameDuration, Mode, Toc, packet_get_bandwidth,
        packet_get_nb_channels, packet_get_nb_frames, packet_get_nb_samples,
        packet_get_samples_per_frame, parse_packet,
    };
    use crate::error::PacketError;

    #[test]
    fn toc_table_matches_configuration_ranges() {
        let silk = Toc::from_byte(9 << 3);
        assert_eq!(silk.mode, Mode::Silk);
        assert_eq!(silk.bandwidth, Bandwidth::Wide);
        assert_eq!(silk.frame_duration, FrameDuration::Ms20);

        let hybrid = Toc::from_byte((14 << 3) | 0x4 | 0x3);
        assert_eq!(hybrid.mode, Mode::Hybrid);
        assert_eq!(hybrid.bandwidth, Bandwidth::Full);
        assert!(hybrid.stereo);
        assert_eq!(hybrid.frame_count_code, FrameCountCode::Arbitrary);

        let celt = Toc::from_byte(16 << 3);
        assert_eq!(celt.mode, Mode::Celt);
        assert_eq!(celt.bandwidth, Bandwidth::Narrow);
        assert_eq!(celt.frame_duration, FrameDuration::Ms2_5);
    }

    #[test]
    fn helpers_read_toc_fields() {
        assert_eq!(packet_get_bandwidth(31 << 3), Bandwidth::Full);
        assert_eq!(packet_get_nb_channels(0x4), 2);
        assert_eq!(packet_get_nb_channels(0x0), 1);
        assert_eq!(packet_get_samples_per_frame(31 << 3, 48_000), 960);
        assert_eq!(packet_get_samples_per_frame(3 << 3, 16_000), 960);
        assert_eq!(packet_get_samples_per_frame(16 << 3, 8_000), 20);
    }

    #[test]
    fn frame_and_sample_counts() {
        assert_eq!(packet_get_nb_frames(&[0x00]), Ok(1));
        assert_eq!(packet_get_nb_frames(&[0x01]), Ok(2));
        assert_eq!(packet_get_nb_frames(&[0x03, 0x05]), Ok(5));
        assert_eq!(packet_get_nb_frames(&[0x03]), Err(PacketError::InvalidPacket));
        assert_eq!(packet_get_nb_frames(&[]), Err(PacketError::InvalidPacket));

        // 6 x 20 ms is the longest packet allowed.
        assert_eq!(packet_get_nb_samples(&[(31 << 3) | 3, 6], 48_000), Ok(5760));
        assert_eq!(
            packet_get_nb_samples(&[(31 << 3) | 3, 7], 48_000),
            Err(PacketError::InvalidPacket)
        );
    }

    #[test]
    fn parses_single_and_cbr_frames() {
        let packet = [31 << 3, 1, 2, 3];
        let parsed = parse_packet(&packet, 48_000).unwrap();
        assert_eq!(parsed.frames, vec![&packet[1..]]);
        assert_eq!(parsed.frame_size, 960);
        assert_eq!(parsed.channels, 1);

        let packet = [(31 << 3) | 1, 1, 2, 3, 4];
        let parsed = parse_packet(&packet, 48_000).unwrap();
        assert_eq!(parsed.frames, vec![&packet[1..3], &packet[3..5]]);

        assert_eq!(
            parse_packet(&[(31 << 3) | 1, 1, 2, 3], 48_000),
            Err(PacketError::InvalidPacket)
        );
    }

    #[test]
    fn parses_vbr_pair_with_two_byte_length() {
        // First frame length 252 + 4 * 1 = 256.
        let mut packet = vec![(31 << 3) | 2, 252, 1];
        packet.extend((0..256).map(|i| i as u8));
        packet.extend([9, 9, 9]);
        let parsed = parse_packet(&packet, 48_000).unwrap();
        assert_eq!(parsed.frames.len(), 2);
        assert_eq!(parsed.frames[0].len(), 256);
        assert_eq!(parsed.frames[1], &[9, 9, 9]);
    }

    #[test]
    fn parses_code3_with_padding() {
        // Three CBR frames of two bytes, 256 bytes of padding (255 -> 254, then 2).
        let mut packet = vec![(31 << 3) | 3, 0x40 | 3, 255, 2];
        packet.extend([1, 1, 2, 2, 3, 3]);
        packet.extend(core::iter::repeat_n(0u8, 256));
        let parsed = parse_packet(&packet, 48_000).unwrap();
        assert_eq!(parsed.padding, 256);
        let frames: Vec<&[u8]> = vec![&[1, 1], &[2, 2], &[3, 3]];
        assert_eq!(parsed.frames, frames);
    }

    #[test]
    fn parses_code3_vbr() {
        let packet = [(31 << 3) | 3, 0x80 | 3, 1, 2, 7, 8, 8, 9, 9, 9];
        let parsed = parse_packet(&packet, 48_000).unwrap();
        let frames: Vec<&[u8]> = vec![&[7], &[8, 8], &[9, 9, 9]];
        assert_eq!(parsed.frames, frames);
    }

    #[test]
    fn rejects_malformed_layouts() {
        assert_eq!(parse_packet(&[], 48_000), Err(PacketError::InvalidPacket));
        // Zero frames.
        assert_eq!(
            parse_packet(&[(31 << 3) | 3, 0], 48_000),
            Err(PacketError::InvalidPacket)
        );
        // VBR length longer than the packet.
        assert_eq!(
            parse_packet(&[(31 << 3) | 2, 10, 1, 2], 48_000),
            Err(PacketError::InvalidPacket)
        );
        // Padding longer than the packet.
        assert_eq!(
            parse_packet(&[(31 << 3) | 3, 0x40 | 1, 20, 1], 48_000),
            Err(PacketError::InvalidPacket)
        );
        // A single implicit frame over 1275 bytes.
        let mut big = vec![31 << 3];
        big.extend(core::iter::repeat_n(0u8, 1276));
        assert_eq!(parse_packet(&big, 48_000), Err(PacketError::InvalidPacket));
    }
}

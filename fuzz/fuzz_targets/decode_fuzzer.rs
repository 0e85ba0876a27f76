#![no_main]

use libfuzzer_sys::fuzz_target;
use opus_core::celt::EBAND_5MS;
use opus_core::packet::{packet_get_bandwidth, packet_get_nb_channels};
use opus_core::{
    BandDecoder, BandFrame, CeltDecoder, CollaboratorError, DecControl, DecodeFlag, DecoderConfig,
    EcDec, OpusDecoder, SpeechModelDecoder,
};

const MAX_FRAME_SAMP: usize = 5760;
const MAX_PACKET: usize = 1500;
const SETUP_BYTE_COUNT: usize = 8;
const MAX_DECODES: usize = 12;

/// Reads one uniform value per band and turns it into a pulse position.
#[derive(Clone, Debug)]
struct UniformBands;

impl BandDecoder for UniformBands {
    fn decode_bands(
        &mut self,
        dec: &mut EcDec<'_>,
        frame: &BandFrame,
        x: &mut [f32],
        band_log_e: &mut [f32],
    ) -> Result<(), CollaboratorError> {
        let n = x.len() / frame.channels;
        let m = 1 << frame.lm;
        x.fill(0.0);
        for ch in 0..frame.channels {
            for band in frame.start..frame.end {
                let lo = m * EBAND_5MS[band] as usize;
                let hi = m * EBAND_5MS[band + 1] as usize;
                let pos = if frame.silence { 0 } else { dec.dec_uint((hi - lo) as u32 + 1) as usize };
                if pos > 0 {
                    x[ch * n + lo + pos - 1] = 1.0;
                }
                band_log_e[ch * 21 + band] = dec.dec_bits(3) as f32;
            }
        }
        Ok(())
    }
}

/// Emits raw bits from the stream as samples.
#[derive(Clone, Debug, Default)]
struct RawSpeech {
    last: i16,
}

impl SpeechModelDecoder for RawSpeech {
    fn decode(
        &mut self,
        mut dec: Option<&mut EcDec<'_>>,
        control: &DecControl,
        flag: DecodeFlag,
        _first_frame: bool,
        pcm: &mut [i16],
    ) -> Result<usize, CollaboratorError> {
        let n = control.api_sample_rate as usize / 1000 * control.payload_size_ms.min(20);
        let out = pcm
            .get_mut(..n * control.n_channels_api)
            .ok_or(CollaboratorError::BufferTooSmall)?;
        for sample in out {
            *sample = match (&mut dec, flag) {
                (Some(dec), DecodeFlag::Normal | DecodeFlag::Lbrr) => dec.dec_bits(16) as u16 as i16,
                _ => self.last / 2,
            };
            self.last = *sample;
        }
        if dec.is_some_and(|dec| dec.error()) {
            return Err(CollaboratorError::Corrupt);
        }
        Ok(n)
    }

    fn reset(&mut self) {
        self.last = 0;
    }

    fn pitch_lag(&self) -> usize {
        0
    }
}

fn read_be_u32(bytes: &[u8]) -> Option<u32> {
    let chunk = bytes.get(..4)?;
    Some(u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
}

fuzz_target!(|data: &[u8]| {
    if data.len() < SETUP_BYTE_COUNT + 1 {
        return;
    }

    let toc = data[SETUP_BYTE_COUNT];
    let channels = packet_get_nb_channels(toc);
    let config = DecoderConfig {
        sample_rate: packet_get_bandwidth(toc).sample_rate(),
        channels,
        ..DecoderConfig::default()
    };
    let Ok(transform) = CeltDecoder::new(config.sample_rate, channels, UniformBands) else {
        return;
    };
    let Ok(mut decoder) = OpusDecoder::new(config, RawSpeech::default(), transform) else {
        return;
    };

    let mut pcm = [0i16; MAX_FRAME_SAMP * 2];
    let pcm = &mut pcm[..MAX_FRAME_SAMP * channels];

    let mut i = 0usize;
    let mut num_decodes = 0usize;
    while i + SETUP_BYTE_COUNT < data.len() && num_decodes < MAX_DECODES {
        num_decodes += 1;

        let Some(len) = read_be_u32(&data[i..]) else {
            break;
        };
        let len = len as usize;
        let packet_offset = i + SETUP_BYTE_COUNT;
        let Some(end) = packet_offset.checked_add(len) else {
            break;
        };
        if len > MAX_PACKET || end > data.len() {
            break;
        }

        let fec = data[i + 4] & 1 != 0;
        if len == 0 {
            let frame_size = decoder.last_packet_duration();
            let _ = decoder.decode(None, pcm, frame_size, fec);
        } else {
            let _ = decoder.decode(Some(&data[packet_offset..end]), pcm, MAX_FRAME_SAMP, fec);
        }

        i = end;
    }
});

mod dec_api;

pub use dec_api::{DecControl, DecodeFlag, SpeechModelDecoder};

//! Transform-coded layer: the range coder shared by every layer of the format,
//! the synthesis path and packet-loss concealment.

mod bands;
mod celt;
mod celt_decoder;
mod entcode;
mod entdec;
mod entenc;
mod lpc;
mod math;
mod mdct;
mod modes;
mod pitch;

pub use celt_decoder::{BandDecoder, BandFrame, CeltDecoder, TransformFrame, TransformModelDecoder};
pub use entcode::{BITRES, EcCtx, ec_ilog};
pub use entdec::EcDec;
pub use entenc::EcEnc;
pub use modes::{EBAND_5MS, HYBRID_START_BAND, NB_EBANDS};
pub(crate) use modes::STANDARD_MODE;

//! Signalling and audio formats spoken on an analog line

pub mod dtmf;
pub mod input;
pub mod tones;

pub use dtmf::{Digit, DtmfPacer, DtmfSignal};
pub use input::{InputEvent, Key};
pub use tones::{ToneId, ToneState};

//! Linux input event records used for hook, keypad and ringer signalling

use std::mem::size_of;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::protocols::dtmf::Digit;
use crate::{Error, Result};

pub const EV_KEY: u16 = 0x01;
pub const EV_SND: u16 = 0x12;
pub const SND_BELL: u16 = 0x01;

pub const KEY_ESC: u16 = 1;
pub const KEY_ENTER: u16 = 28;
pub const KEY_A: u16 = 30;
pub const KEY_D: u16 = 32;
pub const KEY_C: u16 = 46;
pub const KEY_B: u16 = 48;
pub const KEY_MUTE: u16 = 113;
pub const KEY_NUMERIC_0: u16 = 0x200;
pub const KEY_NUMERIC_STAR: u16 = 0x20a;
pub const KEY_NUMERIC_POUND: u16 = 0x20b;

/// `struct input_event`: a `timeval` (two C longs) then type, code and value
pub const EVENT_SIZE: usize = 2 * size_of::<usize>() + 8;

/// One (type, code, value) record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputEvent {
    pub kind: u16,
    pub code: u16,
    pub value: i32,
}

impl InputEvent {
    pub fn key(code: u16, pressed: bool) -> Self {
        Self {
            kind: EV_KEY,
            code,
            value: i32::from(pressed),
        }
    }

    pub fn bell(on: bool) -> Self {
        Self {
            kind: EV_SND,
            code: SND_BELL,
            value: i32::from(on),
        }
    }

    /// A key press (not a release or auto-repeat of nothing)
    pub fn is_key_press(&self) -> bool {
        self.kind == EV_KEY && self.value != 0
    }

    /// Encode with a zero timestamp, which the kernel fills in on write
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(EVENT_SIZE);
        buf.put_bytes(0, 2 * size_of::<usize>());
        buf.put_u16_ne(self.kind);
        buf.put_u16_ne(self.code);
        buf.put_i32_ne(self.value);
        buf.freeze()
    }

    /// Decode one record, consuming [`EVENT_SIZE`] bytes
    pub fn decode<B: Buf>(data: &mut B) -> Result<Self> {
        if data.remaining() < EVENT_SIZE {
            return Err(Error::input("Input event record too short"));
        }
        data.advance(2 * size_of::<usize>());
        let kind = data.get_u16_ne();
        let code = data.get_u16_ne();
        let value = data.get_i32_ne();
        Ok(Self { kind, code, value })
    }
}

/// Keys the line controller reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Key {
    HookOff,
    HookOn,
    Mute,
    Digit(Digit),
}

impl Key {
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            KEY_ENTER => Some(Self::HookOff),
            KEY_ESC => Some(Self::HookOn),
            KEY_MUTE => Some(Self::Mute),
            KEY_NUMERIC_STAR => Some(Self::Digit(Digit::Star)),
            KEY_NUMERIC_POUND => Some(Self::Digit(Digit::Pound)),
            KEY_A => Some(Self::Digit(Digit::A)),
            KEY_B => Some(Self::Digit(Digit::B)),
            KEY_C => Some(Self::Digit(Digit::C)),
            KEY_D => Some(Self::Digit(Digit::D)),
            code if (KEY_NUMERIC_0..KEY_NUMERIC_0 + 10).contains(&code) => {
                let offset = (code - KEY_NUMERIC_0) as u8;
                Digit::from_char(char::from(b'0' + offset)).map(Self::Digit)
            }
            _ => None,
        }
    }

    pub fn code(self) -> u16 {
        match self {
            Self::HookOff => KEY_ENTER,
            Self::HookOn => KEY_ESC,
            Self::Mute => KEY_MUTE,
            Self::Digit(Digit::Star) => KEY_NUMERIC_STAR,
            Self::Digit(Digit::Pound) => KEY_NUMERIC_POUND,
            Self::Digit(Digit::A) => KEY_A,
            Self::Digit(Digit::B) => KEY_B,
            Self::Digit(Digit::C) => KEY_C,
            Self::Digit(Digit::D) => KEY_D,
            Self::Digit(digit) => {
                let offset = digit.to_char() as u16 - u16::from(b'0');
                KEY_NUMERIC_0 + offset
            }
        }
    }

    pub fn press(self) -> InputEvent {
        InputEvent::key(self.code(), true)
    }

    pub fn release(self) -> InputEvent {
        InputEvent::key(self.code(), false)
    }
}

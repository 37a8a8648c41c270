//! Call progress and DTMF tone synthesis
//!
//! Every tone is a list of items. An item drives two digital resonators
//! (`v[n] = (fac * v[n-1] >> 15) - v[n-2]`) whose outputs are either summed or
//! used as carrier and modulator. Items with a duration advance to the next
//! item when exhausted, and the list either stops or wraps to its repeat
//! position.

use std::collections::HashMap;
use std::fmt;
use std::f64::consts::PI;

use once_cell::sync::Lazy;

use crate::protocols::dtmf::Digit;

pub const SAMPLE_RATE: u32 = 8000;
pub const SAMPLES_PER_MS: usize = (SAMPLE_RATE / 1000) as usize;
/// Bytes per mono signed 16-bit sample
pub const SAMPLE_SIZE: usize = 2;

/// Nominal catalog gain, about -8 dBm0
pub const TONE_GAIN: i32 = 7219;

const FULL_SCALE: f64 = 32768.0;

/// Equal temperament MIDI note frequencies, rounded to Hz
const MIDI_TO_HZ: [u32; 128] = [
    8, 8, 9, 9, 10, 10, 11, 12, 12, 13,
    14, 15, 16, 17, 18, 19, 20, 21, 23, 24,
    25, 27, 29, 30, 32, 34, 36, 38, 41, 43,
    46, 48, 51, 55, 58, 61, 65, 69, 73, 77,
    82, 87, 92, 97, 103, 110, 116, 123, 130, 138,
    146, 155, 164, 174, 184, 195, 207, 220, 233, 246,
    261, 277, 293, 311, 329, 349, 369, 391, 415, 440,
    466, 493, 523, 554, 587, 622, 659, 698, 739, 783,
    830, 880, 932, 987, 1046, 1108, 1174, 1244, 1318, 1396,
    1479, 1567, 1661, 1760, 1864, 1975, 2093, 2217, 2349, 2489,
    2637, 2793, 2959, 3135, 3322, 3520, 3729, 3951, 4186, 4434,
    4698, 4978, 5274, 5587, 5919, 6271, 6644, 7040, 7458, 7902,
    8372, 8869, 9397, 9956, 10548, 11175, 11839, 12543,
];

/// Tones a line can play towards its handset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToneId {
    /// Waiting for the user to dial
    Dial,
    /// The remote party hung up or is busy
    Busy,
    /// Nothing can be reached with what was dialed
    Invalid,
    Dtmf(Digit),
}

impl ToneId {
    pub fn all() -> impl Iterator<Item = ToneId> {
        [ToneId::Dial, ToneId::Busy, ToneId::Invalid]
            .into_iter()
            .chain(Digit::ALL.into_iter().map(ToneId::Dtmf))
    }
}

impl fmt::Display for ToneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToneId::Dial => write!(f, "dial"),
            ToneId::Busy => write!(f, "busy"),
            ToneId::Invalid => write!(f, "invalid"),
            ToneId::Dtmf(digit) => write!(f, "dtmf {}", digit),
        }
    }
}

/// Human-level description of one tone segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TonePart {
    pub freq1: u32,
    pub freq2: u32,
    /// Segment length in milliseconds, 0 plays forever
    pub duration_ms: u32,
    /// `freq2` amplitude-modulates `freq1` instead of being added to it
    pub modulate: bool,
    /// Frequencies are MIDI note numbers
    pub midinote: bool,
}

impl TonePart {
    pub const fn pair(freq1: u32, freq2: u32, duration_ms: u32) -> Self {
        Self {
            freq1,
            freq2,
            duration_ms,
            modulate: false,
            midinote: false,
        }
    }

    pub const fn silence(duration_ms: u32) -> Self {
        Self::pair(0, 0, duration_ms)
    }
}

/// Precomputed resonator coefficients and seeds for one segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToneItem {
    fac1: i32,
    init_v2_1: i32,
    init_v3_1: i32,
    fac2: i32,
    init_v2_2: i32,
    init_v3_2: i32,
    modulate: bool,
    duration_ms: u32,
}

impl ToneItem {
    fn from_part(part: &TonePart, gain: i32) -> Self {
        let (freq1, freq2) = if part.midinote {
            (midi_to_hz(part.freq1), midi_to_hz(part.freq2))
        } else {
            (f64::from(part.freq1), f64::from(part.freq2))
        };
        let (fac1, init_v2_1, init_v3_1) = resonator(freq1, gain);
        let (fac2, init_v2_2, init_v3_2) = resonator(freq2, gain);

        Self {
            fac1,
            init_v2_1,
            init_v3_1,
            fac2,
            init_v2_2,
            init_v3_2,
            modulate: part.modulate,
            duration_ms: part.duration_ms,
        }
    }

    fn duration_in_samples(&self) -> usize {
        self.duration_ms as usize * SAMPLES_PER_MS
    }
}

fn midi_to_hz(note: u32) -> f64 {
    MIDI_TO_HZ.get(note as usize).map(|&hz| f64::from(hz)).unwrap_or(0.0)
}

fn resonator(freq: f64, gain: i32) -> (i32, i32, i32) {
    let omega = freq / f64::from(SAMPLE_RATE);
    let fac = 2.0 * (2.0 * PI * omega).cos() * FULL_SCALE;
    let v2 = (-4.0 * PI * omega).sin() * f64::from(gain);
    let v3 = (-2.0 * PI * omega).sin() * f64::from(gain);
    (fac as i32, v2 as i32, v3 as i32)
}

/// An immutable catalog entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToneDefinition {
    items: Vec<ToneItem>,
    repeat_from: Option<usize>,
}

impl ToneDefinition {
    pub fn from_parts(parts: &[TonePart], repeat_from: Option<usize>, gain: i32) -> Self {
        Self {
            items: parts.iter().map(|part| ToneItem::from_part(part, gain)).collect(),
            repeat_from: repeat_from.filter(|&pos| pos < parts.len()),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn repeat_from(&self) -> Option<usize> {
        self.repeat_from
    }
}

static CATALOG: Lazy<HashMap<ToneId, ToneDefinition>> = Lazy::new(|| {
    let mut catalog = HashMap::new();
    catalog.insert(
        ToneId::Dial,
        ToneDefinition::from_parts(&[TonePart::pair(350, 440, 0)], Some(0), TONE_GAIN),
    );
    catalog.insert(
        ToneId::Busy,
        ToneDefinition::from_parts(
            &[TonePart::pair(480, 620, 500), TonePart::silence(500)],
            Some(0),
            TONE_GAIN,
        ),
    );
    catalog.insert(
        ToneId::Invalid,
        ToneDefinition::from_parts(
            &[TonePart::pair(480, 620, 250), TonePart::silence(200)],
            Some(0),
            TONE_GAIN,
        ),
    );
    for digit in Digit::ALL {
        let (high, low) = digit.frequencies();
        catalog.insert(
            ToneId::Dtmf(digit),
            ToneDefinition::from_parts(&[TonePart::pair(high, low, 0)], Some(0), TONE_GAIN),
        );
    }
    catalog
});

/// Catalog entry for a tone. Every [`ToneId`] has one.
pub fn definition(id: ToneId) -> &'static ToneDefinition {
    &CATALOG[&id]
}

/// Number of bytes covering `duration_ms` of audio
pub fn duration_in_bytes(duration_ms: u32) -> usize {
    duration_ms as usize * SAMPLES_PER_MS * SAMPLE_SIZE
}

/// Per-line generator registers for the tone being played
#[derive(Debug, Clone)]
pub struct ToneState {
    definition: ToneDefinition,
    v1_1: i32,
    v2_1: i32,
    v3_1: i32,
    v1_2: i32,
    v2_2: i32,
    v3_2: i32,
    npos: usize,
    loaded: Option<usize>,
    pos: usize,
}

impl ToneState {
    pub fn new(definition: &ToneDefinition) -> Self {
        Self {
            definition: definition.clone(),
            v1_1: 0,
            v2_1: 0,
            v3_1: 0,
            v1_2: 0,
            v2_2: 0,
            v3_2: 0,
            npos: 0,
            loaded: None,
            pos: 0,
        }
    }

    pub fn for_tone(id: ToneId) -> Self {
        Self::new(definition(id))
    }

    /// True once a non-repeating definition has played all of its items
    pub fn is_exhausted(&self) -> bool {
        self.npos >= self.definition.items.len()
    }

    /// Fill `out` with native-endian samples.
    ///
    /// The whole buffer is zeroed first, so anything past the returned byte
    /// count is silence. A trailing odd byte is never written.
    pub fn generate(&mut self, out: &mut [u8]) -> usize {
        out.fill(0);
        let mut produced = 0;
        let mut remaining = out.len() / SAMPLE_SIZE;

        while remaining > 0 && !self.is_exhausted() {
            let item = self.definition.items[self.npos];
            if self.loaded != Some(self.npos) {
                self.v1_1 = 0;
                self.v2_1 = item.init_v2_1;
                self.v3_1 = item.init_v3_1;
                self.v1_2 = 0;
                self.v2_2 = item.init_v2_2;
                self.v3_2 = item.init_v3_2;
                self.pos = 0;
                self.loaded = Some(self.npos);
            }

            let mut count = remaining;
            let limit = item.duration_in_samples();
            if limit > 0 && self.pos + count > limit {
                count = limit - self.pos;
            }

            for _ in 0..count {
                let sample = self.next_sample(&item);
                let offset = produced * SAMPLE_SIZE;
                out[offset..offset + SAMPLE_SIZE].copy_from_slice(&sample.to_ne_bytes());
                produced += 1;
            }

            self.pos += count;
            remaining -= count;

            if limit > 0 && self.pos >= limit {
                self.npos += 1;
                self.pos = 0;
                if self.npos >= self.definition.items.len() {
                    if let Some(repeat) = self.definition.repeat_from {
                        self.npos = repeat;
                    }
                }
            }
        }

        produced * SAMPLE_SIZE
    }

    fn next_sample(&mut self, item: &ToneItem) -> i16 {
        self.v1_1 = self.v2_1;
        self.v2_1 = self.v3_1;
        self.v3_1 = ((item.fac1 * self.v2_1) >> 15) - self.v1_1;

        self.v1_2 = self.v2_2;
        self.v2_2 = self.v3_2;
        self.v3_2 = ((item.fac2 * self.v2_2) >> 15) - self.v1_2;

        if item.modulate {
            let p = (self.v3_2 - 32768).abs() * 9 / 10 + 1;
            ((self.v3_1 * p) >> 15) as i16
        } else {
            (self.v3_1 + self.v3_2) as i16
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn samples(bytes: &[u8]) -> Vec<i16> {
        bytes
            .chunks_exact(SAMPLE_SIZE)
            .map(|pair| i16::from_ne_bytes([pair[0], pair[1]]))
            .collect()
    }

    #[test]
    fn test_catalog_covers_every_tone() {
        for id in ToneId::all() {
            assert!(!definition(id).is_empty(), "{:?} has no items", id);
        }
        assert_eq!(definition(ToneId::Busy).len(), 2);
        assert_eq!(definition(ToneId::Invalid).repeat_from(), Some(0));
    }

    #[test]
    fn test_dial_tone_starts_as_sine_and_stays_bounded() {
        let mut state = ToneState::for_tone(ToneId::Dial);
        let mut buf = vec![0u8; 1600];
        assert_eq!(state.generate(&mut buf), 1600);

        let pcm = samples(&buf);
        // Seeded on sin(-w), sin(-2w): the first output is sin(0) for both resonators
        assert!(pcm[0].abs() <= 4);
        assert!(pcm.iter().any(|&s| s > 10_000));
        assert!(pcm.iter().all(|&s| (s as i32).abs() <= 2 * TONE_GAIN + 200));
    }

    #[test]
    fn test_busy_cadence_silence_and_wrap() {
        let mut state = ToneState::for_tone(ToneId::Busy);
        // One full cadence is 1000ms, generate two
        let mut buf = vec![0u8; duration_in_bytes(2000)];
        assert_eq!(state.generate(&mut buf), buf.len());
        let pcm = samples(&buf);

        let on = 500 * SAMPLES_PER_MS;
        let cycle = 1000 * SAMPLES_PER_MS;
        assert!(pcm[..on].iter().any(|&s| s != 0));
        assert!(pcm[on..cycle].iter().all(|&s| s == 0));
        // Wrapping to the first item reloads its seeds, so the second cycle is identical
        assert_eq!(pcm[..cycle], pcm[cycle..]);
    }

    #[test]
    fn test_chunked_generation_matches_single_pass() {
        let mut whole = ToneState::for_tone(ToneId::Invalid);
        let mut expected = vec![0u8; duration_in_bytes(900)];
        whole.generate(&mut expected);

        let mut chunked = ToneState::for_tone(ToneId::Invalid);
        let mut actual = Vec::new();
        let mut chunk = [0u8; 334];
        while actual.len() < expected.len() {
            let n = chunked.generate(&mut chunk);
            assert_eq!(n, 334 - (334 % SAMPLE_SIZE));
            actual.extend_from_slice(&chunk[..n]);
        }
        actual.truncate(expected.len());
        assert_eq!(actual, expected);
    }

    #[test]
    fn test_non_repeating_tone_ends_in_silence() {
        let definition = ToneDefinition::from_parts(&[TonePart::pair(1000, 0, 10)], None, TONE_GAIN);
        let mut state = ToneState::new(&definition);

        let mut buf = vec![0u8; duration_in_bytes(25)];
        assert_eq!(state.generate(&mut buf), duration_in_bytes(10));
        assert!(state.is_exhausted());
        assert!(buf[duration_in_bytes(10)..].iter().all(|&b| b == 0));

        let mut more = vec![0xAAu8; 64];
        assert_eq!(state.generate(&mut more), 0);
        assert!(more.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_single_item_repeat_keeps_phase() {
        // A timed segment that repeats onto itself must match an endless one sample for sample
        let timed = ToneDefinition::from_parts(&[TonePart::pair(440, 0, 30)], Some(0), TONE_GAIN);
        let endless = ToneDefinition::from_parts(&[TonePart::pair(440, 0, 0)], Some(0), TONE_GAIN);

        let mut a = vec![0u8; duration_in_bytes(100)];
        let mut b = vec![0u8; duration_in_bytes(100)];
        ToneState::new(&timed).generate(&mut a);
        ToneState::new(&endless).generate(&mut b);
        assert_eq!(a, b);
    }

    #[test]
    fn test_modulated_and_midi_parts() {
        let part = TonePart {
            freq1: 69, // A4
            freq2: 5,
            duration_ms: 0,
            modulate: true,
            midinote: true,
        };
        let definition = ToneDefinition::from_parts(&[part], Some(0), TONE_GAIN);
        let mut state = ToneState::new(&definition);
        let mut buf = vec![0u8; 800];
        assert_eq!(state.generate(&mut buf), 800);
        assert!(samples(&buf).iter().any(|&s| s != 0));

        let plain = ToneItem::from_part(&TonePart::pair(440, 10, 0), TONE_GAIN);
        let midi = ToneItem::from_part(
            &TonePart { midinote: true, ..TonePart::pair(69, 200, 0) },
            TONE_GAIN,
        );
        assert_eq!(plain.fac1, midi.fac1);
        // Out of range notes fall back to 0 Hz
        assert_eq!(midi.init_v3_2, 0);
    }

    #[test]
    fn test_odd_request_leaves_last_byte_untouched_by_samples() {
        let mut state = ToneState::for_tone(ToneId::Dtmf(Digit::Digit1));
        let mut buf = [0xFFu8; 7];
        assert_eq!(state.generate(&mut buf), 6);
        assert_eq!(buf[6], 0);
    }
}

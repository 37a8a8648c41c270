//! DTMF (Dual-Tone Multi-Frequency) digits and outbound pacing

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Minimum time a digit stays "on" before it may be released
pub const MIN_DTMF_DURATION: Duration = Duration::from_millis(100);

/// Minimum silence between two digits
pub const MIN_TIME_BETWEEN_DTMF: Duration = Duration::from_millis(45);

/// A key of the 4x4 DTMF keypad
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Digit {
    Digit0,
    Digit1,
    Digit2,
    Digit3,
    Digit4,
    Digit5,
    Digit6,
    Digit7,
    Digit8,
    Digit9,
    Star,
    Pound,
    A,
    B,
    C,
    D,
}

impl Digit {
    pub const ALL: [Digit; 16] = [
        Self::Digit0,
        Self::Digit1,
        Self::Digit2,
        Self::Digit3,
        Self::Digit4,
        Self::Digit5,
        Self::Digit6,
        Self::Digit7,
        Self::Digit8,
        Self::Digit9,
        Self::Star,
        Self::Pound,
        Self::A,
        Self::B,
        Self::C,
        Self::D,
    ];

    pub fn to_char(self) -> char {
        match self {
            Self::Digit0 => '0',
            Self::Digit1 => '1',
            Self::Digit2 => '2',
            Self::Digit3 => '3',
            Self::Digit4 => '4',
            Self::Digit5 => '5',
            Self::Digit6 => '6',
            Self::Digit7 => '7',
            Self::Digit8 => '8',
            Self::Digit9 => '9',
            Self::Star => '*',
            Self::Pound => '#',
            Self::A => 'A',
            Self::B => 'B',
            Self::C => 'C',
            Self::D => 'D',
        }
    }

    pub fn from_char(c: char) -> Option<Self> {
        match c {
            '0' => Some(Self::Digit0),
            '1' => Some(Self::Digit1),
            '2' => Some(Self::Digit2),
            '3' => Some(Self::Digit3),
            '4' => Some(Self::Digit4),
            '5' => Some(Self::Digit5),
            '6' => Some(Self::Digit6),
            '7' => Some(Self::Digit7),
            '8' => Some(Self::Digit8),
            '9' => Some(Self::Digit9),
            '*' => Some(Self::Star),
            '#' => Some(Self::Pound),
            'A' | 'a' => Some(Self::A),
            'B' | 'b' => Some(Self::B),
            'C' | 'c' => Some(Self::C),
            'D' | 'd' => Some(Self::D),
            _ => None,
        }
    }

    /// Column (high group) and row (low group) frequencies in Hz
    pub fn frequencies(self) -> (u32, u32) {
        match self {
            Self::Digit1 => (1209, 697),
            Self::Digit2 => (1336, 697),
            Self::Digit3 => (1477, 697),
            Self::A => (1633, 697),
            Self::Digit4 => (1209, 770),
            Self::Digit5 => (1336, 770),
            Self::Digit6 => (1477, 770),
            Self::B => (1633, 770),
            Self::Digit7 => (1209, 852),
            Self::Digit8 => (1336, 852),
            Self::Digit9 => (1477, 852),
            Self::C => (1633, 852),
            Self::Star => (1209, 941),
            Self::Digit0 => (1336, 941),
            Self::Pound => (1477, 941),
            Self::D => (1633, 941),
        }
    }
}

impl fmt::Display for Digit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_char())
    }
}

/// Parse a dial string, skipping anything that is not a keypad symbol
pub fn parse_digits(text: &str) -> Vec<Digit> {
    text.chars().filter_map(Digit::from_char).collect()
}

/// Render digits as the string handed to extension lookups
pub fn digits_to_string(digits: &[Digit]) -> String {
    digits.iter().map(|d| d.to_char()).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtmfPhase {
    /// Nothing in flight
    Idle,
    /// A digit was sent, waiting for its minimum duration
    On,
    /// Inter-digit gap
    Off,
}

/// What the pacer asks its owner to queue towards the call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtmfSignal {
    /// Boundary marker so the far end can close or open a digit event
    Null,
    Digit(Digit),
}

/// Serializes in-call digits so each one is held for [`MIN_DTMF_DURATION`]
/// and separated from the next by [`MIN_TIME_BETWEEN_DTMF`].
#[derive(Debug)]
pub struct DtmfPacer {
    phase: DtmfPhase,
    since: Instant,
    queue: VecDeque<Digit>,
    capacity: usize,
}

impl DtmfPacer {
    pub fn new(capacity: usize) -> Self {
        Self {
            phase: DtmfPhase::Idle,
            since: Instant::now(),
            queue: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn phase(&self) -> DtmfPhase {
        self.phase
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Queue a digit. Returns false when the queue is full and the digit was dropped.
    pub fn push(&mut self, digit: Digit) -> bool {
        if self.queue.len() >= self.capacity {
            warn!("DTMF queue full, digit '{}' dropped", digit);
            return false;
        }
        self.queue.push_back(digit);
        true
    }

    pub fn reset(&mut self) {
        self.phase = DtmfPhase::Idle;
        self.queue.clear();
    }

    /// Advance the pacer.
    ///
    /// `send` is called for every signal to queue and reports whether the
    /// call accepted it. A digit that is refused stays at the head of the
    /// queue. Returns how long the caller may wait before polling again.
    pub fn poll<F>(&mut self, now: Instant, mut send: F) -> Option<Duration>
    where
        F: FnMut(DtmfSignal) -> bool,
    {
        let mut wait = None;
        let elapsed = now.saturating_duration_since(self.since);

        match self.phase {
            DtmfPhase::On => {
                if elapsed < MIN_DTMF_DURATION {
                    wait = Some(MIN_DTMF_DURATION - elapsed);
                } else {
                    self.phase = DtmfPhase::Off;
                    self.since = now;
                    wait = Some(MIN_TIME_BETWEEN_DTMF);
                    if !send(DtmfSignal::Null) {
                        warn!("Can't queue DTMF end marker");
                    }
                }
            }
            DtmfPhase::Off => {
                if elapsed < MIN_TIME_BETWEEN_DTMF {
                    wait = Some(MIN_TIME_BETWEEN_DTMF - elapsed);
                } else {
                    self.phase = DtmfPhase::Idle;
                    if !send(DtmfSignal::Null) {
                        warn!("Can't queue DTMF gap marker");
                    }
                }
            }
            DtmfPhase::Idle => {}
        }

        if self.phase == DtmfPhase::Idle {
            if let Some(&digit) = self.queue.front() {
                if send(DtmfSignal::Digit(digit)) {
                    debug!("DTMF '{}' sent", digit);
                    self.queue.pop_front();
                    self.phase = DtmfPhase::On;
                    self.since = now;
                    wait = Some(MIN_DTMF_DURATION);
                } else {
                    warn!("Unable to queue DTMF '{}'", digit);
                }
            }
        }

        wait
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digit_char_mapping() {
        for digit in Digit::ALL {
            assert_eq!(Digit::from_char(digit.to_char()), Some(digit));
        }
        assert_eq!(Digit::from_char('b'), Some(Digit::B));
        assert_eq!(Digit::from_char('x'), None);
        assert_eq!(digits_to_string(&parse_digits("12-3#")), "123#");
    }

    #[test]
    fn test_standard_frequency_pairs() {
        assert_eq!(Digit::Digit0.frequencies(), (1336, 941));
        assert_eq!(Digit::Digit5.frequencies(), (1336, 770));
        assert_eq!(Digit::Pound.frequencies(), (1477, 941));
        assert_eq!(Digit::D.frequencies(), (1633, 941));
    }

    #[test]
    fn test_pacer_respects_minimum_on_and_gap() {
        let start = Instant::now();
        let mut pacer = DtmfPacer::new(16);
        for digit in parse_digits("1234") {
            assert!(pacer.push(digit));
        }

        let mut on_starts = Vec::new();
        let mut on_ends = Vec::new();
        let mut markers = 0;

        // Poll every 7ms for two seconds, which is never aligned with the pacing constants
        let mut now = start;
        while now < start + Duration::from_secs(2) {
            pacer.poll(now, |signal| {
                match signal {
                    DtmfSignal::Digit(_) => on_starts.push(now),
                    DtmfSignal::Null => {
                        markers += 1;
                        if markers % 2 == 1 {
                            on_ends.push(now);
                        }
                    }
                }
                true
            });
            now += Duration::from_millis(7);
        }

        assert_eq!(on_starts.len(), 4);
        assert_eq!(on_ends.len(), 4);
        assert_eq!(markers, 8);
        for i in 0..4 {
            assert!(on_ends[i] - on_starts[i] >= MIN_DTMF_DURATION);
        }
        for i in 0..3 {
            assert!(on_starts[i + 1] - on_ends[i] >= MIN_TIME_BETWEEN_DTMF);
        }
        assert_eq!(pacer.phase(), DtmfPhase::Idle);
    }

    #[test]
    fn test_pacer_reports_remaining_wait() {
        let start = Instant::now();
        let mut pacer = DtmfPacer::new(4);
        pacer.push(Digit::Digit9);

        assert_eq!(pacer.poll(start, |_| true), Some(MIN_DTMF_DURATION));
        assert_eq!(
            pacer.poll(start + Duration::from_millis(40), |_| true),
            Some(Duration::from_millis(60))
        );
        assert_eq!(
            pacer.poll(start + Duration::from_millis(100), |_| true),
            Some(MIN_TIME_BETWEEN_DTMF)
        );
        assert_eq!(pacer.poll(start + Duration::from_millis(145), |_| true), None);
    }

    #[test]
    fn test_refused_digit_stays_queued() {
        let now = Instant::now();
        let mut pacer = DtmfPacer::new(4);
        pacer.push(Digit::Star);

        assert_eq!(pacer.poll(now, |_| false), None);
        assert_eq!(pacer.pending(), 1);
        assert_eq!(pacer.phase(), DtmfPhase::Idle);

        let mut sent = Vec::new();
        pacer.poll(now, |signal| {
            sent.push(signal);
            true
        });
        assert_eq!(sent, vec![DtmfSignal::Digit(Digit::Star)]);
    }

    #[test]
    fn test_full_queue_drops_digit() {
        let mut pacer = DtmfPacer::new(1);
        assert!(pacer.push(Digit::Digit1));
        assert!(!pacer.push(Digit::Digit2));
        pacer.reset();
        assert_eq!(pacer.pending(), 0);
    }
}

//! Audio pacing between the host's frames and the fixed hardware period
//!
//! Playback keeps whatever the device did not take and retries it on the next
//! opportunity. Capture assembles whole periods before handing them on.

use bytes::{Buf, Bytes, BytesMut};
use tracing::trace;

use crate::interfaces::pcm::{ensure_ready, recover, DeviceResult, PcmDevice};
use crate::protocols::tones::{duration_in_bytes, ToneId, ToneState, SAMPLES_PER_MS, SAMPLE_SIZE};

pub const PERIOD_MS: usize = 30;
pub const PERIOD_FRAMES: usize = PERIOD_MS * SAMPLES_PER_MS;
pub const PERIOD_BYTES: usize = PERIOD_FRAMES * SAMPLE_SIZE;
/// Periods held by the hardware playback buffer
pub const PLAYBACK_BUFFER_PERIODS: usize = 16;

/// Most captured periods handed on per pump
const MAX_FRAMES_PER_PUMP: usize = 4;

/// A tone being played, with what is left of its duration
#[derive(Debug, Clone)]
pub struct ActiveTone {
    id: ToneId,
    state: ToneState,
    budget: Option<usize>,
}

impl ActiveTone {
    /// `duration_ms` of `None` plays until stopped
    pub fn new(id: ToneId, duration_ms: Option<u32>) -> Self {
        Self {
            id,
            state: ToneState::for_tone(id),
            budget: duration_ms.map(duration_in_bytes),
        }
    }

    pub fn id(&self) -> ToneId {
        self.id
    }

    pub fn remaining_bytes(&self) -> Option<usize> {
        self.budget
    }

    fn take(&mut self, out: &mut [u8]) -> usize {
        let len = self.budget.map_or(out.len(), |budget| budget.min(out.len()));
        let produced = self.state.generate(&mut out[..len]);
        if let Some(budget) = self.budget.as_mut() {
            *budget -= produced;
        }
        produced
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToneProgress {
    Playing,
    /// Nothing left to play, the tone should be stopped
    Finished,
}

/// Playback side: bytes accepted from the host or the tone generator that the
/// device has not taken yet.
#[derive(Debug)]
pub struct PlaybackPacer {
    pending: BytesMut,
    limit: usize,
}

impl Default for PlaybackPacer {
    fn default() -> Self {
        Self::new(PERIOD_BYTES * PLAYBACK_BUFFER_PERIODS)
    }
}

impl PlaybackPacer {
    pub fn new(limit: usize) -> Self {
        Self {
            pending: BytesMut::with_capacity(limit),
            limit,
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Accept as much of `data` as fits and push whole samples to the device.
    ///
    /// Returns the number of bytes accepted. Accepted bytes are never dropped,
    /// a trailing half sample waits for the next write. Only a fatal device
    /// error is returned.
    pub fn write_voice(&mut self, device: &mut dyn PcmDevice, data: &[u8]) -> DeviceResult<usize> {
        self.flush(device)?;
        let room = self.limit.saturating_sub(self.pending.len());
        let accepted = data.len().min(room);
        self.pending.extend_from_slice(&data[..accepted]);
        self.flush(device)?;
        Ok(accepted)
    }

    /// Write pending whole samples until the device stops taking them
    pub fn flush(&mut self, device: &mut dyn PcmDevice) -> DeviceResult<()> {
        while self.pending.len() >= SAMPLE_SIZE {
            if !self.write_once(device)? {
                break;
            }
        }
        Ok(())
    }

    /// Keep the device fed from `tone`
    pub fn refill_tone(&mut self, device: &mut dyn PcmDevice, tone: &mut ActiveTone) -> DeviceResult<ToneProgress> {
        for _ in 0..=PLAYBACK_BUFFER_PERIODS {
            if self.pending.len() < SAMPLE_SIZE {
                let start = self.pending.len();
                self.pending.resize(PERIOD_BYTES, 0);
                let produced = tone.take(&mut self.pending[start..]);
                self.pending.truncate(start + produced);
            }
            if self.pending.len() < SAMPLE_SIZE {
                return Ok(ToneProgress::Finished);
            }
            self.write_once(device)?;
            if self.pending.len() >= SAMPLE_SIZE {
                break;
            }
        }
        Ok(ToneProgress::Playing)
    }

    /// One write attempt. Returns whether the device took anything.
    fn write_once(&mut self, device: &mut dyn PcmDevice) -> DeviceResult<bool> {
        ensure_ready(device);
        let whole = self.pending.len() - self.pending.len() % SAMPLE_SIZE;
        match device.write(&self.pending[..whole]) {
            Ok(0) => Ok(false),
            Ok(frames) => {
                trace!("{}: wrote {} frames, {} bytes left", device.name(), frames, whole - frames * SAMPLE_SIZE);
                self.pending.advance(frames * SAMPLE_SIZE);
                Ok(true)
            }
            Err(e) => {
                recover(device, e)?;
                Ok(false)
            }
        }
    }

    pub fn reset(&mut self) {
        self.pending.clear();
    }

    /// Drop everything but a trailing half sample
    pub fn keep_partial(&mut self) {
        let drop = self.pending.len() - self.pending.len() % SAMPLE_SIZE;
        self.pending.advance(drop);
    }
}

/// Capture side: collects device reads into whole periods
#[derive(Debug)]
pub struct CaptureAssembler {
    buffer: BytesMut,
    frame_bytes: usize,
    /// Period the sink refused, offered again first
    held: Option<Bytes>,
}

impl Default for CaptureAssembler {
    fn default() -> Self {
        Self::new(PERIOD_BYTES)
    }
}

impl CaptureAssembler {
    pub fn new(frame_bytes: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(frame_bytes),
            frame_bytes,
            held: None,
        }
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_holding(&self) -> bool {
        self.held.is_some()
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.held = None;
    }

    /// Read towards a full period. Returns the period once complete.
    pub fn read_frame(&mut self, device: &mut dyn PcmDevice) -> DeviceResult<Option<Bytes>> {
        if let Some(frame) = self.held.take() {
            return Ok(Some(frame));
        }
        let start = self.buffer.len();
        if start < self.frame_bytes {
            self.buffer.resize(self.frame_bytes, 0);
            match device.read(&mut self.buffer[start..]) {
                Ok(frames) => self.buffer.truncate(start + frames * SAMPLE_SIZE),
                Err(e) => {
                    self.buffer.truncate(start);
                    recover(device, e)?;
                }
            }
        }
        if self.buffer.len() == self.frame_bytes {
            Ok(Some(self.buffer.split().freeze()))
        } else {
            Ok(None)
        }
    }

    /// Hand complete periods to `sink` until the device runs dry or `sink`
    /// refuses one. A refused period is kept and offered first on the next
    /// pump. Returns how many were accepted.
    pub fn pump<F>(&mut self, device: &mut dyn PcmDevice, mut sink: F) -> DeviceResult<usize>
    where
        F: FnMut(Bytes) -> bool,
    {
        let mut count = 0;
        while count < MAX_FRAMES_PER_PUMP {
            match self.read_frame(device)? {
                Some(frame) => {
                    if !sink(frame.clone()) {
                        self.held = Some(frame);
                        break;
                    }
                    count += 1;
                }
                None => break,
            }
        }
        Ok(count)
    }
}

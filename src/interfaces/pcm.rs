//! PCM device abstraction shared by the sound card backends
//!
//! Every call is non-blocking. Errors carry a kind that maps onto three
//! classes: transient (retry later), recoverable (reset the device in place)
//! and fatal (the device is gone and the line must be disconnected).

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, error, warn};

use crate::protocols::tones::SAMPLE_SIZE;

/// Resume attempts on a suspended device before falling back to prepare
const MAX_RESUME_ATTEMPTS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Capture,
    Playback,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Capture => write!(f, "capture"),
            Direction::Playback => write!(f, "playback"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PcmState {
    /// Configured but stopped
    Setup,
    Prepared,
    Running,
    XRun,
    Suspended,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceErrorKind {
    /// Nothing can be transferred right now
    WouldBlock,
    /// Buffer underrun or overrun
    Xrun,
    /// The device was suspended by power management
    Suspended,
    /// The device disappeared or the handle is no longer valid
    Gone,
    /// Any other driver failure, carrying the raw error number
    Other(i32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Recoverable,
    Fatal,
}

impl DeviceErrorKind {
    pub fn class(self) -> ErrorClass {
        match self {
            DeviceErrorKind::WouldBlock => ErrorClass::Transient,
            DeviceErrorKind::Xrun | DeviceErrorKind::Suspended | DeviceErrorKind::Other(_) => {
                ErrorClass::Recoverable
            }
            DeviceErrorKind::Gone => ErrorClass::Fatal,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{operation} failed on '{device}': {kind:?}")]
pub struct DeviceError {
    pub kind: DeviceErrorKind,
    pub operation: &'static str,
    pub device: String,
}

impl DeviceError {
    pub fn new<S: Into<String>>(kind: DeviceErrorKind, operation: &'static str, device: S) -> Self {
        Self {
            kind,
            operation,
            device: device.into(),
        }
    }

    pub fn class(&self) -> ErrorClass {
        self.kind.class()
    }

    pub fn is_fatal(&self) -> bool {
        self.class() == ErrorClass::Fatal
    }
}

impl From<DeviceError> for crate::Error {
    fn from(err: DeviceError) -> Self {
        crate::Error::device(err.to_string())
    }
}

pub type DeviceResult<T> = std::result::Result<T, DeviceError>;

/// A mono signed 16-bit PCM stream opened in non-blocking mode.
///
/// Transfers are expressed in bytes and always a whole number of samples;
/// the returned counts are frames.
pub trait PcmDevice: Send {
    fn name(&self) -> &str;
    fn direction(&self) -> Direction;
    fn state(&self) -> PcmState;
    fn prepare(&mut self) -> DeviceResult<()>;
    fn start(&mut self) -> DeviceResult<()>;
    /// Stop immediately, dropping pending frames
    fn stop(&mut self) -> DeviceResult<()>;
    fn resume(&mut self) -> DeviceResult<()>;
    fn write(&mut self, data: &[u8]) -> DeviceResult<usize>;
    fn read(&mut self, buf: &mut [u8]) -> DeviceResult<usize>;
}

/// Prepare and start a stream, logging failures
pub fn start_stream(device: &mut dyn PcmDevice) {
    if let Err(e) = device.prepare() {
        debug!("{}", e);
    }
    if let Err(e) = device.start() {
        debug!("{}", e);
    }
}

/// Drop a stream, logging failures
pub fn stop_stream(device: &mut dyn PcmDevice) {
    if let Err(e) = device.stop() {
        debug!("{}", e);
    }
}

/// Make sure a stream accepts transfers
pub fn ensure_ready(device: &mut dyn PcmDevice) {
    if !matches!(device.state(), PcmState::Prepared | PcmState::Running) {
        if let Err(e) = device.prepare() {
            error!("{}", e);
        }
    }
}

/// Apply the recovery matching an error's class.
///
/// Returns the error back when it is fatal.
pub fn recover(device: &mut dyn PcmDevice, err: DeviceError) -> DeviceResult<()> {
    match err.class() {
        ErrorClass::Transient => Ok(()),
        ErrorClass::Recoverable => {
            debug!("{}", err);
            match err.kind {
                DeviceErrorKind::Suspended => {
                    let mut resumed = false;
                    for _ in 0..MAX_RESUME_ATTEMPTS {
                        match device.resume() {
                            Ok(()) => {
                                resumed = true;
                                break;
                            }
                            Err(e) if e.kind == DeviceErrorKind::WouldBlock => continue,
                            Err(e) if e.is_fatal() => return Err(e),
                            Err(_) => break,
                        }
                    }
                    if !resumed {
                        if let Err(e) = device.prepare() {
                            error!("{}", e);
                            if e.is_fatal() {
                                return Err(e);
                            }
                        }
                    }
                }
                _ => {
                    if let Err(e) = device.prepare() {
                        warn!("{}", e);
                        if e.is_fatal() {
                            return Err(e);
                        }
                    }
                }
            }
            Ok(())
        }
        ErrorClass::Fatal => {
            error!("{}", err);
            Err(err)
        }
    }
}

struct MemoryInner {
    state: PcmState,
    capacity: usize,
    occupancy: usize,
    history: Vec<u8>,
    capture: VecDeque<u8>,
    faults: VecDeque<DeviceErrorKind>,
    discard: bool,
    silence: bool,
    starts: usize,
    stops: usize,
}

/// In-process PCM stream.
///
/// Clones share the same stream, so a test (or the console) can keep a
/// handle to feed capture data or inspect what was played.
#[derive(Clone)]
pub struct MemoryPcm {
    name: String,
    direction: Direction,
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryPcm {
    fn with(name: &str, direction: Direction, capacity_frames: usize, discard: bool, silence: bool) -> Self {
        Self {
            name: name.to_string(),
            direction,
            inner: Arc::new(Mutex::new(MemoryInner {
                state: PcmState::Setup,
                capacity: capacity_frames * SAMPLE_SIZE,
                occupancy: 0,
                history: Vec::new(),
                capture: VecDeque::new(),
                faults: VecDeque::new(),
                discard,
                silence,
                starts: 0,
                stops: 0,
            })),
        }
    }

    /// Playback stream holding at most `capacity_frames` unplayed frames
    pub fn playback(name: &str, capacity_frames: usize) -> Self {
        Self::with(name, Direction::Playback, capacity_frames, false, false)
    }

    /// Capture stream returning whatever was fed to it
    pub fn capture(name: &str) -> Self {
        Self::with(name, Direction::Capture, 0, false, false)
    }

    /// Playback stream that plays everything instantly and keeps nothing
    pub fn sink(name: &str) -> Self {
        Self::with(name, Direction::Playback, 0, true, false)
    }

    /// Capture stream that always has silence available
    pub fn silence(name: &str) -> Self {
        Self::with(name, Direction::Capture, 0, false, true)
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Everything accepted by the playback side so far
    pub fn played(&self) -> Vec<u8> {
        self.lock().history.clone()
    }

    /// Simulate the hardware consuming queued frames
    pub fn consume(&self, bytes: usize) {
        let mut inner = self.lock();
        inner.occupancy = inner.occupancy.saturating_sub(bytes);
    }

    pub fn queued(&self) -> usize {
        self.lock().occupancy
    }

    /// Make captured audio available
    pub fn feed(&self, data: &[u8]) {
        self.lock().capture.extend(data.iter().copied());
    }

    /// The next transfer fails with `kind`
    pub fn inject_fault(&self, kind: DeviceErrorKind) {
        self.lock().faults.push_back(kind);
    }

    /// Unplug the device, every later call fails as fatal
    pub fn unplug(&self) {
        self.lock().state = PcmState::Disconnected;
    }

    pub fn starts(&self) -> usize {
        self.lock().starts
    }

    pub fn stops(&self) -> usize {
        self.lock().stops
    }

    fn error(&self, kind: DeviceErrorKind, operation: &'static str) -> DeviceError {
        DeviceError::new(kind, operation, self.name.clone())
    }

    fn check_transfer(&self, inner: &mut MemoryInner, operation: &'static str) -> DeviceResult<()> {
        if inner.state == PcmState::Disconnected {
            return Err(self.error(DeviceErrorKind::Gone, operation));
        }
        if let Some(kind) = inner.faults.pop_front() {
            match kind {
                DeviceErrorKind::Xrun => inner.state = PcmState::XRun,
                DeviceErrorKind::Suspended => inner.state = PcmState::Suspended,
                DeviceErrorKind::Gone => inner.state = PcmState::Disconnected,
                _ => {}
            }
            return Err(self.error(kind, operation));
        }
        match inner.state {
            PcmState::XRun => Err(self.error(DeviceErrorKind::Xrun, operation)),
            PcmState::Suspended => Err(self.error(DeviceErrorKind::Suspended, operation)),
            PcmState::Setup => Err(self.error(DeviceErrorKind::Other(77), operation)),
            _ => {
                inner.state = PcmState::Running;
                Ok(())
            }
        }
    }
}

impl PcmDevice for MemoryPcm {
    fn name(&self) -> &str {
        &self.name
    }

    fn direction(&self) -> Direction {
        self.direction
    }

    fn state(&self) -> PcmState {
        self.lock().state
    }

    fn prepare(&mut self) -> DeviceResult<()> {
        let mut inner = self.lock();
        if inner.state == PcmState::Disconnected {
            return Err(self.error(DeviceErrorKind::Gone, "prepare"));
        }
        if inner.state != PcmState::Running {
            inner.state = PcmState::Prepared;
        }
        Ok(())
    }

    fn start(&mut self) -> DeviceResult<()> {
        let mut inner = self.lock();
        match inner.state {
            PcmState::Disconnected => Err(self.error(DeviceErrorKind::Gone, "start")),
            PcmState::Prepared | PcmState::Running => {
                inner.state = PcmState::Running;
                inner.starts += 1;
                Ok(())
            }
            _ => Err(self.error(DeviceErrorKind::Other(77), "start")),
        }
    }

    fn stop(&mut self) -> DeviceResult<()> {
        let mut inner = self.lock();
        if inner.state == PcmState::Disconnected {
            return Err(self.error(DeviceErrorKind::Gone, "stop"));
        }
        inner.state = PcmState::Setup;
        inner.occupancy = 0;
        inner.capture.clear();
        inner.stops += 1;
        Ok(())
    }

    fn resume(&mut self) -> DeviceResult<()> {
        let mut inner = self.lock();
        match inner.state {
            PcmState::Disconnected => Err(self.error(DeviceErrorKind::Gone, "resume")),
            PcmState::Suspended => {
                inner.state = PcmState::Prepared;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn write(&mut self, data: &[u8]) -> DeviceResult<usize> {
        let mut inner = self.lock();
        self.check_transfer(&mut inner, "write")?;
        let whole = data.len() - data.len() % SAMPLE_SIZE;
        if inner.discard {
            return Ok(whole / SAMPLE_SIZE);
        }
        let free = inner.capacity.saturating_sub(inner.occupancy);
        let accepted = whole.min(free - free % SAMPLE_SIZE);
        if accepted == 0 && whole > 0 {
            return Err(self.error(DeviceErrorKind::WouldBlock, "write"));
        }
        inner.history.extend_from_slice(&data[..accepted]);
        inner.occupancy += accepted;
        Ok(accepted / SAMPLE_SIZE)
    }

    fn read(&mut self, buf: &mut [u8]) -> DeviceResult<usize> {
        let mut inner = self.lock();
        self.check_transfer(&mut inner, "read")?;
        let whole = buf.len() - buf.len() % SAMPLE_SIZE;
        if inner.silence {
            buf[..whole].fill(0);
            return Ok(whole / SAMPLE_SIZE);
        }
        let available = inner.capture.len() - inner.capture.len() % SAMPLE_SIZE;
        let count = whole.min(available);
        if count == 0 && whole > 0 {
            return Err(self.error(DeviceErrorKind::WouldBlock, "read"));
        }
        for (slot, byte) in buf[..count].iter_mut().zip(inner.capture.drain(..count)) {
            *slot = byte;
        }
        Ok(count / SAMPLE_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert_eq!(DeviceErrorKind::WouldBlock.class(), ErrorClass::Transient);
        assert_eq!(DeviceErrorKind::Xrun.class(), ErrorClass::Recoverable);
        assert_eq!(DeviceErrorKind::Suspended.class(), ErrorClass::Recoverable);
        assert_eq!(DeviceErrorKind::Other(5).class(), ErrorClass::Recoverable);
        assert_eq!(DeviceErrorKind::Gone.class(), ErrorClass::Fatal);
    }

    #[test]
    fn test_playback_short_write_when_full() {
        let tap = MemoryPcm::playback("pb", 4);
        let mut device = tap.clone();
        start_stream(&mut device);

        assert_eq!(device.write(&[1u8; 6]).unwrap(), 3);
        assert_eq!(device.write(&[2u8; 6]).unwrap(), 1);
        let err = device.write(&[3u8; 2]).unwrap_err();
        assert_eq!(err.class(), ErrorClass::Transient);

        tap.consume(4);
        assert_eq!(device.write(&[4u8; 4]).unwrap(), 2);
        assert_eq!(tap.played().len(), 12);
    }

    #[test]
    fn test_recover_from_xrun_and_suspend() {
        let tap = MemoryPcm::playback("pb", 64);
        let mut device = tap.clone();
        start_stream(&mut device);

        tap.inject_fault(DeviceErrorKind::Xrun);
        let err = device.write(&[0u8; 4]).unwrap_err();
        assert!(recover(&mut device, err).is_ok());
        assert_eq!(device.state(), PcmState::Prepared);
        assert_eq!(device.write(&[0u8; 4]).unwrap(), 2);

        tap.inject_fault(DeviceErrorKind::Suspended);
        let err = device.write(&[0u8; 4]).unwrap_err();
        assert!(recover(&mut device, err).is_ok());
        assert_eq!(device.write(&[0u8; 4]).unwrap(), 2);
    }

    #[test]
    fn test_unplugged_device_is_fatal() {
        let tap = MemoryPcm::capture("cap");
        let mut device = tap.clone();
        start_stream(&mut device);
        tap.unplug();

        let mut buf = [0u8; 8];
        let err = device.read(&mut buf).unwrap_err();
        assert!(err.is_fatal());
        assert!(recover(&mut device, err).is_err());
    }

    #[test]
    fn test_capture_returns_fed_samples_only() {
        let tap = MemoryPcm::capture("cap");
        let mut device = tap.clone();
        start_stream(&mut device);
        tap.feed(&[1, 2, 3, 4, 5]);

        let mut buf = [0u8; 8];
        assert_eq!(device.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..4], &[1, 2, 3, 4]);

        stop_stream(&mut device);
        assert_eq!(tap.stops(), 1);
        ensure_ready(&mut device);
        assert_eq!(device.read(&mut buf).unwrap_err().class(), ErrorClass::Transient);
    }
}

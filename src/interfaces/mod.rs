//! Hardware attached to a line: sound devices and event nodes

pub mod evdev;
pub mod pcm;
#[cfg(feature = "alsa")]
pub mod alsa;

use dashmap::DashMap;
use tracing::info;

use crate::config::LineConfig;
use crate::core::audio::{PERIOD_FRAMES, PLAYBACK_BUFFER_PERIODS};
use crate::Result;

pub use evdev::{event_channel, EventQueue, EventSender, EventSink, RecordingSink, SourceMessage};
pub use pcm::{DeviceError, DeviceErrorKind, Direction, MemoryPcm, PcmDevice, PcmState};

/// Device names with this prefix are served from memory
pub const MEMORY_DEVICE_PREFIX: &str = "memory:";

/// Devices a line owns for its whole lifetime
pub struct LineDevices {
    pub capture: Box<dyn PcmDevice>,
    pub playback: Box<dyn PcmDevice>,
    pub ringer: Option<Box<dyn EventSink>>,
}

/// Opens the devices of a configured line
pub trait DeviceProvider: Send + Sync {
    fn open(&self, index: usize, config: &LineConfig) -> Result<LineDevices>;
}

/// Sound cards and evdev nodes named in the configuration
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemDevices;

impl DeviceProvider for SystemDevices {
    fn open(&self, index: usize, config: &LineConfig) -> Result<LineDevices> {
        let capture = open_pcm(&config.capture_device, Direction::Capture)?;
        let playback = open_pcm(&config.playback_device, Direction::Playback)?;
        let ringer: Option<Box<dyn EventSink>> = if config.event_output_device.is_empty() {
            None
        } else {
            Some(Box::new(evdev::EvdevSink::open(&config.event_output_device)?))
        };
        info!(
            "Line {}: capture={}, playback={}, ringer={}",
            index + 1,
            capture.name(),
            playback.name(),
            if ringer.is_some() { config.event_output_device.as_str() } else { "none" }
        );
        Ok(LineDevices { capture, playback, ringer })
    }
}

fn open_pcm(name: &str, direction: Direction) -> Result<Box<dyn PcmDevice>> {
    if name.starts_with(MEMORY_DEVICE_PREFIX) {
        Ok(memory_pcm(name, direction))
    } else {
        open_hardware(name, direction)
    }
}

fn memory_pcm(name: &str, direction: Direction) -> Box<dyn PcmDevice> {
    match direction {
        Direction::Capture => Box::new(MemoryPcm::silence(name)),
        Direction::Playback => Box::new(MemoryPcm::sink(name)),
    }
}

#[cfg(feature = "alsa")]
fn open_hardware(name: &str, direction: Direction) -> Result<Box<dyn PcmDevice>> {
    Ok(Box::new(alsa::AlsaPcm::open(name, direction)?))
}

#[cfg(not(feature = "alsa"))]
fn open_hardware(name: &str, direction: Direction) -> Result<Box<dyn PcmDevice>> {
    tracing::warn!("Built without ALSA support, {} device '{}' runs in memory", direction, name);
    Ok(memory_pcm(name, direction))
}

/// Handles onto the in-memory devices of one line
#[derive(Clone)]
pub struct MemoryLine {
    pub capture: MemoryPcm,
    pub playback: MemoryPcm,
    pub ringer: RecordingSink,
}

/// Gives every line in-memory devices and keeps a handle on each of them
#[derive(Default)]
pub struct MemoryDevices {
    lines: DashMap<usize, MemoryLine>,
}

impl MemoryDevices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn line(&self, index: usize) -> Option<MemoryLine> {
        self.lines.get(&index).map(|line| line.clone())
    }
}

impl DeviceProvider for MemoryDevices {
    fn open(&self, index: usize, _config: &LineConfig) -> Result<LineDevices> {
        let line = MemoryLine {
            capture: MemoryPcm::capture(&format!("memory:capture{}", index)),
            playback: MemoryPcm::playback(
                &format!("memory:playback{}", index),
                PERIOD_FRAMES * PLAYBACK_BUFFER_PERIODS,
            ),
            ringer: RecordingSink::new(),
        };
        self.lines.insert(index, line.clone());
        Ok(LineDevices {
            capture: Box::new(line.capture),
            playback: Box::new(line.playback),
            ringer: Some(Box::new(line.ringer)),
        })
    }
}

//! ALSA sound card backend

use alsa::pcm::{Access, Format, Frames, HwParams, State, PCM};
use alsa::ValueOr;
use tracing::info;

use crate::core::audio::{PERIOD_FRAMES, PLAYBACK_BUFFER_PERIODS};
use crate::interfaces::pcm::{
    DeviceError, DeviceErrorKind, DeviceResult, Direction, PcmDevice, PcmState,
};
use crate::protocols::tones::SAMPLE_RATE;
use crate::{Error, Result};

const EAGAIN: i32 = 11;
const EPIPE: i32 = 32;
const ESTRPIPE: i32 = 86;
const ENODEV: i32 = 19;
const ENOTTY: i32 = 25;

/// Classify a driver error number. Sign is ignored.
fn error_kind(errno: i32) -> DeviceErrorKind {
    match errno.abs() {
        EAGAIN => DeviceErrorKind::WouldBlock,
        EPIPE => DeviceErrorKind::Xrun,
        ESTRPIPE => DeviceErrorKind::Suspended,
        ENODEV | ENOTTY => DeviceErrorKind::Gone,
        other => DeviceErrorKind::Other(other),
    }
}

fn native_s16() -> Format {
    if cfg!(target_endian = "little") {
        Format::S16LE
    } else {
        Format::S16BE
    }
}

/// A PCM handle opened non-blocking, mono, 8 kHz, native signed 16-bit
pub struct AlsaPcm {
    name: String,
    direction: Direction,
    pcm: PCM,
}

impl AlsaPcm {
    pub fn open(name: &str, direction: Direction) -> Result<Self> {
        let alsa_direction = match direction {
            Direction::Capture => alsa::Direction::Capture,
            Direction::Playback => alsa::Direction::Playback,
        };
        let setup = |e: alsa::Error| {
            Error::device(format!("Failed to configure {} device '{}': {}", direction, name, e))
        };

        let pcm = PCM::new(name, alsa_direction, true)
            .map_err(|e| Error::device(format!("Failed to open PCM device '{}' for {}: {}", name, direction, e)))?;

        {
            let hwp = HwParams::any(&pcm).map_err(setup)?;
            hwp.set_access(Access::RWInterleaved).map_err(setup)?;
            hwp.set_format(native_s16()).map_err(setup)?;
            hwp.set_channels(1).map_err(setup)?;
            hwp.set_rate(SAMPLE_RATE, ValueOr::Nearest).map_err(setup)?;
            hwp.set_period_size_near(PERIOD_FRAMES as Frames, ValueOr::Nearest).map_err(setup)?;
            if direction == Direction::Playback {
                hwp.set_buffer_size_near((PERIOD_FRAMES * PLAYBACK_BUFFER_PERIODS) as Frames)
                    .map_err(setup)?;
            }
            pcm.hw_params(&hwp).map_err(setup)?;
        }

        {
            // Playback starts once a period is queued, capture as soon as a frame arrives
            let start_threshold = match direction {
                Direction::Playback => PERIOD_FRAMES as Frames,
                Direction::Capture => 1,
            };
            let swp = pcm.sw_params_current().map_err(setup)?;
            swp.set_start_threshold(start_threshold).map_err(setup)?;
            pcm.sw_params(&swp).map_err(setup)?;
        }

        let (rate, period) = {
            let hwp = pcm.hw_params_current().map_err(setup)?;
            (hwp.get_rate().map_err(setup)?, hwp.get_period_size().map_err(setup)?)
        };
        info!("ALSA {}: device={}, rate={}, period_size={}", direction, name, rate, period);

        Ok(Self {
            name: name.to_string(),
            direction,
            pcm,
        })
    }

    fn error(&self, err: alsa::Error, operation: &'static str) -> DeviceError {
        #[allow(clippy::unnecessary_cast)]
        let kind = error_kind(err.errno() as i32);
        DeviceError::new(kind, operation, self.name.clone())
    }
}

impl PcmDevice for AlsaPcm {
    fn name(&self) -> &str {
        &self.name
    }

    fn direction(&self) -> Direction {
        self.direction
    }

    fn state(&self) -> PcmState {
        match self.pcm.state() {
            State::Prepared => PcmState::Prepared,
            State::Running | State::Draining => PcmState::Running,
            State::XRun => PcmState::XRun,
            State::Suspended => PcmState::Suspended,
            State::Disconnected => PcmState::Disconnected,
            _ => PcmState::Setup,
        }
    }

    fn prepare(&mut self) -> DeviceResult<()> {
        self.pcm.prepare().map_err(|e| self.error(e, "snd_pcm_prepare"))
    }

    fn start(&mut self) -> DeviceResult<()> {
        self.pcm.start().map_err(|e| self.error(e, "snd_pcm_start"))
    }

    fn stop(&mut self) -> DeviceResult<()> {
        self.pcm.drop().map_err(|e| self.error(e, "snd_pcm_drop"))
    }

    fn resume(&mut self) -> DeviceResult<()> {
        self.pcm.resume().map_err(|e| self.error(e, "snd_pcm_resume"))
    }

    fn write(&mut self, data: &[u8]) -> DeviceResult<usize> {
        let io = self.pcm.io_bytes();
        io.writei(data).map_err(|e| self.error(e, "snd_pcm_writei"))
    }

    fn read(&mut self, buf: &mut [u8]) -> DeviceResult<usize> {
        let io = self.pcm.io_bytes();
        io.readi(buf).map_err(|e| self.error(e, "snd_pcm_readi"))
    }
}

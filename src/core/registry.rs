//! Line registry: every line of the controller and the operations the host
//! drives them with
//!
//! Locks are always taken registry (monitor state) first, then line. The
//! monitor only ever try-locks lines while holding the monitor state, so a
//! host operation waiting on a line can never block it.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, MutexGuard, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{FxsConfig, LineConfig};
use crate::core::host::{AudioFormat, CallError, CallHandle, CallHost, CallerId, Frame, IndicateOutcome, Indication};
use crate::core::line::{Line, LineShared, LineSnapshot, LineState};
use crate::interfaces::evdev::spawn_reader;
use crate::interfaces::{event_channel, DeviceProvider, EventSender};
use crate::protocols::dtmf::Digit;
use crate::protocols::input::Key;
use crate::{Error, Result};

/// What the monitor remembers about each line between passes
#[derive(Debug, Default)]
pub struct MonitorState {
    pub(super) last_known: BTreeMap<usize, LineState>,
}

struct LineSlot {
    line: Mutex<Line>,
    sender: EventSender,
    config: Arc<LineConfig>,
}

pub struct LineRegistry {
    slots: BTreeMap<usize, LineSlot>,
    bindings: Arc<DashMap<CallHandle, usize>>,
    monitor: Mutex<MonitorState>,
    wake: Arc<Notify>,
}

/// Parse a 1-based line selector such as `2` or `2/extra` into a line index
pub fn parse_line_selector(selector: &str) -> Option<usize> {
    let end = selector.find(|c: char| !c.is_ascii_digit()).unwrap_or(selector.len());
    let (number, rest) = selector.split_at(end);
    if let Some(next) = rest.chars().next() {
        if next.is_alphanumeric() {
            return None;
        }
    }
    number.parse::<usize>().ok()?.checked_sub(1)
}

impl LineRegistry {
    /// Open the devices of every enabled line. Lines whose devices fail to
    /// open are left out; having none at all is an error.
    pub fn new(config: &FxsConfig, devices: &dyn DeviceProvider, host: Arc<dyn CallHost>) -> Result<Self> {
        let bindings = Arc::new(DashMap::new());
        let wake = Arc::new(Notify::new());
        let shared = LineShared {
            host,
            bindings: Arc::clone(&bindings),
            max_extension_length: config.general.max_extension_length,
        };

        let mut slots = BTreeMap::new();
        let mut monitor = MonitorState::default();
        for (index, line_config) in config.lines.iter().enumerate() {
            if !line_config.enable {
                info!("Line {} is disabled", index + 1);
                continue;
            }
            let opened = match devices.open(index, line_config) {
                Ok(opened) => opened,
                Err(e) => {
                    error!("Line {}: {}", index + 1, e);
                    continue;
                }
            };
            let line_config = Arc::new(line_config.clone());
            let (sender, events) = event_channel(Arc::clone(&wake));
            let line = Line::new(index, Arc::clone(&line_config), opened, events, &shared);
            monitor.last_known.insert(index, line.state());
            slots.insert(
                index,
                LineSlot {
                    line: Mutex::new(line),
                    sender,
                    config: line_config,
                },
            );
            info!("✓ Line {} ready", index + 1);
        }

        if slots.is_empty() {
            return Err(Error::device("No line could be opened"));
        }

        Ok(Self {
            slots,
            bindings,
            monitor: Mutex::new(monitor),
            wake,
        })
    }

    /// Notified whenever a line has something for the monitor
    pub fn wake(&self) -> Arc<Notify> {
        Arc::clone(&self.wake)
    }

    pub fn line_count(&self) -> usize {
        self.slots.len()
    }

    pub(super) async fn lock_monitor(&self) -> MutexGuard<'_, MonitorState> {
        self.monitor.lock().await
    }

    pub(super) fn lines(&self) -> impl Iterator<Item = (usize, &Mutex<Line>)> {
        self.slots.iter().map(|(index, slot)| (*index, &slot.line))
    }

    /// Start a reader task for every line with an event input device
    pub fn spawn_event_readers(&self, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        self.slots
            .values()
            .filter(|slot| !slot.config.event_input_device.is_empty())
            .map(|slot| {
                spawn_reader(
                    PathBuf::from(&slot.config.event_input_device),
                    slot.sender.clone(),
                    cancel.child_token(),
                )
            })
            .collect()
    }

    async fn owned_line(&self, handle: CallHandle) -> std::result::Result<MutexGuard<'_, Line>, CallError> {
        let index = self
            .bindings
            .get(&handle)
            .map(|entry| *entry.value())
            .ok_or(CallError::NoSuchCall(handle))?;
        let slot = self.slots.get(&index).ok_or(CallError::NoSuchCall(handle))?;
        let line = slot.line.lock().await;
        if line.owner() != Some(handle) {
            return Err(CallError::NoSuchCall(handle));
        }
        Ok(line)
    }

    // Host operations

    /// Reserve a line for an incoming call
    pub async fn request(&self, selector: &str, format: AudioFormat) -> std::result::Result<CallHandle, CallError> {
        if !format.is_supported() {
            warn!("Refusing call request in {} format", format);
            return Err(CallError::Unsupported(format!("format {}", format)));
        }
        let index = parse_line_selector(selector).ok_or_else(|| CallError::NoSuchLine(selector.to_string()))?;
        let slot = self
            .slots
            .get(&index)
            .ok_or_else(|| CallError::NoSuchLine(selector.to_string()))?;

        let _monitor = self.monitor.lock().await;
        let handle = slot.line.lock().await.accept_request()?;
        info!("Line {} reserved for call {}", index + 1, handle);
        self.wake.notify_one();
        Ok(handle)
    }

    /// Ring the line reserved for `handle`
    pub async fn ring(&self, handle: CallHandle, caller: &CallerId) -> std::result::Result<(), CallError> {
        self.owned_line(handle).await?.start_ringing(caller)?;
        self.wake.notify_one();
        Ok(())
    }

    pub async fn answer(&self, handle: CallHandle) -> std::result::Result<(), CallError> {
        self.owned_line(handle).await?.answer()?;
        self.wake.notify_one();
        Ok(())
    }

    pub async fn hangup(&self, handle: CallHandle) -> std::result::Result<(), CallError> {
        let _monitor = self.monitor.lock().await;
        self.owned_line(handle).await?.hangup();
        self.wake.notify_one();
        Ok(())
    }

    /// Start of a digit from the far end. Only the end of a digit is played.
    pub async fn send_digit_begin(&self, handle: CallHandle, _digit: Digit) -> std::result::Result<(), CallError> {
        self.owned_line(handle).await.map(|_| ())
    }

    pub async fn send_digit(&self, handle: CallHandle, digit: Digit, duration_ms: u32) -> std::result::Result<(), CallError> {
        self.owned_line(handle).await?.send_digit(digit, duration_ms)?;
        self.wake.notify_one();
        Ok(())
    }

    pub async fn read_audio(&self, handle: CallHandle) -> std::result::Result<Frame, CallError> {
        self.owned_line(handle).await?.read_audio()
    }

    pub async fn write_audio(
        &self,
        handle: CallHandle,
        format: AudioFormat,
        data: &[u8],
    ) -> std::result::Result<usize, CallError> {
        self.owned_line(handle).await?.write_audio(format, data)
    }

    pub async fn indicate(&self, handle: CallHandle, indication: Indication) -> std::result::Result<IndicateOutcome, CallError> {
        self.owned_line(handle).await?.indicate(indication)
    }

    /// The host replaced the call object bound to a line
    pub async fn rebind(&self, old: CallHandle, new: CallHandle) -> std::result::Result<(), CallError> {
        let _monitor = self.monitor.lock().await;
        if new != old && self.bindings.contains_key(&new) {
            warn!("Can't rebind call {} to {}: already bound to a line", old, new);
            return Err(CallError::Busy);
        }
        self.owned_line(old).await?.rebind(new);
        info!("Call {} rebound to {}", old, new);
        Ok(())
    }

    // Console

    fn slot_by_number(&self, number: usize) -> Result<&LineSlot> {
        number
            .checked_sub(1)
            .and_then(|index| self.slots.get(&index))
            .ok_or_else(|| Error::input(format!("No line {}", number)))
    }

    /// Inject a key press on a line, numbered from 1
    pub fn press(&self, number: usize, key: Key) -> Result<()> {
        let slot = self.slot_by_number(number)?;
        if !slot.sender.send(key.press()) {
            return Err(Error::invalid_state(format!("Line {} is disconnected", number)));
        }
        slot.sender.send(key.release());
        Ok(())
    }

    /// Inject a sequence of digit key presses
    pub fn dial(&self, number: usize, digits: &str) -> Result<()> {
        let keys = digits
            .chars()
            .map(|c| Digit::from_char(c).map(Key::Digit).ok_or_else(|| Error::parse(format!("Invalid digit '{}'", c))))
            .collect::<Result<Vec<_>>>()?;
        for key in keys {
            self.press(number, key)?;
        }
        Ok(())
    }

    pub async fn snapshot(&self) -> Vec<LineSnapshot> {
        let mut lines = Vec::with_capacity(self.slots.len());
        for slot in self.slots.values() {
            lines.push(slot.line.lock().await.snapshot());
        }
        lines
    }

    /// Hang up every call and release all devices
    pub async fn shutdown(&self) {
        let _monitor = self.monitor.lock().await;
        for slot in self.slots.values() {
            slot.line.lock().await.close();
        }
        self.wake.notify_one();
        info!("All lines closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::host::testing::RecordingHost;
    use crate::core::host::HangupCause;
    use crate::core::line::LineStatus;
    use crate::core::monitor::Monitor;
    use crate::interfaces::MemoryDevices;
    use tokio::task::JoinSet;
    use tokio::time::Instant;

    fn two_lines() -> FxsConfig {
        let mut config = FxsConfig::default_config();
        config.lines.push(LineConfig::new(1));
        config
    }

    fn build(config: &FxsConfig, host: RecordingHost) -> (Arc<LineRegistry>, Arc<RecordingHost>, MemoryDevices) {
        let host = Arc::new(host);
        let devices = MemoryDevices::new();
        let registry = LineRegistry::new(config, &devices, host.clone()).unwrap();
        (Arc::new(registry), host, devices)
    }

    async fn drain(registry: &Arc<LineRegistry>, config: &FxsConfig) {
        Monitor::new(Arc::clone(registry), &config.general)
            .run_once(Instant::now())
            .await;
    }

    #[test]
    fn test_line_selector() {
        assert_eq!(parse_line_selector("1"), Some(0));
        assert_eq!(parse_line_selector("12"), Some(11));
        assert_eq!(parse_line_selector("2/ring"), Some(1));
        assert_eq!(parse_line_selector("2a"), None);
        assert_eq!(parse_line_selector("0"), None);
        assert_eq!(parse_line_selector(""), None);
        assert_eq!(parse_line_selector("line1"), None);
    }

    #[tokio::test]
    async fn test_disabled_and_broken_lines_are_left_out() {
        let mut config = two_lines();
        config.lines[1].enable = false;
        let (registry, _, _) = build(&config, RecordingHost::default());
        assert_eq!(registry.line_count(), 1);
        assert!(registry.press(2, Key::HookOff).is_err());
    }

    #[tokio::test]
    async fn test_request_reserves_selected_line() {
        let config = two_lines();
        let (registry, _, _) = build(&config, RecordingHost::default());

        let handle = registry.request("2", AudioFormat::SignedLinear8k).await.unwrap();
        let lines = registry.snapshot().await;
        assert_eq!(lines[0].state, LineState::OnIdle);
        assert_eq!(lines[1].state, LineState::OnPreRinging);
        assert_eq!(lines[1].call, Some(handle));

        assert_eq!(
            registry.request("2", AudioFormat::SignedLinear8k).await,
            Err(CallError::Busy)
        );
        assert!(matches!(
            registry.request("1", AudioFormat::Ulaw).await,
            Err(CallError::Unsupported(_))
        ));
        assert!(matches!(
            registry.request("9", AudioFormat::SignedLinear8k).await,
            Err(CallError::NoSuchLine(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_handle_is_rejected() {
        let config = FxsConfig::default_config();
        let (registry, _, _) = build(&config, RecordingHost::default());
        let stranger = CallHandle::new();

        assert_eq!(registry.answer(stranger).await, Err(CallError::NoSuchCall(stranger)));
        assert_eq!(registry.hangup(stranger).await, Err(CallError::NoSuchCall(stranger)));
        assert_eq!(
            registry.write_audio(stranger, AudioFormat::SignedLinear8k, &[0, 0]).await,
            Err(CallError::NoSuchCall(stranger))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_incoming_call_answered_by_pickup() {
        let config = FxsConfig::default_config();
        let (registry, host, devices) = build(&config, RecordingHost::default());

        let handle = registry.request("1", AudioFormat::SignedLinear8k).await.unwrap();
        registry.ring(handle, &CallerId::default()).await.unwrap();
        assert!(registry.snapshot().await[0].ringing);

        registry.press(1, Key::HookOff).unwrap();
        drain(&registry, &config).await;

        let line = &registry.snapshot().await[0];
        assert_eq!(line.state, LineState::OffTalking);
        assert!(!line.ringing);
        assert_eq!(host.frames(), vec![Frame::Control(crate::core::host::Control::Answer)]);

        let voice = vec![3u8; 480];
        assert_eq!(
            registry.write_audio(handle, AudioFormat::SignedLinear8k, &voice).await,
            Ok(480)
        );
        assert!(devices.line(0).unwrap().playback.played().ends_with(&voice));

        registry.press(1, Key::HookOn).unwrap();
        drain(&registry, &config).await;
        assert_eq!(host.hangups(), vec![(handle, HangupCause::Normal)]);
        assert_eq!(registry.snapshot().await[0].state, LineState::OnIdle);
    }

    #[tokio::test]
    async fn test_rebind_moves_the_call() {
        let config = FxsConfig::default_config();
        let (registry, _, _) = build(&config, RecordingHost::default());

        let old = registry.request("1", AudioFormat::SignedLinear8k).await.unwrap();
        let new = CallHandle::new();
        registry.rebind(old, new).await.unwrap();

        assert_eq!(
            registry.ring(old, &CallerId::default()).await,
            Err(CallError::NoSuchCall(old))
        );
        registry.ring(new, &CallerId::default()).await.unwrap();
        assert_eq!(registry.snapshot().await[0].call, Some(new));
    }

    #[tokio::test]
    async fn test_rebind_onto_bound_handle_is_refused() {
        let config = two_lines();
        let (registry, _, _) = build(&config, RecordingHost::default());

        let first = registry.request("1", AudioFormat::SignedLinear8k).await.unwrap();
        let second = registry.request("2", AudioFormat::SignedLinear8k).await.unwrap();
        assert_eq!(registry.rebind(first, second).await, Err(CallError::Busy));

        let lines = registry.snapshot().await;
        assert_eq!(lines[0].call, Some(first));
        assert_eq!(lines[1].call, Some(second));

        registry.hangup(second).await.unwrap();
        let lines = registry.snapshot().await;
        assert_eq!(lines[0].state, LineState::OnPreRinging);
        assert_eq!(lines[1].state, LineState::OnIdle);
        assert_eq!(lines[1].call, None);

        registry.rebind(first, first).await.unwrap();
        registry.ring(first, &CallerId::default()).await.unwrap();
        assert!(registry.snapshot().await[0].ringing);
    }

    #[tokio::test]
    async fn test_host_hangup_while_ringing_returns_to_idle() {
        let config = FxsConfig::default_config();
        let (registry, host, devices) = build(&config, RecordingHost::default());

        let handle = registry.request("1", AudioFormat::SignedLinear8k).await.unwrap();
        registry.ring(handle, &CallerId::default()).await.unwrap();
        registry.hangup(handle).await.unwrap();

        let line = &registry.snapshot().await[0];
        assert_eq!(line.state, LineState::OnIdle);
        assert!(!line.ringing);
        assert_eq!(devices.line(0).unwrap().ringer.events().len(), 2);
        assert!(host.hangups().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_operations_keep_lines_consistent() {
        let mut config = two_lines();
        for line in config.lines.iter_mut() {
            line.monitor_dialing = false;
        }
        let (registry, host, _) = build(&config, RecordingHost::default());

        registry.press(1, Key::HookOff).unwrap();
        drain(&registry, &config).await;
        let handle = host.started()[0].handle;
        registry.answer(handle).await.unwrap();

        let mut tasks = JoinSet::new();
        for i in 0..32u8 {
            let registry = Arc::clone(&registry);
            tasks.spawn(async move {
                let _ = registry.write_audio(handle, AudioFormat::SignedLinear8k, &[i; 64]).await;
                let _ = registry.read_audio(handle).await;
                let _ = registry.request("2", AudioFormat::SignedLinear8k).await;
                let _ = registry.indicate(handle, Indication::Progress).await;
            });
        }
        let hangup = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.hangup(handle).await })
        };
        while let Some(result) = tasks.join_next().await {
            result.unwrap();
        }
        hangup.await.unwrap().unwrap();
        drain(&registry, &config).await;

        for line in registry.snapshot().await {
            match line.state {
                LineState::OnIdle => assert_eq!(line.status, LineStatus::OnHook),
                LineState::OnPreRinging => {
                    assert_eq!(line.status, LineStatus::OnHook);
                    assert!(line.call.is_some());
                }
                LineState::OffNoService => {
                    assert_eq!(line.status, LineStatus::OffHook);
                    assert!(line.call.is_none());
                }
                other => panic!("unexpected state {}", other),
            }
        }
        assert_eq!(registry.snapshot().await[0].state, LineState::OffNoService);
        assert_eq!(registry.snapshot().await[1].state, LineState::OnPreRinging);
    }

    #[tokio::test]
    async fn test_dial_rejects_invalid_digits() {
        let config = FxsConfig::default_config();
        let (registry, _, _) = build(&config, RecordingHost::default());
        assert!(registry.dial(1, "12x").is_err());
        assert!(registry.dial(1, "12*#").is_ok());
        assert!(registry.dial(3, "1").is_err());
    }

    #[tokio::test]
    async fn test_shutdown_hangs_up_calls() {
        let config = FxsConfig::default_config();
        let (registry, host, _) = build(&config, RecordingHost::default());
        let handle = registry.request("1", AudioFormat::SignedLinear8k).await.unwrap();

        registry.shutdown().await;

        assert_eq!(host.hangups(), vec![(handle, HangupCause::Disconnected)]);
        assert_eq!(registry.snapshot().await[0].state, LineState::Disconnected);
        assert!(registry.press(1, Key::HookOff).is_err());
    }
}

//! Per-line state machine
//!
//! A [`Line`] is only reachable through `&mut`, handed out by the registry
//! from the line's mutex. Every method here therefore runs with the line lock
//! held; no method blocks or waits.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::LineConfig;
use crate::core::audio::{ActiveTone, CaptureAssembler, PlaybackPacer, ToneProgress, PERIOD_MS};
use crate::core::dialing::Dialer;
use crate::core::host::{
    AudioFormat, CallError, CallHandle, CallHost, CallerId, Control, Frame, HangupCause, IndicateOutcome,
    Indication, NewCall,
};
use crate::interfaces::pcm::{start_stream, stop_stream};
use crate::interfaces::{EventQueue, EventSink, LineDevices, PcmDevice, SourceMessage};
use crate::protocols::dtmf::{digits_to_string, Digit, DtmfPacer, DtmfSignal};
use crate::protocols::input::{InputEvent, Key};
use crate::protocols::tones::ToneId;

/// Service interval while audio or a tone is flowing
pub const BUSY_PERIOD: Duration = Duration::from_millis(PERIOD_MS as u64);
/// Time spent in no-service before the line drops back on hook by itself
pub const AUTO_HOOK_ON_DELAY: Duration = Duration::from_millis(10_000);
pub const RING_ON: Duration = Duration::from_millis(2000);
pub const RING_OFF: Duration = Duration::from_millis(4000);

const DTMF_QUEUE_CAPACITY: usize = 32;

/// Physical hook condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LineStatus {
    Disconnected,
    OnHook,
    OffHook,
}

impl fmt::Display for LineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LineStatus::Disconnected => write!(f, "disconnected"),
            LineStatus::OnHook => write!(f, "on hook"),
            LineStatus::OffHook => write!(f, "off hook"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum LineState {
    Disconnected,
    OnIdle,
    /// A host request reserved the line, ringing has not started
    OnPreRinging,
    OnRinging,
    OffDialing,
    OffWaitingAnswer,
    OffTalking,
    OffNoService,
}

impl LineState {
    pub const ALL: [LineState; 8] = [
        LineState::Disconnected,
        LineState::OnIdle,
        LineState::OnPreRinging,
        LineState::OnRinging,
        LineState::OffDialing,
        LineState::OffWaitingAnswer,
        LineState::OffTalking,
        LineState::OffNoService,
    ];

    /// States where audio flows between the line and its call
    pub fn is_talking(self) -> bool {
        matches!(self, LineState::OffWaitingAnswer | LineState::OffTalking)
    }
}

impl fmt::Display for LineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LineState::Disconnected => "disconnected",
            LineState::OnIdle => "on hook, idle",
            LineState::OnPreRinging => "on hook, pre-ringing",
            LineState::OnRinging => "on hook, ringing",
            LineState::OffDialing => "off hook, dialing",
            LineState::OffWaitingAnswer => "off hook, waiting answer",
            LineState::OffTalking => "off hook, talking",
            LineState::OffNoService => "off hook, no service",
        };
        write!(f, "{}", name)
    }
}

/// Why a state change happens
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Cause {
    Disconnected,
    HostHangup,
    HostRequest,
    HostCall,
    HostAnswer,
    InternalError,
    OffHook,
    OnHook,
    ExtensionFound,
    NoExtension,
}

impl Cause {
    pub const ALL: [Cause; 10] = [
        Cause::Disconnected,
        Cause::HostHangup,
        Cause::HostRequest,
        Cause::HostCall,
        Cause::HostAnswer,
        Cause::InternalError,
        Cause::OffHook,
        Cause::OnHook,
        Cause::ExtensionFound,
        Cause::NoExtension,
    ];
}

impl fmt::Display for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Cause::Disconnected => "disconnected",
            Cause::HostHangup => "host hangup",
            Cause::HostRequest => "host request",
            Cause::HostCall => "host call",
            Cause::HostAnswer => "host answer",
            Cause::InternalError => "internal error",
            Cause::OffHook => "off hook",
            Cause::OnHook => "on hook",
            Cause::ExtensionFound => "extension found",
            Cause::NoExtension => "no extension",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("state '{to}' does not fit status '{status}' (owner: {owner_present}, monitored: {monitored})")]
    Inconsistent {
        to: LineState,
        status: LineStatus,
        owner_present: bool,
        monitored: bool,
    },

    #[error("'{from}' -> '{to}' is not allowed for cause '{cause}'")]
    Forbidden { from: LineState, to: LineState, cause: Cause },
}

/// Check a state change against the hook status, the call binding and the
/// table of allowed causes.
pub fn check_transition(
    from: LineState,
    to: LineState,
    cause: Cause,
    status: LineStatus,
    owner_present: bool,
    monitored: bool,
) -> Result<(), TransitionError> {
    let consistent = match to {
        LineState::Disconnected => status == LineStatus::Disconnected && !owner_present,
        LineState::OnIdle => status == LineStatus::OnHook && !owner_present,
        LineState::OnPreRinging | LineState::OnRinging => status == LineStatus::OnHook && owner_present,
        LineState::OffDialing => status == LineStatus::OffHook && !owner_present && monitored,
        LineState::OffWaitingAnswer | LineState::OffTalking => status == LineStatus::OffHook && owner_present,
        LineState::OffNoService => status == LineStatus::OffHook && !owner_present,
    };
    if !consistent {
        return Err(TransitionError::Inconsistent {
            to,
            status,
            owner_present,
            monitored,
        });
    }

    let allowed = match to {
        LineState::Disconnected => cause == Cause::Disconnected,
        LineState::OnIdle => matches!(cause, Cause::HostHangup | Cause::InternalError | Cause::OnHook),
        LineState::OnPreRinging => from == LineState::OnIdle && cause == Cause::HostRequest,
        LineState::OnRinging => from == LineState::OnPreRinging && cause == Cause::HostCall,
        LineState::OffDialing => from == LineState::OnIdle && cause == Cause::OffHook,
        LineState::OffWaitingAnswer => {
            (from == LineState::OnIdle && cause == Cause::OffHook && !monitored)
                || (from == LineState::OffDialing && cause == Cause::ExtensionFound)
        }
        LineState::OffTalking => {
            (from == LineState::OnRinging && cause == Cause::OffHook)
                || (from == LineState::OffWaitingAnswer && cause == Cause::HostAnswer)
        }
        LineState::OffNoService => {
            (from == LineState::OffDialing && cause == Cause::NoExtension)
                || matches!(cause, Cause::HostHangup | Cause::InternalError)
        }
    };
    if !allowed {
        return Err(TransitionError::Forbidden { from, to, cause });
    }
    Ok(())
}

/// Earliest time the monitor must look at the lines again
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NextWake {
    timeout: Duration,
}

impl NextWake {
    pub fn new(idle: Duration) -> Self {
        Self { timeout: idle }
    }

    /// Ask to be woken within `delay`
    pub fn within(&mut self, delay: Duration) {
        let delay = delay.max(Duration::from_millis(1));
        if delay < self.timeout {
            self.timeout = delay;
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// Collaborators every line shares with the registry
#[derive(Clone)]
pub struct LineShared {
    pub host: Arc<dyn CallHost>,
    /// Call handle to line index, updated together with `Line::owner`
    pub bindings: Arc<DashMap<CallHandle, usize>>,
    pub max_extension_length: usize,
}

/// Point-in-time view of a line for the console
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LineSnapshot {
    pub line: usize,
    pub status: LineStatus,
    pub state: LineState,
    pub call: Option<CallHandle>,
    pub tone: Option<String>,
    pub muted: bool,
    pub ringing: bool,
    pub dialed: String,
}

pub struct Line {
    index: usize,
    pub(super) config: Arc<LineConfig>,
    pub(super) host: Arc<dyn CallHost>,
    bindings: Arc<DashMap<CallHandle, usize>>,
    status: LineStatus,
    pub(super) state: LineState,
    owner: Option<CallHandle>,
    capture_device: Option<Box<dyn PcmDevice>>,
    playback_device: Option<Box<dyn PcmDevice>>,
    ringer: Option<Box<dyn EventSink>>,
    events: EventQueue,
    playback: PlaybackPacer,
    capture: CaptureAssembler,
    capture_muted: bool,
    tone: Option<ActiveTone>,
    dtmf: DtmfPacer,
    pub(super) dialer: Dialer,
    buzzer_on: bool,
    /// Reference point for dialing timeouts, ring cadence and auto on-hook
    pub(super) tv_wait: Instant,
}

impl Line {
    pub fn new(index: usize, config: Arc<LineConfig>, devices: LineDevices, events: EventQueue, shared: &LineShared) -> Self {
        Self {
            index,
            config,
            host: Arc::clone(&shared.host),
            bindings: Arc::clone(&shared.bindings),
            status: LineStatus::OnHook,
            state: LineState::OnIdle,
            owner: None,
            capture_device: Some(devices.capture),
            playback_device: Some(devices.playback),
            ringer: devices.ringer,
            events,
            playback: PlaybackPacer::default(),
            capture: CaptureAssembler::default(),
            capture_muted: true,
            tone: None,
            dtmf: DtmfPacer::new(DTMF_QUEUE_CAPACITY),
            dialer: Dialer::new(shared.max_extension_length),
            buzzer_on: false,
            tv_wait: Instant::now(),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// 1-based number used in logs and on the console
    pub fn number(&self) -> usize {
        self.index + 1
    }

    pub fn status(&self) -> LineStatus {
        self.status
    }

    pub fn state(&self) -> LineState {
        self.state
    }

    pub fn owner(&self) -> Option<CallHandle> {
        self.owner
    }

    pub fn is_connected(&self) -> bool {
        self.state != LineState::Disconnected
    }

    pub fn is_muted(&self) -> bool {
        self.capture_muted
    }

    pub fn tone(&self) -> Option<ToneId> {
        self.tone.as_ref().map(ActiveTone::id)
    }

    pub fn is_ringing(&self) -> bool {
        self.buzzer_on
    }

    pub fn snapshot(&self) -> LineSnapshot {
        LineSnapshot {
            line: self.number(),
            status: self.status,
            state: self.state,
            call: self.owner,
            tone: self.tone().map(|tone| tone.to_string()),
            muted: self.capture_muted,
            ringing: self.buzzer_on,
            dialed: digits_to_string(self.dialer.digits()),
        }
    }

    // State machine

    pub(super) fn set_state(&mut self, to: LineState, cause: Cause) {
        let monitored = self.config.monitor_dialing;
        match check_transition(self.state, to, cause, self.status, self.owner.is_some(), monitored) {
            Ok(()) => self.enter_state(to, cause),
            Err(e) => {
                error!("Line {}: {}", self.number(), e);
                debug_assert!(false, "line {}: {}", self.number(), e);
                self.restore_consistency();
            }
        }
    }

    /// Release the call and fall into the resting state of the current status
    fn restore_consistency(&mut self) {
        if let Some(handle) = self.unbind_owner() {
            if let Err(e) = self.host.queue_hangup(handle, HangupCause::Failure) {
                warn!("Line {}: can't hang up call {}: {}", self.number(), handle, e);
            }
        }
        let (to, cause) = match self.status {
            LineStatus::Disconnected => (LineState::Disconnected, Cause::Disconnected),
            LineStatus::OnHook => (LineState::OnIdle, Cause::InternalError),
            LineStatus::OffHook => (LineState::OffNoService, Cause::InternalError),
        };
        warn!("Line {}: forced into '{}'", self.number(), to);
        self.enter_state(to, cause);
    }

    fn enter_state(&mut self, to: LineState, cause: Cause) {
        let from = self.state;

        if to != from {
            if to.is_talking() && !from.is_talking() {
                self.capture_muted = false;
                if let Some(device) = self.capture_device.as_deref_mut() {
                    start_stream(device);
                }
                self.capture.reset();
            } else if to == LineState::OnRinging {
                self.set_buzzer(true);
            }

            if from.is_talking() && !to.is_talking() {
                self.capture_muted = true;
                if let Some(device) = self.capture_device.as_deref_mut() {
                    stop_stream(device);
                }
                if self.tone.is_none() {
                    if let Some(device) = self.playback_device.as_deref_mut() {
                        stop_stream(device);
                    }
                    self.playback.reset();
                }
            } else if from == LineState::OnRinging {
                self.set_buzzer(false);
            }
        }

        match to {
            LineState::Disconnected => {
                self.stop_tone(from);
                self.reset_call_state();
                self.capture_muted = true;
                self.playback.reset();
                self.capture.reset();
            }
            LineState::OnIdle => {
                self.stop_tone(from);
                self.reset_call_state();
                self.capture_muted = true;
                self.capture.reset();
            }
            LineState::OffDialing => {
                self.tone = Some(ActiveTone::new(ToneId::Dial, None));
                self.reset_call_state();
                self.dialer.request_search();
                self.tv_wait = Instant::now();
            }
            LineState::OffWaitingAnswer => {
                self.stop_tone(from);
                self.dialer.clear();
            }
            LineState::OffTalking => self.stop_tone(from),
            LineState::OffNoService => {
                let tone = if cause == Cause::HostHangup { ToneId::Busy } else { ToneId::Invalid };
                self.tone = Some(ActiveTone::new(tone, None));
                self.reset_call_state();
                self.capture_muted = true;
                self.playback.reset();
                self.capture.reset();
                self.tv_wait = Instant::now();
            }
            LineState::OnPreRinging | LineState::OnRinging => {}
        }

        info!("Line {}: '{}' -> '{}' ({})", self.number(), from, to, cause);
        self.state = to;

        if self.tone.is_some() {
            self.write_tone_data();
        }
    }

    fn reset_call_state(&mut self) {
        self.dialer.clear();
        self.dtmf.reset();
    }

    // Owner binding

    fn bind_owner(&mut self, handle: CallHandle) {
        self.bindings.insert(handle, self.index);
        self.owner = Some(handle);
    }

    fn unbind_owner(&mut self) -> Option<CallHandle> {
        let handle = self.owner.take()?;
        self.bindings.remove(&handle);
        Some(handle)
    }

    /// Move the line's call binding onto a new handle
    pub fn rebind(&mut self, new_handle: CallHandle) {
        if let Some(old) = self.unbind_owner() {
            debug!("Line {}: call {} is now {}", self.number(), old, new_handle);
        }
        self.bind_owner(new_handle);
    }

    /// Drop the call binding and settle into the state matching the hook
    fn unlink(&mut self, cause: Cause) -> Option<CallHandle> {
        let handle = self.unbind_owner();
        match self.status {
            LineStatus::OffHook => self.set_state(LineState::OffNoService, cause),
            LineStatus::OnHook => self.set_state(LineState::OnIdle, cause),
            LineStatus::Disconnected => self.set_state(LineState::Disconnected, Cause::Disconnected),
        }
        handle
    }

    /// Line-initiated end of call
    fn queue_hangup(&mut self, cause: Cause) {
        let Some(handle) = self.unlink(cause) else {
            return;
        };
        let reason = match cause {
            Cause::OnHook => HangupCause::Normal,
            Cause::Disconnected => HangupCause::Disconnected,
            _ => HangupCause::Failure,
        };
        if let Err(e) = self.host.queue_hangup(handle, reason) {
            warn!("Line {}: can't queue hangup of call {}: {}", self.number(), handle, e);
        }
    }

    /// Open an outgoing call towards the dialed extension
    pub(super) fn open_call(&mut self, cause: Cause) {
        let extension = self.dialer.extension();
        let handle = CallHandle::new();
        self.bind_owner(handle);
        self.set_state(LineState::OffWaitingAnswer, cause);

        let call = NewCall {
            handle,
            line: self.index,
            context: self.config.context.clone(),
            extension,
            caller: self.caller_id(),
            language: self.config.language.clone(),
        };
        info!(
            "📞 Line {}: calling '{}' in context '{}'",
            self.number(),
            call.extension,
            call.context
        );
        if let Err(e) = self.host.start_call(call) {
            error!("Line {}: unable to start call: {}", self.number(), e);
            self.unlink(Cause::InternalError);
        }
    }

    pub(super) fn caller_id(&self) -> CallerId {
        let non_empty = |value: &str| (!value.is_empty()).then(|| value.to_string());
        CallerId {
            name: non_empty(&self.config.caller_id_name),
            number: non_empty(&self.config.caller_id_number),
        }
    }

    // Tones and ringer

    /// Start or stop a tone. A tone with a duration stops by itself.
    pub(super) fn set_tone(&mut self, tone: Option<ActiveTone>) {
        match tone {
            Some(tone) => {
                debug!("Line {}: playing {} tone", self.number(), tone.id());
                self.tone = Some(tone);
                self.write_tone_data();
            }
            None => {
                let state = self.state;
                self.stop_tone(state);
            }
        }
    }

    fn stop_tone(&mut self, during: LineState) {
        self.tone = None;
        if during.is_talking() {
            self.playback.keep_partial();
        } else {
            if let Some(device) = self.playback_device.as_deref_mut() {
                stop_stream(device);
            }
            self.playback.reset();
        }
    }

    fn write_tone_data(&mut self) {
        let (Some(device), Some(tone)) = (self.playback_device.as_deref_mut(), self.tone.as_mut()) else {
            return;
        };
        match self.playback.refill_tone(device, tone) {
            Ok(ToneProgress::Playing) => {}
            Ok(ToneProgress::Finished) => self.set_tone(None),
            Err(e) => {
                error!("Line {}: tone playback failed: {}", self.number(), e);
                self.critical_error();
            }
        }
    }

    fn set_buzzer(&mut self, on: bool) {
        if let Some(ringer) = self.ringer.as_mut() {
            if let Err(e) = ringer.emit(InputEvent::bell(on)) {
                warn!("Line {}: can't switch ringer {}: {}", self.index + 1, if on { "on" } else { "off" }, e);
            }
        }
        self.buzzer_on = on;
        self.tv_wait = Instant::now();
        debug!("Line {}: ringer {}", self.number(), if on { "on" } else { "off" });
    }

    // Failure

    /// The line lost a device. Force it out of service for good.
    pub fn critical_error(&mut self) {
        if self.status == LineStatus::Disconnected && self.state == LineState::Disconnected {
            return;
        }
        error!("Line {}: critical error, disconnecting", self.number());
        self.close();
    }

    /// Hang up any call, release the devices and leave the line disconnected
    pub fn close(&mut self) {
        if self.status == LineStatus::Disconnected && self.state == LineState::Disconnected {
            return;
        }
        self.status = LineStatus::Disconnected;
        if self.owner.is_some() {
            self.queue_hangup(Cause::Disconnected);
        } else {
            self.set_state(LineState::Disconnected, Cause::Disconnected);
        }
        self.release_devices();
    }

    fn release_devices(&mut self) {
        self.capture_device = None;
        self.playback_device = None;
        self.ringer = None;
        self.events.close();
        info!("Line {}: devices released", self.number());
    }

    // Local events

    /// Drain queued input events in arrival order
    pub fn drain_events(&mut self, now: Instant, wake: &mut NextWake) {
        while let Some(message) = self.events.try_next() {
            match message {
                SourceMessage::Event(event) => self.handle_event(event, now, wake),
                SourceMessage::Failed(reason) => {
                    error!("Line {}: {}", self.number(), reason);
                    self.critical_error();
                }
            }
            if !self.is_connected() {
                return;
            }
        }
    }

    pub fn handle_event(&mut self, event: InputEvent, now: Instant, wake: &mut NextWake) {
        if !event.is_key_press() {
            return;
        }
        let Some(key) = Key::from_code(event.code) else {
            debug!("Line {}: key code {} ignored", self.number(), event.code);
            return;
        };

        match key {
            Key::HookOff => {
                if self.status == LineStatus::OnHook {
                    self.handle_status_change(LineStatus::OffHook, wake);
                }
            }
            _ if self.status != LineStatus::OffHook => {
                debug!("Line {}: {:?} ignored while {}", self.number(), key, self.status);
            }
            Key::HookOn => self.handle_status_change(LineStatus::OnHook, wake),
            Key::Mute => self.toggle_mute(),
            Key::Digit(digit) => self.handle_digit(digit, now, wake),
        }
    }

    pub(super) fn handle_status_change(&mut self, status: LineStatus, wake: &mut NextWake) {
        info!("Line {}: {}", self.number(), status);
        self.status = status;

        match status {
            LineStatus::OffHook => match self.state {
                LineState::OnRinging => {
                    self.set_state(LineState::OffTalking, Cause::OffHook);
                    let answered = self
                        .owner
                        .map(|handle| self.host.queue_frame(handle, Frame::Control(Control::Answer)));
                    match answered {
                        Some(Ok(())) => wake.within(BUSY_PERIOD),
                        Some(Err(e)) => {
                            error!("Line {}: can't answer call: {}", self.number(), e);
                            self.queue_hangup(Cause::InternalError);
                        }
                        None => {}
                    }
                }
                LineState::OnPreRinging => {
                    warn!("Line {}: picked up before ringing started", self.number());
                    self.queue_hangup(Cause::InternalError);
                }
                LineState::OnIdle => {
                    if self.config.monitor_dialing {
                        self.set_state(LineState::OffDialing, Cause::OffHook);
                    } else {
                        self.dialer.clear();
                        self.open_call(Cause::OffHook);
                    }
                }
                other => warn!("Line {}: off hook in unexpected state '{}'", self.number(), other),
            },
            LineStatus::OnHook => {
                if self.owner.is_some() {
                    self.queue_hangup(Cause::OnHook);
                } else {
                    self.set_state(LineState::OnIdle, Cause::OnHook);
                }
            }
            LineStatus::Disconnected => self.critical_error(),
        }
    }

    fn toggle_mute(&mut self) {
        if !self.state.is_talking() {
            debug!("Line {}: mute ignored in '{}'", self.number(), self.state);
            return;
        }
        self.capture_muted = !self.capture_muted;
        if let Some(device) = self.capture_device.as_deref_mut() {
            if self.capture_muted {
                stop_stream(device);
            } else {
                start_stream(device);
            }
        }
        self.capture.reset();
        info!(
            "Line {}: microphone {}",
            self.number(),
            if self.capture_muted { "muted" } else { "unmuted" }
        );
    }

    /// Queue an in-call digit for the host
    pub(super) fn queue_in_call_digit(&mut self, digit: Digit) {
        self.dtmf.push(digit);
    }

    // Periodic work

    /// Everything the monitor does for a line on each pass
    pub fn service(&mut self, now: Instant, wake: &mut NextWake) {
        match self.state {
            LineState::OffTalking | LineState::OffWaitingAnswer => {
                self.try_send_dtmf(now, wake);
                self.pump_capture();
                wake.within(BUSY_PERIOD);
            }
            LineState::OffDialing => self.search_extension(now, false, wake),
            LineState::OffNoService => {
                let elapsed = now.saturating_duration_since(self.tv_wait);
                if elapsed >= AUTO_HOOK_ON_DELAY {
                    info!("Line {}: no service for too long, back on hook", self.number());
                    self.handle_status_change(LineStatus::OnHook, wake);
                } else {
                    wake.within(AUTO_HOOK_ON_DELAY - elapsed);
                }
            }
            LineState::OnRinging => {
                let elapsed = now.saturating_duration_since(self.tv_wait);
                let period = if self.buzzer_on { RING_ON } else { RING_OFF };
                if elapsed >= period {
                    self.set_buzzer(!self.buzzer_on);
                    wake.within(if self.buzzer_on { RING_ON } else { RING_OFF });
                } else {
                    wake.within(period - elapsed);
                }
            }
            LineState::Disconnected | LineState::OnIdle | LineState::OnPreRinging => {}
        }

        if self.tone.is_some() {
            self.write_tone_data();
            wake.within(BUSY_PERIOD);
        }
    }

    fn try_send_dtmf(&mut self, now: Instant, wake: &mut NextWake) {
        let Some(handle) = self.owner else {
            return;
        };
        let host = &self.host;
        let next = self.dtmf.poll(now, |signal| {
            let frame = match signal {
                DtmfSignal::Null => Frame::Null,
                DtmfSignal::Digit(digit) => Frame::Dtmf(digit),
            };
            host.queue_frame(handle, frame).is_ok()
        });
        if let Some(delay) = next {
            wake.within(delay);
        }
    }

    /// Hand complete captured periods to the call
    fn pump_capture(&mut self) {
        if self.capture_muted {
            return;
        }
        let (Some(handle), Some(device)) = (self.owner, self.capture_device.as_deref_mut()) else {
            return;
        };
        let host = &self.host;
        let number = self.index + 1;
        let pumped = self.capture.pump(device, |frame| match host.queue_frame(handle, Frame::Voice(frame)) {
            Ok(()) => true,
            Err(e) => {
                warn!("Line {}: can't queue voice frame: {}", number, e);
                false
            }
        });
        if let Err(e) = pumped {
            error!("Line {}: capture failed: {}", number, e);
            self.critical_error();
        }
    }

    // Host operations. The registry checks the caller owns the line.

    /// Reserve the line for an incoming call
    pub fn accept_request(&mut self) -> Result<CallHandle, CallError> {
        if self.owner.is_some() || self.status != LineStatus::OnHook {
            info!("Line {} is busy", self.number());
            return Err(CallError::Busy);
        }
        let handle = CallHandle::new();
        self.bind_owner(handle);
        self.set_state(LineState::OnPreRinging, Cause::HostRequest);
        Ok(handle)
    }

    pub fn start_ringing(&mut self, caller: &CallerId) -> Result<(), CallError> {
        if self.status != LineStatus::OnHook {
            info!("Line {} is busy", self.number());
            return Err(CallError::Busy);
        }
        if self.state != LineState::OnPreRinging {
            return Err(CallError::InvalidState(format!("can't ring line {} in '{}'", self.number(), self.state)));
        }
        info!("🔔 Line {}: ringing, call from {}", self.number(), caller);
        self.set_state(LineState::OnRinging, Cause::HostCall);
        Ok(())
    }

    pub fn answer(&mut self) -> Result<(), CallError> {
        match self.state {
            LineState::OffWaitingAnswer => {
                self.set_state(LineState::OffTalking, Cause::HostAnswer);
                Ok(())
            }
            LineState::OffTalking => Ok(()),
            other => {
                warn!("Line {}: answer in '{}'", self.number(), other);
                Err(CallError::InvalidState(format!("can't answer in '{}'", other)))
            }
        }
    }

    /// The host ended the call
    pub fn hangup(&mut self) {
        info!("Line {}: call hung up by host", self.number());
        self.unlink(Cause::HostHangup);
    }

    /// Play a digit to the handset. A zero duration plays until replaced.
    pub fn send_digit(&mut self, digit: Digit, duration_ms: u32) -> Result<(), CallError> {
        if !self.state.is_talking() {
            warn!("Line {}: digit '{}' while not talking", self.number(), digit);
            return Err(CallError::InvalidState(format!("no audio path in '{}'", self.state)));
        }
        let duration = (duration_ms > 0).then_some(duration_ms);
        self.set_tone(Some(ActiveTone::new(ToneId::Dtmf(digit), duration)));
        Ok(())
    }

    /// Next captured period, or [`Frame::Null`] when none is complete
    pub fn read_audio(&mut self) -> Result<Frame, CallError> {
        if !self.state.is_talking() {
            warn!("Line {}: audio read in '{}'", self.number(), self.state);
            return Ok(Frame::Null);
        }
        if self.capture_muted {
            return Ok(Frame::Null);
        }
        let Some(device) = self.capture_device.as_deref_mut() else {
            return Ok(Frame::Null);
        };
        match self.capture.read_frame(device) {
            Ok(Some(frame)) => Ok(Frame::Voice(frame)),
            Ok(None) => Ok(Frame::Null),
            Err(e) => {
                error!("Line {}: capture failed: {}", self.number(), e);
                self.critical_error();
                Ok(Frame::Null)
            }
        }
    }

    /// Play voice from the call.
    ///
    /// Returns the number of bytes accepted. Nothing is accepted while a tone
    /// is playing.
    pub fn write_audio(&mut self, format: AudioFormat, data: &[u8]) -> Result<usize, CallError> {
        if !format.is_supported() {
            warn!("Line {}: can't play {} audio", self.number(), format);
            return Err(CallError::Format(format));
        }
        if data.is_empty() {
            return Ok(0);
        }
        if !self.state.is_talking() {
            warn!("Line {}: audio written in '{}'", self.number(), self.state);
            return Err(CallError::InvalidState(format!("no audio path in '{}'", self.state)));
        }

        let mut accepted = 0;
        if self.tone.is_some() {
            self.write_tone_data();
        } else if let Some(device) = self.playback_device.as_deref_mut() {
            match self.playback.write_voice(device, data) {
                Ok(count) => {
                    if count < data.len() {
                        warn!("Line {}: only {} of {} bytes accepted", self.number(), count, data.len());
                    }
                    accepted = count;
                }
                Err(e) => {
                    error!("Line {}: playback failed: {}", self.number(), e);
                    self.critical_error();
                    return Err(CallError::InvalidState(format!("line {} disconnected", self.number())));
                }
            }
        }

        self.pump_capture();
        Ok(accepted)
    }

    pub fn indicate(&mut self, indication: Indication) -> Result<IndicateOutcome, CallError> {
        if !self.state.is_talking() {
            warn!("Line {}: {:?} indication in '{}'", self.number(), indication, self.state);
            return Err(CallError::InvalidState(format!("can't indicate in '{}'", self.state)));
        }
        match indication {
            Indication::Busy | Indication::Congestion | Indication::Ringing | Indication::Incomplete => {
                Ok(IndicateOutcome::InBand)
            }
            Indication::Progress | Indication::Proceeding => Ok(IndicateOutcome::Handled),
            Indication::Hold | Indication::Unhold => {
                let control = if indication == Indication::Hold {
                    Control::MusicOnHold {
                        class: self.config.moh_interpret.clone(),
                    }
                } else {
                    Control::StopMusicOnHold
                };
                if let Some(handle) = self.owner {
                    self.host.queue_frame(handle, Frame::Control(control))?;
                }
                Ok(IndicateOutcome::Handled)
            }
        }
    }
}

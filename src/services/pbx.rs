//! In-process call host
//!
//! [`ChannelHost`] resolves extensions against the local [`Dialplan`] and
//! turns everything the lines queue into [`PbxEvent`]s. An application task
//! consumes those events and drives calls back through the registry; the
//! bundled one answers every call and echoes its audio.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::host::{
    AudioFormat, CallError, CallHandle, CallHost, CallerId, Frame, HangupCause, MatchOutcome, NewCall,
};
use crate::core::registry::LineRegistry;
use crate::services::dialplan::Dialplan;

/// Length of a digit echoed back to the handset
const ECHO_DIGIT_MS: u32 = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PbxEvent {
    CallStarted(NewCall),
    Frame { handle: CallHandle, frame: Frame },
    Hangup { handle: CallHandle, cause: HangupCause },
}

#[derive(Debug, Clone)]
pub struct CallRecord {
    pub line: usize,
    pub extension: String,
    pub started_at: DateTime<Utc>,
}

pub struct ChannelHost {
    dialplan: Dialplan,
    calls: Arc<DashMap<CallHandle, CallRecord>>,
    event_tx: mpsc::UnboundedSender<PbxEvent>,
    event_rx: Option<mpsc::UnboundedReceiver<PbxEvent>>,
}

impl ChannelHost {
    pub fn new(dialplan: Dialplan) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            dialplan,
            calls: Arc::new(DashMap::new()),
            event_tx,
            event_rx: Some(event_rx),
        }
    }

    pub fn take_event_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<PbxEvent>> {
        self.event_rx.take()
    }

    /// Track a call the host placed towards a line
    pub fn register_incoming(&self, handle: CallHandle, line: usize) {
        self.calls.insert(
            handle,
            CallRecord {
                line,
                extension: format!("line {}", line + 1),
                started_at: Utc::now(),
            },
        );
    }

    /// Stop tracking a call ended by the host
    pub fn forget(&self, handle: CallHandle) -> Option<CallRecord> {
        self.calls.remove(&handle).map(|(_, record)| record)
    }

    pub fn active_calls(&self) -> Vec<(CallHandle, CallRecord)> {
        self.calls
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }

    fn publish(&self, event: PbxEvent) -> Result<(), CallError> {
        self.event_tx
            .send(event)
            .map_err(|_| CallError::InvalidState("call host stopped".to_string()))
    }
}

impl CallHost for ChannelHost {
    fn lookup_extension(&self, context: &str, digits: &str, caller: &CallerId) -> MatchOutcome {
        let outcome = self.dialplan.lookup(context, digits);
        debug!("Lookup of '{}' in '{}' for {}: {:?}", digits, context, caller, outcome);
        outcome
    }

    fn start_call(&self, call: NewCall) -> Result<(), CallError> {
        self.calls.insert(
            call.handle,
            CallRecord {
                line: call.line,
                extension: call.extension.clone(),
                started_at: Utc::now(),
            },
        );
        self.publish(PbxEvent::CallStarted(call))
    }

    fn queue_frame(&self, handle: CallHandle, frame: Frame) -> Result<(), CallError> {
        if !self.calls.contains_key(&handle) {
            return Err(CallError::NoSuchCall(handle));
        }
        self.publish(PbxEvent::Frame { handle, frame })
    }

    fn queue_hangup(&self, handle: CallHandle, cause: HangupCause) -> Result<(), CallError> {
        if let Some(record) = self.forget(handle) {
            let duration = Utc::now().signed_duration_since(record.started_at);
            info!(
                "Call {} on line {} to '{}' ended ({:?}) after {}s",
                handle,
                record.line + 1,
                record.extension,
                cause,
                duration.num_seconds()
            );
        }
        self.publish(PbxEvent::Hangup { handle, cause })
    }
}

/// Answer every call the lines open and play their audio and digits back
pub async fn run_echo(
    registry: Arc<LineRegistry>,
    mut events: mpsc::UnboundedReceiver<PbxEvent>,
    cancel: CancellationToken,
) {
    info!("✓ Echo application started");
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        match event {
            PbxEvent::CallStarted(call) => {
                info!("📞 Line {} dialed '{}', answering", call.line + 1, call.extension);
                if let Err(e) = registry.answer(call.handle).await {
                    warn!("Failed to answer call {}: {}", call.handle, e);
                }
            }
            PbxEvent::Frame { handle, frame } => match frame {
                Frame::Voice(data) => {
                    if let Err(e) = registry.write_audio(handle, AudioFormat::SignedLinear8k, &data).await {
                        debug!("Echo to call {} failed: {}", handle, e);
                    }
                }
                Frame::Dtmf(digit) => {
                    info!("Call {} sent digit '{}'", handle, digit);
                    if let Err(e) = registry.send_digit(handle, digit, ECHO_DIGIT_MS).await {
                        debug!("Digit echo to call {} failed: {}", handle, e);
                    }
                }
                Frame::Control(control) => info!("Call {} control: {:?}", handle, control),
                Frame::Null => {}
            },
            PbxEvent::Hangup { handle, cause } => info!("Call {} hung up by line ({:?})", handle, cause),
        }
    }
    info!("Echo application stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FxsConfig;
    use crate::core::line::LineState;
    use crate::core::monitor::Monitor;
    use crate::interfaces::MemoryDevices;
    use crate::protocols::dtmf::Digit;
    use crate::protocols::input::Key;
    use std::time::Duration;

    fn host() -> ChannelHost {
        let config = FxsConfig::default_config();
        ChannelHost::new(Dialplan::from_config(&config.dialplan).unwrap())
    }

    #[test]
    fn test_lookup_uses_dialplan() {
        let host = host();
        let caller = CallerId::default();
        assert_eq!(host.lookup_extension("ai-line-1", "100", &caller), MatchOutcome::Exact);
        assert_eq!(host.lookup_extension("ai-line-1", "5", &caller), MatchOutcome::Prefix);
        assert_eq!(host.lookup_extension("ai-line-1", "7", &caller), MatchOutcome::NoMatch);
    }

    #[tokio::test]
    async fn test_events_follow_call_lifecycle() {
        let mut host = host();
        let mut events = host.take_event_receiver().unwrap();
        assert!(host.take_event_receiver().is_none());

        let stranger = CallHandle::new();
        assert_eq!(
            host.queue_frame(stranger, Frame::Null),
            Err(CallError::NoSuchCall(stranger))
        );

        let call = NewCall {
            handle: CallHandle::new(),
            line: 0,
            context: "ai-line-1".to_string(),
            extension: "100".to_string(),
            caller: CallerId::default(),
            language: None,
        };
        host.start_call(call.clone()).unwrap();
        host.queue_frame(call.handle, Frame::Dtmf(Digit::Digit7)).unwrap();
        host.queue_hangup(call.handle, HangupCause::Normal).unwrap();

        assert_eq!(events.recv().await, Some(PbxEvent::CallStarted(call.clone())));
        assert_eq!(
            events.recv().await,
            Some(PbxEvent::Frame {
                handle: call.handle,
                frame: Frame::Dtmf(Digit::Digit7)
            })
        );
        assert_eq!(
            events.recv().await,
            Some(PbxEvent::Hangup {
                handle: call.handle,
                cause: HangupCause::Normal
            })
        );
        assert!(host.active_calls().is_empty());
    }

    #[tokio::test]
    async fn test_closed_event_queue_refuses_calls() {
        let mut host = host();
        drop(host.take_event_receiver());
        let call = NewCall {
            handle: CallHandle::new(),
            line: 0,
            context: "ai-line-1".to_string(),
            extension: "100".to_string(),
            caller: CallerId::default(),
            language: None,
        };
        assert!(host.start_call(call).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_echo_answers_dialed_call() {
        let config = FxsConfig::default_config();
        let mut host = host();
        let events = host.take_event_receiver().unwrap();
        let host = Arc::new(host);
        let devices = MemoryDevices::new();
        let registry = Arc::new(LineRegistry::new(&config, &devices, host.clone()).unwrap());

        let cancel = CancellationToken::new();
        let monitor = Monitor::new(Arc::clone(&registry), &config.general).spawn(cancel.clone());
        let echo = tokio::spawn(run_echo(Arc::clone(&registry), events, cancel.clone()));

        registry.press(1, Key::HookOff).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        registry.dial(1, "100").unwrap();
        tokio::time::sleep(Duration::from_millis(3200)).await;

        let line = &registry.snapshot().await[0];
        assert_eq!(line.state, LineState::OffTalking);
        assert_eq!(host.active_calls().len(), 1);

        registry.press(1, Key::HookOn).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(registry.snapshot().await[0].state, LineState::OnIdle);
        assert!(host.active_calls().is_empty());

        cancel.cancel();
        monitor.await.unwrap();
        echo.await.unwrap();
    }
}

//! Boundary towards the call processing host
//!
//! The line controller never reaches into the host. It asks for extension
//! matches, announces new calls and queues frames or hangups on a call handle;
//! the host drives the line through [`crate::core::registry::LineRegistry`].

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::protocols::dtmf::Digit;

/// Host-side identity of a call bound to a line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallHandle(Uuid);

impl CallHandle {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for CallHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CallHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The only audio format a line carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AudioFormat {
    /// Signed linear 16-bit, 8 kHz, native byte order
    SignedLinear8k,
    SignedLinear16k,
    Ulaw,
    Alaw,
    G729,
}

impl AudioFormat {
    pub fn is_supported(self) -> bool {
        self == AudioFormat::SignedLinear8k
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AudioFormat::SignedLinear8k => "slin",
            AudioFormat::SignedLinear16k => "slin16",
            AudioFormat::Ulaw => "ulaw",
            AudioFormat::Alaw => "alaw",
            AudioFormat::G729 => "g729",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Control {
    Answer,
    MusicOnHold { class: Option<String> },
    StopMusicOnHold,
}

/// What a line queues towards its call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Voice(Bytes),
    Dtmf(Digit),
    /// Empty marker, used around DTMF digits
    Null,
    Control(Control),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HangupCause {
    /// The handset went back on hook
    Normal,
    /// Something failed on the line side
    Failure,
    /// The line went away
    Disconnected,
}

/// Answer of the extension matcher for a dialed string
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchOutcome {
    /// The digits name an extension
    Exact,
    /// More digits could still name an extension
    Prefix,
    NoMatch,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerId {
    pub name: Option<String>,
    pub number: Option<String>,
}

impl fmt::Display for CallerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.name, &self.number) {
            (Some(name), Some(number)) => write!(f, "\"{}\" <{}>", name, number),
            (Some(name), None) => write!(f, "\"{}\"", name),
            (None, Some(number)) => write!(f, "<{}>", number),
            (None, None) => write!(f, "unknown"),
        }
    }
}

/// An outgoing call opened by a line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCall {
    pub handle: CallHandle,
    pub line: usize,
    pub context: String,
    pub extension: String,
    pub caller: CallerId,
    pub language: Option<String>,
}

/// Call progress the host asks a line to signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Indication {
    Busy,
    Congestion,
    Ringing,
    Incomplete,
    Progress,
    Proceeding,
    Hold,
    Unhold,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndicateOutcome {
    Handled,
    /// The host must generate the signal and send it as voice
    InBand,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    #[error("line busy")]
    Busy,

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("no such line: {0}")]
    NoSuchLine(String),

    #[error("no line bound to call {0}")]
    NoSuchCall(CallHandle),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("format not accepted: {0}")]
    Format(AudioFormat),
}

/// Services the host provides to the lines.
///
/// Implementations are called with a line lock held and must not call back
/// into the registry.
pub trait CallHost: Send + Sync {
    fn lookup_extension(&self, context: &str, digits: &str, caller: &CallerId) -> MatchOutcome;

    /// A line opened a call. The handle is bound to the line once this returns Ok.
    fn start_call(&self, call: NewCall) -> Result<(), CallError>;

    fn queue_frame(&self, handle: CallHandle, frame: Frame) -> Result<(), CallError>;

    /// The line ended the call
    fn queue_hangup(&self, handle: CallHandle, cause: HangupCause) -> Result<(), CallError>;
}

#[cfg(test)]
pub(crate) mod testing {
    //! Host double recording everything a line sends

    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum HostEvent {
        Started(NewCall),
        Frame(CallHandle, Frame),
        Hangup(CallHandle, HangupCause),
    }

    #[derive(Default)]
    pub struct RecordingHost {
        pub extensions: Mutex<HashMap<String, Vec<String>>>,
        pub events: Mutex<Vec<HostEvent>>,
        pub refuse_frames: Mutex<bool>,
        pub refuse_calls: Mutex<bool>,
        pub lookups: Mutex<Vec<CallerId>>,
    }

    impl RecordingHost {
        pub fn with_extensions(context: &str, extensions: &[&str]) -> Self {
            let host = Self::default();
            host.extensions
                .lock()
                .unwrap()
                .insert(context.to_string(), extensions.iter().map(|e| e.to_string()).collect());
            host
        }

        /// Callers of every extension lookup, oldest first
        pub fn lookups(&self) -> Vec<CallerId> {
            self.lookups.lock().unwrap().clone()
        }

        pub fn events(&self) -> Vec<HostEvent> {
            self.events.lock().unwrap().clone()
        }

        pub fn started(&self) -> Vec<NewCall> {
            self.events()
                .into_iter()
                .filter_map(|e| match e {
                    HostEvent::Started(call) => Some(call),
                    _ => None,
                })
                .collect()
        }

        pub fn frames(&self) -> Vec<Frame> {
            self.events()
                .into_iter()
                .filter_map(|e| match e {
                    HostEvent::Frame(_, frame) => Some(frame),
                    _ => None,
                })
                .collect()
        }

        pub fn hangups(&self) -> Vec<(CallHandle, HangupCause)> {
            self.events()
                .into_iter()
                .filter_map(|e| match e {
                    HostEvent::Hangup(handle, cause) => Some((handle, cause)),
                    _ => None,
                })
                .collect()
        }
    }

    impl CallHost for RecordingHost {
        fn lookup_extension(&self, context: &str, digits: &str, caller: &CallerId) -> MatchOutcome {
            self.lookups.lock().unwrap().push(caller.clone());
            let extensions = self.extensions.lock().unwrap();
            let Some(list) = extensions.get(context) else {
                return MatchOutcome::NoMatch;
            };
            if list.iter().any(|e| e == digits) {
                MatchOutcome::Exact
            } else if list.iter().any(|e| e.starts_with(digits)) {
                MatchOutcome::Prefix
            } else {
                MatchOutcome::NoMatch
            }
        }

        fn start_call(&self, call: NewCall) -> Result<(), CallError> {
            if *self.refuse_calls.lock().unwrap() {
                return Err(CallError::Busy);
            }
            self.events.lock().unwrap().push(HostEvent::Started(call));
            Ok(())
        }

        fn queue_frame(&self, handle: CallHandle, frame: Frame) -> Result<(), CallError> {
            if *self.refuse_frames.lock().unwrap() {
                return Err(CallError::InvalidState("queue full".to_string()));
            }
            self.events.lock().unwrap().push(HostEvent::Frame(handle, frame));
            Ok(())
        }

        fn queue_hangup(&self, handle: CallHandle, cause: HangupCause) -> Result<(), CallError> {
            self.events.lock().unwrap().push(HostEvent::Hangup(handle, cause));
            Ok(())
        }
    }
}

//! Line control: state machine, dialing, audio pacing, the registry the host
//! drives and the monitor task

pub mod audio;
pub mod dialing;
pub mod host;
pub mod line;
pub mod monitor;
pub mod registry;

pub use host::{
    AudioFormat, CallError, CallHandle, CallHost, CallerId, Control, Frame, HangupCause, IndicateOutcome, Indication,
    MatchOutcome, NewCall,
};
pub use line::{Cause, LineSnapshot, LineState, LineStatus};
pub use monitor::Monitor;
pub use registry::LineRegistry;

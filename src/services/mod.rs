//! Services running on top of the lines: the local dialplan, the call host
//! and the operator console

pub mod console;
pub mod dialplan;
pub mod pbx;

pub use console::{Console, ConsoleCommand, Reply};
pub use dialplan::{Dialplan, Pattern};
pub use pbx::{run_echo, CallRecord, ChannelHost, PbxEvent};

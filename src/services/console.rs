//! Operator console
//!
//! Text commands that inject key presses into lines, place test calls towards
//! them and show their state. The binary feeds it lines read from the
//! terminal; every command is also usable programmatically.
//!
//! ```
//! use std::sync::Arc;
//! use redfire_fxs::config::FxsConfig;
//! use redfire_fxs::core::LineRegistry;
//! use redfire_fxs::interfaces::MemoryDevices;
//! use redfire_fxs::services::{ChannelHost, Console, Dialplan, Reply};
//!
//! # tokio_test::block_on(async {
//! let config = FxsConfig::default_config();
//! let mut host = ChannelHost::new(Dialplan::from_config(&config.dialplan)?);
//! let _events = host.take_event_receiver();
//! let host = Arc::new(host);
//! let registry = Arc::new(LineRegistry::new(&config, &MemoryDevices::new(), host.clone())?);
//!
//! let console = Console::new(registry, host);
//! assert!(matches!(console.handle_input("press 1 off").await?, Reply::Text(_)));
//! assert_eq!(console.handle_input("quit").await?, Reply::Quit);
//! # Ok::<(), redfire_fxs::Error>(())
//! # }).unwrap();
//! ```

use std::fmt::Write as _;
use std::sync::Arc;

use colored::*;
use tracing::info;

use crate::core::host::{AudioFormat, CallerId};
use crate::core::line::{LineSnapshot, LineState};
use crate::core::registry::LineRegistry;
use crate::protocols::dtmf::Digit;
use crate::protocols::input::Key;
use crate::services::pbx::ChannelHost;
use crate::{Error, Result};

pub const HELP: &str = "\
show [json]              line states
calls                    calls known to the host
press <line> <key>       key: off, on, mute or a digit
dial <line> <digits>     press each digit in turn
ring <line> [number]     place a call towards a line
hangup <line>            end the call on a line from the host side
help                     this text
quit                     leave the console";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Show { json: bool },
    Calls,
    Press { line: usize, key: Key },
    Dial { line: usize, digits: String },
    Ring { line: usize, number: Option<String> },
    Hangup { line: usize },
    Help,
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Text(String),
    Quit,
}

fn parse_line_number(word: Option<&str>) -> Result<usize> {
    let word = word.ok_or_else(|| Error::parse("Missing line number"))?;
    match word.parse::<usize>() {
        Ok(number) if number > 0 => Ok(number),
        _ => Err(Error::parse(format!("Invalid line number '{}'", word))),
    }
}

fn parse_key(word: &str) -> Result<Key> {
    match word.to_ascii_lowercase().as_str() {
        "off" | "offhook" | "pickup" => Ok(Key::HookOff),
        "on" | "onhook" | "hangup" => Ok(Key::HookOn),
        "mute" => Ok(Key::Mute),
        _ => {
            let mut chars = word.chars();
            match (chars.next().and_then(|c| Digit::from_char(c.to_ascii_uppercase())), chars.next()) {
                (Some(digit), None) => Ok(Key::Digit(digit)),
                _ => Err(Error::parse(format!("Unknown key '{}'", word))),
            }
        }
    }
}

impl ConsoleCommand {
    pub fn parse(input: &str) -> Result<Self> {
        let mut words = input.split_whitespace();
        let Some(command) = words.next() else {
            return Err(Error::parse("Empty command"));
        };

        let parsed = match command.to_ascii_lowercase().as_str() {
            "show" | "status" => match words.next() {
                None => Self::Show { json: false },
                Some(format) if format.eq_ignore_ascii_case("json") => Self::Show { json: true },
                Some(other) => return Err(Error::parse(format!("Unknown format '{}'", other))),
            },
            "calls" => Self::Calls,
            "press" => {
                let line = parse_line_number(words.next())?;
                let key = words.next().ok_or_else(|| Error::parse("Missing key"))?;
                Self::Press { line, key: parse_key(key)? }
            }
            "dial" => {
                let line = parse_line_number(words.next())?;
                let digits = words.next().ok_or_else(|| Error::parse("Missing digits"))?;
                if let Some(bad) = digits.chars().find(|c| Digit::from_char(*c).is_none()) {
                    return Err(Error::parse(format!("Invalid digit '{}'", bad)));
                }
                Self::Dial {
                    line,
                    digits: digits.to_string(),
                }
            }
            "ring" => Self::Ring {
                line: parse_line_number(words.next())?,
                number: words.next().map(str::to_string),
            },
            "hangup" => Self::Hangup {
                line: parse_line_number(words.next())?,
            },
            "help" | "?" => Self::Help,
            "quit" | "exit" => Self::Quit,
            other => return Err(Error::parse(format!("Unknown command '{}'", other))),
        };

        if let Some(extra) = words.next() {
            return Err(Error::parse(format!("Unexpected '{}'", extra)));
        }
        Ok(parsed)
    }
}

fn colored_state(state: LineState) -> ColoredString {
    let text = state.to_string();
    match state {
        LineState::OffTalking => text.green(),
        LineState::OnPreRinging | LineState::OnRinging | LineState::OffWaitingAnswer => text.yellow(),
        LineState::OffNoService | LineState::Disconnected => text.red(),
        LineState::OnIdle | LineState::OffDialing => text.normal(),
    }
}

/// Table of line states
pub fn render_lines(lines: &[LineSnapshot]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{}", "Lines".bold().blue());
    let _ = writeln!(
        out,
        "{:<6} {:<26} {:<8} {:<6} {}",
        "Line".bold(),
        "State".bold(),
        "Tone".bold(),
        "Muted".bold(),
        "Dialed".bold()
    );
    let _ = writeln!(out, "{}", "─".repeat(60));
    for line in lines {
        let _ = writeln!(
            out,
            "{:<6} {:<26} {:<8} {:<6} {}",
            line.line,
            colored_state(line.state),
            line.tone.as_deref().unwrap_or("-"),
            if line.muted { "yes" } else { "no" },
            line.dialed
        );
    }
    out
}

pub struct Console {
    registry: Arc<LineRegistry>,
    host: Arc<ChannelHost>,
}

impl Console {
    pub fn new(registry: Arc<LineRegistry>, host: Arc<ChannelHost>) -> Self {
        Self { registry, host }
    }

    /// Parse and run one input line
    pub async fn handle_input(&self, input: &str) -> Result<Reply> {
        if input.trim().is_empty() {
            return Ok(Reply::Text(String::new()));
        }
        self.execute(ConsoleCommand::parse(input)?).await
    }

    pub async fn execute(&self, command: ConsoleCommand) -> Result<Reply> {
        let text = match command {
            ConsoleCommand::Show { json: false } => render_lines(&self.registry.snapshot().await),
            ConsoleCommand::Show { json: true } => serde_json::to_string_pretty(&self.registry.snapshot().await)?,
            ConsoleCommand::Calls => {
                let calls = self.host.active_calls();
                if calls.is_empty() {
                    "No active calls".to_string()
                } else {
                    let mut out = String::new();
                    for (handle, record) in calls {
                        let _ = writeln!(
                            out,
                            "{} line {} '{}' since {}",
                            handle,
                            record.line + 1,
                            record.extension,
                            record.started_at.format("%H:%M:%S")
                        );
                    }
                    out
                }
            }
            ConsoleCommand::Press { line, key } => {
                self.registry.press(line, key)?;
                format!("{} line {}: {:?}", "✓".green(), line, key)
            }
            ConsoleCommand::Dial { line, digits } => {
                self.registry.dial(line, &digits)?;
                format!("{} line {}: dialed {}", "✓".green(), line, digits)
            }
            ConsoleCommand::Ring { line, number } => self.ring(line, number).await?,
            ConsoleCommand::Hangup { line } => self.hangup(line).await?,
            ConsoleCommand::Help => HELP.to_string(),
            ConsoleCommand::Quit => return Ok(Reply::Quit),
        };
        Ok(Reply::Text(text))
    }

    async fn ring(&self, line: usize, number: Option<String>) -> Result<String> {
        let handle = self
            .registry
            .request(&line.to_string(), AudioFormat::SignedLinear8k)
            .await?;
        self.host.register_incoming(handle, line - 1);

        let caller = CallerId {
            name: Some("console".to_string()),
            number,
        };
        if let Err(e) = self.registry.ring(handle, &caller).await {
            self.host.forget(handle);
            let _ = self.registry.hangup(handle).await;
            return Err(e.into());
        }
        info!("📞 Ringing line {} from {}", line, caller);
        Ok(format!("{} ringing line {} (call {})", "✓".green(), line, handle))
    }

    async fn hangup(&self, line: usize) -> Result<String> {
        let handle = self
            .registry
            .snapshot()
            .await
            .into_iter()
            .find(|snapshot| snapshot.line == line)
            .ok_or_else(|| Error::input(format!("No line {}", line)))?
            .call
            .ok_or_else(|| Error::invalid_state(format!("No call on line {}", line)))?;

        self.registry.hangup(handle).await?;
        self.host.forget(handle);
        Ok(format!("{} hung up call {} on line {}", "✓".green(), handle, line))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FxsConfig;
    use crate::core::line::LineStatus;
    use crate::core::monitor::Monitor;
    use crate::interfaces::MemoryDevices;
    use crate::services::dialplan::Dialplan;
    use crate::services::pbx::PbxEvent;
    use tokio::sync::mpsc;
    use tokio::time::Instant;

    struct Desk {
        console: Console,
        monitor: Monitor,
        host: Arc<ChannelHost>,
        _events: mpsc::UnboundedReceiver<PbxEvent>,
    }

    fn desk() -> Desk {
        let config = FxsConfig::default_config();
        let mut host = ChannelHost::new(Dialplan::from_config(&config.dialplan).unwrap());
        let events = host.take_event_receiver().unwrap();
        let host = Arc::new(host);
        let registry = Arc::new(LineRegistry::new(&config, &MemoryDevices::new(), host.clone()).unwrap());
        Desk {
            console: Console::new(Arc::clone(&registry), host.clone()),
            monitor: Monitor::new(registry, &config.general),
            host,
            _events: events,
        }
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(ConsoleCommand::parse("show").unwrap(), ConsoleCommand::Show { json: false });
        assert_eq!(ConsoleCommand::parse("show JSON").unwrap(), ConsoleCommand::Show { json: true });
        assert_eq!(
            ConsoleCommand::parse("press 1 off").unwrap(),
            ConsoleCommand::Press { line: 1, key: Key::HookOff }
        );
        assert_eq!(
            ConsoleCommand::parse("PRESS 2 #").unwrap(),
            ConsoleCommand::Press {
                line: 2,
                key: Key::Digit(Digit::Pound)
            }
        );
        assert_eq!(
            ConsoleCommand::parse("press 1 b").unwrap(),
            ConsoleCommand::Press {
                line: 1,
                key: Key::Digit(Digit::B)
            }
        );
        assert_eq!(
            ConsoleCommand::parse("dial 1 0221").unwrap(),
            ConsoleCommand::Dial {
                line: 1,
                digits: "0221".to_string()
            }
        );
        assert_eq!(
            ConsoleCommand::parse("ring 1 555").unwrap(),
            ConsoleCommand::Ring {
                line: 1,
                number: Some("555".to_string())
            }
        );
        assert_eq!(ConsoleCommand::parse("exit").unwrap(), ConsoleCommand::Quit);
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(ConsoleCommand::parse("").is_err());
        assert!(ConsoleCommand::parse("jump").is_err());
        assert!(ConsoleCommand::parse("press 0 off").is_err());
        assert!(ConsoleCommand::parse("press 1").is_err());
        assert!(ConsoleCommand::parse("press 1 12").is_err());
        assert!(ConsoleCommand::parse("dial 1 12x").is_err());
        assert!(ConsoleCommand::parse("hangup 1 now").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_press_shows_in_table() {
        let Desk {
            console, monitor, _events, ..
        } = desk();
        console.handle_input("press 1 off").await.unwrap();
        monitor.run_once(Instant::now()).await;

        let Reply::Text(table) = console.handle_input("show").await.unwrap() else {
            panic!("expected text");
        };
        assert!(table.contains("off hook, dialing"));
        assert!(table.contains("dial"));

        let Reply::Text(json) = console.handle_input("show json").await.unwrap() else {
            panic!("expected text");
        };
        let lines: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(lines[0]["line"], 1);
        assert_eq!(lines[0]["tone"], "dial");
    }

    #[tokio::test(start_paused = true)]
    async fn test_ring_pickup_and_hangup() {
        let Desk {
            console,
            monitor,
            host,
            _events,
        } = desk();
        console.handle_input("ring 1 555").await.unwrap();
        assert_eq!(host.active_calls().len(), 1);
        let line = &console.registry.snapshot().await[0];
        assert_eq!(line.state, LineState::OnRinging);

        console.handle_input("press 1 off").await.unwrap();
        monitor.run_once(Instant::now()).await;
        assert_eq!(console.registry.snapshot().await[0].state, LineState::OffTalking);

        console.handle_input("hangup 1").await.unwrap();
        let line = &console.registry.snapshot().await[0];
        assert_eq!(line.status, LineStatus::OffHook);
        assert_eq!(line.call, None);
        assert!(host.active_calls().is_empty());

        assert!(console.handle_input("hangup 1").await.is_err());
    }

    #[tokio::test]
    async fn test_ring_busy_line_fails() {
        let Desk {
            console,
            monitor,
            host,
            _events,
        } = desk();
        console.handle_input("press 1 off").await.unwrap();
        monitor.run_once(Instant::now()).await;

        assert!(console.handle_input("ring 1").await.is_err());
        assert!(host.active_calls().is_empty());
    }

    #[tokio::test]
    async fn test_quit_and_unknown_line() {
        let Desk { console, _events, .. } = desk();
        assert_eq!(console.handle_input("quit").await.unwrap(), Reply::Quit);
        assert!(console.handle_input("press 9 off").await.is_err());
        assert_eq!(console.handle_input("   ").await.unwrap(), Reply::Text(String::new()));
    }
}

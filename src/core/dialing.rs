//! Digit collection and extension search while a line is dialing

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

use crate::core::host::MatchOutcome;
use crate::core::line::{Cause, Line, LineState, NextWake};
use crate::protocols::dtmf::{digits_to_string, Digit};

/// Extension used when nothing was dialed
pub const DEFAULT_EXTENSION: &str = "s";

/// Digits dialed so far and whether a search is due
#[derive(Debug)]
pub struct Dialer {
    digits: Vec<Digit>,
    max_len: usize,
    search_pending: bool,
    /// Bumped on every change of `digits`, so a search result can be matched to
    /// the digits it was computed for
    epoch: u64,
}

/// The digits a search was started with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchTicket {
    epoch: u64,
    pub extension: String,
}

impl Dialer {
    pub fn new(max_len: usize) -> Self {
        Self {
            digits: Vec::with_capacity(max_len),
            max_len,
            search_pending: false,
            epoch: 0,
        }
    }

    pub fn digits(&self) -> &[Digit] {
        &self.digits
    }

    pub fn len(&self) -> usize {
        self.digits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.digits.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.digits.len() >= self.max_len
    }

    pub fn push(&mut self, digit: Digit) -> bool {
        if self.is_full() {
            return false;
        }
        self.digits.push(digit);
        self.epoch += 1;
        true
    }

    pub fn clear(&mut self) {
        self.digits.clear();
        self.search_pending = false;
        self.epoch += 1;
    }

    pub fn request_search(&mut self) {
        self.search_pending = true;
    }

    pub fn search_pending(&self) -> bool {
        self.search_pending
    }

    pub fn extension(&self) -> String {
        if self.digits.is_empty() {
            DEFAULT_EXTENSION.to_string()
        } else {
            digits_to_string(&self.digits)
        }
    }

    /// Consume the pending search
    pub fn begin_search(&mut self) -> SearchTicket {
        self.search_pending = false;
        SearchTicket {
            epoch: self.epoch,
            extension: self.extension(),
        }
    }

    /// Whether nothing was dialed or cleared since `ticket` was issued
    pub fn is_current(&self, ticket: &SearchTicket) -> bool {
        ticket.epoch == self.epoch
    }
}

impl Line {
    /// A keypad digit while off hook
    pub(super) fn handle_digit(&mut self, digit: Digit, now: Instant, wake: &mut NextWake) {
        if self.state.is_talking() {
            self.queue_in_call_digit(digit);
            return;
        }
        if self.state != LineState::OffDialing {
            debug!("Line {}: digit '{}' ignored in '{}'", self.number(), digit, self.state);
            return;
        }

        // A timeout may have expired before this digit was seen
        self.search_extension(now, false, wake);
        if self.state != LineState::OffDialing {
            return;
        }
        if self.dialer.is_full() {
            debug!("Line {}: digit '{}' ignored, extension full", self.number(), digit);
            return;
        }
        if self.dialer.is_empty() {
            self.set_tone(None);
        }

        if self.config.trigger_digit() == Some(digit) {
            self.dialer.request_search();
            self.search_extension(now, true, wake);
            return;
        }

        self.dialer.push(digit);
        self.dialer.request_search();
        if self.config.dialing_timeout == 0 || self.dialer.is_full() {
            self.search_extension(now, true, wake);
        } else {
            self.tv_wait = now;
            wake.within(Duration::from_millis(self.config.dialing_timeout));
        }
    }

    /// Look the dialed digits up once the applicable timeout has passed, or
    /// right away with `ignore_timeout`.
    pub(super) fn search_extension(&mut self, now: Instant, ignore_timeout: bool, wake: &mut NextWake) {
        if self.state != LineState::OffDialing || !self.dialer.search_pending() {
            return;
        }

        if !ignore_timeout {
            let timeout = if self.dialer.is_empty() {
                self.config.dialing_timeout_1st_digit
            } else {
                self.config.dialing_timeout
            };
            let timeout = Duration::from_millis(timeout);
            if !timeout.is_zero() {
                let elapsed = now.saturating_duration_since(self.tv_wait);
                if elapsed < timeout {
                    wake.within(timeout - elapsed);
                    return;
                }
            }
        }

        let ticket = self.dialer.begin_search();
        let caller = self.caller_id();
        debug!(
            "Line {}: searching '{}' in context '{}'",
            self.number(),
            ticket.extension,
            self.config.context
        );
        let outcome = self.host.lookup_extension(&self.config.context, &ticket.extension, &caller);
        self.apply_search_result(&ticket, outcome);
    }

    /// Act on a lookup result. Results for digits that changed since the
    /// lookup started are dropped; returns whether the result was used.
    pub fn apply_search_result(&mut self, ticket: &SearchTicket, outcome: MatchOutcome) -> bool {
        if self.state != LineState::OffDialing || !self.dialer.is_current(ticket) {
            debug!("Line {}: stale search result for '{}' dropped", self.number(), ticket.extension);
            return false;
        }

        match outcome {
            MatchOutcome::Exact => {
                info!("Line {}: extension '{}' found", self.number(), ticket.extension);
                self.open_call(Cause::ExtensionFound);
            }
            MatchOutcome::NoMatch => {
                info!("Line {}: no extension '{}'", self.number(), ticket.extension);
                self.set_state(LineState::OffNoService, Cause::NoExtension);
            }
            MatchOutcome::Prefix => {
                if self.dialer.is_full() {
                    info!("Line {}: '{}' is too long", self.number(), ticket.extension);
                    self.set_state(LineState::OffNoService, Cause::NoExtension);
                } else {
                    debug!("Line {}: '{}' may match, waiting for more digits", self.number(), ticket.extension);
                }
            }
        }
        true
    }
}

//! Monitor task
//!
//! One task services every line: it drains queued input events, paces DTMF,
//! pumps captured audio, keeps tones fed and runs the dialing, ringing and
//! no-service timers. It sleeps until the earliest deadline any line asked
//! for, or until woken.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::GeneralConfig;
use crate::core::line::{LineState, NextWake};
use crate::core::registry::LineRegistry;

pub struct Monitor {
    registry: Arc<LineRegistry>,
    idle_timeout: Duration,
    short_timeout: Duration,
}

impl Monitor {
    pub fn new(registry: Arc<LineRegistry>, general: &GeneralConfig) -> Self {
        Self {
            registry,
            idle_timeout: Duration::from_millis(general.idle_timeout_ms),
            short_timeout: Duration::from_millis(general.short_timeout_ms),
        }
    }

    /// One pass over all lines.
    ///
    /// Returns how long to wait before the next pass, or `None` once no line
    /// is connected any more.
    pub async fn run_once(&self, now: Instant) -> Option<Duration> {
        let mut state = self.registry.lock_monitor().await;
        let mut wake = NextWake::new(self.idle_timeout);
        let mut connected = 0;

        for (index, line) in self.registry.lines() {
            let last_known = state.last_known.entry(index).or_insert(LineState::OnIdle);
            if *last_known == LineState::Disconnected {
                continue;
            }

            let Ok(mut line) = line.try_lock() else {
                debug!("Line {} busy, retrying shortly", index + 1);
                wake.within(self.short_timeout);
                connected += 1;
                continue;
            };

            if line.is_connected() {
                line.drain_events(now, &mut wake);
            }
            if line.is_connected() {
                line.service(now, &mut wake);
            }

            *last_known = line.state();
            if line.is_connected() {
                connected += 1;
            } else {
                warn!("Line {} is disconnected and no longer monitored", index + 1);
            }
        }

        (connected > 0).then(|| wake.timeout())
    }

    /// Run passes until cancelled or until every line is disconnected
    pub async fn run(self, cancel: CancellationToken) {
        let wake = self.registry.wake();
        info!("✓ Line monitor started");

        let mut timeout = self.short_timeout;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Line monitor stopped");
                    return;
                }
                _ = wake.notified() => {}
                _ = tokio::time::sleep(timeout) => {}
            }

            match self.run_once(Instant::now()).await {
                Some(next) => timeout = next,
                None => {
                    warn!("No line left connected, monitor exiting");
                    return;
                }
            }
        }
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(cancel).await })
    }
}

//! Per-connection keepalive alarm.
//!
//! One deadline is outstanding at a time. Activity re-arms the probe phase;
//! a fired probe arms the timeout phase; a fired timeout disarms.

use std::pin::Pin;
use std::time::Duration;

use tokio::time::{Instant, Sleep, sleep};

/// Which deadline the alarm is waiting on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AlarmPhase {
    /// Idle for the probe interval; a ping should be sent.
    Probe,
    /// No activity since the probe; the connection should be closed.
    Timeout,
}

/// Single-deadline keepalive alarm owned by one connection.
#[derive(Debug)]
pub struct KeepaliveAlarm {
    interval: Duration,
    timeout: Duration,
    phase: AlarmPhase,
    armed: bool,
    sleep: Pin<Box<Sleep>>,
}

impl KeepaliveAlarm {
    /// Create an alarm armed for the probe phase.
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            timeout,
            phase: AlarmPhase::Probe,
            armed: true,
            sleep: Box::pin(sleep(interval)),
        }
    }

    /// Restart the cycle from the probe interval.
    pub fn rearm(&mut self) {
        self.phase = AlarmPhase::Probe;
        self.armed = true;
        self.sleep.as_mut().reset(Instant::now() + self.interval);
    }

    /// Disarm. [`fired`](Self::fired) never completes afterwards.
    pub fn cancel(&mut self) {
        self.armed = false;
    }

    #[cfg(test)]
    fn phase(&self) -> AlarmPhase {
        self.phase
    }

    #[cfg(test)]
    fn deadline(&self) -> Option<Instant> {
        self.armed.then(|| self.sleep.deadline())
    }

    /// Wait for the pending deadline and return the phase that fired.
    ///
    /// Cancel safe: dropping the future before it completes leaves the
    /// alarm unchanged.
    pub async fn fired(&mut self) -> AlarmPhase {
        if !self.armed {
            return std::future::pending().await;
        }
        self.sleep.as_mut().await;

        let fired = self.phase;
        match fired {
            AlarmPhase::Probe => {
                self.phase = AlarmPhase::Timeout;
                self.sleep.as_mut().reset(Instant::now() + self.timeout);
            }
            AlarmPhase::Timeout => self.armed = false,
        }
        fired
    }
}

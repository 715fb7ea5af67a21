//! Pure keep-alive decision logic
//!
//! The session snapshots its activity timestamps and asks
//! [`KeepAliveMonitor::evaluate`] what to do; the pinger task acts on the
//! answer.

use std::time::Duration;

/// Slack applied to the keep-alive interval on both sides
pub const KEEP_ALIVE_TOLERANCE: Duration = Duration::from_millis(100);

/// Activity state observed at one instant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivitySnapshot {
    pub keep_alive: Duration,
    pub since_inbound: Duration,
    pub since_outbound: Duration,
    pub pings_outstanding: u32,
    pub quiescing: bool,
}

/// What the keep-alive check decided
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityDecision {
    /// Keep-alive is zero: nothing to schedule
    Disabled,
    /// A ping went unanswered for longer than keep-alive
    ClientTimeout,
    /// Nothing was written for two keep-alive intervals
    WriteTimeout,
    /// Queue a PINGREQ and check again after `next_check`
    SendPing { next_check: Duration },
    /// Nothing to do until `next_check`
    Wait { next_check: Duration },
}

/// Pure keep-alive decision logic
pub struct KeepAliveMonitor;

impl KeepAliveMonitor {
    /// Decide the keep-alive action for a snapshot (pure function)
    pub fn evaluate(snapshot: &ActivitySnapshot) -> ActivityDecision {
        let keep_alive = snapshot.keep_alive;
        if keep_alive.is_zero() {
            return ActivityDecision::Disabled;
        }

        let ping_outstanding = snapshot.pings_outstanding > 0;
        if ping_outstanding && snapshot.since_inbound >= keep_alive + KEEP_ALIVE_TOLERANCE {
            return ActivityDecision::ClientTimeout;
        }
        if !ping_outstanding && snapshot.since_outbound >= keep_alive * 2 {
            return ActivityDecision::WriteTimeout;
        }

        if snapshot.quiescing {
            return ActivityDecision::Wait {
                next_check: keep_alive,
            };
        }

        let threshold = keep_alive.saturating_sub(KEEP_ALIVE_TOLERANCE);
        if (!ping_outstanding && snapshot.since_inbound >= threshold)
            || snapshot.since_outbound >= threshold
        {
            return ActivityDecision::SendPing {
                next_check: keep_alive,
            };
        }

        let next_check = keep_alive
            .saturating_sub(snapshot.since_outbound)
            .max(Duration::from_millis(1));
        ActivityDecision::Wait { next_check }
    }
}

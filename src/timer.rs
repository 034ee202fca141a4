//! Echo timers for SSTP and PPP liveness.
//!
//! Each layer keeps an independent deadline. Any received frame at that
//! layer ticks the timer; when nothing arrives for a full interval the
//! owner sends one echo request and arms a reply deadline. Both timers
//! are owned and polled by the demultiplexer task, so no cross-task
//! synchronisation is needed.

use std::time::{Duration, Instant};

/// Echo interval for both the SSTP and PPP layers.
pub const ECHO_INTERVAL: Duration = Duration::from_secs(20);

/// What the owner should do after polling the timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// Traffic seen recently, nothing to do.
    Alive,
    /// Quiet for a full interval: send an echo request now.
    SendEcho,
    /// The echo reply deadline passed with no traffic.
    Dead,
}

/// A per-layer liveness timer.
#[derive(Debug)]
pub struct EchoTimer {
    interval: Duration,
    last_ticked: Instant,
    deadline: Instant,
    awaiting_reply: bool,
}

impl EchoTimer {
    /// Create a timer that starts alive as of `now`.
    pub fn new(interval: Duration, now: Instant) -> Self {
        Self {
            interval,
            last_ticked: now,
            deadline: now + interval,
            awaiting_reply: false,
        }
    }

    /// Record traffic at this layer.
    pub fn tick(&mut self, now: Instant) {
        self.last_ticked = now;
        self.awaiting_reply = false;
    }

    /// Poll the timer. When `SendEcho` is returned the reply deadline is
    /// armed; the caller must actually send the echo request.
    pub fn check_alive(&mut self, now: Instant) -> Liveness {
        if now.duration_since(self.last_ticked) <= self.interval {
            return Liveness::Alive;
        }
        if self.awaiting_reply {
            if now > self.deadline {
                return Liveness::Dead;
            }
            return Liveness::Alive;
        }
        self.awaiting_reply = true;
        self.deadline = now + self.interval;
        Liveness::SendEcho
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERVAL: Duration = Duration::from_secs(20);

    #[test]
    fn quiet_link_requests_echo_once() {
        let start = Instant::now();
        let mut timer = EchoTimer::new(INTERVAL, start);

        assert_eq!(timer.check_alive(start + Duration::from_secs(5)), Liveness::Alive);

        let quiet = start + Duration::from_secs(21);
        assert_eq!(timer.check_alive(quiet), Liveness::SendEcho);
        // Polling again before the reply deadline must not resend.
        assert_eq!(timer.check_alive(quiet + Duration::from_secs(1)), Liveness::Alive);
    }

    #[test]
    fn reply_resets_the_deadline() {
        let start = Instant::now();
        let mut timer = EchoTimer::new(INTERVAL, start);

        let quiet = start + Duration::from_secs(21);
        assert_eq!(timer.check_alive(quiet), Liveness::SendEcho);

        // A frame arrives: liveness restored, no echo pending.
        timer.tick(quiet + Duration::from_secs(2));
        assert_eq!(
            timer.check_alive(quiet + Duration::from_secs(3)),
            Liveness::Alive
        );
    }

    #[test]
    fn missed_reply_is_dead_after_two_intervals() {
        let start = Instant::now();
        let mut timer = EchoTimer::new(INTERVAL, start);

        let quiet = start + Duration::from_secs(21);
        assert_eq!(timer.check_alive(quiet), Liveness::SendEcho);

        let expired = quiet + Duration::from_secs(21);
        assert_eq!(timer.check_alive(expired), Liveness::Dead);
    }
}

//! Per-connection timers, counted in slow ticks.
//!
//! The fast timer runs every 200 ms and only flushes delayed
//! acknowledgments. The slow timer runs every 500 ms and counts down each of
//! the four timers below; a timer is off while it reads zero.

use super::{State, Tcb};

pub const FAST_TICK_MS: u64 = 200;
pub const SLOW_TICK_MS: u64 = 500;
pub const SLOW_HZ: u32 = 2;

/// Maximum segment lifetime
pub const TCPTV_MSL: u32 = 5 * SLOW_HZ;
/// Minimum retransmission timeout
pub const TCPTV_MIN: u32 = SLOW_HZ;
/// Maximum retransmission timeout
pub const TCPTV_REXMTMAX: u32 = 12 * SLOW_HZ;
pub const TCPTV_PERSMIN: u32 = 5 * SLOW_HZ;
pub const TCPTV_PERSMAX: u32 = 60 * SLOW_HZ;
/// How long a connection may take to be established
pub const TCPTV_KEEP_INIT: u32 = 75 * SLOW_HZ;
/// Idle time before the first keepalive probe
pub const TCPTV_KEEP_IDLE: u32 = 7200 * SLOW_HZ;
/// Time between keepalive probes
pub const TCPTV_KEEPINTVL: u32 = 75 * SLOW_HZ;
/// Unanswered probes before the connection is dropped
pub const TCPTV_KEEPCNT: u32 = 8;
pub const TCP_MAXIDLE: u32 = TCPTV_KEEPCNT * TCPTV_KEEPINTVL;

pub const TCP_MAXRXTSHIFT: usize = 12;
pub const TCP_BACKOFF: [u32; TCP_MAXRXTSHIFT + 1] = [1, 2, 4, 8, 16, 32, 64, 64, 64, 64, 64, 64, 64];

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Timers {
    /// Retransmission
    pub rexmt: u32,
    /// Zero window probing
    pub persist: u32,
    /// Connection establishment and keepalive
    pub keep: u32,
    /// TIME-WAIT, and the idle bound on FIN-WAIT-2
    pub two_msl: u32,
}

impl Timers {
    pub fn cancel_all(&mut self) {
        *self = Self::default();
    }

    pub fn is_idle(&self) -> bool {
        *self == Self::default()
    }
}

/// What the owner of a control block must do after a slow tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerOutcome {
    /// Nothing expired
    Idle,
    /// A timer fired and the connection may have something to send
    Output,
    /// Send a keepalive probe, an acknowledgment the guest must answer
    KeepaliveProbe,
    /// The connection gave up. It has moved to CLOSED and its final output
    /// carries a reset.
    Dropped,
    /// The connection finished and should be destroyed silently
    Closed,
}

impl Tcb {
    /// The delayed acknowledgment timer. Returns whether an acknowledgment
    /// is now due.
    pub fn fast_tick(&mut self) -> bool {
        if self.flags.delayed_ack {
            self.flags.delayed_ack = false;
            self.flags.ack_now = true;
            true
        } else {
            false
        }
    }

    /// Advances every timer by one slow tick and runs whichever expire, in
    /// the order 2MSL, retransmit, persist, keep.
    pub fn slow_tick(&mut self) -> TimerOutcome {
        let two_msl = countdown(&mut self.timers.two_msl);
        let rexmt = countdown(&mut self.timers.rexmt);
        let persist = countdown(&mut self.timers.persist);
        let keep = countdown(&mut self.timers.keep);

        let mut outcome = TimerOutcome::Idle;
        if two_msl {
            outcome = self.two_msl_expired();
        }
        if rexmt && outcome == TimerOutcome::Idle {
            outcome = self.rexmt_expired();
        }
        if persist && outcome == TimerOutcome::Idle {
            self.persist_expired();
            outcome = TimerOutcome::Output;
        }
        if keep && matches!(outcome, TimerOutcome::Idle | TimerOutcome::Output) {
            match self.keep_expired() {
                TimerOutcome::Idle => {}
                TimerOutcome::KeepaliveProbe if outcome == TimerOutcome::Output => {}
                other => outcome = other,
            }
        }
        self.idle = self.idle.saturating_add(1);
        if self.rtt_ticks > 0 {
            self.rtt_ticks += 1;
        }
        outcome
    }

    fn two_msl_expired(&mut self) -> TimerOutcome {
        if self.state != State::TimeWait && self.idle <= TCP_MAXIDLE {
            self.timers.two_msl = TCPTV_KEEPINTVL;
            TimerOutcome::Idle
        } else {
            tracing::trace!(state = %self.state, "2MSL expired");
            self.state = State::Closed;
            TimerOutcome::Closed
        }
    }

    fn rexmt_expired(&mut self) -> TimerOutcome {
        self.rxtshift += 1;
        if self.rxtshift > TCP_MAXRXTSHIFT {
            self.rxtshift = TCP_MAXRXTSHIFT;
            tracing::debug!(state = %self.state, "retransmission limit reached");
            return self.drop_connection();
        }
        self.rxtcur = self.backed_off_rto(self.rxtshift);
        self.timers.rexmt = self.rxtcur;
        // Several timeouts in a row suggest the estimate is stale
        if self.rxtshift > TCP_MAXRXTSHIFT / 4 {
            self.rtt.discard();
        }
        self.snd.nxt = self.snd.una;
        // Cancel any measurement; the retransmission would corrupt it
        self.rtt_ticks = 0;
        // Collapse to one segment and remember half the window (slow start)
        let win = (self.snd.wnd.min(self.cwnd) / 2 / self.maxseg()).max(2);
        self.ssthresh = win * self.maxseg();
        self.cwnd = self.maxseg();
        self.dupacks = 0;
        tracing::trace!(shift = self.rxtshift, rto = self.rxtcur, "retransmission timeout");
        TimerOutcome::Output
    }

    fn persist_expired(&mut self) {
        self.set_persist();
        self.force = true;
    }

    fn keep_expired(&mut self) -> TimerOutcome {
        if !self.state.is_synchronized() {
            tracing::debug!(state = %self.state, "connection establishment timed out");
            return self.drop_connection();
        }
        if self.keepalive && self.state <= State::CloseWait {
            if self.idle >= TCPTV_KEEP_IDLE + TCP_MAXIDLE {
                tracing::debug!("keepalive probes unanswered");
                return self.drop_connection();
            }
            self.timers.keep = TCPTV_KEEPINTVL;
            TimerOutcome::KeepaliveProbe
        } else {
            self.timers.keep = TCPTV_KEEP_IDLE;
            TimerOutcome::Idle
        }
    }

    /// Arms the persist timer with a backed-off interval bounded to
    /// `TCPTV_PERSMIN..=TCPTV_PERSMAX`.
    pub fn set_persist(&mut self) {
        let base = self.rtt.rto_ticks();
        self.timers.persist =
            (base * TCP_BACKOFF[self.rxtshift]).clamp(TCPTV_PERSMIN, TCPTV_PERSMAX);
        if self.rxtshift < TCP_MAXRXTSHIFT {
            self.rxtshift += 1;
        }
    }

    pub(super) fn backed_off_rto(&self, shift: usize) -> u32 {
        (self.rtt.rto_ticks() * TCP_BACKOFF[shift]).clamp(TCPTV_MIN, TCPTV_REXMTMAX)
    }
}

/// Decrements a running timer and reports whether it just reached zero.
fn countdown(timer: &mut u32) -> bool {
    if *timer == 0 {
        return false;
    }
    *timer -= 1;
    *timer == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn countdown_fires_once() {
        let mut timer = 2;
        assert!(!countdown(&mut timer));
        assert!(countdown(&mut timer));
        assert!(!countdown(&mut timer));
        assert_eq!(timer, 0);
    }

    #[test]
    fn backoff_table_caps_at_64() {
        assert_eq!(TCP_BACKOFF[6], 64);
        assert!(TCP_BACKOFF.iter().all(|&b| b <= 64));
        assert!(TCP_BACKOFF.windows(2).all(|w| w[0] <= w[1]));
    }
}

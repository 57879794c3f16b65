//! Round trip time estimation, after "Congestion Avoidance and Control",
//! Van Jacobson and Michael J. Karels, 1988.

use super::timers::{SLOW_TICK_MS, TCPTV_MIN, TCPTV_REXMTMAX};

/// Floor on the variance term so a steady link still gets some slack
const MIN_MARGIN_MS: u32 = 5;
/// Initial deviation, giving a three second retransmission timeout before
/// the first sample
const INITIAL_DEVIATION_MS: u32 = 750;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RttEstimator {
    /// Smoothed round trip time in milliseconds, zero before the first sample
    rtt: u32,
    deviation: u32,
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self {
            rtt: 0,
            deviation: INITIAL_DEVIATION_MS,
        }
    }
}

impl RttEstimator {
    /// Folds in a new measurement taken over `ticks` slow timer ticks.
    pub fn sample(&mut self, ticks: u32) {
        let new_rtt = ticks.max(1) * SLOW_TICK_MS as u32;
        if self.rtt == 0 {
            self.rtt = new_rtt;
            self.deviation = new_rtt / 2;
            return;
        }
        self.rtt = (self.rtt * 7 + new_rtt + 7) / 8;
        let diff = self.rtt.abs_diff(new_rtt);
        self.deviation = (self.deviation * 3 + diff + 3) / 4;
    }

    /// After repeated timeouts the estimate is probably wrong. Fold the
    /// smoothed time into the deviation and start over.
    pub fn discard(&mut self) {
        self.deviation += self.rtt / 4;
        self.rtt = 0;
    }

    /// The base retransmission timeout in slow ticks, before backoff
    pub fn rto_ticks(&self) -> u32 {
        let margin = MIN_MARGIN_MS.max(self.deviation * 4);
        let ms = self.rtt + margin;
        let ticks = ms.div_ceil(SLOW_TICK_MS as u32);
        ticks.clamp(TCPTV_MIN, TCPTV_REXMTMAX)
    }
}

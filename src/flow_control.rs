//! Credit and congestion control.
//!
//! Credits gate how many packets a session may have outstanding; Timely
//! decides how fast they leave. Timely adjusts the per-session send rate from
//! RTT variation (SIGCOMM 2015); the pacing wheel converts the rate into
//! per-packet release timestamps.

use std::cell::Cell;

// Timely parameters, RTTs in microseconds and rates in bytes per second.
const TIMELY_T_LOW: f64 = 50.0;
const TIMELY_T_HIGH: f64 = 1000.0;
const TIMELY_ALPHA: f64 = 0.875;
const TIMELY_BETA: f64 = 0.8;
const TIMELY_ADD_RATE: f64 = 5.0 * 1000.0 * 1000.0;
const TIMELY_MIN_RATE: f64 = 1.0 * 1000.0 * 1000.0;
const TIMELY_MIN_RTT_US: f64 = 2.0;
const TIMELY_UPDATE_INTERVAL: u32 = 16;

/// Timely congestion control state for one session.
///
/// A session starts at the link rate and is *uncongested* while it stays
/// there; uncongested sessions may bypass the pacing wheel.
#[derive(Debug, Clone)]
pub struct TimelyState {
    /// Current sending rate in bytes per second.
    rate: Cell<f64>,
    /// Previous RTT sample in microseconds.
    prev_rtt: Cell<f64>,
    /// EWMA of RTT differences.
    avg_rtt_diff: Cell<f64>,
    /// Minimum RTT observed, microseconds.
    min_rtt: Cell<f64>,
    /// Samples consumed since the last rate update.
    pkts_since_update: Cell<u32>,
    /// Physical link bandwidth in bytes per second; rate ceiling.
    link_rate: f64,
}

impl TimelyState {
    pub fn new(link_rate: f64) -> Self {
        Self {
            rate: Cell::new(link_rate),
            prev_rtt: Cell::new(0.0),
            avg_rtt_diff: Cell::new(0.0),
            min_rtt: Cell::new(f64::MAX),
            pkts_since_update: Cell::new(0),
            link_rate,
        }
    }

    /// Current sending rate in bytes per second.
    #[inline]
    pub fn rate(&self) -> f64 {
        self.rate.get()
    }

    /// Minimum RTT observed so far, microseconds.
    #[inline]
    pub fn min_rtt_us(&self) -> f64 {
        let m = self.min_rtt.get();
        if m == f64::MAX {
            0.0
        } else {
            m
        }
    }

    /// True while the session sends at the link rate.
    #[inline]
    pub fn is_uncongested(&self) -> bool {
        self.rate.get() >= self.link_rate
    }

    /// Feed one RTT sample. Returns true if the rate changed.
    pub fn update(&self, rtt_us: f64) -> bool {
        if rtt_us < self.min_rtt.get() {
            self.min_rtt.set(rtt_us);
        }
        let min_rtt = self.min_rtt.get().max(TIMELY_MIN_RTT_US);

        let pkts = self.pkts_since_update.get() + 1;
        self.pkts_since_update.set(pkts);
        if pkts < TIMELY_UPDATE_INTERVAL {
            return false;
        }
        self.pkts_since_update.set(0);

        let prev_rtt = self.prev_rtt.get();
        self.prev_rtt.set(rtt_us);
        if prev_rtt == 0.0 {
            return false;
        }

        let current_rate = self.rate.get();
        let rtt_diff = rtt_us - prev_rtt;
        let avg_diff = TIMELY_ALPHA * self.avg_rtt_diff.get() + (1.0 - TIMELY_ALPHA) * rtt_diff;
        self.avg_rtt_diff.set(avg_diff);

        let new_rate = if rtt_us < TIMELY_T_LOW {
            current_rate + TIMELY_ADD_RATE
        } else if rtt_us > TIMELY_T_HIGH {
            current_rate * (1.0 - TIMELY_BETA * (1.0 - TIMELY_T_HIGH / rtt_us))
        } else {
            let normalized_grad = avg_diff / min_rtt;
            if normalized_grad <= 0.0 {
                current_rate + TIMELY_ADD_RATE
            } else {
                (current_rate * (1.0 - TIMELY_BETA * normalized_grad)).max(TIMELY_MIN_RATE)
            }
        };

        self.rate
            .set(new_rate.clamp(TIMELY_MIN_RATE, self.link_rate));
        true
    }

    /// Reset to the link rate.
    pub fn reset(&self) {
        self.rate.set(self.link_rate);
        self.prev_rtt.set(0.0);
        self.avg_rtt_diff.set(0.0);
        self.min_rtt.set(f64::MAX);
        self.pkts_since_update.set(0);
    }
}

/// Per-session congestion control: the Timely instance plus the running
/// transmit-timestamp frontier used by the pacing wheel.
pub(crate) struct SessionCc {
    pub timely: TimelyState,
    /// Release timestamp handed out for the previous paced packet.
    prev_desired_tx_tsc: Cell<u64>,
    freq_ghz: f64,
}

impl SessionCc {
    pub fn new(link_rate: f64, freq_ghz: f64) -> Self {
        Self {
            timely: TimelyState::new(link_rate),
            prev_desired_tx_tsc: Cell::new(0),
            freq_ghz,
        }
    }

    /// Compute the release timestamp for a packet of `pkt_size` bytes and
    /// advance the frontier: `max(prev, now) + pkt_size / rate`.
    pub fn get_update_tx_tsc(&self, ref_tsc: u64, pkt_size: usize) -> u64 {
        let desired = self.prev_desired_tx_tsc.get().max(ref_tsc);
        let cycles = (pkt_size as f64 * self.freq_ghz * 1e9 / self.timely.rate()) as u64;
        let tx_tsc = desired + cycles;
        self.prev_desired_tx_tsc.set(tx_tsc);
        tx_tsc
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LINK: f64 = 1.25e9; // 10 Gbps

    #[test]
    fn test_starts_uncongested() {
        let t = TimelyState::new(LINK);
        assert!(t.is_uncongested());
        assert_eq!(t.rate(), LINK);
    }

    #[test]
    fn test_high_rtt_decreases_rate() {
        let t = TimelyState::new(LINK);
        // Establish prev_rtt, then feed sustained high RTTs.
        for _ in 0..(TIMELY_UPDATE_INTERVAL * 4) {
            t.update(2000.0);
        }
        assert!(t.rate() < LINK);
        assert!(!t.is_uncongested());
    }

    #[test]
    fn test_low_rtt_recovers_rate() {
        let t = TimelyState::new(LINK);
        for _ in 0..(TIMELY_UPDATE_INTERVAL * 4) {
            t.update(2000.0);
        }
        let depressed = t.rate();
        for _ in 0..(TIMELY_UPDATE_INTERVAL * 200) {
            t.update(10.0);
        }
        assert!(t.rate() > depressed);
    }

    #[test]
    fn test_rate_never_exceeds_link() {
        let t = TimelyState::new(LINK);
        for _ in 0..(TIMELY_UPDATE_INTERVAL * 100) {
            t.update(5.0);
        }
        assert!(t.rate() <= LINK);
    }

    #[test]
    fn test_pacing_frontier_advances() {
        let cc = SessionCc::new(LINK, 2.0);
        let t1 = cc.get_update_tx_tsc(1000, 1456);
        let t2 = cc.get_update_tx_tsc(1000, 1456);
        assert!(t1 > 1000);
        assert!(t2 > t1);
    }
}

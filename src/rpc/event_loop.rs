//! The dispatcher event loop.

use crate::timing::{ms_to_cycles, rdtsc};
use crate::transport::Transport;

use super::Rpc;

impl<T: Transport> Rpc<T> {
    /// Run one iteration of the event loop.
    pub fn run_event_loop_once(&self) {
        self.run_event_loop_do_one_st();
    }

    /// Run the event loop for `timeout_ms` milliseconds, measured on the
    /// cycle counter. In-flight RPCs persist across invocations.
    pub fn run_event_loop(&self, timeout_ms: usize) {
        let budget = ms_to_cycles(timeout_ms as u64, self.freq_ghz_internal());
        let start = rdtsc();
        loop {
            self.run_event_loop_do_one_st();
            if rdtsc().wrapping_sub(start) > budget {
                return;
            }
        }
    }

    pub(crate) fn run_event_loop_do_one_st(&self) {
        self.dpath_stats.borrow_mut().ev_loop_calls += 1;

        // (1) Receive burst and per-packet classification.
        let n_rx = self.process_comps_st();

        // (2) Credit-gated pending transmissions.
        self.process_credit_stall_queue_st();

        // (3) Pacing wheel.
        self.process_wheel_st();

        // (4) Cross-thread handoff queues.
        self.process_bg_queues_st();

        // (5) Session management.
        self.handle_sm_rx_st();

        // (6) Periodic loss scan.
        let now = rdtsc();
        if now.wrapping_sub(self.pkt_loss_scan_tsc.get()) > self.pkt_loss_scan_cycles() {
            self.pkt_loss_scan_tsc.set(now);
            self.pkt_loss_scan_st();
        }

        // (7) Flush the TX batch and complete DMA.
        self.do_tx_burst_st();
        self.transport.borrow_mut().tx_flush();

        if n_rx == 0 {
            std::hint::spin_loop();
        }
    }
}

//! Packet-loss detection, rollback and retransmission.

use tracing::warn;

use crate::config::SESSION_CREDITS;
use crate::session::ACTIVE_POS_NONE;
use crate::timing::rdtsc;
use crate::transport::Transport;

use super::{sm_state_is_pending, Rpc};

impl<T: Transport> Rpc<T> {
    /// Scan active RPCs for datapath loss and pending SM requests for
    /// handshake loss. Runs every `pkt_loss_scan_us`.
    pub(crate) fn pkt_loss_scan_st(&self) {
        let now = rdtsc();

        let snapshot: Vec<(u16, u8)> = self.active_rpcs.borrow().clone();
        let mut to_reset: Vec<u16> = Vec::new();

        for (session_num, sslot_idx) in snapshot {
            let kicked = {
                let mut sessions = self.sessions.borrow_mut();
                let s = match sessions
                    .get_mut(session_num as usize)
                    .and_then(|s| s.as_mut())
                {
                    Some(s) if s.is_client() && s.is_connected() => s,
                    _ => continue,
                };
                let sslot_idx = sslot_idx as usize;

                {
                    let ci = s.sslots[sslot_idx].client_info();
                    // Completed since the snapshot was taken.
                    if ci.active_pos == ACTIVE_POS_NONE {
                        continue;
                    }
                    // No packets in flight: nothing to time out.
                    if ci.num_tx == ci.num_rx {
                        continue;
                    }
                    let last_ts = ci.tx_ts[(ci.num_tx - 1) % SESSION_CREDITS];
                    if now.saturating_sub(last_ts) <= self.rto_cycles() {
                        continue;
                    }
                    // Rolling back packets that still sit in the wheel would
                    // break the one-pending-entry invariant; retry next scan.
                    if ci.wheel_count > 0 {
                        self.pkt_loss_stats.borrow_mut().still_in_wheel_during_retx += 1;
                        continue;
                    }
                }

                // Rollback: un-send everything unacknowledged and refund the
                // credits those packets consumed.
                let (delta, failure) = {
                    let ci = s.sslots[sslot_idx].client_info_mut();
                    let delta = ci.num_tx - ci.num_rx;
                    ci.num_tx = ci.num_rx;
                    ci.num_re_tx_cur += 1;
                    debug_assert!(ci.in_wheel.iter().all(|w| !w));
                    (delta, ci.num_re_tx_cur > self.config().session_failure_re_tx_limit)
                };
                {
                    let csi = s.client_session_info_mut();
                    csi.credits += delta;
                    csi.num_re_tx += 1;
                }
                self.pkt_loss_stats.borrow_mut().num_re_tx += 1;

                warn!(
                    rpc = self.get_rpc_id(),
                    session = session_num,
                    sslot = sslot_idx,
                    req_num = s.sslots[sslot_idx].cur_req_num,
                    rolled_back = delta,
                    "packet loss suspected, retransmitting"
                );

                if failure {
                    to_reset.push(session_num);
                    continue;
                }

                // Spurious packets for the rolled-back range are now dropped
                // by the in-order check (`pkt_num >= num_tx`).
                self.kick_session_slot(s, sslot_idx);
                true
            };
            if kicked {
                self.flush_tx_if_full();
            }
        }

        for session_num in to_reset {
            self.handle_reset_client_st(session_num);
        }

        // SM handshake retransmission.
        let pending: Vec<u16> = self.sm_pending.borrow().iter().copied().collect();
        for session_num in pending {
            let due = {
                let sessions = self.sessions.borrow();
                match sessions
                    .get(session_num as usize)
                    .and_then(|s| s.as_ref())
                {
                    Some(s) if sm_state_is_pending(s.state) => {
                        now.saturating_sub(s.sm_req_ts) > self.sm_timeout_cycles()
                    }
                    _ => false,
                }
            };
            if due {
                warn!(session = session_num, "SM request timed out, retransmitting");
                self.send_sm_req_st(session_num);
            }
        }
    }
}

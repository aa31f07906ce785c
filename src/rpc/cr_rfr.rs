//! Explicit credit return (CR) and request-for-response (RFR) control
//! packets.
//!
//! CRs let a multi-packet request's sender pipeline its remaining window:
//! the server returns one credit per received packet except the last, whose
//! credit rides back on response packet 0. RFRs pull the remaining packets
//! of a multi-packet response, one credit each.

use tracing::trace;

use crate::config::SESSION_CREDITS;
use crate::packet::{PktHdr, PktType};
use crate::transport::{RoutingInfo, Transport};

use super::Rpc;

impl<T: Transport> Rpc<T> {
    /// Enqueue an explicit credit return for a received request packet.
    /// The CR echoes the triggering packet's number.
    pub(crate) fn enqueue_cr_st(
        &self,
        routing_info: RoutingInfo,
        remote_session_num: u16,
        req_pkthdr: &PktHdr,
    ) {
        let cr_hdr = PktHdr::new(
            req_pkthdr.req_type(),
            0,
            remote_session_num,
            PktType::ExplicitCr,
            req_pkthdr.pkt_num(),
            req_pkthdr.req_num(),
        );
        self.push_ctrl_pkt(routing_info, &cr_hdr, None);
        self.dpath_stats.borrow_mut().expl_cr_tx += 1;
    }

    /// Process an explicit credit return at the client.
    pub(crate) fn process_expl_cr_st(&self, session_num: u16, hdr: &PktHdr, rx_tsc: u64) {
        let mut sessions = self.sessions.borrow_mut();
        let s = match sessions
            .get_mut(session_num as usize)
            .and_then(|s| s.as_mut())
        {
            Some(s) if s.is_client() => s,
            _ => return,
        };
        let sslot_idx = (hdr.req_num() % SESSION_CREDITS as u64) as usize;

        {
            let sslot = &s.sslots[sslot_idx];
            if !self.in_order_client(sslot.client_info(), sslot.cur_req_num, hdr) {
                trace!(rpc = self.get_rpc_id(), "dropping out-of-order CR");
                return;
            }
        }

        let pkt_num = hdr.pkt_num() as usize;
        let tainted = s.sslots[sslot_idx].client_info().num_re_tx_cur > 0;
        if self.config().enable_cc && !tainted {
            let tx_ts = s.sslots[sslot_idx].client_info().tx_ts[pkt_num % SESSION_CREDITS];
            let rtt_us = crate::timing::to_usec(
                rx_tsc.saturating_sub(tx_ts),
                self.freq_ghz_internal(),
            );
            s.client_session_info().cc.timely.update(rtt_us);
        }

        Self::bump_credits(s);
        s.sslots[sslot_idx].client_info_mut().num_rx += 1;

        // The freed credit may unblock this request's remaining packets.
        let pending = {
            let sslot = &s.sslots[sslot_idx];
            sslot.client_info().num_tx < sslot.tx_msgbuf.as_ref().map(|m| m.num_pkts()).unwrap_or(0)
        };
        if pending {
            self.kick_req_session(s, sslot_idx);
        }
    }

    /// Process a request-for-response at the server: emit the response
    /// packet the client asked for.
    pub(crate) fn process_rfr_st(&self, session_num: u16, hdr: &PktHdr) {
        let mut sessions = self.sessions.borrow_mut();
        let s = match sessions
            .get_mut(session_num as usize)
            .and_then(|s| s.as_mut())
        {
            Some(s) if !s.is_client() => s,
            _ => return,
        };
        let routing_info = s.remote_routing_info.unwrap();
        let sslot_idx = (hdr.req_num() % SESSION_CREDITS as u64) as usize;
        let sslot = &mut s.sslots[sslot_idx];

        if hdr.req_num() != sslot.cur_req_num {
            return;
        }
        let pkt_num = hdr.pkt_num() as usize;
        let si = sslot.server_info();
        if pkt_num < si.num_req_pkts {
            // RFR packet numbers start after the request's.
            return;
        }
        let resp_idx = pkt_num - (si.num_req_pkts - 1);

        if pkt_num < si.num_rx {
            // Duplicate RFR after client rollback: our response packet was
            // lost, re-send it.
            if let Some(resp) = &sslot.tx_msgbuf {
                trace!(rpc = self.get_rpc_id(), resp_idx, "re-sending response packet for duplicate RFR");
                self.push_data_pkt(routing_info, resp, resp_idx, None);
            }
            return;
        }
        if pkt_num > si.num_rx {
            return;
        }

        if sslot.tx_msgbuf.is_none() {
            // The response is not ready; the client will re-ask after RTO.
            return;
        }
        sslot.server_info_mut().num_rx += 1;
        let resp = sslot.tx_msgbuf.as_ref().unwrap();
        self.push_data_pkt(routing_info, resp, resp_idx, None);
    }
}

//! Credit-and-wheel gated transmission.
//!
//! A kick pushes as many of an sslot's pending packets as the session's
//! credits allow, either straight into the TX batch or through the pacing
//! wheel. Credits are consumed here for both paths; `num_tx` advances with
//! each staged packet and `in_order_client` treats wheel residents as
//! unsent.

use tracing::trace;

use crate::config::SESSION_CREDITS;
use crate::packet::{PktHdr, PktType};
use crate::session::Session;
use crate::timing::rdtsc;
use crate::transport::{Transport, TxTsKey};
use crate::wheel::WheelEnt;

use super::Rpc;

impl<T: Transport> Rpc<T> {
    /// Kick request packets for an sslot, by session number.
    pub(crate) fn kick_req_st(&self, session_num: u16, sslot_idx: usize) {
        let mut sessions = self.sessions.borrow_mut();
        if let Some(s) = sessions
            .get_mut(session_num as usize)
            .and_then(|s| s.as_mut())
        {
            if s.is_client() {
                self.kick_req_session(s, sslot_idx);
            }
        }
    }

    /// Kick whatever an sslot is currently short of: request packets during
    /// the request phase, RFRs during the response phase.
    pub(crate) fn kick_session_slot(&self, s: &mut Session, sslot_idx: usize) {
        let (req_pending, rfr_pending) = {
            let sslot = &s.sslots[sslot_idx];
            let num_req_pkts = match &sslot.tx_msgbuf {
                Some(m) => m.num_pkts(),
                // Completed while queued in the stall queue.
                None => return,
            };
            let ci = sslot.client_info();
            let req_pending = ci.num_tx < num_req_pkts;
            let rfr_pending = !req_pending
                && ci.resp_num_pkts > 1
                && ci.num_tx < num_req_pkts + ci.resp_num_pkts - 1;
            (req_pending, rfr_pending)
        };
        if req_pending {
            self.kick_req_session(s, sslot_idx);
        } else if rfr_pending {
            self.kick_rfr_session(s, sslot_idx);
        }
    }

    /// Kick request packets for an sslot. The caller holds the sessions
    /// borrow and passes the session directly.
    pub(crate) fn kick_req_session(&self, s: &mut Session, sslot_idx: usize) {
        let session_num = s.local_session_num;
        let routing_info = match s.remote_routing_info {
            Some(r) => r,
            None => return,
        };
        let uncongested = s.is_uncongested();

        let csi = s.client.as_mut().expect("kick on server session");
        let sslot = &mut s.sslots[sslot_idx];
        let cur_req_num = sslot.cur_req_num;
        let msgbuf = match &sslot.tx_msgbuf {
            Some(m) => m,
            // Completed while queued in the stall queue.
            None => return,
        };
        let num_pkts = msgbuf.num_pkts();
        let ci = match &mut sslot.info {
            crate::session::SSlotInfo::Client(ci) => ci,
            crate::session::SSlotInfo::Server(_) => unreachable!(),
        };

        if ci.num_tx >= num_pkts {
            return;
        }
        let sending = csi.credits.min(num_pkts - ci.num_tx);

        for _ in 0..sending {
            let pkt_num = ci.num_tx;
            csi.credits -= 1;
            let ts_idx = (pkt_num % SESSION_CREDITS) as u8;
            // Optimistic stamp; the burst engine overwrites it at flush.
            ci.tx_ts[ts_idx as usize] = rdtsc();

            if self.can_bypass_wheel(ci, uncongested) {
                self.push_data_pkt(
                    routing_info,
                    msgbuf,
                    pkt_num,
                    Some(TxTsKey {
                        session_num,
                        sslot_idx: sslot_idx as u8,
                        ts_idx,
                    }),
                );
            } else {
                let pktsz = msgbuf.pkt_size(pkt_num);
                let ref_tsc = rdtsc();
                let desired_tx_tsc = csi.cc.get_update_tx_tsc(ref_tsc, pktsz);
                trace!(
                    rpc = self.get_rpc_id(),
                    session = session_num,
                    req_num = cur_req_num,
                    pkt_num,
                    "REQ wheeled"
                );
                self.wheel.borrow_mut().insert(
                    WheelEnt {
                        session_num,
                        sslot_idx: sslot_idx as u8,
                        pkt_num: pkt_num as u16,
                        req_num: cur_req_num,
                    },
                    ref_tsc,
                    desired_tx_tsc,
                );
                ci.in_wheel[pkt_num % SESSION_CREDITS] = true;
                ci.wheel_count += 1;
            }
            ci.num_tx += 1;
        }

        // Still short on credits: wait in the stall queue.
        if ci.num_tx < num_pkts && !ci.in_stallq {
            ci.in_stallq = true;
            self.stallq
                .borrow_mut()
                .push_back((session_num, sslot_idx as u8));
        }
    }

    /// Kick request-for-response packets for an sslot whose multi-packet
    /// response is partially received.
    pub(crate) fn kick_rfr_session(&self, s: &mut Session, sslot_idx: usize) {
        let session_num = s.local_session_num;
        let routing_info = match s.remote_routing_info {
            Some(r) => r,
            None => return,
        };
        let remote_session_num = s.remote_session_num;
        let uncongested = s.is_uncongested();

        let csi = s.client.as_mut().expect("kick on server session");
        let sslot = &mut s.sslots[sslot_idx];
        let cur_req_num = sslot.cur_req_num;
        let msgbuf = match &sslot.tx_msgbuf {
            Some(m) => m,
            None => return,
        };
        let num_req_pkts = msgbuf.num_pkts();
        let req_type = unsafe { PktHdr::read_from(msgbuf.pkthdr_ptr(0)) }.req_type();
        let ci = match &mut sslot.info {
            crate::session::SSlotInfo::Client(ci) => ci,
            crate::session::SSlotInfo::Server(_) => unreachable!(),
        };
        debug_assert!(ci.resp_num_pkts > 1);

        let wire_total = num_req_pkts + ci.resp_num_pkts - 1;
        while csi.credits > 0 && ci.num_tx < wire_total {
            let pkt_num = ci.num_tx;
            csi.credits -= 1;
            let ts_idx = (pkt_num % SESSION_CREDITS) as u8;
            ci.tx_ts[ts_idx as usize] = rdtsc();

            if self.can_bypass_wheel(ci, uncongested) {
                let rfr_hdr = PktHdr::new(
                    req_type,
                    0,
                    remote_session_num,
                    PktType::Rfr,
                    pkt_num as u16,
                    cur_req_num,
                );
                self.push_ctrl_pkt(
                    routing_info,
                    &rfr_hdr,
                    Some(TxTsKey {
                        session_num,
                        sslot_idx: sslot_idx as u8,
                        ts_idx,
                    }),
                );
                self.dpath_stats.borrow_mut().rfr_tx += 1;
            } else {
                // Pace by the size of the response packet being pulled.
                let resp_idx = pkt_num - (num_req_pkts - 1);
                let pktsz = ci
                    .resp_msgbuf
                    .as_ref()
                    .expect("response buffer missing")
                    .pkt_size(resp_idx);
                let ref_tsc = rdtsc();
                let desired_tx_tsc = csi.cc.get_update_tx_tsc(ref_tsc, pktsz);
                trace!(
                    rpc = self.get_rpc_id(),
                    session = session_num,
                    req_num = cur_req_num,
                    pkt_num,
                    "RFR wheeled"
                );
                self.wheel.borrow_mut().insert(
                    WheelEnt {
                        session_num,
                        sslot_idx: sslot_idx as u8,
                        pkt_num: pkt_num as u16,
                        req_num: cur_req_num,
                    },
                    ref_tsc,
                    desired_tx_tsc,
                );
                ci.in_wheel[pkt_num % SESSION_CREDITS] = true;
                ci.wheel_count += 1;
            }
            ci.num_tx += 1;
        }

        if ci.num_tx < wire_total && !ci.in_stallq {
            ci.in_stallq = true;
            self.stallq
                .borrow_mut()
                .push_back((session_num, sslot_idx as u8));
        }
    }
}

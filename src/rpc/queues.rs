//! Queue handlers: credit stall queue, pacing wheel drain, background
//! handoff queues.

use tracing::error;

use crate::config::SESSION_CREDITS;
use crate::packet::{PktHdr, PktType};
use crate::session::SSlotInfo;
use crate::timing::rdtsc;
use crate::transport::{Transport, TxTsKey};

use super::Rpc;

impl<T: Transport> Rpc<T> {
    /// Retry transmission for sslots that stalled waiting for credits.
    /// Each entry is popped once per loop; a kick re-queues it if it is
    /// still short.
    pub(crate) fn process_credit_stall_queue_st(&self) {
        let n = self.stallq.borrow().len();
        for _ in 0..n {
            let (session_num, sslot_idx) = match self.stallq.borrow_mut().pop_front() {
                Some(e) => e,
                None => break,
            };
            {
                let mut sessions = self.sessions.borrow_mut();
                let s = match sessions
                    .get_mut(session_num as usize)
                    .and_then(|s| s.as_mut())
                {
                    Some(s) if s.is_client() => s,
                    // Session reset while stalled.
                    _ => continue,
                };
                s.sslots[sslot_idx as usize].client_info_mut().in_stallq = false;
                self.kick_session_slot(s, sslot_idx as usize);
            }
            self.flush_tx_if_full();
        }
    }

    /// Release paced packets whose transmit time has arrived. Credits for
    /// these packets were paid at insertion.
    pub(crate) fn process_wheel_st(&self) {
        if !self.config().enable_pacing {
            return;
        }

        let mut reap = self.wheel_reap_take();
        self.wheel.borrow_mut().advance_into(rdtsc(), &mut reap);

        for ent in reap.drain(..) {
            {
                let mut sessions = self.sessions.borrow_mut();
                let s = match sessions
                    .get_mut(ent.session_num as usize)
                    .and_then(|s| s.as_mut())
                {
                    Some(s) if s.is_client() => s,
                    // The session was reset with packets still wheeled.
                    _ => continue,
                };
                let routing_info = s.remote_routing_info.unwrap();
                let remote_session_num = s.remote_session_num;
                let session_num = s.local_session_num;

                let sslot = &mut s.sslots[ent.sslot_idx as usize];
                if sslot.cur_req_num != ent.req_num {
                    continue;
                }
                let pkt_num = ent.pkt_num as usize;
                let wheel_slot = pkt_num % SESSION_CREDITS;

                let msgbuf = sslot.tx_msgbuf.as_ref();
                let ci = match &mut sslot.info {
                    SSlotInfo::Client(ci) => ci,
                    SSlotInfo::Server(_) => continue,
                };
                if !ci.in_wheel[wheel_slot] {
                    continue;
                }
                ci.in_wheel[wheel_slot] = false;
                ci.wheel_count -= 1;

                let msgbuf = match msgbuf {
                    Some(m) => m,
                    None => continue,
                };
                let ts_idx = wheel_slot as u8;
                ci.tx_ts[wheel_slot] = rdtsc();
                let ts_key = Some(TxTsKey {
                    session_num,
                    sslot_idx: ent.sslot_idx,
                    ts_idx,
                });

                if pkt_num < msgbuf.num_pkts() {
                    self.push_data_pkt(routing_info, msgbuf, pkt_num, ts_key);
                } else {
                    let req_type = unsafe { PktHdr::read_from(msgbuf.pkthdr_ptr(0)) }.req_type();
                    let rfr_hdr = PktHdr::new(
                        req_type,
                        0,
                        remote_session_num,
                        PktType::Rfr,
                        ent.pkt_num,
                        ent.req_num,
                    );
                    self.push_ctrl_pkt(routing_info, &rfr_hdr, ts_key);
                    self.dpath_stats.borrow_mut().rfr_tx += 1;
                }
            }
            self.flush_tx_if_full();
        }

        self.wheel_reap_put(reap);
    }

    /// Drain the three background handoff queues.
    pub(crate) fn process_bg_queues_st(&self) {
        while let Ok(args) = self.enq_req_rx.try_recv() {
            if let Err(e) = self.enqueue_request_args(args) {
                error!(error = %e, "background enqueue_request failed");
            }
        }
        while let Ok(handle) = self.enq_resp_rx.try_recv() {
            self.enqueue_response_st(handle);
            self.flush_tx_if_full();
        }
        while let Ok(resp) = self.rel_resp_rx.try_recv() {
            self.release_response_st(resp);
        }
    }

    // The reap buffer is reused across ticks to avoid allocation.
    fn wheel_reap_take(&self) -> Vec<crate::wheel::WheelEnt> {
        let mut reap = self.wheel_reap.borrow_mut();
        let mut v = std::mem::take(&mut *reap);
        v.clear();
        v
    }

    fn wheel_reap_put(&self, v: Vec<crate::wheel::WheelEnt>) {
        *self.wheel_reap.borrow_mut() = v;
    }
}

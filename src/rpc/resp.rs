//! Response path: server-side enqueue and client-side completion.

use tracing::trace;

use crate::bg::{BgWorkItem, ContFunc, ReqHandle, RespHandle};
use crate::config::SESSION_CREDITS;
use crate::packet::{PktHdr, PktType, PKT_HDR_SIZE};
use crate::timing::to_usec;
use crate::transport::Transport;

use super::{write_data_pkt_hdrs, Rpc};

impl<T: Transport> Rpc<T> {
    /// Install the handler's response on the server sslot and transmit its
    /// first packet. Buries the request buffer; response packet 0 implicitly
    /// returns the credit for the last request packet.
    pub(crate) fn enqueue_response_st(&self, mut handle: ReqHandle) {
        let session_num = handle.session_num;
        {
            let mut sessions = self.sessions.borrow_mut();
            let s = match sessions
                .get_mut(session_num as usize)
                .and_then(|s| s.as_mut())
            {
                Some(s) if !s.is_client() => s,
                // Session torn down while the handler ran; the buffers in
                // the handle free themselves.
                _ => return,
            };
            let routing_info = s.remote_routing_info.unwrap();
            let remote_session_num = s.remote_session_num;
            let sslot = &mut s.sslots[handle.sslot_idx];

            if sslot.cur_req_num != handle.req_num {
                // The slot moved on; return the preallocated buffer if the
                // new request has not claimed it.
                let si = sslot.server_info_mut();
                if si.pre_resp_msgbuf.is_none() {
                    si.pre_resp_msgbuf = handle.pre_resp_msgbuf.take();
                }
                return;
            }

            let si = sslot.server_info_mut();
            si.handler_running = false;
            let num_req_pkts = si.num_req_pkts;

            let (mut resp, prealloc_used) = match handle.dyn_resp_msgbuf.take() {
                Some(dyn_buf) => {
                    if let Some(pre) = handle.pre_resp_msgbuf.take() {
                        si.pre_resp_msgbuf = Some(pre);
                    }
                    (dyn_buf, false)
                }
                None => (
                    handle
                        .pre_resp_msgbuf
                        .take()
                        .expect("response buffer missing"),
                    true,
                ),
            };
            assert!(resp.is_valid());
            assert!(resp.data_size() <= Self::MAX_MSG_SIZE);
            si.prealloc_used = prealloc_used;

            // Response packet i carries pkt_num (num_req_pkts - 1) + i,
            // continuing the request's packet-number sequence.
            write_data_pkt_hdrs(
                &mut resp,
                handle.req_type,
                remote_session_num,
                PktType::Resp,
                num_req_pkts - 1,
                handle.req_num,
            );

            self.push_data_pkt(routing_info, &resp, 0, None);
            sslot.tx_msgbuf = Some(resp);
            // The request buffer in `handle` is buried (dropped) here.
        }
        self.flush_tx_if_full();
    }

    /// Release a response handle: the sslot returns to the free stack and
    /// one backlogged request is drained FIFO.
    pub(crate) fn release_response_st(&self, resp_handle: RespHandle) {
        if resp_handle.failed {
            // The session was reset; nothing to free.
            return;
        }
        let session_num = resp_handle.session_num;
        let next = {
            let mut sessions = self.sessions.borrow_mut();
            let s = match sessions
                .get_mut(session_num as usize)
                .and_then(|s| s.as_mut())
            {
                Some(s) if s.is_client() => s,
                _ => return,
            };
            let csi = s.client_session_info_mut();
            debug_assert!(!csi.sslot_free_vec.contains(&resp_handle.sslot_idx));
            csi.sslot_free_vec.push(resp_handle.sslot_idx);
            csi.backlog.pop_front()
        };

        if let Some(args) = next {
            if let Err(e) = self.enqueue_request_args(args) {
                tracing::error!(error = %e, "backlogged request failed");
            }
        }
    }

    /// Process one response packet at the client.
    pub(crate) fn process_resp_one_st(
        &self,
        session_num: u16,
        hdr: &PktHdr,
        hdr_ptr: *const u8,
        rx_tsc: u64,
    ) {
        let mdpp = T::MAX_DATA_PER_PKT;
        let completion: Option<(ContFunc, RespHandle, Option<usize>)> = {
            let mut sessions = self.sessions.borrow_mut();
            let sslot_idx = (hdr.req_num() % SESSION_CREDITS as u64) as usize;
            let pkt_num = hdr.pkt_num() as usize;

            let is_complete = {
                let s = match sessions
                    .get_mut(session_num as usize)
                    .and_then(|s| s.as_mut())
                {
                    Some(s) if s.is_client() => s,
                    _ => return,
                };

                {
                    let sslot = &s.sslots[sslot_idx];
                    if !self.in_order_client(sslot.client_info(), sslot.cur_req_num, hdr) {
                        trace!(rpc = self.get_rpc_id(), "dropping out-of-order response packet");
                        return;
                    }
                }

                // Close the RTT for this packet; samples from a rolled-back
                // request are discarded.
                let tainted = s.sslots[sslot_idx].client_info().num_re_tx_cur > 0;
                if self.config().enable_cc && !tainted {
                    let tx_ts =
                        s.sslots[sslot_idx].client_info().tx_ts[pkt_num % SESSION_CREDITS];
                    let rtt_us =
                        to_usec(rx_tsc.saturating_sub(tx_ts), self.freq_ghz_internal());
                    s.client_session_info()
                        .cc
                        .timely
                        .update(rtt_us);
                }

                Self::bump_credits(s);

                let num_req_pkts = s.sslots[sslot_idx]
                    .tx_msgbuf
                    .as_ref()
                    .expect("request buffer missing")
                    .num_pkts();
                let sslot = &mut s.sslots[sslot_idx];
                let ci = sslot.client_info_mut();
                ci.num_rx += 1;

                if pkt_num == num_req_pkts - 1 {
                    // First response packet: learn the response size.
                    let msg_size = hdr.msg_size();
                    let resp = ci.resp_msgbuf.as_mut().unwrap();
                    assert!(
                        msg_size <= resp.max_data_size(),
                        "response ({} B) exceeds the response buffer ({} B)",
                        msg_size,
                        resp.max_data_size()
                    );
                    resp.resize(msg_size);
                    ci.resp_num_pkts = resp.num_pkts();
                }

                let resp_idx = pkt_num - (num_req_pkts - 1);
                let resp = ci.resp_msgbuf.as_mut().unwrap();
                let to_copy = (resp.data_size() - resp_idx * mdpp).min(mdpp);
                resp.copy_in(
                    resp_idx * mdpp,
                    unsafe { hdr_ptr.add(PKT_HDR_SIZE) },
                    to_copy,
                );

                let wire_total = num_req_pkts + ci.resp_num_pkts - 1;
                if ci.num_rx == wire_total {
                    true
                } else {
                    // Multi-packet response: ask for the rest, credits
                    // permitting. Each arriving packet above returned one.
                    self.kick_rfr_session(s, sslot_idx);
                    false
                }
            };

            if !is_complete {
                None
            } else {
                self.delete_from_active_rpc_list(&mut sessions[..], session_num, sslot_idx);
                let s = sessions[session_num as usize].as_mut().unwrap();
                let sslot = &mut s.sslots[sslot_idx];
                let req_msgbuf = sslot.tx_msgbuf.take();
                let ci = sslot.client_info_mut();
                let resp_msgbuf = ci.resp_msgbuf.take();
                let cont = ci.cont.take().expect("continuation missing");
                let tag = ci.tag;
                let bg = ci.cont_bg_id;
                trace!(
                    rpc = self.get_rpc_id(),
                    session = session_num,
                    sslot = sslot_idx,
                    req_num = sslot.cur_req_num,
                    "request completed"
                );
                Some((
                    cont,
                    RespHandle {
                        session_num,
                        sslot_idx,
                        req_msgbuf,
                        resp_msgbuf,
                        tag,
                        failed: false,
                    },
                    bg,
                ))
            }
        };

        if let Some((cont, resp_handle, bg)) = completion {
            self.deliver_continuation(cont, resp_handle, bg);
        }
    }

    pub(crate) fn deliver_continuation(
        &self,
        cont: ContFunc,
        resp_handle: RespHandle,
        bg_id: Option<usize>,
    ) {
        match bg_id {
            None => cont(resp_handle, self),
            Some(_) => self.submit_background_st(
                BgWorkItem::Continuation {
                    cont,
                    resp: resp_handle,
                },
                bg_id,
            ),
        }
    }
}

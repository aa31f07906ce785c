//! Request path: client-side enqueue and server-side request processing.

use tracing::{trace, warn};

use crate::bg::{BgWorkItem, Datapath, EnqueueRequestArgs, ReqHandle, ReqHandlerFn, ReqHandlerType, RespHandle};
use crate::buffer::MsgBuffer;
use crate::config::SESSION_CREDITS;
use crate::error::{Error, Result};
use crate::packet::{data_size_to_num_pkts, PktHdr, PktType, PKT_HDR_SIZE};
use crate::session::SSlot;
use crate::transport::Transport;

use super::{write_data_pkt_hdrs, Rpc};

/// Handler invocation decided under the sessions borrow and executed after
/// releasing it, so the handler can re-enter the endpoint.
enum HandlerDispatch {
    Foreground(ReqHandlerFn, ReqHandle),
    Background(ReqHandlerFn, ReqHandle),
}

impl<T: Transport> Rpc<T> {
    /// Try to enqueue a request for transmission.
    ///
    /// The endpoint owns `req_msgbuf` and `resp_msgbuf` until the
    /// continuation runs; both return to the app inside the [`RespHandle`].
    /// If no session slot is free the request is queued on the session's
    /// backlog and sent in FIFO order as slots free up.
    ///
    /// `cont_bg_id` selects the background worker for the continuation;
    /// `None` runs it on the dispatcher.
    pub fn enqueue_request<F>(
        &self,
        session_num: u16,
        req_type: u8,
        req_msgbuf: MsgBuffer,
        resp_msgbuf: MsgBuffer,
        cont: F,
        tag: usize,
        cont_bg_id: Option<usize>,
    ) -> Result<()>
    where
        F: FnOnce(RespHandle, &dyn Datapath) + Send + 'static,
    {
        self.enqueue_request_args(EnqueueRequestArgs {
            session_num,
            req_type,
            req_msgbuf,
            resp_msgbuf,
            cont: Box::new(cont),
            tag,
            cont_bg_id,
        })
    }

    pub(crate) fn enqueue_request_args(&self, args: EnqueueRequestArgs) -> Result<()> {
        assert!(args.req_msgbuf.is_valid() && args.resp_msgbuf.is_valid());
        assert!(args.req_msgbuf.data_size() <= Self::MAX_MSG_SIZE);
        if let Some(bg_id) = args.cont_bg_id {
            assert!(bg_id < self.num_bg_threads(), "bad background worker id");
        }
        let session_num = args.session_num;

        let kick_idx = {
            let mut sessions = self.sessions.borrow_mut();
            let s = sessions
                .get_mut(session_num as usize)
                .and_then(|s| s.as_mut())
                .ok_or(Error::SessionNotFound(session_num))?;
            assert!(s.is_client(), "enqueue_request on a server session");
            if !s.is_connected() {
                return Err(Error::SessionNotConnected(session_num));
            }

            let csi = s.client_session_info_mut();
            let sslot_idx = match csi.sslot_free_vec.pop() {
                Some(i) => i,
                None => {
                    // Never an error: drained FIFO as slots are released.
                    csi.backlog.push_back(args);
                    return Ok(());
                }
            };

            let remote_session_num = s.remote_session_num;
            let sslot = &mut s.sslots[sslot_idx];
            sslot.cur_req_num += SESSION_CREDITS as u64;
            let req_num = sslot.cur_req_num;

            let mut req_msgbuf = args.req_msgbuf;
            write_data_pkt_hdrs(
                &mut req_msgbuf,
                args.req_type,
                remote_session_num,
                PktType::Req,
                0,
                req_num,
            );
            sslot.tx_msgbuf = Some(req_msgbuf);

            let ci = sslot.client_info_mut();
            ci.resp_msgbuf = Some(args.resp_msgbuf);
            ci.cont = Some(args.cont);
            ci.tag = args.tag;
            ci.cont_bg_id = args.cont_bg_id;
            ci.num_tx = 0;
            ci.num_rx = 0;
            ci.resp_num_pkts = 0;
            ci.num_re_tx_cur = 0;
            debug_assert_eq!(ci.wheel_count, 0);

            trace!(
                rpc = self.get_rpc_id(),
                session = session_num,
                sslot = sslot_idx,
                req_num,
                "request enqueued"
            );

            self.add_to_active_rpc_list(s, sslot_idx);

            let csi = s.client_session_info_mut();
            if csi.credits > 0 {
                Some(sslot_idx)
            } else {
                let ci = s.sslots[sslot_idx].client_info_mut();
                if !ci.in_stallq {
                    ci.in_stallq = true;
                    self.stallq
                        .borrow_mut()
                        .push_back((session_num, sslot_idx as u8));
                }
                None
            }
        };

        if let Some(idx) = kick_idx {
            self.kick_req_st(session_num, idx);
        }
        Ok(())
    }

    /// Process a single-packet request at the server.
    ///
    /// `hdr_ptr` points into the receive ring; the fake request MsgBuffer
    /// borrows it zero-copy for foreground handlers.
    pub(crate) fn process_small_req_st(&self, session_num: u16, hdr: &PktHdr, hdr_ptr: *const u8) {
        let dispatch = {
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

            if hdr.req_num() < sslot.cur_req_num {
                // Response for this old request was sent and its slot reused.
                return;
            }

            if hdr.req_num() == sslot.cur_req_num {
                // Duplicate: the client did not see our response. Re-send it
                // if we still have it; drop if the handler is still running.
                if let Some(resp) = &sslot.tx_msgbuf {
                    trace!(rpc = self.get_rpc_id(), "re-sending response for duplicate request");
                    self.push_data_pkt(routing_info, resp, 0, None);
                }
                return;
            }

            // New request: bury the previous response and request buffers.
            Self::bury_resp_msgbuf_server(sslot);
            sslot.server_info_mut().req_msgbuf = None;

            sslot.cur_req_num = hdr.req_num();
            let si = sslot.server_info_mut();
            si.req_type = hdr.req_type();
            si.num_rx = 1;
            si.num_req_pkts = 1;

            let entry = match self.req_handlers.borrow()[hdr.req_type() as usize] {
                Some(ref e) => (e.func.clone(), e.kind),
                None => {
                    warn!(req_type = hdr.req_type(), "no handler for request type, dropping");
                    return;
                }
            };
            si.handler_running = true;
            let pre_resp_msgbuf = si.pre_resp_msgbuf.take();

            match entry.1 {
                ReqHandlerType::Foreground => {
                    // Zero-copy: the request borrows the ring entry, valid
                    // until this rx batch's descriptors are reposted.
                    let req_msgbuf = unsafe {
                        MsgBuffer::fake_from_ring(hdr_ptr, hdr.msg_size(), T::MAX_DATA_PER_PKT)
                    };
                    HandlerDispatch::Foreground(
                        entry.0,
                        ReqHandle {
                            session_num,
                            sslot_idx,
                            req_num: hdr.req_num(),
                            req_type: hdr.req_type(),
                            req_msgbuf,
                            pre_resp_msgbuf,
                            dyn_resp_msgbuf: None,
                        },
                    )
                }
                ReqHandlerType::Background => {
                    // The ring entry is recycled before the worker runs;
                    // copy the request out.
                    let mut req_msgbuf = MsgBuffer::alloc(
                        &self.huge_alloc,
                        hdr.msg_size().max(1),
                        T::MAX_DATA_PER_PKT,
                    );
                    assert!(req_msgbuf.is_valid(), "out of hugepage memory in datapath");
                    req_msgbuf.resize(hdr.msg_size());
                    if hdr.msg_size() > 0 {
                        req_msgbuf.copy_in(0, unsafe { hdr_ptr.add(PKT_HDR_SIZE) }, hdr.msg_size());
                    }
                    HandlerDispatch::Background(
                        entry.0,
                        ReqHandle {
                            session_num,
                            sslot_idx,
                            req_num: hdr.req_num(),
                            req_type: hdr.req_type(),
                            req_msgbuf,
                            pre_resp_msgbuf,
                            dyn_resp_msgbuf: None,
                        },
                    )
                }
            }
        };

        self.dispatch_handler(dispatch);
    }

    /// Process one packet of a multi-packet request at the server.
    pub(crate) fn process_large_req_one_st(&self, session_num: u16, hdr: &PktHdr, hdr_ptr: *const u8) {
        let mdpp = T::MAX_DATA_PER_PKT;
        let dispatch = {
            let mut sessions = self.sessions.borrow_mut();
            let s = match sessions
                .get_mut(session_num as usize)
                .and_then(|s| s.as_mut())
            {
                Some(s) if !s.is_client() => s,
                _ => return,
            };
            let routing_info = s.remote_routing_info.unwrap();
            let remote_session_num = s.remote_session_num;
            let sslot_idx = (hdr.req_num() % SESSION_CREDITS as u64) as usize;
            let sslot = &mut s.sslots[sslot_idx];
            let pkt_num = hdr.pkt_num() as usize;

            if hdr.req_num() < sslot.cur_req_num {
                return;
            }

            if hdr.req_num() > sslot.cur_req_num {
                if pkt_num != 0 {
                    // First packet lost; the client's rollback will resend
                    // the request from the start.
                    return;
                }
                Self::bury_resp_msgbuf_server(sslot);
                sslot.server_info_mut().req_msgbuf = None;

                sslot.cur_req_num = hdr.req_num();
                let si = sslot.server_info_mut();
                si.req_type = hdr.req_type();
                si.num_rx = 0;
                si.num_req_pkts = data_size_to_num_pkts(hdr.msg_size(), mdpp);
                si.handler_running = false;

                let req_msgbuf =
                    MsgBuffer::alloc(&self.huge_alloc, hdr.msg_size(), mdpp);
                assert!(req_msgbuf.is_valid(), "out of hugepage memory in datapath");
                si.req_msgbuf = Some(req_msgbuf);
            }

            let num_req_pkts = sslot.server_info().num_req_pkts;
            let num_rx = sslot.server_info().num_rx;

            if pkt_num < num_rx {
                // Duplicate after client rollback: our CR (or the first
                // response packet) was lost. Re-send it.
                if pkt_num == num_req_pkts - 1 {
                    if let Some(resp) = &sslot.tx_msgbuf {
                        self.push_data_pkt(routing_info, resp, 0, None);
                    }
                    // Handler still running: the response will go out soon.
                } else {
                    self.enqueue_cr_st(routing_info, remote_session_num, hdr);
                }
                return;
            }
            if pkt_num > num_rx {
                // Reordered beyond the next expected packet; the client
                // will retransmit.
                return;
            }

            // In-order request packet.
            {
                let si = sslot.server_info_mut();
                let req_msgbuf = si.req_msgbuf.as_mut().expect("request buffer missing");
                let to_copy = (hdr.msg_size() - pkt_num * mdpp).min(mdpp);
                req_msgbuf.copy_in(pkt_num * mdpp, unsafe { hdr_ptr.add(PKT_HDR_SIZE) }, to_copy);
                si.num_rx += 1;
            }

            if pkt_num != num_req_pkts - 1 {
                // Pipeline: return this packet's credit right away.
                self.enqueue_cr_st(routing_info, remote_session_num, hdr);
                return;
            }

            // Request fully assembled; hand it to the handler.
            let entry = match self.req_handlers.borrow()[hdr.req_type() as usize] {
                Some(ref e) => (e.func.clone(), e.kind),
                None => {
                    warn!(req_type = hdr.req_type(), "no handler for request type, dropping");
                    return;
                }
            };
            let si = sslot.server_info_mut();
            si.handler_running = true;
            let req_msgbuf = si.req_msgbuf.take().unwrap();
            let pre_resp_msgbuf = si.pre_resp_msgbuf.take();
            let handle = ReqHandle {
                session_num,
                sslot_idx,
                req_num: hdr.req_num(),
                req_type: hdr.req_type(),
                req_msgbuf,
                pre_resp_msgbuf,
                dyn_resp_msgbuf: None,
            };
            match entry.1 {
                ReqHandlerType::Foreground => HandlerDispatch::Foreground(entry.0, handle),
                ReqHandlerType::Background => HandlerDispatch::Background(entry.0, handle),
            }
        };

        self.dispatch_handler(dispatch);
    }

    fn dispatch_handler(&self, dispatch: HandlerDispatch) {
        match dispatch {
            HandlerDispatch::Foreground(func, handle) => func(handle, self),
            HandlerDispatch::Background(func, handle) => {
                self.submit_background_st(BgWorkItem::Request { func, handle }, None);
            }
        }
    }

    /// Bury a server sslot's response buffer, returning the preallocated
    /// buffer to its slot and freeing a dynamic one.
    pub(crate) fn bury_resp_msgbuf_server(sslot: &mut SSlot) {
        let resp = sslot.tx_msgbuf.take();
        let si = sslot.server_info_mut();
        if let Some(resp) = resp {
            if si.prealloc_used {
                si.pre_resp_msgbuf = Some(resp);
            }
            // Dynamic responses drop back to the arena here.
        }
    }

}

//! Session management: connect/disconnect handshakes and reset.
//!
//! SM packets ride a dedicated UDP socket, never the datapath. The client
//! retransmits a pending SM request until the response arrives (or the
//! session is reset); the server dedups connect requests by token so a
//! retransmitted request re-sends the cached response instead of allocating
//! a second session.

use std::net::SocketAddr;

use tracing::{debug, info, warn};

use crate::bg::{ContFunc, RespHandle};
use crate::buffer::MsgBuffer;
use crate::config::SESSION_CREDITS;
use crate::error::{Error, Result};
use crate::session::{Role, Session, SessionState, ACTIVE_POS_NONE};
use crate::sm::{SmEndpoint, SmEvent, SmEventType, SmPkt, SmPktType, SmStatus};
use crate::timing::rdtsc;
use crate::transport::Transport;

use super::{sm_state_is_pending, Rpc};

impl<T: Transport> Rpc<T> {
    /// True iff enough ring entries remain for one more session.
    pub(crate) fn have_ring_entries(&self) -> bool {
        self.ring_entries_available.get() >= SESSION_CREDITS
    }

    pub(crate) fn alloc_ring_entries(&self) {
        debug_assert!(self.have_ring_entries());
        self.ring_entries_available
            .set(self.ring_entries_available.get() - SESSION_CREDITS);
    }

    pub(crate) fn free_ring_entries(&self) {
        self.ring_entries_available
            .set(self.ring_entries_available.get() + SESSION_CREDITS);
        debug_assert!(self.ring_entries_available.get() <= T::NUM_RX_RING_ENTRIES);
    }

    /// Create a client session and start its connect handshake.
    ///
    /// Returns the local session number; the outcome arrives later as a
    /// `Connected` or `ConnectFailed` SM event.
    pub fn create_session(&self, remote_uri: &str, remote_rpc_id: u8) -> Result<u16> {
        use std::net::ToSocketAddrs;
        let remote_sm_addr = remote_uri
            .to_socket_addrs()
            .map_err(|_| Error::InvalidRemoteUri(remote_uri.to_string()))?
            .next()
            .ok_or_else(|| Error::InvalidRemoteUri(remote_uri.to_string()))?;

        if !self.have_ring_entries() {
            return Err(Error::RingEntriesExhausted);
        }

        let bandwidth = self.transport.borrow().bandwidth() as f64;
        let session_num = {
            let mut sessions = self.sessions.borrow_mut();
            let session_num = match sessions.iter().position(|s| s.is_none()) {
                Some(hole) => hole,
                None => {
                    if sessions.len() >= Self::MAX_NUM_SESSIONS {
                        return Err(Error::RingEntriesExhausted);
                    }
                    sessions.push(None);
                    sessions.len() - 1
                }
            };

            let mut s = Session::new(
                Role::Client,
                session_num as u16,
                bandwidth,
                self.freq_ghz_internal(),
            );
            s.state = SessionState::ConnectInProgress;
            s.remote_uri = remote_uri.to_string();
            s.remote_sm_addr = Some(remote_sm_addr);
            s.remote_rpc_id = remote_rpc_id;
            s.uniq_token = self.rand_u64();
            sessions[session_num] = Some(s);
            session_num as u16
        };

        self.alloc_ring_entries();
        self.sm_pending.borrow_mut().insert(session_num);
        self.send_sm_req_st(session_num);
        Ok(session_num)
    }

    /// Disconnect and destroy a client session. All responses must have been
    /// released and the backlog drained.
    pub fn destroy_session(&self, session_num: u16) -> Result<()> {
        {
            let mut sessions = self.sessions.borrow_mut();
            let s = sessions
                .get_mut(session_num as usize)
                .and_then(|s| s.as_mut())
                .ok_or(Error::SessionNotFound(session_num))?;
            assert!(s.is_client(), "destroy_session on a server session");
            if s.state != SessionState::Connected {
                return Err(Error::SessionNotConnected(session_num));
            }
            let ci = s.client_session_info();
            if ci.sslot_free_vec.len() != SESSION_CREDITS || !ci.backlog.is_empty() {
                return Err(Error::SessionBusy(session_num));
            }
            s.state = SessionState::DisconnectInProgress;
        }
        self.sm_pending.borrow_mut().insert(session_num);
        self.send_sm_req_st(session_num);
        Ok(())
    }

    /// (Re)send the SM request matching the session's state and record the
    /// retransmission deadline.
    pub(crate) fn send_sm_req_st(&self, session_num: u16) {
        let (pkt, dest) = {
            let mut sessions = self.sessions.borrow_mut();
            let s = match sessions
                .get_mut(session_num as usize)
                .and_then(|s| s.as_mut())
            {
                Some(s) => s,
                None => return,
            };
            if !sm_state_is_pending(s.state) {
                return;
            }
            s.sm_req_ts = rdtsc();
            let pkt_type = if s.state == SessionState::ConnectInProgress {
                SmPktType::ConnectReq
            } else {
                SmPktType::DisconnectReq
            };
            let pkt = SmPkt {
                pkt_type,
                status: SmStatus::Success,
                uniq_token: s.uniq_token,
                client: SmEndpoint {
                    uri: self.sm_local_uri.clone(),
                    rpc_id: self.get_rpc_id(),
                    session_num,
                    routing_info: self.transport.borrow().local_routing_info(),
                },
                server: SmEndpoint {
                    uri: s.remote_uri.clone(),
                    rpc_id: s.remote_rpc_id,
                    session_num: s.remote_session_num,
                    routing_info: String::new(),
                },
            };
            (pkt, s.remote_sm_addr.unwrap())
        };

        debug!(session = session_num, pkt_type = ?pkt.pkt_type, "sending SM request");
        self.sm_pkt_udp_tx_st(&pkt, dest);
    }

    pub(crate) fn sm_pkt_udp_tx_st(&self, pkt: &SmPkt, dest: SocketAddr) {
        if let Err(e) = self.sm_socket.send_to(&pkt.encode(), dest) {
            // Recovered by the SM retransmission timer.
            warn!(error = %e, "SM packet send failed");
        }
    }

    /// Drain and process all pending SM packets.
    pub(crate) fn handle_sm_rx_st(&self) {
        let mut buf = [0u8; 1024];
        loop {
            match self.sm_socket.recv_from(&mut buf) {
                Ok((len, from)) => match SmPkt::decode(&buf[..len]) {
                    Ok(pkt) => {
                        debug!(pkt_type = ?pkt.pkt_type, %from, "SM packet received");
                        match pkt.pkt_type {
                            SmPktType::ConnectReq => self.handle_connect_req_st(pkt, from),
                            SmPktType::ConnectResp => self.handle_connect_resp_st(pkt),
                            SmPktType::DisconnectReq => self.handle_disconnect_req_st(pkt, from),
                            SmPktType::DisconnectResp => self.handle_disconnect_resp_st(pkt),
                        }
                    }
                    Err(e) => warn!(error = %e, "malformed SM packet dropped"),
                },
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!(error = %e, "SM socket recv failed");
                    break;
                }
            }
        }
    }

    fn handle_connect_req_st(&self, pkt: SmPkt, from: SocketAddr) {
        if pkt.server.rpc_id != self.get_rpc_id() {
            let resp = pkt.response(SmPktType::ConnectResp, SmStatus::InvalidRemoteRpcId);
            self.sm_pkt_udp_tx_st(&resp, from);
            return;
        }

        // Duplicate connect request: re-send the cached response.
        if let Some(&server_sn) = self.conn_req_tokens.borrow().get(&pkt.uniq_token) {
            let mut resp = pkt.response(SmPktType::ConnectResp, SmStatus::Success);
            resp.server.session_num = server_sn;
            resp.server.routing_info = self.transport.borrow().local_routing_info();
            self.sm_pkt_udp_tx_st(&resp, from);
            return;
        }

        if !self.have_ring_entries() {
            let resp = pkt.response(SmPktType::ConnectResp, SmStatus::ResourceExhausted);
            self.sm_pkt_udp_tx_st(&resp, from);
            return;
        }

        let rinfo = if self.fail_resolve_rinfo() {
            Err(Error::RoutingResolutionFailed)
        } else {
            self.transport
                .borrow()
                .resolve_remote_routing_info(&pkt.client.routing_info)
        };
        let rinfo = match rinfo {
            Ok(r) => r,
            Err(_) => {
                let resp = pkt.response(SmPktType::ConnectResp, SmStatus::RoutingResolutionFailed);
                self.sm_pkt_udp_tx_st(&resp, from);
                return;
            }
        };

        let bandwidth = self.transport.borrow().bandwidth() as f64;
        let server_sn = {
            let mut sessions = self.sessions.borrow_mut();
            let sn = match sessions.iter().position(|s| s.is_none()) {
                Some(hole) => hole,
                None => {
                    if sessions.len() >= Self::MAX_NUM_SESSIONS {
                        drop(sessions);
                        let resp = pkt.response(SmPktType::ConnectResp, SmStatus::ResourceExhausted);
                        self.sm_pkt_udp_tx_st(&resp, from);
                        return;
                    }
                    sessions.push(None);
                    sessions.len() - 1
                }
            };

            let mut s = Session::new(Role::Server, sn as u16, bandwidth, self.freq_ghz_internal());
            s.state = SessionState::Connected;
            s.remote_session_num = pkt.client.session_num;
            s.remote_sm_addr = Some(from);
            s.remote_uri = pkt.client.uri.clone();
            s.remote_rpc_id = pkt.client.rpc_id;
            s.remote_routing_info = Some(rinfo);
            s.uniq_token = pkt.uniq_token;

            for sslot in &mut s.sslots {
                let pre =
                    MsgBuffer::alloc(&self.huge_alloc, T::MAX_DATA_PER_PKT, T::MAX_DATA_PER_PKT);
                if !pre.is_valid() {
                    drop(sessions);
                    let resp = pkt.response(SmPktType::ConnectResp, SmStatus::ResourceExhausted);
                    self.sm_pkt_udp_tx_st(&resp, from);
                    return;
                }
                sslot.server_info_mut().pre_resp_msgbuf = Some(pre);
            }

            sessions[sn] = Some(s);
            sn as u16
        };

        self.alloc_ring_entries();
        self.conn_req_tokens
            .borrow_mut()
            .insert(pkt.uniq_token, server_sn);

        info!(
            server_session = server_sn,
            client_uri = %pkt.client.uri,
            "server session connected"
        );

        let mut resp = pkt.response(SmPktType::ConnectResp, SmStatus::Success);
        resp.server.session_num = server_sn;
        resp.server.routing_info = self.transport.borrow().local_routing_info();
        self.sm_pkt_udp_tx_st(&resp, from);
    }

    fn handle_connect_resp_st(&self, pkt: SmPkt) {
        let session_num = pkt.client.session_num;
        let mut failed_status: Option<SmStatus> = None;
        let mut connected = false;

        {
            let mut sessions = self.sessions.borrow_mut();
            let s = match sessions
                .get_mut(session_num as usize)
                .and_then(|s| s.as_mut())
            {
                Some(s)
                    if s.state == SessionState::ConnectInProgress
                        && s.uniq_token == pkt.uniq_token =>
                {
                    s
                }
                // Duplicate or stale response.
                _ => return,
            };

            match pkt.status {
                SmStatus::Success => {
                    match self
                        .transport
                        .borrow()
                        .resolve_remote_routing_info(&pkt.server.routing_info)
                    {
                        Ok(rinfo) => {
                            s.remote_routing_info = Some(rinfo);
                            s.remote_session_num = pkt.server.session_num;
                            s.state = SessionState::Connected;
                            connected = true;
                        }
                        Err(_) => failed_status = Some(SmStatus::RoutingResolutionFailed),
                    }
                }
                SmStatus::InvalidRemoteRpcId if self.retry_connect_on_invalid_rpc_id.get() => {
                    debug!(session = session_num, "remote endpoint id invalid, will retry");
                    return;
                }
                status => failed_status = Some(status),
            }

            if failed_status.is_some() {
                sessions[session_num as usize] = None;
            }
        }

        self.sm_pending.borrow_mut().remove(&session_num);

        if connected {
            info!(session = session_num, "client session connected");
            self.fire_sm_event(SmEvent {
                session_num,
                event: SmEventType::Connected,
            });
        } else if let Some(status) = failed_status {
            self.free_ring_entries();
            self.fire_sm_event(SmEvent {
                session_num,
                event: SmEventType::ConnectFailed(status),
            });
        }
    }

    fn handle_disconnect_req_st(&self, pkt: SmPkt, from: SocketAddr) {
        let session_num = pkt.server.session_num;
        let mut freed = false;
        {
            let mut sessions = self.sessions.borrow_mut();
            if let Some(slot) = sessions.get_mut(session_num as usize) {
                if let Some(s) = slot.as_ref() {
                    if !s.is_client() && s.uniq_token == pkt.uniq_token {
                        *slot = None;
                        freed = true;
                    }
                }
            }
        }
        if freed {
            self.free_ring_entries();
            self.conn_req_tokens.borrow_mut().remove(&pkt.uniq_token);
            info!(server_session = session_num, "server session disconnected");
        }
        // Ack even when the session is already gone: the previous ack was
        // probably lost.
        let resp = pkt.response(SmPktType::DisconnectResp, SmStatus::Success);
        self.sm_pkt_udp_tx_st(&resp, from);
    }

    fn handle_disconnect_resp_st(&self, pkt: SmPkt) {
        let session_num = pkt.client.session_num;
        {
            let mut sessions = self.sessions.borrow_mut();
            match sessions
                .get_mut(session_num as usize)
                .and_then(|s| s.as_mut())
            {
                Some(s)
                    if s.state == SessionState::DisconnectInProgress
                        && s.uniq_token == pkt.uniq_token =>
                {
                    sessions[session_num as usize] = None;
                }
                _ => return,
            }
        }

        self.sm_pending.borrow_mut().remove(&session_num);
        self.free_ring_entries();
        info!(session = session_num, "client session disconnected");
        self.fire_sm_event(SmEvent {
            session_num,
            event: SmEventType::Disconnected,
        });
    }

    /// Tear down a client session after a remote failure: fail every
    /// in-flight continuation and the backlog, then bury the session.
    pub(crate) fn handle_reset_client_st(&self, session_num: u16) {
        let mut failed_conts: Vec<(ContFunc, RespHandle)> = Vec::new();

        {
            let mut sessions = self.sessions.borrow_mut();
            match sessions
                .get_mut(session_num as usize)
                .and_then(|s| s.as_mut())
            {
                Some(s) if s.is_client() => s.state = SessionState::ResetInProgress,
                _ => return,
            }

            for idx in 0..SESSION_CREDITS {
                let is_active = sessions[session_num as usize]
                    .as_ref()
                    .unwrap()
                    .sslots[idx]
                    .client_info()
                    .active_pos
                    != ACTIVE_POS_NONE;
                if !is_active {
                    continue;
                }
                self.delete_from_active_rpc_list(&mut sessions[..], session_num, idx);

                let s = sessions[session_num as usize].as_mut().unwrap();
                let sslot = &mut s.sslots[idx];
                let req_msgbuf = sslot.tx_msgbuf.take();
                let ci = sslot.client_info_mut();
                let resp_msgbuf = ci.resp_msgbuf.take();
                let tag = ci.tag;
                if let Some(cont) = ci.cont.take() {
                    failed_conts.push((
                        cont,
                        RespHandle {
                            session_num,
                            sslot_idx: idx,
                            req_msgbuf,
                            resp_msgbuf,
                            tag,
                            failed: true,
                        },
                    ));
                }
            }

            let s = sessions[session_num as usize].as_mut().unwrap();
            let csi = s.client_session_info_mut();
            while let Some(args) = csi.backlog.pop_front() {
                failed_conts.push((
                    args.cont,
                    RespHandle {
                        session_num,
                        sslot_idx: 0,
                        req_msgbuf: Some(args.req_msgbuf),
                        resp_msgbuf: Some(args.resp_msgbuf),
                        tag: args.tag,
                        failed: true,
                    },
                ));
            }

            sessions[session_num as usize] = None;
        }

        self.sm_pending.borrow_mut().remove(&session_num);
        self.free_ring_entries();

        warn!(
            session = session_num,
            in_flight = failed_conts.len(),
            "client session reset"
        );

        // Failed continuations run in the dispatcher regardless of their
        // background preference; there is no response to hand off.
        for (cont, resp) in failed_conts {
            cont(resp, self);
        }

        self.fire_sm_event(SmEvent {
            session_num,
            event: SmEventType::Reset,
        });
    }

    pub(crate) fn fire_sm_event(&self, event: SmEvent) {
        debug!(session = event.session_num, event = ?event.event, "SM event");
        (self.sm_handler.borrow_mut())(event);
    }
}

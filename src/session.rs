//! Session and sslot state.
//!
//! A session is a reliable logical connection between two endpoints. Each
//! session owns a fixed array of `SESSION_CREDITS` session slots (sslots),
//! one per in-flight request; `(session_num, sslot_index, cur_req_num)`
//! uniquely identifies an RPC instance.

use std::collections::VecDeque;
use std::net::SocketAddr;

use crate::bg::{ContFunc, EnqueueRequestArgs};
use crate::buffer::MsgBuffer;
use crate::config::SESSION_CREDITS;
use crate::flow_control::SessionCc;
use crate::transport::RoutingInfo;

/// Session role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Client,
    Server,
}

/// Session state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Freshly allocated, no handshake sent.
    Uninit,
    /// Connect request sent, waiting for the response.
    ConnectInProgress,
    /// Connected and ready for requests.
    Connected,
    /// Disconnect request sent, waiting for the response.
    DisconnectInProgress,
    /// Fully disconnected.
    Disconnected,
    /// Being torn down after a remote failure.
    ResetInProgress,
}

/// Marker for an sslot that is not on the active-RPC list.
pub(crate) const ACTIVE_POS_NONE: usize = usize::MAX;

/// Client-side per-sslot state.
pub(crate) struct ClientInfo {
    /// Response buffer, owned by the app; held here until the continuation.
    pub resp_msgbuf: Option<MsgBuffer>,
    /// Continuation to run when the response completes.
    pub cont: Option<ContFunc>,
    /// App-supplied tag returned to the continuation.
    pub tag: usize,
    /// Background worker for the continuation, `None` for foreground.
    pub cont_bg_id: Option<usize>,
    /// Packets emitted for this request (request packets and RFRs).
    pub num_tx: usize,
    /// In-order packets received (explicit CRs and response packets).
    pub num_rx: usize,
    /// Response packet count, learned from the first response packet.
    pub resp_num_pkts: usize,
    /// Per-packet transmit timestamps, indexed by `pkt_num % SESSION_CREDITS`.
    pub tx_ts: [u64; SESSION_CREDITS],
    /// Wheel membership, same indexing as `tx_ts`.
    pub in_wheel: [bool; SESSION_CREDITS],
    /// Number of this sslot's packets currently in the wheel.
    pub wheel_count: usize,
    /// Index in the active-RPC list, `ACTIVE_POS_NONE` when absent.
    pub active_pos: usize,
    /// True while queued in the credit stall queue.
    pub in_stallq: bool,
    /// Rollbacks performed for the current request.
    pub num_re_tx_cur: usize,
}

impl ClientInfo {
    fn new() -> Self {
        Self {
            resp_msgbuf: None,
            cont: None,
            tag: 0,
            cont_bg_id: None,
            num_tx: 0,
            num_rx: 0,
            resp_num_pkts: 0,
            tx_ts: [0; SESSION_CREDITS],
            in_wheel: [false; SESSION_CREDITS],
            wheel_count: 0,
            active_pos: ACTIVE_POS_NONE,
            in_stallq: false,
            num_re_tx_cur: 0,
        }
    }
}

/// Server-side per-sslot state.
pub(crate) struct ServerInfo {
    /// Assembled request: fake (ring-borrowed) for single-packet requests,
    /// dynamic for multi-packet ones. Taken by the request handle.
    pub req_msgbuf: Option<MsgBuffer>,
    /// Preallocated single-packet response buffer, loaned to the handler.
    pub pre_resp_msgbuf: Option<MsgBuffer>,
    /// True iff the in-flight response uses the preallocated buffer, so
    /// burying it must return it to `pre_resp_msgbuf` instead of freeing.
    pub prealloc_used: bool,
    /// Request type of the current request.
    pub req_type: u8,
    /// Request packets and RFRs received in order for the current request.
    pub num_rx: usize,
    /// Packet count of the current request.
    pub num_req_pkts: usize,
    /// True from handler dispatch until `enqueue_response`.
    pub handler_running: bool,
}

impl ServerInfo {
    fn new() -> Self {
        Self {
            req_msgbuf: None,
            pre_resp_msgbuf: None,
            prealloc_used: false,
            req_type: 0,
            num_rx: 0,
            num_req_pkts: 0,
            handler_running: false,
        }
    }
}

/// Role-specific sslot state.
pub(crate) enum SSlotInfo {
    Client(ClientInfo),
    Server(ServerInfo),
}

/// One session slot: a fixed per-session unit of in-flight RPC state.
pub(crate) struct SSlot {
    /// Slot index within the session.
    pub index: usize,
    /// Request number of the current (or last) request on this slot.
    /// Advances by `SESSION_CREDITS` per use, so `cur_req_num % SESSION_CREDITS`
    /// equals the slot index.
    pub cur_req_num: u64,
    /// Buffer being transmitted: the request (client) or response (server).
    pub tx_msgbuf: Option<MsgBuffer>,
    pub info: SSlotInfo,
}

impl SSlot {
    fn new(index: usize, role: Role) -> Self {
        Self {
            index,
            cur_req_num: index as u64,
            tx_msgbuf: None,
            info: match role {
                Role::Client => SSlotInfo::Client(ClientInfo::new()),
                Role::Server => SSlotInfo::Server(ServerInfo::new()),
            },
        }
    }

    #[inline]
    pub fn client_info(&self) -> &ClientInfo {
        match &self.info {
            SSlotInfo::Client(ci) => ci,
            SSlotInfo::Server(_) => panic!("client_info on server sslot"),
        }
    }

    #[inline]
    pub fn client_info_mut(&mut self) -> &mut ClientInfo {
        match &mut self.info {
            SSlotInfo::Client(ci) => ci,
            SSlotInfo::Server(_) => panic!("client_info on server sslot"),
        }
    }

    #[inline]
    pub fn server_info(&self) -> &ServerInfo {
        match &self.info {
            SSlotInfo::Server(si) => si,
            SSlotInfo::Client(_) => panic!("server_info on client sslot"),
        }
    }

    #[inline]
    pub fn server_info_mut(&mut self) -> &mut ServerInfo {
        match &mut self.info {
            SSlotInfo::Server(si) => si,
            SSlotInfo::Client(_) => panic!("server_info on client sslot"),
        }
    }
}

/// Client-role per-session state.
pub(crate) struct ClientSessionInfo {
    /// Available credits, 0..=SESSION_CREDITS.
    pub credits: usize,
    /// Stack of free sslot indices.
    pub sslot_free_vec: Vec<usize>,
    /// FIFO backlog of requests enqueued while no sslot was free.
    pub backlog: VecDeque<EnqueueRequestArgs>,
    /// Congestion control state.
    pub cc: SessionCc,
    /// Cumulative retransmissions on this session.
    pub num_re_tx: u64,
}

/// A reliable logical connection to one remote endpoint.
pub(crate) struct Session {
    pub role: Role,
    pub state: SessionState,
    pub local_session_num: u16,
    pub remote_session_num: u16,
    /// Session-management address of the remote endpoint.
    pub remote_sm_addr: Option<SocketAddr>,
    /// Remote URI as given to `create_session`.
    pub remote_uri: String,
    pub remote_rpc_id: u8,
    /// Datapath routing info, resolved during the handshake.
    pub remote_routing_info: Option<RoutingInfo>,
    /// Token deduplicating this session's connect request at the server.
    pub uniq_token: u64,
    /// Cycle timestamp of the last SM request transmission.
    pub sm_req_ts: u64,
    pub sslots: Vec<SSlot>,
    /// Client-role state, `None` for server sessions.
    pub client: Option<ClientSessionInfo>,
}

impl Session {
    pub fn new(role: Role, local_session_num: u16, bandwidth_bps: f64, freq_ghz: f64) -> Self {
        let sslots = (0..SESSION_CREDITS).map(|i| SSlot::new(i, role)).collect();
        let client = match role {
            Role::Client => Some(ClientSessionInfo {
                credits: SESSION_CREDITS,
                // Popped from the back; keep slot 0 on top.
                sslot_free_vec: (0..SESSION_CREDITS).rev().collect(),
                backlog: VecDeque::new(),
                cc: SessionCc::new(bandwidth_bps, freq_ghz),
                num_re_tx: 0,
            }),
            Role::Server => None,
        };
        Self {
            role,
            state: SessionState::Uninit,
            local_session_num,
            remote_session_num: 0,
            remote_sm_addr: None,
            remote_uri: String::new(),
            remote_rpc_id: 0,
            remote_routing_info: None,
            uniq_token: 0,
            sm_req_ts: 0,
            sslots,
            client,
        }
    }

    #[inline]
    pub fn is_client(&self) -> bool {
        self.role == Role::Client
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    #[inline]
    pub fn client_session_info(&self) -> &ClientSessionInfo {
        self.client.as_ref().expect("client info on server session")
    }

    #[inline]
    pub fn client_session_info_mut(&mut self) -> &mut ClientSessionInfo {
        self.client.as_mut().expect("client info on server session")
    }

    /// True iff the sender is currently at the link rate, i.e. not backed off.
    pub fn is_uncongested(&self) -> bool {
        self.client_session_info().cc.timely.is_uncongested()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sslot_req_num_encodes_index() {
        let s = Session::new(Role::Client, 3, 1e9, 2.0);
        for (i, sslot) in s.sslots.iter().enumerate() {
            assert_eq!(sslot.index, i);
            assert_eq!(sslot.cur_req_num as usize % SESSION_CREDITS, i);
        }
    }

    #[test]
    fn test_free_vec_pops_in_slot_order() {
        let mut s = Session::new(Role::Client, 0, 1e9, 2.0);
        let ci = s.client_session_info_mut();
        assert_eq!(ci.sslot_free_vec.pop(), Some(0));
        assert_eq!(ci.sslot_free_vec.pop(), Some(1));
        assert_eq!(ci.credits, SESSION_CREDITS);
    }

    #[test]
    fn test_role_tagged_info() {
        let mut c = Session::new(Role::Client, 0, 1e9, 2.0);
        let _ = c.sslots[0].client_info_mut();
        let mut s = Session::new(Role::Server, 0, 1e9, 2.0);
        let _ = s.sslots[0].server_info_mut();
    }
}

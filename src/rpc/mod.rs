//! The RPC endpoint.
//!
//! One endpoint is owned and driven by a single dispatcher thread; all
//! interior mutability below exists so handlers and continuations invoked
//! from the event loop can re-enter the endpoint through `&self` (the
//! foreground [`Datapath`] implementation). Background threads never touch
//! this struct; they reach it through the handoff queues.

mod cr_rfr;
mod event_loop;
mod kick;
mod pkt_loss;
mod queues;
mod req;
mod resp;
mod rx;
mod sm_engine;

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::UdpSocket;
use std::sync::mpsc;

use rand::rngs::SmallRng;
use rand::{Rng, RngCore, SeedableRng};
use tracing::{info, trace};

use crate::bg::{
    BgDatapath, BgPool, BgWorkItem, Datapath, EnqueueRequestArgs, ReqHandle, ReqHandlerEntry,
    ReqHandlerFn, ReqHandlerType, RespHandle,
};
use crate::buffer::{HugeAlloc, MsgBuffer, SharedAlloc, MAX_CLASS_SIZE};
use crate::config::{RpcConfig, SESSION_CREDITS};
use crate::error::{Error, Result};
use crate::packet::{PktHdr, PKT_HDR_SIZE, PKT_NUM_BITS};
use crate::session::{ClientInfo, Session, SessionState, ACTIVE_POS_NONE};
use crate::sm::SmHandler;
use crate::timing::{measure_freq_ghz, ms_to_cycles, rdtsc, to_sec, us_to_cycles};
use crate::transport::{RoutingInfo, Transport, TxBurstItem, TxTsKey};
use crate::wheel::{TimingWheel, WheelEnt};

/// Number of request types addressable by the one-byte `req_type` field.
pub const REQ_TYPE_ARRAY_SIZE: usize = 256;

const WHEEL_NUM_SLOTS: usize = 4096;

/// Datapath counters. Cheap enough to keep always on.
#[derive(Debug, Clone, Default)]
pub struct DpathStats {
    pub ev_loop_calls: u64,
    pub pkts_tx: u64,
    pub tx_burst_calls: u64,
    pub pkts_rx: u64,
    pub rx_burst_calls: u64,
    /// Explicit credit returns sent.
    pub expl_cr_tx: u64,
    /// Request-for-response packets sent.
    pub rfr_tx: u64,
}

/// Loss-recovery counters.
#[derive(Debug, Clone, Default)]
pub struct PktLossStats {
    /// Total rollbacks across all sessions.
    pub num_re_tx: u64,
    /// Retransmissions deferred, or packets dropped, because a reference was
    /// still in the pacing wheel.
    pub still_in_wheel_during_retx: u64,
}

/// Fault-injection knobs, active only with `RpcConfig::testing`.
#[derive(Debug, Default)]
struct Faults {
    fail_resolve_rinfo: bool,
    hard_wheel_bypass: bool,
    pkt_drop_prob: f64,
    /// Drop iff `urand % 1e9` is below this.
    pkt_drop_thresh_billion: u32,
}

/// An RPC endpoint over transport `T`.
pub struct Rpc<T: Transport> {
    rpc_id: u8,
    config: RpcConfig,
    freq_ghz: f64,
    creation_tsc: u64,
    rto_cycles: u64,
    pkt_loss_scan_cycles: u64,
    sm_timeout_cycles: u64,

    pub(crate) transport: RefCell<T>,
    pub(crate) huge_alloc: SharedAlloc,

    /// Session handles indexed by session number. Disconnected sessions
    /// leave holes that are reused lazily, never compacted.
    pub(crate) sessions: RefCell<Vec<Option<Session>>>,
    pub(crate) ring_entries_available: Cell<usize>,

    /// Staged outbound packets, flushed in `POSTLIST`-sized bursts.
    tx_batch: RefCell<Vec<TxBurstItem>>,
    /// Client sslots waiting for credits, drained FIFO once per loop.
    pub(crate) stallq: RefCell<VecDeque<(u16, u8)>>,
    /// Dense index of client sslots with an unfinished request.
    pub(crate) active_rpcs: RefCell<Vec<(u16, u8)>>,
    pub(crate) wheel: RefCell<TimingWheel>,
    wheel_reap: RefCell<Vec<WheelEnt>>,

    /// Round-robin ring of single-packet buffers for CR/RFR headers.
    ctrl_msgbufs: RefCell<Vec<MsgBuffer>>,
    ctrl_msgbuf_head: Cell<usize>,

    pub(crate) req_handlers: RefCell<Vec<Option<ReqHandlerEntry>>>,
    pub(crate) sm_handler: RefCell<SmHandler>,
    pub(crate) sm_socket: UdpSocket,
    pub(crate) sm_local_uri: String,
    /// Sessions with an outstanding SM request, for timeout retransmission.
    pub(crate) sm_pending: RefCell<HashSet<u16>>,
    /// Server-side connect-request dedup: token -> server session number.
    pub(crate) conn_req_tokens: RefCell<HashMap<u64, u16>>,

    pub(crate) bg_pool: Option<BgPool>,
    pub(crate) enq_req_rx: mpsc::Receiver<EnqueueRequestArgs>,
    pub(crate) enq_resp_rx: mpsc::Receiver<ReqHandle>,
    pub(crate) rel_resp_rx: mpsc::Receiver<RespHandle>,

    pub(crate) pkt_loss_scan_tsc: Cell<u64>,
    faults: RefCell<Faults>,
    pub(crate) dpath_stats: RefCell<DpathStats>,
    pub(crate) pkt_loss_stats: RefCell<PktLossStats>,
    rng: RefCell<SmallRng>,

    /// Keep retrying connect when the server's endpoint id does not exist
    /// yet (e.g. the server thread has not started).
    pub retry_connect_on_invalid_rpc_id: Cell<bool>,
}

impl<T: Transport> Rpc<T> {
    /// Maximum request or response data size, excluding packet headers.
    pub const MAX_MSG_SIZE: usize =
        MAX_CLASS_SIZE - ((MAX_CLASS_SIZE / T::MAX_DATA_PER_PKT) * PKT_HDR_SIZE);

    /// Maximum live sessions; each holds `SESSION_CREDITS` ring entries.
    pub const MAX_NUM_SESSIONS: usize = T::NUM_RX_RING_ENTRIES / SESSION_CREDITS;

    /// Construct an endpoint over `transport`.
    ///
    /// `rpc_id` must be unique within the process; `(hostname, sm_udp_port,
    /// rpc_id)` globally identifies the endpoint. `sm_handler` receives
    /// session lifecycle events.
    pub fn new(transport: T, config: RpcConfig, rpc_id: u8, sm_handler: SmHandler) -> Result<Self> {
        // Packet numbers must never alias within one RPC.
        debug_assert!((1usize << PKT_NUM_BITS) * T::MAX_DATA_PER_PKT > 2 * Self::MAX_MSG_SIZE);

        let freq_ghz = measure_freq_ghz();
        let huge_alloc: SharedAlloc =
            std::sync::Arc::new(std::sync::Mutex::new(HugeAlloc::new(config.initial_alloc_size)?));

        let sm_socket = UdpSocket::bind((config.sm_bind_ip.as_str(), config.sm_udp_port))?;
        sm_socket.set_nonblocking(true)?;
        let sm_local_uri = sm_socket.local_addr()?.to_string();

        let ctrl_msgbufs: Vec<MsgBuffer> = (0..2 * T::UNSIG_BATCH)
            .map(|_| MsgBuffer::alloc(&huge_alloc, 0, T::MAX_DATA_PER_PKT))
            .collect();
        if ctrl_msgbufs.iter().any(|m| !m.is_valid()) {
            return Err(Error::InvalidConfig(
                "arena too small for control buffers".into(),
            ));
        }

        let wheel_slot_cycles = (config.wheel_slot_width_us * freq_ghz * 1000.0).max(1.0) as u64;

        let (enq_req_tx, enq_req_rx) = mpsc::channel();
        let (enq_resp_tx, enq_resp_rx) = mpsc::channel();
        let (rel_resp_tx, rel_resp_rx) = mpsc::channel();

        let bg_pool = if config.num_bg_threads > 0 {
            Some(BgPool::new(config.num_bg_threads, || BgDatapath {
                enq_req_tx: enq_req_tx.clone(),
                enq_resp_tx: enq_resp_tx.clone(),
                rel_resp_tx: rel_resp_tx.clone(),
                arena: huge_alloc.clone(),
                max_data_per_pkt: T::MAX_DATA_PER_PKT,
            }))
        } else {
            None
        };

        let rto_cycles = us_to_cycles(config.rto_us, freq_ghz);
        let pkt_loss_scan_cycles = us_to_cycles(config.pkt_loss_scan_us, freq_ghz);
        let sm_timeout_cycles = ms_to_cycles(config.sm_timeout_ms, freq_ghz);
        let creation_tsc = rdtsc();

        info!(
            rpc_id,
            sm_uri = %sm_local_uri,
            bg_threads = config.num_bg_threads,
            "RPC endpoint created"
        );

        Ok(Self {
            rpc_id,
            config,
            freq_ghz,
            creation_tsc,
            rto_cycles,
            pkt_loss_scan_cycles,
            sm_timeout_cycles,
            transport: RefCell::new(transport),
            huge_alloc,
            sessions: RefCell::new(Vec::new()),
            ring_entries_available: Cell::new(T::NUM_RX_RING_ENTRIES),
            tx_batch: RefCell::new(Vec::with_capacity(2 * T::POSTLIST)),
            stallq: RefCell::new(VecDeque::new()),
            active_rpcs: RefCell::new(Vec::new()),
            wheel: RefCell::new(TimingWheel::new(WHEEL_NUM_SLOTS, wheel_slot_cycles)),
            wheel_reap: RefCell::new(Vec::new()),
            ctrl_msgbufs: RefCell::new(ctrl_msgbufs),
            ctrl_msgbuf_head: Cell::new(0),
            req_handlers: RefCell::new((0..REQ_TYPE_ARRAY_SIZE).map(|_| None).collect()),
            sm_handler: RefCell::new(sm_handler),
            sm_socket,
            sm_local_uri,
            sm_pending: RefCell::new(HashSet::new()),
            conn_req_tokens: RefCell::new(HashMap::new()),
            bg_pool,
            enq_req_rx,
            enq_resp_rx,
            rel_resp_rx,
            pkt_loss_scan_tsc: Cell::new(creation_tsc),
            faults: RefCell::new(Faults::default()),
            dpath_stats: RefCell::new(DpathStats::default()),
            pkt_loss_stats: RefCell::new(PktLossStats::default()),
            rng: RefCell::new(SmallRng::from_entropy()),
            retry_connect_on_invalid_rpc_id: Cell::new(false),
        })
    }

    /// Register the handler for a request type.
    pub fn register_req_handler<F>(&self, req_type: u8, kind: ReqHandlerType, func: F)
    where
        F: Fn(ReqHandle, &dyn Datapath) + Send + Sync + 'static,
    {
        assert!(
            kind == ReqHandlerType::Foreground || self.bg_pool.is_some(),
            "background handler registered without background threads"
        );
        let entry = ReqHandlerEntry {
            func: std::sync::Arc::new(func) as ReqHandlerFn,
            kind,
        };
        self.req_handlers.borrow_mut()[req_type as usize] = Some(entry);
    }

    //
    // MsgBuffer management
    //

    /// Create a hugepage-backed MsgBuffer for up to `max_data_size` bytes.
    ///
    /// Returns an invalid MsgBuffer (check `is_valid`) if the arena is out
    /// of memory; the caller may free buffers and retry.
    pub fn alloc_msg_buffer(&self, max_data_size: usize) -> MsgBuffer {
        assert!(max_data_size > 0, "zero-size MsgBuffer");
        assert!(
            max_data_size <= Self::MAX_MSG_SIZE,
            "MsgBuffer size {} exceeds max message size {}",
            max_data_size,
            Self::MAX_MSG_SIZE
        );
        MsgBuffer::alloc(&self.huge_alloc, max_data_size, T::MAX_DATA_PER_PKT)
    }

    /// Like `alloc_msg_buffer`, but panics on allocation failure.
    pub fn alloc_msg_buffer_or_die(&self, max_data_size: usize) -> MsgBuffer {
        let m = self.alloc_msg_buffer(max_data_size);
        assert!(m.is_valid(), "out of hugepage memory");
        m
    }

    /// Shrink a MsgBuffer. Does not touch packet headers.
    pub fn resize_msg_buffer(msg_buffer: &mut MsgBuffer, new_data_size: usize) {
        msg_buffer.resize(new_data_size);
    }

    /// Free a MsgBuffer created by `alloc_msg_buffer`.
    pub fn free_msg_buffer(&self, msg_buffer: MsgBuffer) {
        drop(msg_buffer);
    }

    /// Total bytes currently allocated to the user.
    pub fn get_stat_user_alloc_tot(&self) -> usize {
        self.huge_alloc.lock().unwrap().stat_user_alloc_tot()
    }

    //
    // Introspection
    //

    /// This endpoint's id.
    pub fn get_rpc_id(&self) -> u8 {
        self.rpc_id
    }

    /// URI of the session-management socket (`hostname:udp_port`).
    pub fn local_uri(&self) -> &str {
        &self.sm_local_uri
    }

    /// Number of live client or server sessions.
    pub fn num_active_sessions(&self) -> usize {
        self.sessions.borrow().iter().filter(|s| s.is_some()).count()
    }

    /// True iff the session is connected.
    pub fn is_connected(&self, session_num: u16) -> bool {
        self.sessions
            .borrow()
            .get(session_num as usize)
            .and_then(|s| s.as_ref())
            .map(|s| s.is_connected())
            .unwrap_or(false)
    }

    /// Physical link bandwidth in bytes per second.
    pub fn get_bandwidth(&self) -> usize {
        self.transport.borrow().bandwidth()
    }

    /// Retransmissions on a connected client session.
    pub fn get_num_re_tx(&self, session_num: u16) -> u64 {
        let sessions = self.sessions.borrow();
        let s = sessions[session_num as usize]
            .as_ref()
            .expect("session not found");
        s.client_session_info().num_re_tx
    }

    /// Zero the retransmission counter of a client session.
    pub fn reset_num_re_tx(&self, session_num: u16) {
        let mut sessions = self.sessions.borrow_mut();
        let s = sessions[session_num as usize]
            .as_mut()
            .expect("session not found");
        s.client_session_info_mut().num_re_tx = 0;
    }

    /// Available credits of a client session.
    pub fn available_credits(&self, session_num: u16) -> usize {
        let sessions = self.sessions.borrow();
        let s = sessions[session_num as usize]
            .as_ref()
            .expect("session not found");
        s.client_session_info().credits
    }

    /// Number of client sslots with an unfinished request.
    pub fn num_active_rpcs(&self) -> usize {
        self.active_rpcs.borrow().len()
    }

    /// Datapath counters.
    pub fn get_dpath_stats(&self) -> DpathStats {
        self.dpath_stats.borrow().clone()
    }

    /// Zero the datapath counters.
    pub fn reset_dpath_stats(&self) {
        *self.dpath_stats.borrow_mut() = DpathStats::default();
    }

    /// Loss-recovery counters.
    pub fn get_pkt_loss_stats(&self) -> PktLossStats {
        self.pkt_loss_stats.borrow().clone()
    }

    /// Average packets per `rx_burst` call, or -1 with no calls yet.
    pub fn get_avg_rx_batch(&self) -> f64 {
        let st = self.dpath_stats.borrow();
        if st.rx_burst_calls == 0 {
            return -1.0;
        }
        st.pkts_rx as f64 / st.rx_burst_calls as f64
    }

    /// Average packets per `tx_burst` call, or -1 with no calls yet.
    pub fn get_avg_tx_batch(&self) -> f64 {
        let st = self.dpath_stats.borrow();
        if st.tx_burst_calls == 0 {
            return -1.0;
        }
        st.pkts_tx as f64 / st.tx_burst_calls as f64
    }

    /// Measured TSC frequency in GHz.
    pub fn get_freq_ghz(&self) -> f64 {
        self.freq_ghz
    }

    /// Seconds since this endpoint was created.
    pub fn sec_since_creation(&self) -> f64 {
        to_sec(rdtsc().wrapping_sub(self.creation_tsc), self.freq_ghz)
    }

    /// Maximum data bytes in one packet.
    pub fn get_max_data_per_pkt() -> usize {
        T::MAX_DATA_PER_PKT
    }

    /// Maximum message data size.
    pub fn get_max_msg_size() -> usize {
        Self::MAX_MSG_SIZE
    }

    //
    // Fault injection
    //

    fn fault_inject_check_ok(&self) {
        assert!(self.config.testing, "fault injection requires testing mode");
    }

    /// Fail all routing-info resolution from now on.
    pub fn fault_inject_fail_resolve_rinfo_st(&self) {
        self.fault_inject_check_ok();
        self.faults.borrow_mut().fail_resolve_rinfo = true;
    }

    /// Drop outbound datapath packets with probability `pkt_drop_prob`.
    pub fn fault_inject_set_pkt_drop_prob_st(&self, pkt_drop_prob: f64) {
        self.fault_inject_check_ok();
        assert!((0.0..1.0).contains(&pkt_drop_prob));
        let mut faults = self.faults.borrow_mut();
        faults.pkt_drop_prob = pkt_drop_prob;
        faults.pkt_drop_thresh_billion = (pkt_drop_prob * 1_000_000_000.0) as u32;
    }

    /// Force every packet to bypass the pacing wheel.
    pub fn fault_inject_hard_wheel_bypass_st(&self) {
        self.fault_inject_check_ok();
        self.faults.borrow_mut().hard_wheel_bypass = true;
    }

    //
    // Datapath helpers shared across the rpc submodules
    //

    pub(crate) fn rand_u64(&self) -> u64 {
        self.rng.borrow_mut().next_u64()
    }

    pub(crate) fn rto_cycles(&self) -> u64 {
        self.rto_cycles
    }

    pub(crate) fn pkt_loss_scan_cycles(&self) -> u64 {
        self.pkt_loss_scan_cycles
    }

    pub(crate) fn sm_timeout_cycles(&self) -> u64 {
        self.sm_timeout_cycles
    }

    pub(crate) fn config(&self) -> &RpcConfig {
        &self.config
    }

    pub(crate) fn freq_ghz_internal(&self) -> f64 {
        self.freq_ghz
    }

    pub(crate) fn fail_resolve_rinfo(&self) -> bool {
        self.faults.borrow().fail_resolve_rinfo
    }

    /// True iff the next packet should be dropped by fault injection.
    fn roll_pkt_drop(&self) -> bool {
        let thresh = self.faults.borrow().pkt_drop_thresh_billion;
        if thresh == 0 {
            return false;
        }
        (self.rng.borrow_mut().gen::<u32>() % 1_000_000_000) < thresh
    }

    /// True iff it is currently OK to bypass the wheel for this sslot.
    pub(crate) fn can_bypass_wheel(&self, ci: &ClientInfo, uncongested: bool) -> bool {
        if !self.config.enable_pacing {
            return true;
        }
        if self.config.testing && self.faults.borrow().hard_wheel_bypass {
            return true;
        }
        if self.config.cc_opt_wheel_bypass {
            return ci.wheel_count == 0 && uncongested;
        }
        false
    }

    /// Return one credit to a client session.
    pub(crate) fn bump_credits(session: &mut Session) {
        let ci = session.client_session_info_mut();
        debug_assert!(ci.credits < SESSION_CREDITS);
        ci.credits += 1;
    }

    /// Return true iff a packet received by a client is in order. Dropped
    /// packets (rollback spurious arrivals, wheel stragglers) return false.
    pub(crate) fn in_order_client(&self, ci: &ClientInfo, cur_req_num: u64, hdr: &PktHdr) -> bool {
        if hdr.req_num() != cur_req_num {
            return false;
        }
        let pkt_num = hdr.pkt_num() as usize;
        if pkt_num != ci.num_rx {
            return false;
        }
        // Rollback: we have only sent packets up to num_tx - 1.
        if pkt_num >= ci.num_tx {
            return false;
        }
        if self.config.enable_pacing && ci.in_wheel[pkt_num % SESSION_CREDITS] {
            self.pkt_loss_stats.borrow_mut().still_in_wheel_during_retx += 1;
            return false;
        }
        true
    }

    /// Thread an sslot into the active-RPC list. The caller holds the
    /// sessions borrow.
    pub(crate) fn add_to_active_rpc_list(&self, session: &mut Session, sslot_idx: usize) {
        let mut active = self.active_rpcs.borrow_mut();
        let pos = active.len();
        active.push((session.local_session_num, sslot_idx as u8));
        session.sslots[sslot_idx].client_info_mut().active_pos = pos;
    }

    /// Unthread an sslot from the active-RPC list; O(1) via swap-remove.
    /// The caller holds the sessions borrow and must fix up the moved entry,
    /// so this takes the whole session vector.
    pub(crate) fn delete_from_active_rpc_list(
        &self,
        sessions: &mut [Option<Session>],
        session_num: u16,
        sslot_idx: usize,
    ) {
        let mut active = self.active_rpcs.borrow_mut();
        let pos = {
            let s = sessions[session_num as usize].as_mut().unwrap();
            let ci = s.sslots[sslot_idx].client_info_mut();
            let pos = ci.active_pos;
            debug_assert_ne!(pos, ACTIVE_POS_NONE);
            ci.active_pos = ACTIVE_POS_NONE;
            pos
        };
        active.swap_remove(pos);
        if pos < active.len() {
            let (moved_sn, moved_idx) = active[pos];
            let s = sessions[moved_sn as usize].as_mut().unwrap();
            s.sslots[moved_idx as usize].client_info_mut().active_pos = pos;
        }
    }

    //
    // TX batching
    //

    /// Stage a data packet of `msgbuf` for transmission.
    pub(crate) fn push_data_pkt(
        &self,
        routing_info: RoutingInfo,
        msgbuf: &MsgBuffer,
        pkt_idx: usize,
        tx_ts_key: Option<TxTsKey>,
    ) {
        let hdr = unsafe { PktHdr::read_from(msgbuf.pkthdr_ptr(pkt_idx)) };
        trace!(rpc = self.rpc_id, "TX {}", hdr.to_string_short());
        self.tx_batch.borrow_mut().push(TxBurstItem {
            routing_info,
            hdr_ptr: msgbuf.pkthdr_ptr(pkt_idx),
            data_ptr: msgbuf.pkt_data_ptr(pkt_idx),
            data_len: msgbuf.pkt_size(pkt_idx),
            drop: self.roll_pkt_drop(),
            tx_ts_key,
        });
    }

    /// Stage a header-only control packet (CR or RFR) using the next
    /// control buffer. Control buffers can be reused after `2 * UNSIG_BATCH`
    /// calls, which bounds the staged batch.
    pub(crate) fn push_ctrl_pkt(
        &self,
        routing_info: RoutingInfo,
        hdr: &PktHdr,
        tx_ts_key: Option<TxTsKey>,
    ) {
        let mut bufs = self.ctrl_msgbufs.borrow_mut();
        let head = self.ctrl_msgbuf_head.get();
        self.ctrl_msgbuf_head.set((head + 1) % bufs.len());
        let buf = &mut bufs[head];
        buf.write_pkthdr(0, hdr);

        trace!(rpc = self.rpc_id, "TX {}", hdr.to_string_short());
        self.tx_batch.borrow_mut().push(TxBurstItem {
            routing_info,
            hdr_ptr: buf.pkthdr_ptr(0),
            data_ptr: buf.pkt_data_ptr(0),
            data_len: 0,
            drop: self.roll_pkt_drop(),
            tx_ts_key,
        });
    }

    /// Flush if a full burst has accumulated. Must be called with no
    /// outstanding sessions borrow.
    pub(crate) fn flush_tx_if_full(&self) {
        if self.tx_batch.borrow().len() >= T::POSTLIST {
            self.do_tx_burst_st();
        }
    }

    /// Transmit everything staged in the TX batch, then stamp transmit
    /// timestamps for RTT measurement.
    pub(crate) fn do_tx_burst_st(&self) {
        let batch = std::mem::take(&mut *self.tx_batch.borrow_mut());
        if batch.is_empty() {
            return;
        }

        {
            let mut stats = self.dpath_stats.borrow_mut();
            let mut transport = self.transport.borrow_mut();
            for chunk in batch.chunks(T::POSTLIST) {
                transport.tx_burst(chunk);
                stats.tx_burst_calls += 1;
                stats.pkts_tx += chunk.len() as u64;
            }
        }

        // Stamp per-packet TX timestamps, optionally sampling the clock once
        // per batch.
        let batch_tsc = rdtsc();
        let mut sessions = self.sessions.borrow_mut();
        for item in &batch {
            if let Some(key) = item.tx_ts_key {
                let ts = if self.config.cc_opt_batch_tsc {
                    batch_tsc
                } else {
                    rdtsc()
                };
                if let Some(Some(s)) = sessions.get_mut(key.session_num as usize) {
                    if s.is_client() {
                        s.sslots[key.sslot_idx as usize].client_info_mut().tx_ts
                            [key.ts_idx as usize] = ts;
                    }
                }
            }
        }
    }

    /// Submit a complete request or response to a background worker.
    pub(crate) fn submit_background_st(&self, item: BgWorkItem, bg_id: Option<usize>) {
        let pool = self
            .bg_pool
            .as_ref()
            .expect("background work without background threads");
        pool.submit(item, bg_id);
    }

    pub(crate) fn num_bg_threads(&self) -> usize {
        self.bg_pool.as_ref().map(|p| p.num_threads()).unwrap_or(0)
    }
}

/// Foreground datapath: handlers and continuations running on the
/// dispatcher call straight back into the endpoint.
impl<T: Transport> Datapath for Rpc<T> {
    fn enqueue_response(&self, req_handle: ReqHandle) {
        self.enqueue_response_st(req_handle);
    }

    fn release_response(&self, resp_handle: RespHandle) {
        self.release_response_st(resp_handle);
    }

    fn enqueue_request(&self, args: EnqueueRequestArgs) {
        if let Err(e) = self.enqueue_request_args(args) {
            tracing::error!(error = %e, "foreground enqueue_request failed");
        }
    }

    fn alloc_msg_buffer(&self, max_data_size: usize) -> MsgBuffer {
        Rpc::alloc_msg_buffer(self, max_data_size)
    }
}

impl<T: Transport> Drop for Rpc<T> {
    fn drop(&mut self) {
        // Workers exit when their channels close; BgPool joins them.
        self.bg_pool.take();
        info!(rpc_id = self.rpc_id, "RPC endpoint destroyed");
    }
}

/// Helper shared by req/resp paths: build the standard per-packet header for
/// a data packet of a message.
pub(crate) fn write_data_pkt_hdrs(
    msgbuf: &mut MsgBuffer,
    req_type: u8,
    dest_session_num: u16,
    pkt_type: crate::packet::PktType,
    first_pkt_num: usize,
    req_num: u64,
) {
    let msg_size = msgbuf.data_size();
    for i in 0..msgbuf.num_pkts() {
        let hdr = PktHdr::new(
            req_type,
            msg_size,
            dest_session_num,
            pkt_type,
            (first_pkt_num + i) as u16,
            req_num,
        );
        msgbuf.write_pkthdr(i, &hdr);
    }
}

/// Classify whether a session state admits a new outgoing SM request.
pub(crate) fn sm_state_is_pending(state: SessionState) -> bool {
    matches!(
        state,
        SessionState::ConnectInProgress | SessionState::DisconnectInProgress
    )
}

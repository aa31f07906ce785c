//! Transport contract consumed by the datapath.
//!
//! The endpoint is monomorphised over a [`Transport`]; the hot path touches
//! only the handful of operations below, so a driver for InfiniBand verbs,
//! raw Ethernet or a DPDK-style NIC plugs in without touching the protocol
//! engine. [`crate::udp_transport::UdpTransport`] is the in-tree polling
//! implementation used on commodity sockets and in tests.

use std::net::SocketAddr;

use crate::error::Result;

/// Per-packet routing information for one remote endpoint.
pub type RoutingInfo = SocketAddr;

/// Identifies the transmit-timestamp slot the burst engine must fill after
/// a packet physically leaves, for RTT measurement.
#[derive(Debug, Clone, Copy)]
pub struct TxTsKey {
    pub session_num: u16,
    pub sslot_idx: u8,
    /// Index into the sslot's `tx_ts` array (`pkt_num % SESSION_CREDITS`).
    pub ts_idx: u8,
}

/// One entry of a TX burst.
///
/// Header and data pointers reference a `MsgBuffer` owned by an sslot; the
/// buffer stays alive until the burst is flushed (responses are buried only
/// after the next request on their slot, requests only at completion).
pub struct TxBurstItem {
    pub routing_info: RoutingInfo,
    pub hdr_ptr: *const u8,
    pub data_ptr: *const u8,
    pub data_len: usize,
    /// Fault injection: roll the packet but do not put it on the wire.
    pub drop: bool,
    pub tx_ts_key: Option<TxTsKey>,
}

/// An unreliable packet transport.
///
/// `rx_burst` fills consecutive receive-ring entries; the entries of one
/// burst must stay untouched until the same number of descriptors is
/// reposted with `post_recvs`.
pub trait Transport {
    /// Maximum data bytes in one packet, excluding the packet header.
    const MAX_DATA_PER_PKT: usize;
    /// Receive-ring capacity; sessions reserve ring entries in credit-sized
    /// blocks from this budget.
    const NUM_RX_RING_ENTRIES: usize;
    /// Maximum packets per TX burst.
    const POSTLIST: usize;
    /// Granularity of TX completion bookkeeping; bounds control-buffer reuse.
    const UNSIG_BATCH: usize;

    /// Transmit up to `POSTLIST` packets. Items flagged `drop` are counted
    /// but never sent.
    fn tx_burst(&mut self, batch: &[TxBurstItem]);

    /// Complete transmission of everything previously bursted.
    fn tx_flush(&mut self);

    /// Poll for received packets; returns the number of new ring entries.
    fn rx_burst(&mut self) -> usize;

    /// Entry `i` (0-based) of the most recent `rx_burst`.
    fn rx_ring_entry(&self, i: usize) -> (*const u8, usize);

    /// Repost `n` receive descriptors, recycling the oldest ring entries.
    fn post_recvs(&mut self, n: usize);

    /// Resolve a remote datapath URI into routing info.
    fn resolve_remote_routing_info(&self, uri: &str) -> Result<RoutingInfo>;

    /// This transport's own datapath URI, advertised during the handshake.
    fn local_routing_info(&self) -> String;

    /// Physical link bandwidth in bytes per second.
    fn bandwidth(&self) -> usize;
}

//! Polling datagram transport over a nonblocking UDP socket.
//!
//! One datagram carries one packet: a 16-byte header followed by up to
//! `MAX_DATA_PER_PKT` data bytes. The receive ring is a fixed array of
//! MTU-sized buffers filled in circular order, mirroring how a NIC driver
//! reuses its RX descriptors; entries handed out by `rx_burst` stay valid
//! until `post_recvs` recycles them.

use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};

use tracing::{trace, warn};

use crate::error::{Error, Result};
use crate::packet::PKT_HDR_SIZE;
use crate::transport::{RoutingInfo, Transport, TxBurstItem};

/// Wire MTU for one datagram (fits a standard Ethernet payload).
pub const UDP_MTU: usize = 1472;

/// UDP datapath transport.
pub struct UdpTransport {
    socket: UdpSocket,
    local_addr: SocketAddr,
    /// Receive ring buffers, `UDP_MTU` bytes each.
    rx_ring: Vec<Box<[u8]>>,
    /// Datagram length per ring entry.
    rx_lens: Vec<usize>,
    /// Next ring entry to fill.
    rx_head: usize,
    /// First entry of the most recent burst.
    rx_burst_start: usize,
    /// Receive descriptors currently posted.
    recvs_posted: usize,
    /// TX scratch for assembling header + data of one datagram.
    tx_scratch: Box<[u8]>,
    bandwidth: usize,
}

impl UdpTransport {
    /// Bind the datapath socket. Use port 0 for an ephemeral port.
    pub fn new(bind_addr: &str) -> Result<Self> {
        let socket = UdpSocket::bind(bind_addr)?;
        socket.set_nonblocking(true)?;
        let local_addr = socket.local_addr()?;

        let n = Self::NUM_RX_RING_ENTRIES;
        Ok(Self {
            socket,
            local_addr,
            rx_ring: (0..n).map(|_| vec![0u8; UDP_MTU].into_boxed_slice()).collect(),
            rx_lens: vec![0; n],
            rx_head: 0,
            rx_burst_start: 0,
            recvs_posted: n,
            tx_scratch: vec![0u8; UDP_MTU].into_boxed_slice(),
            bandwidth: 1_250_000_000, // 10 Gbps
        })
    }

    /// Local datapath address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Transport for UdpTransport {
    const MAX_DATA_PER_PKT: usize = UDP_MTU - PKT_HDR_SIZE;
    const NUM_RX_RING_ENTRIES: usize = 4096;
    const POSTLIST: usize = 32;
    const UNSIG_BATCH: usize = 32;

    fn tx_burst(&mut self, batch: &[TxBurstItem]) {
        debug_assert!(batch.len() <= Self::POSTLIST);
        for item in batch {
            if item.drop {
                trace!("tx_burst: dropping packet by fault injection");
                continue;
            }
            let len = PKT_HDR_SIZE + item.data_len;
            debug_assert!(len <= UDP_MTU);
            unsafe {
                std::ptr::copy_nonoverlapping(item.hdr_ptr, self.tx_scratch.as_mut_ptr(), PKT_HDR_SIZE);
                if item.data_len > 0 {
                    std::ptr::copy_nonoverlapping(
                        item.data_ptr,
                        self.tx_scratch.as_mut_ptr().add(PKT_HDR_SIZE),
                        item.data_len,
                    );
                }
            }
            // An unreliable transport: send errors are packet loss.
            match self.socket.send_to(&self.tx_scratch[..len], item.routing_info) {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    trace!("tx_burst: socket backpressure, packet dropped");
                }
                Err(e) => warn!(error = %e, "tx_burst: send failed, packet dropped"),
            }
        }
    }

    fn tx_flush(&mut self) {
        // Datagrams leave the socket in send_to; nothing is queued.
    }

    fn rx_burst(&mut self) -> usize {
        self.rx_burst_start = self.rx_head;
        let mut n = 0;
        while n < Self::POSTLIST && self.recvs_posted > 0 {
            let slot = self.rx_head;
            match self.socket.recv_from(&mut self.rx_ring[slot]) {
                Ok((len, _from)) => {
                    if len < PKT_HDR_SIZE {
                        trace!(len, "rx_burst: runt datagram dropped");
                        continue;
                    }
                    self.rx_lens[slot] = len;
                    self.rx_head = (self.rx_head + 1) % Self::NUM_RX_RING_ENTRIES;
                    self.recvs_posted -= 1;
                    n += 1;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!(error = %e, "rx_burst: recv failed");
                    break;
                }
            }
        }
        n
    }

    fn rx_ring_entry(&self, i: usize) -> (*const u8, usize) {
        let slot = (self.rx_burst_start + i) % Self::NUM_RX_RING_ENTRIES;
        (self.rx_ring[slot].as_ptr(), self.rx_lens[slot])
    }

    fn post_recvs(&mut self, n: usize) {
        self.recvs_posted = (self.recvs_posted + n).min(Self::NUM_RX_RING_ENTRIES);
    }

    fn resolve_remote_routing_info(&self, uri: &str) -> Result<RoutingInfo> {
        uri.to_socket_addrs()
            .map_err(|_| Error::InvalidRemoteUri(uri.to_string()))?
            .next()
            .ok_or_else(|| Error::InvalidRemoteUri(uri.to_string()))
    }

    fn local_routing_info(&self) -> String {
        self.local_addr.to_string()
    }

    fn bandwidth(&self) -> usize {
        self.bandwidth
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{PktHdr, PktType};

    fn item(to: SocketAddr, hdr: &PktHdr, data: &[u8]) -> TxBurstItem {
        TxBurstItem {
            routing_info: to,
            hdr_ptr: hdr as *const PktHdr as *const u8,
            data_ptr: data.as_ptr(),
            data_len: data.len(),
            drop: false,
            tx_ts_key: None,
        }
    }

    #[test]
    fn test_loopback_burst() {
        let mut a = UdpTransport::new("127.0.0.1:0").unwrap();
        let mut b = UdpTransport::new("127.0.0.1:0").unwrap();

        let hdr = PktHdr::new(7, 5, 3, PktType::Req, 0, 16);
        let data = *b"hello";
        a.tx_burst(&[item(b.local_addr(), &hdr, &data)]);

        let mut got = 0;
        for _ in 0..1000 {
            got = b.rx_burst();
            if got > 0 {
                break;
            }
            std::thread::sleep(std::time::Duration::from_micros(100));
        }
        assert_eq!(got, 1);

        let (ptr, len) = b.rx_ring_entry(0);
        assert_eq!(len, PKT_HDR_SIZE + 5);
        let rx_hdr = unsafe { PktHdr::read_from(ptr) };
        assert!(rx_hdr.is_valid());
        assert_eq!(rx_hdr.req_type(), 7);
        assert_eq!(rx_hdr.msg_size(), 5);
        let payload = unsafe { std::slice::from_raw_parts(ptr.add(PKT_HDR_SIZE), 5) };
        assert_eq!(payload, b"hello");

        b.post_recvs(got);
    }

    #[test]
    fn test_dropped_item_never_sent() {
        let a_addr;
        let mut a = UdpTransport::new("127.0.0.1:0").unwrap();
        a_addr = a.local_addr();
        let mut b = UdpTransport::new("127.0.0.1:0").unwrap();

        let hdr = PktHdr::new(0, 0, 0, PktType::Req, 0, 0);
        let mut it = item(a_addr, &hdr, &[]);
        it.drop = true;
        b.tx_burst(&[it]);

        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(a.rx_burst(), 0);
    }

    #[test]
    fn test_resolve_routing_info() {
        let t = UdpTransport::new("127.0.0.1:0").unwrap();
        assert!(t.resolve_remote_routing_info("127.0.0.1:9999").is_ok());
        assert!(t.resolve_remote_routing_info("not a uri").is_err());
    }
}

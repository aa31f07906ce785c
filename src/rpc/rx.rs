//! Receive-burst classification.

use tracing::trace;

use crate::packet::{PktHdr, PktType, PKT_HDR_SIZE};
use crate::timing::rdtsc;
use crate::transport::Transport;

use super::Rpc;

impl<T: Transport> Rpc<T> {
    /// Poll the transport and classify every received packet. Ring entries
    /// are reposted only after the whole burst is processed, so zero-copy
    /// request buffers handed to foreground handlers stay valid.
    pub(crate) fn process_comps_st(&self) -> usize {
        let n = self.transport.borrow_mut().rx_burst();
        if n == 0 {
            return 0;
        }
        {
            let mut stats = self.dpath_stats.borrow_mut();
            stats.rx_burst_calls += 1;
            stats.pkts_rx += n as u64;
        }
        let rx_tsc = rdtsc();

        for i in 0..n {
            let (ptr, len) = self.transport.borrow().rx_ring_entry(i);
            if len < PKT_HDR_SIZE {
                continue;
            }
            let hdr = unsafe { PktHdr::read_from(ptr) };
            if !hdr.is_valid() {
                // Corrupt or foreign packet; the magic check catches it.
                trace!(rpc = self.get_rpc_id(), "dropping packet with bad magic");
                continue;
            }
            trace!(rpc = self.get_rpc_id(), "RX {}", hdr.to_string_short());

            if hdr.msg_size() > Self::MAX_MSG_SIZE {
                // The allocator cannot back such a message; never sent by a
                // conforming peer.
                continue;
            }

            let session_num = hdr.dest_session_num();
            match hdr.pkt_type() {
                PktType::Req => {
                    if hdr.msg_size() <= T::MAX_DATA_PER_PKT {
                        self.process_small_req_st(session_num, &hdr, ptr);
                    } else {
                        self.process_large_req_one_st(session_num, &hdr, ptr);
                    }
                }
                PktType::Resp => self.process_resp_one_st(session_num, &hdr, ptr, rx_tsc),
                PktType::ExplicitCr => self.process_expl_cr_st(session_num, &hdr, rx_tsc),
                PktType::Rfr => self.process_rfr_st(session_num, &hdr),
            }
            self.flush_tx_if_full();
        }

        self.transport.borrow_mut().post_recvs(n);
        n
    }
}

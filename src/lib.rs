//! # pacerpc - credit-paced RPC for unreliable datacenter transports
//!
//! This crate implements the datapath and session layer of a user-space RPC
//! endpoint over unreliable packet transports (InfiniBand UD, raw Ethernet,
//! DPDK-style polling NICs; a UDP reference transport is included). One
//! dispatcher thread multiplexes many concurrent requests over per-session
//! slots with credit-based flow control, an RTT-driven pacing wheel,
//! explicit-credit-return and request-for-response control packets,
//! rollback-based loss recovery, and zero-copy hugepage message buffers.
//!
//! ## Features
//!
//! - **Session slots**: fixed per-session concurrency; requests beyond the
//!   window queue FIFO on a backlog
//! - **Credit-based flow control**: at most `SESSION_CREDITS` packets
//!   outstanding per session
//! - **Timely congestion control**: per-session rate from RTT samples,
//!   enforced by a timing wheel
//! - **Loss recovery**: per-request retransmission timeout with rollback
//! - **Background handlers**: request handlers and continuations optionally
//!   run on worker threads, off the dispatcher
//!
//! ## Usage
//!
//! ```ignore
//! use pacerpc::{Rpc, RpcConfig, ReqHandlerType, UdpTransport};
//!
//! let transport = UdpTransport::new("127.0.0.1:0")?;
//! let rpc = Rpc::new(transport, RpcConfig::default(), 0, Box::new(|ev| {
//!     println!("SM event: {:?}", ev);
//! }))?;
//!
//! // Echo server.
//! rpc.register_req_handler(1, ReqHandlerType::Foreground, |mut req, dp| {
//!     let data = req.req_data().to_vec();
//!     let resp = req.pre_resp_msgbuf();
//!     resp.resize(data.len());
//!     resp.data_mut().copy_from_slice(&data);
//!     dp.enqueue_response(req);
//! });
//!
//! // Client side.
//! let session = rpc.create_session("127.0.0.1:31850", 1)?;
//! // ... wait for the Connected event, then:
//! let req = rpc.alloc_msg_buffer_or_die(16);
//! let resp = rpc.alloc_msg_buffer_or_die(16);
//! rpc.enqueue_request(session, 1, req, resp, |resp, dp| {
//!     println!("{} byte response", resp.resp_msgbuf.as_ref().unwrap().data_size());
//!     dp.release_response(resp);
//! }, 0, None)?;
//!
//! rpc.run_event_loop(100);
//! ```
//!
//! ## Architecture
//!
//! - [`config`]: endpoint configuration ([`RpcConfig`], [`SESSION_CREDITS`])
//! - [`packet`]: bit-packed wire header ([`PktHdr`], [`PktType`])
//! - [`buffer`]: hugepage arena and zero-copy buffers ([`MsgBuffer`])
//! - [`session`]: session state machine and sslots
//! - [`sm`]: session-management wire format and events
//! - [`flow_control`]: Timely congestion control
//! - [`wheel`]: pacing wheel over TSC timestamps
//! - [`transport`]: the transport contract ([`Transport`])
//! - [`udp_transport`]: polling UDP reference transport
//! - [`bg`]: background workers and the [`Datapath`] seam
//! - [`rpc`]: the endpoint ([`Rpc`]) and its event loop

pub mod bg;
pub mod buffer;
pub mod config;
pub mod error;
pub mod flow_control;
pub mod packet;
pub mod rpc;
pub mod session;
pub mod sm;
pub mod timing;
pub mod transport;
pub mod udp_transport;

mod wheel;

pub use bg::{Datapath, EnqueueRequestArgs, ReqHandle, ReqHandlerType, RespHandle};
pub use buffer::MsgBuffer;
pub use config::{RpcConfig, SESSION_CREDITS};
pub use error::{Error, Result};
pub use packet::{PktHdr, PktType, PKT_HDR_SIZE};
pub use rpc::{DpathStats, PktLossStats, Rpc};
pub use session::SessionState;
pub use sm::{SmEvent, SmEventType, SmHandler, SmStatus};
pub use transport::{RoutingInfo, Transport, TxBurstItem};
pub use udp_transport::UdpTransport;

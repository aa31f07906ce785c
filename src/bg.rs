//! Background workers and cross-thread handoff.
//!
//! Request handlers and continuations may run on background OS threads so
//! the dispatcher never blocks on user code. Background code touches the
//! endpoint only through three multi-producer/single-consumer queues drained
//! once per event-loop iteration; sslots are mutated exclusively by the
//! dispatcher. The [`Datapath`] trait is the seam: in the foreground it is
//! the endpoint itself, in the background it is a handle that pushes onto
//! the queues.

use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::{info, trace};

use crate::buffer::MsgBuffer;

/// Handle to one received request, owned by the request handler until it is
/// passed back through [`Datapath::enqueue_response`].
pub struct ReqHandle {
    pub(crate) session_num: u16,
    pub(crate) sslot_idx: usize,
    pub(crate) req_num: u64,
    pub(crate) req_type: u8,
    pub(crate) req_msgbuf: MsgBuffer,
    pub(crate) pre_resp_msgbuf: Option<MsgBuffer>,
    pub(crate) dyn_resp_msgbuf: Option<MsgBuffer>,
}

impl ReqHandle {
    /// Request type of this request.
    #[inline]
    pub fn req_type(&self) -> u8 {
        self.req_type
    }

    /// Request payload.
    ///
    /// For foreground handlers of single-packet requests this borrows the
    /// receive ring directly (zero-copy) and is valid until the handler
    /// returns; multi-packet and background requests are backed by a
    /// dynamic buffer.
    #[inline]
    pub fn req_data(&self) -> &[u8] {
        self.req_msgbuf.data()
    }

    /// The preallocated single-packet response buffer for this sslot.
    ///
    /// Resize it to the response size and fill it for small responses; for
    /// larger ones install a dynamic buffer with `set_dyn_resp_msgbuf`.
    #[inline]
    pub fn pre_resp_msgbuf(&mut self) -> &mut MsgBuffer {
        self.pre_resp_msgbuf
            .as_mut()
            .expect("preallocated response buffer missing")
    }

    /// Install a dynamic response buffer, overriding the preallocated one.
    #[inline]
    pub fn set_dyn_resp_msgbuf(&mut self, msgbuf: MsgBuffer) {
        self.dyn_resp_msgbuf = Some(msgbuf);
    }
}

/// Handle to one completed response, passed to the continuation. The request
/// and response buffers round-trip back to the application here; take them
/// out before (or ignore them and let) [`Datapath::release_response`] free
/// the slot.
pub struct RespHandle {
    pub(crate) session_num: u16,
    pub(crate) sslot_idx: usize,
    /// The request buffer, returned to the app.
    pub req_msgbuf: Option<MsgBuffer>,
    /// The response buffer, resized to the received response.
    pub resp_msgbuf: Option<MsgBuffer>,
    /// The tag given to `enqueue_request`.
    pub tag: usize,
    pub(crate) failed: bool,
}

impl RespHandle {
    /// True iff the session was reset before a response arrived; the
    /// response buffer contents are undefined in that case.
    #[inline]
    pub fn is_failed(&self) -> bool {
        self.failed
    }
}

/// Continuation invoked when a request completes (or fails on reset).
pub type ContFunc = Box<dyn FnOnce(RespHandle, &dyn Datapath) + Send>;

/// Request handler. Runs inline on the dispatcher or on a background worker
/// depending on how the request type was registered.
pub type ReqHandlerFn = Arc<dyn Fn(ReqHandle, &dyn Datapath) + Send + Sync>;

/// Where a request type's handler runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReqHandlerType {
    /// Inline on the dispatcher; must not block.
    Foreground,
    /// On a background worker; the request payload is copied out of the ring.
    Background,
}

pub(crate) struct ReqHandlerEntry {
    pub func: ReqHandlerFn,
    pub kind: ReqHandlerType,
}

/// Arguments of one `enqueue_request` call, as stored in session backlogs
/// and the background handoff queue.
pub struct EnqueueRequestArgs {
    pub session_num: u16,
    pub req_type: u8,
    pub req_msgbuf: MsgBuffer,
    pub resp_msgbuf: MsgBuffer,
    pub cont: ContFunc,
    pub tag: usize,
    pub cont_bg_id: Option<usize>,
}

/// Datapath operations available to handlers and continuations, foreground
/// or background.
pub trait Datapath {
    /// Send the response for a request handle.
    fn enqueue_response(&self, req_handle: ReqHandle);
    /// Release a response handle, freeing its sslot and draining one
    /// backlogged request.
    fn release_response(&self, resp_handle: RespHandle);
    /// Issue a (possibly nested) request.
    fn enqueue_request(&self, args: EnqueueRequestArgs);
    /// Allocate a MsgBuffer, e.g. for a dynamic response. Background
    /// callers share the dispatcher's arena through its mutex.
    fn alloc_msg_buffer(&self, max_data_size: usize) -> MsgBuffer;
}

/// Background-side [`Datapath`]: pushes onto the dispatcher's queues.
pub(crate) struct BgDatapath {
    pub enq_req_tx: mpsc::Sender<EnqueueRequestArgs>,
    pub enq_resp_tx: mpsc::Sender<ReqHandle>,
    pub rel_resp_tx: mpsc::Sender<RespHandle>,
    pub arena: crate::buffer::SharedAlloc,
    pub max_data_per_pkt: usize,
}

impl Datapath for BgDatapath {
    fn enqueue_response(&self, req_handle: ReqHandle) {
        // A send error means the endpoint is gone; the work is moot.
        let _ = self.enq_resp_tx.send(req_handle);
    }

    fn release_response(&self, resp_handle: RespHandle) {
        let _ = self.rel_resp_tx.send(resp_handle);
    }

    fn enqueue_request(&self, args: EnqueueRequestArgs) {
        let _ = self.enq_req_tx.send(args);
    }

    fn alloc_msg_buffer(&self, max_data_size: usize) -> MsgBuffer {
        assert!(max_data_size > 0, "zero-size MsgBuffer");
        MsgBuffer::alloc(&self.arena, max_data_size, self.max_data_per_pkt)
    }
}

/// One unit of background work.
pub(crate) enum BgWorkItem {
    Request {
        func: ReqHandlerFn,
        handle: ReqHandle,
    },
    Continuation {
        cont: ContFunc,
        resp: RespHandle,
    },
}

fn bg_thread_func(index: usize, rx: mpsc::Receiver<BgWorkItem>, dp: BgDatapath) {
    info!(bg_thread = index, "background thread running");
    for item in rx.iter() {
        match item {
            BgWorkItem::Request { func, handle } => {
                trace!(
                    bg_thread = index,
                    req_num = handle.req_num,
                    "running request handler"
                );
                func(handle, &dp);
            }
            BgWorkItem::Continuation { cont, resp } => {
                trace!(
                    bg_thread = index,
                    session = resp.session_num,
                    "running continuation"
                );
                cont(resp, &dp);
            }
        }
    }
    info!(bg_thread = index, "background thread exiting");
}

/// The set of background workers. Work is pinned to a worker when the caller
/// asked for one, round-robined otherwise.
pub(crate) struct BgPool {
    workers: Vec<mpsc::Sender<BgWorkItem>>,
    joins: Vec<JoinHandle<()>>,
    next_rr: std::cell::Cell<usize>,
}

impl BgPool {
    pub fn new(num_threads: usize, mk_dp: impl Fn() -> BgDatapath) -> Self {
        let mut workers = Vec::with_capacity(num_threads);
        let mut joins = Vec::with_capacity(num_threads);
        for i in 0..num_threads {
            let (tx, rx) = mpsc::channel();
            let dp = mk_dp();
            joins.push(
                std::thread::Builder::new()
                    .name(format!("pacerpc-bg-{}", i))
                    .spawn(move || bg_thread_func(i, rx, dp))
                    .expect("failed to spawn background thread"),
            );
            workers.push(tx);
        }
        Self {
            workers,
            joins,
            next_rr: std::cell::Cell::new(0),
        }
    }

    pub fn num_threads(&self) -> usize {
        self.workers.len()
    }

    /// Submit a work item, to `bg_id` if given, else round-robin.
    pub fn submit(&self, item: BgWorkItem, bg_id: Option<usize>) {
        let id = match bg_id {
            Some(id) => {
                assert!(id < self.workers.len(), "background worker {} out of range", id);
                id
            }
            None => {
                let id = self.next_rr.get();
                self.next_rr.set((id + 1) % self.workers.len());
                id
            }
        };
        // A send error means the worker died; nothing to do on this side.
        let _ = self.workers[id].send(item);
    }
}

impl Drop for BgPool {
    fn drop(&mut self) {
        self.workers.clear();
        for j in self.joins.drain(..) {
            let _ = j.join();
        }
    }
}

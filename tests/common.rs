//! Common utilities for loopback integration tests.

#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use pacerpc::{Datapath, ReqHandlerType, Rpc, RpcConfig, SmEvent, UdpTransport};

/// One endpoint plus its recorded SM events.
pub struct TestEndpoint {
    pub rpc: Rpc<UdpTransport>,
    pub events: Rc<RefCell<Vec<SmEvent>>>,
}

pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

/// Test-friendly timing: short SM timeout, 2 ms RTO, fault injection on.
pub fn test_config() -> RpcConfig {
    RpcConfig::default()
        .with_sm_timeout_ms(10)
        .with_rto_us(2000)
        .with_pkt_loss_scan_us(200)
        .with_testing(true)
}

pub fn new_endpoint(rpc_id: u8, config: RpcConfig) -> TestEndpoint {
    init_tracing();
    let transport = UdpTransport::new("127.0.0.1:0").expect("bind datapath socket");
    let events = Rc::new(RefCell::new(Vec::new()));
    let sink = events.clone();
    let rpc = Rpc::new(
        transport,
        config,
        rpc_id,
        Box::new(move |ev| sink.borrow_mut().push(ev)),
    )
    .expect("create endpoint");
    TestEndpoint { rpc, events }
}

/// Drive all endpoints until `pred` holds or `timeout` elapses.
pub fn poll_until(
    eps: &[&TestEndpoint],
    timeout: Duration,
    mut pred: impl FnMut() -> bool,
) -> bool {
    let start = Instant::now();
    loop {
        for ep in eps {
            ep.rpc.run_event_loop_once();
        }
        if pred() {
            return true;
        }
        if start.elapsed() >= timeout {
            return false;
        }
        std::thread::sleep(Duration::from_micros(50));
    }
}

/// Connect `client` to `server` and return the client session number.
pub fn connect(client: &TestEndpoint, server: &TestEndpoint) -> u16 {
    let sn = client
        .rpc
        .create_session(server.rpc.local_uri(), server.rpc.get_rpc_id())
        .expect("create_session");
    assert!(
        poll_until(&[client, server], Duration::from_secs(5), || client
            .rpc
            .is_connected(sn)),
        "connect handshake timed out"
    );
    sn
}

/// Register a byte-for-byte echo handler for `req_type`.
pub fn register_echo(ep: &TestEndpoint, req_type: u8, kind: ReqHandlerType) {
    ep.rpc.register_req_handler(req_type, kind, |mut req, dp| {
        let data = req.req_data().to_vec();
        if data.len() <= req.pre_resp_msgbuf().max_data_size() {
            let resp = req.pre_resp_msgbuf();
            resp.resize(data.len());
            if !data.is_empty() {
                resp.data_mut().copy_from_slice(&data);
            }
        } else {
            let mut resp = dp.alloc_msg_buffer(data.len());
            assert!(resp.is_valid(), "echo handler out of memory");
            resp.data_mut().copy_from_slice(&data);
            req.set_dyn_resp_msgbuf(resp);
        }
        dp.enqueue_response(req);
    });
}

/// Issue one echo request and wait for its response bytes.
pub fn echo_once(
    client: &TestEndpoint,
    server: &TestEndpoint,
    session_num: u16,
    req_type: u8,
    payload: &[u8],
) -> Vec<u8> {
    let size = payload.len();
    let mut req = client.rpc.alloc_msg_buffer_or_die(size.max(1));
    req.resize(size);
    if size > 0 {
        req.data_mut().copy_from_slice(payload);
    }
    let resp = client.rpc.alloc_msg_buffer_or_die(size.max(1));

    let result: Arc<Mutex<Option<Vec<u8>>>> = Arc::new(Mutex::new(None));
    let out = result.clone();
    client
        .rpc
        .enqueue_request(
            session_num,
            req_type,
            req,
            resp,
            move |resp, dp| {
                assert!(!resp.is_failed(), "echo request failed");
                let data = resp.resp_msgbuf.as_ref().unwrap().data().to_vec();
                *out.lock().unwrap() = Some(data);
                dp.release_response(resp);
            },
            0,
            None,
        )
        .expect("enqueue_request");

    assert!(
        poll_until(&[client, server], Duration::from_secs(30), || result
            .lock()
            .unwrap()
            .is_some()),
        "echo of {} bytes timed out",
        size
    );
    let data = result.lock().unwrap().take().unwrap();
    data
}

//! End-to-end loopback tests: two endpoints over the UDP transport.

mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::*;
use pacerpc::packet::data_size_to_num_pkts;
use pacerpc::{
    Datapath, ReqHandlerType, Rpc, SmEventType, SmStatus, Transport, UdpTransport, SESSION_CREDITS,
};

const MDPP: usize = <UdpTransport as Transport>::MAX_DATA_PER_PKT;
const ECHO: u8 = 1;

#[test]
fn test_single_packet_echo() {
    let server = new_endpoint(1, test_config());
    register_echo(&server, ECHO, ReqHandlerType::Foreground);
    let client = new_endpoint(2, test_config());
    let sn = connect(&client, &server);

    let payload = vec![0xAB; 64];
    let got = echo_once(&client, &server, sn, ECHO, &payload);
    assert_eq!(got, payload);

    assert_eq!(client.rpc.get_num_re_tx(sn), 0);
    assert_eq!(client.rpc.available_credits(sn), SESSION_CREDITS);
    assert_eq!(client.rpc.num_active_rpcs(), 0);
}

#[test]
fn test_round_trip_payload_sizes() {
    let server = new_endpoint(1, test_config());
    register_echo(&server, ECHO, ReqHandlerType::Foreground);
    let client = new_endpoint(2, test_config());
    let sn = connect(&client, &server);

    for size in [0usize, 1, MDPP, MDPP + 1, 65536, 1 << 20] {
        let payload: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        let got = echo_once(&client, &server, sn, ECHO, &payload);
        assert_eq!(got, payload, "echo mismatch at {} bytes", size);
        assert_eq!(client.rpc.available_credits(sn), SESSION_CREDITS);
    }
}

#[test]
fn test_large_request_small_response_credit_returns() {
    // 1 MiB request, 1 B response: the server must return one explicit CR
    // per request packet except the last. Generous RTO so a slow run cannot
    // trigger a spurious retransmit and inflate the counters.
    let config = test_config().with_rto_us(50_000);
    let server = new_endpoint(1, config.clone());
    server
        .rpc
        .register_req_handler(ECHO, ReqHandlerType::Foreground, |mut req, dp| {
            let resp = req.pre_resp_msgbuf();
            resp.resize(1);
            resp.data_mut()[0] = 0x7E;
            dp.enqueue_response(req);
        });
    let client = new_endpoint(2, config);
    let sn = connect(&client, &server);
    server.rpc.reset_dpath_stats();
    client.rpc.reset_dpath_stats();

    let size = 1usize << 20;
    let payload: Vec<u8> = (0..size).map(|i| (i % 127) as u8).collect();
    let got = echo_once(&client, &server, sn, ECHO, &payload[..]);
    assert_eq!(got, vec![0x7E]);

    let num_req_pkts = data_size_to_num_pkts(size, MDPP) as u64;
    assert_eq!(server.rpc.get_dpath_stats().expl_cr_tx, num_req_pkts - 1);
    assert_eq!(client.rpc.get_dpath_stats().rfr_tx, 0);
    assert_eq!(client.rpc.get_num_re_tx(sn), 0);
}

#[test]
fn test_small_request_large_response_rfrs() {
    // 1 B request, 1 MiB response: the client must send one RFR per
    // response packet except the first.
    let size = 1usize << 20;
    let config = test_config().with_rto_us(50_000);
    let server = new_endpoint(1, config.clone());
    server
        .rpc
        .register_req_handler(ECHO, ReqHandlerType::Foreground, move |mut req, dp| {
            let mut resp = dp.alloc_msg_buffer(size);
            assert!(resp.is_valid());
            for (i, b) in resp.data_mut().iter_mut().enumerate() {
                *b = (i % 249) as u8;
            }
            req.set_dyn_resp_msgbuf(resp);
            dp.enqueue_response(req);
        });
    let client = new_endpoint(2, config);
    let sn = connect(&client, &server);
    client.rpc.reset_dpath_stats();

    // The response buffer must be large enough for the unknown response.
    let mut req = client.rpc.alloc_msg_buffer_or_die(1);
    req.data_mut()[0] = 1;
    let resp = client.rpc.alloc_msg_buffer_or_die(size);

    let result: Arc<Mutex<Option<Vec<u8>>>> = Arc::new(Mutex::new(None));
    let out = result.clone();
    client
        .rpc
        .enqueue_request(
            sn,
            ECHO,
            req,
            resp,
            move |resp, dp| {
                let data = resp.resp_msgbuf.as_ref().unwrap().data().to_vec();
                *out.lock().unwrap() = Some(data);
                dp.release_response(resp);
            },
            0,
            None,
        )
        .unwrap();
    assert!(poll_until(
        &[&client, &server],
        Duration::from_secs(30),
        || result.lock().unwrap().is_some()
    ));

    let data = result.lock().unwrap().take().unwrap();
    assert_eq!(data.len(), size);
    assert!(data.iter().enumerate().all(|(i, &b)| b == (i % 249) as u8));

    let num_resp_pkts = data_size_to_num_pkts(size, MDPP) as u64;
    assert_eq!(client.rpc.get_dpath_stats().rfr_tx, num_resp_pkts - 1);
}

#[test]
fn test_lossy_channel_recovery() {
    // 1% injected drop on both endpoints; every continuation still fires
    // exactly once and nothing leaks.
    let server = new_endpoint(1, test_config());
    register_echo(&server, ECHO, ReqHandlerType::Foreground);
    let client = new_endpoint(2, test_config());
    let sn = connect(&client, &server);

    // Warm up, then record the arena baseline.
    let _ = echo_once(&client, &server, sn, ECHO, &[0u8; 8]);
    let client_baseline = client.rpc.get_stat_user_alloc_tot();

    client.rpc.fault_inject_set_pkt_drop_prob_st(0.01);
    server.rpc.fault_inject_set_pkt_drop_prob_st(0.01);

    const NUM_RPCS: usize = 2000;
    let completions = Arc::new(AtomicUsize::new(0));
    for i in 0..NUM_RPCS {
        let mut req = client.rpc.alloc_msg_buffer_or_die(1024);
        req.data_mut().fill((i % 255) as u8);
        let resp = client.rpc.alloc_msg_buffer_or_die(1024);
        let done = completions.clone();
        let expect = (i % 255) as u8;
        client
            .rpc
            .enqueue_request(
                sn,
                ECHO,
                req,
                resp,
                move |resp, dp| {
                    assert!(!resp.is_failed());
                    let data = resp.resp_msgbuf.as_ref().unwrap().data();
                    assert_eq!(data.len(), 1024);
                    assert!(data.iter().all(|&b| b == expect));
                    done.fetch_add(1, Ordering::SeqCst);
                    dp.release_response(resp);
                },
                i,
                None,
            )
            .unwrap();
    }

    assert!(
        poll_until(&[&client, &server], Duration::from_secs(60), || {
            completions.load(Ordering::SeqCst) == NUM_RPCS
        }),
        "only {} of {} RPCs completed",
        completions.load(Ordering::SeqCst),
        NUM_RPCS
    );

    assert_eq!(client.rpc.num_active_rpcs(), 0);
    assert_eq!(client.rpc.available_credits(sn), SESSION_CREDITS);
    assert_eq!(client.rpc.get_stat_user_alloc_tot(), client_baseline);
}

#[test]
fn test_backlog_fifo_order() {
    // 4x as many concurrent requests as sslots: at most SESSION_CREDITS in
    // flight, and continuations fire in enqueue order. Generous RTO so a
    // spurious retransmit cannot reorder completions.
    let config = test_config().with_rto_us(50_000);
    let server = new_endpoint(1, config.clone());
    register_echo(&server, ECHO, ReqHandlerType::Foreground);
    let client = new_endpoint(2, config);
    let sn = connect(&client, &server);

    const NUM_RPCS: usize = 4 * SESSION_CREDITS;
    let order: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
    for i in 0..NUM_RPCS {
        let mut req = client.rpc.alloc_msg_buffer_or_die(8);
        req.data_mut().fill(i as u8);
        let resp = client.rpc.alloc_msg_buffer_or_die(8);
        let order = order.clone();
        client
            .rpc
            .enqueue_request(
                sn,
                ECHO,
                req,
                resp,
                move |resp, dp| {
                    order.lock().unwrap().push(resp.tag);
                    dp.release_response(resp);
                },
                i,
                None,
            )
            .unwrap();
        assert!(client.rpc.num_active_rpcs() <= SESSION_CREDITS);
    }

    assert!(poll_until(&[&client, &server], Duration::from_secs(10), || {
        client.rpc.num_active_rpcs() <= SESSION_CREDITS
            && order.lock().unwrap().len() == NUM_RPCS
    }));

    let order = order.lock().unwrap();
    assert_eq!(&*order, &(0..NUM_RPCS).collect::<Vec<_>>());
}

#[test]
fn test_credit_conservation_ping_pong() {
    let server = new_endpoint(1, test_config());
    register_echo(&server, ECHO, ReqHandlerType::Foreground);
    let client = new_endpoint(2, test_config());
    let sn = connect(&client, &server);

    for i in 0..50u8 {
        let got = echo_once(&client, &server, sn, ECHO, &[i]);
        assert_eq!(got, vec![i]);
        // Between RPCs, all credits are home and no RPC is active.
        assert_eq!(client.rpc.available_credits(sn), SESSION_CREDITS);
        assert_eq!(client.rpc.num_active_rpcs(), 0);
    }
}

#[test]
fn test_session_reset_on_peer_death() {
    let mut config = test_config();
    config.session_failure_re_tx_limit = 3;
    config.rto_us = 1000;

    let server = new_endpoint(1, test_config());
    register_echo(&server, ECHO, ReqHandlerType::Foreground);
    let client = new_endpoint(2, config);
    let sn = connect(&client, &server);

    let got = echo_once(&client, &server, sn, ECHO, b"alive");
    assert_eq!(got, b"alive");

    // Kill the peer, then issue a request into the void.
    drop(server);

    let req = client.rpc.alloc_msg_buffer_or_die(64);
    let resp = client.rpc.alloc_msg_buffer_or_die(64);
    let failed = Arc::new(AtomicBool::new(false));
    let failed_c = failed.clone();
    client
        .rpc
        .enqueue_request(
            sn,
            ECHO,
            req,
            resp,
            move |resp, dp| {
                assert!(resp.is_failed());
                failed_c.store(true, Ordering::SeqCst);
                dp.release_response(resp);
            },
            0,
            None,
        )
        .unwrap();

    assert!(
        poll_until(&[&client], Duration::from_secs(10), || failed
            .load(Ordering::SeqCst)),
        "continuation did not report failure"
    );
    assert!(client
        .events
        .borrow()
        .iter()
        .any(|ev| ev.session_num == sn && ev.event == SmEventType::Reset));
    assert_eq!(client.rpc.num_active_sessions(), 0);
}

#[test]
fn test_connect_failed_invalid_rpc_id() {
    let server = new_endpoint(1, test_config());
    let client = new_endpoint(2, test_config());

    let sn = client
        .rpc
        .create_session(server.rpc.local_uri(), 99)
        .unwrap();
    assert!(poll_until(&[&client, &server], Duration::from_secs(5), || {
        client.events.borrow().iter().any(|ev| {
            ev.session_num == sn
                && ev.event == SmEventType::ConnectFailed(SmStatus::InvalidRemoteRpcId)
        })
    }));
    assert!(!client.rpc.is_connected(sn));
    assert_eq!(client.rpc.num_active_sessions(), 0);
}

#[test]
fn test_connect_failed_routing_resolution() {
    let server = new_endpoint(1, test_config());
    server.rpc.fault_inject_fail_resolve_rinfo_st();
    let client = new_endpoint(2, test_config());

    let sn = client
        .rpc
        .create_session(server.rpc.local_uri(), server.rpc.get_rpc_id())
        .unwrap();
    assert!(poll_until(&[&client, &server], Duration::from_secs(5), || {
        client.events.borrow().iter().any(|ev| {
            ev.session_num == sn
                && ev.event == SmEventType::ConnectFailed(SmStatus::RoutingResolutionFailed)
        })
    }));
}

#[test]
fn test_destroy_session() {
    let server = new_endpoint(1, test_config());
    register_echo(&server, ECHO, ReqHandlerType::Foreground);
    let client = new_endpoint(2, test_config());
    let sn = connect(&client, &server);

    let got = echo_once(&client, &server, sn, ECHO, b"bye");
    assert_eq!(got, b"bye");

    client.rpc.destroy_session(sn).unwrap();
    assert!(poll_until(&[&client, &server], Duration::from_secs(5), || {
        client
            .events
            .borrow()
            .iter()
            .any(|ev| ev.session_num == sn && ev.event == SmEventType::Disconnected)
    }));
    assert_eq!(client.rpc.num_active_sessions(), 0);
    assert_eq!(server.rpc.num_active_sessions(), 0);

    // The session slot and its ring entries are reusable.
    let sn2 = connect(&client, &server);
    assert_eq!(sn2, sn);
    let got = echo_once(&client, &server, sn2, ECHO, b"again");
    assert_eq!(got, b"again");
}

#[test]
fn test_destroy_session_busy() {
    let server = new_endpoint(1, test_config());
    // No handler: the request stays in flight.
    let client = new_endpoint(2, test_config());
    let sn = connect(&client, &server);

    let req = client.rpc.alloc_msg_buffer_or_die(8);
    let resp = client.rpc.alloc_msg_buffer_or_die(8);
    client
        .rpc
        .enqueue_request(sn, ECHO, req, resp, |resp, dp| dp.release_response(resp), 0, None)
        .unwrap();

    assert!(matches!(
        client.rpc.destroy_session(sn),
        Err(pacerpc::Error::SessionBusy(_))
    ));
}

#[test]
fn test_background_handler_and_continuation() {
    let server = new_endpoint(1, test_config().with_bg_threads(2));
    register_echo(&server, ECHO, ReqHandlerType::Background);
    let client = new_endpoint(2, test_config().with_bg_threads(1));
    let sn = connect(&client, &server);

    let done = Arc::new(AtomicBool::new(false));
    let done_c = done.clone();
    let mut req = client.rpc.alloc_msg_buffer_or_die(256);
    req.data_mut().fill(0x5C);
    let resp = client.rpc.alloc_msg_buffer_or_die(256);
    client
        .rpc
        .enqueue_request(
            sn,
            ECHO,
            req,
            resp,
            move |resp, dp| {
                assert!(!resp.is_failed());
                let data = resp.resp_msgbuf.as_ref().unwrap().data();
                assert!(data.iter().all(|&b| b == 0x5C));
                done_c.store(true, Ordering::SeqCst);
                dp.release_response(resp);
            },
            0,
            Some(0),
        )
        .unwrap();

    assert!(poll_until(&[&client, &server], Duration::from_secs(10), || {
        done.load(Ordering::SeqCst)
    }));

    // The slot released through the background queue is usable again.
    assert!(poll_until(&[&client, &server], Duration::from_secs(5), || {
        client.rpc.available_credits(sn) == SESSION_CREDITS && client.rpc.num_active_rpcs() == 0
    }));
    let got = echo_once(&client, &server, sn, ECHO, b"after-bg");
    assert_eq!(got, b"after-bg");
}

#[test]
fn test_paced_transmission() {
    // Force every packet through the wheel.
    let mut config = test_config().with_pacing(true);
    config.cc_opt_wheel_bypass = false;

    let server = new_endpoint(1, config.clone());
    register_echo(&server, ECHO, ReqHandlerType::Foreground);
    let client = new_endpoint(2, config);
    let sn = connect(&client, &server);

    for i in 0..10u8 {
        let got = echo_once(&client, &server, sn, ECHO, &[i; 32]);
        assert_eq!(got, vec![i; 32]);
    }

    // Multi-packet request and response, all paced.
    let payload: Vec<u8> = (0..4 * MDPP).map(|i| (i % 241) as u8).collect();
    let got = echo_once(&client, &server, sn, ECHO, &payload);
    assert_eq!(got, payload);

    assert_eq!(client.rpc.available_credits(sn), SESSION_CREDITS);
}

#[test]
fn test_max_msg_size_is_sane() {
    let max = Rpc::<UdpTransport>::MAX_MSG_SIZE;
    assert!(max > 8 * 1024 * 1024 - 128 * 1024);
    assert!(max < 8 * 1024 * 1024);
    // Packet numbers never alias within one RPC.
    assert!((1usize << 14) * MDPP > 2 * max);
}

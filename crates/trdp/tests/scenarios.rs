//! End-to-end scenarios over loopback sockets.
//!
//! Each test gives its session unique ports so the suite can run in
//! parallel. Remote peers are emulated with plain `std::net` sockets and
//! frames built through the public wire API, which keeps both sides of
//! every exchange observable. Intervals are scaled down from typical
//! field values to keep the suite fast; margins are generous to survive
//! loaded CI machines.

use std::net::{Ipv4Addr, SocketAddrV4, TcpListener, UdpSocket};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use trdp::wire::{self, MdFrameSpec};
use trdp::{
    ListenSpec, MdConfig, MemConfig, MsgType, PdConfig, PktFlags, PublishSpec, Registry,
    RequestSpec, ResultCode, SessionConfig, SubscribeSpec, TimeVal, TimeoutBehavior, TrdpError,
};

// Below the default ephemeral range, so the std-socket peers (which
// bind port 0) can never collide with a session port.
fn unique_port() -> u16 {
    static NEXT: AtomicU16 = AtomicU16::new(21480);
    NEXT.fetch_add(1, Ordering::SeqCst)
}

fn registry() -> Registry {
    Registry::new(MemConfig::default()).unwrap()
}

fn open_session(registry: &Registry, pd_port: u16, md_udp_port: u16) -> trdp::Session {
    registry
        .open_session(
            SessionConfig {
                own_ip: Ipv4Addr::LOCALHOST,
                pd: PdConfig {
                    port: pd_port,
                    ..PdConfig::default()
                },
                md: MdConfig {
                    udp_port: md_udp_port,
                    confirm_timeout: TimeVal::from_millis(150),
                    ..MdConfig::default()
                },
                ..SessionConfig::default()
            },
            None,
        )
        .unwrap()
}

/// Drive the session loop for a wall-clock duration.
fn drive_for(session: &trdp::Session, duration: Duration) {
    let start = Instant::now();
    while start.elapsed() < duration {
        let ready = session
            .wait_for_event(Some(TimeVal::from_millis(5)))
            .unwrap();
        session.process(Some(&ready)).unwrap();
        session.process(None).unwrap();
    }
}

fn udp_peer() -> (UdpSocket, u16) {
    let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    socket
        .set_read_timeout(Some(Duration::from_millis(2000)))
        .unwrap();
    let port = socket.local_addr().unwrap().port();
    (socket, port)
}

// ----------------------------------------------------------------------
// PD scenarios
// ----------------------------------------------------------------------

#[test]
fn pd_send_cycle_delivers_consecutive_sequence_numbers() {
    let registry = registry();
    let (receiver, rx_port) = udp_peer();
    let session = open_session(&registry, rx_port, unique_port());

    session
        .publish(&PublishSpec {
            com_id: 1001,
            dest_ip: Ipv4Addr::LOCALHOST,
            interval: TimeVal::from_millis(50),
            data: b"Hello TRDP 00000".to_vec(),
            ..PublishSpec::default()
        })
        .unwrap();

    drive_for(&session, Duration::from_millis(180));

    let mut frames = Vec::new();
    let mut buf = [0u8; 2048];
    receiver.set_read_timeout(Some(Duration::from_millis(100))).unwrap();
    while let Ok((len, _)) = receiver.recv_from(&mut buf) {
        frames.push(buf[..len].to_vec());
    }

    // 180 ms at a 50 ms cycle: three sends, give or take one.
    assert!(
        (2..=4).contains(&frames.len()),
        "expected ~3 frames, got {}",
        frames.len()
    );
    for (i, frame) in frames.iter().enumerate() {
        let view = wire::validate_pd(frame, (0, 0)).expect("self-emitted frame validates");
        assert_eq!(view.header.com_id(), 1001);
        assert_eq!(view.header.seq(), i as u32);
        assert_eq!(view.payload, b"Hello TRDP 00000");
    }

    let stats = session.statistics().unwrap();
    assert_eq!(stats.pd.tx as usize, frames.len());
    session.close().unwrap();
}

#[test]
fn pd_timeout_then_recovery() {
    let registry = registry();
    let pd_port = unique_port();
    let session = open_session(&registry, pd_port, unique_port());

    let events: Arc<Mutex<Vec<(ResultCode, Vec<u8>)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let sub = session
        .subscribe(&SubscribeSpec {
            com_id: 1002,
            dest_ip: Ipv4Addr::LOCALHOST,
            timeout: TimeVal::from_millis(120),
            behavior: TimeoutBehavior::SetToZero,
            max_size: 32,
            callback: Some(Arc::new(move |event| {
                sink.lock()
                    .unwrap()
                    .push((event.info.result, event.payload.clone()));
            })),
            ..SubscribeSpec::default()
        })
        .unwrap();

    let (sender, _) = udp_peer();
    let dest = SocketAddrV4::new(Ipv4Addr::LOCALHOST, pd_port);
    let frame = wire::build_pd(MsgType::Pd, 1002, (0, 0), 0, 0, &[0x5A; 16]);

    // One frame, then silence past the supervision interval, then
    // recovery.
    sender.send_to(&frame, dest).unwrap();
    drive_for(&session, Duration::from_millis(300));
    sender.send_to(&frame, dest).unwrap();
    drive_for(&session, Duration::from_millis(80));

    let seen = events.lock().unwrap().clone();
    let codes: Vec<ResultCode> = seen.iter().map(|(c, _)| *c).collect();
    assert_eq!(
        codes,
        vec![ResultCode::Ok, ResultCode::Timeout, ResultCode::Ok],
        "event order"
    );
    // The timeout event carries no payload; the data events carry the
    // body.
    assert_eq!(seen[0].1, vec![0x5A; 16]);
    assert!(seen[1].1.is_empty());

    // After recovery get() serves the fresh payload again.
    let (data, info) = session.get(sub).unwrap();
    assert_eq!(info.result, ResultCode::Ok);
    assert_eq!(data, vec![0x5A; 16]);

    let stats = session.statistics().unwrap();
    assert_eq!(stats.pd.timeouts, 1);
    assert_eq!(stats.pd.rx, 2);
    session.close().unwrap();
}

#[test]
fn pd_timeout_zeroes_cached_payload() {
    let registry = registry();
    let pd_port = unique_port();
    let session = open_session(&registry, pd_port, unique_port());

    let sub = session
        .subscribe(&SubscribeSpec {
            com_id: 1010,
            dest_ip: Ipv4Addr::LOCALHOST,
            timeout: TimeVal::from_millis(100),
            behavior: TimeoutBehavior::SetToZero,
            max_size: 8,
            ..SubscribeSpec::default()
        })
        .unwrap();

    let (sender, _) = udp_peer();
    let frame = wire::build_pd(MsgType::Pd, 1010, (0, 0), 0, 0, &[0xFF; 8]);
    sender
        .send_to(&frame, SocketAddrV4::new(Ipv4Addr::LOCALHOST, pd_port))
        .unwrap();
    drive_for(&session, Duration::from_millis(50));
    assert_eq!(session.get(sub).unwrap().0, vec![0xFF; 8]);

    drive_for(&session, Duration::from_millis(150));
    let (data, info) = session.get(sub).unwrap();
    assert_eq!(info.result, ResultCode::Timeout);
    assert_eq!(data, vec![0x00; 8], "set-to-zero behavior");
    session.close().unwrap();
}

#[test]
fn pd_topo_mismatch_rejected_and_deadline_untouched() {
    let registry = registry();
    let pd_port = unique_port();
    let session = open_session(&registry, pd_port, unique_port());
    session.set_topo_count(5, 0).unwrap();

    let events: Arc<Mutex<Vec<ResultCode>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    session
        .subscribe(&SubscribeSpec {
            com_id: 1003,
            dest_ip: Ipv4Addr::LOCALHOST,
            timeout: TimeVal::from_millis(200),
            max_size: 16,
            callback: Some(Arc::new(move |event| {
                sink.lock().unwrap().push(event.info.result);
            })),
            ..SubscribeSpec::default()
        })
        .unwrap();

    let (sender, _) = udp_peer();
    let dest = SocketAddrV4::new(Ipv4Addr::LOCALHOST, pd_port);

    // Stale topography: dropped, no delivery, counted.
    let stale = wire::build_pd(MsgType::Pd, 1003, (4, 0), 0, 0, &[1; 4]);
    sender.send_to(&stale, dest).unwrap();
    drive_for(&session, Duration::from_millis(60));
    assert!(events.lock().unwrap().is_empty());
    assert_eq!(session.statistics().unwrap().pd.topo_err, 1);
    assert_eq!(session.statistics().unwrap().pd.rx, 0);

    // Matching topography: delivered.
    let good = wire::build_pd(MsgType::Pd, 1003, (5, 0), 0, 0, &[2; 4]);
    sender.send_to(&good, dest).unwrap();
    drive_for(&session, Duration::from_millis(60));
    assert_eq!(events.lock().unwrap().as_slice(), &[ResultCode::Ok]);

    // The stale frame must not have fed the supervision: the timeout
    // fires 200 ms after the *valid* frame, so nothing yet.
    assert_eq!(session.statistics().unwrap().pd.timeouts, 0);
    session.close().unwrap();
}

#[test]
fn pd_unsubscribe_from_inside_callback() {
    let registry = registry();
    let pd_port = unique_port();
    let session = open_session(&registry, pd_port, unique_port());

    let slot: Arc<Mutex<Option<trdp::SubHandle>>> = Arc::new(Mutex::new(None));
    let events = Arc::new(Mutex::new(0u32));

    let slot_cb = Arc::clone(&slot);
    let events_cb = Arc::clone(&events);
    let session_cb = session.clone();
    let sub = session
        .subscribe(&SubscribeSpec {
            com_id: 1004,
            dest_ip: Ipv4Addr::LOCALHOST,
            timeout: TimeVal::from_millis(500),
            max_size: 16,
            callback: Some(Arc::new(move |_event| {
                *events_cb.lock().unwrap() += 1;
                // Re-enter the session from the callback.
                if let Some(handle) = slot_cb.lock().unwrap().take() {
                    session_cb.unsubscribe(handle).unwrap();
                }
            })),
            ..SubscribeSpec::default()
        })
        .unwrap();
    *slot.lock().unwrap() = Some(sub);

    let (sender, _) = udp_peer();
    let dest = SocketAddrV4::new(Ipv4Addr::LOCALHOST, pd_port);
    let frame = wire::build_pd(MsgType::Pd, 1004, (0, 0), 0, 0, &[9; 4]);
    sender.send_to(&frame, dest).unwrap();
    drive_for(&session, Duration::from_millis(60));
    assert_eq!(*events.lock().unwrap(), 1);

    // The subscription is gone, its socket with it: further frames go
    // nowhere and no more events fire.
    sender.send_to(&frame, dest).unwrap();
    drive_for(&session, Duration::from_millis(60));
    assert_eq!(*events.lock().unwrap(), 1);
    assert_eq!(session.socket_count().unwrap(), 0);
    session.close().unwrap();
}

#[test]
fn pd_publish_unpublish_releases_resources() {
    let registry = registry();
    let session = open_session(&registry, unique_port(), unique_port());
    let before = registry.mem_used();

    let handle = session
        .publish(&PublishSpec {
            com_id: 1005,
            dest_ip: Ipv4Addr::new(239, 1, 1, 5),
            interval: TimeVal::from_millis(500),
            data: vec![0; 32],
            ..PublishSpec::default()
        })
        .unwrap();
    assert!(registry.mem_used() > before);
    assert_eq!(session.socket_count().unwrap(), 1);

    // Double publish of the same address tuple is refused.
    let err = session
        .publish(&PublishSpec {
            com_id: 1005,
            dest_ip: Ipv4Addr::new(239, 1, 1, 5),
            interval: TimeVal::from_millis(500),
            data: vec![0; 32],
            ..PublishSpec::default()
        })
        .unwrap_err();
    assert!(matches!(err, TrdpError::NoPublish));

    session.unpublish(handle).unwrap();
    assert_eq!(session.socket_count().unwrap(), 0);
    assert_eq!(registry.mem_used(), before);
    session.close().unwrap();
}

// ----------------------------------------------------------------------
// MD scenarios
// ----------------------------------------------------------------------

fn md_events_sink() -> (
    Arc<Mutex<Vec<(ResultCode, MsgType, Vec<u8>)>>>,
    Arc<trdp::MdCallback>,
) {
    let events: Arc<Mutex<Vec<(ResultCode, MsgType, Vec<u8>)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let callback: Arc<trdp::MdCallback> = Arc::new(move |event| {
        sink.lock().unwrap().push((
            event.info.result,
            event.info.msg_type,
            event.payload.clone(),
        ));
    });
    (events, callback)
}

fn reply_frame(request: &[u8], msg_type: MsgType, payload: &[u8], source_uri: &str) -> Vec<u8> {
    let view = wire::validate_md(request, (0, 0)).expect("request validates");
    wire::build_md(
        &MdFrameSpec {
            msg_type,
            com_id: view.header.com_id(),
            topo: (0, 0),
            reply_status: 0,
            session_id: view.header.session_id,
            reply_timeout_us: 500_000,
            source_uri: wire::encode_uri(source_uri).unwrap(),
            destination_uri: view.header.source_uri,
        },
        0,
        payload,
    )
    .to_vec()
}

#[test]
fn md_request_with_two_repliers_and_confirm() {
    let registry = registry();
    let session = open_session(&registry, unique_port(), unique_port());
    let (events, callback) = md_events_sink();

    let (replier, replier_port) = udp_peer();

    let session_id = session
        .request(&RequestSpec {
            com_id: 2001,
            dest_ip: Ipv4Addr::LOCALHOST,
            dest_port: replier_port,
            source_uri: "caller".into(),
            destination_uri: "repliers".into(),
            reply_timeout: TimeVal::from_millis(300),
            num_repliers: 2,
            callback: Some(callback),
            data: b"read".to_vec(),
            ..RequestSpec::default()
        })
        .unwrap();

    // First replier answers plainly, the second demands a confirm.
    let mut buf = [0u8; 2048];
    let (len, caller_addr) = replier.recv_from(&mut buf).unwrap();
    let request = buf[..len].to_vec();
    assert_eq!(
        wire::validate_md(&request, (0, 0)).unwrap().header.session_id,
        session_id
    );
    replier
        .send_to(&reply_frame(&request, MsgType::Mp, b"r1", "rep1"), caller_addr)
        .unwrap();
    drive_for(&session, Duration::from_millis(60));
    replier
        .send_to(&reply_frame(&request, MsgType::Mq, b"r2", "rep2"), caller_addr)
        .unwrap();
    drive_for(&session, Duration::from_millis(60));

    {
        let seen = events.lock().unwrap();
        assert_eq!(seen.len(), 2, "two reply callbacks");
        assert_eq!(seen[0].0, ResultCode::Ok);
        assert_eq!(seen[0].1, MsgType::Mp);
        assert_eq!(seen[0].2, b"r1");
        assert_eq!(seen[1].1, MsgType::Mq);
    }

    // The Mq obliges the caller to confirm; the replier sees the Mc.
    session.confirm(&session_id, 0).unwrap();
    let (len, _) = replier.recv_from(&mut buf).unwrap();
    let confirm = wire::validate_md(&buf[..len], (0, 0)).unwrap();
    assert_eq!(confirm.msg_type, MsgType::Mc);
    assert_eq!(confirm.header.session_id, session_id);

    // Transaction complete: another confirm has nothing to attach to.
    assert!(session.confirm(&session_id, 0).is_err());

    // No timeout is reported for a completed transaction.
    drive_for(&session, Duration::from_millis(300));
    assert_eq!(events.lock().unwrap().len(), 2);
    assert_eq!(session.statistics().unwrap().udp_md.reply_timeouts, 0);
    session.close().unwrap();
}

#[test]
fn md_retry_then_single_timeout_callback() {
    let registry = registry();
    let session = open_session(&registry, unique_port(), unique_port());
    let (events, callback) = md_events_sink();

    let (replier, replier_port) = udp_peer();

    let session_id = session
        .request(&RequestSpec {
            com_id: 2002,
            dest_ip: Ipv4Addr::LOCALHOST,
            dest_port: replier_port,
            reply_timeout: TimeVal::from_millis(100),
            num_repliers: 1,
            num_retries_max: Some(2),
            callback: Some(callback),
            data: b"anyone?".to_vec(),
            ..RequestSpec::default()
        })
        .unwrap();

    // The replier stays silent; it only records what arrives.
    drive_for(&session, Duration::from_millis(450));

    let mut requests = Vec::new();
    let mut buf = [0u8; 2048];
    replier.set_read_timeout(Some(Duration::from_millis(100))).unwrap();
    while let Ok((len, _)) = replier.recv_from(&mut buf) {
        requests.push(buf[..len].to_vec());
    }
    assert_eq!(requests.len(), 3, "initial send plus two retries");
    for (i, request) in requests.iter().enumerate() {
        let view = wire::validate_md(request, (0, 0)).unwrap();
        assert_eq!(view.header.session_id, session_id, "same session id");
        assert_eq!(view.header.seq(), i as u32, "retransmit bumps sequence");
    }

    let seen = events.lock().unwrap();
    assert_eq!(seen.len(), 1, "exactly one terminal callback");
    assert_eq!(seen[0].0, ResultCode::Timeout);
    assert_eq!(session.statistics().unwrap().udp_md.reply_timeouts, 1);
    session.close().unwrap();
}

#[test]
fn md_listener_receives_request_and_replies() {
    let registry = registry();
    let md_port = unique_port();
    let session = open_session(&registry, unique_port(), md_port);

    let incoming: Arc<Mutex<Vec<trdp::MdEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&incoming);
    session
        .add_listener(&ListenSpec {
            com_id: 2005,
            callback: Some(Arc::new(move |event| {
                sink.lock().unwrap().push(event.clone());
            })),
            ..ListenSpec::default()
        })
        .unwrap();

    // A remote caller sends a request straight at the listener port.
    let (caller, _) = udp_peer();
    let request = wire::build_md(
        &MdFrameSpec {
            msg_type: MsgType::Mr,
            com_id: 2005,
            topo: (0, 0),
            reply_status: 0,
            session_id: [0xAB; 16],
            reply_timeout_us: 500_000,
            source_uri: wire::encode_uri("remote-caller").unwrap(),
            destination_uri: wire::encode_uri("local-dev").unwrap(),
        },
        0,
        b"question",
    );
    caller
        .send_to(&request, SocketAddrV4::new(Ipv4Addr::LOCALHOST, md_port))
        .unwrap();
    drive_for(&session, Duration::from_millis(80));

    let event = {
        let seen = incoming.lock().unwrap();
        assert_eq!(seen.len(), 1, "request delivered to listener");
        seen[0].clone()
    };
    assert_eq!(event.info.msg_type, MsgType::Mr);
    assert_eq!(event.info.source_uri, "remote-caller");
    assert_eq!(event.payload, b"question");

    // The application answers through the session.
    session
        .reply(&event.info.session_id, 7, false, b"answer")
        .unwrap();
    let mut buf = [0u8; 2048];
    let (len, _) = caller.recv_from(&mut buf).unwrap();
    let reply = wire::validate_md(&buf[..len], (0, 0)).unwrap();
    assert_eq!(reply.msg_type, MsgType::Mp);
    assert_eq!(reply.header.session_id, [0xAB; 16]);
    assert_eq!(reply.header.reply_status.get(), 7);
    assert_eq!(reply.payload, b"answer");

    // Unknown ComIds are counted and dropped.
    let stray = wire::build_md(
        &MdFrameSpec {
            msg_type: MsgType::Mn,
            com_id: 9999,
            topo: (0, 0),
            reply_status: 0,
            session_id: [0; 16],
            reply_timeout_us: 0,
            source_uri: wire::encode_uri("x").unwrap(),
            destination_uri: wire::encode_uri("y").unwrap(),
        },
        0,
        &[],
    );
    caller
        .send_to(&stray, SocketAddrV4::new(Ipv4Addr::LOCALHOST, md_port))
        .unwrap();
    drive_for(&session, Duration::from_millis(60));
    assert_eq!(session.statistics().unwrap().udp_md.no_listener, 1);
    assert_eq!(incoming.lock().unwrap().len(), 1);
    session.close().unwrap();
}

#[test]
fn md_reply_query_confirm_timeout_reported() {
    let registry = registry();
    let md_port = unique_port();
    let session = open_session(&registry, unique_port(), md_port);

    let (events, callback) = md_events_sink();
    session
        .add_listener(&ListenSpec {
            com_id: 2006,
            callback: Some(callback),
            ..ListenSpec::default()
        })
        .unwrap();

    let (caller, _) = udp_peer();
    let request = wire::build_md(
        &MdFrameSpec {
            msg_type: MsgType::Mr,
            com_id: 2006,
            topo: (0, 0),
            reply_status: 0,
            session_id: [0xCD; 16],
            reply_timeout_us: 500_000,
            source_uri: wire::encode_uri("caller").unwrap(),
            destination_uri: wire::encode_uri("dev").unwrap(),
        },
        0,
        &[],
    );
    caller
        .send_to(&request, SocketAddrV4::new(Ipv4Addr::LOCALHOST, md_port))
        .unwrap();
    drive_for(&session, Duration::from_millis(80));

    // Reply demanding a confirm that never comes (confirm timeout is
    // 150 ms in this suite's config).
    session.reply(&[0xCD; 16], 0, true, b"data").unwrap();
    drive_for(&session, Duration::from_millis(300));

    let seen = events.lock().unwrap();
    let last = seen.last().expect("confirm timeout event");
    assert_eq!(last.0, ResultCode::ConfirmTimeout);
    assert_eq!(session.statistics().unwrap().udp_md.confirm_timeouts, 1);
    session.close().unwrap();
}

#[test]
fn md_notify_reaches_listener_session() {
    let registry = registry();
    let md_port = unique_port();
    let listener = open_session(&registry, unique_port(), md_port);
    let caller = open_session(&registry, unique_port(), unique_port());

    let (events, callback) = md_events_sink();
    listener
        .add_listener(&ListenSpec {
            com_id: 2007,
            callback: Some(callback),
            ..ListenSpec::default()
        })
        .unwrap();

    caller
        .notify(&RequestSpec {
            com_id: 2007,
            dest_ip: Ipv4Addr::LOCALHOST,
            dest_port: md_port,
            source_uri: "annunciator".into(),
            destination_uri: "listeners".into(),
            data: b"door closed".to_vec(),
            ..RequestSpec::default()
        })
        .unwrap();

    drive_for(&listener, Duration::from_millis(80));
    let seen = events.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].1, MsgType::Mn);
    assert_eq!(seen[0].2, b"door closed");
    // Notifications leave no session behind on either side.
    drop(seen);
    caller.close().unwrap();
    listener.close().unwrap();
}

#[test]
fn md_tcp_request_reply_round_trip() {
    let registry = registry();
    let session = open_session(&registry, unique_port(), unique_port());
    let (events, callback) = md_events_sink();

    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let tcp_port = listener.local_addr().unwrap().port();

    let session_id = session
        .request(&RequestSpec {
            com_id: 2008,
            dest_ip: Ipv4Addr::LOCALHOST,
            dest_port: tcp_port,
            flags: Some(PktFlags {
                tcp: true,
                ..PktFlags::default()
            }),
            reply_timeout: TimeVal::from_millis(1000),
            num_repliers: 1,
            callback: Some(callback),
            data: b"over tcp".to_vec(),
            ..RequestSpec::default()
        })
        .unwrap();

    // Flush the connect + request from the session side.
    drive_for(&session, Duration::from_millis(80));

    let (mut stream, _) = listener.accept().unwrap();
    stream
        .set_read_timeout(Some(Duration::from_millis(1000)))
        .unwrap();
    let request = read_md_frame(&mut stream);
    let view = wire::validate_md(&request, (0, 0)).unwrap();
    assert_eq!(view.msg_type, MsgType::Mr);
    assert_eq!(view.header.session_id, session_id);
    assert_eq!(view.payload, b"over tcp");

    use std::io::Write;
    stream
        .write_all(&reply_frame(&request, MsgType::Mp, b"tcp-answer", "tcp-rep"))
        .unwrap();
    drive_for(&session, Duration::from_millis(120));

    let seen = events.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].0, ResultCode::Ok);
    assert_eq!(seen[0].2, b"tcp-answer");
    assert_eq!(session.statistics().unwrap().tcp_md.rx, 1);
    drop(seen);
    session.close().unwrap();
}

/// Read one MD frame from a blocking TCP stream: header first, then the
/// advertised remainder.
fn read_md_frame(stream: &mut std::net::TcpStream) -> Vec<u8> {
    use std::io::Read;
    let mut frame = vec![0u8; wire::MD_HEADER_SIZE];
    stream.read_exact(&mut frame).unwrap();
    let dsl = u32::from_be_bytes(frame[20..24].try_into().unwrap()) as usize;
    let total = wire::md_gross_size(dsl);
    let mut rest = vec![0u8; total - wire::MD_HEADER_SIZE];
    stream.read_exact(&mut rest).unwrap();
    frame.extend_from_slice(&rest);
    frame
}

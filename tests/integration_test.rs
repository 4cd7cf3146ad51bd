//! End-to-end scenarios driven over real loopback UDP/TCP sockets, one
//! session per participant, no mocked transport.

use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use trdp::config::{MdConfig, MemConfig, PdConfig, ProcessConfig};
use trdp::frame::{self, FrameHead, MdExt};
use trdp::marshall::NoopMarshall;
use trdp::md::{MdEvent, SessionId};
use trdp::pd::{PubFlags, RedundancyId, SubFlags, TimeoutBehavior};
use trdp::session::{Registry, Session};

fn loopback() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

/// Every scenario gets its own port triple so parallel `#[test]` threads
/// never share a bind address, independent of whatever `SO_REUSEADDR`
/// would otherwise allow.
fn open_on(registry: &Registry, pd_port: u16, md_udp_port: u16, md_tcp_port: u16) -> Session {
    Session::open(
        registry,
        loopback(),
        ProcessConfig::default(),
        PdConfig { port: pd_port, ..PdConfig::default() },
        MdConfig { udp_port: md_udp_port, tcp_port: md_tcp_port, ..MdConfig::default() },
        MemConfig::default(),
        Box::new(NoopMarshall),
    )
    .expect("session opens on loopback")
}

fn spin<F: FnMut() -> bool>(deadline: Instant, mut poll: F) -> bool {
    while Instant::now() < deadline {
        if poll() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    false
}

/// S1: PD echo. A publishes ComID=1000 to B; after two cycles B's `get`
/// returns the published payload, no timeout observed.
#[test]
fn s1_pd_echo() {
    let registry = Registry::new();
    let a = open_on(&registry, 21100, 21101, 21102);
    let b = open_on(&registry, 21100, 21101, 21102);

    let sub = b
        .subscribe(1000, loopback(), None, None, 0, 0, Duration::from_secs(3), TimeoutBehavior::SetToZero, 1432, SubFlags::NONE, 0, None)
        .unwrap();
    // cycle shortened from the spec's literal 1,000,000 microseconds so the
    // test doesn't spend real wall-clock time proving a cyclic-send detail
    // the interval's absolute value has no bearing on.
    a.publish(1000, loopback(), 0, 0, Duration::from_millis(20), RedundancyId::None, PubFlags::NONE, 0, 0, 0, b"Hello World").unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    let seen = spin(deadline, || {
        a.process().unwrap();
        b.process().unwrap();
        matches!(b.get(sub), Ok(data) if data == b"Hello World")
    });
    assert!(seen, "subscriber never observed the published payload");
    let (_, _, timeouts) = b.sub_counters(sub).unwrap();
    assert_eq!(timeouts, 0);
}

/// S2: MD request/reply. A's callback sees `Mp` with `srcUserURI`
/// bytewise equal to the URI A sent (source and dest URI set identical
/// so the reply's echoed URI is directly comparable).
#[test]
fn s2_md_request_reply() {
    let registry = Registry::new();
    let a = open_on(&registry, 21110, 21111, 21112);
    let b = open_on(&registry, 21110, 21111, 21112);

    let (req_tx, req_rx) = mpsc::channel();
    b.add_listener(2002, 0, None, [0u8; 32], 0, Some(Box::new(move |_listener, ev| {
        let _ = req_tx.send(ev);
    })))
    .unwrap();

    let uri = *b"12345678901234567890123456789012";
    let replies = Arc::new(Mutex::new(Vec::new()));
    let replies_cb = replies.clone();
    a.md_request(2002, 0, 0, loopback(), Duration::from_secs(2), 1, 0, uri, uri, false, b"ping", Some(Box::new(move |ev| {
        replies_cb.lock().unwrap().push(ev);
    })))
    .unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    let mut session_id = None;
    spin(deadline, || {
        a.process().unwrap();
        b.process().unwrap();
        if let Ok(MdEvent::Request { session_id: id, .. }) = req_rx.try_recv() {
            session_id = Some(id);
            true
        } else {
            false
        }
    });
    let session_id = session_id.expect("responder never saw the request");
    b.md_reply(session_id, b"Data transmission succeded").unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    let got = spin(deadline, || {
        a.process().unwrap();
        b.process().unwrap();
        !replies.lock().unwrap().is_empty()
    });
    assert!(got, "requester never saw the reply");
    match &replies.lock().unwrap()[0] {
        MdEvent::Reply { source_uri, .. } => assert_eq!(*source_uri, uri),
        other => panic!("expected Mp, got {:?}", other),
    }
}

/// S3: multicast-style request with two independent repliers and
/// `noOfRepliers=2`. Real multicast group membership is a PD-only
/// affordance on this session object (`Session::subscribe` joins a
/// group; no MD equivalent exists), so B and C are modeled as two
/// independently addressed `Mp` senders targeting the same session — the
/// part of the protocol this scenario actually exercises is A's
/// `numReplies` accumulation and termination, not IP multicast delivery.
/// Both senders happen to share a source IP here (loopback); the case
/// where a multicast-style session's peer_ip (the group address) differs
/// from every individual replier's own unicast source is covered directly,
/// without depending on real multicast routing, by
/// `md::engine::tests::multicast_session_accepts_replies_from_distinct_source_ips`.
#[test]
fn s3_multiple_repliers_accumulate_then_terminate() {
    let registry = Registry::new();
    let a = open_on(&registry, 21120, 21121, 21122);

    let replies = Arc::new(Mutex::new(Vec::new()));
    let replies_cb = replies.clone();
    let session_id = a
        .md_request(5003, 0, 0, loopback(), Duration::from_secs(2), 2, 0, [0u8; 32], [0u8; 32], false, b"ping", Some(Box::new(move |ev| {
            replies_cb.lock().unwrap().push(ev);
        })))
        .unwrap();

    let send_reply = |data: &[u8]| {
        let head = FrameHead::init(trdp::constant::MsgType::Mp, 5003, 0, 0, data.len() as u32, 0, 0);
        let ext = MdExt { reply_status: 0, session_id: session_id.0, reply_timeout: 0, source_uri: [0u8; 32], dest_uri: [0u8; 32] };
        let mut buf = frame::build_md(&head, &ext, data);
        frame::finalize_md(&mut buf, 1);
        let sock = UdpSocket::bind(("127.0.0.1", 0)).unwrap();
        sock.send_to(&buf, (loopback(), 21121u16)).unwrap();
    };

    send_reply(b"reply from B");
    let deadline = Instant::now() + Duration::from_secs(2);
    let first = spin(deadline, || {
        a.process().unwrap();
        replies.lock().unwrap().len() >= 1
    });
    assert!(first, "A never saw the first reply");
    assert!(matches!(&replies.lock().unwrap()[0], MdEvent::Reply { num_replies: 1, .. }));

    send_reply(b"reply from C");
    let deadline = Instant::now() + Duration::from_secs(2);
    let second = spin(deadline, || {
        a.process().unwrap();
        replies.lock().unwrap().len() >= 2
    });
    assert!(second, "A never saw the second reply");
    match &replies.lock().unwrap()[1] {
        MdEvent::Reply { num_replies: 2, .. } => {}
        other => panic!("expected the second Mp to report numReplies=2, got {:?}", other),
    }
    assert!(!replies.lock().unwrap().iter().any(|ev| matches!(ev, MdEvent::ReplyTimeout { .. })));
}

/// S4: confirmation timeout. B replies with `Mq` (`replyQuery`); A never
/// confirms; B's own session, reached through the listener it registered
/// (a responder-role session has no requester callback), observes
/// `ConfirmTimeout` once the default 5s confirm window elapses.
#[test]
fn s4_confirmation_timeout() {
    let registry = Registry::new();
    let a = open_on(&registry, 21130, 21131, 21132);
    let b = open_on(&registry, 21130, 21131, 21132);

    let (events_tx, events_rx) = mpsc::channel();
    b.add_listener(7001, 0, None, [0u8; 32], 0, Some(Box::new(move |_listener, ev| {
        let _ = events_tx.send(ev);
    })))
    .unwrap();

    a.md_request(7001, 0, 0, loopback(), Duration::from_secs(2), 1, 0, [0u8; 32], [0u8; 32], false, b"ping", None).unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    let mut session_id = None;
    spin(deadline, || {
        a.process().unwrap();
        b.process().unwrap();
        if let Ok(MdEvent::Request { session_id: id, .. }) = events_rx.try_recv() {
            session_id = Some(id);
            true
        } else {
            false
        }
    });
    let session_id = session_id.expect("responder never saw the request");
    b.md_reply_query(session_id, b"pending").unwrap();

    // A deliberately never calls md_confirm. Default confirm timeout is 5s.
    let deadline = Instant::now() + Duration::from_secs(7);
    let timed_out = spin(deadline, || {
        a.process().unwrap();
        b.process().unwrap();
        matches!(events_rx.try_recv(), Ok(MdEvent::ConfirmTimeout { session_id: sid }) if sid == session_id)
    });
    assert!(timed_out, "B never observed its confirm timeout");
}

/// S5: notification `sessionId` invariant. A well-formed `Mn` always
/// carries an all-zero sessionId (`build_notify` hardcodes it); a frame
/// that violates the invariant is rejected before it ever reaches a
/// listener callback.
#[test]
fn s5_notification_session_id_is_always_zero() {
    let registry = Registry::new();
    let a = open_on(&registry, 21140, 21141, 21142);
    let b = open_on(&registry, 21140, 21141, 21142);

    let (tx, rx) = mpsc::channel();
    b.add_listener(4001, 0, None, [0u8; 32], 0, Some(Box::new(move |_listener, ev| {
        let _ = tx.send(ev);
    })))
    .unwrap();

    a.md_notify(4001, 0, 0, loopback(), [0u8; 32], [0u8; 32], b"event").unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    let mut seen = None;
    spin(deadline, || {
        a.process().unwrap();
        b.process().unwrap();
        if let Ok(ev) = rx.try_recv() {
            seen = Some(ev);
            true
        } else {
            false
        }
    });
    match seen.expect("responder never saw the notification") {
        MdEvent::Notification { com_id, .. } => assert_eq!(com_id, 4001),
        other => panic!("expected a Notification, got {:?}", other),
    }

    // A hand-built Mn with a nonzero sessionId violates the invariant and
    // must never reach a listener.
    let head = FrameHead::init(trdp::constant::MsgType::Mn, 4001, 0, 0, 4, 0, 0);
    let ext = MdExt { reply_status: 0, session_id: [7u8; 16], reply_timeout: 0, source_uri: [0u8; 32], dest_uri: [0u8; 32] };
    let mut buf = frame::build_md(&head, &ext, b"evil");
    frame::finalize_md(&mut buf, 2);
    let sock = UdpSocket::bind(("127.0.0.1", 0)).unwrap();
    sock.send_to(&buf, (loopback(), 21141u16)).unwrap();

    let deadline = Instant::now() + Duration::from_millis(500);
    let leaked = spin(deadline, || {
        b.process().unwrap();
        rx.try_recv().is_ok()
    });
    assert!(!leaked, "a notification with a nonzero sessionId must never reach a listener");
}

/// S6: PULL. A publishes ComID=1000 with cycle=0 (pull-only, never sent
/// by the scheduler); B's `Pr` triggers exactly one `Pp` reply within a
/// following `process` tick.
#[test]
fn s6_pull() {
    let registry = Registry::new();
    let a = open_on(&registry, 21150, 21151, 21152);
    let b = open_on(&registry, 21150, 21151, 21152);

    let pub_handle = a.publish(1000, loopback(), 0, 0, Duration::ZERO, RedundancyId::None, PubFlags::NONE, 0, 0, 0, b"pulled data").unwrap();
    let sub = b
        .subscribe(1000, loopback(), None, None, 0, 0, Duration::from_secs(3), TimeoutBehavior::SetToZero, 1432, SubFlags::NONE, 0, None)
        .unwrap();

    b.request(1000, 1000, 0, 0, loopback()).unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    let got = spin(deadline, || {
        a.process().unwrap();
        b.process().unwrap();
        matches!(b.get(sub), Ok(data) if data == b"pulled data")
    });
    assert!(got, "PULL reply never arrived");

    // the publication itself never auto-sends since its cycle is zero.
    assert_eq!(a.pub_sends(pub_handle).unwrap(), 1, "exactly the one PULL-triggered send");
}

//! Request/reply/confirm engine (`spec.md` §4.4): builds outgoing MD
//! frames, applies session-state transitions, and dispatches incoming
//! frames against the listener table and the session map.

use crate::arena::Arena;
use crate::constant::MsgType;
use crate::error::Error;
use crate::frame::{self, FrameHead, MdExt, Parsed};
use crate::md::listener::{find_listener, Listener, ListenerHandle};
use crate::md::session::{MdSession, MdState, Role, SessionId};
use crate::socket::SockIdx;
use log::{info, warn};
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// Delivered to a listener's or session's callback; mirrors the six
/// message-type roles of §4.4.
#[derive(Debug, Clone)]
pub enum MdEvent {
    Request { session_id: SessionId, source_uri: [u8; 32], data: Vec<u8> },
    Notification { com_id: u32, source_uri: [u8; 32], data: Vec<u8> },
    Reply { session_id: SessionId, num_replies: u32, source_uri: [u8; 32], data: Vec<u8> },
    ReplyQuery { session_id: SessionId, data: Vec<u8> },
    Confirm { session_id: SessionId },
    ReplyError { session_id: SessionId, result_code: u32 },
    ReplyTimeout { session_id: SessionId },
    ConfirmTimeout { session_id: SessionId },
    AppTimeout { session_id: SessionId },
}

#[allow(clippy::too_many_arguments)]
pub fn build_request(
    id: SessionId,
    com_id: u32,
    etb_topo_cnt: u32,
    op_trn_topo_cnt: u32,
    peer_ip: IpAddr,
    reply_timeout: Duration,
    no_of_repliers: u32,
    num_retries_max: u32,
    source_uri: [u8; 32],
    dest_uri: [u8; 32],
    socket_idx: SockIdx,
    use_tcp: bool,
    data: &[u8],
    now: Instant,
) -> (MdSession, Vec<u8>) {
    let head = FrameHead::init(MsgType::Mr, com_id, etb_topo_cnt, op_trn_topo_cnt, data.len() as u32, 0, 0);
    let ext = MdExt {
        reply_status: 0,
        session_id: id.0,
        reply_timeout: reply_timeout.as_micros() as u32,
        source_uri,
        dest_uri,
    };
    let mut buf = frame::build_md(&head, &ext, data);
    frame::finalize_md(&mut buf, 1);

    let session = MdSession {
        id,
        role: Role::Requester,
        com_id,
        peer_ip,
        state: MdState::ReqSent,
        num_replies: 0,
        no_of_repliers,
        num_retries: 0,
        num_retries_max,
        reply_timeout,
        reply_deadline: now + reply_timeout,
        confirm_deadline: now,
        listener: None,
        socket_idx,
        use_tcp,
        source_uri,
        dest_uri,
        last_sent_buf: buf.clone(),
    };
    (session, buf)
}

/// `Mn` notification: no session state created, sessionId must be all
/// zero on the wire (§4.4 "Notification sessionId invariant").
pub fn build_notify(
    com_id: u32,
    etb_topo_cnt: u32,
    op_trn_topo_cnt: u32,
    source_uri: [u8; 32],
    dest_uri: [u8; 32],
    data: &[u8],
) -> Vec<u8> {
    let head = FrameHead::init(MsgType::Mn, com_id, etb_topo_cnt, op_trn_topo_cnt, data.len() as u32, 0, 0);
    let ext = MdExt { reply_status: 0, session_id: SessionId::ZERO.0, reply_timeout: 0, source_uri, dest_uri };
    let mut buf = frame::build_md(&head, &ext, data);
    frame::finalize_md(&mut buf, 1);
    buf
}

/// `reply()`: `Mp`, no confirmation required. `ReqRcvd -> Done`.
pub fn build_reply(session: &mut MdSession, data: &[u8]) -> Result<Vec<u8>, Error> {
    let head = FrameHead::init(MsgType::Mp, session.com_id, 0, 0, data.len() as u32, 0, 0);
    let ext = MdExt {
        reply_status: 0,
        session_id: session.id.0,
        reply_timeout: 0,
        source_uri: session.dest_uri,
        dest_uri: session.source_uri,
    };
    let mut buf = frame::build_md(&head, &ext, data);
    frame::finalize_md(&mut buf, 1);
    session.transition(MdState::Done)?;
    Ok(buf)
}

/// `replyQuery()`: `Mq`, requester must `confirm()`. `ReqRcvd ->
/// ConfirmAwait`.
pub fn build_reply_query(session: &mut MdSession, data: &[u8], confirm_timeout: Duration, now: Instant) -> Result<Vec<u8>, Error> {
    let head = FrameHead::init(MsgType::Mq, session.com_id, 0, 0, data.len() as u32, 0, 0);
    let ext = MdExt {
        reply_status: 0,
        session_id: session.id.0,
        reply_timeout: confirm_timeout.as_micros() as u32,
        source_uri: session.dest_uri,
        dest_uri: session.source_uri,
    };
    let mut buf = frame::build_md(&head, &ext, data);
    frame::finalize_md(&mut buf, 1);
    session.transition(MdState::ConfirmAwait)?;
    session.confirm_deadline = now + confirm_timeout;
    Ok(buf)
}

/// `replyErr()`: `Me`, same state transition as a plain reply (the table
/// treats both as terminating the responder's side of the exchange).
pub fn build_reply_err(session: &mut MdSession, result_code: u32) -> Result<Vec<u8>, Error> {
    let head = FrameHead::init(MsgType::Me, session.com_id, 0, 0, 0, 0, 0);
    let ext = MdExt {
        reply_status: result_code,
        session_id: session.id.0,
        reply_timeout: 0,
        source_uri: session.dest_uri,
        dest_uri: session.source_uri,
    };
    let mut buf = frame::build_md(&head, &ext, &[]);
    frame::finalize_md(&mut buf, 1);
    session.transition(MdState::Done)?;
    Ok(buf)
}

/// `confirm()`: `Mc`. `ConfirmSendable -> Done`.
pub fn build_confirm(session: &mut MdSession) -> Result<Vec<u8>, Error> {
    let head = FrameHead::init(MsgType::Mc, session.com_id, 0, 0, 0, 0, 0);
    let ext = MdExt {
        reply_status: 0,
        session_id: session.id.0,
        reply_timeout: 0,
        source_uri: session.source_uri,
        dest_uri: session.dest_uri,
    };
    let mut buf = frame::build_md(&head, &ext, &[]);
    frame::finalize_md(&mut buf, 1);
    session.transition(MdState::Done)?;
    Ok(buf)
}

/// `abortSession()`: forced termination regardless of state, bypassing
/// the normal reply/confirm flow.
pub fn abort_session(sessions: &mut HashMap<SessionId, MdSession>, id: SessionId) -> Result<(), Error> {
    let session = sessions.get_mut(&id).ok_or(Error::NoSession)?;
    if session.is_terminal() {
        return Err(Error::SessionAbort);
    }
    session.transition(MdState::Aborted)
}

/// Result of dispatching one received, codec-validated MD frame.
pub enum Dispatched {
    Event(MdEvent),
    Dropped { reason: &'static str },
}

/// Routes an incoming MD frame: `Mr`/`Mn` go through the listener table;
/// `Mp`/`Mq`/`Mc`/`Me` are matched against an existing session by its
/// sessionId.
pub fn handle_incoming(
    parsed: &Parsed,
    src_ip: IpAddr,
    dst_ip: IpAddr,
    listeners: &Arena<Listener>,
    sessions: &mut HashMap<SessionId, MdSession>,
) -> Dispatched {
    let (head, ext) = match parsed {
        Parsed::Md { head, ext, .. } => (head, ext),
        Parsed::Pd { .. } => return Dispatched::Dropped { reason: "not_md" },
    };
    let msg_type = head.msg_type;
    let data = parsed.payload().to_vec();

    if msg_type == MsgType::Mn as u16 {
        if !SessionId(ext.session_id).is_zero() {
            warn!("comId={} Mn carried a nonzero sessionId, protocol error", head.com_id);
            return Dispatched::Dropped { reason: "notify_session_id" };
        }
        return match find_listener(listeners, head.com_id, head.etb_topo_cnt, dst_ip, &ext.dest_uri) {
            Some(_) => Dispatched::Event(MdEvent::Notification { com_id: head.com_id, source_uri: ext.source_uri, data }),
            None => Dispatched::Dropped { reason: "no_listener" },
        };
    }

    if msg_type == MsgType::Mr as u16 {
        return match find_listener(listeners, head.com_id, head.etb_topo_cnt, dst_ip, &ext.dest_uri) {
            Some(_) => Dispatched::Event(MdEvent::Request {
                session_id: SessionId(ext.session_id),
                source_uri: ext.source_uri,
                data,
            }),
            None => Dispatched::Dropped { reason: "no_listener" },
        };
    }

    let id = SessionId(ext.session_id);
    let session = match sessions.get_mut(&id) {
        Some(s) => s,
        None => return Dispatched::Dropped { reason: "no_session" },
    };
    // A unicast request's peer_ip is the sole responder and must match the
    // reply's source. A multicast/solicited request's peer_ip is the group
    // address itself, never a valid reply source — replies there arrive
    // from each individual replier's own unicast address, so sessionId
    // (already matched above) is the only reliable key and the equality
    // filter is skipped.
    let peer_is_multicast = match session.peer_ip {
        IpAddr::V4(v4) => v4.is_multicast(),
        IpAddr::V6(v6) => v6.is_multicast(),
    };
    if !peer_is_multicast && session.peer_ip != src_ip {
        return Dispatched::Dropped { reason: "peer_mismatch" };
    }

    if msg_type == MsgType::Mp as u16 {
        session.num_replies += 1;
        let done = session.reply_satisfied();
        if done {
            let _ = session.transition(MdState::Done);
        }
        info!("session {:?} received Mp ({} replies)", id, session.num_replies);
        Dispatched::Event(MdEvent::Reply { session_id: id, num_replies: session.num_replies, source_uri: ext.source_uri, data })
    } else if msg_type == MsgType::Mq as u16 {
        session.num_replies += 1;
        if session.transition(MdState::ConfirmSendable).is_err() {
            return Dispatched::Dropped { reason: "illegal_transition" };
        }
        Dispatched::Event(MdEvent::ReplyQuery { session_id: id, data })
    } else if msg_type == MsgType::Mc as u16 {
        if session.transition(MdState::Done).is_err() {
            return Dispatched::Dropped { reason: "illegal_transition" };
        }
        Dispatched::Event(MdEvent::Confirm { session_id: id })
    } else if msg_type == MsgType::Me as u16 {
        let _ = session.transition(MdState::Err);
        Dispatched::Event(MdEvent::ReplyError { session_id: id, result_code: ext.reply_status })
    } else {
        Dispatched::Dropped { reason: "unexpected_msg_type" }
    }
}

/// §4.4 "Retries": sessions whose reply deadline elapsed without any
/// matching reply are re-sent (caller rebuilds the frame) until
/// `numRetriesMax`, then terminate with `ReplyTimeout`. Sessions needing a
/// retransmit this tick are returned alongside the frame to send (the last
/// one built, replayed verbatim — retries do not bump the sequence counter
/// on an MD frame, only PD does that).
///
/// Each event carries the session's `listener` handle, if it had one —
/// the session is removed from the table right here, so a timeout on a
/// responder-role session (no entry in the caller's requester-keyed
/// callback map) would otherwise be unroutable by the time the caller
/// gets to dispatch it.
pub fn due_retries_or_timeouts(
    sessions: &mut HashMap<SessionId, MdSession>,
    now: Instant,
) -> (Vec<(MdEvent, Option<ListenerHandle>)>, Vec<(SessionId, Vec<u8>)>) {
    let mut events = Vec::new();
    let mut retries = Vec::new();
    sessions.retain(|id, s| {
        if s.is_terminal() {
            return false;
        }
        match s.state {
            MdState::ReqSent if s.reply_deadline <= now => {
                if s.num_replies > 0 && s.reply_satisfied() {
                    return true; // handled by handle_incoming already
                }
                if s.num_retries < s.num_retries_max {
                    s.num_retries += 1;
                    s.reply_deadline = now + s.reply_timeout;
                    retries.push((*id, s.last_sent_buf.clone()));
                    true
                } else {
                    let _ = s.transition(MdState::ReplyTimeout);
                    events.push((MdEvent::ReplyTimeout { session_id: *id }, s.listener));
                    false
                }
            }
            MdState::ReqRcvd if s.reply_deadline <= now => {
                // responder never called reply()/replyQuery() in time.
                let _ = s.transition(MdState::AppTimeout);
                events.push((MdEvent::AppTimeout { session_id: *id }, s.listener));
                false
            }
            MdState::ConfirmAwait if s.confirm_deadline <= now => {
                let _ = s.transition(MdState::ConfirmTimeout);
                events.push((MdEvent::ConfirmTimeout { session_id: *id }, s.listener));
                false
            }
            _ => true,
        }
    });
    (events, retries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::md::session::SessionId;
    use std::net::Ipv4Addr;

    fn ip(n: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, n))
    }

    #[test]
    fn request_then_reply_round_trip() {
        let (mut session, req_buf) = build_request(
            SessionId::from_counter(1, 1), 2002, 0, 0, ip(2), Duration::from_secs(5), 1, 0,
            *b"12345678901234567890123456789012", [0u8; 32], SockIdx(0), false, b"hi", Instant::now(),
        );
        let parsed = frame::check(&req_buf).unwrap();
        assert!(matches!(parsed, Parsed::Md { .. }));

        let reply_buf = build_reply(&mut session, b"Data transmission succeded").unwrap();
        assert_eq!(session.state, MdState::Done);
        let parsed_reply = frame::check(&reply_buf).unwrap();
        if let Parsed::Md { head, .. } = parsed_reply {
            assert_eq!(head.msg_type, MsgType::Mp as u16);
        } else {
            panic!("expected md");
        }
    }

    #[test]
    fn notify_has_zero_session_id() {
        let buf = build_notify(4001, 0, 0, [0u8; 32], [0u8; 32], b"");
        if let Parsed::Md { ext, .. } = frame::check(&buf).unwrap() {
            assert!(SessionId(ext.session_id).is_zero());
        } else {
            panic!("expected md");
        }
    }

    #[test]
    fn reply_query_then_confirm() {
        let (mut session, _) = build_request(
            SessionId::from_counter(1, 2), 7001, 0, 0, ip(2), Duration::from_secs(5), 1, 0,
            [0u8; 32], [0u8; 32], SockIdx(0), false, b"", Instant::now(),
        );
        session.role = Role::Responder;
        session.state = MdState::ReqRcvd;
        let q = build_reply_query(&mut session, b"q", Duration::from_secs(5), Instant::now()).unwrap();
        assert_eq!(session.state, MdState::ConfirmAwait);
        assert!(frame::check(&q).is_ok());
    }

    #[test]
    fn abort_from_req_sent_succeeds_but_not_twice() {
        let (session, _) = build_request(
            SessionId::from_counter(1, 3), 1, 0, 0, ip(2), Duration::from_secs(1), 1, 0,
            [0u8; 32], [0u8; 32], SockIdx(0), false, b"", Instant::now(),
        );
        let id = session.id;
        let mut sessions = HashMap::new();
        sessions.insert(id, session);
        abort_session(&mut sessions, id).unwrap();
        assert!(abort_session(&mut sessions, id).is_err());
    }

    #[test]
    fn retry_resends_last_frame_before_giving_up() {
        let (session, req_buf) = build_request(
            SessionId::from_counter(1, 5), 1, 0, 0, ip(2), Duration::from_millis(1), 1, 1,
            [0u8; 32], [0u8; 32], SockIdx(0), false, b"x", Instant::now(),
        );
        let id = session.id;
        let mut sessions = HashMap::new();
        sessions.insert(id, session);
        let later = Instant::now() + Duration::from_millis(5);
        let (events, retries) = due_retries_or_timeouts(&mut sessions, later);
        assert!(events.is_empty());
        assert_eq!(retries, vec![(id, req_buf)]);
        assert_eq!(sessions.get(&id).unwrap().num_retries, 1);
    }

    #[test]
    fn app_timeout_fires_when_responder_never_replies() {
        let (mut session, _) = build_request(
            SessionId::from_counter(1, 6), 1, 0, 0, ip(2), Duration::from_millis(1), 1, 0,
            [0u8; 32], [0u8; 32], SockIdx(0), false, b"", Instant::now(),
        );
        session.role = Role::Responder;
        session.state = MdState::ReqRcvd;
        let id = session.id;
        let mut sessions = HashMap::new();
        sessions.insert(id, session);
        let later = Instant::now() + Duration::from_millis(5);
        let (events, retries) = due_retries_or_timeouts(&mut sessions, later);
        assert!(matches!(events.as_slice(), [(MdEvent::AppTimeout { .. }, _)]));
        assert!(retries.is_empty());
        assert!(sessions.is_empty());
    }

    #[test]
    fn reply_timeout_fires_when_retries_exhausted() {
        let (session, _) = build_request(
            SessionId::from_counter(1, 4), 1, 0, 0, ip(2), Duration::from_millis(1), 1, 0,
            [0u8; 32], [0u8; 32], SockIdx(0), false, b"", Instant::now(),
        );
        let id = session.id;
        let mut sessions = HashMap::new();
        sessions.insert(id, session);
        let later = Instant::now() + Duration::from_millis(5);
        let (events, retries) = due_retries_or_timeouts(&mut sessions, later);
        assert!(matches!(events.as_slice(), [(MdEvent::ReplyTimeout { .. }, _)]));
        assert!(retries.is_empty());
        assert!(sessions.is_empty());
    }

    /// §4.4 "Repliers count": a multicast-style request's `peer_ip` is the
    /// group address, never a reply's own source — `numReplies` must
    /// still advance for `Mp`s arriving from each replier's distinct
    /// unicast IP (spec.md §8 S3).
    #[test]
    fn multicast_session_accepts_replies_from_distinct_source_ips() {
        let (session, _) = build_request(
            SessionId::from_counter(1, 7), 5003, 0, 0, IpAddr::V4(Ipv4Addr::new(239, 0, 1, 1)), Duration::from_secs(2), 2, 0,
            [0u8; 32], [0u8; 32], SockIdx(0), false, b"ping", Instant::now(),
        );
        let id = session.id;
        let mut sessions = HashMap::new();
        sessions.insert(id, session);
        let listeners: Arena<Listener> = Arena::new();

        let make_reply = || {
            let head = FrameHead::init(MsgType::Mp, 5003, 0, 0, 0, 0, 0);
            let ext = MdExt { reply_status: 0, session_id: id.0, reply_timeout: 0, source_uri: [0u8; 32], dest_uri: [0u8; 32] };
            let mut buf = frame::build_md(&head, &ext, &[]);
            frame::finalize_md(&mut buf, 1);
            frame::check(&buf).unwrap()
        };

        let from_b = ip(2);
        let dispatched = handle_incoming(&make_reply(), from_b, ip(1), &listeners, &mut sessions);
        assert!(matches!(dispatched, Dispatched::Event(MdEvent::Reply { num_replies: 1, .. })));

        let from_c = ip(3);
        let dispatched = handle_incoming(&make_reply(), from_c, ip(1), &listeners, &mut sessions);
        assert!(matches!(dispatched, Dispatched::Event(MdEvent::Reply { num_replies: 2, .. })));
    }

    /// Companion to the multicast case above: a unicast request's
    /// `peer_ip` is still enforced, so a reply from any other source is
    /// rejected even with a matching sessionId.
    #[test]
    fn unicast_session_rejects_reply_from_wrong_peer() {
        let (session, _) = build_request(
            SessionId::from_counter(1, 8), 1, 0, 0, ip(2), Duration::from_secs(2), 1, 0,
            [0u8; 32], [0u8; 32], SockIdx(0), false, b"x", Instant::now(),
        );
        let id = session.id;
        let mut sessions = HashMap::new();
        sessions.insert(id, session);
        let listeners: Arena<Listener> = Arena::new();

        let head = FrameHead::init(MsgType::Mp, 1, 0, 0, 0, 0, 0);
        let ext = MdExt { reply_status: 0, session_id: id.0, reply_timeout: 0, source_uri: [0u8; 32], dest_uri: [0u8; 32] };
        let mut buf = frame::build_md(&head, &ext, &[]);
        frame::finalize_md(&mut buf, 1);
        let parsed = frame::check(&buf).unwrap();

        let wrong_src = ip(99);
        let dispatched = handle_incoming(&parsed, wrong_src, ip(1), &listeners, &mut sessions);
        assert!(matches!(dispatched, Dispatched::Dropped { reason: "peer_mismatch" }));
    }
}

//! Reception and dispatch (`spec.md` §4.3.5) and timeout supervision
//! (§4.3.6): turn a validated [`crate::frame::Parsed`] frame into queue
//! mutations, without touching a socket directly.

use crate::arena::Arena;
use crate::constant::MsgType;
use crate::frame::Parsed;
use crate::pd::publication::Publication;
use crate::pd::subscription::{CallbackInfo, Subscription};
use log::{debug, trace, warn};
use std::net::IpAddr;
use std::time::Instant;

/// Outcome of dispatching one received frame, for the caller (`Session`)
/// to act on (deliver a callback, send a PULL reply, bump a counter).
pub enum Outcome {
    /// subscription `sub_idx` accepted new data; `deliver_callback` is
    /// `true` when the payload changed or `FORCE_CALLBACK` is set.
    Delivered { sub_idx: usize, info: CallbackInfo, deliver_callback: bool },
    /// a `Pr` PULL request matched publication `pub_idx`; caller should
    /// mark it for immediate send, addressed to `reply_to`.
    PullRequested { pub_idx: usize, reply_to: IpAddr },
    /// dropped: topocount mismatch, no matching subscription, or a stale
    /// duplicate. `reason` is a one-word tag for the statistics counter
    /// the caller should bump.
    Dropped { reason: &'static str },
}

/// Step 1 of §4.3.5: both topocounts must be zero on the wire or exactly
/// equal the session's own.
pub fn topo_ok(frame_etb: u32, frame_op: u32, session_etb: u32, session_op: u32) -> bool {
    (frame_etb == 0 || frame_etb == session_etb) && (frame_op == 0 || frame_op == session_op)
}

fn find_matching_sub(
    subs: &Arena<Subscription>,
    com_id: u32,
    src_ip: IpAddr,
    dst_ip: IpAddr,
) -> Option<usize> {
    subs.iter()
        .find(|(_, s)| {
            s.key.com_id == com_id && s.key.accepts_source(src_ip) && s.key.dst_ip == dst_ip
        })
        .map(|(i, _)| i)
}

fn find_matching_pub_for_pull(pubs: &Arena<Publication>, reply_com_id: u32) -> Option<usize> {
    pubs.iter().find(|(_, p)| p.key.com_id == reply_com_id).map(|(i, _)| i)
}

/// Dispatch one received, codec-validated frame (not itself parsing bytes
/// — `frame::check` has already run). `src_ip`/`dst_ip` are the
/// socket-reported addressing of the datagram (PD frames don't carry a
/// destination field on the wire; the caller knows it from the socket the
/// datagram arrived on).
///
/// §4.3.5 step 2: a `Pr` PULL request triggers an immediate reply (the
/// first element of the returned pair, present only for `Pr` frames) and
/// then "continues processing" through steps 3-7 the same as any other
/// frame — the second element is that regular subscription-match outcome.
pub fn dispatch(
    parsed: &Parsed,
    src_ip: IpAddr,
    dst_ip: IpAddr,
    subs: &mut Arena<Subscription>,
    pubs: &Arena<Publication>,
    session_etb: u32,
    session_op: u32,
    now: Instant,
) -> (Option<Outcome>, Outcome) {
    let head = parsed.head();
    if !topo_ok(head.etb_topo_cnt, head.op_trn_topo_cnt, session_etb, session_op) {
        warn!("comId={} topocount mismatch (etb={} op={})", head.com_id, head.etb_topo_cnt, head.op_trn_topo_cnt);
        return (None, Outcome::Dropped { reason: "topo" });
    }

    let pull_outcome = if head.msg_type == MsgType::Pr as u16 {
        let reply_to = if head.reply_ip != 0 { std::net::Ipv4Addr::from(head.reply_ip).into() } else { src_ip };
        Some(match find_matching_pub_for_pull(pubs, head.reply_com_id) {
            Some(pub_idx) => Outcome::PullRequested { pub_idx, reply_to },
            None => Outcome::Dropped { reason: "no_pub" },
        })
    } else {
        None
    };

    let sub_idx = match find_matching_sub(subs, head.com_id, src_ip, dst_ip) {
        Some(i) => i,
        None => {
            trace!("no subscription for comId={}", head.com_id);
            return (pull_outcome, Outcome::Dropped { reason: "no_sub" });
        }
    };

    let sub = subs.get_mut(sub_idx).expect("index just found");
    if !sub.check_sequence(src_ip, head.sequence_counter) {
        return (pull_outcome, Outcome::Dropped { reason: "duplicate" });
    }

    let payload = parsed.payload().to_vec();
    let prev = sub.get().ok().map(|b| b.to_vec());
    let _old_buf = sub.accept(payload, now);
    debug!("comId={} accepted from {}", head.com_id, src_ip);

    let changed = prev.as_deref() != sub.get().ok();
    let force = sub.flags.contains(crate::pd::subscription::SubFlags::FORCE_CALLBACK);
    (pull_outcome, Outcome::Delivered { sub_idx, info: CallbackInfo::Ok, deliver_callback: changed || force })
}

/// §4.3.6: scan the receive queue for subscriptions whose `timeToGo` has
/// elapsed; returns the indices that just transitioned into timeout so
/// the caller can invoke callbacks (skipping the statistics-request
/// subscription, which is exempt from user notification).
pub fn timed_out_subscriptions(subs: &mut Arena<Subscription>, now: Instant) -> Vec<usize> {
    let mut out = Vec::new();
    for (idx, s) in subs.iter_mut() {
        if s.is_due_for_timeout(now) {
            s.mark_timed_out();
            if s.key.com_id != crate::constant::TRDP_STATISTICS_REQUEST_COMID {
                out.push(idx);
            }
        }
    }
    out
}

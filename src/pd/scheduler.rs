//! Cyclic send scheduler (`spec.md` §4.3.3) and send-time distribution
//! (§4.3.4). Operates over the publication arena a `Session` owns; knows
//! nothing about sockets, only which elements are due and what bytes to
//! hand the caller for each.

use crate::arena::Arena;
use crate::pd::publication::{PubFlags, Publication, RedundancyId};
use std::time::{Duration, Instant};

/// One publication ready to go out this tick, with the exact bytes to
/// send and whether it should carry a PULL-reply `msgType`.
pub struct DueSend {
    pub pub_idx: usize,
    pub socket_idx: crate::socket::SockIdx,
    pub as_pull_reply: bool,
}

/// `process` tick over the send queue: advances due cyclic elements and
/// collects forced (`REQ_2B_SENT`) elements. A redundancy-group member
/// still runs its timer every tick but only transmits while `is_leader`
/// says this session currently owns that group (§4.3.1).
pub fn due_sends(pubs: &mut Arena<Publication>, now: Instant, is_leader: impl Fn(u32) -> bool) -> Vec<DueSend> {
    let mut out = Vec::new();
    for (idx, p) in pubs.iter_mut() {
        let forced = p.consume_request_flag();
        if forced {
            // every publication is built as msgType Pd; a forced send is
            // always a PULL (or statistics) reply, so it goes out as Pp.
            out.push(DueSend { pub_idx: idx, socket_idx: p.socket_idx, as_pull_reply: true });
            continue;
        }
        if p.due(now) {
            p.advance(now);
            let suppressed = match p.redundancy {
                RedundancyId::Group(g) => !is_leader(g),
                RedundancyId::None => false,
            };
            if !suppressed {
                out.push(DueSend { pub_idx: idx, socket_idx: p.socket_idx, as_pull_reply: false });
            }
        }
    }
    out
}

/// Minimum wait until the next publication falls due, for `next_deadline`.
pub fn next_due_in(pubs: &Arena<Publication>, now: Instant) -> Option<Duration> {
    pubs.iter()
        .filter(|(_, p)| !p.is_pull_only())
        .map(|(_, p)| p.next_time_to_go.saturating_duration_since(now))
        .min()
}

/// §4.3.4: stagger cyclic publications across the smallest interval
/// present, skipping PULL-only elements. `t0` is the epoch the stagger is
/// computed from (typically "now").
pub fn stagger_send_times(pubs: &mut Arena<Publication>, t0: Instant) {
    let min_interval = pubs
        .iter()
        .filter(|(_, p)| !p.is_pull_only())
        .map(|(_, p)| p.interval)
        .min();
    let Some(min_interval) = min_interval else { return };
    let count = pubs.iter().filter(|(_, p)| !p.is_pull_only()).count() as u32;
    if count == 0 {
        return;
    }
    let delta = min_interval / count.max(1);
    let mut k = 0u32;
    for (_, p) in pubs.iter_mut() {
        if p.is_pull_only() {
            continue;
        }
        p.stagger(t0, k, delta);
        k += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pd::publication::{PubKey, RedundancyId};
    use crate::socket::SockIdx;
    use std::net::{IpAddr, Ipv4Addr};

    fn key(com_id: u32) -> PubKey {
        PubKey {
            com_id,
            src_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            dst_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 200)),
            etb_topo_cnt: 0,
            op_trn_topo_cnt: 0,
        }
    }

    #[test]
    fn due_send_triggers_after_interval_elapses() {
        let mut pubs = Arena::new();
        let now = Instant::now();
        pubs.insert(Publication::new(
            key(1), Duration::from_millis(1), RedundancyId::None, PubFlags::NONE,
            SockIdx(0), 0, 0, 0, b"x", now,
        ));
        assert!(due_sends(&mut pubs, now, |_| true).is_empty());
        let later = now + Duration::from_millis(2);
        assert_eq!(due_sends(&mut pubs, later, |_| true).len(), 1);
    }

    #[test]
    fn redundant_follower_is_skipped_but_timer_still_advances() {
        let mut pubs = Arena::new();
        let now = Instant::now();
        let idx = pubs.insert(Publication::new(
            key(1), Duration::from_millis(1), RedundancyId::Group(1), PubFlags::REDUNDANT,
            SockIdx(0), 0, 0, 0, b"x", now,
        ));
        let later = now + Duration::from_millis(2);
        assert!(due_sends(&mut pubs, later, |_| false).is_empty());
        assert!(pubs.get(idx).unwrap().next_time_to_go > now);
    }

    #[test]
    fn redundant_leader_still_sends() {
        let mut pubs = Arena::new();
        let now = Instant::now();
        pubs.insert(Publication::new(
            key(1), Duration::from_millis(1), RedundancyId::Group(1), PubFlags::REDUNDANT,
            SockIdx(0), 0, 0, 0, b"x", now,
        ));
        let later = now + Duration::from_millis(2);
        assert_eq!(due_sends(&mut pubs, later, |g| g == 1).len(), 1);
    }

    #[test]
    fn pull_only_publication_never_auto_sends() {
        let mut pubs = Arena::new();
        let now = Instant::now();
        pubs.insert(Publication::new(
            key(1), Duration::ZERO, RedundancyId::None, PubFlags::NONE,
            SockIdx(0), 0, 0, 0, b"x", now,
        ));
        let later = now + Duration::from_secs(10);
        assert!(due_sends(&mut pubs, later, |_| true).is_empty());
    }

    #[test]
    fn forced_send_fires_once() {
        let mut pubs = Arena::new();
        let now = Instant::now();
        let idx = pubs.insert(Publication::new(
            key(1), Duration::ZERO, RedundancyId::None, PubFlags::NONE,
            SockIdx(0), 0, 0, 0, b"x", now,
        ));
        pubs.get_mut(idx).unwrap().request_immediate_send();
        let due = due_sends(&mut pubs, now, |_| true);
        assert_eq!(due.len(), 1);
        assert!(due_sends(&mut pubs, now, |_| true).is_empty());
    }
}

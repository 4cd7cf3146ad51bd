//! Send-queue entry (`spec.md` §3 "Publication element") and the
//! `publish`/`put`/`unpublish` operations (§4.3.1).

use crate::frame::{self, FrameHead};
use crate::constant::MsgType;
use std::net::IpAddr;
use std::time::{Duration, Instant};

bitflags::bitflags! {
    /// Per-publication behavior bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PubFlags: u32 {
        const NONE = 0;
        /// run the marshall callback on `put` instead of a raw memcpy.
        const MARSHALL = 1 << 0;
        /// this element belongs to a redundancy group and may be suppressed.
        const REDUNDANT = 1 << 1;
        /// force-send once regardless of the cyclic schedule (PULL/stats reply).
        const REQ_2B_SENT = 1 << 2;
    }
}

/// Newtype index into `Session`'s publication arena; stable across
/// insert/remove of other publications (spec.md §9, "arena with indices").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PubHandle(pub usize);

/// Identity a publication is addressed by; doubles as the arena dedup key
/// (invariant 3: at most one publication per tuple per session).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PubKey {
    pub com_id: u32,
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub etb_topo_cnt: u32,
    pub op_trn_topo_cnt: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedundancyId {
    None,
    Group(u32),
}

pub struct Publication {
    pub key: PubKey,
    pub flags: PubFlags,
    pub redundancy: RedundancyId,
    /// zero means PULL-only: never sent by the scheduler, only on demand.
    pub interval: Duration,
    pub next_time_to_go: Instant,
    pub sequence_counter: u32,
    pub pull_sequence_counter: u32,
    pub socket_idx: crate::socket::SockIdx,
    pub pull_source_ip: Option<IpAddr>,
    pub reply_com_id: u32,
    pub reply_ip: u32,
    pub user_ref: usize,
    /// the prebuilt frame buffer (header + payload, CRC slot live).
    buf: Vec<u8>,
    data_len: usize,
    timed_out: bool,
    invalid_data: bool,
    sends: u32,
}

impl Publication {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        key: PubKey,
        interval: Duration,
        redundancy: RedundancyId,
        flags: PubFlags,
        socket_idx: crate::socket::SockIdx,
        reply_com_id: u32,
        reply_ip: u32,
        user_ref: usize,
        data: &[u8],
        now: Instant,
    ) -> Publication {
        let head = FrameHead::init(
            MsgType::Pd,
            key.com_id,
            key.etb_topo_cnt,
            key.op_trn_topo_cnt,
            data.len() as u32,
            reply_com_id,
            reply_ip,
        );
        let buf = frame::build_pd(&head, data);
        Publication {
            key,
            flags,
            redundancy,
            interval,
            next_time_to_go: now + interval,
            sequence_counter: 0,
            pull_sequence_counter: 0,
            socket_idx,
            pull_source_ip: None,
            reply_com_id,
            reply_ip,
            user_ref,
            buf,
            data_len: data.len(),
            timed_out: false,
            invalid_data: false,
            sends: 0,
        }
    }

    pub fn is_pull_only(&self) -> bool {
        self.interval.is_zero()
    }

    pub fn is_redundant(&self) -> bool {
        matches!(self.redundancy, RedundancyId::Group(_))
    }

    pub fn gross_size(&self) -> usize {
        self.buf.len()
    }

    pub fn data_len(&self) -> usize {
        self.data_len
    }

    pub fn sends(&self) -> u32 {
        self.sends
    }

    /// `put`: copies new payload bytes into the prebuilt frame buffer,
    /// clears the invalid-data flag. Rebuilds the buffer if the new data
    /// size differs (dataset length changed).
    pub fn put(&mut self, data: &[u8]) {
        if data.len() == self.data_len {
            let payload_off = frame::PD_HEADER_SIZE;
            self.buf[payload_off..payload_off + data.len()].copy_from_slice(data);
        } else {
            let head = FrameHead::init(
                MsgType::Pd,
                self.key.com_id,
                self.key.etb_topo_cnt,
                self.key.op_trn_topo_cnt,
                data.len() as u32,
                self.reply_com_id,
                self.reply_ip,
            );
            self.buf = frame::build_pd(&head, data);
            self.data_len = data.len();
        }
        self.invalid_data = false;
    }

    pub fn is_invalid(&self) -> bool {
        self.invalid_data
    }

    pub fn payload(&self) -> &[u8] {
        let off = frame::PD_HEADER_SIZE;
        &self.buf[off..off + self.data_len]
    }

    /// `prepare_for_send`: bump the right sequence counter, write it, and
    /// recompute the header CRC. `as_pull_reply` temporarily flips the
    /// wire `msgType` to `Pp`, as the scheduler does for a forced send of
    /// an otherwise-PD-typed element (§4.3.3).
    pub fn prepare_for_send(&mut self, as_pull_reply: bool) -> &[u8] {
        let seq = if as_pull_reply {
            self.pull_sequence_counter = self.pull_sequence_counter.wrapping_add(1);
            self.pull_sequence_counter
        } else {
            self.sequence_counter = self.sequence_counter.wrapping_add(1);
            self.sequence_counter
        };
        if as_pull_reply {
            crate::frame::write_msg_type(&mut self.buf, MsgType::Pp);
        } else {
            crate::frame::write_msg_type(&mut self.buf, MsgType::Pd);
        }
        frame::finalize_pd(&mut self.buf, seq);
        self.sends += 1;
        &self.buf
    }

    /// Seeds the sequence counter from a cross-session consult (§4.3.1:
    /// redundant senders emit coherent sequence numbers). `highest_seen -
    /// 1` because `prepare_for_send` increments before sending.
    pub fn seed_sequence_counter(&mut self, highest_seen: u32) {
        self.sequence_counter = highest_seen.wrapping_sub(1);
    }

    pub fn due(&self, now: Instant) -> bool {
        !self.is_pull_only() && self.next_time_to_go <= now
    }

    /// Advance `timeToGo` by exactly one interval; if more than one period
    /// has elapsed, catch up by a single step rather than queueing bursts
    /// (§4.3.3).
    pub fn advance(&mut self, now: Instant) {
        self.next_time_to_go += self.interval;
        if self.next_time_to_go <= now {
            self.next_time_to_go = now + self.interval;
        }
    }

    pub fn request_immediate_send(&mut self) {
        self.flags |= PubFlags::REQ_2B_SENT;
    }

    pub fn consume_request_flag(&mut self) -> bool {
        let set = self.flags.contains(PubFlags::REQ_2B_SENT);
        self.flags.remove(PubFlags::REQ_2B_SENT);
        set
    }

    /// distribution staggering (§4.3.4): `timeToGo = t0 + k*delta`,
    /// provided `2*k*delta <= interval`, else left unchanged.
    pub fn stagger(&mut self, t0: Instant, k: u32, delta: Duration) {
        if self.is_pull_only() {
            return;
        }
        if delta.saturating_mul(2 * k) <= self.interval {
            self.next_time_to_go = t0 + delta * k;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::SockIdx;
    use std::net::{IpAddr, Ipv4Addr};

    fn key() -> PubKey {
        PubKey {
            com_id: 1000,
            src_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            dst_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 200)),
            etb_topo_cnt: 0,
            op_trn_topo_cnt: 0,
        }
    }

    #[test]
    fn put_then_payload_round_trips() {
        let mut p = Publication::new(
            key(), Duration::from_millis(1), RedundancyId::None, PubFlags::NONE,
            SockIdx(0), 0, 0, 0, b"Hello World", Instant::now(),
        );
        assert_eq!(p.payload(), b"Hello World");
        p.put(b"Bye!");
        assert_eq!(p.payload(), b"Bye!");
        assert!(!p.is_invalid());
    }

    #[test]
    fn gross_size_matches_testable_property_4() {
        let p = Publication::new(
            key(), Duration::ZERO, RedundancyId::None, PubFlags::NONE,
            SockIdx(0), 0, 0, 0, b"Hello World", Instant::now(),
        );
        assert_eq!(p.gross_size(), crate::frame::pd_packet_size(11));
    }

    #[test]
    fn prepare_for_send_increments_distinct_counters() {
        let mut p = Publication::new(
            key(), Duration::from_millis(1), RedundancyId::None, PubFlags::NONE,
            SockIdx(0), 0, 0, 0, b"", Instant::now(),
        );
        p.prepare_for_send(false);
        p.prepare_for_send(false);
        assert_eq!(p.sequence_counter, 2);
        assert_eq!(p.pull_sequence_counter, 0);
        p.prepare_for_send(true);
        assert_eq!(p.pull_sequence_counter, 1);
        assert_eq!(p.sequence_counter, 2);
    }

    #[test]
    fn advance_catches_up_by_one_period_when_late() {
        let mut p = Publication::new(
            key(), Duration::from_millis(10), RedundancyId::None, PubFlags::NONE,
            SockIdx(0), 0, 0, 0, b"", Instant::now(),
        );
        let far_future = p.next_time_to_go + Duration::from_secs(10);
        p.advance(far_future);
        assert!(p.next_time_to_go > far_future);
        assert!(p.next_time_to_go <= far_future + Duration::from_millis(10));
    }

    /// §4.3.4: second-scale intervals used to truncate `Duration::as_nanos()`
    /// to `u32` and overflow computing `2*k*delta_ns`, panicking in a debug
    /// build. A 5 s interval is well past the ~4.29 s point that overflow
    /// used to bite at.
    #[test]
    fn stagger_does_not_panic_or_misbehave_on_second_scale_intervals() {
        let mut p = Publication::new(
            key(), Duration::from_secs(5), RedundancyId::None, PubFlags::NONE,
            SockIdx(0), 0, 0, 0, b"", Instant::now(),
        );
        let t0 = Instant::now();
        let before = p.next_time_to_go;
        p.stagger(t0, 3, Duration::from_secs(1));
        // 2*3*1s = 6s > 5s interval, so the guard leaves timeToGo unchanged.
        assert_eq!(p.next_time_to_go, before);

        p.stagger(t0, 1, Duration::from_secs(1));
        // 2*1*1s = 2s <= 5s interval, so this one is staggered.
        assert_eq!(p.next_time_to_go, t0 + Duration::from_secs(1));
    }
}

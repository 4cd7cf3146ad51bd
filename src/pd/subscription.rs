//! Receive-queue entry (`spec.md` §3 "Subscription element") and the
//! `subscribe`/`unsubscribe`/`get` operations (§4.3.2).

use crate::error::Error;
use std::net::IpAddr;
use std::time::{Duration, Instant};

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SubFlags: u32 {
        const NONE = 0;
        const MARSHALL = 1 << 0;
        /// deliver the callback even when the payload is bytewise identical
        /// to the previous one (resolves the Open Question around the
        /// source's tri-state `informUser`).
        const FORCE_CALLBACK = 1 << 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutBehavior {
    SetToZero,
    KeepLastValue,
}

/// Newtype index into `Session`'s subscription arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubHandle(pub usize);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubKey {
    pub com_id: u32,
    /// `None` = wildcard: accept from any source.
    pub src_ip1: Option<IpAddr>,
    pub src_ip2: Option<IpAddr>,
    pub dst_ip: IpAddr,
    pub etb_topo_cnt: u32,
    pub op_trn_topo_cnt: u32,
}

impl SubKey {
    pub fn accepts_source(&self, src: IpAddr) -> bool {
        match (self.src_ip1, self.src_ip2) {
            (None, None) => true,
            (Some(a), None) => a == src,
            (Some(a), Some(b)) => a == src || b == src,
            (None, Some(b)) => b == src,
        }
    }
}

pub struct Subscription {
    pub key: SubKey,
    pub flags: SubFlags,
    pub timeout: Duration,
    pub behavior: TimeoutBehavior,
    pub max_size: usize,
    pub user_ref: usize,
    pub callback: Option<Box<dyn FnMut(&Subscription, CallbackInfo, &[u8]) + Send>>,
    pub next_time_to_go: Instant,
    pub last_seq: Option<u32>,
    pub last_src_ip: Option<IpAddr>,
    pub data_valid: bool,
    pub timed_out: bool,
    pub mc_joined: Option<IpAddr>,
    pub socket_idx: crate::socket::SockIdx,

    buf: Vec<u8>,
    rx_count: u32,
    missed_count: u32,
    timeout_count: u32,
    last_error: Option<Error>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackInfo {
    Ok,
    Timeout,
}

impl Subscription {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        key: SubKey,
        flags: SubFlags,
        timeout: Duration,
        behavior: TimeoutBehavior,
        max_size: usize,
        user_ref: usize,
        callback: Option<Box<dyn FnMut(&Subscription, CallbackInfo, &[u8]) + Send>>,
        socket_idx: crate::socket::SockIdx,
        now: Instant,
    ) -> Subscription {
        Subscription {
            key,
            flags,
            timeout,
            behavior,
            max_size,
            user_ref,
            callback,
            next_time_to_go: now + timeout,
            last_seq: None,
            last_src_ip: None,
            data_valid: false,
            timed_out: false,
            mc_joined: None,
            socket_idx,
            buf: Vec::new(),
            rx_count: 0,
            missed_count: 0,
            timeout_count: 0,
            last_error: None,
        }
    }

    pub fn rx_count(&self) -> u32 {
        self.rx_count
    }

    pub fn missed_count(&self) -> u32 {
        self.missed_count
    }

    pub fn timeout_count(&self) -> u32 {
        self.timeout_count
    }

    /// `get`: `NoData` if never received, `Timeout` if the timed-out flag
    /// is set, otherwise the stored bytes.
    pub fn get(&self) -> Result<&[u8], Error> {
        if !self.data_valid && self.last_seq.is_none() {
            return Err(Error::NoData);
        }
        if self.timed_out {
            return Err(Error::Timeout);
        }
        Ok(&self.buf)
    }

    /// On timeout the stored buffer is either zeroed or left alone,
    /// depending on `behavior`.
    fn apply_timeout_behavior(&mut self) {
        if let TimeoutBehavior::SetToZero = self.behavior {
            for b in self.buf.iter_mut() {
                *b = 0;
            }
        }
    }

    /// §4.3.4 sequence-counter check, against this subscription's
    /// per-source last-seen value. Returns `true` if the frame should be
    /// accepted (not a stale duplicate).
    pub fn check_sequence(&mut self, src_ip: IpAddr, seq: u32) -> bool {
        if self.last_src_ip != Some(src_ip) {
            // a different source than last time: track fresh, always accept.
            self.last_seq = None;
        }
        if seq == 0 {
            // sender restart: reset tracking, accept unconditionally.
            self.last_seq = Some(0);
            self.last_src_ip = Some(src_ip);
            return true;
        }
        match self.last_seq {
            None => {
                self.last_seq = Some(seq);
                self.last_src_ip = Some(src_ip);
                true
            }
            Some(last) => {
                if seq > last {
                    let gap = seq - last - 1;
                    self.missed_count = self.missed_count.saturating_add(gap);
                    self.last_seq = Some(seq);
                    self.last_src_ip = Some(src_ip);
                    true
                } else if seq < last && (last - seq) > (u32::MAX / 2) {
                    // wrapped around
                    let gap = u32::MAX - last + seq;
                    self.missed_count = self.missed_count.saturating_add(gap);
                    self.last_seq = Some(seq);
                    self.last_src_ip = Some(src_ip);
                    true
                } else {
                    false // duplicate or stale
                }
            }
        }
    }

    /// Zero-copy accept: swap the scratch frame buffer in, refresh
    /// freshness bookkeeping, bump rx count (§4.3.5 steps 5-6).
    pub fn accept(&mut self, mut new_buf: Vec<u8>, now: Instant) -> Vec<u8> {
        std::mem::swap(&mut self.buf, &mut new_buf);
        self.next_time_to_go = now + self.timeout;
        self.timed_out = false;
        self.data_valid = true;
        self.rx_count += 1;
        new_buf // return the old scratch buffer for reuse
    }

    pub fn is_due_for_timeout(&self, now: Instant) -> bool {
        !self.timeout.is_zero() && !self.timed_out && self.next_time_to_go < now
    }

    pub fn mark_timed_out(&mut self) {
        self.timed_out = true;
        self.timeout_count += 1;
        self.apply_timeout_behavior();
    }

    pub fn set_last_error(&mut self, e: Error) {
        self.last_error = Some(e);
    }
}

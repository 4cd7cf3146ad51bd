//! The top-level handle (`spec.md` §5 "Session object"): owns the socket
//! pool, the PD/MD element tables and the statistics block, and exposes the
//! public `publish`/`subscribe`/`request`/`addListener`/`mdRequest`/...
//! operations plus the single `process()` tick that drives everything.
//!
//! Grounded on the teacher's `Client<T: Transport>` — one struct wrapping
//! the transport and exposing a small set of request methods — generalized
//! here to a `Session` wrapping a socket pool and several element arenas
//! behind one mutex, since TRDP serializes all engine state per session
//! rather than per call.

use crate::arena::Arena;
use crate::config::{MdConfig, MemConfig, PdConfig, ProcessConfig};
use crate::constant::{MsgType, TRDP_GLOBAL_STATISTICS_COMID, TRDP_STATISTICS_REQUEST_COMID};
use crate::error::Error;
use crate::frame::{self, Parsed};
use crate::marshall::{Marshall, NoopMarshall};
use crate::md::engine as md_engine;
use crate::md::listener as md_listener;
use crate::md::{Dispatched, Listener, ListenerHandle, MdEvent, MdSession, MdState, Role, SessionId};
use crate::memory::Memory;
use crate::pd::publication::{PubFlags, PubHandle, PubKey, Publication, RedundancyId};
use crate::pd::reception::{self, Outcome};
use crate::pd::scheduler;
use crate::pd::subscription::{CallbackInfo, SubFlags, SubHandle, SubKey, Subscription, TimeoutBehavior};
use crate::socket::{Pool, SendParams, SockIdx, Usage};
use crate::stats::{MdTransportStats, Statistics};
use log::warn;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

fn ipv4_u32(ip: IpAddr) -> Result<u32, Error> {
    match ip {
        IpAddr::V4(v4) => Ok(u32::from(v4)),
        IpAddr::V6(_) => Err(Error::Param("TRDP addressing is IPv4-only".into())),
    }
}

fn wall_clock_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Process-wide table of open sessions, consulted by a publisher joining a
/// redundancy group's sequence-counter stream (§4.3.1). Modeled as an
/// explicit value a caller constructs and shares, rather than an ambient
/// global, per the Design Note on global mutable state.
#[derive(Clone, Default)]
pub struct Registry(Arc<Mutex<Vec<Weak<Mutex<Inner>>>>>);

impl Registry {
    pub fn new() -> Registry {
        Registry::default()
    }

    fn register(&self, inner: &Arc<Mutex<Inner>>) {
        let mut list = self.0.lock().unwrap_or_else(|e| e.into_inner());
        list.retain(|w| w.upgrade().is_some());
        list.push(Arc::downgrade(inner));
    }

    /// Highest sequence counter any other live session has issued for
    /// `(com_id, src_ip)`. A session the caller can't momentarily lock is
    /// skipped rather than blocked on — this is a best-effort consult to
    /// keep a fresh redundant sender's counter coherent with its peers, not
    /// a strict invariant worth risking a cross-session deadlock over.
    fn highest_sequence(&self, exclude: &Arc<Mutex<Inner>>, com_id: u32, src_ip: IpAddr) -> Option<u32> {
        let mut list = self.0.lock().unwrap_or_else(|e| e.into_inner());
        list.retain(|w| w.upgrade().is_some());
        let mut max = None;
        for w in list.iter() {
            let Some(arc) = w.upgrade() else { continue };
            if Arc::ptr_eq(&arc, exclude) {
                continue;
            }
            let Ok(inner) = arc.try_lock() else { continue };
            for (_, p) in inner.pubs.iter() {
                if p.key.com_id == com_id && p.key.src_ip == src_ip {
                    max = Some(max.map_or(p.sequence_counter, |m: u32| m.max(p.sequence_counter)));
                }
            }
        }
        max
    }
}

struct Inner {
    registry: Registry,
    process_cfg: ProcessConfig,
    pd_cfg: PdConfig,
    md_cfg: MdConfig,
    own_ip: IpAddr,
    pool: Pool,
    memory: Memory,
    stats: Statistics,
    marshaller: Box<dyn Marshall>,
    pubs: Arena<Publication>,
    subs: Arena<Subscription>,
    listeners: Arena<Listener>,
    md_sessions: HashMap<SessionId, MdSession>,
    md_callbacks: HashMap<SessionId, Box<dyn FnMut(MdEvent) + Send>>,
    redundancy: HashMap<u32, bool>,
    session_salt: u64,
    session_counter: u64,
    pd_socket: SockIdx,
    md_udp_socket: SockIdx,
    md_listen_socket: SockIdx,
    stats_pub_idx: Option<PubHandle>,
    /// bucket index `Memory::alloc` returned for each publication's/
    /// subscription's held frame buffer, so it can be freed on removal.
    pub_mem_buckets: HashMap<usize, usize>,
    sub_mem_buckets: HashMap<usize, usize>,
    closed: bool,
}

impl Inner {
    fn send_pd(&self, idx: SockIdx, buf: &[u8], dst: SocketAddr) -> Result<(), Error> {
        let entry = self.pool.get(idx).ok_or_else(|| Error::Sock("pd socket missing".into()))?;
        entry.send_udp(buf, dst)?;
        Ok(())
    }

    fn send_md(&self, idx: SockIdx, buf: &[u8], dst: SocketAddr) -> Result<(), Error> {
        let entry = self.pool.get(idx).ok_or_else(|| Error::Sock("md socket missing".into()))?;
        if entry.udp().is_some() {
            entry.send_udp(buf, dst)?;
        } else {
            entry.send_md_tcp(buf)?;
        }
        Ok(())
    }

    fn md_port(&self, use_tcp: bool) -> u16 {
        if use_tcp {
            self.md_cfg.tcp_port
        } else {
            self.md_cfg.udp_port
        }
    }

    fn bump_md(&mut self, use_tcp: bool, f: impl FnOnce(&mut MdTransportStats)) {
        if use_tcp {
            f(&mut self.stats.md.tcp)
        } else {
            f(&mut self.stats.md.udp)
        }
    }

    fn bump_md_drop(&mut self, use_tcp: bool, reason: &'static str) {
        self.bump_md(use_tcp, |s| match reason {
            "no_listener" => s.no_listener += 1,
            _ => s.proto_err += 1,
        });
    }

    // -- PD reception --------------------------------------------------

    fn drain_pd(&mut self, now: Instant) {
        let sockets = self.pool.indices_with_usage(Usage::Pd);
        let mut buf = vec![0u8; frame::MAX_FRAME_SIZE];
        for sock_idx in sockets {
            loop {
                let recvd = match self.pool.get(sock_idx) {
                    Some(e) => e.try_recv_udp(&mut buf),
                    None => break,
                };
                let (n, src) = match recvd {
                    Ok(Some(v)) => v,
                    Ok(None) => break,
                    Err(e) => {
                        warn!("pd recv error: {}", e);
                        break;
                    }
                };
                self.handle_pd_datagram(&buf[..n], src.ip(), now);
            }
        }
    }

    /// Candidate local addresses a datagram arriving on the shared PD
    /// socket may have been addressed to: `std::net` doesn't surface the
    /// destination address of a received UDP datagram (that needs
    /// `IP_PKTINFO`), so every joined multicast group is tried in addition
    /// to `own_ip` until one resolves to something other than "no sub".
    fn pd_dst_candidates(&self) -> Vec<IpAddr> {
        let mut out = vec![self.own_ip];
        for (_, s) in self.subs.iter() {
            if let Some(mc) = s.mc_joined {
                if !out.contains(&mc) {
                    out.push(mc);
                }
            }
        }
        out
    }

    fn handle_pd_datagram(&mut self, raw: &[u8], src_ip: IpAddr, now: Instant) {
        let parsed = match frame::check(raw) {
            Ok(p) => p,
            Err(Error::Crc) => {
                self.stats.pd.crc_err += 1;
                return;
            }
            Err(_) => {
                self.stats.pd.proto_err += 1;
                return;
            }
        };
        if matches!(parsed, Parsed::Md { .. }) {
            return;
        }

        let candidates = self.pd_dst_candidates();
        let mut outcome = Outcome::Dropped { reason: "no_sub" };
        let mut pull_outcome = None;
        for dst in &candidates {
            let (pull, out) = reception::dispatch(
                &parsed,
                src_ip,
                *dst,
                &mut self.subs,
                &self.pubs,
                self.process_cfg.etb_topo_cnt,
                self.process_cfg.op_trn_topo_cnt,
                now,
            );
            if pull.is_some() {
                pull_outcome = pull;
            }
            outcome = out;
            if !matches!(outcome, Outcome::Dropped { reason: "no_sub" }) {
                break;
            }
        }
        if let Some(pull) = pull_outcome {
            self.apply_pd_outcome(pull);
        }
        self.apply_pd_outcome(outcome);
    }

    fn apply_pd_outcome(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Delivered { sub_idx, info, deliver_callback } => {
                self.stats.pd.rcv += 1;
                if deliver_callback {
                    deliver_pd_callback(&mut self.subs, sub_idx, info, self.marshaller.as_ref());
                }
            }
            Outcome::PullRequested { pub_idx, reply_to } => {
                if let Some(p) = self.pubs.get_mut(pub_idx) {
                    p.pull_source_ip = Some(reply_to);
                    p.request_immediate_send();
                }
            }
            Outcome::Dropped { reason } => match reason {
                "topo" => self.stats.pd.topo_err += 1,
                "no_sub" => self.stats.pd.no_subs += 1,
                "no_pub" => self.stats.pd.no_pubs += 1,
                _ => {}
            },
        }
    }

    /// Mirrors the slab allocator's live accounting (§5 "Memory is drawn
    /// from a preallocated slab") into the wire-schema `stats.mem` block.
    fn sync_memory_stats(&mut self) {
        self.stats.mem.total = self.memory.total_size() as u32;
        self.stats.mem.free = self.memory.free_size() as u32;
        self.stats.mem.min_free = self.memory.min_free_size() as u32;
        self.stats.mem.alloc_err = self.memory.alloc_errors();
        self.stats.mem.free_err = self.memory.free_errors();
        for (dst, src) in self.stats.mem.buckets.iter_mut().zip(self.memory.bucket_stats()) {
            dst.size = src.size as u32;
            dst.used = src.in_use as u32;
        }
    }

    fn refresh_stats_pub(&mut self) {
        let count = self.listeners.len() as u32;
        self.stats.md.udp.num_listeners = count;
        self.stats.md.tcp.num_listeners = count;
        self.sync_memory_stats();
        if let Some(handle) = self.stats_pub_idx {
            let encoded = self.stats.encode(wall_clock_secs());
            if let Some(p) = self.pubs.get_mut(handle.0) {
                p.put(&encoded);
            }
        }
    }

    fn send_due_pd(&mut self, now: Instant) {
        self.refresh_stats_pub();
        let redundancy = &self.redundancy;
        let dues = scheduler::due_sends(&mut self.pubs, now, |g| *redundancy.get(&g).unwrap_or(&false));
        for due in dues {
            let Some(p) = self.pubs.get_mut(due.pub_idx) else { continue };
            let dst_ip = if due.as_pull_reply {
                p.pull_source_ip.take().unwrap_or(p.key.dst_ip)
            } else {
                p.key.dst_ip
            };
            let buf = p.prepare_for_send(due.as_pull_reply).to_vec();
            let dst = SocketAddr::new(dst_ip, self.pd_cfg.port);
            match self.send_pd(due.socket_idx, &buf, dst) {
                Ok(()) => self.stats.pd.sends += 1,
                Err(e) => warn!("pd send error: {}", e),
            }
        }
    }

    fn sweep_pd_timeouts(&mut self, now: Instant) {
        let idxs = reception::timed_out_subscriptions(&mut self.subs, now);
        self.stats.pd.timeouts += idxs.len() as u32;
        for idx in idxs {
            deliver_pd_callback(&mut self.subs, idx, CallbackInfo::Timeout, self.marshaller.as_ref());
        }
    }

    // -- MD reception -----------------------------------------------------

    fn drain_md_udp(&mut self, now: Instant) {
        let sockets = self.pool.indices_with_usage(Usage::MdUdp);
        let mut buf = vec![0u8; frame::MAX_FRAME_SIZE];
        for sock_idx in sockets {
            loop {
                let recvd = match self.pool.get(sock_idx) {
                    Some(e) => e.try_recv_udp(&mut buf),
                    None => break,
                };
                let (n, src) = match recvd {
                    Ok(Some(v)) => v,
                    Ok(None) => break,
                    Err(e) => {
                        warn!("md udp recv error: {}", e);
                        break;
                    }
                };
                self.handle_md_datagram(&buf[..n], src.ip(), sock_idx, false, now);
            }
        }
    }

    fn drain_md_tcp_accepts(&mut self) {
        let listeners: Vec<SockIdx> = self
            .pool
            .indices_with_usage(Usage::MdTcp)
            .into_iter()
            .filter(|&idx| self.pool.get(idx).map(|e| e.is_listener()).unwrap_or(false))
            .collect();
        for idx in listeners {
            loop {
                let accepted = match self.pool.get(idx) {
                    Some(e) => e.try_accept(),
                    None => break,
                };
                match accepted {
                    Ok(Some((stream, peer))) => {
                        let local_bind = SocketAddr::new(self.own_ip, self.md_cfg.tcp_port);
                        self.pool.adopt_accepted(local_bind, stream, peer, self.md_cfg.tcp_idle_timeout);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("md tcp accept error: {}", e);
                        break;
                    }
                }
            }
        }
    }

    fn drain_md_tcp(&mut self, now: Instant) {
        let conns: Vec<SockIdx> = self
            .pool
            .indices_with_usage(Usage::MdTcp)
            .into_iter()
            .filter(|&idx| self.pool.get(idx).map(|e| !e.is_listener()).unwrap_or(false))
            .collect();
        for idx in conns {
            loop {
                let recvd = match self.pool.get(idx) {
                    Some(e) => e.try_recv_md_tcp(),
                    None => break,
                };
                match recvd {
                    Ok(Some(buf)) => {
                        let src_ip = self.pool.get(idx).and_then(|e| e.peer_ip()).unwrap_or(self.own_ip);
                        self.handle_md_datagram(&buf, src_ip, idx, true, now);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("md tcp recv error: {}", e);
                        break;
                    }
                }
            }
        }
    }

    fn handle_md_datagram(&mut self, raw: &[u8], src_ip: IpAddr, socket_idx: SockIdx, use_tcp: bool, now: Instant) {
        let parsed = match frame::check(raw) {
            Ok(p) => p,
            Err(Error::Crc) => {
                self.bump_md(use_tcp, |s| s.crc_err += 1);
                return;
            }
            Err(_) => {
                self.bump_md(use_tcp, |s| s.proto_err += 1);
                return;
            }
        };
        let Parsed::Md { head, ext, .. } = &parsed else {
            return;
        };
        if !reception::topo_ok(head.etb_topo_cnt, head.op_trn_topo_cnt, self.process_cfg.etb_topo_cnt, self.process_cfg.op_trn_topo_cnt) {
            self.bump_md(use_tcp, |s| s.topo_err += 1);
            return;
        }
        let com_id = head.com_id;
        let etb = head.etb_topo_cnt;
        let dest_uri = ext.dest_uri;

        let dispatched = md_engine::handle_incoming(&parsed, src_ip, self.own_ip, &self.listeners, &mut self.md_sessions);
        match dispatched {
            Dispatched::Event(MdEvent::Request { session_id, source_uri, data }) => {
                if !self.md_sessions.contains_key(&session_id) {
                    let reply_timeout = Duration::from_micros(ext.reply_timeout as u64);
                    self.md_sessions.insert(
                        session_id,
                        MdSession {
                            id: session_id,
                            role: Role::Responder,
                            com_id,
                            peer_ip: src_ip,
                            state: MdState::ReqRcvd,
                            num_replies: 0,
                            no_of_repliers: 0,
                            num_retries: 0,
                            num_retries_max: 0,
                            reply_timeout,
                            reply_deadline: now + reply_timeout,
                            confirm_deadline: now,
                            listener: md_listener::find_listener(&self.listeners, com_id, etb, self.own_ip, &dest_uri).map(ListenerHandle),
                            socket_idx,
                            use_tcp,
                            source_uri,
                            dest_uri,
                            last_sent_buf: Vec::new(),
                        },
                    );
                }
                self.bump_md(use_tcp, |s| s.rcv += 1);
                if let Some(lidx) = md_listener::find_listener(&self.listeners, com_id, etb, self.own_ip, &dest_uri) {
                    self.fire_listener_callback(lidx, MdEvent::Request { session_id, source_uri, data });
                }
            }
            Dispatched::Event(MdEvent::Notification { com_id: nid, source_uri, data }) => {
                self.bump_md(use_tcp, |s| s.rcv += 1);
                if let Some(lidx) = md_listener::find_listener(&self.listeners, nid, etb, self.own_ip, &dest_uri) {
                    self.fire_listener_callback(lidx, MdEvent::Notification { com_id: nid, source_uri, data });
                }
            }
            Dispatched::Event(ev) => {
                self.bump_md(use_tcp, |s| s.rcv += 1);
                self.route_session_event(ev, None);
            }
            Dispatched::Dropped { reason } => self.bump_md_drop(use_tcp, reason),
        }
    }

    fn fire_listener_callback(&mut self, lidx: usize, ev: MdEvent) {
        let Some(listener) = self.listeners.get_mut(lidx) else { return };
        let Some(mut cb) = listener.callback.take() else { return };
        cb(listener, ev);
        if let Some(l) = self.listeners.get_mut(lidx) {
            l.callback = Some(cb);
        }
    }

    /// Delivers an MD session-lifecycle event (everything past the initial
    /// `Mr`/`Mn`, which go through `fire_listener_callback` directly). A
    /// requester-role session is reached through the callback `mdRequest`
    /// registered; a responder-role session has no such entry, so it is
    /// routed to the listener that accepted its `Mr` instead — `reply()`/
    /// `replyQuery()` never take a callback of their own, the listener that
    /// started the exchange stays the responder's hook for the rest of it.
    /// `listener_hint` carries that handle for events raised after the
    /// owning session has already been dropped from the table (timeouts);
    /// for events dispatched while the session is still live it is looked
    /// up from there instead.
    fn route_session_event(&mut self, ev: MdEvent, listener_hint: Option<ListenerHandle>) {
        let id = match &ev {
            MdEvent::Reply { session_id, .. }
            | MdEvent::ReplyQuery { session_id, .. }
            | MdEvent::Confirm { session_id }
            | MdEvent::ReplyError { session_id, .. }
            | MdEvent::ReplyTimeout { session_id }
            | MdEvent::ConfirmTimeout { session_id }
            | MdEvent::AppTimeout { session_id } => *session_id,
            MdEvent::Request { .. } | MdEvent::Notification { .. } => return,
        };
        let listener = listener_hint.or_else(|| self.md_sessions.get(&id).and_then(|s| s.listener));
        if let Some(lh) = listener {
            self.fire_listener_callback(lh.0, ev);
            return;
        }
        if let Some(mut cb) = self.md_callbacks.remove(&id) {
            cb(ev);
            if self.md_sessions.contains_key(&id) {
                self.md_callbacks.insert(id, cb);
            }
        }
    }

    fn sweep_md_timeouts(&mut self, now: Instant) {
        let (events, retries) = md_engine::due_retries_or_timeouts(&mut self.md_sessions, now);
        for (id, buf) in retries {
            if let Some(s) = self.md_sessions.get(&id) {
                let dst = SocketAddr::new(s.peer_ip, self.md_port(s.use_tcp));
                let socket_idx = s.socket_idx;
                if let Err(e) = self.send_md(socket_idx, &buf, dst) {
                    warn!("md retry send error: {}", e);
                }
            }
        }
        for (ev, listener) in events {
            self.route_session_event(ev, listener);
        }
        let sessions = &self.md_sessions;
        self.md_callbacks.retain(|id, _| sessions.contains_key(id));
    }
}

/// Deliver (and put back) a subscription's user callback, un-marshalling
/// the stored payload first when `SubFlags::MARSHALL` is set. A free
/// function so the borrow of `subs` and of `marshaller` don't alias the
/// same `&mut Inner`.
fn deliver_pd_callback(subs: &mut Arena<Subscription>, idx: usize, info: CallbackInfo, marshaller: &dyn Marshall) {
    let Some(sub) = subs.get_mut(idx) else { return };
    let raw = sub.get().map(|b| b.to_vec()).unwrap_or_default();
    let (com_id, src, dst, user_ref) = (sub.key.com_id, sub.last_src_ip.unwrap_or(sub.key.dst_ip), sub.key.dst_ip, sub.user_ref);
    let data = if sub.flags.contains(SubFlags::MARSHALL) {
        marshaller.unmarshall(user_ref, com_id, src, dst, &raw).unwrap_or(raw)
    } else {
        raw
    };
    let Some(mut cb) = sub.callback.take() else { return };
    cb(sub, info, &data);
    if let Some(sub) = subs.get_mut(idx) {
        sub.callback = Some(cb);
    }
}

/// Handle to an open TRDP engine instance. Cheap to clone — every clone
/// shares the same underlying state behind one mutex, the way the teacher's
/// `Client` is handed around by value while its transport stays singular.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Mutex<Inner>>,
}

impl Session {
    /// `tlc_openSession`: binds the shared PD and MD sockets for `own_ip`
    /// and registers the handle with `registry` so redundant publishers on
    /// other sessions can be consulted for sequence-counter continuity.
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        registry: &Registry,
        own_ip: IpAddr,
        process_cfg: ProcessConfig,
        pd_cfg: PdConfig,
        md_cfg: MdConfig,
        mem_cfg: MemConfig,
        marshaller: Box<dyn Marshall>,
    ) -> Result<Session, Error> {
        let mut pool = Pool::with_ports(pd_cfg.port, md_cfg.udp_port, md_cfg.tcp_port);
        let pd_socket = pool.request_udp(own_ip, Usage::Pd, SendParams::default())?;
        let md_udp_socket = pool.request_udp(own_ip, Usage::MdUdp, SendParams::default())?;
        let md_listen_socket = pool.request_tcp_listen(SocketAddr::new(own_ip, md_cfg.tcp_port))?;

        let own_ip_u32 = ipv4_u32(own_ip)?;
        let host_name = process_cfg.host_name.clone();
        let mut pubs = Arena::new();
        let stats_key = PubKey { com_id: TRDP_GLOBAL_STATISTICS_COMID, src_ip: own_ip, dst_ip: own_ip, etb_topo_cnt: 0, op_trn_topo_cnt: 0 };
        let stats_pub =
            Publication::new(stats_key, Duration::ZERO, RedundancyId::None, PubFlags::NONE, pd_socket, 0, 0, 0, &[], Instant::now());
        let stats_pub_idx = PubHandle(pubs.insert(stats_pub));

        let inner = Inner {
            registry: registry.clone(),
            process_cfg,
            pd_cfg,
            md_cfg,
            own_ip,
            pool,
            memory: Memory::new(&mem_cfg),
            stats: Statistics::new(1, own_ip_u32, host_name),
            marshaller,
            pubs,
            subs: Arena::new(),
            listeners: Arena::new(),
            md_sessions: HashMap::new(),
            md_callbacks: HashMap::new(),
            redundancy: HashMap::new(),
            session_salt: own_ip_u32 as u64,
            session_counter: 0,
            pd_socket,
            md_udp_socket,
            md_listen_socket,
            stats_pub_idx: Some(stats_pub_idx),
            closed: false,
        };
        let arc = Arc::new(Mutex::new(inner));
        registry.register(&arc);
        Ok(Session { inner: arc })
    }

    /// `open` with every config at its default and no marshalling.
    pub fn open_default(registry: &Registry, own_ip: IpAddr) -> Result<Session, Error> {
        Session::open(
            registry,
            own_ip,
            ProcessConfig::default(),
            PdConfig::default(),
            MdConfig::default(),
            MemConfig::default(),
            Box::new(NoopMarshall),
        )
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, Error> {
        self.inner.lock().map_err(|_| Error::Mutex)
    }

    // -- PD: publish / put / unpublish -----------------------------------

    /// `publish`: fails with `NoPub` if `(comId, srcIp, dstIp, etbTopoCnt,
    /// opTrnTopoCnt)` is already published on this session (invariant 3).
    #[allow(clippy::too_many_arguments)]
    pub fn publish(
        &self,
        com_id: u32,
        dst_ip: IpAddr,
        etb_topo_cnt: u32,
        op_trn_topo_cnt: u32,
        cycle: Duration,
        redundancy: RedundancyId,
        flags: PubFlags,
        reply_com_id: u32,
        reply_ip: u32,
        user_ref: usize,
        data: &[u8],
    ) -> Result<PubHandle, Error> {
        let mut inner = self.lock()?;
        if inner.closed {
            return Err(Error::NoSession);
        }
        let key = PubKey { com_id, src_ip: inner.own_ip, dst_ip, etb_topo_cnt, op_trn_topo_cnt };
        if inner.pubs.iter().any(|(_, p)| p.key == key) {
            return Err(Error::NoPub);
        }
        let socket_idx = inner.pool.request_udp(inner.own_ip, Usage::Pd, SendParams::default())?;
        let payload = if flags.contains(PubFlags::MARSHALL) {
            inner.marshaller.marshall(user_ref, com_id, inner.own_ip, dst_ip, data)?
        } else {
            data.to_vec()
        };
        let mut p = Publication::new(key, cycle, redundancy, flags, socket_idx, reply_com_id, reply_ip, user_ref, &payload, Instant::now());
        if let Some(highest) = inner.registry.highest_sequence(&self.inner, com_id, inner.own_ip) {
            p.seed_sequence_counter(highest);
        }
        let gross_size = p.gross_size();
        let idx = inner.pubs.insert(p);
        if let Ok(bucket) = inner.memory.alloc(gross_size) {
            inner.pub_mem_buckets.insert(idx, bucket);
        }
        inner.stats.pd.num_pubs += 1;
        Ok(PubHandle(idx))
    }

    pub fn unpublish(&self, handle: PubHandle) -> Result<(), Error> {
        let mut inner = self.lock()?;
        let p = inner.pubs.remove(handle.0).ok_or(Error::NoPub)?;
        inner.pool.release(p.socket_idx)?;
        if let Some(bucket) = inner.pub_mem_buckets.remove(&handle.0) {
            let _ = inner.memory.free(bucket);
        }
        inner.stats.pd.num_pubs = inner.stats.pd.num_pubs.saturating_sub(1);
        Ok(())
    }

    /// `put`: replace a publication's dataset; delivered on its next
    /// scheduled or PULL-triggered send.
    pub fn put(&self, handle: PubHandle, data: &[u8]) -> Result<(), Error> {
        let mut inner = self.lock()?;
        let (flags, com_id, src_ip, dst_ip, user_ref) = {
            let p = inner.pubs.get(handle.0).ok_or(Error::NoPub)?;
            (p.flags, p.key.com_id, p.key.src_ip, p.key.dst_ip, p.user_ref)
        };
        let payload = if flags.contains(PubFlags::MARSHALL) {
            inner.marshaller.marshall(user_ref, com_id, src_ip, dst_ip, data)?
        } else {
            data.to_vec()
        };
        let p = inner.pubs.get_mut(handle.0).ok_or(Error::NoPub)?;
        p.put(&payload);
        Ok(())
    }

    // -- PD: subscribe / unsubscribe / get -------------------------------

    #[allow(clippy::too_many_arguments)]
    pub fn subscribe(
        &self,
        com_id: u32,
        dst_ip: IpAddr,
        src_ip1: Option<IpAddr>,
        src_ip2: Option<IpAddr>,
        etb_topo_cnt: u32,
        op_trn_topo_cnt: u32,
        timeout: Duration,
        behavior: TimeoutBehavior,
        max_size: usize,
        flags: SubFlags,
        user_ref: usize,
        callback: Option<Box<dyn FnMut(&Subscription, CallbackInfo, &[u8]) + Send>>,
    ) -> Result<SubHandle, Error> {
        let mut inner = self.lock()?;
        if inner.closed {
            return Err(Error::NoSession);
        }
        let key = SubKey { com_id, src_ip1, src_ip2, dst_ip, etb_topo_cnt, op_trn_topo_cnt };
        let socket_idx = inner.pool.request_udp(inner.own_ip, Usage::Pd, SendParams::default())?;

        let own_ip = inner.own_ip;
        let mut mc_joined = None;
        if let IpAddr::V4(group) = dst_ip {
            if group.is_multicast() {
                let own_v4 = match own_ip {
                    IpAddr::V4(a) => a,
                    IpAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
                };
                if let Some(entry) = inner.pool.get_mut(socket_idx) {
                    entry.join_multicast(group, own_v4)?;
                }
                mc_joined = Some(dst_ip);
            }
        }

        let mut sub = Subscription::new(key, flags, timeout, behavior, max_size, user_ref, callback, socket_idx, Instant::now());
        sub.mc_joined = mc_joined;
        let idx = inner.subs.insert(sub);
        if let Ok(bucket) = inner.memory.alloc(max_size) {
            inner.sub_mem_buckets.insert(idx, bucket);
        }
        inner.stats.pd.num_subs += 1;
        Ok(SubHandle(idx))
    }

    pub fn unsubscribe(&self, handle: SubHandle) -> Result<(), Error> {
        let mut inner = self.lock()?;
        let s = inner.subs.remove(handle.0).ok_or(Error::NoSub)?;
        if let Some(IpAddr::V4(group)) = s.mc_joined {
            let own_v4 = match inner.own_ip {
                IpAddr::V4(a) => a,
                IpAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
            };
            if let Some(entry) = inner.pool.get_mut(s.socket_idx) {
                let _ = entry.leave_multicast(group, own_v4);
            }
        }
        inner.pool.release(s.socket_idx)?;
        if let Some(bucket) = inner.sub_mem_buckets.remove(&handle.0) {
            let _ = inner.memory.free(bucket);
        }
        inner.stats.pd.num_subs = inner.stats.pd.num_subs.saturating_sub(1);
        Ok(())
    }

    /// `get`: the subscription's last accepted (and un-marshalled, if
    /// `SubFlags::MARSHALL`) dataset.
    pub fn get(&self, handle: SubHandle) -> Result<Vec<u8>, Error> {
        let inner = self.lock()?;
        let s = inner.subs.get(handle.0).ok_or(Error::NoSub)?;
        let raw = s.get()?;
        if s.flags.contains(SubFlags::MARSHALL) {
            let src = s.last_src_ip.unwrap_or(s.key.dst_ip);
            inner.marshaller.unmarshall(s.user_ref, s.key.com_id, src, s.key.dst_ip, raw)
        } else {
            Ok(raw.to_vec())
        }
    }

    /// `(rx_count, missed_count, timeout_count)` for one subscription.
    pub fn sub_counters(&self, handle: SubHandle) -> Result<(u32, u32, u32), Error> {
        let inner = self.lock()?;
        let s = inner.subs.get(handle.0).ok_or(Error::NoSub)?;
        Ok((s.rx_count(), s.missed_count(), s.timeout_count()))
    }

    pub fn pub_sends(&self, handle: PubHandle) -> Result<u32, Error> {
        let inner = self.lock()?;
        Ok(inner.pubs.get(handle.0).ok_or(Error::NoPub)?.sends())
    }

    /// `request`: a one-shot PULL (`Pr`). The caller must already hold a
    /// subscription to `reply_com_id` to receive the `Pp` that comes back —
    /// `request` only sends; it never waits synchronously for the reply.
    pub fn request(&self, request_com_id: u32, reply_com_id: u32, etb_topo_cnt: u32, op_trn_topo_cnt: u32, dst_ip: IpAddr) -> Result<(), Error> {
        let inner = self.lock()?;
        if inner.closed {
            return Err(Error::NoSession);
        }
        let head = frame::FrameHead::init(MsgType::Pr, request_com_id, etb_topo_cnt, op_trn_topo_cnt, 0, reply_com_id, 0);
        let mut buf = frame::build_pd(&head, &[]);
        frame::finalize_pd(&mut buf, 1);
        let dst = SocketAddr::new(dst_ip, inner.pd_cfg.port);
        inner.send_pd(inner.pd_socket, &buf, dst)
    }

    /// Convenience for `TRDP_GLOBAL_STATISTICS_COMID`: PULLs the peer's
    /// statistics block. Subscribe to `TRDP_GLOBAL_STATISTICS_COMID` first.
    pub fn request_statistics(&self, dst_ip: IpAddr) -> Result<(), Error> {
        self.request(TRDP_STATISTICS_REQUEST_COMID, TRDP_GLOBAL_STATISTICS_COMID, 0, 0, dst_ip)
    }

    // -- Redundancy -------------------------------------------------------

    /// §4.3.1 redundancy: marks this session as leader (or follower) for
    /// `group`; only the leader's members of that group are ever sent.
    pub fn set_redundant(&self, group: u32, leader: bool) -> Result<(), Error> {
        let mut inner = self.lock()?;
        inner.redundancy.insert(group, leader);
        Ok(())
    }

    pub fn redundant(&self, group: u32) -> Result<bool, Error> {
        let inner = self.lock()?;
        Ok(*inner.redundancy.get(&group).unwrap_or(&false))
    }

    // -- MD: listeners -----------------------------------------------------

    pub fn add_listener(
        &self,
        com_id: u32,
        etb_topo_cnt: u32,
        dst_ip: Option<IpAddr>,
        dst_uri: [u8; 32],
        user_ref: usize,
        callback: Option<Box<dyn FnMut(&Listener, MdEvent) + Send>>,
    ) -> Result<ListenerHandle, Error> {
        let mut inner = self.lock()?;
        let idx = inner.listeners.insert(Listener::new(com_id, etb_topo_cnt, dst_ip, dst_uri, user_ref, callback));
        Ok(ListenerHandle(idx))
    }

    pub fn del_listener(&self, handle: ListenerHandle) -> Result<(), Error> {
        let mut inner = self.lock()?;
        inner.listeners.remove(handle.0).ok_or(Error::NoList)?;
        Ok(())
    }

    // -- MD: request / notify / reply / confirm --------------------------

    /// `mdRequest` / `mdNotify` when `no_of_repliers == 0` is not special —
    /// pass `notify = true` to send an `Mn` (fire-and-forget, no session)
    /// instead of an `Mr`.
    #[allow(clippy::too_many_arguments)]
    pub fn md_request(
        &self,
        com_id: u32,
        etb_topo_cnt: u32,
        op_trn_topo_cnt: u32,
        peer_ip: IpAddr,
        reply_timeout: Duration,
        no_of_repliers: u32,
        num_retries_max: u32,
        source_uri: [u8; 32],
        dest_uri: [u8; 32],
        use_tcp: bool,
        data: &[u8],
        callback: Option<Box<dyn FnMut(MdEvent) + Send>>,
    ) -> Result<SessionId, Error> {
        let mut inner = self.lock()?;
        if inner.closed {
            return Err(Error::NoSession);
        }
        let socket_idx = if use_tcp {
            inner
                .pool
                .request_tcp_connect(inner.own_ip, SocketAddr::new(peer_ip, inner.md_cfg.tcp_port), SendParams::default(), inner.md_cfg.tcp_connect_timeout, inner.md_cfg.tcp_idle_timeout)?
        } else {
            inner.pool.request_udp(inner.own_ip, Usage::MdUdp, SendParams::default())?
        };
        inner.session_counter += 1;
        let id = SessionId::from_counter(inner.session_salt, inner.session_counter);
        let now = Instant::now();
        let (session, buf) = md_engine::build_request(
            id, com_id, etb_topo_cnt, op_trn_topo_cnt, peer_ip, reply_timeout, no_of_repliers, num_retries_max, source_uri, dest_uri, socket_idx, use_tcp, data, now,
        );
        let port = inner.md_port(use_tcp);
        inner.send_md(socket_idx, &buf, SocketAddr::new(peer_ip, port))?;
        inner.bump_md(use_tcp, |s| s.sends += 1);
        inner.md_sessions.insert(id, session);
        if let Some(cb) = callback {
            inner.md_callbacks.insert(id, cb);
        }
        Ok(id)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn md_notify(&self, com_id: u32, etb_topo_cnt: u32, op_trn_topo_cnt: u32, peer_ip: IpAddr, source_uri: [u8; 32], dest_uri: [u8; 32], data: &[u8]) -> Result<(), Error> {
        let inner = self.lock()?;
        if inner.closed {
            return Err(Error::NoSession);
        }
        let buf = md_engine::build_notify(com_id, etb_topo_cnt, op_trn_topo_cnt, source_uri, dest_uri, data);
        inner.send_md(inner.md_udp_socket, &buf, SocketAddr::new(peer_ip, inner.md_cfg.udp_port))
    }

    pub fn md_reply(&self, id: SessionId, data: &[u8]) -> Result<(), Error> {
        let mut inner = self.lock()?;
        let (socket_idx, peer_ip, use_tcp) = session_route(&inner, id)?;
        let buf = {
            let s = inner.md_sessions.get_mut(&id).ok_or(Error::NoSession)?;
            md_engine::build_reply(s, data)?
        };
        let port = inner.md_port(use_tcp);
        inner.send_md(socket_idx, &buf, SocketAddr::new(peer_ip, port))?;
        inner.bump_md(use_tcp, |s| s.sends += 1);
        inner.md_sessions.remove(&id);
        Ok(())
    }

    pub fn md_reply_query(&self, id: SessionId, data: &[u8]) -> Result<(), Error> {
        let mut inner = self.lock()?;
        let (socket_idx, peer_ip, use_tcp) = session_route(&inner, id)?;
        let confirm_timeout = inner.md_cfg.default_confirm_timeout;
        let now = Instant::now();
        let buf = {
            let s = inner.md_sessions.get_mut(&id).ok_or(Error::NoSession)?;
            md_engine::build_reply_query(s, data, confirm_timeout, now)?
        };
        let port = inner.md_port(use_tcp);
        inner.send_md(socket_idx, &buf, SocketAddr::new(peer_ip, port))?;
        inner.bump_md(use_tcp, |s| s.sends += 1);
        Ok(())
    }

    pub fn md_reply_err(&self, id: SessionId, result_code: u32) -> Result<(), Error> {
        let mut inner = self.lock()?;
        let (socket_idx, peer_ip, use_tcp) = session_route(&inner, id)?;
        let buf = {
            let s = inner.md_sessions.get_mut(&id).ok_or(Error::NoSession)?;
            md_engine::build_reply_err(s, result_code)?
        };
        let port = inner.md_port(use_tcp);
        inner.send_md(socket_idx, &buf, SocketAddr::new(peer_ip, port))?;
        inner.bump_md(use_tcp, |s| s.sends += 1);
        inner.md_sessions.remove(&id);
        Ok(())
    }

    pub fn md_confirm(&self, id: SessionId) -> Result<(), Error> {
        let mut inner = self.lock()?;
        let (socket_idx, peer_ip, use_tcp) = session_route(&inner, id)?;
        let buf = {
            let s = inner.md_sessions.get_mut(&id).ok_or(Error::NoSession)?;
            md_engine::build_confirm(s)?
        };
        let port = inner.md_port(use_tcp);
        inner.send_md(socket_idx, &buf, SocketAddr::new(peer_ip, port))?;
        inner.bump_md(use_tcp, |s| s.sends += 1);
        inner.md_sessions.remove(&id);
        Ok(())
    }

    pub fn md_abort(&self, id: SessionId) -> Result<(), Error> {
        let mut inner = self.lock()?;
        md_engine::abort_session(&mut inner.md_sessions, id)?;
        inner.md_sessions.remove(&id);
        inner.md_callbacks.remove(&id);
        Ok(())
    }

    // -- process / lifecycle ----------------------------------------------

    /// `tlc_process`: drains every socket, sends what's due, and sweeps
    /// both PD and MD timeouts. Call this in a loop no less often than
    /// [`Session::next_deadline`].
    pub fn process(&self) -> Result<(), Error> {
        let now = Instant::now();
        let mut inner = self.lock()?;
        if inner.closed {
            return Err(Error::NoSession);
        }
        inner.drain_pd(now);
        inner.drain_md_udp(now);
        inner.drain_md_tcp_accepts();
        inner.drain_md_tcp(now);
        inner.send_due_pd(now);
        inner.sweep_md_timeouts(now);
        inner.sweep_pd_timeouts(now);
        inner.pool.reap_expired(now);
        Ok(())
    }

    /// Upper bound on how long `process` can be left unpolled before a
    /// cyclic send or a pending MD deadline would be missed.
    pub fn next_deadline(&self) -> Result<Duration, Error> {
        let inner = self.lock()?;
        let now = Instant::now();
        let pd_next = scheduler::next_due_in(&inner.pubs, now);
        let md_next = inner
            .md_sessions
            .values()
            .filter(|s| !s.is_terminal())
            .map(|s| match s.state {
                MdState::ConfirmAwait => s.confirm_deadline.saturating_duration_since(now),
                _ => s.reply_deadline.saturating_duration_since(now),
            })
            .min();
        Ok([pd_next, md_next].into_iter().flatten().min().unwrap_or(Duration::from_millis(100)))
    }

    /// §4.3.4: re-spreads every cyclic publication's `timeToGo` across the
    /// smallest interval present. Typically called once right after the
    /// last `publish()` of a burst, before the first `process()` tick.
    pub fn stagger_send_times(&self) -> Result<(), Error> {
        let mut inner = self.lock()?;
        let now = Instant::now();
        scheduler::stagger_send_times(&mut inner.pubs, now);
        Ok(())
    }

    pub fn pd_sockets(&self) -> Result<Vec<SockIdx>, Error> {
        Ok(self.lock()?.pool.indices_with_usage(Usage::Pd))
    }

    pub fn md_sockets(&self) -> Result<Vec<SockIdx>, Error> {
        let inner = self.lock()?;
        let mut out = inner.pool.indices_with_usage(Usage::MdUdp);
        out.extend(inner.pool.indices_with_usage(Usage::MdTcp));
        Ok(out)
    }

    /// Re-joins every previously-joined multicast group after a link
    /// down/up event; does not otherwise touch element state.
    pub fn reinit(&self) -> Result<(), Error> {
        let mut inner = self.lock()?;
        if inner.closed {
            return Err(Error::NoSession);
        }
        let own_v4 = match inner.own_ip {
            IpAddr::V4(a) => a,
            IpAddr::V6(_) => return Err(Error::Param("reinit requires IPv4".into())),
        };
        inner.pool.rejoin_all_multicast(own_v4).map_err(Error::from)
    }

    pub fn statistics(&self) -> Result<Statistics, Error> {
        Ok(self.lock()?.stats.clone())
    }

    pub fn reset_statistics(&self) -> Result<(), Error> {
        let mut inner = self.lock()?;
        inner.stats.reset();
        Ok(())
    }

    /// `tlc_closeSession`: releases every socket-pool reference this
    /// session holds and empties every element table. The handle remains
    /// valid to drop but every other call after this returns `NoSession`.
    pub fn close(&self) -> Result<(), Error> {
        let mut inner = self.lock()?;
        if inner.closed {
            return Err(Error::NoSession);
        }
        inner.closed = true;

        let pub_socks: Vec<_> = inner.pubs.iter().map(|(_, p)| p.socket_idx).collect();
        for s in pub_socks {
            let _ = inner.pool.release(s);
        }
        let sub_socks: Vec<_> = inner.subs.iter().map(|(_, s)| s.socket_idx).collect();
        for s in sub_socks {
            let _ = inner.pool.release(s);
        }
        let md_socks: Vec<_> = inner.md_sessions.values().map(|s| s.socket_idx).collect();
        for s in md_socks {
            let _ = inner.pool.release(s);
        }
        let _ = inner.pool.release(inner.pd_socket);
        let _ = inner.pool.release(inner.md_udp_socket);
        let _ = inner.pool.release(inner.md_listen_socket);

        inner.pubs = Arena::new();
        inner.subs = Arena::new();
        inner.listeners = Arena::new();
        inner.md_sessions.clear();
        inner.md_callbacks.clear();
        inner.pub_mem_buckets.clear();
        inner.sub_mem_buckets.clear();
        Ok(())
    }
}

fn session_route(inner: &Inner, id: SessionId) -> Result<(SockIdx, IpAddr, bool), Error> {
    let s = inner.md_sessions.get(&id).ok_or(Error::NoSession)?;
    Ok((s.socket_idx, s.peer_ip, s.use_tcp))
}

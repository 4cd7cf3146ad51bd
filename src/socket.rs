//! Shares a small number of OS sockets across many logical PD publications
//! and subscriptions, and across MD requesters/listeners, per `spec.md`
//! §4.2. Grounded on the teacher's `tcp::{Transport, Options}` split: a pool
//! entry owns exactly one `std::net` socket behind a `Mutex`, the way the
//! teacher wraps its single `TcpStream`.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use socket2::{Domain, Socket, Type};

use super::constant::{MD_TCP_PORT, MD_UDP_PORT, PD_UDP_PORT};
use super::error::Error;

/// Opens a UDP socket with `SO_REUSEADDR` set before bind (`spec.md` §4.2:
/// a freshly opened pool socket must allow a later bind to the same
/// address, e.g. after a process restart while the old socket lingers in
/// `TIME_WAIT`). `std::net::UdpSocket` offers no pre-bind hook for this, so
/// the socket is built with `socket2` and converted back.
fn bind_udp_reuseaddr(addr: SocketAddr) -> io::Result<UdpSocket> {
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let sock = Socket::new(domain, Type::DGRAM, None)?;
    sock.set_reuse_address(true)?;
    sock.bind(&addr.into())?;
    Ok(sock.into())
}

/// Same rationale as `bind_udp_reuseaddr`, for the MD-over-TCP listening
/// socket the pool keeps per local bind address.
fn bind_tcp_reuseaddr(addr: SocketAddr) -> io::Result<TcpListener> {
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let sock = Socket::new(domain, Type::STREAM, None)?;
    sock.set_reuse_address(true)?;
    sock.bind(&addr.into())?;
    sock.listen(128)?;
    Ok(sock.into())
}

/// What a pool entry is used for; part of the matching key in `request()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Usage {
    Pd,
    MdUdp,
    MdTcp,
}

/// QoS/TTL send parameters plus blocking mode, part of the matching key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SendParams {
    pub qos: u8,
    pub ttl: u8,
    pub rcv_only: bool,
}

impl Default for SendParams {
    fn default() -> Self {
        SendParams { qos: 5, ttl: 64, rcv_only: false }
    }
}

/// The tuple a pool entry is matched against: `(bindAddr, usage, qos, ttl,
/// rcvOnly, peerIp-if-TCP)` from `spec.md` §4.2.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Key {
    bind_addr: SocketAddr,
    usage: Usage,
    params: SendParams,
    peer_ip: Option<IpAddr>,
}

enum Conn {
    Udp(UdpSocket),
    /// an established TCP connection to exactly one peer.
    Tcp(Mutex<TcpStream>),
    /// a listening socket not yet associated with any peer.
    TcpListener(TcpListener),
}

pub struct PoolEntry {
    key: Key,
    usage_count: u32,
    conn: Conn,
    /// TCP entries only: closes the connection when this deadline passes.
    connection_timeout: Option<Instant>,
    joined_groups: Vec<Ipv4Addr>,
}

impl PoolEntry {
    pub fn usage(&self) -> Usage {
        self.key.usage
    }

    pub fn peer_ip(&self) -> Option<IpAddr> {
        self.key.peer_ip
    }

    pub fn bind_addr(&self) -> SocketAddr {
        self.key.bind_addr
    }

    pub fn udp(&self) -> Option<&UdpSocket> {
        match &self.conn {
            Conn::Udp(s) => Some(s),
            _ => None,
        }
    }

    pub fn tcp(&self) -> Option<&Mutex<TcpStream>> {
        match &self.conn {
            Conn::Tcp(s) => Some(s),
            _ => None,
        }
    }

    pub fn tcp_listener(&self) -> Option<&TcpListener> {
        match &self.conn {
            Conn::TcpListener(l) => Some(l),
            _ => None,
        }
    }

    pub fn is_listener(&self) -> bool {
        matches!(self.conn, Conn::TcpListener(_))
    }

    pub fn set_connection_timeout(&mut self, deadline: Instant) {
        self.connection_timeout = Some(deadline);
    }

    /// sends one PD/MD-over-UDP frame to `dst`; only valid on a `Udp` entry.
    pub fn send_udp(&self, buf: &[u8], dst: SocketAddr) -> Result<usize, Error> {
        match &self.conn {
            Conn::Udp(sock) => sock.send_to(buf, dst).map_err(Error::from),
            _ => Err(Error::Param("send_udp on a non-UDP entry".into())),
        }
    }

    /// drains one pending datagram, if any; `Ok(None)` means nothing is
    /// waiting right now (the socket is non-blocking).
    pub fn try_recv_udp(&self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>, Error> {
        match &self.conn {
            Conn::Udp(sock) => match sock.recv_from(buf) {
                Ok((n, src)) => Ok(Some((n, src))),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
                Err(e) => Err(Error::from(e)),
            },
            _ => Err(Error::Param("try_recv_udp on a non-UDP entry".into())),
        }
    }

    /// writes one length-prefixed MD frame to the peer; only valid on a
    /// `Tcp` entry.
    pub fn send_md_tcp(&self, buf: &[u8]) -> Result<(), Error> {
        match &self.conn {
            Conn::Tcp(stream) => {
                let mut stream = stream.lock().map_err(|_| Error::Mutex)?;
                stream.write_all(buf).map_err(Error::from)
            }
            _ => Err(Error::Param("send_md_tcp on a non-TCP entry".into())),
        }
    }

    /// reads exactly one MD frame from the peer (spec.md §6: "the header
    /// carries `datasetLength`; the reader consumes exactly
    /// `packetSize(datasetLength)` bytes"). Blocks for at most the
    /// stream's read timeout; `Ok(None)` means no frame is available yet
    /// (a non-blocking stream with nothing queued).
    pub fn try_recv_md_tcp(&self) -> Result<Option<Vec<u8>>, Error> {
        let Conn::Tcp(stream) = &self.conn else {
            return Err(Error::Param("try_recv_md_tcp on a non-TCP entry".into()));
        };
        let mut stream = stream.lock().map_err(|_| Error::Mutex)?;
        let mut head = vec![0u8; crate::frame::MD_HEADER_SIZE];
        match read_exact_nonblocking(&mut stream, &mut head) {
            Ok(false) => return Ok(None),
            Ok(true) => {}
            Err(e) => return Err(Error::from(e)),
        }
        let dataset_len = crate::frame::peek_dataset_length(&head) as usize;
        let pad = crate::constant::pad4(dataset_len);
        let mut rest = vec![0u8; pad];
        if pad > 0 {
            stream.read_exact(&mut rest).map_err(Error::from)?;
        }
        head.extend_from_slice(&rest);
        Ok(Some(head))
    }

    /// accepts one pending connection on a `TcpListener` entry, if any.
    pub fn try_accept(&self) -> Result<Option<(TcpStream, IpAddr)>, Error> {
        match &self.conn {
            Conn::TcpListener(listener) => match listener.accept() {
                Ok((stream, peer)) => {
                    stream.set_nonblocking(true)?;
                    stream.set_nodelay(true).ok();
                    Ok(Some((stream, peer.ip())))
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
                Err(e) => Err(Error::from(e)),
            },
            _ => Err(Error::Param("try_accept on a non-listener entry".into())),
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        matches!(self.connection_timeout, Some(d) if d <= now)
    }

    /// join the multicast group on the underlying UDP socket, and record it
    /// on the entry so `Pool::reinit` can rejoin after a link flap.
    pub fn join_multicast(&mut self, group: Ipv4Addr, iface: Ipv4Addr) -> Result<(), Error> {
        if let Conn::Udp(sock) = &self.conn {
            sock.join_multicast_v4(&group, &iface)?;
            if !self.joined_groups.contains(&group) {
                self.joined_groups.push(group);
            }
            Ok(())
        } else {
            Err(Error::Param("multicast join on a non-UDP entry".into()))
        }
    }

    pub fn leave_multicast(&mut self, group: Ipv4Addr, iface: Ipv4Addr) -> Result<(), Error> {
        if let Conn::Udp(sock) = &self.conn {
            sock.leave_multicast_v4(&group, &iface)?;
            self.joined_groups.retain(|g| *g != group);
            Ok(())
        } else {
            Err(Error::Param("multicast leave on a non-UDP entry".into()))
        }
    }
}

/// Index into the pool; stable across insert/remove of other entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SockIdx(pub usize);

pub struct Pool {
    entries: Vec<Option<PoolEntry>>,
    free_list: Vec<usize>,
    pd_port: u16,
    md_udp_port: u16,
    md_tcp_port: u16,
}

impl Default for Pool {
    fn default() -> Self {
        Pool::new()
    }
}

impl Pool {
    pub fn new() -> Pool {
        Pool {
            entries: Vec::new(),
            free_list: Vec::new(),
            pd_port: PD_UDP_PORT,
            md_udp_port: MD_UDP_PORT,
            md_tcp_port: MD_TCP_PORT,
        }
    }

    pub fn with_ports(pd_port: u16, md_udp_port: u16, md_tcp_port: u16) -> Pool {
        Pool { pd_port, md_udp_port, md_tcp_port, ..Pool::new() }
    }

    fn port_for(&self, usage: Usage) -> u16 {
        match usage {
            Usage::Pd => self.pd_port,
            Usage::MdUdp => self.md_udp_port,
            Usage::MdTcp => self.md_tcp_port,
        }
    }

    fn find_matching(&self, key: &Key) -> Option<usize> {
        self.entries.iter().enumerate().find_map(|(i, e)| match e {
            Some(entry) if entry.usage_count > 0 && entry.key == *key => Some(i),
            _ => None,
        })
    }

    fn insert(&mut self, entry: PoolEntry) -> SockIdx {
        if let Some(idx) = self.free_list.pop() {
            self.entries[idx] = Some(entry);
            SockIdx(idx)
        } else {
            self.entries.push(Some(entry));
            SockIdx(self.entries.len() - 1)
        }
    }

    /// `request`: reuse a matching entry (bumping its usage count) or open
    /// a new UDP socket bound to `src_ip` for the given `usage`/`params`.
    pub fn request_udp(
        &mut self,
        src_ip: IpAddr,
        usage: Usage,
        params: SendParams,
    ) -> Result<SockIdx, Error> {
        let bind_addr = SocketAddr::new(src_ip, self.port_for(usage));
        let key = Key { bind_addr, usage, params, peer_ip: None };
        if let Some(idx) = self.find_matching(&key) {
            self.entries[idx].as_mut().unwrap().usage_count += 1;
            return Ok(SockIdx(idx));
        }

        let sock = bind_udp_reuseaddr(bind_addr).map_err(|e| Error::Sock(e.to_string()))?;
        sock.set_nonblocking(true)?;
        if params.ttl != 0 {
            let _ = sock.set_multicast_ttl_v4(params.ttl as u32);
            let _ = sock.set_ttl(params.ttl as u32);
        }
        let entry = PoolEntry {
            key,
            usage_count: 1,
            conn: Conn::Udp(sock),
            connection_timeout: None,
            joined_groups: Vec::new(),
        };
        Ok(self.insert(entry))
    }

    /// MD TCP: one connection per remote peer IP. Reuses an existing
    /// connection to the same peer if present.
    pub fn request_tcp_connect(
        &mut self,
        src_ip: IpAddr,
        peer: SocketAddr,
        params: SendParams,
        connect_timeout: Duration,
        idle_timeout: Duration,
    ) -> Result<SockIdx, Error> {
        let bind_addr = SocketAddr::new(src_ip, 0);
        let key = Key { bind_addr, usage: Usage::MdTcp, params, peer_ip: Some(peer.ip()) };
        if let Some(idx) = self.find_matching(&key) {
            let entry = self.entries[idx].as_mut().unwrap();
            entry.usage_count += 1;
            entry.connection_timeout = Some(Instant::now() + idle_timeout);
            return Ok(SockIdx(idx));
        }

        let stream =
            TcpStream::connect_timeout(&peer, connect_timeout).map_err(|e| Error::Sock(e.to_string()))?;
        stream.set_nodelay(true).ok();
        let entry = PoolEntry {
            key,
            usage_count: 1,
            conn: Conn::Tcp(Mutex::new(stream)),
            connection_timeout: Some(Instant::now() + idle_timeout),
            joined_groups: Vec::new(),
        };
        Ok(self.insert(entry))
    }

    /// A pending accept inserts a receive-only listener slot, later elevated
    /// to a full `MdTcp` entry once the connection is associated with a
    /// listener or outgoing request.
    pub fn request_tcp_listen(&mut self, bind_addr: SocketAddr) -> Result<SockIdx, Error> {
        let key = Key { bind_addr, usage: Usage::MdTcp, params: SendParams { rcv_only: true, ..SendParams::default() }, peer_ip: None };
        if let Some(idx) = self.find_matching(&key) {
            self.entries[idx].as_mut().unwrap().usage_count += 1;
            return Ok(SockIdx(idx));
        }
        let listener = bind_tcp_reuseaddr(bind_addr).map_err(|e| Error::Sock(e.to_string()))?;
        listener.set_nonblocking(true)?;
        let entry = PoolEntry {
            key,
            usage_count: 1,
            conn: Conn::TcpListener(listener),
            connection_timeout: None,
            joined_groups: Vec::new(),
        };
        Ok(self.insert(entry))
    }

    /// Elevates an accepted connection into a full `MdTcp` entry keyed by
    /// the peer's address, so future `request_tcp_connect`/replies to that
    /// peer reuse it.
    pub fn adopt_accepted(
        &mut self,
        local_bind: SocketAddr,
        stream: TcpStream,
        peer: IpAddr,
        idle_timeout: Duration,
    ) -> SockIdx {
        let key = Key {
            bind_addr: local_bind,
            usage: Usage::MdTcp,
            params: SendParams::default(),
            peer_ip: Some(peer),
        };
        let entry = PoolEntry {
            key,
            usage_count: 1,
            conn: Conn::Tcp(Mutex::new(stream)),
            connection_timeout: Some(Instant::now() + idle_timeout),
            joined_groups: Vec::new(),
        };
        self.insert(entry)
    }

    /// every live entry matching `usage`, for a caller that needs to poll
    /// "all the sockets of this kind" (the PD engine's recv loop, the MD
    /// engine's TCP connection sweep).
    pub fn indices_with_usage(&self, usage: Usage) -> Vec<SockIdx> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(i, e)| match e {
                Some(entry) if entry.usage() == usage => Some(SockIdx(i)),
                _ => None,
            })
            .collect()
    }

    pub fn get(&self, idx: SockIdx) -> Option<&PoolEntry> {
        self.entries.get(idx.0).and_then(|e| e.as_ref())
    }

    pub fn get_mut(&mut self, idx: SockIdx) -> Option<&mut PoolEntry> {
        self.entries.get_mut(idx.0).and_then(|e| e.as_mut())
    }

    /// `release`: decrement usage; when it reaches zero the socket is
    /// closed (dropped) and the slot freed for reuse.
    pub fn release(&mut self, idx: SockIdx) -> Result<(), Error> {
        let slot = self.entries.get_mut(idx.0).ok_or(Error::Sock("bad socket index".into()))?;
        let entry = slot.as_mut().ok_or(Error::Sock("socket already released".into()))?;
        entry.usage_count = entry.usage_count.saturating_sub(1);
        if entry.usage_count == 0 {
            *slot = None;
            self.free_list.push(idx.0);
        }
        Ok(())
    }

    /// testable property #5: number of open OS sockets never exceeds the
    /// number of distinct in-use keys.
    pub fn open_socket_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_some()).count()
    }

    pub fn distinct_key_count(&self) -> usize {
        let mut seen: HashMap<&Key, ()> = HashMap::new();
        for e in self.entries.iter().flatten() {
            seen.insert(&e.key, ());
        }
        seen.len()
    }

    /// Close any TCP entry whose `connectionTimeout` has elapsed.
    pub fn reap_expired(&mut self, now: Instant) {
        for slot in self.entries.iter_mut() {
            if let Some(entry) = slot {
                if entry.is_expired(now) {
                    *slot = None;
                }
            }
        }
    }

    /// Re-joins every previously-joined multicast group on every UDP entry;
    /// used by `Session::reinit` after a link down/up event.
    pub fn rejoin_all_multicast(&mut self, iface: Ipv4Addr) -> io::Result<()> {
        for slot in self.entries.iter_mut().flatten() {
            if let Conn::Udp(sock) = &slot.conn {
                for group in slot.joined_groups.clone() {
                    sock.join_multicast_v4(&group, &iface)?;
                }
            }
        }
        Ok(())
    }
}

/// peeks `buf.len()` bytes without consuming them; reads them for real
/// (which will not block, the peek already proved they're queued) only
/// once that many are available. Keeps a non-blocking TCP stream safe to
/// poll repeatedly without ever losing bytes on a short read.
fn read_exact_nonblocking(stream: &mut TcpStream, buf: &mut [u8]) -> io::Result<bool> {
    let mut probe = vec![0u8; buf.len()];
    match stream.peek(&mut probe) {
        Ok(n) if n >= buf.len() => {
            stream.read_exact(buf)?;
            Ok(true)
        }
        Ok(_) => Ok(false),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn reusing_the_same_key_increments_usage_not_socket_count() {
        let mut pool = Pool::new();
        let ip = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let a = pool.request_udp(ip, Usage::Pd, SendParams::default()).unwrap();
        let b = pool.request_udp(ip, Usage::Pd, SendParams::default()).unwrap();
        assert_eq!(a, b);
        assert_eq!(pool.open_socket_count(), 1);
    }

    #[test]
    fn releasing_to_zero_closes_the_socket() {
        let mut pool = Pool::new();
        let ip = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let a = pool.request_udp(ip, Usage::Pd, SendParams::default()).unwrap();
        pool.request_udp(ip, Usage::Pd, SendParams::default()).unwrap();
        assert_eq!(pool.open_socket_count(), 1);
        pool.release(a).unwrap();
        assert_eq!(pool.open_socket_count(), 1); // still referenced once
        pool.release(a).unwrap();
        assert_eq!(pool.open_socket_count(), 0);
    }

    #[test]
    fn distinct_params_open_distinct_sockets() {
        let mut pool = Pool::new();
        let ip = IpAddr::V4(Ipv4Addr::LOCALHOST);
        pool.request_udp(ip, Usage::Pd, SendParams::default()).unwrap();
        pool.request_udp(ip, Usage::MdUdp, SendParams::default()).unwrap();
        assert_eq!(pool.open_socket_count(), 2);
        assert_eq!(pool.distinct_key_count(), 2);
    }

    #[test]
    fn freed_slot_is_reused_by_index() {
        let mut pool = Pool::new();
        let ip = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let a = pool.request_udp(ip, Usage::Pd, SendParams::default()).unwrap();
        pool.release(a).unwrap();
        let params2 = SendParams { qos: 7, ..SendParams::default() };
        let b = pool.request_udp(ip, Usage::MdUdp, params2).unwrap();
        assert_eq!(a, b, "freed slot index should be recycled");
    }
}

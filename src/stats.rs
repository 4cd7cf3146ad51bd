//! Statistics & control (spec.md §4.5): counters updated under the session
//! mutex, and the fixed-schema payload served as a PULL response on
//! [`super::constant::TRDP_GLOBAL_STATISTICS_COMID`] whenever a peer PULLs
//! [`super::constant::TRDP_STATISTICS_REQUEST_COMID`]. All fields are
//! transmitted big-endian, mirroring every other frame field in this crate.

use byteorder::{BigEndian, ByteOrder};
use std::time::{Duration, Instant};

const NAME_LEN: usize = 32;
const NUM_BUCKETS: usize = 8;

fn write_name(buf: &mut Vec<u8>, name: &str) {
    let mut field = [0u8; NAME_LEN];
    let bytes = name.as_bytes();
    let n = bytes.len().min(NAME_LEN);
    field[..n].copy_from_slice(&bytes[..n]);
    buf.extend_from_slice(&field);
}

fn read_name(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BucketUsage {
    pub size: u32,
    pub used: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemStats {
    pub total: u32,
    pub free: u32,
    pub min_free: u32,
    pub alloc_err: u32,
    pub free_err: u32,
    pub buckets: [BucketUsage; NUM_BUCKETS],
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PdStats {
    pub num_subs: u32,
    pub num_pubs: u32,
    pub rcv: u32,
    pub crc_err: u32,
    pub proto_err: u32,
    pub topo_err: u32,
    pub no_subs: u32,
    pub no_pubs: u32,
    pub timeouts: u32,
    pub sends: u32,
}

impl PdStats {
    fn write(&self, buf: &mut Vec<u8>) {
        for v in [
            self.num_subs, self.num_pubs, self.rcv, self.crc_err, self.proto_err,
            self.topo_err, self.no_subs, self.no_pubs, self.timeouts, self.sends,
        ] {
            buf.extend_from_slice(&v.to_be_bytes());
        }
    }

    fn read(buf: &[u8]) -> PdStats {
        let mut v = [0u32; 10];
        for (i, slot) in v.iter_mut().enumerate() {
            *slot = BigEndian::read_u32(&buf[i * 4..]);
        }
        PdStats {
            num_subs: v[0], num_pubs: v[1], rcv: v[2], crc_err: v[3], proto_err: v[4],
            topo_err: v[5], no_subs: v[6], no_pubs: v[7], timeouts: v[8], sends: v[9],
        }
    }

    const WIRE_SIZE: usize = 10 * 4;
}

/// Counters shared by MD-over-UDP and MD-over-TCP (same shape per
/// `spec.md` §4.5, one sub-block each).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MdTransportStats {
    pub num_listeners: u32,
    pub rcv: u32,
    pub crc_err: u32,
    pub proto_err: u32,
    pub topo_err: u32,
    pub no_listener: u32,
    pub reply_timeout: u32,
    pub confirm_timeout: u32,
    pub sends: u32,
}

impl MdTransportStats {
    fn write(&self, buf: &mut Vec<u8>) {
        for v in [
            self.num_listeners, self.rcv, self.crc_err, self.proto_err, self.topo_err,
            self.no_listener, self.reply_timeout, self.confirm_timeout, self.sends,
        ] {
            buf.extend_from_slice(&v.to_be_bytes());
        }
    }

    fn read(buf: &[u8]) -> MdTransportStats {
        let mut v = [0u32; 9];
        for (i, slot) in v.iter_mut().enumerate() {
            *slot = BigEndian::read_u32(&buf[i * 4..]);
        }
        MdTransportStats {
            num_listeners: v[0], rcv: v[1], crc_err: v[2], proto_err: v[3], topo_err: v[4],
            no_listener: v[5], reply_timeout: v[6], confirm_timeout: v[7], sends: v[8],
        }
    }

    const WIRE_SIZE: usize = 9 * 4;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MdStats {
    pub udp: MdTransportStats,
    pub tcp: MdTransportStats,
}

/// The full statistics block, both the live counters and the fields
/// describing this session's identity (version/uptime/host names) that a
/// PULL requester needs.
#[derive(Debug, Clone)]
pub struct Statistics {
    pub version: u32,
    started_at: Instant,
    pub stats_interval: Duration,
    pub own_ip: u32,
    pub leader_ip: u32,
    pub host_name: String,
    pub leader_name: String,
    pub mem: MemStats,
    pub pd: PdStats,
    pub md: MdStats,
}

impl Statistics {
    pub fn new(version: u32, own_ip: u32, host_name: impl Into<String>) -> Statistics {
        Statistics {
            version,
            started_at: Instant::now(),
            stats_interval: Duration::from_secs(0),
            own_ip,
            leader_ip: 0,
            host_name: host_name.into(),
            leader_name: String::new(),
            mem: MemStats::default(),
            pd: PdStats::default(),
            md: MdStats::default(),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// `tlc_resetStatistics`: zeroes the counters without closing the
    /// session or touching identity fields.
    pub fn reset(&mut self) {
        self.pd = PdStats::default();
        self.md = MdStats::default();
        self.mem.alloc_err = 0;
        self.mem.free_err = 0;
    }

    /// Encodes the payload exactly as it goes out on ComID
    /// `TRDP_GLOBAL_STATISTICS_COMID`: version, wall-clock timestamp,
    /// uptime, interval, own/leader IP, host/leader names, memory, PD, MD.
    pub fn encode(&self, wall_clock_secs: u64) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::wire_size());
        buf.extend_from_slice(&self.version.to_be_bytes());
        buf.extend_from_slice(&wall_clock_secs.to_be_bytes());
        buf.extend_from_slice(&(self.uptime().as_secs() as u32).to_be_bytes());
        buf.extend_from_slice(&(self.stats_interval.as_secs() as u32).to_be_bytes());
        buf.extend_from_slice(&self.own_ip.to_be_bytes());
        buf.extend_from_slice(&self.leader_ip.to_be_bytes());
        write_name(&mut buf, &self.host_name);
        write_name(&mut buf, &self.leader_name);

        buf.extend_from_slice(&self.mem.total.to_be_bytes());
        buf.extend_from_slice(&self.mem.free.to_be_bytes());
        buf.extend_from_slice(&self.mem.min_free.to_be_bytes());
        buf.extend_from_slice(&self.mem.alloc_err.to_be_bytes());
        buf.extend_from_slice(&self.mem.free_err.to_be_bytes());
        for b in &self.mem.buckets {
            buf.extend_from_slice(&b.size.to_be_bytes());
            buf.extend_from_slice(&b.used.to_be_bytes());
        }

        self.pd.write(&mut buf);
        self.md.udp.write(&mut buf);
        self.md.tcp.write(&mut buf);
        buf
    }

    pub fn decode(buf: &[u8]) -> Option<Statistics> {
        if buf.len() < Self::wire_size() {
            return None;
        }
        let mut off = 0;
        let version = BigEndian::read_u32(&buf[off..]);
        off += 4;
        off += 8; // wall clock timestamp, not kept on the decoded side
        let uptime_secs = BigEndian::read_u32(&buf[off..]);
        off += 4;
        let interval_secs = BigEndian::read_u32(&buf[off..]);
        off += 4;
        let own_ip = BigEndian::read_u32(&buf[off..]);
        off += 4;
        let leader_ip = BigEndian::read_u32(&buf[off..]);
        off += 4;
        let host_name = read_name(&buf[off..off + NAME_LEN]);
        off += NAME_LEN;
        let leader_name = read_name(&buf[off..off + NAME_LEN]);
        off += NAME_LEN;

        let mut mem = MemStats {
            total: BigEndian::read_u32(&buf[off..]),
            free: BigEndian::read_u32(&buf[off + 4..]),
            min_free: BigEndian::read_u32(&buf[off + 8..]),
            alloc_err: BigEndian::read_u32(&buf[off + 12..]),
            free_err: BigEndian::read_u32(&buf[off + 16..]),
            buckets: [BucketUsage::default(); NUM_BUCKETS],
        };
        off += 20;
        for b in mem.buckets.iter_mut() {
            b.size = BigEndian::read_u32(&buf[off..]);
            b.used = BigEndian::read_u32(&buf[off + 4..]);
            off += 8;
        }

        let pd = PdStats::read(&buf[off..]);
        off += PdStats::WIRE_SIZE;
        let md_udp = MdTransportStats::read(&buf[off..]);
        off += MdTransportStats::WIRE_SIZE;
        let md_tcp = MdTransportStats::read(&buf[off..]);

        Some(Statistics {
            version,
            started_at: Instant::now() - Duration::from_secs(uptime_secs as u64),
            stats_interval: Duration::from_secs(interval_secs as u64),
            own_ip,
            leader_ip,
            host_name,
            leader_name,
            mem,
            pd,
            md: MdStats { udp: md_udp, tcp: md_tcp },
        })
    }

    const fn wire_size() -> usize {
        4 + 8 + 4 + 4 + 4 + 4 + NAME_LEN * 2 + 20 + NUM_BUCKETS * 8 + PdStats::WIRE_SIZE + MdTransportStats::WIRE_SIZE * 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        let mut stats = Statistics::new(0x0100, 0x0A000001, "loco-a");
        stats.pd.sends = 42;
        stats.pd.rcv = 41;
        stats.md.udp.sends = 3;
        stats.md.tcp.reply_timeout = 1;
        stats.mem.total = 1 << 20;

        let encoded = stats.encode(1_700_000_000);
        let decoded = Statistics::decode(&encoded).expect("decodes");
        assert_eq!(decoded.version, 0x0100);
        assert_eq!(decoded.own_ip, 0x0A000001);
        assert_eq!(decoded.host_name, "loco-a");
        assert_eq!(decoded.pd.sends, 42);
        assert_eq!(decoded.pd.rcv, 41);
        assert_eq!(decoded.md.udp.sends, 3);
        assert_eq!(decoded.md.tcp.reply_timeout, 1);
        assert_eq!(decoded.mem.total, 1 << 20);
    }

    #[test]
    fn reset_clears_counters_but_not_identity() {
        let mut stats = Statistics::new(1, 0, "h");
        stats.pd.rcv = 5;
        stats.md.tcp.sends = 2;
        stats.reset();
        assert_eq!(stats.pd.rcv, 0);
        assert_eq!(stats.md.tcp.sends, 0);
        assert_eq!(stats.version, 1);
        assert_eq!(stats.host_name, "h");
    }
}

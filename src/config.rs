//! Session configuration: plain structs with `Default` impls and
//! builder-style setters, mirroring the teacher's `tcp::Options` rather
//! than a `serde`-driven config file (the XML loader stays out of scope).

use std::time::Duration;

/// Sizing for the preallocated memory slab (see [`crate::memory`]).
#[derive(Debug, Clone)]
pub struct MemConfig {
    pub total_size: usize,
    pub bucket_sizes: Vec<usize>,
}

impl Default for MemConfig {
    fn default() -> Self {
        MemConfig {
            total_size: 1024 * 1024,
            bucket_sizes: vec![32, 64, 128, 256, 512, 1024, 2048, 4096],
        }
    }
}

impl MemConfig {
    pub fn new() -> Self {
        MemConfig::default()
    }

    pub fn total_size(mut self, n: usize) -> Self {
        self.total_size = n;
        self
    }

    pub fn bucket_sizes(mut self, sizes: Vec<usize>) -> Self {
        self.bucket_sizes = sizes;
        self
    }
}

/// PD-wide defaults applied when a publication/subscription doesn't
/// override them.
#[derive(Debug, Clone)]
pub struct PdConfig {
    pub port: u16,
    pub default_timeout: Duration,
    pub stagger_send_times: bool,
}

impl Default for PdConfig {
    fn default() -> Self {
        PdConfig {
            port: super::constant::PD_UDP_PORT,
            default_timeout: Duration::from_secs(3),
            stagger_send_times: true,
        }
    }
}

impl PdConfig {
    pub fn new() -> Self {
        PdConfig::default()
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn default_timeout(mut self, d: Duration) -> Self {
        self.default_timeout = d;
        self
    }

    pub fn stagger_send_times(mut self, v: bool) -> Self {
        self.stagger_send_times = v;
        self
    }
}

/// MD-wide defaults.
#[derive(Debug, Clone)]
pub struct MdConfig {
    pub udp_port: u16,
    pub tcp_port: u16,
    pub default_reply_timeout: Duration,
    pub default_confirm_timeout: Duration,
    pub tcp_connect_timeout: Duration,
    pub tcp_idle_timeout: Duration,
    pub max_retries: u32,
}

impl Default for MdConfig {
    fn default() -> Self {
        MdConfig {
            udp_port: super::constant::MD_UDP_PORT,
            tcp_port: super::constant::MD_TCP_PORT,
            default_reply_timeout: Duration::from_secs(5),
            default_confirm_timeout: Duration::from_secs(5),
            tcp_connect_timeout: Duration::from_secs(2),
            tcp_idle_timeout: Duration::from_secs(60),
            max_retries: 0,
        }
    }
}

impl MdConfig {
    pub fn new() -> Self {
        MdConfig::default()
    }

    pub fn default_reply_timeout(mut self, d: Duration) -> Self {
        self.default_reply_timeout = d;
        self
    }

    pub fn default_confirm_timeout(mut self, d: Duration) -> Self {
        self.default_confirm_timeout = d;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.max_retries = n;
        self
    }
}

/// Process-wide topocount and identity the session validates incoming
/// frames against.
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    pub etb_topo_cnt: u32,
    pub op_trn_topo_cnt: u32,
    pub host_name: String,
    pub leader_name: String,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        ProcessConfig {
            etb_topo_cnt: 0,
            op_trn_topo_cnt: 0,
            host_name: String::new(),
            leader_name: String::new(),
        }
    }
}

impl ProcessConfig {
    pub fn new() -> Self {
        ProcessConfig::default()
    }

    pub fn etb_topo_cnt(mut self, v: u32) -> Self {
        self.etb_topo_cnt = v;
        self
    }

    pub fn op_trn_topo_cnt(mut self, v: u32) -> Self {
        self.op_trn_topo_cnt = v;
        self
    }

    pub fn host_name(mut self, name: impl Into<String>) -> Self {
        self.host_name = name.into();
        self
    }
}

//! Listener table (`spec.md` §4.4): `addListener`/`delListener` and the
//! first-match predicate incoming MD frames are tested against.

use std::net::IpAddr;

/// Newtype index into `Session`'s listener arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerHandle(pub usize);

pub struct Listener {
    pub com_id: u32,
    pub etb_topo_cnt: u32,
    /// `None` matches any destination address.
    pub dst_ip: Option<IpAddr>,
    pub dst_uri: [u8; 32],
    pub user_ref: usize,
    pub callback: Option<Box<dyn FnMut(&Listener, super::engine::MdEvent) + Send>>,
}

impl Listener {
    pub fn new(
        com_id: u32,
        etb_topo_cnt: u32,
        dst_ip: Option<IpAddr>,
        dst_uri: [u8; 32],
        user_ref: usize,
        callback: Option<Box<dyn FnMut(&Listener, super::engine::MdEvent) + Send>>,
    ) -> Listener {
        Listener { com_id, etb_topo_cnt, dst_ip, dst_uri, user_ref, callback }
    }

    /// Predicate a received `Mr`/`Mn` is matched against; `comId` always
    /// matches exactly, `etbTopoCnt` follows the same zero-wildcard rule
    /// as PD, destination address and URI match only if specified.
    pub fn matches(&self, com_id: u32, etb_topo_cnt: u32, dst_ip: IpAddr, dst_uri: &[u8; 32]) -> bool {
        if self.com_id != com_id {
            return false;
        }
        if self.etb_topo_cnt != 0 && etb_topo_cnt != 0 && self.etb_topo_cnt != etb_topo_cnt {
            return false;
        }
        if let Some(expected) = self.dst_ip {
            if expected != dst_ip {
                return false;
            }
        }
        let uri_specified = self.dst_uri.iter().any(|&b| b != 0);
        if uri_specified && &self.dst_uri != dst_uri {
            return false;
        }
        true
    }
}

/// First-match lookup, in insertion (arena) order, as specified.
pub fn find_listener(
    listeners: &crate::arena::Arena<Listener>,
    com_id: u32,
    etb_topo_cnt: u32,
    dst_ip: IpAddr,
    dst_uri: &[u8; 32],
) -> Option<usize> {
    listeners.iter().find(|(_, l)| l.matches(com_id, etb_topo_cnt, dst_ip, dst_uri)).map(|(i, _)| i)
}

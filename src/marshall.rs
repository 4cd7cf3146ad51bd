//! Marshalling contract (spec.md §6): two opaque callbacks the engine
//! invokes when `PubFlags::MARSHALL`/`SubFlags::MARSHALL` is set on the
//! relevant element. The engine never inspects payload content itself —
//! dataset interpretation is deliberately out of scope.

use super::error::Error;

/// Converts an application-level dataset into its wire representation.
/// `ref_con` is the opaque user reference passed back unchanged, `com_id`
/// identifies the dataset, `src`/`dst` are the addressing pair the frame
/// will carry.
pub trait Marshall: Send {
    fn marshall(
        &self,
        ref_con: usize,
        com_id: u32,
        src: std::net::IpAddr,
        dst: std::net::IpAddr,
        data: &[u8],
    ) -> Result<Vec<u8>, Error>;

    fn unmarshall(
        &self,
        ref_con: usize,
        com_id: u32,
        src: std::net::IpAddr,
        dst: std::net::IpAddr,
        wire: &[u8],
    ) -> Result<Vec<u8>, Error>;
}

/// Identity marshaller used when `FLAGS_MARSHALL` is not set: the element's
/// bytes go straight to the wire and back.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMarshall;

impl Marshall for NoopMarshall {
    fn marshall(
        &self,
        _ref_con: usize,
        _com_id: u32,
        _src: std::net::IpAddr,
        _dst: std::net::IpAddr,
        data: &[u8],
    ) -> Result<Vec<u8>, Error> {
        Ok(data.to_vec())
    }

    fn unmarshall(
        &self,
        _ref_con: usize,
        _com_id: u32,
        _src: std::net::IpAddr,
        _dst: std::net::IpAddr,
        wire: &[u8],
    ) -> Result<Vec<u8>, Error> {
        Ok(wire.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn noop_marshall_is_identity() {
        let m = NoopMarshall;
        let ip = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let out = m.marshall(0, 1000, ip, ip, b"payload").unwrap();
        assert_eq!(out, b"payload");
        let back = m.unmarshall(0, 1000, ip, ip, &out).unwrap();
        assert_eq!(back, b"payload");
    }
}

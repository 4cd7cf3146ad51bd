//! MD session state machine (`spec.md` §4.4), one instance per outstanding
//! request/reply/confirm exchange, keyed by a 16-byte UUID.

use crate::error::Error;
use crate::md::listener::ListenerHandle;
use crate::socket::SockIdx;
use std::net::IpAddr;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub [u8; 16]);

impl SessionId {
    pub const ZERO: SessionId = SessionId([0u8; 16]);

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 16]
    }

    /// Generates a pseudo-unique id from a caller-supplied counter and a
    /// process-local salt; the engine has no dependency on a `uuid` crate
    /// since the spec only requires uniqueness within one process's
    /// lifetime, not RFC 4122 conformance.
    pub fn from_counter(salt: u64, counter: u64) -> SessionId {
        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&salt.to_be_bytes());
        bytes[8..].copy_from_slice(&counter.to_be_bytes());
        SessionId(bytes)
    }
}

/// One-way state machine per §4.4's transition table. Terminal states
/// (`Done`, the `*Timeout` variants, `Err`, `Aborted`) are never re-entered;
/// the session is dropped from the table right after its final callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MdState {
    ReqSent,
    ReqRcvd,
    ConfirmAwait,
    ConfirmSendable,
    Done,
    ReplyTimeout,
    ConfirmTimeout,
    AppTimeout,
    Err,
    Aborted,
}

impl MdState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            MdState::Done
                | MdState::ReplyTimeout
                | MdState::ConfirmTimeout
                | MdState::AppTimeout
                | MdState::Err
                | MdState::Aborted
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Requester,
    Responder,
}

pub struct MdSession {
    pub id: SessionId,
    pub role: Role,
    pub com_id: u32,
    pub peer_ip: IpAddr,
    pub state: MdState,
    pub num_replies: u32,
    pub no_of_repliers: u32, // 0 == unknown count
    pub num_retries: u32,
    pub num_retries_max: u32,
    pub reply_timeout: std::time::Duration,
    pub reply_deadline: Instant,
    pub confirm_deadline: Instant,
    pub listener: Option<ListenerHandle>,
    pub socket_idx: SockIdx,
    pub use_tcp: bool,
    pub source_uri: [u8; 32],
    pub dest_uri: [u8; 32],
    /// last frame sent for this session, kept so a retry can be
    /// re-transmitted (with a bumped sequence counter) without the
    /// caller having to re-supply the original payload.
    pub last_sent_buf: Vec<u8>,
}

impl MdSession {
    /// Validates and applies a transition per the table in §4.4; returns
    /// an error rather than silently ignoring an illegal move, since every
    /// transition here is one-way and violations indicate a protocol or
    /// caller bug.
    pub fn transition(&mut self, next: MdState) -> Result<(), Error> {
        let legal = matches!(
            (self.state, next),
            (MdState::ReqSent, MdState::Done)
                | (MdState::ReqSent, MdState::ConfirmSendable)
                | (MdState::ReqSent, MdState::ReplyTimeout)
                | (MdState::ReqSent, MdState::Err)
                | (MdState::ReqSent, MdState::Aborted)
                | (MdState::ReqRcvd, MdState::Done)
                | (MdState::ReqRcvd, MdState::ConfirmAwait)
                | (MdState::ReqRcvd, MdState::AppTimeout)
                | (MdState::ReqRcvd, MdState::Aborted)
                | (MdState::ConfirmAwait, MdState::Done)
                | (MdState::ConfirmAwait, MdState::ConfirmTimeout)
                | (MdState::ConfirmAwait, MdState::Aborted)
                | (MdState::ConfirmSendable, MdState::Done)
                | (MdState::ConfirmSendable, MdState::Aborted)
        );
        if !legal {
            return Err(Error::State(format!("{:?} -> {:?} is not a legal MD transition", self.state, next)));
        }
        self.state = next;
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// §4.4 "Repliers count": each `Mp`/`Mq` increments `numReplies`; the
    /// session is done once the expected count is reached (unknown count
    /// always waits the full timeout instead).
    pub fn reply_satisfied(&self) -> bool {
        self.no_of_repliers != 0 && self.num_replies >= self.no_of_repliers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Instant;

    fn session() -> MdSession {
        MdSession {
            id: SessionId::from_counter(1, 1),
            role: Role::Requester,
            com_id: 2002,
            peer_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            state: MdState::ReqSent,
            num_replies: 0,
            no_of_repliers: 1,
            num_retries: 0,
            num_retries_max: 0,
            reply_timeout: std::time::Duration::from_secs(5),
            reply_deadline: Instant::now(),
            confirm_deadline: Instant::now(),
            listener: None,
            socket_idx: SockIdx(0),
            use_tcp: false,
            source_uri: [0u8; 32],
            dest_uri: [0u8; 32],
            last_sent_buf: Vec::new(),
        }
    }

    #[test]
    fn req_sent_to_done_is_legal() {
        let mut s = session();
        assert!(s.transition(MdState::Done).is_ok());
        assert!(s.is_terminal());
    }

    #[test]
    fn terminal_state_is_never_reentered() {
        let mut s = session();
        s.transition(MdState::Done).unwrap();
        assert!(s.transition(MdState::ReqRcvd).is_err());
    }

    #[test]
    fn confirm_sendable_then_done_matches_mq_path() {
        let mut s = session();
        s.transition(MdState::ConfirmSendable).unwrap();
        assert!(s.transition(MdState::Done).is_ok());
    }

    #[test]
    fn reply_satisfied_waits_for_exact_count() {
        let mut s = session();
        s.no_of_repliers = 2;
        s.num_replies = 1;
        assert!(!s.reply_satisfied());
        s.num_replies = 2;
        assert!(s.reply_satisfied());
    }

    #[test]
    fn unknown_count_never_self_satisfies() {
        let mut s = session();
        s.no_of_repliers = 0;
        s.num_replies = 100;
        assert!(!s.reply_satisfied());
    }
}

// Copyright 2019 Petar Dambovaliev. All rights reserved.
// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! Error kinds reported by the engine.
//!
//! The enumeration mirrors the closed set of outcome kinds from the TRDP
//! error model: programmer errors, resource errors, session errors, protocol
//! errors and transactional errors. Errors on sending bubble to the caller;
//! errors on receiving are counted in the statistics block and the frame is
//! dropped (see [`crate::stats`]).

use std::error;
use std::fmt;
use std::io::{Error as IOError, ErrorKind};

#[derive(Debug)]
pub enum Error {
    /// a parameter passed by the caller was invalid
    Param(String),
    /// the engine was used before `Session::open`
    NoInit,
    /// `Session::open` was called on an already-open handle
    AlreadyInit,
    /// an operation is not legal in the caller's current state
    State(String),
    /// out of memory in the preallocated slab
    Mem,
    /// a socket operation failed
    Sock(String),
    /// an I/O error bubbled up from the OS
    Io(ErrorKind),
    /// the session's mutex was poisoned by a panicking thread
    Mutex,
    /// a send or receive queue is full
    QueueFull,
    /// the session handle does not exist (closed or never opened)
    NoSession,
    /// the session was aborted while a call was in flight
    SessionAbort,
    /// no subscription matches the given handle or addressing tuple
    NoSub,
    /// no publication matches the given handle or addressing tuple
    NoPub,
    /// no listener matches the given handle
    NoList,
    /// header CRC did not match
    Crc,
    /// the frame failed a structural wire check
    Wire(String),
    /// topocount validation failed
    Topo,
    /// no publication or subscription exists for the ComID
    ComId(u32),
    /// a reply or confirm deadline elapsed
    Timeout,
    /// MD reply deadline elapsed
    ReplyTo,
    /// MD confirm deadline elapsed
    ConfirmTo,
    /// requester never received the expected confirm
    ReqConfirmTo,
    /// the responder application failed to act before its deadline
    AppTimeout,
    /// `get` was called on a subscription that never received data
    NoData,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Param(s) => write!(f, "parameter error: {}", s),
            Error::NoInit => write!(f, "engine not initialized"),
            Error::AlreadyInit => write!(f, "session already open"),
            Error::State(s) => write!(f, "illegal state transition: {}", s),
            Error::Mem => write!(f, "out of memory"),
            Error::Sock(s) => write!(f, "socket error: {}", s),
            Error::Io(kind) => write!(f, "io error: {:?}", kind),
            Error::Mutex => write!(f, "mutex poisoned"),
            Error::QueueFull => write!(f, "queue full"),
            Error::NoSession => write!(f, "no such session"),
            Error::SessionAbort => write!(f, "session aborted"),
            Error::NoSub => write!(f, "no such subscription"),
            Error::NoPub => write!(f, "no such publication"),
            Error::NoList => write!(f, "no such listener"),
            Error::Crc => write!(f, "header crc mismatch"),
            Error::Wire(s) => write!(f, "malformed frame: {}", s),
            Error::Topo => write!(f, "topocount mismatch"),
            Error::ComId(id) => write!(f, "unknown comId {}", id),
            Error::Timeout => write!(f, "timeout"),
            Error::ReplyTo => write!(f, "reply timeout"),
            Error::ConfirmTo => write!(f, "confirm timeout"),
            Error::ReqConfirmTo => write!(f, "requester never confirmed"),
            Error::AppTimeout => write!(f, "application failed to reply in time"),
            Error::NoData => write!(f, "no data received yet"),
        }
    }
}

impl From<IOError> for Error {
    fn from(e: IOError) -> Self {
        Error::Io(e.kind())
    }
}

// This is important for other errors to wrap this one.
impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        None
    }
}

// Copyright 2019 Petar Dambovaliev. All rights reserved.
// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! A Rust implementation of the core of the TRDP (Train Real-time Data
//! Protocol) engine: the publish/subscribe Process Data (PD) and
//! transactional Message Data (MD) middleware used in rail vehicle
//! consists.
//!
//! This crate covers frame codec, send/receive queues, the MD session
//! state machine, the socket pool, topocount validation and PULL.
//! Marshalling against a dataset dictionary, XML configuration and the
//! wire-analyzer dissector stay external collaborators — only their
//! contracts (see [`marshall`]) are modeled here.
//!
//! # Examples
//! ```no_run
//! use trdp::pd::{PubFlags, RedundancyId};
//! use trdp::session::{Registry, Session};
//! use std::net::{IpAddr, Ipv4Addr};
//! use std::time::Duration;
//!
//! # fn main() -> Result<(), trdp::error::Error> {
//! let registry = Registry::new();
//! let own_ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 100));
//! let session = Session::open_default(&registry, own_ip)?;
//!
//! let handle = session.publish(
//!     1000,
//!     IpAddr::V4(Ipv4Addr::new(10, 0, 0, 200)),
//!     0,
//!     0,
//!     Duration::from_millis(1_000_000),
//!     RedundancyId::None,
//!     PubFlags::NONE,
//!     0,
//!     0,
//!     0,
//!     b"Hello World",
//! )?;
//! session.process()?;
//! session.unpublish(handle)?;
//! # Ok(())
//! # }
//! ```

pub mod arena;
pub mod config;
pub mod constant;
pub mod crc;
pub mod error;
pub mod frame;
pub mod marshall;
pub mod md;
pub mod memory;
pub mod pd;
pub mod session;
pub mod socket;
pub mod stats;

pub use error::Error;
pub use session::Session;

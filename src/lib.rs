//! ruvs - TCP data plane for a layer-4 virtual server.
//!
//! In-path packet mangling for a load balancer: connection admission,
//! classic-NAT and full-NAT header rewriting with incremental checksums, a
//! per-connection TCP state machine, and RST synthesis on expiry. The
//! surrounding framework (connection table, schedulers, SYN proxy, transmit
//! paths) plugs in through the traits in [`framework`].

pub mod config;
pub mod dataplane;
pub mod error;
pub mod framework;
pub mod packet;
pub mod protocol;
pub mod telemetry;

pub use error::{Error, Result};

//! End-to-end full-NAT flow tests
//!
//! Drive the protocol object with in-memory framework collaborators:
//! admission, handshake, data path, and expiry.
//!
//! Topology:
//! ```text
//! ┌──────────┐      ┌──────────────┐      ┌──────────┐
//! │  client  │─────▶│   balancer   │─────▶│ backend  │
//! │ 10.0.0.1 │ vip  │ 10.0.0.100   │local │ 10.1.0.5 │
//! └──────────┘      │ 10.2.0.2     │      └──────────┘
//!                   └──────────────┘
//! ```

mod data_path;
mod expiry;
mod handshake;
mod harness;

use harness::{make_harness, open_connection};

/// The first clean SYN is admitted, translated toward the backend, and
/// counted inactive on the destination until the handshake completes.
#[test]
fn first_syn_opens_connection() {
    let h = make_harness();
    let (conn, _) = open_connection(&h);

    assert!(conn.is_fullnat());
    assert_eq!(h.dest.inactive_conns.get(), 1);
    assert_eq!(h.dest.active_conns.get(), 0);
}

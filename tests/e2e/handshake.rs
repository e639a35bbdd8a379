//! Handshake tests
//!
//! The backend SYN|ACK travels the egress translator and moves the
//! connection into ESTABLISHED, with the destination counters and idle
//! timeouts following along.

use std::time::Duration;

use super::harness::{establish, make_harness, open_connection};

#[test]
fn syn_ack_establishes_and_counts_active() {
    let h = make_harness();
    let (conn, delta) = open_connection(&h);
    establish(&h, &conn, delta);

    assert_eq!(h.dest.active_conns.get(), 1);
    assert_eq!(h.dest.inactive_conns.get(), 0);
}

#[test]
fn established_timeout_is_moderate() {
    let h = make_harness();
    let (conn, delta) = open_connection(&h);
    assert_eq!(conn.timeout(), Duration::from_secs(3));

    establish(&h, &conn, delta);
    assert_eq!(conn.timeout(), Duration::from_secs(90));
}

//! Expiry tests
//!
//! Tearing down an established full-NAT connection synthesizes one RST
//! toward each peer, seeded from the saved backend sequence numbers.

use super::harness::{
    establish, make_harness, open_connection, segment_valid, tcp_header, CADDR, DADDR, LADDR,
    VADDR,
};

#[test]
fn expiry_resets_both_peers() {
    let h = make_harness();
    let (conn, delta) = open_connection(&h);
    establish(&h, &conn, delta);

    h.proto.conn_expire_handler(&conn);

    let to_backend = h.transmit.to_backend.lock().unwrap();
    assert_eq!(to_backend.len(), 1);
    let th = tcp_header(&to_backend[0]);
    assert!(th.flags().rst);
    assert_eq!(th.ack_seq(), 0);
    assert_eq!(th.data_offset(), 5);
    // rs_ack_seq pulled back into the client sequence space.
    assert_eq!(th.seq(), conn.rs_ack_seq().wrapping_sub(delta));
    assert_eq!(th.seq(), 1001);
    assert!(segment_valid(&to_backend[0], CADDR, VADDR));

    let to_client = h.transmit.to_client.lock().unwrap();
    assert_eq!(to_client.len(), 1);
    let th = tcp_header(&to_client[0]);
    assert!(th.flags().rst);
    assert_eq!(th.ack_seq(), 0);
    assert_eq!(th.seq(), conn.rs_end_seq());
    assert_eq!(th.seq(), 9001);
    assert!(segment_valid(&to_client[0], DADDR, LADDR));
}

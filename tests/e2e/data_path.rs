//! Data-path tests
//!
//! Established-connection traffic: the client-address option goes out on
//! the first data-carrying segment only, and backend SACK blocks are
//! shifted back into the client sequence space.

use ruvs::dataplane::ConnFlags;
use ruvs::framework::Direction;
use ruvs::protocol::ipv4;
use ruvs::protocol::tcp::{TcpOptionIter, OPT_CLIENT_ADDR, OPT_SACK};

use super::harness::{
    establish, make_harness, make_packet, open_connection, segment_valid, tcp_header, CADDR,
    CPORT, DADDR, DPORT, LADDR, LPORT, VADDR, VPORT,
};

#[test]
fn first_data_segment_carries_client_address_option() {
    let h = make_harness();
    let (conn, delta) = open_connection(&h);
    establish(&h, &conn, delta);

    // Handshake ACK plus 100 bytes of data at the first data sequence.
    let mut data = make_packet(
        CADDR,
        VADDR,
        CPORT,
        VPORT,
        1001,
        9001,
        0x18,
        &[],
        &[0x55; 100],
    );
    assert!(h.proto.fnat_in_handler(&mut data, &conn));
    assert!(h.proto.state_transition(&conn, Direction::Output, &data));

    let th = tcp_header(&data);
    assert_eq!(th.data_offset(), 7);
    let option = TcpOptionIter::new(th.options()).next().unwrap();
    assert_eq!(option.kind, OPT_CLIENT_ADDR);
    let opts = th.options();
    assert_eq!(u16::from_be_bytes([opts[2], opts[3]]), CPORT);
    assert_eq!(&opts[4..8], &[10, 0, 0, 1]);

    // Sequence shifted into the backend space; payload intact.
    assert_eq!(th.seq(), 1001u32.wrapping_add(delta));
    assert_eq!(th.payload().len(), 100);
    assert!(segment_valid(&data, LADDR, DADDR));
    assert!(conn.has_flag(ConnFlags::CIP_INSERTED));

    let ip = ipv4::Ipv4Header::parse(data.data()).unwrap();
    assert_eq!(ip.total_length() as usize, data.len());

    // The second segment is delivered unchanged apart from the rewrite.
    let mut next = make_packet(
        CADDR,
        VADDR,
        CPORT,
        VPORT,
        1101,
        9001,
        0x18,
        &[],
        &[0x66; 40],
    );
    assert!(h.proto.fnat_in_handler(&mut next, &conn));
    let th = tcp_header(&next);
    assert_eq!(th.data_offset(), 5);
    assert!(TcpOptionIter::new(th.options()).next().is_none());
    assert!(conn.has_flag(ConnFlags::CIP_INSERTED));
    assert!(segment_valid(&next, LADDR, DADDR));
}

#[test]
fn sack_blocks_shift_back_into_client_space() {
    let h = make_harness();
    let (conn, delta) = open_connection(&h);
    establish(&h, &conn, delta);

    let mut options = vec![1u8, 1, OPT_SACK, 10];
    options.extend_from_slice(&1500u32.wrapping_add(delta).to_be_bytes());
    options.extend_from_slice(&1700u32.wrapping_add(delta).to_be_bytes());
    let mut pkt = make_packet(
        DADDR,
        LADDR,
        DPORT,
        LPORT,
        9001,
        1001u32.wrapping_add(delta),
        0x10,
        &options,
        b"",
    );

    assert!(h.proto.fnat_out_handler(&mut pkt, &conn));

    let th = tcp_header(&pkt);
    assert_eq!(th.ack_seq(), 1001);
    let opts = th.options();
    assert_eq!(u32::from_be_bytes([opts[4], opts[5], opts[6], opts[7]]), 1500);
    assert_eq!(
        u32::from_be_bytes([opts[8], opts[9], opts[10], opts[11]]),
        1700
    );
    // All other option bytes are untouched.
    assert_eq!(&opts[..4], &[1, 1, OPT_SACK, 10]);
    assert!(segment_valid(&pkt, VADDR, CADDR));
}

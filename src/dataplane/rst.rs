//! RST synthesis on connection expiry.
//!
//! When an idle connection is torn down, both peers still believe it is
//! open. For NAT and full-NAT modes a minimal RST is composed toward each
//! side, seeded from the sequence numbers the tracker saved, and handed to
//! the framework's transmit paths.

use std::net::IpAddr;

use tracing::{debug, warn};

use crate::config::TcpConfig;
use crate::dataplane::conn::{Conn, ConnFlags};
use crate::dataplane::state::TcpState;
use crate::framework::Transmit;
use crate::packet::{AddrFamily, PacketBuf};
use crate::protocol::tcp::{TcpHeader, MIN_HEADER_SIZE};
use crate::protocol::{checksum, ipv4, ipv6, tcp};
use crate::telemetry::MetricsRegistry;

/// Bare RST segment: ports, a seed sequence, data offset 5, RST set.
fn build_rst_segment(src_port: u16, dst_port: u16, seq: u32) -> [u8; MIN_HEADER_SIZE] {
    let mut seg = [0u8; MIN_HEADER_SIZE];
    seg[0..2].copy_from_slice(&src_port.to_be_bytes());
    seg[2..4].copy_from_slice(&dst_port.to_be_bytes());
    seg[4..8].copy_from_slice(&seq.to_be_bytes());
    // ack_seq stays zero
    seg[12] = 0x50; // data offset 5
    seg[13] = 0x04; // RST
    seg
}

/// Wrap a segment in an IP header for the given address pair and store the
/// TCP checksum.
fn build_rst_packet(src: IpAddr, dst: IpAddr, mut seg: [u8; MIN_HEADER_SIZE]) -> Option<PacketBuf> {
    let check = checksum::tcp_checksum(src, dst, &seg);
    seg[16..18].copy_from_slice(&check.to_be_bytes());

    let data = match (src, dst) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => ipv4::Ipv4Builder::new()
            .src_addr(src)
            .dst_addr(dst)
            .protocol(tcp::PROTOCOL_NUMBER)
            .dont_fragment(true)
            .payload(&seg)
            .build(),
        (IpAddr::V6(src), IpAddr::V6(dst)) => ipv6::Ipv6Builder::new()
            .src_addr(src)
            .dst_addr(dst)
            .next_header(tcp::PROTOCOL_NUMBER)
            .payload(&seg)
            .build(),
        _ => return None,
    };
    Some(PacketBuf::new(data))
}

/// Sequence numbers of the ACK parked in the connection's single-slot queue.
fn stored_ack_seqs(conn: &Conn, af: AddrFamily) -> Option<(u32, u32)> {
    conn.ack_slot
        .peek(|pkt| {
            let l4_offset = pkt.l4_offset(af).ok()?;
            let tcph = TcpHeader::parse(&pkt.data()[l4_offset..]).ok()?;
            Some((tcph.seq(), tcph.ack_seq()))
        })
        .flatten()
}

/// Send a reset toward the backend. Addresses and ports are the pre-NAT
/// identities; the connection's transmit path applies the usual ingress
/// translation downstream.
pub(crate) fn send_rst_in(conn: &Conn, transmit: &dyn Transmit) {
    let state = conn.state();

    let seq = if state == TcpState::SynSent {
        match stored_ack_seqs(conn, conn.af()) {
            Some((seq, _)) => seq,
            None => {
                debug!("no stored ack to seed backend reset");
                return;
            }
        }
    } else if state == TcpState::Established {
        let mut seq = conn.rs_ack_seq();
        if conn.is_fullnat() {
            seq = seq.wrapping_sub(conn.fnat_seq.lock().unwrap().delta);
        }
        seq
    } else {
        debug!(state = state.name(), "not resetting backend in this state");
        return;
    };

    let seg = build_rst_segment(conn.cport, conn.vport, seq);
    let Some(pkt) = build_rst_packet(conn.caddr, conn.vaddr, seg) else {
        warn!("address family mismatch composing backend reset");
        return;
    };

    debug!(seq, "reset toward backend");
    transmit.packet_xmit(pkt, conn);
}

/// Send a reset toward the client via the response path for the connection's
/// mode.
pub(crate) fn send_rst_out(conn: &Conn, transmit: &dyn Transmit) {
    let state = conn.state();

    let seq = if state == TcpState::SynSent {
        match stored_ack_seqs(conn, conn.af()) {
            Some((_, ack_seq)) => ack_seq.wrapping_sub(conn.syn_proxy_seq.delta),
            None => {
                debug!("no stored ack to seed client reset");
                return;
            }
        }
    } else if state == TcpState::Established {
        conn.rs_end_seq()
    } else {
        debug!(state = state.name(), "not resetting client in this state");
        return;
    };

    let dst_port = if conn.is_fullnat() {
        conn.lport
    } else {
        conn.cport
    };
    let seg = build_rst_segment(conn.dport, dst_port, seq);
    let Some(pkt) = build_rst_packet(conn.daddr, conn.laddr, seg) else {
        warn!("address family mismatch composing client reset");
        return;
    };

    debug!(seq, "reset toward client");
    if conn.is_fullnat() {
        transmit.fnat_response_xmit(pkt, conn);
    } else {
        transmit.normal_response_xmit(pkt, conn);
    }
}

/// Expiry dispatcher: reset both peers of NAT and full-NAT connections.
pub(crate) fn conn_expire_handler(
    config: &TcpConfig,
    metrics: &MetricsRegistry,
    conn: &Conn,
    transmit: &dyn Transmit,
) {
    if config.rst_on_expire && (conn.is_fullnat() || conn.is_masq()) {
        send_rst_in(conn, transmit);
        send_rst_out(conn, transmit);
        metrics.expire_rst_sent.inc();
    }
}

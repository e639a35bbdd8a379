//! TCP option mangling.
//!
//! Every routine here is a filter over the option walk in
//! [`crate::protocol::tcp::TcpOptionIter`]: MSS shrinking on backend
//! SYN|ACKs, timestamp removal on client SYNs, SACK shifting for full NAT,
//! and injection of the 8-byte client-address option.

use std::net::IpAddr;

use tracing::debug;

use crate::dataplane::conn::{Conn, ConnFlags};
use crate::dataplane::seq::seq_after;
use crate::packet::{AddrFamily, PacketBuf};
use crate::protocol::tcp::{
    TcpHeader, TcpOptionIter, OPT_CLIENT_ADDR, OPT_CLIENT_ADDR_LEN, OPT_MSS, OPT_MSS_LEN, OPT_NOP,
    OPT_SACK, OPT_SACK_BASE, OPT_SACK_PER_BLOCK, OPT_TIMESTAMP, OPT_TIMESTAMP_LEN,
};
use crate::protocol::{ipv4, tcp};
use crate::telemetry::MetricsRegistry;

/// Shrink the advertised MSS by the on-wire size of the client-address
/// option so backend segments still fit once the option is injected.
/// Applied to backend-to-client SYN|ACKs.
pub(crate) fn adjust_mss(options: &mut [u8]) {
    let mss = TcpOptionIter::new(options)
        .find(|o| o.kind == OPT_MSS && o.len == OPT_MSS_LEN);

    if let Some(o) = mss {
        let at = o.offset + 2;
        let value = u16::from_be_bytes([options[at], options[at + 1]]);
        let shrunk = value.saturating_sub(OPT_CLIENT_ADDR_LEN as u16);
        options[at..at + 2].copy_from_slice(&shrunk.to_be_bytes());
    }
}

/// Overwrite the timestamp option with NOPs. Local addresses shared by many
/// clients would otherwise present inconsistent timestamps to the backend.
/// Applied to client-to-backend SYNs; the caller recomputes the checksum.
pub(crate) fn remove_timestamp(options: &mut [u8]) {
    let ts = TcpOptionIter::new(options)
        .find(|o| o.kind == OPT_TIMESTAMP && o.len == OPT_TIMESTAMP_LEN);

    if let Some(o) = ts {
        for byte in &mut options[o.offset..o.offset + OPT_TIMESTAMP_LEN] {
            *byte = OPT_NOP;
        }
    }
}

/// Subtract `delta` from every 32-bit sequence value of every SACK block.
/// Applied on the backend-to-client path of full-NAT connections.
pub(crate) fn adjust_sack(options: &mut [u8], delta: u32) {
    let sack = TcpOptionIter::new(options).find(|o| {
        o.kind == OPT_SACK
            && o.len >= OPT_SACK_BASE + OPT_SACK_PER_BLOCK
            && (o.len - OPT_SACK_BASE) % OPT_SACK_PER_BLOCK == 0
    });

    if let Some(o) = sack {
        let mut at = o.offset + OPT_SACK_BASE;
        let end = o.offset + o.len;
        while at < end {
            let value = u32::from_be_bytes([
                options[at],
                options[at + 1],
                options[at + 2],
                options[at + 3],
            ]);
            options[at..at + 4].copy_from_slice(&value.wrapping_sub(delta).to_be_bytes());
            at += 4;
        }
    }
}

/// Inject the client-address option on the first data-carrying segment of a
/// full-NAT connection: grow the packet by 8 bytes, shift the existing
/// options and payload right, and write `{kind, len, cport, caddr}` at the
/// head of the options area. IPv4 only.
///
/// Once the stream has advanced past the first data sequence - or an
/// injection has happened, or would not fit the path MTU - the connection is
/// marked so no further attempt is made. The caller recomputes the TCP
/// checksum; the IP header is fixed up here.
pub(crate) fn insert_client_addr(pkt: &mut PacketBuf, conn: &Conn, metrics: &MetricsRegistry) {
    let IpAddr::V4(caddr) = conn.caddr else {
        metrics.client_addr_fail_family.inc();
        return;
    };

    let Ok(l4_offset) = pkt.l4_offset(AddrFamily::V4) else {
        return;
    };
    let Ok(tcph) = TcpHeader::parse(&pkt.data()[l4_offset..]) else {
        return;
    };
    let seq = tcph.seq();
    let data_offset = tcph.data_offset();

    if seq_after(seq, conn.fnat_seq.lock().unwrap().fdata_seq) {
        conn.set_flag(ConnFlags::CIP_INSERTED);
        return;
    }

    // Room check against the path MTU and the header length ceiling.
    if pkt.len() + OPT_CLIENT_ADDR_LEN > pkt.mtu()
        || (data_offset as usize) * 4 + OPT_CLIENT_ADDR_LEN > tcp::MAX_HEADER_SIZE
    {
        metrics.client_addr_fail_len.inc();
        conn.set_flag(ConnFlags::CIP_INSERTED);
        return;
    }

    // Shift options and payload right by the option size.
    let options_start = l4_offset + tcp::MIN_HEADER_SIZE;
    pkt.expand_at(options_start, OPT_CLIENT_ADDR_LEN);

    let data = pkt.data_mut();
    data[options_start] = OPT_CLIENT_ADDR;
    data[options_start + 1] = OPT_CLIENT_ADDR_LEN as u8;
    data[options_start + 2..options_start + 4].copy_from_slice(&conn.cport.to_be_bytes());
    data[options_start + 4..options_start + 8].copy_from_slice(&caddr.octets());

    // Data offset grows by two words; IP total length by the option size.
    data[l4_offset + 12] = (data_offset + (OPT_CLIENT_ADDR_LEN / 4) as u8) << 4
        | (data[l4_offset + 12] & 0x0F);
    let total_len = u16::from_be_bytes([data[2], data[3]]) + OPT_CLIENT_ADDR_LEN as u16;
    ipv4::set_total_length(&mut data[..l4_offset], total_len);

    conn.set_flag(ConnFlags::CIP_INSERTED);
    metrics.client_addr_inserted.inc();
    debug!(client = %conn.caddr, port = conn.cport, "client address option injected");
}

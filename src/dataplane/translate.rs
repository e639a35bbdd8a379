//! Packet translators.
//!
//! Four header-rewrite paths share this module: classic-NAT egress (SNAT)
//! and ingress (DNAT), and the two full-NAT paths that additionally shift
//! sequence numbers and mangle options. Every handler requires exclusive
//! access to the packet, reads old header values from the connection before
//! writing, and leaves a checksum that verifies for the mutated packet.

use std::net::IpAddr;

use tracing::debug;

use crate::config::TcpConfig;
use crate::dataplane::conn::{Conn, ConnFlags};
use crate::dataplane::seq::IsnGenerator;
use crate::dataplane::{options, seq};
use crate::framework::SynProxy;
use crate::packet::{AddrFamily, ChecksumState, PacketBuf};
use crate::protocol::tcp::{TcpHeaderMut, MIN_HEADER_SIZE};
use crate::protocol::{checksum, ipv4, ipv6};
use crate::telemetry::MetricsRegistry;

/// Dependencies shared by the translator entry points.
pub(crate) struct TranslateCtx<'a> {
    pub config: &'a TcpConfig,
    pub synproxy: &'a dyn SynProxy,
    pub isn_gen: &'a IsnGenerator,
    pub metrics: &'a MetricsRegistry,
}

/// Source and destination addresses as the packet currently carries them.
fn packet_addrs(pkt: &PacketBuf, af: AddrFamily) -> crate::Result<(IpAddr, IpAddr)> {
    match af {
        AddrFamily::V4 => {
            let header = ipv4::Ipv4Header::parse(pkt.data())?;
            Ok((header.src_addr().into(), header.dst_addr().into()))
        }
        AddrFamily::V6 => {
            let header = ipv6::Ipv6Header::parse(pkt.data())?;
            Ok((header.src_addr().into(), header.dst_addr().into()))
        }
    }
}

/// Verify the TCP checksum of an ingress packet. Packets whose checksum was
/// already verified (or is carried partially for offload) pass through.
pub(crate) fn csum_check(af: AddrFamily, pkt: &PacketBuf) -> bool {
    let Ok(l4_offset) = pkt.l4_offset(af) else {
        return false;
    };

    match pkt.csum_state() {
        ChecksumState::None | ChecksumState::Complete => {
            let Ok((src, dst)) = packet_addrs(pkt, af) else {
                return false;
            };
            if !checksum::tcp_checksum_valid(src, dst, &pkt.data()[l4_offset..]) {
                debug!("tcp checksum verification failed");
                return false;
            }
            true
        }
        ChecksumState::Partial | ChecksumState::Unnecessary => true,
    }
}

/// Run the application-helper hooks before mangling: verify the checksum,
/// then give the helper its chance to rewrite the payload. False drops.
fn app_gate(pkt: &mut PacketBuf, conn: &Conn, af: AddrFamily, egress: bool) -> bool {
    let Some(app) = conn.app() else {
        return true;
    };

    if !csum_check(af, pkt) {
        return false;
    }
    if egress {
        app.pkt_out(conn, pkt)
    } else {
        app.pkt_in(conn, pkt)
    }
}

/// Classic-NAT egress: backend-to-client packets leave with the virtual
/// source port. Also used for direct-return replies.
pub(crate) fn snat_handler(ctx: &TranslateCtx<'_>, pkt: &mut PacketBuf, conn: &Conn) -> bool {
    let af = conn.af();
    let Ok(l4_offset) = pkt.ensure_l4_window(af, MIN_HEADER_SIZE) else {
        return false;
    };
    let old_len = pkt.len() - l4_offset;

    if !app_gate(pkt, conn, af, true) {
        return false;
    }

    let new_len = pkt.len() - l4_offset;
    let csum_state = pkt.csum_state();
    let has_app = conn.app().is_some();
    let mut downgrade_complete = false;

    {
        let seg = &mut pkt.data_mut()[l4_offset..];
        let Ok(mut tcph) = TcpHeaderMut::parse(seg) else {
            return false;
        };

        seq::save_out_seq(ctx.config, conn, &tcph);
        tcph.set_src_port(conn.vport);

        if !ctx.synproxy.snat_handler(&mut tcph, conn) {
            return false;
        }

        match csum_state {
            ChecksumState::Partial => {
                let check = checksum::partial_update(
                    tcph.checksum(),
                    conn.daddr,
                    conn.vaddr,
                    old_len as u16,
                    new_len as u16,
                );
                tcph.set_checksum(check);
            }
            _ if !has_app => {
                let check = checksum::fast_update(
                    tcph.checksum(),
                    conn.daddr,
                    conn.vaddr,
                    conn.dport,
                    conn.vport,
                );
                tcph.set_checksum(check);
                downgrade_complete = csum_state == ChecksumState::Complete;
            }
            _ => {
                tcph.set_checksum(0);
                let check = checksum::tcp_checksum(conn.vaddr, conn.caddr, tcph.as_bytes());
                tcph.set_checksum(check);
            }
        }
    }

    if downgrade_complete {
        pkt.set_csum_state(ChecksumState::None);
    }
    true
}

/// Classic-NAT ingress: client-to-backend packets get the backend
/// destination port.
pub(crate) fn dnat_handler(ctx: &TranslateCtx<'_>, pkt: &mut PacketBuf, conn: &Conn) -> bool {
    let af = conn.af();
    let Ok(l4_offset) = pkt.ensure_l4_window(af, MIN_HEADER_SIZE) else {
        return false;
    };
    let old_len = pkt.len() - l4_offset;

    if !app_gate(pkt, conn, af, false) {
        return false;
    }

    let new_len = pkt.len() - l4_offset;
    let csum_state = pkt.csum_state();
    let has_app = conn.app().is_some();
    let mut downgrade_complete = false;
    let mut mark_unnecessary = false;

    {
        let seg = &mut pkt.data_mut()[l4_offset..];
        let Ok(mut tcph) = TcpHeaderMut::parse(seg) else {
            return false;
        };

        tcph.set_dst_port(conn.dport);
        ctx.synproxy.dnat_handler(&mut tcph, &conn.syn_proxy_seq);

        match csum_state {
            ChecksumState::Partial => {
                let check = checksum::partial_update(
                    tcph.checksum(),
                    conn.vaddr,
                    conn.daddr,
                    old_len as u16,
                    new_len as u16,
                );
                tcph.set_checksum(check);
            }
            _ if !has_app => {
                let check = checksum::fast_update(
                    tcph.checksum(),
                    conn.vaddr,
                    conn.daddr,
                    conn.vport,
                    conn.dport,
                );
                tcph.set_checksum(check);
                downgrade_complete = csum_state == ChecksumState::Complete;
            }
            _ => {
                tcph.set_checksum(0);
                let check = checksum::tcp_checksum(conn.caddr, conn.daddr, tcph.as_bytes());
                tcph.set_checksum(check);
                mark_unnecessary = true;
            }
        }
    }

    if downgrade_complete {
        pkt.set_csum_state(ChecksumState::None);
    }
    if mark_unnecessary {
        pkt.set_csum_state(ChecksumState::Unnecessary);
    }
    true
}

/// Full-NAT ingress: rewrite both endpoints toward the backend, strip the
/// timestamp and seed the sequence context on the first SYN, inject the
/// client-address option when due, shift into the backend sequence space,
/// and recompute the checksum over the (laddr, daddr) pseudo-header. The
/// packet buffer may grow in place.
pub(crate) fn fnat_in_handler(ctx: &TranslateCtx<'_>, pkt: &mut PacketBuf, conn: &Conn) -> bool {
    let af = conn.af();
    if pkt.ensure_l4_window(af, MIN_HEADER_SIZE).is_err() {
        return false;
    }

    if !app_gate(pkt, conn, af, false) {
        return false;
    }

    let Ok(l4_offset) = pkt.l4_offset(af) else {
        return false;
    };

    let flags = {
        let seg = &mut pkt.data_mut()[l4_offset..];
        let Ok(mut tcph) = TcpHeaderMut::parse(seg) else {
            return false;
        };

        tcph.set_src_port(conn.lport);
        tcph.set_dst_port(conn.dport);

        let flags = tcph.flags();
        if flags.is_syn_only() {
            // Different clients behind one local address would otherwise
            // show the backend inconsistent timestamps.
            if ctx.config.remove_timestamp {
                options::remove_timestamp(tcph.options_mut());
            }
            seq::init_in_seq(ctx.config, ctx.isn_gen, ctx.metrics, conn, &tcph);
        }
        flags
    };

    if ctx.config.insert_client_addr
        && !conn.has_flag(ConnFlags::CIP_INSERTED)
        && !flags.syn
        && !flags.rst
        && !flags.fin
    {
        options::insert_client_addr(pkt, conn, ctx.metrics);
    }

    // The injector may have reshaped the packet; take a fresh view.
    {
        let seg = &mut pkt.data_mut()[l4_offset..];
        let Ok(mut tcph) = TcpHeaderMut::parse(seg) else {
            return false;
        };

        seq::adjust_in_seq(ctx.synproxy, conn, &mut tcph);

        tcph.set_checksum(0);
        let check = checksum::tcp_checksum(conn.laddr, conn.daddr, tcph.as_bytes());
        tcph.set_checksum(check);
    }
    pkt.set_csum_state(ChecksumState::Unnecessary);

    true
}

/// Full-NAT egress: rewrite both endpoints toward the client, shrink the MSS
/// on SYN|ACKs, shift back into the client sequence space (the SYN proxy may
/// refuse on an ACK storm), and recompute the checksum over the
/// (vaddr, caddr) pseudo-header.
pub(crate) fn fnat_out_handler(ctx: &TranslateCtx<'_>, pkt: &mut PacketBuf, conn: &Conn) -> bool {
    let af = conn.af();
    let Ok(l4_offset) = pkt.ensure_l4_window(af, MIN_HEADER_SIZE) else {
        return false;
    };

    if !app_gate(pkt, conn, af, true) {
        return false;
    }

    let seg = &mut pkt.data_mut()[l4_offset..];
    let Ok(mut tcph) = TcpHeaderMut::parse(seg) else {
        return false;
    };

    seq::save_out_seq(ctx.config, conn, &tcph);
    tcph.set_src_port(conn.vport);
    tcph.set_dst_port(conn.cport);

    if tcph.flags().is_syn_ack() && ctx.config.adjust_mss {
        options::adjust_mss(tcph.options_mut());
    }

    if !seq::adjust_out_seq(ctx.synproxy, conn, &mut tcph) {
        return false;
    }

    tcph.set_checksum(0);
    let check = checksum::tcp_checksum(conn.vaddr, conn.caddr, tcph.as_bytes());
    tcph.set_checksum(check);

    true
}

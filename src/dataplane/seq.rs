//! Per-connection sequence tracking.
//!
//! Full NAT gives every connection a locally chosen ISN toward the backend,
//! so both directions must be shifted by a fixed delta. This module owns that
//! delta, remembers the backend's last in-order seq/ack for RST seeding, and
//! hosts the keyed ISN generator.

use std::net::IpAddr;

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::config::TcpConfig;
use crate::dataplane::conn::Conn;
use crate::dataplane::state::TcpState;
use crate::framework::SynProxy;
use crate::protocol::tcp::TcpHeaderMut;
use crate::telemetry::MetricsRegistry;

/// Wrap-aware sequence comparison: true when `a` is strictly before `b`.
pub fn seq_before(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// Wrap-aware sequence comparison: true when `a` is strictly after `b`.
pub fn seq_after(a: u32, b: u32) -> bool {
    seq_before(b, a)
}

/// Deterministic secure ISN source, keyed by a boot-time secret over the
/// local/backend four-tuple.
#[derive(Debug, Clone)]
pub struct IsnGenerator {
    secret: [u8; 32],
}

impl IsnGenerator {
    pub fn new(secret: [u8; 32]) -> Self {
        Self { secret }
    }

    /// ISN for the (laddr, daddr, lport, dport) tuple, IPv4 or IPv6.
    pub fn isn(&self, laddr: IpAddr, daddr: IpAddr, lport: u16, dport: u16) -> u32 {
        let mut hasher = Sha256::new();
        hasher.update(self.secret);
        match laddr {
            IpAddr::V4(a) => hasher.update(a.octets()),
            IpAddr::V6(a) => hasher.update(a.octets()),
        }
        match daddr {
            IpAddr::V4(a) => hasher.update(a.octets()),
            IpAddr::V6(a) => hasher.update(a.octets()),
        }
        hasher.update(lport.to_be_bytes());
        hasher.update(dport.to_be_bytes());

        let digest = hasher.finalize();
        u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
    }
}

/// Record the backend's last in-order seq/ack on a backend-to-client packet,
/// for seeding expiry RSTs. Out-of-order acks are skipped.
pub(crate) fn save_out_seq(config: &TcpConfig, conn: &Conn, tcph: &TcpHeaderMut<'_>) {
    if !config.rst_on_expire || tcph.flags().rst {
        return;
    }

    let ack_seq = tcph.ack_seq();
    if seq_before(ack_seq, conn.rs_ack_seq()) && conn.rs_ack_seq() != 0 {
        return;
    }

    let end_seq = if tcph.flags().is_syn_ack() {
        tcph.seq().wrapping_add(1)
    } else {
        tcph.seq().wrapping_add(tcph.payload_len() as u32)
    };
    conn.set_rs_end_seq(end_seq);
    conn.set_rs_ack_seq(ack_seq);

    debug!(
        seq = tcph.seq(),
        ack_seq,
        src = tcph.src_port(),
        dst = tcph.dst_port(),
        "saved backend sequence"
    );
}

/// Initialize the backend-side sequence context on a client SYN (no ACK).
///
/// Sets the first-data mark, clears the client-address-option flag, and picks
/// a fresh ISN when none exists yet, or when connection reuse is allowed and
/// the connection is still in a handshake state. The ISN is therefore
/// assigned at most twice over a connection's lifetime.
pub(crate) fn init_in_seq(
    config: &TcpConfig,
    isn_gen: &IsnGenerator,
    metrics: &MetricsRegistry,
    conn: &Conn,
    tcph: &TcpHeaderMut<'_>,
) {
    use crate::dataplane::conn::ConnFlags;

    let client_seq = tcph.seq();
    let state = conn.state();
    let mut fseq = conn.fnat_seq.lock().unwrap();

    fseq.fdata_seq = client_seq.wrapping_add(1);
    conn.clear_flag(ConnFlags::CIP_INSERTED);

    let reused = config.allow_conn_reuse
        && fseq.init_seq != 0
        && (state == TcpState::SynSent || state == TcpState::SynRecv);

    if fseq.init_seq == 0 || reused {
        fseq.init_seq = isn_gen.isn(conn.laddr, conn.daddr, conn.lport, conn.dport);
        fseq.delta = fseq.init_seq.wrapping_sub(client_seq);

        if reused {
            metrics.conn_reused.inc();
            match conn.old_state() {
                TcpState::Close => metrics.conn_reused_close.inc(),
                TcpState::TimeWait => metrics.conn_reused_timewait.inc(),
                TcpState::FinWait => metrics.conn_reused_finwait.inc(),
                TcpState::CloseWait => metrics.conn_reused_closewait.inc(),
                TcpState::LastAck => metrics.conn_reused_lastack.inc(),
                TcpState::Established => metrics.conn_reused_established.inc(),
                _ => {}
            }
        }
    }
}

/// Shift a client-to-backend packet into the backend sequence space, then
/// let the SYN proxy fix up ack_seq and SACK blocks.
pub(crate) fn adjust_in_seq(synproxy: &dyn SynProxy, conn: &Conn, tcph: &mut TcpHeaderMut<'_>) {
    let delta = conn.fnat_seq.lock().unwrap().delta;
    let seq = tcph.seq();
    tcph.set_seq(seq.wrapping_add(delta));

    synproxy.dnat_handler(tcph, &conn.syn_proxy_seq);
}

/// Shift a backend-to-client packet into the client sequence space: offer it
/// to the SYN proxy first (which may refuse it on an ACK storm), then pull
/// the delta out of ack_seq and every SACK block. False means drop.
pub(crate) fn adjust_out_seq(synproxy: &dyn SynProxy, conn: &Conn, tcph: &mut TcpHeaderMut<'_>) -> bool {
    if !synproxy.snat_handler(tcph, conn) {
        return false;
    }

    let delta = conn.fnat_seq.lock().unwrap().delta;
    let ack_seq = tcph.ack_seq();
    tcph.set_ack_seq(ack_seq.wrapping_sub(delta));

    super::options::adjust_sack(tcph.options_mut(), delta);

    true
}

//! Interfaces of the surrounding load-balancer framework.
//!
//! The data plane is embedded: connection tables, service/backend registries,
//! schedulers, the SYN-proxy module, and the transmit paths live outside this
//! crate. These traits are the contracts they must satisfy. Tests provide
//! in-memory implementations.

use std::net::IpAddr;
use std::sync::Arc;

use crate::dataplane::conn::{Conn, SynProxySeq};
use crate::packet::{AddrFamily, PacketBuf};
use crate::protocol::tcp::TcpHeaderMut;

/// Packet verdict returned to the framework's hook chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Drop,
}

/// Direction of a packet relative to the balanced connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client to backend.
    Input,
    /// Backend to client.
    Output,
    /// Client to backend on a connection that has never produced output.
    InputOnly,
}

/// Outcome of the connection-scheduling entry point.
#[derive(Debug)]
pub enum ScheduleResult {
    /// The packet was consumed or a verdict decided; stop processing.
    Handled {
        verdict: Verdict,
        conn: Option<Arc<Conn>>,
    },
    /// A new connection was created for this first SYN.
    Scheduled(Arc<Conn>),
    /// Not ours; the framework continues its lookup path.
    PassThrough,
}

/// A virtual service: the scheduling policy behind one (vip, vport) pair.
pub trait Service: Send + Sync {
    /// Pick a real server and materialize a connection for this first SYN.
    /// `None` means no backend is currently usable.
    fn schedule(&self, pkt: &PacketBuf) -> Option<Arc<Conn>>;

    /// Policy verdict when no backend is available.
    fn no_backend(&self, pkt: &PacketBuf) -> Verdict;
}

/// Lookup of virtual services and global admission control.
pub trait ServiceRegistry: Send + Sync {
    /// Full match on (mark, daddr, dport).
    fn lookup(
        &self,
        af: AddrFamily,
        mark: u32,
        daddr: IpAddr,
        dport: u16,
    ) -> Option<Arc<dyn Service>>;

    /// Whether any service owns this virtual address, regardless of port.
    fn has_vip(&self, af: AddrFamily, addr: IpAddr) -> bool;

    /// Admission check: true when the balancer is too loaded to accept a new
    /// connection.
    fn overloaded(&self) -> bool;
}

/// The SYN-proxy module: answers client SYNs with cookies and completes the
/// handshake toward the backend after verification.
pub trait SynProxy: Send + Sync {
    /// Handshake step-2 hook, run before SYN scheduling. May consume the
    /// packet and may produce the connection it established.
    fn ack_rcv(&self, af: AddrFamily, pkt: &mut PacketBuf) -> Option<(Verdict, Option<Arc<Conn>>)>;

    /// Rewrite sequence numbers on backend-to-client packets. Returns false
    /// when an ACK storm is detected and the packet must be dropped.
    fn snat_handler(&self, tcph: &mut TcpHeaderMut<'_>, conn: &Conn) -> bool;

    /// Rewrite ack_seq and SACK blocks on client-to-backend packets.
    fn dnat_handler(&self, tcph: &mut TcpHeaderMut<'_>, seq: &SynProxySeq);
}

/// No-op SYN proxy for deployments (and tests) that run without one.
#[derive(Debug, Default)]
pub struct NullSynProxy;

impl SynProxy for NullSynProxy {
    fn ack_rcv(
        &self,
        _af: AddrFamily,
        _pkt: &mut PacketBuf,
    ) -> Option<(Verdict, Option<Arc<Conn>>)> {
        None
    }

    fn snat_handler(&self, _tcph: &mut TcpHeaderMut<'_>, _conn: &Conn) -> bool {
        true
    }

    fn dnat_handler(&self, _tcph: &mut TcpHeaderMut<'_>, _seq: &SynProxySeq) {}
}

/// Transmit paths provided by the framework. The packet handed over is fully
/// formed; NAT of synthesized packets happens downstream of these hooks.
pub trait Transmit: Send + Sync {
    /// The connection's generic transmit path (client-to-backend NAT applied
    /// downstream).
    fn packet_xmit(&self, pkt: PacketBuf, conn: &Conn);

    /// Response path toward the client for classic-NAT connections.
    fn normal_response_xmit(&self, pkt: PacketBuf, conn: &Conn);

    /// Response path toward the client for full-NAT connections.
    fn fnat_response_xmit(&self, pkt: PacketBuf, conn: &Conn);
}

/// An application helper (e.g. FTP) bound to connections on its port.
pub trait AppHelper: Send + Sync {
    fn name(&self) -> &str;

    /// Virtual port this helper serves.
    fn port(&self) -> u16;

    /// Called once when a connection binds to this helper.
    fn init_conn(&self, _conn: &Conn) -> crate::Result<()> {
        Ok(())
    }

    /// Mangle hook for client-to-backend packets. False drops the packet.
    fn pkt_in(&self, _conn: &Conn, _pkt: &mut PacketBuf) -> bool {
        true
    }

    /// Mangle hook for backend-to-client packets. False drops the packet.
    fn pkt_out(&self, _conn: &Conn, _pkt: &mut PacketBuf) -> bool {
        true
    }
}

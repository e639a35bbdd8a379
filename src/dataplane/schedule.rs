//! Connection admission: the first packet of a flow.
//!
//! A new balanced connection is created only for a clean SYN addressed to a
//! known service, after the SYN proxy has had its chance to complete a
//! cookie handshake and the overload policy has been consulted. Everything
//! else falls through to the framework - or is dropped, when the stray-VIP
//! defence is on.

use tracing::debug;

use crate::config::TcpConfig;
use crate::framework::{ScheduleResult, ServiceRegistry, SynProxy, Verdict};
use crate::packet::{AddrFamily, PacketBuf};
use crate::protocol::tcp::TcpHeader;
use crate::protocol::{ipv4, ipv6};
use crate::telemetry::MetricsRegistry;

/// Destination address of the packet as the framework delivered it.
fn packet_dst(pkt: &PacketBuf, af: AddrFamily) -> crate::Result<std::net::IpAddr> {
    match af {
        AddrFamily::V4 => Ok(ipv4::Ipv4Header::parse(pkt.data())?.dst_addr().into()),
        AddrFamily::V6 => Ok(ipv6::Ipv6Header::parse(pkt.data())?.dst_addr().into()),
    }
}

pub(crate) fn conn_schedule(
    config: &TcpConfig,
    registry: &dyn ServiceRegistry,
    synproxy: &dyn SynProxy,
    metrics: &MetricsRegistry,
    af: AddrFamily,
    pkt: &mut PacketBuf,
) -> ScheduleResult {
    let Ok(l4_offset) = pkt.l4_offset(af) else {
        return ScheduleResult::Handled {
            verdict: Verdict::Drop,
            conn: None,
        };
    };
    let (flags, dport) = match TcpHeader::parse(&pkt.data()[l4_offset..]) {
        Ok(tcph) => (tcph.flags(), tcph.dst_port()),
        Err(_) => {
            return ScheduleResult::Handled {
                verdict: Verdict::Drop,
                conn: None,
            };
        }
    };

    // Step 2 of a proxied handshake: the client answers the cookie.
    if let Some((verdict, conn)) = synproxy.ack_rcv(af, pkt) {
        return ScheduleResult::Handled { verdict, conn };
    }

    let Ok(daddr) = packet_dst(pkt, af) else {
        return ScheduleResult::Handled {
            verdict: Verdict::Drop,
            conn: None,
        };
    };

    if flags.syn && !flags.ack && !flags.fin && !flags.rst {
        if let Some(service) = registry.lookup(af, pkt.mark(), daddr, dport) {
            if registry.overloaded() {
                debug!("overloaded, dropping new connection");
                return ScheduleResult::Handled {
                    verdict: Verdict::Drop,
                    conn: None,
                };
            }

            return match service.schedule(pkt) {
                Some(conn) => ScheduleResult::Scheduled(conn),
                None => ScheduleResult::Handled {
                    verdict: service.no_backend(pkt),
                    conn: None,
                },
            };
        }
    }

    // Anything else aimed at a virtual IP without a service port.
    if config.drop_non_service && registry.has_vip(af, daddr) {
        metrics.defence_tcp_drop.inc();
        return ScheduleResult::Handled {
            verdict: Verdict::Drop,
            conn: None,
        };
    }

    ScheduleResult::PassThrough
}

//! The TCP protocol handler.
//!
//! One [`TcpProtocol`] instance is registered with the framework at startup;
//! every hook the framework calls for TCP packets is a method here. The
//! instance owns the data plane's shared mutable state: the timeout table,
//! the normal/secure table selector, and the application-helper registry.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::config::TcpConfig;
use crate::dataplane::app::AppRegistry;
use crate::dataplane::conn::Conn;
use crate::dataplane::seq::IsnGenerator;
use crate::dataplane::state::{self, TcpState, TimeoutTable};
use crate::dataplane::{rst, schedule, translate};
use crate::framework::{
    AppHelper, Direction, ScheduleResult, ServiceRegistry, SynProxy, Transmit,
};
use crate::packet::{AddrFamily, PacketBuf};
use crate::protocol::tcp::TcpHeader;
use crate::protocol::{ipv4, ipv6};
use crate::telemetry::MetricsRegistry;
use crate::Result;

pub struct TcpProtocol {
    config: TcpConfig,
    timeouts: RwLock<TimeoutTable>,
    /// Selects the secure transition table; readers snapshot per packet.
    secure_mode: AtomicBool,
    apps: AppRegistry,
    isn_gen: IsnGenerator,
    registry: Arc<dyn ServiceRegistry>,
    synproxy: Arc<dyn SynProxy>,
    transmit: Arc<dyn Transmit>,
    metrics: Arc<MetricsRegistry>,
}

impl TcpProtocol {
    pub const NAME: &'static str = "TCP";
    pub const PROTOCOL: u8 = crate::protocol::tcp::PROTOCOL_NUMBER;

    pub fn new(
        config: TcpConfig,
        isn_gen: IsnGenerator,
        registry: Arc<dyn ServiceRegistry>,
        synproxy: Arc<dyn SynProxy>,
        transmit: Arc<dyn Transmit>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        let timeouts = TimeoutTable::from_config(&config.timeouts);
        Self {
            config,
            timeouts: RwLock::new(timeouts),
            secure_mode: AtomicBool::new(false),
            apps: AppRegistry::new(),
            isn_gen,
            registry,
            synproxy,
            transmit,
            metrics,
        }
    }

    fn translate_ctx(&self) -> translate::TranslateCtx<'_> {
        translate::TranslateCtx {
            config: &self.config,
            synproxy: &*self.synproxy,
            isn_gen: &self.isn_gen,
            metrics: &self.metrics,
        }
    }

    /// Admission hook for packets with no connection yet.
    pub fn conn_schedule(&self, af: AddrFamily, pkt: &mut PacketBuf) -> ScheduleResult {
        schedule::conn_schedule(
            &self.config,
            &*self.registry,
            &*self.synproxy,
            &self.metrics,
            af,
            pkt,
        )
    }

    /// Classic-NAT egress translator.
    pub fn snat_handler(&self, pkt: &mut PacketBuf, conn: &Conn) -> bool {
        translate::snat_handler(&self.translate_ctx(), pkt, conn)
    }

    /// Classic-NAT ingress translator.
    pub fn dnat_handler(&self, pkt: &mut PacketBuf, conn: &Conn) -> bool {
        translate::dnat_handler(&self.translate_ctx(), pkt, conn)
    }

    /// Full-NAT ingress translator; may grow the packet in place.
    pub fn fnat_in_handler(&self, pkt: &mut PacketBuf, conn: &Conn) -> bool {
        translate::fnat_in_handler(&self.translate_ctx(), pkt, conn)
    }

    /// Full-NAT egress translator.
    pub fn fnat_out_handler(&self, pkt: &mut PacketBuf, conn: &Conn) -> bool {
        translate::fnat_out_handler(&self.translate_ctx(), pkt, conn)
    }

    /// Verify the TCP checksum of an ingress packet.
    pub fn csum_check(&self, af: AddrFamily, pkt: &PacketBuf) -> bool {
        translate::csum_check(af, pkt)
    }

    /// Drive the per-connection state machine for one packet.
    pub fn state_transition(&self, conn: &Conn, direction: Direction, pkt: &PacketBuf) -> bool {
        let Ok(l4_offset) = pkt.l4_offset(conn.af()) else {
            return false;
        };
        let Ok(tcph) = TcpHeader::parse(&pkt.data()[l4_offset..]) else {
            return false;
        };

        let secure = self.secure_mode.load(Ordering::Relaxed);
        let timeouts = self.timeouts.read().unwrap();
        state::apply_transition(conn, direction, tcph.flags(), secure, &timeouts);
        true
    }

    /// Register an application helper.
    pub fn register_app(&self, app: Arc<dyn AppHelper>) -> Result<()> {
        self.apps.register(app)
    }

    /// Unregister the helper serving `port`.
    pub fn unregister_app(&self, port: u16) {
        self.apps.unregister(port)
    }

    /// Bind a helper to a freshly created connection (classic NAT only).
    pub fn app_conn_bind(&self, conn: &Conn) -> Result<()> {
        self.apps.conn_bind(conn)
    }

    /// Expiry hook: synthesize RSTs toward both peers where applicable.
    pub fn conn_expire_handler(&self, conn: &Conn) {
        rst::conn_expire_handler(&self.config, &self.metrics, conn, &*self.transmit)
    }

    /// Put a connection into LISTEN with the LISTEN timeout.
    pub fn conn_listen(&self, conn: &Conn) {
        let timeouts = self.timeouts.read().unwrap();
        state::enter_listen(conn, &timeouts);
    }

    /// Control hook: bit 0 selects the secure transition table.
    pub fn timeout_change(&self, flags: u32) {
        self.secure_mode.store(flags & 1 != 0, Ordering::Relaxed);
    }

    /// Override the idle timeout of one state by name.
    pub fn set_state_timeout(&self, name: &str, timeout: Duration) -> Result<()> {
        self.timeouts.write().unwrap().set_by_name(name, timeout)
    }

    /// Current idle timeout of a state.
    pub fn state_timeout(&self, state: TcpState) -> Duration {
        self.timeouts.read().unwrap().get(state)
    }

    /// Human-readable state label.
    pub fn state_name(state: TcpState) -> &'static str {
        state.name()
    }

    /// One-line packet description for diagnostics.
    pub fn debug_packet(&self, af: AddrFamily, pkt: &PacketBuf) -> String {
        let header = |l4_offset: usize| TcpHeader::parse(&pkt.data()[l4_offset..]).ok();

        let described = match af {
            AddrFamily::V4 => ipv4::Ipv4Header::parse(pkt.data()).ok().and_then(|ip| {
                header(ip.header_len()).map(|th| {
                    format!(
                        "{} {}:{}->{}:{}",
                        Self::NAME,
                        ip.src_addr(),
                        th.src_port(),
                        ip.dst_addr(),
                        th.dst_port()
                    )
                })
            }),
            AddrFamily::V6 => ipv6::Ipv6Header::parse(pkt.data()).ok().and_then(|ip| {
                header(ipv6::HEADER_SIZE).map(|th| {
                    format!(
                        "{} [{}]:{}->[{}]:{}",
                        Self::NAME,
                        ip.src_addr(),
                        th.src_port(),
                        ip.dst_addr(),
                        th.dst_port()
                    )
                })
            }),
        };

        described.unwrap_or_else(|| format!("{} truncated packet", Self::NAME))
    }

    pub fn config(&self) -> &TcpConfig {
        &self.config
    }

    pub fn metrics(&self) -> &MetricsRegistry {
        &self.metrics
    }
}

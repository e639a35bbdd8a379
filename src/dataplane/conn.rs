//! Balanced-connection record.
//!
//! One `Conn` per balanced TCP connection, owned by the framework's
//! connection table and shared across packet-processing contexts. State,
//! timeout and the previous state live behind the per-connection lock;
//! everything else the data plane mutates uses atomics or its own mutex.

use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::dataplane::state::TcpState;
use crate::framework::AppHelper;
use crate::packet::{AddrFamily, PacketBuf};
use crate::telemetry::Counter;

/// Connection mode and status bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnFlags(u32);

impl ConnFlags {
    /// Classic NAT: destination rewritten on ingress, source on egress.
    pub const MASQ: ConnFlags = ConnFlags(0x0001);
    /// Full NAT: both source and destination rewritten.
    pub const FULLNAT: ConnFlags = ConnFlags(0x0002);
    /// No egress packet observed yet.
    pub const NO_OUTPUT: ConnFlags = ConnFlags(0x0004);
    /// Counted as inactive on the bound destination.
    pub const INACTIVE: ConnFlags = ConnFlags(0x0008);
    /// The client-address option has been sent; never inject again.
    pub const CIP_INSERTED: ConnFlags = ConnFlags(0x0010);

    pub const fn empty() -> Self {
        ConnFlags(0)
    }

    pub const fn contains(self, other: ConnFlags) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn bits(self) -> u32 {
        self.0
    }
}

impl std::ops::BitOr for ConnFlags {
    type Output = ConnFlags;

    fn bitor(self, rhs: ConnFlags) -> ConnFlags {
        ConnFlags(self.0 | rhs.0)
    }
}

/// Full-NAT sequence context: the locally chosen ISN toward the backend and
/// its offset from the client's ISN.
#[derive(Debug, Clone, Copy, Default)]
pub struct FnatSeq {
    /// ISN this balancer uses toward the backend. Zero until the first SYN.
    pub init_seq: u32,
    /// `init_seq - client_isn`, fixed for the connection's lifetime (modulo
    /// a sanctioned handshake-state re-init).
    pub delta: u32,
    /// First data byte of the client's stream: `client_isn + 1`.
    pub fdata_seq: u32,
}

/// Sequence context owned by the SYN-proxy module. This crate only reads the
/// delta when seeding an expiry RST; everything else goes through the proxy's
/// own handlers.
#[derive(Debug, Clone, Copy, Default)]
pub struct SynProxySeq {
    pub init_seq: u32,
    pub delta: u32,
}

/// State words guarded by the connection lock.
#[derive(Debug, Clone, Copy)]
pub struct Tcb {
    pub state: TcpState,
    pub old_state: TcpState,
    pub timeout: Duration,
}

/// Single-slot queue holding the most recent ACK seen in SYN_SENT, kept so
/// expiry RSTs can be seeded from its sequence numbers.
#[derive(Debug, Default)]
pub struct AckSlot(Mutex<Option<PacketBuf>>);

impl AckSlot {
    /// Replace the stored packet.
    pub fn store(&self, pkt: PacketBuf) {
        *self.0.lock().unwrap() = Some(pkt);
    }

    /// Borrow the stored packet without removing it, the moral equivalent of
    /// dequeue-then-requeue on a one-deep queue.
    pub fn peek<R>(&self, f: impl FnOnce(&PacketBuf) -> R) -> Option<R> {
        self.0.lock().unwrap().as_ref().map(f)
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().unwrap().is_none()
    }
}

/// A real server, with the connection counters the state machine maintains.
#[derive(Debug)]
pub struct Dest {
    pub addr: IpAddr,
    pub port: u16,
    pub active_conns: Counter,
    pub inactive_conns: Counter,
}

impl Dest {
    pub fn new(addr: IpAddr, port: u16) -> Arc<Self> {
        Arc::new(Self {
            addr,
            port,
            active_conns: Counter::new(),
            inactive_conns: Counter::new(),
        })
    }
}

/// Address tuple of a balanced connection.
#[derive(Debug, Clone, Copy)]
pub struct ConnTuple {
    pub caddr: IpAddr,
    pub cport: u16,
    pub vaddr: IpAddr,
    pub vport: u16,
    pub laddr: IpAddr,
    pub lport: u16,
    pub daddr: IpAddr,
    pub dport: u16,
}

/// A balanced TCP connection.
pub struct Conn {
    /// Client address and port.
    pub caddr: IpAddr,
    pub cport: u16,
    /// Virtual (externally visible) address and port.
    pub vaddr: IpAddr,
    pub vport: u16,
    /// Local address and port used toward the backend (full NAT only).
    pub laddr: IpAddr,
    pub lport: u16,
    /// Backend (real server) address and port.
    pub daddr: IpAddr,
    pub dport: u16,

    flags: AtomicU32,
    tcb: Mutex<Tcb>,

    /// Full-NAT sequence context.
    pub fnat_seq: Mutex<FnatSeq>,
    /// SYN-proxy sequence context, set by the proxy at creation.
    pub syn_proxy_seq: SynProxySeq,

    /// Last in-order ack_seq seen from the backend.
    rs_ack_seq: AtomicU32,
    /// End of the last in-order segment seen from the backend.
    rs_end_seq: AtomicU32,

    /// Most recent ACK while in SYN_SENT, for RST seq seeding.
    pub ack_slot: AckSlot,

    dest: Option<Arc<Dest>>,
    app: Mutex<Option<Arc<dyn AppHelper>>>,
}

impl Conn {
    /// Create a connection in state NONE. Binding a destination counts it as
    /// inactive until the state machine moves it into ESTABLISHED.
    pub fn new(tuple: ConnTuple, flags: ConnFlags, dest: Option<Arc<Dest>>) -> Arc<Self> {
        let mut flag_bits = flags.bits();
        if let Some(dest) = &dest {
            flag_bits |= ConnFlags::INACTIVE.bits();
            dest.inactive_conns.inc();
        }

        Arc::new(Self {
            caddr: tuple.caddr,
            cport: tuple.cport,
            vaddr: tuple.vaddr,
            vport: tuple.vport,
            laddr: tuple.laddr,
            lport: tuple.lport,
            daddr: tuple.daddr,
            dport: tuple.dport,
            flags: AtomicU32::new(flag_bits),
            tcb: Mutex::new(Tcb {
                state: TcpState::None,
                old_state: TcpState::None,
                timeout: Duration::ZERO,
            }),
            fnat_seq: Mutex::new(FnatSeq::default()),
            syn_proxy_seq: SynProxySeq::default(),
            rs_ack_seq: AtomicU32::new(0),
            rs_end_seq: AtomicU32::new(0),
            ack_slot: AckSlot::default(),
            dest,
            app: Mutex::new(None),
        })
    }

    pub fn af(&self) -> AddrFamily {
        match self.vaddr {
            IpAddr::V4(_) => AddrFamily::V4,
            IpAddr::V6(_) => AddrFamily::V6,
        }
    }

    pub fn flags(&self) -> ConnFlags {
        ConnFlags(self.flags.load(Ordering::Relaxed))
    }

    pub fn has_flag(&self, flag: ConnFlags) -> bool {
        self.flags().contains(flag)
    }

    pub fn set_flag(&self, flag: ConnFlags) {
        self.flags.fetch_or(flag.bits(), Ordering::Relaxed);
    }

    pub fn clear_flag(&self, flag: ConnFlags) {
        self.flags.fetch_and(!flag.bits(), Ordering::Relaxed);
    }

    pub fn is_fullnat(&self) -> bool {
        self.has_flag(ConnFlags::FULLNAT)
    }

    pub fn is_masq(&self) -> bool {
        self.has_flag(ConnFlags::MASQ)
    }

    /// Take the connection lock.
    pub(crate) fn tcb_lock(&self) -> MutexGuard<'_, Tcb> {
        self.tcb.lock().unwrap()
    }

    pub fn state(&self) -> TcpState {
        self.tcb_lock().state
    }

    pub fn old_state(&self) -> TcpState {
        self.tcb_lock().old_state
    }

    pub fn timeout(&self) -> Duration {
        self.tcb_lock().timeout
    }

    pub fn rs_ack_seq(&self) -> u32 {
        self.rs_ack_seq.load(Ordering::Relaxed)
    }

    pub fn set_rs_ack_seq(&self, seq: u32) {
        self.rs_ack_seq.store(seq, Ordering::Relaxed);
    }

    pub fn rs_end_seq(&self) -> u32 {
        self.rs_end_seq.load(Ordering::Relaxed)
    }

    pub fn set_rs_end_seq(&self, seq: u32) {
        self.rs_end_seq.store(seq, Ordering::Relaxed);
    }

    pub fn dest(&self) -> Option<&Arc<Dest>> {
        self.dest.as_ref()
    }

    pub fn app(&self) -> Option<Arc<dyn AppHelper>> {
        self.app.lock().unwrap().clone()
    }

    pub fn set_app(&self, app: Arc<dyn AppHelper>) {
        *self.app.lock().unwrap() = Some(app);
    }
}

impl fmt::Debug for Conn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conn")
            .field("client", &format_args!("{}:{}", self.caddr, self.cport))
            .field("virtual", &format_args!("{}:{}", self.vaddr, self.vport))
            .field("local", &format_args!("{}:{}", self.laddr, self.lport))
            .field("backend", &format_args!("{}:{}", self.daddr, self.dport))
            .field("state", &self.state())
            .field("flags", &self.flags().bits())
            .finish()
    }
}

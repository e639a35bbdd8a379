//! Shared harness: an in-memory framework around the protocol object.
//!
//! One virtual service scheduling every first SYN onto a single full-NAT
//! backend, a transmit sink that captures synthesized packets, and helpers
//! that drive a connection through admission and the handshake.

use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use ruvs::config::TcpConfig;
use ruvs::dataplane::{Conn, ConnFlags, ConnTuple, Dest, IsnGenerator, TcpProtocol, TcpState};
use ruvs::framework::{
    Direction, NullSynProxy, ScheduleResult, Service, ServiceRegistry, Transmit, Verdict,
};
use ruvs::packet::{AddrFamily, PacketBuf};
use ruvs::protocol::tcp::{TcpHeader, OPT_MSS};
use ruvs::protocol::{checksum, ipv4};
use ruvs::telemetry::MetricsRegistry;

pub const CADDR: &str = "10.0.0.1";
pub const VADDR: &str = "10.0.0.100";
pub const LADDR: &str = "10.2.0.2";
pub const DADDR: &str = "10.1.0.5";

pub const CPORT: u16 = 5000;
pub const VPORT: u16 = 80;
pub const LPORT: u16 = 40000;
pub const DPORT: u16 = 8080;

struct FlowService {
    dest: Arc<Dest>,
}

impl Service for FlowService {
    fn schedule(&self, _pkt: &PacketBuf) -> Option<Arc<Conn>> {
        Some(Conn::new(
            ConnTuple {
                caddr: CADDR.parse().unwrap(),
                cport: CPORT,
                vaddr: VADDR.parse().unwrap(),
                vport: VPORT,
                laddr: LADDR.parse().unwrap(),
                lport: LPORT,
                daddr: DADDR.parse().unwrap(),
                dport: DPORT,
            },
            ConnFlags::FULLNAT,
            Some(self.dest.clone()),
        ))
    }

    fn no_backend(&self, _pkt: &PacketBuf) -> Verdict {
        Verdict::Drop
    }
}

struct FlowRegistry {
    service: Arc<FlowService>,
}

impl ServiceRegistry for FlowRegistry {
    fn lookup(
        &self,
        _af: AddrFamily,
        _mark: u32,
        daddr: IpAddr,
        dport: u16,
    ) -> Option<Arc<dyn Service>> {
        (daddr == VADDR.parse::<IpAddr>().unwrap() && dport == VPORT)
            .then(|| self.service.clone() as Arc<dyn Service>)
    }

    fn has_vip(&self, _af: AddrFamily, addr: IpAddr) -> bool {
        addr == VADDR.parse::<IpAddr>().unwrap()
    }

    fn overloaded(&self) -> bool {
        false
    }
}

#[derive(Default)]
pub struct CaptureTransmit {
    pub to_backend: Mutex<Vec<PacketBuf>>,
    pub to_client: Mutex<Vec<PacketBuf>>,
}

impl Transmit for CaptureTransmit {
    fn packet_xmit(&self, pkt: PacketBuf, _conn: &Conn) {
        self.to_backend.lock().unwrap().push(pkt);
    }

    fn normal_response_xmit(&self, pkt: PacketBuf, _conn: &Conn) {
        self.to_client.lock().unwrap().push(pkt);
    }

    fn fnat_response_xmit(&self, pkt: PacketBuf, _conn: &Conn) {
        self.to_client.lock().unwrap().push(pkt);
    }
}

pub struct Harness {
    pub proto: TcpProtocol,
    pub transmit: Arc<CaptureTransmit>,
    pub dest: Arc<Dest>,
}

pub fn make_harness() -> Harness {
    let dest = Dest::new(DADDR.parse().unwrap(), DPORT);
    let transmit = Arc::new(CaptureTransmit::default());
    let proto = TcpProtocol::new(
        TcpConfig::default(),
        IsnGenerator::new([42u8; 32]),
        Arc::new(FlowRegistry {
            service: Arc::new(FlowService { dest: dest.clone() }),
        }),
        Arc::new(NullSynProxy),
        transmit.clone(),
        Arc::new(MetricsRegistry::new()),
    );
    Harness {
        proto,
        transmit,
        dest,
    }
}

#[allow(clippy::too_many_arguments)]
pub fn make_packet(
    src: &str,
    dst: &str,
    sport: u16,
    dport: u16,
    seq: u32,
    ack: u32,
    flags: u8,
    options: &[u8],
    payload: &[u8],
) -> PacketBuf {
    assert_eq!(options.len() % 4, 0);
    let mut seg = vec![0u8; 20];
    seg[0..2].copy_from_slice(&sport.to_be_bytes());
    seg[2..4].copy_from_slice(&dport.to_be_bytes());
    seg[4..8].copy_from_slice(&seq.to_be_bytes());
    seg[8..12].copy_from_slice(&ack.to_be_bytes());
    seg[12] = ((5 + options.len() / 4) as u8) << 4;
    seg[13] = flags;
    seg[14..16].copy_from_slice(&29200u16.to_be_bytes());
    seg.extend_from_slice(options);
    seg.extend_from_slice(payload);

    let src: IpAddr = src.parse().unwrap();
    let dst: IpAddr = dst.parse().unwrap();
    let sum = checksum::tcp_checksum(src, dst, &seg);
    seg[16..18].copy_from_slice(&sum.to_be_bytes());

    let (IpAddr::V4(src), IpAddr::V4(dst)) = (src, dst) else {
        unreachable!();
    };
    let data = ipv4::Ipv4Builder::new()
        .src_addr(src)
        .dst_addr(dst)
        .protocol(6)
        .payload(&seg)
        .build();
    PacketBuf::new(data)
}

pub fn tcp_header(pkt: &PacketBuf) -> TcpHeader<'_> {
    TcpHeader::parse(&pkt.data()[20..]).unwrap()
}

pub fn segment_valid(pkt: &PacketBuf, src: &str, dst: &str) -> bool {
    checksum::tcp_checksum_valid(
        src.parse().unwrap(),
        dst.parse().unwrap(),
        &pkt.data()[20..],
    )
}

/// Admit the first SYN and run it through the ingress translator.
pub fn open_connection(h: &Harness) -> (Arc<Conn>, u32) {
    let mut syn = make_packet(CADDR, VADDR, CPORT, VPORT, 1000, 0, 0x02, &[], b"");
    let conn = match h.proto.conn_schedule(AddrFamily::V4, &mut syn) {
        ScheduleResult::Scheduled(conn) => conn,
        other => panic!("expected a scheduled connection, got {other:?}"),
    };

    assert!(h.proto.fnat_in_handler(&mut syn, &conn));
    assert!(h.proto.state_transition(&conn, Direction::Output, &syn));

    let th = tcp_header(&syn);
    assert_eq!(th.src_port(), LPORT);
    assert_eq!(th.dst_port(), DPORT);
    assert!(segment_valid(&syn, LADDR, DADDR));

    let fseq = *conn.fnat_seq.lock().unwrap();
    assert_ne!(fseq.init_seq, 0);
    assert_eq!(fseq.delta, fseq.init_seq.wrapping_sub(1000));
    assert_eq!(fseq.fdata_seq, 1001);
    assert_eq!(th.seq(), fseq.init_seq);
    assert_eq!(conn.state(), TcpState::SynSent);

    (conn, fseq.delta)
}

/// Answer with the backend SYN|ACK and run it through the egress translator.
pub fn establish(h: &Harness, conn: &Arc<Conn>, delta: u32) {
    let backend_ack = 1000u32.wrapping_add(delta).wrapping_add(1);
    let mss = [OPT_MSS, 4, 0x05, 0xB4]; // 1460
    let mut syn_ack = make_packet(
        DADDR,
        LADDR,
        DPORT,
        LPORT,
        9000,
        backend_ack,
        0x12,
        &mss,
        b"",
    );

    assert!(h.proto.fnat_out_handler(&mut syn_ack, conn));
    assert!(h.proto.state_transition(conn, Direction::Input, &syn_ack));

    let th = tcp_header(&syn_ack);
    assert_eq!(th.src_port(), VPORT);
    assert_eq!(th.dst_port(), CPORT);
    assert_eq!(th.seq(), 9000);
    assert_eq!(th.ack_seq(), 1001);

    // MSS shrunk by the on-wire size of the client-address option.
    let opts = th.options();
    assert_eq!(u16::from_be_bytes([opts[2], opts[3]]), 1452);

    assert_eq!(conn.rs_ack_seq(), backend_ack);
    assert_eq!(conn.rs_end_seq(), 9001);
    assert_eq!(conn.state(), TcpState::Established);
    assert!(segment_valid(&syn_ack, VADDR, CADDR));
}

use crate::{
    cursor::HeaderCursor,
    headers::{IcmpHdr, SctpHdr, TcpHdr, UdpHdr},
    Direction, ACK_FLAG, CWR_FLAG, ECE_FLAG, FIN_ACK_FLAG, FIN_FLAG, IPPROTO_ICMP, IPPROTO_ICMPV6,
    IPPROTO_SCTP, IPPROTO_TCP, IPPROTO_UDP, PSH_FLAG, RST_ACK_FLAG, RST_FLAG, SYN_ACK_FLAG,
    SYN_FLAG, URG_FLAG,
};

const TH_FIN: u8 = 0x01;
const TH_SYN: u8 = 0x02;
const TH_RST: u8 = 0x04;
const TH_PSH: u8 = 0x08;
const TH_ACK: u8 = 0x10;
const TH_URG: u8 = 0x20;
const TH_ECE: u8 = 0x40;
const TH_CWR: u8 = 0x80;

/// Transport layer fields of a packet, zeroed for anything that wasn't parsed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct L4Info {
    /// TCP/UDP/SCTP source port in host byte order
    pub src_port: u16,
    /// TCP/UDP/SCTP destination port in host byte order
    pub dst_port: u16,
    pub icmp_type: u8,
    pub icmp_code: u8,
    pub flags: u16,
    /// The packet looks like a connection establishment
    pub conn_tstamp: bool,
}

/// Maps the TCP control bits of one segment to a single flow flag.
///
/// Only the first matching rule applies, compound ACK combinations first.
/// Returns the flag and whether the connection timestamp must be recorded.
#[inline(always)]
pub fn tcp_flags(th_flags: u8, seq: u32, direction: Direction) -> (u16, bool) {
    let ack = th_flags & TH_ACK != 0;
    if ack && th_flags & TH_SYN != 0 {
        // server -> client during the 3-way handshake
        (SYN_ACK_FLAG, true)
    } else if ack && th_flags & TH_FIN != 0 {
        (FIN_ACK_FLAG, false)
    } else if ack && th_flags & TH_RST != 0 {
        (RST_ACK_FLAG, false)
    } else if th_flags & TH_FIN != 0 {
        (FIN_FLAG, false)
    } else if th_flags & TH_SYN != 0 {
        (SYN_FLAG, false)
    } else if ack {
        // Handshake completion is guessed from a bare ACK with seq 1. This only
        // holds when relative sequence numbers are seen, kept for compatibility.
        (ACK_FLAG, direction == Direction::Ingress && seq == 1)
    } else if th_flags & TH_RST != 0 {
        (RST_FLAG, false)
    } else if th_flags & TH_PSH != 0 {
        (PSH_FLAG, false)
    } else if th_flags & TH_URG != 0 {
        (URG_FLAG, false)
    } else if th_flags & TH_ECE != 0 {
        (ECE_FLAG, false)
    } else if th_flags & TH_CWR != 0 {
        (CWR_FLAG, false)
    } else {
        (0, false)
    }
}

/// Extracts L4 information for the supported protocols. A transport header
/// that doesn't fit leaves the result zeroed instead of failing the packet.
#[inline(always)]
pub fn fill_l4info(
    cursor: &HeaderCursor,
    offset: usize,
    direction: Direction,
    protocol: u8,
) -> L4Info {
    let mut info = L4Info::default();
    match protocol {
        IPPROTO_TCP => {
            if let Ok(tcp) = cursor.load::<TcpHdr>(offset) {
                info.src_port = tcp.src_port();
                info.dst_port = tcp.dst_port();
                let (flags, conn_tstamp) = tcp_flags(tcp.flags, tcp.seq(), direction);
                info.flags = flags;
                info.conn_tstamp = conn_tstamp;
            }
        }
        IPPROTO_UDP => {
            if let Ok(udp) = cursor.load::<UdpHdr>(offset) {
                info.src_port = udp.src_port();
                info.dst_port = udp.dst_port();
            }
        }
        IPPROTO_SCTP => {
            if let Ok(sctp) = cursor.load::<SctpHdr>(offset) {
                info.src_port = sctp.src_port();
                info.dst_port = sctp.dst_port();
            }
        }
        IPPROTO_ICMP | IPPROTO_ICMPV6 => {
            if let Ok(icmp) = cursor.load::<IcmpHdr>(offset) {
                info.icmp_type = icmp.icmp_type;
                info.icmp_code = icmp.code;
            }
        }
        _ => {}
    }
    info
}

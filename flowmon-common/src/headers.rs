//! On-the-wire header layouts. All multi-byte fields are kept as network order
//! byte arrays and only converted by the accessors, so a header can be copied
//! straight out of the packet whatever its content.

use crate::cursor::WireHeader;

/// Ethernet II header.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct EthHdr {
    pub dst_addr: [u8; 6],
    pub src_addr: [u8; 6],
    pub ether_type: [u8; 2],
}

impl EthHdr {
    #[inline(always)]
    pub fn ether_type(&self) -> u16 {
        u16::from_be_bytes(self.ether_type)
    }
}

/// IPv4 header without options.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct Ipv4Hdr {
    pub vihl: u8,
    pub tos: u8,
    pub tot_len: [u8; 2],
    pub id: [u8; 2],
    pub frag_off: [u8; 2],
    pub ttl: u8,
    pub proto: u8,
    pub check: [u8; 2],
    pub src_addr: [u8; 4],
    pub dst_addr: [u8; 4],
}

impl Ipv4Hdr {
    /// Header length in bytes as announced by the IHL field.
    #[inline(always)]
    pub fn ihl_len(&self) -> usize {
        ((self.vihl & 0x0f) as usize) * 4
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct Ipv6Hdr {
    pub vcf: [u8; 4],
    pub payload_len: [u8; 2],
    pub next_hdr: u8,
    pub hop_limit: u8,
    pub src_addr: [u8; 16],
    pub dst_addr: [u8; 16],
}

/// TCP header without options. `flags` holds CWR..FIN in bits 7..0.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct TcpHdr {
    pub source: [u8; 2],
    pub dest: [u8; 2],
    pub seq: [u8; 4],
    pub ack_seq: [u8; 4],
    pub off_res: u8,
    pub flags: u8,
    pub window: [u8; 2],
    pub check: [u8; 2],
    pub urg_ptr: [u8; 2],
}

impl TcpHdr {
    #[inline(always)]
    pub fn src_port(&self) -> u16 {
        u16::from_be_bytes(self.source)
    }

    #[inline(always)]
    pub fn dst_port(&self) -> u16 {
        u16::from_be_bytes(self.dest)
    }

    #[inline(always)]
    pub fn seq(&self) -> u32 {
        u32::from_be_bytes(self.seq)
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct UdpHdr {
    pub source: [u8; 2],
    pub dest: [u8; 2],
    pub len: [u8; 2],
    pub check: [u8; 2],
}

impl UdpHdr {
    #[inline(always)]
    pub fn src_port(&self) -> u16 {
        u16::from_be_bytes(self.source)
    }

    #[inline(always)]
    pub fn dst_port(&self) -> u16 {
        u16::from_be_bytes(self.dest)
    }
}

/// SCTP common header. Not exported by the kernel headers like the others.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct SctpHdr {
    pub source: [u8; 2],
    pub dest: [u8; 2],
    pub vtag: [u8; 4],
    pub checksum: [u8; 4],
}

impl SctpHdr {
    #[inline(always)]
    pub fn src_port(&self) -> u16 {
        u16::from_be_bytes(self.source)
    }

    #[inline(always)]
    pub fn dst_port(&self) -> u16 {
        u16::from_be_bytes(self.dest)
    }
}

/// ICMP and ICMPv6 share the leading type/code layout and the 8-byte size.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct IcmpHdr {
    pub icmp_type: u8,
    pub code: u8,
    pub checksum: [u8; 2],
    pub rest: [u8; 4],
}

unsafe impl WireHeader for EthHdr {}
unsafe impl WireHeader for Ipv4Hdr {}
unsafe impl WireHeader for Ipv6Hdr {}
unsafe impl WireHeader for TcpHdr {}
unsafe impl WireHeader for UdpHdr {}
unsafe impl WireHeader for SctpHdr {}
unsafe impl WireHeader for IcmpHdr {}

use crate::{
    cursor::{HeaderCursor, Truncated, WireHeader},
    headers::{EthHdr, Ipv4Hdr, Ipv6Hdr},
    l4::{fill_l4info, L4Info},
    Direction, FlowId, ETH_P_IP, ETH_P_IPV6, IP4IN6_PREFIX,
};

/// The frame can't be turned into a flow; no state must be created for it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Discard;

impl From<Truncated> for Discard {
    fn from(_: Truncated) -> Self {
        Discard
    }
}

/// Result of walking the headers of one frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ParsedFlow {
    pub id: FlowId,
    /// Flag derived from this single packet
    pub flags: u16,
    pub conn_tstamp: bool,
}

/// Builds the flow identity of an Ethernet frame.
///
/// Frames with an unknown ethertype are still flows, identified by their L2
/// fields only. A missing Ethernet or IP header discards the frame.
#[inline(always)]
pub fn build_flow_id(
    cursor: &HeaderCursor,
    direction: Direction,
    if_index: u32,
) -> Result<ParsedFlow, Discard> {
    let eth: EthHdr = cursor.load(0)?;

    let mut id = FlowId {
        eth_protocol: eth.ether_type(),
        src_mac: eth.src_addr,
        dst_mac: eth.dst_addr,
        ..Default::default()
    };

    let l4 = match id.eth_protocol {
        ETH_P_IP => fill_ipv4(cursor, EthHdr::LEN, direction, &mut id)?,
        ETH_P_IPV6 => fill_ipv6(cursor, EthHdr::LEN, direction, &mut id)?,
        // other ethertypes keep L3/L4 fields at zero
        _ => L4Info::default(),
    };

    id.if_index = if_index;
    id.direction = direction as u8;

    Ok(ParsedFlow {
        id,
        flags: l4.flags,
        conn_tstamp: l4.conn_tstamp,
    })
}

#[inline(always)]
fn fill_ipv4(
    cursor: &HeaderCursor,
    offset: usize,
    direction: Direction,
    id: &mut FlowId,
) -> Result<L4Info, Discard> {
    let ip: Ipv4Hdr = cursor.load(offset)?;

    id.src_ip = ip4_in_6(ip.src_addr);
    id.dst_ip = ip4_in_6(ip.dst_addr);
    id.transport_protocol = ip.proto;

    // a bogus IHL falls back to the option-less header size
    let ihl = ip.ihl_len();
    let hdr_len = if ihl < Ipv4Hdr::LEN { Ipv4Hdr::LEN } else { ihl };
    let l4 = fill_l4info(cursor, offset + hdr_len, direction, ip.proto);
    set_l4(id, &l4);
    Ok(l4)
}

#[inline(always)]
fn fill_ipv6(
    cursor: &HeaderCursor,
    offset: usize,
    direction: Direction,
    id: &mut FlowId,
) -> Result<L4Info, Discard> {
    let ip: Ipv6Hdr = cursor.load(offset)?;

    id.src_ip = ip.src_addr;
    id.dst_ip = ip.dst_addr;
    id.transport_protocol = ip.next_hdr;

    let l4 = fill_l4info(cursor, offset + Ipv6Hdr::LEN, direction, ip.next_hdr);
    set_l4(id, &l4);
    Ok(l4)
}

#[inline(always)]
fn set_l4(id: &mut FlowId, l4: &L4Info) {
    id.src_port = l4.src_port;
    id.dst_port = l4.dst_port;
    id.icmp_type = l4.icmp_type;
    id.icmp_code = l4.icmp_code;
}

/// Encodes an IPv4 address as an IPv4-mapped IPv6 address.
#[inline(always)]
pub fn ip4_in_6(addr: [u8; 4]) -> [u8; 16] {
    let mut out = [0u8; 16];
    out[..12].copy_from_slice(&IP4IN6_PREFIX);
    out[12..].copy_from_slice(&addr);
    out
}

use crate::{
    cursor::{HeaderCursor, WireHeader},
    headers::{EthHdr, Ipv4Hdr, UdpHdr},
    PayloadMeta, ETH_P_IP, IPPROTO_UDP,
};

/// UDP destination port whose packets are exported on the payload channel.
pub const PAYLOAD_SAMPLE_PORT: u16 = 53;

/// Decides whether a frame goes to the payload sampling channel.
///
/// Only IPv4/UDP packets towards [`PAYLOAD_SAMPLE_PORT`] qualify. The UDP
/// header is located the same way the flow parser does it, IP options included.
/// The returned metadata is followed by `pkt_len` raw bytes on the channel.
#[inline(always)]
pub fn sample(cursor: &HeaderCursor, if_index: u32) -> Option<PayloadMeta> {
    let eth: EthHdr = cursor.load(0).ok()?;
    let ip: Ipv4Hdr = cursor.load(EthHdr::LEN).ok()?;
    if eth.ether_type() != ETH_P_IP || ip.proto != IPPROTO_UDP {
        return None;
    }

    // a header length below the minimum is treated as the minimum
    let ihl = ip.ihl_len();
    let hdr_len = if ihl < Ipv4Hdr::LEN { Ipv4Hdr::LEN } else { ihl };
    let udp: UdpHdr = cursor.load(EthHdr::LEN + hdr_len).ok()?;
    if udp.dst_port() != PAYLOAD_SAMPLE_PORT {
        return None;
    }

    Some(PayloadMeta {
        if_index,
        pkt_len: cursor.len() as u32,
    })
}

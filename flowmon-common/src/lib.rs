#![no_std]

//! Types and packet parsing shared between the `flowmon` TC programs and the
//! userspace agent. Everything here must stay `no_std` and allocation free so
//! the eBPF side can use it unchanged.

use core::mem;

pub mod cursor;
pub mod headers;
pub mod l4;
pub mod parse;
pub mod payload;

pub const ETH_ALEN: usize = 6;
pub const IP_MAX_LEN: usize = 16;

/// IPv4 addresses are stored as IPv6 addresses with prefix ::ffff/96
/// (RFC 4038, section 4.2).
pub const IP4IN6_PREFIX: [u8; 12] = [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xff, 0xff];

pub const ETH_P_IP: u16 = 0x0800;
pub const ETH_P_IPV6: u16 = 0x86DD;

pub const IPPROTO_ICMP: u8 = 1;
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;
pub const IPPROTO_ICMPV6: u8 = 58;
pub const IPPROTO_SCTP: u8 = 132;

// TCP flags, RFC 9293 and IPFIX field 6.
pub const FIN_FLAG: u16 = 0x01;
pub const SYN_FLAG: u16 = 0x02;
pub const RST_FLAG: u16 = 0x04;
pub const PSH_FLAG: u16 = 0x08;
pub const ACK_FLAG: u16 = 0x10;
pub const URG_FLAG: u16 = 0x20;
pub const ECE_FLAG: u16 = 0x40;
pub const CWR_FLAG: u16 = 0x80;
// Compound flags, only ever set by the classifier.
pub const SYN_ACK_FLAG: u16 = 0x100;
pub const FIN_ACK_FLAG: u16 = 0x200;
pub const RST_ACK_FLAG: u16 = 0x400;

/// Default capacity of the per-CPU aggregation map. Userspace resizes it at load time.
pub const AGGREGATED_FLOWS_MAX_ENTRIES: u32 = 5000;
/// Byte size of the overflow ring buffer.
pub const DIRECT_FLOWS_BYTE_SIZE: u32 = 1 << 24;

/// Traffic direction relative to the observed interface, as IPFIX field 61.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Direction {
    Ingress = 0,
    Egress = 1,
}

impl Direction {
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Direction::Ingress),
            1 => Some(Direction::Egress),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Ingress => "ingress",
            Direction::Egress => "egress",
        }
    }
}

/// Attributes that uniquely identify a flow. Used as the aggregation map key,
/// so two ids are the same flow only if every byte matches.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(C, packed)]
pub struct FlowId {
    pub eth_protocol: u16,
    pub direction: u8,
    // L2 data link layer
    pub src_mac: [u8; ETH_ALEN],
    pub dst_mac: [u8; ETH_ALEN],
    // L3 network layer, IPv4 encoded as ::ffff:a.b.c.d
    pub src_ip: [u8; IP_MAX_LEN],
    pub dst_ip: [u8; IP_MAX_LEN],
    // L4 transport layer, host byte order
    pub src_port: u16,
    pub dst_port: u16,
    pub transport_protocol: u8,
    pub icmp_type: u8,
    pub icmp_code: u8,
    // OS interface index
    pub if_index: u32,
}

/// Aggregated metrics of a flow within one CPU (or worker shard).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C, packed)]
pub struct FlowMetrics {
    pub packets: u32,
    pub bytes: u64,
    // Flow start and end times as monotonic timestamps in nanoseconds,
    // as returned by bpf_ktime_get_ns()
    pub start_mono_time_ts: u64,
    pub end_mono_time_ts: u64,
    // Time of the packet that looked like a connection establishment, 0 if none
    pub conn_mono_time_ts: u64,
    pub flags: u16,
    // Positive errno of the failed map insertion that sent this flow through
    // the ring buffer, 0 otherwise.
    pub errno: u8,
}

impl FlowMetrics {
    /// Metrics of a flow whose first packet has just been seen.
    #[inline(always)]
    pub fn new_flow(packet_size: u64, ts: u64, flags: u16, conn_tstamp: bool) -> Self {
        FlowMetrics {
            packets: 1,
            bytes: packet_size,
            start_mono_time_ts: ts,
            end_mono_time_ts: ts,
            conn_mono_time_ts: if conn_tstamp { ts } else { 0 },
            flags,
            errno: 0,
        }
    }

    /// Folds one more packet into a resident flow.
    #[inline(always)]
    pub fn accumulate(&mut self, packet_size: u64, ts: u64, flags: u16, conn_tstamp: bool) {
        self.packets = self.packets.wrapping_add(1);
        self.bytes = self.bytes.wrapping_add(packet_size);
        self.end_mono_time_ts = ts;
        // concurrent inserts on a per-CPU map can leave the start unset
        if self.start_mono_time_ts == 0 {
            self.start_mono_time_ts = ts;
        }
        if conn_tstamp && self.conn_mono_time_ts == 0 {
            self.conn_mono_time_ts = ts;
        }
        self.flags |= flags;
    }

    /// Merges a partial view of the same flow taken on another CPU or shard,
    /// or delivered through the ring buffer.
    pub fn merge(&mut self, other: &FlowMetrics) {
        self.packets = self.packets.wrapping_add(other.packets);
        self.bytes = self.bytes.wrapping_add(other.bytes);
        self.start_mono_time_ts = min_set(self.start_mono_time_ts, other.start_mono_time_ts);
        if other.end_mono_time_ts > self.end_mono_time_ts {
            self.end_mono_time_ts = other.end_mono_time_ts;
        }
        self.conn_mono_time_ts = min_set(self.conn_mono_time_ts, other.conn_mono_time_ts);
        self.flags |= other.flags;
        if self.errno == 0 {
            self.errno = other.errno;
        }
    }
}

// Smallest of two timestamps where 0 means "not set".
#[inline(always)]
fn min_set(a: u64, b: u64) -> u64 {
    match (a, b) {
        (0, b) => b,
        (a, 0) => a,
        (a, b) => a.min(b),
    }
}

/// A complete flow, sent through the ring buffer when it can't be stored in
/// the aggregation map. Userspace parses this layout byte by byte.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C, packed)]
pub struct FlowRecord {
    pub id: FlowId,
    pub metrics: FlowMetrics,
}

impl FlowRecord {
    pub const LEN: usize = mem::size_of::<FlowRecord>();

    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: packed, no padding, every field is plain integer data.
        unsafe { core::slice::from_raw_parts(self as *const Self as *const u8, Self::LEN) }
    }

    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::LEN {
            return None;
        }
        // SAFETY: length checked above and any bit pattern is a valid record.
        Some(unsafe { (buf.as_ptr() as *const Self).read_unaligned() })
    }
}

/// Metadata preceding a raw packet sent on the payload sampling channel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C, packed)]
pub struct PayloadMeta {
    pub if_index: u32,
    pub pkt_len: u32,
}

impl PayloadMeta {
    pub const LEN: usize = mem::size_of::<PayloadMeta>();

    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::LEN {
            return None;
        }
        // SAFETY: length checked above and any bit pattern is valid.
        Some(unsafe { (buf.as_ptr() as *const Self).read_unaligned() })
    }
}

const _: () = assert!(mem::size_of::<FlowId>() == 58);
const _: () = assert!(mem::size_of::<FlowMetrics>() == 39);
const _: () = assert!(mem::size_of::<FlowRecord>() == 97);
const _: () = assert!(mem::size_of::<PayloadMeta>() == 8);

#[cfg(feature = "user")]
mod user_impls {
    extern crate aya;

    use super::{FlowId, FlowMetrics, FlowRecord, PayloadMeta};
    use aya::Pod;

    unsafe impl Pod for FlowId {}
    unsafe impl Pod for FlowMetrics {}
    unsafe impl Pod for FlowRecord {}
    unsafe impl Pod for PayloadMeta {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_flow_seeds_counters_and_times() {
        let m = FlowMetrics::new_flow(100, 42, SYN_FLAG, false);
        assert_eq!({ m.packets }, 1);
        assert_eq!({ m.bytes }, 100);
        assert_eq!({ m.start_mono_time_ts }, 42);
        assert_eq!({ m.end_mono_time_ts }, 42);
        assert_eq!({ m.conn_mono_time_ts }, 0);
        assert_eq!({ m.flags }, SYN_FLAG);
        assert_eq!({ m.errno }, 0);
    }

    #[test]
    fn accumulate_keeps_first_start_and_first_connection_time() {
        let mut m = FlowMetrics::new_flow(60, 10, SYN_ACK_FLAG, true);
        m.accumulate(40, 20, ACK_FLAG, false);
        m.accumulate(40, 30, ACK_FLAG, true);
        assert_eq!({ m.packets }, 3);
        assert_eq!({ m.bytes }, 140);
        assert_eq!({ m.start_mono_time_ts }, 10);
        assert_eq!({ m.end_mono_time_ts }, 30);
        assert_eq!({ m.conn_mono_time_ts }, 10);
        assert_eq!({ m.flags }, SYN_ACK_FLAG | ACK_FLAG);
    }

    #[test]
    fn accumulate_fills_unset_start() {
        let mut m = FlowMetrics::default();
        m.accumulate(10, 99, 0, false);
        assert_eq!({ m.start_mono_time_ts }, 99);
    }

    #[test]
    fn merge_takes_min_start_max_end_and_ors_flags() {
        let mut a = FlowMetrics::new_flow(10, 200, FIN_FLAG, false);
        let mut b = FlowMetrics::new_flow(20, 100, SYN_FLAG, true);
        b.accumulate(5, 300, 0, false);
        b.errno = 7;
        a.merge(&b);
        assert_eq!({ a.packets }, 3);
        assert_eq!({ a.bytes }, 35);
        assert_eq!({ a.start_mono_time_ts }, 100);
        assert_eq!({ a.end_mono_time_ts }, 300);
        assert_eq!({ a.conn_mono_time_ts }, 100);
        assert_eq!({ a.flags }, FIN_FLAG | SYN_FLAG);
        assert_eq!({ a.errno }, 7);
    }

    #[test]
    fn record_bytes_are_identity_then_metrics() {
        let record = FlowRecord {
            id: FlowId {
                eth_protocol: ETH_P_IP,
                if_index: 4,
                ..Default::default()
            },
            metrics: FlowMetrics::new_flow(100, 1, 0, false),
        };
        let bytes = record.as_bytes();
        assert_eq!(bytes.len(), 97);
        assert_eq!(&bytes[0..2], &ETH_P_IP.to_ne_bytes());
        assert_eq!(&bytes[54..58], &4u32.to_ne_bytes());
        assert_eq!(&bytes[58..62], &1u32.to_ne_bytes());
        assert_eq!(FlowRecord::from_bytes(bytes), Some(record));
        assert_eq!(FlowRecord::from_bytes(&bytes[..96]), None);
    }
}

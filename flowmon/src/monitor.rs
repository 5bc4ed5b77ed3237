use bytes::Bytes;
use flowmon_common::{
    cursor::HeaderCursor, parse::build_flow_id, Direction, FlowId, FlowMetrics,
};
use log::warn;
use rand::{rngs::StdRng, RngCore, SeedableRng};

use crate::{
    config::MonitorConfig,
    overflow::{OverflowError, OverflowSender},
    table::{Applied, FlowMap, FlowTable, ShardTable},
};

/// One observed frame, as handed over by a capture source.
#[derive(Clone, Debug)]
pub struct Packet {
    /// Captured bytes, starting at the Ethernet header. May be shorter than `len`.
    pub data: Bytes,
    /// Length of the frame on the wire.
    pub len: u64,
    pub if_index: u32,
    pub direction: Direction,
}

/// Diagnostic result of [`FlowMonitor::process`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Skipped,
    Discarded,
    Updated,
    Inserted,
    UpdateFailed(i32),
    Overflowed(i32),
    OverflowDropped(OverflowError),
}

/// Per-shard packet orchestrator: sampling, key building, aggregation.
pub struct FlowMonitor<M = ShardTable> {
    config: MonitorConfig,
    table: FlowTable<M>,
    overflow: OverflowSender,
    rng: StdRng,
}

impl FlowMonitor<ShardTable> {
    pub fn new(config: MonitorConfig, overflow: OverflowSender) -> Self {
        let map = ShardTable::with_max_entries(config.cache_max_flows);
        FlowMonitor::with_map(config, map, overflow, StdRng::from_os_rng())
    }
}

impl<M: FlowMap> FlowMonitor<M> {
    pub fn with_map(config: MonitorConfig, map: M, overflow: OverflowSender, rng: StdRng) -> Self {
        FlowMonitor {
            table: FlowTable::new(map, config.trace_messages),
            config,
            overflow,
            rng,
        }
    }

    pub fn process(&mut self, packet: &Packet) -> Outcome {
        self.process_with(packet, mono_time_ns)
    }

    /// Same as [`process`](Self::process) with an explicit monotonic timestamp.
    pub fn process_at(&mut self, packet: &Packet, ts: u64) -> Outcome {
        self.process_with(packet, || ts)
    }

    fn process_with(&mut self, packet: &Packet, now: impl FnOnce() -> u64) -> Outcome {
        // with sampling set, only 1 out of "sampling" packets is parsed
        let sampling = self.config.sampling;
        if sampling != 0 && self.rng.next_u32() % sampling != 0 {
            return Outcome::Skipped;
        }

        let cursor = HeaderCursor::new(&packet.data);
        let parsed = match build_flow_id(&cursor, packet.direction, packet.if_index) {
            Ok(parsed) => parsed,
            Err(_) => return Outcome::Discarded,
        };
        // one timestamp for the whole packet, taken once it is known to count
        let ts = now();

        match self
            .table
            .apply(&parsed.id, parsed.flags, parsed.conn_tstamp, packet.len, ts)
        {
            Applied::Updated => Outcome::Updated,
            Applied::Inserted => Outcome::Inserted,
            Applied::UpdateFailed(err) => Outcome::UpdateFailed(err.errno),
            Applied::Overflow(record) => match self.overflow.submit(&record) {
                Ok(()) => Outcome::Overflowed(record.metrics.errno as i32),
                Err(err) => {
                    if self.config.trace_messages {
                        warn!("couldn't reserve space in the overflow channel: {err}");
                    }
                    Outcome::OverflowDropped(err)
                }
            },
        }
    }

    /// Removes every flow of this shard.
    pub fn evict(&mut self) -> Vec<(FlowId, FlowMetrics)> {
        self.table.drain()
    }

    pub fn table(&self) -> &FlowTable<M> {
        &self.table
    }
}

/// Nanoseconds of `CLOCK_MONOTONIC`, the clock behind `bpf_ktime_get_ns`.
pub fn mono_time_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // CLOCK_MONOTONIC is always available on Linux
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        overflow::OverflowRing,
        table::{tests::FailingMap, ENOMEM},
        testutil::FrameBuilder,
    };
    use flowmon_common::{ACK_FLAG, IP4IN6_PREFIX, IPPROTO_TCP, IPPROTO_UDP, SYN_ACK_FLAG, SYN_FLAG};

    fn config(sampling: u32) -> MonitorConfig {
        MonitorConfig {
            sampling,
            ..Default::default()
        }
    }

    fn dns_packet() -> Packet {
        let frame = FrameBuilder::ipv4([5, 5, 5, 5], [6, 6, 6, 6])
            .udp(1000, 53)
            .padded_to(100)
            .build();
        Packet {
            len: frame.len() as u64,
            data: frame,
            if_index: 4,
            direction: Direction::Ingress,
        }
    }

    #[test]
    fn new_udp_flow() {
        let (tx, _rx) = OverflowRing::with_slots(4);
        let mut monitor = FlowMonitor::new(config(0), tx);
        let packet = dns_packet();
        assert_eq!(packet.len, 100);
        assert_eq!(monitor.process_at(&packet, 777), Outcome::Inserted);

        let flows = monitor.evict();
        assert_eq!(flows.len(), 1);
        let (id, m) = flows[0];
        assert_eq!(id.transport_protocol, IPPROTO_UDP);
        assert_eq!(({ id.src_port }, { id.dst_port }), (1000, 53));
        assert_eq!(id.src_ip[..12], IP4IN6_PREFIX);
        assert_eq!(id.src_ip[12..], [5, 5, 5, 5]);
        assert_eq!(id.dst_ip[12..], [6, 6, 6, 6]);
        assert_eq!({ id.if_index }, 4);
        assert_eq!(id.direction, Direction::Ingress as u8);
        assert_eq!({ m.packets }, 1);
        assert_eq!({ m.bytes }, 100);
        assert_eq!({ m.start_mono_time_ts }, 777);
        assert_eq!({ m.end_mono_time_ts }, 777);
        assert_eq!({ m.flags }, 0);
        assert_eq!({ m.conn_mono_time_ts }, 0);
        assert_eq!(m.errno, 0);
    }

    fn tcp_packet(seq: u32, flags: u8) -> Packet {
        let frame = FrameBuilder::ipv4([10, 0, 0, 2], [10, 0, 0, 1])
            .tcp(443, 51000, seq, flags)
            .build();
        Packet {
            len: frame.len() as u64,
            data: frame,
            if_index: 4,
            direction: Direction::Ingress,
        }
    }

    #[test]
    fn tcp_handshake_flags_and_connection_time() {
        let (tx, _rx) = OverflowRing::with_slots(4);
        let mut monitor = FlowMonitor::new(config(0), tx);
        assert_eq!(monitor.process_at(&tcp_packet(0, 0x02), 10), Outcome::Inserted);
        assert_eq!(monitor.process_at(&tcp_packet(0, 0x12), 20), Outcome::Updated);
        assert_eq!(monitor.process_at(&tcp_packet(1, 0x10), 30), Outcome::Updated);
        assert_eq!(monitor.process_at(&tcp_packet(1, 0x10), 40), Outcome::Updated);

        let flows = monitor.evict();
        assert_eq!(flows.len(), 1);
        let (id, m) = flows[0];
        assert_eq!(id.transport_protocol, IPPROTO_TCP);
        assert_eq!(({ id.src_port }, { id.dst_port }), (443, 51000));
        assert_eq!({ m.packets }, 4);
        assert_eq!({ m.flags }, SYN_FLAG | SYN_ACK_FLAG | ACK_FLAG);
        assert_eq!({ m.start_mono_time_ts }, 10);
        assert_eq!({ m.end_mono_time_ts }, 40);
        assert_eq!({ m.conn_mono_time_ts }, 20);
    }

    #[test]
    fn bare_ack_with_seq_one_marks_the_connection() {
        let (tx, _rx) = OverflowRing::with_slots(4);
        let mut monitor = FlowMonitor::new(config(0), tx);
        monitor.process_at(&tcp_packet(2, 0x10), 5);
        monitor.process_at(&tcp_packet(1, 0x10), 6);
        monitor.process_at(&tcp_packet(1, 0x10), 7);
        let m = monitor.evict()[0].1;
        assert_eq!({ m.flags }, ACK_FLAG);
        assert_eq!({ m.conn_mono_time_ts }, 6);
    }

    #[test]
    fn skipped_and_discarded_packets_never_read_the_clock() {
        let (tx, _rx) = OverflowRing::with_slots(4);
        let map = ShardTable::with_max_entries(16);
        let mut monitor =
            FlowMonitor::with_map(config(1000), map, tx, StdRng::seed_from_u64(7));
        let packet = dns_packet();
        let mut reads = 0u32;
        for _ in 0..5000 {
            monitor.process_with(&packet, || {
                reads += 1;
                1
            });
        }
        let processed = monitor.evict().first().map_or(0, |(_, m)| m.packets);
        assert!(reads < 5000);
        assert_eq!(reads, processed);

        let (tx, _rx) = OverflowRing::with_slots(4);
        let mut monitor = FlowMonitor::new(config(0), tx);
        let mut truncated = dns_packet();
        truncated.data = truncated.data.slice(..20);
        let outcome = monitor.process_with(&truncated, || panic!("clock read for a bad frame"));
        assert_eq!(outcome, Outcome::Discarded);
    }

    #[test]
    fn truncated_frames_leave_no_state() {
        let (tx, _rx) = OverflowRing::with_slots(4);
        let mut monitor = FlowMonitor::new(config(0), tx);
        let mut packet = dns_packet();
        packet.data = packet.data.slice(..30);
        assert_eq!(monitor.process(&packet), Outcome::Discarded);
        assert!(monitor.table().map().is_empty());
    }

    #[test]
    fn insertion_failure_goes_to_the_overflow_channel() {
        let (tx, mut rx) = OverflowRing::with_slots(4);
        let map = FailingMap {
            errno: ENOMEM,
            ..Default::default()
        };
        let mut monitor = FlowMonitor::with_map(config(0), map, tx, StdRng::seed_from_u64(1));
        let packet = dns_packet();
        assert_eq!(monitor.process_at(&packet, 5), Outcome::Overflowed(12));
        assert!(monitor.table().map().is_empty());

        let records = rx.drain();
        assert_eq!(records.len(), 1);
        let m = records[0].metrics;
        assert_eq!(m.errno, 12);
        assert_eq!({ m.packets }, 1);
        assert_eq!({ m.bytes }, 100);
        assert_eq!({ records[0].id.dst_port }, 53);
    }

    #[test]
    fn full_overflow_channel_drops_the_record() {
        let (tx, _rx) = OverflowRing::with_slots(1);
        let map = FailingMap {
            errno: ENOMEM,
            ..Default::default()
        };
        let mut monitor = FlowMonitor::with_map(config(0), map, tx, StdRng::seed_from_u64(1));
        let packet = dns_packet();
        assert_eq!(monitor.process_at(&packet, 1), Outcome::Overflowed(12));
        assert_eq!(
            monitor.process_at(&packet, 2),
            Outcome::OverflowDropped(OverflowError::ChannelFull)
        );
    }

    #[test]
    fn sampling_processes_about_one_in_n() {
        let (tx, _rx) = OverflowRing::with_slots(4);
        let map = ShardTable::with_max_entries(16);
        let mut monitor =
            FlowMonitor::with_map(config(1000), map, tx, StdRng::seed_from_u64(0x5eed));
        let packet = dns_packet();

        let mut processed = 0;
        for ts in 1..=10_000 {
            match monitor.process_at(&packet, ts) {
                Outcome::Skipped => {}
                Outcome::Inserted | Outcome::Updated => processed += 1,
                other => panic!("unexpected outcome {other:?}"),
            }
        }
        assert!((1..=30).contains(&processed), "processed {processed}");

        let flows = monitor.evict();
        assert_eq!(flows.len(), 1);
        assert_eq!({ flows[0].1.packets }, processed);
    }

    #[test]
    fn clock_is_monotonic() {
        let a = mono_time_ns();
        let b = mono_time_ns();
        assert!(a > 0 && b >= a);
    }
}

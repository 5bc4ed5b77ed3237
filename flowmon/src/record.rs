use std::{
    ffi::CStr,
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use flowmon_common::{Direction, FlowId, FlowMetrics, IP4IN6_PREFIX};

use crate::monitor::mono_time_ns;

/// Converts kernel monotonic timestamps into wall-clock time.
#[derive(Clone, Copy, Debug)]
pub struct MonoClock {
    boot: SystemTime,
}

impl MonoClock {
    /// Takes the offset between both clocks once, at startup.
    pub fn now() -> Self {
        let wall = SystemTime::now();
        let mono = Duration::from_nanos(mono_time_ns());
        MonoClock {
            boot: wall.checked_sub(mono).unwrap_or(UNIX_EPOCH),
        }
    }

    pub fn with_boot_time(boot: SystemTime) -> Self {
        MonoClock { boot }
    }

    pub fn to_wall(&self, mono_ns: u64) -> SystemTime {
        self.boot + Duration::from_nanos(mono_ns)
    }
}

/// An exported flow.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    pub id: FlowId,
    pub metrics: FlowMetrics,
    pub interface: String,
    /// Set by the deduper in mark-only mode.
    pub duplicate: bool,
    pub time_flow_start: SystemTime,
    pub time_flow_end: SystemTime,
}

impl Record {
    pub fn new(id: FlowId, metrics: FlowMetrics, interface: String, clock: &MonoClock) -> Self {
        Record {
            time_flow_start: clock.to_wall(metrics.start_mono_time_ts),
            time_flow_end: clock.to_wall(metrics.end_mono_time_ts),
            id,
            metrics,
            interface,
            duplicate: false,
        }
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let id = &self.id;
        let m = &self.metrics;
        let direction = Direction::from_raw(id.direction).map_or("unknown", Direction::as_str);
        write!(
            f,
            "{} {} proto={} {}:{} -> {}:{} if={}({}) mac={} -> {}",
            epoch_millis(self.time_flow_start),
            direction,
            id.transport_protocol,
            ip_addr(&id.src_ip),
            { id.src_port },
            ip_addr(&id.dst_ip),
            { id.dst_port },
            self.interface,
            { id.if_index },
            Mac(&id.src_mac),
            Mac(&id.dst_mac),
        )?;
        write!(
            f,
            " packets={} bytes={} duration={}ms flags={:#05x}",
            { m.packets },
            { m.bytes },
            { m.end_mono_time_ts }.saturating_sub({ m.start_mono_time_ts }) / 1_000_000,
            { m.flags },
        )?;
        if id.icmp_type != 0 || id.icmp_code != 0 {
            write!(f, " icmp={}/{}", id.icmp_type, id.icmp_code)?;
        }
        if m.errno != 0 {
            write!(f, " errno={}", m.errno)?;
        }
        if self.duplicate {
            write!(f, " duplicate")?;
        }
        Ok(())
    }
}

fn epoch_millis(t: SystemTime) -> u128 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
}

/// Shows IPv4-mapped addresses as plain IPv4.
pub fn ip_addr(raw: &[u8; 16]) -> IpAddr {
    if raw[..12] == IP4IN6_PREFIX {
        IpAddr::V4(Ipv4Addr::new(raw[12], raw[13], raw[14], raw[15]))
    } else {
        IpAddr::V6(Ipv6Addr::from(*raw))
    }
}

struct Mac<'a>(&'a [u8; 6]);

impl fmt::Display for Mac<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            m[0], m[1], m[2], m[3], m[4], m[5]
        )
    }
}

/// Resolves an interface index to its name, falling back to the index itself.
pub fn interface_name(if_index: u32) -> String {
    let mut buf = [0 as libc::c_char; libc::IF_NAMESIZE];
    let ret = unsafe { libc::if_indextoname(if_index, buf.as_mut_ptr()) };
    if ret.is_null() {
        return if_index.to_string();
    }
    unsafe { CStr::from_ptr(buf.as_ptr()) }
        .to_string_lossy()
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowmon_common::{parse::ip4_in_6, IPPROTO_TCP, SYN_ACK_FLAG};

    fn record() -> Record {
        let id = FlowId {
            eth_protocol: flowmon_common::ETH_P_IP,
            direction: Direction::Egress as u8,
            src_mac: [0x02, 0, 0, 0, 0, 0x0a],
            src_ip: ip4_in_6([10, 0, 0, 1]),
            dst_ip: ip4_in_6([10, 0, 0, 2]),
            src_port: 443,
            dst_port: 51000,
            transport_protocol: IPPROTO_TCP,
            if_index: 3,
            ..Default::default()
        };
        let metrics = FlowMetrics::new_flow(60, 1_000_000_000, SYN_ACK_FLAG, true);
        let clock = MonoClock::with_boot_time(UNIX_EPOCH + Duration::from_secs(100));
        Record::new(id, metrics, "eth0".into(), &clock)
    }

    #[test]
    fn monotonic_times_are_shifted_by_boot_time() {
        let r = record();
        assert_eq!(r.time_flow_start, UNIX_EPOCH + Duration::from_secs(101));
        assert_eq!(r.time_flow_end, r.time_flow_start);
    }

    #[test]
    fn display_is_one_line_with_ipv4_addresses() {
        let line = record().to_string();
        assert!(!line.contains('\n'));
        assert!(line.starts_with("101000 egress proto=6 10.0.0.1:443 -> 10.0.0.2:51000 if=eth0(3)"));
        assert!(line.contains("mac=02:00:00:00:00:0a -> 00:00:00:00:00:00"));
        assert!(line.contains("packets=1 bytes=60 duration=0ms flags=0x100"));
        assert!(!line.contains("errno"));
        assert!(!line.contains("duplicate"));
    }

    #[test]
    fn ipv6_addresses_are_kept() {
        let mut raw = [0u8; 16];
        raw[0] = 0x20;
        raw[1] = 0x01;
        raw[15] = 1;
        assert_eq!(ip_addr(&raw).to_string(), "2001::1");
        assert_eq!(ip_addr(&ip4_in_6([5, 5, 5, 5])).to_string(), "5.5.5.5");
    }

    #[test]
    fn unknown_interfaces_fall_back_to_the_index() {
        assert_eq!(interface_name(u32::MAX), u32::MAX.to_string());
    }
}

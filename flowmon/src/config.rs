use std::time::Duration;

use anyhow::{ensure, Result};
use flowmon_common::{FlowRecord, AGGREGATED_FLOWS_MAX_ENTRIES, DIRECT_FLOWS_BYTE_SIZE};

/// Settings read by every packet-path orchestrator. Fixed once the monitor is built.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MonitorConfig {
    /// Process 1 out of `sampling` packets, 0 disables sampling.
    pub sampling: u32,
    /// Log per-packet failures (failed updates, dropped overflow records).
    pub trace_messages: bool,
    /// Capacity of each aggregation shard.
    pub cache_max_flows: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig {
            sampling: 0,
            trace_messages: false,
            cache_max_flows: AGGREGATED_FLOWS_MAX_ENTRIES,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeduperMode {
    None,
    FirstCome,
}

/// Settings of the userspace side that collects and exports flows.
#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub monitor: MonitorConfig,
    /// How often the aggregation tables are evicted.
    pub cache_active_timeout: Duration,
    /// Byte size of the overflow channel, split into fixed-size record slots.
    pub overflow_buffer_bytes: usize,
    pub deduper: DeduperMode,
    pub deduper_fc_expiry: Duration,
    pub deduper_just_mark: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        let cache_active_timeout = Duration::from_secs(5);
        AgentConfig {
            monitor: MonitorConfig::default(),
            cache_active_timeout,
            overflow_buffer_bytes: DIRECT_FLOWS_BYTE_SIZE as usize,
            deduper: DeduperMode::None,
            deduper_fc_expiry: 2 * cache_active_timeout,
            deduper_just_mark: false,
        }
    }
}

impl AgentConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.monitor.cache_max_flows > 0,
            "cache max flows must be greater than zero"
        );
        ensure!(
            !self.cache_active_timeout.is_zero(),
            "cache active timeout must be greater than zero"
        );
        ensure!(
            self.overflow_buffer_bytes >= FlowRecord::LEN,
            "overflow buffer must hold at least one {}-byte record",
            FlowRecord::LEN
        );
        if self.deduper == DeduperMode::FirstCome {
            ensure!(
                !self.deduper_fc_expiry.is_zero(),
                "deduper expiry must be greater than zero"
            );
        }
        Ok(())
    }

    /// Number of record slots in the overflow channel.
    pub fn overflow_slots(&self) -> usize {
        self.overflow_buffer_bytes / FlowRecord::LEN
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = AgentConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.monitor.sampling, 0);
        assert_eq!(cfg.deduper_fc_expiry, Duration::from_secs(10));
        assert_eq!(cfg.overflow_slots(), (1 << 24) / 97);
    }

    #[test]
    fn rejects_empty_cache_and_tiny_ring() {
        let mut cfg = AgentConfig::default();
        cfg.monitor.cache_max_flows = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = AgentConfig::default();
        cfg.overflow_buffer_bytes = 96;
        assert!(cfg.validate().is_err());

        let mut cfg = AgentConfig::default();
        cfg.deduper = DeduperMode::FirstCome;
        cfg.deduper_fc_expiry = Duration::ZERO;
        assert!(cfg.validate().is_err());
    }
}

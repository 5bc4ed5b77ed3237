use std::collections::HashMap;

use flowmon_common::{FlowId, FlowMetrics, FlowRecord};
use log::info;

use crate::{
    config::{AgentConfig, DeduperMode},
    dedupe::Deduper,
    merge::Accounter,
    record::{MonoClock, Record},
};

/// Last stage of the pipeline: accounts overflow records, merges them with
/// the evicted tables, deduplicates and logs every flow.
pub struct Exporter {
    accounter: Accounter,
    deduper: Option<Deduper>,
}

impl Exporter {
    pub fn new(config: &AgentConfig, clock: MonoClock) -> Self {
        let deduper = match config.deduper {
            DeduperMode::None => None,
            DeduperMode::FirstCome => Some(Deduper::new(
                config.deduper_fc_expiry,
                config.deduper_just_mark,
            )),
        };
        Exporter {
            accounter: Accounter::new(config.monitor.cache_max_flows, clock),
            deduper,
        }
    }

    pub fn account(&mut self, record: FlowRecord) -> Vec<Record> {
        match self.accounter.account(record) {
            Some(records) => self.export(records),
            None => Vec::new(),
        }
    }

    pub fn evict(&mut self, snapshot: HashMap<FlowId, FlowMetrics>) -> Vec<Record> {
        let records = self.accounter.evict(snapshot);
        self.export(records)
    }

    fn export(&mut self, records: Vec<Record>) -> Vec<Record> {
        let records = match &mut self.deduper {
            Some(deduper) => deduper.dedupe(records),
            None => records,
        };
        for record in &records {
            info!("{record}");
        }
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::UNIX_EPOCH;

    fn id(if_index: u32) -> FlowId {
        FlowId {
            src_port: 1000,
            dst_port: 53,
            if_index,
            ..Default::default()
        }
    }

    #[test]
    fn eviction_merges_overflow_and_drops_duplicates() {
        let config = AgentConfig {
            deduper: DeduperMode::FirstCome,
            ..Default::default()
        };
        let mut exporter = Exporter::new(&config, MonoClock::with_boot_time(UNIX_EPOCH));

        let mut spilled = FlowMetrics::new_flow(50, 9, 0, false);
        spilled.errno = 7;
        assert!(exporter
            .account(FlowRecord {
                id: id(1),
                metrics: spilled,
            })
            .is_empty());

        let snapshot = HashMap::from([(id(1), FlowMetrics::new_flow(100, 3, 0, false))]);
        let records = exporter.evict(snapshot);
        assert_eq!(records.len(), 1);
        let m = records[0].metrics;
        assert_eq!({ m.packets }, 2);
        assert_eq!({ m.bytes }, 150);
        assert_eq!(m.errno, 7);

        // same flow seen on a second interface
        let snapshot = HashMap::from([(id(2), FlowMetrics::new_flow(100, 4, 0, false))]);
        assert!(exporter.evict(snapshot).is_empty());
    }

    #[test]
    fn without_deduper_every_interface_is_exported() {
        let mut exporter = Exporter::new(
            &AgentConfig::default(),
            MonoClock::with_boot_time(UNIX_EPOCH),
        );
        let snapshot = HashMap::from([
            (id(1), FlowMetrics::new_flow(100, 3, 0, false)),
            (id(2), FlowMetrics::new_flow(100, 4, 0, false)),
        ]);
        assert_eq!(exporter.evict(snapshot).len(), 2);
    }
}

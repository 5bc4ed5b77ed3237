//! Downstream merge of partial flow views: per-shard snapshots and overflow records.

use std::collections::HashMap;

use flowmon_common::{FlowId, FlowMetrics, FlowRecord};
use log::debug;

use crate::record::{interface_name, MonoClock, Record};

/// Folds per-shard (or per-CPU) views into one entry per flow.
pub fn merge_shards<I, S>(shards: I) -> HashMap<FlowId, FlowMetrics>
where
    I: IntoIterator<Item = S>,
    S: IntoIterator<Item = (FlowId, FlowMetrics)>,
{
    let mut merged: HashMap<FlowId, FlowMetrics> = HashMap::new();
    for shard in shards {
        for (id, metrics) in shard {
            merged
                .entry(id)
                .and_modify(|resident| resident.merge(&metrics))
                .or_insert(metrics);
        }
    }
    merged
}

/// Accumulates overflow records between two evictions of the aggregation tables.
pub struct Accounter {
    max_entries: usize,
    entries: HashMap<FlowId, FlowMetrics>,
    clock: MonoClock,
    names: HashMap<u32, String>,
}

impl Accounter {
    pub fn new(max_entries: u32, clock: MonoClock) -> Self {
        Accounter {
            max_entries: max_entries as usize,
            entries: HashMap::new(),
            clock,
            names: HashMap::new(),
        }
    }

    /// Buffers an overflow record. Returns the buffered flows when the buffer
    /// reached its capacity and had to be evicted early.
    pub fn account(&mut self, record: FlowRecord) -> Option<Vec<Record>> {
        let id = record.id;
        let metrics = record.metrics;
        self.entries
            .entry(id)
            .and_modify(|resident| resident.merge(&metrics))
            .or_insert(metrics);

        if self.entries.len() < self.max_entries {
            return None;
        }
        debug!("overflow accounter full, evicting {} flows", self.entries.len());
        Some(self.evict(HashMap::new()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Merges the buffered overflow records into a table snapshot and turns
    /// every flow into an exportable record.
    pub fn evict(&mut self, snapshot: HashMap<FlowId, FlowMetrics>) -> Vec<Record> {
        let buffered = std::mem::take(&mut self.entries);
        let merged = merge_shards([snapshot, buffered]);
        merged
            .into_iter()
            .map(|(id, metrics)| {
                let interface = self
                    .names
                    .entry(id.if_index)
                    .or_insert_with(|| interface_name(id.if_index))
                    .clone();
                Record::new(id, metrics, interface, &self.clock)
            })
            .collect()
    }
}

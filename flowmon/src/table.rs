//! Per-shard aggregation table and the merge-or-insert rules applied to it.

use std::collections::HashMap;

use flowmon_common::{FlowId, FlowMetrics, FlowRecord};
use log::debug;
use thiserror::Error;

pub const E2BIG: i32 = libc::E2BIG;
pub const ENOMEM: i32 = libc::ENOMEM;
pub const EBUSY: i32 = libc::EBUSY;

/// A map write was refused. Carries the positive errno, as the kernel map API does.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("flow map update failed with errno {errno}")]
pub struct UpdateError {
    pub errno: i32,
}

/// Key to metrics storage of one execution unit.
///
/// Writes are insert-or-overwrite and may fail instead of blocking, like a
/// BPF hash map updated with `BPF_ANY`.
pub trait FlowMap {
    fn lookup(&self, id: &FlowId) -> Option<FlowMetrics>;
    fn update(&mut self, id: &FlowId, metrics: &FlowMetrics) -> Result<(), UpdateError>;
    /// Removes and returns every resident flow.
    fn drain(&mut self) -> Vec<(FlowId, FlowMetrics)>;
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Bounded in-memory shard. New keys are refused with `E2BIG` once full.
#[derive(Debug)]
pub struct ShardTable {
    max_entries: usize,
    flows: HashMap<FlowId, FlowMetrics>,
}

impl ShardTable {
    pub fn with_max_entries(max_entries: u32) -> Self {
        ShardTable {
            max_entries: max_entries as usize,
            flows: HashMap::new(),
        }
    }
}

impl FlowMap for ShardTable {
    fn lookup(&self, id: &FlowId) -> Option<FlowMetrics> {
        self.flows.get(id).copied()
    }

    fn update(&mut self, id: &FlowId, metrics: &FlowMetrics) -> Result<(), UpdateError> {
        if let Some(resident) = self.flows.get_mut(id) {
            *resident = *metrics;
            return Ok(());
        }
        if self.flows.len() >= self.max_entries {
            return Err(UpdateError { errno: E2BIG });
        }
        self.flows.insert(*id, *metrics);
        Ok(())
    }

    fn drain(&mut self) -> Vec<(FlowId, FlowMetrics)> {
        self.flows.drain().collect()
    }

    fn len(&self) -> usize {
        self.flows.len()
    }
}

/// What happened to a packet handed to [`FlowTable::apply`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Applied {
    /// Merged into a resident flow.
    Updated,
    /// Stored as a new flow.
    Inserted,
    /// Writing back a resident flow failed. The packet is not resubmitted
    /// anywhere, since the resident copy already holds earlier packets.
    UpdateFailed(UpdateError),
    /// A new flow could not be stored. The single-packet record, with its
    /// errno stamped, must go to the overflow channel.
    Overflow(FlowRecord),
}

/// Aggregation table manager for one shard.
#[derive(Debug)]
pub struct FlowTable<M> {
    map: M,
    trace_messages: bool,
}

impl<M: FlowMap> FlowTable<M> {
    pub fn new(map: M, trace_messages: bool) -> Self {
        FlowTable {
            map,
            trace_messages,
        }
    }

    pub fn apply(
        &mut self,
        id: &FlowId,
        flags: u16,
        conn_tstamp: bool,
        packet_size: u64,
        ts: u64,
    ) -> Applied {
        if let Some(mut aggregate_flow) = self.map.lookup(id) {
            aggregate_flow.accumulate(packet_size, ts, flags, conn_tstamp);
            return match self.map.update(id, &aggregate_flow) {
                Ok(()) => Applied::Updated,
                Err(err) => {
                    if self.trace_messages {
                        debug!("error updating flow: {err}");
                    }
                    Applied::UpdateFailed(err)
                }
            };
        }

        let mut new_flow = FlowMetrics::new_flow(packet_size, ts, flags, conn_tstamp);
        match self.map.update(id, &new_flow) {
            Ok(()) => Applied::Inserted,
            Err(err) => {
                if self.trace_messages {
                    debug!("error adding flow: {err}");
                }
                new_flow.errno = err.errno.clamp(0, u8::MAX as i32) as u8;
                Applied::Overflow(FlowRecord {
                    id: *id,
                    metrics: new_flow,
                })
            }
        }
    }

    pub fn map(&self) -> &M {
        &self.map
    }

    pub fn drain(&mut self) -> Vec<(FlowId, FlowMetrics)> {
        self.map.drain()
    }
}

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use flowmon_common::FlowId;
use log::debug;

use crate::record::Record;

struct Owner {
    if_index: u32,
    expiry: Instant,
}

/// Filters flows seen on more than one interface, keeping the first interface
/// that reported them until the flow stays idle for the expiry time.
pub struct Deduper {
    expire: Duration,
    just_mark: bool,
    owners: HashMap<FlowId, Owner>,
}

impl Deduper {
    pub fn new(expire: Duration, just_mark: bool) -> Self {
        Deduper {
            expire,
            just_mark,
            owners: HashMap::new(),
        }
    }

    pub fn dedupe(&mut self, records: Vec<Record>) -> Vec<Record> {
        self.dedupe_at(records, Instant::now())
    }

    pub fn dedupe_at(&mut self, records: Vec<Record>, now: Instant) -> Vec<Record> {
        self.remove_expired(now);
        records
            .into_iter()
            .filter_map(|mut record| {
                if self.is_dupe(&record.id, now) {
                    if !self.just_mark {
                        return None;
                    }
                    record.duplicate = true;
                }
                Some(record)
            })
            .collect()
    }

    fn is_dupe(&mut self, id: &FlowId, now: Instant) -> bool {
        let expiry = now + self.expire;
        let owner = self.owners.entry(dedupe_key(id)).or_insert(Owner {
            if_index: id.if_index,
            expiry,
        });
        // any activity of the flow, whatever the interface, refreshes it
        owner.expiry = expiry;
        owner.if_index != id.if_index
    }

    fn remove_expired(&mut self, now: Instant) {
        let before = self.owners.len();
        self.owners.retain(|_, owner| owner.expiry >= now);
        let evicted = before - self.owners.len();
        if evicted > 0 {
            debug!(
                "{evicted} entries evicted from the deduper cache, {} remaining",
                self.owners.len()
            );
        }
    }
}

/// The flow identity with the fields that differ between interfaces erased.
pub fn dedupe_key(id: &FlowId) -> FlowId {
    FlowId {
        if_index: 0,
        src_mac: [0; 6],
        dst_mac: [0; 6],
        direction: 0,
        ..*id
    }
}

//! Loader and map access for the TC flow monitor program.

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use aya::{
    maps::{perf::AsyncPerfEventArray, MapData, PerCpuHashMap, RingBuf},
    programs::{tc, SchedClassifier, TcAttachType},
    Bpf, BpfLoader,
};
use aya_log::BpfLogger;
use flowmon_common::{FlowId, FlowMetrics, FlowRecord};
use log::{debug, warn};
use tokio::{io::unix::AsyncFd, sync::mpsc};

use crate::{config::MonitorConfig, pool::Snapshot};

pub const AGGREGATED_FLOWS: &str = "AGGREGATED_FLOWS";
pub const DIRECT_FLOWS: &str = "DIRECT_FLOWS";
pub const PACKET_PAYLOADS: &str = "PACKET_PAYLOADS";

const INGRESS_FLOW_PARSE: &str = "ingress_flow_parse";
const EGRESS_FLOW_PARSE: &str = "egress_flow_parse";
const INGRESS_PAYLOAD_PARSE: &str = "ingress_payload_parse";
const EGRESS_PAYLOAD_PARSE: &str = "egress_payload_parse";

/// Which TC hooks get the flow (and payload) classifiers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Hooks {
    pub ingress: bool,
    pub egress: bool,
    pub payloads: bool,
}

pub struct FlowFetcher {
    bpf: Bpf,
    aggregated: PerCpuHashMap<MapData, FlowId, FlowMetrics>,
}

impl FlowFetcher {
    /// Loads the object file, rewriting its configuration globals and sizing
    /// the aggregation map.
    pub fn load(path: &Path, config: &MonitorConfig) -> Result<Self> {
        let trace_messages = u8::from(config.trace_messages);
        let mut bpf = BpfLoader::new()
            .set_global("SAMPLING", &config.sampling, true)
            .set_global("TRACE_MESSAGES", &trace_messages, true)
            .set_max_entries(AGGREGATED_FLOWS, config.cache_max_flows)
            .load_file(path)
            .with_context(|| format!("failed to load eBPF object {}", path.display()))?;

        if let Err(e) = BpfLogger::init(&mut bpf) {
            // This can happen if you remove all log statements from your eBPF program.
            warn!("failed to initialize eBPF logger: {}", e);
        }

        let map = bpf
            .take_map(AGGREGATED_FLOWS)
            .with_context(|| format!("map {AGGREGATED_FLOWS} not found"))?;
        let aggregated = PerCpuHashMap::try_from(map)
            .with_context(|| format!("map {AGGREGATED_FLOWS} has wrong type"))?;

        Ok(FlowFetcher { bpf, aggregated })
    }

    pub fn attach(&mut self, iface: &str, hooks: Hooks) -> Result<()> {
        if let Err(err) = tc::qdisc_add_clsact(iface) {
            debug!("clsact exists or failed to add on {iface}: {err}");
        }
        if hooks.ingress {
            self.attach_classifier(iface, INGRESS_FLOW_PARSE, TcAttachType::Ingress)?;
        }
        if hooks.egress {
            self.attach_classifier(iface, EGRESS_FLOW_PARSE, TcAttachType::Egress)?;
        }
        if hooks.payloads {
            self.attach_classifier(iface, INGRESS_PAYLOAD_PARSE, TcAttachType::Ingress)?;
            self.attach_classifier(iface, EGRESS_PAYLOAD_PARSE, TcAttachType::Egress)?;
        }
        Ok(())
    }

    fn attach_classifier(&mut self, iface: &str, name: &str, attach_type: TcAttachType) -> Result<()> {
        let program: &mut SchedClassifier = self
            .bpf
            .program_mut(name)
            .with_context(|| format!("program {name} not found"))?
            .try_into()
            .with_context(|| format!("program {name} has wrong type"))?;
        program
            .load()
            .with_context(|| format!("failed to load program {name}"))?;
        program
            .attach(iface, attach_type)
            .with_context(|| format!("failed to attach {name} on {iface}"))?;
        Ok(())
    }

    pub fn take_direct_flows(&mut self) -> Result<RingBuf<MapData>> {
        let map = self
            .bpf
            .take_map(DIRECT_FLOWS)
            .with_context(|| format!("map {DIRECT_FLOWS} not found"))?;
        RingBuf::try_from(map).with_context(|| format!("map {DIRECT_FLOWS} has wrong type"))
    }

    pub fn take_packet_payloads(&mut self) -> Result<AsyncPerfEventArray<MapData>> {
        let map = self
            .bpf
            .take_map(PACKET_PAYLOADS)
            .with_context(|| format!("map {PACKET_PAYLOADS} not found"))?;
        AsyncPerfEventArray::try_from(map)
            .with_context(|| format!("map {PACKET_PAYLOADS} has wrong type"))
    }

    /// Reads and removes every aggregated flow. Returns one snapshot per CPU.
    ///
    /// Entries are deleted one by one, so packets counted between the read
    /// and the delete of a key are lost.
    pub fn lookup_and_delete(&mut self) -> Result<Vec<Snapshot>> {
        let mut entries = Vec::new();
        for item in self.aggregated.iter() {
            let (id, per_cpu) = item.map_err(|e| anyhow!("failed to iterate flows: {e}"))?;
            entries.push((id, per_cpu.iter().copied().collect::<Vec<_>>()));
        }
        for (id, _) in &entries {
            if let Err(e) = self.aggregated.remove(id) {
                debug!("failed to delete flow: {e}");
            }
        }
        Ok(split_per_cpu(entries))
    }
}

/// Turns per-CPU map values into one snapshot per CPU, leaving out the CPUs
/// that never saw the flow.
pub fn split_per_cpu<I>(entries: I) -> Vec<Snapshot>
where
    I: IntoIterator<Item = (FlowId, Vec<FlowMetrics>)>,
{
    let mut shards: Vec<Snapshot> = Vec::new();
    for (id, per_cpu) in entries {
        if shards.len() < per_cpu.len() {
            shards.resize_with(per_cpu.len(), Vec::new);
        }
        for (cpu, metrics) in per_cpu.into_iter().enumerate() {
            if metrics.packets != 0 {
                shards[cpu].push((id, metrics));
            }
        }
    }
    shards
}

/// Forwards every record of the `DIRECT_FLOWS` ring buffer until the receiver goes away.
pub async fn forward_direct_flows(ring: RingBuf<MapData>, tx: mpsc::Sender<FlowRecord>) -> Result<()> {
    let mut async_ring_buf = AsyncFd::new(ring).context("failed to register ring buffer")?;
    loop {
        let mut guard = async_ring_buf.readable_mut().await?;
        let entry = guard.get_inner_mut();
        while let Some(item) = entry.next() {
            match FlowRecord::from_bytes(&item) {
                Some(record) => {
                    if tx.send(record).await.is_err() {
                        return Ok(());
                    }
                }
                None => warn!("discarding {}-byte ring buffer entry", item.len()),
            }
        }
        guard.clear_ready();
    }
}

use std::{path::PathBuf, time::Duration};

use anyhow::Context;
use aya::{
    maps::{perf::AsyncPerfEventArray, MapData},
    util::online_cpus,
};
use bytes::BytesMut;
use clap::{Args, Parser, Subcommand, ValueEnum};
use flowmon::{
    config::{AgentConfig, DeduperMode, MonitorConfig},
    ebpf::{forward_direct_flows, FlowFetcher, Hooks},
    export::Exporter,
    merge::merge_shards,
    overflow::OverflowRing,
    pool::{DispatchError, WorkerPool, DEFAULT_QUEUE_LEN},
    record::MonoClock,
    socket::PacketSocket,
};
use flowmon_common::{PayloadMeta, AGGREGATED_FLOWS_MAX_ENTRIES, DIRECT_FLOWS_BYTE_SIZE};
use log::{debug, info, warn};
use tokio::{signal, sync::mpsc, task, time};

#[derive(Debug, Parser)]
#[command(about = "Per-interface network flow monitor")]
struct Opt {
    #[command(flatten)]
    agent: AgentOpt,
    #[command(subcommand)]
    source: Source,
}

#[derive(Debug, Args)]
struct AgentOpt {
    /// Process 1 out of N packets, 0 disables sampling
    #[arg(long, global = true, env = "SAMPLING", default_value_t = 0)]
    sampling: u32,
    /// Log per-packet failures of the flow tables
    #[arg(long, global = true, env = "TRACE_MESSAGES")]
    trace_messages: bool,
    /// Capacity of the aggregation table of each CPU or worker
    #[arg(long, global = true, env = "CACHE_MAX_FLOWS", default_value_t = AGGREGATED_FLOWS_MAX_ENTRIES)]
    cache_max_flows: u32,
    /// Seconds between two evictions of the aggregation tables
    #[arg(long, global = true, env = "CACHE_ACTIVE_TIMEOUT", default_value_t = 5)]
    cache_active_timeout: u64,
    /// Size of the overflow channel in bytes
    #[arg(long, global = true, env = "OVERFLOW_BUFFER_BYTES", default_value_t = DIRECT_FLOWS_BYTE_SIZE as usize)]
    overflow_buffer_bytes: usize,
    #[arg(long, global = true, env = "DEDUPER", value_enum, default_value_t = DeduperOpt::None)]
    deduper: DeduperOpt,
    /// Seconds a deduplicated flow is remembered, twice the active timeout by default
    #[arg(long, global = true, env = "DEDUPER_FC_EXPIRY")]
    deduper_fc_expiry: Option<u64>,
    /// Mark duplicated flows instead of dropping them
    #[arg(long, global = true, env = "DEDUPER_JUST_MARK")]
    deduper_just_mark: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum DeduperOpt {
    None,
    FirstCome,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum DirectionOpt {
    Ingress,
    Egress,
    Both,
}

#[derive(Debug, Subcommand)]
enum Source {
    /// Attach the eBPF classifiers to the TC hooks of an interface
    Tc {
        #[arg(short, long, default_value = "eth0")]
        iface: String,
        #[arg(long, env = "BPF_OBJECT", default_value = "target/bpfel-unknown-none/release/flowmon")]
        bpf_object: PathBuf,
        #[arg(long, value_enum, default_value_t = DirectionOpt::Both)]
        direction: DirectionOpt,
        /// Also export DNS packets on the payload channel
        #[arg(long)]
        payloads: bool,
    },
    /// Capture with an AF_PACKET socket and aggregate in worker threads
    Socket {
        #[arg(short, long, default_value = "eth0")]
        iface: String,
        #[arg(short, long, default_value_t = 4)]
        workers: usize,
        /// Packets each worker can have queued before new ones are dropped
        #[arg(long, default_value_t = DEFAULT_QUEUE_LEN)]
        queue_len: usize,
    },
}

impl AgentOpt {
    fn to_config(&self) -> AgentConfig {
        let cache_active_timeout = Duration::from_secs(self.cache_active_timeout);
        AgentConfig {
            monitor: MonitorConfig {
                sampling: self.sampling,
                trace_messages: self.trace_messages,
                cache_max_flows: self.cache_max_flows,
            },
            cache_active_timeout,
            overflow_buffer_bytes: self.overflow_buffer_bytes,
            deduper: match self.deduper {
                DeduperOpt::None => DeduperMode::None,
                DeduperOpt::FirstCome => DeduperMode::FirstCome,
            },
            deduper_fc_expiry: self
                .deduper_fc_expiry
                .map(Duration::from_secs)
                .unwrap_or(2 * cache_active_timeout),
            deduper_just_mark: self.deduper_just_mark,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let opt = Opt::parse();

    env_logger::init();

    let config = opt.agent.to_config();
    config.validate().context("invalid configuration")?;
    let exporter = Exporter::new(&config, MonoClock::now());

    match opt.source {
        Source::Tc {
            iface,
            bpf_object,
            direction,
            payloads,
        } => {
            let hooks = Hooks {
                ingress: matches!(direction, DirectionOpt::Ingress | DirectionOpt::Both),
                egress: matches!(direction, DirectionOpt::Egress | DirectionOpt::Both),
                payloads,
            };
            run_tc(&config, exporter, &iface, &bpf_object, hooks).await
        }
        Source::Socket {
            iface,
            workers,
            queue_len,
        } => run_socket(&config, exporter, &iface, workers, queue_len).await,
    }
}

async fn run_tc(
    config: &AgentConfig,
    mut exporter: Exporter,
    iface: &str,
    bpf_object: &std::path::Path,
    hooks: Hooks,
) -> Result<(), anyhow::Error> {
    // Bump the memlock rlimit. This is needed for older kernels that don't use the
    // new memcg based accounting, see https://lwn.net/Articles/837122/
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        debug!("remove limit on locked memory failed, ret is: {}", ret);
    }

    let mut fetcher = FlowFetcher::load(bpf_object, &config.monitor)?;
    fetcher.attach(iface, hooks)?;

    let (tx, mut direct_flows) = mpsc::channel(config.overflow_slots());
    let ring = fetcher.take_direct_flows()?;
    task::spawn(async move {
        if let Err(e) = forward_direct_flows(ring, tx).await {
            warn!("ring buffer reader stopped: {e:#}");
        }
    });
    if hooks.payloads {
        spawn_payload_readers(fetcher.take_packet_payloads()?)?;
    }

    let mut ticker = time::interval(config.cache_active_timeout);
    ticker.tick().await;
    let ctrl_c = signal::ctrl_c();
    tokio::pin!(ctrl_c);

    info!("Waiting for Ctrl-C...");
    loop {
        tokio::select! {
            Some(record) = direct_flows.recv() => {
                exporter.account(record);
            }
            _ = ticker.tick() => {
                exporter.evict(merge_shards(fetcher.lookup_and_delete()?));
            }
            res = &mut ctrl_c => {
                res?;
                break;
            }
        }
    }
    info!("Exiting...");

    while let Ok(record) = direct_flows.try_recv() {
        exporter.account(record);
    }
    exporter.evict(merge_shards(fetcher.lookup_and_delete()?));
    Ok(())
}

fn spawn_payload_readers(mut payloads: AsyncPerfEventArray<MapData>) -> Result<(), anyhow::Error> {
    for cpu_id in online_cpus().context("failed to get online cpus")? {
        let mut buf = payloads.open(cpu_id, None)?;
        task::spawn(async move {
            let mut buffers = (0..10)
                .map(|_| BytesMut::with_capacity(10240))
                .collect::<Vec<_>>();
            loop {
                let events = match buf.read_events(&mut buffers).await {
                    Ok(events) => events,
                    Err(e) => {
                        warn!("payload reader on cpu {cpu_id} stopped: {e}");
                        return;
                    }
                };
                if events.lost > 0 {
                    debug!("lost {} payload events on cpu {cpu_id}", events.lost);
                }
                for sample in buffers.iter().take(events.read) {
                    if let Some(meta) = PayloadMeta::from_bytes(sample) {
                        let captured = (sample.len() - PayloadMeta::LEN).min(meta.pkt_len as usize);
                        info!(
                            "dns packet if_index={} len={} captured={}",
                            { meta.if_index },
                            { meta.pkt_len },
                            captured
                        );
                    }
                }
            }
        });
    }
    Ok(())
}

async fn run_socket(
    config: &AgentConfig,
    mut exporter: Exporter,
    iface: &str,
    workers: usize,
    queue_len: usize,
) -> Result<(), anyhow::Error> {
    let socket = PacketSocket::bind(iface).with_context(|| format!("failed to capture on {iface}"))?;
    let (overflow_tx, mut overflow) = OverflowRing::with_byte_size(config.overflow_buffer_bytes);
    let mut pool = WorkerPool::start(workers, queue_len, config.monitor, overflow_tx)?;
    info!(
        "capturing on {iface} (index {}) with {} workers",
        socket.if_index(),
        pool.workers()
    );
    let mut queue_drops: u64 = 0;

    let mut ticker = time::interval(config.cache_active_timeout);
    ticker.tick().await;
    let ctrl_c = signal::ctrl_c();
    tokio::pin!(ctrl_c);

    info!("Waiting for Ctrl-C...");
    loop {
        tokio::select! {
            packet = socket.next_packet() => {
                match pool.dispatch(packet?) {
                    Ok(()) => {}
                    Err(DispatchError::QueueFull(shard)) => {
                        queue_drops += 1;
                        if config.monitor.trace_messages {
                            debug!("worker {shard} queue full, dropping packet");
                        }
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            Some(record) = overflow.recv() => {
                exporter.account(record);
            }
            _ = ticker.tick() => {
                let shards = task::block_in_place(|| pool.evict())?;
                exporter.evict(merge_shards(shards));
                if queue_drops > 0 {
                    warn!("dropped {queue_drops} packets on full worker queues");
                    queue_drops = 0;
                }
            }
            res = &mut ctrl_c => {
                res?;
                break;
            }
        }
    }
    info!("Exiting...");

    let shards = task::block_in_place(|| pool.evict())?;
    for record in overflow.drain() {
        exporter.account(record);
    }
    exporter.evict(merge_shards(shards));
    Ok(())
}

//! Sharded worker threads, each the single writer of its own flow table.

use std::{
    sync::mpsc as std_mpsc,
    thread::{self, JoinHandle},
};

use anyhow::{anyhow, Context, Result};
use flowmon_common::{FlowId, FlowMetrics};
use log::debug;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError, Receiver, Sender};

use crate::{
    config::MonitorConfig,
    monitor::{FlowMonitor, Packet},
    overflow::OverflowSender,
};

pub type Snapshot = Vec<(FlowId, FlowMetrics)>;

/// Packets a worker can have queued before dispatching to it fails.
pub const DEFAULT_QUEUE_LEN: usize = 4096;

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("queue of worker {0} is full")]
    QueueFull(usize),
    #[error("worker {0} has stopped")]
    Stopped(usize),
    #[error("no worker for shard {0}")]
    NoWorker(usize),
}

enum Message {
    Packet(Packet),
    Evict(std_mpsc::Sender<Snapshot>),
    #[cfg(test)]
    Hold {
        started: std_mpsc::Sender<()>,
        release: std_mpsc::Receiver<()>,
    },
}

struct Worker {
    tx: Sender<Message>,
    handle: JoinHandle<()>,
}

pub struct WorkerPool {
    workers: Vec<Worker>,
    next: usize,
}

impl WorkerPool {
    pub fn start(
        workers: usize,
        queue_len: usize,
        config: MonitorConfig,
        overflow: OverflowSender,
    ) -> Result<Self> {
        let workers = (0..workers.max(1))
            .map(|shard| {
                let (tx, rx) = mpsc::channel(queue_len.max(1));
                let monitor = FlowMonitor::new(config, overflow.clone());
                let handle = thread::Builder::new()
                    .name(format!("flowmon-shard-{shard}"))
                    .spawn(move || run_worker(shard, monitor, rx))
                    .with_context(|| format!("failed to spawn worker {shard}"))?;
                Ok(Worker { tx, handle })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(WorkerPool { workers, next: 0 })
    }

    pub fn workers(&self) -> usize {
        self.workers.len()
    }

    /// Hands the packet to the next worker in round-robin order.
    pub fn dispatch(&mut self, packet: Packet) -> Result<(), DispatchError> {
        let shard = self.next;
        self.next = (self.next + 1) % self.workers.len();
        self.dispatch_to(shard, packet)
    }

    /// Queues the packet on one worker. Never blocks: a full queue is
    /// reported and the packet is dropped.
    pub fn dispatch_to(&self, shard: usize, packet: Packet) -> Result<(), DispatchError> {
        let worker = self.workers.get(shard).ok_or(DispatchError::NoWorker(shard))?;
        worker
            .tx
            .try_send(Message::Packet(packet))
            .map_err(|err| match err {
                TrySendError::Full(_) => DispatchError::QueueFull(shard),
                TrySendError::Closed(_) => DispatchError::Stopped(shard),
            })
    }

    /// Drains every shard. Packets queued before the call are accounted first.
    ///
    /// Waits for queue space, so it must run outside the async executor.
    pub fn evict(&self) -> Result<Vec<Snapshot>> {
        let replies = self
            .workers
            .iter()
            .enumerate()
            .map(|(shard, worker)| {
                let (tx, rx) = std_mpsc::channel();
                worker
                    .tx
                    .blocking_send(Message::Evict(tx))
                    .map_err(|_| anyhow!("worker {shard} has stopped"))?;
                Ok(rx)
            })
            .collect::<Result<Vec<_>>>()?;

        replies
            .into_iter()
            .enumerate()
            .map(|(shard, rx)| {
                rx.recv()
                    .map_err(|_| anyhow!("worker {shard} exited during eviction"))
            })
            .collect()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // closing a queue stops its worker once the queued messages are handled
        for Worker { tx, handle } in self.workers.drain(..) {
            drop(tx);
            let _ = handle.join();
        }
    }
}

fn run_worker(shard: usize, mut monitor: FlowMonitor, mut rx: Receiver<Message>) {
    while let Some(message) = rx.blocking_recv() {
        match message {
            Message::Packet(packet) => {
                monitor.process(&packet);
            }
            Message::Evict(reply) => {
                let _ = reply.send(monitor.evict());
            }
            #[cfg(test)]
            Message::Hold { started, release } => {
                let _ = started.send(());
                let _ = release.recv();
            }
        }
    }
    debug!("worker {shard} exiting");
}

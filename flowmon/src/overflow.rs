//! Userspace counterpart of the `DIRECT_FLOWS` ring buffer.
//!
//! Records travel as their packed wire bytes, so the reader decodes exactly
//! what the kernel channel would carry.

use bytes::Bytes;
use flowmon_common::FlowRecord;
use log::warn;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum OverflowError {
    #[error("no free slot in the overflow channel")]
    ChannelFull,
    #[error("overflow channel closed")]
    Closed,
}

/// Bounded channel of fixed-size record slots.
pub struct OverflowRing;

impl OverflowRing {
    /// Sizes the channel in bytes, like the kernel ring buffer.
    pub fn with_byte_size(bytes: usize) -> (OverflowSender, OverflowReader) {
        Self::with_slots(bytes / FlowRecord::LEN)
    }

    pub fn with_slots(slots: usize) -> (OverflowSender, OverflowReader) {
        let (tx, rx) = mpsc::channel(slots.max(1));
        (OverflowSender { tx }, OverflowReader { rx })
    }
}

/// Producer side. Never blocks: a full channel is reported back to the caller.
#[derive(Clone, Debug)]
pub struct OverflowSender {
    tx: mpsc::Sender<Bytes>,
}

impl OverflowSender {
    pub fn submit(&self, record: &FlowRecord) -> Result<(), OverflowError> {
        let slot = Bytes::copy_from_slice(record.as_bytes());
        self.tx.try_send(slot).map_err(|err| match err {
            TrySendError::Full(_) => OverflowError::ChannelFull,
            TrySendError::Closed(_) => OverflowError::Closed,
        })
    }
}

#[derive(Debug)]
pub struct OverflowReader {
    rx: mpsc::Receiver<Bytes>,
}

impl OverflowReader {
    /// Waits for the next record. Returns `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<FlowRecord> {
        loop {
            let slot = self.rx.recv().await?;
            match FlowRecord::from_bytes(&slot) {
                Some(record) => return Some(record),
                None => warn!("discarding {}-byte overflow slot", slot.len()),
            }
        }
    }

    /// Returns every record already queued without waiting.
    pub fn drain(&mut self) -> Vec<FlowRecord> {
        let mut records = Vec::new();
        while let Ok(slot) = self.rx.try_recv() {
            if let Some(record) = FlowRecord::from_bytes(&slot) {
                records.push(record);
            }
        }
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowmon_common::{FlowId, FlowMetrics};

    fn record(port: u16, errno: u8) -> FlowRecord {
        let mut metrics = FlowMetrics::new_flow(64, port as u64, 0, false);
        metrics.errno = errno;
        FlowRecord {
            id: FlowId {
                src_port: port,
                ..Default::default()
            },
            metrics,
        }
    }

    #[test]
    fn byte_size_rounds_down_to_whole_records() {
        let (tx, mut rx) = OverflowRing::with_byte_size(2 * FlowRecord::LEN + 50);
        tx.submit(&record(1, 7)).unwrap();
        tx.submit(&record(2, 7)).unwrap();
        assert_eq!(tx.submit(&record(3, 7)), Err(OverflowError::ChannelFull));
        assert_eq!(rx.drain().len(), 2);
        tx.submit(&record(3, 7)).unwrap();
    }

    #[test]
    fn closed_reader_is_reported() {
        let (tx, rx) = OverflowRing::with_slots(4);
        drop(rx);
        assert_eq!(tx.submit(&record(1, 7)), Err(OverflowError::Closed));
    }

    #[tokio::test]
    async fn reader_keeps_submission_order() {
        let (tx, mut rx) = OverflowRing::with_slots(8);
        for port in 1..=5 {
            tx.submit(&record(port, 12)).unwrap();
        }
        drop(tx);

        let mut ports = Vec::new();
        while let Some(r) = rx.recv().await {
            assert_eq!({ r.metrics.errno }, 12);
            assert_eq!({ r.metrics.packets }, 1);
            ports.push({ r.id.src_port });
        }
        assert_eq!(ports, vec![1, 2, 3, 4, 5]);
    }
}

pub mod config;
pub mod dedupe;
pub mod ebpf;
pub mod export;
pub mod merge;
pub mod monitor;
pub mod overflow;
pub mod pool;
pub mod record;
pub mod socket;
pub mod table;

#[cfg(test)]
mod testutil;

use std::{path::PathBuf, process::Command};

use anyhow::{bail, Context};
use clap::Parser;

#[derive(Debug, Copy, Clone, clap::ValueEnum)]
pub enum Architecture {
    BpfEl,
    BpfEb,
}

impl Architecture {
    pub fn target(&self) -> &'static str {
        match self {
            Architecture::BpfEl => "bpfel-unknown-none",
            Architecture::BpfEb => "bpfeb-unknown-none",
        }
    }
}

#[derive(Debug, Parser)]
pub struct Options {
    /// Set the endianness of the BPF target
    #[clap(default_value = "bpf-el", long, value_enum)]
    pub target: Architecture,
    /// Build the release target
    #[clap(long)]
    pub release: bool,
}

pub fn build_ebpf(opts: Options) -> Result<(), anyhow::Error> {
    let dir = PathBuf::from("flowmon-ebpf");
    let target = format!("--target={}", opts.target.target());
    let mut args = vec!["build", target.as_str(), "-Z", "build-std=core"];
    if opts.release {
        args.push("--release")
    }

    // Command::new creates a child process which inherits all env variables. This means env
    // vars set by the cargo xtask command are also inherited. RUSTUP_TOOLCHAIN is removed
    // so the rust-toolchain.toml file in the -ebpf folder is honored.
    let status = Command::new("cargo")
        .current_dir(dir)
        .env_remove("RUSTUP_TOOLCHAIN")
        .args(&args)
        .status()
        .context("failed to build bpf program")?;
    if !status.success() {
        bail!("bpf build failed: {status}");
    }
    Ok(())
}

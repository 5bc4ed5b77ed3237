use std::process::Command;

use anyhow::{bail, Context as _};
use clap::Parser;

use crate::build_ebpf::{build_ebpf, Architecture, Options as BuildOptions};

#[derive(Debug, Parser)]
pub struct Options {
    /// Set the endianness of the BPF target
    #[clap(default_value = "bpf-el", long, value_enum)]
    pub bpf_target: Architecture,
    /// Build and run the release target
    #[clap(long)]
    pub release: bool,
    /// The command used to wrap your application
    #[clap(short, long, default_value = "sudo -E")]
    pub runner: String,
    /// Arguments to pass to your application
    #[clap(name = "args", last = true)]
    pub run_args: Vec<String>,
}

/// Build the project
fn build(opts: &Options) -> Result<(), anyhow::Error> {
    let mut args = vec!["build"];
    if opts.release {
        args.push("--release")
    }
    let status = Command::new("cargo")
        .args(&args)
        .status()
        .context("failed to build userspace")?;
    if !status.success() {
        bail!("userspace build failed: {status}");
    }
    Ok(())
}

/// Build the eBPF object, then run the agent in `tc` mode against it.
pub fn run(opts: Options) -> Result<(), anyhow::Error> {
    build_ebpf(BuildOptions {
        target: opts.bpf_target,
        release: opts.release,
    })
    .context("error while building eBPF program")?;
    build(&opts).context("error while building userspace application")?;

    let profile = if opts.release { "release" } else { "debug" };
    let bin_path = format!("target/{profile}/flowmon");
    let bpf_object = format!("target/{}/{profile}/flowmon", opts.bpf_target.target());

    // without an explicit source, run in tc mode against the freshly built object
    let mut run_args: Vec<&str> = Vec::new();
    if !opts.run_args.iter().any(|a| a == "tc" || a == "socket") {
        run_args.extend(["tc", "--bpf-object", bpf_object.as_str()]);
    }
    run_args.extend(opts.run_args.iter().map(String::as_str));

    // configure args
    let mut args: Vec<_> = opts.runner.trim().split_terminator(' ').collect();
    args.push(bin_path.as_str());
    args.extend(run_args.iter());

    // run the command
    let status = Command::new(args.first().context("empty runner")?)
        .args(args.iter().skip(1))
        .status()
        .context("failed to run the command")?;

    if !status.success() {
        bail!("failed to run `{}`", args.join(" "));
    }
    Ok(())
}

use anyhow::{Context, Result};
use clap::Parser;
use std::process::Command;

#[derive(Parser)]
struct Args {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Parser)]
enum Cmd {
    /// Build the kernel programs (`filemon-ebpf`)
    BuildEbpf {
        #[arg(long, default_value = "bpfel-unknown-none")]
        target: String,
        /// Kernel architecture the programs will run on (selects the pt_regs layout)
        #[arg(long)]
        arch: Option<String>,
        #[arg(long)]
        release: bool,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Cmd::BuildEbpf { target, arch, release } => build_ebpf(&target, arch.as_deref(), release)?,
    }

    Ok(())
}

fn build_ebpf(target: &str, arch: Option<&str>, _release: bool) -> Result<()> {
    // Always release: debug builds pull in formatting code the BPF linker rejects.
    let mut cmd = Command::new("cargo");
    cmd.arg("+nightly")
        .arg("build")
        .arg("--package")
        .arg("filemon-ebpf")
        .arg("--target")
        .arg(target)
        .arg("-Z")
        .arg("build-std=core")
        .arg("--release");

    if let Some(arch) = arch {
        cmd.env("CARGO_CFG_BPF_TARGET_ARCH", arch);
    }

    let status = cmd.status().context("Failed to build eBPF program")?;

    if !status.success() {
        anyhow::bail!("Failed to build eBPF program");
    }

    println!("✓ eBPF program built successfully");
    println!("  Target: {target}");
    println!("  Arch: {}", arch.unwrap_or(std::env::consts::ARCH));
    println!("  Profile: release (always)");

    Ok(())
}

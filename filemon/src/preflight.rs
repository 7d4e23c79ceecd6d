//! Pre-flight checks for filemon
//!
//! Validates system requirements before attempting to load eBPF programs.
//! Provides clear, actionable error messages when requirements aren't met.

#![allow(unsafe_code)] // geteuid() requires unsafe

use anyhow::{bail, Context, Result};
use log::info;
use std::path::Path;

use crate::config::MonitorConfig;
use crate::domain::{MonitorError, Pid, ProbeMode};

/// Minimum kernel version: BPF ring buffer support landed in 5.8
const MIN_KERNEL_VERSION: (u32, u32) = (5, 8);

/// Kernel BTF, required by fexit programs
const VMLINUX_BTF: &str = "/sys/kernel/btf/vmlinux";

/// Run all pre-flight checks before eBPF loading
pub fn run_preflight_checks(config: &MonitorConfig) -> Result<()> {
    check_privileges()?;
    check_kernel_version()?;
    check_btf(config.mode)?;
    if let Some(pid) = config.target {
        check_process_exists(pid)?;
    }
    Ok(())
}

/// Check if running with sufficient privileges for eBPF
fn check_privileges() -> Result<()> {
    if unsafe { libc::geteuid() } == 0 {
        return Ok(());
    }

    // CAP_BPF + CAP_PERFMON would suffice, but checking them needs more than libc.
    bail!(
        "Permission denied: filemon requires root privileges to load eBPF programs.\n\n\
         Run with: sudo filemon run ...\n\
         Or try without privileges: filemon simulate"
    );
}

/// Parse `major.minor` out of a `/proc/version` line
fn parse_kernel_release(version: &str) -> Option<(u32, u32)> {
    // "Linux version 6.1.0-arch1-1 (...) ..."
    let release = version.split_whitespace().nth(2)?;
    let mut parts = release.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts
        .next()?
        .chars()
        .take_while(char::is_ascii_digit)
        .collect::<String>()
        .parse()
        .ok()?;
    Some((major, minor))
}

/// Check if the kernel version is sufficient for eBPF features
fn check_kernel_version() -> Result<()> {
    let version_str = std::fs::read_to_string("/proc/version")
        .context("Failed to read kernel version from /proc/version")?;

    // Can't parse, assume it's fine
    let Some((major, minor)) = parse_kernel_release(&version_str) else {
        return Ok(());
    };

    if (major, minor) < MIN_KERNEL_VERSION {
        bail!(
            "Kernel version {major}.{minor} is too old.\n\n\
             filemon requires Linux {}.{} or newer for eBPF ring buffer support.",
            MIN_KERNEL_VERSION.0,
            MIN_KERNEL_VERSION.1,
        );
    }

    Ok(())
}

/// Check for kernel BTF when fexit may be used
fn check_btf(mode: ProbeMode) -> Result<()> {
    if Path::new(VMLINUX_BTF).exists() {
        return Ok(());
    }
    match mode {
        ProbeMode::Combined => bail!(
            "{VMLINUX_BTF} not found: --mode combined needs kernel BTF.\n\n\
             Use --mode paired (kprobe/kretprobe) on this kernel."
        ),
        ProbeMode::Auto => {
            info!("No kernel BTF, deletions will be observed with kprobe/kretprobe");
            Ok(())
        }
        ProbeMode::Paired => Ok(()),
    }
}

/// Check if the target process exists
pub fn check_process_exists(pid: Pid) -> Result<()> {
    if !Path::new(&format!("/proc/{}", pid.0)).exists() {
        return Err(MonitorError::ProcessNotFound(pid)).with_context(|| {
            format!("Is the process still running? Check with: ps -p {}", pid.0)
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_kernel_release() {
        assert_eq!(
            parse_kernel_release("Linux version 5.15.0-generic (buildd@lcy02) #1 SMP"),
            Some((5, 15))
        );
        assert_eq!(parse_kernel_release("Linux version 6.1rc2 #1"), Some((6, 1)));
        assert_eq!(parse_kernel_release("Linux version"), None);
        assert_eq!(parse_kernel_release("Linux version abc"), None);
    }

    #[test]
    fn test_kernel_version_check() {
        // Don't assert success since test might run on old kernel
        let _ = check_kernel_version();
    }

    #[test]
    fn test_process_not_found() {
        let result = check_process_exists(Pid(999_999_999));
        let err = format!("{:#}", result.unwrap_err());
        assert!(err.contains("not found"));
    }

    #[test]
    fn test_paired_mode_never_needs_btf() {
        assert!(check_btf(ProbeMode::Paired).is_ok());
        assert!(check_btf(ProbeMode::Auto).is_ok());
    }
}

use std::env;

// pt_regs layout differs per kernel architecture; the BPF target itself does not say which.
fn main() {
    println!("cargo:rerun-if-env-changed=CARGO_CFG_BPF_TARGET_ARCH");
    println!(
        "cargo::rustc-check-cfg=cfg(bpf_target_arch, values(\"x86_64\", \"aarch64\", \"riscv64\", \"arm\", \"powerpc64\", \"s390x\", \"mips\"))"
    );

    let arch = env::var("CARGO_CFG_BPF_TARGET_ARCH").unwrap_or_else(|_| {
        let host = env::var("HOST").unwrap_or_default();
        let arch = host.split_once('-').map_or(host.as_str(), |(arch, _)| arch);
        if arch.starts_with("riscv64") {
            "riscv64".to_string()
        } else {
            arch.to_string()
        }
    });
    println!("cargo:rustc-cfg=bpf_target_arch=\"{arch}\"");
}

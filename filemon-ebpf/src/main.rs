//! # eBPF Kernel-Side Instrumentation
//!
//! eBPF programs that run inside the Linux kernel to report file deletions and
//! writes.
//!
//! ## Programs
//!
//! - **Kprobe / Kretprobe**: `unlink_entry` / `unlink_exit` - paired
//!   observation of `do_unlinkat`, correlated through `INFLIGHT_UNLINK`
//! - **Fexit**: `unlink_fexit` - combined observation of `do_unlinkat`
//!   (arguments and return value at once, no correlation needed)
//! - **Tracepoints**: `write_enter` / `write_exit` - paired observation of
//!   `syscalls/sys_{enter,exit}_write`, correlated through `INFLIGHT_WRITE`
//!
//! ## Maps (Shared with Userspace)
//!
//! - `EVENTS` - Ring buffer for completed-operation records
//! - `INFLIGHT_UNLINK` / `INFLIGHT_WRITE` - Entry context keyed by [`CallKey`]
//! - `CONFIG` - Runtime configuration (target PID, own PID)
//! - `COUNTERS` - Per-CPU degradation counters
//!
//! Every program returns 0 on every path: instrumentation never changes the
//! outcome of the instrumented call.
//!
//! ## Build
//!
//! Always compiled in release mode:
//! ```bash
//! cargo xtask build-ebpf --release
//! ```

#![no_std]
#![no_main]
#![allow(unused_unsafe)]

use aya_ebpf::{
    helpers::{
        bpf_get_current_comm, bpf_get_current_pid_tgid, bpf_probe_read_kernel,
        bpf_probe_read_kernel_str_bytes,
    },
    macros::{fexit, kprobe, map, tracepoint},
    maps::{HashMap, PerCpuArray, RingBuf},
    programs::{FExitContext, ProbeContext, TracePointContext},
};
use aya_log_ebpf::warn;
use bytemuck::Zeroable;
use core::ffi::c_void;
use filemon_common::{
    CallKey, Capture, CapacityExceeded, CorrelationMap, Correlator, Counter, EntryOutcome,
    EventSink, FileEvent, PidFilter, ProbeSite, ReadFault, ReservationDenied, Subject, Task,
    Telemetry, Unlink, Write, WriteArgs, CONFIG_SELF_PID, CONFIG_TARGET_PID, COUNTER_SLOTS,
    TASK_COMM_LEN,
};

// ============================================================================
// Constants
// ============================================================================

/// Default ring buffer size. A record is 288 bytes plus an 8-byte header, so
/// 256KB holds ~885 records before a stalled reader starts losing events.
/// Userspace may resize before load (`--ring-bytes`).
const RING_BYTES: u32 = 256 * 1024;

/// Default in-flight capacity per operation (`--table-entries`)
const INFLIGHT_ENTRIES: u32 = 10_240;

/// `BPF_ANY`: create or overwrite
const BPF_ANY: u64 = 0;

/// Offset from the kprobe-time stack pointer to the stack pointer the caller
/// sees once the probed function returns. x86 pushes the return address on
/// the stack; arm64 and riscv keep it in a register.
#[cfg(bpf_target_arch = "x86_64")]
const RETURN_SLOT: u64 = 8;
#[cfg(not(bpf_target_arch = "x86_64"))]
const RETURN_SLOT: u64 = 0;

// Tracepoint record offsets from
// /sys/kernel/debug/tracing/events/syscalls/sys_{enter,exit}_write/format
const TP_SYSCALL_NR: usize = 8;
const TP_ENTER_FD: usize = 16;
const TP_ENTER_COUNT: usize = 32;
const TP_EXIT_RET: usize = 16;

// ============================================================================
// eBPF Maps - Shared data structures between kernel and userspace
// ============================================================================

/// Ring buffer for sending completed-operation records to userspace
///
/// - **Type**: MPSC ring, reservations become visible in reservation order
/// - **Overflow**: `reserve` fails and the record is dropped (counted)
#[map]
static EVENTS: RingBuf = RingBuf::with_byte_size(RING_BYTES, 0);

/// Map: call key → path captured at `do_unlinkat` entry
#[map]
static INFLIGHT_UNLINK: HashMap<CallKey, Subject> =
    HashMap::with_max_entries(INFLIGHT_ENTRIES, 0);

/// Map: call key → arguments captured at `sys_enter_write`
#[map]
static INFLIGHT_WRITE: HashMap<CallKey, WriteArgs> =
    HashMap::with_max_entries(INFLIGHT_ENTRIES, 0);

/// Map: Config key → Config value
///
/// - **Key 0**: Target PID (0 = all processes)
/// - **Key 1**: Monitor's own PID (never reported)
#[map]
static CONFIG: HashMap<u32, u64> = HashMap::with_max_entries(16, 0);

/// Degradation counters, one slot per [`Counter`]
#[map]
static COUNTERS: PerCpuArray<u64> = PerCpuArray::with_max_entries(COUNTER_SLOTS, 0);

// ============================================================================
// Harness bindings
// ============================================================================

/// In-flight table backed by a BPF hash map
struct InFlight<V: 'static>(&'static HashMap<CallKey, V>);

impl<V> CorrelationMap<CallKey, V> for InFlight<V> {
    fn put(&self, key: &CallKey, value: &V) -> Result<(), CapacityExceeded> {
        // A full hash map rejects new keys with -E2BIG; existing keys are updated in place.
        unsafe { self.0.insert(key, value, BPF_ANY) }.map_err(|_| CapacityExceeded)
    }

    fn take_with<R>(&self, key: &CallKey, f: impl FnOnce(Option<&V>) -> R) -> R {
        let result = f(unsafe { self.0.get(key) });
        let _ = unsafe { self.0.remove(key) };
        result
    }
}

/// Table stand-in for combined observation points
struct NoTable;

/// Event sink backed by the `EVENTS` ring buffer
struct Ring;

impl EventSink for Ring {
    fn emit_with<R>(
        &self,
        fill: impl FnOnce(&mut FileEvent) -> R,
    ) -> Result<R, ReservationDenied> {
        let Some(mut entry) = EVENTS.reserve::<FileEvent>(0) else {
            return Err(ReservationDenied);
        };
        let result = fill(entry.write(FileEvent::zeroed()));
        entry.submit(0);
        Ok(result)
    }
}

struct PerCpuCounters;

impl Telemetry for PerCpuCounters {
    fn bump(&self, counter: Counter) {
        if let Some(slot) = COUNTERS.get_ptr_mut(counter.slot()) {
            unsafe { *slot += 1 };
        }
    }
}

fn pid_filter() -> PidFilter {
    let target = unsafe { CONFIG.get(&CONFIG_TARGET_PID).map_or(0, |v| *v as u32) };
    let own = unsafe { CONFIG.get(&CONFIG_SELF_PID).map_or(0, |v| *v as u32) };
    PidFilter::new(target, own)
}

#[inline(always)]
fn correlator<V: 'static>(
    table: &'static HashMap<CallKey, V>,
) -> Correlator<InFlight<V>, Ring, PerCpuCounters> {
    Correlator::new(InFlight(table), Ring, PerCpuCounters, pid_filter())
}

#[inline(always)]
fn current_task() -> Task {
    let pid_tgid = unsafe { bpf_get_current_pid_tgid() };
    Task {
        pid: (pid_tgid >> 32) as u32,
        tid: pid_tgid as u32,
        comm: bpf_get_current_comm().unwrap_or([0u8; TASK_COMM_LEN]),
    }
}

// ============================================================================
// Cross-boundary reads
// ============================================================================

/// Leading field of the kernel's `struct filename`
#[repr(C)]
struct KernelFilename {
    name: *const u8,
}

/// Read `filename->name` into `scratch` through the bounds-checked helpers.
fn read_filename(filename: *const KernelFilename, scratch: &mut Subject) -> Result<(), ReadFault> {
    if filename.is_null() {
        return Err(ReadFault);
    }
    let name = unsafe { bpf_probe_read_kernel(core::ptr::addr_of!((*filename).name)) }
        .map_err(|_| ReadFault)?;
    unsafe { bpf_probe_read_kernel_str_bytes(name, scratch) }.map_err(|_| ReadFault)?;
    Ok(())
}

// ============================================================================
// Probe sites
// ============================================================================

#[cfg(bpf_target_arch = "x86_64")]
fn stack_pointer(ctx: &ProbeContext) -> u64 {
    unsafe { (*ctx.regs).rsp }
}

#[cfg(bpf_target_arch = "x86_64")]
fn return_register(ctx: &ProbeContext) -> u64 {
    unsafe { (*ctx.regs).rax }
}

#[cfg(bpf_target_arch = "aarch64")]
fn stack_pointer(ctx: &ProbeContext) -> u64 {
    unsafe { (*ctx.regs).sp }
}

#[cfg(bpf_target_arch = "aarch64")]
fn return_register(ctx: &ProbeContext) -> u64 {
    unsafe { (*ctx.regs).regs[0] }
}

#[cfg(bpf_target_arch = "riscv64")]
fn stack_pointer(ctx: &ProbeContext) -> u64 {
    unsafe { (*ctx.regs).sp }
}

#[cfg(bpf_target_arch = "riscv64")]
fn return_register(ctx: &ProbeContext) -> u64 {
    unsafe { (*ctx.regs).a0 }
}

// Without a known pt_regs layout, keys fall back to the thread alone.
#[cfg(not(any(
    bpf_target_arch = "x86_64",
    bpf_target_arch = "aarch64",
    bpf_target_arch = "riscv64"
)))]
fn stack_pointer(_ctx: &ProbeContext) -> u64 {
    0
}

#[cfg(not(any(
    bpf_target_arch = "x86_64",
    bpf_target_arch = "aarch64",
    bpf_target_arch = "riscv64"
)))]
fn return_register(_ctx: &ProbeContext) -> u64 {
    0
}

/// `do_unlinkat(int dfd, struct filename *name)` at kprobe or kretprobe time
struct UnlinkSite<'a> {
    ctx: &'a ProbeContext,
    exit: bool,
}

impl ProbeSite for UnlinkSite<'_> {
    fn task(&self) -> Task {
        current_task()
    }

    fn call_key(&self) -> CallKey {
        let sp = stack_pointer(self.ctx);
        // Both sides key on the caller's post-return stack pointer.
        let disambiguator = if self.exit { sp } else { sp + RETURN_SLOT };
        CallKey::new(unsafe { bpf_get_current_pid_tgid() }, disambiguator)
    }

    fn return_code(&self) -> i64 {
        // do_unlinkat returns int
        i64::from(return_register(self.ctx) as i32)
    }
}

impl Capture<Unlink> for UnlinkSite<'_> {
    fn capture(&self, scratch: &mut Subject) -> Result<(), ReadFault> {
        let filename: *const KernelFilename = self.ctx.arg(1).ok_or(ReadFault)?;
        read_filename(filename, scratch)
    }
}

/// `do_unlinkat` at fexit time: arguments and return value together
struct UnlinkExitSite<'a> {
    ctx: &'a FExitContext,
}

impl ProbeSite for UnlinkExitSite<'_> {
    fn task(&self) -> Task {
        current_task()
    }

    fn call_key(&self) -> CallKey {
        CallKey::new(unsafe { bpf_get_current_pid_tgid() }, 0)
    }

    fn return_code(&self) -> i64 {
        // int return, stored in a 64-bit argument slot
        i64::from(unsafe { self.ctx.arg::<u64>(2) } as i32)
    }
}

impl Capture<Unlink> for UnlinkExitSite<'_> {
    fn capture(&self, scratch: &mut Subject) -> Result<(), ReadFault> {
        let filename: *const KernelFilename = unsafe { self.ctx.arg(1) };
        read_filename(filename, scratch)
    }
}

/// `syscalls/sys_{enter,exit}_write` tracepoints
///
/// Syscalls do not nest within a thread, so the syscall number is enough to
/// disambiguate.
struct WriteSite<'a> {
    ctx: &'a TracePointContext,
}

impl ProbeSite for WriteSite<'_> {
    fn task(&self) -> Task {
        current_task()
    }

    fn call_key(&self) -> CallKey {
        let nr = unsafe { self.ctx.read_at::<i32>(TP_SYSCALL_NR) }.unwrap_or(-1);
        CallKey::new(unsafe { bpf_get_current_pid_tgid() }, nr as u64)
    }

    fn return_code(&self) -> i64 {
        unsafe { self.ctx.read_at::<i64>(TP_EXIT_RET) }.unwrap_or(0)
    }
}

impl Capture<Write> for WriteSite<'_> {
    fn capture(&self, scratch: &mut WriteArgs) -> Result<(), ReadFault> {
        scratch.fd = unsafe { self.ctx.read_at::<u64>(TP_ENTER_FD) }.map_err(|_| ReadFault)?;
        scratch.count =
            unsafe { self.ctx.read_at::<u64>(TP_ENTER_COUNT) }.map_err(|_| ReadFault)?;
        Ok(())
    }
}

// ============================================================================
// eBPF Program Hooks
// ============================================================================

/// Hook: `do_unlinkat` entry - stage the path under the call key
#[kprobe]
pub fn unlink_entry(ctx: ProbeContext) -> u32 {
    let site = UnlinkSite { ctx: &ctx, exit: false };
    if correlator(&INFLIGHT_UNLINK).on_entry::<Unlink, _>(&site) == EntryOutcome::Rejected {
        warn!(&ctx, "in-flight unlink table full, tid {} will report no path", site.call_key().tid());
    }
    0
}

/// Hook: `do_unlinkat` return - emit the record, degraded if the entry is missing
///
/// Expanded by hand rather than through `#[kretprobe]` so the exit site reads
/// the same `pt_regs` view as the entry site.
#[no_mangle]
#[link_section = "kretprobe"]
pub fn unlink_exit(ctx: *mut c_void) -> u32 {
    let ctx = ProbeContext::new(ctx);
    let site = UnlinkSite { ctx: &ctx, exit: true };
    let _ = correlator(&INFLIGHT_UNLINK).on_exit::<Unlink, _>(&site);
    0
}

/// Hook: `do_unlinkat` fexit - preferred when BTF trampolines are available
#[fexit(function = "do_unlinkat")]
pub fn unlink_fexit(ctx: FExitContext) -> u32 {
    let site = UnlinkExitSite { ctx: &ctx };
    let _ = Correlator::new(NoTable, Ring, PerCpuCounters, pid_filter())
        .on_complete::<Unlink, _>(&site);
    0
}

/// Hook: `sys_enter_write` - stage fd and length
#[tracepoint]
pub fn write_enter(ctx: TracePointContext) -> u32 {
    let site = WriteSite { ctx: &ctx };
    let _ = correlator(&INFLIGHT_WRITE).on_entry::<Write, _>(&site);
    0
}

/// Hook: `sys_exit_write` - emit bytes written (or `-errno`)
#[tracepoint]
pub fn write_exit(ctx: TracePointContext) -> u32 {
    let site = WriteSite { ctx: &ctx };
    let _ = correlator(&INFLIGHT_WRITE).on_exit::<Write, _>(&site);
    0
}

#[cfg(all(not(test), target_os = "none"))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    unsafe { core::hint::unreachable_unchecked() }
}

//! # Critical and Exclusive Sections
//!
//! Two nested execution sections protect kernel state:
//!
//! - **Critical**: interrupts masked on this core. Guards per-core state
//!   against the core's own interrupt handlers.
//! - **Exclusive**: Critical plus ownership of the kernel gate (HSEM slot 0).
//!   Guards state shared between the two cores.
//!
//! Both keep a per-core depth counter. Only the outermost enter and exit of
//! each section touch the hardware, so sections nest freely:
//!
//! ```text
//!   enter_exclusive ─► enter_critical (0→1: cpsid i)
//!                   └► take gate      (0→1: HSEM slot 0, bounded by ticks)
//!   exit_exclusive  ─► drop gate      (1→0)
//!                   └► exit_critical  (1→0: cpsie i)
//! ```
//!
//! A context switch requested inside a section is pended and happens as soon
//! as the outermost Critical section exits.

use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::arch;
use crate::config::{KERNEL_GATE_TIMEOUT, NUM_CORES};
use crate::cpu::this_core;
use crate::error::Fault;
use crate::fault;
use crate::hsem::{self, Slot};

const ZERO: AtomicU32 = AtomicU32::new(0);

static CRITICAL_DEPTH: [AtomicU32; NUM_CORES] = [ZERO; NUM_CORES];
static EXCLUSIVE_DEPTH: [AtomicU32; NUM_CORES] = [ZERO; NUM_CORES];

// ---------------------------------------------------------------------------
// Critical
// ---------------------------------------------------------------------------

pub fn enter_critical() {
    let depth = &CRITICAL_DEPTH[this_core().index()];
    if depth.load(Ordering::Relaxed) == 0 {
        arch::mask_interrupts();
    }
    depth.fetch_add(1, Ordering::Relaxed);
}

/// Unbalanced exits are ignored.
pub fn exit_critical() {
    let depth = &CRITICAL_DEPTH[this_core().index()];
    match depth.load(Ordering::Relaxed) {
        0 => {}
        1 => {
            depth.store(0, Ordering::Relaxed);
            arch::unmask_interrupts();
        }
        n => depth.store(n - 1, Ordering::Relaxed),
    }
}

/// Leave every Critical level at once.
pub fn reset_critical() {
    let depth = &CRITICAL_DEPTH[this_core().index()];
    if depth.swap(0, Ordering::Relaxed) != 0 {
        arch::unmask_interrupts();
    }
}

pub fn is_critical() -> bool {
    CRITICAL_DEPTH[this_core().index()].load(Ordering::Relaxed) != 0
}

// ---------------------------------------------------------------------------
// Exclusive
// ---------------------------------------------------------------------------

/// Enter Exclusive. A gate that stays held by the peer for
/// `KERNEL_GATE_TIMEOUT` ticks is a system fault.
pub fn enter_exclusive() {
    enter_critical();
    let core = this_core();
    let depth = &EXCLUSIVE_DEPTH[core.index()];
    if depth.load(Ordering::Relaxed) == 0 {
        let mut ticks = arch::GateTicks::new();
        if hsem::acquire(arch::hsem(), Slot::KERNEL_GATE, core, KERNEL_GATE_TIMEOUT, &mut ticks).is_err() {
            fault::system_fault(Fault::KernelDeadlock);
        }
        arch::barrier();
    }
    depth.fetch_add(1, Ordering::Relaxed);
}

pub fn exit_exclusive() {
    let core = this_core();
    let depth = &EXCLUSIVE_DEPTH[core.index()];
    match depth.load(Ordering::Relaxed) {
        0 => return,
        1 => {
            arch::barrier();
            depth.store(0, Ordering::Relaxed);
            hsem::release(arch::hsem(), Slot::KERNEL_GATE, core);
        }
        n => depth.store(n - 1, Ordering::Relaxed),
    }
    exit_critical();
}

/// Leave every Exclusive level at once, releasing the gate. The Critical
/// levels taken on the way in are left to `reset_critical`.
pub fn reset_exclusive() {
    let core = this_core();
    if EXCLUSIVE_DEPTH[core.index()].swap(0, Ordering::Relaxed) != 0 {
        arch::barrier();
        hsem::release(arch::hsem(), Slot::KERNEL_GATE, core);
    }
}

pub fn is_exclusive() -> bool {
    EXCLUSIVE_DEPTH[this_core().index()].load(Ordering::Relaxed) != 0
}

/// True inside any section. Blocking calls are refused here.
#[inline]
pub fn in_section() -> bool {
    is_critical()
}

// ---------------------------------------------------------------------------
// Guards and closure wrappers
// ---------------------------------------------------------------------------

/// Proof that the holder runs inside a Critical section.
pub struct CriticalSection {
    _not_send: PhantomData<*const ()>,
}

/// Proof that the holder runs inside an Exclusive section.
pub struct ExclusiveSection {
    _not_send: PhantomData<*const ()>,
}

/// Holds a Critical level until dropped.
#[must_use = "the section ends as soon as the guard is dropped"]
pub struct CriticalGuard {
    _not_send: PhantomData<*const ()>,
}

impl CriticalGuard {
    pub fn new() -> Self {
        enter_critical();
        CriticalGuard { _not_send: PhantomData }
    }
}

impl Default for CriticalGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CriticalGuard {
    fn drop(&mut self) {
        exit_critical();
    }
}

/// Holds an Exclusive level until dropped.
#[must_use = "the section ends as soon as the guard is dropped"]
pub struct ExclusiveGuard {
    _not_send: PhantomData<*const ()>,
}

impl ExclusiveGuard {
    pub fn new() -> Self {
        enter_exclusive();
        ExclusiveGuard { _not_send: PhantomData }
    }
}

impl Default for ExclusiveGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ExclusiveGuard {
    fn drop(&mut self) {
        exit_exclusive();
    }
}

/// Execute a closure within a Critical section.
///
/// # Usage
/// ```ignore
/// sync::critical(|_cs| {
///     // Touch state shared with this core's interrupt handlers
/// });
/// ```
#[inline]
pub fn critical<F, R>(f: F) -> R
where
    F: FnOnce(&CriticalSection) -> R,
{
    let _guard = CriticalGuard::new();
    f(&CriticalSection { _not_send: PhantomData })
}

/// Execute a closure within an Exclusive section.
///
/// Keep these short: the peer core spins on the gate for as long as the
/// closure runs.
#[inline]
pub fn exclusive<F, R>(f: F) -> R
where
    F: FnOnce(&ExclusiveSection) -> R,
{
    let _guard = ExclusiveGuard::new();
    f(&ExclusiveSection { _not_send: PhantomData })
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// Mutable state shared by both cores and their interrupt handlers.
///
/// [`GateCell::with`] is the only way in: it enters Exclusive for the
/// duration of the closure. A nested `with` on the same cell from the same
/// core is a system fault.
#[repr(C)]
pub struct GateCell<T> {
    value: UnsafeCell<T>,
    borrowed: [AtomicBool; NUM_CORES],
}

// SAFETY: every access goes through `with`, which holds the kernel gate
// (excluding the other core) inside a Critical section (excluding this
// core's interrupt handlers) and rejects re-entry.
unsafe impl<T: Send> Sync for GateCell<T> {}

impl<T> GateCell<T> {
    const FREE: AtomicBool = AtomicBool::new(false);

    pub const fn new(value: T) -> Self {
        GateCell {
            value: UnsafeCell::new(value),
            borrowed: [Self::FREE; NUM_CORES],
        }
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let _gate = ExclusiveGuard::new();
        let borrowed = &self.borrowed[this_core().index()];
        if borrowed.swap(true, Ordering::Acquire) {
            fault::system_fault(Fault::TableCorruption);
        }
        // SAFETY: see the `Sync` impl; the borrow flag is set for the whole
        // lifetime of this reference.
        let result = f(unsafe { &mut *self.value.get() });
        borrowed.store(false, Ordering::Release);
        result
    }

    /// Overwrite the contents without reading them or entering a section.
    ///
    /// # Safety
    /// No other context may access the cell during the call. Meant for
    /// cells placed in uninitialised (NOLOAD) memory, before the peer core
    /// and interrupts are running.
    pub unsafe fn reset(&self, value: T) {
        core::ptr::write(self.value.get(), value);
        for flag in &self.borrowed {
            core::ptr::write(flag.as_ptr(), false);
        }
    }
}

//! # Fault Handling
//!
//! Thread-fatal faults are reported to a per-core hook; anything the kernel
//! cannot recover from stops the core.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::arch;
use crate::config::NUM_CORES;
use crate::cpu::CoreId;
use crate::error::Fault;
use crate::thread::Thread;

/// Faults confined to a single thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadFault {
    /// The stack sentinel was overwritten or the saved stack pointer fell
    /// below the stack base. The thread is now in the Overflow state.
    StackOverflow,
    /// The thread's kernel-heap memory was already free when the thread was
    /// destroyed.
    DoubleFree,
}

/// Called on the thread's own core with the faulting thread.
pub type FaultHook = fn(Thread, ThreadFault);

const NO_HOOK: AtomicUsize = AtomicUsize::new(0);

// Function addresses differ between the two core images, so each core keeps
// its own hook.
static HOOKS: [AtomicUsize; NUM_CORES] = [NO_HOOK; NUM_CORES];

pub fn set_hook(core: CoreId, hook: Option<FaultHook>) {
    let raw = hook.map_or(0, |f| f as usize);
    HOOKS[core.index()].store(raw, Ordering::Release);
}

fn hook(core: CoreId) -> Option<FaultHook> {
    let raw = HOOKS[core.index()].load(Ordering::Acquire);
    if raw == 0 {
        return None;
    }
    // SAFETY: the only non-zero values stored are `FaultHook` pointers
    // written by `set_hook` on this core.
    Some(unsafe { core::mem::transmute::<usize, FaultHook>(raw) })
}

/// Report a thread fault on `core`. Escalates to a system fault when no
/// hook is installed.
pub fn report_thread_fault(core: CoreId, thread: Thread, fault: ThreadFault) {
    log::error!("thread {} faulted: {:?}", thread.id(), fault);
    match hook(core) {
        Some(hook) => hook(thread, fault),
        None => system_fault(Fault::UnhandledThreadFault),
    }
}

/// Stop this core.
pub fn system_fault(fault: Fault) -> ! {
    arch::mask_interrupts();
    log::error!("system fault: {}", fault);
    arch::halt(format_args!("{}", fault))
}

//! Host simulation port.
//!
//! Stands in for the ARMv7-M port when the crate is built for anything other
//! than the firmware target. Interrupt masking and switch requests are only
//! recorded; the HSEM bank is a [`SimBank`]. Nothing here ever switches
//! stacks, so the scheduler is driven directly through its state machine.

use core::fmt;
use core::sync::atomic::{fence, AtomicBool, AtomicU32, Ordering};

use crate::config::NUM_CORES;
use crate::cpu::CoreId;
use crate::hsem::{SimBank, TickSource};

static BANK: SimBank = SimBank::new();

const CLEAR: AtomicU32 = AtomicU32::new(0);
const UNMASKED: AtomicBool = AtomicBool::new(false);

static MASKED: [AtomicBool; NUM_CORES] = [UNMASKED; NUM_CORES];
static PENDED_SWITCHES: [AtomicU32; NUM_CORES] = [CLEAR; NUM_CORES];
static PEER_INTERRUPTS: [AtomicU32; NUM_CORES] = [CLEAR; NUM_CORES];
static PREPARED: [AtomicBool; NUM_CORES] = [UNMASKED; NUM_CORES];


#[cfg(not(test))]
mod context {
    use crate::cpu::CoreId;

    pub fn core() -> CoreId {
        CoreId::Cm7
    }

    pub fn in_interrupt() -> bool {
        false
    }
}

#[cfg(test)]
pub use context::{set_core, set_interrupt};

pub fn this_core() -> CoreId {
    context::core()
}

pub fn is_interrupt() -> bool {
    context::in_interrupt()
}

pub fn mask_interrupts() {
    MASKED[this_core().index()].store(true, Ordering::SeqCst);
}

pub fn unmask_interrupts() {
    MASKED[this_core().index()].store(false, Ordering::SeqCst);
}

/// Whether this core's interrupts are currently masked.
pub fn interrupts_masked() -> bool {
    MASKED[this_core().index()].load(Ordering::SeqCst)
}

pub fn barrier() {
    fence(Ordering::SeqCst);
}

pub fn pend_switch() {
    PENDED_SWITCHES[this_core().index()].fetch_add(1, Ordering::SeqCst);
}

pub fn raise_peer_interrupt() {
    PEER_INTERRUPTS[this_core().peer().index()].fetch_add(1, Ordering::SeqCst);
}

/// Switch requests recorded for `core` since the last call.
pub fn take_pended_switches(core: CoreId) -> u32 {
    PENDED_SWITCHES[core.index()].swap(0, Ordering::SeqCst)
}

/// Peer interrupts raised towards `core` since the last call.
pub fn take_peer_interrupts(core: CoreId) -> u32 {
    PEER_INTERRUPTS[core.index()].swap(0, Ordering::SeqCst)
}

pub fn wait_for_interrupt() {
    core::hint::spin_loop();
}

pub fn hsem() -> &'static SimBank {
    &BANK
}

/// Stands in for clocking the HSEM bank and starting the tick counter.
pub fn init_core(core: CoreId) {
    PREPARED[core.index()].store(true, Ordering::SeqCst);
}

/// Whether `init_core` has run for `core`.
pub fn is_core_prepared(core: CoreId) -> bool {
    PREPARED[core.index()].load(Ordering::SeqCst)
}

/// Every poll counts as one tick, so a stuck gate times out after
/// `KERNEL_GATE_TIMEOUT` polls.
pub struct GateTicks;

impl GateTicks {
    pub fn new() -> Self {
        GateTicks
    }
}

impl Default for GateTicks {
    fn default() -> Self {
        Self::new()
    }
}

impl TickSource for GateTicks {
    fn poll(&mut self) -> u32 {
        1
    }
}

pub fn launch(_core: CoreId) -> ! {
    panic!("the simulation port cannot launch threads");
}

pub fn debug_write(_args: fmt::Arguments<'_>) {}

pub fn halt(reason: fmt::Arguments<'_>) -> ! {
    panic!("core halted: {}", reason);
}

/// Serialises tests that touch the kernel's global statics.
#[cfg(test)]
pub fn serial() -> std::sync::MutexGuard<'static, ()> {
    static SERIAL: std::sync::Mutex<()> = std::sync::Mutex::new(());
    SERIAL.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

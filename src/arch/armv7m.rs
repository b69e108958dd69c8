//! # ARMv7-M Port (STM32H745)
//!
//! Hardware-specific code for both cores of the STM32H745: the Cortex-M7
//! and the Cortex-M4. Implements the context switch via PendSV, the SysTick
//! scheduler tick, the inter-core SEV interrupts and the HSEM bank.
//!
//! ## Context Switch Mechanism
//!
//! Threads run in Thread mode on the PSP; the kernel and interrupt handlers
//! run on the MSP. On exception entry the hardware stacks R0-R3, R12, LR, PC
//! and xPSR (plus S0-S15 and FPSCR when the thread used the FPU). PendSV
//! saves R4-R11 and the EXC_RETURN value, and S16-S31 when EXC_RETURN says
//! the hardware frame is an FPU frame.
//!
//! ## Interrupt Priorities
//!
//! - SysTick: 0xFF (lowest)
//! - PendSV: 0xFF (lowest), so a switch never preempts another handler
//! - SEV from the peer core: 0 (NVIC default)

use core::arch::{asm, global_asm};
use core::fmt;
use core::ptr;

use cortex_m::interrupt::InterruptNumber;
use cortex_m::peripheral::scb::VectActive;
use cortex_m::peripheral::syst::SystClkSource;
use cortex_m::peripheral::{CPUID, ITM, NVIC, SCB};
use cortex_m_rt::exception;

use crate::config::{SYSTEM_CLOCK_HZ, TICK_HZ};
use crate::cpu::CoreId;
use crate::hsem::{HsemBank, Slot, TickSource};
use crate::kernel;

// ---------------------------------------------------------------------------
// Execution context
// ---------------------------------------------------------------------------

const PARTNO_CORTEX_M7: u32 = 0xC27;

pub fn this_core() -> CoreId {
    // SAFETY: CPUID is a read-only identification block.
    let cpuid = unsafe { (*CPUID::PTR).base.read() };
    if (cpuid >> 4) & 0xFFF == PARTNO_CORTEX_M7 {
        CoreId::Cm7
    } else {
        CoreId::Cm4
    }
}

pub fn is_interrupt() -> bool {
    SCB::vect_active() != VectActive::ThreadMode
}

#[inline]
pub fn mask_interrupts() {
    cortex_m::interrupt::disable();
}

#[inline]
pub fn unmask_interrupts() {
    // SAFETY: only called when the outermost Critical section ends.
    unsafe { cortex_m::interrupt::enable() };
}

#[inline]
pub fn barrier() {
    cortex_m::asm::dmb();
    cortex_m::asm::dsb();
}

#[inline]
pub fn wait_for_interrupt() {
    cortex_m::asm::wfi();
}

// ---------------------------------------------------------------------------
// Scheduling hooks
// ---------------------------------------------------------------------------

/// Pend PendSV: ICSR (0xE000_ED04), PENDSVSET = bit 28.
#[inline]
pub fn pend_switch() {
    const ICSR: *mut u32 = 0xE000_ED04 as *mut u32;
    unsafe {
        ptr::write_volatile(ICSR, 1 << 28);
    }
}

/// SEV raises the peer's CMx_SEV interrupt.
#[inline]
pub fn raise_peer_interrupt() {
    cortex_m::asm::dsb();
    cortex_m::asm::sev();
}

// ---------------------------------------------------------------------------
// HSEM
// ---------------------------------------------------------------------------

const HSEM_BASE: usize = 0x5802_6400;
const HSEM_RLR_OFFSET: usize = 0x80;
const HSEM_LOCK: u32 = 1 << 31;
const HSEM_COREID_SHIFT: u32 = 8;
const HSEM_COREID_MASK: u32 = 0xF;

/// The silicon HSEM bank. Uses the one-step read lock and process id 0.
pub struct HardwareHsem;

static HSEM: HardwareHsem = HardwareHsem;

impl HardwareHsem {
    fn r(slot: Slot) -> *mut u32 {
        (HSEM_BASE + 4 * slot.index()) as *mut u32
    }

    fn rlr(slot: Slot) -> *const u32 {
        (HSEM_BASE + HSEM_RLR_OFFSET + 4 * slot.index()) as *const u32
    }
}

impl HsemBank for HardwareHsem {
    fn try_lock(&self, slot: Slot, core: CoreId) -> bool {
        // SAFETY: RLR reads have the side effect of taking a free slot and
        // nothing else.
        let value = unsafe { ptr::read_volatile(Self::rlr(slot)) };
        value == HSEM_LOCK | (core.hsem_id() << HSEM_COREID_SHIFT)
    }

    fn unlock(&self, slot: Slot, core: CoreId) {
        // SAFETY: the silicon ignores writes whose COREID does not own the
        // slot.
        unsafe { ptr::write_volatile(Self::r(slot), core.hsem_id() << HSEM_COREID_SHIFT) };
    }

    fn owner(&self, slot: Slot) -> Option<CoreId> {
        // SAFETY: reading R has no side effect.
        let value = unsafe { ptr::read_volatile(Self::r(slot)) };
        if value & HSEM_LOCK == 0 {
            return None;
        }
        CoreId::from_hsem_id((value >> HSEM_COREID_SHIFT) & HSEM_COREID_MASK)
    }
}

pub fn hsem() -> &'static HardwareHsem {
    &HSEM
}

/// Counts SysTick wraps through COUNTFLAG, which keeps working with
/// interrupts masked.
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
        // SYST_CSR: 0xE000_E010, COUNTFLAG = bit 16, cleared by the read.
        const SYST_CSR: *const u32 = 0xE000_E010 as *const u32;
        let csr = unsafe { ptr::read_volatile(SYST_CSR) };
        (csr >> 16) & 1
    }

    fn restart(&mut self) {
        // Drops a COUNTFLAG latched before the wait began.
        self.poll();
    }
}

// ---------------------------------------------------------------------------
// Startup
// ---------------------------------------------------------------------------

/// RCC_AHB4ENR. Each core reads and writes its own copy of the enable
/// register through this address.
const RCC_AHB4ENR: *mut u32 = 0x5802_44E0 as *mut u32;
const RCC_AHB4ENR_HSEMEN: u32 = 1 << 25;

/// Run SysTick at the scheduler tick rate with its interrupt off, so the
/// gate timeout counts before the scheduler starts.
fn start_tick_counter(syst: &mut cortex_m::peripheral::SYST) {
    let reload = SYSTEM_CLOCK_HZ / TICK_HZ - 1;
    syst.set_reload(reload);
    syst.clear_current();
    syst.set_clock_source(SystClkSource::Core);
    syst.enable_counter();
}

/// Clock the HSEM bank and start the gate's tick counter on this core.
/// Called by `kernel::init` before anything takes the kernel gate.
pub fn init_core(_core: CoreId) {
    // SAFETY: read-modify-write of this core's own enable register, before
    // any other code on this core runs.
    unsafe {
        let enr = ptr::read_volatile(RCC_AHB4ENR);
        ptr::write_volatile(RCC_AHB4ENR, enr | RCC_AHB4ENR_HSEMEN);
        cortex_m::asm::dsb();
        while ptr::read_volatile(RCC_AHB4ENR) & RCC_AHB4ENR_HSEMEN == 0 {}
    }
    // SAFETY: the kernel owns SYST; nothing else steals it.
    let mut peripherals = unsafe { cortex_m::Peripherals::steal() };
    start_tick_counter(&mut peripherals.SYST);
}

/// Configure SysTick for the scheduler tick using the processor clock.
fn configure_tick(syst: &mut cortex_m::peripheral::SYST) {
    start_tick_counter(syst);
    syst.enable_interrupt();
}

/// PendSV and SysTick at the lowest priority.
fn set_interrupt_priorities() {
    unsafe {
        // System Handler Priority Register 3 (SHPR3): 0xE000_ED20
        // Bits [23:16] = PendSV priority
        // Bits [31:24] = SysTick priority
        let shpr3: *mut u32 = 0xE000_ED20 as *mut u32;
        let val = ptr::read_volatile(shpr3);
        let val = val | (0xFF << 16) | (0xFF << 24);
        ptr::write_volatile(shpr3, val);
    }
}

#[derive(Debug, Clone, Copy)]
struct Irq(u16);

// SAFETY: both numbers are valid STM32H745 interrupt lines.
unsafe impl InterruptNumber for Irq {
    fn number(self) -> u16 {
        self.0
    }
}

const CM7_SEV_IRQ: Irq = Irq(64);
const CM4_SEV_IRQ: Irq = Irq(65);

/// The interrupt a core receives when its peer executes SEV.
fn peer_irq(core: CoreId) -> Irq {
    match core {
        CoreId::Cm7 => CM4_SEV_IRQ,
        CoreId::Cm4 => CM7_SEV_IRQ,
    }
}

const LAUNCH_STACK_WORDS: usize = 128;

/// PSP for the first PendSV, which saves a frame nobody restores.
static mut LAUNCH_STACK: [u32; LAUNCH_STACK_WORDS] = [0; LAUNCH_STACK_WORDS];

/// Start the tick and the peer interrupt, then hand the core to the first
/// thread. Does not return.
pub fn launch(core: CoreId) -> ! {
    cortex_m::interrupt::disable();
    // SAFETY: the kernel owns SYST from here on; nothing else steals it.
    let mut peripherals = unsafe { cortex_m::Peripherals::steal() };
    configure_tick(&mut peripherals.SYST);
    set_interrupt_priorities();
    // SAFETY: the handler for the peer interrupt is bound in __INTERRUPTS.
    unsafe { NVIC::unmask(peer_irq(core)) };
    pend_switch();

    let top = unsafe { ptr::addr_of_mut!(LAUNCH_STACK) as usize } + LAUNCH_STACK_WORDS * 4;
    // SAFETY: switches Thread mode to the PSP and waits for the pended
    // switch; this stack frame is never returned to.
    unsafe {
        asm!(
            "msr psp, {top}",
            "msr control, {control}",
            "isb",
            "cpsie i",
            "2:",
            "wfi",
            "b 2b",
            top = in(reg) top,
            control = in(reg) 2u32,
            options(noreturn)
        );
    }
}

// ---------------------------------------------------------------------------
// Logging and faults
// ---------------------------------------------------------------------------

/// Write to ITM stimulus port 0 when the debugger enabled it.
pub fn debug_write(args: fmt::Arguments<'_>) {
    // SAFETY: the stimulus port is only written from inside the logger and
    // the kernel never reconfigures the ITM.
    unsafe {
        let itm = &mut *ITM::PTR.cast_mut();
        if itm.tcr.read() & 1 == 0 || itm.ter[0].read() & 1 == 0 {
            return;
        }
        cortex_m::itm::write_fmt(&mut itm.stim[0], args);
    }
}

/// Stop the core for the debugger.
pub fn halt(reason: fmt::Arguments<'_>) -> ! {
    cortex_m::interrupt::disable();
    debug_write(format_args!("halted: {}\n", reason));
    loop {
        cortex_m::asm::nop();
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Called from PendSV with the outgoing PSP; returns the incoming one.
extern "C" fn pendsv_switch(psp: usize) -> usize {
    kernel::switch_context(psp)
}

// PendSV: save the outgoing context on its PSP, swap stacks, restore.
//
// [Software frame, lowest address first]
//   R4-R11, EXC_RETURN
//   S16-S31 (only when EXC_RETURN bit 4 is clear)
#[cfg(has_fpu)]
global_asm!(
    ".section .text.PendSV,\"ax\",%progbits",
    ".global PendSV",
    ".type PendSV,%function",
    ".thumb_func",
    "PendSV:",
    "    mrs r0, psp",
    "    tst lr, #0x10",
    "    it eq",
    "    vstmdbeq r0!, {{s16-s31}}",
    "    stmdb r0!, {{r4-r11, lr}}",
    "    bl {switch}",
    "    ldmia r0!, {{r4-r11, lr}}",
    "    tst lr, #0x10",
    "    it eq",
    "    vldmiaeq r0!, {{s16-s31}}",
    "    msr psp, r0",
    "    isb",
    "    bx lr",
    ".size PendSV, . - PendSV",
    switch = sym pendsv_switch,
);

#[cfg(not(has_fpu))]
global_asm!(
    ".section .text.PendSV,\"ax\",%progbits",
    ".global PendSV",
    ".type PendSV,%function",
    ".thumb_func",
    "PendSV:",
    "    mrs r0, psp",
    "    stmdb r0!, {{r4-r11, lr}}",
    "    bl {switch}",
    "    ldmia r0!, {{r4-r11, lr}}",
    "    msr psp, r0",
    "    isb",
    "    bx lr",
    ".size PendSV, . - PendSV",
    switch = sym pendsv_switch,
);

#[exception]
fn SysTick() {
    kernel::on_tick();
}

/// CM7 executed SEV; taken on the CM4.
#[no_mangle]
pub unsafe extern "C" fn CM7_SEV_IT() {
    kernel::on_peer_interrupt();
}

/// CM4 executed SEV; taken on the CM7.
#[no_mangle]
pub unsafe extern "C" fn CM4_SEV_IT() {
    kernel::on_peer_interrupt();
}

// ---------------------------------------------------------------------------
// Device vector table
// ---------------------------------------------------------------------------

pub union Vector {
    handler: unsafe extern "C" fn(),
    reserved: usize,
}

extern "C" {
    fn DefaultHandler();
}

const NUM_IRQS: usize = 150;

const fn vectors() -> [Vector; NUM_IRQS] {
    let mut table = [const { Vector { handler: DefaultHandler } }; NUM_IRQS];
    table[CM7_SEV_IRQ.0 as usize] = Vector { handler: CM7_SEV_IT };
    table[CM4_SEV_IRQ.0 as usize] = Vector { handler: CM4_SEV_IT };
    table
}

#[link_section = ".vector_table.interrupts"]
#[no_mangle]
pub static __INTERRUPTS: [Vector; NUM_IRQS] = vectors();

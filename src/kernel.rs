//! # Kernel
//!
//! Public thread API and the glue between the shared [`Scheduler`] and the
//! architecture port.
//!
//! Every call takes the kernel gate through [`KERNEL`], lets the scheduler
//! compute the transition, releases the gate and only then raises whatever
//! switch request or peer interrupt the transition produced.
//!
//! ## Startup Sequence
//!
//! ```text
//! reset (cortex-m-rt), each core
//!   └─► main()
//!         ├─► kernel::init()          ← HSEM clock and tick counter on,
//!         │                             CM7 clears shared state, CM4 waits for it
//!         ├─► kernel::create_thread() ← (×N) threads of this core
//!         └─► kernel::start()         ← idle thread, SysTick, SEV, first switch
//! ```

use core::mem::size_of;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicU32, Ordering};

use static_assertions::const_assert;

use crate::arch;
use crate::config::{HEAP_SIZE, IDLE_STACK_SIZE, LOG_LEVEL, NUM_CORES, REMOTE_STOP_TIMEOUT, SHARED_RAM_SIZE};
use crate::cpu::CoreId;
use crate::error::{Error, Fault, Result};
use crate::fault::{self, FaultHook, ThreadFault};
use crate::heap::{self, AllocError, Allocator, KERNEL_HEAP};
use crate::hsem::Slot;
use crate::klog;
use crate::scheduler::{Destroy, Effects, Scheduler};
use crate::sync::{self, GateCell};
use crate::thread::{thread_mem_size, Stack, StackRegion, Thread, ThreadEntry, ThreadState};

pub use crate::cpu::{is_interrupt, this_core};
pub use crate::sync::{
    critical, enter_critical, enter_exclusive, exclusive, exit_critical, exit_exclusive, is_critical, is_exclusive,
};

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// Everything the two cores share. The linker script puts it, alone, at
/// the base of SRAM4 in both images, so the field offsets are the only
/// thing the images have to agree on.
#[repr(C)]
pub struct SharedState {
    /// Written by CM7 once the rest is initialised.
    stamp: AtomicU32,
    pub(crate) kernel: GateCell<Scheduler>,
    pub(crate) heap: GateCell<Allocator<HEAP_SIZE>>,
}

#[cfg_attr(all(target_arch = "arm", target_os = "none"), link_section = ".kernel_shared")]
pub(crate) static SHARED: SharedState = SharedState {
    stamp: AtomicU32::new(0),
    kernel: GateCell::new(Scheduler::new()),
    heap: GateCell::new(Allocator::new()),
};

/// The scheduler both cores share.
pub static KERNEL: &GateCell<Scheduler> = &SHARED.kernel;

const_assert!(size_of::<SharedState>() <= SHARED_RAM_SIZE);

const BOOT_MAGIC: u32 = 0x7174_0000;

/// Boot stamp of this build. The low half is the size of [`SharedState`] in
/// words of 8 bytes, so an image built with other tables never matches.
const BOOTED: u32 = BOOT_MAGIC | (size_of::<SharedState>() / 8) as u32;

const_assert!(size_of::<SharedState>() / 8 <= 0xFFFF);

const IDLE_MEM_SIZE: usize = thread_mem_size(IDLE_STACK_SIZE);

static mut IDLE_MEM: [Stack<IDLE_MEM_SIZE>; NUM_CORES] = [Stack::new(), Stack::new()];

// ---------------------------------------------------------------------------
// Startup
// ---------------------------------------------------------------------------

/// Initialise the kernel on this core. Call once per core, before any
/// other kernel function.
///
/// Both cores first clock the HSEM bank and start the tick counter the
/// gate timeout runs on. CM7 then resets the shared scheduler and kernel
/// heap, which live in uninitialised memory. CM4 waits until CM7 has done
/// so, and stops if CM7 was built with a different shared layout.
pub fn init() {
    let core = this_core();
    klog::init(LOG_LEVEL);
    arch::init_core(core);
    match core {
        CoreId::Cm7 => {
            SHARED.stamp.store(0, Ordering::Release);
            // SAFETY: CM4 does not touch the shared state before the stamp
            // is written, and interrupts are not running yet.
            unsafe {
                SHARED.kernel.reset(Scheduler::new());
                SHARED.heap.reset(Allocator::new());
            }
            arch::barrier();
            SHARED.stamp.store(BOOTED, Ordering::Release);
        }
        CoreId::Cm4 => loop {
            let stamp = SHARED.stamp.load(Ordering::Acquire);
            if stamp == BOOTED {
                break;
            }
            if stamp & 0xFFFF_0000 == BOOT_MAGIC {
                log::error!("shared state layout {:#x} does not match {:#x}", stamp, BOOTED);
                fault::system_fault(Fault::TableCorruption);
            }
            core::hint::spin_loop();
        },
    }
    log::info!("kernel initialised on {:?}", core);
}

/// Create the idle thread of `core` and mark it schedulable.
pub(crate) fn prepare(core: CoreId) -> Result<()> {
    // SAFETY: each core only ever takes its own entry, once.
    let mem = unsafe {
        let stack = ptr::addr_of_mut!(IDLE_MEM[core.index()]);
        StackRegion::from_raw(stack.cast::<u8>(), IDLE_MEM_SIZE)
    };
    KERNEL.with(|k| {
        k.create_idle(core, mem, idle)?;
        // The port pends the first switch itself once the tick is running.
        let _ = k.start_core(core);
        Ok(())
    })
}

/// Start scheduling on this core. Does not return.
pub fn start() -> ! {
    let core = this_core();
    if let Err(e) = prepare(core) {
        log::error!("cannot start {:?}: {}", core, e);
        fault::system_fault(Fault::TableCorruption);
    }
    log::info!("starting scheduler on {:?}", core);
    arch::launch(core)
}

extern "C" fn idle(_: usize) {
    loop {
        arch::wait_for_interrupt();
    }
}

/// Returned into by every thread entry.
pub(crate) extern "C" fn exit_trampoline() {
    exit()
}

// ---------------------------------------------------------------------------
// Port glue
// ---------------------------------------------------------------------------

/// Raise what a scheduler transition asked for.
pub(crate) fn apply(effects: Effects) {
    if effects.notify_peer {
        arch::raise_peer_interrupt();
    }
    if effects.reschedule {
        arch::pend_switch();
    }
}

/// Whether the caller may wait: a thread outside every section.
pub(crate) fn may_block() -> bool {
    !arch::is_interrupt() && !sync::in_section()
}

/// SysTick.
pub(crate) fn on_tick() {
    let core = this_core();
    let effects = KERNEL.with(|k| k.tick(core));
    apply(effects);
}

/// Inter-core interrupt raised by the peer.
pub(crate) fn on_peer_interrupt() {
    let core = this_core();
    let effects = KERNEL.with(|k| k.service_inbox(core));
    apply(effects);
}

/// PendSV body: takes the outgoing stack pointer and returns the incoming
/// one.
pub(crate) fn switch_context(saved_sp: usize) -> usize {
    let core = this_core();
    match KERNEL.with(|k| k.switch(core, saved_sp)) {
        Ok(switch) => {
            if switch.notify_peer {
                arch::raise_peer_interrupt();
            }
            if let Some((thread, fault)) = switch.fault {
                fault::report_thread_fault(core, thread, fault);
            }
            switch.sp
        }
        Err(fault) => fault::system_fault(fault),
    }
}

// ---------------------------------------------------------------------------
// Thread API
// ---------------------------------------------------------------------------

/// Create a thread on this core.
///
/// `mem` must be 8-byte aligned and at least
/// [`thread_mem_size(stack_size)`](thread_mem_size) bytes. With `None` the
/// memory comes from the kernel heap and goes back when the thread is
/// destroyed.
///
/// ```ignore
/// static mut MEM: Stack<{ thread_mem_size(1024) }> = Stack::new();
///
/// let mem: &'static mut [u8] = unsafe { &mut *core::ptr::addr_of_mut!(MEM.0) };
/// let worker = kernel::create_thread(Some(mem), worker_main, 0, 1024, 5)?;
/// ```
pub fn create_thread(
    mem: Option<&'static mut [u8]>,
    entry: ThreadEntry,
    arg: usize,
    stack_size: usize,
    priority: u8,
) -> Result<Thread> {
    let core = this_core();
    let (region, heap_owned) = match mem {
        Some(mem) => {
            if stack_size > mem.len() {
                return Err(Error::InvalidArg);
            }
            // SAFETY: the caller gave up the memory for good.
            (unsafe { StackRegion::from_raw(mem.as_mut_ptr(), mem.len()) }, false)
        }
        None => {
            if stack_size > HEAP_SIZE {
                return Err(Error::NoMemory);
            }
            let len = thread_mem_size(stack_size);
            let base = heap::alloc(len).ok_or(Error::NoMemory)?;
            // SAFETY: the block is ours until it is freed on destroy.
            (unsafe { StackRegion::from_raw(base.as_ptr(), len) }, true)
        }
    };

    match KERNEL.with(|k| k.create_thread(core, region, stack_size, entry, arg, priority, heap_owned)) {
        Ok((thread, effects)) => {
            apply(effects);
            Ok(thread)
        }
        Err(e) => {
            if heap_owned {
                if let Some(base) = NonNull::new(region.base() as *mut u8) {
                    heap::free(base)?;
                }
            }
            Err(e)
        }
    }
}

/// Destroy `thread` and reclaim its heap memory, if it has any.
///
/// Destroying the calling thread is [`exit`]. A thread running on the other
/// core is asked to stop and waited for, up to `REMOTE_STOP_TIMEOUT` ticks;
/// where waiting is not allowed this returns `Error::WouldBlock` once the
/// stop has been requested.
pub fn destroy_thread(thread: Thread) -> Result<()> {
    let core = this_core();
    if !arch::is_interrupt() && thread == this_thread() {
        exit();
    }
    let mut waited = 0;
    loop {
        match KERNEL.with(|k| k.destroy_thread(core, thread))? {
            Destroy::Done(mem, effects) => {
                apply(effects);
                if let Some(base) = mem {
                    release_thread_mem(core, thread, base);
                }
                return Ok(());
            }
            Destroy::Pending(effects) => {
                apply(effects);
                if !may_block() {
                    return Err(Error::WouldBlock);
                }
                if waited >= REMOTE_STOP_TIMEOUT {
                    log::warn!("thread {} did not stop in time", thread.id());
                    return Err(Error::Timeout);
                }
                sleep(1)?;
                waited += 1;
            }
        }
    }
}

fn release_thread_mem(core: CoreId, thread: Thread, base: usize) {
    let Some(block) = NonNull::new(base as *mut u8) else {
        return;
    };
    match KERNEL_HEAP.with(|heap| heap.free(block)) {
        Ok(()) => {}
        Err(AllocError::DoubleFree) => fault::report_thread_fault(core, thread, ThreadFault::DoubleFree),
        Err(AllocError::Foreign) => log::warn!("thread {} memory is not a heap block", thread.id()),
    }
}

pub fn suspend_thread(thread: Thread) -> Result<()> {
    let core = this_core();
    let effects = KERNEL.with(|k| k.suspend(core, thread))?;
    apply(effects);
    Ok(())
}

pub fn resume_thread(thread: Thread) -> Result<()> {
    let core = this_core();
    let effects = KERNEL.with(|k| k.resume(core, thread))?;
    apply(effects);
    Ok(())
}

pub fn set_thread_priority(thread: Thread, priority: u8) -> Result<()> {
    let core = this_core();
    let effects = KERNEL.with(|k| k.set_priority(core, thread, priority))?;
    apply(effects);
    Ok(())
}

pub fn thread_priority(thread: Thread) -> Result<u8> {
    KERNEL.with(|k| k.priority(thread))
}

/// State of `thread`. The calling thread sees itself as `Critical` or
/// `Exclusive` while it holds a section.
pub fn thread_state(thread: Thread) -> Result<ThreadState> {
    let core = this_core();
    let section = if sync::is_exclusive() {
        Some(ThreadState::Exclusive)
    } else if sync::is_critical() {
        Some(ThreadState::Critical)
    } else {
        None
    };
    let (state, is_self) = KERNEL.with(|k| k.state(thread).map(|s| (s, k.running_thread(core) == thread)))?;
    match section {
        Some(section) if is_self && !arch::is_interrupt() && state == ThreadState::Running => Ok(section),
        _ => Ok(state),
    }
}

pub fn thread_stack_size(thread: Thread) -> Result<usize> {
    KERNEL.with(|k| k.stack_size(thread))
}

/// Deepest stack use seen at a context switch, in bytes.
pub fn thread_stack_usage(thread: Thread) -> Result<usize> {
    KERNEL.with(|k| k.stack_usage(thread))
}

/// Ticks during which `thread` was the running thread.
pub fn thread_cpu_ticks(thread: Thread) -> Result<u64> {
    KERNEL.with(|k| k.cpu_ticks(thread))
}

pub fn is_thread_overflow(thread: Thread) -> Result<bool> {
    KERNEL.with(|k| k.is_overflow(thread))
}

pub fn is_valid_thread(thread: Thread) -> bool {
    KERNEL.with(|k| k.is_valid(thread))
}

/// The calling thread, or `Thread::INVALID` from an interrupt handler.
pub fn this_thread() -> Thread {
    if arch::is_interrupt() {
        return Thread::INVALID;
    }
    let core = this_core();
    KERNEL.with(|k| k.running_thread(core))
}

/// Let other threads of the same priority run.
pub fn yield_now() {
    let core = this_core();
    let effects = KERNEL.with(|k| k.yield_current(core));
    apply(effects);
}

/// Stop the calling thread. Its handle stays valid, in the `Stopped` state,
/// until it is destroyed.
pub fn exit() -> ! {
    if arch::is_interrupt() {
        fault::system_fault(Fault::ExitFromInterrupt);
    }
    let core = this_core();
    sync::reset_exclusive();
    sync::reset_critical();
    match KERNEL.with(|k| k.exit_current(core)) {
        Ok(effects) => apply(effects),
        Err(e) => log::warn!("exit refused: {}", e),
    }
    loop {
        arch::wait_for_interrupt();
    }
}

/// Block the calling thread for `ticks` ticks. Zero yields.
pub fn sleep(ticks: u32) -> Result<()> {
    if !may_block() {
        return Err(Error::NotPermitted);
    }
    let core = this_core();
    let effects = KERNEL.with(|k| k.sleep(core, ticks))?;
    apply(effects);
    KERNEL.with(|k| k.take_wait_status(core))
}

/// Block the calling thread until [`ticks`] reaches `deadline`. A deadline
/// already reached yields and returns at once.
///
/// ```ignore
/// let mut next = kernel::ticks();
/// loop {
///     next += 10;
///     kernel::sleep_until(next)?; // no drift from the loop body's run time
///     sample_sensors();
/// }
/// ```
pub fn sleep_until(deadline: u64) -> Result<()> {
    if !may_block() {
        return Err(Error::NotPermitted);
    }
    let core = this_core();
    let effects = KERNEL.with(|k| k.sleep_until(core, deadline))?;
    apply(effects);
    KERNEL.with(|k| k.take_wait_status(core))
}

/// Ticks since this core started scheduling.
pub fn ticks() -> u64 {
    let core = this_core();
    KERNEL.with(|k| k.ticks(core))
}

/// Install the handler for thread faults on this core. Without one a
/// thread fault stops the core.
pub fn set_fault_hook(hook: Option<FaultHook>) {
    fault::set_hook(this_core(), hook);
}

// ---------------------------------------------------------------------------
// Cross-core mutex slots
// ---------------------------------------------------------------------------

/// Reserve a hardware semaphore slot for an [`HwMutex`](crate::mutex::HwMutex).
pub fn claim_hsem_slot() -> Result<Slot> {
    KERNEL.with(|k| k.claim_hsem_slot())
}

pub fn release_hsem_slot(slot: Slot) -> Result<()> {
    KERNEL.with(|k| k.release_hsem_slot(slot))
}

#[cfg(test)]
mod tests {
    use std::boxed::Box;
    use std::sync::MutexGuard;

    use core::mem::offset_of;

    use super::*;
    use crate::arch::{set_core, set_interrupt};
    use crate::hsem::HsemBank;
    use crate::mutex::HwMutex;
    use crate::semaphore::Semaphore;
    use crate::timer::Timeout;

    const STACK: usize = 512;

    extern "C" fn body(_: usize) {}

    /// Resets the host context on drop, even when a test panics.
    struct Fresh {
        _serial: MutexGuard<'static, ()>,
    }

    impl Drop for Fresh {
        fn drop(&mut self) {
            set_interrupt(false);
            for core in CoreId::ALL {
                set_core(core);
                sync::reset_exclusive();
                sync::reset_critical();
                arch::unmask_interrupts();
            }
            set_core(CoreId::Cm7);
        }
    }

    fn fresh() -> Fresh {
        let serial = arch::serial();
        set_interrupt(false);
        set_core(CoreId::Cm7);
        sync::reset_exclusive();
        sync::reset_critical();
        init();
        for core in CoreId::ALL {
            arch::take_pended_switches(core);
            arch::take_peer_interrupts(core);
        }
        Fresh { _serial: serial }
    }

    fn static_mem() -> &'static mut [u8] {
        let stack: &'static mut Stack<{ thread_mem_size(STACK) }> = Box::leak(Box::new(Stack::new()));
        &mut stack.0
    }

    /// What PendSV does on this core, with the outgoing stack untouched.
    fn pendsv() -> Thread {
        let core = this_core();
        let sp = KERNEL.with(|k| k.current_slot(core).map_or(0, |slot| k.threads[slot].saved_sp));
        switch_context(sp);
        this_thread()
    }

    /// Start `core` the way `start` does and run its first switch.
    fn boot(core: CoreId) {
        set_core(core);
        prepare(core).unwrap();
        pendsv();
    }

    fn no_section_left_open() -> bool {
        !sync::is_critical() && !sync::is_exclusive()
    }

    #[test]
    fn test_init_prepares_each_core_before_the_gate() {
        let _fresh = fresh();
        assert!(arch::is_core_prepared(CoreId::Cm7));
        set_core(CoreId::Cm4);
        init();
        assert!(arch::is_core_prepared(CoreId::Cm4));
        assert_eq!(SHARED.stamp.load(Ordering::Acquire), BOOTED);
    }

    #[test]
    fn test_shared_state_layout() {
        assert_eq!(offset_of!(SharedState, stamp), 0);
        assert!(offset_of!(SharedState, kernel) < offset_of!(SharedState, heap));
        let base = &SHARED as *const SharedState as usize;
        assert_eq!(KERNEL as *const _ as usize, base + offset_of!(SharedState, kernel));
        assert_eq!(KERNEL_HEAP as *const _ as usize, base + offset_of!(SharedState, heap));
        assert_eq!(BOOTED & 0xFFFF_0000, BOOT_MAGIC);
        assert_eq!((BOOTED & 0xFFFF) as usize, size_of::<SharedState>() / 8);
    }

    #[test]
    #[should_panic(expected = "kernel table corruption")]
    fn test_secondary_rejects_a_foreign_shared_layout() {
        let _fresh = fresh();
        SHARED.stamp.store(BOOT_MAGIC | (BOOTED + 1) & 0xFFFF, Ordering::Release);
        set_core(CoreId::Cm4);
        init();
    }

    #[test]
    fn test_heap_thread_returns_memory_on_destroy() {
        let _fresh = fresh();
        let free_before = KERNEL_HEAP.with(|heap| heap.top());
        let t = create_thread(None, body, 0, STACK, 4).unwrap();
        assert!(KERNEL_HEAP.with(|heap| heap.top()) > free_before);
        assert_eq!(thread_stack_size(t), Ok(STACK));
        destroy_thread(t).unwrap();
        assert_eq!(KERNEL_HEAP.with(|heap| heap.top()), free_before);
        assert!(!is_valid_thread(t));
        assert!(KERNEL_HEAP.with(|heap| heap.can_alloc(HEAP_SIZE / 2)));
    }

    #[test]
    fn test_create_destroy_leaves_the_heap_byte_for_byte() {
        let _fresh = fresh();
        let keep = create_thread(None, body, 0, STACK, 3).unwrap();
        let before = KERNEL_HEAP.with(|heap| heap.snapshot());
        let t = create_thread(None, body, 0, 2 * STACK, 4).unwrap();
        assert_ne!(KERNEL_HEAP.with(|heap| heap.snapshot()), before);
        destroy_thread(t).unwrap();
        assert_eq!(KERNEL_HEAP.with(|heap| heap.snapshot()), before);
        assert!(is_valid_thread(keep));
    }

    #[test]
    fn test_static_memory_larger_than_the_stack() {
        let _fresh = fresh();
        let big: &'static mut Stack<{ thread_mem_size(4 * STACK) }> = Box::leak(Box::new(Stack::new()));
        let mem: &'static mut [u8] = &mut big.0;
        let t = create_thread(Some(mem), body, 0, STACK, 4).unwrap();
        assert_eq!(thread_stack_size(t), Ok(STACK));
        assert!(thread_stack_usage(t).unwrap() <= STACK);
    }

    #[test]
    fn test_calls_leave_no_section_open() {
        let _fresh = fresh();
        let t = create_thread(None, body, 0, STACK, 5).unwrap();
        assert!(no_section_left_open());
        boot(CoreId::Cm7);
        assert!(no_section_left_open());
        let sem = Semaphore::create(1, 1, false).unwrap();
        sem.acquire(Timeout::POLL).unwrap();
        assert_eq!(sem.acquire(Timeout::POLL), Err(Error::WouldBlock));
        assert!(no_section_left_open());
        sem.release().unwrap();
        yield_now();
        assert!(no_section_left_open());
        sleep(2).unwrap();
        assert!(no_section_left_open());
        on_tick();
        on_tick();
        assert!(no_section_left_open());
        assert_eq!(pendsv(), t);
        assert!(no_section_left_open());
        assert_eq!(thread_priority(Thread::INVALID), Err(Error::InvalidHandle));
        assert!(no_section_left_open());
    }

    #[test]
    fn test_failed_create_gives_heap_memory_back() {
        let _fresh = fresh();
        assert_eq!(create_thread(None, body, 0, STACK, 0), Err(Error::InvalidArg));
        assert_eq!(KERNEL_HEAP.with(|heap| heap.top()), 0);
        assert_eq!(create_thread(None, body, 0, HEAP_SIZE + 1, 3), Err(Error::NoMemory));
        assert_eq!(create_thread(Some(static_mem()), body, 0, STACK * 4, 3), Err(Error::InvalidArg));
    }

    #[test]
    fn test_thread_queries_through_the_api() {
        let _fresh = fresh();
        let t = create_thread(Some(static_mem()), body, 7, STACK, 6).unwrap();
        assert!(is_valid_thread(t));
        assert_eq!(thread_priority(t), Ok(6));
        assert_eq!(thread_state(t), Ok(ThreadState::Ready));
        assert_eq!(thread_cpu_ticks(t), Ok(0));
        assert_eq!(is_thread_overflow(t), Ok(false));
        assert!(thread_stack_usage(t).unwrap() > 0);

        set_thread_priority(t, 9).unwrap();
        assert_eq!(thread_priority(t), Ok(9));
        suspend_thread(t).unwrap();
        assert_eq!(thread_state(t), Ok(ThreadState::Suspended));
        resume_thread(t).unwrap();
        assert_eq!(thread_state(t), Ok(ThreadState::Ready));
        assert_eq!(thread_priority(Thread::INVALID), Err(Error::InvalidHandle));
    }

    #[test]
    fn test_running_thread_sees_its_sections() {
        let _fresh = fresh();
        let t = create_thread(Some(static_mem()), body, 0, STACK, 5).unwrap();
        boot(CoreId::Cm7);
        assert_eq!(this_thread(), t);
        assert_eq!(thread_state(t), Ok(ThreadState::Running));
        critical(|_| assert_eq!(thread_state(t), Ok(ThreadState::Critical)));
        exclusive(|_| assert_eq!(thread_state(t), Ok(ThreadState::Exclusive)));

        set_interrupt(true);
        assert_eq!(this_thread(), Thread::INVALID);
        assert_eq!(thread_state(t), Ok(ThreadState::Running));
    }

    #[test]
    fn test_blocking_refused_where_waiting_is_impossible() {
        let _fresh = fresh();
        let _t = create_thread(Some(static_mem()), body, 0, STACK, 5).unwrap();
        boot(CoreId::Cm7);
        let sem = Semaphore::create(0, 1, false).unwrap();

        let guard = sync::CriticalGuard::new();
        assert_eq!(sleep(5), Err(Error::NotPermitted));
        assert_eq!(sem.acquire(Timeout::FOREVER), Err(Error::NotPermitted));
        drop(guard);

        set_interrupt(true);
        assert_eq!(sem.acquire(Timeout::ticks(3)), Err(Error::NotPermitted));
        assert_eq!(sem.acquire(Timeout::POLL), Err(Error::WouldBlock));
        assert_eq!(sem.release(), Ok(()));
        set_interrupt(false);
        assert_eq!(sem.acquire(Timeout::POLL), Ok(()));
    }

    #[test]
    fn test_sleep_parks_until_the_tick_wakes_it() {
        let _fresh = fresh();
        let t = create_thread(Some(static_mem()), body, 0, STACK, 5).unwrap();
        boot(CoreId::Cm7);
        arch::take_pended_switches(CoreId::Cm7);

        sleep(3).unwrap();
        assert_eq!(arch::take_pended_switches(CoreId::Cm7), 1);
        assert_ne!(pendsv(), t);
        assert_eq!(thread_state(t), Ok(ThreadState::Suspended));

        on_tick();
        on_tick();
        assert_eq!(arch::take_pended_switches(CoreId::Cm7), 0);
        on_tick();
        assert_eq!(arch::take_pended_switches(CoreId::Cm7), 1);
        assert_eq!(pendsv(), t);
        assert_eq!(ticks(), 3);
    }

    #[test]
    fn test_sleep_until_parks_until_the_deadline() {
        let _fresh = fresh();
        let t = create_thread(Some(static_mem()), body, 0, STACK, 5).unwrap();
        boot(CoreId::Cm7);
        on_tick();
        arch::take_pended_switches(CoreId::Cm7);

        sleep_until(4).unwrap();
        assert_eq!(arch::take_pended_switches(CoreId::Cm7), 1);
        assert_ne!(pendsv(), t);
        on_tick();
        on_tick();
        assert_eq!(arch::take_pended_switches(CoreId::Cm7), 0);
        on_tick();
        assert_eq!(arch::take_pended_switches(CoreId::Cm7), 1);
        assert_eq!(pendsv(), t);
        assert_eq!(ticks(), 4);
    }

    #[test]
    fn test_sleep_until_a_passed_deadline_returns_at_once() {
        let _fresh = fresh();
        let t = create_thread(Some(static_mem()), body, 0, STACK, 5).unwrap();
        boot(CoreId::Cm7);
        on_tick();
        on_tick();
        arch::take_pended_switches(CoreId::Cm7);

        assert_eq!(sleep_until(1), Ok(()));
        assert_eq!(sleep_until(2), Ok(()));
        assert_eq!(arch::take_pended_switches(CoreId::Cm7), 2);
        assert_eq!(pendsv(), t);
        assert_eq!(thread_state(t), Ok(ThreadState::Running));

        set_interrupt(true);
        assert_eq!(sleep_until(10), Err(Error::NotPermitted));
    }

    #[test]
    fn test_hw_mutex_through_the_api() {
        let _fresh = fresh();
        let t = create_thread(Some(static_mem()), body, 0, STACK, 5).unwrap();
        boot(CoreId::Cm7);
        let slot = claim_hsem_slot().unwrap();
        for core in CoreId::ALL {
            arch::hsem().unlock(slot, core);
        }
        let mutex = HwMutex::new(slot).unwrap();
        assert_eq!(mutex.owner(), Ok(Thread::INVALID));

        let outer = mutex.lock(Timeout::FOREVER).unwrap();
        let inner = mutex.try_lock().unwrap();
        assert_eq!(mutex.owner(), Ok(t));
        assert_eq!(mutex.lock_count(), Ok(2));
        assert_eq!(arch::hsem().owner(slot), Some(CoreId::Cm7));
        assert_eq!(release_hsem_slot(slot), Err(Error::NotPermitted));

        drop(inner);
        assert_eq!(mutex.is_locked(), Ok(true));
        assert_eq!(outer.unlock(), Ok(()));
        assert_eq!(mutex.is_locked(), Ok(false));
        assert_eq!(arch::hsem().owner(slot), None);
        assert!(no_section_left_open());

        set_interrupt(true);
        assert!(matches!(mutex.lock(Timeout::POLL), Err(Error::NotPermitted)));
        set_interrupt(false);
        assert_eq!(release_hsem_slot(slot), Ok(()));
    }

    #[test]
    fn test_remote_stop_requested_from_interrupt() {
        let _fresh = fresh();
        set_core(CoreId::Cm4);
        let worker = create_thread(Some(static_mem()), body, 0, STACK, 5).unwrap();
        boot(CoreId::Cm4);
        assert_eq!(this_thread(), worker);

        set_core(CoreId::Cm7);
        set_interrupt(true);
        assert_eq!(destroy_thread(worker), Err(Error::WouldBlock));
        assert_eq!(arch::take_peer_interrupts(CoreId::Cm4), 1);
        set_interrupt(false);

        set_core(CoreId::Cm4);
        on_peer_interrupt();
        assert_eq!(thread_state(worker), Ok(ThreadState::Stopped));
        assert_eq!(arch::take_pended_switches(CoreId::Cm4), 1);
        pendsv();

        set_core(CoreId::Cm7);
        assert_eq!(destroy_thread(worker), Ok(()));
        assert!(!is_valid_thread(worker));
    }

    #[test]
    fn test_remote_stop_times_out_without_the_peer() {
        let _fresh = fresh();
        set_core(CoreId::Cm4);
        let worker = create_thread(Some(static_mem()), body, 0, STACK, 5).unwrap();
        boot(CoreId::Cm4);

        set_core(CoreId::Cm7);
        let _killer = create_thread(Some(static_mem()), body, 0, STACK, 5).unwrap();
        boot(CoreId::Cm7);
        assert_eq!(destroy_thread(worker), Err(Error::Timeout));
        assert!(is_valid_thread(worker));
    }

    #[test]
    fn test_hsem_slots_through_the_api() {
        let _fresh = fresh();
        let slot = claim_hsem_slot().unwrap();
        assert_ne!(slot, Slot::KERNEL_GATE);
        assert_eq!(release_hsem_slot(slot), Ok(()));
        assert_eq!(release_hsem_slot(slot), Err(Error::InvalidArg));
    }

    #[test]
    #[should_panic(expected = "thread exit from interrupt context")]
    fn test_exit_from_interrupt_is_fatal() {
        let _fresh = fresh();
        set_interrupt(true);
        exit();
    }
}

//! # Thread Control Block
//!
//! Defines the thread model: the opaque [`Thread`] handle applications hold,
//! the [`Tcb`] the scheduler keeps per table slot, and the stack layout a new
//! thread starts from.
//!
//! ## Stack layout
//!
//! ```text
//!   mem_base ─► ┌──────────────────────┐
//!               │ sentinel 0xDEADBEEF  │  guard, checked on every switch
//!   stack_base ►├──────────────────────┤
//!               │         ...          │  grows down
//!   saved_sp ─► │ r4-r11, EXC_RETURN   │  software frame (PendSV)
//!               │ r0-r3, r12, lr, pc,  │  hardware frame (exception entry)
//!               │ xPSR                 │
//!   stack_top ► └──────────────────────┘  8-byte aligned
//! ```

use crate::cpu::CoreId;
use crate::error::{Error, Result};

/// Smallest stack a thread may be created with, in bytes.
pub const THREAD_MIN_STACK_SIZE: usize = 128;

/// Pattern written below the stack and checked on every context switch.
pub const STACK_SENTINEL: u32 = 0xDEAD_BEEF;

/// Bytes reserved below the stack for the sentinel. Two words keep the
/// usable stack 8-byte aligned.
pub const GUARD_SIZE: usize = 8;

pub const STACK_ALIGN: usize = 8;

/// Thread entry point. Returning from it exits the thread.
pub type ThreadEntry = extern "C" fn(arg: usize);

/// Memory needed for a thread whose usable stack is `stack_size` bytes.
pub const fn thread_mem_size(stack_size: usize) -> usize {
    GUARD_SIZE + ((stack_size + STACK_ALIGN - 1) & !(STACK_ALIGN - 1))
}

/// Caller-provided thread memory with the alignment the kernel requires.
///
/// ```ignore
/// static mut WORKER_MEM: Stack<{ thread_mem_size(1024) }> = Stack::new();
/// ```
#[repr(C, align(8))]
pub struct Stack<const N: usize>(pub [u8; N]);

impl<const N: usize> Stack<N> {
    pub const fn new() -> Self {
        Stack([0; N])
    }
}

impl<const N: usize> Default for Stack<N> {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Opaque reference to a thread.
///
/// Two handles are equal exactly when they refer to the same thread. Ids are
/// never reused, so a handle to a destroyed thread stays invalid even after
/// its table slot is recycled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Thread {
    id: u32,
    slot: u16,
}

impl Thread {
    pub const INVALID: Thread = Thread { id: 0, slot: 0 };

    pub(crate) const fn from_raw(id: u32, slot: u16) -> Self {
        Thread { id, slot }
    }

    pub const fn id(&self) -> u32 {
        self.id
    }

    pub(crate) const fn slot(&self) -> usize {
        self.slot as usize
    }

    pub const fn is_invalid(&self) -> bool {
        self.id == 0
    }
}

// ---------------------------------------------------------------------------
// Public state
// ---------------------------------------------------------------------------

/// Observable state of a thread.
///
/// ```text
///   create ──► Ready ◄──── resume / wake ────┐
///               │ ▲                          │
///      schedule │ │ preempt / yield     Suspended
///               ▼ │                          ▲
///             Running ── suspend / block ────┘
///               │
///               ├── exit ─────────► Stopped   (terminal until destroy)
///               └── stack check ──► Overflow  (terminal until destroy)
/// ```
///
/// `Critical` and `Exclusive` are what a Running thread sees when it asks
/// about itself from inside a section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Exclusive,
    Critical,
    Running,
    Ready,
    Suspended,
    Stopped,
    Overflow,
}

// ---------------------------------------------------------------------------
// Control block
// ---------------------------------------------------------------------------

/// Lifecycle of a table slot's occupant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Life {
    Live,
    Stopped,
    Overflow,
}

/// What a blocked thread is waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    Semaphore(u16),
    Flag { slot: u16, state: bool },
    /// HSEM slot index of the contended mutex.
    HwMutex(u8),
    Sleep,
}

/// Request queued for the thread's owning core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Remote {
    /// Bring ready-queue membership in line with the thread's state.
    Sync,
    Stop,
}

/// A contiguous block of thread memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackRegion {
    base: usize,
    len: usize,
}

impl StackRegion {
    /// # Safety
    /// `base..base + len` must be writable memory that nothing else uses
    /// until the thread created on it is destroyed.
    pub unsafe fn from_raw(base: *mut u8, len: usize) -> Self {
        StackRegion { base: base as usize, len }
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The first `len` bytes of this region, or all of it when shorter.
    pub fn truncate(self, len: usize) -> Self {
        StackRegion {
            base: self.base,
            len: self.len.min(len),
        }
    }
}

pub struct Tcb {
    /// 0 marks a free slot.
    pub id: u32,
    pub core: CoreId,
    pub priority: u8,
    pub life: Life,
    pub suspended: bool,
    pub wait: Option<Wait>,
    /// Outcome of the most recent wait.
    pub wake_status: Result<()>,
    /// Ready-queue level this thread is linked at, if any.
    pub queued: Option<u8>,
    pub prev: Option<u16>,
    pub next: Option<u16>,
    pub wait_next: Option<u16>,
    pub remote: Option<Remote>,
    pub yielded: bool,
    pub mem_base: usize,
    pub mem_len: usize,
    pub stack_base: usize,
    pub stack_top: usize,
    pub saved_sp: usize,
    pub lowest_sp: usize,
    pub cpu_ticks: u64,
    /// Memory came from the kernel heap and goes back on destroy.
    pub heap_owned: bool,
}

impl Tcb {
    pub const EMPTY: Tcb = Tcb {
        id: 0,
        core: CoreId::Cm7,
        priority: 0,
        life: Life::Live,
        suspended: false,
        wait: None,
        wake_status: Ok(()),
        queued: None,
        prev: None,
        next: None,
        wait_next: None,
        remote: None,
        yielded: false,
        mem_base: 0,
        mem_len: 0,
        stack_base: 0,
        stack_top: 0,
        saved_sp: 0,
        lowest_sp: 0,
        cpu_ticks: 0,
        heap_owned: false,
    };

    pub fn is_free(&self) -> bool {
        self.id == 0
    }

    /// Occupy this slot with a fresh thread on `mem`.
    ///
    /// # Safety
    /// `mem` must satisfy the [`StackRegion::from_raw`] contract.
    pub unsafe fn init(
        &mut self,
        id: u32,
        core: CoreId,
        priority: u8,
        mem: StackRegion,
        entry: ThreadEntry,
        arg: usize,
        exit: extern "C" fn(),
    ) {
        *self = Tcb::EMPTY;
        self.id = id;
        self.core = core;
        self.priority = priority;
        self.mem_base = mem.base;
        self.mem_len = mem.len;
        self.stack_base = mem.base + GUARD_SIZE;
        self.stack_top = (mem.base + mem.len) & !(STACK_ALIGN - 1);

        let guard = mem.base as *mut u32;
        for word in 0..GUARD_SIZE / 4 {
            guard.add(word).write_volatile(STACK_SENTINEL);
        }
        self.saved_sp = init_frame(self.stack_top, entry as usize, arg, exit as usize);
        self.lowest_sp = self.saved_sp;
    }

    pub fn handle(&self, slot: usize) -> Thread {
        Thread::from_raw(self.id, slot as u16)
    }

    pub fn is_terminal(&self) -> bool {
        self.life != Life::Live
    }

    /// Eligible for a ready queue: alive, not suspended, not waiting.
    pub fn is_runnable(&self) -> bool {
        self.life == Life::Live && !self.suspended && self.wait.is_none()
    }

    pub fn stack_size(&self) -> usize {
        self.stack_top - self.stack_base
    }

    /// High-water mark of stack use in bytes.
    pub fn stack_usage(&self) -> usize {
        self.stack_top.saturating_sub(self.lowest_sp)
    }

    /// Record the stack pointer saved at a context switch. Returns false
    /// when the stack has overflowed.
    pub fn record_sp(&mut self, sp: usize) -> bool {
        self.saved_sp = sp;
        self.lowest_sp = self.lowest_sp.min(sp);
        sp >= self.stack_base && self.sentinel_intact()
    }

    pub fn sentinel_intact(&self) -> bool {
        // SAFETY: `mem_base` points at the guard words written by `init`,
        // which stay mapped for the lifetime of the thread.
        unsafe { (self.mem_base as *const u32).read_volatile() == STACK_SENTINEL }
    }
}

/// Check caller memory for a thread with a `stack_size`-byte stack.
pub fn validate_mem(base: usize, len: usize, stack_size: usize) -> Result<()> {
    if base % STACK_ALIGN != 0 || len < thread_mem_size(stack_size) {
        return Err(Error::InvalidArg);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Initial frame
// ---------------------------------------------------------------------------

/// Initial xPSR: Thumb state.
const INITIAL_XPSR: u32 = 0x0100_0000;

/// EXC_RETURN for Thread mode on PSP without an FPU frame.
pub const EXC_RETURN_THREAD_PSP: u32 = 0xFFFF_FFFD;

const HW_FRAME_WORDS: usize = 8;
const SW_FRAME_WORDS: usize = 9;

/// Bytes of the initial frame below `stack_top`.
pub const INITIAL_FRAME_SIZE: usize = (HW_FRAME_WORDS + SW_FRAME_WORDS) * 4;

/// Build the frame PendSV restores the first time the thread runs and
/// return its stack pointer.
///
/// ```text
/// [Hardware stacked frame]   <- stack_top - 32
///   R0    (arg)
///   R1-R3 (0)
///   R12   (0)
///   LR    (exit trampoline)
///   PC    (entry, Thumb bit cleared)
///   xPSR  (Thumb bit set)
/// [Software saved context]   <- returned stack pointer
///   R4-R11 (0)
///   EXC_RETURN
/// ```
unsafe fn init_frame(stack_top: usize, entry: usize, arg: usize, exit: usize) -> usize {
    let hw = (stack_top - HW_FRAME_WORDS * 4) as *mut u32;
    hw.add(0).write(arg as u32);
    for reg in 1..5 {
        hw.add(reg).write(0);
    }
    hw.add(5).write(exit as u32);
    hw.add(6).write(entry as u32 & !1);
    hw.add(7).write(INITIAL_XPSR);

    let sw = hw.sub(SW_FRAME_WORDS);
    for reg in 0..8 {
        sw.add(reg).write(0);
    }
    sw.add(8).write(EXC_RETURN_THREAD_PSP);
    sw as usize
}

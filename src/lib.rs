//! # Titan Kernel
//!
//! Thread scheduling and synchronization for the dual-core STM32H745 flight
//! computer (Cortex-M7 primary, Cortex-M4 secondary).
//!
//! ## Overview
//!
//! Each core runs its own preemptive priority scheduler over its own
//! threads. All kernel tables live in one [`Scheduler`](scheduler::Scheduler)
//! placed in SRAM4, which both cores see. Every mutation of it happens inside
//! an Exclusive section: interrupts masked on the calling core and HSEM slot
//! 0 held against the other core.
//!
//! - **Strict priorities**: 1..=31 for threads, 0 for the idle thread
//! - **No time-slicing**: equal priorities hand over at yield, block or exit
//! - **Cross-core wakeups**: posted to the owner core's inbox, delivered by
//!   the SEV interrupt
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                  Application Threads                    │
//! ├────────────────────────────────────────────────────────┤
//! │                Thread API (kernel.rs)                   │
//! │   init() · create_thread() · start() · sleep() · exit() │
//! ├──────────────────┬──────────────────┬──────────────────┤
//! │  Scheduler       │  Sync Primitives │  Allocator       │
//! │  scheduler.rs    │  semaphore.rs    │  heap.rs         │
//! │  timer.rs        │  flag.rs         │                  │
//! │  waitq.rs        │  mutex.rs        │                  │
//! ├──────────────────┴──────────────────┴──────────────────┤
//! │      Sections (sync.rs) · HSEM gate (hsem.rs)           │
//! │   critical() · exclusive() · GateCell · SlotAllocator   │
//! ├────────────────────────────────────────────────────────┤
//! │     Arch Port (arch/armv7m.rs, host: arch/fake.rs)      │
//! │   PendSV · SysTick · SEV · HSEM registers · ITM         │
//! ├────────────────────────────────────────────────────────┤
//! │        STM32H745: Cortex-M7 + Cortex-M4, HSEM            │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Memory Model
//!
//! - **Fixed tables**: threads, semaphores and flags live in arrays sized in
//!   `config.rs`
//! - **Thread memory**: caller-provided [`Stack`](thread::Stack) buffers, or
//!   blocks from the kernel heap when the caller passes none
//! - **No `alloc`**: pure `core`; the kernel heap is a fixed region
//! - **Shared state**: one `#[repr(C)]` record at the base of SRAM4
//!   (`.kernel_shared`, NOLOAD), cleared by `kernel::init` on the CM7. Both
//!   images must be built from the same sources: the boot stamp encodes the
//!   record's size and the CM4 refuses to start against a different one

#![cfg_attr(not(test), no_std)]

pub mod config;
pub mod error;
pub mod cpu;
pub mod arch;
pub mod hsem;
pub mod sync;
pub mod fault;
pub mod heap;
pub mod thread;
pub mod timer;
pub mod waitq;
pub mod scheduler;
pub mod semaphore;
pub mod flag;
pub mod mutex;
pub mod kernel;
pub mod klog;

pub use error::{Error, Fault, Result};
pub use flag::{Flag, FLAG_MEM_SIZE};
pub use hsem::Slot;
pub use mutex::{HwMutex, HwMutexGuard};
pub use semaphore::{Semaphore, SEMAPHORE_MEM_SIZE};
pub use thread::{thread_mem_size, Stack, Thread, ThreadState, THREAD_MIN_STACK_SIZE};
pub use timer::Timeout;

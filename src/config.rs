//! # Titan Kernel Configuration
//!
//! Compile-time constants governing the kernel. Every table in the kernel is
//! sized from these values; nothing is allocated at runtime apart from the
//! fixed kernel heap.

use static_assertions::const_assert;

/// Number of processor cores sharing the kernel (CM7 primary, CM4 secondary).
pub const NUM_CORES: usize = 2;

/// Maximum number of threads across both cores, idle threads included.
pub const MAX_THREADS: usize = 16;

/// Highest thread priority. Priorities run from 0 (reserved for the idle
/// thread of each core) to `MAX_PRIORITY`; larger values are more urgent.
pub const MAX_PRIORITY: u8 = 31;

/// Number of priority levels, i.e. ready queues per core.
pub const PRIORITY_LEVELS: usize = MAX_PRIORITY as usize + 1;

/// Capacity of the semaphore table.
pub const MAX_SEMAPHORES: usize = 16;

/// Capacity of the flag table.
pub const MAX_FLAGS: usize = 16;

/// SysTick frequency in Hz. One tick is the kernel's unit of time.
pub const TICK_HZ: u32 = 1000;

/// Core clock in Hz. Both cores run from the 64 MHz HSI after reset.
pub const SYSTEM_CLOCK_HZ: u32 = 64_000_000;

/// Tick budget for acquiring the kernel gate (HSEM slot 0). Running out of
/// it means the peer core died holding the gate.
pub const KERNEL_GATE_TIMEOUT: u32 = 1000;

/// Tick budget for the peer core to confirm a remote thread stop.
pub const REMOTE_STOP_TIMEOUT: u32 = 100;

/// Size in bytes of the kernel heap used for thread stacks when the caller
/// does not supply memory.
pub const HEAP_SIZE: usize = 32 * 1024;

/// Stack size in bytes of each core's idle thread.
pub const IDLE_STACK_SIZE: usize = 256;

/// Depth of each core's inter-core request inbox. A live thread has at most
/// one request in flight, and reaping a thread drops the requests still
/// queued for it.
pub const INBOX_DEPTH: usize = MAX_THREADS;

/// Bytes of SRAM4 reserved for the record both cores share. Must match the
/// `SHARED` region of both linker scripts.
pub const SHARED_RAM_SIZE: usize = 64 * 1024;

/// Maximum level passed to the `log` facade by `kernel::init`.
pub const LOG_LEVEL: log::LevelFilter = log::LevelFilter::Info;

const_assert!(NUM_CORES == 2);
const_assert!(MAX_THREADS < u16::MAX as usize);
const_assert!(MAX_SEMAPHORES < u16::MAX as usize);
const_assert!(MAX_FLAGS < u16::MAX as usize);
// Ready levels are tracked in a u32 bitmap.
const_assert!(PRIORITY_LEVELS <= 32);
const_assert!(HEAP_SIZE % 8 == 0);
const_assert!(IDLE_STACK_SIZE % 8 == 0);
const_assert!(SYSTEM_CLOCK_HZ % TICK_HZ == 0);

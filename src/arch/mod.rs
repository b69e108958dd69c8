//! # Architecture Abstraction Layer
//!
//! The boundary between the portable kernel and the processor. The firmware
//! build uses the ARMv7-M port; every other target gets a simulation port so
//! the kernel state machine can be exercised on the host.
//!
//! Both ports provide the same free functions and types:
//!
//! | Item | Purpose |
//! |------|---------|
//! | `this_core`, `is_interrupt` | execution context |
//! | `mask_interrupts`, `unmask_interrupts`, `barrier` | section primitives |
//! | `pend_switch`, `raise_peer_interrupt`, `wait_for_interrupt` | scheduling hooks |
//! | `hsem`, `GateTicks` | HSEM bank and gate tick source |
//! | `init_core` | HSEM clock and tick counter, before the first gate use |
//! | `launch` | tick, inter-core interrupt and first switch |
//! | `debug_write`, `halt` | logging sink and fatal stop |

#[cfg(all(target_arch = "arm", target_os = "none"))]
mod armv7m;
#[cfg(all(target_arch = "arm", target_os = "none"))]
pub use armv7m::*;

#[cfg(not(all(target_arch = "arm", target_os = "none")))]
pub mod fake;
#[cfg(not(all(target_arch = "arm", target_os = "none")))]
pub use fake::*;

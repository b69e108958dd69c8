//! Core identity.
//!
//! The STM32H745 runs one image per core. Both images link this crate and
//! tell each other apart at runtime from the CPUID part number.

use crate::arch;

/// One of the two processor cores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoreId {
    /// Cortex-M7, the primary core. Initialises the shared kernel state.
    Cm7,
    /// Cortex-M4, the secondary core.
    Cm4,
}

impl CoreId {
    pub const ALL: [CoreId; 2] = [CoreId::Cm7, CoreId::Cm4];

    /// Index into per-core tables.
    #[inline]
    pub const fn index(self) -> usize {
        match self {
            CoreId::Cm7 => 0,
            CoreId::Cm4 => 1,
        }
    }

    /// The other core.
    #[inline]
    pub const fn peer(self) -> CoreId {
        match self {
            CoreId::Cm7 => CoreId::Cm4,
            CoreId::Cm4 => CoreId::Cm7,
        }
    }

    /// Value of the HSEM `COREID` field for this core (RM0399 §11).
    #[inline]
    pub const fn hsem_id(self) -> u32 {
        match self {
            CoreId::Cm7 => 3,
            CoreId::Cm4 => 1,
        }
    }

    pub const fn from_hsem_id(id: u32) -> Option<CoreId> {
        match id {
            3 => Some(CoreId::Cm7),
            1 => Some(CoreId::Cm4),
            _ => None,
        }
    }
}

/// The core executing this code.
#[inline]
pub fn this_core() -> CoreId {
    arch::this_core()
}

/// True when called from an exception or interrupt handler.
#[inline]
pub fn is_interrupt() -> bool {
    arch::is_interrupt()
}

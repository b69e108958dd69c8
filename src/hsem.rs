//! # Hardware Semaphore Gate
//!
//! Thin layer over the STM32H7 HSEM bank: 32 lock registers, each either free
//! or owned by one core. The kernel uses slot 0 as the gate that serialises
//! every mutation of shared kernel state; the other slots are handed out as
//! cross-core user mutexes.
//!
//! ## Locking model
//!
//! ```text
//!   try_lock(slot, core)
//!     free            ──► owned by core     ──► true
//!     owned by core   ──► unchanged         ──► true
//!     owned by peer   ──► unchanged         ──► false
//!
//!   unlock(slot, core)
//!     owned by core   ──► free
//!     anything else   ──► unchanged (the silicon ignores foreign unlocks)
//! ```
//!
//! The hardware cannot tell two threads on the same core apart, so the slot
//! is not re-entrant in any useful sense. Ownership by thread is kept above
//! this layer (exclusive depth counting, [`HwMutex`](crate::mutex::HwMutex)).

use core::sync::atomic::{AtomicU32, Ordering};

use crate::cpu::CoreId;
use crate::error::{Error, Result};

/// Number of lock registers in the HSEM bank.
pub const NUM_SLOTS: usize = 32;

/// Index of one HSEM lock register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Slot(u8);

impl Slot {
    /// The kernel gate. Only the section layer takes it.
    pub const KERNEL_GATE: Slot = Slot(0);

    pub const fn new(index: u8) -> Option<Slot> {
        if (index as usize) < NUM_SLOTS {
            Some(Slot(index))
        } else {
            None
        }
    }

    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Register-level access to a bank of hardware semaphores.
pub trait HsemBank {
    /// Attempt to take `slot` for `core`. True if `core` owns it afterwards.
    fn try_lock(&self, slot: Slot, core: CoreId) -> bool;
    /// Free `slot` if `core` owns it.
    fn unlock(&self, slot: Slot, core: CoreId);
    /// Current owner of `slot`.
    fn owner(&self, slot: Slot) -> Option<CoreId>;
}

/// Source of elapsed ticks for timed acquisition.
///
/// Must keep counting with interrupts masked, since the kernel gate is
/// taken inside a critical section.
pub trait TickSource {
    /// Ticks elapsed since the previous call.
    fn poll(&mut self) -> u32;

    /// Forget ticks that elapsed before a wait starts.
    fn restart(&mut self) {}
}

#[inline]
pub fn try_acquire<B: HsemBank + ?Sized>(bank: &B, slot: Slot, core: CoreId) -> bool {
    bank.try_lock(slot, core)
}

/// Spin on `slot` until `core` owns it or `timeout` ticks have elapsed.
///
/// On `Err(Error::Timeout)` the slot is left as it was.
pub fn acquire<B, T>(bank: &B, slot: Slot, core: CoreId, timeout: u32, ticks: &mut T) -> Result<()>
where
    B: HsemBank + ?Sized,
    T: TickSource + ?Sized,
{
    ticks.restart();
    let mut elapsed: u32 = 0;
    loop {
        if bank.try_lock(slot, core) {
            return Ok(());
        }
        if elapsed >= timeout {
            return Err(Error::Timeout);
        }
        elapsed = elapsed.saturating_add(ticks.poll());
        core::hint::spin_loop();
    }
}

#[inline]
pub fn release<B: HsemBank + ?Sized>(bank: &B, slot: Slot, core: CoreId) {
    bank.unlock(slot, core);
}

// ---------------------------------------------------------------------------
// Simulated bank
// ---------------------------------------------------------------------------

/// Atomic model of the HSEM bank, used by the host port and by tests.
pub struct SimBank {
    slots: [AtomicU32; NUM_SLOTS],
}

impl SimBank {
    const FREE: AtomicU32 = AtomicU32::new(0);

    pub const fn new() -> Self {
        SimBank {
            slots: [Self::FREE; NUM_SLOTS],
        }
    }
}

impl Default for SimBank {
    fn default() -> Self {
        Self::new()
    }
}

impl HsemBank for SimBank {
    fn try_lock(&self, slot: Slot, core: CoreId) -> bool {
        let id = core.hsem_id();
        match self.slots[slot.index()].compare_exchange(0, id, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => true,
            Err(current) => current == id,
        }
    }

    fn unlock(&self, slot: Slot, core: CoreId) {
        let _ = self.slots[slot.index()].compare_exchange(
            core.hsem_id(),
            0,
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
    }

    fn owner(&self, slot: Slot) -> Option<CoreId> {
        CoreId::from_hsem_id(self.slots[slot.index()].load(Ordering::Acquire))
    }
}

// ---------------------------------------------------------------------------
// Slot allocation
// ---------------------------------------------------------------------------

/// Bookkeeping of which user slots are handed out. Slot 0 is never issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotAllocator {
    used: u32,
}

impl SlotAllocator {
    pub const fn new() -> Self {
        SlotAllocator { used: 1 }
    }

    pub fn claim(&mut self) -> Option<Slot> {
        let free = !self.used;
        if free == 0 {
            return None;
        }
        let index = free.trailing_zeros();
        self.used |= 1 << index;
        Slot::new(index as u8)
    }

    /// Returns false for the kernel gate and for slots not currently claimed.
    pub fn release(&mut self, slot: Slot) -> bool {
        let bit = 1u32 << slot.index();
        if slot == Slot::KERNEL_GATE || self.used & bit == 0 {
            return false;
        }
        self.used &= !bit;
        true
    }

    pub(crate) fn is_claimed(&self, slot: Slot) -> bool {
        slot != Slot::KERNEL_GATE && self.used & (1 << slot.index()) != 0
    }
}

impl Default for SlotAllocator {
    fn default() -> Self {
        Self::new()
    }
}

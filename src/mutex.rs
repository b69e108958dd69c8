//! # Cross-core Mutexes
//!
//! A mutex over one claimed HSEM slot, owned by a thread rather than a core.
//! The owner may lock it again; each lock adds to a count and the mutex is
//! free once as many unlocks have followed. Other threads, on either core,
//! park on a priority-ordered queue and the most urgent one becomes the
//! owner at the final unlock.
//!
//! The HSEM register mirrors ownership: it is held by the core of the owning
//! thread while the mutex is locked. After a hand-over to a thread on the
//! other core the new owner takes the register itself when it resumes.
//!
//! A thread that exits or is destroyed while holding mutexes gives them up
//! as if it had unlocked them.

use core::marker::PhantomData;

use crate::arch;
use crate::cpu::{self, this_core, CoreId};
use crate::error::{Error, Result};
use crate::hsem::{self, Slot, NUM_SLOTS};
use crate::kernel::{self, KERNEL};
use crate::scheduler::{Effects, Scheduler};
use crate::semaphore::Acquire;
use crate::thread::{Thread, Wait};
use crate::timer::Timeout;
use crate::waitq::WaitQueue;

pub struct MutexCb {
    /// Thread slot of the owner.
    pub owner: Option<u16>,
    /// Locks taken by the owner and not yet undone.
    pub count: u32,
    pub waiters: WaitQueue,
}

impl MutexCb {
    pub const EMPTY: MutexCb = MutexCb {
        owner: None,
        count: 0,
        waiters: WaitQueue::new(),
    };
}

/// Handle to the mutex on one HSEM slot.
///
/// ```ignore
/// let bus = HwMutex::new(kernel::claim_hsem_slot()?).ok_or(Error::InvalidArg)?;
/// {
///     let _held = bus.lock(Timeout::ticks(50))?;
///     // touch the peripheral both cores share
/// }
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HwMutex {
    slot: Slot,
}

impl HwMutex {
    /// Returns `None` for the kernel gate.
    pub const fn new(slot: Slot) -> Option<Self> {
        if slot.index() == Slot::KERNEL_GATE.index() {
            None
        } else {
            Some(HwMutex { slot })
        }
    }

    pub fn slot(&self) -> Slot {
        self.slot
    }

    /// Lock for the calling thread, waiting up to `timeout`.
    ///
    /// Locking a mutex the caller already owns succeeds at once and must be
    /// matched by one more unlock. Interrupt handlers cannot own a mutex and
    /// get `Error::NotPermitted`; so does a caller inside a section that
    /// would have to wait.
    pub fn lock(&self, timeout: Timeout) -> Result<HwMutexGuard<'_>> {
        if cpu::is_interrupt() {
            return Err(Error::NotPermitted);
        }
        let core = this_core();
        let may_block = kernel::may_block();
        match KERNEL.with(|k| k.hw_mutex_lock(core, self.slot, timeout, may_block))? {
            Acquire::Taken => {}
            Acquire::Blocked(effects) => {
                kernel::apply(effects);
                KERNEL.with(|k| -> Result<()> {
                    k.take_wait_status(core)?;
                    k.hw_mutex_take_slot(core, self.slot);
                    Ok(())
                })?;
            }
        }
        Ok(HwMutexGuard {
            mutex: self,
            _not_send: PhantomData,
        })
    }

    /// Lock without waiting. `Error::WouldBlock` when another thread owns it.
    pub fn try_lock(&self) -> Result<HwMutexGuard<'_>> {
        self.lock(Timeout::POLL)
    }

    fn unlock(&self) -> Result<()> {
        let core = this_core();
        let effects = KERNEL.with(|k| k.hw_mutex_unlock(core, self.slot))?;
        kernel::apply(effects);
        Ok(())
    }

    pub fn is_locked(&self) -> Result<bool> {
        self.owner().map(|owner| !owner.is_invalid())
    }

    /// The owning thread, or `Thread::INVALID` when the mutex is free.
    pub fn owner(&self) -> Result<Thread> {
        KERNEL.with(|k| k.hw_mutex_owner(self.slot))
    }

    pub fn lock_count(&self) -> Result<u32> {
        KERNEL.with(|k| k.hw_mutex_lock_count(self.slot))
    }
}

/// Undoes one lock on drop. Stays on the thread that locked.
#[must_use = "the mutex is unlocked as soon as the guard is dropped"]
pub struct HwMutexGuard<'a> {
    mutex: &'a HwMutex,
    _not_send: PhantomData<*const ()>,
}

impl HwMutexGuard<'_> {
    /// Unlock now and report the outcome, instead of on drop.
    pub fn unlock(self) -> Result<()> {
        let mutex = self.mutex;
        core::mem::forget(self);
        mutex.unlock()
    }
}

impl Drop for HwMutexGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.mutex.unlock() {
            log::warn!("HSEM slot {} unlock failed: {}", self.mutex.slot.index(), e);
        }
    }
}

impl Scheduler {
    fn hw_mutex_index(&self, slot: Slot) -> Result<usize> {
        if self.hsem_slots.is_claimed(slot) {
            Ok(slot.index())
        } else {
            Err(Error::InvalidHandle)
        }
    }

    pub fn hw_mutex_lock(&mut self, core: CoreId, slot: Slot, timeout: Timeout, may_block: bool) -> Result<Acquire> {
        let index = self.hw_mutex_index(slot)?;
        let caller = self.current_slot(core)?;
        match self.mutexes[index].owner {
            None => {
                let cb = &mut self.mutexes[index];
                cb.owner = Some(caller as u16);
                cb.count = 1;
                self.hw_mutex_take_slot(core, slot);
                Ok(Acquire::Taken)
            }
            Some(owner) if owner as usize == caller => {
                let cb = &mut self.mutexes[index];
                cb.count = cb.count.checked_add(1).ok_or(Error::NotPermitted)?;
                Ok(Acquire::Taken)
            }
            Some(_) => {
                if timeout.is_poll() {
                    return Err(Error::WouldBlock);
                }
                if !may_block {
                    return Err(Error::NotPermitted);
                }
                self.mutexes[index].waiters.push(&mut self.threads, caller);
                let effects = self.block_current(core, Wait::HwMutex(index as u8), timeout)?;
                Ok(Acquire::Blocked(effects))
            }
        }
    }

    /// Undo one lock taken by the running thread of `core`.
    pub fn hw_mutex_unlock(&mut self, core: CoreId, slot: Slot) -> Result<Effects> {
        let index = self.hw_mutex_index(slot)?;
        let caller = self.current_slot(core)?;
        let cb = &mut self.mutexes[index];
        if cb.owner != Some(caller as u16) {
            return Err(Error::NotPermitted);
        }
        cb.count -= 1;
        if cb.count > 0 {
            return Ok(Effects::NONE);
        }
        Ok(self.hand_over(core, slot))
    }

    /// Pass a mutex whose owner on `core` is done with it to the most urgent
    /// waiter, or free it.
    fn hand_over(&mut self, core: CoreId, slot: Slot) -> Effects {
        let index = slot.index();
        match self.mutexes[index].waiters.pop(&mut self.threads) {
            Some(next) => {
                let cb = &mut self.mutexes[index];
                cb.owner = Some(next as u16);
                cb.count = 1;
                if self.threads[next].core != core {
                    hsem::release(arch::hsem(), slot, core);
                }
                self.wake(core, next, Ok(()))
            }
            None => {
                let cb = &mut self.mutexes[index];
                cb.owner = None;
                cb.count = 0;
                hsem::release(arch::hsem(), slot, core);
                Effects::NONE
            }
        }
    }

    /// Hold the register of `slot` for `core`, whose running thread owns the
    /// mutex.
    pub(crate) fn hw_mutex_take_slot(&mut self, core: CoreId, slot: Slot) {
        if !hsem::try_acquire(arch::hsem(), slot, core) {
            log::warn!("HSEM slot {} is held outside the kernel", slot.index());
        }
    }

    /// Give up every mutex the thread in `slot` owns.
    pub(crate) fn abandon_mutexes(&mut self, slot: usize) -> Effects {
        let core = self.threads[slot].core;
        let mut effects = Effects::NONE;
        for index in 1..NUM_SLOTS {
            if self.mutexes[index].owner != Some(slot as u16) {
                continue;
            }
            if let Some(hsem_slot) = Slot::new(index as u8) {
                log::warn!("thread {} gave up HSEM slot {} while holding it", self.threads[slot].id, index);
                effects |= self.hand_over(core, hsem_slot);
            }
        }
        effects
    }

    pub fn hw_mutex_owner(&self, slot: Slot) -> Result<Thread> {
        let index = self.hw_mutex_index(slot)?;
        Ok(match self.mutexes[index].owner {
            Some(owner) => self.handle(owner as usize),
            None => Thread::INVALID,
        })
    }

    pub fn hw_mutex_lock_count(&self, slot: Slot) -> Result<u32> {
        let index = self.hw_mutex_index(slot)?;
        Ok(self.mutexes[index].count)
    }
}

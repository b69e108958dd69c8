//! # Flags
//!
//! A flag is a level-triggered binary event. Waiters park on one of two
//! queues depending on the state they await; `set` and `clear` wake every
//! waiter of the matching queue, highest priority first. Nobody consumes the
//! level, so any number of threads may pass one `set`.
//!
//! A woken waiter checks the state again before returning. If the flag
//! flipped back before it ran, it parks again for what is left of its
//! timeout, so a successful `wait` always observed the requested state.

use crate::cpu::{this_core, CoreId};
use crate::error::{Error, Result};
use crate::kernel::{self, KERNEL};
use crate::scheduler::{Effects, Scheduler};
use crate::thread::Wait;
use crate::timer::Timeout;
use crate::waitq::WaitQueue;

/// Flags live in the kernel's own table; creating one needs no caller
/// memory.
pub const FLAG_MEM_SIZE: usize = 0;

pub struct FlagCb {
    pub id: u32,
    pub state: bool,
    pub shared: bool,
    pub core: CoreId,
    waiting_set: WaitQueue,
    waiting_clear: WaitQueue,
}

impl FlagCb {
    pub const EMPTY: FlagCb = FlagCb {
        id: 0,
        state: false,
        shared: false,
        core: CoreId::Cm7,
        waiting_set: WaitQueue::new(),
        waiting_clear: WaitQueue::new(),
    };

    /// Queue of threads waiting for the flag to become `state`.
    pub fn waiters_mut(&mut self, state: bool) -> &mut WaitQueue {
        if state {
            &mut self.waiting_set
        } else {
            &mut self.waiting_clear
        }
    }

    pub fn waiters(&self, state: bool) -> &WaitQueue {
        if state {
            &self.waiting_set
        } else {
            &self.waiting_clear
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagWait {
    /// The flag already holds the awaited state.
    Observed,
    Blocked(Effects),
}

/// Handle to a flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Flag {
    id: u32,
    slot: u16,
}

impl Flag {
    pub const INVALID: Flag = Flag { id: 0, slot: 0 };

    pub fn id(self) -> u32 {
        self.id
    }

    pub fn create(initial: bool, shared: bool) -> Result<Flag> {
        let core = this_core();
        KERNEL.with(|k| k.flag_create(core, initial, shared))
    }

    /// Destroy the flag. Waiters wake with `Error::InvalidHandle`.
    pub fn destroy(self) -> Result<()> {
        let core = this_core();
        let effects = KERNEL.with(|k| k.flag_destroy(core, self))?;
        kernel::apply(effects);
        Ok(())
    }

    pub fn set(self) -> Result<()> {
        self.put(true)
    }

    pub fn clear(self) -> Result<()> {
        self.put(false)
    }

    fn put(self, state: bool) -> Result<()> {
        let core = this_core();
        let effects = KERNEL.with(|k| k.flag_put(core, self, state))?;
        kernel::apply(effects);
        Ok(())
    }

    pub fn get(self) -> Result<bool> {
        let core = this_core();
        KERNEL.with(|k| k.flag(core, self).map(|f| f.state))
    }

    /// Wait until the flag is `state`.
    ///
    /// Returns at once when it already is. `Error::WouldBlock` when polling
    /// finds the other state, `Error::Timeout` when the timeout runs out,
    /// `Error::InvalidHandle` when the flag is destroyed meanwhile.
    pub fn wait(self, state: bool, timeout: Timeout) -> Result<()> {
        let core = this_core();
        let may_block = kernel::may_block();
        let deadline = timeout.deadline(kernel::ticks());
        let mut remaining = timeout;
        loop {
            match KERNEL.with(|k| k.flag_wait(core, self, state, remaining, may_block))? {
                FlagWait::Observed => return Ok(()),
                FlagWait::Blocked(effects) => {
                    kernel::apply(effects);
                    KERNEL.with(|k| k.take_wait_status(core))?;
                }
            }
            remaining = Timeout::remaining(deadline, kernel::ticks());
            if remaining.is_poll() {
                // Out of time, but one last look may still find the state.
                return match KERNEL.with(|k| k.flag(core, self).map(|f| f.state == state))? {
                    true => Ok(()),
                    false => Err(Error::Timeout),
                };
            }
        }
    }

    pub fn is_valid(self) -> bool {
        KERNEL.with(|k| k.flag_slot(self).is_ok())
    }
}

impl Scheduler {
    pub(crate) fn flag_slot(&self, flag: Flag) -> Result<usize> {
        let slot = flag.slot as usize;
        match self.flags.get(slot) {
            Some(cb) if flag.id != 0 && cb.id == flag.id => Ok(slot),
            _ => Err(Error::InvalidHandle),
        }
    }

    /// Control block of `flag` as seen from `core`.
    pub fn flag(&self, core: CoreId, flag: Flag) -> Result<&FlagCb> {
        let cb = &self.flags[self.flag_slot(flag)?];
        if !cb.shared && cb.core != core {
            return Err(Error::NotPermitted);
        }
        Ok(cb)
    }

    fn flag_checked(&self, core: CoreId, flag: Flag) -> Result<usize> {
        self.flag(core, flag)?;
        self.flag_slot(flag)
    }

    pub fn flag_create(&mut self, core: CoreId, initial: bool, shared: bool) -> Result<Flag> {
        let slot = self.flags.iter().position(|f| f.id == 0).ok_or(Error::NoMemory)?;
        let id = self.alloc_id();
        self.flags[slot] = FlagCb {
            id,
            state: initial,
            shared,
            core,
            ..FlagCb::EMPTY
        };
        Ok(Flag { id, slot: slot as u16 })
    }

    pub fn flag_destroy(&mut self, core: CoreId, flag: Flag) -> Result<Effects> {
        let slot = self.flag_checked(core, flag)?;
        let mut effects = Effects::NONE;
        for state in [true, false] {
            effects |= self.wake_flag_waiters(core, slot, state, Err(Error::InvalidHandle));
        }
        self.flags[slot] = FlagCb::EMPTY;
        Ok(effects)
    }

    /// Drive the flag to `state` and release everyone waiting for it.
    pub fn flag_put(&mut self, core: CoreId, flag: Flag, state: bool) -> Result<Effects> {
        let slot = self.flag_checked(core, flag)?;
        if self.flags[slot].state == state {
            return Ok(Effects::NONE);
        }
        self.flags[slot].state = state;
        Ok(self.wake_flag_waiters(core, slot, state, Ok(())))
    }

    fn wake_flag_waiters(&mut self, core: CoreId, slot: usize, state: bool, status: Result<()>) -> Effects {
        let mut effects = Effects::NONE;
        while let Some(waiter) = self.flags[slot].waiters_mut(state).pop(&mut self.threads) {
            effects |= self.wake(core, waiter, status);
        }
        effects
    }

    pub fn flag_wait(
        &mut self,
        core: CoreId,
        flag: Flag,
        state: bool,
        timeout: Timeout,
        may_block: bool,
    ) -> Result<FlagWait> {
        let slot = self.flag_checked(core, flag)?;
        if self.flags[slot].state == state {
            return Ok(FlagWait::Observed);
        }
        if timeout.is_poll() {
            return Err(Error::WouldBlock);
        }
        if !may_block {
            return Err(Error::NotPermitted);
        }
        let waiter = self.current_slot(core)?;
        self.flags[slot].waiters_mut(state).push(&mut self.threads, waiter);
        let wait = Wait::Flag {
            slot: slot as u16,
            state,
        };
        Ok(FlagWait::Blocked(self.block_current(core, wait, timeout)?))
    }
}

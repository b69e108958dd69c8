//! # Counting Semaphores
//!
//! A semaphore holds a count in `[0, max]`. Acquire takes one unit or waits
//! for one; release hands its unit straight to the most urgent waiter when
//! there is one, so the count only rises while nobody waits.
//!
//! Semaphores created with `shared = false` belong to the creating core and
//! refuse calls from the other one. Shared semaphores can be used from both
//! cores; a release on one core wakes a waiter on the other through the
//! peer's inbox.

use crate::cpu::{this_core, CoreId};
use crate::error::{Error, Result};
use crate::kernel::{self, KERNEL};
use crate::scheduler::{Effects, Scheduler};
use crate::thread::Wait;
use crate::timer::Timeout;
use crate::waitq::WaitQueue;

/// Semaphores live in the kernel's own table; creating one needs no caller
/// memory.
pub const SEMAPHORE_MEM_SIZE: usize = 0;

pub struct SemaphoreCb {
    pub id: u32,
    pub count: u32,
    pub max: u32,
    pub shared: bool,
    pub core: CoreId,
    pub waiters: WaitQueue,
}

impl SemaphoreCb {
    pub const EMPTY: SemaphoreCb = SemaphoreCb {
        id: 0,
        count: 0,
        max: 0,
        shared: false,
        core: CoreId::Cm7,
        waiters: WaitQueue::new(),
    };
}

/// Outcome of an acquire attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    Taken,
    /// The caller is parked; apply the effects and read the wake status.
    Blocked(Effects),
}

/// Handle to a counting semaphore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Semaphore {
    id: u32,
    slot: u16,
}

impl Semaphore {
    pub const INVALID: Semaphore = Semaphore { id: 0, slot: 0 };

    pub fn id(self) -> u32 {
        self.id
    }

    /// Create a semaphore with `initial` units out of `max`.
    pub fn create(initial: u32, max: u32, shared: bool) -> Result<Semaphore> {
        let core = this_core();
        KERNEL.with(|k| k.semaphore_create(core, initial, max, shared))
    }

    /// Destroy the semaphore. Threads still waiting wake with
    /// `Error::InvalidHandle`.
    pub fn destroy(self) -> Result<()> {
        let core = this_core();
        let effects = KERNEL.with(|k| k.semaphore_destroy(core, self))?;
        kernel::apply(effects);
        Ok(())
    }

    /// Take one unit, waiting up to `timeout` for it.
    ///
    /// Returns `Error::WouldBlock` when polling finds no unit, and
    /// `Error::NotPermitted` when a wait is needed but the caller is an
    /// interrupt handler or inside a section.
    pub fn acquire(self, timeout: Timeout) -> Result<()> {
        let core = this_core();
        let may_block = kernel::may_block();
        match KERNEL.with(|k| k.semaphore_acquire(core, self, timeout, may_block))? {
            Acquire::Taken => Ok(()),
            Acquire::Blocked(effects) => {
                kernel::apply(effects);
                KERNEL.with(|k| k.take_wait_status(core))
            }
        }
    }

    /// Give back one unit. Fails with `Error::NotPermitted` when the count
    /// is already at its maximum.
    pub fn release(self) -> Result<()> {
        let core = this_core();
        let effects = KERNEL.with(|k| k.semaphore_release(core, self))?;
        kernel::apply(effects);
        Ok(())
    }

    pub fn count(self) -> Result<u32> {
        let core = this_core();
        KERNEL.with(|k| k.semaphore(core, self).map(|s| s.count))
    }

    pub fn max_count(self) -> Result<u32> {
        let core = this_core();
        KERNEL.with(|k| k.semaphore(core, self).map(|s| s.max))
    }

    pub fn is_valid(self) -> bool {
        KERNEL.with(|k| k.semaphore_slot(self).is_ok())
    }
}

impl Scheduler {
    pub(crate) fn semaphore_slot(&self, sem: Semaphore) -> Result<usize> {
        let slot = sem.slot as usize;
        match self.semaphores.get(slot) {
            Some(cb) if sem.id != 0 && cb.id == sem.id => Ok(slot),
            _ => Err(Error::InvalidHandle),
        }
    }

    /// Control block of `sem` as seen from `core`.
    pub fn semaphore(&self, core: CoreId, sem: Semaphore) -> Result<&SemaphoreCb> {
        let cb = &self.semaphores[self.semaphore_slot(sem)?];
        if !cb.shared && cb.core != core {
            return Err(Error::NotPermitted);
        }
        Ok(cb)
    }

    fn semaphore_checked(&self, core: CoreId, sem: Semaphore) -> Result<usize> {
        self.semaphore(core, sem)?;
        self.semaphore_slot(sem)
    }

    pub fn semaphore_create(&mut self, core: CoreId, initial: u32, max: u32, shared: bool) -> Result<Semaphore> {
        if max == 0 || initial > max {
            return Err(Error::InvalidArg);
        }
        let slot = self
            .semaphores
            .iter()
            .position(|s| s.id == 0)
            .ok_or(Error::NoMemory)?;
        let id = self.alloc_id();
        self.semaphores[slot] = SemaphoreCb {
            id,
            count: initial,
            max,
            shared,
            core,
            waiters: WaitQueue::new(),
        };
        Ok(Semaphore { id, slot: slot as u16 })
    }

    pub fn semaphore_destroy(&mut self, core: CoreId, sem: Semaphore) -> Result<Effects> {
        let slot = self.semaphore_checked(core, sem)?;
        let mut effects = Effects::NONE;
        while let Some(waiter) = self.semaphores[slot].waiters.pop(&mut self.threads) {
            effects |= self.wake(core, waiter, Err(Error::InvalidHandle));
        }
        self.semaphores[slot] = SemaphoreCb::EMPTY;
        Ok(effects)
    }

    pub fn semaphore_acquire(
        &mut self,
        core: CoreId,
        sem: Semaphore,
        timeout: Timeout,
        may_block: bool,
    ) -> Result<Acquire> {
        let slot = self.semaphore_checked(core, sem)?;
        let cb = &mut self.semaphores[slot];
        if cb.count > 0 {
            cb.count -= 1;
            return Ok(Acquire::Taken);
        }
        if timeout.is_poll() {
            return Err(Error::WouldBlock);
        }
        if !may_block {
            return Err(Error::NotPermitted);
        }
        let waiter = self.current_slot(core)?;
        self.semaphores[slot].waiters.push(&mut self.threads, waiter);
        let effects = self.block_current(core, Wait::Semaphore(slot as u16), timeout)?;
        Ok(Acquire::Blocked(effects))
    }

    pub fn semaphore_release(&mut self, core: CoreId, sem: Semaphore) -> Result<Effects> {
        let slot = self.semaphore_checked(core, sem)?;
        if let Some(waiter) = self.semaphores[slot].waiters.pop(&mut self.threads) {
            return Ok(self.wake(core, waiter, Ok(())));
        }
        let cb = &mut self.semaphores[slot];
        if cb.count >= cb.max {
            return Err(Error::NotPermitted);
        }
        cb.count += 1;
        Ok(Effects::NONE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::sim::Sim;
    use crate::thread::ThreadState;
    use proptest::prelude::*;

    const CM7: CoreId = CoreId::Cm7;
    const CM4: CoreId = CoreId::Cm4;

    /// Acquire from the running thread of `core`, letting the system settle
    /// if it blocks.
    fn acquire(sim: &mut Sim, core: CoreId, sem: Semaphore, timeout: Timeout) -> Option<Result<()>> {
        match sim.sched.semaphore_acquire(core, sem, timeout, true) {
            Ok(Acquire::Taken) => Some(Ok(())),
            Ok(Acquire::Blocked(effects)) => {
                sim.run(core, effects);
                None
            }
            Err(e) => Some(Err(e)),
        }
    }

    fn release(sim: &mut Sim, core: CoreId, sem: Semaphore) -> Result<()> {
        let effects = sim.sched.semaphore_release(core, sem)?;
        sim.run(core, effects);
        Ok(())
    }

    #[test]
    fn test_create_validates_bounds() {
        let mut sched = Scheduler::new();
        assert_eq!(sched.semaphore_create(CM7, 0, 0, false), Err(Error::InvalidArg));
        assert_eq!(sched.semaphore_create(CM7, 3, 2, false), Err(Error::InvalidArg));
        let sem = sched.semaphore_create(CM7, 2, 2, false).unwrap();
        assert_eq!(sched.semaphore(CM7, sem).map(|s| s.count), Ok(2));
    }

    #[test]
    fn test_table_exhaustion() {
        let mut sched = Scheduler::new();
        for _ in 0..crate::config::MAX_SEMAPHORES {
            sched.semaphore_create(CM7, 0, 1, false).unwrap();
        }
        assert_eq!(sched.semaphore_create(CM7, 0, 1, false), Err(Error::NoMemory));
    }

    #[test]
    fn test_poll_and_release_bounds() {
        let mut sim = Sim::new();
        let _t = sim.spawn(CM7, 5);
        let sem = sim.sched.semaphore_create(CM7, 1, 1, false).unwrap();
        assert_eq!(acquire(&mut sim, CM7, sem, Timeout::POLL), Some(Ok(())));
        assert_eq!(acquire(&mut sim, CM7, sem, Timeout::POLL), Some(Err(Error::WouldBlock)));
        assert_eq!(
            sim.sched.semaphore_acquire(CM7, sem, Timeout::FOREVER, false),
            Err(Error::NotPermitted)
        );
        assert_eq!(release(&mut sim, CM7, sem), Ok(()));
        assert_eq!(release(&mut sim, CM7, sem), Err(Error::NotPermitted));
        assert_eq!(sim.sched.semaphore(CM7, sem).map(|s| s.count), Ok(1));
    }

    #[test]
    fn test_private_semaphore_rejects_other_core() {
        let mut sched = Scheduler::new();
        let private = sched.semaphore_create(CM7, 1, 1, false).unwrap();
        let shared = sched.semaphore_create(CM7, 1, 1, true).unwrap();
        assert_eq!(sched.semaphore_release(CM4, private), Err(Error::NotPermitted));
        assert_eq!(
            sched.semaphore_acquire(CM4, private, Timeout::POLL, true),
            Err(Error::NotPermitted)
        );
        assert_eq!(sched.semaphore_acquire(CM4, shared, Timeout::POLL, true), Ok(Acquire::Taken));
    }

    #[test]
    fn test_ping_pong_ten_thousand_handoffs() {
        let mut sim = Sim::new();
        let a = sim.spawn(CM7, 5);
        let b = sim.spawn(CM7, 5);
        let s1 = sim.sched.semaphore_create(CM7, 0, 1, false).unwrap();
        let s2 = sim.sched.semaphore_create(CM7, 0, 1, false).unwrap();

        // B parks on S1 first.
        let effects = sim.sched.yield_current(CM7);
        sim.run(CM7, effects);
        assert_eq!(sim.running(CM7), b);
        assert_eq!(acquire(&mut sim, CM7, s1, Timeout::FOREVER), None);

        let mut handoffs = 0;
        for _ in 0..5_000 {
            assert_eq!(sim.running(CM7), a);
            release(&mut sim, CM7, s1).unwrap();
            assert_eq!(acquire(&mut sim, CM7, s2, Timeout::FOREVER), None);

            assert_eq!(sim.running(CM7), b);
            assert_eq!(sim.sched.take_wait_status(CM7), Ok(()));
            handoffs += 1;
            release(&mut sim, CM7, s2).unwrap();
            assert_eq!(acquire(&mut sim, CM7, s1, Timeout::FOREVER), None);

            assert_eq!(sim.running(CM7), a);
            assert_eq!(sim.sched.take_wait_status(CM7), Ok(()));
            handoffs += 1;
        }
        assert_eq!(handoffs, 10_000);
        assert_eq!(sim.sched.semaphore(CM7, s1).map(|s| s.count), Ok(0));
        assert_eq!(sim.sched.semaphore(CM7, s2).map(|s| s.count), Ok(0));
    }

    #[test]
    fn test_release_from_interrupt_preempts_low_priority() {
        let mut sim = Sim::new();
        let high = sim.spawn(CM7, 10);
        let sem = sim.sched.semaphore_create(CM7, 0, 1, false).unwrap();
        assert_eq!(acquire(&mut sim, CM7, sem, Timeout::FOREVER), None);
        let low = sim.spawn(CM7, 1);
        assert_eq!(sim.running(CM7), low);

        // An interrupt handler releases: the switch is pended and taken on
        // exception return, before `low` executes again.
        let effects = sim.sched.semaphore_release(CM7, sem).unwrap();
        assert!(effects.reschedule);
        sim.run(CM7, effects);
        assert_eq!(sim.running(CM7), high);
        assert_eq!(sim.sched.state(low), Ok(ThreadState::Ready));

        // `low` gets no processor time while `high` keeps running.
        for _ in 0..5 {
            sim.tick(CM7);
        }
        assert_eq!(sim.running(CM7), high);
        assert_eq!(sim.sched.cpu_ticks(low), Ok(0));
        assert_eq!(sim.sched.cpu_ticks(high), Ok(5));
    }

    #[test]
    fn test_release_wakes_highest_priority_waiter() {
        let mut sim = Sim::new();
        let sem = sim.sched.semaphore_create(CM7, 0, 5, false).unwrap();
        let low = sim.spawn(CM7, 3);
        assert_eq!(acquire(&mut sim, CM7, sem, Timeout::FOREVER), None);
        let high = sim.spawn(CM7, 7);
        assert_eq!(acquire(&mut sim, CM7, sem, Timeout::FOREVER), None);
        let releaser = sim.spawn(CM7, 2);
        assert_eq!(sim.running(CM7), releaser);

        release(&mut sim, CM7, sem).unwrap();
        assert_eq!(sim.running(CM7), high);
        assert_eq!(sim.sched.state(low), Ok(ThreadState::Suspended));
        assert_eq!(sim.sched.semaphore(CM7, sem).map(|s| s.count), Ok(0));
    }

    #[test]
    fn test_acquire_times_out() {
        let mut sim = Sim::new();
        let waiter = sim.spawn(CM7, 4);
        let sem = sim.sched.semaphore_create(CM7, 0, 1, false).unwrap();
        assert_eq!(acquire(&mut sim, CM7, sem, Timeout::ticks(3)), None);
        sim.tick(CM7);
        sim.tick(CM7);
        assert_eq!(sim.running(CM7), sim.idle(CM7));
        sim.tick(CM7);
        assert_eq!(sim.running(CM7), waiter);
        assert_eq!(sim.sched.take_wait_status(CM7), Err(Error::Timeout));
        assert!(sim.sched.semaphores[0].waiters.is_empty());
    }

    #[test]
    fn test_destroy_wakes_waiters_with_invalid_handle() {
        let mut sim = Sim::new();
        let sem = sim.sched.semaphore_create(CM7, 0, 1, false).unwrap();
        let waiter = sim.spawn(CM7, 6);
        assert_eq!(acquire(&mut sim, CM7, sem, Timeout::FOREVER), None);
        let _other = sim.spawn(CM7, 2);

        let effects = sim.sched.semaphore_destroy(CM7, sem).unwrap();
        sim.run(CM7, effects);
        assert_eq!(sim.running(CM7), waiter);
        assert_eq!(sim.sched.take_wait_status(CM7), Err(Error::InvalidHandle));
        assert_eq!(sim.sched.semaphore_release(CM7, sem), Err(Error::InvalidHandle));
    }

    #[test]
    fn test_destroying_waiter_leaves_queue_clean() {
        let mut sim = Sim::new();
        let sem = sim.sched.semaphore_create(CM7, 0, 2, false).unwrap();
        let waiter = sim.spawn(CM7, 6);
        assert_eq!(acquire(&mut sim, CM7, sem, Timeout::FOREVER), None);
        let _other = sim.spawn(CM7, 2);

        assert_eq!(
            sim.sched.destroy_thread(CM7, waiter),
            Ok(crate::scheduler::Destroy::Done(None, Effects::NONE))
        );
        assert!(sim.sched.semaphores[0].waiters.is_empty());
        release(&mut sim, CM7, sem).unwrap();
        assert_eq!(sim.sched.semaphore(CM7, sem).map(|s| s.count), Ok(1));
    }

    #[test]
    fn test_shared_release_wakes_waiter_on_other_core() {
        let mut sim = Sim::new();
        let sem = sim.sched.semaphore_create(CM4, 0, 1, true).unwrap();
        let waiter = sim.spawn(CM4, 5);
        assert_eq!(acquire(&mut sim, CM4, sem, Timeout::FOREVER), None);
        assert_eq!(sim.running(CM4), sim.idle(CM4));

        let _producer = sim.spawn(CM7, 5);
        let effects = sim.sched.semaphore_release(CM7, sem).unwrap();
        assert!(effects.notify_peer);
        assert!(!effects.reschedule);
        sim.run(CM7, effects);
        assert_eq!(sim.running(CM4), waiter);
        assert_eq!(sim.sched.take_wait_status(CM4), Ok(()));
    }

    #[test]
    fn test_handles_are_not_reused() {
        let mut sched = Scheduler::new();
        let first = sched.semaphore_create(CM7, 0, 1, false).unwrap();
        sched.semaphore_destroy(CM7, first).unwrap();
        let second = sched.semaphore_create(CM7, 0, 1, false).unwrap();
        assert_ne!(first, second);
        assert_eq!(sched.semaphore_slot(first), Err(Error::InvalidHandle));
        assert_eq!(sched.semaphore_slot(Semaphore::INVALID), Err(Error::InvalidHandle));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Spawn(u8),
        Acquire(u32),
        Release,
        Tick,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (1u8..=12).prop_map(Op::Spawn),
            (0u32..4).prop_map(Op::Acquire),
            Just(Op::Release),
            Just(Op::Tick),
        ]
    }

    proptest! {
        #[test]
        fn prop_tokens_are_conserved(
            initial in 0u32..4,
            extra in 0u32..4,
            ops in proptest::collection::vec(op(), 1..80),
        ) {
            let max = (initial + extra).max(1);
            let mut sim = Sim::new();
            let sem = sim.sched.semaphore_create(CM7, initial, max, false).unwrap();
            let mut taken = 0u32;
            let mut released = 0u32;
            let mut spawned = 0;
            for op in ops {
                match op {
                    Op::Spawn(p) => {
                        if spawned < 8 {
                            sim.spawn(CM7, p);
                            spawned += 1;
                        }
                    }
                    Op::Acquire(t) => {
                        if sim.running(CM7) != sim.idle(CM7) {
                            // Zero polls, anything else waits that many ticks.
                            let timeout = if t == 0 { Timeout::POLL } else { Timeout::ticks(t) };
                            if acquire(&mut sim, CM7, sem, timeout) == Some(Ok(())) {
                                taken += 1;
                            }
                        }
                    }
                    Op::Release => {
                        let handoff = !sim.sched.semaphores[0].waiters.is_empty();
                        if release(&mut sim, CM7, sem).is_ok() {
                            released += 1;
                            if handoff {
                                taken += 1;
                            }
                        }
                    }
                    Op::Tick => sim.tick(CM7),
                }
                let cb = &sim.sched.semaphores[0];
                prop_assert!(cb.count <= cb.max);
                prop_assert_eq!(cb.count + taken, initial + released);
                prop_assert!(cb.waiters.is_empty() || cb.count == 0);
            }
        }
    }
}

//! # Scheduler
//!
//! The shared kernel state and every transition of the thread state machine.
//! One `Scheduler` lives in memory both cores can see and is only touched
//! through `sync::GateCell::with`, so every method here runs with the kernel
//! gate held and interrupts masked.
//!
//! ## Scheduling rules
//!
//! - Strict priority; 31 is the most urgent, 0 belongs to the idle thread.
//! - FIFO within a priority level. No time-slicing: equal-priority threads
//!   hand over only at yield, block or exit.
//! - A preempted thread returns to the head of its level; a yielding thread
//!   goes to the tail.
//! - Each core schedules only its own threads. Changes to a thread owned by
//!   the other core are posted to that core's inbox and the core is
//!   interrupted to apply them.
//!
//! Methods never raise interrupts themselves. They return [`Effects`]
//! describing the switch requests and peer interrupts the caller must raise
//! once the gate is released. The only register access from here is the
//! HSEM slot of a user mutex, taken and released on the executing core.

use core::ops::BitOrAssign;

use heapless::Deque;

use crate::config::{INBOX_DEPTH, MAX_FLAGS, MAX_PRIORITY, MAX_SEMAPHORES, MAX_THREADS, NUM_CORES, PRIORITY_LEVELS};
use crate::cpu::CoreId;
use crate::error::{Error, Fault, Result};
use crate::fault::{self, ThreadFault};
use crate::flag::FlagCb;
use crate::hsem::{Slot, SlotAllocator, NUM_SLOTS};
use crate::mutex::MutexCb;
use crate::semaphore::SemaphoreCb;
use crate::thread::{self, Life, Remote, StackRegion, Tcb, Thread, ThreadEntry, ThreadState, Wait, THREAD_MIN_STACK_SIZE};
use crate::timer::{DeadlineHeap, Timeout};

/// Priority of each core's idle thread.
pub const IDLE_PRIORITY: u8 = 0;

// ---------------------------------------------------------------------------
// Effects
// ---------------------------------------------------------------------------

/// Hardware actions owed after a state change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[must_use = "effects must be applied once the kernel gate is released"]
pub struct Effects {
    /// Pend a context switch on the calling core.
    pub reschedule: bool,
    /// Interrupt the other core so it drains its inbox.
    pub notify_peer: bool,
}

impl Effects {
    pub const NONE: Effects = Effects { reschedule: false, notify_peer: false };
    pub const RESCHEDULE: Effects = Effects { reschedule: true, notify_peer: false };
    pub const NOTIFY_PEER: Effects = Effects { reschedule: false, notify_peer: true };
}

impl BitOrAssign for Effects {
    fn bitor_assign(&mut self, rhs: Effects) {
        self.reschedule |= rhs.reschedule;
        self.notify_peer |= rhs.notify_peer;
    }
}

/// Result of a context switch decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Switch {
    /// Stack pointer to restore.
    pub sp: usize,
    pub thread: Thread,
    /// Fault detected on the outgoing thread, to report once the gate is
    /// released.
    pub fault: Option<(Thread, ThreadFault)>,
    /// Tearing down the faulted thread woke a waiter on the other core.
    pub notify_peer: bool,
}

/// Outcome of a destroy request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destroy {
    /// The slot is free. Carries the kernel-heap block to release, if any,
    /// and the effects of handing over mutexes the thread still held.
    Done(Option<usize>, Effects),
    /// The thread still runs somewhere; a stop was requested.
    Pending(Effects),
}

// ---------------------------------------------------------------------------
// Ready queues
// ---------------------------------------------------------------------------

/// One intrusive FIFO per priority level plus a bitmap of non-empty levels.
///
/// Suspended threads keep their place in the queue and are skipped when
/// picking, so resuming one restores its original position.
pub struct ReadyQueues {
    head: [Option<u16>; PRIORITY_LEVELS],
    tail: [Option<u16>; PRIORITY_LEVELS],
    nonempty: u32,
}

impl ReadyQueues {
    pub const fn new() -> Self {
        ReadyQueues {
            head: [None; PRIORITY_LEVELS],
            tail: [None; PRIORITY_LEVELS],
            nonempty: 0,
        }
    }

    pub fn push_back(&mut self, threads: &mut [Tcb], slot: usize) {
        let level = threads[slot].priority;
        let l = level as usize;
        let tcb = &mut threads[slot];
        tcb.queued = Some(level);
        tcb.next = None;
        tcb.prev = self.tail[l];
        match self.tail[l] {
            Some(tail) => threads[tail as usize].next = Some(slot as u16),
            None => self.head[l] = Some(slot as u16),
        }
        self.tail[l] = Some(slot as u16);
        self.nonempty |= 1 << l;
    }

    pub fn push_front(&mut self, threads: &mut [Tcb], slot: usize) {
        let level = threads[slot].priority;
        let l = level as usize;
        let tcb = &mut threads[slot];
        tcb.queued = Some(level);
        tcb.prev = None;
        tcb.next = self.head[l];
        match self.head[l] {
            Some(head) => threads[head as usize].prev = Some(slot as u16),
            None => self.tail[l] = Some(slot as u16),
        }
        self.head[l] = Some(slot as u16);
        self.nonempty |= 1 << l;
    }

    pub fn remove(&mut self, threads: &mut [Tcb], slot: usize) -> bool {
        let Some(level) = threads[slot].queued.take() else {
            return false;
        };
        let l = level as usize;
        let prev = threads[slot].prev.take();
        let next = threads[slot].next.take();
        match prev {
            Some(p) => threads[p as usize].next = next,
            None => self.head[l] = next,
        }
        match next {
            Some(n) => threads[n as usize].prev = prev,
            None => self.tail[l] = prev,
        }
        if self.head[l].is_none() {
            self.nonempty &= !(1 << l);
        }
        true
    }

    /// First runnable thread of the highest non-empty level.
    pub fn first_ready(&self, threads: &[Tcb]) -> Option<usize> {
        let mut levels = self.nonempty;
        while levels != 0 {
            let l = 31 - levels.leading_zeros() as usize;
            let mut cursor = self.head[l];
            while let Some(at) = cursor {
                let at = at as usize;
                if threads[at].is_runnable() {
                    return Some(at);
                }
                cursor = threads[at].next;
            }
            levels &= !(1 << l);
        }
        None
    }

    /// Threads queued at `level`, head first.
    #[cfg(test)]
    pub fn level<'a>(&self, threads: &'a [Tcb], level: u8) -> impl Iterator<Item = usize> + 'a {
        let mut cursor = self.head[level as usize];
        core::iter::from_fn(move || {
            let at = cursor? as usize;
            cursor = threads[at].next;
            Some(at)
        })
    }
}

impl Default for ReadyQueues {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Per-core state
// ---------------------------------------------------------------------------

/// Request for the core that owns `slot`. Stale requests (the thread was
/// destroyed meanwhile) are recognised by the id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteOp {
    pub slot: u16,
    pub id: u32,
}

pub struct CoreState {
    pub running: Option<u16>,
    pub idle: Option<u16>,
    pub ready: ReadyQueues,
    pub ticks: u64,
    pub deadlines: DeadlineHeap,
    pub inbox: Deque<RemoteOp, INBOX_DEPTH>,
    pub started: bool,
}

impl CoreState {
    pub const NEW: CoreState = CoreState {
        running: None,
        idle: None,
        ready: ReadyQueues::new(),
        ticks: 0,
        deadlines: DeadlineHeap::new(),
        inbox: Deque::new(),
        started: false,
    };
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

#[repr(C)]
pub struct Scheduler {
    pub(crate) threads: [Tcb; MAX_THREADS],
    pub(crate) semaphores: [SemaphoreCb; MAX_SEMAPHORES],
    pub(crate) flags: [FlagCb; MAX_FLAGS],
    /// User mutexes, indexed by HSEM slot.
    pub(crate) mutexes: [MutexCb; NUM_SLOTS],
    pub(crate) cores: [CoreState; NUM_CORES],
    pub(crate) hsem_slots: SlotAllocator,
    next_id: u32,
}

impl Scheduler {
    pub const fn new() -> Self {
        Scheduler {
            threads: [Tcb::EMPTY; MAX_THREADS],
            semaphores: [SemaphoreCb::EMPTY; MAX_SEMAPHORES],
            flags: [FlagCb::EMPTY; MAX_FLAGS],
            mutexes: [MutexCb::EMPTY; NUM_SLOTS],
            cores: [CoreState::NEW; NUM_CORES],
            hsem_slots: SlotAllocator::new(),
            next_id: 1,
        }
    }

    /// Next object id. Shared by threads, semaphores and flags.
    pub(crate) fn alloc_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id = self.next_id.checked_add(1).unwrap_or(1);
        id
    }

    pub(crate) fn lookup(&self, thread: Thread) -> Result<usize> {
        let slot = thread.slot();
        if thread.is_invalid() || slot >= MAX_THREADS || self.threads[slot].id != thread.id() {
            return Err(Error::InvalidHandle);
        }
        Ok(slot)
    }

    pub fn is_valid(&self, thread: Thread) -> bool {
        self.lookup(thread).is_ok()
    }

    pub(crate) fn handle(&self, slot: usize) -> Thread {
        self.threads[slot].handle(slot)
    }

    fn is_idle(&self, slot: usize) -> bool {
        let tcb = &self.threads[slot];
        self.cores[tcb.core.index()].idle == Some(slot as u16)
    }

    fn is_running(&self, slot: usize) -> bool {
        self.cores.iter().any(|c| c.running == Some(slot as u16))
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    fn spawn(&mut self, core: CoreId, mem: StackRegion, entry: ThreadEntry, arg: usize, priority: u8) -> Result<usize> {
        let slot = self.threads.iter().position(Tcb::is_free).ok_or(Error::NoMemory)?;
        let id = self.alloc_id();
        // SAFETY: callers hand over `mem` under the `StackRegion` contract.
        unsafe {
            self.threads[slot].init(id, core, priority, mem, entry, arg, crate::kernel::exit_trampoline);
        }
        Ok(slot)
    }

    /// Create a thread owned by `core` and make it ready.
    pub fn create_thread(
        &mut self,
        core: CoreId,
        mem: StackRegion,
        stack_size: usize,
        entry: ThreadEntry,
        arg: usize,
        priority: u8,
        heap_owned: bool,
    ) -> Result<(Thread, Effects)> {
        if priority == IDLE_PRIORITY || priority > MAX_PRIORITY || stack_size < THREAD_MIN_STACK_SIZE {
            return Err(Error::InvalidArg);
        }
        thread::validate_mem(mem.base(), mem.len(), stack_size)?;
        // The stack ends where the requested size does, not where `mem` does.
        let mem = mem.truncate(thread::thread_mem_size(stack_size));
        let slot = self.spawn(core, mem, entry, arg, priority)?;
        self.threads[slot].heap_owned = heap_owned;
        log::debug!("thread {} created on {:?} at priority {}", self.threads[slot].id, core, priority);
        let effects = self.sync_local(slot);
        Ok((self.handle(slot), effects))
    }

    /// Create the idle thread of `core`. It never blocks, so the core always
    /// has something to run.
    pub fn create_idle(&mut self, core: CoreId, mem: StackRegion, entry: ThreadEntry) -> Result<Thread> {
        if self.cores[core.index()].idle.is_some() {
            return Err(Error::NotPermitted);
        }
        let stack_size = mem.len().saturating_sub(thread::GUARD_SIZE);
        thread::validate_mem(mem.base(), mem.len(), stack_size.max(THREAD_MIN_STACK_SIZE))?;
        let slot = self.spawn(core, mem, entry, 0, IDLE_PRIORITY)?;
        self.cores[core.index()].idle = Some(slot as u16);
        self.cores[core.index()].ready.push_back(&mut self.threads, slot);
        Ok(self.handle(slot))
    }

    /// Allow `core` to switch. The first switch picks the initial thread.
    pub fn start_core(&mut self, core: CoreId) -> Effects {
        self.cores[core.index()].started = true;
        Effects::RESCHEDULE
    }

    /// Destroy `thread` on behalf of `core`.
    ///
    /// A thread that is still running, or live on the other core, is asked
    /// to stop first and the caller retries until `Destroy::Done`.
    pub fn destroy_thread(&mut self, core: CoreId, thread: Thread) -> Result<Destroy> {
        let slot = self.lookup(thread)?;
        if self.is_idle(slot) {
            return Err(Error::NotPermitted);
        }
        let owner = self.threads[slot].core;
        let running = self.is_running(slot);
        if !running && (owner == core || self.threads[slot].is_terminal()) {
            let (mem, effects) = self.reap(slot);
            return Ok(Destroy::Done(mem, effects));
        }
        let effects = if owner == core {
            self.stop_local(slot)
        } else {
            self.post(owner, slot, Remote::Stop)
        };
        Ok(Destroy::Pending(effects))
    }

    fn reap(&mut self, slot: usize) -> (Option<usize>, Effects) {
        let effects = self.detach(slot);
        let owner = self.threads[slot].core;
        self.purge_inbox(owner, slot);
        let tcb = &mut self.threads[slot];
        let mem = tcb.heap_owned.then_some(tcb.mem_base);
        log::debug!("thread {} destroyed", tcb.id);
        *tcb = Tcb::EMPTY;
        (mem, effects)
    }

    /// Stop the running thread of `core`.
    pub fn exit_current(&mut self, core: CoreId) -> Result<Effects> {
        let slot = self.cores[core.index()].running.ok_or(Error::NotPermitted)? as usize;
        if self.is_idle(slot) {
            return Err(Error::NotPermitted);
        }
        let mut effects = self.detach(slot);
        self.threads[slot].life = Life::Stopped;
        log::debug!("thread {} exited", self.threads[slot].id);
        effects |= Effects::RESCHEDULE;
        Ok(effects)
    }

    fn stop_local(&mut self, slot: usize) -> Effects {
        if self.threads[slot].is_terminal() {
            return Effects::NONE;
        }
        let mut effects = self.detach(slot);
        self.threads[slot].life = Life::Stopped;
        log::debug!("thread {} stopped", self.threads[slot].id);
        effects |= self.sync_local(slot);
        effects
    }

    /// Unlink `slot` from every queue and timer and give up the mutexes it
    /// holds. Runs on the thread's own core whenever the thread is live.
    fn detach(&mut self, slot: usize) -> Effects {
        let owner = self.threads[slot].core.index();
        self.cores[owner].ready.remove(&mut self.threads, slot);
        self.cores[owner].deadlines.cancel(slot);
        self.unwait(slot);
        self.abandon_mutexes(slot)
    }

    /// Take `slot` off whatever wait queue holds it.
    fn unwait(&mut self, slot: usize) {
        match self.threads[slot].wait.take() {
            Some(Wait::Semaphore(s)) => {
                self.semaphores[s as usize].waiters.remove(&mut self.threads, slot);
            }
            Some(Wait::Flag { slot: f, state }) => {
                self.flags[f as usize].waiters_mut(state).remove(&mut self.threads, slot);
            }
            Some(Wait::HwMutex(m)) => {
                self.mutexes[m as usize].waiters.remove(&mut self.threads, slot);
            }
            Some(Wait::Sleep) | None => {}
        }
    }

    pub fn suspend(&mut self, core: CoreId, thread: Thread) -> Result<Effects> {
        let slot = self.lookup(thread)?;
        if self.threads[slot].is_terminal() || self.is_idle(slot) {
            return Err(Error::NotPermitted);
        }
        if self.threads[slot].suspended {
            return Ok(Effects::NONE);
        }
        self.threads[slot].suspended = true;
        let owner = self.threads[slot].core;
        if owner == core {
            Ok(self.sync_local(slot))
        } else if self.cores[owner.index()].running == Some(slot as u16) {
            Ok(self.post(owner, slot, Remote::Sync))
        } else {
            Ok(Effects::NONE)
        }
    }

    pub fn resume(&mut self, core: CoreId, thread: Thread) -> Result<Effects> {
        let slot = self.lookup(thread)?;
        if self.threads[slot].is_terminal() {
            return Err(Error::NotPermitted);
        }
        if !self.threads[slot].suspended {
            return Ok(Effects::NONE);
        }
        self.threads[slot].suspended = false;
        Ok(self.make_ready(core, slot))
    }

    pub fn set_priority(&mut self, core: CoreId, thread: Thread, priority: u8) -> Result<Effects> {
        if priority == IDLE_PRIORITY || priority > MAX_PRIORITY {
            return Err(Error::InvalidArg);
        }
        let slot = self.lookup(thread)?;
        if self.threads[slot].is_terminal() || self.is_idle(slot) {
            return Err(Error::NotPermitted);
        }
        self.threads[slot].priority = priority;
        match self.threads[slot].wait {
            Some(Wait::Semaphore(s)) => {
                let waiters = &mut self.semaphores[s as usize].waiters;
                waiters.remove(&mut self.threads, slot);
                waiters.push(&mut self.threads, slot);
            }
            Some(Wait::Flag { slot: f, state }) => {
                let waiters = self.flags[f as usize].waiters_mut(state);
                waiters.remove(&mut self.threads, slot);
                waiters.push(&mut self.threads, slot);
            }
            Some(Wait::HwMutex(m)) => {
                let waiters = &mut self.mutexes[m as usize].waiters;
                waiters.remove(&mut self.threads, slot);
                waiters.push(&mut self.threads, slot);
            }
            Some(Wait::Sleep) | None => {}
        }
        Ok(self.make_ready(core, slot))
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn priority(&self, thread: Thread) -> Result<u8> {
        Ok(self.threads[self.lookup(thread)?].priority)
    }

    /// State as seen from outside any section.
    pub fn state(&self, thread: Thread) -> Result<ThreadState> {
        let slot = self.lookup(thread)?;
        let tcb = &self.threads[slot];
        Ok(match tcb.life {
            Life::Stopped => ThreadState::Stopped,
            Life::Overflow => ThreadState::Overflow,
            Life::Live if self.is_running(slot) => ThreadState::Running,
            Life::Live if tcb.suspended || tcb.wait.is_some() => ThreadState::Suspended,
            Life::Live => ThreadState::Ready,
        })
    }

    pub fn stack_size(&self, thread: Thread) -> Result<usize> {
        Ok(self.threads[self.lookup(thread)?].stack_size())
    }

    pub fn stack_usage(&self, thread: Thread) -> Result<usize> {
        Ok(self.threads[self.lookup(thread)?].stack_usage())
    }

    pub fn cpu_ticks(&self, thread: Thread) -> Result<u64> {
        Ok(self.threads[self.lookup(thread)?].cpu_ticks)
    }

    pub fn is_overflow(&self, thread: Thread) -> Result<bool> {
        Ok(self.threads[self.lookup(thread)?].life == Life::Overflow)
    }

    pub fn running_thread(&self, core: CoreId) -> Thread {
        match self.cores[core.index()].running {
            Some(slot) => self.handle(slot as usize),
            None => Thread::INVALID,
        }
    }

    pub fn ticks(&self, core: CoreId) -> u64 {
        self.cores[core.index()].ticks
    }

    pub fn thread_count(&self) -> usize {
        self.threads.iter().filter(|t| !t.is_free()).count()
    }

    // -----------------------------------------------------------------------
    // Blocking
    // -----------------------------------------------------------------------

    /// Park the running thread of `core` on `wait`. The caller has already
    /// linked it into the primitive's wait queue, if any.
    pub(crate) fn block_current(&mut self, core: CoreId, wait: Wait, timeout: Timeout) -> Result<Effects> {
        let now = self.cores[core.index()].ticks;
        self.block_until(core, wait, timeout.deadline(now))
    }

    /// Park the running thread of `core` until the tick count of `core`
    /// reaches `deadline`, or indefinitely with `None`.
    fn block_until(&mut self, core: CoreId, wait: Wait, deadline: Option<u64>) -> Result<Effects> {
        let cs = &mut self.cores[core.index()];
        let slot = cs.running.ok_or(Error::NotPermitted)? as usize;
        let tcb = &mut self.threads[slot];
        tcb.wait = Some(wait);
        tcb.wake_status = Ok(());
        if let Some(deadline) = deadline {
            cs.deadlines.insert(slot, deadline);
        }
        Ok(Effects::RESCHEDULE)
    }

    /// The running thread of `core` as a slot, for primitives about to block.
    pub(crate) fn current_slot(&self, core: CoreId) -> Result<usize> {
        self.cores[core.index()].running.map(usize::from).ok_or(Error::NotPermitted)
    }

    /// Outcome of the last wait of the running thread of `core`.
    pub fn take_wait_status(&mut self, core: CoreId) -> Result<()> {
        let slot = self.current_slot(core)?;
        core::mem::replace(&mut self.threads[slot].wake_status, Ok(()))
    }

    /// End the wait of `slot` (already off its wait queue) with `status`.
    pub(crate) fn wake(&mut self, core: CoreId, slot: usize, status: Result<()>) -> Effects {
        let tcb = &mut self.threads[slot];
        tcb.wait = None;
        tcb.wake_status = status;
        let owner = tcb.core.index();
        self.cores[owner].deadlines.cancel(slot);
        self.make_ready(core, slot)
    }

    /// Put the running thread of `core` to sleep for `ticks`.
    pub fn sleep(&mut self, core: CoreId, ticks: u32) -> Result<Effects> {
        if ticks == 0 {
            return Ok(self.yield_current(core));
        }
        self.block_current(core, Wait::Sleep, Timeout::ticks(ticks))
    }

    /// Put the running thread of `core` to sleep until the tick count of
    /// `core` reaches `deadline`. A deadline already reached yields.
    pub fn sleep_until(&mut self, core: CoreId, deadline: u64) -> Result<Effects> {
        if deadline <= self.cores[core.index()].ticks {
            return Ok(self.yield_current(core));
        }
        self.block_until(core, Wait::Sleep, Some(deadline))
    }

    pub fn yield_current(&mut self, core: CoreId) -> Effects {
        match self.cores[core.index()].running {
            Some(slot) => {
                self.threads[slot as usize].yielded = true;
                Effects::RESCHEDULE
            }
            None => Effects::NONE,
        }
    }

    // -----------------------------------------------------------------------
    // Cross-core plumbing
    // -----------------------------------------------------------------------

    /// Re-evaluate `slot` after a state change made by `core`.
    pub(crate) fn make_ready(&mut self, core: CoreId, slot: usize) -> Effects {
        let owner = self.threads[slot].core;
        if owner == core {
            self.sync_local(slot)
        } else {
            self.post(owner, slot, Remote::Sync)
        }
    }

    /// Bring a thread's ready-queue membership in line with its state.
    /// Runs on the thread's own core.
    fn sync_local(&mut self, slot: usize) -> Effects {
        let owner = self.threads[slot].core;
        let cs = &mut self.cores[owner.index()];
        if cs.running != Some(slot as u16) {
            let tcb = &self.threads[slot];
            let (queued, terminal, runnable, priority) =
                (tcb.queued, tcb.is_terminal(), tcb.is_runnable(), tcb.priority);
            match queued {
                Some(_) if terminal => {
                    cs.ready.remove(&mut self.threads, slot);
                }
                Some(level) if level != priority => {
                    cs.ready.remove(&mut self.threads, slot);
                    cs.ready.push_back(&mut self.threads, slot);
                }
                None if runnable => cs.ready.push_back(&mut self.threads, slot),
                _ => {}
            }
        }
        if self.needs_switch(owner) {
            Effects::RESCHEDULE
        } else {
            Effects::NONE
        }
    }

    fn needs_switch(&self, core: CoreId) -> bool {
        let cs = &self.cores[core.index()];
        if !cs.started {
            return false;
        }
        let best = cs.ready.first_ready(&self.threads);
        match cs.running {
            None => best.is_some(),
            Some(running) => {
                let running = &self.threads[running as usize];
                !running.is_runnable() || best.is_some_and(|b| self.threads[b].priority > running.priority)
            }
        }
    }

    fn post(&mut self, target: CoreId, slot: usize, kind: Remote) -> Effects {
        let tcb = &mut self.threads[slot];
        let queued = tcb.remote.is_some();
        tcb.remote = match (tcb.remote, kind) {
            (Some(Remote::Stop), _) | (_, Remote::Stop) => Some(Remote::Stop),
            _ => Some(Remote::Sync),
        };
        if !queued {
            let op = RemoteOp { slot: slot as u16, id: tcb.id };
            if self.cores[target.index()].inbox.push_back(op).is_err() {
                fault::system_fault(Fault::TableCorruption);
            }
        }
        log::trace!("posted {:?} for thread {} to {:?}", kind, self.threads[slot].id, target);
        Effects::NOTIFY_PEER
    }

    /// Apply every request the other core left for `core`.
    pub fn service_inbox(&mut self, core: CoreId) -> Effects {
        let mut effects = Effects::NONE;
        while let Some(op) = self.cores[core.index()].inbox.pop_front() {
            let slot = op.slot as usize;
            if self.threads[slot].id != op.id {
                continue;
            }
            match self.threads[slot].remote.take() {
                Some(Remote::Stop) => effects |= self.stop_local(slot),
                Some(Remote::Sync) => effects |= self.sync_local(slot),
                None => {}
            }
        }
        effects
    }

    /// Drop requests queued on `core` for the thread in `slot`, which is
    /// about to be freed. Each live thread then has at most one request in
    /// flight, so the inbox never holds more than `MAX_THREADS` entries.
    fn purge_inbox(&mut self, core: CoreId, slot: usize) {
        let inbox = &mut self.cores[core.index()].inbox;
        let mut kept: Deque<RemoteOp, INBOX_DEPTH> = Deque::new();
        while let Some(op) = inbox.pop_front() {
            if op.slot as usize != slot && kept.push_back(op).is_err() {
                fault::system_fault(Fault::TableCorruption);
            }
        }
        *inbox = kept;
    }

    // -----------------------------------------------------------------------
    // Time
    // -----------------------------------------------------------------------

    /// Advance the tick of `core`, charge the running thread and expire
    /// deadlines.
    pub fn tick(&mut self, core: CoreId) -> Effects {
        let ci = core.index();
        self.cores[ci].ticks += 1;
        let now = self.cores[ci].ticks;
        if let Some(running) = self.cores[ci].running {
            self.threads[running as usize].cpu_ticks += 1;
        }

        let mut effects = Effects::NONE;
        while let Some(slot) = self.cores[ci].deadlines.pop_expired(now) {
            let status = match self.threads[slot].wait {
                Some(Wait::Sleep) => Ok(()),
                Some(_) => Err(Error::Timeout),
                None => continue,
            };
            self.unwait(slot);
            self.threads[slot].wake_status = status;
            effects |= self.sync_local(slot);
        }
        effects
    }

    // -----------------------------------------------------------------------
    // Context switch
    // -----------------------------------------------------------------------

    /// Save the outgoing thread of `core` at `saved_sp` and pick the next.
    pub fn switch(&mut self, core: CoreId, saved_sp: usize) -> core::result::Result<Switch, Fault> {
        let ci = core.index();
        let mut fault = None;
        let mut notify_peer = false;

        if let Some(out) = self.cores[ci].running.take() {
            let out = out as usize;
            let yielded = core::mem::take(&mut self.threads[out].yielded);
            let intact = self.threads[out].record_sp(saved_sp);
            if !intact && self.threads[out].life == Life::Live {
                notify_peer = self.detach(out).notify_peer;
                self.threads[out].life = Life::Overflow;
                log::warn!("thread {} overflowed its stack", self.threads[out].id);
                fault = Some((self.handle(out), ThreadFault::StackOverflow));
            } else if self.threads[out].is_runnable() {
                if yielded {
                    self.cores[ci].ready.push_back(&mut self.threads, out);
                } else {
                    self.cores[ci].ready.push_front(&mut self.threads, out);
                }
            }
        }

        let next = self.cores[ci]
            .ready
            .first_ready(&self.threads)
            .ok_or(Fault::SwitchInconsistency)?;
        self.cores[ci].ready.remove(&mut self.threads, next);
        self.cores[ci].running = Some(next as u16);
        Ok(Switch {
            sp: self.threads[next].saved_sp,
            thread: self.handle(next),
            fault,
            notify_peer,
        })
    }

    // -----------------------------------------------------------------------
    // HSEM slots
    // -----------------------------------------------------------------------

    pub fn claim_hsem_slot(&mut self) -> Result<Slot> {
        let slot = self.hsem_slots.claim().ok_or(Error::NoMemory)?;
        self.mutexes[slot.index()] = MutexCb::EMPTY;
        Ok(slot)
    }

    /// Give back a claimed slot. Refused while a thread holds or waits for
    /// the mutex on it.
    pub fn release_hsem_slot(&mut self, slot: Slot) -> Result<()> {
        if !self.hsem_slots.is_claimed(slot) {
            return Err(Error::InvalidArg);
        }
        let cb = &self.mutexes[slot.index()];
        if cb.owner.is_some() || !cb.waiters.is_empty() {
            return Err(Error::NotPermitted);
        }
        self.hsem_slots.release(slot);
        Ok(())
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Test harness
// ---------------------------------------------------------------------------


#[cfg(test)]
mod tests {
    use super::sim::{Sim, STACK};
    use super::*;
    use proptest::prelude::*;

    const CM7: CoreId = CoreId::Cm7;
    const CM4: CoreId = CoreId::Cm4;

    #[test]
    fn test_idle_runs_when_nothing_else_can() {
        let sim = Sim::new();
        assert_eq!(sim.running(CM7), sim.idle(CM7));
        assert_eq!(sim.running(CM4), sim.idle(CM4));
        assert_eq!(sim.sched.thread_count(), 2);
    }

    #[test]
    fn test_higher_priority_preempts_on_create() {
        let mut sim = Sim::new();
        let low = sim.spawn(CM7, 3);
        assert_eq!(sim.running(CM7), low);
        let high = sim.spawn(CM7, 9);
        assert_eq!(sim.running(CM7), high);
        assert_eq!(sim.sched.state(low), Ok(ThreadState::Ready));
        assert_eq!(sim.sched.state(high), Ok(ThreadState::Running));
        // The other core is untouched.
        assert_eq!(sim.running(CM4), sim.idle(CM4));
    }

    #[test]
    fn test_equal_priority_does_not_preempt() {
        let mut sim = Sim::new();
        let first = sim.spawn(CM7, 5);
        let second = sim.spawn(CM7, 5);
        assert_eq!(sim.running(CM7), first);
        sim.tick(CM7);
        assert_eq!(sim.running(CM7), first);

        let effects = sim.sched.yield_current(CM7);
        sim.run(CM7, effects);
        assert_eq!(sim.running(CM7), second);
    }

    #[test]
    fn test_preempted_thread_resumes_before_its_peers() {
        let mut sim = Sim::new();
        let a = sim.spawn(CM7, 4);
        let b = sim.spawn(CM7, 4);
        assert_eq!(sim.running(CM7), a);
        let high = sim.spawn(CM7, 8);
        assert_eq!(sim.running(CM7), high);
        let effects = sim.sched.exit_current(CM7).unwrap();
        sim.run(CM7, effects);
        assert_eq!(sim.running(CM7), a);
        let _ = b;
    }

    #[test]
    fn test_suspend_keeps_queue_position() {
        let mut sim = Sim::new();
        let a = sim.spawn(CM7, 4);
        let b = sim.spawn(CM7, 4);
        let c = sim.spawn(CM7, 4);
        assert_eq!(sim.running(CM7), a);

        let effects = sim.sched.suspend(CM7, b).unwrap();
        sim.run(CM7, effects);
        assert_eq!(sim.sched.state(b), Ok(ThreadState::Suspended));
        let effects = sim.sched.resume(CM7, b).unwrap();
        sim.run(CM7, effects);

        let order: Vec<_> = sim.sched.cores[0].ready.level(&sim.sched.threads, 4).collect();
        let b_slot = sim.sched.lookup(b).unwrap();
        let c_slot = sim.sched.lookup(c).unwrap();
        assert_eq!(order, vec![b_slot, c_slot]);
    }

    #[test]
    fn test_suspend_running_thread_switches_away() {
        let mut sim = Sim::new();
        let a = sim.spawn(CM7, 6);
        let effects = sim.sched.suspend(CM7, a).unwrap();
        assert!(effects.reschedule);
        sim.run(CM7, effects);
        assert_eq!(sim.running(CM7), sim.idle(CM7));
        assert_eq!(sim.sched.suspend(CM7, a), Ok(Effects::NONE));

        let effects = sim.sched.resume(CM7, a).unwrap();
        sim.run(CM7, effects);
        assert_eq!(sim.running(CM7), a);
    }

    #[test]
    fn test_priority_change_requeues_and_preempts() {
        let mut sim = Sim::new();
        let a = sim.spawn(CM7, 5);
        let b = sim.spawn(CM7, 3);
        assert_eq!(sim.running(CM7), a);

        let effects = sim.sched.set_priority(CM7, b, 7).unwrap();
        sim.run(CM7, effects);
        assert_eq!(sim.running(CM7), b);
        assert_eq!(sim.sched.priority(b), Ok(7));

        let effects = sim.sched.set_priority(CM7, b, 1).unwrap();
        sim.run(CM7, effects);
        assert_eq!(sim.running(CM7), a);

        assert_eq!(sim.sched.set_priority(CM7, b, 0), Err(Error::InvalidArg));
        assert_eq!(sim.sched.set_priority(CM7, b, MAX_PRIORITY + 1), Err(Error::InvalidArg));
        let idle = sim.idle(CM7);
        assert_eq!(sim.sched.set_priority(CM7, idle, 4), Err(Error::NotPermitted));
    }

    #[test]
    fn test_create_validates_arguments() {
        let mut sim = Sim::new();
        let mut mem = crate::thread::Stack::<{ crate::thread::thread_mem_size(STACK) }>::new();
        let region = unsafe { StackRegion::from_raw(mem.0.as_mut_ptr(), mem.0.len()) };
        extern "C" fn body(_: usize) {}
        let create = |sim: &mut Sim, stack, prio| sim.sched.create_thread(CM7, region, stack, body, 0, prio, false).map(|_| ());
        assert_eq!(create(&mut sim, STACK, 0), Err(Error::InvalidArg));
        assert_eq!(create(&mut sim, STACK, MAX_PRIORITY + 1), Err(Error::InvalidArg));
        assert_eq!(create(&mut sim, THREAD_MIN_STACK_SIZE - 8, 3), Err(Error::InvalidArg));
        assert_eq!(create(&mut sim, STACK + 64, 3), Err(Error::InvalidArg));
        assert_eq!(sim.sched.thread_count(), 2);
    }

    #[test]
    fn test_thread_table_exhaustion() {
        let mut sim = Sim::new();
        let mut created = 2;
        while created < MAX_THREADS {
            sim.spawn(CM4, 2);
            created += 1;
        }
        let mut mem = crate::thread::Stack::<{ crate::thread::thread_mem_size(STACK) }>::new();
        let region = unsafe { StackRegion::from_raw(mem.0.as_mut_ptr(), mem.0.len()) };
        extern "C" fn body(_: usize) {}
        let result = sim.sched.create_thread(CM4, region, STACK, body, 0, 2, false);
        assert_eq!(result.map(|_| ()), Err(Error::NoMemory));
    }

    #[test]
    fn test_ids_are_never_reused() {
        let mut sim = Sim::new();
        let a = sim.spawn(CM7, 2);
        let effects = sim.sched.suspend(CM7, a).unwrap();
        sim.run(CM7, effects);
        assert_eq!(sim.sched.destroy_thread(CM7, a), Ok(Destroy::Done(None, Effects::NONE)));
        assert!(!sim.sched.is_valid(a));
        let b = sim.spawn(CM7, 2);
        assert_ne!(a, b);
        assert_eq!(sim.sched.state(a), Err(Error::InvalidHandle));
        assert_eq!(sim.sched.destroy_thread(CM7, a), Err(Error::InvalidHandle));
    }

    #[test]
    fn test_exit_is_terminal_until_destroy() {
        let mut sim = Sim::new();
        let a = sim.spawn(CM7, 5);
        let effects = sim.sched.exit_current(CM7).unwrap();
        sim.run(CM7, effects);
        assert_eq!(sim.sched.state(a), Ok(ThreadState::Stopped));
        assert_eq!(sim.sched.resume(CM7, a), Err(Error::NotPermitted));
        assert_eq!(sim.sched.destroy_thread(CM7, a), Ok(Destroy::Done(None, Effects::NONE)));
    }

    #[test]
    fn test_sleep_wakes_after_exact_ticks() {
        let mut sim = Sim::new();
        let a = sim.spawn(CM7, 5);
        let effects = sim.sched.sleep(CM7, 10).unwrap();
        sim.run(CM7, effects);
        assert_eq!(sim.sched.state(a), Ok(ThreadState::Suspended));
        for _ in 0..9 {
            sim.tick(CM7);
        }
        assert_eq!(sim.running(CM7), sim.idle(CM7));
        sim.tick(CM7);
        assert_eq!(sim.running(CM7), a);
        assert_eq!(sim.sched.take_wait_status(CM7), Ok(()));
        assert_eq!(sim.sched.ticks(CM7), 10);
    }

    #[test]
    fn test_cpu_ticks_charge_running_thread() {
        let mut sim = Sim::new();
        let a = sim.spawn(CM4, 5);
        for _ in 0..7 {
            sim.tick(CM4);
        }
        assert_eq!(sim.sched.cpu_ticks(a), Ok(7));
        assert_eq!(sim.sched.ticks(CM7), 0);
    }

    #[test]
    fn test_stack_overflow_marks_thread_and_reports() {
        let mut sim = Sim::new();
        let a = sim.spawn(CM7, 5);
        let b = sim.spawn(CM7, 4);
        assert_eq!(sim.running(CM7), a);

        unsafe { sim.guard(a).write(0) };
        let effects = sim.sched.yield_current(CM7);
        sim.run(CM7, effects);

        assert_eq!(sim.faults, vec![(a, ThreadFault::StackOverflow)]);
        assert_eq!(sim.sched.state(a), Ok(ThreadState::Overflow));
        assert_eq!(sim.sched.is_overflow(a), Ok(true));
        assert_eq!(sim.running(CM7), b);
        assert_eq!(sim.sched.destroy_thread(CM7, a), Ok(Destroy::Done(None, Effects::NONE)));
    }

    #[test]
    fn test_remote_suspend_and_resume() {
        let mut sim = Sim::new();
        let worker = sim.spawn(CM4, 5);
        assert_eq!(sim.running(CM4), worker);

        let effects = sim.sched.suspend(CM7, worker).unwrap();
        assert!(effects.notify_peer);
        sim.run(CM7, effects);
        assert_eq!(sim.running(CM4), sim.idle(CM4));

        let effects = sim.sched.resume(CM7, worker).unwrap();
        sim.run(CM7, effects);
        assert_eq!(sim.running(CM4), worker);
    }

    #[test]
    fn test_remote_destroy_stops_then_reaps() {
        let mut sim = Sim::new();
        let worker = sim.spawn(CM4, 5);

        let Destroy::Pending(effects) = sim.sched.destroy_thread(CM7, worker).unwrap() else {
            panic!("a running remote thread cannot be reaped immediately");
        };
        assert!(sim.sched.is_valid(worker));
        sim.run(CM7, effects);
        assert_eq!(sim.sched.state(worker), Ok(ThreadState::Stopped));
        assert_eq!(sim.running(CM4), sim.idle(CM4));
        assert_eq!(sim.sched.destroy_thread(CM7, worker), Ok(Destroy::Done(None, Effects::NONE)));
        assert_eq!(sim.sched.thread_count(), 2);
    }

    #[test]
    fn test_idle_cannot_be_destroyed_or_suspended() {
        let mut sim = Sim::new();
        let idle = sim.idle(CM4);
        assert_eq!(sim.sched.destroy_thread(CM4, idle), Err(Error::NotPermitted));
        assert_eq!(sim.sched.suspend(CM4, idle), Err(Error::NotPermitted));
    }

    #[test]
    fn test_stale_inbox_entries_are_skipped() {
        let mut sim = Sim::new();
        let worker = sim.spawn(CM4, 5);
        // The peer interrupt is not delivered before the worker is gone.
        let _undelivered = sim.sched.suspend(CM7, worker).unwrap();
        let effects = sim.sched.exit_current(CM4).unwrap();
        sim.run(CM4, effects);
        assert_eq!(sim.sched.destroy_thread(CM4, worker), Ok(Destroy::Done(None, Effects::NONE)));
        let replacement = sim.spawn(CM4, 5);
        assert_eq!(sim.sched.service_inbox(CM4), Effects::NONE);
        assert_eq!(sim.running(CM4), replacement);
    }

    #[test]
    fn test_sleep_until_wakes_at_the_deadline() {
        let mut sim = Sim::new();
        let a = sim.spawn(CM7, 5);
        sim.tick(CM7);
        sim.tick(CM7);
        let effects = sim.sched.sleep_until(CM7, 6).unwrap();
        sim.run(CM7, effects);
        assert_eq!(sim.sched.state(a), Ok(ThreadState::Suspended));
        for _ in 0..3 {
            sim.tick(CM7);
        }
        assert_eq!(sim.running(CM7), sim.idle(CM7));
        sim.tick(CM7);
        assert_eq!(sim.running(CM7), a);
        assert_eq!(sim.sched.ticks(CM7), 6);
        assert_eq!(sim.sched.take_wait_status(CM7), Ok(()));
    }

    #[test]
    fn test_sleep_until_a_passed_deadline_only_yields() {
        let mut sim = Sim::new();
        let a = sim.spawn(CM7, 5);
        let b = sim.spawn(CM7, 5);
        for _ in 0..4 {
            sim.tick(CM7);
        }
        for deadline in [4, 1, 0] {
            let running = sim.running(CM7);
            let effects = sim.sched.sleep_until(CM7, deadline).unwrap();
            assert_eq!(effects, Effects::RESCHEDULE);
            sim.run(CM7, effects);
            assert_ne!(sim.running(CM7), running);
            assert_eq!(sim.sched.state(running), Ok(ThreadState::Ready));
        }
        assert!(sim.sched.cores[CM7.index()].deadlines.is_empty());
        assert!([a, b].contains(&sim.running(CM7)));
    }

    #[test]
    fn test_thread_stack_is_the_requested_size() {
        extern "C" fn entry(_: usize) {}
        let mut sim = Sim::new();
        let big: &'static mut thread::Stack<{ thread::thread_mem_size(4 * STACK) }> =
            Box::leak(Box::new(thread::Stack::new()));
        let mem = unsafe { StackRegion::from_raw(big.0.as_mut_ptr(), big.0.len()) };
        let (t, effects) = sim.sched.create_thread(CM7, mem, STACK, entry, 0, 5, false).unwrap();
        sim.run(CM7, effects);
        assert_eq!(sim.sched.stack_size(t), Ok(STACK));
        assert!(sim.sched.stack_usage(t).unwrap() <= STACK);
    }

    #[test]
    fn test_reaping_drops_requests_left_in_the_inbox() {
        let mut sim = Sim::new();
        // Each round strands one request for a thread that is then reaped.
        for _ in 0..INBOX_DEPTH + 4 {
            let worker = sim.spawn(CM4, 5);
            let _undelivered = sim.sched.suspend(CM7, worker).unwrap();
            let effects = sim.sched.exit_current(CM4).unwrap();
            sim.run(CM4, effects);
            assert_eq!(sim.sched.destroy_thread(CM4, worker), Ok(Destroy::Done(None, Effects::NONE)));
            assert!(sim.sched.cores[CM4.index()].inbox.is_empty());
        }
        assert!(sim.faults.is_empty());
        assert_eq!(sim.sched.thread_count(), 2);
    }

    #[test]
    fn test_hsem_slot_table() {
        let mut sched = Scheduler::new();
        let slot = sched.claim_hsem_slot().unwrap();
        assert_ne!(slot, Slot::KERNEL_GATE);
        assert_eq!(sched.release_hsem_slot(slot), Ok(()));
        assert_eq!(sched.release_hsem_slot(slot), Err(Error::InvalidArg));
        assert_eq!(sched.release_hsem_slot(Slot::KERNEL_GATE), Err(Error::InvalidArg));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Spawn(u8),
        Suspend(usize),
        Resume(usize),
        Priority(usize, u8),
        Yield,
        Sleep(u32),
        Tick,
        Exit,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (1u8..=MAX_PRIORITY).prop_map(Op::Spawn),
            (0usize..8).prop_map(Op::Suspend),
            (0usize..8).prop_map(Op::Resume),
            ((0usize..8), (1u8..=MAX_PRIORITY)).prop_map(|(t, p)| Op::Priority(t, p)),
            Just(Op::Yield),
            (1u32..5).prop_map(Op::Sleep),
            Just(Op::Tick),
            Just(Op::Exit),
        ]
    }

    proptest! {
        #[test]
        fn prop_running_thread_outranks_ready_threads(ops in proptest::collection::vec(op(), 1..60)) {
            let mut sim = Sim::new();
            let mut threads: Vec<Thread> = Vec::new();
            fn pick(threads: &[Thread], i: usize) -> Option<Thread> {
                threads.get(i % threads.len().max(1)).copied()
            }
            for op in ops {
                let core = CM7;
                let effects = match op {
                    Op::Spawn(p) => {
                        if sim.sched.thread_count() < MAX_THREADS {
                            threads.push(sim.spawn(core, p));
                        }
                        Effects::NONE
                    }
                    Op::Suspend(i) => pick(&threads, i).and_then(|t| sim.sched.suspend(core, t).ok()).unwrap_or_default(),
                    Op::Resume(i) => pick(&threads, i).and_then(|t| sim.sched.resume(core, t).ok()).unwrap_or_default(),
                    Op::Priority(i, p) => pick(&threads, i).and_then(|t| sim.sched.set_priority(core, t, p).ok()).unwrap_or_default(),
                    Op::Yield => sim.sched.yield_current(core),
                    Op::Sleep(n) => {
                        if sim.running(core) != sim.idle(core) {
                            sim.sched.sleep(core, n).unwrap_or_default()
                        } else {
                            Effects::NONE
                        }
                    }
                    Op::Tick => sim.sched.tick(core),
                    Op::Exit => sim.sched.exit_current(core).unwrap_or_default(),
                };
                sim.run(core, effects);

                let running = sim.running(core);
                let slot = sim.sched.lookup(running).unwrap();
                let tcb = &sim.sched.threads[slot];
                prop_assert!(tcb.is_runnable());
                prop_assert!(tcb.queued.is_none());
                prop_assert!(tcb.wait.is_none());
                if let Some(best) = sim.best_ready(core) {
                    prop_assert!(tcb.priority >= best);
                }
                let running_count = threads
                    .iter()
                    .filter(|&&t| sim.sched.state(t) == Ok(ThreadState::Running))
                    .count();
                prop_assert!(running_count <= 1);
            }
        }
    }
}

//! Timeouts and the per-core deadline heap.

use crate::config::MAX_THREADS;

/// How long a blocking call may wait, in ticks.
///
/// ```ignore
/// sem.acquire(Timeout::POLL)?;       // never wait
/// sem.acquire(Timeout::ticks(25))?;  // wait up to 25 ticks
/// sem.acquire(Timeout::FOREVER)?;    // wait until released
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeout(i64);

impl Timeout {
    pub const POLL: Timeout = Timeout(0);
    pub const FOREVER: Timeout = Timeout(-1);

    pub const fn ticks(n: u32) -> Timeout {
        Timeout(n as i64)
    }

    /// Raw encoding: 0 polls, negative waits forever.
    pub const fn from_raw(raw: i64) -> Timeout {
        Timeout(raw)
    }

    pub const fn is_poll(self) -> bool {
        self.0 == 0
    }

    pub const fn is_forever(self) -> bool {
        self.0 < 0
    }

    /// Absolute tick at which a wait starting at `now` expires.
    pub fn deadline(self, now: u64) -> Option<u64> {
        if self.is_forever() {
            None
        } else {
            Some(now.saturating_add(self.0 as u64))
        }
    }

    /// What is left of this timeout at `now` given its deadline.
    pub fn remaining(deadline: Option<u64>, now: u64) -> Timeout {
        match deadline {
            None => Timeout::FOREVER,
            Some(at) => Timeout(at.saturating_sub(now) as i64),
        }
    }
}

const NOT_QUEUED: u16 = u16::MAX;

#[derive(Debug, Clone, Copy)]
struct Entry {
    deadline: u64,
    seq: u32,
    slot: u16,
}

impl Entry {
    const EMPTY: Entry = Entry { deadline: 0, seq: 0, slot: 0 };

    fn key(&self) -> (u64, u32) {
        (self.deadline, self.seq)
    }
}

/// Indexed binary min-heap of thread deadlines, one entry per thread slot.
///
/// Equal deadlines pop in insertion order. Insert, pop and cancel are all
/// O(log n).
pub struct DeadlineHeap {
    heap: [Entry; MAX_THREADS],
    pos: [u16; MAX_THREADS],
    len: usize,
    seq: u32,
}

impl DeadlineHeap {
    pub const fn new() -> Self {
        DeadlineHeap {
            heap: [Entry::EMPTY; MAX_THREADS],
            pos: [NOT_QUEUED; MAX_THREADS],
            len: 0,
            seq: 0,
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.len
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[cfg(test)]
    fn contains(&self, slot: usize) -> bool {
        self.pos[slot] != NOT_QUEUED
    }

    /// Arm a deadline for `slot`, replacing any earlier one.
    pub fn insert(&mut self, slot: usize, deadline: u64) {
        self.cancel(slot);
        let at = self.len;
        self.heap[at] = Entry {
            deadline,
            seq: self.seq,
            slot: slot as u16,
        };
        self.seq = self.seq.wrapping_add(1);
        self.pos[slot] = at as u16;
        self.len += 1;
        self.sift_up(at);
    }

    pub fn cancel(&mut self, slot: usize) -> bool {
        let at = self.pos[slot];
        if at == NOT_QUEUED {
            return false;
        }
        self.remove_at(at as usize);
        true
    }

    #[cfg(test)]
    fn peek(&self) -> Option<u64> {
        (self.len > 0).then(|| self.heap[0].deadline)
    }

    /// Pop the earliest slot whose deadline is at or before `now`.
    pub fn pop_expired(&mut self, now: u64) -> Option<usize> {
        if self.len == 0 || self.heap[0].deadline > now {
            return None;
        }
        let slot = self.heap[0].slot as usize;
        self.remove_at(0);
        Some(slot)
    }

    fn remove_at(&mut self, at: usize) {
        let slot = self.heap[at].slot as usize;
        self.pos[slot] = NOT_QUEUED;
        self.len -= 1;
        if at == self.len {
            return;
        }
        self.heap[at] = self.heap[self.len];
        self.pos[self.heap[at].slot as usize] = at as u16;
        let at = self.sift_up(at);
        self.sift_down(at);
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.heap.swap(a, b);
        self.pos[self.heap[a].slot as usize] = a as u16;
        self.pos[self.heap[b].slot as usize] = b as u16;
    }

    fn sift_up(&mut self, mut at: usize) -> usize {
        while at > 0 {
            let parent = (at - 1) / 2;
            if self.heap[at].key() >= self.heap[parent].key() {
                break;
            }
            self.swap(at, parent);
            at = parent;
        }
        at
    }

    fn sift_down(&mut self, mut at: usize) {
        loop {
            let left = 2 * at + 1;
            let right = left + 1;
            let mut least = at;
            if left < self.len && self.heap[left].key() < self.heap[least].key() {
                least = left;
            }
            if right < self.len && self.heap[right].key() < self.heap[least].key() {
                least = right;
            }
            if least == at {
                return;
            }
            self.swap(at, least);
            at = least;
        }
    }
}

impl Default for DeadlineHeap {
    fn default() -> Self {
        Self::new()
    }
}

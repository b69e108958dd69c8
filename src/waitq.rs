//! Priority-ordered wait queues.
//!
//! Threads are linked through `Tcb::wait_next`, so a queue is a single head
//! index and never allocates. Higher priorities sit nearer the head; equal
//! priorities keep arrival order.

use crate::thread::Tcb;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WaitQueue {
    head: Option<u16>,
}

impl WaitQueue {
    pub const fn new() -> Self {
        WaitQueue { head: None }
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub fn push(&mut self, threads: &mut [Tcb], slot: usize) {
        let priority = threads[slot].priority;
        let mut prev: Option<usize> = None;
        let mut cursor = self.head;
        while let Some(at) = cursor {
            if threads[at as usize].priority < priority {
                break;
            }
            prev = Some(at as usize);
            cursor = threads[at as usize].wait_next;
        }
        threads[slot].wait_next = cursor;
        match prev {
            Some(p) => threads[p].wait_next = Some(slot as u16),
            None => self.head = Some(slot as u16),
        }
    }

    pub fn pop(&mut self, threads: &mut [Tcb]) -> Option<usize> {
        let slot = self.head? as usize;
        self.head = threads[slot].wait_next.take();
        Some(slot)
    }

    pub fn remove(&mut self, threads: &mut [Tcb], slot: usize) -> bool {
        let mut prev: Option<usize> = None;
        let mut cursor = self.head;
        while let Some(at) = cursor {
            let at = at as usize;
            if at == slot {
                let next = threads[at].wait_next.take();
                match prev {
                    Some(p) => threads[p].wait_next = next,
                    None => self.head = next,
                }
                return true;
            }
            prev = Some(at);
            cursor = threads[at].wait_next;
        }
        false
    }

    pub fn iter<'a>(&self, threads: &'a [Tcb]) -> impl Iterator<Item = usize> + 'a {
        let mut cursor = self.head;
        core::iter::from_fn(move || {
            let at = cursor? as usize;
            cursor = threads[at].wait_next;
            Some(at)
        })
    }
}

//! Single-threaded timer queue.
//!
//! A min-heap of expiries over boxed callbacks. [`Timer`] handles own their
//! entry: dropping the handle cancels the timer before its callback can run,
//! and `reset` re-arms it relative to now. Callbacks receive a `&mut C`
//! context and may create, reset or cancel timers (including the one that is
//! firing) reentrantly; the heap keeps stale entries and skips them by
//! generation on pop.

use std::cell::RefCell;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

struct Entry<C> {
    expiry: Instant,
    duration: Duration,
    epoch: u64,
    armed: bool,
    callback: Option<Box<dyn FnMut(&mut C)>>,
}

struct Inner<C> {
    heap: BinaryHeap<Reverse<(Instant, u64, u64)>>, // (expiry, id, epoch)
    entries: HashMap<u64, Entry<C>>,
    next_id: u64,
}

impl<C> Inner<C> {
    fn push(&mut self, id: u64) {
        let e = &self.entries[&id];
        self.heap.push(Reverse((e.expiry, id, e.epoch)));
    }
}

/// Owned handle to a scheduled timer. Dropping it cancels the timer.
pub struct Timer<C> {
    id: u64,
    inner: Weak<RefCell<Inner<C>>>,
}

impl<C> Timer<C> {
    /// Re-arm relative to `now` with the original duration. A fired timer is
    /// re-armed; a pending one is postponed.
    pub fn reset_at(&self, now: Instant) {
        if let Some(inner) = self.inner.upgrade() {
            let mut inner = inner.borrow_mut();
            if let Some(e) = inner.entries.get_mut(&self.id) {
                e.expiry = now + e.duration;
                e.epoch += 1;
                e.armed = true;
                inner.push(self.id);
            }
        }
    }

    pub fn reset(&self) {
        self.reset_at(Instant::now());
    }
}

impl<C> Drop for Timer<C> {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.borrow_mut().entries.remove(&self.id);
        }
    }
}

/// The queue itself; cheaply clonable so that polling can re-enter the
/// owning context.
pub struct TimerQueue<C> {
    inner: Rc<RefCell<Inner<C>>>,
}

impl<C> Clone for TimerQueue<C> {
    fn clone(&self) -> Self {
        TimerQueue { inner: self.inner.clone() }
    }
}

impl<C> Default for TimerQueue<C> {
    fn default() -> Self {
        TimerQueue::new()
    }
}

impl<C> TimerQueue<C> {
    pub fn new() -> Self {
        TimerQueue {
            inner: Rc::new(RefCell::new(Inner {
                heap: BinaryHeap::new(),
                entries: HashMap::new(),
                next_id: 0,
            })),
        }
    }

    pub fn create_at(
        &self,
        now: Instant,
        duration: Duration,
        callback: impl FnMut(&mut C) + 'static,
    ) -> Timer<C> {
        let mut inner = self.inner.borrow_mut();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.entries.insert(
            id,
            Entry {
                expiry: now + duration,
                duration,
                epoch: 0,
                armed: true,
                callback: Some(Box::new(callback)),
            },
        );
        inner.push(id);
        Timer { id, inner: Rc::downgrade(&self.inner) }
    }

    pub fn create(&self, duration: Duration, callback: impl FnMut(&mut C) + 'static) -> Timer<C> {
        self.create_at(Instant::now(), duration, callback)
    }

    /// Number of live (not cancelled) timers.
    pub fn len(&self) -> usize {
        self.inner.borrow().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fire every timer with `expiry <= now`, in expiry order, exactly once
    /// per arming. The inner state is unlocked while a callback runs, so
    /// callbacks may freely use the queue.
    pub fn poll_at(&self, now: Instant, ctx: &mut C) {
        loop {
            let (id, mut cb) = {
                let mut inner = self.inner.borrow_mut();
                let fired = loop {
                    match inner.heap.peek() {
                        Some(&Reverse((expiry, id, epoch))) if expiry <= now => {
                            inner.heap.pop();
                            match inner.entries.get_mut(&id) {
                                // stale heap entries: cancelled or re-armed
                                Some(e) if e.armed && e.epoch == epoch => {
                                    e.armed = false;
                                    break Some((id, e.callback.take()));
                                }
                                _ => continue,
                            }
                        }
                        _ => break None,
                    }
                };
                match fired {
                    Some((id, Some(cb))) => (id, cb),
                    Some((_, None)) => continue, // already mid-fire higher up the stack
                    None => return,
                }
            };

            cb(ctx);

            // hand the callback back unless the timer was dropped meanwhile
            let mut inner = self.inner.borrow_mut();
            if let Some(e) = inner.entries.get_mut(&id) {
                e.callback = Some(cb);
            }
        }
    }

    pub fn poll(&self, ctx: &mut C) {
        self.poll_at(Instant::now(), ctx);
    }
}

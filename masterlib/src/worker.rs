use std::sync::Mutex;

use flux::logging::{error, Logger};

/// A unit of work whose expensive part (`run`) executes off the main
/// thread and whose main-thread reintegration (`finish`) runs at most once,
/// only after `run` has completed. `finish` is handed `&mut C` (the
/// dispatcher's `MasterContext`) so it can look connections back up by id
/// — never a raw pointer to one, since the connection may be long gone.
pub trait WorkerTask<C>: Send {
    fn run(&mut self);
    fn finish(self: Box<Self>, ctx: &mut C);
}

/// Maximum number of tasks the ring can hold at once, awaiting `run` or
/// `finish`.
const RING_CAPACITY: usize = 32;
/// One extra slot is kept empty (classic circular-buffer sentinel) so
/// `end == start` is unambiguously "empty", never "full".
const RING_SLOTS: usize = RING_CAPACITY + 1;

struct Ring<C> {
    slots: Vec<Option<Box<dyn WorkerTask<C>>>>,
    /// Next slot `finish_pending` will read (main thread).
    start: usize,
    /// Next slot `run_pending` will read (worker thread).
    thread: usize,
    /// Next free slot (main thread, producer).
    end: usize,
}

impl<C> Ring<C> {
    fn new() -> Self {
        Ring {
            slots: (0..RING_SLOTS).map(|_| None).collect(),
            start: 0,
            thread: 0,
            end: 0,
        }
    }
}

/// Bounded single-producer/single-consumer queue of deferred tasks. The
/// producer (main loop) calls `try_enqueue`; a worker thread drains with
/// `run_pending`; the main loop reintegrates with `finish_pending`.
pub struct WorkerQueue<C> {
    ring: Mutex<Ring<C>>,
    log: Logger,
}

impl<C> WorkerQueue<C> {
    pub fn new(log: Logger) -> Self {
        WorkerQueue { ring: Mutex::new(Ring::new()), log }
    }

    /// Enqueues a task. Drops and logs it if the ring is full; the ring's
    /// cursors are left exactly as they were.
    pub fn try_enqueue(&self, task: Box<dyn WorkerTask<C>>) {
        let mut ring = self.ring.lock().unwrap();
        let next_end = (ring.end + 1) % RING_SLOTS;
        if next_end == ring.start {
            error!(self.log, "worker queue overloaded - database access too slow?");
            return;
        }
        let end = ring.end;
        ring.slots[end] = Some(task);
        ring.end = next_end;
    }

    /// Runs every task queued since the last call. Called from the worker
    /// thread only.
    pub fn run_pending(&self) {
        loop {
            let mut task = {
                let mut ring = self.ring.lock().unwrap();
                if ring.thread == ring.end {
                    return;
                }
                let idx = ring.thread;
                ring.slots[idx].take().expect("slot between thread and end must be occupied")
            };
            task.run();
            let mut ring = self.ring.lock().unwrap();
            let idx = ring.thread;
            ring.slots[idx] = Some(task);
            ring.thread = (ring.thread + 1) % RING_SLOTS;
        }
    }

    /// Finishes every task whose `run` has completed. Called from the main
    /// thread only.
    pub fn finish_pending(&self, ctx: &mut C) {
        loop {
            let task = {
                let mut ring = self.ring.lock().unwrap();
                if ring.start == ring.thread {
                    return;
                }
                let idx = ring.start;
                ring.start = (ring.start + 1) % RING_SLOTS;
                ring.slots[idx].take().expect("slot between start and thread must be occupied")
            };
            task.finish(ctx);
        }
    }

    pub fn pending_len(&self) -> usize {
        let ring = self.ring.lock().unwrap();
        (ring.end + RING_SLOTS - ring.start) % RING_SLOTS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter;

    struct Increment {
        ran: bool,
    }

    impl WorkerTask<Counter> for Increment {
        fn run(&mut self) {
            self.ran = true;
        }

        fn finish(self: Box<Self>, _ctx: &mut Counter) {
            assert!(self.ran, "finish must never run before run");
        }
    }

    #[test]
    fn finish_never_precedes_run() {
        let q: WorkerQueue<Counter> = WorkerQueue::new(flux::logging::discard());
        q.try_enqueue(Box::new(Increment { ran: false }));
        q.run_pending();
        let mut ctx = Counter;
        q.finish_pending(&mut ctx);
    }

    #[test]
    fn ring_rejects_33rd_pending_task_without_moving_cursors() {
        let q: WorkerQueue<Counter> = WorkerQueue::new(flux::logging::discard());
        for _ in 0..RING_CAPACITY {
            q.try_enqueue(Box::new(Increment { ran: false }));
        }
        let before = q.pending_len();
        q.try_enqueue(Box::new(Increment { ran: false }));
        assert_eq!(q.pending_len(), before);
        assert_eq!(before, RING_CAPACITY);
    }
}

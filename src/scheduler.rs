//! A fixed-size worker pool pulling tasks from a priority queue.
//!
//! Tasks run in priority order, FIFO among equal priorities.  A queued task can be removed before a worker picks it
//! up; once running, stopping it is up to the task itself (see [CancellationToken](crate::CancellationToken)).
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};

use crate::error::EngineError;

/// Task priority.  Higher variants run first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Low,
    Normal,
    High,
    Immediate,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

type Task = Box<dyn FnOnce() + Send>;

struct QueuedTask {
    id: TaskId,
    priority: Priority,
    /// Insertion order, for FIFO within a priority.
    seq: u64,
    task: Task,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max heap: higher priority first, then the earlier insertion.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct QueueState {
    heap: BinaryHeap<QueuedTask>,
    next_seq: u64,
    shutting_down: bool,
}

struct Shared {
    queue: Mutex<QueueState>,
    available: Condvar,
}

pub struct PriorityScheduler {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl PriorityScheduler {
    /// Start `threads` workers named `<name_prefix>-<n>`.
    pub fn new(threads: usize, name_prefix: &str) -> Result<PriorityScheduler, EngineError> {
        let shared = Arc::new(Shared {
            queue: Mutex::new(QueueState {
                heap: BinaryHeap::new(),
                next_seq: 0,
                shutting_down: false,
            }),
            available: Condvar::new(),
        });

        let mut scheduler = PriorityScheduler {
            shared,
            workers: Vec::with_capacity(threads),
        };
        for n in 0..threads {
            let shared = scheduler.shared.clone();
            let handle = thread::Builder::new()
                .name(format!("{}-{}", name_prefix, n))
                .spawn(move || worker_loop(shared))
                .map_err(EngineError::Spawn)?;
            scheduler.workers.push(handle);
        }
        Ok(scheduler)
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Queue a task.  The returned id can be passed to [PriorityScheduler::remove].
    pub fn submit<F: FnOnce() + Send + 'static>(&self, priority: Priority, task: F) -> TaskId {
        let mut queue = self.shared.queue.lock();
        let seq = queue.next_seq;
        queue.next_seq += 1;
        let id = TaskId(seq);
        queue.heap.push(QueuedTask {
            id,
            priority,
            seq,
            task: Box::new(task),
        });
        drop(queue);
        self.shared.available.notify_one();
        id
    }

    /// Remove a task which has not started yet.  Returns whether it was still queued.
    pub fn remove(&self, id: TaskId) -> bool {
        let mut queue = self.shared.queue.lock();
        let before = queue.heap.len();
        queue.heap.retain(|t| t.id != id);
        queue.heap.len() != before
    }

    pub fn queued(&self) -> usize {
        self.shared.queue.lock().heap.len()
    }

    /// Stop accepting work, drop whatever is still queued and wait for running tasks to finish.
    pub fn shutdown(&mut self) {
        {
            let mut queue = self.shared.queue.lock();
            queue.shutting_down = true;
            queue.heap.clear();
        }
        self.shared.available.notify_all();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                tracing::warn!("worker thread panicked");
            }
        }
    }
}

impl Drop for PriorityScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let next = {
            let mut queue = shared.queue.lock();
            loop {
                if queue.shutting_down {
                    return;
                }
                if let Some(task) = queue.heap.pop() {
                    break task;
                }
                shared.available.wait(&mut queue);
            }
        };
        (next.task)();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use crossbeam_channel::{bounded, unbounded};

    /// Occupy the single worker until the returned sender is dropped or sent to.
    fn block_worker(scheduler: &PriorityScheduler) -> crossbeam_channel::Sender<()> {
        let (gate_tx, gate_rx) = bounded::<()>(0);
        let (started_tx, started_rx) = bounded::<()>(0);
        scheduler.submit(Priority::Immediate, move || {
            let _ = started_tx.send(());
            let _ = gate_rx.recv();
        });
        started_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("worker should start");
        gate_tx
    }

    #[test]
    fn runs_by_priority_then_fifo() {
        let scheduler = PriorityScheduler::new(1, "test-worker").unwrap();
        let gate = block_worker(&scheduler);

        let (tx, rx) = unbounded();
        for (name, priority) in [
            ("low", Priority::Low),
            ("normal-1", Priority::Normal),
            ("high", Priority::High),
            ("normal-2", Priority::Normal),
            ("immediate", Priority::Immediate),
        ] {
            let tx = tx.clone();
            scheduler.submit(priority, move || {
                let _ = tx.send(name);
            });
        }
        assert_eq!(scheduler.queued(), 5);
        drop(gate);

        let order: Vec<&str> = (0..5)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!(order, vec!["immediate", "high", "normal-1", "normal-2", "low"]);
    }

    #[test]
    fn removed_tasks_never_run() {
        let scheduler = PriorityScheduler::new(1, "test-worker").unwrap();
        let gate = block_worker(&scheduler);

        let (tx, rx) = unbounded();
        let tx2 = tx.clone();
        let doomed = scheduler.submit(Priority::Normal, move || {
            let _ = tx.send("doomed");
        });
        scheduler.submit(Priority::Low, move || {
            let _ = tx2.send("kept");
        });
        assert!(scheduler.remove(doomed));
        assert!(!scheduler.remove(doomed));
        drop(gate);

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "kept");
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn many_workers_drain_the_queue() {
        let scheduler = PriorityScheduler::new(4, "test-worker").unwrap();
        assert_eq!(scheduler.worker_count(), 4);
        let (tx, rx) = unbounded();
        for i in 0..100 {
            let tx = tx.clone();
            scheduler.submit(Priority::Normal, move || {
                let _ = tx.send(i);
            });
        }
        let mut seen: Vec<i32> = (0..100)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn shutdown_joins_workers() {
        let mut scheduler = PriorityScheduler::new(2, "test-worker").unwrap();
        scheduler.submit(Priority::Normal, || {});
        scheduler.shutdown();
        assert_eq!(scheduler.worker_count(), 0);
        assert_eq!(scheduler.queued(), 0);
        // Calling it twice, as Drop will, is harmless.
        scheduler.shutdown();
    }
}

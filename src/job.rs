//! A [Job] is the single in-flight production of one [Key], plus everyone waiting on it.
//!
//! Jobs live in the engine's active map and are only touched on the delivery context.  The production itself runs on
//! a worker and only sees the job's [CancellationToken].
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::delivery::DeliveryHandle;
use crate::error::{JobError, LoadError};
use crate::key::Key;
use crate::reference::ReferenceCounter;
use crate::resource::{Lease, Resource};
use crate::scheduler::TaskId;

static NEXT_JOB_ID: AtomicU64 = AtomicU64::new(1);

/// What a waiter gets: exactly one call, with either a lease on the resource or the reason there is none.
pub type Callback = Box<dyn FnOnce(Result<Lease, LoadError>) + Send>;

#[derive(Debug, Default)]
struct TokenInner {
    cancelled: AtomicBool,
    started: AtomicBool,
}

/// Cooperative cancellation flag shared between a job and its producer.
///
/// Cancelling never interrupts anything; producers are expected to check the token at convenient points.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

impl CancellationToken {
    pub fn new() -> CancellationToken {
        Default::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Whether a worker has picked the production up.
    pub fn has_started(&self) -> bool {
        self.inner.started.load(Ordering::Acquire)
    }

    pub(crate) fn mark_started(&self) {
        self.inner.started.store(true, Ordering::Release);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "j{}", self.0)
    }
}

/// Identifies one waiter within a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Queued, not yet picked up by a worker.
    Pending,
    Running,
    Completed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Cancelled)
    }
}

pub struct Job {
    id: JobId,
    key: Key,
    callbacks: Vec<(CallbackId, Callback)>,
    next_callback: u32,
    /// Only ever `Pending` or terminal; `Running` is derived from the token.
    state: JobState,
    token: CancellationToken,
    task: Option<TaskId>,
    cacheable: bool,
}

impl Job {
    /// Create a job with its first waiter.
    pub fn with_callback(key: Key, cacheable: bool, callback: Callback) -> (Job, CallbackId) {
        let first = CallbackId(0);
        let job = Job {
            id: JobId(NEXT_JOB_ID.fetch_add(1, Ordering::Relaxed)),
            key,
            callbacks: vec![(first, callback)],
            next_callback: 1,
            state: JobState::Pending,
            token: CancellationToken::new(),
            task: None,
            cacheable,
        };
        (job, first)
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn state(&self) -> JobState {
        match self.state {
            JobState::Pending if self.token.has_started() => JobState::Running,
            s => s,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn callback_count(&self) -> usize {
        self.callbacks.len()
    }

    /// Whether the result should be registered in the memory cache.
    pub fn is_cacheable(&self) -> bool {
        self.cacheable
    }

    pub(crate) fn allow_caching(&mut self) {
        self.cacheable = true;
    }

    pub(crate) fn task(&self) -> Option<TaskId> {
        self.task
    }

    pub(crate) fn set_task(&mut self, task: TaskId) {
        self.task = Some(task);
    }

    pub fn add_callback(&mut self, callback: Callback) -> Result<CallbackId, JobError> {
        if self.is_terminal() {
            return Err(JobError::Finished {
                job: self.id,
                key: self.key.clone(),
            });
        }

        let id = CallbackId(self.next_callback);
        self.next_callback += 1;
        self.callbacks.push((id, callback));
        Ok(id)
    }

    /// Detach a waiter without calling it.  Returns whether it was attached.
    ///
    /// Detaching the last waiter cancels the job.
    pub fn remove_callback(&mut self, id: CallbackId) -> bool {
        let before = self.callbacks.len();
        self.callbacks.retain(|(c, _)| *c != id);
        if self.callbacks.len() == before {
            return false;
        }

        if self.callbacks.is_empty() && !self.is_terminal() {
            self.cancel();
        }
        true
    }

    pub fn cancel(&mut self) {
        if self.is_terminal() {
            return;
        }
        tracing::debug!(job = %self.id, key = %self.key, "cancelling job");
        self.state = JobState::Cancelled;
        self.token.cancel();
    }

    /// Hand the resource to every waiter.  Returns how many were called.
    ///
    /// A reference is acquired for each waiter before its callback runs; the caller holds the job's own reference
    /// (the pending flag) until this returns.
    pub fn deliver_success(
        mut self,
        resource: &Resource,
        refs: &mut ReferenceCounter,
        releases: &DeliveryHandle,
    ) -> usize {
        self.state = JobState::Completed;
        let callbacks = std::mem::take(&mut self.callbacks);
        let delivered = callbacks.len();
        for (_, callback) in callbacks {
            refs.acquire(resource);
            callback(Ok(Lease::new(resource.clone(), releases.clone())));
        }
        tracing::trace!(job = %self.id, key = %self.key, delivered, "delivered resource");
        delivered
    }

    /// Tell every waiter the job failed.  Returns how many were called.
    pub fn deliver_failure(mut self, error: LoadError) -> usize {
        self.state = JobState::Completed;
        let callbacks = std::mem::take(&mut self.callbacks);
        let delivered = callbacks.len();
        for (_, callback) in callbacks {
            callback(Err(error.clone()));
        }
        tracing::trace!(job = %self.id, key = %self.key, delivered, %error, "delivered failure");
        delivered
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("state", &self.state())
            .field("callbacks", &self.callbacks.len())
            .field("cacheable", &self.cacheable)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crossbeam_channel::{unbounded, Receiver, Sender};

    use crate::block::{Block, BlockShape, PixelFormat};
    use crate::delivery;

    fn key() -> Key {
        Key::new("img1", 10, 10, ["d1"])
    }

    fn recording(tx: &Sender<Result<Lease, LoadError>>) -> Callback {
        let tx = tx.clone();
        Box::new(move |r| {
            let _ = tx.send(r);
        })
    }

    fn channel() -> (Sender<Result<Lease, LoadError>>, Receiver<Result<Lease, LoadError>>) {
        unbounded()
    }

    #[test]
    fn removing_the_last_callback_cancels() {
        let (tx, rx) = channel();
        let (mut job, first) = Job::with_callback(key(), true, recording(&tx));
        let second = job.add_callback(recording(&tx)).unwrap();
        assert_eq!(job.state(), JobState::Pending);

        assert!(job.remove_callback(first));
        assert!(!job.remove_callback(first));
        assert_eq!(job.state(), JobState::Pending);
        assert!(!job.token().is_cancelled());

        assert!(job.remove_callback(second));
        assert_eq!(job.state(), JobState::Cancelled);
        assert!(job.token().is_cancelled());
        // Detached callbacks are never called.
        drop(job);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn terminal_jobs_refuse_callbacks() {
        let (tx, _rx) = channel();
        let (mut job, first) = Job::with_callback(key(), true, recording(&tx));
        job.remove_callback(first);
        assert!(matches!(
            job.add_callback(recording(&tx)),
            Err(JobError::Finished { .. })
        ));
    }

    #[test]
    fn running_is_derived_from_the_token() {
        let (tx, _rx) = channel();
        let (job, _) = Job::with_callback(key(), true, recording(&tx));
        job.token().mark_started();
        assert_eq!(job.state(), JobState::Running);
    }

    #[test]
    fn success_acquires_before_each_callback() {
        let (handle, _inbox) = delivery::channel();
        let (tx, rx) = channel();
        let (mut job, _) = Job::with_callback(key(), true, recording(&tx));
        job.add_callback(recording(&tx)).unwrap();
        job.add_callback(recording(&tx)).unwrap();

        let resource = Resource::new(Block::new(BlockShape::new(2, 2, PixelFormat::Alpha8)));
        let mut refs = ReferenceCounter::new();
        assert_eq!(job.deliver_success(&resource, &mut refs, &handle), 3);
        assert_eq!(refs.count(&resource), 3);

        let leases: Vec<Lease> = rx.try_iter().map(|r| r.unwrap()).collect();
        assert_eq!(leases.len(), 3);
        assert!(leases.iter().all(|l| l.ptr_eq(&resource)));
    }

    #[test]
    fn failure_reaches_every_waiter_once() {
        let (tx, rx) = channel();
        let (mut job, _) = Job::with_callback(key(), true, recording(&tx));
        job.add_callback(recording(&tx)).unwrap();
        let error = LoadError::NotCached { key: key() };
        assert_eq!(job.deliver_failure(error), 2);
        drop(tx);

        let results: Vec<_> = rx.iter().collect();
        assert_eq!(results.len(), 2);
        for r in results {
            assert!(matches!(r, Err(LoadError::NotCached { .. })));
        }
    }
}

//! The [Engine] coordinates loads: it answers from the memory cache, joins requests for the same key onto one [Job],
//! and schedules production for everything else.
//!
//! All of the engine's state is owned by whoever drives its delivery queue, so the active job map, the memory cache
//! and the reference counter need no locking.  Only the [SizeClassPool] is shared with the workers.
//!
//! Lifetimes work as follows.  The memory cache holds one reference on each resource it contains and every delivered
//! [Lease] holds another.  While a job fans its result out the resource is additionally pending, which keeps it alive
//! even if the cache refuses or immediately evicts it.  When the last reference goes and nothing is pending, the block
//! goes back to the pool.
use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use ahash::RandomState;
use crossbeam_channel::{Receiver, RecvTimeoutError};

use crate::bounded_lru::{cost_of, BoundedLruCache, EvictionListener};
use crate::config::EngineConfig;
use crate::delivery::{self, DeliveryHandle, DeliveryTask};
use crate::error::{EngineError, LoadError, ProduceError};
use crate::job::{Callback, CallbackId, Job, JobId, JobState};
use crate::key::Key;
use crate::pool::{SizeClassPool, TrimLevel};
use crate::reference::ReferenceCounter;
use crate::resource::{Lease, Resource};
use crate::scheduler::{PriorityScheduler, Priority};
use crate::traits::{ProduceContext, Producer};

/// Per-request knobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadOptions {
    pub priority: Priority,
    /// Neither answer from nor store into the memory cache.
    pub skip_memory_cache: bool,
    /// Fail with [LoadError::NotCached] rather than produce.
    pub only_from_cache: bool,
}

/// Handle on a pending load.  Cancelling detaches this caller only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadStatus {
    key: Key,
    job: JobId,
    callback: CallbackId,
}

impl LoadStatus {
    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn job(&self) -> JobId {
        self.job
    }

    /// Detach the callback.  If nobody else is waiting, the job is cancelled.  Returns whether the callback was still
    /// attached; `false` means it already ran.
    pub fn cancel(self, engine: &mut Engine) -> bool {
        engine.cancel_load(&self)
    }
}

/// Told when jobs finish.  The engine implements this for itself; it is a trait so tests can drive job completion by
/// hand.
pub trait JobListener {
    fn on_job_complete(&mut self, key: &Key, job: JobId, result: Result<Resource, ProduceError>);

    fn on_job_cancelled(&mut self, key: &Key, job: JobId);
}

/// Told when a resource leaves the memory cache.
pub trait ResourceRemovedListener {
    fn on_resource_removed(&mut self, resource: &Resource);
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub cache_hits: u64,
    /// Loads which attached to an already running job.
    pub joins: u64,
    pub jobs_started: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// Results which arrived after their job was cancelled.
    pub discarded: u64,
    pub recycled: u64,
    pub cache_entries: usize,
    pub cache_size: u64,
    pub cache_max_size: u64,
    pub active_jobs: usize,
}

/// Owns the reference counts and returns dead blocks to the pool.  Sits in the memory cache as its eviction
/// listener.
struct Recycler {
    refs: ReferenceCounter,
    pool: Arc<SizeClassPool>,
    recycled: u64,
}

impl Recycler {
    fn release(&mut self, resource: &Resource) {
        if self.refs.release(resource) {
            self.recycle(resource);
        }
    }

    /// Hand the block to the pool.  Only call once the counter said so.
    fn recycle(&mut self, resource: &Resource) {
        if let Some(block) = resource.take_block() {
            self.recycled += 1;
            let kept = self.pool.put(block);
            tracing::trace!(id = %resource.id(), kept, "recycled resource");
        }
    }
}

impl ResourceRemovedListener for Recycler {
    fn on_resource_removed(&mut self, resource: &Resource) {
        self.release(resource);
    }
}

impl EvictionListener<Key, Resource> for Recycler {
    fn on_evicted(&mut self, key: &Key, value: &Resource) {
        tracing::trace!(%key, id = %value.id(), "resource left the memory cache");
        self.on_resource_removed(value);
    }
}

pub struct Engine {
    config: EngineConfig,
    cache: BoundedLruCache<Key, Resource, Recycler>,
    active: HashMap<Key, Job, RandomState>,
    scheduler: PriorityScheduler,
    pool: Arc<SizeClassPool>,
    handle: DeliveryHandle,
    inbox: Receiver<DeliveryTask>,
    stats: EngineStats,
    stopping: bool,
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Engine, EngineError> {
        let pool = Arc::new(SizeClassPool::from_kind(
            config.pool_bytes,
            config.pool_strategy,
            config.nearest_fit_multiple,
        ));
        Engine::with_pool(config, pool)
    }

    /// Build an engine around an existing pool, for example one shared between engines.
    pub fn with_pool(config: EngineConfig, pool: Arc<SizeClassPool>) -> Result<Engine, EngineError> {
        if config.worker_count == 0 {
            return Err(EngineError::Config("worker_count must be at least 1".to_string()));
        }

        let scheduler = PriorityScheduler::new(config.worker_count, &config.worker_name_prefix)?;
        let recycler = Recycler {
            refs: ReferenceCounter::new(),
            pool: pool.clone(),
            recycled: 0,
        };
        let (handle, inbox) = delivery::channel();
        Ok(Engine {
            cache: BoundedLruCache::with_listener(config.memory_cache_bytes, cost_of, recycler),
            active: Default::default(),
            scheduler,
            pool,
            handle,
            inbox,
            stats: Default::default(),
            stopping: false,
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<SizeClassPool> {
        &self.pool
    }

    /// The sending side of this engine's delivery queue.
    pub fn handle(&self) -> DeliveryHandle {
        self.handle.clone()
    }

    pub fn references(&self) -> &ReferenceCounter {
        &self.cache.listener().refs
    }

    pub fn is_cached(&self, key: &Key) -> bool {
        self.cache.contains(key)
    }

    pub fn active_jobs(&self) -> usize {
        self.active.len()
    }

    pub fn job_state(&self, key: &Key) -> Option<JobState> {
        self.active.get(key).map(Job::state)
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            recycled: self.cache.listener().recycled,
            cache_entries: self.cache.len(),
            cache_size: self.cache.current_size(),
            cache_max_size: self.cache.max_size(),
            active_jobs: self.active.len(),
            ..self.stats.clone()
        }
    }

    /// Load with default options.  See [Engine::load_with].
    pub fn load<P, F>(&mut self, key: Key, producer: P, callback: F) -> Option<LoadStatus>
    where
        P: Producer,
        F: FnOnce(Result<Lease, LoadError>) + Send + 'static,
    {
        self.load_with(key, LoadOptions::default(), producer, callback)
    }

    /// Start or join a load.
    ///
    /// On a memory cache hit the callback runs before this returns and there is nothing to cancel, so the result is
    /// `None`.  Otherwise the callback runs later, on the delivery context, exactly once unless cancelled.
    pub fn load_with<P, F>(&mut self, key: Key, options: LoadOptions, producer: P, callback: F) -> Option<LoadStatus>
    where
        P: Producer,
        F: FnOnce(Result<Lease, LoadError>) + Send + 'static,
    {
        if !options.skip_memory_cache {
            if let Some(resource) = self.cache.get(&key).cloned() {
                self.stats.cache_hits += 1;
                self.cache.listener_mut().refs.acquire(&resource);
                tracing::trace!(%key, id = %resource.id(), "memory cache hit");
                callback(Ok(Lease::new(resource, self.handle.clone())));
                return None;
            }
        }

        if options.only_from_cache {
            tracing::trace!(%key, "memory cache miss for cache-only load");
            callback(Err(LoadError::NotCached { key }));
            return None;
        }

        let callback: Callback = Box::new(callback);
        if let Some(job) = self.active.get_mut(&key) {
            if !job.is_terminal() {
                return match job.add_callback(callback) {
                    Ok(callback_id) => {
                        if !options.skip_memory_cache {
                            job.allow_caching();
                        }
                        self.stats.joins += 1;
                        tracing::debug!(%key, job = %job.id(), waiters = job.callback_count(), "joined job");
                        Some(LoadStatus {
                            key,
                            job: job.id(),
                            callback: callback_id,
                        })
                    }
                    Err(error) => {
                        tracing::warn!(%error, "active job refused a callback");
                        None
                    }
                };
            }
            // Finished jobs leave the map before anything else runs on this context.
            tracing::warn!(%key, job = %job.id(), "finished job left in the active map");
            self.active.remove(&key);
        }

        self.start_job(key, options, producer, callback)
    }

    fn start_job<P: Producer>(
        &mut self,
        key: Key,
        options: LoadOptions,
        producer: P,
        callback: Callback,
    ) -> Option<LoadStatus> {
        let (mut job, callback_id) = Job::with_callback(key.clone(), !options.skip_memory_cache, callback);
        let job_id = job.id();
        let token = job.token().clone();
        let ctx = ProduceContext::new(token.clone(), self.pool.clone());
        let completions = self.handle.clone();
        let task_key = key.clone();

        let task = self.scheduler.submit(options.priority, move || {
            token.mark_started();
            let result = if token.is_cancelled() {
                Err(ProduceError::Cancelled)
            } else {
                match panic::catch_unwind(AssertUnwindSafe(|| producer.produce(&task_key, &ctx))) {
                    Ok(result) => result,
                    Err(payload) => Err(ProduceError::Panicked(panic_message(&*payload))),
                }
            };
            if !completions.post(move |engine| engine.on_job_complete(&task_key, job_id, result)) {
                tracing::trace!(job = %job_id, "engine gone, dropping production result");
            }
        });
        job.set_task(task);

        self.stats.jobs_started += 1;
        tracing::debug!(%key, job = %job_id, priority = ?options.priority, "started job");
        self.active.insert(key.clone(), job);
        Some(LoadStatus {
            key,
            job: job_id,
            callback: callback_id,
        })
    }

    fn cancel_load(&mut self, status: &LoadStatus) -> bool {
        let job = match self.active.get_mut(&status.key) {
            Some(j) if j.id() == status.job => j,
            _ => return false,
        };
        if !job.remove_callback(status.callback) {
            return false;
        }

        tracing::debug!(key = %status.key, job = %status.job, waiters = job.callback_count(), "detached callback");
        if job.state() == JobState::Cancelled {
            self.on_job_cancelled(&status.key, status.job);
        }
        true
    }

    /// Drop one reference to a resource, recycling its block if that was the last.
    ///
    /// Dropping a [Lease] posts this; calling it directly is only for references taken by hand.
    pub fn release(&mut self, resource: &Resource) {
        self.cache.listener_mut().release(resource);
    }

    /// Respond to memory pressure in both the memory cache and the pool.
    pub fn trim_memory(&mut self, level: TrimLevel) {
        tracing::debug!(?level, cache_size = self.cache.current_size(), "trimming memory");
        match level {
            TrimLevel::Moderate => self.cache.clear_memory(),
            TrimLevel::Background => {
                let half = self.cache.max_size() / 2;
                self.cache.trim_to_size(half);
            }
        }
        self.pool.trim(level);
    }

    /// Rescale the memory cache and the pool relative to their configured sizes.
    pub fn set_size_multiplier(&mut self, multiplier: f32) {
        self.cache.set_size_multiplier(multiplier);
        self.pool.set_size_multiplier(multiplier);
    }

    pub fn clear_memory(&mut self) {
        self.cache.clear_memory();
        self.pool.clear_memory();
    }

    /// Run every task already queued on the delivery context.  Returns how many ran.
    pub fn run_pending(&mut self) -> usize {
        let mut ran = 0;
        while let Ok(task) = self.inbox.try_recv() {
            task(self);
            ran += 1;
        }
        ran
    }

    /// Wait up to `timeout` for a task, then run everything queued.  Returns how many ran.
    pub fn wait_and_run(&mut self, timeout: Duration) -> usize {
        match self.inbox.recv_timeout(timeout) {
            Ok(task) => {
                task(self);
                1 + self.run_pending()
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => 0,
        }
    }

    /// Run tasks as they arrive until one calls [Engine::stop].
    pub fn run_until_stopped(&mut self) {
        self.stopping = false;
        while !self.stopping {
            match self.inbox.recv() {
                Ok(task) => task(self),
                Err(_) => break,
            }
        }
    }

    /// Make [Engine::run_until_stopped] return after the current task.
    pub fn stop(&mut self) {
        self.stopping = true;
    }
}

impl JobListener for Engine {
    fn on_job_complete(&mut self, key: &Key, job: JobId, result: Result<Resource, ProduceError>) {
        let current = self.active.get(key).map(Job::id) == Some(job);
        let finished = if current { self.active.remove(key) } else { None };
        let finished = match finished {
            Some(j) => j,
            None => {
                // Cancelled while running; nobody is waiting and the resource was never shared.
                if let Ok(resource) = result {
                    self.stats.discarded += 1;
                    tracing::debug!(%key, %job, "discarding result of cancelled job");
                    self.cache.listener_mut().recycle(&resource);
                }
                return;
            }
        };

        let resource = match result {
            Ok(r) => r,
            Err(error) => {
                self.stats.failed += 1;
                tracing::debug!(%key, %job, %error, "job failed");
                finished.deliver_failure(LoadError::Production {
                    key: key.clone(),
                    source: Arc::new(error),
                });
                return;
            }
        };

        self.stats.completed += 1;
        self.cache.listener_mut().refs.mark_pending(&resource);
        if finished.is_cacheable() {
            self.cache.listener_mut().refs.acquire(&resource);
            if resource.size_bytes() >= self.cache.max_size() {
                tracing::debug!(%key, size = resource.size_bytes(), "resource too large for the memory cache");
            }
            if let Some(replaced) = self.cache.put(key.clone(), resource.clone()) {
                self.cache.listener_mut().release(&replaced);
            }
        }

        let recycler = self.cache.listener_mut();
        finished.deliver_success(&resource, &mut recycler.refs, &self.handle);
        if recycler.refs.reject(&resource) {
            recycler.recycle(&resource);
        }
    }

    fn on_job_cancelled(&mut self, key: &Key, job: JobId) {
        let current = self.active.get(key).map(Job::id) == Some(job);
        let cancelled = if current { self.active.remove(key) } else { None };
        let cancelled = match cancelled {
            Some(j) => j,
            None => return,
        };

        self.stats.cancelled += 1;
        if let Some(task) = cancelled.task() {
            if self.scheduler.remove(task) {
                tracing::debug!(%key, %job, "cancelled job before it started");
            }
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        for (key, job) in self.active.drain() {
            job.token().cancel();
            job.deliver_failure(LoadError::Shutdown { key });
        }
        self.scheduler.shutdown();
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("stats", &self.stats())
            .field("pool", &self.pool)
            .finish()
    }
}

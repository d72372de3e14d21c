//! The [ReferenceCounter] decides when a resource's block may go back to the pool.
//!
//! A resource nobody has registered is *exclusive*: only the job which produced it knows about it.  Once registered
//! it is *shared*, counted once per holder (the memory cache and every live lease).  While a job is still fanning a
//! result out, the resource is additionally *pending*, which keeps it alive even if the count drops to zero in
//! between, for example because the cache refused it.
//!
//! Blocks are recycled only when [ReferenceCounter::release] or [ReferenceCounter::reject] return `true`.
use std::collections::HashMap;

use ahash::RandomState;

use crate::resource::{Resource, ResourceId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceState {
    /// Not registered; held only by whoever produced it.
    Exclusive,
    /// Registered and waiting on an in-progress delivery.
    SharedPending { count: u32 },
    /// Registered with `count` holders.
    Shared { count: u32 },
}

#[derive(Debug, Default, Clone, Copy)]
struct Tracked {
    count: u32,
    pending: bool,
}

#[derive(Debug, Default)]
pub struct ReferenceCounter {
    tracked: HashMap<ResourceId, Tracked, RandomState>,
}

impl ReferenceCounter {
    pub fn new() -> ReferenceCounter {
        Default::default()
    }

    pub fn state(&self, resource: &Resource) -> ResourceState {
        match self.tracked.get(&resource.id()) {
            None => ResourceState::Exclusive,
            Some(t) if t.pending => ResourceState::SharedPending { count: t.count },
            Some(t) => ResourceState::Shared { count: t.count },
        }
    }

    pub fn count(&self, resource: &Resource) -> u32 {
        self.tracked.get(&resource.id()).map_or(0, |t| t.count)
    }

    pub fn acquire(&mut self, resource: &Resource) {
        self.tracked.entry(resource.id()).or_default().count += 1;
    }

    /// Drop one reference.  Returns whether the resource is now recyclable.
    pub fn release(&mut self, resource: &Resource) -> bool {
        let id = resource.id();
        let tracked = match self.tracked.get_mut(&id) {
            Some(t) if t.count > 0 => t,
            _ => {
                tracing::warn!(%id, "released a resource with no outstanding references");
                return false;
            }
        };

        tracked.count -= 1;
        if tracked.count == 0 && !tracked.pending {
            self.tracked.remove(&id);
            return true;
        }
        false
    }

    /// Flag a resource as referenced by a delivery which has not run yet.
    pub fn mark_pending(&mut self, resource: &Resource) {
        self.tracked.entry(resource.id()).or_default().pending = true;
    }

    /// Clear the pending flag.  Returns whether nothing else holds the resource, in which case it is recyclable.
    pub fn reject(&mut self, resource: &Resource) -> bool {
        let id = resource.id();
        let tracked = match self.tracked.get_mut(&id) {
            Some(t) => t,
            // Never registered: still exclusive to the caller, who may recycle it.
            None => return true,
        };

        tracked.pending = false;
        if tracked.count == 0 {
            self.tracked.remove(&id);
            return true;
        }
        false
    }

    /// Number of resources currently registered.
    pub fn tracked(&self) -> usize {
        self.tracked.len()
    }
}

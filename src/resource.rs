//! A [Resource] is a shared handle over a produced [Block] and the size it is accounted at.
//!
//! Resources are identified by a process-unique [ResourceId]; the [ReferenceCounter](crate::ReferenceCounter) keys
//! on it.  Once the counter declares a resource recyclable, the engine takes the block out and hands it to the pool,
//! after which [Resource::block] returns `None`.
//!
//! Callbacks receive a [Lease] rather than a bare resource.  Dropping the lease posts the matching release to the
//! delivery context, so reference counts are only ever touched there.
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};

use crate::block::{Block, BlockShape};
use crate::bounded_lru::EstimateCost;
use crate::delivery::DeliveryHandle;

static NEXT_RESOURCE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(u64);

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

struct ResourceInner {
    id: ResourceId,
    shape: BlockShape,
    size: u64,
    block: Mutex<Option<Block>>,
}

#[derive(Clone)]
pub struct Resource {
    inner: Arc<ResourceInner>,
}

impl Resource {
    pub fn new(block: Block) -> Resource {
        Resource {
            inner: Arc::new(ResourceInner {
                id: ResourceId(NEXT_RESOURCE_ID.fetch_add(1, Ordering::Relaxed)),
                shape: block.shape(),
                size: block.allocation_size(),
                block: Mutex::new(Some(block)),
            }),
        }
    }

    pub fn id(&self) -> ResourceId {
        self.inner.id
    }

    pub fn shape(&self) -> BlockShape {
        self.inner.shape
    }

    /// Size used for cache accounting.
    pub fn size_bytes(&self) -> u64 {
        self.inner.size
    }

    /// Lock the backing block.  `None` once the block went back to the pool.
    pub fn block(&self) -> Option<MappedMutexGuard<'_, Block>> {
        MutexGuard::try_map(self.inner.block.lock(), |b| b.as_mut()).ok()
    }

    pub fn is_recycled(&self) -> bool {
        self.inner.block.lock().is_none()
    }

    /// Whether both handles point at the same resource.
    pub fn ptr_eq(&self, other: &Resource) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Detach the block for recycling.  Only the engine does this, and only when the resource is recyclable.
    pub(crate) fn take_block(&self) -> Option<Block> {
        self.inner.block.lock().take()
    }
}

impl PartialEq for Resource {
    fn eq(&self, other: &Resource) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Resource {}

impl EstimateCost for Resource {
    fn estimate_cost(&self) -> u64 {
        self.size_bytes()
    }
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("id", &self.inner.id)
            .field("shape", &self.inner.shape)
            .field("size", &self.inner.size)
            .finish()
    }
}

/// A delivered reference to a resource.
///
/// The reference is counted while the lease is alive.  Dropping it releases the reference on the delivery context;
/// if that was the last one and the cache no longer holds the resource, its block is recycled.
pub struct Lease {
    resource: Resource,
    releases: DeliveryHandle,
}

impl Lease {
    pub(crate) fn new(resource: Resource, releases: DeliveryHandle) -> Lease {
        Lease { resource, releases }
    }

    pub fn resource(&self) -> &Resource {
        &self.resource
    }
}

impl Deref for Lease {
    type Target = Resource;

    fn deref(&self) -> &Resource {
        &self.resource
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        let resource = self.resource.clone();
        let id = resource.id();
        if !self.releases.post(move |engine| engine.release(&resource)) {
            tracing::trace!(%id, "engine gone, lease released without recycling");
        }
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Lease").field(&self.resource).finish()
    }
}

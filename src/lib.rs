//! A resource engine for keyed, expensive-to-produce artifacts such as decoded and transformed images.
//!
//! Many consumers may ask for the same artifact at once, producing one is costly (I/O plus a CPU-heavy transform), and
//! the large buffers artifacts live in should be reused rather than reallocated.  This crate handles all three:
//!
//! [Engine] is the entry point.  [Engine::load] answers from a size-bounded memory cache when it can, attaches to the
//! in-flight [Job] when someone already asked for the same [Key], and otherwise schedules a [Producer] on a
//! [PriorityScheduler].  Results are fanned out to every waiter as a [Lease].
//!
//! [BoundedLruCache] is the memory cache: an LRU map which accounts for the size of each item and reports evictions to
//! an [EvictionListener].  It is exposed because it's useful in other contexts.
//!
//! [SizeClassPool] recycles memory [Block]s by shape, with a pluggable [MatchStrategy] deciding whether only exact
//! shapes match or a somewhat larger block may stand in.  The [ReferenceCounter] decides when a resource's block may
//! go back to it.
//!
//! Engine state is confined to a single delivery context: either pump the engine yourself with
//! [Engine::run_pending], or move it onto a [DeliveryThread] and talk to it through a [DeliveryHandle].
//!
//! For persistence, wrap a producer in a [PersistedProducer] backed by a [BlobStore] such as [FilesystemBlobStore].
mod block;
mod bounded_lru;
mod config;
mod delivery;
mod engine;
mod error;
mod filesystem_store;
mod grouped_lru;
mod job;
mod key;
mod linked_slab;
mod persisted;
mod pool;
mod pool_strategy;
mod reference;
mod resource;
mod scheduler;
mod store;
mod traits;

pub use block::*;
pub use bounded_lru::*;
pub use config::*;
pub use delivery::*;
pub use engine::*;
pub use error::*;
pub use filesystem_store::*;
pub use job::*;
pub use key::*;
pub use persisted::*;
pub use pool::*;
pub use pool_strategy::*;
pub use reference::*;
pub use resource::*;
pub use scheduler::*;
pub use store::*;
pub use traits::*;

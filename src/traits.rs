//! The seams between the engine and the outside world.
//!
//! A [Producer] turns a [Key] into a [Resource] on a worker thread.  A [BlobStore] is a persistent byte cache keyed by
//! [SafeKey], written through a [BlobWriter] so the store decides whether an entry is committed.  A [ResourceCodec]
//! converts between stored bytes and pooled [Block]s.
use std::io::{Result as IoResult, Write};
use std::sync::Arc;

use crate::block::Block;
use crate::error::{ProduceError, StoreError};
use crate::job::CancellationToken;
use crate::key::{Key, SafeKey};
use crate::pool::SizeClassPool;
use crate::resource::Resource;

/// What a producer can see while it runs.
#[derive(Debug, Clone)]
pub struct ProduceContext {
    token: CancellationToken,
    pool: Arc<SizeClassPool>,
}

impl ProduceContext {
    pub fn new(token: CancellationToken, pool: Arc<SizeClassPool>) -> ProduceContext {
        ProduceContext { token, pool }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Bail out with [ProduceError::Cancelled] if nobody wants the result any more.
    pub fn check_cancelled(&self) -> Result<(), ProduceError> {
        if self.is_cancelled() {
            Err(ProduceError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// The pool to allocate output blocks from.
    pub fn pool(&self) -> &SizeClassPool {
        &self.pool
    }
}

/// Produces the resource for a key.  Runs once, on a worker thread, and may block.
///
/// Long-running producers should call [ProduceContext::check_cancelled] between expensive steps.
pub trait Producer: Send + 'static {
    fn produce(self, key: &Key, ctx: &ProduceContext) -> Result<Resource, ProduceError>;
}

impl<F> Producer for F
where
    F: FnOnce(&Key, &ProduceContext) -> Result<Resource, ProduceError> + Send + 'static,
{
    fn produce(self, key: &Key, ctx: &ProduceContext) -> Result<Resource, ProduceError> {
        self(key, ctx)
    }
}

/// Writes one entry's bytes into a [BlobStore].
pub trait BlobWriter {
    /// Write the entry.  Returning `Ok(false)` or an error abandons it, and the store keeps nothing.
    fn write(&mut self, sink: &mut dyn Write) -> IoResult<bool>;
}

impl<F: FnMut(&mut dyn Write) -> IoResult<bool>> BlobWriter for F {
    fn write(&mut self, sink: &mut dyn Write) -> IoResult<bool> {
        self(sink)
    }
}

/// A persistent cache of bytes.
pub trait BlobStore: Send + Sync + 'static {
    fn get(&self, key: &SafeKey) -> Result<Option<Vec<u8>>, StoreError>;

    /// Store whatever `writer` produces under `key`, replacing any previous entry.  Returns whether an entry was
    /// committed.
    fn put(&self, key: &SafeKey, writer: &mut dyn BlobWriter) -> Result<bool, StoreError>;

    /// Returns whether there was an entry to delete.
    fn delete(&self, key: &SafeKey) -> Result<bool, StoreError>;
}

/// Converts between stored bytes and blocks.
pub trait ResourceCodec: Send + Sync + 'static {
    /// Decode a block, allocating it from `pool` where possible.
    fn decode(&self, bytes: &[u8], pool: &SizeClassPool) -> Result<Block, ProduceError>;

    fn encode(&self, block: &Block, sink: &mut dyn Write) -> IoResult<()>;
}

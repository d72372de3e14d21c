//! Production backed by a persistent [BlobStore].
//!
//! A [PersistedProducer] wraps another producer.  It first looks the key's [SafeKey] up in the store and decodes a hit
//! straight into a pooled block; on a miss it runs the inner producer and writes the result back.  The store is a
//! cache, so any trouble with it is logged and production carries on as if it had missed.
use std::io::{Result as IoResult, Write};
use std::sync::Arc;

use crate::block::{Block, BlockShape, PixelFormat};
use crate::error::ProduceError;
use crate::key::{Key, SafeKey, SafeKeyGenerator};
use crate::pool::SizeClassPool;
use crate::resource::Resource;
use crate::traits::{BlobStore, ProduceContext, Producer, ResourceCodec};

/// Stores blocks as a 12-byte header (big-endian width, height and format tag) followed by the pixels.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawBlockCodec;

impl RawBlockCodec {
    pub const HEADER_LEN: usize = 12;
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[at..at + 4]);
    u32::from_be_bytes(word)
}

impl ResourceCodec for RawBlockCodec {
    fn decode(&self, bytes: &[u8], pool: &SizeClassPool) -> Result<Block, ProduceError> {
        if bytes.len() < Self::HEADER_LEN {
            return Err(ProduceError::Decode(format!(
                "{} bytes is too short for a header",
                bytes.len()
            )));
        }

        let width = read_u32(bytes, 0);
        let height = read_u32(bytes, 4);
        let tag = read_u32(bytes, 8);
        let format = u8::try_from(tag)
            .ok()
            .and_then(PixelFormat::from_tag)
            .ok_or_else(|| ProduceError::Decode(format!("unknown pixel format {}", tag)))?;
        let shape = BlockShape::new(width, height, format);

        let needed = shape
            .checked_byte_size()
            .ok_or_else(|| ProduceError::Decode(format!("{} is too large", shape)))?;
        let pixels = &bytes[Self::HEADER_LEN..];
        if pixels.len() as u64 != needed {
            return Err(ProduceError::Decode(format!(
                "{} needs {} bytes of pixels, found {}",
                shape,
                needed,
                pixels.len()
            )));
        }

        // Every byte gets overwritten, so there is no point paying for the erase.
        let mut block = pool
            .get_dirty(&shape)
            .unwrap_or_else(|| Block::new(shape));
        block.pixels_mut().copy_from_slice(pixels);
        Ok(block)
    }

    fn encode(&self, block: &Block, sink: &mut dyn Write) -> IoResult<()> {
        let shape = block.shape();
        sink.write_all(&shape.width.to_be_bytes())?;
        sink.write_all(&shape.height.to_be_bytes())?;
        sink.write_all(&u32::from(shape.format.tag()).to_be_bytes())?;
        sink.write_all(block.pixels())
    }
}

pub struct PersistedProducer<P, S, C> {
    inner: P,
    store: Arc<S>,
    codec: Arc<C>,
    safe_keys: Option<Arc<SafeKeyGenerator>>,
}

impl<P: Producer, S: BlobStore, C: ResourceCodec> PersistedProducer<P, S, C> {
    pub fn new(inner: P, store: Arc<S>, codec: Arc<C>) -> PersistedProducer<P, S, C> {
        PersistedProducer {
            inner,
            store,
            codec,
            safe_keys: None,
        }
    }

    /// Derive safe keys through a shared, memoizing generator.
    pub fn with_key_generator(mut self, generator: Arc<SafeKeyGenerator>) -> Self {
        self.safe_keys = Some(generator);
        self
    }
}

fn read_through<S: BlobStore, C: ResourceCodec>(
    store: &S,
    codec: &C,
    key: &Key,
    safe: &SafeKey,
    pool: &SizeClassPool,
) -> Option<Block> {
    let bytes = match store.get(safe) {
        Ok(Some(b)) => b,
        Ok(None) => return None,
        Err(error) => {
            tracing::warn!(%key, %error, "blob store read failed");
            return None;
        }
    };

    match codec.decode(&bytes, pool) {
        Ok(block) => {
            tracing::trace!(%key, "produced from blob store");
            Some(block)
        }
        Err(error) => {
            tracing::warn!(%key, %error, "discarding undecodable blob store entry");
            if let Err(error) = store.delete(safe) {
                tracing::warn!(%key, %error, "failed to delete blob store entry");
            }
            None
        }
    }
}

fn write_back<S: BlobStore, C: ResourceCodec>(
    store: &S,
    codec: &C,
    key: &Key,
    safe: &SafeKey,
    resource: &Resource,
) {
    let block = match resource.block() {
        Some(b) => b,
        None => return,
    };
    let mut writer = |sink: &mut dyn Write| -> IoResult<bool> {
        codec.encode(&block, sink)?;
        Ok(true)
    };
    if let Err(error) = store.put(safe, &mut writer) {
        tracing::warn!(%key, %error, "blob store write failed");
    }
}

impl<P, S, C> Producer for PersistedProducer<P, S, C>
where
    P: Producer,
    S: BlobStore,
    C: ResourceCodec,
{
    fn produce(self, key: &Key, ctx: &ProduceContext) -> Result<Resource, ProduceError> {
        let safe = match &self.safe_keys {
            Some(generator) => generator.safe_key(key),
            None => key.safe_key(),
        };

        ctx.check_cancelled()?;
        if let Some(block) = read_through(&*self.store, &*self.codec, key, &safe, ctx.pool()) {
            return Ok(Resource::new(block));
        }

        ctx.check_cancelled()?;
        let resource = self.inner.produce(key, ctx)?;
        write_back(&*self.store, &*self.codec, key, &safe, &resource);
        Ok(resource)
    }
}

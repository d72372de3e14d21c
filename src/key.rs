//! Composite keys identifying a producible resource.
//!
//! A [Key] carries the logical identity of the source plus every parameter which changes the produced bytes: the
//! target dimensions and the ordered identifiers of each pipeline stage.  Equality, hashing and the canonical byte
//! serialization all cover every field, so two keys differing only in a stage never collide.
//!
//! The [SafeKey] is a fixed-width digest of the canonical serialization which can be used as a file name in a
//! [BlobStore](crate::BlobStore).
use std::fmt;
use std::io::{self, Write};

use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use crate::bounded_lru::BoundedLruCache;

/// Identifies one stage of the pipeline (a decoder, a transformation, an encoder...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StageId(String);

impl StageId {
    pub fn new(id: impl Into<String>) -> StageId {
        StageId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for StageId {
    fn from(s: &str) -> StageId {
        StageId(s.to_string())
    }
}

impl From<String> for StageId {
    fn from(s: String) -> StageId {
        StageId(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Key {
    id: String,
    width: u32,
    height: u32,
    stages: Vec<StageId>,
}

impl Key {
    /// Build a key.  Stages are usually the source decoder, the target decoder, the transformation and the encoder,
    /// in that order.
    pub fn new<S: Into<StageId>>(
        id: impl Into<String>,
        width: u32,
        height: u32,
        stages: impl IntoIterator<Item = S>,
    ) -> Key {
        Key {
            id: id.into(),
            width,
            height,
            stages: stages.into_iter().map(Into::into).collect(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn stages(&self) -> &[StageId] {
        &self.stages
    }

    /// Write the canonical serialization.
    ///
    /// Every variable-length field is length-prefixed, so no two distinct keys share a serialization.
    pub fn write_canonical<W: Write>(&self, out: &mut W) -> io::Result<()> {
        write_str(out, &self.id)?;
        out.write_all(&self.width.to_be_bytes())?;
        out.write_all(&self.height.to_be_bytes())?;
        out.write_all(&(self.stages.len() as u32).to_be_bytes())?;
        for stage in &self.stages {
            write_str(out, stage.as_str())?;
        }
        Ok(())
    }

    pub fn to_canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.id.len() + 16 + self.stages.len() * 16);
        // Writing to a vec can't fail.
        let _ = self.write_canonical(&mut out);
        out
    }

    pub fn safe_key(&self) -> SafeKey {
        let digest = Sha256::digest(&self.to_canonical_bytes());
        SafeKey(format!("{:x}", digest))
    }
}

fn write_str<W: Write>(out: &mut W, s: &str) -> io::Result<()> {
    out.write_all(&(s.len() as u32).to_be_bytes())?;
    out.write_all(s.as_bytes())
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}x{}", self.id, self.width, self.height)?;
        for stage in &self.stages {
            write!(f, "/{}", stage.as_str())?;
        }
        Ok(())
    }
}

/// A fixed-width, lowercase hex digest of a key, usable as a path component.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SafeKey(String);

impl SafeKey {
    pub const LEN: usize = 64;

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Accept an already-derived key, checking its shape.
    pub fn parse(s: &str) -> Option<SafeKey> {
        let ok = s.len() == Self::LEN
            && s
                .bytes()
                .all(|b| b.is_ascii_digit() || b.is_ascii_lowercase() || b == b'_' || b == b'-');
        if ok {
            Some(SafeKey(s.to_string()))
        } else {
            None
        }
    }
}

impl fmt::Display for SafeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Memoizes [Key::safe_key], since hashing happens on every persisted lookup.
pub struct SafeKeyGenerator {
    cache: Mutex<BoundedLruCache<Key, SafeKey>>,
}

impl SafeKeyGenerator {
    pub const DEFAULT_CAPACITY: u64 = 1000;

    pub fn new() -> SafeKeyGenerator {
        SafeKeyGenerator::with_capacity(Self::DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: u64) -> SafeKeyGenerator {
        SafeKeyGenerator {
            cache: Mutex::new(BoundedLruCache::new(capacity)),
        }
    }

    pub fn safe_key(&self, key: &Key) -> SafeKey {
        if let Some(found) = self.cache.lock().get(key) {
            return found.clone();
        }
        let derived = key.safe_key();
        self.cache.lock().put(key.clone(), derived.clone());
        derived
    }

    pub fn cached(&self) -> usize {
        self.cache.lock().len()
    }
}

impl Default for SafeKeyGenerator {
    fn default() -> Self {
        SafeKeyGenerator::new()
    }
}

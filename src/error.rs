//! Error taxonomy.
//!
//! Production failures are caught at the job boundary and fanned out to every waiter as a [LoadError]; they never
//! escape into the delivery context.  Cache and pool capacity decisions are not errors at all.
use std::io::Error as IoError;
use std::sync::Arc;

use crate::job::JobId;
use crate::key::Key;

/// Why a producer could not produce.
#[derive(Debug, thiserror::Error)]
pub enum ProduceError {
    #[error("i/o error: {0}")]
    Io(#[from] IoError),
    #[error("blob store error: {0}")]
    Store(#[from] StoreError),
    #[error("decode failed: {0}")]
    Decode(String),
    #[error("production was cancelled")]
    Cancelled,
    #[error("producer panicked: {0}")]
    Panicked(String),
    #[error("{0}")]
    Other(String),
}

/// The terminal failure a waiting callback receives.
///
/// Cheap to clone, since one failure is delivered to every waiter of a job.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LoadError {
    #[error("failed to produce {key}: {source}")]
    Production {
        key: Key,
        #[source]
        source: Arc<ProduceError>,
    },
    #[error("{key} is not in the memory cache")]
    NotCached { key: Key },
    #[error("engine shut down before {key} was produced")]
    Shutdown { key: Key },
}

impl LoadError {
    pub fn key(&self) -> &Key {
        match self {
            LoadError::Production { key, .. } | LoadError::NotCached { key } | LoadError::Shutdown { key } => key,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("i/o error: {0}")]
    Io(#[from] IoError),
    #[error("invalid key: {0}")]
    InvalidKey(String),
}

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("job {job} for {key} has already finished")]
    Finished { job: JobId, key: Key },
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("failed to spawn thread: {0}")]
    Spawn(#[source] IoError),
    #[error("invalid configuration: {0}")]
    Config(String),
}

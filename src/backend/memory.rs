//! In-process backend built on [`StorageEngine`].

use super::{
    BackendError, DocumentId, GetResult, KvBackend, MutationResult, RemoveRequest,
    RequestContext, UpsertRequest, DEFAULT_COLLECTION, DEFAULT_SCOPE,
};
use crate::storage::{
    ExpiryConfig, ExpirySweeper, Mutation, StorageEngine, StorageStats, StoreError,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Instant, SystemTime};
use tracing::trace;

/// Largest value the memory backend accepts.
pub const MAX_VALUE_SIZE: usize = 20 * 1024 * 1024;

impl From<StoreError> for BackendError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => BackendError::NotFound,
            StoreError::CasMismatch => BackendError::Exists,
        }
    }
}

/// A fixed set of buckets, each with only the default collection.
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    buckets: HashMap<String, Arc<StorageEngine>>,
}

impl MemoryBackend {
    pub fn new<I, S>(buckets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let buckets = buckets
            .into_iter()
            .map(|name| (name.into(), Arc::new(StorageEngine::new())))
            .collect();
        Self { buckets }
    }

    /// Starts the background sweeper over every bucket.
    pub fn start_sweeper(&self, config: ExpiryConfig) -> ExpirySweeper {
        ExpirySweeper::start(self.buckets.values().cloned().collect(), config)
    }

    /// Per-bucket statistics, sorted by bucket name.
    pub fn stats(&self) -> Vec<(String, StorageStats)> {
        let mut stats: Vec<_> = self
            .buckets
            .iter()
            .map(|(name, engine)| (name.clone(), engine.stats()))
            .collect();
        stats.sort_by(|a, b| a.0.cmp(&b.0));
        stats
    }

    fn store(&self, ctx: &RequestContext, id: &DocumentId) -> Result<&StorageEngine, BackendError> {
        if ctx.username.is_none() {
            return Err(BackendError::AccessDenied);
        }

        let engine = self
            .buckets
            .get(&id.bucket)
            .ok_or_else(|| BackendError::NoBucket(id.bucket.clone()))?;

        if id.scope != DEFAULT_SCOPE || id.collection != DEFAULT_COLLECTION {
            return Err(BackendError::UnknownCollection(format!(
                "{}.{}",
                id.scope, id.collection
            )));
        }

        Ok(engine.as_ref())
    }
}

/// Converts a wall-clock deadline to the monotonic clock the store uses.
fn to_instant(deadline: SystemTime) -> Instant {
    let now = Instant::now();
    match deadline.duration_since(SystemTime::now()) {
        Ok(remaining) => now + remaining,
        Err(_) => now,
    }
}

#[async_trait]
impl KvBackend for MemoryBackend {
    async fn get(&self, ctx: &RequestContext, id: &DocumentId) -> Result<GetResult, BackendError> {
        let doc = self
            .store(ctx, id)?
            .get(&id.key)
            .ok_or(BackendError::NotFound)?;

        Ok(GetResult {
            value: doc.value,
            flags: doc.flags,
            datatype: doc.datatype,
            cas: doc.cas,
        })
    }

    async fn upsert(
        &self,
        ctx: &RequestContext,
        request: UpsertRequest,
    ) -> Result<MutationResult, BackendError> {
        let store = self.store(ctx, &request.id)?;

        if request.value.len() > MAX_VALUE_SIZE {
            return Err(BackendError::ValueTooLarge {
                size: request.value.len(),
                max: MAX_VALUE_SIZE,
            });
        }
        if let Some(durability) = request.durability {
            trace!(level = ?durability.level, "Durable write on a single-node store");
        }

        let cas = store.upsert(
            request.id.key,
            Mutation {
                value: request.value,
                flags: request.flags,
                datatype: request.datatype,
                expires_at: request.expiry.map(to_instant),
                cas: request.cas.unwrap_or(0),
                preserve_ttl: request.preserve_ttl,
            },
        )?;

        Ok(MutationResult { cas })
    }

    async fn remove(
        &self,
        ctx: &RequestContext,
        request: RemoveRequest,
    ) -> Result<MutationResult, BackendError> {
        let store = self.store(ctx, &request.id)?;
        let cas = store.remove(&request.id.key, request.cas.unwrap_or(0))?;
        Ok(MutationResult { cas })
    }
}

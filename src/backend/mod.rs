//! Backend key-value service.
//!
//! The bridge translates legacy CRUD opcodes into calls on a [`KvBackend`],
//! which addresses documents by bucket, scope, collection and key. A real
//! deployment plugs in an RPC client; [`MemoryBackend`] keeps everything in
//! process.

pub mod memory;

pub use memory::MemoryBackend;

use crate::protocol::{DurabilityRequirement, Status};
use async_trait::async_trait;
use bytes::Bytes;
use std::time::SystemTime;
use thiserror::Error;

pub const DEFAULT_SCOPE: &str = "_default";
pub const DEFAULT_COLLECTION: &str = "_default";

/// Fully qualified document address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocumentId {
    pub bucket: String,
    pub scope: String,
    pub collection: String,
    pub key: Bytes,
}

impl DocumentId {
    /// Addresses `key` in the default scope and collection of `bucket`.
    pub fn in_default_collection(bucket: impl Into<String>, key: impl Into<Bytes>) -> Self {
        Self {
            bucket: bucket.into(),
            scope: DEFAULT_SCOPE.to_string(),
            collection: DEFAULT_COLLECTION.to_string(),
            key: key.into(),
        }
    }
}

/// Per-request information passed to the backend.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    /// The SASL-authenticated user, if any.
    pub username: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetResult {
    pub value: Bytes,
    pub flags: u32,
    pub datatype: u8,
    pub cas: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertRequest {
    pub id: DocumentId,
    pub value: Bytes,
    pub flags: u32,
    pub datatype: u8,
    pub expiry: Option<SystemTime>,
    /// Required current CAS.
    pub cas: Option<u64>,
    pub durability: Option<DurabilityRequirement>,
    pub preserve_ttl: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoveRequest {
    pub id: DocumentId,
    pub cas: Option<u64>,
    pub durability: Option<DurabilityRequirement>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutationResult {
    pub cas: u64,
}

/// Failures reported by a backend.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("document not found")]
    NotFound,

    #[error("document exists or CAS mismatch")]
    Exists,

    #[error("document is locked")]
    Locked,

    #[error("access denied")]
    AccessDenied,

    #[error("no such bucket: {0}")]
    NoBucket(String),

    #[error("unknown collection: {0}")]
    UnknownCollection(String),

    #[error("value of {size} bytes exceeds the {max} byte limit")]
    ValueTooLarge { size: usize, max: usize },

    #[error("durability requirement cannot be satisfied")]
    DurabilityImpossible,

    #[error("durable write outcome is ambiguous")]
    Ambiguous,

    #[error("backend request timed out")]
    Timeout,

    #[error("backend transport error: {0}")]
    Transport(String),

    #[error("backend internal error: {0}")]
    Internal(String),
}

impl BackendError {
    /// The closest legacy status for this error.
    pub fn status(&self) -> Status {
        match self {
            BackendError::NotFound => Status::KEY_ENOENT,
            BackendError::Exists => Status::KEY_EEXISTS,
            BackendError::Locked => Status::LOCKED,
            BackendError::AccessDenied => Status::EACCESS,
            BackendError::NoBucket(_) => Status::NO_BUCKET,
            BackendError::UnknownCollection(_) => Status::UNKNOWN_COLLECTION,
            BackendError::ValueTooLarge { .. } => Status::E2BIG,
            BackendError::DurabilityImpossible => Status::DURABILITY_IMPOSSIBLE,
            BackendError::Ambiguous => Status::SYNC_WRITE_AMBIGUOUS,
            BackendError::Timeout => Status::ETMPFAIL,
            BackendError::Transport(_) | BackendError::Internal(_) => Status::EINTERNAL,
        }
    }
}

/// Document operations the bridge needs from the backend.
#[async_trait]
pub trait KvBackend: Send + Sync {
    async fn get(&self, ctx: &RequestContext, id: &DocumentId) -> Result<GetResult, BackendError>;

    async fn upsert(
        &self,
        ctx: &RequestContext,
        request: UpsertRequest,
    ) -> Result<MutationResult, BackendError>;

    async fn remove(
        &self,
        ctx: &RequestContext,
        request: RemoveRequest,
    ) -> Result<MutationResult, BackendError>;
}

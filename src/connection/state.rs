//! Per-connection protocol state.

use super::registry::ConnId;
use crate::auth::SaslNegotiator;
use crate::protocol::FeatureSet;
use std::fmt;

/// Where a connection is in its lifecycle.
///
/// These are soft states: no opcode is refused because of them, with the
/// exception of CRUD before a bucket is selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Bootstrapping,
    Authenticating,
    Authenticated,
    BucketSelected,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Bootstrapping => "bootstrapping",
            Phase::Authenticating => "authenticating",
            Phase::Authenticated => "authenticated",
            Phase::BucketSelected => "bucket-selected",
        };
        f.write_str(name)
    }
}

/// State owned by one connection task. Nothing else mutates it.
#[derive(Debug)]
pub struct ConnectionState {
    pub id: ConnId,
    /// Host the client connected to, used to mark `thisNode` in configs.
    pub local_host: Option<String>,
    /// Client name from HELLO.
    pub client_name: Option<String>,
    pub features: FeatureSet,
    pub bucket: Option<String>,
    /// Set only after a completed SASL exchange.
    pub user: Option<String>,
    pub sasl: SaslNegotiator,
}

impl ConnectionState {
    pub fn new(id: ConnId) -> Self {
        Self {
            id,
            local_host: None,
            client_name: None,
            features: FeatureSet::empty(),
            bucket: None,
            user: None,
            sasl: SaslNegotiator::new(),
        }
    }

    pub fn with_local_host(mut self, host: impl Into<String>) -> Self {
        self.local_host = Some(host.into());
        self
    }

    pub fn with_sasl(mut self, sasl: SaslNegotiator) -> Self {
        self.sasl = sasl;
        self
    }

    pub fn phase(&self) -> Phase {
        if self.bucket.is_some() {
            Phase::BucketSelected
        } else if self.sasl.has_pending() {
            Phase::Authenticating
        } else if self.user.is_some() {
            Phase::Authenticated
        } else {
            Phase::Bootstrapping
        }
    }
}

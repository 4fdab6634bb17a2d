//! SASL mechanism negotiation.
//!
//! Each connection owns one [`SaslNegotiator`]. It advertises the supported
//! mechanisms, starts SCRAM exchanges on `SASL_AUTH` and finishes them on
//! `SASL_STEP`. At most one exchange is pending at a time.

use super::credentials::CredentialSource;
use super::scram::{ScramError, ScramHash, ScramServer};
use crate::protocol::Status;
use thiserror::Error;
use tracing::debug;

/// Mechanisms advertised by `SASL_LIST_MECHS`, in wire order.
pub const MECHANISMS: [&str; 4] = ["PLAIN", "SCRAM-SHA1", "SCRAM-SHA256", "SCRAM-SHA512"];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SaslError {
    #[error("PLAIN authentication is not supported")]
    PlainNotSupported,

    #[error("unknown mechanism: {0}")]
    UnknownMechanism(String),

    #[error("SASL payload is not valid UTF-8")]
    InvalidPayload,

    #[error("unknown user: {0}")]
    UnknownUser(String),

    #[error("an exchange is already pending")]
    ExchangeAlreadyPending,

    #[error("no exchange is pending")]
    NoPendingExchange,

    #[error("mechanism {requested} does not match pending {pending}")]
    MechanismMismatch {
        pending: &'static str,
        requested: String,
    },

    #[error(transparent)]
    Scram(#[from] ScramError),
}

impl SaslError {
    /// Status code reported to the client.
    pub fn status(&self) -> Status {
        match self {
            SaslError::PlainNotSupported => Status::EINVAL,
            _ => Status::AUTH_ERROR,
        }
    }
}

/// Result of a completed exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authenticated {
    pub username: String,
    pub server_final: String,
}

#[derive(Debug)]
struct PendingExchange {
    username: String,
    engine: ScramServer,
}

/// Per-connection SASL state.
#[derive(Debug)]
pub struct SaslNegotiator {
    pending: Option<PendingExchange>,
    new_engine: fn(ScramHash) -> ScramServer,
}

impl SaslNegotiator {
    pub fn new() -> Self {
        Self::with_engine_factory(ScramServer::new)
    }

    /// Uses `factory` to create the SCRAM engine for each exchange.
    pub fn with_engine_factory(factory: fn(ScramHash) -> ScramServer) -> Self {
        Self {
            pending: None,
            new_engine: factory,
        }
    }

    /// The space-separated mechanism list.
    pub fn list_mechanisms() -> String {
        MECHANISMS.join(" ")
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Handles `SASL_AUTH`. On success returns the server-first message.
    pub fn auth(
        &mut self,
        mechanism: &str,
        payload: &[u8],
        credentials: &dyn CredentialSource,
    ) -> Result<String, SaslError> {
        if self.pending.take().is_some() {
            debug!(mechanism, "SASL auth while an exchange is pending");
            return Err(SaslError::ExchangeAlreadyPending);
        }

        if mechanism == "PLAIN" {
            return Err(SaslError::PlainNotSupported);
        }
        let hash = ScramHash::from_mechanism(mechanism)
            .ok_or_else(|| SaslError::UnknownMechanism(mechanism.to_string()))?;
        let client_first = std::str::from_utf8(payload).map_err(|_| SaslError::InvalidPayload)?;

        let mut engine = (self.new_engine)(hash);
        let (username, server_first) = engine.start(client_first)?;
        let password = credentials
            .password_for(&username)
            .ok_or_else(|| SaslError::UnknownUser(username.clone()))?;
        engine.set_password(&password)?;

        debug!(mechanism, user = %username, "SASL exchange started");
        self.pending = Some(PendingExchange { username, engine });
        Ok(server_first)
    }

    /// Handles `SASL_STEP`. The pending exchange is dropped whatever the outcome.
    pub fn step(&mut self, mechanism: &str, payload: &[u8]) -> Result<Authenticated, SaslError> {
        let PendingExchange {
            username,
            mut engine,
        } = self.pending.take().ok_or(SaslError::NoPendingExchange)?;

        let pending = engine.hash().mechanism();
        if mechanism != pending {
            return Err(SaslError::MechanismMismatch {
                pending,
                requested: mechanism.to_string(),
            });
        }
        let client_final = std::str::from_utf8(payload).map_err(|_| SaslError::InvalidPayload)?;

        let server_final = engine.step(client_final)?;
        debug!(mechanism, user = %username, "SASL exchange completed");
        Ok(Authenticated {
            username,
            server_final,
        })
    }
}

impl Default for SaslNegotiator {
    fn default() -> Self {
        Self::new()
    }
}

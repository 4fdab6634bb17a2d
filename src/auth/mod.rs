//! Authentication
//!
//! Legacy clients authenticate with SASL before touching data:
//!
//! ```text
//! Client                                   Bridge
//!   │  SASL_LIST_MECHS                       │
//!   │ ─────────────────────────────────────> │
//!   │  "PLAIN SCRAM-SHA1 SCRAM-SHA256 ..."   │
//!   │ <───────────────────────────────────── │
//!   │  SASL_AUTH  SCRAM-SHA512 client-first  │
//!   │ ─────────────────────────────────────> │
//!   │  AUTH_CONTINUE  server-first           │
//!   │ <───────────────────────────────────── │
//!   │  SASL_STEP  SCRAM-SHA512 client-final  │
//!   │ ─────────────────────────────────────> │
//!   │  SUCCESS  server-final                 │
//!   │ <───────────────────────────────────── │
//! ```
//!
//! ## Modules
//!
//! - `scram`: the SCRAM server exchange
//! - `sasl`: mechanism negotiation, one pending exchange per connection
//! - `credentials`: password lookup

pub mod credentials;
pub mod sasl;
pub mod scram;

pub use credentials::{CredentialSource, StaticCredentials};
pub use sasl::{Authenticated, SaslError, SaslNegotiator, MECHANISMS};
pub use scram::{ScramError, ScramHash, ScramServer, ITERATION_COUNT};

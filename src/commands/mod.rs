//! Command Translation Module
//!
//! Executes decoded requests for one connection. Bootstrap and SASL opcodes
//! are answered from connection state; document opcodes are forwarded to the
//! backend.
//!
//! ## Architecture
//!
//! ```text
//! Client Request
//!       │
//!       ▼
//! ┌─────────────────┐
//! │  PacketCodec    │  (protocol module)
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌───────────────────┐
//! │ CommandTranslator │  (this module)
//! │                   │
//! │  - Dispatch       │
//! │  - Validate       │
//! │  - Map errors     │
//! └────────┬──────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │   KvBackend     │  (backend module)
//! └─────────────────┘
//! ```

pub mod handler;

pub use handler::{CommandTranslator, DEFAULT_REQUEST_TIMEOUT};

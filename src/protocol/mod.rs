//! Binary Protocol Implementation
//!
//! This module implements the legacy binary key-value protocol spoken by
//! memcached-style clients, including the extensions those clients negotiate
//! with HELLO (alternative framing, collections, JSON datatype).
//!
//! ## Modules
//!
//! - `types`: `Packet`, `Magic`, `Opcode`, HELLO features
//! - `parser`: `PacketCodec`, the incremental decoder and encoder
//! - `frames`: framing extras and LEB128 collection ids
//! - `status`: status codes and the error map document
//!
//! ## Example
//!
//! ```
//! use kvbridge::protocol::{Opcode, Packet, PacketCodec, Status};
//!
//! let codec = PacketCodec::new();
//! let request = Packet::request(Opcode::Get).with_key("name").with_opaque(42);
//!
//! // Responses always echo the request opaque
//! let response = Packet::response_to(&request, Status::KEY_ENOENT);
//! let bytes = codec.encode(&response).unwrap();
//! assert_eq!(&bytes[12..16], &42u32.to_be_bytes());
//! ```

pub mod frames;
pub mod parser;
pub mod status;
pub mod types;

// Re-export commonly used types for convenience
pub use frames::{DurabilityLevel, DurabilityRequirement, FrameInfo};
pub use parser::{EncodeError, PacketCodec, ParseError, ParseResult, MAX_BODY_SIZE};
pub use status::Status;
pub use types::{datatype, FeatureSet, HelloFeature, Magic, Opcode, Packet, HEADER_LEN};

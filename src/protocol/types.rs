//! Binary Protocol Data Types
//!
//! This module defines the data types carried by the legacy binary key-value
//! protocol: magic bytes, opcodes, datatype bits, HELLO features and the
//! [`Packet`] itself.
//!
//! ## Header Layout
//!
//! Every packet starts with a fixed 24-byte header in network byte order:
//!
//! ```text
//!   Byte/     0       |       1       |       2       |       3       |
//!      /              |               |               |               |
//!     |0 1 2 3 4 5 6 7|0 1 2 3 4 5 6 7|0 1 2 3 4 5 6 7|0 1 2 3 4 5 6 7|
//!     +---------------+---------------+---------------+---------------+
//!    0| Magic         | Opcode        | Key length                    |
//!     +---------------+---------------+---------------+---------------+
//!    4| Extras length | Data type     | vbucket id / status           |
//!     +---------------+---------------+---------------+---------------+
//!    8| Total body length                                             |
//!     +---------------+---------------+---------------+---------------+
//!   12| Opaque                                                        |
//!     +---------------+---------------+---------------+---------------+
//!   16| CAS                                                           |
//!     |                                                               |
//!     +---------------+---------------+---------------+---------------+
//! ```
//!
//! With the alternative magics (`0x08` / `0x18`) the key length field is split
//! into a one-byte framing extras length followed by a one-byte key length.
//! The body is `framing extras || extras || key || value`.

use crate::protocol::frames::FrameInfo;
use crate::protocol::status::Status;
use bitflags::bitflags;
use bytes::Bytes;
use std::fmt;

/// Size of the fixed packet header.
pub const HEADER_LEN: usize = 24;

/// Magic byte: the first byte of every packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Magic {
    #[default]
    Request,
    Response,
    AltRequest,
    AltResponse,
}

impl Magic {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x80 => Some(Magic::Request),
            0x81 => Some(Magic::Response),
            0x08 => Some(Magic::AltRequest),
            0x18 => Some(Magic::AltResponse),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            Magic::Request => 0x80,
            Magic::Response => 0x81,
            Magic::AltRequest => 0x08,
            Magic::AltResponse => 0x18,
        }
    }

    pub fn is_request(self) -> bool {
        matches!(self, Magic::Request | Magic::AltRequest)
    }

    /// True for the magics that carry framing extras.
    pub fn is_alt(self) -> bool {
        matches!(self, Magic::AltRequest | Magic::AltResponse)
    }

    /// The magic to use when framing extras are present.
    pub fn to_alt(self) -> Self {
        match self {
            Magic::Request | Magic::AltRequest => Magic::AltRequest,
            Magic::Response | Magic::AltResponse => Magic::AltResponse,
        }
    }

    /// The magic to use when there are no framing extras.
    pub fn to_classic(self) -> Self {
        match self {
            Magic::Request | Magic::AltRequest => Magic::Request,
            Magic::Response | Magic::AltResponse => Magic::Response,
        }
    }
}

/// Command opcodes.
///
/// The bridge handles a fixed set of commands; everything else decodes to
/// [`Opcode::Unknown`] and is answered with `UNKNOWN_COMMAND`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Get,
    Set,
    Delete,
    Hello,
    SaslListMechs,
    SaslAuth,
    SaslStep,
    SelectBucket,
    GetClusterConfig,
    GetErrorMap,
    Unknown(u8),
}

impl Opcode {
    pub fn from_byte(b: u8) -> Self {
        match b {
            0x00 => Opcode::Get,
            0x01 => Opcode::Set,
            0x04 => Opcode::Delete,
            0x1f => Opcode::Hello,
            0x20 => Opcode::SaslListMechs,
            0x21 => Opcode::SaslAuth,
            0x22 => Opcode::SaslStep,
            0x89 => Opcode::SelectBucket,
            0xb5 => Opcode::GetClusterConfig,
            0xfe => Opcode::GetErrorMap,
            other => Opcode::Unknown(other),
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            Opcode::Get => 0x00,
            Opcode::Set => 0x01,
            Opcode::Delete => 0x04,
            Opcode::Hello => 0x1f,
            Opcode::SaslListMechs => 0x20,
            Opcode::SaslAuth => 0x21,
            Opcode::SaslStep => 0x22,
            Opcode::SelectBucket => 0x89,
            Opcode::GetClusterConfig => 0xb5,
            Opcode::GetErrorMap => 0xfe,
            Opcode::Unknown(b) => b,
        }
    }

    /// Whether the key of this command addresses a document, and therefore
    /// carries a collection id prefix once collections are negotiated.
    pub fn is_document_keyed(self) -> bool {
        matches!(self, Opcode::Get | Opcode::Set | Opcode::Delete)
    }
}

impl Default for Opcode {
    fn default() -> Self {
        Opcode::Unknown(0xff)
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Opcode::Get => write!(f, "GET"),
            Opcode::Set => write!(f, "SET"),
            Opcode::Delete => write!(f, "DELETE"),
            Opcode::Hello => write!(f, "HELLO"),
            Opcode::SaslListMechs => write!(f, "SASL_LIST_MECHS"),
            Opcode::SaslAuth => write!(f, "SASL_AUTH"),
            Opcode::SaslStep => write!(f, "SASL_STEP"),
            Opcode::SelectBucket => write!(f, "SELECT_BUCKET"),
            Opcode::GetClusterConfig => write!(f, "GET_CLUSTER_CONFIG"),
            Opcode::GetErrorMap => write!(f, "GET_ERROR_MAP"),
            Opcode::Unknown(b) => write!(f, "UNKNOWN({:#04x})", b),
        }
    }
}

/// Datatype bits.
pub mod datatype {
    pub const RAW: u8 = 0x00;
    pub const JSON: u8 = 0x01;
    pub const SNAPPY: u8 = 0x02;
    pub const XATTR: u8 = 0x04;

    /// Every bit a client may legally set.
    pub const ALL: u8 = JSON | SNAPPY | XATTR;
}

/// Features a client may request with HELLO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HelloFeature {
    Datatype,
    Tls,
    TcpNoDelay,
    MutationSeqno,
    TcpDelay,
    Xattr,
    XError,
    SelectBucket,
    Snappy,
    Json,
    Duplex,
    ClustermapChangeNotification,
    UnorderedExecution,
    Tracing,
    AltRequests,
    SyncReplication,
    Collections,
    OpenTracing,
    PreserveTtl,
    VAttr,
    PointInTimeRecovery,
    SubdocCreateAsDeleted,
    SubdocDocumentMacroSupport,
    SubdocReplaceBodyWithXattr,
    ReportUnitUsage,
    NonBlockingThrottlingMode,
    SubdocReplicaRead,
    GetClusterConfigWithKnownVersion,
    DedupeNotMyVbucketClustermap,
    ClustermapChangeNotificationBrief,
}

impl HelloFeature {
    pub fn from_code(code: u16) -> Option<Self> {
        let feature = match code {
            0x01 => HelloFeature::Datatype,
            0x02 => HelloFeature::Tls,
            0x03 => HelloFeature::TcpNoDelay,
            0x04 => HelloFeature::MutationSeqno,
            0x05 => HelloFeature::TcpDelay,
            0x06 => HelloFeature::Xattr,
            0x07 => HelloFeature::XError,
            0x08 => HelloFeature::SelectBucket,
            0x0a => HelloFeature::Snappy,
            0x0b => HelloFeature::Json,
            0x0c => HelloFeature::Duplex,
            0x0d => HelloFeature::ClustermapChangeNotification,
            0x0e => HelloFeature::UnorderedExecution,
            0x0f => HelloFeature::Tracing,
            0x10 => HelloFeature::AltRequests,
            0x11 => HelloFeature::SyncReplication,
            0x12 => HelloFeature::Collections,
            0x13 => HelloFeature::OpenTracing,
            0x14 => HelloFeature::PreserveTtl,
            0x15 => HelloFeature::VAttr,
            0x16 => HelloFeature::PointInTimeRecovery,
            0x17 => HelloFeature::SubdocCreateAsDeleted,
            0x18 => HelloFeature::SubdocDocumentMacroSupport,
            0x19 => HelloFeature::SubdocReplaceBodyWithXattr,
            0x1a => HelloFeature::ReportUnitUsage,
            0x1b => HelloFeature::NonBlockingThrottlingMode,
            0x1c => HelloFeature::SubdocReplicaRead,
            0x1d => HelloFeature::GetClusterConfigWithKnownVersion,
            0x1e => HelloFeature::DedupeNotMyVbucketClustermap,
            0x1f => HelloFeature::ClustermapChangeNotificationBrief,
            _ => return None,
        };
        Some(feature)
    }

    pub fn code(self) -> u16 {
        match self {
            HelloFeature::Datatype => 0x01,
            HelloFeature::Tls => 0x02,
            HelloFeature::TcpNoDelay => 0x03,
            HelloFeature::MutationSeqno => 0x04,
            HelloFeature::TcpDelay => 0x05,
            HelloFeature::Xattr => 0x06,
            HelloFeature::XError => 0x07,
            HelloFeature::SelectBucket => 0x08,
            HelloFeature::Snappy => 0x0a,
            HelloFeature::Json => 0x0b,
            HelloFeature::Duplex => 0x0c,
            HelloFeature::ClustermapChangeNotification => 0x0d,
            HelloFeature::UnorderedExecution => 0x0e,
            HelloFeature::Tracing => 0x0f,
            HelloFeature::AltRequests => 0x10,
            HelloFeature::SyncReplication => 0x11,
            HelloFeature::Collections => 0x12,
            HelloFeature::OpenTracing => 0x13,
            HelloFeature::PreserveTtl => 0x14,
            HelloFeature::VAttr => 0x15,
            HelloFeature::PointInTimeRecovery => 0x16,
            HelloFeature::SubdocCreateAsDeleted => 0x17,
            HelloFeature::SubdocDocumentMacroSupport => 0x18,
            HelloFeature::SubdocReplaceBodyWithXattr => 0x19,
            HelloFeature::ReportUnitUsage => 0x1a,
            HelloFeature::NonBlockingThrottlingMode => 0x1b,
            HelloFeature::SubdocReplicaRead => 0x1c,
            HelloFeature::GetClusterConfigWithKnownVersion => 0x1d,
            HelloFeature::DedupeNotMyVbucketClustermap => 0x1e,
            HelloFeature::ClustermapChangeNotificationBrief => 0x1f,
        }
    }

    /// The feature flag this bridge implements for the feature, if any.
    pub fn supported_flag(self) -> Option<FeatureSet> {
        match self {
            HelloFeature::Datatype => Some(FeatureSet::DATATYPE),
            HelloFeature::TcpNoDelay => Some(FeatureSet::TCP_NODELAY),
            HelloFeature::XError => Some(FeatureSet::XERROR),
            HelloFeature::SelectBucket => Some(FeatureSet::SELECT_BUCKET),
            HelloFeature::Json => Some(FeatureSet::JSON),
            HelloFeature::AltRequests => Some(FeatureSet::ALT_REQUESTS),
            HelloFeature::SyncReplication => Some(FeatureSet::SYNC_REPLICATION),
            HelloFeature::Collections => Some(FeatureSet::COLLECTIONS),
            HelloFeature::GetClusterConfigWithKnownVersion => {
                Some(FeatureSet::CLUSTER_CONFIG_KNOWN_VERSION)
            }
            _ => None,
        }
    }
}

bitflags! {
    /// The set of negotiated features for a connection.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FeatureSet: u32 {
        const DATATYPE = 1 << 0;
        const TCP_NODELAY = 1 << 1;
        const XERROR = 1 << 2;
        const SELECT_BUCKET = 1 << 3;
        const JSON = 1 << 4;
        const ALT_REQUESTS = 1 << 5;
        const SYNC_REPLICATION = 1 << 6;
        const COLLECTIONS = 1 << 7;
        const CLUSTER_CONFIG_KNOWN_VERSION = 1 << 8;
    }
}

/// A single protocol packet, request or response.
///
/// The wire shares one 16-bit header field between the vbucket id (requests)
/// and the status (responses); the codec reads it into whichever of
/// [`Packet::vbucket`] and [`Packet::status`] the magic calls for.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Packet {
    pub magic: Magic,
    pub opcode: Opcode,
    pub datatype: u8,
    pub vbucket: u16,
    pub status: Status,
    pub opaque: u32,
    pub cas: u64,
    /// Collection id decoded from the key prefix (collections negotiated only)
    pub collection_id: Option<u32>,
    /// Set when a request key should carry a collection id but the prefix
    /// is missing or not valid LEB128. The key is left undecoded.
    pub invalid_collection_prefix: bool,
    pub frames: Vec<FrameInfo>,
    pub extras: Bytes,
    pub key: Bytes,
    pub value: Bytes,
}

impl Packet {
    /// Creates an empty request for the given opcode.
    pub fn request(opcode: Opcode) -> Self {
        Self {
            magic: Magic::Request,
            opcode,
            ..Default::default()
        }
    }

    /// Creates a response to `request`, echoing its opcode and opaque.
    pub fn response_to(request: &Packet, status: Status) -> Self {
        Self {
            magic: Magic::Response,
            opcode: request.opcode,
            status,
            opaque: request.opaque,
            ..Default::default()
        }
    }

    pub fn with_opaque(mut self, opaque: u32) -> Self {
        self.opaque = opaque;
        self
    }

    pub fn with_cas(mut self, cas: u64) -> Self {
        self.cas = cas;
        self
    }

    pub fn with_datatype(mut self, datatype: u8) -> Self {
        self.datatype = datatype;
        self
    }

    pub fn with_key(mut self, key: impl Into<Bytes>) -> Self {
        self.key = key.into();
        self
    }

    pub fn with_extras(mut self, extras: impl Into<Bytes>) -> Self {
        self.extras = extras.into();
        self
    }

    pub fn with_value(mut self, value: impl Into<Bytes>) -> Self {
        self.value = value.into();
        self
    }

    pub fn with_collection_id(mut self, cid: u32) -> Self {
        self.collection_id = Some(cid);
        self
    }

    pub fn with_frame(mut self, frame: FrameInfo) -> Self {
        self.frames.push(frame);
        self
    }

    /// Returns the key as UTF-8, if it is valid.
    pub fn key_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.key).ok()
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} opaque={:#x} key={}B extras={}B value={}B",
            self.opcode,
            self.opaque,
            self.key.len(),
            self.extras.len(),
            self.value.len()
        )?;
        if !self.magic.is_request() {
            write!(f, " status={}", self.status)?;
        }
        Ok(())
    }
}

//! Response status codes and the error map.
//!
//! The status table below is what GET_ERROR_MAP serves to clients. Attributes
//! follow the error map conventions so clients can decide how to react to a
//! status they have never seen before.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// A response status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Status(pub u16);

impl Status {
    pub const SUCCESS: Status = Status(0x0000);
    pub const KEY_ENOENT: Status = Status(0x0001);
    pub const KEY_EEXISTS: Status = Status(0x0002);
    pub const E2BIG: Status = Status(0x0003);
    pub const EINVAL: Status = Status(0x0004);
    pub const NOT_STORED: Status = Status(0x0005);
    pub const DELTA_BADVAL: Status = Status(0x0006);
    pub const NOT_MY_VBUCKET: Status = Status(0x0007);
    pub const NO_BUCKET: Status = Status(0x0008);
    pub const LOCKED: Status = Status(0x0009);
    pub const DCP_STREAMID_INVALID: Status = Status(0x000c);
    pub const AUTH_STALE: Status = Status(0x001f);
    pub const AUTH_ERROR: Status = Status(0x0020);
    pub const AUTH_CONTINUE: Status = Status(0x0021);
    pub const ERANGE: Status = Status(0x0022);
    pub const ROLLBACK: Status = Status(0x0023);
    pub const EACCESS: Status = Status(0x0024);
    pub const NOT_INITIALIZED: Status = Status(0x0025);
    pub const RATE_LIMITED_NETWORK_INGRESS: Status = Status(0x0030);
    pub const RATE_LIMITED_NETWORK_EGRESS: Status = Status(0x0031);
    pub const RATE_LIMITED_MAX_CONNECTIONS: Status = Status(0x0032);
    pub const RATE_LIMITED_MAX_COMMANDS: Status = Status(0x0033);
    pub const SCOPE_SIZE_LIMIT_EXCEEDED: Status = Status(0x0034);
    pub const UNKNOWN_FRAME_INFO: Status = Status(0x0080);
    pub const UNKNOWN_COMMAND: Status = Status(0x0081);
    pub const ENOMEM: Status = Status(0x0082);
    pub const NOT_SUPPORTED: Status = Status(0x0083);
    pub const EINTERNAL: Status = Status(0x0084);
    pub const EBUSY: Status = Status(0x0085);
    pub const ETMPFAIL: Status = Status(0x0086);
    pub const XATTR_EINVAL: Status = Status(0x0087);
    pub const UNKNOWN_COLLECTION: Status = Status(0x0088);
    pub const NO_COLLECTIONS_MANIFEST: Status = Status(0x0089);
    pub const CANNOT_APPLY_COLLECTIONS_MANIFEST: Status = Status(0x008a);
    pub const COLLECTIONS_MANIFEST_IS_AHEAD: Status = Status(0x008b);
    pub const UNKNOWN_SCOPE: Status = Status(0x008c);
    pub const DCP_STREAMID_INVALID_COMBINATION: Status = Status(0x008d);
    pub const DURABILITY_INVALID_LEVEL: Status = Status(0x00a0);
    pub const DURABILITY_IMPOSSIBLE: Status = Status(0x00a1);
    pub const SYNC_WRITE_IN_PROGRESS: Status = Status(0x00a2);
    pub const SYNC_WRITE_AMBIGUOUS: Status = Status(0x00a3);
    pub const SYNC_WRITE_RE_COMMIT_IN_PROGRESS: Status = Status(0x00a4);
    pub const SUBDOC_PATH_ENOENT: Status = Status(0x00c0);
    pub const SUBDOC_PATH_MISMATCH: Status = Status(0x00c1);
    pub const SUBDOC_PATH_EINVAL: Status = Status(0x00c2);
    pub const SUBDOC_PATH_E2BIG: Status = Status(0x00c3);
    pub const SUBDOC_DOC_E2DEEP: Status = Status(0x00c4);
    pub const SUBDOC_VALUE_CANTINSERT: Status = Status(0x00c5);
    pub const SUBDOC_DOC_NOTJSON: Status = Status(0x00c6);
    pub const SUBDOC_NUM_ERANGE: Status = Status(0x00c7);
    pub const SUBDOC_DELTA_EINVAL: Status = Status(0x00c8);
    pub const SUBDOC_PATH_EEXISTS: Status = Status(0x00c9);
    pub const SUBDOC_VALUE_ETOODEEP: Status = Status(0x00ca);
    pub const SUBDOC_INVALID_COMBO: Status = Status(0x00cb);
    pub const SUBDOC_MULTI_PATH_FAILURE: Status = Status(0x00cc);
    pub const SUBDOC_SUCCESS_DELETED: Status = Status(0x00cd);
    pub const SUBDOC_XATTR_INVALID_FLAG_COMBO: Status = Status(0x00ce);
    pub const SUBDOC_XATTR_INVALID_KEY_COMBO: Status = Status(0x00cf);
    pub const SUBDOC_XATTR_UNKNOWN_MACRO: Status = Status(0x00d0);
    pub const SUBDOC_XATTR_UNKNOWN_VATTR: Status = Status(0x00d1);
    pub const SUBDOC_XATTR_CANT_MODIFY_VATTR: Status = Status(0x00d2);
    pub const SUBDOC_MULTI_PATH_FAILURE_DELETED: Status = Status(0x00d3);
    pub const SUBDOC_INVALID_XATTR_ORDER: Status = Status(0x00d4);
    pub const SUBDOC_XATTR_UNKNOWN_VATTR_MACRO: Status = Status(0x00d5);
    pub const SUBDOC_CAN_ONLY_REVIVE_DELETED_DOCUMENTS: Status = Status(0x00d6);
    pub const SUBDOC_DELETED_DOCUMENT_CANT_HAVE_VALUE: Status = Status(0x00d7);

    pub fn code(self) -> u16 {
        self.0
    }

    pub fn is_success(self) -> bool {
        self == Status::SUCCESS
    }

    /// Looks up the table entry for this status.
    pub fn info(self) -> Option<&'static StatusInfo> {
        STATUS_TABLE.iter().find(|info| info.status == self)
    }

    /// The symbolic name, or `UNKNOWN` for codes outside the table.
    pub fn name(self) -> &'static str {
        self.info().map(|i| i.name).unwrap_or("UNKNOWN")
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({:#06x})", self.name(), self.0)
    }
}

/// One row of the status table.
#[derive(Debug, Clone, Copy)]
pub struct StatusInfo {
    pub status: Status,
    pub name: &'static str,
    pub desc: &'static str,
    pub attrs: &'static [&'static str],
}

const fn row(
    status: Status,
    name: &'static str,
    desc: &'static str,
    attrs: &'static [&'static str],
) -> StatusInfo {
    StatusInfo {
        status,
        name,
        desc,
        attrs,
    }
}

/// Every status the error map describes.
pub static STATUS_TABLE: &[StatusInfo] = &[
    row(Status::SUCCESS, "SUCCESS", "Success", &["success"]),
    row(Status::KEY_ENOENT, "KEY_ENOENT", "Not Found", &["item-only"]),
    row(Status::KEY_EEXISTS, "KEY_EEXISTS", "key already exists, or CAS mismatch", &["item-only"]),
    row(Status::E2BIG, "E2BIG", "Value is too big", &["invalid-input"]),
    row(Status::EINVAL, "EINVAL", "Invalid packet", &["internal", "invalid-input"]),
    row(Status::NOT_STORED, "NOT_STORED", "Not Stored", &["item-only"]),
    row(Status::DELTA_BADVAL, "DELTA_BADVAL", "Existing document not a number", &["invalid-input"]),
    row(
        Status::NOT_MY_VBUCKET,
        "NOT_MY_VBUCKET",
        "Server does not know about this vBucket",
        &["fetch-config", "invalid-input"],
    ),
    row(Status::NO_BUCKET, "NO_BUCKET", "Not connected to a bucket", &["conn-state-invalidated"]),
    row(
        Status::LOCKED,
        "LOCKED",
        "Requested resource is locked",
        &["item-locked", "item-only", "retry-now"],
    ),
    row(
        Status::DCP_STREAMID_INVALID,
        "DCP_STREAMID_INVALID",
        "Invalid DCP stream ID",
        &["dcp", "invalid-input"],
    ),
    row(
        Status::AUTH_STALE,
        "AUTH_STALE",
        "Authentication context is stale. Should reauthenticate",
        &["auth", "conn-state-invalidated"],
    ),
    row(
        Status::AUTH_ERROR,
        "AUTH_ERROR",
        "Authentication failed",
        &["auth", "conn-state-invalidated"],
    ),
    row(
        Status::AUTH_CONTINUE,
        "AUTH_CONTINUE",
        "Continue authentication",
        &["auth", "special-handling"],
    ),
    row(Status::ERANGE, "ERANGE", "Requested value outside range", &["invalid-input"]),
    row(Status::ROLLBACK, "ROLLBACK", "Rollback", &["dcp"]),
    row(Status::EACCESS, "EACCESS", "No access", &["auth"]),
    row(
        Status::NOT_INITIALIZED,
        "NOT_INITIALIZED",
        "Node not initialized",
        &["conn-state-invalidated", "retry-later", "temp"],
    ),
    row(
        Status::RATE_LIMITED_NETWORK_INGRESS,
        "RATE_LIMITED_NETWORK_INGRESS",
        "The tenant exceeded network ingress limit",
        &["rate-limit"],
    ),
    row(
        Status::RATE_LIMITED_NETWORK_EGRESS,
        "RATE_LIMITED_NETWORK_EGRESS",
        "The tenant exceeded network egress limit",
        &["rate-limit"],
    ),
    row(
        Status::RATE_LIMITED_MAX_CONNECTIONS,
        "RATE_LIMITED_MAX_CONNECTIONS",
        "The tenant exceeded max number of connections",
        &["rate-limit"],
    ),
    row(
        Status::RATE_LIMITED_MAX_COMMANDS,
        "RATE_LIMITED_MAX_COMMANDS",
        "The tenant exceeded max number of commands",
        &["rate-limit"],
    ),
    row(
        Status::SCOPE_SIZE_LIMIT_EXCEEDED,
        "SCOPE_SIZE_LIMIT_EXCEEDED",
        "The tenant exceeded data size limit in scope",
        &["rate-limit"],
    ),
    row(
        Status::UNKNOWN_FRAME_INFO,
        "UNKNOWN_FRAME_INFO",
        "Unknown frame info identifier encountered",
        &["invalid-input"],
    ),
    row(Status::UNKNOWN_COMMAND, "UNKNOWN_COMMAND", "Unknown command", &["support"]),
    row(Status::ENOMEM, "ENOMEM", "Out of memory", &["retry-later", "temp"]),
    row(Status::NOT_SUPPORTED, "NOT_SUPPORTED", "Command isn't supported", &["support"]),
    row(Status::EINTERNAL, "EINTERNAL", "Internal error", &["internal"]),
    row(Status::EBUSY, "EBUSY", "Server too busy", &["retry-later", "temp"]),
    row(Status::ETMPFAIL, "ETMPFAIL", "Temporary failure", &["retry-later", "temp"]),
    row(
        Status::XATTR_EINVAL,
        "XATTR_EINVAL",
        "There is something wrong with the syntax of the provided XATTR",
        &["invalid-input"],
    ),
    row(
        Status::UNKNOWN_COLLECTION,
        "UNKNOWN_COLLECTION",
        "Operation attempted with an unknown collection",
        &["fetch-config", "item-only"],
    ),
    row(
        Status::NO_COLLECTIONS_MANIFEST,
        "NO_COLLECTIONS_MANIFEST",
        "No collections manifest has been set",
        &["support"],
    ),
    row(
        Status::CANNOT_APPLY_COLLECTIONS_MANIFEST,
        "CANNOT_APPLY_COLLECTIONS_MANIFEST",
        "Cannot apply collections manifest",
        &["invalid-input"],
    ),
    row(
        Status::COLLECTIONS_MANIFEST_IS_AHEAD,
        "COLLECTIONS_MANIFEST_IS_AHEAD",
        "Collections manifest is ahead of the node",
        &["fetch-config", "retry-later"],
    ),
    row(
        Status::UNKNOWN_SCOPE,
        "UNKNOWN_SCOPE",
        "Operation attempted with an unknown scope",
        &["fetch-config", "item-only"],
    ),
    row(
        Status::DCP_STREAMID_INVALID_COMBINATION,
        "DCP_STREAMID_INVALID_COMBINATION",
        "Invalid combination of DCP stream ID and stream request",
        &["dcp", "invalid-input"],
    ),
    row(
        Status::DURABILITY_INVALID_LEVEL,
        "DURABILITY_INVALID_LEVEL",
        "Invalid durability level specified",
        &["invalid-input", "item-only"],
    ),
    row(
        Status::DURABILITY_IMPOSSIBLE,
        "DURABILITY_IMPOSSIBLE",
        "The requested durability requirements are impossible",
        &["item-only"],
    ),
    row(
        Status::SYNC_WRITE_IN_PROGRESS,
        "SYNC_WRITE_IN_PROGRESS",
        "The requested key has a synchronous write in progress",
        &["item-only", "retry-later"],
    ),
    row(
        Status::SYNC_WRITE_AMBIGUOUS,
        "SYNC_WRITE_AMBIGUOUS",
        "The SyncWrite request has not completed in the specified time and has ambiguous result",
        &["item-only"],
    ),
    row(
        Status::SYNC_WRITE_RE_COMMIT_IN_PROGRESS,
        "SYNC_WRITE_RE_COMMIT_IN_PROGRESS",
        "The SyncWrite is being re-committed after a change in active node",
        &["item-only", "retry-later"],
    ),
    row(
        Status::SUBDOC_PATH_ENOENT,
        "SUBDOC_PATH_ENOENT",
        "Subdoc: Path not does not exist",
        &["item-only", "subdoc"],
    ),
    row(
        Status::SUBDOC_PATH_MISMATCH,
        "SUBDOC_PATH_MISMATCH",
        "Subdoc: Path mismatch",
        &["item-only", "subdoc"],
    ),
    row(
        Status::SUBDOC_PATH_EINVAL,
        "SUBDOC_PATH_EINVAL",
        "Subdoc: Invalid path",
        &["invalid-input", "item-only", "subdoc"],
    ),
    row(
        Status::SUBDOC_PATH_E2BIG,
        "SUBDOC_PATH_E2BIG",
        "Subdoc: Path too large",
        &["invalid-input", "subdoc"],
    ),
    row(
        Status::SUBDOC_DOC_E2DEEP,
        "SUBDOC_DOC_E2DEEP",
        "Subdoc: Document too deep",
        &["item-only", "subdoc"],
    ),
    row(
        Status::SUBDOC_VALUE_CANTINSERT,
        "SUBDOC_VALUE_CANTINSERT",
        "Subdoc: Cannot insert specified value",
        &["invalid-input", "item-only", "subdoc"],
    ),
    row(
        Status::SUBDOC_DOC_NOTJSON,
        "SUBDOC_DOC_NOTJSON",
        "Subdoc: Existing document not JSON",
        &["item-only", "subdoc"],
    ),
    row(
        Status::SUBDOC_NUM_ERANGE,
        "SUBDOC_NUM_ERANGE",
        "Subdoc: Existing number outside valid arithmetic range",
        &["item-only", "subdoc"],
    ),
    row(
        Status::SUBDOC_DELTA_EINVAL,
        "SUBDOC_DELTA_EINVAL",
        "Subdoc: Invalid delta specified",
        &["invalid-input", "item-only", "subdoc"],
    ),
    row(
        Status::SUBDOC_PATH_EEXISTS,
        "SUBDOC_PATH_EEXISTS",
        "Subdoc: Specified path already exists",
        &["item-only", "subdoc"],
    ),
    row(
        Status::SUBDOC_VALUE_ETOODEEP,
        "SUBDOC_VALUE_ETOODEEP",
        "Subdoc: Inserting value would make document too deep",
        &["invalid-input", "item-only", "subdoc"],
    ),
    row(
        Status::SUBDOC_INVALID_COMBO,
        "SUBDOC_INVALID_COMBO",
        "Subdoc: Invalid combination for multi-mutation",
        &["invalid-input", "subdoc"],
    ),
    row(
        Status::SUBDOC_MULTI_PATH_FAILURE,
        "SUBDOC_MULTI_PATH_FAILURE",
        "Subdoc: One or more paths in a multi-path command failed",
        &["item-only", "subdoc"],
    ),
    row(
        Status::SUBDOC_SUCCESS_DELETED,
        "SUBDOC_SUCCESS_DELETED",
        "Subdoc: The operation completed successfully, but operated on a deleted document",
        &["item-deleted", "subdoc", "success"],
    ),
    row(
        Status::SUBDOC_XATTR_INVALID_FLAG_COMBO,
        "SUBDOC_XATTR_INVALID_FLAG_COMBO",
        "Subdoc: Invalid combination of xattr flags",
        &["invalid-input", "subdoc"],
    ),
    row(
        Status::SUBDOC_XATTR_INVALID_KEY_COMBO,
        "SUBDOC_XATTR_INVALID_KEY_COMBO",
        "Subdoc: Invalid combination of xattr keys",
        &["invalid-input", "subdoc"],
    ),
    row(
        Status::SUBDOC_XATTR_UNKNOWN_MACRO,
        "SUBDOC_XATTR_UNKNOWN_MACRO",
        "Subdoc: Unknown xattr macro",
        &["invalid-input", "subdoc"],
    ),
    row(
        Status::SUBDOC_XATTR_UNKNOWN_VATTR,
        "SUBDOC_XATTR_UNKNOWN_VATTR",
        "Subdoc: Unknown xattr virtual attribute",
        &["invalid-input", "subdoc"],
    ),
    row(
        Status::SUBDOC_XATTR_CANT_MODIFY_VATTR,
        "SUBDOC_XATTR_CANT_MODIFY_VATTR",
        "Subdoc: Cannot modify virtual attributes",
        &["invalid-input", "subdoc"],
    ),
    row(
        Status::SUBDOC_MULTI_PATH_FAILURE_DELETED,
        "SUBDOC_MULTI_PATH_FAILURE_DELETED",
        "Subdoc: One or more paths in a multi-path command failed on a deleted document",
        &["item-deleted", "item-only", "subdoc"],
    ),
    row(
        Status::SUBDOC_INVALID_XATTR_ORDER,
        "SUBDOC_INVALID_XATTR_ORDER",
        "Subdoc: Invalid XATTR order (xattrs should come first)",
        &["invalid-input", "subdoc"],
    ),
    row(
        Status::SUBDOC_XATTR_UNKNOWN_VATTR_MACRO,
        "SUBDOC_XATTR_UNKNOWN_VATTR_MACRO",
        "Subdoc: The virtual attribute macro is unknown",
        &["invalid-input", "subdoc"],
    ),
    row(
        Status::SUBDOC_CAN_ONLY_REVIVE_DELETED_DOCUMENTS,
        "SUBDOC_CAN_ONLY_REVIVE_DELETED_DOCUMENTS",
        "Subdoc: Only deleted documents can be revived",
        &["invalid-input", "subdoc"],
    ),
    row(
        Status::SUBDOC_DELETED_DOCUMENT_CANT_HAVE_VALUE,
        "SUBDOC_DELETED_DOCUMENT_CANT_HAVE_VALUE",
        "Subdoc: A deleted document can't have a user value",
        &["invalid-input", "subdoc"],
    ),
];

/// Error map versions GET_ERROR_MAP accepts.
pub const SUPPORTED_ERROR_MAP_VERSIONS: std::ops::RangeInclusive<u16> = 1..=2;

/// Version declared by the served document.
pub const ERROR_MAP_VERSION: u16 = 1;

/// Revision of the served document; bump when the table changes.
pub const ERROR_MAP_REVISION: u32 = 1;

#[derive(Serialize)]
struct ErrorMapEntry {
    name: &'static str,
    desc: &'static str,
    attrs: &'static [&'static str],
}

#[derive(Serialize)]
struct ErrorMap {
    version: u16,
    revision: u32,
    errors: BTreeMap<String, ErrorMapEntry>,
}

/// Renders the error map document served by GET_ERROR_MAP.
///
/// Keys are lower-case hex status codes without a prefix, as clients expect.
pub fn error_map_json() -> Result<Vec<u8>, serde_json::Error> {
    let errors = STATUS_TABLE
        .iter()
        .map(|info| {
            (
                format!("{:x}", info.status.0),
                ErrorMapEntry {
                    name: info.name,
                    desc: info.desc,
                    attrs: info.attrs,
                },
            )
        })
        .collect();

    serde_json::to_vec(&ErrorMap {
        version: ERROR_MAP_VERSION,
        revision: ERROR_MAP_REVISION,
        errors,
    })
}

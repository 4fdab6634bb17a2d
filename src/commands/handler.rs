//! Command Translator
//!
//! Turns each request packet into exactly one response packet. Bootstrap and
//! SASL opcodes are answered locally; GET, SET and DELETE become one backend
//! call each.
//!
//! ## Supported Opcodes
//!
//! ### Bootstrap
//! - `HELLO` - negotiate features, record the client name
//! - `GET_ERROR_MAP` - the status description table
//! - `GET_CLUSTER_CONFIG` - terse cluster/bucket config
//! - `SELECT_BUCKET` - choose the bucket for CRUD
//!
//! ### SASL
//! - `SASL_LIST_MECHS`, `SASL_AUTH`, `SASL_STEP`
//!
//! ### CRUD
//! - `GET` - reply extras carry the 4-byte flags
//! - `SET` - extras are flags(4) + expiry(4), non-zero CAS is a precondition
//! - `DELETE` - non-zero CAS is a precondition
//!
//! Everything else gets `UNKNOWN_COMMAND`.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    CommandTranslator                        │
//! │                                                             │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐     │
//! │  │  execute()  │───>│  cmd_*()    │───>│ KvBackend   │     │
//! │  └─────────────┘    └─────────────┘    └─────────────┘     │
//! │         │                  │                                │
//! │         │             Rejection ──> error response          │
//! │         ▼                                                   │
//! │   response packet (opaque echoed)                           │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use crate::auth::{CredentialSource, SaslError, SaslNegotiator};
use crate::backend::{
    BackendError, DocumentId, KvBackend, RemoveRequest, RequestContext, UpsertRequest,
};
use crate::cluster::{ConfigSynthesizer, TopologyProvider};
use crate::connection::ConnectionState;
use crate::protocol::frames::frame_id;
use crate::protocol::status::{error_map_json, SUPPORTED_ERROR_MAP_VERSIONS};
use crate::protocol::{
    datatype, DurabilityRequirement, FeatureSet, HelloFeature, Opcode, Packet, Status,
};
use bytes::{Buf, BufMut, BytesMut};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Default deadline for a single backend call.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(2500);

/// Expiry values up to this many seconds are relative; larger ones are
/// absolute Unix timestamps.
const RELATIVE_EXPIRY_LIMIT: u32 = 30 * 24 * 60 * 60;

/// Why a request did not produce a success response.
#[derive(Debug)]
enum Rejection {
    Failed { status: Status, context: String },
    /// The connection is shutting down; no response is sent.
    Cancelled,
}

impl Rejection {
    fn new(status: Status, context: impl Into<String>) -> Self {
        Rejection::Failed {
            status,
            context: context.into(),
        }
    }

    fn invalid(context: impl Into<String>) -> Self {
        Self::new(Status::EINVAL, context)
    }
}

impl From<BackendError> for Rejection {
    fn from(err: BackendError) -> Self {
        Rejection::new(err.status(), err.to_string())
    }
}

impl From<SaslError> for Rejection {
    fn from(err: SaslError) -> Self {
        match err {
            SaslError::PlainNotSupported => Rejection::new(err.status(), err.to_string()),
            _ => Rejection::new(err.status(), "Authentication failed"),
        }
    }
}

type CommandResult = Result<Packet, Rejection>;

/// Options carried in a request's framing extras.
#[derive(Debug, Default)]
struct RequestOptions {
    durability: Option<DurabilityRequirement>,
    preserve_ttl: bool,
}

/// Translates legacy requests into backend calls and legacy responses.
#[derive(Clone)]
pub struct CommandTranslator {
    backend: Arc<dyn KvBackend>,
    config: ConfigSynthesizer,
    credentials: Arc<dyn CredentialSource>,
    request_timeout: Duration,
}

impl CommandTranslator {
    pub fn new(
        backend: Arc<dyn KvBackend>,
        topology: Arc<dyn TopologyProvider>,
        credentials: Arc<dyn CredentialSource>,
    ) -> Self {
        Self {
            backend,
            config: ConfigSynthesizer::new(topology),
            credentials,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Executes one request against the connection's state.
    ///
    /// Returns `None` only when `cancel` fired while a backend call was in
    /// flight; the response is then suppressed.
    pub async fn execute(
        &self,
        state: &mut ConnectionState,
        request: &Packet,
        cancel: &CancellationToken,
    ) -> Option<Packet> {
        let result = match request.opcode {
            Opcode::Hello => self.cmd_hello(state, request),
            Opcode::GetErrorMap => self.cmd_get_error_map(state, request),
            Opcode::GetClusterConfig => self.cmd_get_cluster_config(state, request),
            Opcode::SelectBucket => self.cmd_select_bucket(state, request),
            Opcode::SaslListMechs => self.cmd_sasl_list_mechs(request),
            Opcode::SaslAuth => self.cmd_sasl_auth(state, request),
            Opcode::SaslStep => self.cmd_sasl_step(state, request),
            Opcode::Get => self.cmd_get(state, request, cancel).await,
            Opcode::Set => self.cmd_set(state, request, cancel).await,
            Opcode::Delete => self.cmd_delete(state, request, cancel).await,
            Opcode::Unknown(code) => Err(Rejection::new(
                Status::UNKNOWN_COMMAND,
                format!("Unknown opcode {:#04x}", code),
            )),
        };

        match result {
            Ok(response) => Some(response),
            Err(Rejection::Cancelled) => {
                debug!(conn = %state.id, opcode = %request.opcode, "Request cancelled");
                None
            }
            Err(Rejection::Failed { status, context }) => {
                debug!(
                    conn = %state.id,
                    opcode = %request.opcode,
                    status = %status,
                    context = %context,
                    "Request failed"
                );
                Some(error_response(state.features, request, status, &context))
            }
        }
    }

    // ========================================================================
    // BOOTSTRAP
    // ========================================================================

    fn cmd_hello(&self, state: &mut ConnectionState, request: &Packet) -> CommandResult {
        if !request.extras.is_empty() {
            return Err(Rejection::invalid("HELLO takes no extras"));
        }
        if request.value.len() % 2 != 0 {
            return Err(Rejection::invalid("HELLO feature list has odd length"));
        }

        let mut negotiated = FeatureSet::empty();
        let mut reply = BytesMut::with_capacity(request.value.len());
        for chunk in request.value.chunks_exact(2) {
            let code = u16::from_be_bytes([chunk[0], chunk[1]]);
            let Some(flag) = HelloFeature::from_code(code).and_then(HelloFeature::supported_flag)
            else {
                continue;
            };
            if negotiated.contains(flag) {
                continue;
            }
            negotiated |= flag;
            reply.put_u16(code);
        }

        if !request.key.is_empty() {
            state.client_name = Some(String::from_utf8_lossy(&request.key).into_owned());
        }
        state.features = negotiated;

        info!(
            conn = %state.id,
            client_name = state.client_name.as_deref().unwrap_or(""),
            features = ?negotiated,
            "HELLO negotiated"
        );

        Ok(Packet::response_to(request, Status::SUCCESS).with_value(reply.freeze()))
    }

    fn cmd_get_error_map(&self, state: &ConnectionState, request: &Packet) -> CommandResult {
        if request.value.len() != 2 {
            return Err(Rejection::invalid("GET_ERROR_MAP expects a 2-byte version"));
        }
        let version = u16::from_be_bytes([request.value[0], request.value[1]]);
        if !SUPPORTED_ERROR_MAP_VERSIONS.contains(&version) {
            return Err(Rejection::invalid(format!(
                "Unsupported error map version {}",
                version
            )));
        }

        let body = error_map_json().map_err(|e| Rejection::new(Status::EINTERNAL, e.to_string()))?;
        Ok(Packet::response_to(request, Status::SUCCESS)
            .with_datatype(json_datatype(state.features))
            .with_value(body))
    }

    fn cmd_get_cluster_config(&self, state: &ConnectionState, request: &Packet) -> CommandResult {
        let known = match request.extras.len() {
            0 => None,
            16 => {
                let mut extras = request.extras.clone();
                let epoch = extras.get_i64();
                let rev = extras.get_i64();
                Some((epoch, rev))
            }
            _ => return Err(Rejection::invalid("Cluster config extras must be empty or 16 bytes")),
        };

        let config = self
            .config
            .build(state.bucket.as_deref(), state.local_host.as_deref())
            .map_err(|e| Rejection::new(e.status(), e.to_string()))?;

        if let Some(known) = known {
            if known >= (config.rev_epoch, config.rev) {
                return Ok(Packet::response_to(request, Status::SUCCESS));
            }
        }

        let body = config
            .to_json()
            .map_err(|e| Rejection::new(Status::EINTERNAL, e.to_string()))?;
        Ok(Packet::response_to(request, Status::SUCCESS)
            .with_datatype(json_datatype(state.features))
            .with_value(body))
    }

    fn cmd_select_bucket(&self, state: &mut ConnectionState, request: &Packet) -> CommandResult {
        let name = request
            .key_str()
            .filter(|name| !name.is_empty())
            .ok_or_else(|| Rejection::invalid("Bucket name must be non-empty UTF-8"))?;

        info!(conn = %state.id, bucket = name, "Bucket selected");
        state.bucket = Some(name.to_string());
        Ok(Packet::response_to(request, Status::SUCCESS))
    }

    // ========================================================================
    // SASL
    // ========================================================================

    fn cmd_sasl_list_mechs(&self, request: &Packet) -> CommandResult {
        Ok(Packet::response_to(request, Status::SUCCESS)
            .with_value(SaslNegotiator::list_mechanisms()))
    }

    fn cmd_sasl_auth(&self, state: &mut ConnectionState, request: &Packet) -> CommandResult {
        let mechanism = request
            .key_str()
            .ok_or_else(|| Rejection::new(Status::AUTH_ERROR, "Authentication failed"))?;

        let server_first = state
            .sasl
            .auth(mechanism, &request.value, self.credentials.as_ref())
            .inspect_err(|e| {
                debug!(conn = %state.id, mechanism, error = %e, "SASL auth rejected")
            })?;

        Ok(Packet::response_to(request, Status::AUTH_CONTINUE).with_value(server_first))
    }

    fn cmd_sasl_step(&self, state: &mut ConnectionState, request: &Packet) -> CommandResult {
        let mechanism = request
            .key_str()
            .ok_or_else(|| Rejection::new(Status::AUTH_ERROR, "Authentication failed"))?;

        let done = state
            .sasl
            .step(mechanism, &request.value)
            .inspect_err(|e| {
                debug!(conn = %state.id, mechanism, error = %e, "SASL step rejected")
            })?;

        info!(conn = %state.id, user = %done.username, mechanism, "Client authenticated");
        state.user = Some(done.username);
        Ok(Packet::response_to(request, Status::SUCCESS).with_value(done.server_final))
    }

    // ========================================================================
    // CRUD
    // ========================================================================

    async fn cmd_get(
        &self,
        state: &ConnectionState,
        request: &Packet,
        cancel: &CancellationToken,
    ) -> CommandResult {
        if !request.extras.is_empty() || !request.value.is_empty() {
            return Err(Rejection::invalid("GET takes no extras or value"));
        }
        let id = document_id(state, request)?;
        if request_options(request)?.durability.is_some() {
            return Err(Rejection::invalid("Durability is not valid for GET"));
        }

        let ctx = request_context(state);
        let doc = self.call_backend(cancel, self.backend.get(&ctx, &id)).await?;

        let datatype = if state.features.contains(FeatureSet::JSON) {
            doc.datatype & datatype::JSON
        } else {
            datatype::RAW
        };

        Ok(Packet::response_to(request, Status::SUCCESS)
            .with_extras(doc.flags.to_be_bytes().to_vec())
            .with_datatype(datatype)
            .with_cas(doc.cas)
            .with_value(doc.value))
    }

    async fn cmd_set(
        &self,
        state: &ConnectionState,
        request: &Packet,
        cancel: &CancellationToken,
    ) -> CommandResult {
        if request.extras.len() != 8 {
            return Err(Rejection::invalid("SET extras must be flags and expiry"));
        }
        let id = document_id(state, request)?;
        check_datatype(request.datatype)?;
        let options = request_options(request)?;

        let mut extras = request.extras.clone();
        let flags = extras.get_u32();
        let expiry = extras.get_u32();

        let upsert = UpsertRequest {
            id,
            value: request.value.clone(),
            flags,
            datatype: request.datatype & datatype::JSON,
            expiry: expiry_deadline(expiry, SystemTime::now()),
            cas: (request.cas != 0).then_some(request.cas),
            durability: options.durability,
            preserve_ttl: options.preserve_ttl,
        };

        let ctx = request_context(state);
        let result = self
            .call_backend(cancel, self.backend.upsert(&ctx, upsert))
            .await?;

        Ok(Packet::response_to(request, Status::SUCCESS).with_cas(result.cas))
    }

    async fn cmd_delete(
        &self,
        state: &ConnectionState,
        request: &Packet,
        cancel: &CancellationToken,
    ) -> CommandResult {
        if !request.extras.is_empty() || !request.value.is_empty() {
            return Err(Rejection::invalid("DELETE takes no extras or value"));
        }
        let id = document_id(state, request)?;
        let options = request_options(request)?;

        let remove = RemoveRequest {
            id,
            cas: (request.cas != 0).then_some(request.cas),
            durability: options.durability,
        };

        let ctx = request_context(state);
        let result = self
            .call_backend(cancel, self.backend.remove(&ctx, remove))
            .await?;

        Ok(Packet::response_to(request, Status::SUCCESS).with_cas(result.cas))
    }

    /// Runs a backend call under the request timeout and the connection's
    /// cancellation token.
    async fn call_backend<T, F>(&self, cancel: &CancellationToken, call: F) -> Result<T, Rejection>
    where
        F: Future<Output = Result<T, BackendError>>,
    {
        tokio::select! {
            _ = cancel.cancelled() => Err(Rejection::Cancelled),
            result = tokio::time::timeout(self.request_timeout, call) => match result {
                Ok(result) => result.map_err(Rejection::from),
                Err(_) => Err(BackendError::Timeout.into()),
            },
        }
    }
}

fn json_datatype(features: FeatureSet) -> u8 {
    if features.contains(FeatureSet::JSON) {
        datatype::JSON
    } else {
        datatype::RAW
    }
}

/// Builds an error response, with a JSON context body once XERROR is on.
fn error_response(features: FeatureSet, request: &Packet, status: Status, context: &str) -> Packet {
    let response = Packet::response_to(request, status);
    if !features.contains(FeatureSet::XERROR) || context.is_empty() {
        return response;
    }

    let body = serde_json::json!({ "error": { "context": context } });
    response
        .with_datatype(json_datatype(features))
        .with_value(body.to_string())
}

fn request_context(state: &ConnectionState) -> RequestContext {
    RequestContext {
        username: state.user.clone(),
    }
}

fn document_id(state: &ConnectionState, request: &Packet) -> Result<DocumentId, Rejection> {
    if request.invalid_collection_prefix {
        return Err(Rejection::invalid("Invalid collection id prefix"));
    }

    let bucket = state
        .bucket
        .as_ref()
        .ok_or_else(|| Rejection::new(Status::NO_BUCKET, "No bucket selected"))?;

    match request.collection_id {
        None | Some(0) => {}
        Some(cid) => {
            return Err(Rejection::new(
                Status::UNKNOWN_COLLECTION,
                format!("Unknown collection id {:#x}", cid),
            ))
        }
    }

    if request.key.is_empty() {
        return Err(Rejection::invalid("Key must not be empty"));
    }

    Ok(DocumentId::in_default_collection(
        bucket.clone(),
        request.key.clone(),
    ))
}

fn check_datatype(bits: u8) -> Result<(), Rejection> {
    if bits & !datatype::ALL != 0 {
        return Err(Rejection::invalid("Unknown datatype bits"));
    }
    if bits & datatype::SNAPPY != 0 {
        return Err(Rejection::invalid("Snappy was not negotiated"));
    }
    if bits & datatype::XATTR != 0 {
        return Err(Rejection::invalid("Extended attributes are not supported"));
    }
    Ok(())
}

fn request_options(request: &Packet) -> Result<RequestOptions, Rejection> {
    let mut options = RequestOptions::default();

    for frame in &request.frames {
        match frame.id {
            frame_id::BARRIER | frame_id::OPEN_TRACING => {}
            frame_id::DURABILITY => {
                let requirement = DurabilityRequirement::from_frame_data(&frame.data);
                options.durability = match (requirement, frame.data.first().copied()) {
                    (Some(requirement), _) => Some(requirement),
                    (None, Some(0) | Some(4..)) => {
                        return Err(Rejection::new(
                            Status::DURABILITY_INVALID_LEVEL,
                            "Invalid durability level",
                        ))
                    }
                    (None, _) => return Err(Rejection::invalid("Malformed durability frame")),
                };
            }
            frame_id::PRESERVE_TTL => {
                if !frame.data.is_empty() {
                    return Err(Rejection::invalid("Preserve TTL frame takes no payload"));
                }
                options.preserve_ttl = true;
            }
            frame_id::IMPERSONATE => {
                return Err(Rejection::new(
                    Status::NOT_SUPPORTED,
                    "Impersonation is not supported",
                ))
            }
            frame_id::DCP_STREAM_ID => {
                return Err(Rejection::invalid("Stream id is only valid for DCP"))
            }
            other => {
                return Err(Rejection::new(
                    Status::UNKNOWN_FRAME_INFO,
                    format!("Unknown frame id {}", other),
                ))
            }
        }
    }

    Ok(options)
}

/// Converts a legacy expiry field to a deadline.
fn expiry_deadline(expiry: u32, now: SystemTime) -> Option<SystemTime> {
    match expiry {
        0 => None,
        secs if secs <= RELATIVE_EXPIRY_LIMIT => Some(now + Duration::from_secs(u64::from(secs))),
        secs => Some(UNIX_EPOCH + Duration::from_secs(u64::from(secs))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{ScramHash, ScramServer, StaticCredentials};
    use crate::backend::{GetResult, MemoryBackend, MutationResult};
    use crate::cluster::{ServicePorts, StaticTopology};
    use crate::connection::registry::ConnId;
    use crate::protocol::FrameInfo;
    use async_trait::async_trait;
    use bytes::Bytes;

    const CLIENT_FIRST: &str = "n,,n=user,r=clientNONCE";
    const CLIENT_FINAL: &str = "c=biws,r=clientNONCEserverNONCE,p=I4oktcY7BOL0Agn0NlWRXlRP1mg=";

    fn fixed_engine(hash: ScramHash) -> ScramServer {
        ScramServer::with_nonce_and_salt(hash, "serverNONCE", b"saltSALTsalt".to_vec())
    }

    fn topology() -> Arc<StaticTopology> {
        Arc::new(StaticTopology::single_node(
            "127.0.0.1",
            ServicePorts::kv_node(8091, 11210),
            &["default".to_string()],
            64,
            0,
        ))
    }

    fn create_translator_with(backend: Arc<dyn KvBackend>) -> CommandTranslator {
        CommandTranslator::new(
            backend,
            topology(),
            Arc::new(StaticCredentials::new("user", "pencil")),
        )
    }

    fn create_translator() -> CommandTranslator {
        create_translator_with(Arc::new(MemoryBackend::new(["default"])))
    }

    fn create_state() -> ConnectionState {
        ConnectionState::new(ConnId::new(1))
            .with_local_host("127.0.0.1")
            .with_sasl(SaslNegotiator::with_engine_factory(fixed_engine))
    }

    /// Runs a request and checks the invariants every response must hold.
    async fn run(t: &CommandTranslator, state: &mut ConnectionState, request: Packet) -> Packet {
        let response = t
            .execute(state, &request, &CancellationToken::new())
            .await
            .expect("response");
        assert_eq!(response.opaque, request.opaque);
        assert_eq!(response.opcode, request.opcode);
        response
    }

    fn hello(codes: &[u16]) -> Packet {
        let value: Vec<u8> = codes.iter().flat_map(|c| c.to_be_bytes()).collect();
        Packet::request(Opcode::Hello)
            .with_key("test-client")
            .with_value(value)
            .with_opaque(0x11)
    }

    fn codes(value: &Bytes) -> Vec<u16> {
        value
            .chunks_exact(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect()
    }

    fn set(key: &'static str, value: &'static str) -> Packet {
        let mut extras = Vec::new();
        extras.extend_from_slice(&0xcafef00du32.to_be_bytes());
        extras.extend_from_slice(&0u32.to_be_bytes());
        Packet::request(Opcode::Set)
            .with_key(key)
            .with_extras(extras)
            .with_value(value)
            .with_opaque(0x22)
    }

    fn get(key: &'static str) -> Packet {
        Packet::request(Opcode::Get).with_key(key).with_opaque(0x33)
    }

    async fn authenticate(t: &CommandTranslator, state: &mut ConnectionState) {
        let auth = Packet::request(Opcode::SaslAuth)
            .with_key("SCRAM-SHA1")
            .with_value(CLIENT_FIRST);
        assert_eq!(run(t, state, auth).await.status, Status::AUTH_CONTINUE);

        let step = Packet::request(Opcode::SaslStep)
            .with_key("SCRAM-SHA1")
            .with_value(CLIENT_FINAL);
        assert_eq!(run(t, state, step).await.status, Status::SUCCESS);
    }

    async fn ready_state(t: &CommandTranslator) -> ConnectionState {
        let mut state = create_state();
        authenticate(t, &mut state).await;
        let select = Packet::request(Opcode::SelectBucket).with_key("default");
        assert_eq!(run(t, &mut state, select).await.status, Status::SUCCESS);
        state
    }

    // ------------------------------------------------------------------------
    // HELLO
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_hello_returns_supported_subset() {
        let t = create_translator();
        let mut state = create_state();

        // JSON, TLS, XERROR, JSON again, Collections, unknown
        let response = run(&t, &mut state, hello(&[0x0b, 0x02, 0x07, 0x0b, 0x12, 0xffff])).await;

        assert_eq!(response.status, Status::SUCCESS);
        assert_eq!(codes(&response.value), vec![0x0b, 0x07, 0x12]);
        assert_eq!(
            state.features,
            FeatureSet::JSON | FeatureSet::XERROR | FeatureSet::COLLECTIONS
        );
        assert_eq!(state.client_name.as_deref(), Some("test-client"));
    }

    #[tokio::test]
    async fn test_hello_each_feature() {
        let t = create_translator();

        for code in 0u16..0x40 {
            let mut state = create_state();
            let response = run(&t, &mut state, hello(&[code])).await;
            let supported = HelloFeature::from_code(code)
                .and_then(HelloFeature::supported_flag)
                .is_some();

            if supported {
                assert_eq!(codes(&response.value), vec![code], "feature {code:#x}");
            } else {
                assert!(response.value.is_empty(), "feature {code:#x}");
            }
        }
    }

    #[tokio::test]
    async fn test_hello_empty_and_replaces() {
        let t = create_translator();
        let mut state = create_state();

        run(&t, &mut state, hello(&[0x10, 0x11])).await;
        assert!(state.features.contains(FeatureSet::ALT_REQUESTS));

        let response = run(&t, &mut state, hello(&[])).await;
        assert!(response.value.is_empty());
        assert!(state.features.is_empty());
    }

    #[tokio::test]
    async fn test_hello_odd_length() {
        let t = create_translator();
        let mut state = create_state();
        let request = Packet::request(Opcode::Hello).with_value(vec![0x00, 0x0b, 0x00]);
        assert_eq!(run(&t, &mut state, request).await.status, Status::EINVAL);
    }

    // ------------------------------------------------------------------------
    // Error map and cluster config
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_error_map_versions() {
        let t = create_translator();
        let mut state = create_state();

        for version in [1u16, 2] {
            let request = Packet::request(Opcode::GetErrorMap)
                .with_value(version.to_be_bytes().to_vec())
                .with_opaque(u32::from(version));
            let response = run(&t, &mut state, request).await;
            assert_eq!(response.status, Status::SUCCESS);
            let map: serde_json::Value = serde_json::from_slice(&response.value).unwrap();
            assert_eq!(map["version"], 1);
        }

        let unsupported =
            Packet::request(Opcode::GetErrorMap).with_value(3u16.to_be_bytes().to_vec());
        assert_eq!(run(&t, &mut state, unsupported).await.status, Status::EINVAL);

        let short = Packet::request(Opcode::GetErrorMap).with_value(vec![1]);
        assert_eq!(run(&t, &mut state, short).await.status, Status::EINVAL);
    }

    #[tokio::test]
    async fn test_cluster_config_before_and_after_select() {
        let t = create_translator();
        let mut state = create_state();
        run(&t, &mut state, hello(&[0x0b])).await;

        let response = run(&t, &mut state, Packet::request(Opcode::GetClusterConfig)).await;
        assert_eq!(response.status, Status::SUCCESS);
        assert_eq!(response.datatype, datatype::JSON);
        let config: serde_json::Value = serde_json::from_slice(&response.value).unwrap();
        assert!(config.get("vBucketServerMap").is_none());
        assert_eq!(config["nodesExt"][0]["thisNode"], true);

        state.bucket = Some("default".to_string());
        let response = run(&t, &mut state, Packet::request(Opcode::GetClusterConfig)).await;
        let config: serde_json::Value = serde_json::from_slice(&response.value).unwrap();
        assert_eq!(config["name"], "default");
        assert_eq!(
            config["vBucketServerMap"]["vBucketMap"].as_array().unwrap().len(),
            64
        );
    }

    #[tokio::test]
    async fn test_cluster_config_known_version() {
        let t = create_translator();
        let mut state = create_state();

        let known = |epoch: i64, rev: i64| {
            let mut extras = Vec::new();
            extras.extend_from_slice(&epoch.to_be_bytes());
            extras.extend_from_slice(&rev.to_be_bytes());
            Packet::request(Opcode::GetClusterConfig).with_extras(extras)
        };

        let current = run(&t, &mut state, known(1, 1)).await;
        assert_eq!(current.status, Status::SUCCESS);
        assert!(current.value.is_empty());

        let older = run(&t, &mut state, known(0, 5)).await;
        assert!(!older.value.is_empty());

        let bad = Packet::request(Opcode::GetClusterConfig).with_extras(vec![0u8; 4]);
        assert_eq!(run(&t, &mut state, bad).await.status, Status::EINVAL);
    }

    #[tokio::test]
    async fn test_cluster_config_unknown_bucket() {
        let t = create_translator();
        let mut state = create_state();
        state.bucket = Some("missing".to_string());
        let response = run(&t, &mut state, Packet::request(Opcode::GetClusterConfig)).await;
        assert_eq!(response.status, Status::NO_BUCKET);
    }

    #[tokio::test]
    async fn test_select_bucket() {
        let t = create_translator();
        let mut state = create_state();

        let empty = Packet::request(Opcode::SelectBucket);
        assert_eq!(run(&t, &mut state, empty).await.status, Status::EINVAL);
        assert!(state.bucket.is_none());

        // no existence check at this layer
        let other = Packet::request(Opcode::SelectBucket).with_key("anything");
        assert_eq!(run(&t, &mut state, other).await.status, Status::SUCCESS);
        assert_eq!(state.bucket.as_deref(), Some("anything"));
    }

    // ------------------------------------------------------------------------
    // SASL
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_sasl_list_mechs() {
        let t = create_translator();
        let mut state = create_state();
        let response = run(&t, &mut state, Packet::request(Opcode::SaslListMechs)).await;
        assert_eq!(
            &response.value[..],
            b"PLAIN SCRAM-SHA1 SCRAM-SHA256 SCRAM-SHA512"
        );
    }

    #[tokio::test]
    async fn test_sasl_scram_flow() {
        let t = create_translator();
        let mut state = create_state();

        let auth = Packet::request(Opcode::SaslAuth)
            .with_key("SCRAM-SHA1")
            .with_value(CLIENT_FIRST)
            .with_opaque(7);
        let response = run(&t, &mut state, auth).await;
        assert_eq!(response.status, Status::AUTH_CONTINUE);
        assert_eq!(
            &response.value[..],
            b"r=clientNONCEserverNONCE,s=c2FsdFNBTFRzYWx0,i=4096"
        );
        assert!(state.user.is_none());

        let step = Packet::request(Opcode::SaslStep)
            .with_key("SCRAM-SHA1")
            .with_value(CLIENT_FINAL)
            .with_opaque(8);
        let response = run(&t, &mut state, step).await;
        assert_eq!(response.status, Status::SUCCESS);
        assert_eq!(&response.value[..], b"v=oKPvB1bE/9ydptJ+kohMgL+NdM0=");
        assert_eq!(state.user.as_deref(), Some("user"));
    }

    #[tokio::test]
    async fn test_sasl_wrong_proof() {
        let t = create_translator();
        let mut state = create_state();

        let auth = Packet::request(Opcode::SaslAuth)
            .with_key("SCRAM-SHA1")
            .with_value(CLIENT_FIRST);
        run(&t, &mut state, auth).await;

        let step = Packet::request(Opcode::SaslStep)
            .with_key("SCRAM-SHA1")
            .with_value("c=biws,r=clientNONCEserverNONCE,p=AAAAAAAAAAAAAAAAAAAAAAAAAAA=");
        let response = run(&t, &mut state, step.clone()).await;
        assert_eq!(response.status, Status::AUTH_ERROR);
        assert!(response.value.is_empty());
        assert!(state.user.is_none());

        // the session is gone
        assert_eq!(run(&t, &mut state, step).await.status, Status::AUTH_ERROR);
    }

    #[tokio::test]
    async fn test_sasl_plain_is_invalid_argument() {
        let t = create_translator();
        let mut state = create_state();
        let auth = Packet::request(Opcode::SaslAuth)
            .with_key("PLAIN")
            .with_value(&b"\0user\0pencil"[..]);
        assert_eq!(run(&t, &mut state, auth).await.status, Status::EINVAL);
    }

    // ------------------------------------------------------------------------
    // CRUD
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_crud_without_bucket() {
        let t = create_translator();
        let mut state = create_state();
        authenticate(&t, &mut state).await;

        assert_eq!(run(&t, &mut state, get("k")).await.status, Status::NO_BUCKET);
        assert_eq!(run(&t, &mut state, set("k", "v")).await.status, Status::NO_BUCKET);
        let delete = Packet::request(Opcode::Delete).with_key("k");
        assert_eq!(run(&t, &mut state, delete).await.status, Status::NO_BUCKET);
    }

    #[tokio::test]
    async fn test_set_get_delete() {
        let t = create_translator();
        let mut state = ready_state(&t).await;

        let stored = run(&t, &mut state, set("name", "Ariz")).await;
        assert_eq!(stored.status, Status::SUCCESS);
        assert_ne!(stored.cas, 0);

        let fetched = run(&t, &mut state, get("name")).await;
        assert_eq!(fetched.status, Status::SUCCESS);
        assert_eq!(fetched.value, Bytes::from("Ariz"));
        assert_eq!(&fetched.extras[..], &0xcafef00du32.to_be_bytes());
        assert_eq!(fetched.cas, stored.cas);

        let delete = Packet::request(Opcode::Delete).with_key("name").with_opaque(9);
        let deleted = run(&t, &mut state, delete).await;
        assert_eq!(deleted.status, Status::SUCCESS);
        assert_ne!(deleted.cas, stored.cas);

        assert_eq!(run(&t, &mut state, get("name")).await.status, Status::KEY_ENOENT);
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let t = create_translator();
        let mut state = ready_state(&t).await;
        let response = run(&t, &mut state, get("missing")).await;
        assert_eq!(response.status, Status::KEY_ENOENT);
    }

    #[tokio::test]
    async fn test_unauthenticated_crud_is_denied() {
        let t = create_translator();
        let mut state = create_state();
        state.bucket = Some("default".to_string());
        assert_eq!(run(&t, &mut state, get("k")).await.status, Status::EACCESS);
    }

    #[tokio::test]
    async fn test_set_with_cas() {
        let t = create_translator();
        let mut state = ready_state(&t).await;

        let first = run(&t, &mut state, set("k", "v1")).await;

        let stale = set("k", "v2").with_cas(first.cas + 1);
        assert_eq!(run(&t, &mut state, stale).await.status, Status::KEY_EEXISTS);

        let current = set("k", "v2").with_cas(first.cas);
        assert_eq!(run(&t, &mut state, current).await.status, Status::SUCCESS);

        let missing = set("other", "v").with_cas(1234);
        assert_eq!(run(&t, &mut state, missing).await.status, Status::KEY_ENOENT);
    }

    #[tokio::test]
    async fn test_set_invalid_arguments() {
        let t = create_translator();
        let mut state = ready_state(&t).await;

        let no_extras = Packet::request(Opcode::Set).with_key("k").with_value("v");
        assert_eq!(run(&t, &mut state, no_extras).await.status, Status::EINVAL);

        let snappy = set("k", "v").with_datatype(datatype::SNAPPY);
        assert_eq!(run(&t, &mut state, snappy).await.status, Status::EINVAL);

        let unknown_bits = set("k", "v").with_datatype(0x80);
        assert_eq!(run(&t, &mut state, unknown_bits).await.status, Status::EINVAL);

        let json = set("k", "{}").with_datatype(datatype::JSON);
        assert_eq!(run(&t, &mut state, json).await.status, Status::SUCCESS);
    }

    #[tokio::test]
    async fn test_unknown_collection() {
        let t = create_translator();
        let mut state = ready_state(&t).await;

        let request = get("k").with_collection_id(8);
        assert_eq!(
            run(&t, &mut state, request).await.status,
            Status::UNKNOWN_COLLECTION
        );

        let default = set("k", "v").with_collection_id(0);
        assert_eq!(run(&t, &mut state, default).await.status, Status::SUCCESS);
    }

    #[tokio::test]
    async fn test_invalid_collection_prefix() {
        let t = create_translator();
        let mut state = ready_state(&t).await;

        let mut request = get("k").with_opaque(0x77);
        request.invalid_collection_prefix = true;
        let response = run(&t, &mut state, request).await;
        assert_eq!(response.status, Status::EINVAL);
        assert_eq!(response.opaque, 0x77);

        // Rejected even before a bucket is selected
        let mut fresh = create_state();
        let mut request = get("k");
        request.invalid_collection_prefix = true;
        assert_eq!(run(&t, &mut fresh, request).await.status, Status::EINVAL);
    }

    #[tokio::test]
    async fn test_frame_validation() {
        let t = create_translator();
        let mut state = ready_state(&t).await;

        let bad_level = set("k", "v").with_frame(FrameInfo::new(frame_id::DURABILITY, vec![0x00]));
        assert_eq!(
            run(&t, &mut state, bad_level).await.status,
            Status::DURABILITY_INVALID_LEVEL
        );

        let too_high = set("k", "v").with_frame(FrameInfo::new(frame_id::DURABILITY, vec![0x04]));
        assert_eq!(
            run(&t, &mut state, too_high).await.status,
            Status::DURABILITY_INVALID_LEVEL
        );

        let impersonate =
            get("k").with_frame(FrameInfo::new(frame_id::IMPERSONATE, "someone-else"));
        assert_eq!(
            run(&t, &mut state, impersonate).await.status,
            Status::NOT_SUPPORTED
        );

        let unknown = get("k").with_frame(FrameInfo::new(0x20, Bytes::new()));
        assert_eq!(
            run(&t, &mut state, unknown).await.status,
            Status::UNKNOWN_FRAME_INFO
        );

        let durable = set("k", "v").with_frame(FrameInfo::durability(
            crate::protocol::DurabilityLevel::Majority,
            Some(1000),
        ));
        assert_eq!(run(&t, &mut state, durable).await.status, Status::SUCCESS);
    }

    #[tokio::test]
    async fn test_unknown_opcode() {
        let t = create_translator();
        let mut state = create_state();
        let request = Packet::request(Opcode::Unknown(0x99)).with_opaque(0xdeadbeef);
        let response = run(&t, &mut state, request).await;
        assert_eq!(response.status, Status::UNKNOWN_COMMAND);
    }

    #[tokio::test]
    async fn test_xerror_context() {
        let t = create_translator();
        let mut state = create_state();

        // without XERROR the body stays empty
        let response = run(&t, &mut state, get("k")).await;
        assert_eq!(response.status, Status::NO_BUCKET);
        assert!(response.value.is_empty());

        run(&t, &mut state, hello(&[0x07, 0x0b])).await;
        let response = run(&t, &mut state, get("k")).await;
        assert_eq!(response.datatype, datatype::JSON);
        let body: serde_json::Value = serde_json::from_slice(&response.value).unwrap();
        assert_eq!(body["error"]["context"], "No bucket selected");
    }

    // ------------------------------------------------------------------------
    // Backend errors, timeouts and cancellation
    // ------------------------------------------------------------------------

    struct ScriptedBackend {
        error: BackendError,
        delay: Duration,
    }

    impl ScriptedBackend {
        async fn respond<T>(&self) -> Result<T, BackendError> {
            tokio::time::sleep(self.delay).await;
            Err(self.error.clone())
        }
    }

    #[async_trait]
    impl KvBackend for ScriptedBackend {
        async fn get(&self, _: &RequestContext, _: &DocumentId) -> Result<GetResult, BackendError> {
            self.respond().await
        }

        async fn upsert(
            &self,
            _: &RequestContext,
            _: UpsertRequest,
        ) -> Result<MutationResult, BackendError> {
            self.respond().await
        }

        async fn remove(
            &self,
            _: &RequestContext,
            _: RemoveRequest,
        ) -> Result<MutationResult, BackendError> {
            self.respond().await
        }
    }

    fn scripted(error: BackendError, delay: Duration) -> CommandTranslator {
        create_translator_with(Arc::new(ScriptedBackend { error, delay }))
    }

    #[tokio::test]
    async fn test_backend_error_mapping() {
        let cases = [
            (BackendError::Locked, Status::LOCKED),
            (BackendError::AccessDenied, Status::EACCESS),
            (BackendError::Transport("reset".into()), Status::EINTERNAL),
            (BackendError::Ambiguous, Status::SYNC_WRITE_AMBIGUOUS),
        ];

        for (error, status) in cases {
            let t = scripted(error, Duration::ZERO);
            let mut state = ready_state(&t).await;
            assert_eq!(run(&t, &mut state, set("k", "v")).await.status, status);
            assert_eq!(run(&t, &mut state, get("k")).await.status, status);
        }
    }

    #[tokio::test]
    async fn test_backend_timeout() {
        let t = scripted(BackendError::NotFound, Duration::from_secs(30))
            .with_request_timeout(Duration::from_millis(50));
        let mut state = ready_state(&t).await;

        let response = run(&t, &mut state, get("k")).await;
        assert_eq!(response.status, Status::ETMPFAIL);
    }

    #[tokio::test]
    async fn test_cancellation_suppresses_response() {
        let t = scripted(BackendError::NotFound, Duration::from_secs(30));
        let mut state = ready_state(&t).await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(t.execute(&mut state, &get("k"), &cancel).await.is_none());

        // non-backend opcodes still answer
        let mechs = Packet::request(Opcode::SaslListMechs);
        assert!(t.execute(&mut state, &mechs, &cancel).await.is_some());
    }

    #[test]
    fn test_expiry_deadline() {
        let now = UNIX_EPOCH + Duration::from_secs(1_700_000_000);

        assert_eq!(expiry_deadline(0, now), None);
        assert_eq!(
            expiry_deadline(60, now),
            Some(now + Duration::from_secs(60))
        );
        assert_eq!(
            expiry_deadline(RELATIVE_EXPIRY_LIMIT, now),
            Some(now + Duration::from_secs(u64::from(RELATIVE_EXPIRY_LIMIT)))
        );
        assert_eq!(
            expiry_deadline(RELATIVE_EXPIRY_LIMIT + 1, now),
            Some(UNIX_EPOCH + Duration::from_secs(u64::from(RELATIVE_EXPIRY_LIMIT) + 1))
        );
    }
}

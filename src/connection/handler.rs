//! Connection Handler Module
//!
//! This module handles individual client connections to the bridge.
//! Each client gets its own handler task that runs in a loop,
//! reading request packets and sending responses in order.
//!
//! ## Connection Lifecycle
//!
//! ```text
//! 1. Client connects (TCP handshake)
//!        │
//!        ▼
//! 2. Registered, ConnectionHandler spawned
//!        │
//!        ▼
//! 3. ┌──────────────────────────────┐
//!    │      Main Loop               │
//!    │                              │
//!    │  ┌─────────────────────────┐ │
//!    │  │ Read bytes from socket  │ │
//!    │  └───────────┬─────────────┘ │
//!    │              │               │
//!    │              ▼               │
//!    │  ┌─────────────────────────┐ │
//!    │  │ Decode request packet   │ │
//!    │  └───────────┬─────────────┘ │
//!    │              │               │
//!    │              ▼               │
//!    │  ┌─────────────────────────┐ │
//!    │  │ Translate and execute   │ │
//!    │  └───────────┬─────────────┘ │
//!    │              │               │
//!    │              ▼               │
//!    │  ┌─────────────────────────┐ │
//!    │  │ Send response           │ │
//!    │  └───────────┬─────────────┘ │
//!    │              │               │
//!    │              ▼               │
//!    │         [Loop back]          │
//!    └──────────────────────────────┘
//!        │
//!        ▼
//! 4. Client disconnects / framing error / shutdown
//!        │
//!        ▼
//! 5. Handler task ends, registration dropped
//! ```
//!
//! ## Ordering
//!
//! Requests are executed one at a time, so responses leave in the order the
//! requests arrived even when a client pipelines many packets in one write.
//!
//! ## Buffer Management
//!
//! A BytesMut buffer accumulates incoming data. TCP is a stream protocol, so a
//! read may end mid-packet or hold several packets. The buffer never has to
//! hold more than one maximal packet.

use super::registry::RegistrationGuard;
use super::state::ConnectionState;
use crate::commands::CommandTranslator;
use crate::protocol::{
    EncodeError, Magic, Opcode, Packet, PacketCodec, ParseError, HEADER_LEN, MAX_BODY_SIZE,
};
use bytes::BytesMut;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Maximum size for the read buffer: one header plus the largest body
const MAX_BUFFER_SIZE: usize = HEADER_LEN + MAX_BODY_SIZE;

/// Initial buffer capacity
const INITIAL_BUFFER_SIZE: usize = 4096;

/// Statistics for connection handling
#[derive(Debug, Default)]
pub struct ConnectionStats {
    /// Total number of connections accepted
    pub connections_accepted: AtomicU64,
    /// Currently active connections
    pub active_connections: AtomicU64,
    /// Total request packets processed
    pub commands_processed: AtomicU64,
    /// Total bytes read
    pub bytes_read: AtomicU64,
    /// Total bytes written
    pub bytes_written: AtomicU64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn command_processed(&self) {
        self.commands_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_read(&self, count: usize) {
        self.bytes_read.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn bytes_written(&self, count: usize) {
        self.bytes_written
            .fetch_add(count as u64, Ordering::Relaxed);
    }
}

/// Handles a single client connection.
///
/// Owns the read buffer, the codec and the connection's protocol state.
/// Nothing outside this handler touches them.
pub struct ConnectionHandler<S> {
    /// The client stream
    stream: BufWriter<S>,

    /// Client's address (for logging)
    addr: SocketAddr,

    /// Buffer for incoming data
    buffer: BytesMut,

    /// Codec whose framing follows the negotiated features
    codec: PacketCodec,

    /// Per-connection protocol state
    state: ConnectionState,

    /// The command translator (shared across connections)
    translator: CommandTranslator,

    /// Connection statistics (shared)
    stats: Arc<ConnectionStats>,

    /// Fired on server shutdown
    cancel: CancellationToken,

    /// Keeps the connection in the registry until the handler is dropped
    registration: RegistrationGuard,
}

impl<S> ConnectionHandler<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Creates a new connection handler.
    ///
    /// # Arguments
    ///
    /// * `stream` - The client stream
    /// * `addr` - The client's socket address
    /// * `registration` - The connection's registry entry
    /// * `translator` - Executes decoded requests
    /// * `stats` - Shared connection statistics
    /// * `cancel` - Shutdown signal
    pub fn new(
        stream: S,
        addr: SocketAddr,
        registration: RegistrationGuard,
        translator: CommandTranslator,
        stats: Arc<ConnectionStats>,
        cancel: CancellationToken,
    ) -> Self {
        stats.connection_opened();

        Self {
            stream: BufWriter::new(stream),
            addr,
            buffer: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
            codec: PacketCodec::new(),
            state: ConnectionState::new(registration.id()),
            translator,
            stats,
            cancel,
            registration,
        }
    }

    /// Sets the host the client connected to, used for `thisNode`.
    pub fn with_local_host(mut self, host: impl Into<String>) -> Self {
        self.state = self.state.with_local_host(host);
        self
    }

    /// Runs the main connection loop.
    ///
    /// Reads requests, executes them and sends back responses until the
    /// client disconnects, a framing error occurs or the server shuts down.
    pub async fn run(mut self) -> Result<(), ConnectionError> {
        info!(conn = %self.state.id, client = %self.addr, "Client connected");

        let result = self.main_loop().await;
        let phase = self.state.phase();
        let connected_for = self.registration.connected_for();

        match &result {
            Ok(()) => info!(
                conn = %self.state.id,
                client = %self.addr,
                %phase,
                ?connected_for,
                "Connection closed by server"
            ),
            Err(e) if e.is_disconnect() => debug!(
                conn = %self.state.id,
                client = %self.addr,
                %phase,
                ?connected_for,
                error = %e,
                "Client disconnected"
            ),
            Err(e) => warn!(
                conn = %self.state.id,
                client = %self.addr,
                %phase,
                ?connected_for,
                error = %e,
                "Connection error"
            ),
        }

        self.stats.connection_closed();
        result
    }

    /// The main read-execute-respond loop.
    async fn main_loop(&mut self) -> Result<(), ConnectionError> {
        let cancel = self.cancel.clone();

        loop {
            // Drain every complete request before reading again
            while let Some(request) = self.try_parse_packet()? {
                self.stats.command_processed();

                let Some(response) = self
                    .translator
                    .execute(&mut self.state, &request, &self.cancel)
                    .await
                else {
                    return Ok(());
                };

                self.send_response(&response).await?;

                // Features apply to packets after the HELLO response
                if request.opcode == Opcode::Hello && response.status.is_success() {
                    self.codec.reset_features();
                    self.codec.enable_feature(self.state.features);
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(conn = %self.state.id, "Shutdown requested");
                    return Ok(());
                }
                result = self.read_more_data() => result?,
            }
        }
    }

    /// Attempts to decode a request from the buffer.
    fn try_parse_packet(&mut self) -> Result<Option<Packet>, ConnectionError> {
        if self.buffer.is_empty() {
            return Ok(None);
        }

        match self.codec.decode(&self.buffer) {
            Ok(Some((packet, consumed))) => {
                let _ = self.buffer.split_to(consumed);
                trace!(
                    conn = %self.state.id,
                    consumed = consumed,
                    remaining = self.buffer.len(),
                    "Decoded packet"
                );

                if !packet.magic.is_request() {
                    return Err(ConnectionError::UnexpectedMagic(packet.magic));
                }
                Ok(Some(packet))
            }
            Ok(None) => {
                trace!(
                    conn = %self.state.id,
                    buffered = self.buffer.len(),
                    "Incomplete packet, need more data"
                );
                Ok(None)
            }
            // No way to resynchronise on a binary stream
            Err(e) => Err(ConnectionError::ParseError(e)),
        }
    }

    /// Reads more data from the socket into the buffer.
    async fn read_more_data(&mut self) -> Result<(), ConnectionError> {
        if self.buffer.len() >= MAX_BUFFER_SIZE {
            return Err(ConnectionError::BufferFull);
        }

        if self.buffer.capacity() - self.buffer.len() < 1024 {
            self.buffer.reserve(INITIAL_BUFFER_SIZE);
        }

        let n = self.stream.get_mut().read_buf(&mut self.buffer).await?;

        if n == 0 {
            if self.buffer.is_empty() {
                return Err(ConnectionError::ClientDisconnected);
            } else {
                // Partial packet in buffer
                return Err(ConnectionError::UnexpectedEof);
            }
        }

        self.stats.bytes_read(n);
        trace!(conn = %self.state.id, bytes = n, "Read data");

        Ok(())
    }

    /// Sends a response to the client.
    async fn send_response(&mut self, response: &Packet) -> Result<(), ConnectionError> {
        let bytes = self.codec.encode(response)?;
        self.stream.write_all(&bytes).await?;
        self.stream.flush().await?;
        self.stats.bytes_written(bytes.len());
        trace!(
            conn = %self.state.id,
            opcode = %response.opcode,
            status = %response.status,
            bytes = bytes.len(),
            "Sent response"
        );
        Ok(())
    }
}

/// Errors that can occur while handling a connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// I/O error (network issue)
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Malformed packet header
    #[error("Parse error: {0}")]
    ParseError(#[from] ParseError),

    /// A response could not be encoded
    #[error("Encode error: {0}")]
    EncodeError(#[from] EncodeError),

    /// The client sent a response packet
    #[error("Unexpected {0:?} packet from client")]
    UnexpectedMagic(Magic),

    /// Client disconnected normally
    #[error("Client disconnected")]
    ClientDisconnected,

    /// Unexpected end of stream (partial packet)
    #[error("Unexpected end of stream")]
    UnexpectedEof,

    /// Buffer size limit exceeded
    #[error("Buffer size limit exceeded")]
    BufferFull,
}

impl ConnectionError {
    /// True when the transport went away rather than the client misbehaving.
    ///
    /// These end the connection quietly.
    pub fn is_disconnect(&self) -> bool {
        match self {
            ConnectionError::ClientDisconnected | ConnectionError::UnexpectedEof => true,
            ConnectionError::IoError(e) => matches!(
                e.kind(),
                ErrorKind::BrokenPipe
                    | ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

/// Handles a client TCP connection.
///
/// Creates a ConnectionHandler and runs it to completion. The registration
/// is released when the handler finishes, whatever the outcome.
pub async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    registration: RegistrationGuard,
    translator: CommandTranslator,
    stats: Arc<ConnectionStats>,
    cancel: CancellationToken,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(client = %addr, error = %e, "Failed to set TCP_NODELAY");
    }
    let local_host = stream.local_addr().ok().map(|local| local.ip().to_string());

    let mut handler = ConnectionHandler::new(stream, addr, registration, translator, stats, cancel);
    if let Some(host) = local_host {
        handler = handler.with_local_host(host);
    }

    // run() has already logged how the connection ended
    let _ = handler.run().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticCredentials;
    use crate::backend::MemoryBackend;
    use crate::cluster::{ServicePorts, StaticTopology};
    use crate::connection::ConnectionRegistry;
    use crate::protocol::{FeatureSet, Status};
    use std::io;
    use tokio::net::TcpListener;

    fn create_translator() -> CommandTranslator {
        CommandTranslator::new(
            Arc::new(MemoryBackend::new(["default"])),
            Arc::new(StaticTopology::single_node(
                "127.0.0.1",
                ServicePorts::kv_node(8091, 11210),
                &["default".to_string()],
                16,
                0,
            )),
            Arc::new(StaticCredentials::new("user", "pencil")),
        )
    }

    async fn create_test_server() -> (SocketAddr, Arc<ConnectionRegistry>, Arc<ConnectionStats>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let registry = Arc::new(ConnectionRegistry::new());
        let stats = Arc::new(ConnectionStats::new());

        let registry_clone = Arc::clone(&registry);
        let stats_clone = Arc::clone(&stats);

        tokio::spawn(async move {
            while let Ok((stream, client_addr)) = listener.accept().await {
                let registration = registry_clone.register_guarded(client_addr);
                let stats = Arc::clone(&stats_clone);
                tokio::spawn(handle_connection(
                    stream,
                    client_addr,
                    registration,
                    create_translator(),
                    stats,
                    CancellationToken::new(),
                ));
            }
        });

        (addr, registry, stats)
    }

    /// Reads until one full response is decoded.
    async fn read_response(
        client: &mut TcpStream,
        codec: &PacketCodec,
        buf: &mut BytesMut,
    ) -> Packet {
        loop {
            if let Some((packet, consumed)) = codec.decode(buf).unwrap() {
                let _ = buf.split_to(consumed);
                return packet;
            }
            let n = client.read_buf(buf).await.unwrap();
            assert!(n > 0, "server closed the connection");
        }
    }

    async fn roundtrip(client: &mut TcpStream, codec: &PacketCodec, request: Packet) -> Packet {
        client.write_all(&codec.encode(&request).unwrap()).await.unwrap();
        let mut buf = BytesMut::new();
        read_response(client, codec, &mut buf).await
    }

    fn hello(codes: &[u16]) -> Packet {
        let value: Vec<u8> = codes.iter().flat_map(|c| c.to_be_bytes()).collect();
        Packet::request(Opcode::Hello).with_key("conn-test").with_value(value)
    }

    #[tokio::test]
    async fn test_hello_over_tcp() {
        let (addr, _, _) = create_test_server().await;
        let mut client = TcpStream::connect(addr).await.unwrap();
        let codec = PacketCodec::new();

        let request = hello(&[0x07, 0x0b]).with_opaque(0xabcd);
        let response = roundtrip(&mut client, &codec, request).await;

        assert_eq!(response.magic, Magic::Response);
        assert_eq!(response.status, Status::SUCCESS);
        assert_eq!(response.opaque, 0xabcd);
        assert_eq!(&response.value[..], &[0x00, 0x07, 0x00, 0x0b]);
    }

    #[tokio::test]
    async fn test_pipelined_requests_answer_in_order() {
        let (addr, _, _) = create_test_server().await;
        let mut client = TcpStream::connect(addr).await.unwrap();
        let codec = PacketCodec::new();

        let mut batch = BytesMut::new();
        for opaque in 1..=5u32 {
            let request = Packet::request(Opcode::SaslListMechs).with_opaque(opaque);
            codec.encode_into(&request, &mut batch).unwrap();
        }
        client.write_all(&batch).await.unwrap();

        let mut buf = BytesMut::new();
        for opaque in 1..=5u32 {
            let response = read_response(&mut client, &codec, &mut buf).await;
            assert_eq!(response.opaque, opaque);
            assert_eq!(response.status, Status::SUCCESS);
        }
    }

    #[tokio::test]
    async fn test_split_packet_is_reassembled() {
        let (addr, _, _) = create_test_server().await;
        let mut client = TcpStream::connect(addr).await.unwrap();
        let codec = PacketCodec::new();

        let bytes = codec
            .encode(&Packet::request(Opcode::SelectBucket).with_key("default").with_opaque(3))
            .unwrap();
        client.write_all(&bytes[..10]).await.unwrap();
        tokio::time::sleep(tokio::time::Duration::from_millis(20)).await;
        client.write_all(&bytes[10..]).await.unwrap();

        let mut buf = BytesMut::new();
        let response = read_response(&mut client, &codec, &mut buf).await;
        assert_eq!(response.opaque, 3);
        assert_eq!(response.status, Status::SUCCESS);
    }

    #[tokio::test]
    async fn test_unknown_opcode_keeps_connection() {
        let (addr, _, _) = create_test_server().await;
        let mut client = TcpStream::connect(addr).await.unwrap();
        let codec = PacketCodec::new();

        let request = Packet::request(Opcode::Unknown(0xe0)).with_opaque(9);
        let response = roundtrip(&mut client, &codec, request).await;
        assert_eq!(response.status, Status::UNKNOWN_COMMAND);
        assert_eq!(response.opaque, 9);

        let response = roundtrip(&mut client, &codec, Packet::request(Opcode::SaslListMechs)).await;
        assert_eq!(response.status, Status::SUCCESS);
    }

    #[tokio::test]
    async fn test_bad_magic_closes_connection() {
        let (addr, registry, _) = create_test_server().await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        let mut garbage = vec![0x42u8];
        garbage.extend_from_slice(&[0u8; 23]);
        client.write_all(&garbage).await.unwrap();

        let mut buf = [0u8; 64];
        let n = client.read(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0);

        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_response_magic_from_client_is_fatal() {
        let (addr, _, _) = create_test_server().await;
        let mut client = TcpStream::connect(addr).await.unwrap();
        let codec = PacketCodec::new();

        let request = Packet::request(Opcode::Get).with_key("k");
        let bogus = Packet::response_to(&request, Status::SUCCESS);
        client.write_all(&codec.encode(&bogus).unwrap()).await.unwrap();

        let mut buf = [0u8; 64];
        let n = client.read(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_collections_framing_after_hello() {
        let (addr, _, _) = create_test_server().await;
        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut codec = PacketCodec::new();

        let response = roundtrip(&mut client, &codec, hello(&[0x12])).await;
        assert_eq!(&response.value[..], &[0x00, 0x12]);
        codec.enable_feature(FeatureSet::COLLECTIONS);

        let select = Packet::request(Opcode::SelectBucket).with_key("default");
        roundtrip(&mut client, &codec, select).await;

        // collection 8 does not exist; the prefix must have been decoded
        let get = Packet::request(Opcode::Get).with_key("k").with_collection_id(8);
        let response = roundtrip(&mut client, &codec, get).await;
        assert_eq!(response.status, Status::UNKNOWN_COLLECTION);
    }

    /// Log output captured from a test-local subscriber.
    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<parking_lot::Mutex<Vec<u8>>>);

    impl CapturedLogs {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock()).into_owned()
        }
    }

    impl io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Runs a handler over a mock stream while capturing its logs.
    async fn run_mock(stream: tokio_test::io::Mock) -> (Result<(), ConnectionError>, String) {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let addr = SocketAddr::from(([127, 0, 0, 1], 40002));
        let registry = Arc::new(ConnectionRegistry::new());
        let handler = ConnectionHandler::new(
            stream,
            addr,
            registry.register_guarded(addr),
            create_translator(),
            Arc::new(ConnectionStats::new()),
            CancellationToken::new(),
        );

        let result = handler.run().await;
        assert!(registry.is_empty());
        (result, logs.contents())
    }

    #[tokio::test]
    async fn test_broken_pipe_closes_quietly() {
        let codec = PacketCodec::new();
        let request = Packet::request(Opcode::SaslListMechs).with_opaque(1);

        let stream = tokio_test::io::Builder::new()
            .read(&codec.encode(&request).unwrap())
            .write_error(io::Error::new(io::ErrorKind::BrokenPipe, "broken pipe"))
            .build();

        let (result, logs) = run_mock(stream).await;
        assert!(matches!(
            &result,
            Err(ConnectionError::IoError(e)) if e.kind() == io::ErrorKind::BrokenPipe
        ));
        assert!(logs.contains("Client disconnected"), "{}", logs);
        assert!(!logs.contains("WARN"), "{}", logs);
    }

    #[tokio::test]
    async fn test_eof_mid_packet_closes_quietly() {
        let codec = PacketCodec::new();
        let bytes = codec
            .encode(&Packet::request(Opcode::SelectBucket).with_key("default"))
            .unwrap();

        let stream = tokio_test::io::Builder::new().read(&bytes[..10]).build();

        let (result, logs) = run_mock(stream).await;
        assert!(matches!(result, Err(ConnectionError::UnexpectedEof)));
        assert!(!logs.contains("WARN"), "{}", logs);
    }

    #[tokio::test]
    async fn test_framing_error_logged_once() {
        let mut garbage = vec![0x42u8];
        garbage.extend_from_slice(&[0u8; 23]);
        let stream = tokio_test::io::Builder::new().read(&garbage).build();

        let (result, logs) = run_mock(stream).await;
        assert!(matches!(result, Err(ConnectionError::ParseError(_))));
        assert_eq!(logs.matches("WARN").count(), 1, "{}", logs);
    }

    #[tokio::test]
    async fn test_malformed_collection_prefix_keeps_connection() {
        let (addr, _, _) = create_test_server().await;
        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut codec = PacketCodec::new();

        let response = roundtrip(&mut client, &codec, hello(&[0x12])).await;
        assert_eq!(&response.value[..], &[0x00, 0x12]);
        codec.enable_feature(FeatureSet::COLLECTIONS);

        // An empty key has no room for the collection id
        let get = Packet::request(Opcode::Get).with_opaque(0x77);
        let response = roundtrip(&mut client, &codec, get).await;
        assert_eq!(response.status, Status::EINVAL);
        assert_eq!(response.opaque, 0x77);

        let response = roundtrip(&mut client, &codec, Packet::request(Opcode::SaslListMechs)).await;
        assert_eq!(response.status, Status::SUCCESS);
    }

    #[tokio::test]
    async fn test_connection_stats_and_registry() {
        let (addr, registry, stats) = create_test_server().await;

        assert_eq!(stats.active_connections.load(Ordering::Relaxed), 0);

        let mut client = TcpStream::connect(addr).await.unwrap();

        // Give the server time to accept the connection
        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;

        assert_eq!(stats.connections_accepted.load(Ordering::Relaxed), 1);
        assert_eq!(stats.active_connections.load(Ordering::Relaxed), 1);
        assert_eq!(registry.len(), 1);

        let codec = PacketCodec::new();
        roundtrip(&mut client, &codec, Packet::request(Opcode::SaslListMechs)).await;

        assert!(stats.commands_processed.load(Ordering::Relaxed) >= 1);
        assert!(stats.bytes_read.load(Ordering::Relaxed) > 0);
        assert!(stats.bytes_written.load(Ordering::Relaxed) > 0);

        drop(client);

        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;

        assert_eq!(stats.active_connections.load(Ordering::Relaxed), 0);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_mock_stream_exchange() {
        let codec = PacketCodec::new();
        let request = Packet::request(Opcode::SelectBucket).with_key("default").with_opaque(1);
        let expected = codec
            .encode(&Packet::response_to(&request, Status::SUCCESS))
            .unwrap();

        let stream = tokio_test::io::Builder::new()
            .read(&codec.encode(&request).unwrap())
            .write(&expected)
            .build();

        let registry = Arc::new(ConnectionRegistry::new());
        let handler = ConnectionHandler::new(
            stream,
            SocketAddr::from(([127, 0, 0, 1], 40000)),
            registry.register_guarded(SocketAddr::from(([127, 0, 0, 1], 40000))),
            create_translator(),
            Arc::new(ConnectionStats::new()),
            CancellationToken::new(),
        );

        let result = handler.run().await;
        assert!(matches!(result, Err(ConnectionError::ClientDisconnected)));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_ends_idle_connection() {
        let (server_side, _client_side) = tokio::io::duplex(1024);
        let registry = Arc::new(ConnectionRegistry::new());
        let cancel = CancellationToken::new();
        let stats = Arc::new(ConnectionStats::new());

        let handler = ConnectionHandler::new(
            server_side,
            SocketAddr::from(([127, 0, 0, 1], 40001)),
            registry.register_guarded(SocketAddr::from(([127, 0, 0, 1], 40001))),
            create_translator(),
            Arc::clone(&stats),
            cancel.clone(),
        );
        let task = tokio::spawn(handler.run());

        tokio::time::sleep(tokio::time::Duration::from_millis(20)).await;
        cancel.cancel();

        let result = tokio::time::timeout(tokio::time::Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
        assert!(registry.is_empty());
        assert_eq!(stats.active_connections.load(Ordering::Relaxed), 0);
    }
}

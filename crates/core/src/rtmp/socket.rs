//! RTMP connection state machine over a duplex byte stream.
//!
//! [`RtmpSocket`] is a cheap handle; all connection state lives in an
//! actor task that owns the listener. Dialing, the connect timeout, the
//! read loop and the write queue each run as their own task and post
//! events back to the actor tagged with a connection generation. Every
//! `connect()` and `close()` bumps the generation, so continuations from
//! an earlier attempt are ignored.

use std::future::Future;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::chunk::{Chunk, DEFAULT_CHUNK_SIZE};
use super::handshake::{self, SIGNATURE_SIZE};
use super::{ConnectionStatus, ReadyState};
use crate::error::{Error, Result};

/// Socket tuning.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// Time allowed from `connect()` until the transport is ready.
    pub connect_timeout: Duration,
    /// Upper bound for a single read from the transport.
    pub read_buffer_size: usize,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            read_buffer_size: 4096,
        }
    }
}

/// Opens the duplex stream a socket runs on.
pub trait Connector: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    fn connect(&self, host: &str, port: u16)
    -> impl Future<Output = io::Result<Self::Stream>> + Send;
}

/// Plain TCP with Nagle disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    type Stream = TcpStream;

    fn connect(&self, host: &str, port: u16) -> impl Future<Output = io::Result<TcpStream>> + Send {
        let host = host.to_owned();
        async move {
            let stream = TcpStream::connect((host.as_str(), port)).await?;
            stream.set_nodelay(true)?;
            Ok(stream)
        }
    }
}

/// Receives everything the socket reports. Called from the socket's task.
pub trait RtmpSocketListener: Send + 'static {
    /// Post-handshake input. Consume what can be parsed from the front of
    /// `buffer`; whatever is left stays buffered for the next call.
    fn data_received(&mut self, buffer: &mut BytesMut);

    fn ready_state_changed(&mut self, _state: ReadyState) {}

    /// Running total of bytes written for the current connection.
    fn stats_updated(&mut self, _total_bytes_out: u64) {}

    /// The connection ended without `close()`.
    fn status(&mut self, _status: ConnectionStatus) {}
}

#[derive(Debug)]
struct Shared {
    ready_state: Mutex<ReadyState>,
    total_bytes_in: AtomicU64,
    total_bytes_out: AtomicU64,
    chunk_size_to_server: AtomicUsize,
    chunk_size_from_server: AtomicUsize,
}

impl Shared {
    fn new() -> Self {
        Self {
            ready_state: Mutex::new(ReadyState::Uninitialized),
            total_bytes_in: AtomicU64::new(0),
            total_bytes_out: AtomicU64::new(0),
            chunk_size_to_server: AtomicUsize::new(DEFAULT_CHUNK_SIZE),
            chunk_size_from_server: AtomicUsize::new(DEFAULT_CHUNK_SIZE),
        }
    }

    fn reset(&self) {
        self.total_bytes_in.store(0, Ordering::Relaxed);
        self.total_bytes_out.store(0, Ordering::Relaxed);
        self.chunk_size_to_server
            .store(DEFAULT_CHUNK_SIZE, Ordering::Relaxed);
        self.chunk_size_from_server
            .store(DEFAULT_CHUNK_SIZE, Ordering::Relaxed);
    }
}

#[derive(Debug)]
enum Command {
    Connect { host: String, port: u16 },
    Write(Bytes),
    ChunkSizeToServer(usize),
    ChunkSizeFromServer(usize),
    Close,
}

enum Event<S> {
    Ready { generation: u64, stream: S },
    DialFailed { generation: u64, error: io::Error },
    Timeout { generation: u64 },
    Received { generation: u64, data: Bytes },
    ReadClosed { generation: u64, error: Option<io::Error> },
    Written { generation: u64, len: usize },
    WriteFailed { generation: u64, error: io::Error },
}

impl<S> Event<S> {
    fn generation(&self) -> u64 {
        match self {
            Self::Ready { generation, .. }
            | Self::DialFailed { generation, .. }
            | Self::Timeout { generation }
            | Self::Received { generation, .. }
            | Self::ReadClosed { generation, .. }
            | Self::Written { generation, .. }
            | Self::WriteFailed { generation, .. } => *generation,
        }
    }
}

/// Handle to an RTMP client socket.
///
/// Dropping the handle stops the socket's task and aborts the connection.
#[derive(Debug)]
pub struct RtmpSocket {
    commands: mpsc::UnboundedSender<Command>,
    shared: Arc<Shared>,
}

impl RtmpSocket {
    /// TCP socket with default settings. Must be called within a tokio runtime.
    pub fn new<L: RtmpSocketListener>(listener: L) -> Self {
        Self::with_connector(TcpConnector, SocketConfig::default(), listener)
    }

    pub fn with_connector<C: Connector, L: RtmpSocketListener>(
        connector: C,
        config: SocketConfig,
        listener: L,
    ) -> Self {
        let shared = Arc::new(Shared::new());
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (events, event_rx) = mpsc::unbounded_channel();
        let actor = Actor {
            connector: Arc::new(connector),
            config,
            listener,
            shared: shared.clone(),
            events,
            generation: 0,
            state: ReadyState::Uninitialized,
            input: BytesMut::new(),
            connected: false,
            link: None,
        };
        tokio::spawn(actor.run(command_rx, event_rx));
        Self { commands, shared }
    }

    /// Drop any previous connection and start a new attempt.
    pub fn connect(&self, host: &str, port: u16) -> Result<()> {
        self.send(Command::Connect {
            host: host.to_owned(),
            port,
        })
    }

    /// Split `chunk` at the outbound chunk size and queue every piece.
    /// Returns the message length.
    pub fn write(&self, chunk: &Chunk) -> Result<usize> {
        let max_size = self.maximum_chunk_size_to_server();
        for piece in chunk.split(max_size) {
            self.send(Command::Write(piece))?;
        }
        Ok(chunk.message.len())
    }

    /// Flush what is queued, then shut the connection down. No status is
    /// reported for a close requested here.
    pub fn close(&self) -> Result<()> {
        self.send(Command::Close)
    }

    pub fn ready_state(&self) -> ReadyState {
        *self.shared.ready_state.lock()
    }

    pub fn total_bytes_in(&self) -> u64 {
        self.shared.total_bytes_in.load(Ordering::Relaxed)
    }

    pub fn total_bytes_out(&self) -> u64 {
        self.shared.total_bytes_out.load(Ordering::Relaxed)
    }

    pub fn maximum_chunk_size_to_server(&self) -> usize {
        self.shared.chunk_size_to_server.load(Ordering::Relaxed)
    }

    /// Takes effect immediately and is re-applied by the socket task after
    /// any `connect()` queued before it, so it survives the reconnect reset.
    pub fn set_maximum_chunk_size_to_server(&self, size: usize) -> Result<()> {
        self.shared.chunk_size_to_server.store(size, Ordering::Relaxed);
        self.send(Command::ChunkSizeToServer(size))
    }

    pub fn maximum_chunk_size_from_server(&self) -> usize {
        self.shared.chunk_size_from_server.load(Ordering::Relaxed)
    }

    pub fn set_maximum_chunk_size_from_server(&self, size: usize) -> Result<()> {
        self.shared
            .chunk_size_from_server
            .store(size, Ordering::Relaxed);
        self.send(Command::ChunkSizeFromServer(size))
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands.send(command).map_err(|_| Error::SocketGone)
    }
}

/// Tasks and write queue of the current connection attempt.
struct Link {
    dial: JoinHandle<()>,
    timeout: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
    writer: Option<(mpsc::UnboundedSender<Bytes>, JoinHandle<()>)>,
}

impl Link {
    /// Abort everything, discarding queued writes.
    fn abort(self) {
        self.dial.abort();
        if let Some(timeout) = self.timeout {
            timeout.abort();
        }
        if let Some(reader) = self.reader {
            reader.abort();
        }
        if let Some((_, writer)) = self.writer {
            writer.abort();
        }
    }

    /// Abort everything except the writer, which drains its queue and
    /// shuts the write half down once the sender is dropped.
    fn finish(self) {
        self.dial.abort();
        if let Some(timeout) = self.timeout {
            timeout.abort();
        }
        if let Some(reader) = self.reader {
            reader.abort();
        }
    }
}

struct Actor<C: Connector, L> {
    connector: Arc<C>,
    config: SocketConfig,
    listener: L,
    shared: Arc<Shared>,
    events: mpsc::UnboundedSender<Event<C::Stream>>,
    generation: u64,
    state: ReadyState,
    input: BytesMut,
    /// The transport is up; cleared by any teardown.
    connected: bool,
    link: Option<Link>,
}

impl<C: Connector, L: RtmpSocketListener> Actor<C, L> {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<Event<C::Stream>>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(event) = events.recv() => self.handle_event(event),
            }
        }
        if let Some(link) = self.link.take() {
            link.abort();
        }
        tracing::debug!("rtmp socket handle dropped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { host, port } => self.connect(host, port),
            Command::Write(data) => self.write(data),
            Command::ChunkSizeToServer(size) => {
                self.shared.chunk_size_to_server.store(size, Ordering::Relaxed);
            }
            Command::ChunkSizeFromServer(size) => {
                self.shared
                    .chunk_size_from_server
                    .store(size, Ordering::Relaxed);
            }
            Command::Close => self.close(),
        }
    }

    fn connect(&mut self, host: String, port: u16) {
        if let Some(link) = self.link.take() {
            link.abort();
        }
        self.generation += 1;
        self.connected = false;
        self.shared.reset();
        self.input = BytesMut::new();
        self.set_state(ReadyState::Uninitialized);

        tracing::info!(%host, port, generation = self.generation, "rtmp connecting");

        let generation = self.generation;
        let connector = self.connector.clone();
        let events = self.events.clone();
        let dial = tokio::spawn(async move {
            let event = match connector.connect(&host, port).await {
                Ok(stream) => Event::Ready { generation, stream },
                Err(error) => Event::DialFailed { generation, error },
            };
            let _ = events.send(event);
        });

        let events = self.events.clone();
        let connect_timeout = self.config.connect_timeout;
        let timeout = tokio::spawn(async move {
            tokio::time::sleep(connect_timeout).await;
            let _ = events.send(Event::Timeout { generation });
        });

        self.link = Some(Link {
            dial,
            timeout: Some(timeout),
            reader: None,
            writer: None,
        });
    }

    fn close(&mut self) {
        if let Some(link) = self.link.take() {
            link.finish();
        }
        self.generation += 1;
        self.connected = false;
        self.set_state(ReadyState::Closed);
        tracing::info!("rtmp socket closed");
    }

    /// Tear the connection down after a failure and report it.
    fn fail(&mut self, reason: &str) {
        let Some(link) = self.link.take() else {
            return;
        };
        let status = if self.state == ReadyState::HandshakeDone {
            ConnectionStatus::ConnectClosed
        } else {
            ConnectionStatus::ConnectFailed
        };
        tracing::warn!(reason, state = %self.state, status = status.code(), "rtmp connection lost");
        link.abort();
        self.generation += 1;
        self.connected = false;
        self.set_state(ReadyState::Closed);
        self.listener.status(status);
    }

    fn handle_event(&mut self, event: Event<C::Stream>) {
        if event.generation() != self.generation {
            return;
        }
        match event {
            Event::Ready { stream, .. } => self.on_ready(stream),
            Event::DialFailed { error, .. } => {
                tracing::debug!(%error, "rtmp dial failed");
                self.fail("dial failed");
            }
            Event::Timeout { .. } => {
                // The timer may fire in the same turn readiness disarmed it.
                let armed = self.link.as_ref().is_some_and(|link| link.timeout.is_some());
                if armed {
                    self.fail("connect timeout");
                }
            }
            Event::Received { data, .. } => self.on_received(data),
            Event::ReadClosed { error, .. } => {
                if let Some(error) = error {
                    tracing::debug!(%error, "rtmp read failed");
                }
                self.fail("connection no longer viable");
            }
            Event::Written { len, .. } => {
                if !self.connected {
                    return;
                }
                let total = self.shared.total_bytes_out.fetch_add(len as u64, Ordering::Relaxed)
                    + len as u64;
                self.listener.stats_updated(total);
            }
            Event::WriteFailed { error, .. } => {
                tracing::debug!(%error, "rtmp write failed");
                self.fail("write failed");
            }
        }
    }

    fn on_ready(&mut self, stream: C::Stream) {
        let Some(link) = self.link.as_mut() else {
            return;
        };
        if let Some(timeout) = link.timeout.take() {
            timeout.abort();
        }

        let generation = self.generation;
        let (mut read_half, mut write_half) = tokio::io::split(stream);

        let events = self.events.clone();
        let read_buffer_size = self.config.read_buffer_size;
        link.reader = Some(tokio::spawn(async move {
            loop {
                let mut buf = BytesMut::with_capacity(read_buffer_size);
                let event = match read_half.read_buf(&mut buf).await {
                    Ok(0) => Event::ReadClosed {
                        generation,
                        error: None,
                    },
                    Ok(_) => Event::Received {
                        generation,
                        data: buf.freeze(),
                    },
                    Err(error) => Event::ReadClosed {
                        generation,
                        error: Some(error),
                    },
                };
                let done = matches!(event, Event::ReadClosed { .. });
                if events.send(event).is_err() || done {
                    break;
                }
            }
        }));

        let events = self.events.clone();
        let (queue, mut pending) = mpsc::unbounded_channel::<Bytes>();
        let writer = tokio::spawn(async move {
            while let Some(data) = pending.recv().await {
                if let Err(error) = write_half.write_all(&data).await {
                    let _ = events.send(Event::WriteFailed { generation, error });
                    return;
                }
                let _ = events.send(Event::Written {
                    generation,
                    len: data.len(),
                });
            }
            if let Err(error) = write_half.shutdown().await {
                tracing::debug!(%error, "rtmp write shutdown failed");
            }
        });
        link.writer = Some((queue, writer));

        tracing::info!(generation, "rtmp transport ready");
        self.connected = true;
        self.write(handshake::initial_packet());
        self.set_state(ReadyState::VersionSent);
    }

    fn on_received(&mut self, data: Bytes) {
        if !self.connected {
            return;
        }
        self.shared
            .total_bytes_in
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        self.input.extend_from_slice(&data);
        self.process_input();
    }

    /// Advance the handshake as far as the buffered input allows.
    fn process_input(&mut self) {
        loop {
            match self.state {
                ReadyState::VersionSent => {
                    if self.input.len() < SIGNATURE_SIZE + 1 {
                        return;
                    }
                    let Ok(c2) = handshake::response_packet(&self.input) else {
                        return;
                    };
                    self.write(c2);
                    self.input.advance(SIGNATURE_SIZE + 1);
                    self.set_state(ReadyState::AckSent);
                }
                ReadyState::AckSent => {
                    if self.input.len() < SIGNATURE_SIZE {
                        return;
                    }
                    self.input.advance(SIGNATURE_SIZE);
                    self.set_state(ReadyState::HandshakeDone);
                }
                ReadyState::HandshakeDone => {
                    if !self.input.is_empty() {
                        self.listener.data_received(&mut self.input);
                    }
                    return;
                }
                ReadyState::Uninitialized | ReadyState::Closed => return,
            }
        }
    }

    fn write(&mut self, data: Bytes) {
        let Some((queue, _)) = self.link.as_ref().and_then(|link| link.writer.as_ref()) else {
            tracing::trace!(len = data.len(), "rtmp not connected, dropping write");
            return;
        };
        if queue.send(data).is_err() {
            self.fail("writer gone");
        }
    }

    fn set_state(&mut self, next: ReadyState) {
        if self.state == next {
            return;
        }
        match self.state.transition(next) {
            Ok(state) => {
                tracing::info!(from = %self.state, to = %state, "rtmp socket state");
                self.state = state;
                *self.shared.ready_state.lock() = state;
                self.listener.ready_state_changed(state);
            }
            Err(error) => tracing::warn!(%error, "ignoring ready state change"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtmp::Message;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{DuplexStream, ReadBuf};

    #[derive(Debug, PartialEq)]
    enum Observed {
        State(ReadyState),
        Stats(u64),
        Status(ConnectionStatus),
        Data(Vec<u8>),
    }

    struct Recorder(mpsc::UnboundedSender<Observed>);

    impl RtmpSocketListener for Recorder {
        fn data_received(&mut self, buffer: &mut BytesMut) {
            let _ = self.0.send(Observed::Data(buffer.split().to_vec()));
        }

        fn ready_state_changed(&mut self, state: ReadyState) {
            let _ = self.0.send(Observed::State(state));
        }

        fn stats_updated(&mut self, total_bytes_out: u64) {
            let _ = self.0.send(Observed::Stats(total_bytes_out));
        }

        fn status(&mut self, status: ConnectionStatus) {
            let _ = self.0.send(Observed::Status(status));
        }
    }

    /// Hands out one end of an in-memory pipe, once.
    struct PipeConnector<S>(Mutex<Option<S>>);

    impl<S: AsyncRead + AsyncWrite + Send + Unpin + 'static> Connector for PipeConnector<S> {
        type Stream = S;

        fn connect(&self, _host: &str, _port: u16) -> impl Future<Output = io::Result<S>> + Send {
            let stream = self.0.lock().take();
            async move { stream.ok_or_else(|| io::Error::from(io::ErrorKind::ConnectionRefused)) }
        }
    }

    /// Pipe end whose writes break after `budget` bytes.
    struct BrokenWrites {
        inner: DuplexStream,
        budget: usize,
    }

    impl AsyncRead for BrokenWrites {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for BrokenWrites {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            if self.budget == 0 {
                return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
            }
            let this = &mut *self;
            let len = buf.len().min(this.budget);
            let written = Pin::new(&mut this.inner).poll_write(cx, &buf[..len]);
            if let Poll::Ready(Ok(n)) = written {
                this.budget -= n;
            }
            written
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_flush(cx)
        }

        fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_shutdown(cx)
        }
    }

    /// Never becomes ready.
    struct StalledConnector;

    impl Connector for StalledConnector {
        type Stream = DuplexStream;

        fn connect(&self, _host: &str, _port: u16) -> impl Future<Output = io::Result<DuplexStream>> + Send {
            std::future::pending()
        }
    }

    fn pipe_socket() -> (RtmpSocket, DuplexStream, mpsc::UnboundedReceiver<Observed>) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (tx, rx) = mpsc::unbounded_channel();
        let socket = RtmpSocket::with_connector(
            PipeConnector(Mutex::new(Some(client))),
            SocketConfig::default(),
            Recorder(tx),
        );
        (socket, server, rx)
    }

    fn broken_socket(budget: usize) -> (RtmpSocket, DuplexStream, mpsc::UnboundedReceiver<Observed>) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (tx, rx) = mpsc::unbounded_channel();
        let stream = BrokenWrites {
            inner: client,
            budget,
        };
        let socket = RtmpSocket::with_connector(
            PipeConnector(Mutex::new(Some(stream))),
            SocketConfig::default(),
            Recorder(tx),
        );
        (socket, server, rx)
    }

    fn command_chunk(payload: Bytes) -> Chunk {
        Chunk::new(
            3,
            Message {
                type_id: 0x14,
                stream_id: 0,
                timestamp: 0,
                payload,
            },
        )
        .unwrap()
    }

    /// Drop the socket and return everything the listener saw afterwards.
    async fn drain(socket: RtmpSocket, rx: &mut mpsc::UnboundedReceiver<Observed>) -> Vec<Observed> {
        drop(socket);
        let mut rest = Vec::new();
        while let Some(observed) = rx.recv().await {
            rest.push(observed);
        }
        rest
    }

    /// Skip ahead to `wanted`; byte-count updates may interleave anywhere.
    async fn wait_for(rx: &mut mpsc::UnboundedReceiver<Observed>, wanted: Observed) {
        while let Some(observed) = rx.recv().await {
            if observed == wanted {
                return;
            }
        }
        panic!("listener closed before {wanted:?}");
    }

    fn server_hello(trailing: &[u8]) -> Vec<u8> {
        let mut hello = vec![3];
        hello.extend_from_slice(&[0, 0, 0, 7, 0, 0, 0, 0]);
        hello.extend((0..SIGNATURE_SIZE - 8).map(|i| i as u8));
        hello.extend(vec![0x5A; SIGNATURE_SIZE]);
        hello.extend_from_slice(trailing);
        hello
    }

    /// Run the server side of the handshake and return C2.
    async fn accept(server: &mut DuplexStream, trailing: &[u8]) -> Vec<u8> {
        let mut c0c1 = vec![0u8; 1 + SIGNATURE_SIZE];
        server.read_exact(&mut c0c1).await.unwrap();
        assert_eq!(c0c1[0], 3);
        server.write_all(&server_hello(trailing)).await.unwrap();
        let mut c2 = vec![0u8; SIGNATURE_SIZE];
        server.read_exact(&mut c2).await.unwrap();
        c2
    }

    #[tokio::test(start_paused = true)]
    async fn connect_timeout_reports_failure() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let socket =
            RtmpSocket::with_connector(StalledConnector, SocketConfig::default(), Recorder(tx));
        socket.connect("ingest.invalid", 1935).unwrap();

        tokio::time::sleep(Duration::from_secs(9)).await;
        assert_eq!(socket.ready_state(), ReadyState::Uninitialized);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(rx.recv().await, Some(Observed::State(ReadyState::Closed)));
        assert_eq!(
            rx.recv().await,
            Some(Observed::Status(ConnectionStatus::ConnectFailed))
        );
        assert_eq!(socket.ready_state(), ReadyState::Closed);
        assert_eq!(socket.total_bytes_out(), 0);
    }

    #[tokio::test]
    async fn dial_failure_reports_failure() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let socket = RtmpSocket::with_connector(
            PipeConnector::<DuplexStream>(Mutex::new(None)),
            SocketConfig::default(),
            Recorder(tx),
        );
        socket.connect("localhost", 1935).unwrap();
        wait_for(&mut rx, Observed::Status(ConnectionStatus::ConnectFailed)).await;
        assert_eq!(socket.ready_state(), ReadyState::Closed);
    }

    #[tokio::test]
    async fn handshake_forwards_trailing_bytes() {
        let (socket, mut server, mut rx) = pipe_socket();
        socket.connect("localhost", 1935).unwrap();

        let c2 = accept(&mut server, b"hello").await;
        let hello = server_hello(b"");
        assert_eq!(&c2[..4], &hello[1..5]);
        assert_eq!(&c2[4..8], &[0; 4]);
        assert_eq!(&c2[8..], &hello[9..1 + SIGNATURE_SIZE]);

        assert_eq!(rx.recv().await, Some(Observed::State(ReadyState::VersionSent)));
        let mut states = Vec::new();
        let mut data = Vec::new();
        while data.len() < 5 {
            match rx.recv().await.unwrap() {
                Observed::State(state) => states.push(state),
                Observed::Data(bytes) => data.extend(bytes),
                _ => {}
            }
        }
        assert_eq!(states, vec![ReadyState::AckSent, ReadyState::HandshakeDone]);
        assert_eq!(data, b"hello");
        assert_eq!(socket.ready_state(), ReadyState::HandshakeDone);
        assert_eq!(
            socket.total_bytes_in(),
            (1 + 2 * SIGNATURE_SIZE + 5) as u64
        );
    }

    #[tokio::test]
    async fn write_splits_at_chunk_size() {
        let (socket, mut server, mut rx) = pipe_socket();
        socket.connect("localhost", 1935).unwrap();
        accept(&mut server, b"").await;
        wait_for(&mut rx, Observed::State(ReadyState::HandshakeDone)).await;

        let chunk = Chunk::new(
            3,
            Message {
                type_id: 0x14,
                stream_id: 0,
                timestamp: 0,
                payload: Bytes::from(vec![0x02; 300]),
            },
        )
        .unwrap();
        assert_eq!(socket.write(&chunk).unwrap(), 300);

        let mut wire = vec![0u8; 12 + 128 + 1 + 128 + 1 + 44];
        server.read_exact(&mut wire).await.unwrap();
        assert_eq!(wire[0], 0x03);
        assert_eq!(wire[12 + 128], 0xC3);
        assert_eq!(wire[12 + 128 + 1 + 128], 0xC3);

        let handshake = (1 + 2 * SIGNATURE_SIZE) as u64;
        wait_for(&mut rx, Observed::Stats(handshake + wire.len() as u64)).await;
        assert_eq!(socket.total_bytes_out(), handshake + wire.len() as u64);
    }

    #[tokio::test]
    async fn peer_hangup_after_handshake_reports_closed() {
        let (socket, mut server, mut rx) = pipe_socket();
        socket.connect("localhost", 1935).unwrap();
        accept(&mut server, b"").await;
        wait_for(&mut rx, Observed::State(ReadyState::HandshakeDone)).await;

        drop(server);
        wait_for(&mut rx, Observed::State(ReadyState::Closed)).await;
        assert_eq!(
            rx.recv().await,
            Some(Observed::Status(ConnectionStatus::ConnectClosed))
        );
    }

    #[tokio::test]
    async fn close_flushes_and_reports_no_status() {
        let (socket, mut server, mut rx) = pipe_socket();
        socket.connect("localhost", 1935).unwrap();
        accept(&mut server, b"").await;
        wait_for(&mut rx, Observed::State(ReadyState::HandshakeDone)).await;

        let chunk = Chunk::new(
            3,
            Message {
                type_id: 0x14,
                stream_id: 0,
                timestamp: 0,
                payload: Bytes::from_static(b"deleteStream"),
            },
        )
        .unwrap();
        socket.write(&chunk).unwrap();
        socket.close().unwrap();

        // Queued bytes are flushed before the write half shuts down.
        let mut rest = Vec::new();
        server.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest.len(), 12 + 12);

        wait_for(&mut rx, Observed::State(ReadyState::Closed)).await;
        drop(socket);
        while let Some(observed) = rx.recv().await {
            assert!(!matches!(observed, Observed::Status(_)));
        }
    }

    #[tokio::test]
    async fn reconnect_resets_counters_and_chunk_sizes() {
        let (socket, mut server, mut rx) = pipe_socket();
        socket.set_maximum_chunk_size_to_server(4096).unwrap();
        socket.connect("localhost", 1935).unwrap();
        accept(&mut server, b"").await;
        wait_for(&mut rx, Observed::State(ReadyState::HandshakeDone)).await;
        assert!(socket.total_bytes_in() > 0);

        socket.connect("localhost", 1935).unwrap();
        wait_for(&mut rx, Observed::State(ReadyState::Uninitialized)).await;
        assert_eq!(socket.total_bytes_in(), 0);
        assert_eq!(socket.maximum_chunk_size_to_server(), DEFAULT_CHUNK_SIZE);
        // The pipe was handed out already, so the second dial fails.
        wait_for(&mut rx, Observed::Status(ConnectionStatus::ConnectFailed)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_in_same_turn_as_readiness_is_ignored() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (events, _undelivered) = mpsc::unbounded_channel();
        let mut actor = Actor {
            connector: Arc::new(StalledConnector),
            config: SocketConfig::default(),
            listener: Recorder(tx),
            shared: Arc::new(Shared::new()),
            events,
            generation: 0,
            state: ReadyState::Uninitialized,
            input: BytesMut::new(),
            connected: false,
            link: None,
        };
        actor.connect("localhost".to_owned(), 1935);
        let generation = actor.generation;

        // The transport comes up exactly at the deadline; both events are
        // already queued when the actor gets to them.
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        actor.handle_event(Event::Ready {
            generation,
            stream: client,
        });
        actor.handle_event(Event::Timeout { generation });
        assert_eq!(actor.state, ReadyState::VersionSent);
        assert!(actor.connected);

        let mut c0c1 = vec![0u8; 1 + SIGNATURE_SIZE];
        server.read_exact(&mut c0c1).await.unwrap();
        assert_eq!(c0c1[0], 3);

        drop(actor);
        let mut seen = Vec::new();
        while let Some(observed) = rx.recv().await {
            seen.push(observed);
        }
        assert_eq!(seen, vec![Observed::State(ReadyState::VersionSent)]);
    }

    #[tokio::test]
    async fn write_failure_after_handshake_reports_closed() {
        let handshake = 1 + 2 * SIGNATURE_SIZE;
        let (socket, mut server, mut rx) = broken_socket(handshake);
        socket.connect("localhost", 1935).unwrap();
        accept(&mut server, b"").await;
        wait_for(&mut rx, Observed::State(ReadyState::HandshakeDone)).await;

        socket
            .write(&command_chunk(Bytes::from_static(b"publish")))
            .unwrap();
        wait_for(&mut rx, Observed::State(ReadyState::Closed)).await;
        assert_eq!(
            rx.recv().await,
            Some(Observed::Status(ConnectionStatus::ConnectClosed))
        );
        assert_eq!(socket.ready_state(), ReadyState::Closed);
        assert_eq!(socket.total_bytes_out(), handshake as u64);

        // Later writes go nowhere and report nothing.
        socket
            .write(&command_chunk(Bytes::from_static(b"publish")))
            .unwrap();
        let rest = drain(socket, &mut rx).await;
        assert!(rest.is_empty(), "unexpected notifications: {rest:?}");
    }

    #[tokio::test]
    async fn write_failure_during_handshake_reports_failed() {
        let (socket, server, mut rx) = broken_socket(100);
        socket.connect("localhost", 1935).unwrap();

        wait_for(&mut rx, Observed::State(ReadyState::Closed)).await;
        assert_eq!(
            rx.recv().await,
            Some(Observed::Status(ConnectionStatus::ConnectFailed))
        );
        assert_eq!(socket.total_bytes_out(), 0);
        let rest = drain(socket, &mut rx).await;
        assert!(rest.iter().all(|o| !matches!(o, Observed::Stats(_))));
        drop(server);
    }

    #[tokio::test]
    async fn chunk_size_set_after_connect_survives_reset() {
        let (socket, mut server, mut rx) = pipe_socket();
        socket.connect("localhost", 1935).unwrap();
        socket.set_maximum_chunk_size_to_server(4096).unwrap();
        accept(&mut server, b"").await;
        wait_for(&mut rx, Observed::State(ReadyState::HandshakeDone)).await;
        assert_eq!(socket.maximum_chunk_size_to_server(), 4096);

        socket
            .write(&command_chunk(Bytes::from(vec![0x02; 300])))
            .unwrap();
        let mut wire = vec![0u8; 12 + 300];
        server.read_exact(&mut wire).await.unwrap();
        assert_eq!(wire[0], 0x03);
        assert!(wire[12..].iter().all(|&b| b == 0x02));
    }
}

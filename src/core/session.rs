//! Live instrument session
//!
//! An [`InstrumentSession`] owns one connection to an instrument (usually
//! through a port agent) and everything bound to it: the inbound record
//! parser, the protocol state machine, the command builders and a single
//! response-wait slot.
//!
//! One background task reads the connection and is the only writer of the
//! parser. Every record it completes goes either to the outstanding
//! response wait, when the record matches the expected prompt, or to the
//! event sink and the broadcast channel as an unsolicited sample. Callers
//! issue commands from their own tasks; writes are serialized by a send
//! lock, and commands by a command lock so only one wait is ever pending.

use crate::core::chunker::{from_fn, Chunk, Sieve, DEFAULT_DESYNC_WINDOW};
use crate::core::logger::{LogFormat, TrafficLogger};
use crate::core::parser::{ParseEvent, ParserCheckpoint, RecordParser};
use crate::core::protocol::port_agent::{read_packet, write_packet, FramingError, PacketType, WirePacket};
use crate::core::sample::{DecodeError, Sample, SampleDecoder, Schema};
use crate::core::state_machine::{ProtocolStateMachine, StateMachineError, Token};
use crate::core::timebase::CounterTimeBase;
use crate::core::transport::{write_fully, TransportError, TransportStats, WritePolicy};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use regex::bytes::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Session errors
#[derive(Error, Debug)]
pub enum SessionError {
    /// No matching response arrived in time
    #[error("no response within {0:?}")]
    ResponseTimeout(Duration),

    /// The connection is gone
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// The session has not been connected
    #[error("not connected")]
    NotConnected,

    /// No builder registered for the command
    #[error("unknown command {0:?}")]
    UnknownCommand(String),

    /// The command builder rejected its arguments
    #[error("command {command:?}: {reason}")]
    BuildFailed {
        /// Command name
        command: String,
        /// Builder message
        reason: String,
    },

    /// Operation not possible in this configuration
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// State machine error
    #[error(transparent)]
    StateMachine(#[from] StateMachineError),

    /// Port-agent framing error
    #[error(transparent)]
    Framing(#[from] FramingError),

    /// Transport error
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Record decoding error
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// Traffic log could not be opened
    #[error("traffic log: {0}")]
    TrafficLog(#[from] std::io::Error),
}

impl SessionError {
    /// Whether the session cannot continue
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::ConnectionLost(_) => true,
            Self::StateMachine(e) => e.is_fatal(),
            Self::Framing(e) => e.is_fatal(),
            Self::Transport(e) => e.is_fatal(),
            _ => false,
        }
    }
}

/// How bytes travel on the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FramingMode {
    /// Bare instrument bytes
    Raw,
    /// Wrapped in port-agent packets
    #[default]
    PortAgent,
}

/// Session settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Wire framing
    pub framing: FramingMode,
    /// Default response wait
    #[serde(with = "crate::core::transport::duration_ms")]
    pub response_timeout: Duration,
    /// Write retry policy
    pub write: WritePolicy,
    /// Read size in raw mode
    pub read_chunk_size: usize,
    /// Largest unclassified region kept by the chunker
    pub desync_window: usize,
    /// Broadcast channel capacity
    pub event_capacity: usize,
    /// Traffic log file
    pub traffic_log: Option<PathBuf>,
    /// Traffic log format
    pub traffic_log_format: LogFormat,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            framing: FramingMode::PortAgent,
            response_timeout: Duration::from_secs(5),
            write: WritePolicy::default(),
            read_chunk_size: 4096,
            desync_window: DEFAULT_DESYNC_WINDOW,
            event_capacity: 1024,
            traffic_log: None,
            traffic_log_format: LogFormat::Text,
        }
    }
}

/// What a command waits for
#[derive(Debug, Clone)]
pub enum Prompt {
    /// Record contains these bytes
    Literal(Vec<u8>),
    /// Record matches this expression
    Pattern(Regex),
}

impl Prompt {
    /// Literal prompt
    pub fn literal(bytes: impl AsRef<[u8]>) -> Self {
        Self::Literal(bytes.as_ref().to_vec())
    }

    /// Regex prompt
    pub fn pattern(re: &str) -> Result<Self, regex::Error> {
        Regex::new(re).map(Self::Pattern)
    }

    /// Whether a record satisfies the prompt
    pub fn matches(&self, record: &[u8]) -> bool {
        match self {
            Self::Literal(lit) => lit.is_empty() || record.windows(lit.len()).any(|w| w == lit.as_slice()),
            Self::Pattern(re) => re.is_match(record),
        }
    }
}

/// A command to send
#[derive(Debug, Clone)]
pub struct CommandRequest {
    /// Registered command name
    pub command: String,
    /// Arguments for the builder
    pub args: serde_json::Value,
    /// Response to wait for, if any
    pub expect: Option<Prompt>,
    /// Wait bound, overriding the session default
    pub timeout: Option<Duration>,
}

impl CommandRequest {
    /// Command without arguments that waits for nothing
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
            args: serde_json::Value::Null,
            expect: None,
            timeout: None,
        }
    }

    /// Set the arguments
    #[must_use]
    pub fn args(mut self, args: serde_json::Value) -> Self {
        self.args = args;
        self
    }

    /// Wait for `prompt`
    #[must_use]
    pub fn expect(mut self, prompt: Prompt) -> Self {
        self.expect = Some(prompt);
        self
    }

    /// Override the wait bound
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// The record that satisfied a wait
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// Raw record
    pub chunk: Chunk,
    /// Decoded sample, when the record decodes
    pub sample: Option<Sample>,
}

impl Response {
    /// Record as text
    pub fn text(&self) -> String {
        self.chunk.text()
    }
}

/// Events published by a session
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Unsolicited sample
    Sample(Sample),
    /// Bytes outside any record
    NonData(Chunk),
    /// A record that failed to decode
    DecodeFailed {
        /// Stream offset of the record
        offset: u64,
        /// Why
        error: DecodeError,
    },
    /// Protocol state changed
    StateChanged {
        /// Previous state
        from: String,
        /// New state
        to: String,
    },
    /// Port agent status text
    PortAgentStatus(String),
    /// Port agent fault text
    PortAgentFault(String),
    /// Port-agent packet that failed its checksum
    InvalidPacket(String),
    /// The session ended
    Closed(String),
}

/// Upstream consumer of session output
pub trait EventSink: Send + Sync {
    /// A decoded, unsolicited sample
    fn on_sample(&self, sample: &Sample);

    /// The protocol state changed
    fn on_state_change(&self, _from: &str, _to: &str) {}

    /// A recoverable or fatal error
    fn on_error(&self, _error: &SessionError) {}
}

/// Builds the bytes of one command from its arguments
pub type CommandBuilder = Arc<dyn Fn(&serde_json::Value) -> Result<Vec<u8>, String> + Send + Sync>;

/// State machine driving a session; handlers return the commands to send
pub type SessionMachine<S, E, C> = ProtocolStateMachine<S, E, C, Vec<CommandRequest>>;

struct PendingWait {
    id: u64,
    prompt: Prompt,
    reply: oneshot::Sender<Response>,
}

/// State shared between callers and the receive loop
struct Shared {
    pending: Mutex<Option<PendingWait>>,
    next_wait: AtomicU64,
    parser: Mutex<RecordParser<Box<dyn Sieve>>>,
    events: broadcast::Sender<SessionEvent>,
    sink: Option<Arc<dyn EventSink>>,
    traffic: Mutex<Option<TrafficLogger>>,
    stats: Mutex<TransportStats>,
    closed: AtomicBool,
}

impl Shared {
    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn report(&self, error: &SessionError) {
        if let Some(sink) = &self.sink {
            sink.on_error(error);
        }
    }

    fn arm_wait(&self, prompt: Prompt) -> (u64, oneshot::Receiver<Response>) {
        let id = self.next_wait.fetch_add(1, Ordering::Relaxed);
        let (reply, rx) = oneshot::channel();
        let previous = self.pending.lock().replace(PendingWait { id, prompt, reply });
        if previous.is_some() {
            tracing::warn!("replacing an abandoned response wait");
        }
        (id, rx)
    }

    fn cancel_wait(&self, id: u64) {
        let mut slot = self.pending.lock();
        if slot.as_ref().is_some_and(|w| w.id == id) {
            *slot = None;
        }
    }

    fn take_matching(&self, record: &[u8]) -> Option<PendingWait> {
        let mut slot = self.pending.lock();
        if slot.as_ref().is_some_and(|w| w.prompt.matches(record)) {
            slot.take()
        } else {
            None
        }
    }

    /// Feed instrument bytes through the parser and route the results
    fn ingest(&self, data: &[u8]) {
        self.stats.lock().bytes_received += data.len() as u64;
        if let Some(log) = self.traffic.lock().as_mut() {
            log.log_rx(data);
        }

        let events = self.parser.lock().feed(data, Utc::now());
        for event in events {
            self.route(event);
        }
    }

    fn route(&self, event: ParseEvent) {
        match event {
            ParseEvent::NonData(chunk) => self.emit(SessionEvent::NonData(chunk)),
            ParseEvent::Record { chunk, result } => {
                if let Some(wait) = self.take_matching(&chunk.bytes) {
                    tracing::debug!(offset = chunk.start_offset, "response matched pending wait");
                    let response = Response {
                        chunk,
                        sample: result.ok(),
                    };
                    if wait.reply.send(response).is_err() {
                        tracing::debug!("waiter gave up before the response arrived");
                    }
                    return;
                }

                match result {
                    Ok(sample) => {
                        if let Some(sink) = &self.sink {
                            sink.on_sample(&sample);
                        }
                        self.emit(SessionEvent::Sample(sample));
                    }
                    Err(error) => {
                        self.stats.lock().invalid_packets += 1;
                        self.report(&SessionError::Decode(error.clone()));
                        self.emit(SessionEvent::DecodeFailed {
                            offset: chunk.start_offset,
                            error,
                        });
                    }
                }
            }
        }
    }

    /// Mark the session closed; only the first call has any effect
    fn close(&self, reason: &str, error: Option<SessionError>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Dropping the sender wakes the waiter with ConnectionLost
        self.pending.lock().take();
        if let Some(log) = self.traffic.lock().as_mut() {
            log.note(reason);
            log.flush();
        }
        if let Some(error) = error {
            self.report(&error);
        }
        self.emit(SessionEvent::Closed(reason.to_string()));
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

async fn receive_loop<R>(mut reader: R, shared: Arc<Shared>, settings: SessionSettings)
where
    R: AsyncRead + Unpin + Send,
{
    let result = match settings.framing {
        FramingMode::Raw => read_raw(&mut reader, &shared, settings.read_chunk_size).await,
        FramingMode::PortAgent => read_packets(&mut reader, &shared).await,
    };
    if let Err(e) = result {
        tracing::warn!(error = %e, "receive loop stopped");
        let reason = e.to_string();
        shared.close(&reason, Some(e));
    }
}

async fn read_raw<R>(reader: &mut R, shared: &Shared, chunk_size: usize) -> Result<(), SessionError>
where
    R: AsyncRead + Unpin + Send,
{
    let mut buf = vec![0u8; chunk_size.max(1)];
    loop {
        let n = reader.read(&mut buf).await.map_err(TransportError::IoError)?;
        if n == 0 {
            return Err(SessionError::ConnectionLost("instrument closed the stream".into()));
        }
        tracing::trace!(bytes = n, "received");
        shared.ingest(&buf[..n]);
    }
}

async fn read_packets<R>(reader: &mut R, shared: &Shared) -> Result<(), SessionError>
where
    R: AsyncRead + Unpin + Send,
{
    loop {
        // A bad header means the stream position is lost, which is fatal here
        let packet = read_packet(reader).await?;
        shared.stats.lock().packets_received += 1;

        if let Err(e) = packet.verify() {
            shared.stats.lock().invalid_packets += 1;
            shared.emit(SessionEvent::InvalidPacket(packet.to_string()));
            shared.report(&SessionError::Framing(e));
            continue;
        }

        match packet.packet_type() {
            PacketType::DataFromInstrument => shared.ingest(packet.payload()),
            PacketType::PortAgentStatus => {
                let status = String::from_utf8_lossy(packet.payload()).into_owned();
                tracing::info!(%status, "port agent status");
                shared.emit(SessionEvent::PortAgentStatus(status));
            }
            PacketType::PortAgentFault => {
                let fault = String::from_utf8_lossy(packet.payload()).into_owned();
                tracing::warn!(%fault, "port agent fault");
                shared.emit(SessionEvent::PortAgentFault(fault));
            }
            PacketType::Heartbeat => tracing::trace!("port agent heartbeat"),
            other => tracing::debug!(packet_type = ?other, "ignoring port agent packet"),
        }
    }
}

struct FsmCell<S, E, C> {
    machine: SessionMachine<S, E, C>,
    context: C,
}

/// One live conversation with an instrument
pub struct InstrumentSession<S, E, C> {
    id: Uuid,
    name: String,
    settings: SessionSettings,
    shared: Arc<Shared>,
    writer: tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    command_lock: tokio::sync::Mutex<()>,
    fsm: tokio::sync::Mutex<FsmCell<S, E, C>>,
    builders: HashMap<String, CommandBuilder>,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

impl<S: Token, E: Token, C: Send + 'static> InstrumentSession<S, E, C> {
    /// Start building a session
    pub fn builder(name: &str, machine: SessionMachine<S, E, C>, context: C) -> SessionBuilder<S, E, C> {
        SessionBuilder::new(name, machine, context)
    }

    /// Session id
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Session name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Settings
    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Whether the session has ended
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Subscribe to session events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    /// Traffic counters
    pub fn stats(&self) -> TransportStats {
        self.shared.stats.lock().clone()
    }

    /// Current protocol state
    pub async fn state(&self) -> S {
        self.fsm.lock().await.machine.state()
    }

    /// Run `f` against the state machine, e.g. to register more handlers
    pub async fn with_machine<R>(&self, f: impl FnOnce(&mut SessionMachine<S, E, C>) -> R) -> R {
        f(&mut self.fsm.lock().await.machine)
    }

    /// Parser position for a later [`restore`](Self::restore)
    pub fn checkpoint(&self) -> ParserCheckpoint {
        self.shared.parser.lock().checkpoint()
    }

    /// Resume parsing from a checkpoint. The bytes that follow must be the
    /// stream continuing at `checkpoint.byte_offset`.
    pub fn restore(&self, checkpoint: &ParserCheckpoint) {
        self.shared.parser.lock().restore(checkpoint);
    }

    /// Restart the counter time base after a device reset
    pub fn rebase(&self, tick: u32, start: DateTime<Utc>) {
        self.shared.parser.lock().rebase(tick, start);
    }

    /// Send a command and, when it expects a prompt, wait for the
    /// matching record
    pub async fn send(&self, request: CommandRequest) -> Result<Option<Response>, SessionError> {
        self.ensure_open()?;
        let builder = self
            .builders
            .get(&request.command)
            .ok_or_else(|| SessionError::UnknownCommand(request.command.clone()))?;
        let bytes = builder(&request.args).map_err(|reason| SessionError::BuildFailed {
            command: request.command.clone(),
            reason,
        })?;

        let _command = self.command_lock.lock().await;
        tracing::debug!(command = %request.command, bytes = bytes.len(), "sending command");

        // Armed before writing so a fast reply cannot slip past
        let wait = request.expect.clone().map(|prompt| self.shared.arm_wait(prompt));

        if let Err(e) = self.write_data(&bytes).await {
            if let Some((id, _)) = &wait {
                self.shared.cancel_wait(*id);
            }
            return Err(self.fail(e));
        }

        let Some((id, rx)) = wait else {
            return Ok(None);
        };
        let timeout = request.timeout.unwrap_or(self.settings.response_timeout);
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(Some(response)),
            Ok(Err(_)) => Err(SessionError::ConnectionLost("session closed while waiting for a response".into())),
            Err(_) => {
                self.shared.cancel_wait(id);
                tracing::warn!(command = %request.command, ?timeout, "response timeout");
                Err(SessionError::ResponseTimeout(timeout))
            }
        }
    }

    /// Feed an event to the state machine, send the commands its handler
    /// asked for in order, then move to the handler's next state.
    ///
    /// If any command fails the machine stays where it was. The machine is
    /// held for the whole exchange so dispatches never interleave.
    pub async fn dispatch(&self, event: E, args: serde_json::Value) -> Result<Vec<Option<Response>>, SessionError> {
        self.ensure_open()?;
        let mut cell = self.fsm.lock().await;
        let result = {
            let FsmCell { machine, context } = &mut *cell;
            match machine.resolve(context, event, &args) {
                Ok(result) => result,
                Err(e) => return Err(self.fail(e.into())),
            }
        };

        let mut responses = Vec::with_capacity(result.output.len());
        for request in result.output {
            match self.send(request).await {
                Ok(response) => responses.push(response),
                Err(e) => {
                    tracing::warn!(event = ?event, error = %e, "command failed, transition abandoned");
                    return Err(e);
                }
            }
        }

        let FsmCell { machine, context } = &mut *cell;
        if let Some((from, to)) = machine.commit(context, event, result.next_state) {
            self.state_changed(from, to);
        }
        Ok(responses)
    }

    /// Ask the port agent to send a serial break
    pub async fn send_break(&self, duration: Duration) -> Result<(), SessionError> {
        self.ensure_open()?;
        if self.settings.framing != FramingMode::PortAgent {
            return Err(SessionError::Unsupported("break needs port agent framing".into()));
        }
        let command = format!("break {}", duration.as_millis());
        tracing::info!(%command, "port agent command");
        let packet = WirePacket::new(PacketType::PortAgentCommand, command.into_bytes())?;
        let result = {
            let mut writer = self.writer.lock().await;
            write_packet(&mut *writer, &packet, &self.settings.write).await
        };
        match result {
            Ok(retries) => {
                self.count_sent(packet.payload(), retries);
                Ok(())
            }
            Err(e) => Err(self.fail(e.into())),
        }
    }

    /// Close the connection and stop the receive loop
    pub async fn disconnect(&self) {
        tracing::info!(session = %self.name, "disconnecting");
        let receiver = self.receiver.lock().take();
        if let Some(handle) = receiver {
            handle.abort();
        }
        if let Err(e) = self.writer.lock().await.shutdown().await {
            tracing::debug!(error = %e, "shutdown after disconnect");
        }
        self.shared.close("disconnected", None);
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.shared.is_closed() {
            return Err(SessionError::ConnectionLost("session is closed".into()));
        }
        Ok(())
    }

    /// Close the session on fatal errors; returns the error for propagation
    fn fail(&self, error: SessionError) -> SessionError {
        if error.is_fatal() {
            tracing::error!(session = %self.name, %error, "fatal session error");
            if let Some(handle) = self.receiver.lock().take() {
                handle.abort();
            }
            self.shared.close(&error.to_string(), None);
        }
        self.shared.report(&error);
        error
    }

    fn state_changed(&self, from: S, to: S) {
        let (from, to) = (format!("{:?}", from), format!("{:?}", to));
        if let Some(sink) = &self.shared.sink {
            sink.on_state_change(&from, &to);
        }
        self.shared.emit(SessionEvent::StateChanged { from, to });
    }

    async fn write_data(&self, bytes: &[u8]) -> Result<(), SessionError> {
        let mut writer = self.writer.lock().await;
        let retries = match self.settings.framing {
            FramingMode::Raw => write_fully(&mut *writer, bytes, &self.settings.write).await?,
            FramingMode::PortAgent => {
                let packet = WirePacket::new(PacketType::DataFromDriver, bytes.to_vec())?;
                write_packet(&mut *writer, &packet, &self.settings.write).await?
            }
        };
        drop(writer);
        self.count_sent(bytes, retries);
        Ok(())
    }

    fn count_sent(&self, bytes: &[u8], retries: u32) {
        {
            let mut stats = self.shared.stats.lock();
            stats.bytes_sent += bytes.len() as u64;
            stats.packets_sent += 1;
            stats.write_retries += u64::from(retries);
        }
        if let Some(log) = self.shared.traffic.lock().as_mut() {
            log.log_tx(bytes);
        }
    }
}

impl<S, E, C> Drop for InstrumentSession<S, E, C> {
    fn drop(&mut self) {
        if let Some(handle) = self.receiver.lock().take() {
            handle.abort();
        }
    }
}

/// Assembles an [`InstrumentSession`]
pub struct SessionBuilder<S, E, C> {
    name: String,
    machine: SessionMachine<S, E, C>,
    context: C,
    builders: HashMap<String, CommandBuilder>,
    sieve: Option<Box<dyn Sieve>>,
    decoder: SampleDecoder,
    timebase: Option<CounterTimeBase>,
    sink: Option<Arc<dyn EventSink>>,
    settings: SessionSettings,
}

impl<S: Token, E: Token, C: Send + 'static> SessionBuilder<S, E, C> {
    /// New builder
    pub fn new(name: &str, machine: SessionMachine<S, E, C>, context: C) -> Self {
        Self {
            name: name.to_string(),
            machine,
            context,
            builders: HashMap::new(),
            sieve: None,
            decoder: SampleDecoder::default(),
            timebase: None,
            sink: None,
            settings: SessionSettings::default(),
        }
    }

    /// Register a command builder
    #[must_use]
    pub fn command<F>(mut self, name: &str, build: F) -> Self
    where
        F: Fn(&serde_json::Value) -> Result<Vec<u8>, String> + Send + Sync + 'static,
    {
        self.builders.insert(name.to_string(), Arc::new(build));
        self
    }

    /// Register a command that always sends the same bytes
    #[must_use]
    pub fn literal_command(self, name: &str, bytes: &[u8]) -> Self {
        let bytes = bytes.to_vec();
        self.command(name, move |_| Ok(bytes.clone()))
    }

    /// Record sieve; defaults to one record per line
    #[must_use]
    pub fn sieve(mut self, sieve: impl Sieve + 'static) -> Self {
        self.sieve = Some(Box::new(sieve));
        self
    }

    /// Add a record schema
    #[must_use]
    pub fn schema(mut self, schema: Schema) -> Self {
        self.decoder.add_schema(schema);
        self
    }

    /// Counter time base for schemas with a tick field
    #[must_use]
    pub fn timebase(mut self, timebase: CounterTimeBase) -> Self {
        self.timebase = Some(timebase);
        self
    }

    /// Upstream event sink
    #[must_use]
    pub fn sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Settings
    #[must_use]
    pub fn settings(mut self, settings: SessionSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Bind to a connected stream and start the receive loop.
    ///
    /// Must be called inside a tokio runtime.
    pub fn start<T>(self, stream: T) -> Result<InstrumentSession<S, E, C>, SessionError>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let traffic = match &self.settings.traffic_log {
            Some(path) => Some(TrafficLogger::create(path, self.settings.traffic_log_format)?),
            None => None,
        };

        let sieve: Box<dyn Sieve> = match self.sieve {
            Some(sieve) => sieve,
            None => Box::new(from_fn(split_lines)),
        };
        let mut parser = RecordParser::new(sieve, self.decoder).with_desync_window(self.settings.desync_window);
        if let Some(tb) = self.timebase {
            parser = parser.with_timebase(tb);
        }

        let (events, _) = broadcast::channel(self.settings.event_capacity.max(1));
        let shared = Arc::new(Shared {
            pending: Mutex::new(None),
            next_wait: AtomicU64::new(0),
            parser: Mutex::new(parser),
            events,
            sink: self.sink,
            traffic: Mutex::new(traffic),
            stats: Mutex::new(TransportStats::default()),
            closed: AtomicBool::new(false),
        });

        let (reader, writer) = tokio::io::split(stream);
        let handle = tokio::spawn(receive_loop(reader, shared.clone(), self.settings.clone()));
        tracing::info!(session = %self.name, framing = ?self.settings.framing, "session started");

        Ok(InstrumentSession {
            id: Uuid::new_v4(),
            name: self.name,
            settings: self.settings,
            shared,
            writer: tokio::sync::Mutex::new(Box::new(writer)),
            command_lock: tokio::sync::Mutex::new(()),
            fsm: tokio::sync::Mutex::new(FsmCell {
                machine: self.machine,
                context: self.context,
            }),
            builders: self.builders,
            receiver: Mutex::new(Some(handle)),
        })
    }
}

/// Default sieve: one record per `\n` terminated line
fn split_lines(buf: &[u8]) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut start = 0;
    for (i, &b) in buf.iter().enumerate() {
        if b == b'\n' {
            spans.push((start, i + 1));
            start = i + 1;
        }
    }
    spans
}

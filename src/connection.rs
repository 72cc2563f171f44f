//! Connection management: read loop, send path, teardown

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::sync::{oneshot, watch, Mutex};
use tokio::time::timeout;

use crate::command::{command_with_headers, simple_command, validate_no_newlines};
use crate::constants::{
    CONTENT_TYPE_API_RESPONSE, CONTENT_TYPE_COMMAND_REPLY, CONTENT_TYPE_DISCONNECT_NOTICE,
    CONTENT_TYPE_EVENT_JSON, CONTENT_TYPE_EVENT_PLAIN, DEFAULT_COMMAND_TIMEOUT_MS,
    DEFAULT_HANDSHAKE_TIMEOUT_MS, EVENT_BACKGROUND_JOB, HEADER_CONTENT_TYPE, HEADER_JOB_UUID,
};
use crate::correlator::{Correlator, JobDelivery, ReplyDelivery};
use crate::error::{EslError, EslResult, FrameErrorKind};
use crate::event::Event;
use crate::frame::{json_event, parse_event_body, read_frame};
use crate::logger::Logger;
use crate::registry::{EventFilter, ListenerId, ListenerRegistry};

/// Duplex byte stream the engine runs over. The engine requires nothing
/// beyond ordered, reliable byte delivery; blanket-implemented.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

type BoxedTransport = Box<dyn Transport>;
pub(crate) type FrameReader = BufReader<ReadHalf<BoxedTransport>>;
pub(crate) type FrameWriter = WriteHalf<BoxedTransport>;

/// Connection liveness snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConnectionStatus {
    /// The read loop is running and commands can be sent.
    Connected,
    /// The connection has torn down.
    Disconnected(DisconnectReason),
}

/// Why a connection tore down.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DisconnectReason {
    /// Server sent a text/disconnect-notice.
    ServerNotice,
    /// Clean EOF at a frame boundary.
    ConnectionClosed,
    /// A framing error left the stream out of frame alignment.
    FramingError(String),
    /// Transport I/O failure (io::Error is not Clone, so the message is kept).
    IoError(String),
    /// The local side called close().
    ClientRequested,
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisconnectReason::ServerNotice => write!(f, "server sent disconnect notice"),
            DisconnectReason::ConnectionClosed => write!(f, "connection closed"),
            DisconnectReason::FramingError(msg) => write!(f, "framing error: {}", msg),
            DisconnectReason::IoError(msg) => write!(f, "I/O error: {}", msg),
            DisconnectReason::ClientRequested => write!(f, "client requested disconnect"),
        }
    }
}

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// How long `send_recv` waits for a reply before giving up.
    pub command_timeout: Duration,
    /// How long the auth / connect handshake may take.
    pub handshake_timeout: Duration,
    /// Injected logging capability. Discards by default.
    pub logger: Logger,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_millis(DEFAULT_COMMAND_TIMEOUT_MS),
            handshake_timeout: Duration::from_millis(DEFAULT_HANDSHAKE_TIMEOUT_MS),
            logger: Logger::discard(),
        }
    }
}

/// State shared between the connection handle and the reader task.
struct Shared {
    correlator: Correlator,
    registry: ListenerRegistry,
    status_tx: watch::Sender<ConnectionStatus>,
    logger: Logger,
}

impl Shared {
    /// Perform the Closed transition: release every waiter with a
    /// connection-closed failure and publish the reason. Idempotent; the
    /// first reason wins. The listener registry is left intact but receives
    /// no further dispatches and no synthetic terminal event.
    fn transition_closed(&self, reason: DisconnectReason) {
        self.correlator
            .close();
        self.status_tx
            .send_if_modified(|status| {
                if matches!(status, ConnectionStatus::Connected) {
                    *status = ConnectionStatus::Disconnected(reason);
                    true
                } else {
                    false
                }
            });
    }
}

/// An established event socket connection (Clone + Send).
///
/// One dedicated reader task demultiplexes incoming frames into command
/// replies, background-job completions, and listener dispatch. Any number of
/// tasks may send commands concurrently; outgoing frames are serialized by a
/// write lock so a command's header block and body go out as one unit.
#[derive(Clone)]
pub struct Connection {
    writer: Arc<Mutex<FrameWriter>>,
    shared: Arc<Shared>,
    status_rx: watch::Receiver<ConnectionStatus>,
    command_timeout: Duration,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Handle to an in-flight background job.
///
/// Returned by [`Connection::background_job`] once the switch has
/// acknowledged the command. The completion event arrives later through the
/// event stream, correlated by job id.
#[derive(Debug)]
pub struct BackgroundJob {
    job_id: String,
    ack: Event,
    completion: oneshot::Receiver<Event>,
}

impl BackgroundJob {
    /// The job identifier sent with the command.
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// The immediate acknowledgement reply.
    pub fn acknowledgement(&self) -> &Event {
        &self.ack
    }

    /// Await the completion event.
    ///
    /// A timeout only stops this caller from waiting; a completion arriving
    /// afterwards is discarded by the read loop, not delivered.
    pub async fn wait(self, wait: Duration) -> EslResult<Event> {
        match timeout(wait, self.completion).await {
            Ok(Ok(event)) => Ok(event),
            Ok(Err(_)) => Err(EslError::ConnectionClosed),
            Err(_) => Err(EslError::Timeout { timeout: wait }),
        }
    }
}

pub(crate) fn split_transport(
    transport: impl AsyncRead + AsyncWrite + Send + Unpin + 'static,
) -> (FrameReader, FrameWriter) {
    let boxed: BoxedTransport = Box::new(transport);
    let (read_half, write_half) = tokio::io::split(boxed);
    (BufReader::new(read_half), write_half)
}

impl Connection {
    /// Adopt an already-ready duplex stream and start the read loop.
    ///
    /// Use this when the handshake has happened elsewhere (or is not needed,
    /// as with unauthenticated test transports). [`crate::inbound`] and
    /// [`crate::outbound`] perform the mode-specific handshakes first and
    /// then hand off to this.
    pub fn attach(
        transport: impl AsyncRead + AsyncWrite + Send + Unpin + 'static,
        options: ConnectionOptions,
    ) -> Self {
        let (reader, writer) = split_transport(transport);
        Self::from_parts(reader, writer, options)
    }

    pub(crate) fn from_parts(
        reader: FrameReader,
        writer: FrameWriter,
        options: ConnectionOptions,
    ) -> Self {
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Connected);
        let shared = Arc::new(Shared {
            correlator: Correlator::new(),
            registry: ListenerRegistry::new(),
            status_tx,
            logger: options
                .logger
                .clone(),
        });

        tokio::spawn(read_loop(reader, shared.clone()));

        Connection {
            writer: Arc::new(Mutex::new(writer)),
            shared,
            status_rx,
            command_timeout: options.command_timeout,
        }
    }

    /// Send a command without waiting for its reply.
    ///
    /// Fails immediately with [`EslError::ConnectionClosed`] once the
    /// connection has torn down.
    pub async fn send(&self, command: &str) -> EslResult<()> {
        let wire = simple_command(command)?;
        self.write_frame(wire.as_bytes())
            .await
    }

    /// Send a command and await its reply, with the configured timeout.
    ///
    /// The engine is payload-agnostic: `command` is passed through verbatim
    /// (minus a newline-injection guard). Replies are matched FIFO; events
    /// interleaving between the command and its reply do not disturb the
    /// pairing.
    pub async fn send_recv(&self, command: &str) -> EslResult<Event> {
        self.send_recv_timeout(command, self.command_timeout)
            .await
    }

    /// [`send_recv`](Self::send_recv) with a caller-supplied timeout.
    ///
    /// On timeout the pending slot is abandoned: the call returns, and the
    /// reply, if it arrives later, is logged and discarded.
    pub async fn send_recv_timeout(&self, command: &str, wait: Duration) -> EslResult<Event> {
        let wire = simple_command(command)?;
        let (id, rx) = self
            .enqueue_and_write(wire.as_bytes())
            .await?;
        self.await_reply(id, rx, wait)
            .await
    }

    /// Run a command as a background job.
    ///
    /// Generates a job id, registers the completion waiter before the
    /// command is written (so a fast completion cannot race past it), sends
    /// `bgapi` with an explicit `Job-UUID` header, and awaits the
    /// acknowledgement reply. The completion event is awaited separately via
    /// [`BackgroundJob::wait`]; without a live waiter it falls through to
    /// normal listener dispatch.
    pub async fn background_job(&self, command: &str) -> EslResult<BackgroundJob> {
        validate_no_newlines(command, "bgapi command")?;
        let job_id = uuid::Uuid::new_v4().to_string();
        let completion = self
            .shared
            .correlator
            .register_job(&job_id)?;
        let wire = command_with_headers(
            &format!("bgapi {command}"),
            &[(HEADER_JOB_UUID, &job_id)],
        )?;

        let result = async {
            let (id, rx) = self
                .enqueue_and_write(wire.as_bytes())
                .await?;
            self.await_reply(id, rx, self.command_timeout)
                .await
        }
        .await;

        match result {
            Ok(ack) => Ok(BackgroundJob {
                job_id,
                ack,
                completion,
            }),
            Err(err) => {
                self.shared
                    .correlator
                    .cancel_job(&job_id);
                Err(err)
            }
        }
    }

    /// Register a callback for events matching `filter`.
    ///
    /// Callbacks sharing a filter fire in registration order. Dispatch runs
    /// off the read loop, so a slow callback delays other listeners for the
    /// same event but never frame ingestion.
    pub fn register_event_listener(
        &self,
        filter: impl Into<EventFilter>,
        listener: impl Fn(Event) + Send + Sync + 'static,
    ) -> ListenerId {
        self.shared
            .registry
            .register(filter.into(), Arc::new(listener))
    }

    /// Remove a listener registration. No-op when already removed.
    pub fn unregister_event_listener(&self, id: ListenerId) {
        self.shared
            .registry
            .unregister(id);
    }

    /// Whether the connection is still up.
    pub fn is_connected(&self) -> bool {
        matches!(
            *self
                .status_rx
                .borrow(),
            ConnectionStatus::Connected
        )
    }

    /// Current status snapshot.
    pub fn status(&self) -> ConnectionStatus {
        self.status_rx
            .borrow()
            .clone()
    }

    /// Wait until the connection has torn down, returning the reason.
    pub async fn closed(&self) -> DisconnectReason {
        let mut status_rx = self
            .status_rx
            .clone();
        loop {
            if let ConnectionStatus::Disconnected(reason) = &*status_rx.borrow() {
                return reason.clone();
            }
            if status_rx
                .changed()
                .await
                .is_err()
            {
                return DisconnectReason::ConnectionClosed;
            }
        }
    }

    /// Tear the connection down.
    ///
    /// Releases all pending commands and job waiters with a
    /// connection-closed failure, stops the reader (which dispatches nothing
    /// further), and shuts the write half. Idempotent and safe to call
    /// concurrently with an active read loop.
    pub async fn close(&self) {
        self.shared
            .logger
            .debug("client requested close");
        self.shared
            .transition_closed(DisconnectReason::ClientRequested);
        let mut writer = self
            .writer
            .lock()
            .await;
        let _ = writer
            .shutdown()
            .await;
    }

    async fn write_frame(&self, bytes: &[u8]) -> EslResult<()> {
        if self
            .shared
            .correlator
            .is_closed()
        {
            return Err(EslError::ConnectionClosed);
        }
        let mut writer = self
            .writer
            .lock()
            .await;
        writer
            .write_all(bytes)
            .await?;
        writer
            .flush()
            .await?;
        Ok(())
    }

    /// Push a pending command and write its frame as one atomic step.
    ///
    /// The write lock is held across enqueue + write so queue order always
    /// matches wire order; it is released before the caller blocks on the
    /// reply, letting other tasks send while this one waits.
    async fn enqueue_and_write(
        &self,
        bytes: &[u8],
    ) -> EslResult<(u64, oneshot::Receiver<Event>)> {
        let mut writer = self
            .writer
            .lock()
            .await;
        let (id, rx) = self
            .shared
            .correlator
            .enqueue()?;

        let written = async {
            writer
                .write_all(bytes)
                .await?;
            writer
                .flush()
                .await
        }
        .await;

        if let Err(err) = written {
            // Nothing (or a torn frame) went out; no reply will arrive for
            // this slot, so drop it from the queue entirely.
            self.shared
                .correlator
                .remove(id);
            return Err(EslError::Io(err));
        }
        Ok((id, rx))
    }

    async fn await_reply(
        &self,
        id: u64,
        rx: oneshot::Receiver<Event>,
        wait: Duration,
    ) -> EslResult<Event> {
        match timeout(wait, rx).await {
            Ok(Ok(event)) => Ok(event),
            Ok(Err(_)) => Err(EslError::ConnectionClosed),
            Err(_) => {
                self.shared
                    .correlator
                    .abandon(id);
                self.shared
                    .logger
                    .warn(&format!("command timed out after {wait:?}"));
                Err(EslError::Timeout { timeout: wait })
            }
        }
    }
}

async fn read_loop(reader: FrameReader, shared: Arc<Shared>) {
    let loop_future =
        std::panic::AssertUnwindSafe(read_loop_inner(reader, shared.clone()));
    if futures_util::FutureExt::catch_unwind(loop_future)
        .await
        .is_err()
    {
        shared
            .logger
            .error("reader task panicked");
        shared.transition_closed(DisconnectReason::IoError(
            "reader task panicked".to_string(),
        ));
    }
}

async fn read_loop_inner(mut reader: FrameReader, shared: Arc<Shared>) {
    let mut status_rx = shared
        .status_tx
        .subscribe();
    loop {
        // Stop on the Closed transition even when the peer keeps sending:
        // once closed, nothing may reach the listeners.
        let result = tokio::select! {
            result = read_frame(&mut reader) => result,
            _ = status_rx.wait_for(|status| !matches!(status, ConnectionStatus::Connected)) => {
                return;
            }
        };
        let frame = match result {
            Ok(frame) => frame,
            Err(err) if !err.kind.is_fatal() => {
                // The frame is otherwise complete and the stream is still
                // aligned.
                shared
                    .logger
                    .warn(&format!("skipping malformed header line: {}", err.kind));
                err.event
            }
            Err(err) => {
                // EOF at a frame boundary is a clean remote close; anything
                // else means frame alignment is lost.
                let reason = if err
                    .event
                    .header_count()
                    == 0
                    && matches!(err.kind, FrameErrorKind::UnexpectedEof(_))
                {
                    shared
                        .logger
                        .info("connection closed by peer");
                    DisconnectReason::ConnectionClosed
                } else {
                    shared
                        .logger
                        .warn(&format!(
                            "fatal framing error: {} ({} headers parsed)",
                            err.kind,
                            err.event
                                .header_count()
                        ));
                    match err.kind {
                        FrameErrorKind::Io(io_err) => {
                            DisconnectReason::IoError(io_err.to_string())
                        }
                        kind => DisconnectReason::FramingError(kind.to_string()),
                    }
                };
                shared.transition_closed(reason);
                return;
            }
        };

        // A close racing the frame read wins.
        if shared
            .correlator
            .is_closed()
        {
            return;
        }
        if !dispatch_frame(&shared, frame).await {
            return;
        }
    }
}

/// Classify one frame and route it. Returns false when the loop must stop.
async fn dispatch_frame(shared: &Arc<Shared>, frame: Event) -> bool {
    let content_type = frame.header(HEADER_CONTENT_TYPE);
    match content_type.as_str() {
        CONTENT_TYPE_COMMAND_REPLY | CONTENT_TYPE_API_RESPONSE => {
            match shared
                .correlator
                .deliver_reply(frame)
            {
                ReplyDelivery::Delivered => {}
                ReplyDelivery::Abandoned { waited } => {
                    shared
                        .logger
                        .warn(&format!(
                            "discarding reply for timed-out command ({waited:?} since send)"
                        ));
                }
                ReplyDelivery::NoPending => {
                    shared
                        .logger
                        .warn("received reply with no pending command");
                }
            }
            true
        }
        CONTENT_TYPE_EVENT_PLAIN => {
            // The payload is length-delimited by the outer frame, so a parse
            // failure here never breaks outer alignment: log it and route
            // the best-effort partial event.
            let event = match parse_event_body(
                frame
                    .body()
                    .unwrap_or_default(),
            )
            .await
            {
                Ok(event) => event,
                Err(err) => {
                    shared
                        .logger
                        .warn(&format!("malformed event payload: {}", err.kind));
                    err.event
                }
            };
            route_event(shared, event);
            true
        }
        CONTENT_TYPE_EVENT_JSON => {
            route_event(
                shared,
                json_event(
                    frame
                        .body()
                        .unwrap_or_default(),
                ),
            );
            true
        }
        CONTENT_TYPE_DISCONNECT_NOTICE => {
            shared
                .logger
                .info("received disconnect notice from server");
            shared.transition_closed(DisconnectReason::ServerNotice);
            false
        }
        other => {
            shared
                .logger
                .debug(&format!("ignoring frame with content type {other:?}"));
            true
        }
    }
}

fn route_event(shared: &Arc<Shared>, event: Event) {
    let job_id = if event.name() == EVENT_BACKGROUND_JOB {
        event.header(HEADER_JOB_UUID)
    } else {
        String::new()
    };

    let event = if job_id.is_empty() {
        event
    } else {
        match shared
            .correlator
            .complete_job(&job_id, event)
        {
            JobDelivery::Delivered => return,
            JobDelivery::Abandoned => {
                shared
                    .logger
                    .warn(&format!("discarding completion for timed-out job {job_id}"));
                return;
            }
            JobDelivery::NoWaiter(event) => event,
        }
    };

    dispatch_listeners(shared, event);
}

fn dispatch_listeners(shared: &Arc<Shared>, event: Event) {
    let listeners = shared
        .registry
        .matching(&event.name());
    if listeners.is_empty() {
        return;
    }
    // One task per event: callbacks run in registration order, off the read
    // loop, and a panicking callback aborts only this task.
    tokio::spawn(async move {
        for listener in listeners {
            listener(event.clone());
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_equality() {
        assert_eq!(ConnectionStatus::Connected, ConnectionStatus::Connected);
        assert_eq!(
            ConnectionStatus::Disconnected(DisconnectReason::ServerNotice),
            ConnectionStatus::Disconnected(DisconnectReason::ServerNotice)
        );
        assert_ne!(
            ConnectionStatus::Connected,
            ConnectionStatus::Disconnected(DisconnectReason::ConnectionClosed)
        );
    }

    #[test]
    fn test_disconnect_reason_display() {
        assert_eq!(
            DisconnectReason::ServerNotice.to_string(),
            "server sent disconnect notice"
        );
        assert_eq!(
            DisconnectReason::FramingError("bad length".to_string()).to_string(),
            "framing error: bad length"
        );
    }

    #[tokio::test]
    async fn test_default_options() {
        let options = ConnectionOptions::default();
        assert_eq!(options.command_timeout, Duration::from_secs(5));
        assert_eq!(options.handshake_timeout, Duration::from_secs(2));
    }
}

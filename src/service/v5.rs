//! Schema 5 editor service: concurrent requests multiplexed by message id.
//!
//! A dedicated listener task owns the daemon's stdout for the life of the
//! process. It decodes frames, routes responses to the correlator and
//! answers liveness pings. Callers share stdin behind an async mutex; each
//! complete message is written under one lock acquisition.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::codec::{byte_range, DaemonMessage, IncomingFrame, OutgoingMessage};
use crate::config::ServiceConfig;
use crate::correlator::{Delivery, RequestCorrelator};
use crate::error::ServiceError;
use crate::models::{CharRange, FormatResult};
use crate::transport::{DaemonLauncher, DaemonProcess, DaemonReader, DaemonWriter, WireReader, WireWriter};

type SharedWriter = Arc<tokio::sync::Mutex<WireWriter<DaemonWriter>>>;
type Correlator = RequestCorrelator<DaemonMessage>;

/// Bound on joining the listener during teardown before aborting it.
const LISTENER_JOIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Lifecycle of one schema 5 session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Stopped,
    Starting,
    Listening,
}

/// Resources bound to one daemon process.
struct Session {
    writer: SharedWriter,
    listener: JoinHandle<()>,
    cancel: CancellationToken,
    process: Option<DaemonProcess>,
}

pub struct V5EditorService {
    launcher: Arc<dyn DaemonLauncher>,
    config: ServiceConfig,
    correlator: Arc<Correlator>,
    state: Arc<Mutex<SessionState>>,
    session: tokio::sync::Mutex<Option<Session>>,
}

impl V5EditorService {
    pub fn new(launcher: Arc<dyn DaemonLauncher>, config: ServiceConfig) -> Self {
        Self {
            launcher,
            config,
            correlator: Arc::new(RequestCorrelator::new()),
            state: Arc::new(Mutex::new(SessionState::Stopped)),
            session: tokio::sync::Mutex::new(None),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Number of requests currently awaiting a response.
    pub fn pending_requests(&self) -> usize {
        self.correlator.pending_count()
    }

    /// Reserve a message id, so a format can be cancelled before it is sent.
    pub fn next_message_id(&self) -> u32 {
        self.correlator.next_id()
    }

    /// Drop leftovers from a previous session, start the daemon and the
    /// listener.
    pub async fn initialise(&self) -> Result<(), ServiceError> {
        let mut session = self.session.lock().await;
        self.start_session(&mut session).await
    }

    /// Replace whatever `session` holds with a freshly launched daemon.
    async fn start_session(&self, session: &mut Option<Session>) -> Result<(), ServiceError> {
        let dropped = self.correlator.cancel_all();
        if !dropped.is_empty() {
            debug!("Dropped {} requests from the previous session", dropped.len());
        }
        if let Some(previous) = session.take() {
            teardown(previous, self.config.shutdown_timeout()).await;
        }

        *self.state.lock() = SessionState::Starting;
        let launched = match self.launcher.launch() {
            Ok(launched) => launched,
            Err(e) => {
                *self.state.lock() = SessionState::Stopped;
                return Err(e);
            }
        };

        let writer: SharedWriter = Arc::new(tokio::sync::Mutex::new(WireWriter::new(launched.writer)));
        let cancel = CancellationToken::new();
        let listener = tokio::spawn(listen(
            WireReader::new(launched.reader),
            Arc::clone(&writer),
            Arc::clone(&self.correlator),
            cancel.clone(),
            Arc::clone(&self.state),
        ));

        *session = Some(Session {
            writer,
            listener,
            cancel,
            process: launched.process,
        });
        *self.state.lock() = SessionState::Listening;
        info!("dprint editor service (schema 5) listening");
        Ok(())
    }

    /// `Some(answer)` on a proper response, `None` on an error response or
    /// when the request was dropped.
    ///
    /// # Errors
    ///
    /// `Timeout` when no answer arrives within the command timeout;
    /// `ProcessUnavailable` when no session is running.
    pub async fn can_format(&self, path: &Path) -> Result<Option<bool>, ServiceError> {
        self.ensure_healthy().await?;
        let writer = self.writer().await?;

        let timeout = self.config.command_timeout();
        let id = self.correlator.next_id();
        let message = OutgoingMessage::can_format(id, &path.to_string_lossy());
        let delivery = self
            .correlator
            .send(id, timeout, write_message(&writer, &message))
            .await?;

        match delivery {
            None => Err(ServiceError::timeout("canFormat", timeout)),
            Some(Delivery::Resolved(DaemonMessage::CanFormatResponse { can_format, .. })) => {
                Ok(Some(can_format))
            }
            Some(Delivery::Resolved(DaemonMessage::Error { message, .. })) => {
                warn!("dprint canFormat failed for {}: {}", path.display(), message);
                Ok(None)
            }
            Some(Delivery::Resolved(other)) => {
                warn!("Unexpected response to canFormat: {:?}", other);
                Ok(None)
            }
            Some(Delivery::Dropped) => Ok(None),
        }
    }

    /// Format `content`, optionally restricted to a character range.
    ///
    /// `format_id` lets the caller reserve the id up front (see
    /// [`next_message_id`](Self::next_message_id)). Returns `None` when the
    /// request was cancelled or dropped.
    pub async fn fmt(
        &self,
        path: &Path,
        content: &str,
        format_id: Option<u32>,
        range: Option<CharRange>,
    ) -> Result<Option<FormatResult>, ServiceError> {
        self.ensure_healthy().await?;
        let writer = self.writer().await?;

        let (start, end) = match &range {
            Some(range) => byte_range(content, range),
            None => (0, content.len() as u32),
        };
        let timeout = self.config.command_timeout();
        let id = format_id.unwrap_or_else(|| self.correlator.next_id());
        let message = OutgoingMessage::format_file(id, &path.to_string_lossy(), start, end, content);
        debug!(
            "Formatting {} (id: {}, bytes {}..{})",
            path.display(),
            id,
            start,
            end
        );

        let delivery = self
            .correlator
            .send(id, timeout, write_message(&writer, &message))
            .await?;

        match delivery {
            None => Err(ServiceError::timeout("format", timeout)),
            Some(Delivery::Resolved(DaemonMessage::FormatFileResponse { formatted, .. })) => {
                Ok(Some(FormatResult {
                    formatted_content: formatted,
                    error: None,
                }))
            }
            Some(Delivery::Resolved(DaemonMessage::Error { message, .. })) => {
                Ok(Some(FormatResult::failed(message)))
            }
            Some(Delivery::Resolved(other)) => Ok(Some(FormatResult::failed(format!(
                "Unexpected response to format: {:?}",
                other
            )))),
            Some(Delivery::Dropped) => {
                debug!("Format {} was dropped", id);
                Ok(None)
            }
        }
    }

    /// Ask the daemon to stop formatting `format_id` and release the local
    /// waiter. A no-op for ids that already resolved.
    pub async fn cancel_format(&self, format_id: u32) -> Result<(), ServiceError> {
        match self.writer().await {
            Ok(writer) => {
                let message = OutgoingMessage::cancel_format(self.correlator.next_id(), format_id);
                if let Err(e) = write_message(&writer, &message).await {
                    warn!("Failed to send cancel for format {}: {}", format_id, e);
                }
            }
            Err(e) => debug!("Not sending cancel for format {}: {}", format_id, e),
        }

        if self.correlator.cancel(format_id) {
            debug!("Cancelled format {}", format_id);
        } else {
            debug!("Format {} is not in flight, it will not be sent", format_id);
        }
        Ok(())
    }

    /// Ask the daemon to exit, then stop the listener, drop every pending
    /// request and tear the process down. Safe to call when stopped.
    pub async fn destroy(&self) {
        let mut session = self.session.lock().await;
        let Some(current) = session.take() else {
            debug!("dprint editor service already stopped");
            return;
        };

        let message = OutgoingMessage::shut_down(self.correlator.next_id());
        let shutdown = tokio::time::timeout(
            self.config.shutdown_timeout(),
            write_message(&current.writer, &message),
        )
        .await;
        match shutdown {
            Ok(Ok(())) => debug!("Sent shutdown to dprint"),
            Ok(Err(e)) => debug!("Failed to send shutdown to dprint: {}", e),
            Err(_) => debug!("Timed out sending shutdown to dprint"),
        }

        teardown(current, self.config.shutdown_timeout()).await;
        let dropped = self.correlator.cancel_all();
        if !dropped.is_empty() {
            debug!("Dropped {} pending requests on destroy", dropped.len());
        }
        *self.state.lock() = SessionState::Stopped;
        info!("dprint editor service (schema 5) stopped");
    }

    /// Restart the session when requests have gone unanswered too long.
    async fn ensure_healthy(&self) -> Result<(), ServiceError> {
        if self.correlator.has_stale(self.config.stale_threshold()) {
            self.reinitialise_if_stale().await?;
        }
        Ok(())
    }

    /// Another caller may have restarted the session while this one waited
    /// for the lock, so staleness is checked again under it.
    async fn reinitialise_if_stale(&self) -> Result<(), ServiceError> {
        let mut session = self.session.lock().await;
        if !self.correlator.has_stale(self.config.stale_threshold()) {
            return Ok(());
        }
        warn!(
            "dprint has requests pending for over {}ms, restarting the editor service",
            self.config.stale_threshold_ms
        );
        self.start_session(&mut session).await
    }

    /// Writer of the running session.
    async fn writer(&self) -> Result<SharedWriter, ServiceError> {
        let session = self.session.lock().await;
        match session.as_ref() {
            Some(session) if !session.listener.is_finished() => Ok(Arc::clone(&session.writer)),
            Some(_) => Err(ServiceError::ProcessUnavailable(
                "dprint editor service has exited".to_string(),
            )),
            None => Err(ServiceError::ProcessUnavailable(
                "dprint editor service is not running".to_string(),
            )),
        }
    }
}

async fn write_message(writer: &SharedWriter, message: &OutgoingMessage) -> Result<(), ServiceError> {
    let bytes = message.encode();
    writer.lock().await.write_buffer(&bytes).await
}

/// Stop the listener and release the process.
async fn teardown(mut session: Session, close_timeout: Duration) {
    session.cancel.cancel();
    match tokio::time::timeout(LISTENER_JOIN_TIMEOUT, &mut session.listener).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("dprint listener task failed: {}", e),
        Err(_) => {
            warn!("dprint listener did not stop in time, aborting it");
            session.listener.abort();
        }
    }

    let close = async { session.writer.lock().await.close().await };
    if let Ok(Err(e)) = tokio::time::timeout(close_timeout, close).await {
        debug!("Failed to close dprint stdin: {}", e);
    }

    if let Some(process) = session.process.take() {
        process.shutdown().await;
    }
}

/// Read frames until the daemon closes its output, a read fails, or the
/// session is cancelled.
async fn listen(
    mut reader: WireReader<DaemonReader>,
    writer: SharedWriter,
    correlator: Arc<Correlator>,
    cancel: CancellationToken,
    state: Arc<Mutex<SessionState>>,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("dprint listener cancelled");
                return;
            }
            frame = IncomingFrame::read_from(&mut reader) => frame,
        };

        match frame {
            Ok(frame) => handle_frame(frame, &writer, &correlator).await,
            Err(ServiceError::ProcessUnavailable(reason)) => {
                info!("dprint closed its output ({})", reason);
                break;
            }
            Err(e) => {
                error!("Failed to read message from dprint: {}", e);
                break;
            }
        }
    }

    let dropped = correlator.cancel_all();
    if !dropped.is_empty() {
        warn!("Dropped {} pending requests after dprint stopped responding", dropped.len());
    }
    *state.lock() = SessionState::Stopped;
}

async fn handle_frame(frame: IncomingFrame, writer: &SharedWriter, correlator: &Correlator) {
    let message = match frame.parse() {
        Ok(message) => message,
        Err(e) => {
            warn!("Malformed body in dprint message {}: {}", frame.id, e);
            let reply = OutgoingMessage::error(
                correlator.next_id(),
                frame.id,
                &format!("Malformed message body: {}", e),
            );
            reply_or_log(writer, &reply).await;
            return;
        }
    };

    match message {
        DaemonMessage::Active => {
            let reply = OutgoingMessage::success(correlator.next_id(), frame.id);
            reply_or_log(writer, &reply).await;
        }
        DaemonMessage::Unsupported { kind } => {
            warn!("Unsupported message type {} from dprint (id: {})", kind, frame.id);
            let reply = OutgoingMessage::error(
                correlator.next_id(),
                frame.id,
                &format!("Unsupported message type: {}", kind),
            );
            reply_or_log(writer, &reply).await;
        }
        response => {
            if let Some(response_id) = response.response_id() {
                correlator.resolve(response_id, response);
            }
        }
    }
}

async fn reply_or_log(writer: &SharedWriter, reply: &OutgoingMessage) {
    if let Err(e) = write_message(writer, reply).await {
        warn!("Failed to reply to dprint: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::MessageKind;
    use crate::transport::LaunchedDaemon;
    use pretty_assertions::assert_eq;
    use tokio::io::{duplex, DuplexStream};
    use tokio::time::timeout;

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    /// Daemon side of an in-memory session.
    struct DaemonEnd {
        reader: WireReader<DuplexStream>,
        writer: WireWriter<DuplexStream>,
    }

    impl DaemonEnd {
        async fn recv(&mut self) -> IncomingFrame {
            timeout(TEST_TIMEOUT, IncomingFrame::read_from(&mut self.reader))
                .await
                .expect("Test timed out")
                .unwrap()
        }

        async fn send(&mut self, message: OutgoingMessage) {
            self.writer.write_buffer(&message.encode()).await.unwrap();
        }
    }

    /// Launcher handing out one pre-made pipe pair.
    struct PipeLauncher {
        ends: parking_lot::Mutex<Vec<(DuplexStream, DuplexStream)>>,
    }

    impl DaemonLauncher for PipeLauncher {
        fn launch(&self) -> Result<LaunchedDaemon, ServiceError> {
            let (reader, writer) = self
                .ends
                .lock()
                .pop()
                .ok_or_else(|| ServiceError::ProcessUnavailable("no pipes left".to_string()))?;
            Ok(LaunchedDaemon {
                reader: Box::new(reader),
                writer: Box::new(writer),
                process: None,
            })
        }
    }

    fn service_with_config(config: ServiceConfig) -> (V5EditorService, DaemonEnd) {
        let (client_out, daemon_in) = duplex(64 * 1024);
        let (daemon_out, client_in) = duplex(64 * 1024);
        let launcher = PipeLauncher {
            ends: parking_lot::Mutex::new(vec![(client_in, client_out)]),
        };
        let service = V5EditorService::new(Arc::new(launcher), config);
        let daemon = DaemonEnd {
            reader: WireReader::new(daemon_in),
            writer: WireWriter::new(daemon_out),
        };
        (service, daemon)
    }

    async fn started() -> (V5EditorService, DaemonEnd) {
        let (service, daemon) = service_with_config(ServiceConfig::default());
        service.initialise().await.unwrap();
        (service, daemon)
    }

    #[tokio::test]
    async fn test_initialise_transitions_to_listening() {
        let (service, _daemon) = service_with_config(ServiceConfig::default());
        assert_eq!(service.state(), SessionState::Stopped);
        service.initialise().await.unwrap();
        assert_eq!(service.state(), SessionState::Listening);
    }

    #[tokio::test]
    async fn test_active_ping_is_acknowledged_with_its_id() {
        let (_service, mut daemon) = started().await;

        daemon.send(OutgoingMessage::new(77, MessageKind::Active)).await;
        let reply = daemon.recv().await;

        assert_eq!(reply.message_kind(), Some(MessageKind::SuccessResponse));
        assert_eq!(reply.parse().unwrap(), DaemonMessage::Success { response_id: 77 });
    }

    #[tokio::test]
    async fn test_unknown_type_is_rejected_with_incoming_id() {
        let (_service, mut daemon) = started().await;

        daemon.send(OutgoingMessage::new(12, MessageKind::FormatFile)).await;
        let reply = daemon.recv().await;

        match reply.parse().unwrap() {
            DaemonMessage::Error {
                response_id,
                message,
            } => {
                assert_eq!(response_id, 12);
                assert!(message.contains("Unsupported message type: 6"));
            }
            other => panic!("Expected ErrorResponse, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_responses_complete_out_of_order() {
        let (service, mut daemon) = started().await;
        let service = Arc::new(service);

        let first = {
            let s = Arc::clone(&service);
            tokio::spawn(async move { s.can_format(Path::new("/first.ts")).await })
        };
        let first_frame = daemon.recv().await;
        let second = {
            let s = Arc::clone(&service);
            tokio::spawn(async move { s.can_format(Path::new("/second.md")).await })
        };
        let second_frame = daemon.recv().await;
        assert_ne!(first_frame.id, second_frame.id);

        daemon
            .send(
                OutgoingMessage::new(200, MessageKind::CanFormatResponse)
                    .add_int(second_frame.id)
                    .add_int(0),
            )
            .await;
        daemon
            .send(
                OutgoingMessage::new(201, MessageKind::CanFormatResponse)
                    .add_int(first_frame.id)
                    .add_int(1),
            )
            .await;

        assert_eq!(second.await.unwrap().unwrap(), Some(false));
        assert_eq!(first.await.unwrap().unwrap(), Some(true));
    }

    #[tokio::test]
    async fn test_eof_releases_pending_requests() {
        let (service, mut daemon) = started().await;
        let service = Arc::new(service);

        let caller = Arc::clone(&service);
        let request = tokio::spawn(async move { caller.can_format(Path::new("/a.ts")).await });

        let frame = daemon.recv().await;
        assert_eq!(frame.message_kind(), Some(MessageKind::CanFormat));
        drop(daemon);

        let answer = timeout(TEST_TIMEOUT, request)
            .await
            .expect("Test timed out")
            .unwrap()
            .unwrap();
        assert_eq!(answer, None);

        let err = service.can_format(Path::new("/a.ts")).await.unwrap_err();
        assert!(matches!(err, ServiceError::ProcessUnavailable(_)));
    }

    #[tokio::test]
    async fn test_timeout_is_reported_and_late_response_dropped() {
        let config = ServiceConfig {
            command_timeout_ms: 50,
            ..ServiceConfig::default()
        };
        let (service, mut daemon) = service_with_config(config);
        service.initialise().await.unwrap();

        let err = service.can_format(Path::new("/slow.ts")).await.unwrap_err();
        assert!(matches!(err, ServiceError::Timeout { .. }));

        let frame = daemon.recv().await;
        daemon
            .send(
                OutgoingMessage::new(100, MessageKind::CanFormatResponse)
                    .add_int(frame.id)
                    .add_int(1),
            )
            .await;
        // The listener survives the late response and keeps answering pings
        daemon.send(OutgoingMessage::new(101, MessageKind::Active)).await;
        let reply = daemon.recv().await;
        assert_eq!(reply.parse().unwrap(), DaemonMessage::Success { response_id: 101 });
        assert_eq!(service.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_cancel_format_sends_cancel_and_releases_waiter() {
        let (service, mut daemon) = started().await;
        let service = Arc::new(service);
        let format_id = service.next_message_id();

        let caller = Arc::clone(&service);
        let request = tokio::spawn(async move {
            caller
                .fmt(Path::new("/f.ts"), "a", Some(format_id), None)
                .await
        });

        let frame = daemon.recv().await;
        assert_eq!(frame.id, format_id);

        service.cancel_format(format_id).await.unwrap();
        let cancel = daemon.recv().await;
        assert_eq!(cancel.message_kind(), Some(MessageKind::CancelFormat));
        assert_eq!(cancel.body_reader().read_int().unwrap(), format_id);

        let result = request.await.unwrap().unwrap();
        assert_eq!(result, None);

        // Cancelling again is a harmless no-op
        service.cancel_format(format_id).await.unwrap();
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent_and_sends_shutdown() {
        let (service, mut daemon) = started().await;

        service.destroy().await;
        let frame = daemon.recv().await;
        assert_eq!(frame.message_kind(), Some(MessageKind::ShutDownProcess));
        assert_eq!(service.state(), SessionState::Stopped);

        service.destroy().await;
        assert_eq!(service.state(), SessionState::Stopped);
    }
}

//! In-memory dprint daemons for integration tests.
//!
//! Every launch creates a fresh pair of duplex pipes and hands the daemon
//! end to the test over a channel, so tests can script replies and observe
//! restarts.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{duplex, DuplexStream};
use tokio::sync::mpsc;
use tokio::time::timeout;

use dprint_editor_client::codec::{IncomingFrame, MessageKind, OutgoingMessage};
use dprint_editor_client::config::ServiceConfig;
use dprint_editor_client::error::ServiceError;
use dprint_editor_client::host::{EditorHost, Notification};
use dprint_editor_client::lifecycle::{ServiceLifecycle, ServiceProvider};
use dprint_editor_client::models::ProtocolVersion;
use dprint_editor_client::service::EditorService;
use dprint_editor_client::transport::{DaemonLauncher, LaunchedDaemon, WireStream};

pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Client request as seen by the daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    CanFormat {
        id: u32,
        path: String,
    },
    FormatFile {
        id: u32,
        path: String,
        start: u32,
        end: u32,
        content: String,
    },
    CancelFormat {
        id: u32,
        format_id: u32,
    },
    ShutDown {
        id: u32,
    },
    Other {
        id: u32,
        kind: u32,
    },
}

impl Request {
    pub fn id(&self) -> u32 {
        match self {
            Request::CanFormat { id, .. }
            | Request::FormatFile { id, .. }
            | Request::CancelFormat { id, .. }
            | Request::ShutDown { id }
            | Request::Other { id, .. } => *id,
        }
    }

    fn from_frame(frame: &IncomingFrame) -> Self {
        let mut body = frame.body_reader();
        match frame.message_kind() {
            Some(MessageKind::CanFormat) => Request::CanFormat {
                id: frame.id,
                path: body.read_string().unwrap(),
            },
            Some(MessageKind::FormatFile) => {
                let path = body.read_string().unwrap();
                let start = body.read_int().unwrap();
                let end = body.read_int().unwrap();
                assert_eq!(body.read_int().unwrap(), 0, "override config");
                let content = body.read_string().unwrap();
                Request::FormatFile {
                    id: frame.id,
                    path,
                    start,
                    end,
                    content,
                }
            }
            Some(MessageKind::CancelFormat) => Request::CancelFormat {
                id: frame.id,
                format_id: body.read_int().unwrap(),
            },
            Some(MessageKind::ShutDownProcess) => Request::ShutDown { id: frame.id },
            _ => Request::Other {
                id: frame.id,
                kind: frame.kind,
            },
        }
    }
}

/// Daemon end of one session.
pub struct FakeDaemon {
    pub stream: WireStream<DuplexStream, DuplexStream>,
    next_id: u32,
}

impl FakeDaemon {
    pub async fn recv(&mut self) -> Request {
        let frame = timeout(TEST_TIMEOUT, IncomingFrame::read_from(&mut self.stream.reader))
            .await
            .expect("Test timed out waiting for a request")
            .unwrap();
        Request::from_frame(&frame)
    }

    pub async fn send(&mut self, message: OutgoingMessage) {
        self.stream
            .writer
            .write_buffer(&message.encode())
            .await
            .unwrap();
    }

    fn id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    pub async fn reply_can_format(&mut self, request_id: u32, answer: bool) {
        let id = self.id();
        let message = OutgoingMessage::new(id, MessageKind::CanFormatResponse)
            .add_int(request_id)
            .add_int(u32::from(answer));
        self.send(message).await;
    }

    pub async fn reply_formatted(&mut self, request_id: u32, formatted: Option<&str>) {
        let id = self.id();
        let message = OutgoingMessage::new(id, MessageKind::FormatFileResponse).add_int(request_id);
        let message = match formatted {
            Some(text) => message.add_int(1).add_string(text),
            None => message.add_int(0),
        };
        self.send(message).await;
    }

    pub async fn reply_error(&mut self, request_id: u32, text: &str) {
        let id = self.id();
        self.send(OutgoingMessage::error(id, request_id, text)).await;
    }
}

/// A connected client/daemon pipe pair.
pub fn pipe_pair() -> (LaunchedDaemon, FakeDaemon) {
    let (client_out, daemon_in) = duplex(256 * 1024);
    let (daemon_out, client_in) = duplex(256 * 1024);
    let launched = LaunchedDaemon {
        reader: Box::new(client_in),
        writer: Box::new(client_out),
        process: None,
    };
    let daemon = FakeDaemon {
        stream: WireStream::new(daemon_in, daemon_out),
        next_id: 1000,
    };
    (launched, daemon)
}

/// Launcher that sends each new daemon end to the test.
pub struct ChannelLauncher {
    daemons: mpsc::UnboundedSender<FakeDaemon>,
}

impl ChannelLauncher {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<FakeDaemon>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { daemons: tx }, rx)
    }
}

impl DaemonLauncher for ChannelLauncher {
    fn launch(&self) -> Result<LaunchedDaemon, ServiceError> {
        let (launched, daemon) = pipe_pair();
        self.daemons
            .send(daemon)
            .map_err(|_| ServiceError::ProcessUnavailable("test dropped the daemon channel".to_string()))?;
        Ok(launched)
    }
}

/// Await the next launched daemon.
pub async fn next_daemon(daemons: &mut mpsc::UnboundedReceiver<FakeDaemon>) -> FakeDaemon {
    timeout(TEST_TIMEOUT, daemons.recv())
        .await
        .expect("Test timed out waiting for a launch")
        .expect("launcher dropped")
}

/// Provider reporting a fixed schema and launching in-memory daemons.
pub struct FakeProvider {
    schema_version: u32,
    config: ServiceConfig,
    daemons: mpsc::UnboundedSender<FakeDaemon>,
}

#[async_trait]
impl ServiceProvider for FakeProvider {
    async fn detect_schema_version(
        &self,
        _executable: &Path,
        _config_dir: Option<&Path>,
    ) -> Result<u32, ServiceError> {
        Ok(self.schema_version)
    }

    fn create_service(
        &self,
        version: ProtocolVersion,
        _executable: &Path,
        _config_path: &Path,
    ) -> EditorService {
        let launcher = ChannelLauncher {
            daemons: self.daemons.clone(),
        };
        EditorService::new(version, Arc::new(launcher), self.config.clone())
    }
}

pub struct TestHost {
    pub open_files: Mutex<Vec<PathBuf>>,
    pub notifications: Mutex<Vec<Notification>>,
}

impl EditorHost for TestHost {
    fn config_path(&self) -> Option<PathBuf> {
        Some(PathBuf::from("/project/dprint.json"))
    }

    fn executable_path(&self) -> Option<PathBuf> {
        Some(PathBuf::from("/usr/local/bin/dprint"))
    }

    fn open_files(&self) -> Vec<PathBuf> {
        self.open_files.lock().clone()
    }

    fn notify(&self, notification: Notification) {
        self.notifications.lock().push(notification);
    }
}

pub struct Harness {
    pub lifecycle: ServiceLifecycle,
    pub host: Arc<TestHost>,
    pub daemons: mpsc::UnboundedReceiver<FakeDaemon>,
}

/// Config with short timeouts so timeout paths finish quickly.
pub fn fast_config() -> ServiceConfig {
    ServiceConfig {
        command_timeout_ms: 200,
        shutdown_timeout_ms: 100,
        ..ServiceConfig::default()
    }
}

pub fn harness(schema_version: u32, config: ServiceConfig) -> Harness {
    let (tx, rx) = mpsc::unbounded_channel();
    let host = Arc::new(TestHost {
        open_files: Mutex::new(Vec::new()),
        notifications: Mutex::new(Vec::new()),
    });
    let provider = Arc::new(FakeProvider {
        schema_version,
        config: config.clone(),
        daemons: tx,
    });
    let lifecycle = ServiceLifecycle::new(host.clone(), provider, config);
    Harness {
        lifecycle,
        host,
        daemons: rx,
    }
}

/// Poll `condition` until it holds or the test timeout elapses.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    timeout(TEST_TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("Test timed out waiting for condition");
}

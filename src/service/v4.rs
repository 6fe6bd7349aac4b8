//! Schema 4 editor service: one synchronous round trip at a time.
//!
//! There are no message ids, so requests are serialised on the connection
//! and cannot be cancelled. Range requests are formatted as whole files.

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::codec::v4;
use crate::config::ServiceConfig;
use crate::error::ServiceError;
use crate::models::{CharRange, FormatResult};
use crate::transport::{DaemonLauncher, DaemonProcess, DaemonReader, DaemonWriter, WireStream};

struct Connection {
    stream: WireStream<DaemonReader, DaemonWriter>,
    process: Option<DaemonProcess>,
}

impl Connection {
    async fn close(mut self) {
        if let Err(e) = self.stream.writer.close().await {
            debug!("Failed to close dprint stdin: {}", e);
        }
        if let Some(process) = self.process.take() {
            process.shutdown().await;
        }
    }
}

pub struct V4EditorService {
    launcher: Arc<dyn DaemonLauncher>,
    config: ServiceConfig,
    connection: tokio::sync::Mutex<Option<Connection>>,
}

impl V4EditorService {
    pub fn new(launcher: Arc<dyn DaemonLauncher>, config: ServiceConfig) -> Self {
        Self {
            launcher,
            config,
            connection: tokio::sync::Mutex::new(None),
        }
    }

    pub async fn is_running(&self) -> bool {
        self.connection.lock().await.is_some()
    }

    /// Spawn the daemon, replacing any previous one.
    pub async fn initialise(&self) -> Result<(), ServiceError> {
        let mut connection = self.connection.lock().await;
        if let Some(previous) = connection.take() {
            previous.close().await;
        }

        let launched = self.launcher.launch()?;
        *connection = Some(Connection {
            stream: WireStream::new(launched.reader, launched.writer),
            process: launched.process,
        });
        info!("dprint editor service (schema 4) started");
        Ok(())
    }

    pub async fn can_format(&self, path: &Path) -> Result<Option<bool>, ServiceError> {
        let path = path.to_string_lossy();
        let mut connection = self.connection.lock().await;
        let conn = connection.as_mut().ok_or_else(not_running)?;

        let timeout = self.config.command_timeout();
        let outcome = tokio::time::timeout(timeout, v4::can_format(&mut conn.stream, &path)).await;
        match outcome {
            Ok(Ok(answer)) => Ok(Some(answer)),
            Ok(Err(e)) => {
                discard(&mut connection, &e).await;
                Err(e)
            }
            Err(_) => {
                let e = ServiceError::timeout("canFormat", timeout);
                discard(&mut connection, &e).await;
                Err(e)
            }
        }
    }

    /// Format the whole file. `range` is ignored.
    pub async fn fmt(
        &self,
        path: &Path,
        content: &str,
        range: Option<CharRange>,
    ) -> Result<Option<FormatResult>, ServiceError> {
        if let Some(range) = range {
            debug!(
                "Schema 4 cannot range format, formatting all of {} instead of {:?}",
                path.display(),
                range
            );
        }

        let path = path.to_string_lossy();
        let mut connection = self.connection.lock().await;
        let conn = connection.as_mut().ok_or_else(not_running)?;

        let timeout = self.config.command_timeout();
        let outcome =
            tokio::time::timeout(timeout, v4::format(&mut conn.stream, &path, content)).await;
        match outcome {
            Ok(Ok(result)) => Ok(Some(result)),
            Ok(Err(e)) => {
                discard(&mut connection, &e).await;
                Err(e)
            }
            Err(_) => {
                let e = ServiceError::timeout("format", timeout);
                discard(&mut connection, &e).await;
                Err(e)
            }
        }
    }

    pub async fn cancel_format(&self, _format_id: u32) -> Result<(), ServiceError> {
        Err(ServiceError::UnsupportedOperation("cancelFormat"))
    }

    /// Stop the daemon. Safe to call when stopped.
    pub async fn destroy(&self) {
        let connection = self.connection.lock().await.take();
        match connection {
            Some(connection) => {
                connection.close().await;
                info!("dprint editor service (schema 4) stopped");
            }
            None => debug!("dprint editor service already stopped"),
        }
    }
}

fn not_running() -> ServiceError {
    ServiceError::ProcessUnavailable("dprint editor service is not running".to_string())
}

/// A failed exchange leaves the stream mid-message; drop the connection.
async fn discard(connection: &mut Option<Connection>, reason: &ServiceError) {
    warn!("Discarding dprint connection after failed exchange: {}", reason);
    if let Some(conn) = connection.take() {
        conn.close().await;
    }
}

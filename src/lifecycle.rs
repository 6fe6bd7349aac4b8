//! Service lifecycle manager.
//!
//! [`ServiceLifecycle`] sits between the editor and whichever
//! [`EditorService`] the installed dprint speaks. It detects the schema
//! version, starts the matching service, bounds every call with a timeout
//! and restarts the daemon when a call times out or the pipes fail.
//!
//! Callers get `None` for anything that did not produce an answer: not
//! ready, duplicate request, timeout, daemon error reply or dropped request.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::codec::offsets::utf16_len;
use crate::config::ServiceConfig;
use crate::error::ServiceError;
use crate::host::{EditorHost, Notification};
use crate::models::{CharRange, FormatResult, ProtocolVersion};
use crate::schema;
use crate::service::EditorService;
use crate::tasks::{TaskGuard, TaskKey, TaskKind, TaskRegistry};
use crate::transport::{DaemonCommand, ProcessLauncher};

/// Slack on top of the command timeout for lock contention and writes.
const CALL_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub enum ServiceState {
    Uninitialized,
    Initializing,
    Ready {
        service: Arc<EditorService>,
        config_path: PathBuf,
    },
    Error(String),
}

impl ServiceState {
    pub fn name(&self) -> &'static str {
        match self {
            ServiceState::Uninitialized => "uninitialized",
            ServiceState::Initializing => "initializing",
            ServiceState::Ready { .. } => "ready",
            ServiceState::Error(_) => "error",
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, ServiceState::Ready { .. })
    }
}

/// Schema detection and service construction.
///
/// The default [`DaemonServiceProvider`] runs the real executable; tests
/// substitute providers that hand out in-memory daemons.
#[async_trait]
pub trait ServiceProvider: Send + Sync {
    async fn detect_schema_version(
        &self,
        executable: &Path,
        config_dir: Option<&Path>,
    ) -> Result<u32, ServiceError>;

    fn create_service(
        &self,
        version: ProtocolVersion,
        executable: &Path,
        config_path: &Path,
    ) -> EditorService;
}

pub struct DaemonServiceProvider {
    config: ServiceConfig,
}

impl DaemonServiceProvider {
    pub fn new(config: ServiceConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ServiceProvider for DaemonServiceProvider {
    async fn detect_schema_version(
        &self,
        executable: &Path,
        config_dir: Option<&Path>,
    ) -> Result<u32, ServiceError> {
        schema::detect_schema_version(executable, config_dir, self.config.initialisation_timeout())
            .await
    }

    fn create_service(
        &self,
        version: ProtocolVersion,
        executable: &Path,
        config_path: &Path,
    ) -> EditorService {
        let command = DaemonCommand::new(executable, config_path).verbose(self.config.verbose);
        EditorService::new(
            version,
            Arc::new(ProcessLauncher::new(command)),
            self.config.clone(),
        )
    }
}

struct Inner {
    host: Arc<dyn EditorHost>,
    provider: Arc<dyn ServiceProvider>,
    config: ServiceConfig,
    state: RwLock<ServiceState>,
    can_format_cache: Mutex<HashMap<PathBuf, bool>>,
    tasks: TaskRegistry,
    restarts: AtomicUsize,
    /// Serialises initialise, restart and destroy.
    transition: tokio::sync::Mutex<()>,
}

/// Cloneable handle; clones share one service.
#[derive(Clone)]
pub struct ServiceLifecycle {
    inner: Arc<Inner>,
}

impl ServiceLifecycle {
    pub fn new(
        host: Arc<dyn EditorHost>,
        provider: Arc<dyn ServiceProvider>,
        config: ServiceConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                host,
                provider,
                config,
                state: RwLock::new(ServiceState::Uninitialized),
                can_format_cache: Mutex::new(HashMap::new()),
                tasks: TaskRegistry::new(),
                restarts: AtomicUsize::new(0),
                transition: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Lifecycle that spawns the real dprint executable.
    pub fn with_daemon(host: Arc<dyn EditorHost>, config: ServiceConfig) -> Self {
        let provider = Arc::new(DaemonServiceProvider::new(config.clone()));
        Self::new(host, provider, config)
    }

    pub fn state(&self) -> ServiceState {
        self.inner.state.read().clone()
    }

    pub fn is_ready(&self) -> bool {
        self.inner.state.read().is_ready()
    }

    /// Restarts attempted so far, scheduled or explicit.
    pub fn restart_count(&self) -> usize {
        self.inner.restarts.load(Ordering::SeqCst)
    }

    pub fn can_range_format(&self) -> bool {
        self.ready_service()
            .is_some_and(|service| service.can_range_format())
    }

    pub fn can_cancel_format(&self) -> bool {
        self.ready_service()
            .is_some_and(|service| service.can_cancel_format())
    }

    /// Reserve an id so a format can be cancelled before it is sent.
    /// `None` when the running protocol has no ids.
    pub fn next_format_id(&self) -> Option<u32> {
        self.ready_service()?.next_format_id()
    }

    fn ready_service(&self) -> Option<Arc<EditorService>> {
        match &*self.inner.state.read() {
            ServiceState::Ready { service, .. } => Some(Arc::clone(service)),
            _ => None,
        }
    }

    fn set_state(&self, state: ServiceState) -> ServiceState {
        debug!("dprint service state -> {}", state.name());
        std::mem::replace(&mut *self.inner.state.write(), state)
    }

    /// Start the service if it is not running. Returns whether it is ready.
    pub async fn initialise(&self) -> bool {
        let Some(_guard) = self.inner.tasks.try_begin(TaskKey::new(TaskKind::Initialise)) else {
            info!("dprint initialisation already in progress, ignoring request");
            return false;
        };
        let _transition = self.inner.transition.lock().await;
        if self.is_ready() {
            debug!("dprint service already initialised");
            return true;
        }

        match self.start().await {
            Ok(()) => true,
            Err(e @ ServiceError::Timeout { .. }) => {
                self.schedule_restart(&e.to_string());
                false
            }
            Err(_) => false,
        }
    }

    /// Resolve paths, detect the schema and start a new service.
    ///
    /// Does not touch the lifecycle state; [`initialise`](Self::initialise)
    /// and [`restart`](Self::restart) record the outcome.
    pub async fn initialise_fresh(&self) -> Result<(Arc<EditorService>, PathBuf), ServiceError> {
        let config_path = self
            .inner
            .host
            .config_path()
            .ok_or_else(|| ServiceError::Configuration("No dprint config file found".to_string()))?;
        let executable = self.inner.host.executable_path().ok_or_else(|| {
            ServiceError::Configuration("No dprint executable configured".to_string())
        })?;
        let config_dir = config_path.parent().filter(|dir| !dir.as_os_str().is_empty());

        let schema_version = self
            .inner
            .provider
            .detect_schema_version(&executable, config_dir)
            .await?;
        let protocol = schema::select_protocol(schema_version)?;

        let service = self
            .inner
            .provider
            .create_service(protocol, &executable, &config_path);
        if let Err(e) = service.initialise().await {
            service.destroy().await;
            return Err(e);
        }
        info!(
            "dprint editor service ready (schema {}, config {})",
            schema_version,
            config_path.display()
        );
        Ok((Arc::new(service), config_path))
    }

    /// Caller holds `transition`.
    async fn start(&self) -> Result<(), ServiceError> {
        self.set_state(ServiceState::Initializing);

        let timeout = self.inner.config.initialisation_timeout();
        let outcome = tokio::time::timeout(timeout, self.initialise_fresh())
            .await
            .unwrap_or_else(|_| Err(ServiceError::timeout("initialise", timeout)));

        match outcome {
            Ok((service, config_path)) => {
                self.set_state(ServiceState::Ready {
                    service,
                    config_path,
                });
                Ok(())
            }
            Err(e) => {
                error!("Failed to initialise dprint editor service: {}", e);
                self.set_state(ServiceState::Error(e.to_string()));
                self.inner.host.notify(Notification::error(
                    "dprint",
                    format!("Failed to start the dprint editor service: {}", e),
                ));
                Err(e)
            }
        }
    }

    /// Stop the current service and start a new one.
    pub async fn restart(&self) -> bool {
        let Some(guard) = self.inner.tasks.try_begin(TaskKey::new(TaskKind::Restart)) else {
            info!("dprint restart already in progress, ignoring request");
            return false;
        };
        self.restart_with(guard, false).await
    }

    /// Restart in the background unless a restart is already under way or
    /// the service was destroyed.
    pub fn schedule_restart(&self, reason: &str) {
        if matches!(self.state(), ServiceState::Uninitialized) {
            debug!("Not restarting stopped dprint service ({})", reason);
            return;
        }
        let Some(guard) = self.inner.tasks.try_begin(TaskKey::new(TaskKind::Restart)) else {
            debug!("dprint restart already scheduled, ignoring: {}", reason);
            return;
        };
        warn!("Restarting dprint editor service: {}", reason);
        let lifecycle = self.clone();
        tokio::spawn(async move {
            lifecycle.restart_with(guard, true).await;
        });
    }

    async fn restart_with(&self, _guard: TaskGuard, scheduled: bool) -> bool {
        let transition = self.inner.transition.lock().await;
        if scheduled && matches!(self.state(), ServiceState::Uninitialized) {
            debug!("dprint service destroyed before scheduled restart ran");
            return false;
        }

        self.inner.restarts.fetch_add(1, Ordering::SeqCst);
        let previous = self.set_state(ServiceState::Initializing);
        self.inner.can_format_cache.lock().clear();
        if let ServiceState::Ready { service, .. } = previous {
            service.destroy().await;
        }

        let ready = self.start().await.is_ok();
        drop(transition);

        if ready {
            self.prime_open_files().await;
        }
        ready
    }

    async fn prime_open_files(&self) {
        let files = self.inner.host.open_files();
        debug!("Re-checking {} open files after restart", files.len());
        for path in files {
            self.can_format(&path).await;
        }
    }

    /// Stop the service. Safe to call repeatedly.
    pub async fn destroy(&self) {
        let _transition = self.inner.transition.lock().await;
        let previous = self.set_state(ServiceState::Uninitialized);
        self.inner.can_format_cache.lock().clear();
        if let ServiceState::Ready { service, .. } = previous {
            service.destroy().await;
            info!("dprint editor service destroyed");
        }
    }

    /// Whether dprint can format `path`, cached per path.
    pub async fn can_format(&self, path: &Path) -> Option<bool> {
        if !self.inner.host.is_eligible(path) {
            return Some(false);
        }
        if let Some(&cached) = self.inner.can_format_cache.lock().get(path) {
            return Some(cached);
        }
        let Some(service) = self.ready_service() else {
            debug!("dprint not ready, cannot check {}", path.display());
            return None;
        };
        let Some(_guard) = self
            .inner
            .tasks
            .try_begin(TaskKey::for_path(TaskKind::CanFormat, path))
        else {
            debug!("canFormat already in flight for {}", path.display());
            return None;
        };

        match self.bounded("canFormat", service.can_format(path)).await {
            Ok(Some(answer)) => {
                self.inner
                    .can_format_cache
                    .lock()
                    .insert(path.to_path_buf(), answer);
                Some(answer)
            }
            Ok(None) => None,
            Err(e) => {
                self.handle_failure("canFormat", e);
                None
            }
        }
    }

    /// Format the whole file.
    pub async fn format(
        &self,
        path: &Path,
        content: &str,
        format_id: Option<u32>,
    ) -> Option<FormatResult> {
        self.format_range(path, content, None, format_id).await
    }

    /// Format one UTF-16 range, or the whole file when `range` is `None`.
    pub async fn format_range(
        &self,
        path: &Path,
        content: &str,
        range: Option<CharRange>,
        format_id: Option<u32>,
    ) -> Option<FormatResult> {
        let Some(service) = self.ready_service() else {
            debug!("dprint not ready, cannot format {}", path.display());
            return None;
        };
        let Some(_guard) = self.begin_format(path, format_id) else {
            return None;
        };
        self.run_format(&service, path, content, format_id, range)
            .await
    }

    /// Format several ranges one after another.
    ///
    /// Each request is sent on the text produced by the previous one, with
    /// later ranges shifted by the change in length so far. Without range
    /// support the whole file is formatted once.
    pub async fn format_ranges(
        &self,
        path: &Path,
        content: &str,
        ranges: &[CharRange],
    ) -> Option<FormatResult> {
        let Some(service) = self.ready_service() else {
            debug!("dprint not ready, cannot format {}", path.display());
            return None;
        };
        if ranges.is_empty() || !service.can_range_format() {
            return self.format(path, content, None).await;
        }
        let Some(_guard) = self.begin_format(path, None) else {
            return None;
        };

        let mut ranges = ranges.to_vec();
        ranges.sort_by_key(|range| (range.start, range.end));

        let mut current = content.to_string();
        let mut delta: isize = 0;
        for range in ranges {
            let start = shift(range.start, delta);
            let end = shift(range.end, delta).max(start);
            let result = self
                .run_format(
                    &service,
                    path,
                    &current,
                    service.next_format_id(),
                    Some(start..end),
                )
                .await?;
            if result.is_error() {
                return Some(result);
            }
            if let Some(next) = result.formatted_content {
                delta += utf16_len(&next) as isize - utf16_len(&current) as isize;
                current = next;
            }
        }

        if current == content {
            Some(FormatResult::unchanged())
        } else {
            Some(FormatResult::formatted(current))
        }
    }

    fn begin_format(&self, path: &Path, format_id: Option<u32>) -> Option<TaskGuard> {
        let guard = self
            .inner
            .tasks
            .try_begin(TaskKey::for_path(TaskKind::Format, path).with_id(format_id));
        if guard.is_none() {
            info!(
                "Format of {} already in progress, dropping duplicate request",
                path.display()
            );
        }
        guard
    }

    async fn run_format(
        &self,
        service: &EditorService,
        path: &Path,
        content: &str,
        format_id: Option<u32>,
        range: Option<CharRange>,
    ) -> Option<FormatResult> {
        match self
            .bounded("format", service.fmt(path, content, format_id, range))
            .await
        {
            Ok(Some(result)) => {
                if let Some(reason) = &result.error {
                    warn!("dprint failed to format {}: {}", path.display(), reason);
                }
                Some(result)
            }
            Ok(None) => None,
            Err(e) => {
                self.handle_failure("format", e);
                None
            }
        }
    }

    /// Ask the daemon to stop a format and stop waiting for it. No-op on
    /// schema 4.
    pub async fn cancel_format(&self, format_id: u32) {
        let Some(service) = self.ready_service() else {
            return;
        };
        if !service.can_cancel_format() {
            debug!("dprint schema 4 cannot cancel format {}", format_id);
            return;
        }
        let Some(_guard) = self
            .inner
            .tasks
            .try_begin(TaskKey::new(TaskKind::Cancel).with_id(Some(format_id)))
        else {
            debug!("Cancel of format {} already in progress", format_id);
            return;
        };

        if let Err(e) = self
            .bounded("cancelFormat", service.cancel_format(format_id))
            .await
        {
            self.handle_failure("cancelFormat", e);
        }
    }

    async fn bounded<T>(
        &self,
        operation: &'static str,
        call: impl Future<Output = Result<T, ServiceError>>,
    ) -> Result<T, ServiceError> {
        let limit = self.inner.config.command_timeout() + CALL_GRACE;
        tokio::time::timeout(limit, call)
            .await
            .unwrap_or_else(|_| Err(ServiceError::timeout(operation, limit)))
    }

    fn handle_failure(&self, operation: &str, err: ServiceError) {
        match &err {
            ServiceError::UnsupportedOperation(_) => {
                debug!("dprint {} unsupported: {}", operation, err);
            }
            e if e.is_health_signal() => {
                warn!("dprint {} failed: {}", operation, e);
                self.schedule_restart(&format!("{} failed: {}", operation, e));
            }
            e => error!("dprint {} failed: {}", operation, e),
        }
    }
}

fn shift(index: usize, delta: isize) -> usize {
    index.saturating_add_signed(delta)
}

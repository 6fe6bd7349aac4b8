//! Editor services for each supported protocol version.
//!
//! The protocol is chosen once per daemon session and never mixed:
//! [`EditorService`] is a closed enum over the two implementations with one
//! capability surface. Callers should check
//! [`can_range_format`](EditorService::can_range_format) and
//! [`can_cancel_format`](EditorService::can_cancel_format) before relying on
//! those features.

mod v4;
mod v5;

use std::path::Path;
use std::sync::Arc;

pub use v4::V4EditorService;
pub use v5::{SessionState, V5EditorService};

use crate::config::ServiceConfig;
use crate::error::ServiceError;
use crate::models::{CharRange, FormatResult, ProtocolVersion};
use crate::transport::DaemonLauncher;

pub enum EditorService {
    V4(V4EditorService),
    V5(V5EditorService),
}

impl EditorService {
    pub fn new(
        version: ProtocolVersion,
        launcher: Arc<dyn DaemonLauncher>,
        config: ServiceConfig,
    ) -> Self {
        match version {
            ProtocolVersion::V4 => EditorService::V4(V4EditorService::new(launcher, config)),
            ProtocolVersion::V5 => EditorService::V5(V5EditorService::new(launcher, config)),
        }
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        match self {
            EditorService::V4(_) => ProtocolVersion::V4,
            EditorService::V5(_) => ProtocolVersion::V5,
        }
    }

    pub fn can_range_format(&self) -> bool {
        matches!(self, EditorService::V5(_))
    }

    pub fn can_cancel_format(&self) -> bool {
        matches!(self, EditorService::V5(_))
    }

    /// Reserve an id for a later `fmt`, when the protocol has ids.
    pub fn next_format_id(&self) -> Option<u32> {
        match self {
            EditorService::V4(_) => None,
            EditorService::V5(service) => Some(service.next_message_id()),
        }
    }

    pub async fn initialise(&self) -> Result<(), ServiceError> {
        match self {
            EditorService::V4(service) => service.initialise().await,
            EditorService::V5(service) => service.initialise().await,
        }
    }

    pub async fn can_format(&self, path: &Path) -> Result<Option<bool>, ServiceError> {
        match self {
            EditorService::V4(service) => service.can_format(path).await,
            EditorService::V5(service) => service.can_format(path).await,
        }
    }

    /// Format `content`. Schema 4 ignores `format_id` and `range`.
    pub async fn fmt(
        &self,
        path: &Path,
        content: &str,
        format_id: Option<u32>,
        range: Option<CharRange>,
    ) -> Result<Option<FormatResult>, ServiceError> {
        match self {
            EditorService::V4(service) => service.fmt(path, content, range).await,
            EditorService::V5(service) => service.fmt(path, content, format_id, range).await,
        }
    }

    /// # Errors
    ///
    /// `UnsupportedOperation` on schema 4.
    pub async fn cancel_format(&self, format_id: u32) -> Result<(), ServiceError> {
        match self {
            EditorService::V4(service) => service.cancel_format(format_id).await,
            EditorService::V5(service) => service.cancel_format(format_id).await,
        }
    }

    pub async fn destroy(&self) {
        match self {
            EditorService::V4(service) => service.destroy().await,
            EditorService::V5(service) => service.destroy().await,
        }
    }
}

impl std::fmt::Debug for EditorService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EditorService")
            .field("protocol", &self.protocol_version())
            .finish()
    }
}

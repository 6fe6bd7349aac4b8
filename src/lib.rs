//! dprint editor-service client.
//!
//! Drives a long-running `dprint editor-service` daemon over its stdio
//! pipes so an editor can ask whether files are formattable and get them
//! formatted without spawning a process per request.
//!
//! - `transport` - daemon process and big-endian wire primitives
//! - `codec` - schema 5 message frames, schema 4 exchanges, offset conversion
//! - `correlator` - matches schema 5 responses to pending requests by id
//! - `service` - the schema 4 and schema 5 editor services
//! - `lifecycle` - schema detection, timeouts and restarts around a service
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use dprint_editor_client::{config::ServiceConfig, host::StaticHost, lifecycle::ServiceLifecycle};
//!
//! let host = Arc::new(StaticHost::new("/usr/local/bin/dprint", "/project/dprint.json"));
//! let lifecycle = ServiceLifecycle::with_daemon(host, ServiceConfig::default());
//! if lifecycle.initialise().await {
//!     let result = lifecycle.format(path, &text, lifecycle.next_format_id()).await;
//! }
//! lifecycle.destroy().await;
//! ```

pub mod codec;
pub mod config;
pub mod correlator;
pub mod error;
pub mod host;
pub mod lifecycle;
pub mod models;
pub mod schema;
pub mod service;
pub mod tasks;
pub mod transport;

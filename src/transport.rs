//! Byte-level I/O against the dprint daemon.
//!
//! The transport knows nothing about message types. It owns the child
//! process, drains its stderr into the log, and offers primitive reads and
//! writes of big-endian ints, length-prefixed strings and raw buffers over
//! the daemon's stdin/stdout.
//!
//! # Wire primitives
//!
//! ```text
//! int     = 4 bytes, big-endian
//! string  = int(len) | len bytes of UTF-8
//! success = ff ff ff ff
//! ```
//!
//! The legacy (schema 4) daemon transfers strings in 1024-byte chunks and
//! expects a 4-byte acknowledgement between chunks; see
//! [`WireStream::write_string_chunked`] and
//! [`WireStream::read_string_chunked`].

mod process;
mod stream;

pub use process::{
    DaemonCommand, DaemonLauncher, DaemonProcess, DaemonReader, DaemonWriter, LaunchedDaemon,
    ProcessLauncher,
};
pub use stream::{WireReader, WireStream, WireWriter, CHUNK_SIZE, MAX_MESSAGE_SIZE, SUCCESS_SENTINEL};

//! Message framing for the two editor-service protocol versions.
//!
//! # Schema 4
//!
//! No ids and no message types; each exchange is a fixed command int
//! followed by chunked strings and a sentinel. See [`v4`].
//!
//! # Schema 5
//!
//! Every message, in either direction, is framed as:
//!
//! ```text
//! id(4) | type(4) | bodyLength(4) | body(bodyLength) | ff ff ff ff
//! ```
//!
//! The body is a sequence of ints and length-prefixed strings in the order
//! defined for its message type. See [`message`].

pub mod message;
pub mod offsets;
pub mod v4;

pub use message::{BodyReader, DaemonMessage, IncomingFrame, MessageKind, MessagePart, OutgoingMessage};
pub use offsets::{byte_range, utf16_to_byte_offset};

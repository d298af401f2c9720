//! Line-delimited JSON protocol spoken with the backend process.
//!
//! Commands go to the backend's stdin, one JSON object per line. Status
//! messages come back on its stderr, one per line. Generated text is streamed
//! on stdout between marker lines. Everything here is pure: no I/O.

mod codec;
mod messages;
mod stream;
mod thinking;

pub use codec::{decode, encode};
pub use messages::{Command, StatusMessage};
pub use stream::{split_stream_line, StreamPiece, STREAM_END_MARKER, STREAM_START_MARKER};
pub use thinking::{split_thinking, Segment, ThinkingSplitter, ThinkingTags};

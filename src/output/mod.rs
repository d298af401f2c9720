pub mod formatter;
pub mod logger;
pub mod transcript;

pub use formatter::ConsoleTranscript;
pub use transcript::{NullTranscript, TranscriptSink};

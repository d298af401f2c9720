//! Marker framing for text the backend streams on stdout.

/// Emitted on its own line before the first generated token.
pub const STREAM_START_MARKER: &str = "[LLM_STREAM_START]";
/// Emitted after the last generated token, possibly on the same line.
pub const STREAM_END_MARKER: &str = "[LLM_STREAM_END]";

/// One piece of a stdout line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamPiece {
    Start,
    Text(String),
    End,
}

/// Split one raw stdout line, terminator included, into markers and text.
///
/// Generated text keeps its newlines (`\r\n` is normalized to `\n`); the
/// terminator that ends a marker's own line is dropped.
pub fn split_stream_line(line: &str) -> Vec<StreamPiece> {
    let mut pieces = Vec::new();
    let mut rest = line;

    loop {
        let start = rest.find(STREAM_START_MARKER);
        let end = rest.find(STREAM_END_MARKER);
        let next = match (start, end) {
            (Some(s), Some(e)) if s < e => Some((s, STREAM_START_MARKER, StreamPiece::Start)),
            (Some(s), None) => Some((s, STREAM_START_MARKER, StreamPiece::Start)),
            (_, Some(e)) => Some((e, STREAM_END_MARKER, StreamPiece::End)),
            (None, None) => None,
        };

        let Some((index, marker, piece)) = next else {
            push_text(&mut pieces, rest);
            break;
        };

        push_text(&mut pieces, &rest[..index]);
        pieces.push(piece);
        rest = &rest[index + marker.len()..];
        if matches!(rest, "\n" | "\r\n" | "\r") {
            rest = "";
        }
    }

    pieces
}

fn push_text(pieces: &mut Vec<StreamPiece>, text: &str) {
    if text.is_empty() {
        return;
    }
    let text = match text.strip_suffix("\r\n") {
        Some(body) => format!("{body}\n"),
        None => text.to_string(),
    };
    pieces.push(StreamPiece::Text(text));
}

//! Separation of model reasoning from the answer in generated text.
//!
//! Some models wrap their reasoning in tags such as `<thinking>...</thinking>`
//! or `【思考】...【/思考】`. Tags are never part of either output; the text
//! between them is reported as thinking, everything else as the answer.

/// Tag pairs recognized in generated text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThinkingTags {
    pub start: Vec<String>,
    pub end: Vec<String>,
    /// Treat generated text as thinking until the first end tag, for models
    /// that never emit the opening tag.
    pub implicit: bool,
}

impl Default for ThinkingTags {
    fn default() -> Self {
        Self {
            start: vec!["<thinking>".to_string(), "【思考】".to_string()],
            end: vec!["</thinking>".to_string(), "【/思考】".to_string()],
            implicit: false,
        }
    }
}

/// A run of generated text of one kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Answer(String),
    Thinking(String),
}

/// Incremental splitter for streamed text.
///
/// Fragments may cut a tag in two, so a trailing partial tag is held back
/// until the next fragment or [`ThinkingSplitter::finish`].
#[derive(Debug, Clone)]
pub struct ThinkingSplitter {
    start: Vec<String>,
    end: Vec<String>,
    in_thinking: bool,
    held: String,
}

impl ThinkingSplitter {
    pub fn new(tags: &ThinkingTags) -> Self {
        Self {
            start: tags.start.iter().filter(|t| !t.is_empty()).cloned().collect(),
            end: tags.end.iter().filter(|t| !t.is_empty()).cloned().collect(),
            in_thinking: tags.implicit,
            held: String::new(),
        }
    }

    pub fn in_thinking(&self) -> bool {
        self.in_thinking
    }

    pub fn push(&mut self, text: &str) -> Vec<Segment> {
        let mut buf = std::mem::take(&mut self.held);
        buf.push_str(text);

        let mut segments = Vec::new();
        let mut rest = buf.as_str();
        loop {
            match self.next_tag(rest) {
                Some((index, len, opens)) => {
                    self.emit(&mut segments, &rest[..index]);
                    self.in_thinking = opens;
                    rest = &rest[index + len..];
                }
                None => {
                    let keep = self.partial_tag_len(rest);
                    let (ready, held) = rest.split_at(rest.len() - keep);
                    self.emit(&mut segments, ready);
                    self.held = held.to_string();
                    break;
                }
            }
        }
        segments
    }

    /// Release text held back for a possible tag.
    pub fn finish(&mut self) -> Vec<Segment> {
        let held = std::mem::take(&mut self.held);
        let mut segments = Vec::new();
        self.emit(&mut segments, &held);
        segments
    }

    /// Earliest tag in `text`: byte index, tag length, and whether it opens.
    fn next_tag(&self, text: &str) -> Option<(usize, usize, bool)> {
        let opening = self.start.iter().map(|t| (t, true));
        let closing = self.end.iter().map(|t| (t, false));
        opening
            .chain(closing)
            .filter_map(|(tag, opens)| text.find(tag.as_str()).map(|i| (i, tag.len(), opens)))
            .min_by_key(|&(index, len, _)| (index, std::cmp::Reverse(len)))
    }

    /// Length of the longest suffix of `text` that starts some tag.
    fn partial_tag_len(&self, text: &str) -> usize {
        self.start
            .iter()
            .chain(&self.end)
            .flat_map(|tag| {
                (1..tag.len())
                    .filter(|&k| tag.is_char_boundary(k) && text.ends_with(&tag[..k]))
                    .max()
            })
            .max()
            .unwrap_or(0)
    }

    fn emit(&self, segments: &mut Vec<Segment>, text: &str) {
        if text.is_empty() {
            return;
        }
        if let Some(last) = segments.last_mut() {
            match (last, self.in_thinking) {
                (Segment::Thinking(run), true) | (Segment::Answer(run), false) => {
                    run.push_str(text);
                    return;
                }
                _ => {}
            }
        }
        let text = text.to_string();
        segments.push(if self.in_thinking {
            Segment::Thinking(text)
        } else {
            Segment::Answer(text)
        });
    }
}

/// Split a complete text into `(answer, thinking)`.
pub fn split_thinking(tags: &ThinkingTags, text: &str) -> (String, String) {
    let mut splitter = ThinkingSplitter::new(tags);
    let mut segments = splitter.push(text);
    segments.extend(splitter.finish());

    let mut answer = String::new();
    let mut thinking = String::new();
    for segment in segments {
        match segment {
            Segment::Answer(text) => answer.push_str(&text),
            Segment::Thinking(text) => thinking.push_str(&text),
        }
    }
    (answer, thinking)
}

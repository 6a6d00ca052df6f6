//! Incremental separation of visible answer text from tag-delimited
//! reasoning, across arbitrarily fragmented input.
//!
//! One buffer, one flag. Outside a reasoning region the scanner looks for
//! the opening tag; inside, for the closing tag. Text that can no longer be
//! part of a partial tag match is flushed eagerly, so the buffer never grows
//! past a small safety margin.

/// Classified output of a [`TagScanner`] push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEvent {
    /// Visible answer text.
    Answer(String),
    /// Reasoning-region text.
    Reasoning(String),
    /// A reasoning region closed (its closing tag was consumed).
    ReasoningEnd,
}

/// Streaming tag scanner for one adapter round.
#[derive(Debug)]
pub struct TagScanner {
    opening: String,
    closing: String,
    buffer: String,
    in_reasoning: bool,
}

impl TagScanner {
    pub fn new(opening: impl Into<String>, closing: impl Into<String>) -> Self {
        Self {
            opening: opening.into(),
            closing: closing.into(),
            buffer: String::new(),
            in_reasoning: false,
        }
    }

    /// Whether the scanner is currently inside a reasoning region.
    pub fn in_reasoning(&self) -> bool {
        self.in_reasoning
    }

    /// Consume one fragment, returning classified events in input order.
    ///
    /// Lossless: concatenating all `Answer` payloads reproduces the input
    /// minus reasoning regions and tags; `Reasoning` payloads reproduce the
    /// region contents.
    pub fn push(&mut self, fragment: &str) -> Vec<ScanEvent> {
        let mut events = Vec::new();
        if self.disabled() {
            if !fragment.is_empty() {
                events.push(ScanEvent::Answer(fragment.to_string()));
            }
            return events;
        }

        self.buffer.push_str(fragment);
        loop {
            if self.in_reasoning {
                let Some(pos) = self.buffer.find(&self.closing) else {
                    let margin = self.closing.chars().count() + 5;
                    if let Some(flushed) = self.flush_beyond_margin(margin) {
                        events.push(ScanEvent::Reasoning(flushed));
                    }
                    break;
                };
                if pos > 0 {
                    events.push(ScanEvent::Reasoning(self.buffer[..pos].to_string()));
                }
                self.buffer.drain(..pos + self.closing.len());
                self.in_reasoning = false;
                events.push(ScanEvent::ReasoningEnd);
            } else {
                let Some(pos) = self.buffer.find(&self.opening) else {
                    let margin = self.opening.chars().count() + 5;
                    if let Some(flushed) = self.flush_beyond_margin(margin) {
                        events.push(ScanEvent::Answer(flushed));
                    }
                    break;
                };
                if pos > 0 {
                    events.push(ScanEvent::Answer(self.buffer[..pos].to_string()));
                }
                self.buffer.drain(..pos + self.opening.len());
                self.in_reasoning = true;
            }
        }
        events
    }

    /// Flush residual content at stream end, tagged by the active mode.
    ///
    /// An opened-but-unclosed region therefore surfaces all trailing content
    /// as reasoning. A trailing partial tag is content, not a tag.
    pub fn flush(&mut self) -> Vec<ScanEvent> {
        if self.buffer.is_empty() {
            return Vec::new();
        }
        let residual = std::mem::take(&mut self.buffer);
        if self.in_reasoning {
            vec![ScanEvent::Reasoning(residual)]
        } else {
            vec![ScanEvent::Answer(residual)]
        }
    }

    /// An empty tag would match everywhere; treat the scanner as disabled.
    fn disabled(&self) -> bool {
        self.opening.is_empty() || self.closing.is_empty()
    }

    /// Flush everything except the trailing `margin` chars, the longest
    /// suffix that could still be a partial tag match.
    fn flush_beyond_margin(&mut self, margin: usize) -> Option<String> {
        let total = self.buffer.chars().count();
        if total <= margin {
            return None;
        }
        let keep_from = self
            .buffer
            .char_indices()
            .nth(total - margin)
            .map(|(i, _)| i)?;
        if keep_from == 0 {
            return None;
        }
        let flushed: String = self.buffer.drain(..keep_from).collect();
        Some(flushed)
    }
}

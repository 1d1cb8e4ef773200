//! Rendering of a [`Document`] into Telegram HTML messages.
//!
//! Every returned chunk is well-formed on its own: a span split across two
//! messages is closed at the end of the first and reopened in the second.

use super::html::{Block, Document, Span, Style};

const SEPARATOR: &str = "\n\n";
const QUOTE: (&str, &str) = ("<blockquote>", "</blockquote>");

/// Smallest amount of text a styled span must be able to carry per chunk
/// before its markup is dropped.
const MIN_SPAN_TEXT: usize = 16;

/// Length as Telegram counts it (UTF-16 code units).
pub fn telegram_len(text: &str) -> usize {
    text.encode_utf16().count()
}

/// Escape text for Telegram's HTML parse mode.
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(ch),
        }
    }
    out
}

fn escaped_len(ch: char) -> usize {
    match ch {
        '&' => 5,
        '<' | '>' => 4,
        _ => ch.len_utf16(),
    }
}

fn open_tags(style: &Style) -> String {
    if style.pre {
        return "<pre>".to_string();
    }
    if style.code {
        return "<code>".to_string();
    }
    let mut tags = String::new();
    if let Some(href) = &style.link {
        tags.push_str(&format!(
            "<a href=\"{}\">",
            escape_html(href).replace('"', "&quot;")
        ));
    }
    if style.bold {
        tags.push_str("<b>");
    }
    if style.italic {
        tags.push_str("<i>");
    }
    if style.underline {
        tags.push_str("<u>");
    }
    if style.strike {
        tags.push_str("<s>");
    }
    if style.spoiler {
        tags.push_str("<tg-spoiler>");
    }
    tags
}

fn close_tags(style: &Style) -> String {
    if style.pre {
        return "</pre>".to_string();
    }
    if style.code {
        return "</code>".to_string();
    }
    let mut tags = String::new();
    if style.spoiler {
        tags.push_str("</tg-spoiler>");
    }
    if style.strike {
        tags.push_str("</s>");
    }
    if style.underline {
        tags.push_str("</u>");
    }
    if style.italic {
        tags.push_str("</i>");
    }
    if style.bold {
        tags.push_str("</b>");
    }
    if style.link.is_some() {
        tags.push_str("</a>");
    }
    tags
}

fn markup_len(style: &Style) -> usize {
    telegram_len(&open_tags(style)) + telegram_len(&close_tags(style))
}

fn render_span(text: &str, style: &Style) -> String {
    format!("{}{}{}", open_tags(style), escape_html(text), close_tags(style))
}

/// Render a document as a sequence of messages, none longer than `limit`.
pub fn render_document(doc: &Document, limit: usize) -> Vec<String> {
    let mut chunker = Chunker::new(limit);
    for block in &doc.blocks {
        chunker.push_block(block);
    }
    chunker.finish()
}

/// Render a document into a single message if it fits within `limit`.
pub fn render_single(doc: &Document, limit: usize) -> Option<String> {
    let mut chunks = render_document(doc, limit);
    if chunks.len() == 1 {
        chunks.pop()
    } else {
        None
    }
}

/// Longest prefix of `text` whose escaped form fits in `budget`, cut after
/// the last whitespace when there is one. Returns `(head, tail, clean)`
/// where `clean` is false when a word had to be cut.
fn take_prefix(text: &str, budget: usize) -> (&str, &str, bool) {
    let mut used = 0;
    let mut last_break = 0;
    for (idx, ch) in text.char_indices() {
        used += escaped_len(ch);
        if used > budget {
            if last_break > 0 {
                let (head, tail) = text.split_at(last_break);
                return (head, tail, true);
            }
            let (head, tail) = text.split_at(idx);
            return (head, tail, false);
        }
        if ch.is_whitespace() {
            last_break = idx + ch.len_utf8();
        }
    }
    (text, "", true)
}

struct Chunker {
    limit: usize,
    chunks: Vec<String>,
    buf: String,
    len: usize,
    has_content: bool,
    wrapper: Option<(&'static str, &'static str)>,
    /// The wrapper's opening tag is already in `buf`. It is written with the
    /// first span of each chunk so no chunk carries an empty wrapper.
    wrapper_open: bool,
}

impl Chunker {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            chunks: Vec::new(),
            buf: String::new(),
            len: 0,
            has_content: false,
            wrapper: None,
            wrapper_open: false,
        }
    }

    fn wrapper_lens(&self) -> (usize, usize) {
        self.wrapper
            .map(|(open, close)| (telegram_len(open), telegram_len(close)))
            .unwrap_or((0, 0))
    }

    /// Space left for span markup in the current chunk.
    fn room(&self) -> usize {
        let (open, close) = self.wrapper_lens();
        let pending = if self.wrapper_open { 0 } else { open };
        self.limit.saturating_sub(self.len + pending + close)
    }

    /// Space a freshly started chunk offers inside the current block.
    fn fresh_room(&self) -> usize {
        let (open, close) = self.wrapper_lens();
        self.limit.saturating_sub(open + close)
    }

    fn append(&mut self, text: &str) {
        self.buf.push_str(text);
        self.len += telegram_len(text);
    }

    /// Append rendered span markup, opening the wrapper first if needed.
    fn append_span(&mut self, rendered: &str) {
        if let (Some((open, _)), false) = (self.wrapper, self.wrapper_open) {
            self.append(open);
            self.wrapper_open = true;
        }
        self.append(rendered);
        self.has_content = true;
    }

    fn close_wrapper(&mut self) {
        if let (Some((_, close)), true) = (self.wrapper, self.wrapper_open) {
            self.append(close);
        }
        self.wrapper_open = false;
    }

    fn push_chunk(&mut self) {
        let chunk = self.buf.trim();
        if self.has_content && !chunk.is_empty() {
            self.chunks.push(chunk.to_string());
        }
        self.buf.clear();
        self.len = 0;
        self.has_content = false;
    }

    /// Close the current chunk in the middle of a block and start another.
    fn break_chunk(&mut self) {
        self.close_wrapper();
        self.push_chunk();
    }

    fn push_block(&mut self, block: &Block) {
        if block.spans.is_empty() {
            return;
        }
        let wrapper = if block.quote { Some(QUOTE) } else { None };
        let wrapper_len = wrapper
            .map(|(open, close)| telegram_len(open) + telegram_len(close))
            .unwrap_or(0);

        if self.has_content {
            if self.len + telegram_len(SEPARATOR) + wrapper_len + 1 > self.limit {
                self.push_chunk();
            } else {
                self.append(SEPARATOR);
            }
        }

        self.wrapper = wrapper;
        self.wrapper_open = false;
        for span in &block.spans {
            self.push_span(span);
        }
        self.close_wrapper();
        self.wrapper = None;
    }

    fn effective_style(&self, style: &Style) -> Style {
        let fresh = self.fresh_room();
        if markup_len(style) + MIN_SPAN_TEXT <= fresh {
            return style.clone();
        }
        let mut reduced = style.clone();
        reduced.link = None;
        if markup_len(&reduced) + MIN_SPAN_TEXT <= fresh {
            return reduced;
        }
        Style::default()
    }

    fn push_span(&mut self, span: &Span) {
        if span.text.is_empty() {
            return;
        }
        let style = self.effective_style(&span.style);
        let rendered = render_span(&span.text, &style);
        let rendered_len = telegram_len(&rendered);

        if rendered_len <= self.room() {
            self.append_span(&rendered);
            return;
        }
        if self.has_content && rendered_len <= self.fresh_room() {
            self.break_chunk();
            self.append_span(&rendered);
            return;
        }

        let markup = markup_len(&style);
        let mut rest = span.text.as_str();
        while !rest.is_empty() {
            let budget = self.room().saturating_sub(markup);
            let (mut head, mut tail, clean) = take_prefix(rest, budget);
            if head.is_empty() || !clean {
                // Start a fresh chunk rather than cutting a word short.
                if self.has_content {
                    self.break_chunk();
                    continue;
                }
            }
            if head.is_empty() {
                // Nothing fits even in an empty chunk; emit one character.
                let end = rest
                    .char_indices()
                    .nth(1)
                    .map_or(rest.len(), |(idx, _)| idx);
                (head, tail) = rest.split_at(end);
            }
            self.append_span(&render_span(head, &style));
            rest = tail;
        }
    }

    fn finish(mut self) -> Vec<String> {
        self.push_chunk();
        self.chunks
    }
}

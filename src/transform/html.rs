//! Parser for the HTML subset Mastodon emits in status bodies.
//!
//! The output is a flat [`Document`]: paragraphs become blocks and inline
//! markup becomes styled spans. Anything Telegram cannot show (images,
//! classes, unknown tags) is reduced to its text.

use std::sync::LazyLock;

use regex::Regex;

static ATTR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"([A-Za-z_:][-A-Za-z0-9_:.]*)\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'>]+))"#)
        .expect("valid attribute regex")
});

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Style {
    pub bold: bool,
    pub italic: bool,
    pub underline: bool,
    pub strike: bool,
    pub spoiler: bool,
    pub code: bool,
    pub pre: bool,
    pub link: Option<String>,
}

impl Style {
    pub fn bold() -> Self {
        Self {
            bold: true,
            ..Self::default()
        }
    }

    pub fn link(href: impl Into<String>) -> Self {
        Self {
            link: Some(href.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Span {
    pub text: String,
    pub style: Style,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Block {
    pub spans: Vec<Span>,
    pub quote: bool,
}

impl Block {
    pub fn plain(text: impl Into<String>) -> Self {
        let mut block = Self::default();
        block.push(&text.into(), Style::default());
        block
    }

    /// Append text, merging with the previous span when the style matches.
    pub fn push(&mut self, text: &str, style: Style) {
        if text.is_empty() {
            return;
        }
        if let Some(last) = self.spans.last_mut() {
            if last.style == style {
                last.text.push_str(text);
                return;
            }
        }
        self.spans.push(Span {
            text: text.to_string(),
            style,
        });
    }

    pub fn is_blank(&self) -> bool {
        self.spans.iter().all(|s| s.text.trim().is_empty())
    }

    fn ends_with_whitespace(&self) -> bool {
        self.spans
            .last()
            .and_then(|s| s.text.chars().last())
            .map_or(true, char::is_whitespace)
    }

    fn trim_end(&mut self) {
        while let Some(last) = self.spans.last_mut() {
            if last.style.pre {
                break;
            }
            let trimmed = last.text.trim_end().len();
            last.text.truncate(trimmed);
            if last.text.is_empty() {
                self.spans.pop();
            } else {
                break;
            }
        }
    }

    #[cfg(test)]
    pub fn plain_text(&self) -> String {
        self.spans.iter().map(|s| s.text.as_str()).collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Document {
    pub blocks: Vec<Block>,
}

impl Document {
    pub fn push_block(&mut self, block: Block) {
        if !block.is_blank() {
            self.blocks.push(block);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    #[cfg(test)]
    pub fn plain_text(&self) -> String {
        self.blocks
            .iter()
            .map(Block::plain_text)
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// Parse a status body into a [`Document`].
pub fn parse_html(input: &str) -> Document {
    let mut parser = Parser::default();
    let mut rest = input;

    while let Some(lt) = rest.find('<') {
        parser.text(&rest[..lt]);
        let after = &rest[lt + 1..];

        if let Some(comment) = after.strip_prefix("!--") {
            rest = match comment.find("-->") {
                Some(end) => &comment[end + 3..],
                None => "",
            };
            continue;
        }

        match after.find('>') {
            Some(gt) => {
                parser.tag(&after[..gt]);
                rest = &after[gt + 1..];
            }
            None => {
                // Unterminated tag: keep it as text.
                parser.text(&rest[lt..]);
                rest = "";
            }
        }
    }
    parser.text(rest);
    parser.finish()
}

#[derive(Default)]
struct Parser {
    doc: Document,
    current: Block,
    styles: Vec<(String, Style)>,
    quote_depth: usize,
    lists: Vec<Option<u32>>,
}

impl Parser {
    fn style(&self) -> Style {
        self.styles
            .last()
            .map(|(_, s)| s.clone())
            .unwrap_or_default()
    }

    fn text(&mut self, raw: &str) {
        if raw.is_empty() {
            return;
        }
        let decoded = decode_entities(raw);
        let style = self.style();
        if style.pre {
            self.current.push(&decoded, style);
            return;
        }

        let mut collapsed = String::with_capacity(decoded.len());
        let mut last_ws = self.current.ends_with_whitespace();
        for ch in decoded.chars() {
            if ch.is_whitespace() && ch != '\u{a0}' {
                if !last_ws {
                    collapsed.push(' ');
                    last_ws = true;
                }
            } else {
                collapsed.push(ch);
                last_ws = false;
            }
        }
        self.current.push(&collapsed, style);
    }

    fn line_break(&mut self) {
        self.current.trim_end();
        let style = self.style();
        self.current.push("\n", style);
    }

    fn finish_block(&mut self) {
        let mut block = std::mem::take(&mut self.current);
        block.trim_end();
        block.quote = self.quote_depth > 0;
        self.doc.push_block(block);
    }

    fn open_inline(&mut self, name: &str, change: impl FnOnce(&mut Style)) {
        let mut style = self.style();
        change(&mut style);
        self.styles.push((name.to_string(), style));
    }

    fn close_inline(&mut self, name: &str) {
        if let Some(pos) = self.styles.iter().rposition(|(n, _)| n == name) {
            self.styles.truncate(pos);
        }
    }

    fn tag(&mut self, source: &str) {
        let source = source.trim();
        if let Some(name) = source.strip_prefix('/') {
            let name = name.trim().to_ascii_lowercase();
            self.close_tag(&name);
            return;
        }

        let source = source.trim_end_matches('/');
        let (name, attrs) = match source.find(char::is_whitespace) {
            Some(pos) => (&source[..pos], &source[pos..]),
            None => (source, ""),
        };
        let name = name.to_ascii_lowercase();
        self.open_tag(&name, attrs);
    }

    fn open_tag(&mut self, name: &str, attrs: &str) {
        match name {
            "p" | "div" => self.finish_block(),
            "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => {
                self.finish_block();
                self.open_inline(name, |s| s.bold = true);
            }
            "br" => self.line_break(),
            "a" => {
                let href = attribute(attrs, "href");
                let class = attribute(attrs, "class").unwrap_or_default();
                let hashtag = class.split_whitespace().any(|c| c == "hashtag");
                self.open_inline(name, |s| {
                    if let Some(href) = href {
                        if !hashtag && !s.code && !s.pre && is_web_link(&href) {
                            s.link = Some(href);
                        }
                    }
                });
            }
            "b" | "strong" => self.open_inline(name, |s| s.bold = true),
            "i" | "em" => self.open_inline(name, |s| s.italic = true),
            "u" | "ins" => self.open_inline(name, |s| s.underline = true),
            "s" | "del" | "strike" => self.open_inline(name, |s| s.strike = true),
            "code" => self.open_inline(name, |s| s.code = true),
            "pre" => {
                self.finish_block();
                self.open_inline(name, |s| s.pre = true);
            }
            "span" => self.open_inline(name, |_| {}),
            "blockquote" => {
                self.finish_block();
                self.quote_depth += 1;
            }
            "ul" => {
                self.finish_block();
                self.lists.push(None);
            }
            "ol" => {
                self.finish_block();
                let start = attribute(attrs, "start")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(1);
                self.lists.push(Some(start));
            }
            "li" => {
                if !self.current.is_blank() {
                    self.line_break();
                }
                let depth = self.lists.len().saturating_sub(1);
                let marker = match self.lists.last_mut() {
                    Some(Some(n)) => {
                        let marker = format!("{}. ", n);
                        *n += 1;
                        marker
                    }
                    _ => "• ".to_string(),
                };
                let indent = "  ".repeat(depth);
                self.current
                    .push(&format!("{}{}", indent, marker), Style::default());
            }
            _ => {}
        }
    }

    fn close_tag(&mut self, name: &str) {
        match name {
            "p" | "div" => self.finish_block(),
            "h1" | "h2" | "h3" | "h4" | "h5" | "h6" | "pre" => {
                self.close_inline(name);
                self.finish_block();
            }
            "blockquote" => {
                self.finish_block();
                self.quote_depth = self.quote_depth.saturating_sub(1);
            }
            "ul" | "ol" => {
                self.lists.pop();
                if self.lists.is_empty() {
                    self.finish_block();
                }
            }
            "li" => {}
            _ => self.close_inline(name),
        }
    }

    fn finish(mut self) -> Document {
        self.finish_block();
        self.doc
    }
}

fn is_web_link(href: &str) -> bool {
    href.starts_with("https://") || href.starts_with("http://")
}

/// Value of an attribute in a tag's attribute source, entities decoded.
fn attribute(attrs: &str, wanted: &str) -> Option<String> {
    ATTR_RE.captures_iter(attrs).find_map(|caps| {
        let name = caps.get(1)?.as_str();
        if !name.eq_ignore_ascii_case(wanted) {
            return None;
        }
        let value = caps
            .get(2)
            .or_else(|| caps.get(3))
            .or_else(|| caps.get(4))
            .map_or("", |m| m.as_str());
        Some(decode_entities(value))
    })
}

/// Decode HTML character references.
pub fn decode_entities(input: &str) -> String {
    if !input.contains('&') {
        return input.to_string();
    }

    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let tail = &rest[amp..];
        let decoded = tail
            .find(';')
            .filter(|&semi| semi <= 10)
            .and_then(|semi| decode_entity(&tail[1..semi]).map(|ch| (ch, semi)));
        match decoded {
            Some((ch, semi)) => {
                out.push(ch);
                rest = &tail[semi + 1..];
            }
            None => {
                out.push('&');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn decode_entity(name: &str) -> Option<char> {
    if let Some(num) = name.strip_prefix('#') {
        let code = match num.strip_prefix('x').or_else(|| num.strip_prefix('X')) {
            Some(hex) => u32::from_str_radix(hex, 16).ok()?,
            None => num.parse().ok()?,
        };
        return char::from_u32(code);
    }
    match name {
        "amp" => Some('&'),
        "lt" => Some('<'),
        "gt" => Some('>'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        "nbsp" => Some('\u{a0}'),
        "hellip" => Some('…'),
        "mdash" => Some('—'),
        "ndash" => Some('–'),
        _ => None,
    }
}

//! Paginated rich-text writer.
//!
//! A [`Writer`] composes HTML text and media into pages that each fit one
//! Telegram message. Open formatting tags are closed at the end of every page
//! and re-opened at the start of the next. Output is queued while composing and
//! handed to the [`Receiver`] on [`Writer::flush`].

mod markup;
pub mod media;
pub mod receiver;
pub mod tags;

use std::sync::Arc;

use tracing::warn;

pub use media::{MediaRef, ResolvedMedia};
pub use receiver::{Broadcast, BufferReceiver, Output, Receiver};
pub use tags::{AnchorFormatter, DefaultTagConverter, LinkFormatter, Tag, TagConverter};

use crate::{
    formatting::rune_len,
    messaging::payload::{MAX_CAPTION_SIZE, MAX_MESSAGE_SIZE},
    Result,
};

/// Room kept free on every page for link expansion.
pub const DEFAULT_PAGE_SIZE: usize = MAX_MESSAGE_SIZE - 200;

const PREFERRED_BREAKS: [char; 4] = ['\n', ' ', '\t', '\u{b}'];
const FALLBACK_BREAKS: [char; 4] = [',', '.', ':', ';'];
const BROKEN: &str = "BROKEN";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WriterConfig {
    /// Rune budget per page, tags included.
    pub page_size: usize,
    /// Pages (and media) per flush; anything past it is dropped and `overflown` is set.
    pub page_count: Option<usize>,
    pub max_caption_size: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            page_count: None,
            max_caption_size: MAX_CAPTION_SIZE,
        }
    }
}

struct PendingAnchor {
    href: String,
    text: String,
}

pub struct Writer {
    cfg: WriterConfig,
    receiver: Arc<dyn Receiver>,
    converter: Arc<dyn TagConverter>,
    anchors: Arc<dyn AnchorFormatter>,

    page: String,
    page_runes: usize,
    /// The page holds text beyond the re-opened tags.
    dirty: bool,

    stack: Vec<Tag>,
    prefix: String,
    prefix_runes: usize,
    suffix: String,
    suffix_runes: usize,

    anchor: Option<PendingAnchor>,
    /// Source tags opened by `markup`, and whether each one was pushed.
    markup_stack: Vec<(String, bool)>,

    emitted: usize,
    overflown: bool,
    queue: Vec<Output>,
}

impl Writer {
    pub fn new(receiver: Arc<dyn Receiver>) -> Self {
        Self {
            cfg: WriterConfig::default(),
            receiver,
            converter: Arc::new(DefaultTagConverter),
            anchors: Arc::new(LinkFormatter),
            page: String::new(),
            page_runes: 0,
            dirty: false,
            stack: Vec::new(),
            prefix: String::new(),
            prefix_runes: 0,
            suffix: String::new(),
            suffix_runes: 0,
            anchor: None,
            markup_stack: Vec::new(),
            emitted: 0,
            overflown: false,
            queue: Vec::new(),
        }
    }

    pub fn with_config(mut self, cfg: WriterConfig) -> Self {
        self.cfg = cfg;
        self
    }

    pub fn with_converter(mut self, converter: Arc<dyn TagConverter>) -> Self {
        self.converter = converter;
        self
    }

    pub fn with_anchor_formatter(mut self, anchors: Arc<dyn AnchorFormatter>) -> Self {
        self.anchors = anchors;
        self
    }

    /// Output was dropped because `page_count` was exceeded. Sticky.
    pub fn overflown(&self) -> bool {
        self.overflown
    }

    /// Append without breaking.
    pub fn write(&mut self, text: &str) -> &mut Self {
        if let Some(anchor) = &mut self.anchor {
            anchor.text.push_str(text);
            return self;
        }
        self.append(text);
        self
    }

    /// Append, breaking pages at whitespace, then punctuation, then anywhere.
    pub fn write_breakable(&mut self, text: &str) -> &mut Self {
        if let Some(anchor) = &mut self.anchor {
            anchor.text.push_str(text);
            return self;
        }

        let mut rest = text;
        while !rest.is_empty() {
            let cap = self.capacity();
            if rune_len(rest) <= cap {
                self.append(rest);
                break;
            }
            if cap == 0 {
                if self.dirty {
                    self.break_page();
                    continue;
                }
                warn!(
                    page_size = self.cfg.page_size,
                    "Open tags leave no room on the page, dropping text"
                );
                break;
            }

            let (head, tail) = split_at_break(rest, cap);
            self.append(head);
            self.break_page();
            rest = tail;
        }
        self
    }

    /// Append as a whole, on a fresh page if needed.
    pub fn write_unbreakable(&mut self, text: &str) -> &mut Self {
        if let Some(anchor) = &mut self.anchor {
            anchor.text.push_str(text);
            return self;
        }

        let len = rune_len(text);
        if len > self.capacity() {
            self.break_page();
        }
        if len > self.capacity() {
            warn!(len, "Unbreakable text does not fit an empty page");
            return self.write_breakable(BROKEN);
        }
        self.append(text);
        self
    }

    /// Open a tag. An anchor collects its body until the matching `pop_tag`;
    /// tags pushed inside an anchor are ignored.
    pub fn push_tag(&mut self, tag: Tag) -> &mut Self {
        if self.anchor.is_some() {
            return self;
        }
        if let Tag::Anchor { href } = tag {
            self.anchor = Some(PendingAnchor {
                href,
                text: String::new(),
            });
            return self;
        }

        let open = tag.open();
        if rune_len(&open) + rune_len(tag.close()) > self.capacity() {
            self.break_page();
        }
        self.page.push_str(&open);
        self.page_runes += rune_len(&open);
        self.stack.push(tag);
        self.rebuild_seams();
        self
    }

    /// Close the innermost tag, or the pending anchor.
    pub fn pop_tag(&mut self) -> &mut Self {
        if let Some(anchor) = self.anchor.take() {
            let link = self.anchors.format(&anchor.text, &anchor.href);
            return self.write_unbreakable(&link);
        }

        let Some(tag) = self.stack.pop() else {
            return self;
        };
        let open = tag.open();
        if self.page.ends_with(&open) {
            // Nothing was written inside; drop the tag instead of emitting `<b></b>`.
            self.page.truncate(self.page.len() - open.len());
            self.page_runes -= rune_len(&open);
        } else {
            self.page.push_str(tag.close());
            self.page_runes += rune_len(tag.close());
        }
        self.rebuild_seams();
        self
    }

    /// Attach media. With `collapsible`, text written so far becomes the caption
    /// when nothing was emitted yet and it fits; otherwise the page is broken first
    /// and `anchor` alone is the caption.
    pub fn media(&mut self, media: MediaRef, anchor: Option<&str>, collapsible: bool) -> &mut Self {
        let anchor = anchor.filter(|a| !a.is_empty());

        if collapsible && self.emitted == 0 && self.dirty {
            let mut caption = format!("{}{}", self.page, self.suffix);
            if let Some(anchor) = anchor {
                caption.push('\n');
                caption.push_str(anchor);
            }
            if rune_len(&caption) <= self.cfg.max_caption_size {
                self.reset_page();
                self.emit(Output::Media {
                    media,
                    caption: Some(caption),
                });
                return self;
            }
        }

        self.break_page();
        self.emit(Output::Media {
            media,
            caption: anchor.map(str::to_string),
        });
        self
    }

    /// Close all tags, emit the last page and deliver everything queued.
    pub async fn flush(&mut self) -> Result<()> {
        if self.anchor.is_some() {
            self.pop_tag();
        }
        while !self.stack.is_empty() {
            self.pop_tag();
        }
        self.markup_stack.clear();
        self.break_page();

        self.page.clear();
        self.page_runes = 0;
        self.dirty = false;
        self.emitted = 0;

        for output in std::mem::take(&mut self.queue) {
            match output {
                Output::Text(text) => self.receiver.send_text(&text).await?,
                Output::Media { media, caption } => {
                    self.receiver
                        .send_media(&media, caption.as_deref())
                        .await?
                }
            }
        }
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.cfg
            .page_size
            .saturating_sub(self.page_runes + self.suffix_runes)
    }

    fn append(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        self.page.push_str(text);
        self.page_runes += rune_len(text);
        self.dirty = true;
    }

    fn break_page(&mut self) {
        if !self.dirty {
            return;
        }
        let mut text = std::mem::take(&mut self.page);
        text.push_str(&self.suffix);
        self.reset_page();
        self.emit(Output::Text(text));
    }

    fn reset_page(&mut self) {
        self.page.clone_from(&self.prefix);
        self.page_runes = self.prefix_runes;
        self.dirty = false;
    }

    fn emit(&mut self, output: Output) {
        if let Some(max) = self.cfg.page_count {
            if self.emitted >= max {
                if !self.overflown {
                    warn!(page_count = max, "Page limit reached, dropping output");
                }
                self.overflown = true;
                return;
            }
        }
        self.emitted += 1;
        self.queue.push(output);
    }

    fn rebuild_seams(&mut self) {
        self.prefix = self.stack.iter().map(Tag::open).collect();
        self.suffix = self.stack.iter().rev().map(Tag::close).collect();
        self.prefix_runes = rune_len(&self.prefix);
        self.suffix_runes = rune_len(&self.suffix);
    }
}

/// Split `s` (longer than `cap` runes) so the head fits in `cap` runes.
fn split_at_break(s: &str, cap: usize) -> (&str, &str) {
    let mut preferred = None;
    let mut fallback = None;
    let mut hard = s.len();

    for (i, (pos, ch)) in s.char_indices().enumerate() {
        if i > cap {
            break;
        }
        if i == cap {
            hard = pos;
        }
        if PREFERRED_BREAKS.contains(&ch) {
            preferred = Some((pos, ch.len_utf8()));
        } else if i < cap && FALLBACK_BREAKS.contains(&ch) {
            fallback = Some(pos + ch.len_utf8());
        }
    }

    if let Some((pos, len)) = preferred {
        return (&s[..pos], &s[pos + len..]);
    }
    if let Some(end) = fallback {
        return s.split_at(end);
    }
    s.split_at(entity_safe_cut(s, hard))
}

/// Move a hard cut back so it does not land inside `&name;`.
fn entity_safe_cut(s: &str, cut: usize) -> usize {
    let head = &s[..cut];
    let Some(amp) = head.rfind('&') else {
        return cut;
    };
    if amp == 0 || head[amp..].contains(';') {
        return cut;
    }
    match s[amp..].find(';') {
        Some(semi) if semi <= 10 => amp,
        _ => cut,
    }
}

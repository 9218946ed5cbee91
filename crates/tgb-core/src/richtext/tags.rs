use crate::formatting::{escape_html, HtmlTag};

/// Formatting supported by Telegram's HTML parse mode.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Tag {
    Bold,
    Italic,
    Underline,
    Strikethrough,
    Code,
    Pre,
    Anchor { href: String },
}

impl Tag {
    pub fn open(&self) -> String {
        match self {
            Tag::Bold => "<b>".to_string(),
            Tag::Italic => "<i>".to_string(),
            Tag::Underline => "<u>".to_string(),
            Tag::Strikethrough => "<s>".to_string(),
            Tag::Code => "<code>".to_string(),
            Tag::Pre => "<pre>".to_string(),
            Tag::Anchor { href } => format!("<a href=\"{}\">", escape_html(href)),
        }
    }

    pub fn close(&self) -> &'static str {
        match self {
            Tag::Bold => "</b>",
            Tag::Italic => "</i>",
            Tag::Underline => "</u>",
            Tag::Strikethrough => "</s>",
            Tag::Code => "</code>",
            Tag::Pre => "</pre>",
            Tag::Anchor { .. } => "</a>",
        }
    }
}

/// Maps a source markup tag onto a supported [`Tag`]. `None` drops the tag
/// but keeps its content.
pub trait TagConverter: Send + Sync {
    fn convert(&self, tag: &HtmlTag) -> Option<Tag>;
}

impl<F> TagConverter for F
where
    F: Fn(&HtmlTag) -> Option<Tag> + Send + Sync,
{
    fn convert(&self, tag: &HtmlTag) -> Option<Tag> {
        self(tag)
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultTagConverter;

impl TagConverter for DefaultTagConverter {
    fn convert(&self, tag: &HtmlTag) -> Option<Tag> {
        Some(match tag.name.as_str() {
            "strong" | "b" => Tag::Bold,
            "em" | "i" | "italic" => Tag::Italic,
            "u" | "ins" => Tag::Underline,
            "s" | "strike" | "del" => Tag::Strikethrough,
            "code" => Tag::Code,
            "pre" => Tag::Pre,
            "a" => Tag::Anchor {
                href: tag.attr("href").unwrap_or_default().to_string(),
            },
            _ => return None,
        })
    }
}

/// Renders a closed anchor. `text` is the escaped anchor body.
pub trait AnchorFormatter: Send + Sync {
    fn format(&self, text: &str, href: &str) -> String;
}

impl<F> AnchorFormatter for F
where
    F: Fn(&str, &str) -> String + Send + Sync,
{
    fn format(&self, text: &str, href: &str) -> String {
        self(text, href)
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct LinkFormatter;

impl AnchorFormatter for LinkFormatter {
    fn format(&self, text: &str, href: &str) -> String {
        let href = escape_html(href);
        if href.is_empty() {
            return text.to_string();
        }
        let text = if text.trim().is_empty() { href.as_str() } else { text };
        format!("<a href=\"{href}\">{text}</a>")
    }
}

//! HTML helpers for Telegram's HTML parse mode.
//!
//! The tokenizer is deliberately permissive: anything between `<` and the next
//! `>` is a tag, a `<` with no closing `>` is text.

use std::sync::OnceLock;

use regex::Regex;

/// Escape HTML special characters for Telegram HTML parse mode.
pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Decode named and numeric character references. Unknown references are kept verbatim.
pub fn decode_entities(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        rest = &rest[amp..];

        let decoded = rest
            .find(';')
            .filter(|&end| end <= 10)
            .and_then(|end| decode_entity(&rest[1..end]).map(|ch| (ch, end)));
        match decoded {
            Some((ch, end)) => {
                out.push(ch);
                rest = &rest[end + 1..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }

    out.push_str(rest);
    out
}

fn decode_entity(name: &str) -> Option<char> {
    if let Some(num) = name.strip_prefix('#') {
        let code = match num.strip_prefix(['x', 'X']) {
            Some(hex) => u32::from_str_radix(hex, 16).ok()?,
            None => num.parse::<u32>().ok()?,
        };
        return char::from_u32(code);
    }
    Some(match name {
        "amp" => '&',
        "lt" => '<',
        "gt" => '>',
        "quot" => '"',
        "apos" => '\'',
        "nbsp" => '\u{a0}',
        "mdash" => '\u{2014}',
        "ndash" => '\u{2013}',
        "hellip" => '\u{2026}',
        "laquo" => '\u{ab}',
        "raquo" => '\u{bb}',
        "copy" => '\u{a9}',
        _ => return None,
    })
}

/// Length in Unicode scalar values, which is how Telegram measures messages.
pub fn rune_len(s: &str) -> usize {
    s.chars().count()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HtmlToken<'a> {
    Text(&'a str),
    Tag(&'a str),
}

pub fn tokenize_html(mut s: &str) -> Vec<HtmlToken<'_>> {
    let mut out = Vec::new();
    while !s.is_empty() {
        let Some(start) = s.find('<') else {
            out.push(HtmlToken::Text(s));
            break;
        };
        if start > 0 {
            out.push(HtmlToken::Text(&s[..start]));
            s = &s[start..];
        }

        // Now s starts with '<'. Find matching '>' (best-effort).
        let Some(end) = s.find('>') else {
            out.push(HtmlToken::Text(s));
            break;
        };
        out.push(HtmlToken::Tag(&s[..=end]));
        s = &s[end + 1..];
    }
    out
}

/// A parsed markup tag.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HtmlTag {
    /// Lowercased tag name.
    pub name: String,
    pub closing: bool,
    pub self_closing: bool,
    /// Attributes in source order, names lowercased, values entity-decoded.
    pub attrs: Vec<(String, String)>,
}

impl HtmlTag {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Parse a `<...>` token. Comments, doctypes and nameless tags yield `None`.
pub fn parse_tag(raw: &str) -> Option<HtmlTag> {
    let inner = raw.trim().strip_prefix('<')?.strip_suffix('>')?;

    let (closing, inner) = match inner.strip_prefix('/') {
        Some(rest) => (true, rest),
        None => (false, inner),
    };
    let (self_closing, inner) = match inner.trim_end().strip_suffix('/') {
        Some(rest) => (true, rest),
        None => (false, inner),
    };

    let name = parse_tag_name(inner);
    if name.is_empty() {
        return None;
    }

    let attrs = attr_re()
        .captures_iter(&inner[name.len()..])
        .map(|c| {
            let key = c[1].to_ascii_lowercase();
            let value = c
                .get(2)
                .or_else(|| c.get(3))
                .or_else(|| c.get(4))
                .map(|m| decode_entities(m.as_str()))
                .unwrap_or_default();
            (key, value)
        })
        .collect();

    Some(HtmlTag {
        name,
        closing,
        self_closing,
        attrs,
    })
}

fn parse_tag_name(after_lt: &str) -> String {
    let mut out = String::new();
    for ch in after_lt.chars() {
        if ch.is_ascii_alphanumeric() || ch == '-' {
            out.push(ch.to_ascii_lowercase());
            continue;
        }
        break;
    }
    out
}

fn attr_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"([A-Za-z_:][-A-Za-z0-9_:.]*)(?:\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'>]+)))?"#)
            .expect("valid regex")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_then_decode_is_identity() {
        let raw = r#"a < b && "c" > d"#;
        assert_eq!(decode_entities(&escape_html(raw)), raw);
    }

    #[test]
    fn decodes_named_and_numeric_references() {
        assert_eq!(decode_entities("&lt;b&gt; &#65;&#x42; &hellip;"), "<b> AB \u{2026}");
        assert_eq!(decode_entities("fish & chips &bogus; &"), "fish & chips &bogus; &");
    }

    #[test]
    fn tokenizer_is_permissive() {
        assert_eq!(
            tokenize_html("a<b>c</b> 1 < 2"),
            vec![
                HtmlToken::Text("a"),
                HtmlToken::Tag("<b>"),
                HtmlToken::Text("c"),
                HtmlToken::Tag("</b>"),
                HtmlToken::Text(" 1 "),
                HtmlToken::Text("< 2"),
            ]
        );
    }

    #[test]
    fn parses_tags_and_attributes() {
        let tag = parse_tag(r#"<A HREF="https://x.org/?a=1&amp;b=2" target=_blank>"#).unwrap();
        assert_eq!(tag.name, "a");
        assert!(!tag.closing);
        assert_eq!(tag.attr("href"), Some("https://x.org/?a=1&b=2"));
        assert_eq!(tag.attr("target"), Some("_blank"));

        let close = parse_tag("</Strong>").unwrap();
        assert_eq!(close.name, "strong");
        assert!(close.closing);

        let br = parse_tag("<br/>").unwrap();
        assert_eq!(br.name, "br");
        assert!(br.self_closing);

        assert!(parse_tag("<!-- x -->").is_none());
        assert!(parse_tag("< >").is_none());
    }
}

use crate::formatting::{decode_entities, escape_html, parse_tag, tokenize_html, HtmlToken};

use super::Writer;

/// Elements that never have a closing tag.
const VOID_ELEMENTS: [&str; 8] = ["area", "col", "hr", "img", "input", "link", "meta", "wbr"];

impl Writer {
    /// Write an HTML fragment. Supported tags go through the tag converter,
    /// everything else is dropped while its text is kept.
    pub fn markup(&mut self, html: &str) -> &mut Self {
        for token in tokenize_html(html) {
            match token {
                HtmlToken::Text(text) => {
                    self.write_breakable(&escape_html(&decode_entities(text)));
                }
                HtmlToken::Tag(raw) => self.markup_tag(raw),
            }
        }
        self
    }

    fn markup_tag(&mut self, raw: &str) {
        let Some(tag) = parse_tag(raw) else {
            return;
        };

        if tag.name == "br" {
            self.write_breakable("\n");
            return;
        }

        if tag.closing {
            // Unwind to the matching start tag; stray end tags are ignored.
            let Some(pos) = self
                .markup_stack
                .iter()
                .rposition(|(name, _)| *name == tag.name)
            else {
                return;
            };
            let closed: Vec<bool> = self
                .markup_stack
                .drain(pos..)
                .map(|(_, pushed)| pushed)
                .collect();
            for pushed in closed.into_iter().rev() {
                if pushed {
                    self.pop_tag();
                }
            }
            return;
        }

        if tag.self_closing || VOID_ELEMENTS.contains(&tag.name.as_str()) {
            return;
        }

        let converted = if self.anchor.is_some() {
            None
        } else {
            self.converter.convert(&tag)
        };
        let pushed = converted.is_some();
        if let Some(t) = converted {
            self.push_tag(t);
        }
        self.markup_stack.push((tag.name, pushed));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::richtext::{BufferReceiver, Tag, Writer, WriterConfig};

    fn writer(page_size: usize) -> (Writer, Arc<BufferReceiver>) {
        let buf = Arc::new(BufferReceiver::new());
        let w = Writer::new(buf.clone()).with_config(WriterConfig {
            page_size,
            ..WriterConfig::default()
        });
        (w, buf)
    }

    #[tokio::test]
    async fn converts_breaks_and_paginates_markup() {
        let (mut w, buf) = writer(30);
        w.markup(
            r#"<strong>Hello</strong> <em>world</em><br>x &amp; y <a href="https://e.x">link</a>"#,
        );
        w.flush().await.unwrap();
        assert_eq!(
            buf.pages(),
            vec![
                "<b>Hello</b> <i>world</i>\nx",
                "&amp; y ",
                r#"<a href="https://e.x">link</a>"#,
            ]
        );
    }

    #[tokio::test]
    async fn thread_header_reopens_tags_and_breaks_oversized_links() {
        let (mut w, buf) = writer(45);
        w.markup(concat!(
            "<strong>Музыкальный webm mp4 тред</strong><br>",
            "<em>в треде: новые релизы, старые хиты</em> ",
            r#"<a href="https://example.com/a/very/long/link/that/cannot/fit">ссылка</a> конец"#,
        ));
        w.flush().await.unwrap();
        assert_eq!(
            buf.pages(),
            vec![
                "<b>Музыкальный webm mp4 тред</b>\n<i>в</i>",
                "<i>треде: новые релизы, старые хиты</i> ",
                "BROKEN конец",
            ]
        );
    }

    #[tokio::test]
    async fn unknown_tags_stay_balanced() {
        let (mut w, buf) = writer(100);
        w.markup("<div><b>bold <span>in span</span> still</div> plain</b> <p>p</p>");
        w.flush().await.unwrap();
        assert_eq!(
            buf.pages(),
            vec!["<b>bold in span still</b> plain p"]
        );
    }

    #[tokio::test]
    async fn tags_inside_anchors_are_flattened() {
        let (mut w, buf) = writer(100);
        w.markup(r#"<a href="/x"><b>bo</b>ld</a> <img src="y"/><hr>end"#);
        w.flush().await.unwrap();
        assert_eq!(buf.pages(), vec![r#"<a href="/x">bold</a> end"#]);
    }

    #[tokio::test]
    async fn custom_converter_applies() {
        let buf = Arc::new(BufferReceiver::new());
        let mut w = Writer::new(buf.clone()).with_converter(Arc::new(
            |tag: &crate::formatting::HtmlTag| (tag.name == "mark").then_some(Tag::Underline),
        ));
        w.markup("<b>no</b> <mark>yes</mark>");
        w.flush().await.unwrap();
        assert_eq!(buf.pages(), vec!["no <u>yes</u>"]);
    }
}

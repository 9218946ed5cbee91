//! Command argument tokenization.
//!
//! Arguments are split on whitespace. A field that starts with `"` runs until the
//! matching close quote, and `""` inside it stands for a literal quote. Quotes in
//! the middle of a bare field are literal. Empty fields are dropped.

pub fn split_args(s: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut cur = String::new();
    let mut chars = s.chars().peekable();

    let mut in_quotes = false;
    let mut field_start = true;

    while let Some(ch) = chars.next() {
        match ch {
            '"' if in_quotes => {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    cur.push('"');
                } else {
                    in_quotes = false;
                }
            }
            '"' if field_start => {
                in_quotes = true;
                field_start = false;
            }
            c if c.is_whitespace() && !in_quotes => {
                if !cur.is_empty() {
                    out.push(std::mem::take(&mut cur));
                }
                field_start = true;
            }
            other => {
                cur.push(other);
                field_start = false;
            }
        }
    }

    if !cur.is_empty() {
        out.push(cur);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_whitespace_and_drops_empty_fields() {
        assert_eq!(split_args("  add  feed\tnow "), vec!["add", "feed", "now"]);
        assert!(split_args("   ").is_empty());
    }

    #[test]
    fn quoted_fields_group_and_escape() {
        assert_eq!(
            split_args(r#"rename "my feed" "say ""hi""" x"#),
            vec!["rename", "my feed", r#"say "hi""#, "x"]
        );
    }

    #[test]
    fn bare_quotes_are_literal_and_empty_quotes_vanish() {
        assert_eq!(split_args(r#"a"b "" c"#), vec![r#"a"b"#, "c"]);
    }
}

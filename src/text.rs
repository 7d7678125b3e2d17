//! Internal module for turning HTML mail bodies into searchable text.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::borrow::Cow;

static HIDDEN_BLOCKS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<(script|style|head)\b[^>]*>.*?</(script|style|head)\s*>").expect("valid regex")
});

static BLOCK_TAGS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)<\s*(br|/p|p|/div|div|/tr|tr|li|/li|h[1-6]|/h[1-6]|/table|hr)\b[^>]*>")
        .expect("valid regex")
});

static ANY_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<!--.*?-->|<[^>]*>").expect("valid regex"));

static ENTITY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"&(#[0-9]{1,7}|#[xX][0-9a-fA-F]{1,6}|[a-zA-Z]{2,8});").expect("valid regex")
});

static INLINE_SPACE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[ \t\u{a0}]+").expect("valid regex"));

/// Converts an HTML body into plain text.
///
/// Script, style and head blocks are dropped, block-level tags become line
/// breaks, remaining tags are removed and entities decoded. Runs of blank
/// lines collapse into one.
pub(crate) fn html_to_text(html: &str) -> String {
    let text = HIDDEN_BLOCKS.replace_all(html, " ");
    let text = BLOCK_TAGS.replace_all(&text, "\n");
    let text = ANY_TAG.replace_all(&text, " ");
    let text = decode_entities(&text);
    let text = INLINE_SPACE.replace_all(&text, " ");

    let mut cleaned = String::with_capacity(text.len());
    let mut prev_was_blank = true;
    for line in text.lines().map(str::trim) {
        if line.is_empty() {
            if !prev_was_blank {
                cleaned.push('\n');
                prev_was_blank = true;
            }
        } else {
            cleaned.push_str(line);
            cleaned.push('\n');
            prev_was_blank = false;
        }
    }

    cleaned.trim().to_string()
}

/// Decodes named and numeric character references in a single pass.
pub(crate) fn decode_entities(text: &str) -> Cow<'_, str> {
    if !text.contains('&') {
        return Cow::Borrowed(text);
    }

    ENTITY.replace_all(text, |caps: &Captures<'_>| {
        let entity = &caps[1];
        let decoded = if let Some(hex) = entity
            .strip_prefix("#x")
            .or_else(|| entity.strip_prefix("#X"))
        {
            u32::from_str_radix(hex, 16).ok().and_then(char::from_u32)
        } else if let Some(dec) = entity.strip_prefix('#') {
            dec.parse::<u32>().ok().and_then(char::from_u32)
        } else {
            named_entity(entity)
        };

        decoded.map_or_else(|| caps[0].to_string(), |c| c.to_string())
    })
}

fn named_entity(name: &str) -> Option<char> {
    let c = match name {
        "amp" => '&',
        "lt" => '<',
        "gt" => '>',
        "quot" => '"',
        "apos" => '\'',
        "nbsp" => ' ',
        "copy" => '©',
        "reg" => '®',
        "trade" => '™',
        "hellip" => '…',
        "mdash" => '—',
        "ndash" => '–',
        "laquo" => '«',
        "raquo" => '»',
        "middot" => '·',
        "euro" => '€',
        _ => return None,
    };
    Some(c)
}

/// Returns the text body, or text derived from the HTML body when the text body is blank.
pub(crate) fn readable_body<'a>(text_body: &'a str, html_body: Option<&str>) -> Cow<'a, str> {
    match html_body {
        Some(html) if text_body.trim().is_empty() => Cow::Owned(html_to_text(html)),
        _ => Cow::Borrowed(text_body),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_html_to_text_strips_tags_and_blocks() {
        let html = r"<html><head><title>t</title><style>p{color:red}</style></head>
            <body><p>Your code is <b>482931</b></p><script>var x = 1;</script>
            <div>Thanks</div></body></html>";
        let text = html_to_text(html);
        assert!(text.contains("Your code is 482931"));
        assert!(text.contains("Thanks"));
        assert!(!text.contains("color"));
        assert!(!text.contains("var x"));
        assert!(!text.contains('<'));
    }

    #[test]
    fn test_html_to_text_block_breaks() {
        let text = html_to_text("<p>one</p><p>two</p>line<br>three");
        assert_eq!(text, "one\n\ntwo\nline\nthree");
    }

    #[test]
    fn test_decode_entities() {
        assert_eq!(decode_entities("a &amp; b"), "a & b");
        assert_eq!(decode_entities("&#52;&#x32;"), "42");
        assert_eq!(decode_entities("&amp;lt;"), "&lt;");
        assert_eq!(decode_entities("&bogus;"), "&bogus;");
        assert!(matches!(decode_entities("plain"), Cow::Borrowed(_)));
    }

    #[test]
    fn test_readable_body_prefers_text() {
        assert_eq!(readable_body("text", Some("<p>html</p>")), "text");
        assert_eq!(readable_body("  ", Some("<p>html</p>")), "html");
        assert_eq!(readable_body("", None), "");
    }
}

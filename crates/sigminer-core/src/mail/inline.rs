//! Inline image references in HTML bodies

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

static CID_IMAGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)<img\b[^>]*?\bsrc\s*=\s*["']?cid:([^"'\s>]+)"#).expect("valid cid regex")
});

/// Content-ids referenced by `<img src="cid:...">` elements, in document
/// order and without duplicates
pub fn extract_content_ids(html: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    CID_IMAGE
        .captures_iter(html)
        .filter_map(|caps| caps.get(1))
        .map(|m| normalize_content_id(m.as_str()))
        .filter(|cid| !cid.is_empty() && seen.insert(cid.clone()))
        .collect()
}

/// Content-ids come with or without angle brackets depending on the source
pub fn normalize_content_id(raw: &str) -> String {
    raw.trim()
        .trim_start_matches('<')
        .trim_end_matches('>')
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_content_ids() {
        let html = r#"
            <p>Regards,</p>
            <img src="cid:image001.png@01DA1F2B.5C3E2F10" width="120">
            <IMG alt="logo" SRC='cid:logo'>
            <img src="https://example.com/pixel.gif">
            <img src="cid:image001.png@01DA1F2B.5C3E2F10">
        "#;
        assert_eq!(
            extract_content_ids(html),
            vec!["image001.png@01DA1F2B.5C3E2F10", "logo"]
        );
    }

    #[test]
    fn test_no_inline_images() {
        assert!(extract_content_ids("<p>No pictures here, cid:fake</p>").is_empty());
    }

    #[test]
    fn test_normalize_content_id() {
        assert_eq!(normalize_content_id("<logo@corp>"), "logo@corp");
        assert_eq!(normalize_content_id(" logo "), "logo");
    }
}

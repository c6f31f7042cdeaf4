//! Content extraction from fetched HTML.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use scraper::{ElementRef, Html, Node, Selector};
use sha2::{Digest, Sha256};
use url::Url;

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}").expect("valid regex")
});

static WHITESPACE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[ \t\r\f\v]+").expect("valid regex"));

/// Elements whose text never reaches the reader.
const HIDDEN_TAGS: &[&str] = &["script", "style", "noscript", "template", "svg", "head"];

/// Visible text of a document, one block per line.
pub fn extract_text(doc: &Html) -> String {
    let mut out = String::new();
    collect_text(doc.root_element(), &mut out);

    out.lines()
        .map(|line| WHITESPACE_RE.replace_all(line.trim(), " ").into_owned())
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn collect_text(el: ElementRef<'_>, out: &mut String) {
    if HIDDEN_TAGS.contains(&el.value().name()) {
        return;
    }
    for child in el.children() {
        match child.value() {
            Node::Text(text) => out.push_str(text),
            Node::Element(_) => {
                if let Some(child_el) = ElementRef::wrap(child) {
                    collect_text(child_el, out);
                    out.push('\n');
                }
            }
            _ => {}
        }
    }
}

/// E-mail addresses on `domain` or one of its subdomains, lowercased, in
/// first-seen order.
pub fn extract_emails(html: &str, domain: &str) -> Vec<String> {
    let domain = domain.to_ascii_lowercase();
    let suffix = format!(".{domain}");
    let mut seen = HashSet::new();
    let mut emails = Vec::new();

    for m in EMAIL_RE.find_iter(html) {
        let email = m.as_str().trim_end_matches('.').to_ascii_lowercase();
        let Some((_, host)) = email.rsplit_once('@') else {
            continue;
        };
        if (host == domain || host.ends_with(&suffix)) && seen.insert(email.clone()) {
            emails.push(email);
        }
    }
    emails
}

/// Merge newly found addresses into `into`, skipping duplicates.
pub fn merge_emails(into: &mut Vec<String>, found: Vec<String>) {
    for email in found {
        if !into.contains(&email) {
            into.push(email);
        }
    }
}

/// Extract all links from a document, resolved against the base URL.
pub fn extract_links(doc: &Html, base_url: &Url) -> Vec<Url> {
    let link_sel = Selector::parse("a[href]").expect("valid selector");
    let mut links = Vec::new();

    for el in doc.select(&link_sel) {
        if let Some(href) = el.value().attr("href") {
            // Skip anchors, javascript:, mailto:, tel:
            if href.starts_with('#')
                || href.starts_with("javascript:")
                || href.starts_with("mailto:")
                || href.starts_with("tel:")
            {
                continue;
            }

            if let Ok(mut resolved) = base_url.join(href) {
                resolved.set_fragment(None);
                links.push(resolved);
            }
        }
    }

    links
}

/// Normalize a URL for deduplication (strip fragment and trailing slash).
pub fn normalize_url(url: &Url) -> String {
    let mut normalized = url.clone();
    normalized.set_fragment(None);
    let mut s = normalized.to_string();
    if s.ends_with('/') && s.matches('/').count() > 3 {
        s.pop();
    }
    s
}

/// Compute SHA-256 hash of content.
pub fn compute_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Truncate to at most `max_chars` characters on a char boundary.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_skips_scripts_and_styles() {
        let html = r#"<html><head><title>T</title><style>.a{}</style></head><body>
            <h1>Acme   Anvils</h1>
            <script>var x = 1;</script>
            <p>Forged in Ohio.</p>
        </body></html>"#;
        let text = extract_text(&Html::parse_document(html));
        assert!(text.contains("Acme Anvils"));
        assert!(text.contains("Forged in Ohio."));
        assert!(!text.contains("var x"));
        assert!(!text.contains(".a{}"));
    }

    #[test]
    fn emails_filtered_to_target_domain() {
        let html = r#"Contact Sales@Acme.com or support@help.acme.com.
            Not gmail: someone@gmail.com, nor acme.com.evil.io: x@acme.com.evil.io.
            Again: sales@acme.com"#;
        let emails = extract_emails(html, "acme.com");
        assert_eq!(emails, vec!["sales@acme.com", "support@help.acme.com"]);
    }

    #[test]
    fn test_extract_links() {
        let html = r##"<html><body><a href="/page2">Page 2</a><a href="https://external.com">External</a><a href="#section">Anchor</a><a href="mailto:a@b.com">Mail</a></body></html>"##;
        let doc = Html::parse_document(html);
        let base = Url::parse("https://acme.com/page1").unwrap();
        let links: Vec<String> = extract_links(&doc, &base)
            .iter()
            .map(|u| u.to_string())
            .collect();

        assert_eq!(links, vec!["https://acme.com/page2", "https://external.com/"]);
    }

    #[test]
    fn test_normalize_url() {
        let url = Url::parse("https://acme.com/about/#team").unwrap();
        assert_eq!(normalize_url(&url), "https://acme.com/about");
    }

    #[test]
    fn test_compute_hash() {
        assert_eq!(
            compute_hash("hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("abc", 10), "abc");
    }
}

//! Domain-name normalization and input-file parsing.

use std::collections::HashSet;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use url::Url;

use crate::error::{DealDriverError, Result};
use crate::types::WorkItem;

static DOMAIN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?\.)+(?:[a-z]{2,63}|xn--[a-z0-9-]{1,59})$")
        .expect("domain regex is valid")
});

/// Reduce a URL, e-mail address or bare host to a lowercase domain.
///
/// `https://www.Acme.com:8080/about` and `sales@acme.com` both become `acme.com`.
/// Internationalized hosts come back in punycode (`bücher.de` → `xn--bcher-kva.de`).
pub fn extract_domain(input: &str) -> Result<String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(DealDriverError::validation("empty domain"));
    }
    let invalid = || DealDriverError::validation(format!("'{trimmed}' is not a valid domain"));

    // Without a scheme, `user@host` parses as userinfo + host.
    let candidate = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    };
    let url = Url::parse(&candidate).map_err(|_| invalid())?;
    let host = url.host_str().ok_or_else(invalid)?;
    let host = host.strip_prefix("www.").unwrap_or(host).trim_end_matches('.');

    if !DOMAIN_RE.is_match(host) {
        return Err(invalid());
    }
    Ok(host.to_string())
}

/// Work items parsed from a list of domains, with per-line problems.
#[derive(Debug, Default)]
pub struct DomainList {
    pub items: Vec<WorkItem>,
    /// `line N: message` for invalid or duplicate lines.
    pub errors: Vec<String>,
}

/// Parse one-domain-per-line text. Blank lines and `#` comments are ignored.
pub fn parse_domain_lines<'a>(lines: impl IntoIterator<Item = &'a str>) -> DomainList {
    let mut list = DomainList::default();
    let mut seen = HashSet::new();

    for (idx, line) in lines.into_iter().enumerate() {
        let line_no = idx + 1;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        match WorkItem::parse(line) {
            Ok(item) => {
                if seen.insert(item.domain.clone()) {
                    list.items.push(item);
                } else {
                    list.errors
                        .push(format!("line {line_no}: duplicate domain {}", item.domain));
                }
            }
            Err(e) => list.errors.push(format!("line {line_no}: {e}")),
        }
    }

    list
}

/// Read and parse a domain file.
pub fn read_domain_file(path: &Path) -> Result<DomainList> {
    let content = std::fs::read_to_string(path).map_err(|e| DealDriverError::io(path, e))?;
    let list = parse_domain_lines(content.lines());
    tracing::debug!(
        ?path,
        items = list.items.len(),
        errors = list.errors.len(),
        "read domain file"
    );
    Ok(list)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_scheme_www_port_and_path() {
        assert_eq!(
            extract_domain("https://www.Acme.com:8443/about?x=1").unwrap(),
            "acme.com"
        );
        assert_eq!(extract_domain("  shop.acme.co.uk/  ").unwrap(), "shop.acme.co.uk");
    }

    #[test]
    fn email_maps_to_domain() {
        assert_eq!(extract_domain("Jane.Doe@Acme.com").unwrap(), "acme.com");
    }

    #[test]
    fn international_hosts_become_punycode() {
        assert_eq!(extract_domain("bücher.de").unwrap(), "xn--bcher-kva.de");
        assert_eq!(
            extract_domain("https://www.münchen.de/kontakt").unwrap(),
            "xn--mnchen-3ya.de"
        );
    }

    #[test]
    fn rejects_ip_addresses() {
        assert!(extract_domain("http://192.168.1.10/admin").is_err());
    }

    #[test]
    fn rejects_garbage() {
        assert!(extract_domain("").is_err());
        assert!(extract_domain("not a domain").is_err());
        assert!(extract_domain("localhost").is_err());
    }

    #[test]
    fn parses_lines_with_comments_and_duplicates() {
        let text = "# prospects\nacme.com\n\nhttps://www.acme.com\nbad domain\nglobex.io\n";
        let list = parse_domain_lines(text.lines());
        let domains: Vec<_> = list.items.iter().map(|i| i.domain.as_str()).collect();
        assert_eq!(domains, vec!["acme.com", "globex.io"]);
        assert_eq!(list.errors.len(), 2);
        assert!(list.errors[0].starts_with("line 4: duplicate"));
        assert!(list.errors[1].starts_with("line 5:"));
    }

    #[test]
    fn reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("domains.txt");
        std::fs::write(&path, "acme.com\nglobex.io\n").unwrap();
        let list = read_domain_file(&path).unwrap();
        assert_eq!(list.items.len(), 2);
        assert!(list.errors.is_empty());
    }
}

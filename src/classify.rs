use mailparse::{MailAddr, addrparse};

use crate::models::Contact;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Starred,
    Unstarred,
    None,
}

impl Classification {
    pub fn is_contact(self) -> bool {
        self != Classification::None
    }
}

/// Classifies a sender address against the starred and unstarred contact
/// lists. Matching is an exact, case-insensitive comparison against every
/// address of every contact; the starred list is consulted first.
pub fn classify(address: &str, starred: &[Contact], unstarred: &[Contact]) -> Classification {
    if address_in(address, starred) {
        Classification::Starred
    } else if address_in(address, unstarred) {
        Classification::Unstarred
    } else {
        Classification::None
    }
}

fn address_in(address: &str, contacts: &[Contact]) -> bool {
    let address = address.to_lowercase();
    contacts
        .iter()
        .flat_map(|c| c.addresses.iter())
        .any(|a| a.trim().to_lowercase() == address)
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unparseable sender address {0:?}")]
pub struct AddressParseError(pub String);

/// Extracts the bare address from an RFC 5322 `From` header value such as
/// `"Jane Doe" <jane@example.com>`, `jane@example.com (Jane)` or
/// `"jane doe"@example.com`. A list yields its first address.
pub fn parse_sender(header: &str) -> Result<String, AddressParseError> {
    let err = || AddressParseError(header.trim().to_string());
    let cleaned = strip_comments(header).ok_or_else(err)?;
    let cleaned = cleaned.trim();

    if let Some(addr) = quoted_local_part(cleaned) {
        return addr.ok_or_else(err);
    }

    let parsed = addrparse(cleaned).map_err(|_| err())?;
    let addr = parsed
        .iter()
        .find_map(|a| match a {
            MailAddr::Single(info) => Some(info.addr.trim().to_string()),
            MailAddr::Group(group) => group.addrs.first().map(|i| i.addr.trim().to_string()),
        })
        .ok_or_else(err)?;

    let (local, domain) = addr.rsplit_once('@').ok_or_else(err)?;
    if local.is_empty() || !valid_domain(domain) {
        return Err(err());
    }
    if addr.chars().any(|c| c.is_whitespace() || matches!(c, '<' | '>' | ',' | '"')) {
        return Err(err());
    }
    Ok(addr)
}

fn valid_domain(domain: &str) -> bool {
    !domain.is_empty()
        && (domain.contains('.') || domain == "localhost")
        && !domain
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '@' | '<' | '>' | ',' | '"'))
}

/// Removes `(comments)` outside quoted strings. Returns `None` when a
/// comment or quoted string is left open.
fn strip_comments(header: &str) -> Option<String> {
    let mut out = String::with_capacity(header.len());
    let mut depth = 0usize;
    let mut quoted = false;
    let mut chars = header.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' if quoted || depth > 0 => {
                let next = chars.next()?;
                if depth == 0 {
                    out.push(c);
                    out.push(next);
                }
            }
            '"' if depth == 0 => {
                quoted = !quoted;
                out.push(c);
            }
            '(' if !quoted => depth += 1,
            ')' if !quoted => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    out.push(' ');
                }
            }
            _ if depth > 0 => {}
            _ => out.push(c),
        }
    }
    (depth == 0 && !quoted).then_some(out)
}

/// Handles a bare addr-spec whose local part is a quoted string, which is
/// returned unquoted. `None` means the value has some other shape.
fn quoted_local_part(value: &str) -> Option<Option<String>> {
    let rest = value.strip_prefix('"')?;
    let mut local = String::new();
    let mut chars = rest.char_indices();
    while let Some((i, c)) = chars.next() {
        match c {
            '\\' => local.push(chars.next()?.1),
            '"' => {
                let domain = rest[i + 1..].strip_prefix('@')?;
                let valid = !local.is_empty() && valid_domain(domain);
                return Some(valid.then(|| format!("{}@{}", local, domain)));
            }
            _ => local.push(c),
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contact(addresses: &[&str], starred: bool) -> Contact {
        Contact {
            addresses: addresses.iter().map(|a| a.to_string()).collect(),
            starred,
        }
    }

    #[test]
    fn test_classify_is_case_insensitive() {
        let starred = vec![contact(&["Alice@Example.com"], true)];
        let unstarred = vec![contact(&["bob@example.com", "robert@work.example"], false)];

        assert_eq!(classify("alice@example.COM", &starred, &unstarred), Classification::Starred);
        assert_eq!(classify("ROBERT@work.example", &starred, &unstarred), Classification::Unstarred);
        assert_eq!(classify("carol@example.com", &starred, &unstarred), Classification::None);
    }

    #[test]
    fn test_classify_prefers_starred_list_for_shared_address() {
        let starred = vec![contact(&["dup@example.com"], true)];
        let unstarred = vec![contact(&["dup@example.com"], false)];
        assert_eq!(classify("dup@example.com", &starred, &unstarred), Classification::Starred);
    }

    #[test]
    fn test_classify_requires_exact_match() {
        let starred = vec![contact(&["al@example.com"], true)];
        assert_eq!(classify("val@example.com", &starred, &[]), Classification::None);
        assert_eq!(classify("al@example.co", &starred, &[]), Classification::None);
    }

    #[test]
    fn test_parse_sender_forms() {
        assert_eq!(parse_sender("jane@example.com").unwrap(), "jane@example.com");
        assert_eq!(
            parse_sender("\"Doe, Jane\" <jane@example.com>").unwrap(),
            "jane@example.com"
        );
        assert_eq!(parse_sender("  Jane <jane@example.com>  ").unwrap(), "jane@example.com");
        assert_eq!(parse_sender("jane@example.com, bob@example.com").unwrap(), "jane@example.com");
    }

    #[test]
    fn test_parse_sender_drops_comments() {
        assert_eq!(parse_sender("jane@example.com (Jane Doe)").unwrap(), "jane@example.com");
        assert_eq!(parse_sender("Jane <jane@example.com> (work)").unwrap(), "jane@example.com");
        assert_eq!(
            parse_sender("jane@example.com (nested (comment) \\) here)").unwrap(),
            "jane@example.com"
        );
        assert_eq!(
            parse_sender("\"Jane (not a comment)\" <jane@example.com>").unwrap(),
            "jane@example.com"
        );
        assert!(parse_sender("jane@example.com (unterminated").is_err());
    }

    #[test]
    fn test_parse_sender_unquotes_local_part() {
        assert_eq!(parse_sender("\"john doe\"@example.com").unwrap(), "john doe@example.com");
        assert_eq!(parse_sender("\"a\\\"b\"@example.com").unwrap(), "a\"b@example.com");
        assert!(parse_sender("\"\"@example.com").is_err());
        assert!(parse_sender("\"john\"@nodot").is_err());
    }

    #[test]
    fn test_classify_folds_unicode_case() {
        let starred = vec![contact(&["ÅSA@Example.com"], true)];
        let unstarred = vec![contact(&["ÉLODIE@example.fr"], false)];

        assert_eq!(classify("åsa@example.com", &starred, &unstarred), Classification::Starred);
        assert_eq!(classify("élodie@EXAMPLE.fr", &starred, &unstarred), Classification::Unstarred);
    }

    #[test]
    fn test_parse_sender_rejects_garbage() {
        assert!(parse_sender("").is_err());
        assert!(parse_sender("not an address").is_err());
        assert!(parse_sender("<@example.com>").is_err());
        assert!(parse_sender("a@b@").is_err());
    }
}

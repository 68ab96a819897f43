use crate::error::GuardError;
use crate::host::AddresseeRecord;
use crate::language::Language;
use crate::normalization::{capitalize_name, normalize_token, strip_invisible};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

lazy_static! {
    // Role and system mailboxes, matched against the lowercased local part.
    static ref GENERIC_LOCAL_PARTS: Vec<Regex> = vec![
        Regex::new(r"^(?:no[-_.]?reply|do[-_.]?not[-_.]?reply|bounces?)(?:[-_.+].*)?$").unwrap(),
        Regex::new(
            r"^(?:support|info|admin|administrator|sales|contact|help|helpdesk|service|services|team|office|billing|accounts?|hr|jobs|careers|marketing|newsletters?|news|notifications?|notify|alerts?|postmaster|webmaster|hostmaster|abuse|mailer-daemon|security|privacy|feedback|hello|enquiries|inquiries|orders?|invoices?|press|media|legal|compliance|it|ops|devops|system|root|lists?|updates?|reception|mail)(?:[-_.+].*)?$"
        )
        .unwrap(),
        Regex::new(r"^.+[-_.](?:noreply|no-reply|notifications?|alerts?)$").unwrap(),
    ];
}

const LOCAL_PART_SEPARATORS: [char; 4] = ['.', '_', '-', '+'];

/// Canonical representation of one addressee.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub address: String,
    pub display_name: Option<String>,
    pub name_tokens: Vec<String>,
    pub is_generic: bool,
}

impl Identity {
    pub fn local_part(&self) -> &str {
        self.address
            .rsplit_once('@')
            .map(|(local, _)| local)
            .unwrap_or(&self.address)
    }

    /// Name used when rewriting a greeting: the given name from the display
    /// name (the part after the comma for "Last, First"), otherwise the first
    /// extracted token.
    pub fn preferred_name(&self) -> Option<String> {
        let honorifics = all_honorifics();
        let given_part = self
            .display_name
            .as_deref()
            .map(|name| match name.split_once(',') {
                Some((_, given)) if !given.trim().is_empty() => given,
                _ => name,
            });
        given_part
            .and_then(|part| {
                part.split_whitespace()
                    .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()))
                    .find(|w| {
                        w.chars().count() > 1 && !honorifics.contains(w.to_lowercase().as_str())
                    })
                    .map(str::to_string)
            })
            .or_else(|| self.name_tokens.first().map(|t| capitalize_name(t)))
    }
}

fn all_honorifics() -> HashSet<&'static str> {
    Language::ALL
        .iter()
        .flat_map(|l| l.profile().honorifics.iter().copied())
        .collect()
}

pub struct IdentityParser {
    honorifics: HashSet<&'static str>,
}

impl Default for IdentityParser {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentityParser {
    pub fn new() -> Self {
        Self {
            honorifics: all_honorifics(),
        }
    }

    pub fn parse(&self, address: &str, display_name: Option<&str>) -> Result<Identity, GuardError> {
        let raw = extract_address(address)?;
        let normalized = raw.to_lowercase();
        let (local_raw, _) = raw
            .rsplit_once('@')
            .ok_or_else(|| GuardError::InvalidInput(format!("address has no '@': {address}")))?;

        let is_generic = is_generic_local_part(&local_raw.to_lowercase());

        let display_name = display_name
            .map(|n| strip_invisible(n).trim().trim_matches('"').trim().to_string())
            .filter(|n| !n.is_empty());

        let mut tokens = Vec::new();
        if let Some(name) = &display_name {
            tokens.extend(self.display_name_tokens(name));
        }
        tokens.extend(local_part_tokens(local_raw));

        let mut seen = HashSet::new();
        let name_tokens = tokens
            .into_iter()
            .filter(|t| t.chars().count() > 1)
            .filter(|t| seen.insert(t.clone()))
            .collect();

        Ok(Identity {
            address: normalized,
            display_name,
            name_tokens,
            is_generic,
        })
    }

    /// Parse every usable record. Records with an empty address are dropped
    /// up front; malformed addresses are skipped with a warning.
    pub fn parse_batch(&self, records: &[AddresseeRecord]) -> Vec<Identity> {
        let mut seen = HashSet::new();
        records
            .iter()
            .filter(|r| !r.address.trim().is_empty())
            .filter_map(|r| match self.parse(&r.address, r.display_name.as_deref()) {
                Ok(identity) => Some(identity),
                Err(e) => {
                    log::warn!("Skipping addressee {:?}: {e}", r.address);
                    None
                }
            })
            .filter(|identity| seen.insert(identity.address.clone()))
            .collect()
    }

    fn display_name_tokens(&self, name: &str) -> Vec<String> {
        name.split(|c: char| c.is_whitespace() || c == ',')
            .filter(|w| !w.is_empty())
            .filter(|w| {
                !self
                    .honorifics
                    .contains(w.trim_end_matches('.').to_lowercase().as_str())
            })
            .map(normalize_token)
            .filter(|t| !t.is_empty())
            .collect()
    }
}

/// Pull the bare address out of `Name <user@host>` or `mailto:` forms.
fn extract_address(address: &str) -> Result<String, GuardError> {
    let trimmed = address.trim();
    let inner = match (trimmed.rfind('<'), trimmed.rfind('>')) {
        (Some(open), Some(close)) if open < close => &trimmed[open + 1..close],
        _ => trimmed,
    };
    let mut inner = inner.trim();
    if inner.get(..7).is_some_and(|scheme| scheme.eq_ignore_ascii_case("mailto:")) {
        inner = &inner[7..];
    }

    if inner.is_empty() {
        return Err(GuardError::InvalidInput("empty address".to_string()));
    }
    if inner.chars().any(char::is_whitespace) {
        return Err(GuardError::InvalidInput(format!(
            "address contains whitespace: {address}"
        )));
    }
    match inner.rfind('@') {
        Some(at) if at > 0 && at + 1 < inner.len() => Ok(inner.to_string()),
        _ => Err(GuardError::InvalidInput(format!(
            "not an email address: {address}"
        ))),
    }
}

pub fn is_generic_local_part(local: &str) -> bool {
    GENERIC_LOCAL_PARTS.iter().any(|re| re.is_match(local))
}

fn local_part_tokens(local: &str) -> Vec<String> {
    local
        .split(LOCAL_PART_SEPARATORS)
        .flat_map(split_case_boundaries)
        .map(|part| normalize_token(&part))
        .filter(|t| !t.is_empty())
        .collect()
}

/// Split at lower->upper transitions, letter/digit transitions and before the
/// last capital of an uppercase run followed by lowercase ("JSmith" -> J, Smith).
pub fn split_case_boundaries(part: &str) -> Vec<String> {
    let chars: Vec<char> = part.chars().collect();
    let mut pieces = Vec::new();
    let mut current = String::new();

    for (i, &c) in chars.iter().enumerate() {
        if let Some(&prev) = i.checked_sub(1).and_then(|p| chars.get(p)) {
            let next = chars.get(i + 1).copied();
            let boundary = (prev.is_lowercase() && c.is_uppercase())
                || (prev.is_alphabetic() && c.is_ascii_digit())
                || (prev.is_ascii_digit() && c.is_alphabetic())
                || (prev.is_uppercase()
                    && c.is_uppercase()
                    && next.map(|n| n.is_lowercase()).unwrap_or(false));
            if boundary && !current.is_empty() {
                pieces.push(std::mem::take(&mut current));
            }
        }
        current.push(c);
    }
    if !current.is_empty() {
        pieces.push(current);
    }
    pieces
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dotted_address() {
        let identity = IdentityParser::new().parse("john.doe@x.com", None).unwrap();
        assert_eq!(identity.address, "john.doe@x.com");
        assert_eq!(identity.name_tokens, vec!["john", "doe"]);
        assert!(!identity.is_generic);
        assert_eq!(identity.local_part(), "john.doe");
    }

    #[test]
    fn test_address_is_lowercased_and_trimmed() {
        let identity = IdentityParser::new()
            .parse("  John.Doe@Example.COM ", None)
            .unwrap();
        assert_eq!(identity.address, "john.doe@example.com");
    }

    #[test]
    fn test_empty_address_is_invalid() {
        let parser = IdentityParser::new();
        assert!(matches!(parser.parse("", None), Err(GuardError::InvalidInput(_))));
        assert!(matches!(parser.parse("   ", None), Err(GuardError::InvalidInput(_))));
        assert!(matches!(parser.parse("john", None), Err(GuardError::InvalidInput(_))));
        assert!(matches!(parser.parse("@x.com", None), Err(GuardError::InvalidInput(_))));
    }

    #[test]
    fn test_camel_case_and_digits() {
        let identity = IdentityParser::new().parse("JohnDoe42@x.com", None).unwrap();
        assert_eq!(identity.name_tokens, vec!["john", "doe", "42"]);

        assert_eq!(split_case_boundaries("JSmith"), vec!["J", "Smith"]);
        assert_eq!(split_case_boundaries("maryAnn"), vec!["mary", "Ann"]);
    }

    #[test]
    fn test_display_name_tokens_first() {
        let identity = IdentityParser::new()
            .parse("jd@x.com", Some("Dr. Jane Doe"))
            .unwrap();
        assert_eq!(identity.name_tokens, vec!["jane", "doe", "jd"]);
        assert_eq!(identity.display_name.as_deref(), Some("Dr. Jane Doe"));
    }

    #[test]
    fn test_reversed_display_name() {
        let identity = IdentityParser::new()
            .parse("jane.doe@x.com", Some("Doe, Jane"))
            .unwrap();
        assert_eq!(identity.name_tokens, vec!["doe", "jane"]);
        assert_eq!(identity.preferred_name().as_deref(), Some("Jane"));
    }

    #[test]
    fn test_short_tokens_dropped() {
        let identity = IdentityParser::new().parse("j.smith@x.com", None).unwrap();
        assert_eq!(identity.name_tokens, vec!["smith"]);
    }

    #[test]
    fn test_generic_addresses() {
        let parser = IdentityParser::new();
        for address in [
            "support@x.com",
            "noreply@x.com",
            "no-reply@x.com",
            "info+de@x.com",
            "billing.eu@x.com",
            "github-notifications@x.com",
        ] {
            assert!(parser.parse(address, None).unwrap().is_generic, "{address}");
        }
        assert!(!parser.parse("john.doe@x.com", None).unwrap().is_generic);
        assert!(!parser.parse("itzel@x.com", None).unwrap().is_generic);
    }

    #[test]
    fn test_angle_bracket_form() {
        let identity = IdentityParser::new()
            .parse("\"Jane Doe\" <Jane.Doe@X.com>", None)
            .unwrap();
        assert_eq!(identity.address, "jane.doe@x.com");
    }

    #[test]
    fn test_non_ascii_local_part() {
        let parser = IdentityParser::new();
        let identity = parser.parse("abcdefé@x.com", None).unwrap();
        assert_eq!(identity.address, "abcdefé@x.com");
        assert_eq!(identity.name_tokens.len(), 1);

        let identity = parser.parse("<José.Müller@x.com>", None).unwrap();
        assert_eq!(identity.address, "josé.müller@x.com");
        assert!(matches!(parser.parse("ééééé", None), Err(GuardError::InvalidInput(_))));
    }

    #[test]
    fn test_mailto_prefix_is_stripped() {
        let parser = IdentityParser::new();
        let identity = parser.parse("MAILTO:john.doe@x.com", None).unwrap();
        assert_eq!(identity.address, "john.doe@x.com");
        let identity = parser.parse("Jane <mailto:jane@x.com>", None).unwrap();
        assert_eq!(identity.address, "jane@x.com");
    }

    #[test]
    fn test_parsing_is_idempotent() {
        let parser = IdentityParser::new();
        let a = parser.parse("Mary-Ann.O'Neil@x.com", Some("Mary-Ann O'Neil")).unwrap();
        let b = parser.parse("Mary-Ann.O'Neil@x.com", Some("Mary-Ann O'Neil")).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_batch_filters_empty_and_invalid() {
        let records = vec![
            AddresseeRecord::new("john.doe@x.com"),
            AddresseeRecord::new(""),
            AddresseeRecord::new("not-an-address"),
            AddresseeRecord::with_name("jane@x.com", "Jane Roe"),
            AddresseeRecord::new("JOHN.DOE@x.com"),
        ];
        let identities = IdentityParser::new().parse_batch(&records);
        let addresses: Vec<&str> = identities.iter().map(|i| i.address.as_str()).collect();
        assert_eq!(addresses, vec!["john.doe@x.com", "jane@x.com"]);
    }

    #[test]
    fn test_preferred_name() {
        let parser = IdentityParser::new();
        let identity = parser.parse("john.doe@x.com", None).unwrap();
        assert_eq!(identity.preferred_name().as_deref(), Some("John"));

        let identity = parser.parse("jd@x.com", Some("Mr. Jonathan Doe")).unwrap();
        assert_eq!(identity.preferred_name().as_deref(), Some("Jonathan"));
    }
}

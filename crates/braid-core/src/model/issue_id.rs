use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use thiserror::Error;

/// Prefix on every rendered issue id.
pub const ID_PREFIX: &str = "br-";

/// Hex digits carried after the prefix.
pub const ID_HEX_LEN: usize = 8;

/// Stable, content-derived issue identifier (`br-` plus 8 lowercase hex
/// digits).
///
/// Ids are derived from a blake3 digest over the creating record's title,
/// timestamp, and actor, so independent clients creating issues offline get
/// distinct ids without coordination. An id is immutable once assigned.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IssueId(String);

impl IssueId {
    /// Derive an id from creation-time content.
    ///
    /// `disambiguator` is 0 on first derivation; callers bump it and
    /// re-derive when the result collides with a live issue.
    #[must_use]
    pub fn derive(title: &str, created_at: i64, actor: &str, disambiguator: u32) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(title.as_bytes());
        hasher.update(&created_at.to_le_bytes());
        hasher.update(actor.as_bytes());
        hasher.update(&disambiguator.to_le_bytes());
        let hex = hasher.finalize().to_hex();
        Self(format!("{ID_PREFIX}{}", &hex.as_str()[..ID_HEX_LEN]))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Error returned when text is not a well-formed issue id.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid issue id: '{got}' (expected {ID_PREFIX} plus {ID_HEX_LEN} hex digits)")]
pub struct ParseIdError {
    pub got: String,
}

fn well_formed(s: &str) -> bool {
    s.strip_prefix(ID_PREFIX).is_some_and(|rest| {
        rest.len() == ID_HEX_LEN
            && rest
                .chars()
                .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
    })
}

impl FromStr for IssueId {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if well_formed(trimmed) {
            Ok(Self(trimmed.to_string()))
        } else {
            Err(ParseIdError { got: s.to_string() })
        }
    }
}

impl TryFrom<String> for IssueId {
    type Error = ParseIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<IssueId> for String {
    fn from(id: IssueId) -> Self {
        id.0
    }
}

impl fmt::Display for IssueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::{ID_HEX_LEN, ID_PREFIX, IssueId};
    use std::str::FromStr;

    #[test]
    fn derive_is_deterministic() {
        let a = IssueId::derive("Fix the flaky socket test", 1_700_000_000_000_000, "alice", 0);
        let b = IssueId::derive("Fix the flaky socket test", 1_700_000_000_000_000, "alice", 0);
        assert_eq!(a, b);
    }

    #[test]
    fn derive_varies_with_every_input() {
        let base = IssueId::derive("title", 1, "alice", 0);
        assert_ne!(base, IssueId::derive("other", 1, "alice", 0));
        assert_ne!(base, IssueId::derive("title", 2, "alice", 0));
        assert_ne!(base, IssueId::derive("title", 1, "bob", 0));
        assert_ne!(base, IssueId::derive("title", 1, "alice", 1));
    }

    #[test]
    fn derived_ids_are_well_formed() {
        let id = IssueId::derive("anything", 42, "carol", 0);
        let rendered = id.to_string();
        assert!(rendered.starts_with(ID_PREFIX));
        assert_eq!(rendered.len(), ID_PREFIX.len() + ID_HEX_LEN);
        let reparsed = IssueId::from_str(&rendered).unwrap();
        assert_eq!(id, reparsed);
    }

    #[test]
    fn parse_rejects_malformed_ids() {
        assert!(IssueId::from_str("").is_err());
        assert!(IssueId::from_str("br-").is_err());
        assert!(IssueId::from_str("br-12345").is_err());
        assert!(IssueId::from_str("br-123456789").is_err());
        assert!(IssueId::from_str("br-1234567G").is_err());
        assert!(IssueId::from_str("br-1234567A").is_err());
        assert!(IssueId::from_str("bd-12345678").is_err());
    }

    #[test]
    fn parse_trims_surrounding_whitespace() {
        let id = IssueId::from_str("  br-00c0ffee ").unwrap();
        assert_eq!(id.as_str(), "br-00c0ffee");
    }

    #[test]
    fn serde_rejects_malformed_ids() {
        let ok: Result<IssueId, _> = serde_json::from_str("\"br-deadbeef\"");
        assert!(ok.is_ok());
        let bad: Result<IssueId, _> = serde_json::from_str("\"not-an-id\"");
        assert!(bad.is_err());
    }
}

/// Identifier types
///
/// Every entity kind draws its `IdType` from one global counter, so an ID
/// names at most one entity for the whole lifetime of the world. Connection
/// identifiers live in their own numbering space.

use crate::error::{MushError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Opaque entity identifier, rendered as `@<decimal>`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdType(pub u64);

impl IdType {
    /// Parse the `@<decimal>` text form
    ///
    /// Surrounding whitespace is ignored. The remainder after `@` must be
    /// ASCII digits only: no sign, no inner whitespace.
    ///
    /// # Errors
    /// - `MushError::InvalidId`: missing `@`, empty number, non-digit, or overflow
    pub fn parse(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let digits = trimmed
            .strip_prefix('@')
            .filter(|d| !d.is_empty() && d.bytes().all(|b| b.is_ascii_digit()))
            .ok_or_else(|| MushError::InvalidId(trimmed.to_string()))?;

        digits
            .parse::<u64>()
            .map(IdType)
            .map_err(|_| MushError::InvalidId(trimmed.to_string()))
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for IdType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

impl FromStr for IdType {
    type Err = MushError;

    fn from_str(s: &str) -> Result<Self> {
        IdType::parse(s)
    }
}

impl From<u64> for IdType {
    fn from(v: u64) -> Self {
        IdType(v)
    }
}

/// Identifier assigned to a live connection by the session registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_table() {
        let cases: &[(&str, Option<u64>)] = &[
            ("@1", Some(1)),
            ("@87654", Some(87654)),
            ("@0", Some(0)),
            ("@-1", None),
            ("0", None),
            ("1234", None),
            ("  @1   ", Some(1)),
            ("@  123", None),
            ("@", None),
            ("@+5", None),
            ("@12 3", None),
            ("@99999999999999999999999", None),
        ];

        for (input, expected) in cases {
            let parsed = IdType::parse(input).ok().map(IdType::value);
            assert_eq!(parsed, *expected, "parse({:?})", input);
        }
    }

    #[test]
    fn test_display() {
        assert_eq!(IdType(42).to_string(), "@42");
        assert_eq!(ConnectionId(7).to_string(), "#7");
    }

    #[test]
    fn test_from_str() {
        let id: IdType = "@15".parse().unwrap();
        assert_eq!(id, IdType(15));
        assert!(matches!("x".parse::<IdType>(), Err(MushError::InvalidId(_))));
    }

    proptest! {
        #[test]
        fn prop_render_then_parse(n in any::<u64>()) {
            prop_assert_eq!(IdType::parse(&IdType(n).to_string()).unwrap(), IdType(n));
        }

        #[test]
        fn prop_padded_render_then_parse(n in any::<u64>(), pad in "[ \t]{0,4}") {
            let text = format!("{}{}{}", pad, IdType(n), pad);
            prop_assert_eq!(IdType::parse(&text).unwrap(), IdType(n));
        }
    }
}

//! Parsing of `name[:tag]` image references.

use std::fmt::Display;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::StageError;

/// The tag applied when a reference omits one.
pub const DEFAULT_TAG: &str = "latest";

/// Canonical identity of an image on the stage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageReference {
    /// The image name.
    pub name: String,
    /// The image tag.
    pub tag: String,
}

/// Names and tags are restricted to a character set that can never escape
/// the staging directory tree (notably, no `/` and no leading `.`).
fn valid_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    first.is_ascii_alphanumeric()
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

impl ImageReference {
    /// Parse a `name[:tag]` string, splitting on the last `:` and applying
    /// [`DEFAULT_TAG`] when no tag is present.
    pub fn parse(input: &str) -> Result<Self, StageError> {
        let (name, tag) = match input.rsplit_once(':') {
            Some((name, tag)) => (name, tag),
            None => (input, DEFAULT_TAG),
        };
        let invalid = |reason: &str| StageError::InvalidReference {
            input: input.to_string(),
            reason: reason.to_string(),
        };
        if !valid_identifier(name) {
            return Err(invalid(
                "name must be alphanumeric, optionally with interior [._-]",
            ));
        }
        if !valid_identifier(tag) {
            return Err(invalid(
                "tag must be alphanumeric, optionally with interior [._-]",
            ));
        }
        Ok(Self {
            name: name.to_string(),
            tag: tag.to_string(),
        })
    }
}

impl Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.name, self.tag)
    }
}

impl FromStr for ImageReference {
    type Err = StageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_defaults_tag() {
        let r = ImageReference::parse("myos").unwrap();
        assert_eq!(r.name, "myos");
        assert_eq!(r.tag, DEFAULT_TAG);
    }

    #[test]
    fn test_parse_with_tag() {
        let r = ImageReference::parse("myos:v2").unwrap();
        assert_eq!(r.name, "myos");
        assert_eq!(r.tag, "v2");
        assert_eq!(r.to_string(), "myos:v2");
    }

    #[test]
    fn test_parse_dotted() {
        let r = ImageReference::parse("base-os.dev:2024.1_rc1").unwrap();
        assert_eq!(r.name, "base-os.dev");
        assert_eq!(r.tag, "2024.1_rc1");
    }

    #[test]
    fn test_parse_invalid() {
        // Splitting happens on the *last* colon, so the name keeps any
        // earlier ones and fails validation.
        for input in ["", ":", "myos:", ":v2", "my os", "a:b:c", "../etc:x", "my/os"] {
            let e = ImageReference::parse(input).unwrap_err();
            assert!(
                matches!(e, StageError::InvalidReference { .. }),
                "{input}: {e}"
            );
        }
    }

    #[test]
    fn test_fromstr_roundtrip() {
        let r: ImageReference = "myos:v2".parse().unwrap();
        assert_eq!(r.to_string().parse::<ImageReference>().unwrap(), r);
    }
}

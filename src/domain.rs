use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::HarvestError;

pub type ReviewPages = Vec<Vec<Value>>;

static SLUG_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*$").unwrap());

/// URL slug of a strain. Doubles as the artifact file stem, so it must never
/// contain path separators.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StrainSlug(String);

impl StrainSlug {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StrainSlug {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for StrainSlug {
    type Err = HarvestError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if !SLUG_PATTERN.is_match(trimmed) || trimmed.contains("..") {
            return Err(HarvestError::InvalidSlug(value.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }
}

impl TryFrom<String> for StrainSlug {
    type Error = HarvestError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<StrainSlug> for String {
    fn from(slug: StrainSlug) -> Self {
        slug.0
    }
}

pub fn page_count(total: u64, page_size: u32) -> u64 {
    if page_size == 0 {
        return 0;
    }
    total.div_ceil(u64::from(page_size))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn parse_slug_valid() {
        let slug: StrainSlug = " blue-dream ".parse().unwrap();
        assert_eq!(slug.as_str(), "blue-dream");
    }

    #[test]
    fn parse_slug_rejects_paths() {
        assert_matches!(
            "../etc".parse::<StrainSlug>(),
            Err(HarvestError::InvalidSlug(_))
        );
        assert_matches!(
            "a/b".parse::<StrainSlug>(),
            Err(HarvestError::InvalidSlug(_))
        );
        assert_matches!("".parse::<StrainSlug>(), Err(HarvestError::InvalidSlug(_)));
    }

    #[test]
    fn page_count_rounds_up() {
        assert_eq!(page_count(130, 50), 3);
        assert_eq!(page_count(100, 50), 2);
        assert_eq!(page_count(0, 50), 0);
        assert_eq!(page_count(1, 50), 1);
        assert_eq!(page_count(5867, 50), 118);
    }
}

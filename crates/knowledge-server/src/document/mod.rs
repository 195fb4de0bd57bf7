pub mod chunker;
pub mod doc_type;
pub mod link_graph;
pub mod parser;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Three-tier importance marker used as a search-time filter and bias.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromotionLevel {
    Standard,
    Important,
    Critical,
}

impl PromotionLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            PromotionLevel::Standard => "standard",
            PromotionLevel::Important => "important",
            PromotionLevel::Critical => "critical",
        }
    }
}

impl Default for PromotionLevel {
    fn default() -> Self {
        PromotionLevel::Standard
    }
}

impl fmt::Display for PromotionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PromotionLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "standard" => Ok(PromotionLevel::Standard),
            "important" => Ok(PromotionLevel::Important),
            "critical" => Ok(PromotionLevel::Critical),
            other => Err(format!(
                "unknown promotion level '{other}', expected standard|important|critical"
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn promotion_levels_are_ordered() {
        assert!(PromotionLevel::Standard < PromotionLevel::Important);
        assert!(PromotionLevel::Important < PromotionLevel::Critical);
    }

    #[test]
    fn promotion_level_parses_case_insensitively() {
        assert_eq!(
            "Critical".parse::<PromotionLevel>(),
            Ok(PromotionLevel::Critical)
        );
        assert!("urgent".parse::<PromotionLevel>().is_err());
    }
}

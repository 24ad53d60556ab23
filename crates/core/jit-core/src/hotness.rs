//! Optimization levels

use serde::{Deserialize, Serialize};

/// Hotness of a method body, which is also the optimization level a plan
/// compiles at. Ordered from cheapest to most aggressive.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum OptLevel {
    NoOpt,
    Cold,
    #[default]
    Warm,
    Hot,
    VeryHot,
    Scorching,
}

impl OptLevel {
    pub const ALL: [OptLevel; 6] = [
        OptLevel::NoOpt,
        OptLevel::Cold,
        OptLevel::Warm,
        OptLevel::Hot,
        OptLevel::VeryHot,
        OptLevel::Scorching,
    ];

    /// Next level up, saturating at `Scorching`.
    pub fn next(self) -> OptLevel {
        match self {
            OptLevel::NoOpt => OptLevel::Cold,
            OptLevel::Cold => OptLevel::Warm,
            OptLevel::Warm => OptLevel::Hot,
            OptLevel::Hot => OptLevel::VeryHot,
            OptLevel::VeryHot | OptLevel::Scorching => OptLevel::Scorching,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            OptLevel::NoOpt => "noOpt",
            OptLevel::Cold => "cold",
            OptLevel::Warm => "warm",
            OptLevel::Hot => "hot",
            OptLevel::VeryHot => "veryHot",
            OptLevel::Scorching => "scorching",
        }
    }
}

impl std::fmt::Display for OptLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_saturates() {
        assert_eq!(OptLevel::NoOpt.next(), OptLevel::Cold);
        assert_eq!(OptLevel::VeryHot.next(), OptLevel::Scorching);
        assert_eq!(OptLevel::Scorching.next(), OptLevel::Scorching);
    }

    #[test]
    fn test_ordering() {
        for pair in OptLevel::ALL.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }
}

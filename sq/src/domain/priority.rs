//! Priority tiers for work items and jobs

use serde::{Deserialize, Serialize};

/// Dispatch tier for pending work
///
/// Ordering follows the numeric value, so `Critical` is the greatest and is
/// popped first from a max-heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low = 1,
    #[default]
    Normal = 2,
    High = 3,
    Critical = 4,
}

impl Priority {
    /// Numeric value of the tier (LOW=1 .. CRITICAL=4)
    pub fn value(self) -> u8 {
        self as u8
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Normal => write!(f, "normal"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" | "1" => Ok(Self::Low),
            "normal" | "2" => Ok(Self::Normal),
            "high" | "3" => Ok(Self::High),
            "critical" | "4" => Ok(Self::Critical),
            _ => Err(format!("Unknown priority: {}", s)),
        }
    }
}

//! Agent profiles and ratings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::phase::Role;

/// A peer-review rating, always within `1..=5`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Rating(u8);

impl Rating {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 5;

    /// A rating, if `value` is in range.
    pub fn new(value: u8) -> Option<Self> {
        (Self::MIN..=Self::MAX).contains(&value).then_some(Self(value))
    }

    /// Clamp any integer to the nearest valid rating.
    ///
    /// The flag reports whether clamping changed the value.
    pub fn clamped(value: i64) -> (Self, bool) {
        let clamped = value.clamp(Self::MIN as i64, Self::MAX as i64);
        (Self(clamped as u8), clamped != value)
    }

    pub fn value(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for Rating {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value).ok_or_else(|| format!("rating {} is outside 1..=5", value))
    }
}

impl From<Rating> for u8 {
    fn from(rating: Rating) -> Self {
        rating.0
    }
}

impl std::fmt::Display for Rating {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Active,
    Fired,
}

/// An agent as an immutable value. Changes produce a new profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentProfile {
    pub id: Uuid,
    pub role: Role,
    /// Display name, e.g. `developer-2` for the second Developer hired.
    pub name: String,
    /// 1-based hire number for this role.
    pub generation: u32,
    /// Ratings received, oldest first. Only ever appended.
    pub ratings: Vec<Rating>,
    pub status: AgentStatus,
    pub hired_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fired_at: Option<DateTime<Utc>>,
}

impl AgentProfile {
    pub fn hire(role: Role, generation: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            name: format!("{}-{}", role.slug(), generation),
            generation,
            ratings: Vec::new(),
            status: AgentStatus::Active,
            hired_at: Utc::now(),
            fired_at: None,
        }
    }

    /// This profile with `rating` appended.
    pub fn with_rating(&self, rating: Rating) -> Self {
        let mut next = self.clone();
        next.ratings.push(rating);
        next
    }

    /// This profile marked Fired.
    pub fn fired(&self) -> Self {
        Self {
            status: AgentStatus::Fired,
            fired_at: Some(Utc::now()),
            ..self.clone()
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == AgentStatus::Active
    }

    /// Average of the most recent `samples` ratings, once that many exist.
    pub fn rolling_average(&self, samples: usize) -> Option<f64> {
        if samples == 0 || self.ratings.len() < samples {
            return None;
        }
        let recent = &self.ratings[self.ratings.len() - samples..];
        let sum: u32 = recent.iter().map(|r| r.value() as u32).sum();
        Some(sum as f64 / samples as f64)
    }
}

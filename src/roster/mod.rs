//! Agent roster with performance tracking and the hire/fire lifecycle.
//!
//! Exactly one profile per role is active. Profiles are immutable values:
//! appending a rating or firing an agent replaces the map entry, and a fired
//! profile moves to the historical list.
//!
//! Firing rule: once a profile holds at least `min_review_samples` ratings,
//! it is fired iff the average of the most recent `min_review_samples` ratings
//! is strictly below `firing_threshold`. A replacement with an empty history
//! is hired in the same step.

mod profile;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::RunConfig;
use crate::errors::RosterError;
use crate::phase::{Phase, Role};
use crate::review::ReviewRecord;

pub use profile::{AgentProfile, AgentStatus, Rating};

/// A lifecycle event produced by the roster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum AgentEvent {
    Fired {
        role: Role,
        agent_id: Uuid,
        name: String,
        average: f64,
        timestamp: DateTime<Utc>,
    },
    Hired {
        role: Role,
        agent_id: Uuid,
        name: String,
        /// The fired agent this hire replaces.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        replaces: Option<Uuid>,
        timestamp: DateTime<Utc>,
    },
}

impl AgentEvent {
    pub fn role(&self) -> Role {
        match self {
            Self::Fired { role, .. } | Self::Hired { role, .. } => *role,
        }
    }

    pub fn agent_id(&self) -> Uuid {
        match self {
            Self::Fired { agent_id, .. } | Self::Hired { agent_id, .. } => *agent_id,
        }
    }
}

/// Holds one active agent per role plus every former agent.
#[derive(Debug, Clone)]
pub struct AgentRoster {
    active: BTreeMap<Role, AgentProfile>,
    former: Vec<AgentProfile>,
    hires: BTreeMap<Role, u32>,
    reviews: Vec<ReviewRecord>,
    events: Vec<AgentEvent>,
    firing_threshold: f64,
    min_samples: usize,
    hire_limit: Option<u32>,
}

impl AgentRoster {
    /// Create a roster with one freshly hired agent per role.
    pub fn new(firing_threshold: f64, min_samples: usize, hire_limit: Option<u32>) -> Self {
        let mut roster = Self {
            active: BTreeMap::new(),
            former: Vec::new(),
            hires: BTreeMap::new(),
            reviews: Vec::new(),
            events: Vec::new(),
            firing_threshold,
            min_samples: min_samples.max(1),
            hire_limit,
        };
        for role in Role::ALL {
            let generation = roster.next_generation(role);
            roster.active.insert(role, AgentProfile::hire(role, generation));
        }
        roster
    }

    pub fn from_config(config: &RunConfig) -> Self {
        Self::new(
            config.firing_threshold,
            config.min_review_samples,
            config.max_hires_per_role,
        )
    }

    /// The active agent for `role`.
    pub fn get(&self, role: Role) -> Result<&AgentProfile, RosterError> {
        self.active
            .get(&role)
            .ok_or(RosterError::NoActiveAgent { role })
    }

    /// The active agent for `role`, hiring one if the seat is empty.
    pub fn get_or_hire(&mut self, role: Role) -> Result<AgentProfile, RosterError> {
        if let Some(profile) = self.active.get(&role) {
            return Ok(profile.clone());
        }
        warn!(role = %role, "no active agent, hiring");
        self.hire(role, None)
    }

    /// Append one rating and evaluate the reviewee's role.
    pub fn record_rating(
        &mut self,
        reviewee: Uuid,
        reviewer: Uuid,
        rating: Rating,
        phase: Phase,
    ) -> Result<Vec<AgentEvent>, RosterError> {
        let reviewer_role = self.role_of(reviewer)?;
        let reviewee_role = self.role_of(reviewee)?;
        let record = ReviewRecord {
            reviewer_id: reviewer,
            reviewer_role,
            reviewee_id: reviewee,
            reviewee_role,
            phase,
            rating,
            comment: String::new(),
            clamped: false,
            timestamp: Utc::now(),
        };
        self.append(record)?;
        self.evaluate(&[reviewee_role])
    }

    /// Append every record, then evaluate all roles in enumeration order.
    ///
    /// Called between phases, so no replacement happens while a phase runs.
    pub fn apply_reviews(&mut self, records: &[ReviewRecord]) -> Result<Vec<AgentEvent>, RosterError> {
        for record in records {
            self.append(record.clone())?;
        }
        self.evaluate(&Role::ALL)
    }

    fn append(&mut self, record: ReviewRecord) -> Result<(), RosterError> {
        let profile = self
            .active
            .get(&record.reviewee_role)
            .filter(|p| p.id == record.reviewee_id)
            .ok_or(RosterError::UnknownAgent {
                id: record.reviewee_id,
            })?;
        let updated = profile.with_rating(record.rating);
        self.active.insert(record.reviewee_role, updated);
        self.reviews.push(record);
        Ok(())
    }

    /// Fire and replace every listed role whose rolling average is too low.
    fn evaluate(&mut self, roles: &[Role]) -> Result<Vec<AgentEvent>, RosterError> {
        let mut events = Vec::new();
        for &role in roles {
            let Some(profile) = self.active.get(&role) else {
                continue;
            };
            let Some(average) = profile.rolling_average(self.min_samples) else {
                continue;
            };
            if average >= self.firing_threshold {
                continue;
            }

            let fired = profile.fired();
            warn!(
                role = %role,
                agent = %fired.name,
                average,
                threshold = self.firing_threshold,
                "firing agent"
            );
            let event = AgentEvent::Fired {
                role,
                agent_id: fired.id,
                name: fired.name.clone(),
                average,
                timestamp: Utc::now(),
            };
            self.events.push(event.clone());
            events.push(event);
            self.active.remove(&role);
            let fired_id = fired.id;
            self.former.push(fired);

            let hired = self.hire(role, Some(fired_id))?;
            if let Some(last) = self.events.last() {
                events.push(last.clone());
            }
            info!(role = %role, agent = %hired.name, "hired replacement");
        }
        Ok(events)
    }

    fn hire(&mut self, role: Role, replaces: Option<Uuid>) -> Result<AgentProfile, RosterError> {
        let made = self.hires.get(&role).copied().unwrap_or(0);
        if let Some(limit) = self.hire_limit
            && made >= limit
        {
            return Err(RosterError::Exhausted { role, hires: made });
        }
        let generation = self.next_generation(role);
        let profile = AgentProfile::hire(role, generation);
        self.events.push(AgentEvent::Hired {
            role,
            agent_id: profile.id,
            name: profile.name.clone(),
            replaces,
            timestamp: Utc::now(),
        });
        self.active.insert(role, profile.clone());
        Ok(profile)
    }

    fn next_generation(&mut self, role: Role) -> u32 {
        let count = self.hires.entry(role).or_insert(0);
        *count += 1;
        *count
    }

    fn role_of(&self, id: Uuid) -> Result<Role, RosterError> {
        self.active
            .values()
            .chain(self.former.iter())
            .find(|p| p.id == id)
            .map(|p| p.role)
            .ok_or(RosterError::UnknownAgent { id })
    }

    /// Look up any agent, active or former.
    pub fn profile(&self, id: Uuid) -> Option<&AgentProfile> {
        self.active
            .values()
            .chain(self.former.iter())
            .find(|p| p.id == id)
    }

    pub fn active(&self) -> impl Iterator<Item = &AgentProfile> {
        self.active.values()
    }

    pub fn former(&self) -> &[AgentProfile] {
        &self.former
    }

    pub fn reviews(&self) -> &[ReviewRecord] {
        &self.reviews
    }

    /// Every lifecycle event since the roster was created, in order.
    pub fn events(&self) -> &[AgentEvent] {
        &self.events
    }

    pub fn hires(&self, role: Role) -> u32 {
        self.hires.get(&role).copied().unwrap_or(0)
    }
}

use serde::Deserialize;
use serde::Serialize;

use crate::CheckStatus;
use crate::Entity;
use crate::HealthState;

/// A confirmed, reportable change of an entity's health.
///
/// This is the payload every handler receives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub entity: Entity,
    pub previous: HealthState,
    pub current: HealthState,
    /// Unix time in milliseconds of the confirming observation
    pub timestamp: u64,
    /// Checks of the confirming observation
    #[serde(default)]
    pub checks: Vec<CheckStatus>,
}

impl Transition {
    pub fn tag(&self) -> Option<&str> {
        self.entity.tag()
    }

    /// Whether the entity got healthier
    pub fn is_recovery(&self) -> bool {
        self.current < self.previous
    }

    /// Single line description used by log style handlers
    pub fn summary(&self) -> String {
        let failing: Vec<&str> = self
            .checks
            .iter()
            .filter(|c| c.status != HealthState::Passing)
            .map(|c| c.name.as_str())
            .collect();
        if failing.is_empty() {
            format!("{} is now {} (was {})", self.entity, self.current, self.previous)
        } else {
            format!(
                "{} is now {} (was {}), failing checks: {}",
                self.entity,
                self.current,
                self.previous,
                failing.join(", ")
            )
        }
    }
}

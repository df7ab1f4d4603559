//! Change detection with a consecutive-observation threshold.
//!
//! A state only becomes *confirmed* after it was observed `threshold` times
//! in a row. Any different observation in between restarts the count, so a
//! flapping check never confirms.

use crate::Error;
use crate::HealthState;
use crate::Result;

/// Minimum number of consecutive matching observations required to confirm
/// a transition. Always >= 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeThreshold(u32);

impl ChangeThreshold {
    pub const IMMEDIATE: ChangeThreshold = ChangeThreshold(1);

    /// # Errors
    /// Returns `Error::InvalidConfig` for zero, negative or oversized values.
    pub fn new(raw: i64) -> Result<Self> {
        if raw < 1 {
            return Err(Error::InvalidConfig(format!("change threshold must be >= 1, got {}", raw)));
        }
        u32::try_from(raw)
            .map(ChangeThreshold)
            .map_err(|_| Error::InvalidConfig(format!("change threshold {} is too large", raw)))
    }

    pub fn get(&self) -> u32 {
        self.0
    }
}

/// A confirmed change between two health states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    pub previous: HealthState,
    pub current: HealthState,
}

#[derive(Debug, Clone)]
pub struct ChangeDetector {
    threshold: ChangeThreshold,
    /// Last confirmed state; `None` until the baseline is established
    confirmed: Option<HealthState>,
    candidate: Option<HealthState>,
    matches: u32,
}

impl ChangeDetector {
    /// Detector whose first observation becomes the baseline without
    /// emitting anything.
    pub fn new(threshold: ChangeThreshold) -> Self {
        Self {
            threshold,
            confirmed: None,
            candidate: None,
            matches: 0,
        }
    }

    /// Detector that starts from an explicit prior confirmed state, so the
    /// very first observations can already confirm a transition.
    pub fn seeded(
        threshold: ChangeThreshold,
        prior: HealthState,
    ) -> Self {
        Self {
            threshold,
            confirmed: Some(prior),
            candidate: None,
            matches: 0,
        }
    }

    pub fn confirmed(&self) -> Option<HealthState> {
        self.confirmed
    }

    pub fn threshold(&self) -> ChangeThreshold {
        self.threshold
    }

    /// Feeds one observation and returns the transition it confirms, if any.
    pub fn observe(
        &mut self,
        state: HealthState,
    ) -> Option<StateChange> {
        let Some(confirmed) = self.confirmed else {
            self.confirmed = Some(state);
            self.candidate = Some(state);
            self.matches = 1;
            return None;
        };

        if self.candidate == Some(state) {
            self.matches = self.matches.saturating_add(1);
        } else {
            self.candidate = Some(state);
            self.matches = 1;
        }

        if state != confirmed && self.matches >= self.threshold.get() {
            self.confirmed = Some(state);
            self.matches = 0;
            return Some(StateChange {
                previous: confirmed,
                current: state,
            });
        }

        None
    }
}

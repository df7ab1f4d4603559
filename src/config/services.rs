use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

/// Per-service overrides
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct ServiceConfig {
    /// Overrides `agent.change_threshold` for this service
    #[serde(default)]
    pub change_threshold: Option<i64>,

    /// Watch every tag of the service as a separate entity
    #[serde(default)]
    pub distinct_tags: bool,

    /// Tags never watched when `distinct_tags` is set
    #[serde(default)]
    pub ignored_tags: Vec<String>,

    /// Handler names alerted for this service; `None` means all handlers
    #[serde(default)]
    pub handlers: Option<Vec<String>>,
}

impl ServiceConfig {
    pub fn validate(
        &self,
        service: &str,
    ) -> Result<()> {
        if let Some(threshold) = self.change_threshold {
            if threshold < 1 {
                return Err(Error::InvalidConfig(format!(
                    "service '{}': change_threshold must be >= 1, got {}",
                    service, threshold
                )));
            }
        }
        Ok(())
    }

    pub fn is_ignored(
        &self,
        tag: &str,
    ) -> bool {
        self.ignored_tags.iter().any(|t| t == tag)
    }
}

use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

/// Built-in notification sinks. Unknown kinds fail deserialization, so a
/// misspelled handler stops the agent at startup.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HandlerKind {
    /// Emits a structured tracing event per transition
    Log,
    /// Appends one JSON line per transition to `path`
    File,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct HandlerConfig {
    /// Unique name; services select handlers by it and it is part of the
    /// fleet-wide lock key
    pub name: String,

    pub kind: HandlerKind,

    /// `log` only: level of the emitted event (default "warn")
    #[serde(default)]
    pub level: Option<String>,

    /// `file` only: destination of the JSON lines
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl HandlerConfig {
    /// # Errors
    /// Returns `Error::InvalidConfig` when the name is empty or the
    /// kind-specific fields are missing or malformed.
    pub fn validate(&self) -> Result<()> {
        let name = self.name.trim();
        if name.is_empty() {
            return Err(Error::InvalidConfig("handler name cannot be empty".into()));
        }
        if name.contains('/') || name.contains('+') {
            return Err(Error::InvalidConfig(format!(
                "handler name '{}' cannot contain '/' or '+'",
                self.name
            )));
        }

        match self.kind {
            HandlerKind::Log => {
                if let Some(level) = &self.level {
                    if level.parse::<tracing::Level>().is_err() {
                        return Err(Error::InvalidConfig(format!(
                            "handler '{}': unknown level '{}'",
                            self.name, level
                        )));
                    }
                }
            }
            HandlerKind::File => match &self.path {
                Some(path) if !path.as_os_str().is_empty() => {}
                _ => {
                    return Err(Error::InvalidConfig(format!(
                        "handler '{}': file handlers require a path",
                        self.name
                    )));
                }
            },
        }

        Ok(())
    }
}

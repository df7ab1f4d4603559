use async_trait::async_trait;
use tracing::Level;

use super::Handler;
use crate::Error;
use crate::HandlerError;
use crate::Result;
use crate::Transition;

/// Reports transitions as structured tracing events.
#[derive(Debug, Clone)]
pub struct LogHandler {
    name: String,
    level: Level,
}

impl LogHandler {
    /// `level` defaults to `warn`.
    pub fn new(
        name: &str,
        level: Option<&str>,
    ) -> Result<Self> {
        let level = match level {
            Some(l) => l
                .parse::<Level>()
                .map_err(|_| Error::InvalidConfig(format!("handler '{}': unknown level '{}'", name, l)))?,
            None => Level::WARN,
        };
        Ok(Self {
            name: name.to_string(),
            level,
        })
    }

    pub fn level(&self) -> Level {
        self.level
    }
}

macro_rules! alert_event {
    ($level:expr, $handler:expr, $t:expr) => {
        tracing::event!(
            $level,
            handler = %$handler,
            entity = %$t.entity,
            previous = %$t.previous,
            current = %$t.current,
            timestamp = $t.timestamp,
            "{}",
            $t.summary()
        )
    };
}

#[async_trait]
impl Handler for LogHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn notify(
        &self,
        transition: &Transition,
    ) -> std::result::Result<(), HandlerError> {
        if self.level == Level::ERROR {
            alert_event!(Level::ERROR, self.name, transition);
        } else if self.level == Level::WARN {
            alert_event!(Level::WARN, self.name, transition);
        } else if self.level == Level::INFO {
            alert_event!(Level::INFO, self.name, transition);
        } else if self.level == Level::DEBUG {
            alert_event!(Level::DEBUG, self.name, transition);
        } else {
            alert_event!(Level::TRACE, self.name, transition);
        }
        Ok(())
    }
}

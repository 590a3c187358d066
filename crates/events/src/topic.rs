//! Topic names are resolved from environment variables, never hard-coded.

use std::collections::HashMap;

use atlas_core::{CoreError, CoreResult};

pub const COMMAND_TOPIC_SAGA: &str = "COMMAND_TOPIC_SAGA";
pub const EVENT_TOPIC_SAGA_STATUS: &str = "EVENT_TOPIC_SAGA_STATUS";
pub const EVENT_TOPIC_SAGA_STEP_STATUS: &str = "EVENT_TOPIC_SAGA_STEP_STATUS";
pub const COMMAND_TOPIC_CHARACTER: &str = "COMMAND_TOPIC_CHARACTER";
pub const COMMAND_TOPIC_COMPARTMENT: &str = "COMMAND_TOPIC_COMPARTMENT";
pub const COMMAND_TOPIC_STORAGE: &str = "COMMAND_TOPIC_STORAGE";
pub const COMMAND_TOPIC_CASH_SHOP: &str = "COMMAND_TOPIC_CASH_SHOP";
pub const COMMAND_TOPIC_QUEST: &str = "COMMAND_TOPIC_QUEST";
pub const COMMAND_TOPIC_BUFF: &str = "COMMAND_TOPIC_BUFF";
pub const COMMAND_TOPIC_PORTAL: &str = "COMMAND_TOPIC_PORTAL";
pub const COMMAND_TOPIC_MAP: &str = "COMMAND_TOPIC_MAP";
pub const COMMAND_TOPIC_CONSUMABLE: &str = "COMMAND_TOPIC_CONSUMABLE";
pub const COMMAND_TOPIC_REACTOR: &str = "COMMAND_TOPIC_REACTOR";
pub const COMMAND_TOPIC_CHARACTER_SESSION: &str = "COMMAND_TOPIC_CHARACTER_SESSION";

/// Resolved topic names keyed by the environment variable that names them.
#[derive(Debug, Clone, Default)]
pub struct Topics {
    resolved: HashMap<String, String>,
}

impl Topics {
    /// Resolve every variable in `names` from the process environment.
    ///
    /// A missing or empty variable is a fatal startup error.
    pub fn from_env(names: &[&str]) -> CoreResult<Self> {
        Self::resolve(names, |name| std::env::var(name).ok())
    }

    pub fn resolve<F>(names: &[&str], lookup: F) -> CoreResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut resolved = HashMap::with_capacity(names.len());
        for name in names {
            match lookup(name) {
                Some(topic) if !topic.trim().is_empty() => {
                    resolved.insert(name.to_string(), topic);
                }
                _ => return Err(CoreError::fatal(format!("topic variable {name} is not set"))),
            }
        }
        Ok(Self { resolved })
    }

    /// Identity mapping (`name -> name`), for tests and local runs.
    pub fn identity(names: &[&str]) -> Self {
        Self {
            resolved: names.iter().map(|n| (n.to_string(), n.to_string())).collect(),
        }
    }

    pub fn get(&self, name: &str) -> CoreResult<&str> {
        self.resolved
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| CoreError::fatal(format!("topic variable {name} was never resolved")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_variable_is_fatal() {
        let err = Topics::resolve(&[COMMAND_TOPIC_SAGA], |_| None).unwrap_err();
        assert!(matches!(err, CoreError::Fatal(_)));
    }

    #[test]
    fn resolves_through_lookup() {
        let topics = Topics::resolve(&[COMMAND_TOPIC_SAGA], |name| {
            (name == COMMAND_TOPIC_SAGA).then(|| "atlas.saga.command".to_string())
        })
        .unwrap();
        assert_eq!(topics.get(COMMAND_TOPIC_SAGA).unwrap(), "atlas.saga.command");
        assert!(topics.get(EVENT_TOPIC_SAGA_STATUS).is_err());
    }
}

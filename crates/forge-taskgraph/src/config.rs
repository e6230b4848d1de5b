use crate::{AiRunMode, RetrySettings, TaskGraphError};
use std::path::PathBuf;

pub const DEFAULT_STATE_DIR: &str = "runs/state";
pub const STATE_DIR_ENV: &str = "FORGE_STATE_DIR";
pub const EVENTS_DIR_ENV: &str = "FORGE_EVENTS_DIR";
pub const AI_MODE_ENV: &str = "FORGE_AI_MODE";
pub const MAX_BACKOFF_MS_ENV: &str = "FORGE_MAX_BACKOFF_MS";

/// Process-level settings shared by every run an embedding tool starts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineSettings {
    pub state_dir: PathBuf,
    /// JSONL event log directory; no log when unset.
    pub events_dir: Option<PathBuf>,
    pub ai_mode: Option<AiRunMode>,
    pub max_backoff_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
            events_dir: None,
            ai_mode: None,
            max_backoff_ms: RetrySettings::default().max_delay_ms,
        }
    }
}

impl EngineSettings {
    pub fn from_env() -> Result<Self, TaskGraphError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds settings from any key lookup. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, TaskGraphError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let mut settings = Self::default();
        if let Some(dir) = read(STATE_DIR_ENV) {
            settings.state_dir = PathBuf::from(dir);
        }
        settings.events_dir = read(EVENTS_DIR_ENV).map(PathBuf::from);
        if let Some(mode) = read(AI_MODE_ENV) {
            settings.ai_mode = Some(AiRunMode::parse(&mode).ok_or_else(|| {
                TaskGraphError::Runtime(format!(
                    "{AI_MODE_ENV}='{mode}' must be deterministic, delegated or auto"
                ))
            })?);
        }
        if let Some(raw) = read(MAX_BACKOFF_MS_ENV) {
            settings.max_backoff_ms = raw.parse().map_err(|_| {
                TaskGraphError::Runtime(format!(
                    "{MAX_BACKOFF_MS_ENV}='{raw}' must be a non-negative integer"
                ))
            })?;
        }
        Ok(settings)
    }

    pub fn retry_settings(&self) -> RetrySettings {
        RetrySettings {
            max_delay_ms: self.max_backoff_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: BTreeMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn from_lookup_empty_expected_defaults() {
        let settings = EngineSettings::from_lookup(lookup(&[])).expect("defaults should load");
        assert_eq!(settings, EngineSettings::default());
        assert_eq!(settings.retry_settings(), RetrySettings::default());
    }

    #[test]
    fn from_lookup_all_keys_expected_overrides() {
        let settings = EngineSettings::from_lookup(lookup(&[
            (STATE_DIR_ENV, "/tmp/state"),
            (EVENTS_DIR_ENV, "/tmp/events"),
            (AI_MODE_ENV, "delegated"),
            (MAX_BACKOFF_MS_ENV, "2500"),
        ]))
        .expect("settings should load");
        assert_eq!(settings.state_dir, PathBuf::from("/tmp/state"));
        assert_eq!(settings.events_dir, Some(PathBuf::from("/tmp/events")));
        assert_eq!(settings.ai_mode, Some(AiRunMode::Delegated));
        assert_eq!(settings.retry_settings().max_delay_ms, 2500);
    }

    #[test]
    fn from_lookup_bad_values_expected_errors() {
        assert!(EngineSettings::from_lookup(lookup(&[(AI_MODE_ENV, "sometimes")])).is_err());
        assert!(EngineSettings::from_lookup(lookup(&[(MAX_BACKOFF_MS_ENV, "-1")])).is_err());
        let blank = EngineSettings::from_lookup(lookup(&[(EVENTS_DIR_ENV, "  ")]))
            .expect("blank values are unset");
        assert_eq!(blank.events_dir, None);
    }
}

//! Typed engine settings from `CORTEX_*` environment variables.
//!
//! Call [`EngineSettings::load`] to run the env/.env/XDG layering first, or
//! [`EngineSettings::from_env`] to read the process environment as-is.
//! Unparseable values fall back to defaults with a warning; a missing backend
//! URL only matters when an HTTP backend is actually constructed.

use std::time::Duration;

#[derive(Clone, Debug)]
pub struct EngineSettings {
    /// `CORTEX_LLM_URL`: base URL of the direct-HTTP backend, or the full
    /// endpoint of the gateway backend.
    pub llm_url: Option<String>,
    /// `CORTEX_LLM_API_KEY`
    pub llm_api_key: Option<String>,
    /// `CORTEX_ITERATION_CAP`: overrides every agent's declared cap.
    pub iteration_cap_override: Option<u32>,
    /// `CORTEX_ACTION_TIMEOUT_SECS`
    pub default_action_timeout: Duration,
    /// `CORTEX_MAX_PARALLEL_ACTIONS`
    pub max_parallel_actions: usize,
    /// `CORTEX_PERIODIC_FEEDS` ("true"/"false")
    pub periodic_feeds_enabled: bool,
    /// `CORTEX_EVENT_QUEUE_CAPACITY`: emitter high-water mark.
    pub event_queue_capacity: usize,
    /// `CORTEX_SHUTDOWN_GRACE_SECS`: wait for detached actions at session end.
    pub shutdown_grace: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            llm_url: None,
            llm_api_key: None,
            iteration_cap_override: None,
            default_action_timeout: Duration::from_secs(60),
            max_parallel_actions: 8,
            periodic_feeds_enabled: true,
            event_queue_capacity: 128,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

fn parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("ignoring unparseable {key}={raw:?}");
            None
        }
    }
}

impl EngineSettings {
    /// Reads the process environment, defaulting anything absent or invalid.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            llm_url: std::env::var("CORTEX_LLM_URL").ok().filter(|s| !s.is_empty()),
            llm_api_key: std::env::var("CORTEX_LLM_API_KEY")
                .ok()
                .filter(|s| !s.is_empty()),
            iteration_cap_override: parsed("CORTEX_ITERATION_CAP"),
            default_action_timeout: parsed("CORTEX_ACTION_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.default_action_timeout),
            max_parallel_actions: parsed::<usize>("CORTEX_MAX_PARALLEL_ACTIONS")
                .filter(|&n| n > 0)
                .unwrap_or(defaults.max_parallel_actions),
            periodic_feeds_enabled: parsed("CORTEX_PERIODIC_FEEDS")
                .unwrap_or(defaults.periodic_feeds_enabled),
            event_queue_capacity: parsed::<usize>("CORTEX_EVENT_QUEUE_CAPACITY")
                .filter(|&n| n > 0)
                .unwrap_or(defaults.event_queue_capacity),
            shutdown_grace: parsed("CORTEX_SHUTDOWN_GRACE_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.shutdown_grace),
        }
    }

    /// Applies the `.env`/XDG layering for app `cortex`, then reads the env.
    pub fn load() -> Self {
        if let Err(e) = env_config::load_and_apply("cortex", None) {
            tracing::warn!("config layering failed, using process env only: {e}");
        }
        Self::from_env()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let s = EngineSettings::default();
        assert_eq!(s.default_action_timeout, Duration::from_secs(60));
        assert_eq!(s.max_parallel_actions, 8);
        assert!(s.periodic_feeds_enabled);
        assert!(s.iteration_cap_override.is_none());
    }

    #[test]
    fn from_env_reads_and_validates() {
        std::env::set_var("CORTEX_ITERATION_CAP", "3");
        std::env::set_var("CORTEX_MAX_PARALLEL_ACTIONS", "0");
        std::env::set_var("CORTEX_ACTION_TIMEOUT_SECS", "nonsense");
        let s = EngineSettings::from_env();
        std::env::remove_var("CORTEX_ITERATION_CAP");
        std::env::remove_var("CORTEX_MAX_PARALLEL_ACTIONS");
        std::env::remove_var("CORTEX_ACTION_TIMEOUT_SECS");
        assert_eq!(s.iteration_cap_override, Some(3));
        // Zero parallelism is rejected; default applies.
        assert_eq!(s.max_parallel_actions, 8);
        assert_eq!(s.default_action_timeout, Duration::from_secs(60));
    }
}

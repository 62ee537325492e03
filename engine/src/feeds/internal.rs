//! Built-in feed sources served inside the engine: clock, random,
//! environment snapshot, process metrics.

use once_cell::sync::Lazy;
use std::time::Instant;

static PROCESS_START: Lazy<Instant> = Lazy::new(Instant::now);

/// Fixed table of internal sources.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InternalSource {
    Clock,
    Random,
    EnvSnapshot,
    ProcessMetrics,
}

impl InternalSource {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "clock" => Some(Self::Clock),
            "random" => Some(Self::Random),
            "env" | "env_snapshot" => Some(Self::EnvSnapshot),
            "process" | "process_metrics" => Some(Self::ProcessMetrics),
            _ => None,
        }
    }

    /// Computes the current value. Internal sources are invoked on demand and
    /// never fail.
    pub fn value(&self) -> String {
        match self {
            Self::Clock => chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            Self::Random => uuid::Uuid::new_v4().simple().to_string(),
            Self::EnvSnapshot => {
                let mut vars: Vec<(String, String)> = std::env::vars().collect();
                vars.sort();
                vars.into_iter()
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect::<Vec<_>>()
                    .join("\n")
            }
            Self::ProcessMetrics => format!(
                "pid={} uptime_secs={}",
                std::process::id(),
                PROCESS_START.elapsed().as_secs()
            ),
        }
    }
}

/// Touch the start instant early so uptime is measured from session bring-up
/// rather than first metric read.
pub(super) fn init_process_clock() {
    Lazy::force(&PROCESS_START);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_known_sources() {
        assert_eq!(InternalSource::parse("clock"), Some(InternalSource::Clock));
        assert_eq!(InternalSource::parse("random"), Some(InternalSource::Random));
        assert_eq!(
            InternalSource::parse("env"),
            Some(InternalSource::EnvSnapshot)
        );
        assert_eq!(
            InternalSource::parse("process_metrics"),
            Some(InternalSource::ProcessMetrics)
        );
        assert_eq!(InternalSource::parse("magic"), None);
    }

    #[test]
    fn clock_is_rfc3339_utc() {
        let v = InternalSource::Clock.value();
        assert!(v.ends_with('Z'));
        assert!(chrono::DateTime::parse_from_rfc3339(&v).is_ok());
    }

    #[test]
    fn random_values_differ() {
        assert_ne!(InternalSource::Random.value(), InternalSource::Random.value());
    }

    #[test]
    fn env_snapshot_contains_set_variable() {
        std::env::set_var("CORTEX_FEED_TEST_MARKER", "present");
        let v = InternalSource::EnvSnapshot.value();
        std::env::remove_var("CORTEX_FEED_TEST_MARKER");
        assert!(v.contains("CORTEX_FEED_TEST_MARKER=present"));
    }

    #[test]
    fn process_metrics_reports_pid() {
        let v = InternalSource::ProcessMetrics.value();
        assert!(v.contains(&format!("pid={}", std::process::id())));
        assert!(v.contains("uptime_secs="));
    }
}

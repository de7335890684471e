use std::time::Duration;

use serde::Deserialize;

use crate::admission::LimiterConfig;

/// Who may confirm or cancel a hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HolderPolicy {
    /// Only the holder named at reserve time.
    #[default]
    Strict,
    /// Any caller.
    Any,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorSettings {
    /// Upper bound on waiting for a resource or group lock.
    pub lock_wait: Duration,
    /// Hold timeout used by callers that do not pick their own.
    pub default_hold_timeout: Duration,
    pub holder_policy: HolderPolicy,
    /// Longest the reaper sleeps when no expiry is pending.
    pub reaper_idle: Duration,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            lock_wait: Duration::from_secs(1),
            default_hold_timeout: Duration::from_secs(300),
            holder_policy: HolderPolicy::Strict,
            reaper_idle: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub coordinator: CoordinatorSettings,
    pub default_limiter: LimiterConfig,
    pub metrics_port: Option<u16>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            coordinator: CoordinatorSettings::default(),
            default_limiter: LimiterConfig::TokenBucket {
                capacity: 5,
                refill_per_sec: 2.0,
            },
            metrics_port: None,
        }
    }
}

#[derive(Debug)]
pub struct ConfigError {
    pub var: &'static str,
    pub value: String,
    pub reason: String,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid {}={:?}: {}", self.var, self.value, self.reason)
    }
}

impl std::error::Error for ConfigError {}

impl Settings {
    /// Read `ALLOT_*` variables from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`Settings::from_env`] with an injectable source, so callers and
    /// tests do not have to mutate the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Settings::default();

        if let Some(v) = lookup("ALLOT_LOCK_WAIT_MS") {
            settings.coordinator.lock_wait = parse_millis("ALLOT_LOCK_WAIT_MS", &v)?;
        }
        if let Some(v) = lookup("ALLOT_HOLD_TIMEOUT_MS") {
            settings.coordinator.default_hold_timeout =
                parse_millis("ALLOT_HOLD_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("ALLOT_REAPER_IDLE_MS") {
            settings.coordinator.reaper_idle = parse_millis("ALLOT_REAPER_IDLE_MS", &v)?;
        }
        if let Some(v) = lookup("ALLOT_HOLDER_POLICY") {
            let name = serde_json::Value::String(v.trim().to_ascii_lowercase());
            settings.coordinator.holder_policy =
                serde_json::from_value(name).map_err(|e| ConfigError {
                    var: "ALLOT_HOLDER_POLICY",
                    value: v.clone(),
                    reason: e.to_string(),
                })?;
        }
        if let Some(v) = lookup("ALLOT_DEFAULT_LIMITER") {
            let parsed: LimiterConfig = serde_json::from_str(&v).map_err(|e| ConfigError {
                var: "ALLOT_DEFAULT_LIMITER",
                value: v.clone(),
                reason: e.to_string(),
            })?;
            parsed.validate().map_err(|e| ConfigError {
                var: "ALLOT_DEFAULT_LIMITER",
                value: v.clone(),
                reason: e.to_string(),
            })?;
            settings.default_limiter = parsed;
        }
        if let Some(v) = lookup("ALLOT_METRICS_PORT") {
            let port = v.trim().parse::<u16>().map_err(|e| ConfigError {
                var: "ALLOT_METRICS_PORT",
                value: v.clone(),
                reason: e.to_string(),
            })?;
            settings.metrics_port = Some(port);
        }

        Ok(settings)
    }
}

fn parse_millis(var: &'static str, value: &str) -> Result<Duration, ConfigError> {
    match value.trim().parse::<u64>() {
        Ok(0) => Err(ConfigError {
            var,
            value: value.to_string(),
            reason: "must be greater than zero".into(),
        }),
        Ok(ms) => Ok(Duration::from_millis(ms)),
        Err(e) => Err(ConfigError {
            var,
            value: value.to_string(),
            reason: e.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let settings = Settings::from_lookup(lookup(&[])).unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.coordinator.lock_wait, Duration::from_secs(1));
        assert_eq!(settings.coordinator.holder_policy, HolderPolicy::Strict);
    }

    #[test]
    fn overrides_from_env() {
        let settings = Settings::from_lookup(lookup(&[
            ("ALLOT_LOCK_WAIT_MS", "250"),
            ("ALLOT_HOLD_TIMEOUT_MS", "5000"),
            ("ALLOT_HOLDER_POLICY", "Any"),
            (
                "ALLOT_DEFAULT_LIMITER",
                r#"{"algorithm":"fixed_window","max_requests":3,"window_ms":1000}"#,
            ),
            ("ALLOT_METRICS_PORT", "9100"),
        ]))
        .unwrap();

        assert_eq!(settings.coordinator.lock_wait, Duration::from_millis(250));
        assert_eq!(
            settings.coordinator.default_hold_timeout,
            Duration::from_secs(5)
        );
        assert_eq!(settings.coordinator.holder_policy, HolderPolicy::Any);
        assert_eq!(
            settings.default_limiter,
            LimiterConfig::FixedWindow {
                max_requests: 3,
                window_ms: 1000
            }
        );
        assert_eq!(settings.metrics_port, Some(9100));
    }

    #[test]
    fn rejects_bad_values() {
        let err = Settings::from_lookup(lookup(&[("ALLOT_LOCK_WAIT_MS", "0")])).unwrap_err();
        assert_eq!(err.var, "ALLOT_LOCK_WAIT_MS");

        let err = Settings::from_lookup(lookup(&[("ALLOT_HOLDER_POLICY", "owner")])).unwrap_err();
        assert_eq!(err.var, "ALLOT_HOLDER_POLICY");
        assert!(err.reason.contains("unknown variant"), "{}", err.reason);

        let err = Settings::from_lookup(lookup(&[(
            "ALLOT_DEFAULT_LIMITER",
            r#"{"algorithm":"token_bucket","capacity":0,"refill_per_sec":1.0}"#,
        )]))
        .unwrap_err();
        assert_eq!(err.var, "ALLOT_DEFAULT_LIMITER");
    }
}

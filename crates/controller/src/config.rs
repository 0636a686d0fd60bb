use std::str::FromStr;
use std::time::Duration;

use tender_queue::Backoff;

/// Runtime settings of the controller. Defaults can be overridden through `TENDER_*` env vars.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Concurrent reconciliations.
    pub workers: usize,
    /// Delay before re-checking a Memcached whose Deployment was just scaled.
    pub drift_cooldown: Duration,
    /// Deadline of one reconciliation.
    pub reconcile_timeout: Duration,
    /// Deadline of one store call.
    pub call_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Capacity of the notification channel between watchers and dispatcher.
    pub queue_cap: usize,
    /// Restrict watches to one namespace; `None` watches all.
    pub namespace: Option<String>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            drift_cooldown: Duration::from_secs(60),
            reconcile_timeout: Duration::from_secs(30),
            call_timeout: Duration::from_secs(10),
            backoff_base: Duration::from_millis(5),
            backoff_max: Duration::from_secs(300),
            queue_cap: 2048,
            namespace: None,
        }
    }
}

fn parse<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, var: &str) -> Option<T> {
    let raw = lookup(var)?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(var, value = %raw, "ignoring unparsable setting");
            None
        }
    }
}

impl ControllerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Build from an arbitrary variable source; unset or unparsable values keep their default,
    /// as do zero workers, capacity or backoff base.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        Self {
            workers: parse::<usize>(&lookup, "TENDER_WORKERS").filter(|n| *n > 0).unwrap_or(d.workers),
            drift_cooldown: parse(&lookup, "TENDER_DRIFT_COOLDOWN_SECS").map(Duration::from_secs).unwrap_or(d.drift_cooldown),
            reconcile_timeout: parse(&lookup, "TENDER_RECONCILE_TIMEOUT_SECS").map(Duration::from_secs).unwrap_or(d.reconcile_timeout),
            call_timeout: parse(&lookup, "TENDER_CALL_TIMEOUT_SECS").map(Duration::from_secs).unwrap_or(d.call_timeout),
            backoff_base: parse::<u64>(&lookup, "TENDER_BACKOFF_BASE_MS").filter(|n| *n > 0).map(Duration::from_millis).unwrap_or(d.backoff_base),
            backoff_max: parse(&lookup, "TENDER_BACKOFF_MAX_SECS").map(Duration::from_secs).unwrap_or(d.backoff_max),
            queue_cap: parse::<usize>(&lookup, "TENDER_QUEUE_CAP").filter(|n| *n > 0).unwrap_or(d.queue_cap),
            namespace: lookup("TENDER_NAMESPACE").filter(|s| !s.is_empty()),
        }
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.backoff_base, self.backoff_max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn unset_vars_keep_defaults() {
        assert_eq!(ControllerConfig::from_lookup(|_| None), ControllerConfig::default());
    }

    #[test]
    fn env_overrides_and_garbage_is_ignored() {
        let vars: HashMap<&str, &str> = [
            ("TENDER_WORKERS", "4"),
            ("TENDER_DRIFT_COOLDOWN_SECS", "5"),
            ("TENDER_BACKOFF_BASE_MS", "nope"),
            ("TENDER_QUEUE_CAP", "0"),
            ("TENDER_NAMESPACE", "prod"),
        ]
        .into_iter()
        .collect();
        let cfg = ControllerConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.workers, 4);
        assert_eq!(cfg.drift_cooldown, Duration::from_secs(5));
        assert_eq!(cfg.backoff_base, Duration::from_millis(5));
        assert_eq!(cfg.queue_cap, 2048);
        assert_eq!(cfg.namespace.as_deref(), Some("prod"));
    }

    #[test]
    fn zero_backoff_base_is_rejected() {
        let cfg = ControllerConfig::from_lookup(|k| (k == "TENDER_BACKOFF_BASE_MS").then(|| "0".to_string()));
        assert_eq!(cfg.backoff_base, Duration::from_millis(5));
        assert!(cfg.backoff().delay(1) > Duration::ZERO);
    }
}

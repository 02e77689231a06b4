use std::env;
use std::net::SocketAddr;
use std::time::Duration;

use crate::alerts::email::SmtpSettings;
use crate::alerts::Severity;
use crate::cache::CacheSettings;
use crate::cli::Cli;
use crate::health::HealthSettings;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub scheduler_enabled: bool,
    pub health: HealthSettings,
    pub cache: CacheSettings,
    pub cache_sweep_interval: Duration,
    /// UTC hour and minute of the daily data refresh.
    pub daily_update_at: (u32, u32),
    pub alerts: AlertSettings,
}

#[derive(Debug, Clone)]
pub struct AlertSettings {
    pub enabled: bool,
    pub level: Severity,
    pub slack_webhook_url: Option<String>,
    pub smtp: Option<SmtpSettings>,
    /// Upper bound on a single channel delivery.
    pub delivery_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key lookup. Unset and empty values fall back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let bind_addr = get("BIND_ADDR")
            .unwrap_or_else(|| "0.0.0.0:8080".to_string())
            .parse::<SocketAddr>()
            .map_err(|_| "BIND_ADDR must be a valid socket address")?;

        let interval_minutes = parse_or(
            get("HEALTH_CHECK_INTERVAL_MINUTES"),
            "HEALTH_CHECK_INTERVAL_MINUTES",
            30u64,
        )?;
        let health = HealthSettings {
            interval: interval_minutes
                .checked_mul(60)
                .map(Duration::from_secs)
                .ok_or("HEALTH_CHECK_INTERVAL_MINUTES is too large")?,
            overdue_threshold: hours(
                parse_or(get("JOB_OVERDUE_HOURS"), "JOB_OVERDUE_HOURS", 2.0)?,
                "JOB_OVERDUE_HOURS",
            )?,
            max_data_age: hours(
                parse_or(get("DAILY_UPDATE_MAX_AGE"), "DAILY_UPDATE_MAX_AGE", 25.0)?,
                "DAILY_UPDATE_MAX_AGE",
            )?,
        };

        let cache = CacheSettings {
            enabled: parse_bool(get("CACHE_ENABLED"), "CACHE_ENABLED", true)?,
            default_ttl: Duration::from_secs(parse_or(get("DB_CACHE_TTL"), "DB_CACHE_TTL", 60u64)?),
            max_entries: parse_or(get("DB_CACHE_SIZE_LIMIT"), "DB_CACHE_SIZE_LIMIT", 1000usize)?,
            slow_query_threshold: seconds(
                parse_or(get("SLOW_QUERY_THRESHOLD"), "SLOW_QUERY_THRESHOLD", 1.0)?,
                "SLOW_QUERY_THRESHOLD",
            )?,
        };
        if cache.max_entries == 0 {
            return Err("DB_CACHE_SIZE_LIMIT must be at least 1".to_string());
        }

        let cache_sweep_interval = Duration::from_secs(parse_or(
            get("CACHE_SWEEP_INTERVAL_SECONDS"),
            "CACHE_SWEEP_INTERVAL_SECONDS",
            300u64,
        )?);

        let daily_update_at = (
            parse_or(get("DAILY_UPDATE_HOUR"), "DAILY_UPDATE_HOUR", 1u32)?,
            parse_or(get("DAILY_UPDATE_MINUTE"), "DAILY_UPDATE_MINUTE", 0u32)?,
        );
        if daily_update_at.0 > 23 || daily_update_at.1 > 59 {
            return Err("DAILY_UPDATE_HOUR/DAILY_UPDATE_MINUTE out of range".to_string());
        }

        let level = match get("ALERT_LEVEL") {
            Some(raw) => raw.parse::<Severity>()?,
            None => Severity::Error,
        };

        let smtp = match (get("ALERT_EMAIL"), get("SMTP_SERVER")) {
            (Some(recipient), Some(server)) => Some(SmtpSettings {
                port: parse_or(get("SMTP_PORT"), "SMTP_PORT", 587u16)?,
                username: get("SMTP_USERNAME"),
                password: get("SMTP_PASSWORD"),
                from: get("SMTP_FROM_EMAIL").unwrap_or_else(|| recipient.clone()),
                server,
                recipient,
            }),
            _ => None,
        };

        let alerts = AlertSettings {
            enabled: parse_bool(get("ENABLE_ALERTS"), "ENABLE_ALERTS", true)?,
            level,
            slack_webhook_url: get("SLACK_WEBHOOK_URL"),
            smtp,
            delivery_timeout: seconds(
                parse_or(get("ALERT_TIMEOUT_SECONDS"), "ALERT_TIMEOUT_SECONDS", 10.0)?,
                "ALERT_TIMEOUT_SECONDS",
            )?,
        };

        Ok(Self {
            bind_addr,
            scheduler_enabled: parse_bool(get("SCHEDULER_ENABLED"), "SCHEDULER_ENABLED", true)?,
            health,
            cache,
            cache_sweep_interval,
            daily_update_at,
            alerts,
        })
    }

    /// CLI flags win over environment values.
    pub fn apply_cli(&mut self, cli: &Cli) -> Result<(), String> {
        if let Some(bind) = &cli.bind {
            self.bind_addr = bind
                .parse()
                .map_err(|_| format!("Invalid --bind address: {}", bind))?;
        }
        if let Some(level) = &cli.alert_level {
            self.alerts.level = level.parse()?;
        }
        if cli.no_scheduler {
            self.scheduler_enabled = false;
        }
        Ok(())
    }
}

fn parse_or<T: std::str::FromStr>(raw: Option<String>, key: &str, default: T) -> Result<T, String> {
    match raw {
        Some(value) => value
            .trim()
            .parse::<T>()
            .map_err(|_| format!("{} must be a valid number", key)),
        None => Ok(default),
    }
}

fn parse_bool(raw: Option<String>, key: &str, default: bool) -> Result<bool, String> {
    match raw.as_deref().map(|v| v.trim().to_ascii_lowercase()) {
        None => Ok(default),
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => Ok(true),
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => Ok(false),
        Some(_) => Err(format!("{} must be true or false", key)),
    }
}

fn seconds(value: f64, key: &str) -> Result<Duration, String> {
    Duration::try_from_secs_f64(value)
        .map_err(|_| format!("{} must be a finite, non-negative number", key))
}

fn hours(value: f64, key: &str) -> Result<Duration, String> {
    seconds(value * 3600.0, key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<Config, String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(move |key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let config = config_from(&[]).unwrap();

        assert_eq!(config.bind_addr.port(), 8080);
        assert!(config.scheduler_enabled);
        assert_eq!(config.health.interval, Duration::from_secs(1800));
        assert_eq!(config.health.overdue_threshold, Duration::from_secs(7200));
        assert_eq!(config.health.max_data_age, Duration::from_secs(25 * 3600));
        assert_eq!(config.cache.default_ttl, Duration::from_secs(60));
        assert_eq!(config.cache.max_entries, 1000);
        assert_eq!(config.daily_update_at, (1, 0));
        assert_eq!(config.alerts.level, Severity::Error);
        assert!(config.alerts.smtp.is_none());
        assert!(config.alerts.slack_webhook_url.is_none());
        assert_eq!(config.alerts.delivery_timeout, Duration::from_secs(10));
    }

    #[test]
    fn smtp_requires_recipient_and_server() {
        let config = config_from(&[("ALERT_EMAIL", "ops@example.com")]).unwrap();
        assert!(config.alerts.smtp.is_none());

        let config = config_from(&[
            ("ALERT_EMAIL", "ops@example.com"),
            ("SMTP_SERVER", "smtp.example.com"),
            ("SMTP_PORT", "2525"),
        ])
        .unwrap();
        let smtp = config.alerts.smtp.unwrap();
        assert_eq!(smtp.port, 2525);
        assert_eq!(smtp.from, "ops@example.com");
    }

    #[test]
    fn fractional_thresholds_are_accepted() {
        let config = config_from(&[("SLOW_QUERY_THRESHOLD", "0.25"), ("JOB_OVERDUE_HOURS", "1.5")])
            .unwrap();
        assert_eq!(config.cache.slow_query_threshold, Duration::from_millis(250));
        assert_eq!(config.health.overdue_threshold, Duration::from_secs(5400));
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(config_from(&[("DB_CACHE_TTL", "soon")]).is_err());
        assert!(config_from(&[("ALERT_LEVEL", "LOUD")]).is_err());
        assert!(config_from(&[("CACHE_ENABLED", "maybe")]).is_err());
        assert!(config_from(&[("DB_CACHE_SIZE_LIMIT", "0")]).is_err());
        assert!(config_from(&[("DAILY_UPDATE_HOUR", "24")]).is_err());
    }

    #[test]
    fn out_of_range_durations_are_errors_not_panics() {
        for (key, value) in [
            ("JOB_OVERDUE_HOURS", "inf"),
            ("DAILY_UPDATE_MAX_AGE", "1e30"),
            ("SLOW_QUERY_THRESHOLD", "-1"),
            ("SLOW_QUERY_THRESHOLD", "NaN"),
            ("ALERT_TIMEOUT_SECONDS", "1e300"),
            ("HEALTH_CHECK_INTERVAL_MINUTES", "18446744073709551615"),
        ] {
            let err = config_from(&[(key, value)]).unwrap_err();
            assert!(err.contains(key), "{} = {} gave {}", key, value, err);
        }
    }

    #[test]
    fn cli_overrides_env() {
        let mut config = config_from(&[("ALERT_LEVEL", "ERROR")]).unwrap();
        let cli = Cli {
            bind: Some("127.0.0.1:9000".to_string()),
            alert_level: Some("warning".to_string()),
            no_scheduler: true,
        };

        config.apply_cli(&cli).unwrap();

        assert_eq!(config.bind_addr.port(), 9000);
        assert_eq!(config.alerts.level, Severity::Warning);
        assert!(!config.scheduler_enabled);
    }
}

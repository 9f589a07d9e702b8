use std::path::PathBuf;

use tokio::time::Duration;

use crate::files::RetentionPolicy;

const DEFAULT_PORT: u16 = 5000;
const DEFAULT_YTDLP_PATH: &str = "yt-dlp";
const DEFAULT_YTDLP_TIMEOUT_SECONDS: u64 = 10 * 60;

/// Process configuration, read once from the environment at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub scratch_dir: PathBuf,
    pub ytdlp_path: String,
    pub ytdlp_timeout: Duration,
    pub max_file_age: Duration,
    pub sweep_interval: Duration,
    pub delete_grace: Duration,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = RetentionPolicy::default();
        let seconds = |name: &str, default: Duration| {
            read_u64(&lookup, name)
                .map(Duration::from_secs)
                .unwrap_or(default)
        };

        Self {
            bind_addr: resolve_bind_addr(&lookup),
            scratch_dir: lookup("SCRATCH_DIR")
                .and_then(|value| non_empty(&value).map(PathBuf::from))
                .unwrap_or_else(std::env::temp_dir),
            ytdlp_path: lookup("YTDLP_PATH")
                .and_then(|value| non_empty(&value).map(ToString::to_string))
                .unwrap_or_else(|| DEFAULT_YTDLP_PATH.to_string()),
            ytdlp_timeout: read_u64(&lookup, "YTDLP_TIMEOUT_SECONDS")
                .filter(|value| *value > 0)
                .map(Duration::from_secs)
                .unwrap_or(Duration::from_secs(DEFAULT_YTDLP_TIMEOUT_SECONDS)),
            max_file_age: seconds("MAX_FILE_AGE_SECONDS", defaults.max_file_age),
            sweep_interval: read_u64(&lookup, "SWEEP_INTERVAL_SECONDS")
                .filter(|value| *value > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.sweep_interval),
            delete_grace: seconds("DELETE_GRACE_SECONDS", defaults.delete_grace),
        }
    }

    pub fn retention(&self) -> RetentionPolicy {
        RetentionPolicy {
            max_file_age: self.max_file_age,
            sweep_interval: self.sweep_interval,
            delete_grace: self.delete_grace,
        }
    }
}

fn read_u64(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<u64> {
    lookup(name).and_then(|value| value.trim().parse::<u64>().ok())
}

fn resolve_bind_addr(lookup: &impl Fn(&str) -> Option<String>) -> String {
    if let Some(configured) =
        lookup("APP_ADDR").and_then(|value| non_empty(&value).map(ToString::to_string))
    {
        return configured;
    }

    let port = lookup("PORT")
        .and_then(|value| value.trim().parse::<u16>().ok())
        .unwrap_or(DEFAULT_PORT);
    format!("0.0.0.0:{port}")
}

fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> Config {
        let vars = vars
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect::<HashMap<_, _>>();
        Config::from_lookup(move |name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_match_service_contract() {
        let config = config(&[]);

        assert_eq!(config.bind_addr, "0.0.0.0:5000");
        assert_eq!(config.scratch_dir, std::env::temp_dir());
        assert_eq!(config.ytdlp_path, "yt-dlp");
        assert_eq!(config.retention(), RetentionPolicy::default());
        assert_eq!(config.max_file_age, Duration::from_secs(3600));
        assert_eq!(config.delete_grace, Duration::from_secs(60));
    }

    #[test]
    fn port_selects_wildcard_listener() {
        assert_eq!(config(&[("PORT", " 8080 ")]).bind_addr, "0.0.0.0:8080");
        assert_eq!(config(&[("PORT", "nope")]).bind_addr, "0.0.0.0:5000");
    }

    #[test]
    fn app_addr_overrides_port() {
        let config = config(&[("PORT", "8080"), ("APP_ADDR", "127.0.0.1:9000")]);
        assert_eq!(config.bind_addr, "127.0.0.1:9000");
    }

    #[test]
    fn retention_overrides() {
        let config = config(&[
            ("MAX_FILE_AGE_SECONDS", "120"),
            ("SWEEP_INTERVAL_SECONDS", "0"),
            ("DELETE_GRACE_SECONDS", "5"),
            ("SCRATCH_DIR", "/var/tmp/vidget"),
        ]);

        assert_eq!(config.max_file_age, Duration::from_secs(120));
        assert_eq!(config.sweep_interval, Duration::from_secs(600));
        assert_eq!(config.delete_grace, Duration::from_secs(5));
        assert_eq!(config.scratch_dir, PathBuf::from("/var/tmp/vidget"));
    }
}

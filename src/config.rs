//! Process configuration loaded from `REPAIRDESK_*` environment variables.
//!
//! Every key has a default; a missing key is logged and defaulted, an
//! unparsable one is an error.

use std::{env, fmt::Display, path::PathBuf, str::FromStr};

use tracing::{info, warn};

const ENV_PREFIX: &str = "REPAIRDESK_";

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub log_dir: PathBuf,
    pub export_dir: PathBuf,
    pub allow_signup: bool,
    pub sms_gateway_url: String,
    pub sms_api_key: String,
    pub sms_api_secret: String,
    pub sms_sender_id: String,
    pub worker_interval_secs: u64,
    pub sms_max_attempts: i64,
    pub cors_origins: Vec<String>,
}

impl Config {
    pub fn load() -> Result<Self, String> {
        let data_dir: PathBuf = try_load::<String>("DATA_DIR", "./data")?.into();
        let log_dir = optional("LOG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("logs"));
        let export_dir = optional("EXPORT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("exports"));

        let worker_interval_secs: u64 = try_load("WORKER_INTERVAL_SECS", "10")?;
        if worker_interval_secs == 0 {
            return Err(format!("{ENV_PREFIX}WORKER_INTERVAL_SECS must be at least 1"));
        }
        let sms_max_attempts: i64 = try_load("SMS_MAX_ATTEMPTS", "3")?;
        if !(1..=20).contains(&sms_max_attempts) {
            return Err(format!("{ENV_PREFIX}SMS_MAX_ATTEMPTS must be between 1 and 20"));
        }

        let cors_origins = optional("CORS_ORIGINS")
            .map(|raw| {
                raw.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            host: try_load("HOST", "0.0.0.0")?,
            port: try_load("PORT", "8080")?,
            data_dir,
            log_dir,
            export_dir,
            allow_signup: parse_bool(&try_load::<String>("ALLOW_SIGNUP", "true")?)
                .ok_or_else(|| format!("{ENV_PREFIX}ALLOW_SIGNUP must be a boolean"))?,
            sms_gateway_url: optional("SMS_GATEWAY_URL").unwrap_or_default(),
            sms_api_key: optional("SMS_API_KEY").unwrap_or_default(),
            sms_api_secret: optional("SMS_API_SECRET").unwrap_or_default(),
            sms_sender_id: try_load("SMS_SENDER_ID", "RepairDesk")?,
            worker_interval_secs,
            sms_max_attempts,
            cors_origins,
        })
    }

    /// Configuration for tests: everything under `data_dir`, signup open,
    /// log-only SMS delivery.
    #[cfg(test)]
    pub fn for_data_dir(data_dir: PathBuf) -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            log_dir: data_dir.join("logs"),
            export_dir: data_dir.join("exports"),
            data_dir,
            allow_signup: true,
            sms_gateway_url: String::new(),
            sms_api_key: String::new(),
            sms_api_secret: String::new(),
            sms_sender_id: "RepairDesk".into(),
            worker_interval_secs: 10,
            sms_max_attempts: 3,
            cors_origins: Vec::new(),
        }
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn var(key: &str) -> Option<String> {
    env::var(format!("{ENV_PREFIX}{key}"))
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn optional(key: &str) -> Option<String> {
    var(key)
}

fn try_load<T: FromStr>(key: &str, default: &str) -> Result<T, String>
where
    T::Err: Display,
{
    var(key)
        .unwrap_or_else(|| {
            info!("{ENV_PREFIX}{key} not set, using default: {default}");
            default.to_string()
        })
        .parse()
        .map_err(|e| {
            warn!("Invalid {ENV_PREFIX}{key} value: {e}");
            format!("invalid {ENV_PREFIX}{key}: {e}")
        })
}

pub(crate) fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for key in [
            "HOST",
            "PORT",
            "DATA_DIR",
            "LOG_DIR",
            "EXPORT_DIR",
            "ALLOW_SIGNUP",
            "SMS_GATEWAY_URL",
            "WORKER_INTERVAL_SECS",
            "SMS_MAX_ATTEMPTS",
            "CORS_ORIGINS",
        ] {
            env::remove_var(format!("{ENV_PREFIX}{key}"));
        }
    }

    #[test]
    #[serial]
    fn defaults_apply_when_unset() {
        clear_env();
        let config = Config::load().expect("defaults should load");
        assert_eq!(config.port, 8080);
        assert_eq!(config.bind_address(), "0.0.0.0:8080");
        assert!(config.allow_signup);
        assert_eq!(config.log_dir, PathBuf::from("./data").join("logs"));
        assert!(config.sms_gateway_url.is_empty());
        assert!(config.cors_origins.is_empty());
    }

    #[test]
    #[serial]
    fn overrides_are_parsed() {
        clear_env();
        env::set_var("REPAIRDESK_PORT", "9090");
        env::set_var("REPAIRDESK_ALLOW_SIGNUP", "off");
        env::set_var("REPAIRDESK_CORS_ORIGINS", "https://a.example, https://b.example");
        let config = Config::load().expect("overrides should load");
        assert_eq!(config.port, 9090);
        assert!(!config.allow_signup);
        assert_eq!(config.cors_origins.len(), 2);
        clear_env();
    }

    #[test]
    #[serial]
    fn invalid_values_are_errors() {
        clear_env();
        env::set_var("REPAIRDESK_PORT", "not-a-port");
        assert!(Config::load().is_err());
        clear_env();
        env::set_var("REPAIRDESK_WORKER_INTERVAL_SECS", "0");
        assert!(Config::load().is_err());
        clear_env();
    }

    #[test]
    fn parse_bool_accepts_common_forms() {
        assert_eq!(parse_bool("Yes"), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }
}

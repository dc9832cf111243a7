//! API server configuration

use std::env;

pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8080";
pub const DEFAULT_LINE_API_BASE: &str = "https://api.line.me";
pub const DEFAULT_DIFY_API_URL: &str = "https://api.dify.ai/v1";
pub const DEFAULT_ALLOWED_ORIGINS: &str = "http://localhost:3000,http://127.0.0.1:3000";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_address: String,
    pub line_channel_secret: String,
    pub line_channel_access_token: String,
    pub line_api_base: String,
    pub dify_api_url: String,
    pub dify_api_key: String,
    /// Landing page opened by the plan buttons; receives `?plan=monthly|yearly`
    pub upgrade_page_url: String,
    pub allowed_origins: Vec<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            database_url: required("DATABASE_URL")?,
            bind_address: optional("BIND_ADDRESS", DEFAULT_BIND_ADDRESS),
            line_channel_secret: required("LINE_CHANNEL_SECRET")?,
            line_channel_access_token: required("LINE_CHANNEL_ACCESS_TOKEN")?,
            line_api_base: trim_url(optional("LINE_API_BASE", DEFAULT_LINE_API_BASE)),
            dify_api_url: trim_url(optional("DIFY_API_URL", DEFAULT_DIFY_API_URL)),
            dify_api_key: required("DIFY_API_KEY")?,
            upgrade_page_url: required("UPGRADE_PAGE_URL")?,
            allowed_origins: optional("ALLOWED_ORIGINS", DEFAULT_ALLOWED_ORIGINS)
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        })
    }
}

fn required(key: &'static str) -> Result<String, ConfigError> {
    env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or(ConfigError::Missing(key))
}

fn optional(key: &str, default: &str) -> String {
    env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn trim_url(url: String) -> String {
    url.trim_end_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const KEYS: [&str; 9] = [
        "DATABASE_URL",
        "BIND_ADDRESS",
        "LINE_CHANNEL_SECRET",
        "LINE_CHANNEL_ACCESS_TOKEN",
        "LINE_API_BASE",
        "DIFY_API_URL",
        "DIFY_API_KEY",
        "UPGRADE_PAGE_URL",
        "ALLOWED_ORIGINS",
    ];

    fn clear() {
        for key in KEYS {
            env::remove_var(key);
        }
    }

    fn set_required() {
        env::set_var("DATABASE_URL", "postgres://localhost/quotagate");
        env::set_var("LINE_CHANNEL_SECRET", "line-secret");
        env::set_var("LINE_CHANNEL_ACCESS_TOKEN", "line-token");
        env::set_var("DIFY_API_KEY", "app-key");
        env::set_var("UPGRADE_PAGE_URL", "https://liff.line.me/123-abc");
    }

    #[test]
    #[serial]
    fn test_defaults_applied() {
        clear();
        set_required();

        let config = Config::from_env().unwrap();
        assert_eq!(config.bind_address, DEFAULT_BIND_ADDRESS);
        assert_eq!(config.line_api_base, DEFAULT_LINE_API_BASE);
        assert_eq!(config.dify_api_url, DEFAULT_DIFY_API_URL);
        assert_eq!(config.allowed_origins.len(), 2);
        clear();
    }

    #[test]
    #[serial]
    fn test_missing_secret_rejected() {
        clear();
        set_required();
        env::remove_var("LINE_CHANNEL_SECRET");

        let err = Config::from_env().unwrap_err();
        assert_eq!(err.to_string(), "LINE_CHANNEL_SECRET must be set");
        clear();
    }

    #[test]
    #[serial]
    fn test_urls_trimmed_and_origins_split() {
        clear();
        set_required();
        env::set_var("DIFY_API_URL", "https://dify.internal/v1/");
        env::set_var("ALLOWED_ORIGINS", "https://a.example, ,https://b.example");

        let config = Config::from_env().unwrap();
        assert_eq!(config.dify_api_url, "https://dify.internal/v1");
        assert_eq!(
            config.allowed_origins,
            vec!["https://a.example".to_string(), "https://b.example".to_string()]
        );
        clear();
    }
}

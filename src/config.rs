//! Environment-driven service configuration, read once at startup.

use std::env;
use std::time::Duration;

use thiserror::Error;

const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1:8080";
const DEFAULT_COMPLETIONS_API_BASE: &str = "https://api.openai.com/v1";
const DEFAULT_CHAT_MODEL: &str = "llama-3.3-70b";
const DEFAULT_TITLE_MODEL: &str = "llama-3.3-70b";
const DEFAULT_STREAM_TTL_SECS: u64 = 300;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingVar(&'static str),
    #[error("invalid value for environment variable {0}")]
    InvalidVar(&'static str),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_address: String,
    pub database_url: String,
    pub jwt_secret: String,
    pub completions_api_base: String,
    pub completions_api_key: String,
    pub chat_model: String,
    pub title_model: String,
    /// Age past which a registered stream is considered abandoned.
    pub stream_ttl: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let stream_ttl_secs = match env::var("STREAM_TTL_SECS") {
            Ok(raw) => raw
                .parse::<u64>()
                .map_err(|_| ConfigError::InvalidVar("STREAM_TTL_SECS"))?,
            Err(_) => DEFAULT_STREAM_TTL_SECS,
        };

        Ok(Config {
            bind_address: env::var("BIND_ADDRESS")
                .unwrap_or_else(|_| DEFAULT_BIND_ADDRESS.to_string()),
            database_url: require("DATABASE_URL")?,
            jwt_secret: require("JWT_SECRET")?,
            completions_api_base: env::var("COMPLETIONS_API_BASE")
                .unwrap_or_else(|_| DEFAULT_COMPLETIONS_API_BASE.to_string()),
            completions_api_key: require("COMPLETIONS_API_KEY")?,
            chat_model: env::var("CHAT_MODEL").unwrap_or_else(|_| DEFAULT_CHAT_MODEL.to_string()),
            title_model: env::var("TITLE_MODEL")
                .unwrap_or_else(|_| DEFAULT_TITLE_MODEL.to_string()),
            stream_ttl: Duration::from_secs(stream_ttl_secs),
        })
    }
}

fn require(name: &'static str) -> Result<String, ConfigError> {
    env::var(name).map_err(|_| ConfigError::MissingVar(name))
}

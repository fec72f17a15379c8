use crate::{env_optional, env_or_default, env_parse, env_required, ConfigError, FromEnv};

/// Redis configuration used by the lifecycle event stream
#[derive(Clone, Debug)]
pub struct RedisConfig {
    pub url: String,
    pub stream_name: String,
    pub max_stream_length: usize,
}

impl RedisConfig {
    pub fn new(url: String) -> Self {
        Self {
            url,
            stream_name: "notifications:events".to_string(),
            max_stream_length: 100_000,
        }
    }

    /// `None` when REDIS_URL is not set
    pub fn from_env_optional() -> Result<Option<Self>, ConfigError> {
        match env_optional("REDIS_URL") {
            Some(_) => Self::from_env().map(Some),
            None => Ok(None),
        }
    }
}

impl FromEnv for RedisConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            url: env_required("REDIS_URL")?,
            stream_name: env_or_default("NOTIFY_EVENT_STREAM", "notifications:events"),
            max_stream_length: env_parse("NOTIFY_EVENT_STREAM_MAXLEN", 100_000)?,
        })
    }
}

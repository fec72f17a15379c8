use crate::{env_optional, env_parse, env_required, ConfigError, FromEnv};

/// Database configuration
#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl DatabaseConfig {
    pub fn new(url: String) -> Self {
        Self {
            url,
            max_connections: 10,
        }
    }

    /// `None` when DATABASE_URL is not set, so callers can fall back to an
    /// in-process store.
    pub fn from_env_optional() -> Result<Option<Self>, ConfigError> {
        match env_optional("DATABASE_URL") {
            Some(_) => Self::from_env().map(Some),
            None => Ok(None),
        }
    }
}

impl FromEnv for DatabaseConfig {
    /// Requires DATABASE_URL to be set (no default)
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            url: env_required("DATABASE_URL")?,
            max_connections: env_parse("DATABASE_MAX_CONNECTIONS", 10)?,
        })
    }
}

pub mod database;
pub mod redis;
pub mod server;
pub mod tracing;

use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Configuration error type
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Environment variable '{0}' is required but not set")]
    MissingEnvVar(String),

    #[error("Failed to parse environment variable '{key}': {details}")]
    ParseError { key: String, details: String },
}

/// Application environment (dev = local/kind, prod = full k8s)
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    pub fn from_env() -> Self {
        let app_env = env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        if app_env.eq_ignore_ascii_case("production") {
            Environment::Production
        } else {
            Environment::Development
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, Environment::Production)
    }

    pub fn is_development(&self) -> bool {
        matches!(self, Environment::Development)
    }
}

/// Trait for configuration that can be loaded from environment variables
pub trait FromEnv: Sized {
    fn from_env() -> Result<Self, ConfigError>;
}

/// Helper to load environment variable with a default value
pub fn env_or_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Helper to load environment variable or return error
pub fn env_required(key: &str) -> Result<String, ConfigError> {
    env::var(key).map_err(|_| ConfigError::MissingEnvVar(key.to_string()))
}

/// Optional environment variable. Empty values count as unset.
pub fn env_optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Parse an environment variable into `T`, falling back to `default` when unset.
///
/// A value that is set but fails to parse is an error, never silently replaced
/// by the default.
pub fn env_parse<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env_optional(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::ParseError {
            key: key.to_string(),
            details: e.to_string(),
        }),
        None => Ok(default),
    }
}

/// Duration given in milliseconds
pub fn env_duration_ms(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    let millis = env_parse(key, default.as_millis() as u64)?;
    Ok(Duration::from_millis(millis))
}

/// Duration given in whole seconds
pub fn env_duration_secs(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    let secs = env_parse(key, default.as_secs())?;
    Ok(Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_defaults_to_development() {
        temp_env::with_var_unset("APP_ENV", || {
            let env = Environment::from_env();
            assert_eq!(env, Environment::Development);
            assert!(env.is_development());
            assert!(!env.is_production());
        });
    }

    #[test]
    fn test_environment_production_case_insensitive() {
        temp_env::with_var("APP_ENV", Some("PRODUCTION"), || {
            assert_eq!(Environment::from_env(), Environment::Production);
        });

        temp_env::with_var("APP_ENV", Some("Production"), || {
            assert_eq!(Environment::from_env(), Environment::Production);
        });
    }

    #[test]
    fn test_environment_unknown_defaults_to_development() {
        temp_env::with_var("APP_ENV", Some("staging"), || {
            assert_eq!(Environment::from_env(), Environment::Development);
        });
    }

    #[test]
    fn test_env_or_default() {
        temp_env::with_var("TEST_VAR", Some("test_value"), || {
            assert_eq!(env_or_default("TEST_VAR", "default"), "test_value");
        });
        temp_env::with_var_unset("MISSING_VAR", || {
            assert_eq!(env_or_default("MISSING_VAR", "default_value"), "default_value");
        });
    }

    #[test]
    fn test_env_required_missing() {
        temp_env::with_var_unset("MISSING_REQUIRED", || {
            let err = env_required("MISSING_REQUIRED").unwrap_err();
            assert!(err.to_string().contains("MISSING_REQUIRED"));
            assert!(err.to_string().contains("required"));
        });
    }

    #[test]
    fn test_env_optional_treats_blank_as_unset() {
        temp_env::with_var("BLANK_VAR", Some("   "), || {
            assert_eq!(env_optional("BLANK_VAR"), None);
        });
        temp_env::with_var("SET_VAR", Some("x"), || {
            assert_eq!(env_optional("SET_VAR").as_deref(), Some("x"));
        });
    }

    #[test]
    fn test_env_parse_default_and_value() {
        temp_env::with_var_unset("PARSE_VAR", || {
            assert_eq!(env_parse::<u32>("PARSE_VAR", 7).unwrap(), 7);
        });
        temp_env::with_var("PARSE_VAR", Some(" 42 "), || {
            assert_eq!(env_parse::<u32>("PARSE_VAR", 7).unwrap(), 42);
        });
        temp_env::with_var("PARSE_VAR", Some("2.5"), || {
            assert_eq!(env_parse::<f64>("PARSE_VAR", 1.0).unwrap(), 2.5);
        });
    }

    #[test]
    fn test_env_parse_invalid_is_error() {
        temp_env::with_var("PARSE_VAR", Some("many"), || {
            let err = env_parse::<u32>("PARSE_VAR", 7).unwrap_err();
            assert!(matches!(err, ConfigError::ParseError { ref key, .. } if key == "PARSE_VAR"));
        });
    }

    #[test]
    fn test_env_durations() {
        temp_env::with_vars(
            [("TIMEOUT_MS", Some("250")), ("WINDOW_SECS", None::<&str>)],
            || {
                assert_eq!(
                    env_duration_ms("TIMEOUT_MS", Duration::from_secs(1)).unwrap(),
                    Duration::from_millis(250)
                );
                assert_eq!(
                    env_duration_secs("WINDOW_SECS", Duration::from_secs(60)).unwrap(),
                    Duration::from_secs(60)
                );
            },
        );
    }
}

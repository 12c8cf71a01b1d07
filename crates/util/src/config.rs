use std::{env, fmt, net::SocketAddr};

use url::Url;

use super::{database_url, server_bind_address};

/// Application runtime environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
    Test,
}

impl Environment {
    fn from_str(value: &str) -> Result<Self, ConfigError> {
        match value {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            "test" => Ok(Self::Test),
            other => Err(ConfigError::InvalidEnvironment(other.to_string())),
        }
    }

    /// Returns `true` when the current environment should behave as development.
    pub fn is_development(self) -> bool {
        matches!(self, Self::Development)
    }

    /// Returns the canonical name used for logging/metrics labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Test => "test",
        }
    }
}

/// Runtime configuration resolved from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub environment: Environment,
    pub database_url: String,
    pub mail: MailConfig,
}

/// Settings for the outbound mail API.
#[derive(Debug, Clone)]
pub struct MailConfig {
    pub base_url: Url,
    pub api_key: String,
    pub from_address: String,
}

impl AppConfig {
    /// Constructs the configuration by reading and validating environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let env_value = env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());
        let environment = Environment::from_str(&env_value)?;
        let bind_addr = server_bind_address().map_err(ConfigError::BindAddress)?;
        let database_url = database_url();
        let mail = MailConfig::from_env()?;

        Ok(Self {
            bind_addr,
            environment,
            database_url,
            mail,
        })
    }
}

impl MailConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let raw_base = require_var("MAIL_API_BASE_URL")?;
        let base_url = Url::parse(&raw_base).map_err(ConfigError::MailBaseUrl)?;
        let api_key = require_var("MAIL_API_KEY")?;
        let from_address = require_var("MAIL_FROM_ADDRESS")?;

        Ok(Self {
            base_url,
            api_key,
            from_address,
        })
    }
}

fn require_var(name: &'static str) -> Result<String, ConfigError> {
    match env::var(name) {
        Ok(value) if !value.is_empty() => Ok(value),
        _ => Err(ConfigError::MissingVariable(name)),
    }
}

/// Errors that can occur during configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    InvalidEnvironment(String),
    BindAddress(std::net::AddrParseError),
    MissingVariable(&'static str),
    MailBaseUrl(url::ParseError),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEnvironment(value) => write!(
                f,
                "APP_ENV must be one of 'development', 'production', or 'test' (got {value})"
            ),
            Self::BindAddress(err) => write!(f, "invalid APP_BIND_ADDR value: {err}"),
            Self::MissingVariable(name) => write!(f, "required variable {name} is not set"),
            Self::MailBaseUrl(err) => write!(f, "invalid MAIL_API_BASE_URL value: {err}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DEFAULT_BIND_ADDR;
    use std::sync::{LazyLock, Mutex};

    static ENV_GUARD: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    fn set_mail_vars() {
        env::set_var("MAIL_API_BASE_URL", "https://mail.example.com/v1/");
        env::set_var("MAIL_API_KEY", "key");
        env::set_var("MAIL_FROM_ADDRESS", "club@example.com");
    }

    fn clear_vars() {
        for name in [
            "APP_ENV",
            "APP_BIND_ADDR",
            "DATABASE_URL",
            "MAIL_API_BASE_URL",
            "MAIL_API_KEY",
            "MAIL_FROM_ADDRESS",
        ] {
            env::remove_var(name);
        }
    }

    #[test]
    fn loads_defaults_in_development() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_vars();
        set_mail_vars();

        let config = AppConfig::from_env().expect("config should load with defaults");
        assert_eq!(config.environment, Environment::Development);
        assert_eq!(config.bind_addr.to_string(), DEFAULT_BIND_ADDR);
        assert_eq!(config.mail.from_address, "club@example.com");

        clear_vars();
    }

    #[test]
    fn rejects_invalid_environment() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_vars();
        set_mail_vars();
        env::set_var("APP_ENV", "invalid");

        let err = AppConfig::from_env().expect_err("invalid env should error");
        assert!(matches!(err, ConfigError::InvalidEnvironment(value) if value == "invalid"));

        clear_vars();
    }

    #[test]
    fn requires_mail_variables() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_vars();

        let err = AppConfig::from_env().expect_err("missing mail vars should error");
        assert!(matches!(
            err,
            ConfigError::MissingVariable("MAIL_API_BASE_URL")
        ));

        clear_vars();
    }

    #[test]
    fn parses_production_environment() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_vars();
        set_mail_vars();
        env::set_var("APP_ENV", "production");
        env::set_var("APP_BIND_ADDR", "0.0.0.0:9000");

        let config = AppConfig::from_env().expect("config should load");
        assert_eq!(config.environment, Environment::Production);
        assert_eq!(config.bind_addr.to_string(), "0.0.0.0:9000");

        clear_vars();
    }
}

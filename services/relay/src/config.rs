use std::net::SocketAddr;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Where hardware button edges come from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ButtonSource {
    /// No button attached; clients drive presses themselves.
    None,
    /// Pressed/released levels read line by line from standard input.
    Stdin,
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub dialogue_base_url: String,
    pub dialogue_project_id: String,
    pub dialogue_api_key: String,
    pub default_user_id: String,
    pub button_source: ButtonSource,
    pub log_level: Level,
}

const DEFAULT_DIALOGUE_BASE_URL: &str = "https://general-runtime.voiceflow.com";

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let bind_address_str =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3001".to_string());
        let bind_address = bind_address_str
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidValue("BIND_ADDRESS".to_string(), e.to_string()))?;

        let dialogue_api_key = required_var("DIALOGUE_API_KEY")?;
        let dialogue_project_id = required_var("DIALOGUE_PROJECT_ID")?;
        let dialogue_base_url = std::env::var("DIALOGUE_BASE_URL")
            .unwrap_or_else(|_| DEFAULT_DIALOGUE_BASE_URL.to_string());
        if !dialogue_base_url.starts_with("http://") && !dialogue_base_url.starts_with("https://")
        {
            return Err(ConfigError::InvalidValue(
                "DIALOGUE_BASE_URL".to_string(),
                format!("'{}' is not an http(s) URL", dialogue_base_url),
            ));
        }

        let default_user_id =
            std::env::var("DEFAULT_USER_ID").unwrap_or_else(|_| "voxrelay".to_string());

        let button_source_str =
            std::env::var("BUTTON_SOURCE").unwrap_or_else(|_| "none".to_string());
        let button_source = match button_source_str.to_lowercase().as_str() {
            "none" | "" => ButtonSource::None,
            "stdin" => ButtonSource::Stdin,
            other => {
                return Err(ConfigError::InvalidValue(
                    "BUTTON_SOURCE".to_string(),
                    format!("'{}' is not one of: none, stdin", other),
                ));
            }
        };

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            bind_address,
            dialogue_base_url,
            dialogue_project_id,
            dialogue_api_key,
            default_user_id,
            button_source,
            log_level,
        })
    }
}

fn required_var(name: &str) -> Result<String, ConfigError> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| ConfigError::MissingVar(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    fn clear_env_vars() {
        unsafe {
            env::remove_var("BIND_ADDRESS");
            env::remove_var("DIALOGUE_API_KEY");
            env::remove_var("DIALOGUE_PROJECT_ID");
            env::remove_var("DIALOGUE_BASE_URL");
            env::remove_var("DEFAULT_USER_ID");
            env::remove_var("BUTTON_SOURCE");
            env::remove_var("RUST_LOG");
        }
    }

    fn set_minimal_env() {
        unsafe {
            env::set_var("DIALOGUE_API_KEY", "VF.DM.test-key");
            env::set_var("DIALOGUE_PROJECT_ID", "proj-123");
        }
    }

    #[test]
    fn test_config_error_display() {
        let missing_var = ConfigError::MissingVar("TEST_VAR".to_string());
        assert_eq!(
            format!("{}", missing_var),
            "Missing environment variable: TEST_VAR"
        );

        let invalid_value =
            ConfigError::InvalidValue("TEST_VAR".to_string(), "bad_value".to_string());
        assert_eq!(
            format!("{}", invalid_value),
            "Invalid value for environment variable TEST_VAR: bad_value"
        );
    }

    #[test]
    #[serial]
    fn test_config_from_env_minimal() {
        clear_env_vars();
        set_minimal_env();

        let config = Config::from_env().expect("Config should load successfully");

        assert_eq!(config.bind_address.to_string(), "0.0.0.0:3001");
        assert_eq!(config.dialogue_api_key, "VF.DM.test-key");
        assert_eq!(config.dialogue_project_id, "proj-123");
        assert_eq!(config.dialogue_base_url, DEFAULT_DIALOGUE_BASE_URL);
        assert_eq!(config.default_user_id, "voxrelay");
        assert_eq!(config.button_source, ButtonSource::None);
        assert_eq!(config.log_level, Level::INFO);
    }

    #[test]
    #[serial]
    fn test_config_from_env_custom_values() {
        clear_env_vars();
        set_minimal_env();
        unsafe {
            env::set_var("BIND_ADDRESS", "127.0.0.1:8080");
            env::set_var("DIALOGUE_BASE_URL", "http://localhost:9000");
            env::set_var("DEFAULT_USER_ID", "lobby-kiosk");
            env::set_var("BUTTON_SOURCE", "STDIN");
            env::set_var("RUST_LOG", "debug");
        }

        let config = Config::from_env().expect("Config should load successfully");

        assert_eq!(config.bind_address.to_string(), "127.0.0.1:8080");
        assert_eq!(config.dialogue_base_url, "http://localhost:9000");
        assert_eq!(config.default_user_id, "lobby-kiosk");
        assert_eq!(config.button_source, ButtonSource::Stdin);
        assert_eq!(config.log_level, Level::DEBUG);
    }

    #[test]
    #[serial]
    fn test_config_missing_api_key() {
        clear_env_vars();
        unsafe {
            env::set_var("DIALOGUE_PROJECT_ID", "proj-123");
        }

        let err = Config::from_env().unwrap_err();
        match err {
            ConfigError::MissingVar(var) => assert_eq!(var, "DIALOGUE_API_KEY"),
            _ => panic!("Expected MissingVar for DIALOGUE_API_KEY"),
        }
    }

    #[test]
    #[serial]
    fn test_config_missing_project_id() {
        clear_env_vars();
        unsafe {
            env::set_var("DIALOGUE_API_KEY", "VF.DM.test-key");
        }

        let err = Config::from_env().unwrap_err();
        match err {
            ConfigError::MissingVar(var) => assert_eq!(var, "DIALOGUE_PROJECT_ID"),
            _ => panic!("Expected MissingVar for DIALOGUE_PROJECT_ID"),
        }
    }

    #[test]
    #[serial]
    fn test_config_invalid_values() {
        for (var, value) in [
            ("BIND_ADDRESS", "not-a-valid-address"),
            ("DIALOGUE_BASE_URL", "ftp://runtime"),
            ("BUTTON_SOURCE", "hid"),
            ("RUST_LOG", "not-a-level"),
        ] {
            clear_env_vars();
            set_minimal_env();
            unsafe {
                env::set_var(var, value);
            }

            match Config::from_env().unwrap_err() {
                ConfigError::InvalidValue(name, _) => assert_eq!(name, var),
                other => panic!("Expected InvalidValue for {var}, got {other:?}"),
            }
        }
    }
}

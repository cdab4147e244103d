use std::path::PathBuf;

/// CLI configuration loaded from environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Directory holding `user_settings.json`
    pub data_dir: PathBuf,
    /// Write indented JSON instead of a single line
    pub pretty: bool,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Optional environment variables:
    /// - `SAFE_STORE_DATA_DIR`: base directory (supports ~ for home directory),
    ///   defaults to the platform data directory plus `safe-store`
    /// - `SAFE_STORE_PRETTY`: `1`/`true`/`yes` for pretty JSON
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let data_dir = match lookup("SAFE_STORE_DATA_DIR") {
            Some(dir) if !dir.trim().is_empty() => expand_tilde(dir.trim()),
            _ => dirs::data_dir()
                .map(|dir| dir.join("safe-store"))
                .ok_or(ConfigError::NoDataDir)?,
        };

        let pretty = match lookup("SAFE_STORE_PRETTY") {
            Some(value) => parse_flag(&value)?,
            None => false,
        };

        Ok(Self { data_dir, pretty })
    }
}

fn parse_flag(value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "" | "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidFlag {
            name: "SAFE_STORE_PRETTY",
            value: value.to_string(),
        }),
    }
}

/// Expand ~ or ~/ prefix to the user's home directory.
fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" {
        dirs::home_dir().unwrap_or_else(|| PathBuf::from("~"))
    } else if let Some(rest) = path.strip_prefix("~/") {
        dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(path))
    } else {
        PathBuf::from(path)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("No platform data directory; set SAFE_STORE_DATA_DIR")]
    NoDataDir,

    #[error("{name} must be a boolean, got '{value}'")]
    InvalidFlag { name: &'static str, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_explicit_data_dir() {
        let config = Config::from_lookup(lookup(&[
            ("SAFE_STORE_DATA_DIR", "/srv/store"),
            ("SAFE_STORE_PRETTY", "true"),
        ]))
        .unwrap();

        assert_eq!(config.data_dir, PathBuf::from("/srv/store"));
        assert!(config.pretty);
    }

    #[test]
    fn test_tilde_expansion() {
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_tilde("~"), home);
            assert_eq!(expand_tilde("~/store"), home.join("store"));
        }
        assert_eq!(expand_tilde("/abs/path"), PathBuf::from("/abs/path"));
        assert_eq!(expand_tilde("rel~/x"), PathBuf::from("rel~/x"));
    }

    #[test]
    fn test_pretty_flag_parsing() {
        assert!(parse_flag("1").unwrap());
        assert!(parse_flag(" YES ").unwrap());
        assert!(!parse_flag("off").unwrap());
        assert!(matches!(
            parse_flag("sometimes"),
            Err(ConfigError::InvalidFlag { .. })
        ));
    }

    #[test]
    fn test_defaults_without_env() {
        match Config::from_lookup(lookup(&[])) {
            Ok(config) => {
                assert!(config.data_dir.ends_with("safe-store"));
                assert!(!config.pretty);
            }
            Err(e) => assert!(matches!(e, ConfigError::NoDataDir)),
        }
    }
}

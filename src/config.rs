use crate::core::{DbDataError, Result};
use serde::Deserialize;
use std::fmt;
use std::fs;
use std::path::Path;

/// Settings consumed when a data access object is constructed.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DbDataSettings {
    /// Whether failures are logged before they are returned
    pub allow_exception_logging: bool,
    /// Connection string to start with, if any
    pub connection_string: Option<String>,
}

impl Default for DbDataSettings {
    fn default() -> Self {
        DbDataSettings {
            allow_exception_logging: true,
            connection_string: None,
        }
    }
}

impl DbDataSettings {
    /// Parses settings from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| DbDataError::Config(e.to_string()))
    }
}

impl fmt::Debug for DbDataSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbDataSettings")
            .field("allow_exception_logging", &self.allow_exception_logging)
            .field(
                "connection_string",
                &self.connection_string.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

/// Loads settings from a TOML file at the given path.
///
/// # Arguments
///
/// * `path` - The file path to the TOML settings file.
///
/// # Example
///
/// ```no_run
/// let settings = dbdata::config::load_settings("dbdata.toml").expect("Failed to load settings");
/// println!("{:?}", settings);
/// ```
pub fn load_settings<P: AsRef<Path>>(path: P) -> Result<DbDataSettings> {
    let content = fs::read_to_string(path)?;
    DbDataSettings::from_toml_str(&content)
}

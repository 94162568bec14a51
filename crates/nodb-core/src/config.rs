//! Option flags
//!
//! Four boolean options steer how documents are opened and persisted:
//!
//! - `create`: create the backing file if it does not exist
//! - `unsafe`: skip the durability sync when writing
//! - `manual`: do not flush after every mutation
//! - `force`: do things unconditionally (rewrite clean documents, destroy
//!   non-empty ones)
//!
//! Every option is tri-state: unset, true, or false. Unset resolves to
//! false, but only explicitly set options take part in [`Config::merge`].
//!
//! Configuration can be layered from:
//! 1. Default values (everything unset)
//! 2. A TOML table of booleans
//! 3. Environment variables (NODB_* prefix)

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::storage::error::{Error, Result};

/// Environment variable prefix
const ENV_PREFIX: &str = "NODB";

/// Names of the recognized options
pub const OPTIONS: [&str; 4] = ["create", "unsafe", "manual", "force"];

/// A set of option flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    create: Option<bool>,

    #[serde(default, rename = "unsafe", skip_serializing_if = "Option::is_none")]
    unsafe_writes: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    manual: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    force: Option<bool>,
}

impl Config {
    /// Configuration with every option unset
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_create(mut self, value: bool) -> Self {
        self.create = Some(value);
        self
    }

    pub fn with_unsafe(mut self, value: bool) -> Self {
        self.unsafe_writes = Some(value);
        self
    }

    pub fn with_manual(mut self, value: bool) -> Self {
        self.manual = Some(value);
        self
    }

    pub fn with_force(mut self, value: bool) -> Self {
        self.force = Some(value);
        self
    }

    pub fn create(&self) -> bool {
        self.create.unwrap_or(false)
    }

    pub fn is_unsafe(&self) -> bool {
        self.unsafe_writes.unwrap_or(false)
    }

    pub fn manual(&self) -> bool {
        self.manual.unwrap_or(false)
    }

    pub fn force(&self) -> bool {
        self.force.unwrap_or(false)
    }

    /// Fail with `UnknownOption` unless `name` is a recognized option
    pub fn validate(name: &str) -> Result<()> {
        if OPTIONS.contains(&name) {
            Ok(())
        } else {
            Err(Error::UnknownOption {
                name: name.to_string(),
            })
        }
    }

    /// Set an option by name
    pub fn set(&mut self, name: &str, value: bool) -> Result<()> {
        Self::validate(name)?;
        *self.slot(name) = Some(value);
        Ok(())
    }

    /// Build a configuration from `(name, value)` pairs
    ///
    /// The whole call fails if any name is unrecognized.
    pub fn from_pairs<'a, I>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, bool)>,
    {
        let mut config = Self::default();
        for (name, value) in pairs {
            config.set(name, value)?;
        }
        Ok(config)
    }

    /// Overlay `overlay` onto `self`
    ///
    /// Options set in `overlay` win; options it leaves unset are inherited.
    pub fn merge(&self, overlay: &Config) -> Config {
        Config {
            create: overlay.create.or(self.create),
            unsafe_writes: overlay.unsafe_writes.or(self.unsafe_writes),
            manual: overlay.manual.or(self.manual),
            force: overlay.force.or(self.force),
        }
    }

    /// Load configuration from a TOML table of booleans
    pub fn load_from_str(toml_content: &str) -> Result<Self> {
        let table: toml::Table = toml_content.parse()?;
        let mut config = Self::default();
        for (name, value) in &table {
            Self::validate(name)?;
            let flag = value.as_bool().ok_or_else(|| Error::InvalidOptionValue {
                name: name.clone(),
                value: value.to_string(),
            })?;
            config.set(name, flag)?;
        }
        Ok(config)
    }

    /// Load configuration from a file
    ///
    /// If the file doesn't exist, defaults are used. Environment variables
    /// are applied as overrides either way.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .map_err(|e| Error::from_io(e, path.to_path_buf()))?;
            Self::load_from_str(&content)?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides (NODB_CREATE, NODB_UNSAFE, ...)
    pub fn apply_env_overrides(&mut self) {
        for name in OPTIONS {
            let var = format!("{}_{}", ENV_PREFIX, name.to_ascii_uppercase());
            if let Ok(val) = std::env::var(var) {
                *self.slot(name) = Some(val.eq_ignore_ascii_case("true") || val == "1");
            }
        }
    }

    fn slot(&mut self, name: &str) -> &mut Option<bool> {
        match name {
            "create" => &mut self.create,
            "unsafe" => &mut self.unsafe_writes,
            "manual" => &mut self.manual,
            _ => &mut self.force,
        }
    }
}

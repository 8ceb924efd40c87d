//! String-map configuration
//!
//! The engine is configured through a flat key -> string map; outer layers
//! (command line, configuration files, network control) fill it in whatever
//! way they like.  Unknown keys are preserved, they may be hints for the
//! host layer.

use std::collections::BTreeMap;
use std::str::FromStr;

use crate::{ConfigError, ConfigResult};

/// Key -> value configuration map with typed accessors.
#[derive(Debug, Clone, Default)]
pub struct Params {
    map: BTreeMap<String, String>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a parameter; any value that can be displayed is accepted.
    pub fn set(&mut self, key: &str, value: impl ToString) -> &mut Self {
        self.map.insert(key.to_string(), value.to_string());
        self
    }

    /// Builder-style variant of [`set`](Self::set).
    pub fn with(mut self, key: &str, value: impl ToString) -> Self {
        self.set(key, value);
        self
    }

    pub fn contains(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    /// Raw string value, if present.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.map.get(key).map(|s| s.as_str())
    }

    /// Raw string value; missing keys are a configuration error.
    pub fn require_str(&self, key: &str) -> ConfigResult<&str> {
        self.get_str(key)
            .ok_or_else(|| ConfigError::Missing(key.to_string()))
    }

    /// Parsed value, if present.  Unparseable values are an error, absent
    /// keys are `Ok(None)`.
    pub fn get<T: FromStr>(&self, key: &str) -> ConfigResult<Option<T>> {
        match self.map.get(key) {
            None => Ok(None),
            Some(raw) => raw.parse().map(Some).map_err(|_| ConfigError::Invalid {
                key: key.to_string(),
                value: raw.clone(),
            }),
        }
    }

    /// Parsed value with a fallback for absent keys.
    pub fn get_or<T: FromStr>(&self, key: &str, default: T) -> ConfigResult<T> {
        Ok(self.get(key)?.unwrap_or(default))
    }

    /// Parsed value; missing keys are a configuration error.
    pub fn require<T: FromStr>(&self, key: &str) -> ConfigResult<T> {
        self.get(key)?
            .ok_or_else(|| ConfigError::Missing(key.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_access() {
        let params = Params::new()
            .with("block_size", 256)
            .with("sample_rate", 44100)
            .with("name", "soundfield");

        assert_eq!(params.get_or("block_size", 64).unwrap(), 256usize);
        assert_eq!(params.get_or("threads", 1).unwrap(), 1usize);
        assert_eq!(params.require::<u32>("sample_rate").unwrap(), 44100);
        assert_eq!(params.get_str("name"), Some("soundfield"));
    }

    #[test]
    fn test_missing_and_invalid() {
        let params = Params::new().with("threads", "lots");

        assert!(matches!(
            params.require::<u32>("sample_rate"),
            Err(ConfigError::Missing(_))
        ));
        assert!(matches!(
            params.get::<u32>("threads"),
            Err(ConfigError::Invalid { .. })
        ));
    }
}

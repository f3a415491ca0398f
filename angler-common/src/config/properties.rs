//! Flat `key=value` property sources.
//!
//! Two encodings are understood: a properties file (one pair per line, `#`
//! starts a comment) and the inline form used by the `ANGLER_CFG` environment
//! variable (`key=value; key=value`). Values may themselves contain `=`.

use std::{collections::BTreeMap, path::Path};

use crate::error::ConfigError;

/// An ordered map of raw configuration values keyed by their dotted name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    values: BTreeMap<String, String>,
}

impl Properties {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the content of a properties file.
    #[must_use]
    pub fn parse(content: &str) -> Self {
        Self::from_entries(content.lines())
    }

    /// Parse the `;` separated inline form.
    #[must_use]
    pub fn parse_inline(content: &str) -> Self {
        Self::from_entries(content.split(';'))
    }

    /// Read and parse a properties file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] if the file cannot be read.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        std::fs::read_to_string(path)
            .map(|content| Self::parse(&content))
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })
    }

    fn from_entries<'a>(entries: impl Iterator<Item = &'a str>) -> Self {
        let values = entries
            .map(str::trim)
            .filter(|entry| !entry.is_empty() && !entry.starts_with('#'))
            .filter_map(|entry| entry.split_once('='))
            .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
            .filter(|(key, _)| !key.is_empty())
            .collect();

        Self { values }
    }

    /// Fill every key missing from `self` with the value held by `other`.
    ///
    /// Keys already present are never overwritten.
    pub fn merge_missing(&mut self, other: &Self) {
        for (key, value) in &other.values {
            self.values
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

//! Per-object metadata

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const PASSWORD: &str = "password";
pub const LAST_CHANGED: &str = "lastChanged";
pub const EXPIRES: &str = "Expires";
pub const HEADER_PREFIX: &str = "X-";

/// Flat string map attached to a pure id.
///
/// Caller supplied `X-` keys are open ended, so this stays a map with a few
/// reserved keys rather than a fixed record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(BTreeMap<String, String>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build metadata from caller input, dropping engine-owned keys and empty values
    pub fn from_caller<I, K, V>(fields: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let map = fields
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .filter(|(k, v)| k != LAST_CHANGED && !v.is_empty())
            .collect();
        Self(map)
    }

    /// Wrap a raw field map as read back from the backend
    pub fn from_stored(fields: impl IntoIterator<Item = (String, String)>) -> Self {
        Self(fields.into_iter().collect())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Write timestamp in epoch milliseconds
    pub fn last_changed(&self) -> Option<i64> {
        self.get(LAST_CHANGED).and_then(|v| v.parse().ok())
    }

    pub(crate) fn set_last_changed(&mut self, millis: i64) {
        self.insert(LAST_CHANGED, millis.to_string());
    }

    pub fn password(&self) -> Option<&str> {
        self.get(PASSWORD)
    }

    pub fn has_password(&self) -> bool {
        self.password().is_some_and(|p| !p.is_empty())
    }

    pub fn expires(&self) -> Option<&str> {
        self.get(EXPIRES)
    }

    /// `X-` keys with the prefix removed, ready to become response headers
    pub fn header_fields(&self) -> impl Iterator<Item = (&str, &str)> {
        self.iter()
            .filter_map(|(k, v)| k.strip_prefix(HEADER_PREFIX).map(|name| (name, v)))
    }

    /// Whether an object last written at this metadata's timestamp is still
    /// fresh for a caller who cached it at `since`
    pub fn is_unchanged_since(&self, since: i64) -> bool {
        self.last_changed().is_some_and(|changed| changed <= since)
    }

    /// Metadata safe to show callers: the password is replaced by its presence
    pub fn public_view(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut view: serde_json::Map<String, serde_json::Value> = self
            .0
            .iter()
            .filter(|(k, _)| k.as_str() != PASSWORD)
            .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
            .collect();
        view.insert(
            PASSWORD.to_string(),
            serde_json::Value::Bool(self.has_password()),
        );
        view
    }

    pub(crate) fn to_fields(&self) -> Vec<(String, String)> {
        self.0.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }
}

//! Shared fixtures for app integration tests.

use std::collections::HashMap;

/// Builds an environment lookup from fixed key/value pairs.
#[allow(dead_code)]
pub fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let vars: HashMap<String, String> = pairs
        .iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect();
    move |key| vars.get(key).cloned()
}

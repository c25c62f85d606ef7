//! Domain pattern table: exact names, `*.suffix` patterns, and a `*`
//! catch-all. Shared by the dispatcher's domain-to-proxy routing and the
//! registrar's domain whitelist.

use std::collections::HashMap;

/// Maps domain patterns to values. Lookup precedence: exact match, then
/// the longest matching suffix, then the wildcard.
#[derive(Debug, Clone)]
pub struct DomainMap<T> {
    exact: HashMap<String, T>,
    /// `(".suffix", value)`, kept sorted longest-first.
    suffix: Vec<(String, T)>,
    wildcard: Option<T>,
}

impl<T> Default for DomainMap<T> {
    fn default() -> Self {
        Self {
            exact: HashMap::new(),
            suffix: Vec::new(),
            wildcard: None,
        }
    }
}

impl<T> DomainMap<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.suffix.is_empty() && self.wildcard.is_none()
    }

    /// Register a pattern. `*` is the catch-all, `*.example.com` (or
    /// `.example.com`) matches the suffix and the bare domain itself,
    /// anything else matches exactly. Patterns are case-insensitive.
    pub fn insert(&mut self, pattern: &str, value: T) {
        let pattern = pattern.trim().to_ascii_lowercase();
        if pattern == "*" {
            self.wildcard = Some(value);
        } else if let Some(suffix) = pattern.strip_prefix("*.") {
            self.push_suffix(format!(".{suffix}"), value);
        } else if pattern.starts_with('.') {
            self.push_suffix(pattern, value);
        } else {
            self.exact.insert(pattern, value);
        }
    }

    fn push_suffix(&mut self, suffix: String, value: T) {
        self.suffix.retain(|(s, _)| *s != suffix);
        self.suffix.push((suffix, value));
        self.suffix.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
    }

    pub fn lookup(&self, domain: &str) -> Option<&T> {
        let domain = domain.trim_end_matches('.').to_ascii_lowercase();
        if let Some(v) = self.exact.get(&domain) {
            return Some(v);
        }
        for (suffix, v) in &self.suffix {
            // "*.example.com" covers both the subdomains and the apex.
            if domain.ends_with(suffix.as_str()) || domain == suffix[1..] {
                return Some(v);
            }
        }
        self.wildcard.as_ref()
    }
}
